//! Server-side subscriber lists.
//!
//! A service files inbound subscription requests under a key and later fans a
//! payload out to every request under that key. Requests that can no longer be
//! answered (finished, cancelled by the caller) are dropped on the next reply.

use crate::request::Request;
use std::collections::HashMap;
use sysbus_types::{BusError, Payload, Token};
use tracing::debug;

#[derive(Debug, Default)]
pub(crate) struct SubscriptionRegistry {
    lists: HashMap<String, Vec<Request>>,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// File `request` under `key`. Adding the same request twice is a no-op.
    pub(crate) fn add(&mut self, key: String, request: Request) -> Result<(), BusError> {
        if request.is_finished() {
            return Err(BusError::StaleMessageHandle);
        }

        let list = self.lists.entry(key).or_default();
        let present = list
            .iter()
            .any(|r| r.sender() == request.sender() && r.token() == request.token());
        if !present {
            list.push(request);
        }
        Ok(())
    }

    /// Respond with `payload` to every live subscriber under `key`.
    ///
    /// Returns the number of subscribers that were sent the payload.
    pub(crate) fn reply(&mut self, key: &str, payload: &Payload) -> usize {
        let Some(list) = self.lists.get_mut(key) else {
            return 0;
        };

        let mut delivered = 0;
        list.retain(|request| match request.respond(payload.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(e) => {
                debug!(key = %key, token = %request.token(), error = %e, "Dropping subscriber");
                false
            }
        });

        if list.is_empty() {
            self.lists.remove(key);
        }
        delivered
    }

    /// Drop the request `(sender, token)` from every list.
    pub(crate) fn remove_request(&mut self, sender: &str, token: Token) -> usize {
        let mut removed = 0;
        self.lists.retain(|_, list| {
            let before = list.len();
            list.retain(|r| !(r.sender() == sender && r.token() == token));
            removed += before - list.len();
            !list.is_empty()
        });
        removed
    }

    /// Live subscribers under `key`.
    pub(crate) fn count(&self, key: &str) -> usize {
        self.lists
            .get(key)
            .map_or(0, |list| list.iter().filter(|r| !r.is_finished()).count())
    }

    /// Number of keys with at least one subscriber.
    pub(crate) fn key_count(&self) -> usize {
        self.lists.len()
    }

    pub(crate) fn clear(&mut self) {
        self.lists.clear();
    }
}
