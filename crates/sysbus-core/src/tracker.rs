//! # Call Tracker
//!
//! Bookkeeping for outbound calls, keyed by token.
//!
//! Flow:
//! 1. `allocate()` hands out a fresh token for a new call
//! 2. The dispatcher sends the request and attaches listeners
//! 3. Inbound responses go through `resolve()`, which delivers them to every
//!    listener in registration order and completes the call when its response
//!    limit is reached or the response is terminal
//! 4. `arm_timeout()` / `on_timeout()` implement response windows
//! 5. `cancel()` and `drain()` remove calls early
//!
//! The tracker is plain data owned by one dispatcher, so it needs no locking.
//! Time is passed in by the caller.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;
use sysbus_types::{BusError, Destination, Message, Token};
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Event delivered to call listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    /// A response arrived.
    Response(Message),
    /// The response window elapsed without a response.
    TimedOut {
        /// Token of the call.
        token: Token,
    },
}

impl CallEvent {
    /// The response message, if this is a response.
    #[must_use]
    pub fn response(&self) -> Option<&Message> {
        match self {
            CallEvent::Response(message) => Some(message),
            CallEvent::TimedOut { .. } => None,
        }
    }

    /// Whether this is a timeout notification.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, CallEvent::TimedOut { .. })
    }
}

/// Callback attached to a pending call.
pub type Listener = Box<dyn FnMut(&CallEvent) + Send>;

/// How many responses a call expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CallKind {
    /// Exactly one response.
    Call,
    /// At most two responses.
    Watch,
    /// Any number of responses until cancelled.
    Subscribe,
}

impl CallKind {
    /// Response count after which the call completes, if bounded.
    #[must_use]
    pub fn response_limit(self) -> Option<u32> {
        match self {
            CallKind::Call => Some(1),
            CallKind::Watch => Some(2),
            CallKind::Subscribe => None,
        }
    }

    /// Whether the request is flagged as a subscription on the wire.
    #[must_use]
    pub fn is_subscription(self) -> bool {
        !matches!(self, CallKind::Call)
    }
}

/// Lifecycle of a pending call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallState {
    /// Waiting for responses.
    Active,
    /// Response window elapsed.
    TimedOut,
    /// Response limit reached or terminal response received.
    Completed,
    /// Cancelled locally or torn down.
    Cancelled,
}

/// One outstanding outbound call.
pub struct PendingCall {
    token: Token,
    destination: Destination,
    kind: CallKind,
    listeners: Vec<Listener>,
    response_count: u32,
    window: Option<Duration>,
    deadline: Option<Instant>,
    generation: u64,
    state: CallState,
}

impl PendingCall {
    fn new(token: Token, destination: Destination, kind: CallKind) -> Self {
        Self {
            token,
            destination,
            kind,
            listeners: Vec::new(),
            response_count: 0,
            window: None,
            deadline: None,
            generation: 0,
            state: CallState::Active,
        }
    }

    #[must_use]
    pub fn token(&self) -> Token {
        self.token
    }

    #[must_use]
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    #[must_use]
    pub fn kind(&self) -> CallKind {
        self.kind
    }

    #[must_use]
    pub fn state(&self) -> CallState {
        self.state
    }

    /// Responses delivered so far.
    #[must_use]
    pub fn response_count(&self) -> u32 {
        self.response_count
    }

    /// Current timeout deadline, if a window is armed.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn deliver(&mut self, event: &CallEvent) {
        for listener in &mut self.listeners {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                error!(token = %self.token, "Call listener panicked");
            }
        }
    }

    fn rearm(&mut self, window: Duration, now: Instant) -> (Instant, u64) {
        let deadline = now + window;
        self.window = Some(window);
        self.deadline = Some(deadline);
        self.generation += 1;
        (deadline, self.generation)
    }

    /// Push the deadline out without a new timer entry. The entry already
    /// queued for this generation fires early and is deferred on arrival.
    fn extend(&mut self, window: Duration, now: Instant) {
        self.deadline = Some(now + window);
    }
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("token", &self.token)
            .field("destination", &self.destination)
            .field("kind", &self.kind)
            .field("listeners", &self.listeners.len())
            .field("response_count", &self.response_count)
            .field("deadline", &self.deadline)
            .field("state", &self.state)
            .finish()
    }
}

/// Result of routing a response.
#[derive(Debug)]
pub enum Resolution {
    /// Delivered; the call stays active.
    Delivered,
    /// Delivered and the call is finished.
    Completed {
        call: PendingCall,
        /// The peer should be told to stop sending.
        cancel_peer: bool,
    },
}

/// Result of a fired timer.
#[derive(Debug)]
pub enum TimeoutOutcome {
    /// Superseded timer or call already gone.
    Stale,
    /// A response pushed the deadline out; schedule the same generation again.
    Deferred { deadline: Instant, generation: u64 },
    /// Call/watch timed out and was removed.
    Expired(PendingCall),
    /// Subscription notified; next window starts.
    Rearmed { deadline: Instant, generation: u64 },
}

/// Tracker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrackerStats {
    /// Calls allocated.
    pub calls_started: u64,
    /// Responses delivered to listeners.
    pub responses_delivered: u64,
    /// Responses discarded for lack of a pending call.
    pub unknown_tokens: u64,
    /// Timeout notifications delivered.
    pub timeouts: u64,
    /// Calls finished by response.
    pub completed: u64,
    /// Calls cancelled locally.
    pub cancelled: u64,
}

/// Outstanding outbound calls for one handle.
#[derive(Debug)]
pub struct CallTracker {
    calls: HashMap<Token, PendingCall>,
    next_token: u64,
    stats: TrackerStats,
}

impl Default for CallTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CallTracker {
    /// Create an empty tracker. The first token is 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            calls: HashMap::new(),
            next_token: 1,
            stats: TrackerStats::default(),
        }
    }

    /// Start tracking a call and return its token. Tokens are never reused.
    pub fn allocate(&mut self, destination: Destination, kind: CallKind) -> Token {
        let token = Token::new(self.next_token);
        self.next_token += 1;

        debug!(token = %token, destination = %destination, kind = ?kind, "Allocated call");

        self.calls
            .insert(token, PendingCall::new(token, destination, kind));
        self.stats.calls_started += 1;
        token
    }

    /// Append a listener to an active call.
    pub fn add_listener(&mut self, token: Token, listener: Listener) -> Result<(), BusError> {
        let call = self
            .calls
            .get_mut(&token)
            .ok_or(BusError::UnknownToken(token))?;
        call.listeners.push(listener);
        Ok(())
    }

    /// Deliver a response to the call it answers.
    ///
    /// Responses for unknown tokens, or from a service other than the one
    /// called, fail with `UnknownToken` and reach no listener.
    pub fn resolve(&mut self, response: &Message, now: Instant) -> Result<Resolution, BusError> {
        let token = response.token();
        let call = match self.calls.get_mut(&token) {
            Some(call) if call.destination.service() == response.sender() => call,
            _ => {
                self.stats.unknown_tokens += 1;
                warn!(
                    token = %token,
                    sender = %response.sender(),
                    "Response for unknown or finished call"
                );
                return Err(BusError::UnknownToken(token));
            }
        };

        call.response_count += 1;
        call.deliver(&CallEvent::Response(response.clone()));
        self.stats.responses_delivered += 1;

        let limit_reached = call
            .kind
            .response_limit()
            .is_some_and(|limit| call.response_count >= limit);
        let terminal = response.is_terminal();

        if !(terminal || limit_reached) {
            if let Some(window) = call.window {
                call.extend(window, now);
            }
            return Ok(Resolution::Delivered);
        }

        let Some(mut call) = self.calls.remove(&token) else {
            return Err(BusError::UnknownToken(token));
        };
        call.state = CallState::Completed;
        self.stats.completed += 1;

        debug!(
            token = %token,
            responses = call.response_count,
            terminal,
            "Call completed"
        );

        let cancel_peer = call.kind == CallKind::Watch && !terminal;
        Ok(Resolution::Completed { call, cancel_peer })
    }

    /// Stop tracking a call. Returns it so the peer can be notified.
    pub fn cancel(&mut self, token: Token) -> Option<PendingCall> {
        let mut call = self.calls.remove(&token)?;
        call.state = CallState::Cancelled;
        self.stats.cancelled += 1;
        debug!(token = %token, "Call cancelled");
        Some(call)
    }

    /// Forget a call whose request never left this process.
    pub(crate) fn discard(&mut self, token: Token) -> Option<PendingCall> {
        self.calls.remove(&token)
    }

    /// Start a response window of `window` from `now`.
    ///
    /// Returns the deadline and generation to schedule, or None if the call is
    /// not active. Any previously armed timer is superseded.
    pub fn arm_timeout(
        &mut self,
        token: Token,
        window: Duration,
        now: Instant,
    ) -> Option<(Instant, u64)> {
        let call = self.calls.get_mut(&token)?;
        Some(call.rearm(window, now))
    }

    /// Handle a fired timer.
    pub fn on_timeout(&mut self, token: Token, generation: u64, now: Instant) -> TimeoutOutcome {
        let Some(call) = self.calls.get_mut(&token) else {
            return TimeoutOutcome::Stale;
        };
        if call.generation != generation {
            return TimeoutOutcome::Stale;
        }
        match call.deadline {
            None => return TimeoutOutcome::Stale,
            Some(deadline) if deadline > now => {
                return TimeoutOutcome::Deferred {
                    deadline,
                    generation,
                }
            }
            Some(_) => {}
        }

        self.stats.timeouts += 1;
        warn!(
            token = %token,
            destination = %call.destination,
            responses = call.response_count,
            "Call timed out"
        );
        call.deliver(&CallEvent::TimedOut { token });

        if call.kind == CallKind::Subscribe {
            if let Some(window) = call.window {
                let (deadline, generation) = call.rearm(window, now);
                return TimeoutOutcome::Rearmed {
                    deadline,
                    generation,
                };
            }
        }

        match self.calls.remove(&token) {
            Some(mut call) => {
                call.state = CallState::TimedOut;
                TimeoutOutcome::Expired(call)
            }
            None => TimeoutOutcome::Stale,
        }
    }

    /// Remove every pending call.
    pub fn drain(&mut self) -> Vec<PendingCall> {
        self.calls
            .drain()
            .map(|(_, mut call)| {
                call.state = CallState::Cancelled;
                call
            })
            .collect()
    }

    #[must_use]
    pub fn get(&self, token: Token) -> Option<&PendingCall> {
        self.calls.get(&token)
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.calls.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    #[must_use]
    pub fn stats(&self) -> TrackerStats {
        self.stats
    }
}
