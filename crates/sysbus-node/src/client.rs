//! Demo client: walks the demo service through every call shape.

use crate::service::DELAY_OFFSETS_SECS;
use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use std::time::Duration;
use sysbus_core::{CallEvent, Handle, Message};
use tracing::{info, warn};

/// Response window set on the first `delay` subscription.
pub const DELAY_RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);

/// What the client saw.
#[derive(Debug, Default)]
pub struct DemoReport {
    /// Body of the `test` response.
    pub echo: Value,

    /// Responses to the `delay` subscription without a window.
    pub delayed: Vec<Message>,

    /// Responses and timeout notices on the windowed `delay` subscription.
    pub delayed_with_timeout: Vec<CallEvent>,

    /// Responses to the `die` watch.
    pub farewell: Vec<Message>,
}

impl DemoReport {
    /// Timeout notices on the windowed subscription.
    #[must_use]
    pub fn timeouts(&self) -> usize {
        self.delayed_with_timeout
            .iter()
            .filter(|event| event.is_timeout())
            .count()
    }
}

/// Run the demo sequence against `service`.
///
/// Returns once `die` has answered; the service shuts itself down shortly
/// after.
pub async fn run_client(handle: &Handle, service: &str) -> Result<DemoReport> {
    let mut report = DemoReport::default();

    let mut echo = handle
        .call(&format!("luna://{service}/test"), json!({ "msg": "Rob" }))
        .await
        .context("test call failed")?;
    let reply = echo
        .next_response()
        .await
        .ok_or_else(|| anyhow!("test call ended without a response"))?;
    report.echo = reply.payload().parse_json()?;
    info!(reply = %report.echo, "Echo received");

    let delay_uri = format!("luna://{service}/delay");
    let mut windowed = handle.subscribe(&delay_uri, json!({ "delay": 0 })).await?;
    windowed.set_response_timeout(DELAY_RESPONSE_TIMEOUT)?;
    windowed.add_listener(|event| {
        if event.is_timeout() {
            warn!("No delayed response within the window");
        }
    })?;
    let mut plain = handle.subscribe(&delay_uri, json!({ "delay": 0 })).await?;

    while report.delayed.len() < DELAY_OFFSETS_SECS.len() {
        let response = plain
            .next_response()
            .await
            .ok_or_else(|| anyhow!("delay subscription ended early"))?;
        info!(count = report.delayed.len() + 1, "Delayed response received");
        report.delayed.push(response);
    }
    while let Some(event) = windowed.try_next() {
        report.delayed_with_timeout.push(event);
    }
    windowed.cancel()?;
    plain.cancel()?;

    let mut farewell = handle
        .watch(&format!("luna://{service}/die"), json!({}))
        .await?;
    while let Some(response) = farewell.next_response().await {
        report.farewell.push(response);
    }
    info!(responses = report.farewell.len(), "Service said goodbye");

    Ok(report)
}
