//! Demo service methods.
//!
//! | Method  | Behaviour |
//! |---------|-----------|
//! | `test`  | Echoes `msg` once |
//! | `delay` | Responds at `delay`, `delay + 2` and `delay + 10` seconds |
//! | `die`   | Responds twice, then shuts the handle down |
//! | `error` | Responds, then fails |

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use sysbus_core::{BusError, Handle, Payload, Request};
use tracing::info;

/// Offsets, relative to the requested delay, of the `delay` method's responses.
pub const DELAY_OFFSETS_SECS: [u64; 3] = [0, 2, 10];

/// How long `die` waits after responding before it shuts down.
pub const DIE_GRACE: Duration = Duration::from_millis(1);

#[derive(Debug, Deserialize)]
struct EchoParams {
    msg: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DelayParams {
    delay: u64,
}

/// Register the demo methods on `handle`.
pub async fn register_demo_methods(handle: &Handle) -> Result<(), BusError> {
    handle.register_method("", "test", echo).await?;
    handle.register_method("", "delay", delay).await?;

    let dying = handle.clone();
    handle
        .register_method("", "die", move |request| die(&dying, request))
        .await?;

    handle.register_method("", "error", error).await?;

    info!(service = %handle.service_name(), "Demo methods registered");
    Ok(())
}

fn echo(request: Request) -> anyhow::Result<()> {
    let params: EchoParams = request.payload().parse_json()?;
    info!(sender = %request.sender(), msg = %params.msg, "Echo request");
    request.respond(json!({ "msg": format!("echo request: {}", params.msg) }))?;
    Ok(())
}

fn delay(request: Request) -> anyhow::Result<()> {
    let params: DelayParams = request.payload().parse_json()?;
    let reply = Payload::from(json!({ "msg": "delayed response", "params": params }));

    for offset in DELAY_OFFSETS_SECS {
        let responder = request.clone();
        let reply = reply.clone();
        request.schedule(Duration::from_secs(params.delay + offset), move || {
            // The caller may have cancelled in the meantime.
            let _ = responder.respond(reply);
        })?;
    }
    Ok(())
}

fn die(handle: &Handle, request: Request) -> anyhow::Result<()> {
    info!(sender = %request.sender(), "Exit requested");
    request.respond(json!({ "msg": "bye bye" }))?;
    request.respond("bye bye")?;

    let handle_for_exit = handle.clone();
    handle.schedule(DIE_GRACE, move || handle_for_exit.request_shutdown())?;
    Ok(())
}

fn error(request: Request) -> anyhow::Result<()> {
    request.respond("bang")?;
    anyhow::bail!("thingThatDoesntExist is not defined")
}
