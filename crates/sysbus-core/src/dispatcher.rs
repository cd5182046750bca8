//! # Dispatcher
//!
//! One task per handle. It owns the method registry, the call tracker, the
//! timer queue and the subscriber lists, and serialises everything that
//! touches them.
//!
//! Each loop iteration takes, in priority order, the next inbound frame, the
//! next handle command, or the next due timer. After any event every overdue
//! timer fires, so a response that is ready in the same tick as a timeout is
//! delivered first.
//!
//! ## Teardown
//!
//! 1. Stop taking inbound frames
//! 2. Process already-queued commands, so queued responses are sent
//! 3. Flush the transport, bounded by `timeouts.shutdown_drain_ms`
//! 4. Close the transport
//! 5. Drop pending calls (their event streams end)
//! 6. Mark live inbound requests stale
//! 7. Publish `Disconnected`

use crate::config::BusConfig;
use crate::handle::ConnectionState;
use crate::registry::{MethodHandler, MethodRegistry};
use crate::request::{Request, RequestState};
use crate::subscriptions::SubscriptionRegistry;
use crate::timer::{Task, TimerEvent, TimerQueue};
use crate::tracker::{
    CallEvent, CallKind, CallTracker, Listener, PendingCall, Resolution, TimeoutOutcome,
    TrackerStats,
};
use crate::transport::{Connection, InboundStream, Transport};
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;
use sysbus_types::{codes, BusError, Destination, Message, MessageKind, MethodKey, Payload, Token};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

/// Live-request map size that triggers pruning of dead entries.
const MIN_PRUNE_THRESHOLD: usize = 64;

/// Callback for peer cancellations of inbound requests.
pub type CancelListener = Box<dyn FnMut(&Message) + Send>;

/// Work sent from handles, requests and call handles to the dispatcher.
pub(crate) enum Command {
    Register {
        key: MethodKey,
        handler: Arc<dyn MethodHandler>,
        reply: oneshot::Sender<Result<(), BusError>>,
    },
    Unregister {
        key: MethodKey,
        reply: oneshot::Sender<bool>,
    },
    Call {
        destination: Destination,
        payload: Payload,
        kind: CallKind,
        events: mpsc::UnboundedSender<CallEvent>,
        reply: oneshot::Sender<Result<Token, BusError>>,
    },
    AddListener {
        token: Token,
        listener: Listener,
    },
    SetTimeout {
        token: Token,
        window: Duration,
    },
    Cancel {
        token: Token,
    },
    Send {
        message: Message,
    },
    Schedule {
        delay: Duration,
        task: Task,
    },
    SubscriptionAdd {
        key: String,
        request: Request,
    },
    SubscriptionReply {
        key: String,
        payload: Payload,
        reply: oneshot::Sender<usize>,
    },
    SubscriberCount {
        key: String,
        reply: oneshot::Sender<usize>,
    },
    OnCancel {
        listener: CancelListener,
    },
    Stats {
        reply: oneshot::Sender<BusStats>,
    },
    Shutdown,
}

/// Snapshot of a handle's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub service_name: String,
    /// Registered methods.
    pub methods_registered: usize,
    /// Outbound calls awaiting responses.
    pub pending_calls: usize,
    /// Inbound requests that can still be answered.
    pub live_requests: usize,
    /// Subscription keys with at least one subscriber.
    pub subscription_keys: usize,
    /// Queued timer entries. At most one live entry per windowed call, plus
    /// entries superseded by `set_response_timeout` until their deadline.
    pub timers: usize,
    /// Requests dispatched to a handler.
    pub requests_handled: u64,
    /// Requests for unregistered methods.
    pub methods_not_found: u64,
    /// Handler errors and panics.
    pub handler_failures: u64,
    /// Undecodable or misrouted frames.
    pub frames_dropped: u64,
    /// Outbound call counters.
    pub calls: TrackerStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Requested,
    TransportClosed,
}

pub(crate) struct Dispatcher {
    service_name: String,
    config: BusConfig,
    transport: Arc<dyn Transport>,
    inbound: InboundStream,
    commands: mpsc::UnboundedReceiver<Command>,
    command_tx: mpsc::UnboundedSender<Command>,
    state: watch::Sender<ConnectionState>,
    registry: MethodRegistry,
    tracker: CallTracker,
    timers: TimerQueue,
    subscriptions: SubscriptionRegistry,
    live_requests: HashMap<(String, Token), Weak<RequestState>>,
    prune_threshold: usize,
    cancel_listeners: Vec<CancelListener>,
    closing: bool,
    requests_handled: u64,
    methods_not_found: u64,
    handler_failures: u64,
    frames_dropped: u64,
}

impl Dispatcher {
    pub(crate) fn new(
        config: BusConfig,
        connection: Connection,
        command_tx: mpsc::UnboundedSender<Command>,
        commands: mpsc::UnboundedReceiver<Command>,
        state: watch::Sender<ConnectionState>,
    ) -> Self {
        Self {
            service_name: config.service_name.clone(),
            config,
            transport: connection.transport,
            inbound: connection.inbound,
            commands,
            command_tx,
            state,
            registry: MethodRegistry::new(),
            tracker: CallTracker::new(),
            timers: TimerQueue::new(),
            subscriptions: SubscriptionRegistry::new(),
            live_requests: HashMap::new(),
            prune_threshold: MIN_PRUNE_THRESHOLD,
            cancel_listeners: Vec::new(),
            closing: false,
            requests_handled: 0,
            methods_not_found: 0,
            handler_failures: 0,
            frames_dropped: 0,
        }
    }

    /// Run until shutdown is requested or the inbound stream ends.
    pub(crate) async fn run(mut self) {
        info!(service = %self.service_name, "Handle connected");

        let reason = loop {
            let next_timer = self.timers.next_deadline();
            tokio::select! {
                biased;

                frame = self.inbound.next() => match frame {
                    Some(Ok(message)) => self.on_frame(message),
                    Some(Err(e)) => {
                        self.frames_dropped += 1;
                        warn!(service = %self.service_name, error = %e, "Dropping undecodable frame");
                    }
                    None => break StopReason::TransportClosed,
                },

                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break StopReason::Requested,
                    Some(command) => self.on_command(command),
                },

                () = wait_until(next_timer) => {}
            }

            self.fire_due_timers();
        };

        self.teardown(reason).await;
    }

    fn on_frame(&mut self, message: Message) {
        if message.destination() != self.service_name {
            self.frames_dropped += 1;
            warn!(
                service = %self.service_name,
                destination = %message.destination(),
                sender = %message.sender(),
                "Dropping misrouted message"
            );
            return;
        }

        match message.kind() {
            MessageKind::Request => self.on_request(message),
            MessageKind::Response => self.on_response(&message),
            MessageKind::Cancel => self.on_cancel(&message),
        }
    }

    fn on_request(&mut self, message: Message) {
        let key = message.method_key();
        debug!(
            service = %self.service_name,
            sender = %message.sender(),
            token = %message.token(),
            method = %key,
            "Request received"
        );

        let handler = match self.registry.lookup(&key) {
            Ok(handler) => handler,
            Err(e) => {
                self.methods_not_found += 1;
                warn!(
                    service = %self.service_name,
                    sender = %message.sender(),
                    method = %key,
                    "Request for unknown method"
                );
                let reply = Message::error_response(&message, codes::METHOD_NOT_FOUND, e.to_string());
                self.send(&reply);
                return;
            }
        };

        let request = Request::new(
            message,
            self.command_tx.clone(),
            self.config.limits.max_payload_bytes,
        );
        self.track_request(&request);
        self.requests_handled += 1;

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(request.clone())));
        let failure = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => {
                let text = format!("{e:#}");
                error!(
                    service = %self.service_name,
                    method = %key,
                    token = %request.token(),
                    error = %text,
                    "Handler failed"
                );
                text
            }
            Err(panic) => {
                let text = panic_message(panic.as_ref());
                error!(
                    service = %self.service_name,
                    method = %key,
                    token = %request.token(),
                    panic = %text,
                    "Handler panicked"
                );
                text
            }
        };

        self.handler_failures += 1;
        request.fail(codes::INTERNAL_ERROR, &failure);
    }

    fn on_response(&mut self, message: &Message) {
        // Unknown tokens are logged and counted by the tracker.
        match self.tracker.resolve(message, Instant::now()) {
            Ok(Resolution::Delivered) => {}
            Ok(Resolution::Completed { call, cancel_peer }) => {
                if cancel_peer {
                    self.send_cancel(&call);
                }
            }
            Err(_) => {}
        }
    }

    fn on_cancel(&mut self, message: &Message) {
        let key = (message.sender().to_string(), message.token());
        let request = self
            .live_requests
            .remove(&key)
            .and_then(|weak| Request::upgrade(&weak));
        if let Some(request) = &request {
            request.mark_cancelled();
        }
        let unsubscribed = self
            .subscriptions
            .remove_request(message.sender(), message.token());

        debug!(
            service = %self.service_name,
            sender = %message.sender(),
            token = %message.token(),
            known = request.is_some(),
            unsubscribed,
            "Request cancelled by caller"
        );

        for listener in &mut self.cancel_listeners {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(message))).is_err() {
                error!(service = %self.service_name, "Cancel listener panicked");
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Register {
                key,
                handler,
                reply,
            } => {
                let result = self.registry.register(key.clone(), handler);
                match &result {
                    Ok(()) => info!(service = %self.service_name, method = %key, "Method registered"),
                    Err(e) => warn!(service = %self.service_name, error = %e, "Registration rejected"),
                }
                let _ = reply.send(result);
            }
            Command::Unregister { key, reply } => {
                let removed = self.registry.unregister(&key);
                if removed {
                    info!(service = %self.service_name, method = %key, "Method unregistered");
                }
                let _ = reply.send(removed);
            }
            Command::Call {
                destination,
                payload,
                kind,
                events,
                reply,
            } => {
                let _ = reply.send(self.start_call(destination, payload, kind, events));
            }
            Command::AddListener { token, listener } => {
                if let Err(e) = self.tracker.add_listener(token, listener) {
                    debug!(token = %token, error = %e, "Listener not attached");
                }
            }
            Command::SetTimeout { token, window } => {
                match self.tracker.arm_timeout(token, window, Instant::now()) {
                    Some((deadline, generation)) => self.schedule_timeout(token, deadline, generation),
                    None => debug!(token = %token, "Timeout for finished call ignored"),
                }
            }
            Command::Cancel { token } => match self.tracker.cancel(token) {
                Some(call) => self.send_cancel(&call),
                None => debug!(token = %token, "Cancel for unknown call ignored"),
            },
            Command::Send { message } => self.send_response(&message),
            Command::Schedule { delay, task } => {
                if self.closing {
                    debug!(service = %self.service_name, "Dropping task scheduled during shutdown");
                } else {
                    self.timers
                        .schedule(Instant::now() + delay, TimerEvent::Task(task));
                }
            }
            Command::SubscriptionAdd { key, request } => {
                let token = request.token();
                if let Err(e) = self.subscriptions.add(key.clone(), request) {
                    debug!(key = %key, token = %token, error = %e, "Subscriber not added");
                }
            }
            Command::SubscriptionReply {
                key,
                payload,
                reply,
            } => {
                let delivered = self.subscriptions.reply(&key, &payload);
                debug!(key = %key, delivered, "Subscription reply sent");
                let _ = reply.send(delivered);
            }
            Command::SubscriberCount { key, reply } => {
                let _ = reply.send(self.subscriptions.count(&key));
            }
            Command::OnCancel { listener } => self.cancel_listeners.push(listener),
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            // Handled by the run loop; a second request during teardown is a no-op.
            Command::Shutdown => {}
        }
    }

    fn start_call(
        &mut self,
        destination: Destination,
        payload: Payload,
        kind: CallKind,
        events: mpsc::UnboundedSender<CallEvent>,
    ) -> Result<Token, BusError> {
        if self.closing {
            return Err(BusError::Disconnected);
        }
        let limit = self.config.limits.max_pending_calls;
        if self.tracker.pending_count() >= limit {
            warn!(service = %self.service_name, limit, "Too many pending calls");
            return Err(BusError::TooManyPendingCalls { limit });
        }

        let token = self.tracker.allocate(destination.clone(), kind);
        let listener: Listener = Box::new(move |event: &CallEvent| {
            // The call handle may have been dropped; that is not an error.
            let _ = events.send(event.clone());
        });
        self.tracker.add_listener(token, listener)?;

        let message = Message::request(
            &self.service_name,
            &destination,
            token,
            payload,
            kind.is_subscription(),
        );
        if let Err(e) = self.transport.send(destination.service(), &message) {
            self.tracker.discard(token);
            warn!(
                service = %self.service_name,
                destination = %destination,
                error = %e,
                "Call not sent"
            );
            return Err(e);
        }

        debug!(
            service = %self.service_name,
            token = %token,
            destination = %destination,
            kind = ?kind,
            "Call sent"
        );

        if kind == CallKind::Call {
            if let Some(window) = self.config.timeouts.default_call_timeout() {
                if let Some((deadline, generation)) =
                    self.tracker.arm_timeout(token, window, Instant::now())
                {
                    self.schedule_timeout(token, deadline, generation);
                }
            }
        }

        Ok(token)
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        while let Some(event) = self.timers.pop_due(now) {
            match event {
                TimerEvent::CallTimeout { token, generation } => {
                    match self.tracker.on_timeout(token, generation, now) {
                        TimeoutOutcome::Stale => {}
                        TimeoutOutcome::Expired(call) => self.send_cancel(&call),
                        TimeoutOutcome::Rearmed {
                            deadline,
                            generation,
                        }
                        | TimeoutOutcome::Deferred {
                            deadline,
                            generation,
                        } => self.schedule_timeout(token, deadline, generation),
                    }
                }
                TimerEvent::Task(task) => {
                    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                        error!(service = %self.service_name, "Scheduled task panicked");
                    }
                }
            }
        }
    }

    fn schedule_timeout(&mut self, token: Token, deadline: Instant, generation: u64) {
        self.timers
            .schedule(deadline, TimerEvent::CallTimeout { token, generation });
    }

    fn track_request(&mut self, request: &Request) {
        if self.live_requests.len() >= self.prune_threshold {
            self.live_requests
                .retain(|_, weak| Request::upgrade(weak).is_some_and(|r| !r.is_finished()));
            self.prune_threshold = (self.live_requests.len() * 2).max(MIN_PRUNE_THRESHOLD);
        }
        self.live_requests.insert(
            (request.sender().to_string(), request.token()),
            request.downgrade(),
        );
    }

    fn send(&self, message: &Message) {
        if let Err(e) = self.transport.send(message.destination(), message) {
            warn!(
                service = %self.service_name,
                destination = %message.destination(),
                token = %message.token(),
                kind = %message.kind(),
                error = %e,
                "Failed to send message"
            );
        }
    }

    /// Send a response; a caller that can no longer be reached is treated
    /// as having cancelled.
    fn send_response(&mut self, message: &Message) {
        let Err(e) = self.transport.send(message.destination(), message) else {
            return;
        };
        warn!(
            service = %self.service_name,
            destination = %message.destination(),
            token = %message.token(),
            error = %e,
            "Failed to send response"
        );
        if !matches!(e, BusError::TransportUnavailable { .. }) {
            return;
        }

        let key = (message.destination().to_string(), message.token());
        if let Some(request) = self
            .live_requests
            .remove(&key)
            .and_then(|weak| Request::upgrade(&weak))
        {
            request.mark_stale();
        }
        self.subscriptions
            .remove_request(message.destination(), message.token());
    }

    fn send_cancel(&self, call: &PendingCall) {
        let message = Message::cancel(&self.service_name, call.destination(), call.token());
        if let Err(e) = self.transport.send(call.destination().service(), &message) {
            debug!(
                service = %self.service_name,
                token = %call.token(),
                error = %e,
                "Cancel not delivered"
            );
        }
    }

    fn stats(&self) -> BusStats {
        let live_requests = self
            .live_requests
            .values()
            .filter_map(Request::upgrade)
            .filter(|r| !r.is_finished())
            .count();

        BusStats {
            service_name: self.service_name.clone(),
            methods_registered: self.registry.len(),
            pending_calls: self.tracker.pending_count(),
            live_requests,
            subscription_keys: self.subscriptions.key_count(),
            timers: self.timers.len(),
            requests_handled: self.requests_handled,
            methods_not_found: self.methods_not_found,
            handler_failures: self.handler_failures,
            frames_dropped: self.frames_dropped,
            calls: self.tracker.stats(),
        }
    }

    fn drain_commands(&mut self) -> usize {
        let mut drained = 0;
        while let Ok(command) = self.commands.try_recv() {
            self.on_command(command);
            drained += 1;
        }
        drained
    }

    async fn teardown(mut self, reason: StopReason) {
        self.closing = true;
        match reason {
            StopReason::Requested => info!(service = %self.service_name, "Shutting down"),
            StopReason::TransportClosed => {
                warn!(service = %self.service_name, "Transport closed, shutting down")
            }
        }

        // Inbound is no longer polled. Responses already queued still go out;
        // anything sent after the close fails at the sender.
        let mut drained = self.drain_commands();
        self.commands.close();
        drained += self.drain_commands();
        debug!(service = %self.service_name, commands = drained, "Command queue drained");

        let drain = self.config.timeouts.shutdown_drain();
        match tokio::time::timeout(drain, self.transport.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(service = %self.service_name, error = %e, "Transport flush failed"),
            Err(_) => warn!(
                service = %self.service_name,
                drain_ms = drain.as_millis() as u64,
                "Transport flush timed out"
            ),
        }
        self.transport.close().await;

        let dropped = self.tracker.drain();
        if !dropped.is_empty() {
            debug!(service = %self.service_name, calls = dropped.len(), "Dropped pending calls");
        }
        drop(dropped);

        for request in self.live_requests.values().filter_map(Request::upgrade) {
            request.mark_stale();
        }
        self.live_requests.clear();
        self.subscriptions.clear();
        self.timers.clear();
        self.cancel_listeners.clear();

        self.state.send_replace(ConnectionState::Disconnected);
        info!(service = %self.service_name, "Handle disconnected");
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "handler panicked".to_string()
    }
}
