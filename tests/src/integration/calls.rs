//! # Call Paths
//!
//! Token bookkeeping seen from outside: late and duplicate responses, watch
//! limits, cancellation and failure reporting.

#[cfg(test)]
mod tests {
    use crate::integration::fixtures::{echo_service, spawn, RawPeer, CLIENT, PEER};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use sysbus_core::{
        codes, BusConfig, BusError, Destination, Handle, LocalBus, Message, MessageKind, Payload,
    };
    use tokio::time::timeout;

    // =========================================================================
    // UNKNOWN TOKENS
    // =========================================================================

    #[tokio::test]
    async fn test_response_after_cancel_reaches_no_listener() {
        let bus = LocalBus::new();
        let mut peer = RawPeer::connect(&bus, PEER).unwrap();
        let client = spawn(&bus, CLIENT).unwrap();

        let mut call = client.call("luna://com.example.peer/slow", "{}").await.unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        call.add_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let request = peer.expect().await.unwrap();
        assert_eq!(request.kind(), MessageKind::Request);
        assert_eq!(request.token(), call.token());

        call.cancel().unwrap();
        let cancel = peer.expect().await.unwrap();
        assert_eq!(cancel.kind(), MessageKind::Cancel);
        assert_eq!(cancel.token(), call.token());

        peer.respond(&request, "too late", true).unwrap();

        // Inbound frames are handled before queued commands
        let stats = client.stats().await.unwrap();
        assert_eq!(stats.calls.unknown_tokens, 1);
        assert_eq!(stats.calls.responses_delivered, 0);
        assert_eq!(stats.calls.cancelled, 1);
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert!(call.next().await.is_none());
    }

    #[tokio::test]
    async fn test_second_response_to_call_is_dropped() {
        let bus = LocalBus::new();
        let mut peer = RawPeer::connect(&bus, PEER).unwrap();
        let client = spawn(&bus, CLIENT).unwrap();

        let mut call = client.call("luna://com.example.peer/twice", "{}").await.unwrap();
        let request = peer.expect().await.unwrap();
        peer.respond(&request, "one", false).unwrap();
        peer.respond(&request, "two", false).unwrap();

        let reply = call.next_response().await.unwrap();
        assert_eq!(reply.payload().as_str(), Some("one"));
        assert!(call.next().await.is_none());

        let stats = client.stats().await.unwrap();
        assert_eq!(stats.calls.responses_delivered, 1);
        assert_eq!(stats.calls.unknown_tokens, 1);
    }

    #[tokio::test]
    async fn test_response_from_other_service_is_dropped() {
        let bus = LocalBus::new();
        let mut peer = RawPeer::connect(&bus, PEER).unwrap();
        let impostor = RawPeer::connect(&bus, "com.example.impostor").unwrap();
        let client = spawn(&bus, CLIENT).unwrap();

        let mut call = client.call("luna://com.example.peer/x", "{}").await.unwrap();
        let request = peer.expect().await.unwrap();

        // Same token, but answered as if the impostor had been called
        let forged = Message::request(
            request.sender(),
            &Destination::parse("luna://com.example.impostor/x").unwrap(),
            request.token(),
            Payload::empty(),
            false,
        );
        impostor.respond(&forged, "forged", true).unwrap();
        assert_eq!(client.stats().await.unwrap().calls.unknown_tokens, 1);

        peer.respond(&request, "genuine", true).unwrap();
        let reply = call.next_response().await.unwrap();
        assert_eq!(reply.payload().as_str(), Some("genuine"));
        assert_eq!(reply.sender(), PEER);
    }

    // =========================================================================
    // WATCH
    // =========================================================================

    #[tokio::test]
    async fn test_watch_completes_after_two_responses_and_cancels_peer() {
        let bus = LocalBus::new();
        let mut peer = RawPeer::connect(&bus, PEER).unwrap();
        let client = spawn(&bus, CLIENT).unwrap();

        let mut watch = client.watch("luna://com.example.peer/w", "{}").await.unwrap();
        let request = peer.expect().await.unwrap();
        // Watches are flagged so services file them like subscriptions
        assert!(request.is_subscription());

        peer.respond(&request, "initial", false).unwrap();
        peer.respond(&request, "changed", false).unwrap();

        assert_eq!(watch.next_response().await.unwrap().payload().as_str(), Some("initial"));
        assert_eq!(watch.next_response().await.unwrap().payload().as_str(), Some("changed"));
        assert!(watch.next().await.is_none());

        let cancel = peer.expect().await.unwrap();
        assert_eq!(cancel.kind(), MessageKind::Cancel);
        assert_eq!(cancel.token(), request.token());
    }

    #[tokio::test]
    async fn test_watch_ends_early_on_last_response() {
        let bus = LocalBus::new();
        let mut peer = RawPeer::connect(&bus, PEER).unwrap();
        let client = spawn(&bus, CLIENT).unwrap();

        let mut watch = client.watch("luna://com.example.peer/w", "{}").await.unwrap();
        let request = peer.expect().await.unwrap();
        peer.respond(&request, "done", true).unwrap();

        assert_eq!(watch.next_response().await.unwrap().payload().as_str(), Some("done"));
        assert!(watch.next().await.is_none());

        // A terminal response needs no cancel
        let nothing = timeout(Duration::from_millis(50), peer.recv()).await;
        assert!(nothing.is_err());
    }

    // =========================================================================
    // FAILURES
    // =========================================================================

    #[tokio::test]
    async fn test_unknown_method_reported_to_caller() {
        let bus = LocalBus::new();
        let service = echo_service(&bus).await.unwrap();
        let client = spawn(&bus, CLIENT).unwrap();

        let mut call = client.call("luna://com.example.echo/missing", "{}").await.unwrap();
        let reply = call.next_response().await.unwrap();
        let error = reply.remote_error().unwrap();
        assert!(!error.return_value);
        assert_eq!(error.error_code, codes::METHOD_NOT_FOUND);
        assert_eq!(reply.category(), sysbus_core::ERROR_CATEGORY);

        assert_eq!(service.stats().await.unwrap().methods_not_found, 1);
    }

    #[tokio::test]
    async fn test_handler_panic_isolated() {
        let bus = LocalBus::new();
        let service = echo_service(&bus).await.unwrap();
        let client = spawn(&bus, CLIENT).unwrap();

        let mut boom = client.call("luna://com.example.echo/boom", "{}").await.unwrap();
        let error = boom.next_response().await.unwrap().remote_error().unwrap();
        assert_eq!(error.error_code, codes::INTERNAL_ERROR);
        assert!(error.error_text.contains("boom handler exploded"));

        // The service keeps serving
        let mut echo = client
            .call("luna://com.example.echo/test", json!({ "msg": "still here" }))
            .await
            .unwrap();
        let body: serde_json::Value = echo
            .next_response()
            .await
            .unwrap()
            .payload()
            .parse_json()
            .unwrap();
        assert_eq!(body["msg"], "echo request: still here");

        let stats = service.stats().await.unwrap();
        assert_eq!(stats.handler_failures, 1);
        assert_eq!(stats.requests_handled, 2);
    }

    #[tokio::test]
    async fn test_unreachable_destination() {
        let bus = LocalBus::new();
        let client = spawn(&bus, CLIENT).unwrap();

        let err = client.call("luna://com.example.nobody/x", "{}").await.unwrap_err();
        assert!(matches!(err, BusError::TransportUnavailable { .. }));
        assert_eq!(client.stats().await.unwrap().pending_calls, 0);
    }

    #[tokio::test]
    async fn test_outbound_patterns() {
        let bus = LocalBus::new();
        let _service = echo_service(&bus).await.unwrap();
        let _peer = RawPeer::connect(&bus, "org.other.peer").unwrap();

        let mut config = BusConfig::new(CLIENT);
        config.permissions.outbound = vec!["com.example.*".into()];
        let client = Handle::spawn(config, bus.connect(CLIENT).unwrap()).unwrap();

        assert!(client
            .call("luna://com.example.echo/test", json!({ "msg": "ok" }))
            .await
            .is_ok());

        let err = client.call("luna://org.other.peer/x", "{}").await.unwrap_err();
        assert!(matches!(err, BusError::PermissionDenied { .. }));

        // Prefixes match whole dotted segments only
        let err = client.call("luna://com.examples/x", "{}").await.unwrap_err();
        assert!(matches!(err, BusError::PermissionDenied { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_fires_once() {
        let bus = LocalBus::new();
        let _peer = RawPeer::connect(&bus, PEER).unwrap();
        let client = spawn(&bus, CLIENT).unwrap();

        let start = tokio::time::Instant::now();
        let mut call = client.call("luna://com.example.peer/silent", "{}").await.unwrap();
        call.set_response_timeout(Duration::from_millis(3000)).unwrap();

        let event = call.next().await.unwrap();
        assert!(event.is_timeout());
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(3000));
        assert!(elapsed < Duration::from_millis(3100));

        assert!(call.next().await.is_none());
        assert_eq!(client.stats().await.unwrap().calls.timeouts, 1);
    }
}
