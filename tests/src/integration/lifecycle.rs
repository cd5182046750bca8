//! # Lifecycle
//!
//! Graceful shutdown and abrupt transport loss.

#[cfg(test)]
mod tests {
    use crate::integration::fixtures::{echo_service, spawn, RawPeer, CLIENT, ECHO_SERVICE, PEER};
    use serde_json::json;
    use std::time::Duration;
    use sysbus_core::{BusConfig, BusError, ConfigError, ConnectionState, Handle, LocalBus};
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_abrupt_disconnect_tears_down_handle() {
        let bus = LocalBus::new();
        let mut peer = RawPeer::connect(&bus, PEER).unwrap();
        let client = spawn(&bus, CLIENT).unwrap();

        let mut sub = client.subscribe("luna://com.example.peer/feed", "{}").await.unwrap();
        peer.expect().await.unwrap();

        assert!(bus.disconnect(CLIENT));
        timeout(Duration::from_secs(1), client.closed()).await.unwrap();

        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert!(sub.next().await.is_none());

        let err = client.call("luna://com.example.peer/x", "{}").await.unwrap_err();
        assert_eq!(err, BusError::Disconnected);
    }

    #[tokio::test]
    async fn test_service_loss_leaves_caller_running() {
        let bus = LocalBus::new();
        let _service = echo_service(&bus).await.unwrap();
        let client = spawn(&bus, CLIENT).unwrap();

        assert!(bus.disconnect(ECHO_SERVICE));

        let err = client
            .call("luna://com.example.echo/test", json!({ "msg": "anyone?" }))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::TransportUnavailable { .. }));
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_shutdown_ends_pending_calls() {
        let bus = LocalBus::new();
        let mut peer = RawPeer::connect(&bus, PEER).unwrap();
        let client = spawn(&bus, CLIENT).unwrap();

        let mut call = client.call("luna://com.example.peer/slow", "{}").await.unwrap();
        let request = peer.expect().await.unwrap();

        client.shutdown().await;
        assert!(call.next().await.is_none());
        assert!(!bus.is_connected(CLIENT));

        // The peer's answer now has nowhere to go
        let err = peer.respond(&request, "late", true).unwrap_err();
        assert!(matches!(err, BusError::TransportUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let bus = LocalBus::new();
        let client = spawn(&bus, CLIENT).unwrap();

        client.shutdown().await;
        client.shutdown().await;
        client.request_shutdown();
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_name_reusable_after_shutdown() {
        let bus = LocalBus::new();
        let first = echo_service(&bus).await.unwrap();
        assert!(matches!(
            bus.connect(ECHO_SERVICE),
            Err(BusError::NameInUse(_))
        ));

        first.shutdown().await;
        let second = echo_service(&bus).await.unwrap();
        assert!(second.is_connected());
    }

    #[tokio::test]
    async fn test_config_name_must_match_connection() {
        let bus = LocalBus::new();
        let err = Handle::spawn(BusConfig::new("com.example.a"), bus.connect("com.example.b").unwrap())
            .unwrap_err();
        assert!(matches!(err, ConfigError::NameMismatch { .. }));
    }
}
