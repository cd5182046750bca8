//! # Subscriptions
//!
//! Service-side fan-out through keyed subscriber lists, and the client-side
//! response window.

#[cfg(test)]
mod tests {
    use crate::integration::fixtures::{eventually, spawn, CLIENT};
    use serde_json::json;
    use std::time::Duration;
    use sysbus_core::{CallEvent, Handle, LocalBus};
    use tokio::time::timeout;

    const STATUS_SERVICE: &str = "com.example.status";
    const STATUS_URI: &str = "luna://com.example.status/status";

    /// `status` files subscribers under "status" and answers with the current
    /// state; plain calls just get the state.
    async fn status_service(bus: &LocalBus) -> Handle {
        let service = spawn(bus, STATUS_SERVICE).unwrap();
        let subscriptions = service.clone();
        service
            .register_method("", "status", move |request| {
                if request.is_subscription() {
                    subscriptions.subscription_add("status", &request)?;
                }
                request.respond(json!({ "state": "idle" }))?;
                Ok(())
            })
            .await
            .unwrap();
        service
    }

    async fn wait_for_subscribers(service: &Handle, expected: usize) -> bool {
        eventually(Duration::from_secs(1), expected, move || async move {
            service.subscriber_count("status").await.unwrap_or(usize::MAX)
        })
        .await
    }

    #[tokio::test]
    async fn test_reply_fans_out_to_every_subscriber() {
        let bus = LocalBus::new();
        let service = status_service(&bus).await;

        let mut clients = Vec::new();
        let mut subs = Vec::new();
        for i in 0..3 {
            let client = spawn(&bus, &format!("{CLIENT}{i}")).unwrap();
            let mut sub = client.subscribe(STATUS_URI, "{}").await.unwrap();
            let initial = sub.next_response().await.unwrap();
            assert_eq!(
                initial.payload().parse_json::<serde_json::Value>().unwrap(),
                json!({ "state": "idle" })
            );
            clients.push(client);
            subs.push(sub);
        }
        assert!(wait_for_subscribers(&service, 3).await);

        let sent = service
            .subscription_reply("status", json!({ "state": "busy" }))
            .await
            .unwrap();
        assert_eq!(sent, 3);

        for sub in &mut subs {
            let update = timeout(Duration::from_secs(1), sub.next_response())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(
                update.payload().parse_json::<serde_json::Value>().unwrap(),
                json!({ "state": "busy" })
            );
        }
    }

    #[tokio::test]
    async fn test_cancel_removes_subscriber() {
        let bus = LocalBus::new();
        let service = status_service(&bus).await;
        let client = spawn(&bus, CLIENT).unwrap();

        let mut stays = client.subscribe(STATUS_URI, "{}").await.unwrap();
        let mut leaves = client.subscribe(STATUS_URI, "{}").await.unwrap();
        stays.next_response().await.unwrap();
        leaves.next_response().await.unwrap();
        assert!(wait_for_subscribers(&service, 2).await);

        leaves.cancel().unwrap();
        assert!(wait_for_subscribers(&service, 1).await);
        assert!(leaves.next().await.is_none());

        let sent = service.subscription_reply("status", "ping").await.unwrap();
        assert_eq!(sent, 1);
        let update = stays.next_response().await.unwrap();
        assert_eq!(update.payload().as_str(), Some("ping"));
    }

    #[tokio::test]
    async fn test_plain_call_is_not_filed() {
        let bus = LocalBus::new();
        let service = status_service(&bus).await;
        let client = spawn(&bus, CLIENT).unwrap();

        let mut call = client.call(STATUS_URI, "{}").await.unwrap();
        call.next_response().await.unwrap();
        assert_eq!(service.subscriber_count("status").await.unwrap(), 0);
        assert_eq!(service.subscription_reply("status", "x").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_client_disconnect_prunes_subscriber() {
        let bus = LocalBus::new();
        let service = status_service(&bus).await;
        let client = spawn(&bus, CLIENT).unwrap();

        let mut sub = client.subscribe(STATUS_URI, "{}").await.unwrap();
        sub.next_response().await.unwrap();
        assert!(wait_for_subscribers(&service, 1).await);

        client.shutdown().await;

        // The failed send drops the subscriber; the next reply reaches nobody
        service.subscription_reply("status", "x").await.unwrap();
        assert!(wait_for_subscribers(&service, 0).await);
        assert_eq!(service.subscription_reply("status", "y").await.unwrap(), 0);
    }

    // =========================================================================
    // RESPONSE WINDOWS
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_subscription_timeout_notifies_and_continues() {
        let bus = LocalBus::new();
        let service = status_service(&bus).await;
        let client = spawn(&bus, CLIENT).unwrap();

        let mut sub = client.subscribe(STATUS_URI, "{}").await.unwrap();
        sub.next_response().await.unwrap();
        assert!(wait_for_subscribers(&service, 1).await);

        sub.set_response_timeout(Duration::from_millis(100)).unwrap();
        tokio::time::sleep(Duration::from_millis(350)).await;

        let mut timeouts = 0;
        while let Some(event) = sub.try_next() {
            assert!(event.is_timeout());
            timeouts += 1;
        }
        assert_eq!(timeouts, 3);

        // Still active: a response arrives and restarts the window
        assert_eq!(service.subscription_reply("status", "late").await.unwrap(), 1);
        match sub.next().await.unwrap() {
            CallEvent::Response(message) => assert_eq!(message.payload().as_str(), Some("late")),
            CallEvent::TimedOut { .. } => panic!("expected the late response"),
        }
        assert!(sub.next().await.unwrap().is_timeout());

        let stats = client.stats().await.unwrap();
        assert_eq!(stats.calls.timeouts, 4);
        assert_eq!(stats.pending_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_responses_extend_window_without_new_timers() {
        let bus = LocalBus::new();
        let service = status_service(&bus).await;
        let client = spawn(&bus, CLIENT).unwrap();

        let mut sub = client.subscribe(STATUS_URI, "{}").await.unwrap();
        sub.next_response().await.unwrap();
        assert!(wait_for_subscribers(&service, 1).await);
        sub.set_response_timeout(Duration::from_secs(1)).unwrap();

        for i in 0..50 {
            service.subscription_reply("status", format!("tick {i}")).await.unwrap();
            sub.next_response().await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(client.stats().await.unwrap().timers, 1);
        assert!(sub.try_next().is_none());

        // The single entry still fires a full window after the last response
        tokio::time::sleep(Duration::from_millis(950)).await;
        assert!(sub.next().await.unwrap().is_timeout());
        assert_eq!(client.stats().await.unwrap().calls.timeouts, 1);
    }
}
