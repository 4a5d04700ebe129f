// Integration tests for the socket lifecycle, rebinding and typing indicators
mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use chatsync::models::{Draft, Role};
use chatsync::sync::{ChatError, ConnectionStatus, EngineUpdate, LifecycleEvent};
use common::{harness, identity, message, message_payload, settle, wait_for_update};

/// Poll `condition` until it holds or `timeout_secs` pass
async fn eventually(condition: impl Fn() -> bool, timeout_secs: u64) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

#[tokio::test]
async fn test_start_joins_user_and_role_rooms() {
    let mut h = harness("mech-4", Role::Mechanic);
    h.engine.start().await.unwrap();

    assert_eq!(h.engine.connection_status(), ConnectionStatus::Connected);
    assert!(h.engine.can_send());
    assert_eq!(h.connector.sink.emitted("join_user_room"), vec![json!("mech-4")]);
    assert_eq!(h.connector.sink.emitted("join_role_room"), vec![json!("mechanic")]);

    wait_for_update(&mut h.updates, |u| *u == EngineUpdate::Connection(ConnectionStatus::Connected), 5)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_dropped_link_reconnects_and_catches_up() {
    let h = harness("u1", Role::Coordinator);
    h.engine.start().await.unwrap();
    h.engine.open_conversation("u2", Role::Mechanic).await.unwrap();
    assert_eq!(h.api.history_calls.load(Ordering::SeqCst), 1);

    // A message lands on the server while we are offline
    h.api.set_history("u2", vec![message("missed", "u2", "u1", "are you there", Utc::now())]);
    h.connector.drop_link();

    let connector = h.connector.clone();
    let api = h.api.clone();
    assert!(
        eventually(
            move || connector.connects.load(Ordering::SeqCst) == 2 && api.history_calls.load(Ordering::SeqCst) == 2,
            5
        )
        .await
    );
    settle().await;
    assert_eq!(h.engine.connection_status(), ConnectionStatus::Connected);
    let ids: Vec<String> = h.engine.messages().await.into_iter().map(|m| m.id).collect();
    assert_eq!(ids, vec!["missed".to_string()]);

    // The new link is live
    h.connector
        .inject("new_message", message_payload("fresh", "u2", "u1", "back online", Utc::now()))
        .await;
    settle().await;
    assert_eq!(h.engine.messages().await.len(), 2);
}

#[tokio::test]
async fn test_retries_then_connects() {
    let h = harness("u1", Role::Coordinator);
    let mut lifecycle = h.engine.lifecycle();
    h.connector.refuse(2);

    h.engine.start().await.unwrap();
    assert_eq!(h.connector.connects.load(Ordering::SeqCst), 3);
    assert_eq!(h.engine.connection_status(), ConnectionStatus::Connected);

    let mut errors = 0;
    while let Ok(event) = lifecycle.try_recv() {
        match event {
            LifecycleEvent::ConnectError { .. } => errors += 1,
            LifecycleEvent::Connected => break,
            LifecycleEvent::Disconnected { .. } => {}
        }
    }
    assert_eq!(errors, 2);
}

#[tokio::test]
async fn test_gives_up_after_retry_budget() {
    let h = harness("u1", Role::Coordinator);
    h.connector.refuse(3);

    let result = h.engine.start().await;
    assert!(matches!(result, Err(ChatError::Transport(_))));
    assert!(matches!(h.engine.connection_status(), ConnectionStatus::Failed { .. }));
    assert_eq!(h.connector.connects.load(Ordering::SeqCst), 3);
    assert!(!h.engine.can_send());

    h.engine.open_conversation("u2", Role::Mechanic).await.unwrap();
    match h.engine.send_message(Draft::text("anyone?")).await {
        Err(ChatError::SendFailed { draft, reason }) => {
            assert_eq!(draft.text.as_deref(), Some("anyone?"));
            assert!(reason.contains("Not connected"));
        }
        other => panic!("expected SendFailed, got {:?}", other),
    }
    assert!(h.engine.messages().await.is_empty());

    // The host retries by hand
    h.engine.reconnect().await.unwrap();
    assert_eq!(h.engine.connection_status(), ConnectionStatus::Connected);
    h.engine.send_message(Draft::text("anyone?")).await.unwrap();
}

#[tokio::test]
async fn test_rebind_with_new_identity_resets_state() {
    let h = harness("u1", Role::Coordinator);
    h.engine.start().await.unwrap();
    h.connector
        .inject("new_message", message_payload("q1", "u2", "u1", "ping", Utc::now()))
        .await;
    settle().await;
    assert_eq!(h.engine.unread_count("u1_u2").await, 1);

    h.engine.rebind(identity("u9", Role::Admin)).await.unwrap();
    assert_eq!(h.engine.user_id(), "u9");
    assert_eq!(*h.api.tokens.lock().unwrap(), vec!["token-u9".to_string()]);
    assert_eq!(h.connector.identities.lock().unwrap().last().map(String::as_str), Some("u9"));
    assert_eq!(h.engine.unread_count("u1_u2").await, 0);
    assert!(h.engine.notifications().await.is_empty());
    assert_eq!(
        h.connector.sink.emitted("join_user_room"),
        vec![json!("u1"), json!("u9")]
    );
    assert!(h.connector.sink.closed.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn test_token_refresh_keeps_state() {
    let h = harness("u1", Role::Coordinator);
    h.engine.start().await.unwrap();
    h.connector
        .inject("new_message", message_payload("q1", "u2", "u1", "ping", Utc::now()))
        .await;
    settle().await;

    let mut refreshed = identity("u1", Role::Coordinator);
    refreshed.auth_token = "token-u1-v2".to_string();
    h.engine.rebind(refreshed).await.unwrap();

    assert_eq!(h.engine.unread_count("u1_u2").await, 1);
    assert_eq!(h.engine.identity().auth_token, "token-u1-v2");
    assert_eq!(h.connector.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_typing_indicator_decays_after_quiet_window() {
    let mut h = harness("u1", Role::Coordinator);
    h.engine.start().await.unwrap();
    h.engine.open_conversation("u2", Role::Mechanic).await.unwrap();

    let typing = json!({"conversationId": "u1_u2", "userId": "u2"});
    h.connector.inject("receive_typing", typing.clone()).await;
    settle().await;
    assert!(h.engine.is_peer_typing().await);

    tokio::time::sleep(Duration::from_secs(2)).await;
    h.connector.inject("receive_typing", typing).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    // First window would have ended by now, the refresh extended it
    assert!(h.engine.is_peer_typing().await);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!h.engine.is_peer_typing().await);

    let on = wait_for_update(&mut h.updates, |u| matches!(u, EngineUpdate::Typing { typing: true, .. }), 1)
        .await
        .unwrap();
    assert_eq!(
        on,
        EngineUpdate::Typing {
            conversation_id: "u1_u2".to_string(),
            user_id: Some("u2".to_string()),
            typing: true,
        }
    );
    wait_for_update(&mut h.updates, |u| matches!(u, EngineUpdate::Typing { typing: false, .. }), 1)
        .await
        .unwrap();
    // One on, one off: the refresh does not re-announce
    assert!(h.updates.try_recv().map_or(true, |u| !matches!(u, EngineUpdate::Typing { .. })));
}

#[tokio::test]
async fn test_typing_ignored_outside_open_conversation() {
    let h = harness("u1", Role::Coordinator);
    h.engine.start().await.unwrap();
    h.engine.open_conversation("u2", Role::Mechanic).await.unwrap();

    h.connector
        .inject("receive_typing", json!({"conversationId": "u1_u3", "userId": "u3"}))
        .await;
    h.connector
        .inject("receive_typing", json!({"conversationId": "u1_u2", "userId": "u1"}))
        .await;
    settle().await;
    assert!(!h.engine.is_peer_typing().await);
}

#[tokio::test]
async fn test_notify_typing_targets_open_conversation() {
    let h = harness("u1", Role::Coordinator);
    h.engine.start().await.unwrap();

    h.engine.notify_typing().await;
    assert!(h.connector.sink.emitted("typing").is_empty());

    h.engine.open_conversation("u2", Role::Mechanic).await.unwrap();
    h.engine.notify_typing().await;
    assert_eq!(
        h.connector.sink.emitted("typing"),
        vec![json!({"conversationId": "u1_u2", "userId": "u1"})]
    );
}

#[tokio::test]
async fn test_shutdown_closes_socket() {
    let h = harness("u1", Role::Coordinator);
    h.engine.start().await.unwrap();
    h.engine.open_conversation("u2", Role::Mechanic).await.unwrap();

    h.engine.shutdown().await;
    assert_eq!(h.engine.connection_status(), ConnectionStatus::Disconnected);
    assert_eq!(h.connector.sink.closed.load(Ordering::SeqCst), 1);
    assert_eq!(h.engine.open_conversation_id().await, None);

    // The dropped stream of a closed link does not trigger a reconnect
    h.connector.drop_link();
    settle().await;
    assert_eq!(h.connector.connects.load(Ordering::SeqCst), 1);
}
