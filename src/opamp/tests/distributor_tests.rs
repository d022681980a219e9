use super::*;
use crate::model::{Agent, AgentUpdate, ApplyStatus};
use crate::opamp::distributor::{config_message, resolve};
use crate::protocol::{CONFIG_FILE_KEY, FLAG_REPORT_FULL_STATE};
use chrono::Utc;
use std::sync::atomic::Ordering;

fn config(name: &str, raw: &str, selector: &[(&str, &str)]) -> Configuration {
    Configuration::new(name, "yaml", raw, selector_of(selector), Utc::now())
}

fn labelled(pairs: &[(&str, &str)]) -> Agent {
    let mut agent = Agent::new("a1", Utc::now());
    agent.labels = pairs.iter().copied().collect();
    agent
}

#[test]
fn test_resolve_first_match_in_order() {
    let configs = vec![
        config("a-prod", "x", &[("env", "prod")]),
        config("b-prod-eu", "y", &[("env", "prod"), ("region", "eu")]),
    ];
    let agent = labelled(&[("env", "prod"), ("region", "eu")]);

    assert_eq!(resolve(&agent, &configs).unwrap().name, "a-prod");
}

#[test]
fn test_resolve_skips_empty_selector() {
    let configs = vec![config("catch-all", "x", &[]), config("prod", "y", &[("env", "prod")])];

    assert_eq!(
        resolve(&labelled(&[("env", "prod")]), &configs).unwrap().name,
        "prod"
    );
    assert!(resolve(&labelled(&[("env", "dev")]), &configs).is_none());
}

#[test]
fn test_resolve_explicit_assignment_wins() {
    let configs = vec![
        config("pinned", "x", &[("env", "dev")]),
        config("prod", "y", &[("env", "prod")]),
    ];
    let mut agent = labelled(&[("env", "prod")]);
    agent.configuration_name = Some("pinned".to_string());
    assert_eq!(resolve(&agent, &configs).unwrap().name, "pinned");

    agent.configuration_name = Some("missing".to_string());
    assert!(resolve(&agent, &configs).is_none());
}

#[test]
fn test_config_message_shape() {
    let c = config("c1", "v1", &[("env", "prod")]);
    let msg = config_message(uid(3), &c);

    assert_eq!(msg.instance_uid, uid(3));
    assert_eq!(msg.flags, FLAG_REPORT_FULL_STATE);
    let remote = msg.remote_config.unwrap();
    assert_eq!(remote.hash_str(), c.config_hash);
    assert_eq!(remote.body_str().as_deref(), Some("v1"));
    assert!(remote.config.config_map.contains_key(CONFIG_FILE_KEY));
}

#[tokio::test]
async fn test_inline_response_by_hash() {
    let h = Harness::new();
    let c1 = h.create_config("c1", "v1", &[("env", "prod")]).await;
    let conn = FakeConnection::new();

    let first = h.send(&conn, message(1, &[("env", "prod")])).await.unwrap();
    let remote = first.remote_config.unwrap();
    assert_eq!(remote.hash_str(), c1.config_hash);
    assert_eq!(remote.body_str().as_deref(), Some("v1"));

    let same = with_status(
        message(1, &[("env", "prod")]),
        &c1.config_hash,
        RemoteConfigStatuses::Applied,
        "",
    );
    assert!(h.send(&conn, same).await.is_none());

    let stale = with_status(message(1, &[("env", "prod")]), "0000", RemoteConfigStatuses::Applied, "");
    assert!(h.send(&conn, stale).await.is_some());
}

#[tokio::test]
async fn test_inline_response_without_match_is_empty() {
    let h = Harness::new();
    h.create_config("c1", "v1", &[("env", "prod")]).await;
    let conn = FakeConnection::new();

    assert!(h.send(&conn, message(1, &[("env", "dev")])).await.is_none());
}

#[tokio::test]
async fn test_send_update_requires_connection() {
    let h = Harness::new();
    let c1 = h.create_config("c1", "v1", &[("env", "prod")]).await;

    let err = h
        .server
        .send_update(&agent_id(1), AgentUpdate::with_configuration(c1.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::NotConnected { .. }));

    let conn = FakeConnection::new();
    h.send(&conn, message(1, &[])).await;
    h.server
        .send_update(&agent_id(1), AgentUpdate::with_configuration(c1.clone()))
        .await
        .unwrap();

    let sent = conn.sent.lock().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].instance_uid, uid(1));
    assert_eq!(sent[0].remote_config.as_ref().unwrap().hash_str(), c1.config_hash);
}

#[tokio::test]
async fn test_label_only_update_requests_full_state() {
    let h = Harness::new();
    let conn = FakeConnection::new();
    h.send(&conn, message(1, &[("env", "prod")])).await;

    let update = AgentUpdate {
        labels: Some([("env", "staging")].into_iter().collect()),
        configuration: None,
    };
    h.server.send_update(&agent_id(1), update).await.unwrap();

    let sent = conn.sent.lock().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].instance_uid, uid(1));
    assert!(sent[0].remote_config.is_none());
    assert_eq!(sent[0].flags, FLAG_REPORT_FULL_STATE);
    assert_eq!(h.agent(1).await.labels.get("env"), Some("prod"));
}

#[tokio::test]
async fn test_manual_push_to_connected_agent() {
    let h = Harness::new();
    h.create_config("c1", "v1", &[("env", "prod")]).await;
    let conn = FakeConnection::new();
    h.send(&conn, message(1, &[("env", "staging")])).await;

    let outcome = h
        .server
        .push_configuration("c1", Some(&agent_id(1)))
        .await
        .unwrap();

    assert_eq!(outcome.succeeded, vec![agent_id(1)]);
    assert!(outcome.failed.is_empty());
    assert_eq!(conn.sent_count(), 1);

    let rows = h.store.list_apply_history_by_agent(&agent_id(1)).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, ApplyStatus::Applying);

    let stored = h.store.get_configuration("c1").await.unwrap().unwrap();
    assert_eq!(stored.last_applied_at, Some(h.clock.now()));
    assert_eq!(h.metrics.pushes.lock().clone(), vec![("c1".to_string(), 1, 0)]);
}

#[tokio::test]
async fn test_manual_push_to_disconnected_agent_fails_row() {
    let h = Harness::new();
    h.create_config("c1", "v1", &[("env", "prod")]).await;

    let outcome = h
        .server
        .push_configuration("c1", Some(&agent_id(9)))
        .await
        .unwrap();
    assert!(outcome.succeeded.is_empty());
    assert_eq!(outcome.failed, vec![agent_id(9)]);

    let rows = h.store.list_apply_history_by_agent(&agent_id(9)).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, ApplyStatus::Failed);
    assert!(rows[0].error_message.as_deref().unwrap().contains("not connected"));
}

#[tokio::test]
async fn test_manual_push_send_error_fails_row() {
    let h = Harness::new();
    h.create_config("c1", "v1", &[("env", "prod")]).await;
    let conn = FakeConnection::new();
    h.send(&conn, message(1, &[])).await;
    conn.fail_sends.store(true, Ordering::SeqCst);

    let outcome = h
        .server
        .push_configuration("c1", Some(&agent_id(1)))
        .await
        .unwrap();
    assert_eq!(outcome.failed, vec![agent_id(1)]);

    let rows = h.store.list_apply_history_by_agent(&agent_id(1)).await.unwrap();
    assert_eq!(rows[0].status, ApplyStatus::Failed);
    assert_eq!(rows[0].error_message.as_deref(), Some("transport error: send failed"));
}

#[tokio::test]
async fn test_push_unknown_configuration() {
    let h = Harness::new();
    let err = h.server.push_configuration("nope", None).await.unwrap_err();
    assert!(matches!(err, ControlError::ConfigurationNotFound { ref name } if name == "nope"));
}

#[tokio::test]
async fn test_broadcast_skips_non_matching_agents() {
    let h = Harness::new();
    h.create_config("c1", "v1", &[("env", "prod")]).await;
    let prod = FakeConnection::new();
    let dev = FakeConnection::new();
    h.send(&prod, message(1, &[("env", "prod")])).await;
    h.send(&dev, message(2, &[("env", "dev")])).await;

    let outcome = h.server.push_configuration("c1", None).await.unwrap();

    assert_eq!(outcome.succeeded, vec![agent_id(1)]);
    assert!(outcome.failed.is_empty());
    assert_eq!(dev.sent_count(), 0);
    assert!(h
        .store
        .list_apply_history_by_agent(&agent_id(2))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_broadcast_failure_does_not_abort_batch() {
    let h = Harness::new();
    h.create_config("c1", "v1", &[("env", "prod")]).await;
    let broken = FakeConnection::new();
    let healthy = FakeConnection::new();
    h.send(&broken, message(1, &[("env", "prod")])).await;
    h.send(&healthy, message(2, &[("env", "prod")])).await;
    broken.fail_sends.store(true, Ordering::SeqCst);

    let outcome = h.server.push_configuration("c1", None).await.unwrap();

    assert_eq!(outcome.failed, vec![agent_id(1)]);
    assert_eq!(outcome.succeeded, vec![agent_id(2)]);
    assert_eq!(healthy.sent_count(), 1);
}
