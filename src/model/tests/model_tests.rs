use super::*;
use chrono::{Duration, Utc};
use proptest::prelude::*;
use std::collections::BTreeMap;

fn selector(pairs: &[(&str, &str)]) -> Selector {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn agent_with_labels(pairs: &[(&str, &str)]) -> Agent {
    let mut agent = Agent::new("agent-1", Utc::now());
    agent.labels = pairs.iter().copied().collect();
    agent
}

#[test]
fn test_config_hash_is_deterministic_hex() {
    let first = compute_config_hash("receivers: {}\n");
    let second = compute_config_hash("receivers: {}\n");

    assert_eq!(first, second);
    assert_eq!(first.len(), 64);
    assert!(first.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
}

#[test]
fn test_config_hash_known_value() {
    // sha256("") is a well-known constant
    assert_eq!(
        compute_config_hash(""),
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
}

#[test]
fn test_config_hash_changes_with_content() {
    assert_ne!(compute_config_hash("v1"), compute_config_hash("v2"));
}

#[test]
fn test_new_configuration_starts_at_version_one() {
    let config = Configuration::new("c1", "yaml", "v1", selector(&[("env", "prod")]), Utc::now());
    assert_eq!(config.version, 1);
    assert_eq!(config.config_hash, compute_config_hash("v1"));
}

#[test]
fn test_empty_selector_matches_nothing() {
    let config = Configuration::new("c1", "yaml", "v1", BTreeMap::new(), Utc::now());
    assert!(!config.matches_agent(&agent_with_labels(&[])));
    assert!(!config.matches_agent(&agent_with_labels(&[("env", "prod")])));
}

#[test]
fn test_selector_requires_every_pair() {
    let config = Configuration::new(
        "c1",
        "yaml",
        "v1",
        selector(&[("env", "prod"), ("region", "eu")]),
        Utc::now(),
    );

    assert!(config.matches_agent(&agent_with_labels(&[("env", "prod"), ("region", "eu")])));
    assert!(config.matches_agent(&agent_with_labels(&[
        ("env", "prod"),
        ("region", "eu"),
        ("team", "obs"),
    ])));
    assert!(!config.matches_agent(&agent_with_labels(&[("env", "prod")])));
    assert!(!config.matches_agent(&agent_with_labels(&[("env", "prod"), ("region", "us")])));
}

#[test]
fn test_labels_empty_selector_matches_all() {
    let labels: Labels = [("env", "prod")].into_iter().collect();
    assert!(labels.matches(&BTreeMap::new()));
}

#[test]
fn test_labels_merge_prefers_other() {
    let base: Labels = [("env", "dev"), ("team", "obs")].into_iter().collect();
    let other: Labels = [("env", "prod")].into_iter().collect();

    let merged = base.merge(&other);
    assert_eq!(merged.get("env"), Some("prod"));
    assert_eq!(merged.get("team"), Some("obs"));
    assert_eq!(base.get("env"), Some("dev"));
}

#[test]
fn test_agent_status_parse_and_display() {
    for status in [AgentStatus::Online, AgentStatus::Offline, AgentStatus::Error] {
        assert_eq!(AgentStatus::parse(&status.to_string()), Some(status));
    }
    assert!(!AgentStatus::is_valid("connecting"));
    assert_eq!(AgentStatus::default(), AgentStatus::Offline);
}

#[test]
fn test_agent_status_serializes_lowercase() {
    let json = serde_json::to_string(&AgentStatus::Online).unwrap();
    assert_eq!(json, "\"online\"");
}

#[test]
fn test_new_agent_is_offline_without_labels() {
    let agent = Agent::new("a", Utc::now());
    assert_eq!(agent.status, AgentStatus::Offline);
    assert!(agent.labels.is_empty());
    assert_eq!(agent.protocol, PROTOCOL_OPAMP);
}

#[test]
fn test_apply_status_terminal() {
    assert!(!ApplyStatus::Pending.is_terminal());
    assert!(!ApplyStatus::Applying.is_terminal());
    assert!(ApplyStatus::Applied.is_terminal());
    assert!(ApplyStatus::Failed.is_terminal());
}

#[test]
fn test_apply_status_transitions() {
    assert!(ApplyStatus::Pending.can_transition_to(ApplyStatus::Applying));
    assert!(ApplyStatus::Pending.can_transition_to(ApplyStatus::Failed));
    assert!(ApplyStatus::Applying.can_transition_to(ApplyStatus::Applied));
    assert!(!ApplyStatus::Applying.can_transition_to(ApplyStatus::Pending));
    assert!(!ApplyStatus::Applied.can_transition_to(ApplyStatus::Failed));
    assert!(!ApplyStatus::Failed.can_transition_to(ApplyStatus::Applied));
}

#[test]
fn test_apply_history_terminal_rows_never_change() {
    let now = Utc::now();
    let config = Configuration::new("c1", "yaml", "v1", selector(&[("env", "prod")]), now);
    let mut row = ConfigurationApplyHistory::new("a1", &config, ApplyStatus::Applying, now);

    assert!(row.transition(ApplyStatus::Failed, Some("bad receiver"), now));
    assert_eq!(row.error_message.as_deref(), Some("bad receiver"));

    let later = now + Duration::seconds(5);
    assert!(!row.transition(ApplyStatus::Applied, None, later));
    assert_eq!(row.status, ApplyStatus::Failed);
    assert!(row.applied_at.is_none());
    assert_eq!(row.updated_at, now);
}

#[test]
fn test_apply_history_applied_sets_timestamp() {
    let now = Utc::now();
    let config = Configuration::new("c1", "yaml", "v1", selector(&[("env", "prod")]), now);
    let mut row = ConfigurationApplyHistory::new("a1", &config, ApplyStatus::Applying, now);

    assert!(row.transition(ApplyStatus::Applied, None, now));
    assert_eq!(row.applied_at, Some(now));
    assert_eq!(row.config_hash, config.config_hash);
}

#[test]
fn test_connection_history_close_computes_duration() {
    let connected = Utc::now();
    let mut row = AgentConnectionHistory::open("a1", connected, "10.0.0.1:5555");
    assert!(row.is_active());

    row.close(connected + Duration::seconds(42), REASON_CONNECTION_CLOSED);
    assert!(!row.is_active());
    assert_eq!(row.duration_seconds, Some(42));
    assert_eq!(row.disconnect_reason.as_deref(), Some(REASON_CONNECTION_CLOSED));
}

#[test]
fn test_connection_history_duration_never_negative() {
    let connected = Utc::now();
    let mut row = AgentConnectionHistory::open("a1", connected, "");
    row.close(connected - Duration::seconds(3), REASON_HEARTBEAT_TIMEOUT);
    assert_eq!(row.duration_seconds, Some(0));
}

#[test]
fn test_history_snapshot_copies_previous_version() {
    let now = Utc::now();
    let config = Configuration::new("c1", "yaml", "v1", selector(&[("env", "prod")]), now);
    let snapshot = ConfigurationHistory::snapshot_of(&config);

    assert_eq!(snapshot.configuration_name, "c1");
    assert_eq!(snapshot.version, 1);
    assert_eq!(snapshot.raw_config, "v1");
    assert_eq!(snapshot.config_hash, config.config_hash);
    assert_eq!(snapshot.created_at, config.updated_at);
}

proptest! {
    #[test]
    fn prop_hash_is_stable(content in ".*") {
        prop_assert_eq!(compute_config_hash(&content), compute_config_hash(&content));
        prop_assert_eq!(compute_config_hash(&content).len(), 64);
    }

    #[test]
    fn prop_hash_detects_appended_byte(content in ".*", extra in "[a-z]") {
        let changed = format!("{}{}", content, extra);
        prop_assert_ne!(compute_config_hash(&content), compute_config_hash(&changed));
    }

    #[test]
    fn prop_selector_subset_of_labels_matches(
        labels in proptest::collection::btree_map("[a-z]{1,6}", "[a-z0-9]{0,6}", 1..8),
        extra in proptest::collection::btree_map("[A-Z]{1,6}", "[a-z0-9]{0,6}", 0..4),
    ) {
        let sel: Selector = labels.clone();
        let mut agent = Agent::new("a", Utc::now());
        agent.labels = Labels(labels.into_iter().chain(extra).collect());
        let config = Configuration::new("c", "yaml", "x", sel, Utc::now());
        prop_assert!(config.matches_agent(&agent));
    }

    #[test]
    fn prop_selector_with_mismatched_value_fails(
        labels in proptest::collection::btree_map("[a-z]{1,6}", "[a-z]{1,6}", 1..8),
    ) {
        let mut sel: Selector = labels.clone();
        if let Some((_, value)) = sel.iter_mut().next() {
            value.push('X');
        }
        let mut agent = Agent::new("a", Utc::now());
        agent.labels = Labels(labels);
        let config = Configuration::new("c", "yaml", "x", sel, Utc::now());
        prop_assert!(!config.matches_agent(&agent));
    }
}
