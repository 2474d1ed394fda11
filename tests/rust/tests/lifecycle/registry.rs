//! Instance registry tests

use std::collections::BTreeMap;
use std::sync::Arc;

use mcpfleet_core::{
    CapabilityMap, ConfigOverride, Error, InstanceRole, Phase, TransportKind,
};
use mcpfleet_registry::InstanceRegistry;
use pretty_assertions::assert_eq;
use serde_json::json;
use tests::services::{http_configs, tools_capability};
use tests::{MockPeer, RegistryTestHarness};

fn harness() -> RegistryTestHarness {
    RegistryTestHarness::new(http_configs(&["alpha", "beta"]))
}

// ============================================================================
// Lookup and listing
// ============================================================================

#[tokio::test]
async fn test_list_never_instantiates() {
    let h = harness();

    let listing = h.registry.list();

    assert_eq!(listing.keys().cloned().collect::<Vec<_>>(), vec!["alpha", "beta"]);
    let alpha = &listing["alpha"];
    assert!(!alpha.instantiated);
    assert!(!alpha.connected);
    assert_eq!(alpha.transport, Some(TransportKind::Http));
    assert_eq!(alpha.display_name, "alpha");
    assert_eq!(h.registry.get_all_statistics().instantiated, 0);
    assert_eq!(h.transport.open_count(), 0);
}

#[tokio::test]
async fn test_list_reflects_instantiated_and_connected() {
    let h = harness();
    h.registry.connect("alpha", None, None, None).await.unwrap();

    let listing = h.registry.list();

    assert!(listing["alpha"].instantiated);
    assert!(listing["alpha"].connected);
    assert!(listing["alpha"].registered_at.is_some());
    assert!(!listing["beta"].instantiated);
}

#[tokio::test]
async fn test_unknown_name_is_configuration_not_found() {
    let h = harness();

    assert!(matches!(h.registry.get("ghost"), Err(Error::ConfigurationNotFound(_))));
    assert!(matches!(
        h.registry.connect("ghost", None, None, None).await,
        Err(Error::ConfigurationNotFound(_))
    ));
    assert!(matches!(
        h.registry.disconnect("ghost").await,
        Err(Error::ConfigurationNotFound(_))
    ));
    assert!(matches!(h.registry.get_status("ghost"), Err(Error::ConfigurationNotFound(_))));
    assert!(!h.registry.exists("ghost"));
}

#[tokio::test]
async fn test_get_caches_instance() {
    let h = harness();

    let first = h.registry.get("alpha").unwrap();
    let second = h.registry.get("alpha").unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(h.registry.get_all_statistics().instantiated, 1);
}

#[tokio::test]
async fn test_status_of_configured_name_is_idle_without_instantiating() {
    let h = harness();

    let status = h.registry.get_status("beta").unwrap();

    assert_eq!(status.phase, Phase::Idle);
    assert!(!status.connected);
    assert_eq!(status.request_count, 0);
    assert_eq!(h.registry.get_all_statistics().instantiated, 0);
}

// ============================================================================
// Create
// ============================================================================

#[tokio::test]
async fn test_create_replaces_cached_instance() {
    let h = harness();
    h.registry.connect("alpha", None, None, None).await.unwrap();
    let original = h.registry.get("alpha").unwrap();

    let overrides = ConfigOverride {
        version: Some("2.0.0".into()),
        capabilities: Some(CapabilityMap::new().with("roots", json!({ "listChanged": true }))),
        ..Default::default()
    };
    let replacement = h.registry.create("alpha", &overrides).await.unwrap();

    assert!(!Arc::ptr_eq(&original, &replacement));
    assert!(!original.is_connected(), "replaced instance is disconnected");
    assert_eq!(h.transport.close_count(), 1);
    assert!(!replacement.is_connected());
    assert_eq!(replacement.config().version, "2.0.0");
    assert_eq!(
        replacement.config().target.as_deref(),
        Some("http://alpha.test/mcp"),
        "unset override fields keep configuration"
    );
    assert!(Arc::ptr_eq(&h.registry.get("alpha").unwrap(), &replacement));
    assert!(h.registry.active_connections().is_empty());
}

#[tokio::test]
async fn test_create_unconfigured_name() {
    let h = harness();
    let overrides = ConfigOverride {
        target: Some("http://gamma.test/mcp".into()),
        ..Default::default()
    };

    let gamma = h.registry.create("gamma", &overrides).await.unwrap();

    assert!(h.registry.exists("gamma"));
    assert_eq!(gamma.config().display_name, "gamma");
    assert!(h.registry.names().contains(&"gamma".to_string()));
    h.registry.connect("gamma", None, None, None).await.unwrap();
    assert!(h.registry.is_connected("gamma"));
}

// ============================================================================
// Connect / Disconnect / Reconnect
// ============================================================================

#[tokio::test]
async fn test_connect_and_disconnect_track_active_markers() {
    let h = harness();

    h.registry.connect("alpha", None, None, None).await.unwrap();
    h.registry.connect("beta", None, None, None).await.unwrap();
    assert_eq!(h.registry.active_connections(), vec!["alpha", "beta"]);
    assert!(h.registry.is_connected("alpha"));

    h.registry.disconnect("alpha").await.unwrap();
    assert_eq!(h.registry.active_connections(), vec!["beta"]);
    assert!(!h.registry.is_connected("alpha"));
}

#[tokio::test]
async fn test_closed_connection_clears_active_marker() {
    let h = harness();
    h.registry.connect("alpha", None, None, None).await.unwrap();
    h.registry.connect("beta", None, None, None).await.unwrap();

    h.peer.drop_connection();
    let err = h.registry.get("alpha").unwrap().ping().await.unwrap_err();

    assert!(err.is_connection_closed());
    assert!(!h.registry.is_connected("alpha"));
    assert_eq!(h.registry.active_connections(), vec!["beta"]);

    h.peer.restore();
    h.registry.connect("alpha", None, None, None).await.unwrap();
    assert_eq!(h.registry.active_connections(), vec!["alpha", "beta"]);
}

#[tokio::test]
async fn test_disconnect_of_never_instantiated_name_is_ok() {
    let h = harness();

    h.registry.disconnect("beta").await.unwrap();

    assert_eq!(h.registry.get_all_statistics().instantiated, 0);
}

#[tokio::test]
async fn test_reconnect_uses_last_target() {
    let h = harness();
    h.registry
        .connect("alpha", Some("http://elsewhere.test/mcp"), None, None)
        .await
        .unwrap();

    h.registry.reconnect("alpha").await.unwrap();

    let status = h.registry.get_status("alpha").unwrap();
    assert!(status.connected);
    assert_eq!(status.target.as_deref(), Some("http://elsewhere.test/mcp"));
    assert_eq!(h.transport.open_count(), 2);
}

#[tokio::test]
async fn test_reconnect_client_without_any_target_fails() {
    let mut configs = BTreeMap::new();
    configs.insert("bare".to_string(), mcpfleet_core::ConnectionConfig::new("Bare"));
    let h = RegistryTestHarness::new(configs);

    let err = h.registry.reconnect("bare").await.unwrap_err();

    assert!(matches!(err, Error::MissingTarget(_)));
}

#[tokio::test]
async fn test_disconnect_all_continues_past_failures() {
    let h = harness();
    h.registry.connect("alpha", None, None, None).await.unwrap();
    h.registry.connect("beta", None, None, None).await.unwrap();
    h.peer.fail_next_close(1);

    let outcome = h.registry.disconnect_all().await;

    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.disconnected.len(), 1);
    assert!(!h.registry.is_connected("alpha"));
    assert!(!h.registry.is_connected("beta"));
    assert!(h.registry.active_connections().is_empty());
}

#[tokio::test]
async fn test_statistics_aggregate_counters() {
    let h = harness();
    h.registry.connect("alpha", None, None, None).await.unwrap();
    h.registry.connect("beta", None, None, None).await.unwrap();
    h.registry.get("alpha").unwrap().ping().await.unwrap();
    h.registry.get("beta").unwrap().ping().await.unwrap();
    h.peer
        .respond_with(Err(mcpfleet_core::ChannelError::new("boom")));
    let _ = h.registry.get("beta").unwrap().list_tools().await;

    let stats = h.registry.get_all_statistics();

    assert_eq!(stats.role, InstanceRole::Client);
    assert_eq!(stats.configured, 2);
    assert_eq!(stats.instantiated, 2);
    assert_eq!(stats.connected, 2);
    assert_eq!(stats.total_requests, 2);
    assert_eq!(stats.total_errors, 1);
}

// ============================================================================
// Connection tests
// ============================================================================

#[tokio::test]
async fn test_connection_test_reports_success_and_closes_channel() {
    let h = RegistryTestHarness::with_role(
        InstanceRole::Client,
        http_configs(&["alpha"]),
        MockPeer::with_capabilities(tools_capability()),
    );

    let report = h.registry.test_connection("http://scratch.test/mcp", None).await;

    assert!(report.success);
    assert_eq!(report.transport, Some(TransportKind::Http));
    assert_eq!(report.capabilities, Some(tools_capability()));
    assert!(report.response_time_ms.is_some());
    assert_eq!(report.error, None);
    assert_eq!(h.transport.close_count(), 1);
    assert_eq!(h.registry.get_all_statistics().instantiated, 0);
}

#[tokio::test]
async fn test_connection_test_failure_leaves_cache_untouched() {
    let h = harness();
    h.transport.fail_next(1);

    let report = h.registry.test_connection("http://scratch.test/mcp", None).await;

    assert!(!report.success);
    assert!(report.error.unwrap().contains("connection refused"));
    assert_eq!(h.registry.names(), vec!["alpha", "beta"]);
    assert_eq!(h.registry.get_all_statistics().instantiated, 0);
}

#[tokio::test]
async fn test_connection_test_to_unreachable_address() {
    let registry = InstanceRegistry::new(
        InstanceRole::Client,
        http_configs(&["alpha"]),
        mcpfleet_mcp::client_transports(),
    );

    let report = registry.test_connection("http://127.0.0.1:1", None).await;

    assert!(!report.success);
    assert!(report.error.is_some());
    assert_eq!(report.capabilities, None);
    assert_eq!(registry.names(), vec!["alpha"]);
    assert_eq!(registry.get_all_statistics().instantiated, 0);
}
