//! Connection state machine tests

use std::sync::Arc;
use std::time::Duration;

use mcpfleet_core::{
    methods, CapabilityMap, ChannelError, ConnectionConfig, Error, ErrorKind, InstanceRole, Phase,
    RetryPolicy, TransportKind, TransportOptions,
};
use mcpfleet_registry::Instance;
use pretty_assertions::assert_eq;
use serde_json::json;
use tests::services::{mock_transports, tools_capability};
use tests::{wait, MockPeer, MockTransport};

const TARGET: &str = "http://alpha.test/mcp";

fn alpha_config() -> ConnectionConfig {
    ConnectionConfig::new("Alpha")
        .with_transport(TransportKind::Http)
        .with_target(TARGET)
}

fn instance_with(config: ConnectionConfig, peer: Arc<MockPeer>) -> (Arc<Instance>, Arc<MockTransport>) {
    let transport = MockTransport::new(TransportKind::Http, peer);
    let instance = Instance::new("alpha", InstanceRole::Client, config, mock_transports(&transport));
    (Arc::new(instance), transport)
}

fn alpha() -> (Arc<Instance>, Arc<MockTransport>) {
    instance_with(alpha_config(), MockPeer::new())
}

fn uniform_kind(err: &Error) -> ErrorKind {
    err.kind().expect("error should be classified")
}

// ============================================================================
// Connect / Disconnect
// ============================================================================

#[tokio::test]
async fn test_connect_sets_connected_state() {
    let (instance, transport) = instance_with(alpha_config(), MockPeer::with_capabilities(tools_capability()));

    assert!(!instance.is_connected());
    assert_eq!(instance.state().phase, Phase::Idle);

    instance.connect(None, None, None).await.unwrap();

    let state = instance.state();
    assert!(instance.is_connected());
    assert_eq!(state.phase, Phase::Connected);
    assert_eq!(state.transport, Some(TransportKind::Http));
    assert_eq!(state.target.as_deref(), Some(TARGET));
    assert!(state.connected_at.is_some());
    assert_eq!(state.peer_capabilities, tools_capability());
    assert_eq!(transport.open_count(), 1);
}

#[tokio::test]
async fn test_connect_sends_prepared_capabilities() {
    let capabilities = CapabilityMap::new()
        .with("sampling", json!({}))
        .with("roots", json!({ "listChanged": true }))
        .with("elicitation", serde_json::Value::Null);
    let (instance, transport) = instance_with(
        alpha_config().with_capabilities(capabilities),
        MockPeer::new(),
    );

    instance.connect(None, None, None).await.unwrap();

    let request = transport.last_request().expect("open request");
    assert_eq!(
        request.capabilities,
        CapabilityMap::new().with("roots", json!({ "listChanged": true }))
    );
    assert_eq!(request.display_name, "Alpha");
    assert_eq!(request.version, "1.0.0");
    assert_eq!(instance.state().local_capabilities, request.capabilities);
}

#[tokio::test]
async fn test_connect_is_idempotent() {
    let (instance, transport) = alpha();

    instance.connect(None, None, None).await.unwrap();
    instance.connect(None, None, None).await.unwrap();

    assert!(instance.is_connected());
    assert_eq!(transport.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_connects_open_once() {
    let (instance, transport) = alpha();
    transport.delay_open(Duration::from_millis(200));

    let (first, second) = tokio::join!(
        instance.connect(None, None, None),
        instance.connect(None, None, None)
    );

    assert!(first.is_ok());
    assert!(second.is_ok());
    assert_eq!(transport.open_count(), 1);
}

#[tokio::test]
async fn test_explicit_target_and_hint_override_config() {
    let (instance, _transport) = alpha();

    instance
        .connect(Some("ws://other.test:7000"), Some(TransportKind::Socket), None)
        .await
        .unwrap();

    let state = instance.state();
    assert_eq!(state.transport, Some(TransportKind::Socket));
    assert_eq!(state.target.as_deref(), Some("ws://other.test:7000"));
}

#[tokio::test]
async fn test_client_without_target_fails() {
    let (instance, transport) = instance_with(ConnectionConfig::new("Bare"), MockPeer::new());

    let err = instance.connect(None, None, None).await.unwrap_err();

    assert!(matches!(err, Error::MissingTarget(ref name) if name == "alpha"));
    assert_eq!(transport.open_count(), 0);
}

#[tokio::test]
async fn test_server_without_target_binds_configured_address() {
    let transport = MockTransport::new(TransportKind::Http, MockPeer::new());
    let config = ConnectionConfig::new("Hosted")
        .with_transport(TransportKind::Http)
        .with_options(TransportOptions {
            host: Some("127.0.0.1".into()),
            port: Some(7010),
            ..Default::default()
        });
    let server = Instance::new("hosted", InstanceRole::Server, config, mock_transports(&transport));

    server.connect(None, None, None).await.unwrap();

    let request = transport.last_request().expect("open request");
    assert_eq!(request.target, "127.0.0.1:7010");
    assert_eq!(request.role, InstanceRole::Server);
}

#[tokio::test]
async fn test_disconnect_is_idempotent_and_closes_once() {
    let (instance, transport) = alpha();
    instance.connect(None, None, None).await.unwrap();

    instance.disconnect().await.unwrap();
    instance.disconnect().await.unwrap();

    let state = instance.state();
    assert!(!state.connected);
    assert_eq!(state.phase, Phase::Disconnected);
    assert_eq!(state.transport, None);
    assert_eq!(transport.close_count(), 1);
    assert_eq!(transport.release_count(), 1, "closed through the adapter");
}

#[tokio::test]
async fn test_disconnect_before_connect_is_noop() {
    let (instance, transport) = alpha();

    instance.disconnect().await.unwrap();

    assert_eq!(instance.state().phase, Phase::Idle);
    assert_eq!(transport.close_count(), 0);
}

#[tokio::test]
async fn test_reconnect_replays_last_arguments() {
    let (instance, transport) = alpha();
    instance
        .connect(Some("http://override.test/mcp"), None, None)
        .await
        .unwrap();

    instance.reconnect().await.unwrap();

    assert!(instance.is_connected());
    assert_eq!(instance.state().target.as_deref(), Some("http://override.test/mcp"));
    assert_eq!(transport.open_count(), 2);
    assert_eq!(transport.close_count(), 1);
}

// ============================================================================
// Connect failures
// ============================================================================

#[tokio::test]
async fn test_failed_connect_is_classified_and_counted() {
    let (instance, transport) = alpha();
    transport.fail_next(1);

    let err = instance.connect(None, None, None).await.unwrap_err();

    assert_eq!(uniform_kind(&err), ErrorKind::OperationFailed);
    assert!(err.to_string().contains("connection refused"));
    let state = instance.state();
    assert!(!state.connected);
    assert_eq!(state.phase, Phase::Disconnected);
    assert_eq!(state.error_count, 1);
    assert!(state.last_error.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_connect_retries_with_policy() {
    let options = TransportOptions {
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 100,
            backoff_multiplier: 2.0,
        },
        ..Default::default()
    };
    let (instance, transport) = instance_with(alpha_config().with_options(options), MockPeer::new());
    transport.fail_next(2);

    instance.connect(None, None, None).await.unwrap();

    assert!(instance.is_connected());
    assert_eq!(transport.open_count(), 3);
    assert_eq!(instance.state().error_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_connect_times_out() {
    let options = TransportOptions {
        timeout_secs: Some(1),
        ..Default::default()
    };
    let (instance, transport) = instance_with(alpha_config().with_options(options), MockPeer::new());
    transport.delay_open(Duration::from_secs(30));

    let err = instance.connect(None, None, None).await.unwrap_err();

    assert_eq!(uniform_kind(&err), ErrorKind::OperationFailed);
    assert!(err.to_string().contains("timed out"));
    assert!(!instance.is_connected());
}

// ============================================================================
// Calls and classification
// ============================================================================

#[tokio::test]
async fn test_call_before_connect_is_not_connected() {
    let (instance, _transport) = alpha();

    let err = instance.ping().await.unwrap_err();

    assert!(matches!(err, Error::NotConnected(_)));
    assert_eq!(instance.state().error_count, 0);
}

#[tokio::test]
async fn test_operation_failure_keeps_connection() {
    let (instance, transport) = alpha();
    instance.connect(None, None, None).await.unwrap();
    transport
        .peer()
        .respond_with(Err(ChannelError::with_code(-32602, "invalid params")));

    let err = instance.call_tool("echo", None).await.unwrap_err();

    assert_eq!(uniform_kind(&err), ErrorKind::OperationFailed);
    match &err {
        Error::Uniform(uniform) => {
            assert_eq!(uniform.operation, methods::CALL_TOOL);
            assert_eq!(uniform.instance, "alpha");
            assert_eq!(uniform.code(), Some(-32602));
        }
        other => panic!("expected uniform error, got {other:?}"),
    }
    let state = instance.state();
    assert!(state.connected);
    assert_eq!(state.error_count, 1);
    assert_eq!(state.last_error.as_deref(), Some("invalid params"));
}

#[tokio::test]
async fn test_connection_closed_code_demotes_instance() {
    let (instance, transport) = alpha();
    instance.connect(None, None, None).await.unwrap();
    transport
        .peer()
        .respond_with(Err(ChannelError::connection_closed("peer hung up")));

    let err = instance.ping().await.unwrap_err();

    assert_eq!(uniform_kind(&err), ErrorKind::ConnectionClosed);
    assert!(err.is_connection_closed());
    let state = instance.state();
    assert!(!state.connected);
    assert_eq!(state.phase, Phase::Disconnected);
    assert_eq!(state.error_count, 1);

    // Later calls see a disconnected instance.
    assert!(matches!(
        instance.list_tools().await.unwrap_err(),
        Error::NotConnected(_)
    ));
}

#[tokio::test]
async fn test_closed_message_signature_demotes_instance() {
    let (instance, transport) = alpha();
    instance.connect(None, None, None).await.unwrap();
    transport
        .peer()
        .respond_with(Err(ChannelError::new("Transport closed while reading")));

    let err = instance.read_resource("file:///tmp/a").await.unwrap_err();

    assert_eq!(uniform_kind(&err), ErrorKind::ConnectionClosed);
    assert!(!instance.is_connected());
}

#[tokio::test]
async fn test_mid_call_close_demotes_instance() {
    let (instance, transport) = alpha();
    instance.connect(None, None, None).await.unwrap();
    let peer = Arc::clone(transport.peer());
    peer.hold_requests();

    let call = tokio::spawn({
        let instance = Arc::clone(&instance);
        async move { instance.call_tool("slow", Some(json!({ "n": 1 }))).await }
    });
    assert!(wait::until(Duration::from_secs(5), || peer.in_flight() == 1).await);
    assert!(instance.is_connected());

    peer.drop_connection();
    let err = call.await.unwrap().unwrap_err();

    assert_eq!(uniform_kind(&err), ErrorKind::ConnectionClosed);
    assert!(!instance.is_connected());
}

#[tokio::test]
async fn test_stale_failure_does_not_demote_new_connection() {
    let (instance, transport) = alpha();
    instance.connect(None, None, None).await.unwrap();
    let peer = Arc::clone(transport.peer());
    peer.hold_requests();

    let call = tokio::spawn({
        let instance = Arc::clone(&instance);
        async move { instance.ping().await }
    });
    assert!(wait::until(Duration::from_secs(5), || peer.in_flight() == 1).await);

    instance.reconnect().await.unwrap();
    peer.drop_connection();
    let err = call.await.unwrap().unwrap_err();

    assert_eq!(uniform_kind(&err), ErrorKind::ConnectionClosed);
    let state = instance.state();
    assert!(state.connected, "newer connection must survive");
    assert_eq!(state.error_count, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_demotion_racing_reconnect_never_strands_instance() {
    let (instance, transport) = alpha();
    let peer = Arc::clone(transport.peer());

    for _ in 0..200 {
        instance.connect(None, None, None).await.unwrap();
        peer.drop_connection();

        let failing = tokio::spawn({
            let instance = Arc::clone(&instance);
            async move { instance.ping().await }
        });
        let reconnecting = tokio::spawn({
            let instance = Arc::clone(&instance);
            async move {
                for _ in 0..8 {
                    instance.connect(None, None, None).await?;
                    tokio::task::yield_now().await;
                }
                Ok::<_, Error>(())
            }
        });
        let _ = failing.await.unwrap();
        reconnecting.await.unwrap().unwrap();

        // A connected instance must always have a usable channel.
        peer.restore();
        instance.connect(None, None, None).await.unwrap();
        instance.ping().await.unwrap();
    }
}

// ============================================================================
// Counters
// ============================================================================

#[tokio::test]
async fn test_counters_track_calls_and_reset_on_connect() {
    let (instance, transport) = alpha();
    instance.connect(None, None, None).await.unwrap();

    instance.ping().await.unwrap();
    instance.list_tools().await.unwrap();
    instance.list_prompts().await.unwrap();
    transport
        .peer()
        .respond_with(Err(ChannelError::new("tool exploded")));
    let _ = instance.call_tool("boom", None).await;

    let state = instance.state();
    assert_eq!(state.request_count, 3);
    assert_eq!(state.error_count, 1);
    assert!(state.last_response_time_ms.is_some());

    // Disconnect keeps them...
    instance.disconnect().await.unwrap();
    assert_eq!(instance.state().request_count, 3);

    // ...a successful connect resets them.
    instance.connect(None, None, None).await.unwrap();
    let state = instance.state();
    assert_eq!(state.request_count, 0);
    assert_eq!(state.error_count, 0);
    assert_eq!(state.last_error, None);
}

#[tokio::test]
async fn test_ping_stamps_last_ping() {
    let (instance, _transport) = alpha();
    instance.connect(None, None, None).await.unwrap();
    assert!(instance.state().last_ping_at.is_none());

    instance.ping().await.unwrap();

    assert!(instance.state().last_ping_at.is_some());
}

// ============================================================================
// Request shapes
// ============================================================================

#[tokio::test]
async fn test_request_params_shapes() {
    let (instance, transport) = alpha();
    instance.connect(None, None, None).await.unwrap();

    instance.call_tool("echo", None).await.unwrap();
    instance
        .get_prompt("greet", Some(json!({ "who": "fleet" })))
        .await
        .unwrap();
    instance.complete_text("greet", "who", "fl").await.unwrap();

    let received = transport.peer().received();
    assert_eq!(received[0], (methods::CALL_TOOL.to_string(), json!({ "name": "echo" })));
    assert_eq!(
        received[1],
        (
            methods::GET_PROMPT.to_string(),
            json!({ "name": "greet", "arguments": { "who": "fleet" } })
        )
    );
    assert_eq!(
        received[2],
        (
            methods::COMPLETE.to_string(),
            json!({
                "ref": { "type": "ref/prompt", "name": "greet" },
                "argument": { "name": "who", "value": "fl" }
            })
        )
    );
}

#[tokio::test]
async fn test_status_snapshot() {
    let (instance, _transport) = alpha();
    instance.connect(None, None, None).await.unwrap();
    instance.ping().await.unwrap();

    let status = instance.status();

    assert_eq!(status.name, "alpha");
    assert_eq!(status.display_name, "Alpha");
    assert_eq!(status.role, InstanceRole::Client);
    assert!(status.connected);
    assert_eq!(status.request_count, 1);
    assert!(status.uptime_secs.is_some());
}
