mod support;

use std::sync::{Arc, Mutex};

use mgate_core::plugin::ShortCircuit;
use mgate_core::{ErrorKind, Gateway, GatewayConfig, GatewayError, Provider};
use mgate_provider_core::AdapterRegistry;

use support::*;

async fn gateway_with(
    adapter: Arc<MockAdapter>,
    account: Arc<MockAccount>,
    plugins: Vec<Arc<dyn mgate_core::plugin::Plugin>>,
) -> Arc<Gateway> {
    let mut registry = AdapterRegistry::new();
    registry.register(adapter);
    Gateway::init(GatewayConfig::new(account, registry).with_plugins(plugins))
        .await
        .unwrap()
}

fn fixture() -> (Arc<MockAdapter>, Arc<MockAccount>) {
    let adapter = MockAdapter::new(Provider::OpenAI);
    let account = MockAccount::new().with_provider(
        Provider::OpenAI,
        small_config(1, 4),
        vec![test_key("k1")],
    );
    (adapter, account)
}

#[tokio::test]
async fn post_hooks_run_in_reverse_registration_order() {
    let (adapter, account) = fixture();
    adapter.push(Behavior::Respond(ok_response("r1")));
    let log = Arc::new(Mutex::new(Vec::new()));
    let plugins: Vec<Arc<dyn mgate_core::plugin::Plugin>> = vec![
        RecordingPlugin::new("p1", log.clone()),
        RecordingPlugin::new("p2", log.clone()),
        RecordingPlugin::new("p3", log.clone()),
    ];
    let gateway = gateway_with(adapter, account, plugins).await;

    gateway
        .chat_completion(None, chat_request(Provider::OpenAI, "gpt-4o"))
        .await
        .unwrap();

    assert_eq!(
        log.lock().unwrap().clone(),
        vec!["pre:p1", "pre:p2", "pre:p3", "post:p3", "post:p2", "post:p1"]
    );
    gateway.shutdown().await;
}

#[tokio::test]
async fn short_circuit_limits_post_hooks_to_the_executed_prefix() {
    let (adapter, account) = fixture();
    let log = Arc::new(Mutex::new(Vec::new()));
    let plugins: Vec<Arc<dyn mgate_core::plugin::Plugin>> = vec![
        RecordingPlugin::new("p1", log.clone()),
        RecordingPlugin::short_circuiting(
            "p2",
            log.clone(),
            ShortCircuit::Response(ok_response("cached")),
        ),
        RecordingPlugin::new("p3", log.clone()),
    ];
    let gateway = gateway_with(adapter.clone(), account, plugins).await;

    let resp = gateway
        .chat_completion(None, chat_request(Provider::OpenAI, "gpt-4o"))
        .await
        .unwrap();

    assert_eq!(resp.id.as_deref(), Some("cached"));
    // p3's pre-hook never ran, so neither does its post-hook; the adapter
    // is never consulted.
    assert_eq!(
        log.lock().unwrap().clone(),
        vec!["pre:p1", "pre:p2", "post:p2", "post:p1"]
    );
    assert_eq!(adapter.calls(), 0);
    gateway.shutdown().await;
}

#[tokio::test]
async fn error_short_circuit_is_tagged_and_runs_post_hooks() {
    let (adapter, account) = fixture();
    let log = Arc::new(Mutex::new(Vec::new()));
    let plugins: Vec<Arc<dyn mgate_core::plugin::Plugin>> = vec![
        RecordingPlugin::new("p1", log.clone()),
        RecordingPlugin::short_circuiting(
            "gatekeeper",
            log.clone(),
            ShortCircuit::Error(GatewayError::validation("blocked by policy")),
        ),
    ];
    let gateway = gateway_with(adapter.clone(), account, plugins).await;

    let err = gateway
        .chat_completion(None, chat_request(Provider::OpenAI, "gpt-4o"))
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::ShortCircuit);
    assert_eq!(err.message, "blocked by policy");
    assert_eq!(
        log.lock().unwrap().clone(),
        vec!["pre:p1", "pre:gatekeeper", "post:gatekeeper", "post:p1"]
    );
    assert_eq!(adapter.calls(), 0);
    gateway.shutdown().await;
}

#[tokio::test]
async fn plugin_internal_errors_never_fail_the_request() {
    let (adapter, account) = fixture();
    adapter.push(Behavior::Respond(ok_response("r1")));
    let log = Arc::new(Mutex::new(Vec::new()));
    let plugins: Vec<Arc<dyn mgate_core::plugin::Plugin>> =
        vec![RecordingPlugin::failing_pre_hook("flaky", log.clone())];
    let gateway = gateway_with(adapter.clone(), account, plugins).await;

    let resp = gateway
        .chat_completion(None, chat_request(Provider::OpenAI, "gpt-4o"))
        .await
        .unwrap();

    assert_eq!(resp.id.as_deref(), Some("r1"));
    // The flaky plugin still gets its symmetric post-hook.
    assert_eq!(log.lock().unwrap().clone(), vec!["pre:flaky", "post:flaky"]);
    assert_eq!(adapter.calls(), 1);
    gateway.shutdown().await;
}

#[tokio::test]
async fn post_hook_recovery_turns_an_error_into_a_response() {
    let (adapter, account) = fixture();
    adapter.push(Behavior::Fail(upstream_error(500, "boom")));
    let log = Arc::new(Mutex::new(Vec::new()));
    let plugins: Vec<Arc<dyn mgate_core::plugin::Plugin>> =
        vec![RecordingPlugin::recovering("recovery", log, ok_response("rescued"))];
    let gateway = gateway_with(adapter, account, plugins).await;

    let resp = gateway
        .chat_completion(None, chat_request(Provider::OpenAI, "gpt-4o"))
        .await
        .unwrap();
    assert_eq!(resp.id.as_deref(), Some("rescued"));
    gateway.shutdown().await;
}

#[tokio::test]
async fn register_then_remove_cleans_up_exactly_once() {
    let (adapter, account) = fixture();
    let log = Arc::new(Mutex::new(Vec::new()));
    let plugins: Vec<Arc<dyn mgate_core::plugin::Plugin>> =
        vec![RecordingPlugin::new("observer", log.clone())];
    let gateway = gateway_with(adapter, account, plugins).await;

    gateway.remove_plugin("observer").await.unwrap();
    assert!(gateway.remove_plugin("observer").await.is_err());

    let cleanups = log
        .lock()
        .unwrap()
        .iter()
        .filter(|entry| entry.as_str() == "cleanup:observer")
        .count();
    assert_eq!(cleanups, 1);

    // Shutdown must not clean the removed plugin a second time.
    gateway.shutdown().await;
    let cleanups = log
        .lock()
        .unwrap()
        .iter()
        .filter(|entry| entry.as_str() == "cleanup:observer")
        .count();
    assert_eq!(cleanups, 1);
}

#[tokio::test]
async fn reload_swaps_a_plugin_without_tearing_inflight_snapshots() {
    let (adapter, account) = fixture();
    adapter.push(Behavior::Respond(ok_response("r1")));
    adapter.push(Behavior::Respond(ok_response("r2")));
    let log = Arc::new(Mutex::new(Vec::new()));
    let plugins: Vec<Arc<dyn mgate_core::plugin::Plugin>> =
        vec![RecordingPlugin::new("tracer", log.clone())];
    let gateway = gateway_with(adapter, account, plugins).await;

    gateway
        .chat_completion(None, chat_request(Provider::OpenAI, "gpt-4o"))
        .await
        .unwrap();

    let replacement_log = Arc::new(Mutex::new(Vec::new()));
    gateway
        .reload_plugin(RecordingPlugin::new("tracer", replacement_log.clone()))
        .await;

    // The displaced instance is cleaned; the replacement serves traffic.
    assert!(
        log.lock()
            .unwrap()
            .iter()
            .any(|entry| entry == "cleanup:tracer")
    );
    gateway
        .chat_completion(None, chat_request(Provider::OpenAI, "gpt-4o"))
        .await
        .unwrap();
    assert_eq!(
        replacement_log.lock().unwrap().clone(),
        vec!["pre:tracer", "post:tracer"]
    );
    gateway.shutdown().await;
}
