mod support;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use mgate_core::{ErrorKind, Gateway, GatewayConfig, Provider, RequestContext};
use mgate_provider_core::AdapterRegistry;

use support::*;

async fn gateway_with(adapter: Arc<MockAdapter>, account: Arc<MockAccount>) -> Arc<Gateway> {
    let mut registry = AdapterRegistry::new();
    registry.register(adapter);
    Gateway::init(GatewayConfig::new(account, registry))
        .await
        .unwrap()
}

async fn gateway_with_drop(
    adapter: Arc<MockAdapter>,
    account: Arc<MockAccount>,
) -> Arc<Gateway> {
    let mut registry = AdapterRegistry::new();
    registry.register(adapter);
    Gateway::init(
        GatewayConfig::new(account, registry).with_drop_excess_requests(true),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn one_worker_preserves_submission_order() {
    let adapter = MockAdapter::new(Provider::OpenAI);
    let account = MockAccount::new().with_provider(
        Provider::OpenAI,
        small_config(1, 8),
        vec![test_key("k1")],
    );
    let gateway = gateway_with(adapter.clone(), account).await;

    for index in 0..5 {
        gateway
            .chat_completion(None, chat_request(Provider::OpenAI, &format!("model-{index}")))
            .await
            .unwrap();
    }

    assert_eq!(
        adapter.seen_models(),
        vec!["model-0", "model-1", "model-2", "model-3", "model-4"]
    );
    gateway.shutdown().await;
}

#[tokio::test]
async fn cancellation_before_dequeue_never_calls_the_adapter() {
    // One slow in-flight request occupies the single worker; the second is
    // cancelled while it waits in the queue.
    let adapter = MockAdapter::with_delay(Provider::OpenAI, Duration::from_millis(300));
    let account = MockAccount::new().with_provider(
        Provider::OpenAI,
        small_config(1, 2),
        vec![test_key("k1")],
    );
    let gateway = gateway_with(adapter.clone(), account).await;

    let first = {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move {
            gateway
                .chat_completion(None, chat_request(Provider::OpenAI, "slow"))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let ctx = RequestContext::background();
    let second = {
        let gateway = Arc::clone(&gateway);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            gateway
                .chat_completion(Some(ctx), chat_request(Provider::OpenAI, "queued"))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    ctx.cancel();

    let err = second.await.unwrap().unwrap_err();
    assert_eq!(err.kind, ErrorKind::Cancelled);

    first.await.unwrap().unwrap();
    // Give the worker a beat to observe the cancelled message and skip it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(adapter.calls(), 1);
    assert_eq!(adapter.seen_models(), vec!["slow"]);
    gateway.shutdown().await;
}

#[tokio::test]
async fn full_queue_with_drop_policy_rejects_immediately() {
    // One in-flight plus one buffered slot; the rest must drop.
    let adapter = MockAdapter::with_delay(Provider::OpenAI, Duration::from_millis(500));
    let account = MockAccount::new().with_provider(
        Provider::OpenAI,
        small_config(1, 1),
        vec![test_key("k1")],
    );
    let gateway = gateway_with_drop(adapter.clone(), account).await;

    let mut handles = Vec::new();
    for _ in 0..10 {
        let gateway = Arc::clone(&gateway);
        handles.push(tokio::spawn(async move {
            gateway
                .chat_completion(None, chat_request(Provider::OpenAI, "gpt-4o"))
                .await
        }));
    }

    let mut accepted = 0;
    let mut dropped = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(err) => {
                assert_eq!(err.kind, ErrorKind::QueueDropped);
                dropped += 1;
            }
        }
    }

    // The in-flight request plus at most one buffered message complete.
    assert!((1..=2).contains(&accepted), "accepted {accepted}");
    assert!(dropped >= 8, "dropped {dropped}");
    gateway.shutdown().await;
}

#[tokio::test]
async fn reconfiguration_applies_worker_count_and_buffer_size() {
    let adapter = MockAdapter::new(Provider::OpenAI);
    let account = MockAccount::new().with_provider(
        Provider::OpenAI,
        small_config(2, 4),
        vec![test_key("k1")],
    );
    let gateway = gateway_with(adapter.clone(), account.clone()).await;

    assert_eq!(
        gateway.provider_worker_count(&Provider::OpenAI).await,
        Some(2)
    );
    assert_eq!(
        gateway.provider_buffer_capacity(&Provider::OpenAI).await,
        Some(4)
    );

    // Same config applied repeatedly must stay a working queue with exactly
    // the configured sizes.
    account.set_config(&Provider::OpenAI, small_config(4, 8));
    for _ in 0..3 {
        gateway
            .update_provider_concurrency(&Provider::OpenAI)
            .await
            .unwrap();
    }
    assert_eq!(
        gateway.provider_worker_count(&Provider::OpenAI).await,
        Some(4)
    );
    assert_eq!(
        gateway.provider_buffer_capacity(&Provider::OpenAI).await,
        Some(8)
    );

    adapter.push(Behavior::Respond(ok_response("after-reconfigure")));
    let resp = gateway
        .chat_completion(None, chat_request(Provider::OpenAI, "gpt-4o"))
        .await
        .unwrap();
    assert_eq!(resp.id.as_deref(), Some("after-reconfigure"));
    gateway.shutdown().await;
}

#[tokio::test]
async fn reconfiguration_keeps_queued_work() {
    // A slow worker holds the queue while a second message waits; the
    // reconfiguration must carry the queued message to the new queue.
    let adapter = MockAdapter::with_delay(Provider::OpenAI, Duration::from_millis(200));
    let account = MockAccount::new().with_provider(
        Provider::OpenAI,
        small_config(1, 4),
        vec![test_key("k1")],
    );
    let gateway = gateway_with(adapter.clone(), account.clone()).await;

    let mut handles = Vec::new();
    for index in 0..3 {
        let gateway = Arc::clone(&gateway);
        handles.push(tokio::spawn(async move {
            gateway
                .chat_completion(None, chat_request(Provider::OpenAI, &format!("m{index}")))
                .await
        }));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    account.set_config(&Provider::OpenAI, small_config(2, 4));
    gateway
        .update_provider_concurrency(&Provider::OpenAI)
        .await
        .unwrap();

    for handle in handles {
        let resp = timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(resp.id.is_some());
    }
    assert_eq!(adapter.calls(), 3);
    gateway.shutdown().await;
}

#[tokio::test]
async fn update_drop_excess_requests_flips_at_runtime() {
    let adapter = MockAdapter::with_delay(Provider::OpenAI, Duration::from_millis(300));
    let account = MockAccount::new().with_provider(
        Provider::OpenAI,
        small_config(1, 1),
        vec![test_key("k1")],
    );
    let gateway = gateway_with(adapter.clone(), account).await;

    // Fill the worker and the single buffer slot.
    let mut handles = Vec::new();
    for _ in 0..2 {
        let gateway = Arc::clone(&gateway);
        handles.push(tokio::spawn(async move {
            gateway
                .chat_completion(None, chat_request(Provider::OpenAI, "gpt-4o"))
                .await
        }));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    gateway.update_drop_excess_requests(true);
    let err = gateway
        .chat_completion(None, chat_request(Provider::OpenAI, "gpt-4o"))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::QueueDropped);

    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    gateway.shutdown().await;
}
