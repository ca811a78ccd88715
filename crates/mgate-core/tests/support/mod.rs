#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use mgate_core::plugin::{HookOutcome, Plugin, PluginError, ShortCircuit};
use mgate_core::{
    AccountSource, ChunkReceiver, Credential, GatewayError, GatewayRequest, GatewayResponse,
    GatewayResult, Provider, ProviderAdapter, ProviderRuntimeConfig, RequestContext,
    StreamChunkHook, keys,
};
use mgate_protocol::{ChatDelta, ChatMessage, ChatRequest, Fallback, RequestPayload};

/// One scripted adapter outcome; consumed in order, one per call.
pub enum Behavior {
    Respond(GatewayResponse),
    Fail(GatewayError),
    Stream {
        chunks: Vec<GatewayResponse>,
        then_error: Option<GatewayError>,
    },
    FailStream(GatewayError),
}

/// Adapter test double: scripted outcomes plus call recording.
pub struct MockAdapter {
    provider: Provider,
    script: Mutex<VecDeque<Behavior>>,
    calls: AtomicUsize,
    seen_models: Mutex<Vec<String>>,
    seen_tools: Mutex<Vec<Vec<String>>>,
    delay: Option<Duration>,
}

impl MockAdapter {
    pub fn new(provider: Provider) -> Arc<Self> {
        Arc::new(Self {
            provider,
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            seen_models: Mutex::new(Vec::new()),
            seen_tools: Mutex::new(Vec::new()),
            delay: None,
        })
    }

    pub fn with_delay(provider: Provider, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            provider,
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            seen_models: Mutex::new(Vec::new()),
            seen_tools: Mutex::new(Vec::new()),
            delay: Some(delay),
        })
    }

    pub fn push(&self, behavior: Behavior) {
        self.script.lock().unwrap().push_back(behavior);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen_models(&self) -> Vec<String> {
        self.seen_models.lock().unwrap().clone()
    }

    pub fn seen_tools(&self) -> Vec<Vec<String>> {
        self.seen_tools.lock().unwrap().clone()
    }

    async fn record(&self, model: &str, req: Option<&ChatRequest>) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_models.lock().unwrap().push(model.to_string());
        if let Some(req) = req {
            self.seen_tools.lock().unwrap().push(
                req.tools
                    .iter()
                    .map(|tool| tool.function.name.clone())
                    .collect(),
            );
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn next_behavior(&self) -> Behavior {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Behavior::Respond(ok_response("default")))
    }

    fn unary_outcome(&self) -> GatewayResult<GatewayResponse> {
        match self.next_behavior() {
            Behavior::Respond(resp) => Ok(resp),
            Behavior::Fail(err) => Err(err),
            Behavior::Stream { .. } | Behavior::FailStream(_) => {
                panic!("stream behavior scripted for a unary call")
            }
        }
    }

    fn stream_outcome(
        &self,
        ctx: &RequestContext,
        hooks: Arc<dyn StreamChunkHook>,
    ) -> GatewayResult<ChunkReceiver> {
        match self.next_behavior() {
            Behavior::Stream { chunks, then_error } => {
                let (tx, rx) = mpsc::channel(8);
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    for chunk in chunks {
                        if let Some(chunk) = hooks.on_chunk(&ctx, Ok(chunk)).await
                            && tx.send(chunk).await.is_err()
                        {
                            return;
                        }
                    }
                    if let Some(err) = then_error
                        && let Some(chunk) = hooks.on_chunk(&ctx, Err(err)).await
                    {
                        let _ = tx.send(chunk).await;
                    }
                });
                Ok(rx)
            }
            Behavior::FailStream(err) | Behavior::Fail(err) => Err(err),
            Behavior::Respond(_) => panic!("unary behavior scripted for a stream call"),
        }
    }
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    fn provider(&self) -> Provider {
        self.provider.clone()
    }

    async fn chat_completion(
        &self,
        _ctx: &RequestContext,
        _key: &Credential,
        model: &str,
        req: &ChatRequest,
    ) -> GatewayResult<GatewayResponse> {
        self.record(model, Some(req)).await;
        self.unary_outcome()
    }

    async fn chat_completion_stream(
        &self,
        ctx: &RequestContext,
        _key: &Credential,
        model: &str,
        req: &ChatRequest,
        hooks: Arc<dyn StreamChunkHook>,
    ) -> GatewayResult<ChunkReceiver> {
        self.record(model, Some(req)).await;
        self.stream_outcome(ctx, hooks)
    }

    async fn embedding(
        &self,
        _ctx: &RequestContext,
        _key: &Credential,
        model: &str,
        _req: &mgate_protocol::EmbeddingRequest,
    ) -> GatewayResult<GatewayResponse> {
        self.record(model, None).await;
        self.unary_outcome()
    }
}

/// Account-source test double with hot-swappable per-provider config.
pub struct MockAccount {
    providers: Mutex<Vec<Provider>>,
    configs: Mutex<HashMap<Provider, ProviderRuntimeConfig>>,
    keys: Mutex<HashMap<Provider, Vec<Credential>>>,
}

impl MockAccount {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            providers: Mutex::new(Vec::new()),
            configs: Mutex::new(HashMap::new()),
            keys: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_provider(
        self: Arc<Self>,
        provider: Provider,
        config: ProviderRuntimeConfig,
        keys: Vec<Credential>,
    ) -> Arc<Self> {
        self.providers.lock().unwrap().push(provider.clone());
        self.configs.lock().unwrap().insert(provider.clone(), config);
        self.keys.lock().unwrap().insert(provider, keys);
        self
    }

    pub fn set_config(&self, provider: &Provider, config: ProviderRuntimeConfig) {
        self.configs
            .lock()
            .unwrap()
            .insert(provider.clone(), config);
    }

    pub fn set_keys(&self, provider: &Provider, keys: Vec<Credential>) {
        self.keys.lock().unwrap().insert(provider.clone(), keys);
    }
}

#[async_trait]
impl AccountSource for MockAccount {
    async fn configured_providers(&self) -> GatewayResult<Vec<Provider>> {
        Ok(self.providers.lock().unwrap().clone())
    }

    async fn provider_config(&self, provider: &Provider) -> GatewayResult<ProviderRuntimeConfig> {
        Ok(self
            .configs
            .lock()
            .unwrap()
            .get(provider)
            .cloned()
            .unwrap_or_default())
    }

    async fn keys_for_provider(&self, provider: &Provider) -> GatewayResult<Vec<Credential>> {
        Ok(self
            .keys
            .lock()
            .unwrap()
            .get(provider)
            .cloned()
            .unwrap_or_default())
    }
}

/// Plugin test double: records hook order and optionally short-circuits or
/// recovers errors.
pub struct RecordingPlugin {
    name: String,
    log: Arc<Mutex<Vec<String>>>,
    short_circuit: Mutex<Option<ShortCircuit>>,
    recover_with: Option<GatewayResponse>,
    fail_pre_hook: bool,
}

impl RecordingPlugin {
    pub fn new(name: &str, log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            log,
            short_circuit: Mutex::new(None),
            recover_with: None,
            fail_pre_hook: false,
        })
    }

    pub fn short_circuiting(
        name: &str,
        log: Arc<Mutex<Vec<String>>>,
        short_circuit: ShortCircuit,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            log,
            short_circuit: Mutex::new(Some(short_circuit)),
            recover_with: None,
            fail_pre_hook: false,
        })
    }

    /// Post-hook converts any error into the given response.
    pub fn recovering(
        name: &str,
        log: Arc<Mutex<Vec<String>>>,
        response: GatewayResponse,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            log,
            short_circuit: Mutex::new(None),
            recover_with: Some(response),
            fail_pre_hook: false,
        })
    }

    pub fn failing_pre_hook(name: &str, log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            log,
            short_circuit: Mutex::new(None),
            recover_with: None,
            fail_pre_hook: true,
        })
    }
}

#[async_trait]
impl Plugin for RecordingPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    async fn pre_hook(
        &self,
        _ctx: &RequestContext,
        _req: &mut GatewayRequest,
    ) -> Result<Option<ShortCircuit>, PluginError> {
        self.log.lock().unwrap().push(format!("pre:{}", self.name));
        if self.fail_pre_hook {
            return Err(PluginError::new("intentional pre-hook failure"));
        }
        Ok(self.short_circuit.lock().unwrap().take())
    }

    async fn post_hook(
        &self,
        _ctx: &RequestContext,
        outcome: &mut HookOutcome,
    ) -> Result<(), PluginError> {
        self.log.lock().unwrap().push(format!("post:{}", self.name));
        if let Some(response) = &self.recover_with
            && outcome.error.is_some()
        {
            outcome.response = Some(response.clone());
            outcome.error = None;
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), PluginError> {
        self.log
            .lock()
            .unwrap()
            .push(format!("cleanup:{}", self.name));
        Ok(())
    }
}

// ---- Fixture helpers ----

pub fn ok_response(id: &str) -> GatewayResponse {
    GatewayResponse::from_message(ChatMessage::text(
        mgate_protocol::Role::Assistant,
        "hello",
    ))
    .with_id(id)
}

pub fn delta_chunk(text: &str) -> GatewayResponse {
    GatewayResponse::from_delta(ChatDelta {
        role: None,
        content: Some(text.to_string()),
        tool_calls: Vec::new(),
    })
}

pub fn upstream_error(status: u16, message: &str) -> GatewayError {
    GatewayError::upstream(status, message)
}

pub fn chat_request(provider: Provider, model: &str) -> GatewayRequest {
    GatewayRequest::new(
        provider,
        model,
        RequestPayload::ChatCompletion(ChatRequest {
            messages: vec![ChatMessage::user("hi")],
            params: None,
            tools: Vec::new(),
        }),
    )
}

pub fn chat_stream_request(provider: Provider, model: &str) -> GatewayRequest {
    GatewayRequest::new(
        provider,
        model,
        RequestPayload::ChatCompletionStream(ChatRequest {
            messages: vec![ChatMessage::user("hi")],
            params: None,
            tools: Vec::new(),
        }),
    )
}

pub fn fallback(provider: Provider, model: &str) -> Fallback {
    Fallback {
        provider,
        model: model.to_string(),
    }
}

pub fn small_config(concurrency: usize, buffer_size: usize) -> ProviderRuntimeConfig {
    ProviderRuntimeConfig {
        concurrency,
        buffer_size,
        ..ProviderRuntimeConfig::default()
    }
}

pub fn retrying_config(max_retries: u32) -> ProviderRuntimeConfig {
    let mut config = small_config(1, 4);
    config.network.max_retries = max_retries;
    config.network.retry_backoff_initial_ms = 5;
    config.network.retry_backoff_max_ms = 20;
    config
}

pub fn test_key(id: &str) -> Credential {
    Credential::new(id, "secret")
}

pub fn direct_key_ctx(key: &Credential) -> RequestContext {
    let ctx = RequestContext::background();
    ctx.insert(keys::DIRECT_KEY, key);
    ctx
}
