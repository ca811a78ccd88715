use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arc_swap::ArcSwap;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use mgate_common::{
    ErrorKind, GatewayError, GatewayResult, Provider, RequestContext, RequestKind, keys,
};
use mgate_mcp::{McpClientConfig, McpClientStatus, McpConfig, McpManager, ToolHandler};
use mgate_protocol::{ChatMessage, GatewayRequest, GatewayResponse, ResponseExtra, ToolCall};
use mgate_provider_core::{
    AccountSource, AdapterRegistry, ChunkReceiver, KeySelector, PassthroughChunkHook,
    StreamChunkHook, WeightedRandomSelector,
};

use crate::message::{CarrierPools, ChannelMessage};
use crate::plugin::{ChunkHookRunner, HookOutcome, Plugin, PluginRegistry, ShortCircuit};
use crate::worker::{WorkerGroup, WorkerShared};

/// Everything the gateway needs at construction.
pub struct GatewayConfig {
    pub account: Arc<dyn AccountSource>,
    pub adapters: AdapterRegistry,
    pub plugins: Vec<Arc<dyn Plugin>>,
    pub mcp: Option<McpConfig>,
    /// Pre-warm count for each object pool.
    pub initial_pool_size: usize,
    pub drop_excess_requests: bool,
}

impl GatewayConfig {
    pub fn new(account: Arc<dyn AccountSource>, adapters: AdapterRegistry) -> Self {
        Self {
            account,
            adapters,
            plugins: Vec::new(),
            mcp: None,
            initial_pool_size: 64,
            drop_excess_requests: false,
        }
    }

    pub fn with_plugins(mut self, plugins: Vec<Arc<dyn Plugin>>) -> Self {
        self.plugins = plugins;
        self
    }

    pub fn with_mcp(mut self, mcp: McpConfig) -> Self {
        self.mcp = Some(mcp);
        self
    }

    pub fn with_drop_excess_requests(mut self, drop: bool) -> Self {
        self.drop_excess_requests = drop;
        self
    }

    pub fn with_initial_pool_size(mut self, size: usize) -> Self {
        self.initial_pool_size = size;
        self
    }
}

/// The dispatch engine and root object of the gateway.
///
/// All shared state hangs off this struct; there are no ambient singletons.
pub struct Gateway {
    account: Arc<dyn AccountSource>,
    adapters: AdapterRegistry,
    plugins: Arc<PluginRegistry>,
    selector: Arc<dyn KeySelector>,
    mcp: Option<Arc<McpManager>>,
    providers: ArcSwap<HashMap<Provider, Arc<WorkerGroup>>>,
    /// Serialises lazy worker-group creation (double-checked under it).
    provider_init_lock: Mutex<()>,
    pools: CarrierPools,
    drop_excess_requests: AtomicBool,
    root_ctx: RequestContext,
    shutting_down: AtomicBool,
}

impl Gateway {
    pub async fn init(config: GatewayConfig) -> GatewayResult<Arc<Self>> {
        let selector = config
            .account
            .key_selector()
            .unwrap_or_else(|| Arc::new(WeightedRandomSelector));
        let mcp = match config.mcp {
            Some(mcp_config) => Some(McpManager::from_config(mcp_config).await),
            None => None,
        };

        let gateway = Arc::new(Self {
            account: config.account,
            adapters: config.adapters,
            plugins: Arc::new(PluginRegistry::new(config.plugins)),
            selector,
            mcp,
            providers: ArcSwap::from_pointee(HashMap::new()),
            provider_init_lock: Mutex::new(()),
            pools: CarrierPools::new(config.initial_pool_size),
            drop_excess_requests: AtomicBool::new(config.drop_excess_requests),
            root_ctx: RequestContext::background(),
            shutting_down: AtomicBool::new(false),
        });

        // Providers listed by the account start eagerly; anything else (a
        // fallback target, say) is created lazily on first use.
        for provider in gateway.account.configured_providers().await? {
            if let Err(err) = gateway.ensure_provider(&provider).await {
                warn!(provider = %provider, error = %err, "provider failed to start at init");
            }
        }
        Ok(gateway)
    }

    // ---- Public request entry points, one per kind ----

    pub async fn text_completion(
        &self,
        ctx: Option<RequestContext>,
        req: GatewayRequest,
    ) -> GatewayResult<GatewayResponse> {
        self.execute_kind(ctx, req, RequestKind::TextCompletion).await
    }

    pub async fn text_completion_stream(
        &self,
        ctx: Option<RequestContext>,
        req: GatewayRequest,
    ) -> GatewayResult<ChunkReceiver> {
        self.execute_stream_kind(ctx, req, RequestKind::TextCompletionStream)
            .await
    }

    pub async fn chat_completion(
        &self,
        ctx: Option<RequestContext>,
        req: GatewayRequest,
    ) -> GatewayResult<GatewayResponse> {
        self.execute_kind(ctx, req, RequestKind::ChatCompletion).await
    }

    pub async fn chat_completion_stream(
        &self,
        ctx: Option<RequestContext>,
        req: GatewayRequest,
    ) -> GatewayResult<ChunkReceiver> {
        self.execute_stream_kind(ctx, req, RequestKind::ChatCompletionStream)
            .await
    }

    pub async fn responses(
        &self,
        ctx: Option<RequestContext>,
        req: GatewayRequest,
    ) -> GatewayResult<GatewayResponse> {
        self.execute_kind(ctx, req, RequestKind::Responses).await
    }

    pub async fn responses_stream(
        &self,
        ctx: Option<RequestContext>,
        req: GatewayRequest,
    ) -> GatewayResult<ChunkReceiver> {
        self.execute_stream_kind(ctx, req, RequestKind::ResponsesStream)
            .await
    }

    pub async fn embedding(
        &self,
        ctx: Option<RequestContext>,
        req: GatewayRequest,
    ) -> GatewayResult<GatewayResponse> {
        self.execute_kind(ctx, req, RequestKind::Embedding).await
    }

    pub async fn speech(
        &self,
        ctx: Option<RequestContext>,
        req: GatewayRequest,
    ) -> GatewayResult<GatewayResponse> {
        self.execute_kind(ctx, req, RequestKind::Speech).await
    }

    pub async fn speech_stream(
        &self,
        ctx: Option<RequestContext>,
        req: GatewayRequest,
    ) -> GatewayResult<ChunkReceiver> {
        self.execute_stream_kind(ctx, req, RequestKind::SpeechStream).await
    }

    pub async fn transcription(
        &self,
        ctx: Option<RequestContext>,
        req: GatewayRequest,
    ) -> GatewayResult<GatewayResponse> {
        self.execute_kind(ctx, req, RequestKind::Transcription).await
    }

    pub async fn transcription_stream(
        &self,
        ctx: Option<RequestContext>,
        req: GatewayRequest,
    ) -> GatewayResult<ChunkReceiver> {
        self.execute_stream_kind(ctx, req, RequestKind::TranscriptionStream)
            .await
    }

    async fn execute_kind(
        &self,
        ctx: Option<RequestContext>,
        req: GatewayRequest,
        expected: RequestKind,
    ) -> GatewayResult<GatewayResponse> {
        if req.kind() != expected {
            return Err(self.kind_mismatch(&req, expected));
        }
        self.execute(ctx, req).await
    }

    async fn execute_stream_kind(
        &self,
        ctx: Option<RequestContext>,
        req: GatewayRequest,
        expected: RequestKind,
    ) -> GatewayResult<ChunkReceiver> {
        if req.kind() != expected {
            return Err(self.kind_mismatch(&req, expected));
        }
        self.execute_stream(ctx, req).await
    }

    fn kind_mismatch(&self, req: &GatewayRequest, expected: RequestKind) -> GatewayError {
        GatewayError::validation(format!(
            "payload kind {} does not match the {} entry point",
            req.kind(),
            expected
        ))
        .with_origin(req.provider.clone(), &req.model, req.kind())
    }

    /// Unary dispatch: primary attempt, then the ordered fallback chain.
    /// If every fallback fails the surfaced error is the primary's.
    pub async fn execute(
        &self,
        ctx: Option<RequestContext>,
        req: GatewayRequest,
    ) -> GatewayResult<GatewayResponse> {
        let ctx = ctx.unwrap_or_else(|| self.root_ctx.child());
        self.validate(&req, false)?;

        let primary_err = match self.attempt_unary(&ctx, &req).await {
            Ok(resp) => return Ok(resp),
            Err(err) => err,
        };
        if !should_try_fallbacks(&primary_err, &req) {
            return Err(primary_err);
        }

        for fallback in &req.fallbacks {
            if !self.fallback_has_keys(&fallback.provider).await {
                debug!(provider = %fallback.provider, "skipping fallback with no configured keys");
                continue;
            }
            let fb_req = req.with_target(fallback.provider.clone(), &fallback.model);
            ctx.insert(keys::FALLBACK_REQUEST_ID, &Uuid::new_v4().to_string());
            match self.attempt_unary(&ctx, &fb_req).await {
                Ok(resp) => return Ok(resp),
                Err(err) => {
                    if !continue_after_fallback_error(&err) {
                        break;
                    }
                }
            }
        }
        Err(primary_err)
    }

    /// Stream dispatch; identical policy, the sink waited on is the
    /// stream-of-stream sink.
    pub async fn execute_stream(
        &self,
        ctx: Option<RequestContext>,
        req: GatewayRequest,
    ) -> GatewayResult<ChunkReceiver> {
        let ctx = ctx.unwrap_or_else(|| self.root_ctx.child());
        self.validate(&req, true)?;

        let primary_err = match self.attempt_stream(&ctx, &req).await {
            Ok(stream) => return Ok(stream),
            Err(err) => err,
        };
        if !should_try_fallbacks(&primary_err, &req) {
            return Err(primary_err);
        }

        for fallback in &req.fallbacks {
            if !self.fallback_has_keys(&fallback.provider).await {
                debug!(provider = %fallback.provider, "skipping fallback with no configured keys");
                continue;
            }
            let fb_req = req.with_target(fallback.provider.clone(), &fallback.model);
            ctx.insert(keys::FALLBACK_REQUEST_ID, &Uuid::new_v4().to_string());
            match self.attempt_stream(&ctx, &fb_req).await {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    if !continue_after_fallback_error(&err) {
                        break;
                    }
                }
            }
        }
        Err(primary_err)
    }

    // ---- Runtime controls ----

    /// Re-reads buffer size and concurrency from the account source and
    /// performs the queue reconfiguration handshake.
    pub async fn update_provider_concurrency(&self, provider: &Provider) -> GatewayResult<()> {
        let group = self.providers.load().get(provider).cloned().ok_or_else(|| {
            GatewayError::internal(format!("provider {provider} has no running worker group"))
        })?;
        let config = self.account.provider_config(provider).await?;
        group.reconfigure(config).await;
        Ok(())
    }

    pub fn update_drop_excess_requests(&self, drop: bool) {
        self.drop_excess_requests.store(drop, Ordering::SeqCst);
    }

    pub async fn reload_plugin(&self, plugin: Arc<dyn Plugin>) {
        self.plugins.reload(plugin).await;
    }

    pub async fn remove_plugin(&self, name: &str) -> GatewayResult<()> {
        self.plugins.remove(name).await
    }

    pub async fn register_mcp_tool(
        &self,
        name: &str,
        description: &str,
        input_schema: Value,
        handler: Arc<dyn ToolHandler>,
    ) -> GatewayResult<()> {
        self.mcp_ref()?
            .register_tool(name, description, input_schema, handler)
            .await
    }

    pub async fn execute_mcp_tool(
        &self,
        ctx: Option<RequestContext>,
        call: &ToolCall,
    ) -> GatewayResult<ChatMessage> {
        let ctx = ctx.unwrap_or_else(|| self.root_ctx.child());
        self.mcp_ref()?.execute_tool(&ctx, call).await
    }

    pub async fn add_mcp_client(&self, config: McpClientConfig) -> GatewayResult<()> {
        self.mcp_ref()?.add_client(config).await
    }

    pub async fn remove_mcp_client(&self, name: &str) -> GatewayResult<()> {
        self.mcp_ref()?.remove_client(name).await
    }

    pub async fn edit_mcp_client_tools(
        &self,
        name: &str,
        tools_to_execute: Vec<String>,
        tools_to_skip: Vec<String>,
    ) -> GatewayResult<()> {
        self.mcp_ref()?
            .edit_client_tools(name, tools_to_execute, tools_to_skip)
            .await
    }

    pub async fn reconnect_mcp_client(&self, name: &str) -> GatewayResult<()> {
        self.mcp_ref()?.reconnect_client(name).await
    }

    pub async fn get_mcp_clients(&self) -> Vec<McpClientStatus> {
        match &self.mcp {
            Some(mcp) => mcp.get_clients().await,
            None => Vec::new(),
        }
    }

    /// Close every queue, join every worker, then clean up plugins and MCP.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let providers = self.providers.load_full();
        for group in providers.values() {
            group.shutdown().await;
        }
        self.plugins.cleanup_all().await;
        if let Some(mcp) = &self.mcp {
            mcp.shutdown().await;
        }
        debug!("gateway shut down");
    }

    pub async fn provider_worker_count(&self, provider: &Provider) -> Option<usize> {
        let group = self.providers.load().get(provider).cloned()?;
        Some(group.worker_count().await)
    }

    pub async fn provider_buffer_capacity(&self, provider: &Provider) -> Option<usize> {
        let group = self.providers.load().get(provider).cloned()?;
        Some(group.buffer_capacity().await)
    }

    // ---- Internals ----

    fn mcp_ref(&self) -> GatewayResult<&Arc<McpManager>> {
        self.mcp
            .as_ref()
            .ok_or_else(|| GatewayError::mcp("mcp is not configured on this gateway"))
    }

    fn validate(&self, req: &GatewayRequest, want_stream: bool) -> GatewayResult<()> {
        let origin =
            |err: GatewayError| err.with_origin(req.provider.clone(), &req.model, req.kind());
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(origin(GatewayError::internal("gateway is shut down")));
        }
        if req.kind().is_stream() != want_stream {
            return Err(origin(GatewayError::validation(format!(
                "request kind {} is not valid for this entry point",
                req.kind()
            ))));
        }
        if req.model.is_empty() {
            return Err(origin(GatewayError::validation("model is not provided")));
        }
        req.payload
            .validate()
            .map_err(|msg| origin(GatewayError::validation(msg)))
    }

    async fn ensure_provider(&self, provider: &Provider) -> GatewayResult<Arc<WorkerGroup>> {
        if let Some(group) = self.providers.load().get(provider) {
            return Ok(Arc::clone(group));
        }
        let _guard = self.provider_init_lock.lock().await;
        if let Some(group) = self.providers.load().get(provider) {
            return Ok(Arc::clone(group));
        }
        let adapter = self.adapters.get(provider).ok_or_else(|| {
            GatewayError::internal(format!("no adapter registered for provider {provider}"))
        })?;
        let config = self.account.provider_config(provider).await?;
        let group = Arc::new(WorkerGroup::start(
            WorkerShared {
                provider: provider.clone(),
                adapter,
                account: Arc::clone(&self.account),
                selector: Arc::clone(&self.selector),
            },
            config,
        ));
        let mut map = self.providers.load().as_ref().clone();
        map.insert(provider.clone(), Arc::clone(&group));
        self.providers.store(Arc::new(map));
        Ok(group)
    }

    async fn fallback_has_keys(&self, provider: &Provider) -> bool {
        match self.account.keys_for_provider(provider).await {
            Ok(keys) if !keys.is_empty() => true,
            Ok(_) => {
                let base = match self.account.provider_config(provider).await {
                    Ok(config) => config.base_provider_for(provider),
                    Err(_) => provider.clone(),
                };
                base.accepts_empty_key()
            }
            Err(_) => false,
        }
    }

    async fn inject_mcp_tools(&self, ctx: &RequestContext, req: &mut GatewayRequest) {
        let Some(mcp) = &self.mcp else { return };
        if !req.kind().supports_tools() {
            return;
        }
        let discovered = mcp.tools_for_request(ctx).await;
        if discovered.is_empty() {
            return;
        }
        if let Some(tools) = req.payload.tools_mut() {
            for tool in discovered {
                // Tools the request already declares win by name.
                if !tools.iter().any(|t| t.function.name == tool.function.name) {
                    tools.push(tool);
                }
            }
        }
    }

    fn decorate(
        &self,
        mut resp: GatewayResponse,
        req: &GatewayRequest,
        ctx: &RequestContext,
    ) -> GatewayResponse {
        resp.extra = ResponseExtra {
            provider: Some(req.provider.clone()),
            model_requested: Some(req.model.clone()),
            request_kind: Some(req.kind()),
            selected_key_id: ctx.get(keys::SELECTED_KEY_ID),
            fallback_request_id: ctx.get(keys::FALLBACK_REQUEST_ID),
        };
        resp
    }

    /// One unary pass: enqueue on the provider queue, wait on the sinks,
    /// run post-hooks symmetric to the pre-hooks that executed.
    async fn attempt_unary(
        &self,
        ctx: &RequestContext,
        req: &GatewayRequest,
    ) -> GatewayResult<GatewayResponse> {
        let kind = req.kind();
        let origin =
            |err: GatewayError| err.with_origin(req.provider.clone(), &req.model, kind);
        let group = self.ensure_provider(&req.provider).await.map_err(&origin)?;

        let mut req = req.clone();
        self.inject_mcp_tools(ctx, &mut req).await;

        let mut scratch = self.pools.get_scratch();
        scratch.attach(self.plugins.snapshot());

        let attempt_result = match scratch.run_pre_hooks(ctx, &mut req).await {
            Some(ShortCircuit::Response(resp)) => Ok(resp),
            Some(ShortCircuit::Error(mut err)) => {
                err.kind = ErrorKind::ShortCircuit;
                Err(origin(err))
            }
            Some(ShortCircuit::Stream(_)) => Err(origin(GatewayError::internal(
                "a pre-hook returned a stream for a unary request",
            ))),
            None => self.dispatch_unary(ctx, &req, &group).await,
        };

        let attempt_result = attempt_result.map(|resp| self.decorate(resp, &req, ctx));
        let mut outcome = HookOutcome::from_result(attempt_result);
        scratch.run_post_hooks(ctx, &mut outcome).await;
        self.pools.put_scratch(scratch);
        outcome.into_result()
    }

    async fn dispatch_unary(
        &self,
        ctx: &RequestContext,
        req: &GatewayRequest,
        group: &WorkerGroup,
    ) -> GatewayResult<GatewayResponse> {
        let kind = req.kind();
        let origin =
            |err: GatewayError| err.with_origin(req.provider.clone(), &req.model, kind);
        let mut carrier = self.pools.get_carrier(kind);

        let msg = ChannelMessage {
            req: req.clone(),
            ctx: ctx.clone(),
            response_tx: carrier.response_tx.clone(),
            error_tx: carrier.error_tx.clone(),
            stream_tx: None,
            chunk_hooks: Arc::new(PassthroughChunkHook),
        };
        let drop_excess = self.drop_excess_requests.load(Ordering::Relaxed);
        if let Err(err) = group.enqueue(msg, drop_excess).await {
            self.pools.put_carrier(carrier);
            return Err(origin(err));
        }

        let result = tokio::select! {
            resp = carrier.response_rx.recv() => match resp {
                Some(resp) => Ok(resp),
                None => Err(origin(GatewayError::internal("response sink closed unexpectedly"))),
            },
            err = carrier.error_rx.recv() => match err {
                Some(err) => Err(err),
                None => Err(origin(GatewayError::internal("error sink closed unexpectedly"))),
            },
            _ = ctx.cancelled() => Err(origin(GatewayError::cancelled())),
        };

        if matches!(&result, Err(err) if err.is_cancelled()) {
            // A late worker may still write into an abandoned carrier; let
            // the channels die with it instead of pooling them.
            drop(carrier);
        } else {
            self.pools.put_carrier(carrier);
        }
        result
    }

    /// One streaming pass. On an error after the worker accepted, the engine
    /// flags end-of-stream and gives post-hooks the chance to recover with a
    /// final synthetic response delivered as a one-shot stream.
    async fn attempt_stream(
        &self,
        ctx: &RequestContext,
        req: &GatewayRequest,
    ) -> GatewayResult<ChunkReceiver> {
        let kind = req.kind();
        let origin =
            |err: GatewayError| err.with_origin(req.provider.clone(), &req.model, kind);
        let group = self.ensure_provider(&req.provider).await.map_err(&origin)?;

        let mut req = req.clone();
        self.inject_mcp_tools(ctx, &mut req).await;

        let mut scratch = self.pools.get_scratch();
        scratch.attach(self.plugins.snapshot());

        match scratch.run_pre_hooks(ctx, &mut req).await {
            Some(ShortCircuit::Response(resp)) => {
                let mut outcome = HookOutcome {
                    response: Some(resp),
                    error: None,
                };
                scratch.run_post_hooks(ctx, &mut outcome).await;
                self.pools.put_scratch(scratch);
                outcome
                    .into_result()
                    .map(|resp| one_shot_stream(self.decorate(resp, &req, ctx)))
            }
            Some(ShortCircuit::Error(mut err)) => {
                err.kind = ErrorKind::ShortCircuit;
                let mut outcome = HookOutcome::from_result(Err(origin(err)));
                scratch.run_post_hooks(ctx, &mut outcome).await;
                self.pools.put_scratch(scratch);
                outcome
                    .into_result()
                    .map(|resp| one_shot_stream(self.decorate(resp, &req, ctx)))
            }
            Some(ShortCircuit::Stream(upstream)) => {
                // A live stream from a plugin: forward it through the same
                // per-chunk post-hook runner a worker stream would get.
                let runner = self.chunk_runner(&scratch, &req);
                self.pools.put_scratch(scratch);
                Ok(spawn_forwarder(ctx.clone(), upstream, runner))
            }
            None => {
                let runner = self.chunk_runner(&scratch, &req);
                match self.dispatch_stream(ctx, &req, &group, runner).await {
                    Ok(stream) => {
                        self.pools.put_scratch(scratch);
                        Ok(stream)
                    }
                    Err(err) => {
                        ctx.insert(keys::STREAM_END, &true);
                        let original = err.clone();
                        let mut outcome = HookOutcome::from_result(Err(err));
                        scratch.run_post_hooks(ctx, &mut outcome).await;
                        self.pools.put_scratch(scratch);
                        match (outcome.response, outcome.error) {
                            (Some(resp), None) => {
                                debug!(
                                    provider = %req.provider,
                                    model = %req.model,
                                    "stream error recovered by post-hooks"
                                );
                                Ok(one_shot_stream(self.decorate(resp, &req, ctx)))
                            }
                            (_, Some(err)) => Err(err),
                            (None, None) => Err(original),
                        }
                    }
                }
            }
        }
    }

    fn chunk_runner(
        &self,
        scratch: &crate::plugin::PipelineScratch,
        req: &GatewayRequest,
    ) -> Arc<dyn StreamChunkHook> {
        Arc::new(ChunkHookRunner::new(
            scratch
                .plugins
                .clone()
                .unwrap_or_else(|| Arc::new(Vec::new())),
            scratch.executed_pre_hooks,
            req.provider.clone(),
            req.model.clone(),
            req.kind(),
        ))
    }

    async fn dispatch_stream(
        &self,
        ctx: &RequestContext,
        req: &GatewayRequest,
        group: &WorkerGroup,
        hooks: Arc<dyn StreamChunkHook>,
    ) -> GatewayResult<ChunkReceiver> {
        let kind = req.kind();
        let origin =
            |err: GatewayError| err.with_origin(req.provider.clone(), &req.model, kind);
        let mut carrier = self.pools.get_carrier(kind);

        let msg = ChannelMessage {
            req: req.clone(),
            ctx: ctx.clone(),
            response_tx: carrier.response_tx.clone(),
            error_tx: carrier.error_tx.clone(),
            stream_tx: carrier.stream_tx.clone(),
            chunk_hooks: hooks,
        };
        let drop_excess = self.drop_excess_requests.load(Ordering::Relaxed);
        if let Err(err) = group.enqueue(msg, drop_excess).await {
            self.pools.put_carrier(carrier);
            return Err(origin(err));
        }

        let mut stream_rx = carrier
            .stream_rx
            .take()
            .expect("stream carriers always hold a stream sink");
        let result = tokio::select! {
            stream = stream_rx.recv() => match stream {
                Some(stream) => Ok(stream),
                None => Err(origin(GatewayError::internal("stream sink closed unexpectedly"))),
            },
            err = carrier.error_rx.recv() => match err {
                Some(err) => Err(err),
                None => Err(origin(GatewayError::internal("error sink closed unexpectedly"))),
            },
            _ = ctx.cancelled() => Err(origin(GatewayError::cancelled())),
        };
        carrier.stream_rx = Some(stream_rx);

        if matches!(&result, Err(err) if err.is_cancelled()) {
            drop(carrier);
        } else {
            self.pools.put_carrier(carrier);
        }
        result
    }
}

/// Fallbacks proceed only for a non-cancellation error that does not forbid
/// them, and only when there is somewhere to go.
fn should_try_fallbacks(err: &GatewayError, req: &GatewayRequest) -> bool {
    !err.is_cancelled() && err.allows_fallbacks() && !req.fallbacks.is_empty()
}

fn continue_after_fallback_error(err: &GatewayError) -> bool {
    !err.is_cancelled() && err.allows_fallbacks()
}

fn one_shot_stream(mut resp: GatewayResponse) -> ChunkReceiver {
    if resp.created.is_none() {
        resp.created = Some(time::OffsetDateTime::now_utc().unix_timestamp());
    }
    let (tx, rx) = mpsc::channel(1);
    let _ = tx.try_send(Ok(resp));
    rx
}

fn spawn_forwarder(
    ctx: RequestContext,
    mut upstream: ChunkReceiver,
    runner: Arc<dyn StreamChunkHook>,
) -> ChunkReceiver {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        while let Some(chunk) = upstream.recv().await {
            match runner.on_chunk(&ctx, chunk).await {
                Some(chunk) => {
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
                None => continue,
            }
        }
    });
    rx
}
