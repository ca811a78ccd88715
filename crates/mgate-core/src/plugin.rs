use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tracing::warn;

use mgate_common::{GatewayError, GatewayResult, RequestContext};
use mgate_protocol::{GatewayRequest, GatewayResponse};
use mgate_provider_core::ChunkReceiver;

/// A plugin's internal failure. Collected and logged by the pipeline, never
/// surfaced as the caller's error; a plugin that wants to fail the request
/// must short-circuit or rewrite the outcome instead.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct PluginError {
    pub message: String,
}

impl PluginError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A pre-hook's decision to finalise the attempt early.
pub enum ShortCircuit {
    Response(GatewayResponse),
    /// Only legal for streaming request kinds.
    Stream(ChunkReceiver),
    Error(GatewayError),
}

/// The mutable (response, error) pair post-hooks transform. A plugin
/// recovering from an error sets a response and clears the error; a plugin
/// invalidating a response does the opposite.
#[derive(Default)]
pub struct HookOutcome {
    pub response: Option<GatewayResponse>,
    pub error: Option<GatewayError>,
}

impl HookOutcome {
    pub fn from_result(result: Result<GatewayResponse, GatewayError>) -> Self {
        match result {
            Ok(response) => Self {
                response: Some(response),
                error: None,
            },
            Err(error) => Self {
                response: None,
                error: Some(error),
            },
        }
    }

    /// Collapses back to a result. An error empty of content next to a live
    /// response is treated as recovery and dropped.
    pub fn into_result(mut self) -> Result<GatewayResponse, GatewayError> {
        let empty_error_recovery = self.response.is_some()
            && matches!(&self.error, Some(err) if err.message.is_empty() && err.status_code.is_none());
        if empty_error_recovery {
            self.error = None;
        }
        match (self.response, self.error) {
            (_, Some(err)) => Err(err),
            (Some(resp), None) => Ok(resp),
            (None, None) => Err(GatewayError::internal(
                "plugin pipeline produced neither response nor error",
            )),
        }
    }
}

/// Registered middleware around an attempt.
///
/// Pre-hooks run in registration order, post-hooks in reverse; both may be
/// elided by the default bodies for plugins that only care about one side.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    async fn pre_hook(
        &self,
        _ctx: &RequestContext,
        _req: &mut GatewayRequest,
    ) -> Result<Option<ShortCircuit>, PluginError> {
        Ok(None)
    }

    async fn post_hook(
        &self,
        _ctx: &RequestContext,
        _outcome: &mut HookOutcome,
    ) -> Result<(), PluginError> {
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), PluginError> {
        Ok(())
    }
}

pub type PluginSnapshot = Arc<Vec<Arc<dyn Plugin>>>;

/// The shared plugin list: an atomic pointer to an immutable slice.
/// In-flight requests hold a snapshot; swaps can never tear a pipeline.
pub struct PluginRegistry {
    plugins: ArcSwap<Vec<Arc<dyn Plugin>>>,
}

impl PluginRegistry {
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self {
            plugins: ArcSwap::from_pointee(plugins),
        }
    }

    pub fn snapshot(&self) -> PluginSnapshot {
        self.plugins.load_full()
    }

    /// Replaces the plugin with the same name, or appends. The displaced
    /// plugin is cleaned up exactly once.
    pub async fn reload(&self, plugin: Arc<dyn Plugin>) {
        let name = plugin.name().to_string();
        let prev = self.plugins.rcu(|current| {
            let mut next: Vec<Arc<dyn Plugin>> = current.as_ref().clone();
            match next.iter_mut().find(|p| p.name() == name) {
                Some(slot) => *slot = Arc::clone(&plugin),
                None => next.push(Arc::clone(&plugin)),
            }
            next
        });
        if let Some(displaced) = prev.iter().find(|p| p.name() == name)
            && let Err(err) = displaced.cleanup().await
        {
            warn!(plugin = %name, error = %err, "displaced plugin cleanup failed");
        }
    }

    pub async fn remove(&self, name: &str) -> GatewayResult<()> {
        let prev = self.plugins.rcu(|current| {
            current
                .iter()
                .filter(|p| p.name() != name)
                .cloned()
                .collect::<Vec<_>>()
        });
        let Some(removed) = prev.iter().find(|p| p.name() == name) else {
            return Err(GatewayError::internal(format!(
                "plugin {name} is not registered"
            )));
        };
        if let Err(err) = removed.cleanup().await {
            warn!(plugin = %name, error = %err, "removed plugin cleanup failed");
        }
        Ok(())
    }

    /// Shutdown path: cleanup every registered plugin.
    pub async fn cleanup_all(&self) {
        let plugins = self.plugins.swap(Arc::new(Vec::new()));
        for plugin in plugins.iter() {
            if let Err(err) = plugin.cleanup().await {
                warn!(plugin = %plugin.name(), error = %err, "plugin cleanup failed");
            }
        }
    }
}

/// Per-attempt pipeline scratch. Pooled; reset on release.
#[derive(Default)]
pub struct PipelineScratch {
    pub plugins: Option<PluginSnapshot>,
    pub executed_pre_hooks: usize,
    pub pre_errors: Vec<(String, PluginError)>,
    pub post_errors: Vec<(String, PluginError)>,
}

impl PipelineScratch {
    pub fn reset(&mut self) {
        self.plugins = None;
        self.executed_pre_hooks = 0;
        self.pre_errors.clear();
        self.post_errors.clear();
    }

    pub fn attach(&mut self, snapshot: PluginSnapshot) {
        self.plugins = Some(snapshot);
        self.executed_pre_hooks = 0;
    }

    fn snapshot(&self) -> PluginSnapshot {
        self.plugins
            .clone()
            .unwrap_or_else(|| Arc::new(Vec::new()))
    }

    /// Runs pre-hooks in registration order. A plugin's internal error does
    /// not fail the request; a short-circuit stops the iteration.
    pub async fn run_pre_hooks(
        &mut self,
        ctx: &RequestContext,
        req: &mut GatewayRequest,
    ) -> Option<ShortCircuit> {
        let plugins = self.snapshot();
        for plugin in plugins.iter() {
            self.executed_pre_hooks += 1;
            match plugin.pre_hook(ctx, req).await {
                Ok(None) => {}
                Ok(Some(short_circuit)) => return Some(short_circuit),
                Err(err) => {
                    warn!(plugin = %plugin.name(), error = %err, "pre-hook failed");
                    self.pre_errors.push((plugin.name().to_string(), err));
                }
            }
        }
        None
    }

    /// Runs post-hooks for exactly the plugins whose pre-hook executed, in
    /// reverse order.
    pub async fn run_post_hooks(&mut self, ctx: &RequestContext, outcome: &mut HookOutcome) {
        let plugins = self.snapshot();
        let run_from = self.executed_pre_hooks.min(plugins.len());
        for plugin in plugins[..run_from].iter().rev() {
            if let Err(err) = plugin.post_hook(ctx, outcome).await {
                warn!(plugin = %plugin.name(), error = %err, "post-hook failed");
                self.post_errors.push((plugin.name().to_string(), err));
            }
        }
    }
}

/// Post-hook runner applied to each chunk of a live stream, with the same
/// reverse-prefix discipline as unary post-hooks.
pub struct ChunkHookRunner {
    plugins: PluginSnapshot,
    run_from: usize,
    provider: mgate_common::Provider,
    model: String,
    kind: mgate_common::RequestKind,
}

impl ChunkHookRunner {
    pub fn new(
        plugins: PluginSnapshot,
        run_from: usize,
        provider: mgate_common::Provider,
        model: String,
        kind: mgate_common::RequestKind,
    ) -> Self {
        let run_from = run_from.min(plugins.len());
        Self {
            plugins,
            run_from,
            provider,
            model,
            kind,
        }
    }
}

#[async_trait]
impl mgate_provider_core::StreamChunkHook for ChunkHookRunner {
    async fn on_chunk(
        &self,
        ctx: &RequestContext,
        chunk: GatewayResult<GatewayResponse>,
    ) -> Option<GatewayResult<GatewayResponse>> {
        let chunk = chunk.map(|mut resp| {
            // The key id is only known once the worker picked one; read it
            // per chunk rather than freezing it at construction.
            resp.extra = mgate_protocol::ResponseExtra {
                provider: Some(self.provider.clone()),
                model_requested: Some(self.model.clone()),
                request_kind: Some(self.kind),
                selected_key_id: ctx.get(mgate_common::keys::SELECTED_KEY_ID),
                fallback_request_id: ctx.get(mgate_common::keys::FALLBACK_REQUEST_ID),
            };
            resp
        });
        if chunk.is_err() {
            // Post-hooks may recover the error into a final chunk; flag the
            // end of stream so they know no more chunks follow.
            ctx.insert(mgate_common::keys::STREAM_END, &true);
        }
        let mut outcome = HookOutcome::from_result(chunk);
        for plugin in self.plugins[..self.run_from].iter().rev() {
            if let Err(err) = plugin.post_hook(ctx, &mut outcome).await {
                warn!(plugin = %plugin.name(), error = %err, "stream post-hook failed");
            }
        }
        match (outcome.response, outcome.error) {
            (Some(resp), None) => Some(Ok(resp)),
            (Some(resp), Some(err))
                if err.message.is_empty() && err.status_code.is_none() =>
            {
                Some(Ok(resp))
            }
            (_, Some(err)) => Some(Err(err)),
            // The plugin consumed the chunk entirely.
            (None, None) => None,
        }
    }
}
