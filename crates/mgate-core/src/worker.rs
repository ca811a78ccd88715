use std::sync::Arc;
use std::time::Duration;

use async_channel::{Receiver, Sender, TrySendError};
use rand::Rng;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use mgate_common::{ErrorKind, GatewayError, GatewayResult, Provider, RequestContext, keys};
use mgate_protocol::{GatewayResponse, RequestPayload};
use mgate_provider_core::{
    AccountSource, ChunkReceiver, Credential, KeySelector, NetworkConfig, ProviderAdapter,
    ProviderRuntimeConfig, StreamChunkHook, select_key,
};

use crate::message::{ChannelMessage, write_sink};

/// Safety-net error text for messages displaced by a queue reconfiguration.
const RECONFIGURE_FAILURE_MESSAGE: &str = "request failed during provider concurrency update";

/// Dependencies every worker of one provider shares.
pub(crate) struct WorkerShared {
    pub provider: Provider,
    pub adapter: Arc<dyn ProviderAdapter>,
    pub account: Arc<dyn AccountSource>,
    pub selector: Arc<dyn KeySelector>,
}

struct QueueState {
    tx: Sender<ChannelMessage>,
    rx: Receiver<ChannelMessage>,
    tracker: TaskTracker,
    stop: CancellationToken,
    config: ProviderRuntimeConfig,
}

impl QueueState {
    fn spawn(shared: &Arc<WorkerShared>, config: ProviderRuntimeConfig) -> Self {
        let (tx, rx) = async_channel::bounded(config.buffer_size.max(1));
        let tracker = TaskTracker::new();
        let stop = CancellationToken::new();
        for worker_id in 0..config.concurrency.max(1) {
            tracker.spawn(run_worker(
                Arc::clone(shared),
                config.clone(),
                rx.clone(),
                stop.clone(),
                worker_id,
            ));
        }
        tracker.close();
        Self {
            tx,
            rx,
            tracker,
            stop,
            config,
        }
    }
}

/// One provider's bounded queue and worker pool.
///
/// The write lock serialises reconfiguration: while it is held no new
/// enqueue can take the old queue reference; workers holding a stale
/// receiver finish their in-flight message and exit.
pub(crate) struct WorkerGroup {
    provider: Provider,
    shared: Arc<WorkerShared>,
    state: RwLock<QueueState>,
}

impl WorkerGroup {
    pub fn start(shared: WorkerShared, config: ProviderRuntimeConfig) -> Self {
        let provider = shared.provider.clone();
        let shared = Arc::new(shared);
        let state = QueueState::spawn(&shared, config);
        debug!(provider = %provider, "provider worker group started");
        Self {
            provider,
            shared,
            state,
        }
    }

    pub async fn enqueue(&self, msg: ChannelMessage, drop_excess: bool) -> GatewayResult<()> {
        let tx = { self.state.read().await.tx.clone() };
        let ctx = msg.ctx.clone();

        if drop_excess {
            return match tx.try_send(msg) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => Err(GatewayError::queue_dropped(&self.provider)),
                Err(TrySendError::Closed(_)) => Err(closed_queue_error(&self.provider)),
            };
        }

        tokio::select! {
            sent = tx.send(msg) => sent.map_err(|_| closed_queue_error(&self.provider)),
            _ = ctx.cancelled() => Err(GatewayError::cancelled()),
        }
    }

    /// Replaces queue and workers without losing accepted work.
    ///
    /// Old workers are stopped and joined (each finishes the message it
    /// holds), the old queue's backlog is transferred to the new queue, and
    /// only then does the new worker pool start. Transfers that cannot fit
    /// within the sink-write budget answer their caller with a safety-net
    /// error instead of disappearing.
    pub async fn reconfigure(&self, config: ProviderRuntimeConfig) {
        let mut state = self.state.write().await;
        debug!(
            provider = %self.provider,
            concurrency = config.concurrency,
            buffer_size = config.buffer_size,
            "reconfiguring provider worker group"
        );

        let (new_tx, new_rx) = async_channel::bounded(config.buffer_size.max(1));

        state.stop.cancel();
        state.tracker.wait().await;

        state.tx.close();
        while let Ok(msg) = state.rx.try_recv() {
            transfer_message(msg, &new_tx).await;
        }

        let tracker = TaskTracker::new();
        let stop = CancellationToken::new();
        for worker_id in 0..config.concurrency.max(1) {
            tracker.spawn(run_worker(
                Arc::clone(&self.shared),
                config.clone(),
                new_rx.clone(),
                stop.clone(),
                worker_id,
            ));
        }
        tracker.close();

        *state = QueueState {
            tx: new_tx,
            rx: new_rx,
            tracker,
            stop,
            config,
        };
    }

    /// Shutdown: close the queue, let workers drain the backlog, join them.
    pub async fn shutdown(&self) {
        let state = self.state.write().await;
        state.tx.close();
        state.tracker.wait().await;
        debug!(provider = %self.provider, "provider worker group drained");
    }

    pub async fn worker_count(&self) -> usize {
        self.state.read().await.tracker.len()
    }

    pub async fn buffer_capacity(&self) -> usize {
        self.state.read().await.tx.capacity().unwrap_or(0)
    }

    pub async fn config(&self) -> ProviderRuntimeConfig {
        self.state.read().await.config.clone()
    }
}

fn closed_queue_error(provider: &Provider) -> GatewayError {
    GatewayError::internal(format!("provider {provider} queue is closed"))
}

async fn transfer_message(msg: ChannelMessage, new_tx: &Sender<ChannelMessage>) {
    let deadline = tokio::time::Instant::now() + crate::message::SINK_WRITE_TIMEOUT;
    let mut msg = msg;
    loop {
        match new_tx.try_send(msg) {
            Ok(()) => return,
            Err(TrySendError::Full(returned)) => {
                msg = returned;
                if tokio::time::Instant::now() >= deadline {
                    report_transfer_failure(msg).await;
                    return;
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            Err(TrySendError::Closed(returned)) => {
                report_transfer_failure(returned).await;
                return;
            }
        }
    }
}

async fn report_transfer_failure(msg: ChannelMessage) {
    let mut err = GatewayError::new(ErrorKind::Internal, RECONFIGURE_FAILURE_MESSAGE).with_origin(
        msg.req.provider.clone(),
        &msg.req.model,
        msg.req.kind(),
    );
    err.is_gateway_error = false;
    if let Err(failure) = write_sink(&msg.error_tx, &msg.ctx, err).await {
        warn!(
            provider = %msg.req.provider,
            reason = failure.as_str(),
            "dropped a message during reconfiguration and could not notify the caller"
        );
    }
}

async fn run_worker(
    shared: Arc<WorkerShared>,
    config: ProviderRuntimeConfig,
    rx: Receiver<ChannelMessage>,
    stop: CancellationToken,
    worker_id: usize,
) {
    debug!(provider = %shared.provider, worker_id, "worker started");
    loop {
        tokio::select! {
            // The stop branch is checked first so a reconfiguration can
            // stop workers from pulling while the backlog transfers.
            biased;
            _ = stop.cancelled() => break,
            msg = rx.recv() => match msg {
                Ok(msg) => process_message(&shared, &config, msg).await,
                Err(_) => break,
            },
        }
    }
    debug!(provider = %shared.provider, worker_id, "worker stopped");
}

enum AdapterOutcome {
    Response(Box<GatewayResponse>),
    Stream(ChunkReceiver),
}

async fn process_message(
    shared: &Arc<WorkerShared>,
    config: &ProviderRuntimeConfig,
    msg: ChannelMessage,
) {
    let ChannelMessage {
        req,
        ctx,
        response_tx,
        error_tx,
        stream_tx,
        chunk_hooks,
    } = msg;
    let kind = req.kind();

    if ctx.is_cancelled() {
        debug!(
            provider = %req.provider,
            model = %req.model,
            "request cancelled before work started; dropping without an adapter call"
        );
        return;
    }

    let base = config.base_provider_for(&req.provider);
    let key = match resolve_key(shared, &ctx, &req.provider, &req.model, &base).await {
        Ok(key) => key,
        Err(err) => {
            let err = err.with_origin(req.provider.clone(), &req.model, kind);
            if let Err(failure) = write_sink(&error_tx, &ctx, err).await {
                warn!(provider = %req.provider, reason = failure.as_str(), "key-selection error not delivered");
            }
            return;
        }
    };
    ctx.insert(keys::SELECTED_KEY_ID, &key.id);

    let mut attempt: u32 = 0;
    let mut last_delay = Duration::ZERO;
    let outcome = loop {
        let result = call_adapter(shared, &ctx, &key, &req, Arc::clone(&chunk_hooks)).await;
        let retry = match &result {
            Ok(_) => false,
            Err(err) => {
                attempt < config.network.max_retries && err.is_retryable() && !ctx.is_cancelled()
            }
        };
        if !retry {
            break result;
        }
        let delay = backoff_delay(attempt, &config.network, &mut last_delay);
        warn!(
            provider = %req.provider,
            model = %req.model,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "retrying after a transient upstream error"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = ctx.cancelled() => break result,
        }
        attempt += 1;
    };

    let write_result = match outcome {
        Ok(AdapterOutcome::Response(mut resp)) => {
            if !config.send_back_raw_response {
                resp.raw_response = None;
            }
            write_sink(&response_tx, &ctx, *resp).await
        }
        Ok(AdapterOutcome::Stream(receiver)) => match &stream_tx {
            Some(tx) => write_sink(tx, &ctx, receiver).await,
            None => {
                let err = GatewayError::internal("adapter produced a stream for a unary kind")
                    .with_origin(req.provider.clone(), &req.model, kind);
                write_sink(&error_tx, &ctx, err).await
            }
        },
        Err(err) => {
            let err = err.with_origin(req.provider.clone(), &req.model, kind);
            write_sink(&error_tx, &ctx, err).await
        }
    };

    if let Err(failure) = write_result {
        // Observability contract with the caller, not a correctness loss:
        // the work happened, the peer just never took the result.
        warn!(
            provider = %req.provider,
            model = %req.model,
            reason = failure.as_str(),
            "caller did not take the result; discarding"
        );
    }
}

async fn resolve_key(
    shared: &Arc<WorkerShared>,
    ctx: &RequestContext,
    provider: &Provider,
    model: &str,
    base: &Provider,
) -> GatewayResult<Credential> {
    if let Some(direct) = ctx.get::<Credential>(keys::DIRECT_KEY) {
        return Ok(direct);
    }
    let all_keys = shared.account.keys_for_provider(provider).await?;
    if all_keys.is_empty() && base.accepts_empty_key() {
        return Ok(Credential::new("local", ""));
    }
    select_key(ctx, shared.selector.as_ref(), provider, model, base, &all_keys)
}

async fn call_adapter(
    shared: &Arc<WorkerShared>,
    ctx: &RequestContext,
    key: &Credential,
    req: &mgate_protocol::GatewayRequest,
    hooks: Arc<dyn StreamChunkHook>,
) -> GatewayResult<AdapterOutcome> {
    let adapter = &shared.adapter;
    let model = req.model.as_str();
    match &req.payload {
        RequestPayload::TextCompletion(r) => adapter
            .text_completion(ctx, key, model, r)
            .await
            .map(|resp| AdapterOutcome::Response(Box::new(resp))),
        RequestPayload::TextCompletionStream(r) => adapter
            .text_completion_stream(ctx, key, model, r, hooks)
            .await
            .map(AdapterOutcome::Stream),
        RequestPayload::ChatCompletion(r) => adapter
            .chat_completion(ctx, key, model, r)
            .await
            .map(|resp| AdapterOutcome::Response(Box::new(resp))),
        RequestPayload::ChatCompletionStream(r) => adapter
            .chat_completion_stream(ctx, key, model, r, hooks)
            .await
            .map(AdapterOutcome::Stream),
        RequestPayload::Responses(r) => adapter
            .responses(ctx, key, model, r)
            .await
            .map(|resp| AdapterOutcome::Response(Box::new(resp))),
        RequestPayload::ResponsesStream(r) => adapter
            .responses_stream(ctx, key, model, r, hooks)
            .await
            .map(AdapterOutcome::Stream),
        RequestPayload::Embedding(r) => adapter
            .embedding(ctx, key, model, r)
            .await
            .map(|resp| AdapterOutcome::Response(Box::new(resp))),
        RequestPayload::Speech(r) => adapter
            .speech(ctx, key, model, r)
            .await
            .map(|resp| AdapterOutcome::Response(Box::new(resp))),
        RequestPayload::SpeechStream(r) => adapter
            .speech_stream(ctx, key, model, r, hooks)
            .await
            .map(AdapterOutcome::Stream),
        RequestPayload::Transcription(r) => adapter
            .transcription(ctx, key, model, r)
            .await
            .map(|resp| AdapterOutcome::Response(Box::new(resp))),
        RequestPayload::TranscriptionStream(r) => adapter
            .transcription_stream(ctx, key, model, r, hooks)
            .await
            .map(AdapterOutcome::Stream),
    }
}

/// Exponential backoff with additive jitter, clamped non-decreasing across
/// attempts.
fn backoff_delay(attempt: u32, network: &NetworkConfig, last: &mut Duration) -> Duration {
    let base = network
        .retry_backoff_initial_ms
        .saturating_mul(1u64 << attempt.min(16));
    let capped = base.min(network.retry_backoff_max_ms).max(1);
    let jitter = rand::rng().random_range(0..=capped / 4);
    let delay = Duration::from_millis(capped.saturating_add(jitter)).max(*last);
    *last = delay;
    delay
}
