use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use mgate_common::{GatewayError, RequestContext, RequestKind};
use mgate_protocol::{GatewayRequest, GatewayResponse};
use mgate_provider_core::{ChunkReceiver, StreamChunkHook};

use crate::plugin::PipelineScratch;
use crate::pool::ObjectPool;

/// Budget for a worker's write back to the caller; a peer that went away is
/// logged and discarded, never retried.
pub(crate) const SINK_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// The carrier placed on a provider queue: the envelope, the request
/// context, and single-slot sinks for exactly one of response, stream or
/// error.
pub(crate) struct ChannelMessage {
    pub req: GatewayRequest,
    pub ctx: RequestContext,
    pub response_tx: mpsc::Sender<GatewayResponse>,
    pub error_tx: mpsc::Sender<GatewayError>,
    /// Present only for streaming kinds: carries the stream of chunks.
    pub stream_tx: Option<mpsc::Sender<ChunkReceiver>>,
    /// Per-chunk post-hook runner handed to the adapter.
    pub chunk_hooks: Arc<dyn StreamChunkHook>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SinkWriteError {
    Cancelled,
    TimedOut,
    Closed,
}

impl SinkWriteError {
    pub fn as_str(&self) -> &'static str {
        match self {
            SinkWriteError::Cancelled => "cancelled",
            SinkWriteError::TimedOut => "timed out",
            SinkWriteError::Closed => "closed",
        }
    }
}

/// Writes one value into a single-slot sink under the
/// `(send | context-cancel | timeout)` discipline that bounds worker
/// lifetime when a caller walks away.
pub(crate) async fn write_sink<T>(
    tx: &mpsc::Sender<T>,
    ctx: &RequestContext,
    value: T,
) -> Result<(), SinkWriteError> {
    tokio::select! {
        sent = tx.send(value) => sent.map_err(|_| SinkWriteError::Closed),
        _ = ctx.cancelled() => Err(SinkWriteError::Cancelled),
        _ = tokio::time::sleep(SINK_WRITE_TIMEOUT) => Err(SinkWriteError::TimedOut),
    }
}

/// Pooled bundle of both ends of a message's sinks. The engine keeps the
/// receivers and hands sender clones to the worker.
pub(crate) struct MessageCarrier {
    pub response_tx: mpsc::Sender<GatewayResponse>,
    pub response_rx: mpsc::Receiver<GatewayResponse>,
    pub error_tx: mpsc::Sender<GatewayError>,
    pub error_rx: mpsc::Receiver<GatewayError>,
    pub stream_tx: Option<mpsc::Sender<ChunkReceiver>>,
    pub stream_rx: Option<mpsc::Receiver<ChunkReceiver>>,
}

impl MessageCarrier {
    fn new(with_stream: bool) -> Self {
        let (response_tx, response_rx) = mpsc::channel(1);
        let (error_tx, error_rx) = mpsc::channel(1);
        let (stream_tx, stream_rx) = if with_stream {
            let (tx, rx) = mpsc::channel(1);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        Self {
            response_tx,
            response_rx,
            error_tx,
            error_rx,
            stream_tx,
            stream_rx,
        }
    }

    /// Discards any stale value a late writer may have deposited.
    fn drain(&mut self) {
        while self.response_rx.try_recv().is_ok() {}
        while self.error_rx.try_recv().is_ok() {}
        if let Some(rx) = self.stream_rx.as_mut() {
            while rx.try_recv().is_ok() {}
        }
    }
}

/// One pool per pooled object kind, pre-warmed at init.
pub(crate) struct CarrierPools {
    unary: ObjectPool<MessageCarrier>,
    stream: ObjectPool<MessageCarrier>,
    scratch: ObjectPool<PipelineScratch>,
}

impl CarrierPools {
    pub fn new(initial: usize) -> Self {
        Self {
            unary: ObjectPool::new(initial, || MessageCarrier::new(false)),
            stream: ObjectPool::new(initial, || MessageCarrier::new(true)),
            scratch: ObjectPool::new(initial, PipelineScratch::default),
        }
    }

    /// Stream sinks are only allocated for streaming kinds.
    pub fn get_carrier(&self, kind: RequestKind) -> MessageCarrier {
        let mut carrier = if kind.is_stream() {
            self.stream.get()
        } else {
            self.unary.get()
        };
        carrier.drain();
        carrier
    }

    pub fn put_carrier(&self, mut carrier: MessageCarrier) {
        carrier.drain();
        if carrier.stream_rx.is_some() {
            self.stream.put(carrier);
        } else {
            self.unary.put(carrier);
        }
    }

    pub fn get_scratch(&self) -> PipelineScratch {
        let mut scratch = self.scratch.get();
        scratch.reset();
        scratch
    }

    pub fn put_scratch(&self, mut scratch: PipelineScratch) {
        scratch.reset();
        self.scratch.put(scratch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reused_carrier_never_leaks_a_stale_value() {
        let pools = CarrierPools::new(1);
        let carrier = pools.get_carrier(RequestKind::ChatCompletion);
        carrier
            .response_tx
            .try_send(GatewayResponse::default().with_id("stale"))
            .unwrap();
        pools.put_carrier(carrier);

        let mut reused = pools.get_carrier(RequestKind::ChatCompletion);
        assert!(reused.response_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn write_sink_times_out_against_a_full_slot() {
        tokio::time::pause();
        let pools = CarrierPools::new(1);
        let carrier = pools.get_carrier(RequestKind::ChatCompletion);
        let ctx = RequestContext::background();
        carrier
            .response_tx
            .try_send(GatewayResponse::default())
            .unwrap();

        let write = write_sink(
            &carrier.response_tx,
            &ctx,
            GatewayResponse::default(),
        );
        let result = tokio::time::timeout(Duration::from_secs(10), write)
            .await
            .expect("write must resolve within the sink timeout");
        assert_eq!(result.unwrap_err(), SinkWriteError::TimedOut);
    }

    #[tokio::test]
    async fn write_sink_observes_cancellation() {
        let pools = CarrierPools::new(1);
        let carrier = pools.get_carrier(RequestKind::ChatCompletion);
        let ctx = RequestContext::background();
        carrier
            .response_tx
            .try_send(GatewayResponse::default())
            .unwrap();
        ctx.cancel();

        let result = write_sink(&carrier.response_tx, &ctx, GatewayResponse::default()).await;
        assert_eq!(result.unwrap_err(), SinkWriteError::Cancelled);
    }
}
