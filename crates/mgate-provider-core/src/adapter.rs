use std::sync::Arc;

use async_trait::async_trait;

use mgate_common::{GatewayError, GatewayResult, Provider, RequestContext};
use mgate_protocol::{
    ChatRequest, EmbeddingRequest, GatewayResponse, ResponsesRequest, SpeechRequest, TextRequest,
    TranscriptionRequest,
};

use crate::credential::Credential;

/// Stream of response chunks produced by an adapter.
pub type ChunkReceiver = tokio::sync::mpsc::Receiver<GatewayResult<GatewayResponse>>;
pub type ChunkSender = tokio::sync::mpsc::Sender<GatewayResult<GatewayResponse>>;

/// Callback a streaming adapter must invoke for every chunk before emitting
/// it downstream. Returning `None` drops the chunk.
#[async_trait]
pub trait StreamChunkHook: Send + Sync {
    async fn on_chunk(
        &self,
        ctx: &RequestContext,
        chunk: GatewayResult<GatewayResponse>,
    ) -> Option<GatewayResult<GatewayResponse>>;
}

/// Hook that forwards chunks untouched; for adapters driven outside an
/// engine pipeline.
pub struct PassthroughChunkHook;

#[async_trait]
impl StreamChunkHook for PassthroughChunkHook {
    async fn on_chunk(
        &self,
        _ctx: &RequestContext,
        chunk: GatewayResult<GatewayResponse>,
    ) -> Option<GatewayResult<GatewayResponse>> {
        Some(chunk)
    }
}

/// The capability set of one provider backend.
///
/// One method per request kind. Every default body reports the operation as
/// unsupported, so an adapter only implements what its vendor offers.
/// Adapters translate vendor failures into `GatewayError` with
/// `is_gateway_error=false` and the upstream status code; errors raised
/// before any upstream call keep `is_gateway_error=true`.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    async fn text_completion(
        &self,
        _ctx: &RequestContext,
        _key: &Credential,
        _model: &str,
        _req: &TextRequest,
    ) -> GatewayResult<GatewayResponse> {
        Err(GatewayError::unsupported(&self.provider(), "text_completion"))
    }

    async fn text_completion_stream(
        &self,
        _ctx: &RequestContext,
        _key: &Credential,
        _model: &str,
        _req: &TextRequest,
        _hooks: Arc<dyn StreamChunkHook>,
    ) -> GatewayResult<ChunkReceiver> {
        Err(GatewayError::unsupported(
            &self.provider(),
            "text_completion_stream",
        ))
    }

    async fn chat_completion(
        &self,
        _ctx: &RequestContext,
        _key: &Credential,
        _model: &str,
        _req: &ChatRequest,
    ) -> GatewayResult<GatewayResponse> {
        Err(GatewayError::unsupported(&self.provider(), "chat_completion"))
    }

    async fn chat_completion_stream(
        &self,
        _ctx: &RequestContext,
        _key: &Credential,
        _model: &str,
        _req: &ChatRequest,
        _hooks: Arc<dyn StreamChunkHook>,
    ) -> GatewayResult<ChunkReceiver> {
        Err(GatewayError::unsupported(
            &self.provider(),
            "chat_completion_stream",
        ))
    }

    async fn responses(
        &self,
        _ctx: &RequestContext,
        _key: &Credential,
        _model: &str,
        _req: &ResponsesRequest,
    ) -> GatewayResult<GatewayResponse> {
        Err(GatewayError::unsupported(&self.provider(), "responses"))
    }

    async fn responses_stream(
        &self,
        _ctx: &RequestContext,
        _key: &Credential,
        _model: &str,
        _req: &ResponsesRequest,
        _hooks: Arc<dyn StreamChunkHook>,
    ) -> GatewayResult<ChunkReceiver> {
        Err(GatewayError::unsupported(&self.provider(), "responses_stream"))
    }

    async fn embedding(
        &self,
        _ctx: &RequestContext,
        _key: &Credential,
        _model: &str,
        _req: &EmbeddingRequest,
    ) -> GatewayResult<GatewayResponse> {
        Err(GatewayError::unsupported(&self.provider(), "embedding"))
    }

    async fn speech(
        &self,
        _ctx: &RequestContext,
        _key: &Credential,
        _model: &str,
        _req: &SpeechRequest,
    ) -> GatewayResult<GatewayResponse> {
        Err(GatewayError::unsupported(&self.provider(), "speech"))
    }

    async fn speech_stream(
        &self,
        _ctx: &RequestContext,
        _key: &Credential,
        _model: &str,
        _req: &SpeechRequest,
        _hooks: Arc<dyn StreamChunkHook>,
    ) -> GatewayResult<ChunkReceiver> {
        Err(GatewayError::unsupported(&self.provider(), "speech_stream"))
    }

    async fn transcription(
        &self,
        _ctx: &RequestContext,
        _key: &Credential,
        _model: &str,
        _req: &TranscriptionRequest,
    ) -> GatewayResult<GatewayResponse> {
        Err(GatewayError::unsupported(&self.provider(), "transcription"))
    }

    async fn transcription_stream(
        &self,
        _ctx: &RequestContext,
        _key: &Credential,
        _model: &str,
        _req: &TranscriptionRequest,
        _hooks: Arc<dyn StreamChunkHook>,
    ) -> GatewayResult<ChunkReceiver> {
        Err(GatewayError::unsupported(
            &self.provider(),
            "transcription_stream",
        ))
    }
}
