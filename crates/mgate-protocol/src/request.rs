use serde::{Deserialize, Serialize};

use mgate_common::{Provider, RequestKind};

use crate::audio::{SpeechRequest, TranscriptionRequest};
use crate::chat::{ChatRequest, Tool};
use crate::embedding::EmbeddingRequest;
use crate::responses::ResponsesRequest;
use crate::text::TextRequest;

/// An ordered alternative target tried after the primary fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fallback {
    pub provider: Provider,
    pub model: String,
}

/// The request envelope: one kind-specific payload plus the shared header.
///
/// Immutable per attempt; fallback attempts clone it onto a new target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRequest {
    pub provider: Provider,
    pub model: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallbacks: Vec<Fallback>,
    pub payload: RequestPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum RequestPayload {
    TextCompletion(TextRequest),
    TextCompletionStream(TextRequest),
    ChatCompletion(ChatRequest),
    ChatCompletionStream(ChatRequest),
    Responses(ResponsesRequest),
    ResponsesStream(ResponsesRequest),
    Embedding(EmbeddingRequest),
    Speech(SpeechRequest),
    SpeechStream(SpeechRequest),
    Transcription(TranscriptionRequest),
    TranscriptionStream(TranscriptionRequest),
}

impl RequestPayload {
    pub fn kind(&self) -> RequestKind {
        match self {
            RequestPayload::TextCompletion(_) => RequestKind::TextCompletion,
            RequestPayload::TextCompletionStream(_) => RequestKind::TextCompletionStream,
            RequestPayload::ChatCompletion(_) => RequestKind::ChatCompletion,
            RequestPayload::ChatCompletionStream(_) => RequestKind::ChatCompletionStream,
            RequestPayload::Responses(_) => RequestKind::Responses,
            RequestPayload::ResponsesStream(_) => RequestKind::ResponsesStream,
            RequestPayload::Embedding(_) => RequestKind::Embedding,
            RequestPayload::Speech(_) => RequestKind::Speech,
            RequestPayload::SpeechStream(_) => RequestKind::SpeechStream,
            RequestPayload::Transcription(_) => RequestKind::Transcription,
            RequestPayload::TranscriptionStream(_) => RequestKind::TranscriptionStream,
        }
    }

    /// Reject payloads missing their required input before anything enqueues.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            RequestPayload::TextCompletion(req) | RequestPayload::TextCompletionStream(req) => {
                if req.prompt.is_empty() {
                    return Err("text completion input is not provided".to_string());
                }
            }
            RequestPayload::ChatCompletion(req) | RequestPayload::ChatCompletionStream(req) => {
                if req.messages.is_empty() {
                    return Err("chat completion input is not provided".to_string());
                }
            }
            RequestPayload::Responses(req) | RequestPayload::ResponsesStream(req) => {
                if req.input.is_empty() {
                    return Err("responses input is not provided".to_string());
                }
            }
            RequestPayload::Embedding(req) => {
                if req.input.is_empty() {
                    return Err("embedding input is not provided".to_string());
                }
            }
            RequestPayload::Speech(req) | RequestPayload::SpeechStream(req) => {
                if req.input.is_empty() {
                    return Err("speech input is not provided".to_string());
                }
            }
            RequestPayload::Transcription(req) | RequestPayload::TranscriptionStream(req) => {
                if req.file.is_empty() {
                    return Err("transcription input is not provided".to_string());
                }
            }
        }
        Ok(())
    }

    /// The tool list MCP discovery extends, for kinds that carry one.
    pub fn tools_mut(&mut self) -> Option<&mut Vec<Tool>> {
        match self {
            RequestPayload::ChatCompletion(req) | RequestPayload::ChatCompletionStream(req) => {
                Some(&mut req.tools)
            }
            RequestPayload::Responses(req) | RequestPayload::ResponsesStream(req) => {
                Some(&mut req.tools)
            }
            _ => None,
        }
    }

    pub fn tools(&self) -> Option<&[Tool]> {
        match self {
            RequestPayload::ChatCompletion(req) | RequestPayload::ChatCompletionStream(req) => {
                Some(&req.tools)
            }
            RequestPayload::Responses(req) | RequestPayload::ResponsesStream(req) => {
                Some(&req.tools)
            }
            _ => None,
        }
    }
}

impl GatewayRequest {
    pub fn new(provider: Provider, model: impl Into<String>, payload: RequestPayload) -> Self {
        Self {
            provider,
            model: model.into(),
            fallbacks: Vec::new(),
            payload,
        }
    }

    pub fn with_fallbacks(mut self, fallbacks: Vec<Fallback>) -> Self {
        self.fallbacks = fallbacks;
        self
    }

    pub fn kind(&self) -> RequestKind {
        self.payload.kind()
    }

    /// Clone of the envelope aimed at a fallback target.
    pub fn with_target(&self, provider: Provider, model: &str) -> Self {
        Self {
            provider,
            model: model.to_string(),
            fallbacks: Vec::new(),
            payload: self.payload.clone(),
        }
    }
}
