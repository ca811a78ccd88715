use serde::{Deserialize, Serialize};
use serde_json::Value;

use mgate_common::{Provider, RequestKind};

use crate::audio::{SpeechAudio, TranscriptionText};
use crate::chat::{ChatDelta, ChatMessage};
use crate::embedding::Embedding;
use crate::responses::ResponsesOutput;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// One completion alternative. Unary chat fills `message`, stream chunks
/// fill `delta`, text completions fill `text`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<ChatDelta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// Gateway-attached response metadata, populated by the dispatch engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseExtra {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<Provider>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_requested: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_kind: Option<RequestKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_key_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_request_id: Option<String>,
}

/// The one response shape that crosses the gateway boundary, for every
/// request kind and for stream chunks alike. Adapters fill the fields their
/// kind produces; the engine owns `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<Choice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<Embedding>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<SpeechAudio>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<TranscriptionText>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output: Vec<ResponsesOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// The untranslated upstream body, when the provider config asks for it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<Value>,
    #[serde(default)]
    pub extra: ResponseExtra,
}

impl GatewayResponse {
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// A minimal unary chat response; test and synthetic-response helper.
    pub fn from_message(message: ChatMessage) -> Self {
        Self {
            object: Some("chat.completion".to_string()),
            choices: vec![Choice {
                index: 0,
                message: Some(message),
                ..Choice::default()
            }],
            ..Self::default()
        }
    }

    /// A single streamed chat chunk carrying one content delta.
    pub fn from_delta(delta: ChatDelta) -> Self {
        Self {
            object: Some("chat.completion.chunk".to_string()),
            choices: vec![Choice {
                index: 0,
                delta: Some(delta),
                ..Choice::default()
            }],
            ..Self::default()
        }
    }
}
