use serde::{Deserialize, Serialize};

/// The fixed set of request kinds the gateway dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    TextCompletion,
    TextCompletionStream,
    ChatCompletion,
    ChatCompletionStream,
    Responses,
    ResponsesStream,
    Embedding,
    Speech,
    SpeechStream,
    Transcription,
    TranscriptionStream,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::TextCompletion => "text_completion",
            RequestKind::TextCompletionStream => "text_completion_stream",
            RequestKind::ChatCompletion => "chat_completion",
            RequestKind::ChatCompletionStream => "chat_completion_stream",
            RequestKind::Responses => "responses",
            RequestKind::ResponsesStream => "responses_stream",
            RequestKind::Embedding => "embedding",
            RequestKind::Speech => "speech",
            RequestKind::SpeechStream => "speech_stream",
            RequestKind::Transcription => "transcription",
            RequestKind::TranscriptionStream => "transcription_stream",
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(
            self,
            RequestKind::TextCompletionStream
                | RequestKind::ChatCompletionStream
                | RequestKind::ResponsesStream
                | RequestKind::SpeechStream
                | RequestKind::TranscriptionStream
        )
    }

    /// Kinds whose payload carries a tool list MCP discovery can extend.
    pub fn supports_tools(&self) -> bool {
        matches!(
            self,
            RequestKind::ChatCompletion
                | RequestKind::ChatCompletionStream
                | RequestKind::Responses
                | RequestKind::ResponsesStream
        )
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
