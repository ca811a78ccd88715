//! Neutral request/response data model for mgate.
//!
//! Provider adapters translate these shapes to and from vendor protocols;
//! nothing in this crate knows about any concrete vendor.

pub mod audio;
pub mod chat;
pub mod embedding;
pub mod request;
pub mod response;
pub mod responses;
pub mod text;

pub use audio::{SpeechAudio, SpeechRequest, TranscriptionRequest, TranscriptionText};
pub use chat::{
    ChatContent, ChatDelta, ChatMessage, ChatParams, ChatRequest, ContentBlock, FunctionCall,
    FunctionSchema, Role, Tool, ToolCall,
};
pub use embedding::{Embedding, EmbeddingInput, EmbeddingRequest};
pub use request::{Fallback, GatewayRequest, RequestPayload};
pub use response::{Choice, GatewayResponse, ResponseExtra, Usage};
pub use responses::{ResponsesItem, ResponsesOutput, ResponsesRequest, ResponsesStreamEvent};
pub use text::TextRequest;
