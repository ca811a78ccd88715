use serde::{Deserialize, Serialize};

use crate::chat::ChatParams;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextRequest {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<ChatParams>,
}
