use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Identifier of a model-serving backend.
///
/// Custom providers carry their own id and declare a base provider type in
/// their runtime config so the engine knows which wire protocol they speak.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Provider {
    OpenAI,
    Anthropic,
    Azure,
    Bedrock,
    Vertex,
    Cohere,
    Mistral,
    Groq,
    Ollama,
    Custom(String),
}

impl Provider {
    pub fn as_str(&self) -> &str {
        match self {
            Provider::OpenAI => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Azure => "azure",
            Provider::Bedrock => "bedrock",
            Provider::Vertex => "vertex",
            Provider::Cohere => "cohere",
            Provider::Mistral => "mistral",
            Provider::Groq => "groq",
            Provider::Ollama => "ollama",
            Provider::Custom(id) => id.as_str(),
        }
    }

    /// Local runtimes accept empty secrets; everything else needs a real key.
    pub fn accepts_empty_key(&self) -> bool {
        matches!(self, Provider::Ollama)
    }

    /// Providers whose credentials resolve models through a deployment map.
    pub fn uses_deployments(&self) -> bool {
        matches!(self, Provider::Azure | Provider::Bedrock)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "openai" => Provider::OpenAI,
            "anthropic" => Provider::Anthropic,
            "azure" => Provider::Azure,
            "bedrock" => Provider::Bedrock,
            "vertex" => Provider::Vertex,
            "cohere" => Provider::Cohere,
            "mistral" => Provider::Mistral,
            "groq" => Provider::Groq,
            "ollama" => Provider::Ollama,
            other => Provider::Custom(other.to_string()),
        })
    }
}

impl Serialize for Provider {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Provider {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(value.parse().expect("provider parse is infallible"))
    }
}
