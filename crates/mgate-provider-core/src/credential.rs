use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use mgate_common::Provider;

/// One authenticated identity usable against a provider.
///
/// `models` is an allow-list; empty means the key serves every model.
/// `weight` biases selection when several keys are eligible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub azure: Option<AzureKeyConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bedrock: Option<BedrockKeyConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vertex: Option<VertexKeyConfig>,
}

fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AzureKeyConfig {
    pub endpoint: String,
    /// model name -> deployment name
    #[serde(default)]
    pub deployments: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BedrockKeyConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// model name -> inference profile / deployment id
    #[serde(default)]
    pub deployments: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VertexKeyConfig {
    pub project_id: String,
    pub region: String,
    /// Service-account JSON, passed through to the adapter untouched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_credentials: Option<serde_json::Value>,
}

impl Credential {
    pub fn new(id: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            value: value.into(),
            models: Vec::new(),
            weight: default_weight(),
            azure: None,
            bedrock: None,
            vertex: None,
        }
    }

    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = models;
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn supports_model(&self, model: &str) -> bool {
        self.models.is_empty() || self.models.iter().any(|m| m == model)
    }

    fn deployments_for(&self, base_provider: &Provider) -> Option<&HashMap<String, String>> {
        match base_provider {
            Provider::Azure => self.azure.as_ref().map(|c| &c.deployments),
            Provider::Bedrock => self.bedrock.as_ref().map(|c| &c.deployments),
            _ => None,
        }
    }

    /// Whether this key can serve `model` against `base_provider`.
    ///
    /// Azure/Bedrock keys that carry a deployment map must also resolve the
    /// model through it; local runtimes accept empty secret values.
    pub fn eligible(&self, model: &str, base_provider: &Provider) -> bool {
        if self.value.is_empty() && !base_provider.accepts_empty_key() {
            return false;
        }
        if !self.supports_model(model) {
            return false;
        }
        if base_provider.uses_deployments()
            && let Some(deployments) = self.deployments_for(base_provider)
            && !deployments.is_empty()
            && !deployments.contains_key(model)
        {
            return false;
        }
        true
    }
}
