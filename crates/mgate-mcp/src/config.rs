use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use mgate_common::{GatewayError, GatewayResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub clients: Vec<McpClientConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpClientConfig {
    pub name: String,
    pub transport: McpTransportConfig,
    /// Allow-list of tool names; empty means every discovered tool.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools_to_execute: Vec<String>,
    /// Deny-list of tool names; must be disjoint from the allow-list.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools_to_skip: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum McpTransportConfig {
    Http {
        url: String,
    },
    Stdio {
        command: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
    },
    Sse {
        url: String,
    },
    /// Connects to the manager's local in-process tool server.
    InProcess,
}

impl McpClientConfig {
    pub fn validate(&self) -> GatewayResult<()> {
        if self.name.is_empty() {
            return Err(GatewayError::mcp("mcp client name must not be empty"));
        }
        match &self.transport {
            McpTransportConfig::Http { url } | McpTransportConfig::Sse { url } => {
                if url.is_empty() {
                    return Err(GatewayError::mcp(format!(
                        "mcp client {} requires a connection string",
                        self.name
                    )));
                }
            }
            McpTransportConfig::Stdio { command, .. } => {
                if command.is_empty() {
                    return Err(GatewayError::mcp(format!(
                        "mcp client {} requires a stdio command",
                        self.name
                    )));
                }
            }
            McpTransportConfig::InProcess => {}
        }
        if let Some(name) = self
            .tools_to_execute
            .iter()
            .find(|name| self.tools_to_skip.contains(name))
        {
            return Err(GatewayError::mcp(format!(
                "tool {name} appears in both the execute and skip lists of client {}",
                self.name
            )));
        }
        Ok(())
    }

    /// Whether a discovered tool survives this client's allow/deny lists.
    pub fn tool_allowed(&self, tool: &str) -> bool {
        if self.tools_to_skip.iter().any(|t| t == tool) {
            return false;
        }
        self.tools_to_execute.is_empty() || self.tools_to_execute.iter().any(|t| t == tool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_config(name: &str) -> McpClientConfig {
        McpClientConfig {
            name: name.to_string(),
            transport: McpTransportConfig::Http {
                url: "http://localhost:9000/mcp".to_string(),
            },
            tools_to_execute: Vec::new(),
            tools_to_skip: Vec::new(),
        }
    }

    #[test]
    fn overlapping_lists_are_rejected() {
        let mut config = http_config("search");
        config.tools_to_execute = vec!["lookup".to_string()];
        config.tools_to_skip = vec!["lookup".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_connection_string_is_rejected() {
        let mut config = http_config("search");
        config.transport = McpTransportConfig::Http { url: String::new() };
        assert!(config.validate().is_err());

        config.transport = McpTransportConfig::Stdio {
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn allow_and_deny_lists_filter_tools() {
        let mut config = http_config("search");
        assert!(config.tool_allowed("anything"));

        config.tools_to_skip = vec!["dangerous".to_string()];
        assert!(!config.tool_allowed("dangerous"));
        assert!(config.tool_allowed("safe"));

        config.tools_to_execute = vec!["safe".to_string()];
        assert!(config.tool_allowed("safe"));
        assert!(!config.tool_allowed("other"));
    }
}
