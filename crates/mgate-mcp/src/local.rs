use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use rmcp::model::{
    CallToolRequestParam, CallToolResult, Content, ListToolsResult, PaginatedRequestParam,
    ServerCapabilities, ServerInfo, Tool,
};
use rmcp::service::{RequestContext as McpRequestContext, RoleServer};
use rmcp::{ErrorData as McpError, ServerHandler};
use serde_json::Value;

use mgate_common::{GatewayError, GatewayResult};

/// Host-side implementation of one registered tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: Value) -> Result<String, String>;
}

/// Adapter so plain async closures can serve as tool handlers.
pub struct FnToolHandler<F>(pub F);

#[async_trait]
impl<F, Fut> ToolHandler for FnToolHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<String, String>> + Send,
{
    async fn call(&self, arguments: Value) -> Result<String, String> {
        (self.0)(arguments).await
    }
}

struct RegisteredTool {
    tool: Tool,
    handler: Arc<dyn ToolHandler>,
}

/// In-process MCP server hosting tools registered by the embedding
/// application. Served to the manager over a duplex pipe, so registered
/// tools flow through the same catalog and invocation paths as remote ones.
#[derive(Clone, Default)]
pub struct LocalToolServer {
    tools: Arc<RwLock<HashMap<String, RegisteredTool>>>,
}

impl LocalToolServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tool(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: Arc<dyn ToolHandler>,
    ) -> GatewayResult<()> {
        let name = name.into();
        let schema = match input_schema {
            Value::Object(map) => map,
            Value::Null => serde_json::Map::new(),
            _ => {
                return Err(GatewayError::mcp(format!(
                    "tool {name} input schema must be a JSON object"
                )));
            }
        };
        let mut tools = self.tools.write().expect("local tool table poisoned");
        if tools.contains_key(&name) {
            return Err(GatewayError::mcp(format!(
                "tool {name} is already registered"
            )));
        }
        let tool = Tool::new(name.clone(), description.into(), Arc::new(schema));
        tools.insert(name, RegisteredTool { tool, handler });
        Ok(())
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .read()
            .expect("local tool table poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl ServerHandler for LocalToolServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            instructions: Some("tools registered by the embedding host".to_string()),
            ..ServerInfo::default()
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: McpRequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        let tools = self
            .tools
            .read()
            .expect("local tool table poisoned")
            .values()
            .map(|registered| registered.tool.clone())
            .collect();
        Ok(ListToolsResult {
            tools,
            next_cursor: None,
            meta: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: McpRequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let handler = {
            let tools = self.tools.read().expect("local tool table poisoned");
            match tools.get(request.name.as_ref()) {
                Some(registered) => Arc::clone(&registered.handler),
                None => {
                    return Err(McpError::invalid_params(
                        format!("unknown tool {}", request.name),
                        None,
                    ));
                }
            }
        };
        let arguments = request
            .arguments
            .map(Value::Object)
            .unwrap_or(Value::Null);
        match handler.call(arguments).await {
            Ok(text) => Ok(CallToolResult::success(vec![Content::text(text)])),
            Err(message) => Err(McpError::internal_error(message, None)),
        }
    }
}
