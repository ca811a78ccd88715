use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rmcp::ServiceExt;
use rmcp::model::{CallToolRequestParam, RawContent, Tool as McpTool};
use rmcp::service::{Peer, RoleClient, RunningService};
use rmcp::transport::sse_client::SseClientTransport;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransport;
use rmcp::transport::{ConfigureCommandExt, TokioChildProcess};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use mgate_common::{GatewayError, GatewayResult, RequestContext, keys};
use mgate_protocol::{ChatMessage, FunctionSchema, Tool, ToolCall};

use crate::config::{McpClientConfig, McpConfig, McpTransportConfig};
use crate::local::{LocalToolServer, ToolHandler};

/// Reserved client name backing the in-process tool server.
pub const LOCAL_CLIENT_NAME: &str = "mgate-local";

/// Initial handshake budget for a new client connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

type ClientService = RunningService<RoleClient, ()>;

struct McpClientRecord {
    config: McpClientConfig,
    conn: Option<ClientService>,
    catalog: HashMap<String, McpTool>,
}

impl McpClientRecord {
    fn placeholder(config: McpClientConfig) -> Self {
        Self {
            config,
            conn: None,
            catalog: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct McpClientStatus {
    pub name: String,
    pub connected: bool,
    pub tools: Vec<String>,
}

/// Client lifecycle, tool catalogs and tool-call routing.
///
/// The client map is guarded by one read/write lock. Every operation that
/// performs transport I/O (handshake, discovery, invocation) runs with no
/// lock held and re-validates existence after reacquiring it.
pub struct McpManager {
    clients: RwLock<HashMap<String, McpClientRecord>>,
    local: tokio::sync::Mutex<Option<LocalToolServer>>,
}

impl McpManager {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            local: tokio::sync::Mutex::new(None),
        }
    }

    /// Builds a manager and connects every configured client. A client that
    /// fails to connect is logged and skipped; it can be re-added later.
    pub async fn from_config(config: McpConfig) -> Arc<Self> {
        let manager = Arc::new(Self::new());
        for client in config.clients {
            let name = client.name.clone();
            if let Err(err) = manager.add_client(client).await {
                warn!(client = %name, error = %err, "mcp client failed to connect at init");
            }
        }
        manager
    }

    pub async fn add_client(&self, config: McpClientConfig) -> GatewayResult<()> {
        config.validate()?;
        let name = config.name.clone();

        {
            let mut clients = self.clients.write().await;
            if clients.contains_key(&name) {
                return Err(GatewayError::mcp(format!("mcp client {name} already exists")));
            }
            clients.insert(name.clone(), McpClientRecord::placeholder(config.clone()));
        }

        // Handshake and discovery are blocking I/O; the lock is released.
        let connected = self.connect(&config).await;

        let mut clients = self.clients.write().await;
        match connected {
            Ok((conn, catalog)) => match clients.get_mut(&name) {
                Some(record) => {
                    record.conn = Some(conn);
                    record.catalog = catalog;
                    debug!(client = %name, tools = record.catalog.len(), "mcp client connected");
                    Ok(())
                }
                None => {
                    drop(clients);
                    let _ = conn.cancel().await;
                    Err(GatewayError::mcp(format!(
                        "mcp client {name} removed during update"
                    )))
                }
            },
            Err(err) => {
                clients.remove(&name);
                Err(err)
            }
        }
    }

    pub async fn remove_client(&self, name: &str) -> GatewayResult<()> {
        let record = {
            let mut clients = self.clients.write().await;
            clients
                .remove(name)
                .ok_or_else(|| GatewayError::mcp(format!("mcp client {name} does not exist")))?
        };
        if let Some(conn) = record.conn {
            // Cancels the transport task; for stream transports this tears
            // down the SSE/HTTP session.
            let _ = conn.cancel().await;
        }
        Ok(())
    }

    /// Allowed only for a known client with no live connection.
    pub async fn reconnect_client(&self, name: &str) -> GatewayResult<()> {
        let config = {
            let clients = self.clients.read().await;
            let record = clients
                .get(name)
                .ok_or_else(|| GatewayError::mcp(format!("mcp client {name} does not exist")))?;
            if record.conn.is_some() {
                return Err(GatewayError::mcp(format!(
                    "mcp client {name} is already connected"
                )));
            }
            record.config.clone()
        };

        let (conn, catalog) = self.connect(&config).await?;

        let mut clients = self.clients.write().await;
        match clients.get_mut(name) {
            Some(record) if record.conn.is_none() => {
                record.conn = Some(conn);
                record.catalog = catalog;
                Ok(())
            }
            Some(_) => {
                drop(clients);
                let _ = conn.cancel().await;
                Err(GatewayError::mcp(format!(
                    "mcp client {name} is already connected"
                )))
            }
            None => {
                drop(clients);
                let _ = conn.cancel().await;
                Err(GatewayError::mcp(format!(
                    "mcp client {name} removed during update"
                )))
            }
        }
    }

    /// Swaps the allow/deny lists and re-discovers the catalog.
    pub async fn edit_client_tools(
        &self,
        name: &str,
        tools_to_execute: Vec<String>,
        tools_to_skip: Vec<String>,
    ) -> GatewayResult<()> {
        let peer = {
            let mut clients = self.clients.write().await;
            let record = clients
                .get_mut(name)
                .ok_or_else(|| GatewayError::mcp(format!("mcp client {name} does not exist")))?;
            let mut next = record.config.clone();
            next.tools_to_execute = tools_to_execute;
            next.tools_to_skip = tools_to_skip;
            next.validate()?;
            record.config = next;
            record.catalog.clear();
            record.conn.as_ref().map(|conn| conn.peer().clone())
        };

        // A disconnected client keeps an empty catalog until it reconnects.
        let Some(peer) = peer else {
            return Ok(());
        };

        let config = {
            let clients = self.clients.read().await;
            match clients.get(name) {
                Some(record) => record.config.clone(),
                None => {
                    return Err(GatewayError::mcp(format!(
                        "mcp client {name} removed during update"
                    )));
                }
            }
        };
        let catalog = self.discover(&config, &peer).await?;

        let mut clients = self.clients.write().await;
        match clients.get_mut(name) {
            Some(record) => {
                record.catalog = catalog;
                Ok(())
            }
            None => Err(GatewayError::mcp(format!(
                "mcp client {name} removed during update"
            ))),
        }
    }

    pub async fn get_clients(&self) -> Vec<McpClientStatus> {
        let clients = self.clients.read().await;
        let mut out: Vec<McpClientStatus> = clients
            .values()
            .map(|record| {
                let mut tools: Vec<String> = record.catalog.keys().cloned().collect();
                tools.sort();
                McpClientStatus {
                    name: record.config.name.clone(),
                    connected: record.conn.is_some(),
                    tools,
                }
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Registers a host tool on the in-process server, constructing the
    /// server and its client on first use.
    pub async fn register_tool(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: Arc<dyn ToolHandler>,
    ) -> GatewayResult<()> {
        let name = name.into();
        let mut local = self.local.lock().await;
        let server = match local.as_ref() {
            Some(server) => server.clone(),
            None => {
                let server = LocalToolServer::new();
                self.start_local_client(server.clone()).await?;
                *local = Some(server.clone());
                server
            }
        };
        server.add_tool(name, description, input_schema, handler)?;
        drop(local);

        // Refresh the local catalog through the same discovery path remote
        // clients use.
        let peer = {
            let clients = self.clients.read().await;
            clients
                .get(LOCAL_CLIENT_NAME)
                .and_then(|record| record.conn.as_ref().map(|conn| conn.peer().clone()))
        };
        if let Some(peer) = peer {
            let config = {
                let clients = self.clients.read().await;
                clients
                    .get(LOCAL_CLIENT_NAME)
                    .map(|record| record.config.clone())
            };
            if let Some(config) = config {
                let catalog = self.discover(&config, &peer).await?;
                let mut clients = self.clients.write().await;
                if let Some(record) = clients.get_mut(LOCAL_CLIENT_NAME) {
                    record.catalog = catalog;
                }
            }
        }
        Ok(())
    }

    /// Tool definitions to inject into one request, after the context's
    /// client and tool allow/deny lists.
    pub async fn tools_for_request(&self, ctx: &RequestContext) -> Vec<Tool> {
        let include_clients: Vec<String> =
            ctx.get(keys::MCP_INCLUDE_CLIENTS).unwrap_or_default();
        let exclude_clients: Vec<String> =
            ctx.get(keys::MCP_EXCLUDE_CLIENTS).unwrap_or_default();
        let include_tools: Vec<String> = ctx.get(keys::MCP_INCLUDE_TOOLS).unwrap_or_default();
        let exclude_tools: Vec<String> = ctx.get(keys::MCP_EXCLUDE_TOOLS).unwrap_or_default();

        let clients = self.clients.read().await;
        let mut out = Vec::new();
        for record in clients.values() {
            let client_name = &record.config.name;
            if exclude_clients.iter().any(|name| name == client_name) {
                continue;
            }
            if !include_clients.is_empty()
                && !include_clients.iter().any(|name| name == client_name)
            {
                continue;
            }
            for (tool_name, tool) in &record.catalog {
                if exclude_tools.iter().any(|name| name == tool_name) {
                    continue;
                }
                if !include_tools.is_empty()
                    && !include_tools.iter().any(|name| name == tool_name)
                {
                    continue;
                }
                out.push(to_protocol_tool(tool));
            }
        }
        out.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        out
    }

    /// Resolves the owning client by catalog scan and dispatches the call.
    /// The result comes back as a tool-role message carrying the call id.
    pub async fn execute_tool(
        &self,
        _ctx: &RequestContext,
        call: &ToolCall,
    ) -> GatewayResult<ChatMessage> {
        let tool_name = call.function.name.clone();
        let arguments = if call.function.arguments.trim().is_empty() {
            None
        } else {
            match serde_json::from_str::<Value>(&call.function.arguments) {
                Ok(Value::Object(map)) => Some(map),
                Ok(_) => {
                    return Err(GatewayError::mcp(format!(
                        "tool {tool_name} arguments must be a JSON object"
                    )));
                }
                Err(err) => {
                    return Err(GatewayError::mcp(format!(
                        "tool {tool_name} arguments are not valid JSON: {err}"
                    )));
                }
            }
        };

        let peer = {
            let clients = self.clients.read().await;
            clients
                .values()
                .find(|record| record.catalog.contains_key(&tool_name))
                .and_then(|record| record.conn.as_ref().map(|conn| conn.peer().clone()))
        };
        let Some(peer) = peer else {
            return Err(GatewayError::mcp(format!(
                "no connected mcp client offers tool {tool_name}"
            )));
        };

        let result = peer
            .call_tool(CallToolRequestParam {
                meta: None,
                name: tool_name.clone().into(),
                arguments,
                task: None,
            })
            .await
            .map_err(|err| GatewayError::mcp(format!("tool {tool_name} failed: {err}")))?;

        let text = stringify_tool_result(&result.content);
        Ok(ChatMessage::tool_result(
            call.id.clone().unwrap_or_default(),
            text,
        ))
    }

    pub async fn shutdown(&self) {
        let records: Vec<McpClientRecord> = {
            let mut clients = self.clients.write().await;
            clients.drain().map(|(_, record)| record).collect()
        };
        for record in records {
            if let Some(conn) = record.conn {
                let _ = conn.cancel().await;
            }
        }
        *self.local.lock().await = None;
    }

    async fn connect(
        &self,
        config: &McpClientConfig,
    ) -> GatewayResult<(ClientService, HashMap<String, McpTool>)> {
        // The initial handshake is initialize plus the first tool discovery;
        // both run under one budget.
        let handshake = async {
            let conn = self.open_transport(config).await?;
            let peer = conn.peer().clone();
            match self.discover(config, &peer).await {
                Ok(catalog) => Ok((conn, catalog)),
                Err(err) => {
                    let _ = conn.cancel().await;
                    Err(err)
                }
            }
        };
        tokio::time::timeout(CONNECT_TIMEOUT, handshake)
            .await
            .map_err(|_| {
                GatewayError::mcp(format!(
                    "mcp client {} timed out during the initial handshake",
                    config.name
                ))
            })?
    }

    async fn open_transport(&self, config: &McpClientConfig) -> GatewayResult<ClientService> {
        let name = &config.name;
        match &config.transport {
            McpTransportConfig::Http { url } => {
                let transport = StreamableHttpClientTransport::from_uri(url.clone());
                ().serve(transport).await.map_err(|err| {
                    GatewayError::mcp(format!("mcp client {name} failed to connect: {err}"))
                })
            }
            McpTransportConfig::Sse { url } => {
                let transport = SseClientTransport::start(url.clone()).await.map_err(|err| {
                    GatewayError::mcp(format!("mcp client {name} failed to connect: {err}"))
                })?;
                ().serve(transport).await.map_err(|err| {
                    GatewayError::mcp(format!("mcp client {name} failed to connect: {err}"))
                })
            }
            McpTransportConfig::Stdio { command, args, env } => {
                let mut cmd = tokio::process::Command::new(command);
                cmd.args(args);
                cmd.envs(env);
                let transport = TokioChildProcess::new(cmd.configure(|c| {
                    c.kill_on_drop(true);
                }))
                .map_err(|err| {
                    GatewayError::mcp(format!("mcp client {name} failed to spawn: {err}"))
                })?;
                ().serve(transport).await.map_err(|err| {
                    GatewayError::mcp(format!("mcp client {name} failed to connect: {err}"))
                })
            }
            McpTransportConfig::InProcess => {
                let local = self.local.lock().await;
                let server = local.as_ref().cloned().ok_or_else(|| {
                    GatewayError::mcp(
                        "in-process transport requires a local tool server; register a tool first",
                    )
                })?;
                drop(local);
                serve_in_process(server).await
            }
        }
    }

    async fn discover(
        &self,
        config: &McpClientConfig,
        peer: &Peer<RoleClient>,
    ) -> GatewayResult<HashMap<String, McpTool>> {
        let listed = peer.list_tools(Default::default()).await.map_err(|err| {
            GatewayError::mcp(format!(
                "mcp client {} tool discovery failed: {err}",
                config.name
            ))
        })?;
        let mut catalog = HashMap::new();
        for tool in listed.tools {
            let name = tool.name.to_string();
            if config.tool_allowed(&name) {
                catalog.insert(name, tool);
            }
        }
        Ok(catalog)
    }

    /// Serves the local tool server over a duplex pipe and records it as a
    /// client under the reserved name.
    async fn start_local_client(&self, server: LocalToolServer) -> GatewayResult<()> {
        {
            let clients = self.clients.read().await;
            if clients.contains_key(LOCAL_CLIENT_NAME) {
                return Err(GatewayError::mcp(format!(
                    "mcp client {LOCAL_CLIENT_NAME} already exists"
                )));
            }
        }

        let conn = serve_in_process(server).await?;
        let config = McpClientConfig {
            name: LOCAL_CLIENT_NAME.to_string(),
            transport: McpTransportConfig::InProcess,
            tools_to_execute: Vec::new(),
            tools_to_skip: Vec::new(),
        };
        let mut record = McpClientRecord::placeholder(config);
        record.conn = Some(conn);

        let mut clients = self.clients.write().await;
        clients.insert(LOCAL_CLIENT_NAME.to_string(), record);
        Ok(())
    }
}

impl Default for McpManager {
    fn default() -> Self {
        Self::new()
    }
}

async fn serve_in_process(server: LocalToolServer) -> GatewayResult<ClientService> {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move {
        match server.serve(server_io).await {
            Ok(running) => {
                let _ = running.waiting().await;
            }
            Err(err) => warn!(error = %err, "in-process mcp server failed to start"),
        }
    });
    ().serve(client_io)
        .await
        .map_err(|err| GatewayError::mcp(format!("in-process mcp client failed: {err}")))
}

fn to_protocol_tool(tool: &McpTool) -> Tool {
    Tool {
        tool_type: "function".to_string(),
        function: FunctionSchema {
            name: tool.name.to_string(),
            description: tool.description.as_ref().map(|d| d.to_string()),
            parameters: Some(Value::Object(tool.input_schema.as_ref().clone())),
        },
    }
}

/// Text blocks concatenated; non-text content degrades to placeholders or a
/// JSON rendering.
fn stringify_tool_result(content: &[rmcp::model::Content]) -> String {
    let mut parts = Vec::new();
    for item in content {
        match &item.raw {
            RawContent::Text(text) => parts.push(text.text.clone()),
            RawContent::Image(_) => parts.push("[image content]".to_string()),
            RawContent::Audio(_) => parts.push("[audio content]".to_string()),
            RawContent::Resource(_) => parts.push("[embedded resource]".to_string()),
            other => match serde_json::to_string(other) {
                Ok(json) => parts.push(json),
                Err(_) => parts.push("[unrenderable content]".to_string()),
            },
        }
    }
    parts.join("\n")
}
