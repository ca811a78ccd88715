//! MCP integration for mgate.
//!
//! A manager owns a set of named MCP clients (HTTP, stdio, SSE or
//! in-process), keeps a tool catalog per client, dispatches tool calls, and
//! hosts a local in-process server for tools registered by the embedding
//! application. All transport I/O happens with no manager lock held.

pub mod config;
pub mod local;
pub mod manager;

pub use config::{McpClientConfig, McpConfig, McpTransportConfig};
pub use local::{FnToolHandler, LocalToolServer, ToolHandler};
pub use manager::{LOCAL_CLIENT_NAME, McpClientStatus, McpManager};
