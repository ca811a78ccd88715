//! The mgate dispatch engine.
//!
//! Callers hand the [`Gateway`] a typed request envelope; it validates,
//! injects MCP-discovered tools, runs the plugin pipeline around the
//! attempt, pushes the work onto the target provider's bounded queue, and
//! walks the ordered fallback chain on failure. Worker pools apply retries
//! and the key-selection policy per attempt.

mod message;
mod pool;
mod worker;

pub mod engine;
pub mod plugin;

pub use engine::{Gateway, GatewayConfig};
pub use plugin::{
    ChunkHookRunner, HookOutcome, Plugin, PluginError, PluginRegistry, ShortCircuit,
};

// Re-export the surfaces an embedding host wires together.
pub use mgate_protocol::{Fallback, GatewayRequest, GatewayResponse, RequestPayload, ResponseExtra};

pub use mgate_common::{
    ErrorKind, ErrorOrigin, GatewayError, GatewayResult, Provider, RequestContext, RequestKind,
    keys,
};
pub use mgate_mcp::{McpClientConfig, McpClientStatus, McpConfig, McpTransportConfig, ToolHandler};
pub use mgate_provider_core::{
    AccountSource, AdapterRegistry, ChunkReceiver, ChunkSender, Credential, KeySelector,
    NetworkConfig, ProviderAdapter, ProviderRuntimeConfig, StreamChunkHook,
    WeightedRandomSelector,
};
