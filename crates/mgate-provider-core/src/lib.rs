//! Provider abstractions for mgate.
//!
//! This crate intentionally does **not** depend on any HTTP client or
//! framework. Adapters implement the capability trait against the neutral
//! protocol model; a higher layer owns queues, workers and IO policy.

pub mod account;
pub mod adapter;
pub mod config;
pub mod credential;
pub mod registry;
pub mod selector;

pub use account::AccountSource;
pub use adapter::{
    ChunkReceiver, ChunkSender, PassthroughChunkHook, ProviderAdapter, StreamChunkHook,
};
pub use config::{NetworkConfig, ProviderRuntimeConfig};
pub use credential::{AzureKeyConfig, BedrockKeyConfig, Credential, VertexKeyConfig};
pub use registry::AdapterRegistry;
pub use selector::{KeySelector, SelectKeyError, WeightedRandomSelector, select_key};
