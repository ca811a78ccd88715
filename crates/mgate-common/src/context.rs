use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Well-known context keys read or written by the core.
pub mod keys {
    /// A caller-pinned credential that bypasses key selection.
    pub const DIRECT_KEY: &str = "direct-key";
    /// Correlation id attached to each fallback attempt.
    pub const FALLBACK_REQUEST_ID: &str = "fallback-request-id";
    /// Id of the credential the worker selected (written, not read).
    pub const SELECTED_KEY_ID: &str = "selected-key-id";
    /// Set when the engine is delivering the final chunk of a recovered stream.
    pub const STREAM_END: &str = "stream-end";
    pub const MCP_INCLUDE_CLIENTS: &str = "mcp-include-clients";
    pub const MCP_EXCLUDE_CLIENTS: &str = "mcp-exclude-clients";
    pub const MCP_INCLUDE_TOOLS: &str = "mcp-include-tools";
    pub const MCP_EXCLUDE_TOOLS: &str = "mcp-exclude-tools";
}

/// Per-request context: a cancellation token plus a shared value bag.
///
/// Clones share both; `child()` derives a token that is cancelled with the
/// parent but can be cancelled independently, while still sharing values.
#[derive(Clone)]
pub struct RequestContext {
    cancel: CancellationToken,
    values: Arc<Mutex<HashMap<String, Value>>>,
}

impl RequestContext {
    /// The process-wide root context; used when a caller passes none.
    pub fn background() -> Self {
        Self {
            cancel: CancellationToken::new(),
            values: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            cancel: token,
            values: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            values: Arc::clone(&self.values),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn insert<T: Serialize>(&self, key: &str, value: &T) {
        if let Ok(value) = serde_json::to_value(value) {
            self.values
                .lock()
                .expect("context values lock poisoned")
                .insert(key.to_string(), value);
        }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self
            .values
            .lock()
            .expect("context values lock poisoned")
            .get(key)
            .cloned()?;
        serde_json::from_value(value).ok()
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.values
            .lock()
            .expect("context values lock poisoned")
            .remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values
            .lock()
            .expect("context values lock poisoned")
            .contains_key(key)
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_round_trip_and_are_shared_with_children() {
        let ctx = RequestContext::background();
        ctx.insert(keys::SELECTED_KEY_ID, &"key-1");
        let child = ctx.child();
        assert_eq!(
            child.get::<String>(keys::SELECTED_KEY_ID).as_deref(),
            Some("key-1")
        );
        child.insert(keys::STREAM_END, &true);
        assert_eq!(ctx.get::<bool>(keys::STREAM_END), Some(true));
    }

    #[tokio::test]
    async fn child_cancellation_is_independent_of_parent() {
        let parent = RequestContext::background();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let other = parent.child();
        parent.cancel();
        other.cancelled().await;
        assert!(other.is_cancelled());
    }
}
