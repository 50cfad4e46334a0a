//! Per-call metadata carried down the interceptor chain.

use serde::Serialize;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// Immutable context for one dispatch.
///
/// Interceptors may read it but never depend on any field being present;
/// a default context is valid for every action.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Conversation or task this call belongs to.
    pub session_id: Option<String>,
    /// Identity charged by the admission controller.
    pub caller_id: Option<String>,
    /// Free-form call metadata.
    pub metadata: HashMap<String, serde_json::Value>,
    /// Cooperative cancellation for the retry layer's sleeps.
    pub cancel: Option<CancellationToken>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set session identifier
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Set caller identifier
    pub fn with_caller_id(mut self, caller_id: impl Into<String>) -> Self {
        self.caller_id = Some(caller_id.into());
        self
    }

    /// Add call metadata
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(value) = serde_json::to_value(value) {
            self.metadata.insert(key.into(), value);
        }
        self
    }

    /// Attach a cancellation token
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}
