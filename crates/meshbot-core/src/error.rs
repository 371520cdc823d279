//! Error taxonomy shared by every meshbot layer.
//!
//! The four families mirror how far a failure is allowed to travel:
//!
//! - [`StoreError`]: the persistence store failed. Fatal to the event being
//!   processed, never to the process.
//! - [`PluginError`]: one plugin failed. Logged and isolated.
//! - [`TransportError`]: an outbound send (or a radio connection) failed.
//!   Reported to the caller, never retried automatically.
//! - [`DispatchError`]: what `submit` hands back to a producer.

use std::time::Duration;

use thiserror::Error;

// =============================================================================
// Store Errors
// =============================================================================

/// Errors raised by a [`Store`](crate::Store) implementation.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The backing database could not be opened or a connection could not be acquired.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A statement or transaction failed.
    #[error("store transaction failed: {0}")]
    Transaction(String),

    /// A stored row could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// The store was closed during shutdown.
    #[error("store is closed")]
    Closed,
}

impl StoreError {
    /// Creates a transaction error from any displayable cause.
    pub fn transaction(cause: impl std::fmt::Display) -> Self {
        Self::Transaction(cause.to_string())
    }

    /// Creates an unavailable error from any displayable cause.
    pub fn unavailable(cause: impl std::fmt::Display) -> Self {
        Self::Unavailable(cause.to_string())
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

// =============================================================================
// Plugin Errors
// =============================================================================

/// Errors raised while loading or running a plugin.
#[derive(Debug, Clone, Error)]
pub enum PluginError {
    /// The plugin returned an error from one of its hooks.
    #[error("plugin '{plugin}' failed: {reason}")]
    Failed {
        /// Plugin name.
        plugin: String,
        /// Error reported by the plugin.
        reason: String,
    },

    /// The plugin panicked inside one of its hooks.
    #[error("plugin '{plugin}' panicked: {message}")]
    Panicked {
        /// Plugin name.
        plugin: String,
        /// Panic payload, when it was a string.
        message: String,
    },

    /// The plugin exceeded its time budget.
    #[error("plugin '{plugin}' exceeded its {budget:?} budget")]
    TimedOut {
        /// Plugin name.
        plugin: String,
        /// The budget that was exceeded.
        budget: Duration,
    },

    /// The plugin's manifest or config section is unusable.
    #[error("plugin '{plugin}' has invalid configuration: {reason}")]
    InvalidConfig {
        /// Plugin name.
        plugin: String,
        /// What was wrong.
        reason: String,
    },
}

impl PluginError {
    /// Creates a [`PluginError::Failed`].
    pub fn failed(plugin: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Failed {
            plugin: plugin.into(),
            reason: reason.to_string(),
        }
    }

    /// Creates a [`PluginError::InvalidConfig`].
    pub fn invalid_config(plugin: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::InvalidConfig {
            plugin: plugin.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns the name of the plugin that failed.
    pub fn plugin(&self) -> &str {
        match self {
            Self::Failed { plugin, .. }
            | Self::Panicked { plugin, .. }
            | Self::TimedOut { plugin, .. }
            | Self::InvalidConfig { plugin, .. } => plugin,
        }
    }
}

/// Result type for plugin hooks.
pub type PluginResult<T> = Result<T, PluginError>;

// =============================================================================
// Transport Errors
// =============================================================================

/// Errors that can occur in radio or HTTP transport operations.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {url} - {reason}")]
    ConnectionFailed {
        /// The URL that failed to connect.
        url: String,
        /// Reason for failure.
        reason: String,
    },

    /// The selected radio node is not connected right now.
    #[error("radio node '{node}' is not connected")]
    NotConnected {
        /// Node name.
        node: String,
    },

    /// No radio node with this name is configured.
    #[error("unknown radio node '{0}'")]
    UnknownNode(String),

    /// No radio node is configured at all.
    #[error("no radio node available")]
    NoRadio,

    /// The radio accepted the frame but reported a failure.
    #[error("failed to send message: {0}")]
    SendFailed(String),

    /// Invalid configuration.
    #[error("invalid transport configuration: {0}")]
    InvalidConfig(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

// =============================================================================
// Dispatch Errors
// =============================================================================

/// Errors returned to a producer by the dispatcher's `submit`.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// The persistence write failed; the event was dropped.
    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    /// The submit budget elapsed. Processing continues in the background.
    #[error("dispatch exceeded its {budget:?} budget")]
    Timeout {
        /// The submit budget.
        budget: Duration,
    },

    /// The dispatcher no longer accepts events.
    #[error("dispatcher is shutting down")]
    ShuttingDown,

    /// The processing task died unexpectedly.
    #[error("dispatch task failed: {0}")]
    TaskFailed(String),
}

/// Result type for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_error_names_plugin() {
        let err = PluginError::failed("greeter", "boom");
        assert_eq!(err.plugin(), "greeter");
        assert_eq!(err.to_string(), "plugin 'greeter' failed: boom");
    }

    #[test]
    fn test_store_error_converts_into_dispatch_error() {
        let err: DispatchError = StoreError::Closed.into();
        assert!(matches!(err, DispatchError::Persistence(StoreError::Closed)));
    }
}
