//! Error types for the meshbot framework.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while discovering or loading plugin manifests.
///
/// Per-manifest failures are logged and skipped by
/// [`PluginRegistry::load`](crate::plugin::PluginRegistry::load); only a
/// directory that cannot be read aborts the whole load.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// The plugin directory could not be listed.
    #[error("cannot read plugin directory {}: {reason}", path.display())]
    Directory {
        /// Directory that was scanned.
        path: PathBuf,
        /// Underlying I/O error.
        reason: String,
    },

    /// A manifest is not valid TOML or has the wrong shape.
    #[error("invalid plugin manifest '{file}': {reason}")]
    Manifest {
        /// Manifest file name.
        file: String,
        /// Parse error.
        reason: String,
    },

    /// A manifest names a kind that is neither compiled in nor registered.
    #[error("plugin manifest '{file}' names unknown kind '{kind}'")]
    UnknownKind {
        /// Manifest file name.
        file: String,
        /// The requested kind.
        kind: String,
    },

    /// The factory for a kind failed or panicked.
    #[error("plugin '{file}' could not be created: {reason}")]
    Factory {
        /// Manifest file name.
        file: String,
        /// Error reported by the factory.
        reason: String,
    },
}

impl RegistryError {
    /// Creates a [`RegistryError::Manifest`].
    pub fn manifest(file: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Manifest {
            file: file.into(),
            reason: reason.to_string(),
        }
    }

    /// Creates a [`RegistryError::Factory`].
    pub fn factory(file: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Factory {
            file: file.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;
