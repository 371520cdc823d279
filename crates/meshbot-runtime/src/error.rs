//! Runtime error types.

use thiserror::Error;

use meshbot_core::{StoreError, TransportError};
use meshbot_framework::RegistryError;

use crate::config::ConfigError;

/// Errors that stop the runtime from starting.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Configuration could not be loaded or is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The store could not be opened.
    #[error("store: {0}")]
    Store(#[from] StoreError),

    /// The plugin directory could not be read.
    #[error("plugins: {0}")]
    Registry(#[from] RegistryError),

    /// A listener or client could not be set up.
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
