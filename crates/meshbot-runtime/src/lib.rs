//! meshbot runtime: configuration, logging, the scheduler and service
//! orchestration.
//!
//! [`MeshRuntime`] owns the startup order:
//!
//! 1. open the SQLite store
//! 2. load and start plugins from the plugin directory
//! 3. connect every configured radio node
//! 4. build the dispatcher (with the webhook observer when configured)
//! 5. start the scheduler and the HTTP API
//!
//! and stops everything in reverse on Ctrl+C or SIGTERM.
//!
//! ```ignore
//! use meshbot_runtime::MeshRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     MeshRuntime::builder()
//!         .config_file("config.toml")
//!         .create_missing()
//!         .build()?
//!         .run()
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! # Configuration
//!
//! Values are layered: built-in defaults, then the TOML file, then
//! `MESHBOT_*` environment variables (`__` separates nested keys, e.g.
//! `MESHBOT_API__PORT=9000`).

pub mod config;
pub mod error;
pub mod logging;
pub mod runtime;
pub mod scheduler;

// Re-exports
pub use config::{ConfigError, ConfigLoader, ConfigResult, MeshConfig, config_path};
pub use error::{RuntimeError, RuntimeResult};
pub use logging::LoggingBuilder;
pub use runtime::{MeshRuntime, RuntimeBuilder, Services, wait_for_shutdown};
pub use scheduler::{ScheduledJob, Scheduler};

// Re-export tracing for use by other crates
pub use tracing;
pub use tracing_subscriber;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use tracing::{Level, debug, error, info, instrument, span, trace, warn};
}
