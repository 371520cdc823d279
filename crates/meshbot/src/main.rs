//! The `meshbot` binary.
//!
//! ```bash
//! meshbot --config /config/config.toml
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use meshbot::runtime::{MeshRuntime, config_path};

/// Mesh radio chat bot.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Configuration file, created with defaults when missing.
    #[arg(short, long, env = "CONFIG_PATH")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let path = config_path(args.config);

    let runtime = MeshRuntime::builder()
        .config_file(&path)
        .create_missing()
        .build()
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;

    runtime.run().await?;
    Ok(())
}
