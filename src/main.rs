//! framewire: an event-driven frame server
//!
//! Accepts TCP connections, decodes one length-prefixed JSON-header
//! frame per request, and answers through the built-in search handler.
//!
//! Features:
//! - Incremental decoding across arbitrary read boundaries
//! - Single-shot or persistent connections
//! - Configuration via CLI arguments or TOML file

use framewire::config::Config;
use framewire::runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        mode = ?config.mode,
        max_payload_size = config.max_payload_size,
        "Starting framewire server"
    );

    runtime::run(&config)?;
    Ok(())
}
