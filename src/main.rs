//! Execution core — sandboxed code-execution service entrypoint.

use anyhow::Result;
use tracing::error;

use tee_core::config::Configuration;

mod cmd;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Configuration::load()?;

    let log_level = if config.debug { "debug" } else { config.log.level.as_str() };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("tee_core={log_level}").into());

    if config.log.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    if let Err(e) = cmd::root::run(config).await {
        error!("fatal error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
