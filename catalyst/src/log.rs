//! Logger initialization.

use anyhow::Context as _;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. The `RUST_LOG` environment variable wins
/// over the configured directive.
pub fn init(directive: Option<&str>) -> anyhow::Result<()> {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(env) => EnvFilter::try_new(env),
        Err(_) => EnvFilter::try_new(directive.unwrap_or("info")),
    }
    .context("invalid log directive")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|error| anyhow::anyhow!(error))
        .context("failed to install the tracing subscriber")?;

    Ok(())
}
