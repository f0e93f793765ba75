//! Log output setup for router binaries.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{Error, Result};

/// Line format of log output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Log settings carried in [`RouterConfig`](crate::RouterConfig).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directives used when `RUST_LOG` is unset.
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "pipemesh_router=info,pipemesh_kv=info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Install the global tracing subscriber described by `config`. `RUST_LOG`
/// overrides `config.filter` when set.
pub fn init_tracing(config: &LogConfig) -> Result<()> {
    let filter = env_filter(std::env::var("RUST_LOG").ok().as_deref(), &config.filter)?;
    let registry = tracing_subscriber::registry().with(filter);
    let installed = match config.format {
        LogFormat::Text => registry.with(fmt::layer()).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
    };
    installed.map_err(|e| Error::Config(format!("Failed to install tracing subscriber: {e}")))
}

fn env_filter(rust_log: Option<&str>, fallback: &str) -> Result<EnvFilter> {
    let directives = rust_log.unwrap_or(fallback);
    EnvFilter::try_new(directives)
        .map_err(|e| Error::Config(format!("Invalid log filter {directives:?}: {e}")))
}
