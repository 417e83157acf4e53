use thiserror::Error;

use crate::config::ConfigError;
use outpost_net::NetError;

/// Startup and lifecycle failures. These abort the process with a non-zero
/// exit code; everything that happens after startup is logged and counted
/// instead.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid ip routes: {0}")]
    Routes(#[from] NetError),

    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
