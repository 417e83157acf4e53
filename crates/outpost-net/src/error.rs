use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("invalid route spec '{0}'")]
    InvalidRoute(String),

    #[error("invalid target ip '{0}'")]
    InvalidTarget(String),

    #[error("invalid host:port address '{0}'")]
    InvalidAddress(String),

    #[error("name resolution failed for '{host}': {source}")]
    Resolve {
        host: String,
        source: std::io::Error,
    },

    #[error("no IPv4 records found for '{0}'")]
    NoRecords(String),

    #[error("dialing to the given TCP address timed out")]
    DialTimeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl NetError {
    /// Whether this failure exhausted a dial or request deadline. The
    /// executor counts these separately from other transport errors.
    pub fn is_timeout(&self) -> bool {
        matches!(self, NetError::DialTimeout)
    }
}
