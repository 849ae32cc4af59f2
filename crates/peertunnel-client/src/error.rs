use peertunnel_connection::DialError;
use thiserror::Error;

/// Tunnel client errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Not a tunnel address: {0}")]
    InvalidAddress(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Failed to connect to portal: {0}")]
    Dial(#[from] DialError),

    #[error("Tunnel node is shut down")]
    Shutdown,
}

impl TunnelError {
    /// Returns true if this error is non-recoverable and retrying won't help
    pub fn is_non_recoverable(&self) -> bool {
        matches!(
            self,
            TunnelError::InvalidAddress(_) | TunnelError::ConfigError(_) | TunnelError::Shutdown
        )
    }
}
