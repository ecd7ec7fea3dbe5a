use thiserror::Error;

pub type Result<T, E = MediaError> = core::result::Result<T, E>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// The adapter is not started, or already closed. Callers get no way to
    /// tell the two apart; a fresh adapter is the only recovery.
    #[error("resource closed")]
    ResourceClosed,
    /// The calling layer broke the media contract.
    #[error("media contract violation: {0}")]
    ContractViolation(&'static str),
    #[error("interface not found: {0}")]
    InterfaceNotFound(String),
    #[error("operation not supported on this backend: {0}")]
    Unsupported(&'static str),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("timeout")]
    Timeout,
    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),
    /// Transmit failure reported by the driver or hardware.
    #[error("driver error: {0}")]
    Driver(String),
}

impl From<std::io::Error> for MediaError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => MediaError::Timeout,
            _ => MediaError::Io(e.to_string()),
        }
    }
}
