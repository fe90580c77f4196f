//! Error types for the shared exchange.

use crate::ExchangeState;

/// Exchange operation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A send was attempted while the exchange was not ready for one.
    /// Carries the header state observed under the lock.
    IllegalState(ExchangeState),
    /// The deadline elapsed while waiting for the peer.
    /// Carries the header state observed at timeout.
    TimedOut(ExchangeState),
    /// Shutdown was observed while waiting.
    ShutdownInProgress,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IllegalState(state) => write!(f, "send request in wrong state: {}", state),
            Error::TimedOut(state) => write!(f, "timed out waiting, state: {}", state),
            Error::ShutdownInProgress => write!(f, "shutting down shared exchange"),
        }
    }
}

impl std::error::Error for Error {}

/// Result type for exchange operations.
pub type Result<T> = std::result::Result<T, Error>;
