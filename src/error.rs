//! Error types for backhaul.

use thiserror::Error;

use crate::auth::AuthError;
use crate::socks::SocksError;

/// Process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Normal exit
    Success = 0,
    /// Startup failure or shutdown watchdog expiry
    Failure = 1,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

/// Main error type for backhaul.
#[derive(Debug, Error)]
pub enum Error {
    #[error("listen failed: {0}")]
    ListenFailed(String),

    #[error("connection failed: {0}")]
    ConnectFailed(String),

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("proxy error: {0}")]
    Proxy(#[from] SocksError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns the exit code for this error.
    pub fn exit_code(&self) -> ExitCode {
        ExitCode::Failure
    }
}

/// Result type alias for backhaul operations.
pub type Result<T> = std::result::Result<T, Error>;
