//! Top-level client errors

use std::fmt;
use std::io;

use crate::config::ConfigError;
use crate::crypto::CryptoError;
use crate::lifecycle::DialError;
use crate::route::RouteError;

/// Reasons `run_client` gives up
#[derive(Debug)]
pub enum ClientError {
    /// Configuration rejected before anything was opened
    Config(ConfigError),
    /// Cipher could not be set up
    Crypto(CryptoError),
    /// Explicit bind address unusable
    Route(RouteError),
    /// Initial connect failed and is not deferrable
    Dial(DialError),
    /// Could not detach into the background
    Daemonize(io::Error),
    /// Event loop failure
    Poll(io::Error),
}

impl ClientError {
    /// Negative errno-style code for the process exit path
    pub fn code(&self) -> i32 {
        match self {
            ClientError::Dial(DialError::InvalidAddress(_)) => -libc::EINVAL,
            ClientError::Dial(DialError::BindUnavailable { .. }) => -libc::EADDRNOTAVAIL,
            ClientError::Dial(DialError::Resolve(_)) | ClientError::Dial(DialError::Connect(_)) => {
                -libc::EAGAIN
            }
            ClientError::Route(RouteError::InvalidAddress(_)) => -libc::EINVAL,
            ClientError::Route(_) => -libc::EADDRNOTAVAIL,
            ClientError::Config(_) => -libc::EINVAL,
            _ => -1,
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Config(e) => write!(f, "invalid configuration: {}", e),
            ClientError::Crypto(e) => write!(f, "cipher setup failed: {}", e),
            ClientError::Route(e) => write!(f, "bind address rejected: {}", e),
            ClientError::Dial(e) => write!(f, "{}", e),
            ClientError::Daemonize(e) => write!(f, "daemonize failed: {}", e),
            ClientError::Poll(e) => write!(f, "event loop failed: {}", e),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Config(e) => Some(e),
            ClientError::Crypto(e) => Some(e),
            ClientError::Route(e) => Some(e),
            ClientError::Dial(e) => Some(e),
            ClientError::Daemonize(e) => Some(e),
            ClientError::Poll(e) => Some(e),
        }
    }
}

impl From<ConfigError> for ClientError {
    fn from(e: ConfigError) -> Self {
        ClientError::Config(e)
    }
}

impl From<CryptoError> for ClientError {
    fn from(e: CryptoError) -> Self {
        ClientError::Crypto(e)
    }
}

impl From<RouteError> for ClientError {
    fn from(e: RouteError) -> Self {
        ClientError::Route(e)
    }
}

impl From<DialError> for ClientError {
    fn from(e: DialError) -> Self {
        ClientError::Dial(e)
    }
}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        ClientError::Poll(e)
    }
}
