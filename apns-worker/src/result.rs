use std::io;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur while constructing a [`crate::Message`] or a
/// [`crate::ApnsClient`].
///
/// Runtime delivery faults (rejected notifications, dropped connections) never
/// produce an `Error`; they are reported through the error handler or absorbed
/// silently. See the crate documentation for the full taxonomy.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid device token: {0}")]
    InvalidToken(#[from] hex::FromHexError),

    #[error("device token must be 32 bytes, got {0}")]
    TokenLength(usize),

    #[error("message must have at least one token")]
    NoTokens,

    #[error("priority must be in [0, 255]")]
    InvalidPriority,

    #[error(transparent)]
    Payload(#[from] serde_json::Error),

    #[error("failed to load TLS credentials: {0}")]
    Tls(#[from] rustls::Error),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("no private key found in {0}")]
    NoPrivateKey(String),

    #[error("invalid server name: {0}")]
    InvalidServerName(String),

    #[error("the notification queue lock was poisoned by a panicked thread")]
    Poisoned,
}
