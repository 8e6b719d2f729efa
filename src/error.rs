//! Error types for the chat relay
//!
//! Defines application-level errors and outbox delivery errors.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;
use tokio_util::codec::AnyDelimiterCodecError;

/// Application-level errors
///
/// Covers both fatal errors (connection teardown) and
/// recoverable errors (a notice is sent to the offending client).
#[derive(Debug, Error)]
pub enum AppError {
    /// IO error (fatal to the connection)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The registry mailbox is closed (server shutting down)
    #[error("Registry closed")]
    RegistryClosed,

    /// The channel actor is gone
    #[error("Channel '{0}' closed")]
    ChannelClosed(String),

    /// Requested username is held by another client
    #[error("Username unavailable: {0}")]
    NameUnavailable(String),

    /// `/chch` without a channel name
    #[error("Missing channel name")]
    MissingChannelName,

    /// `/chun` without a username
    #[error("Missing username")]
    MissingUsername,

    /// `/msg` without both recipient and text
    #[error("Malformed private message")]
    MalformedPrivateMessage,

    /// Inbound line exceeded the configured maximum length (ends the stream)
    #[error("Line too long")]
    LineTooLong,
}

impl AppError {
    /// Whether the error is recoverable by sending the client a notice
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AppError::NameUnavailable(_)
                | AppError::MissingChannelName
                | AppError::MissingUsername
                | AppError::MalformedPrivateMessage
        )
    }
}

impl From<AnyDelimiterCodecError> for AppError {
    fn from(err: AnyDelimiterCodecError) -> Self {
        match err {
            AnyDelimiterCodecError::MaxChunkLengthExceeded => AppError::LineTooLong,
            AnyDelimiterCodecError::Io(e) => AppError::Io(e),
        }
    }
}

/// Outbox delivery errors
///
/// Occurs when a message cannot be queued for a client's writer loop.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// The outbox is at capacity; the client has been disconnected
    #[error("Outbox full")]
    Full,

    /// The writer loop has ended
    #[error("Outbox closed")]
    Closed,
}
