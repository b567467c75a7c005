//! Shared error taxonomy (§7). Handlers never re-raise to the dispatcher;
//! this enum reifies the four kinds the spec calls out so the dispatcher
//! boundary can decide what to do with each.

use std::fmt;
use std::io;

#[derive(Debug)]
pub enum HandlerError {
    /// Malformed token, single-frame decode failure, unknown token. Log at
    /// debug, drop the frame, connection continues.
    Transient(String),
    /// Auth failure, duplicate login, invalid INIT. Kills the session, not
    /// the server.
    Session(String),
    /// Transfer timeout, size-exceeded, I/O error, client abort. Transition
    /// the transfer to Failed/Aborted; session stays alive.
    Transfer(String),
    /// Tag pool exhaustion, unrecoverable codec failure. Logged at error;
    /// the operation fails but the server remains up.
    Fatal(String),
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerError::Transient(msg) => write!(f, "transient protocol error: {msg}"),
            HandlerError::Session(msg) => write!(f, "session error: {msg}"),
            HandlerError::Transfer(msg) => write!(f, "transfer error: {msg}"),
            HandlerError::Fatal(msg) => write!(f, "fatal internal error: {msg}"),
        }
    }
}

impl std::error::Error for HandlerError {}

impl From<io::Error> for HandlerError {
    fn from(err: io::Error) -> Self {
        HandlerError::Transfer(err.to_string())
    }
}

pub type HandlerResult<T> = Result<T, HandlerError>;
