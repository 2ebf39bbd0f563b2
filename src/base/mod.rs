//! This module contains base types that are used across Warden.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::coordinator::CoordinatorMessage;

/// Stable identity of one TCP connection.
///
/// Allocated from a counter at accept time. A reconnect is a new
/// connection and gets a fresh id; the remote address is never part of
/// the identity.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display("conn-{_0}")]
pub struct ConnId(u64);

impl ConnId {
    pub(crate) const fn new(id: u64) -> Self {
        Self(id)
    }
}

/// Identity of one queued acquire request.
///
/// A deadline timer carries only this id back into the coordinator, so
/// the wakeup can check whether its record is still queued before acting.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[display("record-{_0}")]
pub struct RecordId(u64);

impl RecordId {
    pub(crate) const fn new(id: u64) -> Self {
        Self(id)
    }
}

/// A lock name. Non-empty, no embedded whitespace; equality is bytewise.
#[derive(Debug, Display, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct LockId(String);

impl LockId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for LockId {
    type Error = WardenError;

    fn try_from(raw: &str) -> Result<Self, Self::Error> {
        if raw.is_empty() || raw.contains(char::is_whitespace) {
            return Err(WardenError::InvalidLockId);
        }
        Ok(Self(raw.to_owned()))
    }
}

/// Opaque correlation token supplied by the client, echoed verbatim on
/// every response tied to the request that carried it.
pub type Nonce = Option<String>;

/// The side of the reader/writer lock a request targets.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    #[display("R")]
    #[serde(rename = "R", alias = "r")]
    Read,
    #[display("W")]
    #[serde(rename = "W", alias = "w")]
    Write,
}

#[derive(Debug, Display, Error, From)]
pub enum WardenError {
    #[display("i/o error: {}", _0)]
    IoError(std::io::Error),

    #[display("failed to encode frame: {}", _0)]
    JsonError(serde_json::Error),

    #[from(skip)]
    #[display("lock id must be non-empty without whitespace")]
    InvalidLockId,

    #[display("could not send coordinator message: channel closed")]
    CoordinatorSendError(mpsc::error::SendError<CoordinatorMessage>),
}

pub type WardenResult<T> = Result<T, WardenError>;
