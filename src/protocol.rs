//! # Wire Protocol
//!
//! Newline-terminated UTF-8 frames. Two inbound syntaxes share the socket,
//! distinguished by the first character of the line:
//!
//! - **Structured**: one JSON object per line,
//!   `{"command", "lockId"?, "mode"?, "timeout"?, "nonce"?}`.
//! - **Whitespace**: first token is the command, second (if any) is the
//!   lock id. Meant for interactive telnet/netcat use; it does not surface
//!   `mode`, `timeout` or `nonce`.
//!
//! A line that fails structured parsing falls through to the whitespace
//! interpretation. Every outbound frame is one JSON object with at least
//! `status`.

use serde::{Deserialize, Serialize};

use crate::base::{LockId, Mode, Nonce, WardenResult};

/// One decoded inbound request.
///
/// Command tokens are matched case-insensitively; lock ids are
/// case-sensitive. Malformed lines still decode, into [`Command::Invalid`],
/// so the dispatcher can answer them with a status code instead of
/// dropping the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Wisdom {
        nonce: Nonce,
    },
    Acquire {
        lock_id: LockId,
        mode: Mode,
        timeout_ms: Option<u64>,
        nonce: Nonce,
    },
    Release {
        lock_id: LockId,
        nonce: Nonce,
    },
    ReleaseAll {
        nonce: Nonce,
    },
    Show {
        nonce: Nonce,
    },
    Quit {
        nonce: Nonce,
    },
    Invalid {
        kind: InvalidCommand,
        nonce: Nonce,
    },
}

/// Why a line failed to decode into a runnable command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidCommand {
    /// Command token not recognized, or a required argument is missing.
    Unknown,
    /// An acquire without a usable lock id.
    BadLockId,
}

/// The structured (JSON) inbound line shape.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StructuredLine {
    command: String,
    lock_id: Option<String>,
    mode: Option<Mode>,
    timeout: Option<u64>,
    nonce: Option<String>,
}

/// Decodes one inbound line into a [`Command`].
pub fn parse_line(line: &str) -> Command {
    let line = line.trim();
    if line.starts_with('{')
        && let Ok(structured) = serde_json::from_str::<StructuredLine>(line)
    {
        return assemble(
            &structured.command,
            structured.lock_id.as_deref(),
            structured.mode,
            structured.timeout,
            structured.nonce,
        );
    }

    // whitespace interpretation: command token, then an optional lock id
    let mut tokens = line.split_whitespace();
    let command = tokens.next().unwrap_or("");
    let lock_id = tokens.next();
    assemble(command, lock_id, None, None, None)
}

fn assemble(
    command: &str,
    lock_id: Option<&str>,
    mode: Option<Mode>,
    timeout_ms: Option<u64>,
    nonce: Nonce,
) -> Command {
    match command.to_ascii_uppercase().as_str() {
        "WISDOM" => Command::Wisdom { nonce },
        // `lock` is the historical interactive spelling of ACQUIRE
        "ACQUIRE" | "LOCK" => match lock_id.map(LockId::try_from) {
            Some(Ok(lock_id)) => Command::Acquire {
                lock_id,
                mode: mode.unwrap_or(Mode::Write),
                timeout_ms,
                nonce,
            },
            _ => Command::Invalid {
                kind: InvalidCommand::BadLockId,
                nonce,
            },
        },
        "RELEASE" => match lock_id.map(LockId::try_from) {
            Some(Ok(lock_id)) => Command::Release { lock_id, nonce },
            _ => Command::Invalid {
                kind: InvalidCommand::Unknown,
                nonce,
            },
        },
        "RELEASEALL" => Command::ReleaseAll { nonce },
        "SHOW" => Command::Show { nonce },
        "QUIT" => Command::Quit { nonce },
        _ => Command::Invalid {
            kind: InvalidCommand::Unknown,
            nonce,
        },
    }
}

/// Outbound `status` values.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Status {
    #[display("IMUSTBLOCKYOU")]
    #[serde(rename = "IMUSTBLOCKYOU")]
    ImustBlockYou,
    #[display("LOCKED")]
    #[serde(rename = "LOCKED")]
    Locked,
    #[display("LOCKPENDING")]
    #[serde(rename = "LOCKPENDING")]
    LockPending,
    #[display("RELEASED")]
    #[serde(rename = "RELEASED")]
    Released,
    #[display("ACQUIRETIMEOUT")]
    #[serde(rename = "ACQUIRETIMEOUT")]
    AcquireTimeout,
    #[display("NOLOCKTORELEASE")]
    #[serde(rename = "NOLOCKTORELEASE")]
    NoLockToRelease,
    #[display("NOLOCKSTORELEASEALL")]
    #[serde(rename = "NOLOCKSTORELEASEALL")]
    NoLocksToReleaseAll,
    #[display("CANNOTACQUIREINVALIDLOCKID")]
    #[serde(rename = "CANNOTACQUIREINVALIDLOCKID")]
    CannotAcquireInvalidLockId,
    #[display("SHOW")]
    #[serde(rename = "SHOW")]
    Show,
    #[display("WISDOM")]
    #[serde(rename = "WISDOM")]
    Wisdom,
    #[display("GOINPIECES")]
    #[serde(rename = "GOINPIECES")]
    GoInPieces,
    #[display("COMMANDNOTFOUND")]
    #[serde(rename = "COMMANDNOTFOUND")]
    CommandNotFound,
}

/// One entry of a SHOW response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockSummary {
    pub lock_id: LockId,
    pub writer: bool,
    pub readers: usize,
    pub pending_writers: usize,
    pub pending_readers: usize,
}

/// One outbound response frame.
///
/// The `nonce` array echoes, in order, every correlation token the
/// response answers for: a release response carries the holder's original
/// acquire nonce first, then the release nonce.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_id: Option<LockId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub nonce: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locks: Option<Vec<LockSummary>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wisdom: Option<&'static str>,
}

impl Frame {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            lock_id: None,
            mode: None,
            nonce: Vec::new(),
            locks: None,
            wisdom: None,
        }
    }

    pub fn with_lock(mut self, lock_id: &LockId) -> Self {
        self.lock_id = Some(lock_id.clone());
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Appends the token to the echo list, if the request carried one.
    pub fn with_nonce(mut self, nonce: &Nonce) -> Self {
        if let Some(nonce) = nonce {
            self.nonce.push(nonce.clone());
        }
        self
    }

    pub fn with_locks(mut self, locks: Vec<LockSummary>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn with_wisdom(mut self, wisdom: &'static str) -> Self {
        self.wisdom = Some(wisdom);
        self
    }

    /// Serializes to one newline-terminated JSON line.
    pub fn encode(&self) -> WardenResult<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_id(raw: &str) -> LockId {
        LockId::try_from(raw).unwrap()
    }

    #[test]
    fn test_whitespace_and_structured_lines_decode_alike() {
        let from_text = parse_line("lock HelloWorld\n");
        let from_json = parse_line("{\"command\":\"ACQUIRE\",\"lockId\":\"HelloWorld\"}\n");
        assert_eq!(
            from_text,
            Command::Acquire {
                lock_id: lock_id("HelloWorld"),
                mode: Mode::Write,
                timeout_ms: None,
                nonce: None,
            }
        );
        assert_eq!(from_text, from_json);
    }

    #[test]
    fn test_structured_line_carries_all_fields() {
        let command = parse_line(
            "{\"command\":\"acquire\",\"lockId\":\"db\",\"mode\":\"R\",\
             \"timeout\":2500,\"nonce\":\"n-17\"}",
        );
        assert_eq!(
            command,
            Command::Acquire {
                lock_id: lock_id("db"),
                mode: Mode::Read,
                timeout_ms: Some(2500),
                nonce: Some("n-17".to_owned()),
            }
        );
    }

    #[test]
    fn test_bad_json_falls_through_to_whitespace() {
        // not valid JSON, and `{"command":` is no known command token
        assert_eq!(
            parse_line("{\"command\": release\n"),
            Command::Invalid {
                kind: InvalidCommand::Unknown,
                nonce: None,
            }
        );
        // broken JSON whose first token still reads as a command
        assert_eq!(
            parse_line("show {\"oops\"\n"),
            Command::Show { nonce: None }
        );
    }

    #[test]
    fn test_command_token_is_case_insensitive() {
        assert_eq!(parse_line("ReLeAsEaLl\n"), Command::ReleaseAll { nonce: None });
        assert_eq!(
            parse_line("release printer\n"),
            Command::Release {
                lock_id: lock_id("printer"),
                nonce: None,
            }
        );
    }

    #[test]
    fn test_acquire_without_lock_id_is_rejected() {
        assert_eq!(
            parse_line("ACQUIRE\n"),
            Command::Invalid {
                kind: InvalidCommand::BadLockId,
                nonce: None,
            }
        );
        assert_eq!(
            parse_line("{\"command\":\"ACQUIRE\",\"lockId\":\"\",\"nonce\":\"n\"}"),
            Command::Invalid {
                kind: InvalidCommand::BadLockId,
                nonce: Some("n".to_owned()),
            }
        );
    }

    #[test]
    fn test_unknown_command_keeps_its_nonce() {
        assert_eq!(
            parse_line("{\"command\":\"FROBNICATE\",\"nonce\":\"n-9\"}"),
            Command::Invalid {
                kind: InvalidCommand::Unknown,
                nonce: Some("n-9".to_owned()),
            }
        );
    }

    #[test]
    fn test_frame_encoding_omits_absent_fields() {
        let line = Frame::new(Status::ImustBlockYou).encode().unwrap();
        assert_eq!(line, "{\"status\":\"IMUSTBLOCKYOU\"}\n");
    }

    #[test]
    fn test_release_frame_orders_nonces_acquire_first() {
        let acquire_nonce = Some("from-acquire".to_owned());
        let release_nonce = Some("from-release".to_owned());
        let frame = Frame::new(Status::Released)
            .with_lock(&lock_id("db"))
            .with_mode(Mode::Write)
            .with_nonce(&acquire_nonce)
            .with_nonce(&release_nonce);
        let line = frame.encode().unwrap();
        assert_eq!(
            line,
            "{\"status\":\"RELEASED\",\"lockId\":\"db\",\"mode\":\"W\",\
             \"nonce\":[\"from-acquire\",\"from-release\"]}\n"
        );
    }

    #[test]
    fn test_show_frame_lists_lock_summaries() {
        let frame = Frame::new(Status::Show).with_locks(vec![LockSummary {
            lock_id: lock_id("db"),
            writer: true,
            readers: 0,
            pending_writers: 2,
            pending_readers: 1,
        }]);
        let line = frame.encode().unwrap();
        assert_eq!(
            line,
            "{\"status\":\"SHOW\",\"locks\":[{\"lockId\":\"db\",\"writer\":true,\
             \"readers\":0,\"pendingWriters\":2,\"pendingReaders\":1}]}\n"
        );
    }
}
