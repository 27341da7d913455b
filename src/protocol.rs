//! Wire encoding between clients and the relay.
//!
//! Everything the relay reads or writes crosses this module: the `NAME:`
//! handshake, slash commands, `CONTROL:` notices and opaque audio frames.
//! Routing and call state never look at raw bytes.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use crate::error::ProtocolError;

pub const HANDSHAKE_PREFIX: &str = "NAME:";
pub const CONTROL_PREFIX: &str = "CONTROL:";

/// Sent bare, then the socket is closed. Never carries the control prefix.
pub const SERVER_FULL: &[u8] = b"SERVER_FULL";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake<'a> {
    pub name: String,
    /// Whatever followed the first line in the same chunk.
    pub trailing: &'a [u8],
}

/// Parses the first chunk a client sends.
///
/// Only the first line is the name. It is trimmed and stripped of control
/// characters, so a name can never span notice lines.
pub fn parse_handshake(chunk: &[u8]) -> Result<Handshake<'_>, ProtocolError> {
    let body = chunk
        .strip_prefix(HANDSHAKE_PREFIX.as_bytes())
        .ok_or(ProtocolError::MissingName)?;

    let (line, trailing) = match body.iter().position(|&b| b == b'\n') {
        Some(end) => (&body[..end], &body[end + 1..]),
        None => (body, &body[body.len()..]),
    };

    let name: String = String::from_utf8_lossy(line)
        .chars()
        .filter(|c| !c.is_control())
        .collect();

    Ok(Handshake {
        name: name.trim().to_string(),
        trailing,
    })
}

pub fn encode_handshake(name: &str) -> Vec<u8> {
    format!("{HANDSHAKE_PREFIX}{name}").into_bytes()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Call(String),
    Accept,
    Reject,
    End,
}

pub fn parse_command(line: &str) -> Result<Command, ProtocolError> {
    let mut parts = line.trim().splitn(2, ' ');

    let cmd = parts.next().unwrap_or("");

    let rest = parts.next().map(str::trim).filter(|s| !s.is_empty());

    match cmd {
        "/call" => {
            let name = rest.ok_or(ProtocolError::MissingArgument("/call <name>"))?;
            Ok(Command::Call(name.to_string()))
        }
        "/accept" => Ok(Command::Accept),
        "/reject" => Ok(Command::Reject),
        "/end" => Ok(Command::End),
        _ => Err(ProtocolError::UnknownCommand(cmd.to_string())),
    }
}

/// Classification of one inbound chunk after the handshake.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound<'a> {
    /// Non-empty lines of a slash-command chunk.
    Commands(Vec<&'a str>),
    Audio(&'a [u8]),
}

/// A chunk is a command chunk only if it is valid UTF-8 whose first
/// non-blank character is `/`. Anything else is audio, whatever it contains.
pub fn classify(chunk: &[u8]) -> Inbound<'_> {
    match std::str::from_utf8(chunk) {
        Ok(text) if text.trim_start().starts_with('/') => Inbound::Commands(
            text.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .collect(),
        ),
        _ => Inbound::Audio(chunk),
    }
}

/// Server-originated notice, written as `CONTROL:<text>\n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Joined(String),
    Left(String),
    IncomingCall(String),
    Calling,
    CallAccepted,
    CallRejected,
    CallEnded,
    UserNotFound,
    NoCallToAccept,
    NoCallToReject,
    NoActiveCall,
    /// Command the relay could not act on (usage errors, unknown commands).
    Error(String),
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::Joined(name) => write!(f, "SERVER: {name} joined"),
            Notice::Left(name) => write!(f, "SERVER: {name} left"),
            Notice::IncomingCall(caller) => write!(f, "INCOMING_CALL:{caller}"),
            Notice::Calling => f.write_str("CALLING..."),
            Notice::CallAccepted => f.write_str("CALL_ACCEPTED"),
            Notice::CallRejected => f.write_str("CALL_REJECTED"),
            Notice::CallEnded => f.write_str("CALL_ENDED"),
            Notice::UserNotFound => f.write_str("User not found"),
            Notice::NoCallToAccept => f.write_str("No call to accept"),
            Notice::NoCallToReject => f.write_str("No call to reject"),
            Notice::NoActiveCall => f.write_str("No active call"),
            Notice::Error(text) => f.write_str(text),
        }
    }
}

impl Notice {
    pub fn encode(&self) -> Vec<u8> {
        format!("{CONTROL_PREFIX}{self}\n").into_bytes()
    }

    /// Inverse of [`Notice::encode`] for a single line, prefix included.
    /// Returns `None` for lines that are not control notices.
    pub fn parse(line: &str) -> Option<Notice> {
        let body = line.trim_end_matches(['\r', '\n']).strip_prefix(CONTROL_PREFIX)?;

        if let Some(rest) = body.strip_prefix("SERVER: ") {
            if let Some(name) = rest.strip_suffix(" joined") {
                return Some(Notice::Joined(name.to_string()));
            }
            if let Some(name) = rest.strip_suffix(" left") {
                return Some(Notice::Left(name.to_string()));
            }
        }

        if let Some(caller) = body.strip_prefix("INCOMING_CALL:") {
            return Some(Notice::IncomingCall(caller.to_string()));
        }

        let notice = match body {
            "CALLING..." => Notice::Calling,
            "CALL_ACCEPTED" => Notice::CallAccepted,
            "CALL_REJECTED" => Notice::CallRejected,
            "CALL_ENDED" => Notice::CallEnded,
            "User not found" => Notice::UserNotFound,
            "No call to accept" => Notice::NoCallToAccept,
            "No call to reject" => Notice::NoCallToReject,
            "No active call" => Notice::NoActiveCall,
            other => Notice::Error(other.to_string()),
        };

        Some(notice)
    }
}

/// One item on a connection's outbound queue.
///
/// Audio is shared between every recipient of a fan-out, so it is
/// reference counted rather than copied per peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Notice(Notice),
    Audio(Arc<[u8]>),
}

impl Outbound {
    pub fn bytes(&self) -> Cow<'_, [u8]> {
        match self {
            Outbound::Notice(notice) => Cow::Owned(notice.encode()),
            Outbound::Audio(frame) => Cow::Borrowed(&frame[..]),
        }
    }
}

impl From<Notice> for Outbound {
    fn from(notice: Notice) -> Self {
        Outbound::Notice(notice)
    }
}
