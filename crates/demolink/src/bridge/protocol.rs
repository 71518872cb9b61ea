//! Text wire forms exchanged between the bridge and the supervisor.
//!
//! Two messages:
//! - **Control command** (commandsIn): `"<op> <tag>"`, op `1` = start, `-1` = stop
//! - **Channel pair** (commandsOut): `"<result_channel> <command_channel>"`

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::bus::Payload;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("expected {expected} tokens, got {got} in {raw:?}")]
    TokenCount {
        expected: usize,
        got: usize,
        raw: String,
    },
    #[error("unknown control op {0:?}")]
    UnknownOp(String),
    #[error("result and command channel must differ, both are {0:?}")]
    SameChannel(String),
    #[error("expected a text payload, got {0}")]
    NotText(&'static str),
}

/// Lifecycle operation requested of the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOp {
    Start,
    Stop,
}

impl ControlOp {
    pub fn wire(&self) -> &'static str {
        match self {
            Self::Start => "1",
            Self::Stop => "-1",
        }
    }
}

impl FromStr for ControlOp {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1" => Ok(Self::Start),
            "-1" => Ok(Self::Stop),
            other => Err(ProtocolError::UnknownOp(other.to_string())),
        }
    }
}

/// A start/stop request for one image tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlCommand {
    pub op: ControlOp,
    pub tag: String,
}

impl ControlCommand {
    pub fn start(tag: impl Into<String>) -> Self {
        Self {
            op: ControlOp::Start,
            tag: tag.into(),
        }
    }

    pub fn stop(tag: impl Into<String>) -> Self {
        Self {
            op: ControlOp::Stop,
            tag: tag.into(),
        }
    }
}

impl FromStr for ControlCommand {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let [op, tag] = split_pair(s)?;
        Ok(Self {
            op: op.parse()?,
            tag: tag.to_string(),
        })
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.op.wire(), self.tag)
    }
}

/// Channel names negotiated for one workload launch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelPair {
    /// Workload → consumer image stream.
    pub result: String,
    /// Consumer → workload opcode stream.
    pub command: String,
}

impl ChannelPair {
    pub fn new(result: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            result: result.into(),
            command: command.into(),
        }
    }
}

impl Default for ChannelPair {
    fn default() -> Self {
        Self::new("outContainer1", "inContainer1")
    }
}

impl FromStr for ChannelPair {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let [result, command] = split_pair(s)?;
        if result == command {
            return Err(ProtocolError::SameChannel(result.to_string()));
        }
        Ok(Self::new(result, command))
    }
}

impl fmt::Display for ChannelPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.result, self.command)
    }
}

fn split_pair(s: &str) -> Result<[&str; 2], ProtocolError> {
    let tokens: Vec<&str> = s.split_whitespace().collect();
    match tokens.as_slice() {
        [a, b] => Ok([*a, *b]),
        _ => Err(ProtocolError::TokenCount {
            expected: 2,
            got: tokens.len(),
            raw: s.to_string(),
        }),
    }
}

/// Extract the text body of a control-channel payload.
pub fn expect_text(payload: &Payload) -> Result<&str, ProtocolError> {
    match payload {
        Payload::Text(text) => Ok(text),
        other => Err(ProtocolError::NotText(other.kind())),
    }
}

/// Body of an outbound command: control strings or workload opcodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandPayload {
    Text(String),
    Int(i64),
}

impl From<CommandPayload> for Payload {
    fn from(payload: CommandPayload) -> Self {
        match payload {
            CommandPayload::Text(text) => Payload::Text(text),
            CommandPayload::Int(n) => Payload::Int(n),
        }
    }
}

impl From<ControlCommand> for CommandPayload {
    fn from(command: ControlCommand) -> Self {
        CommandPayload::Text(command.to_string())
    }
}

impl From<i64> for CommandPayload {
    fn from(n: i64) -> Self {
        CommandPayload::Int(n)
    }
}

impl From<String> for CommandPayload {
    fn from(text: String) -> Self {
        CommandPayload::Text(text)
    }
}

impl From<&str> for CommandPayload {
    fn from(text: &str) -> Self {
        CommandPayload::Text(text.to_string())
    }
}
