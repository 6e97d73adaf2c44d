//! Command model for the replicated key-value service.
//!
//! A [`Command`] is the unit serialized into the replicated log. Only
//! mutations travel through the log; reads are answered locally by the
//! leader and never become commands.

use serde_derive::{Deserialize, Serialize};

/// Operation vocabulary of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Read,
    Write,
    Delete,
    Modify,
}

impl OpCode {
    /// Validates a raw wire op code against the enumerated set.
    ///
    /// Returns `None` for codes outside the vocabulary; rejecting those is an
    /// application-level policy decision made at apply time, not a decode
    /// error.
    pub fn from_u32(op: u32) -> Option<OpCode> {
        match op {
            0 => Some(OpCode::Read),
            1 => Some(OpCode::Write),
            2 => Some(OpCode::Delete),
            3 => Some(OpCode::Modify),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            OpCode::Read => 0,
            OpCode::Write => 1,
            OpCode::Delete => 2,
            OpCode::Modify => 3,
        }
    }
}

/// One client-visible mutation. Immutable once created.
///
/// The raw `op` integer is preserved through serialization so that every
/// replica sees the same bytes and the same (possibly invalid) op code.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Command {
    pub op: u32,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Command {
    pub fn new(op: u32, key: Vec<u8>, value: Vec<u8>) -> Command {
        Command { op, key, value }
    }

    /// Encodes the command into a replicated-log entry payload.
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Decodes a command from a replicated-log entry payload.
    pub fn decode(data: &[u8]) -> Result<Command, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// Per-command result delivered through the pending-command channel.
#[derive(Debug, Clone, Default)]
pub struct Outcome {
    pub success: bool,
    /// Populated on failure when a more current leader is known.
    pub redirect: Option<String>,
}

impl Outcome {
    /// Outcome of a command that reached the deterministic apply path.
    pub fn applied(success: bool) -> Outcome {
        Outcome {
            success,
            redirect: None,
        }
    }

    /// Rejection before or instead of apply, with a best-effort leader hint.
    pub fn rejected(redirect: Option<String>) -> Outcome {
        Outcome {
            success: false,
            redirect,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_code_vocabulary() {
        assert_eq!(OpCode::from_u32(0), Some(OpCode::Read));
        assert_eq!(OpCode::from_u32(1), Some(OpCode::Write));
        assert_eq!(OpCode::from_u32(2), Some(OpCode::Delete));
        assert_eq!(OpCode::from_u32(3), Some(OpCode::Modify));
        assert_eq!(OpCode::from_u32(4), None);
        assert_eq!(OpCode::from_u32(u32::MAX), None);
        assert_eq!(OpCode::Modify.as_u32(), 3);
    }

    #[test]
    fn test_command_round_trip() {
        let cmd = Command::new(OpCode::Write.as_u32(), b"a".to_vec(), b"1".to_vec());
        let data = cmd.encode().unwrap();
        let decoded = Command::decode(&data).unwrap();
        assert_eq!(decoded.op, cmd.op);
        assert_eq!(decoded.key, cmd.key);
        assert_eq!(decoded.value, cmd.value);
    }

    #[test]
    fn test_unknown_op_survives_encoding() {
        // Unknown codes must reach the apply path intact so every replica
        // rejects them identically.
        let cmd = Command::new(42, b"k".to_vec(), Vec::new());
        let decoded = Command::decode(&cmd.encode().unwrap()).unwrap();
        assert_eq!(decoded.op, 42);
        assert_eq!(OpCode::from_u32(decoded.op), None);
    }
}
