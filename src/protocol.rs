//! Task status and command vocabulary
//!
//! The numeric codes are the wire contract and must stay stable:
//! - Between ranks, codes travel as 4-byte little-endian `i32` payloads.
//! - Between a Receiver and its workers, codes travel as stringified
//!   integers inside one pipe frame.

use crate::error::{TransportError, TransportResult};
use std::fmt;

/// Status a party reports upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum TaskStatus {
    /// Normal operation
    Ok = 0,
    /// Failed to complete an operation
    Failed = 1,
    /// Transitioned to the shutdown state
    Exit = 2,
    /// Asking the Distributor to stop the whole job
    RequestJobTermination = 3,
}

/// Command sent downstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum TaskCommand {
    /// A work package follows
    Continue = 0,
    /// Nothing to do this round
    Ignore = 1,
    /// Graceful shutdown
    Exit = 2,
    /// Quick shutdown: interrupt workers
    QuickExit = 3,
    /// Forced shutdown: kill workers
    TermExit = 4,
}

impl TaskStatus {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> TransportResult<Self> {
        match code {
            0 => Ok(TaskStatus::Ok),
            1 => Ok(TaskStatus::Failed),
            2 => Ok(TaskStatus::Exit),
            3 => Ok(TaskStatus::RequestJobTermination),
            other => Err(TransportError::UnknownCode {
                what: "status",
                code: other as i64,
            }),
        }
    }

    /// Encode for a rank-to-rank control message
    pub fn to_wire(self) -> [u8; 4] {
        self.code().to_le_bytes()
    }

    /// Decode a rank-to-rank control message
    pub fn from_wire(bytes: &[u8]) -> TransportResult<Self> {
        Self::from_code(decode_i32(bytes, "status")?)
    }

    /// Encode for a worker pipe message
    pub fn to_message(self) -> Vec<u8> {
        self.code().to_string().into_bytes()
    }

    /// Decode a worker pipe message
    pub fn from_message(bytes: &[u8]) -> TransportResult<Self> {
        Self::from_code(parse_message_code(bytes, "status")?)
    }
}

impl TaskCommand {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> TransportResult<Self> {
        match code {
            0 => Ok(TaskCommand::Continue),
            1 => Ok(TaskCommand::Ignore),
            2 => Ok(TaskCommand::Exit),
            3 => Ok(TaskCommand::QuickExit),
            4 => Ok(TaskCommand::TermExit),
            other => Err(TransportError::UnknownCode {
                what: "command",
                code: other as i64,
            }),
        }
    }

    pub fn to_wire(self) -> [u8; 4] {
        self.code().to_le_bytes()
    }

    pub fn from_wire(bytes: &[u8]) -> TransportResult<Self> {
        Self::from_code(decode_i32(bytes, "command")?)
    }

    pub fn to_message(self) -> Vec<u8> {
        self.code().to_string().into_bytes()
    }

    pub fn from_message(bytes: &[u8]) -> TransportResult<Self> {
        Self::from_code(parse_message_code(bytes, "command")?)
    }

    /// Check if this command ends the request loop
    pub fn is_exit(self) -> bool {
        matches!(
            self,
            TaskCommand::Exit | TaskCommand::QuickExit | TaskCommand::TermExit
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Ok => "OK",
            TaskStatus::Failed => "Failed",
            TaskStatus::Exit => "Exit",
            TaskStatus::RequestJobTermination => "Request Job Termination",
        };
        f.write_str(name)
    }
}

impl fmt::Display for TaskCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskCommand::Continue => "Continue",
            TaskCommand::Ignore => "Ignore",
            TaskCommand::Exit => "Exit",
            TaskCommand::QuickExit => "Quick Exit",
            TaskCommand::TermExit => "Term Exit",
        };
        f.write_str(name)
    }
}

/// Encode an element count for the wire (8 bytes, little-endian)
pub fn encode_count(count: u64) -> [u8; 8] {
    count.to_le_bytes()
}

/// Decode an element count
pub fn decode_count(bytes: &[u8]) -> TransportResult<u64> {
    let raw: [u8; 8] = bytes.try_into().map_err(|_| TransportError::Malformed {
        what: "element count",
        len: bytes.len(),
    })?;
    Ok(u64::from_le_bytes(raw))
}

fn decode_i32(bytes: &[u8], what: &'static str) -> TransportResult<i32> {
    let raw: [u8; 4] = bytes
        .try_into()
        .map_err(|_| TransportError::Malformed { what, len: bytes.len() })?;
    Ok(i32::from_le_bytes(raw))
}

fn parse_message_code(bytes: &[u8], what: &'static str) -> TransportResult<i32> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.trim().parse::<i32>().ok())
        .ok_or(TransportError::Malformed { what, len: bytes.len() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(TaskStatus::Ok.code(), 0);
        assert_eq!(TaskStatus::Failed.code(), 1);
        assert_eq!(TaskStatus::Exit.code(), 2);
        assert_eq!(TaskStatus::RequestJobTermination.code(), 3);

        assert_eq!(TaskCommand::Continue.code(), 0);
        assert_eq!(TaskCommand::Ignore.code(), 1);
        assert_eq!(TaskCommand::Exit.code(), 2);
        assert_eq!(TaskCommand::QuickExit.code(), 3);
        assert_eq!(TaskCommand::TermExit.code(), 4);
    }

    #[test]
    fn test_pipe_messages_are_stringified() {
        assert_eq!(TaskStatus::RequestJobTermination.to_message(), b"3".to_vec());
        assert_eq!(TaskCommand::from_message(b"4").unwrap(), TaskCommand::TermExit);
        assert_eq!(TaskStatus::from_message(b" 0\n").unwrap(), TaskStatus::Ok);
        assert!(TaskStatus::from_message(b"ok").is_err());
    }

    #[test]
    fn test_wire_decoding_rejects_bad_input() {
        assert_eq!(
            TaskStatus::from_wire(&TaskStatus::Exit.to_wire()).unwrap(),
            TaskStatus::Exit
        );
        assert!(matches!(
            TaskCommand::from_wire(&[0, 0]),
            Err(TransportError::Malformed { len: 2, .. })
        ));
        assert!(matches!(
            TaskCommand::from_wire(&9i32.to_le_bytes()),
            Err(TransportError::UnknownCode { code: 9, .. })
        ));
    }

    #[test]
    fn test_display_names() {
        assert_eq!(TaskCommand::QuickExit.to_string(), "Quick Exit");
        assert_eq!(TaskCommand::TermExit.to_string(), "Term Exit");
        assert_eq!(
            TaskStatus::RequestJobTermination.to_string(),
            "Request Job Termination"
        );
    }

    #[test]
    fn test_count_encoding() {
        assert_eq!(decode_count(&encode_count(12345)).unwrap(), 12345);
        assert!(decode_count(&[1, 2, 3]).is_err());
    }
}
