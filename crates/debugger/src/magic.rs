//! Commands smuggled through ordinary memory accesses
//!
//! The startup script defines gdb commands that write to or read from a
//! fixed address no real program maps. The server intercepts those accesses
//! before they reach any session.

use transport::Request;

use crate::types::CheckpointId;

/// Address written to by checkpoint commands
pub const MAGIC_COMMAND_ADDR: u64 = 29298;
/// Address read by `when`
pub const MAGIC_WHEN_ADDR: u64 = MAGIC_COMMAND_ADDR + 4;

const OPCODE_MASK: u32 = 0xff00_0000;
const PARAM_MASK: u32 = 0x00ff_ffff;
const CREATE_CHECKPOINT: u32 = 0x0100_0000;
const DELETE_CHECKPOINT: u32 = 0x0200_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MagicCommand {
    /// Create a checkpoint; handle 0 asks for a fresh handle
    CreateCheckpoint(CheckpointId),
    DeleteCheckpoint(CheckpointId),
    /// Read the current event number
    When,
}

pub fn decode(request: &Request) -> Option<MagicCommand> {
    match request {
        Request::SetMem { addr, data } if *addr == MAGIC_COMMAND_ADDR && data.len() == 4 => {
            let value = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
            let param = value & PARAM_MASK;
            match value & OPCODE_MASK {
                CREATE_CHECKPOINT => Some(MagicCommand::CreateCheckpoint(param)),
                DELETE_CHECKPOINT => Some(MagicCommand::DeleteCheckpoint(param)),
                _ => None,
            }
        }
        Request::GetMem { addr, len } if *addr == MAGIC_WHEN_ADDR && *len == 8 => {
            Some(MagicCommand::When)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(addr: u64, value: u32) -> Request {
        Request::SetMem {
            addr,
            data: value.to_le_bytes().to_vec(),
        }
    }

    #[test]
    fn decodes_checkpoint_commands() {
        assert_eq!(
            decode(&write(MAGIC_COMMAND_ADDR, 0x0100_0003)),
            Some(MagicCommand::CreateCheckpoint(3))
        );
        assert_eq!(
            decode(&write(MAGIC_COMMAND_ADDR, 0x0200_0007)),
            Some(MagicCommand::DeleteCheckpoint(7))
        );
        assert_eq!(
            decode(&Request::GetMem {
                addr: MAGIC_WHEN_ADDR,
                len: 8
            }),
            Some(MagicCommand::When)
        );
    }

    #[test]
    fn ordinary_accesses_pass_through() {
        assert_eq!(decode(&write(MAGIC_COMMAND_ADDR, 0x0300_0001)), None);
        assert_eq!(decode(&write(0x1000, 0x0100_0001)), None);
        assert_eq!(
            decode(&Request::SetMem {
                addr: MAGIC_COMMAND_ADDR,
                data: vec![1, 0]
            }),
            None
        );
        assert_eq!(
            decode(&Request::GetMem {
                addr: MAGIC_WHEN_ADDR,
                len: 4
            }),
            None
        );
    }
}
