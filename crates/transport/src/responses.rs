//! Replies and stop notifications, and their wire encoding

use crate::hex;
use crate::packet;
use crate::types::{RegisterValue, StopReason, ThreadId};

/// Error code sent for every protocol-level failure
pub const GENERIC_ERROR: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Error(u8),
    /// The empty packet: request not supported
    Unsupported,
    Registers(Vec<RegisterValue>),
    Register(RegisterValue),
    Memory(Vec<u8>),
    CurrentThread(ThreadId),
    ThreadList(Vec<ThreadId>),
    ThreadExtraInfo(String),
    /// One chunk of a `qXfer` object; `last` marks the final chunk
    Xfer { data: Vec<u8>, last: bool },
    MonitorOutput(String),
}

impl Reply {
    pub fn error() -> Self {
        Reply::Error(GENERIC_ERROR)
    }

    /// Slice `object` for a `qXfer` read of `len` bytes at `offset`
    pub fn xfer(object: &[u8], offset: usize, len: usize) -> Self {
        let start = offset.min(object.len());
        let end = start.saturating_add(len).min(object.len());
        Reply::Xfer {
            data: object[start..end].to_vec(),
            last: end >= object.len(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Reply::Ok => b"OK".to_vec(),
            Reply::Error(code) => format!("E{code:02x}").into_bytes(),
            Reply::Unsupported => Vec::new(),
            Reply::Registers(values) => values
                .iter()
                .map(encode_register)
                .collect::<String>()
                .into_bytes(),
            Reply::Register(value) => encode_register(value).into_bytes(),
            Reply::Memory(bytes) => hex::encode(bytes).into_bytes(),
            Reply::CurrentThread(thread) => format!("QC{thread}").into_bytes(),
            Reply::ThreadList(threads) if threads.is_empty() => b"l".to_vec(),
            Reply::ThreadList(threads) => {
                let list = threads
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                format!("m{list}").into_bytes()
            }
            Reply::ThreadExtraInfo(info) => hex::encode(info.as_bytes()).into_bytes(),
            Reply::Xfer { data, last } => {
                let mut out = vec![if *last { b'l' } else { b'm' }];
                out.extend(packet::escape_binary(data));
                out
            }
            Reply::MonitorOutput(text) => hex::encode(text.as_bytes()).into_bytes(),
        }
    }
}

fn encode_register(value: &RegisterValue) -> String {
    if value.defined {
        hex::encode(&value.value)
    } else {
        "xx".repeat(value.value.len())
    }
}

/// Sent when execution halts, or in reply to `?`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopNotification {
    Stopped {
        thread: ThreadId,
        signal: i32,
        reason: Option<StopReason>,
    },
    Exited {
        code: i32,
    },
}

impl StopNotification {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            StopNotification::Stopped {
                thread,
                signal,
                reason,
            } => {
                let mut out = format!("T{:02x}thread:{thread};", signal & 0xff);
                match reason {
                    Some(StopReason::SoftwareBreakpoint) => out.push_str("swbreak:;"),
                    Some(StopReason::Watch { kind, addr }) => {
                        out.push_str(&format!("{}:{addr:x};", kind.stop_reason_name()));
                    }
                    Some(StopReason::ReplayLogBegin) => out.push_str("replaylog:begin;"),
                    None => {}
                }
                out.into_bytes()
            }
            StopNotification::Exited { code } => format!("W{:02x}", code & 0xff).into_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GdbRegister, WatchKind, signals};

    fn text(bytes: Vec<u8>) -> String {
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn stop_replies() {
        let stop = StopNotification::Stopped {
            thread: ThreadId::new(0x64, 0x65),
            signal: signals::SIGTRAP,
            reason: Some(StopReason::SoftwareBreakpoint),
        };
        assert_eq!(text(stop.encode()), "T05thread:p64.65;swbreak:;");

        let stop = StopNotification::Stopped {
            thread: ThreadId::new(1, 1),
            signal: signals::SIGTRAP,
            reason: Some(StopReason::Watch {
                kind: WatchKind::Write,
                addr: 0x601040,
            }),
        };
        assert_eq!(text(stop.encode()), "T05thread:p1.1;watch:601040;");

        assert_eq!(text(StopNotification::Exited { code: 0 }.encode()), "W00");
    }

    #[test]
    fn register_replies() {
        let reply = Reply::Registers(vec![
            RegisterValue::new(GdbRegister(0), vec![1, 0]),
            RegisterValue::undefined(GdbRegister(1), 2),
        ]);
        assert_eq!(text(reply.encode()), "0100xxxx");
    }

    #[test]
    fn thread_list_replies() {
        assert_eq!(text(Reply::ThreadList(vec![]).encode()), "l");
        let reply = Reply::ThreadList(vec![ThreadId::new(1, 1), ThreadId::new(1, 2)]);
        assert_eq!(text(reply.encode()), "mp1.1,p1.2");
    }

    #[test]
    fn xfer_chunks() {
        let object = b"abcdef";
        assert_eq!(
            Reply::xfer(object, 0, 4),
            Reply::Xfer {
                data: b"abcd".to_vec(),
                last: false
            }
        );
        assert_eq!(
            Reply::xfer(object, 4, 4),
            Reply::Xfer {
                data: b"ef".to_vec(),
                last: true
            }
        );
        assert_eq!(
            Reply::xfer(object, 10, 4),
            Reply::Xfer {
                data: vec![],
                last: true
            }
        );
        assert_eq!(text(Reply::error().encode()), "E01");
    }
}
