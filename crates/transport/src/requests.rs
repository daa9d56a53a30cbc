//! Decoding packet payloads into requests
//!
//! Packets that only concern the protocol itself (feature negotiation, ack
//! mode) decode to [`Packet::Protocol`] and are answered by the connection.
//! Everything else becomes a [`Request`] for the debugger controller.

use crate::error::ParseError;
use crate::hex;
use crate::types::{
    DetachReason, GdbRegister, RegisterValue, RestartKind, ResumeAction, ResumeKind,
    ResumeRequest, RunDirection, ThreadId, Watch, WatchKind,
};

/// A request for the debugger controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    GetStopReason,
    SetContinueThread(ThreadId),
    SetQueryThread(ThreadId),
    GetCurrentThread,
    GetThreadList,
    IsThreadAlive(ThreadId),
    GetThreadExtraInfo(ThreadId),
    GetOffsets,
    GetAuxv { offset: usize, len: usize },
    GetRegs,
    /// Raw contents of a `G` packet, all registers back to back
    SetRegs(Vec<u8>),
    GetReg(GdbRegister),
    SetReg(RegisterValue),
    GetMem { addr: u64, len: usize },
    SetMem { addr: u64, data: Vec<u8> },
    SetBreakpoint(Watch),
    RemoveBreakpoint(Watch),
    ReadSiginfo { offset: usize, len: usize },
    WriteSiginfo { offset: usize, data: Vec<u8> },
    Monitor(String),
    Resume(ResumeRequest),
    Interrupt,
    Restart(RestartKind),
    Detach(DetachReason),
}

/// Packets answered by the connection without involving the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolPacket {
    Supported,
    StartNoAckMode,
    Attached,
    Symbol,
    VContQuery,
    ThreadListContinue,
    Unsupported(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Request(Request),
    Protocol(ProtocolPacket),
}

impl From<Request> for Packet {
    fn from(request: Request) -> Self {
        Packet::Request(request)
    }
}

pub fn parse(payload: &[u8]) -> Result<Packet, ParseError> {
    let (&first, rest) = payload.split_first().ok_or(ParseError::Empty)?;
    let request = match first {
        b'?' => Request::GetStopReason,
        b'H' => parse_set_thread(rest)?,
        b'T' => Request::IsThreadAlive(parse_thread_id(rest)?),
        b'g' => Request::GetRegs,
        b'G' => Request::SetRegs(hex::decode(rest)?),
        b'p' => Request::GetReg(GdbRegister(parse_u32(rest)?)),
        b'P' => parse_set_reg(rest)?,
        b'm' => {
            let (addr, len) = parse_addr_len(rest, "m")?;
            Request::GetMem { addr, len }
        }
        b'M' => {
            let (header, data) = split_once(rest, b':').ok_or_else(|| {
                ParseError::malformed("M", "missing ':' before data")
            })?;
            let (addr, _) = parse_addr_len(header, "M")?;
            Request::SetMem {
                addr,
                data: hex::decode(data)?,
            }
        }
        b'X' => {
            let (header, data) = split_once(rest, b':').ok_or_else(|| {
                ParseError::malformed("X", "missing ':' before data")
            })?;
            let (addr, _) = parse_addr_len(header, "X")?;
            let data = crate::packet::unescape_binary(data)
                .map_err(|e| ParseError::malformed("X", e.to_string()))?;
            Request::SetMem { addr, data }
        }
        b'Z' => Request::SetBreakpoint(parse_watch(rest)?),
        b'z' => Request::RemoveBreakpoint(parse_watch(rest)?),
        b'c' => Request::Resume(ResumeRequest::forward(ResumeKind::Continue)),
        b's' => Request::Resume(ResumeRequest::forward(ResumeKind::Step)),
        b'C' | b'S' => parse_signal_resume(first, rest)?,
        b'b' => match rest {
            b"c" => Request::Resume(ResumeRequest::backward(ResumeKind::Continue)),
            b"s" => Request::Resume(ResumeRequest::backward(ResumeKind::Step)),
            _ => return Ok(unsupported(payload)),
        },
        b'D' => Request::Detach(DetachReason::Detach),
        b'k' => Request::Detach(DetachReason::Kill),
        b'R' => Request::Restart(RestartKind::Previous),
        b'v' => return parse_v_packet(payload),
        b'q' => return parse_query(payload),
        b'Q' if payload == b"QStartNoAckMode" => {
            return Ok(Packet::Protocol(ProtocolPacket::StartNoAckMode));
        }
        _ => return Ok(unsupported(payload)),
    };
    Ok(Packet::Request(request))
}

/// Parse a thread id in any of the `p<pid>.<tid>`, `p<pid>` or `<tid>` forms
pub fn parse_thread_id(text: &[u8]) -> Result<ThreadId, ParseError> {
    let invalid = || ParseError::InvalidThreadId(String::from_utf8_lossy(text).into_owned());
    match text.strip_prefix(b"p") {
        Some(rest) => match split_once(rest, b'.') {
            Some((pid, tid)) => Ok(ThreadId::new(
                parse_id(pid).ok_or_else(invalid)?,
                parse_id(tid).ok_or_else(invalid)?,
            )),
            None => {
                let pid = parse_id(rest).ok_or_else(invalid)?;
                Ok(ThreadId::new(pid, -1))
            }
        },
        None => {
            let tid = parse_id(text).ok_or_else(invalid)?;
            Ok(ThreadId::new(if tid < 0 { -1 } else { 0 }, tid))
        }
    }
}

fn parse_id(text: &[u8]) -> Option<i64> {
    if text == b"-1" {
        return Some(-1);
    }
    let s = std::str::from_utf8(text).ok()?;
    if s.is_empty() {
        return None;
    }
    i64::from_str_radix(s, 16).ok()
}

fn parse_set_thread(rest: &[u8]) -> Result<Request, ParseError> {
    let (&op, thread) = rest
        .split_first()
        .ok_or_else(|| ParseError::malformed("H", "missing operation"))?;
    let thread = parse_thread_id(thread)?;
    match op {
        b'c' => Ok(Request::SetContinueThread(thread)),
        b'g' => Ok(Request::SetQueryThread(thread)),
        other => Err(ParseError::malformed(
            "H",
            format!("unknown operation {:?}", other as char),
        )),
    }
}

fn parse_set_reg(rest: &[u8]) -> Result<Request, ParseError> {
    let (number, value) =
        split_once(rest, b'=').ok_or_else(|| ParseError::malformed("P", "missing '='"))?;
    Ok(Request::SetReg(RegisterValue::new(
        GdbRegister(parse_u32(number)?),
        hex::decode(value)?,
    )))
}

fn parse_addr_len(text: &[u8], packet: &'static str) -> Result<(u64, usize), ParseError> {
    let (addr, len) =
        split_once(text, b',').ok_or_else(|| ParseError::malformed(packet, "missing ','"))?;
    Ok((hex::parse_u64(addr)?, hex::parse_u64(len)? as usize))
}

fn parse_watch(rest: &[u8]) -> Result<Watch, ParseError> {
    // Conditions and commands after ';' are evaluated by gdb, not by us
    let spec = split_once(rest, b';').map_or(rest, |(spec, _)| spec);
    let mut fields = spec.split(|b| *b == b',');
    let kind = fields
        .next()
        .and_then(|k| std::str::from_utf8(k).ok())
        .and_then(|k| k.parse::<u8>().ok())
        .and_then(WatchKind::from_wire)
        .ok_or_else(|| ParseError::malformed("Z", "unknown breakpoint type"))?;
    let addr = hex::parse_u64(
        fields
            .next()
            .ok_or_else(|| ParseError::malformed("Z", "missing address"))?,
    )?;
    let len = hex::parse_u64(
        fields
            .next()
            .ok_or_else(|| ParseError::malformed("Z", "missing kind"))?,
    )? as usize;
    Ok(Watch { kind, addr, len })
}

fn parse_signal_resume(first: u8, rest: &[u8]) -> Result<Request, ParseError> {
    let signal = split_once(rest, b';').map_or(rest, |(sig, _)| sig);
    let signal = hex::parse_u64(signal)? as i32;
    let kind = if first == b'C' {
        ResumeKind::Continue
    } else {
        ResumeKind::Step
    };
    Ok(Request::Resume(ResumeRequest {
        direction: RunDirection::Forward,
        actions: vec![ResumeAction {
            kind,
            target: ThreadId::ALL,
            signal: (signal != 0).then_some(signal),
        }],
    }))
}

fn parse_v_packet(payload: &[u8]) -> Result<Packet, ParseError> {
    if payload == b"vCont?" {
        return Ok(Packet::Protocol(ProtocolPacket::VContQuery));
    }
    if let Some(actions) = payload.strip_prefix(b"vCont;") {
        return Ok(parse_vcont(actions)?.into());
    }
    if let Some(args) = payload.strip_prefix(b"vRun;") {
        return Ok(Request::Restart(parse_restart_args(args)?).into());
    }
    if payload == b"vKill" || payload.starts_with(b"vKill;") {
        return Ok(Request::Detach(DetachReason::Kill).into());
    }
    if payload == b"vCtrlC" {
        return Ok(Request::Interrupt.into());
    }
    Ok(unsupported(payload))
}

fn parse_vcont(actions: &[u8]) -> Result<Request, ParseError> {
    let mut parsed = Vec::new();
    for action in actions.split(|b| *b == b';') {
        let (action, target) = match split_once(action, b':') {
            Some((action, thread)) => (action, parse_thread_id(thread)?),
            None => (action, ThreadId::ALL),
        };
        let (&op, arg) = action
            .split_first()
            .ok_or_else(|| ParseError::malformed("vCont", "empty action"))?;
        let (kind, signal) = match op {
            b'c' => (ResumeKind::Continue, None),
            b's' | b'r' => (ResumeKind::Step, None),
            b'C' => (ResumeKind::Continue, Some(hex::parse_u64(arg)? as i32)),
            b'S' => (ResumeKind::Step, Some(hex::parse_u64(arg)? as i32)),
            other => {
                return Err(ParseError::malformed(
                    "vCont",
                    format!("unsupported action {:?}", other as char),
                ));
            }
        };
        parsed.push(ResumeAction {
            kind,
            target,
            signal,
        });
    }
    Ok(Request::Resume(ResumeRequest {
        direction: RunDirection::Forward,
        actions: parsed,
    }))
}

/// `vRun;<filename>;<arg>...` where each field is hex encoded
///
/// The first argument after the filename selects the restart point: `c<N>`
/// for checkpoint N, a decimal event number, or nothing for the previous
/// restart point.
fn parse_restart_args(args: &[u8]) -> Result<RestartKind, ParseError> {
    let mut fields = args.split(|b| *b == b';').skip(1);
    let Some(arg) = fields.next().filter(|arg| !arg.is_empty()) else {
        return Ok(RestartKind::Previous);
    };
    let arg = String::from_utf8(hex::decode(arg)?)
        .map_err(|_| ParseError::malformed("vRun", "argument is not utf-8"))?;
    let arg = arg.trim();
    if arg.is_empty() {
        return Ok(RestartKind::Previous);
    }
    if let Some(checkpoint) = arg.strip_prefix('c') {
        return checkpoint
            .parse()
            .map(RestartKind::Checkpoint)
            .map_err(|_| ParseError::malformed("vRun", format!("invalid checkpoint {arg:?}")));
    }
    arg.parse()
        .map(RestartKind::Event)
        .map_err(|_| ParseError::malformed("vRun", format!("invalid event {arg:?}")))
}

fn parse_query(payload: &[u8]) -> Result<Packet, ParseError> {
    let protocol = |p| Ok(Packet::Protocol(p));
    let request = match payload {
        b"qC" => Request::GetCurrentThread,
        b"qfThreadInfo" => Request::GetThreadList,
        b"qsThreadInfo" => return protocol(ProtocolPacket::ThreadListContinue),
        b"qOffsets" => Request::GetOffsets,
        b"qAttached" => return protocol(ProtocolPacket::Attached),
        b"qSymbol::" => return protocol(ProtocolPacket::Symbol),
        _ if payload.starts_with(b"qSupported") => return protocol(ProtocolPacket::Supported),
        _ => {
            if let Some(thread) = payload.strip_prefix(b"qThreadExtraInfo,") {
                Request::GetThreadExtraInfo(parse_thread_id(thread)?)
            } else if let Some(command) = payload.strip_prefix(b"qRcmd,") {
                let command = String::from_utf8(hex::decode(command)?)
                    .map_err(|_| ParseError::malformed("qRcmd", "command is not utf-8"))?;
                Request::Monitor(command)
            } else if let Some(range) = payload.strip_prefix(b"qXfer:auxv:read::") {
                let (offset, len) = parse_addr_len(range, "qXfer")?;
                Request::GetAuxv {
                    offset: offset as usize,
                    len,
                }
            } else if let Some(range) = payload.strip_prefix(b"qXfer:siginfo:read::") {
                let (offset, len) = parse_addr_len(range, "qXfer")?;
                Request::ReadSiginfo {
                    offset: offset as usize,
                    len,
                }
            } else if let Some(rest) = payload.strip_prefix(b"qXfer:siginfo:write::") {
                let (offset, data) = split_once(rest, b':')
                    .ok_or_else(|| ParseError::malformed("qXfer", "missing ':' before data"))?;
                let data = crate::packet::unescape_binary(data)
                    .map_err(|e| ParseError::malformed("qXfer", e.to_string()))?;
                Request::WriteSiginfo {
                    offset: hex::parse_u64(offset)? as usize,
                    data,
                }
            } else {
                return Ok(unsupported(payload));
            }
        }
    };
    Ok(Packet::Request(request))
}

fn parse_u32(text: &[u8]) -> Result<u32, ParseError> {
    u32::try_from(hex::parse_u64(text)?)
        .map_err(|_| ParseError::InvalidHex(String::from_utf8_lossy(text).into_owned()))
}

fn split_once(text: &[u8], separator: u8) -> Option<(&[u8], &[u8])> {
    let index = text.iter().position(|b| *b == separator)?;
    Some((&text[..index], &text[index + 1..]))
}

fn unsupported(payload: &[u8]) -> Packet {
    Packet::Protocol(ProtocolPacket::Unsupported(
        String::from_utf8_lossy(payload).into_owned(),
    ))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn request(payload: &str) -> Request {
        match parse(payload.as_bytes()).unwrap() {
            Packet::Request(request) => request,
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[rstest]
    #[case("p1.2", ThreadId::new(1, 2))]
    #[case("p-1.-1", ThreadId::ALL)]
    #[case("p64", ThreadId::new(0x64, -1))]
    #[case("0", ThreadId::ANY)]
    #[case("-1", ThreadId::ALL)]
    #[case("1f", ThreadId::new(0, 0x1f))]
    fn thread_ids(#[case] text: &str, #[case] expected: ThreadId) {
        assert_eq!(parse_thread_id(text.as_bytes()).unwrap(), expected);
    }

    #[rstest]
    #[case("?", Request::GetStopReason)]
    #[case("Hgp1.2", Request::SetQueryThread(ThreadId::new(1, 2)))]
    #[case("Hc-1", Request::SetContinueThread(ThreadId::ALL))]
    #[case("g", Request::GetRegs)]
    #[case("p10", Request::GetReg(GdbRegister(16)))]
    #[case("m7276,8", Request::GetMem { addr: 0x7276, len: 8 })]
    #[case("M7272,4:01000000", Request::SetMem { addr: 0x7272, data: vec![1, 0, 0, 0] })]
    #[case("Z0,401000,1", Request::SetBreakpoint(Watch { kind: WatchKind::Software, addr: 0x401000, len: 1 }))]
    #[case("z2,601040,8", Request::RemoveBreakpoint(Watch { kind: WatchKind::Write, addr: 0x601040, len: 8 }))]
    #[case("bc", Request::Resume(ResumeRequest::backward(ResumeKind::Continue)))]
    #[case("bs", Request::Resume(ResumeRequest::backward(ResumeKind::Step)))]
    #[case("s", Request::Resume(ResumeRequest::forward(ResumeKind::Step)))]
    #[case("D", Request::Detach(DetachReason::Detach))]
    #[case("vKill;1", Request::Detach(DetachReason::Kill))]
    #[case("R00", Request::Restart(RestartKind::Previous))]
    #[case("qC", Request::GetCurrentThread)]
    #[case("qRcmd,7768656e", Request::Monitor("when".to_string()))]
    #[case("qXfer:auxv:read::0,1000", Request::GetAuxv { offset: 0, len: 0x1000 })]
    #[case("qXfer:siginfo:read::0,80", Request::ReadSiginfo { offset: 0, len: 0x80 })]
    fn requests(#[case] payload: &str, #[case] expected: Request) {
        assert_eq!(request(payload), expected);
    }

    #[test]
    fn set_register() {
        let Request::SetReg(value) = request("P10=0010400000000000") else {
            panic!("expected SetReg");
        };
        assert_eq!(value.register, GdbRegister(16));
        assert_eq!(value.as_u64(), Some(0x401000));
    }

    #[test]
    fn binary_memory_write() {
        assert_eq!(
            request("X1000,2:}\x03a"),
            Request::SetMem {
                addr: 0x1000,
                data: vec![b'#', b'a']
            }
        );
    }

    #[test]
    fn vcont_actions() {
        let Request::Resume(resume) = request("vCont;s:p1.2;c") else {
            panic!("expected resume");
        };
        assert_eq!(resume.direction, RunDirection::Forward);
        assert_eq!(resume.actions.len(), 2);
        assert_eq!(resume.action_for(2).unwrap().kind, ResumeKind::Step);
        assert_eq!(resume.action_for(3).unwrap().kind, ResumeKind::Continue);

        let Request::Resume(resume) = request("vCont;C0b") else {
            panic!("expected resume");
        };
        assert_eq!(resume.actions[0].signal, Some(11));
    }

    #[test]
    fn restart_arguments() {
        // "run c3" and "run 250" from gdb
        assert_eq!(
            request("vRun;;6333"),
            Request::Restart(RestartKind::Checkpoint(3))
        );
        assert_eq!(
            request("vRun;;323530"),
            Request::Restart(RestartKind::Event(250))
        );
        assert_eq!(request("vRun;"), Request::Restart(RestartKind::Previous));
        assert!(parse(b"vRun;;6378").is_err());
    }

    #[test]
    fn protocol_packets() {
        assert_eq!(
            parse(b"qSupported:multiprocess+;swbreak+").unwrap(),
            Packet::Protocol(ProtocolPacket::Supported)
        );
        assert_eq!(
            parse(b"QStartNoAckMode").unwrap(),
            Packet::Protocol(ProtocolPacket::StartNoAckMode)
        );
        assert!(matches!(
            parse(b"qTStatus").unwrap(),
            Packet::Protocol(ProtocolPacket::Unsupported(_))
        ));
    }

    #[test]
    fn malformed_packets() {
        assert_eq!(parse(b""), Err(ParseError::Empty));
        assert!(parse(b"m1000").is_err());
        assert!(parse(b"Z9,1000,1").is_err());
        assert!(parse(b"Hxp1.1").is_err());
    }
}
