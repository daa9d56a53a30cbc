//! Remote serial protocol framing
//!
//! Packets travel as `$<payload>#<checksum>` where the checksum is the sum of
//! the payload bytes modulo 256, written as two hex digits. Between packets
//! the peer may send `+`/`-` acknowledgements or a bare `0x03` byte to
//! interrupt the target.

use std::io::{self, BufRead};

use crate::error::PacketError;

/// Largest payload we accept, advertised to gdb in `qSupported`
pub const MAX_PACKET_SIZE: usize = 0x4000;

const INTERRUPT: u8 = 0x03;
const ESCAPE: u8 = b'}';

/// One unit read from the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Packet { payload: Vec<u8>, checksum_ok: bool },
    Interrupt,
    Ack,
    Nack,
}

pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Wrap `payload` in packet framing
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.push(b'$');
    out.extend_from_slice(payload);
    out.extend_from_slice(format!("#{:02x}", checksum(payload)).as_bytes());
    out
}

/// Escape binary data for `X` packets and `qXfer` replies
pub fn escape_binary(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &b in data {
        match b {
            b'#' | b'$' | b'}' | b'*' => {
                out.push(ESCAPE);
                out.push(b ^ 0x20);
            }
            _ => out.push(b),
        }
    }
    out
}

pub fn unescape_binary(data: &[u8]) -> Result<Vec<u8>, PacketError> {
    let mut out = Vec::with_capacity(data.len());
    let mut bytes = data.iter();
    while let Some(&b) = bytes.next() {
        if b == ESCAPE {
            let next = bytes.next().ok_or(PacketError::TruncatedEscape)?;
            out.push(next ^ 0x20);
        } else {
            out.push(b);
        }
    }
    Ok(out)
}

/// Read the next frame, or `None` at end of stream
///
/// Bytes outside a packet other than acks and interrupts are skipped.
pub fn read_frame(input: &mut impl BufRead) -> Result<Option<Frame>, PacketError> {
    loop {
        let Some(b) = read_byte(input)? else {
            return Ok(None);
        };
        match b {
            b'$' => break,
            b'+' => return Ok(Some(Frame::Ack)),
            b'-' => return Ok(Some(Frame::Nack)),
            INTERRUPT => return Ok(Some(Frame::Interrupt)),
            other => tracing::trace!(byte = other, "skipping byte outside packet"),
        }
    }

    let mut payload = Vec::new();
    let mut overflowed = false;
    loop {
        let b = read_byte(input)?.ok_or(PacketError::UnexpectedEof)?;
        if b == b'#' {
            break;
        }
        // Keep draining so the next read starts after this packet
        if payload.len() >= MAX_PACKET_SIZE {
            overflowed = true;
            continue;
        }
        payload.push(b);
    }

    let mut digits = [0u8; 2];
    for digit in digits.iter_mut() {
        *digit = read_byte(input)?.ok_or(PacketError::UnexpectedEof)?;
    }
    if overflowed {
        return Err(PacketError::TooLarge(MAX_PACKET_SIZE));
    }
    let received = std::str::from_utf8(&digits)
        .ok()
        .and_then(|s| u8::from_str_radix(s, 16).ok())
        .ok_or(PacketError::InvalidChecksum)?;

    let checksum_ok = received == checksum(&payload);
    if !checksum_ok {
        tracing::warn!(
            received,
            calculated = checksum(&payload),
            "packet checksum mismatch"
        );
    }
    Ok(Some(Frame::Packet {
        payload,
        checksum_ok,
    }))
}

fn read_byte(input: &mut impl BufRead) -> Result<Option<u8>, PacketError> {
    loop {
        match input.fill_buf() {
            Ok([]) => return Ok(None),
            Ok(buf) => {
                let b = buf[0];
                input.consume(1);
                return Ok(Some(b));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(PacketError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn checksum_of_known_payload() {
        assert_eq!(checksum(b"OK"), 0x9a);
        assert_eq!(encode(b"OK"), b"$OK#9a".to_vec());
    }

    #[test]
    fn reads_packets_acks_and_interrupts() {
        let mut input = Cursor::new(b"+$g#67\x03-".to_vec());

        assert_eq!(read_frame(&mut input).unwrap(), Some(Frame::Ack));
        assert_eq!(
            read_frame(&mut input).unwrap(),
            Some(Frame::Packet {
                payload: b"g".to_vec(),
                checksum_ok: true
            })
        );
        assert_eq!(read_frame(&mut input).unwrap(), Some(Frame::Interrupt));
        assert_eq!(read_frame(&mut input).unwrap(), Some(Frame::Nack));
        assert_eq!(read_frame(&mut input).unwrap(), None);
    }

    #[test]
    fn flags_bad_checksums() {
        let mut input = Cursor::new(b"$g#00".to_vec());
        let frame = read_frame(&mut input).unwrap();
        assert!(matches!(
            frame,
            Some(Frame::Packet {
                checksum_ok: false,
                ..
            })
        ));
    }

    #[test]
    fn rejects_oversized_packets() {
        let mut data = vec![b'$'];
        data.extend(std::iter::repeat_n(b'a', MAX_PACKET_SIZE + 1));
        data.extend_from_slice(b"#00+");
        let mut input = Cursor::new(data);
        let err = read_frame(&mut input).unwrap_err();
        assert!(matches!(err, PacketError::TooLarge(_)));
        assert_eq!(read_frame(&mut input).unwrap(), Some(Frame::Ack));
    }

    #[test]
    fn truncated_packet_is_an_error() {
        let err = read_frame(&mut Cursor::new(b"$abc".to_vec())).unwrap_err();
        assert!(matches!(err, PacketError::UnexpectedEof));
    }

    #[test]
    fn binary_escaping() {
        let raw = [b'a', b'#', b'}', 0x00, b'*'];
        let escaped = escape_binary(&raw);
        assert_eq!(escaped, vec![b'a', b'}', 0x03, b'}', 0x5d, 0x00, b'}', 0x0a]);
        assert_eq!(unescape_binary(&escaped).unwrap(), raw.to_vec());
        assert!(unescape_binary(b"ab}").is_err());
    }
}
