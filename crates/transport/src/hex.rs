//! Hex helpers for packet payloads

use crate::error::ParseError;

pub fn encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn decode(text: &[u8]) -> Result<Vec<u8>, ParseError> {
    if text.len() % 2 != 0 {
        return Err(invalid(text));
    }
    text.chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok())
                .ok_or_else(|| invalid(text))
        })
        .collect()
}

pub fn parse_u64(text: &[u8]) -> Result<u64, ParseError> {
    std::str::from_utf8(text)
        .ok()
        .filter(|s| !s.is_empty())
        .and_then(|s| u64::from_str_radix(s, 16).ok())
        .ok_or_else(|| invalid(text))
}

fn invalid(text: &[u8]) -> ParseError {
    ParseError::InvalidHex(String::from_utf8_lossy(text).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        assert_eq!(encode(&[0xde, 0xad, 0x01]), "dead01");
        assert_eq!(decode(b"dead01").unwrap(), vec![0xde, 0xad, 0x01]);
        assert!(decode(b"abc").is_err());
        assert!(decode(b"zz").is_err());
        assert_eq!(parse_u64(b"7272").unwrap(), 0x7272);
        assert!(parse_u64(b"").is_err());
    }
}
