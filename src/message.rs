//! The tagged message-kind data model (§3) and the percent-encoding used
//! inside inline `D` payloads.

use crate::error::{Error, ErrorCode, Result};

/// Maximum payload bytes of a single wire line, not counting the
/// terminating `LF` (and the optional `CR` before it). §3 invariant 1.
pub const MAX_LINE_PAYLOAD: usize = 1_000;

/// Maximum total bytes of a wire line including framing (`CR`+`LF`).
pub const MAX_LINE_ENVELOPE: usize = MAX_LINE_PAYLOAD + 2;

/// One parsed protocol message. Commands are client→server; the rest are
/// the server→client / bidirectional reply vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Command { verb: String, args: String },
    Ok { info: Option<String> },
    Err { code: ErrorCode, description: Option<String> },
    Status { keyword: String, args: String },
    Data(Vec<u8>),
    Inquire { keyword: String, args: String },
    End,
    Cancel,
    Comment(String),
}

impl Message {
    /// Serialize this message to zero or more raw wire lines (without
    /// trailing `LF` — the caller's line buffer adds framing). `Data` may
    /// expand into several lines if the encoded payload exceeds
    /// [`MAX_LINE_PAYLOAD`]; every other variant produces exactly one line.
    ///
    /// Lines are `Vec<u8>`, not `String`: a `D` line's literal (non-escaped)
    /// bytes are whatever the caller's payload contained, not necessarily
    /// valid UTF-8 (§6 "8-bit clean").
    pub fn to_lines(&self) -> Vec<Vec<u8>> {
        match self {
            Message::Command { verb, args } => {
                if args.is_empty() {
                    vec![verb.clone().into_bytes()]
                } else {
                    vec![format!("{verb} {args}").into_bytes()]
                }
            }
            Message::Ok { info } => match info {
                Some(i) => vec![format!("OK {i}").into_bytes()],
                None => vec![b"OK".to_vec()],
            },
            Message::Err { code, description } => {
                let desc = description
                    .clone()
                    .unwrap_or_else(|| code.default_description().to_string());
                vec![format!("ERR {} {}", code.code(), desc).into_bytes()]
            }
            Message::Status { keyword, args } => {
                if args.is_empty() {
                    vec![format!("S {keyword}").into_bytes()]
                } else {
                    vec![format!("S {keyword} {args}").into_bytes()]
                }
            }
            Message::Data(bytes) => encode_data_lines(bytes),
            Message::Inquire { keyword, args } => {
                if args.is_empty() {
                    vec![format!("INQUIRE {keyword}").into_bytes()]
                } else {
                    vec![format!("INQUIRE {keyword} {args}").into_bytes()]
                }
            }
            Message::End => vec![b"END".to_vec()],
            Message::Cancel => vec![b"CAN".to_vec()],
            Message::Comment(text) => vec![format!("# {text}").into_bytes()],
        }
    }
}

/// Percent-encode `bytes` and split into one or more `D `-prefixed lines,
/// none exceeding [`MAX_LINE_PAYLOAD`] total bytes including the `D `
/// prefix (§4.C's "caller's single logical payload thus becomes a sequence
/// of `D`-lines transparently"). Bytes other than `%`, `\r`, `\n` are
/// copied through unescaped — this must stay byte-for-byte, not routed
/// through `char`/`String`, or anything ≥ 0x80 gets reinterpreted as a
/// Unicode scalar value and re-encoded as multi-byte UTF-8 (§6 "8-bit
/// clean").
pub fn encode_data_lines(bytes: &[u8]) -> Vec<Vec<u8>> {
    if bytes.is_empty() {
        return vec![b"D ".to_vec()];
    }
    let prefix_len = 2; // "D "
    let budget = MAX_LINE_PAYLOAD - prefix_len;
    let mut lines = Vec::new();
    let mut current: Vec<u8> = Vec::new();
    for &b in bytes {
        if current.len() + encoded_len(b) > budget {
            lines.push(finish_data_line(&mut current));
        }
        push_encoded_byte(&mut current, b);
    }
    lines.push(finish_data_line(&mut current));
    lines
}

fn finish_data_line(current: &mut Vec<u8>) -> Vec<u8> {
    let mut line = Vec::with_capacity(current.len() + 2);
    line.extend_from_slice(b"D ");
    line.append(current);
    line
}

fn encoded_len(b: u8) -> usize {
    match b {
        b'%' | b'\r' | b'\n' => 3,
        _ => 1,
    }
}

fn push_encoded_byte(out: &mut Vec<u8>, b: u8) {
    match b {
        b'%' => out.extend_from_slice(b"%25"),
        b'\r' => out.extend_from_slice(b"%0D"),
        b'\n' => out.extend_from_slice(b"%0A"),
        other => out.push(other),
    }
}

/// Percent-decode a single `D` line's payload (without the `D ` prefix),
/// directly as bytes. `%XX` must be exactly two hex digits; anything else
/// is [`ErrorCode::InvalidValue`] (§4.C: "a malformed escape aborts the
/// connection"). Unescaped bytes pass straight through, so payloads with
/// bytes ≥ 0x80 round-trip exactly (§8 property 1).
pub fn decode_data_payload(encoded: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(encoded.len());
    let mut i = 0;
    while i < encoded.len() {
        match encoded[i] {
            b'%' => {
                let hex = encoded
                    .get(i + 1..i + 3)
                    .ok_or_else(|| Error::new(ErrorCode::InvalidValue))?;
                let hex_str =
                    std::str::from_utf8(hex).map_err(|_| Error::new(ErrorCode::InvalidValue))?;
                let value = u8::from_str_radix(hex_str, 16)
                    .map_err(|_| Error::new(ErrorCode::InvalidValue))?;
                out.push(value);
                i += 3;
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    Ok(out)
}

/// Encode a byte slice as a single run of `%XX`/literal bytes, without
/// splitting into lines. Used by tests and by callers who already know
/// their payload fits one line.
pub fn encode_data_inline(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    for &b in bytes {
        push_encoded_byte(&mut out, b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_encoding_covers_the_three_special_bytes() {
        assert_eq!(encode_data_inline(b"%"), b"%25".to_vec());
        assert_eq!(encode_data_inline(b"\r"), b"%0D".to_vec());
        assert_eq!(encode_data_inline(b"\n"), b"%0A".to_vec());
        assert_eq!(encode_data_inline(b"abc"), b"abc".to_vec());
    }

    #[test]
    fn high_bytes_pass_through_raw_not_as_multi_byte_utf8() {
        // A byte like 0xFF must appear on the wire as the single raw byte
        // 0xFF, not as its two-byte UTF-8 encoding of U+00FF.
        let input = [0xFFu8, 0x80, 0x01];
        let encoded = encode_data_inline(&input);
        assert_eq!(encoded, vec![0xFFu8, 0x80, 0x01]);
        assert_eq!(decode_data_payload(&encoded).unwrap(), input.to_vec());
    }

    #[test]
    fn roundtrip_inline_data_arbitrary_bytes() {
        let input: Vec<u8> = (0..=255u8).collect();
        let encoded = encode_data_inline(&input);
        let decoded = decode_data_payload(&encoded).unwrap();
        assert_eq!(decoded, input);
    }

    #[test]
    fn malformed_escape_is_rejected() {
        assert!(decode_data_payload(b"%ZZ").is_err());
        assert!(decode_data_payload(b"%2").is_err());
    }

    #[test]
    fn large_payload_splits_into_multiple_d_lines() {
        let payload = vec![b'x'; 5_000];
        let lines = encode_data_lines(&payload);
        assert!(lines.len() >= 5);
        for line in &lines {
            assert!(line.len() + 2 <= MAX_LINE_ENVELOPE);
        }
        let mut decoded = Vec::new();
        for line in &lines {
            decoded.extend(decode_data_payload(line.strip_prefix(b"D ").unwrap()).unwrap());
        }
        assert_eq!(decoded, payload);
    }

    #[test]
    fn large_binary_payload_with_high_bytes_splits_and_roundtrips() {
        let payload: Vec<u8> = (0..6_000u32).map(|i| (i % 256) as u8).collect();
        let lines = encode_data_lines(&payload);
        assert!(lines.len() >= 6);
        let mut decoded = Vec::new();
        for line in &lines {
            decoded.extend(decode_data_payload(line.strip_prefix(b"D ").unwrap()).unwrap());
        }
        assert_eq!(decoded, payload);
    }

    #[test]
    fn scenario_3_trailing_cr_is_encoded() {
        // "ab%c\r" -> "ab%25c%0D"
        let encoded = encode_data_inline(b"ab%c\r");
        assert_eq!(encoded, b"ab%25c%0D".to_vec());
        assert_eq!(decode_data_payload(&encoded).unwrap(), b"ab%c\r");
    }
}
