//! Shared parse/serialize logic (§4.E): turning wire lines into
//! [`Message`] values and back. [`crate::buffer::LineBuffer`] owns the
//! bytes; this module owns the grammar.

use crate::error::{Error, ErrorCode, Result};
use crate::message::{decode_data_payload, Message};

/// Split a command line into `(verb, args)` per §4.E rule 1/2: leading
/// whitespace is trimmed, the verb is the first whitespace-delimited
/// token, and the remainder after exactly one separating space is the
/// argument string verbatim (so internal runs of whitespace inside the
/// arguments survive).
///
/// `line` is raw wire bytes, not necessarily valid UTF-8 beyond the verb
/// itself; the returned strings are lossily converted (§6 8-bit-cleanliness
/// is a `D`-line guarantee, not a command-line one).
pub fn parse_command_line(line: &[u8]) -> (String, String) {
    let trimmed = trim_start(line);
    match split_once_byte(trimmed, b' ') {
        Some((verb, rest)) => (to_text(verb), to_text(rest)),
        None => (to_text(trimmed), String::new()),
    }
}

/// Parse one line from the reply stream (server→client or, for `CAN`/`END`,
/// client→server during an inquiry) into a [`Message`]. Any leading token
/// other than `OK`, `ERR`, `S`, `D`, `INQUIRE`, `END`, `CAN`, `#` is
/// `INVALID_RESPONSE` (§4.E rule 3).
pub fn parse_reply_line(line: &[u8]) -> Result<Message> {
    if let Some(rest) = line.strip_prefix(b"#") {
        return Ok(Message::Comment(to_text(trim_start(rest))));
    }
    let (tag, rest) = match split_once_byte(line, b' ') {
        Some((t, r)) => (t, r),
        None => (line, &b""[..]),
    };
    match tag {
        b"OK" => Ok(Message::Ok {
            info: none_if_empty(rest),
        }),
        b"ERR" => parse_err_args(rest),
        b"S" => {
            let (keyword, args) = split_keyword_args(rest);
            Ok(Message::Status { keyword, args })
        }
        b"D" => {
            let bytes = decode_data_payload(rest)?;
            Ok(Message::Data(bytes))
        }
        b"INQUIRE" => {
            let (keyword, args) = split_keyword_args(rest);
            Ok(Message::Inquire { keyword, args })
        }
        b"END" if rest.is_empty() => Ok(Message::End),
        // "CAN" is the formal §4.F inquiry-abort token; "CANCEL" is
        // accepted as an alias inside an inquiry read loop so a peer that
        // sends the full command verb mid-inquiry still aborts cleanly.
        b"CAN" | b"CANCEL" if rest.is_empty() => Ok(Message::Cancel),
        _ => Err(Error::new(ErrorCode::InvalidResponse)),
    }
}

/// `ERR` is followed by a mandatory decimal code and an optional
/// description (§4.E rule 4).
fn parse_err_args(rest: &[u8]) -> Result<Message> {
    let rest = trim_start(rest);
    let (code_str, desc) = match split_once_byte(rest, b' ') {
        Some((c, d)) => (c, Some(to_text(d))),
        None => (rest, None),
    };
    let code_num: u16 = to_text(code_str)
        .parse()
        .map_err(|_| Error::new(ErrorCode::InvalidResponse))?;
    Ok(Message::Err {
        code: ErrorCode::from_wire(code_num),
        description: desc,
    })
}

fn split_keyword_args(rest: &[u8]) -> (String, String) {
    match split_once_byte(rest, b' ') {
        Some((kw, args)) => (to_text(kw), to_text(args)),
        None => (to_text(rest), String::new()),
    }
}

fn none_if_empty(s: &[u8]) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(to_text(s))
    }
}

fn trim_start(b: &[u8]) -> &[u8] {
    match b.iter().position(|&c| c != b' ' && c != b'\t') {
        Some(pos) => &b[pos..],
        None => b"",
    }
}

fn split_once_byte(b: &[u8], needle: u8) -> Option<(&[u8], &[u8])> {
    b.iter()
        .position(|&c| c == needle)
        .map(|pos| (&b[..pos], &b[pos + 1..]))
}

fn to_text(b: &[u8]) -> String {
    String::from_utf8_lossy(b).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_splits_verb_and_preserves_internal_whitespace() {
        let (verb, args) = parse_command_line(b"  ECHO   hello   world");
        assert_eq!(verb, "ECHO");
        assert_eq!(args, "  hello   world");
    }

    #[test]
    fn command_with_no_args() {
        let (verb, args) = parse_command_line(b"NOP");
        assert_eq!(verb, "NOP");
        assert_eq!(args, "");
    }

    #[test]
    fn ok_with_and_without_info() {
        assert_eq!(parse_reply_line(b"OK").unwrap(), Message::Ok { info: None });
        assert_eq!(
            parse_reply_line(b"OK closing down").unwrap(),
            Message::Ok {
                info: Some("closing down".to_string())
            }
        );
    }

    #[test]
    fn err_line_parses_code_and_description() {
        let msg = parse_reply_line(b"ERR 275 Unknown command").unwrap();
        assert_eq!(
            msg,
            Message::Err {
                code: ErrorCode::UnknownCommand,
                description: Some("Unknown command".to_string())
            }
        );
    }

    #[test]
    fn data_line_is_percent_decoded() {
        let msg = parse_reply_line(b"D ab%25c%0D").unwrap();
        assert_eq!(msg, Message::Data(b"ab%c\r".to_vec()));
    }

    #[test]
    fn unknown_leading_token_is_invalid_response() {
        let err = parse_reply_line(b"WAT something").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidResponse);
    }

    #[test]
    fn comment_lines_are_ignorable() {
        assert_eq!(
            parse_reply_line(b"# a note").unwrap(),
            Message::Comment("a note".to_string())
        );
    }

    #[test]
    fn end_and_can_reject_trailing_args() {
        assert!(parse_reply_line(b"END extra").is_err());
        assert!(parse_reply_line(b"CAN extra").is_err());
    }

    #[test]
    fn data_line_with_high_bytes_is_not_lossily_converted() {
        let encoded = crate::message::encode_data_inline(&[0xFFu8, 0x80, b'a']);
        let mut line = b"D ".to_vec();
        line.extend_from_slice(&encoded);
        let msg = parse_reply_line(&line).unwrap();
        assert_eq!(msg, Message::Data(vec![0xFFu8, 0x80, b'a']));
    }
}
