//! The client role (§4.G): sending a command and collecting the reply
//! stream, with the client's side of the inquiry sub-protocol.

use std::sync::Arc;

use crate::buffer::ReadOutcome;
use crate::context::{Context, Role};
use crate::engine::parse_reply_line;
use crate::error::{Error, ErrorCode, Result};
use crate::message::Message;

/// A handler for a server-initiated inquiry, installed either per-call
/// (`transact`'s `inquire_handler` parameter) or persistently via
/// [`set_inquiry_handler`].
pub type InquireHandlerFn = dyn Fn(&str, &str, &mut InquiryResponder<'_>) -> Result<()> + Send + Sync;

/// Install a persistent inquiry handler (§6 `set_inquiry_handler`), used
/// by any [`transact`] call that doesn't pass its own.
pub fn set_inquiry_handler(
    ctx: &mut Context,
    handler: impl Fn(&str, &str, &mut InquiryResponder<'_>) -> Result<()> + Send + Sync + 'static,
) {
    ctx.default_inquire_handler = Some(Arc::new(handler));
}

/// Handed to an inquiry handler so it can answer with zero or more `D`
/// chunks; the client itself sends the terminating `END` once the handler
/// returns (§4.G: "The handler may write `D` chunks; the client
/// terminates the inquiry with `END`.").
pub struct InquiryResponder<'a> {
    ctx: &'a mut Context,
}

impl<'a> InquiryResponder<'a> {
    /// Attach a file descriptor to the next `write_data` flush (§4.C, §6
    /// `send_fd`), for an inquiry answer that hands the server a resource
    /// rather than inline bytes.
    pub fn send_fd(&mut self, fd: i32) {
        self.ctx.send_fd(fd);
    }

    pub fn write_data(&mut self, bytes: &[u8]) -> Result<()> {
        for line in crate::message::encode_data_lines(bytes) {
            self.ctx.buffer.queue_line(&line)?;
        }
        self.ctx.buffer.flush().map_err(|e| {
            self.ctx.mark_broken();
            e
        })
    }
}

/// Send `command` (a full command line, e.g. `"ECHO hello world"`) and
/// read reply lines until a terminal `OK`/`ERR`, routing `D` to
/// `data_sink`, `S` to `status_sink`, and `INQUIRE` to `inquire_handler`
/// (falling back to the context's persistent handler, if any, when the
/// per-call one is `None`).
pub fn transact(
    ctx: &mut Context,
    command: &str,
    mut data_sink: Option<&mut dyn FnMut(&[u8]) -> Result<()>>,
    inquire_handler: Option<&dyn Fn(&str, &str, &mut InquiryResponder<'_>) -> Result<()>>,
    mut status_sink: Option<&mut dyn FnMut(&str, &str)>,
) -> Result<()> {
    debug_assert_eq!(ctx.role(), Role::Client);
    ctx.check_broken()?;

    ctx.buffer.queue_line(command.as_bytes())?;
    ctx.buffer.flush().map_err(|e| {
        ctx.mark_broken();
        e
    })?;

    loop {
        let line = match ctx.buffer.read_line() {
            Ok(ReadOutcome::Line(l)) => l,
            Ok(ReadOutcome::Eof) => {
                ctx.mark_broken();
                return Err(Error::new(ErrorCode::Eof));
            }
            Err(e) => {
                ctx.mark_broken();
                return Err(e);
            }
        };
        match parse_reply_line(&line)? {
            Message::Comment(_) => continue,
            Message::Ok { .. } => return Ok(()),
            Message::Err { code, description } => {
                return Err(match description {
                    Some(d) => Error::with_description(code, d),
                    None => Error::new(code),
                });
            }
            Message::Status { keyword, args } => {
                if let Some(sink) = status_sink.as_deref_mut() {
                    sink(&keyword, &args);
                }
            }
            Message::Data(bytes) => match data_sink.as_deref_mut() {
                Some(sink) => sink(&bytes)?,
                None => return Err(Error::new(ErrorCode::NoDataCallback)),
            },
            Message::Inquire { keyword, args } => {
                answer_inquiry(ctx, &keyword, &args, inquire_handler)?;
            }
            Message::End | Message::Cancel | Message::Command { .. } => {
                return Err(Error::new(ErrorCode::InvalidResponse));
            }
        }
    }
}

fn answer_inquiry(
    ctx: &mut Context,
    keyword: &str,
    args: &str,
    inquire_handler: Option<&dyn Fn(&str, &str, &mut InquiryResponder<'_>) -> Result<()>>,
) -> Result<()> {
    let default_handler = ctx.default_inquire_handler.clone();
    let result = match (inquire_handler, default_handler.as_deref()) {
        (Some(h), _) => {
            let mut responder = InquiryResponder { ctx };
            h(keyword, args, &mut responder)
        }
        (None, Some(h)) => {
            let mut responder = InquiryResponder { ctx };
            h(keyword, args, &mut responder)
        }
        (None, None) => {
            ctx.buffer.queue_line(b"CAN")?;
            ctx.buffer.flush().map_err(|e| {
                ctx.mark_broken();
                e
            })?;
            return Err(Error::new(ErrorCode::NoInquireCallback));
        }
    };
    match result {
        Ok(()) => {
            ctx.buffer.queue_line(b"END")?;
            ctx.buffer.flush().map_err(|e| {
                ctx.mark_broken();
                e
            })
        }
        Err(e) => {
            ctx.buffer.queue_line(b"CAN")?;
            ctx.buffer.flush().map_err(|e| {
                ctx.mark_broken();
                e
            })?;
            Err(e)
        }
    }
}

/// Write a raw, already-formatted line (diagnostic/test use, §4.G).
pub fn send_raw(ctx: &mut Context, line: &str) -> Result<()> {
    ctx.buffer.queue_line(line.as_bytes())?;
    ctx.buffer.flush().map_err(|e| {
        ctx.mark_broken();
        e
    })
}

/// Read one raw line (diagnostic/test use, §4.G). `Ok(None)` on a clean
/// peer close. Lossily converted to `String`: raw-line diagnostics are
/// textual by convention, unlike a `D`-line payload's hard 8-bit-clean
/// requirement (§6).
pub fn receive_line(ctx: &mut Context) -> Result<Option<String>> {
    match ctx.buffer.read_line() {
        Ok(ReadOutcome::Line(l)) => Ok(Some(String::from_utf8_lossy(&l).into_owned())),
        Ok(ReadOutcome::Eof) => Ok(None),
        Err(e) => {
            ctx.mark_broken();
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nop_round_trip() {
        let (mut server, mut client) = Context::socketpair_pair().unwrap();

        let server_thread = std::thread::spawn(move || {
            assert_eq!(receive_line(&mut server).unwrap(), Some("NOP".to_string()));
            send_raw(&mut server, "OK").unwrap();
        });

        transact(&mut client, "NOP", None, None, None).unwrap();
        server_thread.join().unwrap();
    }

    #[test]
    fn missing_data_sink_surfaces_error() {
        let (mut server, mut client) = Context::socketpair_pair().unwrap();

        send_raw(&mut server, "D hello").unwrap();
        send_raw(&mut server, "OK").unwrap();

        let err = transact(&mut client, "GET", None, None, None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoDataCallback);
    }

    #[test]
    fn missing_inquire_handler_sends_can_and_errors() {
        let (mut server, mut client) = Context::socketpair_pair().unwrap();

        send_raw(&mut server, "INQUIRE NEED 3").unwrap();

        let err = transact(&mut client, "GETDATA", None, None, None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoInquireCallback);
        assert_eq!(
            receive_line(&mut server).unwrap(),
            Some("CAN".to_string())
        );
    }

    #[test]
    fn inquire_handler_answers_then_client_sends_end() {
        let (mut server, mut client) = Context::socketpair_pair().unwrap();

        send_raw(&mut server, "INQUIRE NEED 3").unwrap();
        send_raw(&mut server, "OK").unwrap();

        let handler = |_kw: &str, _args: &str, r: &mut InquiryResponder<'_>| r.write_data(b"abc");
        transact(&mut client, "GETDATA", None, Some(&handler), None).unwrap();

        assert_eq!(
            receive_line(&mut server).unwrap(),
            Some("D abc".to_string())
        );
        assert_eq!(receive_line(&mut server).unwrap(), Some("END".to_string()));
    }
}
