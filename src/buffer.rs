//! Read/write line buffering, inline-data flush policy, and ancillary file
//! descriptor passing (§4.C).
//!
//! A [`LineBuffer`] is the only thing in this crate that ever touches a raw
//! file descriptor; everything above it (the protocol engine, the server
//! and client roles) deals exclusively in [`crate::message::Message`]
//! values and lines of text.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::{Error, ErrorCode, Result};
use crate::message::MAX_LINE_ENVELOPE;
use crate::vtable::SystemHooks;

/// Whether a buffer's fd(s) are a pipe pair (plain `read`/`write`) or a
/// single stream socket (`sendmsg`/`recvmsg`, which additionally carries
/// ancillary file descriptors).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conduit {
    Pipe,
    Socket,
}

/// The outcome of [`LineBuffer::read_line`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A complete line, with the trailing `LF` (and a single tolerated `CR`
    /// before it) already stripped. Raw bytes, not a `String`: a `D` line's
    /// literal content is whatever bytes the peer sent, not necessarily
    /// valid UTF-8 (§6 "8-bit clean").
    Line(Vec<u8>),
    /// The peer closed its end with nothing left buffered.
    Eof,
}

/// Read and write buffers for one direction pair of a conversation.
///
/// `in_fd`/`out_fd` may be equal (the socket case) or distinct (the pipe
/// case); the buffer doesn't care, it only asks the vtable for the right
/// primitive based on `conduit`.
pub struct LineBuffer {
    hooks: Arc<dyn SystemHooks>,
    conduit: Conduit,
    in_fd: i32,
    out_fd: i32,
    inbuf: Vec<u8>,
    outbuf: Vec<u8>,
    pending_out_fds: Vec<i32>,
    received_fds: VecDeque<i32>,
    read_scratch: Vec<u8>,
}

impl LineBuffer {
    pub fn new(hooks: Arc<dyn SystemHooks>, conduit: Conduit, in_fd: i32, out_fd: i32) -> Self {
        LineBuffer {
            hooks,
            conduit,
            in_fd,
            out_fd,
            inbuf: Vec::with_capacity(MAX_LINE_ENVELOPE),
            outbuf: Vec::new(),
            pending_out_fds: Vec::new(),
            received_fds: VecDeque::new(),
            read_scratch: vec![0u8; 4096],
        }
    }

    pub fn in_fd(&self) -> i32 {
        self.in_fd
    }

    pub fn out_fd(&self) -> i32 {
        self.out_fd
    }

    /// Append one already-formatted line (without the trailing `LF`) to the
    /// pending output. The caller (the protocol engine, via
    /// [`crate::message::Message::to_lines`]) is responsible for keeping
    /// each line within [`MAX_LINE_ENVELOPE`]; this is a defensive check,
    /// not the primary enforcement point (design note: "prefer a parser
    /// that refuses to grow ... rather than one that truncates after the
    /// fact").
    pub fn queue_line(&mut self, line: &[u8]) -> Result<()> {
        if line.len() + 1 > MAX_LINE_ENVELOPE {
            return Err(Error::new(ErrorCode::LineTooLong));
        }
        self.outbuf.extend_from_slice(line);
        self.outbuf.push(b'\n');
        Ok(())
    }

    /// Attach file descriptors to be sent alongside the next [`flush`].
    /// Only meaningful on [`Conduit::Socket`]; queuing on a pipe is a
    /// programmer error caught by the transport layer, not here.
    pub fn queue_fds(&mut self, fds: &[i32]) {
        self.pending_out_fds.extend_from_slice(fds);
    }

    pub fn pending_fd_count(&self) -> usize {
        self.pending_out_fds.len() + self.received_fds.len()
    }

    /// Push all buffered output to the wire. Short writes are retried;
    /// `EINTR` is retried by the vtable itself; `EAGAIN`/`WouldBlock` is
    /// fatal (§4.C: "the core presents a blocking API").
    pub fn flush(&mut self) -> Result<()> {
        if self.outbuf.is_empty() && self.pending_out_fds.is_empty() {
            return Ok(());
        }
        let mut sent = 0usize;
        let fds = std::mem::take(&mut self.pending_out_fds);
        let mut fds_sent = false;
        while sent < self.outbuf.len() {
            let chunk = &self.outbuf[sent..];
            let n = match self.conduit {
                Conduit::Pipe => self
                    .hooks
                    .write(self.out_fd, chunk)
                    .map_err(|e| Error::io(ErrorCode::AssuanWriteError, e))?,
                Conduit::Socket => {
                    let attach: &[i32] = if fds_sent { &[] } else { &fds };
                    let n = self
                        .hooks
                        .sendmsg(self.out_fd, chunk, attach)
                        .map_err(|e| Error::io(ErrorCode::AssuanWriteError, e))?;
                    fds_sent = true;
                    n
                }
            };
            if n == 0 {
                return Err(Error::new(ErrorCode::AssuanWriteError));
            }
            sent += n;
        }
        // fds queued but no bytes queued (shouldn't normally happen, since
        // callers always attach fds to an outgoing line) still need a
        // carrier write so the batch actually reaches the peer.
        if !fds_sent && !fds.is_empty() {
            self.hooks
                .sendmsg(self.out_fd, &[], &fds)
                .map_err(|e| Error::io(ErrorCode::AssuanWriteError, e))?;
        }
        self.outbuf.clear();
        Ok(())
    }

    /// Read one complete line, blocking until either a `LF` is seen, the
    /// peer closes the connection, or the accumulated unterminated prefix
    /// exceeds [`MAX_LINE_ENVELOPE`] (`LINE_TOO_LONG`, fatal).
    pub fn read_line(&mut self) -> Result<ReadOutcome> {
        loop {
            if let Some(pos) = self.inbuf.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.inbuf.drain(..=pos).collect();
                line.pop(); // trailing LF
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(ReadOutcome::Line(line));
            }
            if self.inbuf.len() > MAX_LINE_ENVELOPE {
                return Err(Error::new(ErrorCode::LineTooLong));
            }
            let n = match self.conduit {
                Conduit::Pipe => self
                    .hooks
                    .read(self.in_fd, &mut self.read_scratch)
                    .map_err(|e| Error::io(ErrorCode::AssuanReadError, e))?,
                Conduit::Socket => {
                    let result = self
                        .hooks
                        .recvmsg(self.in_fd, &mut self.read_scratch)
                        .map_err(|e| Error::io(ErrorCode::AssuanReadError, e))?;
                    self.received_fds.extend(result.fds);
                    result.bytes
                }
            };
            if n == 0 {
                if self.inbuf.is_empty() {
                    return Ok(ReadOutcome::Eof);
                }
                return Err(Error::new(ErrorCode::Eof));
            }
            self.inbuf.extend_from_slice(&self.read_scratch[..n]);
            if self.inbuf.len() > MAX_LINE_ENVELOPE {
                return Err(Error::new(ErrorCode::LineTooLong));
            }
        }
    }

    /// Dequeue one file descriptor received via ancillary data, in FIFO
    /// order. Ownership passes to the caller, who must close it (§5
    /// resource ownership).
    pub fn take_received_fd(&mut self) -> Option<i32> {
        self.received_fds.pop_front()
    }

    pub fn received_fd_count(&self) -> usize {
        self.received_fds.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vtable::default_vtable;

    fn socketpair_pair() -> (i32, i32, Arc<dyn SystemHooks>) {
        let hooks = default_vtable();
        let (a, b) = hooks.socketpair().expect("socketpair");
        (a, b, hooks)
    }

    #[test]
    fn write_then_read_one_line() {
        let (a, b, hooks) = socketpair_pair();
        let mut writer = LineBuffer::new(hooks.clone(), Conduit::Socket, a, a);
        let mut reader = LineBuffer::new(hooks, Conduit::Socket, b, b);

        writer.queue_line(b"OK").unwrap();
        writer.flush().unwrap();

        match reader.read_line().unwrap() {
            ReadOutcome::Line(l) => assert_eq!(l, b"OK".to_vec()),
            ReadOutcome::Eof => panic!("unexpected eof"),
        }
    }

    #[test]
    fn overlong_line_is_rejected_before_queueing() {
        let (_a, _b, hooks) = socketpair_pair();
        let mut buf = LineBuffer::new(hooks, Conduit::Socket, 0, 0);
        let huge = vec![b'x'; MAX_LINE_ENVELOPE];
        assert!(buf.queue_line(&huge).is_err());
    }

    #[test]
    fn eof_on_empty_buffer_reports_clean_close() {
        let (a, b, hooks) = socketpair_pair();
        hooks.close(a).unwrap();
        let mut reader = LineBuffer::new(hooks, Conduit::Socket, b, b);
        assert_eq!(reader.read_line().unwrap(), ReadOutcome::Eof);
    }

    #[test]
    fn fds_travel_alongside_a_line() {
        let (a, b, hooks) = socketpair_pair();
        let (extra_r, extra_w) = hooks.pipe().unwrap();
        let mut writer = LineBuffer::new(hooks.clone(), Conduit::Socket, a, a);
        let mut reader = LineBuffer::new(hooks.clone(), Conduit::Socket, b, b);

        writer.queue_line(b"D hi").unwrap();
        writer.queue_fds(&[extra_r]);
        writer.flush().unwrap();

        match reader.read_line().unwrap() {
            ReadOutcome::Line(l) => assert_eq!(l, b"D hi".to_vec()),
            ReadOutcome::Eof => panic!("unexpected eof"),
        }
        assert_eq!(reader.received_fd_count(), 1);
        let fd = reader.take_received_fd().unwrap();
        hooks.close(fd).ok();
        hooks.close(extra_w).ok();
    }
}
