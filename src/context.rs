//! The per-conversation state object (§3, §4.B): owns the line buffers,
//! the vtable snapshot, the role-specific substate, and the flag bits
//! (`open`, `input_eof`, `confidential`, `pending_cancel`).

use std::path::Path;
use std::sync::Arc;

use crate::buffer::{Conduit, LineBuffer};
use crate::config::GlobalConfig;
use crate::error::{Error, ErrorCode, Result};
use crate::server::CommandTable;
use crate::transport::{self, PeerCredentials};
use crate::vtable::SystemHooks;

/// Which side of the conversation this context drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// The flag bits named in §3's data model.
#[derive(Debug, Clone, Copy, Default)]
pub struct Flags {
    pub confidential: bool,
    pub pending_cancel: bool,
    /// Set when termination was triggered by a `BYE` observed mid-inquiry
    /// (§4.F, DESIGN.md Open Question 1): that case closes the connection
    /// without a trailing reply line, unlike an ordinary top-level `BYE`
    /// which still gets its `OK`.
    pub(crate) suppress_terminal_reply: bool,
}

/// §4.F's state machine, collapsed to the subset observable from outside
/// a single `process`/`transact` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Open,
    Terminated,
    Broken,
}

/// The primary entity (§3 "Context"). Created by a role-specific
/// constructor, driven exclusively by the thread that created it, and
/// torn down by [`Context::release`] (or, if the caller forgets, by
/// [`Drop`]).
pub struct Context {
    pub(crate) buffer: LineBuffer,
    pub(crate) role: Role,
    pub(crate) flags: Flags,
    pub(crate) state: ConnState,
    pub(crate) peer_pid: Option<u32>,
    pub(crate) owns_peer_pid: bool,
    pub(crate) inquiry_depth: u8,
    pub(crate) hooks: Arc<dyn SystemHooks>,
    pub(crate) config: Arc<GlobalConfig>,
    pub(crate) peer_credentials: Option<PeerCredentials>,
    pub(crate) commands: Option<CommandTable>,
    /// Client-role substate: the handler installed by `set_inquiry_handler`
    /// (§6), used by `transact` calls that don't supply their own.
    pub(crate) default_inquire_handler: Option<Arc<crate::client::InquireHandlerFn>>,
    torn_down: bool,
}

impl Context {
    fn new(
        buffer: LineBuffer,
        role: Role,
        hooks: Arc<dyn SystemHooks>,
        config: Arc<GlobalConfig>,
    ) -> Self {
        Context {
            buffer,
            role,
            flags: Flags::default(),
            state: ConnState::Open,
            peer_pid: None,
            owns_peer_pid: false,
            inquiry_depth: 0,
            hooks,
            config,
            peer_credentials: None,
            commands: if role == Role::Server {
                Some(CommandTable::new())
            } else {
                None
            },
            default_inquire_handler: None,
            torn_down: false,
        }
    }

    /// `new_server_pipe` (§6): wrap two already-open, inherited file
    /// descriptors as a server conversation.
    pub fn new_server_pipe(in_fd: i32, out_fd: i32) -> Self {
        let config = GlobalConfig::snapshot();
        let hooks = config.vtable.clone();
        let buffer = LineBuffer::new(hooks.clone(), Conduit::Pipe, in_fd, out_fd);
        Context::new(buffer, Role::Server, hooks, config)
    }

    /// `new_server_socket` (§6): accept one connection on `listen_fd` and
    /// wrap it as a server conversation, capturing peer credentials where
    /// the platform supports it (§4.H).
    pub fn new_server_socket(listen_fd: i32) -> Result<Self> {
        let config = GlobalConfig::snapshot();
        let hooks = config.vtable.clone();
        let accepted =
            transport::accept(listen_fd).map_err(|e| Error::io(ErrorCode::AcceptFailed, e))?;
        let buffer = LineBuffer::new(hooks.clone(), Conduit::Socket, accepted, accepted);
        let mut ctx = Context::new(buffer, Role::Server, hooks, config);
        ctx.peer_credentials = transport::peer_credentials(accepted);
        Ok(ctx)
    }

    /// `new_client_pipe` (§6): spawn `path argv...` with a fresh pipe pair
    /// connected to its stdin/stdout, keeping the other end. Returns the
    /// context and the child's pid.
    pub fn new_client_pipe(
        path: &Path,
        argv: &[String],
        inherited_fds: &[i32],
    ) -> Result<(Self, u32)> {
        let config = GlobalConfig::snapshot();
        let hooks = config.vtable.clone();

        let (child_stdin_r, parent_stdin_w) =
            hooks.pipe().map_err(|e| Error::io(ErrorCode::General, e))?;
        let (parent_stdout_r, child_stdout_w) =
            hooks.pipe().map_err(|e| Error::io(ErrorCode::General, e))?;

        let request = crate::vtable::SpawnRequest {
            path,
            argv,
            stdin_fd: child_stdin_r,
            stdout_fd: child_stdout_w,
            inherited_fds,
        };
        let pid = hooks.spawn(request).map_err(|e| Error::io(ErrorCode::General, e))?;

        // The parent doesn't need the fds it handed to the child.
        let _ = hooks.close(child_stdin_r);
        let _ = hooks.close(child_stdout_w);

        let buffer = LineBuffer::new(hooks.clone(), Conduit::Pipe, parent_stdout_r, parent_stdin_w);
        let mut ctx = Context::new(buffer, Role::Client, hooks, config);
        ctx.peer_pid = Some(pid);
        ctx.owns_peer_pid = true;
        Ok((ctx, pid))
    }

    /// `new_client_socket` (§6): connect to a local socket at `path`, with
    /// an optional nonce handshake (§4.H's "nonce-file authentication").
    pub fn new_client_socket(path: &Path, nonce: Option<[u8; 16]>) -> Result<Self> {
        let config = GlobalConfig::snapshot();
        let hooks = config.vtable.clone();
        let fd = hooks
            .connect(path)
            .map_err(|e| Error::io(ErrorCode::ConnectFailed, e))?;
        let mut buffer = LineBuffer::new(hooks.clone(), Conduit::Socket, fd, fd);
        if let Some(nonce) = nonce {
            buffer.queue_line(&crate::message::encode_data_inline(&nonce))?;
            buffer.flush()?;
        }
        let mut ctx = Context::new(buffer, Role::Client, hooks, config);
        ctx.peer_credentials = transport::peer_credentials(fd);
        Ok(ctx)
    }

    /// Socketpair helper (§4.H): build a connected server/client pair with
    /// no process spawn and no socket path, for in-process testing.
    pub fn socketpair_pair() -> Result<(Context, Context)> {
        let config = GlobalConfig::snapshot();
        let hooks = config.vtable.clone();
        let (a, b) = hooks
            .socketpair()
            .map_err(|e| Error::io(ErrorCode::General, e))?;
        let server = Context::new(
            LineBuffer::new(hooks.clone(), Conduit::Socket, a, a),
            Role::Server,
            hooks.clone(),
            config.clone(),
        );
        let client = Context::new(
            LineBuffer::new(hooks.clone(), Conduit::Socket, b, b),
            Role::Client,
            hooks,
            config,
        );
        Ok((server, client))
    }

    /// `register_command` (§6): add or replace a server verb's handler.
    /// `Err(Parameter)` if called on a client-role context.
    pub fn register_command(
        &mut self,
        verb: &str,
        handler: impl Fn(&mut crate::server::HandlerHandle<'_>, &str) -> Result<()>
            + Send
            + Sync
            + 'static,
        help: Option<&str>,
    ) -> Result<()> {
        self.commands
            .as_mut()
            .ok_or_else(|| Error::new(ErrorCode::Parameter))?
            .register(verb, handler, help)
    }

    /// Install the `OPTION key=value` forwarding hook (Supplemented
    /// feature C.1). No-op on a client-role context.
    pub fn set_option_hook(
        &mut self,
        hook: impl Fn(&mut crate::server::HandlerHandle<'_>, &str, &str) -> Result<()>
            + Send
            + Sync
            + 'static,
    ) {
        if let Some(table) = self.commands.as_mut() {
            table.set_option_hook(hook);
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_broken(&self) -> bool {
        self.state == ConnState::Broken
    }

    pub fn is_terminated(&self) -> bool {
        self.state == ConnState::Terminated
    }

    pub fn is_canceled(&self) -> bool {
        self.flags.pending_cancel
    }

    pub fn peer_credentials(&self) -> Option<PeerCredentials> {
        self.peer_credentials
    }

    pub fn pending_fd_count(&self) -> usize {
        self.buffer.pending_fd_count()
    }

    /// Take one file descriptor received via ancillary data, in FIFO
    /// order. The caller owns it from this point (§5).
    pub fn receive_fd(&mut self) -> Option<i32> {
        self.buffer.take_received_fd()
    }

    /// Queue a file descriptor to be attached, via `SCM_RIGHTS`, to the
    /// next line flushed on a socket conduit (§4.C "Ancillary data", §6
    /// `send_fd`). Ownership is not transferred here: the caller still owns
    /// `fd` and must close it once the peer has acknowledged receipt; on a
    /// pipe conduit the fd is silently dropped at the next flush since
    /// plain `write` carries no side channel for it.
    pub fn send_fd(&mut self, fd: i32) {
        self.buffer.queue_fds(&[fd]);
    }

    /// Queue several file descriptors as one ancillary-data batch (§4.C).
    pub fn send_fds(&mut self, fds: &[i32]) {
        self.buffer.queue_fds(fds);
    }

    /// Set the pending-cancel flag from outside the protocol loop (§5:
    /// "a `pending-cancel` flag set by the embedder via a `cancel(ctx)`
    /// API").
    pub fn cancel(&mut self) {
        self.flags.pending_cancel = true;
    }

    pub fn set_confidential(&mut self, confidential: bool) {
        self.flags.confidential = confidential;
    }

    pub fn is_confidential(&self) -> bool {
        self.flags.confidential
    }

    pub(crate) fn check_broken(&self) -> Result<()> {
        if self.state == ConnState::Broken {
            return Err(Error::new(ErrorCode::AssuanReadError));
        }
        Ok(())
    }

    pub(crate) fn mark_broken(&mut self) {
        self.state = ConnState::Broken;
    }

    pub(crate) fn mark_terminated(&mut self) {
        self.state = ConnState::Terminated;
    }

    /// Drain pending output best-effort, close owned fds, reap a spawned
    /// peer if present (non-blocking `waitpid` falling back to
    /// send-signal-then-wait), then drop all owned memory (§4.B).
    pub fn release(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        let _ = self.buffer.flush();
        let in_fd = self.buffer.in_fd();
        let out_fd = self.buffer.out_fd();
        let _ = self.hooks.close(in_fd);
        if out_fd != in_fd {
            let _ = self.hooks.close(out_fd);
        }
        while let Some(fd) = self.buffer.take_received_fd() {
            let _ = self.hooks.close(fd);
        }
        if self.owns_peer_pid {
            if let Some(pid) = self.peer_pid {
                crate::vtable::reap_child(self.hooks.as_ref(), pid);
            }
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vtable::default_vtable;

    #[test]
    fn server_pipe_context_starts_open() {
        let hooks = default_vtable();
        let (r, w) = hooks.pipe().unwrap();
        let ctx = Context::new_server_pipe(r, w);
        assert_eq!(ctx.role(), Role::Server);
        assert!(!ctx.is_broken());
        assert!(!ctx.is_terminated());
    }

    #[test]
    fn cancel_sets_pending_flag() {
        let hooks = default_vtable();
        let (r, w) = hooks.pipe().unwrap();
        let mut ctx = Context::new_server_pipe(r, w);
        assert!(!ctx.is_canceled());
        ctx.cancel();
        assert!(ctx.is_canceled());
    }
}
