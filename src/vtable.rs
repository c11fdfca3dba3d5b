//! # System Vtable
//!
//! Indirection layer over the OS primitives the protocol engine needs:
//! `pipe`, `close`, `read`, `write`, `sendmsg`/`recvmsg`, `socket`/`connect`,
//! `socketpair`, `spawn`, `waitpid`, `usleep`. Everything above this module
//! talks to [`SystemHooks`], never to `libc`/`nix` directly, so that an
//! embedding caller — exactly like libassuan's `assuan_set_system_hooks` —
//! can substitute a test double or a sandboxed syscall path.
//!
//! ## Version negotiation
//!
//! The original C vtable is versioned by an integer, with lower-versioned
//! callers missing newer fields and the core filling those in from
//! defaults. Rust's trait default methods model this directly: the
//! version-1 operations (`usleep`, `pipe`, `close`, `read`, `write`,
//! `sendmsg`, `recvmsg`, `spawn`, `waitpid`, `socketpair`) are required;
//! the version-2 additions (`socket`, `connect`) have default
//! implementations that fall back to the platform default behavior, so a
//! [`UserSupplied`] implementor that predates version 2 still works
//! unmodified.

use std::io;
use std::path::Path;
use std::process::Child;
use std::sync::Arc;

/// A received batch of passed file descriptors, plus the non-ancillary
/// bytes read alongside it.
pub struct RecvResult {
    pub bytes: usize,
    pub fds: Vec<i32>,
}

/// Everything needed to hand a child process off to [`SystemHooks::spawn`].
pub struct SpawnRequest<'a> {
    pub path: &'a Path,
    pub argv: &'a [String],
    pub stdin_fd: i32,
    pub stdout_fd: i32,
    /// File descriptors, beyond stdin/stdout/stderr, to leave open across
    /// exec in the child.
    pub inherited_fds: &'a [i32],
}

/// The pluggable syscall capability. See the module docs for the
/// version-negotiation story.
pub trait SystemHooks: Send + Sync {
    fn usleep(&self, micros: u64);

    fn pipe(&self) -> io::Result<(i32, i32)>;

    fn close(&self, fd: i32) -> io::Result<()>;

    fn read(&self, fd: i32, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&self, fd: i32, buf: &[u8]) -> io::Result<usize>;

    /// Send `buf` on a socket, optionally attaching `fds` as ancillary
    /// data (`SCM_RIGHTS`). `fds` is empty for an ordinary line write.
    fn sendmsg(&self, fd: i32, buf: &[u8], fds: &[i32]) -> io::Result<usize>;

    /// Receive into `buf`, returning any ancillary file descriptors
    /// attached to the datagram/stream record.
    fn recvmsg(&self, fd: i32, buf: &mut [u8]) -> io::Result<RecvResult>;

    /// Spawn a child process, returning its pid. The child's stdin/stdout
    /// are dup'd from `stdin_fd`/`stdout_fd`; all file descriptors except
    /// those in `inherited_fds` (and stdin/stdout/stderr) are closed in the
    /// child before exec.
    fn spawn(&self, request: SpawnRequest<'_>) -> io::Result<u32>;

    /// Wait for `pid`. `blocking = false` performs a `WNOHANG`-style poll,
    /// returning `Ok(None)` if the child hasn't exited yet.
    fn waitpid(&self, pid: u32, blocking: bool) -> io::Result<Option<i32>>;

    fn socketpair(&self) -> io::Result<(i32, i32)>;

    /// Version-2 addition: create a local stream socket bound to `path`
    /// and start listening. Default falls back to the platform default
    /// behavior so older `UserSupplied` implementations keep working.
    fn socket(&self, path: &Path) -> io::Result<i32> {
        platform_default_listen(path)
    }

    /// Version-2 addition: connect to a local stream socket at `path`.
    fn connect(&self, path: &Path) -> io::Result<i32> {
        platform_default_connect(path)
    }
}

/// Hooks run immediately before and after every default-path blocking
/// syscall, so an embedder can suspend signal delivery or cancellation
/// around them without wrapping every call site themselves.
pub trait SyscallGuard: Send + Sync {
    fn before(&self) {}
    fn after(&self) {}
}

#[derive(Default)]
struct NoopGuard;
impl SyscallGuard for NoopGuard {}

/// Returns the compiled-in platform default: [`PosixDefault`] on Unix,
/// [`WindowsDefault`] on Windows.
pub fn default_vtable() -> Arc<dyn SystemHooks> {
    #[cfg(unix)]
    {
        Arc::new(unix_impl::PosixDefault::new())
    }
    #[cfg(windows)]
    {
        Arc::new(windows_impl::WindowsDefault::new())
    }
}

fn platform_default_listen(path: &Path) -> io::Result<i32> {
    #[cfg(unix)]
    {
        unix_impl::listen_unix(path)
    }
    #[cfg(windows)]
    {
        windows_impl::listen_tcp_loopback(path)
    }
}

fn platform_default_connect(path: &Path) -> io::Result<i32> {
    #[cfg(unix)]
    {
        unix_impl::connect_unix(path)
    }
    #[cfg(windows)]
    {
        windows_impl::connect_tcp_loopback(path)
    }
}

/// Wraps a caller-supplied [`SystemHooks`] so it can be installed in
/// [`crate::config::GlobalConfig`] alongside the compiled-in defaults.
/// Exists mostly for the symmetry called for in design note 9
/// (`{PosixDefault, WindowsDefault, UserSupplied}`); in practice any `Arc<dyn
/// SystemHooks>` can be installed directly.
pub struct UserSupplied<T: SystemHooks>(pub T);

impl<T: SystemHooks> SystemHooks for UserSupplied<T> {
    fn usleep(&self, micros: u64) {
        self.0.usleep(micros)
    }
    fn pipe(&self) -> io::Result<(i32, i32)> {
        self.0.pipe()
    }
    fn close(&self, fd: i32) -> io::Result<()> {
        self.0.close(fd)
    }
    fn read(&self, fd: i32, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(fd, buf)
    }
    fn write(&self, fd: i32, buf: &[u8]) -> io::Result<usize> {
        self.0.write(fd, buf)
    }
    fn sendmsg(&self, fd: i32, buf: &[u8], fds: &[i32]) -> io::Result<usize> {
        self.0.sendmsg(fd, buf, fds)
    }
    fn recvmsg(&self, fd: i32, buf: &mut [u8]) -> io::Result<RecvResult> {
        self.0.recvmsg(fd, buf)
    }
    fn spawn(&self, request: SpawnRequest<'_>) -> io::Result<u32> {
        self.0.spawn(request)
    }
    fn waitpid(&self, pid: u32, blocking: bool) -> io::Result<Option<i32>> {
        self.0.waitpid(pid, blocking)
    }
    fn socketpair(&self) -> io::Result<(i32, i32)> {
        self.0.socketpair()
    }
    fn socket(&self, path: &Path) -> io::Result<i32> {
        self.0.socket(path)
    }
    fn connect(&self, path: &Path) -> io::Result<i32> {
        self.0.connect(path)
    }
}

/// Reaps a spawned child, first trying a non-blocking wait and, if it
/// hasn't exited, sending it a signal and waiting blocking — matching
/// `release`'s documented "non-blocking waitpid with fallback to
/// send-signal-then-wait".
pub fn reap_child(hooks: &dyn SystemHooks, pid: u32) {
    if hooks.waitpid(pid, false).ok().flatten().is_some() {
        return;
    }
    #[cfg(unix)]
    unix_impl::terminate_and_reap(hooks, pid);
    #[cfg(not(unix))]
    let _ = hooks.waitpid(pid, true);
}

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use std::os::fd::RawFd;

    use nix::sys::signal::{kill, Signal};
    use nix::sys::socket::{
        bind, connect as nix_connect, listen, recvmsg as nix_recvmsg, sendmsg as nix_sendmsg,
        socket as nix_socket, socketpair as nix_socketpair, AddressFamily, Backlog,
        ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType, UnixAddr,
    };
    use nix::sys::wait::{waitpid as nix_waitpid, WaitPidFlag, WaitStatus};
    use nix::unistd::Pid;

    /// The default POSIX vtable: plain blocking syscalls via `nix`/`libc`,
    /// with optional pre/post hooks wrapped around every blocking call.
    pub struct PosixDefault {
        guard: Arc<dyn SyscallGuard>,
    }

    impl PosixDefault {
        pub fn new() -> Self {
            PosixDefault {
                guard: Arc::new(NoopGuard),
            }
        }

        /// Install pre/post hooks around every blocking syscall this vtable
        /// performs, e.g. to mask signals or disable cancellation.
        pub fn with_guard(guard: Arc<dyn SyscallGuard>) -> Self {
            PosixDefault { guard }
        }

        fn wrapped<T>(&self, f: impl FnOnce() -> io::Result<T>) -> io::Result<T> {
            self.guard.before();
            let result = f();
            self.guard.after();
            result
        }
    }

    impl Default for PosixDefault {
        fn default() -> Self {
            PosixDefault::new()
        }
    }

    impl SystemHooks for PosixDefault {
        fn usleep(&self, micros: u64) {
            self.guard.before();
            std::thread::sleep(std::time::Duration::from_micros(micros));
            self.guard.after();
        }

        fn pipe(&self) -> io::Result<(i32, i32)> {
            self.wrapped(|| {
                let (r, w) = os_pipe::pipe()?;
                // os_pipe hands back owned handles; we want to keep raw fds
                // under our own bookkeeping (the context closes them via
                // `close`), so leak the Rust-side ownership here.
                use std::os::fd::IntoRawFd;
                Ok((r.into_raw_fd(), w.into_raw_fd()))
            })
        }

        fn close(&self, fd: i32) -> io::Result<()> {
            self.wrapped(|| {
                nix::unistd::close(fd).map_err(io_err)?;
                Ok(())
            })
        }

        fn read(&self, fd: i32, buf: &mut [u8]) -> io::Result<usize> {
            loop {
                self.guard.before();
                let r = nix::unistd::read(fd, buf);
                self.guard.after();
                match r {
                    Ok(n) => return Ok(n),
                    Err(nix::Error::EINTR) => continue,
                    Err(e) => return Err(io_err(e)),
                }
            }
        }

        fn write(&self, fd: i32, buf: &[u8]) -> io::Result<usize> {
            loop {
                self.guard.before();
                let r = nix::unistd::write(unsafe { borrow_fd(fd) }, buf);
                self.guard.after();
                match r {
                    Ok(n) => return Ok(n),
                    Err(nix::Error::EINTR) => continue,
                    Err(e) => return Err(io_err(e)),
                }
            }
        }

        fn sendmsg(&self, fd: i32, buf: &[u8], fds: &[i32]) -> io::Result<usize> {
            loop {
                let iov = [std::io::IoSlice::new(buf)];
                let cmsgs: Vec<ControlMessage> = if fds.is_empty() {
                    Vec::new()
                } else {
                    vec![ControlMessage::ScmRights(fds)]
                };
                self.guard.before();
                let r = nix_sendmsg::<UnixAddr>(fd, &iov, &cmsgs, MsgFlags::empty(), None);
                self.guard.after();
                match r {
                    Ok(n) => return Ok(n),
                    Err(nix::Error::EINTR) => continue,
                    Err(e) => return Err(io_err(e)),
                }
            }
        }

        fn recvmsg(&self, fd: i32, buf: &mut [u8]) -> io::Result<RecvResult> {
            loop {
                let mut iov = [std::io::IoSliceMut::new(buf)];
                let mut cmsg_space = nix::cmsg_space!([RawFd; 16]);
                self.guard.before();
                let r = nix_recvmsg::<UnixAddr>(
                    fd,
                    &mut iov,
                    Some(&mut cmsg_space),
                    MsgFlags::empty(),
                );
                self.guard.after();
                match r {
                    Ok(msg) => {
                        let bytes = msg.bytes;
                        let mut out_fds = Vec::new();
                        for cmsg in msg.cmsgs().map_err(io_err)? {
                            if let ControlMessageOwned::ScmRights(received) = cmsg {
                                out_fds.extend(received);
                            }
                        }
                        return Ok(RecvResult {
                            bytes,
                            fds: out_fds,
                        });
                    }
                    Err(nix::Error::EINTR) => continue,
                    Err(e) => return Err(io_err(e)),
                }
            }
        }

        fn spawn(&self, request: SpawnRequest<'_>) -> io::Result<u32> {
            self.wrapped(|| spawn_posix(request))
        }

        fn waitpid(&self, pid: u32, blocking: bool) -> io::Result<Option<i32>> {
            self.wrapped(|| {
                let flag = if blocking {
                    None
                } else {
                    Some(WaitPidFlag::WNOHANG)
                };
                match nix_waitpid(Pid::from_raw(pid as i32), flag) {
                    Ok(WaitStatus::StillAlive) => Ok(None),
                    Ok(WaitStatus::Exited(_, code)) => Ok(Some(code)),
                    Ok(WaitStatus::Signaled(_, sig, _)) => Ok(Some(-(sig as i32))),
                    Ok(_) => Ok(Some(0)),
                    Err(e) => Err(io_err(e)),
                }
            })
        }

        fn socketpair(&self) -> io::Result<(i32, i32)> {
            self.wrapped(|| {
                let (a, b) = nix_socketpair(
                    AddressFamily::Unix,
                    SockType::Stream,
                    None,
                    SockFlag::empty(),
                )
                .map_err(io_err)?;
                use std::os::fd::IntoRawFd;
                Ok((a.into_raw_fd(), b.into_raw_fd()))
            })
        }

        fn socket(&self, path: &Path) -> io::Result<i32> {
            self.wrapped(|| listen_unix(path))
        }

        fn connect(&self, path: &Path) -> io::Result<i32> {
            self.wrapped(|| connect_unix(path))
        }
    }

    fn io_err(e: nix::Error) -> io::Error {
        io::Error::from_raw_os_error(e as i32)
    }

    unsafe fn borrow_fd(fd: i32) -> std::os::fd::BorrowedFd<'static> {
        std::os::fd::BorrowedFd::borrow_raw(fd)
    }

    pub(super) fn listen_unix(path: &Path) -> io::Result<i32> {
        use std::os::fd::{AsRawFd, IntoRawFd};
        let _ = std::fs::remove_file(path);
        let addr = UnixAddr::new(path).map_err(io_err)?;
        let fd = nix_socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::empty(),
            None,
        )
        .map_err(io_err)?;
        bind(fd.as_raw_fd(), &addr).map_err(io_err)?;
        listen(&fd, Backlog::new(16).unwrap_or(Backlog::MAXCONN)).map_err(io_err)?;
        Ok(fd.into_raw_fd())
    }

    pub(super) fn connect_unix(path: &Path) -> io::Result<i32> {
        use std::os::fd::{AsRawFd, IntoRawFd};
        let addr = UnixAddr::new(path).map_err(io_err)?;
        let fd = nix_socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::empty(),
            None,
        )
        .map_err(io_err)?;
        nix_connect(fd.as_raw_fd(), &addr).map_err(io_err)?;
        Ok(fd.into_raw_fd())
    }

    fn spawn_posix(request: SpawnRequest<'_>) -> io::Result<u32> {
        use std::os::unix::process::CommandExt;
        use std::process::{Command, Stdio};

        let mut cmd = Command::new(request.path);
        if !request.argv.is_empty() {
            cmd.args(&request.argv[1.min(request.argv.len())..]);
        }

        // SAFETY: dup2/close are async-signal-safe and this closure runs
        // only between fork and exec in the child.
        let stdin_fd = request.stdin_fd;
        let stdout_fd = request.stdout_fd;
        let inherited: Vec<i32> = request.inherited_fds.to_vec();
        unsafe {
            cmd.pre_exec(move || {
                if stdin_fd >= 0 {
                    libc::dup2(stdin_fd, 0);
                }
                if stdout_fd >= 0 {
                    libc::dup2(stdout_fd, 1);
                }
                let max_fd = libc::sysconf(libc::_SC_OPEN_MAX).max(256) as i32;
                for fd in 3..max_fd {
                    if fd == stdin_fd || fd == stdout_fd || inherited.contains(&fd) {
                        continue;
                    }
                    libc::close(fd);
                }
                Ok(())
            });
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());

        let child: Child = cmd.spawn()?;
        Ok(child.id())
    }

    pub(super) fn terminate_and_reap(hooks: &dyn SystemHooks, pid: u32) {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        let _ = hooks.waitpid(pid, true);
    }
}

#[cfg(windows)]
mod windows_impl {
    use super::*;

    /// Windows stand-in: named pipes/local TCP loopback rather than
    /// Unix-domain sockets, and no ancillary fd passing (there is no
    /// `SCM_RIGHTS` equivalent wired up here).
    pub struct WindowsDefault;

    impl WindowsDefault {
        pub fn new() -> Self {
            WindowsDefault
        }
    }

    impl SystemHooks for WindowsDefault {
        fn usleep(&self, micros: u64) {
            std::thread::sleep(std::time::Duration::from_micros(micros));
        }

        fn pipe(&self) -> io::Result<(i32, i32)> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "raw fd pipes are POSIX-only; use a named pipe transport on Windows",
            ))
        }

        fn close(&self, _fd: i32) -> io::Result<()> {
            Ok(())
        }

        fn read(&self, _fd: i32, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Unsupported, "unimplemented"))
        }

        fn write(&self, _fd: i32, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Unsupported, "unimplemented"))
        }

        fn sendmsg(&self, _fd: i32, _buf: &[u8], _fds: &[i32]) -> io::Result<usize> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "ancillary fd passing is POSIX-only",
            ))
        }

        fn recvmsg(&self, _fd: i32, _buf: &mut [u8]) -> io::Result<RecvResult> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "ancillary fd passing is POSIX-only",
            ))
        }

        fn spawn(&self, request: SpawnRequest<'_>) -> io::Result<u32> {
            let child = std::process::Command::new(request.path).spawn()?;
            Ok(child.id())
        }

        fn waitpid(&self, _pid: u32, _blocking: bool) -> io::Result<Option<i32>> {
            Ok(Some(0))
        }

        fn socketpair(&self) -> io::Result<(i32, i32)> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "socketpair is POSIX-only; use a TCP loopback pair on Windows",
            ))
        }
    }

    pub(super) fn listen_tcp_loopback(_path: &Path) -> io::Result<i32> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "unimplemented"))
    }

    pub(super) fn connect_tcp_loopback(_path: &Path) -> io::Result<i32> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "unimplemented"))
    }
}
