//! Process-wide defaults: allocator hooks, the default system vtable, and
//! the log sink.
//!
//! The original C core exposes these as mutable global function-pointer
//! slots set once at process start. Re-expressed per design note 9 as a
//! [`GlobalConfig`] value installed once ([`GlobalConfig::install`]) and
//! thereafter read-only; every [`crate::context::Context`] constructor
//! takes a snapshot (`Arc<GlobalConfig>`) at construction time so a later
//! `install` call can never race a conversation already in flight.

use std::sync::{Arc, OnceLock};

use tracing::Level;

use crate::vtable::{default_vtable, SystemHooks};

/// Allocation hooks, mirroring the `{allocate, reallocate, free}` trio from
/// the protocol spec. Embedding callers that need a locked/secure heap (the
/// original motivation in libassuan: keeping passphrase buffers out of
/// swap) can supply their own; the default forwards to the global Rust
/// allocator.
///
/// Buffers in this crate are ordinary `Vec<u8>`s; the allocator trait exists
/// so a caller-supplied implementation can additionally *zero* memory on
/// free, which the default does not attempt (matching the core's stance
/// that secure-heap policy is an external collaborator, not the core's
/// job).
pub trait Allocator: Send + Sync {
    fn allocate(&self, len: usize) -> Vec<u8> {
        vec![0u8; len]
    }

    fn reallocate(&self, buf: &mut Vec<u8>, new_len: usize) {
        buf.resize(new_len, 0);
    }

    fn free(&self, buf: Vec<u8>) {
        drop(buf);
    }
}

/// The platform default allocator: a thin pass-through to `Vec`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultAllocator;

impl Allocator for DefaultAllocator {}

/// Abstract log sink the core consumes (§6 `set_log_sink`). Deliberately
/// minimal: a level and a preformatted message, no span machinery, so that
/// an embedder can route this anywhere (syslog, a GUI console, `/dev/null`)
/// without pulling in this crate's own `tracing` use as a transitive
/// dependency of their log pipeline.
pub trait LogSink: Send + Sync {
    fn log(&self, level: Level, message: &str);
}

/// Default sink: forwards to `tracing`, so an embedder who never calls
/// `set_log_sink` still gets output through whatever `tracing-subscriber`
/// they've installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log(&self, level: Level, message: &str) {
        match level {
            Level::ERROR => tracing::error!(target: "assuan::sink", "{message}"),
            Level::WARN => tracing::warn!(target: "assuan::sink", "{message}"),
            Level::INFO => tracing::info!(target: "assuan::sink", "{message}"),
            Level::DEBUG => tracing::debug!(target: "assuan::sink", "{message}"),
            Level::TRACE => tracing::trace!(target: "assuan::sink", "{message}"),
        }
    }
}

/// Process-wide defaults, snapshotted by each context at construction.
pub struct GlobalConfig {
    pub allocator: Arc<dyn Allocator>,
    pub vtable: Arc<dyn SystemHooks>,
    pub log_sink: Arc<dyn LogSink>,
    pub log_level: Level,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        GlobalConfig {
            allocator: Arc::new(DefaultAllocator),
            vtable: default_vtable(),
            log_sink: Arc::new(TracingLogSink),
            log_level: Level::INFO,
        }
    }
}

static GLOBAL: OnceLock<Arc<GlobalConfig>> = OnceLock::new();

impl GlobalConfig {
    /// Install process-wide defaults. Idempotent: the first caller wins,
    /// matching the "configured once at startup" contract in the protocol
    /// spec's concurrency model. Returns the config that ended up
    /// installed (which may not be `self` if another thread raced this
    /// call).
    pub fn install(self) -> Arc<GlobalConfig> {
        let arc = Arc::new(self);
        match GLOBAL.set(arc.clone()) {
            Ok(()) => arc,
            Err(_) => GLOBAL.get().expect("just failed to set, so it's set").clone(),
        }
    }

    /// Take a read-only snapshot of the current global defaults, installing
    /// the platform default the first time it's called if nothing has been
    /// installed yet.
    pub fn snapshot() -> Arc<GlobalConfig> {
        GLOBAL
            .get_or_init(|| Arc::new(GlobalConfig::default()))
            .clone()
    }
}
