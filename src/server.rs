//! The server role (§4.F): command registry, the main dispatch loop, the
//! mandatory built-in verbs, and the inquiry sub-protocol.

use std::sync::Arc;

use crate::buffer::ReadOutcome;
use crate::context::{Context, Role};
use crate::engine::{parse_command_line, parse_reply_line};
use crate::error::{Error, ErrorCode, Result};
use crate::message::Message;

/// A registered command handler. Takes a restricted [`HandlerHandle`]
/// (never the whole [`Context`], per design note 9) and the raw argument
/// string; `Ok(())` becomes a terminal `OK`, `Err` becomes a terminal
/// `ERR CODE DESC`.
pub type HandlerFn = dyn Fn(&mut HandlerHandle<'_>, &str) -> Result<()> + Send + Sync;

/// `OPTION key=value` forwarding hook (§4.F, Supplemented feature C.1).
pub type OptionHookFn = dyn Fn(&mut HandlerHandle<'_>, &str, &str) -> Result<()> + Send + Sync;

struct CommandEntry {
    verb: String,
    handler: Arc<HandlerFn>,
    help: Option<String>,
}

/// The per-server-context command table (§3 "Command table entry"):
/// append-only until the owning context is released, verb lookup is
/// ASCII case-insensitive and exact-length.
#[derive(Default)]
pub struct CommandTable {
    entries: Vec<CommandEntry>,
    option_hook: Option<Arc<OptionHookFn>>,
}

impl CommandTable {
    pub fn new() -> Self {
        CommandTable {
            entries: Vec::new(),
            option_hook: None,
        }
    }

    /// Register or replace a verb's handler. Overrides a built-in of the
    /// same name (§4.F: "Built-in verbs always present, overrideable only
    /// by explicit registration").
    pub fn register(
        &mut self,
        verb: &str,
        handler: impl Fn(&mut HandlerHandle<'_>, &str) -> Result<()> + Send + Sync + 'static,
        help: Option<&str>,
    ) -> Result<()> {
        if verb.is_empty() {
            return Err(Error::new(ErrorCode::Parameter));
        }
        let entry = CommandEntry {
            verb: verb.to_string(),
            handler: Arc::new(handler),
            help: help.map(|h| h.to_string()),
        };
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|e| e.verb.eq_ignore_ascii_case(verb))
        {
            *existing = entry;
        } else {
            self.entries.push(entry);
        }
        Ok(())
    }

    pub fn set_option_hook(
        &mut self,
        hook: impl Fn(&mut HandlerHandle<'_>, &str, &str) -> Result<()> + Send + Sync + 'static,
    ) {
        self.option_hook = Some(Arc::new(hook));
    }

    fn lookup(&self, verb: &str) -> Option<Arc<HandlerFn>> {
        self.entries
            .iter()
            .find(|e| e.verb.eq_ignore_ascii_case(verb))
            .map(|e| e.handler.clone())
    }

    fn help_lines(&self, verb: Option<&str>) -> Vec<String> {
        const BUILTINS: &[(&str, &str)] = &[
            ("NOP", "Does nothing"),
            ("CANCEL", "Cancel the current operation"),
            ("BYE", "Close the connection"),
            ("AUTH", "Not implemented by the core"),
            ("RESET", "Reset the connection to its initial state"),
            ("END", "Conclude a server inquiry"),
            ("HELP", "List commands, or describe one"),
            ("OPTION", "Set an option (key=value)"),
        ];
        match verb {
            Some(v) => {
                if let Some(entry) = self.entries.iter().find(|e| e.verb.eq_ignore_ascii_case(v)) {
                    vec![format!(
                        "{} {}",
                        entry.verb,
                        entry.help.as_deref().unwrap_or("")
                    )]
                } else if let Some((name, help)) =
                    BUILTINS.iter().find(|(n, _)| n.eq_ignore_ascii_case(v))
                {
                    vec![format!("{name} {help}")]
                } else {
                    vec![]
                }
            }
            None => {
                let mut lines: Vec<String> = BUILTINS
                    .iter()
                    .filter(|(name, _)| self.lookup(name).is_none())
                    .map(|(name, help)| format!("{name} {help}"))
                    .collect();
                for entry in &self.entries {
                    lines.push(format!("{} {}", entry.verb, entry.help.as_deref().unwrap_or("")));
                }
                lines
            }
        }
    }
}

/// A restricted view of a [`Context`] handed to command handlers, so a
/// handler can't hold a long-lived borrow of context internals (design
/// note 9). Exposes exactly `write_data`, `write_status`, `inquire`, and
/// `is_canceled`.
pub struct HandlerHandle<'a> {
    ctx: &'a mut Context,
}

impl<'a> HandlerHandle<'a> {
    fn check_cancel(&self) -> Result<()> {
        if self.ctx.flags.pending_cancel {
            return Err(Error::new(ErrorCode::Canceled));
        }
        Ok(())
    }

    pub fn is_canceled(&self) -> bool {
        self.ctx.flags.pending_cancel
    }

    /// Write an inline data payload as one or more `D` lines (§4.C).
    pub fn write_data(&mut self, bytes: &[u8]) -> Result<()> {
        self.check_cancel()?;
        for line in crate::message::encode_data_lines(bytes) {
            self.ctx.buffer.queue_line(&line)?;
        }
        self.ctx.buffer.flush().map_err(|e| {
            self.ctx.mark_broken();
            e
        })
    }

    /// Attach a file descriptor to the next `write_data`/`write_status`
    /// flush (§4.C, §6 `send_fd`). A programmer error to call this on a
    /// pipe-transport context; the fd is simply dropped at flush since a
    /// plain pipe `write` has no ancillary-data channel.
    pub fn send_fd(&mut self, fd: i32) {
        self.ctx.send_fd(fd);
    }

    /// Write a status line (§3 `Status`).
    pub fn write_status(&mut self, keyword: &str, args: &str) -> Result<()> {
        self.check_cancel()?;
        let msg = Message::Status {
            keyword: keyword.to_string(),
            args: args.to_string(),
        };
        for line in msg.to_lines() {
            self.ctx.buffer.queue_line(&line)?;
        }
        self.ctx.buffer.flush().map_err(|e| {
            self.ctx.mark_broken();
            e
        })
    }

    /// Ask the client for inline data (§4.F "Inquiry from within a
    /// handler"). Refuses nesting with `NESTED_COMMANDS` (§3 invariant 4).
    pub fn inquire(&mut self, keyword: &str, args: &str) -> Result<Vec<u8>> {
        self.check_cancel()?;
        if self.ctx.inquiry_depth >= 1 {
            return Err(Error::new(ErrorCode::NestedCommands));
        }
        self.ctx.inquiry_depth += 1;
        let result = self.run_inquiry(keyword, args);
        self.ctx.inquiry_depth -= 1;
        result
    }

    fn run_inquiry(&mut self, keyword: &str, args: &str) -> Result<Vec<u8>> {
        let msg = Message::Inquire {
            keyword: keyword.to_string(),
            args: args.to_string(),
        };
        for line in msg.to_lines() {
            self.ctx.buffer.queue_line(&line)?;
        }
        self.ctx.buffer.flush().map_err(|e| {
            self.ctx.mark_broken();
            e
        })?;

        let mut payload = Vec::new();
        loop {
            let outcome = self.ctx.buffer.read_line().map_err(|e| {
                self.ctx.mark_broken();
                e
            })?;
            let line = match outcome {
                ReadOutcome::Line(l) => l,
                ReadOutcome::Eof => {
                    self.ctx.mark_broken();
                    return Err(Error::new(ErrorCode::Eof));
                }
            };
            // BYE during an inquiry isn't part of the formal reply-stream
            // grammar (§4.E) but §4.F calls it out explicitly: the handler
            // is canceled and the connection closes without a reply line,
            // unlike a top-level BYE which still gets its terminal OK.
            if line.eq_ignore_ascii_case(b"BYE") {
                self.ctx.flags.suppress_terminal_reply = true;
                self.ctx.mark_terminated();
                return Err(Error::new(ErrorCode::Canceled));
            }
            match parse_reply_line(&line)? {
                Message::Data(bytes) => payload.extend(bytes),
                Message::End => return Ok(payload),
                Message::Cancel => return Err(Error::new(ErrorCode::Canceled)),
                Message::Err { code, .. } => return Err(Error::new(code)),
                _ => return Err(Error::new(ErrorCode::InvalidResponse)),
            }
        }
    }
}

/// Run the server dispatch loop (§4.F "Main loop") until `BYE` or a fatal
/// transport error. Returns `Ok(())` on a graceful close (`BYE` or clean
/// peer EOF between commands).
pub fn process(ctx: &mut Context) -> Result<()> {
    debug_assert_eq!(ctx.role(), Role::Server);
    loop {
        ctx.check_broken()?;
        if ctx.is_terminated() {
            return Ok(());
        }
        let line = match ctx.buffer.read_line() {
            Ok(ReadOutcome::Line(l)) => l,
            Ok(ReadOutcome::Eof) => {
                ctx.mark_terminated();
                return Ok(());
            }
            Err(e) => {
                ctx.mark_broken();
                return Err(e);
            }
        };
        if line.starts_with(b"#") || line.is_empty() {
            continue;
        }
        dispatch_one(ctx, &line)?;
        if ctx.is_terminated() {
            return Ok(());
        }
    }
}

fn dispatch_one(ctx: &mut Context, line: &[u8]) -> Result<()> {
    let (verb, args) = parse_command_line(line);
    let registered = ctx
        .commands
        .as_ref()
        .expect("server context always has a command table")
        .lookup(&verb);

    let outcome = if let Some(handler) = registered {
        run_handler(ctx, &args, &*handler)
    } else {
        run_builtin(ctx, &verb, &args)
    };

    if ctx.flags.suppress_terminal_reply {
        // A BYE observed mid-inquiry: the connection closes without a
        // reply line. A top-level BYE falls through and still gets OK.
        return Ok(());
    }

    let reply = match outcome {
        Ok(()) => Message::Ok { info: None },
        Err(e) => Message::Err {
            code: e.code(),
            description: Some(e.description()),
        },
    };
    for l in reply.to_lines() {
        ctx.buffer.queue_line(&l)?;
    }
    ctx.buffer.flush().map_err(|e| {
        ctx.mark_broken();
        e
    })?;
    ctx.flags.pending_cancel = false;
    Ok(())
}

fn run_handler(ctx: &mut Context, args: &str, handler: &HandlerFn) -> Result<()> {
    let mut handle = HandlerHandle { ctx };
    handler(&mut handle, args)
}

fn run_builtin(ctx: &mut Context, verb: &str, args: &str) -> Result<()> {
    match verb.to_ascii_uppercase().as_str() {
        "NOP" => Ok(()),
        "CANCEL" => {
            ctx.flags.pending_cancel = true;
            Ok(())
        }
        "BYE" => {
            ctx.mark_terminated();
            Ok(())
        }
        "AUTH" => Err(Error::new(ErrorCode::NotImplemented)),
        "RESET" => {
            ctx.flags = crate::context::Flags::default();
            Ok(())
        }
        "END" => {
            // Only meaningful from within an active inquiry; at the
            // top level there's nothing to conclude.
            if ctx.inquiry_depth == 0 {
                Err(Error::new(ErrorCode::InvalidValue))
            } else {
                Ok(())
            }
        }
        "HELP" => {
            // §Supplemented-feature C.1: "# text" comment lines, then OK.
            let table = ctx.commands.as_ref().expect("server command table");
            let verb_arg = if args.is_empty() { None } else { Some(args) };
            let lines = table.help_lines(verb_arg);
            for l in lines {
                ctx.buffer.queue_line(format!("# {l}").as_bytes())?;
            }
            ctx.buffer.flush().map_err(|e| {
                ctx.mark_broken();
                e
            })?;
            Ok(())
        }
        "OPTION" => {
            let (key, value) = split_option(args);
            let hook = ctx
                .commands
                .as_ref()
                .expect("server command table")
                .option_hook
                .clone();
            match hook {
                Some(hook) => {
                    let mut handle = HandlerHandle { ctx };
                    hook(&mut handle, key, value)
                }
                None => Ok(()),
            }
        }
        _ => Err(Error::new(ErrorCode::UnknownCommand)),
    }
}

/// Split `key=value`, trimming around the first `=` (Supplemented feature
/// C.1).
fn split_option(args: &str) -> (&str, &str) {
    match args.split_once('=') {
        Some((k, v)) => (k.trim(), v.trim()),
        None => (args.trim(), ""),
    }
}
