use std::cell::RefCell;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Mutex, OnceLock};

use crate::pjrc::teensyboot::task::{self, TaskStatus};
use crate::pjrc::teensyboot::{Error, ErrorKind};

// Log levels -------------------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Copy, Clone)]
pub enum LogLevel {
    Error = 0,
    Warning = 1,
    Info = 2,
    Debug = 3,
}

// Messages ---------------------------------------------------------------------------------------

///
/// Message passed to the process-wide sink.
///
/// Three kinds exist: log lines, progress updates for long operations and task status
/// transitions. The context is the name of the task emitting the message, if any.
///
#[derive(Debug)]
pub enum Message<'a> {
    Log {
        ctx: Option<&'a str>,
        level: LogLevel,
        err: Option<ErrorKind>,
        text: &'a str,
    },
    Progress {
        ctx: Option<&'a str>,
        action: &'a str,
        value: u64,
        max: u64,
    },
    Status {
        task: &'a str,
        status: TaskStatus,
    },
}

pub type MessageHandler = Box<dyn Fn(&Message) + Send + Sync>;

static HANDLER: Mutex<Option<MessageHandler>> = Mutex::new(None);
static VERBOSITY: AtomicI32 = AtomicI32::new(LogLevel::Info as i32);

thread_local! {
    static ERROR_MASKS: RefCell<Vec<ErrorKind>> = const { RefCell::new(Vec::new()) };
    static LAST_ERROR: RefCell<String> = const { RefCell::new(String::new()) };
}

fn debug_override() -> bool {
    static DEBUG: OnceLock<bool> = OnceLock::new();
    *DEBUG.get_or_init(|| std::env::var_os("HALFKAY_DEBUG").is_some())
}

pub fn set_verbosity(level: LogLevel) {
    VERBOSITY.store(level as i32, Ordering::Relaxed);
}

pub fn log_level_is_enabled(level: LogLevel) -> bool {
    VERBOSITY.load(Ordering::Relaxed) >= level as i32 || debug_override()
}

/// Replace the process-wide message handler. The previous handler is discarded.
pub fn redirect(handler: MessageHandler) {
    *HANDLER.lock().unwrap() = Some(handler);
}

/// Restore the default handler, which forwards log messages to the `log` facade.
pub fn redirect_to_default() {
    *HANDLER.lock().unwrap() = None;
}

fn default_handler(msg: &Message) {
    match msg {
        Message::Log { ctx, level, text, .. } => {
            if !log_level_is_enabled(*level) {
                return;
            }

            let level = match level {
                LogLevel::Error => log::Level::Error,
                LogLevel::Warning => log::Level::Warn,
                LogLevel::Info => log::Level::Info,
                LogLevel::Debug => log::Level::Debug,
            };
            match ctx {
                Some(ctx) => log::log!(target: "teensyboot", level, "{}  {}", ctx, text),
                None => log::log!(target: "teensyboot", level, "{}", text),
            }
        }
        Message::Progress { action, value, max, .. } => {
            if log_level_is_enabled(LogLevel::Info) && *max > 0 {
                log::info!(target: "teensyboot", "{}... {}%", action, 100 * value / max);
            }
        }
        Message::Status { .. } => {}
    }
}

fn emit_to_sink(msg: &Message) {
    let handler = HANDLER.lock().unwrap();
    match handler.as_ref() {
        Some(handler) => handler(msg),
        None => default_handler(msg),
    }
}

/// Dispatch a message to the sink and to the callback of the current task, if any.
pub(crate) fn emit(msg: &Message) {
    emit_to_sink(msg);
    task::dispatch_to_current(msg);
}

// Error masking ----------------------------------------------------------------------------------

///
/// Masks one error kind on the current thread while alive.
///
/// Masked errors still propagate through return values, only their automatic LOG emission
/// is suppressed. Masks stack, the guard pops its own entry on drop.
///
pub struct MaskGuard {
    _private: (),
}

impl Drop for MaskGuard {
    fn drop(&mut self) {
        ERROR_MASKS.with(|masks| {
            masks.borrow_mut().pop();
        });
    }
}

#[must_use]
pub fn mask(kind: ErrorKind) -> MaskGuard {
    ERROR_MASKS.with(|masks| masks.borrow_mut().push(kind));
    MaskGuard { _private: () }
}

pub fn error_is_masked(kind: ErrorKind) -> bool {
    ERROR_MASKS.with(|masks| masks.borrow().contains(&kind))
}

/// Most recent error message reported on this thread.
pub fn last_error_message() -> String {
    LAST_ERROR.with(|last| last.borrow().clone())
}

///
/// Record and report an error.
///
/// Stores the message as the thread-local last error and emits a LOG message at ERROR level
/// unless the error kind is currently masked. Returns the error unchanged so call sites can
/// write `return Err(report(Error::Range(...)))`.
///
pub fn report(err: Error) -> Error {
    let text = err.to_string();
    set_last_error(&text);

    if !error_is_masked(err.kind()) {
        let ctx = task::current_task_name();
        emit(&Message::Log {
            ctx: ctx.as_deref(),
            level: LogLevel::Error,
            err: Some(err.kind()),
            text: &text,
        });
    }

    err
}

fn set_last_error(text: &str) {
    LAST_ERROR.with(|last| {
        let mut last = last.borrow_mut();
        last.clear();
        last.push_str(text);
    });
}

// Convenience emitters ---------------------------------------------------------------------------

pub fn log(level: LogLevel, text: &str) {
    let ctx = task::current_task_name();
    emit(&Message::Log {
        ctx: ctx.as_deref(),
        level,
        err: None,
        text,
    });
}

pub fn progress(action: &str, value: u64, max: u64) {
    debug_assert!(value <= max);

    let ctx = task::current_task_name();
    emit(&Message::Progress {
        ctx: ctx.as_deref(),
        action,
        value,
        max,
    });
}

/// Task status transitions go to the sink only; `Task::change_status` hands them to the
/// task's own callback directly.
pub(crate) fn task_status(task: &str, status: TaskStatus) {
    emit_to_sink(&Message::Status { task, status });
}
