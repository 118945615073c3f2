use crate::log::LogLevel;
use lazy_static::lazy_static;
use std::env;

lazy_static! {
    static ref FLAGS: Flags = Flags::from_env();
}

/// Tracer-wide toggles, read once from the environment at first use and
/// immutable afterwards.
#[derive(Clone)]
pub struct Flags {
    /// Verbosity of the stderr diagnostics (`REPROTRACE_LOG`).
    pub log_level: LogLevel,
    /// Whether syscalls we observe but do not interpret are persisted as
    /// warnings in the trace, in addition to being logged
    /// (`REPROTRACE_WARN_UNHANDLED`, on by default).
    pub warn_unhandled: bool,
}

impl Flags {
    pub fn get() -> &'static Flags {
        &*FLAGS
    }

    fn from_env() -> Flags {
        let log_level = env::var("REPROTRACE_LOG")
            .map(|v| LogLevel::from_str_lossy(&v))
            .unwrap_or(LogLevel::LogWarn);
        let warn_unhandled = env::var("REPROTRACE_WARN_UNHANDLED")
            .map(|v| v != "0")
            .unwrap_or(true);
        Flags {
            log_level,
            warn_unhandled,
        }
    }
}
