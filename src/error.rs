use libc::pid_t;
use std::error::Error;
use std::fmt;
use std::io;

/// A read from a tracee's address space failed. Handlers swallow this,
/// log a warning carrying the tid, and emit no event for the partial data.
#[derive(Debug)]
pub struct TraceeMemoryError {
    pub tid: pid_t,
    pub addr: u64,
    pub what: &'static str,
}

impl fmt::Display for TraceeMemoryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "tid {}: {} at {:#x} in tracee memory",
            self.tid, self.what, self.addr
        )
    }
}

impl Error for TraceeMemoryError {}

/// The event sink could not persist a record. Fatal for the trace.
#[derive(Debug)]
pub struct SinkError(pub io::Error);

impl From<io::Error> for SinkError {
    fn from(e: io::Error) -> SinkError {
        SinkError(e)
    }
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "event sink failure: {}", self.0)
    }
}

impl Error for SinkError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.0)
    }
}

#[derive(Debug)]
pub enum TraceError {
    Sink(SinkError),
    /// Registry inconsistency; the trace is unsafe to continue.
    Invariant(String),
    Ptrace {
        tid: pid_t,
        op: &'static str,
        source: nix::Error,
    },
    Spawn {
        program: String,
        source: io::Error,
    },
}

impl fmt::Display for TraceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TraceError::Sink(e) => e.fmt(f),
            TraceError::Invariant(msg) => write!(f, "tracer invariant violated: {}", msg),
            TraceError::Ptrace { tid, op, source } => {
                write!(f, "tid {}: {} failed: {}", tid, op, source)
            }
            TraceError::Spawn { program, source } => {
                write!(f, "could not spawn {}: {}", program, source)
            }
        }
    }
}

impl Error for TraceError {}

impl From<SinkError> for TraceError {
    fn from(e: SinkError) -> TraceError {
        TraceError::Sink(e)
    }
}

pub type TraceResult<T> = Result<T, TraceError>;
