//! The event sink: where observed activity goes. The tracer only sees the
//! trait; the shipped implementation appends JSON records, one per line.

use crate::error::SinkError;
use bitflags::bitflags;
use libc::pid_t;
use serde::Serialize;
use std::ffi::OsString;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

bitflags! {
    /// Access classification persisted with each file event. The values are
    /// part of the stored format and must not change.
    pub struct FileMode: u32 {
        const READ = 1;
        const WRITE = 2;
        const WDIR = 4;
        const STAT = 8;
    }
}

/// Opaque handle the sink returns for each traced process; survives thread
/// grouping and exec.
pub type ProcessId = i64;

/// Severity of a persisted diagnostic record, one per log channel the store
/// consumes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LogChannel {
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

impl LogChannel {
    pub fn name(self) -> &'static str {
        match self {
            LogChannel::Debug => "debug",
            LogChannel::Info => "info",
            LogChannel::Warn => "warn",
            LogChannel::Error => "error",
            LogChannel::Critical => "critical",
        }
    }
}

pub trait EventSink {
    /// Record a new process and return its handle. `parent` is `None` only
    /// for the root target.
    fn add_process(&mut self, parent: Option<ProcessId>, wd: &Path) -> Result<ProcessId, SinkError>;

    fn add_exec(
        &mut self,
        id: ProcessId,
        binary: &Path,
        argv: &[OsString],
        envp: &[OsString],
        wd: &Path,
    ) -> Result<(), SinkError>;

    fn add_file_open(
        &mut self,
        id: ProcessId,
        path: &Path,
        mode: FileMode,
        is_directory: bool,
    ) -> Result<(), SinkError>;

    fn add_exit(&mut self, id: ProcessId, status: i32) -> Result<(), SinkError>;

    /// Invoked once per successful exec so the store can capture whatever it
    /// wants to know about the fresh binary.
    fn ingest_binary_metadata(
        &mut self,
        id: ProcessId,
        tid: pid_t,
        binary: &Path,
    ) -> Result<(), SinkError>;

    /// Persisted diagnostic channels: network endpoints, unhandled calls,
    /// unknown syscall numbers, invariant violations.
    fn log(&mut self, channel: LogChannel, tid: pid_t, message: &str) -> Result<(), SinkError>;
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Record<'a> {
    Process {
        id: ProcessId,
        parent: Option<ProcessId>,
        wd: String,
    },
    Exec {
        id: ProcessId,
        binary: String,
        argv: Vec<String>,
        envp: Vec<String>,
        wd: String,
    },
    FileOpen {
        id: ProcessId,
        path: String,
        mode: u32,
        is_directory: bool,
    },
    Exit {
        id: ProcessId,
        status: i32,
    },
    Binary {
        id: ProcessId,
        tid: pid_t,
        path: String,
    },
    Log {
        level: &'static str,
        tid: pid_t,
        message: &'a str,
    },
}

/// JSON-lines sink. Identifiers are assigned sequentially starting at 1.
pub struct JsonSink {
    out: BufWriter<File>,
    next_id: ProcessId,
}

impl JsonSink {
    pub fn create(path: &Path) -> Result<JsonSink, SinkError> {
        let file = File::create(path)?;
        Ok(JsonSink {
            out: BufWriter::new(file),
            next_id: 1,
        })
    }

    pub fn flush(&mut self) -> Result<(), SinkError> {
        self.out.flush()?;
        Ok(())
    }

    fn emit(&mut self, record: &Record) -> Result<(), SinkError> {
        serde_json::to_writer(&mut self.out, record)
            .map_err(|e| SinkError(std::io::Error::from(e)))?;
        self.out.write_all(b"\n")?;
        Ok(())
    }
}

fn lossy(s: &OsString) -> String {
    s.to_string_lossy().into_owned()
}

fn lossy_path(p: &Path) -> String {
    p.to_string_lossy().into_owned()
}

impl EventSink for JsonSink {
    fn add_process(&mut self, parent: Option<ProcessId>, wd: &Path) -> Result<ProcessId, SinkError> {
        let id = self.next_id;
        self.next_id += 1;
        self.emit(&Record::Process {
            id,
            parent,
            wd: lossy_path(wd),
        })?;
        Ok(id)
    }

    fn add_exec(
        &mut self,
        id: ProcessId,
        binary: &Path,
        argv: &[OsString],
        envp: &[OsString],
        wd: &Path,
    ) -> Result<(), SinkError> {
        self.emit(&Record::Exec {
            id,
            binary: lossy_path(binary),
            argv: argv.iter().map(lossy).collect(),
            envp: envp.iter().map(lossy).collect(),
            wd: lossy_path(wd),
        })
    }

    fn add_file_open(
        &mut self,
        id: ProcessId,
        path: &Path,
        mode: FileMode,
        is_directory: bool,
    ) -> Result<(), SinkError> {
        self.emit(&Record::FileOpen {
            id,
            path: lossy_path(path),
            mode: mode.bits(),
            is_directory,
        })
    }

    fn add_exit(&mut self, id: ProcessId, status: i32) -> Result<(), SinkError> {
        self.emit(&Record::Exit { id, status })
    }

    fn ingest_binary_metadata(
        &mut self,
        id: ProcessId,
        tid: pid_t,
        binary: &Path,
    ) -> Result<(), SinkError> {
        self.emit(&Record::Binary {
            id,
            tid,
            path: lossy_path(binary),
        })
    }

    fn log(&mut self, channel: LogChannel, tid: pid_t, message: &str) -> Result<(), SinkError> {
        self.emit(&Record::Log {
            level: channel.name(),
            tid,
            message,
        })
    }
}


#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::path::PathBuf;

    /// Everything the tracer emitted, verbatim, for assertions.
    #[derive(Clone, Debug, Eq, PartialEq)]
    pub enum Event {
        Process {
            id: ProcessId,
            parent: Option<ProcessId>,
            wd: PathBuf,
        },
        Exec {
            id: ProcessId,
            binary: PathBuf,
            argv: Vec<OsString>,
            envp: Vec<OsString>,
            wd: PathBuf,
        },
        FileOpen {
            id: ProcessId,
            path: PathBuf,
            mode: FileMode,
            is_directory: bool,
        },
        Exit {
            id: ProcessId,
            status: i32,
        },
        Binary {
            id: ProcessId,
            tid: pid_t,
            path: PathBuf,
        },
        Log {
            channel: LogChannel,
            tid: pid_t,
            message: String,
        },
    }

    pub struct RecordingSink {
        pub events: Vec<Event>,
        next_id: ProcessId,
    }

    impl RecordingSink {
        pub fn new() -> RecordingSink {
            RecordingSink {
                events: Vec::new(),
                next_id: 1,
            }
        }

        pub fn file_opens(&self) -> Vec<&Event> {
            self.events
                .iter()
                .filter(|e| matches!(e, Event::FileOpen { .. }))
                .collect()
        }

        pub fn warnings(&self) -> Vec<&str> {
            self.logged(LogChannel::Warn)
        }

        pub fn criticals(&self) -> Vec<&str> {
            self.logged(LogChannel::Critical)
        }

        fn logged(&self, wanted: LogChannel) -> Vec<&str> {
            self.events
                .iter()
                .filter_map(|e| match e {
                    Event::Log {
                        channel, message, ..
                    } if *channel == wanted => Some(message.as_str()),
                    _ => None,
                })
                .collect()
        }
    }

    impl EventSink for RecordingSink {
        fn add_process(
            &mut self,
            parent: Option<ProcessId>,
            wd: &Path,
        ) -> Result<ProcessId, SinkError> {
            let id = self.next_id;
            self.next_id += 1;
            self.events.push(Event::Process {
                id,
                parent,
                wd: wd.to_path_buf(),
            });
            Ok(id)
        }

        fn add_exec(
            &mut self,
            id: ProcessId,
            binary: &Path,
            argv: &[OsString],
            envp: &[OsString],
            wd: &Path,
        ) -> Result<(), SinkError> {
            self.events.push(Event::Exec {
                id,
                binary: binary.to_path_buf(),
                argv: argv.to_vec(),
                envp: envp.to_vec(),
                wd: wd.to_path_buf(),
            });
            Ok(())
        }

        fn add_file_open(
            &mut self,
            id: ProcessId,
            path: &Path,
            mode: FileMode,
            is_directory: bool,
        ) -> Result<(), SinkError> {
            self.events.push(Event::FileOpen {
                id,
                path: path.to_path_buf(),
                mode,
                is_directory,
            });
            Ok(())
        }

        fn add_exit(&mut self, id: ProcessId, status: i32) -> Result<(), SinkError> {
            self.events.push(Event::Exit { id, status });
            Ok(())
        }

        fn ingest_binary_metadata(
            &mut self,
            id: ProcessId,
            tid: pid_t,
            binary: &Path,
        ) -> Result<(), SinkError> {
            self.events.push(Event::Binary {
                id,
                tid,
                path: binary.to_path_buf(),
            });
            Ok(())
        }

        fn log(&mut self, channel: LogChannel, tid: pid_t, message: &str) -> Result<(), SinkError> {
            self.events.push(Event::Log {
                channel,
                tid,
                message: message.to_string(),
            });
            Ok(())
        }
    }
}
