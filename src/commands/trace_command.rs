//! The outer controller: gets a root tracee stopped, then serves wait
//! events to the dispatch engine until the last task is gone.

use crate::commands::options::{Options, SubCommand};
use crate::commands::Command;
use crate::dispatch::Tracer;
use crate::error::TraceResult;
use crate::log::LogLevel::*;
use crate::ptracer::{Ptracer, TraceeIo};
use crate::sink::JsonSink;
use libc::pid_t;
use nix::sys::wait::WaitStatus;
use std::env;
use std::fs;
use std::io;
use std::path::PathBuf;

pub struct TraceCommand {
    output: PathBuf,
    pid: Option<pid_t>,
    command: Vec<String>,
}

impl TraceCommand {
    pub fn new(options: &Options) -> TraceCommand {
        match options.cmd.clone() {
            SubCommand::Trace {
                output,
                pid,
                command,
            } => TraceCommand {
                output,
                pid,
                command,
            },
        }
    }

    /// Produce a stopped root tracee and the working directory to credit it
    /// with, either by spawning the command or by attaching to a live pid.
    fn acquire_root(&self, io: &Ptracer) -> TraceResult<(pid_t, PathBuf)> {
        match self.pid {
            Some(pid) => {
                io.attach(pid)?;
                let wd = fs::read_link(format!("/proc/{}/cwd", pid))
                    .unwrap_or_else(|_| PathBuf::from("/"));
                io.wait_next()?;
                Ok((pid, wd))
            }
            None => {
                let pid = io.spawn_traced(&self.command)?;
                let wd = env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
                // The child stops with SIGTRAP when its execve lands.
                io.wait_next()?;
                Ok((pid, wd))
            }
        }
    }

    fn trace(&self) -> TraceResult<()> {
        let io = Ptracer::new();
        let sink = JsonSink::create(&self.output).map_err(crate::error::TraceError::Sink)?;
        let (root, wd) = self.acquire_root(&io)?;
        io.set_tracing_options(root)?;

        let mut tracer = Tracer::new(io, sink);
        tracer.attach_root(root, wd)?;
        tracer.resume_quiet(root, None);

        loop {
            let status = match tracer.io.wait_next() {
                Ok(status) => status,
                Err(e) => {
                    // ECHILD: everything we were following is gone.
                    log!(LogDebug, "wait loop finished: {}", e);
                    break;
                }
            };
            match status {
                WaitStatus::PtraceSyscall(pid) => {
                    let tid = pid.as_raw();
                    if tracer.task_known(tid) {
                        tracer.handle_syscall_stop(tid)?;
                    } else {
                        tracer.register_orphan(tid);
                    }
                }
                WaitStatus::Stopped(pid, sig) => {
                    tracer.handle_signal_stop(pid.as_raw(), sig)?;
                }
                WaitStatus::PtraceEvent(pid, _, _) => {
                    // Fork-family event stops on the parent; the syscall
                    // exit we actually act on follows separately.
                    tracer.resume_quiet(pid.as_raw(), None);
                }
                WaitStatus::Exited(pid, status) => {
                    tracer.handle_task_exit(pid.as_raw(), status)?;
                }
                WaitStatus::Signaled(pid, sig, _) => {
                    tracer.handle_task_exit(pid.as_raw(), 128 + sig as i32)?;
                }
                WaitStatus::Continued(_) | WaitStatus::StillAlive => {}
            }
            if tracer.live_tasks() == 0 {
                break;
            }
        }
        tracer
            .sink_mut()
            .flush()
            .map_err(crate::error::TraceError::Sink)?;
        Ok(())
    }
}

impl Command for TraceCommand {
    fn run(&mut self) -> io::Result<()> {
        if self.pid.is_none() && self.command.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "nothing to trace: give a command or --pid",
            ));
        }
        self.trace()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }
}
