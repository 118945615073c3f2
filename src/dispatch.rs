//! The dispatch engine: serves one stop event at a time, keeps each task's
//! entry/exit phase straight, routes to the handler tables, and papers over
//! the two ways execve breaks the obvious model (thread identity absorption
//! and ABI switches mid-call).

use crate::error::{TraceError, TraceResult};
use crate::kernel_abi::{self, Abi, MAX_SYSCALL, X32_SYSCALL_BIT};
use crate::log::LogLevel::*;
use crate::process::{Process, ProcessRegistry, ProcessStatus};
use crate::ptracer::TraceeIo;
use crate::sink::{EventSink, LogChannel, ProcessId};
use crate::syscall_table::{ExitAction, SyscallTables};
use libc::pid_t;
use nix::sys::signal::Signal;
use std::path::PathBuf;

pub struct Tracer<IO: TraceeIo, S: EventSink> {
    pub(crate) io: IO,
    pub(crate) sink: S,
    pub(crate) procs: ProcessRegistry,
    pub(crate) tables: SyscallTables,
}

impl<IO: TraceeIo, S: EventSink> Tracer<IO, S> {
    pub fn new(io: IO, sink: S) -> Tracer<IO, S> {
        Tracer {
            io,
            sink,
            procs: ProcessRegistry::new(),
            tables: SyscallTables::build(),
        }
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn live_tasks(&self) -> usize {
        self.procs.len()
    }

    pub fn task_known(&self, tid: pid_t) -> bool {
        self.procs.contains(tid)
    }

    /// Adopt the root target, already stopped, and record it with the sink.
    pub fn attach_root(&mut self, tid: pid_t, wd: PathBuf) -> TraceResult<ProcessId> {
        let id = self.sink.add_process(None, &wd)?;
        let mut p = Process::new(tid, ProcessStatus::Attached);
        p.identifier = Some(id);
        p.wd = wd;
        self.procs.insert(p);
        log!(LogInfo, "tracing root tid {} as process {}", tid, id);
        Ok(id)
    }

    /// A stop arrived for a tid we have never seen: a fork/clone child
    /// delivered before its creator's syscall exit. Park it, suspended,
    /// until the forking handler adopts it.
    pub fn register_orphan(&mut self, tid: pid_t) {
        log!(LogDebug, "tid {} stopped before its creator returned", tid);
        self.procs.insert(Process::new(tid, ProcessStatus::Unknown));
    }

    /// A signal stop. First stops of expected children complete the
    /// ALLOCATED -> ATTACHED transition; anything else is resumed with the
    /// signal re-injected, except the stops ptrace itself manufactures.
    pub fn handle_signal_stop(&mut self, tid: pid_t, sig: Signal) -> TraceResult<()> {
        match self.procs.get_mut(tid) {
            None => {
                self.register_orphan(tid);
                Ok(())
            }
            Some(p) if p.status == ProcessStatus::Allocated => {
                p.status = ProcessStatus::Attached;
                self.resume_quiet(tid, None);
                Ok(())
            }
            Some(_) => {
                let inject = match sig {
                    Signal::SIGTRAP | Signal::SIGSTOP => None,
                    other => Some(other),
                };
                self.resume_quiet(tid, inject);
                Ok(())
            }
        }
    }

    /// A task died. Drop its record and persist the status.
    pub fn handle_task_exit(&mut self, tid: pid_t, status: i32) -> TraceResult<()> {
        if let Some(p) = self.procs.remove(tid) {
            if let Some(id) = p.identifier {
                self.sink.add_exit(id, status)?;
            }
            log!(LogDebug, "tid {} exited with status {}", tid, status);
        }
        Ok(())
    }

    /// One syscall-boundary stop. This is the whole engine: capture
    /// registers, pick the side and the table, run the handler, toggle the
    /// phase, resume.
    pub fn handle_syscall_stop(&mut self, tid: pid_t) -> TraceResult<()> {
        let regs = self.io.get_registers(tid)?;
        let (entering, tgid, abi) = {
            let p = self.procs.get_mut(tid).ok_or_else(|| {
                TraceError::Invariant(format!("syscall stop for untracked tid {}", tid))
            })?;
            p.abi = regs.abi();
            let entering = !p.in_syscall;
            // The number is refreshed on both sides: after an ABI-switching
            // execve the exit reports under the new numbering, and that is
            // exactly what the override below needs to see.
            p.current_syscall = regs.syscallno();
            if entering {
                p.params = regs.args();
            } else {
                p.retvalue = regs.syscall_result();
            }
            (entering, p.tgid, p.abi)
        };

        let raw = regs.syscallno();
        let (nr, x32_bit) = if abi == Abi::X8664 && raw >= 0 && (raw as u64 & X32_SYSCALL_BIT) != 0
        {
            (raw & !(X32_SYSCALL_BIT as i64), true)
        } else {
            (raw, false)
        };

        // execve workaround: a successful exec by a non-leader thread
        // reports its exit on the leader's tid, and an ABI switch reports it
        // under the new numbering. Either way the entry was recorded
        // elsewhere; route by the captured scratch, not the table.
        if kernel_abi::is_execve_number(nr) && !self.procs.exec_scratch_holders(tgid).is_empty() {
            if entering {
                // This task is not mid-call from our point of view, so this
                // stop can only be an exec exit absorbed from a sibling; an
                // absorbed exit implies success. Anything else means two
                // execves were in flight in one thread group.
                if regs.syscall_result() < 0 {
                    return Err(self.invariant_failure(
                        tid,
                        format!("concurrent execve in thread group {}", tgid),
                    ));
                }
                if let Some(p) = self.procs.get_mut(tid) {
                    p.retvalue = regs.syscall_result();
                }
            }
            self.run_exit("execve", tid, ExitAction::Execve, 0)?;
            if let Some(p) = self.procs.get_mut(tid) {
                p.in_syscall = false;
                p.current_syscall = -1;
                p.scratch = None;
            }
            self.resume_quiet(tid, None);
            return Ok(());
        }

        log!(
            LogDebug,
            "tid {}: {} syscall {} ({})",
            tid,
            if entering { "entering" } else { "exiting" },
            nr,
            abi.name()
        );
        if nr < 0 || nr >= MAX_SYSCALL {
            log!(LogWarn, "tid {}: ignoring nonsense syscall number {}", tid, raw);
            self.sink
                .log(LogChannel::Warn, tid, &format!("unknown syscall number {}", raw))?;
        } else {
            let slot = self
                .tables
                .for_abi(abi, x32_bit)
                .get(nr)
                .map(|s| *s);
            if let Some(slot) = slot {
                if entering {
                    if let Some(action) = slot.entry {
                        self.run_entry(slot.name, tid, action, slot.udata)?;
                    }
                } else if let Some(action) = slot.exit {
                    self.run_exit(slot.name, tid, action, slot.udata)?;
                }
            }
        }

        let p = self.procs.get_mut(tid).ok_or_else(|| {
            TraceError::Invariant(format!("tid {} vanished during dispatch", tid))
        })?;
        p.in_syscall = entering;
        if !p.in_syscall {
            p.current_syscall = -1;
            p.scratch = None;
        }
        self.resume_quiet(tid, None);
        Ok(())
    }

    /// Resume a tracee; failure here usually means the task died under us,
    /// which the wait loop will report, so it is not fatal.
    pub(crate) fn resume_quiet(&self, tid: pid_t, sig: Option<Signal>) {
        if let Err(e) = self.io.resume(tid, sig) {
            log!(LogWarn, "could not resume tid {}: {}", tid, e);
        }
    }

    /// A registry inconsistency: persist it on the sink's critical channel
    /// and hand back the error that aborts the trace. A sink failure at this
    /// point changes nothing about the outcome, so it is not propagated.
    pub(crate) fn invariant_failure(&mut self, tid: pid_t, message: String) -> TraceError {
        log!(LogFatal, "tid {}: {}", tid, message);
        let _ = self.sink.log(LogChannel::Critical, tid, &message);
        TraceError::Invariant(message)
    }
}
