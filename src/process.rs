//! The process registry: every task the tracer currently follows, keyed by
//! tid. Single-threaded dispatch means plain mutable access is enough.

use crate::error::{TraceError, TraceResult};
use crate::kernel_abi::{self, Abi};
use crate::sink::ProcessId;
use libc::pid_t;
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProcessStatus {
    /// Seen stopping before its creator's fork/clone returned; left
    /// suspended until then.
    Unknown,
    /// The creator returned first; the task has not stopped yet.
    Allocated,
    /// Fully adopted: identity assigned, running between stops.
    Attached,
}

/// Execve arguments captured at entry; the address space that held them is
/// gone by exit time.
#[derive(Clone, Debug)]
pub struct ExecveScratch {
    pub binary: PathBuf,
    pub argv: Vec<OsString>,
    pub envp: Vec<OsString>,
}

#[derive(Clone, Debug)]
pub struct Process {
    pub tid: pid_t,
    /// Thread-group leader's tid; immutable once assigned.
    pub tgid: pid_t,
    /// Sink-assigned handle; present from the moment a task can emit events.
    pub identifier: Option<ProcessId>,
    pub status: ProcessStatus,
    pub abi: Abi,
    /// Working directory as last observed; always absolute while attached.
    pub wd: PathBuf,
    /// Which side of a syscall the next stop is: false means the next stop
    /// enters a call.
    pub in_syscall: bool,
    /// Raw number captured at the most recent stop; -1 outside a call.
    pub current_syscall: i64,
    /// Argument registers captured at entry.
    pub params: [u64; 6],
    /// Result register captured at exit; negative is a kernel-level failure.
    pub retvalue: i64,
    pub scratch: Option<ExecveScratch>,
}

impl Process {
    pub fn new(tid: pid_t, status: ProcessStatus) -> Process {
        Process {
            tid,
            tgid: tid,
            identifier: None,
            status,
            abi: Abi::X8664,
            wd: PathBuf::new(),
            in_syscall: false,
            current_syscall: -1,
            params: [0; 6],
            retvalue: 0,
            scratch: None,
        }
    }

    pub fn require_identifier(&self) -> TraceResult<ProcessId> {
        self.identifier.ok_or_else(|| {
            TraceError::Invariant(format!("tid {} has no sink identifier", self.tid))
        })
    }

    /// Whether this task is mid-execve with captured arguments, in the sense
    /// the originator search needs.
    pub fn holds_exec_scratch(&self) -> bool {
        self.status == ProcessStatus::Attached
            && self.in_syscall
            && kernel_abi::is_execve_number(strip_x32(self.current_syscall))
            && self.scratch.is_some()
    }
}

fn strip_x32(nr: i64) -> i64 {
    if nr >= 0 {
        nr & !(kernel_abi::X32_SYSCALL_BIT as i64)
    } else {
        nr
    }
}

/// Interpret a captured argument register as a signed value at the task's
/// register width; a 32-bit -100 must not surface as 4294967196.
pub fn signed_arg(abi: Abi, raw: u64) -> i64 {
    match abi {
        Abi::I386 => raw as u32 as i32 as i64,
        Abi::X8664 => raw as i64,
    }
}

pub struct ProcessRegistry {
    procs: HashMap<pid_t, Process>,
}

impl ProcessRegistry {
    pub fn new() -> ProcessRegistry {
        ProcessRegistry {
            procs: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn contains(&self, tid: pid_t) -> bool {
        self.procs.contains_key(&tid)
    }

    pub fn get(&self, tid: pid_t) -> Option<&Process> {
        self.procs.get(&tid)
    }

    pub fn get_mut(&mut self, tid: pid_t) -> Option<&mut Process> {
        self.procs.get_mut(&tid)
    }

    pub fn insert(&mut self, process: Process) {
        debug_assert!(!self.procs.contains_key(&process.tid));
        self.procs.insert(process.tid, process);
    }

    pub fn remove(&mut self, tid: pid_t) -> Option<Process> {
        self.procs.remove(&tid)
    }

    /// Tids of tasks in `tgid` that are mid-execve with captured arguments.
    /// The concurrency model allows at most one; callers treat more as a
    /// violated invariant.
    pub fn exec_scratch_holders(&self, tgid: pid_t) -> Vec<pid_t> {
        self.procs
            .values()
            .filter(|p| p.tgid == tgid && p.holds_exec_scratch())
            .map(|p| p.tid)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_args_respect_the_abi() {
        assert_eq!(signed_arg(Abi::X8664, libc::AT_FDCWD as i64 as u64), -100);
        // The same descriptor captured from a 32-bit task is zero-extended.
        assert_eq!(signed_arg(Abi::I386, 0xffff_ff9c), -100);
    }

    #[test]
    fn scratch_holder_search_is_scoped_to_the_thread_group() {
        let mut reg = ProcessRegistry::new();
        let mut a = Process::new(400, ProcessStatus::Attached);
        a.tgid = 400;
        let mut b = Process::new(401, ProcessStatus::Attached);
        b.tgid = 400;
        b.in_syscall = true;
        b.current_syscall = 59;
        b.scratch = Some(ExecveScratch {
            binary: PathBuf::from("/bin/true"),
            argv: vec![],
            envp: vec![],
        });
        let mut other = Process::new(500, ProcessStatus::Attached);
        other.tgid = 500;
        reg.insert(a);
        reg.insert(b);
        reg.insert(other);
        assert_eq!(reg.exec_scratch_holders(400), vec![401]);
        assert!(reg.exec_scratch_holders(500).is_empty());
    }

    #[test]
    fn x32_execve_counts_as_scratch_holder() {
        let mut p = Process::new(7, ProcessStatus::Attached);
        p.in_syscall = true;
        p.current_syscall = 520 | 0x4000_0000;
        p.scratch = Some(ExecveScratch {
            binary: PathBuf::from("/bin/true"),
            argv: vec![],
            envp: vec![],
        });
        assert!(p.holds_exec_scratch());
    }
}
