//! Handler families behind the syscall tables. Each runs with exactly one
//! task borrowed for the duration of a stop; tracee-memory failures are
//! warned and swallowed, sink failures abort the trace.

use crate::dispatch::Tracer;
use crate::error::{TraceError, TraceResult, TraceeMemoryError};
use crate::flags::Flags;
use crate::kernel_abi::{Abi, SOCKETCALL_ACCEPT, SOCKETCALL_CONNECT, X32_SYSCALL_BIT};
use crate::log::LogLevel::*;
use crate::paths;
use crate::process::{ExecveScratch, Process, ProcessStatus};
use crate::ptracer::TraceeIo;
use crate::remote_ptr::RemotePtr;
use crate::sink::{EventSink, FileMode, LogChannel, ProcessId};
use crate::syscall_table::{
    EntryAction, ExitAction, SyscallSlot, FORK_CLONE, OPEN_FORCED_WRITE, SYMLINK_AT,
};
use crate::tracee_mem::TraceeMem;
use libc::pid_t;
use std::fs;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

/// A copy of the fields a handler needs from its task, taken once per stop
/// so the registry stays free for the cross-task lookups some handlers do.
struct TaskCtx {
    tid: pid_t,
    tgid: pid_t,
    abi: Abi,
    wd: PathBuf,
    params: [u64; 6],
    current_syscall: i64,
    retvalue: i64,
    identifier: Option<ProcessId>,
}

impl TaskCtx {
    fn arg_ptr(&self, i: usize) -> RemotePtr {
        RemotePtr::new(self.params[i])
    }

    fn arg_signed(&self, i: usize) -> i64 {
        crate::process::signed_arg(self.abi, self.params[i])
    }

    fn require_id(&self) -> TraceResult<ProcessId> {
        self.identifier.ok_or_else(|| {
            TraceError::Invariant(format!("tid {} has no sink identifier", self.tid))
        })
    }
}

fn flags_to_mode(tid: pid_t, flags: u64) -> FileMode {
    match flags as i32 & libc::O_ACCMODE {
        libc::O_RDONLY => FileMode::READ,
        libc::O_WRONLY => FileMode::WRITE,
        libc::O_RDWR => FileMode::READ | FileMode::WRITE,
        _ => {
            log!(LogWarn, "tid {}: unknown open mode {:#x}", tid, flags);
            FileMode::empty()
        }
    }
}

/// Directory hint for emitted events; a path we cannot stat is reported as
/// a plain file.
fn path_is_dir(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.file_type().is_dir())
        .unwrap_or(false)
}

pub(crate) fn format_sockaddr(buf: &[u8]) -> String {
    let family = u16::from_ne_bytes([buf[0], buf[1]]);
    if family == libc::AF_INET as u16 && buf.len() >= 8 {
        let port = u16::from_be_bytes([buf[2], buf[3]]);
        let ip = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
        format!("{}:{}", ip, port)
    } else if family == libc::AF_INET6 as u16 && buf.len() >= 24 {
        let port = u16::from_be_bytes([buf[2], buf[3]]);
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&buf[8..24]);
        format!("[{}]:{}", Ipv6Addr::from(octets), port)
    } else {
        format!("unknown, family={}", family)
    }
}

impl<IO: TraceeIo, S: EventSink> Tracer<IO, S> {
    pub(crate) fn run_entry(
        &mut self,
        _name: &'static str,
        tid: pid_t,
        action: EntryAction,
        _udata: u32,
    ) -> TraceResult<()> {
        match action {
            EntryAction::Execve => self.syscall_execve_entry(tid),
        }
    }

    pub(crate) fn run_exit(
        &mut self,
        name: &'static str,
        tid: pid_t,
        action: ExitAction,
        udata: u32,
    ) -> TraceResult<()> {
        match action {
            ExitAction::FileOpen => self.syscall_fileopening_exit(tid, udata),
            ExitAction::FileStat => self.syscall_filestat_exit(tid),
            ExitAction::Readlink => self.syscall_readlink_exit(tid),
            ExitAction::Mkdir => self.syscall_mkdir_exit(tid),
            ExitAction::Symlink => self.syscall_symlink_exit(name, tid, udata),
            ExitAction::Chdir => self.syscall_chdir_exit(tid),
            ExitAction::Execve => self.syscall_execve_exit(tid),
            ExitAction::Forking => self.syscall_forking_exit(tid, udata),
            ExitAction::Socketcall => self.syscall_socketcall_exit(tid),
            ExitAction::Accept => self.syscall_accept_exit(tid),
            ExitAction::Connect => self.syscall_connect_exit(tid),
            ExitAction::AtAdapter => self.syscall_at_adapter_exit(name, tid, udata),
            ExitAction::UnhandledPath1 => self.syscall_unhandled_path1(name, tid),
            ExitAction::UnhandledOther => self.syscall_unhandled_other(name, tid),
        }
    }

    fn ctx(&self, tid: pid_t) -> TraceResult<TaskCtx> {
        let p = self
            .procs
            .get(tid)
            .ok_or_else(|| TraceError::Invariant(format!("handler for untracked tid {}", tid)))?;
        Ok(TaskCtx {
            tid,
            tgid: p.tgid,
            abi: p.abi,
            wd: p.wd.clone(),
            params: p.params,
            current_syscall: p.current_syscall,
            retvalue: p.retvalue,
            identifier: p.identifier,
        })
    }

    /// Read the C string argument `i` and resolve it against the task's
    /// working directory.
    fn read_path_arg(&self, ctx: &TaskCtx, i: usize) -> Result<PathBuf, TraceeMemoryError> {
        let raw = TraceeMem::new(&self.io, ctx.tid, ctx.abi).read_c_string(ctx.arg_ptr(i))?;
        Ok(paths::resolve(&ctx.wd, &raw))
    }

    fn syscall_fileopening_exit(&mut self, tid: pid_t, udata: u32) -> TraceResult<()> {
        let ctx = self.ctx(tid)?;
        if ctx.retvalue < 0 {
            return Ok(());
        }
        let path = match self.read_path_arg(&ctx, 0) {
            Ok(path) => path,
            Err(e) => {
                log!(LogWarn, "dropping open event: {}", e);
                return Ok(());
            }
        };
        let mode = if udata == OPEN_FORCED_WRITE {
            FileMode::WRITE
        } else {
            flags_to_mode(tid, ctx.params[1])
        };
        let is_dir = path_is_dir(&path);
        self.sink
            .add_file_open(ctx.require_id()?, &path, mode, is_dir)?;
        Ok(())
    }

    fn syscall_filestat_exit(&mut self, tid: pid_t) -> TraceResult<()> {
        let ctx = self.ctx(tid)?;
        if ctx.retvalue < 0 {
            return Ok(());
        }
        let path = match self.read_path_arg(&ctx, 0) {
            Ok(path) => path,
            Err(e) => {
                log!(LogWarn, "dropping stat event: {}", e);
                return Ok(());
            }
        };
        let is_dir = path_is_dir(&path);
        self.sink
            .add_file_open(ctx.require_id()?, &path, FileMode::STAT, is_dir)?;
        Ok(())
    }

    /// readlink reports a stat of the link itself, never the target.
    fn syscall_readlink_exit(&mut self, tid: pid_t) -> TraceResult<()> {
        let ctx = self.ctx(tid)?;
        if ctx.retvalue < 0 {
            return Ok(());
        }
        let path = match self.read_path_arg(&ctx, 0) {
            Ok(path) => path,
            Err(e) => {
                log!(LogWarn, "dropping readlink event: {}", e);
                return Ok(());
            }
        };
        self.sink
            .add_file_open(ctx.require_id()?, &path, FileMode::STAT, false)?;
        Ok(())
    }

    fn syscall_mkdir_exit(&mut self, tid: pid_t) -> TraceResult<()> {
        let ctx = self.ctx(tid)?;
        if ctx.retvalue < 0 {
            return Ok(());
        }
        let path = match self.read_path_arg(&ctx, 0) {
            Ok(path) => path,
            Err(e) => {
                log!(LogWarn, "dropping mkdir event: {}", e);
                return Ok(());
            }
        };
        self.sink
            .add_file_open(ctx.require_id()?, &path, FileMode::WRITE, true)?;
        Ok(())
    }

    /// The link path is the second argument for symlink and the third for
    /// symlinkat, whose descriptor must be the CWD sentinel. The link slot
    /// gets the same directory tag as mkdir's.
    fn syscall_symlink_exit(&mut self, name: &'static str, tid: pid_t, udata: u32) -> TraceResult<()> {
        let ctx = self.ctx(tid)?;
        if ctx.retvalue < 0 {
            return Ok(());
        }
        let link_arg = if udata == SYMLINK_AT {
            if ctx.arg_signed(1) != libc::AT_FDCWD as i64 {
                return self.syscall_unhandled_other(name, tid);
            }
            2
        } else {
            1
        };
        let path = match self.read_path_arg(&ctx, link_arg) {
            Ok(path) => path,
            Err(e) => {
                log!(LogWarn, "dropping symlink event: {}", e);
                return Ok(());
            }
        };
        self.sink
            .add_file_open(ctx.require_id()?, &path, FileMode::WRITE, true)?;
        Ok(())
    }

    fn syscall_chdir_exit(&mut self, tid: pid_t) -> TraceResult<()> {
        let ctx = self.ctx(tid)?;
        if ctx.retvalue < 0 {
            return Ok(());
        }
        let path = match self.read_path_arg(&ctx, 0) {
            Ok(path) => path,
            Err(e) => {
                log!(LogWarn, "dropping chdir event: {}", e);
                return Ok(());
            }
        };
        self.sink
            .add_file_open(ctx.require_id()?, &path, FileMode::WDIR, true)?;
        if let Some(p) = self.procs.get_mut(tid) {
            p.wd = path;
        }
        Ok(())
    }

    /// Capture the exec arguments while the old image can still be read.
    fn syscall_execve_entry(&mut self, tid: pid_t) -> TraceResult<()> {
        let ctx = self.ctx(tid)?;
        if !self.procs.exec_scratch_holders(ctx.tgid).is_empty() {
            return Err(self.invariant_failure(
                tid,
                format!(
                    "execve entered while thread group {} already has one in flight",
                    ctx.tgid
                ),
            ));
        }
        let mem = TraceeMem::new(&self.io, tid, ctx.abi);
        let captured = mem
            .read_c_string(ctx.arg_ptr(0))
            .and_then(|binary| {
                let argv = mem.read_string_array(ctx.arg_ptr(1))?;
                let envp = mem.read_string_array(ctx.arg_ptr(2))?;
                Ok((binary, argv, envp))
            });
        let (binary, argv, envp) = match captured {
            Ok(c) => c,
            Err(e) => {
                log!(LogWarn, "could not capture execve arguments: {}", e);
                return Ok(());
            }
        };
        let binary = paths::resolve(&ctx.wd, &binary);
        if let Some(p) = self.procs.get_mut(tid) {
            p.scratch = Some(ExecveScratch { binary, argv, envp });
        }
        Ok(())
    }

    /// The exit half of execve. The stop may arrive on a different task than
    /// the entry (non-leader thread exec) and under a different ABI; the
    /// dispatch engine already routed us here, so all that is left is to
    /// find who captured the arguments.
    fn syscall_execve_exit(&mut self, tid: pid_t) -> TraceResult<()> {
        let ctx = self.ctx(tid)?;
        let originator = if self
            .procs
            .get(tid)
            .map_or(false, |p| p.scratch.is_some())
        {
            tid
        } else {
            let holders = self.procs.exec_scratch_holders(ctx.tgid);
            match holders.len() {
                1 => holders[0],
                0 => {
                    return Err(self.invariant_failure(
                        tid,
                        format!("execve exit on tid {} with no originator", tid),
                    ));
                }
                _ => {
                    return Err(self.invariant_failure(
                        tid,
                        format!(
                            "multiple execve entries in flight in thread group {}",
                            ctx.tgid
                        ),
                    ));
                }
            }
        };
        let scratch = self
            .procs
            .get_mut(originator)
            .and_then(|p| p.scratch.take())
            .ok_or_else(|| {
                TraceError::Invariant(format!("execve originator {} lost its scratch", originator))
            })?;
        if originator != tid {
            // The calling thread's tid vanished when the kernel gave the new
            // image to the thread-group leader.
            let orig = self.procs.remove(originator).ok_or_else(|| {
                TraceError::Invariant(format!("execve originator {} not in registry", originator))
            })?;
            let orig_id = orig.require_identifier()?;
            self.sink.add_exit(orig_id, 0)?;
            log!(
                LogDebug,
                "tid {} absorbed by leader {} across execve",
                originator,
                tid
            );
        }
        if ctx.retvalue >= 0 {
            let id = ctx.require_id()?;
            self.sink
                .add_exec(id, &scratch.binary, &scratch.argv, &scratch.envp, &ctx.wd)?;
            self.sink
                .ingest_binary_metadata(id, tid, &scratch.binary)?;
        }
        Ok(())
    }

    /// Exit of fork/vfork/clone in the parent. The child may or may not have
    /// stopped already; both orders end with an attached, identified child.
    fn syscall_forking_exit(&mut self, tid: pid_t, udata: u32) -> TraceResult<()> {
        let ctx = self.ctx(tid)?;
        if ctx.retvalue <= 0 {
            return Ok(());
        }
        let child = ctx.retvalue as pid_t;
        let is_thread = udata == FORK_CLONE && ctx.params[0] & libc::CLONE_THREAD as u64 != 0;
        let parent_id = ctx.require_id()?;

        let release_child = match self.procs.get_mut(child) {
            Some(rec) => {
                if rec.status != ProcessStatus::Unknown {
                    return Err(self.invariant_failure(
                        tid,
                        format!("fork returned tid {} which is already attached", child),
                    ));
                }
                rec.status = ProcessStatus::Attached;
                true
            }
            None => {
                self.procs
                    .insert(Process::new(child, ProcessStatus::Allocated));
                false
            }
        };

        let id = self.sink.add_process(Some(parent_id), &ctx.wd)?;
        {
            let rec = self.procs.get_mut(child).ok_or_else(|| {
                TraceError::Invariant(format!("fresh child {} vanished", child))
            })?;
            rec.tgid = if is_thread { ctx.tgid } else { child };
            rec.wd = ctx.wd.clone();
            rec.abi = ctx.abi;
            rec.identifier = Some(id);
        }
        log!(
            LogDebug,
            "tid {} created {} {} (process {})",
            tid,
            if is_thread { "thread" } else { "process" },
            child,
            id
        );
        if release_child {
            self.resume_quiet(child, None);
        }
        Ok(())
    }

    fn syscall_connect_exit(&mut self, tid: pid_t) -> TraceResult<()> {
        let ctx = self.ctx(tid)?;
        if ctx.retvalue < 0 {
            return Ok(());
        }
        let addr = ctx.arg_ptr(1);
        let len = ctx.params[2] as usize;
        self.report_endpoint(&ctx, "connected to", addr, len)
    }

    fn syscall_accept_exit(&mut self, tid: pid_t) -> TraceResult<()> {
        let ctx = self.ctx(tid)?;
        if ctx.retvalue < 0 {
            return Ok(());
        }
        let addr = ctx.arg_ptr(1);
        let len_ptr = ctx.arg_ptr(2);
        self.report_accepted(&ctx, addr, len_ptr)
    }

    /// The 32-bit multiplexer: the first argument picks the operation, the
    /// second points at that operation's real arguments.
    fn syscall_socketcall_exit(&mut self, tid: pid_t) -> TraceResult<()> {
        let ctx = self.ctx(tid)?;
        if ctx.retvalue < 0 {
            return Ok(());
        }
        let op = ctx.params[0];
        if op != SOCKETCALL_CONNECT && op != SOCKETCALL_ACCEPT {
            return Ok(());
        }
        let mem = TraceeMem::new(&self.io, tid, ctx.abi);
        let word = ctx.abi.word_size();
        let array = ctx.arg_ptr(1);
        let unpacked = mem
            .read_ptr(array.add(word))
            .and_then(|addr| Ok((addr, mem.read_word(array.add(2 * word))?)));
        let (addr, len_word) = match unpacked {
            Ok(u) => u,
            Err(e) => {
                log!(LogWarn, "dropping socketcall event: {}", e);
                return Ok(());
            }
        };
        if op == SOCKETCALL_CONNECT {
            self.report_endpoint(&ctx, "connected to", addr, len_word as usize)
        } else {
            self.report_accepted(&ctx, addr, RemotePtr::new(len_word))
        }
    }

    /// accept's address length is value-result; fetch the final value before
    /// decoding.
    fn report_accepted(
        &mut self,
        ctx: &TaskCtx,
        addr: RemotePtr,
        len_ptr: RemotePtr,
    ) -> TraceResult<()> {
        if len_ptr.is_null() {
            return Ok(());
        }
        let mut raw = [0u8; 4];
        if let Err(e) = TraceeMem::new(&self.io, ctx.tid, ctx.abi).read_bytes(len_ptr, &mut raw) {
            log!(LogWarn, "dropping accept event: {}", e);
            return Ok(());
        }
        let len = u32::from_le_bytes(raw) as usize;
        self.report_endpoint(ctx, "accepted a connection from", addr, len)
    }

    fn report_endpoint(
        &mut self,
        ctx: &TaskCtx,
        verb: &str,
        addr: RemotePtr,
        len: usize,
    ) -> TraceResult<()> {
        if addr.is_null() || len < std::mem::size_of::<u16>() {
            return Ok(());
        }
        let mut buf = vec![0u8; std::cmp::min(len, 128)];
        if let Err(e) = TraceeMem::new(&self.io, ctx.tid, ctx.abi).read_bytes(addr, &mut buf) {
            log!(LogWarn, "dropping endpoint event: {}", e);
            return Ok(());
        }
        let endpoint = format_sockaddr(&buf);
        self.sink.log(
            LogChannel::Warn,
            ctx.tid,
            &format!("process {} {}", verb, endpoint),
        )?;
        Ok(())
    }

    /// `openat` and friends with the CWD sentinel behave exactly like their
    /// plain forms, so shift the descriptor out of the argument vector and
    /// replay through the plain handler; the captured vector is restored
    /// afterwards. Any other descriptor is out of scope and only warned.
    fn syscall_at_adapter_exit(
        &mut self,
        name: &'static str,
        tid: pid_t,
        target: u32,
    ) -> TraceResult<()> {
        let ctx = self.ctx(tid)?;
        if ctx.arg_signed(0) != libc::AT_FDCWD as i64 {
            return self.syscall_unhandled_other(name, tid);
        }
        let x32_bit = ctx.abi == Abi::X8664
            && ctx.current_syscall >= 0
            && ctx.current_syscall as u64 & X32_SYSCALL_BIT != 0;
        let slot: Option<SyscallSlot> = self
            .tables
            .for_abi(ctx.abi, x32_bit)
            .get(target as i64)
            .copied();
        let (target_name, target_action, target_udata) = match slot {
            Some(SyscallSlot {
                name: target_name,
                exit: Some(action),
                udata,
                ..
            }) if action != ExitAction::AtAdapter => (target_name, action, udata),
            _ => {
                return Err(TraceError::Invariant(format!(
                    "{} redirects to syscall {} which has no plain exit handler",
                    name, target
                )));
            }
        };

        let saved = ctx.params;
        let mut shifted = [0u64; 6];
        shifted[..5].copy_from_slice(&saved[1..]);
        if let Some(p) = self.procs.get_mut(tid) {
            p.params = shifted;
        }
        let result = self.run_exit(target_name, tid, target_action, target_udata);
        if let Some(p) = self.procs.get_mut(tid) {
            p.params = saved;
        }
        result
    }

    fn syscall_unhandled_path1(&mut self, name: &'static str, tid: pid_t) -> TraceResult<()> {
        let ctx = self.ctx(tid)?;
        if ctx.retvalue < 0 {
            return Ok(());
        }
        let path = match self.read_path_arg(&ctx, 0) {
            Ok(path) => path,
            Err(e) => {
                log!(LogWarn, "dropping unhandled-syscall warning: {}", e);
                return Ok(());
            }
        };
        log!(LogInfo, "tid {} used unhandled syscall {}", tid, name);
        if Flags::get().warn_unhandled {
            self.sink.log(
                LogChannel::Warn,
                tid,
                &format!("unhandled syscall {} on {}", name, path.display()),
            )?;
        }
        Ok(())
    }

    fn syscall_unhandled_other(&mut self, name: &'static str, tid: pid_t) -> TraceResult<()> {
        log!(LogInfo, "tid {} used unhandled syscall {}", tid, name);
        if Flags::get().warn_unhandled {
            self.sink
                .log(LogChannel::Warn, tid, &format!("unhandled syscall {}", name))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_ipv4_endpoints() {
        let mut buf = vec![2, 0, 0, 80, 1, 2, 3, 4];
        buf.resize(16, 0);
        assert_eq!(format_sockaddr(&buf), "1.2.3.4:80");
    }

    #[test]
    fn formats_ipv6_endpoints() {
        let mut buf = vec![10, 0, 0x1f, 0x90, 0, 0, 0, 0];
        let mut addr = [0u8; 16];
        addr[15] = 1;
        buf.extend_from_slice(&addr);
        assert_eq!(format_sockaddr(&buf), "[::1]:8080");
    }

    #[test]
    fn unknown_families_are_named_by_number() {
        let buf = [7u8, 0, 0, 0];
        assert_eq!(format_sockaddr(&buf), "unknown, family=7");
    }
}
