//! The tracee I/O provider: everything that actually touches ptrace. The
//! dispatch engine and handlers only see the `TraceeIo` trait, which keeps
//! them drivable from tests without a kernel underneath.

use crate::error::{TraceError, TraceResult, TraceeMemoryError};
use crate::registers::Registers;
use crate::remote_ptr::RemotePtr;
use libc::pid_t;
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::uio::{process_vm_readv, IoVec, RemoteIoVec};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::io;
use std::os::unix::process::CommandExt;
use std::process::Command;

pub trait TraceeIo {
    fn attach(&self, tid: pid_t) -> TraceResult<()>;

    /// Resume to the next syscall boundary, optionally re-injecting a
    /// pending signal.
    fn resume(&self, tid: pid_t, sig: Option<Signal>) -> TraceResult<()>;

    /// Fill `buf` from the tracee's address space, all or nothing.
    fn read_mem(&self, tid: pid_t, addr: RemotePtr, buf: &mut [u8]) -> Result<(), TraceeMemoryError>;

    fn get_registers(&self, tid: pid_t) -> TraceResult<Registers>;
}

/// The production provider, backed by ptrace and `process_vm_readv`.
pub struct Ptracer;

impl Ptracer {
    pub fn new() -> Ptracer {
        Ptracer
    }

    /// Spawn the root target with `PTRACE_TRACEME` armed in the pre-exec
    /// hook; the child stops with SIGTRAP when its execve completes.
    pub fn spawn_traced(&self, argv: &[String]) -> TraceResult<pid_t> {
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        unsafe {
            cmd.pre_exec(|| {
                ptrace::traceme()
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("traceme: {}", e)))
            });
        }
        let child = cmd.spawn().map_err(|source| TraceError::Spawn {
            program: argv[0].clone(),
            source,
        })?;
        Ok(child.id() as pid_t)
    }

    /// Arm the ptrace options that make syscall stops distinguishable and
    /// keep fork/vfork/clone children attached from birth.
    pub fn set_tracing_options(&self, tid: pid_t) -> TraceResult<()> {
        let options = ptrace::Options::PTRACE_O_TRACESYSGOOD
            | ptrace::Options::PTRACE_O_TRACECLONE
            | ptrace::Options::PTRACE_O_TRACEFORK
            | ptrace::Options::PTRACE_O_TRACEVFORK
            | ptrace::Options::PTRACE_O_EXITKILL;
        ptrace::setoptions(Pid::from_raw(tid), options).map_err(|source| TraceError::Ptrace {
            tid,
            op: "PTRACE_SETOPTIONS",
            source,
        })
    }

    /// Block for the next stop from any tracee.
    pub fn wait_next(&self) -> TraceResult<WaitStatus> {
        waitpid(None, Some(WaitPidFlag::__WALL)).map_err(|source| TraceError::Ptrace {
            tid: -1,
            op: "waitpid",
            source,
        })
    }

    fn peek_read(
        &self,
        tid: pid_t,
        addr: RemotePtr,
        buf: &mut [u8],
    ) -> Result<(), TraceeMemoryError> {
        let pid = Pid::from_raw(tid);
        let mut off = 0usize;
        while off < buf.len() {
            let word = ptrace::read(pid, addr.add(off).as_u64() as ptrace::AddressType).map_err(
                |_| TraceeMemoryError {
                    tid,
                    addr: addr.add(off).as_u64(),
                    what: "address unreadable",
                },
            )?;
            let bytes = word.to_ne_bytes();
            let n = std::cmp::min(bytes.len(), buf.len() - off);
            buf[off..off + n].copy_from_slice(&bytes[..n]);
            off += n;
        }
        Ok(())
    }
}

impl TraceeIo for Ptracer {
    fn attach(&self, tid: pid_t) -> TraceResult<()> {
        ptrace::attach(Pid::from_raw(tid)).map_err(|source| TraceError::Ptrace {
            tid,
            op: "PTRACE_ATTACH",
            source,
        })
    }

    fn resume(&self, tid: pid_t, sig: Option<Signal>) -> TraceResult<()> {
        match sig {
            None => {
                ptrace::syscall(Pid::from_raw(tid), None).map_err(|source| TraceError::Ptrace {
                    tid,
                    op: "PTRACE_SYSCALL",
                    source,
                })
            }
            Some(sig) => {
                // nix 0.17 has no signal-carrying variant of syscall().
                let ret = unsafe {
                    libc::ptrace(
                        libc::PTRACE_SYSCALL,
                        tid,
                        std::ptr::null_mut::<libc::c_void>(),
                        sig as libc::c_long,
                    )
                };
                if ret == -1 {
                    return Err(TraceError::Ptrace {
                        tid,
                        op: "PTRACE_SYSCALL",
                        source: nix::Error::Sys(Errno::last()),
                    });
                }
                Ok(())
            }
        }
    }

    fn read_mem(&self, tid: pid_t, addr: RemotePtr, buf: &mut [u8]) -> Result<(), TraceeMemoryError> {
        if buf.is_empty() {
            return Ok(());
        }
        if addr.is_null() {
            return Err(TraceeMemoryError {
                tid,
                addr: 0,
                what: "null pointer",
            });
        }
        let len = buf.len();
        let remote = [RemoteIoVec {
            base: addr.as_u64() as usize,
            len,
        }];
        let local = [IoVec::from_mut_slice(buf)];
        match process_vm_readv(Pid::from_raw(tid), &local, &remote) {
            Ok(n) if n == len => Ok(()),
            // Partial or failed; the word-by-word fallback also covers
            // kernels without process_vm_readv permission.
            _ => {
                drop(local);
                self.peek_read(tid, addr, buf)
            }
        }
    }

    fn get_registers(&self, tid: pid_t) -> TraceResult<Registers> {
        let raw = ptrace::getregs(Pid::from_raw(tid)).map_err(|source| TraceError::Ptrace {
            tid,
            op: "PTRACE_GETREGS",
            source,
        })?;
        Ok(Registers::from(raw))
    }
}
