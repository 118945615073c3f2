//! Syscall numbering for the ABIs the tracer understands: 32-bit x86,
//! native x86-64, and the x32 ILP32 sub-ABI (recognised by the high bit in
//! the syscall number while the task runs in 64-bit mode).

/// The ABI a task is currently executing under. A task may switch at
/// execve; the dispatch engine re-reads it from the registers at every stop.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Abi {
    I386,
    X8664,
}

impl Abi {
    /// Width of a machine word and of a pointer in the tracee, in bytes.
    pub fn word_size(self) -> usize {
        match self {
            Abi::I386 => 4,
            Abi::X8664 => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Abi::I386 => "i386",
            Abi::X8664 => "x86_64",
        }
    }
}

/// Set in the raw syscall number when a 64-bit task uses the x32 sub-ABI.
pub const X32_SYSCALL_BIT: u64 = 0x4000_0000;

/// Hard ceiling on table indices; anything at or above this is rejected as
/// garbage rather than allocated for.
pub const MAX_SYSCALL: i64 = 2000;

/// Sub-operation selectors of the 32-bit `socketcall` multiplexer.
pub const SOCKETCALL_CONNECT: u64 = 3;
pub const SOCKETCALL_ACCEPT: u64 = 5;

/// Numbers from `asm/unistd_32.h`.
pub mod x86 {
    pub const FORK: u32 = 2;
    pub const OPEN: u32 = 5;
    pub const CREAT: u32 = 8;
    pub const LINK: u32 = 9;
    pub const UNLINK: u32 = 10;
    pub const EXECVE: u32 = 11;
    pub const CHDIR: u32 = 12;
    pub const MKNOD: u32 = 14;
    pub const CHMOD: u32 = 15;
    pub const OLDSTAT: u32 = 18;
    pub const MOUNT: u32 = 21;
    pub const UTIME: u32 = 30;
    pub const ACCESS: u32 = 33;
    pub const RENAME: u32 = 38;
    pub const MKDIR: u32 = 39;
    pub const RMDIR: u32 = 40;
    pub const UMOUNT2: u32 = 52;
    pub const CHROOT: u32 = 61;
    pub const SYMLINK: u32 = 83;
    pub const OLDLSTAT: u32 = 84;
    pub const READLINK: u32 = 85;
    pub const TRUNCATE: u32 = 92;
    pub const SOCKETCALL: u32 = 102;
    pub const STAT: u32 = 106;
    pub const LSTAT: u32 = 107;
    pub const CLONE: u32 = 120;
    pub const VFORK: u32 = 190;
    pub const STAT64: u32 = 195;
    pub const LSTAT64: u32 = 196;
    pub const OPENAT: u32 = 295;
    pub const MKDIRAT: u32 = 296;
    pub const FSTATAT64: u32 = 300;
    pub const SYMLINKAT: u32 = 304;
    pub const READLINKAT: u32 = 305;
    pub const FACCESSAT: u32 = 307;
}

/// Numbers from `asm/unistd_64.h`.
pub mod x64 {
    pub const OPEN: u32 = 2;
    pub const STAT: u32 = 4;
    pub const LSTAT: u32 = 6;
    pub const ACCESS: u32 = 21;
    pub const CONNECT: u32 = 42;
    pub const ACCEPT: u32 = 43;
    pub const CLONE: u32 = 56;
    pub const FORK: u32 = 57;
    pub const VFORK: u32 = 58;
    pub const EXECVE: u32 = 59;
    pub const TRUNCATE: u32 = 76;
    pub const CHDIR: u32 = 80;
    pub const RENAME: u32 = 82;
    pub const MKDIR: u32 = 83;
    pub const RMDIR: u32 = 84;
    pub const CREAT: u32 = 85;
    pub const LINK: u32 = 86;
    pub const UNLINK: u32 = 87;
    pub const SYMLINK: u32 = 88;
    pub const READLINK: u32 = 89;
    pub const CHMOD: u32 = 90;
    pub const UTIME: u32 = 132;
    pub const MKNOD: u32 = 133;
    pub const CHROOT: u32 = 161;
    pub const MOUNT: u32 = 165;
    pub const UMOUNT2: u32 = 166;
    pub const OPENAT: u32 = 257;
    pub const MKDIRAT: u32 = 258;
    pub const NEWFSTATAT: u32 = 262;
    pub const SYMLINKAT: u32 = 266;
    pub const READLINKAT: u32 = 267;
    pub const FACCESSAT: u32 = 269;
    pub const ACCEPT4: u32 = 288;
}

/// The x32 sub-ABI shares the 64-bit numbering except for the calls that
/// were given fresh slots in the 512+ range; execve is the one we care about.
pub mod x32 {
    pub const EXECVE: u32 = 520;
}

/// True when `nr` is the (stripped) execve number in any supported ABI.
/// Used by the dispatch engine to recognise an exec exit reported under a
/// different ABI, or on a different task, than the matching entry.
pub fn is_execve_number(nr: i64) -> bool {
    nr == x86::EXECVE as i64 || nr == x64::EXECVE as i64 || nr == x32::EXECVE as i64
}
