//! Per-ABI dispatch tables. Each slot names the call and says which handler
//! family runs on entry and on exit, plus a small discriminator the family
//! interprets (open flavour, clone-vs-fork, `*at` redirect target, ...).

use crate::kernel_abi::{x32, x64, x86, Abi};

/// Entry-side handler families. Only execve needs to see the call before
/// the kernel runs it: its arguments are gone from the address space by the
/// time the call returns.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EntryAction {
    Execve,
}

/// Exit-side handler families.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExitAction {
    /// open/creat; discriminator [`OPEN_FORCED_WRITE`] forces write mode.
    FileOpen,
    /// access/stat/lstat and friends.
    FileStat,
    Readlink,
    Mkdir,
    /// symlink/symlinkat; discriminator [`SYMLINK_AT`] moves the link-path
    /// argument and adds the descriptor check.
    Symlink,
    Chdir,
    Execve,
    /// fork/vfork/clone; discriminator [`FORK_CLONE`] makes the handler
    /// inspect the clone flags for the thread bit.
    Forking,
    Socketcall,
    Accept,
    Connect,
    /// `openat` and friends; discriminator is the non-`at` syscall number in
    /// the same ABI.
    AtAdapter,
    /// Success still worth a warning naming the path argument.
    UnhandledPath1,
    /// Warned by name only.
    UnhandledOther,
}

pub const OPEN_FLAGS_ARG: u32 = 0;
pub const OPEN_FORCED_WRITE: u32 = 1;
pub const FORK_PLAIN: u32 = 0;
pub const FORK_CLONE: u32 = 1;
pub const SYMLINK_DIRECT: u32 = 0;
pub const SYMLINK_AT: u32 = 1;

#[derive(Copy, Clone, Debug)]
pub struct SyscallSlot {
    pub name: &'static str,
    pub entry: Option<EntryAction>,
    pub exit: Option<ExitAction>,
    pub udata: u32,
}

const EMPTY_SLOT: SyscallSlot = SyscallSlot {
    name: "",
    entry: None,
    exit: None,
    udata: 0,
};

type SlotSpec = (
    u32,
    &'static str,
    Option<EntryAction>,
    Option<ExitAction>,
    u32,
);

pub struct SyscallTable {
    slots: Vec<SyscallSlot>,
}

impl SyscallTable {
    /// Build from an unordered list; length is one past the highest number
    /// used, everything unmentioned stays handler-free.
    fn from_specs(specs: &[SlotSpec]) -> SyscallTable {
        let len = specs
            .iter()
            .map(|s| s.0 as usize + 1)
            .max()
            .unwrap_or(0);
        let mut slots = vec![EMPTY_SLOT; len];
        for &(nr, name, entry, exit, udata) in specs {
            slots[nr as usize] = SyscallSlot {
                name,
                entry,
                exit,
                udata,
            };
        }
        SyscallTable { slots }
    }

    pub fn get(&self, nr: i64) -> Option<&SyscallSlot> {
        if nr < 0 {
            return None;
        }
        self.slots.get(nr as usize)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }
}

/// The three tables, built once at tracer startup and immutable afterwards.
pub struct SyscallTables {
    pub i386: SyscallTable,
    pub x86_64: SyscallTable,
    pub x32: SyscallTable,
}

impl SyscallTables {
    pub fn build() -> SyscallTables {
        SyscallTables {
            i386: SyscallTable::from_specs(&i386_specs()),
            x86_64: SyscallTable::from_specs(&x86_64_specs(x64::EXECVE)),
            x32: SyscallTable::from_specs(&x86_64_specs(x32::EXECVE)),
        }
    }

    pub fn for_abi(&self, abi: Abi, x32_bit: bool) -> &SyscallTable {
        match abi {
            Abi::I386 => &self.i386,
            Abi::X8664 if x32_bit => &self.x32,
            Abi::X8664 => &self.x86_64,
        }
    }
}

fn i386_specs() -> Vec<SlotSpec> {
    use EntryAction as En;
    use ExitAction as Ex;
    vec![
        (x86::FORK, "fork", None, Some(Ex::Forking), FORK_PLAIN),
        (x86::OPEN, "open", None, Some(Ex::FileOpen), OPEN_FLAGS_ARG),
        (x86::CREAT, "creat", None, Some(Ex::FileOpen), OPEN_FORCED_WRITE),
        (x86::LINK, "link", None, Some(Ex::UnhandledPath1), 0),
        (x86::UNLINK, "unlink", None, Some(Ex::UnhandledPath1), 0),
        (x86::EXECVE, "execve", Some(En::Execve), Some(Ex::Execve), 0),
        (x86::CHDIR, "chdir", None, Some(Ex::Chdir), 0),
        (x86::MKNOD, "mknod", None, Some(Ex::UnhandledPath1), 0),
        (x86::CHMOD, "chmod", None, Some(Ex::UnhandledPath1), 0),
        (x86::OLDSTAT, "oldstat", None, Some(Ex::FileStat), 0),
        (x86::MOUNT, "mount", None, Some(Ex::UnhandledOther), 0),
        (x86::UTIME, "utime", None, Some(Ex::UnhandledPath1), 0),
        (x86::ACCESS, "access", None, Some(Ex::FileStat), 0),
        (x86::RENAME, "rename", None, Some(Ex::UnhandledPath1), 0),
        (x86::MKDIR, "mkdir", None, Some(Ex::Mkdir), 0),
        (x86::RMDIR, "rmdir", None, Some(Ex::UnhandledPath1), 0),
        (x86::UMOUNT2, "umount2", None, Some(Ex::UnhandledOther), 0),
        (x86::CHROOT, "chroot", None, Some(Ex::UnhandledOther), 0),
        (x86::SYMLINK, "symlink", None, Some(Ex::Symlink), SYMLINK_DIRECT),
        (x86::OLDLSTAT, "oldlstat", None, Some(Ex::FileStat), 0),
        (x86::READLINK, "readlink", None, Some(Ex::Readlink), 0),
        (x86::TRUNCATE, "truncate", None, Some(Ex::UnhandledOther), 0),
        (x86::SOCKETCALL, "socketcall", None, Some(Ex::Socketcall), 0),
        (x86::STAT, "stat", None, Some(Ex::FileStat), 0),
        (x86::LSTAT, "lstat", None, Some(Ex::FileStat), 0),
        (x86::CLONE, "clone", None, Some(Ex::Forking), FORK_CLONE),
        (x86::VFORK, "vfork", None, Some(Ex::Forking), FORK_PLAIN),
        (x86::STAT64, "stat64", None, Some(Ex::FileStat), 0),
        (x86::LSTAT64, "lstat64", None, Some(Ex::FileStat), 0),
        (x86::OPENAT, "openat", None, Some(Ex::AtAdapter), x86::OPEN),
        (x86::MKDIRAT, "mkdirat", None, Some(Ex::AtAdapter), x86::MKDIR),
        (x86::FSTATAT64, "fstatat64", None, Some(Ex::AtAdapter), x86::STAT64),
        (x86::SYMLINKAT, "symlinkat", None, Some(Ex::Symlink), SYMLINK_AT),
        (x86::READLINKAT, "readlinkat", None, Some(Ex::AtAdapter), x86::READLINK),
        (x86::FACCESSAT, "faccessat", None, Some(Ex::AtAdapter), x86::ACCESS),
    ]
}

/// Shared by the native 64-bit and x32 tables, which differ only in where
/// execve lives.
fn x86_64_specs(execve: u32) -> Vec<SlotSpec> {
    use EntryAction as En;
    use ExitAction as Ex;
    vec![
        (x64::OPEN, "open", None, Some(Ex::FileOpen), OPEN_FLAGS_ARG),
        (x64::STAT, "stat", None, Some(Ex::FileStat), 0),
        (x64::LSTAT, "lstat", None, Some(Ex::FileStat), 0),
        (x64::ACCESS, "access", None, Some(Ex::FileStat), 0),
        (x64::CONNECT, "connect", None, Some(Ex::Connect), 0),
        (x64::ACCEPT, "accept", None, Some(Ex::Accept), 0),
        (x64::CLONE, "clone", None, Some(Ex::Forking), FORK_CLONE),
        (x64::FORK, "fork", None, Some(Ex::Forking), FORK_PLAIN),
        (x64::VFORK, "vfork", None, Some(Ex::Forking), FORK_PLAIN),
        (execve, "execve", Some(En::Execve), Some(Ex::Execve), 0),
        (x64::TRUNCATE, "truncate", None, Some(Ex::UnhandledOther), 0),
        (x64::CHDIR, "chdir", None, Some(Ex::Chdir), 0),
        (x64::RENAME, "rename", None, Some(Ex::UnhandledPath1), 0),
        (x64::MKDIR, "mkdir", None, Some(Ex::Mkdir), 0),
        (x64::RMDIR, "rmdir", None, Some(Ex::UnhandledPath1), 0),
        (x64::CREAT, "creat", None, Some(Ex::FileOpen), OPEN_FORCED_WRITE),
        (x64::LINK, "link", None, Some(Ex::UnhandledPath1), 0),
        (x64::UNLINK, "unlink", None, Some(Ex::UnhandledPath1), 0),
        (x64::SYMLINK, "symlink", None, Some(Ex::Symlink), SYMLINK_DIRECT),
        (x64::READLINK, "readlink", None, Some(Ex::Readlink), 0),
        (x64::CHMOD, "chmod", None, Some(Ex::UnhandledPath1), 0),
        (x64::UTIME, "utime", None, Some(Ex::UnhandledPath1), 0),
        (x64::MKNOD, "mknod", None, Some(Ex::UnhandledPath1), 0),
        (x64::CHROOT, "chroot", None, Some(Ex::UnhandledOther), 0),
        (x64::MOUNT, "mount", None, Some(Ex::UnhandledOther), 0),
        (x64::UMOUNT2, "umount2", None, Some(Ex::UnhandledOther), 0),
        (x64::OPENAT, "openat", None, Some(Ex::AtAdapter), x64::OPEN),
        (x64::MKDIRAT, "mkdirat", None, Some(Ex::AtAdapter), x64::MKDIR),
        (x64::NEWFSTATAT, "newfstatat", None, Some(Ex::AtAdapter), x64::STAT),
        (x64::SYMLINKAT, "symlinkat", None, Some(Ex::Symlink), SYMLINK_AT),
        (x64::READLINKAT, "readlinkat", None, Some(Ex::AtAdapter), x64::READLINK),
        (x64::FACCESSAT, "faccessat", None, Some(Ex::AtAdapter), x64::ACCESS),
        (x64::ACCEPT4, "accept4", None, Some(Ex::Accept), 0),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_are_sparse_and_bounded() {
        let tables = SyscallTables::build();
        assert_eq!(tables.i386.len(), x86::FACCESSAT as usize + 1);
        // Unmentioned slot: present, nameless, handler-free.
        let gap = tables.i386.get(100).unwrap();
        assert_eq!(gap.name, "");
        assert!(gap.entry.is_none() && gap.exit.is_none());
        assert!(tables.i386.get(-1).is_none());
        assert!(tables.i386.get(100_000).is_none());
    }

    #[test]
    fn execve_is_the_only_entry_handler() {
        let tables = SyscallTables::build();
        for table in &[&tables.i386, &tables.x86_64, &tables.x32] {
            let entries: Vec<&SyscallSlot> = (0..table.len() as i64)
                .filter_map(|n| table.get(n))
                .filter(|s| s.entry.is_some())
                .collect();
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].name, "execve");
        }
    }

    #[test]
    fn x32_differs_from_native_only_in_execve() {
        let tables = SyscallTables::build();
        assert!(tables.x86_64.get(x64::EXECVE as i64).unwrap().exit.is_some());
        assert!(tables.x32.get(x64::EXECVE as i64).unwrap().exit.is_none());
        assert_eq!(tables.x32.get(x32::EXECVE as i64).unwrap().name, "execve");
    }

    #[test]
    fn socketcall_exists_on_i386_only() {
        let tables = SyscallTables::build();
        assert_eq!(
            tables.i386.get(x86::SOCKETCALL as i64).unwrap().exit,
            Some(ExitAction::Socketcall)
        );
        let same_slot = tables.x86_64.get(x86::SOCKETCALL as i64).unwrap();
        assert_ne!(same_slot.exit, Some(ExitAction::Socketcall));
    }

    #[test]
    fn at_adapters_point_at_their_plain_form() {
        let tables = SyscallTables::build();
        let openat = tables.x86_64.get(x64::OPENAT as i64).unwrap();
        assert_eq!(openat.exit, Some(ExitAction::AtAdapter));
        let target = tables.x86_64.get(openat.udata as i64).unwrap();
        assert_eq!(target.exit, Some(ExitAction::FileOpen));
    }
}
