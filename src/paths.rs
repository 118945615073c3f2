//! Path bookkeeping for tracees. The tracer never asks the kernel what a
//! task's working directory is; it replays chdir itself, so resolution is a
//! purely textual affair.

use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

/// Resolve a path argument against a task's working directory. Absolute
/// paths are returned verbatim; relative paths are joined to `wd` (trusted
/// to be absolute) and normalised.
pub fn resolve(wd: &Path, raw: &OsStr) -> PathBuf {
    let raw = Path::new(raw);
    if raw.is_absolute() {
        raw.to_path_buf()
    } else {
        normalize(&wd.join(raw))
    }
}

/// Collapse `.` and `..` segments and duplicate separators, without touching
/// the filesystem. `..` at the root stays at the root.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::RootDir => out.push("/"),
            Component::CurDir => {}
            Component::ParentDir => {
                if out.as_os_str() != "/" {
                    out.pop();
                }
            }
            Component::Normal(c) => out.push(c),
            Component::Prefix(_) => {}
        }
    }
    out
}
