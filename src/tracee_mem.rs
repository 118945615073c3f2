//! Address-space reader: pulls strings, words, pointers and string arrays
//! out of a stopped tracee, honouring the task's pointer width. Nothing here
//! is ever returned truncated; short data is an error.

use crate::error::TraceeMemoryError;
use crate::kernel_abi::Abi;
use crate::ptracer::TraceeIo;
use crate::remote_ptr::RemotePtr;
use libc::pid_t;
use memchr::memchr;
use std::ffi::OsString;
use std::os::unix::ffi::OsStringExt;

/// Longest C string we will copy out of a tracee. Argument vectors can be
/// large but a single element beyond this is garbage, not data.
const MAX_STRING: usize = 64 * 1024;

/// Most elements a tracee-side string array may carry.
const MAX_ARRAY: usize = 64 * 1024;

/// Strings are fetched in word-sized nibbles, the same granularity ptrace
/// itself offers, so a string ending near an unmapped page does not force a
/// read past it.
const CHUNK: usize = 8;

pub struct TraceeMem<'a, IO: TraceeIo> {
    io: &'a IO,
    tid: pid_t,
    abi: Abi,
}

impl<'a, IO: TraceeIo> TraceeMem<'a, IO> {
    pub fn new(io: &'a IO, tid: pid_t, abi: Abi) -> TraceeMem<'a, IO> {
        TraceeMem { io, tid, abi }
    }

    pub fn read_bytes(&self, addr: RemotePtr, buf: &mut [u8]) -> Result<(), TraceeMemoryError> {
        self.io.read_mem(self.tid, addr, buf)
    }

    /// Copy the NUL-terminated string at `addr`, without the terminator.
    pub fn read_c_string(&self, addr: RemotePtr) -> Result<OsString, TraceeMemoryError> {
        if addr.is_null() {
            return Err(TraceeMemoryError {
                tid: self.tid,
                addr: 0,
                what: "null string pointer",
            });
        }
        let mut out: Vec<u8> = Vec::new();
        let mut cur = addr;
        loop {
            let mut chunk = [0u8; CHUNK];
            self.read_bytes(cur, &mut chunk)?;
            match memchr(0, &chunk) {
                Some(n) => {
                    out.extend_from_slice(&chunk[..n]);
                    return Ok(OsString::from_vec(out));
                }
                None => out.extend_from_slice(&chunk),
            }
            if out.len() >= MAX_STRING {
                return Err(TraceeMemoryError {
                    tid: self.tid,
                    addr: addr.as_u64(),
                    what: "unterminated string",
                });
            }
            cur = cur.add(CHUNK);
        }
    }

    /// Read one machine word at the tracee's width, zero-extended.
    pub fn read_word(&self, addr: RemotePtr) -> Result<u64, TraceeMemoryError> {
        let mut buf = [0u8; 8];
        let width = self.abi.word_size();
        self.read_bytes(addr, &mut buf[..width])?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Read a pointer at the tracee's width.
    pub fn read_ptr(&self, addr: RemotePtr) -> Result<RemotePtr, TraceeMemoryError> {
        self.read_word(addr).map(RemotePtr::new)
    }

    /// Duplicate a tracee-side `char *arr[]` terminated by a null slot.
    /// A null array pointer reads as empty, which is how the kernel treats
    /// execve's argv/envp.
    pub fn read_string_array(&self, addr: RemotePtr) -> Result<Vec<OsString>, TraceeMemoryError> {
        if addr.is_null() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        let width = self.abi.word_size();
        for i in 0..MAX_ARRAY {
            let slot = self.read_ptr(addr.add(i * width))?;
            if slot.is_null() {
                return Ok(out);
            }
            out.push(self.read_c_string(slot)?);
        }
        Err(TraceeMemoryError {
            tid: self.tid,
            addr: addr.as_u64(),
            what: "unterminated string array",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ptracer::testing::MockTracee;

    fn mem(io: &MockTracee, abi: Abi) -> TraceeMem<MockTracee> {
        TraceeMem::new(io, 100, abi)
    }

    #[test]
    fn reads_string_across_chunks() {
        let io = MockTracee::new();
        io.map_str(0x1000, "/a/rather/long/path/that/spans/chunks");
        let m = mem(&io, Abi::X8664);
        assert_eq!(
            m.read_c_string(RemotePtr::new(0x1000)).unwrap(),
            OsString::from("/a/rather/long/path/that/spans/chunks")
        );
    }

    #[test]
    fn string_read_fails_rather_than_truncates() {
        let io = MockTracee::new();
        // No terminator inside the mapped region.
        io.map(0x1000, &[b'x'; 8]);
        let m = mem(&io, Abi::X8664);
        assert!(m.read_c_string(RemotePtr::new(0x1000)).is_err());
    }

    #[test]
    fn null_string_pointer_is_an_error() {
        let io = MockTracee::new();
        let m = mem(&io, Abi::X8664);
        assert!(m.read_c_string(RemotePtr::new(0)).is_err());
    }

    #[test]
    fn word_width_follows_abi() {
        let io = MockTracee::new();
        io.map(0x2000, &[0x78, 0x56, 0x34, 0x12, 0xff, 0xff, 0xff, 0xff]);
        assert_eq!(
            mem(&io, Abi::I386).read_word(RemotePtr::new(0x2000)).unwrap(),
            0x1234_5678
        );
        assert_eq!(
            mem(&io, Abi::X8664).read_word(RemotePtr::new(0x2000)).unwrap(),
            0xffff_ffff_1234_5678
        );
    }

    #[test]
    fn duplicates_string_array_at_i386_width() {
        let io = MockTracee::new();
        io.map_str(0x3000, "ls");
        io.map_str(0x3010, "-l");
        io.map_words(0x4000, &[0x3000, 0x3010, 0], 4);
        let m = mem(&io, Abi::I386);
        assert_eq!(
            m.read_string_array(RemotePtr::new(0x4000)).unwrap(),
            vec![OsString::from("ls"), OsString::from("-l")]
        );
    }

    #[test]
    fn null_array_reads_empty() {
        let io = MockTracee::new();
        let m = mem(&io, Abi::X8664);
        assert!(m.read_string_array(RemotePtr::new(0)).unwrap().is_empty());
    }
}
