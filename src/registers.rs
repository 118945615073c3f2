//! The register snapshot the tracer needs from a stopped task: the syscall
//! number, the six argument registers, the result register, and the ABI the
//! task was executing under.

use crate::kernel_abi::Abi;

#[derive(Copy, Clone, Debug)]
pub struct Registers {
    abi: Abi,
    syscallno: i64,
    args: [u64; 6],
    retval: i64,
}

impl Registers {
    pub fn new(abi: Abi, syscallno: i64, args: [u64; 6], retval: i64) -> Registers {
        Registers {
            abi,
            syscallno,
            args,
            retval,
        }
    }

    pub fn abi(&self) -> Abi {
        self.abi
    }

    pub fn syscallno(&self) -> i64 {
        self.syscallno
    }

    pub fn args(&self) -> [u64; 6] {
        self.args
    }

    pub fn syscall_result(&self) -> i64 {
        self.retval
    }
}

// Widening rules for values captured from a compat (32-bit) task: addresses
// and flags widen zero-extended, the result register widens sign-extended so
// that -ENOENT stays negative.
fn narrow(r64: u64) -> u64 {
    r64 as u32 as u64
}

fn narrow_signed(r64: u64) -> i64 {
    r64 as u32 as i32 as i64
}

#[cfg(target_arch = "x86_64")]
impl From<libc::user_regs_struct> for Registers {
    /// Decodes a `PTRACE_GETREGS` snapshot. The kernel reports compat tasks
    /// through the same 64-bit layout; the user code segment tells the two
    /// apart (0x33 long mode, 0x23 compat), and the i386 argument registers
    /// live in the corresponding 64-bit slots.
    fn from(raw: libc::user_regs_struct) -> Registers {
        if raw.cs == 0x33 {
            Registers::new(
                Abi::X8664,
                raw.orig_rax as i64,
                [raw.rdi, raw.rsi, raw.rdx, raw.r10, raw.r8, raw.r9],
                raw.rax as i64,
            )
        } else {
            Registers::new(
                Abi::I386,
                narrow_signed(raw.orig_rax),
                [
                    narrow(raw.rbx),
                    narrow(raw.rcx),
                    narrow(raw.rdx),
                    narrow(raw.rsi),
                    narrow(raw.rdi),
                    narrow(raw.rbp),
                ],
                narrow_signed(raw.rax),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn narrowing_keeps_errno_negative() {
        // 32-bit -ENOENT widened through the zero-extending path would look
        // like a large positive fd.
        assert_eq!(narrow_signed(0xffff_fffe), -2);
        assert_eq!(narrow(0xffff_fffe), 0xffff_fffe);
    }
}
