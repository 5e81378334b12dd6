use std::fmt::{self, Display, Formatter};
use std::ops::Add;

/// A register number in the debugger's numbering for the target
/// architecture.
///
/// The inner u32 is deliberately NOT pub. Others should not construct
/// arbitrary GdbRegister values; they either use the named constants below
/// or walk the register file through `Registers::total_registers()`.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct GdbRegister(u32);

impl GdbRegister {
    /// The `n`th register of the file. Only meaningful below the
    /// per-architecture total.
    pub fn nth(n: u32) -> GdbRegister {
        GdbRegister(n)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl Display for GdbRegister {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

impl Add<u32> for GdbRegister {
    type Output = GdbRegister;

    fn add(self, delta: u32) -> GdbRegister {
        GdbRegister(self.0 + delta)
    }
}

// x86 numbering.
pub const DREG_EAX: GdbRegister = GdbRegister(0);
pub const DREG_ECX: GdbRegister = GdbRegister(1);
pub const DREG_EDX: GdbRegister = GdbRegister(2);
pub const DREG_EBX: GdbRegister = GdbRegister(3);
pub const DREG_ESP: GdbRegister = GdbRegister(4);
pub const DREG_EBP: GdbRegister = GdbRegister(5);
pub const DREG_ESI: GdbRegister = GdbRegister(6);
pub const DREG_EDI: GdbRegister = GdbRegister(7);
pub const DREG_EIP: GdbRegister = GdbRegister(8);
pub const DREG_EFLAGS: GdbRegister = GdbRegister(9);
pub const DREG_CS: GdbRegister = GdbRegister(10);
pub const DREG_SS: GdbRegister = GdbRegister(11);
pub const DREG_DS: GdbRegister = GdbRegister(12);
pub const DREG_ES: GdbRegister = GdbRegister(13);
pub const DREG_FS: GdbRegister = GdbRegister(14);
pub const DREG_GS: GdbRegister = GdbRegister(15);
pub const DREG_ST0: GdbRegister = GdbRegister(16);
pub const DREG_MXCSR: GdbRegister = GdbRegister(40);
/// The pseudo-register the debugger uses to undo a syscall-in-progress
/// during restarts.
pub const DREG_ORIG_EAX: GdbRegister = GdbRegister(41);
pub const DREG_NUM_LINUX_I386: u32 = 42;

// x86-64 numbering.
pub const DREG_RAX: GdbRegister = GdbRegister(0);
pub const DREG_RBX: GdbRegister = GdbRegister(1);
pub const DREG_RCX: GdbRegister = GdbRegister(2);
pub const DREG_RDX: GdbRegister = GdbRegister(3);
pub const DREG_RSI: GdbRegister = GdbRegister(4);
pub const DREG_RDI: GdbRegister = GdbRegister(5);
pub const DREG_RBP: GdbRegister = GdbRegister(6);
pub const DREG_RSP: GdbRegister = GdbRegister(7);
pub const DREG_R8: GdbRegister = GdbRegister(8);
pub const DREG_R9: GdbRegister = GdbRegister(9);
pub const DREG_R10: GdbRegister = GdbRegister(10);
pub const DREG_R11: GdbRegister = GdbRegister(11);
pub const DREG_R12: GdbRegister = GdbRegister(12);
pub const DREG_R13: GdbRegister = GdbRegister(13);
pub const DREG_R14: GdbRegister = GdbRegister(14);
pub const DREG_R15: GdbRegister = GdbRegister(15);
pub const DREG_RIP: GdbRegister = GdbRegister(16);
pub const DREG_64_EFLAGS: GdbRegister = GdbRegister(17);
pub const DREG_64_CS: GdbRegister = GdbRegister(18);
pub const DREG_64_SS: GdbRegister = GdbRegister(19);
pub const DREG_64_DS: GdbRegister = GdbRegister(20);
pub const DREG_64_ES: GdbRegister = GdbRegister(21);
pub const DREG_64_FS: GdbRegister = GdbRegister(22);
pub const DREG_64_GS: GdbRegister = GdbRegister(23);
pub const DREG_64_ST0: GdbRegister = GdbRegister(24);
pub const DREG_64_XMM0: GdbRegister = GdbRegister(40);
pub const DREG_64_MXCSR: GdbRegister = GdbRegister(56);
/// See `DREG_ORIG_EAX`.
pub const DREG_ORIG_RAX: GdbRegister = GdbRegister(57);
pub const DREG_NUM_LINUX_X86_64: u32 = 58;
