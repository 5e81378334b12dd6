use crate::gdb_register::*;
use std::collections::BTreeMap;
use std::io::{self, Write};

/// The architectures the debuggee can have been recorded on.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SupportedArch {
    X86,
    X64,
}

/// The largest value the debugger can name with a single register number.
pub const MAX_REG_SIZE_BYTES: usize = 16;

/// A general-purpose register file, keyed by debugger register number.
///
/// The architecture codec proper (mapping register numbers onto a ptrace
/// user area) lives with the replay engine; as far as the control core is
/// concerned a register either has recorded bytes or is undefined.
#[derive(Clone)]
pub struct Registers {
    arch: SupportedArch,
    values: BTreeMap<GdbRegister, Vec<u8>>,
}

impl Registers {
    pub fn new(arch: SupportedArch) -> Registers {
        Registers {
            arch,
            values: BTreeMap::new(),
        }
    }

    pub fn arch(&self) -> SupportedArch {
        self.arch
    }

    /// How many registers the debugger believes this architecture has.
    pub fn total_registers(&self) -> u32 {
        match self.arch {
            SupportedArch::X86 => DREG_NUM_LINUX_I386,
            SupportedArch::X64 => DREG_NUM_LINUX_X86_64,
        }
    }

    /// Copy the value of `regname` into `buf` and return its size, or None
    /// if the register has no recorded value. `buf` must be large enough
    /// for the largest register.
    pub fn read_register(&self, buf: &mut [u8], regname: GdbRegister) -> Option<usize> {
        match self.values.get(&regname) {
            Some(bytes) => {
                debug_assert!(buf.len() >= bytes.len());
                buf[0..bytes.len()].copy_from_slice(bytes);
                Some(bytes.len())
            }
            None => None,
        }
    }

    pub fn write_register(&mut self, regname: GdbRegister, value: &[u8]) {
        debug_assert!(value.len() <= MAX_REG_SIZE_BYTES);
        self.values.insert(regname, value.to_owned());
    }

    /// One-line dump used by the per-instruction stepping diagnostic.
    pub fn write_register_file_compact(&self, out: &mut dyn Write) -> io::Result<()> {
        let mut first = true;
        for (reg, bytes) in &self.values {
            if !first {
                write!(out, " ")?;
            }
            first = false;
            let mut value: u128 = 0;
            for &b in bytes.iter().rev() {
                value = (value << 8) | u128::from(b);
            }
            write!(out, "{}:{:#x}", reg, value)?;
        }
        Ok(())
    }
}

impl Default for Registers {
    fn default() -> Registers {
        Registers::new(SupportedArch::X64)
    }
}
