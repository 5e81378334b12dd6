use crate::gdb_register::GdbRegister;
use crate::registers::MAX_REG_SIZE_BYTES;
use std::collections::BTreeMap;

/// Extended register state (FP, SSE and friends): registers the debugger
/// names by number but that live outside the general-purpose file. Queried
/// second when a register is not found in `Registers`.
#[derive(Clone, Default)]
pub struct ExtraRegisters {
    values: BTreeMap<GdbRegister, Vec<u8>>,
}

impl ExtraRegisters {
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
}

#[cfg(test)]
mod test {
    use super::ExtraRegisters;
    use crate::gdb_register::DREG_64_XMM0;
    use crate::registers::MAX_REG_SIZE_BYTES;

    #[test]
    fn wide_register() {
        let mut extra = ExtraRegisters::default();
        let value = [0xabu8; 16];
        extra.write_register(DREG_64_XMM0, &value);
        let mut buf = [0u8; MAX_REG_SIZE_BYTES];
        assert_eq!(extra.read_register(&mut buf, DREG_64_XMM0), Some(16));
        assert_eq!(buf, value);
    }
}
