use crate::remote_ptr::{RemotePtr, Void};
use crate::replay_timeline::FrameTime;
use std::cmp::min;
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};

/// The x86 `int3` instruction.
pub const BREAKPOINT_INSN: u8 = 0xCC;

/// How many hardware watchpoints the architecture can program (x86 debug
/// registers DR0-DR3).
const MAX_WATCHPOINTS: usize = 4;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum BreakpointType {
    BkptNone,
    /// Trap for internal replay-engine purposes, e.g. delivering async
    /// signals at the right instruction.
    BkptInternal,
    /// Trap on behalf of a debugger user.
    BkptUser,
}

/// NB: these random-looking enumeration values are chosen to match the
/// numbers programmed into x86 debug registers.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum WatchType {
    WatchExec = 0x00,
    WatchWrite = 0x01,
    WatchReadWrite = 0x03,
}

/// A distinct watchpoint, corresponding to the information needed to
/// program a single x86 debug register.
#[derive(Copy, Clone, Debug)]
pub struct WatchConfig {
    pub addr: RemotePtr<Void>,
    pub num_bytes: usize,
    pub type_: WatchType,
}

impl WatchConfig {
    pub fn new(addr: RemotePtr<Void>, num_bytes: usize, type_: WatchType) -> WatchConfig {
        WatchConfig {
            addr,
            num_bytes,
            type_,
        }
    }
}

/// A software breakpoint: the byte the `int3` replaced, plus per-type
/// reference counts so user and internal breakpoints at the same address
/// can coexist.
#[derive(Clone)]
struct Breakpoint {
    overwritten_data: u8,
    internal_count: u32,
    user_count: u32,
}

impl Breakpoint {
    fn count_for(&mut self, type_: BreakpointType) -> &mut u32 {
        match type_ {
            BreakpointType::BkptInternal => &mut self.internal_count,
            BreakpointType::BkptUser => &mut self.user_count,
            BreakpointType::BkptNone => unreachable!(),
        }
    }

    fn total(&self) -> u32 {
        self.internal_count + self.user_count
    }
}

/// The memory image of the debuggee's task group, with the breakpoint and
/// watchpoint tables layered on top of it.
///
/// Memory is a set of disjoint byte regions. Reads truncate at the first
/// unmapped byte; writes are all-or-nothing. Installed software breakpoints
/// patch `BREAKPOINT_INSN` into the image, exactly as the engine patches
/// the live tracee, so reads through `get-mem` must be overlaid with the
/// saved original bytes before the debugger sees them.
#[derive(Clone)]
pub struct AddressSpace {
    mem: BTreeMap<usize, Vec<u8>>,
    breakpoints: BTreeMap<RemotePtr<Void>, Breakpoint>,
    watchpoints: Vec<WatchConfig>,
    exe_image: OsString,
    execed: bool,
    first_run_event: FrameTime,
}

impl AddressSpace {
    pub fn new() -> AddressSpace {
        AddressSpace {
            mem: BTreeMap::new(),
            breakpoints: BTreeMap::new(),
            watchpoints: Vec::new(),
            exe_image: OsString::new(),
            execed: false,
            first_run_event: 0,
        }
    }

    /// Back `data.len()` bytes of the image starting at `addr`. Regions may
    /// not overlap.
    pub fn map_region(&mut self, addr: RemotePtr<Void>, data: Vec<u8>) {
        debug_assert!(self.region_containing(addr).is_none());
        self.mem.insert(addr.as_usize(), data);
    }

    fn region_containing(&self, addr: RemotePtr<Void>) -> Option<(usize, &Vec<u8>)> {
        let a = addr.as_usize();
        self.mem
            .range(..=a)
            .next_back()
            .filter(|(start, data)| a < *start + data.len())
            .map(|(start, data)| (*start, data))
    }

    /// Read up to `buf.len()` bytes at `addr`, stopping at the first
    /// unmapped byte. Returns how many bytes were read.
    pub fn read_bytes_fallible(&self, addr: RemotePtr<Void>, buf: &mut [u8]) -> usize {
        let mut nread = 0;
        while nread < buf.len() {
            let at = addr + nread;
            let (start, data) = match self.region_containing(at) {
                Some(r) => r,
                None => break,
            };
            let offset = at.as_usize() - start;
            let n = min(buf.len() - nread, data.len() - offset);
            buf[nread..nread + n].copy_from_slice(&data[offset..offset + n]);
            nread += n;
        }
        nread
    }

    /// Write `bytes` at `addr`. Fails, writing nothing, unless the whole
    /// range is mapped.
    pub fn write_bytes(&mut self, addr: RemotePtr<Void>, bytes: &[u8]) -> bool {
        let mut probe = vec![0u8; bytes.len()];
        if self.read_bytes_fallible(addr, &mut probe) < bytes.len() {
            return false;
        }
        let mut nwritten = 0;
        while nwritten < bytes.len() {
            let at = addr + nwritten;
            let a = at.as_usize();
            let (start, len) = {
                let (start, data) = self.region_containing(at).unwrap();
                (start, data.len())
            };
            let offset = a - start;
            let n = min(bytes.len() - nwritten, len - offset);
            let data = self.mem.get_mut(&start).unwrap();
            data[offset..offset + n].copy_from_slice(&bytes[nwritten..nwritten + n]);
            nwritten += n;
        }
        true
    }

    /// Ensure a breakpoint of `type_` is set at `addr`, patching the
    /// breakpoint instruction into the image. False if `addr` is unmapped.
    pub fn add_breakpoint(&mut self, addr: RemotePtr<Void>, type_: BreakpointType) -> bool {
        debug_assert_ne!(type_, BreakpointType::BkptNone);
        if !self.breakpoints.contains_key(&addr) {
            let mut original = [0u8; 1];
            if self.read_bytes_fallible(addr, &mut original) != 1 {
                return false;
            }
            if !self.write_bytes(addr, &[BREAKPOINT_INSN]) {
                return false;
            }
            self.breakpoints.insert(
                addr,
                Breakpoint {
                    overwritten_data: original[0],
                    internal_count: 0,
                    user_count: 0,
                },
            );
        }
        *self.breakpoints.get_mut(&addr).unwrap().count_for(type_) += 1;
        true
    }

    /// Remove a `type_` reference to the breakpoint at `addr`. When the last
    /// reference goes, the original byte is restored.
    pub fn remove_breakpoint(&mut self, addr: RemotePtr<Void>, type_: BreakpointType) {
        let destroy = match self.breakpoints.get_mut(&addr) {
            Some(bp) => {
                let count = bp.count_for(type_);
                debug_assert!(*count > 0);
                *count -= 1;
                bp.total() == 0
            }
            None => return,
        };
        if destroy {
            let bp = self.breakpoints.remove(&addr).unwrap();
            self.write_bytes(addr, &[bp.overwritten_data]);
        }
    }

    /// Destroy all breakpoints in this VM, regardless of their reference
    /// counts.
    pub fn remove_all_breakpoints(&mut self) {
        let addrs: Vec<RemotePtr<Void>> = self.breakpoints.keys().copied().collect();
        for addr in addrs {
            let bp = self.breakpoints.remove(&addr).unwrap();
            self.write_bytes(addr, &[bp.overwritten_data]);
        }
    }

    pub fn get_breakpoint_type_at_addr(&self, addr: RemotePtr<Void>) -> BreakpointType {
        match self.breakpoints.get(&addr) {
            Some(bp) if bp.user_count > 0 => BreakpointType::BkptUser,
            Some(_) => BreakpointType::BkptInternal,
            None => BreakpointType::BkptNone,
        }
    }

    /// `dest` holds the contents of tracee memory at `addr`. Replace the
    /// bytes that have been overwritten by breakpoint instructions with the
    /// original data, so the debugger sees the un-patched program.
    pub fn replace_breakpoints_with_original_values(
        &self,
        dest: &mut [u8],
        addr: RemotePtr<Void>,
    ) {
        for (&bp_addr, bp) in &self.breakpoints {
            let a = bp_addr.as_usize();
            if a >= addr.as_usize() && a < addr.as_usize() + dest.len() {
                dest[a - addr.as_usize()] = bp.overwritten_data;
            }
        }
    }

    /// Manage watchpoints. Analogous to the breakpoint methods above,
    /// except that watchpoints cover an address range and there are only as
    /// many slots as the hardware has debug registers.
    pub fn add_watchpoint(
        &mut self,
        addr: RemotePtr<Void>,
        num_bytes: usize,
        type_: WatchType,
    ) -> bool {
        if self.find_watchpoint(addr, num_bytes, type_).is_some() {
            return true;
        }
        if self.watchpoints.len() >= MAX_WATCHPOINTS {
            return false;
        }
        self.watchpoints
            .push(WatchConfig::new(addr, num_bytes, type_));
        true
    }

    pub fn remove_watchpoint(&mut self, addr: RemotePtr<Void>, num_bytes: usize, type_: WatchType) {
        if let Some(i) = self.find_watchpoint(addr, num_bytes, type_) {
            self.watchpoints.remove(i);
        }
    }

    pub fn remove_all_watchpoints(&mut self) {
        self.watchpoints.clear();
    }

    pub fn all_watchpoints(&self) -> &[WatchConfig] {
        &self.watchpoints
    }

    fn find_watchpoint(
        &self,
        addr: RemotePtr<Void>,
        num_bytes: usize,
        type_: WatchType,
    ) -> Option<usize> {
        self.watchpoints
            .iter()
            .position(|w| w.addr == addr && w.num_bytes == num_bytes && w.type_ == type_)
    }

    pub fn exe_image(&self) -> &OsStr {
        &self.exe_image
    }

    pub fn set_exe_image(&mut self, exe_image: &OsStr) {
        self.exe_image = exe_image.to_owned();
    }

    pub fn execed(&self) -> bool {
        self.execed
    }

    pub fn set_execed(&mut self) {
        self.execed = true;
    }

    /// The first event at which this address space ran. Reverse execution
    /// must not pass it.
    pub fn first_run_event(&self) -> FrameTime {
        self.first_run_event
    }

    pub fn set_first_run_event(&mut self, event: FrameTime) {
        self.first_run_event = event;
    }
}

impl Default for AddressSpace {
    fn default() -> AddressSpace {
        AddressSpace::new()
    }
}

#[cfg(test)]
mod test {
    use super::{AddressSpace, BreakpointType, WatchType, BREAKPOINT_INSN};
    use crate::remote_ptr::{RemotePtr, Void};

    fn vm_with_region() -> AddressSpace {
        let mut vm = AddressSpace::new();
        vm.map_region(RemotePtr::from_val(0x1000), (0..16).collect());
        vm
    }

    #[test]
    fn read_truncates_at_region_end() {
        let vm = vm_with_region();
        let mut buf = [0u8; 32];
        let nread = vm.read_bytes_fallible(RemotePtr::from_val(0x1008), &mut buf);
        assert_eq!(nread, 8);
        assert_eq!(&buf[0..8], &[8, 9, 10, 11, 12, 13, 14, 15]);
    }

    #[test]
    fn read_unmapped() {
        let vm = vm_with_region();
        let mut buf = [0u8; 4];
        assert_eq!(vm.read_bytes_fallible(RemotePtr::from_val(0x2000), &mut buf), 0);
    }

    #[test]
    fn write_requires_fully_mapped_range() {
        let mut vm = vm_with_region();
        assert!(vm.write_bytes(RemotePtr::from_val(0x1004), &[1, 2]));
        assert!(!vm.write_bytes(RemotePtr::from_val(0x100e), &[1, 2, 3, 4]));
        let mut buf = [0u8; 2];
        vm.read_bytes_fallible(RemotePtr::from_val(0x100e), &mut buf);
        // The failed write must not have touched the mapped prefix.
        assert_eq!(buf, [14, 15]);
    }

    #[test]
    fn breakpoint_patches_and_restores() {
        let mut vm = vm_with_region();
        let addr = RemotePtr::<Void>::from_val(0x1003);
        assert!(vm.add_breakpoint(addr, BreakpointType::BkptUser));

        let mut buf = [0u8; 1];
        vm.read_bytes_fallible(addr, &mut buf);
        assert_eq!(buf[0], BREAKPOINT_INSN);

        // The overlay shows the original byte.
        let mut window = [0u8; 8];
        vm.read_bytes_fallible(RemotePtr::from_val(0x1000), &mut window);
        vm.replace_breakpoints_with_original_values(&mut window, RemotePtr::from_val(0x1000));
        assert_eq!(window, [0, 1, 2, 3, 4, 5, 6, 7]);

        vm.remove_breakpoint(addr, BreakpointType::BkptUser);
        vm.read_bytes_fallible(addr, &mut buf);
        assert_eq!(buf[0], 3);
        assert_eq!(vm.get_breakpoint_type_at_addr(addr), BreakpointType::BkptNone);
    }

    #[test]
    fn breakpoint_refcounts_by_type() {
        let mut vm = vm_with_region();
        let addr = RemotePtr::<Void>::from_val(0x1000);
        assert!(vm.add_breakpoint(addr, BreakpointType::BkptUser));
        assert!(vm.add_breakpoint(addr, BreakpointType::BkptInternal));
        vm.remove_breakpoint(addr, BreakpointType::BkptInternal);
        // Still patched: the user reference remains.
        let mut buf = [0u8; 1];
        vm.read_bytes_fallible(addr, &mut buf);
        assert_eq!(buf[0], BREAKPOINT_INSN);
        assert_eq!(vm.get_breakpoint_type_at_addr(addr), BreakpointType::BkptUser);
        vm.remove_breakpoint(addr, BreakpointType::BkptUser);
        vm.read_bytes_fallible(addr, &mut buf);
        assert_eq!(buf[0], 0);
    }

    #[test]
    fn breakpoint_on_unmapped_addr_fails() {
        let mut vm = vm_with_region();
        assert!(!vm.add_breakpoint(RemotePtr::from_val(0x9000), BreakpointType::BkptUser));
    }

    #[test]
    fn watchpoint_slots_are_limited() {
        let mut vm = vm_with_region();
        for i in 0..4 {
            assert!(vm.add_watchpoint(
                RemotePtr::from_val(0x1000 + i),
                1,
                WatchType::WatchWrite
            ));
        }
        assert!(!vm.add_watchpoint(RemotePtr::from_val(0x1008), 1, WatchType::WatchWrite));
        vm.remove_watchpoint(RemotePtr::from_val(0x1000), 1, WatchType::WatchWrite);
        assert!(vm.add_watchpoint(RemotePtr::from_val(0x1008), 1, WatchType::WatchWrite));
        assert_eq!(vm.all_watchpoints().len(), 4);
    }
}
