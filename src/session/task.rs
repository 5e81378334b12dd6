use crate::extra_registers::ExtraRegisters;
use crate::registers::{Registers, SupportedArch};
use crate::replay_timeline::Ticks;
use crate::taskish_uid::{TaskUid, ThreadGroupUid};
use libc::pid_t;

/// One thread of the debuggee, as the control core sees it: identity,
/// register state, and the last signal it stopped for.
///
/// Execution state lives with the replay engine. Tasks can be destroyed and
/// recreated as the engine seeks around the timeline, so the core never
/// holds a `&Task` across a step; it keeps the `TaskUid` and re-resolves.
#[derive(Clone)]
pub struct Task {
    tuid: TaskUid,
    tguid: ThreadGroupUid,
    /// The pid of the live process actually hosting this task during
    /// replay, for /proc lookups. Distinct from `tguid.tid()`, which is the
    /// recorded pid.
    real_tgid: pid_t,
    name: String,
    regs: Registers,
    extra_regs: ExtraRegisters,
    ticks: Ticks,
    last_sig: i32,
}

impl Task {
    pub fn new(
        tuid: TaskUid,
        tguid: ThreadGroupUid,
        real_tgid: pid_t,
        name: &str,
        arch: SupportedArch,
    ) -> Task {
        Task {
            tuid,
            tguid,
            real_tgid,
            name: name.to_owned(),
            regs: Registers::new(arch),
            extra_regs: Default::default(),
            ticks: 0,
            last_sig: 0,
        }
    }

    pub fn tuid(&self) -> TaskUid {
        self.tuid
    }

    pub fn tguid(&self) -> ThreadGroupUid {
        self.tguid
    }

    /// The recorded tid, which is what the debugger knows this task by.
    pub fn rec_tid(&self) -> pid_t {
        self.tuid.tid()
    }

    /// The recorded pid of the thread group.
    pub fn tgid(&self) -> pid_t {
        self.tguid.tid()
    }

    pub fn real_tgid(&self) -> pid_t {
        self.real_tgid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arch(&self) -> SupportedArch {
        self.regs.arch()
    }

    pub fn regs(&self) -> &Registers {
        &self.regs
    }

    pub fn regs_mut(&mut self) -> &mut Registers {
        &mut self.regs
    }

    pub fn extra_regs(&self) -> &ExtraRegisters {
        &self.extra_regs
    }

    pub fn extra_regs_mut(&mut self) -> &mut ExtraRegisters {
        &mut self.extra_regs
    }

    pub fn tick_count(&self) -> Ticks {
        self.ticks
    }

    pub fn set_tick_count(&mut self, ticks: Ticks) {
        self.ticks = ticks;
    }

    /// The signal the task last stopped for, or zero.
    pub fn last_sig(&self) -> i32 {
        self.last_sig
    }

    pub fn set_last_sig(&mut self, sig: i32) {
        self.last_sig = sig;
    }
}
