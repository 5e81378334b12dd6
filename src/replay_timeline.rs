use crate::breakpoint_condition::BreakpointCondition;
use crate::extra_registers::ExtraRegisters;
use crate::registers::Registers;
use crate::remote_ptr::{RemotePtr, Void};
use crate::session::address_space::WatchType;
use crate::session::diversion_session::DiversionResult;
use crate::session::{BreakStatus, RunCommand, Session};
use crate::taskish_uid::TaskUid;
use std::fmt::{self, Display, Formatter};

/// A coarse logical timestamp within a recorded trace.
pub type FrameTime = u64;

/// Count of retired conditional branches, the engine's fine-grained
/// progress measure within one event.
pub type Ticks = u64;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum RunDirection {
    RunForward,
    RunBackward,
}

impl Default for RunDirection {
    fn default() -> Self {
        // Pick an arbitrary one
        RunDirection::RunForward
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ReplayStatus {
    /// Some replay was done. replay_step() can be called again.
    ReplayContinue,
    /// The replay reached the end of the trace.
    ReplayExited,
}

impl Default for ReplayStatus {
    fn default() -> Self {
        // Arbitrary
        ReplayStatus::ReplayContinue
    }
}

#[derive(Default)]
pub struct ReplayResult {
    pub status: ReplayStatus,
    pub break_status: BreakStatus,
}

/// An opaque handle identifying a precise point on the timeline.
///
/// Carries the trace-frame time and the register files captured at that
/// point, so a reverse-singlestep that lands on a known mark can answer the
/// debugger's register reads without the engine seeking at all. The engine
/// reference-counts the underlying state; clones of a Mark are clones of
/// the handle.
#[derive(Clone)]
pub struct Mark {
    id: u64,
    time: FrameTime,
    regs: Registers,
    extra_regs: ExtraRegisters,
}

impl Mark {
    pub fn new(id: u64, time: FrameTime, regs: Registers, extra_regs: ExtraRegisters) -> Mark {
        Mark {
            id,
            time,
            regs,
            extra_regs,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn time(&self) -> FrameTime {
        self.time
    }

    /// The values of the general-purpose registers at this mark.
    pub fn regs(&self) -> &Registers {
        &self.regs
    }

    pub fn extra_regs(&self) -> &ExtraRegisters {
        &self.extra_regs
    }
}

impl PartialEq for Mark {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Mark {}

impl Display for Mark {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "mark:{}@{}", self.id, self.time)
    }
}

/// The time-travel engine: a set of replay sessions of the same recording,
/// with an API for stepping the current one in either direction, managing
/// checkpoints, and navigating to specific points.
///
/// The control core drives this trait and owns nothing of the engine's
/// internals; breakpoint and watchpoint state installed through it is
/// canonical and survives seeks in either direction.
pub trait ReplayTimeline {
    fn current_session(&self) -> &Session;

    fn current_session_mut(&mut self) -> &mut Session;

    /// Take one step in the current replay session: run `command` in
    /// `direction`. A forward step stops early when `stop_at_time` (nonzero)
    /// is reached. `interrupt_check` is polled during long steps; returning
    /// true aborts the step at the next opportunity.
    fn replay_step(
        &mut self,
        command: RunCommand,
        direction: RunDirection,
        stop_at_time: FrameTime,
        interrupt_check: Option<&mut dyn FnMut() -> bool>,
    ) -> ReplayResult;

    /// Run `command` in the diversion `session` (which this timeline
    /// cloned), resuming task `tuid`.
    fn diversion_step(
        &mut self,
        session: &mut Session,
        tuid: TaskUid,
        command: RunCommand,
        signal_to_deliver: i32,
    ) -> DiversionResult;

    /// A mark for the current point; cheap if one already exists.
    fn mark(&mut self) -> Mark;

    /// If the result of a reverse-singlestep of `tuid` from `from` is
    /// already known, return its mark without moving the session.
    fn lazy_reverse_singlestep(&mut self, from: &Mark, tuid: TaskUid) -> Option<Mark>;

    fn seek_to_mark(&mut self, mark: &Mark);

    /// Seek so that replaying forward will reach `time`, positioned just
    /// before it.
    fn seek_to_before_event(&mut self, time: FrameTime);

    /// Checkpoints can only be added at some points (e.g. not mid-syscall).
    fn can_add_checkpoint(&self) -> bool;

    fn add_explicit_checkpoint(&mut self) -> Mark;

    fn remove_explicit_checkpoint(&mut self, mark: &Mark);

    fn add_breakpoint(
        &mut self,
        tuid: TaskUid,
        addr: RemotePtr<Void>,
        condition: Option<Box<dyn BreakpointCondition>>,
    ) -> bool;

    fn remove_breakpoint(&mut self, tuid: TaskUid, addr: RemotePtr<Void>);

    fn add_watchpoint(
        &mut self,
        tuid: TaskUid,
        addr: RemotePtr<Void>,
        num_bytes: usize,
        type_: WatchType,
        condition: Option<Box<dyn BreakpointCondition>>,
    ) -> bool;

    fn remove_watchpoint(
        &mut self,
        tuid: TaskUid,
        addr: RemotePtr<Void>,
        num_bytes: usize,
        type_: WatchType,
    );

    fn remove_breakpoints_and_watchpoints(&mut self);

    /// Ensure installed breakpoints and watchpoints are applied to the
    /// current session's address space, so a clone taken now inherits them.
    fn apply_breakpoints_and_watchpoints(&mut self);

    /// Reverse execution will not proceed before `event`.
    fn set_reverse_execution_barrier_event(&mut self, event: FrameTime);
}
