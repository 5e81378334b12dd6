pub mod address_space;
pub mod diversion_session;
pub mod task;

use crate::replay_timeline::FrameTime;
use crate::session::address_space::{AddressSpace, WatchConfig};
use crate::session::task::Task;
use crate::taskish_uid::{TaskUid, ThreadGroupUid};
use libc::pid_t;
use std::collections::BTreeMap;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SessionKind {
    /// Deterministic re-execution of the recorded trace. Only the engine
    /// may mutate it; arbitrary writes would cause divergence.
    Replay,
    /// A throwaway clone of a replay session that the debugger may mutate
    /// freely, used for inferior function calls.
    Diversion,
}

/// The tasks of one point-in-time of the debuggee, plus the memory image
/// they share.
///
/// Tasks are arena-owned here and referenced by `TaskUid` everywhere else;
/// the engine destroys and recreates them as it seeks, so holders of a uid
/// re-resolve after every step. A single address space suffices because
/// only one task group is ever the debuggee.
pub struct Session {
    kind: SessionKind,
    tasks: BTreeMap<TaskUid, Task>,
    vm: AddressSpace,
    current_task: Option<TaskUid>,
    trace_time: FrameTime,
    done_initial_exec: bool,
}

impl Session {
    pub fn new(kind: SessionKind) -> Session {
        Session {
            kind,
            tasks: BTreeMap::new(),
            vm: AddressSpace::new(),
            current_task: None,
            trace_time: 0,
            done_initial_exec: false,
        }
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn is_replay(&self) -> bool {
        self.kind == SessionKind::Replay
    }

    pub fn is_diversion(&self) -> bool {
        self.kind == SessionKind::Diversion
    }

    /// The trace frame this session is working towards.
    pub fn trace_time(&self) -> FrameTime {
        self.trace_time
    }

    pub fn set_trace_time(&mut self, time: FrameTime) {
        self.trace_time = time;
    }

    pub fn current_task(&self) -> Option<TaskUid> {
        self.current_task
    }

    pub fn set_current_task(&mut self, tuid: Option<TaskUid>) {
        self.current_task = tuid;
    }

    pub fn task(&self, tuid: TaskUid) -> Option<&Task> {
        self.tasks.get(&tuid)
    }

    pub fn task_mut(&mut self, tuid: TaskUid) -> Option<&mut Task> {
        self.tasks.get_mut(&tuid)
    }

    pub fn find_task_from_rec_tid(&self, rec_tid: pid_t) -> Option<&Task> {
        self.tasks.values().find(|t| t.rec_tid() == rec_tid)
    }

    pub fn tasks(&self) -> &BTreeMap<TaskUid, Task> {
        &self.tasks
    }

    pub fn add_task(&mut self, t: Task) {
        if self.current_task.is_none() {
            self.current_task = Some(t.tuid());
        }
        self.tasks.insert(t.tuid(), t);
    }

    pub fn remove_task(&mut self, tuid: TaskUid) {
        self.tasks.remove(&tuid);
        if self.current_task == Some(tuid) {
            self.current_task = None;
        }
    }

    /// How many live tasks share `tguid`.
    pub fn task_group_size(&self, tguid: ThreadGroupUid) -> usize {
        self.tasks.values().filter(|t| t.tguid() == tguid).count()
    }

    pub fn kill_all_tasks(&mut self) {
        self.tasks.clear();
        self.current_task = None;
    }

    pub fn vm(&self) -> &AddressSpace {
        &self.vm
    }

    pub fn vm_mut(&mut self) -> &mut AddressSpace {
        &mut self.vm
    }

    /// False until the initial fork child has execed the real debuggee
    /// image. No one ever wants to attach a debugger before that.
    pub fn done_initial_exec(&self) -> bool {
        self.done_initial_exec
    }

    pub fn set_done_initial_exec(&mut self) {
        self.done_initial_exec = true;
    }
}

/// Why a replay or diversion step stopped. Multiple reasons can apply
/// simultaneously, except that at most one of `breakpoint_hit` and
/// `singlestep_complete` is set per stop.
#[derive(Clone, Default)]
pub struct BreakStatus {
    /// The triggering task. May differ from the session's current task when
    /// the engine switches tasks as a step ends.
    pub task: Option<TaskUid>,
    /// Watchpoints hit; any hit stops after the triggering instruction has
    /// completed.
    pub watchpoints_hit: Vec<WatchConfig>,
    /// Nonzero when we stopped because this signal was delivered to `task`.
    pub signal: i32,
    /// True when we stopped on a software breakpoint at `task`'s ip.
    pub breakpoint_hit: bool,
    /// True when we stopped because a singlestep completed in `task`.
    pub singlestep_complete: bool,
    /// True when we stopped because `task` is about to exit.
    pub task_exit: bool,
}

impl BreakStatus {
    pub fn new() -> BreakStatus {
        Default::default()
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum RunCommand {
    /// Continue until we hit a breakpoint or a new replay event.
    Continue,
    /// Execute a single instruction (unless at a breakpoint or a replay
    /// event).
    Singlestep,
}

impl Default for RunCommand {
    fn default() -> Self {
        // Arbitrary
        RunCommand::Continue
    }
}
