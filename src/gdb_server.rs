//! The debugger-facing control core: translates requests arriving on a
//! `GdbConnection` into operations on a `ReplayTimeline`, reports stops
//! back, runs diversion sessions for inferior function calls, and owns the
//! checkpoint map and restart semantics.

use crate::breakpoint_condition::BreakpointCondition;
use crate::extra_registers::ExtraRegisters;
use crate::gdb_connection::{
    GdbActionType, GdbConnection, GdbConnectionAcceptor, GdbConnectionFeatures, GdbContAction,
    GdbRegisterValue, GdbRequest, GdbRequestType, GdbRestartType, GdbThreadId,
};
use crate::gdb_expression::{GdbExpression, GdbExpressionValue};
use crate::gdb_register::{DREG_ORIG_EAX, DREG_ORIG_RAX, GdbRegister};
use crate::registers::{Registers, SupportedArch};
use crate::remote_ptr::{RemotePtr, Void};
use crate::replay_timeline::{
    FrameTime, Mark, ReplayStatus, ReplayTimeline, RunDirection,
};
use crate::scoped_fd::ScopedFd;
use crate::session::address_space::{
    AddressSpace, BreakpointType, WatchType, BREAKPOINT_INSN,
};
use crate::session::diversion_session::DiversionStatus;
use crate::session::task::Task;
use crate::session::{BreakStatus, RunCommand, Session};
use crate::taskish_uid::{TaskUid, ThreadGroupUid};
use crate::util::{open_socket, trace_instructions_up_to_event, u8_slice, ProbePort};
use crate::log::{LogDebug, LogError, LogInfo, LogWarn};
use libc::{pid_t, SIGKILL, SIGTRAP};
use nix::unistd::{getpid, read, write};
use static_assertions::const_assert_eq;
use std::collections::BTreeMap;
use std::convert::TryInto;
use std::ffi::OsStr;
use std::io::stderr;
use std::mem;

const LOCALHOST_ADDR: &str = "127.0.0.1";

/// 32-bit writes to DBG_COMMAND_MAGIC_ADDRESS by the debugger trigger
/// out-of-band commands.
const DBG_COMMAND_MAGIC_ADDRESS: usize = 29298;

/// The high-order byte of the 32-bit value indicates the specific command
/// message. Not-understood command messages are ignored.
const DBG_COMMAND_MSG_MASK: u32 = 0xFF00_0000;
/// Create a checkpoint of the current state whose index is given by the
/// command parameter. If there is already a checkpoint with that index, it
/// is deleted first.
const DBG_COMMAND_MSG_CREATE_CHECKPOINT: u32 = 0x0100_0000;
/// Delete the checkpoint of the current state whose index is given by the
/// command parameter.
const DBG_COMMAND_MSG_DELETE_CHECKPOINT: u32 = 0x0200_0000;

const DBG_COMMAND_PARAMETER_MASK: u32 = 0x00FF_FFFF;

/// 64-bit reads from DBG_WHEN_MAGIC_ADDRESS return the current trace
/// frame's event number (the event we're working towards).
const DBG_WHEN_MAGIC_ADDRESS: usize = DBG_COMMAND_MAGIC_ADDRESS + 4;

const_assert_eq!(DBG_WHEN_MAGIC_ADDRESS, 29302);

// Special-sauce macros defined for the debugger client, which implement
// functionality outside of the remote protocol. (Don't stare at them too
// long or you'll go blind ;).)
//
// See the constants above for the origin of the magic values below.
static GDB_MACROS: &str = r#"define checkpoint
  init-if-undefined $_next_checkpoint_index = 1
  p (*(int*)29298 = 0x01000000 | $_next_checkpoint_index), $_next_checkpoint_index++
end
define delete checkpoint
  p (*(int*)29298 = 0x02000000 | $arg0), $arg0
end
define restart
  run c$arg0
end
define when
  p *(long long int*)(29298 + 4)
end
define hook-run
  if $_thread != 0 && !$suppress_run_hook
    stepi
  end
end
define hookpost-continue
  set $suppress_run_hook = 1
end
define hookpost-step
  set $suppress_run_hook = 1
end
define hookpost-stepi
  set $suppress_run_hook = 1
end
define hookpost-next
  set $suppress_run_hook = 1
end
define hookpost-nexti
  set $suppress_run_hook = 1
end
define hookpost-finish
  set $suppress_run_hook = 1
end
define hookpost-reverse-continue
  set $suppress_run_hook = 1
end
define hookpost-reverse-step
  set $suppress_run_hook = 1
end
define hookpost-reverse-stepi
  set $suppress_run_hook = 1
end
define hookpost-reverse-finish
  set $suppress_run_hook = 1
end
define hookpost-run
  set $suppress_run_hook = 0
end
set target-async 0
maint set target-async 0
handle SIGURG stop
"#;

/// Where the user asked the replay to go before attaching the debugger.
#[derive(Clone)]
pub struct Target {
    /// Target process to debug, or `None` to just debug the first process.
    pub pid: Option<pid_t>,
    /// If true, wait for the target process to exec() before attaching.
    pub require_exec: bool,
    /// Wait until at least `event` has elapsed before attaching.
    pub event: FrameTime,
}

impl Target {
    pub fn new() -> Target {
        Target {
            pid: None,
            require_exec: false,
            event: 0,
        }
    }
}

impl Default for Target {
    fn default() -> Target {
        Target::new()
    }
}

pub struct ConnectionFlags {
    /// `None` to let the server choose the port, a specific port to
    /// listen on otherwise.
    pub dbg_port: Option<u16>,
    pub dbg_host: String,
    /// If set, the server writes its connection parameters through this
    /// pipe once the socket is bound, then closes it. The launcher holds
    /// the other end.
    pub debugger_params_write_pipe: Option<ScopedFd>,
}

impl Default for ConnectionFlags {
    fn default() -> ConnectionFlags {
        ConnectionFlags {
            dbg_port: None,
            dbg_host: LOCALHOST_ADDR.to_owned(),
            debugger_params_write_pipe: None,
        }
    }
}

/// The fixed-layout record sent down the params pipe.
#[repr(C)]
pub struct DebuggerParams {
    pub exe_image: [u8; libc::PATH_MAX as usize],
    /// INET_ADDRSTRLEN
    pub host: [u8; 16],
    pub port: u16,
}

impl Default for DebuggerParams {
    fn default() -> Self {
        unsafe { mem::zeroed() }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ReportState {
    ReportNormal,
    ReportThreadsDead,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ContinueOrStop {
    ContinueDebugging,
    StopDebugging,
}

impl Default for ContinueOrStop {
    fn default() -> Self {
        // Purely arbitrary
        ContinueOrStop::ContinueDebugging
    }
}

/// Which of the sessions the server can see a request should be served
/// against. Resolved to a `&Session` at the last moment; holding handles
/// rather than references keeps the borrow checker out of the dispatcher.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum SessionRef {
    Timeline,
    Diversion,
    Emergency,
}

/// A live diversion and the READ_SIGINFO/WRITE_SIGINFO bracket depth that
/// keeps it alive. The refcount is a logical bracket, not a memory-
/// management device.
struct DiversionState {
    session: Session,
    refcount: u32,
}

pub struct GdbServer {
    target: Target,
    /// None until the debugger connection is established; never changes
    /// after that.
    dbg: Option<Box<dyn GdbConnection>>,
    /// The timeline being debugged, or None for an emergency server.
    timeline: Option<Box<dyn ReplayTimeline>>,
    /// The crashed session an emergency server serves instead.
    emergency_session: Option<Session>,
    /// Live only while `divert` runs.
    diversion: Option<DiversionState>,
    /// When dbg is attached, the thread group being debugged. Never changes
    /// once the connection is established; we don't support switching the
    /// debugger between processes.
    debuggee_tguid: ThreadGroupUid,
    /// The implicit mark the `restart` command without arguments rewinds
    /// to. Exactly one exists while a debugger is attached.
    debugger_restart_mark: Option<Mark>,
    /// User checkpoints, indexed by the 24-bit id chosen through the
    /// back-channel. BTreeMap so listings come out sorted.
    checkpoints: BTreeMap<u32, Mark>,
    /// True when the user has interrupted replaying to a target event.
    stop_replaying_to_target: bool,
}

impl GdbServer {
    /// Create a server serving the replay managed by `timeline`.
    pub fn new(timeline: Box<dyn ReplayTimeline>, target: Target) -> GdbServer {
        GdbServer {
            target,
            dbg: None,
            timeline: Some(timeline),
            emergency_session: None,
            diversion: None,
            debuggee_tguid: Default::default(),
            debugger_restart_mark: None,
            checkpoints: BTreeMap::new(),
            stop_replaying_to_target: false,
        }
    }

    fn new_from(dbg: Box<dyn GdbConnection>, session: Session, tuid: TaskUid) -> GdbServer {
        let debuggee_tguid = session
            .task(tuid)
            .map(|t| t.tguid())
            .unwrap_or_default();
        GdbServer {
            target: Default::default(),
            dbg: Some(dbg),
            timeline: None,
            emergency_session: Some(session),
            diversion: None,
            debuggee_tguid,
            debugger_restart_mark: None,
            checkpoints: BTreeMap::new(),
            stop_replaying_to_target: false,
        }
    }

    /// A string containing the init script we hand to the debugger client.
    /// The back-channel addresses baked into it are part of the observable
    /// contract; emit it byte-for-byte.
    pub fn init_script() -> &'static str {
        GDB_MACROS
    }

    /// Called from a signal handler during serve_replay, this interrupts
    /// the replay-to-target phase so debugging starts wherever the replay
    /// happens to be.
    pub fn interrupt_replay_to_target(&mut self) {
        self.stop_replaying_to_target = true;
    }

    fn dbg_unwrap(&self) -> &dyn GdbConnection {
        &**self.dbg.as_ref().unwrap()
    }

    fn dbg_unwrap_mut(&mut self) -> &mut dyn GdbConnection {
        &mut **self.dbg.as_mut().unwrap()
    }

    fn timeline_is_running(&self) -> bool {
        self.timeline.is_some()
    }

    fn timeline_unwrap(&self) -> &dyn ReplayTimeline {
        &**self.timeline.as_ref().unwrap()
    }

    fn timeline_unwrap_mut(&mut self) -> &mut dyn ReplayTimeline {
        &mut **self.timeline.as_mut().unwrap()
    }

    fn session(&self, which: SessionRef) -> &Session {
        match which {
            SessionRef::Timeline => self.timeline_unwrap().current_session(),
            SessionRef::Diversion => &self.diversion.as_ref().unwrap().session,
            SessionRef::Emergency => self.emergency_session.as_ref().unwrap(),
        }
    }

    fn session_mut(&mut self, which: SessionRef) -> &mut Session {
        match which {
            SessionRef::Timeline => self.timeline_unwrap_mut().current_session_mut(),
            SessionRef::Diversion => &mut self.diversion.as_mut().unwrap().session,
            SessionRef::Emergency => self.emergency_session.as_mut().unwrap(),
        }
    }

    fn current_session_ref(&self) -> SessionRef {
        if self.diversion.is_some() {
            SessionRef::Diversion
        } else if self.timeline_is_running() {
            SessionRef::Timeline
        } else {
            SessionRef::Emergency
        }
    }

    /// Checkpoint create/delete arrives as a 32-bit write to the command
    /// address: high byte selects the command, low 24 bits carry the
    /// parameter. True if the write was consumed (and replied to) here.
    fn maybe_process_magic_command(&mut self, req: &GdbRequest) -> bool {
        if !(req.mem().addr.as_usize() == DBG_COMMAND_MAGIC_ADDRESS && req.mem().len == 4) {
            return false;
        }
        if req.mem().data.len() < 4 || !self.timeline_is_running() {
            return false;
        }
        let cmd = u32::from_le_bytes(req.mem().data[0..4].try_into().unwrap());
        let param = cmd & DBG_COMMAND_PARAMETER_MASK;
        match cmd & DBG_COMMAND_MSG_MASK {
            DBG_COMMAND_MSG_CREATE_CHECKPOINT => {
                if self.timeline_unwrap().can_add_checkpoint() {
                    if let Some(old) = self.checkpoints.remove(&param) {
                        self.timeline_unwrap_mut().remove_explicit_checkpoint(&old);
                    }
                    let mark = self.timeline_unwrap_mut().add_explicit_checkpoint();
                    self.checkpoints.insert(param, mark);
                }
            }
            DBG_COMMAND_MSG_DELETE_CHECKPOINT => {
                if let Some(mark) = self.checkpoints.remove(&param) {
                    self.timeline_unwrap_mut().remove_explicit_checkpoint(&mark);
                }
            }
            _ => return false,
        }
        self.dbg_unwrap_mut().reply_set_mem(true);
        true
    }

    /// 64-bit reads from the "when" address report the current trace-frame
    /// event number, or -1 when the current session is not a replay.
    fn maybe_process_magic_read(&mut self, which: SessionRef, req: &GdbRequest) -> bool {
        if req.mem().addr.as_usize() == DBG_WHEN_MAGIC_ADDRESS && req.mem().len == 8 {
            let when: i64 = if self.session(which).is_replay() {
                self.session(which).trace_time() as i64
            } else {
                -1
            };
            self.dbg_unwrap_mut().reply_get_mem(&when.to_le_bytes());
            return true;
        }
        false
    }

    /// Process the single debugger request `req` against the session
    /// `which`. Callers implement any special semantics they want for
    /// particular requests before calling this helper.
    fn dispatch_debugger_request(
        &mut self,
        which: SessionRef,
        t: Option<TaskUid>,
        req: &GdbRequest,
        state: ReportState,
    ) {
        debug_assert!(!req.is_resume_request());

        // These requests don't require a target task.
        match req.type_ {
            GdbRequestType::Restart => {
                fatal!("Can't handle RESTART request from here");
            }
            GdbRequestType::GetCurrentThread => {
                let threadid = self.threadid_for(which, t);
                self.dbg_unwrap_mut().reply_get_current_thread(threadid);
                return;
            }
            GdbRequestType::GetOffsets => {
                // No dynamic relocation of the image; the offsets are empty.
                self.dbg_unwrap_mut().reply_get_offsets();
                return;
            }
            GdbRequestType::GetThreadList => {
                let mut tids: Vec<GdbThreadId> = Vec::new();
                if state != ReportState::ReportThreadsDead {
                    for task in self.session(which).tasks().values() {
                        tids.push(get_threadid(task));
                    }
                }
                self.dbg_unwrap_mut().reply_get_thread_list(&tids);
                return;
            }
            GdbRequestType::Interrupt => {
                // Tell the debugger we stopped and await further
                // instructions.
                let threadid = self.threadid_for(which, t);
                self.dbg_unwrap_mut()
                    .notify_stop(threadid, 0, RemotePtr::null());
                return;
            }
            _ => (),
        }

        let maybe_target: Option<TaskUid> = if req.target.tid > 0 {
            self.session(which)
                .find_task_from_rec_tid(req.target.tid)
                .map(|task| task.tuid())
        } else {
            t.filter(|&tuid| self.session(which).task(tuid).is_some())
        };

        // These requests query or manipulate which task is the target, so
        // it's OK if the task doesn't exist.
        match req.type_ {
            GdbRequestType::GetIsThreadAlive => {
                self.dbg_unwrap_mut()
                    .reply_get_is_thread_alive(maybe_target.is_some());
                return;
            }
            GdbRequestType::SetContinueThread | GdbRequestType::SetQueryThread => {
                self.dbg_unwrap_mut()
                    .reply_select_thread(maybe_target.is_some());
                return;
            }
            _ => (),
        }

        // These requests require a valid target task. We don't trust the
        // debugger to use the information provided above to only query
        // valid tasks.
        let target = match maybe_target {
            Some(target) => target,
            None => {
                self.dbg_unwrap_mut().notify_no_such_thread(req);
                return;
            }
        };
        match req.type_ {
            GdbRequestType::GetThreadExtraInfo => {
                let name = self.session(which).task(target).unwrap().name().to_owned();
                self.dbg_unwrap_mut().reply_get_thread_extra_info(&name);
            }
            GdbRequestType::GetAuxv => {
                let real_tgid = self.session(which).task(target).unwrap().real_tgid();
                let auxv = read_auxv(real_tgid);
                self.dbg_unwrap_mut().reply_get_auxv(&auxv);
            }
            GdbRequestType::GetMem => {
                if self.maybe_process_magic_read(which, req) {
                    return;
                }
                let mem = {
                    let session = self.session(which);
                    let mut mem = vec![0u8; req.mem().len];
                    let nread = session.vm().read_bytes_fallible(req.mem().addr, &mut mem);
                    mem.truncate(nread);
                    session
                        .vm()
                        .replace_breakpoints_with_original_values(&mut mem, req.mem().addr);
                    mem
                };
                self.dbg_unwrap_mut().reply_get_mem(&mem);
            }
            GdbRequestType::SetMem => {
                // The debugger has been observed to send requests of length
                // 0 at odd times (e.g. before sending the magic write to
                // create a checkpoint).
                if req.mem().len == 0 {
                    self.dbg_unwrap_mut().reply_set_mem(true);
                    return;
                }
                if self.maybe_process_magic_command(req) {
                    return;
                }
                // We only allow the debugger to write memory if the memory
                // will be written to a diversion session. Arbitrary writes
                // to replay sessions cause divergence.
                if !self.session(which).is_diversion() {
                    log!(LogError, "Attempt to write memory outside diversion session");
                    self.dbg_unwrap_mut().reply_set_mem(false);
                    return;
                }
                log!(
                    LogDebug,
                    "Writing {} bytes to {}",
                    req.mem().len,
                    req.mem().addr
                );
                let ok = self
                    .session_mut(which)
                    .vm_mut()
                    .write_bytes(req.mem().addr, &req.mem().data);
                self.dbg_unwrap_mut().reply_set_mem(ok);
            }
            GdbRequestType::GetReg => {
                let reg = {
                    let task = self.session(which).task(target).unwrap();
                    get_reg(task.regs(), task.extra_regs(), req.reg().name)
                };
                self.dbg_unwrap_mut().reply_get_reg(&reg);
            }
            GdbRequestType::GetRegs => {
                let file = {
                    let task = self.session(which).task(target).unwrap();
                    register_file(task.regs(), task.extra_regs())
                };
                self.dbg_unwrap_mut().reply_get_regs(&file);
            }
            GdbRequestType::SetReg => {
                if !self.session(which).is_diversion() {
                    // The debugger sets orig_eax to -1 during a restart. For
                    // a replay session this is not correct (we might be
                    // restarting from a checkpoint inside a system call, and
                    // we must not tamper with replay state), so just ignore
                    // it.
                    let arch = self.session(which).task(target).unwrap().arch();
                    if (arch == SupportedArch::X86 && req.reg().name == DREG_ORIG_EAX)
                        || (arch == SupportedArch::X64 && req.reg().name == DREG_ORIG_RAX)
                    {
                        self.dbg_unwrap_mut().reply_set_reg(true);
                        return;
                    }
                    log!(
                        LogError,
                        "Attempt to write register outside diversion session"
                    );
                    self.dbg_unwrap_mut().reply_set_reg(false);
                    return;
                }
                if req.reg().defined {
                    let reg = req.reg().clone();
                    let task = self.session_mut(which).task_mut(target).unwrap();
                    task.regs_mut().write_register(reg.name, reg.bytes());
                }
                self.dbg_unwrap_mut()
                    .reply_set_reg(true /* currently infallible */);
            }
            GdbRequestType::GetStopReason => {
                let (threadid, sig) = {
                    let task = self.session(which).task(target).unwrap();
                    (get_threadid(task), task.last_sig())
                };
                self.dbg_unwrap_mut().reply_get_stop_reason(threadid, sig);
            }
            GdbRequestType::SetSwBreak => {
                {
                    let task = self.session(which).task(target).unwrap();
                    ed_assert!(
                        task,
                        req.watch().kind as usize == mem::size_of_val(&BREAKPOINT_INSN),
                        "Debugger setting bad breakpoint insn"
                    );
                }
                let ok = self.install_breakpoint(which, target, req);
                self.dbg_unwrap_mut().reply_watchpoint_request(ok);
            }
            GdbRequestType::SetHwBreak
            | GdbRequestType::SetRdWatch
            | GdbRequestType::SetWrWatch
            | GdbRequestType::SetRdWrWatch => {
                let ok = self.install_watchpoint(which, target, req);
                self.dbg_unwrap_mut().reply_watchpoint_request(ok);
            }
            GdbRequestType::RemoveSwBreak => {
                self.uninstall_breakpoint(which, target, req);
                self.dbg_unwrap_mut().reply_watchpoint_request(true);
            }
            GdbRequestType::RemoveHwBreak
            | GdbRequestType::RemoveRdWatch
            | GdbRequestType::RemoveWrWatch
            | GdbRequestType::RemoveRdWrWatch => {
                self.uninstall_watchpoint(which, target, req);
                self.dbg_unwrap_mut().reply_watchpoint_request(true);
            }
            GdbRequestType::ReadSiginfo => {
                log!(LogWarn, "READ_SIGINFO request outside of diversion session");
                let si_bytes = vec![0u8; req.mem().len];
                self.dbg_unwrap_mut().reply_read_siginfo(&si_bytes);
            }
            GdbRequestType::WriteSiginfo => {
                log!(LogWarn, "WRITE_SIGINFO request outside of diversion session");
                self.dbg_unwrap_mut().reply_write_siginfo();
            }
            _ => {
                fatal!("Unknown debugger request {:?}", req.type_);
            }
        }
    }

    /// Breakpoint/watchpoint installs go to the timeline, where they are
    /// canonical and survive seeks. When the serving session is a diversion
    /// (so distinct from the timeline's session), the install is mirrored
    /// onto the diversion's address space so the current run observes it
    /// too. The mirror carries no condition.
    fn install_breakpoint(&mut self, which: SessionRef, target: TaskUid, req: &GdbRequest) -> bool {
        let addr = req.watch().addr;
        let ok = match self.timeline.as_mut() {
            Some(timeline) => timeline.add_breakpoint(target, addr, breakpoint_condition(req)),
            None => {
                // Emergency server: there is no timeline, install straight
                // into the session.
                return self
                    .session_mut(which)
                    .vm_mut()
                    .add_breakpoint(addr, BreakpointType::BkptUser);
            }
        };
        if ok && which == SessionRef::Diversion {
            let diversion_ok = self
                .session_mut(which)
                .vm_mut()
                .add_breakpoint(addr, BreakpointType::BkptUser);
            let task = self.session(which).task(target).unwrap();
            ed_assert!(task, diversion_ok);
        }
        ok
    }

    fn uninstall_breakpoint(&mut self, which: SessionRef, target: TaskUid, req: &GdbRequest) {
        let addr = req.watch().addr;
        match self.timeline.as_mut() {
            Some(timeline) => timeline.remove_breakpoint(target, addr),
            None => {
                self.session_mut(which)
                    .vm_mut()
                    .remove_breakpoint(addr, BreakpointType::BkptUser);
                return;
            }
        }
        if which == SessionRef::Diversion {
            self.session_mut(which)
                .vm_mut()
                .remove_breakpoint(addr, BreakpointType::BkptUser);
        }
    }

    fn install_watchpoint(&mut self, which: SessionRef, target: TaskUid, req: &GdbRequest) -> bool {
        let addr = req.watch().addr;
        let num_bytes = req.watch().kind as usize;
        let type_ = watchpoint_type(req.type_);
        let ok = match self.timeline.as_mut() {
            Some(timeline) => {
                timeline.add_watchpoint(target, addr, num_bytes, type_, breakpoint_condition(req))
            }
            None => {
                return self
                    .session_mut(which)
                    .vm_mut()
                    .add_watchpoint(addr, num_bytes, type_);
            }
        };
        if ok && which == SessionRef::Diversion {
            let diversion_ok = self
                .session_mut(which)
                .vm_mut()
                .add_watchpoint(addr, num_bytes, type_);
            let task = self.session(which).task(target).unwrap();
            ed_assert!(task, diversion_ok);
        }
        ok
    }

    fn uninstall_watchpoint(&mut self, which: SessionRef, target: TaskUid, req: &GdbRequest) {
        let addr = req.watch().addr;
        let num_bytes = req.watch().kind as usize;
        let type_ = watchpoint_type(req.type_);
        match self.timeline.as_mut() {
            Some(timeline) => timeline.remove_watchpoint(target, addr, num_bytes, type_),
            None => {
                self.session_mut(which)
                    .vm_mut()
                    .remove_watchpoint(addr, num_bytes, type_);
                return;
            }
        }
        if which == SessionRef::Diversion {
            self.session_mut(which)
                .vm_mut()
                .remove_watchpoint(addr, num_bytes, type_);
        }
    }

    fn threadid_for(&self, which: SessionRef, t: Option<TaskUid>) -> GdbThreadId {
        match t {
            Some(tuid) => get_threadid_from_tuid(self.session(which), tuid),
            None => GdbThreadId::ANY,
        }
    }

    /// Process debugger requests made through `dbg` in the diversion
    /// until action needs to be taken by the caller (a resume-execution
    /// request is received). The returned `TaskUid` is the target of the
    /// resume request, or None if the diversion is over. The received
    /// request is returned through `req`.
    fn diverter_process_debugger_requests(
        &mut self,
        mut t: TaskUid,
        req: &mut GdbRequest,
    ) -> Option<TaskUid> {
        loop {
            *req = self.dbg_unwrap_mut().get_request();

            if req.is_resume_request() {
                if self.diversion.as_ref().unwrap().refcount == 0 {
                    return None;
                }
                return Some(t);
            }

            match req.type_ {
                GdbRequestType::Restart | GdbRequestType::Detach => {
                    self.diversion.as_mut().unwrap().refcount = 0;
                    return None;
                }
                GdbRequestType::ReadSiginfo => {
                    log!(LogDebug, "Adding ref to diversion session");
                    self.diversion.as_mut().unwrap().refcount += 1;
                    let si_bytes = vec![0u8; req.mem().len];
                    self.dbg_unwrap_mut().reply_read_siginfo(&si_bytes);
                    continue;
                }
                GdbRequestType::WriteSiginfo => {
                    log!(LogDebug, "Removing reference to diversion session ...");
                    let diversion = self.diversion.as_mut().unwrap();
                    debug_assert!(diversion.refcount > 0);
                    diversion.refcount -= 1;
                    if diversion.refcount == 0 {
                        log!(LogDebug, "  ... dying at next continue request");
                    }
                    self.dbg_unwrap_mut().reply_write_siginfo();
                    continue;
                }
                GdbRequestType::SetQueryThread => {
                    if req.target.tid > 0 {
                        if let Some(next) = self
                            .session(SessionRef::Diversion)
                            .find_task_from_rec_tid(req.target.tid)
                        {
                            t = next.tuid();
                        }
                    }
                }
                _ => (),
            }

            self.dispatch_debugger_request(
                SessionRef::Diversion,
                Some(t),
                req,
                ReportState::ReportNormal,
            );
        }
    }

    /// Create a new diversion session using the current replay session as
    /// the template. The replay session isn't mutated.
    ///
    /// Execution begins in the new diversion session under the control of
    /// the debugger, starting with initial task `task`. The diversion ends
    /// at the debugger's request, and `divert` returns the first request
    /// that wasn't handled by the diversion; that is, the first request
    /// that should be handled against the replay upon resuming execution.
    fn divert(&mut self, task: TaskUid) -> GdbRequest {
        let mut req = GdbRequest::new(GdbRequestType::None);
        log!(LogDebug, "Starting debugging diversion");

        // Ensure breakpoints and watchpoints are applied before we fork the
        // diversion, so the diversion is consistent with the timeline
        // breakpoint/watchpoint state.
        self.timeline_unwrap_mut().apply_breakpoints_and_watchpoints();
        let diversion_session = self.timeline_unwrap().current_session().clone_diversion();
        self.diversion = Some(DiversionState {
            session: diversion_session,
            refcount: 1,
        });

        let mut t = task;
        loop {
            t = match self.diverter_process_debugger_requests(t, &mut req) {
                Some(t) => t,
                None => break,
            };

            if req.cont().run_direction == RunDirection::RunBackward {
                // We don't support reverse execution in a diversion. Just
                // issue an immediate stop.
                let threadid = get_threadid_from_tuid(self.session(SessionRef::Diversion), t);
                self.dbg_unwrap_mut()
                    .notify_stop(threadid, SIGTRAP, RemotePtr::null());
                continue;
            }

            let (command, signal_to_deliver) = {
                match self.session(SessionRef::Diversion).task(t) {
                    Some(task) => compute_run_command_from_actions(task, &req),
                    None => {
                        // The resume target is gone; the diversion is over.
                        self.diversion.as_mut().unwrap().refcount = 0;
                        req = GdbRequest::new(GdbRequestType::None);
                        break;
                    }
                }
            };
            let result = {
                let timeline = self.timeline.as_mut().unwrap();
                let diversion = self.diversion.as_mut().unwrap();
                timeline.diversion_step(&mut diversion.session, t, command, signal_to_deliver)
            };

            if result.status == DiversionStatus::DiversionExited {
                self.diversion.as_mut().unwrap().refcount = 0;
                req = GdbRequest::new(GdbRequestType::None);
                break;
            }
            debug_assert_eq!(result.status, DiversionStatus::DiversionContinue);

            self.maybe_notify_stop(&result.break_status);
        }

        log!(LogDebug, "... ending debugging diversion");
        debug_assert_eq!(self.diversion.as_ref().unwrap().refcount, 0);

        let mut diversion = self.diversion.take().unwrap();
        diversion.session.kill_all_tasks();
        req
    }

    /// Reply to debugger requests until the debugger asks us to resume
    /// execution, restart, or detach.
    fn process_debugger_requests(&mut self, mut t: Option<TaskUid>, state: ReportState) -> GdbRequest {
        loop {
            let mut req = self.dbg_unwrap_mut().get_request();
            req.suppress_debugger_stop = false;

            if self.timeline_is_running() {
                if let Some(tuid) = t {
                    self.try_lazy_reverse_singlesteps(tuid, &mut req);
                    // Tasks can be recreated during the seek; re-resolve.
                    t = Some(tuid)
                        .filter(|&u| self.session(SessionRef::Timeline).task(u).is_some());
                }
            }

            if req.type_ == GdbRequestType::ReadSiginfo {
                if self.timeline_is_running() && t.is_some() {
                    // We send back a dummy siginfo so the debugger thinks
                    // the request succeeded; if we didn't, it would believe
                    // READ_SIGINFO failed and never attempt WRITE_SIGINFO,
                    // and we'd never know when a `call foo()` frame is done.
                    let si_bytes = vec![0u8; req.mem().len];
                    self.dbg_unwrap_mut().reply_read_siginfo(&si_bytes);

                    req = self.divert(t.unwrap());
                    if req.type_ == GdbRequestType::None {
                        continue;
                    }
                    // Carry on to process the request that was rejected by
                    // the diversion.
                }
            }

            if req.is_resume_request() {
                if let Some(tuid) = t {
                    self.maybe_singlestep_for_event(tuid, &mut req);
                }
                return req;
            }

            if req.type_ == GdbRequestType::Restart {
                // Debugger client requested that we restart execution from
                // the beginning. Restart our debug session.
                log!(
                    LogDebug,
                    "  request to restart at event {}",
                    req.restart().param
                );
                return req;
            }
            if req.type_ == GdbRequestType::Detach {
                log!(LogDebug, "  debugger detached");
                self.dbg_unwrap_mut().reply_detach();
                return req;
            }

            let which = self.current_session_ref();
            self.dispatch_debugger_request(which, t, &req, state);
        }
    }

    /// If `req` is a reverse-singlestep of the current task, try to obtain
    /// the resulting state directly from the timeline's mark database. If
    /// that succeeds, report the singlestep break status and answer
    /// get-registers requests from the mark's cached registers, without
    /// seeking the session at all. Repeat until a request arrives that
    /// isn't a reverse-singlestep or get-registers; only then seek. During
    /// reverse-next the debugger issues long runs of such pairs, and this
    /// makes them interactive.
    fn try_lazy_reverse_singlesteps(&mut self, tuid: TaskUid, req: &mut GdbRequest) {
        let mut now: Option<Mark> = None;
        let mut need_seek = false;

        loop {
            let wanted = req.type_ == GdbRequestType::Cont
                && req.cont().run_direction == RunDirection::RunBackward
                && req.cont().actions.len() == 1
                && req.cont().actions[0].type_ == GdbActionType::ActionStep
                && req.cont().actions[0].signal_to_deliver == 0
                && !req.suppress_debugger_stop
                && match self.session(SessionRef::Timeline).task(tuid) {
                    Some(task) => matches_threadid(task, req.cont().actions[0].target),
                    None => false,
                };
            if !wanted {
                break;
            }

            if now.is_none() {
                now = Some(self.timeline_unwrap_mut().mark());
            }
            let previous = self
                .timeline_unwrap_mut()
                .lazy_reverse_singlestep(now.as_ref().unwrap(), tuid);
            let previous = match previous {
                Some(mark) => mark,
                None => break,
            };

            now = Some(previous);
            need_seek = true;
            let break_status = BreakStatus {
                task: Some(tuid),
                singlestep_complete: true,
                ..Default::default()
            };
            log!(LogDebug, "  using lazy reverse-singlestep");
            self.maybe_notify_stop(&break_status);

            loop {
                *req = self.dbg_unwrap_mut().get_request();
                req.suppress_debugger_stop = false;
                if req.type_ != GdbRequestType::GetRegs {
                    break;
                }
                log!(LogDebug, "  using lazy reverse-singlestep registers");
                let file = {
                    let mark = now.as_ref().unwrap();
                    register_file(mark.regs(), mark.extra_regs())
                };
                self.dbg_unwrap_mut().reply_get_regs(&file);
            }
        }

        if need_seek {
            let mark = now.unwrap();
            self.timeline_unwrap_mut().seek_to_mark(&mark);
        }
    }

    /// Before honoring a forward resume, check whether the trace is
    /// configured to single-step instruction-by-instruction up to the
    /// current event. If so, rewrite the request into a suppressed
    /// singlestep of the current task and print a diagnostic line. The
    /// debugger never sees the spurious stops this produces.
    fn maybe_singlestep_for_event(&self, tuid: TaskUid, req: &mut GdbRequest) {
        let which = self.current_session_ref();
        let session = self.session(which);
        if !session.is_replay() {
            return;
        }
        if !trace_instructions_up_to_event(session.trace_time()) {
            return;
        }
        let task = match session.task(tuid) {
            Some(task) => task,
            None => return,
        };
        eprint!("Stepping: ");
        task.regs()
            .write_register_file_compact(&mut stderr())
            .unwrap();
        eprintln!(" ticks:{}", task.tick_count());
        let threadid = get_threadid(task);
        *req = GdbRequest::new_cont(
            RunDirection::RunForward,
            vec![GdbContAction::new(GdbActionType::ActionStep, threadid, 0)],
        );
        req.suppress_debugger_stop = true;
    }

    /// If `break_status` indicates a stop we should report to the
    /// debugger, report it. Signal synthesis is by sequential overwrite:
    /// watchpoint, then breakpoint/singlestep, then a delivered signal,
    /// then the fake SIGKILL for the last thread's exit under reverse
    /// execution (users often want to run backwards from the end).
    fn maybe_notify_stop(&mut self, break_status: &BreakStatus) {
        let mut sig: i32 = -1;
        let mut watch_addr: RemotePtr<Void> = RemotePtr::null();
        if !break_status.watchpoints_hit.is_empty() {
            sig = SIGTRAP;
            watch_addr = break_status.watchpoints_hit[0].addr;
        }
        if break_status.breakpoint_hit || break_status.singlestep_complete {
            sig = SIGTRAP;
        }
        if break_status.signal != 0 {
            sig = break_status.signal;
        }
        let which = self.current_session_ref();
        if is_last_thread_exit(self.session(which), break_status)
            && self.dbg_unwrap().features().reverse_execution
        {
            sig = SIGKILL;
        }
        if sig >= 0 {
            if let Some(tuid) = break_status.task {
                // Notify the debugger and process any new requests that
                // might have triggered before resuming.
                let threadid = get_threadid_from_tuid(self.session(which), tuid);
                self.dbg_unwrap_mut().notify_stop(threadid, sig, watch_addr);
            }
        }
    }

    fn detach_or_restart(&mut self, req: &GdbRequest, s: &mut ContinueOrStop) -> bool {
        if GdbRequestType::Restart == req.type_ {
            self.restart_session(req);
            *s = ContinueOrStop::ContinueDebugging;
            return true;
        }
        if GdbRequestType::Detach == req.type_ {
            *s = ContinueOrStop::StopDebugging;
            return true;
        }
        false
    }

    fn handle_exited_state(&mut self, t: Option<TaskUid>) -> ContinueOrStop {
        // TODO return real exit code, if it's useful.
        self.dbg_unwrap_mut().notify_exit_code(0);
        let t = match t {
            Some(t) => t,
            None => fatal!("Replay exited before we detected the death of the last debuggee thread"),
        };
        let req = self.process_debugger_requests(Some(t), ReportState::ReportThreadsDead);
        let mut s = ContinueOrStop::default();
        if self.detach_or_restart(&req, &mut s) {
            return s;
        }
        fatal!("Received continue request after end-of-trace.");
    }

    /// One iteration of the main service loop.
    pub fn debug_one_step(&mut self, last_direction: &mut RunDirection) -> ContinueOrStop {
        let current = {
            let session = self.session(SessionRef::Timeline);
            session
                .current_task()
                .and_then(|tuid| session.task(tuid).map(|task| (tuid, task.tguid())))
        };
        let tuid = match current {
            Some((tuid, tguid)) if tguid == self.debuggee_tguid => tuid,
            _ => {
                // Execution has drifted to some process other than the
                // debuggee. Replay a step without consulting the debugger.
                let stop_at = if *last_direction == RunDirection::RunForward {
                    self.target.event
                } else {
                    0
                };
                let result = self.timeline_unwrap_mut().replay_step(
                    RunCommand::Continue,
                    *last_direction,
                    stop_at,
                    None,
                );
                if result.status == ReplayStatus::ReplayExited {
                    return self.handle_exited_state(None);
                }
                return ContinueOrStop::ContinueDebugging;
            }
        };

        let mut req = self.process_debugger_requests(Some(tuid), ReportState::ReportNormal);
        loop {
            let mut s = ContinueOrStop::default();
            if self.detach_or_restart(&req, &mut s) {
                *last_direction = RunDirection::RunForward;
                return s;
            }
            debug_assert!(req.is_resume_request());

            let (command, _signal_to_deliver) = {
                match self.session(SessionRef::Timeline).task(tuid) {
                    Some(task) => compute_run_command_from_actions(task, &req),
                    None => (RunCommand::Continue, 0),
                }
            };
            // Ignore the debugger's signal_to_deliver; we just have to
            // follow the replay.

            *last_direction = req.cont().run_direction;
            let stop_at = if *last_direction == RunDirection::RunForward {
                self.target.event
            } else {
                0
            };
            let mut result = {
                let timeline = self.timeline.as_mut().unwrap();
                let dbg = self.dbg.as_mut().unwrap();
                timeline.replay_step(
                    command,
                    *last_direction,
                    stop_at,
                    Some(&mut || dbg.sniff_packet()),
                )
            };
            if result.status == ReplayStatus::ReplayExited {
                return self.handle_exited_state(Some(tuid));
            }
            if req.cont().run_direction == RunDirection::RunBackward
                && result.break_status.task_exit
            {
                // We reached the start of the debuggee task group; report
                // that as a stop so the user lands at the beginning of the
                // program rather than in limbo.
                result.break_status.task_exit = false;
                if command == RunCommand::Singlestep {
                    result.break_status.singlestep_complete = true;
                } else {
                    result.break_status.breakpoint_hit = true;
                }
            }
            if !req.suppress_debugger_stop {
                self.maybe_notify_stop(&result.break_status);
            }
            let debuggee_about_to_exit = req.cont().run_direction == RunDirection::RunForward
                && is_last_thread_exit(self.session(SessionRef::Timeline), &result.break_status)
                && result
                    .break_status
                    .task
                    .and_then(|u| self.session(SessionRef::Timeline).task(u))
                    .map(|task| task.tguid())
                    == Some(self.debuggee_tguid);
            if debuggee_about_to_exit {
                // Treat the state where the last thread is about to exit
                // like termination.
                req = self.process_debugger_requests(Some(tuid), ReportState::ReportNormal);
                if req.is_resume_request()
                    && req.cont().run_direction == RunDirection::RunForward
                {
                    return self.handle_exited_state(Some(tuid));
                }
                // Otherwise (e.g. detach, restart or reverse-exec) process
                // the request as normal.
                continue;
            }
            return ContinueOrStop::ContinueDebugging;
        }
    }

    fn at_target(&self) -> bool {
        // Don't launch the debugger for the initial fork child. No one
        // ever wants that to happen.
        let timeline = self.timeline_unwrap();
        let session = timeline.current_session();
        if !session.done_initial_exec() {
            return false;
        }
        let task = match session.current_task().and_then(|u| session.task(u)) {
            Some(task) => task,
            None => return false,
        };
        if !timeline.can_add_checkpoint() {
            return false;
        }
        if self.stop_replaying_to_target {
            return true;
        }
        // When we decide to create the debugger, we may end up creating a
        // checkpoint. In that case we want the checkpoint to retain the
        // state it had *before* we started replaying the next frame, so
        // the decision is made on the frame we're *about to* replay.
        //
        // NB: we'll happily attach to whichever task within the group
        // happens to be scheduled here. We don't take "attach to process"
        // to mean "attach to thread-group leader".
        session.trace_time() > self.target.event
            && (self.target.pid.is_none() || Some(task.tgid()) == self.target.pid)
            && (!self.target.require_exec || session.vm().execed())
    }

    /// The trace has reached the event at which the user wanted to start
    /// debugging. Set up the appropriate state.
    fn activate_debugger(&mut self) {
        let (event_now, tgid) = {
            let session = self.session(SessionRef::Timeline);
            // We MUST have a current task here.
            let tuid = session.current_task().unwrap();
            let task = session.task(tuid).unwrap();
            (session.trace_time(), task.tgid())
        };
        if self.target.event > 0 || self.target.pid.is_some() {
            eprint!(
                "\x07\n\
                 --------------------------------------------------\n\
                 \x20---> Reached target process {} at event {}.\n\
                 --------------------------------------------------\n",
                tgid, event_now
            );
        }

        // Have the "checkpoint" be the original replay session, and then
        // switch over to using the cloned session, so the restart command
        // can rewind to the attach point.
        self.debugger_restart_mark = Some(self.timeline_unwrap_mut().add_explicit_checkpoint());

        // Store the current tgid and event as the "execution target" for
        // the next replay session, if we end up restarting. This allows us
        // to determine whether a later session has reached this target
        // without necessarily replaying up to this point.
        self.target.pid = Some(tgid);
        self.target.require_exec = false;
        self.target.event = event_now;
    }

    fn restart_session(&mut self, req: &GdbRequest) {
        debug_assert_eq!(req.type_, GdbRequestType::Restart);
        debug_assert!(self.dbg.is_some());

        self.timeline_unwrap_mut().remove_breakpoints_and_watchpoints();

        let mut mark_to_restore: Option<Mark> = None;
        match req.restart().type_ {
            GdbRestartType::RestartFromCheckpoint => {
                let param = req.restart().param as u32;
                match self.checkpoints.get(&param) {
                    None => {
                        print!(
                            "{}",
                            checkpoint_not_found_message(&req.restart().param_str, &self.checkpoints)
                        );
                        self.dbg_unwrap_mut().notify_restart_failed();
                        return;
                    }
                    Some(mark) => mark_to_restore = Some(mark.clone()),
                }
            }
            GdbRestartType::RestartFromPrevious => {
                mark_to_restore = self.debugger_restart_mark.clone();
            }
            GdbRestartType::RestartFromEvent => (),
        }

        if let Some(mark) = mark_to_restore {
            self.timeline_unwrap_mut().seek_to_mark(&mark);
            if let Some(old_mark) = self.debugger_restart_mark.take() {
                self.timeline_unwrap_mut().remove_explicit_checkpoint(&old_mark);
            }
            self.debugger_restart_mark = Some(mark);
            if self.timeline_unwrap().can_add_checkpoint() {
                let _ = self.timeline_unwrap_mut().add_explicit_checkpoint();
            }
            return;
        }

        self.stop_replaying_to_target = false;

        debug_assert_eq!(req.restart().type_, GdbRestartType::RestartFromEvent);
        // Note that we don't reset the target pid; we intentionally keep
        // targeting the same process no matter what is running when we hit
        // the event.
        self.target.event = req.restart().param;
        let target_event = self.target.event;
        self.timeline_unwrap_mut().seek_to_before_event(target_event);
        loop {
            let result = self.timeline_unwrap_mut().replay_step(
                RunCommand::Continue,
                RunDirection::RunForward,
                target_event,
                None,
            );
            if result.status == ReplayStatus::ReplayExited {
                log!(LogInfo, "Event was not reached before end of trace");
                self.timeline_unwrap_mut().seek_to_before_event(target_event);
                break;
            }
            let debuggee_exiting = {
                let session = self.session(SessionRef::Timeline);
                is_last_thread_exit(session, &result.break_status)
                    && result
                        .break_status
                        .task
                        .and_then(|u| session.task(u))
                        .map(|task| Some(task.tgid()) == self.target.pid)
                        .unwrap_or(false)
            };
            if debuggee_exiting {
                // Debuggee task is about to exit. Stop here.
                break;
            }
            if self.at_target() {
                break;
            }
        }
        self.activate_debugger();
    }

    /// Actually run the server: replay to the attach target, wait for the
    /// debugger to connect, then drive `debug_one_step` until detach or
    /// termination.
    pub fn serve_replay(
        &mut self,
        mut flags: ConnectionFlags,
        acceptor: &mut dyn GdbConnectionAcceptor,
    ) {
        loop {
            let target_event = self.target.event;
            let result = self.timeline_unwrap_mut().replay_step(
                RunCommand::Continue,
                RunDirection::RunForward,
                target_event,
                None,
            );
            if result.status == ReplayStatus::ReplayExited {
                log!(LogInfo, "Debugger was not launched before end of trace");
                return;
            }
            if self.at_target() {
                break;
            }
        }

        let mut port: u16 = match flags.dbg_port {
            Some(port) => port,
            None => getpid().as_raw() as u16,
        };
        // Don't probe if the user specified a port. Explicitly selecting a
        // port is usually done by scripts, which would presumably break if
        // a different port were chosen. So fail with a clearer error
        // message instead.
        let probe = match flags.dbg_port {
            Some(_) => ProbePort::DontProbe,
            None => ProbePort::ProbePort,
        };

        let (t_tgid, tguid, exe_image, first_run_event) = {
            let session = self.session(SessionRef::Timeline);
            // We MUST have a current task.
            let task = session
                .current_task()
                .and_then(|u| session.task(u))
                .unwrap();
            (
                task.tgid(),
                task.tguid(),
                session.vm().exe_image().to_owned(),
                session.vm().first_run_event(),
            )
        };
        let listen_fd = open_socket(&flags.dbg_host, &mut port, probe);
        if let Some(params_pipe) = flags.debugger_params_write_pipe.as_mut() {
            let params = debugger_params(&exe_image, &flags.dbg_host, port);
            let nwritten = write(params_pipe.as_raw(), u8_slice(&params)).unwrap();
            debug_assert_eq!(nwritten, mem::size_of_val(&params));
            params_pipe.close();
        }
        self.debuggee_tguid = tguid;

        if first_run_event > 0 {
            self.timeline_unwrap_mut()
                .set_reverse_execution_barrier_event(first_run_event);
        }

        log!(LogDebug, "initializing debugger connection");
        self.dbg = Some(acceptor.await_debugger(
            &listen_fd,
            t_tgid,
            GdbConnectionFeatures::default(),
        ));
        self.activate_debugger();

        let mut last_direction = RunDirection::RunForward;
        while self.debug_one_step(&mut last_direction) == ContinueOrStop::ContinueDebugging {}

        log!(LogDebug, "debugger server exiting ...");
    }

    /// Start a single-shot debugging connection for `tuid` after a fatal
    /// internal error, and return when there are no more requests to
    /// process (usually because the debugger detaches). Same dispatcher as
    /// the normal server, narrower feature set: there is no timeline, so
    /// no reverse execution, diversions or restarts.
    pub fn emergency_debug(
        mut session: Session,
        tuid: TaskUid,
        acceptor: &mut dyn GdbConnectionAcceptor,
    ) {
        // The task may have overshot an internal breakpoint; whether it did
        // or not, cover the breakpoints up.
        session.vm_mut().remove_all_breakpoints();

        // Don't advertise reverse_execution, because a) it won't work and
        // b) some debugger versions will fail unless the user turns off
        // async mode, and we don't want to require that.
        let features = GdbConnectionFeatures {
            reverse_execution: false,
        };
        let tgid = session.task(tuid).map(|t| t.tgid()).unwrap_or(0);
        let mut port: u16 = tuid.tid() as u16;
        let listen_fd = open_socket(LOCALHOST_ADDR, &mut port, ProbePort::ProbePort);
        eprintln!("Awaiting debugger on {}:{}", LOCALHOST_ADDR, port);
        let dbg = acceptor.await_debugger(&listen_fd, tgid, features);

        let mut server = GdbServer::new_from(dbg, session, tuid);
        server.process_debugger_requests(Some(tuid), ReportState::ReportNormal);
    }
}

fn debugger_params(exe_image: &OsStr, host: &str, port: u16) -> DebuggerParams {
    use std::os::unix::ffi::OsStrExt;
    let mut params = DebuggerParams::default();
    let exe_bytes = exe_image.as_bytes();
    debug_assert!(exe_bytes.len() < params.exe_image.len());
    params.exe_image[0..exe_bytes.len()].copy_from_slice(exe_bytes);
    debug_assert!(host.len() < params.host.len());
    params.host[0..host.len()].copy_from_slice(host.as_bytes());
    params.port = port;
    params
}

fn read_auxv(real_tgid: pid_t) -> Vec<u8> {
    let filename = format!("/proc/{}/auxv", real_tgid);
    let fd = match ScopedFd::open_ro(filename.as_str()) {
        Ok(fd) => fd,
        Err(_) => return Vec::new(),
    };
    let mut auxv = vec![0u8; 4096];
    match read(fd.as_raw(), &mut auxv) {
        Ok(nread) => {
            auxv.truncate(nread);
            auxv
        }
        Err(_) => Vec::new(),
    }
}

/// Return the register `which`, which may not have a defined value.
///
/// This helper fetches the values of both general-purpose and "extra"
/// registers, consulting the general-purpose file first.
fn get_reg(
    regs: &Registers,
    extra_regs: &ExtraRegisters,
    which: GdbRegister,
) -> GdbRegisterValue {
    let mut value = [0u8; GdbRegisterValue::MAX_SIZE];
    let maybe_size = regs
        .read_register(&mut value, which)
        .or_else(|| extra_regs.read_register(&mut value, which));
    match maybe_size {
        Some(size) => GdbRegisterValue {
            name: which,
            value,
            defined: true,
            size,
        },
        None => GdbRegisterValue::undefined(which),
    }
}

/// Values for all the registers the debugger knows by number, with a
/// `defined` flag each.
fn register_file(regs: &Registers, extra_regs: &ExtraRegisters) -> Vec<GdbRegisterValue> {
    (0..regs.total_registers())
        .map(|n| get_reg(regs, extra_regs, GdbRegister::nth(n)))
        .collect()
}

fn get_threadid(task: &Task) -> GdbThreadId {
    GdbThreadId::new(task.tgid(), task.rec_tid())
}

fn get_threadid_from_tuid(session: &Session, tuid: TaskUid) -> GdbThreadId {
    match session.task(tuid) {
        Some(task) => GdbThreadId::new(task.tgid(), tuid.tid()),
        None => GdbThreadId::new(GdbThreadId::ANY.pid, tuid.tid()),
    }
}

fn matches_threadid(task: &Task, target: GdbThreadId) -> bool {
    (target.pid <= 0 || target.pid == task.tgid())
        && (target.tid <= 0 || target.tid == task.rec_tid())
}

fn is_last_thread_exit(session: &Session, break_status: &BreakStatus) -> bool {
    break_status.task_exit
        && break_status
            .task
            .and_then(|tuid| session.task(tuid))
            .map(|task| session.task_group_size(task.tguid()) == 1)
            .unwrap_or(false)
}

fn watchpoint_type(req: GdbRequestType) -> WatchType {
    match req {
        GdbRequestType::SetHwBreak | GdbRequestType::RemoveHwBreak => WatchType::WatchExec,
        GdbRequestType::SetWrWatch | GdbRequestType::RemoveWrWatch => WatchType::WatchWrite,
        // NB: x86 doesn't support read-only watchpoints (who would ever
        // want to use one?) so we treat them as readwrite watchpoints and
        // hope the debugger can figure out what's going on. That is, if a
        // user ever tries to set a read watchpoint.
        GdbRequestType::SetRdWatch
        | GdbRequestType::RemoveRdWatch
        | GdbRequestType::SetRdWrWatch
        | GdbRequestType::RemoveRdWrWatch => WatchType::WatchReadWrite,
        _ => fatal!("Unknown dbg request {:?}", req),
    }
}

/// Pick the run command for the current task from the debugger's action
/// list: the first action matching the task wins. Neither diversion nor
/// replay sessions can run multiple threads, so even if the debugger asks
/// to continue several, we don't.
///
/// If no action matches, the debugger asked to run some thread that isn't
/// the current one, without resuming the current one. It sometimes does
/// this even though its target thread is blocked and the current task must
/// run before that thread can make progress, so let the current task run
/// anyway.
fn compute_run_command_from_actions(task: &Task, req: &GdbRequest) -> (RunCommand, i32) {
    for action in &req.cont().actions {
        if matches_threadid(task, action.target) {
            let command = if action.type_ == GdbActionType::ActionStep {
                RunCommand::Singlestep
            } else {
                RunCommand::Continue
            };
            return (command, action.signal_to_deliver);
        }
    }
    (RunCommand::Continue, 0)
}

fn checkpoint_not_found_message(param_str: &str, checkpoints: &BTreeMap<u32, Mark>) -> String {
    let mut message = format!("Checkpoint {} not found.\n", param_str);
    message.push_str("Valid checkpoints:");
    for index in checkpoints.keys() {
        message.push_str(&format!(" {}", index));
    }
    message.push('\n');
    message
}

/// The conditions the debugger attached to a breakpoint: the breakpoint
/// fires when any expression fails to evaluate or yields a nonzero value.
/// An empty list never gets here; it means "always fire" and is
/// represented by installing without a condition.
struct GdbBreakpointCondition {
    expressions: Vec<GdbExpression>,
}

impl GdbBreakpointCondition {
    fn new(bytecodes: &[Vec<u8>]) -> GdbBreakpointCondition {
        GdbBreakpointCondition {
            expressions: bytecodes.iter().map(|b| GdbExpression::new(b)).collect(),
        }
    }
}

impl BreakpointCondition for GdbBreakpointCondition {
    fn evaluate(&self, t: &Task, vm: &AddressSpace) -> bool {
        for e in &self.expressions {
            let mut v = GdbExpressionValue::default();
            // Break if evaluation fails or the result is nonzero
            if !e.evaluate(t, vm, &mut v) || v.i != 0 {
                return true;
            }
        }
        false
    }
}

fn breakpoint_condition(request: &GdbRequest) -> Option<Box<dyn BreakpointCondition>> {
    if request.watch().conditions.is_empty() {
        return None;
    }
    Some(Box::new(GdbBreakpointCondition::new(
        &request.watch().conditions,
    )))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::flags::Flags;
    use crate::gdb_register::{DREG_RAX, DREG_RIP};
    use crate::replay_timeline::ReplayResult;
    use crate::session::address_space::WatchConfig;
    use crate::session::diversion_session::{DiversionResult, DiversionStatus};
    use crate::session::SessionKind;
    use nix::unistd::pipe;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    const TID: pid_t = 1000;

    fn tuid() -> TaskUid {
        TaskUid::new_with(TID, 1)
    }

    fn tguid() -> ThreadGroupUid {
        ThreadGroupUid::new_with(TID, 1)
    }

    fn make_session(trace_time: FrameTime) -> Session {
        let mut session = Session::new(SessionKind::Replay);
        let mut task = Task::new(
            tuid(),
            tguid(),
            std::process::id() as pid_t,
            "debuggee",
            SupportedArch::X64,
        );
        task.regs_mut()
            .write_register(DREG_RIP, &0x1000u64.to_le_bytes());
        task.set_last_sig(0);
        session.add_task(task);
        session
            .vm_mut()
            .map_region(RemotePtr::from_val(0x1000), (0..16).collect());
        // Back the back-channel page too, so non-magic writes there can
        // reach real memory in diversion mode.
        session
            .vm_mut()
            .map_region(RemotePtr::from_val(DBG_COMMAND_MAGIC_ADDRESS), vec![0u8; 12]);
        session.vm_mut().set_exe_image(OsStr::new("/bin/true"));
        session.set_trace_time(trace_time);
        session.set_done_initial_exec();
        session
    }

    #[derive(Clone, Debug, PartialEq)]
    enum Reply {
        CurrentThread(GdbThreadId),
        Offsets,
        ThreadList(Vec<GdbThreadId>),
        IsThreadAlive(bool),
        ThreadExtraInfo(String),
        SelectThread(bool),
        Auxv(Vec<u8>),
        GetMem(Vec<u8>),
        SetMem(bool),
        GetReg(bool),
        GetRegs(Vec<(u32, bool, Vec<u8>)>),
        SetReg(bool),
        StopReason(GdbThreadId, i32),
        Watchpoint(bool),
        ReadSiginfo(Vec<u8>),
        WriteSiginfo,
        Detach,
        Stop(GdbThreadId, i32, usize),
        RestartFailed,
        ExitCode(i32),
        NoSuchThread,
    }

    struct ScriptedConnection {
        requests: Rc<RefCell<VecDeque<GdbRequest>>>,
        replies: Rc<RefCell<Vec<Reply>>>,
        features: GdbConnectionFeatures,
    }

    impl GdbConnection for ScriptedConnection {
        fn get_request(&mut self) -> GdbRequest {
            self.requests
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| GdbRequest::new(GdbRequestType::Detach))
        }

        fn sniff_packet(&mut self) -> bool {
            false
        }

        fn features(&self) -> GdbConnectionFeatures {
            self.features
        }

        fn reply_get_current_thread(&mut self, thread: GdbThreadId) {
            self.replies.borrow_mut().push(Reply::CurrentThread(thread));
        }

        fn reply_get_offsets(&mut self) {
            self.replies.borrow_mut().push(Reply::Offsets);
        }

        fn reply_get_thread_list(&mut self, threads: &[GdbThreadId]) {
            self.replies
                .borrow_mut()
                .push(Reply::ThreadList(threads.to_vec()));
        }

        fn reply_get_is_thread_alive(&mut self, alive: bool) {
            self.replies.borrow_mut().push(Reply::IsThreadAlive(alive));
        }

        fn reply_get_thread_extra_info(&mut self, info: &str) {
            self.replies
                .borrow_mut()
                .push(Reply::ThreadExtraInfo(info.to_owned()));
        }

        fn reply_select_thread(&mut self, ok: bool) {
            self.replies.borrow_mut().push(Reply::SelectThread(ok));
        }

        fn reply_get_auxv(&mut self, auxv: &[u8]) {
            self.replies.borrow_mut().push(Reply::Auxv(auxv.to_vec()));
        }

        fn reply_get_mem(&mut self, mem: &[u8]) {
            self.replies.borrow_mut().push(Reply::GetMem(mem.to_vec()));
        }

        fn reply_set_mem(&mut self, ok: bool) {
            self.replies.borrow_mut().push(Reply::SetMem(ok));
        }

        fn reply_get_reg(&mut self, reg: &GdbRegisterValue) {
            self.replies.borrow_mut().push(Reply::GetReg(reg.defined));
        }

        fn reply_get_regs(&mut self, file: &[GdbRegisterValue]) {
            self.replies.borrow_mut().push(Reply::GetRegs(
                file.iter()
                    .map(|r| (r.name.as_u32(), r.defined, r.bytes().to_vec()))
                    .collect(),
            ));
        }

        fn reply_set_reg(&mut self, ok: bool) {
            self.replies.borrow_mut().push(Reply::SetReg(ok));
        }

        fn reply_get_stop_reason(&mut self, which: GdbThreadId, sig: i32) {
            self.replies.borrow_mut().push(Reply::StopReason(which, sig));
        }

        fn reply_watchpoint_request(&mut self, ok: bool) {
            self.replies.borrow_mut().push(Reply::Watchpoint(ok));
        }

        fn reply_read_siginfo(&mut self, si_bytes: &[u8]) {
            self.replies
                .borrow_mut()
                .push(Reply::ReadSiginfo(si_bytes.to_vec()));
        }

        fn reply_write_siginfo(&mut self) {
            self.replies.borrow_mut().push(Reply::WriteSiginfo);
        }

        fn reply_detach(&mut self) {
            self.replies.borrow_mut().push(Reply::Detach);
        }

        fn notify_stop(&mut self, thread: GdbThreadId, sig: i32, watch_addr: RemotePtr<Void>) {
            self.replies
                .borrow_mut()
                .push(Reply::Stop(thread, sig, watch_addr.as_usize()));
        }

        fn notify_restart_failed(&mut self) {
            self.replies.borrow_mut().push(Reply::RestartFailed);
        }

        fn notify_exit_code(&mut self, code: i32) {
            self.replies.borrow_mut().push(Reply::ExitCode(code));
        }

        fn notify_no_such_thread(&mut self, _req: &GdbRequest) {
            self.replies.borrow_mut().push(Reply::NoSuchThread);
        }
    }

    struct TimelineRec {
        can_add_checkpoint: bool,
        advance_on_forward_step: bool,
        next_mark_id: u64,
        live_checkpoints: Vec<u64>,
        step_results: VecDeque<ReplayResult>,
        steps: Vec<(RunCommand, RunDirection, FrameTime)>,
        breakpoints: Vec<(usize, bool)>,
        watchpoints: Vec<(usize, usize, WatchType, bool)>,
        lazy_marks: VecDeque<Mark>,
        seeks: Vec<u64>,
        seeks_before_event: Vec<FrameTime>,
        diversion_steps: Vec<(TaskUid, RunCommand, i32)>,
        diversion_results: VecDeque<DiversionResult>,
        applied_breakpoints: u32,
        removed_all: u32,
        barrier_events: Vec<FrameTime>,
    }

    impl TimelineRec {
        fn new() -> TimelineRec {
            TimelineRec {
                can_add_checkpoint: true,
                advance_on_forward_step: false,
                next_mark_id: 1000,
                live_checkpoints: Vec::new(),
                step_results: VecDeque::new(),
                steps: Vec::new(),
                breakpoints: Vec::new(),
                watchpoints: Vec::new(),
                lazy_marks: VecDeque::new(),
                seeks: Vec::new(),
                seeks_before_event: Vec::new(),
                diversion_steps: Vec::new(),
                diversion_results: VecDeque::new(),
                applied_breakpoints: 0,
                removed_all: 0,
                barrier_events: Vec::new(),
            }
        }
    }

    struct FakeTimeline {
        session: Session,
        rec: Rc<RefCell<TimelineRec>>,
    }

    impl FakeTimeline {
        fn make_mark(&mut self) -> Mark {
            let id = {
                let mut rec = self.rec.borrow_mut();
                rec.next_mark_id += 1;
                rec.next_mark_id
            };
            let (regs, extra_regs) = match self
                .session
                .current_task()
                .and_then(|u| self.session.task(u))
            {
                Some(task) => (task.regs().clone(), task.extra_regs().clone()),
                None => (Default::default(), Default::default()),
            };
            Mark::new(id, self.session.trace_time(), regs, extra_regs)
        }
    }

    impl ReplayTimeline for FakeTimeline {
        fn current_session(&self) -> &Session {
            &self.session
        }

        fn current_session_mut(&mut self) -> &mut Session {
            &mut self.session
        }

        fn replay_step(
            &mut self,
            command: RunCommand,
            direction: RunDirection,
            stop_at_time: FrameTime,
            _interrupt_check: Option<&mut dyn FnMut() -> bool>,
        ) -> ReplayResult {
            let mut rec = self.rec.borrow_mut();
            rec.steps.push((command, direction, stop_at_time));
            if rec.advance_on_forward_step && direction == RunDirection::RunForward {
                let time = self.session.trace_time() + 1;
                self.session.set_trace_time(time);
            }
            rec.step_results.pop_front().unwrap_or_default()
        }

        fn diversion_step(
            &mut self,
            _session: &mut Session,
            tuid: TaskUid,
            command: RunCommand,
            signal_to_deliver: i32,
        ) -> DiversionResult {
            let mut rec = self.rec.borrow_mut();
            rec.diversion_steps.push((tuid, command, signal_to_deliver));
            rec.diversion_results.pop_front().unwrap_or_default()
        }

        fn mark(&mut self) -> Mark {
            self.make_mark()
        }

        fn lazy_reverse_singlestep(&mut self, _from: &Mark, _tuid: TaskUid) -> Option<Mark> {
            self.rec.borrow_mut().lazy_marks.pop_front()
        }

        fn seek_to_mark(&mut self, mark: &Mark) {
            self.rec.borrow_mut().seeks.push(mark.id());
            self.session.set_trace_time(mark.time());
        }

        fn seek_to_before_event(&mut self, time: FrameTime) {
            self.rec.borrow_mut().seeks_before_event.push(time);
            self.session.set_trace_time(time.saturating_sub(1));
        }

        fn can_add_checkpoint(&self) -> bool {
            self.rec.borrow().can_add_checkpoint
        }

        fn add_explicit_checkpoint(&mut self) -> Mark {
            let mark = self.make_mark();
            self.rec.borrow_mut().live_checkpoints.push(mark.id());
            mark
        }

        fn remove_explicit_checkpoint(&mut self, mark: &Mark) {
            let mut rec = self.rec.borrow_mut();
            let pos = rec
                .live_checkpoints
                .iter()
                .position(|&id| id == mark.id())
                .expect("removing a checkpoint that was never added");
            rec.live_checkpoints.remove(pos);
        }

        fn add_breakpoint(
            &mut self,
            _tuid: TaskUid,
            addr: RemotePtr<Void>,
            condition: Option<Box<dyn BreakpointCondition>>,
        ) -> bool {
            self.rec
                .borrow_mut()
                .breakpoints
                .push((addr.as_usize(), condition.is_some()));
            // The engine applies eagerly; good enough for these tests.
            self.session
                .vm_mut()
                .add_breakpoint(addr, BreakpointType::BkptUser)
        }

        fn remove_breakpoint(&mut self, _tuid: TaskUid, addr: RemotePtr<Void>) {
            self.rec
                .borrow_mut()
                .breakpoints
                .retain(|&(a, _)| a != addr.as_usize());
            self.session
                .vm_mut()
                .remove_breakpoint(addr, BreakpointType::BkptUser);
        }

        fn add_watchpoint(
            &mut self,
            _tuid: TaskUid,
            addr: RemotePtr<Void>,
            num_bytes: usize,
            type_: WatchType,
            condition: Option<Box<dyn BreakpointCondition>>,
        ) -> bool {
            self.rec.borrow_mut().watchpoints.push((
                addr.as_usize(),
                num_bytes,
                type_,
                condition.is_some(),
            ));
            self.session.vm_mut().add_watchpoint(addr, num_bytes, type_)
        }

        fn remove_watchpoint(
            &mut self,
            _tuid: TaskUid,
            addr: RemotePtr<Void>,
            num_bytes: usize,
            type_: WatchType,
        ) {
            self.rec
                .borrow_mut()
                .watchpoints
                .retain(|&(a, n, t, _)| !(a == addr.as_usize() && n == num_bytes && t == type_));
            self.session
                .vm_mut()
                .remove_watchpoint(addr, num_bytes, type_);
        }

        fn remove_breakpoints_and_watchpoints(&mut self) {
            let mut rec = self.rec.borrow_mut();
            rec.removed_all += 1;
            rec.breakpoints.clear();
            rec.watchpoints.clear();
            self.session.vm_mut().remove_all_breakpoints();
            self.session.vm_mut().remove_all_watchpoints();
        }

        fn apply_breakpoints_and_watchpoints(&mut self) {
            self.rec.borrow_mut().applied_breakpoints += 1;
        }

        fn set_reverse_execution_barrier_event(&mut self, event: FrameTime) {
            self.rec.borrow_mut().barrier_events.push(event);
        }
    }

    struct TestHarness {
        server: GdbServer,
        replies: Rc<RefCell<Vec<Reply>>>,
        requests: Rc<RefCell<VecDeque<GdbRequest>>>,
        rec: Rc<RefCell<TimelineRec>>,
    }

    fn harness_with(session: Session, script: Vec<GdbRequest>) -> TestHarness {
        let rec = Rc::new(RefCell::new(TimelineRec::new()));
        let timeline = FakeTimeline {
            session,
            rec: rec.clone(),
        };
        let mut server = GdbServer::new(Box::new(timeline), Target::new());
        let requests = Rc::new(RefCell::new(VecDeque::from(script)));
        let replies: Rc<RefCell<Vec<Reply>>> = Rc::new(RefCell::new(Vec::new()));
        server.dbg = Some(Box::new(ScriptedConnection {
            requests: requests.clone(),
            replies: replies.clone(),
            features: Default::default(),
        }));
        server.debuggee_tguid = tguid();
        TestHarness {
            server,
            replies,
            requests,
            rec,
        }
    }

    fn harness(script: Vec<GdbRequest>) -> TestHarness {
        harness_with(make_session(100), script)
    }

    fn dispatch(h: &mut TestHarness, req: &GdbRequest) {
        h.server.dispatch_debugger_request(
            SessionRef::Timeline,
            Some(tuid()),
            req,
            ReportState::ReportNormal,
        );
    }

    fn enter_diversion(server: &mut GdbServer) {
        let diversion = server
            .timeline_unwrap()
            .current_session()
            .clone_diversion();
        server.diversion = Some(DiversionState {
            session: diversion,
            refcount: 1,
        });
    }

    fn set_mem_req(addr: usize, data: Vec<u8>) -> GdbRequest {
        let mut req = GdbRequest::new_mem(GdbRequestType::SetMem, RemotePtr::from_val(addr), data.len());
        req.mem_mut().data = data;
        req
    }

    fn get_mem_req(addr: usize, len: usize) -> GdbRequest {
        GdbRequest::new_mem(GdbRequestType::GetMem, RemotePtr::from_val(addr), len)
    }

    fn magic_write(cmd: u32) -> GdbRequest {
        set_mem_req(DBG_COMMAND_MAGIC_ADDRESS, cmd.to_le_bytes().to_vec())
    }

    fn read_siginfo_req(len: usize) -> GdbRequest {
        GdbRequest::new_mem(GdbRequestType::ReadSiginfo, RemotePtr::null(), len)
    }

    fn cont_req(direction: RunDirection, action: GdbActionType) -> GdbRequest {
        GdbRequest::new_cont(
            direction,
            vec![GdbContAction::new(action, GdbThreadId::ANY, 0)],
        )
    }

    fn break_status(f: impl FnOnce(&mut BreakStatus)) -> BreakStatus {
        let mut status = BreakStatus {
            task: Some(tuid()),
            ..Default::default()
        };
        f(&mut status);
        status
    }

    #[test]
    fn checkpoint_create_and_delete() {
        let mut h = harness(vec![]);
        dispatch(&mut h, &magic_write(0x0100_0007));
        assert_eq!(h.server.checkpoints.len(), 1);
        assert_eq!(h.server.checkpoints[&7].time(), 100);
        assert_eq!(h.rec.borrow().live_checkpoints.len(), 1);

        dispatch(&mut h, &magic_write(0x0200_0007));
        assert!(h.server.checkpoints.is_empty());
        assert!(h.rec.borrow().live_checkpoints.is_empty());

        assert_eq!(
            *h.replies.borrow(),
            vec![Reply::SetMem(true), Reply::SetMem(true)]
        );
    }

    #[test]
    fn checkpoint_create_replaces_existing() {
        let mut h = harness(vec![]);
        dispatch(&mut h, &magic_write(0x0100_0007));
        let first = h.server.checkpoints[&7].id();
        dispatch(&mut h, &magic_write(0x0100_0007));
        let second = h.server.checkpoints[&7].id();
        assert_ne!(first, second);
        assert_eq!(h.server.checkpoints.len(), 1);
        // The first mark was removed from the timeline before the second
        // was inserted.
        assert_eq!(*h.rec.borrow().live_checkpoints, vec![second]);
    }

    #[test]
    fn checkpoint_create_noop_when_timeline_refuses() {
        let mut h = harness(vec![]);
        h.rec.borrow_mut().can_add_checkpoint = false;
        dispatch(&mut h, &magic_write(0x0100_0003));
        assert!(h.server.checkpoints.is_empty());
        // The debugger's write still "succeeded".
        assert_eq!(*h.replies.borrow(), vec![Reply::SetMem(true)]);
    }

    #[test]
    fn delete_missing_checkpoint_is_quiet() {
        let mut h = harness(vec![]);
        dispatch(&mut h, &magic_write(0x0200_0009));
        assert_eq!(*h.replies.borrow(), vec![Reply::SetMem(true)]);
    }

    #[test]
    fn when_query_reports_event_number() {
        let mut h = harness_with(make_session(42), vec![]);
        dispatch(&mut h, &get_mem_req(DBG_WHEN_MAGIC_ADDRESS, 8));
        assert_eq!(
            *h.replies.borrow(),
            vec![Reply::GetMem(42i64.to_le_bytes().to_vec())]
        );
    }

    #[test]
    fn when_query_in_diversion_is_minus_one() {
        let mut h = harness(vec![]);
        enter_diversion(&mut h.server);
        let req = get_mem_req(DBG_WHEN_MAGIC_ADDRESS, 8);
        h.server.dispatch_debugger_request(
            SessionRef::Diversion,
            Some(tuid()),
            &req,
            ReportState::ReportNormal,
        );
        assert_eq!(
            *h.replies.borrow(),
            vec![Reply::GetMem((-1i64).to_le_bytes().to_vec())]
        );
    }

    #[test]
    fn unknown_magic_command_is_an_ordinary_write() {
        // In replay mode the fall-through write is refused.
        let mut h = harness(vec![]);
        dispatch(&mut h, &magic_write(0x0300_0000));
        assert_eq!(*h.replies.borrow(), vec![Reply::SetMem(false)]);
        assert!(h.server.checkpoints.is_empty());

        // In diversion mode the bytes actually land in memory.
        let mut h = harness(vec![]);
        enter_diversion(&mut h.server);
        let req = magic_write(0x0300_0000);
        h.server.dispatch_debugger_request(
            SessionRef::Diversion,
            Some(tuid()),
            &req,
            ReportState::ReportNormal,
        );
        assert_eq!(*h.replies.borrow(), vec![Reply::SetMem(true)]);
        let mut buf = [0u8; 4];
        let diversion_vm = h.server.session(SessionRef::Diversion).vm();
        diversion_vm.read_bytes_fallible(RemotePtr::from_val(DBG_COMMAND_MAGIC_ADDRESS), &mut buf);
        assert_eq!(buf, 0x0300_0000u32.to_le_bytes());
        // The replay session is untouched.
        let mut buf = [0u8; 4];
        h.server
            .session(SessionRef::Timeline)
            .vm()
            .read_bytes_fallible(RemotePtr::from_val(DBG_COMMAND_MAGIC_ADDRESS), &mut buf);
        assert_eq!(buf, [0, 0, 0, 0]);
    }

    #[test]
    fn zero_length_write_trivially_succeeds() {
        let mut h = harness(vec![]);
        dispatch(&mut h, &set_mem_req(0x1000, vec![]));
        assert_eq!(*h.replies.borrow(), vec![Reply::SetMem(true)]);
        let mut buf = [0u8; 1];
        h.server
            .session(SessionRef::Timeline)
            .vm()
            .read_bytes_fallible(RemotePtr::from_val(0x1000), &mut buf);
        assert_eq!(buf[0], 0);
    }

    #[test]
    fn write_mem_outside_diversion_fails() {
        let mut h = harness(vec![]);
        dispatch(&mut h, &set_mem_req(0x1000, vec![0xaa, 0xbb]));
        assert_eq!(*h.replies.borrow(), vec![Reply::SetMem(false)]);
    }

    #[test]
    fn write_reg_outside_diversion_fails_except_orig_ax() {
        let mut h = harness(vec![]);
        let reg = GdbRegisterValue {
            name: DREG_RAX,
            value: [0; GdbRegisterValue::MAX_SIZE],
            defined: true,
            size: 8,
        };
        dispatch(&mut h, &GdbRequest::new_reg(GdbRequestType::SetReg, reg));

        let orig_ax = GdbRegisterValue {
            name: DREG_ORIG_RAX,
            value: [0xff; GdbRegisterValue::MAX_SIZE],
            defined: true,
            size: 8,
        };
        dispatch(&mut h, &GdbRequest::new_reg(GdbRequestType::SetReg, orig_ax));

        assert_eq!(
            *h.replies.borrow(),
            vec![Reply::SetReg(false), Reply::SetReg(true)]
        );
        // The orig_ax write was silently dropped, not applied.
        let session = h.server.session(SessionRef::Timeline);
        let mut buf = [0u8; GdbRegisterValue::MAX_SIZE];
        assert_eq!(
            session.task(tuid()).unwrap().regs().read_register(&mut buf, DREG_ORIG_RAX),
            None
        );
    }

    #[test]
    fn write_reg_in_diversion_is_applied() {
        let mut h = harness(vec![]);
        enter_diversion(&mut h.server);
        let mut value = [0u8; GdbRegisterValue::MAX_SIZE];
        value[0..8].copy_from_slice(&123u64.to_le_bytes());
        let reg = GdbRegisterValue {
            name: DREG_RAX,
            value,
            defined: true,
            size: 8,
        };
        let req = GdbRequest::new_reg(GdbRequestType::SetReg, reg);
        h.server.dispatch_debugger_request(
            SessionRef::Diversion,
            Some(tuid()),
            &req,
            ReportState::ReportNormal,
        );
        assert_eq!(*h.replies.borrow(), vec![Reply::SetReg(true)]);
        let session = h.server.session(SessionRef::Diversion);
        let mut buf = [0u8; GdbRegisterValue::MAX_SIZE];
        assert_eq!(
            session.task(tuid()).unwrap().regs().read_register(&mut buf, DREG_RAX),
            Some(8)
        );
        assert_eq!(u64::from_le_bytes(buf[0..8].try_into().unwrap()), 123);
    }

    #[test]
    fn get_mem_truncates_and_hides_breakpoint_bytes() {
        let mut h = harness(vec![]);
        dispatch(
            &mut h,
            &GdbRequest::new_watch(GdbRequestType::SetSwBreak, RemotePtr::from_val(0x1004), 1),
        );
        // The engine patched the image.
        let mut raw = [0u8; 1];
        h.server
            .session(SessionRef::Timeline)
            .vm()
            .read_bytes_fallible(RemotePtr::from_val(0x1004), &mut raw);
        assert_eq!(raw[0], BREAKPOINT_INSN);

        dispatch(&mut h, &get_mem_req(0x1000, 32));
        {
            let replies = h.replies.borrow();
            match &replies[1] {
                Reply::GetMem(mem) => {
                    // Truncated to the mapped 16 bytes, with the original
                    // value showing through at the breakpoint address.
                    assert_eq!(mem.len(), 16);
                    assert_eq!(mem[..], (0..16).collect::<Vec<u8>>()[..]);
                }
                other => panic!("unexpected reply {:?}", other),
            }
        }

        // Removing the breakpoint restores the image itself.
        dispatch(
            &mut h,
            &GdbRequest::new_watch(GdbRequestType::RemoveSwBreak, RemotePtr::from_val(0x1004), 1),
        );
        h.server
            .session(SessionRef::Timeline)
            .vm()
            .read_bytes_fallible(RemotePtr::from_val(0x1004), &mut raw);
        assert_eq!(raw[0], 4);
    }

    #[test]
    fn get_reg_reports_defined_flag() {
        let mut h = harness(vec![]);
        dispatch(
            &mut h,
            &GdbRequest::new_reg(GdbRequestType::GetReg, GdbRegisterValue::undefined(DREG_RIP)),
        );
        dispatch(
            &mut h,
            &GdbRequest::new_reg(GdbRequestType::GetReg, GdbRegisterValue::undefined(DREG_RAX)),
        );
        assert_eq!(
            *h.replies.borrow(),
            vec![Reply::GetReg(true), Reply::GetReg(false)]
        );
    }

    #[test]
    fn get_stop_reason_reports_last_signal() {
        let mut h = harness(vec![]);
        h.server
            .timeline_unwrap_mut()
            .current_session_mut()
            .task_mut(tuid())
            .unwrap()
            .set_last_sig(11);
        dispatch(&mut h, &GdbRequest::new(GdbRequestType::GetStopReason));
        assert_eq!(
            *h.replies.borrow(),
            vec![Reply::StopReason(GdbThreadId::new(TID, TID), 11)]
        );
    }

    #[test]
    fn auxv_of_live_process() {
        let mut h = harness(vec![]);
        dispatch(&mut h, &GdbRequest::new(GdbRequestType::GetAuxv));
        let replies = h.replies.borrow();
        match &replies[0] {
            Reply::Auxv(auxv) => assert!(!auxv.is_empty()),
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn auxv_failure_collapses_to_empty() {
        let mut session = make_session(100);
        session.add_task(Task::new(
            TaskUid::new_with(1001, 1),
            tguid(),
            // A pid that can't exist, so the /proc open fails.
            -42,
            "gone",
            SupportedArch::X64,
        ));
        let mut h = harness_with(session, vec![]);
        let mut req = GdbRequest::new(GdbRequestType::GetAuxv);
        req.target = GdbThreadId::new(TID, 1001);
        dispatch(&mut h, &req);
        assert_eq!(*h.replies.borrow(), vec![Reply::Auxv(vec![])]);
    }

    #[test]
    fn unresolved_target_is_no_such_thread() {
        let mut h = harness(vec![]);
        let mut req = get_mem_req(0x1000, 4);
        req.target = GdbThreadId::new(TID, 5555);
        dispatch(&mut h, &req);
        assert_eq!(*h.replies.borrow(), vec![Reply::NoSuchThread]);
    }

    #[test]
    fn interrupt_never_advances_the_timeline() {
        let mut h = harness(vec![]);
        dispatch(&mut h, &GdbRequest::new(GdbRequestType::Interrupt));
        assert_eq!(
            *h.replies.borrow(),
            vec![Reply::Stop(GdbThreadId::new(TID, TID), 0, 0)]
        );
        assert!(h.rec.borrow().steps.is_empty());
    }

    #[test]
    fn thread_list_and_dead_report() {
        let mut h = harness(vec![]);
        dispatch(&mut h, &GdbRequest::new(GdbRequestType::GetThreadList));
        h.server.dispatch_debugger_request(
            SessionRef::Timeline,
            Some(tuid()),
            &GdbRequest::new(GdbRequestType::GetThreadList),
            ReportState::ReportThreadsDead,
        );
        assert_eq!(
            *h.replies.borrow(),
            vec![
                Reply::ThreadList(vec![GdbThreadId::new(TID, TID)]),
                Reply::ThreadList(vec![]),
            ]
        );
    }

    #[test]
    fn simple_queries() {
        let mut h = harness(vec![]);
        dispatch(&mut h, &GdbRequest::new(GdbRequestType::GetCurrentThread));
        dispatch(&mut h, &GdbRequest::new(GdbRequestType::GetOffsets));
        dispatch(&mut h, &GdbRequest::new(GdbRequestType::GetIsThreadAlive));
        dispatch(&mut h, &GdbRequest::new(GdbRequestType::SetQueryThread));
        dispatch(&mut h, &GdbRequest::new(GdbRequestType::GetThreadExtraInfo));
        assert_eq!(
            *h.replies.borrow(),
            vec![
                Reply::CurrentThread(GdbThreadId::new(TID, TID)),
                Reply::Offsets,
                Reply::IsThreadAlive(true),
                Reply::SelectThread(true),
                Reply::ThreadExtraInfo("debuggee".to_owned()),
            ]
        );
    }

    #[test]
    fn siginfo_outside_diversion_is_zero_filled() {
        let mut h = harness(vec![]);
        dispatch(&mut h, &read_siginfo_req(16));
        dispatch(&mut h, &GdbRequest::new_mem(GdbRequestType::WriteSiginfo, RemotePtr::null(), 0));
        assert_eq!(
            *h.replies.borrow(),
            vec![Reply::ReadSiginfo(vec![0u8; 16]), Reply::WriteSiginfo]
        );
    }

    #[test]
    fn stop_signal_precedence() {
        // Watchpoint alone: SIGTRAP with the first watch address.
        let mut h = harness(vec![]);
        h.server.maybe_notify_stop(&break_status(|s| {
            s.watchpoints_hit
                .push(WatchConfig::new(RemotePtr::from_val(0x2000), 4, WatchType::WatchWrite));
            s.watchpoints_hit
                .push(WatchConfig::new(RemotePtr::from_val(0x3000), 4, WatchType::WatchWrite));
        }));
        assert_eq!(
            *h.replies.borrow(),
            vec![Reply::Stop(GdbThreadId::new(TID, TID), SIGTRAP, 0x2000)]
        );

        // A delivered signal overwrites the watchpoint's SIGTRAP, but the
        // watch address is still reported.
        let mut h = harness(vec![]);
        h.server.maybe_notify_stop(&break_status(|s| {
            s.watchpoints_hit
                .push(WatchConfig::new(RemotePtr::from_val(0x2000), 4, WatchType::WatchWrite));
            s.signal = 11;
        }));
        assert_eq!(
            *h.replies.borrow(),
            vec![Reply::Stop(GdbThreadId::new(TID, TID), 11, 0x2000)]
        );

        // Breakpoint alone.
        let mut h = harness(vec![]);
        h.server
            .maybe_notify_stop(&break_status(|s| s.breakpoint_hit = true));
        assert_eq!(
            *h.replies.borrow(),
            vec![Reply::Stop(GdbThreadId::new(TID, TID), SIGTRAP, 0)]
        );

        // Nothing to report: no notification at all.
        let mut h = harness(vec![]);
        h.server.maybe_notify_stop(&BreakStatus::default());
        assert!(h.replies.borrow().is_empty());
    }

    #[test]
    fn last_thread_exit_synthesizes_sigkill_under_reverse() {
        let mut h = harness(vec![]);
        h.server
            .maybe_notify_stop(&break_status(|s| s.task_exit = true));
        assert_eq!(
            *h.replies.borrow(),
            vec![Reply::Stop(GdbThreadId::new(TID, TID), SIGKILL, 0)]
        );
    }

    #[test]
    fn last_thread_exit_without_reverse_is_silent() {
        let mut h = harness(vec![]);
        h.server.dbg = Some(Box::new(ScriptedConnection {
            requests: h.requests.clone(),
            replies: h.replies.clone(),
            features: GdbConnectionFeatures {
                reverse_execution: false,
            },
        }));
        h.server
            .maybe_notify_stop(&break_status(|s| s.task_exit = true));
        assert!(h.replies.borrow().is_empty());
    }

    #[test]
    fn task_exit_not_last_thread_is_silent() {
        let mut session = make_session(100);
        session.add_task(Task::new(
            TaskUid::new_with(1001, 1),
            tguid(),
            std::process::id() as pid_t,
            "sibling",
            SupportedArch::X64,
        ));
        let mut h = harness_with(session, vec![]);
        h.server
            .maybe_notify_stop(&break_status(|s| s.task_exit = true));
        assert!(h.replies.borrow().is_empty());
    }

    #[test]
    fn lazy_reverse_singlestep_fast_path() {
        let mut h = harness(vec![
            cont_req(RunDirection::RunBackward, GdbActionType::ActionStep),
            GdbRequest::new(GdbRequestType::GetRegs),
            GdbRequest::new(GdbRequestType::Detach),
        ]);
        let mut regs = Registers::new(SupportedArch::X64);
        regs.write_register(DREG_RAX, &99u64.to_le_bytes());
        h.rec
            .borrow_mut()
            .lazy_marks
            .push_back(Mark::new(50, 99, regs, Default::default()));

        let req = h
            .server
            .process_debugger_requests(Some(tuid()), ReportState::ReportNormal);
        assert_eq!(req.type_, GdbRequestType::Detach);

        let replies = h.replies.borrow();
        assert_eq!(replies.len(), 3);
        assert_eq!(replies[0], Reply::Stop(GdbThreadId::new(TID, TID), SIGTRAP, 0));
        match &replies[1] {
            Reply::GetRegs(file) => {
                let rax = file
                    .iter()
                    .find(|(n, _, _)| *n == DREG_RAX.as_u32())
                    .unwrap();
                assert!(rax.1);
                assert_eq!(u64::from_le_bytes(rax.2[0..8].try_into().unwrap()), 99);
            }
            other => panic!("unexpected reply {:?}", other),
        }
        assert_eq!(replies[2], Reply::Detach);

        // The registers came from the mark; the session was never stepped,
        // and was seeked exactly once, after the fast path ended.
        assert!(h.rec.borrow().steps.is_empty());
        assert_eq!(*h.rec.borrow().seeks, vec![50]);
        assert_eq!(h.server.session(SessionRef::Timeline).trace_time(), 99);
    }

    #[test]
    fn diversion_refcount_bracket() {
        let mut h = harness(vec![
            read_siginfo_req(16),
            read_siginfo_req(16),
            GdbRequest::new_mem(GdbRequestType::WriteSiginfo, RemotePtr::null(), 0),
            GdbRequest::new_mem(GdbRequestType::WriteSiginfo, RemotePtr::null(), 0),
            cont_req(RunDirection::RunForward, GdbActionType::ActionContinue),
        ]);
        let req = h
            .server
            .process_debugger_requests(Some(tuid()), ReportState::ReportNormal);

        // The resume that found the refcount at zero ended the diversion
        // and is handed back for the replay session to execute.
        assert!(req.is_resume_request());
        assert!(h.server.diversion.is_none());
        assert!(h.rec.borrow().diversion_steps.is_empty());
        assert_eq!(h.rec.borrow().applied_breakpoints, 1);
        assert_eq!(
            *h.replies.borrow(),
            vec![
                Reply::ReadSiginfo(vec![0u8; 16]),
                Reply::ReadSiginfo(vec![0u8; 16]),
                Reply::WriteSiginfo,
                Reply::WriteSiginfo,
            ]
        );
    }

    #[test]
    fn diversion_steps_and_reports_stops() {
        let mut h = harness(vec![
            read_siginfo_req(8),
            cont_req(RunDirection::RunForward, GdbActionType::ActionStep),
            cont_req(RunDirection::RunBackward, GdbActionType::ActionStep),
            GdbRequest::new_mem(GdbRequestType::WriteSiginfo, RemotePtr::null(), 0),
            cont_req(RunDirection::RunForward, GdbActionType::ActionContinue),
        ]);
        h.rec.borrow_mut().diversion_results.push_back(DiversionResult {
            status: DiversionStatus::DiversionContinue,
            break_status: break_status(|s| s.breakpoint_hit = true),
        });

        let req = h
            .server
            .process_debugger_requests(Some(tuid()), ReportState::ReportNormal);
        assert!(req.is_resume_request());
        assert!(h.server.diversion.is_none());

        assert_eq!(
            *h.rec.borrow().diversion_steps,
            vec![(tuid(), RunCommand::Singlestep, 0)]
        );
        assert_eq!(
            *h.replies.borrow(),
            vec![
                Reply::ReadSiginfo(vec![0u8; 8]),
                // The forward diversion step hit a breakpoint.
                Reply::Stop(GdbThreadId::new(TID, TID), SIGTRAP, 0),
                // The backward resume was refused with a synthetic stop.
                Reply::Stop(GdbThreadId::new(TID, TID), SIGTRAP, 0),
                Reply::WriteSiginfo,
            ]
        );
    }

    #[test]
    fn diversion_exit_ends_with_sentinel() {
        let mut h = harness(vec![
            read_siginfo_req(8),
            cont_req(RunDirection::RunForward, GdbActionType::ActionContinue),
            GdbRequest::new(GdbRequestType::Detach),
        ]);
        h.rec.borrow_mut().diversion_results.push_back(DiversionResult {
            status: DiversionStatus::DiversionExited,
            break_status: Default::default(),
        });

        // The diversion dies, its sentinel request is swallowed, and the
        // next real request (the detach) is processed normally.
        let req = h
            .server
            .process_debugger_requests(Some(tuid()), ReportState::ReportNormal);
        assert_eq!(req.type_, GdbRequestType::Detach);
        assert!(h.server.diversion.is_none());
        assert_eq!(h.rec.borrow().diversion_steps.len(), 1);
    }

    #[test]
    fn breakpoints_in_diversion_are_mirrored() {
        let mut h = harness(vec![]);
        enter_diversion(&mut h.server);

        let mut req =
            GdbRequest::new_watch(GdbRequestType::SetSwBreak, RemotePtr::from_val(0x1004), 1);
        req.watch_mut().conditions.push(vec![0x22, 1, 0x27]);
        h.server.dispatch_debugger_request(
            SessionRef::Diversion,
            Some(tuid()),
            &req,
            ReportState::ReportNormal,
        );

        // Installed on the timeline, with the condition attached there...
        assert_eq!(*h.rec.borrow().breakpoints, vec![(0x1004, true)]);
        // ...and mirrored into the diversion's address space.
        assert_eq!(
            h.server
                .session(SessionRef::Diversion)
                .vm()
                .get_breakpoint_type_at_addr(RemotePtr::from_val(0x1004)),
            BreakpointType::BkptUser
        );

        let req =
            GdbRequest::new_watch(GdbRequestType::RemoveSwBreak, RemotePtr::from_val(0x1004), 1);
        h.server.dispatch_debugger_request(
            SessionRef::Diversion,
            Some(tuid()),
            &req,
            ReportState::ReportNormal,
        );
        assert!(h.rec.borrow().breakpoints.is_empty());
        assert_eq!(
            h.server
                .session(SessionRef::Diversion)
                .vm()
                .get_breakpoint_type_at_addr(RemotePtr::from_val(0x1004)),
            BreakpointType::BkptNone
        );
        assert_eq!(
            *h.replies.borrow(),
            vec![Reply::Watchpoint(true), Reply::Watchpoint(true)]
        );
    }

    #[test]
    fn watchpoints_route_through_the_timeline() {
        let mut h = harness(vec![]);
        dispatch(
            &mut h,
            &GdbRequest::new_watch(GdbRequestType::SetWrWatch, RemotePtr::from_val(0x1008), 4),
        );
        assert_eq!(
            *h.rec.borrow().watchpoints,
            vec![(0x1008, 4, WatchType::WatchWrite, false)]
        );
        dispatch(
            &mut h,
            &GdbRequest::new_watch(GdbRequestType::RemoveWrWatch, RemotePtr::from_val(0x1008), 4),
        );
        assert!(h.rec.borrow().watchpoints.is_empty());
        assert_eq!(
            *h.replies.borrow(),
            vec![Reply::Watchpoint(true), Reply::Watchpoint(true)]
        );
    }

    #[test]
    fn checkpoint_not_found_message_format() {
        let mut checkpoints = BTreeMap::new();
        checkpoints.insert(7u32, Mark::new(1, 100, Default::default(), Default::default()));
        assert_eq!(
            checkpoint_not_found_message("5", &checkpoints),
            "Checkpoint 5 not found.\nValid checkpoints: 7\n"
        );
        assert_eq!(
            checkpoint_not_found_message("5", &BTreeMap::new()),
            "Checkpoint 5 not found.\nValid checkpoints:\n"
        );
    }

    #[test]
    fn restart_from_missing_checkpoint_fails_cleanly() {
        let mut h = harness(vec![]);
        dispatch(&mut h, &magic_write(0x0100_0007));
        let mark_id = h.server.checkpoints[&7].id();

        let req = GdbRequest::new_restart(GdbRestartType::RestartFromCheckpoint, 5);
        h.server.restart_session(&req);

        assert_eq!(
            *h.replies.borrow(),
            vec![Reply::SetMem(true), Reply::RestartFailed]
        );
        // No state change: map and marks intact, nothing was seeked.
        assert_eq!(h.server.checkpoints[&7].id(), mark_id);
        assert!(h.server.debugger_restart_mark.is_none());
        assert!(h.rec.borrow().seeks.is_empty());
    }

    #[test]
    fn restart_from_checkpoint_seeks_and_reanchors() {
        let mut h = harness(vec![]);
        dispatch(&mut h, &magic_write(0x0100_0007));
        let ckpt_id = h.server.checkpoints[&7].id();

        // Pretend the debugger attached somewhere later.
        let old_anchor = h.server.timeline_unwrap_mut().add_explicit_checkpoint();
        let old_anchor_id = old_anchor.id();
        h.server.debugger_restart_mark = Some(old_anchor);
        h.server
            .timeline_unwrap_mut()
            .current_session_mut()
            .set_trace_time(200);

        let req = GdbRequest::new_restart(GdbRestartType::RestartFromCheckpoint, 7);
        h.server.restart_session(&req);

        // Breakpoints were cleared for the seek, the timeline was moved to
        // the stored mark, and the restart anchor was replaced.
        assert_eq!(h.rec.borrow().removed_all, 1);
        assert_eq!(*h.rec.borrow().seeks, vec![ckpt_id]);
        assert_eq!(h.server.session(SessionRef::Timeline).trace_time(), 100);
        assert_eq!(h.server.debugger_restart_mark.as_ref().unwrap().id(), ckpt_id);
        assert!(!h
            .rec
            .borrow()
            .live_checkpoints
            .contains(&old_anchor_id));
    }

    #[test]
    fn restart_from_event_replays_forward_to_target() {
        let mut h = harness(vec![]);
        h.rec.borrow_mut().advance_on_forward_step = true;
        h.server.target.pid = Some(TID);
        h.server
            .timeline_unwrap_mut()
            .current_session_mut()
            .set_trace_time(500);

        let req = GdbRequest::new_restart(GdbRestartType::RestartFromEvent, 150);
        h.server.restart_session(&req);

        assert_eq!(*h.rec.borrow().seeks_before_event, vec![150]);
        // Seeked to 149, then stepped forward until past the target event.
        assert_eq!(h.rec.borrow().steps.len(), 2);
        assert_eq!(h.server.session(SessionRef::Timeline).trace_time(), 151);
        // Activation re-anchored the restart mark and retargeted.
        assert!(h.server.debugger_restart_mark.is_some());
        assert_eq!(h.server.target.event, 151);
        assert_eq!(h.server.target.pid, Some(TID));
    }

    #[test]
    fn debug_one_step_reports_breakpoint_stop() {
        let mut h = harness(vec![cont_req(
            RunDirection::RunForward,
            GdbActionType::ActionContinue,
        )]);
        h.rec.borrow_mut().step_results.push_back(ReplayResult {
            status: ReplayStatus::ReplayContinue,
            break_status: break_status(|s| s.breakpoint_hit = true),
        });

        let mut direction = RunDirection::RunForward;
        assert_eq!(
            h.server.debug_one_step(&mut direction),
            ContinueOrStop::ContinueDebugging
        );
        assert_eq!(
            *h.rec.borrow().steps,
            vec![(RunCommand::Continue, RunDirection::RunForward, 0)]
        );
        assert_eq!(
            *h.replies.borrow(),
            vec![Reply::Stop(GdbThreadId::new(TID, TID), SIGTRAP, 0)]
        );
    }

    #[test]
    fn reverse_step_to_start_reports_stop_not_exit() {
        let mut h = harness(vec![cont_req(
            RunDirection::RunBackward,
            GdbActionType::ActionStep,
        )]);
        h.rec.borrow_mut().step_results.push_back(ReplayResult {
            status: ReplayStatus::ReplayContinue,
            break_status: break_status(|s| s.task_exit = true),
        });

        let mut direction = RunDirection::RunForward;
        assert_eq!(
            h.server.debug_one_step(&mut direction),
            ContinueOrStop::ContinueDebugging
        );
        assert_eq!(direction, RunDirection::RunBackward);
        // Reinterpreted as a completed singlestep: SIGTRAP, never the fake
        // SIGKILL of a forward last-thread exit.
        assert_eq!(
            *h.replies.borrow(),
            vec![Reply::Stop(GdbThreadId::new(TID, TID), SIGTRAP, 0)]
        );
    }

    #[test]
    fn replay_exit_enters_terminated_state() {
        let mut h = harness(vec![
            cont_req(RunDirection::RunForward, GdbActionType::ActionContinue),
            GdbRequest::new(GdbRequestType::Detach),
        ]);
        h.rec.borrow_mut().step_results.push_back(ReplayResult {
            status: ReplayStatus::ReplayExited,
            break_status: Default::default(),
        });

        let mut direction = RunDirection::RunForward;
        assert_eq!(
            h.server.debug_one_step(&mut direction),
            ContinueOrStop::StopDebugging
        );
        assert_eq!(
            *h.replies.borrow(),
            vec![Reply::ExitCode(0), Reply::Detach]
        );
    }

    #[test]
    fn forward_last_thread_exit_waits_for_verdict() {
        let mut h = harness(vec![
            cont_req(RunDirection::RunForward, GdbActionType::ActionContinue),
            GdbRequest::new(GdbRequestType::Detach),
        ]);
        h.rec.borrow_mut().step_results.push_back(ReplayResult {
            status: ReplayStatus::ReplayContinue,
            break_status: break_status(|s| s.task_exit = true),
        });

        let mut direction = RunDirection::RunForward;
        assert_eq!(
            h.server.debug_one_step(&mut direction),
            ContinueOrStop::StopDebugging
        );
        assert_eq!(
            *h.replies.borrow(),
            vec![
                Reply::Stop(GdbThreadId::new(TID, TID), SIGKILL, 0),
                Reply::Detach,
            ]
        );
    }

    #[test]
    fn off_debuggee_task_steps_without_asking() {
        let mut session = make_session(100);
        session.kill_all_tasks();
        session.add_task(Task::new(
            TaskUid::new_with(2000, 1),
            ThreadGroupUid::new_with(2000, 1),
            2000,
            "other",
            SupportedArch::X64,
        ));
        let mut h = harness_with(session, vec![]);

        let mut direction = RunDirection::RunForward;
        assert_eq!(
            h.server.debug_one_step(&mut direction),
            ContinueOrStop::ContinueDebugging
        );
        // One silent forward step, no debugger traffic.
        assert_eq!(h.rec.borrow().steps.len(), 1);
        assert!(h.replies.borrow().is_empty());
        assert!(h.requests.borrow().len() == 0);
    }

    #[test]
    fn event_step_overlay_rewrites_resume() {
        let mut h = harness_with(make_session(0), vec![cont_req(
            RunDirection::RunForward,
            GdbActionType::ActionContinue,
        )]);
        Flags::set(Flags {
            singlestep_to_event: 1,
        });
        let req = h
            .server
            .process_debugger_requests(Some(tuid()), ReportState::ReportNormal);
        Flags::set(Flags::default());

        assert!(req.is_resume_request());
        assert!(req.suppress_debugger_stop);
        assert_eq!(req.cont().actions.len(), 1);
        assert_eq!(req.cont().actions[0].type_, GdbActionType::ActionStep);
        assert_eq!(req.cont().actions[0].target, GdbThreadId::new(TID, TID));
    }

    #[test]
    fn init_script_is_published_blob() {
        let script = GdbServer::init_script();
        assert!(script.starts_with("define checkpoint\n"));
        assert!(script.contains(
            "  p (*(int*)29298 = 0x01000000 | $_next_checkpoint_index), $_next_checkpoint_index++\n"
        ));
        assert!(script.contains("define delete checkpoint\n  p (*(int*)29298 = 0x02000000 | $arg0), $arg0\nend\n"));
        assert!(script.contains("define when\n  p *(long long int*)(29298 + 4)\nend\n"));
        assert!(script
            .contains("define hook-run\n  if $_thread != 0 && !$suppress_run_hook\n    stepi\n  end\nend\n"));
        assert!(script.contains("set target-async 0\nmaint set target-async 0\n"));
        assert!(script.ends_with("handle SIGURG stop\n"));
    }

    struct TestAcceptor {
        requests: Rc<RefCell<VecDeque<GdbRequest>>>,
        replies: Rc<RefCell<Vec<Reply>>>,
        accepted: u32,
    }

    impl GdbConnectionAcceptor for TestAcceptor {
        fn await_debugger(
            &mut self,
            listen_fd: &ScopedFd,
            _tgid: pid_t,
            features: GdbConnectionFeatures,
        ) -> Box<dyn GdbConnection> {
            assert!(listen_fd.is_open());
            self.accepted += 1;
            Box::new(ScriptedConnection {
                requests: self.requests.clone(),
                replies: self.replies.clone(),
                features,
            })
        }
    }

    #[test]
    fn serve_replay_binds_writes_params_and_serves() {
        let rec = Rc::new(RefCell::new(TimelineRec::new()));
        rec.borrow_mut().advance_on_forward_step = true;
        let timeline = FakeTimeline {
            session: make_session(100),
            rec: rec.clone(),
        };
        let mut server = GdbServer::new(Box::new(timeline), Target::new());

        let requests = Rc::new(RefCell::new(VecDeque::from(vec![GdbRequest::new(
            GdbRequestType::Detach,
        )])));
        let replies: Rc<RefCell<Vec<Reply>>> = Rc::new(RefCell::new(Vec::new()));
        let mut acceptor = TestAcceptor {
            requests,
            replies: replies.clone(),
            accepted: 0,
        };

        let (params_read, params_write) = pipe().unwrap();
        let flags = ConnectionFlags {
            dbg_port: None,
            dbg_host: LOCALHOST_ADDR.to_owned(),
            debugger_params_write_pipe: Some(ScopedFd::from_raw(params_write)),
        };
        server.serve_replay(flags, &mut acceptor);

        assert_eq!(acceptor.accepted, 1);
        assert_eq!(*replies.borrow(), vec![Reply::Detach]);
        assert!(server.debugger_restart_mark.is_some());
        assert_eq!(server.debuggee_tguid, tguid());

        let mut params = DebuggerParams::default();
        let nread = read(params_read, crate::util::u8_slice_mut(&mut params)).unwrap();
        assert_eq!(nread, mem::size_of::<DebuggerParams>());
        let port = params.port;
        assert!(port > 0);
        let host_len = params.host.iter().position(|&b| b == 0).unwrap();
        assert_eq!(&params.host[0..host_len], LOCALHOST_ADDR.as_bytes());
        let exe_len = params.exe_image.iter().position(|&b| b == 0).unwrap();
        assert_eq!(&params.exe_image[0..exe_len], b"/bin/true");
        // The pipe was closed after the write.
        assert_eq!(read(params_read, &mut [0u8; 8]).unwrap(), 0);
        let _ = nix::unistd::close(params_read);
    }

    #[test]
    fn emergency_debug_serves_without_a_timeline() {
        let session = make_session(5);
        let requests = Rc::new(RefCell::new(VecDeque::from(vec![
            GdbRequest::new(GdbRequestType::GetCurrentThread),
            GdbRequest::new(GdbRequestType::Detach),
        ])));
        let replies: Rc<RefCell<Vec<Reply>>> = Rc::new(RefCell::new(Vec::new()));
        let mut acceptor = TestAcceptor {
            requests,
            replies: replies.clone(),
            accepted: 0,
        };

        GdbServer::emergency_debug(session, tuid(), &mut acceptor);

        assert_eq!(acceptor.accepted, 1);
        assert_eq!(
            *replies.borrow(),
            vec![
                Reply::CurrentThread(GdbThreadId::new(TID, TID)),
                Reply::Detach,
            ]
        );
    }
}
