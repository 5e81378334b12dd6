//! The request/reply vocabulary of the debugger connection.
//!
//! A connection presents parsed requests and typed reply methods; the wire
//! codec behind it is not this crate's business. The dispatcher's contract
//! is that exactly one reply method is called for every non-resume request
//! before the next request is read.

use crate::gdb_register::GdbRegister;
use crate::registers::MAX_REG_SIZE_BYTES;
use crate::remote_ptr::{RemotePtr, Void};
use crate::replay_timeline::RunDirection;
use crate::scoped_fd::ScopedFd;
use libc::pid_t;

/// A debugger-side thread id. Values `<= 0` mean "any".
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct GdbThreadId {
    pub pid: pid_t,
    pub tid: pid_t,
}

impl GdbThreadId {
    pub const ANY: GdbThreadId = GdbThreadId { pid: 0, tid: 0 };
    pub const ALL: GdbThreadId = GdbThreadId { pid: -1, tid: -1 };

    pub fn new(pid: pid_t, tid: pid_t) -> GdbThreadId {
        GdbThreadId { pid, tid }
    }
}

impl Default for GdbThreadId {
    fn default() -> GdbThreadId {
        GdbThreadId::ANY
    }
}

/// Represents a possibly-undefined register `name`. `size` indicates how
/// many bytes of `value` are valid, if any.
#[derive(Clone, Debug)]
pub struct GdbRegisterValue {
    pub name: GdbRegister,
    pub value: [u8; MAX_REG_SIZE_BYTES],
    pub defined: bool,
    pub size: usize,
}

impl GdbRegisterValue {
    pub const MAX_SIZE: usize = MAX_REG_SIZE_BYTES;

    pub fn undefined(name: GdbRegister) -> GdbRegisterValue {
        GdbRegisterValue {
            name,
            value: [0; MAX_REG_SIZE_BYTES],
            defined: false,
            size: 0,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.value[0..self.size]
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum GdbRequestType {
    None,
    GetCurrentThread,
    GetOffsets,
    GetThreadList,
    GetIsThreadAlive,
    GetThreadExtraInfo,
    SetContinueThread,
    SetQueryThread,
    Interrupt,
    GetAuxv,
    GetMem,
    SetMem,
    GetReg,
    GetRegs,
    SetReg,
    GetStopReason,
    SetSwBreak,
    RemoveSwBreak,
    SetHwBreak,
    RemoveHwBreak,
    SetRdWatch,
    RemoveRdWatch,
    SetWrWatch,
    RemoveWrWatch,
    SetRdWrWatch,
    RemoveRdWrWatch,
    ReadSiginfo,
    WriteSiginfo,
    Cont,
    Restart,
    Detach,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum GdbActionType {
    ActionContinue,
    ActionStep,
}

#[derive(Copy, Clone, Debug)]
pub struct GdbContAction {
    pub type_: GdbActionType,
    pub target: GdbThreadId,
    pub signal_to_deliver: i32,
}

impl GdbContAction {
    pub fn new(type_: GdbActionType, target: GdbThreadId, signal_to_deliver: i32) -> GdbContAction {
        GdbContAction {
            type_,
            target,
            signal_to_deliver,
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum GdbRestartType {
    RestartFromPrevious,
    RestartFromEvent,
    RestartFromCheckpoint,
}

#[derive(Clone, Default, Debug)]
pub struct GdbRequestMem {
    pub addr: RemotePtr<Void>,
    pub len: usize,
    /// Only for SetMem.
    pub data: Vec<u8>,
}

#[derive(Clone, Default, Debug)]
pub struct GdbRequestWatch {
    pub addr: RemotePtr<Void>,
    /// Interpreted differently for different requests: for software
    /// breakpoints it is the size of the breakpoint instruction, for
    /// watchpoints the watched byte count.
    pub kind: i32,
    /// Bytecode expressions: the breakpoint fires when any of them fails to
    /// evaluate or evaluates to nonzero.
    pub conditions: Vec<Vec<u8>>,
}

#[derive(Clone, Debug)]
pub struct GdbRequestCont {
    pub run_direction: RunDirection,
    pub actions: Vec<GdbContAction>,
}

#[derive(Clone, Debug)]
pub struct GdbRequestRestart {
    pub type_: GdbRestartType,
    pub param: u64,
    pub param_str: String,
}

/// One parsed debugger request: a discriminant plus the payload that kind
/// of request carries. Accessors panic if the payload doesn't match the
/// discriminant, which would be a connection-codec bug.
#[derive(Clone, Debug)]
pub struct GdbRequest {
    pub type_: GdbRequestType,
    pub target: GdbThreadId,
    pub suppress_debugger_stop: bool,
    mem: Option<GdbRequestMem>,
    reg: Option<GdbRegisterValue>,
    watch: Option<GdbRequestWatch>,
    cont: Option<GdbRequestCont>,
    restart: Option<GdbRequestRestart>,
}

impl GdbRequest {
    pub fn new(type_: GdbRequestType) -> GdbRequest {
        GdbRequest {
            type_,
            target: GdbThreadId::ANY,
            suppress_debugger_stop: false,
            mem: None,
            reg: None,
            watch: None,
            cont: None,
            restart: None,
        }
    }

    pub fn new_mem(type_: GdbRequestType, addr: RemotePtr<Void>, len: usize) -> GdbRequest {
        let mut req = GdbRequest::new(type_);
        req.mem = Some(GdbRequestMem {
            addr,
            len,
            data: Vec::new(),
        });
        req
    }

    pub fn new_reg(type_: GdbRequestType, reg: GdbRegisterValue) -> GdbRequest {
        let mut req = GdbRequest::new(type_);
        req.reg = Some(reg);
        req
    }

    pub fn new_watch(
        type_: GdbRequestType,
        addr: RemotePtr<Void>,
        kind: i32,
    ) -> GdbRequest {
        let mut req = GdbRequest::new(type_);
        req.watch = Some(GdbRequestWatch {
            addr,
            kind,
            conditions: Vec::new(),
        });
        req
    }

    pub fn new_cont(run_direction: RunDirection, actions: Vec<GdbContAction>) -> GdbRequest {
        let mut req = GdbRequest::new(GdbRequestType::Cont);
        req.cont = Some(GdbRequestCont {
            run_direction,
            actions,
        });
        req
    }

    pub fn new_restart(type_: GdbRestartType, param: u64) -> GdbRequest {
        let mut req = GdbRequest::new(GdbRequestType::Restart);
        req.restart = Some(GdbRequestRestart {
            type_,
            param,
            param_str: param.to_string(),
        });
        req
    }

    /// A resume request requires the caller to advance the session; the
    /// dispatcher refuses them.
    pub fn is_resume_request(&self) -> bool {
        self.type_ == GdbRequestType::Cont
    }

    pub fn mem(&self) -> &GdbRequestMem {
        self.mem.as_ref().unwrap()
    }

    pub fn mem_mut(&mut self) -> &mut GdbRequestMem {
        self.mem.as_mut().unwrap()
    }

    pub fn reg(&self) -> &GdbRegisterValue {
        self.reg.as_ref().unwrap()
    }

    pub fn watch(&self) -> &GdbRequestWatch {
        self.watch.as_ref().unwrap()
    }

    pub fn watch_mut(&mut self) -> &mut GdbRequestWatch {
        self.watch.as_mut().unwrap()
    }

    pub fn cont(&self) -> &GdbRequestCont {
        self.cont.as_ref().unwrap()
    }

    pub fn cont_mut(&mut self) -> &mut GdbRequestCont {
        self.cont.as_mut().unwrap()
    }

    pub fn restart(&self) -> &GdbRequestRestart {
        self.restart.as_ref().unwrap()
    }
}

impl Default for GdbRequest {
    fn default() -> GdbRequest {
        GdbRequest::new(GdbRequestType::None)
    }
}

#[derive(Copy, Clone, Debug)]
pub struct GdbConnectionFeatures {
    pub reverse_execution: bool,
}

impl Default for GdbConnectionFeatures {
    fn default() -> Self {
        Self {
            reverse_execution: true,
        }
    }
}

/// The state of one debugger connection: requests come out, replies and
/// notifications go in. Implementations own the wire protocol; this trait
/// is what the control core sees.
pub trait GdbConnection {
    /// Block until the debugger's next request is available.
    fn get_request(&mut self) -> GdbRequest;

    /// Non-blocking: is a packet waiting? Polled during long replay steps
    /// so an interrupt can abort them.
    fn sniff_packet(&mut self) -> bool;

    fn features(&self) -> GdbConnectionFeatures;

    fn reply_get_current_thread(&mut self, thread: GdbThreadId);

    fn reply_get_offsets(&mut self);

    fn reply_get_thread_list(&mut self, threads: &[GdbThreadId]);

    fn reply_get_is_thread_alive(&mut self, alive: bool);

    fn reply_get_thread_extra_info(&mut self, info: &str);

    fn reply_select_thread(&mut self, ok: bool);

    fn reply_get_auxv(&mut self, auxv: &[u8]);

    fn reply_get_mem(&mut self, mem: &[u8]);

    fn reply_set_mem(&mut self, ok: bool);

    fn reply_get_reg(&mut self, reg: &GdbRegisterValue);

    fn reply_get_regs(&mut self, file: &[GdbRegisterValue]);

    fn reply_set_reg(&mut self, ok: bool);

    fn reply_get_stop_reason(&mut self, which: GdbThreadId, sig: i32);

    fn reply_watchpoint_request(&mut self, ok: bool);

    fn reply_read_siginfo(&mut self, si_bytes: &[u8]);

    fn reply_write_siginfo(&mut self);

    fn reply_detach(&mut self);

    fn notify_stop(&mut self, thread: GdbThreadId, sig: i32, watch_addr: RemotePtr<Void>);

    fn notify_restart_failed(&mut self);

    fn notify_exit_code(&mut self, code: i32);

    fn notify_no_such_thread(&mut self, req: &GdbRequest);
}

/// Produces a connection once a debugger attaches to `listen_fd`. The
/// accept-and-handshake logic (and the codec it configures) lives behind
/// this seam.
pub trait GdbConnectionAcceptor {
    fn await_debugger(
        &mut self,
        listen_fd: &ScopedFd,
        tgid: pid_t,
        features: GdbConnectionFeatures,
    ) -> Box<dyn GdbConnection>;
}
