//! A diversion lets the debugger run task(s) forward without replay, to
//! execute arbitrary code for its side effects ("call foo()" expressions).
//! A diversion is cloned off a replay session for the call frame, mutated
//! freely, then discarded when the call finishes. Tracees can easily get
//! into inconsistent states inside one; no attempt is made to detect or
//! rectify that.

use crate::session::{BreakStatus, Session, SessionKind};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum DiversionStatus {
    /// Some execution was done. diversion_step() can be called again.
    DiversionContinue,
    /// All tracees are dead. diversion_step() should not be called again.
    DiversionExited,
}

impl Default for DiversionStatus {
    fn default() -> Self {
        // Arbitrary
        DiversionStatus::DiversionContinue
    }
}

#[derive(Default)]
pub struct DiversionResult {
    pub status: DiversionStatus,
    pub break_status: BreakStatus,
}

impl Session {
    /// Clone this replay session into a mutable diversion. The replay
    /// session isn't touched. The clone inherits the memory image as-is,
    /// including whatever breakpoint instructions are currently applied, so
    /// callers flush timeline breakpoints down first if they want the
    /// diversion to observe them.
    pub fn clone_diversion(&self) -> Session {
        debug_assert!(self.is_replay());
        let mut diversion = Session::new(SessionKind::Diversion);
        for t in self.tasks().values() {
            diversion.add_task(t.clone());
        }
        *diversion.vm_mut() = self.vm().clone();
        diversion.set_current_task(self.current_task());
        diversion.set_trace_time(self.trace_time());
        if self.done_initial_exec() {
            diversion.set_done_initial_exec();
        }
        diversion
    }
}
