use crate::session::address_space::AddressSpace;
use crate::session::task::Task;

/// A predicate deciding whether a breakpoint or watchpoint hit should stop
/// the debuggee. The engine evaluates it against the stopped task each time
/// the trap fires; installs without a condition always stop.
pub trait BreakpointCondition {
    fn evaluate(&self, t: &Task, vm: &AddressSpace) -> bool;
}
