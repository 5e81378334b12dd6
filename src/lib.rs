//! revd: the debugger-facing control core of a deterministic
//! record-and-replay system.
//!
//! This crate mediates between an external debugger speaking the gdb remote
//! protocol and a replay engine that can move a recorded process forward or
//! backward across a timeline of events. The wire codec and the engine
//! itself live behind the `GdbConnection` and `ReplayTimeline` seams; what
//! lives here is the request dispatcher, the diversion manager for inferior
//! function calls, the resume/step loop with reverse-execution handling, the
//! checkpoint/restart manager and the magic-address back-channel.

#![allow(clippy::too_many_arguments)]

#[macro_use]
extern crate lazy_static;

#[macro_use]
pub mod log;

pub mod breakpoint_condition;
pub mod extra_registers;
pub mod flags;
pub mod gdb_connection;
pub mod gdb_expression;
pub mod gdb_register;
pub mod gdb_server;
pub mod registers;
pub mod remote_ptr;
pub mod replay_timeline;
pub mod scoped_fd;
pub mod session;
pub mod taskish_uid;
pub mod util;
