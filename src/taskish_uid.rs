use libc::pid_t;

/// An ID that's unique within a session (and consistent across the replay
/// sessions a timeline manages for the same trace), used for Tasks and
/// ThreadGroups. Needed because tids can be recycled during a long-running
/// replay.
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct TaskUid {
    tid: pid_t,
    serial: u32,
}

impl TaskUid {
    pub fn new_with(tid: pid_t, serial: u32) -> TaskUid {
        TaskUid { tid, serial }
    }

    pub fn tid(&self) -> pid_t {
        self.tid
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }
}

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct ThreadGroupUid {
    tid: pid_t,
    serial: u32,
}

impl ThreadGroupUid {
    pub fn new_with(tid: pid_t, serial: u32) -> ThreadGroupUid {
        ThreadGroupUid { tid, serial }
    }

    pub fn tid(&self) -> pid_t {
        self.tid
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }
}
