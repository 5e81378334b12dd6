use crate::replay_timeline::FrameTime;
use std::sync::Mutex;

lazy_static! {
    static ref FLAGS: Mutex<Flags> = Mutex::new(Flags::new());
}

/// Process-global runtime configuration.
///
/// CLI parsing is the embedding program's business; it pushes whatever it
/// gathered in here once, before serving starts.
#[derive(Copy, Clone, Default)]
pub struct Flags {
    /// Replay instruction-by-instruction, with a diagnostic line per
    /// instruction, for all events up to this one. Zero disables it.
    pub singlestep_to_event: FrameTime,
}

impl Flags {
    fn new() -> Flags {
        Default::default()
    }

    pub fn get() -> Flags {
        *FLAGS.lock().unwrap()
    }

    pub fn set(flags: Flags) {
        *FLAGS.lock().unwrap() = flags;
    }
}
