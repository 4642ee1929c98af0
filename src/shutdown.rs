//! Shutdown coordination (spec §5: "Shutdown sets a drain flag; new
//! operations receive `shutting-down`. Workers finish their current unit,
//! then exit.").

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Default)]
pub struct ShutdownFlag(AtomicBool);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
