use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Set by the presentation layer while the user is selecting rendered text.
/// Cloning shares the same flag.
#[derive(Debug, Clone, Default)]
pub struct SelectionGate {
    selecting: Arc<AtomicBool>,
}

impl SelectionGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_selecting(&self, selecting: bool) {
        self.selecting.store(selecting, Ordering::SeqCst);
    }

    pub fn is_selecting(&self) -> bool {
        self.selecting.load(Ordering::SeqCst)
    }
}
