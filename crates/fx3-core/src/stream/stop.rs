//! Cooperative cancellation flag shared with the interrupt handler.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Set once from any thread, observed by the dispatch loop and every completion.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the streaming session to stop. Idempotent.
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_visible_through_clones() {
        let stop = StopSignal::new();
        let handler = stop.clone();
        assert!(!stop.is_requested());

        std::thread::spawn(move || handler.request()).join().unwrap();
        assert!(stop.is_requested());

        stop.request();
        assert!(stop.is_requested());
    }
}
