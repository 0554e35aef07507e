//! Cooperative cancel signal for outbound transfers.
//!
//! Clones share state. Send loops poll [`CancelSignal::is_cancelled`] once
//! per chunk; nothing is interrupted mid-operation. Once raised, the signal
//! stays raised for the life of the node.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Default, Clone)]
pub struct CancelSignal {
    cancelled: Arc<AtomicBool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_state() {
        let a = CancelSignal::new();
        let b = a.clone();
        assert!(!b.is_cancelled());
        a.cancel();
        assert!(b.is_cancelled());
        assert!(!CancelSignal::new().is_cancelled());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let signal = CancelSignal::new();
        signal.cancel();
        signal.cancel();
        assert!(signal.is_cancelled());
    }
}
