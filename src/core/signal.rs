//! # Single-slot restart signal.
//!
//! [`RestartSignal`] coalesces any number of restart requests into at most one
//! pending restart.
//!
//! ```text
//! request() ──► slot empty? ──yes──► fill slot, wake waiter
//!                    │
//!                    └─no──► count as coalesced, return
//!
//! take()  ──► empty the slot, report whether it was full (never blocks)
//! recv()  ──► wait until the slot is full, then empty it
//! ```
//!
//! ## Rules
//! - `request()` never blocks and never fails.
//! - At any observation point at most one restart is pending.
//! - If the slot was empty before a burst of requests, exactly one restart is
//!   observed after it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::Notify;

/// Coalescing restart signal shared by the supervisor, its watchdog and callers.
#[derive(Debug, Default)]
pub struct RestartSignal {
    pending: AtomicBool,
    coalesced: AtomicU64,
    notify: Notify,
}

impl RestartSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a restart. Returns `false` if one was already pending.
    pub fn request(&self) -> bool {
        if self.pending.swap(true, Ordering::AcqRel) {
            self.coalesced.fetch_add(1, Ordering::Relaxed);
            false
        } else {
            self.notify.notify_one();
            true
        }
    }

    /// Consumes the pending restart, if any.
    pub fn take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Waits for a pending restart and consumes it. Cancel safe.
    pub async fn recv(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.take() {
                return;
            }
            notified.await;
        }
    }

    /// Requests that collapsed into an already pending restart.
    pub fn coalesced(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_burst_collapses_to_one() {
        let signal = Arc::new(RestartSignal::new());
        let threads: Vec<_> = (0..16)
            .map(|_| {
                let s = Arc::clone(&signal);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        s.request();
                        assert!(s.is_pending());
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert!(signal.take());
        assert!(!signal.take());
        assert_eq!(signal.coalesced(), 16 * 100 - 1);
    }

    #[test]
    fn test_request_after_take_fills_again() {
        let signal = RestartSignal::new();
        assert!(signal.request());
        assert!(!signal.request());
        assert!(signal.take());
        assert!(signal.request());
        assert!(signal.is_pending());
    }

    #[tokio::test]
    async fn test_recv_wakes_on_request() {
        let signal = Arc::new(RestartSignal::new());
        let waiter = {
            let s = Arc::clone(&signal);
            tokio::spawn(async move { s.recv().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        signal.request();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(!signal.is_pending());
    }

    #[tokio::test]
    async fn test_recv_returns_immediately_when_pending() {
        let signal = RestartSignal::new();
        signal.request();
        tokio::time::timeout(Duration::from_millis(100), signal.recv())
            .await
            .unwrap();
        assert!(!signal.take());
    }
}
