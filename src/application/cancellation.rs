//! Cooperative cancellation shared by every worker.
//!
//! The flag is polled at chunk and part boundaries. Sleeping code waits on
//! the channel instead, which disconnects the moment `cancel` is called.

use crossbeam_channel::{after, bounded, select, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::domain::errors::{ArchiveError, Result};

#[derive(Debug, Clone)]
pub struct CancellationSignal {
    flag: Arc<AtomicBool>,
    /// Dropped on cancel; every cloned receiver then sees a disconnect.
    trigger: Arc<Mutex<Option<Sender<()>>>>,
    wake: Receiver<()>,
}

impl Default for CancellationSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationSignal {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            trigger: Arc::new(Mutex::new(Some(tx))),
            wake: rx,
        }
    }

    /// Raises the signal. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        if let Ok(mut guard) = self.trigger.lock() {
            guard.take();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once the signal is raised.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ArchiveError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleeps for `delay`, returning early if cancelled.
    ///
    /// Returns `true` if the full delay elapsed.
    pub fn sleep(&self, delay: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        select! {
            recv(self.wake) -> _ => false,
            recv(after(delay)) -> _ => !self.is_cancelled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_cancel_is_visible_to_clones() {
        let signal = CancellationSignal::new();
        let clone = signal.clone();
        assert!(clone.check().is_ok());
        signal.cancel();
        signal.cancel();
        assert!(clone.is_cancelled());
        assert!(matches!(clone.check(), Err(ArchiveError::Cancelled)));
    }

    #[test]
    fn test_sleep_wakes_on_cancel() {
        let signal = CancellationSignal::new();
        let clone = signal.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            clone.cancel();
        });
        let started = Instant::now();
        assert!(!signal.sleep(Duration::from_secs(30)));
        assert!(started.elapsed() < Duration::from_secs(10));
        handle.join().unwrap();
    }

    #[test]
    fn test_sleep_completes_when_not_cancelled() {
        let signal = CancellationSignal::new();
        assert!(signal.sleep(Duration::from_millis(5)));
    }
}
