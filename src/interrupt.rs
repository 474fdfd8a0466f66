use crate::error::RaftError;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};

/// A level-triggered cancellation signal.
///
/// Every blocking operation in this crate takes an `Interruptor`; once it
/// fires it stays fired. `Interruptor::never()` is the non-interruptible
/// signal used by callers that intend to wait indefinitely.
#[derive(Debug, Clone)]
pub struct Interruptor {
    rx: watch::Receiver<bool>,
}

impl Interruptor {
    /// An interruptor that never fires.
    pub fn never() -> Self {
        static NEVER: std::sync::OnceLock<watch::Sender<bool>> = std::sync::OnceLock::new();
        let tx = NEVER.get_or_init(|| watch::channel(false).0);
        Self { rx: tx.subscribe() }
    }

    pub fn is_fired(&self) -> bool {
        *self.rx.borrow()
    }

    /// Returns `Err(RaftError::Interrupted)` if already fired.
    pub fn check(&self) -> Result<(), RaftError> {
        if self.is_fired() {
            Err(RaftError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Resolves once the signal fires. If the owning trigger is dropped
    /// without firing, this pends forever.
    pub async fn fired(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// The firing end of an [`Interruptor`].
#[derive(Debug)]
pub struct Trigger {
    tx: watch::Sender<bool>,
}

impl Trigger {
    pub fn new() -> (Trigger, Interruptor) {
        let (tx, rx) = watch::channel(false);
        (Trigger { tx }, Interruptor { rx })
    }

    pub fn fire(&self) {
        let _ = self.tx.send(true);
    }

    pub fn subscribe(&self) -> Interruptor {
        Interruptor {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Trigger {
    fn default() -> Self {
        Self::new().0
    }
}

/// A reference-counted shutdown latch.
///
/// While a [`DrainGuard`] is held, [`DrainLatch::drain`] blocks; once
/// draining has begun, further acquisitions are rejected. The latch's
/// interruptor fires when draining begins, so in-flight work holding a
/// guard is asked to stop promptly rather than merely waited out.
#[derive(Debug)]
pub struct DrainLatch {
    trigger: Trigger,
    count: Arc<AtomicUsize>,
    draining: Arc<AtomicBool>,
    zero: Arc<Notify>,
}

#[derive(Debug)]
pub struct DrainGuard {
    count: Arc<AtomicUsize>,
    zero: Arc<Notify>,
}

impl DrainLatch {
    pub fn new() -> Self {
        Self {
            trigger: Trigger::new().0,
            count: Arc::new(AtomicUsize::new(0)),
            draining: Arc::new(AtomicBool::new(false)),
            zero: Arc::new(Notify::new()),
        }
    }

    /// Takes a keepalive on the latch, or `None` if draining has begun.
    pub fn acquire(&self) -> Option<DrainGuard> {
        self.count.fetch_add(1, Ordering::AcqRel);
        if self.draining.load(Ordering::Acquire) {
            // Lost the race against drain(); undo.
            if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
                self.zero.notify_waiters();
            }
            return None;
        }
        Some(DrainGuard {
            count: self.count.clone(),
            zero: self.zero.clone(),
        })
    }

    /// The signal that fires when draining begins.
    pub fn interruptor(&self) -> Interruptor {
        self.trigger.subscribe()
    }

    /// Fires the interruptor without waiting for guards.
    pub fn fire(&self) {
        self.draining.store(true, Ordering::Release);
        self.trigger.fire();
    }

    /// Rejects new guards, fires the interruptor, and waits until every
    /// outstanding guard has been dropped.
    pub async fn drain(&self) {
        self.fire();
        loop {
            let notified = self.zero.notified();
            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Default for DrainLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.zero.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn trigger_fires_interruptor() {
        let (trigger, interruptor) = Trigger::new();
        assert!(!interruptor.is_fired());
        assert!(interruptor.check().is_ok());
        trigger.fire();
        assert!(interruptor.is_fired());
        assert_eq!(interruptor.check(), Err(RaftError::Interrupted));
        interruptor.fired().await;
    }

    #[tokio::test]
    async fn drain_waits_for_guards() {
        let latch = Arc::new(DrainLatch::new());
        let guard = latch.acquire().expect("not draining yet");

        let latch2 = latch.clone();
        let drained = tokio::spawn(async move { latch2.drain().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!drained.is_finished());
        // New acquisitions are rejected once draining has begun.
        assert!(latch.acquire().is_none());
        assert!(latch.interruptor().is_fired());

        drop(guard);
        drained.await.unwrap();
    }

    #[tokio::test]
    async fn drain_with_no_guards_returns_immediately() {
        let latch = DrainLatch::new();
        latch.drain().await;
        assert!(latch.acquire().is_none());
    }
}
