//! Close guards and completion signals shared by every relay.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("Mutex poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Listening = 0,
    Closing = 1,
    Closed = 2,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Listening,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Listening → Closing → Closed. Only one caller wins the move to Closing.
#[derive(Debug)]
pub struct Lifecycle(AtomicU8);

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self(AtomicU8::new(LifecycleState::Listening as u8))
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Returns true for the single caller that should run the close sequence.
    pub fn begin_close(&self) -> bool {
        self.0
            .compare_exchange(
                LifecycleState::Listening as u8,
                LifecycleState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn finish(&self) {
        self.0.store(LifecycleState::Closed as u8, Ordering::Release);
    }

    pub fn is_listening(&self) -> bool {
        self.state() == LifecycleState::Listening
    }
}

/// Fires once when a relay has fully ended. Any number of waiters.
#[derive(Debug, Clone, Default)]
pub struct ClosedSignal(CancellationToken);

impl ClosedSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&self) {
        self.0.cancel();
    }

    pub fn is_fired(&self) -> bool {
        self.0.is_cancelled()
    }

    pub async fn wait(&self) {
        self.0.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn only_one_closer_wins() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.is_listening());
        assert!(lifecycle.begin_close());
        assert!(!lifecycle.begin_close());
        assert_eq!(lifecycle.state(), LifecycleState::Closing);

        lifecycle.finish();
        assert_eq!(lifecycle.state(), LifecycleState::Closed);
        assert!(!lifecycle.begin_close());
    }

    #[tokio::test]
    async fn closed_signal_wakes_all_waiters() {
        let signal = ClosedSignal::new();
        let a = tokio::spawn({
            let signal = signal.clone();
            async move { signal.wait().await }
        });
        let b = tokio::spawn({
            let signal = signal.clone();
            async move { signal.wait().await }
        });

        assert!(!signal.is_fired());
        signal.fire();
        signal.fire();
        a.await.unwrap();
        b.await.unwrap();
        assert!(signal.is_fired());
        signal.wait().await;
    }

    #[test]
    fn lock_recovers_from_poison() {
        let mutex = Arc::new(Mutex::new(1));
        let clone = Arc::clone(&mutex);
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock().unwrap();
            panic!("poison");
        })
        .join();

        assert!(mutex.is_poisoned());
        assert_eq!(*lock(&mutex), 1);
    }
}
