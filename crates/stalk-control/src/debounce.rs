//! Cancelable single-shot delay: the latest scheduled value wins.

use std::time::Duration;
use tokio::task::JoinHandle;

pub const IDENTITY_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settled<T> {
    pub generation: u64,
    pub value: T,
}

/// Each `schedule` aborts the previous timer and bumps the generation. A value that fired just
/// before being superseded is rejected by [`Debouncer::accept`], so delivery order never matters.
pub struct Debouncer<T> {
    delay: Duration,
    generation: u64,
    pending: Option<JoinHandle<()>>,
    _value: std::marker::PhantomData<fn(T)>,
}

impl<T: Send + 'static> Debouncer<T> {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            generation: 0,
            pending: None,
            _value: std::marker::PhantomData,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn schedule<F>(&mut self, value: T, deliver: F) -> u64
    where
        F: FnOnce(Settled<T>) + Send + 'static,
    {
        self.cancel();
        self.generation += 1;
        let generation = self.generation;
        let delay = self.delay;
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            deliver(Settled { generation, value });
        }));
        generation
    }

    /// Drops the pending timer; anything it already delivered becomes stale.
    pub fn cancel(&mut self) {
        if let Some(task) = self.pending.take() {
            task.abort();
            self.generation += 1;
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// True when `generation` is the most recent schedule; consumes it.
    pub fn accept(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.pending.is_none() {
            return false;
        }
        self.pending = None;
        true
    }
}

impl<T> Drop for Debouncer<T> {
    fn drop(&mut self) {
        if let Some(task) = self.pending.take() {
            task.abort();
        }
    }
}
