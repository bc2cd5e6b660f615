use super::ring::{BoundedRingBuffer, Ring};
use crate::config::QueueConfig;
use crate::multicore::maybe_pin;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

type DispatchFn<T> = Box<dyn FnMut(T) + Send>;
type HookFn = Box<dyn FnOnce() + Send>;

/// Decouples fast producers from a slower consumer callback.
///
/// Producers hand items to a bounded ring without ever blocking. A single dedicated dispatcher
/// thread pops items in FIFO order and passes each one to the dispatch callback. The dispatcher
/// runs in bursts of at most `burst_limit` items and sleeps for `idle_sleep` between bursts or
/// when the ring is empty.
///
/// The dispatch callback must not panic. A panic terminates the dispatcher thread, is logged,
/// and is reported by [`flush`](DecouplingQueue::flush); nothing is dispatched after that.
pub struct DecouplingQueue<T> {
    name: String,
    ring: Arc<Ring<T>>,
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// State shared between producers, the dispatcher thread and the flushing thread.
#[derive(Default)]
struct Shared {
    /// Set as soon as a flush begins. Later pushes are rejected.
    closing: AtomicBool,
    /// Pushes that passed the `closing` check and have not finished yet.
    in_flight: AtomicUsize,
    /// Tells the dispatcher to leave its burst loop and drain.
    shutdown: AtomicBool,
    flushed: AtomicBool,
    stats: QueueStats,
}

impl Shared {
    /// Rejects further pushes, waits for the ones already accepted to reach the ring, then
    /// tells the dispatcher to drain.
    fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            thread::yield_now();
        }
        self.shutdown.store(true, Ordering::Release);
    }
}

#[derive(Clone, Copy)]
struct LoopSettings {
    burst_limit: usize,
    idle_sleep: Duration,
}

impl<T: Send + 'static> DecouplingQueue<T> {
    /// Creates a queue named `name` with the given dispatch callback and no init/term hooks.
    pub fn new<F>(name: &str, config: QueueConfig, dispatch_fn: F) -> Result<Self, QueueError>
    where
        F: FnMut(T) + Send + 'static,
    {
        DecouplingQueue::builder(name)
            .config(config)
            .dispatch(dispatch_fn)
            .spawn()
    }

    /// Returns a builder for a queue named `name`, using the default [`QueueConfig`].
    pub fn builder(name: &str) -> DecouplingQueueBuilder<T> {
        DecouplingQueueBuilder {
            name: name.to_owned(),
            config: QueueConfig::default(),
            dispatch_fn: None,
            init_fn: None,
            term_fn: None,
        }
    }

    /// Enqueues `item` without blocking.
    ///
    /// Returns [`PushError::Full`] when the ring has no room left; this layer applies no
    /// backpressure, the caller decides what to do with the returned item. Returns
    /// [`PushError::Closed`] once [`flush`](Self::flush) has been called.
    pub fn push(&self, item: T) -> Result<(), PushError<T>> {
        let shared = &self.shared;
        shared.in_flight.fetch_add(1, Ordering::SeqCst);
        if shared.closing.load(Ordering::SeqCst) {
            shared.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(PushError::Closed(item));
        }
        let result = match self.ring.push(item) {
            Ok(()) => {
                shared.stats.pushed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(item) => {
                shared.stats.rejected.fetch_add(1, Ordering::Relaxed);
                Err(PushError::Full(item))
            }
        };
        shared.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    /// Stops accepting items and blocks until the dispatcher has drained the ring, run the
    /// termination hook and exited.
    ///
    /// A push racing with `flush` either fails with [`PushError::Closed`] or is dispatched
    /// before `flush` returns. Calling `flush` again after it has returned is a no-op.
    pub fn flush(&self) -> Result<(), QueueError> {
        self.shared.close();

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return Ok(());
        };

        match handle.join() {
            Ok(()) => {
                log::info!("{}: flushed. {}", self.name, self.stats());
                Ok(())
            }
            Err(_) => {
                log::error!("{}: dispatcher thread panicked", self.name);
                Err(QueueError::DispatcherPanicked(self.name.clone()))
            }
        }
    }
}

impl<T> DecouplingQueue<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of items waiting in the ring.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Returns `true` once the dispatcher has drained the ring and run the termination hook.
    pub fn is_flushed(&self) -> bool {
        self.shared.flushed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> QueueStatsSnapshot {
        self.shared.stats.snapshot()
    }
}

impl<T> Drop for DecouplingQueue<T> {
    fn drop(&mut self) {
        self.shared.close();
        let handle = self
            .handle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("{}: dispatcher thread panicked", self.name);
            }
        }
    }
}

impl<T> fmt::Debug for DecouplingQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecouplingQueue")
            .field("name", &self.name)
            .field("len", &self.ring.len())
            .field("capacity", &self.ring.capacity())
            .field("flushed", &self.is_flushed())
            .finish()
    }
}

/* --------------------------------------------------------------------------------- */

/// Builder for a [`DecouplingQueue`]. The dispatch callback is mandatory.
pub struct DecouplingQueueBuilder<T> {
    name: String,
    config: QueueConfig,
    dispatch_fn: Option<DispatchFn<T>>,
    init_fn: Option<HookFn>,
    term_fn: Option<HookFn>,
}

impl<T: Send + 'static> DecouplingQueueBuilder<T> {
    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.config.capacity = capacity;
        self
    }

    pub fn burst_limit(mut self, burst_limit: usize) -> Self {
        self.config.burst_limit = burst_limit;
        self
    }

    pub fn idle_sleep(mut self, idle_sleep: Duration) -> Self {
        self.config.idle_sleep_us = u64::try_from(idle_sleep.as_micros()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the core the dispatcher thread is pinned to.
    pub fn core(mut self, core: usize) -> Self {
        self.config.core = Some(core);
        self
    }

    /// Sets the callback invoked once per item on the dispatcher thread.
    pub fn dispatch<F>(mut self, func: F) -> Self
    where
        F: FnMut(T) + Send + 'static,
    {
        self.dispatch_fn = Some(Box::new(func));
        self
    }

    /// Sets a hook run once on the dispatcher thread before the first item.
    pub fn on_init<F>(mut self, func: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.init_fn = Some(Box::new(func));
        self
    }

    /// Sets a hook run once on the dispatcher thread after the final drain.
    pub fn on_term<F>(mut self, func: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.term_fn = Some(Box::new(func));
        self
    }

    /// Allocates the ring and spawns the dispatcher thread.
    pub fn spawn(self) -> Result<DecouplingQueue<T>, QueueError> {
        let dispatch_fn = self.dispatch_fn.ok_or(QueueError::MissingDispatch)?;
        self.config
            .validate()
            .map_err(|e| QueueError::InvalidConfig(e.to_string()))?;

        let ring = Arc::new(Ring::new(&self.name, self.config.capacity));
        let shared = Arc::new(Shared::default());
        let settings = LoopSettings {
            burst_limit: self.config.burst_limit,
            idle_sleep: self.config.idle_sleep(),
        };

        let thread_name = format!("{}-dispatch", self.name);
        let core = self.config.core;
        let ring_ref = Arc::clone(&ring);
        let shared_ref = Arc::clone(&shared);
        let init_fn = self.init_fn;
        let term_fn = self.term_fn;

        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                maybe_pin(core, &thread_name);
                dispatcher_loop(
                    ring_ref.as_ref(),
                    &shared_ref,
                    settings,
                    dispatch_fn,
                    init_fn,
                    term_fn,
                );
            })?;

        log::info!(
            "{}: dispatcher started (capacity {}, burst limit {})",
            self.name,
            self.config.capacity,
            self.config.burst_limit
        );

        Ok(DecouplingQueue {
            name: self.name,
            ring,
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }
}

/// Body of the dispatcher thread.
fn dispatcher_loop<T, R>(
    ring: &R,
    shared: &Shared,
    settings: LoopSettings,
    mut dispatch_fn: DispatchFn<T>,
    init_fn: Option<HookFn>,
    term_fn: Option<HookFn>,
) where
    R: BoundedRingBuffer<T> + ?Sized,
{
    if let Some(init) = init_fn {
        init();
    }

    let mut burst = 0;
    while !shared.shutdown.load(Ordering::Acquire) {
        if burst < settings.burst_limit {
            if let Some(item) = ring.pop() {
                dispatch_fn(item);
                shared.stats.dispatched.fetch_add(1, Ordering::Relaxed);
                burst += 1;
                continue;
            }
        }
        if burst > 0 {
            shared.stats.bursts.fetch_add(1, Ordering::Relaxed);
        }
        burst = 0;
        thread::sleep(settings.idle_sleep);
    }

    // Shutdown: drain everything regardless of the burst limit.
    while let Some(item) = ring.pop() {
        dispatch_fn(item);
        shared.stats.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    if let Some(term) = term_fn {
        term();
    }
    shared.flushed.store(true, Ordering::Release);
}

/* --------------------------------------------------------------------------------- */

/// Thread-safe counters describing the traffic through a [`DecouplingQueue`].
#[derive(Default)]
pub struct QueueStats {
    /// Number of items accepted by `push`.
    pub pushed: AtomicU64,

    /// Number of items rejected because the ring was full.
    pub rejected: AtomicU64,

    /// Number of items handed to the dispatch callback.
    pub dispatched: AtomicU64,

    /// Number of completed dispatch bursts.
    pub bursts: AtomicU64,
}

impl QueueStats {
    pub fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            pushed: self.pushed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            bursts: self.bursts.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatsSnapshot {
    pub pushed: u64,
    pub rejected: u64,
    pub dispatched: u64,
    pub bursts: u64,
}

impl fmt::Display for QueueStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pushed: {}, rejected: {}, dispatched: {}, bursts: {}",
            self.pushed, self.rejected, self.dispatched, self.bursts
        )
    }
}

/* --------------------------------------------------------------------------------- */

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Dispatch function must be set via dispatch()")]
    MissingDispatch,

    #[error("Invalid queue configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to spawn dispatcher thread")]
    Spawn(#[from] std::io::Error),

    #[error("Dispatcher thread of queue {0} panicked")]
    DispatcherPanicked(String),
}

/// Error returned by [`DecouplingQueue::push`]. Carries the rejected item back to the caller.
#[derive(Error)]
pub enum PushError<T> {
    #[error("Queue is full")]
    Full(T),

    #[error("Queue is closed")]
    Closed(T),
}

impl<T> PushError<T> {
    pub fn into_inner(self) -> T {
        match self {
            PushError::Full(item) | PushError::Closed(item) => item,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, PushError::Full(_))
    }
}

impl<T> fmt::Debug for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Full(_) => f.write_str("Full(..)"),
            PushError::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}
