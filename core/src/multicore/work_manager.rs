use super::pin::maybe_pin;
use super::routing::worker_index;
use super::scheduler::{
    DeliveryError, Scheduler, SchedulerError, WorkId, Worker, WorkerFactory,
};
use crate::config::StageConfig;

use std::any::Any;
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, sleep, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use crossbeam::sync::ShardedLock;

thread_local! {
    static WORKER_KEY: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Returns the index of the calling worker thread within its stage, `None` outside worker
/// threads.
pub fn current_worker_key() -> Option<usize> {
    WORKER_KEY.with(|key| key.get())
}

/// In-process [`Scheduler`]: one bounded channel and one OS thread per worker.
///
/// Worker `i` of a stage only ever receives from channel `i`, which keeps the per-worker
/// single-consumer discipline and gives keyed routing its ordering guarantee.
#[derive(Default)]
pub struct WorkManager {
    stages: ShardedLock<Vec<Arc<dyn StageControl>>>,
}

impl WorkManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn stage(&self, work_id: WorkId) -> Option<Arc<dyn StageControl>> {
        let stages = self.stages.read().unwrap_or_else(PoisonError::into_inner);
        stages.get(work_id.raw()).cloned()
    }

    /// Returns the name a stage was registered with.
    pub fn stage_name(&self, work_id: WorkId) -> Option<String> {
        self.stage(work_id).map(|stage| stage.name().to_owned())
    }

    /// Looks a stage up by name.
    pub fn find_stage(&self, name: &str) -> Option<WorkId> {
        let stages = self.stages.read().unwrap_or_else(PoisonError::into_inner);
        stages.iter().position(|s| s.name() == name).map(WorkId)
    }

    /// Number of items waiting in the worker queues of a stage.
    pub fn queued(&self, work_id: WorkId) -> usize {
        self.stage(work_id).map_or(0, |stage| stage.queued())
    }

    /// Blocks until all queues of the stage are empty and no item is being processed.
    pub fn wait_for_completion(&self, work_id: WorkId) {
        let Some(stage) = self.stage(work_id) else {
            return;
        };
        while !stage.is_idle() {
            // Small sleep to avoid busy waiting
            sleep(Duration::from_millis(10));
        }
    }

    /// Stops every running stage.
    pub fn shutdown(&self) {
        let stages: Vec<_> = self
            .stages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for stage in stages {
            stage.stop();
        }
    }

    fn runtime<T: Send + 'static, R>(
        &self,
        work_id: WorkId,
        item: T,
        f: impl FnOnce(&StageRuntime<T>, T) -> Result<R, DeliveryError<T>>,
    ) -> Result<R, DeliveryError<T>> {
        let Some(stage) = self.stage(work_id) else {
            return Err(DeliveryError::UnknownStage(work_id, item));
        };
        match stage.as_any().downcast_ref::<StageRuntime<T>>() {
            Some(runtime) => f(runtime, item),
            None => Err(DeliveryError::TypeMismatch(item)),
        }
    }
}

impl Scheduler for WorkManager {
    fn register_stage<T: Send + 'static>(
        &self,
        config: &StageConfig,
        factory: WorkerFactory<T>,
    ) -> Result<WorkId, SchedulerError> {
        config
            .validate()
            .map_err(|e| SchedulerError::InvalidConfig(e.to_string()))?;

        let mut stages = self.stages.write().unwrap_or_else(PoisonError::into_inner);
        if stages.iter().any(|s| s.name() == config.name) {
            return Err(SchedulerError::DuplicateStage(config.name.clone()));
        }
        let work_id = WorkId(stages.len());
        stages.push(Arc::new(StageRuntime::new(config.clone(), factory)));
        log::debug!(
            "Registered stage {} as work id {} ({} workers)",
            config.name,
            work_id,
            config.workers
        );
        Ok(work_id)
    }

    fn start_stage(&self, work_id: WorkId) -> Result<(), SchedulerError> {
        let stage = self
            .stage(work_id)
            .ok_or(SchedulerError::UnknownStage(work_id))?;
        stage.start()
    }

    fn stop_stage(&self, work_id: WorkId) -> bool {
        self.stage(work_id).map_or(false, |stage| stage.stop())
    }

    fn deliver<T: Send + 'static>(
        &self,
        work_id: WorkId,
        item: T,
    ) -> Result<(), DeliveryError<T>> {
        self.runtime(work_id, item, |runtime, item| runtime.deliver_automatic(item))
    }

    fn deliver_keyed<T: Send + 'static>(
        &self,
        work_id: WorkId,
        item: T,
        key: u64,
        _broadcast: bool,
    ) -> Result<(), DeliveryError<T>> {
        self.runtime(work_id, item, |runtime, item| runtime.deliver_keyed(item, key))
    }

    fn worker_count(&self, work_id: WorkId) -> usize {
        self.stage(work_id).map_or(0, |stage| stage.worker_count())
    }
}

impl Drop for WorkManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/* --------------------------------------------------------------------------------- */

/// Item-type independent view of a stage.
trait StageControl: Send + Sync {
    fn name(&self) -> &str;
    fn worker_count(&self) -> usize;
    fn queued(&self) -> usize;
    fn is_idle(&self) -> bool;
    fn start(&self) -> Result<(), SchedulerError>;
    fn stop(&self) -> bool;
    fn as_any(&self) -> &dyn Any;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Registered,
    Running,
    Stopped,
}

struct StageRuntime<T> {
    config: StageConfig,
    /// One sender per worker index. Emptied on stop, which disconnects the workers.
    senders: ShardedLock<Vec<Sender<T>>>,
    /// Handed to the worker threads on start.
    receivers: Mutex<Vec<Receiver<T>>>,
    factory: Arc<WorkerFactory<T>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    state: Mutex<RunState>,
    actively_processing: Arc<AtomicU64>,
    cursor: AtomicUsize,
}

impl<T: Send + 'static> StageRuntime<T> {
    fn new(config: StageConfig, factory: WorkerFactory<T>) -> Self {
        let mut senders = Vec::with_capacity(config.workers);
        let mut receivers = Vec::with_capacity(config.workers);
        for _ in 0..config.workers {
            let (tx, rx) = bounded(config.queue_size);
            senders.push(tx);
            receivers.push(rx);
        }
        StageRuntime {
            config,
            senders: ShardedLock::new(senders),
            receivers: Mutex::new(receivers),
            factory: Arc::new(factory),
            handles: Mutex::new(Vec::new()),
            state: Mutex::new(RunState::Registered),
            actively_processing: Arc::new(AtomicU64::new(0)),
            cursor: AtomicUsize::new(0),
        }
    }

    fn send(sender: &Sender<T>, item: T) -> Result<(), DeliveryError<T>> {
        sender.try_send(item).map_err(|e| match e {
            TrySendError::Full(item) => DeliveryError::Full(item),
            TrySendError::Disconnected(item) => DeliveryError::Closed(item),
        })
    }

    /// Sends to the worker with the shortest queue, scanning from a rotating start index so
    /// that ties are spread evenly.
    fn deliver_automatic(&self, item: T) -> Result<(), DeliveryError<T>> {
        let senders = self.senders.read().unwrap_or_else(PoisonError::into_inner);
        if senders.is_empty() {
            return Err(self.empty_error(item));
        }
        let n = senders.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
        let mut best = start;
        let mut best_len = usize::MAX;
        for offset in 0..n {
            let index = (start + offset) % n;
            let len = senders[index].len();
            if len < best_len {
                best = index;
                best_len = len;
                if len == 0 {
                    break;
                }
            }
        }
        Self::send(&senders[best], item)
    }

    fn deliver_keyed(&self, item: T, key: u64) -> Result<(), DeliveryError<T>> {
        let senders = self.senders.read().unwrap_or_else(PoisonError::into_inner);
        if senders.is_empty() {
            return Err(self.empty_error(item));
        }
        Self::send(&senders[worker_index(key, senders.len())], item)
    }

    fn empty_error(&self, item: T) -> DeliveryError<T> {
        if self.config.workers == 0 {
            DeliveryError::NoWorkers(item)
        } else {
            DeliveryError::Closed(item)
        }
    }

    fn run_worker(
        index: usize,
        receiver: Receiver<T>,
        factory: Arc<WorkerFactory<T>>,
        actively_processing: Arc<AtomicU64>,
        ready: Sender<usize>,
    ) {
        WORKER_KEY.with(|key| key.set(Some(index)));
        let mut worker = factory(index);

        // Signal that this thread is ready
        let _ = ready.send(index);
        drop(ready);

        while let Ok(item) = receiver.recv() {
            actively_processing.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = worker.do_work(item, index) {
                log::debug!("Worker {}: {}", index, e);
            }
            actively_processing.fetch_sub(1, Ordering::Relaxed);
        }
        worker.terminate();
    }
}

impl<T: Send + 'static> StageControl for StageRuntime<T> {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn worker_count(&self) -> usize {
        self.config.workers
    }

    fn queued(&self) -> usize {
        let senders = self.senders.read().unwrap_or_else(PoisonError::into_inner);
        senders.iter().map(|s| s.len()).sum()
    }

    fn is_idle(&self) -> bool {
        self.queued() == 0 && self.actively_processing.load(Ordering::Relaxed) == 0
    }

    /// Spawns one thread per worker and returns once every worker has been built.
    fn start(&self) -> Result<(), SchedulerError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != RunState::Registered {
            return Err(SchedulerError::AlreadyStarted(self.config.name.clone()));
        }

        let receivers: Vec<_> = self
            .receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let (ready_tx, ready_rx) = unbounded();
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);

        for (index, receiver) in receivers.into_iter().enumerate() {
            let thread_name = format!("{}-{}", self.config.name, index);
            let core = self.config.cores.as_ref().map(|cores| cores[index]);
            let factory = Arc::clone(&self.factory);
            let actively_processing = Arc::clone(&self.actively_processing);
            let ready = ready_tx.clone();

            let spawned = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || {
                    maybe_pin(core, &thread_name);
                    Self::run_worker(index, receiver, factory, actively_processing, ready);
                    log::debug!("{} exiting", thread_name);
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Disconnect the workers that did start before reporting.
                    *state = RunState::Stopped;
                    self.senders
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .clear();
                    return Err(SchedulerError::Spawn(e));
                }
            }
        }
        drop(ready_tx);

        // Wait for all threads to be ready to proceed
        let started = ready_rx.iter().count();
        *state = RunState::Running;
        log::info!(
            "Stage {}: {} of {} workers running",
            self.config.name,
            started,
            self.config.workers
        );
        Ok(())
    }

    fn stop(&self) -> bool {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != RunState::Running {
                return false;
            }
            *state = RunState::Stopped;
        }

        // Drop senders to break out of processing loops once the queues are drained
        self.senders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for (i, handle) in handles.into_iter().enumerate() {
            if handle.join().is_err() {
                log::error!("Stage {}: worker {} panicked", self.config.name, i);
            }
        }
        log::info!("Stage {} stopped", self.config.name);
        self.config.workers > 0
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
