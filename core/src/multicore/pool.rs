use super::routing::RoutingKey;
use super::scheduler::{DeliveryError, Scheduler, SchedulerError, WorkId, Worker, WorkerFactory};
use super::slave::WorkerSlave;
use super::stage_stats::StageStats;
use super::work_manager::WorkManager;
use crate::config::StageConfig;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Local};
use thiserror::Error;

/// A logical processing stage.
///
/// One value of the implementing type acts as the prototype held by the master
/// ([`WorkerPoolEntity`]); every worker thread gets its own clone, wrapped in a
/// [`WorkerSlave`]. `do_processing` is the only method a stage has to provide.
pub trait Stage: Clone + Send + Sync + 'static {
    type Item: Clone + Send + 'static;

    /// Processes one item on a worker thread. Errors are counted and logged by the slave and do
    /// not stop subsequent items.
    fn do_processing(&mut self, item: Self::Item) -> anyhow::Result<()>;

    /// Computes the routing key of an item on the producer's thread. Must be cheap and must not
    /// block. Defaults to [`RoutingKey::Automatic`].
    fn routing_key(&self, _item: &Self::Item) -> RoutingKey {
        RoutingKey::Automatic
    }

    /// Runs once on the master when the stage starts.
    fn on_master_init(&self, _snapshot: &StageSnapshot) {}

    /// Runs once on each slave, on its first delivery after the stage started.
    fn on_slave_init(&mut self, _snapshot: &StageSnapshot) {}

    /// Runs once on each initialized slave when the pool is torn down.
    fn on_slave_terminate(&mut self) {}
}

/// Immutable state published by the master once the stage has started.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSnapshot {
    pub name: String,
    pub work_id: WorkId,
    pub worker_count: usize,
    pub started_at: DateTime<Local>,
}

impl StageSnapshot {
    pub fn new(name: &str, work_id: WorkId, worker_count: usize) -> Self {
        StageSnapshot {
            name: name.to_owned(),
            work_id,
            worker_count,
            started_at: Local::now(),
        }
    }
}

/// Master side of a worker-pool stage.
///
/// The master owns the stage configuration and prototype, registers the stage with a
/// [`Scheduler`], and routes every processed item to one worker (keyed or automatic) or to all
/// of them (broadcast). It can be shared between producer threads; `process` only needs `&self`.
pub struct WorkerPoolEntity<S: Stage, M: Scheduler = WorkManager> {
    config: StageConfig,
    prototype: S,
    scheduler: Arc<M>,
    /// Set once the scheduler accepted the stage.
    registered: OnceLock<StageSnapshot>,
    published: Arc<OnceLock<StageSnapshot>>,
    starting: AtomicBool,
    stopped: AtomicBool,
    stats: Arc<StageStats>,
}

impl<S: Stage, M: Scheduler> WorkerPoolEntity<S, M> {
    pub fn new(config: StageConfig, prototype: S, scheduler: Arc<M>) -> Self {
        WorkerPoolEntity {
            config,
            prototype,
            scheduler,
            registered: OnceLock::new(),
            published: Arc::new(OnceLock::new()),
            starting: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            stats: Arc::new(StageStats::new()),
        }
    }

    /// Registers the stage, runs [`Stage::on_master_init`], starts the workers and publishes the
    /// stage snapshot. Items processed before this returns are discarded.
    ///
    /// If the scheduler fails to start the workers, the error is returned and `start` may be
    /// called again. The stage stays registered and the master hook is not repeated.
    pub fn start(&self) -> Result<(), PoolError> {
        if self.starting.swap(true, Ordering::AcqRel) {
            return Err(PoolError::AlreadyStarted(self.config.name.clone()));
        }

        let snapshot = match self.registered.get() {
            Some(snapshot) => snapshot.clone(),
            None => match self.register() {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    self.starting.store(false, Ordering::Release);
                    return Err(e);
                }
            },
        };
        if let Err(e) = self.scheduler.start_stage(snapshot.work_id) {
            self.starting.store(false, Ordering::Release);
            return Err(e.into());
        }

        log::info!(
            "Stage {} started: work id {}, {} workers",
            snapshot.name,
            snapshot.work_id,
            snapshot.worker_count
        );
        let _ = self.published.set(snapshot);
        Ok(())
    }

    fn register(&self) -> Result<StageSnapshot, PoolError> {
        let work_id = self
            .scheduler
            .register_stage(&self.config, self.slave_factory())?;
        let worker_count = self.scheduler.worker_count(work_id);
        let snapshot = StageSnapshot::new(&self.config.name, work_id, worker_count);

        self.prototype.on_master_init(&snapshot);
        let _ = self.registered.set(snapshot.clone());
        Ok(snapshot)
    }

    fn slave_factory(&self) -> WorkerFactory<S::Item> {
        let prototype = self.prototype.clone();
        let published = Arc::clone(&self.published);
        let stats = Arc::clone(&self.stats);
        Box::new(move |thread_key| -> Box<dyn Worker<S::Item>> {
            Box::new(WorkerSlave::new(
                prototype.clone(),
                Arc::clone(&published),
                Arc::clone(&stats),
                thread_key,
            ))
        })
    }

    /// Routes `item` to the workers and returns the number of deliveries made.
    ///
    /// Before `start` (and after `stop`) items are discarded silently. Deliveries rejected by
    /// the scheduler, e.g. because a worker queue is full, are counted as dropped.
    pub fn process(&self, item: S::Item) -> usize {
        let Some(snapshot) = self.published.get() else {
            self.stats.discarded.fetch_add(1, Ordering::Relaxed);
            return 0;
        };
        if self.stopped.load(Ordering::Acquire) {
            self.stats.discarded.fetch_add(1, Ordering::Relaxed);
            return 0;
        }

        let work_id = snapshot.work_id;
        let worker_count = snapshot.worker_count;
        match self.prototype.routing_key(&item) {
            RoutingKey::Broadcast => self.broadcast(work_id, worker_count, item),
            RoutingKey::Key(key) if worker_count > 0 => {
                self.record(self.scheduler.deliver_keyed(work_id, item, key, false))
            }
            _ => self.record(self.scheduler.deliver(work_id, item)),
        }
    }

    /// One delivery per worker index; the last one takes `item` itself.
    fn broadcast(&self, work_id: WorkId, worker_count: usize, item: S::Item) -> usize {
        if worker_count == 0 {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return 0;
        }
        let mut delivered = 0;
        for index in 0..worker_count - 1 {
            delivered += self.record(self.scheduler.deliver_keyed(
                work_id,
                item.clone(),
                index as u64,
                true,
            ));
        }
        delivered
            + self.record(self.scheduler.deliver_keyed(
                work_id,
                item,
                (worker_count - 1) as u64,
                true,
            ))
    }

    fn record(&self, result: Result<(), DeliveryError<S::Item>>) -> usize {
        match result {
            Ok(()) => {
                self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
                1
            }
            Err(e) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("Stage {}: delivery failed: {}", self.config.name, e);
                0
            }
        }
    }

    /// Tears down the workers. Items already queued are still processed. Returns `false` if the
    /// stage never started, was already stopped, or has no workers.
    pub fn stop(&self) -> bool {
        let Some(snapshot) = self.published.get() else {
            return false;
        };
        if self.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }
        if snapshot.worker_count == 0 {
            return false;
        }
        let stopped = self.scheduler.stop_stage(snapshot.work_id);
        log::info!("Stage {} stopped. {}", snapshot.name, self.stats.snapshot());
        stopped
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    pub fn is_started(&self) -> bool {
        self.published.get().is_some()
    }

    /// The published snapshot, `None` before `start`.
    pub fn snapshot(&self) -> Option<&StageSnapshot> {
        self.published.get()
    }

    pub fn work_id(&self) -> Option<WorkId> {
        self.published.get().map(|s| s.work_id)
    }

    pub fn worker_count(&self) -> usize {
        self.published.get().map_or(0, |s| s.worker_count)
    }

    pub fn stats(&self) -> &StageStats {
        &self.stats
    }

    pub fn scheduler(&self) -> &Arc<M> {
        &self.scheduler
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Stage {0} was already started")]
    AlreadyStarted(String),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multicore::{WorkError, WorkId};

    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Records deliveries instead of running threads.
    #[derive(Default)]
    struct RecordingScheduler {
        workers: usize,
        registered: AtomicUsize,
        started: AtomicBool,
        failed_starts: AtomicUsize,
        deliveries: Mutex<Vec<(Option<usize>, bool)>>,
    }

    impl RecordingScheduler {
        fn with_workers(workers: usize) -> Arc<Self> {
            Arc::new(RecordingScheduler {
                workers,
                ..Default::default()
            })
        }

        fn deliveries(&self) -> Vec<(Option<usize>, bool)> {
            self.deliveries.lock().unwrap().clone()
        }
    }

    impl Scheduler for RecordingScheduler {
        fn register_stage<T: Send + 'static>(
            &self,
            _config: &StageConfig,
            _factory: WorkerFactory<T>,
        ) -> Result<WorkId, SchedulerError> {
            self.registered.fetch_add(1, Ordering::Relaxed);
            Ok(WorkId(0))
        }

        fn start_stage(&self, _work_id: WorkId) -> Result<(), SchedulerError> {
            let remaining = self.failed_starts.load(Ordering::Relaxed);
            if remaining > 0 {
                self.failed_starts.store(remaining - 1, Ordering::Relaxed);
                return Err(SchedulerError::Spawn(std::io::Error::other("no threads")));
            }
            self.started.store(true, Ordering::Relaxed);
            Ok(())
        }

        fn stop_stage(&self, _work_id: WorkId) -> bool {
            true
        }

        fn deliver<T: Send + 'static>(
            &self,
            _work_id: WorkId,
            _item: T,
        ) -> Result<(), DeliveryError<T>> {
            self.deliveries.lock().unwrap().push((None, false));
            Ok(())
        }

        fn deliver_keyed<T: Send + 'static>(
            &self,
            _work_id: WorkId,
            _item: T,
            key: u64,
            broadcast: bool,
        ) -> Result<(), DeliveryError<T>> {
            let index = super::super::routing::worker_index(key, self.workers);
            self.deliveries.lock().unwrap().push((Some(index), broadcast));
            Ok(())
        }

        fn worker_count(&self, _work_id: WorkId) -> usize {
            self.workers
        }
    }

    #[derive(Clone, Default)]
    struct Keyed {
        master_inits: Arc<AtomicUsize>,
        processed: Arc<AtomicUsize>,
    }

    impl Stage for Keyed {
        type Item = u64;

        fn do_processing(&mut self, _item: u64) -> anyhow::Result<()> {
            self.processed.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn routing_key(&self, item: &u64) -> RoutingKey {
            RoutingKey::from_raw(*item)
        }

        fn on_master_init(&self, snapshot: &StageSnapshot) {
            assert_eq!(snapshot.name, "keyed");
            self.master_inits.fetch_add(1, Ordering::Relaxed);
        }
    }

    type TestPool = WorkerPoolEntity<Keyed, RecordingScheduler>;

    fn keyed_pool(workers: usize) -> (TestPool, Arc<RecordingScheduler>) {
        let scheduler = RecordingScheduler::with_workers(workers);
        let pool = WorkerPoolEntity::new(
            StageConfig::new("keyed", workers),
            Keyed::default(),
            Arc::clone(&scheduler),
        );
        (pool, scheduler)
    }

    #[test]
    fn process_before_start_is_silent() {
        let (pool, scheduler) = keyed_pool(4);
        assert_eq!(pool.process(7), 0);
        assert_eq!(pool.process(RoutingKey::BROADCAST_RAW), 0);
        assert!(scheduler.deliveries().is_empty());
        assert_eq!(pool.stats().get_discarded(), 2);
        assert_eq!(pool.stats().get_dispatched(), 0);
        assert!(!pool.stop());
    }

    #[test]
    fn start_runs_master_init_once() {
        let (pool, scheduler) = keyed_pool(4);
        pool.start().unwrap();
        assert!(matches!(pool.start(), Err(PoolError::AlreadyStarted(_))));

        assert_eq!(pool.prototype.master_inits.load(Ordering::Relaxed), 1);
        assert_eq!(scheduler.registered.load(Ordering::Relaxed), 1);
        assert!(scheduler.started.load(Ordering::Relaxed));
        assert!(pool.is_started());
        assert_eq!(pool.worker_count(), 4);
        assert_eq!(pool.work_id(), Some(WorkId(0)));
    }

    #[test]
    fn start_can_be_retried_after_scheduler_failure() {
        let (pool, scheduler) = keyed_pool(2);
        scheduler.failed_starts.store(1, Ordering::Relaxed);

        assert!(matches!(pool.start(), Err(PoolError::Scheduler(_))));
        assert!(!pool.is_started());
        assert_eq!(pool.process(7), 0);

        pool.start().unwrap();
        assert!(pool.is_started());
        assert_eq!(scheduler.registered.load(Ordering::Relaxed), 1);
        assert_eq!(pool.prototype.master_inits.load(Ordering::Relaxed), 1);
        assert_eq!(pool.process(7), 1);
        assert!(matches!(pool.start(), Err(PoolError::AlreadyStarted(_))));
    }

    #[test]
    fn keyed_routing_is_deterministic() {
        let (pool, scheduler) = keyed_pool(4);
        pool.start().unwrap();
        for key in [7, 11, 7, 3] {
            assert_eq!(pool.process(key), 1);
        }
        let deliveries = scheduler.deliveries();
        assert_eq!(deliveries.len(), 4);
        assert_eq!(deliveries[0], deliveries[2]);
        assert!(deliveries.iter().all(|(index, broadcast)| index.is_some() && !broadcast));
    }

    #[test]
    fn broadcast_reaches_every_worker() {
        let (pool, scheduler) = keyed_pool(4);
        pool.start().unwrap();
        assert_eq!(pool.process(RoutingKey::BROADCAST_RAW), 4);
        assert_eq!(
            scheduler.deliveries(),
            vec![(Some(0), true), (Some(1), true), (Some(2), true), (Some(3), true)]
        );
        assert_eq!(pool.stats().get_dispatched(), 4);
    }

    #[test]
    fn automatic_and_empty_pool_routing() {
        let (pool, scheduler) = keyed_pool(4);
        pool.start().unwrap();
        assert_eq!(pool.process(RoutingKey::AUTOMATIC_RAW), 1);
        assert_eq!(scheduler.deliveries(), vec![(None, false)]);

        // A concrete key with no workers falls back to automatic routing.
        let (empty, scheduler) = keyed_pool(0);
        empty.start().unwrap();
        assert_eq!(empty.process(5), 1);
        assert_eq!(scheduler.deliveries(), vec![(None, false)]);
        assert_eq!(empty.process(RoutingKey::BROADCAST_RAW), 0);
        assert_eq!(empty.stats().get_dropped(), 1);
        assert!(!empty.stop());
    }

    #[test]
    fn stop_discards_later_items() {
        let (pool, scheduler) = keyed_pool(2);
        pool.start().unwrap();
        assert!(pool.stop());
        assert!(!pool.stop());
        assert_eq!(pool.process(1), 0);
        assert!(scheduler.deliveries().is_empty());
        assert_eq!(pool.stats().get_discarded(), 1);
    }

    #[test]
    fn runs_on_work_manager() {
        let manager = Arc::new(WorkManager::new());
        let stage = Keyed::default();
        let pool = WorkerPoolEntity::new(StageConfig::new("keyed", 3), stage.clone(), manager);

        assert_eq!(pool.process(1), 0);
        pool.start().unwrap();
        for key in 0..30 {
            assert_eq!(pool.process(key), 1);
        }
        assert_eq!(pool.process(RoutingKey::BROADCAST_RAW), 3);
        assert!(pool.stop());

        assert_eq!(stage.processed.load(Ordering::Relaxed), 33);
        let stats = pool.stats().snapshot();
        assert_eq!(stats.processed, 33);
        assert_eq!(stats.dispatched, 33);
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.failed, 0);
    }

    /// Blocks inside `do_processing` until released.
    #[derive(Clone)]
    struct Gate {
        entered: crossbeam::channel::Sender<()>,
        release: crossbeam::channel::Receiver<()>,
    }

    impl Stage for Gate {
        type Item = u64;

        fn do_processing(&mut self, _item: u64) -> anyhow::Result<()> {
            self.entered.send(())?;
            self.release.recv()?;
            Ok(())
        }
    }

    #[test]
    fn stats_track_items_in_flight() {
        let (entered_tx, entered_rx) = crossbeam::channel::unbounded();
        let (release_tx, release_rx) = crossbeam::channel::unbounded();
        let gate = Gate {
            entered: entered_tx,
            release: release_rx,
        };
        let pool = WorkerPoolEntity::new(
            StageConfig::new("gate", 1),
            gate,
            Arc::new(WorkManager::new()),
        );
        pool.start().unwrap();
        assert_eq!(pool.stats().get_actively_processing(), 0);

        assert_eq!(pool.process(1), 1);
        entered_rx.recv().unwrap();
        assert_eq!(pool.stats().get_actively_processing(), 1);

        release_tx.send(()).unwrap();
        assert!(pool.stop());
        assert_eq!(pool.stats().get_actively_processing(), 0);
        assert_eq!(pool.stats().get_processed(), 1);
    }

    #[test]
    fn rejected_items_never_reach_slaves() {
        let published = Arc::new(OnceLock::new());
        let stats = Arc::new(StageStats::new());
        let stage = Keyed::default();
        let mut slave = WorkerSlave::new(stage.clone(), published, Arc::clone(&stats), 0);
        assert!(matches!(slave.do_work(1, 0), Err(WorkError::NotStarted)));
        assert_eq!(stage.processed.load(Ordering::Relaxed), 0);
        assert_eq!(stats.get_processed(), 0);
    }
}
