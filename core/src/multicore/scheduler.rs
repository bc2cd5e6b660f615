use super::work_manager::current_worker_key;
use crate::config::StageConfig;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of a stage registered with a [`Scheduler`].
#[derive(Debug, Copy, Clone, Hash, Ord, Eq, PartialEq, PartialOrd, Deserialize, Serialize)]
pub struct WorkId(pub usize);

impl WorkId {
    pub fn raw(&self) -> usize {
        self.0
    }
}

impl fmt::Display for WorkId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-thread consumer of a stage's items. Each instance is owned by exactly one worker thread,
/// so `do_work` is never called concurrently on the same worker.
pub trait Worker<T>: Send {
    /// Processes one delivered item on the worker thread identified by `thread_key`.
    fn do_work(&mut self, item: T, thread_key: usize) -> Result<(), WorkError>;

    /// Called once on the worker thread after its queue has been drained and closed.
    fn terminate(&mut self);
}

/// Builds the worker for a given worker index. Invoked on the worker thread itself.
pub type WorkerFactory<T> = Box<dyn Fn(usize) -> Box<dyn Worker<T>> + Send + Sync>;

/// Owns worker threads and delivers items to them.
///
/// A stage is registered with a factory, started, fed through `deliver`/`deliver_keyed`, and
/// eventually stopped. Delivery never blocks: a full worker queue is reported as
/// [`DeliveryError::Full`].
pub trait Scheduler: Send + Sync + 'static {
    /// Registers a stage. Stage names are unique per scheduler.
    fn register_stage<T: Send + 'static>(
        &self,
        config: &StageConfig,
        factory: WorkerFactory<T>,
    ) -> Result<WorkId, SchedulerError>;

    /// Spawns the worker threads of a registered stage.
    fn start_stage(&self, work_id: WorkId) -> Result<(), SchedulerError>;

    /// Closes the stage's queues and waits for its workers to drain and exit. Returns `false` if
    /// the stage is not running or has no workers.
    fn stop_stage(&self, work_id: WorkId) -> bool;

    /// Delivers `item` to a worker chosen by the scheduler.
    fn deliver<T: Send + 'static>(&self, work_id: WorkId, item: T)
        -> Result<(), DeliveryError<T>>;

    /// Delivers `item` to worker `key % worker_count`. `broadcast` marks one leg of a broadcast
    /// fan-out, in which case `key` is the worker index itself.
    fn deliver_keyed<T: Send + 'static>(
        &self,
        work_id: WorkId,
        item: T,
        key: u64,
        broadcast: bool,
    ) -> Result<(), DeliveryError<T>>;

    /// Number of workers of the stage, `0` for unknown stages.
    fn worker_count(&self, work_id: WorkId) -> usize;

    /// Worker index of the calling thread, `None` when called outside this scheduler's workers.
    fn thread_local_key(&self) -> Option<usize> {
        current_worker_key()
    }
}

/* --------------------------------------------------------------------------------- */

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Stage {0} is already registered")]
    DuplicateStage(String),

    #[error("Unknown stage: {0}")]
    UnknownStage(WorkId),

    #[error("Stage {0} was already started")]
    AlreadyStarted(String),

    #[error("Invalid stage configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to spawn worker thread")]
    Spawn(#[from] std::io::Error),
}

/// Error returned by the delivery functions. Carries the undelivered item.
#[derive(Error)]
pub enum DeliveryError<T> {
    #[error("Worker queue is full")]
    Full(T),

    #[error("Stage is not running")]
    Closed(T),

    #[error("Stage has no workers")]
    NoWorkers(T),

    #[error("Unknown stage: {0}")]
    UnknownStage(WorkId, T),

    #[error("Item type does not match the stage")]
    TypeMismatch(T),
}

impl<T> DeliveryError<T> {
    pub fn into_inner(self) -> T {
        match self {
            DeliveryError::Full(item)
            | DeliveryError::Closed(item)
            | DeliveryError::NoWorkers(item)
            | DeliveryError::UnknownStage(_, item)
            | DeliveryError::TypeMismatch(item) => item,
        }
    }
}

impl<T> fmt::Debug for DeliveryError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryError::Full(_) => f.write_str("Full(..)"),
            DeliveryError::Closed(_) => f.write_str("Closed(..)"),
            DeliveryError::NoWorkers(_) => f.write_str("NoWorkers(..)"),
            DeliveryError::UnknownStage(id, _) => write!(f, "UnknownStage({}, ..)", id),
            DeliveryError::TypeMismatch(_) => f.write_str("TypeMismatch(..)"),
        }
    }
}

/// Outcome of a single [`Worker::do_work`] call that did not process the item.
#[derive(Debug, Error)]
pub enum WorkError {
    #[error("Stage has not started, item dropped")]
    NotStarted,

    #[error("Worker has terminated, item dropped")]
    Terminated,

    #[error("Processing failed: {0:#}")]
    Processing(anyhow::Error),
}
