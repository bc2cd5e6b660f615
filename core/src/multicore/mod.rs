//! Multicore stage processing.
//!
//! A stage is declared by implementing [`Stage`] and wrapped in a [`WorkerPoolEntity`] (the
//! master). The master registers the stage with a [`Scheduler`], by default the thread-backed
//! [`WorkManager`], which runs one [`WorkerSlave`] per worker thread. Items are routed with a
//! [`RoutingKey`]: keyed items always land on the same worker, broadcast items on every worker.

mod pin;
mod pool;
mod routing;
mod scheduler;
mod slave;
mod stage_stats;
mod work_manager;

pub(crate) use pin::maybe_pin;
pub use pin::pin_thread_to_core;
pub use pool::{PoolError, Stage, StageSnapshot, WorkerPoolEntity};
pub use routing::{worker_index, RoutingKey};
pub use scheduler::{
    DeliveryError, Scheduler, SchedulerError, WorkError, WorkId, Worker, WorkerFactory,
};
pub use slave::{SlaveEvent, SlaveState, WorkerSlave};
pub use stage_stats::{StageStats, StatsSnapshot};
pub use work_manager::{current_worker_key, WorkManager};
