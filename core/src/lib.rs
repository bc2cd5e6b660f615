#![allow(clippy::needless_doctest_main)]

//! Concurrency backbone for a passive telecom probe.
//!
//! The crate provides the three pieces a probe pipeline is built from:
//!
//! - [`queue::DecouplingQueue`]: a bounded multi-producer queue drained in bursts by a dedicated
//!   dispatcher thread, which hands every item to a user callback.
//! - [`multicore::WorkerPoolEntity`]: a master/slave worker pool. The master routes items by key,
//!   automatically, or by broadcast to per-thread slave instances run by a
//!   [`multicore::Scheduler`].
//! - [`stats::CounterRegistry`]: operational counters kept in one private block per thread and
//!   aggregated on demand.
//!
//! A typical pipeline pushes decoded records into a queue, whose dispatch callback feeds a
//! worker pool:
//!
//! ```rust
//! use probe_core::config::StageConfig;
//! use probe_core::multicore::{RoutingKey, Stage, WorkManager, WorkerPoolEntity};
//! use probe_core::queue::DecouplingQueue;
//! use std::sync::Arc;
//!
//! #[derive(Clone)]
//! struct Session;
//!
//! impl Stage for Session {
//!     type Item = (u64, String);
//!
//!     fn do_processing(&mut self, item: Self::Item) -> anyhow::Result<()> {
//!         println!("{:?}", item);
//!         Ok(())
//!     }
//!
//!     fn routing_key(&self, item: &Self::Item) -> RoutingKey {
//!         RoutingKey::Key(item.0)
//!     }
//! }
//!
//! let scheduler = Arc::new(WorkManager::new());
//! let pool = Arc::new(WorkerPoolEntity::new(StageConfig::new("session", 2), Session, scheduler));
//! pool.start().unwrap();
//!
//! let master = Arc::clone(&pool);
//! let queue = DecouplingQueue::builder("pdus")
//!     .dispatch(move |item| {
//!         master.process(item);
//!     })
//!     .spawn()
//!     .unwrap();
//! queue.push((7, "attach".to_owned())).unwrap();
//! queue.flush().unwrap();
//! pool.stop();
//! ```

pub mod config;
pub mod fsm;
pub mod multicore;
pub mod queue;
pub mod stats;

pub use self::multicore::{RoutingKey, Stage, WorkManager, WorkerPoolEntity};
pub use self::queue::DecouplingQueue;
pub use self::stats::CounterRegistry;
