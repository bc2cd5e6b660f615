//! Per-thread operational counters.
//!
//! A [`CounterRegistry`] holds the metadata of every counter (index, identifiers, section, sinks)
//! and one [`CounterBlock`] per participating thread. Hot paths only touch their own block, either
//! through an explicit [`BlockHandle`] or through the thread-local shortcuts
//! [`CounterRegistry::inc`] and [`CounterRegistry::local`]. Aggregates, text tables, CSV/JSON files
//! and database upserts are produced on demand.

mod registry;
mod report;

pub use registry::{
    BlockHandle, CounterBlock, CounterError, CounterRegistry, CounterSpec, ReportIdentity,
    DEFAULT_SECTION,
};
pub use report::CounterValue;
