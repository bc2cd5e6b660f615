use crate::config::CountersConfig;

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;

use crossbeam::sync::ShardedLock;
use thiserror::Error;

/// Section whose header is left out of text reports.
pub const DEFAULT_SECTION: &str = "default";

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// Blocks registered by the current thread, keyed by registry id.
    static LOCAL_BLOCKS: RefCell<Vec<(u64, Weak<CounterBlock>)>> = const { RefCell::new(Vec::new()) };
}

/// Metadata of one counter, supplied by the caller at configuration time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterSpec {
    pub index: usize,
    pub string_id: String,
    pub title: String,
    pub write_to_file: bool,
    pub write_to_db: bool,
    pub section: String,
}

impl CounterSpec {
    /// A counter in the default section, written to files but not to the database.
    pub fn new(index: usize, string_id: &str, title: &str) -> Self {
        CounterSpec {
            index,
            string_id: string_id.to_owned(),
            title: title.to_owned(),
            write_to_file: true,
            write_to_db: false,
            section: DEFAULT_SECTION.to_owned(),
        }
    }

    pub fn section(mut self, section: &str) -> Self {
        self.section = section.to_owned();
        self
    }

    pub fn write_to_db(mut self, write_to_db: bool) -> Self {
        self.write_to_db = write_to_db;
        self
    }

    pub fn write_to_file(mut self, write_to_file: bool) -> Self {
        self.write_to_file = write_to_file;
        self
    }
}

/// Values written next to every counter in database rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportIdentity {
    pub host: String,
    pub application: String,
    pub module: String,
}

impl ReportIdentity {
    pub fn new(host: &str, application: &str, module: &str) -> Self {
        ReportIdentity {
            host: host.to_owned(),
            application: application.to_owned(),
            module: module.to_owned(),
        }
    }
}

impl From<&CountersConfig> for ReportIdentity {
    fn from(config: &CountersConfig) -> Self {
        ReportIdentity {
            host: config.host_or_default(),
            application: config.application.clone(),
            module: config.module.clone(),
        }
    }
}

/// Fixed-size array of counters owned by one thread.
///
/// Only the owning thread writes. Other threads read (and reset) the slots when aggregating, hence
/// the relaxed atomics.
pub struct CounterBlock {
    owner: String,
    slots: Box<[AtomicU64]>,
}

impl CounterBlock {
    fn new(capacity: usize) -> Self {
        let current = thread::current();
        let owner = match current.name() {
            Some(name) => name.to_owned(),
            None => format!("{:?}", current.id()),
        };
        CounterBlock {
            owner,
            slots: (0..capacity).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    #[inline]
    fn add(&self, index: usize, delta: u64) {
        if let Some(slot) = self.slots.get(index) {
            slot.fetch_add(delta, Ordering::Relaxed);
        }
    }

    #[inline]
    fn get(&self, index: usize) -> u64 {
        self.slots
            .get(index)
            .map_or(0, |slot| slot.load(Ordering::Relaxed))
    }

    /// Name of the thread that registered the block.
    pub fn owner(&self) -> &str {
        &self.owner
    }
}

impl fmt::Debug for CounterBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CounterBlock")
            .field("owner", &self.owner)
            .field("capacity", &self.slots.len())
            .finish()
    }
}

/// Exclusive handle to a thread's counter block. Not `Clone`: one writer per block.
#[derive(Debug)]
pub struct BlockHandle {
    block: Arc<CounterBlock>,
}

impl BlockHandle {
    pub fn owner(&self) -> &str {
        self.block.owner()
    }
}

#[derive(Debug, Default)]
pub(super) struct Metadata {
    pub(super) entries: Vec<Option<CounterSpec>>,
    pub(super) sections: BTreeMap<String, BTreeSet<usize>>,
}

/// Process-wide table of counter metadata plus one private counter block per thread.
///
/// Counters are configured up front with caller-assigned indices. Threads then increment their
/// own block without taking any lock; readers aggregate across all blocks on demand. Blocks are
/// owned by the registry, so counts of exited threads remain part of the aggregate.
pub struct CounterRegistry {
    id: u64,
    capacity: usize,
    identity: ReportIdentity,
    meta: Mutex<Metadata>,
    blocks: ShardedLock<Vec<Arc<CounterBlock>>>,
}

impl CounterRegistry {
    pub fn new(capacity: usize, identity: ReportIdentity) -> Self {
        CounterRegistry {
            id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
            capacity,
            identity,
            meta: Mutex::new(Metadata {
                entries: vec![None; capacity],
                sections: BTreeMap::new(),
            }),
            blocks: ShardedLock::new(Vec::new()),
        }
    }

    pub fn from_config(config: &CountersConfig) -> Self {
        Self::new(config.capacity, ReportIdentity::from(config))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn identity(&self) -> &ReportIdentity {
        &self.identity
    }

    pub(super) fn metadata(&self) -> MutexGuard<'_, Metadata> {
        self.meta.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores the metadata of one counter. Each index can be configured once.
    pub fn configure(&self, spec: CounterSpec) -> Result<(), CounterError> {
        let mut meta = self.metadata();
        let capacity = self.capacity;
        let slot = meta
            .entries
            .get_mut(spec.index)
            .ok_or(CounterError::IndexOutOfRange {
                index: spec.index,
                capacity,
            })?;
        if let Some(existing) = slot.as_ref() {
            return Err(CounterError::AlreadyConfigured {
                index: spec.index,
                string_id: existing.string_id.clone(),
            });
        }
        log::debug!(
            "Counter {} configured: {} ({})",
            spec.index,
            spec.string_id,
            spec.section
        );
        let index = spec.index;
        let section = spec.section.clone();
        *slot = Some(spec);
        meta.sections.entry(section).or_default().insert(index);
        Ok(())
    }

    /// Metadata of a configured counter.
    pub fn spec(&self, index: usize) -> Option<CounterSpec> {
        self.metadata().entries.get(index).cloned().flatten()
    }

    /// Allocates a zeroed block for the calling thread and returns the exclusive handle to it.
    pub fn register_thread_block(&self) -> BlockHandle {
        let block = Arc::new(CounterBlock::new(self.capacity));
        self.blocks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&block));
        log::debug!("Counter block registered for thread {}", block.owner());
        BlockHandle { block }
    }

    /// Number of registered blocks.
    pub fn block_count(&self) -> usize {
        self.blocks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Adds `delta` to counter `index` of the handle's block. Out-of-range indices are ignored.
    #[inline]
    pub fn increment(&self, handle: &BlockHandle, index: usize, delta: u64) {
        handle.block.add(index, delta);
    }

    #[inline]
    pub fn get_local(&self, handle: &BlockHandle, index: usize) -> u64 {
        handle.block.get(index)
    }

    /// Adds `delta` to counter `index` of the calling thread's block, registering the block on
    /// first use.
    pub fn inc(&self, index: usize, delta: u64) {
        self.local_block().add(index, delta);
    }

    /// Value of counter `index` in the calling thread's block.
    pub fn local(&self, index: usize) -> u64 {
        self.local_block().get(index)
    }

    fn local_block(&self) -> Arc<CounterBlock> {
        let found = LOCAL_BLOCKS.with(|blocks| {
            blocks
                .borrow()
                .iter()
                .find(|(id, _)| *id == self.id)
                .and_then(|(_, block)| block.upgrade())
        });
        if let Some(block) = found {
            return block;
        }

        let handle = self.register_thread_block();
        LOCAL_BLOCKS.with(|blocks| {
            let mut blocks = blocks.borrow_mut();
            blocks.retain(|(_, block)| block.strong_count() > 0);
            blocks.push((self.id, Arc::downgrade(&handle.block)));
        });
        handle.block
    }

    /// Sum of counter `index` over all blocks. Concurrent increments may or may not be included.
    pub fn get_aggregate(&self, index: usize) -> u64 {
        self.blocks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|block| block.get(index))
            .sum()
    }

    /// Zeroes counter `index` in every block.
    pub fn reset_aggregate(&self, index: usize) {
        for block in self
            .blocks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            if let Some(slot) = block.slots.get(index) {
                slot.store(0, Ordering::Relaxed);
            }
        }
    }
}

impl From<&CountersConfig> for CounterRegistry {
    fn from(config: &CountersConfig) -> Self {
        CounterRegistry::from_config(config)
    }
}

impl fmt::Debug for CounterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CounterRegistry")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("identity", &self.identity)
            .field("blocks", &self.block_count())
            .finish()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CounterError {
    #[error("Counter index {index} out of range (capacity {capacity})")]
    IndexOutOfRange { index: usize, capacity: usize },

    #[error("Counter index {index} already configured as {string_id}")]
    AlreadyConfigured { index: usize, string_id: String },
}
