use std::fmt;

/// Selects the worker that processes a work item.
///
/// On the wire between stages the key is a plain `u64` where two values are reserved:
/// [`RoutingKey::AUTOMATIC_RAW`] and [`RoutingKey::BROADCAST_RAW`]. Every other value is a
/// concrete key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RoutingKey {
    /// Let the scheduler pick the least loaded worker.
    #[default]
    Automatic,
    /// Deliver a copy to every worker.
    Broadcast,
    /// Deliver to worker `key % worker_count`. Items sharing a key are processed by the same
    /// worker, in submission order.
    Key(u64),
}

impl RoutingKey {
    pub const AUTOMATIC_RAW: u64 = u64::MAX;
    pub const BROADCAST_RAW: u64 = u64::MAX - 1;

    /// Creates a concrete key, mapping the reserved values to their sentinels.
    pub fn from_raw(raw: u64) -> Self {
        match raw {
            Self::AUTOMATIC_RAW => RoutingKey::Automatic,
            Self::BROADCAST_RAW => RoutingKey::Broadcast,
            key => RoutingKey::Key(key),
        }
    }

    pub fn raw(&self) -> u64 {
        match self {
            RoutingKey::Automatic => Self::AUTOMATIC_RAW,
            RoutingKey::Broadcast => Self::BROADCAST_RAW,
            RoutingKey::Key(key) => *key,
        }
    }

    /// Worker index for a concrete key, `None` for the sentinels or an empty pool.
    pub fn worker_index(&self, worker_count: usize) -> Option<usize> {
        match self {
            RoutingKey::Key(key) if worker_count > 0 => Some(worker_index(*key, worker_count)),
            _ => None,
        }
    }
}

impl From<u64> for RoutingKey {
    fn from(raw: u64) -> Self {
        RoutingKey::from_raw(raw)
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RoutingKey::Automatic => write!(f, "automatic"),
            RoutingKey::Broadcast => write!(f, "broadcast"),
            RoutingKey::Key(key) => write!(f, "{}", key),
        }
    }
}

/// Consistent key-to-worker mapping. `worker_count` must be non-zero.
#[inline]
pub fn worker_index(key: u64, worker_count: usize) -> usize {
    (key % worker_count as u64) as usize
}
