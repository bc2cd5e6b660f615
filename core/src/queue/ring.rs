use crossbeam::queue::ArrayQueue;

use std::fmt;

/// Fixed-capacity circular buffer feeding a [`DecouplingQueue`](super::DecouplingQueue).
///
/// The producer side may be called from any number of threads. The consumer side (`pop`,
/// `is_empty`) is only ever used by one thread at a time.
pub trait BoundedRingBuffer<T>: Send + Sync {
    /// Enqueues `item` (multi-producers safe). Hands the item back if the ring is full.
    fn push(&self, item: T) -> Result<(), T>;

    /// Dequeues the oldest item (single consumer).
    fn pop(&self) -> Option<T>;

    /// Returns `true` if the ring is empty
    fn is_empty(&self) -> bool;

    /// Returns the number of entries in the ring
    fn len(&self) -> usize;

    /// Returns the number of objects that can be stored in the ring
    fn capacity(&self) -> usize;

    /// Returns `true` if the ring is full
    fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }
}

/// A lock-free ring backed by [`crossbeam::queue::ArrayQueue`].
pub struct Ring<T> {
    name: String,
    raw: ArrayQueue<T>,
}

impl<T> Ring<T> {
    /// Creates a ring holding at most `capacity` items. `capacity` must be non-zero.
    pub fn new(name: &str, capacity: usize) -> Self {
        log::debug!("Ring {} size: {}", name, capacity);
        Ring {
            name: name.to_owned(),
            raw: ArrayQueue::new(capacity),
        }
    }

    /// Returns the name of the Ring
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of entries in the ring
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Returns `true` if the ring is empty
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Returns the number of objects that can be stored in the ring
    pub fn capacity(&self) -> usize {
        self.raw.capacity()
    }

    /// Returns the number of free entries in the ring
    pub fn free_count(&self) -> usize {
        self.raw.capacity() - self.raw.len()
    }
}

impl<T: Send> BoundedRingBuffer<T> for Ring<T> {
    fn push(&self, item: T) -> Result<(), T> {
        self.raw.push(item)
    }

    fn pop(&self) -> Option<T> {
        self.raw.pop()
    }

    fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    fn len(&self) -> usize {
        self.raw.len()
    }

    fn capacity(&self) -> usize {
        self.raw.capacity()
    }

    fn is_full(&self) -> bool {
        self.raw.is_full()
    }
}

impl<T> fmt::Debug for Ring<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(&self.name)
            .field("capacity", &self.raw.capacity())
            .field("count", &self.raw.len())
            .field("free_count", &self.free_count())
            .field("is_full", &self.raw.is_full())
            .field("is_empty", &self.raw.is_empty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_ring_hands_item_back() {
        let ring = Ring::new("test", 2);
        assert!(ring.push(1).is_ok());
        assert!(ring.push(2).is_ok());
        assert!(BoundedRingBuffer::is_full(&ring));
        assert_eq!(ring.push(3), Err(3));
        assert_eq!(ring.free_count(), 0);

        assert_eq!(ring.pop(), Some(1));
        assert_eq!(ring.pop(), Some(2));
        assert_eq!(ring.pop(), None);
        assert!(BoundedRingBuffer::is_empty(&ring));
    }
}
