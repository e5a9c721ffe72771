//! Bounded pool of execution streams

use parking_lot::RwLock;
use std::sync::Arc;

/// Maximum number of streams a [`Handle`](crate::Handle) keeps
pub const MAX_STREAMS: usize = 32;

/// Bounded pool of execution streams.
///
/// The pool starts empty; whoever dispatches work decides when streams are
/// created. It never holds more than [`MAX_STREAMS`].
pub struct StreamPool<S> {
    streams: RwLock<Vec<Arc<S>>>,
}

impl<S> std::fmt::Debug for StreamPool<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamPool")
            .field("len", &self.len())
            .field("capacity", &MAX_STREAMS)
            .finish()
    }
}

impl<S> Default for StreamPool<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> StreamPool<S> {
    /// Create an empty pool
    pub fn new() -> Self {
        Self {
            streams: RwLock::new(Vec::with_capacity(MAX_STREAMS)),
        }
    }

    /// Maximum number of streams
    #[inline]
    pub fn capacity(&self) -> usize {
        MAX_STREAMS
    }

    /// Number of streams in the pool
    pub fn len(&self) -> usize {
        self.streams.read().len()
    }

    /// Whether the pool holds no streams
    pub fn is_empty(&self) -> bool {
        self.streams.read().is_empty()
    }

    /// Whether the pool is at capacity
    pub fn is_full(&self) -> bool {
        self.len() >= MAX_STREAMS
    }

    /// Stream at `index`
    pub fn get(&self, index: usize) -> Option<Arc<S>> {
        self.streams.read().get(index).cloned()
    }

    /// Add `stream`, or hand it back if the pool is full
    pub fn try_push(&self, stream: S) -> Result<Arc<S>, S> {
        let mut streams = self.streams.write();
        if streams.len() >= MAX_STREAMS {
            return Err(stream);
        }
        let stream = Arc::new(stream);
        streams.push(Arc::clone(&stream));
        Ok(stream)
    }

    /// All streams currently in the pool
    pub fn to_vec(&self) -> Vec<Arc<S>> {
        self.streams.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_is_enforced() {
        let pool = StreamPool::new();
        for i in 0..MAX_STREAMS {
            assert_eq!(*pool.try_push(i).unwrap(), i);
        }
        assert!(pool.is_full());
        assert_eq!(pool.try_push(99), Err(99));
        assert_eq!(pool.len(), MAX_STREAMS);
        assert_eq!(pool.get(3).map(|s| *s), Some(3));
        assert!(pool.get(MAX_STREAMS).is_none());
    }

    #[test]
    fn test_starts_empty() {
        let pool: StreamPool<()> = StreamPool::default();
        assert!(pool.is_empty());
        assert_eq!(pool.capacity(), 32);
    }
}
