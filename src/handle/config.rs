//! Handle construction settings

use crate::error::{Error, Result};

/// Settings applied when a [`Handle`](crate::Handle) provisions its own
/// resources.
///
/// The defaults reproduce the plain `Handle::new(None, None)` behaviour: no
/// fixed queue depth, a BFC allocator that grows on demand, the default
/// reclaim watermark, and a freshly drawn seed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandleConfig {
    /// Queue depth for a context created by the handle; `None` is unbounded.
    /// Ignored when a context is supplied.
    pub queue_depth: Option<usize>,

    /// Bytes the BFC allocator reserves up front; 0 grows on demand.
    /// Ignored when an allocator is supplied.
    pub reserve_bytes: usize,

    /// Pending bytes that trigger a reclaim pass; 0 selects
    /// [`DEFAULT_RECLAIM_WATERMARK`](crate::runtime::allocator::DEFAULT_RECLAIM_WATERMARK).
    pub reclaim_watermark: usize,

    /// Explicit generator seed. `None` draws fresh seed material so two
    /// handles never share a sequence.
    pub seed: Option<u64>,
}

impl HandleConfig {
    /// Validate configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` for a fixed queue depth of zero.
    pub fn validate(&self) -> Result<()> {
        if self.queue_depth == Some(0) {
            return Err(Error::invalid_argument(
                "queue_depth",
                "a fixed queue depth must be at least 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = HandleConfig::default();
        config.validate().unwrap();
        assert_eq!(config.queue_depth, None);
        assert_eq!(config.reserve_bytes, 0);
        assert_eq!(config.seed, None);
    }

    #[test]
    fn test_zero_queue_depth_invalid() {
        let config = HandleConfig {
            queue_depth: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
