//! Explicit buffer arena for inference scratch space
//!
//! An [`Arena`] hands out `f32` buffers bucketed by power-of-two size class
//! and takes them back for reuse. It is owned by the caller and passed by
//! reference to whatever needs scratch memory; there is no global pool.
//!
//! Interior mutability is a `RefCell`, so an `Arena` is `!Sync`: sharing one
//! between threads does not compile. Use one arena per thread.
//!
//! ```ignore
//! let arena = Arena::new(ArenaConfig::default().with_byte_limit(Some(1 << 20)));
//! let mut scratch = arena.alloc(256)?;
//! scratch.as_mut_slice()[0] = 1.0;
//! arena.release(scratch);
//! ```

use std::cell::RefCell;
use std::collections::BTreeMap;

use crate::error::{HyperionError, HyperionResult};

const F32_BYTES: usize = std::mem::size_of::<f32>();

/// Power-of-two bucket for pooled buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SizeClass(usize);

impl SizeClass {
    /// Smallest class holding `len` elements
    #[must_use]
    pub fn for_len(len: usize) -> Self {
        if len == 0 {
            return Self(0);
        }
        Self(len.next_power_of_two())
    }

    /// Elements allocated for this class
    #[must_use]
    pub const fn capacity(self) -> usize {
        self.0
    }
}

/// A buffer checked out of an [`Arena`]
#[derive(Debug)]
pub struct ArenaBuffer {
    data: Vec<f32>,
    class: SizeClass,
    len: usize,
}

impl ArenaBuffer {
    /// Logical contents
    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.data[..self.len]
    }

    /// Logical contents, mutable
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data[..self.len]
    }

    /// Logical length
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Check if empty
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Allocated capacity in elements
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Size class
    #[must_use]
    pub const fn size_class(&self) -> SizeClass {
        self.class
    }
}

/// Arena settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaConfig {
    /// Idle buffers kept per size class
    pub max_per_class: usize,
    /// Cap on bytes checked out at once, `None` for unlimited
    pub byte_limit: Option<usize>,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            max_per_class: 16,
            byte_limit: None,
        }
    }
}

impl ArenaConfig {
    /// Set idle buffers kept per class
    #[must_use]
    pub const fn with_max_per_class(mut self, max_per_class: usize) -> Self {
        self.max_per_class = max_per_class;
        self
    }

    /// Set the outstanding byte cap
    #[must_use]
    pub const fn with_byte_limit(mut self, byte_limit: Option<usize>) -> Self {
        self.byte_limit = byte_limit;
        self
    }
}

/// Arena counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    /// Allocation requests
    pub allocations: usize,
    /// Requests served from an idle buffer
    pub hits: usize,
    /// Requests that allocated fresh memory
    pub misses: usize,
    /// Requests refused by the byte cap
    pub refused: usize,
    /// Buffers handed back
    pub releases: usize,
    /// Released buffers dropped because their class was full
    pub dropped: usize,
    /// Bytes currently checked out
    pub live_bytes: usize,
    /// Highest `live_bytes` seen
    pub peak_bytes: usize,
}

impl ArenaStats {
    /// Hit rate in percent
    #[must_use]
    pub fn hit_rate(&self) -> f32 {
        if self.allocations == 0 {
            0.0
        } else {
            self.hits as f32 / self.allocations as f32 * 100.0
        }
    }
}

/// Size-classed `f32` buffer pool
#[derive(Debug, Default)]
pub struct Arena {
    config: ArenaConfig,
    idle: RefCell<BTreeMap<SizeClass, Vec<Vec<f32>>>>,
    stats: RefCell<ArenaStats>,
}

impl Arena {
    /// Create an arena
    #[must_use]
    pub fn new(config: ArenaConfig) -> Self {
        Self {
            config,
            idle: RefCell::new(BTreeMap::new()),
            stats: RefCell::new(ArenaStats::default()),
        }
    }

    /// Configuration
    #[must_use]
    pub const fn config(&self) -> &ArenaConfig {
        &self.config
    }

    /// Check out a zeroed buffer of `len` elements
    ///
    /// # Errors
    ///
    /// Allocation error when the buffer would push checked-out memory past
    /// the configured byte limit.
    pub fn alloc(&self, len: usize) -> HyperionResult<ArenaBuffer> {
        let class = SizeClass::for_len(len);
        let bytes = class.capacity() * F32_BYTES;
        let mut stats = self.stats.borrow_mut();
        stats.allocations += 1;

        if let Some(limit) = self.config.byte_limit {
            if stats.live_bytes + bytes > limit {
                stats.refused += 1;
                return Err(HyperionError::Allocation(format!(
                    "{bytes} bytes requested with {} of {limit} in use",
                    stats.live_bytes
                )));
            }
        }

        let reused = self
            .idle
            .borrow_mut()
            .get_mut(&class)
            .and_then(Vec::pop);
        let data = match reused {
            Some(mut data) => {
                stats.hits += 1;
                data[..len].fill(0.0);
                data
            }
            None => {
                stats.misses += 1;
                vec![0.0; class.capacity()]
            }
        };

        stats.live_bytes += bytes;
        stats.peak_bytes = stats.peak_bytes.max(stats.live_bytes);
        Ok(ArenaBuffer { data, class, len })
    }

    /// Check out a buffer holding a copy of `src`
    ///
    /// # Errors
    ///
    /// See [`alloc`](Self::alloc).
    pub fn alloc_from_slice(&self, src: &[f32]) -> HyperionResult<ArenaBuffer> {
        let mut buf = self.alloc(src.len())?;
        buf.as_mut_slice().copy_from_slice(src);
        Ok(buf)
    }

    /// Hand a buffer back for reuse
    pub fn release(&self, buffer: ArenaBuffer) {
        let mut stats = self.stats.borrow_mut();
        stats.releases += 1;
        stats.live_bytes = stats
            .live_bytes
            .saturating_sub(buffer.class.capacity() * F32_BYTES);

        let mut idle = self.idle.borrow_mut();
        let pool = idle.entry(buffer.class).or_default();
        if pool.len() < self.config.max_per_class {
            pool.push(buffer.data);
        } else {
            stats.dropped += 1;
        }
    }

    /// Counter snapshot
    #[must_use]
    pub fn stats(&self) -> ArenaStats {
        *self.stats.borrow()
    }

    /// Idle buffers across all classes
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.idle.borrow().values().map(Vec::len).sum()
    }

    /// Bytes held by idle buffers
    #[must_use]
    pub fn idle_bytes(&self) -> usize {
        self.idle
            .borrow()
            .iter()
            .map(|(class, pool)| class.capacity() * pool.len() * F32_BYTES)
            .sum()
    }

    /// Drop all idle buffers
    pub fn clear(&self) {
        self.idle.borrow_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // SizeClass Tests
    // =========================================================================

    #[test]
    fn test_size_class_rounding() {
        assert_eq!(SizeClass::for_len(0).capacity(), 0);
        assert_eq!(SizeClass::for_len(1).capacity(), 1);
        assert_eq!(SizeClass::for_len(100).capacity(), 128);
        assert_eq!(SizeClass::for_len(1024).capacity(), 1024);
    }

    // =========================================================================
    // Allocation Tests
    // =========================================================================

    #[test]
    fn test_alloc_zeroed() {
        let arena = Arena::default();
        let buf = arena.alloc(10).expect("alloc");
        assert_eq!(buf.len(), 10);
        assert_eq!(buf.capacity(), 16);
        assert!(buf.as_slice().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_reuse_hits_and_rezeroes() {
        let arena = Arena::default();
        let mut buf = arena.alloc(8).expect("alloc");
        buf.as_mut_slice().fill(3.0);
        arena.release(buf);

        let buf = arena.alloc(7).expect("alloc");
        assert!(buf.as_slice().iter().all(|&v| v == 0.0));
        let stats = arena.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 50.0).abs() < 1e-4);
    }

    #[test]
    fn test_byte_limit_refuses() {
        let arena = Arena::new(ArenaConfig::default().with_byte_limit(Some(64 * 4)));
        let a = arena.alloc(64).expect("alloc");
        assert!(matches!(
            arena.alloc(1),
            Err(HyperionError::Allocation(_))
        ));
        assert_eq!(arena.stats().refused, 1);

        arena.release(a);
        assert!(arena.alloc(32).is_ok());
    }

    #[test]
    fn test_live_and_peak_bytes() {
        let arena = Arena::default();
        let a = arena.alloc(4).expect("alloc");
        let b = arena.alloc(4).expect("alloc");
        assert_eq!(arena.stats().live_bytes, 32);
        arena.release(a);
        arena.release(b);
        let stats = arena.stats();
        assert_eq!(stats.live_bytes, 0);
        assert_eq!(stats.peak_bytes, 32);
        assert_eq!(arena.idle_count(), 2);
        assert_eq!(arena.idle_bytes(), 32);
    }

    #[test]
    fn test_max_per_class_drops() {
        let arena = Arena::new(ArenaConfig::default().with_max_per_class(1));
        let a = arena.alloc(4).expect("alloc");
        let b = arena.alloc(4).expect("alloc");
        arena.release(a);
        arena.release(b);
        assert_eq!(arena.stats().dropped, 1);
        assert_eq!(arena.idle_count(), 1);

        arena.clear();
        assert_eq!(arena.idle_count(), 0);
    }

    #[test]
    fn test_alloc_from_slice() {
        let arena = Arena::default();
        let buf = arena.alloc_from_slice(&[1.0, 2.0, 3.0]).expect("alloc");
        assert_eq!(buf.as_slice(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_zero_length() {
        let arena = Arena::default();
        let buf = arena.alloc(0).expect("alloc");
        assert!(buf.is_empty());
        arena.release(buf);
    }
}
