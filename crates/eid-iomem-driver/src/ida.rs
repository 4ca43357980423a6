//! Bounded id allocator
//!
//! Hands out the smallest free integer in `[0, max)`. Ids name device nodes
//! and double as character-device minors, so the pool size matches the minor
//! range reserved at load time.

use parking_lot::Mutex;

use crate::error::{IomemError, Result};

const WORD_BITS: u32 = u64::BITS;

/// Id pool shared by every probe/remove path
#[derive(Debug)]
pub struct IdAllocator {
    max: u32,
    words: Mutex<Vec<u64>>,
}

impl IdAllocator {
    /// Create a pool of `max` ids
    #[must_use]
    pub fn new(max: u32) -> Self {
        let len = max.div_ceil(WORD_BITS) as usize;
        Self {
            max,
            words: Mutex::new(vec![0; len]),
        }
    }

    /// Allocate the smallest free id
    ///
    /// # Errors
    ///
    /// Returns `IomemError::ResourceExhausted` if every id is in use.
    pub fn allocate(&self) -> Result<u32> {
        let mut words = self.words.lock();

        for (index, word) in (0u32..).zip(words.iter_mut()) {
            if *word == u64::MAX {
                continue;
            }
            let bit = word.trailing_ones();
            let id = index * WORD_BITS + bit;
            if id >= self.max {
                break;
            }
            *word |= 1 << bit;
            tracing::trace!("ida: allocated {id}");
            return Ok(id);
        }

        Err(IomemError::ResourceExhausted { max: self.max })
    }

    /// Return `id` to the pool
    ///
    /// Releasing an id that is not allocated leaves the pool untouched.
    pub fn release(&self, id: u32) {
        let mut words = self.words.lock();
        let (index, mask) = Self::locate(id);

        match words.get_mut(index) {
            Some(word) if id < self.max && *word & mask != 0 => {
                *word &= !mask;
                tracing::trace!("ida: released {id}");
            }
            _ => tracing::warn!("ida: release of unallocated id {id}"),
        }
    }

    /// Whether `id` is currently handed out
    pub fn is_allocated(&self, id: u32) -> bool {
        let (index, mask) = Self::locate(id);
        self.words
            .lock()
            .get(index)
            .is_some_and(|word| word & mask != 0)
    }

    /// Number of ids currently handed out
    pub fn in_use(&self) -> u32 {
        self.words.lock().iter().map(|w| w.count_ones()).sum()
    }

    /// Pool size
    #[must_use]
    pub const fn capacity(&self) -> u32 {
        self.max
    }

    const fn locate(id: u32) -> (usize, u64) {
        ((id / WORD_BITS) as usize, 1 << (id % WORD_BITS))
    }
}
