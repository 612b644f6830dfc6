//! Index extent pool.
//!
//! Index blocks come from a pool of fixed-size extents with a bounded
//! quota. To guarantee that statement-level rollback can never fail on
//! out-of-memory, a reserve-on-demand stash is prefaulted before a
//! statement touches any index: the statement either fails up front,
//! with nothing applied yet, or has enough slack to finish and to be
//! rolled back.

use parking_lot::Mutex;
use spindle_error::{Result, SpindleError};

/// Size of one index extent in bytes.
pub const MEMTX_EXTENT_SIZE: usize = 16 * 1024;

/// Extents reserved before a statement that inserts a tuple. Sized for
/// the worst-case number of block allocations one insert can cause.
pub const RESERVE_EXTENTS_BEFORE_REPLACE: usize = 16;

/// Extents reserved before a statement that only deletes.
pub const RESERVE_EXTENTS_BEFORE_DELETE: usize = 8;

#[derive(Debug, Default)]
struct PoolState {
    /// Extents currently allocated, including the reserved stash.
    allocated: usize,
    /// Extents sitting in the reserved stash.
    reserved: usize,
    /// Lifetime allocation counter.
    total_allocs: u64,
}

/// A quota-bounded pool of fixed-size extents.
#[derive(Debug)]
pub struct ExtentPool {
    quota: usize,
    state: Mutex<PoolState>,
}

impl ExtentPool {
    /// A pool bounded at `quota` extents.
    pub fn new(quota: usize) -> Self {
        Self {
            quota,
            state: Mutex::new(PoolState::default()),
        }
    }

    fn oom() -> SpindleError {
        SpindleError::OutOfMemory {
            amount: MEMTX_EXTENT_SIZE,
            allocator: "mempool",
            object: "new slab",
        }
    }

    /// Make sure the next `num` [`ExtentPool::alloc`] calls cannot
    /// fail.
    pub fn reserve(&self, num: usize) -> Result<()> {
        let mut state = self.state.lock();
        while state.reserved < num {
            if state.allocated >= self.quota {
                return Err(Self::oom());
            }
            state.allocated += 1;
            state.reserved += 1;
            state.total_allocs += 1;
        }
        Ok(())
    }

    /// Allocate one extent, preferring the reserved stash.
    pub fn alloc(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.reserved > 0 {
            state.reserved -= 1;
            return Ok(());
        }
        if state.allocated >= self.quota {
            return Err(Self::oom());
        }
        state.allocated += 1;
        state.total_allocs += 1;
        Ok(())
    }

    /// Return one extent to the pool.
    pub fn free(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.allocated > 0);
        state.allocated = state.allocated.saturating_sub(1);
    }

    pub fn allocated(&self) -> usize {
        self.state.lock().allocated
    }

    pub fn reserved(&self) -> usize {
        self.state.lock().reserved
    }

    pub fn total_allocs(&self) -> u64 {
        self.state.lock().total_allocs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_prefaults_up_to_the_quota() {
        let pool = ExtentPool::new(4);
        pool.reserve(3).unwrap();
        assert_eq!(pool.reserved(), 3);
        assert_eq!(pool.allocated(), 3);
        // A second reserve for fewer extents is a no-op.
        pool.reserve(2).unwrap();
        assert_eq!(pool.reserved(), 3);
        assert!(pool.reserve(5).is_err());
    }

    #[test]
    fn alloc_prefers_the_stash() {
        let pool = ExtentPool::new(2);
        pool.reserve(2).unwrap();
        let before = pool.total_allocs();
        pool.alloc().unwrap();
        pool.alloc().unwrap();
        // Both came from the stash: no new allocations.
        assert_eq!(pool.total_allocs(), before);
        assert!(pool.alloc().is_err());
        pool.free();
        pool.alloc().unwrap();
    }
}
