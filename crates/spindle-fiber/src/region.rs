//! Per-fiber scratch arena.
//!
//! Every fiber owns a region for short-lived allocations that live until
//! the next [`Region::gc`]. Buffers are lent out and reclaimed rather
//! than freed per use, so a fiber that repeatedly builds request-sized
//! payloads settles on a small steady-state set of allocations.

/// Usage threshold above which `gc` releases the backing memory instead
/// of just resetting it.
pub const REGION_GC_THRESHOLD: usize = 128 * 1024;

/// A bump-style scratch arena of reusable byte buffers.
#[derive(Debug, Default)]
pub struct Region {
    free: Vec<Vec<u8>>,
    /// Total capacity of every buffer this region has handed out or
    /// holds, i.e. the memory the region is responsible for.
    used: usize,
}

impl Region {
    pub const fn new() -> Self {
        Self {
            free: Vec::new(),
            used: 0,
        }
    }

    /// Borrow a cleared buffer with at least `cap` capacity.
    pub fn take(&mut self, cap: usize) -> Vec<u8> {
        if let Some(pos) = self.free.iter().position(|b| b.capacity() >= cap) {
            let mut buf = self.free.swap_remove(pos);
            buf.clear();
            return buf;
        }
        self.used += cap;
        Vec::with_capacity(cap)
    }

    /// Return a buffer taken with [`Region::take`].
    pub fn reclaim(&mut self, buf: Vec<u8>) {
        self.free.push(buf);
    }

    /// Memory currently accounted to this region.
    pub const fn used(&self) -> usize {
        self.used
    }

    /// Reset the region. Below [`REGION_GC_THRESHOLD`] the backing
    /// buffers are kept for reuse; above it everything is released.
    pub fn gc(&mut self) {
        if self.used < REGION_GC_THRESHOLD {
            return;
        }
        self.free.clear();
        self.free.shrink_to_fit();
        self.used = 0;
    }

    /// Release everything unconditionally. Used when a fiber is
    /// recycled.
    pub fn free_all(&mut self) {
        self.free.clear();
        self.free.shrink_to_fit();
        self.used = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_reuses_reclaimed_buffers() {
        let mut region = Region::new();
        let buf = region.take(64);
        let used = region.used();
        region.reclaim(buf);
        let _again = region.take(32);
        assert_eq!(region.used(), used, "no new allocation for a smaller ask");
    }

    #[test]
    fn gc_keeps_small_regions() {
        let mut region = Region::new();
        let buf = region.take(1024);
        region.reclaim(buf);
        region.gc();
        assert_eq!(region.used(), 1024);
    }

    #[test]
    fn gc_frees_large_regions() {
        let mut region = Region::new();
        let buf = region.take(REGION_GC_THRESHOLD);
        region.reclaim(buf);
        region.gc();
        assert_eq!(region.used(), 0);
    }
}
