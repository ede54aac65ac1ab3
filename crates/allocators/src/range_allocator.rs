use std::collections::{BTreeMap, BTreeSet, VecDeque};

use super::Error;

/// A freed run that may still be referenced by in-flight GPU work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Retired {
    offset: u32,
    count: u32,
    frame: u64,
}

/// Best-fit allocator over a fixed number of contiguous slots.
///
/// Free runs are indexed twice: by offset, so that a released run can find
/// its neighbors, and by size, so that allocation can find the smallest run
/// that fits. Frees are deferred until the frame that last used the run is
/// known to be complete (see [`RangeAllocator::release`]).
pub struct RangeAllocator {
    capacity: u32,
    num_free: u32,
    by_offset: BTreeMap<u32, u32>,
    by_size: BTreeSet<(u32, u32)>,
    retired: VecDeque<Retired>,
}

impl RangeAllocator {
    pub fn new(capacity: u32) -> Self {
        assert!(capacity > 0);

        let mut allocator = Self {
            capacity,
            num_free: 0,
            by_offset: BTreeMap::new(),
            by_size: BTreeSet::new(),
            retired: VecDeque::new(),
        };

        allocator.insert_run(0, capacity);
        allocator
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// The number of slots available for allocation. Slots waiting in the
    /// retirement queue are not counted.
    pub fn num_free(&self) -> u32 {
        self.num_free
    }

    /// Whether a single run of at least `count` slots is free.
    pub fn has_space(&self, count: u32) -> bool {
        self.by_size.range((count, 0)..).next().is_some()
    }

    /// Free runs as `(offset, count)` pairs, ordered by offset.
    pub fn free_runs(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.by_offset.iter().map(|(&offset, &count)| (offset, count))
    }

    /// The number of slots that have been freed but not yet released.
    pub fn num_pending(&self) -> u32 {
        self.retired.iter().map(|r| r.count).sum()
    }

    /// Allocates `count` contiguous slots from the smallest free run that
    /// can hold them, returning the offset of the first slot. Ties go to the
    /// lowest offset.
    ///
    /// ## Panics
    ///
    /// Panics if `count` is zero.
    ///
    /// ## Errors
    ///
    /// Returns `InsufficientCapacity` if `count` exceeds the capacity of the
    /// allocator and `OutOfMemory` if no free run is large enough.
    pub fn allocate(&mut self, count: u32) -> Result<u32, Error> {
        assert!(count > 0, "zero-sized range allocation");

        if count > self.capacity {
            return Err(Error::InsufficientCapacity {
                capacity: self.capacity.into(),
                requested: count.into(),
            });
        }

        let Some(&(size, offset)) = self.by_size.range((count, 0)..).next() else {
            return Err(Error::OutOfMemory {
                capacity: self.capacity.into(),
                available: self.num_free.into(),
                requested: count.into(),
            });
        };

        self.remove_run(offset, size);

        if size > count {
            self.insert_run(offset + count, size - count);
        }

        Ok(offset)
    }

    /// Queues a run for release once `frame` has completed. The run remains
    /// unavailable until [`RangeAllocator::release`] is called with a frame
    /// at least as large as `frame`.
    ///
    /// ## Panics
    ///
    /// Panics if the run extends past the end of the allocator.
    pub fn free(&mut self, offset: u32, count: u32, frame: u64) {
        assert!(
            offset
                .checked_add(count)
                .map_or(false, |end| end <= self.capacity),
            "run {offset}+{count} is out of bounds for capacity {}",
            self.capacity
        );

        self.retired.push_back(Retired {
            offset,
            count,
            frame,
        });
    }

    /// Returns every queued run whose frame is at or before `completed_frame`
    /// to the free list, merging it with adjacent free runs. Returns the
    /// number of slots released.
    pub fn release(&mut self, completed_frame: u64) -> u32 {
        let mut released = 0;

        while let Some(&run) = self.retired.front() {
            if run.frame > completed_frame {
                break;
            }

            self.retired.pop_front();
            self.coalesce(run.offset, run.count);
            released += run.count;
        }

        released
    }

    fn coalesce(&mut self, mut offset: u32, mut count: u32) {
        if let Some((&prev_offset, &prev_count)) = self.by_offset.range(..offset).next_back() {
            debug_assert!(prev_offset + prev_count <= offset, "double free at {offset}");

            if prev_offset + prev_count == offset {
                self.remove_run(prev_offset, prev_count);
                offset = prev_offset;
                count += prev_count;
            }
        }

        if let Some((&next_offset, &next_count)) = self.by_offset.range(offset + count..).next() {
            if next_offset == offset + count {
                self.remove_run(next_offset, next_count);
                count += next_count;
            }
        }

        debug_assert!(
            self.by_offset
                .range(offset..offset + count)
                .next()
                .is_none(),
            "double free at {offset}"
        );

        self.insert_run(offset, count);
    }

    fn insert_run(&mut self, offset: u32, count: u32) {
        self.by_offset.insert(offset, count);
        self.by_size.insert((count, offset));
        self.num_free += count;
    }

    fn remove_run(&mut self, offset: u32, count: u32) {
        self.by_offset.remove(&offset);
        self.by_size.remove(&(count, offset));
        self.num_free -= count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_runs(allocator: &RangeAllocator) -> Vec<(u32, u32)> {
        allocator.free_runs().collect()
    }

    #[test]
    fn allocate_and_release() {
        let mut allocator = RangeAllocator::new(16);

        assert_eq!(allocator.allocate(4), Ok(0));
        assert_eq!(allocator.allocate(4), Ok(4));
        assert_eq!(allocator.allocate(8), Ok(8));
        assert_eq!(allocator.num_free(), 0);

        assert_eq!(
            allocator.allocate(1),
            Err(Error::OutOfMemory {
                capacity: 16,
                available: 0,
                requested: 1
            })
        );

        assert_eq!(
            allocator.allocate(17),
            Err(Error::InsufficientCapacity {
                capacity: 16,
                requested: 17
            })
        );

        allocator.free(4, 4, 1);
        assert_eq!(allocator.num_free(), 0);
        assert_eq!(allocator.num_pending(), 4);

        assert_eq!(allocator.release(1), 4);
        assert_eq!(free_runs(&allocator), vec![(4, 4)]);
        assert_eq!(allocator.allocate(4), Ok(4));
    }

    #[test]
    fn deferred_until_frame_completes() {
        let mut allocator = RangeAllocator::new(8);

        let a = allocator.allocate(8).unwrap();
        allocator.free(a, 8, 5);

        assert_eq!(allocator.release(3), 0);
        assert!(allocator.allocate(1).is_err());

        assert_eq!(allocator.release(4), 0);
        assert!(allocator.allocate(1).is_err());

        assert_eq!(allocator.release(5), 8);
        assert_eq!(allocator.allocate(8), Ok(0));
    }

    #[test]
    fn release_is_fifo() {
        let mut allocator = RangeAllocator::new(8);

        let a = allocator.allocate(4).unwrap();
        let b = allocator.allocate(4).unwrap();

        allocator.free(a, 4, 2);
        allocator.free(b, 4, 3);

        assert_eq!(allocator.release(2), 4);
        assert_eq!(free_runs(&allocator), vec![(0, 4)]);
        assert_eq!(allocator.num_pending(), 4);

        assert_eq!(allocator.release(10), 4);
        assert_eq!(free_runs(&allocator), vec![(0, 8)]);
    }

    #[test]
    fn best_fit() {
        let mut allocator = RangeAllocator::new(32);

        let a = allocator.allocate(8).unwrap();
        let _b = allocator.allocate(2).unwrap();
        let c = allocator.allocate(3).unwrap();
        let _d = allocator.allocate(19).unwrap();

        allocator.free(a, 8, 0);
        allocator.free(c, 3, 0);
        allocator.release(0);

        assert_eq!(free_runs(&allocator), vec![(0, 8), (10, 3)]);

        // The 3-slot hole is a better fit than the 8-slot hole.
        assert_eq!(allocator.allocate(3), Ok(10));
        assert_eq!(allocator.allocate(2), Ok(0));
        assert_eq!(free_runs(&allocator), vec![(2, 6)]);
    }

    #[test]
    fn adjacent_frees_coalesce() {
        let mut allocator = RangeAllocator::new(12);

        let a = allocator.allocate(4).unwrap();
        let b = allocator.allocate(4).unwrap();
        let c = allocator.allocate(4).unwrap();

        allocator.free(a, 4, 0);
        allocator.free(c, 4, 0);
        allocator.release(0);
        assert_eq!(free_runs(&allocator), vec![(0, 4), (8, 4)]);

        allocator.free(b, 4, 1);
        allocator.release(1);
        assert_eq!(free_runs(&allocator), vec![(0, 12)]);
        assert_eq!(allocator.allocate(12), Ok(0));
    }

    #[test]
    fn free_plus_allocated_equals_capacity() {
        const CAPACITY: u32 = 256;

        let mut allocator = RangeAllocator::new(CAPACITY);
        let mut live: Vec<(u32, u32)> = Vec::new();
        let mut pending = 0;
        let mut seed = 0x2545_f491_u32;

        for frame in 0..400_u64 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;

            if seed % 3 != 0 || live.is_empty() {
                let count = seed % 24 + 1;
                if let Ok(offset) = allocator.allocate(count) {
                    live.push((offset, count));
                }
            } else {
                let (offset, count) = live.swap_remove(seed as usize % live.len());
                allocator.free(offset, count, frame);
                pending += count;
            }

            if frame % 7 == 0 {
                pending -= allocator.release(frame.saturating_sub(2));
            }

            let allocated: u32 = live.iter().map(|(_, count)| count).sum();
            let free: u32 = allocator.free_runs().map(|(_, count)| count).sum();

            assert_eq!(free, allocator.num_free());
            assert_eq!(free + allocated + pending, CAPACITY);

            // Adjacent free runs are always merged.
            let runs = free_runs(&allocator);
            for pair in runs.windows(2) {
                assert!(pair[0].0 + pair[0].1 < pair[1].0);
            }
        }
    }

    #[test]
    #[should_panic]
    fn free_out_of_bounds() {
        let mut allocator = RangeAllocator::new(4);
        allocator.free(2, 4, 0);
    }
}
