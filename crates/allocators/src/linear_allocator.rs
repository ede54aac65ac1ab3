use super::{checked_next_multiple_of, Error};

/// Bump allocator over a fixed-size region. Individual allocations cannot be
/// freed; the whole region is reclaimed at once with [`LinearAllocator::clear`].
pub struct LinearAllocator {
    capacity: u64,
    bytes_allocated: u64,
}

impl LinearAllocator {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            bytes_allocated: 0,
        }
    }

    pub fn bytes_allocated(&self) -> u64 {
        self.bytes_allocated
    }

    pub fn is_full(&self) -> bool {
        self.bytes_allocated == self.capacity
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn can_fit(&self, size: u64, align: u64) -> bool {
        self.alloc_size(size, align)
            .and_then(|(offset, alloc_size)| offset.checked_add(alloc_size))
            .map_or(false, |end| end <= self.capacity)
    }

    /// Allocates `size` bytes aligned to `align` and returns the offset of
    /// the allocation. The allocation's size is rounded up to a multiple of
    /// `align`.
    ///
    /// ## Panics
    ///
    /// Panics if `align` is not a power of two.
    pub fn allocate(&mut self, size: u64, align: u64) -> Result<u64, Error> {
        let Some((offset, alloc_size)) = self.alloc_size(size, align) else {
            return Err(Error::InsufficientCapacity {
                capacity: self.capacity,
                requested: size,
            });
        };

        if alloc_size > self.capacity {
            Err(Error::InsufficientCapacity {
                capacity: self.capacity,
                requested: alloc_size,
            })
        } else if offset + alloc_size > self.capacity {
            Err(Error::OutOfMemory {
                capacity: self.capacity,
                available: self.capacity - self.bytes_allocated,
                requested: alloc_size,
            })
        } else {
            self.bytes_allocated = offset + alloc_size;
            Ok(offset)
        }
    }

    pub fn clear(&mut self) {
        self.bytes_allocated = 0;
    }

    /// The offset and rounded size of an allocation, or `None` if either
    /// overflows.
    fn alloc_size(&self, size: u64, align: u64) -> Option<(u64, u64)> {
        assert!(align.is_power_of_two(), "alignment must be a power of two");

        Some((
            checked_next_multiple_of(self.bytes_allocated, align)?,
            checked_next_multiple_of(size, align)?,
        ))
    }
}
