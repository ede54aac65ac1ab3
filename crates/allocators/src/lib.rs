//! Allocation algorithms shared by the GPU memory managers.
//!
//! Neither allocator touches memory itself. Both hand out offsets into a
//! region owned by the caller (a descriptor heap, a mapped upload buffer), so
//! they can be tested without a device.

pub mod linear_allocator;
pub mod range_allocator;

pub use linear_allocator::LinearAllocator;
pub use range_allocator::RangeAllocator;

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The allocator does not have enough free space to satisfy the
    /// allocation request. `available` may be fragmented.
    #[error("out of memory: requested {requested}, {available} of {capacity} available")]
    OutOfMemory {
        capacity: u64,
        available: u64,
        requested: u64,
    },
    /// The allocator is not large enough to ever satisfy the allocation
    /// request, even when empty.
    #[error("requested {requested} exceeds the allocator capacity of {capacity}")]
    InsufficientCapacity { capacity: u64, requested: u64 },
}

/// Rounds `a` up to the nearest multiple of `b`, or `None` if the result
/// does not fit in a `u64`.
pub fn checked_next_multiple_of(a: u64, b: u64) -> Option<u64> {
    match a % b {
        0 => Some(a),
        r => a.checked_add(b - r),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_multiple() {
        assert_eq!(checked_next_multiple_of(0, 256), Some(0));
        assert_eq!(checked_next_multiple_of(1, 256), Some(256));
        assert_eq!(checked_next_multiple_of(256, 256), Some(256));
        assert_eq!(checked_next_multiple_of(257, 256), Some(512));
        assert_eq!(checked_next_multiple_of(7, 3), Some(9));

        assert_eq!(checked_next_multiple_of(u64::MAX - 1, 256), None);
        assert_eq!(checked_next_multiple_of(u64::MAX, 1), Some(u64::MAX));
    }
}
