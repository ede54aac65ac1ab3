//! Persistent descriptor allocation.
//!
//! Descriptors for views that outlive a single command list (a texture's
//! shader resource view, a render target's RTV) are carved out of CPU-only
//! descriptor heaps here. Heaps are created on demand and never destroyed
//! before the last allocation from them. Freed descriptors are only reused
//! once the frame that last referenced them has completed on the GPU.

use std::{
    collections::BTreeSet,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use allocators::RangeAllocator;
use log::debug;
use parking_lot::Mutex;

use crate::{
    device::{CpuDescriptor, DescriptorHeap, DescriptorHeapKind, Device},
    error::Error,
};

/// A contiguous run of descriptors in one heap.
///
/// Allocations cannot be copied. Returning one through
/// [`DescriptorAllocator::free`] tags it with an explicit frame. Dropping it
/// instead frees it at the allocator's current frame, so in both cases the
/// descriptors are reused only after that frame completes.
#[must_use]
pub struct DescriptorAllocation {
    kind: DescriptorHeapKind,
    heap: usize,
    offset: u32,
    len: u32,
    base: CpuDescriptor,
    increment: u32,
    /// `None` once the allocation has been returned.
    owner: Option<Arc<Shared>>,
}

impl DescriptorAllocation {
    pub fn kind(&self) -> DescriptorHeapKind {
        self.kind
    }

    /// The index of the heap within its allocator.
    pub fn heap(&self) -> usize {
        self.heap
    }

    /// The offset of the first descriptor within its heap.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// ## Panics
    ///
    /// Panics if `index` is out of range.
    pub fn descriptor(&self, index: u32) -> CpuDescriptor {
        assert!(
            index < self.len,
            "descriptor {index} out of range for an allocation of {}",
            self.len
        );
        self.base.offset(index, self.increment)
    }
}

impl fmt::Debug for DescriptorAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorAllocation")
            .field("kind", &self.kind)
            .field("heap", &self.heap)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("base", &self.base)
            .finish()
    }
}

impl Drop for DescriptorAllocation {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.take() {
            let frame = owner.current_frame.load(Ordering::Acquire);
            owner.free(self, frame);
        }
    }
}

/// One descriptor heap and the free list over its slots.
pub struct DescriptorBlock {
    heap: DescriptorHeap,
    ranges: RangeAllocator,
}

impl DescriptorBlock {
    fn new(device: &dyn Device, kind: DescriptorHeapKind, len: u32) -> Result<Self, Error> {
        let heap = device.create_descriptor_heap(kind, len, false)?;
        debug!("created {kind:?} descriptor heap of {len} descriptors");

        Ok(Self {
            ranges: RangeAllocator::new(heap.len),
            heap,
        })
    }

    pub fn heap(&self) -> &DescriptorHeap {
        &self.heap
    }

    pub fn num_free(&self) -> u32 {
        self.ranges.num_free()
    }

    fn allocate(
        &mut self,
        index: usize,
        count: u32,
        owner: &Arc<Shared>,
    ) -> Result<DescriptorAllocation, Error> {
        let offset = self.ranges.allocate(count)?;

        Ok(DescriptorAllocation {
            kind: self.heap.kind,
            heap: index,
            offset,
            len: count,
            base: self.heap.cpu_start.offset(offset, self.heap.increment),
            increment: self.heap.increment,
            owner: Some(owner.clone()),
        })
    }
}

struct Blocks {
    descriptors_per_heap: u32,
    blocks: Vec<DescriptorBlock>,
    /// Blocks with at least one free descriptor, in creation order.
    with_space: BTreeSet<usize>,
}

/// State shared between an allocator and its live allocations.
struct Shared {
    blocks: Mutex<Blocks>,
    /// The frame dropped allocations are freed at.
    current_frame: AtomicU64,
}

impl Shared {
    fn free(&self, allocation: &DescriptorAllocation, frame: u64) {
        let mut blocks = self.blocks.lock();
        let block = &mut blocks.blocks[allocation.heap];
        block.ranges.free(allocation.offset, allocation.len, frame);
    }
}

pub struct DescriptorAllocator {
    kind: DescriptorHeapKind,
    device: Arc<dyn Device>,
    shared: Arc<Shared>,
}

impl DescriptorAllocator {
    pub fn new(device: Arc<dyn Device>, kind: DescriptorHeapKind, descriptors_per_heap: u32) -> Self {
        assert!(descriptors_per_heap > 0);

        Self {
            kind,
            device,
            shared: Arc::new(Shared {
                blocks: Mutex::new(Blocks {
                    descriptors_per_heap,
                    blocks: Vec::new(),
                    with_space: BTreeSet::new(),
                }),
                current_frame: AtomicU64::new(0),
            }),
        }
    }

    pub fn kind(&self) -> DescriptorHeapKind {
        self.kind
    }

    /// Allocates `count` contiguous descriptors from the first heap that can
    /// hold them, creating a new heap if none can.
    ///
    /// ## Panics
    ///
    /// Panics if `count` is zero.
    ///
    /// ## Errors
    ///
    /// Fails only if a new heap is needed and the device cannot create it.
    pub fn allocate(&self, count: u32) -> Result<DescriptorAllocation, Error> {
        assert!(count > 0, "zero-sized descriptor allocation");

        let mut guard = self.shared.blocks.lock();
        let blocks = &mut *guard;

        let mut found = None;
        let mut full = Vec::new();

        for &index in &blocks.with_space {
            let block = &mut blocks.blocks[index];
            if !block.ranges.has_space(count) {
                continue;
            }

            let allocation = block.allocate(index, count, &self.shared)?;
            if block.num_free() == 0 {
                full.push(index);
            }

            found = Some(allocation);
            break;
        }

        for index in full {
            blocks.with_space.remove(&index);
        }

        if let Some(allocation) = found {
            return Ok(allocation);
        }

        blocks.descriptors_per_heap = blocks.descriptors_per_heap.max(count);

        let index = blocks.blocks.len();
        let mut block = DescriptorBlock::new(&*self.device, self.kind, blocks.descriptors_per_heap)?;
        let allocation = block.allocate(index, count, &self.shared)?;

        if block.num_free() > 0 {
            blocks.with_space.insert(index);
        }
        blocks.blocks.push(block);

        Ok(allocation)
    }

    /// Returns `allocation` to its heap once `frame` has completed.
    ///
    /// ## Panics
    ///
    /// Panics if `allocation` came from a different allocator.
    pub fn free(&self, mut allocation: DescriptorAllocation, frame: u64) {
        let owner = allocation.owner.take();
        assert!(
            owner.map_or(false, |owner| Arc::ptr_eq(&owner, &self.shared)),
            "descriptor allocation does not belong to this allocator"
        );

        self.shared.free(&allocation, frame);
    }

    /// Sets the frame that dropped allocations are freed at.
    pub fn set_current_frame(&self, frame: u64) {
        self.shared.current_frame.store(frame, Ordering::Release);
    }

    pub fn current_frame(&self) -> u64 {
        self.shared.current_frame.load(Ordering::Acquire)
    }

    /// Makes every allocation freed at or before `completed_frame` available
    /// again.
    pub fn release_stale_descriptors(&self, completed_frame: u64) {
        let mut guard = self.shared.blocks.lock();
        let blocks = &mut *guard;

        for (index, block) in blocks.blocks.iter_mut().enumerate() {
            block.ranges.release(completed_frame);

            if block.num_free() > 0 {
                blocks.with_space.insert(index);
            }
        }
    }

    pub fn num_heaps(&self) -> usize {
        self.shared.blocks.lock().blocks.len()
    }

    pub fn num_free(&self) -> u32 {
        self.shared
            .blocks
            .lock()
            .blocks
            .iter()
            .map(DescriptorBlock::num_free)
            .sum()
    }

    pub fn descriptors_per_heap(&self) -> u32 {
        self.shared.blocks.lock().descriptors_per_heap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessDevice;

    fn allocator(per_heap: u32) -> DescriptorAllocator {
        DescriptorAllocator::new(
            Arc::new(HeadlessDevice::new()),
            DescriptorHeapKind::CbvSrvUav,
            per_heap,
        )
    }

    #[test]
    fn allocate_within_one_heap() {
        let allocator = allocator(16);

        let a = allocator.allocate(4).unwrap();
        let b = allocator.allocate(4).unwrap();

        assert_eq!(allocator.num_heaps(), 1);
        assert_eq!((a.heap(), a.offset()), (0, 0));
        assert_eq!((b.heap(), b.offset()), (0, 4));
        assert_eq!(a.descriptor(3).0 + 32, b.descriptor(0).0);
        assert_eq!(allocator.num_free(), 8);

        allocator.free(a, 0);
        allocator.free(b, 0);
    }

    #[test]
    fn freed_descriptors_wait_for_frame() {
        let allocator = allocator(8);

        let a = allocator.allocate(8).unwrap();
        allocator.free(a, 3);

        allocator.release_stale_descriptors(2);
        assert_eq!(allocator.num_free(), 0);

        // Still in flight, so this must come from a new heap.
        let b = allocator.allocate(8).unwrap();
        assert_eq!(b.heap(), 1);

        allocator.release_stale_descriptors(3);
        assert_eq!(allocator.num_free(), 8);

        let c = allocator.allocate(8).unwrap();
        assert_eq!((c.heap(), c.offset()), (0, 0));
        assert_eq!(allocator.num_heaps(), 2);

        allocator.free(b, 4);
        allocator.free(c, 4);
    }

    #[test]
    fn grows_for_large_requests() {
        let allocator = allocator(8);

        let small = allocator.allocate(2).unwrap();
        let large = allocator.allocate(20).unwrap();

        assert_eq!(large.heap(), 1);
        assert_eq!(allocator.descriptors_per_heap(), 20);
        assert_eq!(allocator.num_free(), 6);

        // Heaps created from now on are at least as large as the largest
        // request.
        let a = allocator.allocate(7).unwrap();
        let b = allocator.allocate(6).unwrap();
        assert_eq!((a.heap(), a.offset()), (2, 0));
        assert_eq!((b.heap(), b.offset()), (0, 2));
        assert_eq!(allocator.num_heaps(), 3);
        assert_eq!(allocator.num_free(), 13);

        for allocation in [small, large, a, b] {
            allocator.free(allocation, 0);
        }
        allocator.release_stale_descriptors(0);
        assert_eq!(allocator.num_free(), 8 + 20 + 20);
    }

    #[test]
    fn first_heap_with_space_wins() {
        let allocator = allocator(4);

        let a = allocator.allocate(4).unwrap();
        let b = allocator.allocate(4).unwrap();
        assert_eq!((a.heap(), b.heap()), (0, 1));

        allocator.free(b, 0);
        allocator.free(a, 0);
        allocator.release_stale_descriptors(0);

        let c = allocator.allocate(2).unwrap();
        assert_eq!(c.heap(), 0);
        allocator.free(c, 1);
    }

    #[test]
    fn dropped_allocation_is_freed_at_current_frame() {
        let allocator = allocator(8);
        allocator.set_current_frame(2);

        let a = allocator.allocate(8).unwrap();
        drop(a);

        allocator.release_stale_descriptors(1);
        assert_eq!(allocator.num_free(), 0);

        allocator.release_stale_descriptors(2);
        assert_eq!(allocator.num_free(), 8);

        let b = allocator.allocate(8).unwrap();
        assert_eq!((b.heap(), b.offset()), (0, 0));
        assert_eq!(allocator.num_heaps(), 1);
        allocator.free(b, 2);
    }

    #[test]
    #[should_panic]
    fn free_into_other_allocator() {
        let first = allocator(4);
        let second = allocator(4);

        let a = first.allocate(2).unwrap();
        second.free(a, 0);
    }

    #[test]
    #[should_panic]
    fn descriptor_out_of_range() {
        let allocator = allocator(4);
        let a = allocator.allocate(2).unwrap();
        let _ = a.descriptor(2);
    }

    #[test]
    fn concurrent_allocation() {
        let allocator = Arc::new(allocator(64));

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let allocator = allocator.clone();
                std::thread::spawn(move || {
                    let mut allocations = Vec::new();
                    for i in 1..=16 {
                        allocations.push(allocator.allocate(i % 5 + 1).unwrap());
                    }
                    for allocation in allocations {
                        allocator.free(allocation, 1);
                    }
                })
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }

        allocator.release_stale_descriptors(1);
        assert_eq!(
            allocator.num_free(),
            allocator.num_heaps() as u32 * allocator.descriptors_per_heap()
        );
    }
}
