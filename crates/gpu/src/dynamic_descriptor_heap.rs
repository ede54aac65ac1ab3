use std::{collections::VecDeque, sync::Arc};

use log::debug;

use crate::{
    command::{BindPoint, Command, Encoder},
    device::{CpuDescriptor, DescriptorHeap, DescriptorHeapKind, Device, GpuDescriptor},
    error::{DeviceError, Error},
    root_signature::{RootSignature, MAX_ROOT_PARAMETERS},
};

#[derive(Clone, Copy, Debug, Default)]
struct TableCache {
    /// Index of the table's first descriptor in the handle cache.
    base: u32,
    count: u32,
}

/// Stages descriptors for the tables of the bound root signature and copies
/// them into shader-visible heaps right before a draw or dispatch.
///
/// Writes to shader-visible heaps are expensive and the heaps are small, so
/// only tables that changed since the last commit are copied.
pub struct DynamicDescriptorHeap {
    device: Arc<dyn Device>,
    kind: DescriptorHeapKind,
    descriptors_per_heap: u32,
    increment: u32,

    handle_cache: Box<[CpuDescriptor]>,
    tables: [TableCache; MAX_ROOT_PARAMETERS],
    /// Root parameters that are descriptor tables of this heap's kind.
    table_mask: u32,
    /// Tables modified since the last commit.
    stale_mask: u32,

    heaps: Vec<DescriptorHeap>,
    available: VecDeque<usize>,
    current: Option<usize>,
    cpu_cursor: CpuDescriptor,
    gpu_cursor: GpuDescriptor,
    num_free_handles: u32,
}

impl DynamicDescriptorHeap {
    pub fn new(device: Arc<dyn Device>, kind: DescriptorHeapKind, descriptors_per_heap: u32) -> Self {
        assert!(kind.can_be_shader_visible());
        assert!(descriptors_per_heap > 0);

        Self {
            increment: device.descriptor_increment(kind),
            device,
            kind,
            descriptors_per_heap,
            handle_cache: vec![CpuDescriptor::default(); descriptors_per_heap as usize]
                .into_boxed_slice(),
            tables: [TableCache::default(); MAX_ROOT_PARAMETERS],
            table_mask: 0,
            stale_mask: 0,
            heaps: Vec::new(),
            available: VecDeque::new(),
            current: None,
            cpu_cursor: CpuDescriptor::default(),
            gpu_cursor: GpuDescriptor::default(),
            num_free_handles: 0,
        }
    }

    pub fn kind(&self) -> DescriptorHeapKind {
        self.kind
    }

    /// The number of shader-visible heaps created so far.
    pub fn num_heaps(&self) -> usize {
        self.heaps.len()
    }

    /// Lays out the handle cache for the descriptor tables of `signature`.
    /// Must be called whenever the bound root signature changes.
    ///
    /// ## Panics
    ///
    /// Panics if the signature's tables need more descriptors than fit in
    /// one shader-visible heap.
    pub fn parse_root_signature(&mut self, signature: &RootSignature) {
        self.stale_mask = 0;
        self.tables = [TableCache::default(); MAX_ROOT_PARAMETERS];
        self.table_mask = signature.descriptor_table_mask(self.kind);

        let mut base = 0;
        for root_index in set_bits(self.table_mask) {
            let count = signature.num_descriptors(root_index);
            self.tables[root_index as usize] = TableCache { base, count };
            base += count;
        }

        assert!(
            base <= self.descriptors_per_heap,
            "root signature needs {base} descriptors, more than the {} in a descriptor heap",
            self.descriptors_per_heap
        );
    }

    /// Copies the handles of `count` consecutive descriptors starting at
    /// `src` into the table at `root_index`, starting `offset` descriptors
    /// into the table.
    pub fn stage_descriptors(
        &mut self,
        root_index: u32,
        offset: u32,
        count: u32,
        src: CpuDescriptor,
    ) -> Result<(), Error> {
        if count > self.descriptors_per_heap {
            return Err(Error::DescriptorTableTooLarge {
                requested: count,
                limit: self.descriptors_per_heap,
            });
        }

        if root_index as usize >= MAX_ROOT_PARAMETERS {
            return Err(Error::InvalidRootParameter(root_index));
        }

        let table = self.tables[root_index as usize];
        if offset.checked_add(count).map_or(true, |end| end > table.count) {
            return Err(Error::DescriptorTableOverflow {
                root_index,
                offset,
                count,
                capacity: table.count,
            });
        }

        let start = (table.base + offset) as usize;
        for (i, handle) in self.handle_cache[start..start + count as usize]
            .iter_mut()
            .enumerate()
        {
            *handle = src.offset(i as u32, self.increment);
        }

        self.stale_mask |= 1 << root_index;
        Ok(())
    }

    pub fn commit_staged_descriptors_for_draw(&mut self, encoder: &mut Encoder) -> Result<(), Error> {
        self.commit_staged_descriptors(encoder, BindPoint::Graphics)
    }

    pub fn commit_staged_descriptors_for_dispatch(
        &mut self,
        encoder: &mut Encoder,
    ) -> Result<(), Error> {
        self.commit_staged_descriptors(encoder, BindPoint::Compute)
    }

    /// Copies a single descriptor into the shader-visible heap and returns
    /// its GPU address. Used for descriptors bound outside of tables, such
    /// as UAV clears.
    pub fn copy_descriptor(
        &mut self,
        encoder: &mut Encoder,
        descriptor: CpuDescriptor,
    ) -> Result<GpuDescriptor, Error> {
        if self.current.is_none() || self.num_free_handles < 1 {
            self.switch_heap(encoder)?;
        }

        self.device
            .copy_descriptors(self.kind, self.cpu_cursor, &[descriptor]);

        let gpu = self.gpu_cursor;
        self.advance(1);
        Ok(gpu)
    }

    /// Returns all shader-visible heaps to the pool and clears the cache.
    /// Only safe once the GPU is done with the command list that owns this
    /// heap.
    pub fn reset(&mut self) {
        self.available.clear();
        self.available.extend(0..self.heaps.len());
        self.current = None;
        self.cpu_cursor = CpuDescriptor::default();
        self.gpu_cursor = GpuDescriptor::default();
        self.num_free_handles = 0;
        self.table_mask = 0;
        self.stale_mask = 0;
        self.tables = [TableCache::default(); MAX_ROOT_PARAMETERS];
        self.handle_cache.fill(CpuDescriptor::default());
    }

    fn num_stale_descriptors(&self) -> u32 {
        set_bits(self.stale_mask)
            .map(|root_index| self.tables[root_index as usize].count)
            .sum()
    }

    fn commit_staged_descriptors(
        &mut self,
        encoder: &mut Encoder,
        bind_point: BindPoint,
    ) -> Result<(), Error> {
        let num_stale = self.num_stale_descriptors();
        if num_stale == 0 {
            return Ok(());
        }

        if self.current.is_none() || self.num_free_handles < num_stale {
            self.switch_heap(encoder)?;
        }

        for root_index in set_bits(self.stale_mask) {
            let table = self.tables[root_index as usize];
            if table.count == 0 {
                continue;
            }

            let start = table.base as usize;
            self.device.copy_descriptors(
                self.kind,
                self.cpu_cursor,
                &self.handle_cache[start..start + table.count as usize],
            );

            encoder.push(Command::SetRootDescriptorTable {
                bind_point,
                root_index,
                base: self.gpu_cursor,
            });

            self.advance(table.count);
        }

        self.stale_mask = 0;
        Ok(())
    }

    /// Moves to a fresh shader-visible heap and binds it. Every table has to
    /// be copied into the new heap, so all of them are marked stale.
    fn switch_heap(&mut self, encoder: &mut Encoder) -> Result<(), Error> {
        let index = match self.available.pop_front() {
            Some(index) => index,
            None => {
                let heap =
                    self.device
                        .create_descriptor_heap(self.kind, self.descriptors_per_heap, true)?;
                debug!(
                    "created shader-visible {:?} heap of {} descriptors",
                    self.kind, self.descriptors_per_heap
                );
                self.heaps.push(heap);
                self.heaps.len() - 1
            }
        };

        let heap = &self.heaps[index];
        let Some(gpu_start) = heap.gpu_start else {
            return Err(DeviceError::Unsupported(format!(
                "{:?} heap {:?} is not shader visible",
                heap.kind, heap.id
            ))
            .into());
        };

        encoder.set_descriptor_heap(self.kind, heap.id);

        self.current = Some(index);
        self.cpu_cursor = heap.cpu_start;
        self.gpu_cursor = gpu_start;
        self.num_free_handles = heap.len;
        self.stale_mask = self.table_mask;
        Ok(())
    }

    fn advance(&mut self, count: u32) {
        self.cpu_cursor = self.cpu_cursor.offset(count, self.increment);
        self.gpu_cursor = self.gpu_cursor.offset(count, self.increment);
        self.num_free_handles -= count;
    }
}

fn set_bits(mut mask: u32) -> impl Iterator<Item = u32> {
    std::iter::from_fn(move || {
        if mask == 0 {
            None
        } else {
            let index = mask.trailing_zeros();
            mask &= mask - 1;
            Some(index)
        }
    })
}
