use std::{collections::VecDeque, sync::Arc};

use allocators::{checked_next_multiple_of, LinearAllocator};
use log::debug;

use crate::{
    device::{Device, GpuAddress, MappedMemory},
    error::Error,
};

/// Bytes written by the CPU for the GPU to read. Valid until the allocator
/// is reset.
pub struct UploadAllocation<'a> {
    pub cpu: &'a mut [u8],
    pub gpu: GpuAddress,
    /// The index of the block the allocation came from.
    pub block: usize,
    /// The offset of the allocation within its block.
    pub offset: u64,
}

struct UploadBlock {
    memory: Box<dyn MappedMemory>,
    allocator: LinearAllocator,
}

/// Linear allocator for per-draw data (constants, dynamic vertex and index
/// buffers) over a pool of fixed-size upload blocks.
///
/// Blocks are only reused after [`UploadAllocator::reset`], which the owner
/// must not call while the GPU may still read from them.
pub struct UploadAllocator {
    device: Arc<dyn Device>,
    block_size: u64,
    blocks: Vec<UploadBlock>,
    available: VecDeque<usize>,
    current: Option<usize>,
}

impl UploadAllocator {
    pub fn new(device: Arc<dyn Device>, block_size: u64) -> Self {
        assert!(block_size > 0);

        Self {
            device,
            block_size,
            blocks: Vec::new(),
            available: VecDeque::new(),
            current: None,
        }
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// ## Panics
    ///
    /// Panics if `align` is not a power of two.
    ///
    /// ## Errors
    ///
    /// Fails if `size`, rounded up to `align`, is larger than a block, or if a
    /// new block is needed and the device cannot create one.
    pub fn allocate(&mut self, size: u64, align: u64) -> Result<UploadAllocation<'_>, Error> {
        assert!(align.is_power_of_two(), "alignment must be a power of two");

        if checked_next_multiple_of(size, align).map_or(true, |size| size > self.block_size) {
            return Err(Error::UploadTooLarge {
                requested: size,
                block_size: self.block_size,
            });
        }

        let index = match self.current {
            Some(index) if self.blocks[index].allocator.can_fit(size, align) => index,
            _ => {
                let index = self.next_block()?;
                self.current = Some(index);
                index
            }
        };

        let block = &mut self.blocks[index];
        let offset = block.allocator.allocate(size, align)?;
        let gpu = block.memory.gpu_address().offset(offset);
        let cpu = &mut block.memory.bytes_mut()[offset as usize..(offset + size) as usize];

        Ok(UploadAllocation {
            cpu,
            gpu,
            block: index,
            offset,
        })
    }

    /// Copies `data` into upload memory and returns its GPU address.
    pub fn upload<T: bytemuck::Pod>(&mut self, data: &[T], align: u64) -> Result<GpuAddress, Error> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let allocation = self.allocate(bytes.len() as u64, align)?;
        allocation.cpu.copy_from_slice(bytes);
        Ok(allocation.gpu)
    }

    pub fn reset(&mut self) {
        self.current = None;
        self.available.clear();

        for (index, block) in self.blocks.iter_mut().enumerate() {
            block.allocator.clear();
            self.available.push_back(index);
        }
    }

    fn next_block(&mut self) -> Result<usize, Error> {
        if let Some(index) = self.available.pop_front() {
            return Ok(index);
        }

        let memory = self.device.create_upload_buffer(self.block_size)?;
        debug!("created upload block of {} bytes", self.block_size);

        self.blocks.push(UploadBlock {
            memory,
            allocator: LinearAllocator::new(self.block_size),
        });

        Ok(self.blocks.len() - 1)
    }
}
