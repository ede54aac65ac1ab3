use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    descriptor_allocator::{DescriptorAllocation, DescriptorAllocator},
    device::{DescriptorHeapKind, Device, QueueKind, ResourceDesc, ResourceId},
    error::Error,
    queue::CommandQueue,
    resource_state::{GlobalResourceStates, ResourceStates},
    Config,
};

#[derive(Clone, Copy, Debug)]
struct FrameFence {
    frame: u64,
    queue: QueueKind,
    fence_value: u64,
}

struct Frames {
    number: u64,
    /// The fence of each frame still in flight, indexed by frame number
    /// modulo the number of frames in flight.
    fences: Vec<Option<FrameFence>>,
}

/// Process-wide GPU state: the global resource state map, the persistent
/// descriptor allocators and one queue of each kind.
pub struct Context {
    device: Arc<dyn Device>,
    states: Arc<GlobalResourceStates>,
    descriptor_allocators: [DescriptorAllocator; DescriptorHeapKind::COUNT],
    queues: [CommandQueue; 3],
    frames: Mutex<Frames>,
}

impl Context {
    /// ## Panics
    ///
    /// Panics if `config.frames_in_flight` is zero.
    pub fn new(device: Arc<dyn Device>, config: Config) -> Result<Self, Error> {
        assert!(config.frames_in_flight > 0, "at least one frame must be in flight");

        let states = Arc::new(GlobalResourceStates::new());

        let descriptor_allocators = DescriptorHeapKind::ALL.map(|kind| {
            DescriptorAllocator::new(device.clone(), kind, config.descriptors_per_heap)
        });

        let [direct, compute, copy] = QueueKind::ALL
            .map(|kind| CommandQueue::new(kind, device.clone(), states.clone(), &config));

        Ok(Self {
            queues: [direct?, compute?, copy?],
            device,
            states,
            descriptor_allocators,
            frames: Mutex::new(Frames {
                number: 0,
                fences: vec![None; config.frames_in_flight],
            }),
        })
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn queue(&self, kind: QueueKind) -> &CommandQueue {
        match kind {
            QueueKind::Direct => &self.queues[0],
            QueueKind::Compute => &self.queues[1],
            QueueKind::Copy => &self.queues[2],
        }
    }

    pub fn resource_states(&self) -> &Arc<GlobalResourceStates> {
        &self.states
    }

    /// Creates a resource and starts tracking its state.
    pub fn create_resource(
        &self,
        desc: &ResourceDesc,
        initial_state: ResourceStates,
    ) -> Result<ResourceId, Error> {
        let resource = self.device.create_resource(desc, initial_state)?;
        self.register_resource(resource, desc, initial_state);
        Ok(resource)
    }

    /// Starts tracking a resource created outside of the context, such as a
    /// swapchain buffer.
    pub fn register_resource(&self, resource: ResourceId, desc: &ResourceDesc, state: ResourceStates) {
        self.states
            .register(resource, state, desc.subresource_count());
    }

    /// Stops tracking `resource` and destroys it. The caller must ensure
    /// the GPU is no longer using it.
    pub fn destroy_resource(&self, resource: ResourceId) {
        self.states.unregister(resource);
        self.device.destroy_resource(resource);
    }

    pub fn allocate_descriptors(
        &self,
        kind: DescriptorHeapKind,
        count: u32,
    ) -> Result<DescriptorAllocation, Error> {
        self.descriptor_allocator(kind).allocate(count)
    }

    /// Frees `allocation` once the current frame has completed on the GPU.
    /// Dropping the allocation does the same.
    pub fn free_descriptors(&self, allocation: DescriptorAllocation) {
        let frame = self.frame_number();
        self.descriptor_allocator(allocation.kind())
            .free(allocation, frame);
    }

    pub fn release_stale_descriptors(&self, completed_frame: u64) {
        for allocator in &self.descriptor_allocators {
            allocator.release_stale_descriptors(completed_frame);
        }
    }

    pub fn descriptor_allocator(&self, kind: DescriptorHeapKind) -> &DescriptorAllocator {
        &self.descriptor_allocators[kind.index()]
    }

    pub fn frame_number(&self) -> u64 {
        self.frames.lock().number
    }

    /// Ends the current frame, whose work completes when `queue` reaches
    /// `fence_value`.
    ///
    /// If the CPU is a full ring of frames ahead of the GPU, this blocks
    /// until the oldest frame completes. Descriptors freed during that frame
    /// are then released. The frame number advances before blocking.
    pub fn end_frame(&self, queue: QueueKind, fence_value: u64) {
        let oldest = {
            let mut frames = self.frames.lock();
            let len = frames.fences.len() as u64;

            let frame = frames.number;
            frames.fences[(frame % len) as usize] = Some(FrameFence {
                frame,
                queue,
                fence_value,
            });
            frames.number += 1;

            for allocator in &self.descriptor_allocators {
                allocator.set_current_frame(frames.number);
            }

            let next = (frames.number % len) as usize;
            frames.fences[next].take()
        };

        if let Some(oldest) = oldest {
            self.queue(oldest.queue)
                .wait_for_fence_value(oldest.fence_value);
            self.release_stale_descriptors(oldest.frame);
        }
    }

    /// Blocks until all three queues are idle.
    pub fn flush(&self) {
        for queue in &self.queues {
            queue.flush();
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.flush();
    }
}
