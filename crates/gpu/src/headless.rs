//! A software device.
//!
//! `HeadlessDevice` runs submitted work on a simulated GPU timeline instead
//! of hardware. Each queue processes its executions, signals and waits in
//! order; a wait holds back only the queue that issued it. While executing,
//! the device keeps the true state of every subresource and checks each
//! transition barrier against it, recording a validation error on mismatch
//! the way a debug layer would.
//!
//! The timeline can be paused, which leaves submitted work in flight until it
//! is resumed.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use allocators::checked_next_multiple_of;
use log::{error, trace};
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use slotmap::SlotMap;

use crate::{
    command::{Barrier, Command, CommandBuffer},
    device::{
        CpuDescriptor, DescriptorHeap, DescriptorHeapId, DescriptorHeapKind, Device, Fence,
        GpuAddress, GpuDescriptor, HardwareQueue, MappedMemory, QueueKind, ResourceDesc,
        ResourceId, RootSignatureId, ViewDesc,
    },
    error::DeviceError,
    resource_state::{ResourceStates, Subresource},
    root_signature::{RootSignatureDesc, MAX_ROOT_PARAMETERS},
};

pub const DESCRIPTOR_INCREMENT: u32 = 32;

const RESOURCE_ALIGNMENT: u64 = 64 * 1024;

/// What a descriptor slot holds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DescriptorContents {
    pub resource: Option<ResourceId>,
    pub view: ViewDesc,
}

pub struct HeadlessFence {
    value: Mutex<u64>,
    reached: Condvar,
}

impl HeadlessFence {
    fn new(value: u64) -> Self {
        Self {
            value: Mutex::new(value),
            reached: Condvar::new(),
        }
    }
}

impl Fence for HeadlessFence {
    fn completed_value(&self) -> u64 {
        *self.value.lock()
    }

    fn signal(&self, value: u64) {
        *self.value.lock() = value;
        self.reached.notify_all();
    }

    fn wait_for(&self, value: u64) {
        let mut current = self.value.lock();
        while *current < value {
            self.reached.wait(&mut current);
        }
    }
}

enum Operation {
    Execute(Vec<CommandBuffer>),
    Signal(Arc<dyn Fence>, u64),
    Wait(Arc<dyn Fence>, u64),
}

struct QueueTimeline {
    kind: QueueKind,
    operations: VecDeque<Operation>,
    executed: Vec<CommandBuffer>,
}

struct ResourceRecord {
    desc: ResourceDesc,
    address: GpuAddress,
    states: Vec<ResourceStates>,
}

#[derive(Default)]
struct Timeline {
    paused: bool,
    queues: Vec<QueueTimeline>,
    resources: SlotMap<ResourceId, ResourceRecord>,
    validation_errors: Vec<String>,
}

impl Timeline {
    /// Runs queued operations until every queue is empty or blocked on a
    /// wait.
    fn pump(&mut self) {
        if self.paused {
            return;
        }

        loop {
            let mut progressed = false;

            for index in 0..self.queues.len() {
                loop {
                    match self.queues[index].operations.front() {
                        None => break,
                        Some(Operation::Wait(fence, value)) if fence.completed_value() < *value => {
                            break
                        }
                        Some(_) => {}
                    }

                    let Some(operation) = self.queues[index].operations.pop_front() else {
                        break;
                    };

                    match operation {
                        Operation::Execute(buffers) => {
                            for buffer in buffers {
                                self.execute(index, buffer);
                            }
                        }
                        Operation::Signal(fence, value) => fence.signal(value),
                        Operation::Wait(..) => {}
                    }

                    progressed = true;
                }
            }

            if !progressed {
                break;
            }
        }
    }

    fn execute(&mut self, queue: usize, buffer: CommandBuffer) {
        let kind = self.queues[queue].kind;

        for command in buffer.commands() {
            let Command::Barriers(barriers) = command else {
                continue;
            };

            for barrier in barriers {
                if let Barrier::Transition {
                    resource,
                    subresource,
                    before,
                    after,
                } = *barrier
                {
                    self.transition(kind, resource, subresource, before, after);
                }
            }
        }

        self.queues[queue].executed.push(buffer);
    }

    fn transition(
        &mut self,
        kind: QueueKind,
        resource: ResourceId,
        subresource: Subresource,
        before: ResourceStates,
        after: ResourceStates,
    ) {
        let Some(record) = self.resources.get_mut(resource) else {
            self.validation_errors
                .push(format!("{kind} queue: barrier on destroyed resource {resource:?}"));
            return;
        };

        let range = match subresource {
            Subresource::All => 0..record.states.len(),
            Subresource::Index(index) => index as usize..index as usize + 1,
        };

        let mut errors = Vec::new();
        for index in range {
            match record.states.get_mut(index) {
                Some(state) => {
                    if *state != before {
                        errors.push(format!(
                            "{kind} queue: {resource:?} subresource {index} is {state:?}, \
                             but the barrier expects {before:?}"
                        ));
                    }
                    *state = after;
                }
                None => errors.push(format!(
                    "{kind} queue: {resource:?} has no subresource {index}"
                )),
            }
        }

        for message in &errors {
            error!("{message}");
        }
        self.validation_errors.extend(errors);
    }
}

struct HeadlessQueue {
    index: usize,
    timeline: Arc<Mutex<Timeline>>,
}

impl HardwareQueue for HeadlessQueue {
    fn execute(&self, command_buffers: &[&CommandBuffer]) -> Result<(), DeviceError> {
        let mut timeline = self.timeline.lock();

        for buffer in command_buffers {
            assert!(buffer.is_closed(), "submitted an open command list");
        }

        timeline.queues[self.index]
            .operations
            .push_back(Operation::Execute(
                command_buffers.iter().map(|&buffer| buffer.clone()).collect(),
            ));
        timeline.pump();
        Ok(())
    }

    fn signal(&self, fence: &Arc<dyn Fence>, value: u64) -> Result<(), DeviceError> {
        let mut timeline = self.timeline.lock();
        timeline.queues[self.index]
            .operations
            .push_back(Operation::Signal(fence.clone(), value));
        timeline.pump();
        Ok(())
    }

    fn wait(&self, fence: &Arc<dyn Fence>, value: u64) -> Result<(), DeviceError> {
        let mut timeline = self.timeline.lock();
        timeline.queues[self.index]
            .operations
            .push_back(Operation::Wait(fence.clone(), value));
        timeline.pump();
        Ok(())
    }
}

struct HeadlessMemory {
    bytes: Vec<u8>,
    address: GpuAddress,
}

impl MappedMemory for HeadlessMemory {
    fn gpu_address(&self) -> GpuAddress {
        self.address
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

#[derive(Default)]
pub struct HeadlessDevice {
    timeline: Arc<Mutex<Timeline>>,
    heaps: Mutex<Vec<DescriptorHeap>>,
    descriptors: Mutex<FxHashMap<CpuDescriptor, DescriptorContents>>,
    next_address: AtomicU64,
    next_root_signature: AtomicU64,
}

impl HeadlessDevice {
    pub fn new() -> Self {
        Self {
            next_address: AtomicU64::new(RESOURCE_ALIGNMENT),
            ..Default::default()
        }
    }

    /// Stops executing submitted work. Submissions queue up until
    /// [`HeadlessDevice::resume`] is called.
    pub fn pause(&self) {
        self.timeline.lock().paused = true;
    }

    pub fn resume(&self) {
        let mut timeline = self.timeline.lock();
        timeline.paused = false;
        timeline.pump();
    }

    /// Every command buffer executed so far by queues of `kind`, in
    /// execution order.
    pub fn executed(&self, kind: QueueKind) -> Vec<CommandBuffer> {
        self.timeline
            .lock()
            .queues
            .iter()
            .filter(|queue| queue.kind == kind)
            .flat_map(|queue| queue.executed.iter().cloned())
            .collect()
    }

    /// Barriers that did not match the actual state of their resource.
    pub fn validation_errors(&self) -> Vec<String> {
        self.timeline.lock().validation_errors.clone()
    }

    /// The state a subresource is in after all work executed so far.
    pub fn resource_state(&self, resource: ResourceId, index: u32) -> Option<ResourceStates> {
        self.timeline
            .lock()
            .resources
            .get(resource)
            .and_then(|record| record.states.get(index as usize).copied())
    }

    pub fn descriptor(&self, descriptor: CpuDescriptor) -> Option<DescriptorContents> {
        self.descriptors.lock().get(&descriptor).cloned()
    }

    /// Looks up a descriptor in a shader-visible heap by its GPU address.
    pub fn shader_visible_descriptor(&self, descriptor: GpuDescriptor) -> Option<DescriptorContents> {
        let cpu = self.heaps.lock().iter().find_map(|heap| {
            let start = heap.gpu_start?.0;
            let end = start + u64::from(heap.len) * u64::from(heap.increment);
            (start..end)
                .contains(&descriptor.0)
                .then(|| CpuDescriptor(heap.cpu_start.0 + (descriptor.0 - start)))
        })?;

        self.descriptor(cpu)
    }

    fn allocate_address(&self, size: u64) -> Result<GpuAddress, DeviceError> {
        let size = checked_next_multiple_of(size.max(1), RESOURCE_ALIGNMENT)
            .ok_or(DeviceError::OutOfMemory)?;
        Ok(GpuAddress(self.next_address.fetch_add(size, Ordering::Relaxed)))
    }
}

impl Device for HeadlessDevice {
    fn create_queue(&self, kind: QueueKind) -> Result<Box<dyn HardwareQueue>, DeviceError> {
        let mut timeline = self.timeline.lock();
        timeline.queues.push(QueueTimeline {
            kind,
            operations: VecDeque::new(),
            executed: Vec::new(),
        });

        Ok(Box::new(HeadlessQueue {
            index: timeline.queues.len() - 1,
            timeline: self.timeline.clone(),
        }))
    }

    fn create_fence(&self, initial_value: u64) -> Result<Arc<dyn Fence>, DeviceError> {
        Ok(Arc::new(HeadlessFence::new(initial_value)))
    }

    fn create_descriptor_heap(
        &self,
        kind: DescriptorHeapKind,
        len: u32,
        shader_visible: bool,
    ) -> Result<DescriptorHeap, DeviceError> {
        if shader_visible && !kind.can_be_shader_visible() {
            return Err(DeviceError::Unsupported(format!(
                "{kind:?} heaps cannot be shader visible"
            )));
        }

        let mut heaps = self.heaps.lock();
        let number = heaps.len() as u64 + 1;

        let heap = DescriptorHeap {
            id: DescriptorHeapId(number),
            kind,
            len,
            cpu_start: CpuDescriptor(number << 32),
            gpu_start: shader_visible.then_some(GpuDescriptor((1 << 48) | (number << 32))),
            increment: DESCRIPTOR_INCREMENT,
        };

        heaps.push(heap.clone());
        Ok(heap)
    }

    fn descriptor_increment(&self, _kind: DescriptorHeapKind) -> u32 {
        DESCRIPTOR_INCREMENT
    }

    fn copy_descriptors(&self, _kind: DescriptorHeapKind, dst: CpuDescriptor, src: &[CpuDescriptor]) {
        let mut descriptors = self.descriptors.lock();

        for (index, source) in src.iter().enumerate() {
            let target = dst.offset(index as u32, DESCRIPTOR_INCREMENT);
            match descriptors.get(source).cloned() {
                Some(contents) => descriptors.insert(target, contents),
                None => descriptors.remove(&target),
            };
        }
    }

    fn create_view(&self, resource: Option<ResourceId>, view: &ViewDesc, dst: CpuDescriptor) {
        self.descriptors.lock().insert(
            dst,
            DescriptorContents {
                resource,
                view: view.clone(),
            },
        );
    }

    fn create_resource(
        &self,
        desc: &ResourceDesc,
        initial_state: ResourceStates,
    ) -> Result<ResourceId, DeviceError> {
        let size = desc
            .width
            .checked_mul(u64::from(desc.height))
            .ok_or(DeviceError::OutOfMemory)?;
        let address = self.allocate_address(size)?;
        let states = vec![initial_state; desc.subresource_count() as usize];

        let resource = self.timeline.lock().resources.insert(ResourceRecord {
            desc: desc.clone(),
            address,
            states,
        });

        trace!("created resource {resource:?} at {address:?}");
        Ok(resource)
    }

    fn destroy_resource(&self, resource: ResourceId) {
        self.timeline.lock().resources.remove(resource);
    }

    fn resource_desc(&self, resource: ResourceId) -> Option<ResourceDesc> {
        self.timeline
            .lock()
            .resources
            .get(resource)
            .map(|record| record.desc.clone())
    }

    fn gpu_address(&self, resource: ResourceId) -> GpuAddress {
        self.timeline
            .lock()
            .resources
            .get(resource)
            .map_or(GpuAddress::default(), |record| record.address)
    }

    fn create_upload_buffer(&self, size: u64) -> Result<Box<dyn MappedMemory>, DeviceError> {
        let len = usize::try_from(size).map_err(|_| DeviceError::OutOfMemory)?;

        Ok(Box::new(HeadlessMemory {
            bytes: vec![0; len],
            address: self.allocate_address(size)?,
        }))
    }

    fn create_root_signature(
        &self,
        desc: &RootSignatureDesc,
    ) -> Result<RootSignatureId, DeviceError> {
        if desc.parameters.len() > MAX_ROOT_PARAMETERS {
            return Err(DeviceError::Unsupported(format!(
                "{} root parameters",
                desc.parameters.len()
            )));
        }

        Ok(RootSignatureId(
            self.next_root_signature.fetch_add(1, Ordering::Relaxed) + 1,
        ))
    }
}
