//! The interface between the submission core and a GPU driver.
//!
//! The core never talks to a graphics API directly. Everything it needs from
//! the hardware, whether creating queues, fences and descriptor heaps,
//! writing views, or submitting recorded commands, goes through the traits in
//! this module. [`crate::headless::HeadlessDevice`] implements them in
//! software.

use std::{fmt, sync::Arc};

use crate::{
    command::CommandBuffer,
    error::DeviceError,
    resource_state::ResourceStates,
    root_signature::RootSignatureDesc,
};

slotmap::new_key_type! {
    /// A GPU resource created by a [`Device`].
    pub struct ResourceId;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Graphics, compute and copy work.
    Direct,
    Compute,
    Copy,
}

impl QueueKind {
    pub const ALL: [Self; 3] = [Self::Direct, Self::Compute, Self::Copy];
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Compute => write!(f, "compute"),
            Self::Copy => write!(f, "copy"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorHeapKind {
    CbvSrvUav,
    Sampler,
    RenderTarget,
    DepthStencil,
}

impl DescriptorHeapKind {
    pub const COUNT: usize = 4;

    pub const ALL: [Self; Self::COUNT] = [
        Self::CbvSrvUav,
        Self::Sampler,
        Self::RenderTarget,
        Self::DepthStencil,
    ];

    /// The kinds that may be bound to the pipeline as shader-visible heaps.
    pub const SHADER_VISIBLE: [Self; 2] = [Self::CbvSrvUav, Self::Sampler];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn can_be_shader_visible(self) -> bool {
        matches!(self, Self::CbvSrvUav | Self::Sampler)
    }
}

/// The CPU address of a descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuDescriptor(pub u64);

impl CpuDescriptor {
    #[must_use]
    pub fn offset(self, index: u32, increment: u32) -> Self {
        Self(self.0 + u64::from(index) * u64::from(increment))
    }
}

/// The GPU address of a descriptor in a shader-visible heap.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GpuDescriptor(pub u64);

impl GpuDescriptor {
    #[must_use]
    pub fn offset(self, index: u32, increment: u32) -> Self {
        Self(self.0 + u64::from(index) * u64::from(increment))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GpuAddress(pub u64);

impl GpuAddress {
    #[must_use]
    pub fn offset(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorHeapId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RootSignatureId(pub u64);

/// A compiled pipeline. Pipelines are built by the render passes that use
/// them; the core only records which one is bound.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PipelineStateId(pub u64);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DescriptorHeap {
    pub id: DescriptorHeapId,
    pub kind: DescriptorHeapKind,
    pub len: u32,
    pub cpu_start: CpuDescriptor,
    /// Only shader-visible heaps have a GPU address.
    pub gpu_start: Option<GpuDescriptor>,
    pub increment: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Format {
    Unknown,
    R8G8B8A8Unorm,
    R16G16B16A16Float,
    R32G32B32A32Float,
    R16Uint,
    R32Uint,
    D32Float,
    D24UnormS8Uint,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceDimension {
    Buffer,
    Texture2D,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HeapType {
    /// GPU-local memory.
    Default,
    /// CPU-writable memory that the GPU can read.
    Upload,
}

bitflags::bitflags! {
    #[derive(Default)]
    pub struct ResourceFlags: u32 {
        const ALLOW_RENDER_TARGET = 0x1;
        const ALLOW_DEPTH_STENCIL = 0x2;
        const ALLOW_UNORDERED_ACCESS = 0x4;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceDesc {
    pub dimension: ResourceDimension,
    pub width: u64,
    pub height: u32,
    pub array_size: u16,
    pub mip_levels: u16,
    pub format: Format,
    pub flags: ResourceFlags,
    pub heap: HeapType,
}

impl ResourceDesc {
    pub fn buffer(size: u64, flags: ResourceFlags) -> Self {
        Self {
            dimension: ResourceDimension::Buffer,
            width: size,
            height: 1,
            array_size: 1,
            mip_levels: 1,
            format: Format::Unknown,
            flags,
            heap: HeapType::Default,
        }
    }

    pub fn texture_2d(width: u32, height: u32, format: Format, mip_levels: u16) -> Self {
        Self {
            dimension: ResourceDimension::Texture2D,
            width: width.into(),
            height,
            array_size: 1,
            mip_levels,
            format,
            flags: ResourceFlags::empty(),
            heap: HeapType::Default,
        }
    }

    #[must_use]
    pub fn with_array_size(mut self, array_size: u16) -> Self {
        self.array_size = array_size;
        self
    }

    #[must_use]
    pub fn with_flags(mut self, flags: ResourceFlags) -> Self {
        self.flags = flags;
        self
    }

    /// The number of independently tracked subresources: one per mip level
    /// per array slice. Buffers have exactly one.
    pub fn subresource_count(&self) -> u32 {
        match self.dimension {
            ResourceDimension::Buffer => 1,
            ResourceDimension::Texture2D => {
                u32::from(self.mip_levels.max(1)) * u32::from(self.array_size.max(1))
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Filter {
    Point,
    Linear,
    Anisotropic,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddressMode {
    Wrap,
    Mirror,
    Clamp,
    Border,
}

/// Describes how a view interprets its resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ViewDesc {
    ConstantBuffer { address: GpuAddress, size: u32 },
    ShaderResource { format: Format },
    UnorderedAccess { format: Format, mip_slice: u32 },
    RenderTarget { format: Format, mip_slice: u32 },
    DepthStencil { format: Format },
    Sampler { filter: Filter, address_mode: AddressMode },
}

/// A GPU synchronization counter.
pub trait Fence: Send + Sync {
    /// The last value the fence is known to have reached.
    fn completed_value(&self) -> u64;

    /// Sets the fence value from the CPU.
    fn signal(&self, value: u64);

    /// Blocks the calling thread until the fence reaches `value`.
    fn wait_for(&self, value: u64);
}

/// A hardware execution queue. Operations execute in submission order.
pub trait HardwareQueue: Send + Sync {
    fn execute(&self, command_buffers: &[&CommandBuffer]) -> Result<(), DeviceError>;

    /// Sets `fence` to `value` once all previously submitted work completes.
    fn signal(&self, fence: &Arc<dyn Fence>, value: u64) -> Result<(), DeviceError>;

    /// Holds back work submitted after this call until `fence` reaches
    /// `value`. Does not block the calling thread.
    fn wait(&self, fence: &Arc<dyn Fence>, value: u64) -> Result<(), DeviceError>;
}

/// CPU-writable memory that the GPU reads from.
pub trait MappedMemory: Send {
    fn gpu_address(&self) -> GpuAddress;

    fn bytes_mut(&mut self) -> &mut [u8];
}

pub trait Device: Send + Sync {
    fn create_queue(&self, kind: QueueKind) -> Result<Box<dyn HardwareQueue>, DeviceError>;

    fn create_fence(&self, initial_value: u64) -> Result<Arc<dyn Fence>, DeviceError>;

    fn create_descriptor_heap(
        &self,
        kind: DescriptorHeapKind,
        len: u32,
        shader_visible: bool,
    ) -> Result<DescriptorHeap, DeviceError>;

    /// The distance in bytes between adjacent descriptors of `kind`.
    fn descriptor_increment(&self, kind: DescriptorHeapKind) -> u32;

    /// Copies each descriptor in `src` into consecutive slots starting at
    /// `dst`.
    fn copy_descriptors(&self, kind: DescriptorHeapKind, dst: CpuDescriptor, src: &[CpuDescriptor]);

    /// Writes a view of `resource` into the descriptor at `dst`. Samplers
    /// have no resource.
    fn create_view(&self, resource: Option<ResourceId>, view: &ViewDesc, dst: CpuDescriptor);

    fn create_resource(
        &self,
        desc: &ResourceDesc,
        initial_state: ResourceStates,
    ) -> Result<ResourceId, DeviceError>;

    fn destroy_resource(&self, resource: ResourceId);

    fn resource_desc(&self, resource: ResourceId) -> Option<ResourceDesc>;

    fn gpu_address(&self, resource: ResourceId) -> GpuAddress;

    fn create_upload_buffer(&self, size: u64) -> Result<Box<dyn MappedMemory>, DeviceError>;

    fn create_root_signature(&self, desc: &RootSignatureDesc)
        -> Result<RootSignatureId, DeviceError>;
}
