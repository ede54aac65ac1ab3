//! The recorded command stream.
//!
//! Command lists record into a [`CommandBuffer`], a plain list of [`Command`]s
//! that the device translates into its native form when the buffer is
//! submitted.

use smallvec::SmallVec;

use crate::device::{
    CpuDescriptor, DescriptorHeapId, DescriptorHeapKind, Format, GpuAddress, GpuDescriptor,
    PipelineStateId, ResourceId, RootSignatureId,
};
use crate::resource_state::{ResourceStates, Subresource};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Barrier {
    Transition {
        resource: ResourceId,
        subresource: Subresource,
        before: ResourceStates,
        after: ResourceStates,
    },
    /// Orders unordered-access reads and writes. `None` applies to every
    /// resource.
    Uav { resource: Option<ResourceId> },
    /// Switches which of two resources sharing memory is active.
    Aliasing {
        before: Option<ResourceId>,
        after: Option<ResourceId>,
    },
}

impl Barrier {
    pub fn transition(
        resource: ResourceId,
        subresource: Subresource,
        before: ResourceStates,
        after: ResourceStates,
    ) -> Self {
        debug_assert_ne!(before, after);
        Self::Transition {
            resource,
            subresource,
            before,
            after,
        }
    }
}

pub type Barriers = SmallVec<[Barrier; 8]>;

/// Which pipeline a root argument applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BindPoint {
    Graphics,
    Compute,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    TriangleList,
    TriangleStrip,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn new(width: f32, height: f32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width,
            height,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexBufferView {
    pub address: GpuAddress,
    pub size: u32,
    pub stride: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IndexBufferView {
    pub address: GpuAddress,
    pub size: u32,
    pub format: Format,
}

bitflags::bitflags! {
    pub struct ClearFlags: u8 {
        const DEPTH = 0x1;
        const STENCIL = 0x2;
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Barriers(Barriers),
    CopyResource {
        dst: ResourceId,
        src: ResourceId,
    },
    CopyBufferRegion {
        dst: ResourceId,
        dst_offset: u64,
        src: GpuAddress,
        size: u64,
    },
    /// Copies rows laid out `row_pitch` bytes apart in upload memory into
    /// one subresource of a texture.
    CopyBufferToTexture {
        dst: ResourceId,
        dst_subresource: u32,
        src: GpuAddress,
        row_pitch: u32,
        rows: u32,
    },
    ResolveSubresource {
        dst: ResourceId,
        dst_subresource: u32,
        src: ResourceId,
        src_subresource: u32,
        format: Format,
    },
    SetDescriptorHeaps(SmallVec<[DescriptorHeapId; 2]>),
    SetGraphicsRootSignature(RootSignatureId),
    SetComputeRootSignature(RootSignatureId),
    SetPipelineState(PipelineStateId),
    SetPrimitiveTopology(PrimitiveTopology),
    SetViewports(SmallVec<[Viewport; 1]>),
    SetScissorRects(SmallVec<[Rect; 1]>),
    SetVertexBuffers {
        start_slot: u32,
        views: SmallVec<[VertexBufferView; 1]>,
    },
    SetIndexBuffer(IndexBufferView),
    SetRenderTargets {
        render_targets: SmallVec<[CpuDescriptor; 8]>,
        depth_stencil: Option<CpuDescriptor>,
    },
    ClearRenderTarget {
        view: CpuDescriptor,
        color: [f32; 4],
    },
    ClearDepthStencil {
        view: CpuDescriptor,
        flags: ClearFlags,
        depth: f32,
        stencil: u8,
    },
    SetRootDescriptorTable {
        bind_point: BindPoint,
        root_index: u32,
        base: GpuDescriptor,
    },
    SetRootConstantBufferView {
        bind_point: BindPoint,
        root_index: u32,
        address: GpuAddress,
    },
    SetRootShaderResourceView {
        bind_point: BindPoint,
        root_index: u32,
        address: GpuAddress,
    },
    SetRoot32BitConstants {
        bind_point: BindPoint,
        root_index: u32,
        constants: SmallVec<[u32; 16]>,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommandBuffer {
    commands: Vec<Command>,
    closed: bool,
}

impl CommandBuffer {
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// ## Panics
    ///
    /// Panics if the buffer has been closed.
    pub fn push(&mut self, command: Command) {
        assert!(!self.closed, "recording into a closed command list");
        self.commands.push(command);
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn clear(&mut self) {
        self.commands.clear();
        self.closed = false;
    }
}

/// A command buffer plus the pipeline bindings that commands depend on.
#[derive(Debug, Default)]
pub struct Encoder {
    buffer: CommandBuffer,
    descriptor_heaps: [Option<DescriptorHeapId>; DescriptorHeapKind::COUNT],
}

impl Encoder {
    pub fn buffer(&self) -> &CommandBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut CommandBuffer {
        &mut self.buffer
    }

    pub fn push(&mut self, command: Command) {
        self.buffer.push(command);
    }

    pub fn close(&mut self) {
        self.buffer.close();
    }

    pub fn is_closed(&self) -> bool {
        self.buffer.is_closed()
    }

    pub fn descriptor_heap(&self, kind: DescriptorHeapKind) -> Option<DescriptorHeapId> {
        self.descriptor_heaps[kind.index()]
    }

    /// Binds `heap` as the shader-visible heap for `kind`, rebinding the
    /// full set of heaps only if it changed.
    pub fn set_descriptor_heap(&mut self, kind: DescriptorHeapKind, heap: DescriptorHeapId) {
        assert!(kind.can_be_shader_visible(), "{kind:?} heaps cannot be bound");

        if self.descriptor_heaps[kind.index()] != Some(heap) {
            self.descriptor_heaps[kind.index()] = Some(heap);
            let heaps = self.descriptor_heaps.iter().flatten().copied().collect();
            self.buffer.push(Command::SetDescriptorHeaps(heaps));
        }
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.descriptor_heaps = Default::default();
    }
}
