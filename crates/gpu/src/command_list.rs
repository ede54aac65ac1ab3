//! Command recording.
//!
//! A [`CommandList`] records commands for one queue. It owns everything that
//! recording needs and that must live until the GPU has executed the list:
//! upload memory for per-draw data, shader-visible descriptor heaps and the
//! list's view of resource states. All of it is reset together when the
//! queue recycles the list.

use std::{mem::size_of, ops::Range, sync::Arc};

use allocators::checked_next_multiple_of;
use bytemuck::Pod;
use smallvec::{smallvec, SmallVec};

use crate::{
    command::{
        BindPoint, ClearFlags, Command, CommandBuffer, Encoder, IndexBufferView,
        PrimitiveTopology, Rect, VertexBufferView, Viewport,
    },
    device::{
        CpuDescriptor, DescriptorHeapId, DescriptorHeapKind, Device, Format, GpuDescriptor,
        MappedMemory, PipelineStateId, QueueKind, ResourceDesc, ResourceFlags, ResourceId,
        RootSignatureId,
    },
    dynamic_descriptor_heap::DynamicDescriptorHeap,
    error::{DeviceError, Error},
    resource_state::{
        GlobalResourceStates, ResourceStateMap, ResourceStateTracker, ResourceStates, Subresource,
    },
    root_signature::RootSignature,
    upload::UploadAllocator,
    Config,
};

pub const MAX_RENDER_TARGETS: usize = 8;

pub const MAX_VIEWPORTS: usize = 16;

const CONSTANT_BUFFER_ALIGNMENT: u64 = 256;

const STRUCTURED_BUFFER_ALIGNMENT: u64 = 16;

/// Row pitch alignment of texture data in upload memory.
pub const TEXTURE_DATA_PITCH_ALIGNMENT: u64 = 256;

/// Alignment of each subresource's data in upload memory.
pub const TEXTURE_DATA_PLACEMENT_ALIGNMENT: u64 = 512;

/// The CPU-side contents of one texture subresource.
#[derive(Clone, Copy, Debug)]
pub struct SubresourceData<'a> {
    pub data: &'a [u8],
    /// The distance in bytes between the starts of consecutive rows in
    /// `data`.
    pub row_pitch: u32,
}

/// Where one subresource's rows land in upload memory.
struct Footprint {
    offset: u64,
    row_pitch: u32,
    rows: u32,
}

/// A GPU buffer of vertices and the view used to bind it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexBuffer {
    pub resource: ResourceId,
    pub view: VertexBufferView,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexBuffer {
    pub resource: ResourceId,
    pub view: IndexBufferView,
}

/// A view of (part of) a texture that can be rendered to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Attachment {
    pub resource: ResourceId,
    pub view: CpuDescriptor,
    pub subresource: Subresource,
}

impl Attachment {
    pub fn new(resource: ResourceId, view: CpuDescriptor) -> Self {
        Self {
            resource,
            view,
            subresource: Subresource::All,
        }
    }

    #[must_use]
    pub fn with_subresource(mut self, index: u32) -> Self {
        self.subresource = Subresource::Index(index);
        self
    }
}

/// A set of color attachments and an optional depth-stencil attachment.
#[derive(Clone, Debug, Default)]
pub struct RenderTarget {
    colors: [Option<Attachment>; MAX_RENDER_TARGETS],
    depth_stencil: Option<Attachment>,
}

impl RenderTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// ## Panics
    ///
    /// Panics if `slot` is not less than [`MAX_RENDER_TARGETS`].
    pub fn attach(&mut self, slot: usize, attachment: Attachment) {
        assert!(
            slot < MAX_RENDER_TARGETS,
            "render target slot {slot} out of range, there are only {MAX_RENDER_TARGETS}"
        );
        self.colors[slot] = Some(attachment);
    }

    pub fn attach_depth_stencil(&mut self, attachment: Attachment) {
        self.depth_stencil = Some(attachment);
    }

    pub fn detach(&mut self, slot: usize) -> Option<Attachment> {
        self.colors.get_mut(slot).and_then(Option::take)
    }

    pub fn color(&self, slot: usize) -> Option<&Attachment> {
        self.colors.get(slot).and_then(Option::as_ref)
    }

    pub fn depth_stencil(&self) -> Option<&Attachment> {
        self.depth_stencil.as_ref()
    }
}

pub struct CommandList {
    id: u64,
    kind: QueueKind,
    device: Arc<dyn Device>,
    states: Arc<GlobalResourceStates>,

    encoder: Encoder,
    tracker: ResourceStateTracker,
    uploads: UploadAllocator,
    /// Indexed by [`DescriptorHeapKind::index`].
    dynamic_heaps: [DynamicDescriptorHeap; 2],

    graphics_root_signature: Option<RootSignatureId>,
    compute_root_signature: Option<RootSignatureId>,

    /// Upload memory too large for the upload allocator, kept alive until
    /// the list is reset.
    upload_buffers: Vec<Box<dyn MappedMemory>>,
}

impl CommandList {
    pub(crate) fn new(
        id: u64,
        kind: QueueKind,
        device: Arc<dyn Device>,
        states: Arc<GlobalResourceStates>,
        config: &Config,
    ) -> Self {
        let dynamic_heaps = DescriptorHeapKind::SHADER_VISIBLE.map(|kind| {
            DynamicDescriptorHeap::new(
                device.clone(),
                kind,
                config.shader_visible_descriptors_per_heap,
            )
        });

        Self {
            id,
            kind,
            uploads: UploadAllocator::new(device.clone(), config.upload_block_size),
            device,
            states,
            encoder: Encoder::default(),
            tracker: ResourceStateTracker::new(),
            dynamic_heaps,
            graphics_root_signature: None,
            compute_root_signature: None,
            upload_buffers: Vec::new(),
        }
    }

    /// Identifies the list within its queue. Recycled lists keep their id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub fn command_buffer(&self) -> &CommandBuffer {
        self.encoder.buffer()
    }

    pub fn commands(&self) -> &[Command] {
        self.encoder.buffer().commands()
    }

    pub fn is_closed(&self) -> bool {
        self.encoder.is_closed()
    }

    pub fn upload_allocator(&mut self) -> &mut UploadAllocator {
        &mut self.uploads
    }

    pub fn resource_state_tracker(&self) -> &ResourceStateTracker {
        &self.tracker
    }

    // Barriers

    /// Transitions `subresource` of `resource` to `after`. Barriers are
    /// batched until the next draw, dispatch or copy unless `flush` is set.
    pub fn transition_barrier(
        &mut self,
        resource: ResourceId,
        after: ResourceStates,
        subresource: Subresource,
        flush: bool,
    ) {
        self.tracker.transition(resource, subresource, after);

        if flush {
            self.flush_resource_barriers();
        }
    }

    pub fn uav_barrier(&mut self, resource: Option<ResourceId>, flush: bool) {
        self.tracker.uav_barrier(resource);

        if flush {
            self.flush_resource_barriers();
        }
    }

    pub fn aliasing_barrier(
        &mut self,
        before: Option<ResourceId>,
        after: Option<ResourceId>,
        flush: bool,
    ) {
        self.tracker.aliasing_barrier(before, after);

        if flush {
            self.flush_resource_barriers();
        }
    }

    pub fn flush_resource_barriers(&mut self) {
        self.tracker.flush_resource_barriers(self.encoder.buffer_mut());
    }

    // Copies

    pub fn copy_resource(&mut self, dst: ResourceId, src: ResourceId) {
        self.tracker
            .transition(dst, Subresource::All, ResourceStates::COPY_DEST);
        self.tracker
            .transition(src, Subresource::All, ResourceStates::COPY_SOURCE);
        self.flush_resource_barriers();

        self.encoder.push(Command::CopyResource { dst, src });
    }

    /// Resolves a multisampled subresource of `src` into `dst`.
    pub fn resolve_subresource(
        &mut self,
        dst: ResourceId,
        src: ResourceId,
        dst_subresource: u32,
        src_subresource: u32,
    ) {
        self.tracker.transition(
            dst,
            Subresource::Index(dst_subresource),
            ResourceStates::RESOLVE_DEST,
        );
        self.tracker.transition(
            src,
            Subresource::Index(src_subresource),
            ResourceStates::RESOLVE_SOURCE,
        );
        self.flush_resource_barriers();

        let format = self
            .device
            .resource_desc(dst)
            .map_or(Format::Unknown, |desc| desc.format);

        self.encoder.push(Command::ResolveSubresource {
            dst,
            dst_subresource,
            src,
            src_subresource,
            format,
        });
    }

    /// Creates a GPU buffer holding a copy of `data`.
    ///
    /// The buffer is registered in the global state map and left in the
    /// `COPY_DEST` state. It belongs to the caller, who destroys it once no
    /// list uses it anymore.
    pub fn copy_buffer<T: Pod>(
        &mut self,
        data: &[T],
        flags: ResourceFlags,
    ) -> Result<ResourceId, Error> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let size = bytes.len() as u64;

        let resource = self.device.create_resource(
            &ResourceDesc::buffer(size, flags),
            ResourceStates::COMMON,
        )?;
        self.states.register(resource, ResourceStates::COMMON, 1);

        if size == 0 {
            return Ok(resource);
        }

        let src = if size <= self.uploads.block_size() {
            self.uploads.upload(bytes, STRUCTURED_BUFFER_ALIGNMENT)?
        } else {
            let mut memory = self.device.create_upload_buffer(size)?;
            memory.bytes_mut()[..bytes.len()].copy_from_slice(bytes);
            let address = memory.gpu_address();
            self.track_upload_buffer(memory);
            address
        };

        self.transition_barrier(resource, ResourceStates::COPY_DEST, Subresource::All, true);
        self.encoder.push(Command::CopyBufferRegion {
            dst: resource,
            dst_offset: 0,
            src,
            size,
        });

        Ok(resource)
    }

    /// Copies texel data into consecutive subresources of a texture,
    /// starting at `first_subresource`.
    ///
    /// Rows are re-laid with a pitch aligned to
    /// [`TEXTURE_DATA_PITCH_ALIGNMENT`] in a dedicated upload buffer that
    /// lives as long as the list. The whole texture is transitioned to
    /// `COPY_DEST`.
    ///
    /// ## Panics
    ///
    /// Panics if `resource` is unknown to the device, if a row pitch is zero,
    /// or if the subresources run past the end of the texture.
    pub fn copy_texture_subresource(
        &mut self,
        resource: ResourceId,
        first_subresource: u32,
        subresources: &[SubresourceData],
    ) -> Result<(), Error> {
        if subresources.is_empty() {
            return Ok(());
        }

        let Some(desc) = self.device.resource_desc(resource) else {
            panic!("copy into unknown resource {resource:?}");
        };
        let count = desc.subresource_count();
        assert!(
            u64::from(first_subresource) + subresources.len() as u64 <= u64::from(count),
            "subresources {first_subresource}..{} out of range for a texture of {count}",
            u64::from(first_subresource) + subresources.len() as u64,
        );

        let mut footprints = Vec::with_capacity(subresources.len());
        let mut size = 0_u64;
        for subresource in subresources {
            assert!(subresource.row_pitch > 0, "zero row pitch");

            let src_pitch = u64::from(subresource.row_pitch);
            let rows = (subresource.data.len() as u64 + src_pitch - 1) / src_pitch;
            assert!(
                rows <= u64::from(desc.height),
                "{rows} rows of data for a texture {} rows high",
                desc.height
            );

            let row_pitch = checked_next_multiple_of(src_pitch, TEXTURE_DATA_PITCH_ALIGNMENT)
                .and_then(|pitch| u32::try_from(pitch).ok())
                .ok_or(DeviceError::OutOfMemory)?;
            let offset = checked_next_multiple_of(size, TEXTURE_DATA_PLACEMENT_ALIGNMENT)
                .ok_or(DeviceError::OutOfMemory)?;
            size = u64::from(row_pitch)
                .checked_mul(rows)
                .and_then(|bytes| offset.checked_add(bytes))
                .ok_or(DeviceError::OutOfMemory)?;

            footprints.push(Footprint {
                offset,
                row_pitch,
                rows: rows as u32,
            });
        }

        let mut memory = self.device.create_upload_buffer(size)?;
        let bytes = memory.bytes_mut();
        for (subresource, footprint) in subresources.iter().zip(&footprints) {
            let rows = subresource.data.chunks(subresource.row_pitch as usize);
            for (index, row) in rows.enumerate() {
                let start = footprint.offset + index as u64 * u64::from(footprint.row_pitch);
                let start = start as usize;
                bytes[start..start + row.len()].copy_from_slice(row);
            }
        }
        let address = memory.gpu_address();
        self.track_upload_buffer(memory);

        self.transition_barrier(resource, ResourceStates::COPY_DEST, Subresource::All, true);
        for (index, footprint) in footprints.iter().enumerate() {
            self.encoder.push(Command::CopyBufferToTexture {
                dst: resource,
                dst_subresource: first_subresource + index as u32,
                src: address.offset(footprint.offset),
                row_pitch: footprint.row_pitch,
                rows: footprint.rows,
            });
        }

        Ok(())
    }

    pub fn copy_vertex_buffer<T: Pod>(&mut self, vertices: &[T]) -> Result<VertexBuffer, Error> {
        let resource = self.copy_buffer(vertices, ResourceFlags::empty())?;

        Ok(VertexBuffer {
            resource,
            view: VertexBufferView {
                address: self.device.gpu_address(resource),
                size: std::mem::size_of_val(vertices) as u32,
                stride: size_of::<T>() as u32,
            },
        })
    }

    /// ## Panics
    ///
    /// Panics unless `T` is 2 or 4 bytes in size.
    pub fn copy_index_buffer<T: Pod>(&mut self, indices: &[T]) -> Result<IndexBuffer, Error> {
        let format = index_format::<T>();
        let resource = self.copy_buffer(indices, ResourceFlags::empty())?;

        Ok(IndexBuffer {
            resource,
            view: IndexBufferView {
                address: self.device.gpu_address(resource),
                size: std::mem::size_of_val(indices) as u32,
                format,
            },
        })
    }

    pub fn copy_byte_address_buffer<T: Pod>(&mut self, data: &[T]) -> Result<ResourceId, Error> {
        self.copy_buffer(data, ResourceFlags::empty())
    }

    /// Copies `data` into a buffer that shaders may also write to.
    pub fn copy_structured_buffer<T: Pod>(&mut self, data: &[T]) -> Result<ResourceId, Error> {
        self.copy_buffer(data, ResourceFlags::ALLOW_UNORDERED_ACCESS)
    }

    // Dynamic data

    /// Uploads `data` and binds it as a root constant buffer view.
    pub fn set_graphics_dynamic_constant_buffer<T: Pod>(
        &mut self,
        root_index: u32,
        data: &T,
    ) -> Result<(), Error> {
        let address = self
            .uploads
            .upload(std::slice::from_ref(data), CONSTANT_BUFFER_ALIGNMENT)?;

        self.encoder.push(Command::SetRootConstantBufferView {
            bind_point: BindPoint::Graphics,
            root_index,
            address,
        });
        Ok(())
    }

    pub fn set_graphics_32bit_constants<T: Pod>(&mut self, root_index: u32, constants: &T) {
        self.encoder.push(Command::SetRoot32BitConstants {
            bind_point: BindPoint::Graphics,
            root_index,
            constants: pack_constants(constants),
        });
    }

    pub fn set_compute_32bit_constants<T: Pod>(&mut self, root_index: u32, constants: &T) {
        self.encoder.push(Command::SetRoot32BitConstants {
            bind_point: BindPoint::Compute,
            root_index,
            constants: pack_constants(constants),
        });
    }

    /// Uploads `vertices` and binds them to vertex buffer `slot` for this
    /// list only.
    pub fn set_dynamic_vertex_buffer<T: Pod>(
        &mut self,
        slot: u32,
        vertices: &[T],
    ) -> Result<(), Error> {
        let align = std::mem::align_of::<T>().max(4) as u64;
        let address = self.uploads.upload(vertices, align)?;

        self.encoder.push(Command::SetVertexBuffers {
            start_slot: slot,
            views: smallvec![VertexBufferView {
                address,
                size: std::mem::size_of_val(vertices) as u32,
                stride: size_of::<T>() as u32,
            }],
        });
        Ok(())
    }

    /// ## Panics
    ///
    /// Panics unless `T` is 2 or 4 bytes in size.
    pub fn set_dynamic_index_buffer<T: Pod>(&mut self, indices: &[T]) -> Result<(), Error> {
        let format = index_format::<T>();
        let address = self.uploads.upload(indices, 4)?;

        self.encoder.push(Command::SetIndexBuffer(IndexBufferView {
            address,
            size: std::mem::size_of_val(indices) as u32,
            format,
        }));
        Ok(())
    }

    /// Uploads `data` and binds it as a root shader resource view.
    pub fn set_graphics_dynamic_structured_buffer<T: Pod>(
        &mut self,
        root_index: u32,
        data: &[T],
    ) -> Result<(), Error> {
        let address = self.uploads.upload(data, STRUCTURED_BUFFER_ALIGNMENT)?;

        self.encoder.push(Command::SetRootShaderResourceView {
            bind_point: BindPoint::Graphics,
            root_index,
            address,
        });
        Ok(())
    }

    // Static binding

    pub fn set_vertex_buffer(&mut self, slot: u32, buffer: &VertexBuffer) {
        self.tracker.transition(
            buffer.resource,
            Subresource::All,
            ResourceStates::VERTEX_AND_CONSTANT_BUFFER,
        );

        self.encoder.push(Command::SetVertexBuffers {
            start_slot: slot,
            views: smallvec![buffer.view],
        });
    }

    pub fn set_index_buffer(&mut self, buffer: &IndexBuffer) {
        self.tracker
            .transition(buffer.resource, Subresource::All, ResourceStates::INDEX_BUFFER);

        self.encoder.push(Command::SetIndexBuffer(buffer.view));
    }

    pub fn set_primitive_topology(&mut self, topology: PrimitiveTopology) {
        self.encoder.push(Command::SetPrimitiveTopology(topology));
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.set_viewports(&[viewport]);
    }

    /// ## Panics
    ///
    /// Panics if more than [`MAX_VIEWPORTS`] viewports are given.
    pub fn set_viewports(&mut self, viewports: &[Viewport]) {
        assert!(viewports.len() <= MAX_VIEWPORTS, "too many viewports");
        self.encoder
            .push(Command::SetViewports(viewports.iter().copied().collect()));
    }

    pub fn set_scissor_rect(&mut self, rect: Rect) {
        self.set_scissor_rects(&[rect]);
    }

    /// ## Panics
    ///
    /// Panics if more than [`MAX_VIEWPORTS`] rects are given.
    pub fn set_scissor_rects(&mut self, rects: &[Rect]) {
        assert!(rects.len() <= MAX_VIEWPORTS, "too many scissor rects");
        self.encoder
            .push(Command::SetScissorRects(rects.iter().copied().collect()));
    }

    pub fn set_pipeline_state(&mut self, pipeline: PipelineStateId) {
        self.encoder.push(Command::SetPipelineState(pipeline));
    }

    pub fn set_graphics_root_signature(&mut self, signature: &RootSignature) {
        if self.graphics_root_signature == Some(signature.id()) {
            return;
        }

        self.graphics_root_signature = Some(signature.id());
        for heap in &mut self.dynamic_heaps {
            heap.parse_root_signature(signature);
        }

        self.encoder
            .push(Command::SetGraphicsRootSignature(signature.id()));
    }

    pub fn set_compute_root_signature(&mut self, signature: &RootSignature) {
        if self.compute_root_signature == Some(signature.id()) {
            return;
        }

        self.compute_root_signature = Some(signature.id());
        for heap in &mut self.dynamic_heaps {
            heap.parse_root_signature(signature);
        }

        self.encoder
            .push(Command::SetComputeRootSignature(signature.id()));
    }

    /// Stages `count` consecutive descriptors starting at `src` into the
    /// descriptor table at `root_index`. They are copied to a shader-visible
    /// heap at the next draw or dispatch.
    ///
    /// ## Errors
    ///
    /// Fails if the descriptors do not fit in the table described by the
    /// bound root signature.
    pub fn stage_descriptors(
        &mut self,
        kind: DescriptorHeapKind,
        root_index: u32,
        offset: u32,
        count: u32,
        src: CpuDescriptor,
    ) -> Result<(), Error> {
        self.dynamic_heap(kind)
            .stage_descriptors(root_index, offset, count, src)
    }

    /// Transitions `resource` to `after` and stages its view. With
    /// `subresources`, only that range is transitioned.
    ///
    /// Compute lists must pass a state without
    /// [`ResourceStates::PIXEL_SHADER_RESOURCE`].
    pub fn set_shader_resource_view(
        &mut self,
        root_index: u32,
        offset: u32,
        resource: ResourceId,
        view: CpuDescriptor,
        after: ResourceStates,
        subresources: Option<Range<u32>>,
    ) -> Result<(), Error> {
        self.transition_range(resource, subresources, after);
        self.stage_descriptors(DescriptorHeapKind::CbvSrvUav, root_index, offset, 1, view)
    }

    pub fn set_unordered_access_view(
        &mut self,
        root_index: u32,
        offset: u32,
        resource: ResourceId,
        view: CpuDescriptor,
        after: ResourceStates,
        subresources: Option<Range<u32>>,
    ) -> Result<(), Error> {
        self.transition_range(resource, subresources, after);
        self.stage_descriptors(DescriptorHeapKind::CbvSrvUav, root_index, offset, 1, view)
    }

    /// Copies one descriptor into the list's shader-visible heap, for
    /// operations that take a GPU descriptor directly.
    pub fn copy_descriptor(
        &mut self,
        kind: DescriptorHeapKind,
        descriptor: CpuDescriptor,
    ) -> Result<GpuDescriptor, Error> {
        assert!(kind.can_be_shader_visible(), "{kind:?} descriptors cannot be copied");
        self.dynamic_heaps[kind.index()].copy_descriptor(&mut self.encoder, descriptor)
    }

    pub fn set_render_target(&mut self, target: &RenderTarget) {
        let mut render_targets = SmallVec::new();
        for attachment in target.colors.iter().flatten() {
            self.tracker.transition(
                attachment.resource,
                attachment.subresource,
                ResourceStates::RENDER_TARGET,
            );
            render_targets.push(attachment.view);
        }

        let depth_stencil = target.depth_stencil.map(|attachment| {
            self.tracker.transition(
                attachment.resource,
                attachment.subresource,
                ResourceStates::DEPTH_WRITE,
            );
            attachment.view
        });

        self.encoder.push(Command::SetRenderTargets {
            render_targets,
            depth_stencil,
        });
    }

    pub fn clear_texture(&mut self, attachment: &Attachment, color: [f32; 4]) {
        self.transition_barrier(
            attachment.resource,
            ResourceStates::RENDER_TARGET,
            attachment.subresource,
            true,
        );

        self.encoder.push(Command::ClearRenderTarget {
            view: attachment.view,
            color,
        });
    }

    pub fn clear_depth_stencil(
        &mut self,
        attachment: &Attachment,
        flags: ClearFlags,
        depth: f32,
        stencil: u8,
    ) {
        self.transition_barrier(
            attachment.resource,
            ResourceStates::DEPTH_WRITE,
            attachment.subresource,
            true,
        );

        self.encoder.push(Command::ClearDepthStencil {
            view: attachment.view,
            flags,
            depth,
            stencil,
        });
    }

    pub fn set_descriptor_heap(&mut self, kind: DescriptorHeapKind, heap: DescriptorHeapId) {
        self.encoder.set_descriptor_heap(kind, heap);
    }

    // Work

    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
    ) -> Result<(), Error> {
        self.prepare_draw()?;

        self.encoder.push(Command::Draw {
            vertex_count,
            instance_count,
            start_vertex,
            start_instance,
        });
        Ok(())
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    ) -> Result<(), Error> {
        self.prepare_draw()?;

        self.encoder.push(Command::DrawIndexed {
            index_count,
            instance_count,
            start_index,
            base_vertex,
            start_instance,
        });
        Ok(())
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<(), Error> {
        self.flush_resource_barriers();
        for heap in &mut self.dynamic_heaps {
            heap.commit_staged_descriptors_for_dispatch(&mut self.encoder)?;
        }

        self.encoder.push(Command::Dispatch { x, y, z });
        Ok(())
    }

    // Lifecycle

    /// Keeps `memory` alive until the list is reset.
    pub fn track_upload_buffer(&mut self, memory: Box<dyn MappedMemory>) {
        self.upload_buffers.push(memory);
    }

    /// Closes the list for submission.
    ///
    /// Barriers whose prior state the list could not know are resolved
    /// against `global` and recorded into `pending`, which must execute
    /// immediately before this list. The list's final resource states are
    /// then written to `global`. Returns whether `pending` holds any
    /// barriers.
    pub fn close_with(&mut self, pending: &mut CommandList, global: &mut ResourceStateMap) -> bool {
        self.flush_resource_barriers();

        let num_barriers = self
            .tracker
            .flush_pending_resource_barriers(global, pending.encoder.buffer_mut());
        pending.close();

        self.tracker.commit_final_resource_states(global);
        self.encoder.close();

        num_barriers > 0
    }

    /// Closes the list without resolving pending barriers.
    pub fn close(&mut self) {
        self.flush_resource_barriers();
        self.encoder.close();
    }

    /// Clears the list for reuse. Only safe once the GPU is done with it.
    pub fn reset(&mut self) {
        self.encoder.reset();
        self.tracker.reset();
        self.uploads.reset();
        for heap in &mut self.dynamic_heaps {
            heap.reset();
        }

        self.graphics_root_signature = None;
        self.compute_root_signature = None;
        self.upload_buffers.clear();
    }

    fn prepare_draw(&mut self) -> Result<(), Error> {
        self.flush_resource_barriers();
        for heap in &mut self.dynamic_heaps {
            heap.commit_staged_descriptors_for_draw(&mut self.encoder)?;
        }
        Ok(())
    }

    fn transition_range(
        &mut self,
        resource: ResourceId,
        subresources: Option<Range<u32>>,
        after: ResourceStates,
    ) {
        match subresources {
            Some(range) => {
                for index in range {
                    self.tracker
                        .transition(resource, Subresource::Index(index), after);
                }
            }
            None => self.tracker.transition(resource, Subresource::All, after),
        }
    }

    fn dynamic_heap(&mut self, kind: DescriptorHeapKind) -> &mut DynamicDescriptorHeap {
        assert!(kind.can_be_shader_visible(), "{kind:?} descriptors cannot be staged");
        &mut self.dynamic_heaps[kind.index()]
    }
}

fn index_format<T>() -> Format {
    match size_of::<T>() {
        2 => Format::R16Uint,
        4 => Format::R32Uint,
        size => panic!("indices must be 2 or 4 bytes, not {size}"),
    }
}

fn pack_constants<T: Pod>(constants: &T) -> SmallVec<[u32; 16]> {
    let bytes = bytemuck::bytes_of(constants);
    assert_eq!(
        bytes.len() % 4,
        0,
        "root constants must be a whole number of 32-bit values"
    );

    bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
