//! GPU command submission and resource lifetime management.
//!
//! ## Goals
//!
//! - Submit work to independent direct, compute and copy queues from any
//!   thread.
//! - Emit exactly the resource barriers a submission needs, even when the
//!   list was recorded without knowing what state its resources start in.
//! - Reclaim descriptors, upload memory and command lists only once the GPU
//!   is done with them, without stalling the CPU to find out.
//!
//! ## Non-goals
//!
//! - Multi-GPU scheduling.
//! - Shader or pipeline validation.
//!
//! ## Structure
//!
//! The [`Context`] owns process-wide state: the global resource state map,
//! the persistent descriptor allocators and one [`CommandQueue`] per queue
//! kind. Work is recorded into [`CommandList`]s taken from a queue and
//! handed back to it for execution. Everything that talks to the GPU goes
//! through the traits in [`device`]; [`headless::HeadlessDevice`] implements
//! them in software.

pub mod command;
pub mod command_list;
pub mod context;
pub mod descriptor_allocator;
pub mod device;
pub mod dynamic_descriptor_heap;
pub mod headless;
pub mod queue;
pub mod resource_state;
pub mod root_signature;
pub mod upload;

mod error;

pub use command_list::{
    Attachment, CommandList, IndexBuffer, RenderTarget, SubresourceData, VertexBuffer,
};
pub use context::Context;
pub use descriptor_allocator::{DescriptorAllocation, DescriptorAllocator};
pub use device::{Device, QueueKind, ResourceDesc, ResourceId};
pub use error::{DeviceError, Error};
pub use queue::CommandQueue;
pub use resource_state::{GlobalResourceStates, ResourceStates, Subresource};
pub use root_signature::RootSignature;
pub use upload::UploadAllocator;

#[derive(Clone, Debug)]
pub struct Config {
    /// The number of descriptors in each CPU-only descriptor heap created by
    /// the persistent descriptor allocators.
    ///
    /// Requests for more descriptors than this grow the size of all heaps
    /// created afterwards. Defaults to 256.
    pub descriptors_per_heap: u32,

    /// The number of descriptors in each shader-visible heap used by command
    /// lists for descriptor tables.
    ///
    /// This bounds the size of a single descriptor table. Defaults to 1024.
    pub shader_visible_descriptors_per_heap: u32,

    /// The size of each block of upload memory used for per-draw data.
    ///
    /// A single dynamic allocation cannot be larger than this. Defaults to
    /// 2 MiB.
    pub upload_block_size: u64,

    /// How many frames the CPU may record ahead of the GPU before
    /// [`Context::end_frame`] blocks. Defaults to 3.
    pub frames_in_flight: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            descriptors_per_heap: 256,
            shader_visible_descriptors_per_heap: 1024,
            upload_block_size: 2 * 1024 * 1024,
            frames_in_flight: 3,
        }
    }
}
