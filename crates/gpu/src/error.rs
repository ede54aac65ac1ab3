use crate::device::QueueKind;

/// Failures reported by the device. These indicate that a hardware object
/// could not be created or that the device itself is no longer usable, and
/// are not expected to be recovered from.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("the device is out of memory")]
    OutOfMemory,
    #[error("the device was removed: {0}")]
    Removed(String),
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Allocation(#[from] allocators::Error),

    /// The root parameter index is past the last descriptor table slot.
    #[error("root parameter {0} is not a valid descriptor table slot")]
    InvalidRootParameter(u32),

    /// A single descriptor table cannot be larger than a shader-visible
    /// descriptor heap.
    #[error("a table of {requested} descriptors exceeds the per-heap limit of {limit}")]
    DescriptorTableTooLarge { requested: u32, limit: u32 },

    /// The descriptors being staged extend past the end of the table
    /// described by the bound root signature.
    #[error(
        "{count} descriptors at offset {offset} overflow root parameter {root_index}, \
         which holds {capacity}"
    )]
    DescriptorTableOverflow {
        root_index: u32,
        offset: u32,
        count: u32,
        capacity: u32,
    },

    /// Upload allocations cannot span blocks.
    #[error("an upload of {requested} bytes exceeds the upload block size of {block_size} bytes")]
    UploadTooLarge { requested: u64, block_size: u64 },

    #[error("failed to start the retirement thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// The queue's retirement thread exited while the queue was still in
    /// use.
    #[error("the {0} queue is no longer accepting submissions")]
    QueueClosed(QueueKind),
}
