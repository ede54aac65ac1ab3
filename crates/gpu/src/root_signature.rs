use crate::{
    device::{DescriptorHeapKind, Device, RootSignatureId},
    error::Error,
};

/// The maximum number of root parameters, and so of descriptor tables, in a
/// root signature.
pub const MAX_ROOT_PARAMETERS: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorRangeKind {
    ConstantBuffer,
    ShaderResource,
    UnorderedAccess,
    Sampler,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorRange {
    pub kind: DescriptorRangeKind,
    pub num_descriptors: u32,
    pub base_register: u32,
    pub register_space: u32,
}

impl DescriptorRange {
    pub fn new(kind: DescriptorRangeKind, num_descriptors: u32, base_register: u32) -> Self {
        Self {
            kind,
            num_descriptors,
            base_register,
            register_space: 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RootParameter {
    /// A table of descriptors in a shader-visible heap. Tables may not mix
    /// samplers with other descriptors.
    DescriptorTable(Vec<DescriptorRange>),
    Constants { num_values: u32, register: u32 },
    ConstantBufferView { register: u32 },
    ShaderResourceView { register: u32 },
    UnorderedAccessView { register: u32 },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RootSignatureDesc {
    pub parameters: Vec<RootParameter>,
    pub num_static_samplers: u32,
}

/// The binding layout of a pipeline, along with what the dynamic descriptor
/// heaps need to know about its descriptor tables.
#[derive(Clone, Debug)]
pub struct RootSignature {
    id: RootSignatureId,
    desc: RootSignatureDesc,
    descriptor_table_mask: u32,
    sampler_table_mask: u32,
    num_descriptors: [u32; MAX_ROOT_PARAMETERS],
}

impl RootSignature {
    /// ## Panics
    ///
    /// Panics if `desc` has more than [`MAX_ROOT_PARAMETERS`] parameters.
    pub fn new(device: &dyn Device, desc: RootSignatureDesc) -> Result<Self, Error> {
        assert!(
            desc.parameters.len() <= MAX_ROOT_PARAMETERS,
            "root signatures are limited to {MAX_ROOT_PARAMETERS} parameters"
        );

        let mut descriptor_table_mask = 0;
        let mut sampler_table_mask = 0;
        let mut num_descriptors = [0; MAX_ROOT_PARAMETERS];

        for (index, parameter) in desc.parameters.iter().enumerate() {
            if let RootParameter::DescriptorTable(ranges) = parameter {
                let Some(first) = ranges.first() else {
                    continue;
                };

                if first.kind == DescriptorRangeKind::Sampler {
                    sampler_table_mask |= 1 << index;
                } else {
                    descriptor_table_mask |= 1 << index;
                }

                num_descriptors[index] = ranges.iter().map(|range| range.num_descriptors).sum();
            }
        }

        let id = device.create_root_signature(&desc)?;

        Ok(Self {
            id,
            desc,
            descriptor_table_mask,
            sampler_table_mask,
            num_descriptors,
        })
    }

    pub fn id(&self) -> RootSignatureId {
        self.id
    }

    pub fn desc(&self) -> &RootSignatureDesc {
        &self.desc
    }

    /// A bit mask of the root parameters that are descriptor tables for
    /// heaps of `kind`.
    pub fn descriptor_table_mask(&self, kind: DescriptorHeapKind) -> u32 {
        match kind {
            DescriptorHeapKind::CbvSrvUav => self.descriptor_table_mask,
            DescriptorHeapKind::Sampler => self.sampler_table_mask,
            DescriptorHeapKind::RenderTarget | DescriptorHeapKind::DepthStencil => 0,
        }
    }

    /// The number of descriptors in the table at `root_index`, or zero if
    /// the parameter is not a descriptor table.
    pub fn num_descriptors(&self, root_index: u32) -> u32 {
        assert!((root_index as usize) < MAX_ROOT_PARAMETERS);
        self.num_descriptors[root_index as usize]
    }
}
