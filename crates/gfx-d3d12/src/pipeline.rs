use std::sync::Arc;

use gfx_core::PrimitiveType;

use crate::backend::NativePipeline;
use crate::descriptor::DescriptorSetLayout;

/// A compiled pipeline and the root table layout it expects.
///
/// Each descriptor set layout contributes up to two root descriptor
/// tables, one for its CBV/SRV/UAV range and one for its samplers, bound
/// in set order and skipped when the range is empty.
#[derive(Debug, Clone, PartialEq)]
pub struct D3d12PipelineState {
    native: Option<NativePipeline>,
    primitive_type: PrimitiveType,
    srv_bind_counts: Vec<u32>,
    sampler_bind_counts: Vec<u32>,
}

impl D3d12PipelineState {
    pub fn new(native: Option<NativePipeline>, primitive_type: PrimitiveType, layouts: &[Arc<DescriptorSetLayout>]) -> Self {
        Self {
            native,
            primitive_type,
            srv_bind_counts: layouts.iter().map(|l| l.srv_count()).collect(),
            sampler_bind_counts: layouts.iter().map(|l| l.sampler_count()).collect(),
        }
    }

    pub fn native(&self) -> Option<NativePipeline> {
        self.native
    }

    pub fn primitive_type(&self) -> PrimitiveType {
        self.primitive_type
    }

    pub fn srv_bind_count(&self, set: usize) -> u32 {
        self.srv_bind_counts.get(set).copied().unwrap_or(0)
    }

    pub fn sampler_bind_count(&self, set: usize) -> u32 {
        self.sampler_bind_counts.get(set).copied().unwrap_or(0)
    }

    /// Number of descriptor set layouts the pipeline was built with.
    pub fn set_count(&self) -> usize {
        self.srv_bind_counts.len()
    }
}
