//! CPU descriptor allocation and descriptor sets.
//!
//! Views and samplers are written once into CPU-only heaps handed out by a
//! [`DescriptorAllocator`]. A [`DescriptorSet`] is a contiguous range of
//! such descriptors, laid out by a [`DescriptorSetLayout`]; binding it
//! copies the range into the command list's shader-visible heap.

use std::sync::Arc;

use anyhow::{Context, Result};
use gfx_core::GraphicsError;
use parking_lot::Mutex;
use tracing::debug;

use crate::backend::{CpuDescriptor, D3d12Backend, DescriptorHeapKind, NativeHeap};

/// Bump allocator over CPU descriptor heaps of one kind.
///
/// Allocations are never freed; a new heap is opened when the current one
/// lacks room for a contiguous request.
#[derive(Debug)]
pub struct DescriptorAllocator {
    kind: DescriptorHeapKind,
    descriptors_per_heap: u32,
    increment: u32,
    state: Mutex<AllocatorState>,
}

#[derive(Debug, Default)]
struct AllocatorState {
    heaps: Vec<NativeHeap>,
    next: CpuDescriptor,
    remaining: u32,
}

impl DescriptorAllocator {
    pub fn new<B: D3d12Backend + ?Sized>(backend: &B, kind: DescriptorHeapKind, descriptors_per_heap: u32) -> Self {
        Self {
            kind,
            descriptors_per_heap,
            increment: backend.descriptor_increment(kind),
            state: Mutex::new(AllocatorState::default()),
        }
    }

    pub fn kind(&self) -> DescriptorHeapKind {
        self.kind
    }

    pub fn increment(&self) -> u32 {
        self.increment
    }

    /// Reserve `count` contiguous descriptors.
    pub fn allocate<B: D3d12Backend + ?Sized>(&self, backend: &B, count: u32) -> Result<CpuDescriptor> {
        let mut state = self.state.lock();
        if state.heaps.is_empty() || state.remaining < count {
            let capacity = self.descriptors_per_heap.max(count);
            let heap = backend
                .create_descriptor_heap(self.kind, capacity, false)
                .with_context(|| format!("creating {:?} descriptor heap", self.kind))?;
            debug!(kind = ?self.kind, capacity, heaps = state.heaps.len() + 1, "new CPU descriptor heap");
            state.next = heap.cpu_start;
            state.remaining = capacity;
            state.heaps.push(heap);
        }
        let start = state.next;
        state.next = start.offset(count, self.increment);
        state.remaining -= count;
        Ok(start)
    }

    pub fn heap_count(&self) -> usize {
        self.state.lock().heaps.len()
    }

    pub fn release<B: D3d12Backend + ?Sized>(&self, backend: &B) {
        let mut state = self.state.lock();
        for heap in state.heaps.drain(..) {
            backend.release_descriptor_heap(heap.id);
        }
        state.remaining = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    ShaderResource,
    ConstantBuffer,
    UnorderedAccess,
    Sampler,
}

impl DescriptorKind {
    pub fn heap_kind(self) -> DescriptorHeapKind {
        match self {
            DescriptorKind::Sampler => DescriptorHeapKind::Sampler,
            _ => DescriptorHeapKind::CbvSrvUav,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Binding {
    kind: DescriptorKind,
    /// Offset inside the set's range of the binding's heap kind.
    offset: u32,
}

/// Ordered bindings of a descriptor set. Arrays occupy consecutive slots.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DescriptorSetLayout {
    bindings: Vec<Binding>,
    srv_count: u32,
    sampler_count: u32,
}

impl DescriptorSetLayout {
    pub fn builder() -> DescriptorSetLayoutBuilder {
        DescriptorSetLayoutBuilder::default()
    }

    /// Descriptors in the CBV/SRV/UAV heap.
    pub fn srv_count(&self) -> u32 {
        self.srv_count
    }

    pub fn sampler_count(&self) -> u32 {
        self.sampler_count
    }

    pub fn slot_count(&self) -> usize {
        self.bindings.len()
    }

    fn binding(&self, slot: usize, expected: &[DescriptorKind]) -> Result<Binding> {
        let binding = *self
            .bindings
            .get(slot)
            .ok_or_else(|| GraphicsError::invalid(format!("descriptor slot {slot} out of range")))?;
        if !expected.contains(&binding.kind) {
            return Err(GraphicsError::invalid(format!(
                "descriptor slot {slot} holds a {:?}",
                binding.kind
            ))
            .into());
        }
        Ok(binding)
    }
}

#[derive(Debug, Default)]
pub struct DescriptorSetLayoutBuilder {
    layout: DescriptorSetLayout,
}

impl DescriptorSetLayoutBuilder {
    pub fn add(mut self, kind: DescriptorKind, count: u32) -> Self {
        for _ in 0..count {
            let counter = match kind {
                DescriptorKind::Sampler => &mut self.layout.sampler_count,
                _ => &mut self.layout.srv_count,
            };
            self.layout.bindings.push(Binding { kind, offset: *counter });
            *counter += 1;
        }
        self
    }

    pub fn build(self) -> Arc<DescriptorSetLayout> {
        Arc::new(self.layout)
    }
}

/// Fixed-capacity range of CPU descriptors sets are carved from.
///
/// Running out yields an invalid set rather than an error, and binding an
/// invalid set binds nothing.
#[derive(Debug)]
pub struct DescriptorPool {
    srv_heap: Option<NativeHeap>,
    sampler_heap: Option<NativeHeap>,
    srv_increment: u32,
    sampler_increment: u32,
    srv_used: u32,
    sampler_used: u32,
}

impl DescriptorPool {
    pub fn new<B: D3d12Backend + ?Sized>(backend: &B, srv_capacity: u32, sampler_capacity: u32) -> Result<Self> {
        let srv_heap = match srv_capacity {
            0 => None,
            n => Some(backend.create_descriptor_heap(DescriptorHeapKind::CbvSrvUav, n, false)?),
        };
        let sampler_heap = match sampler_capacity {
            0 => None,
            n => Some(backend.create_descriptor_heap(DescriptorHeapKind::Sampler, n, false)?),
        };
        Ok(Self {
            srv_heap,
            sampler_heap,
            srv_increment: backend.descriptor_increment(DescriptorHeapKind::CbvSrvUav),
            sampler_increment: backend.descriptor_increment(DescriptorHeapKind::Sampler),
            srv_used: 0,
            sampler_used: 0,
        })
    }

    pub fn allocate(&mut self, layout: &Arc<DescriptorSetLayout>) -> DescriptorSet {
        let srv_capacity = self.srv_heap.map_or(0, |h| h.capacity);
        let sampler_capacity = self.sampler_heap.map_or(0, |h| h.capacity);
        if self.srv_used + layout.srv_count > srv_capacity
            || self.sampler_used + layout.sampler_count > sampler_capacity
        {
            debug!(srv = layout.srv_count, samplers = layout.sampler_count, "descriptor pool exhausted");
            return DescriptorSet::invalid(Arc::clone(layout));
        }

        let srv_start = match (layout.srv_count, self.srv_heap) {
            (0, _) | (_, None) => CpuDescriptor::default(),
            (_, Some(heap)) => heap.cpu_start.offset(self.srv_used, self.srv_increment),
        };
        let sampler_start = match (layout.sampler_count, self.sampler_heap) {
            (0, _) | (_, None) => CpuDescriptor::default(),
            (_, Some(heap)) => heap.cpu_start.offset(self.sampler_used, self.sampler_increment),
        };
        self.srv_used += layout.srv_count;
        self.sampler_used += layout.sampler_count;
        DescriptorSet {
            layout: Arc::clone(layout),
            srv_start,
            sampler_start,
            srv_increment: self.srv_increment,
            sampler_increment: self.sampler_increment,
            valid: true,
        }
    }

    /// Forget every allocation. Sets from before the reset must not be
    /// bound afterwards.
    pub fn reset(&mut self) {
        self.srv_used = 0;
        self.sampler_used = 0;
    }

    pub fn release<B: D3d12Backend + ?Sized>(&mut self, backend: &B) {
        for heap in [self.srv_heap.take(), self.sampler_heap.take()].into_iter().flatten() {
            backend.release_descriptor_heap(heap.id);
        }
    }
}

/// Contiguous CPU descriptors for one binding of a layout.
#[derive(Debug, Clone)]
pub struct DescriptorSet {
    layout: Arc<DescriptorSetLayout>,
    srv_start: CpuDescriptor,
    sampler_start: CpuDescriptor,
    srv_increment: u32,
    sampler_increment: u32,
    valid: bool,
}

impl DescriptorSet {
    fn invalid(layout: Arc<DescriptorSetLayout>) -> Self {
        Self {
            layout,
            srv_start: CpuDescriptor::default(),
            sampler_start: CpuDescriptor::default(),
            srv_increment: 0,
            sampler_increment: 0,
            valid: false,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn layout(&self) -> &Arc<DescriptorSetLayout> {
        &self.layout
    }

    pub fn srv_start(&self) -> CpuDescriptor {
        self.srv_start
    }

    pub fn sampler_start(&self) -> CpuDescriptor {
        self.sampler_start
    }

    /// Copy a shader resource or unordered access view into `slot`.
    pub fn set_shader_resource_view<B: D3d12Backend + ?Sized>(
        &self,
        backend: &B,
        slot: usize,
        view: CpuDescriptor,
    ) -> Result<()> {
        let binding = self
            .layout
            .binding(slot, &[DescriptorKind::ShaderResource, DescriptorKind::UnorderedAccess])?;
        self.write(backend, binding, view);
        Ok(())
    }

    pub fn set_constant_buffer<B: D3d12Backend + ?Sized>(&self, backend: &B, slot: usize, view: CpuDescriptor) -> Result<()> {
        let binding = self.layout.binding(slot, &[DescriptorKind::ConstantBuffer])?;
        self.write(backend, binding, view);
        Ok(())
    }

    pub fn set_sampler_state<B: D3d12Backend + ?Sized>(&self, backend: &B, slot: usize, sampler: CpuDescriptor) -> Result<()> {
        let binding = self.layout.binding(slot, &[DescriptorKind::Sampler])?;
        self.write(backend, binding, sampler);
        Ok(())
    }

    fn write<B: D3d12Backend + ?Sized>(&self, backend: &B, binding: Binding, source: CpuDescriptor) {
        if !self.valid {
            return;
        }
        let kind = binding.kind.heap_kind();
        let destination = match kind {
            DescriptorHeapKind::Sampler => self.sampler_start.offset(binding.offset, self.sampler_increment),
            _ => self.srv_start.offset(binding.offset, self.srv_increment),
        };
        backend.copy_descriptors(1, destination, source, kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soft::SoftD3d12;
    use gfx_core::GraphicsProfile;

    fn backend() -> SoftD3d12 {
        let soft = SoftD3d12::new();
        soft.open(GraphicsProfile::Level_11_0, false).unwrap();
        soft
    }

    #[test]
    fn allocator_opens_a_heap_when_full() {
        let soft = backend();
        let allocator = DescriptorAllocator::new(&soft, DescriptorHeapKind::CbvSrvUav, 4);
        let inc = u64::from(allocator.increment());

        let a = allocator.allocate(&soft, 3).unwrap();
        let b = allocator.allocate(&soft, 1).unwrap();
        assert_eq!(b.0 - a.0, 3 * inc);
        assert_eq!(allocator.heap_count(), 1);

        // No room left for a contiguous pair.
        allocator.allocate(&soft, 2).unwrap();
        assert_eq!(allocator.heap_count(), 2);
    }

    #[test]
    fn oversized_request_gets_its_own_heap() {
        let soft = backend();
        let allocator = DescriptorAllocator::new(&soft, DescriptorHeapKind::Sampler, 4);
        allocator.allocate(&soft, 10).unwrap();
        assert_eq!(allocator.heap_count(), 1);
    }

    #[test]
    fn layout_counts_each_heap_kind() {
        let layout = DescriptorSetLayout::builder()
            .add(DescriptorKind::ConstantBuffer, 1)
            .add(DescriptorKind::ShaderResource, 2)
            .add(DescriptorKind::Sampler, 1)
            .build();
        assert_eq!(layout.srv_count(), 3);
        assert_eq!(layout.sampler_count(), 1);
        assert_eq!(layout.slot_count(), 4);
    }

    #[test]
    fn exhausted_pool_returns_invalid_sets() {
        let soft = backend();
        let layout = DescriptorSetLayout::builder().add(DescriptorKind::ShaderResource, 2).build();
        let mut pool = DescriptorPool::new(&soft, 3, 0).unwrap();

        assert!(pool.allocate(&layout).is_valid());
        let overflow = pool.allocate(&layout);
        assert!(!overflow.is_valid());
        assert!(overflow.srv_start().is_null());

        pool.reset();
        assert!(pool.allocate(&layout).is_valid());
    }

    #[test]
    fn slot_kind_is_checked() {
        let soft = backend();
        let layout = DescriptorSetLayout::builder().add(DescriptorKind::Sampler, 1).build();
        let mut pool = DescriptorPool::new(&soft, 0, 1).unwrap();
        let set = pool.allocate(&layout);
        assert!(set.set_shader_resource_view(&soft, 0, CpuDescriptor(1)).is_err());
        assert!(set.set_sampler_state(&soft, 1, CpuDescriptor(1)).is_err());
    }
}
