//! Textures, buffers and samplers.
//!
//! Every resource records the native state it was last transitioned to;
//! views share their root's native resource and defer to the root's state.

use anyhow::{Context, Result};
use gfx_core::{
    BufferDescription, BufferFlags, DeviceChild, GraphicsResourceUsage, Handle, LifetimeState,
    PixelFormat, SamplerState, TextureDescription, TextureDimension, TextureFlags,
    TextureViewDescription, ViewType,
};

use crate::backend::{
    CpuDescriptor, D3d12Backend, DescriptorHeapKind, HeapType, NativeResource, PlacedFootprint,
    ResourceDesc, ResourceStates, ViewDesc,
};
use crate::descriptor::DescriptorAllocator;
use crate::format::readback_layout;

/// Constant buffer views cover multiples of this size.
pub const CONSTANT_BUFFER_ALIGNMENT: u64 = 256;

/// The CPU descriptor allocators of a device.
#[derive(Debug)]
pub struct DescriptorAllocators {
    pub srv: DescriptorAllocator,
    pub sampler: DescriptorAllocator,
    pub rtv: DescriptorAllocator,
    pub dsv: DescriptorAllocator,
}

impl DescriptorAllocators {
    pub fn new<B: D3d12Backend + ?Sized>(backend: &B, descriptors_per_heap: u32) -> Self {
        Self {
            srv: DescriptorAllocator::new(backend, DescriptorHeapKind::CbvSrvUav, descriptors_per_heap),
            sampler: DescriptorAllocator::new(backend, DescriptorHeapKind::Sampler, descriptors_per_heap),
            rtv: DescriptorAllocator::new(backend, DescriptorHeapKind::RenderTarget, descriptors_per_heap),
            dsv: DescriptorAllocator::new(backend, DescriptorHeapKind::DepthStencil, descriptors_per_heap),
        }
    }

    pub fn release<B: D3d12Backend + ?Sized>(&self, backend: &B) {
        self.srv.release(backend);
        self.sampler.release(backend);
        self.rtv.release(backend);
        self.dsv.release(backend);
    }
}

/// What resources need from the device to (re)create their native objects.
pub struct ResourceContext<'a, B: ?Sized> {
    pub backend: &'a B,
    pub descriptors: &'a DescriptorAllocators,
}

/// Native state a resource starts in after creation.
pub fn initial_texture_state(description: &TextureDescription) -> ResourceStates {
    if description.usage == GraphicsResourceUsage::Staging {
        ResourceStates::COPY_DEST
    } else if description.flags.contains(TextureFlags::RENDER_TARGET) {
        ResourceStates::RENDER_TARGET
    } else if description.flags.contains(TextureFlags::DEPTH_STENCIL) {
        ResourceStates::DEPTH_WRITE
    } else {
        ResourceStates::COMMON
    }
}

/// Readback buffer layout of a staging texture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingLayout {
    pub footprints: Vec<PlacedFootprint>,
    pub size: u64,
}

#[derive(Debug)]
pub struct D3d12Texture {
    description: TextureDescription,
    view: TextureViewDescription,
    parent: Option<Handle<D3d12Texture>>,
    pub(crate) native: Option<NativeResource>,
    pub(crate) state: ResourceStates,
    pub(crate) srv: Option<CpuDescriptor>,
    pub(crate) rtv: Option<CpuDescriptor>,
    pub(crate) dsv: Option<CpuDescriptor>,
    pub(crate) staging: Option<StagingLayout>,
    /// Fence value of the last copy into this staging texture.
    pub(crate) staging_fence_value: u64,
    lifetime: LifetimeState,
}

impl D3d12Texture {
    pub fn create<B: D3d12Backend + ?Sized>(ctx: &ResourceContext<'_, B>, description: TextureDescription) -> Result<Self> {
        let mut texture = Self {
            description,
            view: TextureViewDescription::default(),
            parent: None,
            native: None,
            state: initial_texture_state(&description),
            srv: None,
            rtv: None,
            dsv: None,
            staging: None,
            staging_fence_value: 0,
            lifetime: LifetimeState::Active,
        };
        texture.allocate(ctx)?;
        Ok(texture)
    }

    /// A view onto `parent`, stored in the device arena under
    /// `parent_handle`. Views of views resolve to the root texture.
    pub fn view<B: D3d12Backend + ?Sized>(
        ctx: &ResourceContext<'_, B>,
        parent_handle: Handle<D3d12Texture>,
        parent: &D3d12Texture,
        view: TextureViewDescription,
    ) -> Result<Self> {
        let mut description = parent.description;
        if view.format != PixelFormat::None {
            description.format = view.format;
        }
        let mut texture = Self {
            description,
            view,
            parent: Some(parent.parent.unwrap_or(parent_handle)),
            native: parent.native,
            state: parent.state,
            srv: None,
            rtv: None,
            dsv: None,
            staging: None,
            staging_fence_value: 0,
            lifetime: parent.lifetime,
        };
        if texture.native.is_some() {
            texture.create_views(ctx)?;
        }
        Ok(texture)
    }

    fn allocate<B: D3d12Backend + ?Sized>(&mut self, ctx: &ResourceContext<'_, B>) -> Result<()> {
        let desc = &self.description;
        if desc.usage == GraphicsResourceUsage::Staging {
            let (footprints, size) = readback_layout(desc);
            let native = ctx
                .backend
                .create_committed_resource(&ResourceDesc::buffer(size), HeapType::Readback, ResourceStates::COPY_DEST)
                .context("creating staging texture")?;
            self.native = Some(native);
            self.staging = Some(StagingLayout { footprints, size });
            self.state = ResourceStates::COPY_DEST;
            return Ok(());
        }

        let native_desc = ResourceDesc::Texture {
            dimension: desc.dimension,
            format: desc.format,
            width: desc.width,
            height: desc.height,
            depth_or_array_size: match desc.dimension {
                TextureDimension::Texture3D => desc.depth,
                _ => desc.array_size,
            },
            mip_levels: desc.mip_levels,
            sample_count: desc.sample_count,
            flags: desc.flags,
        };
        let state = initial_texture_state(desc);
        let native = ctx
            .backend
            .create_committed_resource(&native_desc, HeapType::Default, state)
            .with_context(|| format!("creating {}x{} {:?} texture", desc.width, desc.height, desc.format))?;
        self.native = Some(native);
        self.state = state;
        self.create_views(ctx)
    }

    fn create_views<B: D3d12Backend + ?Sized>(&mut self, ctx: &ResourceContext<'_, B>) -> Result<()> {
        let Some(native) = self.native else {
            return Ok(());
        };
        let flags = self.description.flags;
        let view = self.view_desc();
        if flags.contains(TextureFlags::SHADER_RESOURCE) {
            let slot = ctx.descriptors.srv.allocate(ctx.backend, 1)?;
            ctx.backend.create_shader_resource_view(native, &view, slot);
            self.srv = Some(slot);
        }
        if flags.contains(TextureFlags::RENDER_TARGET) {
            let slot = ctx.descriptors.rtv.allocate(ctx.backend, 1)?;
            ctx.backend.create_render_target_view(native, &view, slot);
            self.rtv = Some(slot);
        }
        if flags.contains(TextureFlags::DEPTH_STENCIL) {
            let slot = ctx.descriptors.dsv.allocate(ctx.backend, 1)?;
            let view = ViewDesc {
                read_only: flags.contains(TextureFlags::DEPTH_STENCIL_READ_ONLY),
                ..view
            };
            ctx.backend.create_depth_stencil_view(native, &view, slot);
            self.dsv = Some(slot);
        }
        Ok(())
    }

    fn view_desc(&self) -> ViewDesc {
        let desc = &self.description;
        let slices = desc.array_size;
        let mips = desc.mip_levels;
        let v = &self.view;
        let (first_slice, slice_count, first_mip, mip_count) = match v.view_type {
            ViewType::Full => (0, slices, 0, mips),
            ViewType::Single => (v.array_slice, 1, v.mip_level, 1),
            ViewType::ArrayBand => (v.array_slice, slices - v.array_slice, v.mip_level, 1),
            ViewType::MipBand => (v.array_slice, 1, v.mip_level, mips - v.mip_level),
        };
        ViewDesc {
            format: desc.format,
            dimension: desc.dimension,
            first_slice,
            slice_count,
            first_mip,
            mip_count,
            read_only: false,
        }
    }

    /// Copy the parent's native resource after it was recreated and build
    /// this view's descriptors again.
    pub fn adopt_parent<B: D3d12Backend + ?Sized>(&mut self, ctx: &ResourceContext<'_, B>, parent: &D3d12Texture) -> Result<()> {
        self.native = parent.native;
        self.state = parent.state;
        self.lifetime = parent.lifetime;
        self.create_views(ctx)
    }

    pub fn description(&self) -> &TextureDescription {
        &self.description
    }

    pub fn view_description(&self) -> &TextureViewDescription {
        &self.view
    }

    /// Root texture this view was created from.
    pub fn parent(&self) -> Option<Handle<D3d12Texture>> {
        self.parent
    }

    pub fn native_resource(&self) -> Option<NativeResource> {
        self.native
    }

    pub fn state(&self) -> ResourceStates {
        self.state
    }

    pub fn is_staging(&self) -> bool {
        self.staging.is_some()
    }

    pub fn shader_resource_view(&self) -> Option<CpuDescriptor> {
        self.srv
    }

    pub fn render_target_view(&self) -> Option<CpuDescriptor> {
        self.rtv
    }

    pub fn depth_stencil_view(&self) -> Option<CpuDescriptor> {
        self.dsv
    }

    /// Width of the mip level the view renders into.
    pub fn width(&self) -> u32 {
        self.description.mip_width(self.view.mip_level)
    }

    pub fn height(&self) -> u32 {
        self.description.mip_height(self.view.mip_level)
    }

    /// Subresource index of a view's first slice and mip.
    pub fn first_subresource(&self) -> u32 {
        gfx_core::resource::subresource_index(self.view.mip_level, self.view.array_slice, self.description.mip_levels)
    }

    pub(crate) fn footprint(&self, subresource: u32) -> Option<PlacedFootprint> {
        self.staging.as_ref()?.footprints.get(subresource as usize).copied()
    }

    fn release<B: D3d12Backend + ?Sized>(&mut self, backend: &B) {
        // Views borrow the root's resource.
        if self.parent.is_none() {
            if let Some(native) = self.native {
                backend.release_resource(native);
            }
        }
        self.native = None;
        self.srv = None;
        self.rtv = None;
        self.dsv = None;
    }

    pub fn dispose<B: D3d12Backend + ?Sized>(&mut self, backend: &B) {
        self.release(backend);
        self.lifetime = LifetimeState::Disposed;
    }
}

impl<B: D3d12Backend + ?Sized> DeviceChild<ResourceContext<'_, B>> for D3d12Texture {
    fn on_destroyed(&mut self, ctx: &mut ResourceContext<'_, B>) {
        if self.lifetime == LifetimeState::Active {
            self.release(ctx.backend);
            self.lifetime = LifetimeState::Destroyed;
        }
    }

    fn on_recreate(&mut self, ctx: &mut ResourceContext<'_, B>) -> Result<bool> {
        if self.lifetime != LifetimeState::Destroyed {
            return Ok(true);
        }
        // Views come back through `adopt_parent`.
        if self.parent.is_some() {
            return Ok(true);
        }
        self.allocate(ctx)?;
        self.lifetime = LifetimeState::Active;
        let desc = &self.description;
        let is_target = desc.is_render_target() || desc.is_depth_stencil();
        let reloadable = matches!(desc.usage, GraphicsResourceUsage::Default | GraphicsResourceUsage::Immutable);
        Ok(is_target || !reloadable)
    }

    fn lifetime_state(&self) -> LifetimeState {
        self.lifetime
    }
}

#[derive(Debug)]
pub struct D3d12Buffer {
    description: BufferDescription,
    pub(crate) native: Option<NativeResource>,
    pub(crate) heap: HeapType,
    pub(crate) state: ResourceStates,
    pub(crate) cbv: Option<CpuDescriptor>,
    pub(crate) staging_fence_value: u64,
    lifetime: LifetimeState,
}

impl D3d12Buffer {
    pub fn create<B: D3d12Backend + ?Sized>(ctx: &ResourceContext<'_, B>, description: BufferDescription) -> Result<Self> {
        let (heap, state) = match description.usage {
            GraphicsResourceUsage::Staging => (HeapType::Readback, ResourceStates::COPY_DEST),
            // Dynamic writes go through upload memory and a copy on unmap.
            _ => (HeapType::Default, ResourceStates::COMMON),
        };
        let mut buffer = Self {
            description,
            native: None,
            heap,
            state,
            cbv: None,
            staging_fence_value: 0,
            lifetime: LifetimeState::Active,
        };
        buffer.allocate(ctx)?;
        Ok(buffer)
    }

    fn native_size(&self) -> u64 {
        let size = u64::from(self.description.size_in_bytes);
        if self.description.flags.contains(BufferFlags::CONSTANT_BUFFER) {
            size.div_ceil(CONSTANT_BUFFER_ALIGNMENT) * CONSTANT_BUFFER_ALIGNMENT
        } else {
            size
        }
    }

    fn allocate<B: D3d12Backend + ?Sized>(&mut self, ctx: &ResourceContext<'_, B>) -> Result<()> {
        let size = self.native_size();
        let native = ctx
            .backend
            .create_committed_resource(&ResourceDesc::buffer(size), self.heap, self.state)
            .with_context(|| format!("creating {size}-byte buffer"))?;
        self.native = Some(native);
        if self.description.flags.contains(BufferFlags::CONSTANT_BUFFER) {
            let slot = ctx.descriptors.srv.allocate(ctx.backend, 1)?;
            ctx.backend.create_constant_buffer_view(native, 0, size as u32, slot);
            self.cbv = Some(slot);
        }
        Ok(())
    }

    pub fn description(&self) -> &BufferDescription {
        &self.description
    }

    pub fn size(&self) -> u64 {
        u64::from(self.description.size_in_bytes)
    }

    pub fn native_resource(&self) -> Option<NativeResource> {
        self.native
    }

    pub fn state(&self) -> ResourceStates {
        self.state
    }

    pub fn constant_buffer_view(&self) -> Option<CpuDescriptor> {
        self.cbv
    }

    pub fn is_staging(&self) -> bool {
        self.heap == HeapType::Readback
    }

    fn release<B: D3d12Backend + ?Sized>(&mut self, backend: &B) {
        if let Some(native) = self.native.take() {
            backend.release_resource(native);
        }
        self.cbv = None;
    }

    pub fn dispose<B: D3d12Backend + ?Sized>(&mut self, backend: &B) {
        self.release(backend);
        self.lifetime = LifetimeState::Disposed;
    }
}

impl<B: D3d12Backend + ?Sized> DeviceChild<ResourceContext<'_, B>> for D3d12Buffer {
    fn on_destroyed(&mut self, ctx: &mut ResourceContext<'_, B>) {
        if self.lifetime == LifetimeState::Active {
            self.release(ctx.backend);
            self.lifetime = LifetimeState::Destroyed;
        }
    }

    fn on_recreate(&mut self, ctx: &mut ResourceContext<'_, B>) -> Result<bool> {
        if self.lifetime != LifetimeState::Destroyed {
            return Ok(true);
        }
        self.allocate(ctx)?;
        self.lifetime = LifetimeState::Active;
        Ok(!matches!(
            self.description.usage,
            GraphicsResourceUsage::Default | GraphicsResourceUsage::Immutable
        ))
    }

    fn lifetime_state(&self) -> LifetimeState {
        self.lifetime
    }
}

#[derive(Debug)]
pub struct D3d12Sampler {
    description: SamplerState,
    pub(crate) descriptor: Option<CpuDescriptor>,
    lifetime: LifetimeState,
}

impl D3d12Sampler {
    pub fn create<B: D3d12Backend + ?Sized>(ctx: &ResourceContext<'_, B>, description: SamplerState) -> Result<Self> {
        let mut sampler = Self {
            description,
            descriptor: None,
            lifetime: LifetimeState::Active,
        };
        sampler.allocate(ctx)?;
        Ok(sampler)
    }

    fn allocate<B: D3d12Backend + ?Sized>(&mut self, ctx: &ResourceContext<'_, B>) -> Result<()> {
        let slot = ctx.descriptors.sampler.allocate(ctx.backend, 1)?;
        ctx.backend.create_sampler(&self.description, slot);
        self.descriptor = Some(slot);
        Ok(())
    }

    pub fn description(&self) -> &SamplerState {
        &self.description
    }

    pub fn descriptor(&self) -> Option<CpuDescriptor> {
        self.descriptor
    }
}

impl<B: D3d12Backend + ?Sized> DeviceChild<ResourceContext<'_, B>> for D3d12Sampler {
    fn on_destroyed(&mut self, _ctx: &mut ResourceContext<'_, B>) {
        if self.lifetime == LifetimeState::Active {
            self.descriptor = None;
            self.lifetime = LifetimeState::Destroyed;
        }
    }

    fn on_recreate(&mut self, ctx: &mut ResourceContext<'_, B>) -> Result<bool> {
        if self.lifetime == LifetimeState::Destroyed {
            self.allocate(ctx)?;
            self.lifetime = LifetimeState::Active;
        }
        Ok(true)
    }

    fn lifetime_state(&self) -> LifetimeState {
        self.lifetime
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soft::SoftD3d12;
    use gfx_core::GraphicsProfile;
    use rstest::rstest;

    fn backend() -> SoftD3d12 {
        let soft = SoftD3d12::new();
        soft.open(GraphicsProfile::Level_11_0, false).unwrap();
        soft
    }

    #[rstest]
    #[case(TextureFlags::RENDER_TARGET, ResourceStates::RENDER_TARGET)]
    #[case(TextureFlags::DEPTH_STENCIL, ResourceStates::DEPTH_WRITE)]
    #[case(TextureFlags::SHADER_RESOURCE, ResourceStates::COMMON)]
    fn initial_state_follows_flags(#[case] flags: TextureFlags, #[case] state: ResourceStates) {
        let format = if flags.contains(TextureFlags::DEPTH_STENCIL) {
            PixelFormat::Depth24UnormStencil8
        } else {
            PixelFormat::Rgba8Unorm
        };
        let desc = TextureDescription::new_2d(4, 4, format, flags);
        assert_eq!(initial_texture_state(&desc), state);
        assert_eq!(initial_texture_state(&desc.to_staging()), ResourceStates::COPY_DEST);
    }

    #[test]
    fn views_are_created_per_flag() {
        let soft = backend();
        let descriptors = DescriptorAllocators::new(&soft, 16);
        let ctx = ResourceContext {
            backend: &soft,
            descriptors: &descriptors,
        };
        let flags = TextureFlags::RENDER_TARGET | TextureFlags::SHADER_RESOURCE;
        let texture = D3d12Texture::create(&ctx, TextureDescription::new_2d(8, 8, PixelFormat::Rgba8Unorm, flags)).unwrap();
        assert!(texture.shader_resource_view().is_some());
        assert!(texture.render_target_view().is_some());
        assert!(texture.depth_stencil_view().is_none());
        assert_eq!(texture.state(), ResourceStates::RENDER_TARGET);
    }

    #[test]
    fn staging_texture_is_a_readback_buffer() {
        let soft = backend();
        let descriptors = DescriptorAllocators::new(&soft, 16);
        let ctx = ResourceContext {
            backend: &soft,
            descriptors: &descriptors,
        };
        let desc = TextureDescription::new_2d(3, 2, PixelFormat::Rgba8Unorm, TextureFlags::empty()).to_staging();
        let texture = D3d12Texture::create(&ctx, desc).unwrap();
        assert!(texture.is_staging());
        assert_eq!(texture.footprint(0).map(|f| f.row_pitch), Some(256));
        assert_eq!(soft.resource_size(texture.native_resource().unwrap()), Some(512));
    }

    #[test]
    fn sampled_default_texture_loses_its_contents() {
        let soft = backend();
        let descriptors = DescriptorAllocators::new(&soft, 16);
        let mut ctx = ResourceContext {
            backend: &soft,
            descriptors: &descriptors,
        };
        let desc = TextureDescription::new_2d(4, 4, PixelFormat::Rgba8Unorm, TextureFlags::SHADER_RESOURCE);
        let mut texture = D3d12Texture::create(&ctx, desc).unwrap();
        texture.on_destroyed(&mut ctx);
        assert_eq!(DeviceChild::<ResourceContext<'_, SoftD3d12>>::lifetime_state(&texture), LifetimeState::Destroyed);
        assert!(texture.native_resource().is_none());

        assert!(!texture.on_recreate(&mut ctx).unwrap());
        assert!(texture.native_resource().is_some());
        assert_eq!(DeviceChild::<ResourceContext<'_, SoftD3d12>>::lifetime_state(&texture), LifetimeState::Active);
    }

    #[test]
    fn constant_buffers_are_padded() {
        let soft = backend();
        let descriptors = DescriptorAllocators::new(&soft, 16);
        let ctx = ResourceContext {
            backend: &soft,
            descriptors: &descriptors,
        };
        let desc = BufferDescription::new(100, BufferFlags::CONSTANT_BUFFER, GraphicsResourceUsage::Dynamic);
        let buffer = D3d12Buffer::create(&ctx, desc).unwrap();
        assert_eq!(soft.resource_size(buffer.native_resource().unwrap()), Some(256));
        assert!(buffer.constant_buffer_view().is_some());
        assert_eq!(buffer.size(), 100);
    }
}
