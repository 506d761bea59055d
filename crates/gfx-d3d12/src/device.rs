//! The Direct3D 12 graphics device.
//!
//! [`D3d12Device`] is shared between threads behind an `Arc`: resource
//! arenas sit behind read-write locks, submission and pools behind mutexes.
//! Commands are recorded on [`CommandList`]s created from the device and
//! submitted with [`D3d12Device::execute_command_list`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use gfx_core::resource::compute_pitch;
use gfx_core::{
    Arena, BufferDescription, DeviceChild, DeviceConfig, DeviceId, DeviceStatusMonitor, FrameStats,
    GraphicsDeviceStatus, GraphicsError, GraphicsProfile, Handle, SamplerState,
    TextureDescription, TextureViewDescription,
};
use parking_lot::{MappedRwLockReadGuard, Mutex, RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};

use crate::backend::{
    Command, CopyLocation, D3d12Backend, DescriptorHeapKind, NativeCommandAllocator, NativeCommandList,
    NativeHeap, NativeResource, PlacedFootprint, ResourceStates,
};
use crate::command_list::{CommandList, CompiledCommandList};
use crate::descriptor::{DescriptorPool, DescriptorSet};
use crate::fence::FenceTracker;
use crate::format::{PLACEMENT_ALIGNMENT, ROW_PITCH_ALIGNMENT};
use crate::pool::ResourcePool;
use crate::resource::{D3d12Buffer, D3d12Sampler, D3d12Texture, DescriptorAllocators, ResourceContext};
use crate::upload::{TemporaryResources, UploadAllocation, UploadAllocator};

/// `DXGI_ERROR_*` codes returned by `GetDeviceRemovedReason`.
mod removed_reason {
    pub const INVALID_CALL: u32 = 0x887A_0001;
    pub const DEVICE_REMOVED: u32 = 0x887A_0005;
    pub const DEVICE_HUNG: u32 = 0x887A_0006;
    pub const DEVICE_RESET: u32 = 0x887A_0007;
    pub const DRIVER_INTERNAL_ERROR: u32 = 0x887A_0020;
}

/// Device status for a `GetDeviceRemovedReason` result.
pub fn status_from_removed_reason(reason: i32) -> GraphicsDeviceStatus {
    match reason as u32 {
        removed_reason::DEVICE_REMOVED => GraphicsDeviceStatus::Removed,
        removed_reason::DEVICE_RESET => GraphicsDeviceStatus::Reset,
        removed_reason::DEVICE_HUNG => GraphicsDeviceStatus::Hung,
        removed_reason::DRIVER_INTERNAL_ERROR => GraphicsDeviceStatus::InternalError,
        removed_reason::INVALID_CALL => GraphicsDeviceStatus::InvalidCall,
        _ if reason < 0 => GraphicsDeviceStatus::Reset,
        _ => GraphicsDeviceStatus::Normal,
    }
}

/// Resources whose contents did not survive a device reset.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LostContents {
    pub textures: Vec<Handle<D3d12Texture>>,
    pub buffers: Vec<Handle<D3d12Buffer>>,
}

impl LostContents {
    pub fn is_empty(&self) -> bool {
        self.textures.is_empty() && self.buffers.is_empty()
    }
}

/// A texture or a buffer, for operations that accept either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum D3d12Resource {
    Texture(Handle<D3d12Texture>),
    Buffer(Handle<D3d12Buffer>),
}

impl From<Handle<D3d12Texture>> for D3d12Resource {
    fn from(handle: Handle<D3d12Texture>) -> Self {
        D3d12Resource::Texture(handle)
    }
}

impl From<Handle<D3d12Buffer>> for D3d12Resource {
    fn from(handle: Handle<D3d12Buffer>) -> Self {
        D3d12Resource::Buffer(handle)
    }
}

#[derive(Debug, Clone, Copy)]
struct CopyCommands {
    allocator: NativeCommandAllocator,
    list: NativeCommandList,
}

pub struct D3d12Device<B: D3d12Backend> {
    id: DeviceId,
    backend: Arc<B>,
    config: DeviceConfig,
    profile: GraphicsProfile,
    pub(crate) fence: FenceTracker,
    pub(crate) command_allocators: ResourcePool<NativeCommandAllocator>,
    pub(crate) command_lists: ResourcePool<NativeCommandList>,
    pub(crate) srv_heaps: ResourcePool<NativeHeap>,
    pub(crate) sampler_heaps: ResourcePool<NativeHeap>,
    pub(crate) descriptors: DescriptorAllocators,
    pub(crate) upload: Mutex<UploadAllocator>,
    pub(crate) temporaries: TemporaryResources,
    pub(crate) textures: RwLock<Arena<D3d12Texture>>,
    pub(crate) buffers: RwLock<Arena<D3d12Buffer>>,
    pub(crate) samplers: RwLock<Arena<D3d12Sampler>>,
    copy_commands: Mutex<Option<CopyCommands>>,
    status: DeviceStatusMonitor,
    pub(crate) stats: Mutex<FrameStats>,
    frame_counter: AtomicU64,
}

impl<B: D3d12Backend> D3d12Device<B> {
    /// Open the native device at the first configured profile it accepts.
    ///
    /// Levels below 11.0 are raised to 11.0, the minimum D3D12 runs at.
    pub fn new(backend: Arc<B>, config: DeviceConfig) -> Result<Arc<Self>> {
        let profile = open_device(&*backend, &config)?;
        info!(adapter = %backend.adapter_name(), ?profile, "created D3D12 device");

        let descriptors = DescriptorAllocators::new(&*backend, config.descriptors_per_cpu_heap);
        Ok(Arc::new(Self {
            id: DeviceId::next(),
            upload: Mutex::new(UploadAllocator::new(config.upload_buffer_size)),
            backend,
            config,
            profile,
            fence: FenceTracker::new(),
            command_allocators: ResourcePool::new(),
            command_lists: ResourcePool::new(),
            srv_heaps: ResourcePool::new(),
            sampler_heaps: ResourcePool::new(),
            descriptors,
            temporaries: TemporaryResources::new(),
            textures: RwLock::new(Arena::new()),
            buffers: RwLock::new(Arena::new()),
            samplers: RwLock::new(Arena::new()),
            copy_commands: Mutex::new(None),
            status: DeviceStatusMonitor::new(),
            stats: Mutex::new(FrameStats::default()),
            frame_counter: AtomicU64::new(0),
        }))
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Profile the device was opened with.
    pub fn profile(&self) -> GraphicsProfile {
        self.profile
    }

    pub fn frame_counter(&self) -> u64 {
        self.frame_counter.load(Ordering::Acquire)
    }

    pub fn frame_stats(&self) -> FrameStats {
        *self.stats.lock()
    }

    pub fn texture(&self, handle: Handle<D3d12Texture>) -> Option<MappedRwLockReadGuard<'_, D3d12Texture>> {
        RwLockReadGuard::try_map(self.textures.read(), |arena| arena.get(handle)).ok()
    }

    pub fn buffer(&self, handle: Handle<D3d12Buffer>) -> Option<MappedRwLockReadGuard<'_, D3d12Buffer>> {
        RwLockReadGuard::try_map(self.buffers.read(), |arena| arena.get(handle)).ok()
    }

    pub fn sampler(&self, handle: Handle<D3d12Sampler>) -> Option<MappedRwLockReadGuard<'_, D3d12Sampler>> {
        RwLockReadGuard::try_map(self.samplers.read(), |arena| arena.get(handle)).ok()
    }

    fn resource_context(&self) -> ResourceContext<'_, B> {
        ResourceContext {
            backend: &*self.backend,
            descriptors: &self.descriptors,
        }
    }

    /// Start a new frame: reset statistics and release temporary resources
    /// the GPU finished with.
    pub fn begin_frame(&self) {
        self.frame_counter.fetch_add(1, Ordering::AcqRel);
        self.stats.lock().reset();
        self.release_temporary_resources();
    }

    pub(crate) fn release_temporary_resources(&self) {
        let completed = self.fence.completed_value(&*self.backend);
        self.temporaries.release_completed(&*self.backend, completed);
    }

    // ---- Command submission

    pub fn create_command_list(self: &Arc<Self>) -> Result<CommandList<B>> {
        CommandList::new(Arc::clone(self))
    }

    /// Submit a closed command list. Its allocator and heaps become
    /// reusable once the returned fence value completes.
    pub fn execute_command_list(&self, compiled: CompiledCommandList) -> Result<u64> {
        let value = self.fence.execute(&*self.backend, compiled.list)?;
        self.command_allocators.recycle_object(value, compiled.allocator);
        for heap in compiled.srv_heaps {
            self.srv_heaps.recycle_object(value, heap);
        }
        for heap in compiled.sampler_heaps {
            self.sampler_heaps.recycle_object(value, heap);
        }
        Ok(value)
    }

    pub fn next_fence_value(&self) -> u64 {
        self.fence.next_value()
    }

    pub fn is_fence_complete(&self, value: u64) -> bool {
        self.fence.is_complete(&*self.backend, value)
    }

    pub fn wait_for_fence(&self, value: u64) -> Result<()> {
        self.fence.wait(&*self.backend, value)
    }

    /// Block until the GPU finished everything submitted so far.
    pub fn wait_idle(&self) -> Result<()> {
        self.fence.wait_idle(&*self.backend)
    }

    pub(crate) fn get_command_allocator(&self) -> Result<NativeCommandAllocator> {
        let backend = &*self.backend;
        self.command_allocators.get_object(
            self.fence.completed_value(backend),
            || backend.create_command_allocator(),
            |allocator| backend.reset_command_allocator(*allocator),
        )
    }

    /// An open native list recording into `allocator`.
    pub(crate) fn get_native_command_list(&self, allocator: NativeCommandAllocator) -> Result<NativeCommandList> {
        let backend = &*self.backend;
        self.command_lists.get_object(
            self.fence.completed_value(backend),
            || backend.create_command_list(allocator),
            |list| backend.reset_command_list(*list, allocator),
        )
    }

    pub(crate) fn get_srv_heap(&self) -> Result<NativeHeap> {
        self.get_shader_visible_heap(&self.srv_heaps, DescriptorHeapKind::CbvSrvUav, self.config.srv_heap_size)
    }

    pub(crate) fn get_sampler_heap(&self) -> Result<NativeHeap> {
        self.get_shader_visible_heap(&self.sampler_heaps, DescriptorHeapKind::Sampler, self.config.sampler_heap_size)
    }

    fn get_shader_visible_heap(
        &self,
        pool: &ResourcePool<NativeHeap>,
        kind: DescriptorHeapKind,
        capacity: u32,
    ) -> Result<NativeHeap> {
        let backend = &*self.backend;
        pool.get_object(
            self.fence.completed_value(backend),
            || {
                debug!(?kind, capacity, "new shader-visible descriptor heap");
                backend.create_descriptor_heap(kind, capacity, true)
            },
            |_| Ok(()),
        )
    }

    /// Record `record` on the device's copy list, submit it and wait.
    fn with_copy_list(&self, record: impl FnOnce(NativeCommandList) -> Result<()>) -> Result<()> {
        let backend = &*self.backend;
        let mut slot = self.copy_commands.lock();
        let commands = match *slot {
            Some(commands) => {
                backend.reset_command_allocator(commands.allocator)?;
                backend.reset_command_list(commands.list, commands.allocator)?;
                commands
            }
            None => {
                let allocator = backend.create_command_allocator()?;
                let list = backend.create_command_list(allocator)?;
                let commands = CopyCommands { allocator, list };
                *slot = Some(commands);
                commands
            }
        };
        record(commands.list)?;
        backend.close_command_list(commands.list)?;
        let value = self.fence.execute(backend, commands.list)?;
        self.fence.wait(backend, value)
    }

    // ---- Resource creation

    /// Create a texture. `initial_data` holds every subresource tightly
    /// packed, mips of the first slice first.
    pub fn create_texture(&self, description: TextureDescription, initial_data: Option<&[u8]>) -> Result<Handle<D3d12Texture>> {
        let mut texture = D3d12Texture::create(&self.resource_context(), description)?;
        if let Some(data) = initial_data {
            self.upload_texture_data(&mut texture, data)
                .context("uploading initial texture data")?;
        }
        Ok(self.textures.write().insert(texture))
    }

    fn upload_texture_data(&self, texture: &mut D3d12Texture, data: &[u8]) -> Result<()> {
        let native = texture.native.ok_or(GraphicsError::StaleHandle("texture"))?;
        let desc = *texture.description();

        if texture.is_staging() {
            let base = self.backend.map(native)?;
            let copied = for_each_subresource(&desc, data, |sub, rows, row_bytes, _| {
                let footprint = texture
                    .footprint(sub)
                    .ok_or_else(|| anyhow!("staging texture has no footprint for subresource {sub}"))?;
                for (row, bytes) in rows.chunks(row_bytes as usize).enumerate() {
                    let offset = footprint.offset as usize + row * footprint.row_pitch as usize;
                    // SAFETY: the footprint lies inside the mapped readback buffer.
                    unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), base.add(offset), bytes.len()) };
                }
                Ok(())
            });
            self.backend.unmap(native);
            return copied;
        }

        let state = texture.state;
        self.with_copy_list(|list| {
            if state != ResourceStates::COPY_DEST {
                self.backend.record(list, barrier(native, state, ResourceStates::COPY_DEST));
            }
            for_each_subresource(&desc, data, |sub, rows, row_bytes, (width, height, depth)| {
                let row_count = rows.len() as u32 / row_bytes;
                let footprint = self.write_upload_rows(rows, row_bytes, row_bytes, row_count, |offset, row_pitch| PlacedFootprint {
                    offset,
                    format: desc.format,
                    width,
                    height,
                    depth,
                    row_pitch,
                })?;
                self.backend.record(
                    list,
                    Command::CopyTextureRegion {
                        destination: CopyLocation::Subresource { resource: native, index: sub },
                        x: 0,
                        y: 0,
                        z: 0,
                        source: footprint,
                        region: None,
                    },
                );
                Ok(())
            })?;
            if state != ResourceStates::COPY_DEST {
                self.backend.record(list, barrier(native, ResourceStates::COPY_DEST, state));
            }
            Ok(())
        })
    }

    /// Upload memory that stays valid until the next submission completes.
    pub(crate) fn allocate_upload(&self, size: u64, alignment: u64) -> Result<UploadAllocation> {
        self.upload
            .lock()
            .allocate(&*self.backend, size, alignment, &self.temporaries, self.fence.next_value())
    }

    /// Copy `row_count` rows of `row_bytes`, `source_pitch` bytes apart in
    /// `data`, into upload memory with pitch-aligned rows and describe the
    /// result as a copy source.
    pub(crate) fn write_upload_rows(
        &self,
        data: &[u8],
        source_pitch: u32,
        row_bytes: u32,
        row_count: u32,
        footprint: impl FnOnce(u64, u32) -> PlacedFootprint,
    ) -> Result<CopyLocation> {
        let needed = u64::from(source_pitch) * u64::from(row_count.saturating_sub(1)) + u64::from(row_bytes);
        if row_count > 0 && (data.len() as u64) < needed {
            return Err(GraphicsError::invalid(format!("{} bytes for {row_count} rows of {row_bytes}", data.len())).into());
        }
        let row_pitch = row_bytes.div_ceil(ROW_PITCH_ALIGNMENT) * ROW_PITCH_ALIGNMENT;
        let size = u64::from(row_pitch) * u64::from(row_count);
        let allocation = self.allocate_upload(size, PLACEMENT_ALIGNMENT)?;
        for row in 0..row_count as usize {
            let start = row * source_pitch as usize;
            let bytes = &data[start..start + row_bytes as usize];
            // SAFETY: the allocation holds `row_count` rows of `row_pitch` bytes.
            unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), allocation.data.add(row * row_pitch as usize), bytes.len())
            };
        }
        Ok(CopyLocation::Footprint {
            resource: allocation.resource,
            footprint: footprint(allocation.offset, row_pitch),
        })
    }

    pub fn create_texture_view(&self, parent: Handle<D3d12Texture>, view: TextureViewDescription) -> Result<Handle<D3d12Texture>> {
        let mut textures = self.textures.write();
        let parent_texture = textures.get(parent).ok_or(GraphicsError::StaleHandle("texture"))?;
        let texture = D3d12Texture::view(&self.resource_context(), parent, parent_texture, view)?;
        Ok(textures.insert(texture))
    }

    pub fn create_buffer(&self, description: BufferDescription, initial_data: Option<&[u8]>) -> Result<Handle<D3d12Buffer>> {
        let buffer = D3d12Buffer::create(&self.resource_context(), description)?;
        if let Some(data) = initial_data {
            let native = buffer.native.ok_or(GraphicsError::StaleHandle("buffer"))?;
            let data = &data[..data.len().min(buffer.size() as usize)];
            if buffer.is_staging() {
                let base = self.backend.map(native)?;
                // SAFETY: `data` is no longer than the buffer.
                unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), base, data.len()) };
                self.backend.unmap(native);
            } else {
                self.upload_buffer_data(native, buffer.state, 0, data)
                    .context("uploading initial buffer data")?;
            }
        }
        Ok(self.buffers.write().insert(buffer))
    }

    fn upload_buffer_data(&self, native: NativeResource, state: ResourceStates, offset: u64, data: &[u8]) -> Result<()> {
        let allocation = self.allocate_upload(data.len() as u64, 1)?;
        // SAFETY: the allocation is `data.len()` bytes.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), allocation.data, data.len()) };
        self.with_copy_list(|list| {
            self.backend.record(list, barrier(native, state, ResourceStates::COPY_DEST));
            self.backend.record(
                list,
                Command::CopyBufferRegion {
                    destination: native,
                    destination_offset: offset,
                    source: allocation.resource,
                    source_offset: allocation.offset,
                    size: data.len() as u64,
                },
            );
            self.backend.record(list, barrier(native, ResourceStates::COPY_DEST, state));
            Ok(())
        })
    }

    pub fn create_sampler_state(&self, description: SamplerState) -> Result<Handle<D3d12Sampler>> {
        let sampler = D3d12Sampler::create(&self.resource_context(), description)?;
        Ok(self.samplers.write().insert(sampler))
    }

    pub fn create_descriptor_pool(&self, srv_capacity: u32, sampler_capacity: u32) -> Result<DescriptorPool> {
        DescriptorPool::new(&*self.backend, srv_capacity, sampler_capacity)
    }

    // ---- Descriptor set writes

    pub fn set_shader_resource_view(&self, set: &DescriptorSet, slot: usize, texture: Handle<D3d12Texture>) -> Result<()> {
        let srv = self
            .texture(texture)
            .ok_or(GraphicsError::StaleHandle("texture"))?
            .shader_resource_view()
            .ok_or_else(|| GraphicsError::invalid("texture has no shader resource view"))?;
        set.set_shader_resource_view(&*self.backend, slot, srv)
    }

    pub fn set_constant_buffer(&self, set: &DescriptorSet, slot: usize, buffer: Handle<D3d12Buffer>) -> Result<()> {
        let cbv = self
            .buffer(buffer)
            .ok_or(GraphicsError::StaleHandle("buffer"))?
            .constant_buffer_view()
            .ok_or_else(|| GraphicsError::invalid("buffer is not a constant buffer"))?;
        set.set_constant_buffer(&*self.backend, slot, cbv)
    }

    pub fn set_sampler_state(&self, set: &DescriptorSet, slot: usize, sampler: Handle<D3d12Sampler>) -> Result<()> {
        let descriptor = self
            .sampler(sampler)
            .ok_or(GraphicsError::StaleHandle("sampler"))?
            .descriptor()
            .ok_or(GraphicsError::StaleHandle("sampler"))?;
        set.set_sampler_state(&*self.backend, slot, descriptor)
    }

    // ---- Destruction

    /// Destroy a texture and every view created from it. Native memory is
    /// released once the GPU is done with it.
    pub fn destroy_texture(&self, handle: Handle<D3d12Texture>) -> Result<()> {
        let mut textures = self.textures.write();
        let texture = textures.remove(handle).ok_or(GraphicsError::StaleHandle("texture"))?;
        if texture.parent().is_none() {
            textures.retain(|_, t| t.parent() != Some(handle));
            if let Some(native) = texture.native_resource() {
                self.temporaries.enqueue(self.fence.next_value(), native);
            }
        }
        Ok(())
    }

    pub fn destroy_buffer(&self, handle: Handle<D3d12Buffer>) -> Result<()> {
        let buffer = self
            .buffers
            .write()
            .remove(handle)
            .ok_or(GraphicsError::StaleHandle("buffer"))?;
        if let Some(native) = buffer.native_resource() {
            self.temporaries.enqueue(self.fence.next_value(), native);
        }
        Ok(())
    }

    pub fn destroy_sampler(&self, handle: Handle<D3d12Sampler>) -> Result<()> {
        self.samplers
            .write()
            .remove(handle)
            .map(drop)
            .ok_or_else(|| GraphicsError::StaleHandle("sampler").into())
    }

    // ---- Device loss

    pub fn status(&self) -> GraphicsDeviceStatus {
        self.status
            .poll(|| status_from_removed_reason(self.backend.device_removed_reason()))
    }

    /// The next [`status`](Self::status) reports `Reset` once.
    pub fn simulate_reset(&self) {
        self.status.simulate_reset();
    }

    /// Release every native object. Handles stay valid and get new native
    /// objects in [`on_recreate`](Self::on_recreate). Command lists must be
    /// dropped first.
    pub fn on_destroyed(&self) {
        let mut ctx = self.resource_context();
        for (_, texture) in self.textures.write().iter_mut() {
            texture.on_destroyed(&mut ctx);
        }
        for (_, buffer) in self.buffers.write().iter_mut() {
            buffer.on_destroyed(&mut ctx);
        }
        for (_, sampler) in self.samplers.write().iter_mut() {
            sampler.on_destroyed(&mut ctx);
        }
        self.release_device_objects();
        info!("D3D12 device resources destroyed");
    }

    fn release_device_objects(&self) {
        let backend = &*self.backend;
        if let Some(commands) = self.copy_commands.lock().take() {
            backend.release_command_list(commands.list);
            backend.release_command_allocator(commands.allocator);
        }
        for list in self.command_lists.drain() {
            backend.release_command_list(list);
        }
        for allocator in self.command_allocators.drain() {
            backend.release_command_allocator(allocator);
        }
        for heap in self.srv_heaps.drain().into_iter().chain(self.sampler_heaps.drain()) {
            backend.release_descriptor_heap(heap.id);
        }
        self.upload.lock().release(backend);
        self.temporaries.release_all(backend);
        self.descriptors.release(backend);
    }

    /// Reopen the native device and recreate every resource. Returns the
    /// resources whose contents must be uploaded again.
    pub fn on_recreate(&self) -> Result<LostContents> {
        self.backend
            .open(self.profile.max(GraphicsProfile::Level_11_0), self.config.is_debug())
            .context("reopening D3D12 device")?;
        let mut ctx = self.resource_context();
        let mut lost = LostContents::default();

        let mut textures = self.textures.write();
        // Roots first so views can pick up the new resources.
        let roots: Vec<_> = textures.iter().filter(|(_, t)| t.parent().is_none()).map(|(h, _)| h).collect();
        for handle in roots {
            if let Some(texture) = textures.get_mut(handle) {
                if !texture.on_recreate(&mut ctx)? {
                    lost.textures.push(handle);
                }
            }
        }
        let views: Vec<_> = textures.iter().filter_map(|(h, t)| t.parent().map(|p| (h, p))).collect();
        for (view, parent) in views {
            if let Some((view, parent)) = textures.pair_mut(view, parent) {
                view.adopt_parent(&ctx, parent)?;
            }
        }
        drop(textures);

        for (handle, buffer) in self.buffers.write().iter_mut() {
            if !buffer.on_recreate(&mut ctx)? {
                lost.buffers.push(handle);
            }
        }
        for (_, sampler) in self.samplers.write().iter_mut() {
            sampler.on_recreate(&mut ctx)?;
        }
        info!(
            textures = lost.textures.len(),
            buffers = lost.buffers.len(),
            "D3D12 device resources recreated"
        );
        Ok(lost)
    }

    /// Wait for the GPU and release everything the device owns.
    pub fn dispose(&self) -> Result<()> {
        self.wait_idle()?;
        let backend = &*self.backend;
        for (_, mut texture) in self.textures.write().drain() {
            texture.dispose(backend);
        }
        for (_, mut buffer) in self.buffers.write().drain() {
            buffer.dispose(backend);
        }
        self.samplers.write().drain();
        self.release_device_objects();
        debug!("D3D12 device disposed");
        Ok(())
    }
}

/// Try each configured profile in order; the last failure is returned when
/// none opens.
fn open_device<B: D3d12Backend + ?Sized>(backend: &B, config: &DeviceConfig) -> Result<GraphicsProfile> {
    let mut last_error = None;
    for &profile in &config.profiles {
        let level = profile.max(GraphicsProfile::Level_11_0);
        match backend.open(level, config.is_debug()) {
            Ok(()) => return Ok(level),
            Err(err) => {
                warn!(?level, error = %err, "D3D12 device creation failed; trying next profile");
                last_error = Some(err);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| GraphicsError::unsupported("no graphics profile requested").into()))
}

pub(crate) fn barrier(resource: NativeResource, before: ResourceStates, after: ResourceStates) -> Command {
    Command::ResourceBarrier { resource, before, after }
}

/// Walk tightly packed subresource data in subresource order, handing each
/// subresource's bytes, row size and mip extent to `visit`.
fn for_each_subresource(
    desc: &TextureDescription,
    data: &[u8],
    mut visit: impl FnMut(u32, &[u8], u32, (u32, u32, u32)) -> Result<()>,
) -> Result<()> {
    let mut offset = 0usize;
    for slice in 0..desc.array_size {
        for mip in 0..desc.mip_levels {
            let (width, height, depth) = (desc.mip_width(mip), desc.mip_height(mip), desc.mip_depth(mip));
            let (row_bytes, slice_bytes) = compute_pitch(desc.format, width, height);
            let size = (slice_bytes * depth) as usize;
            if offset + size > data.len() {
                // Partial initial data fills the leading subresources only.
                return Ok(());
            }
            let sub = gfx_core::resource::subresource_index(mip, slice, desc.mip_levels);
            visit(sub, &data[offset..offset + size], row_bytes, (width, height, depth))?;
            offset += size;
        }
    }
    Ok(())
}

impl<B: D3d12Backend> D3d12Device<B> {
    pub(crate) fn record_draw(&self, primitives: u32) {
        self.stats.lock().record_draw(primitives);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soft::SoftD3d12;
    use gfx_core::{BufferFlags, GraphicsResourceUsage, PixelFormat, TextureFlags};
    use rstest::rstest;

    fn device() -> (Arc<SoftD3d12>, Arc<D3d12Device<SoftD3d12>>) {
        let soft = Arc::new(SoftD3d12::new());
        let device = D3d12Device::new(Arc::clone(&soft), DeviceConfig::default()).unwrap();
        (soft, device)
    }

    #[rstest]
    #[case(0x887A0005u32 as i32, GraphicsDeviceStatus::Removed)]
    #[case(0x887A0007u32 as i32, GraphicsDeviceStatus::Reset)]
    #[case(0x887A0006u32 as i32, GraphicsDeviceStatus::Hung)]
    #[case(0x887A0020u32 as i32, GraphicsDeviceStatus::InternalError)]
    #[case(0x887A0001u32 as i32, GraphicsDeviceStatus::InvalidCall)]
    #[case(0x80004005u32 as i32, GraphicsDeviceStatus::Reset)]
    #[case(0, GraphicsDeviceStatus::Normal)]
    fn removed_reason_maps_to_status(#[case] reason: i32, #[case] status: GraphicsDeviceStatus) {
        assert_eq!(status_from_removed_reason(reason), status);
    }

    #[test]
    fn low_profiles_are_raised_to_11_0() {
        let soft = Arc::new(SoftD3d12::new());
        let config = DeviceConfig::default().with_profiles(vec![GraphicsProfile::Level_10_0]);
        let device = D3d12Device::new(soft, config).unwrap();
        assert_eq!(device.profile(), GraphicsProfile::Level_11_0);
    }

    #[test]
    fn profile_fallback_propagates_the_last_failure() {
        let soft = Arc::new(SoftD3d12::with_max_level(GraphicsProfile::Level_11_0));
        let config = DeviceConfig::default().with_profiles(vec![GraphicsProfile::Level_11_2, GraphicsProfile::Level_11_1]);
        let err = D3d12Device::new(Arc::clone(&soft), config).err().unwrap();
        assert!(format!("{err:#}").contains("Level_11_1"));

        let config = DeviceConfig::default().with_profiles(vec![GraphicsProfile::Level_11_2, GraphicsProfile::Level_11_0]);
        let device = D3d12Device::new(soft, config).unwrap();
        assert_eq!(device.profile(), GraphicsProfile::Level_11_0);
    }

    #[test]
    fn simulated_reset_is_reported_once() {
        let (soft, device) = device();
        assert_eq!(device.status(), GraphicsDeviceStatus::Normal);
        device.simulate_reset();
        assert_eq!(device.status(), GraphicsDeviceStatus::Reset);
        assert_eq!(device.status(), GraphicsDeviceStatus::Normal);

        soft.set_removed_reason(0x887A0005u32 as i32);
        assert_eq!(device.status(), GraphicsDeviceStatus::Removed);
    }

    #[test]
    fn initial_data_reaches_the_texture() {
        let (soft, device) = device();
        let desc = TextureDescription::new_2d(2, 2, PixelFormat::Rgba8Unorm, TextureFlags::SHADER_RESOURCE);
        let data: Vec<u8> = (0..16).collect();
        let handle = device.create_texture(desc, Some(&data)).unwrap();

        let native = device.texture(handle).unwrap().native_resource().unwrap();
        assert_eq!(soft.subresource_data(native, 0).unwrap(), data);
        // The copy list restored the tracked state.
        assert_eq!(device.texture(handle).unwrap().state(), ResourceStates::COMMON);
        assert!(soft.validation_errors().is_empty());
    }

    #[test]
    fn initial_data_reaches_default_buffers() {
        let (soft, device) = device();
        let desc = BufferDescription::new(8, BufferFlags::VERTEX_BUFFER, GraphicsResourceUsage::Default);
        let handle = device.create_buffer(desc, Some(&[1, 2, 3, 4, 5, 6, 7, 8])).unwrap();
        let native = device.buffer(handle).unwrap().native_resource().unwrap();
        assert_eq!(soft.buffer_data(native).unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn destroying_a_texture_removes_its_views() {
        let (soft, device) = device();
        let desc = TextureDescription::new_2d(4, 4, PixelFormat::Rgba8Unorm, TextureFlags::SHADER_RESOURCE).with_mip_levels(2);
        let texture = device.create_texture(desc, None).unwrap();
        let view = device
            .create_texture_view(texture, TextureViewDescription::single(0, 1))
            .unwrap();
        assert_eq!(device.texture(view).unwrap().width(), 2);
        let native = device.texture(texture).unwrap().native_resource().unwrap();

        device.destroy_texture(texture).unwrap();
        assert!(device.texture(view).is_none());
        // Released after the GPU caught up.
        assert!(soft.resource_size(native).is_some());
        device.wait_idle().unwrap();
        device.begin_frame();
        assert!(soft.resource_size(native).is_none());
    }

    #[test]
    fn reset_recreates_resources_and_reports_lost_contents() {
        let (_soft, device) = device();
        let target = device
            .create_texture(TextureDescription::new_2d(4, 4, PixelFormat::Rgba8Unorm, TextureFlags::RENDER_TARGET), None)
            .unwrap();
        let sampled = device
            .create_texture(TextureDescription::new_2d(4, 4, PixelFormat::Rgba8Unorm, TextureFlags::SHADER_RESOURCE), None)
            .unwrap();
        let view = device.create_texture_view(sampled, TextureViewDescription::default()).unwrap();
        let sampler = device.create_sampler_state(SamplerState::LINEAR_WRAP).unwrap();

        device.on_destroyed();
        assert!(device.texture(target).unwrap().native_resource().is_none());
        assert!(device.sampler(sampler).unwrap().descriptor().is_none());

        let lost = device.on_recreate().unwrap();
        assert_eq!(lost.textures, vec![sampled]);
        assert!(device.texture(target).unwrap().render_target_view().is_some());
        assert_eq!(
            device.texture(view).unwrap().native_resource(),
            device.texture(sampled).unwrap().native_resource()
        );
        assert!(device.sampler(sampler).unwrap().descriptor().is_some());
    }
}
