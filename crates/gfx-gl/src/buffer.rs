//! GL buffers.

use anyhow::Result;
use gfx_core::{
    BufferDescription, BufferFlags, DataBox, DeviceChild, GraphicsError, GraphicsResourceUsage,
    LifetimeState, MapMode, MappedResource,
};
use gl::types::{GLbitfield, GLenum, GLuint};
use tracing::{trace, warn};

use crate::api::GlApi;
use crate::driver::GlDriver;
use crate::state::StateTracker;

/// A GL buffer object, a CPU-only block standing in for one, or both.
///
/// On GL ES 2 constant buffers have no native object (uniforms are set
/// one by one) and buffers that cannot be mapped keep a CPU copy that is
/// written back on unmap.
#[derive(Debug)]
pub struct GlBuffer {
    description: BufferDescription,
    /// Target used when binding for draws.
    pub(crate) target: GLenum,
    usage_hint: GLenum,
    pub(crate) buffer_id: GLuint,
    pub(crate) staging_data: Option<Vec<u8>>,
    had_initial_data: bool,
    lifetime: LifetimeState,
}

impl GlBuffer {
    pub fn create<A: GlApi>(
        gl: &GlDriver<A>,
        state: &mut StateTracker,
        description: BufferDescription,
        initial_data: Option<&[u8]>,
    ) -> Result<Self> {
        if let Some(data) = initial_data {
            if data.len() > description.size_in_bytes as usize {
                return Err(GraphicsError::invalid(format!(
                    "initial data is {} bytes, buffer holds {}",
                    data.len(),
                    description.size_in_bytes
                ))
                .into());
            }
        }

        let caps = gl.caps();
        let is_constant = description.flags.contains(BufferFlags::CONSTANT_BUFFER);
        let unmappable = !caps.has_map_buffer
            && matches!(description.usage, GraphicsResourceUsage::Dynamic | GraphicsResourceUsage::Staging);
        let cpu_copy = (is_constant && !caps.has_uniform_buffers) || unmappable;

        let mut buffer = Self {
            description,
            target: buffer_target(description.flags),
            usage_hint: usage_hint(description.usage),
            buffer_id: 0,
            staging_data: None,
            had_initial_data: initial_data.is_some(),
            lifetime: LifetimeState::Active,
        };
        if cpu_copy {
            let mut data = vec![0u8; description.size_in_bytes as usize];
            if let Some(initial) = initial_data {
                data[..initial.len()].copy_from_slice(initial);
            }
            buffer.staging_data = Some(data);
        }
        buffer.allocate(gl, state, initial_data)?;
        Ok(buffer)
    }

    pub fn description(&self) -> &BufferDescription {
        &self.description
    }

    pub fn size(&self) -> usize {
        self.description.size_in_bytes as usize
    }

    pub fn buffer_id(&self) -> GLuint {
        self.buffer_id
    }

    /// CPU copy of the contents, when the buffer keeps one.
    pub fn staging_data(&self) -> Option<&[u8]> {
        self.staging_data.as_deref()
    }

    fn has_native(&self, es2: bool) -> bool {
        // ES2 constant buffers and staging buffers live in CPU memory only.
        let cpu_only = es2
            && (self.description.flags.contains(BufferFlags::CONSTANT_BUFFER)
                || self.description.usage == GraphicsResourceUsage::Staging);
        !(cpu_only && self.staging_data.is_some())
    }

    fn allocate<A: GlApi>(&mut self, gl: &GlDriver<A>, state: &mut StateTracker, data: Option<&[u8]>) -> Result<()> {
        if !self.has_native(gl.caps().is_es2) {
            return Ok(());
        }
        self.buffer_id = gl.gen_buffer();
        let target = bind_for_update(gl, state, self.buffer_id);
        gl.buffer_data(target, self.size(), data, self.usage_hint);
        trace!(id = self.buffer_id, size = self.size(), flags = ?self.description.flags, "created buffer");
        gl.check("create buffer")
    }

    /// Replace the whole contents (or a prefix) of the buffer.
    pub fn update<A: GlApi>(&mut self, gl: &GlDriver<A>, state: &mut StateTracker, data: &[u8]) -> Result<()> {
        self.update_region(gl, state, 0, data)
    }

    pub fn update_region<A: GlApi>(
        &mut self,
        gl: &GlDriver<A>,
        state: &mut StateTracker,
        offset: usize,
        data: &[u8],
    ) -> Result<()> {
        let end = offset + data.len();
        if end > self.size() {
            return Err(GraphicsError::invalid(format!("update of {}..{end} past the end of a {} byte buffer", offset, self.size())).into());
        }
        if let Some(staging) = &mut self.staging_data {
            staging[offset..end].copy_from_slice(data);
        }
        if self.buffer_id == 0 {
            return Ok(());
        }
        let target = bind_for_update(gl, state, self.buffer_id);
        if offset == 0 && data.len() == self.size() {
            gl.buffer_data(target, self.size(), Some(data), self.usage_hint);
        } else {
            gl.buffer_sub_data(target, offset, data);
        }
        gl.check("update buffer")
    }

    /// Map `length` bytes at `offset` (the rest of the buffer when `length`
    /// is zero).
    ///
    /// `WriteDiscard` orphans the storage and never waits. Write maps with
    /// `do_not_wait` are unsynchronized.
    pub fn map<A: GlApi>(
        &mut self,
        gl: &GlDriver<A>,
        state: &mut StateTracker,
        mode: MapMode,
        mut do_not_wait: bool,
        offset: usize,
        length: usize,
    ) -> Result<MappedResource> {
        let length = if length == 0 { self.size().saturating_sub(offset) } else { length };
        if offset + length > self.size() {
            return Err(GraphicsError::invalid("map range past the end of the buffer").into());
        }

        if let Some(staging) = &mut self.staging_data {
            // SAFETY: offset + length is within the vector checked above.
            let pointer = unsafe { staging.as_mut_ptr().add(offset) };
            return Ok(mapping(pointer, offset, length));
        }
        if !gl.caps().has_map_buffer {
            return Err(GraphicsError::unsupported("mapping buffers without a CPU copy on this profile").into());
        }

        let target = bind_for_update(gl, state, self.buffer_id);
        if mode == MapMode::WriteDiscard {
            gl.buffer_data(target, self.size(), None, self.usage_hint);
            do_not_wait = true;
        }

        let mut access: GLbitfield = 0;
        if mode.reads() {
            access |= gl::MAP_READ_BIT;
        }
        if mode.writes() {
            access |= gl::MAP_WRITE_BIT;
        }
        if do_not_wait && !mode.reads() {
            access |= gl::MAP_UNSYNCHRONIZED_BIT;
        }

        let pointer = gl.map_buffer_range(target, offset, length, access);
        if pointer.is_null() {
            return Err(GraphicsError::Native {
                call: "glMapBufferRange",
                code: gl.get_error(),
            }
            .into());
        }
        Ok(mapping(pointer, offset, length))
    }

    pub fn unmap<A: GlApi>(&mut self, gl: &GlDriver<A>, state: &mut StateTracker) -> Result<()> {
        match &self.staging_data {
            Some(staging) => {
                if self.buffer_id != 0 {
                    let target = bind_for_update(gl, state, self.buffer_id);
                    gl.buffer_sub_data(target, 0, staging);
                }
            }
            None => {
                let target = bind_for_update(gl, state, self.buffer_id);
                if !gl.unmap_buffer(target) {
                    warn!(id = self.buffer_id, "buffer contents were lost while mapped");
                }
            }
        }
        gl.check("unmap buffer")
    }

    fn release<A: GlApi>(&mut self, gl: &GlDriver<A>, state: &mut StateTracker) {
        if self.buffer_id != 0 {
            gl.delete_buffer(self.buffer_id);
            state.forget_buffer(self.buffer_id);
            self.buffer_id = 0;
        }
    }

    pub(crate) fn dispose<A: GlApi>(&mut self, gl: &GlDriver<A>, state: &mut StateTracker) {
        self.release(gl, state);
        self.staging_data = None;
        self.lifetime = LifetimeState::Disposed;
    }
}

/// Buffers are recreated through the device, which owns the state tracker.
pub struct BufferContext<'a, A> {
    pub gl: &'a GlDriver<A>,
    pub state: &'a mut StateTracker,
}

impl<A: GlApi> DeviceChild<BufferContext<'_, A>> for GlBuffer {
    fn on_destroyed(&mut self, ctx: &mut BufferContext<'_, A>) {
        if self.lifetime == LifetimeState::Active {
            self.release(ctx.gl, ctx.state);
            self.lifetime = LifetimeState::Destroyed;
        }
    }

    fn on_recreate(&mut self, ctx: &mut BufferContext<'_, A>) -> Result<bool> {
        if self.lifetime != LifetimeState::Destroyed {
            return Ok(true);
        }
        // A CPU copy survives device loss; upload it again.
        let contents = self.staging_data.clone();
        self.allocate(ctx.gl, ctx.state, contents.as_deref())?;
        self.lifetime = LifetimeState::Active;
        Ok(contents.is_some() || !self.had_initial_data)
    }

    fn lifetime_state(&self) -> LifetimeState {
        self.lifetime
    }
}

fn mapping(pointer: *mut u8, offset: usize, length: usize) -> MappedResource {
    MappedResource {
        subresource: 0,
        data: DataBox {
            data_pointer: pointer,
            row_pitch: length as u32,
            slice_pitch: length as u32,
        },
        offset: offset as u64,
        size: length as u64,
    }
}

/// Bind `buffer` somewhere that does not disturb vertex array state.
///
/// ES 2 has no copy targets; the array buffer binding is used and the
/// tracker's shadow kept in sync.
pub(crate) fn bind_for_update<A: GlApi>(gl: &GlDriver<A>, state: &mut StateTracker, buffer: GLuint) -> GLenum {
    if gl.caps().is_es2 {
        state.bind_array_buffer(gl, buffer);
        gl::ARRAY_BUFFER
    } else {
        gl.bind_buffer(gl::COPY_WRITE_BUFFER, buffer);
        gl::COPY_WRITE_BUFFER
    }
}

fn buffer_target(flags: BufferFlags) -> GLenum {
    if flags.contains(BufferFlags::CONSTANT_BUFFER) {
        gl::UNIFORM_BUFFER
    } else if flags.contains(BufferFlags::INDEX_BUFFER) {
        gl::ELEMENT_ARRAY_BUFFER
    } else if flags.contains(BufferFlags::ARGUMENT_BUFFER) {
        gl::DRAW_INDIRECT_BUFFER
    } else if flags.intersects(BufferFlags::UNORDERED_ACCESS | BufferFlags::STRUCTURED_BUFFER | BufferFlags::RAW_BUFFER) {
        gl::SHADER_STORAGE_BUFFER
    } else {
        gl::ARRAY_BUFFER
    }
}

fn usage_hint(usage: GraphicsResourceUsage) -> GLenum {
    match usage {
        GraphicsResourceUsage::Dynamic => gl::DYNAMIC_DRAW,
        GraphicsResourceUsage::Staging => gl::STREAM_READ,
        GraphicsResourceUsage::Default | GraphicsResourceUsage::Immutable => gl::STATIC_DRAW,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rstest::rstest;

    use super::*;
    use crate::soft::{SoftGl, SoftProfile};

    fn driver(profile: SoftProfile) -> (GlDriver<SoftGl>, StateTracker) {
        (GlDriver::new(Arc::new(SoftGl::with_profile(profile, 4, 4))), StateTracker::new(8))
    }

    #[rstest]
    #[case(BufferFlags::CONSTANT_BUFFER, gl::UNIFORM_BUFFER)]
    #[case(BufferFlags::INDEX_BUFFER, gl::ELEMENT_ARRAY_BUFFER)]
    #[case(BufferFlags::ARGUMENT_BUFFER, gl::DRAW_INDIRECT_BUFFER)]
    #[case(BufferFlags::STRUCTURED_BUFFER | BufferFlags::SHADER_RESOURCE, gl::SHADER_STORAGE_BUFFER)]
    #[case(BufferFlags::VERTEX_BUFFER, gl::ARRAY_BUFFER)]
    fn targets_follow_flags(#[case] flags: BufferFlags, #[case] target: GLenum) {
        assert_eq!(buffer_target(flags), target);
    }

    #[test]
    fn es2_constant_buffer_has_no_native_object() {
        let (gl, mut state) = driver(SoftProfile::Es2);
        let desc = BufferDescription::new(64, BufferFlags::CONSTANT_BUFFER, GraphicsResourceUsage::Dynamic);
        let mut buffer = GlBuffer::create(&gl, &mut state, desc, None).unwrap();
        assert_eq!(buffer.buffer_id(), 0);
        assert_eq!(gl.call_count("glGenBuffers"), 0);

        buffer.update(&gl, &mut state, &[3u8; 64]).unwrap();
        assert_eq!(buffer.staging_data().unwrap(), &[3u8; 64][..]);
    }

    #[test]
    fn initial_data_reaches_the_driver() {
        let (gl, mut state) = driver(SoftProfile::Desktop43);
        let desc = BufferDescription::new(4, BufferFlags::VERTEX_BUFFER, GraphicsResourceUsage::Immutable);
        let buffer = GlBuffer::create(&gl, &mut state, desc, Some(&[1, 2, 3, 4])).unwrap();
        assert_eq!(gl.buffer_contents(buffer.buffer_id()).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn oversized_initial_data_is_rejected() {
        let (gl, mut state) = driver(SoftProfile::Desktop43);
        let desc = BufferDescription::new(2, BufferFlags::VERTEX_BUFFER, GraphicsResourceUsage::Default);
        assert!(GlBuffer::create(&gl, &mut state, desc, Some(&[0; 3])).is_err());
    }

    #[test]
    fn write_discard_orphans_and_writes_through() {
        let (gl, mut state) = driver(SoftProfile::Desktop43);
        let desc = BufferDescription::new(8, BufferFlags::VERTEX_BUFFER, GraphicsResourceUsage::Dynamic);
        let mut buffer = GlBuffer::create(&gl, &mut state, desc, None).unwrap();

        let mut mapped = buffer.map(&gl, &mut state, MapMode::WriteDiscard, false, 0, 0).unwrap();
        assert_eq!(mapped.size, 8);
        unsafe { mapped.as_mut_slice() }.copy_from_slice(&[9; 8]);
        buffer.unmap(&gl, &mut state).unwrap();

        assert_eq!(gl.call_count("glBufferData"), 2);
        assert_eq!(gl.buffer_contents(buffer.buffer_id()).unwrap(), vec![9; 8]);
    }

    #[test]
    fn es2_dynamic_buffer_writes_back_on_unmap() {
        let (gl, mut state) = driver(SoftProfile::Es2);
        let desc = BufferDescription::new(4, BufferFlags::VERTEX_BUFFER, GraphicsResourceUsage::Dynamic);
        let mut buffer = GlBuffer::create(&gl, &mut state, desc, None).unwrap();
        assert_ne!(buffer.buffer_id(), 0);

        let mut mapped = buffer.map(&gl, &mut state, MapMode::WriteDiscard, false, 2, 2).unwrap();
        assert_eq!(mapped.offset, 2);
        unsafe { mapped.as_mut_slice() }.copy_from_slice(&[5, 6]);
        buffer.unmap(&gl, &mut state).unwrap();

        assert_eq!(gl.call_count("glMapBufferRange"), 0);
        assert_eq!(gl.buffer_contents(buffer.buffer_id()).unwrap(), vec![0, 0, 5, 6]);
    }

    #[test]
    fn es2_cannot_map_static_buffers() {
        let (gl, mut state) = driver(SoftProfile::Es2);
        let desc = BufferDescription::new(4, BufferFlags::VERTEX_BUFFER, GraphicsResourceUsage::Default);
        let mut buffer = GlBuffer::create(&gl, &mut state, desc, None).unwrap();
        let err = buffer.map(&gl, &mut state, MapMode::Write, false, 0, 0).unwrap_err();
        assert!(matches!(gfx_core::graphics_error(&err), Some(GraphicsError::Unsupported(_))));
    }

    #[test]
    fn partial_update_uses_sub_data() {
        let (gl, mut state) = driver(SoftProfile::Desktop43);
        let desc = BufferDescription::new(4, BufferFlags::VERTEX_BUFFER, GraphicsResourceUsage::Default);
        let mut buffer = GlBuffer::create(&gl, &mut state, desc, None).unwrap();
        buffer.update_region(&gl, &mut state, 1, &[7, 7]).unwrap();
        assert_eq!(gl.call_count("glBufferSubData"), 1);
        assert_eq!(gl.buffer_contents(buffer.buffer_id()).unwrap(), vec![0, 7, 7, 0]);
        assert!(buffer.update_region(&gl, &mut state, 3, &[1, 1]).is_err());
    }

    #[test]
    fn recreate_restores_cpu_copy() {
        let (gl, mut state) = driver(SoftProfile::Es2);
        let desc = BufferDescription::new(2, BufferFlags::VERTEX_BUFFER, GraphicsResourceUsage::Dynamic);
        let mut buffer = GlBuffer::create(&gl, &mut state, desc, Some(&[4, 2])).unwrap();

        let mut ctx = BufferContext { gl: &gl, state: &mut state };
        buffer.on_destroyed(&mut ctx);
        assert_eq!(DeviceChild::<BufferContext<'_, SoftGl>>::lifetime_state(&buffer), LifetimeState::Destroyed);
        assert!(buffer.on_recreate(&mut ctx).unwrap());
        assert_eq!(ctx.gl.buffer_contents(buffer.buffer_id()).unwrap(), vec![4, 2]);
    }
}
