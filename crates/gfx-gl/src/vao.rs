//! Vertex array objects.
//!
//! A [`GlVertexArray`] holds buffer bindings and a vertex layout; the
//! attribute locations come from the program's [`InputSignature`], so one
//! native VAO is built per signature the array is drawn with.

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use gfx_core::{Arena, DeviceChild, GraphicsError, Handle, LifetimeState};
use gl::types::{GLenum, GLint, GLsizei, GLuint};
use tracing::trace;

use crate::api::GlApi;
use crate::buffer::GlBuffer;
use crate::driver::GlDriver;
use crate::state::StateTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    Float,
    Float2,
    Float3,
    Float4,
    Half2,
    Half4,
    UByte4,
    UByte4Norm,
    Short2,
    Short2Norm,
    Short4,
    Short4Norm,
    UInt,
    UInt2,
    UInt4,
    Int,
    Int4,
}

impl VertexFormat {
    /// `(type, components, normalized)`.
    fn gl_format(self) -> (GLenum, GLint, bool) {
        match self {
            VertexFormat::Float => (gl::FLOAT, 1, false),
            VertexFormat::Float2 => (gl::FLOAT, 2, false),
            VertexFormat::Float3 => (gl::FLOAT, 3, false),
            VertexFormat::Float4 => (gl::FLOAT, 4, false),
            VertexFormat::Half2 => (gl::HALF_FLOAT, 2, false),
            VertexFormat::Half4 => (gl::HALF_FLOAT, 4, false),
            VertexFormat::UByte4 => (gl::UNSIGNED_BYTE, 4, false),
            VertexFormat::UByte4Norm => (gl::UNSIGNED_BYTE, 4, true),
            VertexFormat::Short2 => (gl::SHORT, 2, false),
            VertexFormat::Short2Norm => (gl::SHORT, 2, true),
            VertexFormat::Short4 => (gl::SHORT, 4, false),
            VertexFormat::Short4Norm => (gl::SHORT, 4, true),
            VertexFormat::UInt => (gl::UNSIGNED_INT, 1, false),
            VertexFormat::UInt2 => (gl::UNSIGNED_INT, 2, false),
            VertexFormat::UInt4 => (gl::UNSIGNED_INT, 4, false),
            VertexFormat::Int => (gl::INT, 1, false),
            VertexFormat::Int4 => (gl::INT, 4, false),
        }
    }

    pub fn size_in_bytes(self) -> u32 {
        let (ty, components, _) = self.gl_format();
        let component = match ty {
            gl::UNSIGNED_BYTE => 1,
            gl::SHORT | gl::HALF_FLOAT => 2,
            _ => 4,
        };
        component * components as u32
    }

    fn is_integer(self) -> bool {
        let (ty, _, normalized) = self.gl_format();
        !normalized && matches!(ty, gl::UNSIGNED_BYTE | gl::SHORT | gl::UNSIGNED_INT | gl::INT)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VertexElement {
    pub semantic_name: String,
    pub semantic_index: u32,
    pub format: VertexFormat,
}

impl VertexElement {
    pub fn new(semantic_name: impl Into<String>, semantic_index: u32, format: VertexFormat) -> Self {
        Self {
            semantic_name: semantic_name.into(),
            semantic_index,
            format,
        }
    }

    /// Shader attribute name, `a_` followed by semantic and index.
    pub fn attribute_name(&self) -> String {
        format!("a_{}{}", self.semantic_name, self.semantic_index)
    }
}

/// Interleaved layout of one vertex buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VertexDeclaration {
    pub elements: Vec<VertexElement>,
    pub stride: u32,
}

impl VertexDeclaration {
    /// Tightly packed elements.
    pub fn new(elements: Vec<VertexElement>) -> Self {
        let stride = elements.iter().map(|e| e.format.size_in_bytes()).sum();
        Self { elements, stride }
    }

    /// Elements with their byte offset in the vertex.
    pub fn with_offsets(&self) -> impl Iterator<Item = (&VertexElement, u32)> {
        self.elements.iter().scan(0u32, |offset, element| {
            let at = *offset;
            *offset += element.format.size_in_bytes();
            Some((element, at))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexBufferBinding {
    pub buffer: Handle<GlBuffer>,
    pub declaration: VertexDeclaration,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexBufferBinding {
    pub buffer: Handle<GlBuffer>,
    pub is_32bit: bool,
    pub offset: u32,
}

/// Attribute names a program reads, with their locations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct InputSignature {
    attributes: BTreeMap<String, u32>,
}

impl InputSignature {
    pub fn new<S: Into<String>>(attributes: impl IntoIterator<Item = (S, u32)>) -> Self {
        Self {
            attributes: attributes.into_iter().map(|(name, location)| (name.into(), location)).collect(),
        }
    }

    pub fn location(&self, attribute: &str) -> Option<u32> {
        self.attributes.get(attribute).copied()
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, u32)> {
        self.attributes.iter().map(|(name, location)| (name.as_str(), *location))
    }
}

#[derive(Debug, Clone)]
struct VertexAttrib {
    buffer_id: GLuint,
    name: String,
    components: GLint,
    ty: GLenum,
    normalized: bool,
    integer: bool,
    stride: GLsizei,
    offset: usize,
}

/// Native state of a vertex array for one input signature.
#[derive(Debug, Default)]
struct Instance {
    /// Zero when the context has no VAO support.
    vao: GLuint,
    /// `(location, attribute index)`.
    locations: Vec<(u32, usize)>,
    enabled_mask: u32,
}

#[derive(Debug)]
pub struct GlVertexArray {
    vertex_buffers: Vec<VertexBufferBinding>,
    index_buffer: Option<IndexBufferBinding>,
    preferred_signature: Option<InputSignature>,
    attribs: Vec<VertexAttrib>,
    index_buffer_id: GLuint,
    index_type: GLenum,
    index_element_size: u32,
    instances: HashMap<InputSignature, Instance>,
    current_signature: Option<InputSignature>,
    lifetime: LifetimeState,
}

impl GlVertexArray {
    /// Build the attribute list; when a preferred signature is given its
    /// native VAO is created up front.
    pub fn create<A: GlApi>(
        gl: &GlDriver<A>,
        state: &mut StateTracker,
        buffers: &Arena<GlBuffer>,
        vertex_buffers: Vec<VertexBufferBinding>,
        index_buffer: Option<IndexBufferBinding>,
        preferred_signature: Option<InputSignature>,
    ) -> Result<Self> {
        let mut vao = Self {
            vertex_buffers,
            index_buffer,
            preferred_signature,
            attribs: Vec::new(),
            index_buffer_id: 0,
            index_type: gl::UNSIGNED_SHORT,
            index_element_size: 2,
            instances: HashMap::new(),
            current_signature: None,
            lifetime: LifetimeState::Active,
        };
        vao.resolve(gl, state, buffers)?;
        Ok(vao)
    }

    fn resolve<A: GlApi>(&mut self, gl: &GlDriver<A>, state: &mut StateTracker, buffers: &Arena<GlBuffer>) -> Result<()> {
        let native_id = |handle: Handle<GlBuffer>| -> Result<GLuint> {
            let buffer = buffers.get(handle).ok_or(GraphicsError::StaleHandle("buffer"))?;
            if buffer.buffer_id == 0 {
                return Err(GraphicsError::unsupported("vertex input from a buffer without a GL object").into());
            }
            Ok(buffer.buffer_id)
        };

        let mut attribs = Vec::new();
        for binding in &self.vertex_buffers {
            let buffer_id = native_id(binding.buffer)?;
            for (element, offset) in binding.declaration.with_offsets() {
                let (ty, components, normalized) = element.format.gl_format();
                attribs.push(VertexAttrib {
                    buffer_id,
                    name: element.attribute_name(),
                    components,
                    ty,
                    normalized,
                    integer: element.format.is_integer() && !gl.caps().is_es2,
                    stride: binding.declaration.stride as GLsizei,
                    offset: (binding.offset + offset) as usize,
                });
            }
        }
        self.attribs = attribs;

        if let Some(index) = self.index_buffer {
            if index.is_32bit && gl.caps().is_es2 {
                return Err(GraphicsError::unsupported("32-bit index buffers on GL ES 2").into());
            }
            self.index_buffer_id = native_id(index.buffer)?;
            (self.index_type, self.index_element_size) =
                if index.is_32bit { (gl::UNSIGNED_INT, 4) } else { (gl::UNSIGNED_SHORT, 2) };
        }

        self.current_signature = None;
        if let Some(signature) = self.preferred_signature.clone() {
            self.instance(gl, state, &signature);
            self.current_signature = Some(signature);
        }
        Ok(())
    }

    pub fn vertex_buffers(&self) -> &[VertexBufferBinding] {
        &self.vertex_buffers
    }

    pub fn index_buffer(&self) -> Option<&IndexBufferBinding> {
        self.index_buffer.as_ref()
    }

    /// `(type, element size, byte offset)` of the index buffer.
    pub fn index_format(&self) -> Option<(GLenum, u32, usize)> {
        self.index_buffer
            .map(|index| (self.index_type, self.index_element_size, index.offset as usize))
    }

    /// The array was last applied for a different signature.
    pub fn requires_apply(&self, signature: &InputSignature) -> bool {
        self.current_signature.as_ref() != Some(signature)
    }

    /// Bind the vertex input for `signature`, building it on first use.
    pub fn apply<A: GlApi>(&mut self, gl: &GlDriver<A>, state: &mut StateTracker, signature: &InputSignature) {
        if self.requires_apply(signature) {
            self.current_signature = Some(signature.clone());
        }
        let created = !self.instances.contains_key(signature);
        let instance = self.instance(gl, state, signature);

        if instance.vao != 0 {
            state.bind_vertex_array(gl, instance.vao);
            return;
        }
        if created {
            // Pointers were just set up by `instance`.
            return;
        }
        let (locations, mask) = (instance.locations.clone(), instance.enabled_mask);
        self.set_pointers(gl, state, &locations);
        state.set_enabled_attribs(gl, mask);
        state.bind_element_buffer(gl, self.index_buffer_id);
    }

    fn instance<A: GlApi>(&mut self, gl: &GlDriver<A>, state: &mut StateTracker, signature: &InputSignature) -> &Instance {
        if !self.instances.contains_key(signature) {
            let locations: Vec<(u32, usize)> = self
                .attribs
                .iter()
                .enumerate()
                .filter_map(|(i, attrib)| signature.location(&attrib.name).map(|location| (location, i)))
                .collect();
            let enabled_mask = locations.iter().fold(0u32, |mask, (location, _)| mask | (1 << location));

            let vao = if gl.caps().has_vao {
                let vao = gl.gen_vertex_array();
                state.bind_vertex_array(gl, vao);
                for (location, _) in &locations {
                    gl.enable_vertex_attrib_array(*location);
                }
                vao
            } else {
                state.set_enabled_attribs(gl, enabled_mask);
                0
            };
            self.set_pointers(gl, state, &locations);
            state.bind_element_buffer(gl, self.index_buffer_id);
            trace!(vao, attributes = locations.len(), "created vertex array instance");

            self.instances.insert(
                signature.clone(),
                Instance {
                    vao,
                    locations,
                    enabled_mask,
                },
            );
        }
        &self.instances[signature]
    }

    fn set_pointers<A: GlApi>(&self, gl: &GlDriver<A>, state: &mut StateTracker, locations: &[(u32, usize)]) {
        for &(location, index) in locations {
            let attrib = &self.attribs[index];
            state.bind_array_buffer(gl, attrib.buffer_id);
            if attrib.integer {
                gl.vertex_attrib_i_pointer(location, attrib.components, attrib.ty, attrib.stride, attrib.offset);
            } else {
                gl.vertex_attrib_pointer(location, attrib.components, attrib.ty, attrib.normalized, attrib.stride, attrib.offset);
            }
        }
    }

    fn release<A: GlApi>(&mut self, gl: &GlDriver<A>, state: &mut StateTracker) {
        for instance in self.instances.values() {
            if instance.vao != 0 {
                gl.delete_vertex_array(instance.vao);
                state.forget_vertex_array(instance.vao);
            }
        }
        self.instances.clear();
        self.current_signature = None;
    }

    pub(crate) fn dispose<A: GlApi>(&mut self, gl: &GlDriver<A>, state: &mut StateTracker) {
        self.release(gl, state);
        self.lifetime = LifetimeState::Disposed;
    }

    /// Buffers this array reads from.
    pub(crate) fn references(&self, buffer: Handle<GlBuffer>) -> bool {
        self.vertex_buffers.iter().any(|b| b.buffer == buffer) || self.index_buffer.is_some_and(|i| i.buffer == buffer)
    }
}

/// Vertex arrays resolve buffer names again on recreate.
pub struct VertexArrayContext<'a, A> {
    pub gl: &'a GlDriver<A>,
    pub state: &'a mut StateTracker,
    pub buffers: &'a Arena<GlBuffer>,
}

impl<A: GlApi> DeviceChild<VertexArrayContext<'_, A>> for GlVertexArray {
    fn on_destroyed(&mut self, ctx: &mut VertexArrayContext<'_, A>) {
        if self.lifetime == LifetimeState::Active {
            self.release(ctx.gl, ctx.state);
            self.lifetime = LifetimeState::Destroyed;
        }
    }

    fn on_recreate(&mut self, ctx: &mut VertexArrayContext<'_, A>) -> Result<bool> {
        if self.lifetime == LifetimeState::Destroyed {
            self.resolve(ctx.gl, ctx.state, ctx.buffers)?;
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
    use std::sync::Arc;

    use gfx_core::{BufferDescription, BufferFlags, GraphicsResourceUsage};

    use super::*;
    use crate::soft::{SoftGl, SoftProfile};

    struct Fixture {
        gl: GlDriver<SoftGl>,
        state: StateTracker,
        buffers: Arena<GlBuffer>,
        vertices: Handle<GlBuffer>,
        indices: Handle<GlBuffer>,
    }

    fn fixture(profile: SoftProfile) -> Fixture {
        let gl = GlDriver::new(Arc::new(SoftGl::with_profile(profile, 4, 4)));
        let mut state = StateTracker::new(8);
        let mut buffers = Arena::new();
        let vb = BufferDescription::new(96, BufferFlags::VERTEX_BUFFER, GraphicsResourceUsage::Default);
        let ib = BufferDescription::new(12, BufferFlags::INDEX_BUFFER, GraphicsResourceUsage::Default);
        let vertices = buffers.insert(GlBuffer::create(&gl, &mut state, vb, None).unwrap());
        let indices = buffers.insert(GlBuffer::create(&gl, &mut state, ib, None).unwrap());
        Fixture {
            gl,
            state,
            buffers,
            vertices,
            indices,
        }
    }

    fn layout(buffer: Handle<GlBuffer>) -> Vec<VertexBufferBinding> {
        vec![VertexBufferBinding {
            buffer,
            declaration: VertexDeclaration::new(vec![
                VertexElement::new("POSITION", 0, VertexFormat::Float3),
                VertexElement::new("COLOR", 0, VertexFormat::UByte4Norm),
            ]),
            offset: 0,
        }]
    }

    #[test]
    fn declaration_offsets_are_packed() {
        let declaration = VertexDeclaration::new(vec![
            VertexElement::new("POSITION", 0, VertexFormat::Float3),
            VertexElement::new("TEXCOORD", 0, VertexFormat::Half2),
            VertexElement::new("BLENDINDICES", 0, VertexFormat::UByte4),
        ]);
        assert_eq!(declaration.stride, 20);
        let offsets: Vec<u32> = declaration.with_offsets().map(|(_, offset)| offset).collect();
        assert_eq!(offsets, vec![0, 12, 16]);
        assert!(VertexFormat::UByte4.is_integer());
        assert!(!VertexFormat::UByte4Norm.is_integer());
    }

    #[test]
    fn one_native_vao_per_signature() {
        let mut f = fixture(SoftProfile::Desktop43);
        let first = InputSignature::new([("a_POSITION0", 0), ("a_COLOR0", 1)]);
        let second = InputSignature::new([("a_POSITION0", 3)]);
        let mut vao = GlVertexArray::create(
            &f.gl,
            &mut f.state,
            &f.buffers,
            layout(f.vertices),
            Some(IndexBufferBinding {
                buffer: f.indices,
                is_32bit: false,
                offset: 4,
            }),
            Some(first.clone()),
        )
        .unwrap();
        assert_eq!(f.gl.call_count("glGenVertexArrays"), 1);
        assert!(!vao.requires_apply(&first));
        assert!(vao.requires_apply(&second));

        vao.apply(&f.gl, &mut f.state, &second);
        vao.apply(&f.gl, &mut f.state, &first);
        vao.apply(&f.gl, &mut f.state, &second);
        assert_eq!(f.gl.call_count("glGenVertexArrays"), 2);
        assert_eq!(vao.index_format(), Some((gl::UNSIGNED_SHORT, 2, 4)));

        vao.dispose(&f.gl, &mut f.state);
        assert_eq!(f.gl.call_count("glDeleteVertexArrays"), 2);
    }

    #[test]
    fn without_vao_support_pointers_are_set_each_apply() {
        let mut f = fixture(SoftProfile::Es2);
        let mut caps = f.gl.caps().clone();
        caps.has_vao = false;
        let gl = GlDriver::with_caps(f.gl.api_handle(), caps);

        let signature = InputSignature::new([("a_POSITION0", 0), ("a_COLOR0", 1)]);
        let mut vao = GlVertexArray::create(&gl, &mut f.state, &f.buffers, layout(f.vertices), None, None).unwrap();
        vao.apply(&gl, &mut f.state, &signature);
        vao.apply(&gl, &mut f.state, &signature);

        assert_eq!(gl.call_count("glGenVertexArrays"), 0);
        assert_eq!(gl.call_count("glVertexAttribPointer"), 4);
        // The enable mask only changes once.
        assert_eq!(gl.call_count("glEnableVertexAttribArray"), 2);
    }

    #[test]
    fn es2_rejects_32bit_indices() {
        let mut f = fixture(SoftProfile::Es2);
        let result = GlVertexArray::create(
            &f.gl,
            &mut f.state,
            &f.buffers,
            layout(f.vertices),
            Some(IndexBufferBinding {
                buffer: f.indices,
                is_32bit: true,
                offset: 0,
            }),
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn stale_buffer_handle_is_reported() {
        let mut f = fixture(SoftProfile::Desktop43);
        let stale = f.vertices;
        f.buffers.remove(stale);
        let err = GlVertexArray::create(&f.gl, &mut f.state, &f.buffers, layout(stale), None, None).unwrap_err();
        assert_eq!(gfx_core::graphics_error(&err), Some(&GraphicsError::StaleHandle("buffer")));
    }
}
