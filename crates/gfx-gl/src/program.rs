//! Linked programs as seen by the device.
//!
//! Effects are compiled elsewhere; the device only needs the program name,
//! its input signature and where its textures and (on GL ES 2) loose
//! uniforms come from. Uniform blocks read the constant buffer bound at
//! the slot of the same index.

use std::collections::HashMap;

use anyhow::Result;
use gfx_core::GraphicsError;
use gl::types::{GLenum, GLint, GLuint};
use tracing::debug;

use crate::api::GlApi;
use crate::vao::InputSignature;

/// Stride between array elements of a uniform inside a constant buffer.
const ARRAY_STRIDE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UniformType {
    Float,
    Float2,
    Float3,
    Float4,
    Int,
    Matrix4,
}

impl UniformType {
    fn components(self) -> usize {
        match self {
            UniformType::Float | UniformType::Int => 1,
            UniformType::Float2 => 2,
            UniformType::Float3 => 3,
            UniformType::Float4 => 4,
            UniformType::Matrix4 => 16,
        }
    }

    fn element_size(self) -> usize {
        self.components() * 4
    }

    fn stride(self) -> usize {
        self.element_size().max(ARRAY_STRIDE)
    }
}

/// A loose uniform fed from a constant buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformBinding {
    pub location: GLint,
    pub ty: UniformType,
    pub count: u32,
    /// Constant buffer slot the value lives in.
    pub constant_buffer: u32,
    /// Byte offset inside that buffer.
    pub offset: u32,
}

impl UniformBinding {
    /// Bytes the uniform spans in its constant buffer.
    pub fn size(&self) -> usize {
        let count = self.count.max(1) as usize;
        (count - 1) * self.ty.stride() + self.ty.element_size()
    }

    fn upload(&self, gl: &impl GlApi, bytes: &[u8]) {
        let count = self.count.max(1) as usize;
        let element = self.ty.element_size();
        let words: Vec<[u8; 4]> = (0..count)
            .flat_map(|i| {
                let start = i * self.ty.stride();
                bytes[start..start + element]
                    .chunks_exact(4)
                    .map(|c| [c[0], c[1], c[2], c[3]])
            })
            .collect();
        let floats = || words.iter().map(|w| f32::from_ne_bytes(*w)).collect::<Vec<_>>();
        let ints = || words.iter().map(|w| i32::from_ne_bytes(*w)).collect::<Vec<_>>();
        match self.ty {
            UniformType::Float => gl.uniform_1fv(self.location, &floats()),
            UniformType::Float2 => gl.uniform_2fv(self.location, &floats()),
            UniformType::Float3 => gl.uniform_3fv(self.location, &floats()),
            UniformType::Float4 => gl.uniform_4fv(self.location, &floats()),
            UniformType::Int => gl.uniform_1iv(self.location, &ints()),
            UniformType::Matrix4 => gl.uniform_matrix_4fv(self.location, &floats()),
        }
    }
}

/// Texture unit fed from a shader resource slot and a sampler slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureBinding {
    pub unit: u32,
    pub texture_slot: u32,
    pub sampler_slot: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectProgram {
    pub program_id: GLuint,
    pub input_signature: InputSignature,
    pub textures: Vec<TextureBinding>,
    /// Loose uniforms; only used when uniform buffers are unavailable.
    pub uniforms: Vec<UniformBinding>,
}

impl EffectProgram {
    pub fn new(program_id: GLuint, input_signature: InputSignature) -> Self {
        Self {
            program_id,
            input_signature,
            textures: Vec::new(),
            uniforms: Vec::new(),
        }
    }

    pub fn with_texture(mut self, unit: u32, texture_slot: u32, sampler_slot: u32) -> Self {
        self.textures.push(TextureBinding {
            unit,
            texture_slot,
            sampler_slot,
        });
        self
    }

    pub fn with_uniform(mut self, uniform: UniformBinding) -> Self {
        self.uniforms.push(uniform);
        self
    }
}

/// Last values uploaded to each loose uniform, per program.
#[derive(Debug, Default)]
pub struct UniformShadow {
    values: HashMap<(GLuint, GLint), Vec<u8>>,
}

impl UniformShadow {
    /// Upload `uniform` from `constant_buffer` when its bytes changed since
    /// the last upload to `program`. Returns whether a call was issued.
    pub fn update(&mut self, gl: &impl GlApi, program: GLuint, uniform: &UniformBinding, constant_buffer: &[u8]) -> bool {
        let start = uniform.offset as usize;
        let Some(bytes) = constant_buffer.get(start..start + uniform.size()) else {
            return false;
        };
        let shadow = self.values.entry((program, uniform.location)).or_default();
        if shadow.as_slice() == bytes {
            return false;
        }
        uniform.upload(gl, bytes);
        shadow.clear();
        shadow.extend_from_slice(bytes);
        true
    }

    /// The program was deleted or the context lost its values.
    pub fn forget_program(&mut self, program: GLuint) {
        self.values.retain(|(p, _), _| *p != program);
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

/// Compile and link a vertex/fragment pair, binding `attributes` to fixed
/// locations before linking.
pub fn compile_program(gl: &impl GlApi, vertex: &str, fragment: &str, attributes: &[(u32, &str)]) -> Result<GLuint> {
    let vs = compile_shader(gl, gl::VERTEX_SHADER, vertex)?;
    let fs = match compile_shader(gl, gl::FRAGMENT_SHADER, fragment) {
        Ok(fs) => fs,
        Err(err) => {
            gl.delete_shader(vs);
            return Err(err);
        }
    };

    let program = gl.create_program();
    gl.attach_shader(program, vs);
    gl.attach_shader(program, fs);
    for (location, name) in attributes {
        gl.bind_attrib_location(program, *location, name);
    }
    gl.link_program(program);
    gl.delete_shader(vs);
    gl.delete_shader(fs);

    if !gl.program_link_status(program) {
        let log = gl.program_info_log(program);
        gl.delete_program(program);
        return Err(GraphicsError::ShaderLink(log).into());
    }
    debug!(program, "linked program");
    Ok(program)
}

fn compile_shader(gl: &impl GlApi, ty: GLenum, source: &str) -> Result<GLuint> {
    let shader = gl.create_shader(ty);
    gl.shader_source(shader, source);
    gl.compile_shader(shader);
    if !gl.shader_compile_status(shader) {
        let log = gl.shader_info_log(shader);
        gl.delete_shader(shader);
        return Err(GraphicsError::ShaderCompile(log).into());
    }
    Ok(shader)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::soft::SoftGl;

    const VS: &str = "attribute vec2 aPosition;\nvoid main() { gl_Position = vec4(aPosition, 0.0, 1.0); }\n";
    const FS: &str = "void main() { gl_FragColor = vec4(1.0); }\n";

    #[rstest]
    #[case(UniformType::Float, 1, 4)]
    #[case(UniformType::Float3, 1, 12)]
    #[case(UniformType::Float, 3, 36)]
    #[case(UniformType::Float4, 2, 32)]
    #[case(UniformType::Matrix4, 2, 128)]
    fn uniform_sizes_use_sixteen_byte_stride(#[case] ty: UniformType, #[case] count: u32, #[case] size: usize) {
        let uniform = UniformBinding {
            location: 0,
            ty,
            count,
            constant_buffer: 0,
            offset: 0,
        };
        assert_eq!(uniform.size(), size);
    }

    #[test]
    fn unchanged_uniforms_are_not_reuploaded() {
        let gl = SoftGl::new(4, 4);
        let uniform = UniformBinding {
            location: 2,
            ty: UniformType::Float4,
            count: 1,
            constant_buffer: 0,
            offset: 16,
        };
        let mut shadow = UniformShadow::default();
        let mut data = vec![0u8; 32];

        assert!(shadow.update(&gl, 1, &uniform, &data));
        assert!(!shadow.update(&gl, 1, &uniform, &data));
        // Bytes outside the uniform do not matter.
        data[0] = 1;
        assert!(!shadow.update(&gl, 1, &uniform, &data));
        data[20] = 1;
        assert!(shadow.update(&gl, 1, &uniform, &data));
        // Values are per program.
        assert!(shadow.update(&gl, 7, &uniform, &data));
        assert_eq!(gl.call_count("glUniform4fv"), 3);

        shadow.forget_program(1);
        assert!(shadow.update(&gl, 1, &uniform, &data));
    }

    #[test]
    fn compile_and_link() {
        let gl = SoftGl::new(4, 4);
        let program = compile_program(&gl, VS, FS, &[(0, "aPosition")]).unwrap();
        assert!(gl.program_link_status(program));
        assert_eq!(gl.call_count("glDeleteShader"), 2);
    }

    #[test]
    fn compile_errors_carry_the_log() {
        let gl = SoftGl::new(4, 4);
        let err = compile_program(&gl, VS, "#error broken\n", &[]).unwrap_err();
        match gfx_core::graphics_error(&err) {
            Some(GraphicsError::ShaderCompile(log)) => assert!(log.contains("#error")),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(gl.call_count("glCreateProgram"), 0);
    }
}
