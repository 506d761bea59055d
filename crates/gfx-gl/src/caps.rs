//! Driver capability probe.

use tracing::debug;

use crate::api::GlApi;

/// What the current context supports, parsed once from `GL_VERSION` and
/// `GL_EXTENSIONS`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GlCaps {
    pub renderer: String,
    pub is_es: bool,
    pub version: (u32, u32),
    pub is_es2: bool,
    pub has_vao: bool,
    pub has_packed_depth_stencil: bool,
    pub has_depth24: bool,
    pub has_bgra: bool,
    pub has_srgb: bool,
    pub has_texture_rg: bool,
    pub has_dxt: bool,
    pub has_draw_buffers: bool,
    pub has_blit: bool,
    pub has_base_vertex: bool,
    pub has_compute: bool,
    pub has_instancing: bool,
    pub has_anisotropic: bool,
    pub has_float_render_targets: bool,
    pub has_uniform_buffers: bool,
    pub has_map_buffer: bool,
    pub has_debug_groups: bool,
}

impl GlCaps {
    /// Query the context current on this thread.
    pub fn detect(api: &impl GlApi) -> Self {
        let version = api.get_string(gl::VERSION);
        let extensions = api.get_string(gl::EXTENSIONS);
        let mut caps = Self::from_strings(&version, &extensions);
        caps.renderer = api.get_string(gl::RENDERER);
        debug!(
            renderer = %caps.renderer,
            version = %version,
            es = caps.is_es,
            "detected GL capabilities"
        );
        caps
    }

    pub fn from_strings(version: &str, extensions: &str) -> Self {
        let (is_es, version) = parse_version(version);
        let ext = |name: &str| extensions.split_whitespace().any(|e| e == name);
        let at_least = |major: u32, minor: u32| version >= (major, minor);
        let is_es2 = is_es && version.0 < 3;

        Self {
            renderer: String::new(),
            is_es,
            version,
            is_es2,
            has_vao: !is_es2 || ext("GL_OES_vertex_array_object"),
            has_packed_depth_stencil: !is_es2 || ext("GL_OES_packed_depth_stencil"),
            has_depth24: !is_es2 || ext("GL_OES_depth24"),
            has_bgra: !is_es || ext("GL_EXT_texture_format_BGRA8888") || ext("GL_APPLE_texture_format_BGRA8888"),
            has_srgb: !is_es2 || ext("GL_EXT_sRGB"),
            has_texture_rg: !is_es2 || ext("GL_EXT_texture_rg"),
            has_dxt: !is_es || ext("GL_EXT_texture_compression_s3tc"),
            has_draw_buffers: !is_es2,
            has_blit: !is_es2,
            has_base_vertex: at_least(3, 2),
            has_compute: if is_es { at_least(3, 1) } else { at_least(4, 3) },
            has_instancing: !is_es2,
            has_anisotropic: ext("GL_EXT_texture_filter_anisotropic") || (!is_es && at_least(4, 6)),
            has_float_render_targets: !is_es || ext("GL_EXT_color_buffer_float") || ext("GL_EXT_color_buffer_half_float"),
            has_uniform_buffers: !is_es2,
            has_map_buffer: !is_es2,
            has_debug_groups: (!is_es && at_least(4, 3)) || ext("GL_KHR_debug"),
        }
    }
}

/// `(is_es, (major, minor))` from a `GL_VERSION` string such as
/// `"4.6.0 NVIDIA 535.54"` or `"OpenGL ES 3.2 Mesa 23.0"`.
fn parse_version(version: &str) -> (bool, (u32, u32)) {
    let (is_es, rest) = match version.strip_prefix("OpenGL ES") {
        Some(rest) => (true, rest.trim_start_matches(['-', 'C', 'M', ' '])),
        None => (false, version),
    };
    let number = rest.split_whitespace().next().unwrap_or("");
    let mut parts = number.split('.').map(|p| p.parse::<u32>().unwrap_or(0));
    let major = parts.next().unwrap_or(0);
    let minor = parts.next().unwrap_or(0);
    (is_es, (major, minor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("4.6.0 NVIDIA 535.54", false, (4, 6))]
    #[case("OpenGL ES 3.2 Mesa 23.0", true, (3, 2))]
    #[case("OpenGL ES 2.0 SoftGl", true, (2, 0))]
    #[case("OpenGL ES-CM 1.1", true, (1, 1))]
    fn versions(#[case] text: &str, #[case] es: bool, #[case] version: (u32, u32)) {
        assert_eq!(parse_version(text), (es, version));
    }

    #[test]
    fn es2_extensions_gate_features() {
        let bare = GlCaps::from_strings("OpenGL ES 2.0", "");
        assert!(bare.is_es2);
        assert!(!bare.has_vao);
        assert!(!bare.has_packed_depth_stencil);
        assert!(!bare.has_blit);

        let extended = GlCaps::from_strings(
            "OpenGL ES 2.0",
            "GL_OES_vertex_array_object GL_OES_packed_depth_stencil",
        );
        assert!(extended.has_vao);
        assert!(extended.has_packed_depth_stencil);
    }

    #[test]
    fn desktop_has_everything_core() {
        let caps = GlCaps::from_strings("4.3.0 SoftGl", "");
        assert!(!caps.is_es);
        assert!(caps.has_compute);
        assert!(caps.has_blit);
        assert!(caps.has_debug_groups);
        assert!(!caps.has_anisotropic);
    }
}
