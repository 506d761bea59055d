//! Logical pixel format to GL (internal format, format, type) triples.

use anyhow::Result;
use gfx_core::{GraphicsError, PixelFormat};
use gl::types::GLenum;

use crate::api::consts;
use crate::caps::GlCaps;

/// How a [`PixelFormat`] is stored and transferred on the current context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GlFormat {
    pub internal_format: GLenum,
    pub format: GLenum,
    pub ty: GLenum,
    /// Bytes per pixel, or per block for compressed formats.
    pub pixel_size: u32,
    pub compressed: bool,
}

impl GlFormat {
    const fn new(internal_format: GLenum, format: GLenum, ty: GLenum, pixel_size: u32) -> Self {
        Self {
            internal_format,
            format,
            ty,
            pixel_size,
            compressed: false,
        }
    }

    const fn compressed(internal_format: GLenum, block_size: u32) -> Self {
        Self {
            internal_format,
            format: internal_format,
            ty: gl::UNSIGNED_BYTE,
            pixel_size: block_size,
            compressed: true,
        }
    }
}

/// Renderbuffer storage for a depth-stencil format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthStorage {
    pub depth: GLenum,
    /// Separate stencil renderbuffer format when depth and stencil cannot
    /// share one packed buffer.
    pub separate_stencil: Option<GLenum>,
}

fn unsupported(format: PixelFormat) -> anyhow::Error {
    GraphicsError::unsupported(format!("texture format {format:?}")).into()
}

/// Resolve the GL triple for `format`.
///
/// sRGB formats fall back to their linear counterpart when the context
/// has no sRGB support.
pub fn convert_pixel_format(format: PixelFormat, caps: &GlCaps) -> Result<GlFormat> {
    use PixelFormat::*;

    let format = if caps.has_srgb { format } else { format.to_non_srgb() };

    if caps.is_es2
        && matches!(
            format,
            R32Uint | R32Float | Rg32Float | Rgb32Float | Rgba32Uint | Rgba32Float | Depth32Float | Depth32FloatStencil8
        )
    {
        return Err(unsupported(format));
    }

    let converted = match format {
        None => return Err(unsupported(format)),
        A8Unorm if caps.is_es2 => GlFormat::new(consts::ALPHA, consts::ALPHA, gl::UNSIGNED_BYTE, 1),
        A8Unorm => GlFormat::new(gl::R8, gl::RED, gl::UNSIGNED_BYTE, 1),
        R8Unorm if caps.is_es2 && !caps.has_texture_rg => {
            GlFormat::new(consts::LUMINANCE, consts::LUMINANCE, gl::UNSIGNED_BYTE, 1)
        }
        R8Unorm => GlFormat::new(gl::R8, gl::RED, gl::UNSIGNED_BYTE, 1),
        Rg8Unorm => GlFormat::new(gl::RG8, gl::RG, gl::UNSIGNED_BYTE, 2),
        Rgba8Unorm if caps.is_es2 => GlFormat::new(gl::RGBA, gl::RGBA, gl::UNSIGNED_BYTE, 4),
        Rgba8Unorm => GlFormat::new(gl::RGBA8, gl::RGBA, gl::UNSIGNED_BYTE, 4),
        Rgba8UnormSrgb if caps.is_es2 => {
            GlFormat::new(consts::SRGB_ALPHA_EXT, consts::SRGB_ALPHA_EXT, gl::UNSIGNED_BYTE, 4)
        }
        Rgba8UnormSrgb => GlFormat::new(gl::SRGB8_ALPHA8, gl::RGBA, gl::UNSIGNED_BYTE, 4),
        Rgba8Uint => GlFormat::new(gl::RGBA8UI, gl::RGBA_INTEGER, gl::UNSIGNED_BYTE, 4),
        Bgra8Unorm if caps.is_es => {
            if !caps.has_bgra {
                return Err(unsupported(format));
            }
            if caps.is_es2 {
                GlFormat::new(gl::BGRA, gl::BGRA, gl::UNSIGNED_BYTE, 4)
            } else {
                GlFormat::new(consts::BGRA8_EXT, gl::BGRA, gl::UNSIGNED_BYTE, 4)
            }
        }
        Bgra8Unorm => GlFormat::new(gl::RGBA8, gl::BGRA, gl::UNSIGNED_BYTE, 4),
        Bgra8UnormSrgb if caps.is_es => return Err(unsupported(format)),
        Bgra8UnormSrgb => GlFormat::new(gl::SRGB8_ALPHA8, gl::BGRA, gl::UNSIGNED_BYTE, 4),
        Rgb10a2Unorm => GlFormat::new(gl::RGB10_A2, gl::RGBA, gl::UNSIGNED_INT_2_10_10_10_REV, 4),
        Rg11b10Float => GlFormat::new(gl::R11F_G11F_B10F, gl::RGB, gl::UNSIGNED_INT_10F_11F_11F_REV, 4),
        R16Float => GlFormat::new(gl::R16F, gl::RED, gl::HALF_FLOAT, 2),
        R16Unorm if caps.is_es => return Err(unsupported(format)),
        R16Unorm => GlFormat::new(gl::R16, gl::RED, gl::UNSIGNED_SHORT, 2),
        Rg16Float => GlFormat::new(gl::RG16F, gl::RG, gl::HALF_FLOAT, 4),
        Rgba16Float if caps.is_es2 => GlFormat::new(gl::RGBA, gl::RGBA, consts::HALF_FLOAT_OES, 8),
        Rgba16Float => GlFormat::new(gl::RGBA16F, gl::RGBA, gl::HALF_FLOAT, 8),
        Rgba16Unorm if caps.is_es => return Err(unsupported(format)),
        Rgba16Unorm => GlFormat::new(gl::RGBA16, gl::RGBA, gl::UNSIGNED_SHORT, 8),
        R32Float => GlFormat::new(gl::R32F, gl::RED, gl::FLOAT, 4),
        R32Uint => GlFormat::new(gl::R32UI, gl::RED_INTEGER, gl::UNSIGNED_INT, 4),
        Rg32Float => GlFormat::new(gl::RG32F, gl::RG, gl::FLOAT, 8),
        Rgb32Float => GlFormat::new(gl::RGB32F, gl::RGB, gl::FLOAT, 12),
        Rgba32Float => GlFormat::new(gl::RGBA32F, gl::RGBA, gl::FLOAT, 16),
        Rgba32Uint => GlFormat::new(gl::RGBA32UI, gl::RGBA_INTEGER, gl::UNSIGNED_INT, 16),
        Depth16Unorm if caps.is_es2 => {
            GlFormat::new(gl::DEPTH_COMPONENT, gl::DEPTH_COMPONENT, gl::UNSIGNED_SHORT, 2)
        }
        Depth16Unorm => GlFormat::new(gl::DEPTH_COMPONENT16, gl::DEPTH_COMPONENT, gl::UNSIGNED_SHORT, 2),
        // Always accepted; renderbuffers fall back to separate depth and
        // stencil storage when packed depth-stencil is missing.
        Depth24UnormStencil8 if caps.is_es2 => {
            GlFormat::new(gl::DEPTH_STENCIL, gl::DEPTH_STENCIL, gl::UNSIGNED_INT_24_8, 4)
        }
        Depth24UnormStencil8 => GlFormat::new(gl::DEPTH24_STENCIL8, gl::DEPTH_STENCIL, gl::UNSIGNED_INT_24_8, 4),
        Depth32Float => GlFormat::new(gl::DEPTH_COMPONENT32F, gl::DEPTH_COMPONENT, gl::FLOAT, 4),
        Depth32FloatStencil8 => GlFormat::new(
            gl::DEPTH32F_STENCIL8,
            gl::DEPTH_STENCIL,
            gl::FLOAT_32_UNSIGNED_INT_24_8_REV,
            8,
        ),
        Bc1Unorm | Bc1UnormSrgb | Bc2Unorm | Bc3Unorm if !caps.has_dxt => return Err(unsupported(format)),
        Bc1Unorm => GlFormat::compressed(consts::COMPRESSED_RGBA_S3TC_DXT1_EXT, 8),
        Bc1UnormSrgb => GlFormat::compressed(consts::COMPRESSED_SRGB_ALPHA_S3TC_DXT1_EXT, 8),
        Bc2Unorm => GlFormat::compressed(consts::COMPRESSED_RGBA_S3TC_DXT3_EXT, 16),
        Bc3Unorm => GlFormat::compressed(consts::COMPRESSED_RGBA_S3TC_DXT5_EXT, 16),
    };
    Ok(converted)
}

/// Renderbuffer formats backing a depth-stencil buffer that is never sampled.
pub fn depth_renderbuffer_storage(format: PixelFormat, caps: &GlCaps) -> Result<DepthStorage> {
    let fallback_depth = if caps.has_depth24 {
        consts::DEPTH_COMPONENT24_OES
    } else {
        gl::DEPTH_COMPONENT16
    };
    let storage = match format {
        PixelFormat::Depth16Unorm => DepthStorage {
            depth: gl::DEPTH_COMPONENT16,
            separate_stencil: None,
        },
        PixelFormat::Depth32Float if !caps.is_es2 => DepthStorage {
            depth: gl::DEPTH_COMPONENT32F,
            separate_stencil: None,
        },
        PixelFormat::Depth32Float => DepthStorage {
            depth: fallback_depth,
            separate_stencil: None,
        },
        PixelFormat::Depth32FloatStencil8 if !caps.is_es2 => DepthStorage {
            depth: gl::DEPTH32F_STENCIL8,
            separate_stencil: None,
        },
        PixelFormat::Depth24UnormStencil8 | PixelFormat::Depth32FloatStencil8 => {
            if caps.has_packed_depth_stencil {
                DepthStorage {
                    depth: gl::DEPTH24_STENCIL8,
                    separate_stencil: None,
                }
            } else {
                DepthStorage {
                    depth: fallback_depth,
                    separate_stencil: Some(gl::STENCIL_INDEX8),
                }
            }
        }
        other => return Err(unsupported(other)),
    };
    Ok(storage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn desktop() -> GlCaps {
        GlCaps::from_strings("4.3.0", "")
    }

    fn es2() -> GlCaps {
        GlCaps::from_strings("OpenGL ES 2.0", "GL_OES_depth24")
    }

    #[rstest]
    #[case(PixelFormat::Rgba8Unorm, gl::RGBA8, gl::RGBA, 4)]
    #[case(PixelFormat::Bgra8Unorm, gl::RGBA8, gl::BGRA, 4)]
    #[case(PixelFormat::Rgba32Float, gl::RGBA32F, gl::RGBA, 16)]
    #[case(PixelFormat::Depth24UnormStencil8, gl::DEPTH24_STENCIL8, gl::DEPTH_STENCIL, 4)]
    #[case(PixelFormat::R8Unorm, gl::R8, gl::RED, 1)]
    fn desktop_triples(
        #[case] format: PixelFormat,
        #[case] internal: GLenum,
        #[case] transfer: GLenum,
        #[case] size: u32,
    ) {
        let gl_format = convert_pixel_format(format, &desktop()).unwrap();
        assert_eq!(gl_format.internal_format, internal);
        assert_eq!(gl_format.format, transfer);
        assert_eq!(gl_format.pixel_size, size);
    }

    #[test]
    fn es2_rejects_float_formats() {
        let err = convert_pixel_format(PixelFormat::Rgba32Float, &es2()).unwrap_err();
        assert!(matches!(
            gfx_core::graphics_error(&err),
            Some(GraphicsError::Unsupported(_))
        ));
    }

    #[test]
    fn srgb_falls_back_without_support() {
        let gl_format = convert_pixel_format(PixelFormat::Rgba8UnormSrgb, &es2()).unwrap();
        assert_eq!(gl_format.internal_format, gl::RGBA);
    }

    #[test]
    fn es2_without_packed_depth_uses_separate_stencil() {
        let storage = depth_renderbuffer_storage(PixelFormat::Depth24UnormStencil8, &es2()).unwrap();
        assert_eq!(storage.depth, consts::DEPTH_COMPONENT24_OES);
        assert_eq!(storage.separate_stencil, Some(gl::STENCIL_INDEX8));

        let packed = depth_renderbuffer_storage(PixelFormat::Depth24UnormStencil8, &desktop()).unwrap();
        assert_eq!(packed.separate_stencil, None);
    }

    #[test]
    fn compressed_formats_are_flagged() {
        let gl_format = convert_pixel_format(PixelFormat::Bc3Unorm, &desktop()).unwrap();
        assert!(gl_format.compressed);
        assert_eq!(gl_format.pixel_size, 16);
    }
}
