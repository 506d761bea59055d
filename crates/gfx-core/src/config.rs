//! Device configuration.

use std::env;

use tracing::warn;

use crate::flags::DeviceCreationFlags;

/// Feature profiles, tried in order at device creation.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GraphicsProfile {
    Level_9_1,
    Level_9_2,
    Level_9_3,
    Level_10_0,
    Level_10_1,
    Level_11_0,
    Level_11_1,
    Level_11_2,
}

impl GraphicsProfile {
    /// Matching desktop GL version (major, minor).
    pub fn gl_version(self) -> (u32, u32) {
        match self {
            GraphicsProfile::Level_9_1 | GraphicsProfile::Level_9_2 | GraphicsProfile::Level_9_3 => (3, 0),
            GraphicsProfile::Level_10_0 | GraphicsProfile::Level_10_1 => (3, 3),
            GraphicsProfile::Level_11_0 | GraphicsProfile::Level_11_1 | GraphicsProfile::Level_11_2 => (4, 3),
        }
    }

    /// Matching GL ES version (major, minor). Levels below 10 run on ES 2.
    pub fn gles_version(self) -> (u32, u32) {
        match self {
            GraphicsProfile::Level_9_1 | GraphicsProfile::Level_9_2 | GraphicsProfile::Level_9_3 => (2, 0),
            GraphicsProfile::Level_10_0 | GraphicsProfile::Level_10_1 => (3, 0),
            GraphicsProfile::Level_11_0 => (3, 1),
            GraphicsProfile::Level_11_1 | GraphicsProfile::Level_11_2 => (3, 2),
        }
    }
}

/// How background threads get a GL context for resource creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AsyncCreationMode {
    /// Use a shared secondary context when the platform can create one.
    #[default]
    Auto,
    /// Require a shared secondary context.
    SharedContext,
    /// Always run background creation on the main context under a lock.
    MainThread,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub flags: DeviceCreationFlags,
    /// Profiles to try, in order.
    pub profiles: Vec<GraphicsProfile>,
    /// Descriptors in each shader-visible SRV/CBV/UAV heap.
    pub srv_heap_size: u32,
    /// Descriptors in each shader-visible sampler heap.
    pub sampler_heap_size: u32,
    /// Descriptors in each CPU-side heap of a descriptor allocator.
    pub descriptors_per_cpu_heap: u32,
    /// Minimum size of an upload buffer chunk.
    pub upload_buffer_size: u64,
    /// Frames a GL pixel buffer is given before a non-blocking map reads it.
    pub readback_frame_delay: u64,
    pub max_bound_render_targets: usize,
    pub max_texture_units: usize,
    pub async_creation: AsyncCreationMode,
    /// Emit debug groups around `begin_profile`/`end_profile`.
    pub profile_markers: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            flags: DeviceCreationFlags::empty(),
            profiles: vec![GraphicsProfile::Level_11_0],
            srv_heap_size: 2048,
            sampler_heap_size: 64,
            descriptors_per_cpu_heap: 256,
            upload_buffer_size: 4 * 1024 * 1024,
            readback_frame_delay: 2,
            max_bound_render_targets: 16,
            max_texture_units: 64,
            async_creation: AsyncCreationMode::Auto,
            profile_markers: false,
        }
    }
}

impl DeviceConfig {
    /// Defaults overridden by `GFX_DEBUG`, `GFX_READBACK_FRAME_DELAY` and
    /// `GFX_ASYNC_CREATION` (`auto`, `shared`, `main`).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if env_flag("GFX_DEBUG") {
            config.flags |= DeviceCreationFlags::DEBUG;
        }
        if let Ok(value) = env::var("GFX_READBACK_FRAME_DELAY") {
            match value.parse() {
                Ok(delay) => config.readback_frame_delay = delay,
                Err(_) => warn!(value, "ignoring invalid GFX_READBACK_FRAME_DELAY"),
            }
        }
        if let Ok(value) = env::var("GFX_ASYNC_CREATION") {
            config.async_creation = match value.to_ascii_lowercase().as_str() {
                "shared" => AsyncCreationMode::SharedContext,
                "main" => AsyncCreationMode::MainThread,
                "auto" => AsyncCreationMode::Auto,
                _ => {
                    warn!(value, "ignoring invalid GFX_ASYNC_CREATION");
                    AsyncCreationMode::Auto
                }
            };
        }
        config
    }

    pub fn with_flags(mut self, flags: DeviceCreationFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_profiles(mut self, profiles: impl Into<Vec<GraphicsProfile>>) -> Self {
        self.profiles = profiles.into();
        self
    }

    pub fn with_heap_sizes(mut self, srv_heap_size: u32, sampler_heap_size: u32) -> Self {
        self.srv_heap_size = srv_heap_size;
        self.sampler_heap_size = sampler_heap_size;
        self
    }

    pub fn with_async_creation(mut self, mode: AsyncCreationMode) -> Self {
        self.async_creation = mode;
        self
    }

    pub fn is_debug(&self) -> bool {
        self.flags.contains(DeviceCreationFlags::DEBUG)
    }

    /// Highest requested profile.
    pub fn max_profile(&self) -> GraphicsProfile {
        self.profiles
            .iter()
            .copied()
            .max()
            .unwrap_or(GraphicsProfile::Level_11_0)
    }
}

fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = DeviceConfig::default();
        assert_eq!(config.srv_heap_size, 2048);
        assert_eq!(config.sampler_heap_size, 64);
        assert_eq!(config.descriptors_per_cpu_heap, 256);
        assert_eq!(config.readback_frame_delay, 2);
        assert!(!config.is_debug());
    }

    #[test]
    fn max_profile_picks_highest() {
        let config = DeviceConfig::default()
            .with_profiles([GraphicsProfile::Level_9_3, GraphicsProfile::Level_10_1]);
        assert_eq!(config.max_profile(), GraphicsProfile::Level_10_1);
        assert_eq!(config.max_profile().gles_version(), (3, 0));
    }

    #[test]
    fn environment_overrides_defaults() {
        env::set_var("GFX_DEBUG", "1");
        env::set_var("GFX_READBACK_FRAME_DELAY", "5");
        env::set_var("GFX_ASYNC_CREATION", "bogus");
        let config = DeviceConfig::from_env();
        env::remove_var("GFX_DEBUG");
        env::remove_var("GFX_READBACK_FRAME_DELAY");
        env::remove_var("GFX_ASYNC_CREATION");

        assert!(config.is_debug());
        assert_eq!(config.readback_frame_delay, 5);
        assert_eq!(config.async_creation, AsyncCreationMode::Auto);
    }
}
