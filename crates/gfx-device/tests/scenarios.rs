//! End-to-end scenarios on the software backends.

use std::sync::Arc;

use gfx_core::{
    init_logging, Color4, DepthStencilClearOptions, DeviceConfig, GraphicsDeviceStatus, MapMode, MappedResource, PixelFormat,
    TextureDescription, TextureFlags,
};
use gfx_d3d12::{D3d12Device, SoftD3d12};
use gfx_device::{
    D3d12Presenter, GlPresenter, GraphicsDevice, HeadlessDevice, Presenter, PresenterDescription, RecoveryOutcome,
    ResumeManager,
};
use gfx_gl::{GlDevice, SoftGl, SoftPlatform, SoftProfile};
use rstest::rstest;

const SIZE: u32 = 256;
const RED: [u8; 4] = [255, 0, 0, 255];

fn target_description() -> TextureDescription {
    TextureDescription::new_2d(SIZE, SIZE, PixelFormat::Rgba8Unorm, TextureFlags::RENDER_TARGET | TextureFlags::SHADER_RESOURCE)
}

fn depth_description() -> TextureDescription {
    TextureDescription::new_2d(SIZE, SIZE, PixelFormat::Depth24UnormStencil8, TextureFlags::DEPTH_STENCIL)
}

fn staging_description() -> TextureDescription {
    TextureDescription::new_2d(SIZE, SIZE, PixelFormat::Rgba8Unorm, TextureFlags::empty()).to_staging()
}

/// Every texel of a `SIZE` × `SIZE` RGBA8 mapping.
fn texels(mapped: &MappedResource) -> Vec<[u8; 4]> {
    // SAFETY: the mapping is live until the caller unmaps it.
    let bytes = unsafe { mapped.as_slice() };
    let pitch = mapped.data.row_pitch as usize;
    (0..SIZE as usize)
        .flat_map(|row| bytes[row * pitch..row * pitch + SIZE as usize * 4].chunks_exact(4))
        .map(|texel| [texel[0], texel[1], texel[2], texel[3]])
        .collect()
}

#[rstest]
#[case::desktop(SoftProfile::Desktop43)]
#[case::es3(SoftProfile::Es3)]
#[case::es2(SoftProfile::Es2)]
fn gl_clear_reads_back_red(#[case] profile: SoftProfile) {
    init_logging();
    let mut device = GlDevice::new(
        Arc::new(SoftGl::with_profile(profile, SIZE, SIZE)),
        Arc::new(SoftPlatform::new(SIZE, SIZE)),
        DeviceConfig::default(),
    )
    .unwrap();
    device.begin().unwrap();
    let target = device.create_texture(target_description(), None).unwrap();
    let depth = device.create_texture(depth_description(), None).unwrap();
    let staging = device.create_texture(staging_description(), None).unwrap();

    let mut commands = device.command_list();
    commands.set_render_targets(Some(depth), &[Some(target)]).unwrap();
    commands
        .clear_depth_stencil(depth, DepthStencilClearOptions::DEPTH_BUFFER | DepthStencilClearOptions::STENCIL, 1.0, 0)
        .unwrap();
    commands.clear_render_target(target, Color4::new(1.0, 0.0, 0.0, 1.0)).unwrap();
    commands.copy(target, staging).unwrap();

    let mapped = commands.map_subresource(staging, 0, MapMode::Read, false, 0, 0).unwrap();
    let pixels = texels(&mapped);
    commands.unmap_subresource(staging, &mapped).unwrap();
    assert_eq!(pixels.len(), (SIZE * SIZE) as usize);
    assert!(pixels.iter().all(|&texel| texel == RED));
    device.end().unwrap();
}

#[test]
fn d3d12_clear_reads_back_red() {
    init_logging();
    let soft = Arc::new(SoftD3d12::new());
    let device = D3d12Device::new(Arc::clone(&soft), DeviceConfig::default()).unwrap();
    let target = device.create_texture(target_description(), None).unwrap();
    let depth = device.create_texture(depth_description(), None).unwrap();
    let staging = device.create_texture(staging_description(), None).unwrap();

    let mut list = device.create_command_list().unwrap();
    list.set_render_targets(Some(depth), &[Some(target)]).unwrap();
    list.clear_depth_stencil(depth, DepthStencilClearOptions::DEPTH_BUFFER | DepthStencilClearOptions::STENCIL, 1.0, 0)
        .unwrap();
    list.clear_render_target(target, Color4::new(1.0, 0.0, 0.0, 1.0)).unwrap();
    list.copy(target, staging).unwrap();

    let mapped = list.map_subresource(staging, 0, MapMode::Read, false, 0, 0).unwrap();
    assert_eq!(mapped.data.row_pitch, SIZE * 4);
    let pixels = texels(&mapped);
    list.unmap_subresource(staging, &mapped).unwrap();
    assert!(pixels.iter().all(|&texel| texel == RED));
    assert!(soft.validation_errors().is_empty());
}

#[test]
fn d3d12_non_blocking_map_before_completion_is_empty() {
    init_logging();
    let device = D3d12Device::new(Arc::new(SoftD3d12::new()), DeviceConfig::default()).unwrap();
    let target = device.create_texture(target_description(), None).unwrap();
    let staging = device.create_texture(staging_description(), None).unwrap();

    let mut list = device.create_command_list().unwrap();
    list.clear_render_target(target, Color4::new(1.0, 0.0, 0.0, 1.0)).unwrap();
    list.copy(target, staging).unwrap();
    let value = list.flush(false).unwrap();
    assert!(!device.is_fence_complete(value));

    let mapped = list.map_subresource(staging, 0, MapMode::Read, true, 0, 0).unwrap();
    assert!(mapped.is_empty());
    assert!(!device.is_fence_complete(value));

    device.wait_for_fence(value).unwrap();
    let mapped = list.map_subresource(staging, 0, MapMode::Read, true, 0, 0).unwrap();
    assert!(texels(&mapped).iter().all(|&texel| texel == RED));
    list.unmap_subresource(staging, &mapped).unwrap();
}

#[test]
fn gl_non_blocking_map_waits_for_the_readback_delay() {
    init_logging();
    let mut device = GlDevice::new(
        Arc::new(SoftGl::new(SIZE, SIZE)),
        Arc::new(SoftPlatform::new(SIZE, SIZE)),
        DeviceConfig::default(),
    )
    .unwrap();
    device.begin().unwrap();
    let target = device.create_texture(target_description(), None).unwrap();
    let staging = device.create_texture(staging_description(), None).unwrap();
    {
        let mut commands = device.command_list();
        commands.clear_render_target(target, Color4::new(1.0, 0.0, 0.0, 1.0)).unwrap();
        commands.copy(target, staging).unwrap();
        let mapped = commands.map_subresource(staging, 0, MapMode::Read, true, 0, 0).unwrap();
        assert!(mapped.is_empty());
    }

    for _ in 0..device.config().readback_frame_delay {
        device.begin_frame();
    }
    let mut commands = device.command_list();
    let mapped = commands.map_subresource(staging, 0, MapMode::Read, true, 0, 0).unwrap();
    assert!(texels(&mapped).iter().all(|&texel| texel == RED));
    commands.unmap_subresource(staging, &mapped).unwrap();
    device.end().unwrap();
}

#[test]
fn gl_frames_survive_a_simulated_reset() {
    init_logging();
    let mut device = HeadlessDevice::headless_gl(SoftProfile::Desktop43, 64, 64, DeviceConfig::default()).unwrap();
    let mut manager = ResumeManager::default();
    let GraphicsDevice::OpenGl(gl) = &mut device else {
        unreachable!("headless_gl returns a GL device");
    };
    let mut presenter = GlPresenter::new(gl, PresenterDescription::new(64, 64)).unwrap();

    for frame in 0..3 {
        if frame == 1 {
            device.simulate_reset();
        }
        let outcome = manager.on_frame(&mut device).unwrap();
        assert!(outcome.can_render());
        assert_eq!(outcome == RecoveryOutcome::Healthy, frame != 1);

        let GraphicsDevice::OpenGl(gl) = &mut device else {
            unreachable!();
        };
        gl.begin().unwrap();
        let back_buffer = presenter.back_buffer();
        gl.command_list()
            .clear_render_target(back_buffer.color, Color4::new(0.0, 0.0, 1.0, 1.0))
            .unwrap();
        gl.end().unwrap();
        presenter.present(gl).unwrap();
    }
    assert_eq!(device.status(), GraphicsDeviceStatus::Normal);
    assert_eq!(device.frame_counter(), 3);
}

#[test]
fn d3d12_frames_survive_a_simulated_reset() {
    init_logging();
    let device = D3d12Device::new(Arc::new(SoftD3d12::new()), DeviceConfig::default()).unwrap();
    let mut presenter = D3d12Presenter::new(Arc::clone(&device), PresenterDescription::new(64, 64)).unwrap();
    let mut recoverable = Arc::clone(&device);
    let mut manager = ResumeManager::default();

    for frame in 0..3 {
        if frame == 1 {
            device.simulate_reset();
        }
        assert!(manager.on_frame(&mut recoverable).unwrap().can_render());

        // Command lists do not outlive a frame, so none is alive across
        // the recovery.
        let mut list = device.create_command_list().unwrap();
        let back_buffer = presenter.back_buffer();
        list.set_render_target(back_buffer.depth_stencil, Some(back_buffer.color)).unwrap();
        list.clear_render_target(back_buffer.color, Color4::new(0.0, 0.0, 1.0, 1.0)).unwrap();
        presenter.present(&mut list).unwrap();
    }
    device.wait_idle().unwrap();
    assert_eq!(device.frame_counter(), 3);
}
