// SPDX-License-Identifier: CEPL-1.0
//! End-to-end runs against `VK_EXT_headless_surface`.
//!
//! Machines without a Vulkan loader, the headless-surface extension, or a
//! device that can present to it skip each test with a message on stderr.
use std::sync::Arc;

use vista_render::RenderSize;
use vista_render_vk::{
    vk, BufferAllocation, DeviceSelector, FrameState, RenderError, RendererConfig,
    SelectorOptions, StagingTransfer, VkRenderer,
};

fn selector() -> Option<DeviceSelector> {
    vista_core::init_tracing();
    let options = SelectorOptions {
        application_name: "vista-tests".to_owned(),
        validation: false,
    };
    match DeviceSelector::headless(options) {
        Ok(s) => Some(s),
        Err(e) => {
            eprintln!("skipping: no headless Vulkan instance ({e:#})");
            None
        }
    }
}

fn renderer(selector: &mut DeviceSelector, config: RendererConfig) -> Option<VkRenderer> {
    match selector.make_headless_renderer(config) {
        Ok(r) => Some(r),
        Err(e) if matches!(e.downcast_ref::<RenderError>(), Some(RenderError::NoSuitableDevice)) => {
            eprintln!("skipping: {e:#}");
            None
        }
        Err(e) => panic!("renderer construction failed: {e:#}"),
    }
}

fn assert_counts_consistent(r: &VkRenderer) {
    let n = r.image_count();
    assert!(n >= 1);
    assert_eq!(r.view_count(), n);
    assert_eq!(r.framebuffer_count(), n);
    assert_eq!(r.command_buffer_count(), n);
    assert_eq!(r.descriptor_set_count(), n);
}

#[test]
fn draw_once_signals_in_flight_fence() {
    let Some(mut sel) = selector() else { return };
    let Some(mut r) = renderer(&mut sel, RendererConfig::default()) else {
        return;
    };
    assert_eq!(
        r.extent(),
        vk::Extent2D {
            width: 230,
            height: 230
        }
    );
    assert_counts_consistent(&r);

    r.draw().expect("draw");
    assert_eq!(r.frame_state(), FrameState::Presented);
    assert!(!r.is_poisoned());
    r.device().wait_idle().expect("wait idle");
    assert!(r.in_flight_signaled().expect("fence status"));
}

#[test]
fn resize_rebuilds_per_image_state() {
    let Some(mut sel) = selector() else { return };
    let Some(mut r) = renderer(&mut sel, RendererConfig::default()) else {
        return;
    };
    r.draw().expect("first draw");

    r.resize(800, 600).expect("resize");
    assert_eq!(
        r.extent(),
        vk::Extent2D {
            width: 800,
            height: 600
        }
    );
    assert_counts_consistent(&r);
    r.draw().expect("draw after resize");
}

#[test]
fn repeated_resize_is_idempotent() {
    let Some(mut sel) = selector() else { return };
    let Some(mut r) = renderer(&mut sel, RendererConfig::default()) else {
        return;
    };
    r.resize(640, 480).expect("resize");
    let cmds = r.command_buffer_count();
    let sets = r.descriptor_set_count();

    r.resize(640, 480).expect("same resize");
    assert_eq!(r.command_buffer_count(), cmds);
    assert_eq!(r.descriptor_set_count(), sets);
    r.draw().expect("draw");
}

#[test]
fn zero_extent_pauses_drawing() {
    let Some(mut sel) = selector() else { return };
    let Some(mut r) = renderer(&mut sel, RendererConfig::default()) else {
        return;
    };
    r.resize(0, 0).expect("minimise");
    assert!(r.is_paused());
    assert_eq!(r.command_buffer_count(), 0);
    r.draw().expect("paused draw is a no-op");

    r.resize(320, 200).expect("restore");
    assert!(!r.is_paused());
    assert_counts_consistent(&r);
    r.draw().expect("draw after restore");
}

#[test]
fn renderers_share_one_device() {
    let Some(mut sel) = selector() else { return };
    let Some(mut a) = renderer(&mut sel, RendererConfig::default()) else {
        return;
    };
    let config = RendererConfig {
        target_extent: RenderSize::new(400, 300),
        ..RendererConfig::default()
    };
    let mut b = sel.make_headless_renderer(config).expect("second renderer");

    assert!(Arc::ptr_eq(a.device(), b.device()));
    assert_eq!(a.device().handle(), b.device().handle());
    assert_eq!(sel.devices().len(), 1);

    a.draw().expect("draw a");
    b.draw().expect("draw b");
    a.draw().expect("draw a again");
}

#[test]
fn textured_renderer_draws() {
    let Some(mut sel) = selector() else { return };
    let texture = vista_render_vk::PixelBuffer::checkerboard(
        64,
        8,
        [255, 255, 255, 255],
        [40, 40, 40, 255],
    )
    .expect("checkerboard");
    let config = RendererConfig {
        texture: Some(texture),
        ..RendererConfig::default()
    };
    let Some(mut r) = renderer(&mut sel, config) else {
        return;
    };
    assert_counts_consistent(&r);
    r.draw().expect("draw");
    r.set_clear_color([0.2, 0.3, 0.4, 1.0])
        .expect("set clear color");
    r.draw().expect("draw after clear color change");
}

#[test]
fn missing_shader_dir_fails_construction() {
    let Some(mut sel) = selector() else { return };
    let config = RendererConfig {
        shader_dir: Some("/nonexistent/vista-shaders".into()),
        ..RendererConfig::default()
    };
    match sel.make_headless_renderer(config) {
        Ok(_) => panic!("construction should fail without shader modules"),
        Err(e) => match e.downcast_ref::<RenderError>() {
            Some(RenderError::NoSuitableDevice) => eprintln!("skipping: {e:#}"),
            Some(RenderError::ShaderLoad { .. }) => {}
            other => panic!("unexpected error {other:?}: {e:#}"),
        },
    }
}

#[test]
fn staged_bytes_round_trip() {
    let Some(mut sel) = selector() else { return };
    let Some(r) = renderer(&mut sel, RendererConfig::default()) else {
        return;
    };
    let device = r.device();
    let pool = device.create_graphics_command_pool().expect("pool");
    let transfer = StagingTransfer::new(device, pool);

    let bytes: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
    let mut staging = transfer.stage(&bytes).expect("stage");
    let mut dst = BufferAllocation::host_visible(
        device,
        bytes.len() as vk::DeviceSize,
        vk::BufferUsageFlags::TRANSFER_DST,
    )
    .expect("destination");
    let region = vk::BufferCopy {
        src_offset: 0,
        dst_offset: 0,
        size: bytes.len() as vk::DeviceSize,
    };
    transfer
        .copy_buffer(staging.buffer, dst.buffer, region)
        .expect("copy");

    let back = dst.read_bytes(device, bytes.len()).expect("read back");
    assert_eq!(back, bytes);

    staging.destroy(device);
    dst.destroy(device);
    device.destroy_command_pool(pool);
}
