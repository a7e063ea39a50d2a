mod common;

use ember_renderer::{
    BufferHandle, Deferred, EngineEvent, Key, KeyboardOverlay, LoopControl, LoopState, NoOverlay,
    RendererError, EMPTY_BACKGROUND,
};
use ember_rhi::headless::{HeadlessEvent, RecordedCommand};
use ember_rhi::{BufferDescriptor, BufferUsage, ClearColor};

fn submitted(events: &[HeadlessEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, HeadlessEvent::Submitted { .. }))
        .count()
}

fn swapchain_churn(events: &[HeadlessEvent]) -> Vec<&HeadlessEvent> {
    events
        .iter()
        .filter(|e| {
            matches!(
                e,
                HeadlessEvent::SwapchainCreated { .. } | HeadlessEvent::SwapchainDestroyed { .. }
            )
        })
        .collect()
}

#[test]
fn frame_is_acquired_submitted_then_presented() {
    let (device, mut engine) = common::engine();
    device.clear_events();
    let control = engine.tick(&[], common::WINDOW, &mut NoOverlay).unwrap();
    assert_eq!(control, LoopControl::Continue);

    let events = device.events();
    let acquired = events
        .iter()
        .position(|e| matches!(e, HeadlessEvent::Acquired { .. }))
        .unwrap();
    let submit = events
        .iter()
        .position(|e| matches!(e, HeadlessEvent::Submitted { .. }))
        .unwrap();
    let presented = events
        .iter()
        .position(|e| matches!(e, HeadlessEvent::Presented { .. }))
        .unwrap();
    assert!(acquired < submit && submit < presented);

    match &events[submit] {
        HeadlessEvent::Submitted {
            wait_semaphores,
            signal_semaphores,
            fence,
            ..
        } => {
            assert_eq!(*wait_semaphores, 1);
            assert_eq!(*signal_semaphores, 1);
            assert!(fence.is_some());
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[test]
fn stale_acquire_skips_the_frame_then_rebuilds_once() {
    let (device, mut engine) = common::engine();
    engine.tick(&[], common::WINDOW, &mut NoOverlay).unwrap();
    let frame_number = engine.frames().frame_number();

    device.fail_next_acquires(1);
    device.clear_events();
    assert_eq!(
        engine.tick(&[], common::WINDOW, &mut NoOverlay).unwrap(),
        LoopControl::Continue
    );
    assert_eq!(submitted(&device.events()), 0);
    assert_eq!(engine.state(), LoopState::ResizePending);
    assert_eq!(engine.frames().frame_number(), frame_number);
    assert_eq!(engine.stats().frames_skipped, 1);

    device.clear_events();
    engine.tick(&[], (200, 100), &mut NoOverlay).unwrap();
    let events = device.events();
    assert_eq!(
        swapchain_churn(&events),
        vec![
            &HeadlessEvent::SwapchainDestroyed {
                extent: common::WINDOW
            },
            &HeadlessEvent::SwapchainCreated { extent: (200, 100) },
        ]
    );
    assert_eq!(submitted(&events), 1);
    assert_eq!(engine.state(), LoopState::Running);
    assert_eq!(engine.stats().swapchain_rebuilds, 1);
}

#[test]
fn stale_present_requests_a_resize() {
    let (device, mut engine) = common::engine();
    device.fail_next_presents(1);
    engine.tick(&[], common::WINDOW, &mut NoOverlay).unwrap();
    assert_eq!(engine.state(), LoopState::ResizePending);
    assert_eq!(engine.stats().frames_submitted, 1);
    assert_eq!(engine.frames().frame_number(), 1);
}

#[test]
fn zero_window_size_keeps_the_resize_pending() {
    let (device, mut engine) = common::engine();
    device.fail_next_acquires(1);
    engine.tick(&[], common::WINDOW, &mut NoOverlay).unwrap();

    device.clear_events();
    assert_eq!(
        engine.tick(&[], (0, 0), &mut NoOverlay).unwrap(),
        LoopControl::Throttle
    );
    assert!(swapchain_churn(&device.events()).is_empty());
    assert_eq!(engine.state(), LoopState::ResizePending);

    engine.tick(&[], (64, 64), &mut NoOverlay).unwrap();
    assert_eq!(engine.state(), LoopState::Running);
    assert_eq!(engine.swapchain().extent(), Some((64, 64)));
}

#[test]
fn minimized_engine_throttles_until_restored() {
    let (device, mut engine) = common::engine();
    device.clear_events();
    assert_eq!(
        engine
            .tick(&[EngineEvent::Minimized], common::WINDOW, &mut NoOverlay)
            .unwrap(),
        LoopControl::Throttle
    );
    assert_eq!(
        engine.tick(&[], common::WINDOW, &mut NoOverlay).unwrap(),
        LoopControl::Throttle
    );
    assert_eq!(submitted(&device.events()), 0);

    assert_eq!(
        engine
            .tick(&[EngineEvent::Restored], common::WINDOW, &mut NoOverlay)
            .unwrap(),
        LoopControl::Continue
    );
    assert_eq!(submitted(&device.events()), 1);
}

#[test]
fn escape_exits_without_drawing() {
    let (device, mut engine) = common::engine();
    device.clear_events();
    let control = engine
        .tick(
            &[EngineEvent::KeyPressed(Key::Escape)],
            common::WINDOW,
            &mut NoOverlay,
        )
        .unwrap();
    assert_eq!(control, LoopControl::Exit);
    assert_eq!(submitted(&device.events()), 0);
}

#[test]
fn keys_reach_the_overlay() {
    let (_device, mut engine) = common::engine();
    let mut overlay = KeyboardOverlay::default();
    engine
        .tick(
            &[EngineEvent::KeyPressed(Key::Right)],
            common::WINDOW,
            &mut overlay,
        )
        .unwrap();
    assert_eq!(engine.tunables().active().map(|e| e.name), Some("sky"));
}

#[test]
fn active_effect_parameters_are_pushed() {
    let (device, mut engine) = common::engine();
    engine.tick(&[], common::WINDOW, &mut NoOverlay).unwrap();
    let submissions = device.submissions();
    let frame = submissions.last().unwrap();
    let push = frame
        .iter()
        .find_map(|c| match c {
            RecordedCommand::PushConstants { data } if data.len() == 64 => Some(data.clone()),
            _ => None,
        })
        .unwrap();
    let gradient_top: &[u8] = bytemuck::cast_slice(&[1.0f32, 0.0, 0.0, 1.0]);
    assert_eq!(&push[..16], gradient_top);
}

#[test]
fn render_scale_shrinks_dispatch_and_blit_source() {
    let (device, mut engine) = common::engine();
    engine.tunables_mut().render_scale = 0.5;
    engine.tick(&[], common::WINDOW, &mut NoOverlay).unwrap();
    let submissions = device.submissions();
    let frame = submissions.last().unwrap();
    assert!(frame.contains(&RecordedCommand::Dispatch { x: 4, y: 2, z: 1 }));
    let blit = frame
        .iter()
        .find_map(|c| match c {
            RecordedCommand::Blit {
                src_extent,
                dst_extent,
                ..
            } => Some((*src_extent, *dst_extent)),
            _ => None,
        })
        .unwrap();
    assert_eq!(blit, ((64, 32), common::WINDOW));

    let push = frame
        .iter()
        .find_map(|c| match c {
            RecordedCommand::PushConstants { data } if data.len() == 64 => Some(data.clone()),
            _ => None,
        })
        .unwrap();
    let extent: &[u8] = bytemuck::cast_slice(&[64.0f32, 32.0]);
    assert_eq!(&push[48..56], extent);
}

/// Color clears of the first render pass, which is the geometry pass.
fn geometry_clears(commands: &[RecordedCommand]) -> Vec<Option<ClearColor>> {
    commands
        .iter()
        .find_map(|c| match c {
            RecordedCommand::BeginRendering { clears, .. } => Some(clears.clone()),
            _ => None,
        })
        .unwrap()
}

#[test]
fn background_effect_fills_the_draw_image_before_geometry() {
    let (device, mut engine) = common::engine();
    engine.tick(&[], common::WINDOW, &mut NoOverlay).unwrap();
    let submissions = device.submissions();
    assert_eq!(geometry_clears(submissions.last().unwrap()), vec![None]);
}

#[test]
fn no_active_effect_clears_the_draw_image() {
    let (device, mut engine) = common::engine();
    engine.tunables_mut().effects.clear();
    engine.tick(&[], common::WINDOW, &mut NoOverlay).unwrap();

    let submissions = device.submissions();
    let frame = submissions.last().unwrap();
    assert!(!frame
        .iter()
        .any(|c| matches!(c, RecordedCommand::Dispatch { .. })));
    assert_eq!(geometry_clears(frame), vec![Some(EMPTY_BACKGROUND)]);
}

#[test]
fn per_frame_buffers_are_bounded_and_released() {
    let (device, mut engine) = common::engine();
    for _ in 0..5 {
        engine.tick(&[], common::WINDOW, &mut NoOverlay).unwrap();
    }
    // The quad's two buffers plus one scene buffer per slot.
    assert_eq!(device.live_buffer_count(), 4);
    for slot in 0..engine.frames().len() {
        assert_eq!(engine.frames().slot(slot).unwrap().pending_deletions(), 1);
    }

    engine.cleanup().unwrap();
    assert_eq!(device.live_buffer_count(), 0);
    assert_eq!(engine.allocator().live_images(), 0);
}

#[test]
fn teardown_runs_in_reverse_creation_order() {
    let (device, mut engine) = common::engine();
    let created: Vec<u64> = device
        .events()
        .iter()
        .filter_map(|e| match e {
            HeadlessEvent::TextureCreated { id, .. } => Some(*id),
            _ => None,
        })
        .collect();
    device.clear_events();
    engine.cleanup().unwrap();

    let events = device.events();
    let destroyed_textures: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            HeadlessEvent::TextureDestroyed { id } => Some(*id),
            _ => None,
        })
        .collect();
    let mut expected = created;
    expected.reverse();
    assert_eq!(destroyed_textures, expected);

    let labels: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            HeadlessEvent::BufferDestroyed { label, .. } => *label,
            _ => None,
        })
        .collect();
    assert_eq!(labels, vec!["mesh indices", "mesh vertices"]);

    let last_buffer = events
        .iter()
        .rposition(|e| matches!(e, HeadlessEvent::BufferDestroyed { .. }))
        .unwrap();
    let first_texture = events
        .iter()
        .position(|e| matches!(e, HeadlessEvent::TextureDestroyed { .. }))
        .unwrap();
    assert!(last_buffer < first_texture);
}

#[test]
fn stalled_gpu_is_fatal() {
    let (device, mut engine) = common::engine();
    device.set_stalled(true);
    engine.tick(&[], common::WINDOW, &mut NoOverlay).unwrap();
    engine.tick(&[], common::WINDOW, &mut NoOverlay).unwrap();
    let err = engine.tick(&[], common::WINDOW, &mut NoOverlay).unwrap_err();
    assert!(matches!(err, RendererError::GpuTimeout { .. }));
    device.set_stalled(false);
}

fn transient_buffer(engine: &mut ember_renderer::Engine) -> BufferHandle {
    engine
        .allocator_mut()
        .create_buffer(&BufferDescriptor {
            label: Some("transient"),
            size: 16,
            usage: BufferUsage::STORAGE,
            ..Default::default()
        })
        .unwrap()
}

#[test]
fn failed_frame_teardown_still_flushes_global_state() {
    let (device, mut engine) = common::engine();
    engine.tick(&[], common::WINDOW, &mut NoOverlay).unwrap();
    let buffer = transient_buffer(&mut engine);
    // Registered twice: the second destroy hits a stale handle.
    engine.defer_per_frame(Deferred::Buffer(buffer));
    engine.defer_per_frame(Deferred::Buffer(buffer));

    let err = engine.cleanup().unwrap_err();
    assert!(matches!(err, RendererError::UnknownBuffer(h) if h == buffer));
    assert_eq!(engine.pending_global_deletions(), 0);
    assert!(!engine.swapchain().is_created());
    assert_eq!(device.live_buffer_count(), 0);
    assert_eq!(engine.allocator().live_images(), 0);

    assert!(engine.cleanup().is_ok());
}
