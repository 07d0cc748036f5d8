mod common;

use std::time::Duration;

use rstest::rstest;
use wren_render::{
    hal::DeviceDesc, id::ResourceId, DeviceContext, FrameFence, HeadlessDesc, HeadlessGpu,
    OffscreenSurface, RenderBackend, RenderError, RendererConfig, SyncPolicy, Violation,
};

use common::{renderer, renderer_with, slow_device, textured_scene, HEIGHT, WIDTH};

#[rstest]
fn repeated_cycles_drain_before_destroying(
    #[values(1, 3, 5)] cycles: usize,
    #[values(SyncPolicy::Lockstep, SyncPolicy::FramesInFlight)] policy: SyncPolicy,
) {
    let (mut renderer, probe) = renderer_with(slow_device(), common::config(policy), textured_scene());

    for _ in 0..cycles {
        renderer
            .initialize(&OffscreenSurface::new(WIDTH, HEIGHT))
            .unwrap();
        for _ in 0..3 {
            renderer.render().unwrap();
        }
        let buffers = renderer.buffers().to_vec();
        let textures = renderer.textures().to_vec();
        renderer.shutdown().unwrap();

        let audit = renderer.shutdown_audit().unwrap();
        assert!(audit.is_drained(), "{audit:?}");
        assert!(buffers
            .into_iter()
            .all(|buffer| probe.is_destroyed(ResourceId::Buffer(buffer))));
        assert!(textures
            .into_iter()
            .all(|texture| probe.is_destroyed(ResourceId::Texture(texture))));
    }

    assert!(!renderer.is_initialized());
    assert!(probe.violations().is_empty(), "{:?}", probe.violations());
}

#[test]
fn fence_values_keep_rising_across_cycles() {
    let (mut renderer, _probe) = renderer(SyncPolicy::Lockstep);

    renderer
        .initialize(&OffscreenSurface::new(WIDTH, HEIGHT))
        .unwrap();
    let first = renderer.render().unwrap().fence_value;
    renderer.shutdown().unwrap();

    renderer
        .initialize(&OffscreenSurface::new(WIDTH, HEIGHT))
        .unwrap();
    let second = renderer.render().unwrap().fence_value;
    renderer.shutdown().unwrap();

    assert!(second > first, "{second} <= {first}");
}

#[test]
fn dropping_an_initialized_renderer_drains_it() {
    let (mut renderer, probe) =
        renderer_with(slow_device(), common::config(SyncPolicy::FramesInFlight), textured_scene());
    renderer
        .initialize(&OffscreenSurface::new(WIDTH, HEIGHT))
        .unwrap();
    for _ in 0..4 {
        renderer.render().unwrap();
    }
    let buffers = renderer.buffers().to_vec();
    drop(renderer);

    assert!(probe.completed_value() >= 4);
    assert!(buffers
        .into_iter()
        .all(|buffer| probe.is_destroyed(ResourceId::Buffer(buffer))));
    assert!(probe.violations().is_empty(), "{:?}", probe.violations());
}

#[test]
fn stalled_device_times_out_instead_of_hanging() {
    let config = RendererConfig {
        fence_timeout_ms: Some(50),
        ..Default::default()
    };
    let (mut renderer, probe) =
        renderer_with(HeadlessDesc::default(), config, textured_scene());
    renderer
        .initialize(&OffscreenSurface::new(WIDTH, HEIGHT))
        .unwrap();

    probe.stall();
    let err = renderer.render().unwrap_err();
    assert!(
        matches!(err, RenderError::SyncTimeout { value: v, .. } if v > 0),
        "{err:?}"
    );
    assert!(err.is_fatal());

    probe.resume();
    renderer.shutdown().unwrap();
    assert!(renderer.shutdown_audit().unwrap().is_drained());
}

#[test]
fn failed_shutdown_is_released_by_the_next_initialize() {
    let config = RendererConfig {
        fence_timeout_ms: Some(50),
        ..Default::default()
    };
    let (mut renderer, probe) =
        renderer_with(HeadlessDesc::default(), config, textured_scene());
    renderer
        .initialize(&OffscreenSurface::new(WIDTH, HEIGHT))
        .unwrap();
    renderer.render().unwrap();
    let buffers = renderer.buffers().to_vec();

    probe.stall();
    assert!(matches!(
        renderer.render(),
        Err(RenderError::SyncTimeout { .. })
    ));
    assert!(matches!(
        renderer.shutdown(),
        Err(RenderError::SyncTimeout { .. })
    ));
    assert!(!renderer.is_initialized());
    assert!(renderer.has_stranded_resources());
    assert!(buffers
        .iter()
        .all(|buffer| !probe.is_destroyed(ResourceId::Buffer(*buffer))));

    probe.resume();
    renderer
        .initialize(&OffscreenSurface::new(WIDTH, HEIGHT))
        .unwrap();
    assert!(!renderer.has_stranded_resources());
    assert!(buffers
        .into_iter()
        .all(|buffer| probe.is_destroyed(ResourceId::Buffer(buffer))));

    let before = renderer.fence_audit().unwrap().last_signaled;
    let stats = renderer.render().unwrap();
    assert!(stats.fence_value > before);
    renderer.shutdown().unwrap();

    let violations = probe.violations();
    assert!(
        !violations
            .iter()
            .any(|v| matches!(v, Violation::NonMonotonicSignal { .. })),
        "{violations:?}"
    );
    assert!(violations.is_empty(), "{violations:?}");
}

#[test]
fn refused_upload_signal_destroys_nothing_early() {
    let (mut renderer, probe) = renderer(SyncPolicy::Lockstep);
    probe.refuse_signals();
    assert!(matches!(
        renderer.initialize(&OffscreenSurface::new(WIDTH, HEIGHT)),
        Err(RenderError::Backend(_))
    ));
    assert!(!renderer.is_initialized());
    assert!(renderer.has_stranded_resources());

    probe.accept_signals();
    renderer
        .initialize(&OffscreenSurface::new(WIDTH, HEIGHT))
        .unwrap();
    renderer.render().unwrap();
    renderer.shutdown().unwrap();
    assert!(probe.violations().is_empty(), "{:?}", probe.violations());
}

#[test]
fn lost_surface_fails_the_present() {
    let (mut renderer, probe) = renderer(SyncPolicy::Lockstep);
    renderer
        .initialize(&OffscreenSurface::new(WIDTH, HEIGHT))
        .unwrap();
    renderer.render().unwrap();

    probe.lose_surface();
    assert!(matches!(
        renderer.render(),
        Err(RenderError::PresentFailed(_))
    ));
    renderer.shutdown().unwrap();
    assert!(probe.violations().is_empty(), "{:?}", probe.violations());
}

#[test]
fn waiting_on_an_unscheduled_value_is_refused() {
    let device = DeviceContext::new(
        HeadlessGpu::new(HeadlessDesc::default()),
        &DeviceDesc::default(),
    )
    .unwrap();
    let mut fence = FrameFence::new(&device, Some(Duration::from_secs(1)));

    assert!(matches!(
        fence.wait_until(&device, 3),
        Err(RenderError::FenceNotScheduled {
            requested: 3,
            last_signaled: 0
        })
    ));
}

#[test]
fn adapter_below_the_minimum_feature_level_is_unavailable() {
    let gpu = HeadlessGpu::new(HeadlessDesc::default());
    let desc = DeviceDesc {
        min_feature_level: wren_render::FeatureLevel::Level12_1,
        debug_layer: false,
    };
    assert!(matches!(
        DeviceContext::new(gpu, &desc),
        Err(RenderError::DeviceUnavailable(_))
    ));
}

#[test]
fn zero_sized_surface_is_rejected() {
    let (mut renderer, _probe) = renderer(SyncPolicy::Lockstep);
    assert!(matches!(
        renderer.initialize(&OffscreenSurface::new(0, HEIGHT)),
        Err(RenderError::SurfaceCreationFailed(_))
    ));
    assert!(!renderer.is_initialized());

    renderer
        .initialize(&OffscreenSurface::new(WIDTH, HEIGHT))
        .unwrap();
    renderer.render().unwrap();
}
