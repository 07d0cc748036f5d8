mod common;

use std::time::{Duration, Instant};

use rstest::rstest;
use wren_render::{
    command_encoder::Command,
    id::ResourceId,
    mesh::{Mesh, TexturedVertex},
    resource::ResourceState,
    FrameState, HeadlessDesc, OffscreenSurface, RenderBackend, SyncPolicy,
};

use common::{
    renderer, renderer_with, slow_device, textured_scene, two_pipeline_scene, HEIGHT, WIDTH,
};

#[test]
fn first_frame_presents_and_advances_the_ring() {
    let (mut renderer, probe) = renderer(SyncPolicy::Lockstep);
    renderer
        .initialize(&OffscreenSurface::new(WIDTH, HEIGHT))
        .unwrap();
    assert_eq!(renderer.surface_size(), Some((WIDTH, HEIGHT)));
    assert_eq!(renderer.current_image_index().unwrap(), 0);
    assert_eq!(renderer.frame_state(), Some(FrameState::Idle));

    let started = Instant::now();
    let stats = renderer.render().unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));

    assert_eq!(stats.frame, 1);
    assert_eq!(stats.image_index, 0);
    assert_eq!(renderer.current_image_index().unwrap(), 1);
    assert_eq!(probe.presents(), 1);
    assert_eq!(probe.draws(), 1);
    assert_eq!(renderer.frame_state(), Some(FrameState::Idle));
    // Clear color [0.0, 0.2, 0.4, 1.0].
    assert_eq!(probe.backbuffer_texel(0, 0, 0), Some([0, 51, 102, 255]));
    assert!(probe.violations().is_empty(), "{:?}", probe.violations());
}

#[rstest]
fn backbuffer_barriers_bracket_every_frame(
    #[values(SyncPolicy::Lockstep, SyncPolicy::FramesInFlight)] policy: SyncPolicy,
) {
    let (mut renderer, probe) = renderer_with(slow_device(), common::config(policy), two_pipeline_scene());
    renderer
        .initialize(&OffscreenSurface::new(WIDTH, HEIGHT))
        .unwrap();

    for _ in 0..6 {
        let stats = renderer.render().unwrap();
        let commands = renderer.last_commands().unwrap();
        let barriers: Vec<_> = commands
            .barriers()
            .filter(|b| b.resource == ResourceId::Backbuffer(stats.image_index))
            .map(|b| (b.before, b.after))
            .collect();
        assert_eq!(
            barriers,
            [
                (ResourceState::PresentSource, ResourceState::RenderTarget),
                (ResourceState::RenderTarget, ResourceState::PresentSource),
            ]
        );

        let first = commands
            .commands()
            .iter()
            .position(|c| matches!(c, Command::Barrier(_)))
            .unwrap();
        let last = commands
            .commands()
            .iter()
            .rposition(|c| matches!(c, Command::Barrier(_)))
            .unwrap();
        let draws = commands
            .commands()
            .iter()
            .enumerate()
            .filter(|(_, c)| matches!(c, Command::Draw(_)))
            .map(|(index, _)| index);
        assert!(draws.into_iter().all(|index| first < index && index < last));
    }

    renderer.shutdown().unwrap();
    assert!(probe.violations().is_empty(), "{:?}", probe.violations());
}

#[test]
fn unchanged_scene_records_identical_frames() {
    let (mut renderer, _probe) = renderer(SyncPolicy::Lockstep);
    renderer
        .initialize(&OffscreenSurface::new(WIDTH, HEIGHT))
        .unwrap();

    let mut recorded = Vec::new();
    for _ in 0..6 {
        let stats = renderer.render().unwrap();
        recorded.push((stats.image_index, renderer.last_commands().unwrap().clone()));
    }

    for image in 0..2 {
        let mut lists = recorded.iter().filter(|(i, _)| *i == image).map(|(_, l)| l);
        let first = lists.next().unwrap();
        assert!(lists.all(|list| list == first));
    }
    let counts: Vec<_> = recorded.iter().map(|(_, list)| list.len()).collect();
    assert!(counts.windows(2).all(|w| w[0] == w[1]));
}

#[rstest]
fn completed_fence_value_never_decreases(
    #[values(SyncPolicy::Lockstep, SyncPolicy::FramesInFlight)] policy: SyncPolicy,
) {
    let (mut renderer, probe) = renderer_with(slow_device(), common::config(policy), two_pipeline_scene());
    renderer
        .initialize(&OffscreenSurface::new(WIDTH, HEIGHT))
        .unwrap();

    let mut last = renderer.completed_fence_value().unwrap();
    for _ in 0..10 {
        let stats = renderer.render().unwrap();
        let completed = renderer.completed_fence_value().unwrap();
        assert!(completed >= last, "{completed} < {last}");
        assert!(stats.fence_value >= completed);
        last = completed;
    }
    renderer.shutdown().unwrap();
    assert!(probe.completed_value() >= last);
    assert!(probe.violations().is_empty(), "{:?}", probe.violations());
}

#[test]
fn lockstep_waits_on_every_frame() {
    let (mut renderer, _probe) = renderer_with(
        slow_device(),
        common::config(SyncPolicy::Lockstep),
        common::textured_scene(),
    );
    renderer
        .initialize(&OffscreenSurface::new(WIDTH, HEIGHT))
        .unwrap();

    for _ in 0..4 {
        let stats = renderer.render().unwrap();
        assert_eq!(renderer.completed_fence_value(), Some(stats.fence_value));
        let audit = renderer.fence_audit().unwrap();
        assert_eq!(audit.last_waited, audit.last_signaled);
    }
}

#[test]
fn frames_in_flight_only_waits_before_reusing_a_slot() {
    let (mut renderer, probe) = renderer_with(
        slow_device(),
        common::config(SyncPolicy::FramesInFlight),
        common::textured_scene(),
    );
    renderer
        .initialize(&OffscreenSurface::new(WIDTH, HEIGHT))
        .unwrap();

    let mut values = Vec::new();
    for _ in 0..6 {
        values.push(renderer.render().unwrap().fence_value);
    }
    let audit = renderer.fence_audit().unwrap();
    assert_eq!(audit.last_signaled, values[5]);
    // The last frame only waited for the slot its image used two frames ago.
    assert_eq!(audit.last_waited, values[3]);

    renderer.shutdown().unwrap();
    assert!(renderer.shutdown_audit().unwrap().is_drained());
    assert!(probe.violations().is_empty(), "{:?}", probe.violations());
}

#[test]
fn every_pipeline_in_the_scene_draws() {
    let (mut renderer, probe) = renderer_with(
        HeadlessDesc::default(),
        common::config(SyncPolicy::Lockstep),
        two_pipeline_scene(),
    );
    renderer
        .initialize(&OffscreenSurface::new(WIDTH, HEIGHT))
        .unwrap();
    assert_eq!(renderer.pipelines().len(), 2);

    renderer.render().unwrap();
    renderer.render().unwrap();

    let pipelines: Vec<_> = renderer
        .last_commands()
        .unwrap()
        .commands()
        .iter()
        .filter_map(|c| match c {
            Command::SetPipeline(id) => Some(*id),
            _ => None,
        })
        .collect();
    let expected: Vec<_> = renderer.pipelines().iter().map(|p| p.id()).collect();
    assert_eq!(pipelines, expected);
    assert_eq!(probe.draws(), 4);
    assert!(probe.violations().is_empty(), "{:?}", probe.violations());
}

#[test]
fn recreated_surface_keeps_rendering() {
    let (mut renderer, probe) = renderer(SyncPolicy::FramesInFlight);
    renderer
        .initialize(&OffscreenSurface::new(WIDTH, HEIGHT))
        .unwrap();
    renderer.render().unwrap();
    let buffers = renderer.buffers().to_vec();

    renderer.recreate_surface(640, 480).unwrap();
    assert_eq!(renderer.surface_size(), Some((640, 480)));
    assert_eq!(renderer.current_image_index().unwrap(), 0);
    assert_eq!(renderer.buffers(), buffers.as_slice());

    for _ in 0..3 {
        renderer.render().unwrap();
    }
    renderer.shutdown().unwrap();
    assert_eq!(probe.presents(), 4);
    assert!(probe.violations().is_empty(), "{:?}", probe.violations());
}

#[test]
fn empty_mesh_draws_nothing() {
    let mut scene = textured_scene();
    scene
        .meshes
        .insert(0, Mesh::from_vertices::<TexturedVertex>("empty", &[]));
    scene.draws[0].mesh = 1;
    let mut empty_draw = scene.draws[0].clone();
    empty_draw.mesh = 0;
    scene.draws.push(empty_draw);

    let (mut renderer, probe) = renderer_with(
        HeadlessDesc::default(),
        common::config(SyncPolicy::Lockstep),
        scene,
    );
    renderer
        .initialize(&OffscreenSurface::new(WIDTH, HEIGHT))
        .unwrap();
    assert_eq!(renderer.buffers().len(), 1);

    renderer.render().unwrap();
    let draws = renderer
        .last_commands()
        .unwrap()
        .commands()
        .iter()
        .filter(|c| matches!(c, Command::Draw(_)))
        .count();
    assert_eq!(draws, 1);
    assert_eq!(probe.draws(), 1);

    renderer.shutdown().unwrap();
    assert!(probe.violations().is_empty(), "{:?}", probe.violations());
}
