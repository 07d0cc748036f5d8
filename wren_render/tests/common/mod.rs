#![allow(dead_code)]

use std::time::Duration;

use wren_render::{
    shader::{COLORED_HLSL, TEXTURED_HLSL},
    HeadlessDesc, HeadlessGpu, HeadlessProbe, Renderer, RendererConfig, SceneSetup, SyncPolicy,
};

pub const WIDTH: u32 = 960;
pub const HEIGHT: u32 = 720;

pub fn textured_scene() -> SceneSetup {
    SceneSetup::textured(
        TEXTURED_HLSL.as_bytes().to_vec(),
        TEXTURED_HLSL.as_bytes().to_vec(),
        WIDTH as f32 / HEIGHT as f32,
    )
}

pub fn two_pipeline_scene() -> SceneSetup {
    textured_scene().with_colored_triangle(
        COLORED_HLSL.as_bytes().to_vec(),
        COLORED_HLSL.as_bytes().to_vec(),
        WIDTH as f32 / HEIGHT as f32,
    )
}

pub fn config(policy: SyncPolicy) -> RendererConfig {
    RendererConfig {
        sync_policy: policy,
        fence_timeout_ms: Some(5_000),
        ..Default::default()
    }
}

pub fn renderer_with(
    desc: HeadlessDesc,
    config: RendererConfig,
    scene: SceneSetup,
) -> (Renderer<HeadlessGpu>, HeadlessProbe) {
    let gpu = HeadlessGpu::new(desc);
    let probe = gpu.probe();
    (Renderer::new(gpu, config, scene), probe)
}

pub fn renderer(policy: SyncPolicy) -> (Renderer<HeadlessGpu>, HeadlessProbe) {
    renderer_with(HeadlessDesc::default(), config(policy), textured_scene())
}

/// A device slow enough that the CPU regularly runs ahead of it.
pub fn slow_device() -> HeadlessDesc {
    HeadlessDesc {
        execution_delay: Duration::from_millis(2),
        ..Default::default()
    }
}
