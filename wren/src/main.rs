use std::{
    fs, io,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use wren_render::{
    HeadlessDesc, HeadlessGpu, OffscreenSurface, RenderBackend, Renderer, RendererConfig,
    SceneSetup,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum Backend {
    Headless,
    D3d12,
}

#[derive(Debug, Parser)]
#[command(version, about = "Draws a checkerboard-textured triangle")]
struct Args {
    #[arg(long, value_enum, default_value_t = Backend::Headless)]
    backend: Backend,

    #[arg(long, default_value_t = 960)]
    width: u32,

    #[arg(long, default_value_t = 720)]
    height: u32,

    /// Frames to render before exiting (headless only).
    #[arg(long, default_value_t = 60)]
    frames: u64,

    #[arg(long, default_value = "wren.toml")]
    config: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    render: RendererConfig,
}

fn load_config(path: &Path) -> anyhow::Result<RendererConfig> {
    match fs::read_to_string(path) {
        Ok(contents) => {
            let file: ConfigFile = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            info!("loaded config from {}", path.display());
            Ok(file.render)
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(RendererConfig::default()),
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args.config)?;
    match args.backend {
        Backend::Headless => run_headless(&args, config),
        Backend::D3d12 => run_windowed(&args, config),
    }
}

fn run_headless(args: &Args, config: RendererConfig) -> anyhow::Result<()> {
    use wren_render::shader::TEXTURED_HLSL;

    let gpu = HeadlessGpu::new(HeadlessDesc::default());
    let probe = gpu.probe();
    // The reference device treats shader bytecode as opaque.
    let scene = SceneSetup::textured(
        TEXTURED_HLSL.as_bytes().to_vec(),
        TEXTURED_HLSL.as_bytes().to_vec(),
        args.width as f32 / args.height as f32,
    );

    let mut renderer = Renderer::new(gpu, config, scene);
    renderer.initialize(&OffscreenSurface::new(args.width, args.height))?;
    for frame in 0..args.frames {
        renderer.add_debug_text(&format!("frame {frame}"), 8.0, 8.0);
        match renderer.render() {
            Ok(stats) => debug!(
                "frame {} on image {} (fence {})",
                stats.frame,
                stats.image_index,
                stats.fence_value
            ),
            Err(err) => {
                error!("frame {} failed: {}", frame, err);
                renderer.shutdown()?;
                return Err(err.into());
            }
        }
    }
    renderer.shutdown()?;

    let violations = probe.violations();
    for violation in &violations {
        warn!("{:?}", violation);
    }
    info!(
        "rendered {} frames, {} presents, {} violations",
        args.frames,
        probe.presents(),
        violations.len()
    );
    if !violations.is_empty() {
        bail!("the reference device recorded {} violations", violations.len());
    }
    Ok(())
}

#[cfg(not(windows))]
fn run_windowed(_args: &Args, _config: RendererConfig) -> anyhow::Result<()> {
    bail!("the d3d12 backend is only available on Windows")
}

#[cfg(windows)]
fn run_windowed(args: &Args, config: RendererConfig) -> anyhow::Result<()> {
    use raw_window_handle::HasWindowHandle;
    use winit::{
        dpi::PhysicalSize,
        event::{Event, WindowEvent},
        event_loop::{ControlFlow, EventLoop},
        window::{Window, WindowBuilder},
    };
    use wren_render::{
        compile_shader,
        shader::{ShaderStage, PS_ENTRY_POINT, TEXTURED_HLSL, VS_ENTRY_POINT},
        D3d12Gpu, RenderError, RenderResult, Surface, SurfaceTarget,
    };

    struct WindowSurface<'a> {
        window: &'a Window,
    }

    impl Surface for WindowSurface<'_> {
        fn target(&self) -> RenderResult<SurfaceTarget> {
            let handle = self
                .window
                .window_handle()
                .map_err(|err| RenderError::SurfaceCreationFailed(err.to_string()))?;
            Ok(SurfaceTarget::Window(handle.as_raw()))
        }

        fn width(&self) -> u32 {
            self.window.inner_size().width
        }

        fn height(&self) -> u32 {
            self.window.inner_size().height
        }
    }

    let event_loop = EventLoop::new()?;
    let window = WindowBuilder::new()
        .with_title("Wren")
        .with_inner_size(PhysicalSize::new(args.width, args.height))
        .build(&event_loop)?;

    let gpu = D3d12Gpu::new(&config.device_desc())?;
    let vertex_shader = compile_shader(
        "textured.hlsl",
        TEXTURED_HLSL,
        VS_ENTRY_POINT,
        ShaderStage::Vertex,
    )?;
    let pixel_shader = compile_shader(
        "textured.hlsl",
        TEXTURED_HLSL,
        PS_ENTRY_POINT,
        ShaderStage::Pixel,
    )?;
    let size = window.inner_size();
    let scene = SceneSetup::textured(
        vertex_shader,
        pixel_shader,
        size.width as f32 / size.height.max(1) as f32,
    );

    let mut renderer = Renderer::new(gpu, config, scene);
    renderer.initialize(&WindowSurface { window: &window })?;
    info!("renderer loaded");

    let mut failure: Option<RenderError> = None;
    event_loop.set_control_flow(ControlFlow::Poll);
    event_loop.run(|event, elwt| match event {
        Event::WindowEvent {
            event: WindowEvent::CloseRequested,
            ..
        } => elwt.exit(),
        Event::WindowEvent {
            event: WindowEvent::Resized(size),
            ..
        } if size.width > 0 && size.height > 0 => {
            if let Err(err) = renderer.recreate_surface(size.width, size.height) {
                error!("surface recreation failed: {}", err);
                failure = Some(err);
                elwt.exit();
            }
        }
        Event::AboutToWait => {
            if let Err(err) = renderer.render() {
                error!("frame failed: {}", err);
                failure = Some(err);
                elwt.exit();
            }
        }
        _ => {}
    })?;

    renderer.shutdown()?;
    match failure {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_table_feeds_the_renderer_config() {
        let file: ConfigFile = toml::from_str(
            r#"
            [render]
            frame_count = 3
            sync_policy = "frames_in_flight"
            "#,
        )
        .unwrap();
        assert_eq!(file.render.frame_count, 3);
        assert_eq!(file.render.present_interval, 1);
    }

    #[test]
    fn missing_config_file_uses_defaults() {
        let config = load_config(Path::new("does/not/exist/wren.toml")).unwrap();
        assert_eq!(config, RendererConfig::default());
    }

    #[test]
    fn cli_defaults_match_the_reference_window() {
        let args = Args::parse_from(["wren"]);
        assert_eq!(args.backend, Backend::Headless);
        assert_eq!((args.width, args.height), (960, 720));
        assert_eq!(args.config, PathBuf::from("wren.toml"));
    }
}
