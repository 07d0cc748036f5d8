use tracing::{debug, error, info};

use crate::{
    command_encoder::{CommandList, DrawArgs, VertexBufferView},
    config::RendererConfig,
    device::DeviceContext,
    error::{RenderError, RenderResult},
    fence::{FenceAudit, FrameFence},
    frame::{DrawItem, FrameExecutor, FrameState, FrameStats},
    hal::{Gpu, SwapChainDesc},
    id::{BufferId, TextureId},
    pipeline::{PipelineBuilder, PipelineState},
    resource::{BufferUsage, TextureFormat},
    retire::RetirementQueue,
    scene::SceneSetup,
    surface::{PresentationSurface, Surface},
    upload::Uploader,
};

pub const SURFACE_FORMAT: TextureFormat = TextureFormat::Rgba8Unorm;

/// What every renderer variant offers the application.
pub trait RenderBackend {
    fn initialize(&mut self, surface: &dyn Surface) -> RenderResult<()>;

    fn shutdown(&mut self) -> RenderResult<()>;

    fn render(&mut self) -> RenderResult<FrameStats>;

    /// Best effort overlay text for the next frame.
    fn add_debug_text(&mut self, text: &str, x: f32, y: f32);
}

#[derive(Clone, Debug, PartialEq)]
struct DebugText {
    text: String,
    x: f32,
    y: f32,
}

/// Everything that only exists between `initialize` and `shutdown`.
struct Running<G: Gpu> {
    device: DeviceContext<G>,
    fence: FrameFence,
    retirement: RetirementQueue,
    uploader: Option<Uploader>,
    surface: Option<PresentationSurface>,
    executor: Option<FrameExecutor>,
    pipelines: Vec<PipelineState>,
    buffers: Vec<BufferId>,
    /// Vertex buffer of each scene mesh; `None` for a mesh without vertices.
    mesh_buffers: Vec<Option<BufferId>>,
    textures: Vec<TextureId>,
    draws: Vec<DrawItem>,
}

impl<G: Gpu> Running<G> {
    fn build(
        &mut self,
        config: &RendererConfig,
        scene: &SceneSetup,
        surface: &dyn Surface,
    ) -> RenderResult<()> {
        let desc = SwapChainDesc {
            width: surface.width(),
            height: surface.height(),
            buffer_count: config.frame_count,
            format: SURFACE_FORMAT,
        };
        self.surface = Some(PresentationSurface::create(
            &mut self.device,
            surface.target()?,
            desc,
            config.present_interval,
        )?);

        let builder = PipelineBuilder::new();
        for desc in &scene.pipelines {
            let pipeline = builder.build(&mut self.device, desc.clone())?;
            self.pipelines.push(pipeline);
        }

        self.upload(scene)?;
        self.draws = self.resolve_draws(scene)?;
        self.executor = Some(FrameExecutor::new(
            &mut self.device,
            config.frame_count,
            config.sync_policy,
            config.clear_color,
        )?);
        Ok(())
    }

    /// Uploads every mesh and texture in one batch and blocks until the
    /// copies have executed. The uploader lives until `release`, which only
    /// frees its allocator after a drain.
    fn upload(&mut self, scene: &SceneSetup) -> RenderResult<()> {
        let mut uploader = Uploader::new(&mut self.device)?;
        let token = match self.record_uploads(&mut uploader, scene) {
            Ok(()) => uploader.flush(&mut self.device, &mut self.fence, &mut self.retirement),
            Err(err) => Err(err),
        };
        self.uploader = Some(uploader);

        if let Some(token) = token? {
            self.fence.wait_until(&self.device, token)?;
            let completed = self.fence.completed_value(&self.device);
            self.retirement.collect(&mut self.device, completed);
        }
        info!(
            "uploaded {} buffers and {} textures",
            self.buffers.len(),
            self.textures.len()
        );
        Ok(())
    }

    fn record_uploads(&mut self, uploader: &mut Uploader, scene: &SceneSetup) -> RenderResult<()> {
        for mesh in &scene.meshes {
            if mesh.vertex_count == 0 {
                debug!("mesh `{}` has no vertices, skipping its upload", mesh.label);
                self.mesh_buffers.push(None);
                continue;
            }
            let buffer =
                uploader.upload_buffer(&mut self.device, mesh.label, &mesh.bytes, BufferUsage::Vertex)?;
            self.buffers.push(buffer);
            self.mesh_buffers.push(Some(buffer));
        }
        for texture in &scene.textures {
            let id = uploader.upload_texture(&mut self.device, texture)?;
            self.textures.push(id);
        }
        Ok(())
    }

    /// Turns the scene's draw list into executor draws. Draws of an empty
    /// mesh are legal no-ops and are dropped here.
    fn resolve_draws(&self, scene: &SceneSetup) -> RenderResult<Vec<DrawItem>> {
        let mut draws = Vec::with_capacity(scene.draws.len());
        for draw in &scene.draws {
            let pipeline = self.pipelines.get(draw.pipeline).ok_or_else(|| {
                RenderError::UnknownResource(format!("pipeline #{}", draw.pipeline))
            })?;
            let mesh = scene
                .meshes
                .get(draw.mesh)
                .ok_or_else(|| RenderError::UnknownResource(format!("mesh #{}", draw.mesh)))?;
            if mesh.stride != pipeline.desc().vertex_layout.stride {
                return Err(RenderError::InvalidBindingLayout(format!(
                    "mesh `{}` has a {} byte stride, pipeline `{}` expects {}",
                    mesh.label,
                    mesh.stride,
                    pipeline.desc().label,
                    pipeline.desc().vertex_layout.stride
                )));
            }

            let textures = draw
                .textures
                .iter()
                .map(|binding| {
                    let table = pipeline.texture_table(binding.register).ok_or_else(|| {
                        RenderError::InvalidBindingLayout(format!(
                            "pipeline `{}` has no texture at t{}",
                            pipeline.desc().label,
                            binding.register
                        ))
                    })?;
                    let texture = self.textures.get(binding.texture).ok_or_else(|| {
                        RenderError::UnknownResource(format!("texture #{}", binding.texture))
                    })?;
                    Ok((table, *texture))
                })
                .collect::<RenderResult<Vec<_>>>()?;

            let Some(buffer) = self.mesh_buffers.get(draw.mesh).copied().flatten() else {
                debug!("dropping draw of empty mesh `{}`", mesh.label);
                continue;
            };
            draws.push(DrawItem {
                pipeline: pipeline.id(),
                topology: pipeline.desc().topology,
                vertex_buffer: VertexBufferView {
                    buffer,
                    size: mesh.bytes.len() as u32,
                    stride: mesh.stride,
                },
                textures,
                args: DrawArgs {
                    vertex_count: mesh.vertex_count,
                    instance_count: draw.instance_count,
                    first_vertex: 0,
                    first_instance: 0,
                },
            });
        }
        Ok(draws)
    }

    /// Drains the queue, then releases everything in reverse creation order.
    /// If the drain fails nothing is destroyed and the caller keeps `self`
    /// for another attempt.
    fn release(&mut self) -> RenderResult<FenceAudit> {
        if let Err(err) = self.fence.drain(&mut self.device) {
            error!("GPU did not drain, holding on to its resources: {}", err);
            return Err(err);
        }
        let completed = self.fence.completed_value(&self.device);
        self.retirement.collect(&mut self.device, completed);

        if let Some(uploader) = self.uploader.take() {
            uploader.destroy(&mut self.device);
        }
        if let Some(executor) = self.executor.take() {
            executor.destroy(&mut self.device);
        }
        for pipeline in self.pipelines.drain(..) {
            self.device.gpu_mut().destroy_pipeline(pipeline.id());
        }
        for texture in self.textures.drain(..) {
            self.device.gpu_mut().destroy_texture(texture);
        }
        for buffer in self.buffers.drain(..) {
            self.device.gpu_mut().destroy_buffer(buffer);
        }
        self.mesh_buffers.clear();
        if let Some(surface) = self.surface.take() {
            surface.destroy(&mut self.device);
        }
        self.draws.clear();
        Ok(self.fence.audit())
    }
}

/// Drives one surface with one device.
///
/// The device is handed back to the renderer on shutdown, so the same
/// renderer can go through any number of initialize/shutdown cycles.
pub struct Renderer<G: Gpu> {
    config: RendererConfig,
    scene: SceneSetup,
    gpu: Option<G>,
    running: Option<Running<G>>,
    /// Resources a failed shutdown could not release yet.
    stranded: Option<Running<G>>,
    debug_text: Vec<DebugText>,
    shutdown_audit: Option<FenceAudit>,
}

impl<G: Gpu> Renderer<G> {
    pub fn new(gpu: G, config: RendererConfig, scene: SceneSetup) -> Self {
        Self {
            config,
            scene,
            gpu: Some(gpu),
            running: None,
            stranded: None,
            debug_text: Vec::new(),
            shutdown_audit: None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.running.is_some()
    }

    fn running(&self) -> RenderResult<&Running<G>> {
        self.running.as_ref().ok_or(RenderError::NotInitialized)
    }

    fn running_mut(&mut self) -> RenderResult<&mut Running<G>> {
        self.running.as_mut().ok_or(RenderError::NotInitialized)
    }

    pub fn device(&self) -> Option<&DeviceContext<G>> {
        self.running.as_ref().map(|running| &running.device)
    }

    /// The device, whether or not the renderer is initialized.
    pub fn gpu(&self) -> Option<&G> {
        match self.running.as_ref().or(self.stranded.as_ref()) {
            Some(running) => Some(running.device.gpu()),
            None => self.gpu.as_ref(),
        }
    }

    /// True while a failed shutdown still holds GPU resources.
    pub fn has_stranded_resources(&self) -> bool {
        self.stranded.is_some()
    }

    /// Releases `running` and takes the device back, or keeps it stranded
    /// until the next attempt.
    fn reclaim(&mut self, mut running: Running<G>) -> RenderResult<FenceAudit> {
        match running.release() {
            Ok(audit) => {
                self.gpu = Some(running.device.into_inner());
                Ok(audit)
            }
            Err(err) => {
                self.stranded = Some(running);
                Err(err)
            }
        }
    }

    pub fn pipelines(&self) -> &[PipelineState] {
        match &self.running {
            Some(running) => &running.pipelines,
            None => &[],
        }
    }

    pub fn buffers(&self) -> &[BufferId] {
        match &self.running {
            Some(running) => &running.buffers,
            None => &[],
        }
    }

    pub fn textures(&self) -> &[TextureId] {
        match &self.running {
            Some(running) => &running.textures,
            None => &[],
        }
    }

    pub fn frame_state(&self) -> Option<FrameState> {
        self.running
            .as_ref()
            .and_then(|r| r.executor.as_ref())
            .map(FrameExecutor::state)
    }

    pub fn last_commands(&self) -> Option<&CommandList> {
        self.running
            .as_ref()
            .and_then(|r| r.executor.as_ref())
            .and_then(FrameExecutor::last_commands)
    }

    pub fn current_image_index(&self) -> RenderResult<usize> {
        let running = self.running()?;
        let surface = running.surface.as_ref().ok_or(RenderError::NotInitialized)?;
        Ok(surface.current_image_index(&running.device))
    }

    pub fn surface_size(&self) -> Option<(u32, u32)> {
        let surface = self.running.as_ref()?.surface.as_ref()?;
        Some((surface.width(), surface.height()))
    }

    pub fn fence_audit(&self) -> Option<FenceAudit> {
        self.running.as_ref().map(|r| r.fence.audit())
    }

    pub fn completed_fence_value(&self) -> Option<u64> {
        self.running
            .as_ref()
            .map(|r| r.fence.completed_value(&r.device))
    }

    /// Audit taken at the end of the most recent shutdown.
    pub fn shutdown_audit(&self) -> Option<FenceAudit> {
        self.shutdown_audit
    }

    pub fn read_buffer(&mut self, buffer: BufferId) -> RenderResult<Vec<u8>> {
        let running = self.running_mut()?;
        running.device.read_buffer(&mut running.fence, buffer)
    }

    pub fn read_texture(&mut self, texture: TextureId) -> RenderResult<Vec<u8>> {
        let running = self.running_mut()?;
        running.device.read_texture(&mut running.fence, texture)
    }

    /// Rebuilds the presentation surface at a new size. The device context,
    /// pipelines and uploaded resources are left alone.
    pub fn recreate_surface(&mut self, width: u32, height: u32) -> RenderResult<()> {
        let running = self.running_mut()?;
        running.fence.drain(&mut running.device)?;
        let surface = running.surface.as_mut().ok_or(RenderError::NotInitialized)?;
        surface.recreate(&mut running.device, width, height)
    }
}

impl<G: Gpu> RenderBackend for Renderer<G> {
    fn initialize(&mut self, surface: &dyn Surface) -> RenderResult<()> {
        if self.running.is_some() {
            return Err(RenderError::SurfaceCreationFailed(
                "renderer is already bound to a surface".into(),
            ));
        }
        if let Some(stranded) = self.stranded.take() {
            self.reclaim(stranded)?;
            info!("released resources left behind by an earlier shutdown");
        }
        let gpu = self.gpu.take().ok_or_else(|| {
            RenderError::DeviceUnavailable("device was lost by an earlier failure".into())
        })?;

        let device = DeviceContext::new(gpu, &self.config.device_desc())?;
        let fence = FrameFence::new(&device, self.config.fence_timeout());
        let mut running = Running {
            device,
            fence,
            retirement: RetirementQueue::new(),
            uploader: None,
            surface: None,
            executor: None,
            pipelines: Vec::new(),
            buffers: Vec::new(),
            mesh_buffers: Vec::new(),
            textures: Vec::new(),
            draws: Vec::new(),
        };

        match running.build(&self.config, &self.scene, surface) {
            Ok(()) => {
                info!(
                    "renderer initialized: {} pipelines, {} draws",
                    running.pipelines.len(),
                    running.draws.len()
                );
                self.running = Some(running);
                Ok(())
            }
            Err(err) => {
                let _ = self.reclaim(running);
                Err(err)
            }
        }
    }

    fn shutdown(&mut self) -> RenderResult<()> {
        let running = self
            .running
            .take()
            .or_else(|| self.stranded.take())
            .ok_or(RenderError::NotInitialized)?;
        self.debug_text.clear();
        let audit = self.reclaim(running)?;
        info!(
            "renderer shut down (last signaled {}, last waited {})",
            audit.last_signaled, audit.last_waited
        );
        self.shutdown_audit = Some(audit);
        Ok(())
    }

    fn render(&mut self) -> RenderResult<FrameStats> {
        let running = self.running.as_mut().ok_or(RenderError::NotInitialized)?;
        for text in self.debug_text.drain(..) {
            debug!("debug text at ({}, {}): {}", text.x, text.y, text.text);
        }

        let Running {
            device,
            fence,
            retirement,
            surface,
            executor,
            draws,
            ..
        } = running;
        let surface = surface.as_ref().ok_or(RenderError::NotInitialized)?;
        let executor = executor.as_mut().ok_or(RenderError::NotInitialized)?;

        let stats = executor.run_frame(device, fence, surface, draws)?;
        if !retirement.is_empty() {
            let completed = fence.completed_value(device);
            retirement.collect(device, completed);
        }
        Ok(stats)
    }

    fn add_debug_text(&mut self, text: &str, x: f32, y: f32) {
        self.debug_text.push(DebugText {
            text: text.to_owned(),
            x,
            y,
        });
    }
}

impl<G: Gpu> Drop for Renderer<G> {
    fn drop(&mut self) {
        if self.running.is_some() {
            if let Err(err) = self.shutdown() {
                error!("renderer shutdown failed: {}", err);
            }
        }
        if let Some(stranded) = self.stranded.take() {
            if let Err(err) = self.reclaim(stranded) {
                error!("leaking resources of a device that never drained: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hal::headless::{HeadlessDesc, HeadlessGpu},
        scene::{DrawDesc, TextureBinding},
        surface::OffscreenSurface,
    };

    fn renderer(scene: SceneSetup) -> Renderer<HeadlessGpu> {
        Renderer::new(
            HeadlessGpu::new(HeadlessDesc::default()),
            RendererConfig::default(),
            scene,
        )
    }

    #[test]
    fn render_before_initialize_fails() {
        let mut renderer = renderer(SceneSetup::default());
        assert!(matches!(renderer.render(), Err(RenderError::NotInitialized)));
        assert!(matches!(renderer.shutdown(), Err(RenderError::NotInitialized)));
    }

    #[test]
    fn failed_initialize_returns_the_device() {
        let mut scene = SceneSetup::textured(vec![1], vec![2], 1.0);
        scene.draws[0].textures = vec![TextureBinding {
            register: 5,
            texture: 0,
        }];
        let mut renderer = renderer(scene);
        let probe = renderer.gpu().unwrap().probe();

        assert!(matches!(
            renderer.initialize(&OffscreenSurface::new(64, 64)),
            Err(RenderError::InvalidBindingLayout(_))
        ));
        assert!(!renderer.is_initialized());
        assert!(renderer.gpu().is_some());
        assert!(probe.violations().is_empty());
    }

    #[test]
    fn draw_referencing_a_missing_mesh_is_rejected() {
        let mut scene = SceneSetup::textured(vec![1], vec![2], 1.0);
        scene.draws.push(DrawDesc {
            pipeline: 0,
            mesh: 9,
            textures: Vec::new(),
            instance_count: 1,
        });
        let mut renderer = renderer(scene);
        assert!(matches!(
            renderer.initialize(&OffscreenSurface::new(64, 64)),
            Err(RenderError::UnknownResource(_))
        ));
    }

    #[test]
    fn double_initialize_is_refused() {
        let mut renderer = renderer(SceneSetup::textured(vec![1], vec![2], 1.0));
        renderer.initialize(&OffscreenSurface::new(64, 64)).unwrap();
        assert!(renderer
            .initialize(&OffscreenSurface::new(64, 64))
            .is_err());
        assert!(renderer.is_initialized());
    }

    #[test]
    fn debug_text_is_consumed_by_the_next_frame() {
        let mut renderer = renderer(SceneSetup::default());
        renderer.initialize(&OffscreenSurface::new(16, 16)).unwrap();
        renderer.add_debug_text("fps: 60", 4.0, 4.0);
        assert_eq!(renderer.debug_text.len(), 1);
        renderer.render().unwrap();
        assert!(renderer.debug_text.is_empty());
    }
}
