use raw_window_handle::RawWindowHandle;
use tracing::info;

use crate::{
    device::DeviceContext,
    error::{RenderError, RenderResult},
    hal::{Gpu, SwapChainDesc},
    resource::TextureFormat,
};

/// Where the swap chain images end up.
#[derive(Clone, Copy, Debug)]
pub enum SurfaceTarget {
    Window(RawWindowHandle),
    /// No native window; images are presented into the void.
    Offscreen,
}

/// The window collaborator, polled once when a surface is created.
pub trait Surface {
    fn target(&self) -> RenderResult<SurfaceTarget>;

    fn width(&self) -> u32;

    fn height(&self) -> u32;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OffscreenSurface {
    pub width: u32,
    pub height: u32,
}

impl OffscreenSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Surface for OffscreenSurface {
    fn target(&self) -> RenderResult<SurfaceTarget> {
        Ok(SurfaceTarget::Offscreen)
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }
}

/// The ring of presentable images bound to one surface at one size.
#[derive(Debug)]
pub struct PresentationSurface {
    target: SurfaceTarget,
    desc: SwapChainDesc,
    sync_interval: u32,
}

impl PresentationSurface {
    pub fn create<G: Gpu>(
        device: &mut DeviceContext<G>,
        target: SurfaceTarget,
        desc: SwapChainDesc,
        sync_interval: u32,
    ) -> RenderResult<Self> {
        validate(&desc)?;
        device.gpu_mut().create_swapchain(&target, &desc)?;
        info!(
            "created {}x{} swap chain with {} images",
            desc.width, desc.height, desc.buffer_count
        );
        Ok(Self {
            target,
            desc,
            sync_interval,
        })
    }

    /// Destroys and rebuilds the image ring at a new size. The caller must
    /// have drained every frame that referenced the old images.
    pub fn recreate<G: Gpu>(
        &mut self,
        device: &mut DeviceContext<G>,
        width: u32,
        height: u32,
    ) -> RenderResult<()> {
        let desc = SwapChainDesc {
            width,
            height,
            ..self.desc
        };
        validate(&desc)?;
        device.gpu_mut().destroy_swapchain();
        device.gpu_mut().create_swapchain(&self.target, &desc)?;
        info!("recreated swap chain at {}x{}", width, height);
        self.desc = desc;
        Ok(())
    }

    pub fn current_image_index<G: Gpu>(&self, device: &DeviceContext<G>) -> usize {
        device.gpu().current_image_index()
    }

    pub fn present<G: Gpu>(&self, device: &mut DeviceContext<G>) -> RenderResult<()> {
        device
            .gpu_mut()
            .present(self.sync_interval)
            .map_err(|err| match err {
                RenderError::PresentFailed(_) => err,
                other => RenderError::PresentFailed(other.to_string()),
            })
    }

    pub fn destroy<G: Gpu>(self, device: &mut DeviceContext<G>) {
        device.gpu_mut().destroy_swapchain();
    }

    pub fn width(&self) -> u32 {
        self.desc.width
    }

    pub fn height(&self) -> u32 {
        self.desc.height
    }

    pub fn image_count(&self) -> usize {
        self.desc.buffer_count
    }
}

fn validate(desc: &SwapChainDesc) -> RenderResult<()> {
    if desc.width == 0 || desc.height == 0 {
        return Err(RenderError::SurfaceCreationFailed(format!(
            "surface size {}x{} is empty",
            desc.width, desc.height
        )));
    }
    if desc.buffer_count < 2 {
        return Err(RenderError::SurfaceCreationFailed(format!(
            "a swap chain needs at least 2 images, got {}",
            desc.buffer_count
        )));
    }
    if desc.format == TextureFormat::R8Unorm {
        return Err(RenderError::SurfaceCreationFailed(
            "R8 is not a presentable format".into(),
        ));
    }
    Ok(())
}
