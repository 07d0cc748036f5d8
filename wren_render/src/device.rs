use tracing::info;

use crate::{
    error::{RenderError, RenderResult},
    fence::FrameFence,
    hal::{AdapterInfo, DeviceDesc, Gpu},
    id::{BufferId, TextureId},
};

/// The logical device plus its single direct queue.
pub struct DeviceContext<G: Gpu> {
    gpu: G,
}

impl<G: Gpu> DeviceContext<G> {
    pub fn new(mut gpu: G, desc: &DeviceDesc) -> RenderResult<Self> {
        let adapter = gpu.adapter();
        if adapter.feature_level < desc.min_feature_level {
            return Err(RenderError::DeviceUnavailable(format!(
                "adapter `{}` supports feature level {}, {} is required",
                adapter.name, adapter.feature_level, desc.min_feature_level
            )));
        }
        info!(
            "using {} adapter `{}` at feature level {}",
            gpu.name(),
            adapter.name,
            adapter.feature_level
        );

        gpu.create_queue()?;
        Ok(Self { gpu })
    }

    pub fn adapter(&self) -> &AdapterInfo {
        self.gpu.adapter()
    }

    pub fn gpu(&self) -> &G {
        &self.gpu
    }

    pub fn gpu_mut(&mut self) -> &mut G {
        &mut self.gpu
    }

    pub fn into_inner(self) -> G {
        self.gpu
    }

    /// Drains the queue, then copies the buffer contents back to the CPU.
    pub fn read_buffer(&mut self, fence: &mut FrameFence, buffer: BufferId) -> RenderResult<Vec<u8>> {
        fence.drain(self)?;
        self.gpu.read_buffer(buffer)
    }

    pub fn read_texture(
        &mut self,
        fence: &mut FrameFence,
        texture: TextureId,
    ) -> RenderResult<Vec<u8>> {
        fence.drain(self)?;
        self.gpu.read_texture(texture)
    }
}
