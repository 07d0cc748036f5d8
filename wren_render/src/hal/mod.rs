//! The seam between the portable renderer and a concrete GPU API.
//!
//! Everything above this module records backend-neutral [`CommandList`]s and
//! talks to the device through [`Gpu`]. Two implementations exist:
//!
//! - [`headless::HeadlessGpu`]: a validating reference device with its own
//!   execution timeline, always available.
//! - `d3d12::D3d12Gpu`: Direct3D 12 through DXGI, Windows only.

#[cfg(windows)]
pub mod d3d12;
pub mod headless;

use std::{fmt, time::Duration};

use serde::Deserialize;

use crate::{
    command_encoder::CommandList,
    error::RenderResult,
    id::{AllocatorId, BufferId, PipelineId, TextureId},
    pipeline::PipelineDesc,
    resource::{BufferDesc, TextureDesc, TextureFormat},
    surface::SurfaceTarget,
};

#[derive(Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd)]
pub enum FeatureLevel {
    #[serde(rename = "11_0")]
    Level11_0,
    #[serde(rename = "11_1")]
    Level11_1,
    #[serde(rename = "12_0")]
    Level12_0,
    #[serde(rename = "12_1")]
    Level12_1,
}

impl fmt::Display for FeatureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Level11_0 => "11_0",
            Self::Level11_1 => "11_1",
            Self::Level12_0 => "12_0",
            Self::Level12_1 => "12_1",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug)]
pub struct AdapterInfo {
    pub name: String,
    pub feature_level: FeatureLevel,
    pub software: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct DeviceDesc {
    pub min_feature_level: FeatureLevel,
    pub debug_layer: bool,
}

impl Default for DeviceDesc {
    fn default() -> Self {
        Self {
            min_feature_level: FeatureLevel::Level11_0,
            debug_layer: cfg!(debug_assertions),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SwapChainDesc {
    pub width: u32,
    pub height: u32,
    pub buffer_count: usize,
    pub format: TextureFormat,
}

pub trait Gpu {
    fn name(&self) -> &'static str;

    fn adapter(&self) -> &AdapterInfo;

    /// Creates the single direct queue. Nothing may be submitted before.
    fn create_queue(&mut self) -> RenderResult<()>;

    fn create_swapchain(&mut self, target: &SurfaceTarget, desc: &SwapChainDesc)
        -> RenderResult<()>;

    fn destroy_swapchain(&mut self);

    /// The image the next frame may render into.
    fn current_image_index(&self) -> usize;

    fn present(&mut self, sync_interval: u32) -> RenderResult<()>;

    fn create_buffer(&mut self, desc: &BufferDesc) -> RenderResult<BufferId>;

    /// Writes through a CPU mapping; only valid for CPU-visible buffers.
    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> RenderResult<()>;

    fn destroy_buffer(&mut self, buffer: BufferId);

    fn create_texture(&mut self, desc: &TextureDesc) -> RenderResult<TextureId>;

    fn destroy_texture(&mut self, texture: TextureId);

    /// Debug read-back. The caller guarantees no GPU work touching the
    /// buffer is pending.
    fn read_buffer(&mut self, buffer: BufferId) -> RenderResult<Vec<u8>>;

    /// Debug read-back of tightly packed rows, same contract as
    /// [`Gpu::read_buffer`].
    fn read_texture(&mut self, texture: TextureId) -> RenderResult<Vec<u8>>;

    fn create_pipeline(&mut self, desc: &PipelineDesc) -> RenderResult<PipelineId>;

    fn destroy_pipeline(&mut self, pipeline: PipelineId);

    fn create_command_allocator(&mut self) -> RenderResult<AllocatorId>;

    fn destroy_command_allocator(&mut self, allocator: AllocatorId);

    /// Only legal once every list recorded from `allocator` has executed.
    fn reset_command_allocator(&mut self, allocator: AllocatorId) -> RenderResult<()>;

    fn submit(&mut self, allocator: AllocatorId, list: &CommandList) -> RenderResult<()>;

    /// Enqueues a fence signal behind everything submitted so far.
    fn signal(&mut self, value: u64) -> RenderResult<()>;

    /// Highest value handed to [`Gpu::signal`], executed or not.
    fn last_signaled(&self) -> u64;

    fn completed_value(&self) -> u64;

    /// Blocks on an OS wait primitive until the fence reaches `value`.
    fn wait_for_value(&self, value: u64, timeout: Option<Duration>) -> RenderResult<()>;
}
