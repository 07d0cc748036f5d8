pub mod command_encoder;
pub mod config;
pub mod device;
pub mod error;
pub mod fence;
pub mod frame;
pub mod hal;
pub mod id;
pub mod mesh;
pub mod pipeline;
pub mod renderer;
pub mod resource;
pub mod retire;
pub mod scene;
pub mod shader;
pub mod surface;
pub mod texture;
pub mod upload;

pub use config::{RendererConfig, SyncPolicy};
pub use device::DeviceContext;
pub use error::{RenderError, RenderResult};
pub use fence::{FenceAudit, FrameFence};
pub use frame::{FrameState, FrameStats};
pub use hal::{
    headless::{HeadlessDesc, HeadlessGpu, HeadlessProbe, Violation},
    FeatureLevel, Gpu,
};
pub use renderer::{RenderBackend, Renderer};
pub use scene::SceneSetup;
pub use surface::{OffscreenSurface, Surface, SurfaceTarget};

#[cfg(windows)]
pub use hal::d3d12::{compile_shader, D3d12Gpu};
