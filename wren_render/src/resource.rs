use crate::{
    error::{RenderError, RenderResult},
    id::ResourceId,
};

/// Row pitch alignment the copy engine requires for placed footprints.
pub const TEXTURE_ROW_PITCH_ALIGNMENT: u32 = 256;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ResourceState {
    Common,
    CopyDestination,
    GenericRead,
    ShaderResource,
    RenderTarget,
    PresentSource,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Barrier {
    pub resource: ResourceId,
    pub before: ResourceState,
    pub after: ResourceState,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemoryLocation {
    /// Device local, only reachable through the copy engine.
    GpuOnly,
    /// Upload heap: CPU writable, GPU readable.
    CpuToGpu,
    /// Read-back heap.
    GpuToCpu,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BufferUsage {
    Vertex,
    Staging,
}

#[derive(Clone, Debug)]
pub struct BufferDesc {
    pub label: &'static str,
    pub size: u64,
    pub usage: BufferUsage,
    pub location: MemoryLocation,
    pub initial_state: ResourceState,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TextureFormat {
    Rgba8Unorm,
    Bgra8Unorm,
    R8Unorm,
}

impl TextureFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::Rgba8Unorm | Self::Bgra8Unorm => 4,
            Self::R8Unorm => 1,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TextureDesc {
    pub label: &'static str,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub initial_state: ResourceState,
}

/// Layout of one texture subresource inside a linear staging buffer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TextureFootprint {
    pub offset: u64,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub row_pitch: u32,
}

impl TextureFootprint {
    pub fn for_texture(width: u32, height: u32, format: TextureFormat) -> RenderResult<Self> {
        if width == 0 || height == 0 {
            return Err(RenderError::ResourceUploadFailed(format!(
                "texture extent {width}x{height} is empty"
            )));
        }
        let tight = width
            .checked_mul(format.bytes_per_pixel())
            .ok_or_else(|| RenderError::ResourceUploadFailed("row pitch overflow".into()))?;
        let row_pitch = tight.div_ceil(TEXTURE_ROW_PITCH_ALIGNMENT) * TEXTURE_ROW_PITCH_ALIGNMENT;
        Ok(Self {
            offset: 0,
            width,
            height,
            format,
            row_pitch,
        })
    }

    pub fn tight_row_size(&self) -> u32 {
        self.width * self.format.bytes_per_pixel()
    }

    /// Bytes the staging buffer needs; the last row is not padded.
    pub fn required_size(&self) -> u64 {
        self.offset
            + self.row_pitch as u64 * (self.height as u64 - 1)
            + self.tight_row_size() as u64
    }
}
