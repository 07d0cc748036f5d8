use tracing::{debug, warn};

use crate::{
    command_encoder::CommandEncoder,
    device::DeviceContext,
    error::{RenderError, RenderResult},
    fence::FrameFence,
    hal::Gpu,
    id::{AllocatorId, BufferId, TextureId},
    resource::{
        BufferDesc, BufferUsage, MemoryLocation, ResourceState, TextureDesc, TextureFootprint,
    },
    retire::RetirementQueue,
    texture::TextureData,
};

/// Records one-shot copies from staging memory into device-local resources.
///
/// Any number of uploads share one recording on a dedicated allocator.
/// [`Uploader::flush`] submits them with a single fence signal and hands the
/// staging buffers to the retirement queue under that value.
pub struct Uploader {
    allocator: AllocatorId,
    encoder: CommandEncoder,
    staged: Vec<BufferId>,
    staged_bytes: u64,
}

impl Uploader {
    pub fn new<G: Gpu>(device: &mut DeviceContext<G>) -> RenderResult<Self> {
        let allocator = device.gpu_mut().create_command_allocator()?;
        Ok(Self {
            allocator,
            encoder: CommandEncoder::new(),
            staged: Vec::new(),
            staged_bytes: 0,
        })
    }

    fn begin<G: Gpu>(&mut self, device: &mut DeviceContext<G>) -> RenderResult<()> {
        if !self.encoder.is_recording() {
            device.gpu_mut().reset_command_allocator(self.allocator)?;
            self.encoder.reset();
        }
        Ok(())
    }

    fn stage<G: Gpu>(
        &mut self,
        device: &mut DeviceContext<G>,
        label: &'static str,
        bytes: &[u8],
    ) -> RenderResult<BufferId> {
        let staging = device.gpu_mut().create_buffer(&BufferDesc {
            label,
            size: bytes.len() as u64,
            usage: BufferUsage::Staging,
            location: MemoryLocation::CpuToGpu,
            initial_state: ResourceState::GenericRead,
        })?;
        if let Err(err) = device.gpu_mut().write_buffer(staging, 0, bytes) {
            device.gpu_mut().destroy_buffer(staging);
            return Err(err);
        }
        self.staged.push(staging);
        self.staged_bytes += bytes.len() as u64;
        Ok(staging)
    }

    /// Creates a device-local buffer holding `data`, readable as vertex or
    /// constant input once the batch has executed.
    pub fn upload_buffer<G: Gpu>(
        &mut self,
        device: &mut DeviceContext<G>,
        label: &'static str,
        data: &[u8],
        usage: BufferUsage,
    ) -> RenderResult<BufferId> {
        if data.is_empty() {
            return Err(RenderError::ResourceUploadFailed(format!(
                "buffer `{label}` has no contents"
            )));
        }
        if usage == BufferUsage::Staging {
            return Err(RenderError::ResourceUploadFailed(format!(
                "buffer `{label}` cannot be uploaded as a staging buffer"
            )));
        }
        self.begin(device)?;

        let size = data.len() as u64;
        let buffer = device.gpu_mut().create_buffer(&BufferDesc {
            label,
            size,
            usage,
            location: MemoryLocation::GpuOnly,
            initial_state: ResourceState::CopyDestination,
        })?;
        let staging = match self.stage(device, label, data) {
            Ok(staging) => staging,
            Err(err) => {
                device.gpu_mut().destroy_buffer(buffer);
                return Err(err);
            }
        };

        self.encoder.copy_buffer(staging, buffer, size)?;
        self.encoder.transition(
            buffer,
            ResourceState::CopyDestination,
            ResourceState::GenericRead,
        )?;
        Ok(buffer)
    }

    pub fn upload_texture<G: Gpu>(
        &mut self,
        device: &mut DeviceContext<G>,
        data: &TextureData,
    ) -> RenderResult<TextureId> {
        let footprint = TextureFootprint::for_texture(data.width, data.height, data.format)?;
        let row = footprint.tight_row_size() as usize;
        let expected = row * data.height as usize;
        if data.pixels.len() != expected {
            return Err(RenderError::ResourceUploadFailed(format!(
                "texture `{}` has {} bytes, {}x{} {:?} needs {}",
                data.label,
                data.pixels.len(),
                data.width,
                data.height,
                data.format,
                expected
            )));
        }
        self.begin(device)?;

        let texture = device.gpu_mut().create_texture(&TextureDesc {
            label: data.label,
            width: data.width,
            height: data.height,
            format: data.format,
            initial_state: ResourceState::CopyDestination,
        })?;

        let pitch = footprint.row_pitch as usize;
        let mut padded = vec![0; footprint.required_size() as usize];
        for (src, dst) in data.pixels.chunks_exact(row).zip(padded.chunks_mut(pitch)) {
            dst[..row].copy_from_slice(src);
        }
        let staging = match self.stage(device, data.label, &padded) {
            Ok(staging) => staging,
            Err(err) => {
                device.gpu_mut().destroy_texture(texture);
                return Err(err);
            }
        };

        self.encoder
            .copy_buffer_to_texture(staging, texture, footprint)?;
        self.encoder.transition(
            texture,
            ResourceState::CopyDestination,
            ResourceState::ShaderResource,
        )?;
        Ok(texture)
    }

    pub fn pending(&self) -> usize {
        self.staged.len()
    }

    /// Submits everything recorded since the last flush. Returns the fence
    /// value that retires the batch, or `None` when nothing was recorded.
    pub fn flush<G: Gpu>(
        &mut self,
        device: &mut DeviceContext<G>,
        fence: &mut FrameFence,
        retirement: &mut RetirementQueue,
    ) -> RenderResult<Option<u64>> {
        if !self.encoder.is_recording() {
            return Ok(None);
        }
        let list = self.encoder.finish()?;
        if list.is_empty() {
            return Ok(None);
        }

        device.gpu_mut().submit(self.allocator, &list)?;
        let token = match fence.signal(device) {
            Ok(token) => token,
            Err(err) => {
                // The copies are queued without a retirement value. The staging
                // buffers stay here until a drain makes `destroy` safe.
                warn!(
                    "upload batch of {} buffers submitted without a fence value",
                    self.staged.len()
                );
                return Err(err);
            }
        };
        debug!(
            "flushed {} uploads ({} staging bytes) at fence value {}",
            self.staged.len(),
            self.staged_bytes,
            token
        );
        for staging in self.staged.drain(..) {
            retirement.push(token, staging);
        }
        self.staged_bytes = 0;
        Ok(Some(token))
    }

    /// Frees the allocator and any staging memory no flush handed off.
    /// Only valid once the queue has drained.
    pub fn destroy<G: Gpu>(self, device: &mut DeviceContext<G>) {
        for staging in self.staged {
            device.gpu_mut().destroy_buffer(staging);
        }
        device.gpu_mut().destroy_command_allocator(self.allocator);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        command_encoder::Command,
        hal::{
            headless::{HeadlessDesc, HeadlessGpu},
            DeviceDesc,
        },
        texture::checkerboard,
    };

    fn device() -> DeviceContext<HeadlessGpu> {
        DeviceContext::new(HeadlessGpu::new(HeadlessDesc::default()), &DeviceDesc::default())
            .unwrap()
    }

    #[test]
    fn batch_shares_one_fence_value() {
        let mut device = device();
        let mut fence = FrameFence::new(&device, None);
        let mut retirement = RetirementQueue::new();
        let mut uploader = Uploader::new(&mut device).unwrap();

        uploader
            .upload_buffer(&mut device, "a", &[1, 2, 3, 4], BufferUsage::Vertex)
            .unwrap();
        uploader
            .upload_texture(&mut device, &checkerboard(64, 64, 8))
            .unwrap();
        assert_eq!(uploader.pending(), 2);

        let token = uploader
            .flush(&mut device, &mut fence, &mut retirement)
            .unwrap();
        assert_eq!(token, Some(1));
        assert_eq!(retirement.len(), 2);
        assert_eq!(uploader.pending(), 0);

        fence.wait_until(&device, 1).unwrap();
        assert_eq!(retirement.collect(&mut device, 1), 2);
        assert!(device.gpu().probe().violations().is_empty());
    }

    #[test]
    fn empty_flush_signals_nothing() {
        let mut device = device();
        let mut fence = FrameFence::new(&device, None);
        let mut retirement = RetirementQueue::new();
        let mut uploader = Uploader::new(&mut device).unwrap();
        assert_eq!(
            uploader.flush(&mut device, &mut fence, &mut retirement).unwrap(),
            None
        );
        assert_eq!(fence.last_signaled(), 0);
    }

    #[test]
    fn staging_is_not_released_before_the_copy_retires() {
        let mut device = device();
        let mut fence = FrameFence::new(&device, None);
        let mut retirement = RetirementQueue::new();
        let mut uploader = Uploader::new(&mut device).unwrap();

        device.gpu().probe().stall();
        uploader
            .upload_buffer(&mut device, "late", &[7; 32], BufferUsage::Vertex)
            .unwrap();
        let token = uploader
            .flush(&mut device, &mut fence, &mut retirement)
            .unwrap()
            .unwrap();

        let completed = fence.completed_value(&device);
        assert!(completed < token);
        assert_eq!(retirement.collect(&mut device, completed), 0);

        device.gpu().probe().resume();
        fence.wait_until(&device, token).unwrap();
        assert_eq!(retirement.collect(&mut device, token), 1);
        assert!(device.gpu().probe().violations().is_empty());
    }

    #[test]
    fn failed_signal_keeps_the_staging_alive() {
        let mut device = device();
        let probe = device.gpu().probe();
        let mut fence = FrameFence::new(&device, None);
        let mut retirement = RetirementQueue::new();
        let mut uploader = Uploader::new(&mut device).unwrap();

        uploader
            .upload_buffer(&mut device, "orphan", &[3; 16], BufferUsage::Vertex)
            .unwrap();
        probe.stall();
        probe.refuse_signals();
        assert!(matches!(
            uploader.flush(&mut device, &mut fence, &mut retirement),
            Err(RenderError::Backend(_))
        ));
        assert_eq!(uploader.pending(), 1);
        assert!(retirement.is_empty());
        assert_eq!(probe.executed_lists(), 0);

        probe.accept_signals();
        probe.resume();
        fence.drain(&mut device).unwrap();
        assert_eq!(probe.executed_lists(), 1);
        uploader.destroy(&mut device);
        assert!(probe.violations().is_empty(), "{:?}", probe.violations());
    }

    #[test]
    fn recording_copies_then_transitions() {
        let mut device = device();
        let mut uploader = Uploader::new(&mut device).unwrap();
        let buffer = uploader
            .upload_buffer(&mut device, "vb", &[0; 12], BufferUsage::Vertex)
            .unwrap();
        let list = uploader.encoder.finish().unwrap();
        assert!(matches!(list.commands()[0], Command::CopyBuffer { dst, size: 12, .. } if dst == buffer));
        let barrier = list.barriers().next().unwrap();
        assert_eq!(barrier.after, ResourceState::GenericRead);
    }

    #[test]
    fn mismatched_pixel_count_fails() {
        let mut device = device();
        let mut uploader = Uploader::new(&mut device).unwrap();
        let mut data = checkerboard(16, 16, 4);
        data.pixels.pop();
        assert!(matches!(
            uploader.upload_texture(&mut device, &data),
            Err(RenderError::ResourceUploadFailed(_))
        ));
        assert!(matches!(
            uploader.upload_buffer(&mut device, "empty", &[], BufferUsage::Vertex),
            Err(RenderError::ResourceUploadFailed(_))
        ));
    }
}
