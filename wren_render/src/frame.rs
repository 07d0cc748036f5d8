use tracing::trace;

use crate::{
    command_encoder::{CommandEncoder, CommandList, DrawArgs, PrimitiveTopology, VertexBufferView},
    config::SyncPolicy,
    device::DeviceContext,
    error::{RenderError, RenderResult},
    fence::FrameFence,
    hal::Gpu,
    id::{AllocatorId, PipelineId, TextureId},
    resource::ResourceState,
    surface::PresentationSurface,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FrameState {
    Idle,
    Recording,
    Submitted,
    Presented,
}

impl FrameState {
    fn next(self) -> Self {
        match self {
            Self::Idle => Self::Recording,
            Self::Recording => Self::Submitted,
            Self::Submitted => Self::Presented,
            Self::Presented => Self::Idle,
        }
    }
}

/// One fully resolved draw, ready to be recorded every frame.
#[derive(Clone, Debug, PartialEq)]
pub struct DrawItem {
    pub pipeline: PipelineId,
    pub topology: PrimitiveTopology,
    pub vertex_buffer: VertexBufferView,
    /// Root parameter index and the texture bound to it.
    pub textures: Vec<(u32, TextureId)>,
    pub args: DrawArgs,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FrameStats {
    pub frame: u64,
    pub image_index: usize,
    pub fence_value: u64,
    pub command_count: usize,
}

#[derive(Debug)]
struct FrameSlot {
    allocator: AllocatorId,
    /// Fence value of the last submission recorded from this slot.
    fence_value: u64,
}

/// Drives `Idle -> Recording -> Submitted -> Presented -> Idle`.
///
/// Ring slot `i` pairs swap chain image `i` with its own command allocator.
/// A slot is only reused once the fence value of its previous frame has
/// retired.
pub struct FrameExecutor {
    state: FrameState,
    policy: SyncPolicy,
    slots: Vec<FrameSlot>,
    encoder: CommandEncoder,
    clear_color: [f32; 4],
    frame: u64,
    image: usize,
    last_commands: Option<CommandList>,
}

impl FrameExecutor {
    pub fn new<G: Gpu>(
        device: &mut DeviceContext<G>,
        slot_count: usize,
        policy: SyncPolicy,
        clear_color: [f32; 4],
    ) -> RenderResult<Self> {
        let mut slots = Vec::with_capacity(slot_count);
        for _ in 0..slot_count {
            let allocator = match device.gpu_mut().create_command_allocator() {
                Ok(allocator) => allocator,
                Err(err) => {
                    for slot in slots {
                        let FrameSlot { allocator, .. } = slot;
                        device.gpu_mut().destroy_command_allocator(allocator);
                    }
                    return Err(err);
                }
            };
            slots.push(FrameSlot {
                allocator,
                fence_value: 0,
            });
        }

        Ok(Self {
            state: FrameState::Idle,
            policy,
            slots,
            encoder: CommandEncoder::new(),
            clear_color,
            frame: 0,
            image: 0,
            last_commands: None,
        })
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn last_commands(&self) -> Option<&CommandList> {
        self.last_commands.as_ref()
    }

    fn expect(&self, to: FrameState) -> RenderResult<()> {
        if self.state.next() != to {
            return Err(RenderError::InvalidFrameState {
                from: self.state,
                to,
            });
        }
        Ok(())
    }

    /// Waits for the slot of the current image to retire, then reopens its
    /// allocator for recording.
    pub fn begin<G: Gpu>(
        &mut self,
        device: &mut DeviceContext<G>,
        fence: &mut FrameFence,
        surface: &PresentationSurface,
    ) -> RenderResult<usize> {
        self.expect(FrameState::Recording)?;

        let image = surface.current_image_index(device);
        let slot = self.slots.get(image).ok_or_else(|| {
            RenderError::UnknownResource(format!(
                "image {image} is outside the {} frame slots",
                self.slots.len()
            ))
        })?;
        if !fence.is_retired(device, slot.fence_value) {
            trace!("waiting for slot {} (fence value {})", image, slot.fence_value);
        }
        fence.wait_until(device, slot.fence_value)?;
        device.gpu_mut().reset_command_allocator(slot.allocator)?;
        self.encoder.reset();

        self.image = image;
        self.state = FrameState::Recording;
        Ok(image)
    }

    pub fn record(&mut self, surface: &PresentationSurface, draws: &[DrawItem]) -> RenderResult<()> {
        if self.state != FrameState::Recording {
            return Err(RenderError::EncoderClosed);
        }
        let (width, height) = (surface.width(), surface.height());
        let image = self.image;
        let encoder = &mut self.encoder;

        encoder.set_viewport(width, height)?;
        encoder.set_scissor(width, height)?;
        encoder.transition_image(image, ResourceState::PresentSource, ResourceState::RenderTarget)?;
        encoder.set_render_target(image)?;
        encoder.clear_render_target(image, &self.clear_color)?;
        for draw in draws {
            encoder.set_pipeline(draw.pipeline)?;
            encoder.set_primitive_topology(draw.topology)?;
            encoder.set_vertex_buffer(0, draw.vertex_buffer)?;
            for &(table, texture) in &draw.textures {
                encoder.set_texture(table, texture)?;
            }
            encoder.draw_instanced(draw.args)?;
        }
        encoder.transition_image(image, ResourceState::RenderTarget, ResourceState::PresentSource)?;
        Ok(())
    }

    pub fn submit<G: Gpu>(&mut self, device: &mut DeviceContext<G>) -> RenderResult<usize> {
        self.expect(FrameState::Submitted)?;
        let list = self.encoder.finish()?;
        device
            .gpu_mut()
            .submit(self.slots[self.image].allocator, &list)?;

        let count = list.len();
        self.last_commands = Some(list);
        self.state = FrameState::Submitted;
        Ok(count)
    }

    pub fn present<G: Gpu>(
        &mut self,
        device: &mut DeviceContext<G>,
        surface: &PresentationSurface,
    ) -> RenderResult<()> {
        self.expect(FrameState::Presented)?;
        surface.present(device)?;
        self.state = FrameState::Presented;
        Ok(())
    }

    /// Signals the slot's fence value. Lockstep blocks on it right away,
    /// frames in flight defer the wait to the next reuse of the slot.
    pub fn complete<G: Gpu>(
        &mut self,
        device: &mut DeviceContext<G>,
        fence: &mut FrameFence,
    ) -> RenderResult<u64> {
        self.expect(FrameState::Idle)?;
        let value = fence.signal(device)?;
        self.slots[self.image].fence_value = value;
        if self.policy == SyncPolicy::Lockstep {
            fence.wait_until(device, value)?;
        }
        self.frame += 1;
        self.state = FrameState::Idle;
        Ok(value)
    }

    pub fn run_frame<G: Gpu>(
        &mut self,
        device: &mut DeviceContext<G>,
        fence: &mut FrameFence,
        surface: &PresentationSurface,
        draws: &[DrawItem],
    ) -> RenderResult<FrameStats> {
        let image_index = self.begin(device, fence, surface)?;
        self.record(surface, draws)?;
        let command_count = self.submit(device)?;
        self.present(device, surface)?;
        let fence_value = self.complete(device, fence)?;

        let stats = FrameStats {
            frame: self.frame,
            image_index,
            fence_value,
            command_count,
        };
        trace!("{:?}", stats);
        Ok(stats)
    }

    pub fn destroy<G: Gpu>(self, device: &mut DeviceContext<G>) {
        for slot in self.slots {
            device.gpu_mut().destroy_command_allocator(slot.allocator);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        command_encoder::Command,
        hal::{
            headless::{HeadlessDesc, HeadlessGpu},
            DeviceDesc, SwapChainDesc,
        },
        resource::TextureFormat,
        surface::SurfaceTarget,
    };

    struct Harness {
        device: DeviceContext<HeadlessGpu>,
        fence: FrameFence,
        surface: PresentationSurface,
    }

    fn harness() -> Harness {
        let mut device =
            DeviceContext::new(HeadlessGpu::new(HeadlessDesc::default()), &DeviceDesc::default())
                .unwrap();
        let fence = FrameFence::new(&device, None);
        let surface = PresentationSurface::create(
            &mut device,
            SurfaceTarget::Offscreen,
            SwapChainDesc {
                width: 32,
                height: 16,
                buffer_count: 2,
                format: TextureFormat::Rgba8Unorm,
            },
            1,
        )
        .unwrap();
        Harness {
            device,
            fence,
            surface,
        }
    }

    #[test]
    fn out_of_order_transitions_are_rejected() {
        let Harness {
            mut device,
            mut fence,
            surface,
        } = harness();
        let mut executor =
            FrameExecutor::new(&mut device, 2, SyncPolicy::Lockstep, [0.0; 4]).unwrap();

        assert!(matches!(
            executor.present(&mut device, &surface),
            Err(RenderError::InvalidFrameState {
                from: FrameState::Idle,
                to: FrameState::Presented
            })
        ));
        assert!(matches!(
            executor.record(&surface, &[]),
            Err(RenderError::EncoderClosed)
        ));

        executor.begin(&mut device, &mut fence, &surface).unwrap();
        assert_eq!(executor.state(), FrameState::Recording);
        assert!(executor.begin(&mut device, &mut fence, &surface).is_err());
    }

    #[test]
    fn frame_without_draws_clears_between_barriers() {
        let Harness {
            mut device,
            mut fence,
            surface,
        } = harness();
        let mut executor =
            FrameExecutor::new(&mut device, 2, SyncPolicy::Lockstep, [1.0, 0.0, 0.0, 1.0])
                .unwrap();

        let stats = executor
            .run_frame(&mut device, &mut fence, &surface, &[])
            .unwrap();
        assert_eq!(stats.frame, 1);
        assert_eq!(stats.image_index, 0);
        assert_eq!(stats.fence_value, 1);
        assert_eq!(executor.state(), FrameState::Idle);

        let commands = executor.last_commands().unwrap().commands();
        assert!(matches!(commands[0], Command::SetViewport(_)));
        assert!(matches!(
            commands[4],
            Command::ClearRenderTarget { image: 0, color } if color == [1.0, 0.0, 0.0, 1.0]
        ));
        assert_eq!(commands.len(), 6);

        let probe = device.gpu().probe();
        assert_eq!(probe.backbuffer_texel(0, 31, 15), Some([255, 0, 0, 255]));
        assert!(probe.violations().is_empty());
    }

    #[test]
    fn frames_in_flight_defers_the_wait_to_slot_reuse() {
        let Harness {
            mut device,
            mut fence,
            surface,
        } = harness();
        let mut executor =
            FrameExecutor::new(&mut device, 2, SyncPolicy::FramesInFlight, [0.0; 4]).unwrap();

        for _ in 0..6 {
            executor
                .run_frame(&mut device, &mut fence, &surface, &[])
                .unwrap();
        }
        let audit = fence.audit();
        assert_eq!(audit.last_signaled, 6);
        // The two most recent frames were never waited for.
        assert_eq!(audit.last_waited, 4);

        fence.drain(&mut device).unwrap();
        assert!(device.gpu().probe().violations().is_empty());
        assert_eq!(device.gpu().probe().presents(), 6);
    }
}
