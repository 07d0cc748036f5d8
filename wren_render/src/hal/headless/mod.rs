//! A reference device that needs no GPU.
//!
//! Submissions run on a separate timeline thread, so the CPU/GPU overlap the
//! renderer has to get right is real: resetting an allocator too early,
//! destroying a buffer a pending copy still reads, or presenting an image in
//! the wrong state all show up as errors or recorded [`Violation`]s.

mod timeline;

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tracing::{debug, info};

use crate::{
    command_encoder::CommandList,
    error::{RenderError, RenderResult},
    hal::{AdapterInfo, FeatureLevel, Gpu, SwapChainDesc},
    id::{AllocatorId, BufferId, PipelineId, ResourceId, TextureId},
    pipeline::{DescriptorKind, PipelineDesc},
    resource::{BufferDesc, MemoryLocation, ResourceState, TextureDesc},
    surface::SurfaceTarget,
};

use timeline::{BufferMemory, Image, PipelineRecord, Shared, TextureMemory, Work};
pub use timeline::Violation;

#[derive(Clone, Debug)]
pub struct HeadlessDesc {
    pub adapter_name: String,
    pub feature_level: FeatureLevel,
    /// How long the timeline takes per work item.
    pub execution_delay: Duration,
    pub memory_budget: u64,
}

impl Default for HeadlessDesc {
    fn default() -> Self {
        Self {
            adapter_name: "Headless Reference Device".into(),
            feature_level: FeatureLevel::Level12_0,
            execution_delay: Duration::ZERO,
            memory_budget: 256 << 20,
        }
    }
}

struct AllocatorRecord {
    last_batch: u64,
}

pub struct HeadlessGpu {
    adapter: AdapterInfo,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    memory_budget: u64,
    allocated: u64,
    allocators: Vec<Option<AllocatorRecord>>,
    next_batch: u64,
    last_signaled: u64,
    swapchain: Option<SwapChainDesc>,
    current_image: usize,
}

impl HeadlessGpu {
    pub fn new(desc: HeadlessDesc) -> Self {
        let shared = Arc::new(Shared::new());
        let worker = {
            let shared = shared.clone();
            let delay = desc.execution_delay;
            thread::spawn(move || timeline::run(shared, delay))
        };

        Self {
            adapter: AdapterInfo {
                name: desc.adapter_name,
                feature_level: desc.feature_level,
                software: true,
            },
            shared,
            worker: Some(worker),
            memory_budget: desc.memory_budget,
            allocated: 0,
            allocators: Vec::new(),
            next_batch: 0,
            last_signaled: 0,
            swapchain: None,
            current_image: 0,
        }
    }

    pub fn probe(&self) -> HeadlessProbe {
        HeadlessProbe {
            shared: self.shared.clone(),
        }
    }

    fn reserve(&mut self, label: &str, size: u64) -> RenderResult<()> {
        if size == 0 {
            return Err(RenderError::ResourceUploadFailed(format!(
                "`{label}` has a zero size"
            )));
        }
        if self.allocated + size > self.memory_budget {
            return Err(RenderError::ResourceUploadFailed(format!(
                "out of memory allocating {size} bytes for `{label}` ({} of {} in use)",
                self.allocated, self.memory_budget
            )));
        }
        self.allocated += size;
        Ok(())
    }

    fn allocator(&mut self, allocator: AllocatorId) -> RenderResult<&mut AllocatorRecord> {
        self.allocators
            .get_mut(allocator.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| RenderError::UnknownResource(format!("allocator #{}", allocator.0)))
    }
}

impl Drop for HeadlessGpu {
    fn drop(&mut self) {
        self.shared.lock().shutdown = true;
        self.shared.work_ready.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Gpu for HeadlessGpu {
    fn name(&self) -> &'static str {
        "headless"
    }

    fn adapter(&self) -> &AdapterInfo {
        &self.adapter
    }

    fn create_queue(&mut self) -> RenderResult<()> {
        let mut state = self.shared.lock();
        if !state.queue_created {
            state.queue_created = true;
            info!("created headless direct queue");
        }
        Ok(())
    }

    fn create_swapchain(&mut self, target: &SurfaceTarget, desc: &SwapChainDesc) -> RenderResult<()> {
        if self.swapchain.is_some() {
            return Err(RenderError::SurfaceCreationFailed(
                "a swap chain is already bound to this device".into(),
            ));
        }
        if desc.width == 0 || desc.height == 0 || desc.buffer_count == 0 {
            return Err(RenderError::SurfaceCreationFailed(format!(
                "cannot create a {}x{} swap chain with {} images",
                desc.width, desc.height, desc.buffer_count
            )));
        }

        let image_size = desc.width as usize * desc.height as usize * desc.format.bytes_per_pixel() as usize;
        let mut state = self.shared.lock();
        state.images = (0..desc.buffer_count)
            .map(|_| Image {
                bytes: vec![0; image_size],
                state: ResourceState::PresentSource,
            })
            .collect();
        state.image_width = desc.width;
        state.image_format = Some(desc.format);
        state.surface_lost = false;
        drop(state);

        debug!("headless swap chain for {:?}", target);
        self.swapchain = Some(*desc);
        self.current_image = 0;
        Ok(())
    }

    fn destroy_swapchain(&mut self) {
        if self.swapchain.take().is_some() {
            let mut state = self.shared.lock();
            state.images.clear();
            state.image_format = None;
        }
    }

    fn current_image_index(&self) -> usize {
        self.current_image
    }

    fn present(&mut self, _sync_interval: u32) -> RenderResult<()> {
        let Some(desc) = self.swapchain else {
            return Err(RenderError::PresentFailed("no swap chain is bound".into()));
        };
        if self.shared.lock().surface_lost {
            return Err(RenderError::PresentFailed("surface lost".into()));
        }
        self.shared.enqueue(Work::Present {
            image: self.current_image,
        });
        self.current_image = (self.current_image + 1) % desc.buffer_count;
        Ok(())
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> RenderResult<BufferId> {
        self.reserve(desc.label, desc.size)?;
        let mut state = self.shared.lock();
        state.buffers.push(BufferMemory {
            desc: desc.clone(),
            bytes: vec![0; desc.size as usize],
            state: desc.initial_state,
            destroyed: false,
        });
        Ok(BufferId(state.buffers.len() - 1))
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> RenderResult<()> {
        let mut state = self.shared.lock();
        if !state.is_live(buffer.into()) {
            return Err(RenderError::UnknownResource(ResourceId::from(buffer).to_string()));
        }
        let memory = &mut state.buffers[buffer.0];
        if memory.desc.location != MemoryLocation::CpuToGpu {
            return Err(RenderError::ResourceUploadFailed(format!(
                "buffer `{}` is not CPU visible",
                memory.desc.label
            )));
        }
        let end = offset as usize + data.len();
        if end > memory.bytes.len() {
            return Err(RenderError::ResourceUploadFailed(format!(
                "write of {} bytes at {} overruns buffer `{}`",
                data.len(),
                offset,
                memory.desc.label
            )));
        }
        memory.bytes[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        let mut state = self.shared.lock();
        if let Some(memory) = state.buffers.get_mut(buffer.0).filter(|b| !b.destroyed) {
            memory.destroyed = true;
            memory.bytes = Vec::new();
            self.allocated -= memory.desc.size;
        }
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> RenderResult<TextureId> {
        let size = desc.width as u64 * desc.height as u64 * desc.format.bytes_per_pixel() as u64;
        self.reserve(desc.label, size)?;
        let mut state = self.shared.lock();
        state.textures.push(TextureMemory {
            desc: desc.clone(),
            bytes: vec![0; size as usize],
            state: desc.initial_state,
            destroyed: false,
        });
        Ok(TextureId(state.textures.len() - 1))
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        let mut state = self.shared.lock();
        if let Some(memory) = state.textures.get_mut(texture.0).filter(|t| !t.destroyed) {
            memory.destroyed = true;
            self.allocated -= memory.bytes.len() as u64;
            memory.bytes = Vec::new();
        }
    }

    fn read_buffer(&mut self, buffer: BufferId) -> RenderResult<Vec<u8>> {
        let state = self.shared.lock();
        if !state.is_idle() {
            return Err(RenderError::Backend("read-back while the queue is busy".into()));
        }
        if !state.is_live(buffer.into()) {
            return Err(RenderError::UnknownResource(ResourceId::from(buffer).to_string()));
        }
        Ok(state.buffers[buffer.0].bytes.clone())
    }

    fn read_texture(&mut self, texture: TextureId) -> RenderResult<Vec<u8>> {
        let state = self.shared.lock();
        if !state.is_idle() {
            return Err(RenderError::Backend("read-back while the queue is busy".into()));
        }
        if !state.is_live(texture.into()) {
            return Err(RenderError::UnknownResource(ResourceId::from(texture).to_string()));
        }
        Ok(state.textures[texture.0].bytes.clone())
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc) -> RenderResult<PipelineId> {
        let texture_tables = desc
            .binding_layout
            .tables
            .iter()
            .enumerate()
            .filter(|(_, table)| table.kind == DescriptorKind::ShaderResource)
            .map(|(index, _)| index as u32)
            .collect();
        let mut state = self.shared.lock();
        state.pipelines.push(PipelineRecord {
            stride: desc.vertex_layout.stride,
            texture_tables,
            destroyed: false,
        });
        Ok(PipelineId(state.pipelines.len() - 1))
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineId) {
        if let Some(record) = self.shared.lock().pipelines.get_mut(pipeline.0) {
            record.destroyed = true;
        }
    }

    fn create_command_allocator(&mut self) -> RenderResult<AllocatorId> {
        self.allocators.push(Some(AllocatorRecord { last_batch: 0 }));
        Ok(AllocatorId(self.allocators.len() - 1))
    }

    fn destroy_command_allocator(&mut self, allocator: AllocatorId) {
        if let Some(slot) = self.allocators.get_mut(allocator.0) {
            *slot = None;
        }
    }

    fn reset_command_allocator(&mut self, allocator: AllocatorId) -> RenderResult<()> {
        let completed = self.shared.lock().completed_batch;
        let record = self.allocator(allocator)?;
        if record.last_batch > completed {
            return Err(RenderError::AllocatorBusy {
                allocator: allocator.0,
            });
        }
        Ok(())
    }

    fn submit(&mut self, allocator: AllocatorId, list: &CommandList) -> RenderResult<()> {
        if !self.shared.lock().queue_created {
            return Err(RenderError::Backend("submission before queue creation".into()));
        }
        let batch = self.next_batch + 1;
        self.allocator(allocator)?.last_batch = batch;
        self.next_batch = batch;
        self.shared.enqueue(Work::Execute {
            batch,
            list: list.clone(),
        });
        Ok(())
    }

    fn signal(&mut self, value: u64) -> RenderResult<()> {
        if self.shared.lock().signals_refused {
            return Err(RenderError::Backend(format!(
                "queue refused fence signal {value}"
            )));
        }
        self.shared.enqueue(Work::Signal(value));
        self.last_signaled = self.last_signaled.max(value);
        Ok(())
    }

    fn last_signaled(&self) -> u64 {
        self.last_signaled
    }

    fn completed_value(&self) -> u64 {
        self.shared.lock().completed_value
    }

    fn wait_for_value(&self, value: u64, timeout: Option<Duration>) -> RenderResult<()> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.shared.lock();
        while state.completed_value < value {
            match deadline {
                Some(deadline) => {
                    let result = self.shared.progress.wait_until(&mut state, deadline);
                    if result.timed_out() && state.completed_value < value {
                        return Err(RenderError::SyncTimeout {
                            value,
                            completed: state.completed_value,
                        });
                    }
                }
                None => self.shared.progress.wait(&mut state),
            }
        }
        Ok(())
    }
}

/// Test hooks into a [`HeadlessGpu`] timeline. Cheap to clone and usable
/// after the device has moved into a renderer.
#[derive(Clone)]
pub struct HeadlessProbe {
    shared: Arc<Shared>,
}

impl HeadlessProbe {
    pub fn violations(&self) -> Vec<Violation> {
        self.shared.lock().violations.clone()
    }

    pub fn presents(&self) -> u64 {
        self.shared.lock().presents
    }

    pub fn draws(&self) -> u64 {
        self.shared.lock().draws
    }

    pub fn executed_lists(&self) -> u64 {
        self.shared.lock().executed_lists
    }

    pub fn completed_value(&self) -> u64 {
        self.shared.lock().completed_value
    }

    pub fn queue_created(&self) -> bool {
        self.shared.lock().queue_created
    }

    pub fn is_destroyed(&self, resource: ResourceId) -> bool {
        !self.shared.lock().is_live(resource)
    }

    /// Stops the timeline after the work item it is currently executing.
    pub fn stall(&self) {
        self.shared.lock().stalled = true;
    }

    pub fn resume(&self) {
        self.shared.lock().stalled = false;
        self.shared.work_ready.notify_all();
    }

    /// Every fence signal fails until [`HeadlessProbe::accept_signals`].
    pub fn refuse_signals(&self) {
        self.shared.lock().signals_refused = true;
    }

    pub fn accept_signals(&self) {
        self.shared.lock().signals_refused = false;
    }

    /// Every present fails until the swap chain is recreated.
    pub fn lose_surface(&self) {
        self.shared.lock().surface_lost = true;
    }

    pub fn backbuffer_texel(&self, image: usize, x: u32, y: u32) -> Option<[u8; 4]> {
        let state = self.shared.lock();
        let start = (y as usize * state.image_width as usize + x as usize) * 4;
        let bytes = state.images.get(image)?.bytes.get(start..start + 4)?;
        bytes.try_into().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        command_encoder::CommandEncoder,
        resource::{BufferUsage, TextureFormat},
    };

    fn gpu() -> HeadlessGpu {
        let mut gpu = HeadlessGpu::new(HeadlessDesc::default());
        gpu.create_queue().unwrap();
        gpu
    }

    fn swapchain(gpu: &mut HeadlessGpu) {
        gpu.create_swapchain(
            &SurfaceTarget::Offscreen,
            &SwapChainDesc {
                width: 8,
                height: 8,
                buffer_count: 2,
                format: TextureFormat::Rgba8Unorm,
            },
        )
        .unwrap();
    }

    fn run(gpu: &mut HeadlessGpu, allocator: AllocatorId, list: &CommandList, value: u64) {
        gpu.submit(allocator, list).unwrap();
        gpu.signal(value).unwrap();
        gpu.wait_for_value(value, Some(Duration::from_secs(5)))
            .unwrap();
    }

    #[test]
    fn mismatched_barrier_is_recorded() {
        let mut gpu = gpu();
        swapchain(&mut gpu);
        let allocator = gpu.create_command_allocator().unwrap();

        let mut encoder = CommandEncoder::new();
        encoder.reset();
        encoder
            .transition_image(0, ResourceState::RenderTarget, ResourceState::PresentSource)
            .unwrap();
        let list = encoder.finish().unwrap();
        run(&mut gpu, allocator, &list, 1);

        assert_eq!(
            gpu.probe().violations(),
            [Violation::BarrierMismatch {
                resource: ResourceId::Backbuffer(0),
                before: ResourceState::RenderTarget,
                actual: ResourceState::PresentSource,
            }]
        );
    }

    #[test]
    fn clear_outside_render_target_state_is_recorded() {
        let mut gpu = gpu();
        swapchain(&mut gpu);
        let allocator = gpu.create_command_allocator().unwrap();

        let mut encoder = CommandEncoder::new();
        encoder.reset();
        encoder.clear_render_target(1, &[1.0; 4]).unwrap();
        run(&mut gpu, allocator, &encoder.finish().unwrap(), 1);

        assert!(matches!(
            gpu.probe().violations()[..],
            [Violation::WrongState {
                required: ResourceState::RenderTarget,
                ..
            }]
        ));
        assert_eq!(gpu.probe().backbuffer_texel(1, 0, 0), Some([0; 4]));
    }

    #[test]
    fn copy_from_destroyed_staging_is_use_after_free() {
        let mut gpu = gpu();
        let allocator = gpu.create_command_allocator().unwrap();
        let staging = gpu
            .create_buffer(&BufferDesc {
                label: "staging",
                size: 4,
                usage: BufferUsage::Staging,
                location: MemoryLocation::CpuToGpu,
                initial_state: ResourceState::GenericRead,
            })
            .unwrap();
        let target = gpu
            .create_buffer(&BufferDesc {
                label: "target",
                size: 4,
                usage: BufferUsage::Vertex,
                location: MemoryLocation::GpuOnly,
                initial_state: ResourceState::CopyDestination,
            })
            .unwrap();

        let mut encoder = CommandEncoder::new();
        encoder.reset();
        encoder.copy_buffer(staging, target, 4).unwrap();
        let list = encoder.finish().unwrap();

        gpu.probe().stall();
        gpu.submit(allocator, &list).unwrap();
        gpu.destroy_buffer(staging);
        gpu.signal(1).unwrap();
        gpu.probe().resume();
        gpu.wait_for_value(1, Some(Duration::from_secs(5))).unwrap();

        assert_eq!(
            gpu.probe().violations(),
            [Violation::UseAfterFree {
                resource: staging.into()
            }]
        );
    }

    #[test]
    fn busy_allocator_cannot_be_reset() {
        let mut gpu = gpu();
        let allocator = gpu.create_command_allocator().unwrap();
        gpu.probe().stall();
        gpu.submit(allocator, &CommandList::default()).unwrap();
        assert!(matches!(
            gpu.reset_command_allocator(allocator),
            Err(RenderError::AllocatorBusy { allocator: 0 })
        ));

        gpu.signal(1).unwrap();
        gpu.probe().resume();
        gpu.wait_for_value(1, None).unwrap();
        gpu.reset_command_allocator(allocator).unwrap();
    }

    #[test]
    fn staging_writes_respect_memory_location() {
        let mut gpu = gpu();
        let device_local = gpu
            .create_buffer(&BufferDesc {
                label: "local",
                size: 4,
                usage: BufferUsage::Vertex,
                location: MemoryLocation::GpuOnly,
                initial_state: ResourceState::CopyDestination,
            })
            .unwrap();
        assert!(matches!(
            gpu.write_buffer(device_local, 0, &[1, 2, 3, 4]),
            Err(RenderError::ResourceUploadFailed(_))
        ));
    }

    #[test]
    fn allocations_past_the_budget_fail() {
        let mut gpu = HeadlessGpu::new(HeadlessDesc {
            memory_budget: 1024,
            ..Default::default()
        });
        let desc = BufferDesc {
            label: "big",
            size: 768,
            usage: BufferUsage::Vertex,
            location: MemoryLocation::GpuOnly,
            initial_state: ResourceState::CopyDestination,
        };
        let first = gpu.create_buffer(&desc).unwrap();
        assert!(matches!(
            gpu.create_buffer(&desc),
            Err(RenderError::ResourceUploadFailed(_))
        ));
        gpu.destroy_buffer(first);
        gpu.create_buffer(&desc).unwrap();
    }

    #[test]
    fn present_advances_the_ring_and_fails_once_lost() {
        let mut gpu = gpu();
        swapchain(&mut gpu);
        assert_eq!(gpu.current_image_index(), 0);
        gpu.present(1).unwrap();
        assert_eq!(gpu.current_image_index(), 1);
        gpu.present(1).unwrap();
        assert_eq!(gpu.current_image_index(), 0);

        gpu.probe().lose_surface();
        assert!(matches!(gpu.present(1), Err(RenderError::PresentFailed(_))));
    }
}
