//! Direct3D 12 through DXGI.
//!
//! Resources live in gpu-allocator placed heaps. Recorded [`CommandList`]s
//! are replayed onto one native graphics list per command allocator at
//! submission time.

mod command_encoder;
mod descriptor;
mod device;
mod queue;
mod shader;

use std::time::Duration;

use gpu_allocator::{d3d12::Resource, MemoryLocation as HeapLocation};
use raw_window_handle::RawWindowHandle;
use tracing::{debug, error, info};
use windows::Win32::{
    Foundation::HWND,
    Graphics::{
        Direct3D::*,
        Direct3D12::*,
        Dxgi::{Common::*, *},
    },
};

use crate::{
    command_encoder::CommandList,
    error::{RenderError, RenderResult},
    hal::{AdapterInfo, DeviceDesc, FeatureLevel, Gpu, SwapChainDesc},
    id::{AllocatorId, BufferId, PipelineId, ResourceId, TextureId},
    pipeline::PipelineDesc,
    resource::{
        BufferDesc, MemoryLocation, ResourceState, TextureDesc, TextureFootprint, TextureFormat,
    },
    surface::SurfaceTarget,
};

use command_encoder::{copy_region, transition_raw, CopyDirection, NativeEncoder};
use descriptor::DescriptorHeap;
use device::Device;
use queue::{Fence, Queue};

pub use shader::compile_shader;

const MAX_BACKBUFFERS: u32 = 8;
const SHADER_DESCRIPTORS: u32 = 1024;

impl From<windows::core::Error> for RenderError {
    fn from(err: windows::core::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<gpu_allocator::AllocationError> for RenderError {
    fn from(err: gpu_allocator::AllocationError) -> Self {
        Self::ResourceUploadFailed(err.to_string())
    }
}

pub(crate) fn feature_level_to_d3d(level: FeatureLevel) -> D3D_FEATURE_LEVEL {
    match level {
        FeatureLevel::Level11_0 => D3D_FEATURE_LEVEL_11_0,
        FeatureLevel::Level11_1 => D3D_FEATURE_LEVEL_11_1,
        FeatureLevel::Level12_0 => D3D_FEATURE_LEVEL_12_0,
        FeatureLevel::Level12_1 => D3D_FEATURE_LEVEL_12_1,
    }
}

pub(crate) fn dxgi_format(format: TextureFormat) -> DXGI_FORMAT {
    match format {
        TextureFormat::Rgba8Unorm => DXGI_FORMAT_R8G8B8A8_UNORM,
        TextureFormat::Bgra8Unorm => DXGI_FORMAT_B8G8R8A8_UNORM,
        TextureFormat::R8Unorm => DXGI_FORMAT_R8_UNORM,
    }
}

pub(crate) fn resource_state(state: ResourceState) -> D3D12_RESOURCE_STATES {
    match state {
        ResourceState::Common => D3D12_RESOURCE_STATE_COMMON,
        ResourceState::CopyDestination => D3D12_RESOURCE_STATE_COPY_DEST,
        ResourceState::GenericRead => D3D12_RESOURCE_STATE_GENERIC_READ,
        ResourceState::ShaderResource => D3D12_RESOURCE_STATES(
            D3D12_RESOURCE_STATE_PIXEL_SHADER_RESOURCE.0
                | D3D12_RESOURCE_STATE_NON_PIXEL_SHADER_RESOURCE.0,
        ),
        ResourceState::RenderTarget => D3D12_RESOURCE_STATE_RENDER_TARGET,
        ResourceState::PresentSource => D3D12_RESOURCE_STATE_PRESENT,
    }
}

struct BufferRecord {
    resource: Resource,
    desc: BufferDesc,
}

struct TextureRecord {
    resource: Resource,
    desc: TextureDesc,
    srv: usize,
    state: ResourceState,
}

struct PipelineRecord {
    root_signature: ID3D12RootSignature,
    pipeline: ID3D12PipelineState,
}

/// Everything a recorded command can name, resolved to native objects.
pub struct Resources {
    buffers: Vec<Option<BufferRecord>>,
    textures: Vec<Option<TextureRecord>>,
    pipelines: Vec<Option<PipelineRecord>>,
    backbuffers: Vec<(ID3D12Resource, usize)>,
    rtv_heap: DescriptorHeap,
    srv_heap: DescriptorHeap,
}

impl Resources {
    fn unknown(id: impl Into<ResourceId>) -> RenderError {
        RenderError::UnknownResource(id.into().to_string())
    }

    pub fn shader_heap(&self) -> ID3D12DescriptorHeap {
        self.srv_heap.get()
    }

    pub fn buffer(&self, id: BufferId) -> RenderResult<&ID3D12Resource> {
        self.buffers
            .get(id.0)
            .and_then(Option::as_ref)
            .map(|record| record.resource.resource())
            .ok_or_else(|| Self::unknown(id))
    }

    pub fn texture(&self, id: TextureId) -> RenderResult<&ID3D12Resource> {
        self.texture_record(id).map(|record| record.resource.resource())
    }

    fn texture_record(&self, id: TextureId) -> RenderResult<&TextureRecord> {
        self.textures
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| Self::unknown(id))
    }

    pub fn texture_descriptor(&self, id: TextureId) -> RenderResult<D3D12_GPU_DESCRIPTOR_HANDLE> {
        let record = self.texture_record(id)?;
        Ok(self.srv_heap.get_gpu_handle(record.srv))
    }

    pub fn resource(&self, id: ResourceId) -> RenderResult<&ID3D12Resource> {
        match id {
            ResourceId::Buffer(buffer) => self.buffer(buffer),
            ResourceId::Texture(texture) => self.texture(texture),
            ResourceId::Backbuffer(image) => self
                .backbuffers
                .get(image)
                .map(|(resource, _)| resource)
                .ok_or_else(|| Self::unknown(id)),
        }
    }

    pub fn render_target(&self, image: usize) -> RenderResult<D3D12_CPU_DESCRIPTOR_HANDLE> {
        self.backbuffers
            .get(image)
            .map(|(_, rtv)| self.rtv_heap.get_handle(*rtv))
            .ok_or_else(|| Self::unknown(ResourceId::Backbuffer(image)))
    }

    pub fn pipeline(
        &self,
        id: PipelineId,
    ) -> RenderResult<(&ID3D12RootSignature, &ID3D12PipelineState)> {
        self.pipelines
            .get(id.0)
            .and_then(Option::as_ref)
            .map(|record| (&record.root_signature, &record.pipeline))
            .ok_or_else(|| RenderError::UnknownResource(format!("pipeline #{}", id.0)))
    }

    /// Tracks texture states at record time so read-back can restore them.
    pub fn set_state(&mut self, id: ResourceId, state: ResourceState) {
        if let ResourceId::Texture(texture) = id {
            if let Some(Some(record)) = self.textures.get_mut(texture.0) {
                record.state = state;
            }
        }
    }
}

struct SwapChain {
    swapchain: IDXGISwapChain3,
    desc: SwapChainDesc,
}

/// Private allocator, list and fence for read-back copies and idle waits,
/// kept off the frame fence's timeline.
struct Immediate {
    encoder: NativeEncoder,
    fence: Fence,
    value: u64,
}

pub struct D3d12Gpu {
    device: Device,
    adapter: AdapterInfo,
    queue: Option<Queue>,
    fence: Fence,
    last_signaled: u64,
    immediate: Immediate,
    resources: Resources,
    encoders: Vec<Option<NativeEncoder>>,
    swapchain: Option<SwapChain>,
}

impl D3d12Gpu {
    pub fn new(desc: &DeviceDesc) -> RenderResult<Self> {
        let device = Device::new(desc)?;
        let adapter = AdapterInfo {
            name: device.adapter_name.clone(),
            feature_level: device.feature_level,
            software: false,
        };

        let rtv_heap = device.create_descriptor_heap(
            D3D12_DESCRIPTOR_HEAP_TYPE_RTV,
            MAX_BACKBUFFERS,
            D3D12_DESCRIPTOR_HEAP_FLAG_NONE,
        )?;
        let srv_heap = device.create_descriptor_heap(
            D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV,
            SHADER_DESCRIPTORS,
            D3D12_DESCRIPTOR_HEAP_FLAG_SHADER_VISIBLE,
        )?;
        let fence = device.create_fence()?;
        let immediate = Immediate {
            encoder: device.create_command_encoder()?,
            fence: device.create_fence()?,
            value: 0,
        };

        Ok(Self {
            device,
            adapter,
            queue: None,
            fence,
            last_signaled: 0,
            immediate,
            resources: Resources {
                buffers: Vec::new(),
                textures: Vec::new(),
                pipelines: Vec::new(),
                backbuffers: Vec::new(),
                rtv_heap,
                srv_heap,
            },
            encoders: Vec::new(),
            swapchain: None,
        })
    }

    fn queue(&self) -> RenderResult<&Queue> {
        self.queue
            .as_ref()
            .ok_or_else(|| RenderError::Backend("the direct queue has not been created".into()))
    }

    fn encoder(&self, allocator: AllocatorId) -> RenderResult<&NativeEncoder> {
        self.encoders
            .get(allocator.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| RenderError::UnknownResource(format!("allocator #{}", allocator.0)))
    }

    /// Blocks until everything submitted so far has executed.
    fn wait_idle(&mut self) -> RenderResult<()> {
        let Some(queue) = &self.queue else {
            return Ok(());
        };
        self.immediate.value += 1;
        queue.signal(&self.immediate.fence, self.immediate.value)?;
        self.immediate.fence.wait(self.immediate.value, None)
    }

    /// Records a copy into a fresh read-back buffer, runs it and maps the
    /// result.
    fn read_back(
        &mut self,
        size: u64,
        record: impl FnOnce(&ID3D12GraphicsCommandList, &ID3D12Resource, &Resources),
    ) -> RenderResult<Vec<u8>> {
        let readback = self.device.create_buffer(
            "read-back",
            size,
            HeapLocation::GpuToCpu,
            D3D12_RESOURCE_STATE_COPY_DEST,
        )?;

        let result = self.run_read_back(&readback, size, record);
        self.device.free(readback);
        result
    }

    fn run_read_back(
        &mut self,
        readback: &Resource,
        size: u64,
        record: impl FnOnce(&ID3D12GraphicsCommandList, &ID3D12Resource, &Resources),
    ) -> RenderResult<Vec<u8>> {
        let list = self.immediate.encoder.begin()?;
        record(list, readback.resource(), &self.resources);
        let list = self.immediate.encoder.finish()?;
        self.queue()?.execute_command_lists(&[Some(list)]);
        self.wait_idle()?;
        self.device.read_mapped(readback, size as usize)
    }

    fn create_backbuffers(&mut self, swapchain: &IDXGISwapChain3, count: usize) -> RenderResult<()> {
        for index in 0..count {
            let resource: ID3D12Resource = unsafe { swapchain.GetBuffer(index as u32) }
                .map_err(|err| RenderError::SurfaceCreationFailed(err.to_string()))?;
            let rtv = self.resources.rtv_heap.create_rtv(&resource)?;
            self.resources.backbuffers.push((resource, rtv));
        }
        Ok(())
    }
}

impl Drop for D3d12Gpu {
    fn drop(&mut self) {
        if let Err(err) = self.wait_idle() {
            error!("failed to idle the queue before teardown: {}", err);
        }
        for record in self.resources.buffers.drain(..).flatten() {
            self.device.free(record.resource);
        }
        for record in self.resources.textures.drain(..).flatten() {
            self.device.free(record.resource);
        }
    }
}

impl Gpu for D3d12Gpu {
    fn name(&self) -> &'static str {
        "d3d12"
    }

    fn adapter(&self) -> &AdapterInfo {
        &self.adapter
    }

    fn create_queue(&mut self) -> RenderResult<()> {
        if self.queue.is_none() {
            self.queue = Some(self.device.create_command_queue()?);
            info!("created direct command queue");
        }
        Ok(())
    }

    fn create_swapchain(&mut self, target: &SurfaceTarget, desc: &SwapChainDesc) -> RenderResult<()> {
        let hwnd = match target {
            SurfaceTarget::Window(RawWindowHandle::Win32(handle)) => HWND(handle.hwnd.get()),
            other => {
                return Err(RenderError::SurfaceCreationFailed(format!(
                    "{other:?} is not a Win32 window"
                )))
            }
        };
        if self.swapchain.is_some() {
            return Err(RenderError::SurfaceCreationFailed(
                "a swap chain is already bound to this device".into(),
            ));
        }
        if desc.buffer_count > MAX_BACKBUFFERS as usize {
            return Err(RenderError::SurfaceCreationFailed(format!(
                "at most {MAX_BACKBUFFERS} swap chain images are supported"
            )));
        }

        let native_desc = DXGI_SWAP_CHAIN_DESC1 {
            Width: desc.width,
            Height: desc.height,
            Format: dxgi_format(desc.format),
            BufferCount: desc.buffer_count as u32,
            BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
            SwapEffect: DXGI_SWAP_EFFECT_FLIP_DISCARD,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            ..Default::default()
        };
        let swapchain = self
            .device
            .create_swapchain(&native_desc, self.queue()?, hwnd)?;
        if let Err(err) = self.create_backbuffers(&swapchain, desc.buffer_count) {
            self.resources.backbuffers.clear();
            self.resources.rtv_heap.clear();
            return Err(err);
        }

        debug!("swap chain bound to {:?}", hwnd);
        self.swapchain = Some(SwapChain {
            swapchain,
            desc: *desc,
        });
        Ok(())
    }

    fn destroy_swapchain(&mut self) {
        if self.swapchain.take().is_some() {
            self.resources.backbuffers.clear();
            self.resources.rtv_heap.clear();
        }
    }

    fn current_image_index(&self) -> usize {
        self.swapchain.as_ref().map_or(0, |swapchain| unsafe {
            swapchain.swapchain.GetCurrentBackBufferIndex() as usize
        })
    }

    fn present(&mut self, sync_interval: u32) -> RenderResult<()> {
        let swapchain = self
            .swapchain
            .as_ref()
            .ok_or_else(|| RenderError::PresentFailed("no swap chain is bound".into()))?;
        unsafe { swapchain.swapchain.Present(sync_interval, 0) }
            .ok()
            .map_err(|err| RenderError::PresentFailed(err.to_string()))?;
        debug!(
            "presented {}x{}",
            swapchain.desc.width, swapchain.desc.height
        );
        Ok(())
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> RenderResult<BufferId> {
        if desc.size == 0 {
            return Err(RenderError::ResourceUploadFailed(format!(
                "`{}` has a zero size",
                desc.label
            )));
        }
        let (location, state) = match desc.location {
            MemoryLocation::GpuOnly => (HeapLocation::GpuOnly, resource_state(desc.initial_state)),
            MemoryLocation::CpuToGpu => (HeapLocation::CpuToGpu, D3D12_RESOURCE_STATE_GENERIC_READ),
            MemoryLocation::GpuToCpu => (HeapLocation::GpuToCpu, D3D12_RESOURCE_STATE_COPY_DEST),
        };
        let resource = self
            .device
            .create_buffer(desc.label, desc.size, location, state)?;
        self.resources.buffers.push(Some(BufferRecord {
            resource,
            desc: desc.clone(),
        }));
        Ok(BufferId(self.resources.buffers.len() - 1))
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> RenderResult<()> {
        let record = self
            .resources
            .buffers
            .get(buffer.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| Resources::unknown(buffer))?;
        if record.desc.location != MemoryLocation::CpuToGpu {
            return Err(RenderError::ResourceUploadFailed(format!(
                "buffer `{}` is not CPU visible",
                record.desc.label
            )));
        }
        if offset + data.len() as u64 > record.desc.size {
            return Err(RenderError::ResourceUploadFailed(format!(
                "write of {} bytes at {} overruns buffer `{}`",
                data.len(),
                offset,
                record.desc.label
            )));
        }
        self.device.write_mapped(&record.resource, offset, data)
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        if let Some(record) = self.resources.buffers.get_mut(buffer.0).and_then(Option::take) {
            self.device.free(record.resource);
        }
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> RenderResult<TextureId> {
        let resource = self.device.create_texture(
            desc.label,
            desc.width,
            desc.height,
            desc.format,
            resource_state(desc.initial_state),
        )?;
        let srv = match self
            .resources
            .srv_heap
            .create_texture_srv(resource.resource(), dxgi_format(desc.format))
        {
            Ok(srv) => srv,
            Err(err) => {
                self.device.free(resource);
                return Err(err);
            }
        };
        self.resources.textures.push(Some(TextureRecord {
            resource,
            desc: desc.clone(),
            srv,
            state: desc.initial_state,
        }));
        Ok(TextureId(self.resources.textures.len() - 1))
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        if let Some(record) = self
            .resources
            .textures
            .get_mut(texture.0)
            .and_then(Option::take)
        {
            self.resources.srv_heap.release(record.srv);
            self.device.free(record.resource);
        }
    }

    fn read_buffer(&mut self, buffer: BufferId) -> RenderResult<Vec<u8>> {
        let record = self
            .resources
            .buffers
            .get(buffer.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| Resources::unknown(buffer))?;
        let size = record.desc.size;
        if record.desc.location != MemoryLocation::GpuOnly {
            return self.device.read_mapped(&record.resource, size as usize);
        }

        self.read_back(size, |list, readback, resources| {
            if let Ok(source) = resources.buffer(buffer) {
                unsafe { list.CopyBufferRegion(readback, 0, source, 0, size) };
            }
        })
    }

    fn read_texture(&mut self, texture: TextureId) -> RenderResult<Vec<u8>> {
        let record = self.resources.texture_record(texture)?;
        let footprint =
            TextureFootprint::for_texture(record.desc.width, record.desc.height, record.desc.format)?;
        let state = resource_state(record.state);

        let padded = self.read_back(footprint.required_size(), |list, readback, resources| {
            if let Ok(source) = resources.texture(texture) {
                transition_raw(list, source, state, D3D12_RESOURCE_STATE_COPY_SOURCE);
                copy_region(list, readback, source, &footprint, CopyDirection::TextureToBuffer);
                transition_raw(list, source, D3D12_RESOURCE_STATE_COPY_SOURCE, state);
            }
        })?;

        let row = footprint.tight_row_size() as usize;
        Ok(padded
            .chunks(footprint.row_pitch as usize)
            .take(footprint.height as usize)
            .flat_map(|padded_row| &padded_row[..row])
            .copied()
            .collect())
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc) -> RenderResult<PipelineId> {
        let root_signature = self.device.create_root_signature(&desc.binding_layout)?;
        let pipeline = self
            .device
            .create_graphics_pipeline(desc, &root_signature)?;
        self.resources.pipelines.push(Some(PipelineRecord {
            root_signature,
            pipeline,
        }));
        Ok(PipelineId(self.resources.pipelines.len() - 1))
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineId) {
        if let Some(slot) = self.resources.pipelines.get_mut(pipeline.0) {
            *slot = None;
        }
    }

    fn create_command_allocator(&mut self) -> RenderResult<AllocatorId> {
        self.encoders
            .push(Some(self.device.create_command_encoder()?));
        Ok(AllocatorId(self.encoders.len() - 1))
    }

    fn destroy_command_allocator(&mut self, allocator: AllocatorId) {
        if let Some(slot) = self.encoders.get_mut(allocator.0) {
            *slot = None;
        }
    }

    fn reset_command_allocator(&mut self, allocator: AllocatorId) -> RenderResult<()> {
        self.encoder(allocator)?
            .reset_allocator()
            .map_err(|_| RenderError::AllocatorBusy {
                allocator: allocator.0,
            })
    }

    fn submit(&mut self, allocator: AllocatorId, list: &CommandList) -> RenderResult<()> {
        let encoder = self
            .encoders
            .get(allocator.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| RenderError::UnknownResource(format!("allocator #{}", allocator.0)))?;
        let native = encoder.encode(list, &mut self.resources)?;
        self.queue()?.execute_command_lists(&[Some(native)]);
        Ok(())
    }

    fn signal(&mut self, value: u64) -> RenderResult<()> {
        self.queue()?.signal(&self.fence, value)?;
        self.last_signaled = self.last_signaled.max(value);
        Ok(())
    }

    fn last_signaled(&self) -> u64 {
        self.last_signaled
    }

    fn completed_value(&self) -> u64 {
        self.fence.completed_value()
    }

    fn wait_for_value(&self, value: u64, timeout: Option<Duration>) -> RenderResult<()> {
        self.fence.wait(value, timeout)
    }
}
