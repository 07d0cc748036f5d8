use std::sync::Arc;

use windows::Win32::Graphics::{
    Direct3D12::{
        ID3D12DescriptorHeap, ID3D12Device, ID3D12Resource, D3D12_CPU_DESCRIPTOR_HANDLE,
        D3D12_DEFAULT_SHADER_4_COMPONENT_MAPPING, D3D12_GPU_DESCRIPTOR_HANDLE,
        D3D12_SHADER_RESOURCE_VIEW_DESC, D3D12_SHADER_RESOURCE_VIEW_DESC_0,
        D3D12_SRV_DIMENSION_TEXTURE2D, D3D12_TEX2D_SRV,
    },
    Dxgi::Common::DXGI_FORMAT,
};

use crate::error::{RenderError, RenderResult};

/// Fixed-capacity descriptor heap with slot reuse.
pub struct DescriptorHeap {
    heap: ID3D12DescriptorHeap,
    device: Arc<ID3D12Device>,
    descriptor_size: u32,
    capacity: usize,
    items: usize,
    free: Vec<usize>,
}

impl DescriptorHeap {
    pub fn new(
        heap: ID3D12DescriptorHeap,
        device: Arc<ID3D12Device>,
        descriptor_size: u32,
        capacity: usize,
    ) -> Self {
        Self {
            heap,
            device,
            descriptor_size,
            capacity,
            items: 0,
            free: Vec::new(),
        }
    }

    pub fn get(&self) -> ID3D12DescriptorHeap {
        self.heap.clone()
    }

    pub fn get_handle(&self, idx: usize) -> D3D12_CPU_DESCRIPTOR_HANDLE {
        D3D12_CPU_DESCRIPTOR_HANDLE {
            ptr: unsafe { self.heap.GetCPUDescriptorHandleForHeapStart() }.ptr
                + idx * self.descriptor_size as usize,
        }
    }

    /// Only valid for shader-visible heaps.
    pub fn get_gpu_handle(&self, idx: usize) -> D3D12_GPU_DESCRIPTOR_HANDLE {
        D3D12_GPU_DESCRIPTOR_HANDLE {
            ptr: unsafe { self.heap.GetGPUDescriptorHandleForHeapStart() }.ptr
                + (idx * self.descriptor_size as usize) as u64,
        }
    }

    fn allocate(&mut self) -> RenderResult<usize> {
        if let Some(idx) = self.free.pop() {
            return Ok(idx);
        }
        if self.items == self.capacity {
            return Err(RenderError::ResourceUploadFailed(format!(
                "descriptor heap full ({} descriptors)",
                self.capacity
            )));
        }
        self.items += 1;
        Ok(self.items - 1)
    }

    pub fn release(&mut self, idx: usize) {
        self.free.push(idx);
    }

    /// Forgets every slot, e.g. after the swap chain buffers are released.
    pub fn clear(&mut self) {
        self.items = 0;
        self.free.clear();
    }

    pub fn create_rtv(&mut self, resource: &ID3D12Resource) -> RenderResult<usize> {
        let idx = self.allocate()?;
        unsafe {
            self.device
                .CreateRenderTargetView(resource, None, self.get_handle(idx));
        }
        Ok(idx)
    }

    pub fn create_texture_srv(
        &mut self,
        resource: &ID3D12Resource,
        format: DXGI_FORMAT,
    ) -> RenderResult<usize> {
        let idx = self.allocate()?;
        let desc = D3D12_SHADER_RESOURCE_VIEW_DESC {
            Format: format,
            ViewDimension: D3D12_SRV_DIMENSION_TEXTURE2D,
            Shader4ComponentMapping: D3D12_DEFAULT_SHADER_4_COMPONENT_MAPPING,
            Anonymous: D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                Texture2D: D3D12_TEX2D_SRV {
                    MipLevels: 1,
                    ..Default::default()
                },
            },
        };
        unsafe {
            self.device
                .CreateShaderResourceView(resource, Some(&desc), self.get_handle(idx));
        }
        Ok(idx)
    }
}
