use std::{
    ffi::{c_void, CString},
    mem::MaybeUninit,
    ptr,
    sync::Arc,
};

use gpu_allocator::{
    d3d12::{
        Allocator, AllocatorCreateDesc, ID3D12DeviceVersion, Resource, ResourceCategory,
        ResourceCreateDesc, ResourceStateOrBarrierLayout, ResourceType,
    },
    MemoryLocation as HeapLocation,
};
use tracing::{info, warn};
use windows::{
    core::{ComInterface, PCSTR},
    Win32::{
        Foundation::HWND,
        Graphics::{
            Direct3D::*,
            Direct3D12::*,
            Dxgi::{Common::*, *},
        },
    },
};

use super::{
    command_encoder::NativeEncoder,
    descriptor::DescriptorHeap,
    dxgi_format, feature_level_to_d3d,
    queue::{Fence, Queue},
};
use crate::{
    error::{RenderError, RenderResult},
    hal::{DeviceDesc, FeatureLevel},
    command_encoder::PrimitiveTopology,
    pipeline::{
        AddressMode, BindingLayout, BlendMode, CullMode, DescriptorKind, FillMode, Filter,
        PipelineDesc, ShaderVisibility, VertexFormat,
    },
    resource::TextureFormat,
};

const FEATURE_LEVELS: [FeatureLevel; 4] = [
    FeatureLevel::Level12_1,
    FeatureLevel::Level12_0,
    FeatureLevel::Level11_1,
    FeatureLevel::Level11_0,
];

pub struct Device {
    factory: IDXGIFactory6,
    device: Arc<ID3D12Device>,
    allocator: Allocator,
    _info_queue: Option<ID3D12InfoQueue1>,
    pub adapter_name: String,
    pub feature_level: FeatureLevel,
}

impl Device {
    pub fn new(desc: &DeviceDesc) -> RenderResult<Self> {
        if desc.debug_layer {
            unsafe {
                let mut debug: Option<ID3D12Debug1> = None;
                if D3D12GetDebugInterface(&mut debug).is_ok() {
                    if let Some(debug) = debug {
                        debug.EnableDebugLayer();
                    }
                }
            }
        }

        let factory_flags = if desc.debug_layer {
            DXGI_CREATE_FACTORY_DEBUG
        } else {
            0
        };
        let factory: IDXGIFactory6 = unsafe { CreateDXGIFactory2(factory_flags) }
            .map_err(|err| RenderError::DeviceUnavailable(err.to_string()))?;

        let (adapter, adapter_name, feature_level) =
            select_adapter(&factory, desc.min_feature_level)?;

        let mut device: Option<ID3D12Device> = None;
        unsafe { D3D12CreateDevice(&adapter, feature_level_to_d3d(feature_level), &mut device) }
            .map_err(|err| RenderError::DeviceUnavailable(err.to_string()))?;
        let device = device.ok_or_else(|| {
            RenderError::DeviceUnavailable(format!("`{adapter_name}` returned no device"))
        })?;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            device: ID3D12DeviceVersion::Device(device.clone()),
            debug_settings: Default::default(),
            allocation_sizes: Default::default(),
        })
        .map_err(|err| RenderError::DeviceUnavailable(err.to_string()))?;

        let info_queue = if desc.debug_layer {
            register_message_callback(&device)
        } else {
            None
        };

        info!("selected adapter `{}` ({})", adapter_name, feature_level);
        Ok(Self {
            factory,
            device: Arc::new(device),
            allocator,
            _info_queue: info_queue,
            adapter_name,
            feature_level,
        })
    }

    pub fn raw(&self) -> &ID3D12Device {
        &self.device
    }

    pub fn create_command_queue(&self) -> RenderResult<Queue> {
        let desc = D3D12_COMMAND_QUEUE_DESC {
            Type: D3D12_COMMAND_LIST_TYPE_DIRECT,
            ..Default::default()
        };
        let queue = unsafe { self.device.CreateCommandQueue(&desc) }
            .map_err(|err| RenderError::DeviceUnavailable(err.to_string()))?;
        Ok(Queue::new(queue))
    }

    pub fn create_swapchain(
        &self,
        desc: &DXGI_SWAP_CHAIN_DESC1,
        queue: &Queue,
        hwnd: HWND,
    ) -> RenderResult<IDXGISwapChain3> {
        let surface_error = |err: windows::core::Error| RenderError::SurfaceCreationFailed(err.to_string());
        let swapchain: IDXGISwapChain3 = unsafe {
            self.factory
                .CreateSwapChainForHwnd(queue.get(), hwnd, desc, None, None)
        }
        .map_err(surface_error)?
        .cast()
        .map_err(surface_error)?;

        unsafe { self.factory.MakeWindowAssociation(hwnd, DXGI_MWA_NO_ALT_ENTER) }
            .map_err(surface_error)?;
        Ok(swapchain)
    }

    pub fn create_descriptor_heap(
        &self,
        kind: D3D12_DESCRIPTOR_HEAP_TYPE,
        count: u32,
        flags: D3D12_DESCRIPTOR_HEAP_FLAGS,
    ) -> RenderResult<DescriptorHeap> {
        let desc = D3D12_DESCRIPTOR_HEAP_DESC {
            Type: kind,
            NumDescriptors: count,
            Flags: flags,
            ..Default::default()
        };
        let raw_heap: ID3D12DescriptorHeap = unsafe { self.device.CreateDescriptorHeap(&desc) }?;
        let descriptor_size = unsafe { self.device.GetDescriptorHandleIncrementSize(kind) };
        Ok(DescriptorHeap::new(
            raw_heap,
            self.device.clone(),
            descriptor_size,
            count as usize,
        ))
    }

    pub fn create_texture(
        &mut self,
        name: &str,
        width: u32,
        height: u32,
        format: TextureFormat,
        state: D3D12_RESOURCE_STATES,
    ) -> RenderResult<Resource> {
        let desc = D3D12_RESOURCE_DESC {
            Dimension: D3D12_RESOURCE_DIMENSION_TEXTURE2D,
            Alignment: 0,
            Width: width as u64,
            Height: height,
            DepthOrArraySize: 1,
            MipLevels: 1,
            Format: dxgi_format(format),
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Layout: D3D12_TEXTURE_LAYOUT_UNKNOWN,
            Flags: D3D12_RESOURCE_FLAG_NONE,
        };
        let resource = self.allocator.create_resource(&ResourceCreateDesc {
            name,
            memory_location: HeapLocation::GpuOnly,
            resource_category: ResourceCategory::OtherTexture,
            resource_desc: &desc,
            clear_value: None,
            initial_state_or_layout: ResourceStateOrBarrierLayout::ResourceState(state),
            resource_type: &ResourceType::Placed,
        })?;
        Ok(resource)
    }

    pub fn create_buffer(
        &mut self,
        name: &str,
        size: u64,
        location: HeapLocation,
        state: D3D12_RESOURCE_STATES,
    ) -> RenderResult<Resource> {
        let desc = D3D12_RESOURCE_DESC {
            Dimension: D3D12_RESOURCE_DIMENSION_BUFFER,
            Alignment: 0,
            Width: size,
            Height: 1,
            DepthOrArraySize: 1,
            MipLevels: 1,
            Format: DXGI_FORMAT_UNKNOWN,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Layout: D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
            Flags: D3D12_RESOURCE_FLAG_NONE,
        };
        let resource = self.allocator.create_resource(&ResourceCreateDesc {
            name,
            memory_location: location,
            resource_category: ResourceCategory::Buffer,
            resource_desc: &desc,
            clear_value: None,
            initial_state_or_layout: ResourceStateOrBarrierLayout::ResourceState(state),
            resource_type: &ResourceType::Placed,
        })?;
        Ok(resource)
    }

    pub fn free(&mut self, resource: Resource) {
        if let Err(err) = self.allocator.free_resource(resource) {
            warn!("failed to free GPU resource: {}", err);
        }
    }

    pub fn create_command_encoder(&self) -> RenderResult<NativeEncoder> {
        let allocator: ID3D12CommandAllocator =
            unsafe { self.device.CreateCommandAllocator(D3D12_COMMAND_LIST_TYPE_DIRECT) }?;
        let list: ID3D12GraphicsCommandList = unsafe {
            self.device
                .CreateCommandList(0, D3D12_COMMAND_LIST_TYPE_DIRECT, &allocator, None)
        }?;
        unsafe { list.Close() }?;
        Ok(NativeEncoder::new(allocator, list))
    }

    pub fn create_root_signature(&self, layout: &BindingLayout) -> RenderResult<ID3D12RootSignature> {
        let ranges: Vec<D3D12_DESCRIPTOR_RANGE> = layout
            .tables
            .iter()
            .map(|table| D3D12_DESCRIPTOR_RANGE {
                RangeType: match table.kind {
                    DescriptorKind::ShaderResource => D3D12_DESCRIPTOR_RANGE_TYPE_SRV,
                    DescriptorKind::ConstantBuffer => D3D12_DESCRIPTOR_RANGE_TYPE_CBV,
                },
                NumDescriptors: table.count,
                BaseShaderRegister: table.base_register,
                RegisterSpace: 0,
                OffsetInDescriptorsFromTableStart: 0,
            })
            .collect();
        let parameters: Vec<D3D12_ROOT_PARAMETER> = layout
            .tables
            .iter()
            .zip(&ranges)
            .map(|(table, range)| D3D12_ROOT_PARAMETER {
                ParameterType: D3D12_ROOT_PARAMETER_TYPE_DESCRIPTOR_TABLE,
                Anonymous: D3D12_ROOT_PARAMETER_0 {
                    DescriptorTable: D3D12_ROOT_DESCRIPTOR_TABLE {
                        NumDescriptorRanges: 1,
                        pDescriptorRanges: range,
                    },
                },
                ShaderVisibility: shader_visibility(table.visibility),
            })
            .collect();
        let samplers: Vec<D3D12_STATIC_SAMPLER_DESC> = layout
            .static_samplers
            .iter()
            .map(|sampler| {
                let address = match sampler.address {
                    AddressMode::Wrap => D3D12_TEXTURE_ADDRESS_MODE_WRAP,
                    AddressMode::Clamp => D3D12_TEXTURE_ADDRESS_MODE_CLAMP,
                    AddressMode::Border => D3D12_TEXTURE_ADDRESS_MODE_BORDER,
                };
                D3D12_STATIC_SAMPLER_DESC {
                    Filter: match sampler.filter {
                        Filter::Point => D3D12_FILTER_MIN_MAG_MIP_POINT,
                        Filter::Linear => D3D12_FILTER_MIN_MAG_MIP_LINEAR,
                    },
                    AddressU: address,
                    AddressV: address,
                    AddressW: address,
                    ComparisonFunc: D3D12_COMPARISON_FUNC_NEVER,
                    BorderColor: D3D12_STATIC_BORDER_COLOR_TRANSPARENT_BLACK,
                    MaxLOD: D3D12_FLOAT32_MAX,
                    ShaderRegister: sampler.register,
                    RegisterSpace: 0,
                    ShaderVisibility: shader_visibility(sampler.visibility),
                    ..Default::default()
                }
            })
            .collect();

        let desc = D3D12_ROOT_SIGNATURE_DESC {
            NumParameters: parameters.len() as u32,
            pParameters: parameters.as_ptr(),
            NumStaticSamplers: samplers.len() as u32,
            pStaticSamplers: samplers.as_ptr(),
            Flags: D3D12_ROOT_SIGNATURE_FLAG_ALLOW_INPUT_ASSEMBLER_INPUT_LAYOUT,
        };
        let mut signature = None;
        let mut error = None;
        if let Err(err) = unsafe {
            D3D12SerializeRootSignature(
                &desc,
                D3D_ROOT_SIGNATURE_VERSION_1,
                &mut signature,
                Some(&mut error),
            )
        } {
            let message = error
                .map(|blob: ID3DBlob| unsafe { blob_to_string(&blob) })
                .unwrap_or_else(|| err.to_string());
            return Err(RenderError::InvalidBindingLayout(message));
        }
        let signature = signature.ok_or_else(|| {
            RenderError::InvalidBindingLayout("root signature serialization produced no blob".into())
        })?;

        let root_signature = unsafe {
            self.device.CreateRootSignature(
                0,
                std::slice::from_raw_parts(
                    signature.GetBufferPointer() as _,
                    signature.GetBufferSize(),
                ),
            )
        }
        .map_err(|err| RenderError::InvalidBindingLayout(err.to_string()))?;
        Ok(root_signature)
    }

    pub fn create_graphics_pipeline(
        &self,
        desc: &PipelineDesc,
        root_signature: &ID3D12RootSignature,
    ) -> RenderResult<ID3D12PipelineState> {
        let semantics = desc
            .vertex_layout
            .attributes
            .iter()
            .map(|attribute| {
                CString::new(attribute.semantic.as_str()).map_err(|_| {
                    RenderError::InvalidBindingLayout(format!(
                        "semantic `{}` contains a NUL byte",
                        attribute.semantic
                    ))
                })
            })
            .collect::<RenderResult<Vec<_>>>()?;
        let input_elements: Vec<D3D12_INPUT_ELEMENT_DESC> = desc
            .vertex_layout
            .attributes
            .iter()
            .zip(&semantics)
            .map(|(attribute, semantic)| D3D12_INPUT_ELEMENT_DESC {
                SemanticName: PCSTR(semantic.as_ptr() as *const u8),
                SemanticIndex: attribute.semantic_index,
                Format: match attribute.format {
                    VertexFormat::Float32x2 => DXGI_FORMAT_R32G32_FLOAT,
                    VertexFormat::Float32x3 => DXGI_FORMAT_R32G32B32_FLOAT,
                    VertexFormat::Float32x4 => DXGI_FORMAT_R32G32B32A32_FLOAT,
                },
                InputSlot: 0,
                AlignedByteOffset: attribute.offset,
                InputSlotClass: D3D12_INPUT_CLASSIFICATION_PER_VERTEX_DATA,
                InstanceDataStepRate: 0,
            })
            .collect();

        let vertex_shader = &desc.vertex_shader.bytecode;
        let pixel_shader = &desc.pixel_shader.bytecode;
        let blend_enabled = desc.blend == BlendMode::Alpha;
        let target_blend = D3D12_RENDER_TARGET_BLEND_DESC {
            BlendEnable: blend_enabled.into(),
            LogicOpEnable: false.into(),
            SrcBlend: if blend_enabled {
                D3D12_BLEND_SRC_ALPHA
            } else {
                D3D12_BLEND_ONE
            },
            DestBlend: if blend_enabled {
                D3D12_BLEND_INV_SRC_ALPHA
            } else {
                D3D12_BLEND_ZERO
            },
            BlendOp: D3D12_BLEND_OP_ADD,
            SrcBlendAlpha: D3D12_BLEND_ONE,
            DestBlendAlpha: D3D12_BLEND_ZERO,
            BlendOpAlpha: D3D12_BLEND_OP_ADD,
            LogicOp: D3D12_LOGIC_OP_NOOP,
            RenderTargetWriteMask: D3D12_COLOR_WRITE_ENABLE_ALL.0 as u8,
        };

        let mut pipeline_desc = D3D12_GRAPHICS_PIPELINE_STATE_DESC {
            pRootSignature: unsafe { std::mem::transmute_copy(root_signature) },
            VS: D3D12_SHADER_BYTECODE {
                pShaderBytecode: vertex_shader.as_ptr() as *const _,
                BytecodeLength: vertex_shader.len(),
            },
            PS: D3D12_SHADER_BYTECODE {
                pShaderBytecode: pixel_shader.as_ptr() as *const _,
                BytecodeLength: pixel_shader.len(),
            },
            InputLayout: D3D12_INPUT_LAYOUT_DESC {
                pInputElementDescs: input_elements.as_ptr(),
                NumElements: input_elements.len() as u32,
            },
            RasterizerState: D3D12_RASTERIZER_DESC {
                FillMode: match desc.rasterizer.fill {
                    FillMode::Solid => D3D12_FILL_MODE_SOLID,
                    FillMode::Wireframe => D3D12_FILL_MODE_WIREFRAME,
                },
                CullMode: match desc.rasterizer.cull {
                    CullMode::None => D3D12_CULL_MODE_NONE,
                    CullMode::Front => D3D12_CULL_MODE_FRONT,
                    CullMode::Back => D3D12_CULL_MODE_BACK,
                },
                DepthClipEnable: true.into(),
                ..Default::default()
            },
            BlendState: D3D12_BLEND_DESC {
                AlphaToCoverageEnable: false.into(),
                IndependentBlendEnable: false.into(),
                RenderTarget: [
                    target_blend,
                    D3D12_RENDER_TARGET_BLEND_DESC::default(),
                    D3D12_RENDER_TARGET_BLEND_DESC::default(),
                    D3D12_RENDER_TARGET_BLEND_DESC::default(),
                    D3D12_RENDER_TARGET_BLEND_DESC::default(),
                    D3D12_RENDER_TARGET_BLEND_DESC::default(),
                    D3D12_RENDER_TARGET_BLEND_DESC::default(),
                    D3D12_RENDER_TARGET_BLEND_DESC::default(),
                ],
            },
            DepthStencilState: D3D12_DEPTH_STENCIL_DESC {
                DepthEnable: desc.depth_test.into(),
                DepthWriteMask: if desc.depth_test {
                    D3D12_DEPTH_WRITE_MASK_ALL
                } else {
                    D3D12_DEPTH_WRITE_MASK_ZERO
                },
                DepthFunc: D3D12_COMPARISON_FUNC_GREATER,
                ..Default::default()
            },
            DSVFormat: if desc.depth_test {
                DXGI_FORMAT_D32_FLOAT
            } else {
                DXGI_FORMAT_UNKNOWN
            },
            SampleMask: u32::MAX,
            PrimitiveTopologyType: match desc.topology {
                PrimitiveTopology::TriangleList | PrimitiveTopology::TriangleStrip => {
                    D3D12_PRIMITIVE_TOPOLOGY_TYPE_TRIANGLE
                }
                PrimitiveTopology::LineList => D3D12_PRIMITIVE_TOPOLOGY_TYPE_LINE,
            },
            NumRenderTargets: 1,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            ..Default::default()
        };
        pipeline_desc.RTVFormats[0] = dxgi_format(desc.render_target_format);

        let pipeline = unsafe { self.device.CreateGraphicsPipelineState(&pipeline_desc) }
            .map_err(|err| RenderError::shader("pipeline", err.to_string()))?;
        Ok(pipeline)
    }

    pub fn create_fence(&self) -> RenderResult<Fence> {
        let fence = unsafe { self.device.CreateFence(0, D3D12_FENCE_FLAG_NONE) }?;
        Fence::new(fence)
    }

    /// Copies `data` into a CPU-visible buffer at `offset`.
    pub fn write_mapped(&self, resource: &Resource, offset: u64, data: &[u8]) -> RenderResult<()> {
        let mut mapped = MaybeUninit::uninit();
        unsafe {
            resource.resource().Map(0, None, Some(mapped.as_mut_ptr()))?;
            ptr::copy_nonoverlapping(
                data.as_ptr(),
                (mapped.assume_init() as *mut u8).add(offset as usize),
                data.len(),
            );
            resource.resource().Unmap(0, None);
        }
        Ok(())
    }

    pub fn read_mapped(&self, resource: &Resource, size: usize) -> RenderResult<Vec<u8>> {
        let mut mapped = MaybeUninit::uninit();
        let mut bytes = vec![0; size];
        unsafe {
            resource.resource().Map(0, None, Some(mapped.as_mut_ptr()))?;
            ptr::copy_nonoverlapping(mapped.assume_init() as *const u8, bytes.as_mut_ptr(), size);
            resource.resource().Unmap(0, None);
        }
        Ok(bytes)
    }
}

fn select_adapter(
    factory: &IDXGIFactory6,
    min_feature_level: FeatureLevel,
) -> RenderResult<(IDXGIAdapter1, String, FeatureLevel)> {
    for i in 0.. {
        let adapter: IDXGIAdapter1 =
            match unsafe { factory.EnumAdapterByGpuPreference(i, DXGI_GPU_PREFERENCE_HIGH_PERFORMANCE) } {
                Ok(adapter) => adapter,
                Err(_) => break,
            };

        let mut desc = Default::default();
        unsafe { adapter.GetDesc1(&mut desc) }
            .map_err(|err| RenderError::DeviceUnavailable(err.to_string()))?;
        if (DXGI_ADAPTER_FLAG(desc.Flags as i32) & DXGI_ADAPTER_FLAG_SOFTWARE)
            != DXGI_ADAPTER_FLAG_NONE
        {
            continue;
        }
        let name = String::from_utf16_lossy(&desc.Description)
            .trim_end_matches('\0')
            .to_owned();

        let supported = FEATURE_LEVELS
            .into_iter()
            .filter(|level| *level >= min_feature_level)
            .find(|level| unsafe {
                D3D12CreateDevice(
                    &adapter,
                    feature_level_to_d3d(*level),
                    std::ptr::null_mut::<Option<ID3D12Device>>(),
                )
            }
            .is_ok());
        if let Some(level) = supported {
            return Ok((adapter, name, level));
        }
    }

    Err(RenderError::DeviceUnavailable(format!(
        "no hardware adapter supports feature level {min_feature_level}"
    )))
}

fn register_message_callback(device: &ID3D12Device) -> Option<ID3D12InfoQueue1> {
    let info_queue: ID3D12InfoQueue1 = device.cast().ok()?;
    let mut cookie = 0;
    let registered = unsafe {
        info_queue.RegisterMessageCallback(
            Some(message_callback),
            D3D12_MESSAGE_CALLBACK_FLAG_NONE,
            ptr::null(),
            &mut cookie,
        )
    };
    match registered {
        Ok(()) => Some(info_queue),
        Err(err) => {
            warn!("debug layer messages unavailable: {}", err);
            None
        }
    }
}

fn shader_visibility(visibility: ShaderVisibility) -> D3D12_SHADER_VISIBILITY {
    match visibility {
        ShaderVisibility::All => D3D12_SHADER_VISIBILITY_ALL,
        ShaderVisibility::Vertex => D3D12_SHADER_VISIBILITY_VERTEX,
        ShaderVisibility::Pixel => D3D12_SHADER_VISIBILITY_PIXEL,
    }
}

unsafe fn blob_to_string(blob: &ID3DBlob) -> String {
    let bytes = std::slice::from_raw_parts(blob.GetBufferPointer() as *const u8, blob.GetBufferSize());
    String::from_utf8_lossy(bytes).trim_end_matches('\0').to_owned()
}

unsafe extern "system" fn message_callback(
    _category: D3D12_MESSAGE_CATEGORY,
    _severity: D3D12_MESSAGE_SEVERITY,
    _id: D3D12_MESSAGE_ID,
    description: PCSTR,
    _context: *mut c_void,
) {
    warn!("{}", description.display());
}
