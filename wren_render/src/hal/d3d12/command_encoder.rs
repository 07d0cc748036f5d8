use std::mem::ManuallyDrop;

use windows::{
    core::ComInterface,
    Win32::{
        Foundation::RECT,
        Graphics::{Direct3D::*, Direct3D12::*},
    },
};

use super::{dxgi_format, resource_state, Resources};
use crate::{
    command_encoder::{Command, CommandList, PrimitiveTopology, ScissorRect, Viewport},
    error::RenderResult,
    resource::{Barrier, TextureFootprint},
};

/// One command allocator and the graphics list recorded from it.
pub struct NativeEncoder {
    allocator: ID3D12CommandAllocator,
    list: ID3D12GraphicsCommandList,
}

impl NativeEncoder {
    pub fn new(allocator: ID3D12CommandAllocator, list: ID3D12GraphicsCommandList) -> Self {
        Self { allocator, list }
    }

    pub fn reset_allocator(&self) -> RenderResult<()> {
        unsafe { self.allocator.Reset() }?;
        Ok(())
    }

    /// Opens the list for direct native recording on a freshly reset
    /// allocator.
    pub fn begin(&self) -> RenderResult<&ID3D12GraphicsCommandList> {
        unsafe {
            self.allocator.Reset()?;
            self.list.Reset(&self.allocator, None)?;
        }
        Ok(&self.list)
    }

    pub fn finish(&self) -> RenderResult<ID3D12CommandList> {
        unsafe {
            self.list.Close()?;
        }
        Ok(self.list.cast()?)
    }

    /// Replays a recorded list onto the native command list and closes it.
    pub fn encode(
        &self,
        commands: &CommandList,
        resources: &mut Resources,
    ) -> RenderResult<ID3D12CommandList> {
        unsafe {
            self.list.Reset(&self.allocator, None)?;
            self.list.SetDescriptorHeaps(&[Some(resources.shader_heap())]);
        }

        for command in commands.commands() {
            match command {
                Command::SetPipeline(id) => {
                    let (root_signature, pipeline) = resources.pipeline(*id)?;
                    unsafe {
                        self.list.SetGraphicsRootSignature(root_signature);
                        self.list.SetPipelineState(pipeline);
                    }
                }
                Command::SetViewport(viewport) => self.set_viewport(viewport),
                Command::SetScissor(scissor) => self.set_scissor(scissor),
                Command::Barrier(barrier) => {
                    self.transition(resources, barrier)?;
                    resources.set_state(barrier.resource, barrier.after);
                }
                Command::SetRenderTarget { image } => {
                    let render_target = resources.render_target(*image)?;
                    unsafe {
                        self.list
                            .OMSetRenderTargets(1, Some(&render_target), false, None);
                    }
                }
                Command::ClearRenderTarget { image, color } => {
                    let render_target = resources.render_target(*image)?;
                    unsafe {
                        self.list.ClearRenderTargetView(render_target, color, None);
                    }
                }
                Command::SetPrimitiveTopology(topology) => unsafe {
                    self.list.IASetPrimitiveTopology(primitive_topology(*topology));
                },
                Command::SetVertexBuffer { slot, view } => {
                    let buffer = resources.buffer(view.buffer)?;
                    let native_view = D3D12_VERTEX_BUFFER_VIEW {
                        BufferLocation: unsafe { buffer.GetGPUVirtualAddress() },
                        SizeInBytes: view.size,
                        StrideInBytes: view.stride,
                    };
                    unsafe {
                        self.list.IASetVertexBuffers(*slot, Some(&[native_view]));
                    }
                }
                Command::SetTexture { table, texture } => {
                    let handle = resources.texture_descriptor(*texture)?;
                    unsafe {
                        self.list.SetGraphicsRootDescriptorTable(*table, handle);
                    }
                }
                Command::Draw(args) => unsafe {
                    self.list.DrawInstanced(
                        args.vertex_count,
                        args.instance_count,
                        args.first_vertex,
                        args.first_instance,
                    );
                },
                Command::CopyBuffer { src, dst, size } => {
                    let src = resources.buffer(*src)?;
                    let dst = resources.buffer(*dst)?;
                    unsafe {
                        self.list.CopyBufferRegion(dst, 0, src, 0, *size);
                    }
                }
                Command::CopyBufferToTexture {
                    src,
                    dst,
                    footprint,
                } => {
                    let src = resources.buffer(*src)?;
                    let dst = resources.texture(*dst)?;
                    self.copy_buffer_to_texture(src, dst, footprint);
                }
            }
        }

        self.finish()
    }

    fn set_viewport(&self, viewport: &Viewport) {
        let view = D3D12_VIEWPORT {
            TopLeftX: viewport.x,
            TopLeftY: viewport.y,
            Width: viewport.width,
            Height: viewport.height,
            MinDepth: viewport.min_depth,
            MaxDepth: viewport.max_depth,
        };
        unsafe {
            self.list.RSSetViewports(&[view]);
        }
    }

    fn set_scissor(&self, scissor: &ScissorRect) {
        let rect = RECT {
            left: scissor.left,
            top: scissor.top,
            right: scissor.right,
            bottom: scissor.bottom,
        };
        unsafe {
            self.list.RSSetScissorRects(&[rect]);
        }
    }

    fn transition(&self, resources: &Resources, barrier: &Barrier) -> RenderResult<()> {
        transition_raw(
            &self.list,
            resources.resource(barrier.resource)?,
            resource_state(barrier.before),
            resource_state(barrier.after),
        );
        Ok(())
    }

    fn copy_buffer_to_texture(
        &self,
        src: &ID3D12Resource,
        dst: &ID3D12Resource,
        footprint: &TextureFootprint,
    ) {
        copy_region(&self.list, src, dst, footprint, CopyDirection::BufferToTexture);
    }
}

pub fn transition_raw(
    list: &ID3D12GraphicsCommandList,
    resource: &ID3D12Resource,
    state_before: D3D12_RESOURCE_STATES,
    state_after: D3D12_RESOURCE_STATES,
) {
    let barrier = D3D12_RESOURCE_BARRIER {
        Type: D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
        Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
        Anonymous: D3D12_RESOURCE_BARRIER_0 {
            Transition: ManuallyDrop::new(D3D12_RESOURCE_TRANSITION_BARRIER {
                pResource: unsafe { std::mem::transmute_copy(resource) },
                StateBefore: state_before,
                StateAfter: state_after,
                Subresource: D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
            }),
        },
    };
    unsafe {
        list.ResourceBarrier(&[barrier]);
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CopyDirection {
    BufferToTexture,
    TextureToBuffer,
}

/// Copies between a texture and a buffer laid out with a placed footprint.
pub fn copy_region(
    list: &ID3D12GraphicsCommandList,
    buffer: &ID3D12Resource,
    texture: &ID3D12Resource,
    footprint: &TextureFootprint,
    direction: CopyDirection,
) {
    let buffer_location = D3D12_TEXTURE_COPY_LOCATION {
        pResource: unsafe { std::mem::transmute_copy(buffer) },
        Type: D3D12_TEXTURE_COPY_TYPE_PLACED_FOOTPRINT,
        Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
            PlacedFootprint: D3D12_PLACED_SUBRESOURCE_FOOTPRINT {
                Offset: footprint.offset,
                Footprint: D3D12_SUBRESOURCE_FOOTPRINT {
                    Format: dxgi_format(footprint.format),
                    Width: footprint.width,
                    Height: footprint.height,
                    Depth: 1,
                    RowPitch: footprint.row_pitch,
                },
            },
        },
    };
    let texture_location = D3D12_TEXTURE_COPY_LOCATION {
        pResource: unsafe { std::mem::transmute_copy(texture) },
        Type: D3D12_TEXTURE_COPY_TYPE_SUBRESOURCE_INDEX,
        Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
            SubresourceIndex: 0,
        },
    };
    unsafe {
        match direction {
            CopyDirection::BufferToTexture => {
                list.CopyTextureRegion(&texture_location, 0, 0, 0, &buffer_location, None)
            }
            CopyDirection::TextureToBuffer => {
                list.CopyTextureRegion(&buffer_location, 0, 0, 0, &texture_location, None)
            }
        }
    }
}

fn primitive_topology(topology: PrimitiveTopology) -> D3D_PRIMITIVE_TOPOLOGY {
    match topology {
        PrimitiveTopology::TriangleList => D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST,
        PrimitiveTopology::TriangleStrip => D3D_PRIMITIVE_TOPOLOGY_TRIANGLESTRIP,
        PrimitiveTopology::LineList => D3D_PRIMITIVE_TOPOLOGY_LINELIST,
    }
}
