use tracing::trace;

use crate::{
    error::{RenderError, RenderResult},
    id::{BufferId, PipelineId, ResourceId, TextureId},
    resource::{Barrier, ResourceState, TextureFootprint},
};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ScissorRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl ScissorRect {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            left: 0,
            top: 0,
            right: width as i32,
            bottom: height as i32,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PrimitiveTopology {
    TriangleList,
    TriangleStrip,
    LineList,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VertexBufferView {
    pub buffer: BufferId,
    pub size: u32,
    pub stride: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DrawArgs {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    SetPipeline(PipelineId),
    SetViewport(Viewport),
    SetScissor(ScissorRect),
    Barrier(Barrier),
    SetRenderTarget { image: usize },
    ClearRenderTarget { image: usize, color: [f32; 4] },
    SetPrimitiveTopology(PrimitiveTopology),
    SetVertexBuffer { slot: u32, view: VertexBufferView },
    SetTexture { table: u32, texture: TextureId },
    Draw(DrawArgs),
    CopyBuffer {
        src: BufferId,
        dst: BufferId,
        size: u64,
    },
    CopyBufferToTexture {
        src: BufferId,
        dst: TextureId,
        footprint: TextureFootprint,
    },
}

/// A closed recording, ready for submission.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommandList {
    commands: Vec<Command>,
}

impl CommandList {
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn barriers(&self) -> impl Iterator<Item = &Barrier> + '_ {
        self.commands.iter().filter_map(|command| match command {
            Command::Barrier(barrier) => Some(barrier),
            _ => None,
        })
    }
}

pub struct CommandEncoder {
    commands: Vec<Command>,
    open: bool,
}

impl Default for CommandEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandEncoder {
    pub fn new() -> Self {
        Self {
            commands: Vec::new(),
            open: false,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.open
    }

    /// Reopens the encoder. The caller is responsible for having reset the
    /// allocator backing this recording first.
    pub fn reset(&mut self) {
        self.commands.clear();
        self.open = true;
    }

    fn push(&mut self, command: Command) -> RenderResult<()> {
        if !self.open {
            return Err(RenderError::EncoderClosed);
        }
        self.commands.push(command);
        Ok(())
    }

    pub fn set_pipeline(&mut self, pipeline: PipelineId) -> RenderResult<()> {
        self.push(Command::SetPipeline(pipeline))
    }

    pub fn set_viewport(&mut self, width: u32, height: u32) -> RenderResult<()> {
        self.push(Command::SetViewport(Viewport::full(width, height)))
    }

    pub fn set_scissor(&mut self, width: u32, height: u32) -> RenderResult<()> {
        self.push(Command::SetScissor(ScissorRect::full(width, height)))
    }

    pub fn transition(
        &mut self,
        resource: impl Into<ResourceId>,
        before: ResourceState,
        after: ResourceState,
    ) -> RenderResult<()> {
        self.push(Command::Barrier(Barrier {
            resource: resource.into(),
            before,
            after,
        }))
    }

    pub fn transition_image(
        &mut self,
        image: usize,
        before: ResourceState,
        after: ResourceState,
    ) -> RenderResult<()> {
        self.transition(ResourceId::Backbuffer(image), before, after)
    }

    pub fn set_render_target(&mut self, image: usize) -> RenderResult<()> {
        self.push(Command::SetRenderTarget { image })
    }

    pub fn clear_render_target(&mut self, image: usize, color: &[f32; 4]) -> RenderResult<()> {
        self.push(Command::ClearRenderTarget {
            image,
            color: *color,
        })
    }

    pub fn set_primitive_topology(&mut self, topology: PrimitiveTopology) -> RenderResult<()> {
        self.push(Command::SetPrimitiveTopology(topology))
    }

    pub fn set_vertex_buffer(&mut self, slot: u32, view: VertexBufferView) -> RenderResult<()> {
        self.push(Command::SetVertexBuffer { slot, view })
    }

    pub fn set_texture(&mut self, table: u32, texture: TextureId) -> RenderResult<()> {
        self.push(Command::SetTexture { table, texture })
    }

    /// Empty draws are legal and never reach the queue.
    pub fn draw_instanced(&mut self, args: DrawArgs) -> RenderResult<()> {
        if !self.open {
            return Err(RenderError::EncoderClosed);
        }
        if args.vertex_count == 0 || args.instance_count == 0 {
            trace!("dropping empty draw {:?}", args);
            return Ok(());
        }
        self.push(Command::Draw(args))
    }

    pub fn copy_buffer(&mut self, src: BufferId, dst: BufferId, size: u64) -> RenderResult<()> {
        self.push(Command::CopyBuffer { src, dst, size })
    }

    pub fn copy_buffer_to_texture(
        &mut self,
        src: BufferId,
        dst: TextureId,
        footprint: TextureFootprint,
    ) -> RenderResult<()> {
        self.push(Command::CopyBufferToTexture {
            src,
            dst,
            footprint,
        })
    }

    pub fn finish(&mut self) -> RenderResult<CommandList> {
        if !self.open {
            return Err(RenderError::EncoderClosed);
        }
        self.open = false;
        Ok(CommandList {
            commands: std::mem::take(&mut self.commands),
        })
    }
}
