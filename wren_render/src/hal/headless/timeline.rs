use std::{collections::VecDeque, sync::Arc, thread, time::Duration};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{
    command_encoder::{Command, CommandList, DrawArgs, VertexBufferView},
    id::{BufferId, PipelineId, ResourceId, TextureId},
    resource::{Barrier, BufferDesc, ResourceState, TextureDesc, TextureFootprint, TextureFormat},
};

/// Something the reference device saw that a real driver would turn into
/// corruption, a device removal, or a debug-layer error.
#[derive(Clone, Debug, PartialEq)]
pub enum Violation {
    UseAfterFree {
        resource: ResourceId,
    },
    BarrierMismatch {
        resource: ResourceId,
        before: ResourceState,
        actual: ResourceState,
    },
    WrongState {
        resource: ResourceId,
        required: ResourceState,
        actual: ResourceState,
    },
    DestroyedPipeline(PipelineId),
    MissingBinding(&'static str),
    StrideMismatch {
        pipeline: u32,
        view: u32,
    },
    OutOfBounds {
        resource: ResourceId,
    },
    PresentNotPresentable {
        image: usize,
        state: ResourceState,
    },
    NonMonotonicSignal {
        value: u64,
        completed: u64,
    },
}

pub(super) enum Work {
    Execute { batch: u64, list: CommandList },
    Signal(u64),
    Present { image: usize },
}

pub(super) struct BufferMemory {
    pub desc: BufferDesc,
    pub bytes: Vec<u8>,
    pub state: ResourceState,
    pub destroyed: bool,
}

pub(super) struct TextureMemory {
    pub desc: TextureDesc,
    pub bytes: Vec<u8>,
    pub state: ResourceState,
    pub destroyed: bool,
}

pub(super) struct Image {
    pub bytes: Vec<u8>,
    pub state: ResourceState,
}

pub(super) struct PipelineRecord {
    pub stride: u32,
    /// Root parameter indices that must have a texture bound.
    pub texture_tables: Vec<u32>,
    pub destroyed: bool,
}

#[derive(Default)]
pub(super) struct Timeline {
    pub queue: VecDeque<Work>,
    pub busy: bool,
    pub completed_value: u64,
    pub completed_batch: u64,

    pub buffers: Vec<BufferMemory>,
    pub textures: Vec<TextureMemory>,
    pub pipelines: Vec<PipelineRecord>,
    pub images: Vec<Image>,
    pub image_width: u32,
    pub image_format: Option<TextureFormat>,

    pub queue_created: bool,
    pub stalled: bool,
    pub surface_lost: bool,
    pub signals_refused: bool,
    pub shutdown: bool,

    pub violations: Vec<Violation>,
    pub presents: u64,
    pub draws: u64,
    pub executed_lists: u64,
}

pub(super) struct Shared {
    pub state: Mutex<Timeline>,
    pub work_ready: Condvar,
    pub progress: Condvar,
}

impl Shared {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Timeline::default()),
            work_ready: Condvar::new(),
            progress: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Timeline> {
        self.state.lock()
    }

    pub fn enqueue(&self, work: Work) {
        self.state.lock().queue.push_back(work);
        self.work_ready.notify_one();
    }
}

/// The GPU side of the reference device: pops work in submission order and
/// executes it against CPU memory.
pub(super) fn run(shared: Arc<Shared>, delay: Duration) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            break;
        }
        if state.stalled || state.queue.is_empty() {
            shared.work_ready.wait(&mut state);
            continue;
        }
        let Some(work) = state.queue.pop_front() else {
            continue;
        };
        state.busy = true;
        if !delay.is_zero() {
            MutexGuard::unlocked(&mut state, || thread::sleep(delay));
        }
        state.run(work);
        state.busy = false;
        shared.progress.notify_all();
    }
}

#[derive(Default)]
struct Bindings {
    pipeline: Option<PipelineId>,
    target: Option<usize>,
    vertex_buffers: Vec<(u32, VertexBufferView)>,
    textures: Vec<(u32, TextureId)>,
}

impl Timeline {
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && !self.busy
    }

    pub fn is_live(&self, resource: ResourceId) -> bool {
        match resource {
            ResourceId::Buffer(id) => self.buffers.get(id.0).is_some_and(|b| !b.destroyed),
            ResourceId::Texture(id) => self.textures.get(id.0).is_some_and(|t| !t.destroyed),
            ResourceId::Backbuffer(index) => index < self.images.len(),
        }
    }

    fn state_of(&self, resource: ResourceId) -> ResourceState {
        match resource {
            ResourceId::Buffer(id) => self.buffers[id.0].state,
            ResourceId::Texture(id) => self.textures[id.0].state,
            ResourceId::Backbuffer(index) => self.images[index].state,
        }
    }

    fn set_state(&mut self, resource: ResourceId, state: ResourceState) {
        match resource {
            ResourceId::Buffer(id) => self.buffers[id.0].state = state,
            ResourceId::Texture(id) => self.textures[id.0].state = state,
            ResourceId::Backbuffer(index) => self.images[index].state = state,
        }
    }

    fn live(&mut self, resource: ResourceId) -> bool {
        let live = self.is_live(resource);
        if !live {
            self.violations.push(Violation::UseAfterFree { resource });
        }
        live
    }

    fn require(&mut self, resource: impl Into<ResourceId>, required: ResourceState) -> bool {
        let resource = resource.into();
        if !self.live(resource) {
            return false;
        }
        let actual = self.state_of(resource);
        if actual != required {
            self.violations.push(Violation::WrongState {
                resource,
                required,
                actual,
            });
            return false;
        }
        true
    }

    fn run(&mut self, work: Work) {
        match work {
            Work::Execute { batch, list } => {
                self.execute(&list);
                self.completed_batch = self.completed_batch.max(batch);
                self.executed_lists += 1;
            }
            Work::Signal(value) => {
                if value < self.completed_value {
                    self.violations.push(Violation::NonMonotonicSignal {
                        value,
                        completed: self.completed_value,
                    });
                } else {
                    self.completed_value = value;
                }
            }
            Work::Present { image } => {
                let resource = ResourceId::Backbuffer(image);
                if self.live(resource) {
                    let state = self.state_of(resource);
                    if state != ResourceState::PresentSource {
                        self.violations
                            .push(Violation::PresentNotPresentable { image, state });
                    }
                    self.presents += 1;
                }
            }
        }
    }

    fn execute(&mut self, list: &CommandList) {
        let mut bound = Bindings::default();
        for command in list.commands() {
            match command {
                Command::SetPipeline(id) => {
                    if self.pipelines.get(id.0).map_or(true, |p| p.destroyed) {
                        self.violations.push(Violation::DestroyedPipeline(*id));
                    }
                    bound.pipeline = Some(*id);
                }
                Command::SetViewport(_)
                | Command::SetScissor(_)
                | Command::SetPrimitiveTopology(_) => {}
                Command::Barrier(barrier) => self.barrier(barrier),
                Command::SetRenderTarget { image } => {
                    self.require(ResourceId::Backbuffer(*image), ResourceState::RenderTarget);
                    bound.target = Some(*image);
                }
                Command::ClearRenderTarget { image, color } => self.clear(*image, color),
                Command::SetVertexBuffer { slot, view } => {
                    bound.vertex_buffers.retain(|(s, _)| s != slot);
                    bound.vertex_buffers.push((*slot, *view));
                }
                Command::SetTexture { table, texture } => {
                    bound.textures.retain(|(t, _)| t != table);
                    bound.textures.push((*table, *texture));
                }
                Command::Draw(args) => self.draw(&bound, args),
                Command::CopyBuffer { src, dst, size } => self.copy_buffer(*src, *dst, *size),
                Command::CopyBufferToTexture {
                    src,
                    dst,
                    footprint,
                } => self.copy_buffer_to_texture(*src, *dst, footprint),
            }
        }
    }

    fn barrier(&mut self, barrier: &Barrier) {
        if !self.live(barrier.resource) {
            return;
        }
        let actual = self.state_of(barrier.resource);
        if actual != barrier.before {
            self.violations.push(Violation::BarrierMismatch {
                resource: barrier.resource,
                before: barrier.before,
                actual,
            });
        }
        self.set_state(barrier.resource, barrier.after);
    }

    fn clear(&mut self, image: usize, color: &[f32; 4]) {
        if !self.require(ResourceId::Backbuffer(image), ResourceState::RenderTarget) {
            return;
        }
        let [r, g, b, a] = color.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8);
        let texel = match self.image_format {
            Some(TextureFormat::Bgra8Unorm) => [b, g, r, a],
            _ => [r, g, b, a],
        };
        for chunk in self.images[image].bytes.chunks_exact_mut(4) {
            chunk.copy_from_slice(&texel);
        }
    }

    fn draw(&mut self, bound: &Bindings, args: &DrawArgs) {
        let Some(pipeline) = bound.pipeline else {
            self.violations.push(Violation::MissingBinding("pipeline"));
            return;
        };
        let Some(target) = bound.target else {
            self.violations.push(Violation::MissingBinding("render target"));
            return;
        };
        self.require(ResourceId::Backbuffer(target), ResourceState::RenderTarget);

        let Some(record) = self.pipelines.get(pipeline.0).filter(|p| !p.destroyed) else {
            return;
        };
        let stride = record.stride;
        let tables = record.texture_tables.clone();

        match bound.vertex_buffers.iter().find(|(slot, _)| *slot == 0) {
            Some((_, view)) => self.check_vertex_buffer(view, stride, args),
            None => self.violations.push(Violation::MissingBinding("vertex buffer")),
        }
        for table in tables {
            match bound.textures.iter().find(|(t, _)| *t == table) {
                Some((_, texture)) => {
                    self.require(*texture, ResourceState::ShaderResource);
                }
                None => self.violations.push(Violation::MissingBinding("texture")),
            }
        }
        self.draws += 1;
    }

    fn check_vertex_buffer(&mut self, view: &VertexBufferView, stride: u32, args: &DrawArgs) {
        if !self.require(view.buffer, ResourceState::GenericRead) {
            return;
        }
        if view.stride != stride {
            self.violations.push(Violation::StrideMismatch {
                pipeline: stride,
                view: view.stride,
            });
        }
        let read_end = (args.first_vertex as u64 + args.vertex_count as u64) * view.stride as u64;
        if view.size as u64 > self.buffers[view.buffer.0].desc.size || read_end > view.size as u64 {
            self.violations.push(Violation::OutOfBounds {
                resource: view.buffer.into(),
            });
        }
    }

    fn copy_buffer(&mut self, src: BufferId, dst: BufferId, size: u64) {
        let readable = self.require(src, ResourceState::GenericRead);
        let writable = self.require(dst, ResourceState::CopyDestination);
        if !(readable && writable) {
            return;
        }
        let size = size as usize;
        if size > self.buffers[src.0].bytes.len() || size > self.buffers[dst.0].bytes.len() {
            self.violations.push(Violation::OutOfBounds {
                resource: dst.into(),
            });
            return;
        }
        let bytes = self.buffers[src.0].bytes[..size].to_vec();
        self.buffers[dst.0].bytes[..size].copy_from_slice(&bytes);
    }

    fn copy_buffer_to_texture(&mut self, src: BufferId, dst: TextureId, footprint: &TextureFootprint) {
        let readable = self.require(src, ResourceState::GenericRead);
        let writable = self.require(dst, ResourceState::CopyDestination);
        if !(readable && writable) {
            return;
        }
        let desc = &self.textures[dst.0].desc;
        let matches = desc.width == footprint.width
            && desc.height == footprint.height
            && desc.format == footprint.format;
        if !matches || footprint.required_size() > self.buffers[src.0].bytes.len() as u64 {
            self.violations.push(Violation::OutOfBounds {
                resource: dst.into(),
            });
            return;
        }

        let row = footprint.tight_row_size() as usize;
        let pitch = footprint.row_pitch as usize;
        let offset = footprint.offset as usize;
        let source = &self.buffers[src.0].bytes;
        let target = &mut self.textures[dst.0].bytes;
        for (y, dst_row) in target.chunks_exact_mut(row).enumerate() {
            let start = offset + y * pitch;
            dst_row.copy_from_slice(&source[start..start + row]);
        }
    }
}
