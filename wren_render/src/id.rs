use std::fmt;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct BufferId(pub usize);

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TextureId(pub usize);

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct PipelineId(pub usize);

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct AllocatorId(pub usize);

/// Anything a barrier can target. Backbuffers are addressed by ring index
/// since the swap chain owns their storage.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ResourceId {
    Buffer(BufferId),
    Texture(TextureId),
    Backbuffer(usize),
}

impl From<BufferId> for ResourceId {
    fn from(id: BufferId) -> Self {
        Self::Buffer(id)
    }
}

impl From<TextureId> for ResourceId {
    fn from(id: TextureId) -> Self {
        Self::Texture(id)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buffer(id) => write!(f, "buffer #{}", id.0),
            Self::Texture(id) => write!(f, "texture #{}", id.0),
            Self::Backbuffer(index) => write!(f, "backbuffer #{index}"),
        }
    }
}
