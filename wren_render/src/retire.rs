use std::collections::VecDeque;

use tracing::trace;

use crate::{device::DeviceContext, hal::Gpu, id::ResourceId};

/// GPU objects whose handles the CPU has already let go of, each waiting
/// for the fence value of the last submission that reads it.
#[derive(Debug, Default)]
pub struct RetirementQueue {
    pending: VecDeque<(u64, ResourceId)>,
}

impl RetirementQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, token: u64, resource: impl Into<ResourceId>) {
        self.pending.push_back((token, resource.into()));
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Destroys every entry whose token is `<= completed` and returns how
    /// many were released.
    pub fn collect<G: Gpu>(&mut self, device: &mut DeviceContext<G>, completed: u64) -> usize {
        let before = self.pending.len();
        self.pending.retain(|&(token, resource)| {
            if token > completed {
                return true;
            }
            match resource {
                ResourceId::Buffer(id) => device.gpu_mut().destroy_buffer(id),
                ResourceId::Texture(id) => device.gpu_mut().destroy_texture(id),
                // Swap chain images are never retired individually.
                ResourceId::Backbuffer(_) => {}
            }
            false
        });
        let released = before - self.pending.len();
        if released > 0 {
            trace!("retired {} resources at fence value {}", released, completed);
        }
        released
    }
}
