use thiserror::Error;

use crate::frame::FrameState;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("no GPU adapter available: {0}")]
    DeviceUnavailable(String),

    #[error("surface creation failed: {0}")]
    SurfaceCreationFailed(String),

    #[error("shader compilation failed ({stage}): {message}")]
    ShaderCompilationError { stage: &'static str, message: String },

    #[error("invalid binding layout: {0}")]
    InvalidBindingLayout(String),

    #[error("resource upload failed: {0}")]
    ResourceUploadFailed(String),

    #[error("present failed: {0}")]
    PresentFailed(String),

    #[error("timed out waiting for fence value {value} (completed {completed})")]
    SyncTimeout { value: u64, completed: u64 },

    #[error("fence value {requested} was never scheduled (last signaled {last_signaled})")]
    FenceNotScheduled { requested: u64, last_signaled: u64 },

    #[error("command allocator #{allocator} reset while the GPU still executes its commands")]
    AllocatorBusy { allocator: usize },

    #[error("invalid frame transition {from:?} -> {to:?}")]
    InvalidFrameState { from: FrameState, to: FrameState },

    #[error("command encoder is closed")]
    EncoderClosed,

    #[error("renderer is not initialized")]
    NotInitialized,

    #[error("unknown resource {0}")]
    UnknownResource(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl RenderError {
    pub fn shader(stage: &'static str, message: impl Into<String>) -> Self {
        Self::ShaderCompilationError {
            stage,
            message: message.into(),
        }
    }

    /// Every error is fatal in the lockstep baseline: there is no partial
    /// initialization recovery and no frame-skip logic.
    pub fn is_fatal(&self) -> bool {
        true
    }
}

pub type RenderResult<T> = Result<T, RenderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_failure() {
        let err = RenderError::SyncTimeout {
            value: 7,
            completed: 5,
        };
        assert_eq!(
            err.to_string(),
            "timed out waiting for fence value 7 (completed 5)"
        );

        let err = RenderError::shader("vertex", "empty bytecode");
        assert_eq!(
            err.to_string(),
            "shader compilation failed (vertex): empty bytecode"
        );
        assert!(err.is_fatal());
    }
}
