use std::time::Duration;

use windows::Win32::{
    Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT},
    Graphics::Direct3D12::{ID3D12CommandList, ID3D12CommandQueue, ID3D12Fence},
    System::Threading::{CreateEventA, WaitForSingleObject, INFINITE},
};

use crate::error::{RenderError, RenderResult};

pub struct Queue {
    queue: ID3D12CommandQueue,
}

impl Queue {
    pub fn new(queue: ID3D12CommandQueue) -> Self {
        Self { queue }
    }

    pub fn get(&self) -> &ID3D12CommandQueue {
        &self.queue
    }

    pub fn execute_command_lists(&self, list: &[Option<ID3D12CommandList>]) {
        unsafe {
            self.queue.ExecuteCommandLists(list);
        }
    }

    pub fn signal(&self, fence: &Fence, value: u64) -> RenderResult<()> {
        unsafe { self.queue.Signal(&fence.fence, value) }?;
        Ok(())
    }
}

/// A native fence paired with the event its waits block on.
pub struct Fence {
    fence: ID3D12Fence,
    event: HANDLE,
}

impl Fence {
    pub fn new(fence: ID3D12Fence) -> RenderResult<Self> {
        let event = unsafe { CreateEventA(None, false, false, None) }?;
        Ok(Self { fence, event })
    }

    pub fn completed_value(&self) -> u64 {
        unsafe { self.fence.GetCompletedValue() }
    }

    pub fn wait(&self, value: u64, timeout: Option<Duration>) -> RenderResult<()> {
        if self.completed_value() >= value {
            return Ok(());
        }

        unsafe { self.fence.SetEventOnCompletion(value, self.event) }?;
        let millis = timeout.map_or(INFINITE, |timeout| {
            timeout.as_millis().min(u128::from(INFINITE - 1)) as u32
        });
        match unsafe { WaitForSingleObject(self.event, millis) } {
            WAIT_OBJECT_0 => Ok(()),
            WAIT_TIMEOUT => Err(RenderError::SyncTimeout {
                value,
                completed: self.completed_value(),
            }),
            other => Err(RenderError::Backend(format!(
                "waiting for fence value {value} failed with {:#x}",
                other.0
            ))),
        }
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.event);
        }
    }
}
