use std::time::Duration;

use tracing::trace;

use crate::{
    device::DeviceContext,
    error::{RenderError, RenderResult},
    hal::Gpu,
};

/// CPU side of the queue fence. Hands out strictly increasing values and
/// remembers the highest one it has waited for.
#[derive(Debug)]
pub struct FrameFence {
    last_signaled: u64,
    last_waited: u64,
    timeout: Option<Duration>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FenceAudit {
    pub last_signaled: u64,
    pub last_waited: u64,
}

impl FenceAudit {
    /// True once every signaled value has been waited for.
    pub fn is_drained(&self) -> bool {
        self.last_waited >= self.last_signaled
    }
}

impl FrameFence {
    /// Continues after the highest value already scheduled on the device,
    /// including signals an earlier fence left pending, so a fence created
    /// for a later renderer cycle never signals backwards.
    pub fn new<G: Gpu>(device: &DeviceContext<G>, timeout: Option<Duration>) -> Self {
        let gpu = device.gpu();
        Self {
            last_signaled: gpu.last_signaled().max(gpu.completed_value()),
            last_waited: gpu.completed_value(),
            timeout,
        }
    }

    pub fn last_signaled(&self) -> u64 {
        self.last_signaled
    }

    pub fn signal<G: Gpu>(&mut self, device: &mut DeviceContext<G>) -> RenderResult<u64> {
        let value = self.last_signaled + 1;
        device.gpu_mut().signal(value)?;
        self.last_signaled = value;
        trace!("signaled fence value {}", value);
        Ok(value)
    }

    pub fn completed_value<G: Gpu>(&self, device: &DeviceContext<G>) -> u64 {
        device.gpu().completed_value()
    }

    pub fn is_retired<G: Gpu>(&self, device: &DeviceContext<G>, value: u64) -> bool {
        self.completed_value(device) >= value
    }

    pub fn wait_until<G: Gpu>(&mut self, device: &DeviceContext<G>, value: u64) -> RenderResult<()> {
        if value > self.last_signaled {
            return Err(RenderError::FenceNotScheduled {
                requested: value,
                last_signaled: self.last_signaled,
            });
        }
        if !self.is_retired(device, value) {
            device.gpu().wait_for_value(value, self.timeout)?;
        }
        self.last_waited = self.last_waited.max(value);
        Ok(())
    }

    /// Signals a fresh value and blocks until the queue reaches it.
    pub fn drain<G: Gpu>(&mut self, device: &mut DeviceContext<G>) -> RenderResult<u64> {
        let value = self.signal(device)?;
        self.wait_until(device, value)?;
        Ok(value)
    }

    pub fn audit(&self) -> FenceAudit {
        FenceAudit {
            last_signaled: self.last_signaled,
            last_waited: self.last_waited,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{
        headless::{HeadlessDesc, HeadlessGpu},
        DeviceDesc,
    };

    fn device() -> DeviceContext<HeadlessGpu> {
        DeviceContext::new(HeadlessGpu::new(HeadlessDesc::default()), &DeviceDesc::default())
            .unwrap()
    }

    #[test]
    fn waiting_past_the_last_signal_is_refused() {
        let mut device = device();
        let mut fence = FrameFence::new(&device, None);
        let value = fence.signal(&mut device).unwrap();
        assert!(matches!(
            fence.wait_until(&device, value + 1),
            Err(RenderError::FenceNotScheduled {
                requested: 2,
                last_signaled: 1
            })
        ));
        fence.wait_until(&device, value).unwrap();
        assert!(fence.audit().is_drained());
    }

    #[test]
    fn waiting_on_a_retired_value_returns_immediately() {
        let mut device = device();
        let mut fence = FrameFence::new(&device, None);
        fence.drain(&mut device).unwrap();
        device.gpu().probe().stall();
        fence.wait_until(&device, 1).unwrap();
        device.gpu().probe().resume();
    }

    #[test]
    fn a_new_fence_resumes_from_the_completed_value() {
        let mut device = device();
        let mut fence = FrameFence::new(&device, None);
        fence.drain(&mut device).unwrap();
        fence.drain(&mut device).unwrap();

        let mut next = FrameFence::new(&device, None);
        assert_eq!(next.last_signaled(), 2);
        assert_eq!(next.signal(&mut device).unwrap(), 3);
    }

    #[test]
    fn a_new_fence_continues_after_pending_signals() {
        let mut device = device();
        let mut fence = FrameFence::new(&device, None);
        device.gpu().probe().stall();
        fence.signal(&mut device).unwrap();
        fence.signal(&mut device).unwrap();
        assert_eq!(fence.completed_value(&device), 0);

        let mut next = FrameFence::new(&device, None);
        assert_eq!(next.last_signaled(), 2);
        assert!(!next.audit().is_drained());
        let value = next.signal(&mut device).unwrap();
        assert_eq!(value, 3);

        device.gpu().probe().resume();
        next.wait_until(&device, value).unwrap();
        assert!(device.gpu().probe().violations().is_empty());
    }

    #[test]
    fn stalled_queue_times_out() {
        let mut device = device();
        let mut fence = FrameFence::new(&device, Some(Duration::from_millis(20)));
        device.gpu().probe().stall();
        let value = fence.signal(&mut device).unwrap();
        assert!(matches!(
            fence.wait_until(&device, value),
            Err(RenderError::SyncTimeout { value: 1, completed: 0 })
        ));
        assert!(!fence.audit().is_drained());

        device.gpu().probe().resume();
        fence.wait_until(&device, value).unwrap();
    }
}
