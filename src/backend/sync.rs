// Synchronization primitives
//
// Timeline semaphore: one monotonically increasing 64-bit counter that both
// the host and the queues can signal and wait on. One per ring slot gates
// the reuse of that slot's resources.

use super::GpuDevice;
use crate::error::{Error, Result};
use ash::vk;
use std::sync::Arc;
use std::time::Duration;

/// Host-side handle to a timeline semaphore.
///
/// Holds no state besides the native handle, so every method takes `&self`
/// and may be called from any thread. Ordering comes from the counter itself.
pub struct TimelineSemaphore<D: GpuDevice> {
    device: Arc<D>,
    handle: vk::Semaphore,
    /// Upper bound on a host wait before the device is declared lost
    wait_timeout: Duration,
}

impl<D: GpuDevice> TimelineSemaphore<D> {
    pub fn new(device: Arc<D>, initial_value: u64, wait_timeout: Duration) -> Result<Self> {
        let handle = device.create_timeline_semaphore(initial_value).map_err(|e| {
            log::error!("Failed to create timeline semaphore: {}", e);
            e
        })?;
        log::debug!("Created timeline semaphore {:?} at {}", handle, initial_value);
        Ok(Self {
            device,
            handle,
            wait_timeout,
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.handle
    }

    /// Set the counter to `value` from the host.
    ///
    /// The counter never goes backwards: a value at or below the current one
    /// is refused with `NonMonotonicSignal` and the semaphore is untouched.
    pub fn signal(&self, value: u64) -> Result<()> {
        if let Some(current) = self.value() {
            if value <= current {
                log::warn!(
                    "Refusing to signal {:?} to {} (already at {})",
                    self.handle,
                    value,
                    current
                );
                return Err(Error::NonMonotonicSignal {
                    current,
                    requested: value,
                });
            }
        }
        self.device.signal_semaphore(self.handle, value).map_err(|e| {
            log::error!("Failed to signal {:?} to {}: {}", self.handle, value, e);
            e
        })
    }

    /// Block until the counter is at least `value`.
    ///
    /// There is no caller-facing timeout: callers only wait for values that
    /// were submitted. If the counter still has not arrived after the
    /// configured bound, the device is reported lost instead of hanging forever.
    pub fn wait(&self, value: u64) -> Result<()> {
        match self
            .device
            .wait_semaphore(self.handle, value, self.wait_timeout)
        {
            Ok(()) => Ok(()),
            Err(Error::Vulkan(vk::Result::TIMEOUT)) => {
                log::error!(
                    "Timeline {:?} did not reach {} within {:?}, treating device as lost",
                    self.handle,
                    value,
                    self.wait_timeout
                );
                Err(Error::DeviceLost {
                    target: value,
                    timeout: self.wait_timeout,
                })
            }
            Err(e) => {
                log::error!("Wait on {:?} for {} failed: {}", self.handle, value, e);
                Err(e)
            }
        }
    }

    /// Current counter, or `None` if the query itself failed.
    pub fn value(&self) -> Option<u64> {
        match self.device.semaphore_value(self.handle) {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!("Failed to query {:?}: {}", self.handle, e);
                None
            }
        }
    }

    /// Non-blocking check that the counter has reached `value`.
    pub fn is_reached(&self, value: u64) -> bool {
        self.value().map_or(false, |current| current >= value)
    }
}

impl<D: GpuDevice> Drop for TimelineSemaphore<D> {
    fn drop(&mut self) {
        self.device.destroy_semaphore(self.handle);
    }
}

impl<D: GpuDevice> std::fmt::Debug for TimelineSemaphore<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimelineSemaphore")
            .field("handle", &self.handle)
            .finish()
    }
}
