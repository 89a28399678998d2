// Error types for the frame ring
//
// Every native failure is checked at the call site, logged there, and
// surfaced as one of these variants. Nothing in the pools panics.

use ash::vk;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Vulkan API error
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// Failed to load the Vulkan library
    #[error("Failed to load Vulkan: {0}")]
    Loading(#[from] ash::LoadingError),

    /// GPU memory allocator error
    #[error("Allocator error: {0}")]
    Allocator(#[from] gpu_allocator::AllocationError),

    /// OS-level failure (worker thread spawn)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A timeline semaphore only moves forward
    #[error("Timeline signal {requested} rejected, counter already at {current}")]
    NonMonotonicSignal { current: u64, requested: u64 },

    /// A host wait did not reach its target in time. The GPU is assumed gone.
    #[error("Device lost: timeline value {target} not reached within {timeout:?}")]
    DeviceLost { target: u64, timeout: Duration },

    #[error("No suitable GPU found")]
    NoSuitableGpu,

    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    #[error("Write of {len} bytes at offset {offset} exceeds buffer size {size}")]
    OutOfRange { offset: u64, len: u64, size: u64 },

    #[error("Scheduler has been shut down")]
    SchedulerShutdown,

    #[error("No worker accepts tasks with affinity {0}")]
    NoEligibleWorker(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Whether the frame loop can keep going after this error.
    ///
    /// Resource-creation failures only cost the current frame. A lost device
    /// (or a timeline wait that never completes) cannot be recovered from.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::DeviceLost { .. } | Error::Vulkan(vk::Result::ERROR_DEVICE_LOST)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_lost_is_fatal() {
        let lost = Error::DeviceLost {
            target: 3,
            timeout: Duration::from_millis(10),
        };
        assert!(lost.is_fatal());
        assert!(Error::Vulkan(vk::Result::ERROR_DEVICE_LOST).is_fatal());
    }

    #[test]
    fn allocation_failures_are_recoverable() {
        assert!(!Error::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY).is_fatal());
        assert!(!Error::NonMonotonicSignal { current: 4, requested: 2 }.is_fatal());
    }
}
