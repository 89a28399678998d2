// =============================================================================
// FRAME RING - Frame-parallel GPU resource pooling and synchronization
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  RenderContext (begin/end state machine, presenter)             │
// │    └── RenderFrame x 2..3 (ring slots)                          │
// │          ├── TimelineSemaphore (gates slot reuse)               │
// │          ├── CommandPool x 3 (per thread, per queue family)     │
// │          ├── FencePool / SemaphorePool                          │
// │          └── Frame-local buffers + descriptor sets              │
// │  Scheduler (worker threads, affinity flags, frame barrier)      │
// │  GpuDevice (Vulkan via ash, or host simulation)                 │
// └─────────────────────────────────────────────────────────────────┘
//
// =============================================================================

pub mod backend;
pub mod config;
pub mod error;
pub mod frame;
pub mod pool;
pub mod scheduler;

pub use backend::{GpuDevice, HostDevice, QueueFamily, TimelineSemaphore, VulkanDevice};
pub use config::Config;
pub use error::{Error, Result};
pub use frame::{FrameOutcome, FrameState, OffscreenPresenter, Presenter, RenderContext, RenderFrame};
pub use pool::{CommandPool, FencePool, SemaphorePool};
pub use scheduler::{Scheduler, Worker, WorkerFlags};
