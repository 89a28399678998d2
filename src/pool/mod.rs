// Pool module - per-frame caches of single-use GPU objects
//
// Everything here is handed out by index and only becomes reusable after an
// explicit `reset`, which the frame ring issues once the GPU is done with it.

pub mod command;
pub mod fence;
pub mod semaphore;
pub mod slab;

pub use command::{CommandPool, CommandPoolData};
pub use fence::FencePool;
pub use semaphore::SemaphorePool;
pub use slab::Slab;
