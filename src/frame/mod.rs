// Frame module - ring slots and the context that cycles them

pub mod context;
pub mod present;
pub mod render_frame;

pub use context::{FrameOutcome, FrameState, RenderContext};
pub use present::{AcquiredImage, OffscreenPresenter, Presenter};
pub use render_frame::{FrameBuffers, FrameDescriptors, FrameSizes, PresentSync, RenderFrame};
