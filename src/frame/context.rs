// Render context - the frame ring and its begin/end state machine
//
// FRAME FLOW:
// 1. begin_frame: advance the ring, reset the slot (waits on its timeline)
// 2. workers record into the slot's pools and enqueue command buffers
// 3. end_frame: scheduler barrier, acquire, chained submit, present
//
// At most one frame is active. A surface that goes stale between begin and
// end turns the frame into an abandoned one: nothing is submitted or shown.
// A surface that went stale while idle is rebuilt by the next begin_frame.

use super::present::Presenter;
use super::render_frame::{FrameSizes, PresentSync, RenderFrame};
use crate::backend::GpuDevice;
use crate::config::{Config, RING_SIZES};
use crate::error::{Error, Result};
use crate::scheduler::Scheduler;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    FrameActive,
}

/// What `end_frame` did with the active frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Work submitted and the image handed to the presenter
    Presented,
    /// The surface was stale; the frame's work was dropped
    Abandoned,
    /// No frame was active
    Skipped,
}

pub struct RenderContext<D: GpuDevice, P: Presenter> {
    device: Arc<D>,
    frames: Vec<Arc<RenderFrame<D>>>,
    frame_index: usize,
    state: FrameState,
    presenter: P,
    scheduler: Option<Arc<Scheduler>>,
    resize_pending: AtomicBool,
    frames_presented: u64,
}

impl<D: GpuDevice, P: Presenter> RenderContext<D, P> {
    /// Build a ring of `ring_size` (2 or 3) frames.
    pub fn new(
        device: Arc<D>,
        presenter: P,
        ring_size: usize,
        sizes: &FrameSizes,
        wait_timeout: Duration,
    ) -> Result<Self> {
        if !RING_SIZES.contains(&ring_size) {
            return Err(Error::InvalidConfig(format!(
                "ring size {} is outside {:?}",
                ring_size, RING_SIZES
            )));
        }

        let frames = (0..ring_size)
            .map(|index| RenderFrame::new(device.clone(), index, sizes, wait_timeout).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        log::info!("Render context ready: {} frames in flight", ring_size);

        Ok(Self {
            device,
            frames,
            // The first begin_frame lands on slot 0
            frame_index: ring_size - 1,
            state: FrameState::Idle,
            presenter,
            scheduler: None,
            resize_pending: AtomicBool::new(false),
            frames_presented: 0,
        })
    }

    pub fn from_config(device: Arc<D>, presenter: P, config: &Config) -> Result<Self> {
        Self::new(
            device,
            presenter,
            config.frames.ring_size,
            &FrameSizes::from(&config.buffers),
            config.sync.wait_timeout(),
        )
    }

    /// Make `end_frame` wait for every scheduled task before submitting.
    pub fn with_scheduler(mut self, scheduler: Arc<Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Start the next frame.
    ///
    /// Returns `Ok(false)` without side effects if a frame is already active.
    /// If the surface cannot be rebuilt or the slot cannot be reset, the ring
    /// index is restored, the context stays idle and the error is returned;
    /// `Error::is_fatal` tells whether skipping the frame is enough.
    pub fn begin_frame(&mut self) -> Result<bool> {
        if self.state == FrameState::FrameActive {
            log::warn!(
                "begin_frame called while frame {} is still active",
                self.frame_index
            );
            return Ok(false);
        }

        if self.resize_pending.swap(false, Ordering::AcqRel) {
            self.presenter.invalidate();
        }
        if !self.presenter.is_valid() {
            log::info!("Rebuilding surface before the next frame");
            self.presenter.rebuild()?;
        }

        let previous = self.frame_index;
        self.frame_index = (self.frame_index + 1) % self.frames.len();

        if let Err(e) = self.frames[self.frame_index].reset() {
            log::error!("Failed to reset frame {}: {}", self.frame_index, e);
            self.frame_index = previous;
            return Err(e);
        }

        self.state = FrameState::FrameActive;
        Ok(true)
    }

    /// Finish the active frame: submit its work and present it.
    ///
    /// Does nothing if no frame is active. The context is idle afterwards
    /// whatever the outcome; a failed frame is dropped.
    pub fn end_frame(&mut self) -> Result<FrameOutcome> {
        if self.state != FrameState::FrameActive {
            log::debug!("end_frame called without an active frame");
            return Ok(FrameOutcome::Skipped);
        }
        self.state = FrameState::Idle;

        if let Some(scheduler) = &self.scheduler {
            scheduler.wait_for_queued_tasks();
        }

        let frame = self.frames[self.frame_index].clone();

        if self.resize_pending.swap(false, Ordering::AcqRel) {
            self.presenter.invalidate();
        }
        if !self.presenter.is_valid() {
            return self.abandon(&frame, "surface changed during the frame");
        }

        let sync = PresentSync {
            image_available: frame.request_semaphore()?,
            render_finished: frame.request_semaphore()?,
        };
        let Some(image) = self.presenter.acquire(sync.image_available)? else {
            self.presenter.invalidate();
            return self.abandon(&frame, "surface out of date at acquire");
        };

        if let Err(e) = frame.submit(image.synchronized.then_some(sync)) {
            // Nothing will wait on the acquire signal and the image is never shown
            if image.synchronized {
                frame.semaphore_pool().retire(sync.image_available);
            }
            log::error!("Frame {} dropped after acquire: {}", frame.index(), e);
            self.rebuild_surface();
            return Err(e);
        }

        match self.presenter.present(image, sync.render_finished) {
            Ok(true) => {}
            Ok(false) => {
                log::warn!("Surface out of date at present, rebuilding next frame");
                self.presenter.invalidate();
            }
            Err(e) => {
                if image.synchronized {
                    frame.semaphore_pool().retire(sync.render_finished);
                }
                log::error!("Frame {} could not be presented: {}", frame.index(), e);
                self.presenter.invalidate();
                return Err(e);
            }
        }
        self.frames_presented += 1;
        Ok(FrameOutcome::Presented)
    }

    /// Throw away the surface after an image was acquired but not presented.
    /// A failed rebuild is retried by the next `begin_frame`.
    fn rebuild_surface(&mut self) {
        self.presenter.invalidate();
        if let Err(e) = self.presenter.rebuild() {
            log::error!("Failed to rebuild surface: {}", e);
        }
    }

    fn abandon(&mut self, frame: &RenderFrame<D>, reason: &str) -> Result<FrameOutcome> {
        let dropped = frame.take_queued();
        log::warn!(
            "Abandoning frame {} ({}), {} command buffers dropped",
            frame.index(),
            reason,
            dropped.len()
        );
        self.presenter.rebuild()?;
        Ok(FrameOutcome::Abandoned)
    }

    /// Framebuffer resize notification. Safe to call at any point. A frame in
    /// progress is abandoned at `end_frame`; otherwise the surface is rebuilt
    /// by the next `begin_frame`.
    pub fn notify_resize(&self) {
        self.resize_pending.store(true, Ordering::Release);
    }

    /// The active frame, for handing to tasks.
    pub fn current_frame(&self) -> Option<&Arc<RenderFrame<D>>> {
        match self.state {
            FrameState::FrameActive => self.frames.get(self.frame_index),
            FrameState::Idle => None,
        }
    }

    pub fn frame(&self, index: usize) -> Option<&Arc<RenderFrame<D>>> {
        self.frames.get(index)
    }

    #[inline]
    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    #[inline]
    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn ring_size(&self) -> usize {
        self.frames.len()
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    pub fn presenter(&self) -> &P {
        &self.presenter
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }
}

impl<D: GpuDevice, P: Presenter> Drop for RenderContext<D, P> {
    fn drop(&mut self) {
        // Frames may still be in flight; their objects must outlive the GPU work
        if let Err(e) = self.device.wait_idle() {
            log::error!("Failed to wait for device idle: {}", e);
        }
        log::info!(
            "Render context destroyed after {} presented frames",
            self.frames_presented
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostDevice;
    use crate::frame::OffscreenPresenter;

    fn context(device: Arc<HostDevice>, ring: usize) -> RenderContext<HostDevice, OffscreenPresenter> {
        let sizes = FrameSizes {
            draws: 4,
            transforms: 4,
            materials: 4,
        };
        RenderContext::new(device, OffscreenPresenter::new(2), ring, &sizes, Duration::from_secs(1))
            .unwrap()
    }

    #[test]
    fn ring_advances_one_slot_per_frame() {
        let mut ctx = context(HostDevice::new(), 3);
        let mut seen = Vec::new();
        for _ in 0..4 {
            assert!(ctx.begin_frame().unwrap());
            seen.push(ctx.frame_index());
            assert_eq!(ctx.end_frame().unwrap(), FrameOutcome::Presented);
        }
        assert_eq!(seen, vec![0, 1, 2, 0]);
        assert_eq!(ctx.frames_presented(), 4);
    }

    #[test]
    fn rejects_unsupported_ring_sizes() {
        let sizes = FrameSizes::default();
        for ring in [0, 1, 4] {
            let result = RenderContext::new(
                HostDevice::new(),
                OffscreenPresenter::new(1),
                ring,
                &sizes,
                Duration::from_secs(1),
            );
            assert!(matches!(result, Err(Error::InvalidConfig(_))));
        }
    }

    #[test]
    fn current_frame_only_while_active() {
        let mut ctx = context(HostDevice::new(), 2);
        assert!(ctx.current_frame().is_none());
        ctx.begin_frame().unwrap();
        assert_eq!(ctx.current_frame().unwrap().index(), 0);
        ctx.end_frame().unwrap();
        assert!(ctx.current_frame().is_none());
    }

    #[test]
    fn failed_reset_restores_index_and_stays_idle() {
        let device = HostDevice::manual();
        let sizes = FrameSizes::default();
        let mut ctx = RenderContext::new(
            device.clone(),
            OffscreenPresenter::new(2),
            2,
            &sizes,
            Duration::from_millis(20),
        )
        .unwrap();

        // Slots 0 and 1 each get work the GPU never finishes
        for _ in 0..2 {
            ctx.begin_frame().unwrap();
            ctx.end_frame().unwrap();
        }
        assert_eq!(ctx.frame_index(), 1);

        let err = ctx.begin_frame().unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(ctx.frame_index(), 1);
        assert_eq!(ctx.state(), FrameState::Idle);

        device.retire_all();
        assert!(ctx.begin_frame().unwrap());
        assert_eq!(ctx.frame_index(), 0);
    }
}
