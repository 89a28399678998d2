// Frame ring integration tests
//
// Run the whole ring against the host device: begin/end state machine,
// slot recycling gated on the timeline, the scheduler barrier and surface
// invalidation.

use ash::vk;
use frame_ring::backend::HostDevice;
use frame_ring::config::SchedulerConfig;
use frame_ring::frame::{
    AcquiredImage, FrameOutcome, FrameSizes, FrameState, OffscreenPresenter, Presenter,
    RenderContext, RenderFrame,
};
use frame_ring::{GpuDevice, QueueFamily, Result, Scheduler, WorkerFlags};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

const PRIMARY: vk::CommandBufferLevel = vk::CommandBufferLevel::PRIMARY;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn sizes() -> FrameSizes {
    FrameSizes {
        draws: 16,
        transforms: 16,
        materials: 4,
    }
}

fn offscreen(device: Arc<HostDevice>, ring: usize) -> RenderContext<HostDevice, OffscreenPresenter> {
    RenderContext::new(
        device,
        OffscreenPresenter::new(3),
        ring,
        &sizes(),
        Duration::from_secs(5),
    )
    .unwrap()
}

fn record(device: &HostDevice, frame: &RenderFrame<HostDevice>, family: QueueFamily) -> vk::CommandBuffer {
    let cb = frame.request_command_buffer(family, PRIMARY).unwrap();
    device.begin_command_buffer(cb, PRIMARY).unwrap();
    device.end_command_buffer(cb).unwrap();
    cb
}

#[test]
fn second_begin_frame_is_refused() {
    init_logger();
    let mut ctx = offscreen(HostDevice::new(), 2);

    assert!(ctx.begin_frame().unwrap());
    let index = ctx.frame_index();
    assert!(!ctx.begin_frame().unwrap());
    assert_eq!(ctx.frame_index(), index);
    assert_eq!(ctx.state(), FrameState::FrameActive);

    assert_eq!(ctx.end_frame().unwrap(), FrameOutcome::Presented);
}

#[test]
fn end_frame_without_begin_does_nothing() {
    init_logger();
    let device = HostDevice::new();
    let mut ctx = offscreen(device.clone(), 2);

    assert_eq!(ctx.end_frame().unwrap(), FrameOutcome::Skipped);
    assert_eq!(ctx.state(), FrameState::Idle);
    assert!(device.submissions().is_empty());
}

#[test]
fn slot_is_only_recycled_after_its_submission_retires() {
    init_logger();
    let device = HostDevice::manual();
    let mut ctx = offscreen(device.clone(), 2);

    // Plays the GPU: finishes submissions in order, a little late
    let stop = Arc::new(AtomicBool::new(false));
    let gpu = {
        let device = device.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                device.retire_next();
                thread::sleep(Duration::from_millis(1));
            }
        })
    };

    let mut last_signal = [0u64; 2];
    for _ in 0..40 {
        assert!(ctx.begin_frame().unwrap());
        let slot = ctx.frame_index();
        let frame = ctx.current_frame().unwrap().clone();

        // The previous use of this slot must have retired before reset returned
        let reached = frame.timeline().value().unwrap();
        assert!(
            reached >= last_signal[slot],
            "slot {} recycled at timeline {} before its value {} retired",
            slot,
            reached,
            last_signal[slot]
        );

        let cb = record(&device, &frame, QueueFamily::Graphics);
        frame.enqueue(QueueFamily::Graphics, cb);
        let upload = record(&device, &frame, QueueFamily::Transfer);
        frame.enqueue(QueueFamily::Transfer, upload);

        assert_eq!(ctx.end_frame().unwrap(), FrameOutcome::Presented);
        last_signal[slot] = frame.submitted_value();
        assert!(last_signal[slot] > reached);
    }

    stop.store(true, Ordering::Release);
    gpu.join().unwrap();
    assert_eq!(ctx.frames_presented(), 40);
}

#[test]
fn slot_reuse_hands_back_the_same_command_buffers() {
    init_logger();
    let device = HostDevice::new();
    let mut ctx = offscreen(device.clone(), 2);

    let mut first_use = Vec::new();
    for round in 0..3 {
        for slot in 0..2 {
            ctx.begin_frame().unwrap();
            let frame = ctx.current_frame().unwrap().clone();
            let cb = record(&device, &frame, QueueFamily::Graphics);
            frame.enqueue(QueueFamily::Graphics, cb);
            ctx.end_frame().unwrap();

            if round == 0 {
                first_use.push(cb);
            } else {
                assert_eq!(cb, first_use[slot]);
            }
        }
    }
    assert_eq!(device.stats().command_buffers, 2);
}

#[test]
fn end_frame_waits_for_scheduled_recording() {
    init_logger();
    let device = HostDevice::new();
    let scheduler = Arc::new(
        Scheduler::new(&SchedulerConfig {
            workers: 4,
            rendering_workers: 2,
            resource_workers: 1,
            logging_workers: 0,
        })
        .unwrap(),
    );
    let mut ctx = offscreen(device.clone(), 2).with_scheduler(scheduler.clone());

    for _ in 0..3 {
        ctx.begin_frame().unwrap();
        let frame = ctx.current_frame().unwrap().clone();
        let before = device.submissions().len();

        for task in 0..8 {
            let (device, frame) = (device.clone(), frame.clone());
            let affinity = if task % 2 == 0 {
                WorkerFlags::RENDERING
            } else {
                WorkerFlags::empty()
            };
            scheduler
                .schedule_task_with(affinity, move || {
                    // Finish well after end_frame has been called
                    thread::sleep(Duration::from_millis(10));
                    let cb = record(&device, &frame, QueueFamily::Graphics);
                    frame.enqueue(QueueFamily::Graphics, cb);
                })
                .unwrap();
        }

        assert_eq!(ctx.end_frame().unwrap(), FrameOutcome::Presented);

        let submissions = device.submissions();
        let graphics: Vec<_> = submissions[before..]
            .iter()
            .filter(|s| s.family == QueueFamily::Graphics)
            .collect();
        assert_eq!(graphics.len(), 1);
        let unique: HashSet<_> = graphics[0].command_buffers.iter().collect();
        assert_eq!(unique.len(), 8);
    }

    drop(ctx);
    scheduler.shutdown();
}

#[test]
fn resize_between_begin_and_end_abandons_the_frame() {
    init_logger();
    let device = HostDevice::new();
    let mut ctx = offscreen(device.clone(), 2);

    ctx.begin_frame().unwrap();
    let frame = ctx.current_frame().unwrap().clone();
    let cb = record(&device, &frame, QueueFamily::Graphics);
    frame.enqueue(QueueFamily::Graphics, cb);

    ctx.notify_resize();
    assert_eq!(ctx.end_frame().unwrap(), FrameOutcome::Abandoned);
    assert!(device.submissions().is_empty());
    assert_eq!(ctx.presenter().rebuilds(), 1);
    assert_eq!(ctx.state(), FrameState::Idle);

    // The slot was never submitted, so it recycles without waiting
    assert!(ctx.begin_frame().unwrap());
    assert_eq!(ctx.end_frame().unwrap(), FrameOutcome::Presented);
    assert_eq!(ctx.presenter().presented(), 1);
}

/// Swapchain stand-in that uses the frame's semaphores and can go out of date.
#[derive(Default)]
struct SwapchainLike {
    valid: bool,
    out_of_date_at_acquire: bool,
    rebuilds: usize,
    acquired_with: Vec<vk::Semaphore>,
    presented_with: Vec<vk::Semaphore>,
}

impl Presenter for SwapchainLike {
    fn is_valid(&self) -> bool {
        self.valid
    }

    fn invalidate(&mut self) {
        self.valid = false;
    }

    fn rebuild(&mut self) -> Result<()> {
        self.valid = true;
        self.out_of_date_at_acquire = false;
        self.rebuilds += 1;
        Ok(())
    }

    fn acquire(&mut self, image_available: vk::Semaphore) -> Result<Option<AcquiredImage>> {
        if self.out_of_date_at_acquire {
            return Ok(None);
        }
        self.acquired_with.push(image_available);
        Ok(Some(AcquiredImage {
            index: 0,
            synchronized: true,
        }))
    }

    fn present(&mut self, _image: AcquiredImage, render_finished: vk::Semaphore) -> Result<bool> {
        self.presented_with.push(render_finished);
        Ok(true)
    }
}

fn swapchain_context(device: Arc<HostDevice>) -> RenderContext<HostDevice, SwapchainLike> {
    let presenter = SwapchainLike {
        valid: true,
        ..Default::default()
    };
    RenderContext::new(device, presenter, 2, &sizes(), Duration::from_secs(5)).unwrap()
}

#[test]
fn graphics_batch_carries_the_present_semaphores() {
    init_logger();
    let device = HostDevice::new();
    let mut ctx = swapchain_context(device.clone());

    ctx.begin_frame().unwrap();
    assert_eq!(ctx.end_frame().unwrap(), FrameOutcome::Presented);

    let image_available = ctx.presenter().acquired_with[0];
    let render_finished = ctx.presenter().presented_with[0];
    assert_ne!(image_available, render_finished);

    let graphics = &device.submissions()[0];
    assert_eq!(graphics.family, QueueFamily::Graphics);
    assert!(graphics.waits.iter().any(|&(s, _)| s == image_available));
    assert!(graphics.signals.iter().any(|&(s, _)| s == render_finished));
}

#[test]
fn failed_submission_after_acquire_drops_the_frame_cleanly() {
    init_logger();
    let device = HostDevice::new();
    let mut ctx = swapchain_context(device.clone());

    ctx.begin_frame().unwrap();
    let frame = ctx.current_frame().unwrap().clone();
    // Begun but never ended, so the graphics queue refuses it
    let cb = frame.request_command_buffer(QueueFamily::Graphics, PRIMARY).unwrap();
    device.begin_command_buffer(cb, PRIMARY).unwrap();
    frame.enqueue(QueueFamily::Graphics, cb);

    assert!(ctx.end_frame().is_err());
    assert_eq!(ctx.state(), FrameState::Idle);
    assert_eq!(ctx.presenter().rebuilds, 1);
    assert!(ctx.presenter().presented_with.is_empty());
    let never_waited = ctx.presenter().acquired_with[0];

    // Slot 1, then slot 0 again
    for _ in 0..2 {
        assert!(ctx.begin_frame().unwrap());
        assert_eq!(ctx.end_frame().unwrap(), FrameOutcome::Presented);
    }

    let acquired = ctx.presenter().acquired_with.clone();
    assert_eq!(acquired.len(), 3);
    assert!(!acquired[1..].contains(&never_waited));
    let submissions = device.submissions();
    for semaphore in &acquired[1..] {
        assert!(submissions
            .iter()
            .any(|s| s.waits.iter().any(|&(w, _)| w == *semaphore)));
    }
    assert_eq!(ctx.presenter().rebuilds, 1);
}

#[test]
fn resize_while_idle_costs_no_frame() {
    init_logger();
    let device = HostDevice::new();
    let mut ctx = offscreen(device.clone(), 2);

    ctx.begin_frame().unwrap();
    ctx.end_frame().unwrap();

    ctx.notify_resize();
    assert!(ctx.begin_frame().unwrap());
    assert_eq!(ctx.presenter().rebuilds(), 1);
    assert_eq!(ctx.end_frame().unwrap(), FrameOutcome::Presented);
    assert_eq!(ctx.presenter().presented(), 2);
}

#[test]
fn out_of_date_acquire_abandons_and_rebuilds() {
    init_logger();
    let device = HostDevice::new();
    // Valid until acquire reports the surface out of date
    let presenter = SwapchainLike {
        valid: true,
        out_of_date_at_acquire: true,
        ..Default::default()
    };
    let mut ctx =
        RenderContext::new(device.clone(), presenter, 2, &sizes(), Duration::from_secs(5)).unwrap();

    ctx.begin_frame().unwrap();
    assert_eq!(ctx.end_frame().unwrap(), FrameOutcome::Abandoned);
    assert!(ctx.presenter().is_valid());
    assert!(device.submissions().is_empty());

    ctx.begin_frame().unwrap();
    assert_eq!(ctx.end_frame().unwrap(), FrameOutcome::Presented);
}

#[test]
fn worker_threads_record_into_separate_pools() {
    init_logger();
    let device = HostDevice::new();
    let frame = Arc::new(RenderFrame::new(device.clone(), 0, &sizes(), Duration::from_secs(1)).unwrap());

    // All four recorders stay alive until each has its own pool
    let barrier = Barrier::new(4);

    let recorded: Vec<vk::CommandBuffer> = thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                s.spawn(|| {
                    let buffers = (0..4)
                        .map(|_| record(&device, &frame, QueueFamily::Graphics))
                        .collect::<Vec<_>>();
                    barrier.wait();
                    buffers
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect()
    });

    let unique: HashSet<_> = recorded.iter().collect();
    assert_eq!(unique.len(), 16);
    assert_eq!(frame.command_pool(QueueFamily::Graphics).thread_count(), 4);
}
