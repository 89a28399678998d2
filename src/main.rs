// =============================================================================
// FRAME RING - Headless frame loop
// =============================================================================
//
// Drives the frame ring without a window: worker tasks record into the
// active frame's pools while the main thread uploads per-frame data, then
// the frame is submitted and "presented" offscreen.
//
// FRAME FLOW:
// 1. begin_frame (waits until the GPU is done with this ring slot)
// 2. Schedule recording tasks (rendering / resource / any worker)
// 3. Upload camera from the main thread
// 4. end_frame (barrier on the tasks, chained submit, present)
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use frame_ring::backend::buffer::{CameraUniform, DrawRecord, MaterialRecord, TransformRecord};
use frame_ring::backend::Submission;
use frame_ring::config::{BackendKind, Config};
use frame_ring::frame::{FrameOutcome, OffscreenPresenter, RenderContext, RenderFrame};
use frame_ring::{GpuDevice, HostDevice, QueueFamily, Scheduler, VulkanDevice, WorkerFlags};
use glam::{Mat4, Vec3, Vec4};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

const PRIMARY: vk::CommandBufferLevel = vk::CommandBufferLevel::PRIMARY;
const SECONDARY: vk::CommandBufferLevel = vk::CommandBufferLevel::SECONDARY;

/// Draws written per frame by the scene task
const SCENE_DRAWS: usize = 64;

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    // Initialize logging
    init_logging(&config);
    log::info!("Starting frame ring");
    log::info!(
        "Backend: {:?}, ring size: {}, frames: {}",
        config.device.backend,
        config.frames.ring_size,
        config.frames.frames_to_run
    );

    let scheduler = Arc::new(
        Scheduler::new(&config.scheduler).context("Failed to start the scheduler")?,
    );

    let result = match config.device.backend {
        BackendKind::Host => run(HostDevice::new(), &config, &scheduler),
        BackendKind::Vulkan => {
            // Enable validation layers based on config (and debug build)
            let enable_validation = cfg!(debug_assertions) && config.device.validation_layers;
            let device = VulkanDevice::new(&config.device.app_name, enable_validation)
                .context("Failed to create Vulkan device")?;
            run(device, &config, &scheduler)
        }
    };

    scheduler.shutdown();
    result
}

/// Initialize logging with optional file output
///
/// `RUST_LOG` wins over `[debug] log_level` when set.
fn init_logging(config: &Config) {
    use env_logger::{Builder, Target};

    let mut builder = Builder::new();
    builder.filter_level(config.log_level());
    builder.parse_default_env();

    // Create/clear log file if enabled
    if config.debug.log_to_file {
        match OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            Ok(mut file) => {
                let _ = writeln!(file, "=== Frame Ring Log ===");
                let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
                let _ = writeln!(file);
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Cannot open log file {}: {}", config.debug.log_file, e),
        }
    }

    builder.init();
}

// =============================================================================
// FRAME LOOP
// =============================================================================

fn run<D: GpuDevice>(device: Arc<D>, config: &Config, scheduler: &Arc<Scheduler>) -> Result<()> {
    let presenter = OffscreenPresenter::new(config.frames.offscreen_images);
    let mut context = RenderContext::from_config(device.clone(), presenter, config)
        .context("Failed to create render context")?
        .with_scheduler(scheduler.clone());

    let mut fps = FpsCounter::new(config.debug.show_fps);
    let mut dropped = 0u64;
    let started = Instant::now();

    for frame_number in 0..config.frames.frames_to_run {
        // ─────────────────────────────────────────────────────────────────────
        // STEP 1: Recycle the next ring slot
        // ─────────────────────────────────────────────────────────────────────
        match context.begin_frame() {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) if e.is_fatal() => {
                return Err(e).context("GPU stopped retiring frames");
            }
            Err(e) => {
                log::warn!("Skipping frame {}: {}", frame_number, e);
                dropped += 1;
                continue;
            }
        }

        let frame = context
            .current_frame()
            .context("No active frame after begin_frame")?
            .clone();

        // ─────────────────────────────────────────────────────────────────────
        // STEP 2: Record on the workers
        // ─────────────────────────────────────────────────────────────────────
        if let Err(e) = schedule_frame_tasks(scheduler, &device, &frame, frame_number) {
            log::warn!("Frame {}: could not schedule all tasks: {}", frame_number, e);
        }

        // ─────────────────────────────────────────────────────────────────────
        // STEP 3: Per-frame uniforms from the main thread
        // ─────────────────────────────────────────────────────────────────────
        if let Err(e) = frame.write_camera(&orbit_camera(frame_number)) {
            log::warn!("Frame {}: camera upload failed: {}", frame_number, e);
        }

        // ─────────────────────────────────────────────────────────────────────
        // STEP 4: Submit and present
        // ─────────────────────────────────────────────────────────────────────
        match context.end_frame() {
            Ok(FrameOutcome::Presented) => fps.tick(),
            Ok(outcome) => {
                log::debug!("Frame {}: {:?}", frame_number, outcome);
                dropped += 1;
            }
            Err(e) if e.is_fatal() => {
                return Err(e).context("GPU lost while submitting");
            }
            Err(e) => {
                log::warn!("Frame {} dropped: {}", frame_number, e);
                dropped += 1;
            }
        }
    }

    device.wait_idle().context("Failed to wait for device idle")?;

    let elapsed = started.elapsed().as_secs_f32();
    log::info!(
        "Finished: {} frames presented, {} dropped in {:.2}s",
        context.frames_presented(),
        dropped,
        elapsed
    );
    Ok(())
}

/// Queue this frame's recording work. Tasks log their own failures; a task
/// that fails only leaves its command buffer out of the frame.
fn schedule_frame_tasks<D: GpuDevice>(
    scheduler: &Scheduler,
    device: &Arc<D>,
    frame: &Arc<RenderFrame<D>>,
    frame_number: u64,
) -> frame_ring::Result<()> {
    // Fall back to any worker when nobody specialises
    let affinity = |flags: WorkerFlags| {
        if scheduler.workers_with(flags) > 0 {
            flags
        } else {
            WorkerFlags::empty()
        }
    };

    // One graphics pass per rendering worker
    let passes = scheduler.workers_with(WorkerFlags::RENDERING).max(1);
    for pass in 0..passes {
        let (device, frame) = (device.clone(), frame.clone());
        scheduler.schedule_task_with(affinity(WorkerFlags::RENDERING), move || {
            if let Err(e) = record_graphics_pass(&*device, &frame) {
                log::warn!("Frame {}: graphics pass {} failed: {}", frame.index(), pass, e);
            }
        })?;
    }

    {
        let (device, frame) = (device.clone(), frame.clone());
        scheduler.schedule_task_with(affinity(WorkerFlags::RESOURCE), move || {
            if let Err(e) = upload_resources(&*device, &frame) {
                log::warn!("Frame {}: resource upload failed: {}", frame.index(), e);
            }
        })?;
    }

    {
        let (device, frame) = (device.clone(), frame.clone());
        scheduler.schedule_task(move || {
            if let Err(e) = record_scene(&*device, &frame, frame_number) {
                log::warn!("Frame {}: scene recording failed: {}", frame.index(), e);
            }
        })?;
    }

    Ok(())
}

fn record_graphics_pass<D: GpuDevice>(device: &D, frame: &RenderFrame<D>) -> frame_ring::Result<()> {
    let cb = frame.request_command_buffer(QueueFamily::Graphics, PRIMARY)?;
    device.begin_command_buffer(cb, PRIMARY)?;
    device.end_command_buffer(cb)?;
    frame.enqueue(QueueFamily::Graphics, cb);
    Ok(())
}

/// Immediate transfer: submitted on its own and waited on with a pooled fence.
fn upload_resources<D: GpuDevice>(device: &D, frame: &RenderFrame<D>) -> frame_ring::Result<()> {
    let cb = frame.request_command_buffer(QueueFamily::Transfer, PRIMARY)?;
    device.begin_command_buffer(cb, PRIMARY)?;
    device.end_command_buffer(cb)?;

    let fence = frame.request_fence()?;
    device.submit(
        QueueFamily::Transfer,
        &Submission {
            command_buffers: &[cb],
            fence,
            ..Default::default()
        },
    )?;
    frame.wait_for_fence(fence)
}

/// Scene data for the shaders, a compute pass and a secondary buffer.
fn record_scene<D: GpuDevice>(
    device: &D,
    frame: &RenderFrame<D>,
    frame_number: u64,
) -> frame_ring::Result<()> {
    let t = frame_number as f32 * 0.01;
    let transforms: Vec<_> = (0..SCENE_DRAWS)
        .map(|i| TransformRecord {
            model: Mat4::from_rotation_y(t + i as f32)
                * Mat4::from_translation(Vec3::new(i as f32 * 2.0, 0.0, 0.0)),
        })
        .collect();
    let materials = [MaterialRecord {
        base_color: Vec4::new(0.1, 0.2, 0.8, 1.0),
        params: Vec4::new(0.0, 0.5, 0.0, 0.0),
    }];
    let draws: Vec<_> = (0..SCENE_DRAWS as u32)
        .map(|i| DrawRecord {
            mesh: i % 4,
            material: 0,
            transform: i,
            instance_count: 1,
        })
        .collect();

    frame.write_transforms(0, &transforms)?;
    frame.write_materials(0, &materials)?;
    frame.write_draws(0, &draws)?;

    let compute = frame.request_command_buffer(QueueFamily::Compute, PRIMARY)?;
    device.begin_command_buffer(compute, PRIMARY)?;
    device.end_command_buffer(compute)?;
    frame.enqueue(QueueFamily::Compute, compute);

    // Recorded for a graphics pass to execute; never submitted on its own
    let secondary = frame.request_command_buffer(QueueFamily::Graphics, SECONDARY)?;
    device.begin_command_buffer(secondary, SECONDARY)?;
    device.end_command_buffer(secondary)?;
    Ok(())
}

fn orbit_camera(frame_number: u64) -> CameraUniform {
    let angle = frame_number as f32 * 0.02;
    let position = Vec3::new(angle.cos() * 10.0, 4.0, angle.sin() * 10.0);
    let view = Mat4::look_at_rh(position, Vec3::ZERO, Vec3::Y);
    let projection = Mat4::perspective_rh(60f32.to_radians(), 16.0 / 9.0, 0.1, 500.0);
    CameraUniform::new(view, projection, position)
}

// =============================================================================
// FPS TRACKING
// =============================================================================

struct FpsCounter {
    enabled: bool,
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl FpsCounter {
    fn new(enabled: bool) -> Self {
        let now = Instant::now();
        Self {
            enabled,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    fn tick(&mut self) {
        if !self.enabled {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Report every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;
            log::info!("{:.0} FPS ({:.2}ms)", fps, frame_time * 1000.0);
            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}
