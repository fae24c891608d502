// =============================================================================
// GPU-LIFETIME DEMO
// =============================================================================
//
// Drives the resource core for a few frames:
// 1. Map a dynamic constant buffer with DISCARD every frame
// 2. Record an update on a deferred context and execute it
// 3. Drop a transient buffer while its commands are still in flight
// 4. Signal a frame fence and keep at most two frames in flight
// 5. Read the results back through a staging buffer
//
// Release-queue and page-pool statistics are logged every frame.
//
// =============================================================================

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::Write;

use gpu_lifetime::{
    BindFlags, BufferDesc, CpuAccess, EngineConfig, MapFlags, MapType, RenderDevice,
    TransitionMode, Usage,
};

const FRAMES: u64 = 6;
const FRAMES_IN_FLIGHT: u64 = 2;

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from engine.toml
    let config = EngineConfig::load();

    // Initialize logging
    init_logging(&config)?;
    log::info!("Starting gpu-lifetime demo");

    let (device, mut immediate, mut deferred) =
        RenderDevice::create(&config).context("Failed to create render device")?;
    log::info!(
        "Backend: {} ({} deferred contexts)",
        device.backend_name(),
        deferred.len()
    );

    // ─────────────────────────────────────────────────────────────────────────
    // Long-lived resources
    // ─────────────────────────────────────────────────────────────────────────
    let constants = device.create_buffer(
        &BufferDesc::new("frame constants", 256)
            .usage(Usage::Dynamic)
            .bind_flags(BindFlags::UNIFORM_BUFFER)
            .cpu_access(CpuAccess::WRITE),
        None,
    )?;

    let vertex_data: Vec<u8> = [0.0f32, 0.5, -0.5, -0.5, 0.5, -0.5]
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect();
    let vertices = device.create_buffer(
        &BufferDesc::new("triangle", vertex_data.len() as u64)
            .usage(Usage::Immutable)
            .bind_flags(BindFlags::VERTEX_BUFFER),
        Some(&vertex_data),
    )?;

    let results = device.create_buffer(&BufferDesc::new("results", 256), None)?;
    let scratch = device.create_buffer(&BufferDesc::new("worker scratch", 64), None)?;
    let fence = device.create_fence("frame fence");

    // ─────────────────────────────────────────────────────────────────────────
    // Frame loop
    // ─────────────────────────────────────────────────────────────────────────
    for frame in 0..FRAMES {
        let mut mapping = immediate.map_buffer(&constants, MapType::Write, MapFlags::DISCARD)?;
        mapping.as_mut_slice().fill(frame as u8);
        drop(mapping);
        immediate.unmap_buffer(&constants, MapType::Write, MapFlags::DISCARD)?;
        immediate.copy_buffer(
            &constants,
            0,
            TransitionMode::Transition,
            &results,
            0,
            256,
            TransitionMode::Transition,
        )?;

        if let Some(worker) = deferred.first_mut() {
            worker.update_buffer(&scratch, 0, &[frame as u8; 64], TransitionMode::Transition)?;
            let list = worker.finish_command_list()?;
            immediate.execute_command_list(list)?;
            worker.finish_frame()?;
        }

        // Released only after the GPU is done with this frame
        let transient = device.create_buffer(&BufferDesc::new(format!("transient {}", frame), 1024), None)?;
        immediate.update_buffer(&transient, 0, &[frame as u8; 1024], TransitionMode::Transition)?;
        drop(transient);

        immediate.enqueue_signal(&fence, frame + 1)?;
        immediate.finish_frame()?;

        if frame + 1 > FRAMES_IN_FLIGHT {
            fence.wait(frame + 1 - FRAMES_IN_FLIGHT)?;
        }
        device.release_stale_resources(false);

        let stats = device.stats();
        log::info!(
            "Frame {}: fence {}/{} (completed/submitted), {} pending releases, pages {} free / {} retired",
            frame,
            stats.last_completed_fence,
            stats.last_submitted_fence,
            stats.pending_releases,
            stats.pages.free,
            stats.pages.retired
        );
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Read back
    // ─────────────────────────────────────────────────────────────────────────
    let readback = device.create_buffer(
        &BufferDesc::new("readback", 256)
            .usage(Usage::Staging)
            .cpu_access(CpuAccess::READ),
        None,
    )?;
    immediate.copy_buffer(
        &results,
        0,
        TransitionMode::Transition,
        &readback,
        0,
        256,
        TransitionMode::Transition,
    )?;
    let mapping = immediate.map_buffer(&readback, MapType::Read, MapFlags::empty())?;
    let last_frame = (FRAMES - 1) as u8;
    let matches = mapping.as_slice().iter().all(|&byte| byte == last_frame);
    log::info!(
        "Read back {} bytes from \"results\": {}",
        mapping.len(),
        if matches { "ok" } else { "MISMATCH" }
    );
    drop(mapping);
    immediate.unmap_buffer(&readback, MapType::Read, MapFlags::empty())?;

    drop(vertices);
    immediate.wait_for_idle()?;

    let stats = device.stats();
    log::info!(
        "Done: {} releases finalized, {} pending, {} upload pages created ({} recycled)",
        stats.finalized_releases,
        stats.pending_releases,
        stats.pages.created,
        stats.pages.recycled
    );
    Ok(())
}

// =============================================================================
// LOGGING
// =============================================================================

fn init_logging(config: &EngineConfig) -> Result<()> {
    use env_logger::{Builder, Target};

    let mut builder = Builder::from_default_env();
    builder.filter_level(config.logging.level_filter());

    // Create/clear log file if enabled
    if config.logging.log_to_file {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.logging.log_file)
            .with_context(|| format!("Failed to open log file {}", config.logging.log_file))?;
        writeln!(file, "=== gpu-lifetime log ===")?;
        writeln!(file, "Started: {:?}", std::time::SystemTime::now())?;
        writeln!(file)?;
        builder.target(Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}
