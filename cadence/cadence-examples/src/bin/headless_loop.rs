//! Headless frame loop: drives the orchestrator against the in-process backend, with an announced
//! resize, a silent resize, an out-of-date acquire and a stretch of starved command buffers.
//! Run: cargo run --bin headless_loop [frames]
//! Env: RUST_LOG, CADENCE_FRAMES_IN_FLIGHT, CADENCE_MAX_CONTEXTS, CADENCE_FENCE_TIMEOUT_MS, CADENCE_VALIDATION

use anyhow::Context;
use cadence_renderer::logging::{init_logging, LoggingConfig};
use cadence_renderer::{
    DrawCall, FrameConfig, FrameOrchestrator, FrameResult, RenderClass, RenderRequest, RenderState,
    ResourceRegistry,
};
use cadence_rhi::{HeadlessConfig, HeadlessDevice, RhiError};

const SURFACE: (u32, u32) = (1280, 720);
const RESIZED: (u32, u32) = (1920, 1080);

/// A small scene: opaque meshes over a few materials, two blended sprites and a UI overlay.
fn build_scene(registry: &mut ResourceRegistry) -> Vec<RenderRequest> {
    let mut next_handle = 1000u64;
    let mut handle = || {
        next_handle += 1;
        next_handle
    };
    let programs: Vec<_> = (0..4).map(|_| registry.register_program(handle())).collect();
    let meshes: Vec<_> = (0..6).map(|_| registry.register_geometry(handle())).collect();
    let textures: Vec<_> = (0..5).map(|_| registry.register_image(handle())).collect();
    let shadow_target = registry.register_target(handle());
    let quad = registry.register_geometry(handle());
    let ui_program = registry.register_program(handle());
    let font = registry.register_image(handle());

    let mut requests = Vec::new();
    for i in 0..48usize {
        let state = RenderState::new(programs[i % programs.len()], meshes[(i * 7) % meshes.len()])
            .with_image(0, textures[i % textures.len()]);
        requests.push(RenderRequest::opaque(state, DrawCall::indexed(36 * (1 + i as u32 % 4))));
    }
    for i in 0..8usize {
        let state = RenderState::new(programs[0], meshes[i % meshes.len()]).with_target(shadow_target);
        requests.push(RenderRequest::opaque(state, DrawCall::indexed(36)));
    }
    for i in 0..2usize {
        let state = RenderState::new(programs[3], quad).with_image(0, textures[i]);
        requests.push(RenderRequest::opaque(state, DrawCall::vertices(6)).with_class(RenderClass::Transparent));
    }
    let ui = RenderState::new(ui_program, quad).with_image(0, font);
    for _ in 0..6 {
        requests.push(RenderRequest::opaque(ui, DrawCall::vertices(6)).with_class(RenderClass::Ui));
    }
    requests
}

fn main() -> anyhow::Result<()> {
    init_logging(LoggingConfig::default());

    let frames: u64 = match std::env::args().nth(1) {
        Some(arg) => arg.parse().with_context(|| format!("invalid frame count {arg:?}"))?,
        None => 240,
    };
    // Trim all idle contexts every 60 frames so the starved stretch below has to allocate.
    let config = FrameConfig {
        trim_interval: 60,
        trim_retain: 0,
        ..FrameConfig::from_env().context("reading CADENCE_* overrides")?
    };

    let device = HeadlessDevice::new(HeadlessConfig {
        surface_extent: Some(SURFACE),
        ..HeadlessConfig::default()
    });
    let mut orchestrator =
        FrameOrchestrator::new(device.clone(), SURFACE, config).context("creating frame orchestrator")?;
    let scene = build_scene(orchestrator.registry_mut());
    log::info!("scene: {} render requests", scene.len());

    for frame in 0..frames {
        match frame {
            // Windowing reports the resize before the next frame.
            60 => {
                device.resize_surface(RESIZED.0, RESIZED.1);
                orchestrator.surface_changed(RESIZED, None);
            }
            // The surface changes behind our back; the acquire reports it.
            120 => device.resize_surface(SURFACE.0, SURFACE.1),
            150 => device.inject_acquire_error(RhiError::OutOfDate),
            // The device allocator refuses new command buffers across the trim at frame 180.
            175 => device.set_command_buffer_limit(Some(0)),
            185 => device.set_command_buffer_limit(None),
            _ => {}
        }
        let result = orchestrator
            .submit_frame(&scene)
            .with_context(|| format!("frame {frame}"))?;

        if let FrameResult::Skipped(reason) = result {
            println!("frame {frame:>4}: skipped ({reason})");
        }
    }

    orchestrator.shutdown().context("shutting down")?;
    println!("{}", orchestrator.stats());
    let violations = device.violations();
    anyhow::ensure!(violations.is_empty(), "backend reported misuse: {violations:?}");
    println!(
        "backend: {} submissions, max {} in flight, {} fence waits",
        device.submission_count(),
        device.max_in_flight(),
        device.fence_wait_count()
    );
    Ok(())
}
