//! recorderd - presence-triggered recording daemon
//!
//! This daemon:
//! 1. Pulls frames from the configured source (stub://, dir://)
//! 2. Runs tiled detection on a fixed cycle, one cycle in flight at a time
//! 3. Starts a capture after two consecutive positive cycles
//! 4. Stops after the grace period without the target, saving the clip
//! 5. On Ctrl-C: stops scheduling, finalizes any active recording, exits

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use presence_recorder::{
    open_source, BrightRegionScorer, DetectionWorker, Pipeline, Recorder, RecorderEvent,
    RecorderdConfig, ScorerRegistry, ScorerSettings, SharedDetectorConfig, SourceConfig,
    SpoolCapture, SqliteClipStore, TilingDetector,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to a JSON or TOML config file.
    #[arg(long, env = "RECORDER_CONFIG")]
    config: Option<PathBuf>,
    /// Scorer backend to use (overrides the config file).
    #[arg(long)]
    scorer: Option<String>,
    /// Exit after this many scheduler ticks (for smoke runs).
    #[arg(long)]
    max_cycles: Option<u64>,
}

fn build_registry(settings: &ScorerSettings, label: String) -> ScorerRegistry {
    let mut registry = ScorerRegistry::new();
    registry.register("cpu", move || Ok(Box::new(BrightRegionScorer::new(label.clone()))));

    #[cfg(feature = "backend-tract")]
    {
        let settings = settings.clone();
        registry.register("tract", move || {
            let path = settings
                .model_path
                .clone()
                .ok_or_else(|| anyhow!("tract scorer requires scorer.model_path"))?;
            Ok(Box::new(presence_recorder::TractScorer::new(
                path,
                settings.input_width,
                settings.input_height,
                settings.class_names.clone(),
            )))
        });
    }
    #[cfg(not(feature = "backend-tract"))]
    {
        if settings.model_path.is_some() {
            log::warn!("scorer.model_path ignored: built without the backend-tract feature");
        }
    }

    registry
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = RecorderdConfig::load_from(args.config.as_deref())?;
    if let Some(name) = args.scorer {
        cfg.scorer.name = name;
    }

    let label = cfg
        .detector
        .target_labels
        .iter()
        .next()
        .cloned()
        .ok_or_else(|| anyhow!("no target label configured"))?;
    let registry = build_registry(&cfg.scorer, label);
    let scorer = registry.create(&cfg.scorer.name)?;

    let detector = Arc::new(TilingDetector::new(
        scorer,
        SharedDetectorConfig::new(cfg.detector.clone()),
    ));
    detector.load()?;

    let mut source = open_source(SourceConfig {
        url: cfg.source.url.clone(),
        target_fps: cfg.source.target_fps,
        width: cfg.source.width,
        height: cfg.source.height,
    })?;
    source.connect()?;

    let store = SqliteClipStore::open(&cfg.db_path)?;
    let device = SpoolCapture::new();
    let feeder = device.clone();
    let recorder = Recorder::new(device, store, cfg.recording);
    let mut pipeline = Pipeline::new(DetectionWorker::spawn(Arc::clone(&detector))?, recorder);
    if let Some(filter) = cfg.motion.clone() {
        pipeline = pipeline.with_motion_gate(filter);
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let frame_interval = Duration::from_secs_f64(1.0 / cfg.source.target_fps as f64);
    log::info!("recorderd running. writing clips to {}", cfg.db_path);
    log::info!(
        "scorer={} grid={} overlap={:.2} confidence={:.2} labels={:?}",
        detector.scorer_name(),
        cfg.detector.tile_grid,
        cfg.detector.tile_overlap,
        cfg.detector.confidence_threshold,
        cfg.detector.target_labels
    );

    let mut next_cycle = Instant::now();
    let mut last_health_log = Instant::now();
    let mut frames = 0u64;
    let mut clips_saved = 0u64;

    loop {
        let loop_start = Instant::now();
        let stopping = shutdown.load(Ordering::SeqCst)
            || args
                .max_cycles
                .is_some_and(|max| pipeline.stats().ticks >= max);
        if stopping {
            if pipeline.is_scheduling() {
                log::info!("shutdown requested; finalizing");
                pipeline.stop_scheduling();
            }
            // A cycle still in flight may start a recording; stop that too.
            pipeline.request_stop(loop_start);
            pipeline.poll(loop_start);
            if pipeline.is_quiescent() {
                break;
            }
        }

        let frame = match source.next_frame() {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("frame source error: {:#}", e);
                pipeline.poll(loop_start);
                std::thread::sleep(frame_interval);
                continue;
            }
        };
        frames += 1;
        feeder.feed(&frame);

        if loop_start >= next_cycle {
            pipeline.tick(loop_start, &frame);
            next_cycle = loop_start + cfg.cycle_period;
        } else {
            pipeline.poll(loop_start);
        }

        for event in pipeline.recorder_mut().drain_events() {
            match event {
                RecorderEvent::ClipSaved {
                    id,
                    size_bytes,
                    reason,
                } => {
                    clips_saved += 1;
                    log::info!(
                        "clip #{} saved: id={} bytes={} stop={:?}",
                        clips_saved,
                        id,
                        size_bytes,
                        reason
                    );
                }
                RecorderEvent::Error(err) => log::warn!("recorder error: {}", err),
                RecorderEvent::StateChanged { .. } => {}
            }
        }

        if last_health_log.elapsed() >= Duration::from_secs(5) {
            let stats = source.stats();
            let pipe = pipeline.stats();
            log::info!(
                "source health={} frames={} url={} cycles={} dropped={} errors={} state={:?}",
                source.is_healthy(),
                stats.frames_captured,
                stats.url,
                pipe.cycles_completed,
                pipe.dropped_busy,
                pipe.cycle_errors,
                pipeline.recorder().state()
            );
            last_health_log = Instant::now();
        }

        if let Some(remaining) = frame_interval.checked_sub(loop_start.elapsed()) {
            std::thread::sleep(remaining);
        }
    }

    let stats = pipeline.stats();
    let recorder = pipeline.shutdown()?;
    log::info!(
        "recorderd stopped: {} frames, {} cycles, {} clips saved this run, state={:?}",
        frames,
        stats.cycles_completed,
        clips_saved,
        recorder.state()
    );
    Ok(())
}
