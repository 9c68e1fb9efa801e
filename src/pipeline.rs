//! Cycle scheduling: frame -> motion gate -> detector worker -> recorder.
//!
//! Detection runs on one background worker fed through a capacity-1 queue.
//! A tick that arrives while a cycle is still in flight is dropped, so at
//! most one scorer invocation exists at any time.
//!
//! Detector configuration is shared state read by the worker while it runs;
//! a change made mid-cycle may apply to the remaining tiles of that cycle.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::capture::CaptureDevice;
use crate::detect::{Detection, TilingDetector};
use crate::error::RecorderError;
use crate::frame::Frame;
use crate::geometry::TileRect;
use crate::motion::MotionFilter;
use crate::recorder::{Recorder, RecorderState};
use crate::storage::ClipStore;

/// Size of the downsampled buffer the motion gate compares.
pub const MOTION_SAMPLE_WIDTH: u32 = 64;
pub const MOTION_SAMPLE_HEIGHT: u32 = 48;

/// Result of one detection cycle.
#[derive(Debug)]
pub struct CycleOutcome {
    pub result: Result<Vec<Detection>, RecorderError>,
    pub elapsed: Duration,
}

/// Background thread owning the detector.
pub struct DetectionWorker {
    detector: Arc<TilingDetector>,
    tx: Option<SyncSender<Frame>>,
    outcomes: Receiver<CycleOutcome>,
    busy: AtomicBool,
    join: Option<JoinHandle<()>>,
}

impl DetectionWorker {
    pub fn spawn(detector: Arc<TilingDetector>) -> Result<Self> {
        let (tx, rx) = mpsc::sync_channel::<Frame>(1);
        let (out_tx, outcomes) = mpsc::channel();
        let busy = AtomicBool::new(false);

        let worker_detector = Arc::clone(&detector);
        let join = std::thread::Builder::new()
            .name("detect-worker".to_string())
            .spawn(move || {
                while let Ok(frame) = rx.recv() {
                    let started = Instant::now();
                    // A panicking scorer fails its cycle, not the worker.
                    let result = panic::catch_unwind(AssertUnwindSafe(|| {
                        worker_detector.detect(&frame)
                    }))
                    .unwrap_or_else(|payload| {
                        Err(RecorderError::Scorer(format!(
                            "scorer panicked: {}",
                            panic_message(payload.as_ref())
                        )))
                    });
                    let outcome = CycleOutcome {
                        result,
                        elapsed: started.elapsed(),
                    };
                    if out_tx.send(outcome).is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| anyhow!("failed to spawn detection worker: {}", e))?;

        Ok(Self {
            detector,
            tx: Some(tx),
            outcomes,
            busy,
            join: Some(join),
        })
    }

    pub fn detector(&self) -> &Arc<TilingDetector> {
        &self.detector
    }

    /// True from a successful `submit` until its outcome has been taken.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Queue a cycle.
    ///
    /// `Ok(false)` means the previous cycle is still running and the frame
    /// was dropped. An error means the worker thread is gone.
    pub fn submit(&self, frame: Frame) -> Result<bool, RecorderError> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(worker_gone());
        };
        if self.busy.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        match tx.try_send(frame) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => {
                self.busy.store(false, Ordering::Release);
                Ok(false)
            }
            Err(TrySendError::Disconnected(_)) => {
                self.busy.store(false, Ordering::Release);
                Err(worker_gone())
            }
        }
    }

    pub fn try_outcome(&self) -> Option<CycleOutcome> {
        match self.outcomes.try_recv() {
            Ok(outcome) => Some(self.collected(outcome)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => self.lost_cycle(),
        }
    }

    /// Block up to `timeout` for the in-flight cycle.
    pub fn wait_outcome(&self, timeout: Duration) -> Option<CycleOutcome> {
        match self.outcomes.recv_timeout(timeout) {
            Ok(outcome) => Some(self.collected(outcome)),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => self.lost_cycle(),
        }
    }

    fn collected(&self, outcome: CycleOutcome) -> CycleOutcome {
        self.busy.store(false, Ordering::Release);
        outcome
    }

    /// The worker exited with a cycle still claimed: report that cycle as
    /// failed, once, and free the slot.
    fn lost_cycle(&self) -> Option<CycleOutcome> {
        if !self.busy.swap(false, Ordering::AcqRel) {
            return None;
        }
        Some(CycleOutcome {
            result: Err(RecorderError::Scorer(
                "detection worker exited mid-cycle".to_string(),
            )),
            elapsed: Duration::ZERO,
        })
    }

    /// Stop accepting work and join the thread after its current cycle.
    pub fn shutdown(mut self) -> Result<()> {
        self.tx.take();
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("detection worker thread panicked"))?;
        }
        Ok(())
    }
}

fn worker_gone() -> RecorderError {
    RecorderError::Scorer("detection worker is not running".to_string())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl Drop for DetectionWorker {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub ticks: u64,
    pub cycles_submitted: u64,
    pub cycles_completed: u64,
    pub cycle_errors: u64,
    /// Ticks dropped because a cycle was still in flight.
    pub dropped_busy: u64,
    /// Ticks skipped because the motion gate saw a static scene.
    pub skipped_static: u64,
    /// Ticks skipped because the recorder was cooling down, paused or stopping.
    pub skipped_state: u64,
}

pub struct Pipeline<D: CaptureDevice, S: ClipStore> {
    worker: DetectionWorker,
    recorder: Recorder<D, S>,
    motion: Option<MotionFilter>,
    previous_sample: Option<Frame>,
    overlay: Vec<Detection>,
    scheduling: bool,
    in_flight: bool,
    stats: PipelineStats,
}

impl<D: CaptureDevice, S: ClipStore> Pipeline<D, S> {
    pub fn new(worker: DetectionWorker, recorder: Recorder<D, S>) -> Self {
        Self {
            worker,
            recorder,
            motion: None,
            previous_sample: None,
            overlay: Vec::new(),
            scheduling: true,
            in_flight: false,
            stats: PipelineStats::default(),
        }
    }

    /// Gate cycles behind a motion check while the recorder is idle.
    pub fn with_motion_gate(mut self, filter: MotionFilter) -> Self {
        self.motion = Some(filter);
        self
    }

    pub fn recorder(&self) -> &Recorder<D, S> {
        &self.recorder
    }

    pub fn recorder_mut(&mut self) -> &mut Recorder<D, S> {
        &mut self.recorder
    }

    pub fn worker(&self) -> &DetectionWorker {
        &self.worker
    }

    /// Detections from the latest applied cycle.
    pub fn overlay(&self) -> &[Detection] {
        &self.overlay
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn is_scheduling(&self) -> bool {
        self.scheduling
    }

    /// Cancel future cycles. An in-flight cycle and an active recording are
    /// left to complete.
    pub fn stop_scheduling(&mut self) {
        if self.scheduling {
            log::info!("detection scheduling stopped");
        }
        self.scheduling = false;
    }

    pub fn resume_scheduling(&mut self) {
        self.scheduling = true;
    }

    /// One scheduler tick at `now` with the latest frame.
    pub fn tick(&mut self, now: Instant, frame: &Frame) {
        self.stats.ticks += 1;
        self.poll(now);

        if !self.scheduling {
            return;
        }
        if !self.recorder.accepts_cycles() {
            self.overlay.clear();
            self.stats.skipped_state += 1;
            return;
        }
        if !self.motion_allows(frame) {
            self.stats.skipped_static += 1;
            return;
        }
        match self.worker.submit(frame.clone()) {
            Ok(true) => {
                self.in_flight = true;
                self.stats.cycles_submitted += 1;
            }
            Ok(false) => {
                self.stats.dropped_busy += 1;
                log::debug!("tick dropped: detection cycle still running");
            }
            Err(err) => {
                self.stats.cycle_errors += 1;
                self.recorder.on_cycle_error(err);
            }
        }
    }

    /// Wait up to `timeout` for the in-flight cycle and apply it.
    ///
    /// Returns false when nothing completed in time.
    pub fn settle(&mut self, now: Instant, timeout: Duration) -> bool {
        if let Some(outcome) = self.worker.try_outcome() {
            self.apply(now, outcome);
            return true;
        }
        if !self.in_flight {
            return false;
        }
        match self.worker.wait_outcome(timeout) {
            Some(outcome) => {
                self.apply(now, outcome);
                true
            }
            None => false,
        }
    }

    /// Apply finished cycles and advance timers; never starts a cycle.
    pub fn poll(&mut self, now: Instant) {
        while let Some(outcome) = self.worker.try_outcome() {
            self.apply(now, outcome);
        }
        self.recorder.poll(now);
    }

    pub fn request_stop(&mut self, now: Instant) -> bool {
        self.recorder.request_stop(now)
    }

    /// True once no cycle is in flight and no capture is pending.
    pub fn is_quiescent(&self) -> bool {
        !self.in_flight
            && !matches!(
                self.recorder.state(),
                RecorderState::Recording | RecorderState::Stopping
            )
    }

    /// Stop the worker thread.
    pub fn shutdown(self) -> Result<Recorder<D, S>> {
        let Pipeline {
            worker, recorder, ..
        } = self;
        worker.shutdown()?;
        Ok(recorder)
    }

    fn apply(&mut self, now: Instant, outcome: CycleOutcome) {
        self.in_flight = false;
        self.stats.cycles_completed += 1;
        match outcome.result {
            Ok(detections) => {
                log::debug!(
                    "cycle: {} detections in {}ms",
                    detections.len(),
                    outcome.elapsed.as_millis()
                );
                if self.recorder.accepts_cycles() {
                    self.overlay = detections.clone();
                } else {
                    self.overlay.clear();
                }
                self.recorder.on_cycle(now, &detections);
            }
            Err(err) => {
                self.stats.cycle_errors += 1;
                self.recorder.on_cycle_error(err);
            }
        }
    }

    fn motion_allows(&mut self, frame: &Frame) -> bool {
        let Some(filter) = self.motion.as_ref() else {
            return true;
        };
        let sample = frame.render_into(
            TileRect::full(frame.width(), frame.height()),
            MOTION_SAMPLE_WIDTH,
            MOTION_SAMPLE_HEIGHT,
        );
        let result = filter.detect(Some(&sample), self.previous_sample.as_ref());
        self.previous_sample = Some(sample);
        // Once something is being tracked, absent cycles must keep flowing.
        self.recorder.state() != RecorderState::Idle || result.changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::SpoolCapture;
    use crate::detect::{DetectorConfig, RawDetection, ScriptedScorer, SharedDetectorConfig};
    use crate::recorder::{RecorderEvent, RecorderSettings};
    use crate::storage::InMemoryClipStore;

    const WAIT: Duration = Duration::from_secs(5);

    fn person() -> RawDetection {
        RawDetection::new("person", 0.9, [2.0, 2.0, 8.0, 8.0])
    }

    fn detector(scorer: ScriptedScorer) -> Arc<TilingDetector> {
        let detector = TilingDetector::new(
            Box::new(scorer),
            SharedDetectorConfig::new(DetectorConfig::default()),
        );
        detector.load().unwrap();
        Arc::new(detector)
    }

    fn pipeline(scorer: ScriptedScorer) -> (Pipeline<SpoolCapture, InMemoryClipStore>, SpoolCapture) {
        let device = SpoolCapture::new();
        let feeder = device.clone();
        let recorder = Recorder::new(
            device,
            InMemoryClipStore::new(),
            RecorderSettings {
                grace_period: Duration::from_secs(2),
                cooldown: Duration::from_secs(3),
                capture_max_duration: None,
            },
        );
        let worker = DetectionWorker::spawn(detector(scorer)).unwrap();
        (Pipeline::new(worker, recorder), feeder)
    }

    fn scorer_errors(pipe: &mut Pipeline<SpoolCapture, InMemoryClipStore>) -> Vec<RecorderError> {
        pipe.recorder_mut()
            .drain_events()
            .into_iter()
            .filter_map(|event| match event {
                RecorderEvent::Error(err) => Some(err),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn worker_holds_the_slot_until_the_outcome_is_taken() {
        let worker = DetectionWorker::spawn(detector(ScriptedScorer::new())).unwrap();
        let frame = Frame::solid(8, 8, [0, 0, 0]);
        assert!(worker.submit(frame.clone()).unwrap());
        assert!(worker.is_busy());
        // Finished or not, the unread outcome keeps the slot taken.
        assert!(!worker.submit(frame.clone()).unwrap());

        let outcome = worker.wait_outcome(WAIT).unwrap();
        assert!(outcome.result.unwrap().is_empty());
        assert!(!worker.is_busy());
        assert!(worker.try_outcome().is_none());

        assert!(worker.submit(frame).unwrap());
        assert!(worker.wait_outcome(WAIT).is_some());
        worker.shutdown().unwrap();
    }

    #[test]
    fn tick_is_dropped_while_a_cycle_is_in_flight() {
        let (mut pipe, _) = pipeline(
            ScriptedScorer::new()
                .with_score_delay(Duration::from_millis(300))
                .with_fallback(vec![person()]),
        );
        let frame = Frame::solid(16, 16, [0, 0, 0]);
        let t0 = Instant::now();

        pipe.tick(t0, &frame);
        pipe.tick(t0 + Duration::from_millis(100), &frame);
        assert_eq!(pipe.stats().cycles_submitted, 1);
        assert_eq!(pipe.stats().dropped_busy, 1);
        assert!(!pipe.is_quiescent());

        assert!(pipe.settle(t0 + Duration::from_millis(100), WAIT));
        assert!(pipe.is_quiescent());
        assert_eq!(pipe.recorder().state(), RecorderState::Detecting);

        pipe.tick(t0 + Duration::from_millis(500), &frame);
        assert_eq!(pipe.stats().cycles_submitted, 2);
        assert_eq!(pipe.stats().dropped_busy, 1);
        assert!(pipe.settle(t0 + Duration::from_millis(500), WAIT));
        assert_eq!(pipe.recorder().state(), RecorderState::Recording);
    }

    #[test]
    fn scorer_panic_fails_one_cycle_and_the_schedule_continues() {
        let (mut pipe, _) = pipeline(
            ScriptedScorer::new()
                .then_panic("tensor shape mismatch")
                .with_fallback(vec![person()]),
        );
        let frame = Frame::solid(16, 16, [0, 0, 0]);
        let t0 = Instant::now();

        pipe.tick(t0, &frame);
        assert!(pipe.settle(t0, WAIT));
        assert!(pipe.is_quiescent());
        assert_eq!(pipe.stats().cycle_errors, 1);
        let errors = scorer_errors(&mut pipe);
        assert_eq!(errors.len(), 1);
        assert!(
            matches!(&errors[0], RecorderError::Scorer(msg) if msg.contains("tensor shape mismatch")),
            "{:?}",
            errors
        );

        for i in 1..=2u32 {
            let now = t0 + Duration::from_millis(500) * i;
            pipe.tick(now, &frame);
            assert!(pipe.settle(now, WAIT));
        }
        let stats = pipe.stats();
        assert_eq!(stats.cycles_completed, 3);
        assert_eq!(stats.cycle_errors, 1);
        assert_eq!(stats.dropped_busy, 0);
        assert_eq!(pipe.recorder().state(), RecorderState::Recording);
        assert!(scorer_errors(&mut pipe).is_empty());
        pipe.shutdown().unwrap();
    }

    #[test]
    fn poll_applies_a_finished_cycle_without_ticking() {
        let (mut pipe, _) = pipeline(ScriptedScorer::new().with_fallback(vec![person()]));
        let frame = Frame::solid(16, 16, [0, 0, 0]);
        let t0 = Instant::now();
        pipe.tick(t0, &frame);
        assert!(!pipe.is_quiescent());

        let deadline = Instant::now() + WAIT;
        while !pipe.is_quiescent() && Instant::now() < deadline {
            pipe.poll(t0);
            std::thread::yield_now();
        }
        assert!(pipe.is_quiescent());
        assert_eq!(pipe.stats().ticks, 1);
        assert_eq!(pipe.stats().cycles_completed, 1);
        assert_eq!(pipe.recorder().state(), RecorderState::Detecting);
    }

    #[test]
    fn worker_reports_not_ready_for_unloaded_detector() {
        let detector = Arc::new(TilingDetector::new(
            Box::new(ScriptedScorer::new()),
            SharedDetectorConfig::default(),
        ));
        let worker = DetectionWorker::spawn(detector).unwrap();
        assert!(worker.submit(Frame::solid(4, 4, [0, 0, 0])).unwrap());
        let outcome = worker.wait_outcome(WAIT).unwrap();
        assert!(matches!(outcome.result, Err(RecorderError::NotReady(_))));
    }

    #[test]
    fn two_positive_cycles_start_recording() {
        let (mut pipe, _) = pipeline(ScriptedScorer::new().with_fallback(vec![person()]));
        let frame = Frame::solid(32, 32, [10, 10, 10]);
        let t0 = Instant::now();

        pipe.tick(t0, &frame);
        assert!(pipe.settle(t0, WAIT));
        assert_eq!(pipe.recorder().state(), RecorderState::Detecting);
        assert_eq!(pipe.overlay().len(), 1);

        pipe.tick(t0 + Duration::from_millis(500), &frame);
        assert!(pipe.settle(t0 + Duration::from_millis(500), WAIT));
        assert_eq!(pipe.recorder().state(), RecorderState::Recording);
    }

    #[test]
    fn cycle_errors_do_not_stop_the_schedule() {
        let (mut pipe, _) = pipeline(
            ScriptedScorer::new()
                .then_fail("model crashed")
                .with_fallback(vec![person()]),
        );
        let frame = Frame::solid(16, 16, [0, 0, 0]);
        let t0 = Instant::now();
        pipe.tick(t0, &frame);
        assert!(pipe.settle(t0, WAIT));
        assert_eq!(pipe.stats().cycle_errors, 1);
        assert_eq!(pipe.recorder().state(), RecorderState::Idle);

        pipe.tick(t0, &frame);
        assert!(pipe.settle(t0, WAIT));
        assert_eq!(pipe.recorder().state(), RecorderState::Detecting);
    }

    #[test]
    fn cooldown_skips_cycles_and_clears_overlay() {
        let (mut pipe, feeder) = pipeline(
            ScriptedScorer::new()
                .then(vec![person()])
                .then(vec![person()])
                .with_fallback(Vec::new()),
        );
        let frame = Frame::solid(16, 16, [0, 0, 0]);
        let t0 = Instant::now();
        for _ in 0..2 {
            pipe.tick(t0, &frame);
            assert!(pipe.settle(t0, WAIT));
        }
        assert_eq!(pipe.recorder().state(), RecorderState::Recording);
        feeder.feed(&frame);

        let t1 = t0 + Duration::from_secs(1);
        pipe.tick(t1, &frame);
        assert!(pipe.settle(t1, WAIT));
        assert!(pipe.overlay().is_empty());

        // Grace of 2s from the last sighting at t0.
        let t2 = t0 + Duration::from_secs(2);
        pipe.tick(t2, &frame);
        assert_eq!(pipe.recorder().state(), RecorderState::Cooldown);
        assert_eq!(pipe.stats().skipped_state, 1);
        assert_eq!(pipe.recorder().store().stats().unwrap().count, 1);

        pipe.tick(t2 + Duration::from_secs(3), &frame);
        assert_eq!(pipe.recorder().state(), RecorderState::Idle);
    }

    #[test]
    fn stop_scheduling_leaves_recording_running() {
        let (mut pipe, feeder) = pipeline(ScriptedScorer::new().with_fallback(vec![person()]));
        let frame = Frame::solid(16, 16, [0, 0, 0]);
        let t0 = Instant::now();
        for _ in 0..2 {
            pipe.tick(t0, &frame);
            assert!(pipe.settle(t0, WAIT));
        }
        feeder.feed(&frame);

        pipe.stop_scheduling();
        let submitted = pipe.stats().cycles_submitted;
        pipe.tick(t0 + Duration::from_secs(10), &frame);
        assert_eq!(pipe.stats().cycles_submitted, submitted);
        assert_eq!(pipe.recorder().state(), RecorderState::Recording);
        assert!(!pipe.is_quiescent());

        assert!(pipe.request_stop(t0 + Duration::from_secs(11)));
        assert_eq!(pipe.recorder().state(), RecorderState::Paused);
        assert!(pipe.is_quiescent());
        pipe.shutdown().unwrap();
    }

    #[test]
    fn motion_gate_skips_static_scene_while_idle() {
        let (pipe, _) = pipeline(ScriptedScorer::new());
        let mut pipe = pipe.with_motion_gate(MotionFilter::default());
        let still = Frame::solid(64, 48, [20, 20, 20]);
        let t0 = Instant::now();

        pipe.tick(t0, &still);
        pipe.tick(t0, &still);
        assert_eq!(pipe.stats().skipped_static, 2);
        assert_eq!(pipe.stats().cycles_submitted, 0);

        let moved = Frame::solid(64, 48, [200, 200, 200]);
        pipe.tick(t0, &moved);
        assert_eq!(pipe.stats().cycles_submitted, 1);
        assert!(pipe.settle(t0, WAIT));
    }
}
