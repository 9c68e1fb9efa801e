//! Presence-driven recording state machine.
//!
//! ```text
//!  idle --present--> detecting --present--> recording --stop--> stopping
//!   ^                   |                    |  ^                 |
//!   +------absent-------+                    +--+ present/absent  +--manual--> paused --resume--> idle
//!   ^                                                             +--auto----> cooldown --elapsed--> idle
//!   +-------------------------- empty / failed capture or failed save --------+
//! ```
//!
//! Entering `recording` takes two consecutive positive cycles; a single
//! positive only reaches `detecting`. At most one capture session exists.
//!
//! Time is supplied by the caller on every operation. Timers are deadlines
//! checked by `poll`, so the auto-stop always fires at
//! `last_seen + grace_period` however many times the object flickers in and
//! out of view.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::capture::{CaptureBlob, CaptureDevice, CaptureHandle, CaptureOptions};
use crate::detect::Detection;
use crate::error::RecorderError;
use crate::storage::{ClipId, ClipStore};

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecorderState {
    Idle,
    Detecting,
    Recording,
    Stopping,
    Cooldown,
    Paused,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Manual,
    Auto,
    None,
}

/// Bookkeeping for the active capture session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordingSession {
    pub started_at: Instant,
    pub last_seen: Instant,
    pub stop_reason: StopReason,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecorderSettings {
    /// Continuous absence tolerated before an auto-stop.
    pub grace_period: Duration,
    /// Quiet period after an auto-stopped clip is saved.
    pub cooldown: Duration,
    /// Bound for each capture session; `None` records until stopped.
    pub capture_max_duration: Option<Duration>,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            cooldown: DEFAULT_COOLDOWN,
            capture_max_duration: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum RecorderEvent {
    StateChanged {
        from: RecorderState,
        to: RecorderState,
    },
    ClipSaved {
        id: ClipId,
        size_bytes: u64,
        reason: StopReason,
    },
    Error(RecorderError),
}

pub struct Recorder<D: CaptureDevice, S: ClipStore> {
    state: RecorderState,
    settings: RecorderSettings,
    device: D,
    store: S,
    session: Option<RecordingSession>,
    capture: Option<CaptureHandle>,
    sighted_at: Option<Instant>,
    stop_deadline: Option<Instant>,
    cooldown_until: Option<Instant>,
    events: Vec<RecorderEvent>,
}

impl<D: CaptureDevice, S: ClipStore> Recorder<D, S> {
    pub fn new(device: D, store: S, settings: RecorderSettings) -> Self {
        Self {
            state: RecorderState::Idle,
            settings,
            device,
            store,
            session: None,
            capture: None,
            sighted_at: None,
            stop_deadline: None,
            cooldown_until: None,
            events: Vec::new(),
        }
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    pub fn settings(&self) -> &RecorderSettings {
        &self.settings
    }

    pub fn session(&self) -> Option<&RecordingSession> {
        self.session.as_ref()
    }

    /// When the current `detecting` streak began.
    pub fn sighted_at(&self) -> Option<Instant> {
        self.sighted_at
    }

    /// Pending auto-stop deadline, if one is scheduled.
    pub fn stop_deadline(&self) -> Option<Instant> {
        self.stop_deadline
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// False while cooling down, paused or stopping: no scorer work is wanted.
    pub fn accepts_cycles(&self) -> bool {
        !matches!(
            self.state,
            RecorderState::Cooldown | RecorderState::Paused | RecorderState::Stopping
        )
    }

    /// Take the events produced since the last call.
    pub fn drain_events(&mut self) -> Vec<RecorderEvent> {
        std::mem::take(&mut self.events)
    }

    /// Feed the outcome of one detection cycle.
    ///
    /// The target object is present when the (already filtered) detection
    /// list is non-empty.
    pub fn on_cycle(&mut self, now: Instant, detections: &[Detection]) {
        let present = !detections.is_empty();
        match self.state {
            RecorderState::Idle => {
                if present {
                    self.sighted_at = Some(now);
                    self.transition(RecorderState::Detecting);
                }
            }
            RecorderState::Detecting => {
                if present {
                    self.begin_capture(now);
                } else {
                    self.sighted_at = None;
                    self.transition(RecorderState::Idle);
                }
            }
            RecorderState::Recording => {
                let grace = self.settings.grace_period;
                let Some(session) = self.session.as_mut() else {
                    return;
                };
                if present {
                    session.last_seen = now;
                    if self.stop_deadline.take().is_some() {
                        log::debug!("object back in view; auto-stop cancelled");
                    }
                } else if self.stop_deadline.is_none() {
                    let deadline = session.last_seen + grace;
                    log::debug!(
                        "object absent; auto-stop in {}ms",
                        deadline.saturating_duration_since(now).as_millis()
                    );
                    self.stop_deadline = Some(deadline);
                }
            }
            RecorderState::Stopping | RecorderState::Cooldown | RecorderState::Paused => {
                log::debug!("cycle result ignored in state {:?}", self.state);
            }
        }
    }

    /// Report a failed detection cycle. The schedule carries on.
    pub fn on_cycle_error(&mut self, err: RecorderError) {
        log::warn!("detection cycle skipped: {}", err);
        self.events.push(RecorderEvent::Error(err));
    }

    /// Advance timers and pending capture finalization.
    pub fn poll(&mut self, now: Instant) {
        match self.state {
            RecorderState::Recording => {
                let resolved = self.capture.as_ref().and_then(CaptureHandle::try_result);
                if let Some(result) = resolved {
                    // Bounded session ran out on its own.
                    log::info!("capture session ended by device");
                    self.stop_deadline = None;
                    if let Some(session) = self.session.as_mut() {
                        session.stop_reason = StopReason::Auto;
                    }
                    self.transition(RecorderState::Stopping);
                    self.finish(now, result);
                } else if self.stop_deadline.is_some_and(|deadline| now >= deadline) {
                    log::info!("object absent for grace period; stopping");
                    self.signal_stop(now, StopReason::Auto);
                }
            }
            RecorderState::Stopping => self.try_finish(now),
            RecorderState::Cooldown => {
                if self.cooldown_until.is_some_and(|until| now >= until) {
                    self.cooldown_until = None;
                    self.transition(RecorderState::Idle);
                }
            }
            RecorderState::Idle | RecorderState::Detecting | RecorderState::Paused => {}
        }
    }

    /// Manual stop. Only meaningful while recording; returns false otherwise.
    pub fn request_stop(&mut self, now: Instant) -> bool {
        if self.state != RecorderState::Recording {
            return false;
        }
        self.signal_stop(now, StopReason::Manual);
        true
    }

    /// Pause from `idle` or `detecting`. Returns false in any other state.
    pub fn pause(&mut self) -> bool {
        match self.state {
            RecorderState::Idle | RecorderState::Detecting => {
                self.sighted_at = None;
                self.transition(RecorderState::Paused);
                true
            }
            _ => false,
        }
    }

    /// Resume from `paused`. Returns false in any other state.
    pub fn resume(&mut self) -> bool {
        if self.state != RecorderState::Paused {
            return false;
        }
        self.transition(RecorderState::Idle);
        true
    }

    fn begin_capture(&mut self, now: Instant) {
        let options = match self.settings.capture_max_duration {
            Some(max) => CaptureOptions::bounded(max),
            None => CaptureOptions::indefinite(),
        };
        match self.device.start(options) {
            Ok(handle) => {
                self.capture = Some(handle);
                self.session = Some(RecordingSession {
                    started_at: now,
                    last_seen: now,
                    stop_reason: StopReason::None,
                });
                self.stop_deadline = None;
                self.sighted_at = None;
                self.transition(RecorderState::Recording);
            }
            Err(err) => {
                self.report(err);
                self.sighted_at = None;
                self.transition(RecorderState::Idle);
            }
        }
    }

    fn signal_stop(&mut self, now: Instant, reason: StopReason) {
        self.stop_deadline = None;
        if let Some(session) = self.session.as_mut() {
            session.stop_reason = reason;
        }
        self.transition(RecorderState::Stopping);
        self.device.stop();
        self.try_finish(now);
    }

    fn try_finish(&mut self, now: Instant) {
        let resolved = self.capture.as_ref().and_then(CaptureHandle::try_result);
        if let Some(result) = resolved {
            self.finish(now, result);
        }
    }

    fn finish(&mut self, now: Instant, result: Result<CaptureBlob, RecorderError>) {
        self.capture = None;
        let reason = self
            .session
            .take()
            .map(|session| session.stop_reason)
            .unwrap_or(StopReason::None);

        let blob = match result {
            Ok(blob) if blob.is_empty() => {
                self.report(RecorderError::Capture(
                    "capture produced no data".to_string(),
                ));
                self.transition(RecorderState::Idle);
                return;
            }
            Ok(blob) => blob,
            Err(err) => {
                self.report(err);
                self.transition(RecorderState::Idle);
                return;
            }
        };

        let id = match self.store.save(&blob, None) {
            Ok(id) => id,
            Err(err) => {
                self.report(RecorderError::persistence(format!("{:#}", err)));
                self.transition(RecorderState::Idle);
                return;
            }
        };
        let size_bytes = blob.data.len() as u64;
        log::info!("clip {} saved ({} bytes, {:?} stop)", id, size_bytes, reason);
        self.events.push(RecorderEvent::ClipSaved {
            id,
            size_bytes,
            reason,
        });

        if reason == StopReason::Manual {
            self.transition(RecorderState::Paused);
        } else {
            self.cooldown_until = Some(now + self.settings.cooldown);
            self.transition(RecorderState::Cooldown);
        }
    }

    fn report(&mut self, err: RecorderError) {
        log::error!("{}", err);
        self.events.push(RecorderEvent::Error(err));
    }

    fn transition(&mut self, to: RecorderState) {
        let from = self.state;
        if from == to {
            return;
        }
        log::info!("recorder: {:?} -> {:?}", from, to);
        self.state = to;
        self.events.push(RecorderEvent::StateChanged { from, to });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::SpoolCapture;
    use crate::frame::Frame;
    use crate::geometry::BoundingBox;
    use crate::storage::InMemoryClipStore;

    type TestRecorder = Recorder<SpoolCapture, InMemoryClipStore>;

    fn person() -> Vec<Detection> {
        vec![Detection::new(
            "person",
            0.9,
            BoundingBox::new(1.0, 1.0, 10.0, 10.0),
        )]
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn recorder(grace: u64, cooldown: u64) -> (TestRecorder, SpoolCapture) {
        let device = SpoolCapture::new();
        let feeder = device.clone();
        let settings = RecorderSettings {
            grace_period: secs(grace),
            cooldown: secs(cooldown),
            capture_max_duration: None,
        };
        (
            Recorder::new(device, InMemoryClipStore::new(), settings),
            feeder,
        )
    }

    fn start_recording(rec: &mut TestRecorder, feeder: &SpoolCapture, t0: Instant) {
        rec.on_cycle(t0, &person());
        rec.on_cycle(t0, &person());
        assert_eq!(rec.state(), RecorderState::Recording);
        assert!(feeder.feed(&Frame::solid(2, 2, [9, 9, 9])));
    }

    fn errors(events: &[RecorderEvent]) -> Vec<RecorderError> {
        events
            .iter()
            .filter_map(|e| match e {
                RecorderEvent::Error(err) => Some(err.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn single_positive_cycle_only_reaches_detecting() {
        let (mut rec, _) = recorder(5, 10);
        let t0 = Instant::now();
        rec.on_cycle(t0, &person());
        assert_eq!(rec.state(), RecorderState::Detecting);
        assert_eq!(rec.sighted_at(), Some(t0));
        assert!(!rec.device().is_active());

        rec.on_cycle(t0 + secs(1), &[]);
        assert_eq!(rec.state(), RecorderState::Idle);
        assert!(rec.session().is_none());
    }

    #[test]
    fn two_consecutive_positives_start_recording() {
        let (mut rec, _) = recorder(5, 10);
        let t0 = Instant::now();
        rec.on_cycle(t0, &person());
        rec.on_cycle(t0 + secs(1), &person());
        assert_eq!(rec.state(), RecorderState::Recording);
        assert!(rec.device().is_active());
        let session = rec.session().unwrap();
        assert_eq!(session.started_at, t0 + secs(1));
        assert_eq!(session.stop_reason, StopReason::None);
    }

    #[test]
    fn reappearance_cancels_pending_auto_stop() {
        let (mut rec, feeder) = recorder(10, 10);
        let t0 = Instant::now();
        start_recording(&mut rec, &feeder, t0);

        rec.on_cycle(t0 + secs(1), &[]);
        assert_eq!(rec.stop_deadline(), Some(t0 + secs(10)));

        rec.on_cycle(t0 + secs(5), &person());
        assert_eq!(rec.stop_deadline(), None);

        rec.poll(t0 + secs(10));
        assert_eq!(rec.state(), RecorderState::Recording);

        // Next absence counts from the refreshed sighting.
        rec.on_cycle(t0 + secs(11), &[]);
        assert_eq!(rec.stop_deadline(), Some(t0 + secs(15)));
        rec.poll(t0 + secs(14));
        assert_eq!(rec.state(), RecorderState::Recording);
        rec.poll(t0 + secs(15));
        assert_eq!(rec.state(), RecorderState::Cooldown);
    }

    #[test]
    fn deadline_is_measured_from_last_sighting_not_first_absence() {
        let (mut rec, feeder) = recorder(5, 10);
        let t0 = Instant::now();
        start_recording(&mut rec, &feeder, t0);
        rec.on_cycle(t0 + secs(3), &[]);
        assert_eq!(rec.stop_deadline(), Some(t0 + secs(5)));
        // Further absent cycles do not push the deadline out.
        rec.on_cycle(t0 + secs(4), &[]);
        assert_eq!(rec.stop_deadline(), Some(t0 + secs(5)));
    }

    #[test]
    fn auto_stop_saves_clip_then_cools_down_to_idle() {
        let (mut rec, feeder) = recorder(5, 10);
        let t0 = Instant::now();
        start_recording(&mut rec, &feeder, t0);
        rec.on_cycle(t0 + secs(1), &[]);
        rec.drain_events();

        rec.poll(t0 + secs(5));
        assert_eq!(rec.state(), RecorderState::Cooldown);
        assert!(!rec.accepts_cycles());
        let events = rec.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            RecorderEvent::ClipSaved {
                reason: StopReason::Auto,
                ..
            }
        )));
        assert_eq!(rec.store().stats().unwrap().count, 1);

        // Cycles during cooldown change nothing.
        rec.on_cycle(t0 + secs(6), &person());
        assert_eq!(rec.state(), RecorderState::Cooldown);

        rec.poll(t0 + secs(14));
        assert_eq!(rec.state(), RecorderState::Cooldown);
        rec.poll(t0 + secs(15));
        assert_eq!(rec.state(), RecorderState::Idle);
        assert!(rec.accepts_cycles());
    }

    #[test]
    fn manual_stop_saves_clip_and_pauses() {
        let (mut rec, feeder) = recorder(5, 10);
        let t0 = Instant::now();
        start_recording(&mut rec, &feeder, t0);

        assert!(rec.request_stop(t0 + secs(2)));
        assert_eq!(rec.state(), RecorderState::Paused);
        assert_eq!(rec.store().stats().unwrap().count, 1);
        assert!(!rec.request_stop(t0 + secs(3)));

        rec.on_cycle(t0 + secs(3), &person());
        assert_eq!(rec.state(), RecorderState::Paused);

        assert!(rec.resume());
        assert_eq!(rec.state(), RecorderState::Idle);
    }

    #[test]
    fn manual_stop_wins_over_pending_auto_stop() {
        let (mut rec, feeder) = recorder(5, 10);
        let t0 = Instant::now();
        start_recording(&mut rec, &feeder, t0);
        rec.on_cycle(t0 + secs(1), &[]);
        assert!(rec.request_stop(t0 + secs(2)));
        rec.poll(t0 + secs(6));
        assert_eq!(rec.state(), RecorderState::Paused);
        assert_eq!(rec.store().stats().unwrap().count, 1);
    }

    #[test]
    fn empty_capture_is_not_persisted() {
        let (mut rec, _) = recorder(5, 10);
        let t0 = Instant::now();
        rec.on_cycle(t0, &person());
        rec.on_cycle(t0, &person());
        rec.drain_events();

        rec.request_stop(t0 + secs(1));
        assert_eq!(rec.state(), RecorderState::Idle);
        assert_eq!(rec.store().stats().unwrap().count, 0);
        let errs = errors(&rec.drain_events());
        assert!(matches!(errs.as_slice(), [RecorderError::Capture(_)]));
    }

    #[test]
    fn failed_finalization_returns_to_idle() {
        let (mut rec, feeder) = recorder(5, 10);
        let t0 = Instant::now();
        start_recording(&mut rec, &feeder, t0);
        feeder.fail_next_finalize("encoder crashed");
        rec.request_stop(t0 + secs(1));
        assert_eq!(rec.state(), RecorderState::Idle);
        assert_eq!(rec.store().stats().unwrap().count, 0);
    }

    #[test]
    fn persistence_failure_is_reported_once_and_not_retried() {
        let device = SpoolCapture::new();
        let feeder = device.clone();
        let mut rec = Recorder::new(
            device,
            InMemoryClipStore::failing("disk full"),
            RecorderSettings::default(),
        );
        let t0 = Instant::now();
        rec.on_cycle(t0, &person());
        rec.on_cycle(t0, &person());
        feeder.feed(&Frame::solid(1, 1, [1, 1, 1]));
        rec.drain_events();

        rec.request_stop(t0 + secs(1));
        assert_eq!(rec.state(), RecorderState::Idle);
        rec.poll(t0 + secs(2));
        let errs = errors(&rec.drain_events());
        assert_eq!(errs.len(), 1);
        assert!(matches!(&errs[0], RecorderError::Persistence(msg) if msg.contains("disk full")));
    }

    #[test]
    fn capture_start_failure_returns_to_idle() {
        let (mut rec, feeder) = recorder(5, 10);
        feeder.fail_next_start("camera busy");
        let t0 = Instant::now();
        rec.on_cycle(t0, &person());
        rec.on_cycle(t0, &person());
        assert_eq!(rec.state(), RecorderState::Idle);
        assert!(rec.session().is_none());
        let errs = errors(&rec.drain_events());
        assert_eq!(errs, vec![RecorderError::Capture("camera busy".to_string())]);
    }

    #[test]
    fn slow_finalization_holds_stopping_and_suppresses_cycles() {
        let (mut rec, feeder) = recorder(5, 10);
        let t0 = Instant::now();
        start_recording(&mut rec, &feeder, t0);
        feeder.hold_finalize(true);

        rec.request_stop(t0 + secs(1));
        assert_eq!(rec.state(), RecorderState::Stopping);
        assert!(!rec.accepts_cycles());
        rec.on_cycle(t0 + secs(2), &person());
        rec.poll(t0 + secs(3));
        assert_eq!(rec.state(), RecorderState::Stopping);

        feeder.release();
        rec.poll(t0 + secs(4));
        assert_eq!(rec.state(), RecorderState::Paused);
    }

    #[test]
    fn bounded_capture_ending_on_its_own_is_an_auto_stop() {
        let device = SpoolCapture::new();
        let feeder = device.clone();
        let settings = RecorderSettings {
            capture_max_duration: Some(Duration::ZERO),
            ..RecorderSettings::default()
        };
        let mut rec = Recorder::new(device, InMemoryClipStore::new(), settings);
        let t0 = Instant::now();
        rec.on_cycle(t0, &person());
        rec.on_cycle(t0, &person());
        // The elapsed bound finalizes on the next feed.
        assert!(!feeder.feed(&Frame::solid(1, 1, [0, 0, 0])));
        rec.poll(t0 + secs(1));
        // Nothing was spooled, so the session fails back to idle.
        assert_eq!(rec.state(), RecorderState::Idle);
    }

    #[test]
    fn pause_only_from_idle_or_detecting() {
        let (mut rec, feeder) = recorder(5, 10);
        let t0 = Instant::now();
        assert!(rec.pause());
        assert_eq!(rec.state(), RecorderState::Paused);
        assert!(!rec.pause());
        assert!(rec.resume());

        rec.on_cycle(t0, &person());
        assert!(rec.pause());
        assert_eq!(rec.sighted_at(), None);
        assert!(rec.resume());

        start_recording(&mut rec, &feeder, t0);
        assert!(!rec.pause());
        assert_eq!(rec.state(), RecorderState::Recording);
        assert!(!rec.resume());
    }

    #[test]
    fn detector_errors_do_not_change_state() {
        let (mut rec, _) = recorder(5, 10);
        rec.on_cycle(Instant::now(), &person());
        rec.on_cycle_error(RecorderError::Scorer("tile 3 failed".to_string()));
        assert_eq!(rec.state(), RecorderState::Detecting);
        let errs = errors(&rec.drain_events());
        assert_eq!(errs.len(), 1);
    }

    #[test]
    fn state_changes_are_reported_in_order() {
        let (mut rec, feeder) = recorder(5, 0);
        let t0 = Instant::now();
        start_recording(&mut rec, &feeder, t0);
        rec.on_cycle(t0 + secs(1), &[]);
        rec.poll(t0 + secs(5));
        rec.poll(t0 + secs(5));

        let transitions: Vec<(RecorderState, RecorderState)> = rec
            .drain_events()
            .into_iter()
            .filter_map(|e| match e {
                RecorderEvent::StateChanged { from, to } => Some((from, to)),
                _ => None,
            })
            .collect();
        assert_eq!(
            transitions,
            vec![
                (RecorderState::Idle, RecorderState::Detecting),
                (RecorderState::Detecting, RecorderState::Recording),
                (RecorderState::Recording, RecorderState::Stopping),
                (RecorderState::Stopping, RecorderState::Cooldown),
                (RecorderState::Cooldown, RecorderState::Idle),
            ]
        );
    }
}
