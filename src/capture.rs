//! Capture device contract.
//!
//! A capture session is one pending operation: `start` hands back a
//! `CaptureHandle` that resolves once the device is stopped (or a bounded
//! session runs out of time) and finalization completes. `stop` only
//! signals; the data arrives through the handle.
//!
//! There is no finalization timeout. A device that never resolves keeps its
//! handle pending forever.

use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::RecorderError;
use crate::frame::Frame;

/// MIME type of spooled captures: a sequence of `u32 LE width, u32 LE height, RGB8 pixels` records.
pub const SPOOL_MIME_TYPE: &str = "application/x-rgb24-frames";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CaptureOptions {
    /// Run until `stop` is called.
    pub indefinite: bool,
    /// Upper bound for non-indefinite sessions.
    pub max_duration: Option<Duration>,
}

impl CaptureOptions {
    pub fn indefinite() -> Self {
        Self {
            indefinite: true,
            max_duration: None,
        }
    }

    pub fn bounded(max_duration: Duration) -> Self {
        Self {
            indefinite: false,
            max_duration: Some(max_duration),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureBlob {
    pub data: Vec<u8>,
    pub mime_type: String,
}

impl CaptureBlob {
    pub fn new(data: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            data,
            mime_type: mime_type.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

type CaptureResult = Result<CaptureBlob, RecorderError>;

/// Pending capture operation.
pub struct CaptureHandle {
    rx: Receiver<CaptureResult>,
}

impl CaptureHandle {
    /// Pair a handle with the sender the device resolves it through.
    pub fn channel() -> (Sender<CaptureResult>, CaptureHandle) {
        let (tx, rx) = mpsc::channel();
        (tx, CaptureHandle { rx })
    }

    /// Non-blocking check for the session outcome.
    ///
    /// A device that dropped its end without resolving reports a capture error.
    pub fn try_result(&self) -> Option<CaptureResult> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(RecorderError::Capture(
                "capture device went away before finalizing".to_string(),
            ))),
        }
    }

    /// Block until the session resolves.
    pub fn wait(self) -> CaptureResult {
        self.rx.recv().unwrap_or_else(|_| {
            Err(RecorderError::Capture(
                "capture device went away before finalizing".to_string(),
            ))
        })
    }
}

/// Recording device driven by the state machine.
pub trait CaptureDevice: Send {
    /// Begin a session. Fails when the device cannot start.
    fn start(&mut self, options: CaptureOptions) -> Result<CaptureHandle, RecorderError>;

    /// Signal the active session to finalize. No-op when idle.
    fn stop(&mut self);

    fn is_active(&self) -> bool;
}

struct ActiveSpool {
    tx: Sender<CaptureResult>,
    data: Vec<u8>,
    frames: u64,
    started: Instant,
    deadline: Option<Instant>,
}

#[derive(Default)]
struct SpoolState {
    active: Option<ActiveSpool>,
    fail_next_start: Option<String>,
    fail_next_finalize: Option<String>,
    hold_finalize: bool,
}

/// In-process capture device that spools fed frames into memory.
///
/// Clones share one device: the state machine owns one clone and the frame
/// loop feeds frames through another.
#[derive(Clone, Default)]
pub struct SpoolCapture {
    state: Arc<Mutex<SpoolState>>,
}

impl SpoolCapture {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SpoolState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next `start` fail.
    pub fn fail_next_start(&self, message: &str) {
        self.lock().fail_next_start = Some(message.to_string());
    }

    /// Make the next finalization resolve with an error.
    pub fn fail_next_finalize(&self, message: &str) {
        self.lock().fail_next_finalize = Some(message.to_string());
    }

    /// Keep stopped sessions pending until `release` is called.
    pub fn hold_finalize(&self, hold: bool) {
        self.lock().hold_finalize = hold;
    }

    /// Finalize a session that was stopped while held.
    pub fn release(&self) {
        let mut state = self.lock();
        state.hold_finalize = false;
        finalize(&mut state);
    }

    /// Frames spooled into the active session, if any.
    pub fn spooled_frames(&self) -> Option<u64> {
        self.lock().active.as_ref().map(|spool| spool.frames)
    }

    /// Append a frame to the active session.
    ///
    /// Returns false when no session is active. A bounded session whose
    /// duration has elapsed is finalized instead.
    pub fn feed(&self, frame: &Frame) -> bool {
        let mut state = self.lock();
        let expired = match state.active.as_ref() {
            None => return false,
            Some(spool) => spool.deadline.is_some_and(|d| Instant::now() >= d),
        };
        if expired {
            finalize(&mut state);
            return false;
        }
        if let Some(spool) = state.active.as_mut() {
            spool.data.extend_from_slice(&frame.width().to_le_bytes());
            spool.data.extend_from_slice(&frame.height().to_le_bytes());
            spool.data.extend_from_slice(frame.as_rgb());
            spool.frames += 1;
        }
        true
    }
}

fn finalize(state: &mut SpoolState) {
    if state.hold_finalize {
        return;
    }
    let Some(spool) = state.active.take() else {
        return;
    };
    let result = match state.fail_next_finalize.take() {
        Some(message) => Err(RecorderError::Capture(message)),
        None => {
            log::info!(
                "capture finalized: {} frames, {} bytes, {:.1}s",
                spool.frames,
                spool.data.len(),
                spool.started.elapsed().as_secs_f32()
            );
            Ok(CaptureBlob::new(spool.data, SPOOL_MIME_TYPE))
        }
    };
    // The receiver may already be gone if the session was abandoned.
    let _ = spool.tx.send(result);
}

impl CaptureDevice for SpoolCapture {
    fn start(&mut self, options: CaptureOptions) -> Result<CaptureHandle, RecorderError> {
        let mut state = self.lock();
        if let Some(message) = state.fail_next_start.take() {
            return Err(RecorderError::Capture(message));
        }
        if state.active.is_some() {
            return Err(RecorderError::Capture(
                "capture session already active".to_string(),
            ));
        }
        let (tx, handle) = CaptureHandle::channel();
        let started = Instant::now();
        let deadline = if options.indefinite {
            None
        } else {
            options.max_duration.map(|d| started + d)
        };
        state.active = Some(ActiveSpool {
            tx,
            data: Vec::new(),
            frames: 0,
            started,
            deadline,
        });
        Ok(handle)
    }

    fn stop(&mut self) {
        let mut state = self.lock();
        if state.active.is_none() {
            return;
        }
        finalize(&mut state);
    }

    fn is_active(&self) -> bool {
        self.lock().active.is_some()
    }
}
