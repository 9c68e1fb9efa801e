use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::detect::backend::Scorer;
use crate::detect::result::RawDetection;
use crate::frame::Frame;

#[derive(Debug, Default)]
struct ProbeState {
    loads: usize,
    scores: usize,
    scored_sizes: Vec<(u32, u32)>,
}

/// Read-only view of a `ScriptedScorer`'s call history.
#[derive(Clone, Debug, Default)]
pub struct ScorerProbe {
    state: Arc<Mutex<ProbeState>>,
}

impl ScorerProbe {
    fn with<T>(&self, f: impl FnOnce(&mut ProbeState) -> T) -> T {
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    /// Number of successful `load` calls.
    pub fn loads(&self) -> usize {
        self.with(|s| s.loads)
    }

    /// Number of `score` calls, including failed ones.
    pub fn scores(&self) -> usize {
        self.with(|s| s.scores)
    }

    /// Dimensions of every image passed to `score`, in call order.
    pub fn scored_sizes(&self) -> Vec<(u32, u32)> {
        self.with(|s| s.scored_sizes.clone())
    }
}

enum Step {
    Detections(Vec<RawDetection>),
    Fail(String),
    Panic(String),
}

/// Deterministic scorer with canned output.
///
/// Each `score` call pops the next scripted response; once the script is
/// exhausted every call returns the fallback list.
pub struct ScriptedScorer {
    script: VecDeque<Step>,
    fallback: Vec<RawDetection>,
    fail_load: Option<String>,
    load_delay: Duration,
    score_delay: Duration,
    probe: ScorerProbe,
}

impl ScriptedScorer {
    pub fn new() -> Self {
        Self {
            script: VecDeque::new(),
            fallback: Vec::new(),
            fail_load: None,
            load_delay: Duration::ZERO,
            score_delay: Duration::ZERO,
            probe: ScorerProbe::default(),
        }
    }

    pub fn with_fallback(mut self, detections: Vec<RawDetection>) -> Self {
        self.fallback = detections;
        self
    }

    pub fn then(mut self, detections: Vec<RawDetection>) -> Self {
        self.script.push_back(Step::Detections(detections));
        self
    }

    pub fn then_fail(mut self, message: &str) -> Self {
        self.script.push_back(Step::Fail(message.to_string()));
        self
    }

    /// The scripted call panics instead of returning.
    pub fn then_panic(mut self, message: &str) -> Self {
        self.script.push_back(Step::Panic(message.to_string()));
        self
    }

    /// Make `load` fail with `message` until the scorer is rebuilt.
    pub fn failing_load(mut self, message: &str) -> Self {
        self.fail_load = Some(message.to_string());
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    /// Sleep this long inside every `score` call.
    pub fn with_score_delay(mut self, delay: Duration) -> Self {
        self.score_delay = delay;
        self
    }

    pub fn probe(&self) -> ScorerProbe {
        self.probe.clone()
    }
}

impl Default for ScriptedScorer {
    fn default() -> Self {
        Self::new()
    }
}

impl Scorer for ScriptedScorer {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn load(&mut self) -> Result<()> {
        if !self.load_delay.is_zero() {
            std::thread::sleep(self.load_delay);
        }
        if let Some(message) = &self.fail_load {
            return Err(anyhow!("{}", message));
        }
        self.probe.with(|s| s.loads += 1);
        Ok(())
    }

    fn score(&mut self, image: &Frame) -> Result<Vec<RawDetection>> {
        self.probe.with(|s| {
            s.scores += 1;
            s.scored_sizes.push((image.width(), image.height()));
        });
        if !self.score_delay.is_zero() {
            std::thread::sleep(self.score_delay);
        }
        match self.script.pop_front() {
            Some(Step::Detections(detections)) => Ok(detections),
            Some(Step::Fail(message)) => Err(anyhow!("{}", message)),
            Some(Step::Panic(message)) => panic!("{}", message),
            None => Ok(self.fallback.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_then_fallback() {
        let mut scorer = ScriptedScorer::new()
            .then(vec![RawDetection::new("person", 0.9, [0.0, 0.0, 1.0, 1.0])])
            .then_fail("boom")
            .with_fallback(vec![]);
        let probe = scorer.probe();
        let frame = Frame::solid(4, 2, [0, 0, 0]);

        assert_eq!(scorer.score(&frame).unwrap().len(), 1);
        assert!(scorer.score(&frame).is_err());
        assert!(scorer.score(&frame).unwrap().is_empty());
        assert_eq!(probe.scores(), 3);
        assert_eq!(probe.scored_sizes(), vec![(4, 2); 3]);
    }

    #[test]
    fn scripted_panic_unwinds_once() {
        let mut scorer = ScriptedScorer::new().then_panic("segfault in model");
        let frame = Frame::solid(2, 2, [0, 0, 0]);
        let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = scorer.score(&frame);
        }));
        assert!(caught.is_err());
        assert!(scorer.score(&frame).unwrap().is_empty());
    }
}
