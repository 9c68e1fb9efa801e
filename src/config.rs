use anyhow::Result;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use crate::detect::DetectorConfig;
use crate::error::RecorderError;
use crate::motion::MotionFilter;
use crate::recorder::RecorderSettings;

const DEFAULT_DB_PATH: &str = "recorder.db";
const DEFAULT_SOURCE_URL: &str = "stub://front_camera";
const DEFAULT_SOURCE_FPS: u32 = 10;
const DEFAULT_SOURCE_WIDTH: u32 = 640;
const DEFAULT_SOURCE_HEIGHT: u32 = 480;
const DEFAULT_SCORER: &str = "cpu";
const DEFAULT_MODEL_INPUT: u32 = 640;
const DEFAULT_CYCLE_MS: u64 = 500;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RecorderdConfigFile {
    db_path: Option<String>,
    cycle_ms: Option<u64>,
    source: Option<SourceConfigFile>,
    detector: Option<DetectorConfigFile>,
    scorer: Option<ScorerConfigFile>,
    recording: Option<RecordingConfigFile>,
    motion: Option<MotionConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SourceConfigFile {
    url: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DetectorConfigFile {
    confidence_threshold: Option<f32>,
    target_labels: Option<Vec<String>>,
    tile_grid: Option<u32>,
    tile_overlap: Option<f32>,
    nms_iou_threshold: Option<f32>,
    zoom: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ScorerConfigFile {
    name: Option<String>,
    model_path: Option<PathBuf>,
    input_width: Option<u32>,
    input_height: Option<u32>,
    class_names: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RecordingConfigFile {
    grace_secs: Option<u64>,
    cooldown_secs: Option<u64>,
    max_clip_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct MotionConfigFile {
    enabled: Option<bool>,
    threshold: Option<u8>,
    pixel_percent: Option<f32>,
    sample_size: Option<usize>,
}

/// Daemon configuration: optional file, then environment, then validation.
#[derive(Debug, Clone)]
pub struct RecorderdConfig {
    pub db_path: String,
    /// Period of the detection trigger.
    pub cycle_period: Duration,
    pub source: SourceSettings,
    pub detector: DetectorConfig,
    pub scorer: ScorerSettings,
    pub recording: RecorderSettings,
    /// `None` when the motion gate is disabled.
    pub motion: Option<MotionFilter>,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub url: String,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct ScorerSettings {
    pub name: String,
    pub model_path: Option<PathBuf>,
    pub input_width: u32,
    pub input_height: u32,
    pub class_names: Vec<String>,
}

impl RecorderdConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("RECORDER_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Like `load`, with the config file path given explicitly.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self> {
        let file_cfg = match config_path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults with no file and no environment.
    pub fn defaults() -> Result<Self> {
        let mut cfg = Self::from_file(RecorderdConfigFile::default());
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RecorderdConfigFile) -> Self {
        let source = file.source.unwrap_or_default();
        let detector_file = file.detector.unwrap_or_default();
        let scorer = file.scorer.unwrap_or_default();
        let recording = file.recording.unwrap_or_default();
        let motion = file.motion.unwrap_or_default();

        let defaults = DetectorConfig::default();
        let detector = DetectorConfig {
            confidence_threshold: detector_file
                .confidence_threshold
                .unwrap_or(defaults.confidence_threshold),
            target_labels: detector_file
                .target_labels
                .map(|labels| labels.into_iter().collect())
                .unwrap_or(defaults.target_labels),
            tile_grid: detector_file.tile_grid.unwrap_or(defaults.tile_grid),
            tile_overlap: detector_file.tile_overlap.unwrap_or(defaults.tile_overlap),
            nms_iou_threshold: detector_file
                .nms_iou_threshold
                .unwrap_or(defaults.nms_iou_threshold),
            zoom: detector_file.zoom.unwrap_or(defaults.zoom),
        };

        let recording_defaults = RecorderSettings::default();
        let motion_defaults = MotionFilter::default();
        Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            cycle_period: Duration::from_millis(file.cycle_ms.unwrap_or(DEFAULT_CYCLE_MS)),
            source: SourceSettings {
                url: source.url.unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string()),
                target_fps: source.target_fps.unwrap_or(DEFAULT_SOURCE_FPS),
                width: source.width.unwrap_or(DEFAULT_SOURCE_WIDTH),
                height: source.height.unwrap_or(DEFAULT_SOURCE_HEIGHT),
            },
            scorer: ScorerSettings {
                name: scorer.name.unwrap_or_else(|| DEFAULT_SCORER.to_string()),
                model_path: scorer.model_path,
                input_width: scorer.input_width.unwrap_or(DEFAULT_MODEL_INPUT),
                input_height: scorer.input_height.unwrap_or(DEFAULT_MODEL_INPUT),
                class_names: scorer
                    .class_names
                    .unwrap_or_else(|| detector.target_labels.iter().cloned().collect()),
            },
            detector,
            recording: RecorderSettings {
                grace_period: recording
                    .grace_secs
                    .map(Duration::from_secs)
                    .unwrap_or(recording_defaults.grace_period),
                cooldown: recording
                    .cooldown_secs
                    .map(Duration::from_secs)
                    .unwrap_or(recording_defaults.cooldown),
                capture_max_duration: recording.max_clip_secs.map(Duration::from_secs),
            },
            motion: if motion.enabled.unwrap_or(false) {
                Some(MotionFilter {
                    threshold: motion.threshold.unwrap_or(motion_defaults.threshold),
                    pixel_percent: motion
                        .pixel_percent
                        .unwrap_or(motion_defaults.pixel_percent),
                    sample_size: motion.sample_size.unwrap_or(motion_defaults.sample_size),
                })
            } else {
                None
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("RECORDER_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(url) = std::env::var("RECORDER_SOURCE_URL") {
            if !url.trim().is_empty() {
                self.source.url = url;
            }
        }
        if let Ok(value) = std::env::var("RECORDER_CONFIDENCE") {
            self.detector.confidence_threshold = parse_env("RECORDER_CONFIDENCE", &value)?;
        }
        if let Ok(value) = std::env::var("RECORDER_TILE_GRID") {
            self.detector.tile_grid = parse_env("RECORDER_TILE_GRID", &value)?;
        }
        if let Ok(labels) = std::env::var("RECORDER_TARGET_LABELS") {
            let parsed = split_csv(&labels);
            if !parsed.is_empty() {
                self.detector.target_labels = parsed.into_iter().collect();
            }
        }
        if let Ok(value) = std::env::var("RECORDER_GRACE_SECS") {
            self.recording.grace_period =
                Duration::from_secs(parse_env("RECORDER_GRACE_SECS", &value)?);
        }
        if let Ok(value) = std::env::var("RECORDER_COOLDOWN_SECS") {
            self.recording.cooldown =
                Duration::from_secs(parse_env("RECORDER_COOLDOWN_SECS", &value)?);
        }
        if let Ok(value) = std::env::var("RECORDER_CYCLE_MS") {
            self.cycle_period = Duration::from_millis(parse_env("RECORDER_CYCLE_MS", &value)?);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        let mut labels = BTreeSet::new();
        for label in &self.detector.target_labels {
            labels.insert(validate_label(label)?);
        }
        if labels.is_empty() {
            return Err(config_error("at least one target label is required"));
        }
        self.detector.target_labels = labels;

        let mut class_names = Vec::with_capacity(self.scorer.class_names.len());
        for name in &self.scorer.class_names {
            class_names.push(validate_label(name)?);
        }
        self.scorer.class_names = class_names;

        if !self.detector.confidence_threshold.is_finite() {
            return Err(config_error("confidence threshold must be a finite number"));
        }
        if self.detector.tile_grid == 0 {
            return Err(config_error("tile grid must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.detector.tile_overlap) {
            return Err(config_error("tile overlap must be in [0, 1)"));
        }
        let iou = self.detector.nms_iou_threshold;
        if !(iou > 0.0 && iou <= 1.0) {
            return Err(config_error("nms iou threshold must be in (0, 1]"));
        }
        if !self.detector.zoom.is_finite() || self.detector.zoom <= 0.0 {
            return Err(config_error("zoom must be a positive number"));
        }
        if self.cycle_period.is_zero() {
            return Err(config_error("cycle period must be greater than zero"));
        }
        if self.source.width == 0 || self.source.height == 0 || self.source.target_fps == 0 {
            return Err(config_error("source width, height and fps must be non-zero"));
        }
        if self.scorer.input_width == 0 || self.scorer.input_height == 0 {
            return Err(config_error("scorer input size must be non-zero"));
        }
        if let Some(motion) = &self.motion {
            if motion.sample_size == 0 {
                return Err(config_error("motion sample size must be non-zero"));
            }
        }
        Ok(())
    }
}

/// Normalize and check a class label.
pub fn validate_label(label: &str) -> Result<String> {
    // Compile once for hot paths.
    static LABEL_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = LABEL_RE.get_or_init(|| regex::Regex::new(r"^[a-z0-9][a-z0-9 _-]{0,63}$").unwrap());

    let normalized = label.trim().to_lowercase();
    if !re.is_match(&normalized) {
        return Err(config_error(format!(
            "label {:?} must match ^[a-z0-9][a-z0-9 _-]{{0,63}}$",
            label
        )));
    }
    Ok(normalized)
}

fn config_error(message: impl Into<String>) -> anyhow::Error {
    RecorderError::Config(message.into()).into()
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| config_error(format!("{} has an invalid value {:?}", key, value)))
}

fn read_config_file(path: &Path) -> Result<RecorderdConfigFile> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        config_error(format!("failed to read config file {}: {}", path.display(), e))
    })?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let parsed = if is_toml {
        toml::from_str(&raw).map_err(|e| e.to_string())
    } else {
        serde_json::from_str(&raw).map_err(|e| e.to_string())
    };
    parsed.map_err(|e| config_error(format!("invalid config file {}: {}", path.display(), e)))
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_normalized() {
        assert_eq!(validate_label(" Person ").unwrap(), "person");
        assert_eq!(validate_label("traffic light").unwrap(), "traffic light");
        assert!(validate_label("").is_err());
        assert!(validate_label("-dash").is_err());
        assert!(validate_label("cat;drop").is_err());
        assert!(validate_label(&"a".repeat(65)).is_err());
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = RecorderdConfig::defaults().unwrap();
        assert_eq!(cfg.db_path, DEFAULT_DB_PATH);
        assert_eq!(cfg.detector, DetectorConfig::default());
        assert_eq!(cfg.recording, RecorderSettings::default());
        assert_eq!(cfg.scorer.class_names, vec!["person".to_string()]);
        assert!(cfg.motion.is_none());
    }

    #[test]
    fn structural_errors_are_config_errors() {
        let mut cfg = RecorderdConfig::defaults().unwrap();
        cfg.detector.tile_grid = 0;
        let err = cfg.validate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RecorderError>(),
            Some(RecorderError::Config(_))
        ));

        let mut cfg = RecorderdConfig::defaults().unwrap();
        cfg.cycle_period = Duration::ZERO;
        assert!(cfg.validate().is_err());

        let mut cfg = RecorderdConfig::defaults().unwrap();
        cfg.detector.tile_overlap = 1.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn csv_split_drops_blanks() {
        assert_eq!(split_csv(" person, ,car ,"), vec!["person", "car"]);
    }
}
