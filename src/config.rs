use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::SourceId;

const DEFAULT_FRAME_WIDTH: u32 = 640;
const DEFAULT_FRAME_HEIGHT: u32 = 480;
const DEFAULT_FPS: u32 = 30;
const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 10;
const DEFAULT_MAX_FRAMING_ERRORS: u32 = 5;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_RETRY_DELAY_MS: u64 = 100;
const DEFAULT_POLL_DELAY_MS: u64 = 10;
const DEFAULT_JOIN_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_RESTART_PAUSE_MS: u64 = 1_000;
const DEFAULT_DETECTOR_BACKEND: &str = "cpu";
const DEFAULT_MODEL_INPUT: u32 = 640;
const DEFAULT_CONFIDENCE: f32 = 0.3;
const DEFAULT_OVERLAP: f32 = 0.45;
const DEFAULT_TRACK_CLASS: &str = "car";
const DEFAULT_MIN_AREA: f32 = 500.0;
const DEFAULT_MAX_AREA: f32 = 200_000.0;
const DEFAULT_MAX_AGE: u32 = 30;
const DEFAULT_MIN_CONFIRMATIONS: u32 = 3;
const DEFAULT_MAX_APPEARANCE_DISTANCE: f32 = 0.2;
const DEFAULT_MIN_TRACK_IOU: f32 = 0.1;
const DEFAULT_HISTORY_LENGTH: usize = 30;
const DEFAULT_BASELINE_M: f32 = 0.5;
const DEFAULT_MIN_DEPTH_M: f32 = 1.0;
const DEFAULT_MAX_DEPTH_M: f32 = 10.0;
const DEFAULT_MATCH_THRESHOLD: f32 = 0.3;
const DEFAULT_MIN_DISPARITY: f32 = 0.01;
const DEFAULT_UPDATE_RATE_HZ: u32 = 30;

// ----------------------------------------------------------------------------
// On-disk shape (every field optional)
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    sources: Option<SourcesConfigFile>,
    capture: Option<CaptureConfigFile>,
    detector: Option<DetectorConfigFile>,
    identity: Option<IdentityConfigFile>,
    geometry: Option<GeometryConfigFile>,
    update_rate_hz: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct SourcesConfigFile {
    source1: Option<SourceConfigFile>,
    source2: Option<SourceConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    #[serde(rename = "type", alias = "kind")]
    kind: Option<SourceKind>,
    device_index: Option<u32>,
    url: Option<String>,
    #[serde(alias = "name")]
    display_name: Option<String>,
    enabled: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
    max_consecutive_failures: Option<u32>,
    max_framing_errors: Option<u32>,
    connect_timeout_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
    retry_delay_ms: Option<u64>,
    poll_delay_ms: Option<u64>,
    join_timeout_ms: Option<u64>,
    restart_pause_ms: Option<u64>,
    prefer_snapshot: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    input_size: Option<u32>,
    confidence_threshold: Option<f32>,
    overlap_threshold: Option<f32>,
    classes: Option<Vec<String>>,
    min_area: Option<f32>,
    max_area: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct IdentityConfigFile {
    max_age: Option<u32>,
    min_confirmations: Option<u32>,
    max_appearance_distance: Option<f32>,
    min_iou: Option<f32>,
    history_length: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct GeometryConfigFile {
    baseline_m: Option<f32>,
    min_depth_m: Option<f32>,
    max_depth_m: Option<f32>,
    match_threshold: Option<f32>,
    min_disparity: Option<f32>,
}

// ----------------------------------------------------------------------------
// Resolved configuration
// ----------------------------------------------------------------------------

/// How a source reaches its images.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Local capture device addressed by index.
    Device,
    /// Network image/video endpoint.
    Url,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Device => "device",
            SourceKind::Url => "url",
        }
    }
}

/// Declarative description of one source slot.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub device_index: u32,
    pub url: String,
    pub display_name: String,
    pub enabled: bool,
}

impl SourceConfig {
    pub fn device(index: u32, display_name: &str) -> Self {
        Self {
            kind: SourceKind::Device,
            device_index: index,
            url: String::new(),
            display_name: display_name.to_string(),
            enabled: true,
        }
    }

    pub fn url(url: &str, display_name: &str) -> Self {
        Self {
            kind: SourceKind::Url,
            device_index: 0,
            url: url.to_string(),
            display_name: display_name.to_string(),
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Human-readable origin, e.g. `device:0` or the configured URL.
    pub fn origin(&self) -> String {
        match self.kind {
            SourceKind::Device => format!("device:{}", self.device_index),
            SourceKind::Url => self.url.clone(),
        }
    }
}

/// The two named source slots.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SourcesConfig {
    pub source1: SourceConfig,
    pub source2: SourceConfig,
}

impl SourcesConfig {
    pub fn get(&self, id: SourceId) -> &SourceConfig {
        match id {
            SourceId::Source1 => &self.source1,
            SourceId::Source2 => &self.source2,
        }
    }

    pub fn get_mut(&mut self, id: SourceId) -> &mut SourceConfig {
        match id {
            SourceId::Source1 => &mut self.source1,
            SourceId::Source2 => &mut self.source2,
        }
    }
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            source1: SourceConfig::device(0, "Camera 1"),
            source2: SourceConfig::device(1, "Camera 2"),
        }
    }
}

/// Acquisition tuning shared by every source.
#[derive(Clone, Debug, PartialEq)]
pub struct CaptureSettings {
    /// Target frame width after resize.
    pub width: u32,
    /// Target frame height after resize.
    pub height: u32,
    /// Requested device frame rate.
    pub fps: u32,
    /// Consecutive read failures tolerated before the source goes down.
    pub max_consecutive_failures: u32,
    /// Stream framing errors tolerated before switching to snapshot polling.
    pub max_framing_errors: u32,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Pause after a failed read.
    pub retry_delay: Duration,
    /// Pause between successful network polls.
    pub poll_delay: Duration,
    /// Upper bound on waiting for an acquisition thread in `stop()`.
    pub join_timeout: Duration,
    /// Pause between stop and start in `restart()`/`reconnect()`.
    pub restart_pause: Duration,
    /// Poll the single-image endpoint instead of holding a stream open.
    pub prefer_snapshot: bool,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: DEFAULT_FRAME_WIDTH,
            height: DEFAULT_FRAME_HEIGHT,
            fps: DEFAULT_FPS,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            max_framing_errors: DEFAULT_MAX_FRAMING_ERRORS,
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            poll_delay: Duration::from_millis(DEFAULT_POLL_DELAY_MS),
            join_timeout: Duration::from_millis(DEFAULT_JOIN_TIMEOUT_MS),
            restart_pause: Duration::from_millis(DEFAULT_RESTART_PAUSE_MS),
            prefer_snapshot: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DetectorSettings {
    /// Backend name: `stub`, `cpu` or `tract`.
    pub backend: String,
    pub model_path: Option<PathBuf>,
    /// Square model input edge (tract backend).
    pub input_size: u32,
    pub confidence_threshold: f32,
    pub overlap_threshold: f32,
    /// Allow-list of class labels.
    pub classes: Vec<String>,
    /// Minimum box area in pixels.
    pub min_area: f32,
    /// Maximum box area in pixels.
    pub max_area: f32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            backend: DEFAULT_DETECTOR_BACKEND.to_string(),
            model_path: None,
            input_size: DEFAULT_MODEL_INPUT,
            confidence_threshold: DEFAULT_CONFIDENCE,
            overlap_threshold: DEFAULT_OVERLAP,
            classes: vec![DEFAULT_TRACK_CLASS.to_string()],
            min_area: DEFAULT_MIN_AREA,
            max_area: DEFAULT_MAX_AREA,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct IdentitySettings {
    /// Cycles a confirmed track survives without a match.
    pub max_age: u32,
    /// Consecutive matches before a track is confirmed.
    pub min_confirmations: u32,
    /// Maximum cosine distance between appearance descriptors.
    pub max_appearance_distance: f32,
    /// Minimum IoU for a detection to continue a track.
    pub min_iou: f32,
    /// Samples kept per identity in the track history.
    pub history_length: usize,
}

impl Default for IdentitySettings {
    fn default() -> Self {
        Self {
            max_age: DEFAULT_MAX_AGE,
            min_confirmations: DEFAULT_MIN_CONFIRMATIONS,
            max_appearance_distance: DEFAULT_MAX_APPEARANCE_DISTANCE,
            min_iou: DEFAULT_MIN_TRACK_IOU,
            history_length: DEFAULT_HISTORY_LENGTH,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GeometrySettings {
    /// Distance between the two sources in meters.
    pub baseline_m: f32,
    pub min_depth_m: f32,
    pub max_depth_m: f32,
    /// Minimum vertical similarity for a cross-source match.
    pub match_threshold: f32,
    /// Normalized disparity below which triangulation is refused.
    pub min_disparity: f32,
}

impl Default for GeometrySettings {
    fn default() -> Self {
        Self {
            baseline_m: DEFAULT_BASELINE_M,
            min_depth_m: DEFAULT_MIN_DEPTH_M,
            max_depth_m: DEFAULT_MAX_DEPTH_M,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            min_disparity: DEFAULT_MIN_DISPARITY,
        }
    }
}

/// Complete pipeline configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    pub sources: SourcesConfig,
    pub capture: CaptureSettings,
    pub detector: DetectorSettings,
    pub identity: IdentitySettings,
    pub geometry: GeometrySettings,
    /// Orchestrator cycles per second.
    pub update_rate_hz: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sources: SourcesConfig::default(),
            capture: CaptureSettings::default(),
            detector: DetectorSettings::default(),
            identity: IdentitySettings::default(),
            geometry: GeometrySettings::default(),
            update_rate_hz: DEFAULT_UPDATE_RATE_HZ,
        }
    }
}

impl PipelineConfig {
    /// Load from `DUALCAM_CONFIG` (if set), then apply environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("DUALCAM_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load an explicit file, then apply environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut cfg = Self::from_file(read_config_file(path)?);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a JSON document without consulting the environment.
    pub fn from_json(raw: &str) -> Result<Self> {
        let file: PipelineConfigFile =
            serde_json::from_str(raw).map_err(|e| anyhow!("invalid config: {}", e))?;
        let mut cfg = Self::from_file(file);
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PipelineConfigFile) -> Self {
        let defaults = Self::default();
        let sources = file.sources.unwrap_or_default();
        let sources = SourcesConfig {
            source1: resolve_source(sources.source1, defaults.sources.source1),
            source2: resolve_source(sources.source2, defaults.sources.source2),
        };

        let capture_file = file.capture.unwrap_or_default();
        let d = defaults.capture;
        let capture = CaptureSettings {
            width: capture_file.width.unwrap_or(d.width),
            height: capture_file.height.unwrap_or(d.height),
            fps: capture_file.fps.unwrap_or(d.fps),
            max_consecutive_failures: capture_file
                .max_consecutive_failures
                .unwrap_or(d.max_consecutive_failures),
            max_framing_errors: capture_file
                .max_framing_errors
                .unwrap_or(d.max_framing_errors),
            connect_timeout: millis_or(capture_file.connect_timeout_ms, d.connect_timeout),
            request_timeout: millis_or(capture_file.request_timeout_ms, d.request_timeout),
            retry_delay: millis_or(capture_file.retry_delay_ms, d.retry_delay),
            poll_delay: millis_or(capture_file.poll_delay_ms, d.poll_delay),
            join_timeout: millis_or(capture_file.join_timeout_ms, d.join_timeout),
            restart_pause: millis_or(capture_file.restart_pause_ms, d.restart_pause),
            prefer_snapshot: capture_file.prefer_snapshot.unwrap_or(d.prefer_snapshot),
        };

        let detector_file = file.detector.unwrap_or_default();
        let d = defaults.detector;
        let detector = DetectorSettings {
            backend: detector_file.backend.unwrap_or(d.backend),
            model_path: detector_file.model_path.or(d.model_path),
            input_size: detector_file.input_size.unwrap_or(d.input_size),
            confidence_threshold: detector_file
                .confidence_threshold
                .unwrap_or(d.confidence_threshold),
            overlap_threshold: detector_file
                .overlap_threshold
                .unwrap_or(d.overlap_threshold),
            classes: detector_file.classes.unwrap_or(d.classes),
            min_area: detector_file.min_area.unwrap_or(d.min_area),
            max_area: detector_file.max_area.unwrap_or(d.max_area),
        };

        let identity_file = file.identity.unwrap_or_default();
        let d = defaults.identity;
        let identity = IdentitySettings {
            max_age: identity_file.max_age.unwrap_or(d.max_age),
            min_confirmations: identity_file
                .min_confirmations
                .unwrap_or(d.min_confirmations),
            max_appearance_distance: identity_file
                .max_appearance_distance
                .unwrap_or(d.max_appearance_distance),
            min_iou: identity_file.min_iou.unwrap_or(d.min_iou),
            history_length: identity_file.history_length.unwrap_or(d.history_length),
        };

        let geometry_file = file.geometry.unwrap_or_default();
        let d = defaults.geometry;
        let geometry = GeometrySettings {
            baseline_m: geometry_file.baseline_m.unwrap_or(d.baseline_m),
            min_depth_m: geometry_file.min_depth_m.unwrap_or(d.min_depth_m),
            max_depth_m: geometry_file.max_depth_m.unwrap_or(d.max_depth_m),
            match_threshold: geometry_file.match_threshold.unwrap_or(d.match_threshold),
            min_disparity: geometry_file.min_disparity.unwrap_or(d.min_disparity),
        };

        Self {
            sources,
            capture,
            detector,
            identity,
            geometry,
            update_rate_hz: file.update_rate_hz.unwrap_or(defaults.update_rate_hz),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        for (id, key) in [
            (SourceId::Source1, "DUALCAM_SOURCE1_URL"),
            (SourceId::Source2, "DUALCAM_SOURCE2_URL"),
        ] {
            if let Ok(url) = std::env::var(key) {
                if !url.trim().is_empty() {
                    let source = self.sources.get_mut(id);
                    source.kind = SourceKind::Url;
                    source.url = url.trim().to_string();
                }
            }
        }
        if let Ok(classes) = std::env::var("DUALCAM_TRACK_CLASSES") {
            let parsed = split_csv(&classes);
            if !parsed.is_empty() {
                self.detector.classes = parsed;
            }
        }
        if let Ok(backend) = std::env::var("DUALCAM_DETECTOR") {
            if !backend.trim().is_empty() {
                self.detector.backend = backend.trim().to_string();
            }
        }
        if let Ok(baseline) = std::env::var("DUALCAM_BASELINE_M") {
            self.geometry.baseline_m = baseline
                .trim()
                .parse()
                .map_err(|_| anyhow!("DUALCAM_BASELINE_M must be a number of meters"))?;
        }
        Ok(())
    }

    pub fn validate(&mut self) -> Result<()> {
        for id in SourceId::ALL {
            let source = self.sources.get_mut(id);
            if source.display_name.trim().is_empty() {
                source.display_name = id.default_display_name().to_string();
            }
            if source.enabled && source.kind == SourceKind::Url && source.url.trim().is_empty() {
                return Err(anyhow!("{} is an enabled url source without a url", id));
            }
        }

        let capture = &self.capture;
        if capture.width == 0 || capture.height == 0 {
            return Err(anyhow!("capture width and height must be greater than zero"));
        }
        if capture.max_consecutive_failures == 0 {
            return Err(anyhow!("max_consecutive_failures must be greater than zero"));
        }

        let detector = &mut self.detector;
        check_unit("confidence_threshold", detector.confidence_threshold)?;
        check_unit("overlap_threshold", detector.overlap_threshold)?;
        if detector.min_area < 0.0 || detector.min_area > detector.max_area {
            return Err(anyhow!(
                "object area range is invalid: [{}, {}]",
                detector.min_area,
                detector.max_area
            ));
        }
        detector.backend = detector.backend.to_lowercase();
        detector.classes = detector
            .classes
            .iter()
            .map(|class| class.trim().to_string())
            .filter(|class| !class.is_empty())
            .collect();
        if detector.classes.is_empty() {
            return Err(anyhow!("class allow-list must not be empty"));
        }

        let identity = &self.identity;
        if identity.min_confirmations == 0 {
            return Err(anyhow!("min_confirmations must be at least 1"));
        }
        check_unit("min_iou", identity.min_iou)?;
        if identity.max_appearance_distance < 0.0 {
            return Err(anyhow!("max_appearance_distance must not be negative"));
        }

        let geometry = &self.geometry;
        if !(geometry.baseline_m > 0.0) {
            return Err(anyhow!("baseline_m must be greater than zero"));
        }
        if !(geometry.min_depth_m > 0.0 && geometry.min_depth_m < geometry.max_depth_m) {
            return Err(anyhow!(
                "depth range is invalid: [{}, {}]",
                geometry.min_depth_m,
                geometry.max_depth_m
            ));
        }
        if !(geometry.min_disparity > 0.0) {
            return Err(anyhow!("min_disparity must be greater than zero"));
        }

        if self.update_rate_hz == 0 {
            return Err(anyhow!("update_rate_hz must be greater than zero"));
        }
        Ok(())
    }

    /// Interval between orchestrator cycles.
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.update_rate_hz.max(1) as f64)
    }
}

fn resolve_source(file: Option<SourceConfigFile>, default: SourceConfig) -> SourceConfig {
    let Some(file) = file else {
        return default;
    };
    SourceConfig {
        kind: file.kind.unwrap_or(default.kind),
        device_index: file.device_index.unwrap_or(default.device_index),
        url: file.url.unwrap_or(default.url),
        display_name: file.display_name.unwrap_or(default.display_name),
        enabled: file.enabled.unwrap_or(default.enabled),
    }
}

fn millis_or(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}

fn check_unit(name: &str, value: f32) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(anyhow!("{} must be within [0, 1], got {}", name, value))
    }
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
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
    fn empty_document_yields_defaults() {
        let cfg = PipelineConfig::from_json("{}").unwrap();
        assert_eq!(cfg, PipelineConfig::default());
    }

    #[test]
    fn partial_source_keeps_slot_defaults() {
        let cfg = PipelineConfig::from_json(
            r#"{"sources": {"source2": {"type": "url", "url": "192.168.1.5:8080/video"}}}"#,
        )
        .unwrap();
        assert_eq!(cfg.sources.source1, SourceConfig::device(0, "Camera 1"));
        assert_eq!(cfg.sources.source2.kind, SourceKind::Url);
        assert_eq!(cfg.sources.source2.display_name, "Camera 2");
        assert!(cfg.sources.source2.enabled);
    }

    #[test]
    fn enabled_url_source_requires_url() {
        let err = PipelineConfig::from_json(r#"{"sources": {"source1": {"type": "url"}}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("source1"));
    }

    #[test]
    fn disabled_url_source_may_omit_url() {
        let cfg = PipelineConfig::from_json(
            r#"{"sources": {"source1": {"type": "url", "enabled": false}}}"#,
        )
        .unwrap();
        assert!(!cfg.sources.source1.enabled);
    }

    #[test]
    fn rejects_inverted_area_range() {
        let err =
            PipelineConfig::from_json(r#"{"detector": {"min_area": 10, "max_area": 5}}"#)
                .unwrap_err();
        assert!(err.to_string().contains("area"));
    }

    #[test]
    fn rejects_inverted_depth_range() {
        assert!(PipelineConfig::from_json(
            r#"{"geometry": {"min_depth_m": 5.0, "max_depth_m": 2.0}}"#
        )
        .is_err());
    }

    #[test]
    fn rejects_out_of_range_thresholds() {
        assert!(
            PipelineConfig::from_json(r#"{"detector": {"confidence_threshold": 1.5}}"#).is_err()
        );
    }

    #[test]
    fn csv_split_drops_blanks() {
        assert_eq!(split_csv(" car, ,truck "), vec!["car", "truck"]);
    }
}
