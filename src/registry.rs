//! The two named source slots.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::config::{CaptureSettings, SourceConfig, SourcesConfig};
use crate::frame::Frame;
use crate::ingest::{CaptureBackend, SystemBackend};
use crate::source::{FrameSource, SourceError, SourceInfo, SourceState};
use crate::SourceId;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to start {id}: {source}")]
    Start {
        id: SourceId,
        #[source]
        source: SourceError,
    },
    #[error("{0} is not active")]
    NotActive(SourceId),
    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Latest frame of each slot, read once per cycle.
#[derive(Clone, Debug, Default)]
pub struct FramePair {
    pub source1: Option<Frame>,
    pub source2: Option<Frame>,
}

impl FramePair {
    pub fn get(&self, id: SourceId) -> Option<&Frame> {
        match id {
            SourceId::Source1 => self.source1.as_ref(),
            SourceId::Source2 => self.source2.as_ref(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.source1.is_none() && self.source2.is_none()
    }
}

/// Registry health summary, for logging and UI consumers.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RegistrySummary {
    pub running: usize,
    pub failed: usize,
    pub disabled: usize,
}

/// Owns `source1` and `source2`.
///
/// Disabled slots never get a `FrameSource`; they are kept only so
/// `get_source_info()` can describe them.
pub struct SourceRegistry {
    backend: Arc<dyn CaptureBackend>,
    active: BTreeMap<SourceId, FrameSource>,
    disabled: BTreeMap<SourceId, SourceConfig>,
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::with_backend(Arc::new(SystemBackend))
    }

    pub fn with_backend(backend: Arc<dyn CaptureBackend>) -> Self {
        Self {
            backend,
            active: BTreeMap::new(),
            disabled: BTreeMap::new(),
        }
    }

    /// Start every enabled slot.
    ///
    /// All or nothing: if one slot fails to start, slots already started are
    /// stopped and the registry is left empty.
    pub fn initialize(
        &mut self,
        sources: &SourcesConfig,
        settings: &CaptureSettings,
    ) -> Result<(), RegistryError> {
        self.stop_all();

        for id in SourceId::ALL {
            let config = sources.get(id);
            if !config.enabled {
                log::info!("SourceRegistry: {} ({}) disabled", id, config.display_name);
                self.disabled.insert(id, config.clone());
                continue;
            }

            let mut source = FrameSource::with_backend(
                id,
                config.clone(),
                settings.clone(),
                self.backend.clone(),
            );
            if let Err(err) = source.start() {
                log::error!("SourceRegistry: {} failed to start: {}", id, err);
                self.stop_all();
                return Err(RegistryError::Start { id, source: err });
            }
            log::info!(
                "SourceRegistry: {} ({}) started from {}",
                id,
                config.display_name,
                config.origin()
            );
            self.active.insert(id, source);
        }
        Ok(())
    }

    /// Non-blocking read of each slot's latest frame.
    pub fn get_frames(&self) -> FramePair {
        let frame = |id: SourceId| self.active.get(&id).and_then(FrameSource::get_frame);
        FramePair {
            source1: frame(SourceId::Source1),
            source2: frame(SourceId::Source2),
        }
    }

    pub fn get_source_info(&self) -> BTreeMap<SourceId, SourceInfo> {
        let mut info: BTreeMap<SourceId, SourceInfo> = self
            .active
            .iter()
            .map(|(id, source)| (*id, source.info()))
            .collect();
        for (id, config) in &self.disabled {
            info.insert(*id, SourceInfo::disabled(*id, config));
        }
        info
    }

    pub fn summary(&self) -> RegistrySummary {
        let mut summary = RegistrySummary {
            disabled: self.disabled.len(),
            ..RegistrySummary::default()
        };
        for source in self.active.values() {
            match source.state() {
                SourceState::Running => summary.running += 1,
                SourceState::Failed => summary.failed += 1,
                SourceState::Idle | SourceState::Stopped => {}
            }
        }
        summary
    }

    /// Slots whose acquisition loop gave up.
    pub fn failed_sources(&self) -> Vec<SourceId> {
        self.active
            .iter()
            .filter(|(_, source)| source.state() == SourceState::Failed)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn restart_source(&mut self, id: SourceId) -> Result<(), RegistryError> {
        let source = self.active.get_mut(&id).ok_or(RegistryError::NotActive(id))?;
        source.restart()?;
        Ok(())
    }

    pub fn reconnect_source(&mut self, id: SourceId) -> Result<(), RegistryError> {
        let source = self.active.get_mut(&id).ok_or(RegistryError::NotActive(id))?;
        source.reconnect()?;
        Ok(())
    }

    /// Stop every source and forget all slots. Safe to call repeatedly.
    pub fn stop_all(&mut self) {
        for (id, mut source) in std::mem::take(&mut self.active) {
            log::debug!("SourceRegistry: stopping {}", id);
            source.stop();
        }
        self.disabled.clear();
    }
}

impl Drop for SourceRegistry {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{Capture, CaptureError, ConnectStrategy, SyntheticBackend};
    use std::time::{Duration, Instant};

    /// Synthetic captures, except that any address containing "broken" is
    /// refused.
    struct PickyBackend;

    impl CaptureBackend for PickyBackend {
        fn name(&self) -> &'static str {
            "picky"
        }

        fn open_device(
            &self,
            index: u32,
            settings: &CaptureSettings,
        ) -> Result<Box<dyn Capture>, CaptureError> {
            SyntheticBackend.open_device(index, settings)
        }

        fn open_url(
            &self,
            url: &str,
            strategy: ConnectStrategy,
            settings: &CaptureSettings,
        ) -> Result<Box<dyn Capture>, CaptureError> {
            if url.contains("broken") {
                return Err(CaptureError::Unavailable("connection refused".into()));
            }
            SyntheticBackend.open_url(url, strategy, settings)
        }
    }

    fn settings() -> CaptureSettings {
        CaptureSettings {
            width: 64,
            height: 48,
            fps: 200,
            restart_pause: Duration::from_millis(1),
            join_timeout: Duration::from_millis(500),
            ..CaptureSettings::default()
        }
    }

    fn registry() -> SourceRegistry {
        SourceRegistry::with_backend(Arc::new(PickyBackend))
    }

    fn wait_for_frames(registry: &SourceRegistry) -> FramePair {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let frames = registry.get_frames();
            if frames.source1.is_some() || Instant::now() > deadline {
                return frames;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn disabled_slot_is_reported_but_never_started() {
        let sources = SourcesConfig {
            source1: SourceConfig::url("stub://left", "Left"),
            source2: SourceConfig::url("stub://right", "Right").disabled(),
        };
        let mut reg = registry();
        reg.initialize(&sources, &settings()).unwrap();

        let frames = wait_for_frames(&reg);
        assert!(frames.source1.is_some());
        assert!(frames.source2.is_none());

        let info = reg.get_source_info();
        assert_eq!(info.len(), 2);
        let right = &info[&SourceId::Source2];
        assert!(!right.running);
        assert_eq!(right.source, "disabled");
        assert_eq!(right.display_name, "Right");
        assert!(info[&SourceId::Source1].running);

        let summary = reg.summary();
        assert_eq!((summary.running, summary.disabled), (1, 1));
        reg.stop_all();
        assert!(reg.get_source_info().is_empty());
    }

    #[test]
    fn failed_start_rolls_back_everything() {
        let sources = SourcesConfig {
            source1: SourceConfig::url("stub://left", "Left"),
            source2: SourceConfig::url("http://broken:8080/video", "Right"),
        };
        let mut reg = registry();
        let err = reg.initialize(&sources, &settings()).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Start {
                id: SourceId::Source2,
                ..
            }
        ));
        assert!(reg.get_frames().is_empty());
        assert!(reg.get_source_info().is_empty());
    }

    #[test]
    fn unknown_slot_cannot_be_restarted() {
        let mut reg = registry();
        assert!(matches!(
            reg.restart_source(SourceId::Source1),
            Err(RegistryError::NotActive(SourceId::Source1))
        ));
        reg.stop_all();
        reg.stop_all();
    }

    #[test]
    fn restart_source_resumes_frames() {
        let sources = SourcesConfig {
            source1: SourceConfig::url("stub://left", "Left"),
            source2: SourceConfig::url("stub://right?shift=8", "Right"),
        };
        let mut reg = registry();
        reg.initialize(&sources, &settings()).unwrap();
        reg.restart_source(SourceId::Source2).unwrap();
        assert!(reg.get_source_info()[&SourceId::Source2].running);
        assert!(reg.failed_sources().is_empty());
    }
}
