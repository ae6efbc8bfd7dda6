//! The set of running stream supervisors, kept in line with the configured stream list.

use anyhow::{anyhow, Result};
use std::collections::{BTreeMap, HashSet};

use crate::config::StreamConfig;
use crate::status::StreamStatus;
use crate::supervisor::{PipelineSettings, StreamServices, StreamSupervisor};

/// Stream ids touched by one `reconcile` call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    pub updated: Vec<String>,
    pub restarted: Vec<String>,
    pub failed: Vec<String>,
}

impl ReconcileSummary {
    pub fn is_empty(&self) -> bool {
        self.started.is_empty()
            && self.stopped.is_empty()
            && self.updated.is_empty()
            && self.restarted.is_empty()
            && self.failed.is_empty()
    }
}

pub struct FleetManager {
    settings: PipelineSettings,
    services: StreamServices,
    supervisors: BTreeMap<String, StreamSupervisor>,
}

impl FleetManager {
    pub fn new(settings: PipelineSettings, services: StreamServices) -> Self {
        Self {
            settings,
            services,
            supervisors: BTreeMap::new(),
        }
    }

    /// Bring the running supervisors in line with `configs`.
    ///
    /// Disabled, source-less and removed streams are stopped. A changed source restarts the
    /// stream. Region and downstream changes are applied to the running supervisor in place.
    pub fn reconcile(&mut self, configs: &[StreamConfig]) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        let wanted: Vec<&StreamConfig> = configs.iter().filter(|c| c.is_runnable()).collect();
        let wanted_ids: HashSet<&str> = wanted.iter().map(|c| c.id.as_str()).collect();

        let removed: Vec<String> = self
            .supervisors
            .keys()
            .filter(|id| !wanted_ids.contains(id.as_str()))
            .cloned()
            .collect();
        let mut stopping: Vec<StreamSupervisor> = removed
            .iter()
            .filter_map(|id| self.supervisors.remove(id))
            .collect();
        for supervisor in &stopping {
            supervisor.begin_stop();
        }
        for supervisor in &mut stopping {
            supervisor.finish_stop();
            log::info!("FleetManager: stopped stream {}", supervisor.id());
        }
        summary.stopped = removed;

        for config in wanted {
            match self.supervisors.get_mut(&config.id) {
                None => match self.launch(config) {
                    Ok(()) => summary.started.push(config.id.clone()),
                    Err(err) => {
                        log::error!("FleetManager: cannot start stream {}: {:#}", config.id, err);
                        summary.failed.push(config.id.clone());
                    }
                },
                Some(existing) if existing.config().needs_restart(config) => {
                    existing.stop();
                    self.supervisors.remove(&config.id);
                    match self.launch(config) {
                        Ok(()) => {
                            log::info!("FleetManager: restarted stream {} on new source", config.id);
                            summary.restarted.push(config.id.clone());
                        }
                        Err(err) => {
                            log::error!("FleetManager: cannot restart stream {}: {:#}", config.id, err);
                            summary.failed.push(config.id.clone());
                        }
                    }
                }
                Some(existing) => {
                    if existing.config() != config {
                        existing.update_live(config);
                        summary.updated.push(config.id.clone());
                    }
                }
            }
        }
        summary
    }

    fn launch(&mut self, config: &StreamConfig) -> Result<()> {
        let mut supervisor =
            StreamSupervisor::new(config.clone(), self.settings.clone(), self.services.clone());
        supervisor.start()?;
        log::info!("FleetManager: started stream {} ({})", config.id, config.source);
        self.supervisors.insert(config.id.clone(), supervisor);
        Ok(())
    }

    /// Stop and start one stream with its current configuration.
    pub fn restart(&mut self, id: &str) -> Result<()> {
        let supervisor = self
            .supervisors
            .get_mut(id)
            .ok_or_else(|| anyhow!("unknown stream {}", id))?;
        supervisor.stop();
        supervisor.start()
    }

    pub fn status(&self, id: &str) -> Option<StreamStatus> {
        self.supervisors.get(id).map(StreamSupervisor::status)
    }

    /// Current status of every managed stream, ordered by id.
    pub fn statuses(&self) -> Vec<(String, StreamStatus)> {
        self.supervisors
            .iter()
            .map(|(id, supervisor)| (id.clone(), supervisor.status()))
            .collect()
    }

    pub fn stream_ids(&self) -> Vec<String> {
        self.supervisors.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.supervisors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.supervisors.is_empty()
    }

    /// Stop every stream. All streams are signalled before any is waited on.
    pub fn shutdown(&mut self) {
        for supervisor in self.supervisors.values() {
            supervisor.begin_stop();
        }
        for supervisor in self.supervisors.values_mut() {
            supervisor.finish_stop();
        }
        let stopped = self.supervisors.len();
        self.supervisors.clear();
        if stopped > 0 {
            log::info!("FleetManager: shut down {} streams", stopped);
        }
    }
}

impl Drop for FleetManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::DetectionRegion;
    use crate::plates::InMemoryPlateStore;
    use crate::supervisor::testing::{fast_settings, stub_services};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn fleet() -> Result<FleetManager> {
        Ok(FleetManager::new(
            fast_settings(),
            stub_services(Arc::new(InMemoryPlateStore::new()))?,
        ))
    }

    fn wait_running(fleet: &FleetManager, id: &str) -> Option<StreamStatus> {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let status = fleet.status(id);
            if status == Some(StreamStatus::Running) || Instant::now() >= deadline {
                return status;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn reconcile_starts_updates_and_stops() -> Result<()> {
        let mut fleet = fleet()?;
        let a = StreamConfig::new("a", "stub://a?width=32&height=32");
        let b = StreamConfig::new("b", "stub://b?width=32&height=32");
        let mut idle = StreamConfig::new("c", "");
        idle.enabled = true;

        let summary = fleet.reconcile(&[a.clone(), b.clone(), idle]);
        assert_eq!(summary.started, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(fleet.stream_ids(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(wait_running(&fleet, "a"), Some(StreamStatus::Running));

        let mut a2 = a.clone();
        a2.detection_region = Some(DetectionRegion::new(0.1, 0.1, 0.9, 0.9));
        let mut b_off = b.clone();
        b_off.enabled = false;
        let summary = fleet.reconcile(&[a2.clone(), b_off]);
        assert_eq!(summary.updated, vec!["a".to_string()]);
        assert_eq!(summary.stopped, vec!["b".to_string()]);
        assert!(summary.restarted.is_empty());
        assert_eq!(fleet.status("a"), Some(StreamStatus::Running));
        assert_eq!(fleet.status("b"), None);

        assert!(fleet.reconcile(&[a2.clone()]).is_empty());

        let mut a3 = a2;
        a3.source = "stub://a?width=48&height=32".into();
        let summary = fleet.reconcile(&[a3]);
        assert_eq!(summary.restarted, vec!["a".to_string()]);

        fleet.shutdown();
        assert!(fleet.is_empty());
        Ok(())
    }

    #[test]
    fn restart_unknown_stream_fails() -> Result<()> {
        let mut fleet = fleet()?;
        assert!(fleet.restart("nope").is_err());
        fleet.reconcile(&[StreamConfig::new("a", "stub://a?width=16&height=16")]);
        fleet.restart("a")?;
        assert_eq!(wait_running(&fleet, "a"), Some(StreamStatus::Running));
        Ok(())
    }
}
