/// Containers and the registry that keeps them in sync with the daemon
///
/// A `Container` is identified by its ID for the whole life of the process.
/// Refreshing overwrites what the daemon reports about it but keeps what we
/// accumulated ourselves: the stats history and the monitoring flag.

use bollard::models::{ContainerInspectResponse, ContainerSummary};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::core::error::DockerResult;
use crate::core::runtime::ContainerRuntime;
use crate::core::stats::{ContainerStats, RecordedStats, StatsHistory};
use crate::utils::{
    ContainerState, COMPOSE_ONEOFF_MARKER, LABEL_COMPOSE_CONTAINER_NUMBER,
    LABEL_COMPOSE_CONTAINER_NUMBER_LEGACY, LABEL_COMPOSE_ONEOFF, LABEL_COMPOSE_PROJECT,
    LABEL_COMPOSE_SERVICE, LABEL_NAME,
};

/// Attributes observed from the daemon, replaced on every refresh
#[derive(Debug, Clone, Default)]
pub struct ContainerInfo {
    pub name: String,
    pub service_name: String,
    pub project_name: String,
    pub container_number: String,
    pub one_off: bool,
    pub summary: ContainerSummary,
}

impl ContainerInfo {
    pub fn from_summary(summary: ContainerSummary) -> Self {
        let labels = summary.labels.clone().unwrap_or_default();
        let label = |key: &str| labels.get(key).cloned().unwrap_or_default();

        // a `name` label wins over the daemon-assigned name
        let name = match labels.get(LABEL_NAME) {
            Some(name) => name.clone(),
            None => summary
                .names
                .as_ref()
                .and_then(|names| names.first())
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
        };

        let container_number = labels
            .get(LABEL_COMPOSE_CONTAINER_NUMBER)
            .or_else(|| labels.get(LABEL_COMPOSE_CONTAINER_NUMBER_LEGACY))
            .cloned()
            .unwrap_or_default();

        Self {
            name,
            service_name: label(LABEL_COMPOSE_SERVICE),
            project_name: label(LABEL_COMPOSE_PROJECT),
            container_number,
            one_off: labels.get(LABEL_COMPOSE_ONEOFF).map(String::as_str) == Some(COMPOSE_ONEOFF_MARKER),
            summary,
        }
    }

    /// Raw `State` string as reported by the daemon
    pub fn state_str(&self) -> &str {
        self.summary.state.as_deref().unwrap_or("")
    }

    pub fn state(&self) -> ContainerState {
        ContainerState::from(self.state_str())
    }
}

#[derive(Debug)]
pub struct Container {
    id: String,
    info: RwLock<ContainerInfo>,
    details: RwLock<Option<ContainerInspectResponse>>,
    monitoring_stats: AtomicBool,
    stats: StatsHistory,
}

impl Container {
    pub fn new(id: impl Into<String>, info: ContainerInfo) -> Self {
        Self {
            id: id.into(),
            info: RwLock::new(info),
            details: RwLock::new(None),
            monitoring_stats: AtomicBool::new(false),
            stats: StatsHistory::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn info(&self) -> ContainerInfo {
        self.read_info(|info| info.clone())
    }

    pub fn name(&self) -> String {
        self.read_info(|info| info.name.clone())
    }

    pub fn service_name(&self) -> String {
        self.read_info(|info| info.service_name.clone())
    }

    pub fn project_name(&self) -> String {
        self.read_info(|info| info.project_name.clone())
    }

    pub fn container_number(&self) -> String {
        self.read_info(|info| info.container_number.clone())
    }

    pub fn is_one_off(&self) -> bool {
        self.read_info(|info| info.one_off)
    }

    pub fn state_str(&self) -> String {
        self.read_info(|info| info.state_str().to_string())
    }

    pub fn state(&self) -> ContainerState {
        self.read_info(ContainerInfo::state)
    }

    /// Inspect data from the last successful detail update
    pub fn details(&self) -> Option<ContainerInspectResponse> {
        self.details
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_monitoring_stats(&self) -> bool {
        self.monitoring_stats.load(Ordering::Acquire)
    }

    /// Transition from unmonitored to monitored. Only one caller can win.
    pub fn try_claim_monitoring(&self) -> bool {
        self.monitoring_stats
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release_monitoring(&self) {
        self.monitoring_stats.store(false, Ordering::Release);
    }

    pub fn stats(&self) -> &StatsHistory {
        &self.stats
    }

    pub fn record_stats(&self, stats: ContainerStats) -> Arc<RecordedStats> {
        self.stats.record(stats)
    }

    fn read_info<T>(&self, f: impl FnOnce(&ContainerInfo) -> T) -> T {
        f(&self.info.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn set_info(&self, info: ContainerInfo) {
        *self.info.write().unwrap_or_else(PoisonError::into_inner) = info;
    }

    fn set_details(&self, details: ContainerInspectResponse) {
        *self.details.write().unwrap_or_else(PoisonError::into_inner) = Some(details);
    }
}

/// Holds the current container set. `refresh` and `update_details` run under
/// the same lock so they never interleave.
pub struct ContainerRegistry {
    runtime: Arc<dyn ContainerRuntime>,
    containers: Mutex<Vec<Arc<Container>>>,
}

impl ContainerRegistry {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            containers: Mutex::new(Vec::new()),
        }
    }

    /// Re-list all containers and merge them with the ones already held.
    /// On a listing failure the held set is left untouched.
    pub async fn refresh(&self) -> DockerResult<Vec<Arc<Container>>> {
        let mut held = self.containers.lock().await;

        let summaries = self.runtime.list_containers().await?;

        let existing: HashMap<String, Arc<Container>> = held
            .iter()
            .map(|c| (c.id.clone(), Arc::clone(c)))
            .collect();

        let fresh: Vec<Arc<Container>> = summaries
            .into_iter()
            .filter_map(|summary| {
                let Some(id) = summary.id.clone().filter(|id| !id.is_empty()) else {
                    warn!(names = ?summary.names, "skipping container without an id");
                    return None;
                };
                let info = ContainerInfo::from_summary(summary);
                let container = match existing.get(&id) {
                    Some(container) => {
                        container.set_info(info);
                        Arc::clone(container)
                    }
                    None => {
                        debug!(container = %id, name = %info.name, "new container");
                        Arc::new(Container::new(id, info))
                    }
                };
                Some(container)
            })
            .collect();

        *held = fresh.clone();
        Ok(fresh)
    }

    /// Attach inspect data to every held container. A failed inspect is
    /// logged and leaves that container's previous details in place.
    pub async fn update_details(&self) {
        let held = self.containers.lock().await;

        let inspections = held.iter().map(|container| async move {
            (container, self.runtime.inspect_container(container.id()).await)
        });

        for (container, result) in join_all(inspections).await {
            match result {
                Ok(details) => container.set_details(details),
                Err(e) => warn!(container = %container.id(), error = %e, "inspect failed"),
            }
        }
    }

    /// Currently held containers in daemon order
    pub async fn containers(&self) -> Vec<Arc<Container>> {
        self.containers.lock().await.clone()
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Container>> {
        self.containers
            .lock()
            .await
            .iter()
            .find(|c| c.id() == id)
            .cloned()
    }
}
