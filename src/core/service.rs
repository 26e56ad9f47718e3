/// Compose services and their assignment to containers
///
/// The service list comes from the compose tooling (`docker compose config
/// --hash=*` by default), which prints one `<name> <config hash>` pair per
/// line. Outside a compose project there are simply no services.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::core::command::{apply_template, run_command_with_output, CommandObject};
use crate::core::container::Container;
use crate::core::error::{DockerError, DockerResult};
use crate::utils::app_config::CommandTemplates;

#[derive(Debug)]
pub struct Service {
    name: String,
    id: String,
    container: RwLock<Weak<Container>>,
}

impl Service {
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            container: RwLock::new(Weak::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hash of the service's resolved compose config
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Container currently backing this service, if it is still alive
    pub fn container(&self) -> Option<Arc<Container>> {
        self.container
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .upgrade()
    }

    fn set_container(&self, container: Option<&Arc<Container>>) {
        *self.container.write().unwrap_or_else(PoisonError::into_inner) =
            container.map(Arc::downgrade).unwrap_or_default();
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    /// `(name, id)` pairs of the services in the current compose project
    async fn resolve_service_list(&self) -> DockerResult<Vec<(String, String)>>;
}

/// Discovers services by running the configured compose commands
pub struct ComposeDiscovery {
    templates: CommandTemplates,
    project_dir: Option<PathBuf>,
    in_compose_project: bool,
}

impl ComposeDiscovery {
    /// Check whether `project_dir` (or the current directory) holds a valid
    /// compose project. If not, discovery reports no services.
    pub async fn detect(templates: CommandTemplates, project_dir: Option<PathBuf>) -> Self {
        let obj = CommandObject::merged_with_defaults(&templates, CommandObject::default());
        let command = apply_template(&templates.check_docker_compose_config, &obj);

        let in_compose_project = match run_command_with_output(&command, project_dir.as_deref()).await {
            Ok(_) => true,
            Err(e) => {
                warn!(command = %command, error = %e, "not in a compose project");
                false
            }
        };

        Self {
            templates,
            project_dir,
            in_compose_project,
        }
    }

    pub fn in_compose_project(&self) -> bool {
        self.in_compose_project
    }
}

#[async_trait]
impl ServiceDiscovery for ComposeDiscovery {
    async fn resolve_service_list(&self) -> DockerResult<Vec<(String, String)>> {
        if !self.in_compose_project {
            return Ok(Vec::new());
        }

        let obj = CommandObject::merged_with_defaults(&self.templates, CommandObject::default());
        let command = apply_template(&self.templates.service_list, &obj);
        let output = run_command_with_output(&command, self.project_dir.as_deref())
            .await
            .map_err(|e| DockerError::Discovery(format!("{:#}", e)))?;

        Ok(parse_service_list(&output))
    }
}

/// Parse `<name> <hash>` lines; blank lines are skipped
pub fn parse_service_list(output: &str) -> Vec<(String, String)> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let mut parts = line.split_whitespace();
            let name = parts.next().unwrap_or_default().to_string();
            let id = parts.next().unwrap_or_default().to_string();
            (name, id)
        })
        .collect()
}

/// Caches the service set and assigns containers to it
pub struct ServiceResolver {
    discovery: Arc<dyn ServiceDiscovery>,
    cache: Mutex<Option<Vec<Arc<Service>>>>,
}

impl ServiceResolver {
    pub fn new(discovery: Arc<dyn ServiceDiscovery>) -> Self {
        Self {
            discovery,
            cache: Mutex::new(None),
        }
    }

    /// Service set, discovered on first use. A failed discovery yields no
    /// services and is not cached, so the next call tries again.
    pub async fn services(&self) -> Vec<Arc<Service>> {
        let mut cache = self.cache.lock().await;
        if let Some(services) = cache.as_ref() {
            return services.clone();
        }

        match self.discovery.resolve_service_list().await {
            Ok(pairs) => {
                let services: Vec<Arc<Service>> = pairs
                    .into_iter()
                    .map(|(name, id)| Arc::new(Service::new(name, id)))
                    .collect();
                debug!(count = services.len(), "discovered services");
                *cache = Some(services.clone());
                services
            }
            Err(e) => {
                warn!(error = %e, "service discovery failed, continuing without services");
                Vec::new()
            }
        }
    }

    /// Drop the cached service set
    pub async fn invalidate(&self) {
        *self.cache.lock().await = None;
    }

    /// Fetch (or reuse) the service set and assign containers to it
    pub async fn resolve(&self, containers: &[Arc<Container>]) -> Vec<Arc<Service>> {
        let services = self.services().await;
        assign_containers_to_services(containers, &services);
        services
    }
}

/// Give each service the first non one-off container carrying its name,
/// or clear it when there is none
pub fn assign_containers_to_services(containers: &[Arc<Container>], services: &[Arc<Service>]) {
    for service in services {
        let found = containers
            .iter()
            .find(|c| !c.is_one_off() && c.service_name() == service.name());
        service.set_container(found);
    }
}

/// Containers not represented by a service row: one-off containers, those
/// without a compose service, and those whose service is unknown here
pub fn standalone_containers(containers: &[Arc<Container>], services: &[Arc<Service>]) -> Vec<Arc<Container>> {
    containers
        .iter()
        .filter(|c| {
            let info = c.info();
            info.one_off
                || info.service_name.is_empty()
                || !services.iter().any(|s| s.name() == info.service_name)
        })
        .cloned()
        .collect()
}
