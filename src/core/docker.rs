/// Docker and Docker Compose integration
///
/// `DockerCommand` ties the registry, the service resolver and the display
/// pipeline together and owns the stats monitoring lifecycle. It is what a
/// dashboard talks to.

use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::command::{apply_template, run_command_with_output, CommandObject};
use crate::core::container::{Container, ContainerRegistry};
use crate::core::diagnostics::Diagnostics;
use crate::core::display::{display_containers, DisplayOptions};
use crate::core::error::DockerResult;
use crate::core::monitor::{MonitorScheduler, MonitorSettings, StatsMonitor};
use crate::core::runtime::{ContainerRuntime, DockerRuntime};
use crate::core::service::{
    assign_containers_to_services, standalone_containers, ComposeDiscovery, Service,
    ServiceDiscovery, ServiceResolver,
};
use crate::utils::app_config::{CommandTemplates, UserConfig};

pub struct DockerCommand {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<ContainerRegistry>,
    resolver: ServiceResolver,
    diagnostics: Diagnostics,
    display_options: RwLock<DisplayOptions>,
    monitor_settings: MonitorSettings,
    templates: CommandTemplates,
    project_dir: Option<PathBuf>,
    // serializes whole refresh cycles (listing, service assignment, display)
    service_lock: Mutex<()>,
    display_containers: RwLock<Vec<Arc<Container>>>,
}

impl DockerCommand {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        discovery: Arc<dyn ServiceDiscovery>,
        config: &UserConfig,
        diagnostics: Diagnostics,
    ) -> Self {
        Self {
            registry: Arc::new(ContainerRegistry::new(Arc::clone(&runtime))),
            runtime,
            resolver: ServiceResolver::new(discovery),
            diagnostics,
            display_options: RwLock::new(DisplayOptions::from(config)),
            monitor_settings: MonitorSettings::from(&config.stats),
            templates: config.command_templates.clone(),
            project_dir: None,
            service_lock: Mutex::new(()),
            display_containers: RwLock::new(Vec::new()),
        }
    }

    /// Connect to the local daemon and detect the compose project in
    /// `project_dir` (current directory when `None`)
    pub async fn connect(
        config: &UserConfig,
        project_dir: Option<PathBuf>,
        diagnostics: Diagnostics,
    ) -> DockerResult<Self> {
        let runtime = DockerRuntime::connect()?;
        runtime.ping().await?;
        info!("connected to docker daemon");

        let discovery = ComposeDiscovery::detect(config.command_templates.clone(), project_dir.clone()).await;
        Ok(Self::new(Arc::new(runtime), Arc::new(discovery), config, diagnostics).with_project_dir(project_dir))
    }

    /// Directory compose commands run in (current directory when `None`)
    pub fn with_project_dir(mut self, project_dir: Option<PathBuf>) -> Self {
        self.project_dir = project_dir;
        self
    }

    /// Rendered compose configuration, or the failure text when the compose
    /// command fails
    pub async fn docker_compose_config(&self) -> String {
        let obj = CommandObject::merged_with_defaults(&self.templates, CommandObject::default());
        let command = apply_template(&self.templates.docker_compose_config, &obj);

        match run_command_with_output(&command, self.project_dir.as_deref()).await {
            Ok(output) => output,
            Err(e) => format!("{:#}", e),
        }
    }

    /// Re-list containers, assign them to services and rebuild the display
    /// list. `current_services` skips discovery when the caller already holds
    /// the service set.
    ///
    /// Returns the display containers and the services. A listing failure is
    /// returned and leaves the previous state in place.
    pub async fn refresh(
        &self,
        current_services: Option<Vec<Arc<Service>>>,
    ) -> DockerResult<(Vec<Arc<Container>>, Vec<Arc<Service>>)> {
        let _cycle = self.service_lock.lock().await;

        let containers = self.registry.refresh().await?;

        let services = match current_services {
            Some(services) => {
                assign_containers_to_services(&containers, &services);
                services
            }
            None => self.resolver.resolve(&containers).await,
        };

        let options = self.display_options();
        let base = if options.show_all_containers {
            containers
        } else {
            standalone_containers(&containers, &services)
        };
        let shown = display_containers(base, &options);
        debug!(
            services = services.len(),
            displayed = shown.len(),
            "refreshed containers"
        );

        *self
            .display_containers
            .write()
            .unwrap_or_else(PoisonError::into_inner) = shown.clone();
        Ok((shown, services))
    }

    /// Attach inspect data to every known container
    pub async fn update_details(&self) {
        self.registry.update_details().await;
    }

    /// Start the stats monitor scheduler in the background. It runs until
    /// `cancel` fires.
    pub fn start_monitoring(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::new(StatsMonitor::new(
            Arc::clone(&self.runtime),
            self.diagnostics.clone(),
            self.monitor_settings.idle_timeout,
        ));
        let scheduler = MonitorScheduler::new(Arc::clone(&self.registry), monitor, self.monitor_settings);
        tokio::spawn(scheduler.run(cancel))
    }

    /// Every known container in daemon order
    pub async fn containers(&self) -> Vec<Arc<Container>> {
        self.registry.containers().await
    }

    pub async fn container(&self, id: &str) -> Option<Arc<Container>> {
        self.registry.get(id).await
    }

    /// Display list built by the last successful refresh
    pub fn display_containers(&self) -> Vec<Arc<Container>> {
        self.display_containers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Forget the cached service set; the next refresh rediscovers it
    pub async fn invalidate_services(&self) {
        self.resolver.invalidate().await;
    }

    pub fn display_options(&self) -> DisplayOptions {
        self.display_options
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Flip whether exited containers are shown. Takes effect on the next
    /// refresh. Returns the new value.
    pub fn toggle_show_exited(&self) -> bool {
        let mut options = self
            .display_options
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        options.show_exited = !options.show_exited;
        options.show_exited
    }

    pub fn set_show_all_containers(&self, show_all: bool) {
        self.display_options
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .show_all_containers = show_all;
    }

    pub fn set_show_exited(&self, show_exited: bool) {
        self.display_options
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .show_exited = show_exited;
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }
}
