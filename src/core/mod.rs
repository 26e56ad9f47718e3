pub mod command;
pub mod container;
pub mod diagnostics;
pub mod display;
pub mod docker;
pub mod error;
pub mod monitor;
pub mod runtime;
pub mod service;
pub mod stats;

#[cfg(test)]
pub(crate) mod testing;

pub use container::{Container, ContainerInfo, ContainerRegistry};
pub use diagnostics::Diagnostics;
pub use display::DisplayOptions;
pub use docker::DockerCommand;
pub use error::{DockerError, DockerResult};
pub use monitor::{MonitorScheduler, StatsMonitor};
pub use runtime::{ContainerRuntime, DockerRuntime};
pub use service::{ComposeDiscovery, Service, ServiceDiscovery, ServiceResolver};
pub use stats::{ContainerStats, DerivedStats, RecordedStats, StatsHistory};
