/// Filtering and sorting of the container list shown to the user

use std::sync::Arc;

use crate::core::container::Container;
use crate::utils::app_config::UserConfig;
use crate::utils::{ContainerState, STATE_EXITED};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DisplayOptions {
    pub show_exited: bool,
    pub show_all_containers: bool,
    pub legacy_sort: bool,
    pub ignore: Vec<String>,
}

impl From<&UserConfig> for DisplayOptions {
    fn from(config: &UserConfig) -> Self {
        Self {
            show_exited: config.gui.show_exited,
            show_all_containers: config.gui.show_all_containers,
            legacy_sort: config.gui.legacy_sort_containers,
            ignore: config.ignore.clone(),
        }
    }
}

/// Drop containers in the `exited` state unless they should be shown
pub fn filter_out_exited(containers: Vec<Arc<Container>>, show_exited: bool) -> Vec<Arc<Container>> {
    if show_exited {
        return containers;
    }
    containers
        .into_iter()
        .filter(|c| c.state_str() != STATE_EXITED)
        .collect()
}

/// Drop containers whose name contains any ignore entry (case-sensitive)
pub fn filter_out_ignored(containers: Vec<Arc<Container>>, ignore: &[String]) -> Vec<Arc<Container>> {
    if ignore.is_empty() {
        return containers;
    }
    containers
        .into_iter()
        .filter(|c| {
            let name = c.name();
            !ignore.iter().any(|pattern| name.contains(pattern.as_str()))
        })
        .collect()
}

/// Sort by state (running, exited, created; other states first) then by
/// name. In legacy mode the daemon's order is kept.
pub fn sorted(mut containers: Vec<Arc<Container>>, legacy_sort: bool) -> Vec<Arc<Container>> {
    if legacy_sort {
        return containers;
    }
    containers.sort_by_cached_key(|c| {
        let info = c.info();
        (ContainerState::from(info.state_str()).rank(), info.name)
    });
    containers
}

/// Exited filter, then ignore filter, then sort
pub fn display_containers(containers: Vec<Arc<Container>>, options: &DisplayOptions) -> Vec<Arc<Container>> {
    let containers = filter_out_exited(containers, options.show_exited);
    let containers = filter_out_ignored(containers, &options.ignore);
    sorted(containers, options.legacy_sort)
}
