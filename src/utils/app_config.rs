/// Application configuration management
/// Stores user preferences in ~/.config/dockmon/config.toml
///
/// The file only needs to contain the settings that differ from the defaults.
/// It is parsed into a `UserConfigOverride` and applied onto
/// `UserConfig::default()` field by field.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::constants::{
    DEFAULT_CHECK_COMPOSE_CONFIG, DEFAULT_DOCKER_COMPOSE, DEFAULT_DOCKER_COMPOSE_CONFIG, DEFAULT_LOG_LEVEL,
    DEFAULT_REFRESH_INTERVAL_MS, DEFAULT_RETRY_BACKOFF_MAX_SECS, DEFAULT_SERVICE_LIST,
    DEFAULT_STATS_IDLE_TIMEOUT_SECS, MONITOR_TICK,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuiConfig {
    /// Show containers backing a service next to the service rows
    pub show_all_containers: bool,
    /// Keep the daemon's order instead of sorting by state and name
    pub legacy_sort_containers: bool,
    pub show_exited: bool,
}

impl Default for GuiConfig {
    fn default() -> Self {
        Self {
            show_all_containers: false,
            legacy_sort_containers: false,
            show_exited: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandTemplates {
    pub docker_compose: String,
    pub check_docker_compose_config: String,
    /// Must print one `<service> <config hash>` pair per line
    pub service_list: String,
    pub docker_compose_config: String,
}

impl Default for CommandTemplates {
    fn default() -> Self {
        Self {
            docker_compose: DEFAULT_DOCKER_COMPOSE.to_string(),
            check_docker_compose_config: DEFAULT_CHECK_COMPOSE_CONFIG.to_string(),
            service_list: DEFAULT_SERVICE_LIST.to_string(),
            docker_compose_config: DEFAULT_DOCKER_COMPOSE_CONFIG.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsConfig {
    pub monitor_interval_ms: u64,
    /// 0 disables the idle timeout
    pub idle_timeout_secs: u64,
    pub retry_backoff_max_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            monitor_interval_ms: MONITOR_TICK.as_millis() as u64,
            idle_timeout_secs: DEFAULT_STATS_IDLE_TIMEOUT_SECS,
            retry_backoff_max_secs: DEFAULT_RETRY_BACKOFF_MAX_SECS,
        }
    }
}

impl StatsConfig {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms.max(1))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn retry_backoff_max(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_max_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserConfig {
    /// Containers whose name contains any of these are hidden
    pub ignore: Vec<String>,
    pub refresh_interval_ms: u64,
    pub log_level: String,
    pub gui: GuiConfig,
    pub command_templates: CommandTemplates,
    pub stats: StatsConfig,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            gui: GuiConfig::default(),
            ignore: Vec::new(),
            command_templates: CommandTemplates::default(),
            stats: StatsConfig::default(),
            refresh_interval_ms: DEFAULT_REFRESH_INTERVAL_MS,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GuiOverride {
    pub show_all_containers: Option<bool>,
    pub legacy_sort_containers: Option<bool>,
    pub show_exited: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandTemplatesOverride {
    pub docker_compose: Option<String>,
    pub check_docker_compose_config: Option<String>,
    pub service_list: Option<String>,
    pub docker_compose_config: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatsOverride {
    pub monitor_interval_ms: Option<u64>,
    pub idle_timeout_secs: Option<u64>,
    pub retry_backoff_max_secs: Option<u64>,
}

/// User-supplied settings; every field is optional
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserConfigOverride {
    #[serde(default)]
    pub gui: GuiOverride,
    pub ignore: Option<Vec<String>>,
    #[serde(default)]
    pub command_templates: CommandTemplatesOverride,
    #[serde(default)]
    pub stats: StatsOverride,
    pub refresh_interval_ms: Option<u64>,
    pub log_level: Option<String>,
}

impl UserConfig {
    /// Apply `overrides` onto `base`. Fields left unset keep the base value.
    pub fn merged(base: UserConfig, overrides: UserConfigOverride) -> UserConfig {
        let UserConfig {
            gui,
            ignore,
            command_templates,
            stats,
            refresh_interval_ms,
            log_level,
        } = base;

        UserConfig {
            gui: GuiConfig {
                show_all_containers: overrides
                    .gui
                    .show_all_containers
                    .unwrap_or(gui.show_all_containers),
                legacy_sort_containers: overrides
                    .gui
                    .legacy_sort_containers
                    .unwrap_or(gui.legacy_sort_containers),
                show_exited: overrides.gui.show_exited.unwrap_or(gui.show_exited),
            },
            ignore: overrides.ignore.unwrap_or(ignore),
            command_templates: CommandTemplates {
                docker_compose: overrides
                    .command_templates
                    .docker_compose
                    .unwrap_or(command_templates.docker_compose),
                check_docker_compose_config: overrides
                    .command_templates
                    .check_docker_compose_config
                    .unwrap_or(command_templates.check_docker_compose_config),
                service_list: overrides
                    .command_templates
                    .service_list
                    .unwrap_or(command_templates.service_list),
                docker_compose_config: overrides
                    .command_templates
                    .docker_compose_config
                    .unwrap_or(command_templates.docker_compose_config),
            },
            stats: StatsConfig {
                monitor_interval_ms: overrides
                    .stats
                    .monitor_interval_ms
                    .unwrap_or(stats.monitor_interval_ms),
                idle_timeout_secs: overrides
                    .stats
                    .idle_timeout_secs
                    .unwrap_or(stats.idle_timeout_secs),
                retry_backoff_max_secs: overrides
                    .stats
                    .retry_backoff_max_secs
                    .unwrap_or(stats.retry_backoff_max_secs),
            },
            refresh_interval_ms: overrides.refresh_interval_ms.unwrap_or(refresh_interval_ms),
            log_level: overrides.log_level.unwrap_or(log_level),
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms.max(1))
    }
}

pub struct AppConfig;

impl AppConfig {
    /// Get config file path
    pub fn config_path() -> Result<PathBuf> {
        let home = std::env::var("HOME")
            .context("HOME environment variable not set")?;
        Ok(PathBuf::from(home)
            .join(".config")
            .join("dockmon")
            .join("config.toml"))
    }

    /// Load the user configuration, falling back to defaults without a file
    pub fn load() -> Result<UserConfig> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<UserConfig> {
        if !path.exists() {
            return Ok(UserConfig::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let overrides: UserConfigOverride = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(UserConfig::merged(UserConfig::default(), overrides))
    }

    /// Save the full configuration to file
    pub fn save_to(config: &UserConfig, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(config)
            .context("Failed to serialize config")?;

        fs::write(path, contents)
            .context("Failed to write config file")?;

        Ok(())
    }
}
