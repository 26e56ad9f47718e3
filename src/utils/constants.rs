/// Docker and Docker Compose constants

use std::time::Duration;

/// Label overriding the container's display name
pub const LABEL_NAME: &str = "name";

/// Compose labels attached to every container started by compose
pub const LABEL_COMPOSE_SERVICE: &str = "com.docker.compose.service";
pub const LABEL_COMPOSE_PROJECT: &str = "com.docker.compose.project";
pub const LABEL_COMPOSE_CONTAINER_NUMBER: &str = "com.docker.compose.container-number";
pub const LABEL_COMPOSE_CONTAINER_NUMBER_LEGACY: &str = "com.docker.compose.container";
pub const LABEL_COMPOSE_ONEOFF: &str = "com.docker.compose.oneoff";

/// Value compose writes into the one-off label for `run` containers.
/// Compared case-sensitively.
pub const COMPOSE_ONEOFF_MARKER: &str = "True";

/// State string filtered by the "show exited" toggle
pub const STATE_EXITED: &str = "exited";

/// Placeholders understood by command templates
pub const TEMPLATE_DOCKER_COMPOSE: &str = "{{docker_compose}}";
pub const TEMPLATE_SERVICE: &str = "{{service}}";
pub const TEMPLATE_CONTAINER: &str = "{{container}}";

pub const DEFAULT_DOCKER_COMPOSE: &str = "docker compose";
pub const DEFAULT_CHECK_COMPOSE_CONFIG: &str = "{{docker_compose}} config --quiet";
pub const DEFAULT_SERVICE_LIST: &str = "{{docker_compose}} config --hash=*";
pub const DEFAULT_DOCKER_COMPOSE_CONFIG: &str = "{{docker_compose}} config";

/// Daemon socket used when DOCKER_HOST is unset
pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Longest stats line accepted from the daemon
pub const MAX_STATS_LINE_BYTES: usize = 1024 * 1024;

/// Period of the stats monitor scheduler
pub const MONITOR_TICK: Duration = Duration::from_secs(1);

/// Reads on a stats stream idle for longer than this end the monitor
pub const DEFAULT_STATS_IDLE_TIMEOUT_SECS: u64 = 30;

/// Backoff after a failed stats stream open
pub const RETRY_BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const DEFAULT_RETRY_BACKOFF_MAX_SECS: u64 = 30;

/// Interval between container list refreshes in the stats view
pub const DEFAULT_REFRESH_INTERVAL_MS: u64 = 2000;

pub const DEFAULT_LOG_LEVEL: &str = "warn";
