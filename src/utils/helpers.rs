/// Helper utilities for formatting and container state handling

use chrono::{DateTime, Local};

/// Format bytes to human-readable size
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Format a percentage with two decimals
pub fn format_percent(value: f64) -> String {
    format!("{:.2}%", value)
}

/// Format duration to human-readable string
pub fn format_duration(seconds: u64) -> String {
    let days = seconds / 86400;
    let hours = (seconds % 86400) / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Seconds elapsed since `at`, clamped at zero
pub fn seconds_since(at: DateTime<Local>) -> u64 {
    Local::now().signed_duration_since(at).num_seconds().max(0) as u64
}

/// Truncate string with ellipsis
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Docker container state as reported in the `State` field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Exited,
    Created,
    Paused,
    Restarting,
    Removing,
    Dead,
    Unknown,
}

impl From<&str> for ContainerState {
    fn from(state: &str) -> Self {
        match state {
            "running" => ContainerState::Running,
            "exited" => ContainerState::Exited,
            "created" => ContainerState::Created,
            "paused" => ContainerState::Paused,
            "restarting" => ContainerState::Restarting,
            "removing" => ContainerState::Removing,
            "dead" => ContainerState::Dead,
            _ => ContainerState::Unknown,
        }
    }
}

impl ContainerState {
    pub fn is_running(&self) -> bool {
        matches!(self, ContainerState::Running)
    }

    /// Sort rank for the container list; unranked states sort first
    pub fn rank(&self) -> u8 {
        match self {
            ContainerState::Running => 1,
            ContainerState::Exited => 2,
            ContainerState::Created => 3,
            _ => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Running => "running",
            ContainerState::Exited => "exited",
            ContainerState::Created => "created",
            ContainerState::Paused => "paused",
            ContainerState::Restarting => "restarting",
            ContainerState::Removing => "removing",
            ContainerState::Dead => "dead",
            ContainerState::Unknown => "unknown",
        }
    }

    /// Get color for terminal display
    pub fn color(&self) -> &'static str {
        match self {
            ContainerState::Running => "green",
            ContainerState::Exited => "bright black",
            ContainerState::Created => "cyan",
            ContainerState::Paused => "yellow",
            ContainerState::Restarting => "blue",
            ContainerState::Removing | ContainerState::Dead => "red",
            ContainerState::Unknown => "white",
        }
    }
}
