/// Container resource samples and their recorded history
///
/// Raw samples mirror the JSON objects of the Docker stats stream. Every sample
/// is stored together with the CPU and memory percentages derived at capture time.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::core::error::DockerError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerStats {
    pub read: String,
    pub cpu_stats: CpuStats,
    pub precpu_stats: CpuStats,
    pub memory_stats: MemoryStats,
    pub networks: HashMap<String, NetworkStats>,
    pub pids_stats: PidsStats,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuStats {
    pub cpu_usage: CpuUsage,
    pub system_cpu_usage: u64,
    pub online_cpus: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuUsage {
    pub total_usage: u64,
    pub percpu_usage: Option<Vec<u64>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryStats {
    pub usage: u64,
    pub max_usage: u64,
    pub limit: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PidsStats {
    pub current: u64,
}

impl ContainerStats {
    /// Parse one line of the newline-delimited stats stream
    pub fn from_json_line(container_id: &str, line: &[u8]) -> Result<Self, DockerError> {
        serde_json::from_slice(line).map_err(|e| DockerError::MalformedSample {
            id: container_id.to_string(),
            reason: e.to_string(),
        })
    }

    /// CPU usage relative to the host, scaled by the number of online cores.
    /// Returns 0 when the system delta is zero.
    pub fn cpu_percentage(&self) -> f64 {
        let cpu_delta = self
            .cpu_stats
            .cpu_usage
            .total_usage
            .saturating_sub(self.precpu_stats.cpu_usage.total_usage);
        let system_delta = self
            .cpu_stats
            .system_cpu_usage
            .saturating_sub(self.precpu_stats.system_cpu_usage);

        if system_delta == 0 {
            return 0.0;
        }

        (cpu_delta as f64 / system_delta as f64) * self.online_cpus() as f64 * 100.0
    }

    /// Memory usage as a share of the limit. Returns 0 without a limit.
    pub fn memory_percentage(&self) -> f64 {
        if self.memory_stats.limit == 0 {
            return 0.0;
        }
        (self.memory_stats.usage as f64 / self.memory_stats.limit as f64) * 100.0
    }

    /// Total received and transmitted bytes across all interfaces
    pub fn network_totals(&self) -> (u64, u64) {
        self.networks
            .values()
            .fold((0, 0), |(rx, tx), net| (rx + net.rx_bytes, tx + net.tx_bytes))
    }

    fn online_cpus(&self) -> u64 {
        if self.cpu_stats.online_cpus > 0 {
            return self.cpu_stats.online_cpus;
        }
        match &self.cpu_stats.cpu_usage.percpu_usage {
            Some(per_cpu) if !per_cpu.is_empty() => per_cpu.len() as u64,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DerivedStats {
    pub cpu_percentage: f64,
    pub memory_percentage: f64,
}

/// One timestamped sample, immutable once recorded
#[derive(Debug, Clone)]
pub struct RecordedStats {
    pub client_stats: ContainerStats,
    pub derived_stats: DerivedStats,
    pub recorded_at: DateTime<Local>,
}

impl RecordedStats {
    pub fn capture(stats: ContainerStats) -> Self {
        let derived_stats = DerivedStats {
            cpu_percentage: stats.cpu_percentage(),
            memory_percentage: stats.memory_percentage(),
        };
        Self {
            client_stats: stats,
            derived_stats,
            recorded_at: Local::now(),
        }
    }
}

/// Append-only sample history for a single container.
///
/// Writers append under the lock; readers take a snapshot of the shared
/// entries so iteration never races with an append.
#[derive(Debug, Default)]
pub struct StatsHistory {
    entries: Mutex<Vec<Arc<RecordedStats>>>,
}

impl StatsHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive percentages for a raw sample and append it
    pub fn record(&self, stats: ContainerStats) -> Arc<RecordedStats> {
        self.push(RecordedStats::capture(stats))
    }

    /// Append an already captured sample. Samples must arrive in
    /// `recorded_at` order for `since` to be exact.
    pub fn push(&self, recorded: RecordedStats) -> Arc<RecordedStats> {
        let recorded = Arc::new(recorded);
        self.lock().push(Arc::clone(&recorded));
        recorded
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn latest(&self) -> Option<Arc<RecordedStats>> {
        self.lock().last().cloned()
    }

    /// All samples in recording order
    pub fn snapshot(&self) -> Vec<Arc<RecordedStats>> {
        self.lock().clone()
    }

    /// Samples recorded at or after `since`
    pub fn since(&self, since: DateTime<Local>) -> Vec<Arc<RecordedStats>> {
        let entries = self.lock();
        let start = entries.partition_point(|s| s.recorded_at < since);
        entries[start..].to_vec()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<RecordedStats>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
