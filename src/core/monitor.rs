/// Per-container stats monitors and the scheduler that spawns them
///
/// The scheduler wakes up once per interval, looks at the registry and starts a
/// `StatsMonitor` task for every container that is not being monitored yet.
/// A monitor streams samples into the container's history until the stream
/// ends, fails, or stays silent for longer than the idle timeout. Monitors
/// whose stream could not be opened are retried with exponential backoff.

use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::container::{Container, ContainerRegistry};
use crate::core::diagnostics::Diagnostics;
use crate::core::error::DockerError;
use crate::core::runtime::ContainerRuntime;
use crate::utils::app_config::StatsConfig;
use crate::utils::RETRY_BACKOFF_BASE;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorSettings {
    pub interval: Duration,
    pub idle_timeout: Option<Duration>,
    pub backoff_max: Duration,
}

impl From<&StatsConfig> for MonitorSettings {
    fn from(config: &StatsConfig) -> Self {
        Self {
            interval: config.monitor_interval(),
            idle_timeout: config.idle_timeout(),
            backoff_max: config.retry_backoff_max(),
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self::from(&StatsConfig::default())
    }
}

/// Why a monitor stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    OpenFailed,
    StreamEnded,
    ReadFailed,
    IdleTimeout,
}

/// Clears the monitoring flag however the monitor future ends, including
/// when its task is aborted
struct MonitoringGuard<'a>(&'a Container);

impl Drop for MonitoringGuard<'_> {
    fn drop(&mut self) {
        self.0.release_monitoring();
    }
}

pub struct StatsMonitor {
    runtime: Arc<dyn ContainerRuntime>,
    diagnostics: Diagnostics,
    idle_timeout: Option<Duration>,
}

impl StatsMonitor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        diagnostics: Diagnostics,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            runtime,
            diagnostics,
            idle_timeout,
        }
    }

    /// Stream stats for `container` until the stream stops.
    ///
    /// The caller must already hold the container's monitoring claim
    /// (`Container::try_claim_monitoring`); it is released on return.
    pub async fn run(&self, container: Arc<Container>) -> MonitorExit {
        let _guard = MonitoringGuard(&container);
        let id = container.id();

        // the open waits for the daemon's response headers, bound it like a read
        let opened = match self.idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.runtime.stream_stats(id)).await {
                Ok(opened) => opened,
                Err(_) => {
                    self.diagnostics.report(DockerError::StatsIdle {
                        id: id.to_string(),
                        secs: limit.as_secs(),
                    });
                    return MonitorExit::OpenFailed;
                }
            },
            None => self.runtime.stream_stats(id).await,
        };

        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                self.diagnostics.report(e);
                return MonitorExit::OpenFailed;
            }
        };
        debug!(container = %id, "stats stream opened");

        loop {
            let next = match self.idle_timeout {
                Some(limit) => match tokio::time::timeout(limit, stream.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        self.diagnostics.report(DockerError::StatsIdle {
                            id: id.to_string(),
                            secs: limit.as_secs(),
                        });
                        return MonitorExit::IdleTimeout;
                    }
                },
                None => stream.next().await,
            };

            match next {
                None => {
                    debug!(container = %id, "stats stream ended");
                    return MonitorExit::StreamEnded;
                }
                Some(Ok(stats)) => {
                    container.record_stats(stats);
                }
                Some(Err(e)) if e.is_recoverable_sample() => {
                    debug!(container = %id, error = %e, "dropping stats sample");
                }
                Some(Err(e)) => {
                    self.diagnostics.report(e);
                    return MonitorExit::ReadFailed;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Backoff {
    failures: u32,
    retry_at: Instant,
}

/// Spawns and supervises one `StatsMonitor` task per container
pub struct MonitorScheduler {
    registry: Arc<ContainerRegistry>,
    monitor: Arc<StatsMonitor>,
    settings: MonitorSettings,
    tasks: HashMap<String, JoinHandle<MonitorExit>>,
    backoff: HashMap<String, Backoff>,
}

impl MonitorScheduler {
    pub fn new(registry: Arc<ContainerRegistry>, monitor: Arc<StatsMonitor>, settings: MonitorSettings) -> Self {
        Self {
            registry,
            monitor,
            settings,
            tasks: HashMap::new(),
            backoff: HashMap::new(),
        }
    }

    /// Tick until `cancel` fires, then abort every running monitor
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = self.settings.interval.as_millis() as u64, "stats monitoring started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }

        self.shutdown();
        info!("stats monitoring stopped");
    }

    /// One scheduling pass: reap finished monitors, stop monitors of vanished
    /// containers and start monitors for unmonitored ones
    pub async fn tick(&mut self) {
        self.reap_finished().await;

        let containers = self.registry.containers().await;
        let live: HashSet<&str> = containers.iter().map(|c| c.id()).collect();

        self.tasks.retain(|id, handle| {
            if live.contains(id.as_str()) {
                return true;
            }
            debug!(container = %id, "container gone, stopping stats monitor");
            handle.abort();
            false
        });
        self.backoff.retain(|id, _| live.contains(id.as_str()));

        let now = Instant::now();
        for container in containers {
            if self.tasks.contains_key(container.id()) {
                continue;
            }
            if self
                .backoff
                .get(container.id())
                .is_some_and(|b| now < b.retry_at)
            {
                continue;
            }
            if !container.try_claim_monitoring() {
                continue;
            }

            let id = container.id().to_string();
            let monitor = Arc::clone(&self.monitor);
            let handle = tokio::spawn(async move { monitor.run(container).await });
            self.tasks.insert(id, handle);
        }
    }

    /// Number of monitor tasks currently tracked
    pub fn active_monitors(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_monitoring(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }

    /// Earliest time another stream open will be attempted, if backing off
    pub fn retry_at(&self, id: &str) -> Option<Instant> {
        self.backoff.get(id).map(|b| b.retry_at)
    }

    async fn reap_finished(&mut self) {
        let finished: Vec<String> = self
            .tasks
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();

        for id in finished {
            let Some(handle) = self.tasks.remove(&id) else {
                continue;
            };
            match handle.await {
                Ok(MonitorExit::OpenFailed) => {
                    let failures = self.backoff.get(&id).map_or(0, |b| b.failures) + 1;
                    let delay = backoff_delay(failures, self.settings.backoff_max);
                    debug!(container = %id, failures, delay_ms = delay.as_millis() as u64, "backing off stats stream");
                    self.backoff.insert(
                        id,
                        Backoff {
                            failures,
                            retry_at: Instant::now() + delay,
                        },
                    );
                }
                Ok(exit) => {
                    debug!(container = %id, ?exit, "stats monitor finished");
                    self.backoff.remove(&id);
                }
                Err(e) => {
                    warn!(container = %id, error = %e, "stats monitor task failed");
                    self.backoff.remove(&id);
                }
            }
        }
    }

    fn shutdown(&mut self) {
        for (id, handle) in self.tasks.drain() {
            debug!(container = %id, "aborting stats monitor");
            handle.abort();
        }
        self.backoff.clear();
    }
}

/// 1s, 2s, 4s, ... capped at `max`
fn backoff_delay(failures: u32, max: Duration) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    RETRY_BACKOFF_BASE
        .saturating_mul(1u32 << exponent)
        .min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::runtime::{DockerRuntime, StatsEndpoint};
    use crate::core::testing::{
        serve_once, serve_silently, stats_line, summary, FakeRuntime, StatsScript, StreamItem,
    };
    use tokio::sync::mpsc::UnboundedReceiver;

    fn setup(idle_timeout: Option<Duration>) -> (Arc<FakeRuntime>, Arc<StatsMonitor>, UnboundedReceiver<DockerError>) {
        let runtime = Arc::new(FakeRuntime::new());
        let (diagnostics, rx) = Diagnostics::channel();
        let monitor = Arc::new(StatsMonitor::new(runtime.clone(), diagnostics, idle_timeout));
        (runtime, monitor, rx)
    }

    fn claimed(id: &str) -> Arc<Container> {
        let container = Arc::new(Container::new(id, Default::default()));
        assert!(container.try_claim_monitoring());
        container
    }

    fn daemon_monitor(
        addr: std::net::SocketAddr,
        idle_timeout: Option<Duration>,
    ) -> (StatsMonitor, UnboundedReceiver<DockerError>) {
        let docker = bollard::Docker::connect_with_http(&format!("tcp://{addr}"), 5, bollard::API_DEFAULT_VERSION).unwrap();
        let runtime = DockerRuntime::with_endpoint(docker, StatsEndpoint::Tcp(addr.to_string()));
        let (diagnostics, rx) = Diagnostics::channel();
        (StatsMonitor::new(Arc::new(runtime), diagnostics, idle_timeout), rx)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[test]
    fn test_backoff_delay() {
        let max = Duration::from_secs(30);
        assert_eq!(backoff_delay(1, max), Duration::from_secs(1));
        assert_eq!(backoff_delay(2, max), Duration::from_secs(2));
        assert_eq!(backoff_delay(4, max), Duration::from_secs(8));
        assert_eq!(backoff_delay(6, max), Duration::from_secs(30));
        assert_eq!(backoff_delay(u32::MAX, max), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_monitor_records_samples_until_stream_ends() {
        let (runtime, monitor, _rx) = setup(None);
        runtime.push_stats(
            "c1",
            StatsScript::Finite(vec![
                StreamItem::Line(stats_line(100, 1000, 50, 100)),
                StreamItem::Line("{garbage".to_string()),
                StreamItem::Line(stats_line(300, 1000, 25, 100)),
            ]),
        );

        let container = claimed("c1");
        let exit = monitor.run(Arc::clone(&container)).await;

        assert_eq!(exit, MonitorExit::StreamEnded);
        assert!(!container.is_monitoring_stats());

        let history = container.stats().snapshot();
        assert_eq!(history.len(), 2);
        assert!((history[0].derived_stats.cpu_percentage - 10.0).abs() < 1e-9);
        assert_eq!(history[0].derived_stats.memory_percentage, 50.0);
        assert!((history[1].derived_stats.cpu_percentage - 30.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_monitor_open_failure_releases_flag() {
        let (runtime, monitor, mut rx) = setup(None);
        runtime.push_stats("c1", StatsScript::FailOpen);

        let container = claimed("c1");
        assert_eq!(monitor.run(Arc::clone(&container)).await, MonitorExit::OpenFailed);
        assert!(!container.is_monitoring_stats());
        assert!(matches!(rx.recv().await, Some(DockerError::StatsOpen { .. })));
    }

    #[tokio::test]
    async fn test_monitor_read_error_keeps_history() {
        let (runtime, monitor, mut rx) = setup(None);
        runtime.push_stats(
            "c1",
            StatsScript::Finite(vec![
                StreamItem::Line(stats_line(100, 1000, 1, 2)),
                StreamItem::ReadError,
                StreamItem::Line(stats_line(200, 2000, 1, 2)),
            ]),
        );

        let container = claimed("c1");
        assert_eq!(monitor.run(Arc::clone(&container)).await, MonitorExit::ReadFailed);
        assert_eq!(container.stats().len(), 1);
        assert!(!container.is_monitoring_stats());
        assert!(matches!(rx.recv().await, Some(DockerError::StatsRead { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_idle_timeout() {
        let (runtime, monitor, mut rx) = setup(Some(Duration::from_secs(5)));
        runtime.push_stats(
            "c1",
            StatsScript::Stalled(vec![StreamItem::Line(stats_line(1, 10, 1, 2))]),
        );

        let container = claimed("c1");
        assert_eq!(monitor.run(Arc::clone(&container)).await, MonitorExit::IdleTimeout);
        assert_eq!(container.stats().len(), 1);
        assert!(!container.is_monitoring_stats());
        assert!(matches!(rx.recv().await, Some(DockerError::StatsIdle { secs: 5, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_stalled_open_times_out() {
        let (runtime, monitor, mut rx) = setup(Some(Duration::from_secs(5)));
        runtime.push_stats("c1", StatsScript::StalledOpen);

        let container = claimed("c1");
        assert_eq!(monitor.run(Arc::clone(&container)).await, MonitorExit::OpenFailed);
        assert!(!container.is_monitoring_stats());
        assert!(matches!(rx.recv().await, Some(DockerError::StatsIdle { secs: 5, .. })));
    }

    #[tokio::test]
    async fn test_monitor_keeps_daemon_stream_after_malformed_line() {
        let body = format!(
            "{}\n{{garbage\n{}\n{}\n",
            stats_line(100, 1000, 1, 4),
            stats_line(200, 1000, 1, 4),
            stats_line(300, 1000, 1, 4)
        );
        let addr = serve_once("200 OK", body).await;
        let (monitor, _rx) = daemon_monitor(addr, Some(Duration::from_secs(5)));

        let container = claimed("c1");
        assert_eq!(monitor.run(Arc::clone(&container)).await, MonitorExit::StreamEnded);

        let cpu: Vec<f64> = container
            .stats()
            .snapshot()
            .iter()
            .map(|s| s.derived_stats.cpu_percentage)
            .collect();
        assert_eq!(cpu.len(), 3);
        assert!((cpu[2] - 30.0).abs() < 1e-9);
        assert!(!container.is_monitoring_stats());
    }

    #[tokio::test]
    async fn test_monitor_unanswered_daemon_open_times_out() {
        let addr = serve_silently().await;
        let (monitor, mut rx) = daemon_monitor(addr, Some(Duration::from_millis(300)));

        let container = claimed("c1");
        let exit = tokio::time::timeout(Duration::from_secs(5), monitor.run(Arc::clone(&container)))
            .await
            .unwrap();

        assert_eq!(exit, MonitorExit::OpenFailed);
        assert!(!container.is_monitoring_stats());
        assert!(matches!(rx.recv().await, Some(DockerError::StatsIdle { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_backs_off_after_stalled_open() {
        let (runtime, monitor, _rx) = setup(Some(Duration::from_secs(5)));
        runtime.set_containers(vec![summary("a", "/a", "running")]);
        runtime.push_stats("a", StatsScript::StalledOpen);

        let registry = Arc::new(ContainerRegistry::new(runtime.clone()));
        registry.refresh().await.unwrap();
        let mut scheduler = MonitorScheduler::new(registry, monitor, MonitorSettings::default());

        scheduler.tick().await;
        tokio::time::sleep(Duration::from_secs(6)).await;
        scheduler.tick().await;

        assert!(scheduler.retry_at("a").is_some());
        assert!(!scheduler.is_monitoring("a"));
        assert_eq!(runtime.stats_opens("a"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_spawns_once_per_container() {
        let (runtime, monitor, _rx) = setup(None);
        runtime.set_containers(vec![summary("a", "/a", "running"), summary("b", "/b", "exited")]);
        let registry = Arc::new(ContainerRegistry::new(runtime.clone()));
        let containers = registry.refresh().await.unwrap();

        let mut scheduler = MonitorScheduler::new(registry, monitor, MonitorSettings::default());
        scheduler.tick().await;
        scheduler.tick().await;
        settle().await;
        scheduler.tick().await;

        assert_eq!(scheduler.active_monitors(), 2);
        assert!(containers.iter().all(|c| c.is_monitoring_stats()));
        assert_eq!(runtime.stats_opens("a"), 1);
        assert_eq!(runtime.stats_opens("b"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_feeds_history_and_respawns_after_stream_end() {
        let (runtime, monitor, _rx) = setup(None);
        runtime.set_containers(vec![summary("a", "/a", "running")]);
        let (tx, rx) = futures::channel::mpsc::unbounded();
        runtime.push_stats("a", StatsScript::Channel(rx));

        let registry = Arc::new(ContainerRegistry::new(runtime.clone()));
        registry.refresh().await.unwrap();
        let mut scheduler = MonitorScheduler::new(registry.clone(), monitor, MonitorSettings::default());

        scheduler.tick().await;
        tx.unbounded_send(crate::core::stats::ContainerStats::from_json_line("a", stats_line(5, 10, 1, 4).as_bytes()))
            .unwrap();
        settle().await;

        // history survives a refresh while the monitor keeps appending
        let before = registry.get("a").await.unwrap();
        registry.refresh().await.unwrap();
        let after = registry.get("a").await.unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(after.stats().len(), 1);
        assert!(after.is_monitoring_stats());

        drop(tx);
        settle().await;
        assert!(!after.is_monitoring_stats());

        scheduler.tick().await;
        assert_eq!(runtime.stats_opens("a"), 2);
        assert!(scheduler.retry_at("a").is_none());
        assert_eq!(after.stats().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_backs_off_after_open_failures() {
        let (runtime, monitor, _rx) = setup(None);
        runtime.set_containers(vec![summary("a", "/a", "running")]);
        runtime.push_stats("a", StatsScript::FailOpen);
        runtime.push_stats("a", StatsScript::FailOpen);

        let registry = Arc::new(ContainerRegistry::new(runtime.clone()));
        registry.refresh().await.unwrap();
        let mut scheduler = MonitorScheduler::new(registry, monitor, MonitorSettings::default());

        scheduler.tick().await;
        settle().await;
        scheduler.tick().await;
        assert_eq!(runtime.stats_opens("a"), 1);
        assert!(scheduler.retry_at("a").is_some());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        scheduler.tick().await;
        assert_eq!(runtime.stats_opens("a"), 2);

        // second failure doubles the delay
        settle().await;
        scheduler.tick().await;
        tokio::time::sleep(Duration::from_millis(1000)).await;
        scheduler.tick().await;
        assert_eq!(runtime.stats_opens("a"), 2);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        scheduler.tick().await;
        assert_eq!(runtime.stats_opens("a"), 3);
        assert!(scheduler.is_monitoring("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_stops_monitor_of_removed_container() {
        let (runtime, monitor, _rx) = setup(None);
        runtime.set_containers(vec![summary("a", "/a", "running"), summary("b", "/b", "running")]);
        let registry = Arc::new(ContainerRegistry::new(runtime.clone()));
        let containers = registry.refresh().await.unwrap();
        let mut scheduler = MonitorScheduler::new(registry.clone(), monitor, MonitorSettings::default());

        scheduler.tick().await;
        settle().await;
        assert_eq!(scheduler.active_monitors(), 2);

        runtime.set_containers(vec![summary("b", "/b", "running")]);
        registry.refresh().await.unwrap();
        scheduler.tick().await;
        settle().await;

        assert_eq!(scheduler.active_monitors(), 1);
        assert!(!scheduler.is_monitoring("a"));
        assert!(!containers[0].is_monitoring_stats());
        assert!(containers[1].is_monitoring_stats());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_run_until_cancelled() {
        let (runtime, monitor, _rx) = setup(None);
        runtime.set_containers(vec![summary("a", "/a", "running")]);
        let registry = Arc::new(ContainerRegistry::new(runtime.clone()));
        let containers = registry.refresh().await.unwrap();

        let cancel = CancellationToken::new();
        let scheduler = MonitorScheduler::new(registry, monitor, MonitorSettings::default());
        let handle = tokio::spawn(scheduler.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(containers[0].is_monitoring_stats());
        assert_eq!(runtime.stats_opens("a"), 1);

        cancel.cancel();
        handle.await.unwrap();
        settle().await;
        assert!(!containers[0].is_monitoring_stats());
    }
}
