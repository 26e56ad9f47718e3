//! Scripted in-memory runtime for unit tests

use async_trait::async_trait;
use bollard::models::{ContainerInspectResponse, ContainerSummary};
use futures::channel::mpsc::UnboundedReceiver;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::net::SocketAddr;
use std::sync::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::core::error::{DockerError, DockerResult};
use crate::core::runtime::{ContainerRuntime, StatsStream};
use crate::core::stats::ContainerStats;
use crate::utils::{LABEL_COMPOSE_ONEOFF, LABEL_COMPOSE_SERVICE};

pub(crate) fn summary(id: &str, name: &str, state: &str) -> ContainerSummary {
    ContainerSummary {
        id: Some(id.to_string()),
        names: Some(vec![name.to_string()]),
        state: Some(state.to_string()),
        labels: Some(HashMap::new()),
        ..Default::default()
    }
}

pub(crate) fn compose_summary(id: &str, name: &str, state: &str, service: &str, one_off: bool) -> ContainerSummary {
    let mut s = summary(id, name, state);
    let labels = s.labels.get_or_insert_with(HashMap::new);
    if !service.is_empty() {
        labels.insert(LABEL_COMPOSE_SERVICE.to_string(), service.to_string());
    }
    labels.insert(
        LABEL_COMPOSE_ONEOFF.to_string(),
        if one_off { "True" } else { "False" }.to_string(),
    );
    s
}

/// One line of a stats stream as the daemon would send it
pub(crate) fn stats_line(cpu_total: u64, system_total: u64, mem_usage: u64, mem_limit: u64) -> String {
    format!(
        r#"{{"read":"2024-01-01T00:00:00Z","cpu_stats":{{"cpu_usage":{{"total_usage":{cpu_total}}},"system_cpu_usage":{system_total},"online_cpus":1}},"precpu_stats":{{"cpu_usage":{{"total_usage":0}},"system_cpu_usage":0}},"memory_stats":{{"usage":{mem_usage},"limit":{mem_limit}}}}}"#
    )
}

async fn read_request_head(socket: &mut TcpStream) {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
}

/// Local HTTP server answering a single request with `status` and a
/// connection-delimited `body`
pub(crate) async fn serve_once(status: &str, body: String) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let head = format!("HTTP/1.1 {status}\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n");
    tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        read_request_head(&mut socket).await;
        let _ = socket.write_all(head.as_bytes()).await;
        let _ = socket.write_all(body.as_bytes()).await;
        let _ = socket.shutdown().await;
    });
    addr
}

/// Local HTTP server that reads a request and never answers it
pub(crate) async fn serve_silently() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        read_request_head(&mut socket).await;
        std::future::pending::<()>().await;
        drop(socket);
    });
    addr
}

pub(crate) enum StreamItem {
    Line(String),
    ReadError,
}

pub(crate) enum StatsScript {
    FailOpen,
    /// The open call never completes
    StalledOpen,
    /// Items followed by end of stream
    Finite(Vec<StreamItem>),
    /// Items followed by a stream that never yields again
    Stalled(Vec<StreamItem>),
    Channel(UnboundedReceiver<DockerResult<ContainerStats>>),
}

#[derive(Default)]
pub(crate) struct FakeRuntime {
    containers: Mutex<Vec<ContainerSummary>>,
    fail_list: AtomicBool,
    inspect_failures: Mutex<HashSet<String>>,
    inspect_names: Mutex<HashMap<String, String>>,
    stats_scripts: Mutex<HashMap<String, VecDeque<StatsScript>>>,
    stats_opens: Mutex<Vec<String>>,
}

impl FakeRuntime {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_containers(&self, containers: Vec<ContainerSummary>) {
        *self.containers.lock().unwrap() = containers;
    }

    pub(crate) fn fail_list(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_inspect(&self, id: &str) {
        self.inspect_failures.lock().unwrap().insert(id.to_string());
    }

    pub(crate) fn set_inspect_name(&self, id: &str, name: &str) {
        self.inspect_names.lock().unwrap().insert(id.to_string(), name.to_string());
    }

    /// Queue the behaviour of the next `stream_stats` call for `id`.
    /// Without a queued script the stream opens and never yields.
    pub(crate) fn push_stats(&self, id: &str, script: StatsScript) {
        self.stats_scripts
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default()
            .push_back(script);
    }

    pub(crate) fn stats_opens(&self, id: &str) -> usize {
        self.stats_opens.lock().unwrap().iter().filter(|opened| *opened == id).count()
    }

    fn items_stream(id: &str, items: Vec<StreamItem>) -> StatsStream {
        let id = id.to_string();
        let items: Vec<DockerResult<ContainerStats>> = items
            .into_iter()
            .map(|item| match item {
                StreamItem::Line(line) => ContainerStats::from_json_line(&id, line.as_bytes()),
                StreamItem::ReadError => Err(DockerError::StatsRead {
                    id: id.clone(),
                    reason: "connection reset".to_string(),
                }),
            })
            .collect();
        stream::iter(items).boxed()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_containers(&self) -> DockerResult<Vec<ContainerSummary>> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(DockerError::List("daemon unavailable".to_string()));
        }
        Ok(self.containers.lock().unwrap().clone())
    }

    async fn inspect_container(&self, id: &str) -> DockerResult<ContainerInspectResponse> {
        if self.inspect_failures.lock().unwrap().contains(id) {
            return Err(DockerError::Inspect {
                id: id.to_string(),
                reason: "no such container".to_string(),
            });
        }
        Ok(ContainerInspectResponse {
            id: Some(id.to_string()),
            name: self.inspect_names.lock().unwrap().get(id).cloned(),
            ..Default::default()
        })
    }

    async fn stream_stats(&self, id: &str) -> DockerResult<StatsStream> {
        self.stats_opens.lock().unwrap().push(id.to_string());
        let script = self
            .stats_scripts
            .lock()
            .unwrap()
            .get_mut(id)
            .and_then(VecDeque::pop_front);

        match script {
            None => Ok(stream::pending().boxed()),
            Some(StatsScript::StalledOpen) => std::future::pending().await,
            Some(StatsScript::FailOpen) => Err(DockerError::StatsOpen {
                id: id.to_string(),
                reason: "connection refused".to_string(),
            }),
            Some(StatsScript::Finite(items)) => Ok(Self::items_stream(id, items)),
            Some(StatsScript::Stalled(items)) => {
                Ok(Self::items_stream(id, items).chain(stream::pending()).boxed())
            }
            Some(StatsScript::Channel(rx)) => Ok(rx.boxed()),
        }
    }
}
