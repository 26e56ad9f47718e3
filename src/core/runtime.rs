/// Container runtime API access
///
/// The monitoring core only needs three calls from the daemon: list all
/// containers, inspect one, and open a live stats stream. `DockerRuntime`
/// lists and inspects through bollard. Stats subscriptions are read straight
/// off the HTTP body and split into lines, so an undecodable line costs one
/// sample instead of the whole subscription.

use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::models::{ContainerInspectResponse, ContainerSummary};
use bollard::Docker;
use bytes::Bytes;
use futures::future;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use http_body_util::{BodyExt, BodyStream, Empty};
use hyper::body::Incoming;
use hyper::{header, Method, Request, Response};
use hyper_util::rt::TokioIo;
use std::fmt::Display;
use std::io;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::core::error::{DockerError, DockerResult};
use crate::core::stats::ContainerStats;
use crate::utils::{DEFAULT_DOCKER_SOCKET, MAX_STATS_LINE_BYTES};

/// Live stats samples for one container. Ends when the daemon closes the stream.
pub type StatsStream = BoxStream<'static, DockerResult<ContainerStats>>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// List every container, stopped ones included
    async fn list_containers(&self) -> DockerResult<Vec<ContainerSummary>>;

    async fn inspect_container(&self, id: &str) -> DockerResult<ContainerInspectResponse>;

    /// Open a streaming stats subscription
    async fn stream_stats(&self, id: &str) -> DockerResult<StatsStream>;
}

/// Daemon address used for stats subscriptions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatsEndpoint {
    Unix(PathBuf),
    /// `host:port`
    Tcp(String),
}

impl StatsEndpoint {
    /// Endpoint for a `DOCKER_HOST` value, the local socket when unset
    pub fn from_docker_host(host: Option<&str>) -> Self {
        let host = host.map(str::trim).filter(|h| !h.is_empty());
        let Some(host) = host else {
            return Self::Unix(PathBuf::from(DEFAULT_DOCKER_SOCKET));
        };

        if let Some(path) = host.strip_prefix("unix://") {
            return Self::Unix(PathBuf::from(path));
        }
        let addr = host
            .strip_prefix("tcp://")
            .or_else(|| host.strip_prefix("http://"))
            .unwrap_or(host);
        Self::Tcp(addr.trim_end_matches('/').to_string())
    }

    async fn send(&self, request: Request<Empty<Bytes>>) -> Result<Response<Incoming>, BoxError> {
        match self {
            Self::Tcp(addr) => send_request(TcpStream::connect(addr).await?, request).await,
            #[cfg(unix)]
            Self::Unix(path) => {
                send_request(tokio::net::UnixStream::connect(path).await?, request).await
            }
            #[cfg(not(unix))]
            Self::Unix(path) => Err(format!("unix socket {} is not available on this platform", path.display()).into()),
        }
    }
}

async fn send_request<I>(io: I, request: Request<Empty<Bytes>>) -> Result<Response<Incoming>, BoxError>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(io)).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(error = %e, "stats connection closed");
        }
    });
    Ok(sender.send_request(request).await?)
}

/// Split a stats body into lines and decode each one on its own
fn sample_stream(id: String, body: Incoming) -> StatsStream {
    let bytes = BodyStream::new(body)
        .try_filter_map(|frame| future::ready(Ok(frame.into_data().ok())))
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
        .boxed();

    FramedRead::new(
        StreamReader::new(bytes),
        LinesCodec::new_with_max_length(MAX_STATS_LINE_BYTES),
    )
    .filter_map(move |line| {
        future::ready(match line {
            Ok(line) if line.trim().is_empty() => None,
            Ok(line) => Some(ContainerStats::from_json_line(&id, line.as_bytes())),
            Err(e) => Some(Err(DockerError::StatsRead {
                id: id.clone(),
                reason: e.to_string(),
            })),
        })
    })
    .boxed()
}

fn stats_open(id: &str, reason: impl Display) -> DockerError {
    DockerError::StatsOpen {
        id: id.to_string(),
        reason: reason.to_string(),
    }
}

#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
    endpoint: StatsEndpoint,
}

impl DockerRuntime {
    /// Connect using DOCKER_HOST or the platform default socket
    pub fn connect() -> DockerResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| DockerError::Connect(e.to_string()))?;
        let endpoint = StatsEndpoint::from_docker_host(std::env::var("DOCKER_HOST").ok().as_deref());
        Ok(Self::with_endpoint(docker, endpoint))
    }

    pub fn with_endpoint(docker: Docker, endpoint: StatsEndpoint) -> Self {
        Self { docker, endpoint }
    }

    /// Check if Docker daemon is accessible
    pub async fn ping(&self) -> DockerResult<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| DockerError::Connect(e.to_string()))
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self) -> DockerResult<Vec<ContainerSummary>> {
        let options = Some(ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        });

        self.docker
            .list_containers(options)
            .await
            .map_err(|e| DockerError::List(e.to_string()))
    }

    async fn inspect_container(&self, id: &str) -> DockerResult<ContainerInspectResponse> {
        self.docker
            .inspect_container(id, None)
            .await
            .map_err(|e| DockerError::Inspect {
                id: id.to_string(),
                reason: e.to_string(),
            })
    }

    async fn stream_stats(&self, id: &str) -> DockerResult<StatsStream> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(format!("/containers/{id}/stats?stream=true"))
            .header(header::HOST, "docker")
            .body(Empty::<Bytes>::new())
            .map_err(|e| stats_open(id, e))?;

        let response = self.endpoint.send(request).await.map_err(|e| stats_open(id, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .into_body()
                .collect()
                .await
                .map(|body| body.to_bytes())
                .unwrap_or_default();
            return Err(stats_open(
                id,
                format!("{}: {}", status, String::from_utf8_lossy(&body).trim()),
            ));
        }

        Ok(sample_stream(id.to_string(), response.into_body()))
    }
}
