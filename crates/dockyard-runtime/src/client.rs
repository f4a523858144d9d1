//! HTTP/1.1 client for the container-runtime REST API.
//!
//! Each request opens a fresh connection (TCP or Unix socket), performs
//! the hyper handshake, and drives the connection on a background task.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode, header};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use dockyard_core::ImageName;

use crate::error::{RuntimeError, RuntimeResult};
use crate::runtime::{ContainerRuntime, LogOptions};
use crate::stream::{EventStream, LogStream};
use crate::wire::{
    ContainerInspect, ContainerSummary, CreateContainer, CreateResponse, ErrorMessage,
    ImageSummary, PullProgress, RuntimeEvent, Version,
};

const USER_AGENT: &str = concat!("dockyard/", env!("CARGO_PKG_VERSION"));

/// Where a runtime listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    Unix(PathBuf),
}

impl Endpoint {
    /// Parse `unix:///path`, `tcp://host:port` or `http://host:port`.
    pub fn parse(addr: &str) -> RuntimeResult<Self> {
        if let Some(path) = addr.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(RuntimeError::InvalidAddress(addr.to_string()));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        let authority = addr
            .strip_prefix("tcp://")
            .or_else(|| addr.strip_prefix("http://"))
            .ok_or_else(|| RuntimeError::InvalidAddress(addr.to_string()))?
            .trim_end_matches('/');
        if authority.is_empty() || !authority.contains(':') {
            return Err(RuntimeError::InvalidAddress(addr.to_string()));
        }
        Ok(Endpoint::Tcp(authority.to_string()))
    }

    fn host_header(&self) -> &str {
        match self {
            Endpoint::Tcp(authority) => authority,
            Endpoint::Unix(_) => "localhost",
        }
    }
}

/// Which kind of resource a 404 refers to.
#[derive(Clone, Copy)]
enum NotFound {
    Container,
    Image,
}

/// A runtime reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpRuntime {
    endpoint: Endpoint,
}

impl HttpRuntime {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    pub fn from_addr(addr: &str) -> RuntimeResult<Self> {
        Ok(Self::new(Endpoint::parse(addr)?))
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn connect(&self) -> RuntimeResult<SendRequest<Full<Bytes>>> {
        match &self.endpoint {
            Endpoint::Tcp(addr) => handshake(tokio::net::TcpStream::connect(addr).await?).await,
            Endpoint::Unix(path) => handshake(tokio::net::UnixStream::connect(path).await?).await,
        }
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> RuntimeResult<Response<Incoming>> {
        let mut builder = Request::builder()
            .method(method.clone())
            .uri(path)
            .header(header::HOST, self.endpoint.host_header())
            .header(header::USER_AGENT, USER_AGENT);
        if body.is_some() {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
        }
        let req = builder.body(Full::new(Bytes::from(body.unwrap_or_default())))?;

        let mut sender = self.connect().await?;
        let resp = sender.send_request(req).await?;
        debug!(%method, path, status = %resp.status(), "runtime request");
        Ok(resp)
    }

    /// Send and map non-2xx responses to errors. 304 counts as success.
    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
        not_found: NotFound,
        subject: &str,
    ) -> RuntimeResult<Response<Incoming>> {
        let resp = self.send(method, path, body).await?;
        let status = resp.status();
        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            return Ok(resp);
        }

        let raw = resp.into_body().collect().await?.to_bytes();
        let message = serde_json::from_slice::<ErrorMessage>(&raw)
            .map(|e| e.message)
            .unwrap_or_else(|_| String::from_utf8_lossy(&raw).trim().to_string());

        Err(match status {
            StatusCode::NOT_FOUND => match not_found {
                NotFound::Container => RuntimeError::NoSuchContainer(subject.to_string()),
                NotFound::Image => RuntimeError::NoSuchImage(subject.to_string()),
            },
            StatusCode::CONFLICT => RuntimeError::Conflict(message),
            _ => RuntimeError::Status {
                status: status.as_u16(),
                message,
            },
        })
    }

    async fn json<T: DeserializeOwned>(resp: Response<Incoming>) -> RuntimeResult<T> {
        let raw = resp.into_body().collect().await?.to_bytes();
        Ok(serde_json::from_slice(&raw)?)
    }
}

async fn handshake<S>(stream: S) -> RuntimeResult<SendRequest<Full<Bytes>>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let (sender, conn) = hyper::client::conn::http1::handshake(io).await?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "runtime connection closed");
        }
    });

    Ok(sender)
}

/// Split a newline-delimited JSON body into values as lines complete.
struct JsonLines {
    buf: Vec<u8>,
}

impl JsonLines {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn push<T: DeserializeOwned>(&mut self, chunk: &[u8]) -> Vec<RuntimeResult<T>> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = line.trim_ascii();
            if !line.is_empty() {
                out.push(serde_json::from_slice(line).map_err(RuntimeError::from));
            }
        }
        out
    }
}

#[async_trait]
impl ContainerRuntime for HttpRuntime {
    async fn version(&self) -> RuntimeResult<Version> {
        let resp = self
            .call(Method::GET, "/version", None, NotFound::Container, "")
            .await?;
        Self::json(resp).await
    }

    async fn list_containers(&self, all: bool) -> RuntimeResult<Vec<ContainerSummary>> {
        let path = format!("/containers/json?all={}", all as u8);
        let resp = self
            .call(Method::GET, &path, None, NotFound::Container, "")
            .await?;
        Self::json(resp).await
    }

    async fn list_images(&self) -> RuntimeResult<Vec<ImageSummary>> {
        let resp = self
            .call(Method::GET, "/images/json", None, NotFound::Image, "")
            .await?;
        Self::json(resp).await
    }

    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerInspect> {
        let path = format!("/containers/{id}/json");
        let resp = self
            .call(Method::GET, &path, None, NotFound::Container, id)
            .await?;
        Self::json(resp).await
    }

    async fn create_container(
        &self,
        name: Option<&str>,
        config: &CreateContainer,
    ) -> RuntimeResult<String> {
        let path = match name {
            Some(n) => format!("/containers/create?name={n}"),
            None => "/containers/create".to_string(),
        };
        let body = serde_json::to_vec(config)?;
        let resp = self
            .call(Method::POST, &path, Some(body), NotFound::Image, &config.image)
            .await?;
        let created: CreateResponse = Self::json(resp).await?;
        for w in created.warnings.iter().flatten() {
            warn!(container = %created.id, warning = %w, "runtime warning on create");
        }
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> RuntimeResult<()> {
        let path = format!("/containers/{id}/start");
        self.call(Method::POST, &path, None, NotFound::Container, id)
            .await?;
        Ok(())
    }

    async fn stop_container(&self, id: &str, timeout_secs: u32) -> RuntimeResult<()> {
        let path = format!("/containers/{id}/stop?t={timeout_secs}");
        self.call(Method::POST, &path, None, NotFound::Container, id)
            .await?;
        Ok(())
    }

    async fn kill_container(&self, id: &str, signal: Option<&str>) -> RuntimeResult<()> {
        let path = match signal {
            Some(s) => format!("/containers/{id}/kill?signal={s}"),
            None => format!("/containers/{id}/kill"),
        };
        self.call(Method::POST, &path, None, NotFound::Container, id)
            .await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool, volumes: bool) -> RuntimeResult<()> {
        let path = format!("/containers/{id}?force={}&v={}", force as u8, volumes as u8);
        self.call(Method::DELETE, &path, None, NotFound::Container, id)
            .await?;
        Ok(())
    }

    async fn container_logs(&self, id: &str, opts: &LogOptions) -> RuntimeResult<LogStream> {
        let path = format!("/containers/{id}/logs?{}", opts.to_query());
        let resp = self
            .call(Method::GET, &path, None, NotFound::Container, id)
            .await?;
        Ok(LogStream::Body(resp.into_body()))
    }

    async fn pull_image(&self, reference: &str) -> RuntimeResult<()> {
        let image = ImageName::parse(reference);
        let path = format!("/images/create?fromImage={}&tag={}", image.name, image.tag);
        let resp = self
            .call(Method::POST, &path, None, NotFound::Image, reference)
            .await?;

        // The pull only completes once the progress stream ends; errors
        // arrive in-band.
        let mut body = LogStream::Body(resp.into_body());
        let mut lines = JsonLines::new();
        while let Some(chunk) = body.next_chunk().await {
            for progress in lines.push::<PullProgress>(&chunk?) {
                if let Some(error) = progress?.error {
                    return Err(RuntimeError::Status {
                        status: 500,
                        message: error,
                    });
                }
            }
        }
        debug!(image = %image, "image pulled");
        Ok(())
    }

    async fn events(&self) -> RuntimeResult<EventStream> {
        let resp = self
            .call(Method::GET, "/events", None, NotFound::Container, "")
            .await?;
        let (tx, rx) = mpsc::channel(64);
        let mut body = LogStream::Body(resp.into_body());

        tokio::spawn(async move {
            let mut lines = JsonLines::new();
            while let Some(chunk) = body.next_chunk().await {
                let events = match chunk {
                    Ok(c) => lines.push::<RuntimeEvent>(&c),
                    Err(e) => vec![Err(e)],
                };
                for ev in events {
                    if tx.send(ev).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(EventStream::new(rx))
    }
}
