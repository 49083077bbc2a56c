//! Docker Engine API client over the local Unix socket.
//!
//! One connection per request: connect, http1 handshake, spawn the
//! connection driver, send. Streaming endpoints (build, push, pull) forward
//! body frames into a channel as they arrive.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use http::{header, Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use keel_core::registry::RegistryAuth;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::orchestrator::*;

const API_VERSION: &str = "v1.43";
const STREAM_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct DockerClient {
    socket: PathBuf,
}

impl DockerClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    fn uri(path: &str, query: &[(&str, &str)]) -> String {
        if query.is_empty() {
            return format!("/{API_VERSION}{path}");
        }
        let qs = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(query)
            .finish();
        format!("/{API_VERSION}{path}?{qs}")
    }

    async fn send(
        &self,
        method: Method,
        uri: String,
        headers: &[(&str, String)],
        body: Bytes,
    ) -> OrchestratorResult<hyper::Response<Incoming>> {
        let stream = UnixStream::connect(&self.socket).await.map_err(|e| {
            OrchestratorError::Connect(format!("{}: {e}", self.socket.display()))
        })?;
        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| OrchestratorError::Connect(format!("handshake failed: {e}")))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                warn!(error = %e, "docker connection error");
            }
        });

        let mut builder = Request::builder()
            .method(method.clone())
            .uri(&uri)
            .header(header::HOST, "docker");
        for (key, value) in headers {
            builder = builder.header(*key, value);
        }
        let request = builder
            .body(Full::new(body))
            .map_err(|e| OrchestratorError::Request(e.to_string()))?;

        debug!(%method, %uri, "docker request");
        sender
            .send_request(request)
            .await
            .map_err(|e| OrchestratorError::Request(e.to_string()))
    }

    /// Send and collect the whole body, mapping non-success statuses.
    async fn call(
        &self,
        method: Method,
        uri: String,
        headers: &[(&str, String)],
        body: Bytes,
    ) -> OrchestratorResult<Bytes> {
        let response = self.send(method, uri, headers, body).await?;
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| OrchestratorError::Request(e.to_string()))?
            .to_bytes();
        if status.is_success() {
            return Ok(bytes);
        }
        Err(api_error(status, &bytes))
    }

    async fn call_json<T: for<'de> Deserialize<'de>>(
        &self,
        method: Method,
        uri: String,
    ) -> OrchestratorResult<T> {
        let bytes = self.call(method, uri, &[], Bytes::new()).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| OrchestratorError::InvalidResponse(e.to_string()))
    }

    async fn post_json(
        &self,
        uri: String,
        headers: &[(&str, String)],
        body: &Value,
    ) -> OrchestratorResult<Bytes> {
        let mut all = vec![("content-type", "application/json".to_string())];
        all.extend(headers.iter().cloned());
        self.call(Method::POST, uri, &all, Bytes::from(body.to_string()))
            .await
    }

    /// Send a request whose body is a progress stream.
    async fn stream(
        &self,
        method: Method,
        uri: String,
        headers: &[(&str, String)],
        body: Bytes,
    ) -> OrchestratorResult<ProgressStream> {
        let response = self.send(method, uri, headers, body).await?;
        let status = response.status();
        if !status.is_success() {
            let bytes = response
                .into_body()
                .collect()
                .await
                .map_err(|e| OrchestratorError::Request(e.to_string()))?
                .to_bytes();
            return Err(api_error(status, &bytes));
        }

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let mut body = response.into_body();
        tokio::spawn(async move {
            while let Some(frame) = body.frame().await {
                let item = match frame {
                    Ok(frame) => match frame.into_data() {
                        Ok(data) => Ok(String::from_utf8_lossy(&data).into_owned()),
                        Err(_) => continue,
                    },
                    Err(e) => Err(OrchestratorError::Request(e.to_string())),
                };
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

fn encode_auth(auth: &RegistryAuth) -> OrchestratorResult<String> {
    let raw = serde_json::to_vec(auth).map_err(|e| OrchestratorError::Other(e.to_string()))?;
    Ok(BASE64.encode(raw))
}

fn api_error(status: StatusCode, body: &[u8]) -> OrchestratorError {
    let message = serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned());
    match status {
        StatusCode::NOT_FOUND => OrchestratorError::NotFound(message),
        StatusCode::CONFLICT => OrchestratorError::Conflict(message),
        _ if message.contains("update out of sequence") => OrchestratorError::Conflict(message),
        _ => OrchestratorError::Api {
            status: status.as_u16(),
            message,
        },
    }
}

// ── Engine API response shapes ─────────────────────────────────────

#[derive(Deserialize)]
struct ServiceResponse {
    #[serde(rename = "Version")]
    version: VersionIndex,
    #[serde(rename = "Spec")]
    spec: Value,
}

#[derive(Deserialize)]
struct VersionIndex {
    #[serde(rename = "Index")]
    index: u64,
}

#[derive(Deserialize)]
struct TaskResponse {
    #[serde(rename = "NodeID", default)]
    node_id: String,
    #[serde(rename = "Status", default)]
    status: Value,
}

#[derive(Deserialize)]
struct NodeResponse {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Description", default)]
    description: Value,
    #[serde(rename = "Spec", default)]
    spec: Value,
    #[serde(rename = "Status", default)]
    status: Value,
}

#[derive(Deserialize)]
struct ImageResponse {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "RepoTags", default)]
    repo_tags: Option<Vec<String>>,
    #[serde(rename = "Created", default)]
    created: i64,
}

fn str_at(value: &Value, path: &[&str]) -> String {
    path.iter()
        .fold(value, |v, key| &v[*key])
        .as_str()
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl Orchestrator for DockerClient {
    async fn is_service_running(&self, name: &str) -> OrchestratorResult<bool> {
        match self.inspect_service(name).await {
            Ok(_) => Ok(true),
            Err(OrchestratorError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn inspect_service(&self, name: &str) -> OrchestratorResult<ServiceInspect> {
        let resp: ServiceResponse = self
            .call_json(Method::GET, Self::uri(&format!("/services/{name}"), &[]))
            .await?;
        Ok(ServiceInspect {
            version: resp.version.index,
            spec: resp.spec,
        })
    }

    async fn create_service(&self, create: &ServiceCreate) -> OrchestratorResult<()> {
        self.post_json(Self::uri("/services/create", &[]), &[], &create.to_spec())
            .await?;
        Ok(())
    }

    async fn update_service(
        &self,
        name: &str,
        version: u64,
        spec: &Value,
        auth: &RegistryAuth,
    ) -> OrchestratorResult<()> {
        let version = version.to_string();
        let uri = Self::uri(&format!("/services/{name}/update"), &[("version", &version)]);
        let headers = [("X-Registry-Auth", encode_auth(auth)?)];
        self.post_json(uri, &headers, spec).await?;
        Ok(())
    }

    async fn remove_service(&self, name: &str) -> OrchestratorResult<()> {
        self.call(Method::DELETE, Self::uri(&format!("/services/{name}"), &[]), &[], Bytes::new())
            .await?;
        Ok(())
    }

    async fn list_running_tasks(&self, service: &str) -> OrchestratorResult<Vec<TaskInfo>> {
        let filters = json!({ "service": [service], "desired-state": ["running"] }).to_string();
        let tasks: Vec<TaskResponse> = self
            .call_json(Method::GET, Self::uri("/tasks", &[("filters", &filters)]))
            .await?;
        Ok(tasks
            .into_iter()
            .map(|t| {
                let container = str_at(&t.status, &["ContainerStatus", "ContainerID"]);
                TaskInfo {
                    node_id: t.node_id,
                    container_id: (!container.is_empty()).then_some(container),
                }
            })
            .collect())
    }

    async fn prune_containers(&self) -> OrchestratorResult<()> {
        self.call(Method::POST, Self::uri("/containers/prune", &[]), &[], Bytes::new())
            .await?;
        Ok(())
    }

    async fn kill_container(&self, container_id: &str, signal: &str) -> OrchestratorResult<()> {
        let uri = Self::uri(&format!("/containers/{container_id}/kill"), &[("signal", signal)]);
        self.call(Method::POST, uri, &[], Bytes::new()).await?;
        Ok(())
    }

    async fn build_image(
        &self,
        context_tar: &Path,
        options: &BuildOptions,
    ) -> OrchestratorResult<ProgressStream> {
        let context = tokio::fs::read(context_tar).await.map_err(|e| {
            OrchestratorError::Request(format!("reading {}: {e}", context_tar.display()))
        })?;
        let build_args = serde_json::to_string(&options.build_args)
            .map_err(|e| OrchestratorError::Other(e.to_string()))?;
        let registry_config = serde_json::to_vec(&options.registry_config)
            .map_err(|e| OrchestratorError::Other(e.to_string()))?;
        let uri = Self::uri(
            "/build",
            &[("t", options.tag.as_str()), ("buildargs", build_args.as_str())],
        );
        let headers = [
            ("content-type", "application/x-tar".to_string()),
            ("X-Registry-Config", BASE64.encode(registry_config)),
        ];
        self.stream(Method::POST, uri, &headers, Bytes::from(context))
            .await
    }

    async fn tag_image(&self, source: &str, repo: &str, tag: &str) -> OrchestratorResult<()> {
        let uri = Self::uri(&format!("/images/{source}/tag"), &[("repo", repo), ("tag", tag)]);
        self.call(Method::POST, uri, &[], Bytes::new()).await?;
        Ok(())
    }

    async fn push_image(
        &self,
        image: &str,
        auth: &RegistryAuth,
    ) -> OrchestratorResult<ProgressStream> {
        let (repo, tag) = split_repo_tag(image);
        let uri = Self::uri(&format!("/images/{repo}/push"), &[("tag", tag)]);
        let headers = [("X-Registry-Auth", encode_auth(auth)?)];
        self.stream(Method::POST, uri, &headers, Bytes::new()).await
    }

    async fn pull_image(
        &self,
        image: &str,
        auth: Option<&RegistryAuth>,
    ) -> OrchestratorResult<ProgressStream> {
        let (repo, tag) = split_repo_tag(image);
        let uri = Self::uri("/images/create", &[("fromImage", repo), ("tag", tag)]);
        let mut headers = Vec::new();
        if let Some(auth) = auth {
            headers.push(("X-Registry-Auth", encode_auth(auth)?));
        }
        self.stream(Method::POST, uri, &headers, Bytes::new()).await
    }

    async fn list_images(&self) -> OrchestratorResult<Vec<ImageInfo>> {
        let images: Vec<ImageResponse> = self
            .call_json(Method::GET, Self::uri("/images/json", &[]))
            .await?;
        Ok(images
            .into_iter()
            .map(|img| ImageInfo {
                id: img.id,
                repo_tags: img.repo_tags.unwrap_or_default(),
                created: img.created,
            })
            .collect())
    }

    async fn remove_image(&self, id: &str) -> OrchestratorResult<()> {
        self.call(Method::DELETE, Self::uri(&format!("/images/{id}"), &[]), &[], Bytes::new())
            .await?;
        Ok(())
    }

    async fn list_nodes(&self) -> OrchestratorResult<Vec<NodeInfo>> {
        let nodes: Vec<NodeResponse> = self
            .call_json(Method::GET, Self::uri("/nodes", &[]))
            .await?;
        Ok(nodes
            .into_iter()
            .map(|n| NodeInfo {
                hostname: str_at(&n.description, &["Hostname"]),
                role: str_at(&n.spec, &["Role"]),
                state: str_at(&n.status, &["State"]),
                id: n.id,
            })
            .collect())
    }

    async fn remove_volume(&self, name: &str) -> OrchestratorResult<()> {
        self.call(Method::DELETE, Self::uri(&format!("/volumes/{name}"), &[]), &[], Bytes::new())
            .await?;
        Ok(())
    }

    async fn check_registry_auth(&self, auth: &RegistryAuth) -> OrchestratorResult<()> {
        let body = serde_json::to_value(auth).map_err(|e| OrchestratorError::Other(e.to_string()))?;
        self.post_json(Self::uri("/auth", &[]), &[], &body).await?;
        Ok(())
    }
}
