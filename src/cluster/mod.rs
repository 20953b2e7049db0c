//! Container-task driver backed by a Kubernetes-compatible cluster API.
//!
//! Each session is a single pod running an OpenSSH server image that installs
//! the `PUBLIC_KEY` environment variable for `USER_NAME`. The SSH port is
//! published as a host port, so the endpoint is the node's address plus that
//! port. `describe` reports the node name and `resolve_endpoint` looks the
//! node's address up.

mod pod;

use std::time::Duration;

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use rand::Rng;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::config::ClusterConfig;
use crate::driver::{
    Description, Driver, DriverError, DriverFuture, SessionSpec, http_client, resource_suffix,
};
use crate::session::{BackendHandle, Endpoint, ProviderKind};

use pod::{MANAGED_BY_LABEL, MANAGED_BY_VALUE, Node, Pod, PodList, PodTemplate};

const KIND: ProviderKind = ProviderKind::ContainerTask;
const LIST_PAGE_SIZE: &str = "100";
const HOST_PORT_RANGE: std::ops::RangeInclusive<u16> = 30000..=32767;

/// Driver that provisions sessions as pods.
#[derive(Clone)]
pub struct ClusterDriver {
    http: reqwest::Client,
    config: ClusterConfig,
    api_url: String,
    token: String,
    request_timeout: Duration,
}

impl ClusterDriver {
    /// Builds a driver from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Config`] naming the first missing setting, or
    /// when the CA bundle cannot be read or parsed.
    pub fn new(config: ClusterConfig, request_timeout: Duration) -> Result<Self, DriverError> {
        config.validate().map_err(|err| config_error(err.to_string()))?;
        let certificate = match config.ca_bundle.as_deref().map(str::trim) {
            Some(path) if !path.is_empty() => Some(load_certificate(path)?),
            _ => None,
        };
        let api_url = config
            .api_url
            .as_deref()
            .map(|url| url.trim().trim_end_matches('/').to_owned())
            .unwrap_or_default();
        let token = config
            .token
            .as_deref()
            .map(str::trim)
            .unwrap_or_default()
            .to_owned();
        Ok(Self {
            http: http_client(KIND, request_timeout, certificate)?,
            config,
            api_url,
            token,
            request_timeout,
        })
    }

    fn pod_ref(handle: &BackendHandle) -> Result<(&str, &str), DriverError> {
        match handle {
            BackendHandle::ContainerTask { namespace, pod } => Ok((namespace, pod)),
            other => Err(DriverError::ForeignHandle {
                provider: KIND,
                handle: other.clone(),
            }),
        }
    }

    fn pods_path(namespace: &str) -> String {
        format!("/api/v1/namespaces/{namespace}/pods")
    }

    fn pod_path(namespace: &str, pod: &str) -> String {
        format!("/api/v1/namespaces/{namespace}/pods/{pod}")
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{path}", self.api_url))
            .bearer_auth(&self.token)
    }

    /// Sends a request, treating `404 Not Found` as `None`.
    async fn send_optional<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<Option<T>, DriverError> {
        let response = request
            .send()
            .await
            .map_err(|err| transport_error(operation, self.request_timeout, &err))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DriverError::api(KIND, operation, format!("HTTP {status}: {body}")));
        }
        response
            .json()
            .await
            .map(Some)
            .map_err(|err| DriverError::api(KIND, operation, err))
    }

    async fn fetch_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, DriverError> {
        self.send_optional(
            "describe",
            self.request(Method::GET, &Self::pod_path(namespace, name)),
        )
        .await
    }
}

fn config_error(message: String) -> DriverError {
    DriverError::Config {
        provider: KIND,
        message,
    }
}

fn load_certificate(raw: &str) -> Result<reqwest::Certificate, DriverError> {
    let path = Utf8Path::new(raw);
    let unreadable = |message: String| config_error(format!("cannot read CA bundle {path}: {message}"));
    let name = path
        .file_name()
        .ok_or_else(|| unreadable(String::from("not a file path")))?;
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let pem = Dir::open_ambient_dir(parent, ambient_authority())
        .and_then(|dir| dir.read(name))
        .map_err(|err| unreadable(err.to_string()))?;
    reqwest::Certificate::from_pem(&pem)
        .map_err(|err| config_error(format!("invalid CA bundle {path}: {err}")))
}

fn transport_error(operation: &'static str, limit: Duration, err: &reqwest::Error) -> DriverError {
    if err.is_timeout() {
        return DriverError::Timeout {
            provider: KIND,
            operation,
            seconds: limit.as_secs(),
        };
    }
    DriverError::api(KIND, operation, err)
}

impl Driver for ClusterDriver {
    fn kind(&self) -> ProviderKind {
        KIND
    }

    fn requires_key(&self) -> bool {
        true
    }

    fn login_user(&self) -> Option<&str> {
        Some(self.config.login_user.as_str())
    }

    fn create<'a>(
        &'a self,
        spec: &'a SessionSpec,
        public_key: Option<&'a str>,
    ) -> DriverFuture<'a, BackendHandle> {
        Box::pin(async move {
            spec.validate()?;
            let key = public_key.ok_or(DriverError::MissingKey { provider: KIND })?;
            let namespace = self.config.namespace.as_str();
            let name = format!("hatch-{}-{}", spec.name, resource_suffix());
            let host_port = rand::thread_rng().gen_range(HOST_PORT_RANGE);
            let manifest = pod::pod_manifest(&PodTemplate {
                name: &name,
                session_name: &spec.name,
                image: spec.image.as_deref().unwrap_or(&self.config.image),
                cpu: spec.cpu.as_deref().unwrap_or(&self.config.cpu),
                memory: spec.memory.as_deref().unwrap_or(&self.config.memory),
                login_user: &self.config.login_user,
                public_key: key,
                container_port: self.config.ssh_port,
                host_port,
            });

            let response = self
                .request(Method::POST, &Self::pods_path(namespace))
                .json(&manifest)
                .send()
                .await
                .map_err(|err| DriverError::provision(KIND, err))?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(DriverError::provision(KIND, format!("HTTP {status}: {body}")));
            }

            info!(namespace, pod = %name, host_port, "created pod");
            Ok(BackendHandle::ContainerTask {
                namespace: namespace.to_owned(),
                pod: name,
            })
        })
    }

    fn describe<'a>(&'a self, handle: &'a BackendHandle) -> DriverFuture<'a, Description> {
        Box::pin(async move {
            let (namespace, name) = Self::pod_ref(handle)?;
            let found = self.fetch_pod(namespace, name).await?;
            Ok(pod::describe_pod(found.as_ref()))
        })
    }

    fn resolve_endpoint<'a>(
        &'a self,
        handle: &'a BackendHandle,
        network_id: &'a str,
    ) -> DriverFuture<'a, Option<Endpoint>> {
        Box::pin(async move {
            let (namespace, name) = Self::pod_ref(handle)?;
            let Some(port) = self
                .fetch_pod(namespace, name)
                .await?
                .and_then(|found| found.host_port())
            else {
                debug!(namespace, pod = name, "pod has no host port yet");
                return Ok(None);
            };
            let node: Option<Node> = self
                .send_optional(
                    "node lookup",
                    self.request(Method::GET, &format!("/api/v1/nodes/{network_id}")),
                )
                .await?;
            Ok(node.and_then(|found| pod::node_endpoint(&found, port)))
        })
    }

    fn terminate<'a>(&'a self, handle: &'a BackendHandle) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            let (namespace, name) = Self::pod_ref(handle)?;
            let deleted: Option<serde_json::Value> = self
                .send_optional(
                    "terminate",
                    self.request(Method::DELETE, &Self::pod_path(namespace, name))
                        .query(&[("gracePeriodSeconds", "0")]),
                )
                .await?;
            if deleted.is_none() {
                debug!(namespace, pod = name, "pod already gone");
            } else {
                info!(namespace, pod = name, "deleted pod");
            }
            Ok(())
        })
    }

    fn covers(&self, handle: &BackendHandle) -> bool {
        matches!(handle, BackendHandle::ContainerTask { namespace, .. } if *namespace == self.config.namespace)
    }

    fn list_active(&self) -> DriverFuture<'_, Vec<BackendHandle>> {
        Box::pin(async move {
            let namespace = self.config.namespace.as_str();
            let selector = format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}");
            let mut pods = Vec::new();
            let mut continue_token: Option<String> = None;
            loop {
                let mut request = self
                    .request(Method::GET, &Self::pods_path(namespace))
                    .query(&[("labelSelector", selector.as_str()), ("limit", LIST_PAGE_SIZE)]);
                if let Some(token) = continue_token.as_deref() {
                    request = request.query(&[("continue", token)]);
                }
                let Some(page) = self.send_optional::<PodList>("list", request).await? else {
                    break;
                };
                pods.extend(page.items);
                continue_token = page
                    .metadata
                    .continue_token
                    .filter(|token| !token.is_empty());
                if continue_token.is_none() {
                    break;
                }
            }
            Ok(pods
                .into_iter()
                .filter(|found| found.metadata.deletion_timestamp.is_none())
                .map(|found| BackendHandle::ContainerTask {
                    namespace: found
                        .metadata
                        .namespace
                        .unwrap_or_else(|| namespace.to_owned()),
                    pod: found.metadata.name,
                })
                .collect())
        })
    }
}
