//! Hosted-container driver backed by GitHub Codespaces.
//!
//! GitHub manages access to codespaces itself, so this driver needs no
//! injected key. The bridge reaches a ready codespace through
//! `gh codespace ssh`, and the endpoint host is the codespace's unique name.

use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::CodespacesConfig;
use crate::driver::{
    Description, Driver, DriverError, DriverFuture, NetworkRef, RemoteState, SessionSpec, http_client,
};
use crate::session::{BackendHandle, Endpoint, ProviderKind};

const KIND: ProviderKind = ProviderKind::HostedContainer;
const API_VERSION: &str = "2022-11-28";
const DISPLAY_NAME_PREFIX: &str = "hatch-";
const SSH_PORT: u16 = 22;
const LIST_PAGE_SIZE: usize = 100;

#[derive(Serialize)]
struct CreateCodespaceRequest<'a> {
    machine: &'a str,
    display_name: String,
    idle_timeout_minutes: u32,
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    git_ref: Option<&'a str>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
struct Codespace {
    name: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    state: String,
}

#[derive(Deserialize)]
struct CodespaceList {
    #[serde(default)]
    codespaces: Vec<Codespace>,
}

/// Driver that provisions sessions as GitHub codespaces.
#[derive(Clone)]
pub struct CodespacesDriver {
    http: reqwest::Client,
    config: CodespacesConfig,
    token: String,
    repository: String,
}

impl CodespacesDriver {
    /// Builds a driver from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Config`] naming the first missing setting.
    pub fn new(config: CodespacesConfig, request_timeout: Duration) -> Result<Self, DriverError> {
        config.validate().map_err(|err| DriverError::Config {
            provider: KIND,
            message: err.to_string(),
        })?;
        let trimmed = |value: Option<&str>| value.map(str::trim).unwrap_or_default().to_owned();
        Ok(Self {
            http: http_client(KIND, request_timeout, None)?,
            token: trimmed(config.token.as_deref()),
            repository: trimmed(config.repository.as_deref()),
            config,
        })
    }

    /// Path of the GitHub CLI used to reach codespaces.
    #[must_use]
    pub fn gh_bin(&self) -> &str {
        &self.config.gh_bin
    }

    fn codespace_name(handle: &BackendHandle) -> Result<&str, DriverError> {
        match handle {
            BackendHandle::HostedContainer { codespace } => Ok(codespace),
            other => Err(DriverError::ForeignHandle {
                provider: KIND,
                handle: other.clone(),
            }),
        }
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(
                method,
                format!("{}{path}", self.config.api_base.trim_end_matches('/')),
            )
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
    }

    async fn list_page(&self, page: u32) -> Result<Vec<Codespace>, DriverError> {
        let page_size = LIST_PAGE_SIZE.to_string();
        let page_number = page.to_string();
        let response = self
            .request(Method::GET, "/user/codespaces")
            .query(&[("per_page", page_size.as_str()), ("page", page_number.as_str())])
            .send()
            .await
            .map_err(|err| DriverError::api(KIND, "list", err))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DriverError::api(KIND, "list", format!("HTTP {status}: {body}")));
        }
        let listed: CodespaceList = response
            .json()
            .await
            .map_err(|err| DriverError::api(KIND, "list", err))?;
        Ok(listed.codespaces)
    }

    async fn fetch(&self, name: &str) -> Result<Option<Codespace>, DriverError> {
        let response = self
            .request(Method::GET, &format!("/user/codespaces/{name}"))
            .send()
            .await
            .map_err(|err| DriverError::api(KIND, "describe", err))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DriverError::api(KIND, "describe", format!("HTTP {status}: {body}")));
        }
        response
            .json()
            .await
            .map(Some)
            .map_err(|err| DriverError::api(KIND, "describe", err))
    }
}

/// Maps a codespace (or its absence) to a driver description.
fn describe_codespace(codespace: Option<&Codespace>) -> Description {
    let Some(found) = codespace else {
        return Description::gone();
    };
    match found.state.as_str() {
        "Available" => Description::running(Some(NetworkRef::Address(Endpoint::new(
            found.name.clone(),
            SSH_PORT,
        )))),
        "Deleted" | "Archived" | "Moved" => Description::gone(),
        "Failed" | "Unavailable" | "Shutdown" | "ShuttingDown" => {
            Description::failed(format!("codespace {} is {}", found.name, found.state))
        }
        _ => Description::provisioning(),
    }
}

fn is_managed(codespace: &Codespace) -> bool {
    codespace
        .display_name
        .as_deref()
        .is_some_and(|name| name.starts_with(DISPLAY_NAME_PREFIX))
}

impl Driver for CodespacesDriver {
    fn kind(&self) -> ProviderKind {
        KIND
    }

    fn requires_key(&self) -> bool {
        false
    }

    fn login_user(&self) -> Option<&str> {
        None
    }

    fn create<'a>(
        &'a self,
        spec: &'a SessionSpec,
        _public_key: Option<&'a str>,
    ) -> DriverFuture<'a, BackendHandle> {
        Box::pin(async move {
            spec.validate()?;
            let payload = CreateCodespaceRequest {
                machine: spec.machine.as_deref().unwrap_or(&self.config.machine),
                display_name: format!("{DISPLAY_NAME_PREFIX}{}", spec.name),
                idle_timeout_minutes: self.config.idle_timeout_minutes,
                git_ref: self.config.branch.as_deref(),
            };
            let response = self
                .request(Method::POST, &format!("/repos/{}/codespaces", self.repository))
                .json(&payload)
                .send()
                .await
                .map_err(|err| DriverError::provision(KIND, err))?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(DriverError::provision(KIND, format!("HTTP {status}: {body}")));
            }
            let created: Codespace = response
                .json()
                .await
                .map_err(|err| DriverError::provision(KIND, err))?;

            info!(codespace = %created.name, repository = %self.repository, "created codespace");
            Ok(BackendHandle::HostedContainer {
                codespace: created.name,
            })
        })
    }

    fn describe<'a>(&'a self, handle: &'a BackendHandle) -> DriverFuture<'a, Description> {
        Box::pin(async move {
            let name = Self::codespace_name(handle)?;
            let found = self.fetch(name).await?;
            Ok(describe_codespace(found.as_ref()))
        })
    }

    fn resolve_endpoint<'a>(
        &'a self,
        handle: &'a BackendHandle,
        network_id: &'a str,
    ) -> DriverFuture<'a, Option<Endpoint>> {
        Box::pin(async move {
            Self::codespace_name(handle)?;
            Ok(Some(Endpoint::new(network_id, SSH_PORT)))
        })
    }

    fn terminate<'a>(&'a self, handle: &'a BackendHandle) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            let name = Self::codespace_name(handle)?;
            let response = self
                .request(Method::DELETE, &format!("/user/codespaces/{name}"))
                .send()
                .await
                .map_err(|err| DriverError::api(KIND, "terminate", err))?;
            let status = response.status();
            if status == StatusCode::NOT_FOUND {
                debug!(codespace = name, "codespace already gone");
                return Ok(());
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(DriverError::api(KIND, "terminate", format!("HTTP {status}: {body}")));
            }
            info!(codespace = name, "deleted codespace");
            Ok(())
        })
    }

    /// Reachability is checked by `gh codespace ssh` itself.
    fn accepts_connections<'a>(&'a self, _endpoint: &'a Endpoint) -> DriverFuture<'a, bool> {
        Box::pin(async { Ok(true) })
    }

    fn list_active(&self) -> DriverFuture<'_, Vec<BackendHandle>> {
        Box::pin(async move {
            let mut codespaces = Vec::new();
            for page in 1_u32.. {
                let listed = self.list_page(page).await?;
                let last = listed.len() < LIST_PAGE_SIZE;
                codespaces.extend(listed);
                if last {
                    break;
                }
            }
            Ok(codespaces
                .into_iter()
                .filter(is_managed)
                .filter(|found| describe_codespace(Some(found)).state != RemoteState::Gone)
                .map(|found| BackendHandle::HostedContainer {
                    codespace: found.name,
                })
                .collect())
        })
    }
}
