//! Provider driver abstraction shared by every backend.
//!
//! Drivers are object safe so the factory can route a provider name to a
//! boxed implementation. Each driver only unwraps its own
//! [`BackendHandle`] variant and bounds every remote call with a timeout.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;

use crate::session::{BackendHandle, Endpoint, ProviderKind};

/// Longest logical name accepted for a session.
pub const MAX_NAME_LEN: usize = 40;
/// Bound on a single connection check against a session endpoint.
pub const CONNECT_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Parameters for creating a remote session.
///
/// Sizing hints are optional; drivers fall back to their configured defaults
/// and ignore hints that do not apply to their backend.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SessionSpec {
    /// Logical name, used to derive remote resource names.
    pub name: String,
    /// Image label or container image reference.
    pub image: Option<String>,
    /// Commercial instance type (VM backends).
    pub instance_type: Option<String>,
    /// CPU request (cluster backends), for example `500m`.
    pub cpu: Option<String>,
    /// Memory request (cluster backends), for example `512Mi`.
    pub memory: Option<String>,
    /// Machine type (hosted-container backends).
    pub machine: Option<String>,
}

impl SessionSpec {
    /// Starts a builder for a [`SessionSpec`].
    #[must_use]
    pub fn builder(name: impl Into<String>) -> SessionSpecBuilder {
        SessionSpecBuilder::new(name)
    }

    /// Checks the logical name is usable as part of a remote resource name.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Validation`] when the name is empty, too long, or
    /// contains characters other than lowercase ASCII letters, digits, and
    /// hyphens.
    pub fn validate(&self) -> Result<(), DriverError> {
        if self.name.is_empty() {
            return Err(DriverError::validation("name", "must not be empty"));
        }
        if self.name.len() > MAX_NAME_LEN {
            return Err(DriverError::validation(
                "name",
                format!("must be at most {MAX_NAME_LEN} characters"),
            ));
        }
        let valid_chars = self
            .name
            .chars()
            .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-');
        if !valid_chars || self.name.starts_with('-') || self.name.ends_with('-') {
            return Err(DriverError::validation(
                "name",
                "use lowercase letters, digits, and inner hyphens only",
            ));
        }
        for (field, value) in [
            ("image", &self.image),
            ("instance_type", &self.instance_type),
            ("cpu", &self.cpu),
            ("memory", &self.memory),
            ("machine", &self.machine),
        ] {
            if value.as_deref().is_some_and(str::is_empty) {
                return Err(DriverError::validation(field, "must not be blank"));
            }
        }
        Ok(())
    }
}

/// Builder for [`SessionSpec`] that trims inputs before validation.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SessionSpecBuilder {
    spec: SessionSpec,
}

impl SessionSpecBuilder {
    /// Creates a builder with the given logical name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            spec: SessionSpec {
                name: name.into(),
                ..SessionSpec::default()
            },
        }
    }

    /// Sets the image hint.
    #[must_use]
    pub fn image(mut self, value: Option<String>) -> Self {
        self.spec.image = value;
        self
    }

    /// Sets the instance type hint.
    #[must_use]
    pub fn instance_type(mut self, value: Option<String>) -> Self {
        self.spec.instance_type = value;
        self
    }

    /// Sets the CPU hint.
    #[must_use]
    pub fn cpu(mut self, value: Option<String>) -> Self {
        self.spec.cpu = value;
        self
    }

    /// Sets the memory hint.
    #[must_use]
    pub fn memory(mut self, value: Option<String>) -> Self {
        self.spec.memory = value;
        self
    }

    /// Sets the machine type hint.
    #[must_use]
    pub fn machine(mut self, value: Option<String>) -> Self {
        self.spec.machine = value;
        self
    }

    /// Trims every field and validates the result.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Validation`] when validation fails.
    pub fn build(self) -> Result<SessionSpec, DriverError> {
        let trim = |value: Option<String>| value.map(|raw| raw.trim().to_owned());
        let spec = SessionSpec {
            name: self.spec.name.trim().to_owned(),
            image: trim(self.spec.image),
            instance_type: trim(self.spec.instance_type),
            cpu: trim(self.spec.cpu),
            memory: trim(self.spec.memory),
            machine: trim(self.spec.machine),
        };
        spec.validate()?;
        Ok(spec)
    }
}

/// Backend view of a remote session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RemoteState {
    /// Accepted but not yet running.
    Provisioning,
    /// Running; may still lack a reachable address.
    Running,
    /// Stopped or crashed; will not recover.
    Failed {
        /// Backend supplied reason.
        reason: String,
    },
    /// The backend no longer knows the resource.
    Gone,
}

/// Network information returned by [`Driver::describe`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NetworkRef {
    /// Address that can be connected to directly.
    Address(Endpoint),
    /// Identifier that needs [`Driver::resolve_endpoint`], such as a node name.
    Lookup(String),
}

/// Result of a single [`Driver::describe`] call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Description {
    /// Current backend state.
    pub state: RemoteState,
    /// Network information, when the backend has any yet.
    pub network: Option<NetworkRef>,
}

impl Description {
    /// Describes a resource that has not started yet.
    #[must_use]
    pub const fn provisioning() -> Self {
        Self {
            state: RemoteState::Provisioning,
            network: None,
        }
    }

    /// Describes a running resource with optional network information.
    #[must_use]
    pub const fn running(network: Option<NetworkRef>) -> Self {
        Self {
            state: RemoteState::Running,
            network,
        }
    }

    /// Describes a resource that failed.
    #[must_use]
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            state: RemoteState::Failed {
                reason: reason.into(),
            },
            network: None,
        }
    }

    /// Describes a resource that no longer exists.
    #[must_use]
    pub const fn gone() -> Self {
        Self {
            state: RemoteState::Gone,
            network: None,
        }
    }
}

/// Errors raised by provider drivers.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DriverError {
    /// Raised when a session spec field is invalid.
    #[error("invalid session spec field {field}: {message}")]
    Validation {
        /// Offending field.
        field: String,
        /// What is wrong with it.
        message: String,
    },
    /// Raised when the driver cannot be constructed from its configuration.
    #[error("{provider} driver is misconfigured: {message}")]
    Config {
        /// Driver being configured.
        provider: ProviderKind,
        /// Validation message naming the setting to fix.
        message: String,
    },
    /// Raised when the backend rejects a create request.
    #[error("{provider} rejected the create request: {message}")]
    Provision {
        /// Backend that failed.
        provider: ProviderKind,
        /// Raw backend error.
        message: String,
    },
    /// Raised when a describe, lookup, list, or terminate call fails.
    #[error("{provider} {operation} failed: {message}")]
    Api {
        /// Backend that failed.
        provider: ProviderKind,
        /// Operation being performed.
        operation: &'static str,
        /// Raw backend error.
        message: String,
    },
    /// Raised when a remote call exceeds its per-call timeout.
    #[error("{provider} {operation} timed out after {seconds}s")]
    Timeout {
        /// Backend that timed out.
        provider: ProviderKind,
        /// Operation being performed.
        operation: &'static str,
        /// Configured timeout.
        seconds: u64,
    },
    /// Raised when a driver receives another provider's handle.
    #[error("{provider} driver cannot operate on {handle}")]
    ForeignHandle {
        /// Driver that received the handle.
        provider: ProviderKind,
        /// Handle that was passed in.
        handle: BackendHandle,
    },
    /// Raised when a driver that injects keys is called without one.
    #[error("{provider} driver requires a public key")]
    MissingKey {
        /// Driver that needs the key.
        provider: ProviderKind,
    },
}

impl DriverError {
    /// Builds a [`DriverError::Validation`].
    #[must_use]
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_owned(),
            message: message.into(),
        }
    }

    /// Builds a [`DriverError::Api`] from any displayable error.
    #[must_use]
    pub fn api(provider: ProviderKind, operation: &'static str, err: impl ToString) -> Self {
        Self::Api {
            provider,
            operation,
            message: err.to_string(),
        }
    }

    /// Builds a [`DriverError::Provision`] from any displayable error.
    #[must_use]
    pub fn provision(provider: ProviderKind, err: impl ToString) -> Self {
        Self::Provision {
            provider,
            message: err.to_string(),
        }
    }
}

/// Future returned by driver operations.
pub type DriverFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DriverError>> + Send + 'a>>;

/// Uniform interface implemented by every backend.
pub trait Driver: Send + Sync {
    /// Backend family served by this driver.
    fn kind(&self) -> ProviderKind;

    /// Whether [`Driver::create`] needs a public key to inject.
    fn requires_key(&self) -> bool;

    /// Remote account the bridge should log in as, when the driver picks one.
    fn login_user(&self) -> Option<&str>;

    /// Submits a new remote session and returns its handle.
    ///
    /// Callers must not retry a failed call for the same logical request.
    fn create<'a>(
        &'a self,
        spec: &'a SessionSpec,
        public_key: Option<&'a str>,
    ) -> DriverFuture<'a, BackendHandle>;

    /// Reports the current state with a single remote round trip.
    fn describe<'a>(&'a self, handle: &'a BackendHandle) -> DriverFuture<'a, Description>;

    /// Resolves a [`NetworkRef::Lookup`] identifier to an endpoint.
    ///
    /// Returns `Ok(None)` while the backend has no address yet.
    fn resolve_endpoint<'a>(
        &'a self,
        handle: &'a BackendHandle,
        network_id: &'a str,
    ) -> DriverFuture<'a, Option<Endpoint>>;

    /// Releases the remote resource. Absent resources are not an error.
    fn terminate<'a>(&'a self, handle: &'a BackendHandle) -> DriverFuture<'a, ()>;

    /// Lists resources created by this tool that the backend still reports.
    fn list_active(&self) -> DriverFuture<'_, Vec<BackendHandle>>;

    /// Whether [`Driver::list_active`] would report `handle` if it still
    /// existed. Records outside that scope cannot be judged stale.
    fn covers(&self, handle: &BackendHandle) -> bool {
        handle.provider() == self.kind()
    }

    /// Whether `endpoint` accepts connections yet. Defaults to a bounded TCP
    /// connect to the endpoint.
    fn accepts_connections<'a>(&'a self, endpoint: &'a Endpoint) -> DriverFuture<'a, bool> {
        Box::pin(async move { Ok(tcp_accepts(endpoint, CONNECT_CHECK_TIMEOUT).await) })
    }
}

/// Returns `true` when a TCP connection to `endpoint` opens within `limit`.
pub async fn tcp_accepts(endpoint: &Endpoint, limit: Duration) -> bool {
    let address = (endpoint.host.as_str(), endpoint.port);
    matches!(
        tokio::time::timeout(limit, TcpStream::connect(address)).await,
        Ok(Ok(_))
    )
}

/// Runs `future`, converting an elapsed `limit` into [`DriverError::Timeout`].
///
/// # Errors
///
/// Returns the future's own error, or [`DriverError::Timeout`].
pub async fn with_timeout<T, F>(
    provider: ProviderKind,
    operation: &'static str,
    limit: Duration,
    future: F,
) -> Result<T, DriverError>
where
    F: Future<Output = Result<T, DriverError>>,
{
    tokio::time::timeout(limit, future)
        .await
        .unwrap_or(Err(DriverError::Timeout {
            provider,
            operation,
            seconds: limit.as_secs(),
        }))
}

/// Builds the HTTP client used for raw control-plane calls.
///
/// # Errors
///
/// Returns [`DriverError::Config`] when the client cannot be built, for
/// example because a CA bundle is malformed.
pub fn http_client(
    provider: ProviderKind,
    timeout: Duration,
    extra_root: Option<reqwest::Certificate>,
) -> Result<reqwest::Client, DriverError> {
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("hatch/", env!("CARGO_PKG_VERSION")));
    if let Some(certificate) = extra_root {
        builder = builder.add_root_certificate(certificate);
    }
    builder.build().map_err(|err| DriverError::Config {
        provider,
        message: err.to_string(),
    })
}

/// Suffix appended to remote resource names so repeated names never clash.
#[must_use]
pub fn resource_suffix() -> String {
    uuid::Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(6)
        .collect()
}
