//! Session model shared by drivers, the registry, and the bridge.
//!
//! A session's status and its endpoint live in one enum, [`SessionState`], so
//! an endpoint can only exist while the session is ready. Transitions go
//! through [`Session::transition`], which enforces the lifecycle order.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::keys::KeyRef;

const SESSION_ID_LEN: usize = 12;

/// Backend families a session can run on.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// A task (pod) on a container-orchestration cluster.
    ContainerTask,
    /// A virtual-machine instance.
    VmInstance,
    /// A hosted development container.
    HostedContainer,
}

impl ProviderKind {
    /// Every provider kind, in routing preference order.
    pub const ALL: [Self; 3] = [Self::VmInstance, Self::ContainerTask, Self::HostedContainer];

    /// Returns the stable name used in configuration and on disk.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ContainerTask => "container-task",
            Self::VmInstance => "vm-instance",
            Self::HostedContainer => "hosted-container",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when a provider name does not match any known kind.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("unknown provider '{0}' (expected container-task, vm-instance, or hosted-container)")]
pub struct UnknownProvider(pub String);

impl FromStr for ProviderKind {
    type Err = UnknownProvider;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalised = value.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalised)
            .ok_or_else(|| UnknownProvider(value.to_owned()))
    }
}

/// Network address at which a ready session accepts connections.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct Endpoint {
    /// Hostname, IP address, or provider-level name of the environment.
    pub host: String,
    /// TCP port of the remote shell service.
    pub port: u16,
}

impl Endpoint {
    /// Builds an endpoint from a host and port.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Provider specific reference to the remote resource behind a session.
///
/// Each driver only ever unwraps its own variant.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BackendHandle {
    /// Pod submitted to a cluster.
    ContainerTask {
        /// Namespace holding the pod.
        namespace: String,
        /// Pod name.
        pod: String,
    },
    /// Server created through the Instances API.
    VmInstance {
        /// Availability zone of the server.
        zone: String,
        /// Server identifier.
        server_id: String,
    },
    /// Hosted development container.
    HostedContainer {
        /// Unique codespace name.
        codespace: String,
    },
}

impl BackendHandle {
    /// Returns the provider kind owning this handle.
    #[must_use]
    pub const fn provider(&self) -> ProviderKind {
        match self {
            Self::ContainerTask { .. } => ProviderKind::ContainerTask,
            Self::VmInstance { .. } => ProviderKind::VmInstance,
            Self::HostedContainer { .. } => ProviderKind::HostedContainer,
        }
    }

    /// Zone or namespace the resource lives in, when the provider has one.
    #[must_use]
    pub fn location(&self) -> Option<&str> {
        match self {
            Self::ContainerTask { namespace, .. } => Some(namespace),
            Self::VmInstance { zone, .. } => Some(zone),
            Self::HostedContainer { .. } => None,
        }
    }
}

impl fmt::Display for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContainerTask { namespace, pod } => write!(f, "pod {namespace}/{pod}"),
            Self::VmInstance { zone, server_id } => write!(f, "server {zone}/{server_id}"),
            Self::HostedContainer { codespace } => write!(f, "codespace {codespace}"),
        }
    }
}

/// Lifecycle status of a session without the data attached to it.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created locally; nothing submitted yet.
    Pending,
    /// Submitted to the backend and waiting to become reachable.
    Provisioning,
    /// Reachable at its endpoint.
    Ready,
    /// Stopped, crashed, or never became reachable.
    Failed,
    /// Teardown requested but not yet confirmed.
    Terminating,
    /// Remote resource and key material released.
    Terminated,
}

impl SessionStatus {
    /// Returns the lowercase status name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when a status name cannot be parsed.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("unknown session status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for SessionStatus {
    type Err = UnknownStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "provisioning" => Ok(Self::Provisioning),
            "ready" => Ok(Self::Ready),
            "failed" => Ok(Self::Failed),
            "terminating" => Ok(Self::Terminating),
            "terminated" => Ok(Self::Terminated),
            _ => Err(UnknownStatus(value.to_owned())),
        }
    }
}

/// Status together with the data that is only valid in that status.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionState {
    /// See [`SessionStatus::Pending`].
    Pending,
    /// See [`SessionStatus::Provisioning`].
    Provisioning,
    /// See [`SessionStatus::Ready`].
    Ready {
        /// Address the bridge connects to.
        endpoint: Endpoint,
    },
    /// See [`SessionStatus::Failed`].
    Failed {
        /// Why the session failed, as reported by the backend or the poller.
        reason: String,
    },
    /// See [`SessionStatus::Terminating`].
    Terminating,
    /// See [`SessionStatus::Terminated`].
    Terminated,
}

impl SessionState {
    /// Returns the status without attached data.
    #[must_use]
    pub const fn status(&self) -> SessionStatus {
        match self {
            Self::Pending => SessionStatus::Pending,
            Self::Provisioning => SessionStatus::Provisioning,
            Self::Ready { .. } => SessionStatus::Ready,
            Self::Failed { .. } => SessionStatus::Failed,
            Self::Terminating => SessionStatus::Terminating,
            Self::Terminated => SessionStatus::Terminated,
        }
    }

    /// Returns the endpoint, present only when ready.
    #[must_use]
    pub const fn endpoint(&self) -> Option<&Endpoint> {
        match self {
            Self::Ready { endpoint } => Some(endpoint),
            _ => None,
        }
    }

    /// Reports whether moving to `next` follows the session lifecycle.
    #[must_use]
    pub const fn can_transition_to(&self, next: &Self) -> bool {
        use SessionStatus as S;
        matches!(
            (self.status(), next.status()),
            (S::Pending, S::Provisioning)
                | (S::Provisioning, S::Ready | S::Failed | S::Terminating)
                | (S::Ready | S::Failed, S::Terminating)
                | (S::Terminating, S::Terminating | S::Terminated)
        )
    }
}

/// Raised when a requested state change skips or reverses the lifecycle.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransitionError {
    /// The lifecycle does not allow this move.
    #[error("session cannot move from {from} to {to}")]
    NotAllowed {
        /// Current status.
        from: SessionStatus,
        /// Requested status.
        to: SessionStatus,
    },
    /// The handle belongs to a different provider than the session.
    #[error("{handle} does not belong to a {provider} session")]
    ForeignHandle {
        /// Provider of the session.
        provider: ProviderKind,
        /// Offending handle.
        handle: BackendHandle,
    },
}

/// A single ephemeral remote environment tracked end to end.
///
/// This is also the record persisted by the registry.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Session {
    /// Opaque identifier generated at creation.
    pub id: String,
    /// Logical name supplied by the caller.
    pub name: String,
    /// Backend family running the session.
    pub provider: ProviderKind,
    #[serde(flatten)]
    state: SessionState,
    /// Reference to the remote resource; absent before submission and after
    /// termination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<BackendHandle>,
    /// Key files owned by this session, when the driver injects a key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<KeyRef>,
    /// Remote account used by the bridge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_user: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last recorded state change.
    pub last_seen_at: DateTime<Utc>,
}

impl Session {
    /// Creates a pending session with a freshly generated identifier.
    #[must_use]
    pub fn pending(name: impl Into<String>, provider: ProviderKind) -> Self {
        let now = Utc::now();
        Self {
            id: generate_session_id(),
            name: name.into(),
            provider,
            state: SessionState::Pending,
            handle: None,
            key: None,
            login_user: None,
            created_at: now,
            last_seen_at: now,
        }
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> &SessionState {
        &self.state
    }

    /// Returns the current status.
    #[must_use]
    pub const fn status(&self) -> SessionStatus {
        self.state.status()
    }

    /// Returns the endpoint when the session is ready.
    #[must_use]
    pub const fn endpoint(&self) -> Option<&Endpoint> {
        self.state.endpoint()
    }

    /// Records the backend handle and moves the session to provisioning.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] when the session is not pending or the
    /// handle belongs to another provider.
    pub fn begin_provisioning(&mut self, handle: BackendHandle) -> Result<(), TransitionError> {
        if handle.provider() != self.provider {
            return Err(TransitionError::ForeignHandle {
                provider: self.provider,
                handle,
            });
        }
        self.transition(SessionState::Provisioning)?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Moves the session to `next`, refreshing `last_seen_at`.
    ///
    /// Entering [`SessionState::Terminated`] drops the handle and key
    /// reference; callers release both remotely and on disk beforehand.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError::NotAllowed`] when the lifecycle forbids the
    /// move.
    pub fn transition(&mut self, next: SessionState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(&next) {
            return Err(TransitionError::NotAllowed {
                from: self.status(),
                to: next.status(),
            });
        }
        if next.status() == SessionStatus::Terminated {
            self.handle = None;
            self.key = None;
        }
        self.state = next;
        self.last_seen_at = Utc::now();
        Ok(())
    }
}

/// Generates a short random session identifier.
#[must_use]
pub fn generate_session_id() -> String {
    Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(SESSION_ID_LEN)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn vm_handle() -> BackendHandle {
        BackendHandle::VmInstance {
            zone: String::from("fr-par-1"),
            server_id: String::from("srv-1"),
        }
    }

    fn ready() -> SessionState {
        SessionState::Ready {
            endpoint: Endpoint::new("10.0.0.5", 22),
        }
    }

    #[rstest]
    #[case("vm-instance", ProviderKind::VmInstance)]
    #[case("container_task", ProviderKind::ContainerTask)]
    #[case(" Hosted-Container ", ProviderKind::HostedContainer)]
    fn provider_kind_parses_names(#[case] raw: &str, #[case] expected: ProviderKind) {
        assert_eq!(raw.parse::<ProviderKind>(), Ok(expected));
    }

    #[test]
    fn provider_kind_rejects_unknown_names() {
        let err = "lambda".parse::<ProviderKind>().expect_err("unknown provider");
        assert!(err.to_string().contains("lambda"));
    }

    #[test]
    fn endpoint_brackets_ipv6_hosts() {
        assert_eq!(Endpoint::new("10.0.0.5", 22).to_string(), "10.0.0.5:22");
        assert_eq!(Endpoint::new("2001:db8::1", 2222).to_string(), "[2001:db8::1]:2222");
    }

    #[test]
    fn endpoint_only_exists_when_ready() {
        let mut session = Session::pending("demo", ProviderKind::VmInstance);
        assert!(session.endpoint().is_none());
        session
            .begin_provisioning(vm_handle())
            .expect("pending -> provisioning");
        assert!(session.endpoint().is_none());
        session.transition(ready()).expect("provisioning -> ready");
        assert_eq!(session.status(), SessionStatus::Ready);
        assert_eq!(session.endpoint(), Some(&Endpoint::new("10.0.0.5", 22)));
        session
            .transition(SessionState::Terminating)
            .expect("ready -> terminating");
        assert!(session.endpoint().is_none());
    }

    #[rstest]
    #[case(SessionState::Pending, ready())]
    #[case(SessionState::Pending, SessionState::Terminated)]
    #[case(ready(), SessionState::Provisioning)]
    #[case(SessionState::Terminated, SessionState::Terminating)]
    #[case(SessionState::Provisioning, SessionState::Terminated)]
    fn rejects_out_of_order_transitions(#[case] from: SessionState, #[case] to: SessionState) {
        assert!(!from.can_transition_to(&to));
    }

    #[test]
    fn begin_provisioning_rejects_foreign_handle() {
        let mut session = Session::pending("demo", ProviderKind::ContainerTask);
        let err = session
            .begin_provisioning(vm_handle())
            .expect_err("vm handle on container session");
        assert!(matches!(err, TransitionError::ForeignHandle { .. }));
        assert_eq!(session.status(), SessionStatus::Pending);
    }

    #[test]
    fn terminating_releases_handle_and_key_on_terminated() {
        let mut session = Session::pending("demo", ProviderKind::VmInstance);
        session.begin_provisioning(vm_handle()).expect("provisioning");
        session
            .transition(SessionState::Terminating)
            .expect("terminating");
        session
            .transition(SessionState::Terminated)
            .expect("terminated");
        assert!(session.handle.is_none());
        assert!(session.key.is_none());
    }

    #[test]
    fn serialises_status_and_endpoint_side_by_side() {
        let mut session = Session::pending("demo", ProviderKind::VmInstance);
        session.begin_provisioning(vm_handle()).expect("provisioning");
        session.transition(ready()).expect("ready");

        let value = serde_json::to_value(&session).expect("serialise session");
        assert_eq!(value["status"], "ready");
        assert_eq!(value["endpoint"]["host"], "10.0.0.5");
        assert_eq!(value["handle"]["kind"], "vm-instance");

        let parsed: Session = serde_json::from_value(value).expect("deserialise session");
        assert_eq!(parsed, session);
    }

    #[test]
    fn session_ids_are_short_and_distinct() {
        let first = generate_session_id();
        let second = generate_session_id();
        assert_eq!(first.len(), SESSION_ID_LEN);
        assert_ne!(first, second);
    }
}
