//! Session lifecycle orchestration.
//!
//! The manager ties the factory, key provisioner, registry, poller, and
//! bridge together. A create either returns a ready session or an error that
//! names whatever it could not clean up.

use std::fmt::Display;
use std::future::Future;
use std::pin::pin;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bridge::{Bridge, BridgeError, ClientLauncher};
use crate::driver::{Driver, DriverError, SessionSpec};
use crate::factory::{FactoryError, ProviderFactory};
use crate::keys::{KeyError, KeyProvisioner};
use crate::readiness::{PollPolicy, ReadinessError, ReadinessPoller};
use crate::reconcile::{ReconcileError, ReconcileReport, Reconciler};
use crate::registry::{RegistryError, SessionFilter, SessionRegistry};
use crate::session::{BackendHandle, ProviderKind, Session, SessionState, SessionStatus};

/// Errors surfaced by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The requested provider cannot be used.
    #[error(transparent)]
    Factory(#[from] FactoryError),
    /// The session spec was rejected before anything was submitted.
    #[error("invalid session request: {0}")]
    Invalid(#[source] DriverError),
    /// Key material could not be issued or revoked.
    #[error(transparent)]
    Key(#[from] KeyError),
    /// The registry could not be read or written.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// The backend rejected the create request.
    #[error("failed to create {provider} session: {message}")]
    Provision {
        /// Provider that rejected the request.
        provider: ProviderKind,
        /// Error text with cleanup notes.
        message: String,
        /// Driver error.
        #[source]
        source: DriverError,
    },
    /// A created resource could not be recorded.
    #[error("created {handle} but could not record it: {message}")]
    Unrecorded {
        /// Resource that was created.
        handle: BackendHandle,
        /// Error text with cleanup notes.
        message: String,
        /// Registry error.
        #[source]
        source: RegistryError,
    },
    /// The session became ready but the registry could not record it.
    #[error(
        "session {id} is ready on {handle} but could not be recorded; run `hatch stop {id}` to release it: {source}"
    )]
    ReadyUnrecorded {
        /// Session identifier.
        id: String,
        /// Resource that is still running.
        handle: BackendHandle,
        /// Registry error.
        #[source]
        source: RegistryError,
    },
    /// The session never became reachable.
    #[error("session {id} did not become ready: {message}")]
    ReadinessTimeout {
        /// Session identifier.
        id: String,
        /// Error text with cleanup notes.
        message: String,
        /// Poller error.
        #[source]
        source: ReadinessError,
    },
    /// The backend reported a terminal failure while provisioning.
    #[error("session {id} failed while provisioning: {message}")]
    TerminalFailure {
        /// Session identifier.
        id: String,
        /// Error text with cleanup notes.
        message: String,
        /// Poller error.
        #[source]
        source: ReadinessError,
    },
    /// The backend could not be queried while waiting.
    #[error("lost track of session {id}: {message}")]
    Query {
        /// Session identifier.
        id: String,
        /// Error text with cleanup notes.
        message: String,
        /// Poller error.
        #[source]
        source: ReadinessError,
    },
    /// The caller interrupted the wait.
    #[error("creation of session {id} was cancelled: {message}")]
    Cancelled {
        /// Session identifier.
        id: String,
        /// Error text with cleanup notes.
        message: String,
    },
    /// Terminating the remote resource failed; the record stays terminating.
    #[error("failed to terminate {handle} for session {id} (rerun stop to retry): {source}")]
    Teardown {
        /// Session identifier.
        id: String,
        /// Resource that may still exist.
        handle: BackendHandle,
        /// Driver error.
        #[source]
        source: DriverError,
    },
    /// The local client could not reach the session.
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    /// `exec` was called without a command.
    #[error("no command given for session {id}")]
    EmptyCommand {
        /// Session identifier.
        id: String,
    },
    /// Reconciliation could not read the registry.
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

impl SessionError {
    /// Reports whether the error came from a user interrupt.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Parameters for [`SessionManager::create`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreateRequest {
    /// Provider to run the session on.
    pub provider: ProviderKind,
    /// Name and sizing hints.
    pub spec: SessionSpec,
    /// Keeps a session that never became ready instead of tearing it down.
    pub keep_on_failure: bool,
}

impl CreateRequest {
    /// Creates a request that tears failed sessions down.
    #[must_use]
    pub const fn new(provider: ProviderKind, spec: SessionSpec) -> Self {
        Self {
            provider,
            spec,
            keep_on_failure: false,
        }
    }

    /// Sets whether a failed session is kept for inspection.
    #[must_use]
    pub const fn keep_on_failure(mut self, keep: bool) -> Self {
        self.keep_on_failure = keep;
        self
    }
}

/// Creates, connects to, and stops sessions.
pub struct SessionManager<L: ClientLauncher> {
    factory: ProviderFactory,
    registry: SessionRegistry,
    keys: KeyProvisioner,
    bridge: Bridge<L>,
    policy: PollPolicy,
    cleanup_on_failure: bool,
}

impl<L: ClientLauncher> SessionManager<L> {
    /// Creates a manager with the default poll policy and cleanup enabled.
    #[must_use]
    pub fn new(
        factory: ProviderFactory,
        registry: SessionRegistry,
        keys: KeyProvisioner,
        bridge: Bridge<L>,
    ) -> Self {
        Self {
            factory,
            registry,
            keys,
            bridge,
            policy: PollPolicy::default(),
            cleanup_on_failure: true,
        }
    }

    /// Overrides the readiness policy.
    #[must_use]
    pub const fn with_poll_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets whether sessions that never become ready are torn down.
    #[must_use]
    pub const fn with_cleanup_on_failure(mut self, cleanup: bool) -> Self {
        self.cleanup_on_failure = cleanup;
        self
    }

    /// Returns the registry.
    #[must_use]
    pub const fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Provisions a session and waits until it is reachable.
    ///
    /// `cancel` is watched from the moment the backend request is submitted.
    /// An interrupt during submission lets the request finish and then
    /// discards what it created; during the wait the resource is torn down
    /// regardless of the cleanup setting.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when any step fails. Errors after the remote
    /// create name the resource if it could not be released.
    pub async fn create<C>(&self, request: &CreateRequest, cancel: C) -> Result<Session, SessionError>
    where
        C: Future<Output = ()>,
    {
        let driver = self.factory.get(request.provider)?;
        request.spec.validate().map_err(SessionError::Invalid)?;

        let mut session = Session::pending(request.spec.name.clone(), request.provider);
        session.login_user = driver.login_user().map(str::to_owned);
        let issued = if driver.requires_key() {
            Some(self.keys.issue(&session.id)?)
        } else {
            None
        };
        session.key = issued.as_ref().map(|key| key.key_ref.clone());

        let mut cancel = pin!(cancel);
        let public_key = issued.as_ref().map(|key| key.public_key.as_str());
        let mut submit = pin!(driver.create(&request.spec, public_key));
        let (created, interrupted) = tokio::select! {
            created = &mut submit => (created, false),
            () = &mut cancel => {
                warn!(session = %session.id, "interrupted; waiting for the pending create to finish");
                (submit.await, true)
            }
        };
        let handle = match created {
            Ok(handle) if interrupted => {
                let notes = self.discard_unrecorded(driver.as_ref(), &session, &handle).await;
                return Err(SessionError::Cancelled {
                    message: with_notes(&format!("interrupted while creating {handle}"), &notes),
                    id: session.id,
                });
            }
            Ok(handle) => handle,
            Err(err) => {
                let notes: Vec<String> = self.revoke_key(&session).into_iter().collect();
                return Err(SessionError::Provision {
                    provider: request.provider,
                    message: with_notes(&err, &notes),
                    source: err,
                });
            }
        };
        info!(session = %session.id, %handle, "submitted session");

        if let Err(err) = session.begin_provisioning(handle.clone()) {
            let notes = self.discard_unrecorded(driver.as_ref(), &session, &handle).await;
            return Err(SessionError::Unrecorded {
                message: with_notes(&err, &notes),
                handle,
                source: RegistryError::Transition {
                    id: session.id.clone(),
                    source: err,
                },
            });
        }
        if let Err(err) = self.registry.append(&session) {
            let notes = self.discard_unrecorded(driver.as_ref(), &session, &handle).await;
            return Err(SessionError::Unrecorded {
                message: with_notes(&err, &notes),
                handle,
                source: err,
            });
        }

        let waited = ReadinessPoller::new(driver.as_ref(), self.policy)
            .wait(&handle, cancel)
            .await;
        match waited {
            Ok(endpoint) => {
                let ready = self
                    .registry
                    .update(&session.id, SessionState::Ready { endpoint })
                    .map_err(|source| SessionError::ReadyUnrecorded {
                        id: session.id.clone(),
                        handle: handle.clone(),
                        source,
                    })?;
                info!(session = %ready.id, endpoint = ?ready.endpoint(), "session ready");
                Ok(ready)
            }
            Err(err) => Err(self.abandon(driver.as_ref(), &session, request, err).await),
        }
    }

    /// Tears down or keeps a session that never became ready.
    async fn abandon(
        &self,
        driver: &dyn Driver,
        session: &Session,
        request: &CreateRequest,
        err: ReadinessError,
    ) -> SessionError {
        let cancelled = matches!(err, ReadinessError::Cancelled { .. });
        let cleanup = cancelled || (self.cleanup_on_failure && !request.keep_on_failure);
        let notes = if cleanup {
            self.release(driver, session).await
        } else {
            self.keep_failed(session, &err)
        };
        let message = with_notes(&err, &notes);
        let id = session.id.clone();
        match err {
            ReadinessError::Timeout { .. } => SessionError::ReadinessTimeout {
                id,
                message,
                source: err,
            },
            ReadinessError::TerminalFailure { .. } => SessionError::TerminalFailure {
                id,
                message,
                source: err,
            },
            ReadinessError::Query { .. } => SessionError::Query {
                id,
                message,
                source: err,
            },
            ReadinessError::Cancelled { .. } => SessionError::Cancelled { id, message },
        }
    }

    /// Best-effort teardown of a recorded session. Returns notes describing
    /// anything left behind.
    async fn release(&self, driver: &dyn Driver, session: &Session) -> Vec<String> {
        let Some(handle) = session.handle.as_ref() else {
            return Vec::new();
        };
        if let Err(err) = self.registry.update(&session.id, SessionState::Terminating) {
            warn!(session = %session.id, error = %err, "failed to mark session terminating");
        }
        if let Err(err) = driver.terminate(handle).await {
            warn!(session = %session.id, %handle, error = %err, "teardown failed");
            return vec![format!(
                "teardown also failed, {handle} may still exist; run `hatch stop {}` to retry: {err}",
                session.id
            )];
        }
        info!(session = %session.id, %handle, "released session after failure");

        let mut notes = Vec::new();
        if let Err(err) = self
            .registry
            .update(&session.id, SessionState::Terminated)
            .and_then(|_| self.registry.remove(&session.id))
        {
            notes.push(format!("record {} could not be removed: {err}", session.id));
        }
        notes.extend(self.revoke_key(session));
        notes
    }

    /// Records a failed session for inspection.
    fn keep_failed(&self, session: &Session, err: &ReadinessError) -> Vec<String> {
        let Some(handle) = session.handle.as_ref() else {
            return Vec::new();
        };
        let reason = err.to_string();
        let mut notes = vec![format!(
            "{handle} was kept; run `hatch stop {}` to release it",
            session.id
        )];
        if let Err(update_err) = self
            .registry
            .update(&session.id, SessionState::Failed { reason })
        {
            notes.push(format!("failed to record the failure: {update_err}"));
        }
        notes
    }

    /// Terminates a resource that has no record.
    async fn discard_unrecorded(
        &self,
        driver: &dyn Driver,
        session: &Session,
        handle: &BackendHandle,
    ) -> Vec<String> {
        let mut notes = Vec::new();
        if let Err(err) = driver.terminate(handle).await {
            notes.push(format!("teardown also failed, {handle} may still exist: {err}"));
        }
        notes.extend(self.revoke_key(session));
        notes
    }

    fn revoke_key(&self, session: &Session) -> Option<String> {
        let key = session.key.as_ref()?;
        self.keys
            .revoke(key)
            .err()
            .map(|err| format!("key files may remain: {err}"))
    }

    /// Opens an interactive shell on a ready session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when the session cannot be found or reached.
    pub fn connect(&self, query: &str) -> Result<i32, SessionError> {
        let session = self.registry.resolve(query)?;
        Ok(self.bridge.attach(&session)?)
    }

    /// Runs `command` on a ready session and returns the remote exit code.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when the command is empty or the session
    /// cannot be found or reached.
    pub fn exec(&self, query: &str, command: &[String]) -> Result<i32, SessionError> {
        let session = self.registry.resolve(query)?;
        if command.is_empty() {
            return Err(SessionError::EmptyCommand { id: session.id });
        }
        Ok(self.bridge.execute(&session, command)?)
    }

    /// Terminates a session, removes its record, and revokes its key.
    ///
    /// A failed terminate leaves the record in `terminating` so the call can
    /// be repeated.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when the provider is unavailable, the
    /// backend refuses, or local state cannot be updated.
    pub async fn stop(&self, query: &str) -> Result<Session, SessionError> {
        let session = self.registry.resolve(query)?;
        let key = session.key.clone();

        if session.status() == SessionStatus::Pending {
            let removed = self.registry.remove(&session.id)?;
            if let Some(key_ref) = &key {
                self.keys.revoke(key_ref)?;
            }
            debug!(session = %session.id, "removed pending session");
            return Ok(removed.unwrap_or(session));
        }

        let driver = self.factory.get(session.provider)?;
        if session.status() != SessionStatus::Terminating {
            self.registry.update(&session.id, SessionState::Terminating)?;
        }
        if let Some(handle) = session.handle.as_ref() {
            driver
                .terminate(handle)
                .await
                .map_err(|source| SessionError::Teardown {
                    id: session.id.clone(),
                    handle: handle.clone(),
                    source,
                })?;
        }
        let terminated = self
            .registry
            .update(&session.id, SessionState::Terminated)?;
        self.registry.remove(&session.id)?;
        if let Some(key_ref) = &key {
            self.keys.revoke(key_ref)?;
        }
        info!(session = %session.id, "session stopped");
        Ok(terminated)
    }

    /// Lists recorded sessions.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Registry`] when the registry cannot be read.
    pub fn list(&self, filter: &SessionFilter) -> Result<Vec<Session>, SessionError> {
        Ok(self.registry.list(filter)?)
    }

    /// Compares the registry with every available backend.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Reconcile`] when the registry cannot be read.
    pub async fn reconcile(&self, terminate_untracked: bool) -> Result<ReconcileReport, SessionError> {
        Ok(Reconciler::new(&self.factory, &self.registry, &self.keys)
            .run(terminate_untracked)
            .await?)
    }

    /// Releases the drivers. Sessions keep running.
    pub fn shutdown(&mut self) {
        self.factory.shutdown();
    }
}

fn with_notes<E: Display>(err: &E, notes: &[String]) -> String {
    if notes.is_empty() {
        err.to_string()
    } else {
        format!("{err} ({})", notes.join("; "))
    }
}

#[cfg(test)]
mod tests;
