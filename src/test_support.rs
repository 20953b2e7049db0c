//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

use crate::bridge::{ClientCommand, ClientLauncher, LaunchError};
use crate::driver::{Description, Driver, DriverError, DriverFuture, NetworkRef, SessionSpec};
use crate::session::{BackendHandle, Endpoint, ProviderKind};

/// Address every [`FakeDriver`] reports by default.
pub const FAKE_HOST: &str = "10.0.0.5";

#[derive(Debug, Default)]
struct FakeState {
    descriptions: VecDeque<Description>,
    lookups: Vec<(String, Endpoint)>,
    describe_calls: usize,
    created: Vec<BackendHandle>,
    received_keys: Vec<Option<String>>,
    active: Vec<BackendHandle>,
    terminated: Vec<BackendHandle>,
    terminate_error: Option<DriverError>,
    refused_connections: usize,
    connection_checks: usize,
}

/// In-memory driver with scripted describe results.
///
/// Descriptions are returned in FIFO order; once the script runs out every
/// call returns the fallback, which defaults to running at
/// `10.0.0.5:22`. Clones share state, so a test can keep a clone for
/// assertions after handing one to the code under test.
#[derive(Clone, Debug)]
pub struct FakeDriver {
    kind: ProviderKind,
    requires_key: bool,
    login_user: Option<String>,
    fallback: Description,
    describe_error: Option<DriverError>,
    create_error: Option<DriverError>,
    create_delay: Duration,
    list_error: Option<DriverError>,
    scope: Option<String>,
    state: Arc<Mutex<FakeState>>,
}

impl FakeDriver {
    /// Creates a driver of `kind` that becomes ready on the first describe.
    #[must_use]
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            requires_key: kind != ProviderKind::HostedContainer,
            login_user: Some(String::from("root")),
            fallback: Description::running(Some(NetworkRef::Address(Endpoint::new(FAKE_HOST, 22)))),
            describe_error: None,
            create_error: None,
            create_delay: Duration::ZERO,
            list_error: None,
            scope: None,
            state: Arc::new(Mutex::new(FakeState::default())),
        }
    }

    /// Queues describe results, returned in order.
    #[must_use]
    pub fn with_descriptions(self, descriptions: impl IntoIterator<Item = Description>) -> Self {
        self.lock().descriptions.extend(descriptions);
        self
    }

    /// Sets the description returned once the queue is empty.
    #[must_use]
    pub fn with_fallback(mut self, description: Description) -> Self {
        self.fallback = description;
        self
    }

    /// Resolves `network_id` to `endpoint` in `resolve_endpoint`.
    #[must_use]
    pub fn with_lookup(self, network_id: &str, endpoint: Endpoint) -> Self {
        self.lock().lookups.push((network_id.to_owned(), endpoint));
        self
    }

    /// Makes every describe call fail with `err`.
    #[must_use]
    pub fn with_describe_error(mut self, err: DriverError) -> Self {
        self.describe_error = Some(err);
        self
    }

    /// Makes every create call fail with `err`.
    #[must_use]
    pub fn with_create_error(mut self, err: DriverError) -> Self {
        self.create_error = Some(err);
        self
    }

    /// Makes the next terminate call fail with `err`.
    #[must_use]
    pub fn with_terminate_error(self, err: DriverError) -> Self {
        self.lock().terminate_error = Some(err);
        self
    }

    /// Makes every list call fail with `err`.
    #[must_use]
    pub fn with_list_error(mut self, err: DriverError) -> Self {
        self.list_error = Some(err);
        self
    }

    /// Limits `list_active` coverage to handles in `location`.
    #[must_use]
    pub fn listing_only(mut self, location: &str) -> Self {
        self.scope = Some(location.to_owned());
        self
    }

    /// Makes every create take `delay` before the resource exists.
    #[must_use]
    pub const fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    /// Seeds resources the backend reports without this driver creating them.
    #[must_use]
    pub fn with_active(self, handles: impl IntoIterator<Item = BackendHandle>) -> Self {
        self.lock().active.extend(handles);
        self
    }

    /// Makes the next `count` connection checks report a closed endpoint.
    #[must_use]
    pub fn refusing_connections(self, count: usize) -> Self {
        self.lock().refused_connections = count;
        self
    }

    /// Overrides whether the driver needs an injected key.
    #[must_use]
    pub const fn requiring_key(mut self, requires_key: bool) -> Self {
        self.requires_key = requires_key;
        self
    }

    /// Overrides the login user.
    #[must_use]
    pub fn with_login_user(mut self, user: Option<&str>) -> Self {
        self.login_user = user.map(str::to_owned);
        self
    }

    /// Number of describe calls made so far.
    #[must_use]
    pub fn describe_calls(&self) -> usize {
        self.lock().describe_calls
    }

    /// Number of connection checks made so far.
    #[must_use]
    pub fn connection_checks(&self) -> usize {
        self.lock().connection_checks
    }

    /// Handles returned by successful create calls.
    #[must_use]
    pub fn created(&self) -> Vec<BackendHandle> {
        self.lock().created.clone()
    }

    /// Public keys passed to create calls, in order.
    #[must_use]
    pub fn received_keys(&self) -> Vec<Option<String>> {
        self.lock().received_keys.clone()
    }

    /// Resources the fake backend still reports.
    #[must_use]
    pub fn active(&self) -> Vec<BackendHandle> {
        self.lock().active.clone()
    }

    /// Handles passed to terminate calls that succeeded.
    #[must_use]
    pub fn terminated(&self) -> Vec<BackendHandle> {
        self.lock().terminated.clone()
    }

    /// Drops `handle` from the backend as if it vanished out of band.
    pub fn forget(&self, handle: &BackendHandle) {
        self.lock().active.retain(|active| active != handle);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_handle(&self, state: &FakeState) -> BackendHandle {
        let id = format!("fake-{}", state.created.len() + 1);
        match self.kind {
            ProviderKind::ContainerTask => BackendHandle::ContainerTask {
                namespace: String::from("default"),
                pod: id,
            },
            ProviderKind::VmInstance => BackendHandle::VmInstance {
                zone: String::from("fr-par-1"),
                server_id: id,
            },
            ProviderKind::HostedContainer => BackendHandle::HostedContainer { codespace: id },
        }
    }

    fn check_handle(&self, handle: &BackendHandle) -> Result<(), DriverError> {
        if handle.provider() == self.kind {
            return Ok(());
        }
        Err(DriverError::ForeignHandle {
            provider: self.kind,
            handle: handle.clone(),
        })
    }
}

impl Driver for FakeDriver {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn requires_key(&self) -> bool {
        self.requires_key
    }

    fn login_user(&self) -> Option<&str> {
        self.login_user.as_deref()
    }

    fn create<'a>(
        &'a self,
        spec: &'a SessionSpec,
        public_key: Option<&'a str>,
    ) -> DriverFuture<'a, BackendHandle> {
        Box::pin(async move {
            spec.validate()?;
            if !self.create_delay.is_zero() {
                tokio::time::sleep(self.create_delay).await;
            }
            let mut state = self.lock();
            state.received_keys.push(public_key.map(str::to_owned));
            if let Some(err) = &self.create_error {
                return Err(err.clone());
            }
            if self.requires_key && public_key.is_none() {
                return Err(DriverError::MissingKey {
                    provider: self.kind,
                });
            }
            let handle = self.next_handle(&state);
            state.created.push(handle.clone());
            state.active.push(handle.clone());
            Ok(handle)
        })
    }

    fn describe<'a>(&'a self, handle: &'a BackendHandle) -> DriverFuture<'a, Description> {
        Box::pin(async move {
            self.check_handle(handle)?;
            let mut state = self.lock();
            state.describe_calls += 1;
            if let Some(err) = &self.describe_error {
                return Err(err.clone());
            }
            Ok(state
                .descriptions
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone()))
        })
    }

    fn resolve_endpoint<'a>(
        &'a self,
        handle: &'a BackendHandle,
        network_id: &'a str,
    ) -> DriverFuture<'a, Option<Endpoint>> {
        Box::pin(async move {
            self.check_handle(handle)?;
            Ok(self
                .lock()
                .lookups
                .iter()
                .find(|(id, _)| id == network_id)
                .map(|(_, endpoint)| endpoint.clone()))
        })
    }

    fn terminate<'a>(&'a self, handle: &'a BackendHandle) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            self.check_handle(handle)?;
            let mut state = self.lock();
            if let Some(err) = state.terminate_error.take() {
                return Err(err);
            }
            state.active.retain(|active| active != handle);
            state.terminated.push(handle.clone());
            Ok(())
        })
    }

    fn list_active(&self) -> DriverFuture<'_, Vec<BackendHandle>> {
        Box::pin(async move {
            if let Some(err) = &self.list_error {
                return Err(err.clone());
            }
            let active = self.lock().active.clone();
            Ok(active
                .into_iter()
                .filter(|handle| self.covers(handle))
                .collect())
        })
    }

    fn covers(&self, handle: &BackendHandle) -> bool {
        handle.provider() == self.kind
            && self
                .scope
                .as_deref()
                .is_none_or(|scope| handle.location() == Some(scope))
    }

    fn accepts_connections<'a>(&'a self, _endpoint: &'a Endpoint) -> DriverFuture<'a, bool> {
        Box::pin(async move {
            let mut state = self.lock();
            state.connection_checks += 1;
            if state.refused_connections == 0 {
                return Ok(true);
            }
            state.refused_connections -= 1;
            Ok(false)
        })
    }
}

#[derive(Clone, Debug)]
enum LaunchOutcome {
    Exit(i32),
    Signalled,
    NotFound,
}

/// Scripted client launcher that returns pre-seeded outcomes in FIFO order.
///
/// Used to drive deterministic bridge outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedLauncher {
    outcomes: Arc<Mutex<VecDeque<LaunchOutcome>>>,
    invocations: Arc<Mutex<Vec<ClientCommand>>>,
}

impl ScriptedLauncher {
    /// Creates a launcher with no queued outcomes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<ClientCommand> {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Pushes a specific exit code.
    pub fn push_exit_code(&self, code: i32) {
        self.push(LaunchOutcome::Exit(code));
    }

    /// Pushes a termination by signal.
    pub fn push_signalled(&self) {
        self.push(LaunchOutcome::Signalled);
    }

    /// Pushes a missing-program failure.
    pub fn push_not_found(&self) {
        self.push(LaunchOutcome::NotFound);
    }

    fn push(&self, outcome: LaunchOutcome) {
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(outcome);
    }
}

impl ClientLauncher for ScriptedLauncher {
    fn launch(&self, command: &ClientCommand) -> Result<Option<i32>, LaunchError> {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command.clone());
        let outcome = self
            .outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match outcome {
            Some(LaunchOutcome::Exit(code)) => Ok(Some(code)),
            Some(LaunchOutcome::Signalled) => Ok(None),
            Some(LaunchOutcome::NotFound) => Err(LaunchError::NotFound {
                program: command.program.clone(),
            }),
            None => Err(LaunchError::Spawn {
                program: command.program.clone(),
                message: String::from("no scripted response available"),
            }),
        }
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
