//! Shared fixtures for session lifecycle scenarios.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use hatch::test_support::{FakeDriver, ScriptedLauncher};
use hatch::{
    Bridge, KeyProvisioner, PollPolicy, ProviderFactory, ProviderKind, SessionManager,
    SessionRegistry,
};
use rstest::fixture;
use tempfile::TempDir;

/// Attempts the scenarios allow before a session counts as timed out.
pub const SCENARIO_ATTEMPTS: u32 = 4;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CreateFailureKind {
    Timeout,
    Terminal,
    Other,
}

#[derive(Clone, Debug)]
pub enum CreateResult {
    Ready { id: String, endpoint: String },
    Failure { kind: CreateFailureKind, message: String },
}

#[derive(Clone, Debug)]
pub struct SessionContext {
    pub dir: Arc<TempDir>,
    pub driver: FakeDriver,
    pub keep_on_failure: bool,
    pub outcome: Option<CreateResult>,
}

#[fixture]
pub fn session_context() -> SessionContext {
    SessionContext {
        dir: Arc::new(TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"))),
        driver: FakeDriver::new(ProviderKind::VmInstance),
        keep_on_failure: false,
        outcome: None,
    }
}

impl SessionContext {
    pub fn root(&self) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(self.dir.path().to_path_buf())
            .unwrap_or_else(|path| panic!("temp path should be utf8: {}", path.display()))
    }

    pub fn registry(&self) -> SessionRegistry {
        SessionRegistry::new(self.root())
    }

    pub fn manager(&self) -> SessionManager<ScriptedLauncher> {
        SessionManager::new(
            ProviderFactory::empty().with_driver(Arc::new(self.driver.clone())),
            self.registry(),
            KeyProvisioner::new(self.root().join("keys")),
            Bridge::new(ScriptedLauncher::new(), "ssh", "gh"),
        )
        .with_poll_policy(PollPolicy::new(SCENARIO_ATTEMPTS, Duration::ZERO))
    }

    pub fn key_files(&self) -> usize {
        std::fs::read_dir(self.root().join("keys"))
            .map(Iterator::count)
            .unwrap_or(0)
    }

    pub fn ready_id(&self) -> Option<&str> {
        match &self.outcome {
            Some(CreateResult::Ready { id, .. }) => Some(id),
            _ => None,
        }
    }
}
