//! Unit tests for the session manager.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::driver::{Description, DriverFuture};
use crate::session::Endpoint;
use crate::test_support::{FAKE_HOST, FakeDriver, ScriptedLauncher};

struct Harness {
    _tmp: TempDir,
    root: Utf8PathBuf,
    launcher: ScriptedLauncher,
}

impl Harness {
    fn manager(&self, driver: &FakeDriver) -> SessionManager<ScriptedLauncher> {
        let factory = ProviderFactory::empty().with_driver(Arc::new(driver.clone()));
        SessionManager::new(
            factory,
            SessionRegistry::new(self.root.clone()),
            KeyProvisioner::new(self.root.join("keys")),
            Bridge::new(self.launcher.clone(), "ssh", "gh"),
        )
        .with_poll_policy(PollPolicy::new(3, Duration::ZERO))
    }

    fn key_files(&self) -> usize {
        std::fs::read_dir(self.root.join("keys"))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

#[fixture]
fn harness() -> Harness {
    let tmp = TempDir::new().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .unwrap_or_else(|path| panic!("temp path should be utf8: {}", path.display()));
    Harness {
        _tmp: tmp,
        root,
        launcher: ScriptedLauncher::new(),
    }
}

fn request(provider: ProviderKind) -> CreateRequest {
    CreateRequest::new(provider, SessionSpec::builder("demo").build().expect("spec"))
}

#[rstest]
#[tokio::test]
async fn create_records_a_ready_session(harness: Harness) {
    let driver = FakeDriver::new(ProviderKind::VmInstance)
        .with_descriptions([Description::provisioning(), Description::provisioning()]);
    let manager = harness.manager(&driver);

    let session = manager
        .create(&request(ProviderKind::VmInstance), pending())
        .await
        .expect("create");

    assert_eq!(session.status(), SessionStatus::Ready);
    assert_eq!(session.endpoint(), Some(&Endpoint::new(FAKE_HOST, 22)));
    assert_eq!(session.login_user.as_deref(), Some("root"));
    assert_eq!(driver.describe_calls(), 3);
    let recorded = manager.registry().find(&session.id).expect("find");
    assert_eq!(recorded, Some(session.clone()));
    let keys = driver.received_keys();
    let sent = keys.first().cloned().flatten().expect("public key sent");
    assert!(sent.starts_with("ssh-ed25519 "));
}

#[rstest]
#[tokio::test]
async fn keyless_providers_get_no_key(harness: Harness) {
    let driver = FakeDriver::new(ProviderKind::HostedContainer);
    let manager = harness.manager(&driver);

    let session = manager
        .create(&request(ProviderKind::HostedContainer), pending())
        .await
        .expect("create");

    assert!(session.key.is_none());
    assert_eq!(driver.received_keys(), vec![None]);
    assert_eq!(harness.key_files(), 0);
}

#[rstest]
#[tokio::test]
async fn stop_releases_everything(harness: Harness) {
    let driver = FakeDriver::new(ProviderKind::ContainerTask);
    let manager = harness.manager(&driver);
    let session = manager
        .create(&request(ProviderKind::ContainerTask), pending())
        .await
        .expect("create");
    assert!(harness.key_files() > 0);

    let stopped = manager.stop(&session.id).await.expect("stop");

    assert_eq!(stopped.status(), SessionStatus::Terminated);
    assert!(manager.registry().find(&session.id).expect("find").is_none());
    assert_eq!(harness.key_files(), 0);
    assert!(driver.active().is_empty());
}

#[rstest]
#[tokio::test]
async fn failed_terminate_keeps_record_for_retry(harness: Harness) {
    let driver = FakeDriver::new(ProviderKind::VmInstance);
    let manager = harness.manager(&driver);
    let session = manager
        .create(&request(ProviderKind::VmInstance), pending())
        .await
        .expect("create");
    let failing = driver.clone().with_terminate_error(DriverError::api(
        ProviderKind::VmInstance,
        "terminate",
        "503 service unavailable",
    ));

    let err = manager.stop(&session.id).await.expect_err("terminate fails");
    assert!(matches!(err, SessionError::Teardown { .. }), "{err}");
    let kept = manager
        .registry()
        .find(&session.id)
        .expect("find")
        .expect("record kept");
    assert_eq!(kept.status(), SessionStatus::Terminating);
    assert!(kept.key.is_some());

    manager.stop(&session.id).await.expect("retry succeeds");
    assert!(manager.registry().find(&session.id).expect("find").is_none());
    assert_eq!(failing.terminated().len(), 1);
}

#[rstest]
#[tokio::test]
async fn timeout_tears_down_by_default(harness: Harness) {
    let driver =
        FakeDriver::new(ProviderKind::VmInstance).with_fallback(Description::provisioning());
    let manager = harness.manager(&driver);

    let err = manager
        .create(&request(ProviderKind::VmInstance), pending())
        .await
        .expect_err("never ready");

    assert!(matches!(err, SessionError::ReadinessTimeout { .. }), "{err}");
    assert_eq!(driver.describe_calls(), 3);
    assert_eq!(driver.terminated(), driver.created());
    assert!(manager.list(&SessionFilter::default()).expect("list").is_empty());
    assert_eq!(harness.key_files(), 0);
}

#[rstest]
#[tokio::test]
async fn keep_on_failure_records_the_failure(harness: Harness) {
    let driver = FakeDriver::new(ProviderKind::VmInstance)
        .with_fallback(Description::failed("image pull failed"));
    let manager = harness.manager(&driver);

    let err = manager
        .create(
            &request(ProviderKind::VmInstance).keep_on_failure(true),
            pending(),
        )
        .await
        .expect_err("terminal failure");

    assert!(matches!(err, SessionError::TerminalFailure { .. }), "{err}");
    let message = err.to_string();
    assert!(message.contains("image pull failed"), "{message}");
    assert!(message.contains("hatch stop"), "{message}");
    assert!(driver.terminated().is_empty());

    let sessions = manager.list(&SessionFilter::default()).expect("list");
    let kept = sessions.first().expect("failed session kept");
    assert_eq!(kept.status(), SessionStatus::Failed);
    assert!(kept.handle.is_some());
}

#[rstest]
#[tokio::test]
async fn cancellation_always_tears_down(harness: Harness) {
    let driver =
        FakeDriver::new(ProviderKind::VmInstance).with_fallback(Description::provisioning());
    let manager = harness.manager(&driver).with_cleanup_on_failure(false);

    let err = manager
        .create(&request(ProviderKind::VmInstance), async {})
        .await
        .expect_err("cancelled");

    assert!(err.is_cancelled());
    assert_eq!(driver.describe_calls(), 0);
    assert_eq!(driver.terminated().len(), 1);
    assert!(manager.list(&SessionFilter::default()).expect("list").is_empty());
}

#[rstest]
#[tokio::test]
async fn interrupt_during_submission_discards_the_new_resource(harness: Harness) {
    let driver =
        FakeDriver::new(ProviderKind::VmInstance).with_create_delay(Duration::from_millis(20));
    let manager = harness.manager(&driver);

    let err = manager
        .create(&request(ProviderKind::VmInstance), async {})
        .await
        .expect_err("cancelled");

    assert!(err.is_cancelled());
    let message = err.to_string();
    assert!(message.contains("interrupted while creating"), "{message}");
    assert_eq!(driver.created().len(), 1);
    assert_eq!(driver.terminated(), driver.created());
    assert!(driver.active().is_empty());
    assert_eq!(driver.describe_calls(), 0);
    assert_eq!(harness.key_files(), 0);
    assert!(manager.list(&SessionFilter::default()).expect("list").is_empty());
}

/// Delegates to a [`FakeDriver`] but overwrites the registry file on every
/// describe, so recording the ready state fails.
struct CorruptingDriver {
    inner: FakeDriver,
    registry: Utf8PathBuf,
}

impl Driver for CorruptingDriver {
    fn kind(&self) -> ProviderKind {
        self.inner.kind()
    }

    fn requires_key(&self) -> bool {
        self.inner.requires_key()
    }

    fn login_user(&self) -> Option<&str> {
        self.inner.login_user()
    }

    fn create<'a>(
        &'a self,
        spec: &'a SessionSpec,
        public_key: Option<&'a str>,
    ) -> DriverFuture<'a, BackendHandle> {
        self.inner.create(spec, public_key)
    }

    fn describe<'a>(&'a self, handle: &'a BackendHandle) -> DriverFuture<'a, Description> {
        std::fs::write(&self.registry, "not json").expect("overwrite registry");
        self.inner.describe(handle)
    }

    fn resolve_endpoint<'a>(
        &'a self,
        handle: &'a BackendHandle,
        network_id: &'a str,
    ) -> DriverFuture<'a, Option<Endpoint>> {
        self.inner.resolve_endpoint(handle, network_id)
    }

    fn terminate<'a>(&'a self, handle: &'a BackendHandle) -> DriverFuture<'a, ()> {
        self.inner.terminate(handle)
    }

    fn list_active(&self) -> DriverFuture<'_, Vec<BackendHandle>> {
        self.inner.list_active()
    }

    fn accepts_connections<'a>(&'a self, endpoint: &'a Endpoint) -> DriverFuture<'a, bool> {
        self.inner.accepts_connections(endpoint)
    }
}

#[rstest]
#[tokio::test]
async fn unrecordable_ready_state_names_the_live_resource(harness: Harness) {
    let driver = FakeDriver::new(ProviderKind::VmInstance);
    let registry = SessionRegistry::new(harness.root.clone());
    let corrupting = CorruptingDriver {
        inner: driver.clone(),
        registry: registry.path(),
    };
    let manager = SessionManager::new(
        ProviderFactory::empty().with_driver(Arc::new(corrupting)),
        registry,
        KeyProvisioner::new(harness.root.join("keys")),
        Bridge::new(harness.launcher.clone(), "ssh", "gh"),
    )
    .with_poll_policy(PollPolicy::new(3, Duration::ZERO));

    let err = manager
        .create(&request(ProviderKind::VmInstance), pending())
        .await
        .expect_err("ready state cannot be recorded");

    let SessionError::ReadyUnrecorded { id, handle, source } = &err else {
        panic!("expected ReadyUnrecorded, got {err:?}");
    };
    assert!(matches!(source, RegistryError::Parse { .. }), "{source:?}");
    assert_eq!(driver.active(), vec![handle.clone()]);
    let message = err.to_string();
    assert!(message.contains("fake-1"), "{message}");
    assert!(message.contains(&format!("hatch stop {id}")), "{message}");
}

#[rstest]
#[tokio::test]
async fn failed_cleanup_names_the_resource(harness: Harness) {
    let driver = FakeDriver::new(ProviderKind::VmInstance)
        .with_fallback(Description::provisioning())
        .with_terminate_error(DriverError::api(
            ProviderKind::VmInstance,
            "terminate",
            "connection reset",
        ));
    let manager = harness.manager(&driver);

    let err = manager
        .create(&request(ProviderKind::VmInstance), pending())
        .await
        .expect_err("never ready");

    let message = err.to_string();
    assert!(message.contains("fake-1"), "{message}");
    assert!(message.contains("teardown also failed"), "{message}");
    let sessions = manager.list(&SessionFilter::default()).expect("list");
    let left = sessions.first().expect("record kept for retry");
    assert_eq!(left.status(), SessionStatus::Terminating);
}

#[rstest]
#[tokio::test]
async fn provision_failure_revokes_the_key(harness: Harness) {
    let driver = FakeDriver::new(ProviderKind::VmInstance).with_create_error(
        DriverError::provision(ProviderKind::VmInstance, "quota exceeded"),
    );
    let manager = harness.manager(&driver);

    let err = manager
        .create(&request(ProviderKind::VmInstance), pending())
        .await
        .expect_err("create fails");

    assert!(matches!(err, SessionError::Provision { .. }), "{err}");
    assert!(err.to_string().contains("quota exceeded"));
    assert_eq!(harness.key_files(), 0);
    assert!(manager.list(&SessionFilter::default()).expect("list").is_empty());
}

#[rstest]
#[tokio::test]
async fn unavailable_provider_fails_before_any_side_effect(harness: Harness) {
    let driver = FakeDriver::new(ProviderKind::VmInstance);
    let manager = harness.manager(&driver);

    let err = manager
        .create(&request(ProviderKind::ContainerTask), pending())
        .await
        .expect_err("no cluster driver");

    assert!(matches!(err, SessionError::Factory(_)), "{err}");
    assert!(err.to_string().contains("try --provider vm-instance"));
    assert!(driver.created().is_empty());
    assert_eq!(harness.key_files(), 0);
}

#[rstest]
#[tokio::test]
async fn connect_and_exec_use_the_bridge(harness: Harness) {
    let driver = FakeDriver::new(ProviderKind::VmInstance);
    let manager = harness.manager(&driver);
    let session = manager
        .create(&request(ProviderKind::VmInstance), pending())
        .await
        .expect("create");
    harness.launcher.push_exit_code(0);
    harness.launcher.push_exit_code(7);

    assert_eq!(manager.connect(&session.id).expect("connect"), 0);
    let code = manager
        .exec(&session.id, &[String::from("false")])
        .expect("exec");
    assert_eq!(code, 7);
    assert_eq!(harness.launcher.invocations().len(), 2);

    let err = manager.exec(&session.id, &[]).expect_err("empty command");
    assert!(matches!(err, SessionError::EmptyCommand { .. }));
}

#[rstest]
#[tokio::test]
async fn stop_resolves_prefixes(harness: Harness) {
    let driver = FakeDriver::new(ProviderKind::VmInstance);
    let manager = harness.manager(&driver);
    let session = manager
        .create(&request(ProviderKind::VmInstance), pending())
        .await
        .expect("create");
    let prefix: String = session.id.chars().take(4).collect();

    manager.stop(&prefix).await.expect("stop by prefix");
    let err = manager.stop(&prefix).await.expect_err("already gone");
    assert!(matches!(
        err,
        SessionError::Registry(RegistryError::NotFound { .. })
    ));
}
