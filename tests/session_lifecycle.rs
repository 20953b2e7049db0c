//! End-to-end lifecycle tests against the public API with fake drivers.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use hatch::test_support::{FAKE_HOST, FakeDriver, ScriptedLauncher};
use hatch::{
    Bridge, CreateRequest, Description, Driver, Endpoint, FactoryError, KeyProvisioner, NetworkRef,
    PollPolicy, ProviderFactory, ProviderKind, SessionError, SessionFilter, SessionManager,
    SessionRegistry, SessionSpec, SessionStatus,
};
use rstest::{fixture, rstest};
use tempfile::TempDir;

struct State {
    _tmp: TempDir,
    root: Utf8PathBuf,
}

impl State {
    fn manager(&self, factory: ProviderFactory) -> SessionManager<ScriptedLauncher> {
        SessionManager::new(
            factory,
            SessionRegistry::new(self.root.clone()),
            KeyProvisioner::new(self.root.join("keys")),
            Bridge::new(ScriptedLauncher::new(), "ssh", "gh"),
        )
        .with_poll_policy(PollPolicy::new(5, Duration::ZERO))
    }

    fn key_dir_entries(&self) -> usize {
        std::fs::read_dir(self.root.join("keys"))
            .map(Iterator::count)
            .unwrap_or(0)
    }
}

#[fixture]
fn state() -> State {
    let tmp = TempDir::new().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .unwrap_or_else(|path| panic!("temp path should be utf8: {}", path.display()));
    State { _tmp: tmp, root }
}

fn request(provider: ProviderKind, name: &str) -> CreateRequest {
    CreateRequest::new(provider, SessionSpec::builder(name).build().expect("spec"))
}

#[rstest]
#[tokio::test]
async fn ready_on_third_attempt(state: State) {
    let driver = FakeDriver::new(ProviderKind::VmInstance)
        .with_descriptions([Description::provisioning(), Description::provisioning()]);
    let manager = state.manager(ProviderFactory::empty().with_driver(Arc::new(driver.clone())));

    let session = manager
        .create(&request(ProviderKind::VmInstance, "scenario-a"), pending())
        .await
        .expect("create");

    assert_eq!(session.status(), SessionStatus::Ready);
    assert_eq!(session.endpoint(), Some(&Endpoint::new(FAKE_HOST, 22)));
    assert_eq!(driver.describe_calls(), 3);
}

#[rstest]
#[tokio::test]
async fn lookup_endpoints_are_resolved(state: State) {
    let driver = FakeDriver::new(ProviderKind::ContainerTask)
        .with_fallback(Description::running(Some(NetworkRef::Lookup(String::from(
            "node-a",
        )))))
        .with_lookup("node-a", Endpoint::new("192.0.2.10", 31022));
    let manager = state.manager(ProviderFactory::empty().with_driver(Arc::new(driver)));

    let session = manager
        .create(&request(ProviderKind::ContainerTask, "pod-box"), pending())
        .await
        .expect("create");

    assert_eq!(session.endpoint(), Some(&Endpoint::new("192.0.2.10", 31022)));
}

#[rstest]
#[tokio::test]
async fn create_then_stop_leaves_nothing_behind(state: State) {
    let driver = FakeDriver::new(ProviderKind::VmInstance);
    let manager = state.manager(ProviderFactory::empty().with_driver(Arc::new(driver.clone())));

    let session = manager
        .create(&request(ProviderKind::VmInstance, "scenario-b"), pending())
        .await
        .expect("create");
    let key = session.key.clone().expect("vm sessions carry a key");
    assert!(key.private_key.exists());

    manager.stop(&session.id).await.expect("stop");

    assert!(manager.registry().find(&session.id).expect("find").is_none());
    assert!(!key.private_key.exists());
    assert!(!key.public_key.exists());
    assert_eq!(state.key_dir_entries(), 0);
    assert!(driver.active().is_empty());
}

#[tokio::test]
async fn terminating_twice_is_harmless() {
    let driver = FakeDriver::new(ProviderKind::ContainerTask);
    let spec = SessionSpec::builder("twice").build().expect("spec");
    let handle = driver.create(&spec, Some("ssh-ed25519 AAAA")).await.expect("create");

    driver.terminate(&handle).await.expect("first terminate");
    driver.terminate(&handle).await.expect("second terminate");

    assert!(driver.active().is_empty());
    assert_eq!(driver.terminated(), vec![handle.clone(), handle]);
}

#[rstest]
#[tokio::test]
async fn unavailable_provider_names_prerequisite(state: State) {
    let factory = ProviderFactory::empty()
        .with_driver(Arc::new(FakeDriver::new(ProviderKind::VmInstance)))
        .with_unavailable(
            ProviderKind::ContainerTask,
            "missing cluster token: set HATCH_CLUSTER_TOKEN",
        );
    let manager = state.manager(factory);

    let err = manager
        .create(&request(ProviderKind::ContainerTask, "scenario-c"), pending())
        .await
        .expect_err("cluster unavailable");
    let SessionError::Factory(FactoryError::ProviderUnavailable {
        prerequisite,
        alternative,
        ..
    }) = err
    else {
        panic!("unexpected error: {err}");
    };
    assert!(prerequisite.contains("HATCH_CLUSTER_TOKEN"));
    assert_eq!(alternative, Some(ProviderKind::VmInstance));

    let other = manager
        .create(&request(ProviderKind::VmInstance, "still-works"), pending())
        .await
        .expect("vm driver unaffected");
    assert_eq!(other.status(), SessionStatus::Ready);
}

#[rstest]
#[tokio::test]
async fn sessions_get_distinct_keys(state: State) {
    let driver = FakeDriver::new(ProviderKind::VmInstance);
    let manager = state.manager(ProviderFactory::empty().with_driver(Arc::new(driver.clone())));

    let first = manager
        .create(&request(ProviderKind::VmInstance, "one"), pending())
        .await
        .expect("first");
    let second = manager
        .create(&request(ProviderKind::VmInstance, "two"), pending())
        .await
        .expect("second");

    assert_ne!(first.key, second.key);
    let sent = driver.received_keys();
    assert_eq!(sent.len(), 2);
    assert_ne!(sent.first(), sent.get(1));

    let listed = manager.list(&SessionFilter::default()).expect("list");
    assert_eq!(listed.len(), 2);
}

#[rstest]
#[tokio::test]
async fn reconcile_drops_sessions_deleted_out_of_band(state: State) {
    let driver = FakeDriver::new(ProviderKind::VmInstance);
    let manager = state.manager(ProviderFactory::empty().with_driver(Arc::new(driver.clone())));
    let session = manager
        .create(&request(ProviderKind::VmInstance, "vanishing"), pending())
        .await
        .expect("create");
    let handle = session.handle.clone().expect("handle");

    driver.forget(&handle);
    let report = manager.reconcile(false).await.expect("reconcile");

    assert_eq!(report.stale.len(), 1);
    assert!(manager.registry().find(&session.id).expect("find").is_none());
    assert_eq!(state.key_dir_entries(), 0);
}
