//! Registry and backend reconciliation.
//!
//! Records can outlive their remote resources (deleted out of band, expired
//! by the provider) and resources can outlive their records (a crash between
//! create and append). The reconciler compares both sides per provider,
//! drops stale records, and reports or terminates untracked resources.

use std::collections::HashSet;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::driver::Driver;
use crate::factory::ProviderFactory;
use crate::keys::KeyProvisioner;
use crate::registry::{RegistryError, SessionFilter, SessionRegistry};
use crate::session::{BackendHandle, ProviderKind, Session, SessionStatus};

/// A provider-level problem that did not stop the other providers.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReconcileFailure {
    /// Provider being reconciled.
    pub provider: ProviderKind,
    /// What went wrong.
    pub message: String,
}

/// Outcome of a reconciliation pass.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ReconcileReport {
    /// Records removed because their resource no longer exists.
    pub stale: Vec<Session>,
    /// Resources with no record that were left alone.
    pub untracked: Vec<BackendHandle>,
    /// Untracked resources that were terminated on request.
    pub terminated: Vec<BackendHandle>,
    /// Records outside what their provider lists, left untouched.
    pub unlisted: Vec<Session>,
    /// Providers that could not be fully reconciled.
    pub failures: Vec<ReconcileFailure>,
}

impl ReconcileReport {
    /// Reports whether the pass found nothing to do and hit no errors.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.stale.is_empty()
            && self.untracked.is_empty()
            && self.terminated.is_empty()
            && self.unlisted.is_empty()
            && self.failures.is_empty()
    }

    fn fail(&mut self, provider: ProviderKind, message: impl Into<String>) {
        let text = message.into();
        warn!(%provider, message = %text, "reconciliation problem");
        self.failures.push(ReconcileFailure {
            provider,
            message: text,
        });
    }
}

/// Errors that abort reconciliation entirely.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The registry could not be read.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Compares registry records with what each backend reports.
pub struct Reconciler<'a> {
    factory: &'a ProviderFactory,
    registry: &'a SessionRegistry,
    keys: &'a KeyProvisioner,
}

impl<'a> Reconciler<'a> {
    /// Creates a reconciler over the given collaborators.
    #[must_use]
    pub const fn new(
        factory: &'a ProviderFactory,
        registry: &'a SessionRegistry,
        keys: &'a KeyProvisioner,
    ) -> Self {
        Self {
            factory,
            registry,
            keys,
        }
    }

    /// Runs one pass over every provider.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError`] only when the registry cannot be read;
    /// per-provider problems are collected in the report.
    pub async fn run(&self, terminate_untracked: bool) -> Result<ReconcileReport, ReconcileError> {
        let mut report = ReconcileReport::default();

        for (provider, reason) in self.factory.unavailable() {
            let tracked = self.registry.list(&SessionFilter {
                provider: Some(provider),
                status: None,
            })?;
            if !tracked.is_empty() {
                report.fail(
                    provider,
                    format!("skipped {} session(s): {reason}", tracked.len()),
                );
            }
        }

        for driver in self.factory.available() {
            self.reconcile_provider(driver.as_ref(), terminate_untracked, &mut report)
                .await?;
        }

        info!(
            stale = report.stale.len(),
            untracked = report.untracked.len(),
            terminated = report.terminated.len(),
            failures = report.failures.len(),
            "reconciliation finished"
        );
        Ok(report)
    }

    async fn reconcile_provider(
        &self,
        driver: &dyn Driver,
        terminate_untracked: bool,
        report: &mut ReconcileReport,
    ) -> Result<(), ReconcileError> {
        let provider = driver.kind();
        let active = match driver.list_active().await {
            Ok(handles) => handles,
            Err(err) => {
                report.fail(provider, err.to_string());
                return Ok(());
            }
        };
        let records = self.registry.list(&SessionFilter {
            provider: Some(provider),
            status: None,
        })?;

        let active_set: HashSet<&BackendHandle> = active.iter().collect();
        for record in &records {
            if record.status() == SessionStatus::Pending {
                continue;
            }
            match record.handle.as_ref() {
                Some(handle) if active_set.contains(handle) => {}
                Some(handle) if !driver.covers(handle) => {
                    debug!(session = %record.id, %handle, "record outside listed scope");
                    report.unlisted.push(record.clone());
                }
                _ => self.drop_stale(record, report),
            }
        }

        let tracked: HashSet<&BackendHandle> = records
            .iter()
            .filter_map(|record| record.handle.as_ref())
            .collect();
        for handle in active.iter().filter(|handle| !tracked.contains(handle)) {
            if !terminate_untracked {
                report.untracked.push(handle.clone());
                continue;
            }
            match driver.terminate(handle).await {
                Ok(()) => {
                    info!(%handle, "terminated untracked resource");
                    report.terminated.push(handle.clone());
                }
                Err(err) => {
                    report.untracked.push(handle.clone());
                    report.fail(provider, format!("failed to terminate {handle}: {err}"));
                }
            }
        }
        Ok(())
    }

    fn drop_stale(&self, record: &Session, report: &mut ReconcileReport) {
        if let Err(err) = self.registry.remove(&record.id) {
            report.fail(
                record.provider,
                format!("failed to drop stale session {}: {err}", record.id),
            );
            return;
        }
        if let Some(key) = &record.key
            && let Err(err) = self.keys.revoke(key)
        {
            report.fail(
                record.provider,
                format!("stale session {} key files remain: {err}", record.id),
            );
        }
        info!(session = %record.id, provider = %record.provider, "dropped stale session");
        report.stale.push(record.clone());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use camino::Utf8PathBuf;
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    use super::*;
    use crate::driver::DriverError;
    use crate::session::SessionState;
    use crate::test_support::FakeDriver;

    struct Harness {
        _tmp: TempDir,
        registry: SessionRegistry,
        keys: KeyProvisioner,
    }

    #[fixture]
    fn harness() -> Harness {
        let tmp = TempDir::new().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
            .unwrap_or_else(|path| panic!("temp path should be utf8: {}", path.display()));
        Harness {
            registry: SessionRegistry::new(root.clone()),
            keys: KeyProvisioner::new(root.join("keys")),
            _tmp: tmp,
        }
    }

    fn vm(id: &str) -> BackendHandle {
        BackendHandle::VmInstance {
            zone: String::from("fr-par-1"),
            server_id: id.to_owned(),
        }
    }

    fn record(harness: &Harness, handle: BackendHandle) -> Session {
        let mut session = Session::pending("demo", handle.provider());
        session.key = Some(harness.keys.issue(&session.id).expect("key").key_ref);
        session.begin_provisioning(handle).expect("provisioning");
        harness.registry.append(&session).expect("append");
        session
    }

    #[rstest]
    #[tokio::test]
    async fn removes_stale_records_and_their_keys(harness: Harness) {
        let driver = FakeDriver::new(ProviderKind::VmInstance).with_active([vm("live")]);
        let live = record(&harness, vm("live"));
        let gone = record(&harness, vm("gone"));
        let factory = ProviderFactory::empty().with_driver(Arc::new(driver));

        let report = Reconciler::new(&factory, &harness.registry, &harness.keys)
            .run(false)
            .await
            .expect("reconcile");

        assert_eq!(report.stale.len(), 1);
        assert_eq!(report.stale.first().map(|s| s.id.as_str()), Some(gone.id.as_str()));
        assert!(harness.registry.find(&gone.id).expect("find").is_none());
        assert!(harness.registry.find(&live.id).expect("find").is_some());
        let key = gone.key.expect("key");
        assert!(!key.private_key.exists());
        assert!(!key.public_key.exists());
    }

    #[rstest]
    #[tokio::test]
    async fn records_in_another_zone_are_kept(harness: Harness) {
        let driver = FakeDriver::new(ProviderKind::VmInstance)
            .listing_only("fr-par-1")
            .with_active([vm("live")]);
        let elsewhere = BackendHandle::VmInstance {
            zone: String::from("nl-ams-1"),
            server_id: String::from("srv-ams"),
        };
        let kept = record(&harness, elsewhere);
        let factory = ProviderFactory::empty().with_driver(Arc::new(driver));

        let report = Reconciler::new(&factory, &harness.registry, &harness.keys)
            .run(false)
            .await
            .expect("reconcile");

        assert!(report.stale.is_empty(), "{report:?}");
        assert_eq!(report.unlisted.len(), 1);
        assert!(harness.registry.find(&kept.id).expect("find").is_some());
        let key = kept.key.expect("key");
        assert!(key.private_key.exists());
        assert!(!report.is_clean());
    }

    #[rstest]
    #[tokio::test]
    async fn reports_untracked_without_terminating(harness: Harness) {
        let driver = FakeDriver::new(ProviderKind::VmInstance).with_active([vm("orphan")]);
        let factory = ProviderFactory::empty().with_driver(Arc::new(driver.clone()));

        let report = Reconciler::new(&factory, &harness.registry, &harness.keys)
            .run(false)
            .await
            .expect("reconcile");

        assert_eq!(report.untracked, vec![vm("orphan")]);
        assert!(report.terminated.is_empty());
        assert!(driver.terminated().is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn terminates_untracked_on_request(harness: Harness) {
        let driver = FakeDriver::new(ProviderKind::VmInstance).with_active([vm("orphan")]);
        let factory = ProviderFactory::empty().with_driver(Arc::new(driver.clone()));

        let report = Reconciler::new(&factory, &harness.registry, &harness.keys)
            .run(true)
            .await
            .expect("reconcile");

        assert_eq!(report.terminated, vec![vm("orphan")]);
        assert_eq!(driver.terminated(), vec![vm("orphan")]);
        assert!(driver.active().is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn provider_failures_do_not_stop_others(harness: Harness) {
        let broken = FakeDriver::new(ProviderKind::ContainerTask).with_list_error(DriverError::api(
            ProviderKind::ContainerTask,
            "list",
            "connection refused",
        ));
        let healthy = FakeDriver::new(ProviderKind::VmInstance).with_active([vm("orphan")]);
        let factory = ProviderFactory::empty()
            .with_driver(Arc::new(broken))
            .with_driver(Arc::new(healthy));

        let report = Reconciler::new(&factory, &harness.registry, &harness.keys)
            .run(false)
            .await
            .expect("reconcile");

        assert_eq!(report.failures.len(), 1);
        let failure = report.failures.first().expect("failure");
        assert_eq!(failure.provider, ProviderKind::ContainerTask);
        assert!(failure.message.contains("connection refused"));
        assert_eq!(report.untracked, vec![vm("orphan")]);
    }

    #[rstest]
    #[tokio::test]
    async fn unavailable_providers_with_records_are_reported(harness: Harness) {
        let session = record(&harness, vm("srv"));
        let factory =
            ProviderFactory::empty().with_unavailable(ProviderKind::VmInstance, "missing SCW_SECRET_KEY");

        let report = Reconciler::new(&factory, &harness.registry, &harness.keys)
            .run(false)
            .await
            .expect("reconcile");

        assert!(report.stale.is_empty());
        let failure = report.failures.first().expect("skipped provider");
        assert!(failure.message.contains("SCW_SECRET_KEY"));
        assert!(harness.registry.find(&session.id).expect("find").is_some());
    }

    #[rstest]
    #[tokio::test]
    async fn clean_pass_reports_nothing(harness: Harness) {
        let driver = FakeDriver::new(ProviderKind::VmInstance).with_active([vm("live")]);
        let session = record(&harness, vm("live"));
        harness
            .registry
            .update(
                &session.id,
                SessionState::Ready {
                    endpoint: crate::session::Endpoint::new("10.0.0.5", 22),
                },
            )
            .expect("ready");
        let factory = ProviderFactory::empty().with_driver(Arc::new(driver));

        let report = Reconciler::new(&factory, &harness.registry, &harness.keys)
            .run(true)
            .await
            .expect("reconcile");

        assert!(report.is_clean(), "{report:?}");
    }
}
