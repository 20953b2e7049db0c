//! Provider routing.
//!
//! The factory builds one driver per provider kind at start-up. A driver
//! whose prerequisites are unmet is recorded as unavailable with the reason,
//! and the remaining drivers stay usable.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::cluster::ClusterDriver;
use crate::codespaces::CodespacesDriver;
use crate::config::ProvidersConfig;
use crate::driver::{Driver, DriverError};
use crate::scaleway::ScalewayDriver;
use crate::session::ProviderKind;

/// Errors raised when routing to a provider.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum FactoryError {
    /// The provider cannot be used on this machine.
    #[error("{provider} provider is unavailable: {prerequisite}{}", suggestion(*.alternative))]
    ProviderUnavailable {
        /// Requested provider.
        provider: ProviderKind,
        /// The prerequisite that is not met.
        prerequisite: String,
        /// A provider that is available instead, if any.
        alternative: Option<ProviderKind>,
    },
}

fn suggestion(alternative: Option<ProviderKind>) -> String {
    alternative.map_or_else(String::new, |kind| format!(" (try --provider {kind})"))
}

#[derive(Clone)]
enum Slot {
    Ready(Arc<dyn Driver>),
    Unavailable(String),
}

/// Maps provider kinds to drivers.
#[derive(Clone, Default)]
pub struct ProviderFactory {
    slots: BTreeMap<ProviderKind, Slot>,
}

impl ProviderFactory {
    /// Creates a factory with no providers.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds every driver from `config`, recording prerequisite failures.
    #[must_use]
    pub fn initialize(config: &ProvidersConfig) -> Self {
        let timeout = config.request_timeout;
        let mut factory = Self::empty();
        factory.record(
            ProviderKind::VmInstance,
            ScalewayDriver::new(config.scaleway.clone(), timeout)
                .map(|driver| Arc::new(driver) as Arc<dyn Driver>),
        );
        factory.record(
            ProviderKind::ContainerTask,
            ClusterDriver::new(config.cluster.clone(), timeout)
                .map(|driver| Arc::new(driver) as Arc<dyn Driver>),
        );
        let codespaces = CodespacesDriver::new(config.codespaces.clone(), timeout).and_then(|driver| {
            which::which(driver.gh_bin()).map_err(|_| DriverError::Config {
                provider: ProviderKind::HostedContainer,
                message: format!(
                    "GitHub CLI '{}' not found on PATH; install it from https://cli.github.com or set HATCH_CODESPACES_GH_BIN",
                    driver.gh_bin()
                ),
            })?;
            Ok(Arc::new(driver) as Arc<dyn Driver>)
        });
        factory.record(ProviderKind::HostedContainer, codespaces);
        factory
    }

    fn record(&mut self, kind: ProviderKind, outcome: Result<Arc<dyn Driver>, DriverError>) {
        let slot = match outcome {
            Ok(driver) => {
                debug!(provider = %kind, "driver ready");
                Slot::Ready(driver)
            }
            Err(err) => {
                let prerequisite = match err {
                    DriverError::Config { message, .. } => message,
                    other => other.to_string(),
                };
                debug!(provider = %kind, %prerequisite, "driver unavailable");
                Slot::Unavailable(prerequisite)
            }
        };
        self.slots.insert(kind, slot);
    }

    /// Registers `driver` under its own kind, replacing any previous entry.
    #[must_use]
    pub fn with_driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.slots.insert(driver.kind(), Slot::Ready(driver));
        self
    }

    /// Marks `kind` unavailable because `prerequisite` is not met.
    #[must_use]
    pub fn with_unavailable(mut self, kind: ProviderKind, prerequisite: impl Into<String>) -> Self {
        self.slots.insert(kind, Slot::Unavailable(prerequisite.into()));
        self
    }

    /// Returns the driver for `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`FactoryError::ProviderUnavailable`] naming the unmet
    /// prerequisite and suggesting an available provider.
    pub fn get(&self, kind: ProviderKind) -> Result<Arc<dyn Driver>, FactoryError> {
        match self.slots.get(&kind) {
            Some(Slot::Ready(driver)) => Ok(Arc::clone(driver)),
            Some(Slot::Unavailable(prerequisite)) => Err(self.unavailable_error(kind, prerequisite)),
            None => Err(self.unavailable_error(kind, "provider is not configured")),
        }
    }

    fn unavailable_error(&self, kind: ProviderKind, prerequisite: &str) -> FactoryError {
        let alternative = ProviderKind::ALL
            .into_iter()
            .filter(|candidate| *candidate != kind)
            .find(|candidate| matches!(self.slots.get(candidate), Some(Slot::Ready(_))));
        FactoryError::ProviderUnavailable {
            provider: kind,
            prerequisite: prerequisite.to_owned(),
            alternative,
        }
    }

    /// Usable drivers, in provider order.
    #[must_use]
    pub fn available(&self) -> Vec<Arc<dyn Driver>> {
        self.slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Ready(driver) => Some(Arc::clone(driver)),
                Slot::Unavailable(_) => None,
            })
            .collect()
    }

    /// Providers that could not be initialised, with the reason.
    #[must_use]
    pub fn unavailable(&self) -> Vec<(ProviderKind, String)> {
        self.slots
            .iter()
            .filter_map(|(kind, slot)| match slot {
                Slot::Unavailable(reason) => Some((*kind, reason.clone())),
                Slot::Ready(_) => None,
            })
            .collect()
    }

    /// Releases every driver. Remote sessions are left untouched.
    pub fn shutdown(&mut self) {
        let released = self.available().len();
        self.slots.clear();
        if released > 0 {
            debug!(released, "released drivers");
        } else {
            warn!("shutdown called with no drivers");
        }
    }
}
