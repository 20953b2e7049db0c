//! Core library for the Hatch session tool.
//!
//! Hatch provisions short-lived remote environments on one of several
//! backends (Scaleway VMs, Kubernetes pods, GitHub Codespaces), waits until
//! they accept SSH, hands the terminal over, and tears them down again. Each
//! session is tracked in a local registry together with the key generated
//! for it, so nothing is leaked when a step fails part way.

pub mod bridge;
pub mod cluster;
pub mod codespaces;
pub mod config;
pub mod driver;
pub mod factory;
pub mod keys;
pub mod logging;
pub mod manager;
pub mod readiness;
pub mod reconcile;
pub mod registry;
pub mod scaleway;
pub mod session;
pub mod test_support;

pub use bridge::{Bridge, BridgeError, ClientCommand, ClientLauncher, ProcessLauncher};
pub use config::{
    ClusterConfig, CodespacesConfig, ConfigError, HatchConfig, ProvidersConfig, ScalewayConfig,
};
pub use driver::{Description, Driver, DriverError, NetworkRef, RemoteState, SessionSpec};
pub use factory::{FactoryError, ProviderFactory};
pub use keys::{IssuedKey, KeyError, KeyProvisioner, KeyRef};
pub use manager::{CreateRequest, SessionError, SessionManager};
pub use readiness::{PollPolicy, ReadinessError, ReadinessPoller};
pub use reconcile::{ReconcileError, ReconcileReport, Reconciler};
pub use registry::{RegistryError, SessionFilter, SessionRegistry};
pub use session::{BackendHandle, Endpoint, ProviderKind, Session, SessionState, SessionStatus};
