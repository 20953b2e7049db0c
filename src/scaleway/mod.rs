//! VM-instance driver backed by the Scaleway Instances API.
//!
//! Servers are created stopped so cloud-init user data carrying the session's
//! public key is in place before first boot, then powered on. Every server is
//! tagged so `list_active` can find leftovers.

mod lifecycle;
mod user_data;

use std::time::Duration;

use scaleway_rs::ScalewayApi;
use tracing::{debug, info};

use crate::config::ScalewayConfig;
use crate::driver::{
    Description, Driver, DriverError, DriverFuture, SessionSpec, http_client, resource_suffix,
};
use crate::session::{BackendHandle, Endpoint, ProviderKind};

use lifecycle::ServerRef;

const KIND: ProviderKind = ProviderKind::VmInstance;
const DEFAULT_SSH_PORT: u16 = 22;
const MANAGED_TAG: &str = "hatch";
const TEARDOWN_ATTEMPTS: u32 = 60;
const TEARDOWN_INTERVAL: Duration = Duration::from_secs(2);

/// Driver that provisions sessions as Scaleway servers.
#[derive(Clone)]
pub struct ScalewayDriver {
    api: ScalewayApi,
    http: reqwest::Client,
    config: ScalewayConfig,
    secret_key: String,
    project_id: String,
    request_timeout: Duration,
}

impl ScalewayDriver {
    /// Builds a driver from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Config`] naming the first missing setting.
    pub fn new(config: ScalewayConfig, request_timeout: Duration) -> Result<Self, DriverError> {
        config.validate().map_err(|err| DriverError::Config {
            provider: KIND,
            message: err.to_string(),
        })?;
        let secret_key = required(config.secret_key.as_deref());
        let project_id = required(config.default_project_id.as_deref());
        Ok(Self {
            api: ScalewayApi::new(&secret_key),
            http: http_client(KIND, request_timeout, None)?,
            config,
            secret_key,
            project_id,
            request_timeout,
        })
    }

    fn server_ref(handle: &BackendHandle) -> Result<ServerRef<'_>, DriverError> {
        match handle {
            BackendHandle::VmInstance { zone, server_id } => Ok(ServerRef {
                zone: zone.as_str(),
                id: server_id.as_str(),
            }),
            other => Err(DriverError::ForeignHandle {
                provider: KIND,
                handle: other.clone(),
            }),
        }
    }
}

fn required(value: Option<&str>) -> String {
    value.map(str::trim).unwrap_or_default().to_owned()
}

impl Driver for ScalewayDriver {
    fn kind(&self) -> ProviderKind {
        KIND
    }

    fn requires_key(&self) -> bool {
        true
    }

    fn login_user(&self) -> Option<&str> {
        Some(self.config.login_user.as_str())
    }

    fn create<'a>(
        &'a self,
        spec: &'a SessionSpec,
        public_key: Option<&'a str>,
    ) -> DriverFuture<'a, BackendHandle> {
        Box::pin(async move {
            spec.validate()?;
            let key = public_key.ok_or(DriverError::MissingKey { provider: KIND })?;
            let zone = self.config.default_zone.as_str();
            let image_label = spec.image.as_deref().unwrap_or(&self.config.default_image);
            let instance_type = spec
                .instance_type
                .as_deref()
                .unwrap_or(&self.config.default_instance_type);

            let image_id = self.resolve_image_id(zone, image_label).await?;
            let name = format!("hatch-{}-{}", spec.name, resource_suffix());
            let server = self
                .create_server_stopped(zone, &name, instance_type, &image_id)
                .await?;
            let server_ref = ServerRef {
                zone,
                id: &server.id,
            };

            let cloud_init = user_data::render_cloud_config(&self.config.login_user, key);
            let prepared = match self.put_cloud_init(server_ref, &cloud_init).await {
                Ok(()) => self.power_on(server_ref, &server).await,
                Err(err) => Err(err),
            };
            if let Err(err) = prepared {
                return Err(self.discard_stopped(server_ref, err).await);
            }

            info!(server = %server.id, zone, %name, "created server");
            Ok(BackendHandle::VmInstance {
                zone: zone.to_owned(),
                server_id: server.id,
            })
        })
    }

    fn describe<'a>(&'a self, handle: &'a BackendHandle) -> DriverFuture<'a, Description> {
        Box::pin(async move {
            let server = Self::server_ref(handle)?;
            let snapshot = self.fetch_server(server).await?;
            Ok(lifecycle::describe_snapshot(snapshot, DEFAULT_SSH_PORT))
        })
    }

    fn resolve_endpoint<'a>(
        &'a self,
        handle: &'a BackendHandle,
        network_id: &'a str,
    ) -> DriverFuture<'a, Option<Endpoint>> {
        Box::pin(async move {
            Self::server_ref(handle)?;
            Ok(lifecycle::parse_public_ip(network_id)
                .map(|ip| Endpoint::new(ip.to_string(), DEFAULT_SSH_PORT)))
        })
    }

    fn terminate<'a>(&'a self, handle: &'a BackendHandle) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            let server = Self::server_ref(handle)?;
            let Some(snapshot) = self.fetch_server(server).await? else {
                debug!(server = server.id, "server already gone");
                return Ok(());
            };
            self.terminate_snapshot(server, &snapshot).await?;
            let gone = lifecycle::poll_until_gone(
                || self.fetch_server(server),
                TEARDOWN_ATTEMPTS,
                TEARDOWN_INTERVAL,
            )
            .await?;
            if !gone {
                return Err(DriverError::api(
                    KIND,
                    "terminate",
                    format!(
                        "server {}/{} still exists after {TEARDOWN_ATTEMPTS} checks",
                        server.zone, server.id
                    ),
                ));
            }
            info!(server = server.id, zone = server.zone, "terminated server");
            Ok(())
        })
    }

    fn covers(&self, handle: &BackendHandle) -> bool {
        matches!(handle, BackendHandle::VmInstance { zone, .. } if *zone == self.config.default_zone)
    }

    fn list_active(&self) -> DriverFuture<'_, Vec<BackendHandle>> {
        Box::pin(async move {
            let zone = self.config.default_zone.as_str();
            let servers = self.list_tagged(zone).await?;
            Ok(servers
                .into_iter()
                .map(|server_id| BackendHandle::VmInstance {
                    zone: zone.to_owned(),
                    server_id,
                })
                .collect())
        })
    }
}
