//! Server creation helpers for the Scaleway driver.
//!
//! Scaleway only hands cloud-init user data to a server on its first boot, so
//! the server is created with `stopped: true`, the user data is uploaded, and
//! only then is the server powered on.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::driver::{DriverError, with_timeout};
use crate::scaleway::user_data::{CLOUD_INIT_USER_DATA_KEY, user_data_url};
use crate::scaleway::{KIND, MANAGED_TAG, ScalewayDriver};

use super::{SCALEWAY_INSTANCE_API_BASE, ServerRef};

#[derive(Serialize)]
struct CreateServerRequest<'a> {
    name: &'a str,
    commercial_type: &'a str,
    image: &'a str,
    project: &'a str,
    routed_ip_enabled: bool,
    dynamic_ip_required: bool,
    tags: [&'a str; 2],
    stopped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    organization: Option<&'a str>,
}

#[derive(Deserialize)]
struct CreateServerResponse {
    server: CreatedServer,
}

/// Subset of the create response the driver needs.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(in crate::scaleway) struct CreatedServer {
    pub(in crate::scaleway) id: String,
    pub(in crate::scaleway) state: String,
    #[serde(default)]
    pub(in crate::scaleway) allowed_actions: Vec<String>,
}

impl ScalewayDriver {
    pub(in crate::scaleway) async fn create_server_stopped(
        &self,
        zone: &str,
        name: &str,
        instance_type: &str,
        image_id: &str,
    ) -> Result<CreatedServer, DriverError> {
        let url = format!("{SCALEWAY_INSTANCE_API_BASE}/zones/{zone}/servers");
        let payload = CreateServerRequest {
            name,
            commercial_type: instance_type,
            image: image_id,
            project: &self.project_id,
            routed_ip_enabled: true,
            dynamic_ip_required: true,
            tags: [MANAGED_TAG, "ephemeral"],
            stopped: true,
            organization: self.config.default_organization_id.as_deref(),
        };

        let response = self
            .http
            .post(&url)
            .header("X-Auth-Token", &self.secret_key)
            .json(&payload)
            .send()
            .await
            .map_err(|err| DriverError::provision(KIND, err))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| DriverError::provision(KIND, err))?;

        if status.is_success() {
            let parsed: CreateServerResponse =
                serde_json::from_slice(&body).map_err(|err| DriverError::provision(KIND, err))?;
            return Ok(parsed.server);
        }

        if let Ok(api_err) = serde_json::from_slice::<scaleway_rs::ScalewayApiError>(&body)
            && is_instance_type_error(&api_err, instance_type)
        {
            return Err(DriverError::provision(
                KIND,
                format!("instance type '{instance_type}' is not available in zone {zone}"),
            ));
        }
        Err(DriverError::provision(
            KIND,
            format!("HTTP {status}: {}", String::from_utf8_lossy(&body)),
        ))
    }

    pub(in crate::scaleway) async fn put_cloud_init(
        &self,
        server: ServerRef<'_>,
        cloud_config: &str,
    ) -> Result<(), DriverError> {
        let url = user_data_url(server.zone, server.id, CLOUD_INIT_USER_DATA_KEY);
        let response = self
            .http
            .patch(&url)
            .header("X-Auth-Token", &self.secret_key)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(cloud_config.to_owned())
            .send()
            .await
            .map_err(|err| DriverError::provision(KIND, err))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(DriverError::provision(
            KIND,
            format!("failed to set cloud-init user data (HTTP {status}): {body}"),
        ))
    }

    pub(in crate::scaleway) async fn power_on(
        &self,
        server: ServerRef<'_>,
        created: &CreatedServer,
    ) -> Result<(), DriverError> {
        if created.state == "running" {
            return Ok(());
        }
        if !created.allowed_actions.iter().any(|action| action == "poweron") {
            return Err(DriverError::provision(
                KIND,
                format!("server {} in state {} cannot be powered on", created.id, created.state),
            ));
        }
        with_timeout(KIND, "poweron", self.request_timeout, async {
            self.api
                .perform_instance_action_async(server.zone, server.id, "poweron")
                .await
                .map(|_| ())
                .map_err(|err| DriverError::provision(KIND, err))
        })
        .await
    }

    /// Deletes a server that never booted, folding any failure into `err`.
    pub(in crate::scaleway) async fn discard_stopped(
        &self,
        server: ServerRef<'_>,
        err: DriverError,
    ) -> DriverError {
        let cleanup = with_timeout(KIND, "delete", self.request_timeout, async {
            self.api
                .delete_instance_async(server.zone, server.id)
                .await
                .map(|_| ())
                .map_err(|cleanup_err| DriverError::api(KIND, "delete", cleanup_err))
        })
        .await;
        match cleanup {
            Ok(()) => err,
            Err(cleanup_err) => {
                warn!(server = server.id, error = %cleanup_err, "failed to delete unbooted server");
                DriverError::provision(
                    KIND,
                    format!(
                        "{err} (cleanup also failed, server {}/{} may remain: {cleanup_err})",
                        server.zone, server.id
                    ),
                )
            }
        }
    }
}

fn is_instance_type_error(api_err: &scaleway_rs::ScalewayApiError, instance_type: &str) -> bool {
    matches!(api_err.resource.as_deref(), Some("commercial_type"))
        || api_err
            .resource_id
            .as_deref()
            .is_some_and(|id| id == instance_type)
        || (api_err.etype == "invalid_arguments"
            && api_err
                .message
                .to_ascii_lowercase()
                .contains("commercial_type"))
}
