//! Server queries and teardown for the Scaleway driver.

use serde::Deserialize;
use tracing::debug;

use crate::driver::{DriverError, with_timeout};
use crate::scaleway::{KIND, MANAGED_TAG, ScalewayDriver};

use super::{SCALEWAY_INSTANCE_API_BASE, ServerRef, ServerSnapshot, Teardown, teardown_step};

const LIST_PAGE_SIZE: usize = 100;

#[derive(Deserialize)]
struct ListServersResponse {
    #[serde(default)]
    servers: Vec<ListedServer>,
}

#[derive(Deserialize)]
struct ListedServer {
    id: String,
    #[serde(default)]
    tags: Vec<String>,
}

impl ScalewayDriver {
    pub(in crate::scaleway) async fn fetch_server(
        &self,
        server: ServerRef<'_>,
    ) -> Result<Option<ServerSnapshot>, DriverError> {
        let mut servers = with_timeout(KIND, "describe", self.request_timeout, async {
            self.api
                .list_instances(server.zone)
                .servers(server.id)
                .per_page(1)
                .run_async()
                .await
                .map_err(|err| DriverError::api(KIND, "describe", err))
        })
        .await?;

        Ok(servers.pop().map(|found| ServerSnapshot {
            id: found.id,
            state: found.state,
            allowed_actions: found.allowed_actions,
            public_ip: found.public_ip.map(|ip| ip.address),
        }))
    }

    /// Ends a server's life. Running servers are terminated, which also
    /// removes their volumes; servers that never booted are deleted. A
    /// server already being terminated needs no further request.
    pub(in crate::scaleway) async fn terminate_snapshot(
        &self,
        server: ServerRef<'_>,
        snapshot: &ServerSnapshot,
    ) -> Result<(), DriverError> {
        match teardown_step(snapshot) {
            Teardown::Terminate => {
                with_timeout(KIND, "terminate", self.request_timeout, async {
                    self.api
                        .perform_instance_action_async(server.zone, server.id, "terminate")
                        .await
                        .map(|_| ())
                        .map_err(|err| DriverError::api(KIND, "terminate", err))
                })
                .await
            }
            Teardown::Delete => {
                with_timeout(KIND, "delete", self.request_timeout, async {
                    self.api
                        .delete_instance_async(server.zone, server.id)
                        .await
                        .map(|_| ())
                        .map_err(|err| DriverError::api(KIND, "delete", err))
                })
                .await
            }
            Teardown::InProgress => {
                debug!(server = server.id, state = %snapshot.state, "terminate already under way");
                Ok(())
            }
            Teardown::Unsettled => Err(DriverError::api(
                KIND,
                "terminate",
                format!(
                    "server {} is {}; retry once it settles",
                    snapshot.id, snapshot.state
                ),
            )),
        }
    }

    /// Lists ids of servers in `zone` carrying the managed tag, following
    /// pages until a short one comes back.
    pub(in crate::scaleway) async fn list_tagged(
        &self,
        zone: &str,
    ) -> Result<Vec<String>, DriverError> {
        let mut ids = Vec::new();
        for page in 1_u32.. {
            let servers = self.list_page(zone, page).await?;
            let last = servers.len() < LIST_PAGE_SIZE;
            ids.extend(
                servers
                    .into_iter()
                    .filter(|server| server.tags.iter().any(|tag| tag == MANAGED_TAG))
                    .map(|server| server.id),
            );
            if last {
                break;
            }
        }
        Ok(ids)
    }

    async fn list_page(&self, zone: &str, page: u32) -> Result<Vec<ListedServer>, DriverError> {
        let url = format!("{SCALEWAY_INSTANCE_API_BASE}/zones/{zone}/servers");
        let page_size = LIST_PAGE_SIZE.to_string();
        let page_number = page.to_string();
        let response = self
            .http
            .get(&url)
            .header("X-Auth-Token", &self.secret_key)
            .query(&[
                ("tags", MANAGED_TAG),
                ("project", self.project_id.as_str()),
                ("per_page", page_size.as_str()),
                ("page", page_number.as_str()),
            ])
            .send()
            .await
            .map_err(|err| DriverError::api(KIND, "list", err))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DriverError::api(KIND, "list", format!("HTTP {status}: {body}")));
        }
        let parsed: ListServersResponse = response
            .json()
            .await
            .map_err(|err| DriverError::api(KIND, "list", err))?;
        Ok(parsed.servers)
    }
}
