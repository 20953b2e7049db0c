//! Server lifecycle helpers for the Scaleway driver.

use std::future::Future;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use tokio::time::sleep;

use crate::driver::{Description, DriverError, NetworkRef};
use crate::session::Endpoint;

mod create;
mod image;
mod inspect;

const SCALEWAY_INSTANCE_API_BASE: &str = "https://api.scaleway.com/instance/v1";

/// Borrowed zone and id of a server.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) struct ServerRef<'a> {
    pub(super) zone: &'a str,
    pub(super) id: &'a str,
}

/// Fields of a server the driver acts on.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(super) struct ServerSnapshot {
    pub(super) id: String,
    pub(super) state: String,
    pub(super) allowed_actions: Vec<String>,
    pub(super) public_ip: Option<String>,
}

impl ServerSnapshot {
    fn allows(&self, action: &str) -> bool {
        self.allowed_actions.iter().any(|allowed| allowed == action)
    }
}

/// Next step when tearing a server down.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum Teardown {
    /// Terminate the server together with its volumes.
    Terminate,
    /// Delete a server that never booted.
    Delete,
    /// An earlier terminate is still being carried out.
    InProgress,
    /// The server is mid-transition and accepts neither request.
    Unsettled,
}

pub(super) fn teardown_step(snapshot: &ServerSnapshot) -> Teardown {
    if snapshot.allows("terminate") {
        return Teardown::Terminate;
    }
    match snapshot.state.as_str() {
        "stopped" => Teardown::Delete,
        "stopping" | "locked" => Teardown::InProgress,
        _ => Teardown::Unsettled,
    }
}

/// Calls `fetch` until it finds no server, at most `attempts` times.
/// Returns whether the server disappeared.
pub(super) async fn poll_until_gone<F, Fut>(
    mut fetch: F,
    attempts: u32,
    interval: Duration,
) -> Result<bool, DriverError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<ServerSnapshot>, DriverError>>,
{
    for attempt in 1..=attempts {
        if fetch().await?.is_none() {
            return Ok(true);
        }
        if attempt < attempts {
            sleep(interval).await;
        }
    }
    Ok(false)
}

pub(super) fn parse_public_ip(raw: &str) -> Option<IpAddr> {
    IpAddr::from_str(raw.trim()).ok()
}

/// Maps a fetched server (or its absence) to a driver description.
pub(super) fn describe_snapshot(snapshot: Option<ServerSnapshot>, ssh_port: u16) -> Description {
    let Some(server) = snapshot else {
        return Description::gone();
    };
    match server.state.as_str() {
        "running" => Description::running(
            server
                .public_ip
                .as_deref()
                .and_then(parse_public_ip)
                .map(|ip| NetworkRef::Address(Endpoint::new(ip.to_string(), ssh_port))),
        ),
        "starting" | "stopped" => Description::provisioning(),
        other => Description::failed(format!("server {} is {other}", server.id)),
    }
}
