//! Pod manifests and status mapping for the cluster driver.

use serde::Deserialize;
use serde_json::{Value, json};

use crate::driver::{Description, NetworkRef};
use crate::session::Endpoint;

/// Label selecting every pod this tool created.
pub(super) const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub(super) const MANAGED_BY_VALUE: &str = "hatch";
const SESSION_NAME_LABEL: &str = "hatch.dev/session-name";
const CONTAINER_NAME: &str = "sshd";

/// Waiting reasons that never resolve on their own.
const FATAL_WAITING_REASONS: [&str; 6] = [
    "ErrImagePull",
    "ImagePullBackOff",
    "InvalidImageName",
    "CrashLoopBackOff",
    "CreateContainerConfigError",
    "CreateContainerError",
];

/// Inputs for [`pod_manifest`].
pub(super) struct PodTemplate<'a> {
    pub(super) name: &'a str,
    pub(super) session_name: &'a str,
    pub(super) image: &'a str,
    pub(super) cpu: &'a str,
    pub(super) memory: &'a str,
    pub(super) login_user: &'a str,
    pub(super) public_key: &'a str,
    pub(super) container_port: u16,
    pub(super) host_port: u16,
}

/// Builds the pod submitted for a session.
pub(super) fn pod_manifest(template: &PodTemplate<'_>) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": template.name,
            "labels": {
                MANAGED_BY_LABEL: MANAGED_BY_VALUE,
                SESSION_NAME_LABEL: template.session_name,
            },
        },
        "spec": {
            "restartPolicy": "Never",
            "terminationGracePeriodSeconds": 5,
            "containers": [{
                "name": CONTAINER_NAME,
                "image": template.image,
                "env": [
                    { "name": "PUBLIC_KEY", "value": template.public_key.trim() },
                    { "name": "USER_NAME", "value": template.login_user },
                ],
                "ports": [{
                    "name": "ssh",
                    "containerPort": template.container_port,
                    "hostPort": template.host_port,
                    "protocol": "TCP",
                }],
                "resources": {
                    "requests": { "cpu": template.cpu, "memory": template.memory },
                },
            }],
        },
    })
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct Pod {
    #[serde(default)]
    pub(super) metadata: ObjectMeta,
    #[serde(default)]
    pub(super) spec: PodSpec,
    #[serde(default)]
    pub(super) status: PodStatus,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ObjectMeta {
    #[serde(default)]
    pub(super) name: String,
    #[serde(default)]
    pub(super) namespace: Option<String>,
    #[serde(default)]
    pub(super) deletion_timestamp: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct PodSpec {
    #[serde(default)]
    pub(super) node_name: Option<String>,
    #[serde(default)]
    pub(super) containers: Vec<Container>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct Container {
    #[serde(default)]
    pub(super) ports: Vec<ContainerPort>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ContainerPort {
    #[serde(default)]
    pub(super) host_port: Option<u16>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct PodStatus {
    #[serde(default)]
    pub(super) phase: Option<String>,
    #[serde(default)]
    pub(super) message: Option<String>,
    #[serde(default)]
    pub(super) container_statuses: Vec<ContainerStatus>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ContainerStatus {
    #[serde(default)]
    pub(super) ready: bool,
    #[serde(default)]
    pub(super) state: ContainerState,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub(super) struct ContainerState {
    #[serde(default)]
    pub(super) waiting: Option<StateReason>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub(super) struct StateReason {
    #[serde(default)]
    pub(super) reason: Option<String>,
    #[serde(default)]
    pub(super) message: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub(super) struct PodList {
    #[serde(default)]
    pub(super) metadata: ListMeta,
    #[serde(default)]
    pub(super) items: Vec<Pod>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub(super) struct ListMeta {
    #[serde(default, rename = "continue")]
    pub(super) continue_token: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub(super) struct Node {
    #[serde(default)]
    pub(super) status: NodeStatus,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub(super) struct NodeStatus {
    #[serde(default)]
    pub(super) addresses: Vec<NodeAddress>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub(super) struct NodeAddress {
    #[serde(rename = "type")]
    pub(super) kind: String,
    pub(super) address: String,
}

impl Pod {
    /// Host port published for the SSH container, if any.
    pub(super) fn host_port(&self) -> Option<u16> {
        self.spec
            .containers
            .iter()
            .flat_map(|container| &container.ports)
            .find_map(|port| port.host_port)
            .filter(|port| *port != 0)
    }

    fn fatal_waiting(&self) -> Option<String> {
        self.status
            .container_statuses
            .iter()
            .filter_map(|status| status.state.waiting.as_ref())
            .find(|waiting| {
                waiting
                    .reason
                    .as_deref()
                    .is_some_and(|reason| FATAL_WAITING_REASONS.contains(&reason))
            })
            .map(|waiting| {
                let reason = waiting.reason.as_deref().unwrap_or_default();
                match waiting.message.as_deref() {
                    Some(message) if !message.is_empty() => format!("{reason}: {message}"),
                    _ => reason.to_owned(),
                }
            })
    }

    fn containers_ready(&self) -> bool {
        !self.status.container_statuses.is_empty()
            && self.status.container_statuses.iter().all(|status| status.ready)
    }
}

/// Maps a fetched pod (or its absence) to a driver description.
///
/// A running pod whose containers are ready reports its node name for a
/// secondary address lookup.
pub(super) fn describe_pod(pod: Option<&Pod>) -> Description {
    let Some(found) = pod else {
        return Description::gone();
    };
    if found.metadata.deletion_timestamp.is_some() {
        return Description::failed(format!("pod {} is being deleted", found.metadata.name));
    }
    if let Some(reason) = found.fatal_waiting() {
        return Description::failed(reason);
    }
    match found.status.phase.as_deref() {
        Some("Running") if found.containers_ready() => Description::running(
            found.spec.node_name.clone().map(NetworkRef::Lookup),
        ),
        Some("Running") => Description::running(None),
        Some(phase @ ("Succeeded" | "Failed")) => {
            let detail = found.status.message.as_deref().unwrap_or("container exited");
            Description::failed(format!("pod {} {phase}: {detail}", found.metadata.name))
        }
        _ => Description::provisioning(),
    }
}

/// Picks the external address of a node, falling back to its internal one.
pub(super) fn node_endpoint(node: &Node, port: u16) -> Option<Endpoint> {
    let find = |kind: &str| {
        node.status
            .addresses
            .iter()
            .find(|address| address.kind == kind && !address.address.is_empty())
            .map(|address| address.address.clone())
    };
    find("ExternalIP")
        .or_else(|| find("InternalIP"))
        .map(|host| Endpoint::new(host, port))
}
