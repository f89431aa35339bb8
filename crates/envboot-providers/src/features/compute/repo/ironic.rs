use super::{allocate_floating_ip, list, str_field};
use crate::cloud::{CloudError, CloudResult, OpenStackSession, ServiceType};
use envboot_core::ServerStatus;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeState {
    pub id: String,
    pub provision_state: String,
    pub last_error: Option<String>,
}

impl NodeState {
    pub fn is_deployed(&self) -> bool {
        matches!(self.provision_state.as_str(), "active" | "deployed")
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.provision_state.as_str(), "deploy failed" | "error")
    }

    /// Node state folded onto the server vocabulary of the launch payload.
    pub fn server_status(&self) -> ServerStatus {
        if self.is_deployed() {
            ServerStatus::Active
        } else if self.is_failed() {
            ServerStatus::Error
        } else {
            ServerStatus::Build
        }
    }
}

/// Neutron port wired to one of a node's NICs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePort {
    pub port_id: String,
    pub fixed_ip: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
pub trait BareMetalRepository: Send + Sync {
    /// Points the node's next deploy at a Glance image.
    fn set_image(&self, node_id: &str, image_id: &str) -> CloudResult<()>;
    /// Requests the `active` provision state.
    fn deploy(&self, node_id: &str) -> CloudResult<()>;
    fn get_node(&self, node_id: &str) -> CloudResult<NodeState>;
    /// First Neutron port whose MAC matches one of the node's Ironic ports.
    fn node_port(&self, node_id: &str) -> CloudResult<Option<NodePort>>;
    fn attach_floating_ip(&self, port_id: &str) -> CloudResult<String>;
}

/// Ironic for node state, Neutron for the addresses behind its NICs.
pub struct IronicRepository {
    session: Arc<OpenStackSession>,
}

impl IronicRepository {
    pub fn new(session: Arc<OpenStackSession>) -> Self {
        Self { session }
    }
}

fn node_from_json(body: &Value) -> CloudResult<NodeState> {
    let id = body
        .get("uuid")
        .and_then(Value::as_str)
        .ok_or_else(|| CloudError::Decode("node response has no 'uuid'".to_string()))?
        .to_string();
    Ok(NodeState {
        id,
        provision_state: str_field(body, "provision_state"),
        last_error: body
            .get("last_error")
            .and_then(Value::as_str)
            .filter(|message| !message.is_empty())
            .map(ToString::to_string),
    })
}

impl BareMetalRepository for IronicRepository {
    fn set_image(&self, node_id: &str, image_id: &str) -> CloudResult<()> {
        let patch = json!([{ "op": "add", "path": "/instance_info/image_source", "value": image_id }]);
        self.session
            .patch(ServiceType::BareMetal, &format!("/nodes/{node_id}"), &patch)?;
        Ok(())
    }

    fn deploy(&self, node_id: &str) -> CloudResult<()> {
        self.session.put(
            ServiceType::BareMetal,
            &format!("/nodes/{node_id}/states/provision"),
            &json!({ "target": "active" }),
        )
    }

    fn get_node(&self, node_id: &str) -> CloudResult<NodeState> {
        let body = self
            .session
            .get(ServiceType::BareMetal, &format!("/nodes/{node_id}"))?;
        node_from_json(&body)
    }

    fn node_port(&self, node_id: &str) -> CloudResult<Option<NodePort>> {
        let nics = self
            .session
            .get_with_query(ServiceType::BareMetal, "/ports", &[("node", node_id)])?;
        for mac in list(&nics, "ports").iter().map(|nic| str_field(nic, "address")) {
            if mac.is_empty() {
                continue;
            }
            let ports = self.session.get_with_query(
                ServiceType::Network,
                "/ports",
                &[("mac_address", mac.as_str())],
            )?;
            if let Some(port) = list(&ports, "ports").first() {
                return Ok(Some(NodePort {
                    port_id: str_field(port, "id"),
                    fixed_ip: port
                        .pointer("/fixed_ips/0/ip_address")
                        .and_then(Value::as_str)
                        .map(ToString::to_string),
                }));
            }
        }
        Ok(None)
    }

    fn attach_floating_ip(&self, port_id: &str) -> CloudResult<String> {
        allocate_floating_ip(&self.session, port_id)
    }
}
