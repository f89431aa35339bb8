use crate::cloud::{CloudError, CloudResult, OpenStackSession, ServiceType};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use envboot_core::ServerStatus;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

mod ironic;

pub use ironic::{BareMetalRepository, IronicRepository, NodePort, NodeState};
#[cfg(test)]
pub use ironic::MockBareMetalRepository;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    pub id: String,
    pub name: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSpec {
    pub name: String,
    pub image_id: String,
    pub flavor_id: String,
    pub network_id: String,
    pub key_name: String,
    pub security_groups: Vec<String>,
    /// Blazar reservation the scheduler must place the server on.
    pub reservation_hint: String,
    pub user_data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerState {
    pub id: String,
    pub name: String,
    pub status: ServerStatus,
    pub fixed_ip: Option<String>,
    pub floating_ip: Option<String>,
    pub fault: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
pub trait ComputeRepository: Send + Sync {
    fn find_image(&self, name_or_id: &str) -> CloudResult<Option<ImageRecord>>;
    fn list_images(&self) -> CloudResult<Vec<ImageRecord>>;
    fn find_flavor(&self, name_or_id: &str) -> CloudResult<Option<String>>;
    fn find_network(&self, name_or_id: &str) -> CloudResult<Option<String>>;
    fn create_server(&self, spec: &ServerSpec) -> CloudResult<ServerState>;
    fn get_server(&self, server_id: &str) -> CloudResult<ServerState>;
    /// Allocates a floating IP on the first external network and binds it to
    /// the server's port. Returns the public address.
    fn attach_floating_ip(&self, server_id: &str) -> CloudResult<String>;
    fn keypair_exists(&self, name: &str) -> CloudResult<bool>;
    fn import_keypair(&self, name: &str, public_key: &str) -> CloudResult<()>;
}

/// Nova for servers and keypairs, Glance for images, Neutron for networks and floating IPs.
pub struct NovaComputeRepository {
    session: Arc<OpenStackSession>,
}

impl NovaComputeRepository {
    pub fn new(session: Arc<OpenStackSession>) -> Self {
        Self { session }
    }

    fn get_optional(&self, service: ServiceType, path: &str) -> CloudResult<Option<Value>> {
        match self.session.get(service, path) {
            Ok(body) => Ok(Some(body)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn is_uuid(value: &str) -> bool {
    Uuid::parse_str(value).is_ok()
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn list<'a>(body: &'a Value, key: &str) -> &'a [Value] {
    body.get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn image_from_json(value: &Value) -> Option<ImageRecord> {
    let id = value.get("id")?.as_str()?.to_string();
    Some(ImageRecord {
        id,
        name: str_field(value, "name"),
        status: str_field(value, "status"),
    })
}

pub(crate) fn server_from_json(body: &Value) -> CloudResult<ServerState> {
    let server = body.get("server").unwrap_or(body);
    let id = server
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| CloudError::Decode("server response has no 'id'".to_string()))?
        .to_string();

    let mut fixed_ip = None;
    let mut floating_ip = None;
    if let Some(addresses) = server.get("addresses").and_then(Value::as_object) {
        for entry in addresses.values().filter_map(Value::as_array).flatten() {
            let addr = entry.get("addr").and_then(Value::as_str).map(ToString::to_string);
            match entry.get("OS-EXT-IPS:type").and_then(Value::as_str) {
                Some("floating") => floating_ip = addr,
                Some("fixed") if fixed_ip.is_none() => fixed_ip = addr,
                _ => {}
            }
        }
    }

    let status = server
        .get("status")
        .and_then(Value::as_str)
        .map(|s| ServerStatus::from(s.to_string()))
        .unwrap_or(ServerStatus::Build);

    Ok(ServerState {
        id,
        name: str_field(server, "name"),
        status,
        fixed_ip,
        floating_ip,
        fault: server
            .pointer("/fault/message")
            .and_then(Value::as_str)
            .map(ToString::to_string),
    })
}

/// Allocates a floating IP on the first external network and binds it to `port_id`.
fn allocate_floating_ip(session: &OpenStackSession, port_id: &str) -> CloudResult<String> {
    let networks = session.get_with_query(
        ServiceType::Network,
        "/networks",
        &[("router:external", "true")],
    )?;
    let external = list(&networks, "networks")
        .first()
        .map(|network| str_field(network, "id"))
        .ok_or_else(|| CloudError::Decode("no external network for floating IPs".to_string()))?;

    let body = json!({ "floatingip": { "floating_network_id": external, "port_id": port_id } });
    let created = session.post(ServiceType::Network, "/floatingips", &body)?;
    created
        .pointer("/floatingip/floating_ip_address")
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| CloudError::Decode("floating IP response has no address".to_string()))
}

impl ComputeRepository for NovaComputeRepository {
    fn find_image(&self, name_or_id: &str) -> CloudResult<Option<ImageRecord>> {
        if is_uuid(name_or_id) {
            if let Some(body) =
                self.get_optional(ServiceType::Image, &format!("/images/{name_or_id}"))?
            {
                return Ok(image_from_json(&body));
            }
        }
        let body = self
            .session
            .get_with_query(ServiceType::Image, "/images", &[("name", name_or_id)])?;
        Ok(list(&body, "images").iter().find_map(image_from_json))
    }

    fn list_images(&self) -> CloudResult<Vec<ImageRecord>> {
        let body = self.session.get_with_query(
            ServiceType::Image,
            "/images",
            &[("status", "active"), ("limit", "1000")],
        )?;
        Ok(list(&body, "images").iter().filter_map(image_from_json).collect())
    }

    fn find_flavor(&self, name_or_id: &str) -> CloudResult<Option<String>> {
        let body = self.session.get(ServiceType::Compute, "/flavors")?;
        Ok(list(&body, "flavors")
            .iter()
            .find(|flavor| {
                flavor.get("id").and_then(Value::as_str) == Some(name_or_id)
                    || flavor.get("name").and_then(Value::as_str) == Some(name_or_id)
            })
            .map(|flavor| str_field(flavor, "id")))
    }

    fn find_network(&self, name_or_id: &str) -> CloudResult<Option<String>> {
        if is_uuid(name_or_id) {
            if let Some(body) =
                self.get_optional(ServiceType::Network, &format!("/networks/{name_or_id}"))?
            {
                return Ok(body.pointer("/network/id").and_then(Value::as_str).map(ToString::to_string));
            }
        }
        let body = self
            .session
            .get_with_query(ServiceType::Network, "/networks", &[("name", name_or_id)])?;
        Ok(list(&body, "networks")
            .first()
            .map(|network| str_field(network, "id")))
    }

    fn create_server(&self, spec: &ServerSpec) -> CloudResult<ServerState> {
        let mut server = json!({
            "name": spec.name,
            "imageRef": spec.image_id,
            "flavorRef": spec.flavor_id,
            "networks": [{ "uuid": spec.network_id }],
            "key_name": spec.key_name,
            "security_groups": spec
                .security_groups
                .iter()
                .map(|name| json!({ "name": name }))
                .collect::<Vec<_>>(),
        });
        if let Some(user_data) = &spec.user_data {
            server["user_data"] = Value::String(STANDARD.encode(user_data));
        }
        let body = json!({
            "server": server,
            "os:scheduler_hints": { "reservation": spec.reservation_hint }
        });

        let response = self.session.post(ServiceType::Compute, "/servers", &body)?;
        let mut state = server_from_json(&response)?;
        if state.name.is_empty() {
            state.name = spec.name.clone();
        }
        Ok(state)
    }

    fn get_server(&self, server_id: &str) -> CloudResult<ServerState> {
        let body = self
            .session
            .get(ServiceType::Compute, &format!("/servers/{server_id}"))?;
        server_from_json(&body)
    }

    fn attach_floating_ip(&self, server_id: &str) -> CloudResult<String> {
        let ports = self.session.get_with_query(
            ServiceType::Network,
            "/ports",
            &[("device_id", server_id)],
        )?;
        let port = list(&ports, "ports")
            .first()
            .map(|port| str_field(port, "id"))
            .ok_or_else(|| CloudError::Decode(format!("server {server_id} has no port")))?;
        allocate_floating_ip(&self.session, &port)
    }

    fn keypair_exists(&self, name: &str) -> CloudResult<bool> {
        Ok(self
            .get_optional(ServiceType::Compute, &format!("/os-keypairs/{name}"))?
            .is_some())
    }

    fn import_keypair(&self, name: &str, public_key: &str) -> CloudResult<()> {
        let body = json!({ "keypair": { "name": name, "public_key": public_key.trim() } });
        self.session.post(ServiceType::Compute, "/os-keypairs", &body)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::session::testing::{mock_keystone, session_for};
    use httpmock::prelude::*;

    fn repo(server: &MockServer) -> NovaComputeRepository {
        mock_keystone(server);
        NovaComputeRepository::new(Arc::new(session_for(server)))
    }

    #[test]
    fn test_server_addresses_are_split_by_type() {
        let state = server_from_json(&json!({ "server": {
            "id": "srv-1",
            "name": "envboot",
            "status": "ACTIVE",
            "addresses": { "sharednet1": [
                { "addr": "10.140.81.12", "OS-EXT-IPS:type": "fixed" },
                { "addr": "129.114.108.4", "OS-EXT-IPS:type": "floating" }
            ]}
        }}))
        .unwrap();

        assert_eq!(state.status, ServerStatus::Active);
        assert_eq!(state.fixed_ip.as_deref(), Some("10.140.81.12"));
        assert_eq!(state.floating_ip.as_deref(), Some("129.114.108.4"));
    }

    #[test]
    fn test_error_server_keeps_fault() {
        let state = server_from_json(&json!({ "server": {
            "id": "srv-1", "status": "ERROR",
            "fault": { "message": "No valid host was found. There are not enough hosts available." }
        }}))
        .unwrap();
        assert_eq!(state.status, ServerStatus::Error);
        assert!(state.fault.unwrap().contains("No valid host"));
    }

    #[test]
    fn test_create_server_sends_reservation_hint() {
        let server = MockServer::start();
        let create = server.mock(|when, then| {
            when.method(POST)
                .path("/compute/v2.1/servers")
                .json_body_partial(r#"{"os:scheduler_hints": {"reservation": "res-1"}}"#)
                .json_body_partial(r#"{"server": {"user_data": "I2Nsb3VkLWNvbmZpZw=="}}"#);
            then.status(202).json_body(json!({ "server": { "id": "srv-1" } }));
        });

        let state = repo(&server)
            .create_server(&ServerSpec {
                name: "envboot".to_string(),
                image_id: "img".to_string(),
                flavor_id: "fl".to_string(),
                network_id: "net".to_string(),
                key_name: "my-key".to_string(),
                security_groups: vec!["default".to_string()],
                reservation_hint: "res-1".to_string(),
                user_data: Some("#cloud-config".to_string()),
            })
            .unwrap();

        create.assert();
        assert_eq!(state.id, "srv-1");
        assert_eq!(state.name, "envboot");
        assert_eq!(state.status, ServerStatus::Build);
    }

    #[test]
    fn test_find_image_by_name_and_missing_flavor() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/image/v2/images").query_param("name", "CC-Ubuntu22.04");
            then.status(200).json_body(json!({ "images": [
                { "id": "img-1", "name": "CC-Ubuntu22.04", "status": "active" }
            ]}));
        });
        server.mock(|when, then| {
            when.method(GET).path("/compute/v2.1/flavors");
            then.status(200).json_body(json!({ "flavors": [{ "id": "fl-1", "name": "baremetal" }] }));
        });

        let repo = repo(&server);
        assert_eq!(repo.find_image("CC-Ubuntu22.04").unwrap().unwrap().id, "img-1");
        assert_eq!(repo.find_flavor("baremetal").unwrap().as_deref(), Some("fl-1"));
        assert_eq!(repo.find_flavor("m1.huge").unwrap(), None);
    }

    #[test]
    fn test_attach_floating_ip() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/network/v2.0/networks").query_param("router:external", "true");
            then.status(200).json_body(json!({ "networks": [{ "id": "public-net" }] }));
        });
        server.mock(|when, then| {
            when.method(GET).path("/network/v2.0/ports").query_param("device_id", "srv-1");
            then.status(200).json_body(json!({ "ports": [{ "id": "port-1" }] }));
        });
        let fip = server.mock(|when, then| {
            when.method(POST)
                .path("/network/v2.0/floatingips")
                .json_body(json!({ "floatingip": { "floating_network_id": "public-net", "port_id": "port-1" } }));
            then.status(201).json_body(json!({ "floatingip": { "floating_ip_address": "129.114.0.9" } }));
        });

        let address = repo(&server).attach_floating_ip("srv-1").unwrap();
        assert_eq!(address, "129.114.0.9");
        fip.assert();
    }

    #[test]
    fn test_keypair_lookup_and_import() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/compute/v2.1/os-keypairs/my-key");
            then.status(404).json_body(json!({ "itemNotFound": { "message": "Keypair my-key not found" } }));
        });
        let import = server.mock(|when, then| {
            when.method(POST)
                .path("/compute/v2.1/os-keypairs")
                .json_body(json!({ "keypair": { "name": "my-key", "public_key": "ssh-rsa AAAA test" } }));
            then.status(200).json_body(json!({ "keypair": { "name": "my-key" } }));
        });

        let repo = repo(&server);
        assert!(!repo.keypair_exists("my-key").unwrap());
        repo.import_keypair("my-key", "ssh-rsa AAAA test\n").unwrap();
        import.assert();
    }
}
