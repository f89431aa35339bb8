use crate::cloud::{CloudConfig, CloudError, CloudResult, ProjectScope};
use reqwest::blocking::{Client, Response};
use reqwest::Method;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

const REQUEST_ID_HEADER: &str = "X-OpenStack-Request-ID";
const TOKEN_HEADER: &str = "X-Auth-Token";
const SUBJECT_TOKEN_HEADER: &str = "X-Subject-Token";
const IRONIC_VERSION_HEADER: &str = "X-OpenStack-Ironic-API-Version";
const IRONIC_API_VERSION: &str = "1.46";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceType {
    Reservation,
    Compute,
    Network,
    Image,
    BareMetal,
}

impl ServiceType {
    pub fn catalog_type(&self) -> &'static str {
        match self {
            ServiceType::Reservation => "reservation",
            ServiceType::Compute => "compute",
            ServiceType::Network => "network",
            ServiceType::Image => "image",
            ServiceType::BareMetal => "baremetal",
        }
    }

    /// Neutron and Glance publish unversioned endpoints in the catalog.
    fn version_prefix(&self) -> &'static str {
        match self {
            ServiceType::Network => "/v2.0",
            ServiceType::Image => "/v2",
            ServiceType::BareMetal => "/v1",
            ServiceType::Reservation | ServiceType::Compute => "",
        }
    }

    /// Ironic serves its oldest API without a version header, and that one
    /// cannot filter ports by node.
    fn microversion(&self) -> Option<(&'static str, &'static str)> {
        match self {
            ServiceType::BareMetal => Some((IRONIC_VERSION_HEADER, IRONIC_API_VERSION)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
enum ConfigSource {
    Ready(CloudConfig),
    Environment,
}

#[derive(Debug)]
struct AuthState {
    token: String,
    endpoints: HashMap<ServiceType, String>,
}

/// Keystone-authenticated HTTP session. Credentials are resolved and the token
/// is issued on the first request, so building a session never fails on
/// missing `OS_*` variables.
pub struct OpenStackSession {
    http: Client,
    source: ConfigSource,
    auth: OnceLock<AuthState>,
}

impl OpenStackSession {
    pub fn new(config: CloudConfig, timeout: Duration) -> CloudResult<Self> {
        Self::build(ConfigSource::Ready(config), timeout)
    }

    pub fn from_env(timeout: Duration) -> CloudResult<Self> {
        Self::build(ConfigSource::Environment, timeout)
    }

    fn build(source: ConfigSource, timeout: Duration) -> CloudResult<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CloudError::Transport(format!("failed to build http client: {e}")))?;
        Ok(Self {
            http,
            source,
            auth: OnceLock::new(),
        })
    }

    fn auth(&self) -> CloudResult<&AuthState> {
        if let Some(state) = self.auth.get() {
            return Ok(state);
        }
        let config = match &self.source {
            ConfigSource::Ready(config) => config.clone(),
            ConfigSource::Environment => CloudConfig::from_env()?,
        };
        let state = self.authenticate(&config)?;
        Ok(self.auth.get_or_init(|| state))
    }

    fn authenticate(&self, config: &CloudConfig) -> CloudResult<AuthState> {
        let project = match &config.project {
            ProjectScope::Id(id) => json!({ "id": id }),
            ProjectScope::Name(name) => json!({
                "name": name,
                "domain": { "name": config.project_domain_name }
            }),
        };
        let body = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": config.username,
                            "domain": { "name": config.user_domain_name },
                            "password": config.password
                        }
                    }
                },
                "scope": { "project": project }
            }
        });

        let url = config.token_url();
        let response = self
            .http
            .post(&url)
            .header(REQUEST_ID_HEADER, request_id())
            .json(&body)
            .send()
            .map_err(|e| CloudError::Transport(format!("keystone authentication failed: {e}")))?;

        let token = response
            .headers()
            .get(SUBJECT_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string);
        let payload = read_json(response)
            .map_err(|e| match e {
                CloudError::Http { status, message } => CloudError::Auth { status, message },
                other => other,
            })?
            .unwrap_or(Value::Null);
        let token = token.ok_or_else(|| {
            CloudError::Decode("keystone response carried no X-Subject-Token".to_string())
        })?;

        let endpoints = parse_catalog(&payload, &config.interface, config.region_name.as_deref());
        info!(auth_url = %config.auth_url, services = endpoints.len(), "authenticated with keystone");
        Ok(AuthState { token, endpoints })
    }

    pub fn get(&self, service: ServiceType, path: &str) -> CloudResult<Value> {
        self.get_with_query(service, path, &[])
    }

    pub fn get_with_query(
        &self,
        service: ServiceType,
        path: &str,
        query: &[(&str, &str)],
    ) -> CloudResult<Value> {
        self.send(service, Method::GET, path, query, None)
            .map(|body| body.unwrap_or(Value::Null))
    }

    pub fn post(&self, service: ServiceType, path: &str, body: &Value) -> CloudResult<Value> {
        self.send(service, Method::POST, path, &[], Some(body))
            .map(|body| body.unwrap_or(Value::Null))
    }

    pub fn patch(&self, service: ServiceType, path: &str, body: &Value) -> CloudResult<Value> {
        self.send(service, Method::PATCH, path, &[], Some(body))
            .map(|body| body.unwrap_or(Value::Null))
    }

    pub fn put(&self, service: ServiceType, path: &str, body: &Value) -> CloudResult<()> {
        self.send(service, Method::PUT, path, &[], Some(body)).map(|_| ())
    }

    pub fn delete(&self, service: ServiceType, path: &str) -> CloudResult<()> {
        self.send(service, Method::DELETE, path, &[], None).map(|_| ())
    }

    fn send(
        &self,
        service: ServiceType,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> CloudResult<Option<Value>> {
        let auth = self.auth()?;
        let base = auth
            .endpoints
            .get(&service)
            .ok_or_else(|| CloudError::MissingEndpoint(service.catalog_type().to_string()))?;
        let url = join_url(base, service.version_prefix(), path);
        let request_id = request_id();
        debug!(method = %method, url = %url, request_id = %request_id, "openstack request");

        let mut builder = self
            .http
            .request(method, &url)
            .header(TOKEN_HEADER, &auth.token)
            .header(REQUEST_ID_HEADER, &request_id);
        if let Some((header, version)) = service.microversion() {
            builder = builder.header(header, version);
        }
        if !query.is_empty() {
            builder = builder.query(query);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .map_err(|e| CloudError::Transport(format!("{url}: {e}")))?;
        read_json(response)
    }
}

fn request_id() -> String {
    format!("req-{}", Uuid::new_v4())
}

fn join_url(base: &str, version_prefix: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if version_prefix.is_empty() || base.ends_with(version_prefix) {
        format!("{base}/{path}")
    } else {
        format!("{base}{version_prefix}/{path}")
    }
}

fn read_json(response: Response) -> CloudResult<Option<Value>> {
    let status = response.status();
    let text = response
        .text()
        .map_err(|e| CloudError::Transport(format!("failed to read response body: {e}")))?;

    if !status.is_success() {
        return Err(CloudError::Http {
            status: status.as_u16(),
            message: error_message(&text)
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string()),
        });
    }
    if text.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|e| CloudError::Decode(format!("invalid JSON body: {e}")))
}

/// Pulls the human message out of the various OpenStack fault shapes:
/// `{"itemNotFound": {"message": ..}}`, `{"NeutronError": {"message": ..}}`,
/// Blazar's `{"error_message": ..}` and Keystone's `{"error": {"message": ..}}`.
fn error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    let direct = ["error_message", "message", "faultstring"]
        .iter()
        .find_map(|key| value.get(key).and_then(Value::as_str));
    if let Some(message) = direct {
        return Some(message.to_string());
    }
    value.as_object()?.values().find_map(|nested| {
        nested
            .get("message")
            .and_then(Value::as_str)
            .map(ToString::to_string)
    })
}

fn parse_catalog(
    payload: &Value,
    interface: &str,
    region: Option<&str>,
) -> HashMap<ServiceType, String> {
    let wanted = [
        ServiceType::Reservation,
        ServiceType::Compute,
        ServiceType::Network,
        ServiceType::Image,
        ServiceType::BareMetal,
    ];
    let catalog = payload
        .pointer("/token/catalog")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut endpoints = HashMap::new();
    for service in wanted {
        let url = catalog
            .iter()
            .filter(|entry| entry.get("type").and_then(Value::as_str) == Some(service.catalog_type()))
            .flat_map(|entry| {
                entry
                    .get("endpoints")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default()
            })
            .find(|endpoint| {
                let interface_matches =
                    endpoint.get("interface").and_then(Value::as_str) == Some(interface);
                let region_matches = region.map_or(true, |region| {
                    endpoint.get("region_id").and_then(Value::as_str) == Some(region)
                        || endpoint.get("region").and_then(Value::as_str) == Some(region)
                });
                interface_matches && region_matches
            })
            .and_then(|endpoint| endpoint.get("url").and_then(Value::as_str).map(ToString::to_string));
        if let Some(url) = url {
            endpoints.insert(service, url);
        }
    }
    endpoints
}
