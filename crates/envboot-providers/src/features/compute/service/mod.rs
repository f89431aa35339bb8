use crate::cloud::CloudError;
use crate::features::compute::repo::{
    BareMetalRepository, ComputeRepository, ImageRecord, NodeState, ServerSpec, ServerState,
};
use crate::features::reservation::repo::ReservationRepository;
use envboot_core::payload::LaunchData;
use envboot_core::{
    guess_ssh_user, simulation, BareMetalOptions, Clock, CoreError, LeaseRecord, OperationError,
    PollExit, PollSettings, PollingReport, ResourceType, ServerLaunchRequest, ServerRecord,
    ServerStatus, StatusPoller,
};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeypairOutcome {
    Existing,
    Imported,
}

impl KeypairOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeypairOutcome::Existing => "existing",
            KeypairOutcome::Imported => "imported",
        }
    }
}

struct Resolved {
    image: ImageRecord,
    flavor_id: String,
    network_id: String,
}

pub struct ComputeService {
    compute: Arc<dyn ComputeRepository>,
    leases: Arc<dyn ReservationRepository>,
    bare_metal: Option<Arc<dyn BareMetalRepository>>,
    clock: Arc<dyn Clock>,
}

impl ComputeService {
    pub fn new(
        compute: Arc<dyn ComputeRepository>,
        leases: Arc<dyn ReservationRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            compute,
            leases,
            bare_metal: None,
            clock,
        }
    }

    pub fn with_bare_metal(mut self, bare_metal: Arc<dyn BareMetalRepository>) -> Self {
        self.bare_metal = Some(bare_metal);
        self
    }

    pub fn launch_servers(
        &self,
        request: &ServerLaunchRequest,
        dry_run: bool,
    ) -> Result<LaunchData, OperationError> {
        request.validate()?;
        let settings = PollSettings::from_secs(request.wait_seconds, request.interval_seconds)?;

        if dry_run {
            return Ok(simulation::launch_servers(request, settings));
        }

        let lease = self.leases.get_lease(&request.reservation_id).map_err(|e| {
            OperationError::from(e).with_detail("reservation_id", request.reservation_id.clone())
        })?;
        if let Some(options) = &request.bare_metal {
            if lease.resource_type == Some(ResourceType::PhysicalHost) {
                return self.deploy_bare_metal(request, options, &lease, settings);
            }
            warn!(reservation_id = %request.reservation_id, "force_ironic ignored: lease is not physical:host");
        }
        let hint = lease.scheduler_hint().to_string();
        let resolved = self.resolve(request)?;

        let mut created: Vec<ServerState> = Vec::with_capacity(request.count as usize);
        for index in 0..request.count {
            let spec = ServerSpec {
                name: request.server_name(index),
                image_id: resolved.image.id.clone(),
                flavor_id: resolved.flavor_id.clone(),
                network_id: resolved.network_id.clone(),
                key_name: request.key_name.clone(),
                security_groups: request.security_groups_or_default(),
                reservation_hint: hint.clone(),
                user_data: request.user_data.clone(),
            };
            match self.compute.create_server(&spec) {
                Ok(server) => {
                    info!(server_id = %server.id, name = %spec.name, reservation = %hint, "server create accepted");
                    created.push(server);
                }
                Err(e) => {
                    let ids: Vec<&str> = created.iter().map(|s| s.id.as_str()).collect();
                    return Err(creation_failure(e)
                        .with_detail("reservation_id", request.reservation_id.clone())
                        .with_detail("created_server_ids", json!(ids))
                        .with_detail("failed_index", index));
                }
            }
        }

        let (mut servers, wait) = if settings.is_peek() {
            (created, None)
        } else {
            let (servers, report) = self.await_servers(request, &created, settings)?;
            (servers, Some(report))
        };

        if request.assign_floating_ip {
            for server in servers.iter_mut().filter(|s| s.floating_ip.is_none()) {
                match self.compute.attach_floating_ip(&server.id) {
                    Ok(address) => {
                        info!(server_id = %server.id, floating_ip = %address, "floating IP attached");
                        server.floating_ip = Some(address);
                    }
                    Err(e) => warn!(server_id = %server.id, error = %e, "floating IP attachment failed"),
                }
            }
        }

        let ssh_user = guess_ssh_user(&resolved.image.name);
        Ok(LaunchData {
            reservation_id: request.reservation_id.clone(),
            servers: servers
                .into_iter()
                .map(|server| record(server, ssh_user, &request.key_name))
                .collect(),
            dry_run: false,
            wait,
        })
    }

    /// Makes sure `name` exists in Nova, importing the public key at
    /// `public_key_path` when it does not.
    pub fn ensure_keypair(
        &self,
        name: &str,
        public_key_path: Option<&Path>,
    ) -> Result<KeypairOutcome, OperationError> {
        if self.compute.keypair_exists(name)? {
            return Ok(KeypairOutcome::Existing);
        }
        let path = public_key_path.ok_or_else(|| {
            CoreError::Validation(format!(
                "keypair '{name}' does not exist and no public key file was given"
            ))
        })?;
        let public_key = std::fs::read_to_string(path).map_err(|e| {
            CoreError::Validation(format!("cannot read public key {}: {e}", path.display()))
        })?;
        self.compute.import_keypair(name, &public_key)?;
        info!(keypair = %name, path = %path.display(), "keypair imported");
        Ok(KeypairOutcome::Imported)
    }

    /// Active images visible to the project.
    pub fn images(&self) -> Result<Vec<ImageRecord>, OperationError> {
        Ok(self.compute.list_images()?)
    }

    /// Writes the image straight onto the lease's reserved Ironic nodes and
    /// waits for every node to reach `active`.
    fn deploy_bare_metal(
        &self,
        request: &ServerLaunchRequest,
        options: &BareMetalOptions,
        lease: &LeaseRecord,
        settings: PollSettings,
    ) -> Result<LaunchData, OperationError> {
        let ironic = self.bare_metal.as_ref().ok_or_else(|| {
            CoreError::Backend("bare metal deployment is not configured".to_string())
        })?;
        let image = self.compute.find_image(&options.image)?.ok_or_else(|| {
            CoreError::Validation(format!("bare metal image '{}' not found", options.image))
        })?;
        let nodes: Vec<&String> = lease
            .reserved_hosts
            .iter()
            .take(request.count.max(1) as usize)
            .collect();
        if nodes.is_empty() {
            return Err(OperationError::new(CoreError::NotFound(
                "no reserved nodes found in lease".to_string(),
            ))
            .with_detail("reservation_id", request.reservation_id.clone()));
        }

        for (index, node_id) in nodes.iter().enumerate() {
            if let Err(e) = ironic.set_image(node_id, &image.id) {
                warn!(node_id = %node_id, error = %e, "could not set node image_source");
            }
            if let Err(e) = ironic.deploy(node_id) {
                return Err(OperationError::from(e)
                    .with_detail("reservation_id", request.reservation_id.clone())
                    .with_detail("node_id", node_id.as_str())
                    .with_detail("deploying_node_ids", json!(&nodes[..index])));
            }
            info!(node_id = %node_id, image = %image.name, "node deploy requested");
        }

        let (states, wait) = self.await_nodes(ironic.as_ref(), &nodes, settings)?;
        let ssh_user = request.ssh_user(&image.name);
        let servers = states
            .into_iter()
            .enumerate()
            .map(|(index, node)| {
                let port = ironic.node_port(&node.id).unwrap_or_else(|e| {
                    warn!(node_id = %node.id, error = %e, "node address lookup failed");
                    None
                });
                let floating_ip = match &port {
                    Some(port) if request.assign_floating_ip => {
                        match ironic.attach_floating_ip(&port.port_id) {
                            Ok(address) => {
                                info!(node_id = %node.id, floating_ip = %address, "floating IP attached");
                                Some(address)
                            }
                            Err(e) => {
                                warn!(node_id = %node.id, error = %e, "floating IP attachment failed");
                                None
                            }
                        }
                    }
                    _ => None,
                };
                ServerRecord {
                    name: request.server_name(index as u32),
                    status: node.server_status(),
                    server_id: node.id,
                    fixed_ip: port.and_then(|port| port.fixed_ip),
                    floating_ip,
                    ssh_user: ssh_user.clone(),
                    key_name: request.key_name.clone(),
                }
            })
            .collect();

        Ok(LaunchData {
            reservation_id: request.reservation_id.clone(),
            servers,
            dry_run: false,
            wait,
        })
    }

    fn await_nodes(
        &self,
        ironic: &dyn BareMetalRepository,
        nodes: &[&String],
        settings: PollSettings,
    ) -> Result<(Vec<NodeState>, Option<PollingReport>), OperationError> {
        let poller = StatusPoller::new(self.clock.as_ref(), settings);
        let result = poller.poll(
            || {
                nodes
                    .iter()
                    .map(|node_id| ironic.get_node(node_id))
                    .collect::<Result<Vec<_>, CloudError>>()
            },
            |states| states.iter().all(NodeState::is_deployed),
            |states| states.iter().any(NodeState::is_failed),
        );
        let report = result.report(&settings);

        match (result.exit, result.final_status) {
            (PollExit::Reached, Some(states)) => {
                info!(count = states.len(), poll_count = report.poll_count, "nodes active");
                Ok((states, (!settings.is_peek()).then_some(report)))
            }
            (PollExit::Peeked, Some(states)) => Ok((states, None)),
            (PollExit::Terminal, Some(states)) => {
                let fault = states
                    .iter()
                    .filter(|node| node.is_failed())
                    .find_map(|node| node.last_error.clone())
                    .unwrap_or_else(|| "node deploy failed".to_string());
                warn!(fault = %fault, "bare metal deploy failed");
                Err(OperationError::new(CoreError::Backend(fault))
                    .with_detail("nodes", node_summaries(&states))
                    .with_detail("wait", report_value(&report)))
            }
            (PollExit::FetchFailed, _) | (_, None) => {
                let failure = match result.error {
                    Some(e) => OperationError::from(e),
                    None => OperationError::new(CoreError::Backend(
                        "no node state observed".to_string(),
                    )),
                };
                Err(failure
                    .with_detail("node_ids", json!(nodes))
                    .with_detail("wait", report_value(&report)))
            }
            (_, Some(states)) => {
                warn!(timeout_seconds = report.timeout_seconds, "timed out waiting for nodes");
                Err(OperationError::new(CoreError::Timeout(format!(
                    "nodes did not become active within {}s",
                    report.timeout_seconds
                )))
                .with_detail("nodes", node_summaries(&states))
                .with_detail("wait", report_value(&report)))
            }
        }
    }

    fn resolve(&self, request: &ServerLaunchRequest) -> Result<Resolved, OperationError> {
        let image = self
            .compute
            .find_image(&request.image)?
            .ok_or_else(|| not_found("image", &request.image))?;
        let flavor_id = self
            .compute
            .find_flavor(&request.flavor)?
            .ok_or_else(|| not_found("flavor", &request.flavor))?;
        let network_id = self
            .compute
            .find_network(&request.network)?
            .ok_or_else(|| not_found("network", &request.network))?;
        Ok(Resolved {
            image,
            flavor_id,
            network_id,
        })
    }

    fn await_servers(
        &self,
        request: &ServerLaunchRequest,
        created: &[ServerState],
        settings: PollSettings,
    ) -> Result<(Vec<ServerState>, PollingReport), OperationError> {
        let poller = StatusPoller::new(self.clock.as_ref(), settings);
        let result = poller.poll(
            || {
                created
                    .iter()
                    .map(|server| self.compute.get_server(&server.id))
                    .collect::<Result<Vec<_>, CloudError>>()
            },
            |servers| servers.iter().all(|s| s.status == ServerStatus::Active),
            |servers| servers.iter().any(|s| s.status == ServerStatus::Error),
        );
        let report = result.report(&settings);
        let ids: Vec<&str> = created.iter().map(|s| s.id.as_str()).collect();

        match (result.exit, result.final_status) {
            (PollExit::Reached, Some(servers)) => {
                info!(count = servers.len(), poll_count = report.poll_count, "servers active");
                Ok((servers, report))
            }
            (PollExit::Terminal, Some(servers)) => {
                let fault = servers
                    .iter()
                    .filter(|s| s.status == ServerStatus::Error)
                    .find_map(|s| s.fault.clone())
                    .unwrap_or_else(|| "server entered ERROR".to_string());
                warn!(reservation_id = %request.reservation_id, fault = %fault, "server launch failed");
                let failure = OperationError::new(CoreError::Backend(fault.clone()));
                let failure = if is_no_valid_host(&fault) {
                    failure.with_detail("reason", "no_valid_host")
                } else {
                    failure
                };
                Err(failure
                    .with_detail("servers", server_summaries(&servers))
                    .with_detail("wait", report_value(&report)))
            }
            (PollExit::FetchFailed, _) | (_, None) => {
                let failure = match result.error {
                    Some(e) => OperationError::from(e),
                    None => OperationError::new(CoreError::Backend(
                        "no server status observed".to_string(),
                    )),
                };
                Err(failure
                    .with_detail("created_server_ids", json!(ids))
                    .with_detail("wait", report_value(&report)))
            }
            (_, Some(servers)) => {
                warn!(reservation_id = %request.reservation_id, "timed out waiting for servers");
                Err(OperationError::new(CoreError::Timeout(format!(
                    "servers did not become ACTIVE within {}s",
                    report.timeout_seconds
                )))
                .with_detail("servers", server_summaries(&servers))
                .with_detail("wait", report_value(&report)))
            }
        }
    }
}

fn not_found(what: &str, name: &str) -> OperationError {
    CoreError::Validation(format!("{what} '{name}' not found")).into()
}

fn is_no_valid_host(message: &str) -> bool {
    message.to_ascii_lowercase().contains("no valid host")
}

fn creation_failure(error: CloudError) -> OperationError {
    let no_valid_host = is_no_valid_host(&error.to_string());
    let failure = OperationError::from(error);
    if no_valid_host {
        failure.with_detail("reason", "no_valid_host")
    } else {
        failure
    }
}

fn server_summaries(servers: &[ServerState]) -> Value {
    Value::Array(
        servers
            .iter()
            .map(|s| json!({ "server_id": s.id, "name": s.name, "status": s.status.as_str() }))
            .collect(),
    )
}

fn node_summaries(nodes: &[NodeState]) -> Value {
    Value::Array(
        nodes
            .iter()
            .map(|n| json!({ "node_id": n.id, "provision_state": n.provision_state }))
            .collect(),
    )
}

fn report_value(report: &PollingReport) -> Value {
    serde_json::to_value(report).unwrap_or(Value::Null)
}

fn record(server: ServerState, ssh_user: &str, key_name: &str) -> ServerRecord {
    ServerRecord {
        server_id: server.id,
        name: server.name,
        status: server.status,
        fixed_ip: server.fixed_ip,
        floating_ip: server.floating_ip,
        ssh_user: ssh_user.to_string(),
        key_name: key_name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::compute::repo::{MockBareMetalRepository, MockComputeRepository, NodePort};
    use crate::features::reservation::repo::MockReservationRepository;
    use envboot_core::{ErrorKind, ReservationStatus, VirtualClock};
    use std::collections::BTreeSet;
    use std::io::Write;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn request(count: u32, wait: u64) -> ServerLaunchRequest {
        ServerLaunchRequest {
            reservation_id: "lease-1".to_string(),
            image: "CC-Ubuntu22.04".to_string(),
            flavor: "baremetal".to_string(),
            network: "sharednet1".to_string(),
            key_name: "my-key".to_string(),
            security_groups: BTreeSet::new(),
            count,
            assign_floating_ip: false,
            name_prefix: "envboot".to_string(),
            user_data: None,
            wait_seconds: wait,
            interval_seconds: 5,
            bare_metal: None,
        }
    }

    fn leases() -> MockReservationRepository {
        let mut leases = MockReservationRepository::new();
        leases.expect_get_lease().returning(|id| {
            Ok(LeaseRecord {
                id: id.to_string(),
                name: None,
                status: ReservationStatus::Active,
                start_date: None,
                end_date: None,
                created_at: None,
                updated_at: None,
                resource_type: Some(ResourceType::PhysicalHost),
                allocated: true,
                reservation_ids: vec!["res-1".to_string()],
                reserved_hosts: Vec::new(),
            })
        });
        leases
    }

    fn state(id: &str, status: ServerStatus) -> ServerState {
        ServerState {
            id: id.to_string(),
            name: id.to_string(),
            status,
            fixed_ip: Some("10.140.0.5".to_string()),
            floating_ip: None,
            fault: None,
        }
    }

    fn resolving_compute() -> MockComputeRepository {
        let mut compute = MockComputeRepository::new();
        compute.expect_find_image().returning(|name| {
            Ok(Some(ImageRecord {
                id: "img-1".to_string(),
                name: name.to_string(),
                status: "active".to_string(),
            }))
        });
        compute.expect_find_flavor().returning(|_| Ok(Some("fl-1".to_string())));
        compute.expect_find_network().returning(|_| Ok(Some("net-1".to_string())));
        compute
    }

    fn service(compute: MockComputeRepository, leases: MockReservationRepository) -> ComputeService {
        ComputeService::new(Arc::new(compute), Arc::new(leases), Arc::new(VirtualClock::new()))
    }

    #[test]
    fn test_dry_run_touches_nothing() {
        let mut compute = MockComputeRepository::new();
        compute.expect_create_server().never();
        let mut leases = MockReservationRepository::new();
        leases.expect_get_lease().never();

        let mut req = request(2, 0);
        req.assign_floating_ip = true;
        let data = service(compute, leases).launch_servers(&req, true).unwrap();

        assert!(data.dry_run);
        assert_eq!(data.servers.len(), 2);
        assert_eq!(data.servers[1].server_id, "sim-server-2");
        assert_eq!(data.servers[1].floating_ip.as_deref(), Some("203.0.113.11"));
        assert_eq!(data.servers[0].ssh_user, "ubuntu");
    }

    #[test]
    fn test_launch_uses_reservation_hint_and_names() {
        let mut compute = resolving_compute();
        let counter = AtomicU32::new(0);
        compute
            .expect_create_server()
            .withf(|spec| spec.reservation_hint == "res-1" && spec.security_groups == ["default"])
            .times(2)
            .returning(move |spec| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let mut created = state(&format!("srv-{n}"), ServerStatus::Build);
                created.name = spec.name.clone();
                Ok(created)
            });

        let data = service(compute, leases()).launch_servers(&request(2, 0), false).unwrap();

        assert_eq!(data.servers[0].name, "envboot-1");
        assert_eq!(data.servers[1].name, "envboot-2");
        assert_eq!(data.servers[0].status, ServerStatus::Build);
        assert_eq!(data.servers[0].ssh_user, "ubuntu");
        assert!(data.wait.is_none());
    }

    #[test]
    fn test_missing_flavor_is_validation_error() {
        let mut compute = MockComputeRepository::new();
        compute.expect_find_image().returning(|_| {
            Ok(Some(ImageRecord {
                id: "img-1".to_string(),
                name: "CC-Ubuntu22.04".to_string(),
                status: "active".to_string(),
            }))
        });
        compute.expect_find_flavor().returning(|_| Ok(None));
        compute.expect_create_server().never();

        let err = service(compute, leases()).launch_servers(&request(1, 0), false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("flavor 'baremetal'"));
    }

    #[test]
    fn test_partial_creation_reports_created_ids() {
        let mut compute = resolving_compute();
        let counter = AtomicU32::new(0);
        compute.expect_create_server().returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(state("srv-0", ServerStatus::Build))
            } else {
                Err(CloudError::Http {
                    status: 400,
                    message: "No valid host was found".to_string(),
                })
            }
        });

        let err = service(compute, leases()).launch_servers(&request(3, 0), false).unwrap_err();
        assert_eq!(err.details["created_server_ids"], json!(["srv-0"]));
        assert_eq!(err.details["failed_index"], json!(1));
        assert_eq!(err.details["reason"], json!("no_valid_host"));
    }

    #[test]
    fn test_wait_until_active_then_attach_floating_ip() {
        let mut compute = resolving_compute();
        compute
            .expect_create_server()
            .returning(|_| Ok(state("srv-1", ServerStatus::Build)));
        let reads = AtomicU32::new(0);
        compute.expect_get_server().returning(move |id| {
            let status = if reads.fetch_add(1, Ordering::SeqCst) < 2 {
                ServerStatus::Build
            } else {
                ServerStatus::Active
            };
            Ok(state(id, status))
        });
        compute
            .expect_attach_floating_ip()
            .times(1)
            .returning(|_| Ok("129.114.0.9".to_string()));

        let mut req = request(1, 60);
        req.assign_floating_ip = true;
        let data = service(compute, leases()).launch_servers(&req, false).unwrap();

        let wait = data.wait.unwrap();
        assert_eq!(wait.poll_count, 3);
        assert_eq!(wait.elapsed_seconds, 10.0);
        assert_eq!(data.servers[0].status, ServerStatus::Active);
        assert_eq!(data.servers[0].floating_ip.as_deref(), Some("129.114.0.9"));
    }

    #[test]
    fn test_error_server_is_terminal() {
        let mut compute = resolving_compute();
        compute
            .expect_create_server()
            .returning(|_| Ok(state("srv-1", ServerStatus::Build)));
        compute.expect_get_server().returning(|id| {
            let mut failed = state(id, ServerStatus::Error);
            failed.fault = Some("No valid host was found. There are not enough hosts available.".to_string());
            Ok(failed)
        });
        compute.expect_attach_floating_ip().never();

        let err = service(compute, leases()).launch_servers(&request(1, 60), false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Backend);
        assert_eq!(err.details["reason"], json!("no_valid_host"));
        assert_eq!(err.details["servers"][0]["status"], json!("ERROR"));
        assert_eq!(err.details["wait"]["poll_count"], json!(1));
    }

    #[test]
    fn test_wait_timeout_reports_last_status() {
        let mut compute = resolving_compute();
        compute
            .expect_create_server()
            .returning(|_| Ok(state("srv-1", ServerStatus::Build)));
        compute
            .expect_get_server()
            .returning(|id| Ok(state(id, ServerStatus::Build)));

        let err = service(compute, leases()).launch_servers(&request(1, 10), false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.details["servers"][0]["status"], json!("BUILD"));
        assert_eq!(err.details["wait"]["poll_count"], json!(3));
    }

    fn bare_metal_request(count: u32, wait: u64) -> ServerLaunchRequest {
        let mut req = request(count, wait);
        req.bare_metal = Some(BareMetalOptions {
            image: "CC-Ubuntu22.04".to_string(),
            ssh_user: "cc".to_string(),
        });
        req
    }

    fn host_leases(resource_type: ResourceType, hosts: &'static [&'static str]) -> MockReservationRepository {
        let mut leases = MockReservationRepository::new();
        leases.expect_get_lease().returning(move |id| {
            Ok(LeaseRecord {
                id: id.to_string(),
                name: None,
                status: ReservationStatus::Active,
                start_date: None,
                end_date: None,
                created_at: None,
                updated_at: None,
                resource_type: Some(resource_type),
                allocated: true,
                reservation_ids: vec!["res-1".to_string()],
                reserved_hosts: hosts.iter().map(ToString::to_string).collect(),
            })
        });
        leases
    }

    fn node(id: &str, state: &str) -> NodeState {
        NodeState {
            id: id.to_string(),
            provision_state: state.to_string(),
            last_error: None,
        }
    }

    fn bare_metal_service(
        compute: MockComputeRepository,
        leases: MockReservationRepository,
        ironic: MockBareMetalRepository,
    ) -> ComputeService {
        service(compute, leases).with_bare_metal(Arc::new(ironic))
    }

    #[test]
    fn test_force_ironic_deploys_reserved_nodes() {
        let mut compute = resolving_compute();
        compute.expect_create_server().never();
        let mut ironic = MockBareMetalRepository::new();
        ironic
            .expect_set_image()
            .withf(|_, image_id| image_id == "img-1")
            .times(2)
            .returning(|_, _| Ok(()));
        ironic.expect_deploy().times(2).returning(|_| Ok(()));
        let reads = AtomicU32::new(0);
        ironic.expect_get_node().returning(move |id| {
            let state = if reads.fetch_add(1, Ordering::SeqCst) < 2 {
                "deploying"
            } else {
                "active"
            };
            Ok(node(id, state))
        });
        ironic.expect_node_port().returning(|id| {
            Ok(Some(NodePort {
                port_id: format!("port-{id}"),
                fixed_ip: Some("10.140.82.7".to_string()),
            }))
        });
        ironic
            .expect_attach_floating_ip()
            .withf(|port_id| port_id == "port-node-a")
            .returning(|_| Ok("129.114.0.20".to_string()));
        ironic
            .expect_attach_floating_ip()
            .withf(|port_id| port_id == "port-node-b")
            .returning(|_| Err(CloudError::Http { status: 409, message: "quota".to_string() }));

        let mut req = bare_metal_request(2, 60);
        req.assign_floating_ip = true;
        let data = bare_metal_service(
            compute,
            host_leases(ResourceType::PhysicalHost, &["node-a", "node-b", "node-c"]),
            ironic,
        )
        .launch_servers(&req, false)
        .unwrap();

        assert_eq!(data.servers.len(), 2);
        assert_eq!(data.servers[0].server_id, "node-a");
        assert_eq!(data.servers[1].name, "envboot-2");
        assert_eq!(data.servers[0].status, ServerStatus::Active);
        assert_eq!(data.servers[0].fixed_ip.as_deref(), Some("10.140.82.7"));
        assert_eq!(data.servers[0].floating_ip.as_deref(), Some("129.114.0.20"));
        assert_eq!(data.servers[1].floating_ip, None);
        assert_eq!(data.servers[1].ssh_user, "cc");
        assert_eq!(data.wait.unwrap().poll_count, 2);
    }

    #[test]
    fn test_force_ironic_without_reserved_nodes_is_not_found() {
        let mut ironic = MockBareMetalRepository::new();
        ironic.expect_deploy().never();

        let err = bare_metal_service(
            resolving_compute(),
            host_leases(ResourceType::PhysicalHost, &[]),
            ironic,
        )
        .launch_servers(&bare_metal_request(1, 0), false)
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().contains("no reserved nodes"));
    }

    #[test]
    fn test_force_ironic_unknown_image_is_validation_error() {
        let mut compute = MockComputeRepository::new();
        compute.expect_find_image().returning(|_| Ok(None));
        let mut ironic = MockBareMetalRepository::new();
        ironic.expect_deploy().never();

        let err = bare_metal_service(compute, host_leases(ResourceType::PhysicalHost, &["node-a"]), ironic)
            .launch_servers(&bare_metal_request(1, 0), false)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("bare metal image"));
    }

    #[test]
    fn test_force_ironic_failed_deploy_is_terminal() {
        let mut ironic = MockBareMetalRepository::new();
        ironic.expect_set_image().returning(|_, _| Err(CloudError::Http { status: 400, message: "locked".to_string() }));
        ironic.expect_deploy().returning(|_| Ok(()));
        ironic.expect_get_node().returning(|id| {
            let mut failed = node(id, "deploy failed");
            failed.last_error = Some("Timeout reached while waiting for callback".to_string());
            Ok(failed)
        });
        ironic.expect_node_port().never();

        let err = bare_metal_service(
            resolving_compute(),
            host_leases(ResourceType::PhysicalHost, &["node-a"]),
            ironic,
        )
        .launch_servers(&bare_metal_request(1, 60), false)
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Backend);
        assert!(err.to_string().contains("waiting for callback"));
        assert_eq!(err.details["nodes"][0]["provision_state"], json!("deploy failed"));
        assert_eq!(err.details["wait"]["poll_count"], json!(1));
    }

    #[test]
    fn test_force_ironic_times_out_with_node_states() {
        let mut ironic = MockBareMetalRepository::new();
        ironic.expect_set_image().returning(|_, _| Ok(()));
        ironic.expect_deploy().returning(|_| Ok(()));
        ironic.expect_get_node().returning(|id| Ok(node(id, "wait call-back")));

        let err = bare_metal_service(
            resolving_compute(),
            host_leases(ResourceType::PhysicalHost, &["node-a"]),
            ironic,
        )
        .launch_servers(&bare_metal_request(1, 10), false)
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.details["nodes"][0]["node_id"], json!("node-a"));
        assert_eq!(err.details["wait"]["poll_count"], json!(3));
    }

    #[test]
    fn test_force_ironic_on_instance_lease_boots_through_nova() {
        let mut compute = resolving_compute();
        compute
            .expect_create_server()
            .times(1)
            .returning(|_| Ok(state("srv-1", ServerStatus::Build)));
        let mut ironic = MockBareMetalRepository::new();
        ironic.expect_deploy().never();

        let data = bare_metal_service(
            compute,
            host_leases(ResourceType::VirtualInstance, &[]),
            ironic,
        )
        .launch_servers(&bare_metal_request(1, 0), false)
        .unwrap();
        assert_eq!(data.servers[0].server_id, "srv-1");
        assert_eq!(data.servers[0].ssh_user, "ubuntu");
    }

    #[test]
    fn test_ensure_keypair_imports_public_key() {
        let mut key = tempfile::NamedTempFile::new().unwrap();
        writeln!(key, "ssh-ed25519 AAAA operator@host").unwrap();

        let mut compute = MockComputeRepository::new();
        compute.expect_keypair_exists().returning(|_| Ok(false));
        compute
            .expect_import_keypair()
            .withf(|name, public_key| name == "my-key" && public_key.starts_with("ssh-ed25519"))
            .times(1)
            .returning(|_, _| Ok(()));

        let outcome = service(compute, MockReservationRepository::new())
            .ensure_keypair("my-key", Some(key.path()))
            .unwrap();
        assert_eq!(outcome, KeypairOutcome::Imported);
    }

    #[test]
    fn test_missing_keypair_without_file_is_validation_error() {
        let mut compute = MockComputeRepository::new();
        compute.expect_keypair_exists().returning(|_| Ok(false));
        let err = service(compute, MockReservationRepository::new())
            .ensure_keypair("my-key", None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
