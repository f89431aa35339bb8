use crate::features::advisor::service::{Advice, AdvisorService, DEFAULT_IMAGE};
use crate::features::capacity::service::CapacityService;
use crate::features::compute::service::ComputeService;
use crate::features::reservation::service::{default_lease_name, ReservationService};
use crate::features::workspace::service::{environment_files, WorkspaceService};
use chrono::{Duration as ChronoDuration, Utc};
use envboot_core::payload::{Decision, DecisionSource, ForgeData, LeaseData, Requirements};
use envboot_core::timefmt::format_utc;
use envboot_core::{
    CoreError, OperationError, PollSettings, ProvisionRequest, ReservationRequest, ResourceType,
    ServerLaunchRequest, ServerRecord,
};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const FORGE_FLAVOR: &str = "baremetal";
pub const LEASE_START_DELAY_MINUTES: i64 = 2;
pub const LEASE_WAIT: Duration = Duration::from_secs(300);
pub const LEASE_POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const SERVER_WAIT: Duration = Duration::from_secs(1800);
pub const SERVER_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const CHECKOUT_TIMEOUT_SECONDS: u64 = 600;

/// Operator defaults for the one-shot flow, read from `DEFAULT_*` variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForgeDefaults {
    pub key_name: String,
    pub key_path: PathBuf,
    pub network: String,
    pub site: String,
}

impl ForgeDefaults {
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| {
            lookup(key)
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        Self {
            key_name: get("DEFAULT_KEY_NAME", "my-key"),
            key_path: expand_home(&get("DEFAULT_KEY_PATH", "~/.ssh/id_rsa.pub"), lookup("HOME")),
            network: get("DEFAULT_NETWORK", "sharednet1"),
            site: get("DEFAULT_SITE", "uc"),
        }
    }
}

fn expand_home(path: &str, home: Option<String>) -> PathBuf {
    match (path.strip_prefix("~/"), home) {
        (Some(rest), Some(home)) => Path::new(&home).join(rest),
        _ => PathBuf::from(path),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForgeRequest {
    pub repo: String,
    pub branch: String,
    pub zone: String,
    pub node_type: Option<String>,
    pub key_name: String,
    pub key_path: Option<PathBuf>,
    pub network: String,
    pub lease_name: Option<String>,
    pub server_name: Option<String>,
    pub assign_floating_ip: bool,
    pub skip_analysis: bool,
    pub workdir: String,
    /// Directory for `<server>_info.json`.
    pub info_out: Option<PathBuf>,
}

struct Plan {
    requirements: Requirements,
    decisions: Vec<Decision>,
    image: String,
    node_type: String,
    duration_hours: u32,
}

/// Repository to running bare-metal server in one pass: analyze, decide,
/// reserve, launch.
pub struct ForgeService {
    workspace: WorkspaceService,
    advisor: AdvisorService,
    capacity: CapacityService,
    reservations: ReservationService,
    compute: ComputeService,
}

impl ForgeService {
    pub fn new(
        workspace: WorkspaceService,
        advisor: AdvisorService,
        capacity: CapacityService,
        reservations: ReservationService,
        compute: ComputeService,
    ) -> Self {
        Self {
            workspace,
            advisor,
            capacity,
            reservations,
            compute,
        }
    }

    pub fn forge(&self, request: &ForgeRequest, dry_run: bool) -> Result<ForgeData, OperationError> {
        if request.repo.trim().is_empty() {
            return Err(CoreError::Validation("repo is required".to_string()).into());
        }
        let lease_name = request
            .lease_name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| default_lease_name(&Utc::now()));

        let plan = if dry_run {
            self.default_plan(request)
        } else {
            self.plan(request, &lease_name)?
        };
        info!(
            image = %plan.image,
            node_type = %plan.node_type,
            duration_hours = plan.duration_hours,
            dry_run,
            "forge plan ready"
        );

        if !dry_run {
            let outcome = self
                .compute
                .ensure_keypair(&request.key_name, request.key_path.as_deref())?;
            info!(keypair = %request.key_name, outcome = outcome.as_str(), "keypair ready");
        }

        let lease = self.reserve(request, &plan, &lease_name, dry_run)?;
        let server = self
            .launch(request, &plan, &lease, dry_run)
            .map_err(|failure| failure.with_detail("lease_id", lease.reservation_id.clone()))?;

        let ssh_command = server.floating_ip.as_ref().map(|ip| {
            let login = format!("{}@{ip}", server.ssh_user);
            match request.key_path.as_deref().and_then(private_key_for) {
                Some(private) => format!("ssh -i {} {login}", private.display()),
                None => format!("ssh {login}"),
            }
        });

        let data = ForgeData {
            repo: request.repo.clone(),
            requirements: plan.requirements,
            decisions: plan.decisions,
            image: plan.image,
            node_type: plan.node_type,
            duration_hours: plan.duration_hours,
            lease,
            floating_ip: server.floating_ip.clone(),
            server,
            ssh_command,
            dry_run,
        };

        if let Some(dir) = &request.info_out {
            write_info(dir, &data);
        }
        Ok(data)
    }

    fn default_plan(&self, request: &ForgeRequest) -> Plan {
        let requirements = Requirements::default();
        let image = Advice {
            value: DEFAULT_IMAGE.to_string(),
            source: DecisionSource::Default,
            reasoning: Some("dry run".to_string()),
        };
        let node_type = AdvisorService::disabled().choose_node_type(
            request.node_type.as_deref(),
            &requirements,
            &BTreeSet::new(),
        );
        let duration = AdvisorService::disabled().lease_duration(&requirements);
        Plan {
            decisions: vec![
                requirements_decision(DecisionSource::Default, Some("dry run".to_string())),
                image.decision("image"),
                node_type.decision("node_type"),
                duration.decision("duration_hours"),
            ],
            requirements,
            image: image.value,
            node_type: node_type.value,
            duration_hours: duration.value,
        }
    }

    fn plan(&self, request: &ForgeRequest, lease_name: &str) -> Result<Plan, OperationError> {
        let analysis = if request.skip_analysis {
            Advice {
                value: Requirements::default(),
                source: DecisionSource::Operator,
                reasoning: Some("analysis skipped".to_string()),
            }
        } else {
            let files = self.fetch_sources(request, lease_name)?;
            self.advisor.analyze(&files)
        };
        let requirements = analysis.value;

        let image = self.advisor.select_image(&requirements, &self.compute.images()?)?;
        let available = self.capacity.node_types().unwrap_or_else(|failure| {
            warn!(error = %failure, "node types unavailable");
            BTreeSet::new()
        });
        let node_type =
            self.advisor
                .choose_node_type(request.node_type.as_deref(), &requirements, &available);
        let duration = self.advisor.lease_duration(&requirements);

        Ok(Plan {
            decisions: vec![
                requirements_decision(analysis.source, analysis.reasoning),
                image.decision("image"),
                node_type.decision("node_type"),
                duration.decision("duration_hours"),
            ],
            requirements,
            image: image.value,
            node_type: node_type.value,
            duration_hours: duration.value,
        })
    }

    fn fetch_sources(
        &self,
        request: &ForgeRequest,
        lease_name: &str,
    ) -> Result<BTreeMap<String, String>, OperationError> {
        let provisioned = self.workspace.checkout(&ProvisionRequest {
            reservation_id: lease_name.to_string(),
            repo: request.repo.clone(),
            branch: request.branch.clone(),
            workdir: request.workdir.clone(),
            timeout_seconds: CHECKOUT_TIMEOUT_SECONDS,
        })?;
        let files = environment_files(&provisioned.checkout);
        info!(files = files.len(), checkout = %provisioned.checkout.display(), "environment files collected");
        Ok(files)
    }

    fn reserve(
        &self,
        request: &ForgeRequest,
        plan: &Plan,
        lease_name: &str,
        dry_run: bool,
    ) -> Result<LeaseData, OperationError> {
        // Planning can outlast the start delay, so the window opens from now.
        let start = Utc::now() + ChronoDuration::minutes(LEASE_START_DELAY_MINUTES);
        let reservation = ReservationRequest {
            zone: request.zone.clone(),
            start: format_utc(&start),
            duration_minutes: plan.duration_hours * 60,
            node_count: 1,
            resource_type: ResourceType::PhysicalHost,
            name: Some(lease_name.to_string()),
            resource_properties: Some(node_type_filter(&plan.node_type)),
        };
        let wait = PollSettings {
            timeout: LEASE_WAIT,
            interval: LEASE_POLL_INTERVAL,
        };
        self.reservations.create_reservation(&reservation, wait, dry_run)
    }

    fn launch(
        &self,
        request: &ForgeRequest,
        plan: &Plan,
        lease: &LeaseData,
        dry_run: bool,
    ) -> Result<ServerRecord, OperationError> {
        let launch = ServerLaunchRequest {
            reservation_id: lease.reservation_id.clone(),
            image: plan.image.clone(),
            flavor: FORGE_FLAVOR.to_string(),
            network: request.network.clone(),
            key_name: request.key_name.clone(),
            security_groups: BTreeSet::new(),
            count: 1,
            assign_floating_ip: request.assign_floating_ip,
            name_prefix: request
                .server_name
                .clone()
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| lease.name.clone()),
            user_data: None,
            wait_seconds: SERVER_WAIT.as_secs(),
            interval_seconds: SERVER_POLL_INTERVAL.as_secs(),
            bare_metal: None,
        };
        let data = self.compute.launch_servers(&launch, dry_run)?;
        data.servers.into_iter().next().ok_or_else(|| {
            CoreError::Backend("launch returned no server".to_string()).into()
        })
    }
}

/// Blazar resource filter pinning hosts to one node type.
pub fn node_type_filter(node_type: &str) -> String {
    serde_json::json!(["=", "$node_type", node_type]).to_string()
}

fn requirements_decision(source: DecisionSource, reasoning: Option<String>) -> Decision {
    Decision {
        step: "requirements".to_string(),
        value: match source {
            DecisionSource::Ai => "inferred",
            DecisionSource::Operator => "skipped",
            DecisionSource::Default => "defaults",
        }
        .to_string(),
        source,
        reasoning,
    }
}

fn private_key_for(public_key: &Path) -> Option<PathBuf> {
    (public_key.extension()? == "pub").then(|| public_key.with_extension(""))
}

fn write_info(dir: &Path, data: &ForgeData) {
    let path = dir.join(format!("{}_info.json", data.server.name));
    let written = serde_json::to_string_pretty(data)
        .map_err(|e| e.to_string())
        .and_then(|body| fs::write(&path, body).map_err(|e| e.to_string()));
    match written {
        Ok(()) => info!(path = %path.display(), "server info written"),
        Err(e) => warn!(path = %path.display(), error = %e, "failed to write server info"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::CloudError;
    use crate::features::capacity::repo::{HostRecord, MockCapacityRepository};
    use crate::features::compute::repo::{ImageRecord, MockComputeRepository, ServerState};
    use crate::features::reservation::repo::MockReservationRepository;
    use crate::features::advisor::repo::{AdvisorError, MockAdvisorRepository};
    use crate::features::workspace::repo::{
        LocalWorkspaceRepository, MockWorkspaceRepository, WorkspaceRepository,
    };
    use envboot_core::{LeaseRecord, ReservationStatus, ServerStatus, VirtualClock};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn request(repo: &str) -> ForgeRequest {
        ForgeRequest {
            repo: repo.to_string(),
            branch: "main".to_string(),
            zone: "uc".to_string(),
            node_type: None,
            key_name: "my-key".to_string(),
            key_path: None,
            network: "sharednet1".to_string(),
            lease_name: Some("forge-demo".to_string()),
            server_name: None,
            assign_floating_ip: true,
            skip_analysis: true,
            workdir: "/tmp/envagent".to_string(),
            info_out: None,
        }
    }

    fn lease(status: ReservationStatus) -> LeaseRecord {
        LeaseRecord {
            id: "lease-9".to_string(),
            name: Some("forge-demo".to_string()),
            status,
            start_date: None,
            end_date: None,
            created_at: None,
            updated_at: None,
            resource_type: Some(ResourceType::PhysicalHost),
            allocated: true,
            reservation_ids: vec!["res-9".to_string()],
            reserved_hosts: Vec::new(),
        }
    }

    struct Mocks {
        workspace: MockWorkspaceRepository,
        capacity: MockCapacityRepository,
        leases: MockReservationRepository,
        compute: MockComputeRepository,
    }

    impl Mocks {
        fn untouched() -> Self {
            let mut workspace = MockWorkspaceRepository::new();
            workspace.expect_reset().never();
            let mut capacity = MockCapacityRepository::new();
            capacity.expect_list_hosts().never();
            let mut leases = MockReservationRepository::new();
            leases.expect_create_lease().never();
            leases.expect_get_lease().never();
            let mut compute = MockComputeRepository::new();
            compute.expect_create_server().never();
            compute.expect_keypair_exists().never();
            Self {
                workspace,
                capacity,
                leases,
                compute,
            }
        }

        fn service(self) -> ForgeService {
            assemble(
                Arc::new(self.workspace),
                AdvisorService::disabled(),
                self.capacity,
                self.leases,
                self.compute,
            )
        }

        /// Swaps in a real workspace and the given advisor.
        fn with(self, workspace: Arc<dyn WorkspaceRepository>, advisor: AdvisorService) -> ForgeService {
            assemble(workspace, advisor, self.capacity, self.leases, self.compute)
        }
    }

    fn assemble(
        workspace: Arc<dyn WorkspaceRepository>,
        advisor: AdvisorService,
        capacity: MockCapacityRepository,
        leases: MockReservationRepository,
        compute: MockComputeRepository,
    ) -> ForgeService {
        let clock = Arc::new(VirtualClock::new());
        let leases = Arc::new(leases);
        ForgeService::new(
            WorkspaceService::new(workspace, clock.clone()),
            advisor,
            CapacityService::new(Arc::new(capacity), "uc"),
            ReservationService::new(leases.clone(), clock.clone()),
            ComputeService::new(Arc::new(compute), leases, clock),
        )
    }

    fn live_mocks() -> Mocks {
        let mut mocks = cloud_mocks();
        mocks.compute.expect_keypair_exists().returning(|_| Ok(true));
        mocks
            .leases
            .expect_create_lease()
            .withf(|spec| {
                spec.resource_properties.as_deref() == Some(r#"["=","$node_type","compute_cascadelake_r640"]"#)
                    && spec.end - spec.start == ChronoDuration::hours(24)
            })
            .returning(|_| Ok(lease(ReservationStatus::Pending)));
        mocks
    }

    /// Everything but the keypair check and lease creation.
    fn cloud_mocks() -> Mocks {
        let mut capacity = MockCapacityRepository::new();
        capacity.expect_list_hosts().returning(|| {
            Ok(vec![HostRecord {
                id: "1".to_string(),
                uuid: "uuid-1".to_string(),
                hostname: "node-1".to_string(),
                node_type: Some("compute_skylake".to_string()),
                zone: None,
            }])
        });

        let mut leases = MockReservationRepository::new();
        leases
            .expect_get_lease()
            .returning(|_| Ok(lease(ReservationStatus::Active)));

        let mut compute = MockComputeRepository::new();
        compute.expect_list_images().returning(|| {
            Ok(vec![ImageRecord {
                id: "img-1".to_string(),
                name: "CC-Ubuntu22.04".to_string(),
                status: "active".to_string(),
            }])
        });
        compute.expect_find_image().returning(|_| {
            Ok(Some(ImageRecord {
                id: "img-1".to_string(),
                name: "CC-Ubuntu22.04".to_string(),
                status: "active".to_string(),
            }))
        });
        compute.expect_find_flavor().returning(|_| Ok(Some("fl-bm".to_string())));
        compute.expect_find_network().returning(|_| Ok(Some("net-1".to_string())));

        Mocks {
            workspace: MockWorkspaceRepository::new(),
            capacity,
            leases,
            compute,
        }
    }

    fn active_server(id: &str) -> ServerState {
        ServerState {
            id: id.to_string(),
            name: "forge-demo".to_string(),
            status: ServerStatus::Active,
            fixed_ip: Some("10.140.0.7".to_string()),
            floating_ip: None,
            fault: None,
        }
    }

    #[test]
    fn test_dry_run_uses_defaults_and_simulator() {
        let mut req = request("https://github.com/org/repo.git");
        req.skip_analysis = false;
        let data = Mocks::untouched().service().forge(&req, true).unwrap();

        assert!(data.dry_run);
        assert_eq!(data.image, DEFAULT_IMAGE);
        assert_eq!(data.node_type, "compute_cascadelake_r640");
        assert_eq!(data.duration_hours, 24);
        assert!(data.decisions.iter().all(|d| d.source == DecisionSource::Default));
        assert!(data.lease.reservation_id.starts_with("sim-lease-"));
        assert_eq!(data.server.server_id, "sim-server-1");
        assert_eq!(data.floating_ip.as_deref(), Some("203.0.113.10"));
        assert_eq!(data.ssh_command.as_deref(), Some("ssh ubuntu@203.0.113.10"));
    }

    #[test]
    fn test_operator_node_type_is_kept() {
        let mut req = request("https://github.com/org/repo.git");
        req.node_type = Some("gpu_rtx_6000".to_string());
        let data = Mocks::untouched().service().forge(&req, true).unwrap();

        assert_eq!(data.node_type, "gpu_rtx_6000");
        let decision = data.decisions.iter().find(|d| d.step == "node_type").unwrap();
        assert_eq!(decision.source, DecisionSource::Operator);
    }

    #[test]
    fn test_live_flow_reserves_and_launches() {
        let mut mocks = live_mocks();
        mocks
            .compute
            .expect_create_server()
            .withf(|spec| spec.reservation_hint == "res-9" && spec.flavor_id == "fl-bm")
            .returning(|_| Ok(active_server("srv-1")));
        mocks
            .compute
            .expect_get_server()
            .returning(|id| Ok(active_server(id)));
        mocks
            .compute
            .expect_attach_floating_ip()
            .returning(|_| Ok("129.114.0.20".to_string()));

        let dir = tempfile::tempdir().unwrap();
        let mut req = request("https://github.com/org/repo.git");
        req.key_path = Some(PathBuf::from("/home/cc/.ssh/id_rsa.pub"));
        req.info_out = Some(dir.path().to_path_buf());

        let data = mocks.service().forge(&req, false).unwrap();

        assert_eq!(data.lease.reservation_id, "lease-9");
        assert_eq!(data.server.server_id, "srv-1");
        assert_eq!(data.floating_ip.as_deref(), Some("129.114.0.20"));
        assert_eq!(
            data.ssh_command.as_deref(),
            Some("ssh -i /home/cc/.ssh/id_rsa ubuntu@129.114.0.20")
        );
        let info: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(dir.path().join("forge-demo_info.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(info["server"]["server_id"], json!("srv-1"));
    }

    #[test]
    fn test_launch_failure_reports_lease_for_cleanup() {
        let mut mocks = live_mocks();
        mocks.compute.expect_create_server().returning(|_| {
            Err(CloudError::Http {
                status: 500,
                message: "No valid host was found.".to_string(),
            })
        });

        let err = mocks
            .service()
            .forge(&request("https://github.com/org/repo.git"), false)
            .unwrap_err();

        assert_eq!(err.details["lease_id"], json!("lease-9"));
        assert_eq!(err.details["reason"], json!("no_valid_host"));
    }

    fn expect_server(mocks: &mut Mocks) {
        mocks
            .compute
            .expect_create_server()
            .returning(|_| Ok(active_server("srv-1")));
        mocks
            .compute
            .expect_get_server()
            .returning(|id| Ok(active_server(id)));
    }

    #[test]
    fn test_lease_starts_after_slow_planning() {
        let mut mocks = cloud_mocks();
        expect_server(&mut mocks);
        let planned_at = Arc::new(Mutex::new(None));
        let stamp = planned_at.clone();
        mocks.compute.expect_keypair_exists().returning(move |_| {
            // Keypair lookup is the last step before the lease.
            std::thread::sleep(Duration::from_millis(1100));
            *stamp.lock().unwrap() = Some(Utc::now());
            Ok(true)
        });
        let requested_start = Arc::new(Mutex::new(None));
        let seen = requested_start.clone();
        mocks.leases.expect_create_lease().returning(move |spec| {
            *seen.lock().unwrap() = Some(spec.start);
            Ok(lease(ReservationStatus::Pending))
        });

        let mut req = request("https://github.com/org/repo.git");
        req.assign_floating_ip = false;
        mocks.service().forge(&req, false).unwrap();

        let planned_at = planned_at.lock().unwrap().unwrap();
        let start = requested_start.lock().unwrap().unwrap();
        let earliest = planned_at + ChronoDuration::minutes(LEASE_START_DELAY_MINUTES)
            - ChronoDuration::seconds(1);
        assert!(start > earliest, "start {start} is older than {earliest}");
    }

    #[test]
    fn test_failed_analysis_is_recorded_as_default() {
        let mut mocks = live_mocks();
        expect_server(&mut mocks);

        let source = tempfile::tempdir().unwrap();
        fs::write(source.path().join("requirements.txt"), "torch==2.1\n").unwrap();
        let workdir = tempfile::tempdir().unwrap();

        let mut advisor = MockAdvisorRepository::new();
        advisor
            .expect_complete()
            .returning(|_, _, _| Err(AdvisorError::Transport("connection refused".to_string())));

        let mut req = request(&source.path().display().to_string());
        req.skip_analysis = false;
        req.assign_floating_ip = false;
        req.workdir = workdir.path().join("work").display().to_string();

        let data = mocks
            .with(
                Arc::new(LocalWorkspaceRepository::new()),
                AdvisorService::new(Arc::new(advisor)),
            )
            .forge(&req, false)
            .unwrap();

        let analysis = data.decisions.iter().find(|d| d.step == "requirements").unwrap();
        assert_eq!(analysis.source, DecisionSource::Default);
        assert_eq!(analysis.value, "defaults");
        assert!(data.decisions.iter().all(|d| d.source == DecisionSource::Default));
        assert_eq!(data.requirements, Requirements::default());
    }

    #[test]
    fn test_node_type_filter_and_key_paths() {
        assert_eq!(node_type_filter("gpu_rtx_6000"), r#"["=","$node_type","gpu_rtx_6000"]"#);
        assert_eq!(
            private_key_for(Path::new("/k/id_ed25519.pub")),
            Some(PathBuf::from("/k/id_ed25519"))
        );
        assert_eq!(private_key_for(Path::new("/k/id_ed25519")), None);
    }

    #[test]
    fn test_defaults_expand_home() {
        let defaults = ForgeDefaults::from_lookup(|key| match key {
            "HOME" => Some("/home/cc".to_string()),
            "DEFAULT_SITE" => Some("tacc".to_string()),
            _ => None,
        });
        assert_eq!(defaults.key_path, PathBuf::from("/home/cc/.ssh/id_rsa.pub"));
        assert_eq!(defaults.site, "tacc");
        assert_eq!(defaults.network, "sharednet1");
        assert_eq!(defaults.key_name, "my-key");
    }
}
