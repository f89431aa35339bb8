mod config;

use clap::{Args, Parser, Subcommand};
use envboot_core::{
    BareMetalOptions, CapacityQuery, Clock, CoreError, DeleteRequest, EnvelopeBuilder, OperationEnvelope,
    OperationError, ProvisionRequest, ReservationHandle, ReservationRequest, ReservationStatus,
    ResourceType, ServerLaunchRequest, StatusQuery, SystemClock,
};
use envboot_providers::cloud::OpenStackSession;
use envboot_providers::features::forge::service::ForgeRequest;
use envboot_providers::features::{capacity, compute, forge, reservation, workspace};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{Settings, StartupError};

#[derive(Parser, Debug)]
#[command(name = "envboot")]
#[command(about = "Reserve, provision and launch bare-metal environments on OpenStack/Blazar", long_about = None)]
struct Cli {
    /// Log filter, e.g. `info` or `envboot_providers=debug` (default: RUST_LOG, then warn)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Load environment variables from this file instead of ./.env
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Per-request HTTP timeout (default: ENVBOOT_HTTP_TIMEOUT_SECS, then 60)
    #[arg(long, global = true)]
    http_timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Free hosts in a zone for a time window
    Capacity {
        #[command(flatten)]
        window: WindowArgs,
        #[arg(long)]
        dry_run: bool,
    },

    /// Create a lease
    LeaseCreate {
        #[command(flatten)]
        window: WindowArgs,
        #[arg(long, default_value_t = 1)]
        nodes: u32,
        #[arg(long, default_value = "physical:host")]
        resource_type: ResourceType,
        #[arg(long)]
        name: Option<String>,
        /// Blazar filter, e.g. '["=", "$node_type", "gpu_rtx_6000"]'
        #[arg(long)]
        resource_properties: Option<String>,
        #[command(flatten)]
        wait: WaitArgs,
        #[arg(long)]
        dry_run: bool,
    },

    /// Read a lease, optionally waiting for a status
    LeaseStatus {
        #[command(flatten)]
        lease: LeaseArgs,
        #[arg(long, default_value = "ACTIVE")]
        target: ReservationStatus,
        #[command(flatten)]
        wait: WaitArgs,
        #[arg(long)]
        dry_run: bool,
    },

    /// Delete a lease
    LeaseDelete {
        #[command(flatten)]
        lease: LeaseArgs,
        /// Required outside dry-run
        #[arg(long)]
        confirm: bool,
        #[arg(long)]
        treat_not_found_as_ok: bool,
        #[command(flatten)]
        wait: WaitArgs,
        #[arg(long)]
        dry_run: bool,
    },

    /// Copy or clone a repository into a local workdir
    Provision {
        #[arg(long)]
        reservation_id: String,
        /// Local directory or git URL
        #[arg(long)]
        repo: String,
        #[arg(long, default_value = "main")]
        branch: String,
        #[arg(long, default_value = "/tmp/envagent")]
        workdir: String,
        #[arg(long, default_value_t = 600)]
        timeout: u64,
        #[arg(long)]
        dry_run: bool,
    },

    /// Launch servers on a reservation
    Launch {
        #[arg(long)]
        reservation_id: String,
        #[arg(long)]
        image: String,
        #[arg(long)]
        flavor: String,
        /// Defaults to DEFAULT_NETWORK
        #[arg(long)]
        network: Option<String>,
        /// Defaults to DEFAULT_KEY_NAME
        #[arg(long)]
        key_name: Option<String>,
        /// Repeatable; `default` when omitted
        #[arg(long = "security-group")]
        security_groups: Vec<String>,
        #[arg(long, default_value_t = 1)]
        count: u32,
        #[arg(long)]
        assign_floating_ip: bool,
        #[arg(long, default_value = "envboot")]
        name_prefix: String,
        /// cloud-init user data file
        #[arg(long)]
        user_data: Option<PathBuf>,
        /// Deploy the lease's Ironic nodes directly (physical:host leases only)
        #[arg(long)]
        force_ironic: bool,
        /// Image written to the nodes; required with --force-ironic
        #[arg(long)]
        bm_image: Option<String>,
        #[arg(long, default_value = "ubuntu")]
        bm_ssh_user: String,
        #[command(flatten)]
        wait: WaitArgs,
        #[arg(long)]
        dry_run: bool,
    },

    /// Analyze a repository, then reserve and launch a matching server
    Forge {
        #[arg(long)]
        repo: String,
        #[arg(long, default_value = "main")]
        branch: String,
        /// Defaults to DEFAULT_SITE
        #[arg(long)]
        site: Option<String>,
        #[arg(long)]
        node_type: Option<String>,
        #[arg(long)]
        key_name: Option<String>,
        /// Public key imported when the keypair is missing
        #[arg(long)]
        key_path: Option<PathBuf>,
        #[arg(long)]
        network: Option<String>,
        #[arg(long)]
        lease_name: Option<String>,
        #[arg(long)]
        server_name: Option<String>,
        #[arg(long)]
        no_floating_ip: bool,
        #[arg(long)]
        skip_analysis: bool,
        #[arg(long, default_value = "/tmp/envagent")]
        workdir: String,
        /// Directory for <server>_info.json
        #[arg(long)]
        info_out: Option<PathBuf>,
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Args, Debug)]
struct WindowArgs {
    /// Defaults to DEFAULT_SITE
    #[arg(long)]
    zone: Option<String>,
    /// UTC start, e.g. "2025-11-05 12:00" or 2025-11-05T12:00:00Z
    #[arg(long)]
    start: String,
    /// Minutes
    #[arg(long)]
    duration: u32,
}

#[derive(Args, Debug)]
struct LeaseArgs {
    #[arg(long)]
    reservation_id: String,
    #[arg(long)]
    zone: Option<String>,
}

#[derive(Args, Debug)]
struct WaitArgs {
    /// Seconds to poll for; 0 reads once
    #[arg(long, default_value_t = 0)]
    wait: u64,
    #[arg(long, default_value_t = 5)]
    interval: u64,
}

fn main() -> Result<(), StartupError> {
    let cli = Cli::parse();
    let env_file = config::load_env_file(cli.env_file.as_deref());
    config::init_logging(cli.log_level.as_deref())?;
    env_file.log();

    let settings = Settings::from_env(cli.http_timeout_secs);
    let code = run(cli.command, &settings)?;
    std::process::exit(code);
}

fn run(command: Command, settings: &Settings) -> serde_json::Result<i32> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let defaults = &settings.defaults;

    match command {
        Command::Capacity { window, dry_run } => {
            let zone = window.zone.unwrap_or_else(|| defaults.site.clone());
            let query = CapacityQuery {
                zone,
                start: window.start,
                duration_minutes: window.duration,
            };
            with_session(settings, |session| {
                capacity::blazar_controller(session, &defaults.site).check(query, dry_run)
            })
        }
        Command::LeaseCreate {
            window,
            nodes,
            resource_type,
            name,
            resource_properties,
            wait,
            dry_run,
        } => {
            let request = ReservationRequest {
                zone: window.zone.unwrap_or_else(|| defaults.site.clone()),
                start: window.start,
                duration_minutes: window.duration,
                node_count: nodes,
                resource_type,
                name,
                resource_properties,
            };
            with_session(settings, |session| {
                reservation::blazar_controller(session, clock).create(
                    request,
                    wait.wait,
                    wait.interval,
                    dry_run,
                )
            })
        }
        Command::LeaseStatus {
            lease,
            target,
            wait,
            dry_run,
        } => {
            let query = StatusQuery {
                handle: ReservationHandle::new(lease.reservation_id, lease.zone),
                wait_seconds: wait.wait,
                interval_seconds: wait.interval,
                target,
            };
            with_session(settings, |session| {
                reservation::blazar_controller(session, clock).status(query, dry_run)
            })
        }
        Command::LeaseDelete {
            lease,
            confirm,
            treat_not_found_as_ok,
            wait,
            dry_run,
        } => {
            let request = DeleteRequest {
                handle: ReservationHandle::new(lease.reservation_id, lease.zone),
                confirm,
                wait_seconds: wait.wait,
                interval_seconds: wait.interval,
                treat_not_found_as_ok,
            };
            with_session(settings, |session| {
                reservation::blazar_controller(session, clock).delete(request, dry_run)
            })
        }
        Command::Provision {
            reservation_id,
            repo,
            branch,
            workdir,
            timeout,
            dry_run,
        } => {
            let request = ProvisionRequest {
                reservation_id,
                repo,
                branch,
                workdir,
                timeout_seconds: timeout,
            };
            emit(&workspace::local_controller(clock).provision(request, dry_run))
        }
        Command::Launch {
            reservation_id,
            image,
            flavor,
            network,
            key_name,
            security_groups,
            count,
            assign_floating_ip,
            name_prefix,
            user_data,
            force_ironic,
            bm_image,
            bm_ssh_user,
            wait,
            dry_run,
        } => {
            let user_data = match user_data.map(|path| read_user_data(&path)).transpose() {
                Ok(user_data) => user_data,
                Err(failure) => return emit(&failed::<envboot_core::payload::LaunchData>(failure)),
            };
            let request = ServerLaunchRequest {
                reservation_id,
                image,
                flavor,
                network: network.unwrap_or_else(|| defaults.network.clone()),
                key_name: key_name.unwrap_or_else(|| defaults.key_name.clone()),
                security_groups: security_groups.into_iter().collect::<BTreeSet<_>>(),
                count,
                assign_floating_ip,
                name_prefix,
                user_data,
                wait_seconds: wait.wait,
                interval_seconds: wait.interval,
                bare_metal: force_ironic.then(|| BareMetalOptions {
                    image: bm_image.unwrap_or_default(),
                    ssh_user: bm_ssh_user,
                }),
            };
            with_session(settings, |session| {
                compute::nova_controller(session, clock).launch(request, dry_run)
            })
        }
        Command::Forge {
            repo,
            branch,
            site,
            node_type,
            key_name,
            key_path,
            network,
            lease_name,
            server_name,
            no_floating_ip,
            skip_analysis,
            workdir,
            info_out,
            dry_run,
        } => {
            let request = ForgeRequest {
                repo,
                branch,
                zone: site.unwrap_or_else(|| defaults.site.clone()),
                node_type,
                key_name: key_name.unwrap_or_else(|| defaults.key_name.clone()),
                key_path: key_path.or_else(|| Some(defaults.key_path.clone())),
                network: network.unwrap_or_else(|| defaults.network.clone()),
                lease_name,
                server_name,
                assign_floating_ip: !no_floating_ip,
                skip_analysis,
                workdir,
                info_out,
            };
            with_session(settings, |session| {
                forge::openstack_controller(session, clock, &defaults.site, settings.http_timeout)
                    .run(request, dry_run)
            })
        }
    }
}

/// Builds the OpenStack session (credentials are read on first request, so
/// dry runs never need them) and runs `operation` against it.
fn with_session<D, F>(settings: &Settings, operation: F) -> serde_json::Result<i32>
where
    D: Serialize,
    F: FnOnce(Arc<OpenStackSession>) -> OperationEnvelope<D>,
{
    match OpenStackSession::from_env(settings.http_timeout) {
        Ok(session) => emit(&operation(Arc::new(session))),
        Err(e) => emit(&failed::<D>(e.into())),
    }
}

fn failed<D>(failure: OperationError) -> OperationEnvelope<D> {
    EnvelopeBuilder::start().finish(Err::<D, _>(failure))
}

fn read_user_data(path: &Path) -> Result<String, OperationError> {
    std::fs::read_to_string(path).map_err(|e| {
        OperationError::new(CoreError::Validation(format!(
            "cannot read user data {}: {e}",
            path.display()
        )))
    })
}

fn emit<D: Serialize>(envelope: &OperationEnvelope<D>) -> serde_json::Result<i32> {
    println!("{}", envelope.to_json_pretty()?);
    Ok(envelope.exit_code())
}
