//! nvme-host
//!
//! Command line front end of the NVMe host manager: discover and connect
//! NVMe over Fabrics subsystems, disconnect controllers and list the host
//! topology.
//!
//! Exit codes: 0 success, 1 malformed input or configuration, 2 transport
//! or protocol failure, 3 topology refusal (duplicate or busy).

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, error, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use nvme_host_manager::config::DEFAULT_CONFIG_PATH;
use nvme_host_manager::{
    CancelToken, ControllerAddress, Error, LibraryConfig, NvmeContext, Result, TransportType,
    DISCOVERY_NQN,
};

/// Default service id of a discovery controller
const DISCOVERY_TRSVCID: &str = "8009";

/// Default service id of an I/O controller
const IO_TRSVCID: &str = "4420";

// =============================================================================
// CLI Arguments
// =============================================================================

/// NVMe host manager - discovery, connect and topology for NVMe over Fabrics
#[derive(Parser, Debug)]
#[command(name = "nvme-host", author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Output format
    #[arg(long, short = 'o', global = true, value_enum, env = "NVME_HOST_OUTPUT", default_value = "normal")]
    output: OutputFormat,

    /// Persisted topology document
    #[arg(long, global = true, env = "NVME_HOST_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Root of the sysfs mount
    #[arg(long, global = true, env = "NVME_HOST_SYSFS", default_value = "/sys")]
    sysfs_root: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "NVME_HOST_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, global = true, env = "NVME_HOST_LOG_JSON")]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read a discovery log and connect every advertised subsystem
    Discover {
        #[command(flatten)]
        target: TargetArgs,

        /// Keep the discovery controller connected
        #[arg(long)]
        persistent: bool,

        /// Connect attempts per controller
        #[arg(long, default_value_t = 3)]
        retries: u32,

        /// Save the resulting topology
        #[arg(long)]
        save: bool,
    },

    /// Connect one controller of a subsystem
    Connect {
        #[command(flatten)]
        target: TargetArgs,

        /// Subsystem NQN
        #[arg(long, short = 'n')]
        nqn: String,

        /// Connect attempts
        #[arg(long, default_value_t = 3)]
        retries: u32,

        /// Save the resulting topology
        #[arg(long)]
        save: bool,
    },

    /// Disconnect a controller or every controller of a subsystem
    Disconnect {
        /// Subsystem NQN
        #[arg(long, short = 'n', required_unless_present = "device", conflicts_with = "device")]
        nqn: Option<String>,

        /// Controller instance name (e.g. nvme3)
        #[arg(long, short = 'd')]
        device: Option<String>,

        /// Disconnect even if the last path to an in-use namespace goes away
        #[arg(long)]
        force: bool,

        /// Save the resulting topology
        #[arg(long)]
        save: bool,
    },

    /// Show hosts, subsystems, controllers, namespaces and paths
    List,
}

/// Transport address of the target
#[derive(Args, Debug, Clone)]
struct TargetArgs {
    /// Transport type (tcp, rdma, fc, loop, pcie)
    #[arg(long, short = 't', default_value = "tcp")]
    transport: String,

    /// Target address
    #[arg(long, short = 'a')]
    traddr: String,

    /// Target service id (port)
    #[arg(long, short = 's')]
    trsvcid: Option<String>,

    /// Host-side source address
    #[arg(long, short = 'w')]
    host_traddr: Option<String>,

    /// Host-side network interface
    #[arg(long, short = 'f')]
    host_iface: Option<String>,
}

impl TargetArgs {
    fn address(&self, default_trsvcid: &str) -> Result<ControllerAddress> {
        let transport: TransportType = self.transport.parse().map_err(Error::InvalidInput)?;
        let mut address = ControllerAddress::new(transport, self.traddr.clone());
        address.trsvcid = match &self.trsvcid {
            Some(trsvcid) => Some(trsvcid.clone()),
            None if transport.is_ip_based() => Some(default_trsvcid.to_string()),
            None => None,
        };
        address.host_traddr.clone_from(&self.host_traddr);
        address.host_iface.clone_from(&self.host_iface);
        address.validate().map_err(Error::InvalidInput)?;
        Ok(address)
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Normal,
    Json,
}

// =============================================================================
// Main
// =============================================================================

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            // help and version are not errors
            return ExitCode::from(if e.use_stderr() { 1 } else { 0 });
        }
    };

    init_logging(&cli);
    debug!(version = nvme_host_manager::VERSION, command = ?cli.command, "Starting nvme-host");

    match run(&cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("nvme-host: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

fn run(cli: &Cli) -> Result<u8> {
    let mut config = LibraryConfig::default();
    config.sysfs_root = cli.sysfs_root.clone();
    config.config_path = cli.config.clone();

    match &cli.command {
        Command::Discover {
            target,
            persistent,
            retries,
            save,
        } => {
            let address = target.address(DISCOVERY_TRSVCID)?;
            config.discovery.retry.max_attempts = *retries;
            config.discovery.persistent = *persistent;
            let ctx = prepare(config)?;

            let report = ctx.discover(&address, &CancelToken::new());
            finish(&ctx, *save && report.is_ok())?;
            let report = report?;
            match cli.output {
                OutputFormat::Normal => print!("{}", report),
                OutputFormat::Json => print_json(&report)?,
            }
            Ok(if report.failed() > 0 { 2 } else { 0 })
        }

        Command::Connect {
            target,
            nqn,
            retries,
            save,
        } => {
            let default_trsvcid = if nqn == DISCOVERY_NQN {
                DISCOVERY_TRSVCID
            } else {
                IO_TRSVCID
            };
            let address = target.address(default_trsvcid)?;
            config.discovery.retry.max_attempts = *retries;
            let ctx = prepare(config)?;

            let controller = ctx.connect(&address, nqn, &CancelToken::new());
            finish(&ctx, *save && controller.is_ok())?;
            let controller = controller?;
            match cli.output {
                OutputFormat::Normal => println!(
                    "connected {} to {} at {}",
                    controller.label(),
                    nqn,
                    controller.address
                ),
                OutputFormat::Json => print_json(&controller)?,
            }
            Ok(0)
        }

        Command::Disconnect {
            nqn,
            device,
            force,
            save,
        } => {
            let ctx = prepare(config)?;
            let reports = match (nqn, device) {
                (_, Some(device)) => ctx.disconnect_device(device, *force).map(|r| vec![r]),
                (Some(nqn), None) => ctx.disconnect_subsystem(nqn, *force),
                (None, None) => Err(Error::InvalidInput("--nqn or --device is required".into())),
            };
            finish(&ctx, *save && reports.is_ok())?;
            let reports = reports?;
            match cli.output {
                OutputFormat::Normal => {
                    for report in &reports {
                        println!("disconnected {} from {}", report.controller, report.subnqn);
                    }
                }
                OutputFormat::Json => print_json(&reports)?,
            }
            Ok(0)
        }

        Command::List => {
            let ctx = prepare(config)?;
            let view = ctx.view();
            finish(&ctx, false)?;
            match cli.output {
                OutputFormat::Normal => print!("{}", view),
                OutputFormat::Json => print_json(&view)?,
            }
            Ok(0)
        }
    }
}

/// Open the context, restore the saved topology and merge the live one
fn prepare(config: LibraryConfig) -> Result<NvmeContext> {
    let ctx = open_context(config)?;
    ctx.load_config()?;
    if let Err(e) = ctx.rescan() {
        warn!(error = %e, "Topology scan failed, continuing with saved configuration");
    }
    Ok(ctx)
}

fn finish(ctx: &NvmeContext, save: bool) -> Result<()> {
    let saved = if save { ctx.save_config() } else { Ok(()) };
    ctx.release();
    saved
}

#[cfg(target_os = "linux")]
fn open_context(config: LibraryConfig) -> Result<NvmeContext> {
    NvmeContext::open(config)
}

#[cfg(not(target_os = "linux"))]
fn open_context(_config: LibraryConfig) -> Result<NvmeContext> {
    Err(Error::InvalidInput(
        "the kernel passthrough is only available on Linux".into(),
    ))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    println!("{}", json);
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(cli: &Cli) {
    let level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // Logs go to stderr so JSON output stays parseable
    if cli.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
