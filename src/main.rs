//! K2 Orchestrator
//!
//! Command line front end for the volume and replication orchestrator.
//! Loads a backend configuration from YAML, connects to the configured
//! arrays and runs one lifecycle command.

use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use k2_orchestrator::domain::ports::{REPLICATION_SPEC, THIN_PROV_TYPE_SPEC};
use k2_orchestrator::{
    DriverConfig, HostSnapshot, HostVolume, Orchestrator, Result, VolumeType,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// K2 Orchestrator - volume lifecycle and replication for K2 arrays
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Backend configuration file (YAML)
    #[arg(long, short, env = "K2_CONFIG", default_value = "/etc/k2-orchestrator/backend.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

/// Volume type options shared by the volume commands
#[derive(ClapArgs, Debug, Clone)]
struct TypeArgs {
    /// Volume type name
    #[arg(long = "type", default_value = "default")]
    type_name: String,

    /// Provisioning type (dedup or nodedup)
    #[arg(long)]
    thin_prov_type: Option<String>,

    /// Replicate the volume to the configured target
    #[arg(long)]
    replicated: bool,
}

impl TypeArgs {
    fn volume_type(&self) -> VolumeType {
        let mut volume_type = VolumeType::new(self.type_name.clone());
        if let Some(thin) = &self.thin_prov_type {
            volume_type = volume_type.with_spec(THIN_PROV_TYPE_SPEC, thin.clone());
        }
        if self.replicated {
            volume_type = volume_type.with_spec(REPLICATION_SPEC, "enabled");
        }
        volume_type
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate the configuration and the arrays' API versions
    Check,
    /// Print backend capacity statistics as JSON
    Stats,
    /// Create a volume
    CreateVolume {
        id: String,
        /// Size in GiB
        size_gib: u64,
        #[command(flatten)]
        volume_type: TypeArgs,
    },
    /// Delete a volume (and its replica)
    DeleteVolume {
        id: String,
        #[command(flatten)]
        volume_type: TypeArgs,
    },
    /// Grow a volume
    ExtendVolume {
        id: String,
        /// New size in GiB
        size_gib: u64,
    },
    /// Snapshot a volume
    CreateSnapshot { volume_id: String, snapshot_id: String },
    /// Delete a snapshot
    DeleteSnapshot { snapshot_id: String },
    /// Fail the given replicated volumes over to the target array
    Failover {
        volume_ids: Vec<String>,
        /// Backend id of the array to fail over to
        #[arg(long)]
        secondary_id: Option<String>,
    },
    /// Run the setup checks and print request metrics
    Metrics,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    info!("Starting K2 Orchestrator");
    info!("  Version: {}", k2_orchestrator::VERSION);
    info!("  Config: {}", args.config.display());

    let config = DriverConfig::load(&args.config)?;
    let orchestrator = Orchestrator::connect(config)?;
    orchestrator.do_setup()?;

    if let Err(e) = run(&orchestrator, args.command).await {
        error!("Command failed: {}", e);
        return Err(e);
    }
    Ok(())
}

async fn run(orchestrator: &Orchestrator, command: Command) -> Result<()> {
    match command {
        Command::Check => {
            orchestrator.check_for_setup_error().await?;
            info!("Backend {} is ready", orchestrator.config().backend_name());
        }
        Command::Stats => {
            let stats = orchestrator.get_volume_stats(true).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::CreateVolume {
            id,
            size_gib,
            volume_type,
        } => {
            let volume = HostVolume::new(id, size_gib).with_type(volume_type.volume_type());
            orchestrator.create_volume(&volume).await?;
            info!("Volume {} created", volume.id);
        }
        Command::DeleteVolume { id, volume_type } => {
            let volume = HostVolume::new(id, 0).with_type(volume_type.volume_type());
            orchestrator.delete_volume(&volume).await?;
            info!("Volume {} deleted", volume.id);
        }
        Command::ExtendVolume { id, size_gib } => {
            orchestrator
                .extend_volume(&HostVolume::new(id.clone(), 0), size_gib)
                .await?;
            info!("Volume {} extended to {} GiB", id, size_gib);
        }
        Command::CreateSnapshot {
            volume_id,
            snapshot_id,
        } => {
            let snapshot = HostSnapshot {
                id: snapshot_id,
                volume_id,
                volume_size_gib: 0,
            };
            orchestrator.create_snapshot(&snapshot).await?;
            info!("Snapshot {} created", snapshot.id);
        }
        Command::DeleteSnapshot { snapshot_id } => {
            let snapshot = HostSnapshot {
                id: snapshot_id,
                volume_id: String::new(),
                volume_size_gib: 0,
            };
            orchestrator.delete_snapshot(&snapshot).await?;
            info!("Snapshot {} deleted", snapshot.id);
        }
        Command::Failover {
            volume_ids,
            secondary_id,
        } => {
            let volumes: Vec<HostVolume> = volume_ids
                .into_iter()
                .map(|id| HostVolume::new(id, 0))
                .collect();
            let (backend, updates) = orchestrator
                .failover_host(&volumes, secondary_id.as_deref())
                .await?;
            info!("Active backend is now {}", backend);
            println!("{}", serde_json::to_string_pretty(&updates)?);
        }
        Command::Metrics => {
            orchestrator.check_for_setup_error().await?;
            orchestrator.update_volume_stats().await?;
            print!("{}", orchestrator.metrics().gather_text()?);
        }
    }
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=warn", "rustls=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
