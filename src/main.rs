use clap::{Args, Parser, Subcommand};
use myst_supervisor::config::{self, Config};
use myst_supervisor::supervisor::{DEFAULT_ENDPOINT, DEFAULT_SERVICE_NAME};
use myst_supervisor::{AccessControl, Endpoint, Supervisor, SupervisorOptions};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "myst-supervisor")]
#[command(about = "Privileged supervisor for VPN interface and route configuration")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor and serve the control channel
    Run(RunArgs),
    /// Print the validated configuration record
    ShowConfig {
        /// Config file path
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Control channel name, or a full socket/pipe path
    #[arg(long, default_value = DEFAULT_ENDPOINT)]
    endpoint: String,

    /// Name registered with the service manager
    #[arg(long, default_value = DEFAULT_SERVICE_NAME)]
    service_name: String,

    /// Group allowed to open the control channel (repeatable)
    #[arg(long = "allow-group", value_name = "GROUP")]
    allow_groups: Vec<String>,

    /// Config file path
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run in the foreground instead of under the service control manager
    #[cfg(windows)]
    #[arg(long)]
    console: bool,
}

impl RunArgs {
    fn options(&self) -> SupervisorOptions {
        let acl = if self.allow_groups.is_empty() {
            AccessControl::platform_default()
        } else {
            AccessControl::new(self.allow_groups.clone())
        };
        SupervisorOptions {
            endpoint: Endpoint::new(self.endpoint.clone()),
            service_name: self.service_name.clone(),
            acl,
            config_path: self.config.clone().unwrap_or_else(config::default_path),
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Set up logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run(args) => {
            let supervisor = Supervisor::load(args.options())?;
            info!(
                "Starting {} on {}",
                supervisor.options().service_name,
                supervisor.options().endpoint
            );
            run(supervisor, &args)?;
        }
        Commands::ShowConfig { config: path } => {
            let path = path.unwrap_or_else(config::default_path);
            let record = Config::load(&path)?;
            println!("Config: {}", path.display());
            println!("  MystPath: {}", record.myst_path);
            println!("  OpenVPNPath: {}", record.openvpn_path);
        }
    }

    Ok(())
}

#[cfg(unix)]
fn run(supervisor: Supervisor, _args: &RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    use myst_supervisor::ServiceState;
    use myst_supervisor::service::unix::{signal_channel, SystemdReporter};

    let runtime = tokio::runtime::Runtime::new()?;
    let state = runtime.block_on(async {
        let signals = signal_channel()?;
        let state = supervisor.run(signals, SystemdReporter::from_env()).await?;
        Ok::<ServiceState, Box<dyn std::error::Error>>(state)
    })?;
    info!("Supervisor finished ({})", state);
    Ok(())
}

#[cfg(windows)]
fn run(supervisor: Supervisor, args: &RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    use myst_supervisor::service::windows::run_dispatcher;
    use myst_supervisor::service::{console_signals, LogReporter};
    use std::sync::Mutex;
    use tracing::error;

    if args.console {
        let runtime = tokio::runtime::Runtime::new()?;
        let state = runtime.block_on(async {
            supervisor.run(console_signals(), LogReporter).await
        })?;
        info!("Supervisor finished ({})", state);
        return Ok(());
    }

    let name = supervisor.options().service_name.clone();
    let supervisor = Mutex::new(Some(supervisor));
    run_dispatcher(&name, move |signals, reporter| {
        let Some(supervisor) = supervisor.lock().ok().and_then(|mut s| s.take()) else {
            error!("Service started twice");
            return;
        };
        let runtime = match tokio::runtime::Runtime::new() {
            Ok(runtime) => runtime,
            Err(e) => {
                error!("Failed to start runtime: {}", e);
                return;
            }
        };
        match runtime.block_on(supervisor.run(signals, reporter)) {
            Ok(state) => info!("Supervisor finished ({})", state),
            Err(e) => error!("Supervisor failed: {}", e),
        }
    })?;
    Ok(())
}
