use std::{env, path::PathBuf, process};

use anyhow::bail;
use callflow::{config::Config, flow::Flow, flow::FlowManager, logger::init_tracing, middleware::FlowUtils};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "callflow", about = "Declarative IVR call-flow execution engine", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the engine
    Run(RunArgs),

    /// Manage flows
    Flow(FlowArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Optional log level override (e.g. error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Directory for rolling log files; stdout only when omitted
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct FlowArgs {
    #[command(subcommand)]
    command: FlowCommands,
}

#[derive(Subcommand, Debug)]
enum FlowCommands {
    Validate { file: PathBuf },
}

/// Resolve the callflow root directory from the environment or use default.
fn resolve_root_dir() -> PathBuf {
    if let Ok(path) = env::var("CALLFLOW_ROOT") {
        PathBuf::from(path)
    } else {
        PathBuf::from("./callflow")
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run(RunArgs {
        log_level: "info".to_string(),
        log_dir: None,
    })) {
        Commands::Run(args) => run(resolve_root_dir(), args).await,
        Commands::Flow(flow_args) => match flow_args.command {
            FlowCommands::Validate { file } => {
                let flow = Flow::load_from_file(&file)?;
                println!("Flow `{}` is valid ({} nodes).", flow.name(), flow.nodes().len());
                Ok(())
            }
        },
    }
}

async fn run(root: PathBuf, args: RunArgs) -> anyhow::Result<()> {
    let env_file = root.join(".env");
    if env_file.exists() {
        dotenvy::from_path(&env_file).ok();
    }

    let _guard = init_tracing(&args.log_level, args.log_dir.clone())?;

    info!("callflow engine starting up…");

    if !root.exists() {
        let err = format!("Root directory `{}` does not exist.", root.display());
        error!("{}", err);
        bail!(err);
    }

    let config = Config::load(&root.join("callflow.yaml"))?;

    let flows = FlowManager::new(config.flows_dir.clone());
    let loaded = flows.load_all();
    info!(flows = loaded, "flows loaded");

    let flow_utils = FlowUtils::load(&config.flow_utils);
    info!(email_servers = flow_utils.email_servers().len(), "flow-utils bundle loaded");

    info!("callflow engine running; waiting for the call-control transport. Press Ctrl-C to exit");
    tokio::signal::ctrl_c().await?;

    info!("callflow engine shutting down");
    process::exit(0);
}
