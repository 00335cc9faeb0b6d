use std::{env, fs, path::PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use switchyard::{
    app::{App, install_panic_hook},
    config::{ConfigManager, EnvConfigSource, Settings},
    function::FunctionRegistry,
    functions::register_builtins,
    logger::{convert_level, init_tracing},
    schema::write_schemas,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "switchyard",
    about = "Message-driven task orchestrator",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the orchestrator until interrupted
    Run(RunArgs),

    /// Print the built-in function catalog as JSON
    Functions,

    /// Write JSON Schemas for the wire and decision documents
    Schema(SchemaArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Directory holding `config/.env` and `logs/`
    #[arg(long)]
    root: Option<PathBuf>,

    /// trace, debug, info, warn, error or critical
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Args, Debug)]
struct SchemaArgs {
    /// Output directory; defaults to `<root>/schemas`
    #[arg(long)]
    out: Option<PathBuf>,
}

/// Resolve the root directory from the environment or use the default.
fn resolve_root_dir() -> PathBuf {
    env::var("SWITCHYARD_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./switchyard"))
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run(RunArgs {
        root: None,
        log_level: "info".to_string(),
    })) {
        Commands::Run(args) => run(args.root.unwrap_or_else(resolve_root_dir), &args.log_level).await,
        Commands::Functions => {
            let registry = FunctionRegistry::new();
            register_builtins(&registry)?;
            println!("{}", serde_json::to_string_pretty(&registry.export())?);
            Ok(())
        }
        Commands::Schema(args) => {
            let out = args.out.unwrap_or_else(|| resolve_root_dir().join("schemas"));
            for path in write_schemas(&out)? {
                println!("wrote {}", path.display());
            }
            Ok(())
        }
    }
}

async fn run(root: PathBuf, log_level: &str) -> anyhow::Result<()> {
    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir)
        .with_context(|| format!("failed to create {}", config_dir.display()))?;
    let _guards = init_tracing(
        root.clone(),
        "logs/switchyard.log",
        "logs/switchyard_events.log",
        convert_level(log_level),
    )?;
    info!(root = %root.display(), "switchyard starting up");

    let config = ConfigManager(EnvConfigSource::new(&config_dir.join(".env")));
    let settings = Settings::load(&config).await?;

    let fatal = CancellationToken::new();
    install_panic_hook(fatal.clone());

    let mut app = tokio::select! {
        app = App::bootstrap(settings) => app?,
        _ = shutdown_signal() => {
            info!("interrupted before startup completed");
            return Ok(());
        }
    };
    info!("switchyard running; press Ctrl-C to exit");

    tokio::select! {
        result = shutdown_signal() => result?,
        _ = fatal.cancelled() => error!("a task panicked; shutting down"),
    }

    app.shutdown().await;
    info!("goodbye");
    Ok(())
}

async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("failed to listen for Ctrl-C")?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;

    info!("shutdown signal received");
    Ok(())
}
