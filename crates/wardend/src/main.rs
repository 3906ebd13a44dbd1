use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use warden_core::config::{Config, WarnLevel, CONFIG_FILE};
use warden_core::{HandlerCatalog, Orchestrator};

#[derive(Parser)]
#[command(
    name = "wardend",
    about = "Host warden services: recover them, run their tasks, persist them",
    version
)]
struct Cli {
    /// Config file (default: <root>/warden.yaml)
    #[arg(long, short = 'c', env = "WARDEN_CONFIG")]
    config: Option<PathBuf>,

    /// State root used when no config file exists
    #[arg(long, env = "WARDEN_ROOT", default_value = ".warden")]
    root: PathBuf,

    /// Write the effective config to the config path and exit
    #[arg(long)]
    init: bool,

    /// Validate the config and exit
    #[arg(long)]
    check: bool,

    /// Override the shutdown timeout, in seconds
    #[arg(long)]
    shutdown_timeout: Option<u64>,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_target(false)
        .init();

    if let Err(e) = run(cli) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn load_config(cli: &Cli) -> Result<(PathBuf, Config)> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| cli.root.join(CONFIG_FILE));
    if path.exists() {
        let config = Config::load(&path).with_context(|| format!("loading {}", path.display()))?;
        return Ok((path, config));
    }
    if cli.config.is_some() {
        return Err(anyhow!("config file {} does not exist", path.display()));
    }
    tracing::info!(root = %cli.root.display(), "no config file, using defaults");
    Ok((path, Config::with_root(&cli.root)))
}

fn run(cli: Cli) -> Result<()> {
    let (path, config) = load_config(&cli)?;

    let warnings = config.validate();
    for w in &warnings {
        match w.level {
            WarnLevel::Warning => tracing::warn!("{}", w.message),
            WarnLevel::Error => tracing::error!("{}", w.message),
        }
    }
    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        return Err(anyhow!("config {} is invalid", path.display()));
    }
    if cli.check {
        println!("{}: ok ({} warnings)", path.display(), warnings.len());
        return Ok(());
    }
    if cli.init {
        config.save(&path)?;
        println!("wrote {}", path.display());
        return Ok(());
    }

    let timeout = cli
        .shutdown_timeout
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.runtime.shutdown_timeout());

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(async move {
        let orchestrator = Orchestrator::new(config, HandlerCatalog::new())?;
        let report = orchestrator.start().await?;
        println!(
            "wardend: {} templates, {} services recovered",
            report.templates, report.recovered
        );

        tokio::signal::ctrl_c().await?;
        tracing::info!(timeout_secs = timeout.as_secs(), "shutting down");
        orchestrator.stop(timeout).await?;
        Ok(())
    })
}
