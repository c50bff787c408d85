use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, WrapErr};
use colored::Colorize;
use fg_core::config::loader::{apply_env_overrides, load_repository_definition, load_server_config};
use fg_core::Orchestrator;
use fg_protocol::config_models::ServerConfig;
use fg_server::{build_router, AppState};
use tokio::net::TcpListener;

const DEFAULT_FILTER: &str = "info,fg_core=info,fg_server=info";

#[derive(Parser)]
#[command(name = "flowgate", version, about = "Process orchestration server")]
struct Cli {
    /// Path to the server configuration file
    #[arg(short, long, global = true, default_value = "flowgate.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the REST server and the dispatcher (default)
    Serve {
        /// Listen address, overrides `[server] bind`
        #[arg(long)]
        bind: Option<String>,
    },

    /// Check the configuration and the definitions of local repositories
    Validate,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Serve { bind: None }) {
        Command::Serve { bind } => serve(&cli.config, bind).await,
        Command::Validate => validate(&cli.config).await,
    }
}

async fn load_config(path: &Path) -> color_eyre::Result<ServerConfig> {
    let mut config = load_server_config(path)
        .await
        .wrap_err_with(|| format!("failed to load {}", path.display()))?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

async fn serve(path: &Path, bind: Option<String>) -> color_eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_FILTER.into()),
        )
        .init();

    let mut config = load_config(path).await?;
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    if config.github.secret.is_none() {
        tracing::warn!("No GitHub webhook secret configured, /event/github will reject every request");
    }

    let bind_addr = config.server.bind.clone();
    let orchestrator = Arc::new(Orchestrator::from_config(config).await?);
    if orchestrator.load_state().await? {
        tracing::info!("Resumed from persisted state");
    }
    orchestrator.refresh_all().await;

    tokio::spawn(Arc::clone(&orchestrator).run());

    let app = build_router(AppState::new(orchestrator));
    let listener = TcpListener::bind(&bind_addr)
        .await
        .wrap_err_with(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!("flowgate listening on {bind_addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn validate(path: &Path) -> color_eyre::Result<()> {
    let config = load_config(path).await?;
    println!(
        "{} {} ({} repositories, {} workers, {} policy rules)",
        "✓".green(),
        path.display(),
        config.repositories.len(),
        config.workers.len(),
        config.policy.rules.len()
    );

    let mut failures = 0;
    for repository in &config.repositories {
        let label = format!("{}/{}/{}", repository.org, repository.project, repository.name);
        let Some(checkout) = &repository.path else {
            println!("{} {label} (no local checkout)", "-".dimmed());
            continue;
        };
        match load_repository_definition(checkout).await {
            Ok(definition) => println!(
                "{} {label} ({} flows, {} triggers)",
                "✓".green(),
                definition.flows.len(),
                definition.triggers.len()
            ),
            Err(e) => {
                failures += 1;
                println!("{} {label}: {e}", "✗".red());
            }
        }
    }

    if failures > 0 {
        return Err(eyre!("{failures} repository definition(s) are invalid"));
    }
    Ok(())
}
