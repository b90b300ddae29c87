use workbench_gateway::agent::Orchestrator;
use workbench_gateway::config::Config;
use workbench_gateway::gateway::{self, AppState};
use workbench_gateway::logs::{LogHub, LogLevel};
use workbench_gateway::workspace::Workspace;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "workbench", version, about = "Instruction-driven workspace gateway")]
struct Cli {
    /// Path to configuration file (defaults to ./workbench.yaml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP gateway (default)
    Serve {
        /// Override the listen address
        #[arg(long)]
        addr: Option<SocketAddr>,
    },
    /// Run a single instruction against the workspace and print the result
    Ask {
        /// Session identifier
        #[arg(long, default_value = "cli")]
        session: String,
        /// Files to include as context
        #[arg(long = "hint", value_delimiter = ',')]
        hints: Vec<String>,
        /// The instruction text
        instruction: String,
    },
    /// Apply a JSON operations file to the workspace
    Apply {
        /// Path to a JSON array of operations ("-" for stdin)
        file: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            tracing::warn!(error = %e, "failed to load .env");
        }
    }

    let cli = Cli::parse();
    let cfg = Config::load(cli.config.as_deref())
        .await
        .context("failed to load configuration")?;

    match cli.command {
        Some(Command::Serve { addr }) => serve(cfg, addr).await,
        None => serve(cfg, None).await,
        Some(Command::Ask {
            session,
            hints,
            instruction,
        }) => ask(cfg, &session, &hints, &instruction).await,
        Some(Command::Apply { file }) => apply(cfg, &file).await,
    }
}

async fn serve(cfg: Config, addr: Option<SocketAddr>) -> anyhow::Result<()> {
    let addr = match addr {
        Some(a) => a,
        None => cfg
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address {}", cfg.listen_addr))?,
    };

    let state = AppState::from_config(cfg)?;
    let gw = gateway::start_gateway(state, addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %gw.addr, "workbench gateway listening");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    gw.shutdown().await;
    Ok(())
}

async fn ask(cfg: Config, session: &str, hints: &[String], instruction: &str) -> anyhow::Result<()> {
    let hub = LogHub::new(&cfg.logs)?;
    let (_history, mut rx, guard) = hub.subscribe(session);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let tag = match event.level {
                LogLevel::Error => "error",
                LogLevel::Warn => "warn",
                LogLevel::Info => "info",
                LogLevel::Debug => continue,
            };
            eprintln!("[{tag}] {}", event.message);
        }
    });

    let orchestrator = Orchestrator::from_config(&cfg, hub)?;
    orchestrator.workspace().ensure_root().await?;
    let response = orchestrator
        .process_instruction(session, instruction, hints)
        .await;

    drop(guard);
    let _ = printer.await;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

async fn apply(cfg: Config, file: &str) -> anyhow::Result<()> {
    let raw = if file == "-" {
        use tokio::io::AsyncReadExt;
        let mut buf = String::new();
        tokio::io::stdin().read_to_string(&mut buf).await?;
        buf
    } else {
        tokio::fs::read_to_string(file)
            .await
            .with_context(|| format!("failed to read {file}"))?
    };

    let items = match workbench_gateway::operations::parse(&raw) {
        workbench_gateway::operations::ParseResult::Success(items) => items,
        workbench_gateway::operations::ParseResult::Failure(_) => {
            anyhow::bail!("{file} does not contain a JSON array of operations")
        }
    };

    let workspace = Workspace::new(&cfg.workspace_root);
    workspace.ensure_root().await?;
    for line in workspace.apply_operations(&items).await {
        println!("{line}");
    }
    Ok(())
}
