mod memory_cmds;
mod persona_cmds;

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use sani_config::AppConfig;
use sani_memory::GovernedStore;

const CONFIG_PATH: &str = "config/default.toml";

#[derive(Debug, Parser)]
#[command(name = "sani", version, about = "Governed tiered memory for the SANI persona")]
struct Cli {
    /// Config file to load.
    #[arg(long, global = true, default_value = CONFIG_PATH)]
    config: PathBuf,
    /// Workspace root; overrides `[agent] workspace_path` and SANI_WORKSPACE.
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

/// Provenance for writes made from the command line.
#[derive(Debug, Args)]
struct SessionArgs {
    #[arg(long, default_value = "cli")]
    session: String,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Write a ThreadBorn working note.
    Note {
        #[arg(long)]
        title: String,
        #[arg(long)]
        body: String,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Promote a ThreadBorn/BridgeThread/Labyrinth entry into BridgeThread.
    Promote {
        #[arg(value_name = "SOURCE")]
        source: String,
        #[arg(long)]
        title: Option<String>,
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Seal an entry into the Vault, or append it to an existing Vault file.
    Seal {
        #[arg(value_name = "SOURCE")]
        source: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        append: bool,
        #[arg(long)]
        target: Option<String>,
        /// Vault subfolder for a new seal.
        #[arg(long)]
        scope: Option<String>,
        /// Runtime toggle: allow sealing for this invocation.
        #[arg(long, conflicts_with = "deny_seal")]
        allow_seal: bool,
        /// Runtime toggle: refuse sealing for this invocation.
        #[arg(long)]
        deny_seal: bool,
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Write a Labyrinth identity snapshot.
    Snapshot {
        #[arg(long)]
        title: String,
        #[arg(long)]
        body: String,
        #[command(flatten)]
        session: SessionArgs,
    },
    /// List Vault entries, optionally under a scope and filtered by tags.
    Query {
        #[arg(long)]
        scope: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Check text against the injection pattern registry.
    Scan {
        text: String,
        #[arg(long)]
        channel: Option<String>,
        /// Write an audit record when something matches.
        #[arg(long)]
        audit: bool,
        #[arg(long)]
        session: Option<String>,
    },
    /// Show a session's mode flags (expiring stale modes).
    Modes {
        #[arg(value_name = "SESSION_KEY")]
        session_key: String,
    },
    /// Run one inbound message through screening and mode handling.
    Inbound {
        #[arg(value_name = "SESSION_KEY")]
        session_key: String,
        text: String,
        #[arg(long)]
        channel: Option<String>,
        #[arg(long)]
        sender: Option<String>,
    },
    /// Print the effective configuration.
    Config {
        /// Write defaults to the config path if it does not exist yet.
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = AppConfig::load_from(&cli.config)?;
    if let Some(workspace) = &cli.workspace {
        config.agent.workspace_path = workspace.display().to_string();
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.telemetry.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(
        config = %cli.config.display(),
        workspace = %config.agent.workspace_path,
        "configuration loaded"
    );
    let store = GovernedStore::new(&config.agent.workspace_path);

    match cli.command {
        Commands::Note {
            title,
            body,
            tags,
            session,
        } => memory_cmds::run_note(&store, title, body, tags, &session.session).await?,
        Commands::Promote {
            source,
            title,
            session,
        } => memory_cmds::run_promote(&store, source, title, &session.session).await?,
        Commands::Seal {
            source,
            title,
            append,
            target,
            scope,
            allow_seal,
            deny_seal,
            session,
        } => {
            let toggle = match (allow_seal, deny_seal) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            let request = memory_cmds::SealArgs {
                source,
                title,
                append,
                target,
                scope,
            };
            memory_cmds::run_seal(&store, &config, toggle, request, &session.session).await?
        }
        Commands::Snapshot {
            title,
            body,
            session,
        } => memory_cmds::run_snapshot(&store, title, body, &session.session).await?,
        Commands::Query { scope, tags } => {
            memory_cmds::run_query(&store, scope.as_deref(), &tags).await?
        }
        Commands::Scan {
            text,
            channel,
            audit,
            session,
        } => {
            persona_cmds::run_scan(&store, &config, &text, channel.as_deref(), audit, session.as_deref())
                .await?
        }
        Commands::Modes { session_key } => {
            persona_cmds::run_modes(&store, &config, &session_key).await?
        }
        Commands::Inbound {
            session_key,
            text,
            channel,
            sender,
        } => persona_cmds::run_inbound(&store, &config, session_key, text, channel, sender).await?,
        Commands::Config { init } => run_config(&config, &cli.config, init)?,
    }

    Ok(())
}

fn run_config(config: &AppConfig, path: &Path, init: bool) -> Result<()> {
    if init {
        if path.exists() {
            println!("config already exists at {}", path.display());
        } else {
            AppConfig::default().save_to(path)?;
            println!("wrote default config to {}", path.display());
        }
    }
    println!("# {}", path.display());
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}
