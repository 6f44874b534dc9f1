//! Cluster manager binary

use clap::{Parser, Subcommand, ValueEnum};
use clustermeta::common::{parse_duration, Config, TagPolicy};
use clustermeta::MetaServer;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "clustermeta-server")]
#[command(about = "clustermeta cluster manager with Raft-ordered membership")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum TagPolicyArg {
    Exact,
    PreferExact,
}

impl From<TagPolicyArg> for TagPolicy {
    fn from(arg: TagPolicyArg) -> Self {
        match arg {
            TagPolicyArg::Exact => TagPolicy::Exact,
            TagPolicyArg::PreferExact => TagPolicy::PreferExact,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Start cluster manager server
    Serve {
        /// Config file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Node ID
        #[arg(long)]
        id: Option<String>,

        /// Bind address for HTTP
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Snapshot database directory
        #[arg(long)]
        db: Option<PathBuf>,

        /// Silence after which an instance is marked dead (e.g. "60s")
        #[arg(long)]
        dead_threshold: Option<String>,

        /// Liveness scan interval (e.g. "10s")
        #[arg(long)]
        health_interval: Option<String>,

        /// Resource tag matching policy
        #[arg(long, value_enum)]
        tag_policy: Option<TagPolicyArg>,

        /// Register unknown stores from their first heartbeat
        #[arg(long)]
        bootstrap_from_heartbeat: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            id,
            bind,
            db,
            dead_threshold,
            health_interval,
            tag_policy,
            bootstrap_from_heartbeat,
        } => {
            // Load config from file and environment, then override with CLI arguments
            let mut config = Config::load(config.as_deref())?;
            if let Some(id) = id {
                config.node_id = id;
            }
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            if db.is_some() {
                config.db_path = db;
            }
            if let Some(threshold) = dead_threshold {
                config.cluster.dead_threshold_ms = parse_duration(&threshold)?.as_millis() as u64;
            }
            if let Some(interval) = health_interval {
                config.cluster.health_check_interval_ms =
                    parse_duration(&interval)?.as_millis() as u64;
            }
            if let Some(policy) = tag_policy {
                config.cluster.tag_policy = policy.into();
            }
            if bootstrap_from_heartbeat {
                config.cluster.bootstrap_from_heartbeat = true;
            }
            config.cluster.validate()?;

            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| config.log_level.clone().into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            MetaServer::new(config).serve().await?;
        }
    }

    Ok(())
}
