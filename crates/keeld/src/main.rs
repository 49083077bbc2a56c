//! keeld: the keel daemon.
//!
//! Single binary that assembles the keel subsystems over the local Docker
//! engine:
//! - State store (redb)
//! - Image builder and build scheduler
//! - Service and load balancer reconcilers
//!
//! # Usage
//!
//! ```text
//! keeld serve --config /etc/keel/keel.toml
//! keeld deploy --config keel.toml --app api --tar ./api.tar
//! keeld status --config keel.toml --app api
//! ```

mod certs;
mod daemon;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{ArgGroup, Parser, Subcommand, ValueEnum};
use keel_core::{BuildSource, KeelConfig, RepoInfo};
use keel_docker::DockerClient;
use keel_state::StateStore;
use tracing::info;

use crate::certs::PreIssuedCertificates;
use crate::daemon::Daemon;

#[derive(Parser)]
#[command(name = "keeld", about = "keel deployment daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Bootstrap the proxy, converge every app and wait for Ctrl-C.
    Serve {
        #[arg(long, default_value = "keel.toml")]
        config: PathBuf,

        /// Node that hosts nginx. Defaults to the first manager node.
        #[arg(long)]
        node_id: Option<String>,
    },

    /// Build and deploy one app, then exit.
    #[command(group(
        ArgGroup::new("source")
            .required(true)
            .args(["tar", "repo", "definition"]),
    ))]
    Deploy {
        #[arg(long, default_value = "keel.toml")]
        config: PathBuf,

        #[arg(long)]
        app: String,

        /// Source archive to upload.
        #[arg(long)]
        tar: Option<PathBuf>,

        /// Git repository to clone.
        #[arg(long, requires = "branch")]
        repo: Option<String>,

        #[arg(long, requires = "repo")]
        branch: Option<String>,

        #[arg(long, requires = "repo", conflicts_with = "ssh_key")]
        user: Option<String>,

        #[arg(long, requires = "user")]
        password: Option<String>,

        /// Private key file for ssh clones.
        #[arg(long, requires = "repo")]
        ssh_key: Option<PathBuf>,

        /// Definition file deployed without a source tree.
        #[arg(long)]
        definition: Option<PathBuf>,
    },

    /// Print the build status of an app as JSON.
    Status {
        #[arg(long, default_value = "keel.toml")]
        config: PathBuf,

        #[arg(long)]
        app: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| {
            tracing_subscriber::EnvFilter::try_new(
                "info,keeld=debug,keel_scheduler=debug,keel_build=debug",
            )
        })?;
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }

    match cli.command {
        Command::Serve { config, node_id } => run_serve(&config, node_id).await,
        Command::Deploy {
            config,
            app,
            tar,
            repo,
            branch,
            user,
            password,
            ssh_key,
            definition,
        } => {
            let source = if let Some(uploaded_tar_path) = tar {
                BuildSource::Tarball {
                    uploaded_tar_path,
                    source_revision: None,
                }
            } else if let Some(repo) = repo {
                let ssh_key = match ssh_key {
                    Some(path) => Some(
                        tokio::fs::read_to_string(&path)
                            .await
                            .with_context(|| format!("reading {}", path.display()))?,
                    ),
                    None => None,
                };
                BuildSource::Git(RepoInfo {
                    repo,
                    branch: branch.unwrap_or_default(),
                    user: user.unwrap_or_default(),
                    password: password.unwrap_or_default(),
                    ssh_key,
                })
            } else if let Some(path) = definition {
                BuildSource::Definition {
                    content: tokio::fs::read_to_string(&path)
                        .await
                        .with_context(|| format!("reading {}", path.display()))?,
                    source_revision: None,
                }
            } else {
                anyhow::bail!("one of --tar, --repo or --definition is required");
            };
            run_deploy(&config, &app, source).await
        }
        Command::Status { config, app } => run_status(&config, &app).await,
    }
}

async fn open_daemon(config_path: &Path) -> anyhow::Result<Daemon> {
    let config = KeelConfig::from_file(config_path)?;
    config.validate()?;

    tokio::fs::create_dir_all(&config.paths.data_dir).await?;
    let db_path = config.paths.state_db();
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let orchestrator = Arc::new(DockerClient::new(config.docker.socket.clone()));
    let certs = Arc::new(PreIssuedCertificates::new(config.paths.letsencrypt_dir()));
    Ok(Daemon::assemble(config, store, orchestrator, certs))
}

async fn run_serve(config_path: &Path, node_id: Option<String>) -> anyhow::Result<()> {
    info!(config = %config_path.display(), "keel daemon starting");
    let daemon = open_daemon(config_path).await?;

    let node_id = daemon.resolve_node_id(node_id).await?;
    daemon.bootstrap_proxy(&node_id).await?;
    info!(%node_id, "load balancer bootstrapped");

    daemon.converge_apps().await?;

    info!("keel daemon ready");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    Ok(())
}

async fn run_deploy(config_path: &Path, app: &str, source: BuildSource) -> anyhow::Result<()> {
    let daemon = open_daemon(config_path).await?;
    info!(%app, source = %source.describe(), "deploying");
    let deployed = daemon.manager().scheduler().deploy(app, source).await?;
    println!("{app}: version {} ({})", deployed.version, deployed.image.image_name);
    Ok(())
}

async fn run_status(config_path: &Path, app: &str) -> anyhow::Result<()> {
    let daemon = open_daemon(config_path).await?;
    daemon.manager().apps().get_app(app)?;
    let status = daemon.manager().get_build_status(app);
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
