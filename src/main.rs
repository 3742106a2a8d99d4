use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use podpool::{
    api::TaskServer,
    cluster::{ClusterApi, DockerCluster, KubeCluster, MemoryCluster},
    config::{Backend, ControllerConfig},
    manager::Manager,
    store::{MemoryStore, SqliteStore, TaskStore},
};

#[derive(Parser, Debug)]
#[command(name = "podpool")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "PODPOOL_CONFIG")]
    config: Option<PathBuf>,

    /// Cluster backend, overrides the config file
    #[arg(long, value_enum)]
    backend: Option<Backend>,

    /// Address of the HTTP API
    #[arg(long)]
    listen: Option<String>,

    /// SQLite database file
    #[arg(long, env = "PODPOOL_DATABASE")]
    database: Option<String>,

    /// Namespace holding jobs, pods and claims
    #[arg(long)]
    namespace: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("podpool=info")),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let args = Args::parse();
    let mut config = ControllerConfig::load(args.config.as_deref())?;
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(database) = args.database {
        config.database = Some(database);
    }
    if let Some(namespace) = args.namespace {
        config.namespace = namespace;
    }

    let store: Arc<dyn TaskStore> = match &config.database {
        Some(path) => Arc::new(
            SqliteStore::open(Path::new(path))
                .with_context(|| format!("failed to open database {}", path))?,
        ),
        None => Arc::new(MemoryStore::new()),
    };

    let cluster: Arc<dyn ClusterApi> = match config.backend {
        Backend::Kube => Arc::new(
            KubeCluster::connect(&config.namespace)
                .await
                .context("failed to connect to kubernetes")?,
        ),
        Backend::Docker => Arc::new(
            DockerCluster::connect(&config.namespace).context("failed to connect to docker")?,
        ),
        Backend::Memory => Arc::new(MemoryCluster::new()),
    };

    info!(
        "Using {:?} backend in namespace {}",
        config.backend, config.namespace
    );
    let listen = config.listen.clone();
    let manager = Manager::new(config, store, cluster);
    manager.start().await?;

    let shutdown = CancellationToken::new();
    let server = TaskServer::new(manager.clone(), &listen);
    let mut serving = tokio::spawn(server.start_server(shutdown.clone()));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutting down");
            shutdown.cancel();
            serving.await??;
        }
        served = &mut serving => {
            manager.stop().await;
            served?.context("task server failed")?;
            return Ok(());
        }
    }
    manager.stop().await;

    Ok(())
}
