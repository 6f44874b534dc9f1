//! Cluster manager server

use crate::common::{Config, Result};
use crate::meta::health::start_health_check_task;
use crate::meta::http::{create_router, AppState};
use crate::meta::manager::{start_apply_task, start_leadership_task, ClusterManager};
use crate::meta::metadata::MetadataStore;
use crate::meta::raft_node::RaftNode;
use crate::meta::snapshot::{MemorySnapshotStore, SnapshotStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// A running metadata replica without its HTTP front end
pub struct LocalNode {
    pub manager: Arc<ClusterManager>,
    pub raft: Arc<RaftNode>,
    pub store: Arc<dyn SnapshotStore>,
    tasks: Vec<JoinHandle<()>>,
}

impl LocalNode {
    /// Open the snapshot store, recover, and start background tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: &Config) -> Result<Self> {
        let store: Arc<dyn SnapshotStore> = match &config.db_path {
            Some(path) => Arc::new(MetadataStore::open(path)?),
            None => {
                tracing::warn!("No db_path configured, snapshots are kept in memory only");
                Arc::new(MemorySnapshotStore::new())
            }
        };
        Self::start_with_store(config, store)
    }

    pub fn start_with_store(config: &Config, store: Arc<dyn SnapshotStore>) -> Result<Self> {
        let (raft, commits) = RaftNode::new(config.node_id.clone());
        let raft = Arc::new(raft);
        let manager = Arc::new(ClusterManager::with_store(
            config.node_id.clone(),
            config.cluster.clone(),
            raft.clone(),
            store.clone(),
        ));

        let report = manager.load_snapshot(store.as_ref())?;
        raft.restore_from_snapshot(manager.gateway().applied_index());
        tracing::info!(
            "Recovered {} record(s) from snapshot ({} skipped), applied index {}",
            report.recovered(),
            report.skipped.len(),
            manager.gateway().applied_index()
        );

        let tasks = vec![
            start_apply_task(manager.clone(), commits),
            start_leadership_task(manager.clone(), raft.subscribe_leadership()),
            start_health_check_task(manager.clone(), config.cluster.health_check_interval()),
            start_snapshot_task(
                manager.clone(),
                store.clone(),
                config.cluster.snapshot_interval(),
            ),
        ];

        // single replica: it leads from the start
        raft.become_leader();

        Ok(Self {
            manager,
            raft,
            store,
            tasks,
        })
    }

    /// Stop background tasks and write a final snapshot.
    ///
    /// Waits for the tasks to finish so their store handles are released.
    pub async fn shutdown(self) -> Result<()> {
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::error!("Background task failed: {}", e);
                }
            }
        }
        let written = self.manager.save_snapshot(self.store.as_ref())?;
        tracing::info!("Final snapshot written ({} records)", written);
        Ok(())
    }
}

/// Periodic full snapshot; compacts the per-change records
pub fn start_snapshot_task(
    manager: Arc<ClusterManager>,
    store: Arc<dyn SnapshotStore>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // first tick fires immediately; nothing new to save yet
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match manager.save_snapshot(store.as_ref()) {
                Ok(written) => tracing::debug!("Snapshot written ({} records)", written),
                Err(e) => tracing::error!("Snapshot failed: {}", e),
            }
        }
    })
}

pub struct MetaServer {
    config: Config,
}

impl MetaServer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn serve(self) -> Result<()> {
        tracing::info!("Starting cluster manager: {}", self.config.node_id);
        tracing::info!("  HTTP API: {}", self.config.bind_addr);
        match &self.config.db_path {
            Some(path) => tracing::info!("  DB path: {}", path.display()),
            None => tracing::info!("  DB path: (memory)"),
        }
        tracing::info!(
            "  Dead threshold: {:?}, health check every {:?}",
            self.config.cluster.dead_threshold(),
            self.config.cluster.health_check_interval()
        );

        let node = LocalNode::start(&self.config)?;
        let router = create_router(AppState {
            manager: node.manager.clone(),
        });

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!("✓ Cluster manager ready ({})", node.raft.get_role());

        let served = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await;
        if let Err(e) = &served {
            tracing::error!("HTTP server error: {}", e);
        }

        node.shutdown().await?;
        served?;
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
