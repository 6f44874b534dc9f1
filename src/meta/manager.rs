//! Cluster manager: membership and placement authority
//!
//! Owns the topology and instance registries, submits membership changes to
//! the consensus log, processes store heartbeats and answers placement
//! queries. One instance is built by the server at startup and shared behind
//! an `Arc`.

use crate::common::{timestamp_now_micros, validate_address, ClusterConfig, Error, Result};
use crate::meta::gateway::MutationGateway;
use crate::meta::model::{
    Instance, InstancePlacement, InstanceSpec, LogicalRoom, Mutation, StoreHeartbeat,
};
use crate::meta::placement::PlacementManager;
use crate::meta::raft_node::{ConsensusLog, LogEntry};
use crate::meta::registry::{HeartbeatOutcome, InstanceRegistry};
use crate::meta::snapshot::{self, LoadReport, SnapshotStore};
use crate::meta::topology::TopologyRegistry;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub struct ClusterManager {
    node_id: String,
    config: ClusterConfig,
    topology: Arc<TopologyRegistry>,
    registry: Arc<InstanceRegistry>,
    placement: PlacementManager,
    gateway: MutationGateway,
    log: Arc<dyn ConsensusLog>,
    /// Term of the last leadership reset, 0 before the first one
    reset_term: AtomicU64,
}

impl ClusterManager {
    /// Manager without write-through persistence
    pub fn new(node_id: String, config: ClusterConfig, log: Arc<dyn ConsensusLog>) -> Self {
        Self::build(node_id, config, log, None)
    }

    /// Manager that writes every applied change to `store`
    pub fn with_store(
        node_id: String,
        config: ClusterConfig,
        log: Arc<dyn ConsensusLog>,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self::build(node_id, config, log, Some(store))
    }

    fn build(
        node_id: String,
        config: ClusterConfig,
        log: Arc<dyn ConsensusLog>,
        store: Option<Arc<dyn SnapshotStore>>,
    ) -> Self {
        let topology = Arc::new(TopologyRegistry::new());
        let registry = Arc::new(InstanceRegistry::new());
        let mut gateway = MutationGateway::new(node_id.clone(), topology.clone(), registry.clone());
        if let Some(store) = store {
            gateway = gateway.with_store(store);
        }
        Self {
            placement: PlacementManager::new(config.tag_policy),
            node_id,
            config,
            topology,
            registry,
            gateway,
            log,
            reset_term: AtomicU64::new(0),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn is_leader(&self) -> bool {
        self.log.is_leader()
    }

    pub fn leader(&self) -> Option<String> {
        self.log.leader()
    }

    pub fn topology(&self) -> &TopologyRegistry {
        &self.topology
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    pub fn gateway(&self) -> &MutationGateway {
        &self.gateway
    }

    // === Replicated mutations ===

    /// Propose a membership change and wait until it is applied locally.
    ///
    /// Dropping the returned future does not withdraw the proposal.
    pub async fn submit(&self, mutation: Mutation) -> Result<()> {
        validate(&mutation)?;
        if !self.log.is_leader() {
            return Err(Error::NotLeader(
                self.log.leader().unwrap_or_else(|| "unknown".to_string()),
            ));
        }

        let kind = mutation.kind();
        let (proposal, rx) = self.gateway.prepare(mutation, timestamp_now_micros());
        let seq = proposal.seq;
        let proposed = proposal.encode().and_then(|data| self.log.propose(data));
        if let Err(e) = proposed {
            self.gateway.pending().cancel(seq);
            return Err(e);
        }

        match tokio::time::timeout(self.config.commit_timeout(), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Internal(format!("{} response channel closed", kind))),
            Err(_) => {
                self.gateway.pending().cancel(seq);
                Err(Error::Timeout(format!(
                    "{} not committed within {:?}",
                    kind,
                    self.config.commit_timeout()
                )))
            }
        }
    }

    /// Apply callback for committed log entries
    pub fn apply_entry(&self, index: u64, data: &[u8]) {
        self.gateway.apply_entry(index, data);
    }

    // === Heartbeats ===

    /// Stats-only heartbeat: refresh self-reported fields, keep placement
    pub fn process_instance_heartbeat(&self, spec: &InstanceSpec) -> HeartbeatOutcome {
        let outcome = self
            .registry
            .apply_heartbeat(spec, None, timestamp_now_micros());
        tracing::debug!("Instance heartbeat from {}: {:?}", spec.address, outcome);
        outcome
    }

    /// Heartbeat handling at an explicit time, without the bootstrap path
    pub fn apply_store_heartbeat_at(&self, heartbeat: &StoreHeartbeat, now_us: i64) -> HeartbeatOutcome {
        let outcome =
            self.registry
                .apply_heartbeat(&heartbeat.instance, Some(heartbeat.placement()), now_us);
        tracing::debug!(
            "Heartbeat from {}: {:?} ({} table(s))",
            heartbeat.instance.address,
            outcome,
            heartbeat.regions.len()
        );
        outcome
    }

    /// Full store heartbeat path.
    ///
    /// Unknown stores are ignored, unless bootstrap is enabled and this node
    /// leads: then the store is proposed as a new instance.
    pub async fn process_store_heartbeat(&self, heartbeat: &StoreHeartbeat) -> HeartbeatOutcome {
        let outcome = self.apply_store_heartbeat_at(heartbeat, timestamp_now_micros());
        if outcome != HeartbeatOutcome::Unknown {
            return outcome;
        }

        if !self.config.bootstrap_from_heartbeat || !self.is_leader() {
            tracing::debug!(
                "Ignoring heartbeat from unregistered instance {}",
                heartbeat.instance.address
            );
            return outcome;
        }

        let address = heartbeat.instance.address.clone();
        match self
            .submit(Mutation::AddInstance(heartbeat.instance.clone()))
            .await
        {
            Ok(()) => {
                tracing::info!("Registered instance {} from its heartbeat", address);
                self.apply_store_heartbeat_at(heartbeat, timestamp_now_micros())
            }
            Err(Error::AlreadyExists(_)) => {
                self.apply_store_heartbeat_at(heartbeat, timestamp_now_micros())
            }
            Err(e) => {
                tracing::warn!("Could not register instance {} from heartbeat: {}", address, e);
                outcome
            }
        }
    }

    pub fn set_instance_regions(&self, address: &str, placement: InstancePlacement) -> Result<()> {
        self.registry.set_instance_regions(address, placement)
    }

    // === Leadership ===

    /// Leadership acquired for `term`: trust nothing the previous leader collected
    pub fn on_leader_start(&self, term: u64) {
        tracing::info!(
            "Node {} leads term {}: resetting {} instance(s) to NORMAL and clearing placement",
            self.node_id,
            term,
            self.registry.len()
        );
        self.registry.reset_instance_status(timestamp_now_micros());
        self.reset_term.store(term, Ordering::SeqCst);
    }

    /// Term of the most recent leadership reset
    pub fn reset_term(&self) -> Option<u64> {
        match self.reset_term.load(Ordering::SeqCst) {
            0 => None,
            term => Some(term),
        }
    }

    // === Selection ===

    pub fn select_instance_rolling(
        &self,
        resource_tag: &str,
        excluded: &BTreeSet<String>,
    ) -> Result<String> {
        self.placement
            .select_rolling(&self.registry, resource_tag, excluded)
    }

    pub fn select_instance_min(
        &self,
        resource_tag: &str,
        excluded: &BTreeSet<String>,
        table_id: i64,
    ) -> Result<String> {
        self.placement
            .select_min_load(&self.registry, resource_tag, excluded, table_id)
    }

    pub fn sub_peer_count(&self, address: &str, table_id: i64) {
        self.registry.sub_peer_count(address, table_id);
    }

    // === Queries ===

    pub fn logical_rooms(&self) -> Vec<LogicalRoom> {
        self.topology.logical_rooms()
    }

    pub fn instances(&self) -> Vec<Instance> {
        self.registry.list()
    }

    pub fn instance(&self, address: &str) -> Option<Instance> {
        self.registry.get(address)
    }

    pub fn instance_count(&self, resource_tag: &str) -> usize {
        self.registry.instance_count(resource_tag)
    }

    pub fn peer_count(&self, table_id: i64) -> i64 {
        self.registry.peer_count(table_id)
    }

    pub fn peer_count_on(&self, address: &str, table_id: i64) -> i64 {
        self.registry.peer_count_on(address, table_id)
    }

    // === Snapshots ===

    /// Rebuild registries from `store` (startup or snapshot installation)
    pub fn load_snapshot(&self, store: &dyn SnapshotStore) -> Result<LoadReport> {
        let report = snapshot::load_snapshot(store, &self.topology, &self.registry)?;
        self.gateway
            .set_applied_index(report.applied_index.unwrap_or(0));
        Ok(report)
    }

    pub fn save_snapshot(&self, store: &dyn SnapshotStore) -> Result<usize> {
        self.gateway.save_snapshot(store)
    }
}

fn validate(mutation: &Mutation) -> Result<()> {
    let non_empty = |what: &str, value: &str| {
        if value.is_empty() {
            Err(Error::InvalidArgument(format!("{} must not be empty", what)))
        } else {
            Ok(())
        }
    };

    match mutation {
        Mutation::AddLogical { name } | Mutation::DropLogical { name } => {
            non_empty("logical room", name)
        }
        Mutation::AddPhysical { logical, physical } | Mutation::DropPhysical { logical, physical } => {
            non_empty("logical room", logical)?;
            non_empty("physical room", physical)
        }
        Mutation::MovePhysical { physical, from, to } => {
            non_empty("physical room", physical)?;
            non_empty("source logical room", from)?;
            non_empty("destination logical room", to)
        }
        Mutation::AddInstance(spec) | Mutation::UpdateInstance(spec) => {
            validate_address(&spec.address)
        }
        Mutation::DropInstance { address } | Mutation::SetInstanceDead { address } => {
            validate_address(address)
        }
    }
}

/// Feed committed entries to the manager
pub fn start_apply_task(
    manager: Arc<ClusterManager>,
    mut commits: mpsc::UnboundedReceiver<LogEntry>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(entry) = commits.recv().await {
            manager.apply_entry(entry.index, &entry.data);
        }
        tracing::info!("Commit stream closed, apply task exiting");
    })
}

/// Reset liveness state once for every term this node leads.
///
/// Keyed on the term, not on a leader flag: a step-down and re-election
/// between two polls still shows up as a new term.
pub fn start_leadership_task(
    manager: Arc<ClusterManager>,
    mut leadership: watch::Receiver<Option<u64>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut handled: Option<u64> = None;
        loop {
            let current = *leadership.borrow_and_update();
            if let Some(term) = current {
                if handled != Some(term) {
                    manager.on_leader_start(term);
                    handled = Some(term);
                }
            }
            if leadership.changed().await.is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::raft_node::RaftNode;

    fn manager() -> (Arc<ClusterManager>, Arc<RaftNode>, JoinHandle<()>) {
        let (raft, commits) = RaftNode::new("meta-1".to_string());
        let raft = Arc::new(raft);
        raft.become_leader();
        let manager = Arc::new(ClusterManager::new(
            "meta-1".to_string(),
            ClusterConfig::default(),
            raft.clone(),
        ));
        let apply = start_apply_task(manager.clone(), commits);
        (manager, raft, apply)
    }

    #[tokio::test]
    async fn test_submit_applies_and_returns() {
        let (manager, raft, _apply) = manager();

        manager
            .submit(Mutation::AddLogical { name: "bj".into() })
            .await
            .unwrap();
        assert!(manager.topology().logical_room("bj").is_some());
        assert_eq!(raft.log_len(), 1);

        let err = manager
            .submit(Mutation::AddLogical { name: "bj".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        assert!(manager.gateway().pending().is_empty());
    }

    #[tokio::test]
    async fn test_submit_on_follower() {
        let (manager, raft, _apply) = manager();
        raft.step_down(2, Some("meta-2".into()));

        let err = manager
            .submit(Mutation::AddLogical { name: "bj".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotLeader(ref leader) if leader == "meta-2"));
        assert_eq!(raft.log_len(), 0);
    }

    #[tokio::test]
    async fn test_submit_rejects_bad_arguments_before_proposing() {
        let (manager, raft, _apply) = manager();

        let err = manager
            .submit(Mutation::AddInstance(InstanceSpec::new("no-port", 1)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(manager
            .submit(Mutation::AddLogical { name: String::new() })
            .await
            .is_err());
        assert_eq!(raft.log_len(), 0);
    }

    #[tokio::test]
    async fn test_submit_times_out_without_commit() {
        let (raft, _commits) = RaftNode::new("meta-1".to_string());
        let raft = Arc::new(raft);
        raft.become_leader();
        let config = ClusterConfig {
            commit_timeout_ms: 50,
            ..Default::default()
        };
        // nobody drains the commit channel
        let manager = ClusterManager::new("meta-1".to_string(), config, raft);

        let err = manager
            .submit(Mutation::AddLogical { name: "bj".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(manager.gateway().pending().is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_from_unknown_instance_is_ignored() {
        let (manager, raft, _apply) = manager();
        let heartbeat = StoreHeartbeat {
            instance: InstanceSpec::new("10.0.0.1:8010", 100),
            regions: vec![],
        };

        let outcome = manager.process_store_heartbeat(&heartbeat).await;
        assert_eq!(outcome, HeartbeatOutcome::Unknown);
        assert!(manager.instance("10.0.0.1:8010").is_none());
        assert_eq!(raft.log_len(), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_bootstrap_proposes_instance() {
        let (raft, commits) = RaftNode::new("meta-1".to_string());
        let raft = Arc::new(raft);
        raft.become_leader();
        let config = ClusterConfig {
            bootstrap_from_heartbeat: true,
            ..Default::default()
        };
        let manager = Arc::new(ClusterManager::new("meta-1".to_string(), config, raft.clone()));
        let _apply = start_apply_task(manager.clone(), commits);

        let heartbeat = StoreHeartbeat {
            instance: InstanceSpec::new("10.0.0.1:8010", 100).with_resource_tag("ssd"),
            regions: vec![crate::meta::model::TableRegionReport {
                table_id: 3,
                region_ids: vec![1, 2],
                region_count: 2,
            }],
        };
        let outcome = manager.process_store_heartbeat(&heartbeat).await;

        assert_eq!(
            outcome,
            HeartbeatOutcome::Refreshed(crate::meta::model::InstanceStatus::Normal)
        );
        assert_eq!(raft.log_len(), 1);
        assert_eq!(manager.peer_count_on("10.0.0.1:8010", 3), 2);
        assert_eq!(manager.instance_count("ssd"), 1);
    }

    async fn wait_for_reset(manager: &ClusterManager, term: u64) {
        for _ in 0..200 {
            if manager.reset_term() == Some(term) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("no leadership reset for term {}", term);
    }

    #[tokio::test]
    async fn test_leadership_task_resets_state_on_reelection() {
        let (raft, commits) = RaftNode::new("meta-1".to_string());
        let raft = Arc::new(raft);
        let manager = Arc::new(ClusterManager::new(
            "meta-1".to_string(),
            ClusterConfig::default(),
            raft.clone(),
        ));
        let _apply = start_apply_task(manager.clone(), commits);
        let _leadership = start_leadership_task(manager.clone(), raft.subscribe_leadership());
        manager
            .registry()
            .add_instance(&InstanceSpec::new("10.0.0.1:8010", 100), 1)
            .unwrap();

        assert_eq!(raft.become_leader(), 1);
        wait_for_reset(&manager, 1).await;

        // dirtied after the first reset has landed
        manager.registry().set_instance_dead("10.0.0.1:8010").unwrap();
        manager
            .set_instance_regions(
                "10.0.0.1:8010",
                InstancePlacement::from([(
                    7,
                    crate::meta::model::TableRegions {
                        region_ids: vec![1, 2],
                        region_count: 2,
                    },
                )]),
            )
            .unwrap();

        // back-to-back: the task never observes the follower state
        raft.step_down(5, None);
        assert_eq!(raft.become_leader(), 6);
        wait_for_reset(&manager, 6).await;

        assert!(manager.instance("10.0.0.1:8010").unwrap().is_normal());
        assert_eq!(manager.peer_count_on("10.0.0.1:8010", 7), 0);
    }

    #[tokio::test]
    async fn test_instance_heartbeat_keeps_placement() {
        let (manager, _raft, _apply) = manager();
        manager
            .submit(Mutation::AddInstance(InstanceSpec::new("10.0.0.1:8010", 100)))
            .await
            .unwrap();
        let heartbeat = StoreHeartbeat {
            instance: InstanceSpec::new("10.0.0.1:8010", 100),
            regions: vec![crate::meta::model::TableRegionReport {
                table_id: 3,
                region_ids: vec![1, 2, 3],
                region_count: 3,
            }],
        };
        manager.apply_store_heartbeat_at(&heartbeat, 1);

        let outcome = manager.process_instance_heartbeat(
            &InstanceSpec::new("10.0.0.1:8010", 200).with_used_size(50),
        );
        assert_eq!(
            outcome,
            HeartbeatOutcome::Refreshed(crate::meta::model::InstanceStatus::Normal)
        );
        let instance = manager.instance("10.0.0.1:8010").unwrap();
        assert_eq!((instance.capacity, instance.used_size), (200, 50));
        assert_eq!(manager.peer_count_on("10.0.0.1:8010", 3), 3);

        let outcome = manager.process_instance_heartbeat(&InstanceSpec::new("10.0.0.9:8010", 1));
        assert_eq!(outcome, HeartbeatOutcome::Unknown);
        assert!(manager.instance("10.0.0.9:8010").is_none());
    }
}
