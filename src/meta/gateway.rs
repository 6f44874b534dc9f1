//! Mutation gateway: the apply side of the consensus log
//!
//! A request becomes a [`Proposal`]; the submitter parks a oneshot channel in
//! [`PendingResponses`] under the proposal's sequence number and goes to
//! sleep. When the entry commits, every replica runs
//! [`MutationGateway::apply_entry`]; only the originating replica finds a
//! waiter to wake.
//!
//! With a store attached, the records an entry touched are written before
//! the waiter hears about it, so an acknowledged change survives a crash.

use crate::common::{Error, Result};
use crate::meta::model::Mutation;
use crate::meta::registry::InstanceRegistry;
use crate::meta::snapshot::{self, RecordBatch, SnapshotStore};
use crate::meta::topology::TopologyRegistry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Record replicated through the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    /// Node that submitted the proposal
    pub origin: String,
    /// Correlation id, unique per origin
    pub seq: u64,
    /// Submission time; every replica stamps instances with this value
    pub submitted_at_us: i64,
    pub mutation: Mutation,
}

impl Proposal {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

/// Callers waiting for their proposal to commit
#[derive(Debug, Default)]
pub struct PendingResponses {
    next_seq: AtomicU64,
    waiters: Mutex<HashMap<u64, oneshot::Sender<Result<()>>>>,
}

impl PendingResponses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> (u64, oneshot::Receiver<Result<()>>) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(seq, tx);
        (seq, rx)
    }

    /// Deliver the outcome of `seq`. Returns false when nobody is listening
    /// any more, which is not an error: the mutation has been applied anyway.
    pub fn complete(&self, seq: u64, result: Result<()>) -> bool {
        let Some(tx) = self.waiters.lock().remove(&seq) else {
            return false;
        };
        tx.send(result).is_ok()
    }

    pub fn cancel(&self, seq: u64) {
        self.waiters.lock().remove(&seq);
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }
}

/// Apply one mutation to the registries
pub fn apply_mutation(
    topology: &TopologyRegistry,
    registry: &InstanceRegistry,
    mutation: &Mutation,
    timestamp_us: i64,
) -> Result<()> {
    match mutation {
        Mutation::AddLogical { name } => topology.add_logical(name),
        Mutation::DropLogical { name } => topology.drop_logical(name),
        Mutation::AddPhysical { logical, physical } => topology.add_physical(logical, physical),
        Mutation::DropPhysical { logical, physical } => {
            let owned_here = topology.logical_of(physical).as_deref() == Some(logical.as_str());
            if owned_here && registry.is_room_referenced(physical) {
                return Err(Error::NotEmpty(format!(
                    "physical room {} still hosts instances",
                    physical
                )));
            }
            topology.drop_physical(logical, physical)
        }
        Mutation::MovePhysical { physical, from, to } => {
            topology.move_physical(physical, from, to)
        }
        Mutation::AddInstance(spec) => {
            if !spec.physical_room.is_empty() && !topology.physical_exists(&spec.physical_room) {
                return Err(Error::NotFound(format!(
                    "physical room {}",
                    spec.physical_room
                )));
            }
            registry.add_instance(spec, timestamp_us)
        }
        Mutation::DropInstance { address } => registry.drop_instance(address),
        Mutation::UpdateInstance(spec) => registry.update_instance(spec, timestamp_us),
        Mutation::SetInstanceDead { address } => registry.set_instance_dead(address),
    }
}

/// Applies committed proposals and wakes their submitters
pub struct MutationGateway {
    node_id: String,
    topology: Arc<TopologyRegistry>,
    registry: Arc<InstanceRegistry>,
    pending: PendingResponses,
    applied_index: AtomicU64,
    store: Option<Arc<dyn SnapshotStore>>,
    /// Orders per-entry writes against full snapshots
    write_lock: Mutex<()>,
}

impl MutationGateway {
    pub fn new(
        node_id: String,
        topology: Arc<TopologyRegistry>,
        registry: Arc<InstanceRegistry>,
    ) -> Self {
        Self {
            node_id,
            topology,
            registry,
            pending: PendingResponses::new(),
            applied_index: AtomicU64::new(0),
            store: None,
            write_lock: Mutex::new(()),
        }
    }

    /// Write the records of every applied entry to `store`
    pub fn with_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn pending(&self) -> &PendingResponses {
        &self.pending
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index.load(Ordering::SeqCst)
    }

    /// Restored from a snapshot; entries up to `index` are already reflected
    pub fn set_applied_index(&self, index: u64) {
        self.applied_index.store(index, Ordering::SeqCst);
    }

    /// Build a proposal originating from this node
    pub fn prepare(&self, mutation: Mutation, submitted_at_us: i64) -> (Proposal, oneshot::Receiver<Result<()>>) {
        let (seq, rx) = self.pending.register();
        let proposal = Proposal {
            origin: self.node_id.clone(),
            seq,
            submitted_at_us,
            mutation,
        };
        (proposal, rx)
    }

    /// Apply a committed log entry.
    ///
    /// Entries at or below the applied index are skipped, so replaying the
    /// log after a restart leaves the registries untouched.
    pub fn apply_entry(&self, index: u64, data: &[u8]) {
        let applied = self.applied_index();
        if index <= applied {
            tracing::debug!("Skipping log entry {} (applied up to {})", index, applied);
            return;
        }

        let proposal = match Proposal::decode(data) {
            Ok(proposal) => proposal,
            Err(e) => {
                tracing::error!("Undecodable log entry {}: {}", index, e);
                self.applied_index.store(index, Ordering::SeqCst);
                if let Err(e) = self.persist(index, None) {
                    tracing::error!("Failed to persist applied index {}: {}", index, e);
                }
                return;
            }
        };

        let kind = proposal.mutation.kind();
        let mut result = apply_mutation(
            &self.topology,
            &self.registry,
            &proposal.mutation,
            proposal.submitted_at_us,
        );
        match &result {
            Ok(()) => tracing::info!("Applied {} at index {}: {:?}", kind, index, proposal.mutation),
            Err(e) => tracing::warn!("Rejected {} at index {}: {}", kind, index, e),
        }
        self.applied_index.store(index, Ordering::SeqCst);

        let touched = result.is_ok().then_some(&proposal.mutation);
        if let Err(e) = self.persist(index, touched) {
            tracing::error!("Failed to persist {} at index {}: {}", kind, index, e);
            if result.is_ok() {
                result = Err(Error::Internal(format!(
                    "{} applied at index {} but not persisted: {}",
                    kind, index, e
                )));
            }
        }

        if proposal.origin == self.node_id && !self.pending.complete(proposal.seq, result) {
            tracing::debug!("No waiter for {} (seq {}), caller went away", kind, proposal.seq);
        }
    }

    /// Write the records `mutation` touched together with the applied index
    fn persist(&self, index: u64, mutation: Option<&Mutation>) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let _guard = self.write_lock.lock();
        let batch = match mutation {
            Some(mutation) => RecordBatch::for_mutation(mutation, &self.topology, &self.registry)?,
            None => RecordBatch::default(),
        };
        store.write_batch(batch.with_applied_index(index)?)
    }

    /// Full dump into `store`, replacing what is there.
    ///
    /// Holds the write lock so a dump taken before an apply never lands on
    /// top of that apply's records.
    pub fn save_snapshot(&self, store: &dyn SnapshotStore) -> Result<usize> {
        let _guard = self.write_lock.lock();
        snapshot::save_snapshot(store, &self.topology, &self.registry, self.applied_index())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::model::InstanceSpec;
    use crate::meta::snapshot::{instance_key, load_snapshot, logical_key, MemorySnapshotStore};

    fn gateway(node_id: &str) -> MutationGateway {
        MutationGateway::new(
            node_id.to_string(),
            Arc::new(TopologyRegistry::new()),
            Arc::new(InstanceRegistry::new()),
        )
    }

    fn entry(origin: &str, seq: u64, mutation: Mutation) -> Vec<u8> {
        Proposal {
            origin: origin.to_string(),
            seq,
            submitted_at_us: 1_000,
            mutation,
        }
        .encode()
        .unwrap()
    }

    #[tokio::test]
    async fn test_apply_wakes_submitter() {
        let gateway = gateway("meta-1");
        let (proposal, rx) = gateway.prepare(Mutation::AddLogical { name: "bj".into() }, 1_000);

        gateway.apply_entry(1, &proposal.encode().unwrap());

        assert!(rx.await.unwrap().is_ok());
        assert!(gateway.pending().is_empty());
        assert!(gateway.topology.logical_room("bj").is_some());
    }

    #[tokio::test]
    async fn test_apply_reports_registry_error() {
        let gateway = gateway("meta-1");
        gateway.apply_entry(1, &entry("meta-2", 1, Mutation::AddLogical { name: "bj".into() }));

        let (proposal, rx) = gateway.prepare(Mutation::AddLogical { name: "bj".into() }, 2_000);
        gateway.apply_entry(2, &proposal.encode().unwrap());

        assert!(matches!(rx.await.unwrap(), Err(Error::AlreadyExists(_))));
    }

    #[test]
    fn test_dropped_caller_is_a_noop() {
        let gateway = gateway("meta-1");
        let (proposal, rx) = gateway.prepare(Mutation::AddLogical { name: "bj".into() }, 1_000);
        drop(rx);

        gateway.apply_entry(1, &proposal.encode().unwrap());

        assert!(gateway.topology.logical_room("bj").is_some());
        assert!(gateway.pending().is_empty());
    }

    #[test]
    fn test_foreign_proposals_do_not_touch_local_waiters() {
        let gateway = gateway("meta-1");
        let (_proposal, _rx) = gateway.prepare(Mutation::AddLogical { name: "x".into() }, 1);

        // same seq, other origin
        gateway.apply_entry(1, &entry("meta-2", 1, Mutation::AddLogical { name: "bj".into() }));
        assert_eq!(gateway.pending().len(), 1);
    }

    #[test]
    fn test_replayed_entries_are_skipped() {
        let gateway = gateway("meta-1");
        let add = entry(
            "meta-2",
            1,
            Mutation::AddInstance(InstanceSpec::new("10.0.0.1:8010", 100)),
        );
        let drop = entry(
            "meta-2",
            2,
            Mutation::DropInstance {
                address: "10.0.0.1:8010".into(),
            },
        );

        gateway.apply_entry(1, &add);
        gateway.apply_entry(2, &drop);
        gateway.apply_entry(1, &add);
        gateway.apply_entry(2, &drop);

        assert!(gateway.registry.is_empty());
        assert_eq!(gateway.applied_index(), 2);
    }

    #[test]
    fn test_undecodable_entry_advances_index() {
        let gateway = gateway("meta-1");
        gateway.apply_entry(1, b"\xff\xff\xff");
        assert_eq!(gateway.applied_index(), 1);
    }

    struct FailingStore;

    impl SnapshotStore for FailingStore {
        fn scan_prefix(&self, _prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
            Ok(Vec::new())
        }

        fn replace_prefix(&self, _prefix: &[u8], _records: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
            Err(Error::Internal("disk full".into()))
        }

        fn write_batch(&self, _batch: RecordBatch) -> Result<()> {
            Err(Error::Internal("disk full".into()))
        }
    }

    #[tokio::test]
    async fn test_applied_records_are_written_before_reply() {
        let store = Arc::new(MemorySnapshotStore::new());
        let gateway = gateway("meta-1").with_store(store.clone());

        let (proposal, rx) = gateway.prepare(Mutation::AddLogical { name: "bj".into() }, 1_000);
        gateway.apply_entry(1, &proposal.encode().unwrap());
        let (proposal, rx2) = gateway.prepare(
            Mutation::AddInstance(InstanceSpec::new("10.0.0.1:8010", 100)),
            2_000,
        );
        gateway.apply_entry(2, &proposal.encode().unwrap());
        // rejected: only the index moves
        gateway.apply_entry(3, &entry("meta-2", 9, Mutation::AddLogical { name: "bj".into() }));

        assert!(rx.await.unwrap().is_ok());
        assert!(rx2.await.unwrap().is_ok());
        assert_eq!(store.scan_prefix(&logical_key("bj")).unwrap().len(), 1);
        assert_eq!(store.scan_prefix(&instance_key("10.0.0.1:8010")).unwrap().len(), 1);

        let topology = TopologyRegistry::new();
        let registry = InstanceRegistry::new();
        let report = load_snapshot(store.as_ref(), &topology, &registry).unwrap();
        assert_eq!(report.applied_index, Some(3));
        assert!(topology.logical_room("bj").is_some());
        assert_eq!(registry.get("10.0.0.1:8010").unwrap().health.timestamp_us, 2_000);
    }

    #[tokio::test]
    async fn test_unpersisted_change_is_not_acknowledged() {
        let gateway = gateway("meta-1").with_store(Arc::new(FailingStore));
        let (proposal, rx) = gateway.prepare(Mutation::AddLogical { name: "bj".into() }, 1_000);

        gateway.apply_entry(1, &proposal.encode().unwrap());

        assert!(matches!(rx.await.unwrap(), Err(Error::Internal(_))));
        assert_eq!(gateway.applied_index(), 1);
    }

    #[test]
    fn test_drop_physical_with_instances_is_rejected() {
        let topology = TopologyRegistry::new();
        let registry = InstanceRegistry::new();
        let apply = |m: Mutation| apply_mutation(&topology, &registry, &m, 10);

        apply(Mutation::AddLogical { name: "bj".into() }).unwrap();
        apply(Mutation::AddPhysical {
            logical: "bj".into(),
            physical: "bj-1".into(),
        })
        .unwrap();
        apply(Mutation::AddInstance(
            InstanceSpec::new("10.0.0.1:8010", 100).with_physical_room("bj-1"),
        ))
        .unwrap();

        let drop_room = Mutation::DropPhysical {
            logical: "bj".into(),
            physical: "bj-1".into(),
        };
        assert!(matches!(apply(drop_room.clone()), Err(Error::NotEmpty(_))));

        apply(Mutation::DropInstance {
            address: "10.0.0.1:8010".into(),
        })
        .unwrap();
        apply(drop_room).unwrap();
        assert!(!topology.physical_exists("bj-1"));
    }

    #[test]
    fn test_add_instance_requires_known_room() {
        let topology = TopologyRegistry::new();
        let registry = InstanceRegistry::new();

        let result = apply_mutation(
            &topology,
            &registry,
            &Mutation::AddInstance(InstanceSpec::new("10.0.0.1:8010", 1).with_physical_room("nowhere")),
            10,
        );
        assert!(matches!(result, Err(Error::NotFound(_))));
        assert!(registry.is_empty());

        // no room at all is fine
        apply_mutation(
            &topology,
            &registry,
            &Mutation::AddInstance(InstanceSpec::new("10.0.0.1:8010", 1)),
            10,
        )
        .unwrap();
        assert_eq!(registry.get("10.0.0.1:8010").unwrap().health.timestamp_us, 10);
    }
}
