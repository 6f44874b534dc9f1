//! Snapshot key layout, loader and writer
//!
//! ```text
//! cluster/logical/<logical-name>    -> LogicalRoomsRecord
//! cluster/physical/<logical-name>   -> PhysicalRoomsRecord
//! cluster/instance/<address>        -> Instance
//! cluster/applied_index             -> u64
//! ```
//!
//! Every applied mutation writes the records it touched through
//! [`RecordBatch`]; the full dump only compacts what is already there.
//!
//! Older dumps kept every logical room in one aggregated record; a
//! [`LogicalRoomsRecord`] lists names for exactly that reason, so both
//! layouts load the same way.

use crate::common::{Error, Result};
use crate::meta::model::{Instance, Mutation};
use crate::meta::registry::InstanceRegistry;
use crate::meta::topology::TopologyRegistry;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const CLUSTER_PREFIX: &str = "cluster/";
pub const LOGICAL_MARKER: &str = "logical/";
pub const PHYSICAL_MARKER: &str = "physical/";
pub const INSTANCE_MARKER: &str = "instance/";
pub const APPLIED_INDEX_MARKER: &str = "applied_index";

pub fn logical_key(name: &str) -> Vec<u8> {
    format!("{}{}{}", CLUSTER_PREFIX, LOGICAL_MARKER, name).into_bytes()
}

pub fn physical_key(logical: &str) -> Vec<u8> {
    format!("{}{}{}", CLUSTER_PREFIX, PHYSICAL_MARKER, logical).into_bytes()
}

pub fn instance_key(address: &str) -> Vec<u8> {
    format!("{}{}{}", CLUSTER_PREFIX, INSTANCE_MARKER, address).into_bytes()
}

pub fn applied_index_key() -> Vec<u8> {
    format!("{}{}", CLUSTER_PREFIX, APPLIED_INDEX_MARKER).into_bytes()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalRoomsRecord {
    pub names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalRoomsRecord {
    pub physical_rooms: Vec<String>,
}

/// Persistent key/value store holding snapshots
pub trait SnapshotStore: Send + Sync {
    /// All pairs whose key starts with `prefix`, in key order
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Atomically replace everything under `prefix` with `records`
    fn replace_prefix(&self, prefix: &[u8], records: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()>;

    /// Atomically write `batch`; deletes of missing keys are no-ops
    fn write_batch(&self, batch: RecordBatch) -> Result<()>;
}

/// Puts and deletes written together
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecordBatch {
    pub puts: Vec<(Vec<u8>, Vec<u8>)>,
    pub deletes: Vec<Vec<u8>>,
}

impl RecordBatch {
    /// Current records of everything `mutation` can change.
    ///
    /// Read after the mutation was applied, so a record whose subject no
    /// longer exists turns into a delete.
    pub fn for_mutation(
        mutation: &Mutation,
        topology: &TopologyRegistry,
        registry: &InstanceRegistry,
    ) -> Result<Self> {
        let mut batch = Self::default();
        match mutation {
            Mutation::AddLogical { name } | Mutation::DropLogical { name } => {
                batch.logical_room(topology, name)?;
            }
            Mutation::AddPhysical { logical, .. } | Mutation::DropPhysical { logical, .. } => {
                batch.physical_set(topology, logical)?;
            }
            Mutation::MovePhysical { from, to, .. } => {
                batch.physical_set(topology, from)?;
                batch.physical_set(topology, to)?;
            }
            Mutation::AddInstance(spec) | Mutation::UpdateInstance(spec) => {
                batch.instance(registry, &spec.address)?;
            }
            Mutation::DropInstance { address } | Mutation::SetInstanceDead { address } => {
                batch.instance(registry, address)?;
            }
        }
        Ok(batch)
    }

    pub fn with_applied_index(mut self, index: u64) -> Result<Self> {
        self.puts
            .push((applied_index_key(), bincode::serialize(&index)?));
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.puts.is_empty() && self.deletes.is_empty()
    }

    fn logical_room(&mut self, topology: &TopologyRegistry, name: &str) -> Result<()> {
        if topology.logical_room(name).is_some() {
            let record = LogicalRoomsRecord {
                names: vec![name.to_string()],
            };
            self.puts.push((logical_key(name), bincode::serialize(&record)?));
        } else {
            self.deletes.push(logical_key(name));
        }
        self.physical_set(topology, name)
    }

    fn physical_set(&mut self, topology: &TopologyRegistry, logical: &str) -> Result<()> {
        match topology.logical_room(logical) {
            Some(room) => {
                let record = PhysicalRoomsRecord {
                    physical_rooms: room.physical_rooms.into_iter().collect(),
                };
                self.puts
                    .push((physical_key(logical), bincode::serialize(&record)?));
            }
            None => self.deletes.push(physical_key(logical)),
        }
        Ok(())
    }

    fn instance(&mut self, registry: &InstanceRegistry, address: &str) -> Result<()> {
        match registry.get(address) {
            Some(instance) => self
                .puts
                .push((instance_key(address), bincode::serialize(&instance)?)),
            None => self.deletes.push(instance_key(address)),
        }
        Ok(())
    }
}

/// In-memory snapshot store
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.data.write().insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .data
            .read()
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn replace_prefix(&self, prefix: &[u8], records: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
        let mut data = self.data.write();
        data.retain(|key, _| !key.starts_with(prefix));
        data.extend(records);
        Ok(())
    }

    fn write_batch(&self, batch: RecordBatch) -> Result<()> {
        let mut data = self.data.write();
        for key in &batch.deletes {
            data.remove(key);
        }
        data.extend(batch.puts);
        Ok(())
    }
}

/// Outcome of a snapshot load
#[derive(Debug, Default)]
pub struct LoadReport {
    pub scanned: usize,
    pub logical_rooms: usize,
    pub physical_sets: usize,
    pub instances: usize,
    pub applied_index: Option<u64>,
    /// Records that could not be decoded, as `MalformedSnapshotRecord` errors
    pub skipped: Vec<Error>,
}

impl LoadReport {
    pub fn recovered(&self) -> usize {
        self.logical_rooms + self.physical_sets + self.instances + usize::from(self.applied_index.is_some())
    }
}

enum RecordKind<'a> {
    Logical(&'a str),
    Physical(&'a str),
    Instance(&'a str),
    AppliedIndex,
}

fn route(key: &str) -> Option<RecordKind<'_>> {
    let rest = key.strip_prefix(CLUSTER_PREFIX)?;
    if let Some(name) = rest.strip_prefix(LOGICAL_MARKER) {
        Some(RecordKind::Logical(name))
    } else if let Some(logical) = rest.strip_prefix(PHYSICAL_MARKER) {
        Some(RecordKind::Physical(logical))
    } else if let Some(address) = rest.strip_prefix(INSTANCE_MARKER) {
        Some(RecordKind::Instance(address))
    } else if rest == APPLIED_INDEX_MARKER {
        Some(RecordKind::AppliedIndex)
    } else {
        None
    }
}

fn malformed(key: &str, reason: impl std::fmt::Display) -> Error {
    Error::MalformedSnapshotRecord {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

/// Replace registry contents with the dump found in `store`.
///
/// Bad records are logged and skipped; only a failing store aborts the load.
pub fn load_snapshot(
    store: &dyn SnapshotStore,
    topology: &TopologyRegistry,
    registry: &InstanceRegistry,
) -> Result<LoadReport> {
    let records = store.scan_prefix(CLUSTER_PREFIX.as_bytes())?;
    topology.clear();
    registry.clear();

    let mut report = LoadReport {
        scanned: records.len(),
        ..Default::default()
    };

    for (raw_key, value) in &records {
        let key = String::from_utf8_lossy(raw_key);
        if let Err(e) = load_record(&key, value, topology, registry, &mut report) {
            tracing::warn!("Skipping snapshot record: {}", e);
            report.skipped.push(e);
        }
    }

    if report.scanned > 0 && report.recovered() == 0 {
        tracing::warn!(
            "Snapshot held {} record(s) but none could be recovered; waiting for heartbeats",
            report.scanned
        );
    } else {
        tracing::info!(
            "Loaded snapshot: {} logical room record(s), {} physical set(s), {} instance(s), {} skipped",
            report.logical_rooms,
            report.physical_sets,
            report.instances,
            report.skipped.len()
        );
    }

    Ok(report)
}

fn load_record(
    key: &str,
    value: &[u8],
    topology: &TopologyRegistry,
    registry: &InstanceRegistry,
    report: &mut LoadReport,
) -> Result<()> {
    match route(key) {
        Some(RecordKind::Logical(_)) => {
            let record: LogicalRoomsRecord =
                bincode::deserialize(value).map_err(|e| malformed(key, e))?;
            for name in &record.names {
                topology.ensure_logical(name);
            }
            report.logical_rooms += 1;
        }
        Some(RecordKind::Physical(logical)) => {
            if logical.is_empty() {
                return Err(malformed(key, "empty logical room name"));
            }
            let record: PhysicalRoomsRecord =
                bincode::deserialize(value).map_err(|e| malformed(key, e))?;
            let rooms: BTreeSet<String> = record.physical_rooms.into_iter().collect();
            topology.restore_physical_set(logical, &rooms);
            report.physical_sets += 1;
        }
        Some(RecordKind::Instance(address)) => {
            let instance: Instance = bincode::deserialize(value).map_err(|e| malformed(key, e))?;
            if instance.address != address {
                return Err(malformed(
                    key,
                    format!("record is for instance {}", instance.address),
                ));
            }
            registry.restore_instance(instance);
            report.instances += 1;
        }
        Some(RecordKind::AppliedIndex) => {
            let index: u64 = bincode::deserialize(value).map_err(|e| malformed(key, e))?;
            report.applied_index = Some(index);
        }
        None => return Err(malformed(key, "unknown record kind")),
    }
    Ok(())
}

/// Serialize the registries in the snapshot key layout
pub fn dump_snapshot(
    topology: &TopologyRegistry,
    registry: &InstanceRegistry,
    applied_index: u64,
) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut records = Vec::new();
    for room in topology.logical_rooms() {
        let logical = LogicalRoomsRecord {
            names: vec![room.name.clone()],
        };
        records.push((logical_key(&room.name), bincode::serialize(&logical)?));

        let physical = PhysicalRoomsRecord {
            physical_rooms: room.physical_rooms.into_iter().collect(),
        };
        records.push((physical_key(&room.name), bincode::serialize(&physical)?));
    }
    for instance in registry.list() {
        records.push((instance_key(&instance.address), bincode::serialize(&instance)?));
    }
    records.push((applied_index_key(), bincode::serialize(&applied_index)?));
    Ok(records)
}

/// Write a full snapshot, replacing the previous one
pub fn save_snapshot(
    store: &dyn SnapshotStore,
    topology: &TopologyRegistry,
    registry: &InstanceRegistry,
    applied_index: u64,
) -> Result<usize> {
    let records = dump_snapshot(topology, registry, applied_index)?;
    let count = records.len();
    store.replace_prefix(CLUSTER_PREFIX.as_bytes(), records)?;
    Ok(count)
}
