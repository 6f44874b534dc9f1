//! Snapshot store using RocksDB
//!
//! Snapshot records live in their own column family so a full rewrite never
//! touches anything else kept in the same database.

use crate::common::{Error, Result};
use crate::meta::snapshot::{RecordBatch, SnapshotStore};
use rocksdb::{ColumnFamily, Direction, IteratorMode, Options, WriteBatch, DB};
use std::path::Path;

const CF_SNAPSHOT: &str = "snapshot";

/// Metadata store
pub struct MetadataStore {
    db: DB,
}

impl MetadataStore {
    /// Open or create metadata store
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path, vec![CF_SNAPSHOT])?;

        Ok(Self { db })
    }

    fn cf(&self) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(CF_SNAPSHOT)
            .ok_or_else(|| Error::Internal(format!("missing column family {}", CF_SNAPSHOT)))
    }

    /// Put a single raw record
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db.put_cf(self.cf()?, key, value)?;
        Ok(())
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush_cf(self.cf()?)?;
        Ok(())
    }
}

impl SnapshotStore for MetadataStore {
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let iter = self
            .db
            .iterator_cf(self.cf()?, IteratorMode::From(prefix, Direction::Forward));

        let mut records = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            records.push((key.to_vec(), value.to_vec()));
        }
        Ok(records)
    }

    fn replace_prefix(&self, prefix: &[u8], records: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
        let cf = self.cf()?;
        let mut batch = WriteBatch::default();
        for (key, _) in self.scan_prefix(prefix)? {
            batch.delete_cf(cf, key);
        }
        for (key, value) in records {
            batch.put_cf(cf, key, value);
        }
        self.db.write(batch)?;
        Ok(())
    }

    fn write_batch(&self, records: RecordBatch) -> Result<()> {
        let cf = self.cf()?;
        let mut batch = WriteBatch::default();
        for key in records.deletes {
            batch.delete_cf(cf, key);
        }
        for (key, value) in records.puts {
            batch.put_cf(cf, key, value);
        }
        self.db.write(batch)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::snapshot::{instance_key, load_snapshot, save_snapshot};
    use crate::meta::{InstanceRegistry, InstanceSpec, TopologyRegistry};
    use tempfile::tempdir;

    #[test]
    fn test_scan_prefix_stops_at_boundary() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(dir.path().join("meta.db")).unwrap();
        store.put(b"cluster/a", b"1").unwrap();
        store.put(b"cluster/b", b"2").unwrap();
        store.put(b"clusterz", b"3").unwrap();
        store.put(b"another", b"4").unwrap();

        let records = store.scan_prefix(b"cluster/").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], (b"cluster/a".to_vec(), b"1".to_vec()));
    }

    #[test]
    fn test_write_batch_puts_and_deletes() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(dir.path().join("meta.db")).unwrap();
        store.put(b"cluster/instance/a:1", b"old").unwrap();

        store
            .write_batch(RecordBatch {
                puts: vec![(b"cluster/instance/b:1".to_vec(), b"new".to_vec())],
                deletes: vec![b"cluster/instance/a:1".to_vec(), b"cluster/instance/z:1".to_vec()],
            })
            .unwrap();

        let records = store.scan_prefix(b"cluster/").unwrap();
        assert_eq!(records, vec![(b"cluster/instance/b:1".to_vec(), b"new".to_vec())]);
    }

    #[test]
    fn test_snapshot_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta.db");

        {
            let topology = TopologyRegistry::new();
            topology.add_logical("bj").unwrap();
            topology.add_physical("bj", "bj-1").unwrap();
            let registry = InstanceRegistry::new();
            registry
                .add_instance(&InstanceSpec::new("10.0.0.1:8010", 100).with_physical_room("bj-1"), 9)
                .unwrap();

            let store = MetadataStore::open(&path).unwrap();
            save_snapshot(&store, &topology, &registry, 3).unwrap();
            store.flush().unwrap();
        }

        let store = MetadataStore::open(&path).unwrap();
        let topology = TopologyRegistry::new();
        let registry = InstanceRegistry::new();
        let report = load_snapshot(&store, &topology, &registry).unwrap();

        assert_eq!(report.applied_index, Some(3));
        assert_eq!(topology.logical_of("bj-1").as_deref(), Some("bj"));
        assert_eq!(registry.get("10.0.0.1:8010").unwrap().health.timestamp_us, 9);
        assert_eq!(store.scan_prefix(&instance_key("10.0.0.1:8010")).unwrap().len(), 1);
    }
}
