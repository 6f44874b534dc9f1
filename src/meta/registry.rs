//! Instance registry and placement index
//!
//! Instances and their per-table region counts share one lock: heartbeats,
//! drops and the leadership reset update both together, and a selector must
//! never see an instance without its placement entry or the other way round.
//!
//! Reads hand out clones; writes replace whole values. The only way to look
//! at the table in place is through [`InstanceRegistry::with_table`] and
//! [`InstanceRegistry::with_table_mut`], whose closures cannot `.await`.

use crate::common::{Error, Result};
use crate::meta::model::{HealthState, Instance, InstancePlacement, InstanceSpec, InstanceStatus};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// Locked state: instances sorted by address, plus their placement entries
#[derive(Debug, Default, Clone, PartialEq)]
pub struct InstanceTable {
    instances: BTreeMap<String, Instance>,
    placement: HashMap<String, InstancePlacement>,
}

impl InstanceTable {
    pub fn instances(&self) -> &BTreeMap<String, Instance> {
        &self.instances
    }

    pub fn get(&self, address: &str) -> Option<&Instance> {
        self.instances.get(address)
    }

    /// Region count of `table_id` on `address`; absent entries count as 0
    pub fn region_count(&self, address: &str, table_id: i64) -> i64 {
        self.placement
            .get(address)
            .and_then(|tables| tables.get(&table_id))
            .map(|regions| regions.region_count)
            .unwrap_or(0)
    }

    /// Reserve one region of `table_id` on `address`
    pub fn add_region_count(&mut self, address: &str, table_id: i64) {
        if let Some(tables) = self.placement.get_mut(address) {
            tables.entry(table_id).or_default().region_count += 1;
        }
    }
}

/// What a heartbeat did to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Known instance, refreshed; carries its status after the refresh
    Refreshed(InstanceStatus),
    /// Address not registered through the log
    Unknown,
}

/// Registry of storage instances
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    inner: RwLock<InstanceTable>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // === Replicated operations ===

    pub fn add_instance(&self, spec: &InstanceSpec, timestamp_us: i64) -> Result<()> {
        let mut table = self.inner.write();
        if table.instances.contains_key(&spec.address) {
            return Err(Error::AlreadyExists(format!("instance {}", spec.address)));
        }
        table
            .instances
            .insert(spec.address.clone(), Instance::from_spec(spec, timestamp_us));
        table
            .placement
            .insert(spec.address.clone(), InstancePlacement::new());
        Ok(())
    }

    pub fn drop_instance(&self, address: &str) -> Result<()> {
        let mut table = self.inner.write();
        if table.instances.remove(address).is_none() {
            return Err(Error::NotFound(format!("instance {}", address)));
        }
        table.placement.remove(address);
        Ok(())
    }

    /// Administrative refresh; also revives a dead instance
    pub fn update_instance(&self, spec: &InstanceSpec, timestamp_us: i64) -> Result<()> {
        let mut table = self.inner.write();
        let instance = table
            .instances
            .get_mut(&spec.address)
            .ok_or_else(|| Error::NotFound(format!("instance {}", spec.address)))?;
        instance.refresh_from(spec);
        instance.health = HealthState::normal(timestamp_us);
        Ok(())
    }

    pub fn set_instance_dead(&self, address: &str) -> Result<()> {
        let mut table = self.inner.write();
        let instance = table
            .instances
            .get_mut(address)
            .ok_or_else(|| Error::NotFound(format!("instance {}", address)))?;
        instance.health = HealthState::dead();
        Ok(())
    }

    // === Heartbeat path (local, not replicated) ===

    /// Refresh a known instance from its heartbeat.
    ///
    /// A dead instance keeps its status and zero timestamp: only an
    /// administrative update or a leadership reset brings it back.
    pub fn apply_heartbeat(
        &self,
        spec: &InstanceSpec,
        placement: Option<InstancePlacement>,
        now_us: i64,
    ) -> HeartbeatOutcome {
        let mut table = self.inner.write();
        let status = match table.instances.get_mut(&spec.address) {
            None => return HeartbeatOutcome::Unknown,
            Some(instance) => {
                instance.refresh_from(spec);
                if instance.is_normal() {
                    instance.health.timestamp_us = now_us;
                }
                instance.health.status
            }
        };
        if let Some(placement) = placement {
            table.placement.insert(spec.address.clone(), placement);
        }
        HeartbeatOutcome::Refreshed(status)
    }

    /// Overwrite the placement entry of a known instance
    pub fn set_instance_regions(&self, address: &str, placement: InstancePlacement) -> Result<()> {
        let mut table = self.inner.write();
        if !table.instances.contains_key(address) {
            return Err(Error::NotFound(format!("instance {}", address)));
        }
        table.placement.insert(address.to_string(), placement);
        Ok(())
    }

    /// Give back one reserved region of `table_id` on `address`; never below 0
    pub fn sub_peer_count(&self, address: &str, table_id: i64) {
        let mut table = self.inner.write();
        if let Some(regions) = table
            .placement
            .get_mut(address)
            .and_then(|tables| tables.get_mut(&table_id))
        {
            regions.region_count = regions.region_count.saturating_sub(1).max(0);
        }
    }

    /// Forget everything the previous leader collected
    pub fn reset_instance_status(&self, now_us: i64) {
        let mut table = self.inner.write();
        let InstanceTable {
            instances,
            placement,
        } = &mut *table;
        for (address, instance) in instances.iter_mut() {
            instance.health = HealthState::normal(now_us);
            placement.insert(address.clone(), InstancePlacement::new());
        }
    }

    /// NORMAL instances silent for longer than `threshold_us`
    pub fn stale_instances(&self, now_us: i64, threshold_us: i64) -> Vec<String> {
        self.inner
            .read()
            .instances
            .values()
            .filter(|instance| instance.is_normal())
            .filter(|instance| now_us.saturating_sub(instance.health.timestamp_us) > threshold_us)
            .map(|instance| instance.address.clone())
            .collect()
    }

    // === Queries ===

    pub fn get(&self, address: &str) -> Option<Instance> {
        self.inner.read().instances.get(address).cloned()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.inner.read().instances.contains_key(address)
    }

    pub fn list(&self) -> Vec<Instance> {
        self.inner.read().instances.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().instances.is_empty()
    }

    /// Is any instance located in `physical_room`?
    pub fn is_room_referenced(&self, physical_room: &str) -> bool {
        self.inner
            .read()
            .instances
            .values()
            .any(|instance| instance.physical_room == physical_room)
    }

    pub fn instance_count(&self, resource_tag: &str) -> usize {
        self.inner
            .read()
            .instances
            .values()
            .filter(|instance| instance.resource_tag == resource_tag)
            .count()
    }

    /// Regions of `table_id` across all instances
    pub fn peer_count(&self, table_id: i64) -> i64 {
        self.inner
            .read()
            .placement
            .values()
            .filter_map(|tables| tables.get(&table_id))
            .map(|regions| regions.region_count)
            .sum()
    }

    /// Regions of `table_id` on one instance
    pub fn peer_count_on(&self, address: &str, table_id: i64) -> i64 {
        self.inner.read().region_count(address, table_id)
    }

    pub fn placement_of(&self, address: &str) -> Option<InstancePlacement> {
        self.inner.read().placement.get(address).cloned()
    }

    // === Scoped access for selection ===

    pub fn with_table<T>(&self, f: impl FnOnce(&InstanceTable) -> T) -> T {
        f(&self.inner.read())
    }

    pub fn with_table_mut<T>(&self, f: impl FnOnce(&mut InstanceTable) -> T) -> T {
        f(&mut self.inner.write())
    }

    // === Snapshot support ===

    /// Insert or replace an instance record (snapshot load)
    pub fn restore_instance(&self, instance: Instance) {
        let mut table = self.inner.write();
        table.placement.entry(instance.address.clone()).or_default();
        table.instances.insert(instance.address.clone(), instance);
    }

    pub fn clear(&self) {
        *self.inner.write() = InstanceTable::default();
    }
}
