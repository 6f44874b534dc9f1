//! Topology registry: logical room <-> physical room mapping
//!
//! Both directions are kept under one lock so a reader never observes a room
//! that is present in one index and missing from the other.

use crate::common::{Error, Result};
use crate::meta::model::LogicalRoom;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Topology {
    /// logical room -> physical rooms
    logical: BTreeMap<String, BTreeSet<String>>,
    /// physical room -> logical room
    physical: BTreeMap<String, String>,
}

/// Registry of logical and physical rooms
#[derive(Debug, Default)]
pub struct TopologyRegistry {
    inner: RwLock<Topology>,
}

impl TopologyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_logical(&self, name: &str) -> Result<()> {
        let mut topo = self.inner.write();
        if topo.logical.contains_key(name) {
            return Err(Error::AlreadyExists(format!("logical room {}", name)));
        }
        topo.logical.insert(name.to_string(), BTreeSet::new());
        Ok(())
    }

    pub fn drop_logical(&self, name: &str) -> Result<()> {
        let mut topo = self.inner.write();
        match topo.logical.get(name) {
            None => return Err(Error::NotFound(format!("logical room {}", name))),
            Some(rooms) if !rooms.is_empty() => {
                return Err(Error::NotEmpty(format!(
                    "logical room {} still holds {} physical room(s)",
                    name,
                    rooms.len()
                )))
            }
            Some(_) => {}
        }
        topo.logical.remove(name);
        Ok(())
    }

    pub fn add_physical(&self, logical: &str, physical: &str) -> Result<()> {
        let mut topo = self.inner.write();
        if !topo.logical.contains_key(logical) {
            return Err(Error::NotFound(format!("logical room {}", logical)));
        }
        if let Some(owner) = topo.physical.get(physical) {
            return Err(Error::AlreadyExists(format!(
                "physical room {} (in logical room {})",
                physical, owner
            )));
        }
        topo.physical
            .insert(physical.to_string(), logical.to_string());
        if let Some(rooms) = topo.logical.get_mut(logical) {
            rooms.insert(physical.to_string());
        }
        Ok(())
    }

    /// Remove a physical room. Callers check that no instance references it.
    pub fn drop_physical(&self, logical: &str, physical: &str) -> Result<()> {
        let mut topo = self.inner.write();
        let present = topo
            .logical
            .get(logical)
            .map(|rooms| rooms.contains(physical))
            .unwrap_or(false);
        if !present {
            return Err(Error::NotFound(format!(
                "physical room {} in logical room {}",
                physical, logical
            )));
        }
        topo.physical.remove(physical);
        if let Some(rooms) = topo.logical.get_mut(logical) {
            rooms.remove(physical);
        }
        Ok(())
    }

    pub fn move_physical(&self, physical: &str, from: &str, to: &str) -> Result<()> {
        let mut topo = self.inner.write();
        if !topo.logical.contains_key(to) {
            return Err(Error::NotFound(format!("logical room {}", to)));
        }
        let present = match topo.logical.get(from) {
            None => return Err(Error::NotFound(format!("logical room {}", from))),
            Some(rooms) => rooms.contains(physical),
        };
        if !present {
            return Err(Error::NotFound(format!(
                "physical room {} in logical room {}",
                physical, from
            )));
        }

        if let Some(rooms) = topo.logical.get_mut(from) {
            rooms.remove(physical);
        }
        if let Some(rooms) = topo.logical.get_mut(to) {
            rooms.insert(physical.to_string());
        }
        topo.physical.insert(physical.to_string(), to.to_string());
        Ok(())
    }

    // === Queries ===

    pub fn logical_rooms(&self) -> Vec<LogicalRoom> {
        self.inner
            .read()
            .logical
            .iter()
            .map(|(name, rooms)| LogicalRoom {
                name: name.clone(),
                physical_rooms: rooms.clone(),
            })
            .collect()
    }

    pub fn logical_room(&self, name: &str) -> Option<LogicalRoom> {
        self.inner.read().logical.get(name).map(|rooms| LogicalRoom {
            name: name.to_string(),
            physical_rooms: rooms.clone(),
        })
    }

    /// Logical room owning `physical`
    pub fn logical_of(&self, physical: &str) -> Option<String> {
        self.inner.read().physical.get(physical).cloned()
    }

    pub fn physical_exists(&self, physical: &str) -> bool {
        self.inner.read().physical.contains_key(physical)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().logical.is_empty()
    }

    // === Snapshot support ===

    /// Insert a logical room if missing (snapshot load)
    pub fn ensure_logical(&self, name: &str) {
        self.inner
            .write()
            .logical
            .entry(name.to_string())
            .or_default();
    }

    /// Replace the physical set of `logical` (snapshot load).
    ///
    /// A room already claimed by another logical room moves here, so the
    /// forward index never points at a set that no longer lists the room.
    pub fn restore_physical_set(&self, logical: &str, physicals: &BTreeSet<String>) {
        let mut topo = self.inner.write();
        let Topology {
            logical: logical_map,
            physical: physical_map,
        } = &mut *topo;

        if let Some(previous) = logical_map.get(logical) {
            for room in previous.difference(physicals) {
                physical_map.remove(room);
            }
        }
        for room in physicals {
            if let Some(owner) = physical_map.get(room) {
                if owner != logical {
                    if let Some(rooms) = logical_map.get_mut(owner) {
                        rooms.remove(room);
                    }
                }
            }
            physical_map.insert(room.clone(), logical.to_string());
        }
        logical_map.insert(logical.to_string(), physicals.clone());
    }

    pub fn clear(&self) {
        *self.inner.write() = Topology::default();
    }
}
