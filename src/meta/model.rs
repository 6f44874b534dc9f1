//! Membership data model
//!
//! Records here travel three ways: inside proposals (bincode), inside
//! snapshot values (bincode) and over the HTTP API (JSON). Keep them free of
//! serde attributes that change the field layout.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Instance health state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceStatus {
    Normal,
    Dead,
}

impl InstanceStatus {
    pub fn is_normal(&self) -> bool {
        matches!(self, InstanceStatus::Normal)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceStatus::Normal => write!(f, "NORMAL"),
            InstanceStatus::Dead => write!(f, "DEAD"),
        }
    }
}

/// Liveness state of one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthState {
    pub status: InstanceStatus,
    /// Last heartbeat, Unix microseconds. 0 once the instance is marked dead.
    pub timestamp_us: i64,
}

impl HealthState {
    pub fn normal(timestamp_us: i64) -> Self {
        Self {
            status: InstanceStatus::Normal,
            timestamp_us,
        }
    }

    pub fn dead() -> Self {
        Self {
            status: InstanceStatus::Dead,
            timestamp_us: 0,
        }
    }
}

/// Instance description carried by admin requests and heartbeats
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub address: String,
    pub capacity: u64,
    /// Unreported usage is treated as a full instance
    #[serde(default)]
    pub used_size: Option<u64>,
    #[serde(default)]
    pub resource_tag: String,
    #[serde(default)]
    pub physical_room: String,
}

impl InstanceSpec {
    pub fn new(address: impl Into<String>, capacity: u64) -> Self {
        Self {
            address: address.into(),
            capacity,
            used_size: None,
            resource_tag: String::new(),
            physical_room: String::new(),
        }
    }

    pub fn with_used_size(mut self, used_size: u64) -> Self {
        self.used_size = Some(used_size);
        self
    }

    pub fn with_resource_tag(mut self, tag: impl Into<String>) -> Self {
        self.resource_tag = tag.into();
        self
    }

    pub fn with_physical_room(mut self, room: impl Into<String>) -> Self {
        self.physical_room = room.into();
        self
    }

    pub fn effective_used_size(&self) -> u64 {
        self.used_size.unwrap_or(self.capacity)
    }
}

/// A registered storage instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub address: String,
    pub capacity: u64,
    pub used_size: u64,
    pub resource_tag: String,
    pub physical_room: String,
    pub health: HealthState,
}

impl Instance {
    pub fn from_spec(spec: &InstanceSpec, timestamp_us: i64) -> Self {
        Self {
            address: spec.address.clone(),
            capacity: spec.capacity,
            used_size: spec.effective_used_size(),
            resource_tag: spec.resource_tag.clone(),
            physical_room: spec.physical_room.clone(),
            health: HealthState::normal(timestamp_us),
        }
    }

    /// Overwrite the fields a store reports about itself
    pub fn refresh_from(&mut self, spec: &InstanceSpec) {
        self.capacity = spec.capacity;
        self.used_size = spec.effective_used_size();
        self.resource_tag = spec.resource_tag.clone();
    }

    pub fn is_normal(&self) -> bool {
        self.health.status.is_normal()
    }

    /// used / capacity; an instance without capacity counts as full
    pub fn usage_ratio(&self) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        self.used_size as f64 / self.capacity as f64
    }
}

/// A logical room and the physical rooms it groups
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalRoom {
    pub name: String,
    pub physical_rooms: BTreeSet<String>,
}

/// Regions of one table hosted by one instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRegions {
    pub region_ids: Vec<i64>,
    pub region_count: i64,
}

/// Per-table placement of one instance, keyed by table id
pub type InstancePlacement = BTreeMap<i64, TableRegions>;

/// One table entry of a store heartbeat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRegionReport {
    pub table_id: i64,
    #[serde(default)]
    pub region_ids: Vec<i64>,
    pub region_count: i64,
}

/// Periodic report sent by every store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreHeartbeat {
    pub instance: InstanceSpec,
    #[serde(default)]
    pub regions: Vec<TableRegionReport>,
}

impl StoreHeartbeat {
    pub fn placement(&self) -> InstancePlacement {
        self.regions
            .iter()
            .map(|report| {
                (
                    report.table_id,
                    TableRegions {
                        region_ids: report.region_ids.clone(),
                        region_count: report.region_count,
                    },
                )
            })
            .collect()
    }
}

/// A membership change, replicated through the consensus log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    AddLogical {
        name: String,
    },
    DropLogical {
        name: String,
    },
    AddPhysical {
        logical: String,
        physical: String,
    },
    DropPhysical {
        logical: String,
        physical: String,
    },
    MovePhysical {
        physical: String,
        from: String,
        to: String,
    },
    AddInstance(InstanceSpec),
    DropInstance {
        address: String,
    },
    UpdateInstance(InstanceSpec),
    SetInstanceDead {
        address: String,
    },
}

impl Mutation {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Mutation::AddLogical { .. } => "add_logical",
            Mutation::DropLogical { .. } => "drop_logical",
            Mutation::AddPhysical { .. } => "add_physical",
            Mutation::DropPhysical { .. } => "drop_physical",
            Mutation::MovePhysical { .. } => "move_physical",
            Mutation::AddInstance(_) => "add_instance",
            Mutation::DropInstance { .. } => "drop_instance",
            Mutation::UpdateInstance(_) => "update_instance",
            Mutation::SetInstanceDead { .. } => "set_instance_dead",
        }
    }
}
