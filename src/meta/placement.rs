//! Placement: picks the instance that should host a new region
//!
//! Two strategies share one eligibility predicate:
//! - rolling: round-robin over addresses in sorted order
//! - min load: fewest regions of the table, then lowest disk usage
//!
//! Each decision is taken under a single acquisition of the registry lock so
//! an instance cannot turn ineligible halfway through a scan.

use crate::common::{Error, Result, TagPolicy};
use crate::meta::model::Instance;
use crate::meta::registry::{InstanceRegistry, InstanceTable};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::ops::Bound;

/// Can `candidate` receive a new region?
pub fn is_selectable(
    candidate: Option<&Instance>,
    resource_tag: &str,
    excluded: &BTreeSet<String>,
) -> bool {
    let Some(instance) = candidate else {
        return false;
    };
    if !instance.is_normal() || excluded.contains(&instance.address) {
        return false;
    }
    resource_tag.is_empty() || instance.resource_tag == resource_tag
}

/// Last address handed out by rolling selection, shared by all tags
#[derive(Debug, Default)]
pub struct RollingCursor {
    last: Mutex<Option<String>>,
}

impl RollingCursor {
    pub fn last(&self) -> Option<String> {
        self.last.lock().clone()
    }

    pub fn reset(&self) {
        *self.last.lock() = None;
    }
}

/// PlacementManager selects target instances for new regions.
#[derive(Debug, Default)]
pub struct PlacementManager {
    cursor: RollingCursor,
    tag_policy: TagPolicy,
}

impl PlacementManager {
    pub fn new(tag_policy: TagPolicy) -> Self {
        Self {
            cursor: RollingCursor::default(),
            tag_policy,
        }
    }

    pub fn tag_policy(&self) -> TagPolicy {
        self.tag_policy
    }

    pub fn cursor(&self) -> &RollingCursor {
        &self.cursor
    }

    /// Round-robin selection resuming after the previously returned address.
    /// Wraps around at most once.
    pub fn select_rolling(
        &self,
        registry: &InstanceRegistry,
        resource_tag: &str,
        excluded: &BTreeSet<String>,
    ) -> Result<String> {
        let mut last = self.cursor.last.lock();
        let selected = registry.with_table(|table| {
            self.with_tag_policy(resource_tag, |tag| {
                next_rolling(table, last.as_deref(), tag, excluded)
            })
        });

        match selected {
            Some(address) => {
                tracing::debug!("Rolling selection picked {} (tag {:?})", address, resource_tag);
                *last = Some(address.clone());
                Ok(address)
            }
            None => Err(Error::NoEligibleInstance {
                resource_tag: resource_tag.to_string(),
            }),
        }
    }

    /// Least-loaded selection for `table_id`.
    ///
    /// Ties on region count go to the lowest used/capacity ratio, then to the
    /// lowest address. The winner's count is bumped by one so that placements
    /// issued between two heartbeats spread out; the next heartbeat from the
    /// store overwrites the estimate.
    pub fn select_min_load(
        &self,
        registry: &InstanceRegistry,
        resource_tag: &str,
        excluded: &BTreeSet<String>,
        table_id: i64,
    ) -> Result<String> {
        let selected = registry.with_table_mut(|table| {
            let selected = {
                let view: &InstanceTable = table;
                self.with_tag_policy(resource_tag, |tag| {
                    least_loaded(view, tag, excluded, table_id)
                })
            };
            if let Some(address) = &selected {
                table.add_region_count(address, table_id);
            }
            selected
        });

        match selected {
            Some(address) => {
                tracing::debug!(
                    "Min-load selection picked {} for table {} (tag {:?})",
                    address,
                    table_id,
                    resource_tag
                );
                Ok(address)
            }
            None => Err(Error::NoEligibleInstance {
                resource_tag: resource_tag.to_string(),
            }),
        }
    }

    fn with_tag_policy<T>(&self, resource_tag: &str, select: impl Fn(&str) -> Option<T>) -> Option<T> {
        match select(resource_tag) {
            Some(found) => Some(found),
            None if self.tag_policy == TagPolicy::PreferExact && !resource_tag.is_empty() => {
                select("")
            }
            None => None,
        }
    }
}

fn next_rolling(
    table: &InstanceTable,
    last: Option<&str>,
    resource_tag: &str,
    excluded: &BTreeSet<String>,
) -> Option<String> {
    let instances = table.instances();
    let eligible = |instance: &&Instance| is_selectable(Some(*instance), resource_tag, excluded);

    let found = match last {
        Some(last) => instances
            .range::<str, _>((Bound::Excluded(last), Bound::Unbounded))
            .chain(instances.range::<str, _>((Bound::Unbounded, Bound::Included(last))))
            .map(|(_, instance)| instance)
            .find(eligible),
        None => instances.values().find(eligible),
    };
    found.map(|instance| instance.address.clone())
}

fn least_loaded(
    table: &InstanceTable,
    resource_tag: &str,
    excluded: &BTreeSet<String>,
    table_id: i64,
) -> Option<String> {
    table
        .instances()
        .values()
        .filter(|instance| is_selectable(Some(*instance), resource_tag, excluded))
        .min_by(|a, b| {
            table
                .region_count(&a.address, table_id)
                .cmp(&table.region_count(&b.address, table_id))
                .then_with(|| a.usage_ratio().total_cmp(&b.usage_ratio()))
                .then_with(|| a.address.cmp(&b.address))
        })
        .map(|instance| instance.address.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::model::{InstancePlacement, InstanceSpec, TableRegions};

    fn registry_with(instances: &[(&str, &str)]) -> InstanceRegistry {
        let registry = InstanceRegistry::new();
        for (address, tag) in instances {
            registry
                .add_instance(
                    &InstanceSpec::new(*address, 1000)
                        .with_used_size(100)
                        .with_resource_tag(*tag),
                    1,
                )
                .unwrap();
        }
        registry
    }

    fn set_count(registry: &InstanceRegistry, address: &str, table_id: i64, count: i64) {
        registry
            .set_instance_regions(
                address,
                InstancePlacement::from([(
                    table_id,
                    TableRegions {
                        region_ids: vec![],
                        region_count: count,
                    },
                )]),
            )
            .unwrap();
    }

    fn none() -> BTreeSet<String> {
        BTreeSet::new()
    }

    #[test]
    fn test_rolling_alternates_within_tag() {
        let registry = registry_with(&[("a:1", "ssd"), ("b:1", "ssd"), ("c:1", "hdd")]);
        let manager = PlacementManager::default();

        let picks: Vec<String> = (0..6)
            .map(|_| manager.select_rolling(&registry, "ssd", &none()).unwrap())
            .collect();
        assert_eq!(picks, vec!["a:1", "b:1", "a:1", "b:1", "a:1", "b:1"]);
    }

    #[test]
    fn test_rolling_visits_each_instance_once_per_cycle() {
        let addresses = ["10.0.0.3:1", "10.0.0.1:1", "10.0.0.5:1", "10.0.0.2:1", "10.0.0.4:1"];
        let registry = registry_with(&addresses.map(|a| (a, "")));
        let manager = PlacementManager::default();

        for _ in 0..3 {
            let cycle: BTreeSet<String> = (0..addresses.len())
                .map(|_| manager.select_rolling(&registry, "", &none()).unwrap())
                .collect();
            assert_eq!(cycle.len(), addresses.len());
        }
    }

    #[test]
    fn test_rolling_cursor_is_shared_across_tags() {
        let registry = registry_with(&[("a:1", "ssd"), ("b:1", "hdd"), ("c:1", "ssd")]);
        let manager = PlacementManager::default();

        assert_eq!(manager.select_rolling(&registry, "ssd", &none()).unwrap(), "a:1");
        assert_eq!(manager.select_rolling(&registry, "hdd", &none()).unwrap(), "b:1");
        assert_eq!(manager.select_rolling(&registry, "ssd", &none()).unwrap(), "c:1");
        assert_eq!(manager.cursor().last().as_deref(), Some("c:1"));
    }

    #[test]
    fn test_rolling_skips_excluded_and_dead() {
        let registry = registry_with(&[("a:1", ""), ("b:1", ""), ("c:1", "")]);
        registry.set_instance_dead("b:1").unwrap();
        let manager = PlacementManager::default();
        let excluded = BTreeSet::from(["a:1".to_string()]);

        for _ in 0..3 {
            assert_eq!(manager.select_rolling(&registry, "", &excluded).unwrap(), "c:1");
        }
    }

    #[test]
    fn test_rolling_resumes_after_dropped_cursor() {
        let registry = registry_with(&[("a:1", ""), ("b:1", ""), ("c:1", "")]);
        let manager = PlacementManager::default();

        assert_eq!(manager.select_rolling(&registry, "", &none()).unwrap(), "a:1");
        assert_eq!(manager.select_rolling(&registry, "", &none()).unwrap(), "b:1");
        registry.drop_instance("b:1").unwrap();

        assert_eq!(manager.select_rolling(&registry, "", &none()).unwrap(), "c:1");
        assert_eq!(manager.select_rolling(&registry, "", &none()).unwrap(), "a:1");
    }

    #[test]
    fn test_rolling_no_eligible_instance() {
        let registry = registry_with(&[("a:1", "hdd")]);
        let manager = PlacementManager::default();

        assert!(matches!(
            manager.select_rolling(&registry, "ssd", &none()),
            Err(Error::NoEligibleInstance { .. })
        ));
        assert!(manager
            .select_rolling(&InstanceRegistry::new(), "", &none())
            .is_err());
        assert!(manager.cursor().last().is_none());
    }

    #[test]
    fn test_exact_tag_policy_never_substitutes() {
        let registry = registry_with(&[("a:1", "hdd"), ("b:1", "hdd")]);
        let manager = PlacementManager::new(TagPolicy::Exact);

        assert!(manager.select_rolling(&registry, "ssd", &none()).is_err());
        assert!(manager.select_min_load(&registry, "ssd", &none(), 1).is_err());
    }

    #[test]
    fn test_prefer_exact_tag_policy_falls_back() {
        let registry = registry_with(&[("a:1", "hdd"), ("b:1", "ssd")]);
        let manager = PlacementManager::new(TagPolicy::PreferExact);

        // a matching tag still wins
        assert_eq!(manager.select_rolling(&registry, "ssd", &none()).unwrap(), "b:1");
        assert_eq!(manager.select_rolling(&registry, "ssd", &none()).unwrap(), "b:1");
        // no "nvme" instance at all: any tag will do
        assert_eq!(manager.select_rolling(&registry, "nvme", &none()).unwrap(), "a:1");
        assert_eq!(
            manager.select_min_load(&registry, "nvme", &none(), 1).unwrap(),
            "a:1"
        );
    }

    #[test]
    fn test_min_load_picks_fewest_regions() {
        let registry = registry_with(&[("a:1", ""), ("b:1", ""), ("c:1", "")]);
        set_count(&registry, "a:1", 7, 5);
        set_count(&registry, "b:1", 7, 2);
        set_count(&registry, "c:1", 7, 3);
        let manager = PlacementManager::default();

        assert_eq!(manager.select_min_load(&registry, "", &none(), 7).unwrap(), "b:1");
        // b is now at 3 and ties with c
        assert_eq!(registry.peer_count_on("b:1", 7), 3);
        assert_eq!(manager.select_min_load(&registry, "", &none(), 7).unwrap(), "b:1");
        assert_eq!(manager.select_min_load(&registry, "", &none(), 7).unwrap(), "c:1");
    }

    #[test]
    fn test_min_load_never_beats_a_lower_count() {
        let registry = registry_with(&[("a:1", ""), ("b:1", ""), ("c:1", ""), ("d:1", "")]);
        set_count(&registry, "a:1", 1, 4);
        set_count(&registry, "b:1", 1, 0);
        set_count(&registry, "c:1", 1, 9);
        let manager = PlacementManager::default();

        for _ in 0..20 {
            let counts: Vec<i64> = ["a:1", "b:1", "c:1", "d:1"]
                .iter()
                .map(|a| registry.peer_count_on(a, 1))
                .collect();
            let min = *counts.iter().min().unwrap();
            let picked = manager.select_min_load(&registry, "", &none(), 1).unwrap();
            // read before the reservation bump
            assert_eq!(registry.peer_count_on(&picked, 1) - 1, min);
        }
    }

    #[test]
    fn test_min_load_tie_break_on_usage_ratio() {
        let registry = InstanceRegistry::new();
        registry
            .add_instance(&InstanceSpec::new("a:1", 1000).with_used_size(900), 1)
            .unwrap();
        registry
            .add_instance(&InstanceSpec::new("b:1", 1000).with_used_size(200), 1)
            .unwrap();
        registry
            .add_instance(&InstanceSpec::new("c:1", 0), 1)
            .unwrap();
        let manager = PlacementManager::default();

        // absent entries count as 0 regions for everybody
        assert_eq!(manager.select_min_load(&registry, "", &none(), 42).unwrap(), "b:1");
        assert_eq!(manager.select_min_load(&registry, "", &none(), 42).unwrap(), "a:1");
    }

    #[test]
    fn test_min_load_skips_dead_and_excluded() {
        let registry = registry_with(&[("a:1", ""), ("b:1", ""), ("c:1", "")]);
        set_count(&registry, "a:1", 1, 0);
        set_count(&registry, "b:1", 1, 1);
        set_count(&registry, "c:1", 1, 10);
        registry.set_instance_dead("a:1").unwrap();
        let manager = PlacementManager::default();
        let excluded = BTreeSet::from(["b:1".to_string()]);

        assert_eq!(
            manager.select_min_load(&registry, "", &excluded, 1).unwrap(),
            "c:1"
        );
    }

    #[test]
    fn test_is_selectable() {
        let instance = Instance::from_spec(&InstanceSpec::new("a:1", 10).with_resource_tag("ssd"), 1);
        assert!(is_selectable(Some(&instance), "", &none()));
        assert!(is_selectable(Some(&instance), "ssd", &none()));
        assert!(!is_selectable(Some(&instance), "hdd", &none()));
        assert!(!is_selectable(None, "", &none()));
        assert!(!is_selectable(
            Some(&instance),
            "",
            &BTreeSet::from(["a:1".to_string()])
        ));
    }
}
