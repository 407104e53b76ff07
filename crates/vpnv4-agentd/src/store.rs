//! In-memory tenant state
//!
//! The store is the single source of truth consulted by the renderer. It is
//! owned by the reconciliation engine and mutated only from its
//! event-processing step.

use std::collections::{BTreeMap, BTreeSet};

use ipnet::IpNet;
use tracing::{debug, info};
use vpnv4_common::AgentResult;

use crate::allocator::{self, Allocation, AllocationTable, AllocatorSettings};
use crate::types::ChangeEvent;

/// Tenant tracked by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant {
    pub name: String,
    pub prefixes: BTreeSet<IpNet>,
    pub allocation: Allocation,
}

/// Immutable per-VRF view used for rendering
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VrfSnapshot {
    pub tenant: String,
    pub vrf_name: String,
    pub numeric_id: u16,
    pub rd: String,
    pub rt: String,
    pub table_id: u32,
    pub prefixes: BTreeSet<IpNet>,
    /// Kernel state for this VRF is incomplete; its prefixes must not be advertised
    pub degraded: bool,
}

/// Desired state at one point in time, keyed by VRF name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub vrfs: BTreeMap<String, VrfSnapshot>,
}

impl Snapshot {
    /// Copy of this snapshot with the given VRFs marked degraded
    pub fn with_degraded(&self, degraded: &BTreeSet<String>) -> Self {
        let mut next = self.clone();
        for (name, vrf) in next.vrfs.iter_mut() {
            vrf.degraded = degraded.contains(name);
        }
        next
    }
}

/// Tenant name → prefix set → derived identifiers
#[derive(Debug)]
pub struct TenantStore {
    tenants: BTreeMap<String, Tenant>,
    settings: AllocatorSettings,
    maintain_empty_vrf: bool,
}

impl TenantStore {
    pub fn new(settings: AllocatorSettings, maintain_empty_vrf: bool) -> Self {
        Self {
            tenants: BTreeMap::new(),
            settings,
            maintain_empty_vrf,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Tenant> {
        self.tenants.get(name)
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }

    pub fn tenants(&self) -> impl Iterator<Item = &Tenant> {
        self.tenants.values()
    }

    /// Apply one event, returning whether the store changed.
    ///
    /// Identifiers are allocated when a tenant is created and released when
    /// it is destroyed. Allocation exhaustion is returned before the store is
    /// touched.
    pub fn apply_event(
        &mut self,
        event: &ChangeEvent,
        table: &mut AllocationTable,
    ) -> AgentResult<bool> {
        match event {
            ChangeEvent::Upsert { tenant, prefixes } => {
                if prefixes.is_empty() && !self.maintain_empty_vrf {
                    return Ok(self.remove(tenant, table));
                }
                self.upsert(tenant, prefixes, table)
            }
            ChangeEvent::Delete { tenant } => {
                if self.maintain_empty_vrf {
                    Ok(self.clear(tenant))
                } else {
                    Ok(self.remove(tenant, table))
                }
            }
        }
    }

    /// Build the desired state snapshot
    pub fn snapshot(&self, degraded: &BTreeSet<String>) -> Snapshot {
        let vrfs = self
            .tenants
            .values()
            .map(|t| {
                let a = &t.allocation;
                let snapshot = VrfSnapshot {
                    tenant: t.name.clone(),
                    vrf_name: a.vrf_name.clone(),
                    numeric_id: a.numeric_id,
                    rd: a.rd.clone(),
                    rt: a.rt.clone(),
                    table_id: a.table_id,
                    prefixes: t.prefixes.clone(),
                    degraded: degraded.contains(&a.vrf_name),
                };
                (a.vrf_name.clone(), snapshot)
            })
            .collect();
        Snapshot { vrfs }
    }

    fn upsert(
        &mut self,
        name: &str,
        prefixes: &BTreeSet<IpNet>,
        table: &mut AllocationTable,
    ) -> AgentResult<bool> {
        if let Some(tenant) = self.tenants.get_mut(name) {
            if &tenant.prefixes == prefixes {
                debug!(tenant = name, "Tenant already has the desired prefixes");
                return Ok(false);
            }
            debug!(tenant = name, count = prefixes.len(), "Updating tenant prefixes");
            tenant.prefixes = prefixes.clone();
            return Ok(true);
        }

        let allocation = allocator::allocate(name, &self.settings, table)?;
        info!(
            tenant = name,
            vrf = %allocation.vrf_name,
            count = prefixes.len(),
            "Tracking new tenant"
        );
        self.tenants.insert(
            name.to_string(),
            Tenant {
                name: name.to_string(),
                prefixes: prefixes.clone(),
                allocation,
            },
        );
        Ok(true)
    }

    fn remove(&mut self, name: &str, table: &mut AllocationTable) -> bool {
        match self.tenants.remove(name) {
            Some(tenant) => {
                table.release(name);
                info!(tenant = name, vrf = %tenant.allocation.vrf_name, "Removed tenant");
                true
            }
            None => {
                debug!(tenant = name, "Delete for unknown tenant ignored");
                false
            }
        }
    }

    fn clear(&mut self, name: &str) -> bool {
        match self.tenants.get_mut(name) {
            Some(tenant) if !tenant.prefixes.is_empty() => {
                tenant.prefixes.clear();
                info!(tenant = name, "Cleared tenant prefixes, keeping empty VRF");
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::normalize_prefix;

    fn prefixes(values: &[&str]) -> Vec<IpNet> {
        values.iter().map(|v| normalize_prefix(v).unwrap()).collect()
    }

    fn store(maintain_empty_vrf: bool) -> (TenantStore, AllocationTable) {
        (
            TenantStore::new(AllocatorSettings::new(65000, 65000), maintain_empty_vrf),
            AllocationTable::new(),
        )
    }

    #[test]
    fn test_upsert_creates_and_allocates() {
        let (mut store, mut table) = store(false);
        let changed = store
            .apply_event(&ChangeEvent::upsert("alpha", prefixes(&["10.1.0.0/24"])), &mut table)
            .unwrap();

        assert!(changed);
        let tenant = store.get("alpha").unwrap();
        assert_eq!(tenant.prefixes.len(), 1);
        assert_eq!(table.lookup("alpha"), Some(&tenant.allocation));
    }

    #[test]
    fn test_identical_upsert_is_noop() {
        let (mut store, mut table) = store(false);
        let event = ChangeEvent::upsert("alpha", prefixes(&["10.1.0.0/24", "10.2.0.0/24"]));

        assert!(store.apply_event(&event, &mut table).unwrap());
        assert!(!store.apply_event(&event, &mut table).unwrap());

        let reordered = ChangeEvent::upsert("alpha", prefixes(&["10.2.0.0/24", "10.1.0.0/24"]));
        assert!(!store.apply_event(&reordered, &mut table).unwrap());
    }

    #[test]
    fn test_delete_removes_and_releases() {
        let (mut store, mut table) = store(false);
        store
            .apply_event(&ChangeEvent::upsert("alpha", prefixes(&["10.1.0.0/24"])), &mut table)
            .unwrap();

        assert!(store.apply_event(&ChangeEvent::delete("alpha"), &mut table).unwrap());
        assert!(store.is_empty());
        assert!(table.is_empty());

        assert!(!store.apply_event(&ChangeEvent::delete("alpha"), &mut table).unwrap());
    }

    #[test]
    fn test_empty_upsert_removes_without_policy() {
        let (mut store, mut table) = store(false);
        store
            .apply_event(&ChangeEvent::upsert("alpha", prefixes(&["10.1.0.0/24"])), &mut table)
            .unwrap();

        assert!(store
            .apply_event(&ChangeEvent::upsert("alpha", Vec::new()), &mut table)
            .unwrap());
        assert!(store.get("alpha").is_none());

        // Not created either
        assert!(!store
            .apply_event(&ChangeEvent::upsert("beta", Vec::new()), &mut table)
            .unwrap());
        assert!(store.is_empty());
    }

    #[test]
    fn test_delete_keeps_empty_vrf_with_policy() {
        let (mut store, mut table) = store(true);
        store
            .apply_event(&ChangeEvent::upsert("alpha", prefixes(&["10.1.0.0/24"])), &mut table)
            .unwrap();
        let allocation = store.get("alpha").unwrap().allocation.clone();

        assert!(store.apply_event(&ChangeEvent::delete("alpha"), &mut table).unwrap());
        let tenant = store.get("alpha").unwrap();
        assert!(tenant.prefixes.is_empty());
        assert_eq!(tenant.allocation, allocation);

        // Second delete changes nothing
        assert!(!store.apply_event(&ChangeEvent::delete("alpha"), &mut table).unwrap());
    }

    #[test]
    fn test_empty_upsert_creates_with_policy() {
        let (mut store, mut table) = store(true);
        assert!(store
            .apply_event(&ChangeEvent::upsert("alpha", Vec::new()), &mut table)
            .unwrap());
        assert!(store.get("alpha").unwrap().prefixes.is_empty());
    }

    #[test]
    fn test_snapshot_marks_degraded() {
        let (mut store, mut table) = store(false);
        store
            .apply_event(&ChangeEvent::upsert("alpha", prefixes(&["10.1.0.0/24"])), &mut table)
            .unwrap();
        store
            .apply_event(&ChangeEvent::upsert("beta", prefixes(&["10.2.0.0/24"])), &mut table)
            .unwrap();

        let alpha_vrf = store.get("alpha").unwrap().allocation.vrf_name.clone();
        let degraded: BTreeSet<String> = [alpha_vrf.clone()].into_iter().collect();
        let snapshot = store.snapshot(&degraded);

        assert_eq!(snapshot.vrfs.len(), 2);
        assert!(snapshot.vrfs[&alpha_vrf].degraded);
        assert_eq!(snapshot.vrfs.values().filter(|v| v.degraded).count(), 1);

        let cleared = snapshot.with_degraded(&BTreeSet::new());
        assert!(cleared.vrfs.values().all(|v| !v.degraded));
    }
}
