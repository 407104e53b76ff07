//! Deterministic RD/RT/VRF identifier allocation
//!
//! A tenant name is hashed into a bounded numeric space so that identifiers
//! survive restarts without a persisted table. The only mutable state is the
//! [`AllocationTable`] of live assignments, which the reconciliation engine
//! owns and passes in explicitly.
//!
//! Probing order when a candidate is taken or reserved:
//!
//! 1. salts `0..MAX_SALTED_PROBES`: salt 0 hashes the bare name, salt `k`
//!    hashes `"{name}#{k}"`;
//! 2. linear scan upward (wrapping) from the salt-0 candidate.

use std::collections::HashMap;
use std::ops::RangeInclusive;

use sha2::{Digest, Sha256};
use tracing::{debug, info};
use vpnv4_common::{AgentError, AgentResult};

use crate::types::{DEFAULT_MAX_ID, DEFAULT_VRF_TABLE_BASE, MAX_IFNAME_LEN};

/// Number of salted rehashes tried before falling back to a linear scan
pub const MAX_SALTED_PROBES: u32 = 64;

/// Inputs that shape allocation, fixed for the lifetime of the process
#[derive(Debug, Clone)]
pub struct AllocatorSettings {
    /// ASN used in Route Distinguishers
    pub rd_base: u32,
    /// ASN used in Route Targets
    pub rt_base: u32,
    /// Largest numeric ID that may be issued
    pub max_id: u16,
    /// Operator-reserved IDs that are never issued
    pub reserved: Vec<RangeInclusive<u16>>,
    /// Offset added to the numeric ID to form the routing table ID
    pub vrf_table_base: u32,
}

impl AllocatorSettings {
    /// Settings with default range and table base
    pub fn new(rd_base: u32, rt_base: u32) -> Self {
        Self {
            rd_base,
            rt_base,
            max_id: DEFAULT_MAX_ID,
            reserved: Vec::new(),
            vrf_table_base: DEFAULT_VRF_TABLE_BASE,
        }
    }

    /// Returns true if `id` may be handed out
    pub fn is_usable(&self, id: u16) -> bool {
        id != 0 && id <= self.max_id && !self.reserved.iter().any(|r| r.contains(&id))
    }

    /// Number of IDs that may be handed out
    pub fn capacity(&self) -> usize {
        (1..=self.max_id).filter(|id| self.is_usable(*id)).count()
    }
}

/// Identifiers derived for one tenant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub numeric_id: u16,
    /// Route Distinguisher, `<rd_base>:<numeric_id>`
    pub rd: String,
    /// Route Target used for both import and export, `<rt_base>:<numeric_id>`
    pub rt: String,
    /// Kernel VRF device name
    pub vrf_name: String,
    /// Kernel routing table bound to the VRF
    pub table_id: u32,
}

/// Live assignments, used to detect and resolve collisions
#[derive(Debug, Default)]
pub struct AllocationTable {
    by_name: HashMap<String, Allocation>,
    by_id: HashMap<u16, String>,
}

impl AllocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocation currently held by `name`
    pub fn lookup(&self, name: &str) -> Option<&Allocation> {
        self.by_name.get(name)
    }

    /// Tenant currently holding `id`
    pub fn owner(&self, id: u16) -> Option<&str> {
        self.by_id.get(&id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Free the ID held by `name`
    pub fn release(&mut self, name: &str) -> Option<Allocation> {
        let allocation = self.by_name.remove(name)?;
        self.by_id.remove(&allocation.numeric_id);
        debug!(tenant = name, id = allocation.numeric_id, "Released identifier");
        Some(allocation)
    }

    fn is_free(&self, id: u16) -> bool {
        !self.by_id.contains_key(&id)
    }
}

/// Salted hash of `name` reduced into `1..=max_id`
pub fn candidate(name: &str, salt: u32, max_id: u16) -> u16 {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    if salt > 0 {
        hasher.update(format!("#{}", salt).as_bytes());
    }
    let digest = hasher.finalize();
    let raw = u16::from_be_bytes([digest[0], digest[1]]);
    (raw % max_id.max(1)) + 1
}

/// Kernel-safe VRF device name for `name` carrying `numeric_id` as suffix.
///
/// The part after the final `-` is always the numeric ID, so two tenants
/// holding different IDs never share a device name.
pub fn vrf_name(name: &str, numeric_id: u16) -> String {
    let suffix = format!("-{}", numeric_id);
    let max_base = MAX_IFNAME_LEN - suffix.len();

    let mut base: String = name
        .chars()
        .flat_map(char::to_lowercase)
        .filter_map(|c| match c {
            'a'..='z' | '0'..='9' | '-' | '_' => Some(c),
            '.' => Some('-'),
            _ => None,
        })
        .take(max_base)
        .collect();

    while base.ends_with('-') || base.ends_with('_') {
        base.pop();
    }
    if base.is_empty() {
        base.push_str("vrf");
    }

    format!("{}{}", base, suffix)
}

/// Allocate identifiers for `name`, recording the result in `table`.
///
/// Allocating a name that is already live returns its current allocation.
pub fn allocate(
    name: &str,
    settings: &AllocatorSettings,
    table: &mut AllocationTable,
) -> AgentResult<Allocation> {
    if let Some(existing) = table.lookup(name) {
        return Ok(existing.clone());
    }

    let numeric_id = probe(name, settings, table).ok_or_else(|| AgentError::AllocationExhausted {
        tenant: name.to_string(),
        capacity: settings.capacity(),
    })?;

    let allocation = Allocation {
        numeric_id,
        rd: format!("{}:{}", settings.rd_base, numeric_id),
        rt: format!("{}:{}", settings.rt_base, numeric_id),
        vrf_name: vrf_name(name, numeric_id),
        table_id: settings.vrf_table_base + u32::from(numeric_id),
    };

    table.by_id.insert(numeric_id, name.to_string());
    table.by_name.insert(name.to_string(), allocation.clone());

    info!(
        tenant = name,
        id = numeric_id,
        rd = %allocation.rd,
        rt = %allocation.rt,
        vrf = %allocation.vrf_name,
        "Allocated vpnv4 identifiers"
    );

    Ok(allocation)
}

fn probe(name: &str, settings: &AllocatorSettings, table: &AllocationTable) -> Option<u16> {
    let max_id = settings.max_id;
    if max_id == 0 {
        return None;
    }

    for salt in 0..MAX_SALTED_PROBES {
        let id = candidate(name, salt, max_id);
        if settings.is_usable(id) && table.is_free(id) {
            if salt > 0 {
                debug!(tenant = name, salt, id, "Resolved identifier collision by rehash");
            }
            return Some(id);
        }
    }

    let start = candidate(name, 0, max_id);
    (0..max_id)
        .map(|step| ((u32::from(start) - 1 + u32::from(step)) % u32::from(max_id)) as u16 + 1)
        .find(|id| settings.is_usable(*id) && table.is_free(*id))
}
