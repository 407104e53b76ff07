//! Type definitions shared across the agent

use std::collections::BTreeSet;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// Longest kernel interface name (IFNAMSIZ minus the trailing NUL)
pub const MAX_IFNAME_LEN: usize = 15;

/// Default offset added to a tenant's numeric ID to form its routing table ID
pub const DEFAULT_VRF_TABLE_BASE: u32 = 10000;

/// Default upper bound (inclusive) of the numeric ID space
pub const DEFAULT_MAX_ID: u16 = 65535;

/// Tenant change reported by a change source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// Full desired prefix set for a tenant
    Upsert {
        tenant: String,
        prefixes: BTreeSet<IpNet>,
    },
    /// Tenant no longer exists at the source
    Delete { tenant: String },
}

impl ChangeEvent {
    /// Create an upsert event, collapsing duplicate prefixes
    pub fn upsert(tenant: impl Into<String>, prefixes: impl IntoIterator<Item = IpNet>) -> Self {
        Self::Upsert {
            tenant: tenant.into(),
            prefixes: prefixes.into_iter().collect(),
        }
    }

    /// Create a delete event
    pub fn delete(tenant: impl Into<String>) -> Self {
        Self::Delete {
            tenant: tenant.into(),
        }
    }

    /// Tenant the event refers to
    pub fn tenant(&self) -> &str {
        match self {
            ChangeEvent::Upsert { tenant, .. } | ChangeEvent::Delete { tenant } => tenant,
        }
    }
}

/// Events produced by one poll of one source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceBatch {
    /// Name of the producing source
    pub source: String,
    /// Events in the order the source produced them
    pub events: Vec<ChangeEvent>,
}

/// Kernel state owned by the agent for one tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelVrf {
    /// VRF device name
    pub name: String,
    /// Routing table bound to the VRF device
    pub table_id: u32,
    /// Blackhole routes installed for advertised prefixes
    pub blackholes: BTreeSet<IpNet>,
}

impl KernelVrf {
    /// Create a VRF object with no routes
    pub fn new(name: impl Into<String>, table_id: u32) -> Self {
        Self {
            name: name.into(),
            table_id,
            blackholes: BTreeSet::new(),
        }
    }
}

/// Kind of a kernel route entry, as reported by `ip -j route`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteType {
    Unicast,
    Blackhole,
    Unreachable,
    Prohibit,
    Local,
    Broadcast,
    Multicast,
    Other,
}

impl RouteType {
    /// Parse the `type` field; a missing field means unicast
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            None | Some("unicast") => RouteType::Unicast,
            Some("blackhole") => RouteType::Blackhole,
            Some("unreachable") => RouteType::Unreachable,
            Some("prohibit") => RouteType::Prohibit,
            Some("local") => RouteType::Local,
            Some("broadcast") => RouteType::Broadcast,
            Some("multicast") => RouteType::Multicast,
            Some(_) => RouteType::Other,
        }
    }
}

/// One entry of a VRF routing table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelRoute {
    pub prefix: IpNet,
    pub next_hop: Option<IpAddr>,
    pub route_type: RouteType,
    pub protocol: Option<String>,
}

/// Origin of a learned route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteSource {
    External,
}

/// Route present in a VRF table that the agent did not originate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearnedRoute {
    pub tenant: String,
    pub vrf: String,
    pub prefix: IpNet,
    pub next_hop: Option<IpAddr>,
    pub source: RouteSource,
}

/// Parse a prefix as reported by a source.
///
/// A bare address becomes a host route and host bits are cleared, so
/// `10.1.0.7/24` and `10.1.0.0/24` compare equal.
pub fn normalize_prefix(value: &str) -> Result<IpNet, String> {
    let value = value.trim();
    if value.is_empty() {
        return Err("prefix value cannot be empty".to_string());
    }
    if value.contains('/') {
        value
            .parse::<IpNet>()
            .map(|net| net.trunc())
            .map_err(|e| format!("invalid prefix '{}': {}", value, e))
    } else {
        let addr = value
            .parse::<IpAddr>()
            .map_err(|e| format!("invalid address '{}': {}", value, e))?;
        host_prefix(addr).map_err(|e| format!("invalid address '{}': {}", value, e))
    }
}

/// Host route covering exactly `addr`
pub fn host_prefix(addr: IpAddr) -> Result<IpNet, ipnet::PrefixLenError> {
    match addr {
        IpAddr::V4(_) => IpNet::new(addr, 32),
        IpAddr::V6(_) => IpNet::new(addr, 128),
    }
}
