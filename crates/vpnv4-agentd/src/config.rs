//! Agent configuration
//!
//! Loaded from YAML (default location: /etc/vpnv4-agent/vpnv4.yaml) into
//! explicit structs, then validated eagerly by [`AgentConfig::validate`] so
//! that bad settings are rejected before anything touches the kernel.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vpnv4_common::{AgentError, AgentResult};

use crate::allocator::AllocatorSettings;
use crate::types::{DEFAULT_MAX_ID, DEFAULT_VRF_TABLE_BASE};

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vpnv4-agent/vpnv4.yaml";

/// External-id keys consulted, in order, to find a port's tenant
pub const DEFAULT_TENANT_KEYS: &[&str] = &[
    "k8s.ovn.org/namespace",
    "k8s.ovn.org/project",
    "neutron:project_id",
    "namespace",
    "name",
];

/// Kernel tables reserved for local, main and default routing
const RESERVED_KERNEL_TABLES: std::ops::RangeInclusive<u32> = 253..=255;

/// MP-BGP address family enabled towards a neighbour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AddressFamily {
    Vpnv4,
    Vpnv6,
}

impl FromStr for AddressFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "VPNV4" => Ok(AddressFamily::Vpnv4),
            "VPNV6" => Ok(AddressFamily::Vpnv6),
            _ => Err(format!("Unsupported address family '{}'", s)),
        }
    }
}

impl TryFrom<String> for AddressFamily {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AddressFamily> for String {
    fn from(value: AddressFamily) -> Self {
        value.to_string()
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::Vpnv4 => write!(f, "vpnv4"),
            AddressFamily::Vpnv6 => write!(f, "vpnv6"),
        }
    }
}

/// External BGP peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Neighbor {
    pub address: IpAddr,
    pub remote_asn: u32,
    #[serde(default = "default_families")]
    pub families: Vec<AddressFamily>,
    /// Free-form label rendered into the daemon configuration
    #[serde(default)]
    pub description: Option<String>,
}

impl Neighbor {
    pub fn new(address: IpAddr, remote_asn: u32) -> Self {
        Self {
            address,
            remote_asn,
            families: default_families(),
            description: None,
        }
    }

    pub fn has_family(&self, family: AddressFamily) -> bool {
        self.families.contains(&family)
    }
}

/// Inclusive range of numeric IDs the allocator must never issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRange {
    pub start: u16,
    pub end: u16,
}

/// Routing daemon and kernel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Local autonomous system
    pub local_asn: u32,

    /// BGP router ID
    pub router_id: Ipv4Addr,

    /// ASN used in Route Distinguishers (defaults to `local_asn`)
    #[serde(default)]
    pub rd_base: Option<u32>,

    /// ASN used in Route Targets (defaults to the RD base)
    #[serde(default)]
    pub rt_base: Option<u32>,

    #[serde(default, alias = "neighbors")]
    pub neighbours: Vec<Neighbor>,

    /// File the rendered daemon configuration is written to
    #[serde(default = "default_frr_config_path")]
    pub frr_config_path: PathBuf,

    /// Reload invocation; `{path}` is replaced by the quoted config path
    #[serde(default = "default_reload_command")]
    pub reload_command: String,

    /// Render the global `router bgp` section with neighbours
    #[serde(default = "default_true")]
    pub include_globals: bool,

    /// Also export IPv6 prefixes over VPNv6
    #[serde(default)]
    pub export_ipv6: bool,

    /// Keep a tenant's VRF when its prefixes disappear
    #[serde(default = "default_true")]
    pub maintain_empty_vrf: bool,

    /// The kernel has VRF support (the `vrf` module is loaded)
    #[serde(default = "default_true")]
    pub kernel_vrf_support: bool,

    #[serde(default = "default_vrf_table_base")]
    pub vrf_table_base: u32,

    #[serde(default = "default_max_id")]
    pub max_id: u16,

    #[serde(default)]
    pub reserved_ids: Vec<IdRange>,

    /// Bound on every `ip` or reload invocation
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Period of forced full reconciliation
    #[serde(default = "default_resync_interval")]
    pub resync_interval_secs: u64,

    /// Period at which a failed cycle is retried
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,
}

/// Route importer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImporterConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_importer_interval", alias = "interval")]
    pub interval_secs: u64,

    /// Write the learned-route table here as JSON; log only when unset
    #[serde(default)]
    pub export_path: Option<PathBuf>,
}

/// One change source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WatcherConfig {
    /// Declarative tenants file
    File {
        path: PathBuf,
        #[serde(default = "default_watch_interval", alias = "interval")]
        interval_secs: u64,
        #[serde(default = "default_resync_every")]
        resync_every: u32,
    },
    /// OVN Northbound poller
    Ovn {
        connection: String,
        #[serde(default = "default_watch_interval", alias = "interval")]
        interval_secs: u64,
        #[serde(default = "default_resync_every")]
        resync_every: u32,
        #[serde(default = "default_tenant_keys")]
        tenant_keys: Vec<String>,
        /// Bound on one database round-trip
        #[serde(default = "default_registry_timeout")]
        timeout_secs: u64,
    },
}

/// Complete agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub driver: DriverConfig,

    #[serde(default)]
    pub importer: ImporterConfig,

    #[serde(default)]
    pub watchers: Vec<WatcherConfig>,
}

fn default_true() -> bool {
    true
}

fn default_families() -> Vec<AddressFamily> {
    vec![AddressFamily::Vpnv4]
}

fn default_frr_config_path() -> PathBuf {
    PathBuf::from("/etc/frr/vpnv4.conf")
}

fn default_reload_command() -> String {
    format!("{} --reload {{path}}", vpnv4_common::shell::FRR_RELOAD_CMD)
}

fn default_vrf_table_base() -> u32 {
    DEFAULT_VRF_TABLE_BASE
}

fn default_max_id() -> u16 {
    DEFAULT_MAX_ID
}

fn default_command_timeout() -> u64 {
    30
}

fn default_resync_interval() -> u64 {
    300
}

fn default_retry_interval() -> u64 {
    5
}

fn default_importer_interval() -> u64 {
    10
}

fn default_watch_interval() -> u64 {
    5
}

fn default_resync_every() -> u32 {
    12
}

fn default_registry_timeout() -> u64 {
    10
}

fn default_tenant_keys() -> Vec<String> {
    DEFAULT_TENANT_KEYS.iter().map(|k| k.to_string()).collect()
}

impl Default for ImporterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_importer_interval(),
            export_path: None,
        }
    }
}

impl DriverConfig {
    pub fn rd_base(&self) -> u32 {
        self.rd_base.unwrap_or(self.local_asn)
    }

    pub fn rt_base(&self) -> u32 {
        self.rt_base.unwrap_or_else(|| self.rd_base())
    }

    pub fn allocator_settings(&self) -> AllocatorSettings {
        AllocatorSettings {
            rd_base: self.rd_base(),
            rt_base: self.rt_base(),
            max_id: self.max_id,
            reserved: self
                .reserved_ids
                .iter()
                .map(|r| r.start..=r.end)
                .collect(),
            vrf_table_base: self.vrf_table_base,
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    fn validate(&self) -> AgentResult<()> {
        if self.local_asn == 0 {
            return Err(AgentError::invalid_config("driver.local_asn", "must be non-zero"));
        }
        if self.rd_base() == 0 || self.rt_base() == 0 {
            return Err(AgentError::invalid_config(
                "driver.rd_base",
                "RD/RT base ASN must be non-zero",
            ));
        }
        if self.router_id.is_unspecified() {
            return Err(AgentError::invalid_config("driver.router_id", "must not be 0.0.0.0"));
        }

        let mut seen = HashSet::new();
        for neighbour in &self.neighbours {
            if neighbour.remote_asn == 0 {
                return Err(AgentError::invalid_config(
                    "driver.neighbours",
                    format!("neighbour {} has remote_asn 0", neighbour.address),
                ));
            }
            if neighbour.families.is_empty() {
                return Err(AgentError::invalid_config(
                    "driver.neighbours",
                    format!("neighbour {} has no address families", neighbour.address),
                ));
            }
            if !seen.insert(neighbour.address) {
                return Err(AgentError::invalid_config(
                    "driver.neighbours",
                    format!("duplicate neighbour {}", neighbour.address),
                ));
            }
        }

        if self.reload_command.trim().is_empty() {
            return Err(AgentError::invalid_config("driver.reload_command", "must not be empty"));
        }
        if self.frr_config_path.as_os_str().is_empty() {
            return Err(AgentError::invalid_config("driver.frr_config_path", "must not be empty"));
        }

        for range in &self.reserved_ids {
            if range.start > range.end {
                return Err(AgentError::invalid_config(
                    "driver.reserved_ids",
                    format!("range {}-{} is reversed", range.start, range.end),
                ));
            }
        }
        if self.allocator_settings().capacity() == 0 {
            return Err(AgentError::invalid_config(
                "driver.max_id",
                "no usable identifiers left after reservations",
            ));
        }

        let first_table = self.vrf_table_base.checked_add(1);
        let last_table = self.vrf_table_base.checked_add(u32::from(self.max_id));
        match (first_table, last_table) {
            (Some(first), Some(last)) => {
                if first <= *RESERVED_KERNEL_TABLES.end() && last >= *RESERVED_KERNEL_TABLES.start()
                {
                    return Err(AgentError::invalid_config(
                        "driver.vrf_table_base",
                        format!("table range {}-{} overlaps kernel tables 253-255", first, last),
                    ));
                }
            }
            _ => {
                return Err(AgentError::invalid_config(
                    "driver.vrf_table_base",
                    "table range overflows u32",
                ))
            }
        }

        for (field, value) in [
            ("driver.command_timeout_secs", self.command_timeout_secs),
            ("driver.resync_interval_secs", self.resync_interval_secs),
            ("driver.retry_interval_secs", self.retry_interval_secs),
        ] {
            if value == 0 {
                return Err(AgentError::invalid_config(field, "must be greater than zero"));
            }
        }

        Ok(())
    }
}

impl ImporterConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl WatcherConfig {
    /// Round-trip timeout of a registry watcher, `None` for files
    pub fn timeout(&self) -> Option<Duration> {
        match self {
            WatcherConfig::File { .. } => None,
            WatcherConfig::Ovn { timeout_secs, .. } => Some(Duration::from_secs(*timeout_secs)),
        }
    }

    /// Name used in logs and source batches
    pub fn name(&self) -> String {
        match self {
            WatcherConfig::File { path, .. } => format!("file:{}", path.display()),
            WatcherConfig::Ovn { connection, .. } => format!("ovn:{}", connection),
        }
    }

    pub fn interval(&self) -> Duration {
        match self {
            WatcherConfig::File { interval_secs, .. } | WatcherConfig::Ovn { interval_secs, .. } => {
                Duration::from_secs(*interval_secs)
            }
        }
    }

    fn validate(&self) -> AgentResult<()> {
        let (interval_secs, resync_every) = match self {
            WatcherConfig::File {
                path,
                interval_secs,
                resync_every,
            } => {
                if path.as_os_str().is_empty() {
                    return Err(AgentError::invalid_config("watchers.path", "must not be empty"));
                }
                (*interval_secs, *resync_every)
            }
            WatcherConfig::Ovn {
                connection,
                interval_secs,
                resync_every,
                tenant_keys,
                timeout_secs,
            } => {
                if !(connection.starts_with("tcp:") || connection.starts_with("unix:")) {
                    return Err(AgentError::invalid_config(
                        "watchers.connection",
                        format!("'{}' must be a tcp: or unix: endpoint", connection),
                    ));
                }
                if tenant_keys.is_empty() {
                    return Err(AgentError::invalid_config(
                        "watchers.tenant_keys",
                        "at least one key is required",
                    ));
                }
                if *timeout_secs == 0 {
                    return Err(AgentError::invalid_config(
                        "watchers.timeout_secs",
                        "must be greater than zero",
                    ));
                }
                (*interval_secs, *resync_every)
            }
        };
        if interval_secs == 0 {
            return Err(AgentError::invalid_config(
                "watchers.interval_secs",
                "must be greater than zero",
            ));
        }
        if resync_every == 0 {
            return Err(AgentError::invalid_config(
                "watchers.resync_every",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

impl AgentConfig {
    /// Load and validate configuration from a YAML file
    pub fn load(path: impl AsRef<Path>) -> AgentResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            AgentError::invalid_config("config", format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml_str(content: &str) -> AgentResult<Self> {
        let config: AgentConfig = serde_yaml::from_str(content)
            .map_err(|e| AgentError::invalid_config("config", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every setting
    pub fn validate(&self) -> AgentResult<()> {
        self.driver.validate()?;
        if self.importer.enabled && self.importer.interval_secs == 0 {
            return Err(AgentError::invalid_config(
                "importer.interval_secs",
                "must be greater than zero",
            ));
        }
        for watcher in &self.watchers {
            watcher.validate()?;
        }
        Ok(())
    }
}
