//! Port registry source
//!
//! Groups the registry's logical switch ports by tenant and reports each
//! tenant's address set. The registry itself sits behind [`RegistryClient`];
//! production uses the OVSDB client in [`super::ovsdb`].

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::IpNet;
use tracing::{debug, info};
use vpnv4_common::AgentResult;

use super::ChangeSource;
use crate::types::{host_prefix, ChangeEvent};

/// External id listing the port's CIDRs (`ip/len` separated by spaces)
pub const CIDRS_EXTERNAL_ID: &str = "neutron:cidrs";

/// Address tokens that carry no IP
const ADDRESS_KEYWORDS: &[&str] = &["router", "unknown", "dynamic"];

/// One logical switch port
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortRecord {
    /// Entries of the `addresses` column, each `"<mac> <ip> [<ip>...]"`
    pub addresses: Vec<String>,
    pub external_ids: BTreeMap<String, String>,
}

/// Read access to the port registry
#[async_trait]
pub trait RegistryClient: Send {
    async fn list_ports(&mut self) -> AgentResult<Vec<PortRecord>>;
}

/// Tenant owning a port: the first non-empty value among `keys`
pub fn tenant_of<'a>(port: &'a PortRecord, keys: &[String]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| port.external_ids.get(key))
        .map(|value| value.trim())
        .find(|value| !value.is_empty())
}

/// Host prefixes of every address carried by a port
pub fn port_prefixes(port: &PortRecord) -> BTreeSet<IpNet> {
    let from_addresses = port
        .addresses
        .iter()
        .flat_map(|entry| entry.split_whitespace())
        .filter(|token| !ADDRESS_KEYWORDS.contains(token))
        .filter_map(|token| token.parse::<IpAddr>().ok());

    let from_cidrs = port
        .external_ids
        .get(CIDRS_EXTERNAL_ID)
        .into_iter()
        .flat_map(|value| value.split_whitespace())
        .filter_map(|cidr| cidr.split('/').next())
        .filter_map(|addr| addr.parse::<IpAddr>().ok());

    from_addresses
        .chain(from_cidrs)
        .filter_map(|addr| host_prefix(addr).ok())
        .collect()
}

/// Desired tenant → prefix mapping for a set of ports
pub fn group_ports(ports: &[PortRecord], keys: &[String]) -> BTreeMap<String, BTreeSet<IpNet>> {
    let mut grouped: BTreeMap<String, BTreeSet<IpNet>> = BTreeMap::new();
    for port in ports {
        let Some(tenant) = tenant_of(port, keys) else {
            continue;
        };
        let prefixes = port_prefixes(port);
        if prefixes.is_empty() {
            continue;
        }
        grouped.entry(tenant.to_string()).or_default().extend(prefixes);
    }
    grouped
}

/// Diffs successive registry views into change events
#[derive(Debug, Default)]
pub struct TenantAggregator {
    current: BTreeMap<String, BTreeSet<IpNet>>,
}

impl TenantAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> &BTreeMap<String, BTreeSet<IpNet>> {
        &self.current
    }

    /// Replace the current view, returning what changed.
    ///
    /// With `full` every tenant is reported as an upsert.
    pub fn update(&mut self, desired: BTreeMap<String, BTreeSet<IpNet>>, full: bool) -> Vec<ChangeEvent> {
        let mut events = Vec::new();
        for (tenant, prefixes) in &desired {
            if full || self.current.get(tenant) != Some(prefixes) {
                events.push(ChangeEvent::upsert(tenant.clone(), prefixes.iter().copied()));
            }
        }
        for tenant in self.current.keys() {
            if !desired.contains_key(tenant) {
                events.push(ChangeEvent::delete(tenant.clone()));
            }
        }
        self.current = desired;
        events
    }
}

/// Change source polling a port registry
pub struct RegistrySource<C> {
    name: String,
    client: C,
    interval: Duration,
    resync_every: u32,
    tenant_keys: Vec<String>,
    polls: u64,
    aggregator: TenantAggregator,
}

impl<C: RegistryClient> RegistrySource<C> {
    pub fn new(
        name: impl Into<String>,
        client: C,
        interval: Duration,
        resync_every: u32,
        tenant_keys: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            client,
            interval,
            resync_every: resync_every.max(1),
            tenant_keys,
            polls: 0,
            aggregator: TenantAggregator::new(),
        }
    }
}

#[async_trait]
impl<C: RegistryClient> ChangeSource for RegistrySource<C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn poll(&mut self) -> AgentResult<Vec<ChangeEvent>> {
        let ports = self.client.list_ports().await?;
        self.polls += 1;
        let full = self.polls % u64::from(self.resync_every) == 0;

        let desired = group_ports(&ports, &self.tenant_keys);
        debug!(
            source = %self.name,
            ports = ports.len(),
            tenants = desired.len(),
            "Registry poll complete"
        );

        let events = self.aggregator.update(desired, full);
        if !events.is_empty() {
            info!(source = %self.name, events = events.len(), resync = full, "Registry state changed");
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_TENANT_KEYS;
    use std::collections::VecDeque;
    use vpnv4_common::AgentError;

    fn keys() -> Vec<String> {
        DEFAULT_TENANT_KEYS.iter().map(|k| k.to_string()).collect()
    }

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    fn port(addresses: &[&str], ids: &[(&str, &str)]) -> PortRecord {
        PortRecord {
            addresses: addresses.iter().map(|a| a.to_string()).collect(),
            external_ids: ids
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    struct ScriptedClient {
        responses: VecDeque<AgentResult<Vec<PortRecord>>>,
    }

    #[async_trait]
    impl RegistryClient for ScriptedClient {
        async fn list_ports(&mut self) -> AgentResult<Vec<PortRecord>> {
            self.responses.pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    #[test]
    fn test_tenant_key_priority() {
        let p = port(
            &[],
            &[("name", "pod-a"), ("k8s.ovn.org/namespace", "alpha")],
        );
        assert_eq!(tenant_of(&p, &keys()), Some("alpha"));

        let p = port(&[], &[("k8s.ovn.org/namespace", ""), ("namespace", "beta")]);
        assert_eq!(tenant_of(&p, &keys()), Some("beta"));

        assert_eq!(tenant_of(&port(&[], &[("owner", "x")]), &keys()), None);
    }

    #[test]
    fn test_port_prefixes() {
        let p = port(
            &["0a:58:0a:01:00:05 10.1.0.5 2001:db8::5", "router", "unknown"],
            &[(CIDRS_EXTERNAL_ID, "10.1.0.9/24 10.1.0.5/24")],
        );
        let expected: BTreeSet<IpNet> = ["10.1.0.5/32", "10.1.0.9/32", "2001:db8::5/128"]
            .iter()
            .map(|s| net(s))
            .collect();
        assert_eq!(port_prefixes(&p), expected);

        assert!(port_prefixes(&port(&["dynamic"], &[])).is_empty());
    }

    #[test]
    fn test_group_ports() {
        let ports = vec![
            port(&["aa:bb 10.1.0.5"], &[("namespace", "alpha")]),
            port(&["aa:cc 10.1.0.6"], &[("namespace", "alpha")]),
            port(&["aa:dd"], &[("namespace", "empty")]),
            port(&["aa:ee 10.9.0.1"], &[]),
        ];
        let grouped = group_ports(&ports, &keys());
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped["alpha"].len(), 2);
    }

    #[test]
    fn test_aggregator_diff() {
        let mut agg = TenantAggregator::new();
        let first: BTreeMap<String, BTreeSet<IpNet>> = [("alpha".to_string(), [net("10.1.0.5/32")].into())].into();

        assert_eq!(agg.update(first.clone(), false).len(), 1);
        assert!(agg.update(first.clone(), false).is_empty());
        assert_eq!(agg.update(first, true).len(), 1);

        assert_eq!(
            agg.update(BTreeMap::new(), false),
            vec![ChangeEvent::delete("alpha")]
        );
        assert!(agg.current().is_empty());
    }

    #[tokio::test]
    async fn test_outage_then_recovery() {
        let client = ScriptedClient {
            responses: VecDeque::from(vec![
                Ok(vec![
                    port(&["m 10.1.0.5"], &[("namespace", "alpha")]),
                    port(&["m 10.2.0.5"], &[("namespace", "beta")]),
                ]),
                Err(AgentError::source("ovn", "connection refused")),
                Err(AgentError::source("ovn", "connection refused")),
                Ok(vec![
                    port(&["m 10.1.0.5"], &[("namespace", "alpha")]),
                    port(&["m 10.3.0.5"], &[("namespace", "gamma")]),
                ]),
            ]),
        };
        let mut src = RegistrySource::new("ovn:test", client, Duration::from_secs(1), 100, keys());

        assert_eq!(src.poll().await.unwrap().len(), 2);
        assert!(src.poll().await.is_err());
        assert!(src.poll().await.is_err());

        let events = src.poll().await.unwrap();
        assert_eq!(
            events,
            vec![
                ChangeEvent::upsert("gamma", vec![net("10.3.0.5/32")]),
                ChangeEvent::delete("beta"),
            ]
        );
    }
}
