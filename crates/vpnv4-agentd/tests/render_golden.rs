//! Golden-file tests for the rendered routing daemon configuration

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::Path;

use pretty_assertions::assert_eq;
use vpnv4_agentd::config::{AddressFamily, Neighbor};
use vpnv4_agentd::store::VrfSnapshot;
use vpnv4_agentd::{render, RenderSettings, Snapshot};

fn golden(name: &str) -> String {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/data").join(name);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("read {}: {}", path.display(), e))
}

fn vrf(name: &str, id: u16, prefixes: &[&str], degraded: bool) -> VrfSnapshot {
    VrfSnapshot {
        tenant: name.to_string(),
        vrf_name: format!("{}-{}", name, id),
        numeric_id: id,
        rd: format!("65000:{}", id),
        rt: format!("65001:{}", id),
        table_id: 10000 + u32::from(id),
        prefixes: prefixes.iter().map(|p| p.parse().unwrap()).collect(),
        degraded,
    }
}

fn settings() -> RenderSettings {
    let mut pe1 = Neighbor::new("192.0.2.1".parse().unwrap(), 65100);
    pe1.description = Some("pe-1".to_string());
    let mut pe2 = Neighbor::new("2001:db8::1".parse().unwrap(), 65100);
    pe2.families = vec![AddressFamily::Vpnv4, AddressFamily::Vpnv6];

    RenderSettings {
        local_asn: 65000,
        router_id: Ipv4Addr::new(10, 255, 0, 1),
        neighbours: vec![pe1, pe2],
        include_globals: true,
        export_ipv6: true,
    }
}

fn two_tenants() -> Snapshot {
    let vrfs: BTreeMap<String, VrfSnapshot> = [
        vrf("beta", 42, &["10.2.0.0/24"], true),
        vrf("alpha", 17, &["10.1.1.0/24", "2001:db8:1::/64", "10.1.0.0/24"], false),
    ]
    .into_iter()
    .map(|v| (v.vrf_name.clone(), v))
    .collect();
    Snapshot { vrfs }
}

#[test]
fn test_two_tenants_match_golden_file() {
    let rendered = render(&two_tenants(), &settings());
    assert_eq!(rendered.config, golden("two_tenants.conf"));
}

#[test]
fn test_degraded_vrf_keeps_kernel_objects() {
    let rendered = render(&two_tenants(), &settings());

    let beta = &rendered.kernel["beta-42"];
    assert_eq!(beta.table_id, 10042);
    assert!(beta.blackholes.contains(&"10.2.0.0/24".parse().unwrap()));
    assert_eq!(rendered.kernel["alpha-17"].blackholes.len(), 3);
}

#[test]
fn test_render_is_stable() {
    let first = render(&two_tenants(), &settings());
    let second = render(&two_tenants(), &settings());
    assert_eq!(first, second);
}
