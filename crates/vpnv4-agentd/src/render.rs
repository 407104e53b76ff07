//! FRR configuration and kernel object rendering
//!
//! Rendering is a pure function of a [`Snapshot`] and [`RenderSettings`]:
//! VRFs are emitted in name order and prefixes in address order, so the same
//! input always yields byte-identical text. The engine compares that text
//! with the last accepted configuration to decide whether a reload is needed.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::net::Ipv4Addr;

use ipnet::IpNet;

use crate::config::{AddressFamily, DriverConfig, Neighbor};
use crate::store::{Snapshot, VrfSnapshot};
use crate::types::KernelVrf;

const FRR_HEADER: &str = "!\nfrr defaults traditional\nservice integrated-vtysh-config\n!\n";

/// Comment placed in an address-family block with nothing to announce
pub const NO_PREFIXES_COMMENT: &str = "! no prefixes advertised";

/// Settings that shape the rendered configuration
#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub local_asn: u32,
    pub router_id: Ipv4Addr,
    pub neighbours: Vec<Neighbor>,
    pub include_globals: bool,
    pub export_ipv6: bool,
}

impl From<&DriverConfig> for RenderSettings {
    fn from(driver: &DriverConfig) -> Self {
        Self {
            local_asn: driver.local_asn,
            router_id: driver.router_id,
            neighbours: driver.neighbours.clone(),
            include_globals: driver.include_globals,
            export_ipv6: driver.export_ipv6,
        }
    }
}

/// Output of one render pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rendered {
    /// Routing daemon configuration text
    pub config: String,
    /// Desired kernel objects keyed by VRF name
    pub kernel: BTreeMap<String, KernelVrf>,
}

/// Render the desired state
pub fn render(snapshot: &Snapshot, settings: &RenderSettings) -> Rendered {
    let mut config = String::new();

    if settings.include_globals {
        config.push_str(FRR_HEADER);
        render_globals(&mut config, settings);
    }

    for vrf in snapshot.vrfs.values() {
        render_vrf(&mut config, vrf, settings);
    }

    if settings.include_globals {
        config.push_str("line vty\n!\n");
    }

    Rendered {
        config,
        kernel: render_kernel(snapshot, settings.export_ipv6),
    }
}

/// Desired kernel objects, independent of degradation
pub fn render_kernel(snapshot: &Snapshot, export_ipv6: bool) -> BTreeMap<String, KernelVrf> {
    snapshot
        .vrfs
        .values()
        .map(|vrf| {
            let mut object = KernelVrf::new(vrf.vrf_name.clone(), vrf.table_id);
            object.blackholes = vrf
                .prefixes
                .iter()
                .filter(|p| export_ipv6 || matches!(p, IpNet::V4(_)))
                .copied()
                .collect();
            (vrf.vrf_name.clone(), object)
        })
        .collect()
}

fn render_globals(out: &mut String, settings: &RenderSettings) {
    let _ = writeln!(out, "router bgp {}", settings.local_asn);
    let _ = writeln!(out, " bgp router-id {}", settings.router_id);
    out.push_str(" no bgp default ipv4-unicast\n");

    for neighbour in &settings.neighbours {
        let _ = writeln!(
            out,
            " neighbor {} remote-as {}",
            neighbour.address, neighbour.remote_asn
        );
        if let Some(description) = &neighbour.description {
            let _ = writeln!(out, " neighbor {} description {}", neighbour.address, description);
        }
    }

    render_vpn_family(out, settings, AddressFamily::Vpnv4, "ipv4");
    if settings.export_ipv6 {
        render_vpn_family(out, settings, AddressFamily::Vpnv6, "ipv6");
    }

    out.push_str("exit\n!\n");
}

fn render_vpn_family(out: &mut String, settings: &RenderSettings, family: AddressFamily, afi: &str) {
    let members: Vec<&Neighbor> = settings
        .neighbours
        .iter()
        .filter(|n| n.has_family(family))
        .collect();
    if members.is_empty() {
        return;
    }

    out.push_str(" !\n");
    let _ = writeln!(out, " address-family {} vpn", afi);
    for neighbour in members {
        let _ = writeln!(out, "  neighbor {} activate", neighbour.address);
        let _ = writeln!(out, "  neighbor {} send-community extended", neighbour.address);
    }
    out.push_str(" exit-address-family\n");
}

fn render_vrf(out: &mut String, vrf: &VrfSnapshot, settings: &RenderSettings) {
    let _ = writeln!(out, "router bgp {} vrf {}", settings.local_asn, vrf.vrf_name);
    // Blackholes may be installed after the stanza is loaded
    out.push_str(" no bgp network import-check\n");

    let v4: Vec<&IpNet> = vrf
        .prefixes
        .iter()
        .filter(|p| matches!(p, IpNet::V4(_)))
        .collect();
    render_unicast_family(out, vrf, "ipv4", &v4);

    if settings.export_ipv6 {
        let v6: Vec<&IpNet> = vrf
            .prefixes
            .iter()
            .filter(|p| matches!(p, IpNet::V6(_)))
            .collect();
        if !v6.is_empty() {
            render_unicast_family(out, vrf, "ipv6", &v6);
        }
    }

    out.push_str("exit\n!\n");
}

fn render_unicast_family(out: &mut String, vrf: &VrfSnapshot, afi: &str, prefixes: &[&IpNet]) {
    out.push_str(" !\n");
    let _ = writeln!(out, " address-family {} unicast", afi);
    out.push_str("  label vpn export auto\n");
    let _ = writeln!(out, "  rd vpn export {}", vrf.rd);
    let _ = writeln!(out, "  rt vpn import {}", vrf.rt);
    let _ = writeln!(out, "  rt vpn export {}", vrf.rt);
    out.push_str("  export vpn\n");
    out.push_str("  import vpn\n");

    if vrf.degraded || prefixes.is_empty() {
        let _ = writeln!(out, "  {}", NO_PREFIXES_COMMENT);
    } else {
        // Blackholes are kernel routes in the VRF table
        out.push_str("  redistribute kernel\n");
        for prefix in prefixes {
            let _ = writeln!(out, "  network {}", prefix);
        }
    }
    out.push_str(" exit-address-family\n");
}
