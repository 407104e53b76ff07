//! Shell command builders for VRF and route operations

use std::path::Path;

use ipnet::IpNet;
use vpnv4_common::shell;

/// Build VRF creation command
///
/// Creates a VRF device bound to the given routing table
pub fn build_add_vrf_cmd(vrf_name: &str, table_id: u32) -> String {
    format!(
        "{} link add {} type vrf table {}",
        shell::IP_CMD,
        shell::shellquote(vrf_name),
        table_id
    )
}

/// Build VRF bring-up command
pub fn build_set_vrf_up_cmd(vrf_name: &str) -> String {
    format!(
        "{} link set {} up",
        shell::IP_CMD,
        shell::shellquote(vrf_name)
    )
}

/// Build VRF deletion command
pub fn build_del_vrf_cmd(vrf_name: &str) -> String {
    format!("{} link del {}", shell::IP_CMD, shell::shellquote(vrf_name))
}

/// Build VRF detail query
///
/// Exits non-zero when the device does not exist
pub fn build_show_vrf_cmd(vrf_name: &str) -> String {
    format!(
        "{} -j -d link show {} type vrf",
        shell::IP_CMD,
        shell::shellquote(vrf_name)
    )
}

/// Build blackhole route install command
///
/// `replace` keeps the command idempotent
pub fn build_add_blackhole_cmd(prefix: &IpNet, vrf_name: &str) -> String {
    format!(
        "{}{} route replace blackhole {} vrf {}",
        shell::IP_CMD,
        family_flag(prefix),
        shell::shellquote(&prefix.to_string()),
        shell::shellquote(vrf_name)
    )
}

/// Build blackhole route removal command
pub fn build_del_blackhole_cmd(prefix: &IpNet, vrf_name: &str) -> String {
    format!(
        "{}{} route del blackhole {} vrf {}",
        shell::IP_CMD,
        family_flag(prefix),
        shell::shellquote(&prefix.to_string()),
        shell::shellquote(vrf_name)
    )
}

/// Build JSON route listing for one VRF table
pub fn build_show_routes_cmd(vrf_name: &str, ipv6: bool) -> String {
    format!(
        "{} -j{} route show vrf {}",
        shell::IP_CMD,
        if ipv6 { " -6" } else { "" },
        shell::shellquote(vrf_name)
    )
}

/// Substitute the configuration path into the reload command template
///
/// A template without `{path}` is used as-is.
pub fn build_reload_cmd(template: &str, config_path: &Path) -> String {
    template.replace(
        "{path}",
        &shell::shellquote(&config_path.display().to_string()),
    )
}

fn family_flag(prefix: &IpNet) -> &'static str {
    match prefix {
        IpNet::V4(_) => "",
        IpNet::V6(_) => " -6",
    }
}
