//! Appliers driving the kernel and the routing daemon
//!
//! [`KernelOps`] manages VRF devices and blackhole routes through `ip(8)`;
//! [`DaemonOps`] pushes a full configuration to the routing daemon. The
//! engine only talks to these traits, so tests swap in recording fakes.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use ipnet::IpNet;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use vpnv4_common::shell::{self, ExecResult};
use vpnv4_common::{AgentError, AgentResult};

use crate::commands::*;
use crate::types::{normalize_prefix, KernelRoute, RouteType};

/// Kernel VRF and route operations
#[async_trait]
pub trait KernelOps: Send + Sync {
    /// Create the VRF device bound to `table_id` if missing and bring it up
    async fn ensure_vrf(&self, vrf: &str, table_id: u32) -> AgentResult<()>;

    /// Delete the VRF device; a missing device is not an error
    async fn remove_vrf(&self, vrf: &str) -> AgentResult<()>;

    /// Install a blackhole route for `prefix` in the VRF table
    async fn add_blackhole(&self, vrf: &str, prefix: &IpNet) -> AgentResult<()>;

    /// Remove a blackhole route; a missing route is not an error
    async fn del_blackhole(&self, vrf: &str, prefix: &IpNet) -> AgentResult<()>;

    /// Routes of the VRF table, IPv6 included when enabled
    async fn list_routes(&self, vrf: &str) -> AgentResult<Vec<KernelRoute>>;
}

/// Routing daemon configuration push
#[async_trait]
pub trait DaemonOps: Send + Sync {
    /// Install `config` and make the daemon load it.
    ///
    /// On error the daemon keeps running its previous configuration.
    async fn apply_config(&self, config: &str) -> AgentResult<()>;
}

/// [`KernelOps`] backed by the `ip` command
#[derive(Debug)]
pub struct IpKernel {
    timeout: Duration,
    enabled: bool,
    ipv6: bool,

    /// Testing support
    #[cfg(test)]
    mock_mode: bool,
    #[cfg(test)]
    mock_responses: Vec<(String, ExecResult)>,
    #[cfg(test)]
    captured_commands: std::sync::Mutex<Vec<String>>,
}

impl IpKernel {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            enabled: true,
            ipv6: false,
            #[cfg(test)]
            mock_mode: false,
            #[cfg(test)]
            mock_responses: Vec::new(),
            #[cfg(test)]
            captured_commands: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Kernel without VRF support: every operation is skipped
    pub fn disabled(timeout: Duration) -> Self {
        Self {
            enabled: false,
            ..Self::new(timeout)
        }
    }

    /// Also list IPv6 routes
    pub fn with_ipv6(mut self, ipv6: bool) -> Self {
        self.ipv6 = ipv6;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Execute shell command (with mock mode support)
    async fn exec(&self, cmd: &str) -> AgentResult<ExecResult> {
        #[cfg(test)]
        if self.mock_mode {
            if let Ok(mut captured) = self.captured_commands.lock() {
                captured.push(cmd.to_string());
            }
            if let Some((_, response)) = self.mock_responses.iter().find(|(p, _)| cmd.contains(p.as_str())) {
                return Ok(response.clone());
            }
            // Queries report "absent", mutations succeed
            let exit_code = if cmd.contains(" show ") { 1 } else { 0 };
            return Ok(ExecResult {
                exit_code,
                stdout: String::new(),
                stderr: String::new(),
            });
        }

        shell::exec(cmd, self.timeout).await
    }

    async fn exec_checked(&self, vrf: &str, cmd: &str) -> AgentResult<ExecResult> {
        let result = self
            .exec(cmd)
            .await
            .map_err(|e| AgentError::kernel(vrf, e.to_string()))?;
        if result.success() {
            Ok(result)
        } else {
            Err(AgentError::kernel(
                vrf,
                format!("'{}' exited {}: {}", cmd, result.exit_code, result.combined_output()),
            ))
        }
    }

    /// Table the existing VRF device is bound to, `None` when absent
    async fn current_table(&self, vrf: &str) -> AgentResult<Option<u32>> {
        let result = self
            .exec(&build_show_vrf_cmd(vrf))
            .await
            .map_err(|e| AgentError::kernel(vrf, e.to_string()))?;
        if !result.success() {
            return Ok(None);
        }
        Ok(Some(parse_vrf_table(&result.stdout).unwrap_or(0)))
    }

    /// Routes of one address family in the VRF table
    async fn list_family(&self, vrf: &str, ipv6: bool) -> AgentResult<Vec<KernelRoute>> {
        let output = self.exec_checked(vrf, &build_show_routes_cmd(vrf, ipv6)).await?;
        parse_routes(&output.stdout, ipv6).map_err(|e| AgentError::importer(vrf, e))
    }

    #[cfg(test)]
    pub fn with_mock_mode(mut self) -> Self {
        self.mock_mode = true;
        self
    }

    /// Answer commands containing `pattern` with a canned result
    #[cfg(test)]
    pub fn with_mock_response(mut self, pattern: &str, exit_code: i32, stdout: &str) -> Self {
        self.mock_responses.push((
            pattern.to_string(),
            ExecResult {
                exit_code,
                stdout: stdout.to_string(),
                stderr: String::new(),
            },
        ));
        self
    }

    #[cfg(test)]
    pub fn captured_commands(&self) -> Vec<String> {
        self.captured_commands
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl KernelOps for IpKernel {
    #[instrument(skip(self))]
    async fn ensure_vrf(&self, vrf: &str, table_id: u32) -> AgentResult<()> {
        if !self.enabled {
            debug!("Kernel VRF support disabled, skipping");
            return Ok(());
        }

        match self.current_table(vrf).await? {
            Some(table) if table == table_id => {
                debug!("VRF already exists");
            }
            Some(table) => {
                return Err(AgentError::kernel(
                    vrf,
                    format!("device exists bound to table {}, expected {}", table, table_id),
                ));
            }
            None => {
                self.exec_checked(vrf, &build_add_vrf_cmd(vrf, table_id)).await?;
                info!("Created VRF device");
            }
        }

        self.exec_checked(vrf, &build_set_vrf_up_cmd(vrf)).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn remove_vrf(&self, vrf: &str) -> AgentResult<()> {
        if !self.enabled {
            return Ok(());
        }

        let cmd = build_del_vrf_cmd(vrf);
        let result = self
            .exec(&cmd)
            .await
            .map_err(|e| AgentError::kernel(vrf, e.to_string()))?;
        if result.success() || is_absent(&result) {
            info!("Removed VRF device");
            Ok(())
        } else {
            Err(AgentError::kernel(vrf, result.combined_output()))
        }
    }

    #[instrument(skip(self, prefix), fields(prefix = %prefix))]
    async fn add_blackhole(&self, vrf: &str, prefix: &IpNet) -> AgentResult<()> {
        if !self.enabled {
            return Ok(());
        }
        self.exec_checked(vrf, &build_add_blackhole_cmd(prefix, vrf)).await?;
        debug!("Installed blackhole route");
        Ok(())
    }

    #[instrument(skip(self, prefix), fields(prefix = %prefix))]
    async fn del_blackhole(&self, vrf: &str, prefix: &IpNet) -> AgentResult<()> {
        if !self.enabled {
            return Ok(());
        }

        let result = self
            .exec(&build_del_blackhole_cmd(prefix, vrf))
            .await
            .map_err(|e| AgentError::kernel(vrf, e.to_string()))?;
        if result.success() || is_absent(&result) {
            debug!("Removed blackhole route");
            Ok(())
        } else {
            Err(AgentError::kernel(vrf, result.combined_output()))
        }
    }

    async fn list_routes(&self, vrf: &str) -> AgentResult<Vec<KernelRoute>> {
        if !self.enabled {
            return Ok(Vec::new());
        }

        let mut routes = self.list_family(vrf, false).await?;
        if self.ipv6 {
            // IPv4 routes are still handed over when the v6 table is unreadable
            match self.list_family(vrf, true).await {
                Ok(v6) => routes.extend(v6),
                Err(e) => warn!(vrf, error = %e, "Failed to list IPv6 routes"),
            }
        }
        Ok(routes)
    }
}

/// `ip` reports a missing device or route
fn is_absent(result: &ExecResult) -> bool {
    let output = result.combined_output();
    output.contains("Cannot find device") || output.contains("No such process")
}

/// Table ID from `ip -j -d link show` output
fn parse_vrf_table(json: &str) -> Option<u32> {
    let links: Value = serde_json::from_str(json).ok()?;
    links
        .get(0)?
        .get("linkinfo")?
        .get("info_data")?
        .get("table")?
        .as_u64()
        .and_then(|t| u32::try_from(t).ok())
}

#[derive(Debug, Deserialize)]
struct IpRouteEntry {
    #[serde(rename = "type")]
    route_type: Option<String>,
    dst: String,
    gateway: Option<String>,
    protocol: Option<String>,
}

/// Parse `ip -j route show` output
pub fn parse_routes(json: &str, ipv6: bool) -> Result<Vec<KernelRoute>, String> {
    let json = json.trim();
    if json.is_empty() {
        return Ok(Vec::new());
    }
    let entries: Vec<IpRouteEntry> =
        serde_json::from_str(json).map_err(|e| format!("invalid route listing: {}", e))?;

    entries
        .into_iter()
        .map(|entry| {
            let prefix = match entry.dst.as_str() {
                "default" if ipv6 => normalize_prefix("::/0")?,
                "default" => normalize_prefix("0.0.0.0/0")?,
                dst => normalize_prefix(dst)?,
            };
            Ok(KernelRoute {
                prefix,
                next_hop: entry.gateway.as_deref().and_then(|g| g.parse().ok()),
                route_type: RouteType::parse(entry.route_type.as_deref()),
                protocol: entry.protocol,
            })
        })
        .collect()
}

/// [`DaemonOps`] writing an FRR configuration file and running the reload command
#[derive(Debug, Clone)]
pub struct FrrDaemon {
    config_path: PathBuf,
    reload_command: String,
    timeout: Duration,
}

impl FrrDaemon {
    pub fn new(config_path: impl Into<PathBuf>, reload_command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            config_path: config_path.into(),
            reload_command: reload_command.into(),
            timeout,
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = OsString::from(self.config_path.as_os_str());
        name.push(suffix);
        PathBuf::from(name)
    }

    async fn reload(&self) -> AgentResult<()> {
        let cmd = build_reload_cmd(&self.reload_command, &self.config_path);
        shell::exec_or_throw(&cmd, self.timeout)
            .await
            .map(|_| ())
            .map_err(|e| AgentError::daemon(e.to_string()))
    }

    /// Put the previous configuration back after a failed reload
    async fn rollback(&self, backup: &Path, had_previous: bool) {
        let restored = if had_previous {
            tokio::fs::rename(backup, &self.config_path).await
        } else {
            tokio::fs::remove_file(&self.config_path).await
        };
        if let Err(e) = restored {
            warn!(path = %self.config_path.display(), error = %e, "Failed to restore previous configuration");
        }
    }
}

#[async_trait]
impl DaemonOps for FrrDaemon {
    #[instrument(skip(self, config), fields(path = %self.config_path.display(), bytes = config.len()))]
    async fn apply_config(&self, config: &str) -> AgentResult<()> {
        let tmp = self.sibling(".tmp");
        let backup = self.sibling(".bak");
        let io_err = |what: &str, e: std::io::Error| AgentError::daemon(format!("{}: {}", what, e));

        if let Some(parent) = self.config_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| io_err("create config directory", e))?;
            }
        }
        tokio::fs::write(&tmp, config)
            .await
            .map_err(|e| io_err("write temporary config", e))?;

        let had_previous = match tokio::fs::try_exists(&self.config_path).await {
            Ok(exists) => exists,
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(io_err("stat current config", e));
            }
        };
        if had_previous {
            tokio::fs::copy(&self.config_path, &backup)
                .await
                .map_err(|e| io_err("back up current config", e))?;
        }
        tokio::fs::rename(&tmp, &self.config_path)
            .await
            .map_err(|e| io_err("install config", e))?;

        match self.reload().await {
            Ok(()) => {
                if had_previous {
                    if let Err(e) = tokio::fs::remove_file(&backup).await {
                        warn!(path = %backup.display(), error = %e, "Failed to remove configuration backup");
                    }
                }
                info!("Routing daemon reloaded");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Reload failed, restoring previous configuration");
                self.rollback(&backup, had_previous).await;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    const T: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_ensure_vrf_creates_missing_device() {
        let kernel = IpKernel::new(T).with_mock_mode();
        kernel.ensure_vrf("alpha-17", 10017).await.unwrap();

        let cmds = kernel.captured_commands();
        assert_eq!(cmds.len(), 3);
        assert!(cmds[0].contains("link show \"alpha-17\""));
        assert!(cmds[1].contains("link add \"alpha-17\" type vrf table 10017"));
        assert!(cmds[2].contains("link set \"alpha-17\" up"));
    }

    #[tokio::test]
    async fn test_blackhole_commands() {
        let kernel = IpKernel::new(T).with_mock_mode();
        kernel.add_blackhole("alpha-17", &net("10.1.0.0/24")).await.unwrap();
        kernel.del_blackhole("alpha-17", &net("10.1.0.0/24")).await.unwrap();
        kernel.remove_vrf("alpha-17").await.unwrap();

        let cmds = kernel.captured_commands();
        assert!(cmds[0].contains("route replace blackhole \"10.1.0.0/24\" vrf \"alpha-17\""));
        assert!(cmds[1].contains("route del blackhole \"10.1.0.0/24\" vrf \"alpha-17\""));
        assert!(cmds[2].contains("link del \"alpha-17\""));
    }

    #[tokio::test]
    async fn test_disabled_kernel_skips_everything() {
        let kernel = IpKernel::disabled(T).with_mock_mode();
        assert!(!kernel.is_enabled());
        kernel.ensure_vrf("alpha-17", 10017).await.unwrap();
        kernel.add_blackhole("alpha-17", &net("10.1.0.0/24")).await.unwrap();
        assert!(kernel.list_routes("alpha-17").await.unwrap().is_empty());
        assert!(kernel.captured_commands().is_empty());
    }

    #[tokio::test]
    async fn test_list_routes_skips_ipv6_unless_enabled() {
        let v4 = r#"[{"type":"blackhole","dst":"10.1.0.0/24"}]"#;
        let kernel = IpKernel::new(T)
            .with_mock_mode()
            .with_mock_response("-j route show", 0, v4);

        let routes = kernel.list_routes("alpha-17").await.unwrap();
        assert_eq!(routes.len(), 1);
        assert!(kernel.captured_commands().iter().all(|c| !c.contains(" -6 ")));
    }

    #[tokio::test]
    async fn test_list_routes_keeps_ipv4_when_ipv6_fails() {
        let v4 = r#"[{"type":"blackhole","dst":"10.1.0.0/24"},{"dst":"10.9.0.0/24","gateway":"192.0.2.1"}]"#;
        let kernel = IpKernel::new(T)
            .with_ipv6(true)
            .with_mock_mode()
            .with_mock_response("-j -6 route show", 2, "")
            .with_mock_response("-j route show", 0, v4);

        let routes = kernel.list_routes("alpha-17").await.unwrap();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].prefix, net("10.1.0.0/24"));

        let cmds = kernel.captured_commands();
        assert_eq!(cmds.len(), 2);
        assert!(cmds[1].contains(" -6 route show"));
    }

    #[tokio::test]
    async fn test_list_routes_ipv4_failure_is_an_error() {
        let kernel = IpKernel::new(T)
            .with_ipv6(true)
            .with_mock_mode()
            .with_mock_response("-j route show", 2, "");
        assert!(kernel.list_routes("alpha-17").await.is_err());
    }

    #[test]
    fn test_is_absent() {
        let missing = ExecResult {
            exit_code: 2,
            stdout: String::new(),
            stderr: "RTNETLINK answers: No such process".to_string(),
        };
        assert!(is_absent(&missing));

        let denied = ExecResult {
            exit_code: 2,
            stdout: String::new(),
            stderr: "RTNETLINK answers: Operation not permitted".to_string(),
        };
        assert!(!is_absent(&denied));
    }

    #[test]
    fn test_parse_vrf_table() {
        let json = r#"[{"ifname":"alpha-17","linkinfo":{"info_kind":"vrf","info_data":{"table":10017}}}]"#;
        assert_eq!(parse_vrf_table(json), Some(10017));
        assert_eq!(parse_vrf_table("[]"), None);
    }

    #[test]
    fn test_parse_routes() {
        let json = r#"[
            {"type":"blackhole","dst":"10.1.0.0/24","flags":[]},
            {"dst":"10.9.0.0/24","gateway":"192.0.2.1","dev":"eth0","protocol":"bgp","metric":20,"flags":[]},
            {"type":"local","dst":"10.1.0.1","dev":"alpha-17","protocol":"kernel","flags":[]},
            {"type":"unreachable","dst":"default","flags":[]}
        ]"#;
        let routes = parse_routes(json, false).unwrap();
        assert_eq!(routes.len(), 4);

        assert_eq!(routes[0].route_type, RouteType::Blackhole);
        assert_eq!(routes[0].prefix, net("10.1.0.0/24"));

        assert_eq!(routes[1].route_type, RouteType::Unicast);
        assert_eq!(routes[1].next_hop, Some("192.0.2.1".parse().unwrap()));
        assert_eq!(routes[1].protocol.as_deref(), Some("bgp"));

        assert_eq!(routes[2].prefix, net("10.1.0.1/32"));
        assert_eq!(routes[3].prefix, net("0.0.0.0/0"));

        assert_eq!(parse_routes("", true).unwrap(), Vec::new());
        assert!(parse_routes("{broken", false).is_err());
        assert_eq!(parse_routes(r#"[{"dst":"default"}]"#, true).unwrap()[0].prefix, net("::/0"));
    }

    #[tokio::test]
    async fn test_frr_apply_success() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vpnv4.conf");
        std::fs::write(&path, "old\n").unwrap();

        let daemon = FrrDaemon::new(&path, "grep -q 'router bgp' {path}", T);
        daemon.apply_config("router bgp 65000\n").await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "router bgp 65000\n");
        assert!(!dir.path().join("vpnv4.conf.bak").exists());
        assert!(!dir.path().join("vpnv4.conf.tmp").exists());
    }

    #[tokio::test]
    async fn test_frr_reload_failure_restores_previous() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vpnv4.conf");
        std::fs::write(&path, "old\n").unwrap();

        let daemon = FrrDaemon::new(&path, "false {path}", T);
        let err = daemon.apply_config("new\n").await.unwrap_err();

        assert!(matches!(err, AgentError::Daemon { .. }));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "old\n");
        assert!(!dir.path().join("vpnv4.conf.bak").exists());
    }

    #[tokio::test]
    async fn test_frr_stat_failure_is_not_a_first_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vpnv4.conf");
        // Self-referencing link: stat fails with something other than NotFound
        std::os::unix::fs::symlink(&path, &path).unwrap();

        let daemon = FrrDaemon::new(&path, "true", T);
        let err = daemon.apply_config("new\n").await.unwrap_err();

        assert!(matches!(err, AgentError::Daemon { .. }));
        assert!(std::fs::symlink_metadata(&path).unwrap().file_type().is_symlink());
        assert!(!dir.path().join("vpnv4.conf.tmp").exists());
    }

    #[tokio::test]
    async fn test_frr_repeated_success_leaves_no_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vpnv4.conf");

        let daemon = FrrDaemon::new(&path, "grep -q 'router bgp' {path}", T);
        daemon.apply_config("router bgp 65000\n").await.unwrap();
        daemon.apply_config("router bgp 65000\n!\n").await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "router bgp 65000\n!\n");
        assert!(!dir.path().join("vpnv4.conf.bak").exists());
    }

    #[tokio::test]
    async fn test_frr_missing_backup_after_reload_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vpnv4.conf");
        std::fs::write(&path, "old\n").unwrap();

        // The reload itself consumes the backup, so the cleanup finds nothing
        let daemon = FrrDaemon::new(&path, "rm {path}.bak", T);
        daemon.apply_config("new\n").await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new\n");
        assert!(!dir.path().join("vpnv4.conf.bak").exists());
    }

    #[tokio::test]
    async fn test_frr_first_write_failure_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frr").join("vpnv4.conf");

        let daemon = FrrDaemon::new(&path, "exit 3", T);
        assert!(daemon.apply_config("new\n").await.is_err());
        assert!(!path.exists());
        assert_eq!(daemon.config_path(), path.as_path());
    }
}
