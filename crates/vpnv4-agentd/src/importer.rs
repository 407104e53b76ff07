//! Route importer
//!
//! Periodically reads each applied VRF's kernel table and reports routes
//! learned from the fabric to the network controller. Prefixes the agent
//! originates itself are never reported, which keeps them from being
//! re-advertised back into the fabric.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::IpNet;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vpnv4_common::{AgentError, AgentResult};

use crate::applier::KernelOps;
use crate::engine::AppliedView;
use crate::types::{LearnedRoute, RouteSource, RouteType};

/// Kernel route protocol for connected routes
const PROTO_KERNEL: &str = "kernel";

/// Consumer of learned routes
#[async_trait]
pub trait NetworkController: Send + Sync {
    async fn upsert_route(&self, route: &LearnedRoute) -> AgentResult<()>;
    async fn withdraw_route(&self, route: &LearnedRoute) -> AgentResult<()>;
}

/// Controller that only logs
#[derive(Debug, Default)]
pub struct LoggingController;

#[async_trait]
impl NetworkController for LoggingController {
    async fn upsert_route(&self, route: &LearnedRoute) -> AgentResult<()> {
        info!(
            tenant = %route.tenant,
            vrf = %route.vrf,
            prefix = %route.prefix,
            next_hop = ?route.next_hop,
            "Learned route"
        );
        Ok(())
    }

    async fn withdraw_route(&self, route: &LearnedRoute) -> AgentResult<()> {
        info!(tenant = %route.tenant, vrf = %route.vrf, prefix = %route.prefix, "Withdrew route");
        Ok(())
    }
}

#[derive(Serialize)]
struct RouteExport<'a> {
    routes: Vec<&'a LearnedRoute>,
}

/// Controller maintaining the learned-route table as a JSON file
#[derive(Debug)]
pub struct JsonFileController {
    path: PathBuf,
    routes: Mutex<BTreeMap<(String, IpNet), LearnedRoute>>,
}

impl JsonFileController {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            routes: Mutex::new(BTreeMap::new()),
        }
    }

    async fn persist(&self, routes: &BTreeMap<(String, IpNet), LearnedRoute>) -> AgentResult<()> {
        let export = RouteExport {
            routes: routes.values().collect(),
        };
        let body = serde_json::to_vec_pretty(&export)
            .map_err(|e| AgentError::internal(format!("serialize routes: {}", e)))?;

        let mut tmp = OsString::from(self.path.as_os_str());
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn update(&self, route: &LearnedRoute, present: bool) -> AgentResult<()> {
        let mut routes = self.routes.lock().await;
        let key = (route.vrf.clone(), route.prefix);
        let previous = if present {
            routes.insert(key.clone(), route.clone())
        } else {
            routes.remove(&key)
        };

        if let Err(e) = self.persist(&routes).await {
            match previous {
                Some(old) => routes.insert(key, old),
                None => routes.remove(&key),
            };
            return Err(AgentError::importer(&route.vrf, e.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl NetworkController for JsonFileController {
    async fn upsert_route(&self, route: &LearnedRoute) -> AgentResult<()> {
        self.update(route, true).await
    }

    async fn withdraw_route(&self, route: &LearnedRoute) -> AgentResult<()> {
        self.update(route, false).await
    }
}

/// Outcome of one importer pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub upserts: usize,
    pub withdrawals: usize,
    pub skipped_vrfs: BTreeSet<String>,
}

/// Mirrors externally learned kernel routes into the controller
pub struct RouteImporter {
    kernel: Arc<dyn KernelOps>,
    controller: Arc<dyn NetworkController>,
    reported: BTreeMap<(String, IpNet), LearnedRoute>,
}

impl RouteImporter {
    pub fn new(kernel: Arc<dyn KernelOps>, controller: Arc<dyn NetworkController>) -> Self {
        Self {
            kernel,
            controller,
            reported: BTreeMap::new(),
        }
    }

    /// Routes successfully reported and not yet withdrawn
    pub fn reported(&self) -> impl Iterator<Item = &LearnedRoute> {
        self.reported.values()
    }

    /// Run one pass against the given applied view
    pub async fn tick(&mut self, view: &AppliedView) -> ImportReport {
        let mut report = ImportReport::default();
        let mut current: BTreeMap<(String, IpNet), LearnedRoute> = BTreeMap::new();

        for (name, vrf) in &view.vrfs {
            let routes = match self.kernel.list_routes(name).await {
                Ok(routes) => routes,
                Err(e) => {
                    warn!(vrf = %name, error = %e, "Cannot read VRF table, skipping this tick");
                    report.skipped_vrfs.insert(name.clone());
                    continue;
                }
            };

            for route in routes {
                if route.route_type != RouteType::Unicast
                    || route.protocol.as_deref() == Some(PROTO_KERNEL)
                    || vrf.is_self_originated(&route.prefix)
                {
                    continue;
                }
                current.insert(
                    (name.clone(), route.prefix),
                    LearnedRoute {
                        tenant: vrf.tenant.clone(),
                        vrf: name.clone(),
                        prefix: route.prefix,
                        next_hop: route.next_hop,
                        source: RouteSource::External,
                    },
                );
            }
        }

        for (key, route) in &current {
            if self.reported.get(key) == Some(route) {
                continue;
            }
            match self.controller.upsert_route(route).await {
                Ok(()) => {
                    self.reported.insert(key.clone(), route.clone());
                    report.upserts += 1;
                }
                Err(e) => warn!(vrf = %route.vrf, prefix = %route.prefix, error = %e, "Controller upsert failed"),
            }
        }

        let gone: Vec<(String, IpNet)> = self
            .reported
            .keys()
            .filter(|key| !current.contains_key(*key) && !report.skipped_vrfs.contains(&key.0))
            .cloned()
            .collect();
        for key in gone {
            let Some(route) = self.reported.get(&key).cloned() else {
                continue;
            };
            match self.controller.withdraw_route(&route).await {
                Ok(()) => {
                    self.reported.remove(&key);
                    report.withdrawals += 1;
                }
                Err(e) => warn!(vrf = %route.vrf, prefix = %route.prefix, error = %e, "Controller withdraw failed"),
            }
        }

        if report.upserts > 0 || report.withdrawals > 0 {
            info!(
                upserts = report.upserts,
                withdrawals = report.withdrawals,
                reported = self.reported.len(),
                "Route import pass changed the controller view"
            );
        }
        report
    }

    /// Tick on `interval` until cancelled
    pub async fn run(
        mut self,
        view_rx: watch::Receiver<Arc<AppliedView>>,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "Route importer started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let view = view_rx.borrow().clone();
                    debug!(vrfs = view.vrfs.len(), "Route import pass");
                    self.tick(&view).await;
                }
            }
        }

        info!("Route importer stopped");
    }
}
