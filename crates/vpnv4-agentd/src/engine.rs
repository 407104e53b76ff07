//! Reconciliation engine
//!
//! The engine is the single writer of tenant state. Each cycle drains the
//! queued source batches, updates the store, renders, and drives the
//! appliers so that kernel objects exist before the daemon advertises them
//! and the daemon withdraws prefixes before their kernel objects go away.
//!
//! ```text
//! Idle -> EventsDrained -> StateUpdated -> Rendered -> Diffed -> Applied -> Idle
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ipnet::IpNet;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vpnv4_common::AgentResult;

use crate::allocator::AllocationTable;
use crate::applier::{DaemonOps, KernelOps};
use crate::config::AgentConfig;
use crate::render::{self, RenderSettings};
use crate::store::{Snapshot, TenantStore};
use crate::types::{KernelVrf, SourceBatch};

/// Phase of a reconciliation cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    EventsDrained,
    StateUpdated,
    Rendered,
    Diffed,
    Applied,
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CycleState::Idle => "idle",
            CycleState::EventsDrained => "events-drained",
            CycleState::StateUpdated => "state-updated",
            CycleState::Rendered => "rendered",
            CycleState::Diffed => "diffed",
            CycleState::Applied => "applied",
        };
        write!(f, "{}", name)
    }
}

/// Kernel state installed for one VRF
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedVrf {
    pub tenant: String,
    pub object: KernelVrf,
    /// Prefixes the tenant owned when this VRF was last reconciled
    pub prefixes: BTreeSet<IpNet>,
}

impl AppliedVrf {
    /// The agent itself originates `prefix` in this VRF
    pub fn is_self_originated(&self, prefix: &IpNet) -> bool {
        self.object.blackholes.contains(prefix) || self.prefixes.contains(prefix)
    }
}

/// What the daemon and kernel currently hold
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedView {
    /// Last configuration accepted by the daemon
    pub config: Option<String>,
    /// Installed kernel objects keyed by VRF name
    pub vrfs: BTreeMap<String, AppliedVrf>,
}

/// Engine timing and rendering settings
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub render: RenderSettings,
    pub resync_interval: Duration,
    pub retry_interval: Duration,
}

impl From<&AgentConfig> for EngineSettings {
    fn from(config: &AgentConfig) -> Self {
        Self {
            render: RenderSettings::from(&config.driver),
            resync_interval: config.driver.resync_interval(),
            retry_interval: config.driver.retry_interval(),
        }
    }
}

/// Summary of one cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub events: usize,
    pub store_changed: bool,
    /// Nothing to do; no render, no appliers
    pub skipped: bool,
    pub kernel_ops: usize,
    pub config_pushed: bool,
    /// Work is left for the retry timer
    pub pending: bool,
}

/// Reconciliation engine
pub struct Engine {
    store: TenantStore,
    table: AllocationTable,
    settings: EngineSettings,
    kernel: Arc<dyn KernelOps>,
    daemon: Arc<dyn DaemonOps>,
    applied: AppliedView,
    degraded: BTreeSet<String>,
    pending: bool,
    state: CycleState,
    view_tx: watch::Sender<Arc<AppliedView>>,
}

impl Engine {
    pub fn new(
        store: TenantStore,
        settings: EngineSettings,
        kernel: Arc<dyn KernelOps>,
        daemon: Arc<dyn DaemonOps>,
    ) -> Self {
        let (view_tx, _) = watch::channel(Arc::new(AppliedView::default()));
        Self {
            store,
            table: AllocationTable::new(),
            settings,
            kernel,
            daemon,
            applied: AppliedView::default(),
            degraded: BTreeSet::new(),
            pending: false,
            state: CycleState::Idle,
            view_tx,
        }
    }

    /// Receiver of the applied view published after every cycle
    pub fn subscribe(&self) -> watch::Receiver<Arc<AppliedView>> {
        self.view_tx.subscribe()
    }

    pub fn store(&self) -> &TenantStore {
        &self.store
    }

    pub fn applied(&self) -> &AppliedView {
        &self.applied
    }

    pub fn degraded(&self) -> &BTreeSet<String> {
        &self.degraded
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    fn transition(&mut self, next: CycleState) {
        debug!(from = %self.state, to = %next, "Cycle state");
        self.state = next;
    }

    /// Process batches until cancelled or the queue closes.
    ///
    /// Returns an error only for fatal conditions.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<SourceBatch>,
        cancel: CancellationToken,
    ) -> AgentResult<()> {
        let resync_period = self.settings.resync_interval;
        let retry_period = self.settings.retry_interval;
        let mut resync = time::interval_at(Instant::now() + resync_period, resync_period);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut retry = time::interval_at(Instant::now() + retry_period, retry_period);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            resync_secs = resync_period.as_secs(),
            retry_secs = retry_period.as_secs(),
            "Reconciliation engine started"
        );

        loop {
            let (batches, force) = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                batch = rx.recv() => match batch {
                    Some(batch) => {
                        let mut batches = vec![batch];
                        while let Ok(more) = rx.try_recv() {
                            batches.push(more);
                        }
                        (batches, false)
                    }
                    None => {
                        info!("Source queue closed");
                        break;
                    }
                },
                _ = resync.tick() => {
                    debug!("Periodic full resync");
                    (Vec::new(), true)
                }
                _ = retry.tick(), if self.pending => {
                    debug!("Retrying pending work");
                    (Vec::new(), false)
                }
            };

            let was_pending = self.pending;
            if let Err(e) = self.run_cycle(batches, force).await {
                error!(error = %e, "Fatal reconciliation error");
                return Err(e);
            }
            if self.pending && !was_pending {
                retry.reset();
            }
        }

        info!("Reconciliation engine stopped");
        Ok(())
    }

    /// Run one reconciliation cycle.
    ///
    /// `force` re-ensures every kernel object and re-pushes the configuration.
    pub async fn run_cycle(&mut self, batches: Vec<SourceBatch>, force: bool) -> AgentResult<CycleReport> {
        let mut report = CycleReport::default();
        self.transition(CycleState::EventsDrained);

        for batch in &batches {
            debug!(source = %batch.source, count = batch.events.len(), "Applying source batch");
            for event in &batch.events {
                report.events += 1;
                match self.store.apply_event(event, &mut self.table) {
                    Ok(changed) => report.store_changed |= changed,
                    Err(e) if e.is_fatal() => {
                        self.transition(CycleState::Idle);
                        return Err(e);
                    }
                    Err(e) => {
                        warn!(tenant = event.tenant(), error = %e, "Skipping event");
                    }
                }
            }
        }
        self.transition(CycleState::StateUpdated);

        if !report.store_changed && !self.pending && !force {
            report.skipped = true;
            self.transition(CycleState::Idle);
            return Ok(report);
        }

        let snapshot = self.store.snapshot(&BTreeSet::new());
        let desired = render::render_kernel(&snapshot, self.settings.render.export_ipv6);
        self.transition(CycleState::Rendered);

        let removed: Vec<String> = self
            .applied
            .vrfs
            .keys()
            .filter(|name| !desired.contains_key(*name))
            .cloned()
            .collect();
        self.transition(CycleState::Diffed);

        let degraded = self.ensure_kernel(&snapshot, &desired, force, &mut report).await;
        for vrf in &degraded {
            warn!(vrf = %vrf, "VRF degraded, its prefixes are not advertised");
        }

        let rendered = render::render(&snapshot.with_degraded(&degraded), &self.settings.render);
        let daemon_ok = if force || self.applied.config.as_deref() != Some(rendered.config.as_str()) {
            match self.daemon.apply_config(&rendered.config).await {
                Ok(()) => {
                    self.applied.config = Some(rendered.config);
                    report.config_pushed = true;
                    true
                }
                Err(e) => {
                    warn!(error = %e, "Routing daemon rejected configuration, keeping previous state");
                    false
                }
            }
        } else {
            true
        };

        let removal_failed = if daemon_ok {
            self.remove_stale(&desired, &removed, &mut report).await
        } else {
            debug!("Skipping kernel removals until the daemon accepts the configuration");
            false
        };
        self.transition(CycleState::Applied);

        self.pending = !daemon_ok || !degraded.is_empty() || removal_failed;
        self.degraded = degraded;
        report.pending = self.pending;
        self.view_tx.send_replace(Arc::new(self.applied.clone()));

        info!(
            events = report.events,
            tenants = self.store.len(),
            kernel_ops = report.kernel_ops,
            config_pushed = report.config_pushed,
            degraded = self.degraded.len(),
            pending = self.pending,
            forced = force,
            "Reconciliation cycle complete"
        );
        self.transition(CycleState::Idle);
        Ok(report)
    }

    /// Create missing VRFs and blackholes, returning the VRFs that failed
    async fn ensure_kernel(
        &mut self,
        snapshot: &Snapshot,
        desired: &BTreeMap<String, KernelVrf>,
        force: bool,
        report: &mut CycleReport,
    ) -> BTreeSet<String> {
        let mut degraded = BTreeSet::new();

        for (name, want) in desired {
            let Some(vrf) = snapshot.vrfs.get(name) else {
                continue;
            };

            let recheck = self.degraded.contains(name);
            if force || recheck || !self.applied.vrfs.contains_key(name) {
                report.kernel_ops += 1;
                if let Err(e) = self.kernel.ensure_vrf(name, want.table_id).await {
                    warn!(vrf = %name, error = %e, "Failed to create VRF");
                    degraded.insert(name.clone());
                    continue;
                }
            }

            let entry = self
                .applied
                .vrfs
                .entry(name.clone())
                .or_insert_with(|| AppliedVrf {
                    tenant: vrf.tenant.clone(),
                    object: KernelVrf::new(name.clone(), want.table_id),
                    prefixes: BTreeSet::new(),
                });
            entry.prefixes = vrf.prefixes.clone();

            for prefix in &want.blackholes {
                if !force && entry.object.blackholes.contains(prefix) {
                    continue;
                }
                report.kernel_ops += 1;
                match self.kernel.add_blackhole(name, prefix).await {
                    Ok(()) => {
                        entry.object.blackholes.insert(*prefix);
                    }
                    Err(e) => {
                        warn!(vrf = %name, prefix = %prefix, error = %e, "Failed to install blackhole route");
                        degraded.insert(name.clone());
                    }
                }
            }
        }

        degraded
    }

    /// Remove stale blackholes, then VRFs that are no longer desired.
    ///
    /// Returns true when something could not be removed.
    async fn remove_stale(
        &mut self,
        desired: &BTreeMap<String, KernelVrf>,
        removed: &[String],
        report: &mut CycleReport,
    ) -> bool {
        let mut failed = false;
        let mut blocked = BTreeSet::new();

        for (name, applied) in self.applied.vrfs.iter_mut() {
            let stale: Vec<IpNet> = match desired.get(name) {
                Some(want) => applied
                    .object
                    .blackholes
                    .difference(&want.blackholes)
                    .copied()
                    .collect(),
                None => applied.object.blackholes.iter().copied().collect(),
            };
            for prefix in stale {
                report.kernel_ops += 1;
                match self.kernel.del_blackhole(name, &prefix).await {
                    Ok(()) => {
                        applied.object.blackholes.remove(&prefix);
                    }
                    Err(e) => {
                        warn!(vrf = %name, prefix = %prefix, error = %e, "Failed to remove blackhole route");
                        blocked.insert(name.clone());
                        failed = true;
                    }
                }
            }
        }

        for name in removed {
            if blocked.contains(name) {
                continue;
            }
            report.kernel_ops += 1;
            match self.kernel.remove_vrf(name).await {
                Ok(()) => {
                    self.applied.vrfs.remove(name);
                }
                Err(e) => {
                    warn!(vrf = %name, error = %e, "Failed to remove VRF");
                    failed = true;
                }
            }
        }

        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::AllocatorSettings;
    use crate::types::ChangeEvent;
    use async_trait::async_trait;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;
    use vpnv4_common::AgentError;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        fail_vrf: Mutex<Option<String>>,
        fail_daemon: Mutex<bool>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn push(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl KernelOps for Recorder {
        async fn ensure_vrf(&self, vrf: &str, table_id: u32) -> AgentResult<()> {
            self.push(format!("ensure_vrf {} {}", vrf, table_id));
            if self.fail_vrf.lock().unwrap().as_deref() == Some(vrf) {
                return Err(AgentError::kernel(vrf, "operation not permitted"));
            }
            Ok(())
        }

        async fn remove_vrf(&self, vrf: &str) -> AgentResult<()> {
            self.push(format!("remove_vrf {}", vrf));
            Ok(())
        }

        async fn add_blackhole(&self, vrf: &str, prefix: &IpNet) -> AgentResult<()> {
            self.push(format!("add_blackhole {} {}", vrf, prefix));
            Ok(())
        }

        async fn del_blackhole(&self, vrf: &str, prefix: &IpNet) -> AgentResult<()> {
            self.push(format!("del_blackhole {} {}", vrf, prefix));
            Ok(())
        }

        async fn list_routes(&self, _vrf: &str) -> AgentResult<Vec<crate::types::KernelRoute>> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl DaemonOps for Recorder {
        async fn apply_config(&self, config: &str) -> AgentResult<()> {
            self.push(format!("apply_config {}", config.len()));
            if *self.fail_daemon.lock().unwrap() {
                return Err(AgentError::daemon("reload exited 1"));
            }
            Ok(())
        }
    }

    fn engine(maintain_empty_vrf: bool) -> (Engine, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let settings = EngineSettings {
            render: RenderSettings {
                local_asn: 65000,
                router_id: Ipv4Addr::new(10, 255, 0, 2),
                neighbours: Vec::new(),
                include_globals: false,
                export_ipv6: false,
            },
            resync_interval: Duration::from_secs(300),
            retry_interval: Duration::from_secs(5),
        };
        let store = TenantStore::new(AllocatorSettings::new(65000, 65000), maintain_empty_vrf);
        let engine = Engine::new(store, settings, recorder.clone(), recorder.clone());
        (engine, recorder)
    }

    fn batch(events: Vec<ChangeEvent>) -> Vec<SourceBatch> {
        vec![SourceBatch {
            source: "test".to_string(),
            events,
        }]
    }

    fn upsert(tenant: &str, prefixes: &[&str]) -> ChangeEvent {
        ChangeEvent::upsert(tenant, prefixes.iter().map(|p| p.parse::<IpNet>().unwrap()))
    }

    #[tokio::test]
    async fn test_empty_cycle_is_skipped() {
        let (mut engine, recorder) = engine(false);
        let report = engine.run_cycle(Vec::new(), false).await.unwrap();
        assert!(report.skipped);
        assert!(recorder.calls().is_empty());
        assert_eq!(engine.state(), CycleState::Idle);
    }

    #[tokio::test]
    async fn test_create_then_advertise() {
        let (mut engine, recorder) = engine(false);
        let report = engine
            .run_cycle(batch(vec![upsert("alpha", &["10.1.0.0/24"])]), false)
            .await
            .unwrap();

        assert!(report.config_pushed);
        let calls = recorder.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[0].starts_with("ensure_vrf alpha-"));
        assert!(calls[1].starts_with("add_blackhole alpha-"));
        assert!(calls[2].starts_with("apply_config"));

        let vrf = engine.store().get("alpha").unwrap().allocation.vrf_name.clone();
        assert!(engine.applied().config.as_deref().unwrap().contains("network 10.1.0.0/24"));
        assert!(engine.applied().vrfs.contains_key(&vrf));
    }

    #[tokio::test]
    async fn test_identical_upsert_does_nothing() {
        let (mut engine, recorder) = engine(false);
        engine
            .run_cycle(batch(vec![upsert("alpha", &["10.1.0.0/24"])]), false)
            .await
            .unwrap();
        let before = recorder.calls().len();

        let report = engine
            .run_cycle(batch(vec![upsert("alpha", &["10.1.0.0/24"])]), false)
            .await
            .unwrap();
        assert!(report.skipped);
        assert_eq!(recorder.calls().len(), before);
    }

    #[tokio::test]
    async fn test_withdraw_then_teardown() {
        let (mut engine, recorder) = engine(false);
        engine
            .run_cycle(batch(vec![upsert("alpha", &["10.1.0.0/24"])]), false)
            .await
            .unwrap();
        let before = recorder.calls().len();

        engine
            .run_cycle(batch(vec![ChangeEvent::delete("alpha")]), false)
            .await
            .unwrap();
        let calls = recorder.calls()[before..].to_vec();
        assert_eq!(calls.len(), 3);
        assert!(calls[0].starts_with("apply_config"));
        assert!(calls[1].starts_with("del_blackhole alpha-"));
        assert!(calls[2].starts_with("remove_vrf alpha-"));
        assert!(engine.applied().vrfs.is_empty());
        assert!(!engine.applied().config.as_deref().unwrap().contains("alpha"));
    }

    #[tokio::test]
    async fn test_degraded_vrf_is_not_advertised() {
        let (mut engine, recorder) = engine(false);
        engine
            .run_cycle(
                batch(vec![
                    upsert("alpha", &["10.1.0.0/24"]),
                    upsert("beta", &["10.2.0.0/24"]),
                ]),
                false,
            )
            .await
            .unwrap();
        let alpha = engine.store().get("alpha").unwrap().allocation.vrf_name.clone();
        let beta = engine.store().get("beta").unwrap().allocation.vrf_name.clone();

        *recorder.fail_vrf.lock().unwrap() = Some(alpha.clone());
        let report = engine
            .run_cycle(batch(vec![upsert("alpha", &["10.1.0.0/24", "10.1.1.0/24"])]), true)
            .await
            .unwrap();

        assert!(report.pending);
        assert!(engine.degraded().contains(&alpha));
        let config = engine.applied().config.clone().unwrap();
        assert!(!config.contains("network 10.1.0.0/24"));
        assert!(config.contains("network 10.2.0.0/24"));
        assert!(engine.applied().vrfs.contains_key(&beta));

        // Recovery on the retry cycle
        *recorder.fail_vrf.lock().unwrap() = None;
        let report = engine.run_cycle(Vec::new(), false).await.unwrap();
        assert!(!report.pending);
        assert!(engine.degraded().is_empty());
        assert!(engine.applied().config.as_deref().unwrap().contains("network 10.1.1.0/24"));
    }

    #[tokio::test]
    async fn test_daemon_failure_blocks_removal() {
        let (mut engine, recorder) = engine(false);
        engine
            .run_cycle(batch(vec![upsert("alpha", &["10.1.0.0/24"])]), false)
            .await
            .unwrap();
        let accepted = engine.applied().config.clone();

        *recorder.fail_daemon.lock().unwrap() = true;
        let report = engine
            .run_cycle(batch(vec![ChangeEvent::delete("alpha")]), false)
            .await
            .unwrap();
        assert!(report.pending);
        assert_eq!(engine.applied().config, accepted);
        assert_eq!(engine.applied().vrfs.len(), 1);
        assert!(!recorder.calls().iter().any(|c| c.starts_with("remove_vrf")));

        *recorder.fail_daemon.lock().unwrap() = false;
        let report = engine.run_cycle(Vec::new(), false).await.unwrap();
        assert!(!report.pending);
        assert!(engine.applied().vrfs.is_empty());
        assert!(recorder.calls().last().unwrap().starts_with("remove_vrf"));
    }

    #[tokio::test]
    async fn test_forced_cycle_reensures_everything() {
        let (mut engine, recorder) = engine(false);
        engine
            .run_cycle(batch(vec![upsert("alpha", &["10.1.0.0/24"])]), false)
            .await
            .unwrap();
        let before = recorder.calls().len();

        let report = engine.run_cycle(Vec::new(), true).await.unwrap();
        assert!(!report.skipped);
        assert!(report.config_pushed);
        assert_eq!(report.kernel_ops, 2);
        assert_eq!(recorder.calls().len(), before + 3);
    }

    #[tokio::test]
    async fn test_exhaustion_is_fatal_and_applies_nothing() {
        let recorder = Arc::new(Recorder::default());
        let mut allocator = AllocatorSettings::new(65000, 65000);
        allocator.max_id = 1;
        let store = TenantStore::new(allocator, false);
        let settings = EngineSettings {
            render: RenderSettings {
                local_asn: 65000,
                router_id: Ipv4Addr::new(10, 0, 0, 1),
                neighbours: Vec::new(),
                include_globals: false,
                export_ipv6: false,
            },
            resync_interval: Duration::from_secs(300),
            retry_interval: Duration::from_secs(5),
        };
        let mut engine = Engine::new(store, settings, recorder.clone(), recorder.clone());

        let err = engine
            .run_cycle(
                batch(vec![upsert("alpha", &["10.1.0.0/24"]), upsert("beta", &["10.2.0.0/24"])]),
                false,
            )
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(recorder.calls().is_empty());
    }

    #[tokio::test]
    async fn test_view_is_published() {
        let (mut engine, _recorder) = engine(true);
        let mut rx = engine.subscribe();
        engine
            .run_cycle(batch(vec![upsert("alpha", &["10.1.0.0/24"])]), false)
            .await
            .unwrap();

        assert!(rx.has_changed().unwrap());
        let view = rx.borrow_and_update().clone();
        let vrf = view.vrfs.values().next().unwrap();
        assert_eq!(vrf.tenant, "alpha");
        assert!(vrf.is_self_originated(&"10.1.0.0/24".parse().unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let (engine, recorder) = engine(false);
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(engine.run(rx, cancel.clone()));

        tx.send(SourceBatch {
            source: "test".to_string(),
            events: vec![upsert("alpha", &["10.1.0.0/24"])],
        })
        .await
        .unwrap();

        // Let the engine drain the batch
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(recorder.calls().len(), 3);
    }
}
