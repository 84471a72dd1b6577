//! Fleet health monitor
//!
//! Every replica runs one [`FleetMonitor`]. Without a reachable coordination store
//! it checks every bot itself. With one, it holds a membership lease, watches its
//! siblings' leases and checks only the bots that [`shard::assign`] gives it. There
//! is no leader: every replica derives the same assignment from the same member list.
//!
//! Three loops feed one recompute point (`recompute`): the tick interval, lease
//! renewal (which also re-reads the member list) and the membership watch.

pub mod data_prep;
pub mod shard;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{CoordinationConfig, MonitorConfig};
use crate::coordination::{CoordinationStore, Lease};
use crate::error::CoordinationError;
use crate::models::{BotInstance, RuntimeHandle, StatusSnapshot};
use crate::observability::{metrics, Logger, MetricsCollector};
use crate::runtime::RuntimeRegistry;
use crate::store::BotStore;

pub use data_prep::DataPrepRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Starting,
    SingleInstance,
    DistributedMember,
    Stopping,
    Stopped,
}

/// Outcome counts of one check pass
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Bots inspected (any outcome)
    pub checked: usize,
    pub healthy: usize,
    /// Inspected fine but reported unhealthy
    pub unhealthy: usize,
    /// Inspect returned an error or the backend is not registered
    pub failed: usize,
    pub timed_out: usize,
    /// Owned bots without a runtime handle
    pub skipped: usize,
}

enum CheckOutcome {
    Healthy,
    Unhealthy,
    Failed,
    TimedOut,
    Cancelled,
}

impl TickReport {
    fn record(&mut self, outcome: CheckOutcome) {
        match outcome {
            CheckOutcome::Healthy => self.healthy += 1,
            CheckOutcome::Unhealthy => self.unhealthy += 1,
            CheckOutcome::Failed => self.failed += 1,
            CheckOutcome::TimedOut => self.timed_out += 1,
            CheckOutcome::Cancelled => return,
        }
        self.checked += 1;
    }
}

struct View {
    state: MonitorState,
    distributed: bool,
    /// Sorted live member ids; only meaningful when distributed
    members: Vec<String>,
}

struct Inner {
    instance_id: String,
    config: MonitorConfig,
    coordination: CoordinationConfig,
    store: Arc<dyn BotStore>,
    registry: Arc<RuntimeRegistry>,
    coordinator: Option<Arc<dyn CoordinationStore>>,
    metrics: MetricsCollector,
    view: RwLock<View>,
    lease: Mutex<Option<Lease>>,
    recompute: Notify,
    cancel: CancellationToken,
}

pub struct FleetMonitor {
    inner: Arc<Inner>,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    data_prep: DataPrepRunner,
}

impl FleetMonitor {
    pub fn new(
        instance_id: impl Into<String>,
        config: MonitorConfig,
        coordination: CoordinationConfig,
        store: Arc<dyn BotStore>,
        registry: Arc<RuntimeRegistry>,
        metrics: MetricsCollector,
    ) -> Self {
        let cancel = CancellationToken::new();
        let data_prep = DataPrepRunner::new(
            registry.clone(),
            metrics.clone(),
            config.data_prep_timeout(),
            cancel.child_token(),
        );
        Self {
            inner: Arc::new(Inner {
                instance_id: instance_id.into(),
                config,
                coordination,
                store,
                registry,
                coordinator: None,
                metrics,
                view: RwLock::new(View {
                    state: MonitorState::Starting,
                    distributed: false,
                    members: Vec::new(),
                }),
                lease: Mutex::new(None),
                recompute: Notify::new(),
                cancel,
            }),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            data_prep,
        }
    }

    /// Coordinate with sibling replicas through `coordinator`. Without one the
    /// monitor runs single-instance.
    pub fn with_coordinator(mut self, coordinator: Arc<dyn CoordinationStore>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.coordinator = Some(coordinator);
        }
        self
    }

    /// Connect (or fall back), then spawn the background loops. Calling it again
    /// is a no-op that returns the current state.
    pub async fn start(&self) -> MonitorState {
        if self.started.swap(true, Ordering::SeqCst) {
            return self.state();
        }

        let mut tasks = Vec::new();
        let state = match self.inner.clone().join_fleet().await {
            Ok(coordinator) => {
                tasks.push(tokio::spawn(renewal_loop(self.inner.clone(), coordinator.clone())));
                tasks.push(tokio::spawn(watch_loop(self.inner.clone(), coordinator)));
                MonitorState::DistributedMember
            }
            Err(reason) => {
                if let Some(reason) = reason {
                    // Permanent for the lifetime of the process
                    warn!(
                        instance_id = %self.inner.instance_id,
                        reason = %reason,
                        "coordination store unavailable; running as single instance"
                    );
                } else {
                    info!(instance_id = %self.inner.instance_id, "no coordination endpoints; running as single instance");
                }
                self.inner.set_view(|v| {
                    v.state = MonitorState::SingleInstance;
                    v.distributed = false;
                    v.members = vec![self.inner.instance_id.clone()];
                });
                MonitorState::SingleInstance
            }
        };

        tasks.push(tokio::spawn(tick_loop(self.inner.clone())));
        self.tasks.lock().await.extend(tasks);
        state
    }

    /// Halt the loops and give up the lease. Returns once in-flight work has
    /// finished or `grace` has passed, whichever is first.
    pub async fn stop(&self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        self.inner.set_view(|v| v.state = MonitorState::Stopping);
        self.inner.cancel.cancel();

        if let Some(coordinator) = &self.inner.coordinator {
            let lease = self.inner.lease.lock().await.take();
            if let Some(lease) = lease {
                match tokio::time::timeout_at(deadline, coordinator.revoke(&lease)).await {
                    Ok(Ok(())) => info!(instance_id = %lease.member_id, "membership lease revoked"),
                    Ok(Err(e)) => warn!(error = %e, "failed to revoke membership lease"),
                    Err(_) => warn!("timed out revoking membership lease"),
                }
            }
        }

        let handles = std::mem::take(&mut *self.tasks.lock().await);
        for handle in handles {
            let abort = handle.abort_handle();
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                warn!("monitor task still running after grace period; aborting");
                abort.abort();
            }
        }

        self.inner.set_view(|v| v.state = MonitorState::Stopped);
        info!(instance_id = %self.inner.instance_id, "fleet monitor stopped");
    }

    /// Run one check pass now, outside the regular interval
    pub async fn run_tick(&self) -> TickReport {
        self.inner.run_tick().await
    }

    pub fn is_distributed(&self) -> bool {
        self.inner.read_view(|v| v.distributed)
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Live replicas as currently seen; 1 when not distributed
    pub fn instance_count(&self) -> usize {
        self.inner
            .read_view(|v| if v.distributed { v.members.len() } else { 1 })
    }

    pub fn members(&self) -> Vec<String> {
        self.inner.read_view(|v| v.members.clone())
    }

    pub fn state(&self) -> MonitorState {
        self.inner.read_view(|v| v.state)
    }

    /// Whether this replica is responsible for `bot_id` under the current view
    pub fn owns(&self, bot_id: &uuid::Uuid) -> bool {
        self.inner.owns(bot_id)
    }

    pub fn data_prep(&self) -> &DataPrepRunner {
        &self.data_prep
    }
}

impl Inner {
    fn read_view<T>(&self, f: impl FnOnce(&View) -> T) -> T {
        let view = self.view.read().unwrap_or_else(|p| p.into_inner());
        f(&view)
    }

    fn set_view(&self, f: impl FnOnce(&mut View)) {
        let mut view = self.view.write().unwrap_or_else(|p| p.into_inner());
        f(&mut view)
    }

    fn owns(&self, bot_id: &uuid::Uuid) -> bool {
        self.read_view(|v| {
            !v.distributed || shard::owns(&v.members, &self.instance_id, bot_id)
        })
    }

    /// Connect, take a lease and read the member list.
    ///
    /// `Err(None)`: no coordination configured. `Err(Some(reason))`: configured
    /// but unusable.
    async fn join_fleet(self: Arc<Self>) -> Result<Arc<dyn CoordinationStore>, Option<String>> {
        let coordinator = self.coordinator.clone().ok_or(None)?;

        coordinator
            .connect(self.coordination.connect_timeout())
            .await
            .map_err(|e| Some(e.to_string()))?;

        let lease = coordinator
            .grant(&self.instance_id, self.coordination.lease_ttl())
            .await
            .map_err(|e| Some(e.to_string()))?;
        *self.lease.lock().await = Some(lease);

        let members = coordinator.members().await.map_err(|e| Some(e.to_string()))?;
        Logger::membership_event(&self.instance_id, "joined", &members);
        self.metrics.gauge(metrics::LIVE_MEMBERS, members.len() as f64).await;
        self.set_view(|v| {
            v.state = MonitorState::DistributedMember;
            v.distributed = true;
            v.members = members;
        });
        Ok(coordinator)
    }

    /// Re-read the live member list. Returns true when it changed.
    async fn refresh_members(&self) -> bool {
        let Some(coordinator) = &self.coordinator else {
            return false;
        };
        let members = match coordinator.members().await {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "failed to read member list; keeping previous view");
                return false;
            }
        };

        let changed = self.read_view(|v| v.members != members);
        if changed {
            Logger::membership_event(&self.instance_id, "changed", &members);
            if !members.contains(&self.instance_id) {
                warn!(instance_id = %self.instance_id, "own lease missing from member list; owning no bots");
            }
            self.metrics.increment(metrics::MEMBERSHIP_CHANGES, 1).await;
            self.metrics.gauge(metrics::LIVE_MEMBERS, members.len() as f64).await;
            self.set_view(|v| v.members = members);
        }
        changed
    }

    async fn run_tick(self: &Arc<Self>) -> TickReport {
        let started = Instant::now();
        let mut report = TickReport::default();

        if self.read_view(|v| v.distributed) {
            self.refresh_members().await;
        }

        let bots = match self.store.list_bots().await {
            Ok(bots) => bots,
            Err(e) => {
                error!(error = %e, "failed to list bots; skipping tick");
                return report;
            }
        };

        let owned: Vec<BotInstance> = bots.into_iter().filter(|b| self.owns(&b.id)).collect();
        self.metrics
            .gauge(metrics::MONITOR_OWNED_BOTS, owned.len() as f64)
            .await;

        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_checks.max(1)));
        let mut checks = JoinSet::new();

        for bot in owned {
            let Some(handle) = bot.runtime_handle.clone() else {
                report.skipped += 1;
                continue;
            };
            let inner = self.clone();
            let permits = permits.clone();
            checks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return CheckOutcome::Cancelled;
                };
                inner.check_bot(bot, handle).await
            });
        }

        while let Some(joined) = checks.join_next().await {
            match joined {
                Ok(outcome) => report.record(outcome),
                Err(e) => error!(error = %e, "health check task panicked"),
            }
        }

        let elapsed = started.elapsed();
        self.metrics.increment(metrics::MONITOR_TICKS, 1).await;
        self.metrics
            .histogram(metrics::MONITOR_TICK_DURATION_MS, elapsed.as_millis() as f64)
            .await;
        debug!(
            instance_id = %self.instance_id,
            checked = report.checked,
            healthy = report.healthy,
            failed = report.failed,
            timed_out = report.timed_out,
            skipped = report.skipped,
            elapsed_ms = elapsed.as_millis() as u64,
            "health check pass complete"
        );
        report
    }

    /// Inspect one bot and write its snapshot as soon as the answer is in
    async fn check_bot(&self, bot: BotInstance, handle: RuntimeHandle) -> CheckOutcome {
        let timeout = self.config.inspect_timeout();

        let (snapshot, outcome) = match self.registry.get(&bot.backend) {
            None => (
                StatusSnapshot::failure(
                    Some(&handle),
                    format!("backend '{}' is not registered", bot.backend),
                ),
                CheckOutcome::Failed,
            ),
            Some(runtime) => {
                let inspected = tokio::select! {
                    _ = self.cancel.cancelled() => return CheckOutcome::Cancelled,
                    r = tokio::time::timeout(timeout, runtime.inspect(&handle)) => r,
                };
                match inspected {
                    Ok(Ok(snapshot)) => {
                        let outcome = if snapshot.healthy {
                            CheckOutcome::Healthy
                        } else {
                            CheckOutcome::Unhealthy
                        };
                        (snapshot, outcome)
                    }
                    Ok(Err(e)) => {
                        debug!(bot_id = %bot.id, error = %e, "inspect failed");
                        (StatusSnapshot::failure(Some(&handle), e.to_string()), CheckOutcome::Failed)
                    }
                    Err(_) => {
                        warn!(bot_id = %bot.id, timeout = ?timeout, "inspect timed out");
                        (
                            StatusSnapshot::failure(
                                Some(&handle),
                                format!("inspect timed out after {}s", timeout.as_secs()),
                            ),
                            CheckOutcome::TimedOut,
                        )
                    }
                }
            }
        };

        if self.cancel.is_cancelled() {
            return CheckOutcome::Cancelled;
        }

        self.metrics.increment(metrics::BOT_CHECKS, 1).await;
        match outcome {
            CheckOutcome::Failed | CheckOutcome::Unhealthy => {
                self.metrics.increment(metrics::BOT_CHECK_FAILURES, 1).await
            }
            CheckOutcome::TimedOut => self.metrics.increment(metrics::BOT_CHECK_TIMEOUTS, 1).await,
            _ => {}
        }

        match self.store.put_snapshot(bot.id, &snapshot).await {
            Ok(true) => {}
            Ok(false) => debug!(bot_id = %bot.id, "newer snapshot already stored"),
            Err(e) => {
                warn!(bot_id = %bot.id, error = %e, "failed to write status snapshot");
                self.metrics.increment(metrics::SNAPSHOT_WRITE_ERRORS, 1).await;
            }
        }
        outcome
    }

    /// Re-register after the store dropped our lease
    async fn regrant(&self, coordinator: &Arc<dyn CoordinationStore>) {
        let mut lease = self.lease.lock().await;
        // stop() took the lease; leave it gone
        if self.cancel.is_cancelled() || lease.is_none() {
            return;
        }
        match coordinator
            .grant(&self.instance_id, self.coordination.lease_ttl())
            .await
        {
            Ok(new_lease) => {
                info!(instance_id = %self.instance_id, "membership lease re-granted");
                self.metrics.increment(metrics::LEASE_REGRANTS, 1).await;
                *lease = Some(new_lease);
            }
            Err(e) => warn!(instance_id = %self.instance_id, error = %e, "failed to re-grant lease"),
        }
    }
}

async fn tick_loop(inner: Arc<Inner>) {
    let mut interval = tokio::time::interval(inner.config.interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = interval.tick() => {}
            _ = inner.recompute.notified() => {
                debug!(instance_id = %inner.instance_id, "membership changed; checking now");
                interval.reset();
            }
        }
        inner.run_tick().await;
    }
    debug!(instance_id = %inner.instance_id, "tick loop exited");
}

async fn renewal_loop(inner: Arc<Inner>, coordinator: Arc<dyn CoordinationStore>) {
    let period = inner.lease.lock().await.as_ref().map(Lease::renew_interval);
    let Some(period) = period else {
        return;
    };
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // first tick completes immediately; the lease was just granted
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let lease = inner.lease.lock().await.clone();
        let Some(lease) = lease else {
            break;
        };

        match coordinator.keep_alive(&lease).await {
            Ok(()) => {}
            Err(CoordinationError::LeaseExpired(_)) => {
                warn!(instance_id = %inner.instance_id, "membership lease lost; re-registering");
                inner.metrics.increment(metrics::LEASE_RENEWAL_FAILURES, 1).await;
                inner.regrant(&coordinator).await;
            }
            Err(e) => {
                warn!(instance_id = %inner.instance_id, error = %e, "lease renewal failed");
                inner.metrics.increment(metrics::LEASE_RENEWAL_FAILURES, 1).await;
            }
        }

        if inner.refresh_members().await {
            inner.recompute.notify_one();
        }
    }
}

async fn watch_loop(inner: Arc<Inner>, coordinator: Arc<dyn CoordinationStore>) {
    let backoff = inner.coordination.lease_ttl() / 3;

    loop {
        match coordinator.watch().await {
            Ok(mut events) => loop {
                tokio::select! {
                    _ = inner.cancel.cancelled() => return,
                    event = events.recv() => match event {
                        Some(event) => {
                            debug!(instance_id = %inner.instance_id, event = ?event, "membership event");
                            if inner.refresh_members().await {
                                inner.recompute.notify_one();
                            }
                        }
                        None => {
                            warn!(instance_id = %inner.instance_id, "membership watch closed; resubscribing");
                            break;
                        }
                    },
                }
            },
            Err(e) => warn!(instance_id = %inner.instance_id, error = %e, "failed to watch membership"),
        }

        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
    }
}
