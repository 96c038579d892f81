//! Failover coordinator
//!
//! `NodeManager` ties the pieces together: it runs one health probe per
//! configured instance, aggregates the probes' observations into a report
//! published to the coordination store, and, while holding the leader
//! lease, reconciles the shared cluster status against what every
//! coordinator reports. Non-leaders apply watched statuses only; all
//! role-changing commands come from the leader.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use redsentry_core::status::states_by_host;
use redsentry_core::{
    ClusterStatus, ConnectionFactory, Error, FailoverSelectionStrategy, FailureDetectionStrategy,
    HostConfig, NodeState, Result, StatusDifference,
};

use crate::config::ManagerConfig;
use crate::coordination::CoordinationClient;
use crate::node::{Node, NodeListener};

/// Observer of published topology changes.
#[async_trait]
pub trait ClusterListener: Send + Sync {
    async fn primary_changed(&self, primary: Option<&HostConfig>) -> Result<()>;
    async fn replicas_changed(&self, replicas: &HashSet<HostConfig>) -> Result<()>;
}

/// Read-side of the coordinator: the current topology plus change
/// notifications. The request router depends on this, not on the manager
/// itself, so it can be driven by a stub in tests.
pub trait ClusterView: Send + Sync {
    fn current_status(&self) -> ClusterStatus;
    fn add_listener(&self, listener: Arc<dyn ClusterListener>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Starting,
    WaitingForReports,
    Running,
    Stopped,
}

pub struct NodeManager {
    config: ManagerConfig,
    hosts: Vec<HostConfig>,
    factory: Arc<dyn ConnectionFactory>,
    coordination: Arc<dyn CoordinationClient>,
    detection: Arc<dyn FailureDetectionStrategy>,
    selection: Arc<dyn FailoverSelectionStrategy>,
    nodes: RwLock<HashMap<HostConfig, Arc<Node>>>,
    /// This coordinator's own probe observations
    local_states: SyncMutex<HashMap<HostConfig, NodeState>>,
    last_published_states: SyncMutex<Option<HashMap<HostConfig, NodeState>>>,
    /// Keeps concurrent probe callbacks from publishing snapshots out of
    /// order
    report_lock: Mutex<()>,
    status: RwLock<ClusterStatus>,
    listeners: RwLock<Vec<Arc<dyn ClusterListener>>>,
    state: RwLock<ManagerState>,
    /// Serializes reconciliation passes with manual-failover handling
    reconcile_lock: Mutex<()>,
    cancel: CancellationToken,
}

impl NodeManager {
    pub fn new(
        config: ManagerConfig,
        hosts: Vec<HostConfig>,
        factory: Arc<dyn ConnectionFactory>,
        coordination: Arc<dyn CoordinationClient>,
        detection: Arc<dyn FailureDetectionStrategy>,
        selection: Arc<dyn FailoverSelectionStrategy>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            hosts,
            factory,
            coordination,
            detection,
            selection,
            nodes: RwLock::new(HashMap::new()),
            local_states: SyncMutex::new(HashMap::new()),
            last_published_states: SyncMutex::new(None),
            report_lock: Mutex::new(()),
            status: RwLock::new(ClusterStatus::empty()),
            listeners: RwLock::new(Vec::new()),
            state: RwLock::new(ManagerState::Starting),
            reconcile_lock: Mutex::new(()),
            cancel: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn state(&self) -> ManagerState {
        *self.state.read()
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// Start the probes, load the baseline status, wait for every probe to
    /// report once, then run the watch task and the reconciliation loop.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.write();
            if *state != ManagerState::Starting {
                return Err(Error::InvalidState(format!(
                    "manager already started (state {:?})",
                    *state
                )));
            }
            *state = ManagerState::WaitingForReports;
        }

        if self.hosts.is_empty() {
            return Err(Error::Configuration(
                "no instances configured to manage".to_string(),
            ));
        }

        info!(
            node_id = %self.config.node_id,
            instances = self.hosts.len(),
            "starting failover coordinator"
        );

        // Baseline: whatever topology a previous leader left behind.
        let baseline = self.coordination.cluster_status().await?;
        *self.status.write() = baseline;

        for host in &self.hosts {
            let node = Arc::new(Node::new(
                host.clone(),
                self.factory.clone(),
                self.config.probe_interval,
                self.config.max_probe_errors,
            ));
            node.add_listener(Arc::new(ProbeListener {
                manager: Arc::downgrade(&self),
            }));
            tokio::spawn(node.clone().run());
            self.nodes.write().insert(host.clone(), node);
        }

        self.wait_for_initial_reports().await?;
        *self.state.write() = ManagerState::Running;

        self.clone().spawn_watch();
        self.clone().spawn_reconcile_loop();

        Ok(())
    }

    /// Stop everything. Idempotent.
    pub async fn stop(&self) {
        {
            let mut state = self.state.write();
            if *state == ManagerState::Stopped {
                return;
            }
            *state = ManagerState::Stopped;
        }

        info!(node_id = %self.config.node_id, "stopping failover coordinator");
        self.cancel.cancel();

        let nodes: Vec<Arc<Node>> = self.nodes.write().drain().map(|(_, n)| n).collect();
        for node in nodes {
            node.stop();
        }

        if let Err(e) = self.coordination.close().await {
            warn!(error = %e, "closing coordination client failed");
        }
    }

    /// Block until the published topology has a primary, or time out.
    pub async fn wait_until_primary(&self, wait: Duration) -> Result<HostConfig> {
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            if let Some(primary) = self.status.read().primary().cloned() {
                return Ok(primary);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(
                    "no primary appeared within the wait period".to_string(),
                ));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn wait_for_initial_reports(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.config.startup_timeout;

        loop {
            let reported = self.local_states.lock().len();
            if reported >= self.hosts.len() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "only {reported} of {} probes reported within the startup timeout",
                    self.hosts.len()
                )));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Record one probe observation and push the aggregate report to the
    /// coordination store when it changed.
    async fn record_state(&self, host: &HostConfig, state: NodeState) {
        // Held across the publish so two callbacks cannot persist their
        // snapshots out of order.
        let _guard = self.report_lock.lock().await;

        let snapshot = {
            let mut states = self.local_states.lock();
            states.insert(host.clone(), state);
            states.clone()
        };

        let changed = {
            let last = self.last_published_states.lock();
            last.as_ref() != Some(&snapshot)
        };
        if !changed {
            return;
        }

        match self
            .coordination
            .publish_node_states(&self.config.node_id, &snapshot)
            .await
        {
            Ok(()) => {
                *self.last_published_states.lock() = Some(snapshot);
            }
            Err(e) => {
                // Retried on the next probe event
                warn!(error = %e, "publishing node report failed");
            }
        }
    }

    fn spawn_watch(self: Arc<Self>) {
        let cancel = self.cancel.clone();
        let mut updates = self.coordination.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    received = updates.recv() => match received {
                        Ok(status) => {
                            // The leader already applied its own writes
                            if !self.coordination.is_leader() {
                                self.apply_status(status).await;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(skipped, "status watch lagged, catching up");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
    }

    fn spawn_reconcile_loop(self: Arc<Self>) {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = self.reconcile_pass().await {
                    if matches!(e, Error::Bootstrap(_)) {
                        error!(error = %e, "bootstrap election failed, stopping coordinator");
                        self.stop().await;
                        break;
                    }
                    warn!(error = %e, "reconciliation pass failed, retrying next cycle");
                }

                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(self.config.reconcile_interval) => {}
                }
            }
        });
    }

    /// One reconciliation pass. A no-op unless this coordinator holds (or
    /// acquires, within the bounded wait) the leader lease.
    async fn reconcile_pass(&self) -> Result<()> {
        if !self.coordination.is_leader()
            && !self
                .coordination
                .wait_for_leadership(self.config.leadership_wait)
                .await?
        {
            return Ok(());
        }

        let _guard = self.reconcile_lock.lock().await;

        let reports = self.coordination.node_reports().await?;
        let current = self.current_status();

        if !current.has_primary() {
            let elected = self.bootstrap_election().await?;
            self.publish_status(elected).await?;
            return Ok(());
        }

        if let Some(target) = self.coordination.manual_failover_target().await? {
            self.handle_manual_failover(&target, &reports).await?;
            // Manual promotion settles before availability is re-judged
            return Ok(());
        }

        let next = self.compute_status(&current, &reports).await;
        self.publish_status(next).await?;
        self.reconcile_roles().await;

        Ok(())
    }

    /// First-start election: adopt whichever instance already reports
    /// itself primary; everything else is told to replicate it. Nobody
    /// claiming the primary role is fatal, a coordinator never promotes an
    /// instance on bootstrap.
    async fn bootstrap_election(&self) -> Result<ClusterStatus> {
        info!("cluster status has no primary, running bootstrap election");

        let nodes: Vec<Arc<Node>> = self.nodes.read().values().cloned().collect();
        let mut primary: Option<HostConfig> = None;
        let mut unavailable: HashSet<HostConfig> = HashSet::new();

        for node in &nodes {
            match node.is_primary().await {
                Ok(true) => {
                    if let Some(ref existing) = primary {
                        warn!(
                            first = %existing,
                            second = %node.host(),
                            "multiple instances claim the primary role, keeping the first"
                        );
                        continue;
                    }
                    info!(host = %node.host(), "instance self-reports as primary, adopting");
                    primary = Some(node.host().clone());
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(host = %node.host(), error = %e, "role inspection failed");
                    unavailable.insert(node.host().clone());
                }
            }
        }

        let Some(primary) = primary else {
            return Err(Error::Bootstrap(format!(
                "none of the {} configured instances reports itself as primary",
                self.hosts.len()
            )));
        };

        let mut replicas: HashSet<HostConfig> = HashSet::new();
        for node in &nodes {
            if *node.host() == primary || unavailable.contains(node.host()) {
                continue;
            }
            match node.make_replica_of(&primary.host, primary.port).await {
                Ok(()) => {
                    replicas.insert(node.host().clone());
                }
                Err(e) => {
                    warn!(host = %node.host(), error = %e, "attaching replica failed");
                    unavailable.insert(node.host().clone());
                }
            }
        }

        Ok(ClusterStatus::new(Some(primary), replicas, unavailable))
    }

    /// Operator-requested promotion. Skipped (and consumed) when the
    /// target is already primary or nobody has reported seeing it.
    async fn handle_manual_failover(
        &self,
        target: &HostConfig,
        reports: &redsentry_core::ReportMap,
    ) -> Result<()> {
        let current = self.current_status();

        if current.primary() == Some(target) {
            info!(host = %target, "manual failover target is already primary, clearing request");
            self.coordination.clear_manual_failover().await?;
            return Ok(());
        }

        let seen = states_by_host(reports).contains_key(target);
        if !seen {
            warn!(host = %target, "manual failover target has no reports, clearing request");
            self.coordination.clear_manual_failover().await?;
            return Ok(());
        }

        let Some(node) = self.nodes.read().get(target).cloned() else {
            warn!(host = %target, "manual failover target is not a managed instance, clearing request");
            self.coordination.clear_manual_failover().await?;
            return Ok(());
        };

        info!(host = %target, "manual failover requested, promoting");
        let next = self.promote(&node, &current).await?;
        self.publish_status(next).await?;

        // Cleared only after the new topology is visible, so a crash here
        // reapplies an (idempotent) promotion instead of losing it.
        self.coordination.clear_manual_failover().await?;
        Ok(())
    }

    /// Recompute availability from the cross-coordinator reports and, if
    /// the primary fell out, fail over.
    async fn compute_status(
        &self,
        current: &ClusterStatus,
        reports: &redsentry_core::ReportMap,
    ) -> ClusterStatus {
        let by_host = states_by_host(reports);
        let mut available: HashSet<HostConfig> = HashSet::new();
        let mut unavailable: HashSet<HostConfig> = HashSet::new();

        for host in &self.hosts {
            // A host nobody reports on cannot be judged available
            let judged = by_host
                .get(host)
                .is_some_and(|states| self.detection.is_available(host, states));
            if judged {
                available.insert(host.clone());
            } else {
                unavailable.insert(host.clone());
            }
        }

        let previous_primary = current.primary().cloned();

        if let Some(primary) = previous_primary.clone() {
            if available.contains(&primary) {
                available.remove(&primary);
                return ClusterStatus::new(Some(primary), available, unavailable);
            }
        }

        match self.selection.select_primary(&available, reports) {
            Some(new_primary) => {
                info!(
                    old = ?previous_primary,
                    new = %new_primary,
                    "primary unavailable, failing over"
                );

                let node = self.nodes.read().get(&new_primary).cloned();
                if let Some(node) = node {
                    if let Err(e) = node.become_primary().await {
                        warn!(host = %new_primary, error = %e, "promotion command failed");
                    }
                }

                available.remove(&new_primary);
                ClusterStatus::new(Some(new_primary), available, unavailable)
            }
            None => {
                // No usable candidate: keep the last known primary rather
                // than publish a topology without a write target.
                warn!("no failover candidate available, keeping last known primary");
                if let Some(ref primary) = previous_primary {
                    available.remove(primary);
                    unavailable.remove(primary);
                }
                ClusterStatus::new(previous_primary, available, unavailable)
            }
        }
    }

    /// Promote one instance and point every other available instance at
    /// it. Per-node command failures land in the unavailable set.
    async fn promote(&self, node: &Arc<Node>, current: &ClusterStatus) -> Result<ClusterStatus> {
        node.become_primary().await?;
        let primary = node.host().clone();

        let mut replicas: HashSet<HostConfig> = HashSet::new();
        let mut unavailable: HashSet<HostConfig> = current.unavailable().clone();
        unavailable.remove(&primary);

        let others: Vec<Arc<Node>> = self
            .nodes
            .read()
            .values()
            .filter(|n| *n.host() != primary && !unavailable.contains(n.host()))
            .cloned()
            .collect();

        for other in others {
            match other.make_replica_of(&primary.host, primary.port).await {
                Ok(()) => {
                    replicas.insert(other.host().clone());
                }
                Err(e) => {
                    warn!(host = %other.host(), error = %e, "attaching replica failed");
                    unavailable.insert(other.host().clone());
                }
            }
        }

        Ok(ClusterStatus::new(Some(primary), replicas, unavailable))
    }

    /// Make reality match the published topology: the primary must hold
    /// the primary role, each replica must replicate it. Per-node errors
    /// are logged and retried next pass.
    async fn reconcile_roles(&self) {
        let status = self.current_status();
        let Some(primary) = status.primary().cloned() else {
            return;
        };
        let nodes = self.nodes.read().clone();

        if let Some(node) = nodes.get(&primary) {
            match node.is_primary().await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(host = %primary, "published primary lost its role, restoring");
                    if let Err(e) = node.become_primary().await {
                        warn!(host = %primary, error = %e, "restoring primary role failed");
                    }
                }
                Err(e) => {
                    debug!(host = %primary, error = %e, "primary role inspection failed");
                }
            }
        }

        for replica in status.replicas() {
            let Some(node) = nodes.get(replica) else {
                continue;
            };
            match node.primary_address().await {
                Ok(Some(ref upstream)) if *upstream == primary => {}
                Ok(_) => {
                    warn!(host = %replica, "replica not attached to the published primary, reattaching");
                    if let Err(e) = node.make_replica_of(&primary.host, primary.port).await {
                        warn!(host = %replica, error = %e, "reattaching replica failed");
                    }
                }
                Err(e) => {
                    debug!(host = %replica, error = %e, "replica role inspection failed");
                }
            }
        }
    }

    /// Publish a status if it differs from the current one, and notify
    /// listeners per the difference classification.
    async fn publish_status(&self, next: ClusterStatus) -> Result<()> {
        let difference = self.current_status().difference(&next);
        if difference == StatusDifference::None {
            return Ok(());
        }

        self.coordination.publish_cluster_status(&next).await?;
        *self.status.write() = next.clone();
        self.fire_listeners(&next, difference).await;
        Ok(())
    }

    /// Adopt a status published by another coordinator (non-leader path).
    async fn apply_status(&self, next: ClusterStatus) {
        let difference = self.current_status().difference(&next);
        if difference == StatusDifference::None {
            return;
        }

        *self.status.write() = next.clone();
        self.fire_listeners(&next, difference).await;
    }

    async fn fire_listeners(&self, status: &ClusterStatus, difference: StatusDifference) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            if matches!(difference, StatusDifference::Primary | StatusDifference::Both) {
                if let Err(e) = listener.primary_changed(status.primary()).await {
                    warn!(error = %e, "primary change listener failed");
                }
            }
            if matches!(difference, StatusDifference::Replicas | StatusDifference::Both) {
                if let Err(e) = listener.replicas_changed(status.replicas()).await {
                    warn!(error = %e, "replica change listener failed");
                }
            }
        }
    }
}

impl ClusterView for NodeManager {
    fn current_status(&self) -> ClusterStatus {
        self.status.read().clone()
    }

    fn add_listener(&self, listener: Arc<dyn ClusterListener>) {
        self.listeners.write().push(listener);
    }
}

/// Adapter feeding probe events into the manager's aggregate report.
/// Holds a weak back-reference so probes never keep a stopped manager
/// alive.
struct ProbeListener {
    manager: Weak<NodeManager>,
}

#[async_trait]
impl NodeListener for ProbeListener {
    async fn node_online(&self, host: &HostConfig, latency_ms: u64) -> Result<()> {
        if let Some(manager) = self.manager.upgrade() {
            manager
                .record_state(host, NodeState::online(latency_ms))
                .await;
        }
        Ok(())
    }

    async fn node_offline(&self, host: &HostConfig, _error: &Error) -> Result<()> {
        if let Some(manager) = self.manager.upgrade() {
            manager.record_state(host, NodeState::OFFLINE).await;
        }
        Ok(())
    }
}
