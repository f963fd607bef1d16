//! Leader Elector
//!
//! Drives the `Follower -> Candidate -> Leader -> Follower` state machine
//! of one leader slot and runs leader-only components while the lease is
//! held.

use super::{ElectionError, LeaderConfig, LeaseClient, LeaseOutcome};
use crate::domain::ports::MetricsStore;
use crate::domain::value_objects::unix_millis;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Election state of one replica for one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    Follower,
    Candidate,
    Leader,
}

/// Handle leader-only work uses to re-validate leadership against the store.
#[derive(Clone)]
pub struct Leadership {
    lease: Arc<LeaseClient>,
    store_timeout: Duration,
}

impl Leadership {
    pub fn new(lease: Arc<LeaseClient>, store_timeout: Duration) -> Self {
        Self {
            lease,
            store_timeout,
        }
    }

    /// Re-read the lease and check it is still ours. Any failure counts as
    /// not held.
    pub async fn is_held(&self) -> bool {
        match tokio::time::timeout(self.store_timeout, self.lease.is_held_by_self(unix_millis()))
            .await
        {
            Ok(Ok(held)) => held,
            Ok(Err(e)) => {
                tracing::debug!("leadership check on {} failed: {}", self.lease.slot(), e);
                false
            }
            Err(_) => false,
        }
    }

    pub fn slot(&self) -> &str {
        self.lease.slot()
    }
}

/// Context handed to a leader-only component.
#[derive(Clone)]
pub struct LeaderContext {
    pub leadership: Leadership,
    /// Cancelled on demotion or shutdown
    pub cancel: CancellationToken,
}

/// Work that only the current leader of a slot may perform.
#[async_trait]
pub trait LeaderComponent: Send + Sync {
    fn name(&self) -> &str;

    /// Run until `ctx.cancel` fires.
    async fn run(&self, ctx: LeaderContext) -> anyhow::Result<()>;
}

struct RunningLeader {
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

/// Lease-based elector for one slot.
pub struct LeaderElector {
    lease: Arc<LeaseClient>,
    config: LeaderConfig,
    metrics: Arc<dyn MetricsStore>,
    components: Vec<Arc<dyn LeaderComponent>>,
    state: Arc<RwLock<ElectionState>>,
}

impl LeaderElector {
    pub fn new(lease: LeaseClient, config: LeaderConfig, metrics: Arc<dyn MetricsStore>) -> Self {
        Self {
            lease: Arc::new(lease),
            config,
            metrics,
            components: Vec::new(),
            state: Arc::new(RwLock::new(ElectionState::Follower)),
        }
    }

    /// Register a component to run while this replica leads.
    pub fn add_component(&mut self, component: Arc<dyn LeaderComponent>) {
        self.components.push(component);
    }

    pub fn state(&self) -> ElectionState {
        *self.state.read()
    }

    pub fn is_leader(&self) -> bool {
        self.state() == ElectionState::Leader
    }

    pub fn slot(&self) -> &str {
        self.lease.slot()
    }

    /// Leadership handle for this slot.
    pub fn leadership(&self) -> Leadership {
        Leadership::new(self.lease.clone(), self.config.store_timeout)
    }

    fn set_state(&self, state: ElectionState) {
        *self.state.write() = state;
    }

    /// Run the election loop until `cancel` fires.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn run(&self, cancel: CancellationToken) {
        self.metrics.set_leader(self.slot(), false);
        let mut ticker = tokio::time::interval(self.config.renew_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut running: Option<RunningLeader> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if running.is_none() {
                self.set_state(ElectionState::Candidate);
            }

            let attempt = tokio::time::timeout(
                self.config.store_timeout,
                self.lease.try_acquire(unix_millis()),
            )
            .await;

            match attempt {
                Ok(Ok(outcome)) if outcome.is_held() => {
                    if running.is_none() {
                        running = Some(self.promote(&cancel));
                    }
                }
                Ok(Ok(LeaseOutcome::HeldByOther { holder, .. })) => {
                    if let Some(leader) = running.take() {
                        let err = ElectionError::LeaseLost {
                            slot: self.slot().to_string(),
                            holder,
                        };
                        tracing::warn!("{}", err);
                        self.demote(leader).await;
                    }
                    self.set_state(ElectionState::Follower);
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    tracing::warn!("lease {} acquisition failed: {}", self.slot(), e);
                    if let Some(leader) = running.take() {
                        self.demote(leader).await;
                    }
                    self.set_state(ElectionState::Follower);
                }
                Err(_) => {
                    tracing::warn!(
                        "lease {} acquisition timed out after {:?}",
                        self.slot(),
                        self.config.store_timeout
                    );
                    if let Some(leader) = running.take() {
                        self.demote(leader).await;
                    }
                    self.set_state(ElectionState::Follower);
                }
            }
        }

        if let Some(leader) = running.take() {
            self.demote(leader).await;
            match tokio::time::timeout(self.config.store_timeout, self.lease.release(unix_millis()))
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("failed to release lease {}: {}", self.slot(), e),
                Err(_) => tracing::warn!("timed out releasing lease {}", self.slot()),
            }
        }
        self.set_state(ElectionState::Follower);
        tracing::info!("leader election for {} stopped", self.slot());
    }

    fn promote(&self, parent: &CancellationToken) -> RunningLeader {
        tracing::info!("became leader of {} as {}", self.slot(), self.lease.holder());
        self.set_state(ElectionState::Leader);
        self.metrics.set_leader(self.slot(), true);

        let cancel = parent.child_token();
        let mut tasks = JoinSet::new();
        for component in &self.components {
            let component = component.clone();
            let ctx = LeaderContext {
                leadership: self.leadership(),
                cancel: cancel.clone(),
            };
            tasks.spawn(async move {
                if let Err(e) = component.run(ctx).await {
                    tracing::warn!("leader component {} failed: {:?}", component.name(), e);
                }
            });
        }

        RunningLeader { cancel, tasks }
    }

    /// Stop leader-only work: signal, wait for the grace period, then abort.
    async fn demote(&self, mut leader: RunningLeader) {
        tracing::info!("lost leadership of {}", self.slot());
        self.metrics.set_leader(self.slot(), false);
        self.set_state(ElectionState::Follower);
        leader.cancel.cancel();

        let drained = tokio::time::timeout(self.config.grace_period, async {
            while leader.tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                "leader components of {} did not stop within {:?}, aborting",
                self.slot(),
                self.config.grace_period
            );
            leader.tasks.abort_all();
            while leader.tasks.join_next().await.is_some() {}
        }
    }
}
