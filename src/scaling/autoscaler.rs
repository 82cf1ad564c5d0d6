//! Load-driven auto-scaler.
//!
//! Every evaluation the scaler takes the pending job count and the number of
//! active workers, runs them through `ScalingPolicy`, and hands any resulting
//! target to a `FleetManager`. Before a scaling action it consults the
//! `ResourceManager` (scale-up only) and claims the shared cooldown timestamp
//! in the coordination store. A redundant scaler instance that loses the
//! claim backs off for the window.

use std::collections::VecDeque;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::fleet::FleetManager;
use super::resources::ResourceManager;
use crate::error::ScalingError;
use crate::metrics::{MetricsCollector, MetricsRecorder, MetricsSnapshot};
use crate::store::{CoordinationStore, Keyspace};
use crate::utils::{sleep_or_shutdown, Backoff, ShutdownSignal};

/// Number of decisions kept in memory.
const HISTORY_SIZE: usize = 100;

/// Auto-scaler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoScalerConfig {
    pub enabled: bool,
    pub min_workers: usize,
    pub max_workers: usize,
    /// Pending jobs per active worker above which the fleet grows.
    pub scale_up_threshold: f64,
    /// Pending jobs per active worker below which the fleet shrinks.
    pub scale_down_threshold: f64,
    #[serde(with = "crate::config::duration_secs")]
    pub scale_up_cooldown: Duration,
    #[serde(with = "crate::config::duration_secs")]
    pub scale_down_cooldown: Duration,
    #[serde(with = "crate::config::duration_secs")]
    pub evaluation_interval: Duration,
}

impl Default for AutoScalerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_workers: 1,
            max_workers: 10,
            scale_up_threshold: 10.0,
            scale_down_threshold: 2.0,
            scale_up_cooldown: Duration::from_secs(60),
            scale_down_cooldown: Duration::from_secs(300),
            evaluation_interval: Duration::from_secs(30),
        }
    }
}

impl AutoScalerConfig {
    pub fn with_bounds(mut self, min_workers: usize, max_workers: usize) -> Self {
        self.min_workers = min_workers;
        self.max_workers = max_workers;
        self
    }

    pub fn with_thresholds(mut self, scale_up: f64, scale_down: f64) -> Self {
        self.scale_up_threshold = scale_up;
        self.scale_down_threshold = scale_down;
        self
    }

    pub fn with_cooldowns(mut self, scale_up: Duration, scale_down: Duration) -> Self {
        self.scale_up_cooldown = scale_up;
        self.scale_down_cooldown = scale_down;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_workers == 0 {
            return Err("autoscaler.max_workers must be at least 1".to_string());
        }
        if self.min_workers > self.max_workers {
            return Err(format!(
                "autoscaler.min_workers ({}) cannot exceed autoscaler.max_workers ({})",
                self.min_workers, self.max_workers
            ));
        }
        if !(self.scale_down_threshold >= 0.0) {
            return Err("autoscaler.scale_down_threshold must be non-negative".to_string());
        }
        if !(self.scale_up_threshold > self.scale_down_threshold) {
            return Err(format!(
                "autoscaler.scale_up_threshold ({}) must be greater than scale_down_threshold ({})",
                self.scale_up_threshold, self.scale_down_threshold
            ));
        }
        if self.evaluation_interval.is_zero() {
            return Err("autoscaler.evaluation_interval must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ScalingDecision {
    NoAction { reason: String },
    ScaleUp { target: usize, reason: String },
    ScaleDown { target: usize, reason: String },
}

impl ScalingDecision {
    fn no_action(reason: impl Into<String>) -> Self {
        ScalingDecision::NoAction {
            reason: reason.into(),
        }
    }

    /// Metric label for the decision.
    pub fn action(&self) -> &'static str {
        match self {
            ScalingDecision::NoAction { .. } => "no_action",
            ScalingDecision::ScaleUp { .. } => "scale_up",
            ScalingDecision::ScaleDown { .. } => "scale_down",
        }
    }

    pub fn target(&self) -> Option<usize> {
        match self {
            ScalingDecision::NoAction { .. } => None,
            ScalingDecision::ScaleUp { target, .. } | ScalingDecision::ScaleDown { target, .. } => {
                Some(*target)
            }
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            ScalingDecision::NoAction { reason }
            | ScalingDecision::ScaleUp { reason, .. }
            | ScalingDecision::ScaleDown { reason, .. } => reason,
        }
    }

    pub fn is_action(&self) -> bool {
        self.target().is_some()
    }
}

/// The pure decision function.
#[derive(Debug, Clone)]
pub struct ScalingPolicy {
    config: AutoScalerConfig,
}

impl ScalingPolicy {
    pub fn new(config: AutoScalerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AutoScalerConfig {
        &self.config
    }

    /// Decides on a target given the current load.
    ///
    /// `since_last_action` is `None` when no scaling action was ever taken.
    /// With no active workers the fleet is bootstrapped and cooldowns do not
    /// apply. Any target lies within `[min_workers, max_workers]`.
    pub fn evaluate(
        &self,
        pending_jobs: usize,
        active_workers: usize,
        since_last_action: Option<Duration>,
    ) -> ScalingDecision {
        let c = &self.config;

        if active_workers == 0 {
            let target = if c.min_workers > 0 {
                c.min_workers
            } else if pending_jobs > 0 {
                1.min(c.max_workers)
            } else {
                return ScalingDecision::no_action("no active workers and no pending jobs");
            };
            return ScalingDecision::ScaleUp {
                target,
                reason: format!(
                    "bootstrap: no active workers, {} pending jobs",
                    pending_jobs
                ),
            };
        }

        let jobs_per_worker = pending_jobs as f64 / active_workers as f64;
        let elapsed = |cooldown: Duration| since_last_action.map_or(true, |s| s >= cooldown);

        if jobs_per_worker > c.scale_up_threshold && active_workers < c.max_workers {
            if !elapsed(c.scale_up_cooldown) {
                return ScalingDecision::no_action(format!(
                    "scale-up cooldown active ({}s)",
                    c.scale_up_cooldown.as_secs()
                ));
            }
            let wanted = (pending_jobs as f64 / c.scale_up_threshold).ceil() as usize + 1;
            let target = self.clamp(wanted);
            if target <= active_workers {
                return ScalingDecision::no_action("already at the scale-up target");
            }
            return ScalingDecision::ScaleUp {
                target,
                reason: format!(
                    "jobs_per_worker {:.2} > scale_up_threshold {:.2} ({} pending, {} active)",
                    jobs_per_worker, c.scale_up_threshold, pending_jobs, active_workers
                ),
            };
        }

        if jobs_per_worker < c.scale_down_threshold && active_workers > c.min_workers {
            if !elapsed(c.scale_down_cooldown) {
                return ScalingDecision::no_action(format!(
                    "scale-down cooldown active ({}s)",
                    c.scale_down_cooldown.as_secs()
                ));
            }
            let wanted = if c.scale_down_threshold > 0.0 {
                (pending_jobs as f64 / c.scale_down_threshold).ceil() as usize + 1
            } else {
                c.min_workers
            };
            let target = self.clamp(wanted);
            if target < active_workers {
                return ScalingDecision::ScaleDown {
                    target,
                    reason: format!(
                        "jobs_per_worker {:.2} < scale_down_threshold {:.2} ({} pending, {} active)",
                        jobs_per_worker, c.scale_down_threshold, pending_jobs, active_workers
                    ),
                };
            }
        }

        ScalingDecision::no_action(format!(
            "jobs_per_worker {:.2} within thresholds",
            jobs_per_worker
        ))
    }

    fn clamp(&self, target: usize) -> usize {
        target.max(self.config.min_workers).min(self.config.max_workers)
    }
}

/// A decision together with the load it was based on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalingEvent {
    pub timestamp: DateTime<Utc>,
    pub pending_jobs: usize,
    pub active_workers: usize,
    pub decision: ScalingDecision,
}

/// Applies `ScalingPolicy` to live metrics.
pub struct AutoScaler {
    policy: ScalingPolicy,
    store: Arc<dyn CoordinationStore>,
    keys: Keyspace,
    resources: ResourceManager,
    fleet: Arc<dyn FleetManager>,
    history: RwLock<VecDeque<ScalingEvent>>,
    recorder: MetricsRecorder,
}

impl AutoScaler {
    pub fn new(
        config: AutoScalerConfig,
        store: Arc<dyn CoordinationStore>,
        keys: Keyspace,
        resources: ResourceManager,
        fleet: Arc<dyn FleetManager>,
    ) -> Self {
        Self {
            policy: ScalingPolicy::new(config),
            store,
            keys,
            resources,
            fleet,
            history: RwLock::new(VecDeque::with_capacity(HISTORY_SIZE)),
            recorder: MetricsRecorder::new(),
        }
    }

    pub fn config(&self) -> &AutoScalerConfig {
        self.policy.config()
    }

    /// Evaluates a snapshot now and applies the decision.
    pub async fn evaluate(
        &self,
        snapshot: &MetricsSnapshot,
    ) -> Result<ScalingDecision, ScalingError> {
        self.evaluate_at(snapshot, Utc::now()).await
    }

    /// Evaluates a snapshot as of `now` and applies the decision.
    ///
    /// Returns the decision that was acted on. A scale-up vetoed by the
    /// resource manager, or an action lost to another scaler instance, comes
    /// back as `NoAction`.
    pub async fn evaluate_at(
        &self,
        snapshot: &MetricsSnapshot,
        now: DateTime<Utc>,
    ) -> Result<ScalingDecision, ScalingError> {
        let pending = snapshot.pending_jobs;
        let active = snapshot.active_workers;
        let bootstrap = active == 0;

        let last_raw = self.store.get(&self.keys.last_scale()).await?;
        let since = last_raw
            .as_deref()
            .and_then(|raw| self.parse_last_scale(raw))
            .map(|last| (now - last).to_std().unwrap_or(Duration::ZERO));

        let mut decision = self.policy.evaluate(pending, active, since);

        if let ScalingDecision::ScaleUp { target, .. } = &decision {
            if !bootstrap {
                let check = self.resources.check().await;
                if !check.allows_scale_up() {
                    info!(
                        target_workers = *target,
                        violations = %check.reason(),
                        "Scale-up suppressed by resource limits"
                    );
                    decision = ScalingDecision::no_action(format!(
                        "scale-up to {} suppressed: {}",
                        target,
                        check.reason()
                    ));
                }
            }
        }

        if let Some(target) = decision.target() {
            let stamp = now.to_rfc3339();
            if bootstrap {
                self.store.put(&self.keys.last_scale(), &stamp).await?;
            } else {
                let claimed = self
                    .store
                    .compare_and_swap(&self.keys.last_scale(), last_raw.as_deref(), Some(&stamp))
                    .await?;
                if !claimed {
                    debug!(target_workers = target, "Another scaler acted first");
                    decision =
                        ScalingDecision::no_action("another scaler acted within the cooldown");
                }
            }
        }

        if let Some(target) = decision.target() {
            info!(
                action = decision.action(),
                target_workers = target,
                pending,
                active,
                reason = %decision.reason(),
                "Scaling worker fleet"
            );
            self.fleet.set_worker_count(target).await?;
        } else {
            debug!(pending, active, reason = %decision.reason(), "No scaling action");
        }

        self.recorder
            .record_scaling_decision(decision.action(), decision.target());
        self.push_history(ScalingEvent {
            timestamp: now,
            pending_jobs: pending,
            active_workers: active,
            decision: decision.clone(),
        });
        Ok(decision)
    }

    fn parse_last_scale(&self, raw: &str) -> Option<DateTime<Utc>> {
        match DateTime::parse_from_rfc3339(raw) {
            Ok(ts) => Some(ts.with_timezone(&Utc)),
            Err(e) => {
                warn!(value = raw, error = %e, "Ignoring unreadable last-scale timestamp");
                None
            }
        }
    }

    fn push_history(&self, event: ScalingEvent) {
        let mut history = self.history.write().unwrap_or_else(PoisonError::into_inner);
        while history.len() >= HISTORY_SIZE {
            history.pop_front();
        }
        history.push_back(event);
    }

    /// Recent decisions, oldest first.
    pub fn history(&self) -> Vec<ScalingEvent> {
        let history = self.history.read().unwrap_or_else(PoisonError::into_inner);
        history.iter().cloned().collect()
    }

    /// Collects a snapshot and evaluates it every `evaluation_interval`
    /// until shutdown.
    pub async fn run(&self, collector: &MetricsCollector, mut shutdown: ShutdownSignal) {
        let interval = self.config().evaluation_interval;
        let mut backoff = Backoff::default();
        info!(
            min_workers = self.config().min_workers,
            max_workers = self.config().max_workers,
            interval_secs = interval.as_secs(),
            "Auto-scaler started"
        );

        loop {
            let result = match collector.collect().await {
                Ok(snapshot) => self.evaluate(&snapshot).await,
                Err(e) => Err(ScalingError::from(e)),
            };
            let wait = match result {
                Ok(_) => {
                    backoff.reset();
                    interval
                }
                Err(e) => {
                    if e.is_transient() {
                        self.recorder.record_store_error("autoscaler");
                    }
                    warn!(error = %e, "Auto-scaler evaluation failed");
                    backoff.next_delay().min(interval)
                }
            };
            if sleep_or_shutdown(wait, &mut shutdown).await {
                break;
            }
        }
        info!("Auto-scaler stopped");
    }
}
