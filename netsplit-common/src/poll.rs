//! Deadline-bounded polling against external state.
//!
//! Every wait probes at least once before looking at the deadline, so a zero
//! timeout still answers "is it ready right now". Probe errors are treated as
//! "not ready yet" and the latest one is carried into the timeout error.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, info};

use crate::cluster::ClusterApi;
use crate::errors::{DrillError, DrillResult};
use crate::types::TaskInstance;

/// Spacing between probes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPolicy {
    /// Delay after the first failed probe.
    pub interval: Duration,
    /// Cap for backed-off delays.
    pub max_interval: Duration,
    /// Growth per attempt; 1.0 keeps the interval fixed.
    pub backoff_factor: f64,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5))
    }
}

impl PollPolicy {
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            max_interval: interval,
            backoff_factor: 1.0,
        }
    }

    /// Doubles the delay after every failed probe, up to `max_interval`.
    pub fn exponential(interval: Duration, max_interval: Duration) -> Self {
        Self {
            interval,
            max_interval: max_interval.max(interval),
            backoff_factor: 2.0,
        }
    }

    /// Delay after failed probe number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        if self.backoff_factor <= 1.0 {
            return self.interval;
        }
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.interval.as_secs_f64() * self.backoff_factor.powi(exponent);
        let ceiling = self.max_interval.max(self.interval);
        let capped = secs.min(ceiling.as_secs_f64());
        let delay = if capped.is_finite() {
            Duration::from_secs_f64(capped.max(0.0))
        } else {
            ceiling
        };
        delay.clamp(self.interval, ceiling)
    }
}

/// Probe until it yields `Some`, or fail with `ConvergenceTimeout` once
/// `timeout` has elapsed.
pub async fn poll_until<T, F, Fut>(
    what: &str,
    policy: &PollPolicy,
    timeout: Duration,
    mut probe: F,
) -> DrillResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DrillResult<Option<T>>>,
{
    let started = Instant::now();
    let deadline = started + timeout;
    let mut attempt = 0u32;
    let mut last_error = None;

    loop {
        attempt += 1;
        match probe().await {
            Ok(Some(value)) => {
                debug!(what, attempt, elapsed = ?started.elapsed(), "Condition reached");
                return Ok(value);
            }
            Ok(None) => {}
            Err(e) => {
                debug!(what, attempt, "Probe failed: {e}");
                last_error = Some(e.to_string());
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(DrillError::ConvergenceTimeout {
                what: what.to_string(),
                waited: timeout,
                last_error,
            });
        }
        let delay = policy.delay(attempt).min(deadline - now);
        sleep(delay).await;
    }
}

/// Waits for the service and its task to come back after a disruption.
#[derive(Debug, Clone)]
pub struct ConvergencePoller<C> {
    api: C,
    policy: PollPolicy,
}

impl<C: ClusterApi> ConvergencePoller<C> {
    pub fn new(api: C, policy: PollPolicy) -> Self {
        Self { api, policy }
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    pub async fn wait_for_service_reachable(
        &self,
        service_id: &str,
        timeout: Duration,
    ) -> DrillResult<()> {
        info!(service = service_id, ?timeout, "Waiting for service to be reachable");
        let what = format!("service {service_id} to be reachable");
        poll_until(&what, &self.policy, timeout, || async move {
            self.api.service_reachable(service_id).await.map(Some)
        })
        .await
    }

    /// Returns the first running task once one is reported.
    pub async fn wait_for_task_running(
        &self,
        service_id: &str,
        app_id: &str,
        timeout: Duration,
    ) -> DrillResult<TaskInstance> {
        info!(service = service_id, app = app_id, ?timeout, "Waiting for task to be running");
        let what = format!("a running task of {app_id} on {service_id}");
        poll_until(&what, &self.policy, timeout, || async move {
            let app = self.api.get_app(service_id, app_id).await?;
            Ok(app.tasks.into_iter().find(TaskInstance::is_running))
        })
        .await
    }
}
