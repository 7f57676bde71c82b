//! Partition drill orchestration.
//!
//! A drill walks `INIT → DEPLOYED → FAULT_INJECTED → (MASTER_RESTARTED)? →
//! HEALED → CONVERGED → VERIFIED` and always ends in `TORN_DOWN`, whichever
//! forward step failed. Teardown is best-effort: every cleanup step runs and
//! reports its own outcome, and none of them can fail the drill.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cluster::ClusterApi;
use crate::errors::{DrillError, DrillResult, ErrorCategory};
use crate::fault::FaultInjector;
use crate::fixtures;
use crate::poll::{ConvergencePoller, PollPolicy};
use crate::remote::RemoteExecutor;
use crate::types::{AgentInfo, Host};

/// Everything one drill needs to know about the cluster and its timings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioSpec {
    pub name: String,
    /// Package providing the scheduler instance under test.
    pub package_name: String,
    /// Service id the package registers, e.g. `marathon-user`.
    pub service_id: String,
    /// Workload app id, e.g. `sleep`.
    pub app_id: String,
    /// Scheduler that runs the scheduler under test as one of its apps.
    pub root_service: String,
    pub descriptor: PathBuf,
    pub partition_script: PathBuf,
    pub bounce_master: bool,
    pub master_restart_command: String,
    #[serde(with = "crate::config::duration_str")]
    pub partition_settle: Duration,
    #[serde(with = "crate::config::duration_str")]
    pub heal_settle: Duration,
    #[serde(with = "crate::config::duration_str")]
    pub teardown_settle: Duration,
    #[serde(with = "crate::config::duration_str")]
    pub convergence_timeout: Duration,
    #[serde(with = "crate::config::duration_str")]
    pub install_timeout: Duration,
    /// Coordination store path the package leaves behind.
    pub coordination_node: String,
    pub min_private_agents: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScenarioState {
    Init,
    Deployed,
    FaultInjected,
    MasterRestarted,
    Healed,
    Converged,
    Verified,
    TornDown,
}

/// Result of one cleanup step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum CleanupOutcome {
    Done,
    /// Nothing was left to clean up.
    NoOp,
    Failed(String),
}

impl CleanupOutcome {
    fn from_removal(result: DrillResult<bool>) -> Self {
        match result {
            Ok(true) => Self::Done,
            Ok(false) => Self::NoOp,
            Err(e) => Self::Failed(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupStep {
    pub name: String,
    pub outcome: CleanupOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub run_id: Uuid,
    pub scenario: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub states: Vec<ScenarioState>,
    pub initial_task_id: Option<String>,
    pub final_task_id: Option<String>,
    pub partitioned_hosts: Vec<Host>,
    pub cleanup: Vec<CleanupStep>,
    pub error: Option<String>,
    pub error_category: Option<ErrorCategory>,
}

impl ScenarioReport {
    pub fn new(scenario: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            scenario: scenario.into(),
            started_at: Utc::now(),
            finished_at: None,
            states: vec![ScenarioState::Init],
            initial_task_id: None,
            final_task_id: None,
            partitioned_hosts: Vec::new(),
            cleanup: Vec::new(),
            error: None,
            error_category: None,
        }
    }

    pub fn current_state(&self) -> ScenarioState {
        self.states.last().copied().unwrap_or(ScenarioState::Init)
    }

    pub fn reached(&self, state: ScenarioState) -> bool {
        self.states.contains(&state)
    }

    /// Verified without an error.
    pub fn passed(&self) -> bool {
        self.error.is_none() && self.reached(ScenarioState::Verified)
    }

    pub fn write_json(&self, path: &Path) -> DrillResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Drives one drill against one workload.
///
/// Not safe to run concurrently with another drill on the same service id.
pub struct ScenarioRunner<E, C> {
    spec: ScenarioSpec,
    cluster: C,
    injector: FaultInjector<E>,
    poller: ConvergencePoller<C>,
    report: ScenarioReport,
}

impl<E, C> ScenarioRunner<E, C>
where
    E: RemoteExecutor,
    C: ClusterApi + Clone,
{
    pub fn new(spec: ScenarioSpec, executor: E, cluster: C, policy: PollPolicy) -> Self {
        let injector = FaultInjector::new(
            executor,
            spec.partition_script.clone(),
            spec.master_restart_command.clone(),
        );
        let poller = ConvergencePoller::new(cluster.clone(), policy);
        let report = ScenarioReport::new(&spec.name);
        Self {
            spec,
            cluster,
            injector,
            poller,
            report,
        }
    }

    pub fn spec(&self) -> &ScenarioSpec {
        &self.spec
    }

    pub fn report(&self) -> &ScenarioReport {
        &self.report
    }

    pub fn into_report(self) -> ScenarioReport {
        self.report
    }

    pub fn injector(&self) -> &FaultInjector<E> {
        &self.injector
    }

    /// Require enough private agents to host the scheduler and the workload apart.
    pub async fn preflight(&self) -> DrillResult<Vec<AgentInfo>> {
        let agents = self.cluster.private_agents().await?;
        let required = self.spec.min_private_agents as usize;
        if agents.len() < required {
            return Err(DrillError::Preflight(format!(
                "need at least {required} private agents, found {}",
                agents.len()
            )));
        }
        info!(private_agents = agents.len(), "Preflight passed");
        Ok(agents)
    }

    /// Run the drill and tear down, returning the first forward-step error.
    pub async fn run(&mut self) -> DrillResult<()> {
        info!(
            scenario = %self.spec.name,
            run_id = %self.report.run_id,
            bounce_master = self.spec.bounce_master,
            "Scenario started"
        );
        let result = self.execute().await;
        if let Err(ref e) = result {
            error!(
                scenario = %self.spec.name,
                state = ?self.report.current_state(),
                category = %e.category(),
                "Scenario failed: {e}"
            );
            self.report.error = Some(e.to_string());
            self.report.error_category = Some(e.category());
        }

        self.teardown().await;
        self.report.finished_at = Some(Utc::now());
        if result.is_ok() {
            info!(scenario = %self.spec.name, "Scenario passed");
        }
        result
    }

    async fn execute(&mut self) -> DrillResult<()> {
        self.preflight().await?;
        let initial = self.deploy().await?;

        let hosts = self.resolve_partition_hosts().await?;
        self.report.partitioned_hosts = hosts.iter().cloned().collect();
        self.injector.partition(&hosts).await?;
        self.advance(ScenarioState::FaultInjected);
        self.settle("partition", self.spec.partition_settle).await;

        if self.spec.bounce_master {
            self.injector.restart_master_process().await?;
            self.advance(ScenarioState::MasterRestarted);
        }

        self.injector.heal(&hosts).await?;
        self.advance(ScenarioState::Healed);
        self.settle("heal", self.spec.heal_settle).await;

        self.poller
            .wait_for_service_reachable(&self.spec.service_id, self.spec.convergence_timeout)
            .await?;
        self.poller
            .wait_for_task_running(
                &self.spec.service_id,
                &self.spec.app_id,
                self.spec.convergence_timeout,
            )
            .await?;
        self.advance(ScenarioState::Converged);

        let after = self.current_task_id().await?;
        self.report.final_task_id = Some(after.clone());
        if after != initial {
            return Err(DrillError::TaskIdentityChanged {
                before: initial,
                after,
            });
        }
        info!(task_id = %after, "Task identity unchanged");
        self.advance(ScenarioState::Verified);
        Ok(())
    }

    /// Install the scheduler, deploy the workload and capture its task id.
    async fn deploy(&mut self) -> DrillResult<String> {
        let descriptor = fixtures::load_descriptor(&self.spec.descriptor)?;
        self.cluster
            .install(&self.spec.package_name, self.spec.install_timeout)
            .await?;
        self.poller
            .wait_for_service_reachable(&self.spec.service_id, self.spec.install_timeout)
            .await?;
        self.cluster
            .deploy(&self.spec.service_id, &descriptor)
            .await?;
        self.poller
            .wait_for_task_running(
                &self.spec.service_id,
                &self.spec.app_id,
                self.spec.convergence_timeout,
            )
            .await?;

        let initial = self.current_task_id().await?;
        info!(task_id = %initial, "Captured initial task id");
        self.report.initial_task_id = Some(initial.clone());
        self.advance(ScenarioState::Deployed);
        Ok(initial)
    }

    async fn current_task_id(&self) -> DrillResult<String> {
        let app = self
            .cluster
            .get_app(&self.spec.service_id, &self.spec.app_id)
            .await?;
        app.first_task()
            .map(|task| task.id.clone())
            .ok_or_else(|| DrillError::MissingTask {
                service: self.spec.service_id.clone(),
                app: self.spec.app_id.clone(),
                detail: None,
            })
    }

    /// Host of the first task of `app_id` on `service_id`.
    async fn task_host(&self, service_id: &str, app_id: &str) -> DrillResult<Host> {
        let app = self.cluster.get_app(service_id, app_id).await?;
        let task = app.first_task().ok_or_else(|| DrillError::MissingTask {
            service: service_id.to_string(),
            app: app_id.to_string(),
            detail: None,
        })?;
        task.host
            .as_deref()
            .map(Host::from)
            .ok_or_else(|| DrillError::MissingTask {
                service: service_id.to_string(),
                app: app_id.to_string(),
                detail: Some(format!("task {} reports no host", task.id)),
            })
    }

    /// The scheduler instance's host and the workload task's host.
    async fn resolve_partition_hosts(&self) -> DrillResult<BTreeSet<Host>> {
        let scheduler_host = self
            .task_host(&self.spec.root_service, &self.spec.service_id)
            .await?;
        let task_host = self
            .task_host(&self.spec.service_id, &self.spec.app_id)
            .await?;
        info!(%scheduler_host, %task_host, "Resolved partition targets");
        Ok([scheduler_host, task_host].into_iter().collect())
    }

    /// Undo everything the drill may have left behind.
    ///
    /// Safe to call on its own and more than once; a second call only
    /// produces `NoOp` steps.
    pub async fn teardown(&mut self) -> Vec<CleanupStep> {
        info!(scenario = %self.spec.name, "Tearing down");
        let mut steps = Vec::new();

        let heal = if self.injector.partitioned_hosts().is_empty() {
            CleanupOutcome::NoOp
        } else {
            let failures = self.injector.heal_all().await;
            if failures.is_empty() {
                CleanupOutcome::Done
            } else {
                let reasons: Vec<String> = failures
                    .into_iter()
                    .map(|(host, reason)| format!("{host}: {reason}"))
                    .collect();
                CleanupOutcome::Failed(reasons.join("; "))
            }
        };
        steps.push(self.cleanup_step("heal_partitioned_hosts", heal));

        let deleted = CleanupOutcome::from_removal(
            self.cluster
                .delete_app(&self.spec.service_id, &self.spec.app_id)
                .await,
        );
        let app_was_deleted = deleted == CleanupOutcome::Done;
        steps.push(self.cleanup_step("delete_app", deleted));
        if app_was_deleted {
            self.settle("teardown", self.spec.teardown_settle).await;
        }

        let uninstalled = CleanupOutcome::from_removal(
            self.cluster
                .uninstall(&self.spec.package_name, self.spec.install_timeout)
                .await,
        );
        steps.push(self.cleanup_step("uninstall_package", uninstalled));

        let node = CleanupOutcome::from_removal(
            self.cluster
                .delete_coordination_node(&self.spec.coordination_node)
                .await,
        );
        steps.push(self.cleanup_step("delete_coordination_node", node));

        self.report.cleanup.extend(steps.iter().cloned());
        if self.report.current_state() != ScenarioState::TornDown {
            self.advance(ScenarioState::TornDown);
        }
        steps
    }

    fn cleanup_step(&self, name: &str, outcome: CleanupOutcome) -> CleanupStep {
        match outcome {
            CleanupOutcome::Failed(ref reason) => {
                warn!(step = name, "Cleanup step failed: {reason}");
            }
            _ => info!(step = name, ?outcome, "Cleanup step finished"),
        }
        CleanupStep {
            name: name.to_string(),
            outcome,
        }
    }

    fn advance(&mut self, state: ScenarioState) {
        info!(scenario = %self.spec.name, ?state, "State transition");
        self.report.states.push(state);
    }

    async fn settle(&self, phase: &str, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        info!(phase, ?duration, "Settling");
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockClusterApi, MockRemoteExecutor};

    fn spec() -> ScenarioSpec {
        ScenarioSpec {
            name: "network_failure".to_string(),
            package_name: "marathon".to_string(),
            service_id: "marathon-user".to_string(),
            app_id: "sleep".to_string(),
            root_service: "marathon".to_string(),
            descriptor: fixtures::default_fixture_dir().join(fixtures::WORKLOAD_DESCRIPTOR),
            partition_script: fixtures::default_fixture_dir().join(fixtures::PARTITION_SCRIPT),
            bounce_master: false,
            master_restart_command: "sudo systemctl restart dcos-mesos-master".to_string(),
            partition_settle: Duration::from_secs(120),
            heal_settle: Duration::from_secs(120),
            teardown_settle: Duration::from_secs(15),
            convergence_timeout: Duration::from_secs(600),
            install_timeout: Duration::from_secs(600),
            coordination_node: "universe/marathon-user".to_string(),
            min_private_agents: 2,
        }
    }

    fn agent(hostname: &str, public: bool) -> AgentInfo {
        AgentInfo {
            hostname: hostname.to_string(),
            public,
        }
    }

    #[tokio::test]
    async fn test_preflight_counts_private_agents_only() {
        let cluster = MockClusterApi::new();
        cluster.set_agents(vec![agent("10.0.1.5", false), agent("10.0.5.1", true)]);
        let runner = ScenarioRunner::new(
            spec(),
            MockRemoteExecutor::new(),
            cluster.clone(),
            PollPolicy::default(),
        );

        let err = runner.preflight().await.unwrap_err();
        assert!(matches!(err, DrillError::Preflight(ref m) if m.contains("found 1")));

        cluster.set_agents(vec![agent("10.0.1.5", false), agent("10.0.1.6", false)]);
        assert_eq!(runner.preflight().await.unwrap().len(), 2);
    }

    #[test]
    fn test_report_serializes_states_and_cleanup() {
        let mut report = ScenarioReport::new("network_failure");
        report.states.push(ScenarioState::Deployed);
        report.cleanup.push(CleanupStep {
            name: "delete_app".to_string(),
            outcome: CleanupOutcome::Failed("boom".to_string()),
        });
        report.cleanup.push(CleanupStep {
            name: "uninstall_package".to_string(),
            outcome: CleanupOutcome::NoOp,
        });

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["states"], serde_json::json!(["INIT", "DEPLOYED"]));
        assert_eq!(json["cleanup"][0]["outcome"]["status"], "failed");
        assert_eq!(json["cleanup"][0]["outcome"]["reason"], "boom");
        assert_eq!(json["cleanup"][1]["outcome"]["status"], "no_op");
        assert!(!report.passed());

        let back: ScenarioReport = serde_json::from_value(json).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn test_report_written_to_nested_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports").join("run.json");
        let mut report = ScenarioReport::new("network_failure");
        report.states.push(ScenarioState::Verified);
        report.write_json(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"VERIFIED\""));
        assert!(report.passed());
    }

    #[test]
    fn test_spec_serializes_durations_readably() {
        let json = serde_json::to_value(spec()).unwrap();
        assert_eq!(json["partition_settle"], "2m");
        assert_eq!(json["teardown_settle"], "15s");
    }
}
