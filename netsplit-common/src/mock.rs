//! Deterministic in-memory doubles for the remote and cluster seams.
//!
//! Both mocks are cheap to clone and share their state, so a test keeps one
//! handle for scripting and assertions while the code under test owns the
//! other.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use crate::cluster::ClusterApi;
use crate::errors::{DrillError, DrillResult};
use crate::remote::{CommandOutput, RemoteExecutor};
use crate::types::{AgentInfo, AppState, HostSelector, TaskInstance};

/// One call received by [`MockRemoteExecutor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    Run { host: HostSelector, command: String },
    Copy { host: HostSelector, path: PathBuf },
}

#[derive(Debug, Default)]
struct RemoteState {
    calls: Vec<RemoteCall>,
    failures: Vec<(HostSelector, String)>,
}

/// Records remote calls; every run succeeds unless a failure rule matches.
#[derive(Debug, Clone, Default)]
pub struct MockRemoteExecutor {
    state: Arc<Mutex<RemoteState>>,
}

impl MockRemoteExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail runs on `host` whose command contains `pattern`.
    pub fn fail_on(&self, host: HostSelector, pattern: impl Into<String>) {
        self.state
            .lock()
            .expect("remote mock mutex poisoned")
            .failures
            .push((host, pattern.into()));
    }

    pub fn clear_failures(&self) {
        self.state
            .lock()
            .expect("remote mock mutex poisoned")
            .failures
            .clear();
    }

    #[must_use]
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state
            .lock()
            .expect("remote mock mutex poisoned")
            .calls
            .clone()
    }

    /// Commands run on `host`, in order.
    #[must_use]
    pub fn commands_on(&self, host: &HostSelector) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RemoteCall::Run { host: h, command } if &h == host => Some(command),
                _ => None,
            })
            .collect()
    }
}

impl RemoteExecutor for MockRemoteExecutor {
    async fn run(&self, host: &HostSelector, command: &str) -> DrillResult<CommandOutput> {
        let mut state = self.state.lock().expect("remote mock mutex poisoned");
        state.calls.push(RemoteCall::Run {
            host: host.clone(),
            command: command.to_string(),
        });
        let failing = state
            .failures
            .iter()
            .any(|(h, pattern)| h == host && command.contains(pattern.as_str()));
        if failing {
            return Err(DrillError::RemoteExecution {
                host: host.to_string(),
                command: command.to_string(),
                exit_code: Some(1),
                stderr: "scripted failure".to_string(),
            });
        }
        Ok(CommandOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::ZERO,
        })
    }

    async fn copy(&self, host: &HostSelector, local_path: &Path) -> DrillResult<()> {
        self.state
            .lock()
            .expect("remote mock mutex poisoned")
            .calls
            .push(RemoteCall::Copy {
                host: host.clone(),
                path: local_path.to_path_buf(),
            });
        Ok(())
    }
}

/// One call received by [`MockClusterApi`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterCall {
    Install(String),
    PackageInstalled(String),
    Uninstall(String),
    Deploy { service: String, app: Option<String> },
    GetApp { service: String, app: String },
    DeleteApp { service: String, app: String },
    ServiceReachable(String),
    PrivateAgents,
    DeleteCoordinationNode(String),
}

#[derive(Debug, Default)]
struct ClusterState {
    calls: Vec<ClusterCall>,
    installed: BTreeSet<String>,
    install_never_completes: bool,
    uninstall_error: Option<u16>,
    deploy_error: Option<u16>,
    apps: HashMap<(String, String), Vec<AppState>>,
    deleted_apps: BTreeSet<(String, String)>,
    unreachable_probes: u32,
    agents: Vec<AgentInfo>,
    coordination_nodes: BTreeSet<String>,
}

/// Scripted cluster.
///
/// App states are served in order per `(service, app)` and the last one
/// sticks. Unknown or deleted apps answer 404.
#[derive(Debug, Clone, Default)]
pub struct MockClusterApi {
    state: Arc<Mutex<ClusterState>>,
}

fn not_found(method: &str, what: &str) -> DrillError {
    DrillError::Http {
        method: method.to_string(),
        url: format!("mock://{what}"),
        status: 404,
        body: "not found".to_string(),
    }
}

fn key(service: &str, app: &str) -> (String, String) {
    (
        service.trim_matches('/').to_string(),
        app.trim_matches('/').to_string(),
    )
}

impl MockClusterApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ClusterState) -> R) -> R {
        let mut state = self.state.lock().expect("cluster mock mutex poisoned");
        f(&mut state)
    }

    /// App state with one running task.
    pub fn app_with_task(app_id: &str, task_id: &str, host: &str) -> AppState {
        AppState {
            id: format!("/{}", app_id.trim_matches('/')),
            instances: Some(1),
            tasks: vec![TaskInstance {
                id: task_id.to_string(),
                host: Some(host.to_string()),
                state: Some(TaskInstance::RUNNING.to_string()),
                started_at: None,
            }],
        }
    }

    /// Append states served by `get_app(service, app)`.
    pub fn script_app(&self, service: &str, app: &str, states: impl IntoIterator<Item = AppState>) {
        self.with_state(|s| {
            s.apps
                .entry(key(service, app))
                .or_default()
                .extend(states);
        });
    }

    pub fn set_agents(&self, agents: Vec<AgentInfo>) {
        self.with_state(|s| s.agents = agents);
    }

    /// Mark a package installed without going through `install`.
    pub fn mark_installed(&self, package: &str) {
        self.with_state(|s| {
            s.installed.insert(package.to_string());
        });
    }

    pub fn add_coordination_node(&self, path: &str) {
        self.with_state(|s| {
            s.coordination_nodes.insert(path.trim_matches('/').to_string());
        });
    }

    /// The next `count` reachability probes fail.
    pub fn unreachable_for(&self, count: u32) {
        self.with_state(|s| s.unreachable_probes = count);
    }

    pub fn install_never_completes(&self) {
        self.with_state(|s| s.install_never_completes = true);
    }

    pub fn fail_deploy_with(&self, status: u16) {
        self.with_state(|s| s.deploy_error = Some(status));
    }

    pub fn fail_uninstall_with(&self, status: u16) {
        self.with_state(|s| s.uninstall_error = Some(status));
    }

    pub fn is_installed(&self, package: &str) -> bool {
        self.with_state(|s| s.installed.contains(package))
    }

    pub fn has_coordination_node(&self, path: &str) -> bool {
        self.with_state(|s| s.coordination_nodes.contains(path.trim_matches('/')))
    }

    #[must_use]
    pub fn calls(&self) -> Vec<ClusterCall> {
        self.with_state(|s| s.calls.clone())
    }
}

impl ClusterApi for MockClusterApi {
    async fn install(&self, package: &str, timeout: Duration) -> DrillResult<()> {
        self.with_state(|s| {
            s.calls.push(ClusterCall::Install(package.to_string()));
            if s.install_never_completes {
                return Err(DrillError::Install {
                    package: package.to_string(),
                    waited: timeout,
                });
            }
            s.installed.insert(package.to_string());
            Ok(())
        })
    }

    async fn package_installed(&self, package: &str) -> DrillResult<bool> {
        self.with_state(|s| {
            s.calls.push(ClusterCall::PackageInstalled(package.to_string()));
            Ok(s.installed.contains(package))
        })
    }

    async fn uninstall(&self, package: &str, _timeout: Duration) -> DrillResult<bool> {
        self.with_state(|s| {
            s.calls.push(ClusterCall::Uninstall(package.to_string()));
            if !s.installed.contains(package) {
                return Ok(false);
            }
            if let Some(status) = s.uninstall_error {
                return Err(DrillError::Http {
                    method: "POST".to_string(),
                    url: "mock:///package/uninstall".to_string(),
                    status,
                    body: "scripted failure".to_string(),
                });
            }
            s.installed.remove(package);
            Ok(true)
        })
    }

    async fn deploy(&self, service_id: &str, descriptor: &Value) -> DrillResult<()> {
        let app = descriptor
            .get("id")
            .and_then(Value::as_str)
            .map(|id| id.trim_matches('/').to_string());
        self.with_state(|s| {
            s.calls.push(ClusterCall::Deploy {
                service: service_id.to_string(),
                app: app.clone(),
            });
            if let Some(status) = s.deploy_error {
                return Err(DrillError::Http {
                    method: "POST".to_string(),
                    url: format!("mock:///service/{service_id}/v2/apps"),
                    status,
                    body: "scripted failure".to_string(),
                });
            }
            if let Some(app) = app {
                s.deleted_apps.remove(&key(service_id, &app));
            }
            Ok(())
        })
    }

    async fn get_app(&self, service_id: &str, app_id: &str) -> DrillResult<AppState> {
        self.with_state(|s| {
            s.calls.push(ClusterCall::GetApp {
                service: service_id.to_string(),
                app: app_id.to_string(),
            });
            let k = key(service_id, app_id);
            if s.deleted_apps.contains(&k) {
                return Err(not_found("GET", app_id));
            }
            match s.apps.get_mut(&k) {
                Some(states) if states.len() > 1 => Ok(states.remove(0)),
                Some(states) => states.first().cloned().ok_or_else(|| not_found("GET", app_id)),
                None => Err(not_found("GET", app_id)),
            }
        })
    }

    async fn delete_app(&self, service_id: &str, app_id: &str) -> DrillResult<bool> {
        self.with_state(|s| {
            s.calls.push(ClusterCall::DeleteApp {
                service: service_id.to_string(),
                app: app_id.to_string(),
            });
            let k = key(service_id, app_id);
            if !s.apps.contains_key(&k) || s.deleted_apps.contains(&k) {
                return Ok(false);
            }
            s.deleted_apps.insert(k);
            Ok(true)
        })
    }

    async fn service_reachable(&self, service_id: &str) -> DrillResult<()> {
        self.with_state(|s| {
            s.calls
                .push(ClusterCall::ServiceReachable(service_id.to_string()));
            if s.unreachable_probes > 0 {
                s.unreachable_probes -= 1;
                return Err(DrillError::Http {
                    method: "GET".to_string(),
                    url: format!("mock:///service/{service_id}/"),
                    status: 503,
                    body: String::new(),
                });
            }
            Ok(())
        })
    }

    async fn private_agents(&self) -> DrillResult<Vec<AgentInfo>> {
        self.with_state(|s| {
            s.calls.push(ClusterCall::PrivateAgents);
            Ok(s.agents.iter().filter(|a| !a.public).cloned().collect())
        })
    }

    async fn delete_coordination_node(&self, path: &str) -> DrillResult<bool> {
        self.with_state(|s| {
            s.calls
                .push(ClusterCall::DeleteCoordinationNode(path.to_string()));
            Ok(s.coordination_nodes.remove(path.trim_matches('/')))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_app_states_last_one_sticks() {
        let api = MockClusterApi::new();
        let mut pending = MockClusterApi::app_with_task("sleep", "t1", "10.0.1.5");
        pending.tasks.clear();
        api.script_app(
            "marathon-user",
            "sleep",
            [pending, MockClusterApi::app_with_task("sleep", "t1", "10.0.1.5")],
        );

        assert!(api.get_app("marathon-user", "sleep").await.unwrap().tasks.is_empty());
        for _ in 0..3 {
            let app = api.get_app("marathon-user", "/sleep").await.unwrap();
            assert_eq!(app.first_task().unwrap().id, "t1");
        }
    }

    #[tokio::test]
    async fn test_deleted_app_answers_not_found() {
        let api = MockClusterApi::new();
        api.script_app(
            "marathon-user",
            "sleep",
            [MockClusterApi::app_with_task("sleep", "t1", "10.0.1.5")],
        );

        assert!(api.delete_app("marathon-user", "sleep").await.unwrap());
        assert!(!api.delete_app("marathon-user", "sleep").await.unwrap());
        let err = api.get_app("marathon-user", "sleep").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_remote_failure_rule_matches_host_and_command() {
        let remote = MockRemoteExecutor::new();
        remote.fail_on(HostSelector::agent("a"), "fail");

        assert!(remote.run(&HostSelector::agent("a"), "sh x.sh fail").await.is_err());
        assert!(remote.run(&HostSelector::agent("a"), "sh x.sh").await.is_ok());
        assert!(remote.run(&HostSelector::agent("b"), "sh x.sh fail").await.is_ok());
        assert_eq!(remote.commands_on(&HostSelector::agent("a")).len(), 2);

        remote.clear_failures();
        assert!(remote.run(&HostSelector::agent("a"), "sh x.sh fail").await.is_ok());
    }
}
