//! Core domain types shared by every drill component.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Agent hostname or IP address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Host(String);

impl Host {
    pub fn new(host: impl Into<String>) -> Self {
        Self(host.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Host {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Host {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Target of a remote command: the leading master or one agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "host")]
pub enum HostSelector {
    Master,
    Agent(Host),
}

impl HostSelector {
    pub fn agent(host: impl Into<Host>) -> Self {
        Self::Agent(host.into())
    }
}

impl fmt::Display for HostSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Master => write!(f, "master"),
            Self::Agent(host) => write!(f, "agent:{host}"),
        }
    }
}

/// Connectivity of a host as last driven by the fault injector.
///
/// The real state is never observed directly; it is whatever the partition
/// script was last asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostPartitionState {
    #[default]
    Connected,
    Partitioned,
}

/// Address and credentials used to reach the cluster's HTTP APIs.
///
/// Resolved once at startup and passed to every component.
#[derive(Clone, PartialEq, Eq)]
pub struct ClusterEndpoint {
    base_url: String,
    token: Option<String>,
}

impl ClusterEndpoint {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let token = token.filter(|t| !t.trim().is_empty());
        Self { base_url, token }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Admin-router URL of a service, e.g. `<base>/service/marathon-user`.
    pub fn service_url(&self, service_id: &str) -> String {
        format!(
            "{}/service/{}",
            self.base_url,
            service_id.trim_matches('/')
        )
    }

    /// URL under the cluster root, e.g. `<base>/package/list`.
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Value for the `Authorization` header, when a token is configured.
    pub fn auth_header(&self) -> Option<String> {
        self.token.as_ref().map(|t| format!("token={t}"))
    }
}

// Keeps the token out of logs.
impl fmt::Debug for ClusterEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterEndpoint")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Envelope returned by `GET /v2/apps/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppResponse {
    pub app: AppState,
}

/// Scheduler view of one workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppState {
    pub id: String,
    #[serde(default)]
    pub instances: Option<u32>,
    #[serde(default)]
    pub tasks: Vec<TaskInstance>,
}

impl AppState {
    /// The task whose identity the drill tracks.
    pub fn first_task(&self) -> Option<&TaskInstance> {
        self.tasks.first()
    }

    pub fn has_running_task(&self) -> bool {
        self.tasks.iter().any(TaskInstance::is_running)
    }
}

/// One running unit of a workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInstance {
    pub id: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub started_at: Option<String>,
}

impl TaskInstance {
    pub const RUNNING: &'static str = "TASK_RUNNING";

    /// Older schedulers omit `state`; a task with `startedAt` is running there.
    pub fn is_running(&self) -> bool {
        match self.state.as_deref() {
            Some(state) => state == Self::RUNNING,
            None => self.started_at.is_some(),
        }
    }
}

/// One agent registered with the resource manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub hostname: String,
    pub public: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_urls() {
        let endpoint = ClusterEndpoint::new("https://dcos.example.com/", Some("abc".to_string()));
        assert_eq!(endpoint.base_url(), "https://dcos.example.com");
        assert_eq!(
            endpoint.service_url("marathon-user"),
            "https://dcos.example.com/service/marathon-user"
        );
        assert_eq!(
            endpoint.service_url("/marathon-user/"),
            "https://dcos.example.com/service/marathon-user"
        );
        assert_eq!(
            endpoint.url("/package/list"),
            "https://dcos.example.com/package/list"
        );
        assert_eq!(endpoint.auth_header().as_deref(), Some("token=abc"));
    }

    #[test]
    fn test_endpoint_without_token_is_anonymous() {
        let endpoint = ClusterEndpoint::new("http://localhost", None);
        assert!(endpoint.auth_header().is_none());

        let blank = ClusterEndpoint::new("http://localhost", Some("  ".to_string()));
        assert!(blank.token().is_none());
    }

    #[test]
    fn test_endpoint_debug_redacts_token() {
        let endpoint = ClusterEndpoint::new("http://localhost", Some("secret".to_string()));
        let debug = format!("{endpoint:?}");
        assert!(!debug.contains("secret"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_app_response_parses_scheduler_json() {
        let raw = r#"{
            "app": {
                "id": "/sleep",
                "instances": 1,
                "cmd": "sleep 100000000",
                "tasks": [
                    {
                        "id": "sleep.5f1c3a2e-0c1b-11e6-a1b2-0242ac110002",
                        "host": "10.0.1.12",
                        "state": "TASK_RUNNING",
                        "startedAt": "2016-05-01T10:00:00.000Z",
                        "ports": [10000]
                    }
                ]
            }
        }"#;
        let parsed: AppResponse = serde_json::from_str(raw).unwrap();
        let task = parsed.app.first_task().unwrap();
        assert_eq!(task.id, "sleep.5f1c3a2e-0c1b-11e6-a1b2-0242ac110002");
        assert_eq!(task.host.as_deref(), Some("10.0.1.12"));
        assert!(parsed.app.has_running_task());
    }

    #[test]
    fn test_task_running_detection() {
        let staged = TaskInstance {
            id: "t".to_string(),
            host: None,
            state: Some("TASK_STAGING".to_string()),
            started_at: None,
        };
        assert!(!staged.is_running());

        let legacy = TaskInstance {
            state: None,
            started_at: Some("2016-05-01T10:00:00.000Z".to_string()),
            ..staged.clone()
        };
        assert!(legacy.is_running());

        let app = AppState {
            id: "/sleep".to_string(),
            instances: Some(1),
            tasks: vec![],
        };
        assert!(!app.has_running_task());
        assert!(app.first_task().is_none());
    }

    #[test]
    fn test_host_selector_display() {
        assert_eq!(HostSelector::Master.to_string(), "master");
        assert_eq!(HostSelector::agent("10.0.0.4").to_string(), "agent:10.0.0.4");
        assert_eq!(HostPartitionState::default(), HostPartitionState::Connected);
    }
}
