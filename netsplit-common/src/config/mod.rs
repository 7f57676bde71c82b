//! Configuration system for netsplit.
//!
//! A drill is configured from three layers, later layers winning:
//! - built-in defaults matching the stock Marathon-on-Marathon drill
//! - an optional TOML file (`--config`, or `~/.config/netsplit/config.toml`)
//! - `NETSPLIT_*` environment variables
//!
//! Durations are written in human-readable form (`120s`, `2m`, `1h 30m`).

pub mod env;
pub mod source;

pub use env::{EnvError, EnvParser};
pub use source::{ConfigSource, Sourced};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::errors::{DrillError, DrillResult};
use crate::fixtures;
use crate::poll::PollPolicy;
use crate::remote::SshConfig;
use crate::scenario::ScenarioSpec;
use crate::types::ClusterEndpoint;

/// Serde adapter for `humantime` durations.
pub(crate) mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
    }
}

/// Full drill configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DrillConfig {
    pub cluster: ClusterSection,
    pub ssh: SshSection,
    pub scenario: ScenarioSection,
    /// `section.key` names present in the parsed TOML.
    #[serde(skip)]
    file_keys: BTreeSet<String>,
    /// Where each overridable setting came from, filled by [`DrillConfig::apply_env`].
    #[serde(skip)]
    sources: BTreeMap<&'static str, ConfigSource>,
}

/// `[cluster]`: where the cluster's HTTP APIs live.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    pub url: String,
    pub token: Option<String>,
}

/// `[ssh]`: how remote commands reach the master and agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSection {
    pub user: String,
    pub master_host: Option<String>,
    pub identity_file: Option<PathBuf>,
    #[serde(with = "duration_str")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_str")]
    pub command_timeout: Duration,
}

impl Default for SshSection {
    fn default() -> Self {
        Self {
            user: "core".to_string(),
            master_host: None,
            identity_file: None,
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(120),
        }
    }
}

/// `[scenario]`: what to deploy, what to break, and how long to wait.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioSection {
    pub package_name: String,
    pub service_id: String,
    pub app_id: String,
    pub root_service: String,
    pub fixture_dir: Option<PathBuf>,
    pub descriptor: String,
    pub partition_script: String,
    #[serde(with = "duration_str")]
    pub partition_settle: Duration,
    #[serde(with = "duration_str")]
    pub heal_settle: Duration,
    #[serde(with = "duration_str")]
    pub teardown_settle: Duration,
    #[serde(with = "duration_str")]
    pub convergence_timeout: Duration,
    #[serde(with = "duration_str")]
    pub install_timeout: Duration,
    #[serde(with = "duration_str")]
    pub poll_interval: Duration,
    pub master_restart_command: String,
    pub coordination_node: String,
    pub min_private_agents: u32,
}

impl Default for ScenarioSection {
    fn default() -> Self {
        Self {
            package_name: "marathon".to_string(),
            service_id: "marathon-user".to_string(),
            app_id: "sleep".to_string(),
            root_service: "marathon".to_string(),
            fixture_dir: None,
            descriptor: fixtures::WORKLOAD_DESCRIPTOR.to_string(),
            partition_script: fixtures::PARTITION_SCRIPT.to_string(),
            partition_settle: Duration::from_secs(120),
            heal_settle: Duration::from_secs(120),
            teardown_settle: Duration::from_secs(15),
            convergence_timeout: Duration::from_secs(600),
            install_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(5),
            master_restart_command: "sudo systemctl restart dcos-mesos-master".to_string(),
            coordination_node: "universe/marathon-user".to_string(),
            min_private_agents: 2,
        }
    }
}

impl DrillConfig {
    /// Default config file location (`~/.config/netsplit/config.toml`).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("netsplit").join("config.toml"))
    }

    /// Parse a TOML document.
    pub fn from_toml_str(raw: &str) -> DrillResult<Self> {
        let invalid = |e: toml::de::Error| DrillError::Config(format!("invalid TOML: {e}"));
        let mut config: Self = toml::from_str(raw).map_err(invalid)?;
        let table: toml::Table = toml::from_str(raw).map_err(invalid)?;
        for (section, value) in &table {
            if let Some(keys) = value.as_table() {
                config
                    .file_keys
                    .extend(keys.keys().map(|key| format!("{section}.{key}")));
            }
        }
        Ok(config)
    }

    /// Load file (explicit path, else the default location if present), then
    /// apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> DrillResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.is_file()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };

        let mut parser = EnvParser::new();
        config.apply_env(&mut parser);
        if parser.has_errors() {
            let messages: Vec<String> = parser
                .take_errors()
                .into_iter()
                .map(|e| e.to_string())
                .collect();
            return Err(DrillError::Config(messages.join("; ")));
        }

        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> DrillResult<Self> {
        debug!(path = %path.display(), "Loading config file");
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DrillError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Overlay `NETSPLIT_*` environment variables.
    pub fn apply_env(&mut self, parser: &mut EnvParser) {
        let v = parser.string(
            "CLUSTER_URL",
            self.origin("cluster.url", self.cluster.url.clone()),
        );
        self.cluster.url = self.track("cluster.url", v);
        let v = parser.optional_string(
            "AUTH_TOKEN",
            self.origin("cluster.token", self.cluster.token.clone()),
        );
        self.cluster.token = self.track("cluster.token", v);

        let v = parser.string("SSH_USER", self.origin("ssh.user", self.ssh.user.clone()));
        self.ssh.user = self.track("ssh.user", v);
        let v = parser.optional_string(
            "MASTER_HOST",
            self.origin("ssh.master_host", self.ssh.master_host.clone()),
        );
        self.ssh.master_host = self.track("ssh.master_host", v);
        let v = parser.path(
            "SSH_IDENTITY",
            self.origin("ssh.identity_file", self.ssh.identity_file.clone()),
        );
        self.ssh.identity_file = self.track("ssh.identity_file", v);
        let v = parser.duration(
            "SSH_CONNECT_TIMEOUT",
            self.origin("ssh.connect_timeout", self.ssh.connect_timeout),
        );
        self.ssh.connect_timeout = self.track("ssh.connect_timeout", v);
        let v = parser.duration(
            "SSH_COMMAND_TIMEOUT",
            self.origin("ssh.command_timeout", self.ssh.command_timeout),
        );
        self.ssh.command_timeout = self.track("ssh.command_timeout", v);

        let v = parser.string(
            "PACKAGE",
            self.origin("scenario.package_name", self.scenario.package_name.clone()),
        );
        self.scenario.package_name = self.track("scenario.package_name", v);
        let v = parser.string(
            "SERVICE_ID",
            self.origin("scenario.service_id", self.scenario.service_id.clone()),
        );
        self.scenario.service_id = self.track("scenario.service_id", v);
        let v = parser.string(
            "APP_ID",
            self.origin("scenario.app_id", self.scenario.app_id.clone()),
        );
        self.scenario.app_id = self.track("scenario.app_id", v);
        let v = parser.path(
            "FIXTURE_DIR",
            self.origin("scenario.fixture_dir", self.scenario.fixture_dir.clone()),
        );
        self.scenario.fixture_dir = self.track("scenario.fixture_dir", v);

        let durations: [(&'static str, &str, fn(&mut ScenarioSection) -> &mut Duration); 6] = [
            ("scenario.partition_settle", "PARTITION_SETTLE", |s| &mut s.partition_settle),
            ("scenario.heal_settle", "HEAL_SETTLE", |s| &mut s.heal_settle),
            ("scenario.teardown_settle", "TEARDOWN_SETTLE", |s| &mut s.teardown_settle),
            ("scenario.convergence_timeout", "CONVERGENCE_TIMEOUT", |s| &mut s.convergence_timeout),
            ("scenario.install_timeout", "INSTALL_TIMEOUT", |s| &mut s.install_timeout),
            ("scenario.poll_interval", "POLL_INTERVAL", |s| &mut s.poll_interval),
        ];
        for (key, var, field) in durations {
            let current = *field(&mut self.scenario);
            let v = parser.duration(var, self.origin(key, current));
            *field(&mut self.scenario) = self.track(key, v);
        }

        let v = parser.bounded_u32(
            "MIN_PRIVATE_AGENTS",
            self.origin("scenario.min_private_agents", self.scenario.min_private_agents),
            0..=1000,
        );
        self.scenario.min_private_agents = self.track("scenario.min_private_agents", v);
    }

    /// The current value of `key`, tagged as coming from the file or the defaults.
    fn origin<T>(&self, key: &str, value: T) -> Sourced<T> {
        if self.file_keys.contains(key) {
            Sourced::from_file(value)
        } else {
            Sourced::default_value(value)
        }
    }

    fn track<T>(&mut self, key: &'static str, sourced: Sourced<T>) -> T {
        self.sources.insert(key, sourced.source);
        sourced.value
    }

    /// Source of every setting [`DrillConfig::apply_env`] looked at.
    pub fn sources(&self) -> &BTreeMap<&'static str, ConfigSource> {
        &self.sources
    }

    /// Source of one setting, by `section.key` name.
    pub fn source_of(&self, key: &str) -> ConfigSource {
        self.sources.get(key).copied().unwrap_or(ConfigSource::Default)
    }

    /// Reject configurations that cannot drive a drill.
    pub fn validate(&self) -> DrillResult<()> {
        let mut problems = Vec::new();
        if self.cluster.url.trim().is_empty() {
            problems.push("cluster.url is not set (NETSPLIT_CLUSTER_URL)".to_string());
        }
        if self
            .ssh
            .master_host
            .as_deref()
            .is_none_or(|h| h.trim().is_empty())
        {
            problems.push("ssh.master_host is not set (NETSPLIT_MASTER_HOST)".to_string());
        }
        if self.scenario.service_id.trim().is_empty() || self.scenario.app_id.trim().is_empty() {
            problems.push("scenario.service_id and scenario.app_id must be non-empty".to_string());
        }
        if self.scenario.poll_interval.is_zero() {
            problems.push("scenario.poll_interval must be greater than zero".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(DrillError::Config(problems.join("; ")))
        }
    }

    pub fn endpoint(&self) -> ClusterEndpoint {
        ClusterEndpoint::new(self.cluster.url.clone(), self.cluster.token.clone())
    }

    pub fn ssh_config(&self) -> DrillResult<SshConfig> {
        let master_host = self
            .ssh
            .master_host
            .clone()
            .ok_or_else(|| DrillError::Config("ssh.master_host is not set".to_string()))?;
        Ok(SshConfig {
            user: self.ssh.user.clone(),
            master_host,
            identity_file: self.ssh.identity_file.clone(),
            connect_timeout: self.ssh.connect_timeout,
            command_timeout: self.ssh.command_timeout,
        })
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy::fixed(self.scenario.poll_interval)
    }

    /// Build the scenario definition, resolving fixture files on disk.
    pub fn scenario_spec(&self, bounce_master: bool) -> DrillResult<ScenarioSpec> {
        let s = &self.scenario;
        let dir = s
            .fixture_dir
            .clone()
            .unwrap_or_else(fixtures::default_fixture_dir);
        let name = if bounce_master {
            "network_failure_bounce_master"
        } else {
            "network_failure"
        };
        Ok(ScenarioSpec {
            name: name.to_string(),
            package_name: s.package_name.clone(),
            service_id: s.service_id.clone(),
            app_id: s.app_id.clone(),
            root_service: s.root_service.clone(),
            descriptor: fixtures::resolve(&dir, &s.descriptor)?,
            partition_script: fixtures::resolve(&dir, &s.partition_script)?,
            bounce_master,
            master_restart_command: s.master_restart_command.clone(),
            partition_settle: s.partition_settle,
            heal_settle: s.heal_settle,
            teardown_settle: s.teardown_settle,
            convergence_timeout: s.convergence_timeout,
            install_timeout: s.install_timeout,
            coordination_node: s.coordination_node.clone(),
            min_private_agents: s.min_private_agents,
        })
    }
}

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
