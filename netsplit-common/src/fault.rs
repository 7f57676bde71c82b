//! Partitioning and healing hosts with the partition script.
//!
//! Each host is handled by its own remote calls; there is no atomicity across
//! hosts and nothing is rolled back when one of them fails. A host is
//! recorded as partitioned as soon as its fail command is issued, so
//! [`FaultInjector::heal_all`] covers hosts whose command errored midway.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::errors::DrillResult;
use crate::remote::{RemoteExecutor, script_invocation};
use crate::types::{Host, HostPartitionState, HostSelector};

/// Argument that makes the partition script drop traffic.
pub const FAIL_ARG: &str = "fail";

pub struct FaultInjector<E> {
    executor: E,
    script: PathBuf,
    restart_command: String,
    hosts: BTreeMap<Host, HostPartitionState>,
}

impl<E: RemoteExecutor> FaultInjector<E> {
    pub fn new(executor: E, script: impl Into<PathBuf>, restart_command: impl Into<String>) -> Self {
        Self {
            executor,
            script: script.into(),
            restart_command: restart_command.into(),
            hosts: BTreeMap::new(),
        }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn script(&self) -> &Path {
        &self.script
    }

    /// Last state the injector drove `host` to.
    pub fn state(&self, host: &Host) -> HostPartitionState {
        self.hosts.get(host).copied().unwrap_or_default()
    }

    pub fn partitioned_hosts(&self) -> BTreeSet<Host> {
        self.hosts
            .iter()
            .filter(|(_, state)| **state == HostPartitionState::Partitioned)
            .map(|(host, _)| host.clone())
            .collect()
    }

    /// Stage the script on each host and cut it off, keeping loopback and SSH.
    ///
    /// Stops at the first failing host.
    pub async fn partition(&mut self, hosts: &BTreeSet<Host>) -> DrillResult<()> {
        let command = script_invocation(&self.script, &[FAIL_ARG]);
        for host in hosts {
            let target = HostSelector::Agent(host.clone());
            self.executor.copy(&target, &self.script).await?;
            self.hosts
                .insert(host.clone(), HostPartitionState::Partitioned);
            info!(%host, "Partitioning host");
            self.executor.run(&target, &command).await?;
        }
        Ok(())
    }

    /// Restore full connectivity on each host.
    ///
    /// Stops at the first failing host; hosts not reached keep their state.
    pub async fn heal(&mut self, hosts: &BTreeSet<Host>) -> DrillResult<()> {
        let command = script_invocation(&self.script, &[]);
        for host in hosts {
            let target = HostSelector::Agent(host.clone());
            info!(%host, "Healing host");
            self.executor.run(&target, &command).await?;
            self.hosts.insert(host.clone(), HostPartitionState::Connected);
        }
        Ok(())
    }

    /// Heal every host still believed partitioned, continuing past failures.
    ///
    /// Returns the hosts that could not be healed with their error message.
    pub async fn heal_all(&mut self) -> Vec<(Host, String)> {
        let command = script_invocation(&self.script, &[]);
        let mut failures = Vec::new();
        for host in self.partitioned_hosts() {
            let target = HostSelector::Agent(host.clone());
            info!(%host, "Healing host");
            match self.executor.run(&target, &command).await {
                Ok(_) => {
                    self.hosts.insert(host, HostPartitionState::Connected);
                }
                Err(e) => {
                    warn!(%host, "Failed to heal host: {e}");
                    failures.push((host, e.to_string()));
                }
            }
        }
        failures
    }

    /// Restart the leading master process.
    pub async fn restart_master_process(&self) -> DrillResult<()> {
        info!(command = %self.restart_command, "Restarting master process");
        self.executor
            .run(&HostSelector::Master, &self.restart_command)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DrillError;
    use crate::mock::{MockRemoteExecutor, RemoteCall};

    fn hosts(names: &[&str]) -> BTreeSet<Host> {
        names.iter().map(|n| Host::from(*n)).collect()
    }

    fn injector(executor: MockRemoteExecutor) -> FaultInjector<MockRemoteExecutor> {
        FaultInjector::new(
            executor,
            "/fixtures/net-services-agent.sh",
            "sudo systemctl restart dcos-mesos-master",
        )
    }

    #[tokio::test]
    async fn test_partition_stages_script_then_fails_host() {
        let executor = MockRemoteExecutor::new();
        let mut injector = injector(executor.clone());

        injector.partition(&hosts(&["10.0.1.5"])).await.unwrap();

        assert_eq!(
            executor.calls(),
            vec![
                RemoteCall::Copy {
                    host: HostSelector::agent("10.0.1.5"),
                    path: PathBuf::from("/fixtures/net-services-agent.sh"),
                },
                RemoteCall::Run {
                    host: HostSelector::agent("10.0.1.5"),
                    command: "sh net-services-agent.sh fail".to_string(),
                },
            ]
        );
        assert_eq!(
            injector.state(&Host::from("10.0.1.5")),
            HostPartitionState::Partitioned
        );
    }

    #[tokio::test]
    async fn test_heal_restores_exactly_partitioned_hosts() {
        let executor = MockRemoteExecutor::new();
        let mut injector = injector(executor.clone());
        let targets = hosts(&["10.0.1.5", "10.0.1.6"]);

        injector.partition(&targets).await.unwrap();
        assert_eq!(injector.partitioned_hosts(), targets);

        injector.heal(&targets).await.unwrap();
        assert!(injector.partitioned_hosts().is_empty());
        assert_eq!(
            injector.state(&Host::from("10.0.1.7")),
            HostPartitionState::Connected
        );

        let heal_runs: Vec<_> = executor
            .calls()
            .into_iter()
            .filter(|c| matches!(c, RemoteCall::Run { command, .. } if command == "sh net-services-agent.sh"))
            .collect();
        assert_eq!(heal_runs.len(), 2);
    }

    #[tokio::test]
    async fn test_partial_partition_failure_is_not_rolled_back() {
        let executor = MockRemoteExecutor::new();
        executor.fail_on(HostSelector::agent("10.0.1.6"), "fail");
        let mut injector = injector(executor.clone());

        let err = injector
            .partition(&hosts(&["10.0.1.5", "10.0.1.6"]))
            .await
            .unwrap_err();
        assert!(matches!(err, DrillError::RemoteExecution { .. }));

        // Both the succeeded and the errored host stay marked for healing.
        assert_eq!(
            injector.partitioned_hosts(),
            hosts(&["10.0.1.5", "10.0.1.6"])
        );
        assert!(
            !executor
                .calls()
                .iter()
                .any(|c| matches!(c, RemoteCall::Run { command, .. } if command == "sh net-services-agent.sh"))
        );
    }

    #[tokio::test]
    async fn test_heal_all_continues_past_failures() {
        let executor = MockRemoteExecutor::new();
        let mut injector = injector(executor.clone());
        injector
            .partition(&hosts(&["10.0.1.5", "10.0.1.6"]))
            .await
            .unwrap();

        executor.fail_on(HostSelector::agent("10.0.1.5"), "net-services-agent.sh");
        let failures = injector.heal_all().await;

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, Host::from("10.0.1.5"));
        assert_eq!(injector.partitioned_hosts(), hosts(&["10.0.1.5"]));
    }

    #[tokio::test]
    async fn test_restart_master_runs_on_master() {
        let executor = MockRemoteExecutor::new();
        let injector = injector(executor.clone());

        injector.restart_master_process().await.unwrap();
        assert_eq!(
            executor.calls(),
            vec![RemoteCall::Run {
                host: HostSelector::Master,
                command: "sudo systemctl restart dcos-mesos-master".to_string(),
            }]
        );
    }
}
