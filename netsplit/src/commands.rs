//! Subcommand implementations.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use netsplit_common::{
    CleanupOutcome, ClusterClient, DrillConfig, FaultInjector, Host, ScenarioRunner, SshExecutor,
};
use tracing::{info, warn};

/// Upper bound for a single HTTP request against the cluster.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn cluster_client(config: &DrillConfig) -> Result<ClusterClient> {
    Ok(ClusterClient::new(config.endpoint(), REQUEST_TIMEOUT)?
        .with_poll_policy(config.poll_policy()))
}

fn ssh_executor(config: &DrillConfig) -> Result<SshExecutor> {
    Ok(SshExecutor::new(config.ssh_config()?))
}

fn runner(
    config: &DrillConfig,
    bounce_master: bool,
) -> Result<ScenarioRunner<SshExecutor, ClusterClient>> {
    let spec = config.scenario_spec(bounce_master)?;
    Ok(ScenarioRunner::new(
        spec,
        ssh_executor(config)?,
        cluster_client(config)?,
        config.poll_policy(),
    ))
}

fn injector(config: &DrillConfig) -> Result<FaultInjector<SshExecutor>> {
    let spec = config.scenario_spec(false)?;
    Ok(FaultInjector::new(
        ssh_executor(config)?,
        spec.partition_script,
        spec.master_restart_command,
    ))
}

fn host_set(hosts: &[String]) -> BTreeSet<Host> {
    hosts.iter().map(|h| Host::from(h.as_str())).collect()
}

pub async fn run(config: &DrillConfig, bounce_master: bool, report_path: Option<&Path>) -> Result<()> {
    let mut runner = runner(config, bounce_master)?;
    let result = runner.run().await;
    let report = runner.into_report();

    if let Some(path) = report_path {
        report
            .write_json(path)
            .with_context(|| format!("writing report to {}", path.display()))?;
        info!(path = %path.display(), "Report written");
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    result.with_context(|| format!("scenario {} failed", report.scenario))?;
    println!("PASS {} (task {})", report.scenario, report.final_task_id.unwrap_or_default());
    Ok(())
}

pub async fn preflight(config: &DrillConfig) -> Result<()> {
    let runner = runner(config, false)?;
    let agents = runner.preflight().await?;
    for agent in &agents {
        println!("{}", agent.hostname);
    }
    println!("{} private agents available", agents.len());
    Ok(())
}

pub async fn partition(config: &DrillConfig, hosts: &[String]) -> Result<()> {
    let mut injector = injector(config)?;
    let targets = host_set(hosts);
    if let Err(e) = injector.partition(&targets).await {
        let stuck: Vec<String> = injector
            .partitioned_hosts()
            .iter()
            .map(Host::to_string)
            .collect();
        warn!(hosts = ?stuck, "Partition incomplete; run `netsplit heal` for these hosts");
        return Err(e.into());
    }
    println!("partitioned: {}", hosts.join(", "));
    Ok(())
}

pub async fn heal(config: &DrillConfig, hosts: &[String]) -> Result<()> {
    let mut injector = injector(config)?;
    injector.heal(&host_set(hosts)).await?;
    println!("healed: {}", hosts.join(", "));
    Ok(())
}

pub async fn restart_master(config: &DrillConfig) -> Result<()> {
    injector(config)?.restart_master_process().await?;
    println!("master restart issued");
    Ok(())
}

pub async fn teardown(config: &DrillConfig) -> Result<()> {
    let mut runner = runner(config, false)?;
    let steps = runner.teardown().await;
    let mut failed = 0;
    for step in &steps {
        match step.outcome {
            CleanupOutcome::Done => println!("{:<26} done", step.name),
            CleanupOutcome::NoOp => println!("{:<26} nothing to do", step.name),
            CleanupOutcome::Failed(ref reason) => {
                failed += 1;
                println!("{:<26} FAILED: {reason}", step.name);
            }
        }
    }
    if failed > 0 {
        bail!("{failed} cleanup step(s) failed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_set_dedups_and_orders() {
        let hosts = host_set(&[
            "10.0.1.21".to_string(),
            "10.0.1.20".to_string(),
            "10.0.1.21".to_string(),
        ]);
        let ordered: Vec<&str> = hosts.iter().map(Host::as_str).collect();
        assert_eq!(ordered, vec!["10.0.1.20", "10.0.1.21"]);
    }

    #[test]
    fn test_runner_requires_master_host() {
        let mut config = DrillConfig::default();
        config.cluster.url = "https://dcos.example.com".to_string();
        assert!(runner(&config, false).is_err());

        config.ssh.master_host = Some("10.0.0.1".to_string());
        let runner = runner(&config, true).unwrap();
        assert!(runner.spec().bounce_master);
    }
}
