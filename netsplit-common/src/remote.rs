//! Remote command execution on cluster hosts via SSH.
//!
//! Commands run through the system `ssh` client; files are staged with `scp`.
//! Agents are reached through the master, which is the only host the drill
//! is assumed to have direct SSH access to. Retries are the caller's job.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::errors::{DrillError, DrillResult};
use crate::types::HostSelector;

/// Exit status `ssh`/`scp` use for their own connection failures.
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Output of a remote command that exited zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs commands and stages files on the master or an agent.
///
/// Non-zero exits and unreachable hosts are both reported as
/// [`DrillError::RemoteExecution`].
pub trait RemoteExecutor: Send + Sync {
    fn run(
        &self,
        host: &HostSelector,
        command: &str,
    ) -> impl Future<Output = DrillResult<CommandOutput>> + Send;

    /// Copy a local file into the login directory of `host`.
    fn copy(&self, host: &HostSelector, local_path: &Path)
    -> impl Future<Output = DrillResult<()>> + Send;
}

/// SSH connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshConfig {
    /// Login user on every host.
    pub user: String,
    /// Master address; also the jump host for agents.
    pub master_host: String,
    pub identity_file: Option<PathBuf>,
    pub connect_timeout: Duration,
    /// Upper bound for one remote command or copy.
    pub command_timeout: Duration,
}

/// [`RemoteExecutor`] backed by the system `ssh` and `scp` binaries.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    config: SshConfig,
    ssh_program: PathBuf,
    scp_program: PathBuf,
}

impl SshExecutor {
    pub fn new(config: SshConfig) -> Self {
        Self {
            config,
            ssh_program: PathBuf::from("ssh"),
            scp_program: PathBuf::from("scp"),
        }
    }

    /// Use alternative `ssh`/`scp` binaries.
    pub fn with_programs(mut self, ssh: impl Into<PathBuf>, scp: impl Into<PathBuf>) -> Self {
        self.ssh_program = ssh.into();
        self.scp_program = scp.into();
        self
    }

    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    fn destination(&self, host: &HostSelector) -> String {
        match host {
            HostSelector::Master => format!("{}@{}", self.config.user, self.config.master_host),
            HostSelector::Agent(agent) => format!("{}@{}", self.config.user, agent),
        }
    }

    /// Options shared by `ssh` and `scp`.
    fn common_options(&self, host: &HostSelector) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout.as_secs().max(1)),
        ];
        if let Some(ref identity) = self.config.identity_file {
            args.push("-i".to_string());
            args.push(identity.to_string_lossy().to_string());
        }
        if let Some(proxy) = self.proxy_command(host) {
            args.push("-o".to_string());
            args.push(format!("ProxyCommand={proxy}"));
        }
        args
    }

    /// Agents are reached by tunnelling through the master.
    fn proxy_command(&self, host: &HostSelector) -> Option<String> {
        match host {
            HostSelector::Master => None,
            HostSelector::Agent(_) => {
                let mut proxy = format!(
                    "ssh -o BatchMode=yes -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null -o ConnectTimeout={}",
                    self.config.connect_timeout.as_secs().max(1)
                );
                if let Some(ref identity) = self.config.identity_file {
                    proxy.push_str(&format!(" -i {}", identity.to_string_lossy()));
                }
                proxy.push_str(&format!(
                    " -W %h:%p {}@{}",
                    self.config.user, self.config.master_host
                ));
                Some(proxy)
            }
        }
    }

    fn ssh_args(&self, host: &HostSelector, command: &str) -> Vec<String> {
        let mut args = self.common_options(host);
        args.push(self.destination(host));
        args.push(command.to_string());
        args
    }

    fn scp_args(&self, host: &HostSelector, local_path: &Path) -> Vec<String> {
        let mut args = self.common_options(host);
        args.push(local_path.to_string_lossy().to_string());
        args.push(format!("{}:", self.destination(host)));
        args
    }

    async fn spawn(
        &self,
        program: &Path,
        args: &[String],
        host: &HostSelector,
        label: &str,
    ) -> DrillResult<CommandOutput> {
        let start = Instant::now();
        let mut cmd = Command::new(program);
        cmd.args(args).kill_on_drop(true);

        let result = tokio::time::timeout(self.config.command_timeout, cmd.output()).await;
        let output: Output = match result {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(DrillError::RemoteExecution {
                    host: host.to_string(),
                    command: label.to_string(),
                    exit_code: None,
                    stderr: format!("failed to spawn {}: {e}", program.display()),
                });
            }
            Err(_) => {
                warn!(%host, command = label, timeout = ?self.config.command_timeout, "Remote command timed out");
                return Err(DrillError::RemoteExecution {
                    host: host.to_string(),
                    command: label.to_string(),
                    exit_code: None,
                    stderr: format!("timed out after {:?}", self.config.command_timeout),
                });
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let duration = start.elapsed();

        if !output.status.success() {
            if exit_code == SSH_TRANSPORT_FAILURE {
                warn!(%host, command = label, "Host unreachable over SSH: {}", stderr.trim());
            } else {
                warn!(%host, command = label, exit_code, "Remote command failed: {}", stderr.trim());
            }
            return Err(DrillError::RemoteExecution {
                host: host.to_string(),
                command: label.to_string(),
                exit_code: Some(exit_code),
                stderr,
            });
        }

        debug!(
            %host,
            command = label,
            elapsed_ms = duration.as_millis() as u64,
            "Remote command output: {}",
            stdout.trim()
        );
        Ok(CommandOutput {
            exit_code,
            stdout,
            stderr,
            duration,
        })
    }
}

impl RemoteExecutor for SshExecutor {
    async fn run(&self, host: &HostSelector, command: &str) -> DrillResult<CommandOutput> {
        info!(%host, command, "Running remote command");
        let args = self.ssh_args(host, command);
        self.spawn(&self.ssh_program, &args, host, command).await
    }

    async fn copy(&self, host: &HostSelector, local_path: &Path) -> DrillResult<()> {
        if !local_path.is_file() {
            return Err(DrillError::Fixture(local_path.to_path_buf()));
        }
        info!(%host, path = %local_path.display(), "Copying file to host");
        let args = self.scp_args(host, local_path);
        let label = format!("scp {}", local_path.display());
        self.spawn(&self.scp_program, &args, host, &label)
            .await
            .map(|_| ())
    }
}

/// Shell command line invoking `script` (by file name) with optional arguments.
pub fn script_invocation(script: &Path, args: &[&str]) -> String {
    let name = script
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| script.to_string_lossy().to_string());
    let mut parts = vec![
        "sh".to_string(),
        shell_escape::escape(name.into()).to_string(),
    ];
    parts.extend(
        args.iter()
            .map(|a| shell_escape::escape((*a).into()).to_string()),
    );
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config(identity: Option<&str>) -> SshConfig {
        SshConfig {
            user: "core".to_string(),
            master_host: "10.0.0.1".to_string(),
            identity_file: identity.map(PathBuf::from),
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_ssh_args_master_with_identity() {
        let executor = SshExecutor::new(sample_config(Some("/tmp/key.pem")));
        let args = executor.ssh_args(&HostSelector::Master, "echo ok");

        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"ConnectTimeout=5".to_string()));
        assert!(args.contains(&"-i".to_string()));
        assert!(args.contains(&"/tmp/key.pem".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("ProxyCommand=")));
        assert_eq!(args[args.len() - 2], "core@10.0.0.1");
        assert_eq!(args.last(), Some(&"echo ok".to_string()));
    }

    #[test]
    fn test_ssh_args_agent_tunnels_through_master() {
        let executor = SshExecutor::new(sample_config(Some("/tmp/key.pem")));
        let args = executor.ssh_args(&HostSelector::agent("10.0.3.7"), "sh net-services-agent.sh");

        let proxy = args
            .iter()
            .find(|a| a.starts_with("ProxyCommand="))
            .expect("agent commands use a proxy");
        assert!(proxy.contains("-W %h:%p core@10.0.0.1"));
        assert!(proxy.contains("-i /tmp/key.pem"));
        assert_eq!(args[args.len() - 2], "core@10.0.3.7");
    }

    #[test]
    fn test_ssh_args_without_identity() {
        let executor = SshExecutor::new(sample_config(None));
        let args = executor.ssh_args(&HostSelector::agent("10.0.3.7"), "true");
        assert!(!args.contains(&"-i".to_string()));
        let proxy = args.iter().find(|a| a.starts_with("ProxyCommand=")).unwrap();
        assert!(!proxy.contains(" -i "));
    }

    #[test]
    fn test_scp_args_target_login_directory() {
        let executor = SshExecutor::new(sample_config(None));
        let args = executor.scp_args(
            &HostSelector::agent("10.0.3.7"),
            Path::new("/fixtures/net-services-agent.sh"),
        );
        assert_eq!(args[args.len() - 2], "/fixtures/net-services-agent.sh");
        assert_eq!(args.last(), Some(&"core@10.0.3.7:".to_string()));
    }

    #[test]
    fn test_script_invocation_uses_file_name() {
        let script = Path::new("/opt/fixtures/net-services-agent.sh");
        assert_eq!(script_invocation(script, &[]), "sh net-services-agent.sh");
        assert_eq!(
            script_invocation(script, &["fail"]),
            "sh net-services-agent.sh fail"
        );
        assert_eq!(
            script_invocation(Path::new("my script.sh"), &["a b"]),
            "sh 'my script.sh' 'a b'"
        );
    }

    #[cfg(unix)]
    mod fake_ssh {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        // Writing an executable while another test forks can fail with ETXTBSY.
        static SPAWN_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

        /// Writes an executable that echoes its last argument and exits with `code`.
        fn fake_program(dir: &Path, name: &str, code: i32) -> PathBuf {
            let path = dir.join(name);
            let body = format!(
                "#!/bin/sh\nfor last; do :; done\necho \"$last\"\necho oops >&2\nexit {code}\n"
            );
            std::fs::write(&path, body).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        #[tokio::test]
        async fn test_run_captures_stdout() {
            let _lock = SPAWN_LOCK.lock().await;
            let dir = tempfile::tempdir().unwrap();
            let ssh = fake_program(dir.path(), "ssh", 0);
            let scp = fake_program(dir.path(), "scp", 0);
            let executor = SshExecutor::new(sample_config(None)).with_programs(ssh, scp);

            let output = executor
                .run(&HostSelector::Master, "hostname")
                .await
                .unwrap();
            assert!(output.success());
            assert_eq!(output.stdout.trim(), "hostname");
        }

        #[tokio::test]
        async fn test_run_non_zero_exit_is_reported() {
            let _lock = SPAWN_LOCK.lock().await;
            let dir = tempfile::tempdir().unwrap();
            let ssh = fake_program(dir.path(), "ssh", 3);
            let scp = fake_program(dir.path(), "scp", 0);
            let executor = SshExecutor::new(sample_config(None)).with_programs(ssh, scp);

            let err = executor
                .run(&HostSelector::agent("10.0.3.7"), "false")
                .await
                .unwrap_err();
            match err {
                DrillError::RemoteExecution {
                    host,
                    exit_code,
                    stderr,
                    ..
                } => {
                    assert_eq!(host, "agent:10.0.3.7");
                    assert_eq!(exit_code, Some(3));
                    assert!(stderr.contains("oops"));
                }
                other => panic!("unexpected error: {other}"),
            }
        }

        #[tokio::test]
        async fn test_unreachable_host_is_reported() {
            let _lock = SPAWN_LOCK.lock().await;
            let dir = tempfile::tempdir().unwrap();
            let ssh = fake_program(dir.path(), "ssh", SSH_TRANSPORT_FAILURE);
            let scp = fake_program(dir.path(), "scp", 0);
            let executor = SshExecutor::new(sample_config(None)).with_programs(ssh, scp);

            let err = executor.run(&HostSelector::Master, "true").await.unwrap_err();
            assert!(matches!(
                err,
                DrillError::RemoteExecution {
                    exit_code: Some(255),
                    ..
                }
            ));
        }

        #[tokio::test]
        async fn test_copy_requires_local_file() {
            let _lock = SPAWN_LOCK.lock().await;
            let dir = tempfile::tempdir().unwrap();
            let ssh = fake_program(dir.path(), "ssh", 0);
            let scp = fake_program(dir.path(), "scp", 0);
            let executor = SshExecutor::new(sample_config(None)).with_programs(ssh, scp);

            let missing = dir.path().join("missing.sh");
            assert!(matches!(
                executor.copy(&HostSelector::Master, &missing).await,
                Err(DrillError::Fixture(_))
            ));

            let script = dir.path().join("net-services-agent.sh");
            std::fs::write(&script, "#!/bin/sh\n").unwrap();
            executor
                .copy(&HostSelector::agent("10.0.3.7"), &script)
                .await
                .unwrap();
        }

        #[tokio::test]
        async fn test_missing_binary_is_remote_error() {
            let _lock = SPAWN_LOCK.lock().await;
            let executor = SshExecutor::new(sample_config(None))
                .with_programs("/nonexistent/ssh", "/nonexistent/scp");
            let err = executor.run(&HostSelector::Master, "true").await.unwrap_err();
            assert!(matches!(
                err,
                DrillError::RemoteExecution { exit_code: None, .. }
            ));
        }
    }
}
