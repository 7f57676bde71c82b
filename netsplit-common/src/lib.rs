//! Network partition drills for a Marathon-style scheduler.
//!
//! The drill deploys a long-running workload, partitions the hosts running
//! the scheduler instance and the workload's task, optionally restarts the
//! leading master, heals, waits for convergence and checks that the task
//! kept its identity. Cleanup always runs.

pub mod cluster;
pub mod config;
pub mod errors;
pub mod fault;
pub mod fixtures;
pub mod logging;
pub mod mock;
pub mod poll;
pub mod remote;
pub mod scenario;
pub mod types;

pub use cluster::{ClusterApi, ClusterClient, ResponsePolicy};
pub use config::DrillConfig;
pub use errors::{DrillError, DrillResult, ErrorCategory};
pub use fault::FaultInjector;
pub use logging::{LogConfig, LogFormat, LoggingGuards, init_logging};
pub use poll::{ConvergencePoller, PollPolicy};
pub use remote::{CommandOutput, RemoteExecutor, SshConfig, SshExecutor};
pub use scenario::{
    CleanupOutcome, CleanupStep, ScenarioReport, ScenarioRunner, ScenarioSpec, ScenarioState,
};
pub use types::{
    AgentInfo, AppState, ClusterEndpoint, Host, HostPartitionState, HostSelector, TaskInstance,
};
