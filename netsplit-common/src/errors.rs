//! Error taxonomy for partition drills.
//!
//! Every forward step of a scenario fails with one [`DrillError`]. Cleanup
//! never returns these directly; it converts them into
//! [`CleanupOutcome::Failed`](crate::scenario::CleanupOutcome) entries.
//!
//! # Categories
//!
//! | Category     | Variants                                             |
//! |--------------|------------------------------------------------------|
//! | Config       | `Config`, `Fixture`                                  |
//! | Network      | `HttpTransport`, `RemoteExecution`                   |
//! | Cluster      | `Install`, `Http`, `MissingTask`, `Preflight`        |
//! | Convergence  | `ConvergenceTimeout`                                 |
//! | Verification | `TaskIdentityChanged`                                |
//! | Internal     | `Io`, `Json`                                         |

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Error type for drill operations
#[derive(Debug, thiserror::Error)]
pub enum DrillError {
    #[error("Package {package} not installed after {waited:?}")]
    Install { package: String, waited: Duration },

    #[error("Error code in response to {method} {url}: {status}/{body}")]
    Http {
        method: String,
        url: String,
        status: u16,
        body: String,
    },

    #[error("Request {method} {url} failed: {source}")]
    HttpTransport {
        method: String,
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Remote command on {host} failed (exit {exit_code:?}): {command}: {stderr}")]
    RemoteExecution {
        host: String,
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Timed out after {waited:?} waiting for {what}{}", last_error_suffix(.last_error))]
    ConvergenceTimeout {
        what: String,
        waited: Duration,
        last_error: Option<String>,
    },

    #[error("Task ID shouldn't change: was {before}, now {after}")]
    TaskIdentityChanged { before: String, after: String },

    #[error("App {app} on {service} has no running task{}", detail_suffix(.detail))]
    MissingTask {
        service: String,
        app: String,
        detail: Option<String>,
    },

    #[error("Preflight failed: {0}")]
    Preflight(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Fixture not found: {}", .0.display())]
    Fixture(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    match last_error {
        Some(error) => format!(" (last error: {error})"),
        None => String::new(),
    }
}

fn detail_suffix(detail: &Option<String>) -> String {
    match detail {
        Some(detail) => format!(": {detail}"),
        None => String::new(),
    }
}

/// Result type for drill operations
pub type DrillResult<T> = Result<T, DrillError>;

/// Coarse grouping used in logs and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Config,
    Network,
    Cluster,
    Convergence,
    Verification,
    Internal,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Config => "config",
            Self::Network => "network",
            Self::Cluster => "cluster",
            Self::Convergence => "convergence",
            Self::Verification => "verification",
            Self::Internal => "internal",
        };
        write!(f, "{label}")
    }
}

impl DrillError {
    /// Category of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_) | Self::Fixture(_) => ErrorCategory::Config,
            Self::HttpTransport { .. } | Self::RemoteExecution { .. } => ErrorCategory::Network,
            Self::Install { .. } | Self::Http { .. } | Self::MissingTask { .. } => {
                ErrorCategory::Cluster
            }
            Self::Preflight(_) => ErrorCategory::Cluster,
            Self::ConvergenceTimeout { .. } => ErrorCategory::Convergence,
            Self::TaskIdentityChanged { .. } => ErrorCategory::Verification,
            Self::Io(_) | Self::Json(_) => ErrorCategory::Internal,
        }
    }

    /// HTTP status carried by this error, if any.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True for a `404 Not Found` response.
    pub fn is_not_found(&self) -> bool {
        self.http_status() == Some(404)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_error_message_matches_diagnostic_format() {
        let err = DrillError::Http {
            method: "GET".to_string(),
            url: "https://cluster/service/marathon-user/v2/apps/sleep".to_string(),
            status: 500,
            body: "boom".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Error code in response to GET https://cluster/service/marathon-user/v2/apps/sleep: 500/boom"
        );
        assert_eq!(err.category(), ErrorCategory::Cluster);
        assert_eq!(err.http_status(), Some(500));
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_convergence_timeout_includes_last_error() {
        let err = DrillError::ConvergenceTimeout {
            what: "task sleep on marathon-user".to_string(),
            waited: Duration::from_secs(0),
            last_error: Some("connection refused".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("task sleep on marathon-user"));
        assert!(msg.contains("last error: connection refused"));

        let bare = DrillError::ConvergenceTimeout {
            what: "service marathon-user".to_string(),
            waited: Duration::from_secs(5),
            last_error: None,
        };
        assert!(!bare.to_string().contains("last error"));
    }

    #[test]
    fn test_identity_change_is_verification_failure() {
        let err = DrillError::TaskIdentityChanged {
            before: "sleep.1".to_string(),
            after: "sleep.2".to_string(),
        };
        assert_eq!(err.category(), ErrorCategory::Verification);
        assert!(err.to_string().contains("sleep.1"));
        assert_eq!(ErrorCategory::Verification.to_string(), "verification");
    }

    #[test]
    fn test_not_found_detection() {
        let err = DrillError::Http {
            method: "DELETE".to_string(),
            url: "u".to_string(),
            status: 404,
            body: String::new(),
        };
        assert!(err.is_not_found());
        assert!(!DrillError::Preflight("x".to_string()).is_not_found());
    }
}
