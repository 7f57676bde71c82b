//! Authenticated HTTP access to the cluster: the scheduler REST API, the
//! package manager, the resource manager's agent list and the coordination
//! store explorer.
//!
//! Every request carries `Authorization: token=<TOKEN>` when a token is
//! configured. Unexpected statuses are logged with method, URL, status and
//! body before being returned as [`DrillError::Http`].

use std::future::Future;
use std::time::Duration;

use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, error, info};

use crate::errors::{DrillError, DrillResult};
use crate::poll::{PollPolicy, poll_until};
use crate::types::{AgentInfo, AppResponse, AppState, ClusterEndpoint};

const INSTALL_REQUEST: &str =
    "application/vnd.dcos.package.install-request+json;charset=utf-8;version=v1";
const INSTALL_RESPONSE: &str =
    "application/vnd.dcos.package.install-response+json;charset=utf-8;version=v2";
const LIST_REQUEST: &str = "application/vnd.dcos.package.list-request+json;charset=utf-8;version=v1";
const LIST_RESPONSE: &str =
    "application/vnd.dcos.package.list-response+json;charset=utf-8;version=v1";
const UNINSTALL_REQUEST: &str =
    "application/vnd.dcos.package.uninstall-request+json;charset=utf-8;version=v1";
const UNINSTALL_RESPONSE: &str =
    "application/vnd.dcos.package.uninstall-response+json;charset=utf-8;version=v1";

/// Reservation role marking an agent as public.
const PUBLIC_AGENT_ROLE: &str = "slave_public";

/// Which non-2xx statuses a call accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponsePolicy {
    /// Only 2xx succeeds.
    Strict,
    /// 2xx or 503; the admin router answers 503 until it maps a new service.
    TolerateUnavailable,
    /// 2xx or 409; the package manager answers 409 for an installed package.
    TolerateConflict,
}

impl ResponsePolicy {
    pub fn accepts(self, status: StatusCode) -> bool {
        match self {
            Self::Strict => status.is_success(),
            Self::TolerateUnavailable => {
                status.is_success() || status == StatusCode::SERVICE_UNAVAILABLE
            }
            Self::TolerateConflict => status.is_success() || status == StatusCode::CONFLICT,
        }
    }
}

/// Cluster operations used by the drill.
///
/// Delete-style calls return `Ok(false)` when there was nothing to remove.
pub trait ClusterApi: Send + Sync {
    /// Install and wait until the package manager lists it.
    fn install(&self, package: &str, timeout: Duration)
    -> impl Future<Output = DrillResult<()>> + Send;

    fn package_installed(&self, package: &str) -> impl Future<Output = DrillResult<bool>> + Send;

    /// Uninstall and wait until the package is gone.
    fn uninstall(
        &self,
        package: &str,
        timeout: Duration,
    ) -> impl Future<Output = DrillResult<bool>> + Send;

    /// Submit a workload descriptor to the scheduler behind `service_id`.
    fn deploy(&self, service_id: &str, descriptor: &Value)
    -> impl Future<Output = DrillResult<()>> + Send;

    fn get_app(&self, service_id: &str, app_id: &str)
    -> impl Future<Output = DrillResult<AppState>> + Send;

    fn delete_app(&self, service_id: &str, app_id: &str)
    -> impl Future<Output = DrillResult<bool>> + Send;

    /// `Ok(())` once the service's admin-router URL answers 2xx.
    fn service_reachable(&self, service_id: &str) -> impl Future<Output = DrillResult<()>> + Send;

    /// Agents without the public reservation role.
    fn private_agents(&self) -> impl Future<Output = DrillResult<Vec<AgentInfo>>> + Send;

    fn delete_coordination_node(&self, path: &str) -> impl Future<Output = DrillResult<bool>> + Send;
}

#[derive(Debug, Deserialize)]
struct PackageList {
    #[serde(default)]
    packages: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct AgentList {
    #[serde(default)]
    slaves: Vec<AgentRecord>,
}

#[derive(Debug, Deserialize)]
struct AgentRecord {
    hostname: String,
    #[serde(default)]
    reserved_resources: serde_json::Map<String, Value>,
}

impl From<AgentRecord> for AgentInfo {
    fn from(record: AgentRecord) -> Self {
        let public = record.reserved_resources.contains_key(PUBLIC_AGENT_ROLE);
        AgentInfo {
            hostname: record.hostname,
            public,
        }
    }
}

/// [`ClusterApi`] over HTTP.
#[derive(Debug, Clone)]
pub struct ClusterClient {
    http: reqwest::Client,
    endpoint: ClusterEndpoint,
    poll: PollPolicy,
}

impl ClusterClient {
    pub fn new(endpoint: ClusterEndpoint, request_timeout: Duration) -> DrillResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| DrillError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            http,
            endpoint,
            poll: PollPolicy::default(),
        })
    }

    /// Polling used while waiting on package installs and removals.
    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    pub fn endpoint(&self) -> &ClusterEndpoint {
        &self.endpoint
    }

    fn app_url(&self, service_id: &str, app_id: &str) -> String {
        format!(
            "{}/v2/apps/{}",
            self.endpoint.service_url(service_id),
            app_id.trim_matches('/')
        )
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.http.request(method, url);
        match self.endpoint.auth_header() {
            Some(header) => builder.header(AUTHORIZATION, header),
            None => builder,
        }
    }

    async fn send(&self, method: Method, url: &str, builder: RequestBuilder) -> DrillResult<Response> {
        debug!(%method, url, "HTTP request");
        builder
            .send()
            .await
            .map_err(|source| DrillError::HttpTransport {
                method: method.to_string(),
                url: url.to_string(),
                source,
            })
    }

    /// Turn an unaccepted status into [`DrillError::Http`], logging it first.
    async fn check_response(
        method: &Method,
        url: &str,
        response: Response,
        policy: ResponsePolicy,
    ) -> DrillResult<Response> {
        let status = response.status();
        if policy.accepts(status) {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        error!(
            %method,
            url,
            status = status.as_u16(),
            "Error code in response to {method} {url}: {}/{body}",
            status.as_u16()
        );
        Err(DrillError::Http {
            method: method.to_string(),
            url: url.to_string(),
            status: status.as_u16(),
            body,
        })
    }

    /// Read an accepted response's body, logging it at debug.
    async fn body_text(method: &Method, url: &str, response: Response) -> DrillResult<String> {
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|source| DrillError::HttpTransport {
                method: method.to_string(),
                url: url.to_string(),
                source,
            })?;
        debug!(%method, url, status, body = %text, "HTTP response");
        Ok(text)
    }

    async fn json_body<T: serde::de::DeserializeOwned>(
        method: &Method,
        url: &str,
        response: Response,
    ) -> DrillResult<T> {
        let text = Self::body_text(method, url, response).await?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn cosmos(
        &self,
        path: &str,
        content_type: &str,
        accept: &str,
        body: &Value,
        policy: ResponsePolicy,
    ) -> DrillResult<(String, Response)> {
        let url = self.endpoint.url(path);
        let builder = self
            .request(Method::POST, &url)
            .header(CONTENT_TYPE, content_type)
            .header(ACCEPT, accept)
            .body(body.to_string());
        let response = self.send(Method::POST, &url, builder).await?;
        let response = Self::check_response(&Method::POST, &url, response, policy).await?;
        Ok((url, response))
    }

    /// DELETE that reports `false` for 404.
    async fn delete(&self, url: &str) -> DrillResult<bool> {
        let builder = self.request(Method::DELETE, url);
        let response = self.send(Method::DELETE, url, builder).await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(url, "Nothing to delete");
            return Ok(false);
        }
        let response =
            Self::check_response(&Method::DELETE, url, response, ResponsePolicy::Strict).await?;
        Self::body_text(&Method::DELETE, url, response).await?;
        Ok(true)
    }
}

impl ClusterApi for ClusterClient {
    async fn install(&self, package: &str, timeout: Duration) -> DrillResult<()> {
        info!(package, "Installing package");
        let body = json!({ "packageName": package });
        let (url, response) = self
            .cosmos(
                "/package/install",
                INSTALL_REQUEST,
                INSTALL_RESPONSE,
                &body,
                ResponsePolicy::TolerateConflict,
            )
            .await?;
        if response.status() == StatusCode::CONFLICT {
            info!(package, "Package already installed");
        } else {
            Self::body_text(&Method::POST, &url, response).await?;
        }

        let what = format!("package {package} to be installed");
        poll_until(&what, &self.poll, timeout, || async move {
            Ok(self.package_installed(package).await?.then_some(()))
        })
        .await
        .map_err(|e| match e {
            DrillError::ConvergenceTimeout { waited, .. } => DrillError::Install {
                package: package.to_string(),
                waited,
            },
            other => other,
        })?;
        info!(package, "Package installed");
        Ok(())
    }

    async fn package_installed(&self, package: &str) -> DrillResult<bool> {
        let body = json!({ "packageName": package });
        let (url, response) = self
            .cosmos(
                "/package/list",
                LIST_REQUEST,
                LIST_RESPONSE,
                &body,
                ResponsePolicy::Strict,
            )
            .await?;
        let list: PackageList = Self::json_body(&Method::POST, &url, response).await?;
        Ok(!list.packages.is_empty())
    }

    async fn uninstall(&self, package: &str, timeout: Duration) -> DrillResult<bool> {
        if !self.package_installed(package).await? {
            debug!(package, "Package not installed; nothing to uninstall");
            return Ok(false);
        }
        info!(package, "Uninstalling package");
        let body = json!({ "packageName": package, "all": true });
        let (url, response) = self
            .cosmos(
                "/package/uninstall",
                UNINSTALL_REQUEST,
                UNINSTALL_RESPONSE,
                &body,
                ResponsePolicy::Strict,
            )
            .await?;
        Self::body_text(&Method::POST, &url, response).await?;

        let what = format!("package {package} to be removed");
        poll_until(&what, &self.poll, timeout, || async move {
            Ok((!self.package_installed(package).await?).then_some(()))
        })
        .await?;
        Ok(true)
    }

    async fn deploy(&self, service_id: &str, descriptor: &Value) -> DrillResult<()> {
        let url = format!("{}/v2/apps", self.endpoint.service_url(service_id));
        info!(service = service_id, app = ?descriptor.get("id"), "Deploying workload");
        let builder = self.request(Method::POST, &url).json(descriptor);
        let response = self.send(Method::POST, &url, builder).await?;
        let response =
            Self::check_response(&Method::POST, &url, response, ResponsePolicy::TolerateUnavailable)
                .await?;
        if response.status() == StatusCode::SERVICE_UNAVAILABLE {
            info!(url, "Deploy answered 503; treating as accepted");
        }
        Self::body_text(&Method::POST, &url, response).await?;
        Ok(())
    }

    async fn get_app(&self, service_id: &str, app_id: &str) -> DrillResult<AppState> {
        let url = self.app_url(service_id, app_id);
        let builder = self.request(Method::GET, &url);
        let response = self.send(Method::GET, &url, builder).await?;
        let response =
            Self::check_response(&Method::GET, &url, response, ResponsePolicy::Strict).await?;
        let parsed: AppResponse = Self::json_body(&Method::GET, &url, response).await?;
        Ok(parsed.app)
    }

    async fn delete_app(&self, service_id: &str, app_id: &str) -> DrillResult<bool> {
        let url = self.app_url(service_id, app_id);
        info!(service = service_id, app = app_id, "Deleting workload");
        self.delete(&url).await
    }

    async fn service_reachable(&self, service_id: &str) -> DrillResult<()> {
        let url = format!("{}/", self.endpoint.service_url(service_id));
        let builder = self.request(Method::GET, &url);
        let response = self.send(Method::GET, &url, builder).await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(DrillError::Http {
                method: Method::GET.to_string(),
                url,
                status: status.as_u16(),
                body: String::new(),
            })
        }
    }

    async fn private_agents(&self) -> DrillResult<Vec<AgentInfo>> {
        let url = self.endpoint.url("/mesos/slaves");
        let builder = self.request(Method::GET, &url);
        let response = self.send(Method::GET, &url, builder).await?;
        let response =
            Self::check_response(&Method::GET, &url, response, ResponsePolicy::Strict).await?;
        let list: AgentList = Self::json_body(&Method::GET, &url, response).await?;
        Ok(list
            .slaves
            .into_iter()
            .map(AgentInfo::from)
            .filter(|agent| !agent.public)
            .collect())
    }

    async fn delete_coordination_node(&self, path: &str) -> DrillResult<bool> {
        let url = self.endpoint.url(&format!(
            "/exhibitor/exhibitor/v1/explorer/znode/{}",
            path.trim_matches('/')
        ));
        info!(path, "Deleting coordination node");
        self.delete(&url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_policy() {
        assert!(ResponsePolicy::Strict.accepts(StatusCode::OK));
        assert!(ResponsePolicy::Strict.accepts(StatusCode::CREATED));
        assert!(!ResponsePolicy::Strict.accepts(StatusCode::SERVICE_UNAVAILABLE));
        assert!(ResponsePolicy::TolerateUnavailable.accepts(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!ResponsePolicy::TolerateUnavailable.accepts(StatusCode::BAD_GATEWAY));
        assert!(!ResponsePolicy::TolerateUnavailable.accepts(StatusCode::NOT_FOUND));
        assert!(ResponsePolicy::TolerateConflict.accepts(StatusCode::CONFLICT));
        assert!(!ResponsePolicy::TolerateConflict.accepts(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!ResponsePolicy::Strict.accepts(StatusCode::CONFLICT));
    }

    #[test]
    fn test_app_url_trims_slashes() {
        let client = ClusterClient::new(
            ClusterEndpoint::new("https://dcos.example.com", None),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            client.app_url("marathon-user", "/sleep"),
            "https://dcos.example.com/service/marathon-user/v2/apps/sleep"
        );
    }

    #[test]
    fn test_agent_public_role_detection() {
        let raw = r#"{
            "slaves": [
                {"hostname": "10.0.1.10", "reserved_resources": {}},
                {"hostname": "10.0.5.3", "reserved_resources": {"slave_public": {"cpus": 4.0}}},
                {"hostname": "10.0.1.11"}
            ]
        }"#;
        let list: AgentList = serde_json::from_str(raw).unwrap();
        let agents: Vec<AgentInfo> = list.slaves.into_iter().map(AgentInfo::from).collect();
        assert_eq!(agents.len(), 3);
        assert!(!agents[0].public);
        assert!(agents[1].public);
        assert!(!agents[2].public);
    }
}
