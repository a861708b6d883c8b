// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Service Tunnel Contributors

// Service Tunnel - Platform API Client
// REST client for the control plane: process resolution, one-time
// remote-shell credentials, app features, and rolling restarts

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::types::{AppTarget, BoundService, InstanceStat};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEPLOYMENT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const INSTANCE_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Operations the tunnel needs from the platform control plane
#[async_trait]
pub trait PlatformApi: Send + Sync {
    /// GUID of the application's first process
    async fn first_process_guid(&self, app_guid: &str) -> Result<String>;

    /// One-time password for the remote-shell gateway
    async fn ssh_code(&self) -> Result<String>;

    /// Stats of the application's web process instances
    async fn process_stats(&self, app_guid: &str) -> Result<Vec<InstanceStat>>;

    /// Whether remote-shell access is enabled for the application
    async fn ssh_enabled(&self, app_guid: &str) -> Result<bool>;

    /// Enable remote-shell access (no-op when already enabled)
    async fn enable_ssh(&self, app_guid: &str) -> Result<()>;

    /// Rolling restart; returns once the new instances are past STARTING
    async fn restart_rolling(&self, app_guid: &str, app_name: &str) -> Result<()>;
}

pub struct PlatformClient {
    http: reqwest::Client,
    api_url: String,
}

impl PlatformClient {
    pub fn new(config: &Config) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        let mut auth = header::HeaderValue::from_str(&format!("bearer {}", config.token))
            .map_err(|_| Error::Config("token contains invalid characters".to_string()))?;
        auth.set_sensitive(true);
        headers.insert(header::AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
        })
    }

    /// Resolve an application by name in the targeted space
    pub async fn app_by_name(&self, name: &str) -> Result<AppTarget> {
        let apps: ListResponse<AppResource> = self
            .get_json(&format!("/v3/apps?names={}", name))
            .await?;
        let app = apps
            .resources
            .into_iter()
            .next()
            .ok_or_else(|| Error::AppNotFound(name.to_string()))?;
        Ok(AppTarget {
            guid: app.guid,
            name: app.name,
        })
    }

    /// Bound service instances of the application, grouped by offering
    pub async fn vcap_services(
        &self,
        app_guid: &str,
    ) -> Result<HashMap<String, Vec<BoundService>>> {
        let env: AppEnvResponse = self
            .get_json(&format!("/v3/apps/{}/env", app_guid))
            .await?;
        Ok(env.system_env_json.vcap_services)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .http
            .get(format!("{}{}", self.api_url, path))
            .send()
            .await?;
        Self::parse(response).await
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        body: serde_json::Value,
    ) -> Result<T> {
        let response = request.json(&body).send().await?;
        Self::parse(response).await
    }

    async fn parse<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api(format!("{}: {}", status, body.trim())));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl PlatformApi for PlatformClient {
    async fn first_process_guid(&self, app_guid: &str) -> Result<String> {
        let processes: ListResponse<ProcessResource> = self
            .get_json(&format!("/v3/apps/{}/processes", app_guid))
            .await?;
        processes
            .resources
            .into_iter()
            .next()
            .map(|p| p.guid)
            .ok_or_else(|| Error::Api("application has no processes".to_string()))
    }

    async fn ssh_code(&self) -> Result<String> {
        let code: SshCodeResponse = self.get_json("/v3/ssh_code").await?;
        Ok(code.code)
    }

    async fn process_stats(&self, app_guid: &str) -> Result<Vec<InstanceStat>> {
        let stats: ListResponse<InstanceStat> = self
            .get_json(&format!("/v3/apps/{}/processes/web/stats", app_guid))
            .await?;
        Ok(stats.resources)
    }

    async fn ssh_enabled(&self, app_guid: &str) -> Result<bool> {
        let feature: SshFeature = self
            .get_json(&format!("/v3/apps/{}/ssh_enabled", app_guid))
            .await?;
        Ok(feature.enabled)
    }

    async fn enable_ssh(&self, app_guid: &str) -> Result<()> {
        if self.ssh_enabled(app_guid).await? {
            info!("remote-shell access is already enabled");
            return Ok(());
        }
        info!("enabling remote-shell access");
        let request = self
            .http
            .patch(format!("{}/v3/apps/{}/features/ssh", self.api_url, app_guid));
        let feature: SshFeature = self.send_json(request, json!({ "enabled": true })).await?;
        info!("remote-shell access enabled: {}", feature.enabled);
        Ok(())
    }

    async fn restart_rolling(&self, app_guid: &str, app_name: &str) -> Result<()> {
        info!("restarting application - {}", app_name);
        let request = self.http.post(format!("{}/v3/deployments", self.api_url));
        let deployment: DeploymentResource = self
            .send_json(
                request,
                json!({
                    "strategy": "rolling",
                    "relationships": { "app": { "data": { "guid": app_guid } } },
                }),
            )
            .await?;

        // The deployment leaves DEPLOYING once all new instances are placed
        let mut reason = deployment.status.reason;
        while reason == "DEPLOYING" {
            tokio::time::sleep(DEPLOYMENT_POLL_INTERVAL).await;
            let current: DeploymentResource = self
                .get_json(&format!("/v3/deployments/{}", deployment.guid))
                .await?;
            reason = current.status.reason;
            info!("deployment status: {}", reason);
        }

        // Placed is not started; wait for the instances themselves
        let mut state = "STARTING".to_string();
        while state == "STARTING" {
            tokio::time::sleep(INSTANCE_POLL_INTERVAL).await;
            let stats = self.process_stats(app_guid).await?;
            state = stats
                .first()
                .map(|s| s.state.clone())
                .unwrap_or_else(|| "DOWN".to_string());
            info!("app status: {}", state);
        }
        if state == "CRASHED" {
            warn!("{} crashed after the rolling restart", app_name);
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct ListResponse<T> {
    resources: Vec<T>,
}

#[derive(Deserialize)]
struct AppResource {
    guid: String,
    name: String,
}

#[derive(Deserialize)]
struct ProcessResource {
    guid: String,
}

#[derive(Deserialize)]
struct SshCodeResponse {
    code: String,
}

#[derive(Deserialize)]
struct SshFeature {
    enabled: bool,
}

#[derive(Deserialize)]
struct DeploymentResource {
    guid: String,
    status: DeploymentStatus,
}

#[derive(Deserialize)]
struct DeploymentStatus {
    reason: String,
}

#[derive(Deserialize)]
struct AppEnvResponse {
    system_env_json: SystemEnv,
}

#[derive(Deserialize)]
struct SystemEnv {
    #[serde(rename = "VCAP_SERVICES", default)]
    vcap_services: HashMap<String, Vec<BoundService>>,
}
