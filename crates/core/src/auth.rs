// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Service Tunnel Contributors

// Service Tunnel - Authenticator Module
// One-time credentials, the gateway dial, and the single remediation cycle
// for applications whose remote-shell access is switched off

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, AuthResult, Config};
use tracing::{info, warn};

use service_tunnel_common::{AppTarget, Error, PlatformApi, Result};

use crate::transport::{GatewayHandler, SshTransport};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Asks the operator to approve a remediation step
#[async_trait]
pub trait ConsentPrompt: Send + Sync {
    async fn confirm(&self, question: &str) -> Result<bool>;
}

/// Obtains one-time remote-shell credentials and opens an authenticated
/// transport to the target application's container
pub struct TunnelAuthenticator {
    api: Arc<dyn PlatformApi>,
    prompt: Arc<dyn ConsentPrompt>,
    gateway: String,
}

impl TunnelAuthenticator {
    pub fn new(
        api: Arc<dyn PlatformApi>,
        prompt: Arc<dyn ConsentPrompt>,
        gateway: impl Into<String>,
    ) -> Self {
        Self {
            api,
            prompt,
            gateway: gateway.into(),
        }
    }

    /// Dial the gateway. An authorization failure gets exactly one
    /// remediation cycle (enable remote-shell access, rolling restart,
    /// redial); every other error propagates as-is.
    pub async fn authenticate(&self, app: &AppTarget) -> Result<SshTransport> {
        let mut remediated = false;
        loop {
            match self.dial(app).await {
                Ok(transport) => return Ok(transport),
                Err(Error::AuthorizationDenied(reason)) if !remediated => {
                    self.remediate(app, &reason).await?;
                    remediated = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn dial(&self, app: &AppTarget) -> Result<SshTransport> {
        let process_guid = self.api.first_process_guid(&app.guid).await?;
        let code = self.api.ssh_code().await?;
        let user = format!("platform:{}/0", process_guid);

        let mut cfg = Config::default();
        // disable nagle for lower latency
        cfg.nodelay = true;
        // keepalives to avoid idle connections dying silently
        cfg.keepalive_interval = Some(Duration::from_secs(30));
        cfg.keepalive_max = 3;
        let config = Arc::new(cfg);

        info!("Connecting to remote-shell gateway: {}", self.gateway);
        let mut session = match tokio::time::timeout(
            CONNECT_TIMEOUT,
            client::connect(config, self.gateway.as_str(), GatewayHandler),
        )
        .await
        {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                return Err(Error::Gateway(format!(
                    "Failed to connect to {}: {}",
                    self.gateway, e
                )))
            }
            Err(_) => {
                return Err(Error::Gateway(format!(
                    "Connection to {} timed out after {:?}",
                    self.gateway, CONNECT_TIMEOUT
                )))
            }
        };

        match session.authenticate_password(user, code).await {
            Ok(AuthResult::Success) => {
                info!("gateway authentication successful");
                Ok(SshTransport::new(session))
            }
            Ok(AuthResult::Failure { .. }) => Err(Error::AuthorizationDenied(
                "the gateway rejected the one-time password".to_string(),
            )),
            Err(e) => Err(Error::Gateway(format!("Authentication failed: {}", e))),
        }
    }

    /// One remediation cycle after an authorization failure: bail out when
    /// the app is simply not running, otherwise enable remote-shell access
    /// (with operator consent) and rolling-restart the app so the new
    /// instances pick the setting up.
    async fn remediate(&self, app: &AppTarget, denial: &str) -> Result<()> {
        let stats = self.api.process_stats(&app.guid).await?;
        if !stats.iter().any(|s| s.is_running()) {
            return Err(Error::AppNotRunning);
        }

        warn!("you are not authorized to perform the requested action (maybe remote-shell access is off?)");
        if !self
            .prompt
            .confirm("Do you want to enable remote-shell access?")
            .await?
        {
            return Err(Error::AuthorizationDenied(denial.to_string()));
        }

        self.api.enable_ssh(&app.guid).await?;
        self.api.restart_rolling(&app.guid, &app.name).await?;
        Ok(())
    }
}
