// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Service Tunnel Contributors

// Service Tunnel - Core Engine
// Authenticated tunnels from a fixed local port to a service bound to a
// platform application, forwarded through the remote-shell gateway

pub mod auth;
pub mod credentials;
pub mod forward;
pub mod lifecycle;
pub mod port;
pub mod redirect;
pub mod transport;

use std::sync::Arc;

use service_tunnel_common::{Error, PlatformApi, Result, TunnelRequest};

pub use auth::{ConsentPrompt, TunnelAuthenticator};
pub use credentials::{CredentialStore, PostgresCredentialStore, TlsMaterial};
pub use lifecycle::{TunnelHandle, TunnelSession};
pub use redirect::NodeRole;
pub use transport::RemoteTransport;

/// Opens tunnel sessions against one platform target
pub struct TunnelOpener {
    api: Arc<dyn PlatformApi>,
    prompt: Arc<dyn ConsentPrompt>,
    gateway: String,
}

impl TunnelOpener {
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

    /// Preflight the local port, authenticate against the gateway, and hand
    /// back the handle of the running session. The port check runs before
    /// any control-plane call so an occupied port fails fast.
    pub async fn open(
        &self,
        request: &TunnelRequest,
        credentials: Option<Arc<dyn CredentialStore>>,
    ) -> Result<TunnelHandle> {
        let local_port = request.local_port();
        if !port::is_port_free(local_port).await {
            return Err(Error::PortOccupied(local_port));
        }

        let authenticator =
            TunnelAuthenticator::new(self.api.clone(), self.prompt.clone(), &self.gateway);
        let transport = authenticator.authenticate(&request.app).await?;
        TunnelSession::open(Box::new(transport), request, credentials).await
    }

    /// Open a cache tunnel and make sure it lands on the primary node,
    /// re-establishing the session against the reported primary when the
    /// first hop turns out to be a replica.
    pub async fn open_cache(
        &self,
        request: &TunnelRequest,
        password: &str,
    ) -> Result<TunnelHandle> {
        let handle = self.open(request, None).await?;
        redirect::ensure_primary(self, handle, request, password).await
    }
}
