// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Service Tunnel Contributors

// Service Tunnel - Transport Module
// The channel-opening seam between the forwarding loop and russh

use std::net::SocketAddr;

use async_trait::async_trait;
use russh::client;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use service_tunnel_common::{Error, Result};

/// A bidirectional byte stream to the remote service
pub trait ChannelStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ChannelStream for T {}

/// An open, authenticated connection that can multiplex logical
/// sub-connections to host:port pairs reachable from the remote container's
/// network namespace. Owned exclusively by the session that created it.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Open one channel to `host:port`, attributed to the local originator
    async fn open_channel(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> Result<Box<dyn ChannelStream>>;

    /// Close the underlying connection. In-flight channels observe
    /// end-of-stream and unwind on their own.
    async fn close(&self);
}

/// SSH client handler for the remote-shell gateway
pub(crate) struct GatewayHandler;

impl client::Handler for GatewayHandler {
    type Error = russh::Error;

    // The gateway authenticates us with a one-time password; its host key
    // is not pinned.
    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// russh-backed transport over an authenticated gateway session
pub struct SshTransport {
    session: client::Handle<GatewayHandler>,
}

impl SshTransport {
    pub(crate) fn new(session: client::Handle<GatewayHandler>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl RemoteTransport for SshTransport {
    async fn open_channel(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> Result<Box<dyn ChannelStream>> {
        let channel = self
            .session
            .channel_open_direct_tcpip(
                host,
                port.into(),
                &originator.ip().to_string(),
                originator.port().into(),
            )
            .await
            .map_err(|e| Error::Gateway(format!("Failed to open channel: {}", e)))?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn close(&self) {
        if let Err(e) = self
            .session
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            debug!("Failed to disconnect gracefully: {}", e);
        }
    }
}
