// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Service Tunnel Contributors

// Service Tunnel - Forwarding Module
// Accept loop and per-connection relays over the authenticated transport

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use service_tunnel_common::{Error, Result};

use crate::transport::{ChannelStream, RemoteTransport};

const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Accept local connections until cancelled, forwarding each through its own
/// channel. Every relay runs as an independent task; a single slow or failed
/// connection never blocks the accept loop or its siblings. Returns Err only
/// when the transport looks dead.
pub(crate) async fn accept_loop(
    listener: &TcpListener,
    transport: &Arc<dyn RemoteTransport>,
    remote_host: &str,
    remote_port: u16,
    cancel: &CancellationToken,
) -> Result<()> {
    // Consecutive channel failures mean the transport is gone, not the peer
    let failures = Arc::new(AtomicU32::new(0));
    let fatal = CancellationToken::new();

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = fatal.cancelled() => {
                return Err(Error::Tunnel(format!(
                    "transport appears dead after {} consecutive channel failures",
                    MAX_CONSECUTIVE_FAILURES
                )));
            }
            accepted = listener.accept() => accepted,
        };

        let (stream, peer_addr) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                error!("Failed to accept connection: {}", e);
                continue;
            }
        };
        debug!("Accepted connection from {}", peer_addr);

        let transport = transport.clone();
        let remote_host = remote_host.to_string();
        let failures = failures.clone();
        let fatal = fatal.clone();

        tokio::spawn(async move {
            match transport.open_channel(&remote_host, remote_port, peer_addr).await {
                Ok(channel) => {
                    failures.store(0, Ordering::Relaxed);
                    relay(stream, channel).await;
                }
                Err(e) => {
                    // The local connection drops here; other forwards and the
                    // listener keep going.
                    let failed = failures.fetch_add(1, Ordering::Relaxed) + 1;
                    error!(
                        "Failed to open channel ({}/{}): {}",
                        failed, MAX_CONSECUTIVE_FAILURES, e
                    );
                    if failed >= MAX_CONSECUTIVE_FAILURES {
                        fatal.cancel();
                    }
                }
            }
        });
    }
}

/// Copy bytes in both directions until either side reaches end-of-stream
async fn relay(mut stream: TcpStream, mut channel: Box<dyn ChannelStream>) {
    match copy_bidirectional(&mut stream, &mut channel).await {
        Ok((to_remote, to_local)) => debug!(
            "Forward connection closed: {} bytes out, {} bytes in",
            to_remote, to_local
        ),
        Err(e) => debug!("Forward connection ended: {}", e),
    }
}
