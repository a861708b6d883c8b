// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Service Tunnel Contributors

// Service Tunnel - Replica Redirector
// After a cache tunnel comes up, make sure the far end is the primary node
// before the operator gets to use it

use redis::Value;
use tracing::{debug, info, warn};

use service_tunnel_common::{Error, Result, TunnelRequest};

use crate::lifecycle::TunnelHandle;
use crate::TunnelOpener;

/// Role a cache node reports for itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeRole {
    Primary,
    Replica { primary_host: String },
}

/// Probe the node role through the forwarded port; when we landed on a
/// replica, tear the session down, wait for the port to be released, and
/// open a fresh session against the reported primary. The primary address
/// the replica reports is authoritative, so a single hop suffices and the
/// replacement session is not probed again. A failed probe (e.g. a
/// configuration that does not expose ROLE) accepts the current session.
pub(crate) async fn ensure_primary(
    opener: &TunnelOpener,
    mut handle: TunnelHandle,
    request: &TunnelRequest,
    password: &str,
) -> Result<TunnelHandle> {
    info!("Checking the role of the cache node...");
    let role = match probe_role(request.local_port(), password).await {
        Ok(role) => role,
        Err(e) => {
            debug!("Role probe failed, keeping the current session: {}", e);
            return Ok(handle);
        }
    };

    match role {
        NodeRole::Primary => Ok(handle),
        NodeRole::Replica { primary_host } => {
            warn!(
                "connected to a replica node, reconnecting to the primary at {}",
                primary_host
            );
            handle.stop();
            handle.closed().await;

            let mut redirected = request.clone();
            redirected.remote_host = primary_host;
            opener.open(&redirected, None).await
        }
    }
}

/// Issue ROLE against the forwarded local port. The service presents an
/// internal certificate, so verification is disabled for the probe.
async fn probe_role(local_port: u16, password: &str) -> Result<NodeRole> {
    let client = redis::Client::open(redis::ConnectionInfo {
        addr: redis::ConnectionAddr::TcpTls {
            host: "127.0.0.1".to_string(),
            port: local_port,
            insecure: true,
            tls_params: None,
        },
        redis: redis::RedisConnectionInfo {
            password: Some(password.to_string()),
            ..Default::default()
        },
    })
    .map_err(|e| Error::Tunnel(format!("cache client setup failed: {}", e)))?;

    let mut connection = client
        .get_multiplexed_async_connection()
        .await
        .map_err(|e| Error::Tunnel(format!("cache connection failed: {}", e)))?;
    let reply: Value = redis::cmd("ROLE")
        .query_async(&mut connection)
        .await
        .map_err(|e| Error::Tunnel(format!("ROLE probe failed: {}", e)))?;

    parse_role_reply(&reply)
        .ok_or_else(|| Error::Tunnel("unexpected ROLE reply from the cache node".to_string()))
}

/// ROLE replies with an array whose first element names the role; replicas
/// report the primary host as the second element.
fn parse_role_reply(reply: &Value) -> Option<NodeRole> {
    let items = match reply {
        Value::Array(items) => items,
        _ => return None,
    };

    match reply_text(items.first()?)?.as_str() {
        "master" => Some(NodeRole::Primary),
        "slave" => Some(NodeRole::Replica {
            primary_host: reply_text(items.get(1)?)?,
        }),
        _ => None,
    }
}

fn reply_text(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}
