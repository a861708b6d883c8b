// Common types for the service tunnel

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Kind of bound service a tunnel can target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Postgres,
    Redis,
}

impl ServiceKind {
    /// Fixed local port for this service kind. The port is never
    /// operator-chosen so default client configurations keep working.
    pub fn local_port(&self) -> u16 {
        match self {
            ServiceKind::Postgres => 5432,
            ServiceKind::Redis => 6380,
        }
    }

    /// Key under which instances of this kind appear in the application's
    /// bound-services environment
    pub fn binding_key(&self) -> &'static str {
        match self {
            ServiceKind::Postgres => "postgresql-db",
            ServiceKind::Redis => "redis-cache",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ServiceKind::Postgres => "postgres",
            ServiceKind::Redis => "redis",
        }
    }
}

/// Application a tunnel targets
#[derive(Debug, Clone)]
pub struct AppTarget {
    pub guid: String,
    pub name: String,
}

/// Credentials of a bound service instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub username: String,
    pub password: String,
    pub hostname: String,
    pub dbname: String,
    pub port: u16,
}

impl ConnectionInfo {
    /// Extract connection credentials from a bound service's credential blob.
    /// Postgres instances report the port as a string, redis as a number.
    pub fn from_credentials(kind: ServiceKind, credentials: &Value) -> Result<Self> {
        let port = cred_port(credentials)
            .ok_or_else(|| Error::Api("service credentials are missing a port".to_string()))?;
        let hostname = cred_str(credentials, "hostname")
            .ok_or_else(|| Error::Api("service credentials are missing a hostname".to_string()))?;
        let password = cred_str(credentials, "password")
            .ok_or_else(|| Error::Api("service credentials are missing a password".to_string()))?;

        match kind {
            ServiceKind::Postgres => Ok(Self {
                username: cred_str(credentials, "username").unwrap_or_default(),
                password,
                hostname,
                dbname: cred_str(credentials, "dbname").unwrap_or_default(),
                port,
            }),
            ServiceKind::Redis => Ok(Self {
                username: String::new(),
                password,
                hostname,
                dbname: String::new(),
                port,
            }),
        }
    }
}

fn cred_str(credentials: &Value, key: &str) -> Option<String> {
    credentials.get(key)?.as_str().map(str::to_string)
}

fn cred_port(credentials: &Value) -> Option<u16> {
    match credentials.get("port")? {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        _ => None,
    }
}

/// Immutable input describing one tunnel to open
#[derive(Debug, Clone)]
pub struct TunnelRequest {
    pub app: AppTarget,
    pub service: ServiceKind,
    /// Service host as seen from inside the container network
    pub remote_host: String,
    pub remote_port: u16,
    /// Human-readable label for diagnostics
    pub label: String,
}

impl TunnelRequest {
    pub fn new(app: AppTarget, service: ServiceKind, info: &ConnectionInfo) -> Self {
        let label = format!("{}/{}", app.name, service.label());
        Self {
            app,
            service,
            remote_host: info.hostname.clone(),
            remote_port: info.port,
            label,
        }
    }

    pub fn local_port(&self) -> u16 {
        self.service.local_port()
    }
}

/// One running instance of an application process
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceStat {
    #[serde(default)]
    pub index: u32,
    pub state: String,
}

impl InstanceStat {
    pub fn is_running(&self) -> bool {
        self.state == "RUNNING"
    }
}

/// A service instance bound to an application
#[derive(Debug, Clone, Deserialize)]
pub struct BoundService {
    pub name: String,
    pub credentials: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_local_ports_are_fixed_per_kind() {
        assert_eq!(ServiceKind::Postgres.local_port(), 5432);
        assert_eq!(ServiceKind::Redis.local_port(), 6380);

        let app = AppTarget {
            guid: "a-1".to_string(),
            name: "my-app".to_string(),
        };
        let info = ConnectionInfo {
            username: "user".to_string(),
            password: "secret".to_string(),
            hostname: "db.internal".to_string(),
            dbname: "apps".to_string(),
            port: 4321,
        };
        let request = TunnelRequest::new(app, ServiceKind::Postgres, &info);
        assert_eq!(request.local_port(), 5432);
        assert_eq!(request.remote_port, 4321);
    }

    #[test]
    fn test_postgres_credentials_with_string_port() {
        let credentials = json!({
            "hostname": "pg.internal",
            "port": "6432",
            "username": "admin",
            "password": "pw",
            "dbname": "orders",
        });

        let info = ConnectionInfo::from_credentials(ServiceKind::Postgres, &credentials).unwrap();
        assert_eq!(info.hostname, "pg.internal");
        assert_eq!(info.port, 6432);
        assert_eq!(info.username, "admin");
        assert_eq!(info.dbname, "orders");
    }

    #[test]
    fn test_redis_credentials_with_numeric_port() {
        let credentials = json!({
            "hostname": "cache.internal",
            "port": 1960,
            "password": "pw",
        });

        let info = ConnectionInfo::from_credentials(ServiceKind::Redis, &credentials).unwrap();
        assert_eq!(info.port, 1960);
        assert!(info.username.is_empty());
        assert!(info.dbname.is_empty());
    }

    #[test]
    fn test_credentials_missing_hostname() {
        let credentials = json!({ "port": 6379, "password": "pw" });
        assert!(ConnectionInfo::from_credentials(ServiceKind::Redis, &credentials).is_err());
    }
}
