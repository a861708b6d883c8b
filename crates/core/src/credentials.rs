// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Service Tunnel Contributors

// Service Tunnel - Credential Store
// Transient client certificate material for the database client, isolated
// here so the tunnel core carries no per-OS path branching

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use service_tunnel_common::{Error, Result};

/// TLS client material a bound database hands out for its clients
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    pub client_cert: String,
    pub client_key: String,
    pub server_ca: String,
}

impl TlsMaterial {
    /// Present only when the service instance requires client certificates
    pub fn from_credentials(credentials: &Value) -> Option<Self> {
        let server_ca = credentials.get("server_ca")?.as_str()?.to_string();
        Some(Self {
            client_cert: credentials.get("sslcert")?.as_str()?.to_string(),
            client_key: credentials.get("sslkey")?.as_str()?.to_string(),
            server_ca,
        })
    }
}

/// Saves and removes transient local credential files for one tunnel
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn save(&self, material: &TlsMaterial) -> Result<()>;
    async fn remove(&self) -> Result<()>;
}

/// Writes PostgreSQL client certificates where libpq-style clients look for
/// them by default: `~/.postgresql`, or `%APPDATA%\postgresql` on Windows.
pub struct PostgresCredentialStore {
    dir: PathBuf,
}

impl PostgresCredentialStore {
    pub fn new() -> Result<Self> {
        Ok(Self {
            dir: default_dir()?,
        })
    }

    #[cfg(test)]
    fn with_dir(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn write_private(path: &Path, contents: &str) -> Result<()> {
        std::fs::write(path, contents)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}

#[cfg(windows)]
fn default_dir() -> Result<PathBuf> {
    let base = dirs::data_dir()
        .ok_or_else(|| Error::Config("Could not determine the data directory".to_string()))?;
    Ok(base.join("postgresql"))
}

#[cfg(not(windows))]
fn default_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| Error::Config("Could not determine the home directory".to_string()))?;
    Ok(home.join(".postgresql"))
}

#[async_trait]
impl CredentialStore for PostgresCredentialStore {
    async fn save(&self, material: &TlsMaterial) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.dir, std::fs::Permissions::from_mode(0o700))?;
        }
        Self::write_private(&self.dir.join("postgresql.crt"), &material.client_cert)?;
        Self::write_private(&self.dir.join("postgresql.key"), &material.client_key)?;
        Self::write_private(&self.dir.join("root.crt"), &material.server_ca)?;
        debug!("Wrote client certificates to {}", self.dir.display());
        Ok(())
    }

    async fn remove(&self) -> Result<()> {
        if self.dir.exists() {
            std::fs::remove_dir_all(&self.dir)?;
            debug!("Removed {}", self.dir.display());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn material() -> TlsMaterial {
        TlsMaterial {
            client_cert: "CERT".to_string(),
            client_key: "KEY".to_string(),
            server_ca: "CA".to_string(),
        }
    }

    #[test]
    fn test_material_requires_server_ca() {
        let with_ca = json!({ "sslcert": "c", "sslkey": "k", "server_ca": "ca" });
        assert!(TlsMaterial::from_credentials(&with_ca).is_some());

        let without_ca = json!({ "sslcert": "c", "sslkey": "k" });
        assert!(TlsMaterial::from_credentials(&without_ca).is_none());
    }

    #[tokio::test]
    async fn test_save_and_remove_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("postgresql");
        let store = PostgresCredentialStore::with_dir(dir.clone());

        store.save(&material()).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.join("postgresql.crt")).unwrap(),
            "CERT"
        );
        assert_eq!(std::fs::read_to_string(dir.join("root.crt")).unwrap(), "CA");

        store.remove().await.unwrap();
        assert!(!dir.exists());

        // A second removal of already-gone material is a no-op
        store.remove().await.unwrap();
    }
}
