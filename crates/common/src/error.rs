// Error types for the service tunnel

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Port {0} is occupied!")]
    PortOccupied(u16),

    #[error("app is not running... please start the app and try again")]
    AppNotRunning,

    #[error("not authorized to open a remote shell: {0}")]
    AuthorizationDenied(String),

    #[error("Gateway connection error: {0}")]
    Gateway(String),

    #[error("Platform API error: {0}")]
    Api(String),

    #[error("Application not found: {0}")]
    AppNotFound(String),

    #[error("No {0} service bound to this application")]
    ServiceNotFound(&'static str),

    #[error("Tunnel error: {0}")]
    Tunnel(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
