// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Service Tunnel Contributors

// Service Tunnel - Common Library
// Shared types, configuration, and the platform API client

pub mod config;
pub mod error;
pub mod platform;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use platform::{PlatformApi, PlatformClient};
pub use types::{
    AppTarget, BoundService, ConnectionInfo, InstanceStat, ServiceKind, TunnelRequest,
};
