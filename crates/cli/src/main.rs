// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Service Tunnel Contributors

// Service Tunnel - CLI
// Opens authenticated tunnels from fixed local ports to the services bound
// to a platform application

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use colored::Colorize;
use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};
use dialoguer::{Confirm, Select};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use service_tunnel_common::{
    AppTarget, BoundService, Config, ConnectionInfo, Error, PlatformClient, ServiceKind,
    TunnelRequest,
};
use service_tunnel_core::{
    ConsentPrompt, CredentialStore, PostgresCredentialStore, TlsMaterial, TunnelHandle,
    TunnelOpener,
};

#[derive(Parser)]
#[command(name = "service-tunnel")]
#[command(about = "Tunnels to services bound to platform applications", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Tunnel to the PostgreSQL instance bound to an application
    Postgres {
        /// Application name
        app: String,
    },

    /// Tunnel to the Redis instance bound to an application
    Redis {
        /// Application name
        app: String,
    },

    /// Enable remote-shell access for an application
    EnableSsh {
        /// Application name
        app: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();

    let config = Config::load().context("Failed to load configuration")?;
    let client = Arc::new(PlatformClient::new(&config)?);
    let opener = TunnelOpener::new(
        client.clone(),
        Arc::new(CliConsentPrompt),
        config.gateway_addr()?,
    );

    match cli.command {
        Commands::Postgres { app } => connect_postgres(&client, &opener, &app).await?,
        Commands::Redis { app } => connect_redis(&client, &opener, &app).await?,
        Commands::EnableSsh { app } => enable_ssh(&client, &app).await?,
    }

    Ok(())
}

async fn connect_postgres(
    client: &Arc<PlatformClient>,
    opener: &TunnelOpener,
    app_name: &str,
) -> Result<()> {
    let app = client.app_by_name(app_name).await?;
    let service = pick_bound_service(client, &app, ServiceKind::Postgres).await?;
    let info = ConnectionInfo::from_credentials(ServiceKind::Postgres, &service.credentials)?;

    println!("Open connection to {}", service.name.cyan());

    // Some instances require client certificates; written before the tunnel
    // opens, removed by its teardown.
    let credentials: Option<Arc<dyn CredentialStore>> =
        match TlsMaterial::from_credentials(&service.credentials) {
            Some(material) => {
                let store = Arc::new(PostgresCredentialStore::new()?);
                store.save(&material).await?;
                Some(store)
            }
            None => None,
        };

    let request = TunnelRequest::new(app, ServiceKind::Postgres, &info);
    let handle = opener.open(&request, credentials).await?;

    announce_connected(&request);
    print_local_credentials(&info, ServiceKind::Postgres);
    finish_session(handle).await;
    Ok(())
}

async fn connect_redis(
    client: &Arc<PlatformClient>,
    opener: &TunnelOpener,
    app_name: &str,
) -> Result<()> {
    let app = client.app_by_name(app_name).await?;
    let service = pick_bound_service(client, &app, ServiceKind::Redis).await?;
    let info = ConnectionInfo::from_credentials(ServiceKind::Redis, &service.credentials)?;

    println!("Open connection to {}", service.name.cyan());

    let request = TunnelRequest::new(app, ServiceKind::Redis, &info);
    let handle = opener.open_cache(&request, &info.password).await?;

    announce_connected(&request);
    print_local_credentials(&info, ServiceKind::Redis);
    finish_session(handle).await;
    Ok(())
}

async fn enable_ssh(client: &Arc<PlatformClient>, app_name: &str) -> Result<()> {
    use service_tunnel_common::PlatformApi;

    let app = client.app_by_name(app_name).await?;
    if client.ssh_enabled(&app.guid).await? {
        println!("Remote-shell access is already enabled");
        return Ok(());
    }
    client.enable_ssh(&app.guid).await?;
    println!(
        "{}",
        "Remote-shell access enabled. Restart the app before connecting.".green()
    );
    Ok(())
}

/// Pick one bound instance of the wanted kind, prompting when the app has
/// more than one
async fn pick_bound_service(
    client: &Arc<PlatformClient>,
    app: &AppTarget,
    kind: ServiceKind,
) -> Result<BoundService> {
    let mut services = client
        .vcap_services(&app.guid)
        .await?
        .remove(kind.binding_key())
        .ok_or(Error::ServiceNotFound(kind.label()))?;

    if services.is_empty() {
        return Err(Error::ServiceNotFound(kind.label()).into());
    }
    if services.len() == 1 {
        return Ok(services.remove(0));
    }

    let names: Vec<String> = services.iter().map(|s| s.name.clone()).collect();
    let index = tokio::task::spawn_blocking(move || {
        Select::new()
            .with_prompt("Select a service instance")
            .items(&names)
            .default(0)
            .interact()
    })
    .await
    .context("selection prompt task failed")?
    .context("Failed to read selection")?;

    Ok(services.remove(index))
}

fn announce_connected(request: &TunnelRequest) {
    println!();
    println!(
        "{}",
        format!(
            "✓ Tunnel connected! Forwarding 127.0.0.1:{} → {}:{}",
            request.local_port(),
            request.remote_host,
            request.remote_port
        )
        .green()
        .bold()
    );
    println!();
}

/// The credentials the operator should paste into a local client, with the
/// endpoint rewritten to the forwarded port
fn print_local_credentials(info: &ConnectionInfo, kind: ServiceKind) {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Field").add_attribute(Attribute::Bold).fg(Color::Cyan),
        Cell::new("Value").add_attribute(Attribute::Bold).fg(Color::Cyan),
    ]);

    table.add_row(vec![Cell::new("Host"), Cell::new("127.0.0.1")]);
    table.add_row(vec![
        Cell::new("Port"),
        Cell::new(kind.local_port().to_string()),
    ]);
    if !info.username.is_empty() {
        table.add_row(vec![Cell::new("Username"), Cell::new(&info.username)]);
    }
    table.add_row(vec![Cell::new("Password"), Cell::new(&info.password)]);
    if !info.dbname.is_empty() {
        table.add_row(vec![Cell::new("Database"), Cell::new(&info.dbname)]);
    }

    println!("{}", table);
}

/// Wait for an operator stop, then drain the session. Keypress, Ctrl+C,
/// SIGTERM, and a fatal session error all end up in the same place.
async fn finish_session(mut handle: TunnelHandle) {
    wait_for_stop(&handle).await;
    handle.stop();
    handle.closed().await;
    println!("{}", "✓ Tunnel closed".green().bold());
}

async fn wait_for_stop(handle: &TunnelHandle) {
    println!("{}", "press enter to close the connection...".dimmed());

    let cancel = handle.cancel_token();
    let mut line = String::new();
    let mut stdin = BufReader::new(tokio::io::stdin());

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler");

        tokio::select! {
            // The session died on its own (fatal forwarding error)
            _ = cancel.cancelled() => {}
            _ = stdin.read_line(&mut line) => {}
            _ = tokio::signal::ctrl_c() => { println!(); }
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = stdin.read_line(&mut line) => {}
        _ = tokio::signal::ctrl_c() => { println!(); }
    }
}

/// Remediation confirmations go through dialoguer on a blocking thread
struct CliConsentPrompt;

#[async_trait]
impl ConsentPrompt for CliConsentPrompt {
    async fn confirm(&self, question: &str) -> service_tunnel_common::Result<bool> {
        let question = question.to_string();
        tokio::task::spawn_blocking(move || {
            Confirm::new()
                .with_prompt(question)
                .default(false)
                .interact()
        })
        .await
        .map_err(|e| prompt_error(e.to_string()))?
        .map_err(|e| prompt_error(e.to_string()))
    }
}

fn prompt_error(message: String) -> Error {
    Error::Io(std::io::Error::new(std::io::ErrorKind::Other, message))
}
