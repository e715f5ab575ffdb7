// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 DicyVPN Contributors

// DicyVPN - CLI Client
// Command-line interface for the DicyVPN daemon

mod config;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};
use dialoguer::{Confirm, Input, Password};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Client;

use dicyvpn_common::api::validate_login;
use dicyvpn_common::daemon_client;
use dicyvpn_common::{
    connect_with_events, ConnectEventHandler, EventListener, Server, ServerList, ServerTier,
    StatusEvent, StatusResponse, TunnelStatus,
};

use config::CliConfig;

#[derive(Parser)]
#[command(name = "dicyvpn")]
#[command(about = "DicyVPN command-line client", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in to your DicyVPN account
    Login {
        /// Account email (prompted if omitted)
        #[arg(short, long)]
        email: Option<String>,
    },

    /// Log out and forget the stored credentials
    Logout,

    /// List available servers
    Servers {
        /// Output as JSON for scripting
        #[arg(short, long)]
        json: bool,

        /// Include secondary servers
        #[arg(short, long)]
        secondary: bool,
    },

    /// Connect to a server
    Connect {
        /// Server ID (see `dicyvpn servers`), defaults to the last server used
        server_id: Option<String>,

        /// Accept the secondary server terms without prompting
        #[arg(long)]
        accept_secondary: bool,
    },

    /// Disconnect the tunnel
    Disconnect,

    /// Show tunnel status
    Status,

    /// Follow tunnel status changes
    Watch,

    /// Daemon management
    Daemon {
        #[command(subcommand)]
        action: DaemonCommands,
    },
}

#[derive(Subcommand)]
enum DaemonCommands {
    /// Check daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let cli_config = CliConfig::load()?;
    let client = daemon_client::create_daemon_client(&cli_config.daemon_config)?;

    match cli.command {
        Commands::Login { email } => login(&client, &cli_config, email).await?,
        Commands::Logout => logout(&client, &cli_config).await?,
        Commands::Servers { json, secondary } => {
            list_servers(&client, &cli_config, json, secondary).await?
        }
        Commands::Connect {
            server_id,
            accept_secondary,
        } => connect(&client, cli_config, server_id, accept_secondary).await?,
        Commands::Disconnect => disconnect(&client, &cli_config).await?,
        Commands::Status => show_status(&client, &cli_config).await?,
        Commands::Watch => watch_events(&cli_config).await?,
        Commands::Daemon { action } => match action {
            DaemonCommands::Status => daemon_status(&client, &cli_config).await?,
        },
    }

    Ok(())
}

async fn login(client: &Client, cli_config: &CliConfig, email: Option<String>) -> Result<()> {
    let email = match email {
        Some(email) => email,
        None => Input::new()
            .with_prompt("Email")
            .interact_text()
            .context("Failed to read email")?,
    };

    let password = Password::new()
        .with_prompt("Password")
        .interact()
        .context("Failed to read password input")?;

    // Catch typos before a round trip to the service
    validate_login(&email, &password)?;

    daemon_client::login(client, &cli_config.daemon_config, &email, &password).await?;
    println!("{}", format!("✓ Logged in as {}", email).green().bold());
    Ok(())
}

async fn logout(client: &Client, cli_config: &CliConfig) -> Result<()> {
    daemon_client::logout(client, &cli_config.daemon_config).await?;
    println!("{}", "✓ Logged out".green().bold());
    Ok(())
}

async fn list_servers(
    client: &Client,
    cli_config: &CliConfig,
    json: bool,
    include_secondary: bool,
) -> Result<()> {
    let mut servers = daemon_client::list_servers(client, &cli_config.daemon_config).await?;
    if !include_secondary {
        servers.secondary.clear();
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&servers)?);
        return Ok(());
    }

    if servers.is_empty() {
        println!("{}", "No servers available.".yellow());
        return Ok(());
    }

    print_servers_table(&servers);
    if !include_secondary {
        println!(
            "{}",
            "Secondary servers are hidden, use --secondary to show them".dimmed()
        );
    }
    Ok(())
}

fn print_servers_table(servers: &ServerList) {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);

    let header = ["ID", "Name", "Location", "Load", "Tier"];
    table.set_header(
        header
            .iter()
            .map(|title| Cell::new(title).add_attribute(Attribute::Bold).fg(Color::Cyan)),
    );

    for server in servers.iter() {
        let tier_color = match server.tier {
            ServerTier::Primary => Color::Green,
            ServerTier::Secondary => Color::DarkGrey,
        };
        table.add_row(vec![
            Cell::new(&server.id).fg(Color::Green),
            Cell::new(&server.name),
            Cell::new(format!("{}, {}", server.city, server.country)),
            Cell::new(format!("{:.0}%", server.load * 100.0)).fg(load_color(server.load)),
            Cell::new(server.tier.as_str()).fg(tier_color),
        ]);
    }

    println!();
    println!("{}", table);
    println!();
    println!("{} server(s) found", servers.len().to_string().cyan());
    println!();
}

fn load_color(load: f64) -> Color {
    if load < 0.5 {
        Color::Green
    } else if load < 0.8 {
        Color::Yellow
    } else {
        Color::Red
    }
}

/// Spinner that follows the connect attempt
struct CliConnectHandler {
    spinner: ProgressBar,
}

impl CliConnectHandler {
    fn new(server: &Server) -> Self {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            spinner.set_style(style);
        }
        spinner.set_message(format!("Connecting to {}...", server.name));
        spinner.enable_steady_tick(Duration::from_millis(100));
        Self { spinner }
    }
}

impl ConnectEventHandler for CliConnectHandler {
    fn on_status(&mut self, status: TunnelStatus, _server: Option<&Server>) {
        if status == TunnelStatus::NotRunning {
            self.spinner.set_message("Waiting for the previous tunnel to close...");
        }
    }

    fn on_connected(&mut self, server: Option<&Server>) {
        self.spinner.finish_and_clear();
        let label = server
            .map(|s| format!("{} ({}, {})", s.name, s.city, s.country))
            .unwrap_or_else(|| "server".to_string());
        println!("{}", format!("✓ Connected to {}", label).green().bold());
    }
}

/// Pick the requested server, or the one the daemon last used
fn target_server_id(requested: Option<String>, status: &StatusResponse) -> Result<String> {
    match (requested, &status.server) {
        (Some(id), _) => Ok(id),
        (None, Some(last)) => Ok(last.id.clone()),
        (None, None) => anyhow::bail!(
            "No server given and no previous server to reconnect to. See 'dicyvpn servers'."
        ),
    }
}

async fn connect(
    client: &Client,
    mut cli_config: CliConfig,
    server_id: Option<String>,
    accept_secondary: bool,
) -> Result<()> {
    let server_id = match server_id {
        Some(id) => id,
        None => {
            let status = daemon_client::get_status(client, &cli_config.daemon_config).await?;
            let id = target_server_id(None, &status)?;
            println!("{}", format!("Reconnecting to the last server ({})", id).dimmed());
            id
        }
    };

    let servers = daemon_client::list_servers(client, &cli_config.daemon_config).await?;
    let server = servers
        .find(&server_id)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("Server '{}' not found. See 'dicyvpn servers'.", server_id))?;

    if server.tier == ServerTier::Secondary && !cli_config.accepted_secondary_servers {
        if !accept_secondary && !confirm_secondary_servers()? {
            anyhow::bail!("Secondary server terms not accepted");
        }
        cli_config.accepted_secondary_servers = true;
        if let Err(e) = cli_config.save() {
            eprintln!("{}", format!("Could not save your choice: {:#}", e).yellow());
        }
    }

    let mut handler = CliConnectHandler::new(&server);
    let result = connect_with_events(client, &cli_config.daemon_config, &server.id, &mut handler).await;
    if result.is_err() {
        handler.spinner.finish_and_clear();
    }
    result
}

fn confirm_secondary_servers() -> Result<bool> {
    println!(
        "{}",
        "Secondary servers are provided on a best-effort basis.".yellow()
    );
    println!("They may be slower, less reliable and are not covered by uptime guarantees.");
    Confirm::new()
        .with_prompt("Do you want to use secondary servers?")
        .default(false)
        .interact()
        .context("Failed to read confirmation")
}

async fn disconnect(client: &Client, cli_config: &CliConfig) -> Result<()> {
    daemon_client::disconnect(client, &cli_config.daemon_config).await?;
    println!("{}", "✓ Disconnecting".green().bold());
    Ok(())
}

fn status_label(status: TunnelStatus) -> colored::ColoredString {
    let label = status.to_string();
    match status {
        TunnelStatus::Connected => label.green().bold(),
        TunnelStatus::Connecting | TunnelStatus::Disconnecting => label.yellow(),
        TunnelStatus::NotRunning => label.dimmed(),
    }
}

async fn show_status(client: &Client, cli_config: &CliConfig) -> Result<()> {
    let status = daemon_client::get_status(client, &cli_config.daemon_config).await?;

    println!("Status: {}", status_label(status.status));
    if let Some(server) = status.server {
        let prefix = if status.status == TunnelStatus::NotRunning {
            "Last server"
        } else {
            "Server"
        };
        println!(
            "{}: {} ({}) - {}, {}",
            prefix, server.name, server.id, server.city, server.country
        );
    }
    Ok(())
}

async fn watch_events(cli_config: &CliConfig) -> Result<()> {
    let listener = EventListener::new(cli_config.daemon_config.clone());
    let mut events = listener.listen().await?;

    println!(
        "{}",
        "Connected to event stream. Press Ctrl+C to stop.".dimmed()
    );

    while let Some(event) = events.recv().await {
        match event {
            StatusEvent::Status {
                status,
                server,
                timestamp,
            } => {
                let server = server
                    .map(|s| format!(" ({})", s.id))
                    .unwrap_or_default();
                println!(
                    "{} {}{}",
                    timestamp.format("%H:%M:%S").to_string().dimmed(),
                    status_label(status),
                    server
                );
            }
            StatusEvent::Heartbeat { .. } => {
                // Ignore heartbeats in watch mode
            }
        }
    }

    Ok(())
}

async fn daemon_status(client: &Client, cli_config: &CliConfig) -> Result<()> {
    match daemon_client::health(client, &cli_config.daemon_config).await {
        Ok(()) => {
            println!("{}", "✓ Daemon is running".green().bold());
            let status = daemon_client::get_status(client, &cli_config.daemon_config).await?;
            println!("Tunnel: {}", status_label(status.status));
            Ok(())
        }
        Err(e) => {
            println!("{}", "✗ Daemon is not reachable".red().bold());
            Err(e)
        }
    }
}
