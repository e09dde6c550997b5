// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! ipcsim Client
//!
//! `ipcsim-client run` keeps one client submitting random actions until
//! interrupted. `ipcsim-client simulate` runs many clients with random
//! roles and prints the final report as JSON.

use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use ipcsim_client::{ClientConfig, SimulationConfig, TrafficSimulator};

#[derive(Debug, Parser)]
#[command(name = "ipcsim-client", version, about = "Client and traffic simulator for ipcsim")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one client until interrupted.
    Run {
        /// Role to authenticate as (default: CLIENT_ROLE).
        #[arg(long)]
        role: Option<String>,
    },
    /// Run many clients with random roles.
    Simulate {
        /// Concurrent clients (default: NUM_CLIENTS).
        #[arg(long)]
        clients: Option<usize>,
        /// Run time in seconds (default: SIMULATION_DURATION).
        #[arg(long)]
        duration: Option<u64>,
        /// Use this role for every client.
        #[arg(long)]
        role: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ipcsim_client=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let cli = Cli::parse();
    let mut client = ClientConfig::from_env()?;
    let mut settings = SimulationConfig::from_env()?;

    match cli.command {
        Command::Run { role } => {
            if let Some(role) = role {
                client = client.with_role(role);
            }
            settings.clients = 1;
            settings.role = Some(client.role.clone());
            settings.duration = None;
        }
        Command::Simulate {
            clients,
            duration,
            role,
        } => {
            if let Some(clients) = clients {
                settings.clients = clients;
            }
            if let Some(seconds) = duration {
                settings.duration = Some(Duration::from_secs(seconds));
            }
            settings.role = role;
        }
    }
    settings.validate()?;

    let report = TrafficSimulator::new(client, settings)
        .run(shutdown_signal())
        .await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.clients > 0 && report.failed_clients == report.clients {
        anyhow::bail!("every client failed");
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
