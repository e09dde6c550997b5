// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! ipcsim Server
//!
//! Serves the scheduler over WebSocket, or prints a session token with
//! `ipcsim-server issue-token <role> [user-id]`.

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use ipcsim_server::{Config, TokenAuthority};

#[derive(Debug, Parser)]
#[command(name = "ipcsim-server", version, about = "Admission-controlled process scheduler server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the server (default).
    Serve,
    /// Print a session token for a role.
    IssueToken {
        /// Role the token grants.
        role: String,
        /// User id recorded in the token.
        #[arg(default_value = "cli")]
        user_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ipcsim_server=info,ipcsim_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::IssueToken { role, user_id } => {
            let permission = config
                .permissions
                .get(&role)
                .ok_or_else(|| anyhow::anyhow!("unknown role '{role}'"))?;
            let token = TokenAuthority::new(&config.jwt_secret).issue(
                &role,
                &user_id,
                Some(permission),
            )?;
            println!("{token}");
            Ok(())
        }
        Command::Serve => {
            info!(
                addr = %config.bind_addr,
                max_connections = config.max_connections,
                queue_max_size = config.scheduler.queue.max_size,
                "Starting ipcsim server"
            );

            let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
            ipcsim_server::serve(config, listener, shutdown_signal()).await?;

            info!("ipcsim server shut down");
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
