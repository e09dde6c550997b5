// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! ipcsim Client - reconnecting WebSocket client and traffic simulator
//!
//! [`IpcClient`] speaks the server's WebSocket protocol: it authenticates
//! on every connection, submits actions within the role's concurrency cap,
//! keeps the rest in a local pending queue and reconnects with a random
//! backoff. [`TrafficSimulator`] runs many clients with random roles and
//! actions and reports latency and success statistics.
//!
//! # Usage
//!
//! ```no_run
//! use ipcsim_client::{ClientConfig, ClientEvent, IpcClient, TokenSource};
//! use ipcsim_core::{Action, ActionType, ProcessType};
//!
//! # async fn example() -> Result<(), ipcsim_client::ClientError> {
//! let config = ClientConfig::new(
//!     "ws://localhost:3000/ws",
//!     "operator",
//!     TokenSource::Secret("secret".to_string()),
//! );
//! let mut client = IpcClient::spawn(config);
//! client.submit(Action::new(ActionType::Consulta, ProcessType::Database))?;
//! while let Some(event) = client.next_event().await {
//!     if let ClientEvent::ActionFinished(reply) = event {
//!         println!("{:?} after {:?}", reply.status, reply.latency);
//!         break;
//!     }
//! }
//! client.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! See [`ClientConfig::from_env`] and [`SimulationConfig::from_env`].

#![deny(missing_docs)]

/// Reconnecting WebSocket client.
pub mod client;

/// Client and simulator configuration.
pub mod config;

/// Client error types.
pub mod error;

/// Traffic simulator.
pub mod simulator;

/// Connection-independent client state.
pub mod state;

pub use client::IpcClient;
pub use config::{ClientConfig, ReconnectPolicy, SimulationConfig, TokenSource};
pub use error::{ClientError, SubmitRejection};
pub use simulator::{ClientReport, LatencyStats, SimulationReport, TrafficSimulator};
pub use state::{ActionReply, ClientEvent, ClientState, ClientStats};
