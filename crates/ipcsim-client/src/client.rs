// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reconnecting WebSocket client.
//!
//! ```text
//! IpcClient ──commands──► driver task ──frames──► server
//!     ▲                      │ ClientState
//!     └──────events──────────┘
//! ```
//!
//! The driver authenticates on every connection. When the connection drops
//! it waits a random delay from [`ReconnectPolicy`](crate::config::ReconnectPolicy)
//! and tries again, giving up after `max_attempts` consecutive failures.
//! Submissions made while offline wait in the local pending queue.

use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use ipcsim_core::Action;
use ipcsim_server::{ClientMessage, ServerMessage};

use crate::config::ClientConfig;
use crate::error::{ClientError, SubmitRejection};
use crate::state::{ClientEvent, ClientState, ClientStats};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Sink = SplitSink<Socket, Message>;

#[derive(Debug)]
enum Command {
    Submit(Action),
    Interrupt(String),
    Shutdown,
}

enum SessionEnd {
    Disconnected,
    Shutdown,
}

/// Handle to a running client.
///
/// Events queue up until read with [`IpcClient::next_event`].
pub struct IpcClient {
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedReceiver<ClientEvent>,
    stats: watch::Receiver<ClientStats>,
    task: JoinHandle<Result<ClientStats, ClientError>>,
}

impl std::fmt::Debug for IpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcClient")
            .field("finished", &self.task.is_finished())
            .finish_non_exhaustive()
    }
}

impl IpcClient {
    /// Start connecting in the background.
    pub fn spawn(config: ClientConfig) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        let (stats_tx, stats) = watch::channel(ClientStats::default());

        let driver = Driver {
            state: ClientState::new(config.role.clone(), config.pending_queue_size),
            config,
            events: event_tx,
            stats: stats_tx,
        };
        let task = tokio::spawn(driver.run(command_rx));

        Self {
            commands,
            events,
            stats,
            task,
        }
    }

    /// Submit an action. Rejections arrive as [`ClientEvent::Rejected`].
    pub fn submit(&self, action: Action) -> Result<(), ClientError> {
        self.command(Command::Submit(action))
    }

    /// Ask the server to interrupt a process.
    pub fn interrupt(&self, process_id: impl Into<String>) -> Result<(), ClientError> {
        self.command(Command::Interrupt(process_id.into()))
    }

    /// Next observed event; `None` once the client has stopped.
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.events.recv().await
    }

    /// Latest counters.
    pub fn stats(&self) -> ClientStats {
        self.stats.borrow().clone()
    }

    /// Counters that update as the client runs.
    pub fn stats_watch(&self) -> watch::Receiver<ClientStats> {
        self.stats.clone()
    }

    /// Whether the client has stopped on its own.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Close the connection and return the final counters, or the error
    /// that stopped the client.
    pub async fn shutdown(self) -> Result<ClientStats, ClientError> {
        let _ = self.commands.send(Command::Shutdown);
        self.task
            .await
            .map_err(|e| ClientError::Stopped(e.to_string()))?
    }

    fn command(&self, command: Command) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .map_err(|_| ClientError::Stopped("connection task has exited".to_string()))
    }
}

struct Driver {
    config: ClientConfig,
    state: ClientState,
    events: mpsc::UnboundedSender<ClientEvent>,
    stats: watch::Sender<ClientStats>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) -> Result<ClientStats, ClientError> {
        let mut attempt = 0u32;

        loop {
            match connect_async(self.config.server_url.as_str()).await {
                Ok((socket, _)) => {
                    info!(
                        url = %self.config.server_url,
                        role = %self.state.role(),
                        "Connected to server"
                    );
                    attempt = 0;
                    let end = self.session(socket, &mut commands).await;
                    let lost = self.state.on_disconnect();
                    self.publish();
                    match end? {
                        SessionEnd::Shutdown => {
                            info!(role = %self.state.role(), "Client stopped");
                            return Ok(self.state.stats().clone());
                        }
                        SessionEnd::Disconnected => {
                            self.emit(ClientEvent::Disconnected { lost });
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        url = %self.config.server_url,
                        attempt,
                        error = %e,
                        "Connection failed"
                    );
                    if attempt >= self.config.reconnect.max_attempts {
                        warn!(attempts = attempt, "Giving up on the server");
                        return Err(ClientError::ReconnectExhausted { attempts: attempt });
                    }
                }
            }

            attempt += 1;
            let delay = self.config.reconnect.delay();
            self.state.on_reconnect_attempt();
            self.publish();
            info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");
            self.emit(ClientEvent::Reconnecting { attempt, delay });

            if self.backoff(delay, &mut commands).await {
                info!(role = %self.state.role(), "Client stopped while offline");
                return Ok(self.state.stats().clone());
            }
        }
    }

    /// Serve one connection until it drops or the client shuts down.
    async fn session(
        &mut self,
        socket: Socket,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Result<SessionEnd, ClientError> {
        let (mut sink, mut stream) = socket.split();

        let token = self.config.token.token_for(self.state.role())?;
        let auth = self.state.on_connected(token);
        if !send(&mut sink, &auth).await? {
            return Ok(SessionEnd::Disconnected);
        }

        loop {
            tokio::select! {
                frame = stream.next() => {
                    let text = match frame {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => {
                            info!("Server closed the connection");
                            return Ok(SessionEnd::Disconnected);
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            warn!(error = %e, "WebSocket read failed");
                            return Ok(SessionEnd::Disconnected);
                        }
                    };
                    let message = match serde_json::from_str::<ServerMessage>(text.as_str()) {
                        Ok(message) => message,
                        Err(e) => {
                            warn!(error = %e, "Undecodable server frame");
                            continue;
                        }
                    };

                    let (event, frames) = self.state.on_message(message);
                    for frame in &frames {
                        if !send(&mut sink, frame).await? {
                            return Ok(SessionEnd::Disconnected);
                        }
                    }
                    self.publish();

                    match event {
                        Some(ClientEvent::AuthFailed(reason)) => {
                            self.emit(ClientEvent::AuthFailed(reason.clone()));
                            let _ = sink.send(Message::Close(None)).await;
                            return Err(ClientError::AuthRejected(reason));
                        }
                        Some(event) => self.emit(event),
                        None => {}
                    }
                }
                command = commands.recv() => {
                    let frame = match command {
                        Some(Command::Submit(action)) => self.accept(action),
                        Some(Command::Interrupt(process_id)) => self.interrupt(process_id),
                        Some(Command::Shutdown) | None => {
                            let _ = sink.send(Message::Close(None)).await;
                            return Ok(SessionEnd::Shutdown);
                        }
                    };
                    if let Some(frame) = frame {
                        if !send(&mut sink, &frame).await? {
                            return Ok(SessionEnd::Disconnected);
                        }
                    }
                    self.publish();
                }
            }
        }
    }

    /// Wait out a reconnect delay while still accepting commands.
    /// Returns true when the client was shut down.
    async fn backoff(
        &mut self,
        delay: Duration,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                command = commands.recv() => match command {
                    // Offline submissions always land in the pending queue.
                    Some(Command::Submit(action)) => {
                        let _ = self.accept(action);
                        self.publish();
                    }
                    Some(Command::Interrupt(process_id)) => {
                        let _ = self.interrupt(process_id);
                    }
                    Some(Command::Shutdown) | None => return true,
                },
            }
        }
    }

    fn accept(&mut self, action: Action) -> Option<ClientMessage> {
        match self.state.submit(action) {
            Ok(frame) => frame,
            Err(rejection) => {
                debug!(reason = %rejection, "Submission rejected");
                self.emit(ClientEvent::Rejected(rejection));
                None
            }
        }
    }

    fn interrupt(&self, process_id: String) -> Option<ClientMessage> {
        if self.state.is_authenticated() {
            return Some(ClientMessage::Interrumpir { process_id });
        }
        self.emit(ClientEvent::Rejected(SubmitRejection::NotAuthenticated));
        None
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn publish(&self) {
        self.stats.send_replace(self.state.stats().clone());
    }
}

/// Send `frame`. Returns false when the socket is gone.
async fn send(sink: &mut Sink, frame: &ClientMessage) -> Result<bool, ClientError> {
    let text = frame.to_json()?;
    match sink.send(Message::text(text)).await {
        Ok(()) => Ok(true),
        Err(e) => {
            warn!(error = %e, "WebSocket write failed");
            Ok(false)
        }
    }
}
