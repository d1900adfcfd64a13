//! ControlClient - Reconnecting Operator Channel Client
//!
//! ## Responsibilities
//!
//! - Hold one WebSocket session to the coordinator
//! - Reconnect after a drop under a bounded linear backoff
//! - Stop retrying after the last attempt until `reconnect()` is called
//! - Surface decoded pushes/replies and lifecycle changes as events
//!
//! Attempt counters belong to one client instance; two clients never share
//! backoff state.

use super::connection::ConnectionState;
use super::protocol::{ClientRequest, ServerMessage};
use crate::error::{Error, Result};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Bounded linear reconnect policy
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    /// Delay before attempt `k` is `base_delay * k`
    pub base_delay: Duration,
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(3000),
        }
    }
}

/// What the client reports to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    StateChanged(ConnectionState),
    Message(ServerMessage),
    RetryScheduled { attempt: u32, delay: Duration },
    /// Automatic retries exhausted; only `reconnect()` resumes
    GaveUp { attempts: u32 },
}

enum Control {
    Reconnect,
    Shutdown,
}

enum SessionEnd {
    Dropped,
    Shutdown,
}

/// Handle to a running control client
pub struct ControlClient {
    requests: mpsc::UnboundedSender<ClientRequest>,
    control: mpsc::UnboundedSender<Control>,
    state: watch::Receiver<ConnectionState>,
}

impl ControlClient {
    /// Start connecting to `url` in the background
    pub fn spawn(
        url: impl Into<String>,
        policy: ReconnectPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let driver = Driver {
            url: url.into(),
            policy,
            requests: request_rx,
            control: control_rx,
            events: event_tx,
            state: state_tx,
        };
        tokio::spawn(driver.run());

        (
            Self {
                requests: request_tx,
                control: control_tx,
                state: state_rx,
            },
            event_rx,
        )
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Send a request on the live connection
    pub fn send(&self, request: ClientRequest) -> Result<()> {
        if !self.state().is_connected() {
            return Err(Error::ChannelClosed(format!(
                "cannot send {} while {}",
                request.kind(),
                self.state()
            )));
        }
        self.requests
            .send(request)
            .map_err(|_| Error::ChannelClosed("control client stopped".to_string()))
    }

    /// Connect now, resetting the attempt counter and cancelling any pending backoff
    pub fn reconnect(&self) -> Result<()> {
        self.control
            .send(Control::Reconnect)
            .map_err(|_| Error::ChannelClosed("control client stopped".to_string()))
    }

    pub fn shutdown(&self) {
        let _ = self.control.send(Control::Shutdown);
    }
}

struct Driver {
    url: String,
    policy: ReconnectPolicy,
    requests: mpsc::UnboundedReceiver<ClientRequest>,
    control: mpsc::UnboundedReceiver<Control>,
    events: mpsc::UnboundedSender<ClientEvent>,
    state: watch::Sender<ConnectionState>,
}

impl Driver {
    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: ConnectionState) {
        if *self.state.borrow() != state {
            let _ = self.state.send(state);
            self.emit(ClientEvent::StateChanged(state));
        }
    }

    async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            self.set_state(ConnectionState::Connecting);
            match connect_async(self.url.as_str()).await {
                Ok((ws, _)) => {
                    attempt = 0;
                    tracing::info!(url = %self.url, "Control channel connected");
                    self.set_state(ConnectionState::Connected);
                    if let SessionEnd::Shutdown = self.session(ws).await {
                        break;
                    }
                    tracing::warn!(url = %self.url, "Control channel dropped");
                    self.set_state(ConnectionState::Closed);
                }
                Err(e) => {
                    tracing::warn!(url = %self.url, attempt = attempt, error = %e, "Control channel connect failed");
                }
            }

            if attempt >= self.policy.max_attempts {
                tracing::error!(attempts = attempt, "Reconnect attempts exhausted");
                self.set_state(ConnectionState::Disconnected);
                self.emit(ClientEvent::GaveUp { attempts: attempt });
                match self.control.recv().await {
                    Some(Control::Reconnect) => {
                        attempt = 0;
                        continue;
                    }
                    Some(Control::Shutdown) | None => break,
                }
            }

            attempt += 1;
            let delay = self.policy.delay_for(attempt);
            self.set_state(ConnectionState::Backoff);
            self.emit(ClientEvent::RetryScheduled { attempt, delay });
            tracing::info!(attempt = attempt, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                control = self.control.recv() => match control {
                    Some(Control::Reconnect) => {
                        tracing::info!("Manual reconnect, backoff cancelled");
                        attempt = 0;
                    }
                    Some(Control::Shutdown) | None => break,
                },
            }
        }

        self.set_state(ConnectionState::Disconnected);
        tracing::info!("Control client stopped");
    }

    async fn session(&mut self, ws: WsStream) -> SessionEnd {
        let (mut write, mut read) = ws.split();

        loop {
            tokio::select! {
                incoming = read.next() => match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(message) => self.emit(ClientEvent::Message(message)),
                            Err(e) => tracing::warn!(error = %e, "Undecodable server message"),
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => return SessionEnd::Dropped,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Control channel error");
                        return SessionEnd::Dropped;
                    }
                },
                request = self.requests.recv() => {
                    let Some(request) = request else {
                        return SessionEnd::Shutdown;
                    };
                    let json = match serde_json::to_string(&request) {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to encode request");
                            continue;
                        }
                    };
                    if let Err(e) = write.send(WsMessage::Text(json.into())).await {
                        tracing::warn!(error = %e, "Failed to send request");
                        return SessionEnd::Dropped;
                    }
                },
                control = self.control.recv() => match control {
                    // Already connected
                    Some(Control::Reconnect) => {}
                    Some(Control::Shutdown) | None => {
                        let _ = write.send(WsMessage::Close(None)).await;
                        return SessionEnd::Shutdown;
                    }
                },
            }
        }
    }
}
