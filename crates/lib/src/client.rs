//! Cable client: one WebSocket connection to the gateway, shared by any number
//! of subscriptions.
//!
//! `connect` spawns a writer task (commands out) and a reader task (frames in).
//! Server frames are decoded into `TransportEvent`s and delivered on the returned
//! receiver; the owner feeds them to its `Subscription`s.

use crate::gateway::{ClientCommand, ServerFrame};
use crate::subscription::{SubscriptionHandle, TopicDescriptor, Transport, TransportError, TransportEvent};
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// Connected cable. Cloning shares the connection.
#[derive(Debug, Clone)]
pub struct CableClient {
    outbound: mpsc::UnboundedSender<String>,
}

impl CableClient {
    /// Open the cable at `url` (e.g. `ws://127.0.0.1:15152/cable?user=ada`).
    /// The receiver yields events until the connection ends with `Disconnected`.
    pub async fn connect(url: &str) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .with_context(|| format!("connecting to {}", url))?;
        let (mut ws_tx, mut ws_rx) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<TransportEvent>();

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = ws_tx.send(Message::Text(text)).await {
                    log::debug!("cable write failed: {}", e);
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        tokio::spawn(async move {
            let mut reason = None;
            while let Some(msg) = ws_rx.next().await {
                let text = match msg {
                    Ok(Message::Text(t)) => t,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        log::debug!("cable read failed: {}", e);
                        break;
                    }
                };
                match parse_server_frame(&text) {
                    Some(TransportEvent::Disconnected { reason: r }) => {
                        reason = r;
                        break;
                    }
                    Some(event) => {
                        if event_tx.send(event).is_err() {
                            return;
                        }
                    }
                    None => {}
                }
            }
            let _ = event_tx.send(TransportEvent::Disconnected { reason });
        });

        Ok((Self { outbound: out_tx }, event_rx))
    }

    fn send(&self, cmd: &ClientCommand) -> Result<(), TransportError> {
        let text = serde_json::to_string(cmd)?;
        self.outbound.send(text).map_err(|_| TransportError::Closed)
    }

    /// True once the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

impl Transport for CableClient {
    type Handle = CableHandle;

    fn create(&self, topic: &TopicDescriptor) -> Result<CableHandle, TransportError> {
        let identifier = topic.identifier();
        self.send(&ClientCommand::subscribe(identifier.clone()))?;
        Ok(CableHandle {
            identifier,
            client: self.clone(),
        })
    }
}

/// One subscription on a `CableClient`.
#[derive(Debug)]
pub struct CableHandle {
    identifier: String,
    client: CableClient,
}

impl SubscriptionHandle for CableHandle {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn perform(&self, action: &str, data: Map<String, Value>) -> Result<(), TransportError> {
        self.client
            .send(&ClientCommand::message(self.identifier.clone(), action, data))
    }

    fn unsubscribe(&self) {
        if let Err(e) = self.client.send(&ClientCommand::unsubscribe(self.identifier.clone())) {
            log::debug!("unsubscribe {} not sent: {}", self.identifier, e);
        }
    }
}

/// Decode one server frame. Pings and unrecognised frames yield None.
pub fn parse_server_frame(text: &str) -> Option<TransportEvent> {
    let frame: ServerFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            log::debug!("ignoring undecodable cable frame: {}", e);
            return None;
        }
    };
    match (frame.typ.as_deref(), frame.identifier, frame.message) {
        (Some("welcome"), _, _) => Some(TransportEvent::Welcome),
        (Some("ping"), _, _) => {
            log::trace!("cable ping");
            None
        }
        (Some("confirm_subscription"), Some(id), _) => Some(TransportEvent::Confirmed(id)),
        (Some("reject_subscription"), Some(id), _) => Some(TransportEvent::Rejected(id)),
        (Some("disconnect"), _, _) => Some(TransportEvent::Disconnected {
            reason: frame.reason,
        }),
        (None, Some(identifier), Some(message)) => Some(TransportEvent::Message { identifier, message }),
        (typ, _, _) => {
            log::debug!("ignoring cable frame of type {:?}", typ);
            None
        }
    }
}
