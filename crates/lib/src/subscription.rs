//! Client-side subscription lifecycle over a transport collaborator.
//!
//! States: unsubscribed -> connecting -> connected -> disconnected -> (connecting again
//! when the transport re-confirms | unsubscribed). At most one transport subscription
//! is held per `Subscription`. All callbacks run on the task that owns the
//! subscription, so no locking is involved.

use crate::dispatch::{Controller, DispatchOutcome, Dispatcher};
use serde_json::{Map, Value};

/// Channel name plus parameters, e.g. `ChatChannel` with `chat_id = "42"`.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicDescriptor {
    channel: String,
    params: Map<String, Value>,
}

impl TopicDescriptor {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            params: Map::new(),
        }
    }

    /// Add a parameter. A `channel` key is ignored.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if key != "channel" {
            self.params.insert(key, value.into());
        }
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    /// Canonical identifier string: JSON object with `channel` first, then the params.
    pub fn identifier(&self) -> String {
        let mut obj = Map::with_capacity(self.params.len() + 1);
        obj.insert("channel".to_string(), Value::String(self.channel.clone()));
        for (k, v) in &self.params {
            obj.insert(k.clone(), v.clone());
        }
        Value::Object(obj).to_string()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport connection is closed")]
    Closed,
    #[error("encoding cable command failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Handle to one transport subscription.
pub trait SubscriptionHandle {
    fn identifier(&self) -> &str;

    /// Send an action with its payload. The transport may queue it until confirmed.
    fn perform(&self, action: &str, data: Map<String, Value>) -> Result<(), TransportError>;

    /// Release the transport subscription. No further events are delivered for it afterwards.
    fn unsubscribe(&self);
}

/// Transport collaborator: creates subscriptions for topics.
pub trait Transport {
    type Handle: SubscriptionHandle;

    fn create(&self, topic: &TopicDescriptor) -> Result<Self::Handle, TransportError>;
}

/// Inbound event from the transport, demultiplexed by subscription identifier.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Connection-level hello; not tied to a subscription.
    Welcome,
    Confirmed(String),
    Rejected(String),
    Message { identifier: String, message: Value },
    /// The whole connection went away.
    Disconnected { reason: Option<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Connecting,
    Connected,
    Disconnected,
}

/// Result of `perform`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerformStatus {
    /// Handed to a connected subscription.
    Sent,
    /// Handed to the transport before the subscription was confirmed.
    Queued,
    /// Not sent (not subscribed, or the transport refused it).
    Dropped,
}

#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    #[error("creating transport subscription failed: {0}")]
    Transport(#[from] TransportError),
}

/// One controller's subscription: owns the controller, its dispatcher and the transport handle.
pub struct Subscription<C, H> {
    controller: C,
    dispatcher: Dispatcher<C>,
    handle: Option<H>,
    state: SubscriptionState,
    connected: bool,
}

impl<C: Controller, H: SubscriptionHandle> Subscription<C, H> {
    pub fn new(controller: C, dispatcher: Dispatcher<C>) -> Self {
        Self {
            controller,
            dispatcher,
            handle: None,
            state: SubscriptionState::Unsubscribed,
            connected: false,
        }
    }

    pub fn controller(&self) -> &C {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut C {
        &mut self.controller
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_subscribed(&self) -> bool {
        self.handle.is_some()
    }

    pub fn identifier(&self) -> Option<&str> {
        self.handle.as_ref().map(|h| h.identifier())
    }

    /// Create the transport subscription. Returns `Ok(false)` without touching the
    /// transport when already subscribed.
    pub fn subscribe<T>(&mut self, transport: &T, topic: &TopicDescriptor) -> Result<bool, SubscriptionError>
    where
        T: Transport<Handle = H>,
    {
        if self.handle.is_some() {
            log::debug!("{}: already subscribed, ignoring subscribe", self.controller.name());
            return Ok(false);
        }
        let handle = transport.create(topic)?;
        log::debug!("{}: subscribing to {}", self.controller.name(), handle.identifier());
        self.handle = Some(handle);
        self.state = SubscriptionState::Connecting;
        Ok(true)
    }

    /// Transport confirmed the subscription.
    pub fn on_connect(&mut self) {
        self.connected = true;
        self.state = SubscriptionState::Connected;
        self.dispatcher.recover();
        self.controller.connected();
    }

    /// Transport lost the subscription. Reconnection is the transport's business.
    pub fn on_disconnect(&mut self) {
        self.connected = false;
        self.state = SubscriptionState::Disconnected;
        self.controller.disconnected();
    }

    /// Transport refused the subscription; the handle is dropped.
    pub fn on_reject(&mut self) {
        if let Some(handle) = self.handle.take() {
            log::warn!("{}: subscription {} rejected", self.controller.name(), handle.identifier());
        }
        self.connected = false;
        self.state = SubscriptionState::Unsubscribed;
        self.controller.rejected();
    }

    pub fn on_receive(&mut self, data: &Value) -> DispatchOutcome {
        self.dispatcher.dispatch(&mut self.controller, data)
    }

    /// Tear down the transport subscription. Safe to call when not subscribed.
    pub fn unsubscribe(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.unsubscribe();
            log::debug!("{}: unsubscribed from {}", self.controller.name(), handle.identifier());
        }
        self.connected = false;
        self.state = SubscriptionState::Unsubscribed;
    }

    /// Send an action. Dropped with an error log when unsubscribed; forwarded with a
    /// warning when the subscription is not confirmed yet.
    pub fn perform(&self, action: &str, data: Map<String, Value>) -> PerformStatus {
        let Some(handle) = &self.handle else {
            log::error!(
                "{}: perform(\"{}\") called without a subscription; call subscribe first",
                self.controller.name(),
                action
            );
            return PerformStatus::Dropped;
        };
        let status = if self.connected {
            PerformStatus::Sent
        } else {
            log::warn!(
                "{}: perform(\"{}\") before the subscription is connected; the transport may queue it",
                self.controller.name(),
                action
            );
            PerformStatus::Queued
        };
        match handle.perform(action, data) {
            Ok(()) => status,
            Err(e) => {
                log::error!("{}: perform(\"{}\") failed: {}", self.controller.name(), action, e);
                PerformStatus::Dropped
            }
        }
    }

    /// Route one transport event to the matching callback. Events for other
    /// identifiers, and everything after `unsubscribe`, are ignored.
    pub fn handle_event(&mut self, event: &TransportEvent) -> Option<DispatchOutcome> {
        match event {
            TransportEvent::Welcome => None,
            TransportEvent::Confirmed(id) if self.owns(id) => {
                self.on_connect();
                None
            }
            TransportEvent::Rejected(id) if self.owns(id) => {
                self.on_reject();
                None
            }
            TransportEvent::Message {
                identifier,
                message,
            } if self.owns(identifier) => Some(self.on_receive(message)),
            TransportEvent::Disconnected { reason } if self.handle.is_some() => {
                if let Some(reason) = reason {
                    log::info!("{}: disconnected ({})", self.controller.name(), reason);
                }
                self.on_disconnect();
                None
            }
            _ => None,
        }
    }

    fn owns(&self, identifier: &str) -> bool {
        self.identifier() == Some(identifier)
    }
}
