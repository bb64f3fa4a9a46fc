//! Control channel adapter
//!
//! The pub/sub client itself is an external collaborator behind
//! [`ControlChannel`]. It reports connection changes and inbound messages as
//! [`ControlEvent`]s pushed into a queue that the dispatcher drains, so no
//! protocol logic ever runs nested inside a client callback.

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;

use crate::config::ControlConfig;
use crate::constants::CONTROL_QUEUE_CAPACITY;
use crate::error::{Error, NetworkError};

/// Delivery guarantee requested on subscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    /// Fire and forget: no retransmission, no ordering guarantee
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

/// Login data for the broker
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub keepalive_secs: u64,
}

/// Events raised by the pub/sub client
#[derive(Debug, Clone)]
pub enum ControlEvent {
    Connected,
    Disconnected,
    Message { topic: String, payload: Bytes },
}

/// Queue connecting a client to the dispatcher
pub fn event_queue() -> (Sender<ControlEvent>, Receiver<ControlEvent>) {
    crossbeam_channel::bounded(CONTROL_QUEUE_CAPACITY)
}

/// Publish/subscribe client contract
pub trait ControlChannel: Send + Sync {
    fn connect(
        &self,
        endpoint: &str,
        port: u16,
        client_id: &str,
        credentials: &Credentials,
    ) -> Result<(), NetworkError>;

    fn is_connected(&self) -> bool;

    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), NetworkError>;

    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), NetworkError>;

    fn disconnect(&self);
}

/// Control link bound to the configured endpoint and topics
pub struct ControlLink {
    config: ControlConfig,
    client_id: String,
    client: Arc<dyn ControlChannel>,
}

impl ControlLink {
    pub fn new(config: ControlConfig, client: Arc<dyn ControlChannel>) -> Self {
        let client_id = config.effective_client_id();
        Self {
            config,
            client_id,
            client,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn subscribe_topic(&self) -> &str {
        &self.config.subscribe_topic
    }

    pub fn audio_topic(&self) -> String {
        self.config.audio_topic()
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    /// Connect unless already connected
    ///
    /// Fails with a configuration error, before touching the network, when
    /// no endpoint is configured.
    pub fn ensure_connected(&self) -> crate::Result<()> {
        if self.client.is_connected() {
            return Ok(());
        }

        if self.config.endpoint.is_empty() {
            tracing::warn!("Control endpoint is not specified");
            return Err(Error::Config("control endpoint is not specified".into()));
        }

        let credentials = Credentials {
            username: self.config.username.clone(),
            password: self.config.password.clone(),
            keepalive_secs: self.config.keepalive_secs,
        };

        tracing::info!(
            "Connecting to control endpoint {}:{} as {}",
            self.config.endpoint,
            self.config.port,
            self.client_id
        );

        self.client
            .connect(&self.config.endpoint, self.config.port, &self.client_id, &credentials)
            .map_err(|e| {
                tracing::error!("Failed to connect to control endpoint: {}", e);
                Error::Network(e)
            })?;

        // subscribe before anything is published; the Connected event repeats
        // this after reconnects made by the client itself
        self.on_connected();
        Ok(())
    }

    /// Subscribe to the control topic and the legacy audio sub-topic
    pub fn on_connected(&self) {
        let audio_topic = self.audio_topic();
        for topic in [self.config.subscribe_topic.as_str(), audio_topic.as_str()] {
            if let Err(e) = self.client.subscribe(topic, QoS::AtMostOnce) {
                tracing::error!("Failed to subscribe to {}: {}", topic, e);
            }
        }
    }

    /// Publish text on the configured publish topic
    ///
    /// An empty publish topic silently discards the message.
    pub fn publish_text(&self, text: &str) -> Result<(), NetworkError> {
        if self.config.publish_topic.is_empty() {
            return Ok(());
        }
        if !self.client.is_connected() {
            return Err(NetworkError::NotConnected);
        }

        self.client.publish(&self.config.publish_topic, text.as_bytes())
    }

    pub fn disconnect(&self) {
        self.client.disconnect();
    }
}
