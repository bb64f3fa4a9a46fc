//! Control message dispatcher
//!
//! Drains [`ControlEvent`]s on its own thread and routes each message to the
//! component that owns it.

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::constants::DEFAULT_RECV_TIMEOUT_MS;
use crate::error::NetworkError;
use crate::network::control::{ControlEvent, ControlLink};
use crate::network::handshake::HandshakeCoordinator;
use crate::network::sink::{AudioSink, Liveness, TextSink};
use crate::protocol::{message_type, ImageAnalysis};

/// Receiver of control messages whose type has no dedicated handler
pub type JsonCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Invoked with the `session_id` of an inbound goodbye, if any
pub type GoodbyeHandler = Box<dyn Fn(Option<&str>) + Send + Sync>;

/// Routes control-plane events
pub struct Dispatcher {
    link: Arc<ControlLink>,
    audio_topic: String,
    handshake: Arc<HandshakeCoordinator>,
    liveness: Arc<Liveness>,
    legacy_audio: Option<Arc<dyn AudioSink>>,
    text_sink: Option<Arc<dyn TextSink>>,
    json_callback: Arc<RwLock<Option<JsonCallback>>>,
    on_goodbye: GoodbyeHandler,
}

impl Dispatcher {
    pub fn new(
        link: Arc<ControlLink>,
        handshake: Arc<HandshakeCoordinator>,
        liveness: Arc<Liveness>,
        on_goodbye: GoodbyeHandler,
    ) -> Self {
        let audio_topic = link.audio_topic();
        Self {
            link,
            audio_topic,
            handshake,
            liveness,
            legacy_audio: None,
            text_sink: None,
            json_callback: Arc::new(RwLock::new(None)),
            on_goodbye,
        }
    }

    /// Sink for raw audio published on the `/audio` sub-topic
    pub fn with_legacy_audio(mut self, sink: Option<Arc<dyn AudioSink>>) -> Self {
        self.legacy_audio = sink;
        self
    }

    /// Sink for text extracted from image analysis notices
    pub fn with_text_sink(mut self, sink: Option<Arc<dyn TextSink>>) -> Self {
        self.text_sink = sink;
        self
    }

    /// Share a callback slot that can be filled after the thread starts
    pub fn with_json_callback(mut self, slot: Arc<RwLock<Option<JsonCallback>>>) -> Self {
        self.json_callback = slot;
        self
    }

    /// Handle a single event
    pub fn dispatch(&self, event: ControlEvent) {
        match event {
            ControlEvent::Connected => {
                tracing::info!("Control channel connected");
                self.link.on_connected();
            }
            ControlEvent::Disconnected => {
                tracing::info!("Control channel disconnected");
            }
            ControlEvent::Message { topic, payload } => {
                if topic == self.audio_topic {
                    self.on_legacy_audio(payload);
                } else {
                    self.on_json(&payload);
                }
            }
        }
    }

    fn on_legacy_audio(&self, payload: Bytes) {
        tracing::debug!("Received {} bytes on {}", payload.len(), self.audio_topic);
        self.liveness.touch();
        match &self.legacy_audio {
            Some(sink) => sink.on_audio(payload),
            None => tracing::debug!("No legacy audio sink, dropping payload"),
        }
    }

    fn on_json(&self, payload: &[u8]) {
        let message: Value = match serde_json::from_slice(payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(
                    "Failed to parse json message {}: {}",
                    String::from_utf8_lossy(payload),
                    e
                );
                return;
            }
        };

        let kind = match message.get("type").and_then(Value::as_str) {
            Some(kind) => kind,
            None => {
                tracing::error!("Message type is not specified");
                return;
            }
        };

        self.liveness.touch();

        match kind {
            message_type::HELLO => self.handshake.on_server_hello(&message),
            message_type::GOODBYE => {
                let session_id = message.get("session_id").and_then(Value::as_str);
                tracing::info!("Received goodbye message, session_id: {}", session_id.unwrap_or("null"));
                (self.on_goodbye)(session_id);
            }
            message_type::IMAGE_ANALYSIS => self.on_image_analysis(message.clone()),
            _ => {
                let callback = self.json_callback.read().clone();
                match callback {
                    Some(callback) => callback(&message),
                    None => tracing::debug!("Unhandled control message type {}", kind),
                }
            }
        }
    }

    fn on_image_analysis(&self, message: Value) {
        let analysis: ImageAnalysis = match serde_json::from_value(message) {
            Ok(analysis) => analysis,
            Err(e) => {
                tracing::error!("Malformed image analysis message: {}", e);
                return;
            }
        };

        let Some(text) = analysis.spoken_text() else {
            tracing::debug!("Image analysis without usable result");
            return;
        };

        match &self.text_sink {
            Some(sink) => sink.on_text(text),
            None => tracing::warn!("No text sink for image analysis result"),
        }
    }

    /// Run the dispatch loop on a dedicated thread
    pub fn spawn(self, events: Receiver<ControlEvent>) -> Result<DispatcherHandle, NetworkError> {
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = running.clone();

        let thread = thread::Builder::new()
            .name("control-dispatch".to_string())
            .spawn(move || self.run(events, thread_running))
            .map_err(|e| NetworkError::ReceiveFailed(e.to_string()))?;

        Ok(DispatcherHandle {
            running,
            thread: Some(thread),
        })
    }

    fn run(self, events: Receiver<ControlEvent>, running: Arc<AtomicBool>) {
        let timeout = Duration::from_millis(DEFAULT_RECV_TIMEOUT_MS);

        while running.load(Ordering::Relaxed) {
            match events.recv_timeout(timeout) {
                Ok(event) => self.dispatch(event),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    tracing::debug!("Control event queue closed");
                    break;
                }
            }
        }
    }
}

/// Owner of the dispatcher thread
pub struct DispatcherHandle {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DispatcherHandle {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
            && self.thread.as_ref().map_or(false, |t| !t.is_finished())
    }

    /// Stop the thread and wait for it
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            // stopping from a handler running on the dispatcher itself
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
