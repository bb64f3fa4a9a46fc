//! Audio channel session lifecycle
//!
//! [`AudioChannel`] ties the control link, the handshake and the secure
//! transport together:
//!
//! ```text
//! Idle/Closed/Error ──open──> AwaitingHello ──ack──> Open
//!                                   │                  │
//!                                   └─timeout/invalid─>Error
//!        any state <────────────── close / goodbye ────┘
//! ```

use bytes::Bytes;
use crossbeam_channel::Receiver;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;

use crate::config::AppConfig;
use crate::constants::EVENT_CHANNEL_CAPACITY;
use crate::error::{CryptoError, Error, ErrorKind, HandshakeError, Result};
use crate::network::{
    AudioSink, ControlChannel, ControlEvent, ControlLink, DatagramConnector, Dispatcher,
    DispatcherHandle, HandshakeCoordinator, JsonCallback, Liveness, SecureTransport, TextSink,
    TransportStats,
};
use crate::protocol::Goodbye;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    AwaitingHello,
    Open,
    Closed,
    Error,
}

/// Events emitted by the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Opened { session_id: String },
    Closed { session_id: String },
    Error(ErrorKind),
}

/// Sinks the channel delivers into
pub struct ChannelSinks {
    /// Decrypted audio from the datagram transport
    pub incoming_audio: Arc<dyn AudioSink>,
    /// Raw audio published on the `/audio` control sub-topic
    pub legacy_audio: Option<Arc<dyn AudioSink>>,
    /// Text from image analysis notices
    pub text: Option<Arc<dyn TextSink>>,
}

impl ChannelSinks {
    pub fn new(incoming_audio: Arc<dyn AudioSink>) -> Self {
        Self {
            incoming_audio,
            legacy_audio: None,
            text: None,
        }
    }

    pub fn with_legacy_audio(mut self, sink: Arc<dyn AudioSink>) -> Self {
        self.legacy_audio = Some(sink);
        self
    }

    pub fn with_text(mut self, sink: Arc<dyn TextSink>) -> Self {
        self.text = Some(sink);
        self
    }
}

struct Session {
    state: ChannelState,
    session_id: String,
    server_sample_rate: u32,
    error: Option<ErrorKind>,
    /// Bumped by every close; an open that started under an older epoch
    /// must not install its session
    epoch: u64,
}

/// Dispatcher inputs kept until `start`
struct PendingDispatch {
    events: Receiver<ControlEvent>,
    legacy_audio: Option<Arc<dyn AudioSink>>,
    text: Option<Arc<dyn TextSink>>,
}

struct ChannelInner {
    config: AppConfig,
    link: Arc<ControlLink>,
    handshake: Arc<HandshakeCoordinator>,
    transport: SecureTransport,
    liveness: Arc<Liveness>,
    session: Mutex<Session>,
    open_lock: Mutex<()>,
    event_tx: broadcast::Sender<ChannelEvent>,
    _event_rx: broadcast::Receiver<ChannelEvent>,
    json_callback: Arc<RwLock<Option<JsonCallback>>>,
    pending: Mutex<Option<PendingDispatch>>,
    dispatcher: Mutex<Option<DispatcherHandle>>,
}

/// Secure audio channel
pub struct AudioChannel {
    inner: Arc<ChannelInner>,
}

impl AudioChannel {
    /// Create a channel
    ///
    /// `events` is the queue the control client pushes its events into.
    pub fn new(
        config: AppConfig,
        control: Arc<dyn ControlChannel>,
        events: Receiver<ControlEvent>,
        connector: Arc<dyn DatagramConnector>,
        sinks: ChannelSinks,
    ) -> Self {
        let link = Arc::new(ControlLink::new(config.control.clone(), control));
        let handshake = Arc::new(HandshakeCoordinator::new(
            config.audio.clone(),
            config.channel.hello_timeout(),
        ));
        let liveness = Arc::new(Liveness::new());
        let transport = SecureTransport::new(connector, sinks.incoming_audio, liveness.clone());
        let (event_tx, event_rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let session = Session {
            state: ChannelState::Idle,
            session_id: String::new(),
            server_sample_rate: config.audio.sample_rate,
            error: None,
            epoch: 0,
        };

        Self {
            inner: Arc::new(ChannelInner {
                config,
                link,
                handshake,
                transport,
                liveness,
                session: Mutex::new(session),
                open_lock: Mutex::new(()),
                event_tx,
                _event_rx: event_rx,
                json_callback: Arc::new(RwLock::new(None)),
                pending: Mutex::new(Some(PendingDispatch {
                    events,
                    legacy_audio: sinks.legacy_audio,
                    text: sinks.text,
                })),
                dispatcher: Mutex::new(None),
            }),
        }
    }

    /// Start the dispatcher and try to connect the control link
    ///
    /// A failed connection is only logged; `open_audio_channel` retries it.
    pub fn start(&self) -> Result<()> {
        self.inner.ensure_dispatcher()?;
        if let Err(e) = self.inner.link.ensure_connected() {
            tracing::warn!("Initial control connection failed: {}", e);
        }
        Ok(())
    }

    /// Negotiate a session and open the encrypted transport
    ///
    /// Blocks for at most the hello timeout.
    pub fn open_audio_channel(&self) -> Result<()> {
        self.inner.open()
    }

    /// Tear down the session; safe to call at any time
    pub fn close_audio_channel(&self) {
        self.inner.close();
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Encrypt and send one audio frame
    pub fn send_audio(&self, payload: &[u8]) -> Result<usize> {
        self.inner.send_audio(payload)
    }

    /// Publish text on the control link
    pub fn send_text(&self, text: &str) -> Result<()> {
        self.inner.send_text(text)
    }

    pub fn state(&self) -> ChannelState {
        self.inner.session.lock().state
    }

    pub fn session_id(&self) -> String {
        self.inner.session.lock().session_id.clone()
    }

    pub fn server_sample_rate(&self) -> u32 {
        self.inner.session.lock().server_sample_rate
    }

    pub fn last_error(&self) -> Option<ErrorKind> {
        self.inner.session.lock().error
    }

    pub fn transport_stats(&self) -> TransportStats {
        self.inner.transport.stats()
    }

    pub fn client_id(&self) -> &str {
        self.inner.link.client_id()
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Receive control messages of types the channel does not handle itself
    pub fn on_incoming_json<F>(&self, callback: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        *self.inner.json_callback.write() = Some(Arc::new(callback));
    }
}

impl AudioSink for AudioChannel {
    fn on_audio(&self, payload: Bytes) {
        if let Err(e) = self.send_audio(&payload) {
            tracing::trace!("Forwarded frame dropped: {}", e);
        }
    }
}

impl TextSink for AudioChannel {
    fn on_text(&self, text: &str) {
        if let Err(e) = self.send_text(text) {
            tracing::error!("Failed to forward text: {}", e);
        }
    }
}

impl Drop for AudioChannel {
    fn drop(&mut self) {
        self.inner.handshake.cancel();
        self.inner.transport.close();
        let dispatcher = self.inner.dispatcher.lock().take();
        if let Some(mut dispatcher) = dispatcher {
            dispatcher.stop();
        }
    }
}

impl ChannelInner {
    fn ensure_dispatcher(self: &Arc<Self>) -> Result<()> {
        let Some(pending) = self.pending.lock().take() else {
            return Ok(());
        };

        let weak: Weak<ChannelInner> = Arc::downgrade(self);
        let on_goodbye = Box::new(move |session_id: Option<&str>| {
            if let Some(inner) = weak.upgrade() {
                inner.on_goodbye(session_id);
            }
        });

        let handle = Dispatcher::new(
            self.link.clone(),
            self.handshake.clone(),
            self.liveness.clone(),
            on_goodbye,
        )
        .with_legacy_audio(pending.legacy_audio)
        .with_text_sink(pending.text)
        .with_json_callback(self.json_callback.clone())
        .spawn(pending.events)?;

        *self.dispatcher.lock() = Some(handle);
        Ok(())
    }

    fn open(self: &Arc<Self>) -> Result<()> {
        let _serialized = self.open_lock.lock();

        if let Err(e) = self.ensure_dispatcher() {
            return Err(self.fail(ErrorKind::ServerError, e));
        }
        if let Err(e) = self.link.ensure_connected() {
            return Err(self.fail(e.kind(), e));
        }

        // armed under the session lock so a close seeing AwaitingHello
        // always has an attempt to cancel
        let (epoch, attempt) = {
            let mut session = self.session.lock();
            session.error = None;
            session.session_id.clear();
            session.state = ChannelState::AwaitingHello;
            (session.epoch, self.handshake.begin())
        };

        let params = match self.handshake.complete(attempt, &self.link) {
            Ok(params) => params,
            Err(HandshakeError::Cancelled) => {
                tracing::info!("Audio channel open cancelled");
                return Err(HandshakeError::Cancelled.into());
            }
            Err(e) => {
                let error = Error::from(e);
                return Err(self.fail(error.kind(), error));
            }
        };

        if let Err(e) = self.transport.open(&params) {
            return Err(self.fail(ErrorKind::ServerError, e.into()));
        }

        {
            let mut session = self.session.lock();
            if session.epoch != epoch {
                drop(session);
                self.transport.close();
                tracing::info!("Audio channel closed while opening");
                return Err(HandshakeError::Cancelled.into());
            }

            session.state = ChannelState::Open;
            session.session_id = params.session_id.clone();
            if let Some(rate) = params.sample_rate {
                if rate != session.server_sample_rate {
                    tracing::warn!(
                        "Server sample rate {} differs from device rate {}",
                        rate,
                        self.config.audio.sample_rate
                    );
                }
                session.server_sample_rate = rate;
            }
        }

        self.liveness.touch();
        tracing::info!("Audio channel opened, session {}", params.session_id);
        let _ = self.event_tx.send(ChannelEvent::Opened {
            session_id: params.session_id,
        });
        Ok(())
    }

    fn close(&self) {
        let closed_session = {
            let mut session = self.session.lock();
            session.epoch += 1;

            let active =
                session.state == ChannelState::AwaitingHello || self.transport.is_open();
            if active {
                session.state = ChannelState::Closed;
                Some(std::mem::take(&mut session.session_id))
            } else {
                None
            }
        };

        self.handshake.cancel();
        self.transport.close();

        let Some(session_id) = closed_session else {
            tracing::debug!("Audio channel already closed");
            return;
        };

        let goodbye = Goodbye::new(if session_id.is_empty() {
            None
        } else {
            Some(session_id.clone())
        });
        match goodbye.to_json() {
            Ok(message) => {
                if let Err(e) = self.link.publish_text(&message) {
                    tracing::warn!("Failed to send goodbye: {}", e);
                }
            }
            Err(e) => tracing::error!("Failed to encode goodbye: {}", e),
        }

        tracing::info!("Audio channel closed, session {}", session_id);
        let _ = self.event_tx.send(ChannelEvent::Closed { session_id });
    }

    /// A scoped goodbye closes only the open session it names (or an open
    /// session the server gave no id); while the hello is pending only an
    /// unscoped goodbye does
    fn on_goodbye(&self, session_id: Option<&str>) {
        if let Some(id) = session_id {
            let session = self.session.lock();
            let matches = session.state == ChannelState::Open
                && (session.session_id.is_empty() || session.session_id == id);
            if !matches {
                tracing::warn!(
                    "Ignoring goodbye for session {} (current {:?}, {:?})",
                    id,
                    session.session_id,
                    session.state
                );
                return;
            }
        }
        self.close();
    }

    fn is_open(&self) -> bool {
        let session = self.session.lock();
        session.error.is_none()
            && self.transport.is_open()
            && !self.liveness.is_stale(self.config.channel.liveness_timeout())
    }

    fn send_audio(&self, payload: &[u8]) -> Result<usize> {
        match self.transport.send(payload) {
            Err(Error::Crypto(CryptoError::SequenceExhausted)) => {
                Err(self.fail(ErrorKind::ServerError, CryptoError::SequenceExhausted.into()))
            }
            other => other,
        }
    }

    fn send_text(&self, text: &str) -> Result<()> {
        self.link
            .publish_text(text)
            .map_err(|e| self.fail(ErrorKind::ServerError, e.into()))
    }

    /// Record a failure and surface it to subscribers
    fn fail(&self, kind: ErrorKind, error: Error) -> Error {
        tracing::error!("Audio channel error ({}): {}", kind, error);
        {
            let mut session = self.session.lock();
            session.state = ChannelState::Error;
            session.error = Some(kind);
        }
        let _ = self.event_tx.send(ChannelEvent::Error(kind));
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetworkError;
    use crate::network::{event_queue, Credentials, DatagramHandler, DatagramSocket, QoS};
    use crossbeam_channel::{Receiver, Sender};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};

    const ACK: &str = r#"{"type":"hello","session_id":"abc123","transport":"udp","audio_params":{"sample_rate":24000},"udp":{"server":"10.0.0.5","port":8884,"key":"00112233445566778899AABBCCDDEEFF","nonce":"0102030405060708090A0B0C0D0E0F10"}}"#;

    /// Control client answering hellos from a canned server
    struct ScriptedClient {
        events: Sender<ControlEvent>,
        connected: AtomicBool,
        answer_hello: AtomicBool,
        /// Pushed ahead of the hello answer
        before_ack: Mutex<Option<String>>,
        published: Mutex<Vec<String>>,
    }

    impl ScriptedClient {
        fn push(&self, payload: &str) {
            let _ = self.events.send(ControlEvent::Message {
                topic: "idiom_topic_esp32".into(),
                payload: Bytes::from(payload.to_string()),
            });
        }

        fn goodbyes(&self) -> Vec<String> {
            self.published
                .lock()
                .iter()
                .filter(|m| m.contains("goodbye"))
                .cloned()
                .collect()
        }
    }

    impl ControlChannel for ScriptedClient {
        fn connect(&self, _: &str, _: u16, _: &str, _: &Credentials) -> std::result::Result<(), NetworkError> {
            self.connected.store(true, Ordering::SeqCst);
            let _ = self.events.send(ControlEvent::Connected);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn publish(&self, _: &str, payload: &[u8]) -> std::result::Result<(), NetworkError> {
            let text = String::from_utf8_lossy(payload).to_string();
            let is_hello = text.contains(r#""type":"hello""#);
            self.published.lock().push(text);
            if is_hello && self.answer_hello.load(Ordering::SeqCst) {
                let before = self.before_ack.lock().clone();
                if let Some(message) = before {
                    self.push(&message);
                }
                self.push(ACK);
            }
            Ok(())
        }

        fn subscribe(&self, _: &str, _: QoS) -> std::result::Result<(), NetworkError> {
            Ok(())
        }

        fn disconnect(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }
    }

    struct NullSocket(Arc<Mutex<Vec<Vec<u8>>>>);

    impl DatagramSocket for NullSocket {
        fn send(&self, datagram: &[u8]) -> std::result::Result<usize, NetworkError> {
            self.0.lock().push(datagram.to_vec());
            Ok(datagram.len())
        }
    }

    #[derive(Default)]
    struct NullConnector {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl DatagramConnector for NullConnector {
        fn connect(
            &self,
            _: &str,
            _: u16,
            _: DatagramHandler,
        ) -> std::result::Result<Box<dyn DatagramSocket>, NetworkError> {
            Ok(Box::new(NullSocket(self.sent.clone())))
        }
    }

    /// Transport connector that holds `connect` until released
    struct GatedConnector {
        entered: Sender<()>,
        release: Receiver<()>,
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl DatagramConnector for GatedConnector {
        fn connect(
            &self,
            _: &str,
            _: u16,
            _: DatagramHandler,
        ) -> std::result::Result<Box<dyn DatagramSocket>, NetworkError> {
            let _ = self.entered.send(());
            let _ = self.release.recv_timeout(Duration::from_secs(2));
            Ok(Box::new(NullSocket(self.sent.clone())))
        }
    }

    fn scripted_channel(
        config: AppConfig,
        answer: bool,
        connector: Arc<dyn DatagramConnector>,
    ) -> (AudioChannel, Arc<ScriptedClient>) {
        let (tx, rx) = event_queue();
        let client = Arc::new(ScriptedClient {
            events: tx,
            connected: AtomicBool::new(false),
            answer_hello: AtomicBool::new(answer),
            before_ack: Mutex::new(None),
            published: Mutex::new(Vec::new()),
        });
        let sink: Arc<dyn AudioSink> = Arc::new(|_: Bytes| {});
        let channel = AudioChannel::new(config, client.clone(), rx, connector, ChannelSinks::new(sink));
        channel.start().unwrap();
        (channel, client)
    }

    fn channel_with(config: AppConfig, answer: bool) -> (AudioChannel, Arc<ScriptedClient>, Arc<NullConnector>) {
        let connector = Arc::new(NullConnector::default());
        let (channel, client) = scripted_channel(config, answer, connector.clone());
        (channel, client, connector)
    }

    fn is_cancelled(result: &Result<()>) -> bool {
        matches!(result, Err(Error::Handshake(HandshakeError::Cancelled)))
    }

    fn fast_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.channel.hello_timeout_ms = 200;
        config
    }

    fn wait_for(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !condition() {
            if Instant::now() > deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        true
    }

    #[test]
    fn test_open_send_close() {
        let (channel, client, connector) = channel_with(fast_config(), true);
        let mut events = channel.subscribe();

        channel.open_audio_channel().unwrap();
        assert_eq!(channel.state(), ChannelState::Open);
        assert_eq!(channel.session_id(), "abc123");
        assert_eq!(channel.server_sample_rate(), 24000);
        assert!(channel.is_open());
        assert_eq!(
            events.try_recv().unwrap(),
            ChannelEvent::Opened { session_id: "abc123".into() }
        );

        assert_eq!(channel.send_audio(&[1, 2, 3, 4]).unwrap(), 20);
        assert_eq!(connector.sent.lock().len(), 1);

        channel.close_audio_channel();
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(!channel.is_open());
        assert_eq!(client.goodbyes(), vec![r#"{"session_id":"abc123","type":"goodbye"}"#.to_string()]);
        assert_eq!(
            events.try_recv().unwrap(),
            ChannelEvent::Closed { session_id: "abc123".into() }
        );

        // second close is a no-op
        channel.close_audio_channel();
        assert_eq!(client.goodbyes().len(), 1);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_timeout_then_clean_retry() {
        let (channel, client, _) = channel_with(fast_config(), false);

        let err = channel.open_audio_channel().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServerTimeout);
        assert_eq!(channel.last_error(), Some(ErrorKind::ServerTimeout));
        assert_eq!(channel.state(), ChannelState::Error);

        // close after a failed open does nothing
        channel.close_audio_channel();
        assert!(client.goodbyes().is_empty());

        client.answer_hello.store(true, Ordering::SeqCst);
        channel.open_audio_channel().unwrap();
        assert_eq!(channel.last_error(), None);
        assert!(channel.is_open());
    }

    #[test]
    fn test_goodbye_scoping() {
        let (channel, client, _) = channel_with(fast_config(), true);
        channel.open_audio_channel().unwrap();

        client.push(r#"{"type":"goodbye","session_id":"other"}"#);
        client.push(r#"{"type":"ping"}"#);
        let seen = Arc::new(AtomicBool::new(false));
        let flag = seen.clone();
        channel.on_incoming_json(move |_| flag.store(true, Ordering::SeqCst));
        client.push(r#"{"type":"ping"}"#);
        assert!(wait_for(|| seen.load(Ordering::SeqCst)));
        assert_eq!(channel.state(), ChannelState::Open);

        client.push(r#"{"type":"goodbye","session_id":"abc123"}"#);
        assert!(wait_for(|| channel.state() == ChannelState::Closed));
        assert!(!channel.is_open());
    }

    #[test]
    fn test_unscoped_goodbye_closes() {
        let (channel, client, _) = channel_with(fast_config(), true);
        channel.open_audio_channel().unwrap();

        client.push(r#"{"type":"goodbye"}"#);
        assert!(wait_for(|| channel.state() == ChannelState::Closed));
    }

    #[test]
    fn test_stale_liveness_reports_closed() {
        let mut config = fast_config();
        config.channel.liveness_timeout_secs = 0;
        let (channel, _, _) = channel_with(config, true);
        channel.open_audio_channel().unwrap();

        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(channel.state(), ChannelState::Open);
        assert!(!channel.is_open());
    }

    #[test]
    fn test_missing_endpoint_reports_not_found() {
        let mut config = fast_config();
        config.control.endpoint.clear();
        let (channel, client, _) = channel_with(config, true);

        let err = channel.open_audio_channel().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServerNotFound);
        assert_eq!(channel.last_error(), Some(ErrorKind::ServerNotFound));
        assert!(client.published.lock().is_empty());
    }

    #[test]
    fn test_channel_as_text_sink() {
        let (channel, client, _) = channel_with(fast_config(), true);
        channel.open_audio_channel().unwrap();

        channel.on_text("hello there");
        assert!(client.published.lock().iter().any(|m| m == "hello there"));
    }

    #[test]
    fn test_goodbye_for_previous_session_keeps_pending_open() {
        let (channel, client, _) = channel_with(fast_config(), true);
        *client.before_ack.lock() =
            Some(r#"{"type":"goodbye","session_id":"previous-session"}"#.to_string());

        channel.open_audio_channel().unwrap();
        assert_eq!(channel.state(), ChannelState::Open);
        assert_eq!(channel.session_id(), "abc123");
        assert!(client.goodbyes().is_empty());
    }

    #[test]
    fn test_unscoped_goodbye_cancels_pending_open() {
        let (channel, client, _) = channel_with(fast_config(), true);
        *client.before_ack.lock() = Some(r#"{"type":"goodbye"}"#.to_string());

        let result = channel.open_audio_channel();
        assert!(is_cancelled(&result));
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(channel.last_error(), None);
        assert!(!channel.is_open());
        assert_eq!(client.goodbyes(), vec![r#"{"type":"goodbye"}"#.to_string()]);
    }

    #[test]
    fn test_close_cancels_pending_open() {
        let mut config = fast_config();
        config.channel.hello_timeout_ms = 5_000;
        let (channel, client, _) = channel_with(config, false);
        let channel = Arc::new(channel);

        let opener = {
            let channel = channel.clone();
            std::thread::spawn(move || {
                let started = Instant::now();
                (channel.open_audio_channel(), started.elapsed())
            })
        };
        assert!(wait_for(|| client
            .published
            .lock()
            .iter()
            .any(|m| m.contains(r#""type":"hello""#))));

        channel.close_audio_channel();
        let (result, elapsed) = opener.join().unwrap();
        assert!(is_cancelled(&result));
        assert!(elapsed < Duration::from_secs(2));
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(channel.last_error(), None);
        assert_eq!(client.goodbyes(), vec![r#"{"type":"goodbye"}"#.to_string()]);
    }

    #[test]
    fn test_close_while_transport_connects() {
        let (entered_tx, entered_rx) = crossbeam_channel::unbounded();
        let (release_tx, release_rx) = crossbeam_channel::unbounded();
        let connector = Arc::new(GatedConnector {
            entered: entered_tx,
            release: release_rx,
            sent: Arc::new(Mutex::new(Vec::new())),
        });
        let (channel, client) = scripted_channel(fast_config(), true, connector);
        let channel = Arc::new(channel);

        let opener = {
            let channel = channel.clone();
            std::thread::spawn(move || channel.open_audio_channel())
        };
        entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(channel.state(), ChannelState::AwaitingHello);

        // blocks on the transport until connect returns
        let closer = {
            let channel = channel.clone();
            std::thread::spawn(move || channel.close_audio_channel())
        };
        assert!(wait_for(|| channel.state() == ChannelState::Closed));
        release_tx.send(()).unwrap();

        closer.join().unwrap();
        assert!(is_cancelled(&opener.join().unwrap()));
        assert!(!channel.inner.transport.is_open());
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(channel.session_id(), "");
        assert!(!channel.is_open());
        assert!(channel.send_audio(&[1, 2, 3]).is_err());
        assert_eq!(client.goodbyes().len(), 1);
    }
}
