//! In-process control broker and loopback media server
//!
//! Test and demo harness only. The broker routes publishes to clients
//! subscribed to the exact same topic (no wildcards, no retained messages,
//! every subscription served at most once). The loopback server answers
//! hellos with fresh session keys and echoes decrypted audio frames back
//! over real UDP.

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use rand::RngCore;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::ControlConfig;
use crate::constants::*;
use crate::crypto::FrameCipher;
use crate::error::NetworkError;
use crate::network::control::{event_queue, ControlChannel, ControlEvent, Credentials, QoS};
use crate::protocol::{message_type, FrameHeader, Goodbye};

struct ClientEntry {
    events: Sender<ControlEvent>,
    subscriptions: HashSet<String>,
}

#[derive(Default)]
struct BrokerInner {
    clients: Mutex<HashMap<String, ClientEntry>>,
    refuse_connections: AtomicBool,
}

/// Exact-topic broker living in the current process
#[derive(Clone, Default)]
pub struct InProcessBroker {
    inner: Arc<BrokerInner>,
}

impl InProcessBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a client delivering into `events`
    pub fn client(&self, events: Sender<ControlEvent>) -> InProcessClient {
        InProcessClient {
            broker: self.clone(),
            events,
            client_id: Mutex::new(None),
        }
    }

    /// Make subsequent connects fail
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.inner.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    pub fn connected_clients(&self) -> usize {
        self.inner.clients.lock().len()
    }

    fn route(&self, topic: &str, payload: &[u8]) -> usize {
        let clients = self.inner.clients.lock();
        let mut delivered = 0;

        for (id, entry) in clients.iter() {
            if !entry.subscriptions.contains(topic) {
                continue;
            }
            let event = ControlEvent::Message {
                topic: topic.to_string(),
                payload: Bytes::copy_from_slice(payload),
            };
            match entry.events.try_send(event) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!("Event queue of {} is full, dropping message", id)
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
        delivered
    }
}

/// Client side of [`InProcessBroker`]
pub struct InProcessClient {
    broker: InProcessBroker,
    events: Sender<ControlEvent>,
    client_id: Mutex<Option<String>>,
}

impl ControlChannel for InProcessClient {
    fn connect(
        &self,
        endpoint: &str,
        port: u16,
        client_id: &str,
        _credentials: &Credentials,
    ) -> Result<(), NetworkError> {
        if self.broker.inner.refuse_connections.load(Ordering::SeqCst) {
            return Err(NetworkError::ConnectFailed(format!("{}:{} refused", endpoint, port)));
        }

        self.broker.inner.clients.lock().insert(
            client_id.to_string(),
            ClientEntry {
                events: self.events.clone(),
                subscriptions: HashSet::new(),
            },
        );
        *self.client_id.lock() = Some(client_id.to_string());

        let _ = self.events.try_send(ControlEvent::Connected);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client_id.lock().is_some()
    }

    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), NetworkError> {
        if !self.is_connected() {
            return Err(NetworkError::NotConnected);
        }
        let delivered = self.broker.route(topic, payload);
        tracing::trace!("Published {} bytes on {} to {} subscribers", payload.len(), topic, delivered);
        Ok(())
    }

    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), NetworkError> {
        let id = self.client_id.lock().clone().ok_or(NetworkError::NotConnected)?;
        if qos != QoS::AtMostOnce {
            tracing::debug!("In-process broker serves {} at most once", topic);
        }

        let mut clients = self.broker.inner.clients.lock();
        let entry = clients.get_mut(&id).ok_or(NetworkError::NotConnected)?;
        entry.subscriptions.insert(topic.to_string());
        Ok(())
    }

    fn disconnect(&self) {
        if let Some(id) = self.client_id.lock().take() {
            self.broker.inner.clients.lock().remove(&id);
            let _ = self.events.try_send(ControlEvent::Disconnected);
        }
    }
}

/// Loopback server behaviour
#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    /// Topic the server listens on (the device's publish topic)
    pub listen_topic: String,
    /// Topic the server replies on (the device's subscribe topic)
    pub reply_topic: String,
    /// Session id handed out; generated when `None`
    pub session_id: Option<String>,
    pub sample_rate: Option<u32>,
    pub answer_hello: bool,
}

impl LoopbackOptions {
    /// Options mirroring a device's control configuration
    pub fn for_device(control: &ControlConfig) -> Self {
        Self {
            listen_topic: control.publish_topic.clone(),
            reply_topic: control.subscribe_topic.clone(),
            session_id: None,
            sample_rate: Some(DEFAULT_SAMPLE_RATE),
            answer_hello: true,
        }
    }
}

struct ServerSession {
    session_id: String,
    cipher: FrameCipher,
    nonce: [u8; FRAME_HEADER_SIZE],
    peer: Option<SocketAddr>,
    local_sequence: u32,
}

struct ServerShared {
    options: Mutex<LoopbackOptions>,
    session: Mutex<Option<ServerSession>>,
    client: InProcessClient,
    media_addr: SocketAddr,
    hellos: AtomicU64,
    goodbyes: AtomicU64,
    frames: AtomicU64,
}

/// Server side of the handshake plus a UDP echo
pub struct LoopbackServer {
    shared: Arc<ServerShared>,
    running: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl LoopbackServer {
    pub fn start(broker: &InProcessBroker, options: LoopbackOptions) -> Result<Self, NetworkError> {
        let socket = UdpSocket::bind("127.0.0.1:0").map_err(|e| NetworkError::BindFailed(e.to_string()))?;
        socket
            .set_read_timeout(Some(Duration::from_millis(DEFAULT_RECV_TIMEOUT_MS)))
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
        let media_addr = socket.local_addr().map_err(|e| NetworkError::BindFailed(e.to_string()))?;

        let (events_tx, events_rx) = event_queue();
        let client = broker.client(events_tx);
        let server_id = format!("loopback-{}", uuid::Uuid::new_v4().simple());
        client.connect("in-process", 0, &server_id, &Credentials::default())?;
        client.subscribe(&options.listen_topic, QoS::AtMostOnce)?;

        let shared = Arc::new(ServerShared {
            options: Mutex::new(options),
            session: Mutex::new(None),
            client,
            media_addr,
            hellos: AtomicU64::new(0),
            goodbyes: AtomicU64::new(0),
            frames: AtomicU64::new(0),
        });
        let running = Arc::new(AtomicBool::new(true));

        let control = {
            let shared = shared.clone();
            let running = running.clone();
            thread::Builder::new()
                .name("loopback-control".to_string())
                .spawn(move || control_loop(shared, events_rx, running))
                .map_err(|e| NetworkError::ReceiveFailed(e.to_string()))?
        };
        let media = {
            let shared = shared.clone();
            let running = running.clone();
            thread::Builder::new()
                .name("loopback-media".to_string())
                .spawn(move || media_loop(shared, socket, running))
                .map_err(|e| NetworkError::ReceiveFailed(e.to_string()))?
        };

        tracing::info!("Loopback server listening on {}", media_addr);
        Ok(Self {
            shared,
            running,
            threads: vec![control, media],
        })
    }

    pub fn media_addr(&self) -> SocketAddr {
        self.shared.media_addr
    }

    pub fn set_answer_hello(&self, answer: bool) {
        self.shared.options.lock().answer_hello = answer;
    }

    pub fn set_session_id(&self, session_id: Option<String>) {
        self.shared.options.lock().session_id = session_id;
    }

    /// Id of the session currently held by the server
    pub fn session_id(&self) -> Option<String> {
        self.shared.session.lock().as_ref().map(|s| s.session_id.clone())
    }

    pub fn hello_count(&self) -> u64 {
        self.shared.hellos.load(Ordering::Relaxed)
    }

    pub fn goodbye_count(&self) -> u64 {
        self.shared.goodbyes.load(Ordering::Relaxed)
    }

    pub fn frames_echoed(&self) -> u64 {
        self.shared.frames.load(Ordering::Relaxed)
    }

    /// Send a goodbye to the device
    pub fn send_goodbye(&self, session_id: Option<&str>) -> crate::Result<()> {
        let message = Goodbye::new(session_id.map(str::to_string)).to_json()?;
        self.publish_json_text(&message)
    }

    /// Publish an arbitrary control message to the device
    pub fn push_json(&self, message: &Value) -> crate::Result<()> {
        self.publish_json_text(&message.to_string())
    }

    /// Publish raw bytes on the device's `/audio` sub-topic
    pub fn push_legacy_audio(&self, payload: &[u8]) -> crate::Result<()> {
        let topic = format!("{}{}", self.shared.options.lock().reply_topic, AUDIO_SUBTOPIC_SUFFIX);
        self.shared.client.publish(&topic, payload)?;
        Ok(())
    }

    fn publish_json_text(&self, message: &str) -> crate::Result<()> {
        let topic = self.shared.options.lock().reply_topic.clone();
        self.shared.client.publish(&topic, message.as_bytes())?;
        Ok(())
    }
}

impl Drop for LoopbackServer {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        self.shared.client.disconnect();
    }
}

fn control_loop(shared: Arc<ServerShared>, events: Receiver<ControlEvent>, running: Arc<AtomicBool>) {
    let timeout = Duration::from_millis(DEFAULT_RECV_TIMEOUT_MS);

    while running.load(Ordering::Relaxed) {
        match events.recv_timeout(timeout) {
            Ok(ControlEvent::Message { payload, .. }) => handle_control(&shared, &payload),
            Ok(_) => {}
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn handle_control(shared: &ServerShared, payload: &[u8]) {
    let Ok(message) = serde_json::from_slice::<Value>(payload) else {
        tracing::debug!("Loopback server ignoring non-json message");
        return;
    };

    match message.get("type").and_then(Value::as_str) {
        Some(message_type::HELLO) => {
            shared.hellos.fetch_add(1, Ordering::Relaxed);
            let options = shared.options.lock().clone();
            if !options.answer_hello {
                tracing::debug!("Loopback server withholding hello answer");
                return;
            }

            let session_id = options
                .session_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
            // fresh per session
            let mut key = [0u8; 16];
            let mut nonce = [0u8; 16];
            rand::thread_rng().fill_bytes(&mut key);
            rand::thread_rng().fill_bytes(&mut nonce);
            nonce[0] = FRAME_TYPE_AUDIO;

            let mut ack = json!({
                "type": message_type::HELLO,
                "session_id": session_id,
                "transport": TRANSPORT_UDP,
                "udp": {
                    "server": shared.media_addr.ip().to_string(),
                    "port": shared.media_addr.port(),
                    "key": hex::encode_upper(key),
                    "nonce": hex::encode_upper(nonce),
                }
            });
            if let Some(rate) = options.sample_rate {
                ack["audio_params"] = json!({ "sample_rate": rate });
            }

            *shared.session.lock() = Some(ServerSession {
                session_id: session_id.clone(),
                cipher: FrameCipher::new(key),
                nonce,
                peer: None,
                local_sequence: 0,
            });

            if let Err(e) = shared.client.publish(&options.reply_topic, ack.to_string().as_bytes()) {
                tracing::error!("Loopback server failed to answer hello: {}", e);
            }
            tracing::debug!("Loopback server opened session {}", session_id);
        }
        Some(message_type::GOODBYE) => {
            shared.goodbyes.fetch_add(1, Ordering::Relaxed);
            shared.session.lock().take();
        }
        _ => {}
    }
}

fn media_loop(shared: Arc<ServerShared>, socket: UdpSocket, running: Arc<AtomicBool>) {
    let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

    while running.load(Ordering::Relaxed) {
        let (size, from) = match socket.recv_from(&mut buffer) {
            Ok(received) => received,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
                continue
            }
            Err(e) => {
                tracing::debug!("Loopback media receive error: {}", e);
                continue;
            }
        };

        let datagram = &buffer[..size];
        let Ok(header) = FrameHeader::parse(datagram) else {
            continue;
        };

        let reply = {
            let mut session = shared.session.lock();
            let Some(session) = session.as_mut() else {
                continue;
            };
            let Ok(plaintext) = session.cipher.open(&header, &datagram[FRAME_HEADER_SIZE..]) else {
                continue;
            };

            session.peer = Some(from);
            session.local_sequence = session.local_sequence.wrapping_add(1);
            FrameHeader::new(&session.nonce, plaintext.len(), session.local_sequence)
                .ok()
                .and_then(|echo| session.cipher.seal(&echo, &plaintext).ok())
        };

        if let Some(reply) = reply {
            shared.frames.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = socket.send_to(&reply, from) {
                tracing::debug!("Loopback echo failed: {}", e);
            }
        }
    }
}
