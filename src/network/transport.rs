//! Encrypted, sequence-numbered audio transport over datagrams
//!
//! All mutable state (socket slot, cipher, nonce template, both sequence
//! counters) lives behind one lock shared by `send`, the receive handler and
//! `close`. The socket is a single exclusive-owner slot: opening a new session
//! destroys the previous socket before the replacement is created.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::constants::FRAME_HEADER_SIZE;
use crate::crypto::FrameCipher;
use crate::error::{CryptoError, NetworkError};
use crate::network::handshake::SessionParams;
use crate::network::sink::{AudioSink, Liveness};
use crate::network::udp::{DatagramConnector, DatagramHandler, DatagramSocket};
use crate::protocol::FrameHeader;

/// Transport counters snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub send_errors: u64,
    pub dropped_malformed: u64,
    pub dropped_replay: u64,
    pub dropped_decrypt: u64,
    pub dropped_stale: u64,
}

#[derive(Default)]
struct StatsCounters {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    send_errors: AtomicU64,
    dropped_malformed: AtomicU64,
    dropped_replay: AtomicU64,
    dropped_decrypt: AtomicU64,
    dropped_stale: AtomicU64,
}

impl StatsCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TransportStats {
        TransportStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            dropped_malformed: self.dropped_malformed.load(Ordering::Relaxed),
            dropped_replay: self.dropped_replay.load(Ordering::Relaxed),
            dropped_decrypt: self.dropped_decrypt.load(Ordering::Relaxed),
            dropped_stale: self.dropped_stale.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct TransportState {
    socket: Option<Box<dyn DatagramSocket>>,
    cipher: Option<FrameCipher>,
    nonce_template: [u8; FRAME_HEADER_SIZE],
    local_sequence: u32,
    remote_sequence: u32,
    /// Bumped whenever the socket slot changes; handlers of older sockets
    /// carry a stale value and are ignored
    generation: u64,
}

struct TransportInner {
    state: Mutex<TransportState>,
    connector: Arc<dyn DatagramConnector>,
    audio_sink: Arc<dyn AudioSink>,
    liveness: Arc<Liveness>,
    stats: StatsCounters,
}

/// Secure datagram transport for one audio channel
#[derive(Clone)]
pub struct SecureTransport {
    inner: Arc<TransportInner>,
}

impl SecureTransport {
    pub fn new(
        connector: Arc<dyn DatagramConnector>,
        audio_sink: Arc<dyn AudioSink>,
        liveness: Arc<Liveness>,
    ) -> Self {
        Self {
            inner: Arc::new(TransportInner {
                state: Mutex::new(TransportState::default()),
                connector,
                audio_sink,
                liveness,
                stats: StatsCounters::default(),
            }),
        }
    }

    /// Open the datagram endpoint for a freshly negotiated session
    pub fn open(&self, params: &SessionParams) -> Result<(), NetworkError> {
        let previous = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            state.cipher = None;
            state.socket.take()
        };
        if previous.is_some() {
            tracing::info!("Replacing existing audio transport");
        }
        // the receive thread of the old socket may be waiting on the lock
        drop(previous);

        let mut state = self.inner.state.lock();
        state.generation += 1;
        let generation = state.generation;

        let weak: Weak<TransportInner> = Arc::downgrade(&self.inner);
        let handler: DatagramHandler = Arc::new(move |raw: &[u8]| {
            if let Some(inner) = weak.upgrade() {
                inner.on_datagram(generation, raw);
            }
        });

        let socket = self
            .inner
            .connector
            .connect(&params.server, params.port, handler)?;

        state.socket = Some(socket);
        state.cipher = Some(FrameCipher::new(params.key));
        state.nonce_template = params.nonce;
        state.local_sequence = 0;
        state.remote_sequence = 0;

        tracing::info!(
            "Audio transport open to {}:{} (session {})",
            params.server,
            params.port,
            params.session_id
        );
        Ok(())
    }

    /// Encrypt and send one audio frame
    ///
    /// Returns the datagram size. Failures drop the frame; nothing is
    /// retried.
    pub fn send(&self, plaintext: &[u8]) -> crate::Result<usize> {
        let mut guard = self.inner.state.lock();
        let TransportState {
            socket,
            cipher,
            nonce_template,
            local_sequence,
            ..
        } = &mut *guard;

        let (socket, cipher) = match (socket.as_ref(), cipher.as_ref()) {
            (Some(socket), Some(cipher)) => (socket, cipher),
            _ => {
                tracing::debug!("Audio transport not open, dropping frame");
                return Err(NetworkError::NotConnected.into());
            }
        };

        if *local_sequence == u32::MAX {
            tracing::error!("Local sequence exhausted, dropping frame");
            return Err(CryptoError::SequenceExhausted.into());
        }

        let sequence = *local_sequence + 1;
        let header = FrameHeader::new(nonce_template, plaintext.len(), sequence).map_err(|e| {
            tracing::error!("Failed to build frame header: {}", e);
            StatsCounters::bump(&self.inner.stats.send_errors);
            e
        })?;
        *local_sequence = sequence;

        let datagram = cipher.seal(&header, plaintext).map_err(|e| {
            tracing::error!("Failed to encrypt frame {}: {}", sequence, e);
            StatsCounters::bump(&self.inner.stats.send_errors);
            e
        })?;

        match socket.send(&datagram) {
            Ok(sent) => {
                StatsCounters::bump(&self.inner.stats.frames_sent);
                tracing::trace!("Sent frame {} ({} bytes)", sequence, sent);
                Ok(sent)
            }
            Err(e) => {
                tracing::error!("Failed to send frame {}: {}", sequence, e);
                StatsCounters::bump(&self.inner.stats.send_errors);
                Err(e.into())
            }
        }
    }

    /// Destroy the socket; returns false when nothing was open
    pub fn close(&self) -> bool {
        let socket = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            state.cipher = None;
            state.socket.take()
        };

        match socket {
            Some(socket) => {
                drop(socket);
                tracing::info!("Audio transport closed");
                true
            }
            None => false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.lock().socket.is_some()
    }

    pub fn local_sequence(&self) -> u32 {
        self.inner.state.lock().local_sequence
    }

    pub fn remote_sequence(&self) -> u32 {
        self.inner.state.lock().remote_sequence
    }

    pub fn stats(&self) -> TransportStats {
        self.inner.stats.snapshot()
    }
}

impl TransportInner {
    fn on_datagram(&self, generation: u64, raw: &[u8]) {
        let header = match FrameHeader::parse(raw) {
            Ok(header) => header,
            Err(e) => {
                tracing::error!("Dropping datagram: {}", e);
                StatsCounters::bump(&self.stats.dropped_malformed);
                return;
            }
        };

        let plaintext = {
            let mut state = self.state.lock();
            if state.generation != generation || state.socket.is_none() {
                StatsCounters::bump(&self.stats.dropped_stale);
                return;
            }

            let sequence = header.sequence();
            if sequence <= state.remote_sequence {
                tracing::warn!(
                    "Dropping stale frame {} (remote sequence {})",
                    sequence,
                    state.remote_sequence
                );
                StatsCounters::bump(&self.stats.dropped_replay);
                return;
            }
            if sequence != state.remote_sequence.wrapping_add(1) {
                tracing::warn!(
                    "Sequence gap: expected {}, got {}",
                    state.remote_sequence.wrapping_add(1),
                    sequence
                );
            }
            state.remote_sequence = sequence;

            let opened = match state.cipher.as_ref() {
                Some(cipher) => cipher.open(&header, &raw[FRAME_HEADER_SIZE..]),
                None => return,
            };
            match opened {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    tracing::error!("Failed to decrypt frame {}: {}", sequence, e);
                    StatsCounters::bump(&self.stats.dropped_decrypt);
                    return;
                }
            }
        };

        StatsCounters::bump(&self.stats.frames_received);
        self.liveness.touch();
        self.audio_sink.on_audio(Bytes::from(plaintext));
    }
}
