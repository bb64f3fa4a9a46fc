//! Delivery capabilities injected into the channel, and the liveness marker

use bytes::Bytes;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Consumer of opaque audio payloads
pub trait AudioSink: Send + Sync {
    fn on_audio(&self, payload: Bytes);
}

impl<F> AudioSink for F
where
    F: Fn(Bytes) + Send + Sync,
{
    fn on_audio(&self, payload: Bytes) {
        self(payload)
    }
}

/// Consumer of text produced by control messages
pub trait TextSink: Send + Sync {
    fn on_text(&self, text: &str);
}

impl<F> TextSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn on_text(&self, text: &str) {
        self(text)
    }
}

/// Time of the last accepted inbound control or audio message
#[derive(Debug, Default)]
pub struct Liveness {
    last_incoming: Mutex<Option<Instant>>,
}

impl Liveness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record inbound traffic
    pub fn touch(&self) {
        *self.last_incoming.lock() = Some(Instant::now());
    }

    pub fn last_incoming(&self) -> Option<Instant> {
        *self.last_incoming.lock()
    }

    /// True when nothing arrived within `threshold` (or ever)
    pub fn is_stale(&self, threshold: Duration) -> bool {
        match *self.last_incoming.lock() {
            Some(at) => at.elapsed() > threshold,
            None => true,
        }
    }
}
