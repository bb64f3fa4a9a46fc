//! Secure Voice Link
//!
//! Hybrid-transport secure audio channel for a voice device:
//! - Session negotiation (hello / goodbye) over a publish/subscribe control link
//! - AES-128-CTR encrypted, sequence-numbered audio frames over UDP
//! - Anti-replay sequence policy and a thread-safe session lifecycle
//!
//! ```text
//! Application ──open──> AudioChannel ──hello──> ControlLink ──> broker
//!                            │                       │
//!                            │<──── Dispatcher <─────┘ (hello ack, goodbye)
//!                            │
//!                            └──> SecureTransport <──UDP──> media server
//! ```

pub mod channel;
pub mod config;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod network;
pub mod protocol;

pub use channel::{AudioChannel, ChannelEvent, ChannelSinks, ChannelState};
pub use config::AppConfig;
pub use error::{Error, ErrorKind, Result};
pub use network::{AudioSink, TextSink};
