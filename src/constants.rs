//! Protocol and default configuration constants

/// Control-plane protocol version sent in the hello request
pub const PROTOCOL_VERSION: u32 = 3;

/// Only supported datagram transport kind
pub const TRANSPORT_UDP: &str = "udp";

/// Audio payload format advertised in the hello request
pub const AUDIO_FORMAT_OPUS: &str = "opus";

/// Datagram header size (also the AES-CTR nonce size)
pub const FRAME_HEADER_SIZE: usize = 16;

/// Header type byte for audio frames
pub const FRAME_TYPE_AUDIO: u8 = 0x01;

/// Offset of the big-endian payload length field in the header
pub const FRAME_LENGTH_OFFSET: usize = 2;

/// Offset of the big-endian sequence field in the header
pub const FRAME_SEQUENCE_OFFSET: usize = 12;

/// AES-128 key size
pub const SESSION_KEY_SIZE: usize = 16;

/// Largest datagram we expect to receive
pub const MAX_DATAGRAM_SIZE: usize = 65_536;

/// Default control broker endpoint
pub const DEFAULT_CONTROL_ENDPOINT: &str = "192.168.99.2";

/// Default control broker port
pub const DEFAULT_CONTROL_PORT: u16 = 1883;

/// Default keep-alive for the control link
pub const DEFAULT_KEEPALIVE_SECS: u64 = 90;

/// Default publish topic (device -> server)
pub const DEFAULT_PUBLISH_TOPIC: &str = "idiom_topic_pc";

/// Default subscribe topic (server -> device)
pub const DEFAULT_SUBSCRIBE_TOPIC: &str = "idiom_topic_esp32";

/// Suffix of the legacy raw audio sub-topic
pub const AUDIO_SUBTOPIC_SUFFIX: &str = "/audio";

/// Default sample rate (Hz)
pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;

/// Default channel count
pub const DEFAULT_CHANNELS: u16 = 1;

/// Default frame duration in ms
pub const DEFAULT_FRAME_DURATION_MS: u32 = 60;

/// Upper bound on waiting for the server hello
pub const DEFAULT_HELLO_TIMEOUT_MS: u64 = 10_000;

/// Channel is considered stale after this long without inbound traffic
pub const DEFAULT_LIVENESS_TIMEOUT_SECS: u64 = 120;

/// Poll interval of the UDP receive thread
pub const DEFAULT_RECV_TIMEOUT_MS: u64 = 100;

/// Capacity of the control event queue
pub const CONTROL_QUEUE_CAPACITY: usize = 256;

/// Capacity of the channel event broadcast
pub const EVENT_CHANNEL_CAPACITY: usize = 64;
