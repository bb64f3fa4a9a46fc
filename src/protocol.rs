//! Wire formats: control-plane JSON messages and the audio datagram header
//!
//! ## Datagram Format
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────────┐
//! │                     Audio Frame Header (16 bytes)                      │
//! ├────────┬────────┬──────────┬──────────────────────────┬────────────────┤
//! │Type(1) │Tmpl(1) │  Len(2)  │      Nonce template(8)   │    Seq(4)      │
//! │  0x01  │        │ u16 BE   │                          │    u32 BE      │
//! ├────────┴────────┴──────────┴──────────────────────────┴────────────────┤
//! │               AES-128-CTR ciphertext (same length as payload)          │
//! └────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The whole header doubles as the initial CTR counter block, so every frame
//! of a session is encrypted under a distinct nonce.

use serde::{Deserialize, Serialize};

use crate::config::AudioConfig;
use crate::constants::*;
use crate::error::FrameError;

/// Control message type discriminators
pub mod message_type {
    pub const HELLO: &str = "hello";
    pub const GOODBYE: &str = "goodbye";
    pub const IMAGE_ANALYSIS: &str = "image_analysis";
}

/// Audio parameters carried in the client hello
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelloAudioParams {
    pub format: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_duration: u32,
}

impl From<&AudioConfig> for HelloAudioParams {
    fn from(config: &AudioConfig) -> Self {
        Self {
            format: config.format.clone(),
            sample_rate: config.sample_rate,
            channels: config.channels,
            frame_duration: config.frame_duration_ms,
        }
    }
}

/// Hello request sent by the device to open a session
///
/// Field order is part of the wire format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientHello {
    #[serde(rename = "type")]
    pub message_type: String,
    pub version: u32,
    pub transport: String,
    pub audio_params: HelloAudioParams,
}

impl ClientHello {
    pub fn new(audio: &AudioConfig) -> Self {
        Self {
            message_type: message_type::HELLO.to_string(),
            version: PROTOCOL_VERSION,
            transport: TRANSPORT_UDP.to_string(),
            audio_params: HelloAudioParams::from(audio),
        }
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Session teardown notice, sent in either direction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Goodbye {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(rename = "type")]
    pub message_type: String,
}

impl Goodbye {
    pub fn new(session_id: Option<String>) -> Self {
        Self {
            session_id,
            message_type: message_type::GOODBYE.to_string(),
        }
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// OCR result pushed by the server's image analysis pipeline
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ImageAnalysis {
    pub timestamp: Option<String>,
    pub ocr_type: Option<String>,
    pub text: Option<String>,
    pub success: bool,
    pub idiom: Option<String>,
}

impl ImageAnalysis {
    /// Text worth speaking back, if the analysis succeeded
    pub fn spoken_text(&self) -> Option<&str> {
        if self.success {
            self.idiom.as_deref()
        } else {
            None
        }
    }
}

/// 16-byte audio frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader([u8; FRAME_HEADER_SIZE]);

impl FrameHeader {
    /// Build a header from the session nonce template
    ///
    /// The type byte is forced to audio; length and sequence overwrite their
    /// template fields, everything else is taken verbatim.
    pub fn new(
        template: &[u8; FRAME_HEADER_SIZE],
        payload_len: usize,
        sequence: u32,
    ) -> Result<Self, FrameError> {
        let len = u16::try_from(payload_len).map_err(|_| FrameError::PayloadTooLarge(payload_len))?;

        let mut header = *template;
        header[0] = FRAME_TYPE_AUDIO;
        header[FRAME_LENGTH_OFFSET..FRAME_LENGTH_OFFSET + 2].copy_from_slice(&len.to_be_bytes());
        header[FRAME_SEQUENCE_OFFSET..FRAME_SEQUENCE_OFFSET + 4]
            .copy_from_slice(&sequence.to_be_bytes());
        Ok(Self(header))
    }

    /// Parse and validate the header of a received datagram
    pub fn parse(datagram: &[u8]) -> Result<Self, FrameError> {
        if datagram.len() < FRAME_HEADER_SIZE {
            return Err(FrameError::TooShort(datagram.len()));
        }
        if datagram[0] != FRAME_TYPE_AUDIO {
            return Err(FrameError::BadType(datagram[0]));
        }

        let mut header = [0u8; FRAME_HEADER_SIZE];
        header.copy_from_slice(&datagram[..FRAME_HEADER_SIZE]);
        Ok(Self(header))
    }

    pub fn frame_type(&self) -> u8 {
        self.0[0]
    }

    pub fn payload_len(&self) -> u16 {
        u16::from_be_bytes([self.0[FRAME_LENGTH_OFFSET], self.0[FRAME_LENGTH_OFFSET + 1]])
    }

    pub fn sequence(&self) -> u32 {
        let s = FRAME_SEQUENCE_OFFSET;
        u32::from_be_bytes([self.0[s], self.0[s + 1], self.0[s + 2], self.0[s + 3]])
    }

    pub fn as_bytes(&self) -> &[u8; FRAME_HEADER_SIZE] {
        &self.0
    }
}
