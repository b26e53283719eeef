//! Call value objects

use serde::{Deserialize, Serialize};
use std::fmt;

/// Call direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    /// We received the INVITE
    Inbound,
    /// We sent the INVITE
    Outbound,
}

/// Media direction advertised in the session body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransmitMode {
    #[default]
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl TransmitMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransmitMode::SendRecv => "sendrecv",
            TransmitMode::SendOnly => "sendonly",
            TransmitMode::RecvOnly => "recvonly",
            TransmitMode::Inactive => "inactive",
        }
    }
}

impl fmt::Display for TransmitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// RTP payload format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Codec {
    pub payload_type: u8,
    pub name: String,
    pub clock_rate: u32,
}

impl Codec {
    pub fn new(payload_type: u8, name: &str, clock_rate: u32) -> Self {
        Self {
            payload_type,
            name: name.to_string(),
            clock_rate,
        }
    }

    pub fn pcmu() -> Self {
        Self::new(0, "PCMU", 8000)
    }

    pub fn pcma() -> Self {
        Self::new(8, "PCMA", 8000)
    }

    pub fn telephone_event() -> Self {
        Self::new(101, "telephone-event", 8000)
    }

    pub fn is_telephone_event(&self) -> bool {
        self.name.eq_ignore_ascii_case("telephone-event")
    }
}

/// One audio stream: local RTP port and the codecs offered on it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaStream {
    pub port: u16,
    pub codecs: Vec<Codec>,
}

/// Media the application wants advertised. Embedded in session bodies as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDescription {
    pub streams: Vec<MediaStream>,
}

impl MediaDescription {
    pub fn audio(port: u16, codecs: Vec<Codec>) -> Self {
        Self {
            streams: vec![MediaStream { port, codecs }],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
