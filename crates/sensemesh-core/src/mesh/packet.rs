//! Mesh message types and wire codec
//!
//! Every frame on the air is a flat, comma-delimited ASCII record whose
//! first field is the integer message kind. There is no length prefix and
//! no checksum; integrity is left to the radio's own CRC.
//!
//! ## Record Layout
//!
//! ```text
//! ┌──────┬──────────────────┬──────────────────────────────────────────────────┐
//! │ kind │ message          │ fields after the kind                            │
//! ├──────┼──────────────────┼──────────────────────────────────────────────────┤
//! │  0   │ DiscoveryRequest │ (none)                                           │
//! │  1   │ DiscoveryReply   │ level, origin                                    │
//! │  2   │ DataMessage      │ dest, source, co2, temperature, humidity, nonce  │
//! │  3   │ DataAck          │ nonce                                            │
//! └──────┴──────────────────┴──────────────────────────────────────────────────┘
//!
//! 2,aa:bb:cc:dd:ee:01,aa:bb:cc:dd:ee:07,412.00,21.50,48.25,4321
//! ```
//!
//! Fields are never escaped. Addresses are rendered as colon-delimited hex
//! octets and numbers as plain decimals, so neither can contain the
//! delimiter.

use crate::sensor::SensorReading;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Separator between record fields
pub const FIELD_DELIMITER: char = ',';

/// Smallest nonce a node draws for its own readings
pub const NONCE_MIN: u16 = 1000;

/// Largest nonce a node draws for its own readings
pub const NONCE_MAX: u16 = 9999;

/// Errors produced while decoding a wire record
///
/// Callers discard the offending frame; a decode failure is never reported
/// back to the sender.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// A field is missing, surplus, or does not parse
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    /// The leading kind field is not one of the four known kinds
    #[error("unrecognized message kind {0:?}")]
    UnknownKind(String),
}

/// Link-layer node address (6 octets)
///
/// Rendered as lowercase colon-delimited hex, e.g. `aa:bb:cc:dd:ee:01`.
/// The text form is fixed length and is what travels on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeAddress([u8; 6]);

impl NodeAddress {
    /// Length of the text rendering (`xx:xx:xx:xx:xx:xx`)
    pub const TEXT_LEN: usize = 17;

    /// Create an address from raw octets
    pub fn from_octets(octets: [u8; 6]) -> Self {
        NodeAddress(octets)
    }

    /// Create an address whose last two octets carry `index`
    ///
    /// Used by the simulator and tests to mint stable, readable addresses.
    pub fn from_index(index: u16) -> Self {
        let [hi, lo] = index.to_be_bytes();
        NodeAddress([0x02, 0x00, 0x00, 0x00, hi, lo])
    }

    /// Parse the colon-delimited text form (case-insensitive)
    pub fn parse(text: &str) -> Result<Self, DecodeError> {
        let invalid = || DecodeError::MalformedRecord(format!("invalid node address {:?}", text));

        if text.len() != Self::TEXT_LEN {
            return Err(invalid());
        }

        let mut octets = [0u8; 6];
        let mut parts = text.split(':');
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(NodeAddress(octets))
    }

    /// Get the raw octets
    pub fn octets(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl fmt::Debug for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeAddress({})", self)
    }
}

impl FromStr for NodeAddress {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for NodeAddress {
    type Error = DecodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<NodeAddress> for String {
    fn from(address: NodeAddress) -> Self {
        address.to_string()
    }
}

/// Message kind discriminant carried as the first record field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    /// Broadcast asking connected neighbors for their level
    DiscoveryRequest = 0,
    /// Answer to a discovery request
    DiscoveryReply = 1,
    /// Sensor reading travelling toward the sink
    Data = 2,
    /// Per-hop acknowledgement of a data message
    DataAck = 3,
}

impl MessageKind {
    /// Create from the numeric tag
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(MessageKind::DiscoveryRequest),
            1 => Some(MessageKind::DiscoveryReply),
            2 => Some(MessageKind::Data),
            3 => Some(MessageKind::DataAck),
            _ => None,
        }
    }

    /// Numeric tag written on the wire
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Number of fields in a well-formed record, kind included
    pub fn field_count(self) -> usize {
        match self {
            MessageKind::DiscoveryRequest => 1,
            MessageKind::DiscoveryReply => 3,
            MessageKind::Data => 7,
            MessageKind::DataAck => 2,
        }
    }
}

/// A sensor reading on its way to the sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataMessage {
    /// Next relay for this hop; rewritten before every transmission.
    /// `None` until the message is first handed to the radio.
    pub dest: Option<NodeAddress>,
    /// Node that took the reading (fixed for the message's lifetime)
    pub source: NodeAddress,
    /// The measured values
    pub reading: SensorReading,
    /// Correlates the hop-by-hop acknowledgement
    pub nonce: u16,
}

impl DataMessage {
    /// Create a fresh data message with no relay assigned yet
    pub fn new(source: NodeAddress, reading: SensorReading, nonce: u16) -> Self {
        Self {
            dest: None,
            source,
            reading,
            nonce,
        }
    }

    /// Check whether this hop is addressed to `address`
    pub fn is_for(&self, address: NodeAddress) -> bool {
        self.dest == Some(address)
    }
}

/// A mesh message
///
/// This is the only in-memory representation; text appears only at the
/// codec boundary. Two messages are equal when they encode to the same
/// record, which is the equality used for duplicate suppression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Broadcast sent by an isolated node
    DiscoveryRequest,
    /// Advertises the replying node's hop level
    DiscoveryReply {
        /// Hop distance of `origin` to the sink
        level: u32,
        /// Address of the replying node
        origin: NodeAddress,
    },
    /// Sensor reading
    Data(DataMessage),
    /// Acknowledges the data message carrying `nonce`
    DataAck {
        /// Nonce copied from the acknowledged data message
        nonce: u16,
    },
}

impl Message {
    /// Create a discovery reply
    pub fn discovery_reply(level: u32, origin: NodeAddress) -> Self {
        Message::DiscoveryReply { level, origin }
    }

    /// Create an acknowledgement
    pub fn ack(nonce: u16) -> Self {
        Message::DataAck { nonce }
    }

    /// Get the message kind
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::DiscoveryRequest => MessageKind::DiscoveryRequest,
            Message::DiscoveryReply { .. } => MessageKind::DiscoveryReply,
            Message::Data(_) => MessageKind::Data,
            Message::DataAck { .. } => MessageKind::DataAck,
        }
    }

    /// Replies and acks jump ahead of routine traffic
    pub fn is_priority(&self) -> bool {
        matches!(self, Message::DiscoveryReply { .. } | Message::DataAck { .. })
    }

    /// Data messages and discovery requests wait for an answer after sending
    pub fn awaits_reply(&self) -> bool {
        matches!(self, Message::Data(_) | Message::DiscoveryRequest)
    }

    /// Nonce of a data message or ack
    pub fn nonce(&self) -> Option<u16> {
        match self {
            Message::Data(data) => Some(data.nonce),
            Message::DataAck { nonce } => Some(*nonce),
            _ => None,
        }
    }

    /// Serialize to a wire record
    pub fn encode(&self) -> String {
        let d = FIELD_DELIMITER;
        let tag = self.kind().tag();
        match self {
            Message::DiscoveryRequest => tag.to_string(),
            Message::DiscoveryReply { level, origin } => format!("{tag}{d}{level}{d}{origin}"),
            Message::Data(data) => {
                let dest = data.dest.map(|a| a.to_string()).unwrap_or_default();
                format!(
                    "{tag}{d}{dest}{d}{}{d}{:.2}{d}{:.2}{d}{:.2}{d}{}",
                    data.source,
                    data.reading.co2,
                    data.reading.temperature,
                    data.reading.humidity,
                    data.nonce
                )
            }
            Message::DataAck { nonce } => format!("{tag}{d}{nonce}"),
        }
    }

    /// Serialize to radio payload bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode().into_bytes()
    }

    /// Deserialize a wire record
    pub fn decode(record: &str) -> Result<Self, DecodeError> {
        if record.is_empty() {
            return Err(DecodeError::MalformedRecord("empty record".to_string()));
        }

        let fields: Vec<&str> = record.split(FIELD_DELIMITER).collect();
        let tag = fields[0];
        let tag_value: u32 = parse_number(tag, "kind")?;
        let kind = u8::try_from(tag_value)
            .ok()
            .and_then(MessageKind::from_tag)
            .ok_or_else(|| DecodeError::UnknownKind(tag.to_string()))?;

        match kind {
            MessageKind::DiscoveryRequest => {
                // Older senders terminate the request with a bare delimiter
                let bare = fields.len() == 1 || (fields.len() == 2 && fields[1].is_empty());
                if !bare {
                    return Err(field_count_error(kind, fields.len()));
                }
                Ok(Message::DiscoveryRequest)
            }
            MessageKind::DiscoveryReply => {
                expect_fields(kind, &fields)?;
                Ok(Message::DiscoveryReply {
                    level: parse_number(fields[1], "level")?,
                    origin: NodeAddress::parse(fields[2])?,
                })
            }
            MessageKind::Data => {
                expect_fields(kind, &fields)?;
                let dest = match fields[1] {
                    "" => None,
                    text => Some(NodeAddress::parse(text)?),
                };
                Ok(Message::Data(DataMessage {
                    dest,
                    source: NodeAddress::parse(fields[2])?,
                    reading: SensorReading {
                        co2: parse_float(fields[3], "co2")?,
                        temperature: parse_float(fields[4], "temperature")?,
                        humidity: parse_float(fields[5], "humidity")?,
                    },
                    nonce: parse_number(fields[6], "nonce")?,
                }))
            }
            MessageKind::DataAck => {
                expect_fields(kind, &fields)?;
                Ok(Message::DataAck {
                    nonce: parse_number(fields[1], "nonce")?,
                })
            }
        }
    }

    /// Deserialize radio payload bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let record = std::str::from_utf8(bytes)
            .map_err(|_| DecodeError::MalformedRecord("payload is not ASCII text".to_string()))?;
        Self::decode(record)
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.kind() == other.kind() && self.encode() == other.encode()
    }
}

impl Eq for Message {}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

fn field_count_error(kind: MessageKind, found: usize) -> DecodeError {
    DecodeError::MalformedRecord(format!(
        "{:?} expects {} fields, found {}",
        kind,
        kind.field_count(),
        found
    ))
}

fn expect_fields(kind: MessageKind, fields: &[&str]) -> Result<(), DecodeError> {
    if fields.len() != kind.field_count() {
        return Err(field_count_error(kind, fields.len()));
    }
    Ok(())
}

fn parse_number<T: FromStr>(text: &str, field: &str) -> Result<T, DecodeError> {
    text.parse().map_err(|_| {
        DecodeError::MalformedRecord(format!("field {} is not a valid number: {:?}", field, text))
    })
}

fn parse_float(text: &str, field: &str) -> Result<f32, DecodeError> {
    let value: f32 = parse_number(text, field)?;
    if !value.is_finite() {
        return Err(DecodeError::MalformedRecord(format!(
            "field {} is not finite: {:?}",
            field, text
        )));
    }
    Ok(value)
}
