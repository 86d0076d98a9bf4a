//! M2M over-the-air message framing
//!
//! ```text
//!  0       1       2       3       4..6      6..14      14..n-1   n-1
//! +-------+-------+-------+-------+---------+----------+---------+-----+
//! | major | minor | type  | event | seq u16 | time u64 | tuples  | crc |
//! +-------+-------+-------+-------+---------+----------+---------+-----+
//! ```
//!
//! Multi-byte integers are big-endian. Each tuple is `type u8, id u8, value`,
//! and the trailing byte is CRC-8/SMBUS over everything before it. Only the
//! framing and type dispatch matter to the relay; tuple contents pass through.

use crc::{CRC_8_SMBUS, Crc};
use serde::{Deserialize, Serialize};

use crate::{GatewayError, Result};

pub const MOBILE_ORIGINATED_EVENT: u8 = 0xAA;
pub const MOBILE_ORIGINATED_ACK: u8 = 0xAB;
pub const MOBILE_TERMINATED_EVENT: u8 = 0xCC;
pub const MOBILE_TERMINATED_ACK: u8 = 0xCD;

pub const TUPLE_INT: u8 = 1;
pub const TUPLE_STRING: u8 = 2;
pub const TUPLE_BYTES: u8 = 3;
pub const TUPLE_BYTE: u8 = 4;

pub const MAJOR_VERSION: u8 = 1;
pub const MINOR_VERSION: u8 = 0;

const HEADER_LEN: usize = 14;
const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);

pub fn crc8(bytes: &[u8]) -> u8 {
    CRC8.checksum(bytes)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum TupleValue {
    Int(i32),
    String(String),
    Bytes(Vec<u8>),
    Byte(u8),
}

impl TupleValue {
    pub fn tuple_type(&self) -> u8 {
        match self {
            TupleValue::Int(_) => TUPLE_INT,
            TupleValue::String(_) => TUPLE_STRING,
            TupleValue::Bytes(_) => TUPLE_BYTES,
            TupleValue::Byte(_) => TUPLE_BYTE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "StoredTuple")]
pub struct Tuple {
    #[serde(rename = "type")]
    pub tuple_type: u8,
    pub id: u8,
    pub value: TupleValue,
}

impl Tuple {
    pub fn new(id: u8, value: TupleValue) -> Self {
        Self { tuple_type: value.tuple_type(), id, value }
    }
}

/// Storage form of a tuple, whose value is interpreted by its type.
#[derive(Deserialize)]
struct StoredTuple {
    #[serde(rename = "type")]
    tuple_type: u8,
    id: u8,
    value: serde_json::Value,
}

impl TryFrom<StoredTuple> for Tuple {
    type Error = String;

    fn try_from(stored: StoredTuple) -> std::result::Result<Self, String> {
        let value = match stored.tuple_type {
            TUPLE_INT => {
                TupleValue::Int(serde_json::from_value(stored.value).map_err(|e| e.to_string())?)
            }
            TUPLE_STRING => {
                TupleValue::String(serde_json::from_value(stored.value).map_err(|e| e.to_string())?)
            }
            TUPLE_BYTES => {
                TupleValue::Bytes(serde_json::from_value(stored.value).map_err(|e| e.to_string())?)
            }
            TUPLE_BYTE => {
                TupleValue::Byte(serde_json::from_value(stored.value).map_err(|e| e.to_string())?)
            }
            other => return Err(format!("unknown tuple type: {other}")),
        };
        Ok(Tuple::new(stored.id, value))
    }
}

/// Decoded message. Serializes to the JSON pushed onto the command queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub major_version: u8,
    pub minor_version: u8,
    pub message_type: u8,
    pub event_code: u8,
    pub sequence_number: u16,
    pub timestamp: u64,
    pub tuples: Vec<Tuple>,
}

impl WireMessage {
    pub fn new(message_type: u8) -> Self {
        Self {
            major_version: MAJOR_VERSION,
            minor_version: MINOR_VERSION,
            message_type,
            event_code: 0,
            sequence_number: 0,
            timestamp: 0,
            tuples: Vec::new(),
        }
    }

    pub fn with_event_code(mut self, event_code: u8) -> Self {
        self.event_code = event_code;
        self
    }

    pub fn with_sequence_number(mut self, sequence_number: u16) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn push_int(mut self, id: u8, value: i32) -> Self {
        self.tuples.push(Tuple::new(id, TupleValue::Int(value)));
        self
    }

    pub fn push_string(mut self, id: u8, value: &str) -> Self {
        self.tuples.push(Tuple::new(id, TupleValue::String(value.to_string())));
        self
    }

    pub fn push_bytes(mut self, id: u8, value: &[u8]) -> Self {
        self.tuples.push(Tuple::new(id, TupleValue::Bytes(value.to_vec())));
        self
    }

    pub fn push_byte(mut self, id: u8, value: u8) -> Self {
        self.tuples.push(Tuple::new(id, TupleValue::Byte(value)));
        self
    }

    /// Encode with the trailing CRC.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidValue`] if a string or byte tuple is
    /// longer than a `u16` length prefix can describe.
    pub fn to_wire(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + 1);
        bytes.extend_from_slice(&[
            self.major_version,
            self.minor_version,
            self.message_type,
            self.event_code,
        ]);
        bytes.extend_from_slice(&self.sequence_number.to_be_bytes());
        bytes.extend_from_slice(&self.timestamp.to_be_bytes());

        for tuple in &self.tuples {
            bytes.push(tuple.value.tuple_type());
            bytes.push(tuple.id);
            match &tuple.value {
                TupleValue::Int(value) => bytes.extend_from_slice(&value.to_be_bytes()),
                TupleValue::String(value) => push_prefixed(&mut bytes, value.as_bytes())?,
                TupleValue::Bytes(value) => push_prefixed(&mut bytes, value)?,
                TupleValue::Byte(value) => bytes.push(*value),
            }
        }

        bytes.push(crc8(&bytes));
        Ok(bytes)
    }

    /// Decode a datagram, checking the CRC before anything else.
    pub fn from_wire(data: &[u8]) -> Result<Self> {
        let Some((&found, payload)) = data.split_last() else {
            return Err(GatewayError::decode_error("empty message"));
        };
        let expected = crc8(payload);
        if found != expected {
            return Err(GatewayError::Crc { found, expected });
        }

        let mut reader = Reader { data: payload, offset: 0 };
        let mut message = WireMessage {
            major_version: reader.u8()?,
            minor_version: reader.u8()?,
            message_type: reader.u8()?,
            event_code: reader.u8()?,
            sequence_number: u16::from_be_bytes(reader.array()?),
            timestamp: u64::from_be_bytes(reader.array()?),
            tuples: Vec::new(),
        };

        while !reader.is_empty() {
            let tuple_type = reader.u8()?;
            let id = reader.u8()?;
            let value = match tuple_type {
                TUPLE_INT => TupleValue::Int(i32::from_be_bytes(reader.array()?)),
                TUPLE_STRING => {
                    let offset = reader.offset;
                    let raw = reader.prefixed()?;
                    let text = std::str::from_utf8(raw).map_err(|_| {
                        let details = format!("invalid UTF-8 string at offset {offset}");
                        GatewayError::decode_error(details)
                    })?;
                    TupleValue::String(text.to_string())
                }
                TUPLE_BYTES => TupleValue::Bytes(reader.prefixed()?.to_vec()),
                TUPLE_BYTE => TupleValue::Byte(reader.u8()?),
                other => {
                    return Err(GatewayError::decode_error(format!(
                        "unknown tuple type {other} at offset {}",
                        reader.offset - 2
                    )));
                }
            };
            message.tuples.push(Tuple { tuple_type, id, value });
        }

        Ok(message)
    }

    /// JSON form kept in the store queues.
    pub fn to_storage_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_storage_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| GatewayError::decode_error(e.to_string()))
    }
}

fn push_prefixed(bytes: &mut Vec<u8>, value: &[u8]) -> Result<()> {
    let len = u16::try_from(value.len()).map_err(|_| GatewayError::InvalidValue {
        field: "tuple",
        value: format!("{} bytes", value.len()),
    })?;
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(value);
    Ok(())
}

struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn is_empty(&self) -> bool {
        self.offset >= self.data.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.offset + len;
        let Some(slice) = self.data.get(self.offset..end) else {
            return Err(GatewayError::decode_error(format!(
                "buffer too short: needed {end} bytes, found {}",
                self.data.len()
            )));
        };
        self.offset = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.take(N)?);
        Ok(array)
    }

    fn prefixed(&mut self) -> Result<&'a [u8]> {
        let len = u16::from_be_bytes(self.array()?);
        self.take(usize::from(len))
    }
}
