//! Datagram framing
//!
//! Wire layout of one datagram:
//!
//! ```text
//! | length: u32 BE | crc32: u32 BE | envelope: msgpack (length bytes) |
//! ```

use serde::{Deserialize, Serialize};

use super::{NodeId, PeerMessage};
use crate::error::NetworkError;

pub const PROTOCOL_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EnvelopeBody {
    Data { seq: u64, message: PeerMessage },
    Ack { seq: u64 },
}

/// Transport envelope. `session` changes every time a node restarts so
/// receivers can reset their duplicate windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u8,
    pub sender: NodeId,
    pub session: u64,
    pub body: EnvelopeBody,
}

impl Envelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>, NetworkError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NetworkError> {
        let envelope: Self = rmp_serde::from_slice(bytes)?;
        if envelope.version != PROTOCOL_VERSION {
            return Err(NetworkError::Malformed(format!(
                "unsupported protocol version {}",
                envelope.version
            )));
        }
        Ok(envelope)
    }
}

/// Checksummed frame around an encoded envelope.
#[derive(Debug, Clone)]
pub struct MessageFrame {
    pub checksum: u32,
    pub data: Vec<u8>,
}

impl MessageFrame {
    pub fn new(envelope: &Envelope) -> Result<Self, NetworkError> {
        let data = envelope.to_bytes()?;
        Ok(Self {
            checksum: crc32fast::hash(&data),
            data,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.data.len());
        out.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.checksum.to_be_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, NetworkError> {
        if datagram.len() < HEADER_LEN {
            return Err(NetworkError::Malformed(format!("datagram of {} bytes", datagram.len())));
        }
        let (header, data) = datagram.split_at(HEADER_LEN);
        let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let checksum = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if length != data.len() {
            return Err(NetworkError::Malformed(format!(
                "length field {} but {} bytes follow",
                length,
                data.len()
            )));
        }
        let frame = Self {
            checksum,
            data: data.to_vec(),
        };
        frame.verify()?;
        Ok(frame)
    }

    pub fn verify(&self) -> Result<(), NetworkError> {
        let actual = crc32fast::hash(&self.data);
        if actual != self.checksum {
            return Err(NetworkError::Checksum {
                expected: self.checksum,
                actual,
            });
        }
        Ok(())
    }

    pub fn into_envelope(self) -> Result<Envelope, NetworkError> {
        self.verify()?;
        Envelope::from_bytes(&self.data)
    }
}
