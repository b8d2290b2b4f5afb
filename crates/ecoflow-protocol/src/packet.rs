//! Inner application packet codec
//!
//! Packet format:
//! ```text
//! [Prefix: 1 byte] 0xAA
//! [Version: 1 byte]
//! [Payload Length: 2 bytes LE]
//! [Header CRC8: 1 byte] over the 4 bytes above
//! [Product ID: 1 byte]
//! [Sequence: 4 bytes LE]
//! [Reserved: 2 bytes]
//! [Src: 1 byte] [Dst: 1 byte]
//! [Dsrc: 1 byte] [Ddst: 1 byte]   (version 3 and later only)
//! [Cmd Set: 1 byte] [Cmd ID: 1 byte]
//! [Payload: variable]
//! [CRC16: 2 bytes LE] over everything above
//! ```

use crate::crc::{crc16, crc8};
use crate::types::ProtocolError;

/// Packet start marker
pub const PREFIX: u8 = 0xAA;

/// Bytes before the payload length is known: prefix + version + length + crc8
pub const PREAMBLE_SIZE: usize = 5;

/// Trailing CRC16 size
pub const TRAILER_SIZE: usize = 2;

/// Default product id byte written by the client
pub const DEFAULT_PRODUCT_ID: u8 = 0x0D;

/// Header size for a given protocol version
pub fn header_size(version: u8) -> Result<usize, ProtocolError> {
    match version {
        2 => Ok(16),
        3 | 4 | 0x13 => Ok(18),
        v => Err(ProtocolError::UnsupportedVersion(v)),
    }
}

/// Application-level packet carried inside a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    src: u8,
    dst: u8,
    dsrc: u8,
    ddst: u8,
    cmd_set: u8,
    cmd_id: u8,
    payload: Vec<u8>,
    version: u8,
    sequence: u32,
    product_id: u8,
}

impl Packet {
    /// Create a version 3 packet with default routing extras
    #[must_use]
    pub fn new(src: u8, dst: u8, cmd_set: u8, cmd_id: u8, payload: Vec<u8>) -> Self {
        Self {
            src,
            dst,
            dsrc: 1,
            ddst: 1,
            cmd_set,
            cmd_id,
            payload,
            version: 3,
            sequence: 0,
            product_id: DEFAULT_PRODUCT_ID,
        }
    }

    #[must_use]
    pub fn with_version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    #[must_use]
    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    #[must_use]
    pub fn with_product_id(mut self, product_id: u8) -> Self {
        self.product_id = product_id;
        self
    }

    #[must_use]
    pub fn with_device_route(mut self, dsrc: u8, ddst: u8) -> Self {
        self.dsrc = dsrc;
        self.ddst = ddst;
        self
    }

    pub fn src(&self) -> u8 {
        self.src
    }

    pub fn dst(&self) -> u8 {
        self.dst
    }

    pub fn dsrc(&self) -> u8 {
        self.dsrc
    }

    pub fn ddst(&self) -> u8 {
        self.ddst
    }

    pub fn cmd_set(&self) -> u8 {
        self.cmd_set
    }

    pub fn cmd_id(&self) -> u8 {
        self.cmd_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn product_id(&self) -> u8 {
        self.product_id
    }

    /// Serialize the packet, optionally XOR-obfuscating the payload
    #[allow(clippy::missing_errors_doc)]
    pub fn encode(&self, xor_payload: bool) -> Result<Vec<u8>, ProtocolError> {
        let header_len = header_size(self.version)?;
        let payload_len = u16::try_from(self.payload.len())
            .map_err(|_| ProtocolError::PayloadTooLarge(self.payload.len()))?;

        let mut data = Vec::with_capacity(header_len + self.payload.len() + TRAILER_SIZE);
        data.push(PREFIX);
        data.push(self.version);
        data.extend_from_slice(&payload_len.to_le_bytes());
        data.push(crc8(&data[..4]));

        data.push(self.product_id);
        let seq = self.sequence.to_le_bytes();
        data.extend_from_slice(&seq);
        data.extend_from_slice(&[0x00, 0x00]);
        data.push(self.src);
        data.push(self.dst);
        if header_len == 18 {
            data.push(self.dsrc);
            data.push(self.ddst);
        }
        data.push(self.cmd_set);
        data.push(self.cmd_id);

        if xor_payload && seq[0] != 0 {
            data.extend(self.payload.iter().map(|b| b ^ seq[0]));
        } else {
            data.extend_from_slice(&self.payload);
        }

        let crc = crc16(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        Ok(data)
    }

    /// Total encoded size implied by a preamble, if it can be computed
    pub fn encoded_len(preamble: &[u8]) -> Result<usize, ProtocolError> {
        if preamble.len() < PREAMBLE_SIZE {
            return Err(ProtocolError::FrameTooShort(preamble.len()));
        }
        let payload_len = u16::from_le_bytes([preamble[2], preamble[3]]) as usize;
        Ok(header_size(preamble[1])? + payload_len + TRAILER_SIZE)
    }

    /// Parse a packet, removing payload XOR obfuscation when requested
    ///
    /// Bytes beyond the declared packet length are ignored.
    #[allow(clippy::missing_errors_doc)]
    pub fn decode(data: &[u8], xor_payload: bool) -> Result<Self, ProtocolError> {
        if data.len() < PREAMBLE_SIZE {
            return Err(ProtocolError::FrameTooShort(data.len()));
        }
        if data[0] != PREFIX {
            return Err(ProtocolError::MissingPrefix);
        }

        let header_crc = crc8(&data[..4]);
        if header_crc != data[4] {
            return Err(ProtocolError::HeaderCrcMismatch {
                expected: header_crc,
                actual: data[4],
            });
        }

        let version = data[1];
        let header_len = header_size(version)?;
        let payload_len = u16::from_le_bytes([data[2], data[3]]) as usize;
        let total = header_len + payload_len + TRAILER_SIZE;
        if data.len() < total {
            return Err(ProtocolError::FrameTooShort(data.len()));
        }

        let crc_offset = total - TRAILER_SIZE;
        let received_crc = u16::from_le_bytes([data[crc_offset], data[crc_offset + 1]]);
        let calculated_crc = crc16(&data[..crc_offset]);
        if received_crc != calculated_crc {
            return Err(ProtocolError::CrcMismatch {
                expected: calculated_crc,
                actual: received_crc,
            });
        }

        let product_id = data[5];
        let seq = [data[6], data[7], data[8], data[9]];
        let src = data[12];
        let dst = data[13];
        let (dsrc, ddst, cmd_set, cmd_id) = if header_len == 18 {
            (data[14], data[15], data[16], data[17])
        } else {
            (1, 1, data[14], data[15])
        };

        let raw = &data[header_len..crc_offset];
        let payload = if xor_payload && seq[0] != 0 {
            raw.iter().map(|b| b ^ seq[0]).collect()
        } else {
            raw.to_vec()
        };

        Ok(Self {
            src,
            dst,
            dsrc,
            ddst,
            cmd_set,
            cmd_id,
            payload,
            version,
            sequence: u32::from_le_bytes(seq),
            product_id,
        })
    }
}
