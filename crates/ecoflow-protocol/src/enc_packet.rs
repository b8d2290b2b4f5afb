//! Outer frame wrapper used by the primary device family
//!
//! Frame format:
//! ```text
//! [Magic: 2 bytes] 0x5A 0x5A
//! [Frame Type: 1 byte] (0x00=command, 0x10=protocol)
//! [Payload Type: 1 byte]
//! [Payload Length: 2 bytes LE]
//! [Payload: variable]
//! [CRC16: 2 bytes LE] over frame type..payload (magic excluded)
//! ```

use crate::crc::crc16;
use crate::types::ProtocolError;

/// Frame start marker
pub const MAGIC: [u8; 2] = [0x5A, 0x5A];

/// magic(2) + frame type(1) + payload type(1) + length(2)
pub const HEADER_SIZE: usize = 6;

/// Smallest possible frame: header + empty payload + CRC
pub const MIN_FRAME_SIZE: usize = HEADER_SIZE + 2;

/// Payload type carried by both frame types
pub const PAYLOAD_TYPE_VX_PROTOCOL: u8 = 0x00;
pub const PAYLOAD_TYPE_ODM_PROTOCOL: u8 = 0x04;

/// Outer frame type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Unencrypted handshake command
    Command = 0x00,
    /// Encrypted application packet
    Protocol = 0x10,
}

impl FrameType {
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(FrameType::Command),
            0x10 => Some(FrameType::Protocol),
            _ => None,
        }
    }
}

/// An outer wrapped frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncPacket {
    pub frame_type: FrameType,
    pub payload_type: u8,
    pub payload: Vec<u8>,
}

impl EncPacket {
    #[must_use]
    pub fn new(frame_type: FrameType, payload: Vec<u8>) -> Self {
        Self {
            frame_type,
            payload_type: PAYLOAD_TYPE_VX_PROTOCOL,
            payload,
        }
    }

    /// Plaintext handshake command frame
    #[must_use]
    pub fn command(payload: Vec<u8>) -> Self {
        Self::new(FrameType::Command, payload)
    }

    /// Protocol frame; `payload` must already be encrypted
    #[must_use]
    pub fn protocol(payload: Vec<u8>) -> Self {
        Self::new(FrameType::Protocol, payload)
    }

    /// Serialize to wire bytes
    #[allow(clippy::missing_errors_doc)]
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let len = u16::try_from(self.payload.len())
            .map_err(|_| ProtocolError::PayloadTooLarge(self.payload.len()))?;

        let mut data = Vec::with_capacity(MIN_FRAME_SIZE + self.payload.len());
        data.extend_from_slice(&MAGIC);
        data.push(self.frame_type as u8);
        data.push(self.payload_type);
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(&self.payload);

        let crc = crc16(&data[MAGIC.len()..]);
        data.extend_from_slice(&crc.to_le_bytes());
        Ok(data)
    }

    /// Full frame size announced by a header, CRC included
    #[must_use]
    pub fn frame_len(header: &[u8]) -> Option<usize> {
        if header.len() < HEADER_SIZE {
            return None;
        }
        let payload_len = u16::from_le_bytes([header[4], header[5]]) as usize;
        Some(HEADER_SIZE + payload_len + 2)
    }

    /// Parse a single frame starting at `data[0]`
    ///
    /// Returns the frame and the number of bytes it occupied.
    #[allow(clippy::missing_errors_doc)]
    pub fn decode(data: &[u8]) -> Result<(Self, usize), ProtocolError> {
        if data.len() < MIN_FRAME_SIZE {
            return Err(ProtocolError::FrameTooShort(data.len()));
        }
        if data[..2] != MAGIC {
            return Err(ProtocolError::MissingPrefix);
        }

        let total = Self::frame_len(data).ok_or(ProtocolError::FrameTooShort(data.len()))?;
        if data.len() < total {
            return Err(ProtocolError::FrameTooShort(data.len()));
        }

        let crc_offset = total - 2;
        let received_crc = u16::from_le_bytes([data[crc_offset], data[crc_offset + 1]]);
        let calculated_crc = crc16(&data[MAGIC.len()..crc_offset]);
        if received_crc != calculated_crc {
            return Err(ProtocolError::CrcMismatch {
                expected: calculated_crc,
                actual: received_crc,
            });
        }

        let frame_type = FrameType::from_u8(data[2]).ok_or_else(|| {
            ProtocolError::InvalidFrame(format!("Unknown frame type: {:#04X}", data[2]))
        })?;

        Ok((
            Self {
                frame_type,
                payload_type: data[3],
                payload: data[HEADER_SIZE..crc_offset].to_vec(),
            },
            total,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc::crc16_parts;

    #[test]
    fn test_layout() {
        let frame = EncPacket::command(vec![0x01, 0x00, 0xAB]).encode().unwrap();
        assert_eq!(&frame[..6], &[0x5A, 0x5A, 0x00, 0x00, 0x03, 0x00]);
        assert_eq!(&frame[6..9], &[0x01, 0x00, 0xAB]);
        let trailer = u16::from_le_bytes([frame[9], frame[10]]);
        assert_eq!(trailer, crc16_parts(&frame[2..6], &frame[6..9]));
    }

    #[test]
    fn test_decode_reports_consumed_bytes() {
        let mut data = EncPacket::protocol(vec![9; 32]).encode().unwrap();
        let frame_len = data.len();
        data.extend_from_slice(&[0xFF, 0xFF]);
        let (frame, consumed) = EncPacket::decode(&data).unwrap();
        assert_eq!(consumed, frame_len);
        assert_eq!(frame.frame_type, FrameType::Protocol);
        assert_eq!(frame.payload, vec![9; 32]);
    }

    #[test]
    fn test_any_byte_flip_is_rejected() {
        let data = EncPacket::protocol((0u8..40).collect()).encode().unwrap();
        for i in 2..data.len() {
            let mut bad = data.clone();
            bad[i] ^= 0x80;
            assert!(EncPacket::decode(&bad).is_err(), "flip at {i} accepted");
        }
    }

    #[test]
    fn test_frame_too_short() {
        let result = EncPacket::decode(&[0x5A, 0x5A, 0x00]);
        assert!(matches!(result, Err(ProtocolError::FrameTooShort(_))));
    }
}
