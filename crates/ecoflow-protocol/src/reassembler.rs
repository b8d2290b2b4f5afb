//! Stream reassembly for BLE notifications
//!
//! Notifications arrive in MTU-sized chunks with no alignment to frame
//! boundaries. A reassembler buffers the incomplete tail between calls and
//! emits decrypted candidate payloads in stream order. Corrupted frames are
//! skipped by rescanning for the next frame start; they never surface as
//! errors.

use crate::crc::crc8;
use crate::enc_packet::{EncPacket, FrameType, HEADER_SIZE, MAGIC};
use crate::packet::{self, PREAMBLE_SIZE, TRAILER_SIZE};
use crate::session::{Session, BLOCK_SIZE};
use crate::types::ProtocolError;

/// Upper bound on buffered bytes before the buffer is dropped
pub const MAX_BUFFERED: usize = 2 * (u16::MAX as usize + HEADER_SIZE + 2);

/// A reassembled payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidate {
    /// Plaintext handshake command payload
    Command(Vec<u8>),
    /// Decrypted bytes expected to hold an inner packet
    Packet(Vec<u8>),
}

/// Turns an unaligned byte stream into candidate payloads
pub trait Reassembler: Send {
    /// Feed bytes and extract every complete candidate
    ///
    /// Protocol frames are decrypted with `session`; they are dropped when no
    /// session is established yet.
    fn feed(&mut self, data: &[u8], session: Option<&Session>) -> Vec<Candidate>;

    /// Number of bytes held for the next call
    fn buffered(&self) -> usize;

    /// Clear the reassembler state
    fn clear(&mut self);
}

/// Frame layout used by a device family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Inner packets wrapped in [`EncPacket`] frames
    Wrapped,
    /// Inner packet header in the clear, remainder encrypted
    RawHeader,
}

impl Framing {
    /// A fresh reassembler for this framing
    #[must_use]
    pub fn reassembler(self) -> Box<dyn Reassembler> {
        match self {
            Framing::Wrapped => Box::new(WrappedReassembler::new()),
            Framing::RawHeader => Box::new(RawHeaderReassembler::new()),
        }
    }

    /// Frame an encoded inner packet for transmission
    #[allow(clippy::missing_errors_doc)]
    pub fn encode_packet(self, packet: &[u8], session: &Session) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Framing::Wrapped => EncPacket::protocol(session.encrypt(packet)).encode(),
            Framing::RawHeader => {
                if packet.len() < PREAMBLE_SIZE {
                    return Err(ProtocolError::FrameTooShort(packet.len()));
                }
                let mut data = packet[..PREAMBLE_SIZE].to_vec();
                data.extend(session.encrypt(&packet[PREAMBLE_SIZE..]));
                Ok(data)
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn cap_buffer(buffer: &mut Vec<u8>) {
    if buffer.len() > MAX_BUFFERED {
        tracing::warn!(
            "Reassembly buffer exceeded {} bytes, dropping {} bytes",
            MAX_BUFFERED,
            buffer.len()
        );
        buffer.clear();
    }
}

/// Reassembler for [`EncPacket`]-wrapped streams
#[derive(Debug, Default)]
pub struct WrappedReassembler {
    buffer: Vec<u8>,
}

impl WrappedReassembler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(512),
        }
    }

    fn emit(frame: EncPacket, session: Option<&Session>, out: &mut Vec<Candidate>) {
        match frame.frame_type {
            FrameType::Command => out.push(Candidate::Command(frame.payload)),
            FrameType::Protocol => {
                let Some(session) = session else {
                    tracing::warn!(
                        "Dropping protocol frame ({} bytes) received before session key",
                        frame.payload.len()
                    );
                    return;
                };
                match session.decrypt(&frame.payload) {
                    Ok(plain) => out.push(Candidate::Packet(plain)),
                    Err(e) => tracing::warn!("Failed to decrypt protocol frame: {}", e),
                }
            }
        }
    }
}

impl Reassembler for WrappedReassembler {
    fn feed(&mut self, data: &[u8], session: Option<&Session>) -> Vec<Candidate> {
        self.buffer.extend_from_slice(data);
        let mut out = Vec::new();
        let mut pos = 0;

        loop {
            let Some(start) = find(&self.buffer[pos..], &MAGIC) else {
                // Keep a trailing half prefix for the next chunk
                let tail = if self.buffer.last() == Some(&MAGIC[0]) {
                    self.buffer.len() - 1
                } else {
                    self.buffer.len()
                };
                pos = pos.max(tail);
                break;
            };
            if start > 0 {
                tracing::debug!("Skipping {} bytes before frame prefix", start);
            }
            pos += start;

            let rest = &self.buffer[pos..];
            let Some(total) = EncPacket::frame_len(rest) else {
                break;
            };

            if rest.len() < total {
                if find(&rest[MAGIC.len()..], &MAGIC).is_some() {
                    tracing::debug!("Incomplete frame followed by another prefix, rescanning");
                    pos += MAGIC.len();
                    continue;
                }
                break;
            }

            match EncPacket::decode(&rest[..total]) {
                Ok((frame, consumed)) => {
                    pos += consumed;
                    Self::emit(frame, session, &mut out);
                }
                Err(e) => {
                    tracing::debug!("Frame rejected ({}), resynchronizing", e);
                    pos += MAGIC.len();
                }
            }
        }

        self.buffer.drain(..pos);
        cap_buffer(&mut self.buffer);
        out
    }

    fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Reassembler for raw-header streams
#[derive(Debug, Default)]
pub struct RawHeaderReassembler {
    buffer: Vec<u8>,
}

impl RawHeaderReassembler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(512),
        }
    }

    /// Plaintext bytes after the preamble: rest of header, payload, CRC16
    fn inner_len(preamble: &[u8]) -> Result<usize, ProtocolError> {
        let payload_len = u16::from_le_bytes([preamble[2], preamble[3]]) as usize;
        Ok(packet::header_size(preamble[1])? - PREAMBLE_SIZE + payload_len + TRAILER_SIZE)
    }
}

impl Reassembler for RawHeaderReassembler {
    fn feed(&mut self, data: &[u8], session: Option<&Session>) -> Vec<Candidate> {
        self.buffer.extend_from_slice(data);
        let mut out = Vec::new();
        let mut pos = 0;

        loop {
            let Some(start) = self.buffer[pos..].iter().position(|&b| b == packet::PREFIX) else {
                pos = self.buffer.len();
                break;
            };
            pos += start;

            let rest = &self.buffer[pos..];
            if rest.len() < PREAMBLE_SIZE {
                break;
            }
            if crc8(&rest[..4]) != rest[4] {
                pos += 1;
                continue;
            }
            let inner_len = match Self::inner_len(rest) {
                Ok(len) => len,
                Err(e) => {
                    tracing::debug!("Header rejected ({}), resynchronizing", e);
                    pos += 1;
                    continue;
                }
            };
            let body_len = inner_len.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
            let total = PREAMBLE_SIZE + body_len;
            if rest.len() < total {
                break;
            }

            let Some(session) = session else {
                tracing::warn!("Dropping frame ({} bytes) received before session key", total);
                pos += total;
                continue;
            };
            match session.decrypt(&rest[PREAMBLE_SIZE..total]) {
                Ok(plain) if plain.len() >= inner_len => {
                    let mut candidate = rest[..PREAMBLE_SIZE].to_vec();
                    candidate.extend_from_slice(&plain[..inner_len]);
                    out.push(Candidate::Packet(candidate));
                    pos += total;
                }
                Ok(plain) => {
                    tracing::debug!("Decrypted body too short: {} < {}", plain.len(), inner_len);
                    pos += 1;
                }
                Err(e) => {
                    tracing::debug!("Failed to decrypt body ({}), resynchronizing", e);
                    pos += 1;
                }
            }
        }

        self.buffer.drain(..pos);
        cap_buffer(&mut self.buffer);
        out
    }

    fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;

    fn ecdh_session() -> Session {
        Session::from_shared_secret(&[0x11; 20]).unwrap()
    }

    /// Wrapped frames whose bytes contain the magic only at offset 0
    fn wrapped_stream(session: &Session, count: u8) -> (Vec<u8>, Vec<Vec<u8>>) {
        let mut stream = Vec::new();
        let mut packets = Vec::new();
        let mut salt = 0u32;
        for i in 0..count {
            loop {
                let packet = Packet::new(0x35, 0x21, 0x14, i, vec![i; 10 + i as usize])
                    .with_sequence(salt)
                    .encode(false)
                    .unwrap();
                let frame = Framing::Wrapped.encode_packet(&packet, session).unwrap();
                salt += 1;
                if find(&frame[1..], &MAGIC).is_none() && frame.last() != Some(&MAGIC[0]) {
                    stream.extend_from_slice(&frame);
                    packets.push(packet);
                    break;
                }
            }
        }
        (stream, packets)
    }

    fn raw_stream(session: &Session, count: u8) -> (Vec<u8>, Vec<Vec<u8>>) {
        let mut stream = Vec::new();
        let mut packets = Vec::new();
        for i in 0..count {
            let packet = Packet::new(0x35, 0x21, 0x02, i, vec![0x30 + i; 3 + 7 * i as usize])
                .with_sequence(u32::from(i) + 1)
                .encode(false)
                .unwrap();
            stream.extend(Framing::RawHeader.encode_packet(&packet, session).unwrap());
            packets.push(packet);
        }
        (stream, packets)
    }

    fn packets_of(candidates: Vec<Candidate>) -> Vec<Vec<u8>> {
        candidates
            .into_iter()
            .map(|c| match c {
                Candidate::Packet(p) => p,
                Candidate::Command(c) => panic!("unexpected command {c:02X?}"),
            })
            .collect()
    }

    fn feed_split(
        framing: Framing,
        stream: &[u8],
        session: &Session,
        cuts: &[usize],
    ) -> Vec<Vec<u8>> {
        let mut reassembler = framing.reassembler();
        let mut out = Vec::new();
        let mut last = 0;
        for &cut in cuts.iter().chain(std::iter::once(&stream.len())) {
            out.extend(packets_of(reassembler.feed(&stream[last..cut], Some(session))));
            last = cut;
        }
        assert_eq!(reassembler.buffered(), 0);
        out
    }

    #[test]
    fn test_wrapped_single_call() {
        let session = ecdh_session();
        let (stream, packets) = wrapped_stream(&session, 4);
        let mut reassembler = WrappedReassembler::new();
        let decoded = packets_of(reassembler.feed(&stream, Some(&session)));
        assert_eq!(decoded, packets);
        assert_eq!(reassembler.buffered(), 0);
    }

    #[test]
    fn test_wrapped_split_at_every_boundary() {
        let session = ecdh_session();
        let (stream, packets) = wrapped_stream(&session, 3);
        for cut in 0..=stream.len() {
            assert_eq!(
                feed_split(Framing::Wrapped, &stream, &session, &[cut]),
                packets,
                "split at {cut}"
            );
        }
        let every_byte: Vec<usize> = (1..stream.len()).collect();
        assert_eq!(
            feed_split(Framing::Wrapped, &stream, &session, &every_byte),
            packets
        );
    }

    #[test]
    fn test_wrapped_mtu_sized_chunks() {
        let session = ecdh_session();
        let (stream, packets) = wrapped_stream(&session, 6);
        for mtu in [20, 23, 64, 182, 244] {
            let cuts: Vec<usize> = (mtu..stream.len()).step_by(mtu).collect();
            assert_eq!(
                feed_split(Framing::Wrapped, &stream, &session, &cuts),
                packets,
                "mtu {mtu}"
            );
        }
    }

    #[test]
    fn test_wrapped_recovers_from_corruption() {
        let session = ecdh_session();
        let (good, packets) = wrapped_stream(&session, 3);
        let first_len = EncPacket::frame_len(&good).unwrap();
        let second_len = EncPacket::frame_len(&good[first_len..]).unwrap();

        let mut stream = vec![0x00, 0x5A, 0x13, 0x37];
        stream.extend_from_slice(&good);
        // Corrupt the second frame's payload
        stream[4 + first_len + HEADER_SIZE + 3] ^= 0xFF;

        let mut reassembler = WrappedReassembler::new();
        let decoded = packets_of(reassembler.feed(&stream, Some(&session)));
        assert_eq!(decoded, vec![packets[0].clone(), packets[2].clone()]);
        assert_eq!(reassembler.buffered(), 0);
        assert!(second_len > 0);
    }

    #[test]
    fn test_wrapped_false_prefix_inside_incomplete_frame() {
        let session = ecdh_session();
        let (good, packets) = wrapped_stream(&session, 1);
        // A bogus header announcing a long frame, immediately followed by a real one
        let mut stream = vec![0x5A, 0x5A, 0x10, 0x00, 0xFF, 0x00];
        stream.extend_from_slice(&good);
        let mut reassembler = WrappedReassembler::new();
        assert_eq!(packets_of(reassembler.feed(&stream, Some(&session))), packets);
    }

    #[test]
    fn test_wrapped_keeps_trailing_half_prefix() {
        let mut reassembler = WrappedReassembler::new();
        assert!(reassembler.feed(&[0x01, 0x02, 0x5A], None).is_empty());
        assert_eq!(reassembler.buffered(), 1);
        let frame = EncPacket::command(vec![0x02, 0x03]).encode().unwrap();
        let out = reassembler.feed(&frame[1..], None);
        assert_eq!(out, vec![Candidate::Command(vec![0x02, 0x03])]);
    }

    #[test]
    fn test_wrapped_protocol_frame_without_session_is_dropped() {
        let session = ecdh_session();
        let (stream, _) = wrapped_stream(&session, 1);
        let mut reassembler = WrappedReassembler::new();
        assert!(reassembler.feed(&stream, None).is_empty());
        assert_eq!(reassembler.buffered(), 0);
    }

    #[test]
    fn test_raw_header_split_at_every_boundary() {
        let session = Session::from_serial("Y711ZAB5ZH123456");
        let (stream, packets) = raw_stream(&session, 3);
        let mut whole = RawHeaderReassembler::new();
        assert_eq!(packets_of(whole.feed(&stream, Some(&session))), packets);

        for cut in 0..=stream.len() {
            assert_eq!(
                feed_split(Framing::RawHeader, &stream, &session, &[cut]),
                packets,
                "split at {cut}"
            );
        }
    }

    #[test]
    fn test_raw_header_candidates_decode_as_packets() {
        let session = Session::from_serial("Y711ZAB5ZH123456");
        let (stream, _) = raw_stream(&session, 2);
        let mut reassembler = RawHeaderReassembler::new();
        for candidate in packets_of(reassembler.feed(&stream, Some(&session))) {
            let packet = Packet::decode(&candidate, false).unwrap();
            assert_eq!(packet.src(), 0x35);
        }
    }

    #[test]
    fn test_raw_header_skips_bad_header_crc() {
        let session = Session::from_serial("Y711ZAB5ZH123456");
        let (good, packets) = raw_stream(&session, 1);
        let mut stream = vec![0xAA, 0x03, 0x10, 0x00, 0x00];
        stream.extend_from_slice(&good);
        let mut reassembler = RawHeaderReassembler::new();
        assert_eq!(packets_of(reassembler.feed(&stream, Some(&session))), packets);
    }
}
