//! CRC8/CRC16 checksums used by the frame and packet codecs

use crc::{Crc, CRC_16_ARC, CRC_8_SMBUS};

const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_ARC);

/// CRC-8 (poly 0x07, init 0) used over 4-byte packet headers
#[must_use]
pub fn crc8(data: &[u8]) -> u8 {
    CRC8.checksum(data)
}

/// CRC-16/ARC used over whole packets and outer frames
#[must_use]
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// CRC-16 over a header and payload held in separate buffers
#[must_use]
pub fn crc16_parts(header: &[u8], payload: &[u8]) -> u16 {
    let mut digest = CRC16.digest();
    digest.update(header);
    digest.update(payload);
    digest.finalize()
}
