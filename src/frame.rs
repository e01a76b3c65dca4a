//! CAN frame construction and the wire-level byte helpers shared by the SDO
//! and PDO engines: standard-ID frame building over a fixed 8-byte payload,
//! little-endian scalar packing and the CRC-16-CCITT used by SDO block
//! transfers.

use embedded_can::{Frame, Id, StandardId};

use crate::error::ErrorCode;

/// Builds a CAN 2.0A frame addressed at `cob_id`, right-padding `data` with
/// zero bytes up to the full 8-byte payload.
pub fn create_frame_with_padding<F: Frame>(cob_id: u16, data: &[u8]) -> Result<F, ErrorCode> {
    let mut packet = [0u8; 8];
    let n = data.len().min(8);
    packet[..n].copy_from_slice(&data[..n]);

    F::new(
        StandardId::new(cob_id).ok_or(ErrorCode::InvalidStandardId { cob_id })?,
        &packet,
    )
    .ok_or(ErrorCode::FrameCreationFailed)
}

/// Builds a CAN 2.0A frame with `data` as its exact payload (used for RTR-less
/// short frames such as NMT commands, which are fixed at 2 bytes).
pub fn create_frame<F: Frame>(cob_id: u16, data: &[u8]) -> Result<F, ErrorCode> {
    F::new(StandardId::new(cob_id).ok_or(ErrorCode::InvalidStandardId { cob_id })?, data)
        .ok_or(ErrorCode::FrameCreationFailed)
}

/// Standard 11-bit COB-ID of a received frame, or `None` for extended frames
/// (CAN 2.0B is out of scope; see Non-goals).
pub fn get_cob_id<F: Frame>(frame: &F) -> Option<u16> {
    match frame.id() {
        Id::Standard(sid) => Some(sid.as_raw()),
        Id::Extended(_) => None,
    }
}

/// Multiplexor `(index, sub_index)` carried in bytes 1..4 of an SDO frame.
pub fn get_index_from_data(data: &[u8]) -> (u16, u8) {
    (u16::from_le_bytes([data[1], data[2]]), data[3])
}

/// Decodes a little-endian `u32` out of a byte slice of any length up to 4,
/// as used for SDO expedited payloads shorter than 4 bytes.
pub fn bytes_to_u32_le(data: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    let n = data.len().min(4);
    buf[..n].copy_from_slice(&data[..n]);
    u32::from_le_bytes(buf)
}

/// Encodes `value`'s low `len` bytes (`len` <= 8) into little-endian order.
pub fn u64_to_le_bytes(value: u64, len: usize) -> [u8; 8] {
    let mut out = [0u8; 8];
    let n = len.min(8);
    out[..n].copy_from_slice(&value.to_le_bytes()[..n]);
    out
}

/// Decodes up to 8 little-endian bytes into a `u64`, zero-extending.
pub fn le_bytes_to_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    buf[..n].copy_from_slice(&bytes[..n]);
    u64::from_le_bytes(buf)
}

static CCITT_HASH: [u16; 256] = [
    0x0000, 0x1021, 0x2042, 0x3063, 0x4084, 0x50a5, 0x60c6, 0x70e7, 0x8108, 0x9129, 0xa14a, 0xb16b,
    0xc18c, 0xd1ad, 0xe1ce, 0xf1ef, 0x1231, 0x0210, 0x3273, 0x2252, 0x52b5, 0x4294, 0x72f7, 0x62d6,
    0x9339, 0x8318, 0xb37b, 0xa35a, 0xd3bd, 0xc39c, 0xf3ff, 0xe3de, 0x2462, 0x3443, 0x0420, 0x1401,
    0x64e6, 0x74c7, 0x44a4, 0x5485, 0xa56a, 0xb54b, 0x8528, 0x9509, 0xe5ee, 0xf5cf, 0xc5ac, 0xd58d,
    0x3653, 0x2672, 0x1611, 0x0630, 0x76d7, 0x66f6, 0x5695, 0x46b4, 0xb75b, 0xa77a, 0x9719, 0x8738,
    0xf7df, 0xe7fe, 0xd79d, 0xc7bc, 0x48c4, 0x58e5, 0x6886, 0x78a7, 0x0840, 0x1861, 0x2802, 0x3823,
    0xc9cc, 0xd9ed, 0xe98e, 0xf9af, 0x8948, 0x9969, 0xa90a, 0xb92b, 0x5af5, 0x4ad4, 0x7ab7, 0x6a96,
    0x1a71, 0x0a50, 0x3a33, 0x2a12, 0xdbfd, 0xcbdc, 0xfbbf, 0xeb9e, 0x9b79, 0x8b58, 0xbb3b, 0xab1a,
    0x6ca6, 0x7c87, 0x4ce4, 0x5cc5, 0x2c22, 0x3c03, 0x0c60, 0x1c41, 0xedae, 0xfd8f, 0xcdec, 0xddcd,
    0xad2a, 0xbd0b, 0x8d68, 0x9d49, 0x7e97, 0x6eb6, 0x5ed5, 0x4ef4, 0x3e13, 0x2e32, 0x1e51, 0x0e70,
    0xff9f, 0xefbe, 0xdfdd, 0xcffc, 0xbf1b, 0xaf3a, 0x9f59, 0x8f78, 0x9188, 0x81a9, 0xb1ca, 0xa1eb,
    0xd10c, 0xc12d, 0xf14e, 0xe16f, 0x1080, 0x00a1, 0x30c2, 0x20e3, 0x5004, 0x4025, 0x7046, 0x6067,
    0x83b9, 0x9398, 0xa3fb, 0xb3da, 0xc33d, 0xd31c, 0xe37f, 0xf35e, 0x02b1, 0x1290, 0x22f3, 0x32d2,
    0x4235, 0x5214, 0x6277, 0x7256, 0xb5ea, 0xa5cb, 0x95a8, 0x8589, 0xf56e, 0xe54f, 0xd52c, 0xc50d,
    0x34e2, 0x24c3, 0x14a0, 0x0481, 0x7466, 0x6447, 0x5424, 0x4405, 0xa7db, 0xb7fa, 0x8799, 0x97b8,
    0xe75f, 0xf77e, 0xc71d, 0xd73c, 0x26d3, 0x36f2, 0x0691, 0x16b0, 0x6657, 0x7676, 0x4615, 0x5634,
    0xd94c, 0xc96d, 0xf90e, 0xe92f, 0x99c8, 0x89e9, 0xb98a, 0xa9ab, 0x5844, 0x4865, 0x7806, 0x6827,
    0x18c0, 0x08e1, 0x3882, 0x28a3, 0xcb7d, 0xdb5c, 0xeb3f, 0xfb1e, 0x8bf9, 0x9bd8, 0xabbb, 0xbb9a,
    0x4a75, 0x5a54, 0x6a37, 0x7a16, 0x0af1, 0x1ad0, 0x2ab3, 0x3a92, 0xfd2e, 0xed0f, 0xdd6c, 0xcd4d,
    0xbdaa, 0xad8b, 0x9de8, 0x8dc9, 0x7c26, 0x6c07, 0x5c64, 0x4c45, 0x3ca2, 0x2c83, 0x1ce0, 0x0cc1,
    0xef1f, 0xff3e, 0xcf5d, 0xdf7c, 0xaf9b, 0xbfba, 0x8fd9, 0x9ff8, 0x6e17, 0x7e36, 0x4e55, 0x5e74,
    0x2e93, 0x3eb2, 0x0ed1, 0x1ef0,
];

/// CRC-16-CCITT over a byte stream, as required for SDO block transfer (CiA
/// 301 §7.2.4.3.17). Table-driven, zero-initialised.
pub fn crc16_canopen_with_lut(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0x0000;
    for byte in bytes {
        let table_idx = ((crc >> 8) ^ (*byte as u16)) as usize;
        crc = CCITT_HASH[table_idx] ^ (crc << 8);
    }
    crc
}
