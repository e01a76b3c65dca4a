//! Emergency (EMCY) messages: the error code/register vocabulary, frame
//! construction, and the pre-defined error field history (0x1003).
//!
//! The teacher built the EMCY frame and wrote the history directly inside
//! `Node::trigger_emergency`. That coupling is split here: this module only
//! builds frames and tracks history state; `Node` still owns the object
//! dictionary and decides when to call into it, matching `od`'s pattern of
//! the object dictionary never reaching back into its callers.

use crate::config::CO_EMCY_HISTORY_N;
use crate::constant::{EMCY_HEARTBEAT_CONSUMER_TIMEOUT, EMCY_NO_ERROR, EMCY_PDO_NOT_PROCESSED};
use crate::error::ErrorCode;
use crate::frame::create_frame_with_padding;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum EmergencyErrorCode {
    NoError,
    PdoNotProcessed,
    HeartbeatConsumerTimeout,
}

impl EmergencyErrorCode {
    pub fn code(&self) -> u16 {
        match *self {
            EmergencyErrorCode::NoError => EMCY_NO_ERROR,
            EmergencyErrorCode::PdoNotProcessed => EMCY_PDO_NOT_PROCESSED,
            EmergencyErrorCode::HeartbeatConsumerTimeout => EMCY_HEARTBEAT_CONSUMER_TIMEOUT,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            EMCY_NO_ERROR => Some(EmergencyErrorCode::NoError),
            EMCY_PDO_NOT_PROCESSED => Some(EmergencyErrorCode::PdoNotProcessed),
            EMCY_HEARTBEAT_CONSUMER_TIMEOUT => Some(EmergencyErrorCode::HeartbeatConsumerTimeout),
            _ => None,
        }
    }
}

/// CiA 301 §7.2.7 error register bit positions (object 0x1001).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorRegister {
    GenericError,
    Current,
    Voltage,
    Temperature,
    CommunicationError,
    DeviceProfileSpecific,
    Reserved,
    ManufacturerSpecific,
}

impl ErrorRegister {
    pub fn bit(&self) -> u8 {
        match *self {
            ErrorRegister::GenericError => 0,
            ErrorRegister::Current => 1,
            ErrorRegister::Voltage => 2,
            ErrorRegister::Temperature => 3,
            ErrorRegister::CommunicationError => 4,
            ErrorRegister::DeviceProfileSpecific => 5,
            ErrorRegister::Reserved => 6,
            ErrorRegister::ManufacturerSpecific => 7,
        }
    }
}

/// 8-byte EMCY payload: `[eecl, eech, er, msef0..msef4]`.
pub fn build_payload(eec: EmergencyErrorCode, er: ErrorRegister, manufacturer_data: &[u8]) -> [u8; 8] {
    let mut payload = [0u8; 8];
    payload[0..2].copy_from_slice(&eec.code().to_le_bytes());
    payload[2] = 1 << er.bit();
    let n = manufacturer_data.len().min(5);
    payload[3..3 + n].copy_from_slice(&manufacturer_data[..n]);
    payload
}

/// Builds the EMCY frame for `node_id` (CiA 301 §7.2.7: COB-ID = 0x80 +
/// node ID).
pub fn build_frame<F: embedded_can::Frame>(node_id: u8, eec: EmergencyErrorCode, er: ErrorRegister, manufacturer_data: &[u8]) -> Result<F, ErrorCode> {
    let payload = build_payload(eec, er, manufacturer_data);
    create_frame_with_padding(crate::constant::COB_FUNC_EMCY + node_id as u16, &payload)
}

/// Pre-defined error field (object 0x1003): a ring of the most recent EMCY
/// codes, most recent at sub-index 1, count at sub-index 0.
pub struct History {
    entries: [u32; CO_EMCY_HISTORY_N],
    count: u8,
}

impl History {
    pub const fn new() -> Self {
        History { entries: [0u32; CO_EMCY_HISTORY_N], count: 0 }
    }

    /// Pushes `eec` to the front of the ring, shifting older entries back
    /// and dropping the oldest if the history is full.
    pub fn push(&mut self, eec: EmergencyErrorCode) {
        let len = self.entries.len();
        for i in (1..len).rev() {
            self.entries[i] = self.entries[i - 1];
        }
        self.entries[0] = eec.code() as u32;
        self.count = (self.count + 1).min(len as u8);
    }

    pub fn clear(&mut self) {
        self.entries = [0u32; CO_EMCY_HISTORY_N];
        self.count = 0;
    }

    pub fn count(&self) -> u8 {
        self.count
    }

    /// `sub_index` 1 is the most recent entry, matching CiA 301's sub-index
    /// numbering for 0x1003.
    pub fn entry(&self, sub_index: u8) -> Option<u32> {
        if sub_index == 0 || sub_index as usize > self.count as usize {
            return None;
        }
        Some(self.entries[sub_index as usize - 1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::test_support::TestFrame;

    #[test]
    fn error_code_round_trips() {
        assert_eq!(EmergencyErrorCode::PdoNotProcessed.code(), EMCY_PDO_NOT_PROCESSED);
        assert_eq!(EmergencyErrorCode::from_code(EMCY_PDO_NOT_PROCESSED), Some(EmergencyErrorCode::PdoNotProcessed));
        assert_eq!(EmergencyErrorCode::from_code(0xFFFF), None);
    }

    #[test]
    fn payload_packs_code_register_and_manufacturer_data() {
        let payload = build_payload(EmergencyErrorCode::PdoNotProcessed, ErrorRegister::CommunicationError, &[0xAA, 0xBB]);
        assert_eq!(payload[0..2], EMCY_PDO_NOT_PROCESSED.to_le_bytes());
        assert_eq!(payload[2], 1 << 4);
        assert_eq!(payload[3], 0xAA);
        assert_eq!(payload[4], 0xBB);
    }

    #[test]
    fn frame_targets_emcy_cob_id_for_node() {
        let frame: TestFrame = build_frame(5, EmergencyErrorCode::PdoNotProcessed, ErrorRegister::GenericError, &[]).unwrap();
        assert_eq!(crate::frame::get_cob_id(&frame), Some(0x85));
    }

    #[test]
    fn history_tracks_most_recent_first() {
        let mut history = History::new();
        history.push(EmergencyErrorCode::PdoNotProcessed);
        history.push(EmergencyErrorCode::HeartbeatConsumerTimeout);
        assert_eq!(history.count(), 2);
        assert_eq!(history.entry(1), Some(EMCY_HEARTBEAT_CONSUMER_TIMEOUT as u32));
        assert_eq!(history.entry(2), Some(EMCY_PDO_NOT_PROCESSED as u32));
    }

    #[test]
    fn history_caps_at_configured_capacity() {
        let mut history = History::new();
        for _ in 0..(CO_EMCY_HISTORY_N as u32 + 3) {
            history.push(EmergencyErrorCode::PdoNotProcessed);
        }
        assert_eq!(history.count() as usize, CO_EMCY_HISTORY_N);
    }
}
