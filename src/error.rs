//! Error kinds surfaced by the core and the SDO abort codes
//! (CiA 301 Annex) they get translated to or from.

use core::fmt;
use core::fmt::Formatter;

/// Internal failures the core returns synchronously to its caller.
///
/// Driver failures (the `If*` variants) are latched so subsequent
/// state-dependent decisions are left to the caller rather than unwinding
/// through a panic.
#[derive(Clone, Copy, Eq, PartialEq)]
pub enum ErrorCode {
    None,
    BadArg,
    ObjNotFound,
    ObjRead,
    ObjWrite,
    ObjRange,
    ObjType,
    ObjMap,
    ParaIdx,
    IfInit,
    IfEnable,
    IfRead,
    IfSend,
    IfReset,
    IfClose,
    TmrNoAct,
    TmrCreate,
    TmrDelete,
    SdoAbort(AbortCode),
    PdoLen,
    PdoMap,
    NmtMode,
    InvalidStandardId { cob_id: u16 },
    FrameCreationFailed,
}

impl fmt::Debug for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::None => write!(f, "no error"),
            ErrorCode::BadArg => write!(f, "bad argument"),
            ErrorCode::ObjNotFound => write!(f, "object not found"),
            ErrorCode::ObjRead => write!(f, "object not readable"),
            ErrorCode::ObjWrite => write!(f, "object not writable"),
            ErrorCode::ObjRange => write!(f, "object value out of range"),
            ErrorCode::ObjType => write!(f, "object type mismatch"),
            ErrorCode::ObjMap => write!(f, "object cannot be PDO mapped"),
            ErrorCode::ParaIdx => write!(f, "parameter index/sub-index invalid"),
            ErrorCode::IfInit => write!(f, "driver init failed"),
            ErrorCode::IfEnable => write!(f, "driver enable failed"),
            ErrorCode::IfRead => write!(f, "driver read failed"),
            ErrorCode::IfSend => write!(f, "driver send failed"),
            ErrorCode::IfReset => write!(f, "driver reset failed"),
            ErrorCode::IfClose => write!(f, "driver close failed"),
            ErrorCode::TmrNoAct => write!(f, "no free timer action slot"),
            ErrorCode::TmrCreate => write!(f, "timer creation failed"),
            ErrorCode::TmrDelete => write!(f, "timer deletion failed"),
            ErrorCode::SdoAbort(code) => write!(f, "SDO abort: {} ({:#010x})", code.description(), code.code()),
            ErrorCode::PdoLen => write!(f, "PDO length mismatch"),
            ErrorCode::PdoMap => write!(f, "PDO mapping invalid"),
            ErrorCode::NmtMode => write!(f, "operation not allowed in current NMT state"),
            ErrorCode::InvalidStandardId { cob_id } => write!(f, "invalid standard CAN id: {:#x}", cob_id),
            ErrorCode::FrameCreationFailed => write!(f, "CAN frame creation failed"),
        }
    }
}

#[cfg(feature = "std")]
impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ErrorCode {}

/// SDO abort codes, CiA 301 Annex (transferred as 32-bit little-endian on the wire).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum AbortCode {
    ToggleBitNotAlternated,
    SdoProtocolTimedOut,
    CommandSpecifierNotValidOrUnknown,
    InvalidBlockSize,
    InvalidSequenceNumber,
    CrcError,
    OutOfMemory,
    UnsupportedAccessToObject,
    AttemptToReadWriteOnlyObject,
    AttemptToWriteReadOnlyObject,
    ObjectDoesNotExistInObjectDictionary,
    ObjectCannotBeMappedToPdo,
    ExceedPdoSize,
    GeneralParameterIncompatibility,
    GeneralInternalIncompatibility,
    HardwareError,
    DataTypeMismatchLengthMismatch,
    DataTypeMismatchLengthTooHigh,
    DataTypeMismatchLengthTooLow,
    SubIndexDoesNotExist,
    ValueRangeExceeded,
    ValueWrittenTooHigh,
    ValueWrittenTooLow,
    MaxValueLessThanMinValue,
    ResourceNotAvailable,
    GeneralError,
    DataTransferOrStoreFailed,
    DataTransferOrStoreFailedDueToLocalControl,
    DataTransferOrStoreFailedDueToDeviceState,
    ObjectDictionaryGenerationFailedOrNotPresent,
}

impl AbortCode {
    pub const fn code(&self) -> u32 {
        match *self {
            AbortCode::ToggleBitNotAlternated => 0x0503_0000,
            AbortCode::SdoProtocolTimedOut => 0x0504_0000,
            AbortCode::CommandSpecifierNotValidOrUnknown => 0x0504_0001,
            AbortCode::InvalidBlockSize => 0x0504_0002,
            AbortCode::InvalidSequenceNumber => 0x0504_0003,
            AbortCode::CrcError => 0x0504_0004,
            AbortCode::OutOfMemory => 0x0504_0005,
            AbortCode::UnsupportedAccessToObject => 0x0601_0000,
            AbortCode::AttemptToReadWriteOnlyObject => 0x0601_0001,
            AbortCode::AttemptToWriteReadOnlyObject => 0x0601_0002,
            AbortCode::ObjectDoesNotExistInObjectDictionary => 0x0602_0000,
            AbortCode::ObjectCannotBeMappedToPdo => 0x0604_0041,
            AbortCode::ExceedPdoSize => 0x0604_0042,
            AbortCode::GeneralParameterIncompatibility => 0x0604_0043,
            AbortCode::GeneralInternalIncompatibility => 0x0604_0047,
            AbortCode::HardwareError => 0x0606_0000,
            AbortCode::DataTypeMismatchLengthMismatch => 0x0607_0010,
            AbortCode::DataTypeMismatchLengthTooHigh => 0x0607_0012,
            AbortCode::DataTypeMismatchLengthTooLow => 0x0607_0013,
            AbortCode::SubIndexDoesNotExist => 0x0609_0011,
            AbortCode::ValueRangeExceeded => 0x0609_0030,
            AbortCode::ValueWrittenTooHigh => 0x0609_0031,
            AbortCode::ValueWrittenTooLow => 0x0609_0032,
            AbortCode::MaxValueLessThanMinValue => 0x0609_0036,
            AbortCode::ResourceNotAvailable => 0x060A_0023,
            AbortCode::GeneralError => 0x0800_0000,
            AbortCode::DataTransferOrStoreFailed => 0x0800_0020,
            AbortCode::DataTransferOrStoreFailedDueToLocalControl => 0x0800_0021,
            AbortCode::DataTransferOrStoreFailedDueToDeviceState => 0x0800_0022,
            AbortCode::ObjectDictionaryGenerationFailedOrNotPresent => 0x0800_0023,
        }
    }

    pub const fn description(&self) -> &'static str {
        match *self {
            AbortCode::ToggleBitNotAlternated => "Toggle bit not alternated",
            AbortCode::SdoProtocolTimedOut => "SDO protocol timed out",
            AbortCode::CommandSpecifierNotValidOrUnknown => "Client/server command specifier not valid or unknown",
            AbortCode::InvalidBlockSize => "Invalid block size (block mode only)",
            AbortCode::InvalidSequenceNumber => "Invalid sequence number (block mode only)",
            AbortCode::CrcError => "CRC error (block mode only)",
            AbortCode::OutOfMemory => "Out of memory",
            AbortCode::UnsupportedAccessToObject => "Unsupported access to an object",
            AbortCode::AttemptToReadWriteOnlyObject => "Attempt to read a write only object",
            AbortCode::AttemptToWriteReadOnlyObject => "Attempt to write a read only object",
            AbortCode::ObjectDoesNotExistInObjectDictionary => "Object does not exist in the object dictionary",
            AbortCode::ObjectCannotBeMappedToPdo => "Object cannot be mapped to the PDO",
            AbortCode::ExceedPdoSize => "The number and length of the objects to be mapped would exceed PDO length",
            AbortCode::GeneralParameterIncompatibility => "General parameter incompatibility reason",
            AbortCode::GeneralInternalIncompatibility => "General internal incompatibility in the device",
            AbortCode::HardwareError => "Access failed due to a hardware error",
            AbortCode::DataTypeMismatchLengthMismatch => "Data type does not match; length of service parameter does not match",
            AbortCode::DataTypeMismatchLengthTooHigh => "Data type does not match; length of service parameter too high",
            AbortCode::DataTypeMismatchLengthTooLow => "Data type does not match; length of service parameter too low",
            AbortCode::SubIndexDoesNotExist => "Sub-index does not exist",
            AbortCode::ValueRangeExceeded => "Value range of parameter exceeded (only for write access)",
            AbortCode::ValueWrittenTooHigh => "Value of parameter written too high",
            AbortCode::ValueWrittenTooLow => "Value of parameter written too low",
            AbortCode::MaxValueLessThanMinValue => "Maximum value is less than minimum value",
            AbortCode::ResourceNotAvailable => "Resource not available: SDO connection",
            AbortCode::GeneralError => "General error",
            AbortCode::DataTransferOrStoreFailed => "Data cannot be transferred or stored to the application",
            AbortCode::DataTransferOrStoreFailedDueToLocalControl => "Data cannot be transferred or stored to the application because of local control",
            AbortCode::DataTransferOrStoreFailedDueToDeviceState => "Data cannot be transferred or stored to the application because of the present device state",
            AbortCode::ObjectDictionaryGenerationFailedOrNotPresent => "Object dictionary dynamic generation fails or no object dictionary is present",
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0x0503_0000 => AbortCode::ToggleBitNotAlternated,
            0x0504_0000 => AbortCode::SdoProtocolTimedOut,
            0x0504_0001 => AbortCode::CommandSpecifierNotValidOrUnknown,
            0x0504_0002 => AbortCode::InvalidBlockSize,
            0x0504_0003 => AbortCode::InvalidSequenceNumber,
            0x0504_0004 => AbortCode::CrcError,
            0x0504_0005 => AbortCode::OutOfMemory,
            0x0601_0000 => AbortCode::UnsupportedAccessToObject,
            0x0601_0001 => AbortCode::AttemptToReadWriteOnlyObject,
            0x0601_0002 => AbortCode::AttemptToWriteReadOnlyObject,
            0x0602_0000 => AbortCode::ObjectDoesNotExistInObjectDictionary,
            0x0604_0041 => AbortCode::ObjectCannotBeMappedToPdo,
            0x0604_0042 => AbortCode::ExceedPdoSize,
            0x0604_0043 => AbortCode::GeneralParameterIncompatibility,
            0x0604_0047 => AbortCode::GeneralInternalIncompatibility,
            0x0606_0000 => AbortCode::HardwareError,
            0x0607_0010 => AbortCode::DataTypeMismatchLengthMismatch,
            0x0607_0012 => AbortCode::DataTypeMismatchLengthTooHigh,
            0x0607_0013 => AbortCode::DataTypeMismatchLengthTooLow,
            0x0609_0011 => AbortCode::SubIndexDoesNotExist,
            0x0609_0030 => AbortCode::ValueRangeExceeded,
            0x0609_0031 => AbortCode::ValueWrittenTooHigh,
            0x0609_0032 => AbortCode::ValueWrittenTooLow,
            0x0609_0036 => AbortCode::MaxValueLessThanMinValue,
            0x060A_0023 => AbortCode::ResourceNotAvailable,
            0x0800_0000 => AbortCode::GeneralError,
            0x0800_0020 => AbortCode::DataTransferOrStoreFailed,
            0x0800_0021 => AbortCode::DataTransferOrStoreFailedDueToLocalControl,
            0x0800_0022 => AbortCode::DataTransferOrStoreFailedDueToDeviceState,
            0x0800_0023 => AbortCode::ObjectDictionaryGenerationFailedOrNotPresent,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_debug_formatting() {
        assert_eq!(format!("{:?}", ErrorCode::ObjNotFound), "object not found");
        assert_eq!(format!("{:?}", ErrorCode::InvalidStandardId { cob_id: 0x123 }), "invalid standard CAN id: 0x123");
        assert_eq!(
            format!("{:?}", ErrorCode::SdoAbort(AbortCode::GeneralError)),
            "SDO abort: General error (0x08000000)"
        );
    }

    #[test]
    fn abort_code_round_trips_through_wire_value() {
        for code in [
            AbortCode::ToggleBitNotAlternated,
            AbortCode::SdoProtocolTimedOut,
            AbortCode::ObjectDoesNotExistInObjectDictionary,
            AbortCode::ObjectCannotBeMappedToPdo,
            AbortCode::DataTypeMismatchLengthTooLow,
            AbortCode::SubIndexDoesNotExist,
            AbortCode::ResourceNotAvailable,
            AbortCode::GeneralError,
        ] {
            assert_eq!(AbortCode::from_code(code.code()), Some(code));
        }
    }

    #[test]
    fn unknown_wire_value_has_no_abort_code() {
        assert_eq!(AbortCode::from_code(0xFFFF_FFFF), None);
    }

    #[test]
    fn known_wire_values_match_cia301_annex() {
        assert_eq!(AbortCode::ToggleBitNotAlternated.code(), 0x0503_0000);
        assert_eq!(AbortCode::SdoProtocolTimedOut.code(), 0x0504_0000);
        assert_eq!(AbortCode::ObjectDoesNotExistInObjectDictionary.code(), 0x0602_0000);
        assert_eq!(AbortCode::ObjectCannotBeMappedToPdo.code(), 0x0604_0041);
        assert_eq!(AbortCode::GeneralError.code(), 0x0800_0000);
    }
}
