//! Compile-time capacity configuration.
//!
//! Everything else about a node's behavior comes from the Object Dictionary
//! itself; these are the fixed array sizes a no-heap build must commit to
//! ahead of time, in the spirit of the teacher's small hard-coded counts
//! (`PdoObjects` carrying exactly 8 slots, `DEFAULT_BLOCK_SIZE`, etc.) but
//! pulled out into one place so an application can retune them.

/// Number of concurrently configured SDO servers.
pub const CO_SDO_SRV_N: usize = 1;
/// Number of concurrently configured SDO clients.
pub const CO_SDO_CLI_N: usize = 1;
/// Number of RPDOs.
pub const CO_RPDO_N: usize = 4;
/// Number of TPDOs.
pub const CO_TPDO_N: usize = 4;
/// Number of mapping entries per PDO (CiA 301 caps this at 8 sub-indices 1..8).
pub const CO_PDO_MAX_MAPPED_ENTRIES: usize = 8;
/// Number of EMCY history slots (mirrors 0x1003 sub-index range).
pub const CO_EMCY_HISTORY_N: usize = 8;
/// Number of heartbeat consumers tracked (0x1016).
pub const CO_HB_CONSUMER_N: usize = 4;
/// Timer wheel node pool size.
pub const CO_TMR_N: usize = 16;

/// Largest string entry the OD can hold (VisibleString/OctetString/UnicodeString).
pub const OD_STRING_MAX: usize = 64;
/// Largest domain/segmented-or-block transfer entry the OD can hold.
pub const OD_DOMAIN_MAX: usize = 256;
/// Largest parameter-group NVM block.
pub const OD_PARAM_GROUP_MAX: usize = 256;

/// Default SDO watchdog timeout, in milliseconds.
pub const SDO_WATCHDOG_MS: u32 = 100;
/// Default block-transfer block size (segments per block ack).
pub const DEFAULT_BLOCK_SIZE: u8 = 0x7F;
