//! CiA 301 function codes, well-known indices and CAN-ID masks.

use core::ops::Range;

/// CANopen function code prefixes on COB-ID.
pub const COB_FUNC_NMT: u16 = 0x000;
pub const COB_FUNC_SYNC: u16 = 0x080;
pub const COB_FUNC_EMCY: u16 = 0x080;
pub const COB_FUNC_TIME_STAMP: u16 = 0x100;
pub const COB_FUNC_RPDO_1: u16 = 0x200;
pub const COB_FUNC_RPDO_2: u16 = 0x300;
pub const COB_FUNC_RPDO_3: u16 = 0x400;
pub const COB_FUNC_RPDO_4: u16 = 0x500;
pub const COB_FUNC_TRANSMIT_SDO: u16 = 0x580;
pub const COB_FUNC_RECEIVE_SDO: u16 = 0x600;
pub const COB_FUNC_HEARTBEAT: u16 = 0x700;
pub const COB_FUNC_MASK: u16 = 0xFF80;

/// PDO COB-ID bit layout (CiA 301 §7.3.5/7.3.6).
pub const PDO_COB_ID_VALID_BIT: u32 = 1 << 31;
pub const PDO_COB_ID_RTR_BIT: u32 = 1 << 30;
pub const PDO_COB_ID_EXTENDED_BIT: u32 = 1 << 29;
pub const PDO_COB_ID_MASK: u32 = 0x1FFF_FFFF;

/// Well-known object dictionary indices.
pub const IDX_ERROR_REGISTER: u16 = 0x1001;
pub const IDX_PRE_DEFINED_ERROR_FIELD: u16 = 0x1003;
pub const IDX_STORE_PARAMETERS: u16 = 0x1010;
pub const IDX_RESTORE_DEFAULT_PARAMETERS: u16 = 0x1011;
pub const IDX_PRODUCER_HEARTBEAT_TIME: u16 = 0x1017;
pub const IDX_CONSUMER_HEARTBEAT_TIME: u16 = 0x1016;

pub const COMMUNICATION_REGISTERS_RANGE: Range<u16> = 0x1000..0x2000;
pub const APPLICATION_REGISTERS_RANGE: Range<u16> = 0x6000..0xA000;

pub const RPDO_COMM_RANGE: Range<u16> = 0x1400..0x1600;
pub const RPDO_MAP_RANGE: Range<u16> = 0x1600..0x1800;
pub const TPDO_COMM_RANGE: Range<u16> = 0x1800..0x1A00;
pub const TPDO_MAP_RANGE: Range<u16> = 0x1A00..0x1C00;

/// SDO server parameter records (CiA 301 object 1200h + N): sub-index 1 is
/// the RX (client-to-server) COB-ID, sub-index 2 the TX (server-to-client)
/// one. Only the first (`CO_SDO_SRV_N` == 1 today) is wired up.
pub const SDO_SERVER_COMM_RANGE: Range<u16> = 0x1200..0x1280;

/// Emergency error codes (CiA 301 §7.2.7, manufacturer/profile range used
/// for this stack's own conditions).
pub const EMCY_NO_ERROR: u16 = 0x0000;
pub const EMCY_PDO_NOT_PROCESSED: u16 = 0x8210;
pub const EMCY_HEARTBEAT_CONSUMER_TIMEOUT: u16 = 0x8130;

/// Signature word distinguishing a saved parameter block from its defaults.
pub const RESET_MAGIC_CODE: u32 = 0x64_61_6F_6C; // "load" little endian.

/// "save"/"load" command signatures accepted at 0x1010/0x1011 sub-index 1.
pub const SAVE_COMMAND_SIGNATURE: u32 = 0x65_76_61_73; // "save"
pub const LOAD_COMMAND_SIGNATURE: u32 = 0x64_61_6F_6C; // "load"
