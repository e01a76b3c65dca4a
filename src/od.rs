//! Object Dictionary: the fixed, sorted table of entries a node exposes to
//! SDO and PDO, addressed by `(index, sub_index)`.
//!
//! The teacher's `object_directory.rs` loaded a `HashMap<u16, ObjectType>`
//! from an EDS file at runtime. Entries here are instead declared at
//! compile time as a `'static` array sorted ascending by `(index,
//! sub_index)` and searched with `binary_search_by_key`, so a node never
//! allocates to describe its own dictionary. A `TypeKind` tag dispatches
//! type-specific behavior (range checks, node-ID relocation, PDO gating)
//! instead of a `dyn Trait` object, so every entry stays a plain value that
//! fits in the array.

use core::cell::{Cell, RefCell};
use core::ops::Range;

use bitfield_struct::bitfield;

use crate::config::{OD_DOMAIN_MAX, OD_PARAM_GROUP_MAX, OD_STRING_MAX};
use crate::error::{AbortCode, ErrorCode};

/// Packed `(index, sub_index, flags)` identity of an entry.
#[bitfield(u32)]
pub struct Key {
    #[bits(16)]
    pub index: u16,
    #[bits(8)]
    pub sub_index: u8,
    #[bits(8)]
    pub flags: u8,
}

pub const FLAG_READ_ONLY: u8 = 1 << 0;
pub const FLAG_WRITE_ONLY: u8 = 1 << 1;
pub const FLAG_NODE_ID_RELATIVE: u8 = 1 << 2;
pub const FLAG_PDO_MAPPABLE: u8 = 1 << 3;
pub const FLAG_ASYNC_NOTIFY: u8 = 1 << 4;
pub const FLAG_CONST: u8 = 1 << 5;

impl Key {
    pub const fn new_at(index: u16, sub_index: u8, flags: u8) -> Self {
        Key::new().with_index(index).with_sub_index(sub_index).with_flags(flags)
    }

    fn ord_key(&self) -> (u16, u8) {
        (self.index(), self.sub_index())
    }
}

/// The data-type tag of an entry, dispatching its read/write behavior.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TypeKind {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    Real32,
    Real64,
    VisibleString,
    OctetString,
    Domain,
    /// Sub-index 1 of a PDO communication record: a COB-ID with a valid bit
    /// in bit 31 (CiA 301 §7.3.5/7.3.6).
    PdoCobId,
    /// Sub-index 2 of a PDO communication record.
    PdoTransmissionType,
    /// Sub-index 0 of a PDO mapping record: number of mapped entries.
    PdoMappingCount,
    /// Sub-indices 1..8 of a PDO mapping record: `(index, sub_index, bit
    /// length)` packed into a u32.
    PdoMappingEntry,
    /// Sub-index 1 or 2 of object 1200h: this node's own SDO server RX/TX
    /// COB-ID, carrying the same valid bit in bit 31 as `PdoCobId` (CiA 301
    /// §7.2.2, modeled on `COTSdoId` in the original implementation).
    SdoCobId,
    /// Sub-indices 1..N of object 1016h: one consumer heartbeat-time entry,
    /// `(node_id << 16) | timeout_ms` (CiA 301 §7.2.8.3).
    HeartbeatConsumer,
    /// A block persisted through [`crate::hal::Nvm`].
    ParamGroup { group: u8 },
}

impl TypeKind {
    /// Byte length of the scalar/COB-ID/mapping representation; `None` for
    /// the streamed kinds (`VisibleString`/`OctetString`/`Domain`/`ParamGroup`).
    pub fn fixed_len(&self) -> Option<usize> {
        match self {
            TypeKind::Bool | TypeKind::I8 | TypeKind::U8 => Some(1),
            TypeKind::I16 | TypeKind::U16 => Some(2),
            TypeKind::I32 | TypeKind::U32 | TypeKind::Real32 => Some(4),
            TypeKind::PdoCobId | TypeKind::PdoTransmissionType | TypeKind::PdoMappingCount => Some(4),
            TypeKind::PdoMappingEntry => Some(4),
            TypeKind::SdoCobId | TypeKind::HeartbeatConsumer => Some(4),
            TypeKind::I64 | TypeKind::U64 | TypeKind::Real64 => Some(8),
            TypeKind::VisibleString | TypeKind::OctetString | TypeKind::Domain | TypeKind::ParamGroup { .. } => None,
        }
    }
}

/// Backing storage for an entry. Scalars use a `Cell<u64>` so reads/writes
/// never need a borrow to fail; streamed kinds use `RefCell` because SDO
/// segmented/block transfer needs a mutable cursor into them across calls.
pub enum Storage {
    Scalar(Cell<u64>),
    Str(RefCell<Slot<OD_STRING_MAX>>),
    Domain(RefCell<Slot<OD_DOMAIN_MAX>>),
    Param(RefCell<Slot<OD_PARAM_GROUP_MAX>>),
}

/// A fixed byte buffer plus the length actually in use.
pub struct Slot<const N: usize> {
    pub data: [u8; N],
    pub len: usize,
}

impl<const N: usize> Slot<N> {
    pub const fn empty() -> Self {
        Slot { data: [0u8; N], len: 0 }
    }

    pub const fn from_bytes(bytes: &[u8]) -> Self {
        let mut data = [0u8; N];
        let mut i = 0;
        while i < bytes.len() && i < N {
            data[i] = bytes[i];
            i += 1;
        }
        Slot { data, len: if bytes.len() < N { bytes.len() } else { N } }
    }
}

/// One addressable object/sub-object.
pub struct Entry {
    pub key: Key,
    pub kind: TypeKind,
    pub storage: Storage,
    /// Inclusive valid range for integer scalars; `None` disables the check.
    pub range: Option<Range<i64>>,
}

impl Entry {
    pub const fn scalar(index: u16, sub_index: u8, flags: u8, kind: TypeKind, default: u64) -> Self {
        Entry { key: Key::new_at(index, sub_index, flags), kind, storage: Storage::Scalar(Cell::new(default)), range: None }
    }

    pub const fn scalar_ranged(index: u16, sub_index: u8, flags: u8, kind: TypeKind, default: u64, range: Range<i64>) -> Self {
        Entry { key: Key::new_at(index, sub_index, flags), kind, storage: Storage::Scalar(Cell::new(default)), range: Some(range) }
    }

    pub const fn string(index: u16, sub_index: u8, flags: u8, default: &str) -> Self {
        Entry {
            key: Key::new_at(index, sub_index, flags),
            kind: TypeKind::VisibleString,
            storage: Storage::Str(RefCell::new(Slot::from_bytes(default.as_bytes()))),
            range: None,
        }
    }

    pub const fn domain(index: u16, sub_index: u8, flags: u8) -> Self {
        Entry { key: Key::new_at(index, sub_index, flags), kind: TypeKind::Domain, storage: Storage::Domain(RefCell::new(Slot::empty())), range: None }
    }

    pub const fn param_group(index: u16, sub_index: u8, group: u8) -> Self {
        Entry {
            key: Key::new_at(index, sub_index, FLAG_READ_ONLY | FLAG_ASYNC_NOTIFY),
            kind: TypeKind::ParamGroup { group },
            storage: Storage::Param(RefCell::new(Slot::empty())),
            range: None,
        }
    }

    fn is_readable(&self) -> bool {
        self.key.flags() & FLAG_WRITE_ONLY == 0
    }

    fn is_writable(&self) -> bool {
        self.key.flags() & FLAG_READ_ONLY == 0 && self.key.flags() & FLAG_CONST == 0
    }

    pub fn is_pdo_mappable(&self) -> bool {
        self.key.flags() & FLAG_PDO_MAPPABLE != 0
    }

    pub fn notifies_async(&self) -> bool {
        self.key.flags() & FLAG_ASYNC_NOTIFY != 0
    }
}

/// Outcome of a successful write: whether the value actually changed, and
/// whether the caller (the node) must act on it (PDO retrigger, COB-ID
/// gating, etc).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct WriteEffect {
    pub changed: bool,
    pub mappable: bool,
    pub async_notify: bool,
    pub index: u16,
    pub sub_index: u8,
}

/// A sorted, fixed-capacity table of entries. `node_id` offsets any entry
/// flagged `FLAG_NODE_ID_RELATIVE` on read/write, matching CiA 301's
/// `$NODEID`-relative default COB-IDs.
pub struct ObjectDictionary<'a> {
    entries: &'a [Entry],
    node_id: u8,
}

impl<'a> ObjectDictionary<'a> {
    /// `entries` must already be sorted ascending by `(index, sub_index)`;
    /// this is a precondition checked only in debug builds via
    /// `entries_are_sorted`, never at runtime on embedded targets.
    pub const fn new(entries: &'a [Entry], node_id: u8) -> Self {
        ObjectDictionary { entries, node_id }
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    /// The full entry table, for callers that need to enumerate entries by
    /// kind (e.g. `node.rs` walking `TypeKind::ParamGroup` entries for NVM
    /// persistence) rather than addressing one at a time.
    pub fn entries(&self) -> &'a [Entry] {
        self.entries
    }

    fn position(&self, index: u16, sub_index: u8) -> Option<usize> {
        self.entries.binary_search_by_key(&(index, sub_index), |e| e.key.ord_key()).ok()
    }

    pub fn find(&self, index: u16, sub_index: u8) -> Result<&Entry, ErrorCode> {
        self.position(index, sub_index)
            .map(|i| &self.entries[i])
            .ok_or(ErrorCode::SdoAbort(AbortCode::ObjectDoesNotExistInObjectDictionary))
    }

    /// Reads a scalar entry as a raw `u64`, applying the node-ID offset.
    /// `AbortCode::AttemptToReadWriteOnlyObject` when the entry exists but is
    /// write-only, `AbortCode::UnsupportedAccessToObject` for non-scalar
    /// kinds (use `read_buffer` instead).
    pub fn read_value(&self, index: u16, sub_index: u8) -> Result<u64, ErrorCode> {
        let entry = self.find(index, sub_index)?;
        if !entry.is_readable() {
            return Err(ErrorCode::SdoAbort(AbortCode::AttemptToReadWriteOnlyObject));
        }
        match &entry.storage {
            Storage::Scalar(cell) => {
                let mut v = cell.get();
                if entry.key.flags() & FLAG_NODE_ID_RELATIVE != 0 {
                    v = v.wrapping_add(self.node_id as u64);
                }
                Ok(v)
            }
            _ => Err(ErrorCode::SdoAbort(AbortCode::UnsupportedAccessToObject)),
        }
    }

    /// Writes a scalar entry from a raw `u64`, range-checking integer
    /// entries that declare a `range`. PDO COB-ID/transmission-type gating
    /// is the caller's (`node`'s) responsibility once it sees
    /// `WriteEffect`; the object dictionary itself only validates and
    /// stores.
    pub fn write_value(&self, index: u16, sub_index: u8, value: u64) -> Result<WriteEffect, ErrorCode> {
        let entry = self.find(index, sub_index)?;
        if !entry.is_writable() {
            return Err(ErrorCode::SdoAbort(AbortCode::AttemptToWriteReadOnlyObject));
        }
        if let Some(range) = &entry.range {
            let signed = value as i64;
            if signed < range.start || signed >= range.end {
                return Err(ErrorCode::SdoAbort(AbortCode::ValueRangeExceeded));
            }
        }
        match &entry.storage {
            Storage::Scalar(cell) => {
                let stored = if entry.key.flags() & FLAG_NODE_ID_RELATIVE != 0 { value.wrapping_sub(self.node_id as u64) } else { value };
                let old = cell.get();
                cell.set(stored);
                Ok(WriteEffect {
                    changed: old != stored,
                    mappable: entry.is_pdo_mappable(),
                    async_notify: entry.notifies_async(),
                    index,
                    sub_index,
                })
            }
            _ => Err(ErrorCode::SdoAbort(AbortCode::UnsupportedAccessToObject)),
        }
    }

    /// Reads a streamed (string/domain/parameter-group) entry's current
    /// contents into `out`, returning the number of bytes copied.
    pub fn read_buffer(&self, index: u16, sub_index: u8, out: &mut [u8]) -> Result<usize, ErrorCode> {
        let entry = self.find(index, sub_index)?;
        if !entry.is_readable() {
            return Err(ErrorCode::SdoAbort(AbortCode::AttemptToReadWriteOnlyObject));
        }
        let slot_len_and_copy = |len: usize, data: &[u8]| {
            let n = len.min(out.len());
            out[..n].copy_from_slice(&data[..n]);
            n
        };
        match &entry.storage {
            Storage::Str(slot) => {
                let slot = slot.borrow();
                Ok(slot_len_and_copy(slot.len, &slot.data))
            }
            Storage::Domain(slot) => {
                let slot = slot.borrow();
                Ok(slot_len_and_copy(slot.len, &slot.data))
            }
            Storage::Param(slot) => {
                let slot = slot.borrow();
                Ok(slot_len_and_copy(slot.len, &slot.data))
            }
            Storage::Scalar(_) => Err(ErrorCode::SdoAbort(AbortCode::UnsupportedAccessToObject)),
        }
    }

    /// Writes a streamed entry's full contents from `data`, replacing
    /// whatever was there. `AbortCode::OutOfMemory` if `data` overruns the
    /// entry's fixed capacity.
    pub fn write_buffer(&self, index: u16, sub_index: u8, data: &[u8]) -> Result<WriteEffect, ErrorCode> {
        let entry = self.find(index, sub_index)?;
        if !entry.is_writable() {
            return Err(ErrorCode::SdoAbort(AbortCode::AttemptToWriteReadOnlyObject));
        }
        fn store<const N: usize>(slot: &RefCell<Slot<N>>, data: &[u8]) -> Result<bool, ErrorCode> {
            if data.len() > N {
                return Err(ErrorCode::SdoAbort(AbortCode::OutOfMemory));
            }
            let mut slot = slot.borrow_mut();
            let changed = slot.len != data.len() || slot.data[..data.len()] != *data;
            slot.data[..data.len()].copy_from_slice(data);
            slot.len = data.len();
            Ok(changed)
        }
        let changed = match &entry.storage {
            Storage::Str(slot) => store(slot, data)?,
            Storage::Domain(slot) => store(slot, data)?,
            Storage::Param(slot) => store(slot, data)?,
            Storage::Scalar(_) => return Err(ErrorCode::SdoAbort(AbortCode::UnsupportedAccessToObject)),
        };
        Ok(WriteEffect { changed, mappable: entry.is_pdo_mappable(), async_notify: entry.notifies_async(), index, sub_index })
    }

    /// Debug/test-only check that `entries` is sorted, since `find` relies
    /// on binary search.
    #[cfg(test)]
    pub fn entries_are_sorted(entries: &[Entry]) -> bool {
        entries.windows(2).all(|w| w[0].key.ord_key() <= w[1].key.ord_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constant::{IDX_ERROR_REGISTER, IDX_PRODUCER_HEARTBEAT_TIME};

    static ENTRIES: &[Entry] = &[
        Entry::scalar(IDX_ERROR_REGISTER, 0, FLAG_READ_ONLY, TypeKind::U8, 0),
        Entry::scalar(IDX_PRODUCER_HEARTBEAT_TIME, 0, 0, TypeKind::U16, 1000),
        Entry::scalar_ranged(0x6000, 1, FLAG_PDO_MAPPABLE, TypeKind::I32, 0, -1000..1000),
        Entry::string(0x1008, 0, FLAG_READ_ONLY, "canopen-rs"),
    ];

    #[test]
    fn entries_are_sorted_ascending() {
        assert!(ObjectDictionary::entries_are_sorted(ENTRIES));
    }

    #[test]
    fn read_write_round_trips_scalar() {
        let od = ObjectDictionary::new(ENTRIES, 5);
        assert_eq!(od.read_value(IDX_PRODUCER_HEARTBEAT_TIME, 0).unwrap(), 1000);
        let effect = od.write_value(IDX_PRODUCER_HEARTBEAT_TIME, 0, 500).unwrap();
        assert!(effect.changed);
        assert_eq!(od.read_value(IDX_PRODUCER_HEARTBEAT_TIME, 0).unwrap(), 500);
    }

    #[test]
    fn write_unchanged_value_reports_no_change() {
        let od = ObjectDictionary::new(ENTRIES, 5);
        let effect = od.write_value(IDX_PRODUCER_HEARTBEAT_TIME, 0, 1000).unwrap();
        assert!(!effect.changed);
    }

    #[test]
    fn read_only_entry_rejects_write() {
        let od = ObjectDictionary::new(ENTRIES, 5);
        let result = od.write_value(IDX_ERROR_REGISTER, 0, 1);
        assert!(matches!(result, Err(ErrorCode::SdoAbort(AbortCode::AttemptToWriteReadOnlyObject))));
    }

    #[test]
    fn missing_entry_aborts_object_does_not_exist() {
        let od = ObjectDictionary::new(ENTRIES, 5);
        let result = od.read_value(0x9999, 0);
        assert!(matches!(result, Err(ErrorCode::SdoAbort(AbortCode::ObjectDoesNotExistInObjectDictionary))));
    }

    #[test]
    fn out_of_range_write_is_rejected() {
        let od = ObjectDictionary::new(ENTRIES, 5);
        let result = od.write_value(0x6000, 1, 5000);
        assert!(matches!(result, Err(ErrorCode::SdoAbort(AbortCode::ValueRangeExceeded))));
    }

    #[test]
    fn string_entry_reads_back_default() {
        let od = ObjectDictionary::new(ENTRIES, 5);
        let mut buf = [0u8; 32];
        let n = od.read_buffer(0x1008, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"canopen-rs");
    }

    #[test]
    fn node_id_relative_entry_offsets_on_read() {
        static REL: &[Entry] = &[Entry::scalar(0x1400, 1, FLAG_NODE_ID_RELATIVE, TypeKind::U32, 0x200)];
        let od = ObjectDictionary::new(REL, 7);
        assert_eq!(od.read_value(0x1400, 1).unwrap(), 0x207);
    }

    #[test]
    fn node_id_relative_entry_round_trips_through_write_and_read() {
        static REL: &[Entry] = &[Entry::scalar(0x1400, 1, FLAG_NODE_ID_RELATIVE, TypeKind::U32, 0x200)];
        let od = ObjectDictionary::new(REL, 7);
        od.write_value(0x1400, 1, 0x300).unwrap();
        assert_eq!(od.read_value(0x1400, 1).unwrap(), 0x300, "write(x) must read back as x, not x + 2*node_id");
    }
}
