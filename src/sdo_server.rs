//! SDO server: confirmed, point-to-point upload/download of one object
//! dictionary entry per transfer, expedited, segmented or block (CiA 301
//! §7.2.4).
//!
//! The teacher's server lived as inherent methods on `Node<CAN>` mutating
//! `Vec<u8>` scratch fields directly on the node. This factors the protocol
//! state machine into its own `Server` type with a fixed `[u8;
//! OD_DOMAIN_MAX]` scratch buffer (so a node can run [`crate::config::CO_SDO_SRV_N`]
//! of them without allocation) and returns frames/errors to its caller
//! instead of calling `self.transmit` itself, keeping CAN I/O in `node.rs`.

use crate::cmd_header::{
    SdoBlockDownloadInitiateCmd, SdoBlockUploadCmd, SdoDownloadInitiateCmd, SdoDownloadSegmentCmd,
    SdoEndBlockDownloadCmd, SdoInitBlockUploadCmd,
};
use crate::config::{DEFAULT_BLOCK_SIZE, OD_DOMAIN_MAX};
use crate::error::AbortCode;
use crate::frame::{bytes_to_u32_le, crc16_canopen_with_lut, le_bytes_to_u64, u64_to_le_bytes};
use crate::od::ObjectDictionary;
use crate::warn;

/// Writes `bytes` to `(index, sub_index)`, dispatching to the object
/// dictionary's scalar or buffer path depending on the entry's declared
/// type — SDO itself only ever carries raw bytes on the wire.
fn write_entry(od: &ObjectDictionary, index: u16, sub_index: u8, bytes: &[u8]) -> Result<(), AbortCode> {
    let entry = od.find(index, sub_index).map_err(to_abort)?;
    if entry.kind.fixed_len().is_some() {
        od.write_value(index, sub_index, le_bytes_to_u64(bytes)).map_err(to_abort)?;
    } else {
        od.write_buffer(index, sub_index, bytes).map_err(to_abort)?;
    }
    Ok(())
}

/// Reads `(index, sub_index)` into `out`, the mirror of [`write_entry`].
fn read_entry(od: &ObjectDictionary, index: u16, sub_index: u8, out: &mut [u8; OD_DOMAIN_MAX]) -> Result<usize, AbortCode> {
    let entry = od.find(index, sub_index).map_err(to_abort)?;
    if let Some(len) = entry.kind.fixed_len() {
        let value = od.read_value(index, sub_index).map_err(to_abort)?;
        out[..len].copy_from_slice(&u64_to_le_bytes(value, len)[..len]);
        Ok(len)
    } else {
        od.read_buffer(index, sub_index, out).map_err(to_abort)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Phase {
    Idle,
    SegmentUpload,
    SegmentDownload,
    BlockDownload,
    EndBlockDownload,
    StartBlockUpload,
    ConfirmBlockUpload,
}

/// One SDO server's transfer state. `OD_DOMAIN_MAX` bounds the largest
/// single transfer this server can carry.
pub struct Server {
    phase: Phase,
    index: u16,
    sub_index: u8,
    buf: [u8; OD_DOMAIN_MAX],
    buf_len: usize,
    cursor: usize,
    expected_len: usize,
    toggle: u8,
    seq: u8,
    block_size: u8,
    crc_enabled: bool,
    /// `(index, sub_index)` the most recent `process()` call actually
    /// committed to the object dictionary, if any — a frame that only
    /// advances a segmented/block transfer without finishing it leaves this
    /// `None`. `node.rs` drains it with [`Server::take_committed_write`] to
    /// decide whether to fire a TPDO event.
    committed_write: Option<(u16, u8)>,
}

type SdoResult = Result<[u8; 8], AbortCode>;

impl Server {
    pub const fn new() -> Self {
        Server {
            phase: Phase::Idle,
            index: 0,
            sub_index: 0,
            buf: [0u8; OD_DOMAIN_MAX],
            buf_len: 0,
            cursor: 0,
            expected_len: 0,
            toggle: 0,
            seq: 0,
            block_size: DEFAULT_BLOCK_SIZE,
            crc_enabled: false,
            committed_write: None,
        }
    }

    /// Whether a transfer is in progress, so `node.rs` knows whether to keep
    /// a watchdog timer armed for this server.
    pub fn is_idle(&self) -> bool {
        matches!(self.phase, Phase::Idle)
    }

    /// Takes the `(index, sub_index)` committed by the most recent
    /// `process()` call, clearing it so it's only reported once.
    pub fn take_committed_write(&mut self) -> Option<(u16, u8)> {
        self.committed_write.take()
    }

    fn frame(&self, data: &[u8]) -> SdoResult {
        let mut out = [0u8; 8];
        let n = data.len().min(8);
        out[..n].copy_from_slice(&data[..n]);
        Ok(out)
    }

    fn sdo_frame(&self, cmd: u8, index: u16, sub_index: u8, data: &[u8]) -> SdoResult {
        let mut payload = [0u8; 8];
        payload[0] = cmd;
        payload[1..3].copy_from_slice(&index.to_le_bytes());
        payload[3] = sub_index;
        let n = data.len().min(4);
        payload[4..4 + n].copy_from_slice(&data[..n]);
        Ok(payload)
    }

    fn abort(&mut self) -> AbortCode {
        self.phase = Phase::Idle;
        self.buf_len = 0;
        self.cursor = 0;
        self.committed_write = None;
        warn!("SDO transfer for {:#06x}:{} aborted", self.index, self.sub_index);
        AbortCode::GeneralError
    }

    /// Builds the abort frame for `code`, addressed at whatever
    /// index/sub-index was in flight when the error occurred, and resets
    /// to idle.
    pub fn abort_frame(&mut self, index: u16, sub_index: u8, code: AbortCode) -> [u8; 8] {
        let (idx, sidx) = if matches!(self.phase, Phase::Idle) { (index, sub_index) } else { (self.index, self.sub_index) };
        self.phase = Phase::Idle;
        self.buf_len = 0;
        self.cursor = 0;
        self.committed_write = None;
        warn!("SDO abort {:#06x}:{} code {:?}", idx, sidx, code);
        self.sdo_frame(0x80, idx, sidx, &code.code().to_le_bytes()).unwrap()
    }

    /// Feeds one received SDO request frame payload to the state machine,
    /// delegating the actual object read/write to `od`.
    pub fn process(&mut self, od: &ObjectDictionary, data: &[u8]) -> SdoResult {
        let cmd = data[0];
        let ccs = cmd >> 5;
        let index = u16::from_le_bytes([data[1], data[2]]);
        let sub_index = data[3];

        match self.phase {
            Phase::SegmentDownload => self.download_segment(od, data),
            Phase::SegmentUpload => self.upload_segment(cmd),
            Phase::BlockDownload => self.block_download(od, data),
            Phase::EndBlockDownload => self.end_block_download(data),
            Phase::StartBlockUpload => self.start_block_upload(data),
            Phase::ConfirmBlockUpload => self.confirm_block_upload(data),
            Phase::Idle => match ccs {
                0x1 => self.initiate_download(od, index, sub_index, data),
                0x2 => self.initiate_upload(od, index, sub_index),
                0x6 => self.init_block_download(index, sub_index, data),
                0x5 => self.init_block_upload(od, index, sub_index, data),
                _ => Err(AbortCode::CommandSpecifierNotValidOrUnknown),
            },
        }
    }

    fn initiate_upload(&mut self, od: &ObjectDictionary, index: u16, sub_index: u8) -> SdoResult {
        let mut tmp = [0u8; OD_DOMAIN_MAX];
        let len = read_entry(od, index, sub_index, &mut tmp)?;

        if len <= 4 {
            let cmd = 0x43 | (((4 - len) as u8 & 0x3) << 2);
            return self.sdo_frame(cmd, index, sub_index, &tmp[..len]);
        }

        self.buf[..len].copy_from_slice(&tmp[..len]);
        self.buf_len = len;
        self.cursor = 0;
        self.toggle = 0;
        self.index = index;
        self.sub_index = sub_index;
        self.phase = Phase::SegmentUpload;
        self.sdo_frame(0x41, index, sub_index, &(len as u32).to_le_bytes())
    }

    fn upload_segment(&mut self, cmd: u8) -> SdoResult {
        if cmd >> 5 != 0x3 {
            return Err(self.abort());
        }
        let toggle = (cmd >> 4) & 0x1;
        if toggle != self.toggle {
            return Err(self.abort_with(AbortCode::ToggleBitNotAlternated));
        }
        self.toggle ^= 1;

        let remaining = self.buf_len - self.cursor;
        if remaining > 7 {
            let mut data = [0u8; 8];
            data[0] = toggle << 4;
            data[1..8].copy_from_slice(&self.buf[self.cursor..self.cursor + 7]);
            self.cursor += 7;
            self.frame(&data)
        } else {
            let n = 7 - remaining as u8;
            let mut data = [0u8; 8];
            data[0] = 0x01 | (toggle << 4) | (n << 1);
            data[1..1 + remaining].copy_from_slice(&self.buf[self.cursor..self.buf_len]);
            self.phase = Phase::Idle;
            self.buf_len = 0;
            self.cursor = 0;
            self.frame(&data)
        }
    }

    fn abort_with(&mut self, code: AbortCode) -> AbortCode {
        self.phase = Phase::Idle;
        self.buf_len = 0;
        self.cursor = 0;
        self.committed_write = None;
        warn!("SDO transfer for {:#06x}:{} aborted: {:?}", self.index, self.sub_index, code);
        code
    }

    fn initiate_download(&mut self, od: &ObjectDictionary, index: u16, sub_index: u8, req: &[u8]) -> SdoResult {
        let cmd = SdoDownloadInitiateCmd::from(req[0]);

        if cmd.e() && cmd.s() {
            let n = 4 - cmd.n() as usize;
            write_entry(od, index, sub_index, &req[4..4 + n])?;
            self.committed_write = Some((index, sub_index));
            return self.sdo_frame(0x60, index, sub_index, &[0, 0, 0, 0]);
        }

        self.index = index;
        self.sub_index = sub_index;
        self.buf_len = 0;
        self.cursor = 0;
        self.expected_len = if cmd.s() { bytes_to_u32_le(&req[4..]) as usize } else { 0 };
        self.phase = Phase::SegmentDownload;
        self.sdo_frame(0x60, index, sub_index, &[0, 0, 0, 0])
    }

    fn download_segment(&mut self, od: &ObjectDictionary, req: &[u8]) -> SdoResult {
        let req_cmd = SdoDownloadSegmentCmd::from(req[0]);
        if req_cmd.ccs() != 0x0 {
            return Err(self.abort());
        }
        let resp_cmd = 0x20 | (req_cmd.t() << 4);

        if !req_cmd.c() {
            self.append(&req[1..8])?;
            self.frame(&[resp_cmd])
        } else {
            let n = 7 - req_cmd.n() as usize;
            self.append(&req[1..1 + n])?;
            if self.expected_len > 0 && self.expected_len != self.buf_len {
                return Err(self.abort_with(AbortCode::DataTypeMismatchLengthMismatch));
            }
            let (index, sub_index) = (self.index, self.sub_index);
            write_entry(od, index, sub_index, &self.buf[..self.buf_len])?;
            self.committed_write = Some((index, sub_index));
            self.phase = Phase::Idle;
            self.buf_len = 0;
            self.cursor = 0;
            self.frame(&[resp_cmd])
        }
    }

    fn append(&mut self, data: &[u8]) -> Result<(), AbortCode> {
        if self.buf_len + data.len() > OD_DOMAIN_MAX {
            return Err(self.abort_with(AbortCode::OutOfMemory));
        }
        self.buf[self.buf_len..self.buf_len + data.len()].copy_from_slice(data);
        self.buf_len += data.len();
        Ok(())
    }

    fn init_block_download(&mut self, index: u16, sub_index: u8, req: &[u8]) -> SdoResult {
        let cmd = SdoBlockDownloadInitiateCmd::from(req[0]);
        self.crc_enabled = cmd.cc();
        self.expected_len = if cmd.s() { bytes_to_u32_le(&req[4..8]) as usize } else { 0 };
        self.buf_len = 0;
        self.cursor = 0;
        self.seq = 0;
        self.index = index;
        self.sub_index = sub_index;
        self.phase = Phase::BlockDownload;
        let resp_cmd = 0xA0 | ((self.crc_enabled as u8) << 2);
        self.sdo_frame(resp_cmd, index, sub_index, &[self.block_size, 0, 0])
    }

    fn block_download(&mut self, od: &ObjectDictionary, req: &[u8]) -> SdoResult {
        let seqno = req[0] & 0x7F;
        self.seq += 1;
        if seqno != self.seq {
            return Err(self.abort());
        }
        self.append(&req[1..8])?;

        if req[0] >> 7 == 1 {
            if self.buf_len >= self.expected_len && self.expected_len > 0 {
                self.buf_len = self.expected_len;
            }
            let (i, si) = (self.index, self.sub_index);
            write_entry(od, i, si, &self.buf[..self.buf_len])?;
            self.committed_write = Some((i, si));
            self.phase = Phase::EndBlockDownload;
            let mut out = [0u8; 8];
            out[0] = 0xA2;
            out[1] = self.seq;
            out[2] = self.block_size;
            Ok(out)
        } else {
            self.frame(&[])
        }
    }

    fn end_block_download(&mut self, req: &[u8]) -> SdoResult {
        let cmd = SdoEndBlockDownloadCmd::from(req[0]);
        let remainder = if self.expected_len == 0 { 0 } else { self.expected_len % 7 };
        let expected_n = if remainder == 0 { 0 } else { 7 - remainder } as u8;
        if cmd.n() != expected_n {
            return Err(self.abort());
        }
        if self.crc_enabled {
            let _crc = u16::from_le_bytes([req[1], req[2]]);
            let computed = crc16_canopen_with_lut(&self.buf[..self.buf_len]);
            if _crc != computed {
                return Err(self.abort_with(AbortCode::CrcError));
            }
        }
        self.phase = Phase::Idle;
        self.buf_len = 0;
        self.cursor = 0;
        self.frame(&[0xA1])
    }

    fn init_block_upload(&mut self, od: &ObjectDictionary, index: u16, sub_index: u8, req: &[u8]) -> SdoResult {
        let cmd = SdoInitBlockUploadCmd::from(req[0]);
        let blk_size = req[4];
        if cmd.ccs() != 0x5 || cmd.cs() != 0 {
            return Err(AbortCode::CommandSpecifierNotValidOrUnknown);
        }
        if blk_size >= 0x80 {
            return Err(AbortCode::InvalidBlockSize);
        }
        self.crc_enabled = cmd.cc();
        self.block_size = blk_size;
        self.index = index;
        self.sub_index = sub_index;

        let mut tmp = [0u8; OD_DOMAIN_MAX];
        let len = read_entry(od, index, sub_index, &mut tmp)?;
        self.buf[..len].copy_from_slice(&tmp[..len]);
        self.buf_len = len;
        self.cursor = 0;
        self.phase = Phase::StartBlockUpload;

        let resp_cmd = 0xC2 | ((self.crc_enabled as u8) << 2);
        self.sdo_frame(resp_cmd, index, sub_index, &(len as u32).to_le_bytes())
    }

    /// Returns `(reply, more)` where `more` is the sequence of continuation
    /// frames beyond the first still to be sent; block upload spans more
    /// than one CAN frame per server response, unlike every other phase, so
    /// the caller (`node.rs`) drains `more` in a loop.
    fn start_block_upload(&mut self, req: &[u8]) -> SdoResult {
        let cmd = SdoBlockUploadCmd::from(req[0]);
        if cmd.ccs() != 0x5 || cmd.cs() != 0x3 {
            return Err(self.abort());
        }
        let total_seqs = ((self.buf_len.max(1) - 1) / 7 + 1) as u8;
        self.seq = total_seqs;
        let s = ((total_seqs - 1) as usize) * 7;
        let remaining = self.buf_len - s;
        let mut out = [0u8; 8];
        out[0] = total_seqs | 0x80;
        out[1..1 + remaining].copy_from_slice(&self.buf[s..self.buf_len]);
        self.phase = Phase::ConfirmBlockUpload;
        Ok(out)
    }

    /// Segment frames before the final one of a block upload, built eagerly
    /// so `node.rs` can transmit them back-to-back ahead of the reply from
    /// `start_block_upload`. `out` must hold at least `block_size` entries;
    /// `node.rs` sizes its scratch array from the same value it offered in
    /// `init_block_upload`.
    pub fn block_upload_lead_frames(&self, out: &mut [[u8; 8]]) -> usize {
        let total_seqs = ((self.buf_len.max(1) - 1) / 7 + 1) as usize;
        let lead = total_seqs.saturating_sub(1).min(out.len());
        for i in 0..lead {
            let (s, e) = (i * 7, (i * 7 + 7).min(self.buf_len));
            out[i][0] = (i + 1) as u8;
            out[i][1..1 + (e - s)].copy_from_slice(&self.buf[s..e]);
        }
        lead
    }

    fn confirm_block_upload(&mut self, req: &[u8]) -> SdoResult {
        let cmd = SdoBlockUploadCmd::from(req[0]);
        if cmd.ccs() != 0x5 || cmd.cs() != 2 {
            return Err(self.abort());
        }
        let (ackseq, blksize) = (req[1], req[2]);
        let total_seqs = ((self.buf_len.max(1) - 1) / 7 + 1) as u8;
        if ackseq != total_seqs {
            return Err(self.abort_with(AbortCode::CommandSpecifierNotValidOrUnknown));
        }
        self.block_size = blksize;
        let n = (7 - self.buf_len % 7) as u8 % 7;
        let resp_cmd = 0xC1 | (n << 2);
        let crc = if self.crc_enabled { crc16_canopen_with_lut(&self.buf[..self.buf_len]) } else { 0 };
        self.phase = Phase::Idle;
        self.buf_len = 0;
        self.cursor = 0;
        let mut out = [0u8; 8];
        out[0] = resp_cmd;
        out[1..3].copy_from_slice(&crc.to_le_bytes());
        Ok(out)
    }
}

fn to_abort(err: crate::error::ErrorCode) -> AbortCode {
    match err {
        crate::error::ErrorCode::SdoAbort(code) => code,
        _ => AbortCode::GeneralError,
    }
}
