//! SDO client: the initiator side of a confirmed transfer, addressing a
//! remote server's `(index, sub_index)` from `node.rs`'s main loop.
//!
//! The teacher's `SDOClient` only implemented expedited upload, hard-coded
//! `Vec`-backed, blocking directly on the network with no timeout and no
//! download support — marked "not done yet, please don't use" in its own
//! header. This is a real confirmed-transfer initiator: expedited/segmented
//! upload and download driven the same way `sdo_server::Server` is, through
//! `request`/`on_frame` rather than blocking I/O. Unlike the server side,
//! a client-initiated transfer has no watchdog: the application that called
//! `Node::sdo_read`/`sdo_write` is expected to apply its own timeout and
//! decide whether to retry.

use crate::config::OD_DOMAIN_MAX;
use crate::constant::{COB_FUNC_RECEIVE_SDO, COB_FUNC_TRANSMIT_SDO};
use crate::error::{AbortCode, ErrorCode};
use crate::frame::{bytes_to_u32_le, u64_to_le_bytes};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Phase {
    Idle,
    AwaitUploadInitiate,
    AwaitUploadSegment,
    AwaitDownloadInitiate,
    AwaitDownloadSegment,
}

/// What the caller asked the client to do; carried across frames until the
/// transfer completes or aborts.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Kind {
    Upload,
    Download,
}

/// Outcome of feeding a response frame to the client.
#[derive(Debug)]
pub enum Progress {
    /// The transfer needs another request sent; `request` is its payload.
    Continue { request: [u8; 8] },
    /// Upload completed; `data`/`len` hold the transferred bytes.
    UploadDone { data: [u8; OD_DOMAIN_MAX], len: usize },
    /// Download completed.
    DownloadDone,
}

/// One SDO client's transfer state, addressing server `server_node_id`.
pub struct Client {
    phase: Phase,
    kind: Kind,
    server_node_id: u16,
    index: u16,
    sub_index: u8,
    buf: [u8; OD_DOMAIN_MAX],
    buf_len: usize,
    cursor: usize,
    toggle: u8,
}

impl Client {
    pub const fn new() -> Self {
        Client {
            phase: Phase::Idle,
            kind: Kind::Upload,
            server_node_id: 0,
            index: 0,
            sub_index: 0,
            buf: [0u8; OD_DOMAIN_MAX],
            buf_len: 0,
            cursor: 0,
            toggle: 0,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.phase, Phase::Idle)
    }

    /// COB-ID this client's requests go out on, and the COB-ID its
    /// responses are expected to arrive on (CiA 301 §7.2.4.1: client COB-IDs
    /// are the server's node ID plus the client/server channel offsets).
    pub fn request_cob_id(&self) -> u16 {
        COB_FUNC_RECEIVE_SDO + self.server_node_id
    }

    pub fn response_cob_id(&self) -> u16 {
        COB_FUNC_TRANSMIT_SDO + self.server_node_id
    }

    /// Starts an upload (read) of `(index, sub_index)` from `server_node_id`,
    /// returning the initiate-upload request frame to transmit.
    pub fn start_upload(&mut self, server_node_id: u8, index: u16, sub_index: u8) -> Result<[u8; 8], ErrorCode> {
        if !self.is_idle() {
            return Err(ErrorCode::BadArg);
        }
        self.kind = Kind::Upload;
        self.server_node_id = server_node_id as u16;
        self.index = index;
        self.sub_index = sub_index;
        self.buf_len = 0;
        self.cursor = 0;
        self.phase = Phase::AwaitUploadInitiate;
        Ok(self.request_frame(0x40))
    }

    /// Starts a download (write) of `data` to `(index, sub_index)` on
    /// `server_node_id`. Expedited if `data` fits in 4 bytes, otherwise
    /// segmented.
    pub fn start_download(&mut self, server_node_id: u8, index: u16, sub_index: u8, data: &[u8]) -> Result<[u8; 8], ErrorCode> {
        if !self.is_idle() {
            return Err(ErrorCode::BadArg);
        }
        if data.len() > OD_DOMAIN_MAX {
            return Err(ErrorCode::BadArg);
        }
        self.kind = Kind::Download;
        self.server_node_id = server_node_id as u16;
        self.index = index;
        self.sub_index = sub_index;
        self.buf[..data.len()].copy_from_slice(data);
        self.buf_len = data.len();
        self.cursor = 0;
        self.toggle = 0;

        let mut req = [0u8; 8];
        if data.len() <= 4 {
            let n = 4 - data.len();
            req[0] = 0x23 | ((n as u8 & 0x3) << 2);
            req[1..3].copy_from_slice(&index.to_le_bytes());
            req[3] = sub_index;
            req[4..4 + data.len()].copy_from_slice(data);
            self.phase = Phase::AwaitDownloadInitiate;
            self.buf_len = 0;
        } else {
            req[0] = 0x21;
            req[1..3].copy_from_slice(&index.to_le_bytes());
            req[3] = sub_index;
            req[4..8].copy_from_slice(&(data.len() as u32).to_le_bytes());
            self.phase = Phase::AwaitDownloadInitiate;
        }
        Ok(req)
    }

    fn request_frame(&self, cmd: u8) -> [u8; 8] {
        let mut req = [0u8; 8];
        req[0] = cmd;
        req[1..3].copy_from_slice(&self.index.to_le_bytes());
        req[3] = self.sub_index;
        req
    }

    /// Feeds a received response frame payload (already matched to this
    /// client's `response_cob_id`/in-flight `(index, sub_index)` by the
    /// caller) into the state machine.
    pub fn on_frame(&mut self, data: &[u8]) -> Result<Progress, AbortCode> {
        if data[0] == 0x80 {
            self.phase = Phase::Idle;
            let code = bytes_to_u32_le(&data[4..8]);
            return Err(AbortCode::from_code(code).unwrap_or(AbortCode::GeneralError));
        }

        match self.phase {
            Phase::AwaitUploadInitiate => self.on_upload_initiate(data),
            Phase::AwaitUploadSegment => self.on_upload_segment(data),
            Phase::AwaitDownloadInitiate => self.on_download_initiate(data),
            Phase::AwaitDownloadSegment => self.on_download_segment(data),
            Phase::Idle => Err(AbortCode::CommandSpecifierNotValidOrUnknown),
        }
    }

    fn on_upload_initiate(&mut self, data: &[u8]) -> Result<Progress, AbortCode> {
        let cmd = data[0];
        if cmd & 0x02 != 0 {
            let n = 4 - ((cmd >> 2) & 0x3) as usize;
            let mut out = [0u8; OD_DOMAIN_MAX];
            out[..n].copy_from_slice(&data[4..4 + n]);
            self.phase = Phase::Idle;
            return Ok(Progress::UploadDone { data: out, len: n });
        }
        self.buf_len = bytes_to_u32_le(&data[4..8]) as usize;
        self.cursor = 0;
        self.toggle = 0;
        self.phase = Phase::AwaitUploadSegment;
        Ok(Progress::Continue { request: [0x60, 0, 0, 0, 0, 0, 0, 0] })
    }

    fn on_upload_segment(&mut self, data: &[u8]) -> Result<Progress, AbortCode> {
        let cmd = data[0];
        let t = (cmd >> 4) & 0x1;
        if t != self.toggle {
            self.phase = Phase::Idle;
            return Err(AbortCode::ToggleBitNotAlternated);
        }
        self.toggle ^= 1;
        let last = cmd & 0x1 != 0;
        let n = if last { 7 - ((cmd >> 1) & 0x7) as usize } else { 7 };
        if self.cursor + n > OD_DOMAIN_MAX {
            self.phase = Phase::Idle;
            return Err(AbortCode::OutOfMemory);
        }
        self.buf[self.cursor..self.cursor + n].copy_from_slice(&data[1..1 + n]);
        self.cursor += n;

        if last {
            self.phase = Phase::Idle;
            Ok(Progress::UploadDone { data: self.buf, len: self.cursor })
        } else {
            let req_cmd = 0x60 | (self.toggle << 4);
            Ok(Progress::Continue { request: [req_cmd, 0, 0, 0, 0, 0, 0, 0] })
        }
    }

    fn on_download_initiate(&mut self, _data: &[u8]) -> Result<Progress, AbortCode> {
        if self.buf_len == 0 {
            self.phase = Phase::Idle;
            return Ok(Progress::DownloadDone);
        }
        self.toggle = 0;
        self.phase = Phase::AwaitDownloadSegment;
        Ok(Progress::Continue { request: self.next_download_segment() })
    }

    fn on_download_segment(&mut self, _data: &[u8]) -> Result<Progress, AbortCode> {
        if self.cursor >= self.buf_len {
            self.phase = Phase::Idle;
            return Ok(Progress::DownloadDone);
        }
        Ok(Progress::Continue { request: self.next_download_segment() })
    }

    fn next_download_segment(&mut self) -> [u8; 8] {
        let remaining = self.buf_len - self.cursor;
        let mut req = [0u8; 8];
        if remaining > 7 {
            req[0] = self.toggle << 4;
            req[1..8].copy_from_slice(&self.buf[self.cursor..self.cursor + 7]);
            self.cursor += 7;
        } else {
            let n = 7 - remaining;
            req[0] = 0x01 | (self.toggle << 4) | ((n as u8) << 1);
            req[1..1 + remaining].copy_from_slice(&self.buf[self.cursor..self.buf_len]);
            self.cursor = self.buf_len;
        }
        self.toggle ^= 1;
        req
    }
}

/// Packs a raw `u64` into its little-endian wire bytes, for callers building
/// a download payload from a scalar read elsewhere in the stack.
pub fn scalar_to_bytes(value: u64, len: usize) -> [u8; 8] {
    u64_to_le_bytes(value, len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expedited_upload_completes_in_one_response() {
        let mut client = Client::new();
        let req = client.start_upload(3, 0x1008, 0).unwrap();
        assert_eq!(req[0], 0x40);

        let response = [0x4F, 0x08, 0x10, 0x00, 0x41, 0, 0, 0];
        match client.on_frame(&response).unwrap() {
            Progress::UploadDone { data, len } => {
                assert_eq!(len, 1);
                assert_eq!(data[0], 0x41);
            }
            other => panic!("expected UploadDone, got {other:?}"),
        }
        assert!(client.is_idle());
    }

    #[test]
    fn segmented_upload_reassembles_across_frames() {
        let mut client = Client::new();
        client.start_upload(3, 0x1008, 0).unwrap();

        let initiate = [0x41, 0x08, 0x10, 0x00, 10, 0, 0, 0];
        let progress = client.on_frame(&initiate).unwrap();
        assert!(matches!(progress, Progress::Continue { request } if request[0] == 0x60));

        let seg1 = [0x00, b'0', b'1', b'2', b'3', b'4', b'5', b'6'];
        let progress = client.on_frame(&seg1).unwrap();
        assert!(matches!(progress, Progress::Continue { request } if request[0] == 0x70));

        let seg2 = [0x19, b'7', b'8', b'9', 0, 0, 0, 0];
        match client.on_frame(&seg2).unwrap() {
            Progress::UploadDone { data, len } => {
                assert_eq!(len, 10);
                assert_eq!(&data[..10], b"0123456789");
            }
            other => panic!("expected UploadDone, got {other:?}"),
        }
    }

    #[test]
    fn expedited_download_completes_after_confirm() {
        let mut client = Client::new();
        let req = client.start_download(3, 0x6000, 1, &[0x2A]).unwrap();
        assert_eq!(req[0], 0x2F);

        let response = [0x60, 0x00, 0x60, 0x01, 0, 0, 0, 0];
        let progress = client.on_frame(&response).unwrap();
        assert!(matches!(progress, Progress::DownloadDone));
        assert!(client.is_idle());
    }

    #[test]
    fn abort_response_surfaces_abort_code() {
        let mut client = Client::new();
        client.start_upload(3, 0x1008, 0).unwrap();
        let abort = [0x80, 0x08, 0x10, 0x00, 0x00, 0x00, 0x02, 0x06];
        let result = client.on_frame(&abort);
        assert!(matches!(result, Err(AbortCode::ObjectDoesNotExistInObjectDictionary)));
        assert!(client.is_idle());
    }
}
