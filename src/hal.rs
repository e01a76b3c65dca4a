//! Driver contracts a host application implements to bring the stack onto
//! real hardware: a CAN transceiver, a monotonic millisecond timer, and
//! optional non-volatile storage for saved parameters.
//!
//! These mirror the synchronous, `Result`-returning trait style used for
//! hardware seams elsewhere in the no_std embedded ecosystem rather than
//! async traits or callback registration, so a caller drives the whole
//! stack from one polling loop.

use embedded_can::Frame;

use crate::error::ErrorCode;

/// Non-blocking CAN transceiver. `F` is the concrete frame type the HAL's
/// CAN peripheral driver produces and consumes.
///
/// Implementations reuse `embedded_can::nb::Can` semantics: `transmit`
/// returns `nb::Error::WouldBlock` if the hardware mailbox is full, and
/// `receive` returns it if no frame is pending.
pub trait Can<F: Frame> {
    fn transmit(&mut self, frame: &F) -> nb::Result<(), ErrorCode>;
    fn receive(&mut self) -> nb::Result<F, ErrorCode>;
}

/// Monotonic millisecond clock. Implementations typically wrap a hardware
/// timer/counter peripheral or, under the `std` feature, `std::time::Instant`.
pub trait Timer {
    /// Milliseconds elapsed since an arbitrary, implementation-defined epoch.
    /// Must never go backwards and must not overflow within the device's
    /// expected uptime.
    fn now_ms(&self) -> u32;
}

/// Non-volatile storage for saved parameter groups (0x1010/0x1011).
///
/// A minimal implementation that always returns `Err(ErrorCode::IfInit)` is
/// valid for a node with no persistent storage; `store`/`restore_defaults`
/// on such an object dictionary then simply fail the SDO download with a
/// `GeneralError` abort.
pub trait Nvm {
    /// Persists `data` under `group`, overwriting any previous contents.
    fn store(&mut self, group: u8, data: &[u8]) -> Result<(), ErrorCode>;
    /// Loads a previously stored group into `buf`, returning the number of
    /// bytes written. `Ok(0)` means no block was ever stored for `group`.
    fn load(&mut self, group: u8, buf: &mut [u8]) -> Result<usize, ErrorCode>;
    /// Erases a previously stored group so a later `load` reports `Ok(0)`.
    fn clear(&mut self, group: u8) -> Result<(), ErrorCode>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use embedded_can::{Id, StandardId};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct TestFrame {
        pub id: Id,
        pub data: [u8; 8],
        pub len: usize,
    }

    impl Frame for TestFrame {
        fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
            if data.len() > 8 {
                return None;
            }
            let mut buf = [0u8; 8];
            buf[..data.len()].copy_from_slice(data);
            Some(TestFrame { id: id.into(), data: buf, len: data.len() })
        }
        fn new_remote(_id: impl Into<Id>, _dlc: usize) -> Option<Self> {
            None
        }
        fn is_extended(&self) -> bool {
            matches!(self.id, Id::Extended(_))
        }
        fn is_remote_frame(&self) -> bool {
            false
        }
        fn id(&self) -> Id {
            self.id
        }
        fn dlc(&self) -> usize {
            self.len
        }
        fn data(&self) -> &[u8] {
            &self.data[..self.len]
        }
    }

    /// In-memory CAN bus: frames written by `transmit` are queued for the
    /// next `receive`, so two `MockCan`s sharing the same `VecDeque` would
    /// simulate a bus; a single one simulates loopback.
    pub struct MockCan {
        pub outbox: std::collections::VecDeque<TestFrame>,
        pub inbox: std::collections::VecDeque<TestFrame>,
    }

    impl MockCan {
        pub fn new() -> Self {
            MockCan { outbox: std::collections::VecDeque::new(), inbox: std::collections::VecDeque::new() }
        }
    }

    impl Can<TestFrame> for MockCan {
        fn transmit(&mut self, frame: &TestFrame) -> nb::Result<(), ErrorCode> {
            self.outbox.push_back(frame.clone());
            Ok(())
        }

        fn receive(&mut self) -> nb::Result<TestFrame, ErrorCode> {
            self.inbox.pop_front().ok_or(nb::Error::WouldBlock)
        }
    }

    pub struct MockTimer {
        pub millis: core::cell::Cell<u32>,
    }

    impl MockTimer {
        pub fn new() -> Self {
            MockTimer { millis: core::cell::Cell::new(0) }
        }

        pub fn advance(&self, ms: u32) {
            self.millis.set(self.millis.get() + ms);
        }
    }

    impl Timer for MockTimer {
        fn now_ms(&self) -> u32 {
            self.millis.get()
        }
    }

    pub struct MockNvm {
        pub groups: [Option<([u8; 256], usize)>; 8],
    }

    impl MockNvm {
        pub fn new() -> Self {
            MockNvm { groups: Default::default() }
        }
    }

    impl Nvm for MockNvm {
        fn store(&mut self, group: u8, data: &[u8]) -> Result<(), ErrorCode> {
            let slot = self.groups.get_mut(group as usize).ok_or(ErrorCode::BadArg)?;
            let mut buf = [0u8; 256];
            let n = data.len().min(256);
            buf[..n].copy_from_slice(&data[..n]);
            *slot = Some((buf, n));
            Ok(())
        }

        fn load(&mut self, group: u8, buf: &mut [u8]) -> Result<usize, ErrorCode> {
            match self.groups.get(group as usize).ok_or(ErrorCode::BadArg)? {
                Some((data, len)) => {
                    let n = (*len).min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok(n)
                }
                None => Ok(0),
            }
        }

        fn clear(&mut self, group: u8) -> Result<(), ErrorCode> {
            let slot = self.groups.get_mut(group as usize).ok_or(ErrorCode::BadArg)?;
            *slot = None;
            Ok(())
        }
    }

    #[test]
    fn standard_id_round_trips() {
        let frame = TestFrame::new(StandardId::new(0x601).unwrap(), &[1, 2, 3]).unwrap();
        assert_eq!(frame.data(), &[1, 2, 3]);
    }
}
