//! Fake HAL for black-box conformance tests, external to the crate so it
//! only exercises the public `hal::{Can, Timer, Nvm}` contract rather than
//! any crate-internal shortcut.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use canopen_rs::hal::{Can, Nvm, Timer};
use embedded_can::{Frame, Id, StandardId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockFrame {
    id: Id,
    data: [u8; 8],
    len: usize,
}

impl Frame for MockFrame {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        if data.len() > 8 {
            return None;
        }
        let mut buf = [0u8; 8];
        buf[..data.len()].copy_from_slice(data);
        Some(MockFrame { id: id.into(), data: buf, len: data.len() })
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

pub fn frame(cob_id: u16, data: &[u8]) -> MockFrame {
    MockFrame::new(StandardId::new(cob_id).unwrap(), data).unwrap()
}

type Queue = Rc<RefCell<VecDeque<MockFrame>>>;

/// In-memory bus, split into a `MockCan` that `Node::new` takes ownership of
/// and a `MockBus` handle the test keeps: both sides share the same queues,
/// so the test can keep injecting frames and inspecting replies after the
/// node has taken its driver by value.
pub struct MockCan {
    inbox: Queue,
    outbox: Queue,
}

/// Test-side handle onto a `MockCan`'s queues. Clone of [`MockCan::bus`].
#[derive(Clone)]
pub struct MockBus {
    inbox: Queue,
    outbox: Queue,
}

impl MockCan {
    pub fn new() -> Self {
        MockCan { inbox: Rc::new(RefCell::new(VecDeque::new())), outbox: Rc::new(RefCell::new(VecDeque::new())) }
    }

    /// A handle sharing this driver's queues, to retain after moving `self`
    /// into `Node::new`.
    pub fn bus(&self) -> MockBus {
        MockBus { inbox: self.inbox.clone(), outbox: self.outbox.clone() }
    }
}

impl Can<MockFrame> for MockCan {
    fn transmit(&mut self, frame: &MockFrame) -> nb::Result<(), canopen_rs::ErrorCode> {
        self.outbox.borrow_mut().push_back(frame.clone());
        Ok(())
    }

    fn receive(&mut self) -> nb::Result<MockFrame, canopen_rs::ErrorCode> {
        self.inbox.borrow_mut().pop_front().ok_or(nb::Error::WouldBlock)
    }
}

impl MockBus {
    /// Queues a frame for the node to pick up on its next `receive`.
    pub fn push(&self, cob_id: u16, data: &[u8]) {
        self.inbox.borrow_mut().push_back(frame(cob_id, data));
    }

    /// Pops the oldest frame the node has transmitted, if any.
    pub fn pop(&self) -> Option<MockFrame> {
        self.outbox.borrow_mut().pop_front()
    }

    pub fn outbox_is_empty(&self) -> bool {
        self.outbox.borrow().is_empty()
    }

    pub fn clear_outbox(&self) {
        self.outbox.borrow_mut().clear();
    }
}

/// Same sharing problem as `MockCan`/`MockBus`: once `Node::new` takes a
/// `MockTimer` by value, the test still needs to advance its clock, so the
/// millisecond counter lives behind an `Rc` and `clock()` hands out a handle
/// onto the same one.
pub struct MockTimer {
    millis: Rc<std::cell::Cell<u32>>,
}

#[derive(Clone)]
pub struct MockClock {
    millis: Rc<std::cell::Cell<u32>>,
}

impl MockTimer {
    pub fn new() -> Self {
        MockTimer { millis: Rc::new(std::cell::Cell::new(0)) }
    }

    pub fn clock(&self) -> MockClock {
        MockClock { millis: self.millis.clone() }
    }
}

impl MockClock {
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
    groups: [Option<(Vec<u8>, usize)>; 8],
}

impl MockNvm {
    pub fn new() -> Self {
        MockNvm { groups: Default::default() }
    }
}

impl Nvm for MockNvm {
    fn store(&mut self, group: u8, data: &[u8]) -> Result<(), canopen_rs::ErrorCode> {
        let slot = self.groups.get_mut(group as usize).ok_or(canopen_rs::ErrorCode::BadArg)?;
        *slot = Some((data.to_vec(), data.len()));
        Ok(())
    }

    fn load(&mut self, group: u8, buf: &mut [u8]) -> Result<usize, canopen_rs::ErrorCode> {
        match self.groups.get(group as usize).ok_or(canopen_rs::ErrorCode::BadArg)? {
            Some((data, len)) => {
                let n = (*len).min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    fn clear(&mut self, group: u8) -> Result<(), canopen_rs::ErrorCode> {
        let slot = self.groups.get_mut(group as usize).ok_or(canopen_rs::ErrorCode::BadArg)?;
        *slot = None;
        Ok(())
    }
}
