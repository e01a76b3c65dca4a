//! Network Management: the node state machine, heartbeat production, and
//! heartbeat-consumer lifeguarding.
//!
//! The teacher's `node.rs` inlined NMT handling directly into `Node` with a
//! bespoke `NodeState`/`NodeEvent` pair. This factors that state machine out
//! so it can own its own heartbeat-consumer bookkeeping (new: the teacher
//! never consumed other nodes' heartbeats) independent of the rest of
//! `Node`.

use crate::config::CO_HB_CONSUMER_N;
use crate::constant::COB_FUNC_HEARTBEAT;
use crate::error::ErrorCode;
use crate::frame::create_frame;
use crate::{debug, warn};

/// CiA 301 §7.3.2 node states.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum State {
    Initialization,
    PreOperational,
    Operational,
    Stopped,
}

impl State {
    /// Byte transmitted as the heartbeat producer's payload (CiA 301 Table
    /// 41); `Initialization` never produces a heartbeat so has none.
    pub fn heartbeat_code(&self) -> Option<u8> {
        match self {
            State::Initialization => None,
            State::Stopped => Some(4),
            State::Operational => Some(5),
            State::PreOperational => Some(127),
        }
    }
}

/// NMT commands carried in COB-ID 0 (CiA 301 Table 42).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Command {
    Start,
    Stop,
    EnterPreOperational,
    ResetNode,
    ResetCommunication,
}

impl Command {
    fn from_cs(cs: u8) -> Option<Self> {
        match cs {
            1 => Some(Command::Start),
            2 => Some(Command::Stop),
            0x80 => Some(Command::EnterPreOperational),
            0x81 => Some(Command::ResetNode),
            0x82 => Some(Command::ResetCommunication),
            _ => None,
        }
    }
}

struct Consumer {
    node_id: u8,
    timeout_ms: u32,
    elapsed_since_seen_ms: u32,
    seen_once: bool,
    timed_out: bool,
}

/// NMT state plus heartbeat producer/consumer tracking for one local node.
pub struct Nmt {
    state: State,
    node_id: u8,
    producer_period_ms: u32,
    consumers: [Option<Consumer>; CO_HB_CONSUMER_N],
}

impl Nmt {
    pub fn new(node_id: u8, producer_period_ms: u32) -> Self {
        Nmt { state: State::Initialization, node_id, producer_period_ms, consumers: Default::default() }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn enter_pre_operational(&mut self) {
        self.state = State::PreOperational;
    }

    /// Registers (or replaces) a heartbeat consumer entry for `node_id`
    /// (CiA 301 object 0x1016). `timeout_ms == 0` disables monitoring.
    pub fn watch_consumer(&mut self, node_id: u8, timeout_ms: u32) -> Result<(), ErrorCode> {
        if let Some(slot) = self.consumers.iter_mut().flatten().find(|c| c.node_id == node_id) {
            slot.timeout_ms = timeout_ms;
            slot.elapsed_since_seen_ms = 0;
            slot.seen_once = false;
            slot.timed_out = false;
            return Ok(());
        }
        let slot = self.consumers.iter_mut().find(|c| c.is_none()).ok_or(ErrorCode::BadArg)?;
        *slot = Some(Consumer { node_id, timeout_ms, elapsed_since_seen_ms: 0, seen_once: false, timed_out: false });
        debug!("watching node {} for heartbeats, timeout {}ms", node_id, timeout_ms);
        Ok(())
    }

    /// Feeds an NMT-command frame's payload `[cs, addressed_node]` into the
    /// state machine. Returns the command if one was addressed to us (node
    /// 0 in the payload means "all nodes").
    pub fn process_command_frame(&mut self, data: &[u8]) -> Option<Command> {
        if data.len() < 2 {
            return None;
        }
        let (cs, addressed) = (data[0], data[1]);
        if addressed != 0 && addressed != self.node_id {
            return None;
        }
        let command = Command::from_cs(cs)?;
        match command {
            Command::Start => self.state = State::Operational,
            Command::Stop => self.state = State::Stopped,
            Command::EnterPreOperational => self.state = State::PreOperational,
            Command::ResetNode | Command::ResetCommunication => self.state = State::PreOperational,
        }
        debug!("NMT state -> {:?} ({:?})", self.state, command);
        Some(command)
    }

    /// Feeds a received heartbeat frame `(producer_node_id, payload)` to
    /// reset that consumer's timeout window.
    pub fn on_heartbeat_received(&mut self, producer_node_id: u8) {
        if let Some(c) = self.consumers.iter_mut().flatten().find(|c| c.node_id == producer_node_id) {
            c.elapsed_since_seen_ms = 0;
            c.seen_once = true;
            c.timed_out = false;
        }
    }

    pub fn producer_period_ms(&self) -> u32 {
        self.producer_period_ms
    }

    pub fn set_producer_period_ms(&mut self, period_ms: u32) {
        self.producer_period_ms = period_ms;
    }

    /// Builds this node's heartbeat frame, if it currently produces one.
    pub fn build_heartbeat_frame<F: embedded_can::Frame>(&self) -> Result<Option<F>, ErrorCode> {
        match self.state.heartbeat_code() {
            Some(code) => Ok(Some(create_frame(COB_FUNC_HEARTBEAT + self.node_id as u16, &[code])?)),
            None => Ok(None),
        }
    }

    /// Advances every consumer's elapsed time by `elapsed_ms`, returning the
    /// node IDs that just newly timed out (one-shot: won't repeat until
    /// `on_heartbeat_received` resets them).
    pub fn advance_consumers(&mut self, elapsed_ms: u32) -> [Option<u8>; CO_HB_CONSUMER_N] {
        let mut timed_out_now = [None; CO_HB_CONSUMER_N];
        for (slot, out) in self.consumers.iter_mut().zip(timed_out_now.iter_mut()) {
            if let Some(c) = slot {
                if c.timeout_ms == 0 || !c.seen_once || c.timed_out {
                    continue;
                }
                c.elapsed_since_seen_ms += elapsed_ms;
                if c.elapsed_since_seen_ms >= c.timeout_ms {
                    c.timed_out = true;
                    *out = Some(c.node_id);
                    warn!("heartbeat consumer for node {} timed out after {}ms", c.node_id, c.timeout_ms);
                }
            }
        }
        timed_out_now
    }
}
