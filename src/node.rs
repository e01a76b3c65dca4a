//! `Node` ties the object dictionary, SDO servers/clients, PDO engine, NMT
//! state machine and timer wheel to one CAN driver, and is the single entry
//! point an application drives from its main loop.
//!
//! The teacher's `Node` owned a `HashMap`-backed `ObjectDirectory` parsed
//! from an EDS string and inlined NMT/SDO/PDO handling directly as its own
//! methods. This keeps the teacher's "one non-blocking `process_one_frame`
//! call per loop iteration" shape but delegates to the now-independent
//! `od`/`sdo_server`/`sdo_client`/`pdo`/`nmt`/`timer` modules, none of which
//! know about `Node` or each other.

use embedded_can::Frame;

use crate::cmd_header::SdoDownloadInitiateCmd;
use crate::config::{
    CO_HB_CONSUMER_N, CO_PDO_MAX_MAPPED_ENTRIES, CO_SDO_CLI_N, CO_SDO_SRV_N, CO_TMR_N, CO_TPDO_N, OD_DOMAIN_MAX,
    OD_PARAM_GROUP_MAX, SDO_WATCHDOG_MS,
};
use crate::constant::{
    COB_FUNC_EMCY, COB_FUNC_HEARTBEAT, COB_FUNC_MASK, COB_FUNC_NMT, COB_FUNC_RECEIVE_SDO, COB_FUNC_SYNC,
    COB_FUNC_TRANSMIT_SDO, IDX_CONSUMER_HEARTBEAT_TIME, IDX_PRODUCER_HEARTBEAT_TIME, IDX_RESTORE_DEFAULT_PARAMETERS,
    IDX_STORE_PARAMETERS, LOAD_COMMAND_SIGNATURE, PDO_COB_ID_MASK, PDO_COB_ID_VALID_BIT, RPDO_COMM_RANGE,
    RPDO_MAP_RANGE, SAVE_COMMAND_SIGNATURE, SDO_SERVER_COMM_RANGE, TPDO_COMM_RANGE, TPDO_MAP_RANGE,
};
use crate::emergency::{self, EmergencyErrorCode, ErrorRegister};
use crate::error::{AbortCode, ErrorCode};
use crate::frame::{bytes_to_u32_le, create_frame, get_cob_id, get_index_from_data};
use crate::hal::{Can, Nvm, Timer};
use crate::nmt::{Command, Nmt, State};
use crate::od::{ObjectDictionary, TypeKind};
use crate::pdo::{Comm, Engine as PdoEngine, Map, RpdoSlot, Trigger, TpdoSlot};
use crate::sdo_client::{Client as SdoClient, Progress};
use crate::sdo_server::Server as SdoServer;
use crate::timer::{Action, TimerHandle, Wheel};
use crate::{error, info};

/// Largest number of 7-byte segment frames a block transfer can span, sized
/// from the domain capacity so the lead-frame scratch array in
/// `on_sdo_request` always fits a full block upload.
const MAX_BLOCK_SEGMENTS: usize = (OD_DOMAIN_MAX + 6) / 7;

/// The outcome of the last completed SDO client transfer, queued for the
/// application to pick up with [`Node::take_sdo_client_result`].
#[derive(Debug)]
pub enum SdoClientResult {
    Upload { data: [u8; OD_DOMAIN_MAX], len: usize },
    Download,
    Aborted(AbortCode),
}

/// A CiA 301 node: one object dictionary, one CAN interface and NVM, and the
/// services (SDO/PDO/NMT/EMCY) that read and write them.
pub struct Node<'a, F, C, T, V>
where
    F: Frame,
    C: Can<F>,
    T: Timer,
    V: Nvm,
{
    od: ObjectDictionary<'a>,
    can: C,
    timer: T,
    nvm: V,
    last_tick_ms: u32,
    nmt: Nmt,
    pdo: PdoEngine,
    sdo_servers: [SdoServer; CO_SDO_SRV_N],
    sdo_clients: [SdoClient; CO_SDO_CLI_N],
    /// This node's own SDO server COB-IDs (object 1200h sub 1/2), raw with
    /// the valid bit still in bit 31; `None` addressing from
    /// `sdo_rx_cob_id()` means the server is disabled and ignores frames.
    sdo_rx_cob_id_raw: u32,
    sdo_tx_cob_id_raw: u32,
    client_result: Option<SdoClientResult>,
    emcy_history: emergency::History,
    wheel: Wheel<CO_TMR_N>,
    error_count: u32,
    /// Whether a TPDO is within its inhibit window (CiA 301 §7.3.5): while
    /// `true`, an event trigger is latched in `tpdo_event_pending` instead of
    /// transmitting immediately.
    tpdo_inhibited: [bool; CO_TPDO_N],
    tpdo_event_pending: [bool; CO_TPDO_N],
    tpdo_event_handles: [Option<TimerHandle>; CO_TPDO_N],
    sdo_watchdog_handles: [Option<TimerHandle>; CO_SDO_SRV_N],
    _frame: core::marker::PhantomData<F>,
}

impl<'a, F, C, T, V> Node<'a, F, C, T, V>
where
    F: Frame,
    C: Can<F>,
    T: Timer,
    V: Nvm,
{
    /// Builds a node addressing `node_id`, backed by `entries` (must be
    /// sorted ascending by `(index, sub_index)`; see `od::ObjectDictionary::new`).
    /// Loads any previously persisted parameter groups from `nvm` before
    /// returning, so the object dictionary reflects saved state from the
    /// first `process()` call onward.
    pub fn new(node_id: u8, entries: &'a [crate::od::Entry], can: C, timer: T, nvm: V) -> Self {
        let od = ObjectDictionary::new(entries, node_id);
        let sdo_servers: [SdoServer; CO_SDO_SRV_N] = core::array::from_fn(|_| SdoServer::new());
        let sdo_clients: [SdoClient; CO_SDO_CLI_N] = core::array::from_fn(|_| SdoClient::new());

        let producer_period_ms = od.read_value(IDX_PRODUCER_HEARTBEAT_TIME, 0).unwrap_or(0) as u32;
        let mut wheel = Wheel::new();
        if producer_period_ms > 0 {
            let _ = wheel.create(Action::HeartbeatProducer, producer_period_ms, Some(producer_period_ms));
        }

        let mut node = Node {
            od,
            can,
            timer,
            nvm,
            last_tick_ms: 0,
            nmt: Nmt::new(node_id, producer_period_ms),
            pdo: PdoEngine::new(),
            sdo_servers,
            sdo_clients,
            sdo_rx_cob_id_raw: COB_FUNC_RECEIVE_SDO as u32 + node_id as u32,
            sdo_tx_cob_id_raw: COB_FUNC_TRANSMIT_SDO as u32 + node_id as u32,
            client_result: None,
            emcy_history: emergency::History::new(),
            wheel,
            error_count: 0,
            tpdo_inhibited: [false; CO_TPDO_N],
            tpdo_event_pending: [false; CO_TPDO_N],
            tpdo_event_handles: [None; CO_TPDO_N],
            sdo_watchdog_handles: [None; CO_SDO_SRV_N],
            _frame: core::marker::PhantomData,
        };
        node.sync_all_pdo_config();
        node.sync_sdo_server_comm();
        node.sync_all_heartbeat_consumers();
        node.load_persisted_parameters();
        node.last_tick_ms = node.timer.now_ms();
        node
    }

    /// Seeds every TPDO/RPDO slot from its OD communication/mapping records,
    /// if declared. A slot whose COB-ID entry is absent from the dictionary
    /// stays unconfigured (`None`).
    fn sync_all_pdo_config(&mut self) {
        for slot in 0..self.pdo.tpdos.len() {
            self.sync_tpdo_comm(slot);
            self.sync_tpdo_map(slot);
        }
        for slot in 0..self.pdo.rpdos.len() {
            self.sync_rpdo_comm(slot);
            self.sync_rpdo_map(slot);
        }
    }

    /// Seeds this node's own SDO server COB-IDs from object 1200h sub 1/2, if
    /// declared, falling back to the predefined connection set (CiA 301
    /// §7.2.2: RX = 0x600+node-id, TX = 0x580+node-id) otherwise.
    fn sync_sdo_server_comm(&mut self) {
        let node_id = self.od.node_id() as u32;
        self.sdo_rx_cob_id_raw = self
            .od
            .read_value(SDO_SERVER_COMM_RANGE.start, 1)
            .map(|v| v as u32)
            .unwrap_or(COB_FUNC_RECEIVE_SDO as u32 + node_id);
        self.sdo_tx_cob_id_raw = self
            .od
            .read_value(SDO_SERVER_COMM_RANGE.start, 2)
            .map(|v| v as u32)
            .unwrap_or(COB_FUNC_TRANSMIT_SDO as u32 + node_id);
    }

    /// `None` means the server is disabled (valid bit set) and must ignore
    /// incoming request frames entirely.
    fn sdo_rx_cob_id(&self) -> Option<u16> {
        if self.sdo_rx_cob_id_raw & PDO_COB_ID_VALID_BIT != 0 {
            None
        } else {
            Some((self.sdo_rx_cob_id_raw & PDO_COB_ID_MASK) as u16)
        }
    }

    fn sdo_tx_cob_id(&self) -> u16 {
        (self.sdo_tx_cob_id_raw & PDO_COB_ID_MASK) as u16
    }

    /// Seeds one consumer heartbeat-time slot from object 1016h sub `n`: a
    /// packed `(node_id << 16) | timeout_ms`, CiA 301 §7.2.8.3. A zero
    /// node-id or timeout leaves the slot unconfigured.
    fn sync_heartbeat_consumer(&mut self, sub_index: u8) {
        let Ok(packed) = self.od.read_value(IDX_CONSUMER_HEARTBEAT_TIME, sub_index).map(|v| v as u32) else { return };
        let node_id = (packed >> 16) as u8;
        let timeout_ms = packed & 0xFFFF;
        if node_id == 0 || timeout_ms == 0 {
            return;
        }
        if let Err(err) = self.nmt.watch_consumer(node_id, timeout_ms) {
            error!("failed to register heartbeat consumer for node {}: {:?}", node_id, err);
        }
    }

    fn sync_all_heartbeat_consumers(&mut self) {
        for sub_index in 1..=CO_HB_CONSUMER_N as u8 {
            self.sync_heartbeat_consumer(sub_index);
        }
    }

    pub fn nmt_state(&self) -> State {
        self.nmt.state()
    }

    pub fn node_id(&self) -> u8 {
        self.od.node_id()
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    /// Boot transition (CiA 301 §7.3.2): `Initialisation` autonomously
    /// enters `Pre-Operational`. Call once after constructing the node and
    /// initializing its driver.
    pub fn start(&mut self) {
        self.nmt.enter_pre_operational();
    }

    /// Takes the result of the last SDO client transfer driven to
    /// completion, if one is pending pickup.
    pub fn take_sdo_client_result(&mut self) -> Option<SdoClientResult> {
        self.client_result.take()
    }

    fn transmit(&mut self, frame: F) {
        match self.can.transmit(&frame) {
            Ok(()) => info!("sent frame"),
            Err(nb::Error::WouldBlock) => error!("CAN transmit would block, frame dropped"),
            Err(nb::Error::Other(err)) => error!("CAN transmit failed: {:?}", err),
        }
    }

    fn reply_ok(&mut self, cob_id: u16, data: [u8; 8]) {
        match create_frame::<F>(cob_id, &data) {
            Ok(frame) => self.transmit(frame),
            Err(err) => error!("failed to build SDO reply frame: {:?}", err),
        }
    }

    /// Runs one iteration: drains one pending CAN frame (non-blocking) and
    /// advances the timer wheel by the elapsed time since the last call.
    /// Must be called from the application's main loop; never blocks.
    pub fn process(&mut self) {
        self.process_timers();
        self.process_one_frame();
    }

    fn process_timers(&mut self) {
        let now = self.timer.now_ms();
        let elapsed = now.wrapping_sub(self.last_tick_ms);
        self.last_tick_ms = now;
        if elapsed == 0 {
            return;
        }

        let timed_out = self.nmt.advance_consumers(elapsed);
        for peer in timed_out.into_iter().flatten() {
            self.raise_emcy(EmergencyErrorCode::HeartbeatConsumerTimeout, ErrorRegister::CommunicationError, &peer.to_le_bytes());
        }

        let mut fired: [Option<Action>; CO_TMR_N] = [None; CO_TMR_N];
        let mut n = 0;
        self.wheel.process(elapsed, |action| {
            if n < fired.len() {
                fired[n] = Some(action);
                n += 1;
            }
        });
        for action in fired.into_iter().take(n).flatten() {
            self.handle_timer_action(action);
        }
    }

    fn handle_timer_action(&mut self, action: Action) {
        match action {
            Action::HeartbeatProducer => {
                if let Ok(Some(frame)) = self.nmt.build_heartbeat_frame::<F>() {
                    self.transmit(frame);
                }
            }
            Action::TpdoEvent { tpdo } => self.transmit_one_tpdo(tpdo as usize, Trigger::Event),
            Action::TpdoInhibit { tpdo } => self.on_tpdo_inhibit_elapsed(tpdo as usize),
            Action::SdoServerWatchdog { server } => self.on_sdo_watchdog_elapsed(server as usize),
            Action::HeartbeatConsumer { .. } | Action::Sync => {}
        }
    }

    /// A server's transfer has sat idle past `SDO_WATCHDOG_MS` since its last
    /// request frame (CiA 301 §7.2.4.3.14): abort it and reply with
    /// `SdoProtocolTimedOut`, per spec.md's wire example
    /// `[0x80,idx,sub,0x00,0x00,0x00,0x04,0x05]`.
    fn on_sdo_watchdog_elapsed(&mut self, server: usize) {
        if server >= self.sdo_servers.len() {
            return;
        }
        self.sdo_watchdog_handles[server] = None;
        if self.sdo_servers[server].is_idle() {
            return;
        }
        let reply_cob_id = self.sdo_tx_cob_id();
        let frame = self.sdo_servers[server].abort_frame(0, 0, AbortCode::SdoProtocolTimedOut);
        self.reply_ok(reply_cob_id, frame);
    }

    /// Re-arms or cancels `server`'s watchdog after it has just processed a
    /// frame: idle (transfer finished or aborted) cancels it, anything else
    /// restarts the window from now.
    fn refresh_sdo_watchdog(&mut self, server: usize) {
        if server >= self.sdo_servers.len() {
            return;
        }
        if let Some(handle) = self.sdo_watchdog_handles[server].take() {
            let _ = self.wheel.cancel(handle);
        }
        if !self.sdo_servers[server].is_idle() {
            self.sdo_watchdog_handles[server] =
                self.wheel.create(Action::SdoServerWatchdog { server: server as u8 }, SDO_WATCHDOG_MS, None).ok();
        }
    }

    /// The inhibit window for a TPDO has elapsed: if an event arrived while
    /// inhibited, send the coalesced (latest-value) frame now and re-arm a
    /// fresh inhibit window behind it.
    fn on_tpdo_inhibit_elapsed(&mut self, tpdo: usize) {
        if tpdo >= self.tpdo_inhibited.len() {
            return;
        }
        self.tpdo_inhibited[tpdo] = false;
        if self.tpdo_event_pending[tpdo] {
            self.tpdo_event_pending[tpdo] = false;
            self.transmit_one_tpdo(tpdo, Trigger::Event);
            self.arm_tpdo_inhibit(tpdo);
        }
    }

    fn raise_emcy(&mut self, eec: EmergencyErrorCode, er: ErrorRegister, manufacturer_data: &[u8]) {
        self.emcy_history.push(eec);
        self.error_count += 1;
        match emergency::build_frame::<F>(self.od.node_id(), eec, er, manufacturer_data) {
            Ok(frame) => self.transmit(frame),
            Err(err) => error!("failed to build EMCY frame: {:?}", err),
        }
    }

    fn process_one_frame(&mut self) {
        let frame = match self.can.receive() {
            Ok(f) => f,
            Err(nb::Error::WouldBlock) => return,
            Err(nb::Error::Other(err)) => {
                error!("CAN receive failed: {:?}", err);
                return;
            }
        };
        let Some(cob_id) = get_cob_id(&frame) else { return };

        if cob_id == COB_FUNC_SYNC {
            self.on_sync();
            return;
        }
        if self.sdo_rx_cob_id() == Some(cob_id) {
            self.on_sdo_request(frame.data());
            return;
        }
        if cob_id == self.sdo_tx_cob_id() {
            self.on_sdo_response(cob_id, frame.data());
            return;
        }
        match cob_id & COB_FUNC_MASK {
            COB_FUNC_NMT => self.on_nmt_frame(frame.data()),
            COB_FUNC_EMCY => {}
            COB_FUNC_HEARTBEAT => self.on_heartbeat_frame(cob_id, frame.data()),
            _ => self.on_rpdo_frame(cob_id, frame.data()),
        }
    }

    fn on_nmt_frame(&mut self, data: &[u8]) {
        if let Some(cmd) = self.nmt.process_command_frame(data) {
            info!("NMT command processed: {:?}", cmd);
            if matches!(cmd, Command::ResetNode | Command::ResetCommunication) {
                self.cancel_in_flight_transfers_and_pdo_events();
            }
        }
    }

    /// CiA 301 §7.3.2: `reset node`/`reset communication` tear down live
    /// communication state. SDO transfers in progress are abandoned (the
    /// client/server that started them gets no further reply) and any
    /// latched-but-not-yet-coalesced TPDO events are dropped rather than
    /// fired late after the reset.
    fn cancel_in_flight_transfers_and_pdo_events(&mut self) {
        self.sdo_servers = core::array::from_fn(|_| SdoServer::new());
        self.sdo_clients = core::array::from_fn(|_| SdoClient::new());
        for server in 0..CO_SDO_SRV_N {
            if let Some(handle) = self.sdo_watchdog_handles[server].take() {
                let _ = self.wheel.cancel(handle);
            }
        }
        for tpdo in 0..CO_TPDO_N {
            if let Some(handle) = self.tpdo_event_handles[tpdo].take() {
                let _ = self.wheel.cancel(handle);
            }
            self.tpdo_inhibited[tpdo] = false;
            self.tpdo_event_pending[tpdo] = false;
        }
        self.sync_all_pdo_config();
        self.sync_sdo_server_comm();
        self.sync_all_heartbeat_consumers();
    }

    fn on_heartbeat_frame(&mut self, cob_id: u16, _data: &[u8]) {
        let producer_node_id = (cob_id & !COB_FUNC_HEARTBEAT) as u8;
        self.nmt.on_heartbeat_received(producer_node_id);
    }

    fn on_sync(&mut self) {
        if self.nmt.state() != State::Operational {
            return;
        }
        for idx in 0..self.pdo.rpdos.len() {
            self.apply_cached_rpdo(idx);
        }
        self.transmit_tpdos(Trigger::Sync);
    }

    fn apply_cached_rpdo(&mut self, idx: usize) {
        let Some((values, n)) = self.pdo.take_rpdo_values(idx) else { return };
        for (value, (index, sub_index, _bits)) in values.into_iter().take(n) {
            match self.od.write_value(index, sub_index, value) {
                Ok(_) => self.maybe_trigger_tpdo_event(index, sub_index),
                Err(err) => {
                    error!("RPDO write failed for {:#06x}:{}: {:?}", index, sub_index, err);
                    self.raise_emcy(EmergencyErrorCode::PdoNotProcessed, ErrorRegister::CommunicationError, &[]);
                }
            }
        }
    }

    fn transmit_tpdos(&mut self, trigger: Trigger) {
        for idx in 0..self.pdo.tpdos.len() {
            self.transmit_one_tpdo(idx, trigger);
        }
    }

    fn transmit_one_tpdo(&mut self, idx: usize, trigger: Trigger) {
        if idx >= self.pdo.tpdos.len() {
            return;
        }
        let od = &self.od;
        let built: Result<Option<F>, ErrorCode> = self.pdo.build_tpdo_frame(idx, trigger, trigger == Trigger::Event, |index, sub_index| od.read_value(index, sub_index));
        match built {
            Ok(Some(frame)) => self.transmit(frame),
            Ok(None) => {}
            Err(err) => error!("failed to build TPDO {}: {:?}", idx, err),
        }
    }

    /// Checks whether an async write to `(index, sub_index)` landed in a
    /// mapped slot of an event-driven TPDO (transmission type 0xFE/0xFF) and,
    /// if so, fires it (CiA 301 §7.3.5: "asynchronous" PDOs send on a change
    /// of the mapped data, subject to the inhibit timer).
    fn maybe_trigger_tpdo_event(&mut self, index: u16, sub_index: u8) {
        let Ok(entry) = self.od.find(index, sub_index) else { return };
        if !entry.is_pdo_mappable() || !entry.notifies_async() {
            return;
        }
        for tpdo in 0..self.pdo.tpdos.len() {
            let matches_slot = self.pdo.tpdos[tpdo].as_ref().is_some_and(|slot| {
                slot.comm.is_valid()
                    && matches!(slot.comm.transmission_type, 0xFE | 0xFF)
                    && slot.map.entries[..slot.map.count as usize].iter().any(|&(i, s, _)| i == index && s == sub_index)
            });
            if matches_slot {
                self.fire_tpdo_event(tpdo);
            }
        }
    }

    /// Sends immediately if outside the inhibit window, otherwise latches
    /// the event to be coalesced into one frame once the window elapses.
    fn fire_tpdo_event(&mut self, tpdo: usize) {
        if tpdo >= self.tpdo_inhibited.len() {
            return;
        }
        if self.tpdo_inhibited[tpdo] {
            self.tpdo_event_pending[tpdo] = true;
            return;
        }
        self.transmit_one_tpdo(tpdo, Trigger::Event);
        self.arm_tpdo_inhibit(tpdo);
    }

    fn arm_tpdo_inhibit(&mut self, tpdo: usize) {
        let Some(slot) = self.pdo.tpdos.get(tpdo).and_then(|s| s.as_ref()) else { return };
        let inhibit_ms = (slot.comm.inhibit_time_100us as u32) / 10;
        if inhibit_ms == 0 {
            return;
        }
        self.tpdo_inhibited[tpdo] = true;
        let _ = self.wheel.create(Action::TpdoInhibit { tpdo: tpdo as u8 }, inhibit_ms, None);
    }

    fn on_rpdo_frame(&mut self, cob_id: u16, data: &[u8]) {
        if self.nmt.state() != State::Operational {
            return;
        }
        if let Some((idx, _map)) = self.pdo.on_rpdo_frame(cob_id, data) {
            self.apply_cached_rpdo(idx);
        }
    }

    fn on_sdo_request(&mut self, data: &[u8]) {
        if self.nmt.state() == State::Stopped {
            return;
        }
        let (index, sub_index) = get_index_from_data(data);
        let is_download_initiate = data[0] >> 5 == 0x1;
        let is_start_block_upload = data[0] >> 5 == 0x5 && data[0] & 0x3 == 0x3;
        let reply_cob_id = self.sdo_tx_cob_id();

        if is_download_initiate {
            if let Err(abort) = self.pdo_config_gate(index, sub_index, data) {
                let frame = self.sdo_servers[0].abort_frame(index, sub_index, abort);
                self.reply_ok(reply_cob_id, frame);
                self.refresh_sdo_watchdog(0);
                return;
            }
        }

        let server = &mut self.sdo_servers[0];
        match server.process(&self.od, data) {
            Ok(reply) => {
                if is_start_block_upload {
                    let mut lead = [[0u8; 8]; MAX_BLOCK_SEGMENTS];
                    let n = server.block_upload_lead_frames(&mut lead);
                    for frame in &lead[..n] {
                        self.reply_ok(reply_cob_id, *frame);
                    }
                }
                self.reply_ok(reply_cob_id, reply);
                if let Some((ci, cs)) = self.sdo_servers[0].take_committed_write() {
                    if cs == 1 {
                        self.after_parameter_write(ci);
                    }
                    self.sync_pdo_config(ci);
                    if SDO_SERVER_COMM_RANGE.contains(&ci) {
                        self.sync_sdo_server_comm();
                        self.sdo_servers[0] = SdoServer::new();
                    }
                    if ci == IDX_CONSUMER_HEARTBEAT_TIME {
                        self.sync_heartbeat_consumer(cs);
                    }
                    self.maybe_trigger_tpdo_event(ci, cs);
                }
            }
            Err(abort) => {
                let frame = server.abort_frame(index, sub_index, abort);
                self.reply_ok(reply_cob_id, frame);
            }
        }
        self.refresh_sdo_watchdog(0);
    }

    /// Enforces the CiA 301 §7.3.5/§7.3.6 "rewrite only while disabled" rule
    /// for PDO and SDO-server COB-IDs and PDO mapping tables before the write
    /// ever reaches the object dictionary, since a successful SDO reply can't
    /// be taken back. Only expedited downloads are gated; these fields are
    /// always u8/u32 scalars, so a conformant client never sends them
    /// segmented.
    fn pdo_config_gate(&self, index: u16, sub_index: u8, data: &[u8]) -> Result<(), AbortCode> {
        let cmd = SdoDownloadInitiateCmd::from(data[0]);
        if !(cmd.e() && cmd.s()) {
            return Ok(());
        }
        let n = 4 - cmd.n() as usize;
        let new_value = bytes_to_u32_le(&data[4..4 + n]);

        if TPDO_COMM_RANGE.contains(&index) && sub_index == 1 {
            let slot = (index - TPDO_COMM_RANGE.start) as usize;
            return Self::cob_id_gate(self.pdo.tpdos.get(slot).and_then(|s| s.as_ref()).map(|s| s.comm), new_value);
        }
        if RPDO_COMM_RANGE.contains(&index) && sub_index == 1 {
            let slot = (index - RPDO_COMM_RANGE.start) as usize;
            return Self::cob_id_gate(self.pdo.rpdos.get(slot).and_then(|s| s.as_ref()).map(|s| s.comm), new_value);
        }
        if TPDO_MAP_RANGE.contains(&index) && sub_index == 0 {
            let slot = (index - TPDO_MAP_RANGE.start) as usize;
            return Self::map_count_gate(self.pdo.tpdos.get(slot).and_then(|s| s.as_ref()).map(|s| s.comm), new_value);
        }
        if RPDO_MAP_RANGE.contains(&index) && sub_index == 0 {
            let slot = (index - RPDO_MAP_RANGE.start) as usize;
            return Self::map_count_gate(self.pdo.rpdos.get(slot).and_then(|s| s.as_ref()).map(|s| s.comm), new_value);
        }
        if SDO_SERVER_COMM_RANGE.contains(&index) && (sub_index == 1 || sub_index == 2) {
            let current_raw = if sub_index == 1 { self.sdo_rx_cob_id_raw } else { self.sdo_tx_cob_id_raw };
            return Self::cob_id_gate(Some(Comm { cob_id_raw: current_raw, ..Default::default() }), new_value);
        }
        Ok(())
    }

    fn cob_id_gate(current: Option<Comm>, new_raw: u32) -> Result<(), AbortCode> {
        let was_enabled = current.map(|c| c.is_valid()).unwrap_or(false);
        let will_be_enabled = new_raw & PDO_COB_ID_VALID_BIT == 0;
        if was_enabled && will_be_enabled {
            Err(AbortCode::ValueRangeExceeded)
        } else {
            Ok(())
        }
    }

    fn map_count_gate(current: Option<Comm>, new_count: u32) -> Result<(), AbortCode> {
        let enabled = current.map(|c| c.is_valid()).unwrap_or(false);
        if enabled && new_count != 0 {
            Err(AbortCode::ValueRangeExceeded)
        } else {
            Ok(())
        }
    }

    /// Mirrors a just-written OD communication/mapping record into the live
    /// PDO engine state. A no-op for any index outside the four PDO ranges.
    fn sync_pdo_config(&mut self, index: u16) {
        if TPDO_COMM_RANGE.contains(&index) {
            self.sync_tpdo_comm((index - TPDO_COMM_RANGE.start) as usize);
        } else if TPDO_MAP_RANGE.contains(&index) {
            self.sync_tpdo_map((index - TPDO_MAP_RANGE.start) as usize);
        } else if RPDO_COMM_RANGE.contains(&index) {
            self.sync_rpdo_comm((index - RPDO_COMM_RANGE.start) as usize);
        } else if RPDO_MAP_RANGE.contains(&index) {
            self.sync_rpdo_map((index - RPDO_MAP_RANGE.start) as usize);
        }
    }

    fn sync_tpdo_comm(&mut self, slot: usize) {
        if slot >= self.pdo.tpdos.len() {
            return;
        }
        let comm_index = TPDO_COMM_RANGE.start + slot as u16;
        let Ok(cob_id_raw) = self.od.read_value(comm_index, 1).map(|v| v as u32) else { return };
        let transmission_type = self.od.read_value(comm_index, 2).map(|v| v as u8).unwrap_or(0xFF);
        let inhibit_time_100us = self.od.read_value(comm_index, 3).map(|v| v as u16).unwrap_or(0);
        let event_timer_ms = self.od.read_value(comm_index, 5).map(|v| v as u16).unwrap_or(0);
        let comm = Comm { cob_id_raw, transmission_type, inhibit_time_100us, event_timer_ms };
        match &mut self.pdo.tpdos[slot] {
            Some(tpdo) => tpdo.comm = comm,
            None => self.pdo.tpdos[slot] = Some(TpdoSlot { comm, map: Map::default() }),
        }
        self.rearm_tpdo_event_timer(slot);
    }

    /// Cancels any previous event-timer for `slot` and, if the TPDO is
    /// enabled, event-capable (transmission type 0xFE/0xFF) and has a
    /// nonzero event timer, arms a periodic one: it fires a coalesced
    /// transmission every `event_timer_ms` regardless of intervening writes
    /// (CiA 301 §7.3.5, object 0x1800 sub-index 5).
    fn rearm_tpdo_event_timer(&mut self, slot: usize) {
        if slot >= CO_TPDO_N {
            return;
        }
        if let Some(handle) = self.tpdo_event_handles[slot].take() {
            let _ = self.wheel.cancel(handle);
        }
        let Some(tpdo) = self.pdo.tpdos.get(slot).and_then(|s| s.as_ref()) else { return };
        let event_capable = matches!(tpdo.comm.transmission_type, 0xFE | 0xFF);
        if tpdo.comm.is_valid() && event_capable && tpdo.comm.event_timer_ms > 0 {
            let period = tpdo.comm.event_timer_ms as u32;
            self.tpdo_event_handles[slot] = self.wheel.create(Action::TpdoEvent { tpdo: slot as u8 }, period, Some(period)).ok();
        }
    }

    fn sync_rpdo_comm(&mut self, slot: usize) {
        if slot >= self.pdo.rpdos.len() {
            return;
        }
        let comm_index = RPDO_COMM_RANGE.start + slot as u16;
        let Ok(cob_id_raw) = self.od.read_value(comm_index, 1).map(|v| v as u32) else { return };
        let transmission_type = self.od.read_value(comm_index, 2).map(|v| v as u8).unwrap_or(0xFF);
        let comm = Comm { cob_id_raw, transmission_type, inhibit_time_100us: 0, event_timer_ms: 0 };
        match &mut self.pdo.rpdos[slot] {
            Some(rpdo) => rpdo.comm = comm,
            None => self.pdo.rpdos[slot] = Some(RpdoSlot { comm, map: Map::default(), cached: [0; 8], cached_len: 0 }),
        }
    }

    fn sync_tpdo_map(&mut self, slot: usize) {
        if slot >= self.pdo.tpdos.len() || self.pdo.tpdos[slot].is_none() {
            return;
        }
        let map_index = TPDO_MAP_RANGE.start + slot as u16;
        let Ok(count) = self.od.read_value(map_index, 0).map(|v| v as u8) else { return };
        let map = self.build_map(map_index, count);
        if let Some(tpdo) = &mut self.pdo.tpdos[slot] {
            tpdo.map = map;
        }
    }

    fn sync_rpdo_map(&mut self, slot: usize) {
        if slot >= self.pdo.rpdos.len() || self.pdo.rpdos[slot].is_none() {
            return;
        }
        let map_index = RPDO_MAP_RANGE.start + slot as u16;
        let Ok(count) = self.od.read_value(map_index, 0).map(|v| v as u8) else { return };
        let map = self.build_map(map_index, count);
        if let Some(rpdo) = &mut self.pdo.rpdos[slot] {
            rpdo.map = map;
        }
    }

    /// Rebuilds a mapping table from its OD mapping-record sub-indices
    /// (CiA 301 §7.3.7): each entry must exist and be PDO-mappable, and the
    /// total bit length must not exceed 64. On any failure the count at
    /// `map_index` sub-index 0 is written back to zero, per spec.
    fn build_map(&mut self, map_index: u16, count: u8) -> Map {
        if count == 0 {
            return Map::default();
        }
        let mut total_bits = 0u32;
        let mut entries = [(0u16, 0u8, 0u8); CO_PDO_MAX_MAPPED_ENTRIES];
        let n = (count as usize).min(CO_PDO_MAX_MAPPED_ENTRIES);
        for sub in 1..=n as u8 {
            let Ok(raw) = self.od.read_value(map_index, sub).map(|v| v as u32) else {
                return self.revert_map_count(map_index);
            };
            let entry_index = (raw >> 16) as u16;
            let entry_sub = ((raw >> 8) & 0xFF) as u8;
            let bits = (raw & 0xFF) as u8;
            let Ok(entry) = self.od.find(entry_index, entry_sub) else {
                return self.revert_map_count(map_index);
            };
            if !entry.is_pdo_mappable() {
                return self.revert_map_count(map_index);
            }
            total_bits += bits as u32;
            entries[(sub - 1) as usize] = (entry_index, entry_sub, bits);
        }
        if total_bits > 64 {
            return self.revert_map_count(map_index);
        }
        Map { count: n as u8, entries }
    }

    fn revert_map_count(&mut self, map_index: u16) -> Map {
        let _ = self.od.write_value(map_index, 0, 0);
        error!("PDO mapping at {:#06x} failed validation, reverted count to 0", map_index);
        Map::default()
    }

    fn after_parameter_write(&mut self, index: u16) {
        match index {
            IDX_STORE_PARAMETERS => {
                if self.od.read_value(IDX_STORE_PARAMETERS, 1).map(|v| v as u32) == Ok(SAVE_COMMAND_SIGNATURE) {
                    if let Err(err) = self.store_parameters() {
                        error!("parameter store failed: {:?}", err);
                    }
                }
            }
            IDX_RESTORE_DEFAULT_PARAMETERS => {
                if self.od.read_value(IDX_RESTORE_DEFAULT_PARAMETERS, 1).map(|v| v as u32) == Ok(LOAD_COMMAND_SIGNATURE) {
                    if let Err(err) = self.restore_defaults() {
                        error!("parameter restore failed: {:?}", err);
                    }
                }
            }
            _ => {}
        }
    }

    /// Persists every `TypeKind::ParamGroup` entry's current bytes to `nvm`
    /// (CiA 301 object 0x1010: "save").
    fn store_parameters(&mut self) -> Result<(), ErrorCode> {
        for entry in self.od.entries() {
            if let TypeKind::ParamGroup { group } = entry.kind {
                let mut buf = [0u8; OD_PARAM_GROUP_MAX];
                let len = self.od.read_buffer(entry.key.index(), entry.key.sub_index(), &mut buf)?;
                self.nvm.store(group, &buf[..len]).map_err(|_| ErrorCode::IfInit)?;
            }
        }
        Ok(())
    }

    /// Erases every persisted parameter group so the next boot falls back to
    /// compiled-in defaults (CiA 301 object 0x1011: "load").
    fn restore_defaults(&mut self) -> Result<(), ErrorCode> {
        for entry in self.od.entries() {
            if let TypeKind::ParamGroup { group } = entry.kind {
                self.nvm.clear(group).map_err(|_| ErrorCode::IfInit)?;
            }
        }
        Ok(())
    }

    /// Loads any previously saved parameter groups into the object
    /// dictionary. A group with nothing stored (`Ok(0)`) is left at its
    /// compiled-in default.
    fn load_persisted_parameters(&mut self) {
        for entry in self.od.entries() {
            if let TypeKind::ParamGroup { group } = entry.kind {
                let mut buf = [0u8; OD_PARAM_GROUP_MAX];
                match self.nvm.load(group, &mut buf) {
                    Ok(len) if len > 0 => {
                        if let Err(err) = self.od.write_buffer(entry.key.index(), entry.key.sub_index(), &buf[..len]) {
                            error!("failed to restore persisted parameter group {}: {:?}", group, err);
                        }
                    }
                    Ok(_) => {}
                    Err(err) => error!("failed to load persisted parameter group {}: {:?}", group, err),
                }
            }
        }
    }

    fn on_sdo_response(&mut self, cob_id: u16, data: &[u8]) {
        let client = &mut self.sdo_clients[0];
        if client.is_idle() || cob_id != client.response_cob_id() {
            return;
        }
        let request_cob_id = client.request_cob_id();
        match client.on_frame(data) {
            Ok(Progress::Continue { request }) => self.reply_ok(request_cob_id, request),
            Ok(Progress::UploadDone { data, len }) => self.client_result = Some(SdoClientResult::Upload { data, len }),
            Ok(Progress::DownloadDone) => self.client_result = Some(SdoClientResult::Download),
            Err(abort) => self.client_result = Some(SdoClientResult::Aborted(abort)),
        }
    }

    /// Starts reading `(index, sub_index)` on `server_node_id` through this
    /// node's single SDO client, transmitting the initiate-upload request.
    pub fn sdo_read(&mut self, server_node_id: u8, index: u16, sub_index: u8) -> Result<(), ErrorCode> {
        let request = self.sdo_clients[0].start_upload(server_node_id, index, sub_index)?;
        let cob_id = self.sdo_clients[0].request_cob_id();
        self.reply_ok(cob_id, request);
        Ok(())
    }

    /// Starts writing `data` to `(index, sub_index)` on `server_node_id`
    /// through this node's single SDO client.
    pub fn sdo_write(&mut self, server_node_id: u8, index: u16, sub_index: u8, data: &[u8]) -> Result<(), ErrorCode> {
        let request = self.sdo_clients[0].start_download(server_node_id, index, sub_index, data)?;
        let cob_id = self.sdo_clients[0].request_cob_id();
        self.reply_ok(cob_id, request);
        Ok(())
    }
}
