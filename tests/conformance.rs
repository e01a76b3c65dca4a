//! Black-box conformance tests driving a `Node` purely through CAN frames,
//! via the external `support::mock` HAL, one test per scenario this stack
//! is meant to get right.

mod support;

use canopen_rs::constant::PDO_COB_ID_VALID_BIT;
use canopen_rs::nmt::State;
use canopen_rs::od::{Entry, FLAG_ASYNC_NOTIFY, FLAG_PDO_MAPPABLE, FLAG_READ_ONLY, TypeKind};
use canopen_rs::Node;
use embedded_can::Frame as _;
use support::mock::{MockCan, MockClock, MockNvm, MockTimer};

type TestNode<'a> = Node<'a, support::mock::MockFrame, MockCan, MockTimer, MockNvm>;

fn build(node_id: u8, entries: &'static [Entry]) -> (TestNode<'static>, support::mock::MockBus, MockClock) {
    let can = MockCan::new();
    let bus = can.bus();
    let timer = MockTimer::new();
    let clock = timer.clock();
    let node = Node::new(node_id, entries, can, timer, MockNvm::new());
    (node, bus, clock)
}

#[test]
fn expedited_upload_of_a_u32_entry() {
    static ENTRIES: &[Entry] = &[Entry::scalar(0x1000, 0, 0, TypeKind::U32, 0x00020191)];
    let (mut node, bus, _timer) = build(5, ENTRIES);
    node.start();

    bus.push(0x605, &[0x40, 0x00, 0x10, 0x00, 0, 0, 0, 0]);
    node.process();

    let reply = bus.pop().expect("expedited upload reply");
    assert_eq!(reply.data(), &[0x43, 0x00, 0x10, 0x00, 0x91, 0x01, 0x02, 0x00]);
    assert!(bus.outbox_is_empty());
}

#[test]
fn segmented_download_of_ten_bytes_into_a_domain_entry() {
    static ENTRIES: &[Entry] = &[Entry::domain(0x2000, 0, 0)];
    let (mut node, bus, _timer) = build(5, ENTRIES);
    node.start();

    bus.push(0x605, &[0x21, 0x00, 0x20, 0x00, 0x0A, 0, 0, 0]);
    node.process();
    assert_eq!(bus.pop().unwrap().data(), &[0x60, 0x00, 0x20, 0x00, 0, 0, 0, 0]);

    bus.push(0x605, &[0x00, b'A', b'B', b'C', b'D', b'E', b'F', b'G']);
    node.process();
    assert_eq!(bus.pop().unwrap().data(), &[0x20, 0, 0, 0, 0, 0, 0, 0]);

    // Toggle bit flips to 1; 3 bytes used this time, so 4 are unused (n=4).
    bus.push(0x605, &[0x19, b'H', b'I', b'J', 0, 0, 0, 0]);
    node.process();
    assert_eq!(bus.pop().unwrap().data(), &[0x30, 0, 0, 0, 0, 0, 0, 0]);

    // Read the domain back through SDO upload and check it holds the exact bytes.
    bus.push(0x605, &[0x40, 0x00, 0x20, 0x00, 0, 0, 0, 0]);
    node.process();
    let initiate = bus.pop().unwrap();
    assert_eq!(initiate.data()[0], 0x41);
    assert_eq!(u32::from_le_bytes(initiate.data()[4..8].try_into().unwrap()), 10);

    bus.push(0x605, &[0x60, 0, 0, 0, 0, 0, 0, 0]);
    node.process();
    let seg1 = bus.pop().unwrap();
    assert_eq!(seg1.data(), &[0x00, b'A', b'B', b'C', b'D', b'E', b'F', b'G']);

    bus.push(0x605, &[0x70, 0, 0, 0, 0, 0, 0, 0]);
    node.process();
    let seg2 = bus.pop().unwrap();
    assert_eq!(seg2.data(), &[0x19, b'H', b'I', b'J', 0, 0, 0, 0]);
    assert!(bus.outbox_is_empty());
}

fn download_u32(index: u16, sub_index: u8, value: u32) -> [u8; 8] {
    let bytes = value.to_le_bytes();
    [0x23, (index & 0xFF) as u8, (index >> 8) as u8, sub_index, bytes[0], bytes[1], bytes[2], bytes[3]]
}

#[test]
fn pdo_mapping_write_is_rejected_while_tpdo_enabled() {
    static ENTRIES: &[Entry] = &[
        Entry::scalar(0x1017, 0, 0, TypeKind::U16, 0),
        Entry::scalar(0x1800, 1, 0, TypeKind::U32, 0x180), // enabled: valid bit clear
        Entry::scalar(0x1800, 2, 0, TypeKind::U8, 0xFF),
        Entry::scalar(0x1A00, 0, 0, TypeKind::U8, 0),
        Entry::scalar(0x1A00, 1, 0, TypeKind::U32, 0x6000_0108),
        Entry::scalar(0x6000, 1, FLAG_PDO_MAPPABLE, TypeKind::U8, 0),
    ];
    let (mut node, bus, _timer) = build(5, ENTRIES);
    node.start();

    bus.push(0x605, &download_u32(0x1A00, 0, 1));
    node.process();
    let reply = bus.pop().unwrap();
    assert_eq!(reply.data()[0], 0x80, "mapping-count write while enabled must abort with OBJ_RANGE");
    assert_eq!(u32::from_le_bytes(reply.data()[4..8].try_into().unwrap()), 0x0609_0030);

    // Disable the TPDO (set the COB-ID valid bit) then retry the same write.
    bus.push(0x605, &download_u32(0x1800, 1, 0x180 | PDO_COB_ID_VALID_BIT));
    node.process();
    assert_eq!(bus.pop().unwrap().data()[0], 0x60);

    bus.push(0x605, &download_u32(0x1A00, 0, 1));
    node.process();
    assert_eq!(bus.pop().unwrap().data()[0], 0x60, "mapping write must succeed once the TPDO is disabled");
    assert!(bus.outbox_is_empty());
}

#[test]
fn tpdo_event_coalesces_writes_within_the_inhibit_window() {
    static ENTRIES: &[Entry] = &[
        Entry::scalar(0x1017, 0, 0, TypeKind::U16, 0),
        Entry::scalar(0x6000, 1, FLAG_PDO_MAPPABLE | FLAG_ASYNC_NOTIFY, TypeKind::U8, 0),
        Entry::scalar(0x1800, 1, 0, TypeKind::U32, (0x180u64) | (PDO_COB_ID_VALID_BIT as u64)),
        Entry::scalar(0x1800, 2, 0, TypeKind::U8, 0xFF), // transmission type 255: event-driven
        Entry::scalar(0x1800, 3, 0, TypeKind::U16, 100), // inhibit time 100 * 100us = 10ms
        Entry::scalar(0x1800, 5, 0, TypeKind::U16, 0),
        Entry::scalar(0x1A00, 0, 0, TypeKind::U8, 1),
        Entry::scalar(0x1A00, 1, 0, TypeKind::U32, 0x6000_0108),
    ];
    let (mut node, bus, timer) = build(5, ENTRIES);
    node.start();
    bus.push(0, &[1, 0]); // NMT start, broadcast
    node.process();
    bus.clear_outbox();

    bus.push(0x605, &[0x2F, 0x00, 0x60, 1, 7, 0, 0, 0]);
    node.process();
    bus.pop(); // SDO reply
    let first = bus.pop().expect("write must trigger an immediate TPDO frame");
    assert_eq!(first.data(), &[7]);

    timer.advance(5);
    bus.push(0x605, &[0x2F, 0x00, 0x60, 1, 9, 0, 0, 0]);
    node.process();
    bus.pop(); // SDO reply
    assert!(bus.outbox_is_empty(), "a write inside the inhibit window must not transmit");

    timer.advance(5);
    node.process();
    let coalesced = bus.pop().expect("the latched event must fire once the inhibit window elapses");
    assert_eq!(coalesced.data(), &[9], "the coalesced frame carries the latest value, not the one that was latched");
    assert!(bus.outbox_is_empty());
}

#[test]
fn rpdo_is_dropped_before_operational_and_applied_after_nmt_start() {
    static ENTRIES: &[Entry] = &[
        Entry::scalar(0x1017, 0, 0, TypeKind::U16, 0),
        Entry::scalar(0x1400, 1, 0, TypeKind::U32, 0x201),
        Entry::scalar(0x1400, 2, 0, TypeKind::U8, 0xFF),
        Entry::scalar(0x1600, 0, 0, TypeKind::U8, 1),
        Entry::scalar(0x1600, 1, 0, TypeKind::U32, 0x6000_0108),
        Entry::scalar(0x6000, 1, FLAG_PDO_MAPPABLE, TypeKind::U8, 0),
    ];
    let (mut node, bus, _timer) = build(5, ENTRIES);
    node.start();
    assert_eq!(node.nmt_state(), State::PreOperational);

    bus.push(0x201, &[0x55]);
    node.process();
    bus.push(0x605, &[0x40, 0x00, 0x60, 1, 0, 0, 0, 0]);
    node.process();
    assert_eq!(bus.pop().unwrap().data()[4], 0, "RPDO must be dropped outside Operational");

    bus.push(0, &[1, 0]); // NMT start, broadcast
    node.process();
    bus.push(0x201, &[0x55]);
    node.process();
    bus.push(0x605, &[0x40, 0x00, 0x60, 1, 0, 0, 0, 0]);
    node.process();
    assert_eq!(bus.pop().unwrap().data()[4], 0x55, "once Operational the same frame updates the mapped entry");
}

#[test]
fn segmented_download_into_a_mapped_scalar_fires_a_tpdo_event() {
    static ENTRIES: &[Entry] = &[
        Entry::scalar(0x1017, 0, 0, TypeKind::U16, 0),
        Entry::scalar(0x6010, 1, FLAG_PDO_MAPPABLE | FLAG_ASYNC_NOTIFY, TypeKind::U32, 0),
        Entry::scalar(0x1800, 1, 0, TypeKind::U32, (0x180u64) | (PDO_COB_ID_VALID_BIT as u64)),
        Entry::scalar(0x1800, 2, 0, TypeKind::U8, 0xFF), // event-driven
        Entry::scalar(0x1800, 3, 0, TypeKind::U16, 0),   // no inhibit
        Entry::scalar(0x1800, 5, 0, TypeKind::U16, 0),
        Entry::scalar(0x1A00, 0, 0, TypeKind::U8, 1),
        Entry::scalar(0x1A00, 1, 0, TypeKind::U32, 0x6010_0120),
    ];
    let (mut node, bus, _timer) = build(5, ENTRIES);
    node.start();
    bus.push(0, &[1, 0]); // NMT start, broadcast
    node.process();
    bus.clear_outbox();

    // Segmented (non-expedited) download initiate: 4 bytes total.
    bus.push(0x605, &[0x21, 0x10, 0x60, 0x01, 0x04, 0, 0, 0]);
    node.process();
    assert_eq!(bus.pop().unwrap().data()[0], 0x60);

    // Only (and last) segment: c=1, n=3 unused bytes, toggle 0.
    bus.push(0x605, &[0x07, 0xAA, 0xBB, 0xCC, 0xDD, 0, 0, 0]);
    node.process();
    let reply = bus.pop().expect("segment reply");
    assert_eq!(reply.data()[0], 0x20, "last segment ack, toggle 0");

    let event = bus.pop().expect("the segmented write landing must fire a TPDO event, not just an expedited one");
    assert_eq!(event.data(), &[0xAA, 0xBB, 0xCC, 0xDD]);
    assert!(bus.outbox_is_empty());
}

#[test]
fn heartbeat_consumer_declared_in_the_dictionary_is_armed_at_boot() {
    static ENTRIES: &[Entry] = &[
        Entry::scalar(0x1017, 0, 0, TypeKind::U16, 0),
        Entry::scalar(0x1016, 1, 0, TypeKind::U32, (10u64 << 16) | 50), // watch node 10, 50ms
    ];
    let (mut node, bus, timer) = build(5, ENTRIES);
    node.start();

    bus.push(0x70A, &[0x05]); // heartbeat from node 10 (0x700 + 10)
    node.process();
    timer.advance(40);
    node.process();
    assert!(bus.outbox_is_empty(), "a heartbeat seen within the window must not raise anything");

    timer.advance(20); // 60ms since the last heartbeat, past the 50ms timeout
    node.process();
    let emcy = bus.pop().expect("a missed heartbeat from a dictionary-declared consumer must raise an EMCY");
    assert_eq!(emcy.data(), &[0x30, 0x81, 0x10, 0x0A, 0, 0, 0, 0], "0x8130 timeout code, communication-error bit, node 10");
    assert!(bus.outbox_is_empty());
}

#[test]
fn sdo_watchdog_aborts_a_stalled_segmented_upload() {
    static ENTRIES: &[Entry] = &[Entry::string(0x1008, 0, FLAG_READ_ONLY, "a string twenty-two bytes long")];
    let (mut node, bus, timer) = build(5, ENTRIES);
    node.start();

    bus.push(0x605, &[0x40, 0x08, 0x10, 0x00, 0, 0, 0, 0]);
    node.process();
    bus.clear_outbox();

    timer.advance(99);
    node.process();
    assert!(bus.outbox_is_empty(), "watchdog must not fire before 100ms");

    timer.advance(1);
    node.process();
    let abort = bus.pop().expect("watchdog abort frame expected at 100ms");
    assert_eq!(abort.data(), &[0x80, 0x08, 0x10, 0x00, 0x00, 0x00, 0x04, 0x05]);
    assert!(bus.outbox_is_empty());

    // The server must be idle again and accept a fresh transfer.
    bus.push(0x605, &[0x40, 0x08, 0x10, 0x00, 0, 0, 0, 0]);
    node.process();
    assert_eq!(bus.pop().unwrap().data()[0], 0x41);
}
