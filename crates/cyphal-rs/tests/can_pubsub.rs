//! Publish/subscribe over the virtual CAN bus.

mod simulator;

use simulator::{run_for, LargeBlob, SmallBlob, TestRecord, VirtualCanBus};

use cyphal_rs::frame::{CanId, TailByte};
use cyphal_rs::hal::{CanMedia, MediaError};
use cyphal_rs::presentation::{Options, Presentation};
use cyphal_rs::time::{Duration, ManualClock, TimePoint};
use cyphal_rs::transport::can::CanTransport;
use cyphal_rs::transport::{Config, Transport};
use cyphal_rs::{Executor, NodeId};
use simulator::interface::SimulatedCanMedia;
use std::cell::RefCell;
use std::rc::Rc;

struct Node {
    presentation: Presentation,
    transport: Rc<CanTransport>,
    media: Rc<RefCell<SimulatedCanMedia>>,
}

fn make_node(
    bus: &VirtualCanBus,
    executor: &Executor,
    clock: &ManualClock,
    node_id: Option<u16>,
) -> Node {
    let media = bus.attach(executor, clock, 8);
    let media_dyn: Rc<RefCell<dyn CanMedia>> = media.clone();
    let transport = Rc::new(
        CanTransport::new(executor, vec![media_dyn], node_id.map(NodeId), Config::default())
            .unwrap(),
    );
    let presentation = Presentation::new(executor, transport.clone(), Options::default());
    Node { presentation, transport, media }
}

fn setup() -> (VirtualCanBus, Executor, ManualClock) {
    let _ = env_logger::builder().is_test(true).try_init();
    let clock = ManualClock::new();
    let executor = Executor::with_clock(Rc::new(clock.clone()));
    (VirtualCanBus::new(), executor, clock)
}

fn soon(clock: &ManualClock) -> TimePoint {
    use cyphal_rs::Clock;
    clock.now() + Duration::from_secs(1)
}

#[test]
fn test_single_frame_publish_wire_format() {
    let (bus, executor, clock) = setup();
    let node = make_node(&bus, &executor, &clock, Some(0x2A));

    let publisher = node.presentation.make_publisher::<LargeBlob>(0x123).unwrap();
    publisher.publish(&LargeBlob(vec![0xDE, 0xAD]), soon(&clock)).unwrap();
    run_for(&executor, &clock, Duration::from_millis(1));

    let log = bus.frame_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].can_id, 0x1061_232A);
    assert_eq!(log[0].data, [0xDE, 0xAD, 0xE0]);
}

#[test]
fn test_message_round_trip() {
    let (bus, executor, clock) = setup();
    let sender = make_node(&bus, &executor, &clock, Some(0x2A));
    let receiver = make_node(&bus, &executor, &clock, Some(0x2B));

    let received = Rc::new(RefCell::new(Vec::new()));
    let _subscriber = receiver
        .presentation
        .make_subscriber::<TestRecord, _>(0x123, {
            let received = received.clone();
            move |message| received.borrow_mut().push(message)
        })
        .unwrap();

    let publisher = sender.presentation.make_publisher::<TestRecord>(0x123).unwrap();
    let record = TestRecord { counter: 7, blob: vec![1, 2, 3] };
    publisher.publish(&record, soon(&clock)).unwrap();
    run_for(&executor, &clock, Duration::from_millis(1));

    let received = received.borrow();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].message, record);
    assert_eq!(received[0].source, Some(NodeId(0x2A)));
    assert_eq!(received[0].metadata.transfer_id, 0);
}

#[test]
fn test_multi_frame_round_trip() {
    let (bus, executor, clock) = setup();
    let sender = make_node(&bus, &executor, &clock, Some(1));
    let receiver = make_node(&bus, &executor, &clock, Some(2));

    let received = Rc::new(RefCell::new(Vec::new()));
    let _subscriber = receiver
        .presentation
        .make_subscriber::<LargeBlob, _>(0x55, {
            let received = received.clone();
            move |message| received.borrow_mut().push(message.message)
        })
        .unwrap();

    let payload: Vec<u8> = (0u8..15).collect();
    let publisher = sender.presentation.make_publisher::<LargeBlob>(0x55).unwrap();
    publisher.publish(&LargeBlob(payload.clone()), soon(&clock)).unwrap();
    run_for(&executor, &clock, Duration::from_millis(1));

    // 15 bytes at MTU 8 travel as three frames.
    assert_eq!(bus.frame_log().len(), 3);
    let tails: Vec<TailByte> =
        bus.frame_log().iter().map(|f| TailByte::from(*f.data.last().unwrap())).collect();
    assert!(tails[0].sot() && !tails[0].eot());
    assert!(!tails[1].sot() && !tails[1].eot());
    assert!(!tails[2].sot() && tails[2].eot());

    assert_eq!(*received.borrow(), [LargeBlob(payload)]);
}

#[test]
fn test_extent_truncates_oversized_transfer() {
    let (bus, executor, clock) = setup();
    let sender = make_node(&bus, &executor, &clock, Some(1));
    let receiver = make_node(&bus, &executor, &clock, Some(2));

    let received = Rc::new(RefCell::new(Vec::new()));
    let _subscriber = receiver
        .presentation
        .make_subscriber::<SmallBlob, _>(9, {
            let received = received.clone();
            move |message| received.borrow_mut().push(message.message)
        })
        .unwrap();

    let payload: Vec<u8> = (10u8..22).collect();
    let publisher = sender.presentation.make_publisher::<LargeBlob>(9).unwrap();
    publisher.publish(&LargeBlob(payload.clone()), soon(&clock)).unwrap();
    run_for(&executor, &clock, Duration::from_millis(1));

    // The subscription extent (8 bytes) bounds what is delivered.
    assert_eq!(*received.borrow(), [SmallBlob(payload[..8].to_vec())]);
}

#[test]
fn test_subscribers_share_one_session() {
    let (bus, executor, clock) = setup();
    let sender = make_node(&bus, &executor, &clock, Some(1));
    let receiver = make_node(&bus, &executor, &clock, Some(2));

    let first = Rc::new(RefCell::new(0u32));
    let second = Rc::new(RefCell::new(0u32));
    let subscriber_a = receiver
        .presentation
        .make_subscriber::<TestRecord, _>(3, {
            let first = first.clone();
            move |_| *first.borrow_mut() += 1
        })
        .unwrap();
    let _subscriber_b = receiver
        .presentation
        .make_subscriber::<TestRecord, _>(3, {
            let second = second.clone();
            move |_| *second.borrow_mut() += 1
        })
        .unwrap();

    let publisher = sender.presentation.make_publisher::<TestRecord>(3).unwrap();
    publisher.publish(&TestRecord::default(), soon(&clock)).unwrap();
    run_for(&executor, &clock, Duration::from_millis(1));
    assert_eq!((*first.borrow(), *second.borrow()), (1, 1));

    // Dropping one facade leaves the shared session working.
    drop(subscriber_a);
    publisher.publish(&TestRecord::default(), soon(&clock)).unwrap();
    run_for(&executor, &clock, Duration::from_millis(1));
    assert_eq!((*first.borrow(), *second.borrow()), (1, 2));
}

#[test]
fn test_publishers_share_transfer_id_counter() {
    let (bus, executor, clock) = setup();
    let node = make_node(&bus, &executor, &clock, Some(1));

    let publisher_a = node.presentation.make_publisher::<SmallBlob>(4).unwrap();
    let publisher_b = node.presentation.make_publisher::<SmallBlob>(4).unwrap();
    publisher_a.publish(&SmallBlob(vec![1]), soon(&clock)).unwrap();
    publisher_b.publish(&SmallBlob(vec![2]), soon(&clock)).unwrap();
    publisher_a.publish(&SmallBlob(vec![3]), soon(&clock)).unwrap();
    run_for(&executor, &clock, Duration::from_millis(1));

    let tids: Vec<u8> = bus
        .frame_log()
        .iter()
        .map(|f| TailByte::from(*f.data.last().unwrap()).transfer_id())
        .collect();
    assert_eq!(tids, [0, 1, 2]);
}

#[test]
fn test_anonymous_publisher() {
    let (bus, executor, clock) = setup();
    let sender = make_node(&bus, &executor, &clock, None);
    let receiver = make_node(&bus, &executor, &clock, Some(2));

    let sources = Rc::new(RefCell::new(Vec::new()));
    let _subscriber = receiver
        .presentation
        .make_subscriber::<SmallBlob, _>(6, {
            let sources = sources.clone();
            move |message| sources.borrow_mut().push(message.source)
        })
        .unwrap();

    let publisher = sender.presentation.make_publisher::<SmallBlob>(6).unwrap();
    publisher.publish(&SmallBlob(vec![1, 2]), soon(&clock)).unwrap();
    run_for(&executor, &clock, Duration::from_millis(1));
    assert_eq!(*sources.borrow(), [None]);

    // Anonymous transfers cannot span frames.
    let oversized = LargeBlob(vec![0; 20]);
    let publisher = sender.presentation.make_publisher::<LargeBlob>(7).unwrap();
    assert!(publisher.publish(&oversized, soon(&clock)).is_err());
}

#[test]
fn test_expired_deadline_is_accepted_then_dropped() {
    let (bus, executor, clock) = setup();
    let node = make_node(&bus, &executor, &clock, Some(1));
    clock.advance(Duration::from_secs(1));

    let publisher = node.presentation.make_publisher::<SmallBlob>(4).unwrap();
    let past = TimePoint::from_micros(0);
    publisher.publish(&SmallBlob(vec![1]), past).unwrap();
    run_for(&executor, &clock, Duration::from_millis(1));

    assert!(bus.frame_log().is_empty());
    assert_eq!(node.transport.counters().tx_frames_expired, 1);
}

#[test]
fn test_busy_media_retried_on_ready() {
    let (bus, executor, clock) = setup();
    let node = make_node(&bus, &executor, &clock, Some(1));
    node.media.borrow().set_busy(true);

    let publisher = node.presentation.make_publisher::<SmallBlob>(4).unwrap();
    publisher.publish(&SmallBlob(vec![5]), soon(&clock)).unwrap();
    run_for(&executor, &clock, Duration::from_millis(1));
    assert!(bus.frame_log().is_empty());

    node.media.borrow().set_busy(false);
    node.media.borrow().notify_ready_to_push();
    run_for(&executor, &clock, Duration::from_millis(1));
    assert_eq!(bus.frame_log().len(), 1);
}

#[test]
fn test_push_failure_drops_and_counts() {
    let (bus, executor, clock) = setup();
    let node = make_node(&bus, &executor, &clock, Some(1));
    node.media.borrow().set_push_failure(Some(MediaError::new(5)));

    let publisher = node.presentation.make_publisher::<SmallBlob>(4).unwrap();
    publisher.publish(&SmallBlob(vec![5]), soon(&clock)).unwrap();
    run_for(&executor, &clock, Duration::from_millis(1));

    assert!(bus.frame_log().is_empty());
    assert_eq!(node.transport.counters().tx_media_failures, 1);
}

#[test]
fn test_filter_derivation_follows_sessions() {
    let (bus, executor, clock) = setup();
    let node = make_node(&bus, &executor, &clock, Some(9));

    assert!(node.media.borrow().filters().is_empty());

    let subscriber_a = node
        .presentation
        .make_subscriber::<TestRecord, _>(5, |_| {})
        .unwrap();
    let _subscriber_b = node
        .presentation
        .make_subscriber::<TestRecord, _>(6, |_| {})
        .unwrap();
    let filters = node.media.borrow().filters();
    assert_eq!(filters.len(), 2);
    assert!(filters.contains(&CanId::filter_for_subject(5)));
    assert!(filters.contains(&CanId::filter_for_subject(6)));

    let _server = node
        .presentation
        .make_server::<SmallBlob, SmallBlob, _>(0x17, |request| request.message)
        .unwrap();
    let filters = node.media.borrow().filters();
    assert_eq!(filters.len(), 3);
    assert!(filters.contains(&CanId::filter_for_services(NodeId(9))));

    drop(subscriber_a);
    let filters = node.media.borrow().filters();
    assert_eq!(filters.len(), 2);
    assert!(!filters.contains(&CanId::filter_for_subject(5)));
}

#[test]
fn test_filter_failure_retried_periodically() {
    let (bus, executor, clock) = setup();
    let node = make_node(&bus, &executor, &clock, Some(9));
    node.media.borrow().set_filter_failure(Some(MediaError::new(22)));

    let _subscriber = node
        .presentation
        .make_subscriber::<TestRecord, _>(5, |_| {})
        .unwrap();
    assert!(node.media.borrow().filters().is_empty());

    // The transport keeps retrying on its periodic tick.
    node.media.borrow().set_filter_failure(None);
    run_for(&executor, &clock, Duration::from_millis(1100));
    assert_eq!(node.media.borrow().filters(), vec![CanId::filter_for_subject(5)]);
}

#[test]
fn test_redundant_media_deduplicated() {
    let (bus, executor, clock) = setup();
    // The sender drives two interfaces attached to the same bus.
    let media_a: Rc<RefCell<dyn CanMedia>> = bus.attach(&executor, &clock, 8);
    let media_b: Rc<RefCell<dyn CanMedia>> = bus.attach(&executor, &clock, 8);
    let transport = Rc::new(
        CanTransport::new(&executor, vec![media_a, media_b], Some(NodeId(1)), Config::default())
            .unwrap(),
    );
    let sender = Presentation::new(&executor, transport, Options::default());
    let receiver = make_node(&bus, &executor, &clock, Some(2));

    let count = Rc::new(RefCell::new(0u32));
    let _subscriber = receiver
        .presentation
        .make_subscriber::<SmallBlob, _>(4, {
            let count = count.clone();
            move |_| *count.borrow_mut() += 1
        })
        .unwrap();

    let publisher = sender.make_publisher::<SmallBlob>(4).unwrap();
    publisher.publish(&SmallBlob(vec![1]), soon(&clock)).unwrap();
    run_for(&executor, &clock, Duration::from_millis(1));

    // One copy per interface on the wire, a single delivery to the user.
    assert_eq!(bus.frame_log().len(), 2);
    assert_eq!(*count.borrow(), 1);
    assert_eq!(receiver.transport.counters().rx_duplicates, 1);
}

#[test]
fn test_duplicate_rx_session_rejected_at_transport() {
    let (bus, executor, clock) = setup();
    let node = make_node(&bus, &executor, &clock, Some(9));

    use cyphal_rs::hal::CyphalError;
    use cyphal_rs::transport::MessageRxParams;
    let _first = node
        .transport
        .make_message_rx_session(MessageRxParams { extent_bytes: 8, subject_id: 5 })
        .unwrap();
    let second =
        node.transport.make_message_rx_session(MessageRxParams { extent_bytes: 8, subject_id: 5 });
    assert!(matches!(second.err(), Some(CyphalError::AlreadyExists)));
}
