use std::{sync::Arc, time::Duration};

use assertables::assert_ok_eq_x;
use canmaster_client::{DictionaryEntry, PdoError, PdoEvent, PdoKind};
use integration_tests::prelude::*;

const NODE_ID: u8 = 2;

fn comm_record(index: u16, name: &str) -> DictionaryEntry {
    DictionaryEntry::Record(
        Record::new(index, name)
            .with_member(Variable::new(index, 1, "COB-ID", DataType::UInt32))
            .with_member(Variable::new(index, 2, "Transmission type", DataType::UInt8))
            .with_member(Variable::new(index, 5, "Event timer", DataType::UInt16)),
    )
}

fn map_record(index: u16, name: &str, entries: u8) -> DictionaryEntry {
    let mut record = Record::new(index, name).with_member(Variable::new(
        index,
        0,
        "Number of entries",
        DataType::UInt8,
    ));
    for sub in 1..=entries {
        record.add_member(Variable::new(
            index,
            sub,
            format!("Mapping {sub}"),
            DataType::UInt32,
        ));
    }
    DictionaryEntry::Record(record)
}

fn dictionary() -> ObjectDictionary {
    ObjectDictionary::new()
        .with_object(comm_record(0x1400, "RPDO1 communication"))
        .with_object(map_record(0x1600, "RPDO1 mapping", 3))
        .with_object(comm_record(0x1800, "TPDO1 communication"))
        .with_object(map_record(0x1A00, "TPDO1 mapping", 2))
        .with_object(Variable::new(0x6000, 0, "status", DataType::UInt8))
        .with_object(Variable::new(0x6001, 0, "speed", DataType::Int16))
        .with_object(Variable::new(0x6002, 0, "position", DataType::Int32))
        .with_object(Variable::new(0x6100, 0, "setpoint", DataType::UInt16))
}

fn load_device_mapping(device: &SimDevice) {
    device.set_object(0x1400, 1, &0x202u32.to_le_bytes());
    device.set_object(0x1400, 2, &[0xFF]);
    device.set_object(0x1400, 5, &100u16.to_le_bytes());
    device.set_object(0x1600, 0, &[3]);
    device.set_object(0x1600, 1, &0x6000_0008u32.to_le_bytes());
    // An empty entry, which is skipped
    device.set_object(0x1600, 2, &0x0000_0000u32.to_le_bytes());
    device.set_object(0x1600, 3, &0x6001_0010u32.to_le_bytes());

    device.set_object(0x1800, 1, &0x4000_0182u32.to_le_bytes());
    device.set_object(0x1800, 2, &[1]);
    device.set_object(0x1A00, 0, &[1]);
    device.set_object(0x1A00, 1, &0x6100_0010u32.to_le_bytes());
}

fn setup() -> (SimBus, Network, SimDevice, Arc<Node>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let bus = SimBus::new();
    let device = SimDevice::spawn(&bus, NODE_ID);
    load_device_mapping(&device);
    let network = start_network(&bus, NetworkConfig::default());
    let node = network.add_node(NODE_ID, dictionary()).unwrap();
    (bus, network, device, node)
}

#[tokio::test(start_paused = true)]
async fn test_banks_follow_dictionary() {
    let (_bus, _network, _device, node) = setup();
    assert_eq!(1, node.pdo().rx.len());
    assert_eq!(1, node.pdo().tx.len());
    let rx = node.pdo().rx.get(1).unwrap();
    assert_eq!(PdoKind::Receive, rx.kind());
    assert_eq!((0x1400, 0x1600), (rx.comm_index(), rx.map_index()));
    assert!(node.pdo().rx.get(2).is_none());
    // Nothing is known before the maps are configured
    assert_eq!(None, rx.cob_id());
}

#[tokio::test(start_paused = true)]
async fn test_configure_all() {
    let (_bus, _network, _device, node) = setup();
    node.pdo().configure_all().await.unwrap();

    let rx = node.pdo().rx.get(1).unwrap();
    assert_eq!(Some(0x202), rx.cob_id());
    assert!(rx.is_enabled());
    assert!(rx.rtr_allowed());
    assert_eq!(Some(0xFF), rx.transmission_type());
    assert_eq!(Some(100), rx.event_timer());
    let names: Vec<String> = rx.variables().iter().map(|v| v.name().to_string()).collect();
    assert_eq!(vec!["status", "speed"], names);
    assert_eq!(3, rx.data().len());
    let speed = rx.find_by_name("speed").unwrap();
    assert_eq!(Some(8), speed.offset());
    assert_eq!(Some(16), speed.pdo_bit_length());

    let tx = node.pdo().tx.get(1).unwrap();
    assert_eq!(Some(0x182), tx.cob_id());
    assert!(!tx.rtr_allowed());
    assert_eq!(Some(1), tx.transmission_type());
    // The event timer is only read for event driven transmission types
    assert_eq!(None, tx.event_timer());

    assert_eq!(
        Some(0x1800),
        node.pdo().find_by_name("setpoint").map(|m| m.comm_index())
    );
    assert_eq!(
        Some(0x1400),
        node.pdo().get("status").map(|m| m.comm_index())
    );
}

#[tokio::test(start_paused = true)]
async fn test_configure_unknown_mapped_object() {
    let (_bus, _network, device, node) = setup();
    device.set_object(0x1A00, 1, &0x7000_0008u32.to_le_bytes());
    let result = node.pdo().tx.get(1).unwrap().configure().await;
    assert!(matches!(result, Err(PdoError::Dictionary { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_received_frames_update_variables() {
    let (_bus, _network, device, node) = setup();
    node.pdo().configure_all().await.unwrap();
    let rx = node.pdo().rx.get(1).unwrap();
    let mut events = rx.subscribe();

    device.send(0x202, &[7, 0x34, 0x12]);
    settle().await;

    assert_ok_eq_x!(node.od().variable(0x6000, 0).unwrap().value(), Value::U8(7));
    assert_ok_eq_x!(
        node.od().variable(0x6001, 0).unwrap().value(),
        Value::I16(0x1234)
    );
    assert_eq!(vec![7, 0x34, 0x12], rx.data());
    let first = events.recv().await.unwrap();
    assert!(matches!(first, PdoEvent::Message(msg) if msg.data() == [7, 0x34, 0x12]));
    assert!(matches!(events.recv().await.unwrap(), PdoEvent::Changed(_)));

    // The same data again is a message, but not a change
    tokio::time::sleep(Duration::from_millis(50)).await;
    device.send(0x202, &[7, 0x34, 0x12]);
    settle().await;
    assert!(matches!(events.recv().await.unwrap(), PdoEvent::Message(_)));
    assert!(events.try_recv().is_err());
    assert_eq!(Some(55), rx.period());
    assert_eq!(vec![7, 0x34, 0x12], rx.previous_data());
}

#[tokio::test(start_paused = true)]
async fn test_device_transmit_updates_variables() {
    let (_bus, _network, device, node) = setup();
    node.pdo().configure_all().await.unwrap();
    let tx = node.pdo().tx.get(1).unwrap();
    let mut events = tx.subscribe();

    device.send(0x182, &[0xCD, 0xAB]);
    settle().await;

    assert_eq!(vec![0xCD, 0xAB], tx.data());
    assert_ok_eq_x!(
        node.od().variable(0x6100, 0).unwrap().value(),
        Value::U16(0xABCD)
    );
    assert!(matches!(events.recv().await.unwrap(), PdoEvent::Message(_)));
}

#[tokio::test(start_paused = true)]
async fn test_transmit() {
    let (bus, _network, _device, node) = setup();
    node.pdo().configure_all().await.unwrap();
    let mut logger = BusLogger::new(bus.new_receiver());

    let tx = node.pdo().tx.get(1).unwrap();
    tx.variable(0)
        .unwrap()
        .set_value(&Value::U16(0xABCD))
        .unwrap();
    tx.transmit().await.unwrap();
    settle().await;

    let frames = logger.take();
    assert_eq!(1, frames.len());
    assert_eq!(CanId::std(0x182), frames[0].id());
    assert_eq!(&[0xCD, 0xAB], frames[0].data());
}

#[tokio::test(start_paused = true)]
async fn test_unconfigured_map_cannot_transmit() {
    let (_bus, _network, _device, node) = setup();
    let tx = node.pdo().tx.get(1).unwrap();
    assert_eq!(
        Err(PdoError::NotConfigured { number: 1 }),
        tx.transmit().await
    );
    assert_eq!(
        Err(PdoError::NotConfigured { number: 1 }),
        tx.start(Duration::from_millis(100))
    );
}

#[tokio::test(start_paused = true)]
async fn test_publish() {
    let (_bus, _network, device, node) = setup();
    node.pdo().configure_all().await.unwrap();
    let rx = node.pdo().rx.get(1).unwrap();
    rx.clear();
    rx.add_variable(0x6002, 0, None).unwrap();
    rx.set_transmission_type(1);

    let before = device.requests().len();
    rx.publish().await.unwrap();
    assert_eq!(4, rx.data().len());

    let writes: Vec<(u16, u8, Vec<u8>)> = device.requests()[before..]
        .iter()
        .map(|r| {
            let d = r.data();
            let size = 4 - ((d[0] >> 2) & 0x3) as usize;
            (u16::from_le_bytes([d[1], d[2]]), d[3], d[4..4 + size].to_vec())
        })
        .collect();
    let expected = vec![
        (0x1400, 1, 0x8000_0202u32.to_le_bytes().to_vec()),
        (0x1400, 2, vec![1]),
        (0x1400, 5, 100u16.to_le_bytes().to_vec()),
        (0x1600, 0, vec![0]),
        (0x1600, 1, 0x6002_0020u32.to_le_bytes().to_vec()),
        (0x1600, 0, vec![1]),
        (0x1400, 1, 0x202u32.to_le_bytes().to_vec()),
    ];
    assert_eq!(expected, writes);
    assert_eq!(Some(vec![1]), device.object(0x1600, 0));
}

#[tokio::test(start_paused = true)]
async fn test_publish_disabled_map_stays_disabled() {
    let (_bus, _network, device, node) = setup();
    node.pdo().configure_all().await.unwrap();
    let tx = node.pdo().tx.get(1).unwrap();
    tx.set_enabled(false);

    tx.publish().await.unwrap();
    assert_eq!(
        Some(0xC000_0182u32.to_le_bytes().to_vec()),
        device.object(0x1800, 1)
    );
}

#[tokio::test(start_paused = true)]
async fn test_periodic_transmit() {
    let (bus, _network, _device, node) = setup();
    node.pdo().configure_all().await.unwrap();
    let mut logger = BusLogger::new(bus.new_receiver());
    let tx = node.pdo().tx.get(1).unwrap();

    tx.start(Duration::from_millis(100)).unwrap();
    tokio::time::sleep(Duration::from_millis(350)).await;
    tx.stop();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let frames: Vec<_> = logger
        .take()
        .into_iter()
        .filter(|m| m.id() == CanId::std(0x182))
        .collect();
    assert_eq!(4, frames.len());
}

#[tokio::test(start_paused = true)]
async fn test_removed_node_stops_listening() {
    let (_bus, network, device, node) = setup();
    node.pdo().configure_all().await.unwrap();
    network.remove_node(NODE_ID);

    device.send(0x202, &[9, 0, 0]);
    settle().await;
    assert_eq!(vec![0, 0, 0], node.pdo().rx.get(1).unwrap().data());
}
