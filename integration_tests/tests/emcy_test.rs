use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use canmaster_client::EmcyEvent;
use integration_tests::prelude::*;

const NODE_ID: u8 = 5;

fn setup() -> (SimBus, Network, SimDevice, Arc<Node>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let bus = SimBus::new();
    let device = SimDevice::spawn(&bus, NODE_ID);
    let network = start_network(&bus, NetworkConfig::default());
    let node = network.add_node(NODE_ID, ObjectDictionary::new()).unwrap();
    (bus, network, device, node)
}

#[tokio::test(start_paused = true)]
async fn test_emergency_is_recorded() {
    let (_bus, _network, device, node) = setup();
    let mut events = node.emcy().subscribe();
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = calls.clone();
    node.emcy().add_callback(Arc::new(move |event: &EmcyEvent| {
        assert_eq!(0x85, event.cob_id);
        calls_clone.fetch_add(1, Ordering::Relaxed);
    }));

    device.send_emcy(0x4210, 0x09, &[1, 2, 3, 4, 5]);
    settle().await;

    let active = node.emcy().active();
    assert_eq!(1, active.len());
    assert_eq!(0x4210, active[0].code);
    assert_eq!(0x09, active[0].register);
    assert_eq!([1, 2, 3, 4, 5], active[0].data);
    assert_eq!(Some("Temperature"), active[0].description());

    let event = events.recv().await.unwrap();
    assert_eq!(0x85, event.cob_id);
    assert_eq!(active[0], event.error);
    assert_eq!(1, calls.load(Ordering::Relaxed));
}

#[tokio::test(start_paused = true)]
async fn test_error_reset_clears_active() {
    let (_bus, _network, device, node) = setup();

    device.send_emcy(0x4210, 0x09, &[]);
    device.send_emcy(0x3100, 0x05, &[]);
    settle().await;
    assert_eq!(2, node.emcy().active().len());

    device.send_emcy(0x0000, 0x00, &[]);
    settle().await;
    assert!(node.emcy().active().is_empty());
    // The reset itself is logged
    let log = node.emcy().log();
    assert_eq!(3, log.len());
    assert!(log[2].is_reset());

    node.emcy().reset();
    assert!(node.emcy().log().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_short_frame_is_ignored() {
    let (_bus, _network, device, node) = setup();
    device.send(0x85, &[0x10, 0x00]);
    settle().await;
    assert!(node.emcy().log().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_other_nodes_emergencies_are_ignored() {
    let (bus, _network, _device, node) = setup();
    let other = SimDevice::spawn(&bus, NODE_ID + 1);
    other.send_emcy(0x5000, 0x01, &[]);
    settle().await;
    assert!(node.emcy().log().is_empty());
}
