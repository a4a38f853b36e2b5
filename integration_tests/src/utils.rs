#![allow(dead_code)]
use std::time::Duration;

use canmaster_client::{Network, NetworkConfig};
use canmaster_common::traits::AsyncCanReceiver;

use crate::sim_bus::{SimBus, SimBusReceiver};

/// Create a network on the bus and start its receive loop
pub fn start_network(bus: &SimBus, config: NetworkConfig) -> Network {
    let (tx, rx) = bus.new_port();
    let network = Network::with_config(tx, config);
    network.spawn(rx);
    network
}

/// Give spawned tasks a chance to process pending frames
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

/// Prints every frame seen on the bus when dropped, to help debug failing tests
pub struct BusLogger {
    rx: SimBusReceiver,
}

impl BusLogger {
    pub fn new(rx: SimBusReceiver) -> Self {
        Self { rx }
    }

    /// Take the frames received so far
    pub fn take(&mut self) -> Vec<canmaster_common::CanMessage> {
        let mut frames = Vec::new();
        while let Some(msg) = self.rx.try_recv() {
            frames.push(msg);
        }
        frames
    }

    pub fn print(&mut self) {
        println!("Bus message history");
        println!("-------------------");
        for msg in self.take() {
            println!("{} {:02X?}", msg.id(), msg.data());
        }
    }
}

impl Drop for BusLogger {
    fn drop(&mut self) {
        self.print();
    }
}
