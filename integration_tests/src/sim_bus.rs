use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use canmaster_common::messages::CanMessage;
use canmaster_common::traits::{AsyncCanReceiver, AsyncCanSender};

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

struct Port {
    id: usize,
    tx: UnboundedSender<CanMessage>,
}

/// An in-memory CAN bus
///
/// Every frame sent is delivered to every receiver, except the receiver paired with the sending
/// port, the way a CAN controller does not receive its own frames.
#[derive(Clone, Default)]
pub struct SimBus {
    ports: Arc<Mutex<Vec<Port>>>,
    next_port: Arc<Mutex<usize>>,
    fail_sends: Arc<AtomicBool>,
}

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_port(&self) -> (usize, SimBusReceiver) {
        let mut next = self.next_port.lock().unwrap();
        let id = *next;
        *next += 1;
        let (tx, rx) = unbounded_channel();
        self.ports.lock().unwrap().push(Port { id, tx });
        (id, SimBusReceiver { channel_rx: rx })
    }

    /// Create a connected sender and receiver, like one CAN controller
    pub fn new_port(&self) -> (SimBusSender, SimBusReceiver) {
        let (id, rx) = self.add_port();
        let tx = SimBusSender {
            port: Some(id),
            bus: self.clone(),
        };
        (tx, rx)
    }

    /// Create a receiver which sees every frame, e.g. for a test listener
    pub fn new_receiver(&self) -> SimBusReceiver {
        self.add_port().1
    }

    /// Create a sender not paired with any receiver
    pub fn new_sender(&self) -> SimBusSender {
        SimBusSender {
            port: None,
            bus: self.clone(),
        }
    }

    /// Make every send fail until cleared
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::Relaxed);
    }

    fn deliver(&self, from: Option<usize>, msg: CanMessage) -> Result<(), CanMessage> {
        if self.fail_sends.load(Ordering::Relaxed) {
            return Err(msg);
        }
        for port in self.ports.lock().unwrap().iter() {
            if Some(port.id) != from {
                // Receivers which have been dropped just miss the frame
                port.tx.send(msg).ok();
            }
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct SimBusSender {
    port: Option<usize>,
    bus: SimBus,
}

impl SimBusSender {
    /// Send without awaiting
    pub fn send_now(&self, msg: CanMessage) -> Result<(), CanMessage> {
        self.bus.deliver(self.port, msg)
    }
}

impl AsyncCanSender for SimBusSender {
    type Error = CanMessage;

    async fn send(&mut self, msg: CanMessage) -> Result<(), CanMessage> {
        self.send_now(msg)
    }
}

pub struct SimBusReceiver {
    channel_rx: UnboundedReceiver<CanMessage>,
}

impl AsyncCanReceiver for SimBusReceiver {
    type Error = ();

    async fn recv(&mut self) -> Result<CanMessage, Self::Error> {
        self.channel_rx.recv().await.ok_or(())
    }

    fn try_recv(&mut self) -> Option<CanMessage> {
        self.channel_rx.try_recv().ok()
    }

    fn flush(&mut self) {
        while self.channel_rx.try_recv().is_ok() {}
    }
}
