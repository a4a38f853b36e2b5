//! A simulated CANopen device
//!
//! The device serves SDO uploads (expedited and segmented) and expedited downloads from a table
//! of raw object values, and can be told to misbehave in the ways the master must tolerate.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use canmaster_common::{
    messages::{CanId, CanMessage, NMT_CMD_ID},
    sdo::{
        AbortCode, ABORT, COMMAND_MASK, EXPEDITED, NO_MORE_DATA, REQUEST_DOWNLOAD,
        REQUEST_SEGMENT_UPLOAD, REQUEST_UPLOAD, RESPONSE_DOWNLOAD, RESPONSE_UPLOAD,
        SIZE_SPECIFIED, TOGGLE_BIT,
    },
    traits::AsyncCanReceiver,
    NodeId,
};

use crate::sim_bus::{SimBus, SimBusSender};

struct SegmentedUpload {
    data: Vec<u8>,
    pos: usize,
    segment: usize,
}

#[derive(Default)]
struct DeviceState {
    objects: BTreeMap<(u16, u8), Vec<u8>>,
    silent: HashSet<u16>,
    ignore_requests: usize,
    flip_toggle_at: Option<usize>,
    break_bus_after_flip: bool,
    break_bus: bool,
    declared_sizes: HashMap<(u16, u8), u32>,
    decoys: HashMap<u16, Vec<[u8; 8]>>,
    requests: Vec<CanMessage>,
    nmt_commands: Vec<[u8; 2]>,
    upload: Option<SegmentedUpload>,
}

struct DeviceInner {
    node_id: NodeId,
    bus: SimBus,
    sender: SimBusSender,
    state: Mutex<DeviceState>,
}

#[derive(Clone)]
pub struct SimDevice {
    inner: Arc<DeviceInner>,
}

fn header(command: u8, index: u16, sub: u8) -> [u8; 8] {
    let mut buf = [0; 8];
    buf[0] = command;
    buf[1..3].copy_from_slice(&index.to_le_bytes());
    buf[3] = sub;
    buf
}

fn abort(index: u16, sub: u8, code: AbortCode) -> [u8; 8] {
    let mut buf = header(ABORT, index, sub);
    buf[4..8].copy_from_slice(&u32::from(code).to_le_bytes());
    buf
}

/// Build an expedited upload response carrying 1 to 4 bytes
pub fn expedited_upload_response(index: u16, sub: u8, data: &[u8]) -> [u8; 8] {
    let n = (4 - data.len()) as u8;
    let mut buf = header(RESPONSE_UPLOAD | EXPEDITED | SIZE_SPECIFIED | (n << 2), index, sub);
    buf[4..4 + data.len()].copy_from_slice(data);
    buf
}

impl SimDevice {
    /// Connect a device to the bus and start serving requests
    pub fn spawn(bus: &SimBus, node_id: u8) -> Self {
        let (sender, mut receiver) = bus.new_port();
        let device = Self {
            inner: Arc::new(DeviceInner {
                node_id: NodeId::new(node_id).unwrap(),
                bus: bus.clone(),
                sender,
                state: Mutex::new(DeviceState::default()),
            }),
        };
        let d = device.clone();
        tokio::spawn(async move {
            while let Ok(msg) = receiver.recv().await {
                d.handle(msg);
            }
        });
        device
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.inner.state.lock().unwrap()
    }

    pub fn node_id(&self) -> u8 {
        self.inner.node_id.raw()
    }

    /// Set the raw value of an object
    pub fn set_object(&self, index: u16, sub: u8, data: &[u8]) {
        self.state().objects.insert((index, sub), data.to_vec());
    }

    /// Get the raw value of an object
    pub fn object(&self, index: u16, sub: u8) -> Option<Vec<u8>> {
        self.state().objects.get(&(index, sub)).cloned()
    }

    /// Never answer requests for this index
    pub fn silence(&self, index: u16) {
        self.state().silent.insert(index);
    }

    /// Drop the next `n` SDO requests without answering
    pub fn ignore_requests(&self, n: usize) {
        self.state().ignore_requests = n;
    }

    /// Send segment `segment` (counted from 0) of the next segmented upload with the wrong
    /// toggle bit
    pub fn flip_toggle_at(&self, segment: usize) {
        self.state().flip_toggle_at = Some(segment);
    }

    /// Make every bus send fail once the flipped segment has been sent
    pub fn break_bus_after_flip(&self) {
        self.state().break_bus_after_flip = true;
    }

    /// Announce `size` bytes when starting a segmented upload of this object, whatever its
    /// actual length
    pub fn declare_size(&self, index: u16, sub: u8, size: u32) {
        self.state().declared_sizes.insert((index, sub), size);
    }

    /// Send these frames just before answering the next request for `index`
    pub fn add_decoys(&self, index: u16, frames: Vec<[u8; 8]>) {
        self.state().decoys.insert(index, frames);
    }

    /// All SDO requests received
    pub fn requests(&self) -> Vec<CanMessage> {
        self.state().requests.clone()
    }

    /// All NMT commands received which address this node
    pub fn nmt_commands(&self) -> Vec<[u8; 2]> {
        self.state().nmt_commands.clone()
    }

    pub fn send_heartbeat(&self, state: u8) {
        let id = self.inner.node_id.heartbeat_id();
        self.inner
            .sender
            .send_now(CanMessage::new(id, &[state]))
            .unwrap();
    }

    pub fn send_emcy(&self, code: u16, register: u8, data: &[u8]) {
        let mut buf = vec![0; 3];
        buf[0..2].copy_from_slice(&code.to_le_bytes());
        buf[2] = register;
        buf.extend_from_slice(data);
        let id = self.inner.node_id.emcy_id();
        self.inner
            .sender
            .send_now(CanMessage::new(id, &buf))
            .unwrap();
    }

    /// Send a frame as this device, e.g. a transmit PDO
    pub fn send(&self, id: u32, data: &[u8]) {
        self.inner
            .sender
            .send_now(CanMessage::new(CanId::from_raw(id), data))
            .unwrap();
    }

    fn reply(&self, data: [u8; 8]) {
        let id = self.inner.node_id.sdo_response_id();
        self.inner
            .sender
            .send_now(CanMessage::new(id, &data))
            .unwrap();
    }

    fn handle(&self, msg: CanMessage) {
        if msg.id() == NMT_CMD_ID {
            let data = msg.data();
            if data.len() == 2 && (data[1] == 0 || data[1] == self.node_id()) {
                self.state().nmt_commands.push([data[0], data[1]]);
            }
            return;
        }
        if msg.id() != self.inner.node_id.sdo_request_id() || msg.data().len() != 8 {
            return;
        }

        let responses = self.handle_sdo(msg);
        for response in responses {
            self.reply(response);
        }
        if std::mem::take(&mut self.state().break_bus) {
            self.inner.bus.set_fail_sends(true);
        }
    }

    fn handle_sdo(&self, msg: CanMessage) -> Vec<[u8; 8]> {
        let mut guard = self.state();
        let state = &mut *guard;
        state.requests.push(msg);
        if state.ignore_requests > 0 {
            state.ignore_requests -= 1;
            log::debug!("Device {}: dropping request {:02X?}", self.node_id(), msg.data());
            return vec![];
        }

        let data = msg.data();
        let command = data[0];
        let index = u16::from_le_bytes([data[1], data[2]]);
        let sub = data[3];

        match command & COMMAND_MASK {
            REQUEST_UPLOAD => {
                if state.silent.contains(&index) {
                    return vec![];
                }
                let mut out: Vec<[u8; 8]> = Vec::new();
                if let Some(decoys) = state.decoys.remove(&index) {
                    out.extend(decoys);
                }
                let Some(value) = state.objects.get(&(index, sub)).cloned() else {
                    out.push(abort(index, sub, AbortCode::NoSuchObject));
                    return out;
                };
                if value.len() <= 4 && !value.is_empty() {
                    out.push(expedited_upload_response(index, sub, &value));
                } else {
                    let size = state
                        .declared_sizes
                        .get(&(index, sub))
                        .copied()
                        .unwrap_or(value.len() as u32);
                    let mut buf = header(RESPONSE_UPLOAD | SIZE_SPECIFIED, index, sub);
                    buf[4..8].copy_from_slice(&size.to_le_bytes());
                    out.push(buf);
                    state.upload = Some(SegmentedUpload {
                        data: value,
                        pos: 0,
                        segment: 0,
                    });
                }
                out
            }
            REQUEST_SEGMENT_UPLOAD => {
                let Some(upload) = state.upload.as_mut() else {
                    return vec![abort(0, 0, AbortCode::InvalidCommandSpecifier)];
                };
                let n = (upload.data.len() - upload.pos).min(7);
                let last = upload.pos + n == upload.data.len();
                let mut toggle = command & TOGGLE_BIT;
                let flip = state.flip_toggle_at == Some(upload.segment);
                if flip {
                    toggle ^= TOGGLE_BIT;
                    state.flip_toggle_at = None;
                    state.break_bus = state.break_bus_after_flip;
                }
                let mut buf = [0; 8];
                buf[0] = toggle | (((7 - n) as u8) << 1) | if last { NO_MORE_DATA } else { 0 };
                buf[1..1 + n].copy_from_slice(&upload.data[upload.pos..upload.pos + n]);
                upload.pos += n;
                upload.segment += 1;
                if last {
                    state.upload = None;
                }
                vec![buf]
            }
            REQUEST_DOWNLOAD => {
                if state.silent.contains(&index) {
                    return vec![];
                }
                if command & EXPEDITED == 0 {
                    return vec![abort(index, sub, AbortCode::UnsupportedAccess)];
                }
                let size = if command & SIZE_SPECIFIED != 0 {
                    4 - ((command >> 2) & 0x3) as usize
                } else {
                    4
                };
                state
                    .objects
                    .insert((index, sub), data[4..4 + size].to_vec());
                vec![header(RESPONSE_DOWNLOAD, index, sub)]
            }
            ABORT => {
                state.upload = None;
                vec![]
            }
            _ => vec![abort(index, sub, AbortCode::InvalidCommandSpecifier)],
        }
    }
}
