//! Process data object mapping and exchange
//!
//! A node has two banks of up to 32 maps: receive maps (communication objects at 0x1400,
//! mapping objects at 0x1600) and transmit maps (0x1800 / 0x1A00). A map is only created when its
//! communication object is present in the node's dictionary.
//!
//! [`PdoMap::configure`] reads the mapping from the device over SDO, and [`PdoMap::publish`]
//! writes the local mapping to the device. Mapped values are packed at byte aligned offsets;
//! packing of variables smaller than a byte is not supported.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use canmaster_common::{
    constants::{object_ids, MAX_PDOS_PER_BANK},
    pdo::{PdoCobId, PdoMapping, MAX_SYNC_TRANSMISSION_TYPE},
    CanId, CanMessage,
};
use futures::future::try_join_all;
use snafu::{OptionExt as _, ResultExt as _, Snafu};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::{
    bus::{MessageBus, SubscriptionId, Topic},
    network::NetworkLink,
    object_dict::{ObjectDictionary, OdError, Variable},
    sdo_client::{SdoClient, SdoClientError},
};

const EVENT_CHANNEL_SIZE: usize = 64;

/// Errors from PDO operations
#[derive(Clone, Debug, PartialEq, Snafu)]
pub enum PdoError {
    /// An SDO access to the mapping objects failed
    #[snafu(display("PDO configuration access failed: {source}"))]
    Sdo {
        /// The SDO failure
        source: SdoClientError,
    },
    /// A mapped object is not in the dictionary
    #[snafu(display("Cannot map object: {source}"))]
    Dictionary {
        /// The lookup failure
        source: OdError,
    },
    /// The map has no COB-ID yet
    #[snafu(display("PDO {number} has no COB-ID, configure it first"))]
    NotConfigured {
        /// The map number
        number: u16,
    },
    /// A mapping entry length is outside 1 to 255 bits
    #[snafu(display("Invalid mapping length of {bits} bits"))]
    InvalidBitLength {
        /// The rejected length
        bits: u32,
    },
    /// The PDO frame could not be sent
    #[snafu(display("Failed to send PDO: {message}"))]
    SendFailed {
        /// A description of the failure
        message: String,
    },
    /// The node is not associated with a network
    Detached,
}

/// Which bank a map belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PdoKind {
    /// Receive maps, configured at 0x1400 / 0x1600
    Receive,
    /// Transmit maps, configured at 0x1800 / 0x1A00
    Transmit,
}

impl PdoKind {
    fn comm_base(&self) -> u16 {
        match self {
            PdoKind::Receive => object_ids::RPDO_COMM_BASE,
            PdoKind::Transmit => object_ids::TPDO_COMM_BASE,
        }
    }

    fn map_base(&self) -> u16 {
        match self {
            PdoKind::Receive => object_ids::RPDO_MAP_BASE,
            PdoKind::Transmit => object_ids::TPDO_MAP_BASE,
        }
    }
}

/// Events emitted by a [`PdoMap`] when a frame is received on its COB-ID
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PdoEvent {
    /// A frame was received
    Message(CanMessage),
    /// A frame was received and its data differs from the previous frame
    Changed(CanMessage),
}

#[derive(Clone, Debug)]
struct MappedVariable {
    var: Variable,
    offset: u32,
    bits: u8,
}

impl MappedVariable {
    fn byte_range(&self) -> core::ops::Range<usize> {
        let start = (self.offset / 8) as usize;
        start..start + self.bits.div_ceil(8) as usize
    }
}

#[derive(Default)]
struct PdoState {
    cob_id: Option<u32>,
    enabled: bool,
    rtr_allowed: bool,
    transmission_type: Option<u8>,
    event_timer: Option<u16>,
    entries: Vec<MappedVariable>,
    data: Vec<u8>,
    previous: Vec<u8>,
    timestamp: Option<u64>,
    period: Option<u64>,
    listener: Option<SubscriptionId>,
    periodic: Option<CancellationToken>,
}

impl PdoState {
    fn total_bits(&self) -> u32 {
        self.entries.iter().map(|e| e.bits as u32).sum()
    }

    fn resize_data(&mut self) {
        self.data = vec![0; self.total_bits().div_ceil(8) as usize];
    }
}

struct PdoMapInner {
    kind: PdoKind,
    number: u16,
    od: Arc<ObjectDictionary>,
    sdo: Arc<SdoClient>,
    link: NetworkLink,
    events: broadcast::Sender<PdoEvent>,
    state: Mutex<PdoState>,
}

/// One PDO, and the variables mapped into it
#[derive(Clone)]
pub struct PdoMap {
    inner: Arc<PdoMapInner>,
}

impl core::fmt::Debug for PdoMap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state();
        f.debug_struct("PdoMap")
            .field("kind", &self.inner.kind)
            .field("number", &self.inner.number)
            .field("cob_id", &state.cob_id)
            .field("enabled", &state.enabled)
            .field("data", &state.data)
            .finish()
    }
}

impl PdoMap {
    fn new(
        kind: PdoKind,
        number: u16,
        od: Arc<ObjectDictionary>,
        sdo: Arc<SdoClient>,
        link: NetworkLink,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            inner: Arc::new(PdoMapInner {
                kind,
                number,
                od,
                sdo,
                link,
                events,
                state: Mutex::new(PdoState {
                    rtr_allowed: true,
                    ..Default::default()
                }),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, PdoState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The bank this map belongs to
    pub fn kind(&self) -> PdoKind {
        self.inner.kind
    }

    /// The map number, 1 to 32
    pub fn number(&self) -> u16 {
        self.inner.number
    }

    /// The index of the communication parameter object
    pub fn comm_index(&self) -> u16 {
        self.inner.kind.comm_base() + self.inner.number - 1
    }

    /// The index of the mapping parameter object
    pub fn map_index(&self) -> u16 {
        self.inner.kind.map_base() + self.inner.number - 1
    }

    /// The arbitration ID of the PDO, once known
    pub fn cob_id(&self) -> Option<u32> {
        self.state().cob_id
    }

    /// Set the arbitration ID, used by the next [`PdoMap::publish`]
    pub fn set_cob_id(&self, cob_id: u32) {
        self.state().cob_id = Some(cob_id);
    }

    /// Whether the PDO is valid on the device
    pub fn is_enabled(&self) -> bool {
        self.state().enabled
    }

    /// Set whether the PDO is valid
    pub fn set_enabled(&self, enabled: bool) {
        self.state().enabled = enabled;
    }

    /// Whether remote requests are allowed
    pub fn rtr_allowed(&self) -> bool {
        self.state().rtr_allowed
    }

    /// Set whether remote requests are allowed
    pub fn set_rtr_allowed(&self, allowed: bool) {
        self.state().rtr_allowed = allowed;
    }

    /// The transmission type, once known
    pub fn transmission_type(&self) -> Option<u8> {
        self.state().transmission_type
    }

    /// Set the transmission type
    pub fn set_transmission_type(&self, transmission_type: u8) {
        self.state().transmission_type = Some(transmission_type);
    }

    /// The event timer in milliseconds, when used by the transmission type
    pub fn event_timer(&self) -> Option<u16> {
        self.state().event_timer
    }

    /// Set the event timer in milliseconds
    pub fn set_event_timer(&self, ms: u16) {
        self.state().event_timer = Some(ms);
    }

    /// The current PDO data
    pub fn data(&self) -> Vec<u8> {
        self.state().data.clone()
    }

    /// The PDO data before the last update
    pub fn previous_data(&self) -> Vec<u8> {
        self.state().previous.clone()
    }

    /// Receive time of the last frame, in network milliseconds
    pub fn timestamp(&self) -> Option<u64> {
        self.state().timestamp
    }

    /// Time between the last two received frames, in milliseconds
    pub fn period(&self) -> Option<u64> {
        self.state().period
    }

    /// The mapped variables, in wire order
    pub fn variables(&self) -> Vec<Variable> {
        self.state().entries.iter().map(|e| e.var.clone()).collect()
    }

    /// Get the mapped variable at a position
    pub fn variable(&self, position: usize) -> Option<Variable> {
        self.state().entries.get(position).map(|e| e.var.clone())
    }

    /// Find a mapped variable by name
    pub fn find_by_name(&self, name: &str) -> Option<Variable> {
        self.state()
            .entries
            .iter()
            .find(|e| e.var.name() == name)
            .map(|e| e.var.clone())
    }

    /// Get a receiver for frame events
    pub fn subscribe(&self) -> broadcast::Receiver<PdoEvent> {
        self.inner.events.subscribe()
    }

    /// Remove all mapped variables
    pub fn clear(&self) {
        let mut state = self.state();
        state.entries.clear();
        state.resize_data();
    }

    /// Append an object to the mapping
    ///
    /// `bits` defaults to the size of the variable's type. A mapping entry holds 1 to 255 bits.
    pub fn add_variable(
        &self,
        index: u16,
        sub: u8,
        bits: Option<u32>,
    ) -> Result<Variable, PdoError> {
        let var = self.inner.od.variable(index, sub).context(DictionarySnafu)?;
        let length = bits.unwrap_or_else(|| var.data_len());
        let bits = u8::try_from(length)
            .ok()
            .filter(|b| *b != 0)
            .context(InvalidBitLengthSnafu { bits: length })?;
        self.push_entry(var.clone(), bits);
        Ok(var)
    }

    fn push_entry(&self, var: Variable, bits: u8) {
        var.bind_sdo(&self.inner.sdo);
        let mut state = self.state();
        let offset = state.total_bits();
        var.set_pdo_mapping(offset, bits as u32);
        state.entries.push(MappedVariable { var, offset, bits });
        state.resize_data();
    }

    /// Read the map configuration from the device
    ///
    /// Mapped objects are resolved in the dictionary, bound to the node's SDO client and given
    /// their bit offset. The map then listens for frames on its COB-ID, in both banks.
    pub async fn configure(&self) -> Result<(), PdoError> {
        let sdo = &self.inner.sdo;
        let comm = self.comm_index();
        let map = self.map_index();

        let cob = PdoCobId::from_object_value(sdo.read_u32(comm, 1).await.context(SdoSnafu)?);
        let transmission_type = sdo.read_u8(comm, 2).await.context(SdoSnafu)?;
        let event_timer = if transmission_type > MAX_SYNC_TRANSMISSION_TYPE
            && self.inner.od.variable(comm, 5).is_ok()
        {
            Some(sdo.read_u16(comm, 5).await.context(SdoSnafu)?)
        } else {
            None
        };

        let count = sdo.read_u8(map, 0).await.context(SdoSnafu)?;
        let mut mappings = Vec::with_capacity(count as usize);
        for i in 1..=count {
            let raw = sdo.read_u32(map, i).await.context(SdoSnafu)?;
            mappings.push(PdoMapping::from_object_value(raw));
        }

        let mut resolved = Vec::with_capacity(mappings.len());
        for m in mappings.iter().filter(|m| m.size != 0) {
            let var = self
                .inner
                .od
                .variable(m.index, m.sub)
                .context(DictionarySnafu)?;
            resolved.push((var, m.size));
        }

        {
            let mut state = self.state();
            state.cob_id = Some(cob.cob_id);
            state.enabled = cob.enabled;
            state.rtr_allowed = cob.rtr_allowed;
            state.transmission_type = Some(transmission_type);
            state.event_timer = event_timer;
            state.entries.clear();
        }
        for (var, bits) in resolved {
            self.push_entry(var, bits);
        }
        log::debug!(
            "Node {} {:?} PDO {}: COB-ID 0x{:X}, {} entries",
            self.inner.sdo.node_id(),
            self.inner.kind,
            self.inner.number,
            cob.cob_id,
            self.state().entries.len()
        );

        let network = self.inner.link.get().context(DetachedSnafu)?;
        self.listen(network.bus(), network.now_ms());
        Ok(())
    }

    /// Write the local configuration to the device
    ///
    /// The PDO is disabled while the mapping is rewritten, and enabled again at the end if the
    /// map is enabled.
    pub async fn publish(&self) -> Result<(), PdoError> {
        let sdo = &self.inner.sdo;
        let comm = self.comm_index();
        let map = self.map_index();

        let cob = match self.cob_id() {
            Some(cob_id) => {
                let state = self.state();
                PdoCobId {
                    cob_id,
                    enabled: state.enabled,
                    rtr_allowed: state.rtr_allowed,
                }
            }
            None => {
                let cob =
                    PdoCobId::from_object_value(sdo.read_u32(comm, 1).await.context(SdoSnafu)?);
                let mut state = self.state();
                state.cob_id = Some(cob.cob_id);
                state.enabled = cob.enabled;
                state.rtr_allowed = cob.rtr_allowed;
                cob
            }
        };

        sdo.write_u32(comm, 1, cob.to_object_value(true))
            .await
            .context(SdoSnafu)?;

        let (transmission_type, event_timer, descriptors) = {
            let state = self.state();
            let descriptors: Vec<u32> = state
                .entries
                .iter()
                .map(|e| {
                    PdoMapping {
                        index: e.var.index(),
                        sub: e.var.subindex(),
                        size: e.bits,
                    }
                    .to_object_value()
                })
                .collect();
            (state.transmission_type, state.event_timer, descriptors)
        };
        if let Some(transmission_type) = transmission_type {
            sdo.write_u8(comm, 2, transmission_type)
                .await
                .context(SdoSnafu)?;
        }
        if let Some(event_timer) = event_timer {
            sdo.write_u16(comm, 5, event_timer)
                .await
                .context(SdoSnafu)?;
        }

        sdo.write_u8(map, 0, 0).await.context(SdoSnafu)?;
        for (i, descriptor) in descriptors.iter().enumerate() {
            sdo.write_u32(map, i as u8 + 1, *descriptor)
                .await
                .context(SdoSnafu)?;
        }
        sdo.write_u8(map, 0, descriptors.len() as u8)
            .await
            .context(SdoSnafu)?;
        self.state().resize_data();

        if cob.enabled {
            sdo.write_u32(comm, 1, cob.to_object_value(false))
                .await
                .context(SdoSnafu)?;
        }
        Ok(())
    }

    /// Pack the cached values of the mapped variables into the PDO data
    pub fn rebuild_data(&self) {
        let mut state = self.state();
        let mut data = vec![0; state.total_bits().div_ceil(8) as usize];
        for entry in &state.entries {
            let raw = entry.var.raw();
            let range = entry.byte_range();
            let end = range.end.min(data.len());
            if range.start >= end {
                continue;
            }
            let n = (end - range.start).min(raw.len());
            data[range.start..range.start + n].copy_from_slice(&raw[..n]);
        }
        state.previous = core::mem::replace(&mut state.data, data);
    }

    /// Rebuild the data and send it on the COB-ID
    pub async fn transmit(&self) -> Result<(), PdoError> {
        self.rebuild_data();
        let (cob_id, data) = {
            let state = self.state();
            let cob_id = state.cob_id.context(NotConfiguredSnafu {
                number: self.inner.number,
            })?;
            (cob_id, state.data.clone())
        };
        let network = self.inner.link.get().context(DetachedSnafu)?;
        network
            .send_message(CanId::from_raw(cob_id), &data)
            .await
            .map_err(|e| {
                SendFailedSnafu {
                    message: e.to_string(),
                }
                .build()
            })
    }

    /// Transmit the PDO every `period` until [`PdoMap::stop`] is called
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, period: Duration) -> Result<(), PdoError> {
        if self.cob_id().is_none() {
            return NotConfiguredSnafu {
                number: self.inner.number,
            }
            .fail();
        }
        self.stop();

        let token = CancellationToken::new();
        self.state().periodic = Some(token.clone());
        let weak: Weak<PdoMapInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        let map = PdoMap { inner };
                        match map.transmit().await {
                            Ok(()) => (),
                            Err(PdoError::Detached) => break,
                            Err(e) => log::warn!("Periodic PDO {} transmit failed: {e}", map.number()),
                        }
                    }
                }
            }
        });
        Ok(())
    }

    /// Stop periodic transmission
    pub fn stop(&self) {
        if let Some(token) = self.state().periodic.take() {
            token.cancel();
        }
    }

    /// Process a frame received on the COB-ID
    pub fn on_message(&self, msg: &CanMessage) {
        let changed = {
            let mut state = self.state();
            let data = msg.data().to_vec();
            state.previous = core::mem::replace(&mut state.data, data);
            if let Some(last) = state.timestamp {
                state.period = Some(msg.timestamp().saturating_sub(last));
            }
            state.timestamp = Some(msg.timestamp());

            for entry in &state.entries {
                let range = entry.byte_range();
                let Some(bytes) = msg.data().get(range) else {
                    continue;
                };
                let mut raw = bytes.to_vec();
                if let Some(size) = entry.var.data_type().size() {
                    raw.resize(size, 0);
                }
                if let Err(e) = entry.var.set_raw(&raw) {
                    log::debug!("PDO {}: cannot store {}: {e}", self.inner.number, entry.var.name());
                }
            }
            state.data != state.previous
        };

        let _ = self.inner.events.send(PdoEvent::Message(*msg));
        if changed {
            let _ = self.inner.events.send(PdoEvent::Changed(*msg));
        }
    }

    fn listen(&self, bus: &MessageBus, now_ms: u64) {
        let Some(cob_id) = self.cob_id() else {
            return;
        };
        let weak: Weak<PdoMapInner> = Arc::downgrade(&self.inner);
        let id = bus.subscribe(
            Topic::Id(cob_id),
            Arc::new(move |msg: &CanMessage| {
                if let Some(inner) = weak.upgrade() {
                    PdoMap { inner }.on_message(msg);
                }
            }),
        );
        let old = {
            let mut state = self.state();
            state.timestamp = Some(now_ms);
            state.listener.replace(id)
        };
        if let Some(old) = old {
            bus.unsubscribe(old);
        }
    }

    fn detach(&self, bus: &MessageBus) {
        self.stop();
        if let Some(id) = self.state().listener.take() {
            bus.unsubscribe(id);
        }
    }
}

/// One bank of maps
#[derive(Clone, Debug)]
pub struct PdoMaps {
    kind: PdoKind,
    maps: BTreeMap<u16, PdoMap>,
}

impl PdoMaps {
    fn new(
        kind: PdoKind,
        od: &Arc<ObjectDictionary>,
        sdo: &Arc<SdoClient>,
        link: &NetworkLink,
    ) -> Self {
        let maps = (1..=MAX_PDOS_PER_BANK)
            .filter(|n| od.contains(kind.comm_base() + n - 1))
            .map(|n| {
                let map = PdoMap::new(kind, n, od.clone(), sdo.clone(), link.clone());
                (n, map)
            })
            .collect();
        Self { kind, maps }
    }

    /// The bank this is
    pub fn kind(&self) -> PdoKind {
        self.kind
    }

    /// Get a map by number, 1 to 32
    pub fn get(&self, number: u16) -> Option<&PdoMap> {
        self.maps.get(&number)
    }

    /// Iterate the maps in number order
    pub fn iter(&self) -> impl Iterator<Item = &PdoMap> {
        self.maps.values()
    }

    /// The number of maps in the bank
    pub fn len(&self) -> usize {
        self.maps.len()
    }

    /// Return true if the dictionary defines no maps for this bank
    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// Find the map which contains a variable with the given name
    pub fn find_by_name(&self, name: &str) -> Option<&PdoMap> {
        self.maps
            .values()
            .find(|map| map.find_by_name(name).is_some())
    }
}

/// The PDO maps of one node
#[derive(Clone, Debug)]
pub struct PdoNode {
    /// Receive maps
    pub rx: PdoMaps,
    /// Transmit maps
    pub tx: PdoMaps,
}

impl PdoNode {
    pub(crate) fn new(od: &Arc<ObjectDictionary>, sdo: &Arc<SdoClient>, link: &NetworkLink) -> Self {
        Self {
            rx: PdoMaps::new(PdoKind::Receive, od, sdo, link),
            tx: PdoMaps::new(PdoKind::Transmit, od, sdo, link),
        }
    }

    fn all(&self) -> impl Iterator<Item = &PdoMap> {
        self.rx.iter().chain(self.tx.iter())
    }

    /// Find the map, in either bank, containing a variable with the given name
    pub fn find_by_name(&self, name: &str) -> Option<&PdoMap> {
        self.rx
            .find_by_name(name)
            .or_else(|| self.tx.find_by_name(name))
    }

    /// Alias for [`PdoNode::find_by_name`]
    pub fn get(&self, name: &str) -> Option<&PdoMap> {
        self.find_by_name(name)
    }

    /// Read the configuration of every map from the device
    pub async fn configure_all(&self) -> Result<(), PdoError> {
        try_join_all(self.all().map(|map| map.configure())).await?;
        Ok(())
    }

    /// Write the configuration of every map to the device
    pub async fn publish_all(&self) -> Result<(), PdoError> {
        for map in self.all() {
            map.publish().await?;
        }
        Ok(())
    }

    /// Stop periodic transmission and remove the receive listeners
    pub(crate) fn detach(&self, bus: &MessageBus) {
        for map in self.all() {
            map.detach(bus);
        }
    }
}

#[cfg(test)]
mod tests {
    use canmaster_common::{DataType, NodeId};

    use super::*;
    use crate::{config::SdoConfig, object_dict::Record};

    fn dictionary() -> ObjectDictionary {
        ObjectDictionary::new()
            .with_object(Variable::new(0x6000, 0, "status", DataType::UInt8))
            .with_object(Variable::new(0x6001, 0, "speed", DataType::Int16))
            .with_object(Variable::new(0x6002, 0, "position", DataType::Int32))
            .with_object(crate::object_dict::DictionaryEntry::Record(
                Record::new(0x1400, "RPDO1 communication")
                    .with_member(Variable::new(0x1400, 1, "COB-ID", DataType::UInt32)),
            ))
            .with_object(crate::object_dict::DictionaryEntry::Record(
                Record::new(0x1801, "TPDO2 communication")
                    .with_member(Variable::new(0x1801, 1, "COB-ID", DataType::UInt32)),
            ))
    }

    fn pdo_node() -> PdoNode {
        let od = Arc::new(dictionary());
        let link = NetworkLink::default();
        let sdo = SdoClient::new(
            NodeId::new(2).unwrap(),
            od.clone(),
            link.clone(),
            SdoConfig::default(),
        );
        PdoNode::new(&od, &sdo, &link)
    }

    #[test]
    fn test_banks_follow_dictionary() {
        let pdo = pdo_node();
        assert_eq!(1, pdo.rx.len());
        assert_eq!(1, pdo.tx.len());
        assert!(pdo.rx.get(1).is_some());
        let tpdo = pdo.tx.get(2).unwrap();
        assert_eq!(0x1801, tpdo.comm_index());
        assert_eq!(0x1A01, tpdo.map_index());
    }

    #[test]
    fn test_layout_and_rebuild() {
        let pdo = pdo_node();
        let map = pdo.rx.get(1).unwrap();
        let status = map.add_variable(0x6000, 0, None).unwrap();
        let speed = map.add_variable(0x6001, 0, None).unwrap();
        map.add_variable(0x6002, 0, None).unwrap();

        assert_eq!(Some(0), status.offset());
        assert_eq!(Some(8), speed.offset());
        assert_eq!(Some(16), speed.pdo_bit_length());
        assert_eq!(7, map.data().len());

        status.set_value(&0x11u8.into()).unwrap();
        speed.set_value(&(-2i16).into()).unwrap();
        map.rebuild_data();
        assert_eq!(vec![0x11, 0xFE, 0xFF, 0, 0, 0, 0], map.data());

        assert!(pdo.find_by_name("speed").is_some());
        assert!(pdo.find_by_name("missing").is_none());
        assert!(matches!(
            map.add_variable(0x7000, 0, None),
            Err(PdoError::Dictionary { .. })
        ));
    }

    #[test]
    fn test_partial_byte_rounds_up() {
        let pdo = pdo_node();
        let map = pdo.rx.get(1).unwrap();
        map.add_variable(0x6000, 0, Some(4)).unwrap();
        map.add_variable(0x6001, 0, None).unwrap();
        assert_eq!(3, map.data().len());
    }

    #[test]
    fn test_mapping_length_must_fit_a_byte() {
        let pdo = pdo_node();
        let map = pdo.rx.get(1).unwrap();
        assert_eq!(
            Err(PdoError::InvalidBitLength { bits: 300 }),
            map.add_variable(0x6002, 0, Some(300)).map(|_| ())
        );
        assert_eq!(
            Err(PdoError::InvalidBitLength { bits: 0 }),
            map.add_variable(0x6002, 0, Some(0)).map(|_| ())
        );
        assert!(map.variables().is_empty());
        map.add_variable(0x6002, 0, Some(255)).unwrap();
        assert_eq!(32, map.data().len());
    }

    #[test]
    fn test_received_frame_updates_variables() {
        let pdo = pdo_node();
        let map = pdo.rx.get(1).unwrap();
        map.add_variable(0x6000, 0, None).unwrap();
        let speed = map.add_variable(0x6001, 0, None).unwrap();
        let mut rx = map.subscribe();

        let frame = CanMessage::new(CanId::std(0x202), &[1, 0x34, 0x12]).with_timestamp(10);
        map.on_message(&frame);
        assert_eq!(Ok(0x1234i16.into()), speed.value());
        assert_eq!(Ok(PdoEvent::Message(frame)), rx.try_recv());
        assert_eq!(Ok(PdoEvent::Changed(frame)), rx.try_recv());

        let again = frame.with_timestamp(25);
        map.on_message(&again);
        assert_eq!(Some(15), map.period());
        assert_eq!(Ok(PdoEvent::Message(again)), rx.try_recv());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_transmit_requires_cob_id() {
        let pdo = pdo_node();
        let map = pdo.tx.get(2).unwrap();
        assert_eq!(
            Err(PdoError::NotConfigured { number: 2 }),
            map.transmit().await
        );
        map.set_cob_id(0x182);
        assert_eq!(Err(PdoError::Detached), map.transmit().await);
    }
}
