//! The master side object dictionary
//!
//! An [`ObjectDictionary`] describes the objects a device exposes, and caches their last known
//! values. Entries are shared handles: cloning a [`Variable`] (or an entry or dictionary holding
//! it) yields a second handle to the same value, SDO binding and PDO mapping state.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, Weak},
};

use canmaster_common::objects::{AccessType, CodecError, DataType, Value};
use snafu::{OptionExt as _, ResultExt as _, Snafu};

use crate::sdo_client::{DetachedSnafu, DictionarySnafu, NotBoundSnafu, SdoClient, SdoClientError};

/// Errors from looking up or updating dictionary entries
#[derive(Clone, Debug, PartialEq, Snafu)]
pub enum OdError {
    /// The index is not in the dictionary
    #[snafu(display("Object 0x{index:04X} not found"))]
    NotFound {
        /// The requested index
        index: u16,
    },
    /// The object exists but has no such sub index
    #[snafu(display("Object 0x{index:04X}sub{sub} not found"))]
    SubNotFound {
        /// The requested index
        index: u16,
        /// The requested sub index
        sub: u8,
    },
    /// No entry has the requested name
    #[snafu(display("No object named '{name}'"))]
    NameNotFound {
        /// The requested name
        name: String,
    },
    /// A value could not be converted to or from raw bytes
    #[snafu(display("{source}"))]
    Codec {
        /// The codec failure
        source: CodecError,
    },
}

#[derive(Default)]
struct VariableState {
    access: AccessType,
    min: Option<Value>,
    max: Option<Value>,
    default: Option<Value>,
    raw: Vec<u8>,
    offset: Option<u32>,
    bit_length: Option<u32>,
    sdo: Option<Weak<SdoClient>>,
    unit: Option<String>,
    factor: Option<f64>,
    value_descriptions: BTreeMap<i64, String>,
    bit_definitions: BTreeMap<String, Vec<u8>>,
}

struct VariableInner {
    index: u16,
    subindex: u8,
    name: String,
    data_type: DataType,
    state: Mutex<VariableState>,
}

/// A single value in the dictionary
#[derive(Clone)]
pub struct Variable {
    inner: Arc<VariableInner>,
}

impl core::fmt::Debug for Variable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.lock();
        f.debug_struct("Variable")
            .field("index", &self.inner.index)
            .field("subindex", &self.inner.subindex)
            .field("name", &self.inner.name)
            .field("data_type", &self.inner.data_type)
            .field("raw", &state.raw)
            .field("offset", &state.offset)
            .finish()
    }
}

impl Variable {
    /// Create a variable
    ///
    /// Fixed size types start zero filled, variable length types start empty.
    pub fn new(index: u16, subindex: u8, name: impl Into<String>, data_type: DataType) -> Self {
        let state = VariableState {
            raw: vec![0; data_type.size().unwrap_or(0)],
            ..Default::default()
        };
        Self {
            inner: Arc::new(VariableInner {
                index,
                subindex,
                name: name.into(),
                data_type,
                state: Mutex::new(state),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VariableState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Set the access type
    pub fn with_access(self, access: AccessType) -> Self {
        self.lock().access = access;
        self
    }

    /// Set the default value, which also becomes the current value
    pub fn with_default(self, value: impl Into<Value>) -> Result<Self, OdError> {
        let value = value.into();
        self.set_value(&value)?;
        self.lock().default = Some(value);
        Ok(self)
    }

    /// Set the value limits
    pub fn with_limits(self, min: Option<Value>, max: Option<Value>) -> Self {
        {
            let mut state = self.lock();
            state.min = min;
            state.max = max;
        }
        self
    }

    /// Set the physical unit and the factor from raw value to that unit
    pub fn with_unit(self, unit: impl Into<String>, factor: f64) -> Self {
        {
            let mut state = self.lock();
            state.unit = Some(unit.into());
            state.factor = Some(factor);
        }
        self
    }

    /// The object index
    pub fn index(&self) -> u16 {
        self.inner.index
    }

    /// The object sub index
    pub fn subindex(&self) -> u8 {
        self.inner.subindex
    }

    /// The object name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The data type
    pub fn data_type(&self) -> DataType {
        self.inner.data_type
    }

    /// The access type
    pub fn access(&self) -> AccessType {
        self.lock().access
    }

    /// The lower limit, if any
    pub fn min(&self) -> Option<Value> {
        self.lock().min.clone()
    }

    /// The upper limit, if any
    pub fn max(&self) -> Option<Value> {
        self.lock().max.clone()
    }

    /// The default value, if any
    pub fn default_value(&self) -> Option<Value> {
        self.lock().default.clone()
    }

    /// The physical unit, if any
    pub fn unit(&self) -> Option<String> {
        self.lock().unit.clone()
    }

    /// The factor from raw value to physical unit, if any
    pub fn factor(&self) -> Option<f64> {
        self.lock().factor
    }

    /// The size of the variable in bits
    ///
    /// Variable length types are counted as 8 bits.
    pub fn data_len(&self) -> u32 {
        self.inner.data_type.bit_length()
    }

    /// A copy of the cached raw bytes
    pub fn raw(&self) -> Vec<u8> {
        self.lock().raw.clone()
    }

    /// Replace the cached raw bytes
    ///
    /// Fixed size types must be given exactly their size.
    pub fn set_raw(&self, raw: &[u8]) -> Result<(), OdError> {
        if let Some(size) = self.inner.data_type.size() {
            if raw.len() != size {
                return Err(CodecError::Length {
                    data_type: self.inner.data_type,
                    expected: size,
                    actual: raw.len(),
                })
                .context(CodecSnafu);
            }
        }
        self.lock().raw = raw.to_vec();
        Ok(())
    }

    /// Decode the cached raw bytes
    pub fn value(&self) -> Result<Value, OdError> {
        let raw = self.raw();
        self.inner.data_type.decode(&raw).context(CodecSnafu)
    }

    /// Encode a value into the cached raw bytes, without touching the device
    pub fn set_value(&self, value: &Value) -> Result<(), OdError> {
        let raw = self.inner.data_type.encode(value).context(CodecSnafu)?;
        self.lock().raw = raw;
        Ok(())
    }

    /// Store data uploaded from a device
    ///
    /// Expedited responses without a size indication are padded to 4 bytes, so longer data is
    /// truncated to the type size.
    fn store_uploaded(&self, mut data: Vec<u8>) -> Result<(), OdError> {
        if let Some(size) = self.inner.data_type.size() {
            if data.len() > size {
                data.truncate(size);
            }
        }
        self.set_raw(&data)
    }

    /// The bit offset of the variable within the PDO it is mapped into
    pub fn offset(&self) -> Option<u32> {
        self.lock().offset
    }

    /// The mapped bit length, when mapped into a PDO
    pub fn pdo_bit_length(&self) -> Option<u32> {
        self.lock().bit_length
    }

    pub(crate) fn set_pdo_mapping(&self, offset: u32, bit_length: u32) {
        let mut state = self.lock();
        state.offset = Some(offset);
        state.bit_length = Some(bit_length);
    }

    /// Bind the variable to an SDO client, used by [`Variable::read`] and [`Variable::write`]
    pub fn bind_sdo(&self, sdo: &Arc<SdoClient>) {
        self.lock().sdo = Some(Arc::downgrade(sdo));
    }

    pub(crate) fn bind_sdo_weak(&self, sdo: Weak<SdoClient>) {
        self.lock().sdo = Some(sdo);
    }

    /// Return true if an SDO client is bound
    pub fn is_bound(&self) -> bool {
        self.lock().sdo.is_some()
    }

    fn sdo_client(&self) -> Result<Arc<SdoClient>, SdoClientError> {
        let weak = self.lock().sdo.clone().context(NotBoundSnafu {
            index: self.index(),
            sub: self.subindex(),
        })?;
        weak.upgrade().context(DetachedSnafu)
    }

    /// Read the value from the device, updating the cached value
    pub async fn read(&self) -> Result<Value, SdoClientError> {
        let sdo = self.sdo_client()?;
        let data = sdo.upload(self.index(), self.subindex()).await?;
        self.store_uploaded(data).context(DictionarySnafu)?;
        self.value().context(DictionarySnafu)
    }

    /// Write a value to the device, updating the cached value on success
    pub async fn write(&self, value: impl Into<Value>) -> Result<(), SdoClientError> {
        let raw = self
            .inner
            .data_type
            .encode(&value.into())
            .context(CodecSnafu)
            .context(DictionarySnafu)?;
        let sdo = self.sdo_client()?;
        sdo.download(self.index(), self.subindex(), &raw).await?;
        self.lock().raw = raw;
        Ok(())
    }

    /// Write the cached value to the device
    pub async fn save(&self) -> Result<(), SdoClientError> {
        let sdo = self.sdo_client()?;
        let raw = self.raw();
        sdo.download(self.index(), self.subindex(), &raw).await
    }

    /// Attach a description to a raw value, e.g. an enumeration member name
    pub fn add_value_description(&self, value: i64, description: impl Into<String>) {
        self.lock()
            .value_descriptions
            .insert(value, description.into());
    }

    /// Get the description attached to a raw value
    pub fn value_description(&self, value: i64) -> Option<String> {
        self.lock().value_descriptions.get(&value).cloned()
    }

    /// Name a group of bits within an integer value
    pub fn add_bit_definition(&self, name: impl Into<String>, bits: Vec<u8>) {
        self.lock().bit_definitions.insert(name.into(), bits);
    }

    /// Extract a named bit group from the cached value
    ///
    /// Returns None if the name is not defined or the value is not an integer
    pub fn bits(&self, name: &str) -> Option<u64> {
        let bits = self.lock().bit_definitions.get(name).cloned()?;
        let value = self.value().ok()?.as_i128()? as u64;
        Some(
            bits.iter()
                .enumerate()
                .filter(|(_, bit)| **bit < 64 && value & (1 << **bit) != 0)
                .fold(0, |acc, (n, _)| acc | (1 << n)),
        )
    }
}

/// The members of an array or record object
#[derive(Clone, Debug)]
pub struct Record {
    index: u16,
    name: String,
    subs: BTreeMap<u8, Variable>,
    names: HashMap<String, u8>,
}

impl Record {
    /// Create an empty record
    pub fn new(index: u16, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            subs: BTreeMap::new(),
            names: HashMap::new(),
        }
    }

    /// Add a member, replacing any member with the same sub index or name
    pub fn add_member(&mut self, var: Variable) {
        if let Some(old) = self.subs.get(&var.subindex()) {
            self.names.remove(old.name());
        }
        self.names.insert(var.name().to_string(), var.subindex());
        self.subs.insert(var.subindex(), var);
    }

    /// Builder form of [`Record::add_member`]
    pub fn with_member(mut self, var: Variable) -> Self {
        self.add_member(var);
        self
    }

    /// The object index
    pub fn index(&self) -> u16 {
        self.index
    }

    /// The object name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get a member by sub index
    pub fn member(&self, sub: u8) -> Option<&Variable> {
        self.subs.get(&sub)
    }

    /// Get a member by name
    pub fn find_by_name(&self, name: &str) -> Option<&Variable> {
        self.names.get(name).and_then(|sub| self.subs.get(sub))
    }

    /// Iterate the members in sub index order
    pub fn members(&self) -> impl Iterator<Item = &Variable> {
        self.subs.values()
    }

    /// Bind every member to an SDO client
    pub fn bind_sdo(&self, sdo: &Arc<SdoClient>) {
        for var in self.subs.values() {
            var.bind_sdo(sdo);
        }
    }
}

/// An entry in an [`ObjectDictionary`]
#[derive(Clone, Debug)]
pub enum DictionaryEntry {
    /// A single value at sub index 0
    Variable(Variable),
    /// An array of values of one type
    Array(Record),
    /// A structure of named values
    Record(Record),
}

impl DictionaryEntry {
    /// The object index
    pub fn index(&self) -> u16 {
        match self {
            DictionaryEntry::Variable(v) => v.index(),
            DictionaryEntry::Array(r) | DictionaryEntry::Record(r) => r.index(),
        }
    }

    /// The object name
    pub fn name(&self) -> &str {
        match self {
            DictionaryEntry::Variable(v) => v.name(),
            DictionaryEntry::Array(r) | DictionaryEntry::Record(r) => r.name(),
        }
    }

    /// Get the variable stored at a sub index
    pub fn sub(&self, sub: u8) -> Option<&Variable> {
        match self {
            DictionaryEntry::Variable(v) => (v.subindex() == sub).then_some(v),
            DictionaryEntry::Array(r) | DictionaryEntry::Record(r) => r.member(sub),
        }
    }

    /// Get the entry as a plain variable
    pub fn as_variable(&self) -> Option<&Variable> {
        match self {
            DictionaryEntry::Variable(v) => Some(v),
            _ => None,
        }
    }

    /// Bind the entry, and all members, to an SDO client
    pub fn bind_sdo(&self, sdo: &Arc<SdoClient>) {
        match self {
            DictionaryEntry::Variable(v) => v.bind_sdo(sdo),
            DictionaryEntry::Array(r) | DictionaryEntry::Record(r) => r.bind_sdo(sdo),
        }
    }

    pub(crate) fn bind_sdo_weak(&self, sdo: &Weak<SdoClient>) {
        match self {
            DictionaryEntry::Variable(v) => v.bind_sdo_weak(sdo.clone()),
            DictionaryEntry::Array(r) | DictionaryEntry::Record(r) => {
                for v in r.members() {
                    v.bind_sdo_weak(sdo.clone());
                }
            }
        }
    }
}

impl From<Variable> for DictionaryEntry {
    fn from(value: Variable) -> Self {
        DictionaryEntry::Variable(value)
    }
}

/// A collection of dictionary entries, looked up by index or by name
///
/// Adding an entry whose index or name is already present replaces the earlier entry.
#[derive(Clone, Debug, Default)]
pub struct ObjectDictionary {
    indices: BTreeMap<u16, DictionaryEntry>,
    names: HashMap<String, u16>,
}

impl ObjectDictionary {
    /// Create an empty dictionary
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry
    pub fn add_object(&mut self, entry: impl Into<DictionaryEntry>) {
        let entry = entry.into();
        let index = entry.index();
        if let Some(old) = self.indices.get(&index) {
            if self.names.get(old.name()) == Some(&index) {
                self.names.remove(old.name());
            }
        }
        self.names.insert(entry.name().to_string(), index);
        self.indices.insert(index, entry);
    }

    /// Builder form of [`ObjectDictionary::add_object`]
    pub fn with_object(mut self, entry: impl Into<DictionaryEntry>) -> Self {
        self.add_object(entry);
        self
    }

    /// Look up an entry by index
    pub fn find(&self, index: u16) -> Result<&DictionaryEntry, OdError> {
        self.indices.get(&index).context(NotFoundSnafu { index })
    }

    /// Look up an entry by name
    pub fn find_by_name(&self, name: &str) -> Result<&DictionaryEntry, OdError> {
        self.names
            .get(name)
            .and_then(|index| self.indices.get(index))
            .context(NameNotFoundSnafu { name })
    }

    /// Get a handle to the variable at index/sub
    pub fn variable(&self, index: u16, sub: u8) -> Result<Variable, OdError> {
        self.find(index)?
            .sub(sub)
            .cloned()
            .context(SubNotFoundSnafu { index, sub })
    }

    /// Return true if the index is present
    pub fn contains(&self, index: u16) -> bool {
        self.indices.contains_key(&index)
    }

    /// Iterate the entries in index order
    pub fn entries(&self) -> impl Iterator<Item = &DictionaryEntry> {
        self.indices.values()
    }

    /// The number of entries
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Return true if the dictionary has no entries
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// A source of object dictionaries, e.g. a device description file parser
pub trait DictionaryLoader {
    /// The error returned when loading fails
    type Error: core::fmt::Display;

    /// Build a dictionary from a source description
    fn load(&self, source: &str) -> Result<ObjectDictionary, Self::Error>;
}

impl<F, E> DictionaryLoader for F
where
    F: Fn(&str) -> Result<ObjectDictionary, E>,
    E: core::fmt::Display,
{
    type Error = E;

    fn load(&self, source: &str) -> Result<ObjectDictionary, E> {
        self(source)
    }
}

#[cfg(test)]
mod tests {
    use assertables::assert_ok_eq_x;

    use super::*;

    fn sample() -> ObjectDictionary {
        ObjectDictionary::new()
            .with_object(
                Variable::new(0x1008, 0, "Device Name", DataType::VisibleString)
                    .with_access(AccessType::Const),
            )
            .with_object(DictionaryEntry::Record(
                Record::new(0x1018, "Identity")
                    .with_member(Variable::new(0x1018, 0, "Count", DataType::UInt8))
                    .with_member(Variable::new(0x1018, 1, "Vendor-ID", DataType::UInt32)),
            ))
    }

    #[test]
    fn test_lookup() {
        let od = sample();
        assert_eq!(0x1018, od.find_by_name("Identity").unwrap().index());
        assert_eq!(
            Err(OdError::NotFound { index: 0x2000 }),
            od.find(0x2000).map(|e| e.index())
        );
        assert_eq!("Vendor-ID", od.variable(0x1018, 1).unwrap().name());
        assert!(matches!(
            od.variable(0x1008, 1),
            Err(OdError::SubNotFound { index: 0x1008, sub: 1 })
        ));
        let DictionaryEntry::Record(rec) = od.find(0x1018).unwrap() else {
            panic!("expected record");
        };
        assert_eq!(1, rec.find_by_name("Vendor-ID").unwrap().subindex());
    }

    #[test]
    fn test_last_write_wins() {
        let mut od = sample();
        od.add_object(Variable::new(0x1008, 0, "Name", DataType::VisibleString));
        assert_eq!(2, od.len());
        assert!(od.find_by_name("Device Name").is_err());
        assert_eq!(0x1008, od.find_by_name("Name").unwrap().index());
    }

    #[test]
    fn test_raw_length_checked() {
        let var = Variable::new(0x2000, 0, "Speed", DataType::UInt16);
        assert_eq!(vec![0, 0], var.raw());
        assert!(var.set_raw(&[1, 2, 3]).is_err());
        var.set_raw(&[0x34, 0x12]).unwrap();
        assert_ok_eq_x!(var.value(), Value::U16(0x1234));
        assert_eq!(16, var.data_len());
    }

    #[test]
    fn test_clones_share_state() {
        let od = sample();
        let var = od.variable(0x1018, 1).unwrap();
        var.set_value(&Value::U32(42)).unwrap();
        assert_ok_eq_x!(od.variable(0x1018, 1).unwrap().value(), Value::U32(42));
    }

    #[test]
    fn test_metadata() {
        let var = Variable::new(0x2001, 0, "Status", DataType::UInt8)
            .with_default(0x05u8)
            .unwrap()
            .with_unit("V", 0.1);
        var.add_value_description(5, "Ready");
        var.add_bit_definition("Mode", vec![0, 2]);
        assert_eq!(Some("Ready".to_string()), var.value_description(5));
        assert_eq!(Some(0b11), var.bits("Mode"));
        assert_eq!(Some(Value::U8(5)), var.default_value());
        assert_eq!(Some(0.1), var.factor());
    }

    #[tokio::test]
    async fn test_unbound_io_fails() {
        let var = Variable::new(0x2000, 0, "Speed", DataType::UInt16);
        assert!(matches!(
            var.read().await,
            Err(SdoClientError::NotBound { index: 0x2000, sub: 0 })
        ));
    }

    #[test]
    fn test_loader_closure() {
        let loader = |_: &str| -> Result<ObjectDictionary, String> { Ok(sample()) };
        assert_eq!(2, loader.load("ignored").unwrap().len());
    }
}
