//! In-memory property store with callback instrumentation.
//!
//! Callback-wrapped properties share two process-wide counters. A client
//! write on such a property reads, writes and reads again; a client read
//! reads twice. Writes to callback scalars and aggregate reads of arrays
//! produce an [`Observation`] that the instrumentation thread forwards to
//! the driver.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use pvt_common::PropertyAddress;
use thiserror::Error;
use tracing::debug;

/// Scalar properties registered at every location, with their callback twins.
pub const SCALAR_PROPERTIES: [(&str, PropertyKind); 4] = [
    ("TESTTYPE_INT", PropertyKind::Int),
    ("TESTTYPE_FLOAT", PropertyKind::Float),
    ("TESTTYPE_DOUBLE", PropertyKind::Double),
    ("TESTTYPE_STRING", PropertyKind::Text),
];

/// Integer arrays registered at every location, with their callback twins.
pub const ARRAY_PROPERTIES: [&str; 1] = ["TESTARRAY_INT"];

/// `TARGET_*` properties whose value the updater mirrors into `MONITOR_*`.
pub const MIRRORED_PROPERTIES: [(&str, PropertyKind); 2] = [
    ("VOLTAGE", PropertyKind::Int),
    ("CURRENT", PropertyKind::Double),
];

const TARGET_PREFIX: &str = "TARGET_";
const MONITOR_PREFIX: &str = "MONITOR_";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("unknown property {0}")]
    UnknownProperty(String),

    #[error("cannot store {value:?} in {kind} property {address}")]
    TypeMismatch {
        address: String,
        kind: PropertyKind,
        value: String,
    },

    #[error("{0} is an array property")]
    IsArray(String),

    #[error("{0} is not an array property")]
    NotArray(String),

    #[error("fixture {path}: {reason}")]
    Fixture { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    Int,
    Float,
    Double,
    Text,
    IntArray,
}

impl std::fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::Double => "double",
            Self::Text => "string",
            Self::IntArray => "int array",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Int(i64),
    Float(f32),
    Double(f64),
    Text(String),
    IntArray(Vec<i64>),
}

impl PropertyValue {
    fn zero(kind: PropertyKind) -> Self {
        match kind {
            PropertyKind::Int => Self::Int(0),
            PropertyKind::Float => Self::Float(0.0),
            PropertyKind::Double => Self::Double(0.0),
            PropertyKind::Text => Self::Text(String::new()),
            PropertyKind::IntArray => Self::IntArray(Vec::new()),
        }
    }

    fn kind(&self) -> PropertyKind {
        match self {
            Self::Int(_) => PropertyKind::Int,
            Self::Float(_) => PropertyKind::Float,
            Self::Double(_) => PropertyKind::Double,
            Self::Text(_) => PropertyKind::Text,
            Self::IntArray(_) => PropertyKind::IntArray,
        }
    }

    /// Parse client text into a scalar of `kind`.
    fn parse(kind: PropertyKind, raw: &str) -> Option<Self> {
        let raw = raw.trim();
        match kind {
            PropertyKind::Int => raw
                .parse::<i64>()
                .ok()
                .or_else(|| raw.parse::<f64>().ok().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .map(Self::Int),
            PropertyKind::Float => raw.parse().ok().map(Self::Float),
            PropertyKind::Double => raw.parse().ok().map(Self::Double),
            PropertyKind::Text => Some(Self::Text(raw.to_string())),
            PropertyKind::IntArray => None,
        }
    }

    /// Client-facing rendering. Arrays render their last element.
    pub fn render(&self) -> String {
        match self {
            Self::Int(v) => v.to_string(),
            Self::Float(v) => v.to_string(),
            Self::Double(v) => v.to_string(),
            Self::Text(v) => v.clone(),
            Self::IntArray(v) => v.last().map(ToString::to_string).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone)]
struct Property {
    value: PropertyValue,
    callback: bool,
}

/// Process-wide callback counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallbackCounters {
    pub get: u64,
    pub set: u64,
}

/// Messages for one observation point, sent in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub source: String,
    pub messages: Vec<String>,
}

/// Result of a client access.
#[derive(Debug, Clone, PartialEq)]
pub struct Access {
    pub reply: PropertyValue,
    pub observation: Option<Observation>,
}

#[derive(Debug)]
pub struct PropertyStore {
    properties: BTreeMap<PropertyAddress, Property>,
    counters: CallbackCounters,
    fixtures_dir: PathBuf,
}

impl PropertyStore {
    pub fn new(fixtures_dir: impl Into<PathBuf>) -> Self {
        Self {
            properties: BTreeMap::new(),
            counters: CallbackCounters::default(),
            fixtures_dir: fixtures_dir.into(),
        }
    }

    /// Store with the standard instrumented properties at `location`
    /// (`FACILITY/DEVICE/LOCATION`).
    pub fn standard(location: &str, fixtures_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let mut store = Self::new(fixtures_dir);
        for (name, kind) in SCALAR_PROPERTIES {
            let plain = store.register(location, name, kind, false)?;
            store.register_address(plain.callback(), kind, true);
        }
        for name in ARRAY_PROPERTIES {
            let plain = store.register(location, name, PropertyKind::IntArray, false)?;
            store.register_address(plain.callback(), PropertyKind::IntArray, true);
        }
        for (suffix, kind) in MIRRORED_PROPERTIES {
            store.register(location, &format!("{TARGET_PREFIX}{suffix}"), kind, false)?;
            store.register(location, &format!("{MONITOR_PREFIX}{suffix}"), kind, false)?;
        }
        Ok(store)
    }

    fn register(
        &mut self,
        location: &str,
        name: &str,
        kind: PropertyKind,
        callback: bool,
    ) -> Result<PropertyAddress, StoreError> {
        let address = parse_address(&format!("{location}/{name}"))?;
        self.register_address(address.clone(), kind, callback);
        Ok(address)
    }

    pub fn register_address(
        &mut self,
        address: PropertyAddress,
        kind: PropertyKind,
        callback: bool,
    ) {
        self.properties.insert(
            address,
            Property {
                value: PropertyValue::zero(kind),
                callback,
            },
        );
    }

    pub fn counters(&self) -> CallbackCounters {
        self.counters
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn addresses(&self) -> impl Iterator<Item = &PropertyAddress> {
        self.properties.keys()
    }

    /// Client write of a scalar. Returns the stored value as echo.
    pub fn put(&mut self, address: &str, raw: &str) -> Result<Access, StoreError> {
        let address = parse_address(address)?;
        let property = self.lookup(&address)?;
        let kind = property.value.kind();
        if kind == PropertyKind::IntArray {
            return Err(StoreError::IsArray(address.to_string()));
        }
        let value = PropertyValue::parse(kind, raw).ok_or_else(|| StoreError::TypeMismatch {
            address: address.to_string(),
            kind,
            value: raw.to_string(),
        })?;
        let callback = property.callback;

        if callback {
            self.counters.get += 1;
        }
        self.write(&address, value.clone());
        if callback {
            self.counters.set += 1;
            self.counters.get += 1;
        }
        debug!(%address, value = %value.render(), callback, "Property written");

        let observation = callback.then(|| self.observe(&address));
        Ok(Access {
            reply: value,
            observation,
        })
    }

    /// Client write of an array from a fixture file.
    pub fn put_array(&mut self, address: &str, source: &str) -> Result<Access, StoreError> {
        let address = parse_address(address)?;
        let property = self.lookup(&address)?;
        if property.value.kind() != PropertyKind::IntArray {
            return Err(StoreError::NotArray(address.to_string()));
        }
        let callback = property.callback;
        let elements = self.load_fixture(source)?;

        if callback {
            self.counters.get += 1;
        }
        self.write(&address, PropertyValue::IntArray(elements.clone()));
        if callback {
            self.counters.set += 1;
            self.counters.get += 1;
        }
        debug!(%address, source, len = elements.len(), "Array written");
        Ok(Access {
            reply: PropertyValue::IntArray(elements),
            observation: None,
        })
    }

    /// Client read of a scalar.
    pub fn get(&mut self, address: &str) -> Result<Access, StoreError> {
        let address = parse_address(address)?;
        let property = self.lookup(&address)?;
        if property.value.kind() == PropertyKind::IntArray {
            return Err(StoreError::IsArray(address.to_string()));
        }
        let (reply, callback) = (property.value.clone(), property.callback);
        if callback {
            self.counters.get += 2;
        }
        Ok(Access {
            reply,
            observation: None,
        })
    }

    /// Aggregate client read of an array. Always observed.
    pub fn get_array(&mut self, address: &str) -> Result<Access, StoreError> {
        let address = parse_address(address)?;
        let property = self.lookup(&address)?;
        if property.value.kind() != PropertyKind::IntArray {
            return Err(StoreError::NotArray(address.to_string()));
        }
        let (reply, callback) = (property.value.clone(), property.callback);
        if callback {
            self.counters.get += 2;
        }
        let observation = self.observe(&address);
        Ok(Access {
            reply,
            observation: Some(observation),
        })
    }

    /// Copy every `TARGET_*` value to its `MONITOR_*` counterpart.
    /// Returns the number of monitors that changed.
    pub fn sync_monitors(&mut self) -> usize {
        let updates: Vec<(PropertyAddress, PropertyValue)> = self
            .properties
            .iter()
            .filter_map(|(address, target)| {
                let suffix = address.property().strip_prefix(TARGET_PREFIX)?;
                let monitor = address.sibling(format!("{MONITOR_PREFIX}{suffix}")).ok()?;
                let current = self.properties.get(&monitor)?;
                (current.value != target.value).then(|| (monitor, target.value.clone()))
            })
            .collect();
        let changed = updates.len();
        for (monitor, value) in updates {
            debug!(%monitor, value = %value.render(), "Monitor updated");
            self.write(&monitor, value);
        }
        changed
    }

    /// Value of the plain twin plus both counters.
    fn observe(&self, address: &PropertyAddress) -> Observation {
        let plain = address.plain();
        let value = self
            .properties
            .get(&plain)
            .or_else(|| self.properties.get(address))
            .map(|p| p.value.render())
            .unwrap_or_default();
        Observation {
            source: address.to_string(),
            messages: vec![
                value,
                self.counters.get.to_string(),
                self.counters.set.to_string(),
            ],
        }
    }

    fn lookup(&self, address: &PropertyAddress) -> Result<&Property, StoreError> {
        self.properties
            .get(address)
            .ok_or_else(|| StoreError::UnknownProperty(address.to_string()))
    }

    fn write(&mut self, address: &PropertyAddress, value: PropertyValue) {
        if let Some(property) = self.properties.get_mut(address) {
            property.value = value;
        }
    }

    fn load_fixture(&self, source: &str) -> Result<Vec<i64>, StoreError> {
        let path = resolve_fixture(&self.fixtures_dir, source);
        let raw = fs::read_to_string(&path).map_err(|e| StoreError::Fixture {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        raw.split_whitespace()
            .map(|token| {
                token.parse::<i64>().map_err(|_| StoreError::Fixture {
                    path: path.clone(),
                    reason: format!("{token:?} is not an integer"),
                })
            })
            .collect()
    }
}

fn resolve_fixture(dir: &Path, source: &str) -> PathBuf {
    let candidate = Path::new(source);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        dir.join(candidate)
    }
}

fn parse_address(raw: &str) -> Result<PropertyAddress, StoreError> {
    raw.parse()
        .map_err(|e: pvt_common::HarnessError| StoreError::InvalidAddress(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const LOCATION: &str = "TEST.DOOCS/LOCALHOST_610498009/DPVATESTSRVLOCATION";

    fn addr(property: &str) -> String {
        format!("{LOCATION}/{property}")
    }

    fn store_with_fixture() -> (TempDir, PropertyStore) {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("dspectrum_input1"), "1 2 3\n4 5\n").unwrap();
        let store = PropertyStore::standard(LOCATION, dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_standard_layout() {
        let (_dir, store) = store_with_fixture();
        // 4 scalars + 1 array, each with a callback twin, plus 2 mirrored pairs.
        assert_eq!(store.len(), 14);
        assert!(store.addresses().any(|a| a.property() == "TESTTYPE_INT_CB"));
        assert!(store.addresses().any(|a| a.property() == "MONITOR_VOLTAGE"));
    }

    #[test]
    fn test_plain_put_echoes_without_counting() {
        let (_dir, mut store) = store_with_fixture();
        let access = store.put(&addr("TESTTYPE_INT"), "10").unwrap();
        assert_eq!(access.reply.render(), "10");
        assert!(access.observation.is_none());
        assert_eq!(store.counters(), CallbackCounters::default());
    }

    #[test]
    fn test_callback_put_counts_and_observes_plain_value() {
        let (_dir, mut store) = store_with_fixture();
        store.put(&addr("TESTTYPE_INT"), "10").unwrap();
        let access = store.put(&addr("TESTTYPE_INT_CB"), "20").unwrap();

        assert_eq!(store.counters(), CallbackCounters { get: 2, set: 1 });
        let observation = access.observation.unwrap();
        assert_eq!(observation.messages, vec!["10", "2", "1"]);
    }

    #[test]
    fn test_counters_accumulate_across_properties() {
        let (_dir, mut store) = store_with_fixture();
        for (name, _) in SCALAR_PROPERTIES {
            store.put(&addr(name), "10").unwrap();
            store.put(&addr(&format!("{name}_CB")), "20").unwrap();
        }
        assert_eq!(store.counters(), CallbackCounters { get: 8, set: 4 });
    }

    #[test]
    fn test_callback_get_counts_two_reads() {
        let (_dir, mut store) = store_with_fixture();
        store.get(&addr("TESTTYPE_DOUBLE_CB")).unwrap();
        assert_eq!(store.counters(), CallbackCounters { get: 2, set: 0 });
    }

    #[test]
    fn test_float_renders_compactly() {
        let (_dir, mut store) = store_with_fixture();
        let access = store.put(&addr("TESTTYPE_FLOAT"), "10").unwrap();
        assert_eq!(access.reply.render(), "10");
        let access = store.put(&addr("TESTTYPE_FLOAT"), "2.5").unwrap();
        assert_eq!(access.reply.render(), "2.5");
    }

    #[test]
    fn test_type_mismatch() {
        let (_dir, mut store) = store_with_fixture();
        let err = store.put(&addr("TESTTYPE_INT"), "ten").unwrap_err();
        assert!(matches!(err, StoreError::TypeMismatch { .. }));
    }

    #[test]
    fn test_unknown_and_invalid_addresses() {
        let (_dir, mut store) = store_with_fixture();
        assert!(matches!(
            store.get(&addr("NOPE")),
            Err(StoreError::UnknownProperty(_))
        ));
        assert!(matches!(
            store.get("not-an-address"),
            Err(StoreError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_array_round_trip_observes_last_element() {
        let (_dir, mut store) = store_with_fixture();
        store.put(&addr("TESTTYPE_INT_CB"), "1").unwrap();
        let put = store.put_array(&addr("TESTARRAY_INT"), "dspectrum_input1").unwrap();
        assert!(put.observation.is_none());

        let access = store.get_array(&addr("TESTARRAY_INT")).unwrap();
        assert_eq!(access.reply, PropertyValue::IntArray(vec![1, 2, 3, 4, 5]));
        assert_eq!(access.observation.unwrap().messages, vec!["5", "2", "1"]);
    }

    #[test]
    fn test_repeated_observation_without_mutation_is_stable() {
        let (_dir, mut store) = store_with_fixture();
        store.put(&addr("TESTTYPE_INT_CB"), "3").unwrap();
        store.put_array(&addr("TESTARRAY_INT"), "dspectrum_input1").unwrap();
        let first = store.get_array(&addr("TESTARRAY_INT")).unwrap().observation;
        let second = store.get_array(&addr("TESTARRAY_INT")).unwrap().observation;
        assert_eq!(first, second);
    }

    #[test]
    fn test_array_scalar_confusion() {
        let (_dir, mut store) = store_with_fixture();
        assert!(matches!(
            store.put(&addr("TESTARRAY_INT"), "1"),
            Err(StoreError::IsArray(_))
        ));
        assert!(matches!(
            store.get_array(&addr("TESTTYPE_INT")),
            Err(StoreError::NotArray(_))
        ));
    }

    #[test]
    fn test_bad_fixture() {
        let (dir, mut store) = store_with_fixture();
        fs::write(dir.path().join("broken"), "1 two 3").unwrap();
        let err = store.put_array(&addr("TESTARRAY_INT"), "broken").unwrap_err();
        assert!(err.to_string().contains("\"two\""));
        assert!(matches!(
            store.put_array(&addr("TESTARRAY_INT"), "missing"),
            Err(StoreError::Fixture { .. })
        ));
    }

    #[test]
    fn test_sync_monitors_copies_targets() {
        let (_dir, mut store) = store_with_fixture();
        assert_eq!(store.sync_monitors(), 0);
        store.put(&addr("TARGET_VOLTAGE"), "42").unwrap();
        assert_eq!(store.get(&addr("MONITOR_VOLTAGE")).unwrap().reply.render(), "0");

        assert_eq!(store.sync_monitors(), 1);
        assert_eq!(store.get(&addr("MONITOR_VOLTAGE")).unwrap().reply.render(), "42");
        assert_eq!(store.sync_monitors(), 0);
    }
}
