//! Hierarchical property addresses.
//!
//! An address is `FACILITY/DEVICE/LOCATION/PROPERTY`. The callback variant
//! of a property lives at the same location with [`CALLBACK_SUFFIX`]
//! appended to the property name.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::HarnessError;

/// Suffix naming the instrumented wrapper of a property.
pub const CALLBACK_SUFFIX: &str = "_CB";

/// Fully qualified, immutable property address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropertyAddress {
    facility: String,
    device: String,
    location: String,
    property: String,
}

impl PropertyAddress {
    pub fn new(
        facility: impl Into<String>,
        device: impl Into<String>,
        location: impl Into<String>,
        property: impl Into<String>,
    ) -> Result<Self, HarnessError> {
        let address = Self {
            facility: facility.into(),
            device: device.into(),
            location: location.into(),
            property: property.into(),
        };
        for (label, part) in [
            ("facility", &address.facility),
            ("device", &address.device),
            ("location", &address.location),
            ("property", &address.property),
        ] {
            if part.is_empty() || part.contains('/') || part.chars().any(char::is_whitespace) {
                return Err(HarnessError::Config(format!(
                    "invalid {label} component {part:?} in property address"
                )));
            }
        }
        Ok(address)
    }

    /// Built-in addresses whose components are constants.
    pub(crate) fn from_static(
        facility: &'static str,
        device: &'static str,
        location: &'static str,
        property: &'static str,
    ) -> Self {
        Self {
            facility: facility.to_string(),
            device: device.to_string(),
            location: location.to_string(),
            property: property.to_string(),
        }
    }

    pub fn facility(&self) -> &str {
        &self.facility
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn property(&self) -> &str {
        &self.property
    }

    /// Returns true if this address names a callback-wrapped property.
    pub fn is_callback(&self) -> bool {
        self.property.ends_with(CALLBACK_SUFFIX) && self.property.len() > CALLBACK_SUFFIX.len()
    }

    /// The callback-wrapped twin of this address. Idempotent.
    pub fn callback(&self) -> Self {
        if self.is_callback() {
            return self.clone();
        }
        Self {
            property: format!("{}{CALLBACK_SUFFIX}", self.property),
            ..self.clone()
        }
    }

    /// The plain twin of a callback address. Idempotent.
    pub fn plain(&self) -> Self {
        match self.property.strip_suffix(CALLBACK_SUFFIX) {
            Some(base) if !base.is_empty() => Self {
                property: base.to_string(),
                ..self.clone()
            },
            _ => self.clone(),
        }
    }

    /// Sibling property at the same location.
    pub fn sibling(&self, property: impl Into<String>) -> Result<Self, HarnessError> {
        Self::new(
            self.facility.clone(),
            self.device.clone(),
            self.location.clone(),
            property,
        )
    }
}

impl fmt::Display for PropertyAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.facility, self.device, self.location, self.property
        )
    }
}

impl FromStr for PropertyAddress {
    type Err = HarnessError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim().trim_start_matches('/');
        let parts: Vec<&str> = trimmed.split('/').collect();
        match parts.as_slice() {
            [facility, device, location, property] => {
                Self::new(*facility, *device, *location, *property)
            }
            _ => Err(HarnessError::Config(format!(
                "property address {raw:?} must have the form FACILITY/DEVICE/LOCATION/PROPERTY"
            ))),
        }
    }
}

impl Serialize for PropertyAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PropertyAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
