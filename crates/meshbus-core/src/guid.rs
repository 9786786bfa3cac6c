//! Daemon GUID.
//!
//! Every daemon process generates one 128-bit identifier at startup. The
//! GUID qualifies unique names across the federation: a unique name is only
//! unique within its daemon, but (GUID, unique name) is globally unique.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// 128-bit daemon identifier, generated once per process.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BusGuid(Uuid);

impl BusGuid {
    /// Generates a fresh random GUID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Eight-character short form used in log lines.
    #[must_use]
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }

    /// Derives a small numeric node id from the GUID, used as the first
    /// component of generated unique names. Never zero: zero is reserved
    /// for the daemon's own control endpoint.
    #[must_use]
    pub fn node_id(&self) -> u32 {
        let bytes = self.0.as_bytes();
        let raw = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        (raw % 0xFFFF) + 1
    }
}

impl fmt::Display for BusGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl fmt::Debug for BusGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BusGuid({})", self.short())
    }
}

impl FromStr for BusGuid {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Serialize for BusGuid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for BusGuid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}
