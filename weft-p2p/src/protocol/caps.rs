//! Subprotocol capabilities and negotiation.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// A subprotocol advertisement: short ASCII name plus version.
///
/// The derived ordering (lexicographic by name, then ascending version) is
/// the canonical order used for code window allocation. Both ends must sort
/// identically or messages would dispatch to the wrong subprotocol.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Capability {
    /// Subprotocol name, e.g. `"eth"`.
    pub name: String,
    /// Subprotocol version.
    pub version: u32,
}

impl Capability {
    /// Create a capability.
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

/// Compute the capabilities to run over a connection.
///
/// A capability is chosen when the exact `(name, version)` pair appears on
/// both sides; if several versions of a name match, the highest wins. The
/// result is in canonical order, one entry per name, so both ends assign
/// identical code windows.
pub fn negotiate(local: &[Capability], remote: &[Capability]) -> Vec<Capability> {
    let local_set: HashSet<&Capability> = local.iter().collect();

    let mut best: BTreeMap<&str, u32> = BTreeMap::new();
    for cap in remote {
        if local_set.contains(cap) {
            let version = best.entry(cap.name.as_str()).or_insert(cap.version);
            if cap.version > *version {
                *version = cap.version;
            }
        }
    }

    best.into_iter()
        .map(|(name, version)| Capability::new(name, version))
        .collect()
}
