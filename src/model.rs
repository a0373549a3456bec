//! The data model shared by every component (spec §3): opaque
//! ActionID/OutputID identifiers and the IndexEntry they're bound to.
//! GoCICa never hashes or interprets either identifier — they are
//! whatever bytes the toolchain chose to send.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque bytes identifying a unit of toolchain work. Carried on the wire
/// as a plain JSON string (its bytes are the string's UTF-8 encoding);
/// GoCICa imposes no further structure on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(pub String);

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl ActionId {
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

/// Opaque bytes identifying a cached artifact. Distinct OutputIDs are
/// distinct artifacts; the same OutputID may be shared by many
/// ActionIDs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputId(pub String);

impl fmt::Display for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl OutputId {
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// The on-disk file name for this OutputID (spec §4.3): every `/`
    /// byte replaced with `-`. Reversible because legitimate OutputIDs
    /// don't contain `-` in slash positions.
    pub fn disk_file_name(&self) -> String {
        format!("o-{}", self.0.replace('/', "-"))
    }

    /// Inverse of [`OutputId::disk_file_name`]'s encoding, given the
    /// `o-`-stripped remainder of a file name found on disk.
    pub fn from_encoded(encoded: &str) -> OutputId {
        OutputId(encoded.replace('-', "/"))
    }
}

/// A single ActionID -> artifact binding (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub output_id: OutputId,
    /// Byte length of the referenced artifact; equal on disk and in the
    /// remote bundle.
    pub size: u64,
    /// Creation time of this entry, nanoseconds since the Unix epoch.
    pub time_nanos: i64,
    /// Last-used timestamp (seconds since the Unix epoch) used for the
    /// LRU-window filter and the merge tie-breaker (spec §4.6).
    pub last_used_at: i64,
}
