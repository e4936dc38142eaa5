use serde::{Deserialize, Serialize};
use std::fmt;

/// Server-assigned identity of a joined peer.
///
/// Ids are handed out in increasing order and are never reused for the
/// lifetime of a server process, so a stale id can never alias a newcomer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(u64);

impl PeerId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The id that follows this one.
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PeerId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}
