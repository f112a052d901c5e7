use serde::{Deserialize, Serialize};
use std::fmt;

/// One side of a synchronized pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Local,
    Remote,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Side::Local => write!(f, "local"),
            Side::Remote => write!(f, "remote"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// Per-side status of an entry, as last derived from probe observations.
pub enum MicroState {
    Unknown,
    Created,
    /// Transient state reported by some callers; treated as "existing".
    Updated,
    Modified,
    Deleted,
    Synchronized,
}

impl MicroState {
    pub const ALL: [MicroState; 6] = [
        MicroState::Unknown,
        MicroState::Created,
        MicroState::Updated,
        MicroState::Modified,
        MicroState::Deleted,
        MicroState::Synchronized,
    ];

    /// Returns true if this state means the entry was last seen present, so a
    /// missing entry must be read as a deletion.
    pub fn existed(self) -> bool {
        match self {
            MicroState::Created | MicroState::Updated | MicroState::Synchronized => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MicroState::Unknown => "unknown",
            MicroState::Created => "created",
            MicroState::Updated => "updated",
            MicroState::Modified => "modified",
            MicroState::Deleted => "deleted",
            MicroState::Synchronized => "synchronized",
        }
    }
}

impl Default for MicroState {
    fn default() -> Self {
        MicroState::Unknown
    }
}

impl fmt::Display for MicroState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// Summary of a (local, remote) micro-state pair, consumed by the executor to
/// choose an action.
pub enum PairState {
    Unknown,
    Synchronized,
    LocallyCreated,
    RemotelyCreated,
    LocallyModified,
    RemotelyModified,
    LocallyDeleted,
    RemotelyDeleted,
    Deleted,
    Conflicted,
}

impl PairState {
    pub fn as_str(self) -> &'static str {
        match self {
            PairState::Unknown => "unknown",
            PairState::Synchronized => "synchronized",
            PairState::LocallyCreated => "locally_created",
            PairState::RemotelyCreated => "remotely_created",
            PairState::LocallyModified => "locally_modified",
            PairState::RemotelyModified => "remotely_modified",
            PairState::LocallyDeleted => "locally_deleted",
            PairState::RemotelyDeleted => "remotely_deleted",
            PairState::Deleted => "deleted",
            PairState::Conflicted => "conflicted",
        }
    }
}

impl Default for PairState {
    fn default() -> Self {
        PairState::Unknown
    }
}

impl fmt::Display for PairState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
