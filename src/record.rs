use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::FolderishPolicy;
use crate::error::SyncError;
use crate::reconcile;
use crate::state::{MicroState, PairState, Side};
use crate::util::{absolute, normalize_entry_path};

/// Identity of a state record: a root and a POSIX path relative to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub local_root: PathBuf,
    pub path: String,
}

impl RecordKey {
    /// Builds a key, normalizing both the root and the entry path.
    pub fn new<P: AsRef<Path>>(local_root: P, path: &str) -> Result<Self, SyncError> {
        Ok(RecordKey {
            local_root: absolute(local_root.as_ref())?,
            path: normalize_entry_path(path)?,
        })
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.local_root.display(), self.path)
    }
}

/// Stable remote identity of an entry, independent of its path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RemoteId {
    pub repo: String,
    pub reference: String,
}

/// Parent of an entry path; `None` for the root itself.
pub fn parent_path(path: &str) -> Option<String> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) | None => Some("/".to_owned()),
        Some(i) => Some(path[..i].to_owned()),
    }
}

/// What is known about one entry on both sides, as of the last observation.
///
/// `pair_state` is private: it only ever changes through `update_state`,
/// which derives it from the two micro-states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    key: RecordKey,
    parent_path: Option<String>,

    // baselines used to detect modifications
    pub last_local_updated: Option<DateTime<Utc>>,
    pub last_remote_updated: Option<DateTime<Utc>>,
    pub local_digest: Option<String>,
    pub remote_digest: Option<String>,

    pub folderish: bool,
    pub local_folderish: Option<bool>,
    pub remote_folderish: Option<bool>,

    pub remote_repo: Option<String>,
    pub remote_ref: Option<String>,

    local_state: MicroState,
    remote_state: MicroState,
    pair_state: PairState,

    // move provenance
    pub locally_moved_from: Option<String>,
    pub locally_moved_to: Option<String>,
    pub remotely_moved_from: Option<String>,
    pub remotely_moved_to: Option<String>,
}

impl StateRecord {
    /// A fresh record with both sides `unknown` and no baselines.
    pub fn new<P: AsRef<Path>>(local_root: P, path: &str) -> Result<Self, SyncError> {
        Ok(StateRecord::from_key(RecordKey::new(local_root, path)?))
    }

    pub fn from_key(key: RecordKey) -> Self {
        let parent_path = parent_path(&key.path);
        StateRecord {
            key,
            parent_path,
            last_local_updated: None,
            last_remote_updated: None,
            local_digest: None,
            remote_digest: None,
            folderish: true,
            local_folderish: None,
            remote_folderish: None,
            remote_repo: None,
            remote_ref: None,
            local_state: MicroState::Unknown,
            remote_state: MicroState::Unknown,
            pair_state: PairState::Unknown,
            locally_moved_from: None,
            locally_moved_to: None,
            remotely_moved_from: None,
            remotely_moved_to: None,
        }
    }

    pub fn with_remote(mut self, remote_repo: &str, remote_ref: &str) -> Self {
        self.remote_repo = Some(remote_repo.to_owned());
        self.remote_ref = Some(remote_ref.to_owned());
        self
    }

    pub fn with_states(mut self, local_state: MicroState, remote_state: MicroState) -> Self {
        self.update_state(Some(local_state), Some(remote_state), FolderishPolicy::Ignore);
        self
    }

    pub fn with_folderish(mut self, folderish: bool) -> Self {
        self.folderish = folderish;
        self
    }

    pub fn key(&self) -> &RecordKey {
        &self.key
    }

    pub fn local_root(&self) -> &Path {
        &self.key.local_root
    }

    pub fn path(&self) -> &str {
        &self.key.path
    }

    pub fn parent_path(&self) -> Option<&str> {
        self.parent_path.as_ref().map(String::as_str)
    }

    pub fn remote_id(&self) -> Option<RemoteId> {
        match (&self.remote_repo, &self.remote_ref) {
            (Some(repo), Some(reference)) => Some(RemoteId {
                repo: repo.clone(),
                reference: reference.clone(),
            }),
            _ => None,
        }
    }

    pub fn local_state(&self) -> MicroState {
        self.local_state
    }

    pub fn remote_state(&self) -> MicroState {
        self.remote_state
    }

    pub fn state(&self, side: Side) -> MicroState {
        match side {
            Side::Local => self.local_state,
            Side::Remote => self.remote_state,
        }
    }

    pub fn pair_state(&self) -> PairState {
        self.pair_state
    }

    /// True once both sides reported a folderish flag and they differ.
    pub fn folderish_mismatch(&self) -> bool {
        match (self.local_folderish, self.remote_folderish) {
            (Some(local), Some(remote)) => local != remote,
            _ => false,
        }
    }

    /// Changes either micro-state (or neither) and recomputes the pair state.
    pub fn update_state(
        &mut self,
        local_state: Option<MicroState>,
        remote_state: Option<MicroState>,
        policy: FolderishPolicy,
    ) {
        if let Some(state) = local_state {
            self.local_state = state;
        }
        if let Some(state) = remote_state {
            self.remote_state = state;
        }
        self.pair_state = reconcile::derive(
            self.local_state,
            self.remote_state,
            self.folderish_mismatch(),
            policy,
        );
    }

    pub fn set_state(&mut self, side: Side, state: MicroState, policy: FolderishPolicy) {
        match side {
            Side::Local => self.update_state(Some(state), None, policy),
            Side::Remote => self.update_state(None, Some(state), policy),
        }
    }

    pub fn moved_from(&self, side: Side) -> Option<&str> {
        let field = match side {
            Side::Local => &self.locally_moved_from,
            Side::Remote => &self.remotely_moved_from,
        };
        field.as_ref().map(String::as_str)
    }

    pub fn moved_to(&self, side: Side) -> Option<&str> {
        let field = match side {
            Side::Local => &self.locally_moved_to,
            Side::Remote => &self.remotely_moved_to,
        };
        field.as_ref().map(String::as_str)
    }

    /// True while this record is one end of a recorded move on some side: the
    /// `deleted` source of a move, or the `created` destination of one.
    /// Such records are not independent deletions or creations.
    pub fn in_recorded_move(&self) -> bool {
        [Side::Local, Side::Remote]
            .iter()
            .any(|&side| match self.state(side) {
                MicroState::Deleted => self.moved_to(side).is_some(),
                MicroState::Created => self.moved_from(side).is_some(),
                _ => false,
            })
    }

    /// Records that this entry was moved away to `to`. Returns false if that
    /// was already recorded.
    pub fn record_move_to(&mut self, side: Side, to: &str) -> bool {
        let field = match side {
            Side::Local => &mut self.locally_moved_to,
            Side::Remote => &mut self.remotely_moved_to,
        };
        replace_if_changed(field, to)
    }

    /// Records that this entry arrived from `from`. Returns false if that was
    /// already recorded.
    pub fn record_move_from(&mut self, side: Side, from: &str) -> bool {
        let field = match side {
            Side::Local => &mut self.locally_moved_from,
            Side::Remote => &mut self.remotely_moved_from,
        };
        replace_if_changed(field, from)
    }
}

fn replace_if_changed(field: &mut Option<String>, value: &str) -> bool {
    if field.as_ref().map(String::as_str) == Some(value) {
        false
    } else {
        *field = Some(value.to_owned());
        true
    }
}

/// A raw filesystem notification, kept as an audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEvent {
    /// Assigned by the store when the event is appended.
    pub id: u64,
    pub local_root: PathBuf,
    pub utc_time: DateTime<Utc>,
    pub path: String,
}

impl FileEvent {
    pub fn new<P: AsRef<Path>>(
        local_root: P,
        path: &str,
        utc_time: Option<DateTime<Utc>>,
    ) -> Result<Self, SyncError> {
        Ok(FileEvent {
            id: 0,
            local_root: absolute(local_root.as_ref())?,
            utc_time: utc_time.unwrap_or_else(Utc::now),
            path: normalize_entry_path(path)?,
        })
    }
}
