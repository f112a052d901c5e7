//! Change detection: compares a record's baseline with a fresh probe
//! snapshot and derives the new micro-state for the probed side.
//!
//! A refresh only ever mutates the side that was probed: a newer remote
//! timestamp marks the *remote* state `modified`, a newer local timestamp the
//! local one. Nothing is mutated when the probe fails with anything other
//! than `NotFound`.

use crate::config::FolderishPolicy;
use crate::error::{ProbeError, SyncError};
use crate::record::{RecordKey, RemoteId, StateRecord};
use crate::state::{MicroState, Side};

pub mod probe;
pub mod util;

pub use self::probe::{Cancellation, FsProbe, Probe, RemoteProbeFactory, Snapshot, TimeoutProbe};

/// What a single observation did to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    /// The entry had no record yet; one was created from this observation.
    Created,
    /// First observation of the side: the baseline was adopted, the
    /// micro-state left as it was.
    Baselined,
    Modified,
    /// The entry disappeared after having existed.
    Deleted,
    /// The entry is absent, and was not known to exist.
    Missing,
    Unchanged,
}

/// The result of refreshing one side of one record.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub key: RecordKey,
    pub side: Side,
    pub change: Change,
    /// The side's digest after the refresh; for deletions, the digest that was cleared.
    pub digest: Option<String>,
    pub remote_id: Option<RemoteId>,
    pub folderish: bool,
}

impl Observation {
    pub(crate) fn of(record: &StateRecord, side: Side, change: Change, digest: Option<String>) -> Self {
        Observation {
            key: record.key().clone(),
            side,
            change,
            digest,
            remote_id: record.remote_id(),
            folderish: record.folderish,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeDetector {
    policy: FolderishPolicy,
}

impl ChangeDetector {
    pub fn new(policy: FolderishPolicy) -> Self {
        ChangeDetector { policy }
    }

    pub fn policy(&self) -> FolderishPolicy {
        self.policy
    }

    /// Updates the local half of `record` from the local filesystem.
    pub fn refresh_local<P: Probe + ?Sized>(
        &self,
        record: &mut StateRecord,
        probe: &P,
    ) -> Result<Observation, SyncError> {
        self.refresh(Side::Local, record, probe)
    }

    /// Updates the remote half of `record` from the remote repository, using
    /// the record's stable remote reference.
    pub fn refresh_remote<P: Probe + ?Sized>(
        &self,
        record: &mut StateRecord,
        probe: &P,
    ) -> Result<Observation, SyncError> {
        self.refresh(Side::Remote, record, probe)
    }

    pub fn refresh<P: Probe + ?Sized>(
        &self,
        side: Side,
        record: &mut StateRecord,
        probe: &P,
    ) -> Result<Observation, SyncError> {
        if side == Side::Remote
            && record.remote_state() == MicroState::Deleted
            && record.moved_to(Side::Remote).is_some()
        {
            // the reference now belongs to the move's destination
            trace!("{} moved away remotely, not probing", record.key());
            return Ok(Observation::of(record, side, Change::Missing, None));
        }

        let identity = match side {
            Side::Local => record.path().to_owned(),
            Side::Remote => record
                .remote_ref
                .clone()
                .ok_or_else(|| SyncError::MissingRemoteReference(record.key().clone()))?,
        };

        let change = match probe.get_info(&identity) {
            Err(ProbeError::NotFound) => {
                if record.state(side).existed() {
                    debug!("{} {} no longer exists", side, record.key());
                    let cleared = match side {
                        Side::Local => record.local_digest.take(),
                        Side::Remote => record.remote_digest.take(),
                    };
                    record.set_state(side, MicroState::Deleted, self.policy);
                    return Ok(Observation::of(record, side, Change::Deleted, cleared));
                }
                trace!("{} {} is absent and was not known to exist", side, record.key());
                Change::Missing
            }
            Err(e) => {
                warn!("Could not probe {} {}: {}", side, record.key(), e);
                return Err(e.into());
            }
            Ok(snapshot) => match baseline(record, side) {
                None => {
                    debug!("Adopting first {} baseline for {}", side, record.key());
                    adopt(record, side, &snapshot);
                    Change::Baselined
                }
                Some(previous) if snapshot.last_modification_time > previous => {
                    debug!(
                        "{} {} modified: {} > {}",
                        side,
                        record.key(),
                        snapshot.last_modification_time,
                        previous
                    );
                    adopt(record, side, &snapshot);
                    record.set_state(side, MicroState::Modified, self.policy);
                    Change::Modified
                }
                Some(_) => Change::Unchanged,
            },
        };

        record.update_state(None, None, self.policy);
        let digest = match side {
            Side::Local => record.local_digest.clone(),
            Side::Remote => record.remote_digest.clone(),
        };
        Ok(Observation::of(record, side, change, digest))
    }
}

fn baseline(record: &StateRecord, side: Side) -> Option<chrono::DateTime<chrono::Utc>> {
    match side {
        Side::Local => record.last_local_updated,
        Side::Remote => record.last_remote_updated,
    }
}

fn adopt(record: &mut StateRecord, side: Side, snapshot: &Snapshot) {
    match side {
        Side::Local => {
            record.last_local_updated = Some(snapshot.last_modification_time);
            record.local_digest = snapshot.digest.clone();
            record.local_folderish = Some(snapshot.folderish);
        }
        Side::Remote => {
            record.last_remote_updated = Some(snapshot.last_modification_time);
            record.remote_digest = snapshot.digest.clone();
            record.remote_folderish = Some(snapshot.folderish);
        }
    }
    record.folderish = snapshot.folderish;
}
