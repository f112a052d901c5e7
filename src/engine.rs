//! The state engine: owns the store, serializes work per record and runs
//! refresh passes.
//!
//! A refresh holds only the lock of the record it refreshes while the probe
//! runs. The store is touched twice, once to read the record and once to
//! commit the result in a single transaction. If the record was removed in
//! between (a binding cascade), the commit fails with `RecordNotFound`
//! instead of bringing the record back.

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use std::path::Path;
use std::sync::Arc;

use crate::archive::{Store, Tables};
use crate::config::Config;
use crate::detect::util::scan_entry_paths;
use crate::detect::{
    Change, ChangeDetector, FsProbe, Observation, Probe, RemoteProbeFactory, TimeoutProbe,
};
use crate::error::{ProbeError, SyncError};
use crate::moves::{Move, MoveTracker};
use crate::record::{FileEvent, RecordKey, RemoteId, StateRecord};
use crate::registry::BindingRegistry;
use crate::state::{MicroState, PairState, Side};
use crate::util::{absolute, normalize_entry_path, FnvHashSet};

/// Per-record mutual exclusion. A key is only present while it is held.
#[derive(Default)]
pub struct RecordLocks {
    held: Mutex<FnvHashSet<RecordKey>>,
    released: Condvar,
}

impl RecordLocks {
    pub fn new() -> Self {
        RecordLocks::default()
    }

    /// Blocks until no one else holds `key`.
    pub fn lock(&self, key: &RecordKey) -> RecordGuard<'_> {
        let mut held = self.held.lock();
        while held.contains(key) {
            trace!("Waiting for {}", key);
            self.released.wait(&mut held);
        }
        held.insert(key.clone());
        RecordGuard {
            locks: self,
            key: key.clone(),
        }
    }

    pub fn held(&self) -> usize {
        self.held.lock().len()
    }
}

pub struct RecordGuard<'a> {
    locks: &'a RecordLocks,
    key: RecordKey,
}

impl<'a> Drop for RecordGuard<'a> {
    fn drop(&mut self) {
        self.locks.held.lock().remove(&self.key);
        self.locks.released.notify_all();
    }
}

/// What one pass observed.
#[derive(Debug, Default)]
pub struct PassReport {
    /// Independent transitions; observations that formed a move are not listed.
    pub observations: Vec<Observation>,
    pub moves: Vec<Move>,
    /// Records that could not be refreshed, and why.
    pub failures: Vec<(RecordKey, SyncError)>,
}

pub struct Engine<S> {
    store: Arc<S>,
    config: Config,
    detector: ChangeDetector,
    locks: RecordLocks,
}

impl<S: Store> Engine<S> {
    pub fn new(store: Arc<S>, config: Config) -> Self {
        let detector = ChangeDetector::new(config.folderish_policy);
        Engine {
            store,
            config,
            detector,
            locks: RecordLocks::new(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> BindingRegistry<S> {
        BindingRegistry::new(Arc::clone(&self.store))
    }

    pub fn locks(&self) -> &RecordLocks {
        &self.locks
    }

    /// Stores a new record. Its root must be bound.
    pub fn create_record(&self, mut record: StateRecord) -> Result<(), SyncError> {
        record.update_state(None, None, self.config.folderish_policy);
        let _guard = self.locks.lock(record.key());
        debug!("Creating state record {}", record.key());
        self.store.transaction(|tx| tx.insert_state(record))
    }

    pub fn record(&self, key: &RecordKey) -> Option<StateRecord> {
        self.store.read(|t| t.state(key).cloned())
    }

    pub fn children(&self, local_root: &Path, parent_path: &str) -> Result<Vec<StateRecord>, SyncError> {
        let local_root = absolute(local_root)?;
        let parent_path = normalize_entry_path(parent_path)?;
        Ok(self.store.read(|t| {
            t.children(&local_root, &parent_path)
                .into_iter()
                .cloned()
                .collect()
        }))
    }

    pub fn records_by_remote(&self, remote_repo: &str, remote_ref: &str) -> Vec<StateRecord> {
        let id = RemoteId {
            repo: remote_repo.to_owned(),
            reference: remote_ref.to_owned(),
        };
        self.store
            .read(|t| t.by_remote(&id).into_iter().cloned().collect())
    }

    pub fn records_in_state(
        &self,
        local_root: &Path,
        pair_state: PairState,
    ) -> Result<Vec<StateRecord>, SyncError> {
        let local_root = absolute(local_root)?;
        Ok(self.store.read(|t| {
            t.in_pair_state(&local_root, pair_state)
                .into_iter()
                .cloned()
                .collect()
        }))
    }

    pub fn refresh_local<P: Probe + ?Sized>(
        &self,
        key: &RecordKey,
        probe: &P,
    ) -> Result<Observation, SyncError> {
        self.refresh_with(Side::Local, key, probe, |_| {})
    }

    pub fn refresh_remote<P: Probe + ?Sized>(
        &self,
        key: &RecordKey,
        probe: &P,
    ) -> Result<Observation, SyncError> {
        self.refresh_with(Side::Remote, key, probe, |_| {})
    }

    fn refresh_with<P, F>(
        &self,
        side: Side,
        key: &RecordKey,
        probe: &P,
        prepare: F,
    ) -> Result<Observation, SyncError>
    where
        P: Probe + ?Sized,
        F: FnOnce(&mut StateRecord),
    {
        let _guard = self.locks.lock(key);
        self.refresh_locked(side, key, probe, prepare)
    }

    // the caller holds the lock of `key`
    fn refresh_locked<P, F>(
        &self,
        side: Side,
        key: &RecordKey,
        probe: &P,
        prepare: F,
    ) -> Result<Observation, SyncError>
    where
        P: Probe + ?Sized,
        F: FnOnce(&mut StateRecord),
    {
        let original = self
            .record(key)
            .ok_or_else(|| SyncError::RecordNotFound(key.clone()))?;

        let mut record = original.clone();
        prepare(&mut record);
        let observation = self.detector.refresh(side, &mut record, probe)?;

        if record == original {
            // nothing to write, but a cascade may still have removed it
            if self.record(key).is_none() {
                return Err(SyncError::RecordNotFound(key.clone()));
            }
        } else {
            self.store.transaction(|tx| tx.update_state(record))?;
        }
        Ok(observation)
    }

    /// Sets either micro-state explicitly, e.g. to `synchronized` once an
    /// entry has been transferred. Returns the updated record.
    pub fn update_state(
        &self,
        key: &RecordKey,
        local_state: Option<MicroState>,
        remote_state: Option<MicroState>,
    ) -> Result<StateRecord, SyncError> {
        let _guard = self.locks.lock(key);
        let policy = self.config.folderish_policy;
        self.store.transaction(|tx| {
            let mut record = tx
                .tables()
                .state(key)
                .cloned()
                .ok_or_else(|| SyncError::RecordNotFound(key.clone()))?;
            record.update_state(local_state, remote_state, policy);
            tx.update_state(record.clone())?;
            Ok(record)
        })
    }

    /// Probes an entry seen for the first time on `side`: the baseline is
    /// adopted and that side marked `created`. Returns `None` if the entry
    /// vanished before it could be probed. Nothing is stored.
    fn observe_new<P: Probe + ?Sized>(
        &self,
        side: Side,
        record: &mut StateRecord,
        probe: &P,
    ) -> Result<Option<Observation>, SyncError> {
        let observation = self.detector.refresh(side, record, probe)?;
        if observation.change == Change::Missing {
            debug!("{} vanished before it could be recorded", record.key());
            return Ok(None);
        }
        record.set_state(side, MicroState::Created, self.config.folderish_policy);
        Ok(Some(Observation::of(record, side, Change::Created, observation.digest)))
    }

    /// Walks a bound local root: new entries get records, known records are
    /// refreshed, and deletions are paired with creations into moves.
    ///
    /// The records of the pass stay locked while it probes, and everything
    /// the pass learned is committed in one transaction. Entries that cannot
    /// be read or probed end up in `failures` without stopping the pass.
    pub fn scan_local(&self, local_root: &Path) -> Result<PassReport, SyncError> {
        let probe = self.local_probe(local_root)?;
        let local_root = probe.root().to_path_buf();
        info!("Scanning {:?}", local_root);

        let scan = scan_entry_paths(&local_root, &self.config.ignore)?;
        let mut failures: Vec<(RecordKey, SyncError)> = scan
            .skipped
            .into_iter()
            .map(|(path, e)| {
                let key = RecordKey {
                    local_root: local_root.clone(),
                    path,
                };
                (key, e)
            })
            .collect();

        let known: Vec<RecordKey> = self.store.read(|t| {
            t.states_of(&local_root)
                .into_iter()
                .map(|record| record.key().clone())
                .collect()
        });
        let unseen: Vec<RecordKey> = {
            let known: FnvHashSet<&str> = known.iter().map(|key| key.path.as_str()).collect();
            scan.paths
                .into_iter()
                .filter(|path| !known.contains(path.as_str()))
                .map(|path| RecordKey {
                    local_root: local_root.clone(),
                    path,
                })
                .collect()
        };

        // sorted, like every other multi-record lock
        let mut keys: Vec<&RecordKey> = known.iter().chain(unseen.iter()).collect();
        keys.sort();
        let guards: Vec<RecordGuard<'_>> = keys.into_iter().map(|key| self.locks.lock(key)).collect();

        let mut observations = Vec::new();
        let mut updates = Vec::new();
        for key in &known {
            let original = match self.record(key) {
                Some(record) => record,
                None => {
                    failures.push((key.clone(), SyncError::RecordNotFound(key.clone())));
                    continue;
                }
            };
            let mut record = original.clone();
            match self.detector.refresh_local(&mut record, &probe) {
                Ok(observation) => {
                    observations.push(observation);
                    if record != original {
                        updates.push(record);
                    }
                }
                Err(e @ SyncError::Probe(_)) => {
                    warn!("Could not refresh {}: {}", key, e);
                    failures.push((key.clone(), e));
                }
                Err(e) => return Err(e),
            }
        }

        let mut inserts = Vec::new();
        for key in &unseen {
            let mut record = StateRecord::from_key(key.clone());
            match self.observe_new(Side::Local, &mut record, &probe) {
                Ok(Some(observation)) => {
                    observations.push(observation);
                    inserts.push(record);
                }
                Ok(None) => {}
                Err(e @ SyncError::Probe(_)) => {
                    warn!("Could not record {}: {}", key, e);
                    failures.push((key.clone(), e));
                }
                Err(e) => return Err(e),
            }
        }

        let rejected = self.store.transaction(|tx| {
            let mut rejected = Vec::new();
            for record in updates {
                if tx.tables().state(record.key()).is_none() {
                    rejected.push((record.key().clone(), SyncError::RecordNotFound(record.key().clone())));
                    continue;
                }
                tx.update_state(record)?;
            }
            for record in inserts {
                if tx.tables().state(record.key()).is_some() {
                    rejected.push((record.key().clone(), SyncError::DuplicateRecord(record.key().clone())));
                    continue;
                }
                tx.insert_state(record)?;
            }
            Ok(rejected)
        })?;
        drop(guards);

        if !rejected.is_empty() {
            let rejected_keys: FnvHashSet<&RecordKey> = rejected.iter().map(|(key, _)| key).collect();
            observations.retain(|o| !rejected_keys.contains(&o.key));
        }
        for (key, e) in rejected {
            warn!("Could not store {}: {}", key, e);
            failures.push((key, e));
        }

        let mut report = self.track_moves(observations)?;
        report.failures = failures;
        info!(
            "Scanned {:?}: {} changes, {} moves, {} failures",
            local_root,
            report
                .observations
                .iter()
                .filter(|o| o.change != Change::Unchanged && o.change != Change::Missing)
                .count(),
            report.moves.len(),
            report.failures.len()
        );
        Ok(report)
    }

    /// Registers an entry reported by a remote listing.
    ///
    /// If the path already has a record, its remote side is refreshed. If
    /// another record of the root carries the same remote reference and is
    /// not itself deleted remotely, the entry was moved there: the move is
    /// recorded on both records and reported instead of a creation.
    /// Otherwise a record is created with the remote side `created`.
    pub fn observe_remote<P: Probe + ?Sized>(
        &self,
        local_root: &Path,
        path: &str,
        remote_repo: &str,
        remote_ref: &str,
        probe: &P,
    ) -> Result<PassReport, SyncError> {
        let key = RecordKey::new(local_root, path)?;
        let id = RemoteId {
            repo: remote_repo.to_owned(),
            reference: remote_ref.to_owned(),
        };

        if let Some(source) = self.store.read(|t| remote_move_source(t, &key, &id)) {
            let (first, second) = if source < key { (&source, &key) } else { (&key, &source) };
            let _first = self.locks.lock(first);
            let _second = self.locks.lock(second);
            // re-check now that both are held
            if self.store.read(|t| remote_move_source(t, &key, &id)).as_ref() == Some(&source) {
                return self.move_remote_locked(&source, &key, &id, probe);
            }
            return self.observe_remote_locked(&key, &id, probe);
        }

        let _guard = self.locks.lock(&key);
        self.observe_remote_locked(&key, &id, probe)
    }

    // the caller holds the lock of `key`
    fn observe_remote_locked<P: Probe + ?Sized>(
        &self,
        key: &RecordKey,
        id: &RemoteId,
        probe: &P,
    ) -> Result<PassReport, SyncError> {
        let observation = if self.record(key).is_some() {
            self.refresh_locked(Side::Remote, key, probe, |record| {
                record.remote_repo = Some(id.repo.clone());
                record.remote_ref = Some(id.reference.clone());
            })?
        } else {
            let mut record = StateRecord::from_key(key.clone()).with_remote(&id.repo, &id.reference);
            let observation = self
                .observe_new(Side::Remote, &mut record, probe)?
                .ok_or(SyncError::Probe(ProbeError::NotFound))?;
            self.store.transaction(|tx| tx.insert_state(record))?;
            observation
        };
        Ok(PassReport {
            observations: vec![observation],
            ..PassReport::default()
        })
    }

    // the caller holds the locks of `source` and `target`
    fn move_remote_locked<P: Probe + ?Sized>(
        &self,
        source_key: &RecordKey,
        target_key: &RecordKey,
        id: &RemoteId,
        probe: &P,
    ) -> Result<PassReport, SyncError> {
        let policy = self.config.folderish_policy;
        let mut source = self
            .record(source_key)
            .ok_or_else(|| SyncError::RecordNotFound(source_key.clone()))?;

        // the destination inherits the remote baseline, so the refresh below
        // only reports a change if the entry also changed while moving
        let mut target = StateRecord::from_key(target_key.clone()).with_remote(&id.repo, &id.reference);
        target.last_remote_updated = source.last_remote_updated;
        target.remote_digest = source.remote_digest.clone();
        target.remote_folderish = source.remote_folderish;
        target.folderish = source.folderish;

        let observation = self.detector.refresh_remote(&mut target, probe)?;
        if observation.change == Change::Missing {
            debug!("{} vanished before it could be recorded", target_key);
            return Err(SyncError::Probe(ProbeError::NotFound));
        }
        target.set_state(Side::Remote, MicroState::Created, policy);
        target.record_move_from(Side::Remote, source_key.path.as_str());

        source.record_move_to(Side::Remote, target_key.path.as_str());
        source.remote_digest = None;
        source.set_state(Side::Remote, MicroState::Deleted, policy);

        self.store.transaction(|tx| {
            tx.update_state(source)?;
            tx.insert_state(target)
        })?;

        let mv = Move {
            side: Side::Remote,
            local_root: target_key.local_root.clone(),
            from: source_key.path.clone(),
            to: target_key.path.clone(),
        };
        info!("remote move in {:?}: {} -> {}", mv.local_root, mv.from, mv.to);
        let observations = if observation.change == Change::Modified {
            vec![observation]
        } else {
            Vec::new()
        };
        Ok(PassReport {
            observations,
            moves: vec![mv],
            failures: Vec::new(),
        })
    }

    /// Pairs deletions and creations of one pass into moves and records all
    /// of them in one transaction. Moves that were already recorded are not
    /// reported again.
    pub fn track_moves(&self, observations: Vec<Observation>) -> Result<PassReport, SyncError> {
        let (observations, candidates) = MoveTracker::correlate(observations);
        if candidates.is_empty() {
            return Ok(PassReport {
                observations,
                ..PassReport::default()
            });
        }

        let mut keys: Vec<RecordKey> = candidates
            .iter()
            .flat_map(|mv| vec![mv.source_key(), mv.target_key()])
            .collect();
        keys.sort();
        keys.dedup();
        let _guards: Vec<RecordGuard<'_>> = keys.iter().map(|key| self.locks.lock(key)).collect();

        let moves = self.store.transaction(|tx| {
            let mut applied = Vec::new();
            for mv in candidates {
                let gone = [mv.source_key(), mv.target_key()]
                    .iter()
                    .find(|key| tx.tables().state(key).is_none())
                    .cloned();
                if let Some(key) = gone {
                    warn!("Dropping move {} -> {}: {} is gone", mv.from, mv.to, key);
                    continue;
                }
                if MoveTracker::apply(tx, &mv)? {
                    info!("{} move in {:?}: {} -> {}", mv.side, mv.local_root, mv.from, mv.to);
                    applied.push(mv);
                } else {
                    debug!("Move {} -> {} already recorded", mv.from, mv.to);
                }
            }
            Ok(applied)
        })?;
        Ok(PassReport {
            observations,
            moves,
            failures: Vec::new(),
        })
    }

    /// Moves recorded in a root that the executor has not settled yet.
    pub fn recorded_moves(&self, local_root: &Path) -> Result<Vec<Move>, SyncError> {
        let local_root = absolute(local_root)?;
        Ok(self.store.read(|t| t.recorded_moves(&local_root)))
    }

    /// Appends a raw filesystem event to the audit trail and returns its id.
    pub fn record_event(
        &self,
        local_root: &Path,
        path: &str,
        utc_time: Option<DateTime<Utc>>,
    ) -> Result<u64, SyncError> {
        let event = FileEvent::new(local_root, path, utc_time)?;
        self.store.transaction(|tx| tx.append_event(event))
    }

    pub fn local_probe(&self, local_root: &Path) -> Result<FsProbe, SyncError> {
        let root = self
            .registry()
            .root_binding(local_root)?
            .ok_or_else(|| SyncError::BindingNotFound(local_root.to_path_buf()))?;
        Ok(FsProbe::for_root(&root))
    }

    /// Connects a remote probe for a root, bounded by the configured timeout.
    pub fn remote_probe<F: RemoteProbeFactory>(
        &self,
        local_root: &Path,
        factory: &F,
    ) -> Result<TimeoutProbe<F::Probe>, SyncError> {
        let target = self.registry().remote_target(local_root)?;
        debug!("Connecting to {:?}", target);
        let probe = factory.connect(&target)?;
        Ok(TimeoutProbe::new(probe, self.config.remote_timeout))
    }
}

/// The record `id` was last seen at, if the entry now reported at `key` is
/// that record's entry moved within the same root.
fn remote_move_source(tables: &Tables, key: &RecordKey, id: &RemoteId) -> Option<RecordKey> {
    if tables.state(key).is_some() {
        return None;
    }
    let candidates: Vec<&StateRecord> = tables
        .by_remote(id)
        .into_iter()
        .filter(|record| {
            record.local_root() == key.local_root
                && record.path() != key.path
                && record.remote_state() != MicroState::Deleted
        })
        .collect();
    match candidates.as_slice() {
        [record] => Some(record.key().clone()),
        [] => None,
        _ => {
            debug!("{} remote records share {:?}, not treating as a move", candidates.len(), id);
            None
        }
    }
}
