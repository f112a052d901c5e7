//! Correlates deletions and creations observed in one pass into moves.

use std::path::PathBuf;

use crate::archive::Transaction;
use crate::detect::{Change, Observation};
use crate::error::SyncError;
use crate::record::{parent_path, RecordKey};
use crate::state::Side;
use crate::util::base_name;

/// An entry that disappeared at `from` and reappeared at `to`, on one side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Move {
    pub side: Side,
    pub local_root: PathBuf,
    pub from: String,
    pub to: String,
}

impl Move {
    pub fn source_key(&self) -> RecordKey {
        RecordKey {
            local_root: self.local_root.clone(),
            path: self.from.clone(),
        }
    }

    pub fn target_key(&self) -> RecordKey {
        RecordKey {
            local_root: self.local_root.clone(),
            path: self.to.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct MoveTracker;

impl MoveTracker {
    /// Splits a pass into the observations that stay independent and the
    /// moves found among the others. A deletion or creation that could pair
    /// with more than one counterpart is left alone.
    pub fn correlate(observations: Vec<Observation>) -> (Vec<Observation>, Vec<Move>) {
        let deleted: Vec<usize> = indexes_of(&observations, Change::Deleted);
        let created: Vec<usize> = indexes_of(&observations, Change::Created);

        let mut pairs = Vec::new();
        for &d in &deleted {
            let candidates: Vec<usize> = created
                .iter()
                .cloned()
                .filter(|&c| is_move(&observations[d], &observations[c]))
                .collect();
            if candidates.len() != 1 {
                if candidates.len() > 1 {
                    debug!(
                        "{} has {} possible destinations, not pairing",
                        observations[d].key,
                        candidates.len()
                    );
                }
                continue;
            }
            let c = candidates[0];
            let sources = deleted
                .iter()
                .filter(|&&other| is_move(&observations[other], &observations[c]))
                .count();
            if sources != 1 {
                debug!("{} has {} possible sources, not pairing", observations[c].key, sources);
                continue;
            }
            pairs.push((d, c));
        }

        let mut paired = vec![false; observations.len()];
        let mut moves = Vec::with_capacity(pairs.len());
        for &(d, c) in &pairs {
            paired[d] = true;
            paired[c] = true;
            moves.push(Move {
                side: observations[d].side,
                local_root: observations[d].key.local_root.clone(),
                from: observations[d].key.path.clone(),
                to: observations[c].key.path.clone(),
            });
        }

        let independent = observations
            .into_iter()
            .zip(paired)
            .filter(|&(_, paired)| !paired)
            .map(|(observation, _)| observation)
            .collect();
        (independent, moves)
    }

    /// Writes the move provenance into both records. Returns false when both
    /// records already carried it.
    pub fn apply(tx: &mut Transaction<'_>, mv: &Move) -> Result<bool, SyncError> {
        let source_key = mv.source_key();
        let target_key = mv.target_key();
        let mut source = tx
            .tables()
            .state(&source_key)
            .cloned()
            .ok_or_else(|| SyncError::RecordNotFound(source_key.clone()))?;
        let mut target = tx
            .tables()
            .state(&target_key)
            .cloned()
            .ok_or_else(|| SyncError::RecordNotFound(target_key.clone()))?;

        let source_changed = source.record_move_to(mv.side, &mv.to);
        let target_changed = target.record_move_from(mv.side, &mv.from);
        if source_changed {
            tx.update_state(source)?;
        }
        if target_changed {
            tx.update_state(target)?;
        }
        Ok(source_changed || target_changed)
    }
}

fn indexes_of(observations: &[Observation], change: Change) -> Vec<usize> {
    observations
        .iter()
        .enumerate()
        .filter(|&(_, o)| o.change == change)
        .map(|(i, _)| i)
        .collect()
}

fn is_move(deleted: &Observation, created: &Observation) -> bool {
    if deleted.side != created.side
        || deleted.key.local_root != created.key.local_root
        || deleted.key.path == created.key.path
    {
        return false;
    }
    match deleted.side {
        Side::Remote => deleted.remote_id.is_some() && deleted.remote_id == created.remote_id,
        Side::Local => {
            let same_content = match (&deleted.digest, &created.digest) {
                (Some(a), Some(b)) => !a.is_empty() && a == b,
                _ => false,
            };
            same_content
                && deleted.folderish == created.folderish
                && (parent_path(&deleted.key.path) == parent_path(&created.key.path)
                    || base_name(&deleted.key.path) == base_name(&created.key.path))
        }
    }
}
