use crate::config::FolderishPolicy;
use crate::state::{MicroState, PairState};

use crate::state::MicroState::{Created, Deleted, Modified, Synchronized, Unknown};

/// Every (local, remote) pair with a meaningful summary. Anything else is `PairState::Unknown`.
pub const PAIR_STATES: [(MicroState, MicroState, PairState); 12] = [
    // regular cases
    (Unknown, Unknown, PairState::Unknown),
    (Synchronized, Synchronized, PairState::Synchronized),
    (Created, Unknown, PairState::LocallyCreated),
    (Unknown, Created, PairState::RemotelyCreated),
    (Modified, Synchronized, PairState::LocallyModified),
    (Synchronized, Modified, PairState::RemotelyModified),
    (Deleted, Synchronized, PairState::LocallyDeleted),
    (Synchronized, Deleted, PairState::RemotelyDeleted),
    (Deleted, Deleted, PairState::Deleted),
    // conflict cases
    (Modified, Deleted, PairState::Conflicted),
    (Deleted, Modified, PairState::Conflicted),
    (Modified, Modified, PairState::Conflicted),
];

/// Summarises a pair of micro-states. The local state always comes first.
pub fn resolve(local: MicroState, remote: MicroState) -> PairState {
    PAIR_STATES
        .iter()
        .find(|&&(l, r, _)| l == local && r == remote)
        .map(|&(_, _, pair)| pair)
        .unwrap_or(PairState::Unknown)
}

/// The summary a record stores: `resolve`, unless the policy turns a
/// folder/file disagreement between the two sides into a conflict.
pub fn derive(
    local: MicroState,
    remote: MicroState,
    folderish_mismatch: bool,
    policy: FolderishPolicy,
) -> PairState {
    match policy {
        FolderishPolicy::Conflict if folderish_mismatch => {
            debug!("Folderish flags disagree, reporting a conflict");
            PairState::Conflicted
        }
        _ => resolve(local, remote),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_listed_pairs_resolve_to_table_value() {
        assert_eq!(resolve(Unknown, Unknown), PairState::Unknown);
        assert_eq!(resolve(Synchronized, Synchronized), PairState::Synchronized);
        assert_eq!(resolve(Created, Unknown), PairState::LocallyCreated);
        assert_eq!(resolve(Unknown, Created), PairState::RemotelyCreated);
        assert_eq!(resolve(Modified, Synchronized), PairState::LocallyModified);
        assert_eq!(resolve(Synchronized, Modified), PairState::RemotelyModified);
        assert_eq!(resolve(Deleted, Synchronized), PairState::LocallyDeleted);
        assert_eq!(resolve(Synchronized, Deleted), PairState::RemotelyDeleted);
        assert_eq!(resolve(Deleted, Deleted), PairState::Deleted);
        assert_eq!(resolve(Modified, Deleted), PairState::Conflicted);
        assert_eq!(resolve(Deleted, Modified), PairState::Conflicted);
        assert_eq!(resolve(Modified, Modified), PairState::Conflicted);
    }

    #[test]
    fn test_unlisted_pairs_are_unknown() {
        let mut unlisted = 0;
        for &local in &MicroState::ALL {
            for &remote in &MicroState::ALL {
                let listed = PAIR_STATES.iter().any(|&(l, r, _)| l == local && r == remote);
                if !listed {
                    unlisted += 1;
                    assert_eq!(resolve(local, remote), PairState::Unknown, "{} / {}", local, remote);
                }
            }
        }
        assert_eq!(unlisted, MicroState::ALL.len() * MicroState::ALL.len() - PAIR_STATES.len());
    }

    #[test]
    fn test_order_matters() {
        assert_eq!(resolve(Created, Unknown), PairState::LocallyCreated);
        assert_eq!(resolve(Unknown, Created), PairState::RemotelyCreated);
        assert_eq!(resolve(Synchronized, Created), PairState::Unknown);
    }

    #[test]
    fn test_folderish_policy() {
        assert_eq!(
            derive(Synchronized, Synchronized, true, FolderishPolicy::Ignore),
            PairState::Synchronized
        );
        assert_eq!(
            derive(Synchronized, Synchronized, true, FolderishPolicy::Conflict),
            PairState::Conflicted
        );
        assert_eq!(
            derive(Synchronized, Synchronized, false, FolderishPolicy::Conflict),
            PairState::Synchronized
        );
    }

    fn micro_state() -> impl Strategy<Value = MicroState> {
        prop::sample::select(MicroState::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn resolve_is_deterministic(local in micro_state(), remote in micro_state()) {
            prop_assert_eq!(resolve(local, remote), resolve(local, remote));
        }

        #[test]
        fn derive_without_mismatch_is_resolve(local in micro_state(), remote in micro_state()) {
            prop_assert_eq!(derive(local, remote, false, FolderishPolicy::Conflict), resolve(local, remote));
            prop_assert_eq!(derive(local, remote, true, FolderishPolicy::Ignore), resolve(local, remote));
        }
    }
}
