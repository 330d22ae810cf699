//! Retention enforcement.
//!
//! Derives the pruning work that precedes a new full backup. The plan keeps
//! storage bounded: at no point do more than `retention + 1` full
//! generations exist, and with a retention of 1 the old generation is
//! deleted before the new full is written.

use crate::backup::decision::BackupDecision;
use crate::backup::job::Step;

/// The three pruning steps that open every job sequence.
///
/// Pruning is tied to a full backup being due: incremental and skipped runs
/// prune nothing. With `retention >= 2` the tool removes all but
/// `retention - 1` full chains (the full about to be created brings the
/// count back up), drops the incrementals tied to the pruned fulls, and
/// extra-cleans the archive metadata. With `retention == 1` the tool cannot
/// prune "all but zero", so the target location is wiped instead.
pub fn prune_plan(decision: BackupDecision, retention: u32) -> [Step; 3] {
    if decision != BackupDecision::Full {
        return [Step::Noop, Step::Noop, Step::Noop];
    }

    if retention >= 2 {
        let keep = retention - 1;
        [
            Step::RemoveOldFulls { keep },
            Step::RemoveOldIncrementals { keep },
            Step::CleanupArchive,
        ]
    } else {
        [Step::Noop, Step::Noop, Step::WipeTarget]
    }
}
