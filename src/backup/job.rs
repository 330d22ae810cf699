//! Typed job steps and the per-target job builder.
//!
//! A job sequence is an ordered list of exactly five typed steps: three
//! pruning steps, a backup (or nothing-due placeholder) step, and the lock
//! release. The dispatcher runs them as a conjunctive chain and tells the
//! nothing-due placeholder apart from a genuine tool failure by step
//! identity, never by inspecting process output.

use crate::backup::decision::{BackupDecision, BackupKind};
use crate::backup::policy::{SectionConfig, Target};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::retention::prune_plan;
use itertools::Itertools;
use std::path::PathBuf;
use std::sync::Arc;

/// One step of a job sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Step {
    Noop,
    /// Remove all but `keep` full chains.
    RemoveOldFulls { keep: u32 },
    /// Remove the incrementals of all but `keep` full chains.
    RemoveOldIncrementals { keep: u32 },
    /// Extra-clean leftover archive metadata.
    CleanupArchive,
    /// Delete the target location before writing a new full (retention 1).
    WipeTarget,
    Backup(BackupKind),
    /// Deterministic placeholder meaning "nothing is due". Never executed;
    /// recognized by the dispatcher, which releases the lock out of band.
    NothingDue,
    ReleaseLock,
}

/// Everything a worker needs to process one target.
#[derive(Clone, Debug)]
pub struct JobSequence {
    pub target: Target,
    pub volsize: u32,
    pub excludes: Vec<PathBuf>,
    pub pre_command: Option<Arc<str>>,
    pub post_command: Option<Arc<str>>,
    pub steps: [Step; 5],
}

/// Assemble the command sequence for one locked target.
///
/// Fails only on the exclude-file lookup; the failure is local to this
/// target and leaves every other target untouched.
pub fn build_job(
    section: &SectionConfig,
    target: Target,
    decision: BackupDecision,
) -> Result<JobSequence> {
    let excludes = assemble_excludes(section, &target)?;
    let [prune_1, prune_2, prune_3] = prune_plan(decision, *section.retention());
    let backup = match decision.kind() {
        Some(kind) => Step::Backup(kind),
        None => Step::NothingDue,
    };

    Ok(JobSequence {
        volsize: *section.volsize(),
        excludes,
        pre_command: section.pre_command().clone(),
        post_command: section.post_command().clone(),
        target,
        steps: [prune_1, prune_2, prune_3, backup, Step::ReleaseLock],
    })
}

/// The exclusion set for one target: inline excludes plus the entries of
/// the section's exclude file, each rewritten relative to the section
/// source, then narrowed to sub-paths of the target actually being
/// processed. The narrowing matters when several subdirectories of one
/// section run as independent targets.
fn assemble_excludes(section: &SectionConfig, target: &Target) -> Result<Vec<PathBuf>> {
    let mut entries = section
        .exclude()
        .iter()
        .map(|entry| section.source().join(entry.as_ref()))
        .collect_vec();

    if let Some(file) = section.exclude_file() {
        let text = std::fs::read_to_string(file).map_err(|e| {
            Error::section(
                target.section.as_ref(),
                format!("cannot read exclude file {:?}: {}", file, e),
            )
        })?;
        entries.extend(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(|line| section.source().join(line)),
        );
    }

    Ok(entries
        .into_iter()
        .filter(|path| path.starts_with(&target.source))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn section(temp_dir: &TempDir) -> SectionConfig {
        SectionConfig::builder()
            .source(temp_dir.path())
            .target("file:///backup/home")
            .full_interval(1)
            .diff_interval(1)
            .full_bak_day("sat")
            .volsize(200)
            .retention(3)
            .exclude(vec!["tmp".into(), "cache".into()])
            .build()
    }

    fn single_target(temp_dir: &TempDir) -> Target {
        let name: Arc<str> = "home".into();
        section(temp_dir).resolve_targets(&name).unwrap().remove(0)
    }

    #[test]
    fn test_full_job_has_prune_triplet_backup_and_release() {
        let temp_dir = TempDir::new().unwrap();
        let job = build_job(
            &section(&temp_dir),
            single_target(&temp_dir),
            BackupDecision::Full,
        )
        .unwrap();

        assert_eq!(
            job.steps,
            [
                Step::RemoveOldFulls { keep: 2 },
                Step::RemoveOldIncrementals { keep: 2 },
                Step::CleanupArchive,
                Step::Backup(BackupKind::Full),
                Step::ReleaseLock,
            ]
        );
        assert_eq!(job.volsize, 200);
        assert_eq!(job.excludes.len(), 2);
        assert!(job.excludes.contains(&temp_dir.path().join("tmp")));
    }

    #[test]
    fn test_retention_one_job_wipes_before_backup() {
        let temp_dir = TempDir::new().unwrap();
        let section = SectionConfig::builder()
            .source(temp_dir.path())
            .target("file:///backup/home")
            .full_interval(1)
            .diff_interval(1)
            .full_bak_day("sat")
            .volsize(200)
            .retention(1)
            .build();
        let name: Arc<str> = "home".into();
        let target = section.resolve_targets(&name).unwrap().remove(0);

        let job = build_job(&section, target, BackupDecision::Full).unwrap();
        assert_eq!(
            job.steps,
            [
                Step::Noop,
                Step::Noop,
                Step::WipeTarget,
                Step::Backup(BackupKind::Full),
                Step::ReleaseLock,
            ]
        );
    }

    #[test]
    fn test_skip_job_carries_nothing_due_placeholder() {
        let temp_dir = TempDir::new().unwrap();
        let job = build_job(
            &section(&temp_dir),
            single_target(&temp_dir),
            BackupDecision::Skip,
        )
        .unwrap();

        assert_eq!(
            job.steps,
            [
                Step::Noop,
                Step::Noop,
                Step::Noop,
                Step::NothingDue,
                Step::ReleaseLock,
            ]
        );
    }

    #[test]
    fn test_incremental_job_prunes_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let job = build_job(
            &section(&temp_dir),
            single_target(&temp_dir),
            BackupDecision::Incremental,
        )
        .unwrap();

        assert_eq!(job.steps[0], Step::Noop);
        assert_eq!(job.steps[1], Step::Noop);
        assert_eq!(job.steps[2], Step::Noop);
        assert_eq!(job.steps[3], Step::Backup(BackupKind::Incremental));
    }

    #[test]
    fn test_excludes_merge_inline_and_file_entries() {
        let temp_dir = TempDir::new().unwrap();
        let exclude_file = temp_dir.path().join("home.exclude");
        std::fs::write(&exclude_file, "downloads\n\n  videos  \n").unwrap();

        let section = SectionConfig::builder()
            .source(temp_dir.path())
            .target("file:///backup/home")
            .full_interval(1)
            .diff_interval(1)
            .full_bak_day("sat")
            .volsize(200)
            .retention(3)
            .exclude(vec!["tmp".into()])
            .exclude_file(exclude_file)
            .build();
        let name: Arc<str> = "home".into();
        let target = section.resolve_targets(&name).unwrap().remove(0);

        let job = build_job(&section, target, BackupDecision::Full).unwrap();
        assert_eq!(job.excludes.len(), 3);
        assert!(job.excludes.contains(&temp_dir.path().join("tmp")));
        assert!(job.excludes.contains(&temp_dir.path().join("downloads")));
        assert!(job.excludes.contains(&temp_dir.path().join("videos")));
    }

    #[test]
    fn test_excludes_narrowed_to_subdirectory_target() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir(temp_dir.path().join("alice")).unwrap();
        std::fs::create_dir(temp_dir.path().join("bob")).unwrap();

        let section = SectionConfig::builder()
            .source(temp_dir.path())
            .target("file:///backup/home")
            .full_interval(1)
            .diff_interval(1)
            .full_bak_day("sat")
            .volsize(200)
            .retention(3)
            .multiple_dirs(true)
            .exclude(vec!["alice/tmp".into(), "bob/tmp".into(), "shared".into()])
            .build();
        let name: Arc<str> = "home".into();
        let targets = section.resolve_targets(&name).unwrap();

        let alice = build_job(&section, targets[0].clone(), BackupDecision::Full).unwrap();
        assert_eq!(alice.excludes, vec![temp_dir.path().join("alice/tmp")]);

        let bob = build_job(&section, targets[1].clone(), BackupDecision::Full).unwrap();
        assert_eq!(bob.excludes, vec![temp_dir.path().join("bob/tmp")]);
    }

    #[test]
    fn test_missing_exclude_file_aborts_only_this_target() {
        let temp_dir = TempDir::new().unwrap();
        let section = SectionConfig::builder()
            .source(temp_dir.path())
            .target("file:///backup/home")
            .full_interval(1)
            .diff_interval(1)
            .full_bak_day("sat")
            .volsize(200)
            .retention(3)
            .exclude_file(temp_dir.path().join("missing.exclude"))
            .build();
        let name: Arc<str> = "home".into();
        let target = section.resolve_targets(&name).unwrap().remove(0);

        let err = build_job(&section, target, BackupDecision::Full).unwrap_err();
        assert!(err.to_string().contains("exclude file"));
    }
}
