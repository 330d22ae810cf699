//! Adapter for the external backup tool (duplicity).
//!
//! Builds and runs the subprocess invocations for backups, pruning, and
//! collection-status queries. The tool's exit status is the sole success
//! signal for work commands; status output is parsed line by line for two
//! literal markers and everything else is ignored.

use crate::backup::job::{JobSequence, Step};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use bon::Builder;
use chrono::{NaiveDate, NaiveDateTime};
use itertools::Itertools;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, info};

pub static NO_CHAIN_MARKER: &str = "No backup chains with active signatures found";
pub static CHAIN_FOUND_MARKER: &str = "Found primary backup chain with matching signature chain:";
static CHAIN_START_PREFIX: &str = "Chain start time:";
static STATUS_TIME_FORMAT: &str = "%a %b %d %H:%M:%S %Y";

/// Last known full and incremental times for one target URL, at the
/// date-only granularity the decision rules work with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChainTimes {
    pub last_full: Option<NaiveDate>,
    pub last_diff: Option<NaiveDate>,
}

/// One configured tool binary plus the archive/cache directory every
/// invocation shares. With `dry_run` set, work commands are logged instead
/// of executed; status queries still run for real.
#[derive(Clone, Debug, Builder)]
pub struct DuplicityTool {
    #[builder(into)]
    bin: Arc<str>,
    #[builder(into)]
    archive_dir: Arc<Path>,
    #[builder(default)]
    dry_run: bool,
}

impl DuplicityTool {
    /// Query the collection status of a target URL and extract the last
    /// full / last incremental timestamps.
    pub fn chain_times(&self, url: &str) -> Result<ChainTimes> {
        let mut cmd = Command::new(self.bin.as_ref());
        cmd.arg("collection-status")
            .arg("--archive-dir")
            .arg(self.archive_dir.as_ref())
            .arg(url);
        debug!("querying `{}`", render_command(&cmd));
        let output = cmd.output()?;
        Ok(parse_collection_status(&String::from_utf8_lossy(
            &output.stdout,
        )))
    }

    /// Run one tool-backed step of a job sequence. Steps that carry no tool
    /// command (noop, nothing-due, lock-release) succeed without side
    /// effects; the wipe step is handled locally.
    pub fn run_step(&self, step: &Step, job: &JobSequence) -> Result<()> {
        if *step == Step::WipeTarget {
            return self.wipe_target(job);
        }
        match self.command_for(step, job) {
            Some(mut cmd) => self.run(&mut cmd),
            None => Ok(()),
        }
    }

    /// Run a pre/post hook through the shell.
    pub fn run_hook(&self, hook: &str) -> Result<()> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(hook);
        self.run(&mut cmd)
    }

    pub(crate) fn command_for(&self, step: &Step, job: &JobSequence) -> Option<Command> {
        let mut cmd = Command::new(self.bin.as_ref());
        match step {
            Step::RemoveOldFulls { keep } => {
                cmd.arg("remove-all-but-n-full").arg(keep.to_string());
                self.finish_prune(&mut cmd, job);
            }
            Step::RemoveOldIncrementals { keep } => {
                cmd.arg("remove-all-inc-of-but-n-full").arg(keep.to_string());
                self.finish_prune(&mut cmd, job);
            }
            Step::CleanupArchive => {
                cmd.arg("cleanup").arg("--extra-clean");
                self.finish_prune(&mut cmd, job);
            }
            Step::Backup(kind) => {
                cmd.arg(kind.to_string())
                    .arg("--archive-dir")
                    .arg(self.archive_dir.as_ref())
                    .arg("--volsize")
                    .arg(job.volsize.to_string());
                for exclude in &job.excludes {
                    cmd.arg("--exclude").arg(exclude);
                }
                cmd.arg(&job.target.source).arg(job.target.url.as_ref());
            }
            Step::Noop | Step::WipeTarget | Step::NothingDue | Step::ReleaseLock => return None,
        }
        Some(cmd)
    }

    fn finish_prune(&self, cmd: &mut Command, job: &JobSequence) {
        cmd.arg("--archive-dir")
            .arg(self.archive_dir.as_ref())
            .arg("--force")
            .arg(job.target.url.as_ref());
    }

    fn run(&self, cmd: &mut Command) -> Result<()> {
        let rendered = render_command(cmd);
        if self.dry_run {
            info!("dry-run: `{rendered}`");
            return Ok(());
        }
        info!("running `{rendered}`");
        let status = cmd.status()?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::Tool {
                command: rendered,
                status: status.code().unwrap_or(-1),
            })
        }
    }

    /// Delete the target location ahead of a new full when only one
    /// generation is kept. Only local target URLs can be wiped.
    fn wipe_target(&self, job: &JobSequence) -> Result<()> {
        let url = job.target.url.as_ref();
        let path = local_target_path(url).ok_or_else(|| {
            Error::section(
                job.target.section.as_ref(),
                format!("cannot wipe non-local target {url:?}"),
            )
        })?;
        if self.dry_run {
            info!("dry-run: wipe {:?}", path);
            return Ok(());
        }
        info!("wiping target location {:?}", path);
        if path.exists() {
            std::fs::remove_dir_all(&path)?;
        }
        std::fs::create_dir_all(&path)?;
        Ok(())
    }
}

pub(crate) fn local_target_path(url: &str) -> Option<PathBuf> {
    if let Some(rest) = url.strip_prefix("file://") {
        Some(PathBuf::from(rest))
    } else if url.contains("://") {
        None
    } else {
        Some(PathBuf::from(url))
    }
}

pub(crate) fn render_command(cmd: &Command) -> String {
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|a| a.to_string_lossy().to_string())
        .join(" ")
}

/// Extract the timestamp pair from collection-status output.
///
/// Exactly two markers are honored: the no-chains line (both timestamps
/// absent) and the found-chain line, whose `Chain start time:` line gives
/// the last full and whose following line gives the latest increment.
/// Unparsable timestamps and any other output are ignored.
pub fn parse_collection_status(output: &str) -> ChainTimes {
    let lines = output.lines().map(str::trim).collect_vec();
    if lines.iter().any(|line| line.contains(NO_CHAIN_MARKER)) {
        return ChainTimes::default();
    }
    let Some(found) = lines.iter().position(|line| line.contains(CHAIN_FOUND_MARKER)) else {
        return ChainTimes::default();
    };
    let Some(start) = lines[found..]
        .iter()
        .position(|line| line.starts_with(CHAIN_START_PREFIX))
        .map(|offset| found + offset)
    else {
        return ChainTimes::default();
    };

    ChainTimes {
        last_full: parse_status_time(lines[start]),
        last_diff: lines.get(start + 1).and_then(|line| parse_status_time(line)),
    }
}

fn parse_status_time(line: &str) -> Option<NaiveDate> {
    let (_, raw) = line.split_once(": ")?;
    let normalized = raw.split_whitespace().join(" ");
    NaiveDateTime::parse_from_str(&normalized, STATUS_TIME_FORMAT)
        .ok()
        .map(|dt| dt.date())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::decision::BackupKind;
    use crate::backup::policy::Target;

    fn tool() -> DuplicityTool {
        DuplicityTool::builder()
            .bin("duplicity")
            .archive_dir(Path::new("/var/cache/duplicity"))
            .build()
    }

    fn job(steps: [Step; 5]) -> JobSequence {
        JobSequence {
            target: Target {
                section: "home".into(),
                source: PathBuf::from("/home/user"),
                url: "file:///backup/home".into(),
                lock_key: "home".into(),
            },
            volsize: 200,
            excludes: vec![
                PathBuf::from("/home/user/tmp"),
                PathBuf::from("/home/user/cache"),
            ],
            pre_command: None,
            post_command: None,
            steps,
        }
    }

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn test_backup_command_arguments() {
        let job = job([
            Step::Noop,
            Step::Noop,
            Step::Noop,
            Step::Backup(BackupKind::Full),
            Step::ReleaseLock,
        ]);
        let cmd = tool()
            .command_for(&Step::Backup(BackupKind::Full), &job)
            .unwrap();

        assert_eq!(cmd.get_program().to_string_lossy(), "duplicity");
        assert_eq!(
            args_of(&cmd),
            vec![
                "full",
                "--archive-dir",
                "/var/cache/duplicity",
                "--volsize",
                "200",
                "--exclude",
                "/home/user/tmp",
                "--exclude",
                "/home/user/cache",
                "/home/user",
                "file:///backup/home",
            ]
        );
    }

    #[test]
    fn test_incremental_backup_command_type() {
        let job = job([
            Step::Noop,
            Step::Noop,
            Step::Noop,
            Step::Backup(BackupKind::Incremental),
            Step::ReleaseLock,
        ]);
        let cmd = tool()
            .command_for(&Step::Backup(BackupKind::Incremental), &job)
            .unwrap();
        assert_eq!(args_of(&cmd)[0], "incremental");
    }

    #[test]
    fn test_prune_command_arguments() {
        let job = job([
            Step::RemoveOldFulls { keep: 2 },
            Step::RemoveOldIncrementals { keep: 2 },
            Step::CleanupArchive,
            Step::Backup(BackupKind::Full),
            Step::ReleaseLock,
        ]);
        let tool = tool();

        let cmd = tool
            .command_for(&Step::RemoveOldFulls { keep: 2 }, &job)
            .unwrap();
        assert_eq!(
            args_of(&cmd),
            vec![
                "remove-all-but-n-full",
                "2",
                "--archive-dir",
                "/var/cache/duplicity",
                "--force",
                "file:///backup/home",
            ]
        );

        let cmd = tool
            .command_for(&Step::RemoveOldIncrementals { keep: 2 }, &job)
            .unwrap();
        assert_eq!(args_of(&cmd)[0], "remove-all-inc-of-but-n-full");

        let cmd = tool.command_for(&Step::CleanupArchive, &job).unwrap();
        assert_eq!(args_of(&cmd)[..2], ["cleanup", "--extra-clean"]);
    }

    #[test]
    fn test_bookkeeping_steps_have_no_command() {
        let job = job([
            Step::Noop,
            Step::Noop,
            Step::Noop,
            Step::NothingDue,
            Step::ReleaseLock,
        ]);
        let tool = tool();
        for step in [Step::Noop, Step::WipeTarget, Step::NothingDue, Step::ReleaseLock] {
            assert!(tool.command_for(&step, &job).is_none());
        }
    }

    #[test]
    fn test_parse_collection_status_without_chains() {
        let output = "Last full backup date: none\n\
                      No backup chains with active signatures found\n";
        assert_eq!(parse_collection_status(output), ChainTimes::default());
    }

    #[test]
    fn test_parse_collection_status_with_chain() {
        let output = "Synchronizing remote metadata to local cache...\n\
                      Found primary backup chain with matching signature chain:\n\
                      -------------------------\n\
                      Chain start time: Sat Jan 10 20:00:04 2026\n\
                      Chain end time: Tue Jan 13 20:00:05 2026\n\
                      Number of contained backup sets: 4\n";
        let times = parse_collection_status(output);
        assert_eq!(
            times.last_full,
            NaiveDate::from_ymd_opt(2026, 1, 10)
        );
        assert_eq!(
            times.last_diff,
            NaiveDate::from_ymd_opt(2026, 1, 13)
        );
    }

    #[test]
    fn test_parse_collection_status_with_padded_day() {
        let output = "Found primary backup chain with matching signature chain:\n\
                      Chain start time: Sat Jan  3 08:15:00 2026\n\
                      Chain end time: Fri Jan  9 08:15:00 2026\n";
        let times = parse_collection_status(output);
        assert_eq!(times.last_full, NaiveDate::from_ymd_opt(2026, 1, 3));
        assert_eq!(times.last_diff, NaiveDate::from_ymd_opt(2026, 1, 9));
    }

    #[test]
    fn test_parse_collection_status_ignores_unrelated_output() {
        assert_eq!(
            parse_collection_status("import of duplicity.backends failed\n"),
            ChainTimes::default()
        );
        assert_eq!(parse_collection_status(""), ChainTimes::default());
    }

    #[test]
    fn test_parse_collection_status_ignores_unparsable_timestamps() {
        let output = "Found primary backup chain with matching signature chain:\n\
                      Chain start time: not a timestamp\n\
                      Chain end time: also not one\n";
        assert_eq!(parse_collection_status(output), ChainTimes::default());
    }

    #[test]
    fn test_local_target_path() {
        assert_eq!(
            local_target_path("file:///backup/home"),
            Some(PathBuf::from("/backup/home"))
        );
        assert_eq!(
            local_target_path("/backup/home"),
            Some(PathBuf::from("/backup/home"))
        );
        assert_eq!(local_target_path("sftp://host//backup"), None);
    }

    #[test]
    fn test_dry_run_skips_execution() {
        let tool = DuplicityTool::builder()
            .bin("false")
            .archive_dir(Path::new("/var/cache/duplicity"))
            .dry_run(true)
            .build();
        let job = job([
            Step::Noop,
            Step::Noop,
            Step::Noop,
            Step::Backup(BackupKind::Full),
            Step::ReleaseLock,
        ]);
        // `false` would fail if executed; dry-run must not run it.
        assert!(tool.run_step(&Step::Backup(BackupKind::Full), &job).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_run_step_reports_exit_status() {
        let tool = DuplicityTool::builder()
            .bin("false")
            .archive_dir(Path::new("/var/cache/duplicity"))
            .build();
        let job = job([
            Step::Noop,
            Step::Noop,
            Step::Noop,
            Step::Backup(BackupKind::Full),
            Step::ReleaseLock,
        ]);
        match tool.run_step(&Step::Backup(BackupKind::Full), &job) {
            Err(Error::Tool { status, .. }) => assert_eq!(status, 1),
            other => panic!("expected tool failure, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_run_hook_through_shell() {
        let tool = tool();
        assert!(tool.run_hook("exit 0").is_ok());
        assert!(tool.run_hook("exit 3").is_err());
    }
}
