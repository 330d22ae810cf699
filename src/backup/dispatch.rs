//! Concurrent dispatch of job sequences.
//!
//! The producer walks every section and target, acquires the target's lock,
//! queries the tool for chain times, and builds a job sequence. In parallel
//! mode the sequences go through a shared FIFO channel drained by a fixed
//! pool of workers; closing the channel is the shutdown signal. In serial
//! mode each sequence runs immediately in enumeration order with identical
//! per-job semantics.
//!
//! There is no timeout or cancellation: a hung external tool blocks its
//! worker until it exits. The only shared state between workers is the
//! queue; every job owns exactly one lock key, acquired before enqueue and
//! released by that job alone.

use crate::backup::decision::decide;
use crate::backup::duplicity::DuplicityTool;
use crate::backup::job::{build_job, JobSequence, Step};
use crate::backup::lock::{LockOutcome, LockProvider, PidFileLocks};
use crate::backup::policy::{RunnerConfig, SectionConfig, Target};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use chrono::NaiveDate;
use rayon::ThreadPoolBuilder;
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{error, info, warn};

/// Counts of how this run's targets ended up.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub completed: usize,
    pub nothing_due: usize,
    pub lock_skipped: usize,
    pub failed: usize,
}

#[derive(Debug)]
enum JobOutcome {
    Completed,
    NothingDue,
    Failed(Error),
}

/// One backup pass over every configured section.
pub struct Dispatcher {
    config: Arc<RunnerConfig>,
    locks: Arc<dyn LockProvider>,
    tool: DuplicityTool,
    today: NaiveDate,
    serial: bool,
}

impl Dispatcher {
    pub fn new(
        config: Arc<RunnerConfig>,
        locks: Arc<dyn LockProvider>,
        tool: DuplicityTool,
        today: NaiveDate,
        serial: bool,
    ) -> Self {
        Self {
            config,
            locks,
            tool,
            today,
            serial,
        }
    }

    /// Wire up the PID-file lock provider and the tool adapter from the
    /// loaded configuration.
    pub fn from_config(
        config: Arc<RunnerConfig>,
        today: NaiveDate,
        serial: bool,
        dry_run: bool,
    ) -> Self {
        let locks = Arc::new(PidFileLocks::builder().dir(config.lock_dir.clone()).build());
        let tool = DuplicityTool::builder()
            .bin(config.tool.clone())
            .archive_dir(config.archive_dir.clone())
            .dry_run(dry_run)
            .build();
        Self::new(config, locks, tool, today, serial)
    }

    /// Run the pass. Parallel when a worker pool is configured and can be
    /// built, serial otherwise; outcomes are identical modulo timing.
    pub fn run(&self) -> Result<RunSummary> {
        if self.serial || self.config.workers <= 1 {
            return self.run_serial();
        }
        // One extra thread: the producing scope body occupies a pool thread
        // while the workers drain the queue.
        match ThreadPoolBuilder::new()
            .num_threads(self.config.workers + 1)
            .build()
        {
            Ok(pool) => self.run_parallel(&pool),
            Err(e) => {
                warn!("cannot build worker pool, falling back to serial execution: {e}");
                self.run_serial()
            }
        }
    }

    fn run_serial(&self) -> Result<RunSummary> {
        let mut outcomes = Vec::new();
        let (lock_skipped, prepare_failed) = self.enumerate(|job| {
            outcomes.push(self.run_sequence(&job));
            Ok(())
        })?;
        Ok(summarize(outcomes, lock_skipped, prepare_failed))
    }

    fn run_parallel(&self, pool: &rayon::ThreadPool) -> Result<RunSummary> {
        let (job_tx, job_rx) = channel::<JobSequence>();
        let job_rx = Arc::new(Mutex::new(job_rx));
        let (outcome_tx, outcome_rx) = channel::<JobOutcome>();

        let produced = pool.scope(|scope| {
            for _ in 0..self.config.workers {
                let job_rx = job_rx.clone();
                let outcome_tx = outcome_tx.clone();
                scope.spawn(move |_| loop {
                    let job = match job_rx.lock().unwrap().recv() {
                        Ok(job) => job,
                        // Queue closed: the producer is done, worker exits.
                        Err(_) => break,
                    };
                    let outcome = self.run_sequence(&job);
                    if outcome_tx.send(outcome).is_err() {
                        break;
                    }
                });
            }

            let produced = self.enumerate(|job| job_tx.send(job).map_err(Error::from));
            drop(job_tx);
            produced
        });
        drop(outcome_tx);

        let (lock_skipped, prepare_failed) = produced?;
        Ok(summarize(
            outcome_rx.iter().collect(),
            lock_skipped,
            prepare_failed,
        ))
    }

    /// Walk sections and targets, feeding every successfully locked and
    /// built job to the sink. Per-target failures never halt the walk.
    fn enumerate<F: FnMut(JobSequence) -> Result<()>>(
        &self,
        mut sink: F,
    ) -> Result<(usize, usize)> {
        let mut lock_skipped = 0;
        let mut failed = 0;
        for (name, section) in &self.config.sections {
            let targets = match section.resolve_targets(name) {
                Ok(targets) => targets,
                Err(e) => {
                    error!("skipping section {name}: {e}");
                    failed += 1;
                    continue;
                }
            };
            for target in targets {
                match self.prepare(section, target) {
                    Ok(Some(job)) => sink(job)?,
                    Ok(None) => lock_skipped += 1,
                    Err(e) => {
                        error!("{e}");
                        failed += 1;
                    }
                }
            }
        }
        Ok((lock_skipped, failed))
    }

    /// Lock one target and build its job sequence. Returns `None` when the
    /// key is held by a live process. Preparation failures after the lock
    /// was granted release it again: the sequence never started, so the
    /// keep-the-lock rule for genuine backup failures does not apply.
    fn prepare(&self, section: &SectionConfig, target: Target) -> Result<Option<JobSequence>> {
        match self.locks.acquire(&target.lock_key)? {
            LockOutcome::Denied { holder } => {
                info!(
                    "{} is locked by running process {holder}, skipping",
                    target.lock_key
                );
                return Ok(None);
            }
            LockOutcome::Reclaimed { stale_pid } => {
                info!(
                    "reclaimed stale lock {} (previous owner {stale_pid:?} is gone)",
                    target.lock_key
                );
            }
            LockOutcome::Granted => {}
        }

        let prepared = self.tool.chain_times(&target.url).and_then(|times| {
            let decision = decide(
                self.today,
                *section.full_interval(),
                *section.diff_interval(),
                section.full_bak_day(),
                times.last_full,
                times.last_diff,
            );
            info!("{}: decided {:?}", target.url, decision);
            build_job(section, target.clone(), decision)
        });

        match prepared {
            Ok(job) => Ok(Some(job)),
            Err(e) => {
                let e = match self.locks.release(&target.lock_key) {
                    Ok(()) => e,
                    Err(release_err) => e.chain(release_err),
                };
                Err(e.with_msg(format!("preparing target {}", target.url)))
            }
        }
    }

    /// Run the five steps as a conjunctive chain. The nothing-due
    /// placeholder is recognized by identity and is not a failure: the lock
    /// is released out of band since the chain stops before its terminal
    /// step. A genuine tool failure stops the chain and deliberately leaves
    /// the lock in place for operator visibility.
    fn run_sequence(&self, job: &JobSequence) -> JobOutcome {
        let key = &job.target.lock_key;
        let started = Instant::now();

        if let Some(pre) = &job.pre_command {
            if let Err(e) = self.tool.run_hook(pre) {
                warn!("pre-command failed, keeping lock {key} for operator attention");
                return JobOutcome::Failed(e.with_msg(format!("pre-command for {}", job.target.url)));
            }
        }

        for step in &job.steps {
            match step {
                Step::NothingDue => {
                    info!("nothing to do for {}", job.target.url);
                    return match self.locks.release(key) {
                        Ok(()) => JobOutcome::NothingDue,
                        Err(e) => JobOutcome::Failed(e),
                    };
                }
                Step::ReleaseLock => {
                    if let Err(e) = self.locks.release(key) {
                        return JobOutcome::Failed(e);
                    }
                }
                step => {
                    if let Err(e) = self.tool.run_step(step, job) {
                        warn!("backup work for {} failed, lock {key} kept until a later run reclaims it", job.target.url);
                        return JobOutcome::Failed(e);
                    }
                }
            }
        }

        if let Some(post) = &job.post_command {
            if let Err(e) = self.tool.run_hook(post) {
                return JobOutcome::Failed(e.with_msg(format!("post-command for {}", job.target.url)));
            }
        }

        info!("{} finished in {:.1?}", job.target.url, started.elapsed());
        JobOutcome::Completed
    }
}

fn summarize(outcomes: Vec<JobOutcome>, lock_skipped: usize, prepare_failed: usize) -> RunSummary {
    let mut summary = RunSummary {
        lock_skipped,
        failed: prepare_failed,
        ..Default::default()
    };
    for outcome in outcomes {
        match outcome {
            JobOutcome::Completed => summary.completed += 1,
            JobOutcome::NothingDue => summary.nothing_due += 1,
            JobOutcome::Failed(e) => {
                error!("{e}");
                summary.failed += 1;
            }
        }
    }
    summary
}
