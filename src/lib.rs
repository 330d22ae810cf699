//! # dup_runner
//!
//! A cron-friendly driver for duplicity backups with per-section scheduling,
//! retention enforcement, and lock-guarded concurrent execution.
//!
//! ## Features
//!
//! - **Full/Incremental Scheduling**: per-section week/day intervals with a
//!   preferred weekday for full backups
//! - **Retention Management**: keeps a bounded number of full chains, wiping
//!   the target when only one generation is kept
//! - **Lock Guarding**: one PID lock file per target with stale-owner reclaim
//! - **Parallel Dispatch**: a worker pool drains a shared job queue, with a
//!   serial fallback
//! - **External Tool**: all storage mechanics are delegated to duplicity,
//!   invoked as a subprocess
//!
//! ## Quick Start
//!
//! ```no_run
//! use chrono::Local;
//! use dup_runner::backup::dispatch::Dispatcher;
//! use dup_runner::backup::policy::RunnerConfig;
//!
//! // Load configuration from YAML file
//! let config: RunnerConfig = serde_yml::from_reader(std::fs::File::open("config.yml")?)?;
//!
//! // Run one backup pass over every configured section
//! let dispatcher = Dispatcher::from_config(config.into(), Local::now().date_naive(), false, false);
//! let summary = dispatcher.run()?;
//! println!("{} targets backed up", summary.completed);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backup;
