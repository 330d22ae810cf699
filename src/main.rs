use chrono::Local;
use clap::Parser;
use dup_runner::backup::dispatch::Dispatcher;
use dup_runner::backup::policy::RunnerConfig;
use dup_runner::backup::result_error::error::Error;
use dup_runner::backup::result_error::WithMsg;
use std::fs::File;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use tracing::{error, info};
use validator::Validate;

/// Drive duplicity backups for every configured section
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Location of config file
    #[arg(short, long)]
    config: PathBuf,
    /// Run job sequences one at a time instead of using the worker pool
    #[arg(long)]
    serial: bool,
    /// Override the configured worker count
    #[arg(long)]
    workers: Option<usize>,
    /// Log tool commands without executing them
    #[arg(long)]
    dry_run: bool,
}

fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let res = File::open(&args.config)
        .map_err(Error::from)
        .and_then(|f| {
            serde_yml::from_reader::<_, RunnerConfig>(f)
                .map_err(Error::from)
                .with_msg(format!("Parse YAML config failed: {:?}", &args.config))
        })
        .and_then(|rc| {
            rc.validate()
                .map_err(Error::from)
                .map(|_| rc)
                .with_msg(format!("Config validation failed: {:?}", &args.config))
        })
        .map(|mut rc| {
            if let Some(workers) = args.workers {
                rc.workers = workers;
            }
            rc
        })
        .and_then(|rc| {
            Dispatcher::from_config(
                Arc::new(rc),
                Local::now().date_naive(),
                args.serial,
                args.dry_run,
            )
            .run()
        });

    match res {
        Ok(summary) => {
            info!(
                "run finished: {} backed up, {} nothing due, {} locked, {} failed",
                summary.completed, summary.nothing_due, summary.lock_skipped, summary.failed
            );
            if summary.failed > 0 {
                exit(1);
            }
        }
        Err(e) => {
            error!("{e}");
            exit(1);
        }
    }
}
