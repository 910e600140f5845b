use clap::{Parser, Subcommand};
use gong::backup::backup_config::{Config, GlobalConfig};
use gong::backup::engine::Engine;
use gong::backup::result_error::error::Error;
use gong::backup::result_error::result::Result;
use gong::backup::result_error::AddMsg;
use gong::backup::run::RunState;
use gong::backup::scheduler::Scheduler;
use serde::Serialize;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::exit;
use std::sync::{Arc, Mutex};
use tracing::{error, info};

/// Scheduled backups with verification and retention
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Location of config file
    #[arg(short, long)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run jobs on their schedules until interrupted
    Daemon,
    /// Run a job once and wait for it to finish
    Run { job: String },
    /// Run history of a job, newest first
    Runs { job: String },
    /// Archives of a job at its destination, newest first
    List { job: String },
    /// Restore an archive into a directory
    Restore {
        job: String,
        key: String,
        target: PathBuf,
        /// Also delete files the restored state does not contain
        #[arg(long)]
        full_tree: bool,
    },
    /// Apply the retention policy of a job
    Prune {
        job: String,
        /// Only report what would be deleted
        #[arg(long)]
        dry_run: bool,
    },
}

fn init_logging(global: &GlobalConfig) -> Result<()> {
    let level = tracing::Level::from(*global.log_level());
    let builder = tracing_subscriber::fmt().with_max_level(level);
    match global.log_file() {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(Error::from)
                .add_msg(format!("Cannot open log file {path:?}"))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.init(),
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn daemon(config: Config) -> Result<()> {
    let threads = *config.global().max_concurrent_jobs();
    let engine = Arc::new(Engine::new(config)?);
    let scheduler = Arc::new(Scheduler::new(engine, threads)?);
    for (job, at) in scheduler.next_fire_times() {
        info!("Job {:?} first fires at {}", job, at);
    }
    let ticker = {
        let scheduler = scheduler.clone();
        std::thread::spawn(move || scheduler.run())
    };

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(tokio::signal::ctrl_c())?;
    info!("Interrupted, waiting for active runs before exiting");
    scheduler.shutdown();
    ticker
        .join()
        .map_err(|_| Error::Io(std::io::Error::other("scheduler thread panicked")))?
}

fn execute(config: Config, command: Command) -> Result<i32> {
    match command {
        Command::Daemon => daemon(config).map(|_| 0),
        Command::Run { job } => {
            let run = Engine::new(config)?.run_job(&job)?;
            print_json(&run)?;
            Ok(if run.state == RunState::Completed { 0 } else { 1 })
        }
        Command::Runs { job } => print_json(&Engine::new(config)?.list_runs(&job)?).map(|_| 0),
        Command::List { job } => print_json(&Engine::new(config)?.list_archives(&job)?).map(|_| 0),
        Command::Restore {
            job,
            key,
            target,
            full_tree,
        } => Engine::new(config)?
            .restore(&job, &key, &target, full_tree)
            .map(|_| 0),
        Command::Prune { job, dry_run } => {
            print_json(&Engine::new(config)?.prune(&job, dry_run)?).map(|_| 0)
        }
    }
}

fn main() {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            tracing_subscriber::fmt::init();
            error!("{e}");
            exit(2);
        }
    };
    if let Err(e) = init_logging(config.global()) {
        tracing_subscriber::fmt::init();
        error!("{e}");
        exit(2);
    }

    match execute(config, args.command) {
        Ok(code) => exit(code),
        Err(e) => {
            error!("{e}");
            exit(1);
        }
    }
}
