// SPDX-License-Identifier: MIT
// pschedd: priority job scheduler daemon
//
// - Accepts job submissions over stdin and the shared-memory channel.
// - Dispatches up to ncpu jobs per tick, each run to completion through the
//   two-phase launch protocol (suspend until released, then exec).

use std::io::{self, BufRead, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use psched_ipc::{SubmissionChannel, CHANNEL_NAME};

pub mod job;
pub mod launch;
pub mod reaper;
pub mod sched;
pub mod trigger;

use crate::launch::ProcessLauncher;
use crate::reaper::Reaper;
use crate::sched::completion::CompletionLog;
use crate::sched::dispatcher::Dispatcher;
use crate::sched::queue::JobQueue;
use crate::trigger::StartGate;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Maximum number of jobs dispatched per tick
    #[arg(value_parser = clap::value_parser!(u32).range(1..))]
    ncpu: u32,

    /// Tick period in milliseconds; also the minimum charged quantum
    #[arg(value_parser = clap::value_parser!(u64).range(1..))]
    tslice: u64,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let tslice = Duration::from_millis(args.tslice);

    info!(
        "Starting pschedd with {} cpu slot(s) and a time slice of {} ms",
        args.ncpu, args.tslice
    );

    let channel = SubmissionChannel::create(CHANNEL_NAME)
        .context("could not create the submission channel")?;

    let gate = Arc::new(StartGate::new());
    trigger::install_sigint_trigger(gate.clone())
        .context("could not install the start trigger")?;

    let queue = Arc::new(Mutex::new(JobQueue::new()));
    let log = Arc::new(Mutex::new(CompletionLog::new()));
    let reap_guard = Arc::new(Mutex::new(()));

    let reaper = Reaper::spawn(reap_guard.clone(), tslice);
    let launcher = ProcessLauncher::new(tslice, reap_guard);
    let dispatcher = Dispatcher::new(
        queue.clone(),
        log.clone(),
        gate,
        Some(channel),
        launcher,
        args.ncpu as usize,
    );
    let dispatcher = sched::dispatcher::spawn(dispatcher, tslice);

    run_intake(&queue);

    info!("intake closed, shutting down");
    dispatcher.shutdown();
    reaper.shutdown();

    let pending = queue.lock().unwrap().len();
    if pending > 0 {
        warn!("{pending} pending job(s) dropped at shutdown");
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    log.lock().unwrap().render(&mut out)?;
    out.flush()?;

    SubmissionChannel::unlink(CHANNEL_NAME)
        .context("could not remove the submission channel")?;
    Ok(())
}

/// Line-oriented intake: an executable name on one line, its integer
/// priority on the next. A literal `exit` (or end of input) ends intake.
fn run_intake(queue: &Arc<Mutex<JobQueue>>) {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    while let Some(line) = lines.next() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                warn!("stdin read failed: {e}");
                break;
            }
        };
        let name = line.trim();
        if name.is_empty() {
            continue;
        }
        if name == "exit" {
            break;
        }
        let Some(priority_line) = lines.next() else {
            warn!("no priority supplied for {name}, intake ends");
            break;
        };
        let priority = match priority_line {
            Ok(l) => match l.trim().parse::<i32>() {
                Ok(p) => p,
                Err(_) => {
                    warn!("invalid priority {:?} for {name}, submission skipped", l.trim());
                    continue;
                }
            },
            Err(e) => {
                warn!("stdin read failed: {e}");
                break;
            }
        };
        match queue.lock().unwrap().enqueue(name, priority) {
            Ok(()) => info!("queued {name} with priority {priority}"),
            Err(e) => warn!("submission of {name} rejected: {e}"),
        }
    }
}
