// SPDX-License-Identifier: MIT
// psched-shell: interactive front end for the psched scheduler
//
// - Spawns and supervises the pschedd daemon.
// - `submit <program> [priority]` places requests into the shared-memory
//   channel; `start` fires the daemon's one-shot start trigger.
// - Everything else runs locally, foreground or background.

use std::env;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::Parser;
use log::{info, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use psched_ipc::{SubmissionChannel, CHANNEL_NAME};

const HISTORY_MAX: usize = 100;
const DEFAULT_PRIORITY: i32 = 1;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Maximum number of jobs the scheduler dispatches per tick
    #[arg(value_parser = clap::value_parser!(u32).range(1..))]
    ncpu: u32,

    /// Scheduler tick period in milliseconds
    #[arg(value_parser = clap::value_parser!(u64).range(1..))]
    tslice: u64,
}

struct HistoryEntry {
    line: String,
    pid: Option<u32>,
    duration: Option<Duration>,
}

struct BackgroundJob {
    child: Child,
    line: String,
}

/// Supervises the scheduler daemon. Its stdin pipe is the shutdown path:
/// closing it ends the daemon's intake and lets it print its report.
struct DaemonGuard {
    child: Child,
}

impl DaemonGuard {
    fn spawn(ncpu: u32, tslice: u64) -> anyhow::Result<Self> {
        let child = Command::new(daemon_path())
            .arg(ncpu.to_string())
            .arg(tslice.to_string())
            .stdin(Stdio::piped())
            .spawn()
            .context("failed to start pschedd")?;
        info!("started pschedd (pid {})", child.id());
        Ok(Self { child })
    }

    fn pid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }

    /// Fire the one-shot start trigger.
    fn start(&self) {
        match kill(self.pid(), Signal::SIGINT) {
            Ok(()) => println!("Scheduler started."),
            Err(e) => warn!("could not signal the scheduler: {e}"),
        }
    }

    /// Close stdin so the daemon finishes and reports, then escalate if it
    /// does not exit.
    fn shutdown(mut self) {
        drop(self.child.stdin.take());
        for _ in 0..50 {
            if let Ok(Some(_)) = self.child.try_wait() {
                return;
            }
            thread::sleep(Duration::from_millis(100));
        }
        let _ = kill(self.pid(), Signal::SIGTERM);
        for _ in 0..10 {
            if let Ok(Some(_)) = self.child.try_wait() {
                return;
            }
            thread::sleep(Duration::from_millis(100));
        }
        let _ = kill(self.pid(), Signal::SIGKILL);
        let _ = self.child.wait();
    }
}

/// Prefer the pschedd built next to this binary; fall back to PATH.
fn daemon_path() -> PathBuf {
    if let Ok(exe) = env::current_exe() {
        if let Some(dir) = exe.parent() {
            let sibling = dir.join("pschedd");
            if sibling.exists() {
                return sibling;
            }
        }
    }
    PathBuf::from("pschedd")
}

fn attach_channel() -> anyhow::Result<SubmissionChannel> {
    // The daemon creates the channel shortly after starting.
    for _ in 0..20 {
        match SubmissionChannel::open(CHANNEL_NAME) {
            Ok(chan) => return Ok(chan),
            Err(_) => thread::sleep(Duration::from_millis(100)),
        }
    }
    bail!("could not attach to the submission channel; is pschedd running?");
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();
    println!(
        "Starting psched shell with {} cpu slot(s) and a time slice of {} ms.",
        args.ncpu, args.tslice
    );

    let daemon = DaemonGuard::spawn(args.ncpu, args.tslice)?;
    let channel = match attach_channel() {
        Ok(chan) => chan,
        Err(e) => {
            daemon.shutdown();
            return Err(e);
        }
    };

    let mut history: Vec<HistoryEntry> = Vec::new();
    let mut background: Vec<BackgroundJob> = Vec::new();

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        reap_background(&mut background);
        print!("psched> ");
        let _ = io::stdout().flush();

        let Some(line) = lines.next() else { break };
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                warn!("stdin read failed: {e}");
                break;
            }
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "exit" {
            break;
        }
        if input == "history" {
            print_history(&history);
            continue;
        }
        if input == "start" {
            daemon.start();
            continue;
        }
        if input == "cd" {
            eprintln!("usage: cd <dir>");
            continue;
        }
        if let Some(dir) = input.strip_prefix("cd ") {
            if let Err(e) = env::set_current_dir(dir.trim()) {
                eprintln!("cd: {e}");
            }
            continue;
        }
        if let Some(rest) = input.strip_prefix("submit ") {
            submit(&channel, rest);
            continue;
        }

        run_local(input, &mut history, &mut background);
    }

    for job in &mut background {
        if let Err(e) = job.child.wait() {
            warn!("background wait failed: {e}");
        }
    }
    daemon.shutdown();
    Ok(())
}

/// `submit <program> [priority]`; priority defaults to 1.
fn submit(channel: &SubmissionChannel, rest: &str) {
    let mut parts = rest.split_whitespace();
    let Some(program) = parts.next() else {
        eprintln!("usage: submit <program> [priority]");
        return;
    };
    let priority = match parts.next() {
        None => DEFAULT_PRIORITY,
        Some(word) => match word.parse::<i32>() {
            Ok(p) => p,
            Err(_) => {
                eprintln!("submit: invalid priority {word:?}");
                return;
            }
        },
    };
    match channel.submit(program, priority) {
        Ok(()) => println!("Submitted {program} with priority {priority}"),
        Err(e) => eprintln!("submit: {e}"),
    }
}

/// Run a non-builtin line locally. A trailing `&` detaches it.
fn run_local(input: &str, history: &mut Vec<HistoryEntry>, background: &mut Vec<BackgroundJob>) {
    let (line, detach) = match input.strip_suffix('&') {
        Some(rest) => (rest.trim(), true),
        None => (input, false),
    };
    let mut parts = line.split_whitespace();
    let Some(program) = parts.next() else { return };

    let spawned = Command::new(program).args(parts).spawn();
    let mut child = match spawned {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{program}: {e}");
            return;
        }
    };

    if detach {
        push_history(history, line, Some(child.id()), None);
        background.push(BackgroundJob {
            child,
            line: line.to_owned(),
        });
        return;
    }

    let begun = Instant::now();
    let pid = child.id();
    match child.wait() {
        Ok(status) => {
            if !status.success() {
                eprintln!("{program}: {status}");
            }
        }
        Err(e) => eprintln!("{program}: {e}"),
    }
    push_history(history, line, Some(pid), Some(begun.elapsed()));
}

fn push_history(history: &mut Vec<HistoryEntry>, line: &str, pid: Option<u32>, duration: Option<Duration>) {
    if history.len() == HISTORY_MAX {
        history.remove(0);
    }
    history.push(HistoryEntry {
        line: line.to_owned(),
        pid,
        duration,
    });
}

fn print_history(history: &[HistoryEntry]) {
    for (i, entry) in history.iter().enumerate() {
        let pid = entry
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".into());
        match entry.duration {
            Some(d) => println!("{i} {} (pid: {pid}, duration: {:.2}s)", entry.line, d.as_secs_f64()),
            None => println!("{i} {} (pid: {pid}, background)", entry.line),
        }
    }
}

/// Report background children that finished since the last prompt.
fn reap_background(background: &mut Vec<BackgroundJob>) {
    background.retain_mut(|job| match job.child.try_wait() {
        Ok(Some(status)) => {
            println!("[background] pid {} finished: {} ({status})", job.child.id(), job.line);
            false
        }
        Ok(None) => true,
        Err(e) => {
            warn!("background wait failed: {e}");
            false
        }
    });
}
