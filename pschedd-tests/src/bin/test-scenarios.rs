// SPDX-License-Identifier: MIT
// End-to-end scenario: a real daemon, real workloads, real signals.
//
// Spawns pschedd, submits the workload binaries over the shared-memory
// channel, arms the scheduler with SIGINT, and checks the completion report.
// A watchdog bounds the whole run so a protocol stall fails the scenario
// instead of hanging it.

use std::env;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use psched_ipc::{SubmissionChannel, CHANNEL_NAME};

const TSLICE_MS: u64 = 50;
const WATCHDOG: Duration = Duration::from_secs(20);

fn target_dir() -> PathBuf {
    let exe = env::current_exe().expect("cannot locate test binary");
    exe.parent().expect("test binary has no parent").to_path_buf()
}

fn workload(name: &str) -> String {
    let path = target_dir().join(name);
    assert!(
        path.exists(),
        "workload {name} not built; run cargo build -p pschedd-tests -p pschedd first"
    );
    path.to_string_lossy().into_owned()
}

fn main() {
    let daemon_path = target_dir().join("pschedd");
    assert!(
        daemon_path.exists(),
        "pschedd not built; run cargo build -p pschedd first"
    );

    let mut daemon = Command::new(&daemon_path)
        .args(["2", &TSLICE_MS.to_string()])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .expect("failed to start pschedd");
    let daemon_pid = Pid::from_raw(daemon.id() as i32);

    let finished = Arc::new(AtomicBool::new(false));
    let watchdog_flag = finished.clone();
    thread::spawn(move || {
        thread::sleep(WATCHDOG);
        if !watchdog_flag.load(Ordering::Acquire) {
            eprintln!("scenario stalled; killing daemon");
            let _ = kill(daemon_pid, Signal::SIGKILL);
        }
    });

    // Attach once the daemon has created the channel.
    let channel = (0..20)
        .find_map(|_| {
            thread::sleep(Duration::from_millis(100));
            SubmissionChannel::open(CHANNEL_NAME).ok()
        })
        .expect("could not attach to the submission channel");

    // Lower priority value wins: job-fail should retire before job-quick.
    channel.submit(&workload("job-quick"), 5).unwrap();
    channel.submit(&workload("job-fail"), 1).unwrap();
    // A duplicate submission must be rejected, leaving a single entry.
    channel.submit(&workload("job-quick"), 9).unwrap();

    // Let a couple of unarmed ticks pass: nothing may dispatch yet.
    thread::sleep(Duration::from_millis(4 * TSLICE_MS));
    kill(daemon_pid, Signal::SIGINT).expect("could not arm the scheduler");
    thread::sleep(Duration::from_millis(8 * TSLICE_MS));

    // Closing stdin ends intake; the daemon prints its report and exits.
    drop(daemon.stdin.take());
    let output = daemon.wait_with_output().expect("daemon did not exit");
    finished.store(true, Ordering::Release);
    let report = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "daemon exited with {}", output.status);

    let fail_at = report.find("job-fail").expect("job-fail missing from report");
    let quick_at = report.find("job-quick").expect("job-quick missing from report");
    assert!(
        fail_at < quick_at,
        "priority order violated:\n{report}"
    );
    assert_eq!(
        report.matches("job-quick").count(),
        1,
        "duplicate submission was not rejected:\n{report}"
    );

    // Quantum floor: both workloads finish in under one slice.
    for line in report.lines().filter(|l| l.starts_with("Completion Time:")) {
        let ms: u64 = line
            .trim_start_matches("Completion Time:")
            .trim()
            .trim_end_matches(" ms")
            .parse()
            .expect("unparseable completion time");
        assert!(ms >= TSLICE_MS, "charged below the quantum floor: {line}");
    }

    println!("scenario OK");
}
