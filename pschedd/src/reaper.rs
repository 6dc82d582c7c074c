// SPDX-License-Identifier: MIT

//! Zombie prevention for children outside the launch protocol.
//!
//! The launch protocol waits on its own child synchronously; any other child
//! that terminates would linger as a zombie. This reaper drains those with
//! non-blocking waits. It runs unordered with respect to dispatcher ticks
//! and must never steal a wait from the launcher, so it only reaps while it
//! can take the shared guard the launcher holds across fork..waitpid.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

pub struct Reaper {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Reaper {
    pub fn spawn(guard: Arc<Mutex<()>>, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let thread = thread::Builder::new()
            .name("psched-reaper".into())
            .spawn(move || {
                while !stop_flag.load(Ordering::Acquire) {
                    thread::sleep(interval);
                    // A held guard means a launch is in flight; skip this
                    // round instead of racing it for the child.
                    if let Ok(_held) = guard.try_lock() {
                        reap_strays();
                    }
                }
            })
            .expect("failed to spawn reaper thread");
        Self {
            stop,
            thread: Some(thread),
        }
    }

    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("reaper thread panicked");
            }
        }
    }
}

fn reap_strays() {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => debug!("reaped stray child: {status:?}"),
            Err(Errno::ECHILD) => break,
            Err(e) => {
                warn!("stray-child wait failed: {e}");
                break;
            }
        }
    }
}
