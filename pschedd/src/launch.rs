// SPDX-License-Identifier: MIT

//! The two-phase launch protocol.
//!
//! A dispatched job's process is created suspended: the child blocks on one
//! end of a pipe before it ever execs, so the parent controls the exact
//! moment execution begins. The parent stamps the start time, writes the
//! release byte, and only then does the child replace its image with the
//! target executable. Start timestamps therefore reflect actual execution
//! start, not process-creation time.

use std::ffi::CString;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{execvp, fork, pipe, read, write, ForkResult};
use thiserror::Error;

use crate::job::{CompletedJob, Job, JobExit};
use crate::sched::dispatcher::JobRunner;

/// Exit status a child reports when exec itself fails. Distinct from any
/// ordinary failure of the target program's own making by convention.
pub const EXEC_FAILURE_STATUS: i32 = 127;

/// Launch failed before the job's process was running. The job comes back
/// with the error so the queue can keep it.
#[derive(Debug, Error)]
#[error("could not launch job: {source}")]
pub struct LaunchError {
    pub job: Job,
    #[source]
    pub source: Errno,
}

/// One-shot release handshake between parent and child, built on a pipe
/// created before fork. No reliance on signal delivery ordering: the byte
/// is either in the pipe or not yet written.
struct Rendezvous {
    rx: OwnedFd,
    tx: OwnedFd,
}

impl Rendezvous {
    fn new() -> nix::Result<Self> {
        let (rx, tx) = pipe()?;
        Ok(Self { rx, tx })
    }

    /// Child side: give up the write end, then block until the parent
    /// releases us. EOF (parent gone) also releases, so an orphaned child
    /// cannot hang forever in the pre-exec limbo.
    fn await_release(self) {
        drop(self.tx);
        let mut byte = [0u8; 1];
        loop {
            match read(&self.rx, &mut byte) {
                Ok(_) => return,
                Err(Errno::EINTR) => continue,
                Err(_) => return,
            }
        }
    }

    /// Parent side: give up the read end and write the release byte.
    fn release(self) -> nix::Result<()> {
        drop(self.rx);
        loop {
            match write(&self.tx, &[1u8]) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// Runs one job's full lifecycle to completion: fork, rendezvous, exec,
/// synchronous wait, timing. Holds the reap guard for the whole span so the
/// background reaper can never claim this child first.
pub struct ProcessLauncher {
    tslice: Duration,
    reap_guard: Arc<Mutex<()>>,
}

impl ProcessLauncher {
    pub fn new(tslice: Duration, reap_guard: Arc<Mutex<()>>) -> Self {
        Self { tslice, reap_guard }
    }
}

impl JobRunner for ProcessLauncher {
    fn run(&self, mut job: Job) -> Result<CompletedJob, LaunchError> {
        let _guard = self.reap_guard.lock().unwrap();

        // Prepared before fork; nothing in the child allocates.
        let prog = match CString::new(job.name.as_str()) {
            Ok(c) => c,
            Err(_) => {
                return Err(LaunchError {
                    job,
                    source: Errno::EINVAL,
                })
            }
        };
        let rendezvous = match Rendezvous::new() {
            Ok(r) => r,
            Err(source) => return Err(LaunchError { job, source }),
        };

        match unsafe { fork() } {
            Err(source) => Err(LaunchError { job, source }),
            Ok(ForkResult::Child) => {
                rendezvous.await_release();
                let argv = [prog.as_c_str()];
                let _ = execvp(prog.as_c_str(), &argv);
                // Exec failed; only this child dies, with a status the
                // parent can tell apart. Parent bookkeeping is untouched.
                let msg = b"pschedd: exec failed\n";
                unsafe { libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len()) };
                std::process::exit(EXEC_FAILURE_STATUS);
            }
            Ok(ForkResult::Parent { child }) => {
                let start = Instant::now();
                job.mark_running(child, start);
                if let Err(source) = rendezvous.release() {
                    // The child is stuck awaiting a release that will never
                    // come; take it down rather than leak it.
                    let _ = kill(child, Signal::SIGKILL);
                    let _ = waitpid(child, None);
                    return Err(LaunchError { job, source });
                }
                debug!("released {} (pid {child})", job.name);

                let exit = loop {
                    match waitpid(child, None) {
                        Ok(WaitStatus::Exited(_, code)) => break JobExit::Exited(code),
                        Ok(WaitStatus::Signaled(_, sig, _)) => break JobExit::Signaled(sig),
                        Ok(_) => continue,
                        Err(Errno::EINTR) => continue,
                        Err(e) => {
                            warn!("waitpid on pid {child} failed: {e}");
                            break JobExit::Unknown;
                        }
                    }
                };
                let finished = Instant::now();
                Ok(job.into_completed(finished, exit, self.tslice))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobState;

    fn launcher(tslice_ms: u64) -> ProcessLauncher {
        ProcessLauncher::new(
            Duration::from_millis(tslice_ms),
            Arc::new(Mutex::new(())),
        )
    }

    fn dispatched(name: &str) -> Job {
        let mut job = Job::new(name, 1);
        job.mark_dispatched(Instant::now());
        job
    }

    #[test]
    fn quick_job_is_charged_the_quantum() {
        let done = launcher(200).run(dispatched("true")).unwrap();
        assert_eq!(done.exit, JobExit::Exited(0));
        assert_eq!(done.charged, Duration::from_millis(200));
    }

    #[test]
    fn exec_failure_exits_with_distinct_status() {
        let done = launcher(10)
            .run(dispatched("definitely-not-an-executable-psched"))
            .unwrap();
        assert_eq!(done.exit, JobExit::Exited(EXEC_FAILURE_STATUS));
    }

    #[test]
    fn failing_job_reports_its_own_status() {
        let done = launcher(10).run(dispatched("false")).unwrap();
        assert_eq!(done.exit, JobExit::Exited(1));
    }

    #[test]
    fn unforkable_name_returns_the_job() {
        let mut job = Job::new("nul\0name", 1);
        job.mark_dispatched(Instant::now());
        let err = launcher(10).run(job).unwrap_err();
        assert_eq!(err.source, Errno::EINVAL);
        assert_eq!(err.job.state, JobState::Dispatched);
        assert_eq!(err.job.name, "nul\0name");
    }
}
