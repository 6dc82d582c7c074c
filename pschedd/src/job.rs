// SPDX-License-Identifier: MIT

use std::fmt;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use nix::unistd::Pid;

/// Lifecycle of a job. The ordering matters: a job only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
pub enum JobState {
    Pending,
    Dispatched,
    Running,
    Completed,
}

/// How a job's process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobExit {
    Exited(i32),
    Signaled(Signal),
    Unknown,
}

impl fmt::Display for JobExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobExit::Exited(code) => write!(f, "exit status {code}"),
            JobExit::Signaled(sig) => write!(f, "killed by {sig}"),
            JobExit::Unknown => write!(f, "unknown exit"),
        }
    }
}

/// A submitted job. The queue owns it while Pending; the launcher owns its
/// runtime fields from dispatch until the process exits.
#[derive(Debug, Clone)]
pub struct Job {
    pub name: String,
    pub priority: i32,
    pub state: JobState,
    pub pid: Option<Pid>,
    pub arrived: Instant,
    pub started: Option<Instant>,
    pub wait: Option<Duration>,
}

impl Job {
    pub fn new(name: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            priority,
            state: JobState::Pending,
            pid: None,
            arrived: Instant::now(),
            started: None,
            wait: None,
        }
    }

    /// Pending -> Dispatched. The wait time is fixed here, once, as the
    /// elapsed time between arrival and dispatch.
    pub fn mark_dispatched(&mut self, now: Instant) {
        debug_assert_eq!(self.state, JobState::Pending);
        self.wait = Some(now.duration_since(self.arrived));
        self.state = JobState::Dispatched;
    }

    /// Dispatched -> Running, once the child exists and `start` marks the
    /// moment it was released.
    pub fn mark_running(&mut self, pid: Pid, start: Instant) {
        debug_assert_eq!(self.state, JobState::Dispatched);
        self.pid = Some(pid);
        self.started = Some(start);
        self.state = JobState::Running;
    }

    /// Running -> Completed. Consumes the job; the result is immutable and
    /// belongs to the completion log from here on.
    pub fn into_completed(
        mut self,
        finished: Instant,
        exit: JobExit,
        tslice: Duration,
    ) -> CompletedJob {
        self.state = JobState::Completed;
        let started = self.started.expect("completed job was never started");
        let run = finished.duration_since(started);
        CompletedJob {
            name: self.name,
            priority: self.priority,
            pid: self.pid.expect("completed job has no pid"),
            exit,
            charged: run.max(tslice),
            wait: self.wait.expect("completed job was never dispatched"),
        }
    }
}

/// Final record of a finished job. `charged` is clamped below by the
/// configured quantum: a job is always billed at least one time slice.
#[derive(Debug, Clone)]
pub struct CompletedJob {
    pub name: String,
    pub priority: i32,
    pub pid: Pid,
    pub exit: JobExit,
    pub charged: Duration,
    pub wait: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed_after(run_ms: u64, tslice_ms: u64) -> CompletedJob {
        let mut job = Job::new("bench", 1);
        let t0 = Instant::now();
        job.mark_dispatched(t0);
        job.mark_running(Pid::from_raw(42), t0);
        job.into_completed(
            t0 + Duration::from_millis(run_ms),
            JobExit::Exited(0),
            Duration::from_millis(tslice_ms),
        )
    }

    #[test]
    fn short_runs_are_charged_the_quantum_floor() {
        let done = completed_after(10, 50);
        assert_eq!(done.charged, Duration::from_millis(50));
    }

    #[test]
    fn long_runs_are_charged_their_actual_duration() {
        let done = completed_after(80, 50);
        assert_eq!(done.charged, Duration::from_millis(80));
    }

    #[test]
    fn wait_is_fixed_at_dispatch_time() {
        let mut job = Job::new("waiter", 1);
        let dispatch = job.arrived + Duration::from_millis(30);
        job.mark_dispatched(dispatch);
        job.mark_running(Pid::from_raw(7), dispatch);
        // However long the job then runs, the wait stays what it was.
        let done = job.into_completed(
            dispatch + Duration::from_millis(500),
            JobExit::Exited(0),
            Duration::from_millis(20),
        );
        assert_eq!(done.wait, Duration::from_millis(30));
    }
}
