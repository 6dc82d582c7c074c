// SPDX-License-Identifier: MIT

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use psched_ipc::SubmissionChannel;

use crate::job::{CompletedJob, Job};
use crate::launch::LaunchError;
use crate::sched::completion::CompletionLog;
use crate::sched::queue::JobQueue;
use crate::trigger::StartGate;

/// Seam between the tick loop and the OS. The production runner executes
/// the full launch protocol; tests substitute their own.
pub trait JobRunner {
    /// Run one job's full lifecycle to completion, blocking until its
    /// process has exited. A failure to launch hands the job back.
    fn run(&self, job: Job) -> Result<CompletedJob, LaunchError>;
}

/// The timer-driven control loop. Each tick drains the submission channel
/// into the ready queue, then, once the gate is armed, pulls up to `ncpu`
/// jobs and retires each one fully before touching the next. `ncpu` bounds
/// how many jobs a tick may process, not how many run concurrently.
pub struct Dispatcher<R> {
    queue: Arc<Mutex<JobQueue>>,
    log: Arc<Mutex<CompletionLog>>,
    gate: Arc<StartGate>,
    channel: Option<SubmissionChannel>,
    runner: R,
    ncpu: usize,
    arm_logged: bool,
}

impl<R: JobRunner> Dispatcher<R> {
    pub fn new(
        queue: Arc<Mutex<JobQueue>>,
        log: Arc<Mutex<CompletionLog>>,
        gate: Arc<StartGate>,
        channel: Option<SubmissionChannel>,
        runner: R,
        ncpu: usize,
    ) -> Self {
        Self {
            queue,
            log,
            gate,
            channel,
            runner,
            ncpu,
            arm_logged: false,
        }
    }

    /// One tick. Runs inline on the loop thread, including the blocking
    /// waits inside the launch protocol, so ticks can never overlap.
    pub fn tick(&mut self) {
        self.intake();

        if !self.gate.is_armed() {
            return;
        }
        if !self.arm_logged {
            info!("start trigger received; dispatching begins");
            self.arm_logged = true;
        }

        for _ in 0..self.ncpu {
            let job = self.queue.lock().unwrap().dequeue_min();
            let Some(mut job) = job else { break };
            job.mark_dispatched(Instant::now());
            debug!(
                "dispatching {} (priority {}, waited {} ms)",
                job.name,
                job.priority,
                job.wait.unwrap_or_default().as_millis()
            );
            match self.runner.run(job) {
                Ok(done) => {
                    info!(
                        "{} (pid {}) completed: {} in {} ms after waiting {} ms",
                        done.name,
                        done.pid,
                        done.exit,
                        done.charged.as_millis(),
                        done.wait.as_millis()
                    );
                    self.log.lock().unwrap().record(done);
                }
                Err(err) => {
                    warn!("launch of {} failed, slot skipped: {}", err.job.name, err.source);
                    self.queue.lock().unwrap().restore(err.job);
                }
            }
        }
    }

    /// Move channel submissions into the ready queue. Happens armed or not,
    /// so jobs submitted before the start trigger are already ordered when
    /// the first armed tick fires.
    fn intake(&mut self) {
        let Some(channel) = &self.channel else { return };
        for sub in channel.drain() {
            match self.queue.lock().unwrap().enqueue(&sub.name, sub.priority) {
                Ok(()) => info!("queued {} with priority {}", sub.name, sub.priority),
                Err(e) => warn!("submission of {} rejected: {e}", sub.name),
            }
        }
    }
}

/// Owns the loop thread. Dropping the handle does not stop the loop; call
/// `shutdown` to stop after the tick in progress and join.
pub struct DispatcherHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DispatcherHandle {
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("dispatch thread panicked");
            }
        }
    }
}

/// Start the periodic tick loop, period = one time slice. Deadlines are
/// absolute; a tick that overruns its period makes the loop skip the missed
/// deadlines rather than run catch-up ticks back to back.
pub fn spawn<R: JobRunner + Send + 'static>(
    mut dispatcher: Dispatcher<R>,
    period: Duration,
) -> DispatcherHandle {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();
    let thread = thread::Builder::new()
        .name("psched-dispatch".into())
        .spawn(move || {
            let mut next = Instant::now() + period;
            while !stop_flag.load(Ordering::Acquire) {
                let now = Instant::now();
                if now < next {
                    // Short naps keep shutdown responsive.
                    thread::sleep((next - now).min(Duration::from_millis(20)));
                    continue;
                }
                next += period;
                while next <= Instant::now() {
                    next += period;
                }
                dispatcher.tick();
            }
            debug!("dispatch loop stopped");
        })
        .expect("failed to spawn dispatch thread");
    DispatcherHandle {
        stop,
        thread: Some(thread),
    }
}
