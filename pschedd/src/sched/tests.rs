// SPDX-License-Identifier: MIT

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::unistd::Pid;

use crate::job::{CompletedJob, Job, JobExit};
use crate::launch::LaunchError;
use crate::sched::completion::CompletionLog;
use crate::sched::dispatcher::{Dispatcher, JobRunner};
use crate::sched::queue::{AdmitError, JobQueue};
use crate::trigger::StartGate;

/// Runner that records dispatch order and pretends every job ran for a
/// fixed duration.
struct FakeRunner {
    ran: Arc<Mutex<Vec<String>>>,
    run_time: Duration,
    tslice: Duration,
}

impl JobRunner for FakeRunner {
    fn run(&self, mut job: Job) -> Result<CompletedJob, LaunchError> {
        self.ran.lock().unwrap().push(job.name.clone());
        let start = Instant::now();
        job.mark_running(Pid::from_raw(1), start);
        Ok(job.into_completed(start + self.run_time, JobExit::Exited(0), self.tslice))
    }
}

/// Runner whose launches always fail.
struct FailingRunner;

impl JobRunner for FailingRunner {
    fn run(&self, job: Job) -> Result<CompletedJob, LaunchError> {
        Err(LaunchError {
            job,
            source: Errno::EAGAIN,
        })
    }
}

struct Harness {
    queue: Arc<Mutex<JobQueue>>,
    log: Arc<Mutex<CompletionLog>>,
    gate: Arc<StartGate>,
    ran: Arc<Mutex<Vec<String>>>,
}

impl Harness {
    fn new() -> Self {
        Self {
            queue: Arc::new(Mutex::new(JobQueue::new())),
            log: Arc::new(Mutex::new(CompletionLog::new())),
            gate: Arc::new(StartGate::new()),
            ran: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn dispatcher(&self, ncpu: usize) -> Dispatcher<FakeRunner> {
        let runner = FakeRunner {
            ran: self.ran.clone(),
            run_time: Duration::from_millis(1),
            tslice: Duration::from_millis(10),
        };
        Dispatcher::new(
            self.queue.clone(),
            self.log.clone(),
            self.gate.clone(),
            None,
            runner,
            ncpu,
        )
    }

    fn enqueue(&self, name: &str, priority: i32) -> Result<(), AdmitError> {
        self.queue.lock().unwrap().enqueue(name, priority)
    }

    fn ran(&self) -> Vec<String> {
        self.ran.lock().unwrap().clone()
    }
}

#[test]
fn dequeue_follows_priority_then_arrival() {
    let mut queue = JobQueue::new();
    queue.enqueue("a", 5).unwrap();
    queue.enqueue("b", 1).unwrap();
    queue.enqueue("c", 5).unwrap();

    assert_eq!(queue.dequeue_min().unwrap().name, "b");
    assert_eq!(queue.dequeue_min().unwrap().name, "a");
    assert_eq!(queue.dequeue_min().unwrap().name, "c");
    assert!(queue.dequeue_min().is_none());
}

#[test]
fn duplicate_submission_leaves_single_entry() {
    let mut queue = JobQueue::new();
    queue.enqueue("x", 3).unwrap();
    assert_eq!(
        queue.enqueue("x", 9),
        Err(AdmitError::DuplicateJob("x".into()))
    );
    assert_eq!(queue.len(), 1);
    // The original submission keeps its priority.
    assert_eq!(queue.priority_of("x"), Some(3));
}

#[test]
fn full_queue_rejects_new_admissions() {
    let mut queue = JobQueue::with_capacity(2);
    queue.enqueue("one", 1).unwrap();
    queue.enqueue("two", 1).unwrap();
    assert_eq!(queue.enqueue("three", 1), Err(AdmitError::QueueFull));
    assert_eq!(queue.len(), 2);
}

#[test]
fn restored_job_keeps_its_arrival_order() {
    let mut queue = JobQueue::new();
    queue.enqueue("first", 4).unwrap();
    thread::sleep(Duration::from_millis(2));
    queue.enqueue("second", 4).unwrap();

    let first = queue.dequeue_min().unwrap();
    assert_eq!(first.name, "first");
    queue.restore(first);

    // Same priority: the earlier arrival still wins, despite the restore
    // pushing it behind "second" in storage order.
    assert_eq!(queue.dequeue_min().unwrap().name, "first");
    assert_eq!(queue.dequeue_min().unwrap().name, "second");
}

#[test]
fn nothing_dispatches_before_the_gate_arms() {
    let h = Harness::new();
    h.enqueue("a", 5).unwrap();
    h.enqueue("b", 1).unwrap();
    h.enqueue("c", 5).unwrap();

    let mut dispatcher = h.dispatcher(2);
    for _ in 0..3 {
        dispatcher.tick();
    }
    assert!(h.ran().is_empty());
    assert_eq!(h.queue.lock().unwrap().len(), 3);

    // First armed tick: two slots, priority order, arrival tie-break.
    h.gate.arm();
    dispatcher.tick();
    assert_eq!(h.ran(), vec!["b".to_string(), "a".to_string()]);
    assert_eq!(h.queue.lock().unwrap().peek_names(), vec!["c"]);

    dispatcher.tick();
    assert_eq!(h.ran().last().unwrap(), "c");
    assert!(h.queue.lock().unwrap().is_empty());
}

#[test]
fn a_tick_dispatches_at_most_ncpu_jobs() {
    let h = Harness::new();
    for i in 0..5 {
        h.enqueue(&format!("job-{i}"), 1).unwrap();
    }
    h.gate.arm();

    let mut dispatcher = h.dispatcher(2);
    dispatcher.tick();
    assert_eq!(h.ran().len(), 2);
    dispatcher.tick();
    assert_eq!(h.ran().len(), 4);
    dispatcher.tick();
    assert_eq!(h.ran().len(), 5);
}

#[test]
fn completions_are_recorded_in_dispatch_order() {
    let h = Harness::new();
    h.enqueue("slowpoke", 9).unwrap();
    h.enqueue("urgent", 0).unwrap();
    h.gate.arm();

    let mut dispatcher = h.dispatcher(4);
    dispatcher.tick();

    let log = h.log.lock().unwrap();
    let names: Vec<&str> = log.report().iter().map(|j| j.name.as_str()).collect();
    assert_eq!(names, vec!["urgent", "slowpoke"]);
    for job in log.report() {
        assert_eq!(job.exit, JobExit::Exited(0));
        // run_time 1 ms < tslice 10 ms: floor applies
        assert_eq!(job.charged, Duration::from_millis(10));
    }
}

#[test]
fn wait_time_spans_arrival_to_dispatch() {
    let h = Harness::new();
    h.enqueue("patient", 1).unwrap();
    thread::sleep(Duration::from_millis(30));
    h.gate.arm();

    let mut dispatcher = h.dispatcher(1);
    dispatcher.tick();

    let log = h.log.lock().unwrap();
    let job = &log.report()[0];
    assert!(
        job.wait >= Duration::from_millis(30),
        "wait {:?} should cover the time spent pending",
        job.wait
    );
}

#[test]
fn failed_launch_returns_job_to_queue() {
    let h = Harness::new();
    h.enqueue("fragile", 2).unwrap();
    h.gate.arm();

    let mut dispatcher = Dispatcher::new(
        h.queue.clone(),
        h.log.clone(),
        h.gate.clone(),
        None,
        FailingRunner,
        1,
    );
    dispatcher.tick();

    let queue = h.queue.lock().unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.peek_names(), vec!["fragile"]);
    assert!(h.log.lock().unwrap().is_empty());
}
