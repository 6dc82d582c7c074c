// SPDX-License-Identifier: MIT

use thiserror::Error;

use crate::job::{Job, JobState};

/// Upper bound on pending jobs.
pub const QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmitError {
    /// A job of the same name is already pending. The earlier submission
    /// keeps its priority; the new one is discarded, not merged.
    #[error("duplicate pending job: {0}")]
    DuplicateJob(String),
    #[error("ready queue is full")]
    QueueFull,
}

/// The ready list. Insertion order is arrival order, which `dequeue_min`
/// relies on for its tie-break.
#[derive(Debug)]
pub struct JobQueue {
    jobs: Vec<Job>,
    capacity: usize,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::with_capacity(QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            jobs: Vec::new(),
            capacity,
        }
    }

    /// Admit a new pending job. Duplicate names and a full queue are
    /// rejected; the caller logs and carries on.
    pub fn enqueue(&mut self, name: &str, priority: i32) -> Result<(), AdmitError> {
        if self.jobs.iter().any(|j| j.name == name) {
            return Err(AdmitError::DuplicateJob(name.to_owned()));
        }
        if self.jobs.len() >= self.capacity {
            return Err(AdmitError::QueueFull);
        }
        self.jobs.push(Job::new(name, priority));
        Ok(())
    }

    /// Remove and return the job with the smallest priority value; among
    /// equal priorities the earliest arrival wins.
    pub fn dequeue_min(&mut self) -> Option<Job> {
        if self.jobs.is_empty() {
            return None;
        }
        let mut best = 0;
        for i in 1..self.jobs.len() {
            let (candidate, current) = (&self.jobs[i], &self.jobs[best]);
            if candidate.priority < current.priority
                || (candidate.priority == current.priority && candidate.arrived < current.arrived)
            {
                best = i;
            }
        }
        Some(self.jobs.remove(best))
    }

    /// Put a job back after a failed launch. Arrival time is preserved so
    /// the job does not lose its place among equal priorities; the wait
    /// computed at the failed dispatch is discarded.
    pub fn restore(&mut self, mut job: Job) {
        job.state = JobState::Pending;
        job.wait = None;
        job.pid = None;
        job.started = None;
        self.jobs.push(job);
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    #[cfg(test)]
    pub fn peek_names(&self) -> Vec<&str> {
        self.jobs.iter().map(|j| j.name.as_str()).collect()
    }

    #[cfg(test)]
    pub fn priority_of(&self, name: &str) -> Option<i32> {
        self.jobs.iter().find(|j| j.name == name).map(|j| j.priority)
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}
