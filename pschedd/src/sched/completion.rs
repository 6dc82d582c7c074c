// SPDX-License-Identifier: MIT

use std::io::{self, Write};

use crate::job::CompletedJob;

/// Append-only record of finished jobs, in completion order. Nothing else
/// reads or mutates completed jobs once they land here.
#[derive(Debug, Default)]
pub struct CompletionLog {
    completed: Vec<CompletedJob>,
}

impl CompletionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, job: CompletedJob) {
        self.completed.push(job);
    }

    pub fn report(&self) -> &[CompletedJob] {
        &self.completed
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }

    /// End-of-run report printed when the daemon shuts down.
    pub fn render<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out)?;
        writeln!(out, "---- Job Completion Report ----")?;
        for job in &self.completed {
            writeln!(out, "Job: {} (pid {}, {})", job.name, job.pid, job.exit)?;
            writeln!(out, "Completion Time: {} ms", job.charged.as_millis())?;
            writeln!(out, "Wait Time: {} ms", job.wait.as_millis())?;
            writeln!(out, "-------------------------------")?;
        }
        Ok(())
    }
}
