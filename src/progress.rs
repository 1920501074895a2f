//! Build progress tracking and reporting, for the purpose of display to the
//! user.

use crate::graph::{Job, JobId};
use crate::task::{JobError, TaskResult};
use crate::work::StateCounts;
use std::io::Write;

/// Trait for build progress notifications.
pub trait Progress {
    /// Called as jobs progress through build states.
    fn update(&mut self, counts: &StateCounts);

    /// Called when a job's commands start executing.  Cache hits never get
    /// here.
    fn job_started(&mut self, id: JobId, job: &Job);

    /// Called when an executing job completes.
    fn job_finished(&mut self, id: JobId, job: &Job, result: &TaskResult);

    /// Log a line of output without corrupting the progress display.
    /// Used e.g. when a job fails: we want the final output to show that
    /// failed job's output even if we do more work after it fails.
    fn log(&mut self, msg: &str);
}

/// Progress implementation for "dumb" console, without any overprinting.
#[derive(Default)]
pub struct DumbConsoleProgress {
    /// Whether to print the commands of started jobs.
    verbose: bool,

    /// The id of the last job printed, used to avoid printing it twice
    /// when we have two updates from the same job in a row.
    last_started: Option<JobId>,
}

impl DumbConsoleProgress {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            last_started: None,
        }
    }
}

impl Progress for DumbConsoleProgress {
    fn update(&mut self, _counts: &StateCounts) {
        // ignore
    }

    fn job_started(&mut self, id: JobId, job: &Job) {
        self.log(&job.name);
        if self.verbose {
            for cmd in &job.cmds {
                self.log(&format!("  {:?}", cmd));
            }
        }
        self.last_started = Some(id);
    }

    fn job_finished(&mut self, id: JobId, job: &Job, result: &TaskResult) {
        match &result.status {
            Ok(()) => {
                if result.output.is_empty() || self.last_started == Some(id) {
                    // Output is empty, or we just printed the name; don't
                    // print it again.
                } else {
                    self.log(&job.name)
                }
            }
            Err(JobError::Interrupted { .. }) => self.log(&format!("interrupted: {}", job.name)),
            Err(err) => self.log(&format!("failed: {}: {}", job.name, err)),
        };
        if !result.output.is_empty() {
            std::io::stdout().write_all(&result.output).unwrap();
        }
    }

    fn log(&mut self, msg: &str) {
        println!("{}", msg);
    }
}
