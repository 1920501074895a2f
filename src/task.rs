//! Runs build jobs, potentially in parallel.
//! Unaware of the build graph, caching, etc.; just executes one job's
//! rendered command list inside its staging directory.

use crate::eval::RenderError;
use crate::graph::{Cmd, JobId};
use crate::process::{self, Termination};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;

/// Why a job failed, pointing at the guilty command by position.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("render: {0}")]
    Render(#[from] RenderError),
    #[error("command {index} exited with status {code}")]
    Exit { index: usize, code: i32 },
    #[error("command {index} killed by signal {signal}")]
    Signal { index: usize, signal: i32 },
    #[error("command {index} interrupted")]
    Interrupted { index: usize },
    #[error("command {index}: {message}")]
    Io { index: usize, message: String },
    #[error("store: {message}")]
    Store { message: String },
}

impl JobError {
    pub fn store(message: impl Into<String>) -> JobError {
        JobError::Store {
            message: message.into(),
        }
    }
}

/// The result of executing one job's command list.
#[derive(Debug)]
pub struct TaskResult {
    pub status: Result<(), JobError>,
    /// Combined console output of the job's exec commands.
    pub output: Vec<u8>,
}

pub struct FinishedJob {
    pub id: JobId,
    pub result: TaskResult,
}

/// Execute rendered commands in list order; the first failure stops the
/// rest.  `output_dir` is the staging directory the job writes into.
pub fn run_cmds(cmds: &[Cmd], output_dir: &Path) -> TaskResult {
    let mut output = Vec::new();
    for (index, cmd) in cmds.iter().enumerate() {
        let status = match cmd {
            Cmd::Exec {
                argv,
                env,
                working_dir,
            } => run_exec(index, argv, env, working_dir, output_dir, &mut output),
            Cmd::Cat {
                template,
                output: path,
            } => run_cat(index, template, path, output_dir),
        };
        if let Err(err) = status {
            return TaskResult {
                status: Err(err),
                output,
            };
        }
    }
    TaskResult {
        status: Ok(()),
        output,
    }
}

fn run_exec(
    index: usize,
    argv: &[String],
    env: &[String],
    working_dir: &str,
    output_dir: &Path,
    output: &mut Vec<u8>,
) -> Result<(), JobError> {
    let cwd = if working_dir.is_empty() {
        output_dir.to_path_buf()
    } else {
        // join() lets an absolute working_dir stand on its own.
        output_dir.join(working_dir)
    };
    let (termination, mut out) = process::run_command(argv, env, &cwd).map_err(|err| {
        JobError::Io {
            index,
            message: err.to_string(),
        }
    })?;
    output.append(&mut out);
    match termination {
        Termination::Success => Ok(()),
        Termination::Exit(code) => Err(JobError::Exit { index, code }),
        Termination::Signal(signal) => Err(JobError::Signal { index, signal }),
        Termination::Interrupted => Err(JobError::Interrupted { index }),
    }
}

fn run_cat(index: usize, text: &str, path: &str, output_dir: &Path) -> Result<(), JobError> {
    let path = output_dir.join(path);
    let io_err = |err: std::io::Error| JobError::Io {
        index,
        message: err.to_string(),
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    std::fs::write(&path, text).map_err(io_err)
}

/// Executes jobs on worker threads, bounded by `parallelism`.
pub struct Runner {
    finished_send: mpsc::Sender<FinishedJob>,
    finished_recv: mpsc::Receiver<FinishedJob>,
    pub running: usize,
    parallelism: usize,
}

impl Runner {
    pub fn new(parallelism: usize) -> Self {
        let (tx, rx) = mpsc::channel();
        Runner {
            finished_send: tx,
            finished_recv: rx,
            running: 0,
            parallelism,
        }
    }

    pub fn can_start_more(&self) -> bool {
        self.running < self.parallelism
    }

    pub fn is_running(&self) -> bool {
        self.running > 0
    }

    /// Spawn a worker executing one job's rendered commands.
    pub fn start(&mut self, id: JobId, cmds: Vec<Cmd>, output_dir: PathBuf) {
        let tx = self.finished_send.clone();
        std::thread::spawn(move || {
            let result = run_cmds(&cmds, &output_dir);
            // The send will only fail if the receiver disappeared, e.g. due
            // to shutting down.
            let _ = tx.send(FinishedJob { id, result });
        });
        self.running += 1;
    }

    /// Wait for a job to complete, with a timeout.
    /// If the timeout elapses return None.
    pub fn wait(&mut self, dur: Duration) -> Option<FinishedJob> {
        let finished = match self.finished_recv.recv_timeout(dur) {
            Err(mpsc::RecvTimeoutError::Timeout) => return None,
            // The unwrap() checks the recv() call, to panic on mpsc errors.
            r => r.unwrap(),
        };
        self.running -= 1;
        Some(finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cat(template: &str, output: &str) -> Cmd {
        Cmd::Cat {
            template: template.to_string(),
            output: output.to_string(),
        }
    }

    #[cfg(unix)]
    fn sh(script: &str) -> Cmd {
        Cmd::Exec {
            argv: vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
            env: Vec::new(),
            working_dir: String::new(),
        }
    }

    #[test]
    fn cat_writes_nested_paths() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_cmds(&[cat("hello", "sub/dir/out.txt")], dir.path());
        assert_eq!(result.status, Ok(()));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("sub/dir/out.txt")).unwrap(),
            "hello"
        );
    }

    #[test]
    fn commands_run_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_cmds(
            &[cat("one", "f.txt"), cat("two", "f.txt")],
            dir.path(),
        );
        assert_eq!(result.status, Ok(()));
        // The later command's write wins.
        assert_eq!(
            std::fs::read_to_string(dir.path().join("f.txt")).unwrap(),
            "two"
        );
    }

    #[cfg(unix)]
    #[test]
    fn first_failure_stops_the_list() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_cmds(&[sh("exit 7"), cat("never", "skipped.txt")], dir.path());
        assert_eq!(
            result.status,
            Err(JobError::Exit { index: 0, code: 7 })
        );
        assert!(!dir.path().join("skipped.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn exec_defaults_to_the_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_cmds(&[sh("touch here.txt")], dir.path());
        assert_eq!(result.status, Ok(()));
        assert!(dir.path().join("here.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn missing_program_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = Cmd::Exec {
            argv: vec!["/definitely/not/a/program".to_string()],
            env: Vec::new(),
            working_dir: String::new(),
        };
        let result = run_cmds(&[cmd], dir.path());
        assert!(matches!(result.status, Err(JobError::Io { index: 0, .. })));
    }

    #[test]
    fn runner_executes_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = Runner::new(2);
        assert!(runner.can_start_more());
        runner.start(
            JobId::from(0),
            vec![cat("a", "a.txt")],
            dir.path().to_path_buf(),
        );
        runner.start(
            JobId::from(1),
            vec![cat("b", "b.txt")],
            dir.path().to_path_buf(),
        );
        assert!(!runner.can_start_more());

        let mut seen = Vec::new();
        while runner.is_running() {
            if let Some(finished) = runner.wait(Duration::from_secs(5)) {
                assert_eq!(finished.result.status, Ok(()));
                seen.push(finished.id);
            }
        }
        assert_eq!(seen.len(), 2);
        assert!(dir.path().join("a.txt").exists());
        assert!(dir.path().join("b.txt").exists());
    }
}
