//! Spawns one rendered `exec` command and reports how it ended.

use anyhow::bail;
use std::path::Path;
use std::process::Command;

/// How a spawned command finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Success,
    /// Exited on its own with a non-zero status.
    Exit(i32),
    /// Killed by a signal.
    Signal(i32),
    /// Killed by SIGINT (e.g. user ctrl-c), reported separately so an abort
    /// reads as one.
    Interrupted,
}

/// Run `argv` in `cwd` with `env` as `KEY=VALUE` entries layered over the
/// inherited environment, returning the termination and the combined
/// stdout/stderr.
/// Returns an Err() only when we failed outside of the process itself:
/// empty argv, a malformed env entry, or a spawn failure.
pub fn run_command(argv: &[String], env: &[String], cwd: &Path) -> anyhow::Result<(Termination, Vec<u8>)> {
    let (program, args) = match argv.split_first() {
        Some(split) => split,
        None => bail!("empty argv"),
    };
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(cwd);
    for entry in env {
        match entry.split_once('=') {
            Some((key, value)) => {
                cmd.env(key, value);
            }
            None => bail!("environment entry {:?} is not KEY=VALUE", entry),
        }
    }

    let out = cmd.output()?;
    let mut output = Vec::new();
    output.extend_from_slice(&out.stdout);
    output.extend_from_slice(&out.stderr);
    Ok((termination_of(out.status), output))
}

#[cfg(unix)]
fn termination_of(status: std::process::ExitStatus) -> Termination {
    use std::os::unix::process::ExitStatusExt;
    if status.success() {
        return Termination::Success;
    }
    match status.signal() {
        Some(libc::SIGINT) => Termination::Interrupted,
        Some(sig) => Termination::Signal(sig),
        None => Termination::Exit(status.code().unwrap_or(1)),
    }
}

#[cfg(not(unix))]
fn termination_of(status: std::process::ExitStatus) -> Termination {
    if status.success() {
        Termination::Success
    } else {
        Termination::Exit(status.code().unwrap_or(1))
    }
}
