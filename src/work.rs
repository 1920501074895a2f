//! The execution engine: walks a validated graph in dependency order,
//! memoizing each job by id against the output store.
//!
//! Scheduling is single-threaded; only command execution fans out to the
//! `task::Runner` worker pool.  That keeps every state table plain data and
//! makes the claim bookkeeping race-free by construction.

use crate::densemap::{DenseMap, Index};
use crate::eval;
use crate::graph::{Cmd, Graph, JobId};
use crate::id::Id;
use crate::progress::Progress;
use crate::smallmap::SmallMap;
use crate::store::Store;
use crate::task::{FinishedJob, JobError, Runner};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Scheduling state of one job during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Waiting on at least one dependency.
    Pending,
    /// All deps done; cache-checked, possibly parked behind an identical
    /// twin that is already running.
    Ready,
    /// Fit to run, waiting for a worker slot.
    Queued,
    Running,
    Done,
    Failed,
    /// A transitive prerequisite failed.
    Blocked,
    /// The run stopped before this job could start.
    Skipped,
}

/// Counts of jobs in each state.  Stored redundantly for cheap access.
#[derive(Clone, Debug, Default)]
pub struct StateCounts([usize; 8]);
impl StateCounts {
    fn idx(state: JobState) -> usize {
        match state {
            JobState::Pending => 0,
            JobState::Ready => 1,
            JobState::Queued => 2,
            JobState::Running => 3,
            JobState::Done => 4,
            JobState::Failed => 5,
            JobState::Blocked => 6,
            JobState::Skipped => 7,
        }
    }
    fn add(&mut self, state: JobState, delta: isize) {
        self.0[StateCounts::idx(state)] =
            (self.0[StateCounts::idx(state)] as isize + delta) as usize;
    }
    pub fn get(&self, state: JobState) -> usize {
        self.0[StateCounts::idx(state)]
    }
    pub fn total(&self) -> usize {
        self.0.iter().sum()
    }
}

/// Final status of one job, in [`Graph::jobs`] order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    /// Output materialized; `cached` when no command ran for it this time.
    Done { path: PathBuf, cached: bool },
    Failed { error: JobError },
    /// Never ran: the job with id `on` failed somewhere upstream.
    Blocked { on: Id },
    Skipped,
}

/// Everything a caller learns from one run.
#[derive(Debug)]
pub struct BuildReport {
    /// One status per job, parallel to the graph's job list.
    pub statuses: Vec<JobStatus>,
    /// How many jobs actually executed commands (cache misses).
    pub ran: usize,
}

impl BuildReport {
    pub fn success(&self) -> bool {
        self.statuses
            .iter()
            .all(|status| matches!(status, JobStatus::Done { .. }))
    }

    pub fn first_failure(&self) -> Option<&JobError> {
        self.statuses.iter().find_map(|status| match status {
            JobStatus::Failed { error } => Some(error),
            _ => None,
        })
    }
}

/// Engine tuning knobs.
#[derive(Clone, Copy, Debug)]
pub struct Options {
    /// Worker threads; 0 means use all available parallelism.
    pub parallelism: usize,
    /// Stop scheduling new jobs after this many failures; 0 means never
    /// stop early.
    pub keep_going: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            parallelism: 0,
            keep_going: 1,
        }
    }
}

/// Per-id claim enforcing at-most-once execution: the first ready job with
/// a given id runs; identical twins park in `waiters` and share the result.
struct Claim {
    owner: JobId,
    waiters: Vec<JobId>,
}

/// One build run over a validated graph.
pub struct Work<'a> {
    graph: &'a Graph,
    store: &'a dyn Store,
    progress: &'a mut dyn Progress,
    options: Options,
    /// Root of the source tree, substituted for `{{SOURCE_DIR}}`.
    source_dir: PathBuf,

    states: DenseMap<JobId, JobState>,
    counts: StateCounts,
    /// Count of unfinished deps per job; a job becomes ready at zero.
    pending_deps: DenseMap<JobId, usize>,
    /// Jobs to re-check when this job reaches a terminal state.  Consumed
    /// by whichever terminal transition fires first.
    dependents: DenseMap<JobId, Vec<JobId>>,
    /// Materialized output path per finished job.
    outputs: DenseMap<JobId, Option<PathBuf>>,
    cached: DenseMap<JobId, bool>,
    /// First job holding each id; dep edges and claims resolve through it.
    by_id: FxHashMap<Id, JobId>,
    claims: FxHashMap<Id, Claim>,
    /// Root failed job per blocked job.
    blocked_on: FxHashMap<JobId, JobId>,
    failures: FxHashMap<JobId, JobError>,
    /// Staging dirs of running jobs; dropping one discards its contents.
    staging: FxHashMap<JobId, crate::store::Staging>,
    /// Jobs whose dep count hit zero, awaiting a readiness check.
    to_check: VecDeque<JobId>,
    /// Jobs queued for a worker slot.
    queue: VecDeque<JobId>,
    failure_count: usize,
    ran: usize,
}

impl<'a> Work<'a> {
    pub fn new(
        graph: &'a Graph,
        store: &'a dyn Store,
        progress: &'a mut dyn Progress,
        options: Options,
        source_dir: impl Into<PathBuf>,
    ) -> Self {
        let n = graph.jobs.len();
        let mut counts = StateCounts::default();
        counts.add(JobState::Pending, n as isize);
        Work {
            graph,
            store,
            progress,
            options,
            source_dir: source_dir.into(),
            states: DenseMap::new_sized(JobId::from(n), JobState::Pending),
            counts,
            pending_deps: DenseMap::new_sized(JobId::from(n), 0),
            dependents: DenseMap::new_sized(JobId::from(n), Vec::new()),
            outputs: DenseMap::new_sized(JobId::from(n), None),
            cached: DenseMap::new_sized(JobId::from(n), false),
            by_id: graph.jobs_by_id(),
            claims: FxHashMap::default(),
            blocked_on: FxHashMap::default(),
            failures: FxHashMap::default(),
            staging: FxHashMap::default(),
            to_check: VecDeque::new(),
            queue: VecDeque::new(),
            failure_count: 0,
            ran: 0,
        }
    }

    /// Validate the graph, then run it to completion.  Err means the run
    /// itself could not proceed; per-job failures land in the report.
    pub fn run(&mut self) -> anyhow::Result<BuildReport> {
        self.graph.validate()?;
        let parallelism = match self.options.parallelism {
            0 => usize::from(std::thread::available_parallelism()?),
            n => n,
        };
        let mut runner = Runner::new(parallelism);
        match self.source_dir.canonicalize() {
            Ok(dir) => self.source_dir = dir,
            Err(err) => log::debug!(
                "source dir {:?} left as configured: {}",
                self.source_dir,
                err
            ),
        }

        self.prepare();
        self.advance_ready();
        loop {
            while !self.aborting() && runner.can_start_more() {
                match self.queue.pop_front() {
                    Some(id) => {
                        self.dispatch(&mut runner, id);
                        // A dispatch that fails before starting changes
                        // state immediately.
                        self.advance_ready();
                    }
                    None => break,
                }
            }
            if !runner.is_running() {
                break;
            }
            match runner.wait(Duration::from_millis(100)) {
                Some(finished) => {
                    self.finish_task(finished);
                    self.advance_ready();
                }
                None => self.progress.update(&self.counts),
            }
        }

        // Whatever is not terminal now was never started.
        for id in self.states.all_ids() {
            match self.states[id] {
                JobState::Pending | JobState::Ready | JobState::Queued => {
                    self.set_state(id, JobState::Skipped)
                }
                _ => {}
            }
        }

        let report = self.report();
        log::debug!(
            "build finished: {} jobs, {} executed, success={}",
            self.graph.jobs.len(),
            report.ran,
            report.success()
        );
        Ok(report)
    }

    fn set_state(&mut self, id: JobId, state: JobState) {
        let old = self.states[id];
        self.counts.add(old, -1);
        self.counts.add(state, 1);
        self.states[id] = state;
        self.progress.update(&self.counts);
    }

    fn aborting(&self) -> bool {
        self.options.keep_going != 0 && self.failure_count >= self.options.keep_going
    }

    /// Count unfinished deps per job and wire up reverse edges.
    fn prepare(&mut self) {
        let graph = self.graph;
        for (idx, job) in graph.jobs.iter().enumerate() {
            let id = JobId::from(idx);
            // Unique dep jobs; a dep listed twice still completes once.
            let mut deps: Vec<JobId> = job.deps.iter().map(|dep| self.by_id[dep]).collect();
            deps.sort_unstable_by_key(|dep| dep.index());
            deps.dedup();
            self.pending_deps[id] = deps.len();
            for dep in deps {
                self.dependents[dep].push(id);
            }
        }
        for id in self.states.all_ids() {
            if self.pending_deps[id] == 0 {
                self.to_check.push_back(id);
            }
        }
    }

    /// Promote jobs whose dep counts hit zero.  A cascade may have blocked
    /// one in the meantime, so only still-pending jobs move.
    fn advance_ready(&mut self) {
        while let Some(id) = self.to_check.pop_front() {
            if self.states[id] == JobState::Pending {
                self.make_ready(id);
            }
        }
    }

    /// All deps are done: serve from cache if possible, otherwise claim the
    /// id or park behind the job that already did.
    fn make_ready(&mut self, id: JobId) {
        self.set_state(id, JobState::Ready);
        let digest = self.graph.job(id).id;
        if let Some(path) = self.store.lookup(&digest) {
            log::debug!("cache hit for {} ({})", digest, self.graph.job(id).name);
            self.finish_done(id, path, true);
            return;
        }
        match self.claims.get_mut(&digest) {
            Some(claim) => {
                claim.waiters.push(id);
            }
            None => {
                self.claims.insert(
                    digest,
                    Claim {
                        owner: id,
                        waiters: Vec::new(),
                    },
                );
                self.set_state(id, JobState::Queued);
                self.queue.push_back(id);
            }
        }
    }

    /// Stage, render, and hand one queued job to the runner.
    fn dispatch(&mut self, runner: &mut Runner, id: JobId) {
        let digest = self.graph.job(id).id;
        let staging = match self.store.begin(&digest) {
            Ok(staging) => staging,
            Err(err) => {
                self.finish_failed(id, JobError::store(err.to_string()));
                return;
            }
        };
        let rendered = match self.render_job(id, staging.path()) {
            Ok(cmds) => cmds,
            Err(err) => {
                self.finish_failed(id, err);
                return;
            }
        };
        let output_dir = staging.path().to_path_buf();
        self.staging.insert(id, staging);
        self.ran += 1;
        self.set_state(id, JobState::Running);
        self.progress.job_started(id, self.graph.job(id));
        runner.start(id, rendered, output_dir);
    }

    /// Render every command against the staging dir, the source root, and
    /// the dep output paths.
    fn render_job(&self, id: JobId, output_dir: &Path) -> Result<Vec<Cmd>, JobError> {
        let job = self.graph.job(id);
        let output_dir = path_str(output_dir)?;
        let source_dir = path_str(&self.source_dir)?;
        let mut deps = SmallMap::new();
        for dep in &job.deps {
            let dep_job = self.by_id[dep];
            let path = match &self.outputs[dep_job] {
                Some(path) => path,
                None => {
                    return Err(JobError::store(format!(
                        "dependency {} has no materialized output",
                        dep
                    )))
                }
            };
            deps.insert(*dep, path_str(path)?.to_string());
        }
        let env = eval::Env {
            output_dir,
            source_dir,
            deps: &deps,
        };
        job.cmds
            .iter()
            .map(|cmd| cmd.render(&env).map_err(JobError::from))
            .collect()
    }

    /// Handle a worker's result: publish on success, fail otherwise.
    fn finish_task(&mut self, finished: FinishedJob) {
        let FinishedJob { id, result } = finished;
        self.progress.job_finished(id, self.graph.job(id), &result);
        let staging = self.staging.remove(&id);
        match result.status {
            Ok(()) => match staging {
                Some(staging) => match self.store.commit(staging) {
                    Ok(path) => self.finish_done(id, path, false),
                    Err(err) => self.finish_failed(id, JobError::store(err.to_string())),
                },
                None => self.finish_failed(id, JobError::store("staging directory missing")),
            },
            Err(error) => {
                // Dropping the staging dir discards the partial output.
                drop(staging);
                self.finish_failed(id, error);
            }
        }
    }

    /// Record a job done with its output path, release its dependents, and
    /// satisfy any parked twins with the same result.
    fn finish_done(&mut self, id: JobId, path: PathBuf, cached: bool) {
        self.set_state(id, JobState::Done);
        self.outputs[id] = Some(path.clone());
        self.cached[id] = cached;
        self.release_dependents(id);

        let digest = self.graph.job(id).id;
        if self.claims.get(&digest).map(|claim| claim.owner) == Some(id) {
            let waiters = self
                .claims
                .remove(&digest)
                .map(|claim| claim.waiters)
                .unwrap_or_default();
            for waiter in waiters {
                self.finish_done(waiter, path.clone(), true);
            }
        }
    }

    fn release_dependents(&mut self, id: JobId) {
        let dependents = std::mem::take(&mut self.dependents[id]);
        for dependent in dependents {
            self.pending_deps[dependent] -= 1;
            if self.pending_deps[dependent] == 0 && self.states[dependent] == JobState::Pending {
                self.to_check.push_back(dependent);
            }
        }
    }

    fn finish_failed(&mut self, id: JobId, error: JobError) {
        log::debug!("job {} failed: {}", self.graph.job(id).name, error);
        self.set_state(id, JobState::Failed);
        self.failures.insert(id, error);
        self.failure_count += 1;
        self.cascade_blocked(id);
    }

    /// Mark every transitive dependent of `root`, and any twin parked on
    /// its claim, as blocked on it.
    fn cascade_blocked(&mut self, root: JobId) {
        let mut frontier = std::mem::take(&mut self.dependents[root]);
        let digest = self.graph.job(root).id;
        if self.claims.get(&digest).map(|claim| claim.owner) == Some(root) {
            if let Some(claim) = self.claims.remove(&digest) {
                frontier.extend(claim.waiters);
            }
        }
        while let Some(id) = frontier.pop() {
            // Only jobs that have not started can become blocked; anything
            // past Ready already has all its deps done.
            if !matches!(self.states[id], JobState::Pending | JobState::Ready) {
                continue;
            }
            self.set_state(id, JobState::Blocked);
            self.blocked_on.insert(id, root);
            frontier.extend(std::mem::take(&mut self.dependents[id]));
        }
    }

    fn report(&self) -> BuildReport {
        let mut statuses = Vec::with_capacity(self.graph.jobs.len());
        for id in self.states.all_ids() {
            let status = match self.states[id] {
                JobState::Done => JobStatus::Done {
                    path: self.outputs[id].clone().unwrap_or_default(),
                    cached: self.cached[id],
                },
                JobState::Failed => JobStatus::Failed {
                    error: self
                        .failures
                        .get(&id)
                        .cloned()
                        .unwrap_or_else(|| JobError::store("unrecorded failure")),
                },
                JobState::Blocked => {
                    let root = self.blocked_on.get(&id).copied().unwrap_or(id);
                    JobStatus::Blocked {
                        on: self.graph.job(root).id,
                    }
                }
                JobState::Skipped => JobStatus::Skipped,
                state => unreachable!("job in state {:?} after run", state),
            };
            statuses.push(status);
        }
        BuildReport {
            statuses,
            ran: self.ran,
        }
    }
}

fn path_str(path: &Path) -> Result<&str, JobError> {
    match path.to_str() {
        Some(s) => Ok(s),
        None => Err(JobError::store(format!("non-utf8 path {:?}", path))),
    }
}
