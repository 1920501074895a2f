//! The build graph: content-addressed jobs and the commands they run.
//!
//! A job's id is derived from everything that determines its result, so the
//! graph can be checked against an output store before any work happens.
//! The graph itself is plain data; scheduling lives in `work`.

use crate::densemap;
use crate::eval::{self, RenderError};
use crate::hash;
use crate::id::Id;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Dense index of a job within [`Graph::jobs`], used by the execution
/// engine's per-job state tables.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct JobId(usize);
impl densemap::Index for JobId {
    fn index(&self) -> usize {
        self.0
    }
}
impl From<usize> for JobId {
    fn from(u: usize) -> JobId {
        JobId(u)
    }
}

/// One build command.  A closed set of variants: construction is exhaustive
/// and execution dispatch is total, with no field-sniffing involved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cmd {
    /// Run `argv[0]` with the rest as arguments.  `env` holds `KEY=VALUE`
    /// overlay entries on top of the inherited environment; `working_dir`
    /// empty means the job's output directory.
    Exec {
        argv: Vec<String>,
        #[serde(default)]
        env: Vec<String>,
        #[serde(default)]
        working_dir: String,
    },
    /// Write the rendered `template` text to the `output` path, relative to
    /// the job's output directory.
    Cat { template: String, output: String },
}

impl Cmd {
    /// Produce a copy with every placeholder in every field substituted.
    /// Pure: the original command is untouched.
    pub fn render(&self, env: &eval::Env) -> Result<Cmd, RenderError> {
        Ok(match self {
            Cmd::Exec {
                argv,
                env: environ,
                working_dir,
            } => Cmd::Exec {
                argv: argv
                    .iter()
                    .map(|arg| eval::expand(arg, env))
                    .collect::<Result<_, _>>()?,
                env: environ
                    .iter()
                    .map(|entry| eval::expand(entry, env))
                    .collect::<Result<_, _>>()?,
                working_dir: eval::expand(working_dir, env)?,
            },
            Cmd::Cat { template, output } => Cmd::Cat {
                template: eval::expand(template, env)?,
                output: eval::expand(output, env)?,
            },
        })
    }

    /// Dependency ids referenced from any field's placeholders.  A
    /// malformed placeholder surfaces as the error rendering will hit.
    pub fn dep_refs(&self) -> Result<Vec<Id>, RenderError> {
        let mut ids = Vec::new();
        for field in self.templated_fields() {
            ids.extend(eval::dep_refs(field)?);
        }
        Ok(ids)
    }

    fn templated_fields(&self) -> Vec<&str> {
        match self {
            Cmd::Exec {
                argv,
                env,
                working_dir,
            } => {
                let mut fields: Vec<&str> = argv.iter().map(|s| s.as_str()).collect();
                fields.extend(env.iter().map(|s| s.as_str()));
                fields.push(working_dir);
                fields
            }
            Cmd::Cat { template, output } => vec![template, output],
        }
    }
}

/// A vertex in the build DAG: one unit of cacheable work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: Id,
    /// Human-readable label for logs; not part of the id.
    pub name: String,
    /// Source file paths this job reads, relative to the source root.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Ids of jobs whose outputs this job consumes.
    #[serde(default)]
    pub deps: Vec<Id>,
    pub cmds: Vec<Cmd>,
}

/// The full input to one build run: a content-addressed source tree plus
/// the jobs that consume it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    /// Content hash of each source file, mapped to its path relative to the
    /// source root.
    #[serde(default)]
    pub source_files: HashMap<Id, String>,
    #[serde(default)]
    pub jobs: Vec<Job>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidateError {
    #[error("job {name:?} ({job}) depends on unknown job {dep}")]
    DanglingDep { name: String, job: Id, dep: Id },
    #[error("jobs {a:?} and {b:?} share id {id} with conflicting definitions")]
    DuplicateId { id: Id, a: String, b: String },
    #[error("dependency cycle: {}", .ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(" -> "))]
    Cycle { ids: Vec<Id> },
    #[error("job {name:?} ({job}): command references undeclared dep {dep}")]
    UndeclaredDep { name: String, job: Id, dep: Id },
    #[error("job {name:?} reads {path:?}, which is not in the source set")]
    UnknownInput { name: String, path: String },
}

impl Graph {
    pub fn job(&self, id: JobId) -> &Job {
        &self.jobs[id.0]
    }

    /// Content-address `contents` and record it under `path`, dropping any
    /// hash previously recorded for the same path.
    pub fn add_source(&mut self, path: impl Into<String>, contents: &[u8]) -> Id {
        let path = path.into();
        self.source_files.retain(|_, p| *p != path);
        let id = hash::hash_file(contents);
        self.source_files.insert(id, path);
        id
    }

    /// Append a job, deriving its id from the declared inputs' content
    /// hashes, the commands, and the dependency ids.  Every input path must
    /// already be recorded via [`Graph::add_source`].
    pub fn push_job(
        &mut self,
        name: impl Into<String>,
        inputs: &[&str],
        deps: Vec<Id>,
        cmds: Vec<Cmd>,
    ) -> Result<Id, ValidateError> {
        let name = name.into();
        let mut input_ids = Vec::with_capacity(inputs.len());
        for &path in inputs {
            match self.source_id(path) {
                Some(id) => input_ids.push(id),
                None => {
                    return Err(ValidateError::UnknownInput {
                        name,
                        path: path.to_string(),
                    })
                }
            }
        }
        let id = hash::hash_job(&input_ids, &cmds, &deps);
        self.jobs.push(Job {
            id,
            name,
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            deps,
            cmds,
        });
        Ok(id)
    }

    fn source_id(&self, path: &str) -> Option<Id> {
        self.source_files
            .iter()
            .find(|(_, p)| p.as_str() == path)
            .map(|(id, _)| *id)
    }

    /// Map each distinct job id to its first occurrence in the job list.
    pub fn jobs_by_id(&self) -> FxHashMap<Id, JobId> {
        let mut map = FxHashMap::default();
        for (idx, job) in self.jobs.iter().enumerate() {
            map.entry(job.id).or_insert(JobId(idx));
        }
        map
    }

    /// Check the graph's structural invariants, in order: dangling deps,
    /// conflicting duplicate ids, cycles, undeclared placeholder deps,
    /// unknown inputs.  Read-only; run once before execution.
    pub fn validate(&self) -> Result<(), ValidateError> {
        let by_id = self.jobs_by_id();

        // Every dep must name a job in this graph.
        for job in &self.jobs {
            for dep in &job.deps {
                if !by_id.contains_key(dep) {
                    return Err(ValidateError::DanglingDep {
                        name: job.name.clone(),
                        job: job.id,
                        dep: *dep,
                    });
                }
            }
        }

        // A repeated id must describe the same work.  Identical twins are
        // legal and collapse to one execution; conflicting definitions
        // under one id would make the id a lie.
        for job in &self.jobs {
            let first = self.job(by_id[&job.id]);
            if !same_work(first, job) {
                return Err(ValidateError::DuplicateId {
                    id: job.id,
                    a: first.name.clone(),
                    b: job.name.clone(),
                });
            }
        }

        self.check_acyclic(&by_id)?;

        // Commands may only reference declared deps.  Malformed
        // placeholders are left for render time, where they fail the job.
        for job in &self.jobs {
            for cmd in &job.cmds {
                if let Ok(refs) = cmd.dep_refs() {
                    for dep in refs {
                        if !job.deps.contains(&dep) {
                            return Err(ValidateError::UndeclaredDep {
                                name: job.name.clone(),
                                job: job.id,
                                dep,
                            });
                        }
                    }
                }
            }
        }

        // Inputs must come from the content-addressed source set.
        for job in &self.jobs {
            for path in &job.inputs {
                if !self.source_files.values().any(|p| p == path) {
                    return Err(ValidateError::UnknownInput {
                        name: job.name.clone(),
                        path: path.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Depth-first cycle check over dep edges, reporting the cycle's ids in
    /// walk order when one exists.
    fn check_acyclic(&self, by_id: &FxHashMap<Id, JobId>) -> Result<(), ValidateError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            Visiting,
            Done,
        }
        let mut marks = vec![Mark::New; self.jobs.len()];
        for start in 0..self.jobs.len() {
            if marks[start] != Mark::New {
                continue;
            }
            // Stack of (job index, next dep offset); the stack itself is the
            // Visiting chain.
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
            marks[start] = Mark::Visiting;
            while let Some(frame) = stack.last_mut() {
                let (job, next) = *frame;
                let deps = &self.jobs[job].deps;
                if next == deps.len() {
                    marks[job] = Mark::Done;
                    stack.pop();
                    continue;
                }
                frame.1 += 1;
                // Dep presence was checked before this pass.
                let dep = by_id[&deps[next]].0;
                match marks[dep] {
                    Mark::New => {
                        marks[dep] = Mark::Visiting;
                        stack.push((dep, 0));
                    }
                    Mark::Visiting => {
                        // Back edge: the cycle runs from `dep`'s frame down
                        // to the top of the stack, closing back on `dep`.
                        let pos = stack
                            .iter()
                            .position(|&(j, _)| j == dep)
                            .unwrap_or_default();
                        let mut ids: Vec<Id> =
                            stack[pos..].iter().map(|&(j, _)| self.jobs[j].id).collect();
                        ids.push(self.jobs[dep].id);
                        return Err(ValidateError::Cycle { ids });
                    }
                    Mark::Done => {}
                }
            }
        }
        Ok(())
    }
}

/// Whether two jobs sharing an id describe the same work.  The name is
/// display metadata and does not count; dep order does not count either,
/// since ids treat deps as a set.
fn same_work(a: &Job, b: &Job) -> bool {
    fn canon_deps(job: &Job) -> Vec<Id> {
        let mut deps = job.deps.clone();
        deps.sort_unstable();
        deps.dedup();
        deps
    }
    a.inputs == b.inputs && a.cmds == b.cmds && canon_deps(a) == canon_deps(b)
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

    /// A job with a forged id, for wiring up shapes push_job can't produce.
    fn raw_job(id_byte: u8, name: &str, deps: Vec<Id>, cmds: Vec<Cmd>) -> Job {
        Job {
            id: Id::from_bytes([id_byte; 20]),
            name: name.to_string(),
            inputs: Vec::new(),
            deps,
            cmds,
        }
    }

    #[test]
    fn push_job_derives_id_from_content() {
        let mut a = Graph::default();
        a.add_source("main.c", b"int main() {}");
        let id_a = a
            .push_job("cc", &["main.c"], vec![], vec![cat("x", "out")])
            .unwrap();

        let mut b = Graph::default();
        b.add_source("main.c", b"int main() {}");
        let id_b = b
            .push_job("cc renamed", &["main.c"], vec![], vec![cat("x", "out")])
            .unwrap();

        // Same content, same commands: same id, regardless of name.
        assert_eq!(id_a, id_b);

        let mut c = Graph::default();
        c.add_source("main.c", b"int main() { return 1; }");
        let id_c = c
            .push_job("cc", &["main.c"], vec![], vec![cat("x", "out")])
            .unwrap();
        assert_ne!(id_a, id_c);
    }

    #[test]
    fn push_job_rejects_unlisted_input() {
        let mut graph = Graph::default();
        let err = graph
            .push_job("cc", &["ghost.c"], vec![], vec![])
            .unwrap_err();
        assert!(matches!(err, ValidateError::UnknownInput { .. }));
        assert!(graph.jobs.is_empty());
    }

    #[test]
    fn add_source_replaces_same_path() {
        let mut graph = Graph::default();
        let old = graph.add_source("a.txt", b"one");
        let new = graph.add_source("a.txt", b"two");
        assert_ne!(old, new);
        assert_eq!(graph.source_files.len(), 1);
        assert_eq!(graph.source_files[&new], "a.txt");
    }

    #[test]
    fn validate_accepts_empty_and_simple_graphs() {
        assert_eq!(Graph::default().validate(), Ok(()));

        let mut graph = Graph::default();
        graph.add_source("in.txt", b"data");
        graph
            .push_job("only", &["in.txt"], vec![], vec![cat("y", "out")])
            .unwrap();
        assert_eq!(graph.validate(), Ok(()));
    }

    #[test]
    fn validate_rejects_dangling_dep() {
        let mut graph = Graph::default();
        let ghost = Id::from_bytes([9; 20]);
        graph
            .push_job("needy", &[], vec![ghost], vec![cat("x", "out")])
            .unwrap();
        assert!(matches!(
            graph.validate(),
            Err(ValidateError::DanglingDep { dep, .. }) if dep == ghost
        ));
    }

    #[test]
    fn validate_allows_identical_twins() {
        let mut graph = Graph::default();
        let a = graph
            .push_job("twin one", &[], vec![], vec![cat("x", "out")])
            .unwrap();
        let b = graph
            .push_job("twin two", &[], vec![], vec![cat("x", "out")])
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(graph.validate(), Ok(()));
    }

    #[test]
    fn validate_allows_twins_with_reordered_deps() {
        let mut graph = Graph::default();
        let x = graph.push_job("x", &[], vec![], vec![cat("x", "o")]).unwrap();
        let y = graph.push_job("y", &[], vec![], vec![cat("y", "o")]).unwrap();
        let fwd = graph
            .push_job("fwd", &[], vec![x, y], vec![cat("z", "o")])
            .unwrap();
        let rev = graph
            .push_job("rev", &[], vec![y, x], vec![cat("z", "o")])
            .unwrap();
        assert_eq!(fwd, rev);
        assert_eq!(graph.validate(), Ok(()));
    }

    #[test]
    fn validate_rejects_conflicting_duplicate_id() {
        let mut graph = Graph::default();
        graph.jobs.push(raw_job(7, "first", vec![], vec![cat("a", "out")]));
        graph.jobs.push(raw_job(7, "second", vec![], vec![cat("b", "out")]));
        assert!(matches!(
            graph.validate(),
            Err(ValidateError::DuplicateId { .. })
        ));
    }

    #[test]
    fn validate_detects_cycle() {
        let mut graph = Graph::default();
        let a = Id::from_bytes([1; 20]);
        let b = Id::from_bytes([2; 20]);
        graph.jobs.push(raw_job(1, "a", vec![b], vec![cat("a", "o")]));
        graph.jobs.push(raw_job(2, "b", vec![a], vec![cat("b", "o")]));
        match graph.validate() {
            Err(ValidateError::Cycle { ids }) => {
                assert!(ids.contains(&a));
                assert!(ids.contains(&b));
                // The path closes on the job it started from.
                assert_eq!(ids.first(), ids.last());
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn validate_detects_self_cycle() {
        let mut graph = Graph::default();
        let a = Id::from_bytes([3; 20]);
        graph.jobs.push(raw_job(3, "self", vec![a], vec![cat("a", "o")]));
        assert!(matches!(
            graph.validate(),
            Err(ValidateError::Cycle { .. })
        ));
    }

    #[test]
    fn validate_rejects_undeclared_placeholder_dep() {
        let mut graph = Graph::default();
        let dep = graph.push_job("dep", &[], vec![], vec![cat("d", "o")]).unwrap();
        let stranger = Id::from_bytes([8; 20]);
        graph.jobs.push(raw_job(8, "stranger", vec![], vec![cat("s", "o")]));
        // References a real job, but one missing from its own deps list.
        graph
            .push_job(
                "user",
                &[],
                vec![dep],
                vec![cat(&format!("{{{{DEP:{}}}}}", stranger), "o")],
            )
            .unwrap();
        assert!(matches!(
            graph.validate(),
            Err(ValidateError::UndeclaredDep { dep, .. }) if dep == stranger
        ));
    }

    #[test]
    fn validate_defers_malformed_placeholders_to_render() {
        let mut graph = Graph::default();
        graph
            .push_job("sloppy", &[], vec![], vec![cat("{{OOPS", "out")])
            .unwrap();
        // Structurally fine; the job itself will fail when rendered.
        assert_eq!(graph.validate(), Ok(()));
    }

    #[test]
    fn validate_rejects_unknown_input() {
        let mut graph = Graph::default();
        graph.jobs.push(Job {
            id: Id::from_bytes([5; 20]),
            name: "reader".to_string(),
            inputs: vec!["ghost.txt".to_string()],
            deps: vec![],
            cmds: vec![cat("x", "out")],
        });
        assert!(matches!(
            graph.validate(),
            Err(ValidateError::UnknownInput { path, .. }) if path == "ghost.txt"
        ));
    }

    #[test]
    fn render_rewrites_every_field() {
        let id = Id::from_bytes([4; 20]);
        let mut deps = crate::smallmap::SmallMap::new();
        deps.insert(id, "/store/dep".to_string());
        let env = eval::Env {
            output_dir: "/out",
            source_dir: "/src",
            deps: &deps,
        };
        let cmd = Cmd::Exec {
            argv: vec!["cp".to_string(), format!("{{{{DEP:{}}}}}/f", id)],
            env: vec!["DEST={{OUTPUT_DIR}}".to_string()],
            working_dir: "{{SOURCE_DIR}}".to_string(),
        };
        let rendered = cmd.render(&env).unwrap();
        assert_eq!(
            rendered,
            Cmd::Exec {
                argv: vec!["cp".to_string(), "/store/dep/f".to_string()],
                env: vec!["DEST=/out".to_string()],
                working_dir: "/src".to_string(),
            }
        );

        let cmd = Cmd::Cat {
            template: "from {{SOURCE_DIR}}".to_string(),
            output: "{{OUTPUT_DIR}}/notes/build.txt".to_string(),
        };
        assert_eq!(
            cmd.render(&env).unwrap(),
            Cmd::Cat {
                template: "from /src".to_string(),
                output: "/out/notes/build.txt".to_string(),
            }
        );
    }

    #[test]
    fn wire_round_trip() {
        let mut graph = Graph::default();
        graph.add_source("main.c", b"int main() {}");
        let dep = graph
            .push_job("lib", &[], vec![], vec![cat("lib", "lib.txt")])
            .unwrap();
        graph
            .push_job(
                "app",
                &["main.c"],
                vec![dep],
                vec![cat(&format!("{{{{DEP:{}}}}}", dep), "app.txt")],
            )
            .unwrap();

        let json = serde_json::to_string(&graph).unwrap();
        // Ids travel as 40-char hex strings.
        assert!(json.contains(&dep.to_string()));
        let back: Graph = serde_json::from_str(&json).unwrap();
        assert_eq!(back, graph);
    }

    #[test]
    fn wire_rejects_bad_id() {
        let json = r#"{"jobs": [{"id": "xyz", "name": "bad", "cmds": []}]}"#;
        assert!(serde_json::from_str::<Graph>(json).is_err());
    }
}
