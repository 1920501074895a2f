//! Identity hashing.  A job's id is a digest over its input contents, its
//! command list, and its dependencies' ids, so two jobs with equal ids
//! perform interchangeable work and the output store can serve as a cache.

use crate::graph::Cmd;
use crate::id::{Id, ID_LEN};
use rayon::prelude::*;
use sha1::{Digest, Sha1};
use std::path::Path;

// Section tags, so a value moved between sections can never alias a hash.
const INPUTS_SECTION: u8 = b'i';
const CMDS_SECTION: u8 = b'c';
const DEPS_SECTION: u8 = b'd';

/// Incrementally builds the canonical byte encoding fed to the digest.
/// Variable-length fields are length-prefixed so adjacent fields cannot run
/// together: ("ab","c") never encodes like ("a","bc").
struct IdHasher(Sha1);

impl IdHasher {
    fn new() -> IdHasher {
        IdHasher(Sha1::new())
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_len(bytes.len());
        self.0.update(bytes);
    }

    fn write_str(&mut self, s: &str) {
        self.write_bytes(s.as_bytes());
    }

    // Ids are fixed width and need no length prefix.
    fn write_id(&mut self, id: &Id) {
        self.0.update(id.as_bytes());
    }

    fn write_len(&mut self, n: usize) {
        self.0.update((n as u64).to_le_bytes());
    }

    fn write_tag(&mut self, tag: u8) {
        self.0.update([tag]);
    }

    fn finish(self) -> Id {
        let bytes: [u8; ID_LEN] = self.0.finalize().into();
        Id::from_bytes(bytes)
    }
}

/// Digest an ordered sequence of byte strings.  Order-sensitive: swapping
/// two parts changes the result.
pub fn digest<I>(parts: I) -> Id
where
    I: IntoIterator,
    I::Item: AsRef<[u8]>,
{
    let mut hasher = IdHasher::new();
    for part in parts {
        hasher.write_bytes(part.as_ref());
    }
    hasher.finish()
}

/// Content-address one file's bytes.
pub fn hash_file(contents: &[u8]) -> Id {
    digest([contents])
}

/// Content-address files under `root` in parallel, yielding `(id, path)`
/// pairs fit for [`crate::graph::Graph::add_source`] bookkeeping.
pub fn hash_files<P: AsRef<str> + Sync>(
    root: &Path,
    paths: &[P],
) -> anyhow::Result<Vec<(Id, String)>> {
    paths
        .par_iter()
        .map(|path| {
            let path = path.as_ref();
            let contents = std::fs::read(root.join(path))
                .map_err(|err| anyhow::anyhow!("read {}: {}", path, err))?;
            Ok((hash_file(&contents), path.to_string()))
        })
        .collect()
}

/// Compute a job's id from its input content hashes, commands, and
/// dependency ids.  Inputs and commands are hashed in declared order.
/// Dependencies are a set: they are sorted and deduplicated first, so two
/// jobs differing only in dep enumeration order get the same id.
pub fn hash_job(inputs: &[Id], cmds: &[Cmd], deps: &[Id]) -> Id {
    let mut hasher = IdHasher::new();

    hasher.write_tag(INPUTS_SECTION);
    hasher.write_len(inputs.len());
    for id in inputs {
        hasher.write_id(id);
    }

    hasher.write_tag(CMDS_SECTION);
    hasher.write_len(cmds.len());
    for cmd in cmds {
        write_cmd(&mut hasher, cmd);
    }

    let mut deps = deps.to_vec();
    deps.sort_unstable();
    deps.dedup();
    hasher.write_tag(DEPS_SECTION);
    hasher.write_len(deps.len());
    for id in &deps {
        hasher.write_id(id);
    }

    hasher.finish()
}

fn write_cmd(hasher: &mut IdHasher, cmd: &Cmd) {
    match cmd {
        Cmd::Exec {
            argv,
            env,
            working_dir,
        } => {
            hasher.write_tag(0);
            hasher.write_len(argv.len());
            for arg in argv {
                hasher.write_str(arg);
            }
            hasher.write_len(env.len());
            for entry in env {
                hasher.write_str(entry);
            }
            hasher.write_str(working_dir);
        }
        Cmd::Cat { template, output } => {
            hasher.write_tag(1);
            hasher.write_str(template);
            hasher.write_str(output);
        }
    }
}
