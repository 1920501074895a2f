//! Represents command strings with embedded placeholders, e.g.
//! `cc {{SOURCE_DIR}}/main.c -o {{OUTPUT_DIR}}/app`, and mechanisms for
//! expanding those into plain strings.

use crate::id::{Id, ParseIdError};
use crate::smallmap::SmallMap;

/// One token within a templated string, either literal text or a
/// placeholder.  The placeholder set is closed: anything else inside
/// `{{...}}` is an error, never text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Part<'a> {
    Literal(&'a str),
    /// `{{OUTPUT_DIR}}`: the directory the job writes its results into.
    OutputDir,
    /// `{{SOURCE_DIR}}`: the root of the source tree.
    SourceDir,
    /// `{{DEP:<id>}}`: the materialized output directory of a dependency.
    Dep(Id),
}

/// The concrete paths one job's commands are rendered against.
pub struct Env<'a> {
    pub output_dir: &'a str,
    pub source_dir: &'a str,
    /// Output directory per declared dependency.
    pub deps: &'a SmallMap<Id, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("unterminated placeholder at {snippet:?}")]
    Unterminated { snippet: String },
    #[error("unknown placeholder {name:?}")]
    Unknown { name: String },
    #[error("bad id in dep placeholder: {0}")]
    BadDepId(#[from] ParseIdError),
    #[error("dep {0} is not declared by this job")]
    UndeclaredDep(Id),
}

/// Split a templated string into literal and placeholder parts.  Text with
/// no `{{` passes through as a single literal; single braces are ordinary
/// characters.
pub fn parse(text: &str) -> Result<Vec<Part>, RenderError> {
    let mut parts = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("{{") {
        if open > 0 {
            parts.push(Part::Literal(&rest[..open]));
        }
        let after = &rest[open + 2..];
        let close = match after.find("}}") {
            Some(close) => close,
            None => {
                return Err(RenderError::Unterminated {
                    snippet: snippet(&rest[open..]),
                })
            }
        };
        let name = &after[..close];
        parts.push(match name {
            "OUTPUT_DIR" => Part::OutputDir,
            "SOURCE_DIR" => Part::SourceDir,
            _ => match name.strip_prefix("DEP:") {
                Some(hex) => Part::Dep(Id::from_hex(hex)?),
                None => {
                    return Err(RenderError::Unknown {
                        name: name.to_string(),
                    })
                }
            },
        });
        rest = &after[close + 2..];
    }
    if !rest.is_empty() {
        parts.push(Part::Literal(rest));
    }
    Ok(parts)
}

// Cap quoted text in diagnostics.
fn snippet(text: &str) -> String {
    text.chars().take(24).collect()
}

/// Expand every placeholder in `text` against `env`.  Pure string work: no
/// filesystem access, and plain text comes back unchanged.
pub fn expand(text: &str, env: &Env) -> Result<String, RenderError> {
    if !text.contains("{{") {
        return Ok(text.to_string());
    }
    let mut result = String::with_capacity(text.len());
    for part in parse(text)? {
        match part {
            Part::Literal(s) => result.push_str(s),
            Part::OutputDir => result.push_str(env.output_dir),
            Part::SourceDir => result.push_str(env.source_dir),
            Part::Dep(id) => match env.deps.get(&id) {
                Some(path) => result.push_str(path),
                None => return Err(RenderError::UndeclaredDep(id)),
            },
        }
    }
    Ok(result)
}

/// Collect the dependency ids referenced by `text`'s placeholders.
pub fn dep_refs(text: &str) -> Result<Vec<Id>, RenderError> {
    Ok(parse(text)?
        .into_iter()
        .filter_map(|part| match part {
            Part::Dep(id) => Some(id),
            _ => None,
        })
        .collect())
}
