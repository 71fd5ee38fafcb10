//! Typed job prerequisite references.
//!
//! Plans write prerequisites as `job_N` (same module) or `module:job_N`
//! (another module), with `N` the 1-based position of the job as declared in
//! its plan file. Anything after the number introduced by `-` is a free-form
//! label and is ignored (`job_2 - write the parser`).
//!
//! References are parsed once, at graph build time. Scheduling only ever sees
//! [`Prerequisite`] values.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// A parsed prerequisite reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Prerequisite {
    /// `job_N` in the same module.
    SameModule { index: usize },
    /// `module:job_N` in another module.
    CrossModule { module: String, index: usize },
}

impl Prerequisite {
    /// The 1-based declared index of the referenced job.
    pub fn index(&self) -> usize {
        match self {
            Self::SameModule { index } | Self::CrossModule { index, .. } => *index,
        }
    }

    /// The referenced module, resolving same-module references against
    /// `owner`.
    pub fn module<'a>(&'a self, owner: &'a str) -> &'a str {
        match self {
            Self::SameModule { .. } => owner,
            Self::CrossModule { module, .. } => module,
        }
    }

    /// Turn `owner:job_N` into `job_N` so self-references are uniform.
    pub fn normalize(self, owner: &str) -> Self {
        match self {
            Self::CrossModule { module, index } if module == owner => Self::SameModule { index },
            other => other,
        }
    }
}

impl fmt::Display for Prerequisite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SameModule { index } => write!(f, "job_{index}"),
            Self::CrossModule { module, index } => write!(f, "{module}:job_{index}"),
        }
    }
}

/// Error returned when a prerequisite string is not `job_N` or `module:job_N`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid prerequisite {value:?}: {reason}")]
pub struct PrerequisiteParseError {
    pub value: String,
    pub reason: &'static str,
}

impl FromStr for Prerequisite {
    type Err = PrerequisiteParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| PrerequisiteParseError {
            value: s.to_owned(),
            reason,
        };

        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(err("empty reference"));
        }

        let (module, job_part) = match trimmed.split_once(':') {
            Some((module, rest)) => {
                let module = module.trim();
                if module.is_empty() {
                    return Err(err("missing module name before ':'"));
                }
                (Some(module), rest.trim())
            }
            None => (None, trimmed),
        };

        let index = parse_job_index(job_part).ok_or_else(|| {
            err("expected `job_N` or `module:job_N` with N >= 1")
        })?;

        Ok(match module {
            Some(module) => Self::CrossModule {
                module: module.to_owned(),
                index,
            },
            None => Self::SameModule { index },
        })
    }
}

/// Parse `job_N` with an optional ` - label` suffix.
fn parse_job_index(s: &str) -> Option<usize> {
    let rest = s.strip_prefix("job_")?;
    let digits_end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    let (digits, tail) = rest.split_at(digits_end);
    let tail = tail.trim_start();
    if !(tail.is_empty() || tail.starts_with('-')) {
        return None;
    }
    match digits.parse::<usize>() {
        Ok(0) | Err(_) => None,
        Ok(n) => Some(n),
    }
}
