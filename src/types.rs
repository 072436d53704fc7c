//! Core identifier types shared across the engine.
//!
//! - [`FlowRef`]: a workflow document reference of the form `id@version`
//! - id minting helpers for sessions, branches, snapshots, and jobs
//!
//! Runtime records (rounds, jobs, snapshots) live in [`crate::store::model`];
//! this module only defines the vocabulary they reference each other with.

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error raised when a flow reference string cannot be parsed.
#[derive(Debug, Error, Diagnostic)]
#[error("invalid flow ref '{input}': expected 'id@version'")]
#[diagnostic(
    code(taleloom::types::invalid_flow_ref),
    help("Flow references look like 'main@1': a document id, '@', and an integer version.")
)]
pub struct FlowRefError {
    pub input: String,
}

/// A reference to a registered workflow document: `id@version`.
///
/// The loader indexes every document under its full reference. A bare id is
/// also accepted at the API surface and resolves to the highest registered
/// version; that resolution happens in the loader, not here.
///
/// # Examples
///
/// ```
/// use taleloom::types::FlowRef;
///
/// let r: FlowRef = "main@1".parse().unwrap();
/// assert_eq!(r.id, "main");
/// assert_eq!(r.version, 1);
/// assert_eq!(r.to_string(), "main@1");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FlowRef {
    pub id: String,
    pub version: u32,
}

impl FlowRef {
    #[must_use]
    pub fn new(id: impl Into<String>, version: u32) -> Self {
        Self {
            id: id.into(),
            version,
        }
    }
}

impl fmt::Display for FlowRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.version)
    }
}

impl FromStr for FlowRef {
    type Err = FlowRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || FlowRefError {
            input: s.to_string(),
        };
        let (id, version) = s.rsplit_once('@').ok_or_else(err)?;
        if id.is_empty() {
            return Err(err());
        }
        let version: u32 = version.parse().map_err(|_| err())?;
        if version == 0 {
            return Err(err());
        }
        Ok(Self::new(id, version))
    }
}

impl TryFrom<String> for FlowRef {
    type Error = FlowRefError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<FlowRef> for String {
    fn from(r: FlowRef) -> Self {
        r.to_string()
    }
}

/// Mints a prefixed random id, e.g. `sess_1f9c...`.
#[must_use]
pub fn new_id(prefix: &str) -> String {
    format!("{prefix}{}", uuid::Uuid::new_v4().simple())
}

pub fn new_session_id() -> String {
    new_id("sess_")
}

pub fn new_branch_id() -> String {
    new_id("br_")
}

pub fn new_snapshot_id() -> String {
    new_id("snap_")
}

pub fn new_job_id() -> String {
    new_id("job_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_ref_parses_and_displays() {
        let r: FlowRef = "status_update@3".parse().unwrap();
        assert_eq!(r, FlowRef::new("status_update", 3));
        assert_eq!(r.to_string(), "status_update@3");
    }

    #[test]
    fn flow_ref_rejects_malformed_input() {
        for bad in ["main", "main@", "@1", "main@zero", "main@0", ""] {
            assert!(bad.parse::<FlowRef>().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn flow_ref_id_may_contain_at_free_segments() {
        // rsplit keeps ids with '@' in the middle resolvable
        let r: FlowRef = "a@b@2".parse().unwrap();
        assert_eq!(r.id, "a@b");
        assert_eq!(r.version, 2);
    }

    #[test]
    fn ids_are_prefixed_and_unique() {
        let a = new_session_id();
        let b = new_session_id();
        assert!(a.starts_with("sess_"));
        assert_ne!(a, b);
    }
}
