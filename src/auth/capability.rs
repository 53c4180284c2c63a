//! Capability tokens and the grant predicate
//!
//! Capabilities are `_`-segmented tokens such as `KNOWLEDGE_KNUPDATE`. A
//! principal holding `BYPASS` is granted everything. Otherwise each required
//! token must be satisfied by some held token, either as a prefix of its
//! segments (`segment`) or as a plain substring (`containment`, the historical
//! behavior kept for compatibility).

use serde::{Deserialize, Serialize};
use std::fmt;

pub const BYPASS: &str = "BYPASS";
pub const KNOWLEDGE: &str = "KNOWLEDGE";
pub const KNOWLEDGE_KNUPDATE: &str = "KNOWLEDGE_KNUPDATE";
pub const KNOWLEDGE_KNUPDATE_KNDELETE: &str = "KNOWLEDGE_KNUPDATE_KNDELETE";
pub const KNOWLEDGE_KNUPLOAD: &str = "KNOWLEDGE_KNUPLOAD";
pub const KNOWLEDGE_KNASKIMPORT: &str = "KNOWLEDGE_KNASKIMPORT";
pub const KNOWLEDGE_KNGETEXPORT: &str = "KNOWLEDGE_KNGETEXPORT";
pub const KNOWLEDGE_KNGETEXPORT_KNASKEXPORT: &str = "KNOWLEDGE_KNGETEXPORT_KNASKEXPORT";
pub const KNOWLEDGE_KNENRICHMENT: &str = "KNOWLEDGE_KNENRICHMENT";
pub const EXPLORE: &str = "EXPLORE";
pub const EXPLORE_EXUPDATE: &str = "EXPLORE_EXUPDATE";
pub const EXPLORE_EXUPDATE_EXDELETE: &str = "EXPLORE_EXUPDATE_EXDELETE";
pub const MODULES: &str = "MODULES";
pub const MODULES_MODMANAGE: &str = "MODULES_MODMANAGE";
pub const SETTINGS: &str = "SETTINGS";
pub const SETTINGS_SETINFERENCES: &str = "SETTINGS_SETINFERENCES";
pub const SETTINGS_SETACCESSES: &str = "SETTINGS_SETACCESSES";
pub const SETTINGS_SETMARKINGS: &str = "SETTINGS_SETMARKINGS";

/// How a held token satisfies a required one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Required segments are a prefix of the held segments
    #[default]
    Segment,
    /// Held token contains the required token as a substring
    Containment,
}

impl fmt::Display for MatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchMode::Segment => write!(f, "segment"),
            MatchMode::Containment => write!(f, "containment"),
        }
    }
}

/// A capability held by a principal, serialized as `{ "name": ... }`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
}

impl Capability {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn is_bypass(&self) -> bool {
        self.name == BYPASS
    }

    /// Whether this held capability satisfies `required` under `mode`
    pub fn satisfies(&self, required: &str, mode: MatchMode) -> bool {
        match mode {
            MatchMode::Containment => self.name.contains(required),
            MatchMode::Segment => {
                let mut held = self.name.split('_');
                required
                    .split('_')
                    .all(|segment| held.next() == Some(segment))
            }
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl From<&str> for Capability {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Capability {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

/// Decide whether `held` grants `required`.
///
/// `BYPASS` grants everything, the empty set included. Without it an empty
/// requirement set is granted only when `match_all` is set.
pub fn is_granted<R: AsRef<str>>(
    held: &[Capability],
    required: &[R],
    match_all: bool,
    mode: MatchMode,
) -> bool {
    if held.iter().any(Capability::is_bypass) {
        return true;
    }

    let satisfied = |req: &R| held.iter().any(|cap| cap.satisfies(req.as_ref(), mode));

    if match_all {
        required.iter().all(satisfied)
    } else {
        required.iter().any(satisfied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(names: &[&str]) -> Vec<Capability> {
        names.iter().map(|n| Capability::new(*n)).collect()
    }

    #[test]
    fn test_bypass_grants_everything() {
        let held = caps(&[BYPASS]);
        let empty: [&str; 0] = [];
        for mode in [MatchMode::Segment, MatchMode::Containment] {
            assert!(is_granted(&held, &empty, false, mode));
            assert!(is_granted(&held, &empty, true, mode));
            assert!(is_granted(&held, &["NOT_A_REAL_CAPABILITY"], true, mode));
            assert!(is_granted(&held, &[SETTINGS, KNOWLEDGE], true, mode));
        }
    }

    #[test]
    fn test_match_all_versus_any() {
        let held = caps(&[KNOWLEDGE_KNUPLOAD]);
        let required = [KNOWLEDGE_KNUPLOAD, KNOWLEDGE_KNGETEXPORT];
        for mode in [MatchMode::Segment, MatchMode::Containment] {
            assert!(!is_granted(&held, &required, true, mode));
            assert!(is_granted(&held, &required, false, mode));
        }
    }

    #[test]
    fn test_empty_requirements_without_bypass() {
        let held = caps(&[KNOWLEDGE]);
        let empty: [&str; 0] = [];
        assert!(!is_granted(&held, &empty, false, MatchMode::Segment));
        assert!(is_granted(&held, &empty, true, MatchMode::Segment));
    }

    #[test]
    fn test_child_token_satisfies_parent() {
        let held = caps(&[KNOWLEDGE_KNUPDATE_KNDELETE]);
        assert!(is_granted(&held, &[KNOWLEDGE], true, MatchMode::Segment));
        assert!(is_granted(&held, &[KNOWLEDGE_KNUPDATE], true, MatchMode::Segment));
        assert!(!is_granted(&held, &[SETTINGS], false, MatchMode::Segment));
    }

    #[test]
    fn test_parent_does_not_satisfy_child() {
        let held = caps(&[KNOWLEDGE]);
        assert!(!is_granted(&held, &[KNOWLEDGE_KNUPDATE], false, MatchMode::Segment));
        assert!(!is_granted(&held, &[KNOWLEDGE_KNUPDATE], false, MatchMode::Containment));
    }

    #[test]
    fn test_segment_rejects_substring_lookalike() {
        let held = caps(&["XKNOWLEDGE_KNUPLOAD"]);
        assert!(!is_granted(&held, &[KNOWLEDGE], false, MatchMode::Segment));
        assert!(is_granted(&held, &[KNOWLEDGE], false, MatchMode::Containment));
    }

    #[test]
    fn test_segment_requires_whole_segments() {
        let held = caps(&["KNOWLEDGE_KNUPDATEX"]);
        assert!(!is_granted(&held, &[KNOWLEDGE_KNUPDATE], false, MatchMode::Segment));
        assert!(is_granted(&held, &[KNOWLEDGE], false, MatchMode::Segment));
    }

    #[test]
    fn test_no_capabilities() {
        let held: Vec<Capability> = Vec::new();
        assert!(!is_granted(&held, &[KNOWLEDGE], false, MatchMode::Segment));
        assert!(!is_granted(&held, &[KNOWLEDGE], true, MatchMode::Segment));
    }

    #[test]
    fn test_capability_serializes_as_object() {
        let json = serde_json::to_string(&Capability::new(BYPASS)).unwrap();
        assert_eq!(json, r#"{"name":"BYPASS"}"#);
    }
}
