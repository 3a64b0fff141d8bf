use serde::{Deserialize, Serialize};
use std::fmt;

/// SPF evaluation result (RFC 7208 section 2.6)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpfResult {
    /// Sender is authorized
    Pass,
    /// Sender is explicitly not authorized
    Fail,
    /// Sender is probably not authorized
    SoftFail,
    /// No statement about authorization
    Neutral,
    /// No SPF record published
    None,
    /// Record could not be interpreted
    PermError,
    /// Transient DNS failure
    TempError,
}

impl SpfResult {
    /// Map a mechanism qualifier (`+`, `-`, `~`, `?`) to its result.
    pub fn from_qualifier(qualifier: char) -> Self {
        match qualifier {
            '+' => SpfResult::Pass,
            '-' => SpfResult::Fail,
            '~' => SpfResult::SoftFail,
            _ => SpfResult::Neutral,
        }
    }
}

impl fmt::Display for SpfResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpfResult::Pass => write!(f, "pass"),
            SpfResult::Fail => write!(f, "fail"),
            SpfResult::SoftFail => write!(f, "softfail"),
            SpfResult::Neutral => write!(f, "neutral"),
            SpfResult::None => write!(f, "none"),
            SpfResult::PermError => write!(f, "permerror"),
            SpfResult::TempError => write!(f, "temperror"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DkimVerdict {
    Pass,
    Fail,
    /// No signature present, or the signature could not be parsed
    None,
}

impl fmt::Display for DkimVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DkimVerdict::Pass => write!(f, "pass"),
            DkimVerdict::Fail => write!(f, "fail"),
            DkimVerdict::None => write!(f, "none"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DmarcPolicy {
    Pass,
    Reject,
}

impl fmt::Display for DmarcPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DmarcPolicy::Pass => write!(f, "pass"),
            DmarcPolicy::Reject => write!(f, "reject"),
        }
    }
}
