//! # Priority levels for task dispatch.
//!
//! [`Priority`] orders tasks across four levels. Each level maps to its own
//! stream in the store; workers scan streams from `Critical` down to `Low`.
//!
//! ## Rules
//! - Unknown numeric or string values normalize to [`Priority::Normal`]
//! - Stream names are derived deterministically: `{prefix}:{level}`
//! - Within one stream delivery is FIFO; across streams preference for
//!   higher levels is best-effort (see the queue module docs)

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Dispatch priority of a task.
///
/// Serialized as an integer (0 = low .. 3 = critical) to match the wire
/// format of submit requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum Priority {
    /// Background work, visited when everything above is drained.
    Low,
    /// Default level.
    Normal,
    /// Preferred over normal traffic.
    High,
    /// Always scanned first.
    Critical,
}

/// All levels in claim-scan order: critical first.
pub const CLAIM_ORDER: [Priority; 4] = [
    Priority::Critical,
    Priority::High,
    Priority::Normal,
    Priority::Low,
];

impl Priority {
    /// Returns the stable lowercase name of the level.
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }

    /// Returns the stream name for this level under the given prefix.
    pub fn stream_name(&self, prefix: &str) -> String {
        format!("{prefix}:{}", self.as_str())
    }

    /// Converts an integer level, clamping unknown values to `Normal`.
    pub fn from_i32(v: i32) -> Self {
        match v {
            0 => Priority::Low,
            1 => Priority::Normal,
            2 => Priority::High,
            3 => Priority::Critical,
            _ => Priority::Normal,
        }
    }
}

impl Default for Priority {
    /// Returns [`Priority::Normal`].
    fn default() -> Self {
        Priority::Normal
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = std::convert::Infallible;

    /// Parses a level name; unknown names normalize to `Normal`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "low" => Priority::Low,
            "high" => Priority::High,
            "critical" => Priority::Critical,
            _ => Priority::Normal,
        })
    }
}

impl From<i32> for Priority {
    fn from(v: i32) -> Self {
        Priority::from_i32(v)
    }
}

impl From<Priority> for i32 {
    fn from(p: Priority) -> i32 {
        match p {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Critical => 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_order_is_critical_first() {
        assert_eq!(
            CLAIM_ORDER,
            [
                Priority::Critical,
                Priority::High,
                Priority::Normal,
                Priority::Low
            ]
        );
    }

    #[test]
    fn stream_names_are_deterministic() {
        assert_eq!(Priority::Critical.stream_name("tasks"), "tasks:critical");
        assert_eq!(Priority::Low.stream_name("jobs"), "jobs:low");
    }

    #[test]
    fn unknown_values_normalize_to_normal() {
        assert_eq!(Priority::from_i32(7), Priority::Normal);
        assert_eq!(Priority::from_i32(-1), Priority::Normal);
        assert_eq!("weird".parse::<Priority>().unwrap(), Priority::Normal);
    }

    #[test]
    fn ordering_follows_urgency() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn serde_uses_integer_levels() {
        let json = serde_json::to_string(&Priority::High).unwrap();
        assert_eq!(json, "2");
        let p: Priority = serde_json::from_str("3").unwrap();
        assert_eq!(p, Priority::Critical);
    }
}
