//! Non-fatal annotations attached to snapshots.
//!
//! Anything that degrades, skips, or repairs a figure produces a [`Warning`] so consumers never
//! present silently wrong numbers as authoritative.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningCode {
    /// Several metrics share a name and no preference settled it
    AmbiguousMetric,
    /// A grouped series lost its grouping
    DegenerateSeries,
    /// A channel's attributed sum matched the total revenue
    ChannelEqualsTotal,
    /// A channel's series could not be obtained
    ChannelUnavailable,
    /// Attributed revenue exceeded total and was scaled down
    AttributionClamped,
    /// Campaign revenue was estimated from the fallback heuristic
    CampaignRevenueEstimated,
    /// A sum was NaN, infinite, or negative
    InvalidSum,
    /// Total revenue could not be obtained
    TotalRevenueUnavailable,
    /// A domain extraction failed and produced an empty result
    TaskFailed,
    /// A domain extraction was abandoned on cancellation or deadline
    TaskCancelled,
    /// A single entity's sub-query failed
    EntitySkipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Warning {
    pub code: WarningCode,
    /// Component or domain that raised it, e.g. `flows` or `reconciler`
    pub source: String,
    pub message: String,
}

impl Warning {
    pub fn new(code: WarningCode, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            source: source.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {:?}: {}", self.source, self.code, self.message)
    }
}
