//! The immutable result of one extraction run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::limits::{RateBudget, RateTier};
use crate::reconcile::RevenueSnapshot;
use crate::transport::TransportCounters;
use crate::types::DateRange;
use crate::warnings::Warning;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSummary {
    pub id: String,
    pub name: String,
    pub status: Option<String>,
    pub archived: bool,
    pub trigger_type: Option<String>,
    /// Attributed revenue after reconciliation
    pub revenue: f64,
    /// Attributed orders
    pub conversions: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignSummary {
    pub id: String,
    pub name: String,
    pub channel: String,
    pub status: Option<String>,
    pub send_time: Option<DateTime<Utc>>,
    pub revenue: f64,
    pub conversions: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListSummary {
    pub id: String,
    pub name: String,
    pub profile_count: Option<u64>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormSummary {
    pub id: String,
    pub name: String,
    pub status: Option<String>,
    /// `None` when submissions could not be counted
    pub submissions: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tier: RateTier,
    pub budget: RateBudget,
    /// Upstream traffic this run produced
    pub counters: TransportCounters,
    /// False when the run was cancelled or hit its deadline before every domain finished
    pub complete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionSnapshot {
    pub date_range: DateRange,
    pub revenue: RevenueSnapshot,
    pub campaigns: Vec<CampaignSummary>,
    pub flows: Vec<FlowSummary>,
    pub lists: Vec<ListSummary>,
    pub forms: Vec<FormSummary>,
    /// Every degraded or skipped result of the run, revenue warnings included
    pub warnings: Vec<Warning>,
    pub metadata: SnapshotMetadata,
}
