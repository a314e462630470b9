//! Aggregate queries over metric events.
//!
//! [`AggregateQuery`] describes what to measure; [`AggregateEngine`] sends it (split into chunks
//! when the range is longer than the upstream accepts) and returns one normalized
//! [`AggregateSeries`].

pub mod normalize;
pub mod series;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub use series::{AggregateSeries, GroupKey, SeriesGroup};

use crate::errors::Result;
use crate::http::{ApiRequest, HttpClient};
use crate::transport::Transport;
use crate::types::DateRange;

const AGGREGATES_PATH: &str = "metric-aggregates/";
const PAGE_SIZE: u32 = 500;

/// Bucket size of a time series.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interval {
    Hour,
    #[default]
    Day,
    Week,
    Month,
}

impl Interval {
    pub fn as_str(self) -> &'static str {
        match self {
            Interval::Hour => "hour",
            Interval::Day => "day",
            Interval::Week => "week",
            Interval::Month => "month",
        }
    }
}

/// What an aggregate computes per bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Measurement {
    /// Number of events
    Count,
    /// Sum of event values, i.e. revenue for order metrics
    SumValue,
    /// Distinct profiles
    Unique,
}

impl Measurement {
    pub const ALL: [Measurement; 3] = [Measurement::Count, Measurement::SumValue, Measurement::Unique];

    pub fn as_str(self) -> &'static str {
        match self {
            Measurement::Count => "count",
            Measurement::SumValue => "sum_value",
            Measurement::Unique => "unique",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateQuery {
    pub metric_id: String,
    pub date_range: DateRange,
    pub measurements: Vec<Measurement>,
    pub group_by: Vec<String>,
    pub interval: Interval,
    /// Extra filter expressions, ANDed with the date range
    pub filters: Vec<String>,
    pub timezone: String,
}

impl AggregateQuery {
    /// Daily revenue (`sum_value`) of a metric, ungrouped, in UTC.
    pub fn new(metric_id: impl Into<String>, date_range: DateRange) -> Self {
        Self {
            metric_id: metric_id.into(),
            date_range,
            measurements: vec![Measurement::SumValue],
            group_by: Vec::new(),
            interval: Interval::Day,
            filters: Vec::new(),
            timezone: "UTC".to_string(),
        }
    }

    pub fn measurements(mut self, measurements: impl IntoIterator<Item = Measurement>) -> Self {
        self.measurements = measurements.into_iter().collect();
        self
    }

    pub fn group_by(mut self, dimension: impl Into<String>) -> Self {
        self.group_by.push(dimension.into());
        self
    }

    pub fn interval(mut self, interval: Interval) -> Self {
        self.interval = interval;
        self
    }

    pub fn timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    pub fn filter(mut self, expression: impl Into<String>) -> Self {
        self.filters.push(expression.into());
        self
    }

    /// Restrict to events whose `dimension` equals `value`.
    pub fn where_equals(self, dimension: &str, value: &str) -> Self {
        let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
        self.filter(format!("equals({dimension},'{escaped}')"))
    }

    /// JSON:API request body for one chunk of the query.
    pub fn body(&self, range: &DateRange) -> Value {
        let mut filter = vec![
            format!("greater-or-equal(datetime,{})", range.start.format("%Y-%m-%dT%H:%M:%S")),
            format!("less-than(datetime,{})", range.end.format("%Y-%m-%dT%H:%M:%S")),
        ];
        filter.extend(self.filters.iter().cloned());

        let mut attributes = json!({
            "metric_id": self.metric_id,
            "measurements": self.measurements.iter().map(|m| m.as_str()).collect::<Vec<_>>(),
            "interval": self.interval.as_str(),
            "filter": filter,
            "timezone": self.timezone,
            "page_size": PAGE_SIZE,
        });
        if !self.group_by.is_empty() {
            attributes["by"] = json!(self.group_by);
        }

        json!({"data": {"type": "metric-aggregate", "attributes": attributes}})
    }
}

pub struct AggregateEngine<H: HttpClient> {
    transport: Arc<Transport<H>>,
    max_query_span: chrono::Duration,
}

impl<H: HttpClient> AggregateEngine<H> {
    pub fn new(transport: Arc<Transport<H>>, max_query_span: std::time::Duration) -> Self {
        Self {
            transport,
            max_query_span: chrono::Duration::from_std(max_query_span).unwrap_or(chrono::Duration::MAX),
        }
    }

    /// Run a query, chunking its range and concatenating the normalized chunks.
    #[tracing::instrument(skip(self, query), fields(metric_id = %query.metric_id, group_by = ?query.group_by))]
    pub async fn query(&self, query: &AggregateQuery) -> Result<AggregateSeries> {
        let chunks = query.date_range.chunks(self.max_query_span);
        let mut parts = Vec::with_capacity(chunks.len());

        for chunk in &chunks {
            let request = ApiRequest::post(AGGREGATES_PATH, query.body(chunk));
            let body: Value = self.transport.send_json(&request).await?;
            parts.push(normalize::normalize(&body, &query.group_by, chunk.start)?);
        }

        let series = AggregateSeries::concat(parts);
        tracing::debug!(
            chunks = chunks.len(),
            groups = series.groups.len(),
            buckets = series.buckets.len(),
            degenerate = series.degenerate,
            "Aggregate query complete"
        );
        Ok(series)
    }
}
