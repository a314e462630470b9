//! # revaudit: Revenue Extraction and Attribution Engine
//!
//! `revaudit` pulls marketing performance data out of a rate-limited analytics platform and turns
//! it into one internally consistent, auditable snapshot: total revenue, the share attributed to
//! automated flows and to campaigns, and summaries of the flows, campaigns, lists, and forms
//! behind those numbers.
//!
//! ## Why this is harder than it looks
//!
//! The upstream API enforces strict per-second and per-minute call budgets, exposes the same
//! semantic metric under several identifiers owned by different integrations, nests aggregate
//! results differently depending on the query, and offers no endpoint with a reconciled revenue
//! breakdown. Its grouped queries occasionally come back with the grouping silently dropped,
//! which makes "revenue attributed to flows" equal to the whole store's revenue. Every figure in
//! the snapshot therefore satisfies `0 <= attributed <= total` and `0 <= percentage <= 100`, and
//! every repair or omission made along the way is listed as a [`Warning`].
//!
//! ## Architecture
//!
//! Bottom-up:
//!
//! - [`limits::RateLimiter`]: sliding-window budget shared by every outbound call
//! - [`transport::Transport`]: rate-limited sends over an [`http::HttpClient`], retrying throttled
//!   and transient failures with bounded, jittered backoff
//! - [`platform::PlatformApi`]: cursor-paginated entity listings and the metric catalog
//! - [`metrics::MetricResolver`]: name to identifier resolution with an explicit integration
//!   preference, catalog fetched once per run
//! - [`aggregates::AggregateEngine`]: aggregate queries, normalized into [`AggregateSeries`]
//! - [`reconcile::RevenueReconciler`]: combines total and per-channel series under the
//!   accounting invariants
//! - [`extraction::Extractor`]: runs the domain extractions concurrently and assembles the
//!   [`ExtractionSnapshot`]
//!
//! ## Usage
//!
//! ```no_run
//! use revaudit::{Config, DateRange, Extractor, http::ReqwestHttpClient};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run(config: Config, range: DateRange) -> anyhow::Result<()> {
//! let client = ReqwestHttpClient::new(&config.api)?;
//! let extractor = Extractor::new(client, &config);
//! let snapshot = extractor.extract(range, CancellationToken::new()).await?;
//! println!("{}", serde_json::to_string_pretty(&snapshot)?);
//! # Ok(())
//! # }
//! ```

pub mod aggregates;
pub mod config;
pub mod errors;
pub mod extraction;
pub mod http;
pub mod limits;
pub mod metrics;
pub mod platform;
pub mod reconcile;
pub mod telemetry;
pub mod transport;
pub mod types;
pub mod warnings;

pub use aggregates::AggregateSeries;
pub use config::Config;
pub use errors::{Error, Result};
pub use extraction::{ExtractionSnapshot, Extractor};
pub use reconcile::RevenueSnapshot;
pub use types::DateRange;
pub use warnings::{Warning, WarningCode};
