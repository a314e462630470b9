//! Extraction orchestration.
//!
//! [`Extractor::extract`] runs the revenue, flow, campaign, list, and form extractions
//! concurrently, reconciles revenue once they are in, and merges everything into one
//! [`ExtractionSnapshot`]. A failing domain degrades to an empty result plus a warning; only
//! credential failures abort the run. Cancellation or the run deadline abandon whatever is still
//! in flight and return the partial snapshot marked incomplete.

mod domains;
pub mod snapshot;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

pub use snapshot::{
    CampaignSummary, ExtractionSnapshot, FlowSummary, FormSummary, ListSummary, SnapshotMetadata,
};

use crate::aggregates::{AggregateEngine, AggregateSeries, Measurement};
use crate::config::{Config, ExtractionConfig, RevenueConfig};
use crate::errors::{Error, Result};
use crate::http::HttpClient;
use crate::limits::{RateLimiter, RateTier};
use crate::metrics::MetricResolver;
use crate::platform::PlatformApi;
use crate::platform::models::{Campaign, Flow, Form, List};
use crate::reconcile::{RevenueReconciler, RevenueSnapshot};
use crate::transport::Transport;
use crate::types::DateRange;
use crate::warnings::{Warning, WarningCode};
use domains::{Domain, Output, Report, Run};

pub struct Extractor<H: HttpClient + 'static> {
    transport: Arc<Transport<H>>,
    api: PlatformApi<H>,
    engine: Arc<AggregateEngine<H>>,
    reconciler: RevenueReconciler,
    extraction: ExtractionConfig,
    revenue: RevenueConfig,
    tier: RateTier,
}

impl<H: HttpClient + 'static> Extractor<H> {
    /// Build the full client stack (limiter, transport, platform API) around `client`.
    pub fn new(client: H, config: &Config) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.budget()));
        let transport = Arc::new(Transport::new(
            client,
            limiter,
            config.retry,
            config.api.request_timeout,
        ));
        Self::with_transport(transport, config)
    }

    /// Share an existing transport, and with it its rate limiter.
    pub fn with_transport(transport: Arc<Transport<H>>, config: &Config) -> Self {
        Self {
            api: PlatformApi::new(transport.clone(), config.api.max_pages),
            engine: Arc::new(AggregateEngine::new(transport.clone(), config.extraction.max_query_span)),
            transport,
            reconciler: RevenueReconciler::new(config.revenue.campaign_estimate_fraction),
            extraction: config.extraction.clone(),
            revenue: config.revenue.clone(),
            tier: config.rate_limit.tier,
        }
    }

    pub fn transport(&self) -> &Arc<Transport<H>> {
        &self.transport
    }

    /// Extract and reconcile everything for `date_range`.
    ///
    /// Fails only on credential errors. Cancelling `cancel` (or passing `extraction.run_timeout`)
    /// returns the partial snapshot with `metadata.complete = false`.
    #[tracing::instrument(skip(self, cancel), fields(start = %date_range.start, end = %date_range.end))]
    pub async fn extract(&self, date_range: DateRange, cancel: CancellationToken) -> Result<ExtractionSnapshot> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let counters_before = self.transport.counters();
        let run_cancel = cancel.child_token();

        tracing::info!(%run_id, tier = ?self.tier, "Starting extraction run");

        let run = Arc::new(Run {
            api: self.api.clone(),
            engine: self.engine.clone(),
            resolver: MetricResolver::new(self.api.clone()),
            permits: Semaphore::new(self.extraction.max_concurrent_calls.max(1)),
            in_flight: AtomicUsize::new(0),
            extraction: self.extraction.clone(),
            revenue: self.revenue.clone(),
            date_range,
            cancel: run_cancel.clone(),
        });

        let mut tasks = JoinSet::new();
        for domain in Domain::ALL {
            tasks.spawn(
                run.clone()
                    .execute(domain)
                    .instrument(tracing::info_span!("domain", %run_id, %domain)),
            );
        }

        let mut merged = Merged::default();
        let mut pending = Domain::ALL.to_vec();
        let mut complete = true;
        let deadline = tokio::time::sleep(self.extraction.run_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    tracing::warn!("Extraction run cancelled");
                    complete = false;
                    break;
                }
                _ = &mut deadline => {
                    tracing::warn!(timeout = ?self.extraction.run_timeout, "Extraction run deadline passed");
                    complete = false;
                    break;
                }
                joined = tasks.join_next() => {
                    let Some(joined) = joined else { break };
                    let (domain, result) = match joined {
                        Ok(done) => done,
                        Err(e) => {
                            tracing::error!(error = %e, "Domain task panicked");
                            continue;
                        }
                    };
                    pending.retain(|d| *d != domain);

                    match result {
                        Ok(report) => merged.absorb(report),
                        Err(e) if e.is_fatal() => {
                            tracing::error!(%domain, error = %e, "Fatal error, aborting extraction run");
                            run_cancel.cancel();
                            tasks.abort_all();
                            return Err(e);
                        }
                        Err(Error::Cancelled) => {
                            complete = false;
                            merged.warnings.push(cancelled(domain));
                        }
                        Err(e) => merged.warnings.push(Warning::new(
                            WarningCode::TaskFailed,
                            domain.as_str(),
                            format!("{domain} extraction failed: {e}"),
                        )),
                    }
                }
            }
        }

        run_cancel.cancel();
        tasks.abort_all();
        for domain in pending {
            merged.warnings.push(if complete {
                Warning::new(
                    WarningCode::TaskFailed,
                    domain.as_str(),
                    format!("{domain} extraction ended without a result"),
                )
            } else {
                cancelled(domain)
            });
        }

        let metadata = SnapshotMetadata {
            run_id,
            started_at,
            finished_at: Utc::now(),
            tier: self.tier,
            budget: self.transport.limiter().budget(),
            counters: self.transport.counters().since(counters_before),
            complete,
        };
        let snapshot = merged.into_snapshot(&self.reconciler, date_range, metadata);

        tracing::info!(
            %run_id,
            complete = snapshot.metadata.complete,
            calls = snapshot.metadata.counters.calls,
            throttled = snapshot.metadata.counters.throttled,
            warnings = snapshot.warnings.len(),
            attribution_percentage = snapshot.revenue.attribution_percentage,
            "Extraction run finished"
        );
        Ok(snapshot)
    }
}

fn cancelled(domain: Domain) -> Warning {
    Warning::new(
        WarningCode::TaskCancelled,
        domain.as_str(),
        format!("{domain} extraction abandoned before completing"),
    )
}

/// Domain results collected as tasks finish.
#[derive(Default)]
struct Merged {
    total: Option<AggregateSeries>,
    flows: Vec<Flow>,
    flow_series: Option<AggregateSeries>,
    campaigns: Vec<Campaign>,
    campaign_series: Option<AggregateSeries>,
    lists: Vec<List>,
    forms: Vec<Form>,
    submissions: Option<HashMap<String, u64>>,
    warnings: Vec<Warning>,
}

impl Merged {
    fn absorb(&mut self, report: Report) {
        self.warnings.extend(report.warnings);
        match report.output {
            Output::Revenue(series) => self.total = Some(series),
            Output::Flows { flows, series } => {
                self.flows = flows;
                self.flow_series = series;
            }
            Output::Campaigns { campaigns, series } => {
                self.campaigns = campaigns;
                self.campaign_series = series;
            }
            Output::Lists(lists) => self.lists = lists,
            Output::Forms { forms, submissions } => {
                self.forms = forms;
                self.submissions = submissions;
            }
        }
    }

    fn into_snapshot(self, reconciler: &RevenueReconciler, date_range: DateRange, metadata: SnapshotMetadata) -> ExtractionSnapshot {
        let flow_names: HashMap<String, String> = self.flows.iter().map(|f| (f.id.clone(), f.name.clone())).collect();
        let campaign_names: HashMap<String, String> =
            self.campaigns.iter().map(|c| (c.id.clone(), c.name.clone())).collect();

        let revenue = match &self.total {
            Some(total) => reconciler
                .reconcile(total, self.flow_series.as_ref(), self.campaign_series.as_ref())
                .with_names(&flow_names, &campaign_names),
            None => RevenueSnapshot::unavailable("total revenue could not be obtained; attribution not computed"),
        };

        let flow_revenue: HashMap<&str, f64> =
            revenue.per_flow_revenue.iter().map(|i| (i.id.as_str(), i.revenue)).collect();
        let flow_conversions = conversions(self.flow_series.as_ref());
        let mut flows: Vec<FlowSummary> = self
            .flows
            .into_iter()
            .map(|f| FlowSummary {
                revenue: flow_revenue.get(f.id.as_str()).copied().unwrap_or(0.0),
                conversions: flow_conversions.get(&f.id).copied().unwrap_or(0),
                id: f.id,
                name: f.name,
                status: f.status,
                archived: f.archived,
                trigger_type: f.trigger_type,
            })
            .collect();
        flows.sort_by(|a, b| b.revenue.total_cmp(&a.revenue).then_with(|| a.name.cmp(&b.name)));

        let campaign_revenue: HashMap<&str, f64> =
            revenue.per_campaign_revenue.iter().map(|i| (i.id.as_str(), i.revenue)).collect();
        let campaign_conversions = conversions(self.campaign_series.as_ref());
        let mut campaigns: Vec<CampaignSummary> = self
            .campaigns
            .into_iter()
            .map(|c| CampaignSummary {
                revenue: campaign_revenue.get(c.id.as_str()).copied().unwrap_or(0.0),
                conversions: campaign_conversions.get(&c.id).copied().unwrap_or(0),
                id: c.id,
                name: c.name,
                channel: c.channel,
                status: c.status,
                send_time: c.send_time,
            })
            .collect();
        campaigns.sort_by(|a, b| b.revenue.total_cmp(&a.revenue).then_with(|| a.name.cmp(&b.name)));

        let lists = self
            .lists
            .into_iter()
            .map(|l| ListSummary {
                id: l.id,
                name: l.name,
                profile_count: l.profile_count,
                created_at: l.created_at,
            })
            .collect();

        let submissions = self.submissions;
        let forms = self
            .forms
            .into_iter()
            .map(|f| FormSummary {
                submissions: submissions.as_ref().map(|s| s.get(&f.id).copied().unwrap_or(0)),
                id: f.id,
                name: f.name,
                status: f.status,
            })
            .collect();

        let mut warnings: Vec<Warning> = Vec::with_capacity(self.warnings.len() + revenue.warnings.len());
        for warning in self.warnings.into_iter().chain(revenue.warnings.iter().cloned()) {
            if !warnings.contains(&warning) {
                warnings.push(warning);
            }
        }

        ExtractionSnapshot {
            date_range,
            revenue,
            campaigns,
            flows,
            lists,
            forms,
            warnings,
            metadata,
        }
    }
}

/// Attributed order counts by entity id, empty for degenerate series.
fn conversions(series: Option<&AggregateSeries>) -> HashMap<String, u64> {
    series
        .filter(|s| !s.degenerate)
        .map(|s| {
            s.group_sums(Measurement::Count)
                .into_iter()
                .filter_map(|(key, count)| key.primary().map(|id| (id.to_string(), count.round().max(0.0) as u64)))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests;
