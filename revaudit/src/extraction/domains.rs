//! The per-domain work of one extraction run.
//!
//! Each domain runs as its own task over a shared [`Run`]. Every upstream interaction goes
//! through [`Run::call`], which holds one permit of the run's semaphore for the duration of the
//! logical call (pagination and chunking included) and gives up as soon as the run is cancelled.
//! Permits are never held across two calls, so domains cannot deadlock on each other.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::aggregates::{AggregateEngine, AggregateQuery, AggregateSeries, Measurement};
use crate::config::{ExtractionConfig, RevenueConfig};
use crate::errors::{Error, Result};
use crate::http::HttpClient;
use crate::metrics::{MetricResolver, Resolved};
use crate::platform::PlatformApi;
use crate::platform::models::{Campaign, Flow, Form, List};
use crate::types::DateRange;
use crate::warnings::{Warning, WarningCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(super) enum Domain {
    Revenue,
    Flows,
    Campaigns,
    Lists,
    Forms,
}

impl Domain {
    pub(super) const ALL: [Domain; 5] = [
        Domain::Revenue,
        Domain::Flows,
        Domain::Campaigns,
        Domain::Lists,
        Domain::Forms,
    ];

    pub(super) fn as_str(self) -> &'static str {
        match self {
            Domain::Revenue => "revenue",
            Domain::Flows => "flows",
            Domain::Campaigns => "campaigns",
            Domain::Lists => "lists",
            Domain::Forms => "forms",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(super) enum Output {
    Revenue(AggregateSeries),
    Flows {
        flows: Vec<Flow>,
        series: Option<AggregateSeries>,
    },
    Campaigns {
        campaigns: Vec<Campaign>,
        series: Option<AggregateSeries>,
    },
    Lists(Vec<List>),
    Forms {
        forms: Vec<Form>,
        submissions: Option<HashMap<String, u64>>,
    },
}

pub(super) struct Report {
    pub output: Output,
    pub warnings: Vec<Warning>,
}

/// State shared by the domain tasks of one run.
pub(super) struct Run<H: HttpClient + 'static> {
    pub api: PlatformApi<H>,
    pub engine: std::sync::Arc<AggregateEngine<H>>,
    /// Fresh per run so catalog changes between runs are picked up
    pub resolver: MetricResolver<PlatformApi<H>>,
    pub permits: Semaphore,
    pub in_flight: AtomicUsize,
    pub extraction: ExtractionConfig,
    pub revenue: RevenueConfig,
    pub date_range: DateRange,
    pub cancel: CancellationToken,
}

impl<H: HttpClient + 'static> Run<H> {
    pub(super) async fn execute(self: std::sync::Arc<Self>, domain: Domain) -> (Domain, Result<Report>) {
        let result = match domain {
            Domain::Revenue => self.total_revenue().await,
            Domain::Flows => self.flows().await,
            Domain::Campaigns => self.campaigns().await,
            Domain::Lists => self.lists().await,
            Domain::Forms => self.forms().await,
        };

        match &result {
            Ok(report) => tracing::info!(warnings = report.warnings.len(), "Domain extraction finished"),
            Err(e) => tracing::warn!(error = %e, "Domain extraction failed"),
        }
        (domain, result)
    }

    /// Run one logical upstream call under a concurrency permit.
    async fn call<T>(&self, operation: impl Future<Output = Result<T>>) -> Result<T> {
        let _permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            permit = self.permits.acquire() => permit.map_err(|_| Error::Cancelled)?,
        };

        let in_flight = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        let _guard = scopeguard::guard((), |_| {
            self.in_flight.fetch_sub(1, Ordering::Relaxed);
        });
        tracing::trace!(in_flight, "Logical call started");

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = operation => result,
        }
    }

    async fn pause(&self, delay: Duration) -> Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
        }
    }

    fn query(&self, metric_id: &str) -> AggregateQuery {
        AggregateQuery::new(metric_id, self.date_range)
            .interval(self.extraction.interval)
            .timezone(self.extraction.timezone.clone())
    }

    async fn revenue_metric(&self) -> Result<Resolved> {
        self.call(
            self.resolver
                .resolve(&self.revenue.metric_name, self.revenue.preferred_integration.as_deref()),
        )
        .await
    }

    async fn total_revenue(&self) -> Result<Report> {
        let metric = self.revenue_metric().await?;
        let warnings = metric.ambiguity.into_iter().collect();

        let query = self
            .query(&metric.descriptor.identifier)
            .measurements([Measurement::SumValue, Measurement::Count]);
        let series = self.call(self.engine.query(&query)).await?;

        Ok(Report {
            output: Output::Revenue(series),
            warnings,
        })
    }

    async fn flows(&self) -> Result<Report> {
        let mut warnings = Vec::new();

        let flows = match self.call(self.api.list_flows()).await {
            Ok(flows) => flows,
            Err(e) => {
                degrade(Domain::Flows, "listing flows", e, &mut warnings)?;
                Vec::new()
            }
        };

        let ids = flows.iter().map(|f| f.id.clone()).collect();
        let series = self
            .attributed_series(Domain::Flows, &self.revenue.flow_dimension, ids, &mut warnings)
            .await?;

        Ok(Report {
            output: Output::Flows { flows, series },
            warnings,
        })
    }

    async fn campaigns(&self) -> Result<Report> {
        let mut warnings = Vec::new();

        let mut campaigns = Vec::new();
        for channel in &self.extraction.campaign_channels {
            match self.call(self.api.list_campaigns(channel)).await {
                Ok(found) => campaigns.extend(found),
                Err(e) => degrade(
                    Domain::Campaigns,
                    &format!("listing {channel} campaigns"),
                    e,
                    &mut warnings,
                )?,
            }
        }

        let ids = campaigns.iter().map(|c| c.id.clone()).collect();
        let series = self
            .attributed_series(Domain::Campaigns, &self.revenue.campaign_dimension, ids, &mut warnings)
            .await?;

        Ok(Report {
            output: Output::Campaigns { campaigns, series },
            warnings,
        })
    }

    async fn lists(&self) -> Result<Report> {
        let lists = self.call(self.api.list_lists()).await?;
        Ok(Report {
            output: Output::Lists(lists),
            warnings: Vec::new(),
        })
    }

    async fn forms(&self) -> Result<Report> {
        let mut warnings = Vec::new();
        let forms = self.call(self.api.list_forms()).await?;

        let submissions = match &self.extraction.form_submission_metric {
            None => None,
            Some(metric) => match self.form_submissions(metric, &mut warnings).await {
                Ok(submissions) => submissions,
                Err(e) => {
                    degrade(Domain::Forms, "counting form submissions", e, &mut warnings)?;
                    None
                }
            },
        };

        Ok(Report {
            output: Output::Forms { forms, submissions },
            warnings,
        })
    }

    async fn form_submissions(&self, metric: &str, warnings: &mut Vec<Warning>) -> Result<Option<HashMap<String, u64>>> {
        let resolved = self.call(self.resolver.resolve(metric, None)).await?;
        warnings.extend(resolved.ambiguity);

        let query = self
            .query(&resolved.descriptor.identifier)
            .measurements([Measurement::Count])
            .group_by(self.extraction.form_dimension.clone());
        let series = self.call(self.engine.query(&query)).await?;

        if series.degenerate {
            warnings.push(Warning::new(
                WarningCode::DegenerateSeries,
                Domain::Forms.as_str(),
                format!("submissions grouped by {} lost their grouping; counts omitted", self.extraction.form_dimension),
            ));
            return Ok(None);
        }

        Ok(Some(
            series
                .group_sums(Measurement::Count)
                .into_iter()
                .filter_map(|(key, count)| key.primary().map(|id| (id.to_string(), count.round().max(0.0) as u64)))
                .collect(),
        ))
    }

    /// Revenue grouped by `dimension`, falling back to per-entity queries when the grouped query
    /// fails or comes back degenerate.
    async fn attributed_series(
        &self,
        domain: Domain,
        dimension: &str,
        ids: Vec<String>,
        warnings: &mut Vec<Warning>,
    ) -> Result<Option<AggregateSeries>> {
        let metric = match self.revenue_metric().await {
            Ok(metric) => metric,
            Err(e) => {
                degrade(domain, "resolving the revenue metric", e, warnings)?;
                return Ok(None);
            }
        };
        let metric_id = metric.descriptor.identifier;

        let query = self
            .query(&metric_id)
            .measurements([Measurement::SumValue, Measurement::Count])
            .group_by(dimension);
        let grouped = match self.call(self.engine.query(&query)).await {
            Ok(series) if !series.degenerate => return Ok(Some(series)),
            Ok(series) => Some(series),
            Err(e) => {
                degrade(domain, &format!("grouped {domain} revenue query"), e, warnings)?;
                None
            }
        };

        if ids.is_empty() {
            return Ok(grouped);
        }

        tracing::info!(%domain, entities = ids.len(), "Falling back to per-entity revenue queries");
        match self.per_entity(domain, &metric_id, dimension, ids, warnings).await? {
            Some(series) => {
                if grouped.is_some() {
                    warnings.push(Warning::new(
                        WarningCode::DegenerateSeries,
                        domain.as_str(),
                        format!("revenue grouped by {dimension} lost its grouping; recomputed per entity"),
                    ));
                }
                Ok(Some(series))
            }
            None => Ok(grouped),
        }
    }

    async fn per_entity(
        &self,
        domain: Domain,
        metric_id: &str,
        dimension: &str,
        ids: Vec<String>,
        warnings: &mut Vec<Warning>,
    ) -> Result<Option<AggregateSeries>> {
        let limit = self.extraction.max_entity_queries;
        if ids.len() > limit {
            warnings.push(Warning::new(
                WarningCode::EntitySkipped,
                domain.as_str(),
                format!(
                    "{} of {} {domain} exceed the per-entity query cap of {limit} and were not queried",
                    ids.len() - limit,
                    ids.len()
                ),
            ));
        }

        let mut entities = Vec::new();
        for (i, id) in ids.into_iter().take(limit).enumerate() {
            if i > 0 {
                self.pause(self.extraction.stagger).await?;
            }

            let query = self
                .query(metric_id)
                .measurements([Measurement::SumValue, Measurement::Count])
                .where_equals(dimension, &id);
            match self.call(self.engine.query(&query)).await {
                Ok(series) => entities.push((id, series)),
                Err(e) if e.is_fatal() || matches!(e, Error::Cancelled) => return Err(e),
                Err(e) => warnings.push(Warning::new(
                    WarningCode::EntitySkipped,
                    domain.as_str(),
                    format!("revenue query for {id} failed: {e}"),
                )),
            }
        }

        if entities.is_empty() {
            return Ok(None);
        }
        Ok(Some(AggregateSeries::from_entities(dimension, entities)))
    }
}

/// Turn a recoverable failure into a warning; fatal errors and cancellation propagate.
fn degrade(domain: Domain, what: &str, error: Error, warnings: &mut Vec<Warning>) -> Result<()> {
    if error.is_fatal() || matches!(error, Error::Cancelled) {
        return Err(error);
    }
    tracing::warn!(%domain, error = %error, "{what} failed");
    warnings.push(Warning::new(
        WarningCode::TaskFailed,
        domain.as_str(),
        format!("{what} failed: {error}"),
    ));
    Ok(())
}
