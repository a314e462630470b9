//! Metric name resolution.
//!
//! The platform mints a fresh generic metric whenever an event name collides with one already
//! owned by an integration, so a name alone does not identify a metric. The integration-owned
//! metric is the one the platform's own revenue math uses; resolving revenue metrics by first
//! match silently picks the wrong one. [`MetricResolver::resolve`] takes an explicit
//! preferred integration and reports an ambiguity warning whenever it has to guess.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::errors::{Error, Result};
use crate::warnings::{Warning, WarningCode};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricDescriptor {
    pub name: String,
    /// Upstream identifier, unique across the catalog
    pub identifier: String,
    /// Integration that created the metric, lowercased; `None` for platform-native metrics
    pub source_integration: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// A trait for fetching the full metric catalog.
///
/// In practice this is [`crate::platform::PlatformApi`]; tests use [`StaticCatalog`].
#[async_trait]
pub trait MetricCatalog: Send + Sync {
    async fn fetch_metrics(&self) -> Result<Vec<MetricDescriptor>>;
}

/// A static catalog returning a predefined list of metrics.
pub struct StaticCatalog {
    metrics: Vec<MetricDescriptor>,
}

impl StaticCatalog {
    pub fn new(metrics: Vec<MetricDescriptor>) -> Self {
        Self { metrics }
    }
}

#[async_trait]
impl MetricCatalog for StaticCatalog {
    async fn fetch_metrics(&self) -> Result<Vec<MetricDescriptor>> {
        Ok(self.metrics.clone())
    }
}

/// Outcome of a resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub descriptor: MetricDescriptor,
    /// Set when several metrics matched and the choice was a guess
    pub ambiguity: Option<Warning>,
}

/// Resolves metric names against a catalog fetched once per run.
pub struct MetricResolver<C: MetricCatalog> {
    catalog: C,
    metrics: OnceCell<Arc<Vec<MetricDescriptor>>>,
    resolved: DashMap<(String, Option<String>), Resolved>,
}

impl<C: MetricCatalog> MetricResolver<C> {
    pub fn new(catalog: C) -> Self {
        Self {
            catalog,
            metrics: OnceCell::new(),
            resolved: DashMap::new(),
        }
    }

    /// Resolve `name`, preferring the metric owned by `preferred_integration` when several share it.
    #[tracing::instrument(skip(self))]
    pub async fn resolve(&self, name: &str, preferred_integration: Option<&str>) -> Result<Resolved> {
        let key = (normalize(name), preferred_integration.map(normalize));
        if let Some(hit) = self.resolved.get(&key) {
            return Ok(hit.clone());
        }

        let catalog = self.catalog().await?;
        let resolved = choose(&catalog, name, &key.0, key.1.as_deref())?;

        if let Some(warning) = &resolved.ambiguity {
            tracing::warn!(
                metric = name,
                chosen = %resolved.descriptor.identifier,
                "{}", warning.message
            );
        } else {
            tracing::debug!(metric = name, identifier = %resolved.descriptor.identifier, "Resolved metric");
        }

        self.resolved.insert(key, resolved.clone());
        Ok(resolved)
    }

    /// The full catalog; concurrent first callers share a single fetch.
    pub async fn catalog(&self) -> Result<Arc<Vec<MetricDescriptor>>> {
        self.metrics
            .get_or_try_init(|| async {
                let metrics = self.catalog.fetch_metrics().await?;
                tracing::info!(count = metrics.len(), "Fetched metric catalog");
                Ok::<_, Error>(Arc::new(metrics))
            })
            .await
            .cloned()
    }
}

/// Trim, collapse inner whitespace, and lowercase.
fn normalize(name: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

fn choose(catalog: &[MetricDescriptor], name: &str, normalized: &str, preferred: Option<&str>) -> Result<Resolved> {
    let mut matches: Vec<&MetricDescriptor> = catalog.iter().filter(|m| normalize(&m.name) == normalized).collect();

    // "First" means oldest, so the answer does not depend on catalog order
    matches.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.identifier.cmp(&b.identifier))
    });

    match matches.as_slice() {
        [] => Err(Error::NotFound {
            resource: "metric".to_string(),
            id: name.to_string(),
        }),
        [only] => Ok(Resolved {
            descriptor: (*only).clone(),
            ambiguity: None,
        }),
        [first, ..] => {
            if let Some(preferred) = preferred
                && let Some(m) = matches
                    .iter()
                    .find(|m| m.source_integration.as_deref().map(normalize).as_deref() == Some(preferred))
            {
                return Ok(Resolved {
                    descriptor: (*m).clone(),
                    ambiguity: None,
                });
            }

            let candidates: Vec<String> = matches
                .iter()
                .map(|m| format!("{} ({})", m.identifier, m.source_integration.as_deref().unwrap_or("native")))
                .collect();
            let reason = match preferred {
                Some(p) => format!("none from preferred integration '{p}'"),
                None => "no preferred integration given".to_string(),
            };
            Ok(Resolved {
                descriptor: (*first).clone(),
                ambiguity: Some(Warning::new(
                    WarningCode::AmbiguousMetric,
                    "metric_resolver",
                    format!(
                        "{} metrics named '{name}' ({reason}); using {}. Candidates: {}",
                        matches.len(),
                        first.identifier,
                        candidates.join(", ")
                    ),
                )),
            })
        }
    }
}
