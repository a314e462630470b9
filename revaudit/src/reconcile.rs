//! Revenue reconciliation.
//!
//! No upstream endpoint returns a reconciled breakdown, and the attributed series it does return
//! are sometimes wrong in ways that look plausible (a grouped query that silently returns the
//! store total, for instance). The reconciler combines the total and the per-channel series and
//! guarantees the accounting invariants of [`RevenueSnapshot`] whatever the inputs were:
//!
//! - `0 <= attributed_revenue <= total_revenue`
//! - `attributed_revenue == flow_attributed_revenue + campaign_attributed_revenue`
//! - `0 <= attribution_percentage <= 100`
//!
//! Every repair it makes is recorded as a [`Warning`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::aggregates::{AggregateSeries, Measurement};
use crate::warnings::{Warning, WarningCode};

const SOURCE: &str = "reconciler";

/// Largest amount accepted as revenue. Anything above is treated as a corrupt sum.
const MAX_AMOUNT: f64 = 1e15;

/// Revenue attributed to one flow or campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRevenue {
    pub id: String,
    pub name: Option<String>,
    pub revenue: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevenueSnapshot {
    pub total_revenue: f64,
    pub flow_attributed_revenue: f64,
    pub campaign_attributed_revenue: f64,
    pub attributed_revenue: f64,
    /// Share of total revenue that is attributed, in percent
    pub attribution_percentage: f64,
    /// Sorted by revenue, highest first
    pub per_flow_revenue: Vec<ItemRevenue>,
    pub per_campaign_revenue: Vec<ItemRevenue>,
    pub warnings: Vec<Warning>,
}

impl RevenueSnapshot {
    /// An all-zero snapshot for runs where total revenue could not be obtained.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            total_revenue: 0.0,
            flow_attributed_revenue: 0.0,
            campaign_attributed_revenue: 0.0,
            attributed_revenue: 0.0,
            attribution_percentage: 0.0,
            per_flow_revenue: Vec::new(),
            per_campaign_revenue: Vec::new(),
            warnings: vec![Warning::new(WarningCode::TotalRevenueUnavailable, SOURCE, reason)],
        }
    }

    /// Label per-item revenue with entity names, keyed by id.
    pub fn with_names(mut self, flows: &HashMap<String, String>, campaigns: &HashMap<String, String>) -> Self {
        for item in &mut self.per_flow_revenue {
            item.name = flows.get(&item.id).cloned();
        }
        for item in &mut self.per_campaign_revenue {
            item.name = campaigns.get(&item.id).cloned();
        }
        self
    }
}

/// A channel's contribution after validation, in cents.
struct Channel {
    cents: i128,
    items: Vec<(String, i128)>,
    /// Discarded or missing, as opposed to legitimately zero
    usable: bool,
}

impl Channel {
    fn discarded() -> Self {
        Self {
            cents: 0,
            items: Vec::new(),
            usable: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RevenueReconciler {
    campaign_estimate_fraction: Option<f64>,
}

impl RevenueReconciler {
    /// `campaign_estimate_fraction` enables estimating campaign revenue as that fraction of
    /// `total - flow` when no usable campaign series exists.
    pub fn new(campaign_estimate_fraction: Option<f64>) -> Self {
        Self {
            campaign_estimate_fraction: campaign_estimate_fraction.filter(|f| (0.0..=1.0).contains(f)),
        }
    }

    pub fn reconcile(
        &self,
        total: &AggregateSeries,
        flow: Option<&AggregateSeries>,
        campaign: Option<&AggregateSeries>,
    ) -> RevenueSnapshot {
        let mut warnings = Vec::new();

        let total_value = sanitize(total.sum(Measurement::SumValue), "total revenue", &mut warnings);
        let total_cents = to_cents(total_value);

        let mut flow = channel("flow", flow, total_value, &mut warnings);
        let mut campaign = channel("campaign", campaign, total_value, &mut warnings);

        if !campaign.usable
            && let Some(fraction) = self.campaign_estimate_fraction
        {
            let remainder = (total_cents - flow.cents).max(0);
            campaign.cents = (remainder as f64 * fraction).round() as i128;
            warnings.push(Warning::new(
                WarningCode::CampaignRevenueEstimated,
                SOURCE,
                format!(
                    "campaign revenue estimated as {:.0}% of unattributed-to-flow revenue ({:.2})",
                    fraction * 100.0,
                    from_cents(campaign.cents)
                ),
            ));
        }

        let attributed = flow.cents + campaign.cents;
        if attributed > total_cents {
            // Rounding alone can overshoot by a cent; anything more is a real inconsistency
            if attributed - total_cents > 1 {
                warnings.push(Warning::new(
                    WarningCode::AttributionClamped,
                    SOURCE,
                    format!(
                        "attributed revenue {:.2} (flow {:.2} + campaign {:.2}) exceeds total {:.2}; scaled down to total",
                        from_cents(attributed),
                        from_cents(flow.cents),
                        from_cents(campaign.cents),
                        total_value
                    ),
                ));
            }
            let factor = if attributed > 0 { total_cents as f64 / attributed as f64 } else { 0.0 };
            let scaled_flow = ((flow.cents as f64 * factor).round() as i128).clamp(0, total_cents);
            flow.cents = scaled_flow;
            campaign.cents = total_cents - scaled_flow;
            scale_items(&mut flow.items, factor, flow.cents);
            scale_items(&mut campaign.items, factor, campaign.cents);
        }

        let attributed = flow.cents + campaign.cents;
        let attribution_percentage = if total_cents > 0 {
            let percentage = attributed as f64 / total_cents as f64 * 100.0;
            ((percentage * 100.0).round() / 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };

        for warning in &warnings {
            tracing::warn!(code = ?warning.code, "{}", warning.message);
        }
        tracing::info!(
            total = from_cents(total_cents),
            flow = from_cents(flow.cents),
            campaign = from_cents(campaign.cents),
            attribution_percentage,
            "Revenue reconciled"
        );

        RevenueSnapshot {
            total_revenue: from_cents(total_cents),
            flow_attributed_revenue: from_cents(flow.cents),
            campaign_attributed_revenue: from_cents(campaign.cents),
            attributed_revenue: from_cents(attributed),
            attribution_percentage,
            per_flow_revenue: items(flow.items),
            per_campaign_revenue: items(campaign.items),
            warnings,
        }
    }
}

fn channel(name: &str, series: Option<&AggregateSeries>, total: f64, warnings: &mut Vec<Warning>) -> Channel {
    let Some(series) = series else {
        warnings.push(Warning::new(
            WarningCode::ChannelUnavailable,
            SOURCE,
            format!("{name} revenue series unavailable; counted as zero"),
        ));
        return Channel::discarded();
    };

    if series.degenerate {
        warnings.push(Warning::new(
            WarningCode::DegenerateSeries,
            SOURCE,
            format!(
                "{name} revenue series lost its grouping (reported {:.2}); counted as zero",
                series.sum(Measurement::SumValue)
            ),
        ));
        return Channel::discarded();
    }

    let mut invalid = 0;
    let items: Vec<(String, i128)> = series
        .group_sums(Measurement::SumValue)
        .into_iter()
        .map(|(key, value)| {
            let value = if valid_amount(value) {
                value
            } else {
                invalid += 1;
                0.0
            };
            (key.0.join("|"), to_cents(value))
        })
        .collect();
    if invalid > 0 {
        warnings.push(Warning::new(
            WarningCode::InvalidSum,
            SOURCE,
            format!("{invalid} {name} item(s) had non-finite, negative, or out-of-range revenue; counted as zero"),
        ));
    }

    let cents: i128 = items.iter().map(|(_, c)| c).sum();
    if cents > 0 && total > 0.0 && implausibly_equal(from_cents(cents), total) {
        warnings.push(Warning::new(
            WarningCode::ChannelEqualsTotal,
            SOURCE,
            format!("{name} attributed revenue equals total revenue ({total:.2}); counted as zero"),
        ));
        return Channel::discarded();
    }

    Channel {
        cents,
        items,
        usable: true,
    }
}

/// A channel sum landing on the total to within half a cent is not a real attribution.
fn implausibly_equal(channel: f64, total: f64) -> bool {
    (channel - total).abs() <= 0.005_f64.max(total.abs() * 1e-9)
}

fn valid_amount(value: f64) -> bool {
    value.is_finite() && (0.0..=MAX_AMOUNT).contains(&value)
}

fn sanitize(value: f64, what: &str, warnings: &mut Vec<Warning>) -> f64 {
    if valid_amount(value) {
        return value;
    }
    warnings.push(Warning::new(
        WarningCode::InvalidSum,
        SOURCE,
        format!("{what} was {value}; counted as zero"),
    ));
    0.0
}

/// Scale every item by `factor`, then put the rounding remainder on the largest item so the
/// items add up to `target` exactly.
fn scale_items(items: &mut [(String, i128)], factor: f64, target: i128) {
    for (_, cents) in items.iter_mut() {
        *cents = (*cents as f64 * factor).round() as i128;
    }
    let remainder = target - items.iter().map(|(_, c)| c).sum::<i128>();
    if let Some((_, largest)) = items.iter_mut().max_by_key(|(_, c)| *c) {
        *largest = (*largest + remainder).max(0);
    }
}

fn items(mut items: Vec<(String, i128)>) -> Vec<ItemRevenue> {
    items.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    items
        .into_iter()
        .map(|(id, cents)| ItemRevenue {
            id,
            name: None,
            revenue: from_cents(cents),
        })
        .collect()
}

fn to_cents(value: f64) -> i128 {
    (value * 100.0).round() as i128
}

fn from_cents(cents: i128) -> f64 {
    cents as f64 / 100.0
}
