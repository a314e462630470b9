//! The normalized time-series format every aggregate response is converted into.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Measurement;

/// Dimension values identifying one group, in `group_by` order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupKey(pub Vec<String>);

impl GroupKey {
    pub fn new<S: Into<String>>(values: impl IntoIterator<Item = S>) -> Self {
        Self(values.into_iter().map(Into::into).collect())
    }

    /// Activity not attributed to anything: every dimension value is empty.
    pub fn is_unattributed(&self) -> bool {
        self.0.iter().all(|v| v.trim().is_empty())
    }

    /// The first dimension value, which is the entity id for single-dimension groupings.
    pub fn primary(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesGroup {
    pub key: GroupKey,
    /// One value per bucket for every measurement present
    pub measurements: BTreeMap<Measurement, Vec<f64>>,
}

impl SeriesGroup {
    pub fn total(&self, measurement: Measurement) -> f64 {
        self.measurements
            .get(&measurement)
            .map(|values| values.iter().sum())
            .unwrap_or(0.0)
    }
}

/// Grouped time series sharing one set of bucket boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSeries {
    /// Dimensions the query asked to group by
    pub group_by: Vec<String>,
    /// Bucket start times, ascending
    pub buckets: Vec<DateTime<Utc>>,
    pub groups: Vec<SeriesGroup>,
    /// Grouping was requested but the response did not honor it
    pub degenerate: bool,
}

impl AggregateSeries {
    /// Build a series from already-grouped values.
    ///
    /// Flagged degenerate when grouping was requested and every group is unattributed.
    pub fn from_groups(group_by: Vec<String>, buckets: Vec<DateTime<Utc>>, groups: Vec<SeriesGroup>) -> Self {
        let degenerate = !group_by.is_empty() && !groups.is_empty() && groups.iter().all(|g| g.key.is_unattributed());
        Self {
            group_by,
            buckets,
            groups,
            degenerate,
        }
    }

    /// Sum of a measurement over every group and bucket.
    pub fn sum(&self, measurement: Measurement) -> f64 {
        self.groups.iter().map(|g| g.total(measurement)).sum()
    }

    /// Sum over attributed groups only.
    pub fn attributed_sum(&self, measurement: Measurement) -> f64 {
        self.groups
            .iter()
            .filter(|g| !g.key.is_unattributed())
            .map(|g| g.total(measurement))
            .sum()
    }

    /// Per-group totals for attributed groups, merged by key.
    pub fn group_sums(&self, measurement: Measurement) -> Vec<(GroupKey, f64)> {
        let mut order = Vec::new();
        let mut sums: HashMap<&GroupKey, f64> = HashMap::new();
        for group in self.groups.iter().filter(|g| !g.key.is_unattributed()) {
            let entry = sums.entry(&group.key).or_insert_with(|| {
                order.push(&group.key);
                0.0
            });
            *entry += group.total(measurement);
        }
        order.into_iter().map(|key| (key.clone(), sums[key])).collect()
    }

    /// Values summed across groups, one point per bucket.
    pub fn points(&self, measurement: Measurement) -> Vec<(DateTime<Utc>, f64)> {
        let mut values = vec![0.0; self.buckets.len()];
        for group in &self.groups {
            if let Some(series) = group.measurements.get(&measurement) {
                for (slot, value) in values.iter_mut().zip(series) {
                    *slot += value;
                }
            }
        }
        self.buckets.iter().copied().zip(values).collect()
    }

    /// Concatenate consecutive chunks of one query.
    ///
    /// Buckets are appended in order. Groups are unioned by key and zero-filled over the chunks
    /// they are missing from. The result is degenerate if any chunk was.
    pub fn concat(parts: Vec<AggregateSeries>) -> AggregateSeries {
        let group_by = parts.first().map(|p| p.group_by.clone()).unwrap_or_default();
        let total: usize = parts.iter().map(|p| p.buckets.len()).sum();
        let degenerate = parts.iter().any(|p| p.degenerate);

        let mut buckets = Vec::with_capacity(total);
        let mut groups: Vec<SeriesGroup> = Vec::new();
        let mut index: HashMap<GroupKey, usize> = HashMap::new();

        for part in parts {
            let offset = buckets.len();
            for group in part.groups {
                let position = *index.entry(group.key.clone()).or_insert_with(|| {
                    groups.push(SeriesGroup {
                        key: group.key.clone(),
                        measurements: BTreeMap::new(),
                    });
                    groups.len() - 1
                });
                let target = &mut groups[position];
                for (measurement, values) in group.measurements {
                    let slots = target
                        .measurements
                        .entry(measurement)
                        .or_insert_with(|| vec![0.0; total]);
                    for (i, value) in values.into_iter().enumerate() {
                        if let Some(slot) = slots.get_mut(offset + i) {
                            *slot += value;
                        }
                    }
                }
            }
            buckets.extend(part.buckets);
        }

        AggregateSeries {
            group_by,
            buckets,
            groups,
            degenerate,
        }
    }

    /// Combine ungrouped per-entity series into one series grouped by `dimension`.
    ///
    /// Each entry's values are collapsed across its groups and keyed by the entity id. Entries
    /// whose bucket count differs from the first are summed into a single bucket-aligned total on
    /// the first bucket.
    pub fn from_entities(dimension: &str, entities: Vec<(String, AggregateSeries)>) -> AggregateSeries {
        let buckets = entities.first().map(|(_, s)| s.buckets.clone()).unwrap_or_default();

        let groups = entities
            .into_iter()
            .map(|(id, series)| {
                let measurements = Measurement::ALL
                    .into_iter()
                    .filter(|m| series.groups.iter().any(|g| g.measurements.contains_key(m)))
                    .map(|m| {
                        let mut values: Vec<f64> = series.points(m).into_iter().map(|(_, v)| v).collect();
                        if values.len() != buckets.len() {
                            let total = values.iter().sum();
                            values = vec![0.0; buckets.len()];
                            if let Some(first) = values.first_mut() {
                                *first = total;
                            }
                        }
                        (m, values)
                    })
                    .collect();
                SeriesGroup {
                    key: GroupKey::new([id]),
                    measurements,
                }
            })
            .collect();

        AggregateSeries::from_groups(vec![dimension.to_string()], buckets, groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()
    }

    fn group(key: &str, values: &[f64]) -> SeriesGroup {
        SeriesGroup {
            key: GroupKey::new([key]),
            measurements: BTreeMap::from([(Measurement::SumValue, values.to_vec())]),
        }
    }

    fn flow_series(buckets: Vec<DateTime<Utc>>, groups: Vec<SeriesGroup>) -> AggregateSeries {
        AggregateSeries::from_groups(vec!["$attributed_flow".to_string()], buckets, groups)
    }

    #[test]
    fn test_unattributed_groups_excluded_from_attributed_sum() {
        let series = flow_series(
            vec![day(1), day(2)],
            vec![group("F1", &[10.0, 5.0]), group("", &[100.0, 100.0]), group("F2", &[1.0, 0.0])],
        );

        assert_eq!(series.sum(Measurement::SumValue), 216.0);
        assert_eq!(series.attributed_sum(Measurement::SumValue), 16.0);
        assert!(!series.degenerate);
        assert_eq!(
            series.group_sums(Measurement::SumValue),
            vec![(GroupKey::new(["F1"]), 15.0), (GroupKey::new(["F2"]), 1.0)]
        );
        assert_eq!(series.points(Measurement::SumValue), vec![(day(1), 111.0), (day(2), 105.0)]);
    }

    #[test]
    fn test_only_unattributed_groups_is_degenerate() {
        let series = flow_series(vec![day(1)], vec![group("", &[8_720_000.0])]);
        assert!(series.degenerate);
        assert_eq!(series.attributed_sum(Measurement::SumValue), 0.0);
    }

    #[test]
    fn test_empty_grouped_series_is_not_degenerate() {
        let series = flow_series(vec![day(1)], vec![]);
        assert!(!series.degenerate);
        assert_eq!(series.sum(Measurement::SumValue), 0.0);
    }

    #[test]
    fn test_concat_zero_fills_missing_groups() {
        let first = flow_series(vec![day(1), day(2)], vec![group("F1", &[1.0, 2.0])]);
        let second = flow_series(vec![day(3)], vec![group("F2", &[5.0]), group("F1", &[3.0])]);

        let series = AggregateSeries::concat(vec![first, second]);

        assert_eq!(series.buckets, vec![day(1), day(2), day(3)]);
        assert_eq!(series.groups[0].measurements[&Measurement::SumValue], vec![1.0, 2.0, 3.0]);
        assert_eq!(series.groups[1].measurements[&Measurement::SumValue], vec![0.0, 0.0, 5.0]);
        assert!(!series.degenerate);
    }

    #[test]
    fn test_from_entities_keys_by_id() {
        let ungrouped = |v: f64| AggregateSeries::from_groups(vec![], vec![day(1)], vec![group("", &[v])]);
        let series = AggregateSeries::from_entities(
            "$attributed_flow",
            vec![("F1".to_string(), ungrouped(4.0)), ("F2".to_string(), ungrouped(6.0))],
        );

        assert!(!series.degenerate);
        assert_eq!(series.attributed_sum(Measurement::SumValue), 10.0);
        assert_eq!(series.groups[1].key.primary(), Some("F2"));
    }
}
