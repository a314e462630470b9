//! Conversion of aggregate responses into [`AggregateSeries`].
//!
//! The upstream nests results differently depending on the query:
//!
//! - flat: `attributes.measurements = {"sum_value": [..]}`, one implicit group
//! - nested list: `attributes.data = [{"dimensions": [..], "measurements": {..}}]`
//! - nested object: `attributes.data = {"<tuple>": {..}}`, where the tuple is a JSON array string
//!   or a `|`-joined string
//!
//! The shape is decided from the response's declared structure alone.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::Measurement;
use super::series::{AggregateSeries, GroupKey, SeriesGroup};
use crate::errors::{Error, Result};

/// Normalize one aggregate response body.
///
/// `fallback_bucket` labels the single bucket of responses that carry no `dates`.
pub fn normalize(body: &Value, group_by: &[String], fallback_bucket: DateTime<Utc>) -> Result<AggregateSeries> {
    let attributes = body
        .get("data")
        .and_then(|d| d.get("attributes"))
        .or_else(|| body.get("attributes"))
        .ok_or_else(|| Error::malformed("aggregate response has no attributes"))?;

    let buckets = match attributes.get("dates") {
        Some(Value::Array(dates)) => dates.iter().map(parse_date).collect::<Result<Vec<_>>>()?,
        None | Some(Value::Null) => vec![fallback_bucket],
        Some(other) => return Err(Error::malformed(format!("aggregate dates is not an array: {other}"))),
    };
    let width = buckets.len();

    let series = match (attributes.get("data"), attributes.get("measurements")) {
        (Some(Value::Array(rows)), _) => {
            let groups = rows
                .iter()
                .map(|row| list_row(row, group_by, width))
                .collect::<Result<Vec<_>>>()?;
            AggregateSeries::from_groups(group_by.to_vec(), buckets, groups)
        }
        (Some(Value::Object(entries)), _) => {
            let groups = entries
                .iter()
                .map(|(tuple, measurements)| {
                    let key = tuple_key(tuple, group_by.len());
                    check_arity(&key, group_by)?;
                    Ok(SeriesGroup {
                        key,
                        measurements: parse_measurements(measurements, width)?,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            AggregateSeries::from_groups(group_by.to_vec(), buckets, groups)
        }
        (_, Some(measurements)) => {
            let group = SeriesGroup {
                key: GroupKey::default(),
                measurements: parse_measurements(measurements, width)?,
            };
            let mut series = AggregateSeries::from_groups(group_by.to_vec(), buckets, vec![group]);
            // Grouping requested but not honored
            series.degenerate = !group_by.is_empty();
            series
        }
        _ => return Err(Error::malformed("aggregate response has neither data nor measurements")),
    };

    if series.degenerate {
        tracing::warn!(group_by = ?group_by, "Grouped aggregate response collapsed to ungrouped data");
    }
    Ok(series)
}

fn list_row(row: &Value, group_by: &[String], width: usize) -> Result<SeriesGroup> {
    let dimensions = match row.get("dimensions") {
        Some(Value::Array(values)) => values.iter().map(dimension_value).collect(),
        None | Some(Value::Null) => Vec::new(),
        Some(other) => return Err(Error::malformed(format!("aggregate dimensions is not an array: {other}"))),
    };
    let key = GroupKey(dimensions);
    check_arity(&key, group_by)?;

    let measurements = row
        .get("measurements")
        .ok_or_else(|| Error::malformed("aggregate row has no measurements"))?;
    Ok(SeriesGroup {
        key,
        measurements: parse_measurements(measurements, width)?,
    })
}

fn tuple_key(raw: &str, arity: usize) -> GroupKey {
    if raw.trim_start().starts_with('[')
        && let Ok(values) = serde_json::from_str::<Vec<Value>>(raw)
    {
        return GroupKey(values.iter().map(dimension_value).collect());
    }
    if arity > 1 {
        GroupKey::new(raw.splitn(arity, '|'))
    } else {
        GroupKey::new([raw])
    }
}

fn check_arity(key: &GroupKey, group_by: &[String]) -> Result<()> {
    if !group_by.is_empty() && key.0.len() != group_by.len() {
        return Err(Error::malformed(format!(
            "group {:?} has {} dimension values, expected {} ({})",
            key.0,
            key.0.len(),
            group_by.len(),
            group_by.join(", ")
        )));
    }
    Ok(())
}

fn dimension_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn parse_measurements(value: &Value, width: usize) -> Result<BTreeMap<Measurement, Vec<f64>>> {
    let Value::Object(map) = value else {
        return Err(Error::malformed(format!("aggregate measurements is not an object: {value}")));
    };
    measurements_from_map(map, width)
}

fn measurements_from_map(map: &Map<String, Value>, width: usize) -> Result<BTreeMap<Measurement, Vec<f64>>> {
    let mut measurements = BTreeMap::new();
    for (name, values) in map {
        let Some(measurement) = Measurement::parse(name) else {
            tracing::debug!(measurement = %name, "Ignoring unknown measurement");
            continue;
        };

        let values = match values {
            Value::Array(items) => items.iter().map(number).collect::<Result<Vec<_>>>()?,
            scalar => vec![number(scalar)?],
        };
        if values.len() != width {
            return Err(Error::malformed(format!(
                "measurement '{name}' has {} values for {width} buckets",
                values.len()
            )));
        }
        measurements.insert(measurement, values);
    }
    Ok(measurements)
}

fn number(value: &Value) -> Result<f64> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| Error::malformed(format!("unrepresentable number {n}"))),
        Value::Null => Ok(0.0),
        other => Err(Error::malformed(format!("expected a number, got {other}"))),
    }
}

fn parse_date(value: &Value) -> Result<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))
        .ok_or_else(|| Error::malformed(format!("invalid bucket date {value}")))
}
