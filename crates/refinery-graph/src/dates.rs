//! ISO-8601 date reclassification
//!
//! Typed temporal values cannot ride in a bulk map merge, so any property
//! that should land as a date is pulled out of the generic property set and
//! emitted as its own typed-set operation. Two routes in: the message's
//! explicit `DateProperties`, and (when inference is enabled) any plain
//! property whose string value matches an ISO-8601 date or datetime.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime};
use refinery_model::{PropMap, PropValue};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

fn iso_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\d{4}-\d{2}-\d{2}([Tt ]\d{2}:\d{2}(:\d{2}(\.\d+)?)?([Zz]|[+-]\d{2}:?\d{2})?)?$")
            .unwrap()
    })
}

/// Parse an ISO-8601 date or datetime. Bare dates and zone-less datetimes
/// are taken as UTC.
pub fn parse_iso_datetime(raw: &str) -> Option<DateTime<FixedOffset>> {
    if !iso_re().is_match(raw) {
        return None;
    }
    let normalized = raw.replacen(' ', "T", 1);
    if let Ok(dt) = DateTime::parse_from_rfc3339(&normalized) {
        return Some(dt);
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&normalized, format) {
            return Some(naive.and_utc().fixed_offset());
        }
    }
    let date = NaiveDate::parse_from_str(&normalized, "%Y-%m-%d").ok()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc().fixed_offset())
}

/// Result of splitting a property set into plain and typed-date parts.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DateSplit {
    pub plain: PropMap,
    pub dates: BTreeMap<String, DateTime<FixedOffset>>,
}

/// Split `properties` into the generic merge map and typed date sets.
///
/// `explicit` entries always try to become dates; a value that does not
/// parse stays a plain property rather than failing the message. When
/// `infer` is set, string values in `properties` matching ISO-8601 are
/// reclassified too.
pub fn split_date_properties(properties: &PropMap, explicit: &PropMap, infer: bool) -> DateSplit {
    let mut split = DateSplit {
        plain: properties.clone(),
        ..DateSplit::default()
    };

    for (key, value) in explicit {
        let parsed = match value {
            PropValue::DateTime(dt) => Some(*dt),
            PropValue::String(s) => parse_iso_datetime(s),
            _ => None,
        };
        match parsed {
            Some(dt) => {
                split.plain.remove(key);
                split.dates.insert(key.clone(), dt);
            }
            None => {
                split.plain.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
    }

    if infer {
        let inferred: Vec<(String, DateTime<FixedOffset>)> = split
            .plain
            .iter()
            .filter_map(|(key, value)| {
                let dt = parse_iso_datetime(value.as_str()?)?;
                Some((key.clone(), dt))
            })
            .collect();
        for (key, dt) in inferred {
            split.plain.remove(&key);
            split.dates.insert(key, dt);
        }
    }

    split
}
