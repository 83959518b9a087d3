use std::collections::HashMap;

use serde::Serialize;

use crate::event::nested_str;
use crate::store::StoredEvent;

const UNKNOWN: &str = "Unknown";

/// One row of a tally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NameValue {
    pub name: String,
    pub value: u64,
}

/// Browser and country breakdown of a window of events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Demographics {
    pub browsers: Vec<NameValue>,
    pub countries: Vec<NameValue>,
}

/// Tallies `device.browser` and `geo.country` across all events.
pub fn tally(events: &[StoredEvent]) -> Demographics {
    let mut browsers: HashMap<&str, u64> = HashMap::new();
    let mut countries: HashMap<&str, u64> = HashMap::new();

    for event in events {
        let browser = nested_str(&event.payload, "device", "browser")
            .filter(|b| !b.is_empty())
            .unwrap_or(UNKNOWN);
        *browsers.entry(browser).or_default() += 1;

        let country = nested_str(&event.payload, "geo", "country")
            .filter(|c| !c.is_empty())
            .unwrap_or(UNKNOWN);
        *countries.entry(country).or_default() += 1;
    }

    Demographics {
        browsers: ranked(browsers),
        countries: ranked(countries),
    }
}

/// Count descending, then name ascending.
fn ranked(counts: HashMap<&str, u64>) -> Vec<NameValue> {
    let mut rows: Vec<NameValue> = counts
        .into_iter()
        .map(|(name, value)| NameValue {
            name: name.to_string(),
            value,
        })
        .collect();
    rows.sort_by(|a, b| b.value.cmp(&a.value).then_with(|| a.name.cmp(&b.name)));
    rows
}
