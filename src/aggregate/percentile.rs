use std::fmt;

use serde::Serialize;

/// Web vital names reported on the dashboard, in display order.
pub const KNOWN_VITALS: [&str; 4] = ["LCP", "CLS", "INP", "TTFB"];

/// Quality rating for a vital value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Rating {
    Good,
    NeedsImprovement,
    Poor,
}

impl Rating {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::NeedsImprovement => "needs-improvement",
            Self::Poor => "poor",
        }
    }
}

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(good upper bound, needs-improvement upper bound)`, both inclusive.
fn thresholds(name: &str) -> Option<(f64, f64)> {
    match name {
        "LCP" => Some((2500.0, 4000.0)),
        "CLS" => Some((0.1, 0.25)),
        "INP" => Some((200.0, 500.0)),
        "TTFB" => Some((800.0, 1800.0)),
        _ => None,
    }
}

/// Rates a vital value. Unknown vital names are always good.
pub fn rate(name: &str, value: f64) -> Rating {
    match thresholds(name) {
        Some((good, _)) if value <= good => Rating::Good,
        Some((_, fair)) if value <= fair => Rating::NeedsImprovement,
        Some(_) => Rating::Poor,
        None => Rating::Good,
    }
}

/// 75th percentile using the `floor(n * 0.75)` index of the sorted values.
///
/// Sorts `values` in place. Returns `None` when empty.
pub fn p75(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let idx = (values.len() * 3 / 4).min(values.len() - 1);
    Some(values[idx])
}

/// Rounds to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_p75_picks_floor_index() {
        assert_eq!(p75(&mut [400.0, 100.0, 300.0, 200.0]), Some(400.0));
        assert_eq!(p75(&mut [5.0]), Some(5.0));
        assert_eq!(p75(&mut [1.0, 2.0, 3.0]), Some(3.0));
        assert_eq!(p75(&mut [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]), Some(7.0));
        assert_eq!(p75(&mut []), None);
    }

    #[test]
    fn test_lcp_boundaries() {
        assert_eq!(rate("LCP", 2500.0), Rating::Good);
        assert_eq!(rate("LCP", 2501.0), Rating::NeedsImprovement);
        assert_eq!(rate("LCP", 4000.0), Rating::NeedsImprovement);
        assert_eq!(rate("LCP", 4001.0), Rating::Poor);
    }

    #[test]
    fn test_other_thresholds() {
        assert_eq!(rate("CLS", 0.1), Rating::Good);
        assert_eq!(rate("CLS", 0.2), Rating::NeedsImprovement);
        assert_eq!(rate("CLS", 0.26), Rating::Poor);
        assert_eq!(rate("INP", 501.0), Rating::Poor);
        assert_eq!(rate("TTFB", 800.0), Rating::Good);
        assert_eq!(rate("TTFB", 1801.0), Rating::Poor);
        assert_eq!(rate("FID", 1e9), Rating::Good);
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(0.123456), 0.12);
        assert_eq!(round2(1234.567), 1234.57);
        assert_eq!(round2(7.0), 7.0);
    }

    #[test]
    fn test_rating_serializes_kebab_case() {
        let v = serde_json::to_value(Rating::NeedsImprovement).expect("serialize");
        assert_eq!(v, "needs-improvement");
    }
}
