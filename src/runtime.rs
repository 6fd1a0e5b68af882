//! Maximum-runtime estimation for BedJet V2.
//!
//! The V2 never reports how long the current mode may run, so it is looked up
//! from the temperature/fan table published for the device. BedJet 3 carries
//! the value in every notification and does not use this module.

use std::time::Duration;

/// `(temperature_threshold, [(fan_limit, hours), ...])`, thresholds ascending
const RUNTIME_TABLE: &[(f32, &[(u8, u64)])] = &[
    (33.5, &[(100, 12)]),
    (34.0, &[(70, 12), (100, 4)]),
    (34.5, &[(60, 12), (100, 4)]),
    (35.5, &[(50, 12), (100, 4)]),
    (36.5, &[(20, 12), (40, 6), (100, 4)]),
    (37.5, &[(30, 6), (50, 4), (100, 2)]),
    (38.5, &[(20, 6), (30, 4), (50, 2), (100, 1)]),
    (39.5, &[(20, 6), (30, 4), (40, 2), (100, 1)]),
    (f32::INFINITY, &[(20, 4), (40, 2), (100, 1)]),
];

const FALLBACK_HOURS: u64 = 1;

/// Maximum runtime for a temperature (Celsius) and fan percent
///
/// Picks the first row whose threshold is at or above `temperature`, then the
/// first fan limit at or above `fan_percent`. Anything outside the table runs
/// for one hour.
#[must_use]
pub fn calculate_maximum_runtime(temperature: f32, fan_percent: u8) -> Duration {
    let hours = RUNTIME_TABLE
        .iter()
        .find(|(threshold, _)| temperature <= *threshold)
        .and_then(|(_, rules)| rules.iter().find(|(limit, _)| fan_percent <= *limit))
        .map_or(FALLBACK_HOURS, |(_, hours)| *hours);

    Duration::from_secs(hours * 3600)
}

#[cfg(test)]
mod tests {
    use super::*;

    const fn hours(h: u64) -> Duration {
        Duration::from_secs(h * 3600)
    }

    #[test]
    fn test_threshold_row_selection() {
        assert_eq!(calculate_maximum_runtime(34.0, 70), hours(12));
        assert_eq!(calculate_maximum_runtime(34.0, 100), hours(4));
        assert_eq!(calculate_maximum_runtime(30.0, 100), hours(12));
        assert_eq!(calculate_maximum_runtime(37.0, 30), hours(6));
        assert_eq!(calculate_maximum_runtime(37.0, 35), hours(4));
    }

    #[test]
    fn test_infinite_bucket() {
        assert_eq!(calculate_maximum_runtime(50.0, 10), hours(4));
        assert_eq!(calculate_maximum_runtime(50.0, 40), hours(2));
        assert_eq!(calculate_maximum_runtime(50.0, 100), hours(1));
    }

    #[test]
    fn test_unmatched_fan_falls_back_to_one_hour() {
        assert_eq!(calculate_maximum_runtime(34.0, 101), hours(1));
        assert_eq!(calculate_maximum_runtime(f32::NAN, 50), hours(1));
    }
}
