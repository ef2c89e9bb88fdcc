//! ID-range windowing over sorted message file names
//!
//! IDs start with the UTC second they were written in, so a time range maps
//! to a contiguous run of the sorted file list. Both ends are found with a
//! binary search; callers still confirm the exact time on the messages.

use crate::store::{file_stem, lower_bound, upper_bound};
use chrono::{DateTime, Utc};
use std::ops::Range;

/// Index range of `names` whose IDs fall within `[lower_bound(since), upper_bound(until)]`
pub fn window_range(
    names: &[String],
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
) -> Range<usize> {
    let start = match since {
        Some(since) => {
            let lower = lower_bound(since);
            names.partition_point(|n| file_stem(n) < lower.as_str())
        }
        None => 0,
    };
    let end = match until {
        Some(until) => {
            let upper = upper_bound(until);
            names.partition_point(|n| file_stem(n) <= upper.as_str())
        }
        None => names.len(),
    };
    start..end.max(start)
}

/// Index of the first name whose ID sorts strictly after `id`
pub fn position_after(names: &[String], id: &str) -> usize {
    names.partition_point(|n| file_stem(n) <= id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::id::format_id;
    use chrono::TimeZone;

    fn at(s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 18, 10, 0, s).unwrap()
    }

    fn names() -> Vec<String> {
        // Two messages per second for seconds 0..5
        (0..5)
            .flat_map(|s| (1..=2).map(move |q| format!("{}.json", format_id(at(s), q))))
            .collect()
    }

    #[test]
    fn test_window_matches_linear_filter() {
        let names = names();
        for since in 0..5 {
            for until in since..5 {
                let range = window_range(&names, Some(at(since)), Some(at(until)));
                let expected: Vec<usize> = (0..names.len())
                    .filter(|i| {
                        let second = (*i / 2) as u32;
                        second >= since && second <= until
                    })
                    .collect();
                assert_eq!(range.collect::<Vec<_>>(), expected, "{}..={}", since, until);
            }
        }
    }

    #[test]
    fn test_open_ended_windows() {
        let names = names();
        assert_eq!(window_range(&names, None, None), 0..10);
        assert_eq!(window_range(&names, Some(at(3)), None), 6..10);
        assert_eq!(window_range(&names, None, Some(at(0))), 0..2);
    }

    #[test]
    fn test_inverted_window_is_empty() {
        let names = names();
        assert!(window_range(&names, Some(at(4)), Some(at(1))).is_empty());
    }

    #[test]
    fn test_position_after() {
        let names = names();
        let third = file_stem(&names[2]).to_string();
        assert_eq!(position_after(&names, &third), 3);
        assert_eq!(position_after(&names, "0"), 0);
        assert_eq!(position_after(&names, "~"), names.len());
    }
}
