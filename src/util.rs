//! Utility functions used by volley, and available when writing reporters.

use lazy_static::lazy_static;
use num_format::{Locale, ToFormattedString};
use regex::Regex;
use std::str::FromStr;

lazy_static! {
    static ref TIMESPAN: Regex =
        Regex::new(r"^((?P<hours>\d+?)h)?((?P<minutes>\d+?)m)?((?P<seconds>\d+?)s)?$")
            .expect("failed to compile timespan regex");
}

/// Parse a string representing a time span and return the number of seconds.
///
/// Can be specified as an integer, indicating seconds. Or can use integers
/// together with one or more of "h", "m", and "s", in that order, indicating
/// "hours", "minutes", and "seconds".
///
/// Valid formats include: 20, 20s, 3m, 2h, 1h20m, 3h30m10s, etc.
///
/// # Example
/// ```rust
/// use volley::util;
///
/// // 1 hour 2 minutes and 3 seconds is 3,723 seconds.
/// assert_eq!(util::parse_timespan("1h2m3s"), 3_723);
///
/// // 45 seconds is 45 seconds.
/// assert_eq!(util::parse_timespan("45"), 45);
///
/// // Invalid value is 0 seconds.
/// assert_eq!(util::parse_timespan("foo"), 0);
/// ```
pub fn parse_timespan(time_str: &str) -> usize {
    if let Ok(t) = usize::from_str(time_str) {
        trace!("{} is integer: {} seconds", time_str, t);
        return t;
    }

    let time_matches = match TIMESPAN.captures(time_str) {
        Some(captures) => captures,
        None => {
            trace!("{} is not a timespan", time_str);
            return 0;
        }
    };
    let component = |name: &str| {
        time_matches
            .name(name)
            .and_then(|m| usize::from_str(m.as_str()).ok())
            .unwrap_or(0)
    };
    let hours = component("hours");
    let minutes = component("minutes");
    let seconds = component("seconds");
    let total = match hours
        .checked_mul(60 * 60)
        .and_then(|h| minutes.checked_mul(60).and_then(|m| h.checked_add(m)))
        .and_then(|hm| hm.checked_add(seconds))
    {
        Some(total) => total,
        None => {
            trace!("{} overflows a timespan", time_str);
            return 0;
        }
    };
    trace!(
        "{} hours {} minutes {} seconds: {} seconds",
        hours,
        minutes,
        seconds,
        total
    );
    total
}

/// Integer percentage of `count` over `total`, rounded to the nearest whole percent.
///
/// Returns 0 when `total` is 0.
///
/// # Example
/// ```rust
/// use volley::util;
///
/// assert_eq!(util::percentage(3, 12), 25);
/// assert_eq!(util::percentage(2, 3), 67);
/// assert_eq!(util::percentage(0, 0), 0);
/// ```
pub fn percentage(count: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    (count as f64 * 100.0 / total as f64).round() as u8
}

/// Success and failure percentages of a pair of counters.
///
/// The failure share is the complement of the success share, so the pair always
/// adds up to 100 unless both counters are 0, in which case both are 0.
pub fn split_percentages(success_count: usize, failed_count: usize) -> (u8, u8) {
    let total = success_count + failed_count;
    if total == 0 {
        return (0, 0);
    }
    let success = percentage(success_count, total);
    (success, 100 - success)
}

/// Fold one value into a running arithmetic mean.
///
/// `count` is the number of values seen including this one.
pub fn mean_update(mean: f64, value: f64, count: usize) -> f64 {
    if count == 0 {
        return mean;
    }
    mean + (value - mean) / count as f64
}

/// Format large number in locale appropriate style.
pub fn format_number(number: usize) -> String {
    (number).to_formatted_string(&Locale::en)
}

/// Format seconds with a precision that keeps small values readable.
pub fn format_seconds(seconds: f64) -> String {
    if seconds < 1.0 {
        format!("{:.4}s", seconds)
    } else if seconds < 1000.0 {
        format!("{:.2}s", seconds)
    } else {
        format!("{}s", format_number(seconds.round() as usize))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn timespan() {
        assert_eq!(parse_timespan("0"), 0);
        assert_eq!(parse_timespan("foo"), 0);
        assert_eq!(parse_timespan("1"), 1);
        assert_eq!(parse_timespan("1s"), 1);
        assert_eq!(parse_timespan("1m"), 60);
        assert_eq!(parse_timespan("61"), 61);
        assert_eq!(parse_timespan("1m1s"), 61);
        assert_eq!(parse_timespan("10m"), 600);
        assert_eq!(parse_timespan("1h"), 3600);
        assert_eq!(parse_timespan("1h1m1s"), 3661);
        assert_eq!(parse_timespan("1h1s"), 3601);
        // Trailing garbage is not a timespan.
        assert_eq!(parse_timespan("1m30sfoo"), 0);
        // Too large to represent is invalid too.
        assert_eq!(parse_timespan("9999999999999999h"), 0);
        assert_eq!(parse_timespan("99999999999999999999m"), 0);
    }

    #[test]
    fn percentages() {
        assert_eq!(split_percentages(0, 0), (0, 0));
        assert_eq!(split_percentages(0, 1), (0, 100));
        assert_eq!(split_percentages(1, 0), (100, 0));
        assert_eq!(split_percentages(3, 9), (25, 75));
        // 12.5% rounds up, the failure share stays the complement.
        assert_eq!(split_percentages(1, 7), (13, 87));
        assert_eq!(percentage(1, 7), 14);
        assert_eq!(percentage(0, 0), 0);
    }

    #[test]
    fn running_mean() {
        let mut mean = 0.0;
        mean = mean_update(mean, 10.0, 1);
        assert!((mean - 10.0).abs() < f64::EPSILON);
        mean = mean_update(mean, 30.0, 2);
        assert!((mean - 20.0).abs() < f64::EPSILON);
        // A zero count leaves the mean alone.
        assert!((mean_update(mean, 100.0, 0) - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn formatting() {
        assert_eq!(format_number(1234567), "1,234,567");
        assert_eq!(format_seconds(0.25), "0.2500s");
        assert_eq!(format_seconds(20.0), "20.00s");
        assert_eq!(format_seconds(1500.4), "1,500s");
    }
}
