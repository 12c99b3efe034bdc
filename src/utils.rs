// framesmith - Video to still image dataset pipeline.
// Copyright 2025 0verv0ltage
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! General utility functions.

use std::time;

use chrono::TimeDelta;

/// Format a run time for log lines: sub-second values in µs or ms,
/// short runs in seconds, long runs as `hh:mm:ss` with a day prefix
/// once a batch passes 24 hours.
pub fn format_duration(duration: time::Duration) -> String {
    let Ok(elapsed) = TimeDelta::from_std(duration) else {
        return "Duration too large".to_string();
    };
    if elapsed < TimeDelta::milliseconds(1) {
        return format!("{} µs", elapsed.num_microseconds().unwrap_or(0));
    }
    if elapsed < TimeDelta::seconds(1) {
        return format!("{} ms", elapsed.num_milliseconds());
    }
    if elapsed < TimeDelta::minutes(1) {
        return format!("{} s", elapsed.num_seconds());
    }
    let clock = format!(
        "{:02}:{:02}:{:02}",
        elapsed.num_hours() % 24,
        elapsed.num_minutes() % 60,
        elapsed.num_seconds() % 60
    );
    match elapsed.num_days() {
        0 => clock,
        days => format!("{days}d {clock}"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn formats_by_magnitude() {
        assert_eq!(format_duration(Duration::from_micros(250)), "250 µs");
        assert_eq!(format_duration(Duration::from_millis(42)), "42 ms");
        assert_eq!(format_duration(Duration::from_secs(12)), "12 s");
        assert_eq!(format_duration(Duration::from_secs(3 * 3600 + 61)), "03:01:01");
        assert_eq!(format_duration(Duration::from_secs(26 * 3600 + 5)), "1d 02:00:05");
    }
}
