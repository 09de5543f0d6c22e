//! Formatting helpers for the run report

use std::time::Duration;

/// Format a duration in human-readable form
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use uperf::util::time::format_duration;
///
/// assert_eq!(format_duration(Duration::from_nanos(500)), "500ns");
/// assert_eq!(format_duration(Duration::from_micros(2500)), "2.50ms");
/// assert_eq!(format_duration(Duration::from_secs(5)), "5.00s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let nanos = duration.as_nanos();

    if nanos < 1_000 {
        format!("{}ns", nanos)
    } else if nanos < 1_000_000 {
        format!("{:.2}us", nanos as f64 / 1_000.0)
    } else if nanos < 1_000_000_000 {
        format!("{:.2}ms", nanos as f64 / 1_000_000.0)
    } else {
        format!("{:.2}s", nanos as f64 / 1_000_000_000.0)
    }
}

/// Format an operation rate
pub fn format_rate(rate: f64) -> String {
    if rate < 1_000.0 {
        format!("{:.0}", rate)
    } else if rate < 1_000_000.0 {
        format!("{:.2}K", rate / 1_000.0)
    } else if rate < 1_000_000_000.0 {
        format!("{:.2}M", rate / 1_000_000.0)
    } else {
        format!("{:.2}G", rate / 1_000_000_000.0)
    }
}

/// Events per second over `duration`, 0 for an empty interval
pub fn per_second(events: u64, duration: Duration) -> f64 {
    let seconds = duration.as_secs_f64();
    if seconds > 0.0 {
        events as f64 / seconds
    } else {
        0.0
    }
}

/// Format network throughput in bits per second, the unit network benchmarks report in
pub fn format_bitrate(bytes: u64, duration: Duration) -> String {
    let bits = per_second(bytes, duration) * 8.0;
    if bits >= 1e9 {
        format!("{:.2}Gb/s", bits / 1e9)
    } else if bits >= 1e6 {
        format!("{:.2}Mb/s", bits / 1e6)
    } else if bits >= 1e3 {
        format!("{:.2}Kb/s", bits / 1e3)
    } else {
        format!("{:.2}b/s", bits)
    }
}

/// Format a byte count with binary units
pub fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    let b = bytes as f64;
    if b >= GB {
        format!("{:.2}GB", b / GB)
    } else if b >= MB {
        format!("{:.2}MB", b / MB)
    } else if b >= KB {
        format!("{:.2}KB", b / KB)
    } else {
        format!("{}B", bytes)
    }
}

/// Relative difference of `other` against `base` in percent
pub fn percent_diff(base: u64, other: u64) -> f64 {
    if base == 0 {
        return if other == 0 { 0.0 } else { 100.0 };
    }
    (other as f64 - base as f64) * 100.0 / base as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_nanos(500)), "500ns");
        assert_eq!(format_duration(Duration::from_nanos(1500)), "1.50us");
        assert_eq!(format_duration(Duration::from_micros(1500)), "1.50ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
    }

    #[test]
    fn test_format_rate() {
        assert_eq!(format_rate(500.0), "500");
        assert_eq!(format_rate(1500.0), "1.50K");
        assert_eq!(format_rate(1_500_000.0), "1.50M");
    }

    #[test]
    fn test_format_bitrate() {
        assert_eq!(format_bitrate(125_000_000, Duration::from_secs(1)), "1.00Gb/s");
        assert_eq!(format_bitrate(1_250, Duration::from_secs(1)), "10.00Kb/s");
        assert_eq!(format_bitrate(1_000, Duration::ZERO), "0.00b/s");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(1536), "1.50KB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00GB");
    }

    #[test]
    fn test_percent_diff() {
        assert_eq!(percent_diff(100, 110), 10.0);
        assert_eq!(percent_diff(100, 90), -10.0);
        assert_eq!(percent_diff(0, 0), 0.0);
    }
}
