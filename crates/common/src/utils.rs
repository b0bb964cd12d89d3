//! Utility functions for LoRA Flow
//!
//! This module provides utility functions used throughout the pipeline crates.

use std::future::Future;
use std::time::{Duration, Instant};

/// Formats a byte size into a human-readable string
///
/// # Examples
///
/// ```
/// use common::utils::format_bytes;
///
/// assert_eq!(format_bytes(1024), "1.0 KiB");
/// assert_eq!(format_bytes(1048576), "1.0 MiB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let bytes_f64 = bytes as f64;
    let base = 1024_f64;
    let exponent = (bytes_f64.ln() / base.ln()).floor() as usize;
    let exponent = exponent.min(UNITS.len() - 1);

    let value = bytes_f64 / base.powi(exponent as i32);
    format!("{:.1} {}", value, UNITS[exponent])
}

/// Formats a duration into a human-readable string
///
/// # Examples
///
/// ```
/// use common::utils::format_duration;
/// use std::time::Duration;
///
/// assert_eq!(format_duration(Duration::from_secs(65)), "1m 5s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();

    if total_secs == 0 {
        let millis = duration.subsec_millis();
        if millis == 0 {
            let micros = duration.subsec_micros();
            return format!("{}µs", micros);
        }
        return format!("{}ms", millis);
    }

    let days = total_secs / (24 * 60 * 60);
    let hours = (total_secs % (24 * 60 * 60)) / (60 * 60);
    let minutes = (total_secs % (60 * 60)) / 60;
    let seconds = total_secs % 60;

    let mut result = String::new();

    if days > 0 {
        result.push_str(&format!("{}d ", days));
    }

    if hours > 0 || !result.is_empty() {
        result.push_str(&format!("{}h ", hours));
    }

    if minutes > 0 || !result.is_empty() {
        result.push_str(&format!("{}m ", minutes));
    }

    result.push_str(&format!("{}s", seconds));

    result
}

/// Measures the execution time of an async operation
///
/// The elapsed time is returned even when the operation fails, so callers
/// can log how long a failing stage ran.
pub async fn measure_execution_time_async<T, F>(future: F) -> (T, Duration)
where
    F: Future<Output = T>,
{
    let start = Instant::now();
    let result = future.await;
    (result, start.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512.0 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(13 * 1024 * 1024 * 1024), "13.0 GiB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_micros(40)), "40µs");
        assert_eq!(format_duration(Duration::from_secs(3 * 3600 + 5)), "3h 0m 5s");
        assert_eq!(format_duration(Duration::from_secs(90_000)), "1d 1h 0m 0s");
    }

    #[tokio::test]
    async fn test_measure_execution_time_async() {
        let (value, elapsed) = measure_execution_time_async(async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            42
        })
        .await;

        assert_eq!(value, 42);
        assert!(elapsed >= Duration::from_millis(5));
    }
}
