use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use blake3::Hash;

const SHUTDOWN_POLL_MS: u64 = 100;

pub(crate) fn blake3_hash(bytes: &[u8]) -> Hash {
    blake3::hash(bytes)
}

pub(crate) fn env_optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

pub(crate) fn jitter_ratio() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1000) as f64 / 1000.0
}

/// Exponential delay for the `attempt`-th consecutive failure (1-based),
/// capped at `max` and stretched by up to 20% jitter.
pub(crate) fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16) as i32;
    let delay = (base.as_secs_f64() * 2.0_f64.powi(exponent)).min(max.as_secs_f64());
    let jitter = jitter_ratio() * 0.2;
    Duration::from_secs_f64(delay * (1.0 + jitter))
}

/// Sleeps for `total`, waking early once `shutdown` is set. Returns true when
/// the full duration elapsed.
pub(crate) fn sleep_unless_shutdown(total: Duration, shutdown: &AtomicBool) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        let step = (deadline - now).min(Duration::from_millis(SHUTDOWN_POLL_MS));
        thread::sleep(step);
    }
}

pub(crate) fn format_timestamp(ts: i64) -> String {
    match chrono::DateTime::from_timestamp(ts, 0) {
        Some(dt) if ts > 0 => dt.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        _ => "-".to_string(),
    }
}

pub(crate) fn preview(text: &str, max_chars: usize) -> String {
    let single_line = text.replace('\n', " ");
    if single_line.chars().count() <= max_chars {
        return single_line;
    }
    let cut: String = single_line.chars().take(max_chars).collect();
    format!("{cut}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let base = Duration::from_secs(2);
        let max = Duration::from_secs(30);
        let first = backoff_delay(1, base, max);
        let third = backoff_delay(3, base, max);
        let tenth = backoff_delay(10, base, max);
        assert!(first >= base && first <= Duration::from_secs_f64(2.4));
        assert!(third >= Duration::from_secs(8) && third <= Duration::from_secs_f64(9.6));
        assert!(tenth >= max && tenth <= Duration::from_secs(36));
    }

    #[test]
    fn sleep_returns_early_on_shutdown() {
        let flag = AtomicBool::new(true);
        let started = Instant::now();
        assert!(!sleep_unless_shutdown(Duration::from_secs(5), &flag));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn timestamp_formatting() {
        assert_eq!(format_timestamp(0), "-");
        assert_eq!(format_timestamp(86_400), "1970-01-02 00:00:00 UTC");
    }

    #[test]
    fn preview_truncates_on_char_boundary() {
        assert_eq!(preview("short", 10), "short");
        assert_eq!(preview("привіт світ", 6), "привіт...");
        assert_eq!(preview("a\nb", 10), "a b");
    }
}
