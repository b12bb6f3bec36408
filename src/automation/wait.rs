//! Bounded waits: polling with deadlines, window attach retries, capture file checks.

use anyhow::{anyhow, Result};
use std::path::Path;
use std::time::{Duration, Instant};

use super::{Desktop, WindowInfo};

/// Polls `check` every `interval` until it yields a value or `timeout` elapses.
///
/// `check` runs at least once, and once more at the deadline.
pub fn poll_until<T>(
    desktop: &dyn Desktop,
    timeout: Duration,
    interval: Duration,
    mut check: impl FnMut() -> Result<Option<T>>,
) -> Result<Option<T>> {
    let start = Instant::now();
    loop {
        if let Some(value) = check()? {
            return Ok(Some(value));
        }
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Ok(None);
        }
        desktop.sleep(interval.min(timeout - elapsed));
    }
}

/// Looks for a window titled `fragment`, retrying `attempts` times with `delay` between tries.
pub fn wait_for_window(
    desktop: &dyn Desktop,
    fragment: &str,
    attempts: u32,
    delay: Duration,
) -> Result<WindowInfo> {
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        if let Some(window) = desktop.find_window(fragment)? {
            tracing::debug!("Attached to \"{}\" on attempt {}", window.title, attempt);
            return Ok(window);
        }
        if attempt < attempts {
            tracing::warn!(
                "Window \"{}\" not found (attempt {}/{}), retrying in {}s",
                fragment,
                attempt,
                attempts,
                delay.as_secs_f32()
            );
            desktop.sleep(delay);
        }
    }
    Err(anyhow!(
        "Window \"{}\" not found after {} attempts",
        fragment,
        attempts
    ))
}

/// A capture file is valid when it exists and holds at least `min_kb` KiB.
pub fn capture_is_valid(path: &Path, min_kb: u64) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.len() >= min_kb.saturating_mul(1024),
        Err(_) => false,
    }
}

/// Waits for RenderDoc to finish writing a valid capture to `path`.
pub fn wait_for_capture(
    desktop: &dyn Desktop,
    path: &Path,
    min_kb: u64,
    timeout: Duration,
) -> Result<bool> {
    let found = poll_until(desktop, timeout, Duration::from_millis(500), || {
        Ok(capture_is_valid(path, min_kb).then_some(()))
    })?;
    Ok(found.is_some())
}
