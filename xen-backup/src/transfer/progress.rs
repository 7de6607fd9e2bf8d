//! Byte-level progress of a single disk transfer.
//!
//! The management task reports a coarse fraction; the tracker adds what the
//! HTTP stream has actually moved so progress lines show bytes and speed.

use std::time::{Duration, Instant};

/// Snapshot of a transfer at one poll.
#[derive(Debug, Clone, Default)]
pub struct TransferStats {
    /// Expected size, when known up front (uploads)
    pub total_bytes: Option<u64>,
    pub transferred_bytes: u64,
    /// Speed since the previous sample
    pub bytes_per_second: u64,
}

impl TransferStats {
    /// Percentage of `total_bytes` moved so far.
    pub fn percent(&self) -> Option<f64> {
        match self.total_bytes {
            Some(total) if total > 0 => Some(self.transferred_bytes as f64 / total as f64 * 100.0),
            _ => None,
        }
    }
}

/// Speed calculation across successive samples.
pub struct ProgressTracker {
    last_sample: Instant,
    last_bytes: u64,
    stats: TransferStats,
}

impl ProgressTracker {
    pub fn new(total_bytes: Option<u64>) -> Self {
        Self {
            last_sample: Instant::now(),
            last_bytes: 0,
            stats: TransferStats {
                total_bytes,
                ..Default::default()
            },
        }
    }

    /// Record the current byte count and recompute the speed.
    pub fn update(&mut self, transferred_bytes: u64) -> &TransferStats {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_sample).as_secs_f64();

        if elapsed > 0.0 {
            let delta = transferred_bytes.saturating_sub(self.last_bytes);
            self.stats.bytes_per_second = (delta as f64 / elapsed) as u64;
        }

        self.stats.transferred_bytes = transferred_bytes;
        self.last_sample = now;
        self.last_bytes = transferred_bytes;

        &self.stats
    }
}

/// Format bytes as a human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;

    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    format!("{:.2} {}", size, UNITS[unit])
}

pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

pub fn format_duration(duration: Duration) -> String {
    let seconds = duration.as_secs();
    if seconds < 60 {
        format!("{:.1}s", duration.as_secs_f64())
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

/// Task progress fraction (0.0-1.0) as a percentage.
pub fn format_fraction(fraction: f64) -> String {
    format!("{:.1}%", fraction.clamp(0.0, 1.0) * 100.0)
}
