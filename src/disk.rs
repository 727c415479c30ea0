//! Disk usage watermarks for download backpressure.

use camino::Utf8Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use walkdir::WalkDir;

const BYTES_PER_GB: f64 = (1u64 << 30) as f64;

/// Recursive size of a directory in GB. Unreadable entries are skipped; the
/// value is a backpressure heuristic, not an accounting figure.
pub(crate) fn directory_size_gb(dir: &Utf8Path) -> f64 {
    let total: u64 = WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum();
    total as f64 / BYTES_PER_GB
}

/// Block while `dir` holds at least `high_gb` of data, resuming once it
/// drains to `low_gb`. Downstream converters shrink the directory by turning
/// raw instances into much smaller volumes.
pub(crate) fn wait_for_disk_low(dir: &Utf8Path, high_gb: f64, low_gb: f64, cancel: &AtomicBool) {
    let mut current = directory_size_gb(dir);
    while current >= high_gb && !cancel.load(Ordering::Relaxed) {
        tracing::warn!(
            current_gb = current,
            high_gb,
            "disk high watermark reached, pausing downloads"
        );
        std::thread::sleep(Duration::from_secs(5));
        current = directory_size_gb(dir);
        if current <= low_gb {
            tracing::info!(
                current_gb = current,
                low_gb,
                "disk usage below low watermark, resuming"
            );
            break;
        }
    }
}
