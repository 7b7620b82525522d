//! Best-effort peak-memory accounting from cgroup files.

use std::fs;
use std::path::Path;

/// Candidate accounting files, most specific first. The v1 path is kept for
/// hosts that have not migrated to the unified hierarchy.
const PEAK_PATHS: [&str; 2] = [
    "/sys/fs/cgroup/memory.peak",
    "/sys/fs/cgroup/memory/memory.max_usage_in_bytes",
];

/// Read the peak resident set in KiB, or 0 when no accounting file is
/// readable. Accounting failures never fail a job.
pub fn read_memory_peak_kb() -> u64 {
    read_peak_kb_from(&PEAK_PATHS)
}

fn read_peak_kb_from<P: AsRef<Path>>(paths: &[P]) -> u64 {
    for path in paths {
        let Ok(raw) = fs::read_to_string(path) else {
            continue;
        };
        let value = raw.trim();
        if value.is_empty() || value == "max" {
            continue;
        }
        if let Ok(bytes) = value.parse::<u64>() {
            return bytes / 1024;
        }
    }
    0
}
