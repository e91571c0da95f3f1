//! Local resource probe
//!
//! Used by the panel for its own (local) node and by the agent to answer
//! metrics queries.

use sysinfo::{Disks, System};

use crate::error::PanelError;
use crate::types::ResourceSnapshot;

/// Take a blocking resource sample of this host.
///
/// Sleeps for `sysinfo::MINIMUM_CPU_UPDATE_INTERVAL` between the two CPU
/// refreshes; call from a blocking context.
pub fn sample() -> ResourceSnapshot {
    let mut sys = System::new();
    sys.refresh_cpu_usage();
    std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let ram_percent = percent(sys.used_memory(), sys.total_memory());

    ResourceSnapshot {
        cpu_percent: sys.global_cpu_usage(),
        ram_percent,
        disk_percent: root_disk_percent(),
        uptime_secs: System::uptime(),
    }
    .normalized()
}

/// `sample()` on the blocking pool
pub async fn sample_async() -> Result<ResourceSnapshot, PanelError> {
    tokio::task::spawn_blocking(sample)
        .await
        .map_err(|e| PanelError::Unreachable(format!("local probe failed: {}", e)))
}

/// Usage of the filesystem mounted at `/`, or of all disks combined when no
/// root mount is listed
fn root_disk_percent() -> f32 {
    let disks = Disks::new_with_refreshed_list();

    if let Some(root) = disks
        .list()
        .iter()
        .find(|d| d.mount_point() == std::path::Path::new("/"))
    {
        return percent(
            root.total_space().saturating_sub(root.available_space()),
            root.total_space(),
        );
    }

    let (used, total) = disks.list().iter().fold((0u64, 0u64), |(used, total), d| {
        (
            used + d.total_space().saturating_sub(d.available_space()),
            total + d.total_space(),
        )
    });
    percent(used, total)
}

pub(crate) fn percent(used: u64, total: u64) -> f32 {
    if total == 0 {
        0.0
    } else {
        (used as f64 / total as f64 * 100.0) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_handles_zero_total() {
        assert_eq!(percent(10, 0), 0.0);
        assert_eq!(percent(50, 200), 25.0);
    }

    #[tokio::test]
    async fn sample_is_within_bounds() {
        let snap = sample_async().await.unwrap();
        for v in [snap.cpu_percent, snap.ram_percent, snap.disk_percent] {
            assert!((0.0..=100.0).contains(&v));
        }
    }
}
