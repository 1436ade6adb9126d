//! 磁盘使用率

use std::path::{Path, PathBuf};
use sysinfo::Disks;

use super::ComponentStatus;

/// 使用率达到该值为警告（百分比）
pub const DISK_WARNING_PERCENT: f64 = 85.0;
/// 使用率达到该值为严重（百分比）
pub const DISK_CRITICAL_PERCENT: f64 = 95.0;

/// 按使用率判定状态
pub fn classify_usage(percent: f64) -> ComponentStatus {
    if percent >= DISK_CRITICAL_PERCENT {
        ComponentStatus::Critical
    } else if percent >= DISK_WARNING_PERCENT {
        ComponentStatus::Warning
    } else {
        ComponentStatus::Healthy
    }
}

/// 路径所在磁盘的使用率（百分比）
///
/// 以挂载点最长前缀匹配磁盘；找不到磁盘或容量为 0 时返回 None
pub fn disk_usage_percent(path: &Path) -> Option<f64> {
    let path: PathBuf = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();

    let disk = disks
        .list()
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())?;

    let total = disk.total_space();
    if total == 0 {
        return None;
    }
    let used = total.saturating_sub(disk.available_space());
    Some(used as f64 / total as f64 * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_usage_thresholds() {
        assert_eq!(classify_usage(0.0), ComponentStatus::Healthy);
        assert_eq!(classify_usage(84.9), ComponentStatus::Healthy);
        assert_eq!(classify_usage(85.0), ComponentStatus::Warning);
        assert_eq!(classify_usage(94.9), ComponentStatus::Warning);
        assert_eq!(classify_usage(95.0), ComponentStatus::Critical);
        assert_eq!(classify_usage(100.0), ComponentStatus::Critical);
    }

    #[test]
    fn test_disk_usage_in_range() {
        let dir = tempfile::tempdir().unwrap();
        if let Some(percent) = disk_usage_percent(dir.path()) {
            assert!((0.0..=100.0).contains(&percent));
        }
    }
}
