//! Host capacity advisor.
//!
//! Before honoring a scale-up the auto-scaler asks the `ResourceManager`
//! whether the host has headroom. Readings come from a `HostProbe`:
//!
//! - CPU: two samples of `/proc/stat`, `cpu_sample_interval` apart
//! - Memory: `MemAvailable` / `MemTotal` from `/proc/meminfo`
//! - Disk: `libc::statvfs` on the configured path
//! - Load: 1-minute average from `libc::getloadavg`
//!
//! A reading the platform cannot provide is reported as 0, and a probe that
//! fails entirely never blocks scaling: the check is advisory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Delay between the two CPU samples.
const DEFAULT_CPU_SAMPLE_MS: u64 = 250;

/// Resource ceilings above which scale-up is suppressed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub max_cpu_percent: f64,
    pub max_memory_percent: f64,
    pub max_disk_percent: f64,
    pub max_load_average: f64,
    /// Filesystem checked for disk usage.
    pub disk_path: PathBuf,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_cpu_percent: 80.0,
            max_memory_percent: 85.0,
            max_disk_percent: 90.0,
            max_load_average: 4.0,
            disk_path: PathBuf::from("/"),
        }
    }
}

impl ResourceLimits {
    /// Checks that every ceiling is usable.
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("max_cpu_percent", self.max_cpu_percent),
            ("max_memory_percent", self.max_memory_percent),
            ("max_disk_percent", self.max_disk_percent),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                return Err(format!("resources.{} must be in (0, 100], got {}", name, value));
            }
        }
        if !(self.max_load_average > 0.0) {
            return Err(format!(
                "resources.max_load_average must be positive, got {}",
                self.max_load_average
            ));
        }
        Ok(())
    }
}

/// One reading of host utilization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub load_average: f64,
}

/// Result of comparing a reading against the ceilings.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceCheck {
    pub usage: ResourceUsage,
    /// One human-readable entry per exceeded ceiling.
    pub violations: Vec<String>,
}

impl ResourceCheck {
    pub fn allows_scale_up(&self) -> bool {
        self.violations.is_empty()
    }

    /// Violations joined into one reason string.
    pub fn reason(&self) -> String {
        self.violations.join(", ")
    }
}

/// Source of host utilization readings.
#[async_trait]
pub trait HostProbe: Send + Sync {
    async fn sample(&self) -> std::io::Result<ResourceUsage>;
}

/// Reads utilization of the local host.
#[derive(Debug, Clone)]
pub struct SystemProbe {
    disk_path: PathBuf,
    cpu_sample_interval: Duration,
}

impl SystemProbe {
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        Self {
            disk_path: disk_path.into(),
            cpu_sample_interval: Duration::from_millis(DEFAULT_CPU_SAMPLE_MS),
        }
    }

    pub fn with_cpu_sample_interval(mut self, interval: Duration) -> Self {
        self.cpu_sample_interval = interval;
        self
    }

    async fn cpu_percent(&self) -> Option<f64> {
        let first = read_cpu_times().await?;
        tokio::time::sleep(self.cpu_sample_interval).await;
        let second = read_cpu_times().await?;
        Some(second.busy_percent_since(&first))
    }

    async fn memory_percent(&self) -> Option<f64> {
        let meminfo = tokio::fs::read_to_string("/proc/meminfo").await.ok()?;
        parse_meminfo_usage(&meminfo)
    }
}

#[async_trait]
impl HostProbe for SystemProbe {
    async fn sample(&self) -> std::io::Result<ResourceUsage> {
        let disk_percent = match disk_usage_percent(&self.disk_path) {
            Ok(percent) => percent,
            Err(e) => {
                debug!(path = %self.disk_path.display(), error = %e, "Disk usage unavailable");
                0.0
            }
        };

        Ok(ResourceUsage {
            cpu_percent: self.cpu_percent().await.unwrap_or(0.0),
            memory_percent: self.memory_percent().await.unwrap_or(0.0),
            disk_percent,
            load_average: load_average_1m().unwrap_or(0.0),
        })
    }
}

/// Aggregate CPU jiffies from the first line of `/proc/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    idle: u64,
    total: u64,
}

impl CpuTimes {
    fn busy_percent_since(&self, earlier: &CpuTimes) -> f64 {
        let total = self.total.saturating_sub(earlier.total);
        if total == 0 {
            return 0.0;
        }
        let idle = self.idle.saturating_sub(earlier.idle).min(total);
        (total - idle) as f64 * 100.0 / total as f64
    }
}

async fn read_cpu_times() -> Option<CpuTimes> {
    let stat = tokio::fs::read_to_string("/proc/stat").await.ok()?;
    parse_cpu_times(&stat)
}

fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .map(|f| f.parse().ok())
        .collect::<Option<_>>()?;
    if fields.len() < 4 {
        return None;
    }
    // user nice system idle iowait irq softirq steal
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        idle,
        total: fields.iter().sum(),
    })
}

fn parse_meminfo_usage(meminfo: &str) -> Option<f64> {
    let field = |name: &str| -> Option<u64> {
        meminfo
            .lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total == 0 {
        return None;
    }
    Some(total.saturating_sub(available) as f64 * 100.0 / total as f64)
}

#[cfg(target_family = "unix")]
fn disk_usage_percent(path: &Path) -> std::io::Result<f64> {
    use std::os::unix::ffi::OsStrExt;

    let path_cstr = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    // SAFETY: statvfs is a plain C struct of integers; all-zero is valid.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: path_cstr is a valid NUL-terminated string and stat is a valid
    // out-pointer for the duration of the call.
    let result = unsafe { libc::statvfs(path_cstr.as_ptr(), &mut stat) };
    if result != 0 {
        return Err(std::io::Error::last_os_error());
    }

    let total = stat.f_blocks as u64 * stat.f_frsize as u64;
    let available = stat.f_bavail as u64 * stat.f_frsize as u64;
    if total == 0 {
        return Ok(0.0);
    }
    Ok(total.saturating_sub(available) as f64 * 100.0 / total as f64)
}

#[cfg(not(target_family = "unix"))]
fn disk_usage_percent(_path: &Path) -> std::io::Result<f64> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "disk usage is only available on Unix systems",
    ))
}

#[cfg(target_family = "unix")]
fn load_average_1m() -> Option<f64> {
    let mut loads = [0f64; 3];
    // SAFETY: loads has room for the 3 samples requested.
    let written = unsafe { libc::getloadavg(loads.as_mut_ptr(), 3) };
    (written >= 1).then_some(loads[0])
}

#[cfg(not(target_family = "unix"))]
fn load_average_1m() -> Option<f64> {
    None
}

/// Compares host readings against `ResourceLimits`.
pub struct ResourceManager {
    probe: Arc<dyn HostProbe>,
    limits: ResourceLimits,
}

impl ResourceManager {
    pub fn new(probe: Arc<dyn HostProbe>, limits: ResourceLimits) -> Self {
        Self { probe, limits }
    }

    /// Uses `SystemProbe` on `limits.disk_path`.
    pub fn system(limits: ResourceLimits) -> Self {
        let probe = Arc::new(SystemProbe::new(limits.disk_path.clone()));
        Self::new(probe, limits)
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Samples the host and lists every exceeded ceiling.
    ///
    /// A failed probe yields an empty check, which allows scaling.
    pub async fn check(&self) -> ResourceCheck {
        match self.probe.sample().await {
            Ok(usage) => self.evaluate(usage),
            Err(e) => {
                warn!(error = %e, "Resource probe failed, not limiting scale-up");
                ResourceCheck::default()
            }
        }
    }

    /// Compares one reading against the ceilings.
    pub fn evaluate(&self, usage: ResourceUsage) -> ResourceCheck {
        let limits = &self.limits;
        let mut violations = Vec::new();

        if usage.cpu_percent > limits.max_cpu_percent {
            violations.push(format!(
                "cpu {:.1}% > {:.1}%",
                usage.cpu_percent, limits.max_cpu_percent
            ));
        }
        if usage.memory_percent > limits.max_memory_percent {
            violations.push(format!(
                "memory {:.1}% > {:.1}%",
                usage.memory_percent, limits.max_memory_percent
            ));
        }
        if usage.disk_percent > limits.max_disk_percent {
            violations.push(format!(
                "disk {:.1}% > {:.1}%",
                usage.disk_percent, limits.max_disk_percent
            ));
        }
        if usage.load_average > limits.max_load_average {
            violations.push(format!(
                "load {:.2} > {:.2}",
                usage.load_average, limits.max_load_average
            ));
        }

        ResourceCheck { usage, violations }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe(std::io::Result<ResourceUsage>);

    #[async_trait]
    impl HostProbe for FixedProbe {
        async fn sample(&self) -> std::io::Result<ResourceUsage> {
            match &self.0 {
                Ok(usage) => Ok(*usage),
                Err(e) => Err(std::io::Error::new(e.kind(), e.to_string())),
            }
        }
    }

    fn manager(probe: FixedProbe) -> ResourceManager {
        ResourceManager::new(Arc::new(probe), ResourceLimits::default())
    }

    #[tokio::test]
    async fn test_headroom_allows_scale_up() {
        let usage = ResourceUsage {
            cpu_percent: 40.0,
            memory_percent: 50.0,
            disk_percent: 60.0,
            load_average: 1.0,
        };
        let check = manager(FixedProbe(Ok(usage))).check().await;
        assert!(check.allows_scale_up());
        assert_eq!(check.usage, usage);
    }

    #[tokio::test]
    async fn test_each_ceiling_is_reported() {
        let usage = ResourceUsage {
            cpu_percent: 95.0,
            memory_percent: 86.0,
            disk_percent: 90.0,
            load_average: 6.5,
        };
        let check = manager(FixedProbe(Ok(usage))).check().await;
        assert!(!check.allows_scale_up());
        assert_eq!(check.violations.len(), 3);
        assert!(check.reason().contains("cpu 95.0% > 80.0%"));
        assert!(check.reason().contains("load 6.50 > 4.00"));
    }

    #[tokio::test]
    async fn test_probe_failure_does_not_block() {
        let err = std::io::Error::new(std::io::ErrorKind::Other, "no procfs");
        let check = manager(FixedProbe(Err(err))).check().await;
        assert!(check.allows_scale_up());
    }

    #[test]
    fn test_parse_cpu_times() {
        let stat = "cpu  100 0 50 800 50 0 0 0 0 0\ncpu0 50 0 25 400 25 0 0 0 0 0\n";
        let times = parse_cpu_times(stat).unwrap();
        assert_eq!(times.idle, 850);
        assert_eq!(times.total, 1000);

        let later = CpuTimes {
            idle: 900,
            total: 1200,
        };
        assert!((later.busy_percent_since(&times) - 75.0).abs() < 1e-9);
        assert_eq!(times.busy_percent_since(&times), 0.0);
        assert!(parse_cpu_times("intr 1 2 3").is_none());
    }

    #[test]
    fn test_parse_meminfo_usage() {
        let meminfo = "MemTotal:       16000000 kB\nMemFree:         1000000 kB\nMemAvailable:    4000000 kB\n";
        let percent = parse_meminfo_usage(meminfo).unwrap();
        assert!((percent - 75.0).abs() < 1e-9);
        assert!(parse_meminfo_usage("MemTotal: 0 kB\nMemAvailable: 0 kB\n").is_none());
    }

    #[test]
    fn test_limits_validation() {
        assert!(ResourceLimits::default().validate().is_ok());
        let limits = ResourceLimits {
            max_memory_percent: 120.0,
            ..Default::default()
        };
        assert!(limits.validate().unwrap_err().contains("max_memory_percent"));
        let limits = ResourceLimits {
            max_load_average: 0.0,
            ..Default::default()
        };
        assert!(limits.validate().is_err());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_system_probe_reads_host() {
        let probe = SystemProbe::new("/").with_cpu_sample_interval(Duration::from_millis(10));
        let usage = probe.sample().await.unwrap();
        assert!((0.0..=100.0).contains(&usage.cpu_percent));
        assert!((0.0..=100.0).contains(&usage.disk_percent));
        assert!(usage.load_average >= 0.0);
    }
}
