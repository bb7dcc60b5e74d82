use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sysinfo::{Disks, System};
use tracing::warn;

/// Memory counters in bytes, mirroring MemTotal and MemAvailable from
/// /proc/meminfo.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemInfo {
    pub mem_total: u64,
    pub mem_available: u64,
}

/// Cumulative CPU time per mode in jiffies, as reported by the aggregate
/// "cpu" line of /proc/stat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuStat {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

/// Root filesystem usage in bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskStats {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

/// 1/5/15-minute load averages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadAvg {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

/// A point-in-time snapshot of a worker host's resources, stamped with the
/// number of running tasks on that worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub mem_stats: MemInfo,
    pub cpu_stats: CpuStat,
    pub disk_stats: DiskStats,
    pub load_stats: LoadAvg,
    pub task_count: usize,
}

impl Stats {
    /// Memory in use, in bytes.
    pub fn mem_used(&self) -> u64 {
        self.mem_stats
            .mem_total
            .saturating_sub(self.mem_stats.mem_available)
    }
}

/// Collects a fresh snapshot from the host. Individual read failures are
/// logged and substituted with zero-valued structures; stats loss is never
/// fatal.
pub fn collect(sys: &mut System, task_count: usize) -> Stats {
    sys.refresh_memory();
    let mem_stats = MemInfo {
        mem_total: sys.total_memory(),
        mem_available: sys.available_memory(),
    };

    let load = System::load_average();
    let load_stats = LoadAvg {
        one: load.one,
        five: load.five,
        fifteen: load.fifteen,
    };

    Stats {
        mem_stats,
        cpu_stats: read_cpu_stat(),
        disk_stats: read_disk_stats(),
        load_stats,
        task_count,
    }
}

fn read_cpu_stat() -> CpuStat {
    match fs::read_to_string("/proc/stat") {
        Ok(contents) => parse_cpu_stat(&contents).unwrap_or_else(|| {
            warn!("no aggregate cpu line in /proc/stat");
            CpuStat::default()
        }),
        Err(err) => {
            warn!(error = %err, "failed to read /proc/stat");
            CpuStat::default()
        }
    }
}

/// Parses the aggregate "cpu" line. Jiffy columns beyond `steal` (guest
/// time) are ignored.
fn parse_cpu_stat(contents: &str) -> Option<CpuStat> {
    let line = contents
        .lines()
        .find(|line| line.starts_with("cpu ") || line.starts_with("cpu\t"))?;
    let mut fields = line
        .split_whitespace()
        .skip(1)
        .map(|field| field.parse::<u64>().unwrap_or(0));

    Some(CpuStat {
        user: fields.next()?,
        nice: fields.next()?,
        system: fields.next()?,
        idle: fields.next()?,
        iowait: fields.next().unwrap_or(0),
        irq: fields.next().unwrap_or(0),
        softirq: fields.next().unwrap_or(0),
        steal: fields.next().unwrap_or(0),
    })
}

fn read_disk_stats() -> DiskStats {
    let disks = Disks::new_with_refreshed_list();
    let root = disks
        .iter()
        .find(|disk| disk.mount_point() == Path::new("/"));
    match root {
        Some(disk) => {
            let total = disk.total_space();
            let free = disk.available_space();
            DiskStats {
                total,
                used: total.saturating_sub(free),
                free,
            }
        }
        None => {
            warn!("no disk mounted at /");
            DiskStats::default()
        }
    }
}
