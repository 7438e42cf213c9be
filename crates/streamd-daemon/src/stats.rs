//! Node statistics from `/proc` and `statvfs`.
//!
//! Readers are split from parsers so the parsing can be tested on fixed
//! content. Missing or unreadable counters read as zero.

use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;
use tracing::debug;

const PROC_STAT: &str = "/proc/stat";
const PROC_LOADAVG: &str = "/proc/loadavg";
const PROC_MEMINFO: &str = "/proc/meminfo";
const PROC_UPTIME: &str = "/proc/uptime";
const PROC_NET_DEV: &str = "/proc/net/dev";

/// Current time in ms since the Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OnlineUsers {
    pub daemon: u64,
    pub http: u64,
    pub vods: u64,
    pub cods: u64,
}

/// Snapshot broadcast as `statistic_service`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerInfo {
    pub cpu: f64,
    pub gpu: f64,
    pub load_average: String,
    pub memory_total: u64,
    pub memory_free: u64,
    pub hdd_total: u64,
    pub hdd_free: u64,
    pub bandwidth_in: u64,
    pub bandwidth_out: u64,
    pub uptime: u64,
    pub timestamp: i64,
    pub online_users: OnlineUsers,
    pub total_bytes_in: u64,
    pub total_bytes_out: u64,
}

/// Activation reply: the snapshot plus how to reach this node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FullServiceInfo {
    #[serde(flatten)]
    pub server: ServerInfo,
    pub http_host: String,
    pub vods_host: String,
    pub cods_host: String,
    pub expiration_time: i64,
    pub project: String,
    pub version: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub busy: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetCounters {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Aggregate `cpu` line of `/proc/stat`.
#[must_use]
pub fn parse_cpu_times(content: &str) -> Option<CpuTimes> {
    let line = content.lines().find(|l| l.starts_with("cpu "))?;
    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|v| v.parse().ok())
        .collect();
    if values.len() < 4 {
        return None;
    }
    let total: u64 = values.iter().take(8).sum();
    // idle + iowait
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}

/// Busy percentage between two samples.
#[must_use]
// tick counts stay far below 2^52
#[allow(clippy::cast_precision_loss)]
pub fn cpu_percent(prev: CpuTimes, now: CpuTimes) -> f64 {
    let total = now.total.saturating_sub(prev.total);
    if total == 0 {
        return 0.0;
    }
    let busy = now.busy.saturating_sub(prev.busy);
    busy as f64 * 100.0 / total as f64
}

/// First three fields of `/proc/loadavg`, space separated.
#[must_use]
pub fn parse_loadavg(content: &str) -> String {
    content
        .split_whitespace()
        .take(3)
        .collect::<Vec<_>>()
        .join(" ")
}

/// `(total, available)` bytes from `/proc/meminfo`.
#[must_use]
pub fn parse_meminfo(content: &str) -> (u64, u64) {
    let field = |name: &str| {
        content
            .lines()
            .find_map(|l| l.strip_prefix(name))
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|kb| kb.parse::<u64>().ok())
            .map(|kb| kb * 1024)
    };
    let total = field("MemTotal:").unwrap_or(0);
    let free = field("MemAvailable:")
        .or_else(|| field("MemFree:"))
        .unwrap_or(0);
    (total, free)
}

/// Whole seconds from `/proc/uptime`.
#[must_use]
pub fn parse_uptime(content: &str) -> u64 {
    content
        .split_whitespace()
        .next()
        .and_then(|s| s.split('.').next())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

/// Byte counters summed over every interface except loopback.
#[must_use]
pub fn parse_net_dev(content: &str) -> NetCounters {
    let mut counters = NetCounters::default();
    for line in content.lines() {
        let Some((name, data)) = line.split_once(':') else {
            continue;
        };
        if name.trim() == "lo" {
            continue;
        }
        let fields: Vec<u64> = data
            .split_whitespace()
            .filter_map(|v| v.parse().ok())
            .collect();
        if fields.len() < 9 {
            continue;
        }
        counters.rx_bytes += fields[0];
        counters.tx_bytes += fields[8];
    }
    counters
}

fn read(path: &str) -> String {
    std::fs::read_to_string(path).unwrap_or_else(|e| {
        debug!("Cannot read {}: {}", path, e);
        String::new()
    })
}

/// `(total, free)` bytes of the filesystem holding `path`.
fn disk_usage(path: &Path) -> (u64, u64) {
    match nix::sys::statvfs::statvfs(path) {
        Ok(st) => {
            let block = u64::from(st.fragment_size());
            (
                u64::from(st.blocks()) * block,
                u64::from(st.blocks_available()) * block,
            )
        }
        Err(e) => {
            debug!("statvfs {} failed: {}", path.display(), e);
            (0, 0)
        }
    }
}

fn per_second(delta: u64, since: Instant) -> u64 {
    let elapsed_ms = since.elapsed().as_millis().max(1);
    u64::try_from(u128::from(delta) * 1000 / elapsed_ms).unwrap_or(u64::MAX)
}

/// Keeps the previous CPU and network counters to turn totals into rates.
#[derive(Debug)]
pub struct NodeStats {
    disk_path: PathBuf,
    prev_cpu: Option<CpuTimes>,
    prev_net: Option<(NetCounters, Instant)>,
}

impl Default for NodeStats {
    fn default() -> Self {
        Self::new(PathBuf::from("/"))
    }
}

impl NodeStats {
    #[must_use]
    pub fn new(disk_path: PathBuf) -> Self {
        Self {
            disk_path,
            prev_cpu: None,
            prev_net: None,
        }
    }

    /// Take a snapshot; rates cover the time since the previous call.
    pub fn sample(&mut self, online_users: OnlineUsers) -> ServerInfo {
        let cpu_now = parse_cpu_times(&read(PROC_STAT)).unwrap_or_default();
        let cpu = self
            .prev_cpu
            .map_or(0.0, |prev| cpu_percent(prev, cpu_now));
        self.prev_cpu = Some(cpu_now);

        let net_now = parse_net_dev(&read(PROC_NET_DEV));
        let (bandwidth_in, bandwidth_out) = match self.prev_net {
            Some((prev, at)) => (
                per_second(net_now.rx_bytes.saturating_sub(prev.rx_bytes), at),
                per_second(net_now.tx_bytes.saturating_sub(prev.tx_bytes), at),
            ),
            None => (0, 0),
        };
        self.prev_net = Some((net_now, Instant::now()));

        let (memory_total, memory_free) = parse_meminfo(&read(PROC_MEMINFO));
        let (hdd_total, hdd_free) = disk_usage(&self.disk_path);

        ServerInfo {
            cpu,
            gpu: 0.0,
            load_average: parse_loadavg(&read(PROC_LOADAVG)),
            memory_total,
            memory_free,
            hdd_total,
            hdd_free,
            bandwidth_in,
            bandwidth_out,
            uptime: parse_uptime(&read(PROC_UPTIME)),
            timestamp: now_ms(),
            online_users,
            total_bytes_in: net_now.rx_bytes,
            total_bytes_out: net_now.tx_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)] // exact values from integer inputs

    use super::*;

    const STAT: &str = "cpu  100 0 50 800 50 0 0 0 0 0\ncpu0 50 0 25 400 25 0 0 0 0 0\nintr 1\n";

    const NET_DEV: &str = "\
Inter-|   Receive                            |  Transmit
 face |bytes packets errs drop fifo frame compressed multicast|bytes packets errs drop fifo
    lo:  9999 10 0 0 0 0 0 0  9999 10 0 0 0 0 0 0
  eth0:  1000 10 0 0 0 0 0 0  2000 20 0 0 0 0 0 0
  eth1:   500  5 0 0 0 0 0 0   250  2 0 0 0 0 0 0
";

    #[test]
    fn test_parse_cpu_times() {
        let times = parse_cpu_times(STAT).unwrap();
        assert_eq!(times.total, 1000);
        assert_eq!(times.busy, 150);
        assert!(parse_cpu_times("intr 1\n").is_none());
    }

    #[test]
    fn test_cpu_percent() {
        let prev = CpuTimes {
            busy: 100,
            total: 1000,
        };
        let now = CpuTimes {
            busy: 150,
            total: 1100,
        };
        assert_eq!(cpu_percent(prev, now), 50.0);
        assert_eq!(cpu_percent(now, now), 0.0);
    }

    #[test]
    fn test_parse_loadavg() {
        assert_eq!(
            parse_loadavg("0.52 0.58 0.59 2/871 12345\n"),
            "0.52 0.58 0.59",
        );
        assert_eq!(parse_loadavg(""), "");
    }

    #[test]
    fn test_parse_meminfo() {
        let content = "MemTotal:       16000 kB\n\
                       MemFree:         1000 kB\n\
                       MemAvailable:    8000 kB\n";
        assert_eq!(parse_meminfo(content), (16000 * 1024, 8000 * 1024));

        let old_kernel = "MemTotal:       16000 kB\nMemFree:         1000 kB\n";
        assert_eq!(parse_meminfo(old_kernel), (16000 * 1024, 1000 * 1024));
    }

    #[test]
    fn test_parse_uptime() {
        assert_eq!(parse_uptime("350735.47 234388.90\n"), 350_735);
        assert_eq!(parse_uptime("garbage"), 0);
    }

    #[test]
    fn test_parse_net_dev_skips_loopback() {
        let counters = parse_net_dev(NET_DEV);
        assert_eq!(counters.rx_bytes, 1500);
        assert_eq!(counters.tx_bytes, 2250);
    }

    #[test]
    fn test_sample_carries_online_users() {
        let mut stats = NodeStats::default();
        let online = OnlineUsers {
            daemon: 2,
            http: 1,
            vods: 0,
            cods: 3,
        };
        let first = stats.sample(online);
        assert_eq!(first.online_users, online);
        assert_eq!(first.gpu, 0.0);
        assert_eq!(first.bandwidth_in, 0);
        assert!(first.timestamp > 0);
    }

    #[test]
    fn test_full_service_info_flattens_snapshot() {
        let mut stats = NodeStats::default();
        let info = FullServiceInfo {
            server: stats.sample(OnlineUsers::default()),
            http_host: "127.0.0.1:8000".to_string(),
            vods_host: "127.0.0.1:7000".to_string(),
            cods_host: "127.0.0.1:6001".to_string(),
            expiration_time: 42,
            project: "streamd".to_string(),
            version: "1.0".to_string(),
        };
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["expiration_time"], 42);
        assert!(value.get("load_average").is_some());
        assert!(value["online_users"].get("cods").is_some());
    }
}
