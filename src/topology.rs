//! CPU topology snapshot.
//!
//! Built once at startup from sysfs and shared read-only with every
//! consumer. The CPU-usage and perf-counter collectors resolve hardware
//! thread ids to {thread, core, socket, numa} through this; the benchmark
//! runner sizes its working sets from the cache totals.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::error::CollectError;

const MODULE: &str = "Topology";

/// Position of one hardware thread in the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwThread {
    /// Linux CPU number.
    pub id: u16,
    /// Thread index within its core (0 on the first sibling).
    pub thread: u16,
    pub core: u16,
    pub socket: u8,
    pub numa: u8,
}

#[derive(Debug, Clone, Default)]
pub struct CpuTopology {
    pub smt: bool,
    pub threads_per_core: u32,
    pub cores_per_socket: u32,
    pub sockets: u32,
    // per instance, bytes
    pub l1_cache: u64,
    pub l2_cache: u64,
    pub l3_cache: u64,
    // summed across instances of one socket, bytes
    pub l1_cache_per_socket: u64,
    pub l2_cache_per_socket: u64,
    pub l3_cache_per_socket: u64,
    pub cache_per_socket: u64,
    // summed across all sockets, bytes
    pub l1_cache_total: u64,
    pub l2_cache_total: u64,
    pub l3_cache_total: u64,
    pub cache_total: u64,
    /// Hardware threads keyed by Linux CPU number.
    pub hw_threads: BTreeMap<u16, HwThread>,
}

impl CpuTopology {
    /// Snapshot the topology of this node.
    pub fn detect() -> Result<Self, CollectError> {
        Self::detect_from("/sys/devices/system/cpu", "/sys/devices/system/node")
    }

    /// Total hardware thread count.
    pub fn thread_count(&self) -> usize {
        self.hw_threads.len()
    }

    /// CPU numbers in ascending order, the canonical reporting order for
    /// topology-tagged measurements.
    pub fn cpu_ids(&self) -> Vec<u16> {
        self.hw_threads.keys().copied().collect()
    }

    fn detect_from(cpu_root: impl AsRef<Path>, node_root: impl AsRef<Path>) -> Result<Self, CollectError> {
        let cpu_root = cpu_root.as_ref();
        let numa_of = numa_mapping(node_root.as_ref());

        let mut hw_threads = BTreeMap::new();
        let mut threads_per_core: u32 = 1;

        for cpu in cpu_dirs(cpu_root)? {
            let id = cpu.id;
            let core = read_sysfs_u64(&cpu.path.join("topology/core_id"))? as u16;
            let socket = read_sysfs_u64(&cpu.path.join("topology/physical_package_id"))? as u8;

            let siblings =
                parse_cpu_list(&read_sysfs(&cpu.path.join("topology/thread_siblings_list"))?);
            threads_per_core = threads_per_core.max(siblings.len() as u32);
            let thread = siblings.iter().position(|&s| s == id).unwrap_or(0) as u16;

            let numa = numa_of.get(&id).copied().unwrap_or(0);
            hw_threads.insert(
                id,
                HwThread {
                    id,
                    thread,
                    core,
                    socket,
                    numa,
                },
            );
        }

        if hw_threads.is_empty() {
            // Degenerate sysfs (stripped-down containers): fall back to a
            // flat single-socket layout so the engine still runs.
            warn!(
                target: MODULE,
                "no per-cpu topology under {} - assuming flat layout", cpu_root.display()
            );
            for id in 0..num_cpus::get() as u16 {
                hw_threads.insert(
                    id,
                    HwThread {
                        id,
                        thread: 0,
                        core: id,
                        socket: 0,
                        numa: 0,
                    },
                );
            }
        }

        let sockets = hw_threads
            .values()
            .map(|t| t.socket)
            .collect::<std::collections::BTreeSet<_>>()
            .len()
            .max(1) as u32;
        let total_cores = hw_threads
            .values()
            .map(|t| (t.socket, t.core))
            .collect::<std::collections::BTreeSet<_>>()
            .len()
            .max(1) as u32;
        let cores_per_socket = total_cores / sockets;

        let mut topo = CpuTopology {
            smt: threads_per_core != 1,
            threads_per_core,
            cores_per_socket,
            sockets,
            hw_threads,
            ..CpuTopology::default()
        };

        topo.read_caches(cpu_root);

        debug!(
            target: MODULE,
            "{} socket(s), {} core(s)/socket, {} thread(s)/core, smt={}",
            topo.sockets, topo.cores_per_socket, topo.threads_per_core, topo.smt
        );

        Ok(topo)
    }

    fn read_caches(&mut self, cpu_root: &Path) {
        let cache_dir = cpu_root.join("cpu0/cache");
        let Ok(entries) = fs::read_dir(&cache_dir) else {
            warn!(target: MODULE, "no cache information under {}", cache_dir.display());
            return;
        };

        let threads_per_socket = (self.cores_per_socket * self.threads_per_core).max(1) as u64;

        for entry in entries.flatten() {
            let path = entry.path();
            if !path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("index"))
            {
                continue;
            }

            let Ok(kind) = read_sysfs(&path.join("type")) else { continue };
            if kind.trim() == "Instruction" {
                continue;
            }

            let Ok(level) = read_sysfs_u64(&path.join("level")) else { continue };
            let Some(size) = read_sysfs(&path.join("size"))
                .ok()
                .and_then(|s| parse_cache_size(s.trim()))
            else {
                continue;
            };

            // instances per socket = threads per socket / threads sharing one instance
            let shared = read_sysfs(&path.join("shared_cpu_list"))
                .map(|s| parse_cpu_list(&s).len().max(1) as u64)
                .unwrap_or(1);
            let per_socket = size * (threads_per_socket / shared).max(1);

            match level {
                1 => {
                    self.l1_cache = size;
                    self.l1_cache_per_socket = per_socket;
                    self.l1_cache_total = per_socket * self.sockets as u64;
                }
                2 => {
                    self.l2_cache = size;
                    self.l2_cache_per_socket = per_socket;
                    self.l2_cache_total = per_socket * self.sockets as u64;
                }
                3 => {
                    self.l3_cache = size;
                    self.l3_cache_per_socket = per_socket;
                    self.l3_cache_total = per_socket * self.sockets as u64;
                }
                _ => continue,
            }
        }

        self.cache_per_socket =
            self.l1_cache_per_socket + self.l2_cache_per_socket + self.l3_cache_per_socket;
        self.cache_total = self.cache_per_socket * self.sockets as u64;
    }
}

struct CpuDir {
    id: u16,
    path: PathBuf,
}

fn cpu_dirs(root: &Path) -> Result<Vec<CpuDir>, CollectError> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(rest) = name.strip_prefix("cpu") else { continue };
        let Ok(id) = rest.parse::<u16>() else { continue };
        if entry.path().join("topology").is_dir() {
            dirs.push(CpuDir {
                id,
                path: entry.path(),
            });
        }
    }
    dirs.sort_by_key(|d| d.id);
    Ok(dirs)
}

fn numa_mapping(node_root: &Path) -> BTreeMap<u16, u8> {
    let mut mapping = BTreeMap::new();
    let Ok(entries) = fs::read_dir(node_root) else {
        return mapping;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(rest) = name.strip_prefix("node") else { continue };
        let Ok(node) = rest.parse::<u8>() else { continue };
        if let Ok(list) = read_sysfs(&entry.path().join("cpulist")) {
            for cpu in parse_cpu_list(&list) {
                mapping.insert(cpu, node);
            }
        }
    }
    mapping
}

fn read_sysfs(path: &Path) -> Result<String, CollectError> {
    Ok(fs::read_to_string(path)?)
}

fn read_sysfs_u64(path: &Path) -> Result<u64, CollectError> {
    let raw = read_sysfs(path)?;
    raw.trim()
        .parse()
        .map_err(|_| CollectError::Parse(format!("{}: `{}`", path.display(), raw.trim())))
}

/// Parse a sysfs cpulist like `0-3,8,10-11`.
pub fn parse_cpu_list(list: &str) -> Vec<u16> {
    let mut cpus = Vec::new();
    for part in list.trim().split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((lo, hi)) = part.split_once('-') {
            if let (Ok(lo), Ok(hi)) = (lo.parse::<u16>(), hi.parse::<u16>()) {
                cpus.extend(lo..=hi);
            }
        } else if let Ok(cpu) = part.parse::<u16>() {
            cpus.push(cpu);
        }
    }
    cpus
}

/// Parse a sysfs cache size like `32K` or `16M` into bytes.
pub fn parse_cache_size(size: &str) -> Option<u64> {
    let size = size.trim();
    if let Some(kb) = size.strip_suffix(['K', 'k']) {
        return kb.parse::<u64>().ok().map(|v| v * 1024);
    }
    if let Some(mb) = size.strip_suffix(['M', 'm']) {
        return mb.parse::<u64>().ok().map(|v| v * 1024 * 1024);
    }
    size.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn parses_cpu_lists() {
        assert_eq!(parse_cpu_list("0-3,8,10-11"), vec![0, 1, 2, 3, 8, 10, 11]);
        assert_eq!(parse_cpu_list("5\n"), vec![5]);
        assert_eq!(parse_cpu_list(""), Vec::<u16>::new());
    }

    #[test]
    fn parses_cache_sizes() {
        assert_eq!(parse_cache_size("32K"), Some(32 * 1024));
        assert_eq!(parse_cache_size("16M"), Some(16 * 1024 * 1024));
        assert_eq!(parse_cache_size("512"), Some(512));
        assert_eq!(parse_cache_size("large"), None);
    }

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn builds_topology_from_fake_sysfs() {
        let dir = tempfile::tempdir().unwrap();
        let cpu_root = dir.path().join("cpu");
        let node_root = dir.path().join("node");

        // two cores, two threads each, one socket; cpu0+cpu2 on core 0
        for (id, core, siblings) in [(0, 0, "0,2"), (1, 1, "1,3"), (2, 0, "0,2"), (3, 1, "1,3")] {
            let base = cpu_root.join(format!("cpu{id}/topology"));
            write(&base.join("core_id"), &format!("{core}\n"));
            write(&base.join("physical_package_id"), "0\n");
            write(&base.join("thread_siblings_list"), siblings);
        }
        write(&node_root.join("node0/cpulist"), "0-3\n");

        let cache = cpu_root.join("cpu0/cache");
        write(&cache.join("index0/type"), "Data\n");
        write(&cache.join("index0/level"), "1\n");
        write(&cache.join("index0/size"), "32K\n");
        write(&cache.join("index0/shared_cpu_list"), "0,2\n");
        write(&cache.join("index1/type"), "Instruction\n");
        write(&cache.join("index1/level"), "1\n");
        write(&cache.join("index1/size"), "32K\n");
        write(&cache.join("index1/shared_cpu_list"), "0,2\n");
        write(&cache.join("index2/type"), "Unified\n");
        write(&cache.join("index2/level"), "2\n");
        write(&cache.join("index2/size"), "1M\n");
        write(&cache.join("index2/shared_cpu_list"), "0,2\n");

        let topo = CpuTopology::detect_from(&cpu_root, &node_root).unwrap();
        assert!(topo.smt);
        assert_eq!(topo.threads_per_core, 2);
        assert_eq!(topo.cores_per_socket, 2);
        assert_eq!(topo.sockets, 1);
        assert_eq!(topo.thread_count(), 4);

        // cpu2 is the second sibling of core 0
        let t2 = topo.hw_threads[&2];
        assert_eq!(t2.thread, 1);
        assert_eq!(t2.core, 0);
        assert_eq!(t2.numa, 0);

        // L1d: 32K per instance, 2 instances per socket
        assert_eq!(topo.l1_cache, 32 * 1024);
        assert_eq!(topo.l1_cache_per_socket, 64 * 1024);
        // L2: 1M shared by 2 threads -> 2 instances
        assert_eq!(topo.l2_cache_total, 2 * 1024 * 1024);
    }
}
