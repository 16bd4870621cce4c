//! Micro-benchmarks run once per unseen hardware configuration.
//!
//! `likwid-bench` provides peak-flops kernels plus a `load` kernel whose
//! working-set size is chosen to hit L1/L2/L3 or main memory. Results are
//! registered with the control plane alongside the system inventory.
//! A sentinel file marks the benchmark window so other tooling on the node
//! can stay out of the way.

use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;

use log::{debug, error};

use crate::config::BENCHMARK_SENTINEL_PATH;
use crate::topology::CpuTopology;
use crate::util::{extract_number, run_with_timeout};

const MODULE: &str = "Benchmark";
const BENCH_PATH: &str = "/usr/local/share/xbatd/bin/likwid-bench";
const BENCH_TIMEOUT: Duration = Duration::from_secs(300);

const FLOP_BENCHMARKS: &[&str] = &[
    "peakflops_sp",
    "peakflops_sp_sse",
    "peakflops_sp_avx",
    "peakflops_sp_avx_fma",
    "peakflops_sp_avx512",
    "peakflops_sp_avx512_fma",
    "peakflops",
    "peakflops_sse",
    "peakflops_avx",
    "peakflops_avx_fma",
    "peakflops_avx512",
    "peakflops_avx512_fma",
];

/// Run all applicable benchmarks; missing kernels are skipped. Returns an
/// empty map when likwid-bench itself is unavailable.
pub fn benchmark_system(topology: &CpuTopology) -> BTreeMap<String, f64> {
    let mut values = BTreeMap::new();

    if let Err(e) = fs::write(BENCHMARK_SENTINEL_PATH, "") {
        error!(target: MODULE, "cannot create {BENCHMARK_SENTINEL_PATH}: {e}");
        return values;
    }

    let result = run_benchmarks(topology, &mut values);
    if let Err(e) = result {
        error!(target: MODULE, "benchmarking aborted: {e}");
    }

    if let Err(e) = fs::remove_file(BENCHMARK_SENTINEL_PATH) {
        error!(target: MODULE, "cannot remove {BENCHMARK_SENTINEL_PATH}: {e}");
    }
    values
}

fn run_benchmarks(
    topology: &CpuTopology,
    values: &mut BTreeMap<String, f64>,
) -> Result<(), crate::error::CollectError> {
    let available = run_with_timeout(BENCH_PATH, &["-a"], Duration::from_secs(30))?;
    let threads =
        topology.cores_per_socket * topology.threads_per_core * topology.sockets;

    for benchmark in FLOP_BENCHMARKS {
        if !benchmark_available(&available, benchmark) {
            continue;
        }
        let Ok(output) = run_bench(benchmark, threads, topology.l1_cache_total) else {
            continue;
        };
        if let Some(mflops) = parse_result(&output, "MFlops/s:") {
            // stored as flops to stay consistent with the other metrics
            values.insert(benchmark.to_string(), mflops * 1_000_000.0);
        }
    }

    for variant in ["l1", "l2", "l3", "mem"] {
        if !benchmark_available(&available, "load") {
            continue;
        }
        let working_set = match variant {
            "l1" => topology.l1_cache_total,
            "l2" => topology.l2_cache_total,
            "l3" => topology.l3_cache_total,
            // larger than the sum of all caches per socket, times the
            // factor recommended by stream
            _ => topology.cache_total * 4,
        };
        let Ok(output) = run_bench("load", threads, working_set) else {
            continue;
        };
        if let Some(mbytes) = parse_result(&output, "MByte/s:") {
            debug!(target: MODULE, "bandwidth_{variant}: {mbytes} MByte/s");
            values.insert(format!("bandwidth_{variant}"), mbytes * 1024.0 * 1024.0);
        }
    }
    Ok(())
}

fn run_bench(
    benchmark: &str,
    threads: u32,
    size_bytes: u64,
) -> Result<String, crate::error::CollectError> {
    let workgroup = format!("N:{}KB:{}", size_bytes / 1024, threads);
    run_with_timeout(BENCH_PATH, &["-t", benchmark, "-W", &workgroup], BENCH_TIMEOUT)
}

/// Kernels are listed suffixed with " -" in `likwid-bench -a` output.
pub fn benchmark_available(listing: &str, benchmark: &str) -> bool {
    listing.contains(&format!("{benchmark} -"))
}

/// Pull the numeric value following `filter` out of a likwid-bench report.
pub fn parse_result(output: &str, filter: &str) -> Option<f64> {
    let line = output.lines().find(|l| l.contains(filter))?;
    let value = line.split(filter).nth(1)?;
    extract_number(value, true)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn availability_check_requires_kernel_suffix() {
        let listing = "\
peakflops - Double-precision multiplications and additions
peakflops_avx - Packed multiplications and additions
load - Load benchmark
";
        assert!(benchmark_available(listing, "peakflops"));
        assert!(benchmark_available(listing, "load"));
        assert!(!benchmark_available(listing, "peakflops_avx512"));
    }

    #[test]
    fn result_value_is_extracted() {
        let output = "\
Cycles:			2606046976
CPU Clock:		2600022133
Time:			1.002317e+00 sec
MFlops/s:		41241.43
Data volume (Byte):	1073741824
";
        assert_eq!(parse_result(output, "MFlops/s:"), Some(41241.43));
        assert_eq!(parse_result(output, "MByte/s:"), None);
    }
}
