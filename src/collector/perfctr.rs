//! Hardware performance counters via LIKWID event-set multiplexing.
//!
//! Only one event set fits the PMU counter groups at a time, so the
//! configured sets share each interval: the remaining measurement time,
//! minus a predicted harvest/setup overhead, is split evenly and every set
//! is measured back to back with a timed `likwid-perfctr` run. A second
//! pass harvests the metric tables, resolves display names and levels
//! through the metric dictionary and emits topology-tagged records.
//!
//! The overhead prediction is an exponentially smoothed average seeded at
//! 1000 ms; a cycle whose prediction no longer fits the remaining time is
//! aborted.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use serde::Deserialize;

use crate::collector::{CollectorCore, Sampler};
use crate::error::CollectError;
use crate::measurement::{Level, Record, Topology};
use crate::topology::CpuTopology;

const MODULE: &str = "LIKWID";
const LIST_TIMEOUT: Duration = Duration::from_secs(30);
const INITIAL_OVERHEAD_MS: i64 = 1000;

const DEFAULT_SETS: &[&str] = &[
    "BRANCH",
    "CYCLE_ACTIVITY",
    "CYCLE_STALLS",
    "DATA",
    "ENERGY",
    "FLOPS_SP",
    "FLOPS_DP",
    "HBM",
    "ICACHE",
    "L2CACHE",
    "L2",
    "L3CACHE",
    "L3",
    "MEM",
    "MEM1",
    "MEM2",
    "MEMREAD",
    "MEMWRITE",
    "UPI",
];

/// Entry of the metric dictionary file.
#[derive(Debug, Deserialize)]
struct DictionaryEntry {
    name: Option<String>,
    scale: Option<f64>,
    level: Option<String>,
}

#[derive(Debug, Clone)]
struct MetricMeta {
    label: String,
    scale: f64,
    level: Option<Level>,
}

pub struct PerfctrSampler {
    topology: Arc<CpuTopology>,
    dictionary_path: PathBuf,
    /// set name -> normalized raw metric name -> meta
    metrics: HashMap<String, HashMap<String, MetricMeta>>,
    /// registered event sets, in measurement order
    sets: Vec<String>,
    cycle_overhead: i64,
}

impl PerfctrSampler {
    pub fn new(topology: Arc<CpuTopology>, dictionary_path: impl Into<PathBuf>) -> Self {
        Self {
            topology,
            dictionary_path: dictionary_path.into(),
            metrics: HashMap::new(),
            sets: Vec::new(),
            cycle_overhead: INITIAL_OVERHEAD_MS,
        }
    }

    fn parse_dictionary(&mut self) -> Result<(), CollectError> {
        let raw = fs::read_to_string(&self.dictionary_path).map_err(|e| {
            CollectError::Unavailable(format!(
                "cannot read metric dictionary {}: {e}",
                self.dictionary_path.display()
            ))
        })?;
        self.metrics = build_metric_lookup(&raw)?;
        Ok(())
    }

    fn prepare(&mut self) -> Result<(), CollectError> {
        let output = crate::util::run_with_timeout("likwid-perfctr", &["-a"], LIST_TIMEOUT)
            .map_err(|e| CollectError::Unavailable(format!("likwid-perfctr unavailable ({e})")))?;
        let available = parse_available_groups(&output);

        self.sets = DEFAULT_SETS
            .iter()
            .filter(|set| {
                let present = available.iter().any(|a| a == *set);
                if !present {
                    debug!(target: MODULE, "set {set} is not available on this host");
                }
                present
            })
            .map(|s| s.to_string())
            .collect();

        if self.sets.is_empty() {
            return Err(CollectError::Unavailable(
                "no event sets left to measure".into(),
            ));
        }
        Ok(())
    }

    fn cpu_list(&self) -> String {
        let ids: Vec<String> = self
            .topology
            .cpu_ids()
            .iter()
            .map(|id| id.to_string())
            .collect();
        ids.join(",")
    }

    fn measure_sets(&mut self, core: &CollectorCore) -> Result<(), CollectError> {
        debug!(
            target: MODULE,
            "expected overhead: {} ms | time left: {} ms", self.cycle_overhead, core.time_left()
        );

        // abort the cycle as soon as it cannot fit the remaining window
        if self.cycle_overhead > core.time_left() {
            return Err(CollectError::Parse(format!(
                "predicted cycle overhead {} ms exceeds remaining interval time {} ms",
                self.cycle_overhead,
                core.time_left()
            )));
        }

        let set_count = self.sets.len() as i64;
        let set_time = (core.time_left() - self.cycle_overhead) / set_count;
        if set_time < 1 {
            return Err(CollectError::Parse(
                "interval too short for the configured event sets".into(),
            ));
        }

        let cpu_list = self.cpu_list();
        let set_window = Duration::from_millis(set_time as u64);
        let mut outputs: Vec<String> = Vec::with_capacity(self.sets.len());
        let mut overhead_ms: i64 = 0;

        for set in &self.sets {
            if core.canceled() {
                return Ok(());
            }

            let start = Instant::now();
            let output = crate::util::run_with_timeout(
                "likwid-perfctr",
                &[
                    "-g",
                    set,
                    "-c",
                    &cpu_list,
                    "-O",
                    "-S",
                    &format!("{set_time}ms"),
                ],
                // the run itself spans set_time; the timeout only bounds
                // counter setup and teardown on top of it
                set_window + Duration::from_secs(15),
            )?;
            let elapsed = start.elapsed().as_millis() as i64;
            overhead_ms += (elapsed - set_time).max(0);
            outputs.push(output);
        }

        let start = Instant::now();
        let records = self.harvest(&outputs, core)?;
        core.push_many(records);
        overhead_ms += start.elapsed().as_millis() as i64;

        self.cycle_overhead = next_overhead(self.cycle_overhead, overhead_ms);
        debug!(target: MODULE, "next predicted cycle overhead: {} ms", self.cycle_overhead);
        Ok(())
    }

    /// Second pass: translate the stored metric tables into records.
    fn harvest(
        &self,
        outputs: &[String],
        core: &CollectorCore,
    ) -> Result<Vec<Record>, CollectError> {
        let parsed: Vec<Vec<(String, Vec<f64>)>> = outputs
            .iter()
            .map(|output| parse_metric_table(output))
            .collect();

        let channel_sets: Vec<usize> = self
            .sets
            .iter()
            .enumerate()
            .filter(|(_, name)| is_channel_memory_set(name))
            .map(|(i, _)| i)
            .collect();

        let collection_level = if self.topology.smt {
            Level::Thread
        } else {
            Level::Core
        };

        let cpu_ids = self.topology.cpu_ids();
        let ts = core.interval_end();
        let mut records = Vec::new();

        for (i, set_name) in self.sets.iter().enumerate() {
            let multi_set_memory = channel_sets.contains(&i);

            // all channels are aggregated onto the first memory set
            let effective_set = if multi_set_memory {
                if set_name != "MEM1" {
                    continue;
                }
                "MEM"
            } else {
                set_name.as_str()
            };

            let Some(set_metrics) = self.metrics.get(effective_set) else {
                continue;
            };

            for (metric_name, values) in &parsed[i] {
                let Some(meta) = set_metrics.get(metric_name) else {
                    continue;
                };
                let level = meta.level.unwrap_or(collection_level);

                for (pos, cpu_id) in cpu_ids.iter().enumerate() {
                    let Some(hw) = self.topology.hw_threads.get(cpu_id) else {
                        continue;
                    };

                    match level {
                        // only the first thread of the first core of each
                        // socket carries socket-wide values
                        Level::Socket => {
                            if pos % self.topology.cores_per_socket as usize != 0 || hw.thread != 0
                            {
                                continue;
                            }
                        }
                        // node-wide values live on hardware thread 0
                        Level::Node => {
                            if pos != 0 {
                                break;
                            }
                        }
                        _ => {}
                    }

                    let mut value = if multi_set_memory {
                        channel_sets
                            .iter()
                            .filter_map(|&j| {
                                parsed[j]
                                    .iter()
                                    .find(|(name, _)| name == metric_name)
                                    .and_then(|(_, vals)| vals.get(pos))
                            })
                            .filter(|v| !v.is_nan())
                            .sum()
                    } else {
                        values.get(pos).copied().unwrap_or(f64::NAN)
                    };

                    if value.is_nan() {
                        value = 0.0;
                    }

                    records.push(
                        Topology {
                            name: meta.label.clone(),
                            level,
                            thread: *cpu_id,
                            core: hw.core,
                            numa: hw.numa,
                            socket: hw.socket,
                            value: value * meta.scale,
                            ts,
                        }
                        .into(),
                    );
                }
            }
        }
        Ok(records)
    }
}

impl Sampler for PerfctrSampler {
    fn module(&self) -> &'static str {
        MODULE
    }

    fn measure(&mut self, core: &mut CollectorCore) -> Result<(), CollectError> {
        self.parse_dictionary()?;
        self.prepare()?;

        while !core.canceled() {
            core.synchronize_interval();

            if core.canceled() {
                return Ok(());
            }

            self.measure_sets(core)?;

            core.interval_cleanup();
        }
        Ok(())
    }
}

/// Exponentially smoothed overhead; the current sample dominates.
pub fn next_overhead(previous: i64, current: i64) -> i64 {
    (previous + 3 * current) / 4
}

/// Event-set families named `MEM<digit>` observe one memory controller
/// channel each and are aggregated before emission.
pub fn is_channel_memory_set(name: &str) -> bool {
    name.strip_prefix("MEM")
        .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
}

/// Strip the bracketed unit suffix and parenthesized qualifier from a raw
/// LIKWID metric name.
pub fn normalize_metric_name(name: &str) -> String {
    let name = name.split('[').next().unwrap_or(name);
    let name = name.split('(').next().unwrap_or(name);
    name.trim().to_string()
}

fn build_metric_lookup(
    raw: &str,
) -> Result<HashMap<String, HashMap<String, MetricMeta>>, CollectError> {
    let dictionary: HashMap<String, HashMap<String, DictionaryEntry>> =
        serde_json::from_str(raw)
            .map_err(|e| CollectError::Parse(format!("metric dictionary: {e}")))?;

    let mut metrics = HashMap::new();
    for (set_name, entries) in dictionary {
        let mut mapping = HashMap::new();
        for (raw_name, entry) in entries {
            let display = entry.name.unwrap_or_else(|| raw_name.clone());
            let meta = MetricMeta {
                label: format!("likwid_{display}"),
                scale: entry.scale.unwrap_or(1.0),
                level: entry.level.as_deref().and_then(Level::parse),
            };
            mapping.insert(normalize_metric_name(&raw_name), meta);
        }
        metrics.insert(set_name, mapping);
    }
    Ok(metrics)
}

/// Group names out of `likwid-perfctr -a` output.
pub fn parse_available_groups(output: &str) -> Vec<String> {
    let mut groups = Vec::new();
    for line in output.lines() {
        let Some(token) = line.split_whitespace().next() else {
            continue;
        };
        if token.len() >= 2
            && token
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
        {
            groups.push(token.to_string());
        }
    }
    groups
}

/// Extract the per-hardware-thread metric table from `likwid-perfctr -O`
/// CSV output. Names come back normalized; statistics tables (Sum/Min/...)
/// are skipped.
pub fn parse_metric_table(output: &str) -> Vec<(String, Vec<f64>)> {
    let mut rows = Vec::new();
    let mut in_metric_table = false;

    for line in output.lines() {
        let line = line.trim();

        if line.starts_with("Metric,") {
            // per-cpu tables are keyed by hardware thread or core columns
            in_metric_table = line.contains("HWThread") || line.contains("Core");
            continue;
        }
        if line.is_empty() || line.starts_with("TABLE,") || line.starts_with("STRUCT,") {
            in_metric_table = false;
            continue;
        }
        if !in_metric_table {
            continue;
        }

        let mut columns = line.split(',');
        let Some(name) = columns.next() else { continue };
        let values: Vec<f64> = columns
            .map(|v| v.trim().parse::<f64>().unwrap_or(f64::NAN))
            .collect();
        if !values.is_empty() {
            rows.push((normalize_metric_name(name), values));
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MeasurementQueue;
    use crate::topology::HwThread;

    fn test_topology(smt: bool) -> Arc<CpuTopology> {
        // 2 sockets x 2 cores, no SMT unless requested
        let mut hw_threads = std::collections::BTreeMap::new();
        let per_core: u32 = if smt { 2 } else { 1 };
        let mut id = 0u16;
        for socket in 0..2u8 {
            for core in 0..2u16 {
                for thread in 0..per_core as u16 {
                    hw_threads.insert(
                        id,
                        HwThread {
                            id,
                            thread,
                            core,
                            socket,
                            numa: socket,
                        },
                    );
                    id += 1;
                }
            }
        }
        Arc::new(CpuTopology {
            smt,
            threads_per_core: per_core,
            cores_per_socket: 2,
            sockets: 2,
            hw_threads,
            ..CpuTopology::default()
        })
    }

    #[test]
    fn overhead_smoothing_weights_current_sample() {
        assert_eq!(next_overhead(1000, 1000), 1000);
        assert_eq!(next_overhead(1000, 200), 400);
        assert_eq!(next_overhead(400, 0), 100);
    }

    #[test]
    fn channel_memory_sets_are_recognized() {
        assert!(is_channel_memory_set("MEM1"));
        assert!(is_channel_memory_set("MEM12"));
        assert!(!is_channel_memory_set("MEM"));
        assert!(!is_channel_memory_set("MEMREAD"));
        assert!(!is_channel_memory_set("HBM1X"));
    }

    #[test]
    fn metric_names_are_normalized() {
        assert_eq!(normalize_metric_name("DP [MFLOP/s]"), "DP");
        assert_eq!(
            normalize_metric_name("Memory bandwidth (channels 0-3) [MBytes/s]"),
            "Memory bandwidth"
        );
        assert_eq!(normalize_metric_name("  CPI  "), "CPI");
    }

    #[test]
    fn dictionary_builds_prefixed_labels() {
        let raw = r#"{
            "FLOPS_DP": {
                "DP [MFLOP/s]": {"name": "flops_dp", "scale": 1000000},
                "CPI": {}
            },
            "MEM": {
                "Memory bandwidth [MBytes/s]": {"name": "mem_bw", "scale": 1048576, "level": "socket"}
            }
        }"#;
        let metrics = build_metric_lookup(raw).unwrap();

        let flops = &metrics["FLOPS_DP"]["DP"];
        assert_eq!(flops.label, "likwid_flops_dp");
        assert_eq!(flops.scale, 1_000_000.0);
        assert_eq!(flops.level, None);

        let cpi = &metrics["FLOPS_DP"]["CPI"];
        assert_eq!(cpi.label, "likwid_CPI");
        assert_eq!(cpi.scale, 1.0);

        assert_eq!(metrics["MEM"]["Memory bandwidth"].level, Some(Level::Socket));
    }

    #[test]
    fn available_groups_are_parsed_from_listing() {
        let output = "\
Available groups on this system:
--------------------------------------------------------------------------------
    BRANCH\tBranch prediction miss rate/ratio
    FLOPS_DP\tDouble precision MFLOP/s
    L2CACHE\tL2 cache miss rate/ratio
    MEM1\tMain memory bandwidth in MBytes/s (channels 0-3)
";
        let groups = parse_available_groups(output);
        assert_eq!(groups, vec!["BRANCH", "FLOPS_DP", "L2CACHE", "MEM1"]);
    }

    #[test]
    fn metric_table_rows_are_extracted() {
        let output = "\
TABLE,Group 1 Raw,FLOPS_DP,5
Event,Counter,HWThread 0,HWThread 1
INSTR_RETIRED_ANY,FIXC0,1000,2000
TABLE,Group 1 Metric,FLOPS_DP,3
Metric,HWThread 0,HWThread 1
DP [MFLOP/s],1.5,2.5
CPI,0.8,nan
TABLE,Group 1 Metric STAT,FLOPS_DP,3
Metric,Sum,Min,Max,Avg
DP [MFLOP/s] STAT,4.0,1.5,2.5,2.0
";
        let rows = parse_metric_table(output);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, "DP");
        assert_eq!(rows[0].1, vec![1.5, 2.5]);
        assert_eq!(rows[1].0, "CPI");
        assert!(rows[1].1[1].is_nan());
    }

    fn sampler_with(
        topology: Arc<CpuTopology>,
        sets: &[&str],
        dictionary: &str,
    ) -> PerfctrSampler {
        let mut sampler = PerfctrSampler::new(topology, "/nonexistent/metrics.json");
        sampler.metrics = build_metric_lookup(dictionary).unwrap();
        sampler.sets = sets.iter().map(|s| s.to_string()).collect();
        sampler
    }

    fn harvest_records(sampler: &PerfctrSampler, outputs: &[&str]) -> Vec<Record> {
        let queue = Arc::new(MeasurementQueue::default());
        let core = crate::collector::test_core(MODULE, 10_000, queue);
        let outputs: Vec<String> = outputs.iter().map(|s| s.to_string()).collect();
        sampler.harvest(&outputs, &core).unwrap()
    }

    const DICT: &str = r#"{
        "FLOPS_DP": {"DP [MFLOP/s]": {"name": "flops_dp"}},
        "MEM": {"Memory bandwidth [MBytes/s]": {"name": "mem_bw", "level": "socket"}}
    }"#;

    #[test]
    fn thread_level_metrics_report_every_hw_thread() {
        let sampler = sampler_with(test_topology(false), &["FLOPS_DP"], DICT);
        let output = "\
Metric,HWThread 0,HWThread 1,HWThread 2,HWThread 3
DP [MFLOP/s],1,2,3,4
";
        let records = harvest_records(&sampler, &[output]);
        assert_eq!(records.len(), 4);
        // without SMT the effective level is core
        assert!(records.iter().all(|r| matches!(
            r,
            Record::TopologyFloat(t) if t.level == Level::Core && t.name == "likwid_flops_dp"
        )));
    }

    #[test]
    fn socket_level_reports_first_thread_of_first_core_per_socket() {
        let sampler = sampler_with(test_topology(false), &["MEM"], DICT);
        let output = "\
Metric,HWThread 0,HWThread 1,HWThread 2,HWThread 3
Memory bandwidth [MBytes/s],100,nan,200,nan
";
        let records = harvest_records(&sampler, &[output]);
        assert_eq!(records.len(), 2);
        let sockets: Vec<u8> = records
            .iter()
            .map(|r| match r {
                Record::TopologyFloat(t) => t.socket,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(sockets, vec![0, 1]);
    }

    #[test]
    fn memory_channels_aggregate_onto_mem1() {
        let sampler = sampler_with(test_topology(false), &["MEM1", "MEM2"], DICT);
        let mem1 = "\
Metric,HWThread 0,HWThread 1,HWThread 2,HWThread 3
Memory bandwidth [MBytes/s],100,nan,40,nan
";
        let mem2 = "\
Metric,HWThread 0,HWThread 1,HWThread 2,HWThread 3
Memory bandwidth [MBytes/s],50,nan,nan,nan
";
        let records = harvest_records(&sampler, &[mem1, mem2]);
        // socket level: cpu0 and cpu2 report; channel values summed, NaN ignored
        assert_eq!(records.len(), 2);
        let values: Vec<f64> = records
            .iter()
            .map(|r| match r {
                Record::TopologyFloat(t) => t.value,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(values, vec![150.0, 40.0]);
    }

    #[test]
    fn nan_values_round_to_zero() {
        let sampler = sampler_with(test_topology(false), &["FLOPS_DP"], DICT);
        let output = "\
Metric,HWThread 0,HWThread 1,HWThread 2,HWThread 3
DP [MFLOP/s],nan,nan,nan,1
";
        let records = harvest_records(&sampler, &[output]);
        let values: Vec<f64> = records
            .iter()
            .map(|r| match r {
                Record::TopologyFloat(t) => t.value,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(values, vec![0.0, 0.0, 0.0, 1.0]);
    }
}
