//! CPU usage from `/proc/stat`.
//!
//! Samples the counters at interval start and end and converts the deltas
//! into percentages following the htop subtraction scheme: guest time is
//! subtracted from user/nice, idle includes iowait, system includes
//! irq/softirq. Per-CPU lines become Topology records resolved through the
//! topology snapshot; the aggregate `cpu` line is emitted at node level.

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use crate::collector::{CollectorCore, Sampler};
use crate::error::CollectError;
use crate::measurement::{Level, Record, Topology};
use crate::topology::CpuTopology;

const MODULE: &str = "CPU";
const DATA_PATH: &str = "/proc/stat";

pub struct CpuStatSampler {
    topology: Arc<CpuTopology>,
}

impl CpuStatSampler {
    pub fn new(topology: Arc<CpuTopology>) -> Self {
        Self { topology }
    }

    fn read_proc(&self) -> Result<BTreeMap<String, Vec<u64>>, CollectError> {
        let content = fs::read_to_string(DATA_PATH)?;
        parse_proc_stat(&content)
    }

    fn emit(
        &self,
        core: &CollectorCore,
        previous: &BTreeMap<String, Vec<u64>>,
        current: &BTreeMap<String, Vec<u64>>,
    ) {
        let ts = core.interval_end();
        let mut records: Vec<Record> = Vec::new();

        for (key, usage) in compute_usage(previous, current) {
            let (level, thread, core_id, numa, socket) = if key == "cpu" {
                (Level::Node, 0, 0, 0, 0)
            } else {
                let Some(id) = key.strip_prefix("cpu").and_then(|n| n.parse::<u16>().ok()) else {
                    continue;
                };
                let Some(hw) = self.topology.hw_threads.get(&id) else {
                    continue;
                };
                let level = if self.topology.smt {
                    Level::Thread
                } else {
                    Level::Core
                };
                (level, id, hw.core, hw.numa, hw.socket)
            };

            for (name, value) in [
                ("cpu_usage", usage.usage),
                ("cpu_user", usage.user),
                ("cpu_system", usage.system),
                ("cpu_iowait", usage.iowait),
                ("cpu_virtual", usage.virt),
                ("cpu_nice", usage.nice),
            ] {
                records.push(
                    Topology {
                        name: name.to_string(),
                        level,
                        thread,
                        core: core_id,
                        numa,
                        socket,
                        value,
                        ts,
                    }
                    .into(),
                );
            }
        }

        core.push_many(records);
    }
}

impl Sampler for CpuStatSampler {
    fn module(&self) -> &'static str {
        MODULE
    }

    fn measure(&mut self, core: &mut CollectorCore) -> Result<(), CollectError> {
        while !core.canceled() {
            core.synchronize_interval();

            if core.canceled() {
                return Ok(());
            }

            let previous = self.read_proc()?;
            core.sleep_until_interval_end();

            if core.canceled() {
                return Ok(());
            }

            let current = self.read_proc()?;
            self.emit(core, &previous, &current);

            core.interval_cleanup();
        }
        Ok(())
    }
}

/// Percentages for one `/proc/stat` line over one interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuUsage {
    pub usage: f64,
    pub user: f64,
    pub system: f64,
    pub iowait: f64,
    pub virt: f64,
    pub nice: f64,
}

/// Parse all `cpu*` lines into their counter columns.
pub fn parse_proc_stat(content: &str) -> Result<BTreeMap<String, Vec<u64>>, CollectError> {
    let mut results = BTreeMap::new();
    for line in content.lines() {
        if !line.starts_with("cpu") {
            continue;
        }
        let mut fields = line.split_whitespace();
        let Some(key) = fields.next() else { continue };
        let mut values = Vec::with_capacity(10);
        for field in fields {
            values.push(
                field
                    .parse::<u64>()
                    .map_err(|_| CollectError::Parse(format!("bad counter in `{line}`")))?,
            );
        }
        // older kernels report fewer columns; missing ones count as zero
        values.resize(10, 0);
        results.insert(key.to_string(), values);
    }
    Ok(results)
}

/// Counter-delta arithmetic, one entry per line present in both samples.
pub fn compute_usage(
    previous: &BTreeMap<String, Vec<u64>>,
    current: &BTreeMap<String, Vec<u64>>,
) -> Vec<(String, CpuUsage)> {
    let mut out = Vec::new();
    for (key, cur) in current {
        let Some(prev) = previous.get(key) else {
            continue;
        };
        let d: Vec<u64> = cur
            .iter()
            .zip(prev.iter())
            .map(|(c, p)| c.saturating_sub(*p))
            .collect();

        let user = d[0].saturating_sub(d[8]);
        let nice = d[1].saturating_sub(d[9]);
        let idle = d[3] + d[4];
        let iowait = d[4];
        let sys = d[2] + d[5] + d[6];
        let virt = d[8] + d[9];

        let mut total = (user + nice + idle + sys + virt + d[7]) as f64;
        if total == 0.0 {
            total = 1.0;
        }

        out.push((
            key.clone(),
            CpuUsage {
                usage: ((total - idle as f64) / total) * 100.0,
                user: (user as f64 / total) * 100.0,
                system: (sys as f64 / total) * 100.0,
                iowait: (iowait as f64 / total) * 100.0,
                virt: (virt as f64 / total) * 100.0,
                nice: (nice as f64 / total) * 100.0,
            },
        ));
    }
    out
}
