//! InfiniBand usage from `/sys/class/infiniband`.
//!
//! Port counters are summed across all adapters and ports; data counters
//! are in 4-byte units and scaled accordingly. A node without InfiniBand
//! self-terminates on the first interval.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use log::debug;

use crate::collector::{CollectorCore, Sampler};
use crate::error::CollectError;
use crate::measurement::{Basic, Level, Record};
use crate::util::interval_seconds;

const MODULE: &str = "Infiniband";
const SYSFS_ROOT: &str = "/sys/class/infiniband";

const COUNTERS: &[&str] = &[
    "port_rcv_data",
    "port_rcv_packets",
    "port_xmit_data",
    "port_xmit_packets",
];

/// Counter -> (metric name, scale). The data counters count 4-byte words.
const METRICS: &[(&str, &str, f64)] = &[
    ("port_rcv_data", "ib_rcv_bw", 4.0),
    ("port_rcv_packets", "ib_rcv_pkg", 1.0),
    ("port_xmit_data", "ib_xmit_bw", 4.0),
    ("port_xmit_packets", "ib_xmit_pkg", 1.0),
];

pub struct InfinibandSampler {
    root: PathBuf,
}

impl Default for InfinibandSampler {
    fn default() -> Self {
        Self {
            root: PathBuf::from(SYSFS_ROOT),
        }
    }
}

impl InfinibandSampler {
    #[cfg(test)]
    fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    /// Sum counters over all adapters and ports.
    fn read_counters(&self) -> Result<BTreeMap<&'static str, u64>, CollectError> {
        if !self.root.exists() {
            debug!(target: MODULE, "InfiniBand not present");
            return Err(CollectError::Unavailable("InfiniBand not present".into()));
        }

        let mut results: BTreeMap<&'static str, u64> = BTreeMap::new();
        for device in fs::read_dir(&self.root)?.flatten() {
            let ports = device.path().join("ports");
            if !ports.is_dir() {
                continue;
            }
            for port in fs::read_dir(&ports)?.flatten() {
                let counters = port.path().join("counters");
                if !counters.is_dir() {
                    continue;
                }
                for &name in COUNTERS {
                    let path = counters.join(name);
                    if !path.exists() {
                        continue;
                    }
                    let raw = fs::read_to_string(&path)?;
                    let value: u64 = raw.trim().parse().map_err(|_| {
                        CollectError::Parse(format!("{}: `{}`", path.display(), raw.trim()))
                    })?;
                    *results.entry(name).or_insert(0) += value;
                }
            }
        }
        Ok(results)
    }

    fn emit(
        &self,
        core: &CollectorCore,
        previous: &BTreeMap<&'static str, u64>,
        current: &BTreeMap<&'static str, u64>,
    ) {
        let seconds = interval_seconds(core.interval());
        let ts = core.interval_end();
        let mut records: Vec<Record> = Vec::new();

        for (counter, name, scale) in METRICS {
            let (Some(cur), Some(prev)) = (current.get(counter), previous.get(counter)) else {
                continue;
            };
            let delta = cur.saturating_sub(*prev);
            records.push(
                Basic {
                    name: name.to_string(),
                    level: Level::Node,
                    value: (delta as f64 / seconds) * scale,
                    ts,
                }
                .into(),
            );
        }

        core.push_many(records);
    }
}

impl Sampler for InfinibandSampler {
    fn module(&self) -> &'static str {
        MODULE
    }

    fn measure(&mut self, core: &mut CollectorCore) -> Result<(), CollectError> {
        while !core.canceled() {
            core.synchronize_interval();

            if core.canceled() {
                return Ok(());
            }

            let previous = self.read_counters()?;
            core.sleep_until_interval_end();

            if core.canceled() {
                return Ok(());
            }

            let current = self.read_counters()?;
            self.emit(core, &previous, &current);

            core.interval_cleanup();
        }
        Ok(())
    }
}
