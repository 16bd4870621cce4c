//! Ethernet usage from `/proc/net/dev`.
//!
//! Counters are sampled at interval start and end, aggregated across all
//! interfaces except loopback, and converted to per-second rates.

use std::collections::BTreeMap;
use std::fs;

use crate::collector::{CollectorCore, Sampler};
use crate::error::CollectError;
use crate::measurement::{Basic, Level, Record};
use crate::util::interval_seconds;

const MODULE: &str = "Ethernet";
const DATA_PATH: &str = "/proc/net/dev";

/// Counter name -> (metric name, scale).
const METRICS: &[(&str, &str, f64)] = &[
    ("rcv_bytes", "eth_rcv_bw", 1.0),
    ("rcv_packets", "eth_rcv_pkg", 1.0),
    ("xmit_bytes", "eth_xmit_bw", 1.0),
    ("xmit_packets", "eth_xmit_pkg", 1.0),
];

#[derive(Default)]
pub struct EthernetSampler;

impl EthernetSampler {
    fn read_proc(&self) -> Result<BTreeMap<String, u64>, CollectError> {
        let content = fs::read_to_string(DATA_PATH)?;
        parse_netdev(&content)
    }

    fn emit(
        &self,
        core: &CollectorCore,
        previous: &BTreeMap<String, u64>,
        current: &BTreeMap<String, u64>,
    ) {
        let seconds = interval_seconds(core.interval());
        let ts = core.interval_end();
        let mut records: Vec<Record> = Vec::new();

        for (counter, name, scale) in METRICS {
            let (Some(cur), Some(prev)) = (current.get(*counter), previous.get(*counter)) else {
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

impl Sampler for EthernetSampler {
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

/// Aggregate the interface table across all non-loopback interfaces,
/// keyed `rcv_<column>` / `xmit_<column>`.
pub fn parse_netdev(content: &str) -> Result<BTreeMap<String, u64>, CollectError> {
    let mut results: BTreeMap<String, u64> = BTreeMap::new();
    let mut headers: Vec<String> = Vec::new();

    // first line is a banner
    for line in content.lines().skip(1) {
        let line = line.trim();

        if line.contains('|') {
            // "face |bytes packets ...|bytes packets ..."
            let sections: Vec<&str> = line.split('|').collect();
            if sections.len() < 3 {
                return Err(CollectError::Parse(format!("bad header `{line}`")));
            }
            headers = sections[1]
                .split_whitespace()
                .chain(sections[2].split_whitespace())
                .map(str::to_string)
                .collect();
            continue;
        }

        let Some((iface, rest)) = line.split_once(':') else {
            continue;
        };
        if iface.trim().starts_with("lo") {
            continue;
        }

        let values: Vec<u64> = rest
            .split_whitespace()
            .map(|v| v.parse().unwrap_or(0))
            .collect();
        let half = values.len() / 2;

        for (i, value) in values.iter().enumerate() {
            let Some(column) = headers.get(i) else {
                continue;
            };
            let prefix = if i < half { "rcv" } else { "xmit" };
            *results.entry(format!("{prefix}_{column}")).or_insert(0) += value;
        }
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo:    1000      10    0    0    0     0          0         0     1000      10    0    0    0     0       0          0
  eth0:    5000      50    0    0    0     0          0         0     3000      30    0    0    0     0       0          0
  eth1:    2000      20    0    0    0     0          0         0     1000      15    0    0    0     0       0          0
";

    #[test]
    fn aggregates_and_skips_loopback() {
        let counters = parse_netdev(SAMPLE).unwrap();
        assert_eq!(counters["rcv_bytes"], 7000);
        assert_eq!(counters["rcv_packets"], 70);
        assert_eq!(counters["xmit_bytes"], 4000);
        assert_eq!(counters["xmit_packets"], 45);
    }

    #[test]
    fn tolerates_interfaces_appearing_between_samples() {
        let prev = parse_netdev(SAMPLE).unwrap();
        let mut cur = prev.clone();
        cur.insert("rcv_bytes".into(), 17_000);
        assert_eq!(cur["rcv_bytes"].saturating_sub(prev["rcv_bytes"]), 10_000);
    }
}
