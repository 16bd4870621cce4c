//! NVIDIA GPU metrics via `nvidia-smi`.
//!
//! One CSV query per interval covers memory, utilization, power, pstate
//! and clocks; MIG-enabled devices report no utilization or encoder/
//! decoder figures. NVLink throughput comes from the per-device counter
//! dump, with deltas against the previous interval's sample.

use std::collections::HashMap;
use std::time::Duration;

use log::debug;

use crate::collector::{CollectorCore, Sampler};
use crate::error::CollectError;
use crate::measurement::{Device, Level, Record};
use crate::util::{interval_seconds, run_with_timeout};

const MODULE: &str = "nvidiaGPU";
const SMI_TIMEOUT: Duration = Duration::from_secs(15);

const QUERY_FIELDS: &[&str] = &[
    "index",
    "mig.mode.current",
    "memory.total",
    "memory.used",
    "memory.free",
    "bar1.memory.total",
    "bar1.memory.used",
    "bar1.memory.free",
    "utilization.gpu",
    "utilization.memory",
    "pstate",
    "power.draw",
    "power.limit",
    "clocks.gr",
    "clocks.sm",
    "clocks.mem",
    "clocks.video",
    "utilization.encoder",
    "utilization.decoder",
];

const MIB: i64 = 1024 * 1024;

#[derive(Default)]
pub struct NvidiaSampler {
    device_count: usize,
    /// Previous NVLink (rx, tx) counters in KiB, per device index.
    nvlink_prev: HashMap<String, (u64, u64)>,
}

impl NvidiaSampler {
    fn prepare(&mut self) -> Result<(), CollectError> {
        let output = run_with_timeout("nvidia-smi", &["-L"], SMI_TIMEOUT)
            .map_err(|e| CollectError::Unavailable(format!("NVML unavailable ({e})")))?;

        self.device_count = output.lines().filter(|l| l.starts_with("GPU ")).count();
        if self.device_count == 0 {
            return Err(CollectError::Unavailable("no NVIDIA devices found".into()));
        }
        debug!(target: MODULE, "found {} device(s)", self.device_count);
        Ok(())
    }

    fn collect(&mut self, core: &CollectorCore) -> Result<(), CollectError> {
        let query = QUERY_FIELDS.join(",");
        let output = run_with_timeout(
            "nvidia-smi",
            &[
                &format!("--query-gpu={query}"),
                "--format=csv,noheader,nounits",
            ],
            SMI_TIMEOUT,
        )?;

        let ts = core.interval_end();
        let mut records: Vec<Record> = Vec::new();

        for line in output.lines().filter(|l| !l.trim().is_empty()) {
            let snapshot = parse_query_line(line)?;
            snapshot.emit(&mut records, ts);

            // NVLink counters are cumulative; emit the per-interval rate
            if let Some((rx_kib, tx_kib)) = self.read_nvlink(&snapshot.index) {
                if let Some((prev_rx, prev_tx)) = self.nvlink_prev.get(&snapshot.index).copied() {
                    let seconds = interval_seconds(core.interval());
                    let rx = (rx_kib.saturating_sub(prev_rx) as f64 * 1024.0) / seconds;
                    let tx = (tx_kib.saturating_sub(prev_tx) as f64 * 1024.0) / seconds;
                    records.push(device_float("gpu_nvlink_rx_bw", &snapshot.index, rx, ts));
                    records.push(device_float("gpu_nvlink_tx_bw", &snapshot.index, tx, ts));
                }
                self.nvlink_prev
                    .insert(snapshot.index.clone(), (rx_kib, tx_kib));
            }
        }

        if records.is_empty() {
            return Err(CollectError::Unavailable(
                "no metrics readable from any device".into(),
            ));
        }

        core.push_many(records);
        Ok(())
    }

    fn read_nvlink(&self, index: &str) -> Option<(u64, u64)> {
        match run_with_timeout("nvidia-smi", &["nvlink", "-gt", "d", "-i", index], SMI_TIMEOUT) {
            Ok(output) => parse_nvlink_counters(&output),
            Err(e) => {
                debug!(target: MODULE, "no nvlink data for device {index}: {e}");
                None
            }
        }
    }
}

impl Sampler for NvidiaSampler {
    fn module(&self) -> &'static str {
        MODULE
    }

    fn measure(&mut self, core: &mut CollectorCore) -> Result<(), CollectError> {
        self.prepare()?;

        while !core.canceled() {
            core.synchronize_interval();

            if core.canceled() {
                break;
            }

            self.collect(core)?;
            core.sleep_millis_and_check(core.time_left());

            core.interval_cleanup();
        }
        Ok(())
    }
}

/// One parsed CSV line of the device query.
#[derive(Debug, Default, PartialEq)]
pub struct GpuSnapshot {
    pub index: String,
    pub mig_enabled: bool,
    pub mem_total: Option<i64>,
    pub mem_used: Option<i64>,
    pub mem_free: Option<i64>,
    pub bar1_total: Option<i64>,
    pub bar1_used: Option<i64>,
    pub bar1_free: Option<i64>,
    pub util_gpu: Option<f64>,
    pub util_mem: Option<f64>,
    pub pstate: Option<i64>,
    pub power: Option<f64>,
    pub power_limit: Option<i64>,
    pub clk_graphics: Option<i64>,
    pub clk_sm: Option<i64>,
    pub clk_mem: Option<i64>,
    pub clk_video: Option<i64>,
    pub util_enc: Option<f64>,
    pub util_dec: Option<f64>,
}

impl GpuSnapshot {
    fn emit(&self, records: &mut Vec<Record>, ts: chrono::DateTime<chrono::Utc>) {
        let dev = &self.index;

        if let (Some(total), Some(used), Some(free)) =
            (self.mem_total, self.mem_used, self.mem_free)
        {
            records.push(device_int("gpu_mem_fb_free", dev, free * MIB, ts));
            records.push(device_int("gpu_mem_fb_used", dev, used * MIB, ts));
            if total > 0 {
                let usage = (used as f64 / total as f64) * 100.0;
                records.push(device_float("gpu_mem_fb_usage", dev, usage, ts));
            }
        }

        if let (Some(total), Some(used), Some(free)) =
            (self.bar1_total, self.bar1_used, self.bar1_free)
        {
            records.push(device_int("gpu_mem_bar1_free", dev, free * MIB, ts));
            records.push(device_int("gpu_mem_bar1_used", dev, used * MIB, ts));
            if total > 0 {
                let usage = (used as f64 / total as f64) * 100.0;
                records.push(device_float("gpu_mem_bar1_usage", dev, usage, ts));
            }
        }

        // utilization figures are not reported for MIG-sliced devices
        if !self.mig_enabled {
            if let Some(util) = self.util_gpu {
                records.push(device_float("gpu_util", dev, util, ts));
            }
            if let Some(util) = self.util_mem {
                records.push(device_float("gpu_mem_util", dev, util, ts));
            }
            if let Some(util) = self.util_enc {
                records.push(device_float("gpu_enc_util", dev, util, ts));
            }
            if let Some(util) = self.util_dec {
                records.push(device_float("gpu_dec_util", dev, util, ts));
            }
        }

        if let Some(pstate) = self.pstate {
            records.push(device_int("gpu_pstate", dev, pstate, ts));
        }
        if let Some(power) = self.power {
            records.push(device_float("gpu_power", dev, power, ts));
        }
        if let Some(limit) = self.power_limit {
            records.push(device_int("gpu_power_limit", dev, limit, ts));
        }

        for (name, clock) in [
            ("gpu_clk_graphics", self.clk_graphics),
            ("gpu_clk_sm", self.clk_sm),
            ("gpu_clk_mem", self.clk_mem),
            ("gpu_clk_video", self.clk_video),
        ] {
            if let Some(clock) = clock {
                records.push(device_int(name, dev, clock, ts));
            }
        }
    }
}

fn device_int(name: &str, device: &str, value: i64, ts: chrono::DateTime<chrono::Utc>) -> Record {
    Device {
        name: name.to_string(),
        level: Level::Device,
        device: device.to_string(),
        value,
        ts,
    }
    .into()
}

fn device_float(name: &str, device: &str, value: f64, ts: chrono::DateTime<chrono::Utc>) -> Record {
    Device {
        name: name.to_string(),
        level: Level::Device,
        device: device.to_string(),
        value,
        ts,
    }
    .into()
}

fn field_str(fields: &[&str], idx: usize) -> Option<String> {
    let value = fields.get(idx)?.trim();
    if value.is_empty() || value.contains("N/A") {
        None
    } else {
        Some(value.to_string())
    }
}

fn field_i64(fields: &[&str], idx: usize) -> Option<i64> {
    field_str(fields, idx)?.parse().ok()
}

fn field_f64(fields: &[&str], idx: usize) -> Option<f64> {
    field_str(fields, idx)?.parse().ok()
}

/// Parse one `--format=csv,noheader,nounits` line in [`QUERY_FIELDS`] order.
pub fn parse_query_line(line: &str) -> Result<GpuSnapshot, CollectError> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    let index = field_str(&fields, 0)
        .ok_or_else(|| CollectError::Parse(format!("no device index in `{line}`")))?;

    Ok(GpuSnapshot {
        index,
        mig_enabled: field_str(&fields, 1).is_some_and(|m| m == "Enabled"),
        mem_total: field_i64(&fields, 2),
        mem_used: field_i64(&fields, 3),
        mem_free: field_i64(&fields, 4),
        bar1_total: field_i64(&fields, 5),
        bar1_used: field_i64(&fields, 6),
        bar1_free: field_i64(&fields, 7),
        util_gpu: field_f64(&fields, 8),
        util_mem: field_f64(&fields, 9),
        pstate: field_str(&fields, 10).and_then(|p| p.trim_start_matches('P').parse().ok()),
        power: field_f64(&fields, 11),
        power_limit: field_f64(&fields, 12).map(|w| w as i64),
        clk_graphics: field_i64(&fields, 13),
        clk_sm: field_i64(&fields, 14),
        clk_mem: field_i64(&fields, 15),
        clk_video: field_i64(&fields, 16),
        util_enc: field_f64(&fields, 17),
        util_dec: field_f64(&fields, 18),
    })
}

/// Sum `Data Rx`/`Data Tx` KiB counters across all links of one device.
pub fn parse_nvlink_counters(output: &str) -> Option<(u64, u64)> {
    let mut rx: Option<u64> = None;
    let mut tx: Option<u64> = None;
    for line in output.lines() {
        let (target, rest) = if let Some(pos) = line.find("Data Rx:") {
            (&mut rx, &line[pos + "Data Rx:".len()..])
        } else if let Some(pos) = line.find("Data Tx:") {
            (&mut tx, &line[pos + "Data Tx:".len()..])
        } else {
            continue;
        };
        if let Some(value) = crate::util::extract_number(rest, false).and_then(|n| n.parse::<u64>().ok())
        {
            *target = Some(target.unwrap_or(0) + value);
        }
    }
    match (rx, tx) {
        (Some(rx), Some(tx)) => Some((rx, tx)),
        _ => None,
    }
}
