//! Block device I/O via `iostat` in JSON mode.
//!
//! One `iostat -o JSON -dx -y <interval> 1` invocation spans the
//! measurement window, so this collector needs no extra end-of-interval
//! sleep. Pseudo devices (loop mounts) are skipped; kB/MB rates are scaled
//! to bytes.

use std::time::Duration;

use serde_json::Value;

use crate::collector::{CollectorCore, Sampler};
use crate::error::CollectError;
use crate::measurement::{Device, Level, Record};
use crate::util::run_with_timeout;

const MODULE: &str = "Disk";

/// iostat column -> (metric name, scale factor).
const METRICS: &[(&str, &str, f64)] = &[
    ("r/s", "disk_r_req_s", 1.0),
    ("w/s", "disk_w_req_s", 1.0),
    ("d/s", "disk_d_req_s", 1.0),
    ("f/s", "disk_f_req_s", 1.0),
    ("rkB/s", "disk_r_bw", 1024.0),
    ("rMB/s", "disk_r_bw", 1024.0 * 1024.0),
    ("wkB/s", "disk_w_bw", 1024.0),
    ("wMB/s", "disk_w_bw", 1024.0 * 1024.0),
    ("areq-sz", "disk_areq_sz", 1024.0),
    ("rareq-sz", "disk_rareq_sz", 1024.0),
    ("wareq-sz", "disk_wareq_sz", 1024.0),
    ("dareq-sz", "disk_dareq_sz", 1024.0),
    ("await", "disk_await", 1.0),
    ("r_await", "disk_r_await", 1.0),
    ("w_await", "disk_w_await", 1.0),
    ("rrqm/s", "disk_rrqm", 1.0),
    ("wrqm/s", "disk_wrqm", 1.0),
    ("drqm/s", "disk_drqm", 1.0),
    ("util", "disk_util", 1.0),
];

#[derive(Default)]
pub struct IoStatSampler;

impl IoStatSampler {
    fn collect(&self, core: &CollectorCore) -> Result<(), CollectError> {
        // iostat blocks for the sampling window itself
        let seconds = (core.time_left() / 1000).max(1);
        let timeout = Duration::from_millis(core.time_left() as u64 + 5000);

        let output = run_with_timeout(
            "iostat",
            &["-o", "JSON", "-dx", "-y", &seconds.to_string(), "1"],
            timeout,
        )
        .map_err(|e| {
            if core.canceled() {
                e
            } else {
                CollectError::Unavailable(format!("iostat may not be installed ({e})"))
            }
        })?;

        core.push_many(parse_iostat(&output, core.interval_end())?);
        Ok(())
    }
}

impl Sampler for IoStatSampler {
    fn module(&self) -> &'static str {
        MODULE
    }

    fn measure(&mut self, core: &mut CollectorCore) -> Result<(), CollectError> {
        while !core.canceled() {
            core.synchronize_interval();

            if core.canceled() {
                return Ok(());
            }

            if let Err(e) = self.collect(core) {
                // a kill during shutdown is not a source failure
                if core.canceled() {
                    return Ok(());
                }
                return Err(e);
            }

            core.interval_cleanup();
        }
        Ok(())
    }
}

/// Convert one iostat JSON report into device records.
pub fn parse_iostat(
    output: &str,
    ts: chrono::DateTime<chrono::Utc>,
) -> Result<Vec<Record>, CollectError> {
    let json: Value =
        serde_json::from_str(output).map_err(|e| CollectError::Parse(format!("iostat: {e}")))?;

    let disks = json
        .get("sysstat")
        .and_then(|s| s.get("hosts"))
        .and_then(|h| h.get(0))
        .and_then(|h| h.get("statistics"))
        .and_then(|s| s.get(0))
        .and_then(|s| s.get("disk"))
        .and_then(Value::as_array)
        .ok_or_else(|| CollectError::Parse("iostat: no disk statistics in output".into()))?;

    let mut records = Vec::new();
    for disk in disks {
        let Some(device) = disk.get("disk_device").and_then(Value::as_str) else {
            continue;
        };
        if device.contains("loop") {
            continue;
        }

        let Some(entries) = disk.as_object() else {
            continue;
        };
        for (key, value) in entries {
            if key == "disk_device" {
                continue;
            }
            let Some((_, name, scale)) = METRICS.iter().find(|(k, _, _)| *k == key.as_str())
            else {
                continue;
            };
            let Some(value) = value.as_f64() else {
                continue;
            };
            records.push(
                Device {
                    name: name.to_string(),
                    level: Level::Device,
                    device: device.to_string(),
                    value: value * scale,
                    ts,
                }
                .into(),
            );
        }
    }
    Ok(records)
}
