//! AMD GPU metrics via `rocm-smi` in JSON mode.
//!
//! One invocation per interval; cards appear as `card<N>` objects whose
//! key names vary between ROCm releases, so values are looked up by key
//! substring.

use std::time::Duration;

use log::debug;
use serde_json::Value;

use crate::collector::{CollectorCore, Sampler};
use crate::error::CollectError;
use crate::measurement::{Device, Level, Record};
use crate::util::{extract_number, run_with_timeout};

const MODULE: &str = "amdGPU";
const SMI_TIMEOUT: Duration = Duration::from_secs(15);

const COLLECT_ARGS: &[&str] = &[
    "--showtemp",
    "--showuse",
    "--showpower",
    "--showmeminfo",
    "vram",
    "--showclocks",
    "--json",
];

#[derive(Default)]
pub struct AmdGpuSampler {
    device_count: usize,
}

impl AmdGpuSampler {
    fn prepare(&mut self) -> Result<(), CollectError> {
        let output = run_with_timeout("rocm-smi", &["--showid", "--json"], SMI_TIMEOUT)
            .map_err(|e| CollectError::Unavailable(format!("AMD SMI unavailable ({e})")))?;

        let json: Value = serde_json::from_str(&output)
            .map_err(|e| CollectError::Parse(format!("rocm-smi: {e}")))?;
        self.device_count = json
            .as_object()
            .map(|o| o.keys().filter(|k| k.starts_with("card")).count())
            .unwrap_or(0);

        if self.device_count == 0 {
            return Err(CollectError::Unavailable("no AMD GPUs found".into()));
        }
        debug!(target: MODULE, "found {} device(s)", self.device_count);
        Ok(())
    }

    fn collect(&self, core: &CollectorCore) -> Result<(), CollectError> {
        let output = run_with_timeout("rocm-smi", COLLECT_ARGS, SMI_TIMEOUT)?;
        let records = parse_rocm_smi(&output, core.interval_end())?;
        if records.is_empty() {
            return Err(CollectError::Unavailable(
                "no metrics readable from any device".into(),
            ));
        }
        core.push_many(records);
        Ok(())
    }
}

impl Sampler for AmdGpuSampler {
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

/// Find a card value whose key contains one of the given fragments.
fn lookup<'a>(card: &'a Value, fragments: &[&str]) -> Option<&'a Value> {
    let object = card.as_object()?;
    for fragment in fragments {
        if let Some((_, value)) = object
            .iter()
            .find(|(key, _)| key.to_lowercase().contains(&fragment.to_lowercase()))
        {
            return Some(value);
        }
    }
    None
}

fn lookup_f64(card: &Value, fragments: &[&str]) -> Option<f64> {
    match lookup(card, fragments)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => extract_number(s, true).and_then(|n| n.parse().ok()),
        _ => None,
    }
}

/// Convert one rocm-smi JSON report into device records.
pub fn parse_rocm_smi(
    output: &str,
    ts: chrono::DateTime<chrono::Utc>,
) -> Result<Vec<Record>, CollectError> {
    let json: Value =
        serde_json::from_str(output).map_err(|e| CollectError::Parse(format!("rocm-smi: {e}")))?;
    let Some(cards) = json.as_object() else {
        return Err(CollectError::Parse("rocm-smi: not a JSON object".into()));
    };

    let mut records = Vec::new();
    for (card_name, card) in cards {
        let Some(device) = card_name.strip_prefix("card") else {
            continue;
        };

        let device_int = |name: &str, value: i64| -> Record {
            Device {
                name: name.to_string(),
                level: Level::Device,
                device: device.to_string(),
                value,
                ts,
            }
            .into()
        };
        let device_float = |name: &str, value: f64| -> Record {
            Device {
                name: name.to_string(),
                level: Level::Device,
                device: device.to_string(),
                value,
                ts,
            }
            .into()
        };

        if let Some(temp) = lookup_f64(card, &["Temperature (Sensor edge)"]) {
            records.push(device_int("gpu_temp", temp as i64));
        }
        if let Some(util) = lookup_f64(card, &["GPU use (%)", "GFX Activity"]) {
            records.push(device_float("gpu_util", util));
        }
        if let Some(util) = lookup_f64(
            card,
            &["GPU Memory Allocated (VRAM%)", "Memory Activity"],
        ) {
            records.push(device_float("gpu_mem_util", util));
        }
        if let Some(util) = lookup_f64(card, &["Average MM Activity"]) {
            records.push(device_float("gpu_mm_util", util));
        }
        if let Some(power) = lookup_f64(
            card,
            &[
                "Average Graphics Package Power (W)",
                "Current Socket Graphics Package Power (W)",
            ],
        ) {
            records.push(device_float("gpu_power", power));
        }
        if let Some(clock) = lookup_f64(card, &["sclk clock speed"]) {
            records.push(device_int("gpu_clk_graphics", clock as i64));
        }
        if let Some(clock) = lookup_f64(card, &["mclk clock speed"]) {
            records.push(device_int("gpu_clk_mem", clock as i64));
        }

        let total = lookup_f64(card, &["VRAM Total Memory (B)"]);
        let used = lookup_f64(card, &["VRAM Total Used Memory (B)"]);
        if let (Some(total), Some(used)) = (total, used) {
            records.push(device_int("gpu_mem_fb_used", used as i64));
            records.push(device_int("gpu_mem_fb_free", (total - used) as i64));
            if total > 0.0 {
                records.push(device_float("gpu_mem_fb_usage", (used / total) * 100.0));
            }
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    const SAMPLE: &str = r#"{
        "card0": {
            "Temperature (Sensor edge) (C)": "41.0",
            "GPU use (%)": "23",
            "GPU Memory Allocated (VRAM%)": "12",
            "Average MM Activity": "N/A",
            "Average Graphics Package Power (W)": "87.0",
            "sclk clock speed:": "(1700Mhz)",
            "mclk clock speed:": "(1200Mhz)",
            "VRAM Total Memory (B)": "17163091968",
            "VRAM Total Used Memory (B)": "1716309196"
        },
        "card1": {
            "Temperature (Sensor edge) (C)": "38.0",
            "GPU use (%)": "0"
        }
    }"#;

    fn find_float(records: &[Record], name: &str, device: &str) -> Option<f64> {
        records.iter().find_map(|r| match r {
            Record::DeviceFloat(d) if d.name == name && d.device == device => Some(d.value),
            _ => None,
        })
    }

    fn find_int(records: &[Record], name: &str, device: &str) -> Option<i64> {
        records.iter().find_map(|r| match r {
            Record::DeviceInt(d) if d.name == name && d.device == device => Some(d.value),
            _ => None,
        })
    }

    #[test]
    fn parses_per_card_metrics() {
        let records = parse_rocm_smi(SAMPLE, Utc::now()).unwrap();

        assert_eq!(find_int(&records, "gpu_temp", "0"), Some(41));
        assert_eq!(find_float(&records, "gpu_util", "0"), Some(23.0));
        assert_eq!(find_float(&records, "gpu_power", "0"), Some(87.0));
        assert_eq!(find_int(&records, "gpu_clk_graphics", "0"), Some(1700));
        assert_eq!(find_int(&records, "gpu_clk_mem", "0"), Some(1200));
        assert_eq!(find_int(&records, "gpu_temp", "1"), Some(38));
    }

    #[test]
    fn vram_usage_is_derived() {
        let records = parse_rocm_smi(SAMPLE, Utc::now()).unwrap();
        assert_eq!(
            find_int(&records, "gpu_mem_fb_used", "0"),
            Some(1_716_309_196)
        );
        let usage = find_float(&records, "gpu_mem_fb_usage", "0").unwrap();
        assert!((usage - 10.0).abs() < 0.01);
    }

    #[test]
    fn unreadable_values_are_skipped() {
        let records = parse_rocm_smi(SAMPLE, Utc::now()).unwrap();
        assert_eq!(find_float(&records, "gpu_mm_util", "0"), None);
        assert_eq!(find_float(&records, "gpu_util", "1"), Some(0.0));
    }

    #[test]
    fn non_object_payload_is_an_error() {
        assert!(parse_rocm_smi("[]", Utc::now()).is_err());
        assert!(parse_rocm_smi("nope", Utc::now()).is_err());
    }
}
