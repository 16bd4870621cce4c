//! Memory usage from `/proc/meminfo`, one snapshot per interval.

use std::collections::BTreeMap;
use std::fs;

use crate::collector::{CollectorCore, Sampler};
use crate::error::CollectError;
use crate::measurement::{Basic, Level, Record};

const MODULE: &str = "Memory";
const DATA_PATH: &str = "/proc/meminfo";

#[derive(Default)]
pub struct MemUsageSampler;

impl MemUsageSampler {
    fn collect(&self, core: &CollectorCore) -> Result<(), CollectError> {
        let content = fs::read_to_string(DATA_PATH)?;
        let values = parse_meminfo(&content);
        core.push_many(build_records(&values, core.interval_end())?);
        Ok(())
    }
}

impl Sampler for MemUsageSampler {
    fn module(&self) -> &'static str {
        MODULE
    }

    fn measure(&mut self, core: &mut CollectorCore) -> Result<(), CollectError> {
        while !core.canceled() {
            core.synchronize_interval();

            if core.canceled() {
                return Ok(());
            }

            self.collect(core)?;
            core.sleep_until_interval_end();

            if core.canceled() {
                return Ok(());
            }

            core.interval_cleanup();
        }
        Ok(())
    }
}

/// Parse meminfo into bytes per key.
pub fn parse_meminfo(content: &str) -> BTreeMap<String, i64> {
    let mut values = BTreeMap::new();
    for line in content.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let mut parts = rest.split_whitespace();
        let Some(number) = parts.next().and_then(|n| n.parse::<i64>().ok()) else {
            continue;
        };
        let factor = match parts.next() {
            Some("kB") => 1024,
            Some("mB") => 1024 * 1024,
            _ => 1,
        };
        values.insert(key.trim().to_string(), number * factor);
    }
    values
}

fn build_records(
    values: &BTreeMap<String, i64>,
    ts: chrono::DateTime<chrono::Utc>,
) -> Result<Vec<Record>, CollectError> {
    let get = |key: &str| -> Result<i64, CollectError> {
        values
            .get(key)
            .copied()
            .ok_or_else(|| CollectError::Parse(format!("missing `{key}` in {DATA_PATH}")))
    };

    let total = get("MemTotal")?;
    let available = get("MemAvailable")?;
    let swap_total = get("SwapTotal")?;
    let swap_free = get("SwapFree")?;
    if total == 0 {
        return Err(CollectError::Parse("MemTotal is zero".into()));
    }

    let used = total - available;
    let swap_used = swap_total - swap_free;
    let swap_usage = if swap_total > 0 {
        (swap_used as f64 / swap_total as f64) * 100.0
    } else {
        0.0
    };

    let basic_float = |name: &str, value: f64| -> Record {
        Basic {
            name: name.to_string(),
            level: Level::Node,
            value,
            ts,
        }
        .into()
    };
    let basic_int = |name: &str, value: i64| -> Record {
        Basic {
            name: name.to_string(),
            level: Level::Node,
            value,
            ts,
        }
        .into()
    };

    Ok(vec![
        basic_float("mem_usage", (used as f64 / total as f64) * 100.0),
        basic_float("mem_swap_usage", swap_usage),
        basic_int("mem_used", used),
        basic_int("mem_swap_used", swap_used),
        basic_int("mem_buffers", get("Buffers")?),
        basic_int("mem_cached", get("Cached")?),
    ])
}
