//! Node power draw via `ipmitool dcmi power reading`.
//!
//! Some boards only answer through a bridged request to the satellite
//! controller; after the plain form fails once the bridged form is used
//! for the rest of the run.

use std::time::Duration;

use crate::collector::{CollectorCore, Sampler};
use crate::error::CollectError;
use crate::measurement::{Basic, Level};
use crate::util::{extract_number, run_with_timeout};

const MODULE: &str = "IPMI";
const POWER_LINE: &str = "Instantaneous power reading";

const PLAIN_ARGS: &[&str] = &["dcmi", "power", "reading"];
const BRIDGED_ARGS: &[&str] = &["-b", "0x06", "-t", "0x2c", "dcmi", "power", "reading"];

#[derive(Default)]
pub struct IpmiSampler {
    bridged: bool,
}

impl IpmiSampler {
    fn read_power(&mut self, timeout: Duration) -> Result<String, CollectError> {
        if !self.bridged {
            match run_with_timeout("ipmitool", PLAIN_ARGS, timeout) {
                Ok(output) => return Ok(output),
                Err(_) => {
                    // fall through to the bridged request used by some
                    // Intel boards
                }
            }
        }

        match run_with_timeout("ipmitool", BRIDGED_ARGS, timeout) {
            Ok(output) => {
                self.bridged = true;
                Ok(output)
            }
            Err(e) => Err(CollectError::Unavailable(format!(
                "cannot read power usage - are IPMI and ipmitool available? ({e})"
            ))),
        }
    }
}

impl Sampler for IpmiSampler {
    fn module(&self) -> &'static str {
        MODULE
    }

    fn measure(&mut self, core: &mut CollectorCore) -> Result<(), CollectError> {
        while !core.canceled() {
            core.synchronize_interval();

            if core.canceled() {
                return Ok(());
            }

            // hard timeout below the remaining interval time
            let timeout = Duration::from_millis(core.time_left().clamp(1000, 30_000) as u64);
            let output = self.read_power(timeout)?;
            let value = parse_power_reading(&output)?;
            core.push(Basic {
                name: "ipmi_power_system".to_string(),
                level: Level::Node,
                value,
                ts: core.interval_end(),
            });

            core.sleep_until_interval_end();

            if core.canceled() {
                return Ok(());
            }

            core.interval_cleanup();
        }
        Ok(())
    }
}

/// Extract the instantaneous power value (watts) from ipmitool output.
pub fn parse_power_reading(output: &str) -> Result<i64, CollectError> {
    let line = output
        .lines()
        .find(|l| l.contains(POWER_LINE))
        .ok_or_else(|| CollectError::Parse(format!("no `{POWER_LINE}` line in output")))?;

    let (_, value) = line
        .split_once(':')
        .ok_or_else(|| CollectError::Parse(format!("malformed line `{line}`")))?;

    extract_number(value, false)
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| CollectError::Parse(format!("no numeric reading in `{line}`")))
}
