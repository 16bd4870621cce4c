//! Xilinx FPGA power from PCI hwmon.
//!
//! Accelerator cards expose several PCI functions; the `.1` function
//! carries the power sensor, so only those bus-device-function entries are
//! monitored. `power1_input` reports microwatts.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use log::{debug, error};

use crate::collector::{CollectorCore, Sampler};
use crate::error::CollectError;
use crate::measurement::{Device, Level};
use crate::util::run_with_timeout;

const MODULE: &str = "XilinxFPGA";
const PCI_DEVICES_ROOT: &str = "/sys/bus/pci/devices";
const LSPCI_TIMEOUT: Duration = Duration::from_secs(10);

pub struct XilinxSampler {
    pci_root: PathBuf,
    bdfs: Vec<String>,
}

impl Default for XilinxSampler {
    fn default() -> Self {
        Self {
            pci_root: PathBuf::from(PCI_DEVICES_ROOT),
            bdfs: Vec::new(),
        }
    }
}

impl XilinxSampler {
    #[cfg(test)]
    fn with_pci_root(pci_root: PathBuf) -> Self {
        Self {
            pci_root,
            bdfs: Vec::new(),
        }
    }

    fn prepare(&mut self) -> Result<(), CollectError> {
        let output = run_with_timeout("lspci", &[], LSPCI_TIMEOUT).map_err(|e| {
            CollectError::Unavailable(format!("cannot list PCI devices for Xilinx FPGAs ({e})"))
        })?;

        self.bdfs = parse_lspci_bdfs(&output);
        for bdf in &self.bdfs {
            debug!(target: MODULE, "monitoring bdf {bdf}");
        }

        if self.bdfs.is_empty() {
            return Err(CollectError::Unavailable("no Xilinx FPGAs found".into()));
        }
        Ok(())
    }

    fn read_usage(&self, core: &CollectorCore) -> Result<(), CollectError> {
        let mut devices_found = 0;

        for bdf in &self.bdfs {
            let hwmon_root = self.pci_root.join(format!("0000:{bdf}")).join("hwmon");
            if !hwmon_root.is_dir() {
                return Err(CollectError::Unavailable(format!(
                    "`{}` not found",
                    hwmon_root.display()
                )));
            }

            // sysfs names the instance hwmonN; use the first one
            let Some(hwmon) = fs::read_dir(&hwmon_root)?.flatten().next() else {
                continue;
            };
            let path = hwmon.path().join("power1_input");

            let raw = match fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(e) => {
                    error!(target: MODULE, "error reading `{}`: {e}", path.display());
                    continue;
                }
            };
            let microwatts: i64 = raw.trim().parse().map_err(|_| {
                CollectError::Parse(format!("{}: `{}`", path.display(), raw.trim()))
            })?;

            core.push(Device {
                name: "fpga_power".to_string(),
                level: Level::Device,
                device: bdf.clone(),
                value: microwatts as f64 / 1_000_000.0,
                ts: core.interval_end(),
            });
            devices_found += 1;
        }

        if devices_found == 0 {
            return Err(CollectError::Unavailable(
                "no FPGA power sensors readable".into(),
            ));
        }
        Ok(())
    }
}

impl Sampler for XilinxSampler {
    fn module(&self) -> &'static str {
        MODULE
    }

    fn measure(&mut self, core: &mut CollectorCore) -> Result<(), CollectError> {
        self.prepare()?;

        while !core.canceled() {
            core.synchronize_interval();

            if core.canceled() {
                return Ok(());
            }

            self.read_usage(core)?;
            core.sleep_until_interval_end();

            if core.canceled() {
                return Ok(());
            }

            core.interval_cleanup();
        }
        Ok(())
    }
}

/// Pick the power-reporting (`.1`) bus-device-function entries of Xilinx
/// accelerators out of plain `lspci` output.
pub fn parse_lspci_bdfs(output: &str) -> Vec<String> {
    let mut bdfs = Vec::new();
    for line in output.lines() {
        let lower = line.to_lowercase();
        if !(lower.contains("processing accelerators") && lower.contains("xilinx")) {
            continue;
        }
        let Some(bdf) = line.split_whitespace().next() else {
            continue;
        };
        if bdf.ends_with(".1") {
            bdfs.push(bdf.to_string());
        }
    }
    bdfs
}
