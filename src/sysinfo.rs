//! Node system inventory and configuration hash.
//!
//! The control plane keys benchmark results by a hash of the hardware and
//! OS configuration, so two identical nodes share one benchmark run.
//! Volatile fields (hostname) are excluded from the hash. Everything here
//! is best-effort: a missing tool just leaves its section out.

use std::ffi::CStr;
use std::time::Duration;

use log::warn;
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

use crate::util::run_with_timeout;

const MODULE: &str = "SysInfo";
const TOOL_TIMEOUT: Duration = Duration::from_secs(30);

const LSCPU_FIELDS: &[&str] = &[
    "Architecture",
    "CPU(s)",
    "Vendor ID",
    "Model name",
    "CPU family",
    "Model",
    "Thread(s) per core",
    "Core(s) per socket",
    "Socket(s)",
    "Frequency boost",
    "CPU max MHz",
    "Caches (sum of all)",
    "L1d cache",
    "L1i cache",
    "L2 cache",
    "L3 cache",
];

/// Short hostname of this node (the FQDN is normally unknown to the
/// scheduler).
pub fn hostname() -> std::io::Result<String> {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    let full = unsafe { CStr::from_ptr(buf.as_ptr() as *const libc::c_char) }
        .to_string_lossy()
        .into_owned();
    Ok(full.split('.').next().unwrap_or(&full).to_string())
}

/// Gather the system inventory uploaded at node registration.
pub fn gather_system_info(hostname: &str) -> Value {
    let mut data = Map::new();

    data.insert("os".to_string(), os_info(hostname));
    if let Some(cpu) = cpu_info() {
        data.insert("cpu".to_string(), cpu);
    }
    if let Some(gpu) = gpu_info() {
        data.insert("gpu".to_string(), gpu);
    }
    for (section, dmi_type, keys) in [
        (
            "bios",
            "BIOS",
            vec!["Vendor", "Version", "Release Date", "BIOS Revision", "Firmware Revision"],
        ),
        (
            "system",
            "system",
            vec!["Manufacturer", "Product Name", "Version", "Family"],
        ),
        (
            "memory",
            "memory",
            vec![
                "Error Correction Type",
                "Maximum Capacity",
                "Number Of Devices",
                "Size",
                "Form Factor",
                "Type",
                "Speed",
                "Configured Memory Speed",
                "Configured Voltage",
                "Manufacturer",
            ],
        ),
    ] {
        if let Some(parsed) = dmidecode_section(dmi_type, &keys) {
            data.insert(section.to_string(), parsed);
        }
    }

    Value::Object(data)
}

/// Configuration hash over the inventory, with volatile fields removed.
pub fn config_hash(system_info: &Value) -> String {
    let mut hashable = system_info.clone();
    if let Some(cpu) = hashable.get_mut("cpu").and_then(Value::as_object_mut) {
        cpu.remove("topology");
    }
    if let Some(os) = hashable.get_mut("os").and_then(Value::as_object_mut) {
        os.remove("hostname");
    }

    let mut hasher = Sha256::new();
    hasher.update(hashable.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

fn os_info(hostname: &str) -> Value {
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::uname(&mut uts) };

    let field = |raw: &[libc::c_char]| -> String {
        if rc != 0 {
            return String::new();
        }
        unsafe { CStr::from_ptr(raw.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    };

    let mut os = json!({
        "kernel": field(&uts.release),
        "version": field(&uts.version),
        "hostname": hostname,
        "sysname": field(&uts.sysname),
        "architecture": field(&uts.machine),
    });

    // uname only reports "Linux"; the distro name lives in os-release
    if let Ok(release) = std::fs::read_to_string("/etc/os-release") {
        if let Some(distro) = parse_os_release_pretty_name(&release) {
            os["distro"] = Value::String(distro);
        }
    }
    os
}

pub fn parse_os_release_pretty_name(content: &str) -> Option<String> {
    content
        .lines()
        .find_map(|l| l.strip_prefix("PRETTY_NAME="))
        .map(|v| v.trim().trim_matches('"').to_string())
}

fn cpu_info() -> Option<Value> {
    let output = run_with_timeout("lscpu", &["--json"], TOOL_TIMEOUT).ok()?;
    let parsed: Value = serde_json::from_str(&output)
        .map_err(|e| warn!(target: MODULE, "error parsing lscpu output - {e}"))
        .ok()?;

    let mut cpu = Map::new();
    let entries = parsed.get("lscpu")?.as_array()?;
    for entry in entries {
        collect_lscpu_field(&mut cpu, entry);
        if let Some(children) = entry.get("children").and_then(Value::as_array) {
            for child in children {
                collect_lscpu_field(&mut cpu, child);
            }
        }
    }
    Some(Value::Object(cpu))
}

fn collect_lscpu_field(cpu: &mut Map<String, Value>, entry: &Value) {
    let (Some(field), Some(data)) = (
        entry.get("field").and_then(Value::as_str),
        entry.get("data"),
    ) else {
        return;
    };
    let key = field.trim_end_matches(':');
    if LSCPU_FIELDS.contains(&key) || key.starts_with("NUMA ") {
        cpu.insert(key.to_string(), data.clone());
    }
}

fn gpu_info() -> Option<Value> {
    let output = run_with_timeout("lspci", &[], TOOL_TIMEOUT).ok()?;
    let gpus: Vec<Value> = output
        .lines()
        .filter(|l| {
            l.contains("VGA compatible controller")
                || l.contains("3D controller")
                || l.contains("Display controller")
                || l.contains("Processing accelerators")
        })
        .map(|l| Value::String(l.trim().to_string()))
        .collect();
    if gpus.is_empty() {
        None
    } else {
        Some(Value::Array(gpus))
    }
}

fn dmidecode_section(dmi_type: &str, keys: &[&str]) -> Option<Value> {
    let output = run_with_timeout("dmidecode", &["-t", dmi_type], TOOL_TIMEOUT).ok()?;
    Some(parse_dmidecode(&output, keys))
}

/// First value wins per key, mirroring how identical DIMM banks collapse.
pub fn parse_dmidecode(output: &str, keys: &[&str]) -> Value {
    let mut section = Map::new();
    for line in output.lines() {
        let Some((key, value)) = line.trim().split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        if !keys.contains(&key) || section.contains_key(key) {
            continue;
        }
        if matches!(value, "Unknown" | "None" | "No Module Installed") {
            continue;
        }
        section.insert(key.to_string(), Value::String(value.to_string()));
    }
    Value::Object(section)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_hostname_has_no_domain() {
        let name = hostname().unwrap();
        assert!(!name.is_empty());
        assert!(!name.contains('.'));
    }

    #[test]
    fn pretty_name_is_unquoted() {
        let content = "NAME=\"Rocky Linux\"\nPRETTY_NAME=\"Rocky Linux 9.4 (Blue Onyx)\"\n";
        assert_eq!(
            parse_os_release_pretty_name(content).as_deref(),
            Some("Rocky Linux 9.4 (Blue Onyx)")
        );
        assert_eq!(parse_os_release_pretty_name("NAME=x\n"), None);
    }

    #[test]
    fn dmidecode_keeps_first_occurrence_and_filters_placeholders() {
        let output = "\
Memory Device
\tSize: 32 GB
\tForm Factor: DIMM
\tSpeed: 4800 MT/s
Memory Device
\tSize: No Module Installed
\tSpeed: 5600 MT/s
";
        let parsed = parse_dmidecode(output, &["Size", "Form Factor", "Speed"]);
        assert_eq!(parsed["Size"], "32 GB");
        assert_eq!(parsed["Speed"], "4800 MT/s");
    }

    #[test]
    fn hash_ignores_hostname_and_topology() {
        let a = json!({
            "os": {"kernel": "6.1", "hostname": "node01"},
            "cpu": {"Model name": "EPYC", "topology": "long dump A"}
        });
        let b = json!({
            "os": {"kernel": "6.1", "hostname": "node02"},
            "cpu": {"Model name": "EPYC", "topology": "long dump B"}
        });
        assert_eq!(config_hash(&a), config_hash(&b));

        let c = json!({
            "os": {"kernel": "6.2", "hostname": "node01"},
            "cpu": {"Model name": "EPYC"}
        });
        assert_ne!(config_hash(&a), config_hash(&c));
    }

    #[test]
    fn hash_is_stable_hex() {
        let info = json!({"os": {"kernel": "6.1"}});
        let h = config_hash(&info);
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(h, config_hash(&info));
    }
}
