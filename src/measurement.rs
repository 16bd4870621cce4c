//! Measurement record families.
//!
//! Three record shapes (node-wide, per-device, CPU-locality-tagged), each
//! carried with either an integer or a float value. The closed [`Record`]
//! enum is what crosses the queue; the writer matches on it to pick the
//! destination schema. No downcasting, no variant-index arithmetic.

use chrono::{DateTime, Utc};

/// Aggregation scope of a measurement. Closed set; the string form is what
/// lands in the database `level` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Node,
    Socket,
    Numa,
    Core,
    Thread,
    Device,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Node => "node",
            Level::Socket => "socket",
            Level::Numa => "numa",
            Level::Core => "core",
            Level::Thread => "thread",
            Level::Device => "device",
        }
    }

    /// Parse a level override from the metric dictionary. Unknown strings
    /// are rejected so a typo in metrics.json cannot invent a new level.
    pub fn parse(s: &str) -> Option<Level> {
        match s {
            "node" => Some(Level::Node),
            "socket" => Some(Level::Socket),
            "numa" => Some(Level::Numa),
            "core" => Some(Level::Core),
            "thread" => Some(Level::Thread),
            "device" => Some(Level::Device),
            _ => None,
        }
    }
}

/// Node-wide scalar.
#[derive(Debug, Clone, PartialEq)]
pub struct Basic<V> {
    pub name: String,
    pub level: Level,
    pub value: V,
    pub ts: DateTime<Utc>,
}

/// Per-device scalar (GPU, FPGA, disk).
#[derive(Debug, Clone, PartialEq)]
pub struct Device<V> {
    pub name: String,
    pub level: Level,
    pub device: String,
    pub value: V,
    pub ts: DateTime<Utc>,
}

/// CPU-locality-tagged scalar.
#[derive(Debug, Clone, PartialEq)]
pub struct Topology<V> {
    pub name: String,
    pub level: Level,
    pub thread: u16,
    pub core: u16,
    pub numa: u8,
    pub socket: u8,
    pub value: V,
    pub ts: DateTime<Utc>,
}

/// One queued measurement: family × value type.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    BasicInt(Basic<i64>),
    BasicFloat(Basic<f64>),
    DeviceInt(Device<i64>),
    DeviceFloat(Device<f64>),
    TopologyInt(Topology<i64>),
    TopologyFloat(Topology<f64>),
}

impl Record {
    /// The destination table.
    pub fn name(&self) -> &str {
        match self {
            Record::BasicInt(r) => &r.name,
            Record::BasicFloat(r) => &r.name,
            Record::DeviceInt(r) => &r.name,
            Record::DeviceFloat(r) => &r.name,
            Record::TopologyInt(r) => &r.name,
            Record::TopologyFloat(r) => &r.name,
        }
    }

    pub fn ts(&self) -> DateTime<Utc> {
        match self {
            Record::BasicInt(r) => r.ts,
            Record::BasicFloat(r) => r.ts,
            Record::DeviceInt(r) => r.ts,
            Record::DeviceFloat(r) => r.ts,
            Record::TopologyInt(r) => r.ts,
            Record::TopologyFloat(r) => r.ts,
        }
    }
}

impl From<Basic<i64>> for Record {
    fn from(r: Basic<i64>) -> Self {
        Record::BasicInt(r)
    }
}

impl From<Basic<f64>> for Record {
    fn from(r: Basic<f64>) -> Self {
        Record::BasicFloat(r)
    }
}

impl From<Device<i64>> for Record {
    fn from(r: Device<i64>) -> Self {
        Record::DeviceInt(r)
    }
}

impl From<Device<f64>> for Record {
    fn from(r: Device<f64>) -> Self {
        Record::DeviceFloat(r)
    }
}

impl From<Topology<i64>> for Record {
    fn from(r: Topology<i64>) -> Self {
        Record::TopologyInt(r)
    }
}

impl From<Topology<f64>> for Record {
    fn from(r: Topology<f64>) -> Self {
        Record::TopologyFloat(r)
    }
}
