//! ClickHouse access over the HTTP interface.
//!
//! Each drained batch becomes one `INSERT ... FORMAT JSONEachRow` per
//! destination table. The table name equals the metric name; a missing
//! table is the operator's business and is classified separately so the
//! writer can skip it without shutting the engine down.

use std::time::Duration;

use serde::Serialize;

use crate::config::ClickHouseConfig;
use crate::error::SinkError;
use crate::measurement::{Basic, Device, Topology};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Row shapes, bit-exact against the downstream schemas.
#[derive(Debug, Serialize)]
pub struct BasicRow<'a, V> {
    pub job_id: u32,
    pub node: &'a str,
    pub level: &'a str,
    pub value: V,
    pub ts: i64,
}

#[derive(Debug, Serialize)]
pub struct DeviceRow<'a, V> {
    pub job_id: u32,
    pub node: &'a str,
    pub level: &'a str,
    pub device: &'a str,
    pub value: V,
    pub ts: i64,
}

#[derive(Debug, Serialize)]
pub struct TopologyRow<'a, V> {
    pub job_id: u32,
    pub node: &'a str,
    pub level: &'a str,
    pub thread: u16,
    pub core: u16,
    pub numa: u8,
    pub socket: u8,
    pub value: V,
    pub ts: i64,
}

impl<'a, V: Copy> BasicRow<'a, V> {
    pub fn new(job_id: u32, node: &'a str, m: &'a Basic<V>) -> Self {
        Self {
            job_id,
            node,
            level: m.level.as_str(),
            value: m.value,
            ts: m.ts.timestamp_millis(),
        }
    }
}

impl<'a, V: Copy> DeviceRow<'a, V> {
    pub fn new(job_id: u32, node: &'a str, m: &'a Device<V>) -> Self {
        Self {
            job_id,
            node,
            level: m.level.as_str(),
            device: &m.device,
            value: m.value,
            ts: m.ts.timestamp_millis(),
        }
    }
}

impl<'a, V: Copy> TopologyRow<'a, V> {
    pub fn new(job_id: u32, node: &'a str, m: &'a Topology<V>) -> Self {
        Self {
            job_id,
            node,
            level: m.level.as_str(),
            thread: m.thread,
            core: m.core,
            numa: m.numa,
            socket: m.socket,
            value: m.value,
            ts: m.ts.timestamp_millis(),
        }
    }
}

/// Destination for serialized measurement rows. The production
/// implementation talks to ClickHouse; tests substitute their own.
pub trait MeasurementSink {
    /// Insert newline-separated JSONEachRow lines into `table`.
    fn insert(&mut self, table: &str, rows: &str) -> Result<(), SinkError>;
}

pub struct ClickHouseClient {
    http: reqwest::blocking::Client,
    url: String,
    database: String,
    user: String,
    password: String,
}

impl ClickHouseClient {
    /// Build the client and verify the connection with a ping.
    pub fn connect(config: &ClickHouseConfig) -> Result<Self, SinkError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()?;

        let client = Self {
            http,
            url: format!("http://{}:{}/", config.host, config.port),
            database: config.database.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
        };
        client.execute("SELECT 1")?;
        Ok(client)
    }

    fn execute(&self, query: &str) -> Result<(), SinkError> {
        self.post(query, String::new())
    }

    fn post(&self, query: &str, body: String) -> Result<(), SinkError> {
        let response = self
            .http
            .post(&self.url)
            .query(&[("database", self.database.as_str()), ("query", query)])
            .header("X-ClickHouse-User", &self.user)
            .header("X-ClickHouse-Key", &self.password)
            .body(body)
            .send()?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let message = response.text().unwrap_or_default();
        Err(classify_server_error(status.as_u16(), &message))
    }
}

impl MeasurementSink for ClickHouseClient {
    fn insert(&mut self, table: &str, rows: &str) -> Result<(), SinkError> {
        let query = format!("INSERT INTO {table} FORMAT JSONEachRow");
        self.post(&query, rows.to_string())
    }
}

/// Split "table does not exist" from everything else; only the former is
/// survivable for the engine.
pub fn classify_server_error(code: u16, message: &str) -> SinkError {
    if message.contains("UNKNOWN_TABLE")
        || message.contains("Code: 60")
        || message.contains("doesn't exist")
        || message.contains("does not exist")
    {
        let table = message
            .split('`')
            .nth(1)
            .unwrap_or("unknown")
            .to_string();
        return SinkError::UnknownTable(table);
    }
    SinkError::Server {
        code,
        message: message.lines().next().unwrap_or("").to_string(),
    }
}
