//! Database writer: drains the queue on a fixed cadence and turns batches
//! into per-table inserts.
//!
//! Error policy: a missing destination table is warned about and skipped
//! (tables may be provisioned lazily downstream); any other insert failure
//! latches the process-wide cancellation flag and ends the run.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, warn};
use serde::Serialize;

use crate::cancel::CancelFlag;
use crate::clickhouse::{BasicRow, DeviceRow, MeasurementSink, TopologyRow};
use crate::error::SinkError;
use crate::queue::{Batch, MeasurementQueue};

const MODULE: &str = "DbWriter";

/// Queue poll cadence.
pub const QUEUE_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterOutcome {
    /// Exited because the cancellation flag was observed.
    Canceled,
    /// Exited on an unrecoverable sink error after latching cancellation.
    Fatal,
}

pub struct Writer<S> {
    sink: S,
    queue: Arc<MeasurementQueue>,
    cancel: CancelFlag,
    job_id: u32,
    hostname: String,
    poll_interval: Duration,
}

impl<S: MeasurementSink> Writer<S> {
    pub fn new(
        sink: S,
        queue: Arc<MeasurementQueue>,
        cancel: CancelFlag,
        job_id: u32,
        hostname: String,
        poll_interval: Duration,
    ) -> Self {
        Self {
            sink,
            queue,
            cancel,
            job_id,
            hostname,
            poll_interval,
        }
    }

    pub fn run(mut self) -> WriterOutcome {
        debug!(target: MODULE, "starting database writer");

        loop {
            std::thread::sleep(self.poll_interval);

            if self.cancel.is_canceled() {
                return WriterOutcome::Canceled;
            }

            let Some(batch) = self.queue.try_drain() else {
                continue;
            };

            debug!(target: MODULE, "sending {} measurements", batch.len());
            if let Err(e) = self.send_batch(&batch) {
                error!(target: MODULE, "database error - {e}");
                let dropped = self.queue.drop_all();
                if dropped > 0 {
                    debug!(target: MODULE, "dropped {dropped} queued measurements");
                }
                self.cancel.cancel();
                return WriterOutcome::Fatal;
            }
        }
    }

    /// One insert per destination table; rows are grouped by metric name.
    fn send_batch(&mut self, batch: &Batch) -> Result<(), SinkError> {
        let mut tables: BTreeMap<&str, String> = BTreeMap::new();

        for m in &batch.basic_int {
            append_row(&mut tables, &m.name, BasicRow::new(self.job_id, &self.hostname, m));
        }
        for m in &batch.basic_float {
            append_row(&mut tables, &m.name, BasicRow::new(self.job_id, &self.hostname, m));
        }
        for m in &batch.device_int {
            append_row(&mut tables, &m.name, DeviceRow::new(self.job_id, &self.hostname, m));
        }
        for m in &batch.device_float {
            append_row(&mut tables, &m.name, DeviceRow::new(self.job_id, &self.hostname, m));
        }
        for m in &batch.topology_int {
            append_row(&mut tables, &m.name, TopologyRow::new(self.job_id, &self.hostname, m));
        }
        for m in &batch.topology_float {
            append_row(&mut tables, &m.name, TopologyRow::new(self.job_id, &self.hostname, m));
        }

        for (table, rows) in &tables {
            match self.sink.insert(table, rows) {
                Ok(()) => {}
                Err(SinkError::UnknownTable(_)) => {
                    warn!(target: MODULE, "table `{table}` does not exist - skipping insert");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

fn append_row<'a, R: Serialize>(tables: &mut BTreeMap<&'a str, String>, name: &'a str, row: R) {
    match serde_json::to_string(&row) {
        Ok(line) => {
            let buffer = tables.entry(name).or_default();
            buffer.push_str(&line);
            buffer.push('\n');
        }
        Err(e) => error!(target: MODULE, "failed to serialize row for `{name}`: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::{Basic, Device, Level, Topology};
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct MockSink {
        inserts: Arc<Mutex<Vec<(String, String)>>>,
        missing_tables: Vec<String>,
        fatal: bool,
    }

    impl MeasurementSink for MockSink {
        fn insert(&mut self, table: &str, rows: &str) -> Result<(), SinkError> {
            if self.fatal {
                return Err(SinkError::Server {
                    code: 403,
                    message: "Authentication failed".into(),
                });
            }
            if self.missing_tables.iter().any(|t| t == table) {
                return Err(SinkError::UnknownTable(table.to_string()));
            }
            self.inserts.lock().push((table.to_string(), rows.to_string()));
            Ok(())
        }
    }

    fn sample_batch() -> Batch {
        let ts = Utc::now();
        let mut batch = Batch::default();
        batch.basic_int.push(Basic {
            name: "mem_used".into(),
            level: Level::Node,
            value: 1,
            ts,
        });
        batch.basic_int.push(Basic {
            name: "mem_used".into(),
            level: Level::Node,
            value: 2,
            ts,
        });
        batch.device_float.push(Device {
            name: "gpu_power".into(),
            level: Level::Device,
            device: "0".into(),
            value: 80.0,
            ts,
        });
        batch.topology_float.push(Topology {
            name: "cpu_usage".into(),
            level: Level::Thread,
            thread: 0,
            core: 0,
            numa: 0,
            socket: 0,
            value: 25.0,
            ts,
        });
        batch
    }

    fn writer_with(sink: MockSink) -> Writer<MockSink> {
        Writer::new(
            sink,
            Arc::new(MeasurementQueue::default()),
            CancelFlag::new(),
            1,
            "node01".into(),
            Duration::from_millis(10),
        )
    }

    #[test]
    fn rows_are_grouped_by_table() {
        let sink = MockSink::default();
        let inserts = sink.inserts.clone();
        let mut writer = writer_with(sink);

        writer.send_batch(&sample_batch()).unwrap();

        let inserts = inserts.lock();
        assert_eq!(inserts.len(), 3);
        let mem = inserts.iter().find(|(t, _)| t == "mem_used").unwrap();
        assert_eq!(mem.1.lines().count(), 2);
        assert!(inserts.iter().any(|(t, _)| t == "gpu_power"));
        assert!(inserts.iter().any(|(t, _)| t == "cpu_usage"));
    }

    #[test]
    fn missing_table_is_skipped_not_fatal() {
        let sink = MockSink {
            missing_tables: vec!["gpu_power".into()],
            ..MockSink::default()
        };
        let inserts = sink.inserts.clone();
        let mut writer = writer_with(sink);

        writer.send_batch(&sample_batch()).unwrap();

        let inserts = inserts.lock();
        assert_eq!(inserts.len(), 2);
        assert!(!inserts.iter().any(|(t, _)| t == "gpu_power"));
    }

    #[test]
    fn fatal_error_latches_cancellation_and_drops_queue() {
        let queue = Arc::new(MeasurementQueue::default());
        let cancel = CancelFlag::new();
        let writer = Writer::new(
            MockSink {
                fatal: true,
                ..MockSink::default()
            },
            queue.clone(),
            cancel.clone(),
            1,
            "node01".into(),
            Duration::from_millis(10),
        );

        queue.push(crate::measurement::Record::BasicInt(Basic {
            name: "mem_used".into(),
            level: Level::Node,
            value: 1,
            ts: Utc::now(),
        }));

        let outcome = writer.run();
        assert_eq!(outcome, WriterOutcome::Fatal);
        assert!(cancel.is_canceled());
        assert!(!queue.has_data());
    }

    #[test]
    fn cancellation_ends_the_poll_loop() {
        let queue = Arc::new(MeasurementQueue::default());
        let cancel = CancelFlag::new();
        let writer = Writer::new(
            MockSink::default(),
            queue,
            cancel.clone(),
            1,
            "node01".into(),
            Duration::from_millis(10),
        );

        cancel.cancel();
        assert_eq!(writer.run(), WriterOutcome::Canceled);
    }

    #[test]
    fn poll_loop_delivers_queued_records() {
        let queue = Arc::new(MeasurementQueue::default());
        let cancel = CancelFlag::new();
        let sink = MockSink::default();
        let inserts = sink.inserts.clone();
        let writer = Writer::new(
            sink,
            queue.clone(),
            cancel.clone(),
            1,
            "node01".into(),
            Duration::from_millis(10),
        );
        let handle = std::thread::spawn(move || writer.run());

        queue.push(crate::measurement::Record::BasicInt(Basic {
            name: "mem_used".into(),
            level: Level::Node,
            value: 1,
            ts: Utc::now(),
        }));

        for _ in 0..100 {
            if !inserts.lock().is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!inserts.lock().is_empty());

        cancel.cancel();
        assert_eq!(handle.join().unwrap(), WriterOutcome::Canceled);
    }
}
