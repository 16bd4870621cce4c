//! Schema-partitioned measurement queue between collectors and the writer.
//!
//! Six segregated FIFO sequences, one per (family × value type) pair, behind
//! a single mutex and a single condition variable. The write rate is modest
//! (a few thousand records per interval, intervals ≥ 1 s) and the writer
//! drains everything in one call, so one lock beats lock-free machinery.
//!
//! There is no back-pressure on producers; a stalling writer is fatal by
//! policy. A configurable high-water mark bounds memory in the window
//! between stall and shutdown by dropping all buffered records.

use std::time::Duration;

use log::warn;
use parking_lot::{Condvar, Mutex};

use crate::measurement::{Basic, Device, Record, Topology};

const MODULE: &str = "Queue";

/// All six sequences, moved out of the queue in one transfer.
#[derive(Debug, Default)]
pub struct Batch {
    pub basic_int: Vec<Basic<i64>>,
    pub basic_float: Vec<Basic<f64>>,
    pub device_int: Vec<Device<i64>>,
    pub device_float: Vec<Device<f64>>,
    pub topology_int: Vec<Topology<i64>>,
    pub topology_float: Vec<Topology<f64>>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.basic_int.is_empty()
            && self.basic_float.is_empty()
            && self.device_int.is_empty()
            && self.device_float.is_empty()
            && self.topology_int.is_empty()
            && self.topology_float.is_empty()
    }

    pub fn len(&self) -> usize {
        self.basic_int.len()
            + self.basic_float.len()
            + self.device_int.len()
            + self.device_float.len()
            + self.topology_int.len()
            + self.topology_float.len()
    }

    fn push(&mut self, record: Record) {
        match record {
            Record::BasicInt(r) => self.basic_int.push(r),
            Record::BasicFloat(r) => self.basic_float.push(r),
            Record::DeviceInt(r) => self.device_int.push(r),
            Record::DeviceFloat(r) => self.device_float.push(r),
            Record::TopologyInt(r) => self.topology_int.push(r),
            Record::TopologyFloat(r) => self.topology_float.push(r),
        }
    }
}

pub struct MeasurementQueue {
    state: Mutex<Batch>,
    data_available: Condvar,
    /// Total record count above which the queue drops everything. 0 disables.
    high_water: usize,
}

impl Default for MeasurementQueue {
    fn default() -> Self {
        Self::new(0)
    }
}

impl MeasurementQueue {
    pub fn new(high_water: usize) -> Self {
        Self {
            state: Mutex::new(Batch::default()),
            data_available: Condvar::new(),
            high_water,
        }
    }

    /// Append one record. Infallible. Wakes at most one waiter if the queue
    /// was empty.
    pub fn push(&self, record: impl Into<Record>) {
        self.push_many(std::iter::once(record.into()));
    }

    /// Append a batch of records under a single lock acquisition.
    pub fn push_many<I>(&self, records: I)
    where
        I: IntoIterator<Item = Record>,
    {
        let mut state = self.state.lock();
        let was_empty = state.is_empty();
        for record in records {
            state.push(record);
        }

        if self.high_water > 0 && state.len() > self.high_water {
            let dropped = state.len();
            *state = Batch::default();
            drop(state);
            warn!(
                target: MODULE,
                "high-water mark of {} records exceeded - dropped {} buffered records",
                self.high_water, dropped
            );
            return;
        }

        let now_has_data = !state.is_empty();
        drop(state);
        if was_empty && now_has_data {
            self.data_available.notify_one();
        }
    }

    /// Atomically transfer all six sequences to the caller. If the queue is
    /// empty, wait up to `timeout` (`None` waits indefinitely). Returns
    /// `None` when no data arrived within the timeout.
    pub fn drain_all(&self, timeout: Option<Duration>) -> Option<Batch> {
        let mut state = self.state.lock();
        match timeout {
            None => {
                while state.is_empty() {
                    self.data_available.wait(&mut state);
                }
            }
            Some(timeout) => {
                if state.is_empty() {
                    let _ = self.data_available.wait_for(&mut state, timeout);
                    if state.is_empty() {
                        return None;
                    }
                }
            }
        }
        Some(std::mem::take(&mut *state))
    }

    /// Non-blocking transfer; the writer's poll loop uses this.
    pub fn try_drain(&self) -> Option<Batch> {
        let mut state = self.state.lock();
        if state.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut *state))
    }

    /// Discard everything. Used on fatal writer errors so the queue does not
    /// grow during shutdown.
    pub fn drop_all(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.len();
        *state = Batch::default();
        dropped
    }

    pub fn has_data(&self) -> bool {
        !self.state.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::Level;
    use chrono::Utc;
    use std::sync::Arc;
    use std::thread;

    fn basic_int(name: &str, value: i64) -> Record {
        Basic {
            name: name.to_string(),
            level: Level::Node,
            value,
            ts: Utc::now(),
        }
        .into()
    }

    fn topo_float(name: &str, thread: u16, value: f64) -> Record {
        Topology {
            name: name.to_string(),
            level: Level::Thread,
            thread,
            core: 0,
            numa: 0,
            socket: 0,
            value,
            ts: Utc::now(),
        }
        .into()
    }

    #[test]
    fn drain_preserves_per_family_fifo_order() {
        let queue = MeasurementQueue::default();
        queue.push_many(vec![
            basic_int("a", 1),
            topo_float("cpu_usage", 0, 10.0),
            basic_int("a", 2),
            topo_float("cpu_usage", 1, 20.0),
        ]);

        let batch = queue.try_drain().unwrap();
        let ints: Vec<i64> = batch.basic_int.iter().map(|r| r.value).collect();
        let threads: Vec<u16> = batch.topology_float.iter().map(|r| r.thread).collect();
        assert_eq!(ints, vec![1, 2]);
        assert_eq!(threads, vec![0, 1]);
        assert!(!queue.has_data());
    }

    #[test]
    fn try_drain_on_empty_queue_returns_none() {
        let queue = MeasurementQueue::default();
        assert!(queue.try_drain().is_none());
    }

    #[test]
    fn timed_drain_reports_timeout() {
        let queue = MeasurementQueue::default();
        let start = std::time::Instant::now();
        assert!(queue.drain_all(Some(Duration::from_millis(50))).is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn blocking_drain_is_woken_by_push() {
        let queue = Arc::new(MeasurementQueue::default());
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                queue.push(basic_int("late", 7));
            })
        };

        let batch = queue.drain_all(None).unwrap();
        assert_eq!(batch.basic_int[0].value, 7);
        producer.join().unwrap();
    }

    #[test]
    fn drop_all_discards_everything() {
        let queue = MeasurementQueue::default();
        queue.push_many(vec![basic_int("a", 1), basic_int("b", 2)]);
        assert_eq!(queue.drop_all(), 2);
        assert!(!queue.has_data());
    }

    #[test]
    fn high_water_mark_drops_buffered_records() {
        let queue = MeasurementQueue::new(3);
        queue.push_many((0..4).map(|i| basic_int("flood", i)));
        assert!(!queue.has_data());
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        let queue = Arc::new(MeasurementQueue::default());
        let mut handles = Vec::new();
        for p in 0..4 {
            let queue = queue.clone();
            handles.push(thread::spawn(move || {
                for i in 0..100 {
                    queue.push(basic_int("load", (p * 100 + i) as i64));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let batch = queue.try_drain().unwrap();
        assert_eq!(batch.basic_int.len(), 400);
    }
}
