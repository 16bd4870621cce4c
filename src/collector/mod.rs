//! Collector base: per-collector lifecycle, interval synchronization,
//! heartbeat and cooperative termination.
//!
//! Every collector is one [`Sampler`] running on its own worker thread,
//! driven through a [`CollectorCore`] that owns the interval math. The
//! [`Collector`] handle is what the lifecycle controller and the watchdog
//! hold: it can start a worker, signal it to stop, or detach it when hung.
//!
//! Forced stop never joins: a worker blocked in an external syscall cannot
//! be interrupted without taking the process down, so the handle is dropped
//! and the worker leaks until process exit. Each `start()` hands the new
//! worker a fresh shared-state block, so a leaked worker can never update
//! the heartbeat or status of its replacement.

pub mod amd;
pub mod cpu;
pub mod disk;
pub mod ethernet;
pub mod fpga;
pub mod infiniband;
pub mod ipmi;
pub mod memory;
pub mod nvidia;
pub mod perfctr;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, error};
use parking_lot::Mutex;
use spin_sleep::{SpinSleeper, SpinStrategy};

use crate::error::CollectError;
use crate::measurement::Record;
use crate::queue::MeasurementQueue;

/// Sleep slice between cancellation checks.
const SLEEP_SLICE_MS: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorStatus {
    Running,
    /// Worker observed the terminate flag and returned.
    GracefullyTerminated,
    /// Worker was detached by the watchdog; eligible for revival.
    ForcefullyTerminated,
    /// Worker declared it cannot make progress; never revived.
    SelfTerminated,
}

const STATUS_RUNNING: u8 = 0;
const STATUS_GRACEFUL: u8 = 1;
const STATUS_FORCED: u8 = 2;
const STATUS_SELF: u8 = 3;

/// State shared between one worker incarnation and the control side.
struct WorkerShared {
    terminate: AtomicBool,
    /// Wall-clock milliseconds of the last completed interval.
    last_heartbeat: AtomicI64,
    status: AtomicU8,
}

impl WorkerShared {
    fn fresh(status: u8) -> Arc<Self> {
        Arc::new(Self {
            terminate: AtomicBool::new(false),
            last_heartbeat: AtomicI64::new(Utc::now().timestamp_millis()),
            status: AtomicU8::new(status),
        })
    }

    fn status(&self) -> CollectorStatus {
        match self.status.load(Ordering::Acquire) {
            STATUS_RUNNING => CollectorStatus::Running,
            STATUS_GRACEFUL => CollectorStatus::GracefullyTerminated,
            STATUS_FORCED => CollectorStatus::ForcefullyTerminated,
            _ => CollectorStatus::SelfTerminated,
        }
    }

    /// Record the worker's own exit status. Loses against a concurrent
    /// `force_stop`, so a detached worker that eventually returns cannot
    /// mask the forced termination.
    fn finish(&self, status: u8) {
        let _ = self.status.compare_exchange(
            STATUS_RUNNING,
            status,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

/// One measurement source. Implementations own their whole measurement
/// loop, driving `CollectorCore` for interval alignment and cancellation.
pub trait Sampler: Send {
    fn module(&self) -> &'static str;

    /// Run until cancellation. `Err` self-terminates the collector.
    fn measure(&mut self, core: &mut CollectorCore) -> Result<(), CollectError>;
}

/// Interval machinery handed to a sampler. One instance per worker
/// incarnation.
pub struct CollectorCore {
    module: &'static str,
    queue: Arc<MeasurementQueue>,
    shared: Arc<WorkerShared>,
    /// Interval duration in milliseconds.
    interval: i64,
    interval_start: DateTime<Utc>,
    interval_end: DateTime<Utc>,
    /// Time left for measurements in the current interval, milliseconds.
    time_left: i64,
    sleeper: SpinSleeper,
}

impl CollectorCore {
    fn new(
        module: &'static str,
        queue: Arc<MeasurementQueue>,
        shared: Arc<WorkerShared>,
        interval: i64,
        anchor: DateTime<Utc>,
    ) -> Self {
        Self {
            module,
            queue,
            shared,
            interval,
            interval_start: anchor,
            interval_end: anchor,
            time_left: interval,
            sleeper: SpinSleeper::new(100_000).with_spin_strategy(SpinStrategy::YieldThread),
        }
    }

    pub fn module(&self) -> &'static str {
        self.module
    }

    pub fn interval(&self) -> i64 {
        self.interval
    }

    /// End of the current interval; the timestamp every record of this
    /// interval carries.
    pub fn interval_end(&self) -> DateTime<Utc> {
        self.interval_end
    }

    pub fn time_left(&self) -> i64 {
        self.time_left
    }

    pub fn canceled(&self) -> bool {
        self.shared.terminate.load(Ordering::Acquire)
    }

    pub fn push(&self, record: impl Into<Record>) {
        self.queue.push(record);
    }

    pub fn push_many<I>(&self, records: I)
    where
        I: IntoIterator<Item = Record>,
    {
        self.queue.push_many(records);
    }

    /// Align the current interval to the nominal schedule.
    ///
    /// Steady-state intervals stay aligned to the original anchor; an
    /// overrun skips whole intervals instead of compressing the next one;
    /// a worker that ran early sleeps off the excess. Afterwards
    /// `time_left` is in (0, interval].
    pub fn synchronize_interval(&mut self) {
        let excess = self.synchronize_at(Utc::now());
        if excess > 0 {
            self.sleep_millis_and_check(excess);
        }
    }

    /// The clock-free part of [`synchronize_interval`]; returns how many
    /// milliseconds of early drift must be slept off.
    fn synchronize_at(&mut self, now: DateTime<Utc>) -> i64 {
        let minimum = self.interval / 4;
        self.interval_end = self.interval_start + TimeDelta::milliseconds(self.interval);

        let remaining = (self.interval_end - now).num_milliseconds();
        self.time_left = remaining;

        if remaining < minimum {
            // Fell behind: skip forward by whole intervals to keep the
            // schedule anchored.
            let catchup = remaining.abs();
            let remainder = catchup % self.interval;
            self.interval_end =
                self.interval_end + TimeDelta::milliseconds(catchup - remainder + self.interval);
            self.time_left = (self.interval_end - now).num_milliseconds();
        }

        let mut excess = 0;
        if self.time_left > self.interval {
            excess = self.time_left - self.interval;
            self.time_left = self.interval;
        }

        self.interval_start = self.interval_end + TimeDelta::milliseconds(self.interval);
        excess
    }

    /// Sleep until `interval_end`, observing cancellation.
    pub fn sleep_until_interval_end(&self) {
        let remaining = (self.interval_end - Utc::now()).num_milliseconds();
        if remaining <= 0 {
            return;
        }
        self.sleep_millis_and_check(remaining);
    }

    /// Sleep `sleep_left` milliseconds in slices, returning early when the
    /// terminate flag is set.
    pub fn sleep_millis_and_check(&self, mut sleep_left: i64) {
        while sleep_left > 0 && !self.canceled() {
            if sleep_left < SLEEP_SLICE_MS {
                self.sleeper.sleep(Duration::from_millis(sleep_left as u64));
                return;
            }
            self.sleeper.sleep(Duration::from_millis(SLEEP_SLICE_MS as u64));
            sleep_left -= SLEEP_SLICE_MS;
        }
    }

    /// Close out the current interval: advance the start anchor and refresh
    /// the heartbeat for the watchdog.
    pub fn interval_cleanup(&mut self) {
        self.interval_start = self.interval_end;
        self.shared
            .last_heartbeat
            .store(Utc::now().timestamp_millis(), Ordering::Release);
    }
}

#[cfg(test)]
pub(crate) fn test_core(
    module: &'static str,
    interval: i64,
    queue: Arc<MeasurementQueue>,
) -> CollectorCore {
    let mut core = CollectorCore::new(
        module,
        queue,
        WorkerShared::fresh(STATUS_RUNNING),
        interval,
        Utc::now(),
    );
    core.interval_end = core.interval_start + TimeDelta::milliseconds(interval);
    core
}

type SamplerFactory = Box<dyn Fn() -> Box<dyn Sampler> + Send + Sync>;

/// Control handle for one collector, held by the lifecycle controller and
/// inspected by the watchdog.
pub struct Collector {
    module: &'static str,
    interval: i64,
    anchor: DateTime<Utc>,
    queue: Arc<MeasurementQueue>,
    factory: SamplerFactory,
    shared: Mutex<Arc<WorkerShared>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Collector {
    pub fn new<S, F>(
        module: &'static str,
        interval: i64,
        anchor: DateTime<Utc>,
        queue: Arc<MeasurementQueue>,
        factory: F,
    ) -> Self
    where
        S: Sampler + 'static,
        F: Fn() -> S + Send + Sync + 'static,
    {
        Self {
            module,
            interval,
            anchor,
            queue,
            factory: Box::new(move || Box::new(factory())),
            // Inert until start(); never looks hung to the watchdog.
            shared: Mutex::new(WorkerShared::fresh(STATUS_GRACEFUL)),
            handle: Mutex::new(None),
        }
    }

    pub fn module(&self) -> &'static str {
        self.module
    }

    pub fn interval(&self) -> i64 {
        self.interval
    }

    pub fn status(&self) -> CollectorStatus {
        self.shared.lock().status()
    }

    /// Wall-clock milliseconds of the last completed interval.
    pub fn last_heartbeat_millis(&self) -> i64 {
        self.shared.lock().last_heartbeat.load(Ordering::Acquire)
    }

    /// Launch a worker for this collector. A previously force-stopped
    /// collector is revived with a fresh sampler and fresh shared state.
    pub fn start(&self) {
        let mut current = self.shared.lock();
        if current.status() == CollectorStatus::Running {
            return;
        }

        let shared = WorkerShared::fresh(STATUS_RUNNING);
        *current = shared.clone();
        drop(current);

        let sampler = (self.factory)();
        let core = CollectorCore::new(
            self.module,
            self.queue.clone(),
            shared.clone(),
            self.interval,
            self.anchor,
        );

        let spawned = thread::Builder::new()
            .name(self.module.to_lowercase())
            .spawn(move || run_worker(sampler, core));

        match spawned {
            Ok(handle) => {
                *self.handle.lock() = Some(handle);
            }
            Err(e) => {
                error!(target: self.module, "failed to spawn worker: {e}");
                shared.status.store(STATUS_SELF, Ordering::Release);
            }
        }
    }

    /// Signal the worker to stop at its next cancellation check. Idempotent.
    pub fn stop(&self) {
        self.shared.lock().terminate.store(true, Ordering::Release);
    }

    /// Detach a presumably hung worker without joining it. The worker may
    /// eventually return on its own; nobody waits for it.
    pub fn force_stop(&self) {
        error!(target: self.module, "forcefully stopping hung worker");
        let shared = self.shared.lock();
        shared.terminate.store(true, Ordering::Release);
        shared.status.store(STATUS_FORCED, Ordering::Release);
        drop(shared);
        *self.handle.lock() = None;
    }

    /// Join the worker if one is still attached. Only meaningful once
    /// `status()` reports non-running.
    pub fn join(&self) {
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

fn run_worker(mut sampler: Box<dyn Sampler>, mut core: CollectorCore) {
    let module = core.module;
    debug!(target: module, "measurement worker started (interval {} ms)", core.interval);

    match sampler.measure(&mut core) {
        Ok(()) => {
            debug!(target: module, "measurement worker stopped");
            core.shared.finish(STATUS_GRACEFUL);
        }
        Err(e) => {
            error!(target: module, "measurements stopped: {e}");
            core.shared.finish(STATUS_SELF);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_core(interval: i64, anchor: DateTime<Utc>) -> CollectorCore {
        CollectorCore::new(
            "Test",
            Arc::new(MeasurementQueue::default()),
            WorkerShared::fresh(STATUS_RUNNING),
            interval,
            anchor,
        )
    }

    #[test]
    fn steady_state_keeps_anchor_alignment() {
        let anchor = Utc::now();
        let mut core = test_core(1000, anchor);

        let excess = core.synchronize_at(anchor);
        assert_eq!(excess, 0);
        assert_eq!(core.interval_end, anchor + TimeDelta::milliseconds(1000));
        assert_eq!(core.time_left, 1000);

        // next iteration, on schedule
        core.interval_cleanup();
        let excess = core.synchronize_at(anchor + TimeDelta::milliseconds(1000));
        assert_eq!(excess, 0);
        assert_eq!(core.interval_end, anchor + TimeDelta::milliseconds(2000));
    }

    #[test]
    fn overrun_skips_whole_intervals() {
        let anchor = Utc::now();
        let mut core = test_core(1000, anchor);

        // 2500 ms late: remaining = -1500, catch up to the next boundary
        let excess = core.synchronize_at(anchor + TimeDelta::milliseconds(2500));
        assert_eq!(excess, 0);
        assert_eq!(core.interval_end, anchor + TimeDelta::milliseconds(3000));
        assert_eq!(core.time_left, 500);

        // end stays a whole multiple of the interval past the anchor
        let offset = (core.interval_end - anchor).num_milliseconds();
        assert_eq!(offset % 1000, 0);
    }

    #[test]
    fn slightly_late_wakeup_within_minimum_also_catches_up() {
        let anchor = Utc::now();
        let mut core = test_core(1000, anchor);

        // 800 ms into the interval: remaining 200 < minimum 250, so the
        // current slot is skipped and the 200 ms of drift become sleep
        let excess = core.synchronize_at(anchor + TimeDelta::milliseconds(800));
        assert_eq!(core.interval_end, anchor + TimeDelta::milliseconds(2000));
        assert_eq!(excess, 200);
        assert_eq!(core.time_left, 1000);
    }

    #[test]
    fn early_wakeup_sleeps_off_the_excess() {
        let anchor = Utc::now();
        let mut core = test_core(1000, anchor);

        // woke 1600 ms before interval_end
        let excess = core.synchronize_at(anchor - TimeDelta::milliseconds(600));
        assert_eq!(excess, 600);
        assert_eq!(core.time_left, 1000);
    }

    #[test]
    fn cleanup_advances_start_and_heartbeat() {
        let anchor = Utc::now();
        let mut core = test_core(1000, anchor);
        core.synchronize_at(anchor);

        let before = core.shared.last_heartbeat.load(Ordering::Acquire);
        std::thread::sleep(Duration::from_millis(20));
        core.interval_cleanup();

        assert_eq!(core.interval_start, core.interval_end);
        assert!(core.shared.last_heartbeat.load(Ordering::Acquire) > before);
    }

    struct LoopSampler;

    impl Sampler for LoopSampler {
        fn module(&self) -> &'static str {
            "Loop"
        }

        fn measure(&mut self, core: &mut CollectorCore) -> Result<(), CollectError> {
            while !core.canceled() {
                thread::sleep(Duration::from_millis(5));
            }
            Ok(())
        }
    }

    struct FailingSampler;

    impl Sampler for FailingSampler {
        fn module(&self) -> &'static str {
            "Failing"
        }

        fn measure(&mut self, _core: &mut CollectorCore) -> Result<(), CollectError> {
            Err(CollectError::Unavailable("no such hardware".into()))
        }
    }

    struct HangingSampler;

    impl Sampler for HangingSampler {
        fn module(&self) -> &'static str {
            "Hanging"
        }

        fn measure(&mut self, _core: &mut CollectorCore) -> Result<(), CollectError> {
            // ignores cancellation, like a stuck external tool
            thread::sleep(Duration::from_secs(30));
            Ok(())
        }
    }

    fn wait_for_status(collector: &Collector, status: CollectorStatus) {
        for _ in 0..200 {
            if collector.status() == status {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("collector never reached {status:?}");
    }

    #[test]
    fn stop_terminates_gracefully() {
        let queue = Arc::new(MeasurementQueue::default());
        let collector = Collector::new("Loop", 100, Utc::now(), queue, || LoopSampler);

        collector.start();
        assert_eq!(collector.status(), CollectorStatus::Running);

        collector.stop();
        collector.stop();
        wait_for_status(&collector, CollectorStatus::GracefullyTerminated);
        collector.join();
    }

    #[test]
    fn failing_sampler_self_terminates() {
        let queue = Arc::new(MeasurementQueue::default());
        let collector = Collector::new("Failing", 100, Utc::now(), queue, || FailingSampler);

        collector.start();
        wait_for_status(&collector, CollectorStatus::SelfTerminated);
        collector.join();
    }

    #[test]
    fn force_stop_detaches_and_allows_revival() {
        let queue = Arc::new(MeasurementQueue::default());
        let collector = Collector::new("Hanging", 100, Utc::now(), queue, || HangingSampler);

        collector.start();
        thread::sleep(Duration::from_millis(50));

        collector.force_stop();
        assert_eq!(collector.status(), CollectorStatus::ForcefullyTerminated);

        // revival runs a fresh worker with fresh state
        collector.start();
        assert_eq!(collector.status(), CollectorStatus::Running);
        collector.force_stop();
    }

    #[test]
    fn detached_worker_cannot_mask_forced_termination() {
        let shared = WorkerShared::fresh(STATUS_RUNNING);
        shared.status.store(STATUS_FORCED, Ordering::Release);
        // zombie worker returning after the watchdog detached it
        shared.finish(STATUS_GRACEFUL);
        assert_eq!(shared.status(), CollectorStatus::ForcefullyTerminated);
    }
}
