//! Watchdog: detects hung collectors and revives forcefully stopped ones.
//!
//! A collector counts as hung when its heartbeat is older than two full
//! intervals. Hung workers are detached (never joined); the replacement
//! starts on the next tick. Self-terminated collectors are left alone -
//! they declared that retries are pointless - and gracefully terminated
//! ones shut down on purpose.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::debug;

use crate::cancel::CancelFlag;
use crate::collector::{Collector, CollectorStatus};

const MODULE: &str = "Watchdog";

/// Tick between inspections.
pub const WATCHDOG_TICK: Duration = Duration::from_secs(3);

pub fn run(collectors: &[Arc<Collector>], cancel: &CancelFlag, tick: Duration) {
    debug!(target: MODULE, "watching {} collectors", collectors.len());
    while !cancel.is_canceled() {
        inspect(collectors);
        std::thread::sleep(tick);
    }
    debug!(target: MODULE, "stopped");
}

/// One inspection pass over all collectors.
pub(crate) fn inspect(collectors: &[Arc<Collector>]) {
    let now = Utc::now().timestamp_millis();
    for collector in collectors {
        let elapsed_ms = now - collector.last_heartbeat_millis();
        let timed_out = elapsed_ms > 2 * collector.interval();

        match collector.status() {
            CollectorStatus::Running if timed_out => {
                collector.force_stop();
            }
            CollectorStatus::ForcefullyTerminated => {
                // revived one tick after the kill
                collector.start();
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{CollectorCore, Sampler};
    use crate::error::CollectError;
    use crate::queue::MeasurementQueue;

    struct HangingSampler;

    impl Sampler for HangingSampler {
        fn module(&self) -> &'static str {
            "Hanging"
        }

        fn measure(&mut self, _core: &mut CollectorCore) -> Result<(), CollectError> {
            std::thread::sleep(Duration::from_secs(60));
            Ok(())
        }
    }

    struct HealthySampler;

    impl Sampler for HealthySampler {
        fn module(&self) -> &'static str {
            "Healthy"
        }

        fn measure(&mut self, core: &mut CollectorCore) -> Result<(), CollectError> {
            while !core.canceled() {
                core.interval_cleanup();
                std::thread::sleep(Duration::from_millis(10));
            }
            Ok(())
        }
    }

    struct BrokenSampler;

    impl Sampler for BrokenSampler {
        fn module(&self) -> &'static str {
            "Broken"
        }

        fn measure(&mut self, _core: &mut CollectorCore) -> Result<(), CollectError> {
            Err(CollectError::Unavailable("gone".into()))
        }
    }

    fn collector<S: Sampler + 'static>(
        interval: i64,
        factory: impl Fn() -> S + Send + Sync + 'static,
    ) -> Arc<Collector> {
        Arc::new(Collector::new(
            "Test",
            interval,
            Utc::now(),
            Arc::new(MeasurementQueue::default()),
            factory,
        ))
    }

    #[test]
    fn hung_collector_is_force_stopped_then_revived() {
        // 100 ms interval: hang detection after ~200 ms without heartbeat
        let hung = collector(100, || HangingSampler);
        hung.start();

        std::thread::sleep(Duration::from_millis(300));
        inspect(std::slice::from_ref(&hung));
        assert_eq!(hung.status(), CollectorStatus::ForcefullyTerminated);

        inspect(std::slice::from_ref(&hung));
        assert_eq!(hung.status(), CollectorStatus::Running);

        hung.force_stop();
    }

    #[test]
    fn healthy_collector_is_left_running() {
        let healthy = collector(60_000, || HealthySampler);
        healthy.start();
        std::thread::sleep(Duration::from_millis(50));

        inspect(std::slice::from_ref(&healthy));
        assert_eq!(healthy.status(), CollectorStatus::Running);

        healthy.stop();
        healthy.join();
    }

    #[test]
    fn self_terminated_collector_is_not_revived() {
        let broken = collector(100, || BrokenSampler);
        broken.start();

        for _ in 0..100 {
            if broken.status() == CollectorStatus::SelfTerminated {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(broken.status(), CollectorStatus::SelfTerminated);

        std::thread::sleep(Duration::from_millis(300));
        inspect(std::slice::from_ref(&broken));
        assert_eq!(broken.status(), CollectorStatus::SelfTerminated);
        broken.join();
    }

    #[test]
    fn run_exits_on_cancellation() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        run(&[], &cancel, Duration::from_millis(10));
    }
}
