//! Engine lifecycle: bring-up, drain order, shutdown.
//!
//! Launches the writer, the watchdog and every applicable collector, then
//! blocks until the writer exits - which it does once cancellation is
//! latched, either cooperatively (signal, job end) or by a fatal database
//! error. Shutdown then stops collectors cooperatively and polls their
//! statuses until none is running; forcefully stopped workers stay
//! detached and are not waited for.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use log::{debug, error, info};

use crate::cancel::CancelFlag;
use crate::clickhouse::ClickHouseClient;
use crate::collector::{
    Collector, CollectorStatus, amd::AmdGpuSampler, cpu::CpuStatSampler, disk::IoStatSampler,
    ethernet::EthernetSampler, fpga::XilinxSampler, infiniband::InfinibandSampler,
    ipmi::IpmiSampler, memory::MemUsageSampler, nvidia::NvidiaSampler, perfctr::PerfctrSampler,
};
use crate::config::{Config, METRICS_DICTIONARY_PATH};
use crate::queue::MeasurementQueue;
use crate::topology::CpuTopology;
use crate::util::run_with_timeout;
use crate::watchdog;
use crate::writer::{QUEUE_POLL_INTERVAL, Writer, WriterOutcome};

const MODULE: &str = "Lifecycle";

/// Queue records buffered beyond this are dropped with a warning; the
/// writer normally drains far below it.
const QUEUE_HIGH_WATER: usize = 1_000_000;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub job_id: u32,
    pub hostname: String,
    /// Sampling interval in milliseconds.
    pub interval_ms: i64,
    pub enable_likwid: bool,
}

/// Run the collection engine until shutdown. Returns how the writer ended,
/// which decides the process exit code.
pub fn run(
    config: &Config,
    settings: &EngineSettings,
    topology: Arc<CpuTopology>,
    cancel: CancelFlag,
) -> WriterOutcome {
    let anchor = job_start_time(settings.job_id);
    let queue = Arc::new(MeasurementQueue::new(QUEUE_HIGH_WATER));

    let writer_handle = {
        let clickhouse = config.clickhouse.clone();
        let queue = queue.clone();
        let cancel = cancel.clone();
        let job_id = settings.job_id;
        let hostname = settings.hostname.clone();
        thread::spawn(move || match ClickHouseClient::connect(&clickhouse) {
            Ok(client) => {
                Writer::new(client, queue, cancel, job_id, hostname, QUEUE_POLL_INTERVAL).run()
            }
            Err(e) => {
                error!(target: "DbWriter", "cannot connect to ClickHouse - {e}");
                cancel.cancel();
                WriterOutcome::Fatal
            }
        })
    };

    let collectors = build_collectors(settings, &topology, &queue, anchor);

    let watchdog_handle = {
        let collectors = collectors.clone();
        let cancel = cancel.clone();
        thread::spawn(move || watchdog::run(&collectors, &cancel, watchdog::WATCHDOG_TICK))
    };

    for collector in &collectors {
        collector.start();
    }
    info!(target: MODULE, "started {} collectors (interval {} ms)", collectors.len(), settings.interval_ms);

    // the writer is the shutdown trigger: it exits on cancellation or on a
    // fatal database error (after latching cancellation itself)
    let outcome = writer_handle.join().unwrap_or_else(|_| {
        error!(target: MODULE, "writer worker panicked");
        cancel.cancel();
        WriterOutcome::Fatal
    });

    for collector in &collectors {
        collector.stop();
    }
    let _ = watchdog_handle.join();

    while !all_terminated(&collectors) {
        thread::sleep(Duration::from_secs(1));
    }
    for collector in &collectors {
        collector.join();
    }

    info!(target: MODULE, "all collectors terminated");
    outcome
}

fn all_terminated(collectors: &[Arc<Collector>]) -> bool {
    collectors
        .iter()
        .all(|c| c.status() != CollectorStatus::Running)
}

fn build_collectors(
    settings: &EngineSettings,
    topology: &Arc<CpuTopology>,
    queue: &Arc<MeasurementQueue>,
    anchor: DateTime<Utc>,
) -> Vec<Arc<Collector>> {
    let interval = settings.interval_ms;
    let mut collectors: Vec<Arc<Collector>> = Vec::new();

    let mut add = |collector: Collector| {
        debug!(target: MODULE, "registering collector {}", collector.module());
        collectors.push(Arc::new(collector));
    };

    if settings.enable_likwid {
        let topo = topology.clone();
        add(
            Collector::new("LIKWID", interval, anchor, queue.clone(), move || {
                PerfctrSampler::new(topo.clone(), METRICS_DICTIONARY_PATH)
            }),
        );
    }

    let topo = topology.clone();
    add(
        Collector::new("CPU", interval, anchor, queue.clone(), move || {
            CpuStatSampler::new(topo.clone())
        }),
    );
    add(
        Collector::new("Ethernet", interval, anchor, queue.clone(), EthernetSampler::default),
    );
    add(
        Collector::new("Infiniband", interval, anchor, queue.clone(), InfinibandSampler::default),
    );
    add(
        Collector::new("Disk", interval, anchor, queue.clone(), IoStatSampler::default),
    );
    add(
        Collector::new("IPMI", interval, anchor, queue.clone(), IpmiSampler::default),
    );
    add(
        Collector::new("Memory", interval, anchor, queue.clone(), MemUsageSampler::default),
    );
    add(
        Collector::new("XilinxFPGA", interval, anchor, queue.clone(), XilinxSampler::default),
    );
    add(
        Collector::new("nvidiaGPU", interval, anchor, queue.clone(), NvidiaSampler::default),
    );
    add(
        Collector::new("amdGPU", interval, anchor, queue.clone(), AmdGpuSampler::default),
    );

    collectors
}

/// The job's scheduler start time is the common interval anchor across all
/// nodes of the job; without the scheduler the anchor is simply now.
fn job_start_time(job_id: u32) -> DateTime<Utc> {
    match run_with_timeout(
        "scontrol",
        &["show", "job", &job_id.to_string()],
        Duration::from_secs(10),
    ) {
        Ok(output) => match parse_scontrol_start_time(&output) {
            Some(naive) => match Local.from_local_datetime(&naive).single() {
                Some(local) => local.with_timezone(&Utc),
                None => Utc::now(),
            },
            None => {
                debug!(target: MODULE, "no StartTime in scontrol output, using current time");
                Utc::now()
            }
        },
        Err(e) => {
            debug!(target: MODULE, "scontrol unavailable ({e}), using current time");
            Utc::now()
        }
    }
}

/// Find `StartTime=YYYY-MM-DDTHH:MM:SS` in `scontrol show job` output.
pub fn parse_scontrol_start_time(output: &str) -> Option<NaiveDateTime> {
    for token in output.split_whitespace() {
        if let Some(value) = token.strip_prefix("StartTime=") {
            return NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S").ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    const SCONTROL: &str = "\
JobId=4242 JobName=lulesh
   UserId=user(1000) GroupId=user(1000) MCS_label=N/A
   Priority=4294901728 Nice=0 Account=hpc QOS=normal
   JobState=RUNNING Reason=None Dependency=(null)
   RunTime=00:00:12 TimeLimit=01:00:00 TimeMin=N/A
   StartTime=2026-07-30T09:15:00 EndTime=2026-07-30T10:15:00 Deadline=N/A
";

    #[test]
    fn start_time_is_parsed_from_scontrol() {
        let start = parse_scontrol_start_time(SCONTROL).unwrap();
        assert_eq!(start.year(), 2026);
        assert_eq!(start.month(), 7);
        assert_eq!(start.hour(), 9);
        assert_eq!(start.minute(), 15);
    }

    #[test]
    fn missing_start_time_yields_none() {
        assert_eq!(parse_scontrol_start_time("JobId=1 JobState=PENDING"), None);
    }

    #[test]
    fn collector_roster_honors_likwid_flag() {
        let topology = Arc::new(CpuTopology::default());
        let queue = Arc::new(MeasurementQueue::default());
        let mut settings = EngineSettings {
            job_id: 1,
            hostname: "node01".into(),
            interval_ms: 5000,
            enable_likwid: false,
        };

        let without = build_collectors(&settings, &topology, &queue, Utc::now());
        assert_eq!(without.len(), 9);
        assert!(!without.iter().any(|c| c.module() == "LIKWID"));

        settings.enable_likwid = true;
        let with = build_collectors(&settings, &topology, &queue, Utc::now());
        assert_eq!(with.len(), 10);
        assert_eq!(with[0].module(), "LIKWID");
    }
}
