//! Twin-sink logger behind the `log` facade.
//!
//! Console and `/var/log/xbatd/xbatd.log` with independently configured
//! severities. Collectors tag their records via `log` targets, e.g.
//! `info!(target: "CPU", ...)`, which lands as the module column of the
//! log line.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use chrono::Local;
use log::{Level, LevelFilter, Metadata};
use parking_lot::Mutex;

struct DaemonLogger {
    console_level: LevelFilter,
    file_level: LevelFilter,
    file: Option<Mutex<File>>,
}

impl DaemonLogger {
    fn format(record: &log::Record) -> String {
        format!(
            "[{}][{}][{}]: {}",
            Local::now().format("%Y-%m-%d, %H:%M:%S%.3f"),
            level_name(record.level()),
            record.target(),
            record.args()
        )
    }
}

fn level_name(level: Level) -> &'static str {
    match level {
        Level::Error => "error",
        Level::Warn => "warning",
        Level::Info => "info",
        Level::Debug => "debug",
        Level::Trace => "trace",
    }
}

impl log::Log for DaemonLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.console_level || metadata.level() <= self.file_level
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = Self::format(record);

        if record.level() <= self.console_level {
            println!("{line}");
        }

        if record.level() <= self.file_level {
            if let Some(file) = &self.file {
                let mut file = file.lock();
                let _ = writeln!(file, "{line}");
                let _ = file.flush();
            }
        }
    }

    fn flush(&self) {
        if let Some(file) = &self.file {
            let _ = file.lock().flush();
        }
    }
}

/// Install the process-wide logger. The file sink is best-effort: when the
/// log directory cannot be created the daemon keeps running console-only.
pub fn init(
    console_level: LevelFilter,
    file_level: LevelFilter,
    log_path: &str,
) -> Result<(), log::SetLoggerError> {
    let file = open_log_file(log_path);
    if file.is_none() {
        eprintln!("xbatd: cannot open {log_path}, logging to console only");
    }

    let logger = DaemonLogger {
        console_level,
        file_level,
        file: file.map(Mutex::new),
    };

    log::set_boxed_logger(Box::new(logger))?;
    log::set_max_level(console_level.max(file_level));
    Ok(())
}

fn open_log_file(path: &str) -> Option<File> {
    let path = Path::new(path);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).ok()?;
    }
    OpenOptions::new().create(true).append(true).open(path).ok()
}
