//! External tool invocation and small parsing helpers.
//!
//! Every tool the daemon shells out to (iostat, ipmitool, nvidia-smi,
//! rocm-smi, lspci, likwid-*) runs under a hard timeout; a tool that
//! overruns is killed and reported as a failure instead of wedging the
//! calling collector.

use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::CollectError;

const POLL_STEP: Duration = Duration::from_millis(25);

/// Run `program` with `args`, capturing stdout. Kills the child when
/// `timeout` elapses.
pub fn run_with_timeout(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<String, CollectError> {
    let cmd = display_command(program, args);

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| CollectError::Tool {
            cmd: cmd.clone(),
            reason: e.to_string(),
        })?;

    // Drain both pipes from their own threads so a chatty child cannot
    // deadlock on a full pipe while we poll for exit.
    let stdout_reader = spawn_pipe_reader(child.stdout.take());
    let stderr_reader = spawn_pipe_reader(child.stderr.take());

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = stdout_reader.join();
                    let _ = stderr_reader.join();
                    return Err(CollectError::Tool {
                        cmd,
                        reason: format!("timed out after {} ms", timeout.as_millis()),
                    });
                }
                thread::sleep(POLL_STEP);
            }
            Err(e) => {
                return Err(CollectError::Tool {
                    cmd,
                    reason: e.to_string(),
                });
            }
        }
    };

    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = stderr_reader.join().unwrap_or_default();

    if !status.success() {
        let reason = if stderr.trim().is_empty() {
            format!("exited with {status}")
        } else {
            format!("exited with {status}: {}", first_line(&stderr))
        };
        return Err(CollectError::Tool { cmd, reason });
    }

    Ok(stdout)
}

fn spawn_pipe_reader<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut buf);
        }
        buf
    })
}

fn display_command(program: &str, args: &[&str]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or("").trim()
}

/// Extract the first number from a string, e.g. `" 212 Watts"` -> `"212"`.
pub fn extract_number(s: &str, allow_float: bool) -> Option<String> {
    let mut out = String::new();
    let mut seen_digit = false;
    let mut seen_dot = false;
    for c in s.chars() {
        if c.is_ascii_digit() {
            out.push(c);
            seen_digit = true;
        } else if c == '.' && allow_float && seen_digit && !seen_dot {
            out.push(c);
            seen_dot = true;
        } else if seen_digit {
            break;
        }
    }
    // a trailing dot is not part of the number
    if out.ends_with('.') {
        out.pop();
    }
    if seen_digit { Some(out) } else { None }
}

/// Interval length in seconds as a float. Sub-second intervals divide
/// correctly; the integer-seconds form of the original would yield zero.
pub fn interval_seconds(interval_ms: i64) -> f64 {
    interval_ms as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_integer_and_float() {
        assert_eq!(extract_number(" 212 Watts", false).as_deref(), Some("212"));
        assert_eq!(
            extract_number("MFlops/s: 1234.56 time", true).as_deref(),
            Some("1234.56")
        );
        assert_eq!(
            extract_number("value 3.5.1 trailing", true).as_deref(),
            Some("3.5")
        );
        assert_eq!(extract_number("no digits here", true), None);
    }

    #[test]
    fn sub_second_interval_stays_nonzero() {
        assert_eq!(interval_seconds(500), 0.5);
        assert_eq!(interval_seconds(10_000), 10.0);
    }

    #[test]
    fn timeout_kills_runaway_tool() {
        let start = Instant::now();
        let err = run_with_timeout("sleep", &["5"], Duration::from_millis(100)).unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(2));
        match err {
            CollectError::Tool { reason, .. } => assert!(reason.contains("timed out")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn captures_stdout_of_quick_tool() {
        let out = run_with_timeout("echo", &["hello"], Duration::from_secs(5)).unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[test]
    fn missing_tool_is_reported() {
        assert!(
            run_with_timeout("definitely-not-a-tool-xbatd", &[], Duration::from_secs(1)).is_err()
        );
    }
}
