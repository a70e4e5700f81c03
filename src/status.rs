//! Job status reporting.
//!
//! `folio status` prints a job's progress once, or follows it until the job
//! reaches a terminal state. While following, intermediate updates are
//! emitted on **stderr** so stdout stays parseable for scripts; the caller
//! prints the final state to stdout.

use std::io::Write;
use std::time::Duration;

use crate::error::Result;
use crate::models::{JobProgress, JobStatus};
use crate::runtime::Services;

/// Reports progress updates while following a job. Implementations write to
/// stderr (human or JSON).
pub trait StatusReporter: Send + Sync {
    fn report(&self, job_id: &str, progress: &JobProgress);
}

/// Human-friendly updates: "job alice_42  processing  3 / 12 files".
pub struct StderrStatus;

impl StatusReporter for StderrStatus {
    fn report(&self, job_id: &str, progress: &JobProgress) {
        let mut line = format!(
            "job {}  {}  {} / {} files",
            job_id,
            progress.status.as_str(),
            format_number(progress.processed.max(0) as u64),
            format_number(progress.total.max(0) as u64),
        );
        if !progress.message.is_empty() {
            line.push_str("  (");
            line.push_str(&progress.message);
            line.push(')');
        }
        line.push('\n');
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable updates: one JSON object per line on stderr.
pub struct JsonStatus;

impl StatusReporter for JsonStatus {
    fn report(&self, job_id: &str, progress: &JobProgress) {
        let obj = serde_json::json!({
            "event": "status",
            "job": job_id,
            "status": progress.status.as_str(),
            "processed": progress.processed,
            "total": progress.total,
            "message": progress.message,
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when following quietly.
pub struct NoStatus;

impl StatusReporter for NoStatus {
    fn report(&self, _job_id: &str, _progress: &JobProgress) {}
}

/// Reporter mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StatusMode {
    Off,
    Human,
    Json,
}

impl StatusMode {
    /// Default: human updates when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            StatusMode::Human
        } else {
            StatusMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn StatusReporter> {
        match self {
            StatusMode::Off => Box::new(NoStatus),
            StatusMode::Human => Box::new(StderrStatus),
            StatusMode::Json => Box::new(JsonStatus),
        }
    }
}

/// Fetch a job's progress, optionally polling until it leaves `processing`.
/// Returns `None` when the job is unknown or its record has expired.
pub async fn watch_job(
    services: &Services,
    job_id: &str,
    follow: bool,
    reporter: &dyn StatusReporter,
) -> Result<Option<JobProgress>> {
    let interval = Duration::from_millis(services.config.queue.poll_interval_ms);
    loop {
        let Some(progress) = services.progress.get_progress(job_id).await? else {
            return Ok(None);
        };
        if !follow {
            return Ok(Some(progress));
        }
        reporter.report(job_id, &progress);
        if progress.status != JobStatus::Processing {
            return Ok(Some(progress));
        }
        tokio::time::sleep(interval).await;
    }
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(1), "1");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234), "1,234");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
