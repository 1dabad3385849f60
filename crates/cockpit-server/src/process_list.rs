//! One-shot process listing: the heaviest processes by resident memory.

use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;

use crate::config::ProcessesConfig;
use crate::process_feed::{run_captured, SnapshotError};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub user: String,
    pub memory_mb: f64,
    pub cpu_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessList {
    pub processes: Vec<ProcessInfo>,
}

/// Runs the configured `ps` command and ranks its rows.
pub struct ProcessLister {
    command: String,
    args: Vec<String>,
    timeout: Duration,
    limit: usize,
}

impl ProcessLister {
    pub fn new(config: &ProcessesConfig) -> Self {
        Self {
            command: config.list_command.clone(),
            args: config.list_args.clone(),
            timeout: config.timeout(),
            limit: config.list_limit,
        }
    }

    pub async fn list(&self) -> Result<ProcessList, SnapshotError> {
        let mut command = Command::new(&self.command);
        command.args(&self.args);
        let stdout = run_captured(command, self.timeout).await?;
        Ok(ProcessList {
            processes: parse_ps(&stdout, self.limit),
        })
    }
}

/// Parse `pid user rss pcpu comm` rows (rss in KiB), largest memory first.
/// Rows that do not parse are skipped; the command may contain spaces.
pub fn parse_ps(output: &str, limit: usize) -> Vec<ProcessInfo> {
    let mut rows: Vec<(u64, ProcessInfo)> = output.lines().filter_map(parse_row).collect();
    rows.sort_by(|a, b| b.0.cmp(&a.0));
    rows.into_iter()
        .take(limit)
        .map(|(_, info)| info)
        .collect()
}

fn parse_row(line: &str) -> Option<(u64, ProcessInfo)> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 5 {
        return None;
    }
    let pid = fields[0].parse().ok()?;
    let rss_kib: u64 = fields[2].parse().ok()?;
    let cpu: f64 = fields[3].parse().ok()?;

    Some((
        rss_kib,
        ProcessInfo {
            pid,
            name: fields[4..].join(" "),
            user: fields[1].to_string(),
            memory_mb: round1(rss_kib as f64 / 1024.0),
            cpu_percent: round1(cpu),
        },
    ))
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
