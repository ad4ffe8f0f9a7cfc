//! Task start and finish records
//!
//! Each run leaves `task_<start>_start.json` when it begins and
//! `task_<start>_finish.json` when it ends, `<start>` being the run's start
//! timestamp. The finish record is created exclusively.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::error::{EmbeddingError, Result};

const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S_%6f";

#[derive(Debug, Serialize)]
struct StartRecord<'a> {
    start_time: String,
    version: &'a str,
    cwd: String,
    login: String,
    platform: String,
    commandlineargs: &'a Value,
}

#[derive(Debug, Serialize)]
struct FinishRecord {
    start_time: String,
    end_time: String,
    elapsed_time: f64,
    status: i32,
}

fn record_path(outdir: &Path, start: &DateTime<Utc>, phase: &str) -> PathBuf {
    outdir.join(format!("task_{}_{}.json", start.format(STAMP_FORMAT), phase))
}

/// Login name of the user running the pipeline
pub(crate) fn login() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

pub fn write_task_start_json(
    outdir: &Path,
    start: &DateTime<Utc>,
    version: &str,
    data: &Value,
) -> Result<PathBuf> {
    let cwd = std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let record = StartRecord {
        start_time: start.to_rfc3339(),
        version,
        cwd,
        login: login(),
        platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
        commandlineargs: data,
    };
    let path = record_path(outdir, start, "start");
    std::fs::write(&path, serde_json::to_string_pretty(&record)?)
        .map_err(|e| EmbeddingError::file_access(&path, e))?;
    Ok(path)
}

/// Fails if a finish record for this start time already exists
pub fn write_task_finish_json(outdir: &Path, start: &DateTime<Utc>, status: i32) -> Result<PathBuf> {
    let end = Utc::now();
    let elapsed = (end - *start).num_milliseconds() as f64 / 1000.0;
    let record = FinishRecord {
        start_time: start.to_rfc3339(),
        end_time: end.to_rfc3339(),
        elapsed_time: elapsed,
        status,
    };
    let path = record_path(outdir, start, "finish");
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .map_err(|e| EmbeddingError::file_access(&path, e))?;
    file.write_all(serde_json::to_string_pretty(&record)?.as_bytes())
        .map_err(|e| EmbeddingError::file_access(&path, e))?;
    Ok(path)
}
