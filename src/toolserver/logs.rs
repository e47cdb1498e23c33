// Keystone Tool Server — Log Introspection
// Read-only tail over per-service log files. Large files are read from the
// last 2 MB only, so a runaway log can't blow up a tool call.

use crate::atoms::error::{EngineError, EngineResult};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

const MAX_LINES: usize = 200;
const TAIL_BYTES: u64 = 2 * 1024 * 1024;

const KNOWN_SERVICES: &[&str] = &["engine", "gateway", "orchestrator", "tools", "trainer"];

pub fn log_dir() -> PathBuf {
    std::env::var("KEYSTONE_LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/log/keystone"))
}

pub fn introspect_logs(
    service: &str,
    lines: usize,
    search: Option<&str>,
    level: Option<&str>,
) -> EngineResult<Vec<String>> {
    if !KNOWN_SERVICES.contains(&service) {
        return Err(EngineError::tool(
            "introspect_logs",
            format!("unknown service '{service}'"),
        ));
    }
    let path = log_dir().join(format!("{service}.log"));
    introspect_file(&path, lines.min(MAX_LINES), search, level)
}

pub fn introspect_file(
    path: &Path,
    lines: usize,
    search: Option<&str>,
    level: Option<&str>,
) -> EngineResult<Vec<String>> {
    let mut file = std::fs::File::open(path)?;
    let len = file.metadata()?.len();
    if len > TAIL_BYTES {
        file.seek(SeekFrom::End(-(TAIL_BYTES as i64)))?;
    }
    let mut buf = String::new();
    file.read_to_string(&mut buf)?;

    let level_upper = level.map(str::to_uppercase);
    let matched: Vec<String> = buf
        .lines()
        // First line after a mid-file seek is usually torn; drop it
        .skip(if len > TAIL_BYTES { 1 } else { 0 })
        .filter(|line| search.map(|s| line.contains(s)).unwrap_or(true))
        .filter(|line| {
            level_upper
                .as_ref()
                .map(|l| line.to_uppercase().contains(l.as_str()))
                .unwrap_or(true)
        })
        .map(String::from)
        .collect();

    let start = matched.len().saturating_sub(lines);
    Ok(matched[start..].to_vec())
}
