//! Admin shell output parsing.
//!
//! The shell prints disk entries as `key="value"` / `key=value` tokens,
//! wrapped across continuation lines, with an index column (and optional
//! flag letters) starting each entry. Parsers here tolerate field-order
//! variation and stray whitespace, and classify the shell's error lines
//! into the closed [`ShellError`] kind set.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Result, ShellError};

/// One disk-table entry as printed by `/disk print detail`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskEntry {
    pub slot: String,
    pub file_path: String,
    pub size_bytes: u64,
    /// Present only on network-exported entries.
    pub nqn: Option<String>,
    pub port: Option<u16>,
    pub export_enabled: bool,
    /// Free bytes, present on pool entries.
    pub free_space: Option<u64>,
}

fn kv_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"([a-z0-9][a-z0-9-]*)=(?:"([^"]*)"|(\S+))"#).expect("kv regex"))
}

fn entry_start_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*\d+\s+[A-Z ]*").expect("entry-start regex"))
}

/// Tokenize one logical line into key/value pairs.
///
/// Quoted values keep embedded spaces; bare values end at whitespace. Keys
/// are the shell's lowercase-dash convention. Order is not significant.
pub fn parse_kv_line(line: &str) -> HashMap<String, String> {
    kv_regex()
        .captures_iter(line)
        .map(|cap| {
            let key = cap[1].to_string();
            let value = cap
                .get(2)
                .or_else(|| cap.get(3))
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default();
            (key, value)
        })
        .collect()
}

/// Scan shell output for error lines and classify them.
///
/// The shell reports problems inline, e.g. `failure: no space left on
/// device` or `no such item`. Anything unrecognized that still looks like a
/// failure becomes [`ShellError::CommandFailed`].
pub fn check_for_errors(output: &str) -> Result<()> {
    for raw in output.lines() {
        let line = raw.trim();
        let lower = line.to_lowercase();
        if lower.contains("no such item") {
            return Err(ShellError::NotFound(line.to_string()));
        }
        if lower.contains("already have") || lower.contains("already exists") {
            return Err(ShellError::AlreadyExists(line.to_string()));
        }
        if lower.contains("no space") || lower.contains("not enough space") {
            return Err(ShellError::OutOfSpace(line.to_string()));
        }
        if lower.starts_with("failure:")
            || lower.starts_with("bad command")
            || lower.contains("syntax error")
            || lower.contains("input does not match")
        {
            return Err(ShellError::CommandFailed(line.to_string()));
        }
    }
    Ok(())
}

/// Parse `/disk print detail` output into entries.
///
/// An entry begins on a line carrying the index column; subsequent indented
/// lines continue it. Entries without a `slot` key are skipped (the shell's
/// column-header and separator lines carry none).
pub fn parse_disk_print(output: &str) -> Result<Vec<DiskEntry>> {
    let mut logical_lines: Vec<String> = Vec::new();
    for raw in output.lines() {
        let line = raw.trim_end();
        if line.trim().is_empty() {
            continue;
        }
        if entry_start_regex().is_match(line) || logical_lines.is_empty() {
            logical_lines.push(line.to_string());
        } else if let Some(last) = logical_lines.last_mut() {
            last.push(' ');
            last.push_str(line.trim());
        }
    }

    let mut entries = Vec::new();
    for line in &logical_lines {
        let kv = parse_kv_line(line);
        let Some(slot) = kv.get("slot") else {
            continue;
        };
        let size_bytes = match kv.get("file-size") {
            Some(v) => v.parse::<u64>().map_err(|_| {
                ShellError::Parse(format!("bad file-size '{v}' for slot '{slot}'"))
            })?,
            None => 0,
        };
        let port = match kv.get("nvme-tcp-port") {
            Some(v) => Some(v.parse::<u16>().map_err(|_| {
                ShellError::Parse(format!("bad nvme-tcp-port '{v}' for slot '{slot}'"))
            })?),
            None => None,
        };
        let free_space = match kv.get("free-space") {
            Some(v) => Some(v.parse::<u64>().map_err(|_| {
                ShellError::Parse(format!("bad free-space '{v}' for slot '{slot}'"))
            })?),
            None => None,
        };
        entries.push(DiskEntry {
            slot: slot.clone(),
            file_path: kv.get("file-path").cloned().unwrap_or_default(),
            size_bytes,
            nqn: kv.get("nvme-tcp-nqn").cloned().filter(|s| !s.is_empty()),
            port,
            export_enabled: kv.get("nvme-tcp-export").map(String::as_str) == Some("yes"),
            free_space,
        });
    }
    Ok(entries)
}
