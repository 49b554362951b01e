//! Stateless parsing of copy-tool output.
//!
//! `dd` reports progress as unstructured text, and its dialect differs by
//! platform: BSD `dd` prints `"31918260224 bytes transferred in 512.1 secs
//! (62327183 bytes/sec)"` on SIGINFO, GNU `dd` prints `"1073741824 bytes
//! (1.1 GB, 1.0 GiB) copied, 10 s, 104 MB/s"` with `status=progress`. Both
//! also emit `"N+M records in/out"` bookkeeping lines. Everything that is
//! neither of those is treated as a potential error message.

use std::sync::LazyLock;

use regex::Regex;

static BYTES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+) bytes").unwrap());

static RATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)\s*(?:bytes|[kKMG]i?B)/s(?:ec)?").unwrap());

static PROGRESS_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+ bytes\b.*\b(?:copied|transferred)").unwrap());

static RECORDS_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+\+\d+ records (?:in|out)").unwrap());

/// What one output chunk contained.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProgressUpdate {
    /// Total bytes transferred so far, when the chunk reported one.
    pub bytes: Option<u64>,
    /// Transfer-rate text (number plus unit), when the chunk reported one.
    pub rate_text: Option<String>,
    /// True when the chunk is neither progress nor records chatter and may
    /// therefore be the reason the tool is about to fail.
    pub is_error_line: bool,
}

/// Parses one raw output chunk. Pure and memoryless; the controller keeps
/// whatever state it needs across chunks.
pub fn parse(chunk: &str) -> ProgressUpdate {
    let bytes = BYTES
        .captures(chunk)
        .and_then(|c| c[1].parse::<u64>().ok());

    let rate_text = RATE.find(chunk).map(|m| m.as_str().to_string());

    let is_error_line = !PROGRESS_LINE.is_match(chunk) && !RECORDS_LINE.is_match(chunk);

    ProgressUpdate {
        bytes,
        rate_text,
        is_error_line,
    }
}
