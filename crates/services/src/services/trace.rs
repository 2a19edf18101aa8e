//! Process-wide event tracing.
//!
//! One line per traced event, UTF-8, newline-terminated:
//!
//! ```text
//! YYYY-MM-DDThh:mm:ss.ffffff [Q] repo=<name> event=<event> data=<summary>
//! ```
//!
//! where `[Q]` is `[G]` for the command queue, `[S]` for the evaluation
//! queue, and absent for synchronously dispatched events. The sink is
//! pluggable: the binary appends to a file, tests capture lines in memory.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::Path,
    sync::{Arc, Mutex, RwLock},
};

use once_cell::sync::Lazy;

use crate::services::{events::EventPayload, ops::OperationOutcome};

const MAX_DATA_BYTES: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueTag {
    Command,
    Evaluation,
    Sync,
}

impl QueueTag {
    fn label(self) -> &'static str {
        match self {
            QueueTag::Command => "[G]",
            QueueTag::Evaluation => "[S]",
            QueueTag::Sync => "",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TraceRecord {
    pub queue: QueueTag,
    pub repo: String,
    pub event: String,
    pub data: String,
}

pub trait TraceSink: Send + Sync {
    fn write_line(&self, line: &str);
}

static SINK: Lazy<RwLock<Option<Arc<dyn TraceSink>>>> = Lazy::new(|| RwLock::new(None));

/// Install a sink and start tracing events.
pub fn enable(sink: Arc<dyn TraceSink>) {
    *SINK.write().unwrap_or_else(|p| p.into_inner()) = Some(sink);
}

pub fn disable() {
    *SINK.write().unwrap_or_else(|p| p.into_inner()) = None;
}

pub fn is_enabled() -> bool {
    SINK.read().unwrap_or_else(|p| p.into_inner()).is_some()
}

pub fn write(record: &TraceRecord) {
    let sink = SINK.read().unwrap_or_else(|p| p.into_inner()).clone();
    let Some(sink) = sink else { return };
    sink.write_line(&format_line(record));
}

fn format_line(record: &TraceRecord) -> String {
    let timestamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f");
    let tag = record.queue.label();
    if tag.is_empty() {
        format!(
            "{timestamp} repo={} event={} data={}",
            record.repo, record.event, record.data
        )
    } else {
        format!(
            "{timestamp} {tag} repo={} event={} data={}",
            record.repo, record.event, record.data
        )
    }
}

/// Render an event payload as a short single-line summary: strings as-is,
/// records carrying an operation as `<type>,operation=<op>`, errors as
/// their message, nothing as `nil`.
pub fn summarize(payload: &EventPayload) -> String {
    let raw = match payload {
        EventPayload::Text(s) => s.clone(),
        EventPayload::Command(request) => {
            format!("GitCommandRequest,operation={}", request.operation)
        }
        EventPayload::Outcome(outcome) => summarize_outcome(outcome),
        EventPayload::Empty => "nil".to_string(),
    };
    let collapsed = utils::text::collapse_whitespace(&raw);
    utils::text::truncate_to_char_boundary(&collapsed, MAX_DATA_BYTES).to_string()
}

fn summarize_outcome(outcome: &OperationOutcome) -> String {
    match &outcome.err {
        Some(err) => format!(
            "OperationOutcome,operation={},err={}",
            outcome.operation, err
        ),
        None => format!("OperationOutcome,operation={}", outcome.operation),
    }
}

/// Appends trace lines to a file, one write per line.
pub struct FileSink {
    file: Mutex<File>,
}

impl FileSink {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl TraceSink for FileSink {
    fn write_line(&self, line: &str) {
        let mut file = self.file.lock().unwrap_or_else(|p| p.into_inner());
        let _ = writeln!(file, "{line}");
    }
}

/// Captures trace lines in memory; used by tests.
#[derive(Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl TraceSink for MemorySink {
    fn write_line(&self, line: &str) {
        self.lines
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(line.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ops::Operation;

    #[test]
    fn summarize_renders_each_payload_shape() {
        assert_eq!(summarize(&EventPayload::Empty), "nil");
        assert_eq!(
            summarize(&EventPayload::Text("plain  text\nhere".into())),
            "plain text here"
        );
        let outcome = OperationOutcome::success(Operation::Fetch);
        assert_eq!(
            summarize(&EventPayload::Outcome(outcome)),
            "OperationOutcome,operation=fetch"
        );
    }

    #[test]
    fn summarize_caps_data_length() {
        let long = "x".repeat(2048);
        let rendered = summarize(&EventPayload::Text(long));
        assert!(rendered.len() <= MAX_DATA_BYTES);
    }

    #[test]
    fn format_line_matches_trace_shape() {
        let record = TraceRecord {
            queue: QueueTag::Command,
            repo: "demo".into(),
            event: "repository.git.command.requested".into(),
            data: "GitCommandRequest,operation=fetch".into(),
        };
        let line = format_line(&record);
        let re = regex_lite(&line);
        assert!(re, "unexpected trace line: {line}");
    }

    // Hand-rolled check to avoid a test-only regex dependency here: the
    // timestamp must look like 2026-01-02T03:04:05.123456.
    fn regex_lite(line: &str) -> bool {
        let Some((timestamp, rest)) = line.split_once(' ') else {
            return false;
        };
        let ok_ts = timestamp.len() == 26
            && timestamp.as_bytes()[4] == b'-'
            && timestamp.as_bytes()[10] == b'T'
            && timestamp.as_bytes()[19] == b'.';
        ok_ts && rest.starts_with("[G] repo=demo event=repository.git.command.requested data=")
    }
}
