//! Indexing progress reporting.
//!
//! The lifecycle manager emits a [`ProgressEvent`] when an add starts,
//! as each stage advances, and when it completes or fails. Reporters
//! decide where events go: human lines or JSON lines on **stderr** (so
//! stdout stays parseable), nowhere, or a channel that the HTTP server
//! turns into a server-sent-event stream.

use std::io::Write;

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use docdex_core::error::classify;
use docdex_core::models::IndexResult;
use docdex_core::IndexStage;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Start,
    Progress,
    Complete,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Start => "start",
            EventKind::Progress => "progress",
            EventKind::Complete => "complete",
            EventKind::Error => "error",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub kind: EventKind,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<IndexStage>,
    pub message: String,
    pub current: u64,
    pub total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<IndexResult>,
    /// Machine-readable error code for `error` events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
}

impl ProgressEvent {
    pub fn start(source: &str, message: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Start,
            source: source.to_string(),
            stage: None,
            message: message.into(),
            current: 0,
            total: 0,
            result: None,
            code: None,
        }
    }

    pub fn progress(source: &str, stage: IndexStage, current: u64, total: u64) -> Self {
        let message = match stage {
            IndexStage::Collect => format!("collected {} units", format_number(total)),
            IndexStage::Chunk => format!(
                "chunked {} / {} units",
                format_number(current),
                format_number(total)
            ),
            IndexStage::Embed => format!(
                "embedded {} / {} batches",
                format_number(current),
                format_number(total)
            ),
            IndexStage::Store => "committing".to_string(),
        };
        Self {
            kind: EventKind::Progress,
            source: source.to_string(),
            stage: Some(stage),
            message,
            current,
            total,
            result: None,
            code: None,
        }
    }

    pub fn complete(result: IndexResult) -> Self {
        Self {
            kind: EventKind::Complete,
            source: result.source_name.clone(),
            stage: None,
            message: format!(
                "indexed {} chunks from {} {}",
                format_number(result.chunks_created),
                format_number(result.total_units),
                result.kind.unit_label()
            ),
            current: result.total_units,
            total: result.total_units,
            result: Some(result),
            code: None,
        }
    }

    pub fn error(source: &str, err: &anyhow::Error) -> Self {
        Self {
            kind: EventKind::Error,
            source: source.to_string(),
            stage: None,
            message: format!("{:#}", err),
            current: 0,
            total: 0,
            result: None,
            code: Some(classify(err).map(|e| e.code()).unwrap_or("internal")),
        }
    }
}

/// Receives progress events from the lifecycle manager.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "add react  embed  3 / 12 batches".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let label = match event.stage {
            Some(stage) => stage.to_string(),
            None => event.kind.as_str().to_string(),
        };
        let line = format!("add {}  {}  {}\n", event.source, label, event.message);
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        if let Ok(line) = serde_json::to_string(&event) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Forwards events to a channel. Events sent after the receiver is
/// dropped are discarded.
pub struct ChannelProgress {
    tx: UnboundedSender<ProgressEvent>,
}

impl ChannelProgress {
    pub fn new(tx: UnboundedSender<ProgressEvent>) -> Self {
        Self { tx }
    }
}

impl ProgressReporter for ChannelProgress {
    fn report(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }
}

pub fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "off" => Some(ProgressMode::Off),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            _ => None,
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
