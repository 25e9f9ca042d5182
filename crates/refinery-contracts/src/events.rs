use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::runs::summary::RunSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgressKind {
    Info,
    Net,
    Data,
    Warn,
    Success,
    Error,
}

impl ProgressKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Net => "NET",
            Self::Data => "DATA",
            Self::Warn => "WARN",
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for ProgressKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub seq: u64,
    pub run_id: String,
    pub kind: ProgressKind,
    pub message: String,
    pub ts: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub filename: String,
    pub mime: String,
    pub width: u32,
    pub height: u32,
    pub bytes: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_base64: Option<String>,
}

/// One unit written to a client stream.
///
/// Transports decide how a frame is framed on the wire; the variants are the
/// same for every transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum StreamFrame {
    Evidence {
        run_id: String,
        items: Vec<EvidenceItem>,
    },
    Progress(ProgressEvent),
    Report(RunSummary),
}

impl StreamFrame {
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn as_progress(&self) -> Option<&ProgressEvent> {
        match self {
            Self::Progress(event) => Some(event),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("event sink closed")]
pub struct SinkClosed;

/// Destination for stream frames. Delivery must not wait on the consumer.
pub trait EventSink: Send + Sync {
    fn deliver(&self, frame: StreamFrame) -> Result<(), SinkClosed>;
}

/// Collects frames in memory; used by tests and by callers that render at the end.
#[derive(Debug, Default)]
pub struct MemorySink {
    frames: Mutex<Vec<StreamFrame>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<StreamFrame> {
        self.frames
            .lock()
            .map(|frames| frames.clone())
            .unwrap_or_default()
    }

    pub fn progress(&self) -> Vec<ProgressEvent> {
        self.frames()
            .iter()
            .filter_map(StreamFrame::as_progress)
            .cloned()
            .collect()
    }
}

impl EventSink for MemorySink {
    fn deliver(&self, frame: StreamFrame) -> Result<(), SinkClosed> {
        self.frames.lock().map_err(|_| SinkClosed)?.push(frame);
        Ok(())
    }
}

/// Writes one compact JSON object per line and flushes after each frame.
pub struct JsonlSink<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonlSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> Option<W> {
        self.out.into_inner().ok()
    }
}

impl<W: Write + Send> EventSink for JsonlSink<W> {
    fn deliver(&self, frame: StreamFrame) -> Result<(), SinkClosed> {
        let line = frame.to_json_line().map_err(|_| SinkClosed)?;
        let mut out = self.out.lock().map_err(|_| SinkClosed)?;
        out.write_all(line.as_bytes()).map_err(|_| SinkClosed)?;
        out.flush().map_err(|_| SinkClosed)
    }
}

/// Request-scoped progress writer.
///
/// - every event gets the writer's `run_id`, a sequence number and a timestamp
/// - sequence numbers follow delivery order
/// - a closed sink is reported back so the caller can stop early
#[derive(Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

struct EventWriterInner {
    sink: Arc<dyn EventSink>,
    run_id: String,
    next_seq: Mutex<u64>,
}

impl fmt::Debug for EventWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventWriter")
            .field("run_id", &self.inner.run_id)
            .finish_non_exhaustive()
    }
}

impl EventWriter {
    pub fn new(sink: Arc<dyn EventSink>, run_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                sink,
                run_id: run_id.into(),
                next_seq: Mutex::new(1),
            }),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn emit(
        &self,
        kind: ProgressKind,
        message: impl Into<String>,
    ) -> Result<ProgressEvent, SinkClosed> {
        let mut next_seq = self.inner.next_seq.lock().map_err(|_| SinkClosed)?;
        let event = ProgressEvent {
            seq: *next_seq,
            run_id: self.inner.run_id.clone(),
            kind,
            message: message.into(),
            ts: now_utc_iso(),
        };
        self.inner
            .sink
            .deliver(StreamFrame::Progress(event.clone()))?;
        *next_seq += 1;
        Ok(event)
    }

    pub fn send(&self, frame: StreamFrame) -> Result<(), SinkClosed> {
        let _guard = self.inner.next_seq.lock().map_err(|_| SinkClosed)?;
        self.inner.sink.deliver(frame)
    }
}

pub fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;
    use serde_json::Value;

    use super::*;

    #[test]
    fn emit_assigns_sequence_run_id_and_timestamp() -> anyhow::Result<()> {
        let sink = Arc::new(MemorySink::new());
        let writer = EventWriter::new(sink.clone(), "run-123");

        let first = writer.emit(ProgressKind::Info, "evidence loaded")?;
        let second = writer.emit(ProgressKind::Net, "contacting model")?;

        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
        assert_eq!(first.run_id, "run-123");
        DateTime::parse_from_rfc3339(&first.ts)?;

        let delivered = sink.progress();
        assert_eq!(delivered, vec![first, second]);
        Ok(())
    }

    #[test]
    fn jsonl_sink_writes_compact_lines_in_order() -> anyhow::Result<()> {
        let sink = Arc::new(JsonlSink::new(Vec::new()));
        let writer = EventWriter::new(sink.clone(), "run-123");

        writer.emit(ProgressKind::Info, "one")?;
        writer.emit(ProgressKind::Warn, "two")?;
        drop(writer);

        let sink = Arc::try_unwrap(sink).map_err(|_| anyhow::anyhow!("sink still shared"))?;
        let raw = String::from_utf8(sink.into_inner().unwrap_or_default())?;
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0])?;
        let second: Value = serde_json::from_str(lines[1])?;
        assert_eq!(first["frame"], Value::String("progress".to_string()));
        assert_eq!(first["kind"], Value::String("INFO".to_string()));
        assert_eq!(first["message"], Value::String("one".to_string()));
        assert_eq!(second["kind"], Value::String("WARN".to_string()));
        assert_eq!(second["seq"], Value::from(2));
        Ok(())
    }

    #[test]
    fn closed_sink_is_reported_to_caller() {
        struct Closed;
        impl EventSink for Closed {
            fn deliver(&self, _frame: StreamFrame) -> Result<(), SinkClosed> {
                Err(SinkClosed)
            }
        }

        let writer = EventWriter::new(Arc::new(Closed), "run-123");
        assert_eq!(
            writer.emit(ProgressKind::Info, "lost").err(),
            Some(SinkClosed)
        );
    }

    #[test]
    fn evidence_frame_omits_missing_thumbnail_data() -> anyhow::Result<()> {
        let frame = StreamFrame::Evidence {
            run_id: "run-123".to_string(),
            items: vec![EvidenceItem {
                filename: "a.png".to_string(),
                mime: "image/png".to_string(),
                width: 4,
                height: 2,
                bytes: 120,
                data_base64: None,
            }],
        };
        let parsed: Value = serde_json::from_str(frame.to_json_line()?.trim_end())?;
        assert_eq!(parsed["frame"], Value::String("evidence".to_string()));
        assert_eq!(parsed["items"][0]["width"], Value::from(4));
        assert!(parsed["items"][0].get("data_base64").is_none());
        Ok(())
    }
}
