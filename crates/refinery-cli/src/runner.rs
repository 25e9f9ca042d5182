use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use refinery_contracts::events::{EventSink, EventWriter, JsonlSink, SinkClosed, StreamFrame};
use refinery_contracts::runs::summary::{write_summary, RunSummary};
use refinery_engine::{Pipeline, UploadedFile};
use tracing::info_span;
use uuid::Uuid;

use crate::EngineArgs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Ndjson,
    Text,
}

#[derive(Debug, Parser)]
pub(crate) struct RunArgs {
    /// Image to analyse; repeat for several images, order is kept.
    #[arg(long = "image", required = true)]
    pub(crate) images: Vec<PathBuf>,
    #[arg(long, value_enum, default_value_t = OutputFormat::Ndjson)]
    format: OutputFormat,
    /// Also write the run summary as pretty JSON.
    #[arg(long)]
    summary: Option<PathBuf>,
    /// Include base64 image data in the evidence frame.
    #[arg(long)]
    thumbnails: bool,
    #[command(flatten)]
    pub(crate) engine: EngineArgs,
}

pub(crate) fn run_local(args: RunArgs) -> Result<i32> {
    let pipeline = args.engine.into_config().build_pipeline()?;
    let sink: Arc<dyn EventSink> = match args.format {
        OutputFormat::Ndjson => Arc::new(JsonlSink::new(io::stdout())),
        OutputFormat::Text => Arc::new(TextSink::new(io::stdout())),
    };
    let summary = process_files(&pipeline, &args.images, sink, args.thumbnails)?;
    if let Some(path) = args.summary.as_deref() {
        write_summary(path, &summary)?;
    }
    Ok(0)
}

fn process_files(
    pipeline: &Pipeline,
    paths: &[PathBuf],
    sink: Arc<dyn EventSink>,
    thumbnails: bool,
) -> Result<RunSummary> {
    let files = paths
        .iter()
        .map(|path| read_upload(path))
        .collect::<Result<Vec<UploadedFile>>>()?;
    let evidence = pipeline.intake(files)?;

    let run_id = Uuid::new_v4().to_string();
    let span = info_span!("request", request_id = %run_id);
    let _entered = span.enter();
    let events = EventWriter::new(sink, run_id);
    Ok(pipeline.execute(&evidence, &events, thumbnails)?)
}

fn read_upload(path: &Path) -> Result<UploadedFile> {
    let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(UploadedFile::new(filename, bytes))
}

/// Human-readable rendering of the frame stream.
struct TextSink<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> TextSink<W> {
    fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.out
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<W: Write + Send> EventSink for TextSink<W> {
    fn deliver(&self, frame: StreamFrame) -> Result<(), SinkClosed> {
        let text = match frame {
            StreamFrame::Evidence { items, .. } => {
                let listed = items
                    .iter()
                    .map(|item| format!("{} ({}x{}, {})", item.filename, item.width, item.height, item.mime))
                    .collect::<Vec<String>>()
                    .join(", ");
                format!("EVIDENCE {} image(s): {listed}\n", items.len())
            }
            StreamFrame::Progress(event) => {
                format!("[{}] {:<8}{}\n", event.ts, event.kind.as_str(), event.message)
            }
            StreamFrame::Report(summary) => format!(
                "\n=== {} | score {}/100 | {} of {} attempt(s) | {} ===\n{}\n",
                summary.verdict,
                summary.final_score,
                summary.attempts_used,
                summary.max_attempts,
                summary.model,
                summary.final_text
            ),
        };
        let mut out = self.out.lock().map_err(|_| SinkClosed)?;
        out.write_all(text.as_bytes())
            .and_then(|_| out.flush())
            .map_err(|_| SinkClosed)
    }
}
