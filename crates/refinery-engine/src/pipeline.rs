use std::sync::Arc;

use refinery_contracts::events::{now_utc_iso, EventWriter, ProgressKind, StreamFrame};
use refinery_contracts::runs::summary::RunSummary;
use tracing::{error, info, info_span};

use crate::error::{IntakeError, RefineError, Stage};
use crate::gateway::ModelGateway;
use crate::intake::{intake, EvidenceSet, IntakeOptions, UploadedFile};
use crate::prompts::PromptSet;
use crate::refine::{RefinementController, RefinementPolicy};

#[derive(Debug, Clone, Default)]
pub struct PipelineSettings {
    pub policy: RefinementPolicy,
    pub intake: IntakeOptions,
    pub stream_synthesis: bool,
    /// Shown to every client as a `WARN` event, e.g. a model fallback.
    pub model_notice: Option<String>,
}

/// Request-independent pieces of a processing run, shared by every request.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    gateway: Arc<dyn ModelGateway>,
    prompts: PromptSet,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(gateway: Arc<dyn ModelGateway>, prompts: PromptSet, settings: PipelineSettings) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                gateway,
                prompts,
                settings,
            }),
        }
    }

    pub fn provider(&self) -> &str {
        self.inner.gateway.name()
    }

    pub fn model(&self) -> &str {
        self.inner.gateway.model()
    }

    pub fn policy(&self) -> RefinementPolicy {
        self.inner.settings.policy
    }

    pub fn intake(&self, files: Vec<UploadedFile>) -> Result<EvidenceSet, IntakeError> {
        intake(files, &self.inner.settings.intake)
    }

    /// Run one request end to end: evidence frame, progress, then the report frame.
    ///
    /// Nothing is written after a failure except the terminal `ERROR` event.
    pub fn execute(
        &self,
        evidence: &EvidenceSet,
        events: &EventWriter,
        include_thumbnails: bool,
    ) -> Result<RunSummary, RefineError> {
        let span = info_span!("refine", run_id = events.run_id(), images = evidence.len());
        let _entered = span.enter();
        let started_at = now_utc_iso();
        let settings = &self.inner.settings;

        events
            .send(StreamFrame::Evidence {
                run_id: events.run_id().to_string(),
                items: evidence.summary_items(include_thumbnails),
            })
            .map_err(|_| RefineError::Disconnected(Stage::Analyzing))?;
        if let Some(notice) = settings.model_notice.as_deref() {
            events
                .emit(ProgressKind::Warn, notice)
                .map_err(|_| RefineError::Disconnected(Stage::Analyzing))?;
        }

        let outcome = RefinementController::new(
            self.inner.gateway.as_ref(),
            &self.inner.prompts,
            settings.policy,
            events,
        )
        .with_streamed_synthesis(settings.stream_synthesis)
        .run(evidence)
        .map_err(|err| {
            error!(error = %err, "refinement run failed");
            err
        })?;

        let summary = RunSummary {
            run_id: events.run_id().to_string(),
            model: self.model().to_string(),
            started_at,
            finished_at: now_utc_iso(),
            verdict: outcome.verdict,
            attempts_used: outcome.attempts_used,
            max_attempts: settings.policy.max_attempts.max(1),
            target_score: settings.policy.target_score,
            final_score: outcome.final_score,
            final_text: outcome.final_text,
            base_report: outcome.base_report,
            iterations: outcome.iterations.into_records(),
        };
        info!(
            verdict = %summary.verdict,
            attempts = summary.attempts_used,
            score = summary.final_score,
            "refinement run finished"
        );
        events
            .emit(
                ProgressKind::Info,
                format!(
                    "Final report ready: {} after {} iteration(s).",
                    summary.verdict, summary.attempts_used
                ),
            )
            .and_then(|_| events.send(StreamFrame::Report(summary.clone())))
            .map_err(|_| RefineError::Disconnected(Stage::Auditing))?;
        Ok(summary)
    }
}
