use std::time::Instant;

use refinery_contracts::events::{EventWriter, ProgressKind};
use refinery_contracts::runs::iteration::{IterationLog, IterationRecord, Verdict};
use refinery_contracts::scoring::extract_score;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, RefineError, Stage};
use crate::gateway::{ModelGateway, ModelReply};
use crate::intake::EvidenceSet;
use crate::prompts::PromptSet;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_TARGET_SCORE: u8 = 85;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefinementPolicy {
    pub max_attempts: u32,
    /// Inclusive acceptance threshold, 0..=100.
    pub target_score: u8,
}

impl Default for RefinementPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            target_score: DEFAULT_TARGET_SCORE,
        }
    }
}

impl RefinementPolicy {
    pub fn accepts(&self, score: u8) -> bool {
        score >= self.target_score
    }
}

/// Mutable loop state; touched once per iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefinementState {
    pub feedback: String,
    pub best_result: String,
    pub accepted: bool,
    pub attempts_used: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefinementOutcome {
    pub verdict: Verdict,
    pub final_text: String,
    pub final_score: u8,
    pub base_report: String,
    pub attempts_used: u32,
    pub iterations: IterationLog,
}

/// Drives analysis, then up to `max_attempts` synthesis/audit rounds.
///
/// Every transition is reported through the [`EventWriter`] before the next
/// step starts. A gateway failure ends the run with an `ERROR` event and no
/// result; running out of attempts still delivers the last candidate.
pub struct RefinementController<'a> {
    gateway: &'a dyn ModelGateway,
    prompts: &'a PromptSet,
    policy: RefinementPolicy,
    events: &'a EventWriter,
    stream_synthesis: bool,
}

impl<'a> RefinementController<'a> {
    pub fn new(
        gateway: &'a dyn ModelGateway,
        prompts: &'a PromptSet,
        policy: RefinementPolicy,
        events: &'a EventWriter,
    ) -> Self {
        Self {
            gateway,
            prompts,
            policy,
            events,
            stream_synthesis: true,
        }
    }

    pub fn with_streamed_synthesis(mut self, enabled: bool) -> Self {
        self.stream_synthesis = enabled;
        self
    }

    pub fn run(&self, evidence: &EvidenceSet) -> Result<RefinementOutcome, RefineError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let base_report = self.analyze(evidence)?;

        let mut state = RefinementState::default();
        let mut log = IterationLog::new();
        let mut final_score = 0;

        for iteration in 1..=max_attempts {
            let candidate = self.synthesize(iteration, max_attempts, &base_report, &state.feedback, evidence)?;
            let (critique, score) = self.audit(iteration, max_attempts, &base_report, &candidate, evidence)?;

            state.attempts_used = iteration;
            state.best_result = candidate.clone();
            state.accepted = self.policy.accepts(score);
            final_score = score;
            log.push(IterationRecord {
                iteration,
                synthesis: candidate,
                audit: critique.clone(),
                score,
                accepted: state.accepted,
            });

            if state.accepted {
                info!(iteration, score, "candidate accepted");
                self.emit(
                    Stage::Auditing,
                    ProgressKind::Success,
                    format!("Candidate accepted on iteration {iteration} with score {score}/100."),
                )?;
                break;
            }

            if iteration < max_attempts {
                self.emit(
                    Stage::Auditing,
                    ProgressKind::Warn,
                    format!(
                        "Score {score} is below target {}; feeding the audit critique into iteration {}.",
                        self.policy.target_score,
                        iteration + 1
                    ),
                )?;
                state.feedback = critique;
            } else {
                warn!(iteration, score, "attempts exhausted");
                self.emit(
                    Stage::Auditing,
                    ProgressKind::Warn,
                    format!(
                        "Attempts exhausted after {max_attempts} iteration(s); delivering the last candidate (score {score}/100)."
                    ),
                )?;
            }
        }

        Ok(RefinementOutcome {
            verdict: if state.accepted {
                Verdict::Accepted
            } else {
                Verdict::Exhausted
            },
            final_text: state.best_result,
            final_score,
            base_report,
            attempts_used: state.attempts_used,
            iterations: log,
        })
    }

    fn analyze(&self, evidence: &EvidenceSet) -> Result<String, RefineError> {
        let stage = Stage::Analyzing;
        self.emit(
            stage,
            ProgressKind::Info,
            format!("Analysis started on {} image(s).", evidence.len()),
        )?;
        self.emit(
            stage,
            ProgressKind::Net,
            format!("Requesting baseline analysis from {}.", self.gateway.model()),
        )?;
        let started = Instant::now();
        let prompt = self.prompts.analysis_prompt(evidence.len());
        let reply = self
            .gateway
            .analyze(&prompt, evidence.model_parts())
            .map_err(|err| self.fail(stage, err))?;
        self.settle_reply(stage, "Baseline analysis", reply, started)
    }

    fn synthesize(
        &self,
        iteration: u32,
        max_attempts: u32,
        base_report: &str,
        feedback: &str,
        evidence: &EvidenceSet,
    ) -> Result<String, RefineError> {
        let stage = Stage::Synthesizing;
        self.emit(
            stage,
            ProgressKind::Info,
            format!("Iteration {iteration}/{max_attempts}: synthesizing a candidate."),
        )?;
        let prompt = self
            .prompts
            .synthesis_prompt(evidence.len(), base_report, feedback);
        let started = Instant::now();

        if !self.stream_synthesis {
            self.emit(
                stage,
                ProgressKind::Net,
                format!("Requesting synthesis from {}.", self.gateway.model()),
            )?;
            let reply = self
                .gateway
                .analyze(&prompt, evidence.model_parts())
                .map_err(|err| self.fail(stage, err))?;
            return self.settle_reply(stage, "Candidate", reply, started);
        }

        self.emit(
            stage,
            ProgressKind::Net,
            format!("Streaming synthesis from {}.", self.gateway.model()),
        )?;
        let mut fragments = 0usize;
        let mut disconnected = false;
        let reply = self
            .gateway
            .analyze_streamed(&prompt, evidence.model_parts(), &mut |_fragment: &str| {
                fragments += 1;
                if fragments == 1 && !disconnected {
                    let elapsed = started.elapsed().as_millis();
                    disconnected = self
                        .events
                        .emit(
                            ProgressKind::Data,
                            format!("First fragment received after {elapsed} ms."),
                        )
                        .is_err();
                }
            })
            .map_err(|err| self.fail(stage, err))?;
        if disconnected {
            return Err(RefineError::Disconnected(stage));
        }
        debug!(iteration, fragments, "synthesis stream finished");
        self.settle_reply(
            stage,
            &format!("Candidate ({fragments} fragment(s))"),
            reply,
            started,
        )
    }

    fn audit(
        &self,
        iteration: u32,
        max_attempts: u32,
        base_report: &str,
        candidate: &str,
        evidence: &EvidenceSet,
    ) -> Result<(String, u8), RefineError> {
        let stage = Stage::Auditing;
        self.emit(
            stage,
            ProgressKind::Info,
            format!("Iteration {iteration}/{max_attempts}: auditing the candidate."),
        )?;
        self.emit(
            stage,
            ProgressKind::Net,
            format!("Requesting audit from {}.", self.gateway.model()),
        )?;
        let started = Instant::now();
        let prompt = self
            .prompts
            .audit_prompt(base_report, candidate, self.policy.target_score);
        let reply = self
            .gateway
            .analyze(&prompt, evidence.model_parts())
            .map_err(|err| self.fail(stage, err))?;
        let critique = self.settle_reply(stage, "Audit", reply, started)?;
        let score = extract_score(&critique);
        self.emit(
            stage,
            ProgressKind::Data,
            format!(
                "Audit score {score}/100 (target {}).",
                self.policy.target_score
            ),
        )?;
        Ok((critique, score))
    }

    /// Report a finished call and turn an empty reply into placeholder text.
    fn settle_reply(
        &self,
        stage: Stage,
        label: &str,
        reply: ModelReply,
        started: Instant,
    ) -> Result<String, RefineError> {
        let elapsed = started.elapsed().as_millis();
        if reply.is_empty() {
            let reason = reply
                .empty_reason()
                .map(|reason| format!(" ({reason})"))
                .unwrap_or_default();
            warn!(%stage, reason = %reason, "model returned no text");
            self.emit(
                stage,
                ProgressKind::Warn,
                format!("{label}: the model returned no text{reason}; continuing with a placeholder."),
            )?;
            return Ok(reply.into_text_or_placeholder());
        }
        let text = reply.into_text_or_placeholder();
        self.emit(
            stage,
            ProgressKind::Data,
            format!(
                "{label} received: {} chars in {elapsed} ms.",
                text.chars().count()
            ),
        )?;
        Ok(text)
    }

    fn emit(&self, stage: Stage, kind: ProgressKind, message: String) -> Result<(), RefineError> {
        self.events
            .emit(kind, message)
            .map(|_| ())
            .map_err(|_| {
                warn!(%stage, run_id = self.events.run_id(), "client disconnected");
                RefineError::Disconnected(stage)
            })
    }

    fn fail(&self, stage: Stage, err: GatewayError) -> RefineError {
        warn!(%stage, error = %err, "gateway call failed");
        let _ = self.events.emit(
            ProgressKind::Error,
            format!("{stage} failed: {err}. Processing stopped."),
        );
        RefineError::Gateway { stage, source: err }
    }
}
