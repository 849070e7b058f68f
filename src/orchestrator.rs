//! The check orchestrator: the verification cycle and session lifecycle.
//!
//! `execute_check` runs evidence through transcription and verification,
//! records a safety check, and advances or holds the session. Verification
//! runs under a hard deadline; expiry or adapter failure becomes a
//! domain-level fail result with a system message, never an error to the
//! caller. Feedback speech is best-effort on its own deadline.
//!
//! At most one in-flight call may mutate a given session: every mutating
//! entry point holds that session's lock for the whole read-modify-write.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use opentelemetry::KeyValue;
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};
use uuid::Uuid;

use crate::adapters::{
    AudioStore, Evidence, ImageData, SpeechAdapter, TranscriptionAdapter, VerificationAdapter,
};
use crate::error::{Error, Result};
use crate::model::session::{
    CheckId, CheckResult, SafetyCheck, SessionId, SessionStatus, WorkSession,
};
use crate::model::template::{SopTemplate, Step, StepId, TemplateId};
use crate::sequencer;
use crate::store::{SessionStore, TemplateStore};
use crate::telemetry::metrics;

/// Confidence below this flags a check for supervisor review.
const REVIEW_CONFIDENCE_FLOOR: f64 = 0.7;

// ---------------------------------------------------------------------------
// Per-session mutual exclusion
// ---------------------------------------------------------------------------

/// Registry of per-session async locks, shared between the orchestrator
/// and the audit ledger so override and execute serialize too.
#[derive(Default)]
pub struct SessionLocks {
    inner: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for one session, creating it on first use.
    pub async fn acquire(&self, id: SessionId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().expect("session lock registry poisoned");
            Arc::clone(
                map.entry(id.0)
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        lock.lock_owned().await
    }
}

// ---------------------------------------------------------------------------
// Configuration and outcome types
// ---------------------------------------------------------------------------

/// Deadlines for the adapter calls in one check cycle.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Hard deadline for the verification call. Expiry becomes a fail
    /// result, not an error.
    pub verify_timeout: Duration,
    /// Deadline for transcription; expiry degrades to an empty transcript.
    pub transcribe_timeout: Duration,
    /// Deadline for feedback speech; expiry just omits the audio reference.
    pub speech_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            verify_timeout: Duration::from_secs(10),
            transcribe_timeout: Duration::from_secs(10),
            speech_timeout: Duration::from_secs(5),
        }
    }
}

/// Operator-facing summary of the step a worker should do next.
#[derive(Debug, Clone, Serialize)]
pub struct StepSummary {
    pub id: StepId,
    pub description: String,
    pub expected_action: Option<String>,
    /// 1-based (task, step) position in the template.
    pub position: (usize, usize),
}

impl StepSummary {
    pub(crate) fn describe(template: &SopTemplate, step_id: StepId) -> Result<Self> {
        let step = sequencer::find_step(template, step_id)?;
        Ok(Self {
            id: step.id,
            description: step.description.clone(),
            expected_action: step.expected_action.clone(),
            position: sequencer::position_of(template, step_id)?,
        })
    }
}

/// What the worker gets back from one check: always a definite outcome.
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub check_id: CheckId,
    pub result: CheckResult,
    pub feedback_text: String,
    pub confidence: Option<f64>,
    pub audio_ref: Option<String>,
    pub needs_review: bool,
    pub session_status: SessionStatus,
    /// Next step, or None when the session just completed (or the worker
    /// must retry the same step after a fail).
    pub next_step: Option<StepSummary>,
}

/// External adapter bundle the orchestrator runs checks through.
#[derive(Clone)]
pub struct Adapters {
    pub verifier: Arc<dyn VerificationAdapter>,
    pub transcriber: Arc<dyn TranscriptionAdapter>,
    pub speech: Arc<dyn SpeechAdapter>,
    pub audio: Arc<dyn AudioStore>,
}

/// Internal result of the verification stage, adapter or synthesized.
struct Judgement {
    pass: bool,
    sequence_correct: bool,
    confidence: Option<f64>,
    feedback: String,
    source: &'static str,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Execution engine facade: session lifecycle plus the check cycle.
#[derive(Clone)]
pub struct CheckOrchestrator {
    sessions: Arc<dyn SessionStore>,
    templates: Arc<dyn TemplateStore>,
    adapters: Adapters,
    locks: Arc<SessionLocks>,
    config: OrchestratorConfig,
}

impl CheckOrchestrator {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        templates: Arc<dyn TemplateStore>,
        adapters: Adapters,
        locks: Arc<SessionLocks>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            sessions,
            templates,
            adapters,
            locks,
            config,
        }
    }

    /// Start a new session for a worker, positioned at the template's
    /// first step. The store enforces one active session per worker.
    pub async fn start_session(
        &self,
        template_id: TemplateId,
        worker_id: Uuid,
    ) -> Result<WorkSession> {
        let template = self.templates.get(template_id).await?;
        template.validate()?;

        let first = sequencer::first_step(&template)
            .ok_or_else(|| Error::Validation("template has no steps to execute".into()))?;

        let session = WorkSession::start(template_id, worker_id, first.id);
        self.sessions.create(&session).await?;

        metrics::session_transitions().add(1, &[KeyValue::new("to", "in_progress")]);
        info!(session = %session.id, template = %template_id, %worker_id, "session started");
        Ok(session)
    }

    /// Run one verification cycle. Spawned on a detached task so a
    /// disconnected caller cannot cancel a check mid-persist; the check
    /// is a real safety event and must not be lost.
    pub async fn execute_check(
        &self,
        session_id: SessionId,
        step_id: StepId,
        evidence: Evidence,
    ) -> Result<CheckOutcome> {
        let this = self.clone();
        let task =
            tokio::spawn(async move { this.execute_inner(session_id, step_id, evidence).await });
        task.await
            .map_err(|e| Error::Other(format!("check task failed: {e}")))?
    }

    async fn execute_inner(
        &self,
        session_id: SessionId,
        step_id: StepId,
        evidence: Evidence,
    ) -> Result<CheckOutcome> {
        let _guard = self.locks.acquire(session_id).await;

        let mut session = self.sessions.get(session_id).await?;
        if session.locked {
            return Err(Error::StateConflict(format!(
                "session {session_id} is locked"
            )));
        }
        if session.status != SessionStatus::InProgress {
            return Err(Error::StateConflict(format!(
                "session {session_id} is {}, checks need an in-progress session",
                session.status
            )));
        }
        if session.current_step_id != Some(step_id) {
            // Stale client state: reject rather than silently reorder.
            return Err(Error::StepMismatch {
                expected: session.current_step_id,
                submitted: step_id,
            });
        }

        let template = self.templates.get(session.template_id).await?;
        let step = sequencer::find_step(&template, step_id)?.clone();

        let transcript = self.resolve_transcript(&evidence).await;
        let judgement = self
            .judge(&evidence.image, &transcript, &step, &template)
            .await;

        let result = if judgement.pass {
            CheckResult::Pass
        } else {
            CheckResult::Fail
        };

        let mut check = SafetyCheck::new(session_id, step_id, result, judgement.feedback.clone())?;
        if let Some(confidence) = judgement.confidence {
            check = check.with_confidence(confidence)?;
        }
        check.needs_review = judgement.confidence.is_none_or(|c| c < REVIEW_CONFIDENCE_FLOOR)
            || !judgement.sequence_correct;
        check.audio_ref = self
            .feedback_audio(session_id, check.id, &judgement.feedback)
            .await;

        let check_id = check.id;
        let audio_ref = check.audio_ref.clone();
        let needs_review = check.needs_review;
        session.add_check(check)?;

        let mut next_step = None;
        if result.advances() && judgement.sequence_correct {
            if let Some(next_id) = advance_or_complete(&mut session, &template, step_id)? {
                next_step = Some(StepSummary::describe(&template, next_id)?);
            }
        }

        self.sessions.save(&session).await?;

        metrics::checks_executed().add(
            1,
            &[
                KeyValue::new("result", result.to_string()),
                KeyValue::new("source", judgement.source),
            ],
        );
        if session.status == SessionStatus::Completed {
            metrics::session_transitions().add(1, &[KeyValue::new("to", "completed")]);
        }
        info!(
            session = %session_id,
            step = %step_id,
            check = %check_id,
            %result,
            status = %session.status,
            "check recorded"
        );

        Ok(CheckOutcome {
            check_id,
            result,
            feedback_text: judgement.feedback,
            confidence: judgement.confidence,
            audio_ref,
            needs_review,
            session_status: session.status,
            next_step,
        })
    }

    /// Transcript resolution: audio wins when present, a supplied
    /// transcript is second choice, and a silent check is permitted.
    /// Transcription failure degrades to empty rather than blocking.
    async fn resolve_transcript(&self, evidence: &Evidence) -> String {
        let Some(audio) = &evidence.audio else {
            return evidence.transcript.clone().unwrap_or_default();
        };

        let call = self.adapters.transcriber.transcribe(audio);
        match tokio::time::timeout(self.config.transcribe_timeout, call).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                warn!("transcription failed, continuing with empty transcript: {e}");
                metrics::adapter_failures().add(1, &[KeyValue::new("adapter", "transcription")]);
                String::new()
            }
            Err(_) => {
                warn!("transcription timed out, continuing with empty transcript");
                metrics::adapter_failures().add(1, &[KeyValue::new("adapter", "transcription")]);
                String::new()
            }
        }
    }

    /// Verification under a hard deadline. The worker always gets an
    /// actionable answer: adapter trouble becomes a fail with a system
    /// message flagged for review, never an error.
    async fn judge(
        &self,
        image: &ImageData,
        transcript: &str,
        step: &Step,
        template: &SopTemplate,
    ) -> Judgement {
        let started = std::time::Instant::now();
        let call = self
            .adapters
            .verifier
            .verify(image, transcript, step, template);

        let verdict = match tokio::time::timeout(self.config.verify_timeout, call).await {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(e)) => {
                warn!(step = %step.id, "verification adapter failed: {e}");
                metrics::adapter_failures().add(1, &[KeyValue::new("adapter", "verification")]);
                return Judgement::unavailable();
            }
            Err(_) => {
                warn!(step = %step.id, "verification timed out");
                metrics::adapter_failures().add(1, &[KeyValue::new("adapter", "verification")]);
                return Judgement::unavailable();
            }
        };

        metrics::adapter_duration_ms().record(
            started.elapsed().as_millis() as f64,
            &[KeyValue::new("adapter", "verification")],
        );

        Judgement {
            pass: verdict.pass,
            sequence_correct: verdict.sequence_correct,
            confidence: Some(verdict.confidence),
            feedback: verdict.feedback,
            source: "adapter",
        }
    }

    /// Best-effort feedback speech: synthesize, store, return a reference.
    /// Any failure is logged and swallowed.
    async fn feedback_audio(
        &self,
        session_id: SessionId,
        check_id: CheckId,
        text: &str,
    ) -> Option<String> {
        let call = self.adapters.speech.synthesize(text);
        let bytes = match tokio::time::timeout(self.config.speech_timeout, call).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                warn!("speech synthesis failed, returning text-only feedback: {e}");
                metrics::adapter_failures().add(1, &[KeyValue::new("adapter", "speech")]);
                return None;
            }
            Err(_) => {
                warn!("speech synthesis timed out, returning text-only feedback");
                metrics::adapter_failures().add(1, &[KeyValue::new("adapter", "speech")]);
                return None;
            }
        };

        match self.adapters.audio.put(session_id, check_id, &bytes).await {
            Ok(reference) => Some(reference),
            Err(e) => {
                warn!("storing feedback audio failed: {e}");
                None
            }
        }
    }

    pub async fn pause_session(&self, session_id: SessionId, worker_id: Uuid) -> Result<WorkSession> {
        self.mutate_owned(session_id, worker_id, "paused", |s| s.pause())
            .await
    }

    pub async fn resume_session(
        &self,
        session_id: SessionId,
        worker_id: Uuid,
    ) -> Result<WorkSession> {
        self.mutate_owned(session_id, worker_id, "in_progress", |s| s.resume())
            .await
    }

    pub async fn abort_session(
        &self,
        session_id: SessionId,
        worker_id: Uuid,
        reason: Option<String>,
    ) -> Result<WorkSession> {
        self.mutate_owned(session_id, worker_id, "aborted", move |s| s.abort(reason))
            .await
    }

    /// Shared load-guard-mutate-save path for worker lifecycle actions.
    async fn mutate_owned<F>(
        &self,
        session_id: SessionId,
        worker_id: Uuid,
        to: &'static str,
        mutate: F,
    ) -> Result<WorkSession>
    where
        F: FnOnce(&mut WorkSession) -> Result<()>,
    {
        let _guard = self.locks.acquire(session_id).await;
        let mut session = self.sessions.get(session_id).await?;
        if session.worker_id != worker_id {
            return Err(Error::Validation(format!(
                "worker {worker_id} does not own session {session_id}"
            )));
        }
        mutate(&mut session)?;
        self.sessions.save(&session).await?;
        metrics::session_transitions().add(1, &[KeyValue::new("to", to)]);
        info!(session = %session_id, status = %session.status, "session transitioned");
        Ok(session)
    }
}

impl Judgement {
    /// Synthesized fail when the verification adapter is unreachable.
    fn unavailable() -> Self {
        Self {
            pass: false,
            sequence_correct: true,
            confidence: None,
            feedback: "Verification is temporarily unavailable. Hold position and \
                       retry this step; your evidence was not assessed."
                .to_string(),
            source: "synthesized",
        }
    }
}

/// The single advance path. Both a passing check and a supervisor override
/// go through here, so the two can never drift apart: compute the flattened
/// successor of the resolved step, move there, and complete the session
/// when there is none.
pub(crate) fn advance_or_complete(
    session: &mut WorkSession,
    template: &SopTemplate,
    resolved_step: StepId,
) -> Result<Option<StepId>> {
    let next = sequencer::next_step(template, resolved_step)?;
    session.advance_to(next)?;
    Ok(next)
}
