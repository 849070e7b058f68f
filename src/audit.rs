//! Audit ledger: read-side aggregation and supervisor entry points.
//!
//! Approve, reject, and override delegate their guards to the session
//! state machine; this module adds the lookup, locking, and summary
//! shaping. Override routes through the same advance path as a passing
//! check.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::error::Result;
use crate::model::session::{CheckId, CheckResult, SessionId, SessionStatus, WorkSession};
use crate::model::template::TemplateId;
use crate::orchestrator::{self, SessionLocks, StepSummary};
use crate::store::{SessionFilter, SessionStore, TemplateStore};
use crate::telemetry::metrics;

/// One row in the supervisor's review queue.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub template_id: TemplateId,
    pub template_title: String,
    pub worker_id: Uuid,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub check_count: usize,
    pub failed_check_count: usize,
    pub needs_review_count: usize,
}

/// Full audit trail: the session with its checks in submission order.
#[derive(Debug, Clone, Serialize)]
pub struct AuditTrail {
    pub session: WorkSession,
    pub template_title: String,
}

/// Result of a supervisor override.
#[derive(Debug, Clone)]
pub struct OverrideOutcome {
    pub check_id: CheckId,
    pub session_status: SessionStatus,
    /// Whether the override progressed the session (it does exactly when
    /// the overridden check's step was still the current one).
    pub advanced: bool,
    pub next_step: Option<StepSummary>,
}

pub struct AuditLedger {
    sessions: Arc<dyn SessionStore>,
    templates: Arc<dyn TemplateStore>,
    locks: Arc<SessionLocks>,
}

impl AuditLedger {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        templates: Arc<dyn TemplateStore>,
        locks: Arc<SessionLocks>,
    ) -> Self {
        Self {
            sessions,
            templates,
            locks,
        }
    }

    /// List sessions for review, newest first.
    pub async fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<SessionSummary>> {
        let sessions = self.sessions.list(filter).await?;

        let mut titles: HashMap<Uuid, String> = HashMap::new();
        let mut summaries = Vec::with_capacity(sessions.len());
        for session in sessions {
            let title = match titles.get(&session.template_id.0) {
                Some(t) => t.clone(),
                None => {
                    let t = self
                        .templates
                        .get(session.template_id)
                        .await
                        .map(|t| t.title)
                        .unwrap_or_else(|_| "(template missing)".to_string());
                    titles.insert(session.template_id.0, t.clone());
                    t
                }
            };

            summaries.push(SessionSummary {
                session_id: session.id,
                template_id: session.template_id,
                template_title: title,
                worker_id: session.worker_id,
                status: session.status,
                started_at: session.started_at,
                completed_at: session.completed_at,
                check_count: session.checks.len(),
                failed_check_count: session
                    .checks
                    .iter()
                    .filter(|c| c.result == CheckResult::Fail)
                    .count(),
                needs_review_count: session.checks.iter().filter(|c| c.needs_review).count(),
            });
        }
        Ok(summaries)
    }

    /// Everything a supervisor needs to judge one session.
    pub async fn audit_trail(&self, session_id: SessionId) -> Result<AuditTrail> {
        let session = self.sessions.get(session_id).await?;
        let template_title = self
            .templates
            .get(session.template_id)
            .await
            .map(|t| t.title)
            .unwrap_or_else(|_| "(template missing)".to_string());
        Ok(AuditTrail {
            session,
            template_title,
        })
    }

    /// Approve a completed session, locking it permanently.
    pub async fn approve(&self, session_id: SessionId, supervisor_id: Uuid) -> Result<WorkSession> {
        let _guard = self.locks.acquire(session_id).await;
        let mut session = self.sessions.get(session_id).await?;
        session.approve(supervisor_id)?;
        self.sessions.save(&session).await?;

        metrics::session_transitions().add(1, &[KeyValue::new("to", "approved")]);
        info!(session = %session_id, %supervisor_id, "session approved and locked");
        Ok(session)
    }

    /// Reject a completed session with a reason. Terminal but not locked.
    pub async fn reject(
        &self,
        session_id: SessionId,
        supervisor_id: Uuid,
        reason: impl Into<String>,
    ) -> Result<WorkSession> {
        let _guard = self.locks.acquire(session_id).await;
        let mut session = self.sessions.get(session_id).await?;
        session.reject(supervisor_id, reason)?;
        self.sessions.save(&session).await?;

        metrics::session_transitions().add(1, &[KeyValue::new("to", "rejected")]);
        info!(session = %session_id, %supervisor_id, "session rejected");
        Ok(session)
    }

    /// Reclassify a failed check so the worker can progress despite the
    /// adverse verdict. Runs the same advance path as a pass when the
    /// overridden check's step is still the session's current step.
    pub async fn override_check(
        &self,
        check_id: CheckId,
        supervisor_id: Uuid,
        reason: impl Into<String>,
    ) -> Result<OverrideOutcome> {
        // Resolve the owning session first, then take its lock and reload
        // so we operate on fresh state.
        let session_id = self.sessions.get_by_check(check_id).await?.id;
        let _guard = self.locks.acquire(session_id).await;
        let mut session = self.sessions.get(session_id).await?;

        let step_id = session
            .override_check(check_id, supervisor_id, reason)?
            .step_id;

        let mut advanced = false;
        let mut next_step = None;
        if session.status == SessionStatus::InProgress
            && session.current_step_id == Some(step_id)
        {
            let template = self.templates.get(session.template_id).await?;
            if let Some(next_id) =
                orchestrator::advance_or_complete(&mut session, &template, step_id)?
            {
                next_step = Some(StepSummary::describe(&template, next_id)?);
            }
            advanced = true;
        }

        self.sessions.save(&session).await?;

        metrics::checks_executed().add(
            1,
            &[
                KeyValue::new("result", "override"),
                KeyValue::new("source", "supervisor"),
            ],
        );
        info!(
            check = %check_id,
            session = %session_id,
            %supervisor_id,
            advanced,
            "check overridden"
        );

        Ok(OverrideOutcome {
            check_id,
            session_status: session.status,
            advanced,
            next_step,
        })
    }
}
