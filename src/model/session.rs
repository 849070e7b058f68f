//! Work session aggregate and its lifecycle state machine.
//!
//! A session tracks one worker's progress through a template. Every
//! mutation goes through the methods here; each method checks the lock
//! and status guards before touching state, so an invalid call leaves
//! the aggregate untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::template::{StepId, TemplateId};

/// Newtype for session IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Newtype for safety check IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckId(pub Uuid);

impl CheckId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CheckId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CheckId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a work session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Worker actively executing steps.
    InProgress,
    /// Worker stepped away; resumable.
    Paused,
    /// Last step resolved. Awaiting supervisor review.
    Completed,
    /// Worker or supervisor cancelled mid-run. Terminal.
    Aborted,
    /// Supervisor signed off. Terminal and locked.
    Approved,
    /// Supervisor sent it back. Terminal, readable, never locked.
    Rejected,
}

impl SessionStatus {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, to),
            (InProgress, Paused)
                | (Paused, InProgress)
                | (InProgress, Aborted)
                | (Paused, Aborted)
                | (InProgress, Completed)
                | (Completed, Approved)
                | (Completed, Rejected)
        )
    }

    /// Is this a terminal status?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Aborted | SessionStatus::Approved | SessionStatus::Rejected
        )
    }

    /// Does this status count against the one-active-session-per-worker rule?
    pub fn is_active(self) -> bool {
        matches!(self, SessionStatus::InProgress | SessionStatus::Paused)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Aborted => "aborted",
            SessionStatus::Approved => "approved",
            SessionStatus::Rejected => "rejected",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "in_progress" => Ok(SessionStatus::InProgress),
            "paused" => Ok(SessionStatus::Paused),
            "completed" => Ok(SessionStatus::Completed),
            "aborted" => Ok(SessionStatus::Aborted),
            "approved" => Ok(SessionStatus::Approved),
            "rejected" => Ok(SessionStatus::Rejected),
            _ => Err(Error::Other(format!("unknown session status: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Safety Check
// ---------------------------------------------------------------------------

/// Verdict recorded for one verification attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckResult {
    Pass,
    Fail,
    /// A supervisor reclassified a Fail to permit progress.
    Override,
}

impl CheckResult {
    /// Pass and Override both progress the session; Fail holds it.
    pub fn advances(self) -> bool {
        matches!(self, CheckResult::Pass | CheckResult::Override)
    }
}

impl std::fmt::Display for CheckResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CheckResult::Pass => "pass",
            CheckResult::Fail => "fail",
            CheckResult::Override => "override",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for CheckResult {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pass" => Ok(CheckResult::Pass),
            "fail" => Ok(CheckResult::Fail),
            "override" => Ok(CheckResult::Override),
            _ => Err(Error::Other(format!("unknown check result: {s}"))),
        }
    }
}

/// One verification attempt against the step the session expected.
///
/// Append-only: the single permitted mutation is Fail -> Override, which
/// adds the supervisor metadata alongside the reclassified result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyCheck {
    pub id: CheckId,
    pub session_id: SessionId,
    pub step_id: StepId,
    pub result: CheckResult,
    pub feedback_text: String,
    /// Adapter confidence, 0..1. Absent for synthesized failure results.
    pub confidence: Option<f64>,
    /// Reference to stored feedback audio, when synthesis succeeded.
    pub audio_ref: Option<String>,
    /// Flagged when confidence is low or the adapter reported the worker
    /// out of sequence.
    pub needs_review: bool,
    pub checked_at: DateTime<Utc>,
    pub override_reason: Option<String>,
    pub override_by: Option<Uuid>,
}

impl SafetyCheck {
    pub fn new(
        session_id: SessionId,
        step_id: StepId,
        result: CheckResult,
        feedback_text: impl Into<String>,
    ) -> Result<Self> {
        let feedback_text = feedback_text.into();
        if feedback_text.trim().is_empty() {
            return Err(Error::Validation("feedback text cannot be empty".into()));
        }
        Ok(Self {
            id: CheckId::new(),
            session_id,
            step_id,
            result,
            feedback_text,
            confidence: None,
            audio_ref: None,
            needs_review: false,
            checked_at: Utc::now(),
            override_reason: None,
            override_by: None,
        })
    }

    pub fn with_confidence(mut self, confidence: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(Error::Validation(format!(
                "confidence must be within 0..1, got {confidence}"
            )));
        }
        self.confidence = Some(confidence);
        Ok(self)
    }
}

// ---------------------------------------------------------------------------
// Work Session
// ---------------------------------------------------------------------------

/// Work session aggregate root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkSession {
    pub id: SessionId,
    pub template_id: TemplateId,
    pub worker_id: Uuid,
    pub status: SessionStatus,
    /// The step the engine expects next. None only once the run is done.
    pub current_step_id: Option<StepId>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
    /// Supervisor who approved or rejected.
    pub resolved_by: Option<Uuid>,
    /// Permanent write protection, set on approval.
    pub locked: bool,
    pub rejection_reason: Option<String>,
    pub abort_reason: Option<String>,
    /// Checks in submission order (a worker may retry a failed step).
    pub checks: Vec<SafetyCheck>,
}

impl WorkSession {
    /// Start a fresh session positioned at the template's first step.
    pub fn start(template_id: TemplateId, worker_id: Uuid, first_step: StepId) -> Self {
        Self {
            id: SessionId::new(),
            template_id,
            worker_id,
            status: SessionStatus::InProgress,
            current_step_id: Some(first_step),
            started_at: Utc::now(),
            completed_at: None,
            approved_at: None,
            resolved_by: None,
            locked: false,
            rejection_reason: None,
            abort_reason: None,
            checks: Vec::new(),
        }
    }

    fn ensure_unlocked(&self) -> Result<()> {
        if self.locked {
            Err(Error::StateConflict(format!(
                "session {} is locked",
                self.id
            )))
        } else {
            Ok(())
        }
    }

    fn transition(&mut self, to: SessionStatus) -> Result<()> {
        self.ensure_unlocked()?;
        if !self.status.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    pub fn pause(&mut self) -> Result<()> {
        self.transition(SessionStatus::Paused)
    }

    pub fn resume(&mut self) -> Result<()> {
        self.transition(SessionStatus::InProgress)
    }

    pub fn abort(&mut self, reason: Option<String>) -> Result<()> {
        self.transition(SessionStatus::Aborted)?;
        self.abort_reason = reason;
        Ok(())
    }

    /// Record a verification attempt. Only valid while in progress.
    pub fn add_check(&mut self, check: SafetyCheck) -> Result<&SafetyCheck> {
        self.ensure_unlocked()?;
        if self.status != SessionStatus::InProgress {
            return Err(Error::StateConflict(format!(
                "cannot add checks to a {} session",
                self.status
            )));
        }
        self.checks.push(check);
        Ok(self.checks.last().unwrap())
    }

    /// Move to the given step, or complete the session when `None`.
    pub fn advance_to(&mut self, next_step: Option<StepId>) -> Result<()> {
        self.ensure_unlocked()?;
        if self.status != SessionStatus::InProgress {
            return Err(Error::StateConflict(format!(
                "cannot advance a {} session",
                self.status
            )));
        }
        self.current_step_id = next_step;
        if next_step.is_none() {
            self.transition(SessionStatus::Completed)?;
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Approve a completed session and lock it permanently.
    pub fn approve(&mut self, supervisor_id: Uuid) -> Result<()> {
        self.transition(SessionStatus::Approved)?;
        self.approved_at = Some(Utc::now());
        self.resolved_by = Some(supervisor_id);
        self.locked = true;
        Ok(())
    }

    /// Reject a completed session. Terminal, but never locked: the record
    /// stays readable and distinguishable from an approved one.
    pub fn reject(&mut self, supervisor_id: Uuid, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        if reason.trim().is_empty() {
            return Err(Error::Validation("rejection reason is required".into()));
        }
        self.transition(SessionStatus::Rejected)?;
        self.rejection_reason = Some(reason);
        self.resolved_by = Some(supervisor_id);
        Ok(())
    }

    pub fn find_check(&self, check_id: CheckId) -> Option<&SafetyCheck> {
        self.checks.iter().find(|c| c.id == check_id)
    }

    /// Reclassify a failed check as overridden. The one permitted check
    /// mutation; everything else about the check stays as recorded.
    pub fn override_check(
        &mut self,
        check_id: CheckId,
        supervisor_id: Uuid,
        reason: impl Into<String>,
    ) -> Result<&SafetyCheck> {
        self.ensure_unlocked()?;
        let reason = reason.into();
        if reason.trim().is_empty() {
            return Err(Error::Validation("override reason is required".into()));
        }

        let check = self
            .checks
            .iter_mut()
            .find(|c| c.id == check_id)
            .ok_or_else(|| Error::NotFound(format!("check {check_id}")))?;

        if check.result != CheckResult::Fail {
            return Err(Error::StateConflict(format!(
                "only a fail check can be overridden, check {check_id} is {}",
                check.result
            )));
        }

        check.result = CheckResult::Override;
        check.override_reason = Some(reason);
        check.override_by = Some(supervisor_id);
        Ok(check)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> WorkSession {
        WorkSession::start(TemplateId::new(), Uuid::new_v4(), StepId::new())
    }

    fn pass_check(s: &WorkSession) -> SafetyCheck {
        SafetyCheck::new(
            s.id,
            s.current_step_id.unwrap(),
            CheckResult::Pass,
            "looks good",
        )
        .unwrap()
    }

    #[test]
    fn pause_resume_roundtrip() {
        let mut s = session();
        s.pause().unwrap();
        assert_eq!(s.status, SessionStatus::Paused);
        s.resume().unwrap();
        assert_eq!(s.status, SessionStatus::InProgress);
    }

    #[test]
    fn abort_from_paused_is_terminal() {
        let mut s = session();
        s.pause().unwrap();
        s.abort(Some("shift ended".into())).unwrap();
        assert_eq!(s.status, SessionStatus::Aborted);
        assert!(s.status.is_terminal());
        assert!(s.resume().is_err());
    }

    #[test]
    fn advance_to_none_completes() {
        let mut s = session();
        s.advance_to(None).unwrap();
        assert_eq!(s.status, SessionStatus::Completed);
        assert!(s.current_step_id.is_none());
        assert!(s.completed_at.is_some());
    }

    #[test]
    fn approve_locks_and_blocks_all_mutators() {
        let mut s = session();
        s.advance_to(None).unwrap();
        s.approve(Uuid::new_v4()).unwrap();
        assert!(s.locked);
        assert_eq!(s.status, SessionStatus::Approved);

        let before = s.clone();
        assert!(matches!(s.pause(), Err(Error::StateConflict(_))));
        assert!(matches!(
            s.add_check(pass_check(&before)),
            Err(Error::StateConflict(_))
        ));
        assert!(matches!(s.advance_to(None), Err(Error::StateConflict(_))));
        assert!(matches!(
            s.reject(Uuid::new_v4(), "nope"),
            Err(Error::StateConflict(_))
        ));
        // state unchanged
        assert_eq!(s.status, before.status);
        assert_eq!(s.checks.len(), before.checks.len());
    }

    #[test]
    fn approve_requires_completed() {
        let mut s = session();
        assert!(matches!(
            s.approve(Uuid::new_v4()),
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[test]
    fn reject_is_terminal_but_not_locked() {
        let mut s = session();
        s.advance_to(None).unwrap();
        s.reject(Uuid::new_v4(), "missing evidence on step 2").unwrap();
        assert_eq!(s.status, SessionStatus::Rejected);
        assert!(!s.locked);
        assert!(s.rejection_reason.is_some());
        // still immutable in practice: no transitions out of Rejected
        assert!(s.pause().is_err());
    }

    #[test]
    fn reject_requires_reason() {
        let mut s = session();
        s.advance_to(None).unwrap();
        assert!(matches!(
            s.reject(Uuid::new_v4(), "   "),
            Err(Error::Validation(_))
        ));
        assert_eq!(s.status, SessionStatus::Completed);
    }

    #[test]
    fn add_check_requires_in_progress() {
        let mut s = session();
        let check = pass_check(&s);
        s.pause().unwrap();
        assert!(matches!(s.add_check(check), Err(Error::StateConflict(_))));
    }

    #[test]
    fn override_only_applies_to_fail() {
        let mut s = session();
        let check = pass_check(&s);
        let id = check.id;
        s.add_check(check).unwrap();

        assert!(matches!(
            s.override_check(id, Uuid::new_v4(), "supervisor says ok"),
            Err(Error::StateConflict(_))
        ));
    }

    #[test]
    fn override_sets_metadata() {
        let mut s = session();
        let step = s.current_step_id.unwrap();
        let check = SafetyCheck::new(s.id, step, CheckResult::Fail, "valve still open").unwrap();
        let id = check.id;
        s.add_check(check).unwrap();

        let supervisor = Uuid::new_v4();
        s.override_check(id, supervisor, "verified in person").unwrap();
        let c = s.find_check(id).unwrap();
        assert_eq!(c.result, CheckResult::Override);
        assert_eq!(c.override_by, Some(supervisor));
        assert_eq!(c.override_reason.as_deref(), Some("verified in person"));
    }

    #[test]
    fn confidence_must_be_in_range() {
        let s = session();
        let c = SafetyCheck::new(s.id, StepId::new(), CheckResult::Pass, "ok").unwrap();
        assert!(c.clone().with_confidence(1.2).is_err());
        assert!(c.with_confidence(0.9).is_ok());
    }
}
