//! Postgres store: sessions, checks, and templates via sqlx.
//!
//! Sessions and checks are the regulatory audit trail, so every row is
//! individually addressable and checks are read back in submission order.
//! The one-active-session-per-worker rule is a partial unique index; a
//! violation maps to `ActiveSessionExists` instead of leaking as a raw
//! database error.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::session::{CheckId, SafetyCheck, SessionId, WorkSession};
use crate::model::template::{SopTemplate, Task, TemplateId};
use crate::store::{SessionFilter, SessionStore, TemplateStore};

const ACTIVE_SESSION_INDEX: &str = "one_active_session_per_worker";

/// Postgres-backed store. Owns the connection pool.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Simple health check.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn checks_for(&self, session_id: Uuid) -> Result<Vec<SafetyCheck>> {
        let rows: Vec<CheckRow> = sqlx::query_as(
            "SELECT id, session_id, step_id, result, feedback_text, confidence, audio_ref,
                    needs_review, checked_at, override_reason, override_by
             FROM safety_checks WHERE session_id = $1 ORDER BY checked_at ASC, id ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CheckRow::try_into_check).collect()
    }

    async fn assemble(&self, row: SessionRow) -> Result<WorkSession> {
        let checks = self.checks_for(row.id).await?;
        row.try_into_session(checks)
    }
}

const SESSION_COLUMNS: &str = "id, template_id, worker_id, status, current_step_id, started_at,
    completed_at, approved_at, resolved_by, locked, rejection_reason, abort_reason";

#[async_trait]
impl SessionStore for PgStore {
    async fn create(&self, session: &WorkSession) -> Result<()> {
        let inserted = sqlx::query(
            "INSERT INTO work_sessions (id, template_id, worker_id, status, current_step_id,
                started_at, completed_at, approved_at, resolved_by, locked,
                rejection_reason, abort_reason)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(session.id.0)
        .bind(session.template_id.0)
        .bind(session.worker_id)
        .bind(session.status.to_string())
        .bind(session.current_step_id.map(|s| s.0))
        .bind(session.started_at)
        .bind(session.completed_at)
        .bind(session.approved_at)
        .bind(session.resolved_by)
        .bind(session.locked)
        .bind(&session.rejection_reason)
        .bind(&session.abort_reason)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.constraint() == Some(ACTIVE_SESSION_INDEX) => {
                let existing = self.active_for_worker(session.worker_id).await?;
                Err(Error::ActiveSessionExists {
                    worker_id: session.worker_id,
                    session_id: existing.map(|s| s.id.0).unwrap_or_else(Uuid::nil),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: SessionId) -> Result<WorkSession> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM work_sessions WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or_else(|| Error::NotFound(format!("session {id}")))?;
        self.assemble(row).await
    }

    async fn get_by_check(&self, check_id: CheckId) -> Result<WorkSession> {
        let owner: Option<(Uuid,)> =
            sqlx::query_as("SELECT session_id FROM safety_checks WHERE id = $1")
                .bind(check_id.0)
                .fetch_optional(&self.pool)
                .await?;

        let (session_id,) = owner.ok_or_else(|| Error::NotFound(format!("check {check_id}")))?;
        SessionStore::get(self, SessionId(session_id)).await
    }

    async fn active_for_worker(&self, worker_id: Uuid) -> Result<Option<WorkSession>> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM work_sessions
             WHERE worker_id = $1 AND status IN ('in_progress', 'paused')"
        ))
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.assemble(row).await?)),
            None => Ok(None),
        }
    }

    async fn save(&self, session: &WorkSession) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let rows_affected = sqlx::query(
            "UPDATE work_sessions SET status = $1, current_step_id = $2, completed_at = $3,
                approved_at = $4, resolved_by = $5, locked = $6,
                rejection_reason = $7, abort_reason = $8
             WHERE id = $9",
        )
        .bind(session.status.to_string())
        .bind(session.current_step_id.map(|s| s.0))
        .bind(session.completed_at)
        .bind(session.approved_at)
        .bind(session.resolved_by)
        .bind(session.locked)
        .bind(&session.rejection_reason)
        .bind(&session.abort_reason)
        .bind(session.id.0)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(Error::NotFound(format!("session {}", session.id)));
        }

        // Checks are append-only except the fail->override reclassification,
        // so the conflict arm updates only the override fields.
        for check in &session.checks {
            sqlx::query(
                "INSERT INTO safety_checks (id, session_id, step_id, result, feedback_text,
                    confidence, audio_ref, needs_review, checked_at, override_reason, override_by)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                 ON CONFLICT (id) DO UPDATE SET
                    result = EXCLUDED.result,
                    override_reason = EXCLUDED.override_reason,
                    override_by = EXCLUDED.override_by",
            )
            .bind(check.id.0)
            .bind(check.session_id.0)
            .bind(check.step_id.0)
            .bind(check.result.to_string())
            .bind(&check.feedback_text)
            .bind(check.confidence)
            .bind(&check.audio_ref)
            .bind(check.needs_review)
            .bind(check.checked_at)
            .bind(&check.override_reason)
            .bind(check.override_by)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list(&self, filter: &SessionFilter) -> Result<Vec<WorkSession>> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM work_sessions
             WHERE ($1::text IS NULL OR status = $1)
               AND ($2::uuid IS NULL OR worker_id = $2)
             ORDER BY started_at DESC
             LIMIT $3"
        ))
        .bind(filter.status.map(|s| s.to_string()))
        .bind(filter.worker_id)
        .bind(filter.limit_or_default())
        .fetch_all(&self.pool)
        .await?;

        let mut sessions = Vec::with_capacity(rows.len());
        for row in rows {
            sessions.push(self.assemble(row).await?);
        }
        Ok(sessions)
    }
}

#[async_trait]
impl TemplateStore for PgStore {
    async fn insert(&self, template: &SopTemplate) -> Result<()> {
        let structure = serde_json::to_value(&template.tasks)
            .map_err(|e| Error::Other(format!("serialize template: {e}")))?;

        sqlx::query(
            "INSERT INTO sop_templates (id, title, created_by, created_at, structure)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(template.id.0)
        .bind(&template.title)
        .bind(template.created_by)
        .bind(template.created_at)
        .bind(structure)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: TemplateId) -> Result<SopTemplate> {
        let row: Option<TemplateRow> = sqlx::query_as(
            "SELECT id, title, created_by, created_at, structure
             FROM sop_templates WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| Error::NotFound(format!("template {id}")))?
            .try_into_template()
    }

    async fn list(&self, limit: i64) -> Result<Vec<SopTemplate>> {
        let rows: Vec<TemplateRow> = sqlx::query_as(
            "SELECT id, title, created_by, created_at, structure
             FROM sop_templates ORDER BY created_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TemplateRow::try_into_template).collect()
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: Uuid,
    template_id: Uuid,
    worker_id: Uuid,
    status: String,
    current_step_id: Option<Uuid>,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    approved_at: Option<DateTime<Utc>>,
    resolved_by: Option<Uuid>,
    locked: bool,
    rejection_reason: Option<String>,
    abort_reason: Option<String>,
}

impl SessionRow {
    fn try_into_session(self, checks: Vec<SafetyCheck>) -> Result<WorkSession> {
        Ok(WorkSession {
            id: SessionId(self.id),
            template_id: TemplateId(self.template_id),
            worker_id: self.worker_id,
            status: self.status.parse()?,
            current_step_id: self.current_step_id.map(crate::model::template::StepId),
            started_at: self.started_at,
            completed_at: self.completed_at,
            approved_at: self.approved_at,
            resolved_by: self.resolved_by,
            locked: self.locked,
            rejection_reason: self.rejection_reason,
            abort_reason: self.abort_reason,
            checks,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CheckRow {
    id: Uuid,
    session_id: Uuid,
    step_id: Uuid,
    result: String,
    feedback_text: String,
    confidence: Option<f64>,
    audio_ref: Option<String>,
    needs_review: bool,
    checked_at: DateTime<Utc>,
    override_reason: Option<String>,
    override_by: Option<Uuid>,
}

impl CheckRow {
    fn try_into_check(self) -> Result<SafetyCheck> {
        Ok(SafetyCheck {
            id: CheckId(self.id),
            session_id: SessionId(self.session_id),
            step_id: crate::model::template::StepId(self.step_id),
            result: self.result.parse()?,
            feedback_text: self.feedback_text,
            confidence: self.confidence,
            audio_ref: self.audio_ref,
            needs_review: self.needs_review,
            checked_at: self.checked_at,
            override_reason: self.override_reason,
            override_by: self.override_by,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TemplateRow {
    id: Uuid,
    title: String,
    created_by: Uuid,
    created_at: DateTime<Utc>,
    structure: serde_json::Value,
}

impl TemplateRow {
    fn try_into_template(self) -> Result<SopTemplate> {
        let tasks: Vec<Task> = serde_json::from_value(self.structure)
            .map_err(|e| Error::Other(format!("corrupt template structure: {e}")))?;
        Ok(SopTemplate {
            id: TemplateId(self.id),
            title: self.title,
            created_by: self.created_by,
            created_at: self.created_at,
            tasks,
        })
    }
}
