//! Persistence boundaries for sessions and templates.
//!
//! Two implementations: `memory` for tests and local development, `pg`
//! for the real thing. Sessions and their checks survive process restart
//! in the Postgres store; both stores enforce the single-active-session
//! rule at the storage layer, not as a check-then-act in the caller.

pub mod memory;
pub mod pg;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::model::session::{CheckId, SessionId, SessionStatus, WorkSession};
use crate::model::template::{SopTemplate, TemplateId};

/// Filter for session listings.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub status: Option<SessionStatus>,
    pub worker_id: Option<Uuid>,
    pub limit: Option<i64>,
}

impl SessionFilter {
    pub fn limit_or_default(&self) -> i64 {
        self.limit.unwrap_or(50)
    }
}

/// Session persistence. The aggregate (session plus its checks) is the
/// unit of read and write.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new session. Fails with `ActiveSessionExists` when the
    /// worker already has one in progress or paused.
    async fn create(&self, session: &WorkSession) -> Result<()>;

    async fn get(&self, id: SessionId) -> Result<WorkSession>;

    /// Resolve the session that owns a given check.
    async fn get_by_check(&self, check_id: CheckId) -> Result<WorkSession>;

    async fn active_for_worker(&self, worker_id: Uuid) -> Result<Option<WorkSession>>;

    /// Write back a mutated aggregate. Fails with `NotFound` if the
    /// session was never created.
    async fn save(&self, session: &WorkSession) -> Result<()>;

    async fn list(&self, filter: &SessionFilter) -> Result<Vec<WorkSession>>;
}

/// Read-mostly template persistence.
#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn insert(&self, template: &SopTemplate) -> Result<()>;
    async fn get(&self, id: TemplateId) -> Result<SopTemplate>;
    async fn list(&self, limit: i64) -> Result<Vec<SopTemplate>>;
}
