//! In-memory store for tests and local development.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::session::{CheckId, SessionId, WorkSession};
use crate::model::template::{SopTemplate, TemplateId};
use crate::store::{SessionFilter, SessionStore, TemplateStore};

/// Backs both store traits with maps behind an async RwLock.
#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<Uuid, WorkSession>>,
    templates: RwLock<HashMap<Uuid, SopTemplate>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create(&self, session: &WorkSession) -> Result<()> {
        // Uniqueness check and insert under one write lock, so two racing
        // starts cannot both slip through.
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions
            .values()
            .find(|s| s.worker_id == session.worker_id && s.status.is_active())
        {
            return Err(Error::ActiveSessionExists {
                worker_id: session.worker_id,
                session_id: existing.id.0,
            });
        }
        sessions.insert(session.id.0, session.clone());
        Ok(())
    }

    async fn get(&self, id: SessionId) -> Result<WorkSession> {
        self.sessions
            .read()
            .await
            .get(&id.0)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("session {id}")))
    }

    async fn get_by_check(&self, check_id: CheckId) -> Result<WorkSession> {
        self.sessions
            .read()
            .await
            .values()
            .find(|s| s.checks.iter().any(|c| c.id == check_id))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("check {check_id}")))
    }

    async fn active_for_worker(&self, worker_id: Uuid) -> Result<Option<WorkSession>> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .find(|s| s.worker_id == worker_id && s.status.is_active())
            .cloned())
    }

    async fn save(&self, session: &WorkSession) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if !sessions.contains_key(&session.id.0) {
            return Err(Error::NotFound(format!("session {}", session.id)));
        }
        sessions.insert(session.id.0, session.clone());
        Ok(())
    }

    async fn list(&self, filter: &SessionFilter) -> Result<Vec<WorkSession>> {
        let sessions = self.sessions.read().await;
        let mut matched: Vec<WorkSession> = sessions
            .values()
            .filter(|s| filter.status.is_none_or(|status| s.status == status))
            .filter(|s| filter.worker_id.is_none_or(|w| s.worker_id == w))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        matched.truncate(filter.limit_or_default() as usize);
        Ok(matched)
    }
}

#[async_trait]
impl TemplateStore for MemoryStore {
    async fn insert(&self, template: &SopTemplate) -> Result<()> {
        self.templates
            .write()
            .await
            .insert(template.id.0, template.clone());
        Ok(())
    }

    async fn get(&self, id: TemplateId) -> Result<SopTemplate> {
        self.templates
            .read()
            .await
            .get(&id.0)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("template {id}")))
    }

    async fn list(&self, limit: i64) -> Result<Vec<SopTemplate>> {
        let templates = self.templates.read().await;
        let mut all: Vec<SopTemplate> = templates.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all.truncate(limit as usize);
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::template::StepId;

    #[tokio::test]
    async fn create_rejects_second_active_session_for_worker() {
        let store = MemoryStore::new();
        let worker = Uuid::new_v4();

        let first = WorkSession::start(TemplateId::new(), worker, StepId::new());
        store.create(&first).await.unwrap();

        let second = WorkSession::start(TemplateId::new(), worker, StepId::new());
        let err = store.create(&second).await.unwrap_err();
        assert!(matches!(err, Error::ActiveSessionExists { .. }));

        // a paused session still counts as active
        let mut paused = SessionStore::get(&store, first.id).await.unwrap();
        paused.pause().unwrap();
        store.save(&paused).await.unwrap();
        assert!(store.create(&second).await.is_err());
    }

    #[tokio::test]
    async fn terminal_session_frees_the_worker() {
        let store = MemoryStore::new();
        let worker = Uuid::new_v4();

        let mut first = WorkSession::start(TemplateId::new(), worker, StepId::new());
        store.create(&first).await.unwrap();
        first.abort(None).unwrap();
        store.save(&first).await.unwrap();

        let second = WorkSession::start(TemplateId::new(), worker, StepId::new());
        store.create(&second).await.unwrap();
    }

    #[tokio::test]
    async fn save_unknown_session_is_not_found() {
        let store = MemoryStore::new();
        let s = WorkSession::start(TemplateId::new(), Uuid::new_v4(), StepId::new());
        assert!(matches!(store.save(&s).await, Err(Error::NotFound(_))));
    }
}
