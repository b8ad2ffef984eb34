//! Audit trail of workflow transitions. Every accepted transition produces
//! one [`AuditEntry`]; the production sink persists it and mirrors it into
//! the in-memory event ring shown in the status snapshot.

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;

use crate::db::Db;
use crate::state::SharedState;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub ts: OffsetDateTime,
    pub entity: &'static str,
    pub entity_id: String,
    pub action: &'static str,
    pub actor: String,
    pub from_state: Option<String>,
    pub to_state: String,
    pub detail: Option<String>,
}

impl AuditEntry {
    pub fn summary(&self) -> String {
        let from = self.from_state.as_deref().unwrap_or("-");
        format!(
            "{} {} {}: {from} -> {} by {}",
            self.entity, self.entity_id, self.action, self.to_state, self.actor
        )
    }
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> anyhow::Result<()>;
}

pub struct DbAuditLog {
    db: Db,
    shared: SharedState,
}

impl DbAuditLog {
    pub fn new(db: Db, shared: SharedState) -> Self {
        Self { db, shared }
    }
}

#[async_trait]
impl AuditLog for DbAuditLog {
    async fn record(&self, entry: AuditEntry) -> anyhow::Result<()> {
        self.db.insert_audit(&entry).await?;
        let mut st = self.shared.write().await;
        st.record_transition(&entry);
        Ok(())
    }
}

#[cfg(test)]
#[derive(Default)]
pub struct MemoryAuditLog(std::sync::Mutex<Vec<AuditEntry>>);

#[cfg(test)]
impl MemoryAuditLog {
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.0.lock().unwrap().clone()
    }

    /// `(entity, action, to_state)` triples, in recording order.
    pub fn actions(&self) -> Vec<(&'static str, &'static str, String)> {
        self.entries()
            .into_iter()
            .map(|e| (e.entity, e.action, e.to_state))
            .collect()
    }
}

#[cfg(test)]
#[async_trait]
impl AuditLog for MemoryAuditLog {
    async fn record(&self, entry: AuditEntry) -> anyhow::Result<()> {
        self.0.lock().unwrap().push(entry);
        Ok(())
    }
}
