use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard, RwLock};
use uuid::Uuid;

use super::models::PredictionRecord;

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("Prediction not found")]
    NotFound,
    #[error("Prediction belongs to another user")]
    Forbidden,
}

/// In-process prediction history keyed by record id.
#[derive(Clone, Default)]
pub struct HistoryRepository {
    records: Arc<RwLock<HashMap<Uuid, PredictionRecord>>>,
    report_gate: Arc<Mutex<()>>,
}

impl HistoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, record: PredictionRecord) -> PredictionRecord {
        log::info!("Recording prediction {} for {}", record.id, record.owner);
        self.records.write().await.insert(record.id, record.clone());
        record
    }

    /// Fetches a record, refusing access to anyone but its owner.
    pub async fn get_for_owner(
        &self,
        id: Uuid,
        owner: &str,
    ) -> Result<PredictionRecord, HistoryError> {
        let records = self.records.read().await;
        let record = records.get(&id).ok_or(HistoryError::NotFound)?;
        if record.owner != owner {
            log::warn!("{} tried to access prediction {} owned by someone else", owner, id);
            return Err(HistoryError::Forbidden);
        }
        Ok(record.clone())
    }

    /// All records of `owner`, newest first.
    pub async fn list_for_owner(&self, owner: &str) -> Vec<PredictionRecord> {
        let records = self.records.read().await;
        let mut history: Vec<PredictionRecord> = records
            .values()
            .filter(|r| r.owner == owner)
            .cloned()
            .collect();
        history.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        history
    }

    /// Serializes report generation: whoever holds the guard sees the report
    /// path left by the previous holder.
    pub async fn report_guard(&self) -> MutexGuard<'_, ()> {
        self.report_gate.lock().await
    }

    pub async fn attach_report(
        &self,
        id: Uuid,
        report_path: PathBuf,
    ) -> Result<PredictionRecord, HistoryError> {
        let mut records = self.records.write().await;
        let record = records.get_mut(&id).ok_or(HistoryError::NotFound)?;
        record.report_path = Some(report_path);
        Ok(record.clone())
    }
}
