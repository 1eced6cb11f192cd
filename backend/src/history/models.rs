use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{ClassLabel, HistoryEntry};
use uuid::Uuid;

use crate::pipeline::PredictionResult;
use crate::storage::StoredImages;

/// A stored analysis, as listed in a user's history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PredictionRecord {
    pub id: Uuid,
    pub owner: String,
    pub original_image_path: PathBuf,
    pub heatmap_image_path: PathBuf,
    pub prediction_class: ClassLabel,
    pub confidence_cancer: f32,
    pub confidence_normal: f32,
    pub report_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
}

impl PredictionRecord {
    pub fn from_prediction(owner: String, result: &PredictionResult, files: StoredImages) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner,
            original_image_path: files.original,
            heatmap_image_path: files.heatmap,
            prediction_class: result.label(),
            confidence_cancer: result.scores().cancer(),
            confidence_normal: result.scores().normal(),
            report_path: None,
            created_at: result.created_at(),
        }
    }

    pub fn confidence(&self) -> f32 {
        match self.prediction_class {
            ClassLabel::Cancer => self.confidence_cancer,
            ClassLabel::Normal => self.confidence_normal,
        }
    }

    pub fn to_history_entry(&self) -> HistoryEntry {
        HistoryEntry {
            id: self.id,
            prediction_class: self.prediction_class,
            confidence_cancer: self.confidence_cancer,
            confidence_normal: self.confidence_normal,
            has_report: self.report_path.is_some(),
            created_at: self.created_at.to_rfc3339(),
        }
    }
}
