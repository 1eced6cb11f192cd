use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

/// The two fixed classes the classifier distinguishes. The order of the
/// variants is the order of the classifier's output logits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ClassLabel {
    Cancer,
    Normal,
}

impl ClassLabel {
    pub const ALL: [ClassLabel; 2] = [ClassLabel::Cancer, ClassLabel::Normal];

    pub fn index(self) -> usize {
        match self {
            ClassLabel::Cancer => 0,
            ClassLabel::Normal => 1,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PredictionResponse {
    pub id: Uuid,
    pub prediction_class: ClassLabel,
    pub confidence: f32,
    pub confidence_cancer: f32,
    pub confidence_normal: f32,
    pub original_image_url: String,
    pub heatmap_image_url: String,
    pub created_at: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct HistoryEntry {
    pub id: Uuid,
    pub prediction_class: ClassLabel,
    pub confidence_cancer: f32,
    pub confidence_normal: f32,
    pub has_report: bool,
    pub created_at: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ErrorResponse {
    pub error: String,
}
