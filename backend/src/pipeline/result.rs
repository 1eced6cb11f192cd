use chrono::{DateTime, Utc};
use shared::ClassLabel;

use super::classifier::ClassScores;
use super::overlay::OverlayImage;

/// Outcome of one analysis. Immutable once built; persistence decides where
/// the overlay ends up and which account the result belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionResult {
    label: ClassLabel,
    confidence: f32,
    scores: ClassScores,
    overlay: OverlayImage,
    created_at: DateTime<Utc>,
}

impl PredictionResult {
    pub fn label(&self) -> ClassLabel {
        self.label
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn scores(&self) -> &ClassScores {
        &self.scores
    }

    pub fn overlay(&self) -> &OverlayImage {
        &self.overlay
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Picks the label by the max-score rule and records its probability as the
/// confidence. No I/O happens here.
pub fn aggregate(
    scores: ClassScores,
    overlay: OverlayImage,
    created_at: DateTime<Utc>,
) -> PredictionResult {
    let label = scores.predicted();
    PredictionResult {
        label,
        confidence: scores.get(label),
        scores,
        overlay,
        created_at,
    }
}
