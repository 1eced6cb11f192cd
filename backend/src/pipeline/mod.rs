//! Inference and explainability pipeline.
//!
//! `RawImage` -> preprocess -> classify (forward + backward) -> GradCAM ->
//! overlay -> `PredictionResult`. Every stage is pure; reading uploads and
//! writing overlays or reports happens around it.

pub mod classifier;
pub mod error;
pub mod gradcam;
pub mod overlay;
pub mod preprocess;
pub mod result;

use std::time::Instant;

use chrono::Utc;

pub use classifier::{
    Activation, ActivationSnapshot, ClassScores, Classifier, ClassifierAdapter, ForwardPass,
    TIE_BREAK_LABEL,
};
pub use error::PipelineError;
pub use gradcam::{ImportanceMap, grad_cam};
pub use overlay::{DEFAULT_ALPHA, OverlayImage, compose};
pub use preprocess::{ImageKind, InputSpec, PreparedTensor, RawImage, preprocess};
pub use result::{PredictionResult, aggregate};

/// One upload to analyse. `owner` is carried through untouched.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub owner: String,
    pub image: RawImage,
}

/// Everything the pipeline produced for a request.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub owner: String,
    /// The upload, handed back untouched for storage.
    pub image: RawImage,
    pub prediction: PredictionResult,
    /// GradCAM map at the resolution of the target layer.
    pub importance: ImportanceMap,
}

#[derive(Clone)]
pub struct Pipeline {
    classifier: ClassifierAdapter,
    alpha: f32,
}

impl Pipeline {
    pub fn new(classifier: ClassifierAdapter) -> Self {
        Self {
            classifier,
            alpha: DEFAULT_ALPHA,
        }
    }

    pub fn with_alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn classifier(&self) -> &ClassifierAdapter {
        &self.classifier
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    pub fn analyze(&self, request: AnalysisRequest) -> Result<Analysis, PipelineError> {
        let AnalysisRequest { owner, image } = request;
        let started = Instant::now();

        let (original, tensor) = preprocess(&image, &self.classifier.input_spec())?;
        let (scores, snapshot) = self.classifier.classify(&tensor)?;
        drop(tensor);

        let importance = grad_cam(&snapshot);
        let full = importance.upsample(original.width() as usize, original.height() as usize);
        let overlay = compose(&original, &full, self.alpha);
        let prediction = aggregate(scores, overlay, Utc::now());

        log::debug!(
            "analysed {}x{} image for {}: {} ({:.4}) in {:?}",
            original.width(),
            original.height(),
            owner,
            prediction.label(),
            prediction.confidence(),
            started.elapsed()
        );

        Ok(Analysis {
            owner,
            image,
            prediction,
            importance,
        })
    }
}
