use std::sync::{Arc, Mutex};

use ndarray::{Array1, Array3};
use serde::{Deserialize, Serialize};
use shared::ClassLabel;

use super::error::PipelineError;
use super::preprocess::{InputSpec, PreparedTensor};

/// Label chosen when both classes score exactly the same. A tie is sent to
/// human review rather than reported as a clean scan.
pub const TIE_BREAK_LABEL: ClassLabel = ClassLabel::Cancer;

/// Probabilities for the two classes; non-negative and summing to one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassScores {
    cancer: f32,
    normal: f32,
}

impl ClassScores {
    /// Softmax over `[cancer, normal]` logits.
    pub fn from_logits(logits: [f32; 2]) -> Result<Self, PipelineError> {
        if logits.iter().any(|l| !l.is_finite()) {
            return Err(PipelineError::inference(format!(
                "classifier produced non-finite logits {:?}",
                logits
            )));
        }
        let [a, b] = logits.map(f64::from);
        let max = a.max(b);
        let (ea, eb) = ((a - max).exp(), (b - max).exp());
        let total = ea + eb;
        Ok(Self {
            cancer: (ea / total) as f32,
            normal: (eb / total) as f32,
        })
    }

    pub fn get(&self, label: ClassLabel) -> f32 {
        match label {
            ClassLabel::Cancer => self.cancer,
            ClassLabel::Normal => self.normal,
        }
    }

    pub fn cancer(&self) -> f32 {
        self.cancer
    }

    pub fn normal(&self) -> f32 {
        self.normal
    }

    /// The strictly higher scoring class, or [`TIE_BREAK_LABEL`] on an exact tie.
    pub fn predicted(&self) -> ClassLabel {
        if self.cancer > self.normal {
            ClassLabel::Cancer
        } else if self.normal > self.cancer {
            ClassLabel::Normal
        } else {
            TIE_BREAK_LABEL
        }
    }

    pub fn confidence(&self) -> f32 {
        self.get(self.predicted())
    }
}

/// Feature maps of the target layer and the gradients of the predicted
/// class's logit with respect to them. Lives for one request only.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationSnapshot {
    features: Array3<f32>,
    gradients: Array3<f32>,
    target: ClassLabel,
}

impl ActivationSnapshot {
    pub fn new(
        features: Array3<f32>,
        gradients: Array3<f32>,
        target: ClassLabel,
    ) -> Result<Self, PipelineError> {
        if features.dim() != gradients.dim() {
            return Err(PipelineError::inference(format!(
                "gradient shape {:?} does not match feature map shape {:?}",
                gradients.dim(),
                features.dim()
            )));
        }
        let (channels, height, width) = features.dim();
        if channels == 0 || height == 0 || width == 0 {
            return Err(PipelineError::inference("empty feature map"));
        }
        Ok(Self {
            features,
            gradients,
            target,
        })
    }

    pub fn features(&self) -> &Array3<f32> {
        &self.features
    }

    pub fn gradients(&self) -> &Array3<f32> {
        &self.gradients
    }

    pub fn target(&self) -> ClassLabel {
        self.target
    }
}

/// Intermediate value flowing between layers.
#[derive(Debug, Clone, PartialEq)]
pub enum Activation {
    Spatial(Array3<f32>),
    Flat(Array1<f32>),
}

/// Output of a forward pass: the logits, the target layer's feature maps and
/// whatever the backend needs to run the matching backward pass.
#[derive(Debug, Clone)]
pub struct ForwardPass {
    pub logits: [f32; 2],
    pub features: Array3<f32>,
    pub trace: Vec<Activation>,
}

/// A pretrained binary classifier exposing an explicit forward/backward
/// protocol.
pub trait Classifier: Send + Sync {
    fn name(&self) -> &str;

    /// Name of the layer whose output feeds GradCAM.
    fn target_layer(&self) -> &str;

    fn input_spec(&self) -> InputSpec {
        InputSpec::default()
    }

    fn forward(&self, input: &PreparedTensor) -> Result<ForwardPass, PipelineError>;

    /// Gradient of `target`'s logit with respect to `pass.features`.
    fn backward(&self, pass: &ForwardPass, target: ClassLabel)
    -> Result<Array3<f32>, PipelineError>;

    /// Whether forward/backward may run concurrently on the same instance.
    fn is_reentrant(&self) -> bool {
        true
    }
}

/// Process-wide handle on the loaded classifier.
///
/// Built once at startup and shared read-only afterwards. Backends that are
/// not re-entrant get a gate so that each forward+backward pair runs alone.
#[derive(Clone)]
pub struct ClassifierAdapter {
    model: Arc<dyn Classifier>,
    gate: Option<Arc<Mutex<()>>>,
}

impl ClassifierAdapter {
    pub fn new(model: Arc<dyn Classifier>) -> Self {
        let gate = if model.is_reentrant() {
            None
        } else {
            Some(Arc::new(Mutex::new(())))
        };
        Self { model, gate }
    }

    pub fn name(&self) -> &str {
        self.model.name()
    }

    pub fn target_layer(&self) -> &str {
        self.model.target_layer()
    }

    pub fn input_spec(&self) -> InputSpec {
        self.model.input_spec()
    }

    pub fn is_serialized(&self) -> bool {
        self.gate.is_some()
    }

    pub fn classify(
        &self,
        tensor: &PreparedTensor,
    ) -> Result<(ClassScores, ActivationSnapshot), PipelineError> {
        // A poisoned gate carries no state worth discarding.
        let _guard = self
            .gate
            .as_ref()
            .map(|gate| gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));

        let pass = self.model.forward(tensor)?;
        let scores = ClassScores::from_logits(pass.logits)?;
        let target = scores.predicted();
        let gradients = self.model.backward(&pass, target)?;
        log::debug!(
            "{}: logits {:?}, backward seeded from {}",
            self.model.name(),
            pass.logits,
            target
        );
        let snapshot = ActivationSnapshot::new(pass.features, gradients, target)?;
        Ok((scores, snapshot))
    }
}
