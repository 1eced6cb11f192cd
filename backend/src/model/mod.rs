//! Convolutional classifier loaded from a JSON artifact.

pub mod artifact;
pub mod layers;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use ndarray::{Array1, Array3};
use shared::ClassLabel;

use crate::pipeline::{
    Activation, ClassifierAdapter, Classifier, ForwardPass, InputSpec, PipelineError,
    PreparedTensor,
};
pub use artifact::{LayerSpec, ModelArtifact, ModelLoadError, Normalization};
use layers::{Conv2d, Layer, Linear, MaxPool2d, Shape};

/// Feed-forward CNN ending in a two-logit head.
///
/// Holds no mutable state: forward and backward only read the weights, so a
/// single instance serves concurrent requests.
#[derive(Debug)]
pub struct ConvNet {
    name: String,
    input: InputSpec,
    layers: Vec<(String, Layer)>,
    target: usize,
}

impl ConvNet {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelLoadError> {
        Self::from_artifact(ModelArtifact::load(path)?)
    }

    pub fn from_artifact(artifact: ModelArtifact) -> Result<Self, ModelLoadError> {
        let expected: Vec<String> = ClassLabel::ALL.iter().map(|l| l.to_string()).collect();
        if artifact.classes != expected {
            return Err(ModelLoadError::Invalid(format!(
                "classes must be {:?}, found {:?}",
                expected, artifact.classes
            )));
        }
        if artifact.input_size == 0 {
            return Err(ModelLoadError::Invalid("input size must be non-zero".into()));
        }
        let Normalization { mean, std } = &artifact.normalization;
        if mean.iter().any(|m| !m.is_finite()) || std.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(ModelLoadError::Invalid(format!(
                "normalization needs finite means and positive finite stds, got mean {:?} std {:?}",
                mean, std
            )));
        }

        let mut seen = HashSet::new();
        let mut layers = Vec::with_capacity(artifact.layers.len());
        for spec in artifact.layers {
            let name = spec.name().to_string();
            if !seen.insert(name.clone()) {
                return Err(ModelLoadError::Invalid(format!("duplicate layer name '{}'", name)));
            }
            let layer = build_layer(spec)
                .map_err(|e| ModelLoadError::Invalid(format!("layer '{}': {}", name, e)))?;
            layers.push((name, layer));
        }

        let target = layers
            .iter()
            .position(|(name, _)| *name == artifact.target_layer)
            .ok_or_else(|| {
                ModelLoadError::Invalid(format!("unknown target layer '{}'", artifact.target_layer))
            })?;

        let side = artifact.input_size as usize;
        let mut shape = Shape::Spatial(3, side, side);
        for (index, (name, layer)) in layers.iter().enumerate() {
            shape = layer
                .output_shape(shape)
                .map_err(|e| ModelLoadError::Invalid(format!("layer '{}': {}", name, e)))?;
            if index == target && !matches!(shape, Shape::Spatial(..)) {
                return Err(ModelLoadError::Invalid(format!(
                    "target layer '{}' must produce feature maps, produces {:?}",
                    name, shape
                )));
            }
        }
        if shape != Shape::Flat(ClassLabel::ALL.len()) {
            return Err(ModelLoadError::Invalid(format!(
                "network must end in two logits, ends in {:?}",
                shape
            )));
        }

        Ok(Self {
            name: artifact.name,
            input: InputSpec {
                size: artifact.input_size,
                mean: artifact.normalization.mean,
                std: artifact.normalization.std,
            },
            layers,
            target,
        })
    }

    /// Loads the artifact and wraps it for shared use by the pipeline.
    pub fn load_adapter(path: impl AsRef<Path>) -> Result<ClassifierAdapter, ModelLoadError> {
        let model = Self::load(path)?;
        Ok(ClassifierAdapter::new(Arc::new(model)))
    }
}

fn check_finite(weight: &[f32], bias: &[f32]) -> Result<(), String> {
    match weight.iter().chain(bias).position(|v| !v.is_finite()) {
        Some(index) => Err(format!("parameter {} is not a finite number", index)),
        None => Ok(()),
    }
}

fn build_layer(spec: LayerSpec) -> Result<Layer, String> {
    if let LayerSpec::Conv2d { weight, bias, .. } | LayerSpec::Linear { weight, bias, .. } = &spec {
        check_finite(weight, bias)?;
    }
    Ok(match spec {
        LayerSpec::Conv2d {
            in_channels,
            out_channels,
            kernel_size,
            stride,
            padding,
            weight,
            bias,
            ..
        } => Layer::Conv2d(Conv2d::new(
            in_channels,
            out_channels,
            kernel_size,
            stride,
            padding,
            weight,
            bias,
        )?),
        LayerSpec::Relu { .. } => Layer::Relu,
        LayerSpec::MaxPool2d {
            kernel_size,
            stride,
            ..
        } => Layer::MaxPool2d(MaxPool2d::new(kernel_size, stride)?),
        LayerSpec::GlobalAvgPool { .. } => Layer::GlobalAvgPool,
        LayerSpec::Linear {
            in_features,
            out_features,
            weight,
            bias,
            ..
        } => Layer::Linear(Linear::new(in_features, out_features, weight, bias)?),
    })
}

impl Classifier for ConvNet {
    fn name(&self) -> &str {
        &self.name
    }

    fn target_layer(&self) -> &str {
        &self.layers[self.target].0
    }

    fn input_spec(&self) -> InputSpec {
        self.input.clone()
    }

    fn forward(&self, input: &PreparedTensor) -> Result<ForwardPass, PipelineError> {
        let side = self.input.size as usize;
        if input.shape() != (3, side, side) {
            return Err(PipelineError::inference(format!(
                "expected input of shape (3, {side}, {side}), got {:?}",
                input.shape()
            )));
        }

        let mut current = Activation::Spatial(input.data().clone());
        let mut features = None;
        let mut trace = Vec::with_capacity(self.layers.len() - self.target - 1);
        for (index, (_, layer)) in self.layers.iter().enumerate() {
            if index > self.target {
                trace.push(current.clone());
            }
            current = layer.forward(&current)?;
            if index == self.target {
                if let Activation::Spatial(maps) = &current {
                    features = Some(maps.clone());
                }
            }
        }

        let features =
            features.ok_or_else(|| PipelineError::inference("target layer produced no feature maps"))?;
        let logits = match current {
            Activation::Flat(out) if out.len() == 2 => [out[0], out[1]],
            other => {
                return Err(PipelineError::inference(format!(
                    "network output has shape {:?}",
                    Shape::of(&other)
                )));
            }
        };
        Ok(ForwardPass {
            logits,
            features,
            trace,
        })
    }

    fn backward(
        &self,
        pass: &ForwardPass,
        target: ClassLabel,
    ) -> Result<Array3<f32>, PipelineError> {
        let head = &self.layers[self.target + 1..];
        if pass.trace.len() != head.len() {
            return Err(PipelineError::inference("forward trace does not match this network"));
        }

        let mut seed = Array1::<f32>::zeros(ClassLabel::ALL.len());
        seed[target.index()] = 1.0;
        let mut grad = Activation::Flat(seed);
        for ((_, layer), input) in head.iter().zip(pass.trace.iter()).rev() {
            grad = layer.backward(input, &grad)?;
        }

        match grad {
            Activation::Spatial(g) if g.dim() == pass.features.dim() => Ok(g),
            other => Err(PipelineError::inference(format!(
                "gradient at '{}' has shape {:?}",
                self.target_layer(),
                Shape::of(&other)
            ))),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::pipeline::{TIE_BREAK_LABEL, grad_cam};

    fn input(side: usize) -> PreparedTensor {
        PreparedTensor::from_array(Array3::from_shape_fn((3, side, side), |(c, y, x)| {
            ((c * 31 + y * 7 + x * 3) % 17) as f32 / 16.0
        }))
    }

    #[test]
    fn fixture_network_exposes_its_target_layer() {
        let net = convnet(64);
        assert_eq!(net.name(), "fixture-cnn");
        assert_eq!(net.target_layer(), "relu2");
        assert_eq!(net.input_spec().size, 64);
    }

    #[test]
    fn forward_captures_target_feature_maps() {
        let net = convnet(64);
        let pass = net.forward(&input(64)).unwrap();
        // 64 -> conv s2 -> 32 -> pool -> 16 -> conv s2 -> 8
        assert_eq!(pass.features.dim(), (6, 8, 8));
        assert!(pass.features.iter().all(|v| *v >= 0.0));
        assert_eq!(pass.trace.len(), 2);
        assert!(pass.logits.iter().all(|l| l.is_finite()));
    }

    #[test]
    fn backward_through_pooled_head_is_spatially_uniform() {
        let net = convnet(32);
        let pass = net.forward(&input(32)).unwrap();
        let grad = net.backward(&pass, ClassLabel::Cancer).unwrap();
        assert_eq!(grad.dim(), pass.features.dim());

        // d logit_0 / d F[c,h,w] = W[0,c] / (H*W) where relu2 feeds gap directly.
        let head = pseudo(12, 5, 1.0);
        let area = (grad.dim().1 * grad.dim().2) as f32;
        for (c, channel) in grad.outer_iter().enumerate() {
            for g in channel.iter() {
                assert!((g - head[c] / area).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn backward_through_spatial_head_matches_finite_differences() {
        let mut spec = artifact(16, pseudo(12, 5, 1.0), vec![0.05, -0.05]);
        spec.target_layer = "conv1".into();
        let net = ConvNet::from_artifact(spec).unwrap();
        let x = PreparedTensor::from_array(Array3::from_shape_fn((3, 16, 16), |(c, y, x)| {
            ((c * 257 + y * 31 + x * 7) as f32 * 0.37).sin()
        }));
        let pass = net.forward(&x).unwrap();
        // relu1, pool1, conv2, relu2, gap, fc
        assert_eq!(pass.trace.len(), 6);
        let grad = net.backward(&pass, ClassLabel::Cancer).unwrap();
        assert_eq!(grad.dim(), (4, 8, 8));

        let head = &net.layers[net.target + 1..];
        let cancer_logit = |features: &Array3<f32>| -> f32 {
            let mut current = Activation::Spatial(features.clone());
            for (_, layer) in head {
                current = layer.forward(&current).unwrap();
            }
            match current {
                Activation::Flat(out) => out[0],
                Activation::Spatial(_) => panic!("head must end in logits"),
            }
        };

        let base = cancer_logit(&pass.features);
        let eps = 1e-2;
        let (mut checked, mut nonzero) = (0, 0);
        for (index, analytic) in grad.indexed_iter() {
            let shifted = |delta: f32| {
                let mut features = pass.features.clone();
                features[index] += delta;
                cancer_logit(&features)
            };
            let right = (shifted(eps) - base) / eps;
            let left = (base - shifted(-eps)) / eps;
            // Slopes disagree next to a relu or max-pool kink.
            if (right - left).abs() > 1e-3 {
                continue;
            }
            checked += 1;
            if analytic.abs() > 1e-4 {
                nonzero += 1;
            }
            let numeric = 0.5 * (right + left);
            assert!(
                (numeric - analytic).abs() < 2e-3,
                "{:?}: numeric {} vs analytic {}",
                index,
                numeric,
                analytic
            );
        }
        assert!(checked * 4 > grad.len(), "only {} smooth points", checked);
        assert!(nonzero > 0);
    }

    #[test]
    fn forward_and_backward_are_deterministic() {
        let net = convnet(32);
        let a = net.forward(&input(32)).unwrap();
        let b = net.forward(&input(32)).unwrap();
        assert_eq!(a.logits, b.logits);
        assert_eq!(a.features, b.features);
        assert_eq!(
            net.backward(&a, ClassLabel::Normal).unwrap(),
            net.backward(&b, ClassLabel::Normal).unwrap()
        );
    }

    #[test]
    fn wrong_input_shape_is_an_inference_failure() {
        let net = convnet(32);
        let err = net.forward(&input(31)).unwrap_err();
        assert!(matches!(err, PipelineError::InferenceFailure(_)));
    }

    #[test]
    fn tied_logits_pick_the_default_class_and_give_a_blank_map() {
        let adapter = ClassifierAdapter::new(Arc::new(tied_convnet(32)));
        let (scores, snapshot) = adapter.classify(&input(32)).unwrap();
        assert_eq!(scores.cancer(), scores.normal());
        assert_eq!(scores.predicted(), TIE_BREAK_LABEL);
        assert!(snapshot.gradients().iter().all(|g| *g == 0.0));
        assert!(grad_cam(&snapshot).is_blank());
    }

    #[test]
    fn artifact_survives_json_round_trip() {
        let json = serde_json::to_string(&artifact(32, pseudo(12, 5, 1.0), vec![0.0, 0.0])).unwrap();
        assert!(json.contains("\"type\":\"max_pool2d\""));
        let net = ConvNet::from_artifact(ModelArtifact::from_json(&json).unwrap()).unwrap();
        assert_eq!(net.target_layer(), "relu2");
    }

    #[test]
    fn rejects_unknown_target_layer() {
        let mut spec = artifact(32, pseudo(12, 5, 1.0), vec![0.0, 0.0]);
        spec.target_layer = "conv9".into();
        let err = ConvNet::from_artifact(spec).unwrap_err();
        assert!(err.to_string().contains("conv9"));
    }

    #[test]
    fn rejects_flat_target_layer() {
        let mut spec = artifact(32, pseudo(12, 5, 1.0), vec![0.0, 0.0]);
        spec.target_layer = "gap".into();
        assert!(matches!(ConvNet::from_artifact(spec), Err(ModelLoadError::Invalid(_))));
    }

    #[test]
    fn rejects_swapped_class_order() {
        let mut spec = artifact(32, pseudo(12, 5, 1.0), vec![0.0, 0.0]);
        spec.classes.reverse();
        assert!(matches!(ConvNet::from_artifact(spec), Err(ModelLoadError::Invalid(_))));
    }

    #[test]
    fn rejects_degenerate_normalization() {
        for std in [[1.0, 0.0, 1.0], [1.0, -0.5, 1.0], [f32::INFINITY, 1.0, 1.0], [f32::NAN, 1.0, 1.0]] {
            let mut spec = artifact(32, pseudo(12, 5, 1.0), vec![0.0, 0.0]);
            spec.normalization.std = std;
            assert!(
                matches!(ConvNet::from_artifact(spec), Err(ModelLoadError::Invalid(_))),
                "std {:?} was accepted",
                std
            );
        }
    }

    #[test]
    fn rejects_overflowing_weights() {
        let mut json = serde_json::to_value(artifact(32, pseudo(12, 5, 1.0), vec![0.0, 0.0])).unwrap();
        json["layers"][0]["weight"][3] = serde_json::json!(1e39);
        let spec = ModelArtifact::from_json(&json.to_string()).unwrap();
        let err = ConvNet::from_artifact(spec).unwrap_err();
        assert!(err.to_string().contains("conv1"), "{}", err);

        let mut spec = artifact(32, pseudo(12, 5, 1.0), vec![0.0, 0.0]);
        if let Some(LayerSpec::Linear { bias, .. }) = spec.layers.last_mut() {
            bias[1] = f32::NEG_INFINITY;
        }
        assert!(matches!(ConvNet::from_artifact(spec), Err(ModelLoadError::Invalid(_))));
    }

    #[test]
    fn rejects_head_with_wrong_width() {
        let mut spec = artifact(32, pseudo(12, 5, 1.0), vec![0.0, 0.0]);
        spec.layers.pop();
        spec.layers.push(LayerSpec::Linear {
            name: "fc".into(),
            in_features: 6,
            out_features: 3,
            weight: vec![0.0; 18],
            bias: vec![0.0; 3],
        });
        assert!(matches!(ConvNet::from_artifact(spec), Err(ModelLoadError::Invalid(_))));
    }

    #[test]
    fn missing_artifact_file_is_an_io_error() {
        let err = ConvNet::load("/nonexistent/xray-model.json").unwrap_err();
        assert!(matches!(err, ModelLoadError::Io(_)));
    }
}
