//! Forward and input-gradient kernels for the layers the classifier uses.
//!
//! Only gradients with respect to layer inputs are computed; weights are
//! frozen.

use ndarray::{Array1, Array2, Array3, Zip};

use crate::pipeline::{Activation, PipelineError};

/// Shape of an activation, used to validate a network before it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Spatial(usize, usize, usize),
    Flat(usize),
}

impl Shape {
    pub fn of(activation: &Activation) -> Self {
        match activation {
            Activation::Spatial(a) => {
                let (c, h, w) = a.dim();
                Shape::Spatial(c, h, w)
            }
            Activation::Flat(a) => Shape::Flat(a.len()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Conv2d {
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    // [out][in][ky][kx], row-major
    weight: Vec<f32>,
    bias: Vec<f32>,
}

impl Conv2d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        weight: Vec<f32>,
        bias: Vec<f32>,
    ) -> Result<Self, String> {
        if kernel == 0 || stride == 0 {
            return Err("kernel size and stride must be positive".into());
        }
        let expected = out_channels * in_channels * kernel * kernel;
        if weight.len() != expected {
            return Err(format!("expected {} weights, found {}", expected, weight.len()));
        }
        if bias.len() != out_channels {
            return Err(format!("expected {} biases, found {}", out_channels, bias.len()));
        }
        Ok(Self {
            in_channels,
            out_channels,
            kernel,
            stride,
            padding,
            weight,
            bias,
        })
    }

    fn output_size(&self, height: usize, width: usize) -> Option<(usize, usize)> {
        let span = |len: usize| {
            (len + 2 * self.padding)
                .checked_sub(self.kernel)
                .map(|d| d / self.stride + 1)
        };
        Some((span(height)?, span(width)?))
    }

    fn output_shape(&self, input: Shape) -> Result<Shape, String> {
        match input {
            Shape::Spatial(c, h, w) if c == self.in_channels => {
                let (oh, ow) = self
                    .output_size(h, w)
                    .ok_or_else(|| format!("kernel {} larger than {}x{} input", self.kernel, h, w))?;
                Ok(Shape::Spatial(self.out_channels, oh, ow))
            }
            other => Err(format!(
                "conv2d expects {} input channels, got {:?}",
                self.in_channels, other
            )),
        }
    }

    /// Input coordinate touched by output position `o` and kernel tap `k`, if
    /// it falls inside the (unpadded) input.
    fn source(&self, o: usize, k: usize, len: usize) -> Option<usize> {
        (o * self.stride + k)
            .checked_sub(self.padding)
            .filter(|i| *i < len)
    }

    fn forward(&self, input: &Array3<f32>) -> Result<Array3<f32>, PipelineError> {
        let (c_in, h, w) = input.dim();
        let Ok(Shape::Spatial(c_out, oh, ow)) = self.output_shape(Shape::Spatial(c_in, h, w))
        else {
            return Err(PipelineError::inference(format!(
                "conv2d cannot accept input of shape {:?}",
                input.dim()
            )));
        };
        let x: Vec<f32> = input.iter().copied().collect();
        let k = self.kernel;
        let mut out = vec![0.0f32; c_out * oh * ow];

        for o in 0..c_out {
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut acc = self.bias[o];
                    for c in 0..c_in {
                        let w_base = (o * c_in + c) * k * k;
                        for ky in 0..k {
                            let Some(iy) = self.source(oy, ky, h) else {
                                continue;
                            };
                            let row = (c * h + iy) * w;
                            for kx in 0..k {
                                if let Some(ix) = self.source(ox, kx, w) {
                                    acc += x[row + ix] * self.weight[w_base + ky * k + kx];
                                }
                            }
                        }
                    }
                    out[(o * oh + oy) * ow + ox] = acc;
                }
            }
        }
        Array3::from_shape_vec((c_out, oh, ow), out)
            .map_err(|e| PipelineError::inference(e.to_string()))
    }

    fn backward(
        &self,
        input: &Array3<f32>,
        grad: &Array3<f32>,
    ) -> Result<Array3<f32>, PipelineError> {
        let (c_in, h, w) = input.dim();
        let (c_out, oh, ow) = grad.dim();
        if self.output_shape(Shape::Spatial(c_in, h, w)) != Ok(Shape::Spatial(c_out, oh, ow)) {
            return Err(PipelineError::inference("conv2d gradient has the wrong shape"));
        }
        let g: Vec<f32> = grad.iter().copied().collect();
        let k = self.kernel;
        let mut dx = vec![0.0f32; c_in * h * w];

        for o in 0..c_out {
            for oy in 0..oh {
                for ox in 0..ow {
                    let go = g[(o * oh + oy) * ow + ox];
                    if go == 0.0 {
                        continue;
                    }
                    for c in 0..c_in {
                        let w_base = (o * c_in + c) * k * k;
                        for ky in 0..k {
                            let Some(iy) = self.source(oy, ky, h) else {
                                continue;
                            };
                            let row = (c * h + iy) * w;
                            for kx in 0..k {
                                if let Some(ix) = self.source(ox, kx, w) {
                                    dx[row + ix] += go * self.weight[w_base + ky * k + kx];
                                }
                            }
                        }
                    }
                }
            }
        }
        Array3::from_shape_vec((c_in, h, w), dx).map_err(|e| PipelineError::inference(e.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct MaxPool2d {
    kernel: usize,
    stride: usize,
}

impl MaxPool2d {
    pub fn new(kernel: usize, stride: usize) -> Result<Self, String> {
        if kernel == 0 || stride == 0 {
            return Err("kernel size and stride must be positive".into());
        }
        Ok(Self { kernel, stride })
    }

    fn output_shape(&self, input: Shape) -> Result<Shape, String> {
        match input {
            Shape::Spatial(c, h, w) if h >= self.kernel && w >= self.kernel => Ok(Shape::Spatial(
                c,
                (h - self.kernel) / self.stride + 1,
                (w - self.kernel) / self.stride + 1,
            )),
            other => Err(format!("max_pool2d cannot accept {:?}", other)),
        }
    }

    /// Position of the first maximum inside the window starting at `(y, x)`.
    fn argmax(&self, channel: ndarray::ArrayView2<f32>, y: usize, x: usize) -> (usize, usize) {
        let mut best = (y, x);
        for wy in y..y + self.kernel {
            for wx in x..x + self.kernel {
                if channel[[wy, wx]] > channel[[best.0, best.1]] {
                    best = (wy, wx);
                }
            }
        }
        best
    }

    fn forward(&self, input: &Array3<f32>) -> Result<Array3<f32>, PipelineError> {
        let (c, h, w) = input.dim();
        let Ok(Shape::Spatial(_, oh, ow)) = self.output_shape(Shape::Spatial(c, h, w)) else {
            return Err(PipelineError::inference("max_pool2d input smaller than its window"));
        };
        let mut out = Array3::<f32>::zeros((c, oh, ow));
        for (ch, channel) in input.outer_iter().enumerate() {
            for oy in 0..oh {
                for ox in 0..ow {
                    let (y, x) = self.argmax(channel, oy * self.stride, ox * self.stride);
                    out[[ch, oy, ox]] = channel[[y, x]];
                }
            }
        }
        Ok(out)
    }

    fn backward(
        &self,
        input: &Array3<f32>,
        grad: &Array3<f32>,
    ) -> Result<Array3<f32>, PipelineError> {
        let (c, h, w) = input.dim();
        let (gc, oh, ow) = grad.dim();
        if self.output_shape(Shape::Spatial(c, h, w)) != Ok(Shape::Spatial(gc, oh, ow)) {
            return Err(PipelineError::inference("max_pool2d gradient has the wrong shape"));
        }
        let mut dx = Array3::<f32>::zeros(input.dim());
        for (ch, channel) in input.outer_iter().enumerate() {
            for oy in 0..oh {
                for ox in 0..ow {
                    let (y, x) = self.argmax(channel, oy * self.stride, ox * self.stride);
                    dx[[ch, y, x]] += grad[[ch, oy, ox]];
                }
            }
        }
        Ok(dx)
    }
}

#[derive(Debug, Clone)]
pub struct Linear {
    weight: Array2<f32>,
    bias: Array1<f32>,
}

impl Linear {
    pub fn new(
        in_features: usize,
        out_features: usize,
        weight: Vec<f32>,
        bias: Vec<f32>,
    ) -> Result<Self, String> {
        let weight = Array2::from_shape_vec((out_features, in_features), weight)
            .map_err(|_| format!("expected {} weights", out_features * in_features))?;
        if bias.len() != out_features {
            return Err(format!("expected {} biases, found {}", out_features, bias.len()));
        }
        Ok(Self {
            weight,
            bias: Array1::from(bias),
        })
    }

    fn output_shape(&self, input: Shape) -> Result<Shape, String> {
        let (out_features, in_features) = self.weight.dim();
        match input {
            Shape::Flat(n) if n == in_features => Ok(Shape::Flat(out_features)),
            other => Err(format!("linear expects {} features, got {:?}", in_features, other)),
        }
    }
}

/// A network layer with a forward kernel and an input-gradient kernel.
#[derive(Debug, Clone)]
pub enum Layer {
    Conv2d(Conv2d),
    Relu,
    MaxPool2d(MaxPool2d),
    GlobalAvgPool,
    Linear(Linear),
}

impl Layer {
    pub fn kind(&self) -> &'static str {
        match self {
            Layer::Conv2d(_) => "conv2d",
            Layer::Relu => "relu",
            Layer::MaxPool2d(_) => "max_pool2d",
            Layer::GlobalAvgPool => "global_avg_pool",
            Layer::Linear(_) => "linear",
        }
    }

    pub fn output_shape(&self, input: Shape) -> Result<Shape, String> {
        match (self, input) {
            (Layer::Conv2d(conv), _) => conv.output_shape(input),
            (Layer::MaxPool2d(pool), _) => pool.output_shape(input),
            (Layer::Linear(linear), _) => linear.output_shape(input),
            (Layer::Relu, _) => Ok(input),
            (Layer::GlobalAvgPool, Shape::Spatial(c, _, _)) => Ok(Shape::Flat(c)),
            (Layer::GlobalAvgPool, Shape::Flat(_)) => {
                Err("global_avg_pool needs a spatial input".into())
            }
        }
    }

    pub fn forward(&self, input: &Activation) -> Result<Activation, PipelineError> {
        match (self, input) {
            (Layer::Conv2d(conv), Activation::Spatial(x)) => conv.forward(x).map(Activation::Spatial),
            (Layer::MaxPool2d(pool), Activation::Spatial(x)) => {
                pool.forward(x).map(Activation::Spatial)
            }
            (Layer::Relu, Activation::Spatial(x)) => Ok(Activation::Spatial(x.mapv(relu))),
            (Layer::Relu, Activation::Flat(x)) => Ok(Activation::Flat(x.mapv(relu))),
            (Layer::GlobalAvgPool, Activation::Spatial(x)) => {
                let pooled = x.outer_iter().map(|c| c.mean().unwrap_or(0.0)).collect();
                Ok(Activation::Flat(pooled))
            }
            (Layer::Linear(linear), Activation::Flat(x)) if x.len() == linear.weight.ncols() => {
                Ok(Activation::Flat(linear.weight.dot(x) + &linear.bias))
            }
            (layer, activation) => Err(mismatch(layer, activation)),
        }
    }

    /// Gradient with respect to `input`, given the gradient with respect to
    /// this layer's output.
    pub fn backward(
        &self,
        input: &Activation,
        grad: &Activation,
    ) -> Result<Activation, PipelineError> {
        match (self, input, grad) {
            (Layer::Conv2d(conv), Activation::Spatial(x), Activation::Spatial(g)) => {
                conv.backward(x, g).map(Activation::Spatial)
            }
            (Layer::MaxPool2d(pool), Activation::Spatial(x), Activation::Spatial(g)) => {
                pool.backward(x, g).map(Activation::Spatial)
            }
            (Layer::Relu, Activation::Spatial(x), Activation::Spatial(g)) if x.dim() == g.dim() => {
                let mut dx = g.clone();
                Zip::from(&mut dx).and(x).for_each(|d, v| {
                    if *v <= 0.0 {
                        *d = 0.0;
                    }
                });
                Ok(Activation::Spatial(dx))
            }
            (Layer::Relu, Activation::Flat(x), Activation::Flat(g)) if x.len() == g.len() => {
                let mut dx = g.clone();
                Zip::from(&mut dx).and(x).for_each(|d, v| {
                    if *v <= 0.0 {
                        *d = 0.0;
                    }
                });
                Ok(Activation::Flat(dx))
            }
            (Layer::GlobalAvgPool, Activation::Spatial(x), Activation::Flat(g))
                if x.dim().0 == g.len() =>
            {
                let (c, h, w) = x.dim();
                let area = (h * w) as f32;
                Ok(Activation::Spatial(Array3::from_shape_fn((c, h, w), |(ch, _, _)| {
                    g[ch] / area
                })))
            }
            (Layer::Linear(linear), Activation::Flat(_), Activation::Flat(g))
                if g.len() == linear.weight.nrows() =>
            {
                Ok(Activation::Flat(linear.weight.t().dot(g)))
            }
            (layer, activation, _) => Err(mismatch(layer, activation)),
        }
    }
}

fn relu(v: f32) -> f32 {
    v.max(0.0)
}

fn mismatch(layer: &Layer, activation: &Activation) -> PipelineError {
    PipelineError::inference(format!(
        "{} layer received incompatible activation {:?}",
        layer.kind(),
        Shape::of(activation)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array3, array};

    fn pseudo(n: usize, seed: usize) -> Vec<f32> {
        (0..n)
            .map(|i| (((i * 37 + seed * 101) % 23) as f32 - 11.0) / 7.0)
            .collect()
    }

    /// Checks `layer.backward` against central differences of
    /// `sum(upstream * layer(x))`.
    fn check_gradient(layer: &Layer, input: Activation, upstream: Activation) {
        let dot = |a: &Activation| -> f32 {
            match (a, &upstream) {
                (Activation::Spatial(a), Activation::Spatial(u)) => (a * u).sum(),
                (Activation::Flat(a), Activation::Flat(u)) => a.dot(u),
                _ => panic!("upstream gradient does not match output"),
            }
        };
        let analytic = layer.backward(&input, &upstream).unwrap();
        let analytic: Vec<f32> = match analytic {
            Activation::Spatial(a) => a.iter().copied().collect(),
            Activation::Flat(a) => a.to_vec(),
        };
        let eps = 1e-2;
        for i in 0..analytic.len() {
            let nudge = |delta: f32| {
                let mut x = input.clone();
                match &mut x {
                    Activation::Spatial(a) => *a.iter_mut().nth(i).unwrap() += delta,
                    Activation::Flat(a) => a[i] += delta,
                }
                dot(&layer.forward(&x).unwrap())
            };
            let numeric = (nudge(eps) - nudge(-eps)) / (2.0 * eps);
            assert!(
                (numeric - analytic[i]).abs() < 1e-2,
                "element {}: numeric {} vs analytic {}",
                i,
                numeric,
                analytic[i]
            );
        }
    }

    #[test]
    fn conv_forward_matches_hand_computation() {
        // Single 2x2 kernel of ones, stride 1, no padding: sums of 2x2 windows.
        let conv = Conv2d::new(1, 1, 2, 1, 0, vec![1.0; 4], vec![0.5]).unwrap();
        let x = Array3::from_shape_vec((1, 3, 3), (1..=9).map(|v| v as f32).collect()).unwrap();
        let y = conv.forward(&x).unwrap();
        assert_eq!(y, Array3::from_shape_vec((1, 2, 2), vec![12.5, 16.5, 24.5, 28.5]).unwrap());
    }

    #[test]
    fn conv_output_shape_accounts_for_stride_and_padding() {
        let conv = Conv2d::new(3, 8, 3, 2, 1, vec![0.0; 8 * 3 * 9], vec![0.0; 8]).unwrap();
        let layer = Layer::Conv2d(conv);
        assert_eq!(
            layer.output_shape(Shape::Spatial(3, 224, 224)),
            Ok(Shape::Spatial(8, 112, 112))
        );
        assert!(layer.output_shape(Shape::Spatial(4, 224, 224)).is_err());
        assert!(layer.output_shape(Shape::Flat(3)).is_err());
    }

    #[test]
    fn conv_rejects_wrong_weight_count() {
        assert!(Conv2d::new(1, 2, 3, 1, 0, vec![0.0; 17], vec![0.0; 2]).is_err());
    }

    #[test]
    fn conv_input_gradient_matches_finite_differences() {
        let conv = Conv2d::new(2, 3, 3, 2, 1, pseudo(2 * 3 * 9, 1), pseudo(3, 2)).unwrap();
        let input = Array3::from_shape_vec((2, 5, 5), pseudo(50, 3)).unwrap();
        let upstream = Array3::from_shape_vec((3, 3, 3), pseudo(27, 4)).unwrap();
        check_gradient(
            &Layer::Conv2d(conv),
            Activation::Spatial(input),
            Activation::Spatial(upstream),
        );
    }

    #[test]
    fn max_pool_routes_gradient_to_the_maximum() {
        let pool = Layer::MaxPool2d(MaxPool2d::new(2, 2).unwrap());
        let x = Activation::Spatial(array![[[1.0, 5.0], [2.0, 3.0]]]);
        assert_eq!(pool.forward(&x).unwrap(), Activation::Spatial(array![[[5.0]]]));
        let dx = pool.backward(&x, &Activation::Spatial(array![[[2.0]]])).unwrap();
        assert_eq!(dx, Activation::Spatial(array![[[0.0, 2.0], [0.0, 0.0]]]));
    }

    #[test]
    fn pooled_linear_head_gradient_matches_finite_differences() {
        let linear = Layer::Linear(Linear::new(3, 2, pseudo(6, 5), vec![0.1, -0.2]).unwrap());
        check_gradient(
            &linear,
            Activation::Flat(Array1::from(pseudo(3, 6))),
            Activation::Flat(array![1.0, 0.0]),
        );
        check_gradient(
            &Layer::GlobalAvgPool,
            Activation::Spatial(Array3::from_shape_vec((3, 2, 4), pseudo(24, 7)).unwrap()),
            Activation::Flat(array![0.5, -1.0, 2.0]),
        );
    }

    #[test]
    fn relu_blocks_gradient_where_input_was_negative() {
        let x = Activation::Flat(array![-1.0, 0.0, 2.0]);
        let dx = Layer::Relu.backward(&x, &Activation::Flat(array![3.0, 3.0, 3.0])).unwrap();
        assert_eq!(dx, Activation::Flat(array![0.0, 0.0, 3.0]));
    }

    #[test]
    fn incompatible_activation_is_an_inference_failure() {
        let err = Layer::GlobalAvgPool
            .forward(&Activation::Flat(array![1.0]))
            .unwrap_err();
        assert!(matches!(err, PipelineError::InferenceFailure(_)));
    }
}
