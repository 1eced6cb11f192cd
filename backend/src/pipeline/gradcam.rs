//! Gradient-weighted class activation mapping.
//!
//! Channels of the target layer are weighted by the spatial mean of their
//! gradients, summed, rectified and rescaled to `[0, 1]`.

use ndarray::{Array2, Zip};

use super::classifier::ActivationSnapshot;

/// Single-channel importance values in `[0, 1]`, row-major `(height, width)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportanceMap(Array2<f32>);

impl ImportanceMap {
    /// Wraps precomputed values, clamping them into `[0, 1]`.
    pub fn from_values(mut values: Array2<f32>) -> Self {
        values.mapv_inplace(|v| if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) });
        Self(values)
    }

    pub fn values(&self) -> &Array2<f32> {
        &self.0
    }

    pub fn width(&self) -> usize {
        self.0.ncols()
    }

    pub fn height(&self) -> usize {
        self.0.nrows()
    }

    /// `true` when no location carries any evidence.
    pub fn is_blank(&self) -> bool {
        self.0.iter().all(|v| *v == 0.0)
    }

    /// Bilinear resize with half-pixel centres and clamped edges. The output is
    /// a convex combination of the input, so it stays inside `[0, 1]`.
    pub fn upsample(&self, width: usize, height: usize) -> ImportanceMap {
        assert!(width > 0 && height > 0, "cannot resize to an empty map");
        let (src_h, src_w) = self.0.dim();
        let src = &self.0;
        let x_taps: Vec<(usize, usize, f32)> = (0..width).map(|x| taps(x, width, src_w)).collect();
        let y_taps: Vec<(usize, usize, f32)> = (0..height).map(|y| taps(y, height, src_h)).collect();

        let out = Array2::from_shape_fn((height, width), |(y, x)| {
            let (y0, y1, fy) = y_taps[y];
            let (x0, x1, fx) = x_taps[x];
            let top = src[[y0, x0]] * (1.0 - fx) + src[[y0, x1]] * fx;
            let bottom = src[[y1, x0]] * (1.0 - fx) + src[[y1, x1]] * fx;
            (top * (1.0 - fy) + bottom * fy).clamp(0.0, 1.0)
        });
        ImportanceMap(out)
    }
}

/// Source indices and blend factor for output coordinate `dst` when mapping
/// `dst_len` samples onto `src_len`.
fn taps(dst: usize, dst_len: usize, src_len: usize) -> (usize, usize, f32) {
    let scale = src_len as f32 / dst_len as f32;
    let pos = ((dst as f32 + 0.5) * scale - 0.5).clamp(0.0, (src_len - 1) as f32);
    let lo = pos.floor() as usize;
    let hi = (lo + 1).min(src_len - 1);
    (lo, hi, pos - lo as f32)
}

/// Computes the low-resolution importance map for the snapshot's target class.
///
/// When the rectified map is flat (`max == min`, typically all zero because
/// every contribution was negative or the gradients vanished) the result is
/// an all-zero map. That is a valid "no evidence" answer, not an error.
pub fn grad_cam(snapshot: &ActivationSnapshot) -> ImportanceMap {
    let features = snapshot.features();
    let weights: Vec<f32> = snapshot
        .gradients()
        .outer_iter()
        .map(|g| g.mean().unwrap_or(0.0))
        .collect();

    let (_, height, width) = features.dim();
    let mut cam = Array2::<f32>::zeros((height, width));
    for (channel, weight) in features.outer_iter().zip(weights.iter()) {
        if *weight != 0.0 {
            Zip::from(&mut cam)
                .and(&channel)
                .for_each(|acc, f| *acc += weight * f);
        }
    }
    cam.mapv_inplace(|v| v.max(0.0));

    let (min, max) = cam
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    let range = max - min;
    if !range.is_finite() || range <= 0.0 {
        log::debug!("flat activation map for {}, emitting empty heatmap", snapshot.target());
        return ImportanceMap(Array2::zeros((height, width)));
    }
    cam.mapv_inplace(|v| ((v - min) / range).clamp(0.0, 1.0));
    ImportanceMap(cam)
}
