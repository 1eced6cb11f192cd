use std::io::Cursor;

use image::{ImageFormat, ImageResult, Rgb, RgbImage};

use super::gradcam::ImportanceMap;

/// Weight of the heatmap in the blend.
pub const DEFAULT_ALPHA: f32 = 0.4;

// Control points (position, value) of the "jet" ramp per channel.
const JET_RED: &[(f32, f32)] = &[(0.0, 0.0), (0.35, 0.0), (0.66, 1.0), (0.89, 1.0), (1.0, 0.5)];
const JET_GREEN: &[(f32, f32)] = &[
    (0.0, 0.0),
    (0.125, 0.0),
    (0.375, 1.0),
    (0.64, 1.0),
    (0.91, 0.0),
    (1.0, 0.0),
];
const JET_BLUE: &[(f32, f32)] = &[(0.0, 0.5), (0.11, 1.0), (0.34, 1.0), (0.65, 0.0), (1.0, 0.0)];

/// The explanatory image: original pixels blended with the colourised map.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayImage(RgbImage);

impl OverlayImage {
    pub fn width(&self) -> u32 {
        self.0.width()
    }

    pub fn height(&self) -> u32 {
        self.0.height()
    }

    pub fn as_rgb(&self) -> &RgbImage {
        &self.0
    }

    pub fn encode_png(&self) -> ImageResult<Vec<u8>> {
        let mut buf = Vec::new();
        self.0.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
        Ok(buf)
    }
}

fn ramp(points: &[(f32, f32)], t: f32) -> f32 {
    for pair in points.windows(2) {
        let ((x0, y0), (x1, y1)) = (pair[0], pair[1]);
        if t <= x1 {
            let f = if x1 > x0 { (t - x0) / (x1 - x0) } else { 0.0 };
            return y0 + (y1 - y0) * f;
        }
    }
    points.last().map_or(0.0, |p| p.1)
}

/// Maps an importance value in `[0, 1]` onto the cold-to-hot jet palette.
pub fn jet(value: f32) -> Rgb<u8> {
    let t = value.clamp(0.0, 1.0);
    let channel = |points: &[(f32, f32)]| (ramp(points, t) * 255.0).round() as u8;
    Rgb([channel(JET_RED), channel(JET_GREEN), channel(JET_BLUE)])
}

/// Blends `(1 - alpha) * original + alpha * jet(map)` pixel by pixel.
///
/// # Panics
///
/// If `map` does not have the same dimensions as `original`; the caller is
/// responsible for upsampling first.
pub fn compose(original: &RgbImage, map: &ImportanceMap, alpha: f32) -> OverlayImage {
    assert_eq!(
        (map.width(), map.height()),
        (original.width() as usize, original.height() as usize),
        "importance map must be resized to the image before compositing"
    );
    let alpha = alpha.clamp(0.0, 1.0);
    let values = map.values();
    let blended = RgbImage::from_fn(original.width(), original.height(), |x, y| {
        let base = original.get_pixel(x, y);
        let heat = jet(values[[y as usize, x as usize]]);
        let mix = |c: usize| {
            ((1.0 - alpha) * base[c] as f32 + alpha * heat[c] as f32)
                .round()
                .clamp(0.0, 255.0) as u8
        };
        Rgb([mix(0), mix(1), mix(2)])
    });
    OverlayImage(blended)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn jet_runs_from_dark_blue_to_dark_red() {
        assert_eq!(jet(0.0), Rgb([0, 0, 128]));
        assert_eq!(jet(1.0), Rgb([128, 0, 0]));
        let mid = jet(0.5);
        assert!(mid[1] == 255 && mid[0] > 100 && mid[2] > 100);
    }

    #[test]
    fn blend_uses_fixed_weight() {
        let original = RgbImage::from_pixel(2, 2, Rgb([200, 200, 200]));
        let map = ImportanceMap::from_values(Array2::zeros((2, 2)));
        let overlay = compose(&original, &map, 0.5);
        // 0.5 * 200 + 0.5 * (0, 0, 128)
        assert_eq!(overlay.as_rgb().get_pixel(1, 1), &Rgb([100, 100, 164]));
    }

    #[test]
    fn overlay_keeps_original_dimensions() {
        for (w, h) in [(224, 224), (512, 512), (100, 150)] {
            let original = RgbImage::from_pixel(w, h, Rgb([30, 60, 90]));
            let map = ImportanceMap::from_values(Array2::from_elem((h as usize, w as usize), 0.7));
            let overlay = compose(&original, &map, DEFAULT_ALPHA);
            assert_eq!((overlay.width(), overlay.height()), (w, h));
        }
    }

    #[test]
    #[should_panic(expected = "importance map must be resized")]
    fn mismatched_map_is_a_programming_error() {
        let original = RgbImage::new(10, 10);
        let map = ImportanceMap::from_values(Array2::zeros((7, 7)));
        compose(&original, &map, DEFAULT_ALPHA);
    }

    #[test]
    fn png_encoding_round_trips_dimensions() {
        let original = RgbImage::from_pixel(5, 3, Rgb([1, 2, 3]));
        let map = ImportanceMap::from_values(Array2::zeros((3, 5)));
        let bytes = compose(&original, &map, DEFAULT_ALPHA).encode_png().unwrap();
        let decoded = image::load_from_memory_with_format(&bytes, ImageFormat::Png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (5, 3));
    }
}
