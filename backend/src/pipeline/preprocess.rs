use image::imageops::FilterType;
use image::{ImageFormat, RgbImage};
use ndarray::Array3;

use super::error::PipelineError;

/// Side length of the square classifier input.
pub const INPUT_SIZE: u32 = 224;

/// Upload formats the pipeline accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Png,
    Jpeg,
}

impl ImageKind {
    /// Parses a declared format: a file extension (`png`, `.jpg`, `JPEG`) or a
    /// MIME type (`image/png`, `image/jpeg`).
    pub fn from_tag(tag: &str) -> Result<Self, PipelineError> {
        let normalized = tag.trim().trim_start_matches('.').to_ascii_lowercase();
        match normalized.as_str() {
            "png" | "image/png" => Ok(ImageKind::Png),
            "jpg" | "jpeg" | "image/jpeg" | "image/jpg" => Ok(ImageKind::Jpeg),
            _ => Err(PipelineError::UnsupportedFormat(tag.to_string())),
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ImageKind::Png => "png",
            ImageKind::Jpeg => "jpg",
        }
    }

    fn format(self) -> ImageFormat {
        match self {
            ImageKind::Png => ImageFormat::Png,
            ImageKind::Jpeg => ImageFormat::Jpeg,
        }
    }
}

/// Uploaded bytes together with their declared format.
#[derive(Debug, Clone)]
pub struct RawImage {
    bytes: Vec<u8>,
    kind: ImageKind,
}

impl RawImage {
    /// Fails with `UnsupportedFormat` before anything looks at the bytes.
    pub fn new(bytes: Vec<u8>, format_tag: &str) -> Result<Self, PipelineError> {
        let kind = ImageKind::from_tag(format_tag)?;
        Ok(Self { bytes, kind })
    }

    pub fn with_kind(bytes: Vec<u8>, kind: ImageKind) -> Self {
        Self { bytes, kind }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn kind(&self) -> ImageKind {
        self.kind
    }

    /// Decodes to 8-bit RGB at the original resolution.
    pub fn decode(&self) -> Result<RgbImage, PipelineError> {
        let image = image::load_from_memory_with_format(&self.bytes, self.kind.format())?;
        Ok(image.to_rgb8())
    }
}

/// What the classifier expects its input to look like.
#[derive(Debug, Clone, PartialEq)]
pub struct InputSpec {
    pub size: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Default for InputSpec {
    fn default() -> Self {
        Self {
            size: INPUT_SIZE,
            mean: [0.0; 3],
            std: [1.0; 3],
        }
    }
}

/// Normalized CHW tensor, RGB channel order.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedTensor(Array3<f32>);

impl PreparedTensor {
    pub fn from_array(data: Array3<f32>) -> Self {
        Self(data)
    }

    pub fn data(&self) -> &Array3<f32> {
        &self.0
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        self.0.dim()
    }
}

/// Bilinear resize to `spec.size`, then `(v / 255 - mean) / std` per channel.
pub fn prepare(image: &RgbImage, spec: &InputSpec) -> PreparedTensor {
    let resized = image::imageops::resize(image, spec.size, spec.size, FilterType::Triangle);
    let side = spec.size as usize;
    let tensor = Array3::from_shape_fn((3, side, side), |(c, y, x)| {
        let value = resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0;
        (value - spec.mean[c]) / spec.std[c]
    });
    PreparedTensor(tensor)
}

/// Decode and prepare in one step. The decoded image is returned as well since
/// the overlay is drawn at the original resolution.
pub fn preprocess(
    raw: &RawImage,
    spec: &InputSpec,
) -> Result<(RgbImage, PreparedTensor), PipelineError> {
    let decoded = raw.decode()?;
    let tensor = prepare(&decoded, spec);
    Ok((decoded, tensor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use std::io::Cursor;

    fn encode(image: &RgbImage, format: ImageFormat) -> Vec<u8> {
        let mut buf = Vec::new();
        image.write_to(&mut Cursor::new(&mut buf), format).unwrap();
        buf
    }

    #[test]
    fn accepts_extensions_and_mime_types() {
        assert_eq!(ImageKind::from_tag("png").unwrap(), ImageKind::Png);
        assert_eq!(ImageKind::from_tag(".JPG").unwrap(), ImageKind::Jpeg);
        assert_eq!(ImageKind::from_tag("jpeg").unwrap(), ImageKind::Jpeg);
        assert_eq!(ImageKind::from_tag("image/jpeg").unwrap(), ImageKind::Jpeg);
    }

    #[test]
    fn bmp_is_rejected_before_decoding() {
        let err = RawImage::new(vec![0x42, 0x4d], "bmp").unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedFormat(tag) if tag == "bmp"));
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        let raw = RawImage::new(b"definitely not a png".to_vec(), "png").unwrap();
        assert!(matches!(raw.decode(), Err(PipelineError::DecodeError(_))));
    }

    #[test]
    fn prepared_tensor_has_classifier_shape_and_range() {
        let image = RgbImage::from_fn(100, 150, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 255]));
        let raw = RawImage::new(encode(&image, ImageFormat::Png), "png").unwrap();
        let (decoded, tensor) = preprocess(&raw, &InputSpec::default()).unwrap();

        assert_eq!(decoded.dimensions(), (100, 150));
        assert_eq!(tensor.shape(), (3, 224, 224));
        assert!(tensor.data().iter().all(|v| (0.0..=1.0).contains(v)));
        // Blue channel is saturated everywhere.
        assert!(tensor.data().index_axis(ndarray::Axis(0), 2).iter().all(|v| *v == 1.0));
    }

    #[test]
    fn normalization_applies_mean_and_std() {
        let image = RgbImage::from_pixel(8, 8, Rgb([255, 0, 51]));
        let spec = InputSpec {
            size: 4,
            mean: [0.5, 0.5, 0.5],
            std: [0.5, 0.25, 0.2],
        };
        let tensor = prepare(&image, &spec);
        assert_eq!(tensor.shape(), (3, 4, 4));
        assert!((tensor.data()[[0, 0, 0]] - 1.0).abs() < 1e-6);
        assert!((tensor.data()[[1, 0, 0]] + 2.0).abs() < 1e-6);
        assert!((tensor.data()[[2, 0, 0]] + 1.5).abs() < 1e-5);
    }
}
