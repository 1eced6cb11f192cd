/// Request-scoped failures of the inference pipeline.
///
/// `UnsupportedFormat` and `DecodeError` are the uploader's problem and are
/// reported back verbatim. `InferenceFailure` is a server-side fault.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),
    #[error("Could not decode image: {0}")]
    DecodeError(#[from] image::ImageError),
    #[error("Inference failed: {0}")]
    InferenceFailure(String),
}

impl PipelineError {
    pub fn inference(msg: impl Into<String>) -> Self {
        PipelineError::InferenceFailure(msg.into())
    }
}
