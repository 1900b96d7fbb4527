/// Result alias that carries the custom [`ThumbnailError`] type.
pub type Result<T> = std::result::Result<T, ThumbnailError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum ThumbnailError {
    /// Free-form failure, mostly used for poisoned locks and thread plumbing.
    #[error("{0}")]
    Message(String),
    /// A caller handed in a value outside the accepted domain.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// The WAV reader rejected the source.
    #[error("wav decode failed: {0}")]
    Wav(#[from] hound::Error),
    /// Encoding or decoding a raster image failed.
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    /// Configuration could not be parsed.
    #[error("config parse error: {0}")]
    Config(#[from] serde_json::Error),
}

impl ThumbnailError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }
}
