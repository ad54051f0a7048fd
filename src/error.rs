//! Error surface of the export pipeline.
//!
//! Model-level code (convolutions, quantizer, strategies) stays on
//! `candle_core::Result`; everything above it reports through [`ExportError`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    /// Bad or missing run configuration, surfaced before any model work.
    #[error("configuration error: {0}")]
    Config(String),

    /// The run config names an encoder this exporter cannot package.
    #[error("encoder type \"{0}\" is not supported for export")]
    UnsupportedEncoder(String),

    /// The packaged artifact failed its post-export sanity run. The file may
    /// exist on disk but must not be distributed.
    #[error("artifact validation failed: {0}")]
    Validation(String),

    /// The artifact file on disk is missing required metadata or tensors.
    #[error("malformed artifact: {0}")]
    Artifact(String),

    /// Internal pipeline invariant breach.
    #[error("export pipeline error: {0}")]
    Pipeline(String),

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("artifact serialization error: {0}")]
    Serialize(#[from] safetensors::SafeTensorError),
}
