//! Export pipeline for trained neural audio codecs.
//!
//! Takes a run directory (config + checkpoint), restores the trained
//! autoencoder, and packages it into a single self-contained artifact with a
//! uniform encode/decode/forward contract, regardless of whether the model
//! was trained with a continuous variational latent or a discrete
//! residual-quantized one.
//!
//! This crate contains:
//! - `model`: filterbank, encoder variants and decoder restored from a
//!   checkpoint
//! - `latent`: trained latent statistics and fidelity-driven width selection
//! - `quantizer`: residual vector quantization over frozen codebooks
//! - `strategy`: the per-mode latent post-/pre-processing transforms
//! - `artifact`: the packaged codec, its stream metadata and (de)serialization
//! - `pipeline`: the export state machine tying it all together

pub mod artifact;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod latent;
pub mod model;
pub mod pipeline;
pub mod quantizer;
pub mod strategy;

pub use artifact::{PackagedCodec, StreamParams, PROBE_LEN};
pub use config::{CodecConfig, EncoderKind, QuantizerConfig};
pub use error::ExportError;
pub use latent::{select_latent_size, LatentStatistics};
pub use model::CodecModel;
pub use pipeline::{ExportOptions, ExportPipeline, ExportReport};
pub use quantizer::ResidualQuantizer;
pub use strategy::LatentStrategy;
