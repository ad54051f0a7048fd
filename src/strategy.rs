//! Latent post-/pre-processing bound into the packaged artifact.
//!
//! The strategy is resolved once at export time from the encoder variant and
//! carried as a closed enum; every encode/decode afterwards is a match over
//! it. `post_process` maps the raw encoder head output to the packaged
//! latent, `pre_process` is its (lossy) inverse feeding the decoder.

use candle_core::{DType, Result, Tensor};

use crate::config::EncoderKind;
use crate::latent::LatentStatistics;
use crate::quantizer::ResidualQuantizer;

#[derive(Debug, Clone)]
pub enum LatentStrategy {
    /// PCA projection with dimensionality reduction over a Gaussian
    /// posterior mean.
    Variational {
        stats: LatentStatistics,
        latent_size: usize,
        full_latent_size: usize,
    },
    /// Residual quantization to integer index streams.
    Discrete {
        quantizer: ResidualQuantizer,
        noise_amp: Tensor,
    },
}

impl LatentStrategy {
    pub fn kind(&self) -> EncoderKind {
        match self {
            Self::Variational { .. } => EncoderKind::Variational,
            Self::Discrete { .. } => EncoderKind::Discrete,
        }
    }

    /// Channels of the packaged latent.
    pub fn latent_size(&self) -> usize {
        match self {
            Self::Variational { latent_size, .. } => *latent_size,
            Self::Discrete { quantizer, .. } => quantizer.num_quantizers(),
        }
    }

    /// Raw encoder head output → packaged latent.
    pub fn post_process(&self, raw: &Tensor) -> Result<Tensor> {
        match self {
            Self::Variational { stats, latent_size, full_latent_size } => {
                // Deterministic representative of the posterior: its mean
                // half. Sampling stays disabled in the exported graph.
                let z = raw.narrow(1, 0, *full_latent_size)?;
                let mean = stats.mean.reshape((1, *full_latent_size, 1))?;
                let z = z.broadcast_sub(&mean)?;
                let z = z.conv1d(&stats.pca.unsqueeze(2)?, 0, 1, 1, 1)?;
                z.narrow(1, 0, *latent_size)
            }
            Self::Discrete { quantizer, .. } => {
                quantizer.residual_quantize(raw)?.to_dtype(DType::F32)
            }
        }
    }

    /// Packaged latent → decoder input.
    pub fn pre_process(&self, z: &Tensor) -> Result<Tensor> {
        match self {
            Self::Variational { stats, latent_size, full_latent_size } => {
                let z = if latent_size < full_latent_size {
                    // The decoder was trained on the full-width, noise
                    // completed representation; zero fill would bias it.
                    let (b, _c, t) = z.dims3()?;
                    let noise = Tensor::randn(
                        0f32,
                        1f32,
                        (b, full_latent_size - latent_size, t),
                        z.device(),
                    )?;
                    Tensor::cat(&[z, &noise], 1)?
                } else {
                    z.clone()
                };
                let inverse = stats.pca.t()?.contiguous()?.unsqueeze(2)?;
                let z = z.conv1d(&inverse, 0, 1, 1, 1)?;
                let mean = stats.mean.reshape((1, *full_latent_size, 1))?;
                z.broadcast_add(&mean)
            }
            Self::Discrete { quantizer, noise_amp } => {
                // Dequantize clamps out-of-vocabulary indices; the smoothing
                // noise restores the quantization texture the decoder
                // expects from externally produced token streams.
                let z = quantizer.residual_dequantize(z)?;
                let noise = Tensor::randn(0f32, 1f32, z.dims().to_vec(), z.device())?;
                z.broadcast_add(&noise.broadcast_mul(noise_amp)?)
            }
        }
    }

    pub fn tensors(&self, out: &mut Vec<(String, Tensor)>) {
        if let Self::Discrete { quantizer, .. } = self {
            quantizer.tensors("quantizer", out);
        }
    }
}
