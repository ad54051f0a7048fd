//! Residual vector quantization over frozen codebooks.
//!
//! The quantizer owns the stacked codebooks of the trained encoder and is a
//! pure function of its inputs: quantize walks the stages front to back,
//! matching the running residual against each codebook; dequantize sums the
//! matched rows back up. Incoming indices are clamped into range before
//! lookup so out-of-vocabulary token streams degrade instead of failing.

use candle_core::{bail, DType, IndexOp, Result, Tensor, D};
use candle_nn::{Init, VarBuilder};

/// Ordered residual codebooks, stacked as `(num_quantizers, n_codes, dim)`.
#[derive(Debug, Clone)]
pub struct ResidualQuantizer {
    embed: Tensor,
    num_quantizers: usize,
    n_codes: usize,
    dim: usize,
}

impl ResidualQuantizer {
    pub fn new(num_quantizers: usize, n_codes: usize, dim: usize, vb: VarBuilder) -> Result<Self> {
        let embed = vb.get_with_hints(
            (num_quantizers, n_codes, dim),
            "embed",
            Init::Randn { mean: 0.0, stdev: 1.0 },
        )?;
        Ok(Self { embed, num_quantizers, n_codes, dim })
    }

    /// Wrap an already-materialized codebook stack.
    pub fn from_embed(embed: Tensor) -> Result<Self> {
        let (num_quantizers, n_codes, dim) = embed.dims3()?;
        Ok(Self { embed, num_quantizers, n_codes, dim })
    }

    /// Codebook entries per stage.
    pub fn n_codes(&self) -> usize {
        self.n_codes
    }

    pub fn num_quantizers(&self) -> usize {
        self.num_quantizers
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Quantize `(batch, dim, frames)` into `(batch, num_quantizers, frames)`
    /// stage indices, one index stream per residual stage.
    pub fn residual_quantize(&self, z: &Tensor) -> Result<Tensor> {
        let (b, e, t) = z.dims3()?;
        if e != self.dim {
            bail!("expected {} latent channels, got {e}", self.dim);
        }
        let mut residual = z.transpose(1, 2)?.reshape((b * t, e))?;
        let mut stages = Vec::with_capacity(self.num_quantizers);
        for s in 0..self.num_quantizers {
            let embed_s = self.embed.i(s)?; // (n_codes, dim)
            let indices = nearest_indices(&residual, &embed_s)?; // (b*t,)
            let matched = embed_s.embedding(&indices)?; // (b*t, dim)
            residual = (&residual - &matched)?;
            stages.push(indices.reshape((b, t))?);
        }
        Tensor::stack(&stages, 1) // (b, num_quantizers, t)
    }

    /// Dequantize `(batch, stages, frames)` indices back to
    /// `(batch, dim, frames)` by summing the matched rows per stage.
    ///
    /// Indices are clamped into `[0, n_codes - 1]` first; passing fewer
    /// stages than the quantizer owns sums only that prefix.
    pub fn residual_dequantize(&self, codes: &Tensor) -> Result<Tensor> {
        let (b, stages_in, t) = codes.dims3()?;
        if stages_in == 0 {
            bail!("empty code tensor");
        }
        let codes = codes
            .to_dtype(DType::F32)?
            .clamp(0f32, (self.n_codes - 1) as f32)?
            .round()?
            .to_dtype(DType::U32)?;
        let mut sum: Option<Tensor> = None;
        for s in 0..stages_in.min(self.num_quantizers) {
            let embed_s = self.embed.i(s)?;
            let indices = codes.narrow(1, s, 1)?.squeeze(1)?.contiguous()?.reshape(b * t)?;
            let rows = embed_s.embedding(&indices)?.reshape((b, t, self.dim))?;
            sum = Some(match sum {
                Some(acc) => (acc + rows)?,
                None => rows,
            });
        }
        match sum {
            Some(sum) => sum.transpose(1, 2)?.contiguous(),
            None => bail!("quantizer has no stages"),
        }
    }

    pub fn tensors(&self, prefix: &str, out: &mut Vec<(String, Tensor)>) {
        out.push((format!("{prefix}.embed"), self.embed.clone()));
    }
}

/// Index of the nearest codebook row for each input row, by Euclidean
/// distance in the `2·x·eᵀ − x² − e²` argmax form.
fn nearest_indices(x: &Tensor, embed: &Tensor) -> Result<Tensor> {
    let embed_t = embed.t()?.contiguous()?; // (dim, n_codes)
    let x2 = x.sqr()?.sum_keepdim(D::Minus1)?; // (n, 1)
    let dot = x.matmul(&embed_t)?; // (n, n_codes)
    let e2 = embed_t.sqr()?.sum_keepdim(0)?; // (1, n_codes)
    let neg_dist = dot.affine(2.0, 0.0)?.broadcast_sub(&x2)?.broadcast_sub(&e2)?;
    neg_dist.argmax(D::Minus1)
}
