//! Multiband filterbank boundary around the encoder/decoder stacks.
//!
//! Analysis folds `(B, 1, T)` audio into `(B, bands, T / bands)` subband
//! frames; synthesis inverts the layout. The filters themselves are trained
//! weights restored from the checkpoint; this module only fixes their
//! geometry.

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use super::conv::{StreamingConv1d, UpsampleConv1d};

#[derive(Debug, Clone)]
pub struct Filterbank {
    analysis: StreamingConv1d,
    synthesis: UpsampleConv1d,
    bands: usize,
}

impl Filterbank {
    pub fn new(bands: usize, streaming: bool, vb: VarBuilder) -> Result<Self> {
        let analysis = StreamingConv1d::new(1, bands, 2 * bands, bands, streaming, vb.pp("analysis"))?;
        let synthesis = UpsampleConv1d::new(bands, 1, bands, vb.pp("synthesis"))?;
        Ok(Self { analysis, synthesis, bands })
    }

    /// `(B, 1, T)` → `(B, bands, T / bands)`
    pub fn forward(&mut self, audio: &Tensor) -> Result<Tensor> {
        self.analysis.forward(audio)
    }

    /// `(B, bands, T')` → `(B, 1, T' * bands)`
    pub fn inverse(&self, subbands: &Tensor) -> Result<Tensor> {
        self.synthesis.forward(subbands)
    }

    pub fn bands(&self) -> usize {
        self.bands
    }

    pub fn remove_weight_norm(&mut self) -> Result<()> {
        self.analysis.remove_weight_norm()
    }

    pub fn reset_state(&mut self) {
        self.analysis.reset_state();
    }

    pub fn tensors(&self, prefix: &str, out: &mut Vec<(String, Tensor)>) {
        self.analysis.tensors(&format!("{prefix}.analysis"), out);
        self.synthesis.tensors(&format!("{prefix}.synthesis"), out);
    }
}
