//! Decoder stack: latent frames back to subband audio.

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use crate::config::CodecConfig;

use super::conv::{StreamingConv1d, UpsampleConv1d};

/// Mirror of the encoder body: one exact-ratio upsampling stage per encoder
/// downsampling ratio, each followed by a stride-1 smoothing convolution.
#[derive(Debug, Clone)]
pub struct Decoder {
    pre: StreamingConv1d,
    up: Vec<UpsampleConv1d>,
    smooth: Vec<StreamingConv1d>,
    post: StreamingConv1d,
}

impl Decoder {
    pub fn new(config: &CodecConfig, streaming: bool, vb: VarBuilder) -> Result<Self> {
        let pre = StreamingConv1d::new(
            config.latent_size,
            config.hidden_size,
            config.kernel_size,
            1,
            streaming,
            vb.pp("pre"),
        )?;
        let mut up = Vec::with_capacity(config.ratios.len());
        let mut smooth = Vec::with_capacity(config.ratios.len());
        for (i, &ratio) in config.ratios.iter().rev().enumerate() {
            up.push(UpsampleConv1d::new(
                config.hidden_size,
                config.hidden_size,
                ratio,
                vb.pp(format!("up.{i}")),
            )?);
            smooth.push(StreamingConv1d::new(
                config.hidden_size,
                config.hidden_size,
                config.kernel_size,
                1,
                streaming,
                vb.pp(format!("smooth.{i}")),
            )?);
        }
        let post = StreamingConv1d::new(
            config.hidden_size,
            config.n_bands,
            config.kernel_size,
            1,
            streaming,
            vb.pp("post"),
        )?;
        Ok(Self { pre, up, smooth, post })
    }

    /// `(B, latent_size, T')` → `(B, bands, T' · ∏ratios)`, bounded output.
    pub fn forward(&mut self, latent: &Tensor) -> Result<Tensor> {
        let mut xs = self.pre.forward(latent)?.relu()?;
        for (up, smooth) in self.up.iter().zip(self.smooth.iter_mut()) {
            xs = up.forward(&xs)?;
            xs = smooth.forward(&xs)?.relu()?;
        }
        self.post.forward(&xs)?.tanh()
    }

    pub fn remove_weight_norm(&mut self) -> Result<()> {
        self.pre.remove_weight_norm()?;
        for smooth in self.smooth.iter_mut() {
            smooth.remove_weight_norm()?;
        }
        self.post.remove_weight_norm()
    }

    pub fn tensors(&self, prefix: &str, out: &mut Vec<(String, Tensor)>) {
        self.pre.tensors(&format!("{prefix}.pre"), out);
        for (i, up) in self.up.iter().enumerate() {
            up.tensors(&format!("{prefix}.up.{i}"), out);
        }
        for (i, smooth) in self.smooth.iter().enumerate() {
            smooth.tensors(&format!("{prefix}.smooth.{i}"), out);
        }
        self.post.tensors(&format!("{prefix}.post"), out);
    }
}
