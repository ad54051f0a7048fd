//! Encoder stacks for the two exportable latent representations.
//!
//! Both variants share the same strided convolution body; they differ in the
//! head. The variational head emits `2 · latent_size` channels (posterior
//! mean ‖ log-scale), the discrete head emits `latent_size` channels that
//! feed a residual quantizer trained jointly with it.

use candle_core::{Result, Tensor};
use candle_nn::{Init, VarBuilder};

use crate::config::{CodecConfig, EncoderKind};
use crate::quantizer::ResidualQuantizer;

use super::conv::StreamingConv1d;

fn conv_body(config: &CodecConfig, streaming: bool, vb: &VarBuilder) -> Result<Vec<StreamingConv1d>> {
    let mut net = Vec::with_capacity(config.ratios.len() + 1);
    net.push(StreamingConv1d::new(
        config.n_bands,
        config.hidden_size,
        config.kernel_size,
        1,
        streaming,
        vb.pp("net.0"),
    )?);
    for (i, &ratio) in config.ratios.iter().enumerate() {
        net.push(StreamingConv1d::new(
            config.hidden_size,
            config.hidden_size,
            2 * ratio,
            ratio,
            streaming,
            vb.pp(format!("net.{}", i + 1)),
        )?);
    }
    Ok(net)
}

fn body_forward(net: &mut [StreamingConv1d], xs: &Tensor) -> Result<Tensor> {
    let mut xs = xs.clone();
    for conv in net.iter_mut() {
        xs = conv.forward(&xs)?.relu()?;
    }
    Ok(xs)
}

/// Encoder emitting a Gaussian posterior over the latent space.
#[derive(Debug, Clone)]
pub struct VariationalEncoder {
    net: Vec<StreamingConv1d>,
    out: StreamingConv1d,
    latent_size: usize,
}

impl VariationalEncoder {
    pub fn new(config: &CodecConfig, streaming: bool, vb: VarBuilder) -> Result<Self> {
        let net = conv_body(config, streaming, &vb)?;
        let out = StreamingConv1d::new(
            config.hidden_size,
            2 * config.latent_size,
            config.kernel_size,
            1,
            streaming,
            vb.pp("out"),
        )?;
        Ok(Self { net, out, latent_size: config.latent_size })
    }

    /// `(B, bands, T)` → `(B, 2 · latent_size, T')` raw posterior parameters.
    pub fn forward(&mut self, xs: &Tensor) -> Result<Tensor> {
        let xs = body_forward(&mut self.net, xs)?;
        self.out.forward(&xs)
    }

    /// Split raw posterior parameters into `(mean, std)`. At export time the
    /// mean is the deterministic representative of the distribution.
    pub fn reparametrize(&self, z: &Tensor) -> Result<(Tensor, Tensor)> {
        let mean = z.narrow(1, 0, self.latent_size)?;
        let std = z.narrow(1, self.latent_size, self.latent_size)?.exp()?;
        Ok((mean, std))
    }

    pub fn remove_weight_norm(&mut self) -> Result<()> {
        for conv in self.net.iter_mut() {
            conv.remove_weight_norm()?;
        }
        self.out.remove_weight_norm()
    }

    pub fn reset_state(&mut self) {
        for conv in self.net.iter_mut() {
            conv.reset_state();
        }
        self.out.reset_state();
    }

    pub fn tensors(&self, prefix: &str, out: &mut Vec<(String, Tensor)>) {
        for (i, conv) in self.net.iter().enumerate() {
            conv.tensors(&format!("{prefix}.net.{i}"), out);
        }
        self.out.tensors(&format!("{prefix}.out"), out);
    }
}

/// Encoder trained against a residual quantizer.
#[derive(Debug, Clone)]
pub struct DiscreteEncoder {
    net: Vec<StreamingConv1d>,
    out: StreamingConv1d,
    quantizer: Option<ResidualQuantizer>,
    noise_amp: Tensor,
}

impl DiscreteEncoder {
    /// `quantizer` is `None` when rebuilding from a packaged artifact, where
    /// the codebooks already live in the latent strategy.
    pub fn new(
        config: &CodecConfig,
        streaming: bool,
        quantizer: Option<ResidualQuantizer>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let net = conv_body(config, streaming, &vb)?;
        let out = StreamingConv1d::new(
            config.hidden_size,
            config.latent_size,
            config.kernel_size,
            1,
            streaming,
            vb.pp("out"),
        )?;
        let noise_amp = vb.get_with_hints((config.latent_size, 1), "noise_amp", Init::Const(0.1))?;
        Ok(Self { net, out, quantizer, noise_amp })
    }

    /// `(B, bands, T)` → `(B, latent_size, T')`
    pub fn forward(&mut self, xs: &Tensor) -> Result<Tensor> {
        let xs = body_forward(&mut self.net, xs)?;
        self.out.forward(&xs)
    }

    /// Hand the codebooks over to the caller; the encoder keeps only its
    /// convolutional body afterwards.
    pub fn take_quantizer(&mut self) -> Option<ResidualQuantizer> {
        self.quantizer.take()
    }

    pub fn quantizer(&self) -> Option<&ResidualQuantizer> {
        self.quantizer.as_ref()
    }

    /// Per-channel amplitude of the smoothing noise applied to dequantized
    /// latents before decoding.
    pub fn noise_amp(&self) -> &Tensor {
        &self.noise_amp
    }

    pub fn remove_weight_norm(&mut self) -> Result<()> {
        for conv in self.net.iter_mut() {
            conv.remove_weight_norm()?;
        }
        self.out.remove_weight_norm()
    }

    pub fn tensors(&self, prefix: &str, out: &mut Vec<(String, Tensor)>) {
        for (i, conv) in self.net.iter().enumerate() {
            conv.tensors(&format!("{prefix}.net.{i}"), out);
        }
        self.out.tensors(&format!("{prefix}.out"), out);
        out.push((format!("{prefix}.noise_amp"), self.noise_amp.clone()));
        // Codebooks live at the root namespace, beside the encoder.
        if let Some(quantizer) = &self.quantizer {
            quantizer.tensors("quantizer", out);
        }
    }
}

/// Closed set of encoder variants an exportable model can carry.
#[derive(Debug, Clone)]
pub enum EncoderVariant {
    Variational(VariationalEncoder),
    Discrete(DiscreteEncoder),
}

impl EncoderVariant {
    pub fn forward(&mut self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Variational(encoder) => encoder.forward(xs),
            Self::Discrete(encoder) => encoder.forward(xs),
        }
    }

    pub fn kind(&self) -> EncoderKind {
        match self {
            Self::Variational(_) => EncoderKind::Variational,
            Self::Discrete(_) => EncoderKind::Discrete,
        }
    }

    pub fn remove_weight_norm(&mut self) -> Result<()> {
        match self {
            Self::Variational(encoder) => encoder.remove_weight_norm(),
            Self::Discrete(encoder) => encoder.remove_weight_norm(),
        }
    }

    pub fn tensors(&self, prefix: &str, out: &mut Vec<(String, Tensor)>) {
        match self {
            Self::Variational(encoder) => encoder.tensors(prefix, out),
            Self::Discrete(encoder) => encoder.tensors(prefix, out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn tiny_config() -> CodecConfig {
        let json = r#"{
            "n_bands": 4,
            "latent_size": 8,
            "hidden_size": 8,
            "ratios": [2, 2],
            "kernel_size": 3
        }"#;
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_variational_head_width_and_split() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mut encoder = VariationalEncoder::new(&tiny_config(), false, vb)?;

        let subbands = Tensor::randn(0f32, 1.0, (1, 4, 32), &device)?;
        let raw = encoder.forward(&subbands)?;
        assert_eq!(raw.dims(), &[1, 16, 8]);

        let (mean, std) = encoder.reparametrize(&raw)?;
        assert_eq!(mean.dims(), &[1, 8, 8]);
        assert_eq!(std.dims(), &[1, 8, 8]);
        // exp() keeps the scale strictly positive
        let min = std.flatten_all()?.to_vec1::<f32>()?.into_iter().fold(f32::INFINITY, f32::min);
        assert!(min > 0.0);
        Ok(())
    }

    #[test]
    fn test_discrete_head_width_and_quantizer_handoff() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = tiny_config();
        let quantizer = ResidualQuantizer::new(4, 16, config.latent_size, vb.pp("quantizer"))?;
        let mut encoder = DiscreteEncoder::new(&config, false, Some(quantizer), vb.pp("encoder"))?;

        let subbands = Tensor::randn(0f32, 1.0, (1, 4, 32), &device)?;
        let latent = encoder.forward(&subbands)?;
        assert_eq!(latent.dims(), &[1, 8, 8]);

        let taken = encoder.take_quantizer().expect("quantizer bound at construction");
        assert_eq!(taken.num_quantizers(), 4);
        assert!(encoder.take_quantizer().is_none());
        Ok(())
    }
}
