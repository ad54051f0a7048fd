//! Codec model assembly: filterbank, encoder variant and decoder restored
//! from one checkpoint namespace.

pub mod conv;
pub mod decoder;
pub mod encoder;
pub mod pqmf;

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use crate::config::{CodecConfig, EncoderKind};
use crate::latent::LatentStatistics;
use crate::quantizer::ResidualQuantizer;

pub use conv::{StreamingConv1d, UpsampleConv1d};
pub use decoder::Decoder;
pub use encoder::{DiscreteEncoder, EncoderVariant, VariationalEncoder};
pub use pqmf::Filterbank;

/// A trained codec restored for export.
#[derive(Debug, Clone)]
pub struct CodecModel {
    pub pqmf: Filterbank,
    pub encoder: EncoderVariant,
    pub decoder: Decoder,
    pub stats: LatentStatistics,
    pub config: CodecConfig,
}

impl CodecModel {
    pub fn new(
        config: &CodecConfig,
        kind: EncoderKind,
        streaming: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let pqmf = Filterbank::new(config.n_bands, streaming, vb.pp("pqmf"))?;
        let encoder = match kind {
            EncoderKind::Variational => EncoderVariant::Variational(VariationalEncoder::new(
                config,
                streaming,
                vb.pp("encoder"),
            )?),
            EncoderKind::Discrete => {
                let quantizer = ResidualQuantizer::new(
                    config.quantizer.num_quantizers,
                    config.quantizer.codebook_size,
                    config.latent_size,
                    vb.pp("quantizer"),
                )?;
                EncoderVariant::Discrete(DiscreteEncoder::new(
                    config,
                    streaming,
                    Some(quantizer),
                    vb.pp("encoder"),
                )?)
            }
        };
        let decoder = Decoder::new(config, streaming, vb.pp("decoder"))?;
        let stats = LatentStatistics::load(&vb, config.latent_size)?;
        Ok(Self { pqmf, encoder, decoder, stats, config: config.clone() })
    }

    /// Filterbank analysis followed by the raw encoder head.
    pub fn encode_raw(&mut self, audio: &Tensor) -> Result<Tensor> {
        let subbands = self.pqmf.forward(audio)?;
        self.encoder.forward(&subbands)
    }

    /// Full roundtrip used for the warm-up pass; the variational posterior
    /// collapses to its mean.
    pub fn forward(&mut self, audio: &Tensor) -> Result<Tensor> {
        let raw = self.encode_raw(audio)?;
        let latent = match &self.encoder {
            EncoderVariant::Variational(encoder) => encoder.reparametrize(&raw)?.0,
            EncoderVariant::Discrete(_) => raw,
        };
        let subbands = self.decoder.forward(&latent)?;
        self.pqmf.inverse(&subbands)
    }

    /// Fold weight normalization into plain weights on every layer that
    /// carries the decomposition.
    pub fn remove_weight_norm(&mut self) -> Result<()> {
        self.pqmf.remove_weight_norm()?;
        self.encoder.remove_weight_norm()?;
        self.decoder.remove_weight_norm()
    }

    /// Complete named state, as stored in checkpoints and artifacts.
    pub fn tensors(&self) -> Vec<(String, Tensor)> {
        let mut out = Vec::new();
        self.pqmf.tensors("pqmf", &mut out);
        self.encoder.tensors("encoder", &mut out);
        self.decoder.tensors("decoder", &mut out);
        self.stats.tensors(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    fn tiny_config(encoder_type: &str) -> CodecConfig {
        let json = format!(
            r#"{{
                "n_bands": 4,
                "latent_size": 8,
                "hidden_size": 8,
                "ratios": [2, 2],
                "kernel_size": 3,
                "encoder_type": "{encoder_type}",
                "quantizer": {{"num_quantizers": 4, "codebook_size": 16}}
            }}"#
        );
        serde_json::from_str(&json).unwrap()
    }

    #[test]
    fn test_roundtrip_preserves_sample_count() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = tiny_config("variational");
        let mut model = CodecModel::new(&config, EncoderKind::Variational, false, vb)?;

        let audio = Tensor::zeros((1, 1, 256), DType::F32, &device)?;
        let restored = model.forward(&audio)?;
        assert_eq!(restored.dims(), &[1, 1, 256]);

        let raw = model.encode_raw(&audio)?;
        // 256 samples / (4 bands * 2 * 2) = 16 latent frames, doubled head width
        assert_eq!(raw.dims(), &[1, 16, 16]);
        Ok(())
    }

    #[test]
    fn test_discrete_model_keeps_quantizer_in_state() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = tiny_config("discrete");
        let model = CodecModel::new(&config, EncoderKind::Discrete, false, vb)?;

        let names: Vec<String> = model.tensors().into_iter().map(|(n, _)| n).collect();
        assert!(names.contains(&"quantizer.embed".to_string()));
        assert!(names.contains(&"encoder.noise_amp".to_string()));
        assert!(names.contains(&"latent_pca".to_string()));
        Ok(())
    }

    #[test]
    fn test_weight_norm_checkpoint_folds_cleanly() -> Result<()> {
        let device = Device::Cpu;
        // Build a model, re-expand one conv weight into g/v form, reload and
        // fold it back.
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = tiny_config("variational");
        let model = CodecModel::new(&config, EncoderKind::Variational, false, vb)?;

        let mut tensors: std::collections::HashMap<String, Tensor> =
            model.tensors().into_iter().collect();
        let weight = tensors.remove("decoder.pre.weight").unwrap();
        let norm = weight.sqr()?.sum_keepdim((1, 2))?.sqrt()?;
        tensors.insert("decoder.pre.weight_g".to_string(), norm.clone());
        tensors.insert("decoder.pre.weight_v".to_string(), weight.clone());

        let vb = VarBuilder::from_tensors(tensors, DType::F32, &device);
        let mut reloaded = CodecModel::new(&config, EncoderKind::Variational, false, vb)?;
        reloaded.remove_weight_norm()?;

        let folded: std::collections::HashMap<String, Tensor> =
            reloaded.tensors().into_iter().collect();
        let restored = folded.get("decoder.pre.weight").expect("plain weight after folding");
        let diff = (restored - &weight)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-4);
        Ok(())
    }
}
