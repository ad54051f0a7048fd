//! Run configuration for codec export.
//!
//! A run directory (`runs/<name>/`) carries a `config.json` describing the
//! trained architecture. Every field has a default so a minimal file only
//! needs to override what differs from the reference setup.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ExportError;

fn default_sample_rate() -> usize { 44100 }
fn default_n_bands() -> usize { 16 }
fn default_latent_size() -> usize { 128 }
fn default_hidden_size() -> usize { 64 }
fn default_ratios() -> Vec<usize> { vec![4, 4, 2] }
fn default_kernel_size() -> usize { 5 }
fn default_encoder_type() -> String { "variational".to_string() }
fn default_num_quantizers() -> usize { 8 }
fn default_codebook_size() -> usize { 1024 }

/// Residual quantizer shape, only meaningful for discrete encoders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantizerConfig {
    #[serde(default = "default_num_quantizers")]
    pub num_quantizers: usize,
    #[serde(default = "default_codebook_size")]
    pub codebook_size: usize,
}

impl Default for QuantizerConfig {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap()
    }
}

/// Architecture of a trained codec run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: usize,
    /// Multiband filterbank band count; also the analysis stride.
    #[serde(default = "default_n_bands")]
    pub n_bands: usize,
    /// Full latent dimensionality of the trained model.
    #[serde(default = "default_latent_size")]
    pub latent_size: usize,
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    /// Per-layer temporal downsampling factors of the encoder stack.
    #[serde(default = "default_ratios")]
    pub ratios: Vec<usize>,
    /// Kernel size of the stride-1 convolutions.
    #[serde(default = "default_kernel_size")]
    pub kernel_size: usize,
    #[serde(default = "default_encoder_type")]
    pub encoder_type: String,
    #[serde(default)]
    pub quantizer: QuantizerConfig,
}

impl Default for CodecConfig {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap()
    }
}

impl CodecConfig {
    pub fn from_file(path: &Path) -> Result<Self, ExportError> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| ExportError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&data)
            .map_err(|e| ExportError::Config(format!("cannot parse {}: {e}", path.display())))?;
        Ok(config)
    }

    /// Resolve the configured encoder type into the closed set of exportable
    /// kinds. Anything else is fatal before model construction starts.
    pub fn encoder_kind(&self) -> Result<EncoderKind, ExportError> {
        EncoderKind::from_tag(&self.encoder_type)
            .ok_or_else(|| ExportError::UnsupportedEncoder(self.encoder_type.clone()))
    }

    pub fn validate(&self) -> Result<(), ExportError> {
        if self.latent_size == 0 {
            return Err(ExportError::Config("latent_size must be positive".into()));
        }
        if self.n_bands == 0 {
            return Err(ExportError::Config("n_bands must be positive".into()));
        }
        if self.hidden_size == 0 {
            return Err(ExportError::Config("hidden_size must be positive".into()));
        }
        if self.kernel_size == 0 {
            return Err(ExportError::Config("kernel_size must be positive".into()));
        }
        if self.ratios.is_empty() || self.ratios.iter().any(|&r| r == 0) {
            return Err(ExportError::Config("ratios must be a non-empty list of positive factors".into()));
        }
        if self.quantizer.num_quantizers == 0 || self.quantizer.codebook_size == 0 {
            return Err(ExportError::Config("quantizer sizes must be positive".into()));
        }
        Ok(())
    }

    /// Samples consumed per latent frame along the full encode path.
    pub fn ratio_product(&self) -> usize {
        self.n_bands * self.ratios.iter().product::<usize>()
    }
}

/// The two latent representations an exportable model can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderKind {
    Variational,
    Discrete,
}

impl EncoderKind {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "variational" => Some(Self::Variational),
            "discrete" => Some(Self::Discrete),
            _ => None,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Self::Variational => "variational",
            Self::Discrete => "discrete",
        }
    }
}

impl fmt::Display for EncoderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg = CodecConfig::default();
        assert_eq!(cfg.sample_rate, 44100);
        assert_eq!(cfg.n_bands, 16);
        assert_eq!(cfg.latent_size, 128);
        assert_eq!(cfg.hidden_size, 64);
        assert_eq!(cfg.ratios, vec![4, 4, 2]);
        assert_eq!(cfg.kernel_size, 5);
        assert_eq!(cfg.encoder_type, "variational");
        assert_eq!(cfg.quantizer.num_quantizers, 8);
        assert_eq!(cfg.quantizer.codebook_size, 1024);
    }

    #[test]
    fn test_config_deserialize_override() {
        let json = r#"{"latent_size": 16, "encoder_type": "discrete", "quantizer": {"num_quantizers": 4}}"#;
        let cfg: CodecConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.latent_size, 16);
        assert_eq!(cfg.encoder_type, "discrete");
        assert_eq!(cfg.quantizer.num_quantizers, 4);
        // rest should be defaults
        assert_eq!(cfg.n_bands, 16);
        assert_eq!(cfg.quantizer.codebook_size, 1024);
    }

    #[test]
    fn test_encoder_kind_resolution() {
        let mut cfg = CodecConfig::default();
        assert_eq!(cfg.encoder_kind().unwrap(), EncoderKind::Variational);
        cfg.encoder_type = "discrete".to_string();
        assert_eq!(cfg.encoder_kind().unwrap(), EncoderKind::Discrete);
        cfg.encoder_type = "spherical".to_string();
        match cfg.encoder_kind() {
            Err(ExportError::UnsupportedEncoder(tag)) => assert_eq!(tag, "spherical"),
            other => panic!("expected UnsupportedEncoder, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_rejects_degenerate_shapes() {
        let mut cfg = CodecConfig::default();
        cfg.ratios = vec![];
        assert!(cfg.validate().is_err());
        cfg.ratios = vec![4, 0];
        assert!(cfg.validate().is_err());
        cfg.ratios = vec![4, 2];
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.ratio_product(), 16 * 8);
    }
}
