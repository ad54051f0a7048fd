//! The export pipeline: restore, warm up, normalize, bind, package,
//! validate. Strictly sequential; one model per run; a failed step halts the
//! run with the single exception of a missing checkpoint, which downgrades
//! to a warning.

use std::path::PathBuf;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use tracing::{info, warn};

use crate::artifact::{PackagedCodec, StreamParams, PROBE_LEN};
use crate::checkpoint::search_for_run;
use crate::config::{CodecConfig, EncoderKind};
use crate::error::ExportError;
use crate::latent::select_latent_size;
use crate::model::{CodecModel, EncoderVariant};
use crate::strategy::LatentStrategy;

/// Caller-facing knobs of one export run.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    /// Run name; selects `runs/<name>/` and names the artifact.
    pub name: String,
    /// Directory holding the run directories.
    pub runs_root: PathBuf,
    /// Directory the artifact is written into.
    pub out_dir: PathBuf,
    /// Build causal, cache-carrying convolutions for real-time use.
    pub streaming: bool,
    /// Cumulative explained-variance target for variational truncation.
    pub fidelity: f32,
    pub stereo: bool,
}

impl ExportOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            runs_root: PathBuf::from("runs"),
            out_dir: PathBuf::from("."),
            streaming: false,
            fidelity: 0.95,
            stereo: false,
        }
    }
}

/// What a completed run produced.
#[derive(Debug, Clone)]
pub struct ExportReport {
    pub artifact: PathBuf,
    pub mode: EncoderKind,
    pub latent_size: usize,
    pub ratio: usize,
    pub channels: usize,
    /// Checkpoint the weights came from; `None` means the export ran on
    /// randomly initialized weights.
    pub checkpoint: Option<PathBuf>,
}

pub struct ExportPipeline {
    options: ExportOptions,
    device: Device,
}

impl ExportPipeline {
    pub fn new(options: ExportOptions) -> Self {
        Self { options, device: Device::Cpu }
    }

    pub fn run(&self) -> Result<ExportReport, ExportError> {
        let options = &self.options;
        if options.name.is_empty() {
            return Err(ExportError::Config("a model name is required".to_string()));
        }
        if !(0.0..=1.0).contains(&options.fidelity) {
            return Err(ExportError::Config(format!(
                "fidelity must lie in [0, 1], got {}",
                options.fidelity
            )));
        }

        let run_dir = options.runs_root.join(&options.name);
        let config = CodecConfig::from_file(&run_dir.join("config.json"))?;
        config.validate()?;
        let kind = config.encoder_kind()?;

        info!(model = %options.name, encoder = %kind, "building codec model");
        let checkpoint = search_for_run(&run_dir);
        let vb = match &checkpoint {
            Some(path) => {
                info!(checkpoint = %path.display(), "restoring weights");
                let tensors = candle_core::safetensors::load(path, &self.device)?;
                VarBuilder::from_tensors(tensors, DType::F32, &self.device)
            }
            None => {
                warn!("no checkpoint found, model will remain randomly initialized");
                let varmap = VarMap::new();
                VarBuilder::from_varmap(&varmap, DType::F32, &self.device)
            }
        };
        let mut model = CodecModel::new(&config, kind, options.streaming, vb)?;

        info!("warmup pass");
        let probe = Tensor::zeros((1, 1, PROBE_LEN), DType::F32, &self.device)?;
        model.forward(&probe)?;

        info!("removing weight normalization");
        model.remove_weight_norm()?;

        info!("binding latent strategy");
        let latent_size = match kind {
            EncoderKind::Variational => {
                let curve = model.stats.fidelity_curve()?;
                select_latent_size(&curve, options.fidelity, config.latent_size)
            }
            EncoderKind::Discrete => config.quantizer.num_quantizers,
        };
        let strategy = match &mut model.encoder {
            EncoderVariant::Variational(_) => LatentStrategy::Variational {
                stats: model.stats.clone(),
                latent_size,
                full_latent_size: config.latent_size,
            },
            EncoderVariant::Discrete(encoder) => {
                let quantizer = encoder.take_quantizer().ok_or_else(|| {
                    ExportError::Pipeline("discrete encoder lost its quantizer".to_string())
                })?;
                LatentStrategy::Discrete { quantizer, noise_amp: encoder.noise_amp().clone() }
            }
        };

        info!("packaging artifact");
        let raw = model.encode_raw(&probe)?;
        let frames = raw.dim(2)?;
        if frames == 0 {
            return Err(ExportError::Pipeline("probe produced no latent frames".to_string()));
        }
        let ratio = PROBE_LEN / frames;
        let channels = if options.stereo { 2 } else { 1 };
        let params = StreamParams::new(latent_size, ratio, channels, config.sample_rate);

        let packaged =
            PackagedCodec::new(model, strategy, params, options.streaming, options.stereo);
        let artifact = options.out_dir.join(format!("{}.ts", options.name));
        packaged.save(&artifact)?;

        info!(artifact = %artifact.display(), "validating artifact");
        let mut reloaded = PackagedCodec::load(&artifact, &self.device)?;
        reloaded.validate()?;

        Ok(ExportReport { artifact, mode: kind, latent_size, ratio, channels, checkpoint })
    }
}
