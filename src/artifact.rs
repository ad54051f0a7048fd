//! The deployable artifact: frozen weights, latent strategy and stream
//! metadata in a single safetensors file.
//!
//! A downstream host discovers the artifact's I/O geometry from four integer
//! vectors stored alongside the weights, without building the model:
//! `encode_params`, `decode_params`, `forward_params` and `sampling_rate`.
//! The file's `__metadata__` header carries the mode, the streaming and
//! stereo flags and the codec config, which is everything a fresh process
//! needs to rebuild the module graph.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;

use crate::config::{CodecConfig, EncoderKind};
use crate::error::ExportError;
use crate::latent::LatentStatistics;
use crate::model::{CodecModel, Decoder, DiscreteEncoder, EncoderVariant, Filterbank, VariationalEncoder};
use crate::quantizer::ResidualQuantizer;
use crate::strategy::LatentStrategy;

/// Probe length used to measure the stream ratio and to validate the
/// packaged artifact.
pub const PROBE_LEN: usize = 1 << 14;

/// Shape metadata frozen into the artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamParams {
    /// `[1, 1, latent_size, ratio]`
    pub encode: [i64; 4],
    /// `[latent_size, ratio, channels, 1]`
    pub decode: [i64; 4],
    /// `[1, 1, channels, 1]`
    pub forward: [i64; 4],
    pub sample_rate: i64,
}

impl StreamParams {
    pub fn new(latent_size: usize, ratio: usize, channels: usize, sample_rate: usize) -> Self {
        Self {
            encode: [1, 1, latent_size as i64, ratio as i64],
            decode: [latent_size as i64, ratio as i64, channels as i64, 1],
            forward: [1, 1, channels as i64, 1],
            sample_rate: sample_rate as i64,
        }
    }

    pub fn latent_size(&self) -> usize {
        self.encode[2] as usize
    }

    /// Input samples per latent frame.
    pub fn ratio(&self) -> usize {
        self.encode[3] as usize
    }

    pub fn channels(&self) -> usize {
        self.decode[2] as usize
    }

    fn tensors(&self, device: &Device) -> candle_core::Result<Vec<(String, Tensor)>> {
        Ok(vec![
            ("encode_params".to_string(), Tensor::new(&self.encode, device)?),
            ("decode_params".to_string(), Tensor::new(&self.decode, device)?),
            ("forward_params".to_string(), Tensor::new(&self.forward, device)?),
            ("sampling_rate".to_string(), Tensor::new(&[self.sample_rate], device)?),
        ])
    }

    /// Read the shape metadata straight out of an artifact file, without
    /// materializing the weights or building the model.
    pub fn from_file(path: &Path) -> Result<Self, ExportError> {
        let bytes = std::fs::read(path)?;
        let st = safetensors::SafeTensors::deserialize(&bytes)?;
        let vector = |name: &str| -> Result<Vec<i64>, ExportError> {
            let view = st
                .tensor(name)
                .map_err(|_| ExportError::Artifact(format!("missing {name}")))?;
            if view.dtype() != safetensors::Dtype::I64 {
                return Err(ExportError::Artifact(format!(
                    "{name} stored as {:?}, expected I64",
                    view.dtype()
                )));
            }
            let mut values = Vec::with_capacity(view.data().len() / 8);
            for chunk in view.data().chunks_exact(8) {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                values.push(i64::from_le_bytes(raw));
            }
            Ok(values)
        };
        let quad = |name: &str| -> Result<[i64; 4], ExportError> {
            vector(name)?
                .try_into()
                .map_err(|_| ExportError::Artifact(format!("{name} is not a 4-vector")))
        };
        let sample_rate = *vector("sampling_rate")?
            .first()
            .ok_or_else(|| ExportError::Artifact("empty sampling_rate".to_string()))?;
        Ok(Self {
            encode: quad("encode_params")?,
            decode: quad("decode_params")?,
            forward: quad("forward_params")?,
            sample_rate,
        })
    }

    fn from_tensors(tensors: &HashMap<String, Tensor>) -> Result<Self, ExportError> {
        let vector = |name: &str| -> Result<Vec<i64>, ExportError> {
            let tensor = tensors
                .get(name)
                .ok_or_else(|| ExportError::Artifact(format!("missing {name}")))?;
            tensor.to_vec1::<i64>().map_err(ExportError::Tensor)
        };
        let quad = |name: &str| -> Result<[i64; 4], ExportError> {
            vector(name)?
                .try_into()
                .map_err(|_| ExportError::Artifact(format!("{name} is not a 4-vector")))
        };
        let sample_rate = *vector("sampling_rate")?
            .first()
            .ok_or_else(|| ExportError::Artifact("empty sampling_rate".to_string()))?;
        Ok(Self {
            encode: quad("encode_params")?,
            decode: quad("decode_params")?,
            forward: quad("forward_params")?,
            sample_rate,
        })
    }
}

/// A packaged dual-mode codec: `encode`, `decode` and `forward` over frozen
/// state. Streaming caches are exclusive to the instance, so all entry
/// points take `&mut self`; spin up one instance per concurrent stream.
#[derive(Debug)]
pub struct PackagedCodec {
    pqmf: Filterbank,
    encoder: EncoderVariant,
    decoder: Decoder,
    stats: LatentStatistics,
    strategy: LatentStrategy,
    params: StreamParams,
    config: CodecConfig,
    streaming: bool,
    stereo: bool,
}

impl PackagedCodec {
    pub fn new(
        model: CodecModel,
        strategy: LatentStrategy,
        params: StreamParams,
        streaming: bool,
        stereo: bool,
    ) -> Self {
        let CodecModel { pqmf, encoder, decoder, stats, config } = model;
        Self { pqmf, encoder, decoder, stats, strategy, params, config, streaming, stereo }
    }

    pub fn params(&self) -> &StreamParams {
        &self.params
    }

    pub fn mode(&self) -> EncoderKind {
        self.strategy.kind()
    }

    pub fn stereo(&self) -> bool {
        self.stereo
    }

    fn device(&self) -> Device {
        self.stats.mean.device().clone()
    }

    /// `(B, 1, T)` audio → `(B, latent_size, T / ratio)` packaged latent.
    pub fn encode(&mut self, audio: &Tensor) -> candle_core::Result<Tensor> {
        let subbands = self.pqmf.forward(audio)?;
        let raw = self.encoder.forward(&subbands)?;
        self.strategy.post_process(&raw)
    }

    /// Packaged latent → `(B, channels, T' · ratio)` audio.
    pub fn decode(&mut self, latent: &Tensor) -> candle_core::Result<Tensor> {
        let latent = self.strategy.pre_process(latent)?;
        // Stereo synthesizes two copies of the completed latent as one
        // batch; duplicating after pre-processing keeps both channels
        // bit-identical.
        let latent = if self.stereo {
            Tensor::cat(&[&latent, &latent], 0)?
        } else {
            latent
        };
        let subbands = self.decoder.forward(&latent)?;
        let audio = self.pqmf.inverse(&subbands)?;
        if self.stereo {
            let halves = audio.chunk(2, 0)?;
            Tensor::cat(&[&halves[0], &halves[1]], 1)
        } else {
            Ok(audio)
        }
    }

    pub fn forward(&mut self, audio: &Tensor) -> candle_core::Result<Tensor> {
        let latent = self.encode(audio)?;
        self.decode(&latent)
    }

    /// Freeze everything into a single safetensors file.
    pub fn save(&self, path: &Path) -> Result<(), ExportError> {
        let device = self.device();
        let mut tensors = Vec::new();
        self.pqmf.tensors("pqmf", &mut tensors);
        self.encoder.tensors("encoder", &mut tensors);
        self.decoder.tensors("decoder", &mut tensors);
        self.stats.tensors(&mut tensors);
        self.strategy.tensors(&mut tensors);
        tensors.extend(self.params.tensors(&device)?);

        let mut frozen = Vec::with_capacity(tensors.len());
        for (name, tensor) in tensors {
            frozen.push((name, RawTensor::from_tensor(&tensor)?));
        }

        let mut metadata = HashMap::new();
        metadata.insert("mode".to_string(), self.strategy.kind().tag().to_string());
        metadata.insert("streaming".to_string(), self.streaming.to_string());
        metadata.insert("stereo".to_string(), self.stereo.to_string());
        metadata.insert("config".to_string(), serde_json::to_string(&self.config)?);

        safetensors::serialize_to_file(frozen, &Some(metadata), path)?;
        Ok(())
    }

    /// Rebuild a codec from an artifact file, outside the process that
    /// authored it.
    pub fn load(path: &Path, device: &Device) -> Result<Self, ExportError> {
        let bytes = std::fs::read(path)?;
        let metadata = read_artifact_metadata(&bytes)?;
        let mode = metadata
            .get("mode")
            .ok_or_else(|| ExportError::Artifact("missing mode".to_string()))?;
        let kind = EncoderKind::from_tag(mode)
            .ok_or_else(|| ExportError::UnsupportedEncoder(mode.clone()))?;
        let streaming = metadata.get("streaming").map(|v| v == "true").unwrap_or(false);
        let stereo = metadata.get("stereo").map(|v| v == "true").unwrap_or(false);
        let config: CodecConfig = serde_json::from_str(
            metadata
                .get("config")
                .ok_or_else(|| ExportError::Artifact("missing config".to_string()))?,
        )?;
        config.validate()?;

        let tensors = candle_core::safetensors::load(path, device)?;
        let params = StreamParams::from_tensors(&tensors)?;
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);

        let pqmf = Filterbank::new(config.n_bands, streaming, vb.pp("pqmf"))?;
        let decoder = Decoder::new(&config, streaming, vb.pp("decoder"))?;
        let stats = LatentStatistics::load(&vb, config.latent_size)?;
        let (encoder, strategy) = match kind {
            EncoderKind::Variational => {
                let encoder = VariationalEncoder::new(&config, streaming, vb.pp("encoder"))?;
                let strategy = LatentStrategy::Variational {
                    stats: stats.clone(),
                    latent_size: params.latent_size(),
                    full_latent_size: config.latent_size,
                };
                (EncoderVariant::Variational(encoder), strategy)
            }
            EncoderKind::Discrete => {
                let quantizer = ResidualQuantizer::new(
                    config.quantizer.num_quantizers,
                    config.quantizer.codebook_size,
                    config.latent_size,
                    vb.pp("quantizer"),
                )?;
                let encoder = DiscreteEncoder::new(&config, streaming, None, vb.pp("encoder"))?;
                let strategy = LatentStrategy::Discrete {
                    quantizer,
                    noise_amp: encoder.noise_amp().clone(),
                };
                (EncoderVariant::Discrete(encoder), strategy)
            }
        };

        Ok(Self { pqmf, encoder, decoder, stats, strategy, params, config, streaming, stereo })
    }

    /// Sanity run against the frozen metadata: encode, decode and forward a
    /// probe and check every advertised shape.
    pub fn validate(&mut self) -> Result<(), ExportError> {
        let device = self.device();
        let probe = Tensor::zeros((1, 1, PROBE_LEN), DType::F32, &device)?;

        let latent = self.encode(&probe)?;
        let frames = PROBE_LEN / self.params.ratio();
        let expected = [1, self.params.latent_size(), frames];
        if latent.dims() != expected.as_slice() {
            return Err(ExportError::Validation(format!(
                "encode produced {:?}, expected {expected:?}",
                latent.dims()
            )));
        }

        let audio = self.decode(&latent)?;
        let expected = [1, self.params.channels(), frames * self.params.ratio()];
        if audio.dims() != expected.as_slice() {
            return Err(ExportError::Validation(format!(
                "decode produced {:?}, expected {expected:?}",
                audio.dims()
            )));
        }

        let roundtrip = self.forward(&probe)?;
        let channels = roundtrip.dim(1)?;
        if channels != self.params.channels() {
            return Err(ExportError::Validation(format!(
                "forward produced {channels} channels, expected {}",
                self.params.channels()
            )));
        }
        Ok(())
    }
}

/// Owned byte view of a tensor for serialization, independent of the tensor
/// library's internal storage layout.
struct RawTensor {
    dtype: safetensors::Dtype,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl RawTensor {
    fn from_tensor(tensor: &Tensor) -> Result<Self, ExportError> {
        let shape = tensor.dims().to_vec();
        let flat = tensor.contiguous()?.flatten_all()?;
        let (dtype, data) = match tensor.dtype() {
            DType::F32 => {
                let values = flat.to_vec1::<f32>()?;
                let mut data = Vec::with_capacity(values.len() * 4);
                for v in values {
                    data.extend_from_slice(&v.to_le_bytes());
                }
                (safetensors::Dtype::F32, data)
            }
            DType::I64 => {
                let values = flat.to_vec1::<i64>()?;
                let mut data = Vec::with_capacity(values.len() * 8);
                for v in values {
                    data.extend_from_slice(&v.to_le_bytes());
                }
                (safetensors::Dtype::I64, data)
            }
            other => {
                return Err(ExportError::Artifact(format!(
                    "cannot serialize {other:?} tensors"
                )))
            }
        };
        Ok(Self { dtype, shape, data })
    }
}

impl safetensors::View for RawTensor {
    fn dtype(&self) -> safetensors::Dtype {
        self.dtype
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data(&self) -> std::borrow::Cow<'_, [u8]> {
        std::borrow::Cow::Borrowed(&self.data)
    }

    fn data_len(&self) -> usize {
        self.data.len()
    }
}

/// Parse the `__metadata__` map out of a safetensors header.
fn read_artifact_metadata(bytes: &[u8]) -> Result<HashMap<String, String>, ExportError> {
    if bytes.len() < 8 {
        return Err(ExportError::Artifact("file shorter than its header length".to_string()));
    }
    let mut length = [0u8; 8];
    length.copy_from_slice(&bytes[..8]);
    let header_len = u64::from_le_bytes(length) as usize;
    if bytes.len() < 8 + header_len {
        return Err(ExportError::Artifact("truncated header".to_string()));
    }
    let header: serde_json::Value = serde_json::from_slice(&bytes[8..8 + header_len])?;
    let metadata = header
        .get("__metadata__")
        .and_then(|v| v.as_object())
        .ok_or_else(|| ExportError::Artifact("missing __metadata__ header".to_string()))?;
    Ok(metadata
        .iter()
        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
        .collect())
}
