//! Convolution primitives shared by the filterbank, encoders and decoder.
//!
//! [`StreamingConv1d`] supports two padding disciplines: centered zero
//! padding for offline use, or causal left context carried in a cache tensor
//! between calls for streaming use. Both keep the frame count at
//! `T / stride`. Checkpoints may store the weight in its normalized
//! `weight_g` / `weight_v` decomposition; the packaging pipeline folds that
//! into a plain weight before freezing.

use candle_core::{Result, Tensor};
use candle_nn::{init, Init, VarBuilder};

/// 1-d convolution with an optional streaming cache.
#[derive(Debug, Clone)]
pub struct StreamingConv1d {
    weight: Tensor,
    weight_g: Option<Tensor>,
    weight_v: Option<Tensor>,
    bias: Tensor,
    out_channels: usize,
    kernel_size: usize,
    stride: usize,
    causal: bool,
    cache: Option<Tensor>,
}

impl StreamingConv1d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        causal: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let (weight, weight_g, weight_v) = if vb.contains_tensor("weight_g") {
            let g = vb.get((out_channels, 1, 1), "weight_g")?;
            let v = vb.get((out_channels, in_channels, kernel_size), "weight_v")?;
            let folded = normalized_weight(&g, &v)?;
            (folded, Some(g), Some(v))
        } else {
            let w = vb.get_with_hints(
                (out_channels, in_channels, kernel_size),
                "weight",
                init::DEFAULT_KAIMING_NORMAL,
            )?;
            (w, None, None)
        };
        let bias = vb.get_with_hints(out_channels, "bias", Init::Const(0.0))?;
        Ok(Self {
            weight,
            weight_g,
            weight_v,
            bias,
            out_channels,
            kernel_size,
            stride,
            causal,
            cache: None,
        })
    }

    /// Left context the convolution needs beyond the current hop.
    fn context(&self) -> usize {
        self.kernel_size - self.stride
    }

    pub fn forward(&mut self, xs: &Tensor) -> Result<Tensor> {
        // Until the normalization is folded away, the weight is recomputed
        // from its decomposition on every call, matching training behavior.
        let weight = match (&self.weight_g, &self.weight_v) {
            (Some(g), Some(v)) => normalized_weight(g, v)?,
            _ => self.weight.clone(),
        };
        let context = self.context();
        let xs = if self.causal {
            if context == 0 {
                xs.clone()
            } else {
                let (b, c, _t) = xs.dims3()?;
                let cache = match &self.cache {
                    Some(prev) if prev.dim(0)? == b => prev.clone(),
                    _ => Tensor::zeros((b, c, context), xs.dtype(), xs.device())?,
                };
                let padded = Tensor::cat(&[&cache, xs], 2)?;
                let total = padded.dim(2)?;
                self.cache = Some(padded.narrow(2, total - context, context)?);
                padded
            }
        } else {
            let left = context / 2;
            xs.pad_with_zeros(2, left, context - left)?
        };
        let ys = xs.conv1d(&weight, 0, self.stride, 1, 1)?;
        ys.broadcast_add(&self.bias.reshape((1, self.out_channels, 1))?)
    }

    /// Fold `weight_g` / `weight_v` into a plain weight. No-op on layers
    /// that never carried the decomposition.
    pub fn remove_weight_norm(&mut self) -> Result<()> {
        if let (Some(g), Some(v)) = (self.weight_g.take(), self.weight_v.take()) {
            self.weight = normalized_weight(&g, &v)?;
        }
        Ok(())
    }

    /// Drop the streaming context, e.g. between unrelated streams.
    pub fn reset_state(&mut self) {
        self.cache = None;
    }

    pub fn tensors(&self, prefix: &str, out: &mut Vec<(String, Tensor)>) {
        match (&self.weight_g, &self.weight_v) {
            (Some(g), Some(v)) => {
                out.push((format!("{prefix}.weight_g"), g.clone()));
                out.push((format!("{prefix}.weight_v"), v.clone()));
            }
            _ => out.push((format!("{prefix}.weight"), self.weight.clone())),
        }
        out.push((format!("{prefix}.bias"), self.bias.clone()));
    }
}

/// Transposed convolution with `kernel_size == stride`: exact ×stride
/// upsampling, causal by construction, so it needs no streaming cache.
#[derive(Debug, Clone)]
pub struct UpsampleConv1d {
    weight: Tensor,
    bias: Tensor,
    out_channels: usize,
    stride: usize,
}

impl UpsampleConv1d {
    pub fn new(in_channels: usize, out_channels: usize, stride: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(
            (in_channels, out_channels, stride),
            "weight",
            init::DEFAULT_KAIMING_NORMAL,
        )?;
        let bias = vb.get_with_hints(out_channels, "bias", Init::Const(0.0))?;
        Ok(Self { weight, bias, out_channels, stride })
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let ys = xs.conv_transpose1d(&self.weight, 0, 0, self.stride, 1, 1)?;
        ys.broadcast_add(&self.bias.reshape((1, self.out_channels, 1))?)
    }

    pub fn tensors(&self, prefix: &str, out: &mut Vec<(String, Tensor)>) {
        out.push((format!("{prefix}.weight"), self.weight.clone()));
        out.push((format!("{prefix}.bias"), self.bias.clone()));
    }
}

fn normalized_weight(g: &Tensor, v: &Tensor) -> Result<Tensor> {
    let norm = v.sqr()?.sum_keepdim((1, 2))?.sqrt()?;
    v.broadcast_mul(g)?.broadcast_div(&norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use std::collections::HashMap;

    fn dev() -> Device {
        Device::Cpu
    }

    fn plain_conv(kernel_size: usize, stride: usize, causal: bool) -> Result<StreamingConv1d> {
        let weight: Vec<f32> = (0..kernel_size).map(|i| 0.5 - 0.1 * i as f32).collect();
        let mut tensors = HashMap::new();
        tensors.insert(
            "weight".to_string(),
            Tensor::from_vec(weight, (1, 1, kernel_size), &dev())?,
        );
        tensors.insert("bias".to_string(), Tensor::from_vec(vec![0.25f32], 1, &dev())?);
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &dev());
        StreamingConv1d::new(1, 1, kernel_size, stride, causal, vb)
    }

    fn ramp(len: usize) -> Result<Tensor> {
        let data: Vec<f32> = (0..len).map(|i| (i as f32 * 0.37).sin()).collect();
        Tensor::from_vec(data, (1, 1, len), &dev())
    }

    #[test]
    fn test_frame_count_is_preserved_offline() -> Result<()> {
        let mut conv = plain_conv(5, 1, false)?;
        let y = conv.forward(&ramp(32)?)?;
        assert_eq!(y.dims(), &[1, 1, 32]);

        let mut strided = plain_conv(8, 4, false)?;
        let y = strided.forward(&ramp(32)?)?;
        assert_eq!(y.dims(), &[1, 1, 8]);
        Ok(())
    }

    #[test]
    fn test_causal_chunked_equals_one_shot() -> Result<()> {
        let signal = ramp(24)?;
        let mut one_shot = plain_conv(3, 1, true)?;
        let full = one_shot.forward(&signal)?.squeeze(0)?.squeeze(0)?.to_vec1::<f32>()?;

        let mut chunked = plain_conv(3, 1, true)?;
        let first = chunked.forward(&signal.narrow(2, 0, 10)?)?;
        let second = chunked.forward(&signal.narrow(2, 10, 14)?)?;
        let mut joined = first.squeeze(0)?.squeeze(0)?.to_vec1::<f32>()?;
        joined.extend(second.squeeze(0)?.squeeze(0)?.to_vec1::<f32>()?);

        assert_eq!(full.len(), joined.len());
        for (a, b) in full.iter().zip(joined.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_causal_strided_chunked_equals_one_shot() -> Result<()> {
        let signal = ramp(16)?;
        let mut one_shot = plain_conv(4, 2, true)?;
        let full = one_shot.forward(&signal)?.squeeze(0)?.squeeze(0)?.to_vec1::<f32>()?;

        let mut chunked = plain_conv(4, 2, true)?;
        let first = chunked.forward(&signal.narrow(2, 0, 8)?)?;
        let second = chunked.forward(&signal.narrow(2, 8, 8)?)?;
        let mut joined = first.squeeze(0)?.squeeze(0)?.to_vec1::<f32>()?;
        joined.extend(second.squeeze(0)?.squeeze(0)?.to_vec1::<f32>()?);

        assert_eq!(full.len(), joined.len());
        for (a, b) in full.iter().zip(joined.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_cache_resets_on_batch_change() -> Result<()> {
        let mut conv = plain_conv(3, 1, true)?;
        let single = Tensor::zeros((1, 1, 8), DType::F32, &dev())?;
        let double = Tensor::zeros((2, 1, 8), DType::F32, &dev())?;
        conv.forward(&single)?;
        // A different batch size must not try to concatenate the stale cache.
        let y = conv.forward(&double)?;
        assert_eq!(y.dims(), &[2, 1, 8]);
        Ok(())
    }

    #[test]
    fn test_weight_norm_fold_matches_decomposed_forward() -> Result<()> {
        let g = Tensor::from_vec(vec![2.0f32], (1, 1, 1), &dev())?;
        let v = Tensor::from_vec(vec![3.0f32, 4.0], (1, 1, 2), &dev())?;
        let mut tensors = HashMap::new();
        tensors.insert("weight_g".to_string(), g);
        tensors.insert("weight_v".to_string(), v);
        tensors.insert("bias".to_string(), Tensor::from_vec(vec![0.0f32], 1, &dev())?);
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &dev());
        let mut conv = StreamingConv1d::new(1, 1, 2, 1, false, vb)?;

        let x = ramp(12)?;
        let before = conv.forward(&x)?.squeeze(0)?.squeeze(0)?.to_vec1::<f32>()?;
        conv.remove_weight_norm()?;
        let after = conv.forward(&x)?.squeeze(0)?.squeeze(0)?.to_vec1::<f32>()?;
        for (a, b) in before.iter().zip(after.iter()) {
            assert!((a - b).abs() < 1e-6);
        }

        // ||v|| = 5, so the folded kernel is g * v / 5 = [1.2, 1.6].
        let mut collected = Vec::new();
        conv.tensors("conv", &mut collected);
        let folded = collected
            .iter()
            .find(|(name, _)| name == "conv.weight")
            .expect("folded weight present")
            .1
            .flatten_all()?
            .to_vec1::<f32>()?;
        assert!((folded[0] - 1.2).abs() < 1e-6);
        assert!((folded[1] - 1.6).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_upsample_is_exact_stride_multiple() -> Result<()> {
        let mut tensors = HashMap::new();
        tensors.insert(
            "weight".to_string(),
            Tensor::from_vec(vec![1.0f32, 0.5, 0.25], (1, 1, 3), &dev())?,
        );
        tensors.insert("bias".to_string(), Tensor::from_vec(vec![0.0f32], 1, &dev())?);
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &dev());
        let up = UpsampleConv1d::new(1, 1, 3, vb)?;
        let y = up.forward(&ramp(5)?)?;
        assert_eq!(y.dims(), &[1, 1, 15]);
        Ok(())
    }
}
