//! Latent statistics of a trained variational model.
//!
//! Loaded once from the checkpoint tensors `latent_mean`, `latent_pca` and
//! `fidelity`, read-only afterwards, and embedded verbatim into the packaged
//! artifact.

use candle_core::{bail, DType, Result, Tensor};
use candle_nn::VarBuilder;

/// Mean, orthonormal projection and cumulative explained-variance curve of
/// the latent space.
#[derive(Debug, Clone)]
pub struct LatentStatistics {
    /// `(size,)` per-channel latent mean.
    pub mean: Tensor,
    /// `(size, size)` orthonormal projection, rows by descending variance.
    pub pca: Tensor,
    /// `(size,)` cumulative explained variance, non-decreasing in [0, 1].
    pub fidelity: Tensor,
}

impl LatentStatistics {
    /// Load statistics from a checkpoint, or synthesize neutral ones
    /// (identity projection, zero mean, linear ramp) when the checkpoint
    /// carries none.
    pub fn load(vb: &VarBuilder, size: usize) -> Result<Self> {
        let stats = if vb.contains_tensor("latent_pca") {
            Self {
                mean: vb.get(size, "latent_mean")?,
                pca: vb.get((size, size), "latent_pca")?,
                fidelity: vb.get(size, "fidelity")?,
            }
        } else {
            let mut identity = vec![0f32; size * size];
            for i in 0..size {
                identity[i * size + i] = 1.0;
            }
            let ramp: Vec<f32> = (0..size).map(|i| (i + 1) as f32 / size as f32).collect();
            let device = vb.device();
            Self {
                mean: Tensor::zeros(size, DType::F32, device)?,
                pca: Tensor::from_vec(identity, (size, size), device)?,
                fidelity: Tensor::from_vec(ramp, size, device)?,
            }
        };
        stats.check(size)?;
        Ok(stats)
    }

    fn check(&self, size: usize) -> Result<()> {
        let curve = self.fidelity_curve()?;
        if curve.len() != size {
            bail!("fidelity curve has {} entries, expected {size}", curve.len());
        }
        for pair in curve.windows(2) {
            if pair[1] < pair[0] - 1e-6 {
                bail!("fidelity curve is not monotonically non-decreasing");
            }
        }
        if curve.iter().any(|&v| !(-1e-6..=1.0 + 1e-6).contains(&v)) {
            bail!("fidelity curve leaves [0, 1]");
        }
        Ok(())
    }

    pub fn fidelity_curve(&self) -> Result<Vec<f32>> {
        self.fidelity.to_vec1::<f32>()
    }

    pub fn tensors(&self, out: &mut Vec<(String, Tensor)>) {
        out.push(("latent_mean".to_string(), self.mean.clone()));
        out.push(("latent_pca".to_string(), self.pca.clone()));
        out.push(("fidelity".to_string(), self.fidelity.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use std::collections::HashMap;

    #[test]
    fn test_synthesized_defaults() -> Result<()> {
        let device = Device::Cpu;
        let vb = VarBuilder::from_tensors(HashMap::new(), DType::F32, &device);
        let stats = LatentStatistics::load(&vb, 4)?;
        // identity projection
        let pca = stats.pca.to_vec2::<f32>()?;
        for (i, row) in pca.iter().enumerate() {
            for (j, &v) in row.iter().enumerate() {
                assert_eq!(v, if i == j { 1.0 } else { 0.0 });
            }
        }
        // zero mean, linear ramp ending at 1
        assert_eq!(stats.mean.to_vec1::<f32>()?, vec![0.0; 4]);
        let curve = stats.fidelity_curve()?;
        assert_eq!(curve, vec![0.25, 0.5, 0.75, 1.0]);
        Ok(())
    }

    #[test]
    fn test_checkpoint_tensors_win_over_defaults() -> Result<()> {
        let device = Device::Cpu;
        let mut tensors = HashMap::new();
        tensors.insert("latent_mean".to_string(), Tensor::new(&[1.0f32, 2.0], &device).unwrap());
        tensors.insert(
            "latent_pca".to_string(),
            Tensor::new(&[[0.0f32, 1.0], [1.0, 0.0]], &device).unwrap(),
        );
        tensors.insert("fidelity".to_string(), Tensor::new(&[0.7f32, 1.0], &device).unwrap());
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &device);
        let stats = LatentStatistics::load(&vb, 2)?;
        assert_eq!(stats.mean.to_vec1::<f32>()?, vec![1.0, 2.0]);
        assert_eq!(stats.fidelity_curve()?, vec![0.7, 1.0]);
        Ok(())
    }

    #[test]
    fn test_decreasing_curve_is_rejected() {
        let device = Device::Cpu;
        let mut tensors = HashMap::new();
        tensors.insert("latent_mean".to_string(), Tensor::zeros(2, DType::F32, &device).unwrap());
        tensors.insert(
            "latent_pca".to_string(),
            Tensor::new(&[[1.0f32, 0.0], [0.0, 1.0]], &device).unwrap(),
        );
        tensors.insert("fidelity".to_string(), Tensor::new(&[0.9f32, 0.4], &device).unwrap());
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &device);
        assert!(LatentStatistics::load(&vb, 2).is_err());
    }
}
