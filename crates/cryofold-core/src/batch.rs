//! The feature batch handed to the model: a name → tensor map with a trailing recycling axis.
use crate::feats::DensityRegistration;
use candle_core::{DType, Device, Tensor, D};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FeatureError {
    #[error("missing feature `{0}`")]
    Missing(String),
    #[error("feature `{name}` has {got} residues, expected {expected}")]
    ResidueCountMismatch {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("recycling iteration {index} out of range ({count} available)")]
    RecycleOutOfRange { index: usize, count: usize },
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, FeatureError>;

#[derive(Clone, Debug, Default)]
pub struct FeatureBatch {
    feats: BTreeMap<String, Tensor>,
}

impl FeatureBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads every tensor of a safetensors file. Integer features are stored as `u32`.
    pub fn load<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self> {
        let raw: HashMap<String, Tensor> = candle_core::safetensors::load(path, device)?;
        let mut feats = BTreeMap::new();
        for (name, t) in raw {
            let t = match t.dtype() {
                DType::I64 | DType::U8 => t.to_dtype(DType::U32)?,
                DType::F64 | DType::F16 | DType::BF16 => t.to_dtype(DType::F32)?,
                _ => t,
            };
            feats.insert(name, t);
        }
        tracing::debug!(n_features = feats.len(), "loaded feature batch");
        Ok(Self { feats })
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let map: HashMap<String, Tensor> = self.feats.clone().into_iter().collect();
        candle_core::safetensors::save(&map, path)?;
        Ok(())
    }

    pub fn insert(&mut self, name: impl Into<String>, t: Tensor) -> Option<Tensor> {
        self.feats.insert(name.into(), t)
    }

    pub fn remove(&mut self, name: &str) -> Option<Tensor> {
        self.feats.remove(name)
    }

    pub fn get(&self, name: &str) -> Result<&Tensor> {
        self.feats
            .get(name)
            .ok_or_else(|| FeatureError::Missing(name.to_string()))
    }

    pub fn get_opt(&self, name: &str) -> Option<&Tensor> {
        self.feats.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.feats.contains_key(name)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.feats.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.feats.iter()
    }

    /// Length of the trailing recycling axis of `aatype`.
    pub fn num_recycles(&self) -> Result<usize> {
        Ok(self.get("aatype")?.dim(D::Minus1)?)
    }

    /// The features of recycling iteration `index`, with the trailing axis removed.
    pub fn recycle(&self, index: usize) -> Result<Self> {
        let count = self.num_recycles()?;
        if index >= count {
            return Err(FeatureError::RecycleOutOfRange { index, count });
        }
        let mut feats = BTreeMap::new();
        for (name, t) in self.feats.iter() {
            let r = t.rank();
            feats.insert(name.clone(), t.narrow(r - 1, index, 1)?.squeeze(r - 1)?);
        }
        Ok(Self { feats })
    }

    /// Adds a per-sample feature by inserting the batch axis and repeating it over `n_recycle`.
    pub fn insert_sample(&mut self, name: impl Into<String>, t: &Tensor, n_recycle: usize) -> Result<()> {
        let t = t.unsqueeze(0)?;
        let r = t.rank();
        let t = t.unsqueeze(r)?;
        let mut reps = vec![1; r];
        reps.push(n_recycle);
        self.insert(name, t.repeat(reps)?);
        Ok(())
    }

    pub fn to_device(&self, device: &Device) -> Result<Self> {
        let mut feats = BTreeMap::new();
        for (name, t) in self.feats.iter() {
            feats.insert(name.clone(), t.to_device(device)?);
        }
        Ok(Self { feats })
    }

    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.get("aatype")?.dim(0)?)
    }

    pub fn n_res(&self) -> Result<usize> {
        Ok(self.get("aatype")?.dim(1)?)
    }

    /// Checks that residue-indexed features of a single iteration agree on `N`.
    pub fn check_residue_counts(&self) -> Result<()> {
        let expected = self.n_res()?;
        let per_residue = [
            ("target_feat", 1),
            ("residue_index", 1),
            ("seq_mask", 1),
            ("msa_feat", 2),
            ("msa_mask", 2),
        ];
        for (name, axis) in per_residue {
            if let Some(t) = self.get_opt(name) {
                let got = t.dim(axis)?;
                if got != expected {
                    return Err(FeatureError::ResidueCountMismatch {
                        name: name.to_string(),
                        expected,
                        got,
                    });
                }
            }
        }
        Ok(())
    }

    /// Physical-to-voxel registration of a single-iteration batch.
    ///
    /// The normalising size is `cryoem_orisize` when present, otherwise the density grid
    /// dimensions; `cryoem_cropidx` is added to the offset when present.
    pub fn density_registration(&self) -> Result<DensityRegistration> {
        let (b, w, h, l) = self.get("cryoem_density")?.dims4()?;
        let offset = self.get("cryoem_offset")?.to_dtype(DType::F32)?;
        let offset = match self.get_opt("cryoem_cropidx") {
            Some(crop) => (offset + crop.to_dtype(DType::F32)?)?,
            None => offset,
        };
        let size = match self.get_opt("cryoem_orisize") {
            Some(size) => size.to_dtype(DType::F32)?,
            None => Tensor::new(&[w as f32, h as f32, l as f32], offset.device())?
                .unsqueeze(0)?
                .repeat((b, 1))?,
        };
        Ok(DensityRegistration::new(
            &offset,
            self.get("cryoem_apix")?,
            &size,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(n_recycle: usize) -> Result<FeatureBatch> {
        let device = Device::Cpu;
        let mut b = FeatureBatch::new();
        b.insert_sample("aatype", &Tensor::new(&[0u32, 5, 7], &device)?, n_recycle)?;
        b.insert_sample("seq_mask", &Tensor::ones(3, DType::F32, &device)?, n_recycle)?;
        Ok(b)
    }

    #[test]
    fn test_recycle_slices_trailing_axis() -> Result<()> {
        let b = batch(3)?;
        assert_eq!(b.get("aatype")?.dims(), &[1, 3, 3]);
        assert_eq!(b.num_recycles()?, 3);
        let it = b.recycle(2)?;
        assert_eq!(it.get("aatype")?.dims(), &[1, 3]);
        assert_eq!(it.get("aatype")?.to_vec2::<u32>()?, vec![vec![0, 5, 7]]);
        assert!(matches!(
            b.recycle(3),
            Err(FeatureError::RecycleOutOfRange { index: 3, count: 3 })
        ));
        Ok(())
    }

    #[test]
    fn test_missing_feature_is_named() -> Result<()> {
        let b = batch(1)?;
        match b.get("msa_feat") {
            Err(FeatureError::Missing(name)) => assert_eq!(name, "msa_feat"),
            other => panic!("unexpected {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_residue_count_mismatch() -> Result<()> {
        let mut b = batch(1)?.recycle(0)?;
        b.insert("residue_index", Tensor::zeros((1, 4), DType::F32, &Device::Cpu)?);
        assert!(matches!(
            b.check_residue_counts(),
            Err(FeatureError::ResidueCountMismatch { got: 4, .. })
        ));
        Ok(())
    }

    #[test]
    fn test_density_registration_defaults_to_grid_size() -> Result<()> {
        let device = Device::Cpu;
        let mut b = FeatureBatch::new();
        b.insert("cryoem_density", Tensor::zeros((1, 8, 8, 4), DType::F32, &device)?);
        b.insert("cryoem_offset", Tensor::zeros((1, 3), DType::F32, &device)?);
        b.insert("cryoem_apix", Tensor::ones(1, DType::F32, &device)?);
        let reg = b.density_registration()?;
        assert_eq!(reg.size.flatten_all()?.to_vec1::<f32>()?, vec![8.0, 8.0, 4.0]);
        Ok(())
    }

    #[test]
    fn test_density_registration_rejects_unsliced_density() -> Result<()> {
        let device = Device::Cpu;
        let mut b = FeatureBatch::new();
        // Still carries the recycling axis.
        b.insert("cryoem_density", Tensor::zeros((1, 8, 8, 4, 2), DType::F32, &device)?);
        b.insert("cryoem_offset", Tensor::zeros((1, 3), DType::F32, &device)?);
        b.insert("cryoem_apix", Tensor::ones(1, DType::F32, &device)?);
        assert!(matches!(b.density_registration(), Err(FeatureError::Candle(_))));
        b.insert("cryoem_density", Tensor::zeros((8, 8), DType::F32, &device)?);
        assert!(matches!(b.density_registration(), Err(FeatureError::Candle(_))));
        Ok(())
    }
}
