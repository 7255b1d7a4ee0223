//! cryofold-test-data
//!
//! Deterministic synthetic inputs for CryoFold tests.
//!
//! [`SyntheticBatch`] builds a complete feature batch (sequence, MSA, extra MSA, one or more
//! templates, a density map and ground truth) from a seed. Coordinates are real residue
//! geometry placed along a helix, and the density is a sum of Gaussians at the Cα positions.
//!
//! ```ignore
//! use cryofold_test_data::SyntheticBatch;
//! let batch = SyntheticBatch::default().seed(7).build(&Device::Cpu)?;
//! let (path, _handle) = cryofold_test_data::write_temp(&batch)?;
//! ```
use candle_core::{DType, Device, Tensor};
use candle_nn::encoding::one_hot;
use cryofold_core::batch::Result;
use cryofold_core::feats::{
    atom14_to_atom37, frames_and_literature_positions_to_atom14_pos, pseudo_beta,
    torsion_angles_to_frames, ResidueTables,
};
use cryofold_core::residue_constants::{ResidueConstants, RESTYPE_NUM};
use cryofold_core::rigid::Rigid;
use cryofold_core::templates::empty_template_features;
use cryofold_core::FeatureBatch;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use tempfile::{Builder, NamedTempFile};

/// Label of density voxels that are not near any residue.
pub const BACKGROUND_LABEL: u32 = 23;

#[derive(Clone, Debug)]
pub struct SyntheticBatch {
    pub n_res: usize,
    pub n_seq: usize,
    pub n_extra_seq: usize,
    pub n_templates: usize,
    pub grid: usize,
    pub n_recycle: usize,
    pub seed: u64,
    pub with_density_mask: bool,
}

impl Default for SyntheticBatch {
    fn default() -> Self {
        Self {
            n_res: 16,
            n_seq: 8,
            n_extra_seq: 8,
            n_templates: 1,
            grid: 32,
            n_recycle: 1,
            seed: 42,
            with_density_mask: true,
        }
    }
}

impl SyntheticBatch {
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn n_recycle(mut self, n_recycle: usize) -> Self {
        self.n_recycle = n_recycle;
        self
    }

    pub fn n_templates(mut self, n_templates: usize) -> Self {
        self.n_templates = n_templates;
        self
    }

    pub fn with_density_mask(mut self, with_mask: bool) -> Self {
        self.with_density_mask = with_mask;
        self
    }

    pub fn build(&self, device: &Device) -> Result<FeatureBatch> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let n = self.n_res;
        let r = self.n_recycle;
        let tables = ResidueTables::new(device)?;
        let mut batch = FeatureBatch::new();

        let aatype_v: Vec<u32> = (0..n).map(|_| rng.gen_range(0..RESTYPE_NUM as u32)).collect();
        let aatype = Tensor::new(aatype_v.as_slice(), device)?;
        batch.insert_sample("aatype", &aatype, r)?;
        let target_feat = one_hot(aatype.clone(), 22, 1f32, 0f32)?;
        batch.insert_sample("target_feat", &target_feat, r)?;
        let residue_index: Vec<u32> = (0..n as u32).collect();
        batch.insert_sample("residue_index", &Tensor::new(residue_index.as_slice(), device)?, r)?;
        batch.insert_sample("asym_id", &Tensor::zeros(n, DType::U32, device)?, r)?;
        batch.insert_sample("seq_mask", &Tensor::ones(n, DType::F32, device)?, r)?;
        let sstype: Vec<u32> = (0..n).map(|_| rng.gen_range(0..3)).collect();
        batch.insert_sample("sstype", &Tensor::new(sstype.as_slice(), device)?, r)?;
        batch.insert_sample("resolution", &Tensor::new(&[3.0f32], device)?, r)?;

        self.insert_msa(&mut rng, &aatype_v, &mut batch, device)?;

        // Ground-truth structure: residues along a helix through the centre of the box.
        let (gt37, alpha) = self.helix_structure(&mut rng, &aatype, &tables, device)?;
        let atom37_mask = tables.atom37_exists(&aatype)?;
        batch.insert_sample("all_atom_positions", &gt37, r)?;
        batch.insert_sample("all_atom_mask", &atom37_mask, r)?;
        batch.insert_sample("atom14_gt_exists", &tables.atom14_exists(&aatype)?, r)?;
        let chi = alpha.narrow(1, 3, 4)?;
        batch.insert_sample("chi_angles_sin_cos", &chi, r)?;
        let chi_mask = ResidueTables::lookup(&ResidueConstants::new().chi_angles_mask_tensor(device)?, &aatype)?;
        batch.insert_sample("chi_mask", &chi_mask, r)?;

        self.insert_templates(&mut rng, &aatype, &gt37, &atom37_mask, &alpha, &mut batch)?;
        self.insert_density(&aatype_v, &gt37, &mut batch, device)?;

        let reg = batch.recycle(0)?.density_registration()?;
        let ca = gt37.narrow(1, 1, 1)?.squeeze(1)?.unsqueeze(0)?;
        let normed = reg.to_normed_ca(&ca)?.squeeze(0)?;
        batch.insert_sample("normed_ca_positions", &normed, r)?;
        Ok(batch)
    }

    fn insert_msa(
        &self,
        rng: &mut StdRng,
        aatype: &[u32],
        batch: &mut FeatureBatch,
        device: &Device,
    ) -> Result<()> {
        let (n, s, e, r) = (self.n_res, self.n_seq, self.n_extra_seq, self.n_recycle);
        let mut msa = Vec::with_capacity(s * n);
        for row in 0..s {
            for &aa in aatype {
                let mutate = row > 0 && rng.gen::<f32>() < 0.3;
                msa.push(if mutate { rng.gen_range(0..21) } else { aa });
            }
        }
        let mut msa_feat = Vec::with_capacity(s * n * 49);
        for &m in msa.iter() {
            let mut f = [0f32; 49];
            f[m as usize] = 1.0;
            let has_del = rng.gen::<f32>() < 0.1;
            f[23] = if has_del { 1.0 } else { 0.0 };
            f[24] = if has_del { rng.gen::<f32>() } else { 0.0 };
            f[25 + m as usize] = 1.0;
            f[48] = f[24];
            msa_feat.extend(f);
        }
        batch.insert_sample("msa_feat", &Tensor::from_vec(msa_feat, (s, n, 49), device)?, r)?;
        batch.insert_sample("msa_mask", &Tensor::ones((s, n), DType::F32, device)?, r)?;
        batch.insert_sample("true_msa", &Tensor::from_vec(msa, (s, n), device)?, r)?;
        let bert: Vec<f32> = (0..s * n)
            .map(|_| if rng.gen::<f32>() < 0.15 { 1.0 } else { 0.0 })
            .collect();
        batch.insert_sample("bert_mask", &Tensor::from_vec(bert, (s, n), device)?, r)?;

        let extra: Vec<u32> = (0..e * n).map(|_| rng.gen_range(0..23)).collect();
        let has_del: Vec<f32> = (0..e * n)
            .map(|_| if rng.gen::<f32>() < 0.1 { 1.0 } else { 0.0 })
            .collect();
        let del_val: Vec<f32> = has_del.iter().map(|&h| h * 0.5).collect();
        batch.insert_sample("extra_msa", &Tensor::from_vec(extra, (e, n), device)?, r)?;
        batch.insert_sample("extra_has_deletion", &Tensor::from_vec(has_del, (e, n), device)?, r)?;
        batch.insert_sample("extra_deletion_value", &Tensor::from_vec(del_val, (e, n), device)?, r)?;
        batch.insert_sample("extra_msa_mask", &Tensor::ones((e, n), DType::F32, device)?, r)?;
        Ok(())
    }

    /// Atom37 coordinates `[N, 37, 3]` and the torsions `[N, 7, 2]` used to build them.
    fn helix_structure(
        &self,
        rng: &mut StdRng,
        aatype: &Tensor,
        tables: &ResidueTables,
        device: &Device,
    ) -> Result<(Tensor, Tensor)> {
        let n = self.n_res;
        let centre = self.grid as f32 / 2.0;
        let mut t7 = Vec::with_capacity(n * 7);
        for i in 0..n {
            let theta = i as f32 * 100f32.to_radians();
            let half = theta / 2.0;
            t7.extend([
                half.cos(),
                0.0,
                0.0,
                half.sin(),
                centre + 2.3 * theta.cos(),
                centre + 2.3 * theta.sin(),
                centre - 0.75 * n as f32 + 1.5 * i as f32,
            ]);
        }
        let frames = Rigid::from_tensor_7(&Tensor::from_vec(t7, (n, 7), device)?, true)?;
        let mut alpha = Vec::with_capacity(n * 14);
        for _ in 0..n * 7 {
            let a: f32 = rng.gen_range(-std::f32::consts::PI..std::f32::consts::PI);
            alpha.extend([a.sin(), a.cos()]);
        }
        let alpha = Tensor::from_vec(alpha, (n, 7, 2), device)?;
        let all_frames = torsion_angles_to_frames(&frames, &alpha, aatype, tables)?;
        let atom14 = frames_and_literature_positions_to_atom14_pos(&all_frames, aatype, tables)?;
        Ok((atom14_to_atom37(&atom14, aatype, tables)?, alpha))
    }

    fn insert_templates(
        &self,
        rng: &mut StdRng,
        aatype: &Tensor,
        gt37: &Tensor,
        atom37_mask: &Tensor,
        alpha: &Tensor,
        batch: &mut FeatureBatch,
    ) -> Result<()> {
        let (t, n, r) = (self.n_templates, self.n_res, self.n_recycle);
        let device = gt37.device();
        if t == 0 {
            return empty_template_features(n, device)?.insert_into(batch, r);
        }
        let mut positions = Vec::with_capacity(t);
        for _ in 0..t {
            let noise: Vec<f32> = (0..n * 37 * 3).map(|_| rng.gen_range(-0.5..0.5)).collect();
            let noise = Tensor::from_vec(noise, (n, 37, 3), device)?;
            positions.push((gt37 + noise)?.broadcast_mul(&atom37_mask.unsqueeze(2)?)?);
        }
        let positions = Tensor::stack(&positions, 0)?;
        let aatype_t = aatype.unsqueeze(0)?.repeat((t, 1))?;
        let mask_t = atom37_mask.unsqueeze(0)?.repeat((t, 1, 1))?;
        let (pb, pb_mask) = pseudo_beta(&aatype_t, &positions, Some(&mask_t))?;
        let pb_mask = match pb_mask {
            Some(m) => m,
            None => Tensor::ones((t, n), DType::F32, device)?,
        };
        let alpha_t = alpha.unsqueeze(0)?.repeat((t, 1, 1, 1))?;

        batch.insert_sample("template_aatype", &aatype_t, r)?;
        batch.insert_sample("template_all_atom_positions", &positions, r)?;
        batch.insert_sample("template_all_atom_mask", &mask_t, r)?;
        batch.insert_sample("template_mask", &Tensor::ones(t, DType::F32, device)?, r)?;
        batch.insert_sample("template_sum_probs", &Tensor::ones((t, 1), DType::F32, device)?, r)?;
        batch.insert_sample("template_pseudo_beta", &pb, r)?;
        batch.insert_sample("template_pseudo_beta_mask", &pb_mask, r)?;
        batch.insert_sample("template_torsion_angles_sin_cos", &alpha_t, r)?;
        batch.insert_sample("template_alt_torsion_angles_sin_cos", &alpha_t, r)?;
        batch.insert_sample("template_torsion_angles_mask", &Tensor::ones((t, n, 7), DType::F32, device)?, r)?;
        Ok(())
    }

    fn insert_density(
        &self,
        aatype: &[u32],
        gt37: &Tensor,
        batch: &mut FeatureBatch,
        device: &Device,
    ) -> Result<()> {
        let g = self.grid;
        let r = self.n_recycle;
        let ca: Vec<Vec<f32>> = gt37.narrow(1, 1, 1)?.squeeze(1)?.to_vec2::<f32>()?;
        let mut density = vec![0f32; g * g * g];
        let mut labels = vec![BACKGROUND_LABEL as f32; g * g * g];
        for x in 0..g {
            for y in 0..g {
                for z in 0..g {
                    let idx = (x * g + y) * g + z;
                    let mut nearest = f32::MAX;
                    for (res, p) in ca.iter().enumerate() {
                        let d2 = (x as f32 - p[0]).powi(2) + (y as f32 - p[1]).powi(2) + (z as f32 - p[2]).powi(2);
                        density[idx] += (-d2 / 4.0).exp();
                        if d2 < 4.0 && d2 < nearest {
                            nearest = d2;
                            labels[idx] = aatype[res] as f32;
                        }
                    }
                }
            }
        }
        batch.insert_sample("cryoem_density", &Tensor::from_vec(density, (g, g, g), device)?, r)?;
        batch.insert_sample("cryoem_seglabel", &Tensor::from_vec(labels, (g, g, g), device)?, r)?;
        if self.with_density_mask {
            batch.insert_sample("cryoem_mask", &Tensor::ones((g, g, g), DType::F32, device)?, r)?;
        }
        batch.insert_sample("cryoem_offset", &Tensor::zeros(3, DType::F32, device)?, r)?;
        batch.insert_sample("cryoem_apix", &Tensor::new(&[1.0f32], device)?.squeeze(0)?, r)?;
        Ok(())
    }
}

/// Writes `batch` to a temporary safetensors file.
///
/// The returned handle keeps the file alive; drop it to delete the file.
pub fn write_temp(batch: &FeatureBatch) -> std::io::Result<(PathBuf, NamedTempFile)> {
    let temp = temp_file("safetensors")?;
    let path = temp.path().to_path_buf();
    batch
        .save(&path)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    Ok((path, temp))
}

/// An empty named temp file with the given suffix.
pub fn temp_file(suffix: &str) -> std::io::Result<NamedTempFile> {
    Builder::new().suffix(&format!(".{suffix}")).tempfile()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_is_deterministic() -> Result<()> {
        let device = Device::Cpu;
        let a = SyntheticBatch::default().build(&device)?;
        let b = SyntheticBatch::default().build(&device)?;
        let pa = a.get("msa_feat")?.flatten_all()?.to_vec1::<f32>()?;
        let pb = b.get("msa_feat")?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(pa, pb);
        assert_eq!(a.get("cryoem_density")?.dims(), &[1, 32, 32, 32, 1]);
        assert_eq!(a.get("all_atom_positions")?.dims(), &[1, 16, 37, 3, 1]);
        Ok(())
    }

    #[test]
    fn test_target_feat_encodes_aatype() -> Result<()> {
        let batch = SyntheticBatch::default().build(&Device::Cpu)?.recycle(0)?;
        let target_feat = batch.get("target_feat")?;
        assert_eq!(target_feat.dims(), &[1, 16, 22]);
        let aatype = batch.get("aatype")?.flatten_all()?.to_vec1::<u32>()?;
        let rows = target_feat.squeeze(0)?.to_vec2::<f32>()?;
        for (row, aa) in rows.iter().zip(aatype) {
            assert_eq!(row.iter().sum::<f32>(), 1.0);
            assert_eq!(row[aa as usize], 1.0);
        }
        Ok(())
    }

    #[test]
    fn test_normed_ca_inside_unit_cube() -> Result<()> {
        let batch = SyntheticBatch::default().build(&Device::Cpu)?;
        let normed = batch.get("normed_ca_positions")?.flatten_all()?.to_vec1::<f32>()?;
        assert!(normed.iter().all(|&x| (0.0..1.0).contains(&x)));
        Ok(())
    }

    #[test]
    fn test_round_trip_through_temp_file() -> Result<()> {
        let batch = SyntheticBatch::default().n_recycle(2).build(&Device::Cpu)?;
        let (path, _handle) = write_temp(&batch).expect("temp file");
        let loaded = FeatureBatch::load(&path, &Device::Cpu)?;
        assert_eq!(loaded.num_recycles()?, 2);
        assert_eq!(loaded.keys().count(), batch.keys().count());
        Ok(())
    }
}
