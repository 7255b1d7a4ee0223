//! Template hits to template features.
//!
//! Hits come from an external search; this module only arranges their coordinates into the
//! `[T, N, ...]` tensors the template stage consumes.
use crate::batch::{FeatureBatch, FeatureError, Result};
use crate::feats::pseudo_beta;
use crate::residue_constants::ATOM_TYPE_NUM;
use candle_core::{DType, Device, Tensor};

pub const NUM_TORSIONS: usize = 7;

/// One aligned template, already mapped onto the query residues.
#[derive(Clone, Debug)]
pub struct TemplateHit {
    pub name: String,
    pub aatype: Vec<u32>,
    pub all_atom_positions: Vec<[[f32; 3]; ATOM_TYPE_NUM]>,
    pub all_atom_mask: Vec<[f32; ATOM_TYPE_NUM]>,
    pub sum_probs: f32,
    /// Per-residue (sin, cos) of the seven torsions, when precomputed.
    pub torsion_angles_sin_cos: Option<Vec<[[f32; 2]; NUM_TORSIONS]>>,
    pub alt_torsion_angles_sin_cos: Option<Vec<[[f32; 2]; NUM_TORSIONS]>>,
    pub torsion_angles_mask: Option<Vec<[f32; NUM_TORSIONS]>>,
}

/// Stacked template tensors, template axis first.
#[derive(Clone, Debug)]
pub struct TemplateFeatures {
    pub template_aatype: Tensor,
    pub template_all_atom_positions: Tensor,
    pub template_all_atom_mask: Tensor,
    pub template_sum_probs: Tensor,
    pub template_mask: Tensor,
    pub template_pseudo_beta: Tensor,
    pub template_pseudo_beta_mask: Tensor,
    pub template_torsion_angles_sin_cos: Tensor,
    pub template_alt_torsion_angles_sin_cos: Tensor,
    pub template_torsion_angles_mask: Tensor,
}

impl TemplateFeatures {
    pub fn num_templates(&self) -> usize {
        self.template_aatype.dims()[0]
    }

    /// Adds every template tensor to `batch` with a batch axis and `n_recycle` iterations.
    pub fn insert_into(&self, batch: &mut FeatureBatch, n_recycle: usize) -> Result<()> {
        let named = [
            ("template_aatype", &self.template_aatype),
            ("template_all_atom_positions", &self.template_all_atom_positions),
            ("template_all_atom_mask", &self.template_all_atom_mask),
            ("template_sum_probs", &self.template_sum_probs),
            ("template_mask", &self.template_mask),
            ("template_pseudo_beta", &self.template_pseudo_beta),
            ("template_pseudo_beta_mask", &self.template_pseudo_beta_mask),
            ("template_torsion_angles_sin_cos", &self.template_torsion_angles_sin_cos),
            ("template_alt_torsion_angles_sin_cos", &self.template_alt_torsion_angles_sin_cos),
            ("template_torsion_angles_mask", &self.template_torsion_angles_mask),
        ];
        for (name, t) in named {
            batch.insert_sample(name, t, n_recycle)?;
        }
        Ok(())
    }
}

/// The zero-hit feature set: every tensor has a leading template axis of length 0.
pub fn empty_template_features(n_res: usize, device: &Device) -> Result<TemplateFeatures> {
    let f = |shape: &[usize]| Tensor::zeros(shape, DType::F32, device);
    Ok(TemplateFeatures {
        template_aatype: Tensor::zeros((0, n_res), DType::U32, device)?,
        template_all_atom_positions: f(&[0, n_res, ATOM_TYPE_NUM, 3])?,
        template_all_atom_mask: f(&[0, n_res, ATOM_TYPE_NUM])?,
        template_sum_probs: f(&[0, 1])?,
        template_mask: f(&[0])?,
        template_pseudo_beta: f(&[0, n_res, 3])?,
        template_pseudo_beta_mask: f(&[0, n_res])?,
        template_torsion_angles_sin_cos: f(&[0, n_res, NUM_TORSIONS, 2])?,
        template_alt_torsion_angles_sin_cos: f(&[0, n_res, NUM_TORSIONS, 2])?,
        template_torsion_angles_mask: f(&[0, n_res, NUM_TORSIONS])?,
    })
}

fn check_len(name: &str, expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(FeatureError::ResidueCountMismatch {
            name: name.to_string(),
            expected,
            got,
        });
    }
    Ok(())
}

/// Stacks `hits` into template features for a query of `n_res` residues.
pub fn make_template_features(hits: &[TemplateHit], n_res: usize, device: &Device) -> Result<TemplateFeatures> {
    if hits.is_empty() {
        tracing::info!("no template hits, using empty template features");
        return empty_template_features(n_res, device);
    }
    let t = hits.len();
    let mut aatype = Vec::with_capacity(t * n_res);
    let mut positions = Vec::with_capacity(t * n_res * ATOM_TYPE_NUM * 3);
    let mut mask = Vec::with_capacity(t * n_res * ATOM_TYPE_NUM);
    let mut sin_cos = Vec::with_capacity(t * n_res * NUM_TORSIONS * 2);
    let mut alt_sin_cos = Vec::with_capacity(t * n_res * NUM_TORSIONS * 2);
    let mut torsion_mask = Vec::with_capacity(t * n_res * NUM_TORSIONS);

    for hit in hits {
        check_len(&hit.name, n_res, hit.aatype.len())?;
        check_len(&hit.name, n_res, hit.all_atom_positions.len())?;
        check_len(&hit.name, n_res, hit.all_atom_mask.len())?;
        aatype.extend_from_slice(&hit.aatype);
        positions.extend(hit.all_atom_positions.iter().flatten().flatten().copied());
        mask.extend(hit.all_atom_mask.iter().flatten().copied());

        match (&hit.torsion_angles_sin_cos, &hit.alt_torsion_angles_sin_cos, &hit.torsion_angles_mask) {
            (Some(sc), Some(alt), Some(tm)) => {
                check_len(&hit.name, n_res, sc.len())?;
                check_len(&hit.name, n_res, alt.len())?;
                check_len(&hit.name, n_res, tm.len())?;
                sin_cos.extend(sc.iter().flatten().flatten().copied());
                alt_sin_cos.extend(alt.iter().flatten().flatten().copied());
                torsion_mask.extend(tm.iter().flatten().copied());
            }
            _ => {
                sin_cos.extend(std::iter::repeat(0f32).take(n_res * NUM_TORSIONS * 2));
                alt_sin_cos.extend(std::iter::repeat(0f32).take(n_res * NUM_TORSIONS * 2));
                torsion_mask.extend(std::iter::repeat(0f32).take(n_res * NUM_TORSIONS));
            }
        }
    }

    let template_aatype = Tensor::from_vec(aatype, (t, n_res), device)?;
    let template_all_atom_positions = Tensor::from_vec(positions, (t, n_res, ATOM_TYPE_NUM, 3), device)?;
    let template_all_atom_mask = Tensor::from_vec(mask, (t, n_res, ATOM_TYPE_NUM), device)?;
    let (pb, pb_mask) = pseudo_beta(
        &template_aatype,
        &template_all_atom_positions,
        Some(&template_all_atom_mask),
    )?;
    let template_pseudo_beta_mask = match pb_mask {
        Some(m) => m,
        None => Tensor::zeros((t, n_res), DType::F32, device)?,
    };
    let sum_probs: Vec<f32> = hits.iter().map(|h| h.sum_probs).collect();

    Ok(TemplateFeatures {
        template_aatype,
        template_all_atom_positions,
        template_all_atom_mask,
        template_sum_probs: Tensor::from_vec(sum_probs, (t, 1), device)?,
        template_mask: Tensor::ones(t, DType::F32, device)?,
        template_pseudo_beta: pb,
        template_pseudo_beta_mask,
        template_torsion_angles_sin_cos: Tensor::from_vec(sin_cos, (t, n_res, NUM_TORSIONS, 2), device)?,
        template_alt_torsion_angles_sin_cos: Tensor::from_vec(alt_sin_cos, (t, n_res, NUM_TORSIONS, 2), device)?,
        template_torsion_angles_mask: Tensor::from_vec(torsion_mask, (t, n_res, NUM_TORSIONS), device)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(n_res: usize) -> TemplateHit {
        TemplateHit {
            name: "1abc_A".to_string(),
            aatype: vec![7; n_res],
            all_atom_positions: vec![[[1.0, 2.0, 3.0]; ATOM_TYPE_NUM]; n_res],
            all_atom_mask: vec![[1.0; ATOM_TYPE_NUM]; n_res],
            sum_probs: 0.75,
            torsion_angles_sin_cos: None,
            alt_torsion_angles_sin_cos: None,
            torsion_angles_mask: None,
        }
    }

    #[test]
    fn test_zero_hits_give_empty_features() -> Result<()> {
        let feats = make_template_features(&[], 16, &Device::Cpu)?;
        assert_eq!(feats.num_templates(), 0);
        assert_eq!(feats.template_all_atom_positions.dims(), &[0, 16, 37, 3]);
        assert_eq!(feats.template_pseudo_beta.dims(), &[0, 16, 3]);
        assert_eq!(feats.template_torsion_angles_sin_cos.dims(), &[0, 16, 7, 2]);
        Ok(())
    }

    #[test]
    fn test_hits_are_stacked() -> Result<()> {
        let feats = make_template_features(&[hit(5), hit(5)], 5, &Device::Cpu)?;
        assert_eq!(feats.num_templates(), 2);
        assert_eq!(feats.template_pseudo_beta_mask.dims(), &[2, 5]);
        assert_eq!(feats.template_sum_probs.flatten_all()?.to_vec1::<f32>()?, vec![0.75, 0.75]);
        let mut batch = FeatureBatch::new();
        feats.insert_into(&mut batch, 2)?;
        assert_eq!(batch.get("template_aatype")?.dims(), &[1, 2, 5, 2]);
        Ok(())
    }

    #[test]
    fn test_length_mismatch_is_reported() {
        let res = make_template_features(&[hit(4)], 5, &Device::Cpu);
        assert!(matches!(res, Err(FeatureError::ResidueCountMismatch { expected: 5, got: 4, .. })));
    }
}
