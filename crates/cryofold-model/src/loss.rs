//! Training objective: a weighted sum of structure, confidence, classification and density
//! terms.
use crate::config::LossConfig;
use crate::error::Result;
use crate::matcher::Assignment;
use crate::model::ModelOutputs;
use candle_core::{DType, Device, Tensor, D};
use cryofold_core::feats::{backbone_frames_from_atom37, pseudo_beta, ResidueTables};
use cryofold_core::metrics::lddt_ca;
use cryofold_core::residue_constants::{CA_ATOM, C_ATOM, N_ATOM};
use cryofold_core::{FeatureBatch, Rigid};
use itertools::Itertools;
use std::collections::BTreeMap;

/// `-log softmax(logits)[label]` over the last axis; `labels` has the leading shape of
/// `logits`.
pub fn softmax_cross_entropy(logits: &Tensor, labels: &Tensor) -> candle_core::Result<Tensor> {
    let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    let idx = labels.to_dtype(DType::U32)?.unsqueeze(labels.rank())?.contiguous()?;
    log_probs.contiguous()?.gather(&idx, D::Minus1)?.squeeze(D::Minus1)?.neg()
}

/// Binary cross-entropy of `logits` against `labels` in `[0, 1]`.
pub fn sigmoid_cross_entropy(logits: &Tensor, labels: &Tensor) -> candle_core::Result<Tensor> {
    let log_p = log_sigmoid(logits)?;
    let log_not_p = log_sigmoid(&logits.neg()?)?;
    ((labels * log_p)? + (labels.affine(-1.0, 1.0)? * log_not_p)?)?.neg()
}

fn log_sigmoid(x: &Tensor) -> candle_core::Result<Tensor> {
    // min(x, 0) - log(1 + exp(-|x|))
    let softplus = x.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    x.minimum(0.0)? - softplus
}

/// `Σ value·mask / (eps + Σ mask)` per batch element, `[B]`.
fn masked_mean(value: &Tensor, mask: &Tensor, eps: f64) -> candle_core::Result<Tensor> {
    let mask = mask.to_dtype(value.dtype())?.broadcast_as(value.shape())?;
    let num = (value * &mask)?.flatten_from(1)?.sum(1)?;
    let den = mask.flatten_from(1)?.sum(1)?.affine(1.0, eps)?;
    num / den
}

/// `[B]` indicator of resolutions inside `[min, max]`; all ones without a resolution feature.
fn resolution_gate(batch: &FeatureBatch, min: f64, max: f64, b: usize, device: &Device) -> candle_core::Result<Tensor> {
    match batch.get_opt("resolution") {
        Some(r) => {
            let r = r.to_dtype(DType::F32)?.reshape(b)?;
            r.ge(min)?.to_dtype(DType::F32)? * r.le(max)?.to_dtype(DType::F32)?
        }
        None => Tensor::ones(b, DType::F32, device),
    }
}

/// Number of `edges` strictly below each value, as `u32` bin labels.
fn bin_labels(sq_dist: &Tensor, edges: &[f32]) -> candle_core::Result<Tensor> {
    let edges = Tensor::new(edges, sq_dist.device())?;
    sq_dist
        .unsqueeze(sq_dist.rank())?
        .broadcast_gt(&edges)?
        .to_dtype(DType::F32)?
        .sum(D::Minus1)?
        .to_dtype(DType::U32)
}

fn pair_mask(mask: &Tensor) -> candle_core::Result<Tensor> {
    mask.unsqueeze(2)?.broadcast_mul(&mask.unsqueeze(1)?)
}

fn atom_mask(all_atom_mask: &Tensor, atom: usize) -> candle_core::Result<Tensor> {
    all_atom_mask.narrow(D::Minus1, atom, 1)?.squeeze(D::Minus1)?.to_dtype(DType::F32)
}

/// Pairwise distance-bin cross-entropy against pseudo-β distances.
pub fn distogram_loss(
    logits: &Tensor,
    pseudo_beta: &Tensor,
    pseudo_beta_mask: &Tensor,
    min_bin: f64,
    max_bin: f64,
    eps: f64,
) -> candle_core::Result<Tensor> {
    let no_bins = logits.dim(D::Minus1)?;
    let step = (max_bin - min_bin) / (no_bins.saturating_sub(2).max(1)) as f64;
    let edges: Vec<f32> = (0..no_bins - 1)
        .map(|i| (min_bin + step * i as f64).powi(2) as f32)
        .collect();
    let diff = pseudo_beta.unsqueeze(2)?.broadcast_sub(&pseudo_beta.unsqueeze(1)?)?;
    let sq = diff.sqr()?.sum(D::Minus1)?;
    let errors = softmax_cross_entropy(logits, &bin_labels(&sq, &edges)?)?;
    masked_mean(&errors, &pair_mask(pseudo_beta_mask)?, eps)?.mean_all()
}

/// Residue-type reconstruction of masked MSA positions.
pub fn masked_msa_loss(logits: &Tensor, true_msa: &Tensor, bert_mask: &Tensor, eps: f64) -> candle_core::Result<Tensor> {
    let errors = softmax_cross_entropy(logits, true_msa)?;
    masked_mean(&errors, bert_mask, eps)?.mean_all()
}

/// Frame aligned point error `[B]` of positions expressed in every frame.
///
/// Frames have batch shape `[B, N]`, positions are `[B, M, 3]`.
#[allow(clippy::too_many_arguments)]
pub fn compute_fape(
    pred_frames: &Rigid,
    target_frames: &Rigid,
    frames_mask: &Tensor,
    pred_positions: &Tensor,
    target_positions: &Tensor,
    positions_mask: &Tensor,
    clamp_distance: f64,
    length_scale: f64,
    eps: f64,
) -> candle_core::Result<Tensor> {
    // [B, N, M, 3]
    let local_pred = pred_frames.unsqueeze(2)?.invert_apply(&pred_positions.unsqueeze(1)?)?;
    let local_target = target_frames.unsqueeze(2)?.invert_apply(&target_positions.unsqueeze(1)?)?;
    let dist = (local_pred - local_target)?
        .sqr()?
        .sum(D::Minus1)?
        .affine(1.0, eps)?
        .sqrt()?
        .minimum(clamp_distance)?;
    let normed = (dist / length_scale)?
        .broadcast_mul(&frames_mask.unsqueeze(2)?)?
        .broadcast_mul(&positions_mask.unsqueeze(1)?)?;
    let per_frame = normed
        .sum(D::Minus1)?
        .broadcast_div(&frames_mask.sum_keepdim(D::Minus1)?.affine(1.0, eps)?)?;
    per_frame
        .sum(D::Minus1)?
        .broadcast_div(&positions_mask.sum(D::Minus1)?.affine(1.0, eps)?)
}

/// Chi-angle error with π-periodic side chains folded, plus a penalty on unnormalised angle
/// norms away from one.
#[allow(clippy::too_many_arguments)]
pub fn supervised_chi_loss(
    angles: &Tensor,
    unnormalized_angles: &Tensor,
    aatype: &Tensor,
    seq_mask: &Tensor,
    chi_mask: &Tensor,
    chi_angles_sin_cos: &Tensor,
    tables: &ResidueTables,
    chi_weight: f64,
    angle_norm_weight: f64,
    eps: f64,
) -> candle_core::Result<Tensor> {
    // [L, B, N, 4, 2]
    let pred = angles.narrow(3, 3, 4)?;
    let truth = chi_angles_sin_cos.to_dtype(DType::F32)?.unsqueeze(0)?;
    let shift = ResidueTables::lookup(&tables.chi_pi_periodic, aatype)?
        .affine(-2.0, 1.0)?
        .unsqueeze(3)?
        .unsqueeze(0)?;
    let truth_shifted = truth.broadcast_mul(&shift)?;
    let sq = truth.broadcast_sub(&pred)?.sqr()?.sum(D::Minus1)?;
    let sq_shifted = truth_shifted.broadcast_sub(&pred)?.sqr()?.sum(D::Minus1)?;
    let sq = sq.minimum(&sq_shifted)?;
    let chi_mask = chi_mask.to_dtype(DType::F32)?.unsqueeze(0)?;
    let chi_loss = masked_mean(&sq.flatten_to(1)?, &chi_mask.broadcast_as(sq.shape())?.flatten_to(1)?, eps)?;

    let norm = unnormalized_angles.sqr()?.sum(D::Minus1)?.affine(1.0, eps)?.sqrt()?;
    let norm_error = norm.affine(1.0, -1.0)?.abs()?;
    let seq_mask = seq_mask
        .to_dtype(DType::F32)?
        .unsqueeze(2)?
        .unsqueeze(0)?
        .broadcast_as(norm_error.shape())?;
    let norm_loss = masked_mean(&norm_error.flatten_to(1)?, &seq_mask.flatten_to(1)?, eps)?;
    ((chi_loss * chi_weight)? + (norm_loss * angle_norm_weight)?)?.mean_all()
}

/// Per-residue lDDT-Cα bin classification.
pub fn plddt_loss(
    logits: &Tensor,
    pred37: &Tensor,
    true37: &Tensor,
    mask37: &Tensor,
    cutoff: f64,
    eps: f64,
) -> candle_core::Result<Tensor> {
    let no_bins = logits.dim(D::Minus1)?;
    let score = lddt_ca(pred37, true37, mask37, cutoff, eps, true)?.detach();
    let labels = (score * no_bins as f64)?
        .floor()?
        .clamp(0.0, (no_bins - 1) as f64)?
        .to_dtype(DType::U32)?;
    let errors = softmax_cross_entropy(logits, &labels)?;
    masked_mean(&errors, &atom_mask(mask37, CA_ATOM)?, eps)
}

/// Aligned-error bin classification of the final frames.
pub fn tm_loss(
    logits: &Tensor,
    pred_frames: &Rigid,
    target_frames: &Rigid,
    frames_mask: &Tensor,
    max_bin: f64,
    eps: f64,
) -> candle_core::Result<Tensor> {
    let no_bins = logits.dim(D::Minus1)?;
    let points = |r: &Rigid| r.unsqueeze(2)?.invert_apply(&r.trans().unsqueeze(1)?);
    let sq = (points(pred_frames)? - points(target_frames)?)?
        .sqr()?
        .sum(D::Minus1)?
        .detach();
    let step = max_bin / (no_bins.saturating_sub(2).max(1)) as f64;
    let edges: Vec<f32> = (0..no_bins - 1).map(|i| (step * i as f64).powi(2) as f32).collect();
    let errors = softmax_cross_entropy(logits, &bin_labels(&sq, &edges)?)?;
    masked_mean(&errors, &pair_mask(frames_mask)?, eps)
}

/// Hungarian-matched terms averaged over decoder depths.
#[derive(Clone, Debug)]
pub struct MatchedLosses {
    pub amino_acid: Tensor,
    pub secondary_structure: Tensor,
    pub normed_ca: Tensor,
}

/// Cross-entropy of matched amino-acid and secondary-structure logits `[L, B, Q, C]` and L1
/// of matched normalised translations `[L, B, Q, 7]` against the normalised Cα. Depths without
/// any match are skipped.
pub fn matched_losses(
    aa_logits: &Tensor,
    ss_logits: &Tensor,
    normed_frames: &Tensor,
    matches: &[Vec<Assignment>],
    aatype: &Tensor,
    sstype: &Tensor,
    normed_ca: &Tensor,
) -> candle_core::Result<MatchedLosses> {
    let device = aa_logits.device();
    let (mut aa, mut ss, mut ca) = (Vec::new(), Vec::new(), Vec::new());
    for (depth, per_batch) in matches.iter().enumerate() {
        let (mut aa_l, mut ss_l, mut ca_l) = (Vec::new(), Vec::new(), Vec::new());
        for (b, assignment) in per_batch.iter().enumerate() {
            if assignment.is_empty() {
                continue;
            }
            let pred = Tensor::new(assignment.pred.iter().map(|&i| i as u32).collect::<Vec<_>>(), device)?;
            let gt = Tensor::new(assignment.gt.iter().map(|&i| i as u32).collect::<Vec<_>>(), device)?;
            let pick = |t: &Tensor| t.get(depth)?.get(b)?.index_select(&pred, 0);
            let truth = |t: &Tensor| t.get(b)?.index_select(&gt, 0);
            aa_l.push(softmax_cross_entropy(&pick(aa_logits)?, &truth(aatype)?)?);
            ss_l.push(softmax_cross_entropy(&pick(ss_logits)?, &truth(sstype)?)?);
            let pred_ca = pick(normed_frames)?.narrow(D::Minus1, 4, 3)?;
            ca_l.push((pred_ca - truth(normed_ca)?)?.abs()?.mean(D::Minus1)?);
        }
        if aa_l.is_empty() {
            continue;
        }
        aa.push(Tensor::cat(&aa_l, 0)?.mean_all()?);
        ss.push(Tensor::cat(&ss_l, 0)?.mean_all()?);
        ca.push(Tensor::cat(&ca_l, 0)?.mean_all()?);
    }
    let average = |v: Vec<Tensor>| -> candle_core::Result<Tensor> {
        if v.is_empty() {
            Tensor::zeros((), DType::F32, device)
        } else {
            Tensor::stack(&v, 0)?.mean_all()
        }
    };
    Ok(MatchedLosses {
        amino_acid: average(aa)?,
        secondary_structure: average(ss)?,
        normed_ca: average(ca)?,
    })
}

/// Voxel cross-entropy of `[B, C, W, H, L]` logits; labels `≥ C - 1` are background and
/// ignored.
pub fn segmentation_loss(logits: &Tensor, labels: &Tensor, eps: f64) -> candle_core::Result<Tensor> {
    let c = logits.dim(1)?;
    let background = (c - 1) as f64;
    let logits = logits.permute((0, 2, 3, 4, 1))?.contiguous()?;
    let labels = labels.to_dtype(DType::F32)?;
    let valid = labels.lt(background)?.to_dtype(DType::F32)?;
    let clamped = labels.minimum(background)?.to_dtype(DType::U32)?;
    let errors = softmax_cross_entropy(&logits, &clamped)?;
    masked_mean(&errors, &valid, eps)?.mean_all()
}

/// Weighted sum of every term whose weight is positive and whose inputs are present.
#[derive(Clone, Debug)]
pub struct CryoFoldLoss {
    cfg: LossConfig,
    tables: ResidueTables,
}

impl CryoFoldLoss {
    pub fn new(cfg: &LossConfig, device: &Device) -> Result<Self> {
        Ok(Self {
            cfg: cfg.clone(),
            tables: ResidueTables::new(device)?,
        })
    }

    /// Ground-truth normalised Cα `[B, N, 3]`.
    pub fn normed_ca_target(batch: &FeatureBatch) -> Result<Tensor> {
        if let Some(t) = batch.get_opt("normed_ca_positions") {
            return Ok(t.to_dtype(DType::F32)?);
        }
        let ca = batch
            .get("all_atom_positions")?
            .narrow(2, CA_ATOM, 1)?
            .squeeze(2)?
            .to_dtype(DType::F32)?;
        Ok(batch.density_registration()?.to_normed_ca(&ca)?)
    }

    /// `batch` holds one recycling iteration, normally the last.
    ///
    /// Returns the total and every unweighted term by name.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn forward(&self, outputs: &ModelOutputs, batch: &FeatureBatch) -> Result<(Tensor, BTreeMap<String, Tensor>)> {
        let c = &self.cfg;
        let eps = c.eps;
        let aatype = batch.get("aatype")?;
        let device = aatype.device().clone();
        let b = aatype.dim(0)?;
        let all_atom_positions = batch.get("all_atom_positions")?.to_dtype(DType::F32)?;
        let all_atom_mask = batch.get("all_atom_mask")?.to_dtype(DType::F32)?;
        let gt_frames = backbone_frames_from_atom37(&all_atom_positions, 1e-8)?;
        let gt_frames_mask = (atom_mask(&all_atom_mask, N_ATOM)?
            * atom_mask(&all_atom_mask, CA_ATOM)?)?
            .mul(&atom_mask(&all_atom_mask, C_ATOM)?)?;

        let mut terms: Vec<(&str, f64, Tensor)> = Vec::new();

        if c.distogram.weight > 0.0 {
            if let Some(logits) = outputs.get_opt("distogram_logits") {
                if let (pb, Some(pb_mask)) = pseudo_beta(aatype, &all_atom_positions, Some(&all_atom_mask))? {
                    let loss = distogram_loss(logits, &pb, &pb_mask, c.distogram.min_bin, c.distogram.max_bin, eps)?;
                    terms.push(("distogram", c.distogram.weight, loss));
                }
            }
        }
        if c.masked_msa.weight > 0.0 {
            if let (Some(logits), Some(true_msa), Some(bert_mask)) = (
                outputs.get_opt("masked_msa_logits"),
                batch.get_opt("true_msa"),
                batch.get_opt("bert_mask"),
            ) {
                terms.push(("masked_msa", c.masked_msa.weight, masked_msa_loss(logits, true_msa, bert_mask, eps)?));
            }
        }
        if c.plddt.weight > 0.0 {
            if let (Some(logits), Some(pred)) = (outputs.get_opt("lddt_logits"), outputs.get_opt("final_atom_positions")) {
                let last = pred.get(pred.dim(0)? - 1)?;
                let per_batch = plddt_loss(logits, &last, &all_atom_positions, &all_atom_mask, c.plddt.cutoff, eps)?;
                let gate = resolution_gate(batch, c.plddt.min_resolution, c.plddt.max_resolution, b, &device)?;
                terms.push(("plddt", c.plddt.weight, (per_batch * gate)?.mean_all()?));
            }
        }
        if c.experimentally_resolved.weight > 0.0 {
            if let (Some(logits), Some(exists)) = (
                outputs.get_opt("experimentally_resolved_logits"),
                outputs.get_opt("final_atom_mask"),
            ) {
                let errors = sigmoid_cross_entropy(logits, &all_atom_mask)?;
                let per_batch = masked_mean(&errors, exists, eps)?;
                let r = &c.experimentally_resolved;
                let gate = resolution_gate(batch, r.min_resolution, r.max_resolution, b, &device)?;
                terms.push(("experimentally_resolved", r.weight, (per_batch * gate)?.mean_all()?));
            }
        }
        if c.fape.weight > 0.0 {
            if let Some(frames) = outputs.get_opt("sm_frames") {
                let f = &c.fape;
                let mut per_block = Vec::with_capacity(frames.dim(0)?);
                for l in 0..frames.dim(0)? {
                    let pred = Rigid::from_tensor_7(&frames.get(l)?, false)?;
                    per_block.push(compute_fape(
                        &pred,
                        &gt_frames,
                        &gt_frames_mask,
                        pred.trans(),
                        gt_frames.trans(),
                        &gt_frames_mask,
                        f.clamp_distance,
                        f.loss_unit_distance,
                        f.eps,
                    )?);
                }
                terms.push(("fape", f.weight, Tensor::stack(&per_block, 0)?.mean_all()?));
            }
        }
        if c.supervised_chi.weight > 0.0 {
            if let (Some(angles), Some(unnormalized), Some(chi_mask), Some(chi)) = (
                outputs.get_opt("sm_angles"),
                outputs.get_opt("sm_unnormalized_angles"),
                batch.get_opt("chi_mask"),
                batch.get_opt("chi_angles_sin_cos"),
            ) {
                let s = &c.supervised_chi;
                let loss = supervised_chi_loss(
                    angles,
                    unnormalized,
                    aatype,
                    batch.get("seq_mask")?,
                    chi_mask,
                    chi,
                    &self.tables,
                    s.chi_weight,
                    s.angle_norm_weight,
                    s.eps,
                )?;
                terms.push(("supervised_chi", s.weight, loss));
            }
        }
        if c.tm.weight > 0.0 {
            if let (Some(logits), Some(frames)) = (outputs.get_opt("tm_logits"), outputs.get_opt("sm_frames")) {
                let pred = Rigid::from_tensor_7(&frames.get(frames.dim(0)? - 1)?, false)?;
                let per_batch = tm_loss(logits, &pred, &gt_frames, &gt_frames_mask, c.tm.max_bin as f64, c.tm.eps)?;
                let gate = resolution_gate(batch, c.tm.min_resolution, c.tm.max_resolution, b, &device)?;
                terms.push(("tm", c.tm.weight, (per_batch * gate)?.mean_all()?));
            }
        }

        let needs_normed_ca = outputs.contains("normed_backbone_frame") || outputs.contains("final_normed_ca_positions");
        let normed_ca = if needs_normed_ca {
            Some(Self::normed_ca_target(batch)?)
        } else {
            None
        };
        let ca_mask = atom_mask(&all_atom_mask, CA_ATOM)?;

        if let (Some(aa), Some(ss), Some(frames), Some(normed_ca)) = (
            outputs.get_opt("amino_acid_logits"),
            outputs.get_opt("secondary_structure_logits"),
            outputs.get_opt("normed_backbone_frame"),
            normed_ca.as_ref(),
        ) {
            let matches = match &outputs.hungarian_matches {
                Some(m) => m.clone(),
                None => identity_matches(aa.dim(0)?, &ca_mask)?,
            };
            let sstype = batch.get("sstype")?;
            let m = matched_losses(aa, ss, frames, &matches, aatype, sstype, normed_ca)?;
            terms.push(("amino_acid", c.amino_acid.weight, m.amino_acid));
            terms.push(("secondary_structure", c.secondary_structure.weight, m.secondary_structure));
            terms.push(("normed_ca_init", c.normed_ca_init.weight, m.normed_ca));
        }
        if c.backbone_frame.weight > 0.0 {
            if let Some(frames) = outputs.get_opt("backbone_frame") {
                let f = &c.fape;
                let mut per_depth = Vec::with_capacity(frames.dim(0)?);
                for l in 0..frames.dim(0)? {
                    let pred = Rigid::from_tensor_7(&frames.get(l)?, true)?;
                    per_depth.push(compute_fape(
                        &pred,
                        &gt_frames,
                        &gt_frames_mask,
                        pred.trans(),
                        gt_frames.trans(),
                        &gt_frames_mask,
                        f.clamp_distance,
                        f.loss_unit_distance,
                        f.eps,
                    )?);
                }
                terms.push(("backbone_frame", c.backbone_frame.weight, Tensor::stack(&per_depth, 0)?.mean_all()?));
            }
        }
        if let (Some(normed_ca), Some(pred)) = (normed_ca.as_ref(), outputs.get_opt("final_normed_ca_positions")) {
            let err = (pred - normed_ca)?.abs()?;
            let loss = masked_mean(&err, &ca_mask.unsqueeze(2)?, eps)?.mean_all()?;
            terms.push(("normed_ca_final", c.normed_ca_final.weight, loss));
        }
        if c.cryoem_segmentation.weight > 0.0 {
            if let (Some(logits), Some(labels)) = (
                outputs.get_opt("cryoem_segmentation_logits"),
                batch.get_opt("cryoem_seglabel"),
            ) {
                terms.push((
                    "cryoem_segmentation",
                    c.cryoem_segmentation.weight,
                    segmentation_loss(logits, labels, eps)?,
                ));
            }
        }

        let mut breakdown = BTreeMap::new();
        let mut total = Tensor::zeros((), DType::F32, &device)?;
        for (name, weight, loss) in terms {
            let loss = loss.to_dtype(DType::F32)?;
            if loss.to_scalar::<f32>()?.is_nan() {
                tracing::warn!(term = name, "NaN loss term dropped");
                continue;
            }
            total = (total + (&loss * weight)?)?;
            breakdown.insert(name.to_string(), loss.detach());
        }
        breakdown.insert("loss".to_string(), total.detach());
        tracing::debug!(terms = breakdown.len() - 1, "computed loss");
        Ok((total, breakdown))
    }
}

/// Matches every query to the residue at the same index, for models without a matcher.
fn identity_matches(depths: usize, ca_mask: &Tensor) -> candle_core::Result<Vec<Vec<Assignment>>> {
    let per_batch: Vec<Assignment> = ca_mask
        .to_vec2::<f32>()?
        .into_iter()
        .map(|row| {
            let idx = row.iter().positions(|&m| m > 0.5).collect_vec();
            Assignment {
                pred: idx.clone(),
                gt: idx,
            }
        })
        .collect();
    Ok(vec![per_batch; depths])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cross_entropy_of_uniform_logits() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::zeros((2, 3, 4), DType::F32, &device)?;
        let labels = Tensor::new(&[[0u32, 1, 2], [3, 0, 1]], &device)?;
        let ce = softmax_cross_entropy(&logits, &labels)?;
        for v in ce.flatten_all()?.to_vec1::<f32>()? {
            assert!((v - 4f32.ln()).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_sigmoid_cross_entropy_is_stable() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::new(&[-100f32, 0.0, 100.0], &device)?;
        let labels = Tensor::new(&[0f32, 1.0, 1.0], &device)?;
        let v = sigmoid_cross_entropy(&logits, &labels)?.to_vec1::<f32>()?;
        assert!(v[0].abs() < 1e-6);
        assert!((v[1] - 2f32.ln()).abs() < 1e-6);
        assert!(v[2].abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_fape_of_identical_structures() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let pos = Tensor::randn(0f32, 5.0, (1, 6, 37, 3), &device)?;
        let frames = backbone_frames_from_atom37(&pos, 1e-8)?;
        let mask = Tensor::ones((1, 6), DType::F32, &device)?;
        let fape = compute_fape(&frames, &frames, &mask, frames.trans(), frames.trans(), &mask, 10.0, 10.0, 1e-8)?;
        // sqrt(eps) per pair, scaled by the length unit.
        assert!(fape.to_vec1::<f32>()?[0] < 1e-3);

        let shifted = (frames.trans() + 3.0)?;
        let moved = Rigid::new(frames.rots().clone(), shifted.clone())?;
        let fape = compute_fape(&moved, &frames, &mask, &shifted, frames.trans(), &mask, 10.0, 10.0, 1e-8)?;
        // A global translation leaves every local position unchanged.
        assert!(fape.to_vec1::<f32>()?[0] < 1e-3);
        Ok(())
    }

    #[test]
    fn test_segmentation_ignores_background() -> anyhow::Result<()> {
        let device = Device::Cpu;
        // Confident, correct class 0 everywhere; the rest of the grid is background.
        let mut logits = vec![0f32; 3 * 8];
        for v in 0..8 {
            logits[v] = 50.0;
        }
        let logits = Tensor::from_vec(logits, (1, 3, 2, 2, 2), &device)?;
        let labels = Tensor::new(&[[[[0u32, 2], [2, 2]], [[2, 2], [2, 0]]]], &device)?;
        let loss = segmentation_loss(&logits, &labels, 1e-8)?.to_scalar::<f32>()?;
        assert!(loss < 1e-4);
        Ok(())
    }

    #[test]
    fn test_matched_losses_skip_empty_depths() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let aa = Tensor::zeros((2, 1, 3, 21), DType::F32, &device)?;
        let ss = Tensor::zeros((2, 1, 3, 4), DType::F32, &device)?;
        let frames = Tensor::zeros((2, 1, 3, 7), DType::F32, &device)?;
        let aatype = Tensor::new(&[[0u32, 1, 2]], &device)?;
        let sstype = Tensor::new(&[[0u32, 1, 2]], &device)?;
        let normed_ca = Tensor::full(0.5f32, (1, 3, 3), &device)?;
        let matches = vec![
            vec![Assignment::default()],
            vec![Assignment {
                pred: vec![0, 2],
                gt: vec![1, 0],
            }],
        ];
        let m = matched_losses(&aa, &ss, &frames, &matches, &aatype, &sstype, &normed_ca)?;
        assert!((m.amino_acid.to_scalar::<f32>()? - 21f32.ln()).abs() < 1e-5);
        assert!((m.secondary_structure.to_scalar::<f32>()? - 4f32.ln()).abs() < 1e-5);
        assert!((m.normed_ca.to_scalar::<f32>()? - 0.5).abs() < 1e-6);

        let none = vec![vec![Assignment::default()]];
        let m = matched_losses(&aa, &ss, &frames, &none, &aatype, &sstype, &normed_ca)?;
        assert_eq!(m.amino_acid.to_scalar::<f32>()?, 0.0);
        Ok(())
    }
}
