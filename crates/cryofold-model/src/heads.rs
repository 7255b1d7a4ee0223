//! Prediction heads over the final representations.
use crate::config::{BackboneFrameConfig, GlobalsConfig, HeadsConfig, LddtHeadConfig, SegmentationHeadConfig};
use crate::cryoformer::volume::{from_tokens, PatchConv3d, Upsample3d};
use crate::cryoformer::DensityFeatures;
use crate::error::Result;
use crate::model::ModelOutputs;
use crate::primitives::kernels::KernelBackend;
use crate::primitives::{swap_rows_cols, LayerNorm, LayerNorm3d, Linear, LinearInit, Mlp};
use candle_core::{DType, Device, Tensor, D};
use candle_nn::VarBuilder;
use cryofold_core::rigid::normalize_quats;

/// Coarse per-residue frames straight from the decoder output.
///
/// Returns `[*, N, 7]` tensors of a unit quaternion and a translation in the unit cube of the
/// density map.
#[derive(Clone, Debug)]
pub struct BackboneFrameHead {
    quat_head: Mlp,
    trans_head: Mlp,
}

impl BackboneFrameHead {
    pub fn load(vb: VarBuilder, c_s: usize, cfg: &BackboneFrameConfig) -> candle_core::Result<Self> {
        Ok(Self {
            quat_head: Mlp::load(vb.pp("quat_head"), &[c_s, c_s, c_s, cfg.c_out_q])?,
            trans_head: Mlp::load(vb.pp("trans_head"), &[c_s, c_s, c_s, cfg.c_out_t])?,
        })
    }

    pub fn forward(&self, single: &Tensor) -> candle_core::Result<Tensor> {
        let quat = normalize_quats(&self.quat_head.forward(single)?)?;
        let trans = candle_nn::ops::sigmoid(&self.trans_head.forward(single)?)?;
        Tensor::cat(&[quat, trans], D::Minus1)
    }
}

/// Per-residue lDDT-Cα bin logits.
#[derive(Clone, Debug)]
pub struct LddtHead {
    layer_norm: LayerNorm,
    linear_1: Linear,
    linear_2: Linear,
    linear_3: Linear,
}

impl LddtHead {
    pub fn load(vb: VarBuilder, c_s: usize, cfg: &LddtHeadConfig, kernels: KernelBackend) -> candle_core::Result<Self> {
        Ok(Self {
            layer_norm: LayerNorm::load(vb.pp("layer_norm"), c_s, kernels)?,
            linear_1: Linear::new(vb.pp("linear_1"), c_s, cfg.c_hidden, LinearInit::Relu)?,
            linear_2: Linear::new(vb.pp("linear_2"), cfg.c_hidden, cfg.c_hidden, LinearInit::Relu)?,
            linear_3: Linear::new(vb.pp("linear_3"), cfg.c_hidden, cfg.no_bins, LinearInit::Final)?,
        })
    }

    pub fn forward(&self, s: &Tensor) -> candle_core::Result<Tensor> {
        let s = self.layer_norm.forward(s)?;
        let s = self.linear_1.forward(&s)?.relu()?;
        let s = self.linear_2.forward(&s)?.relu()?;
        self.linear_3.forward(&s)
    }
}

/// Expected lDDT in `[0, 100]` from `[*, no_bins]` logits with uniform bins over `[0, 1]`.
pub fn compute_plddt(logits: &Tensor) -> candle_core::Result<Tensor> {
    let no_bins = logits.dim(D::Minus1)?;
    let width = 1.0 / no_bins as f32;
    let centers: Vec<f32> = (0..no_bins).map(|i| (i as f32 + 0.5) * width).collect();
    let centers = Tensor::new(centers, logits.device())?;
    let probs = candle_nn::ops::softmax_last_dim(&logits.contiguous()?)?;
    probs.broadcast_mul(&centers)?.sum(D::Minus1)? * 100.0
}

/// Symmetric pair distance-bin logits.
#[derive(Clone, Debug)]
pub struct DistogramHead {
    linear: Linear,
}

impl DistogramHead {
    pub fn load(vb: VarBuilder, c_z: usize, no_bins: usize) -> candle_core::Result<Self> {
        Ok(Self {
            linear: Linear::new(vb.pp("linear"), c_z, no_bins, LinearInit::Final)?,
        })
    }

    pub fn forward(&self, z: &Tensor) -> candle_core::Result<Tensor> {
        let logits = self.linear.forward(z)?;
        &logits + swap_rows_cols(&logits)?
    }
}

/// Aligned-error bin logits, the source of PAE and pTM.
#[derive(Clone, Debug)]
pub struct TmHead {
    linear: Linear,
}

impl TmHead {
    pub fn load(vb: VarBuilder, c_z: usize, no_bins: usize) -> candle_core::Result<Self> {
        Ok(Self {
            linear: Linear::new(vb.pp("linear"), c_z, no_bins, LinearInit::Final)?,
        })
    }

    pub fn forward(&self, z: &Tensor) -> candle_core::Result<Tensor> {
        self.linear.forward(z)
    }
}

/// Centres of `no_bins` error bins: `no_bins - 1` edges spread over `[0, max_bin]` plus an
/// open-ended last bin.
fn aligned_error_bin_centers(max_bin: f64, no_bins: usize, device: &Device) -> candle_core::Result<Tensor> {
    let edges = no_bins.saturating_sub(1).max(2);
    let step = max_bin / (edges - 1) as f64;
    let mut centers: Vec<f32> = (0..edges).map(|i| (i as f64 * step + step / 2.0) as f32).collect();
    let last = centers[edges - 1] + step as f32;
    centers.push(last);
    centers.truncate(no_bins);
    Tensor::new(centers, device)
}

#[derive(Clone, Debug)]
pub struct AlignedError {
    /// `[B, N, N, no_bins]`
    pub aligned_confidence_probs: Tensor,
    /// `[B, N, N]` expected error in Å.
    pub predicted_aligned_error: Tensor,
    /// Centre of the last bin.
    pub max_predicted_aligned_error: Tensor,
}

pub fn compute_predicted_aligned_error(logits: &Tensor, max_bin: f64) -> candle_core::Result<AlignedError> {
    let no_bins = logits.dim(D::Minus1)?;
    let centers = aligned_error_bin_centers(max_bin, no_bins, logits.device())?;
    let probs = candle_nn::ops::softmax_last_dim(&logits.contiguous()?)?;
    let pae = probs.broadcast_mul(&centers)?.sum(D::Minus1)?;
    Ok(AlignedError {
        aligned_confidence_probs: probs,
        predicted_aligned_error: pae,
        max_predicted_aligned_error: centers.get(no_bins - 1)?,
    })
}

/// Predicted TM-score `[B]` of `[B, N, N, no_bins]` logits, taken over the best-aligned residue.
pub fn compute_tm(
    logits: &Tensor,
    residue_weights: Option<&Tensor>,
    max_bin: f64,
    eps: f64,
) -> candle_core::Result<Tensor> {
    let (b, n, _, no_bins) = logits.dims4()?;
    let weights = match residue_weights {
        Some(w) => w.to_dtype(DType::F32)?,
        None => Tensor::ones((b, n), DType::F32, logits.device())?,
    };
    let centers = aligned_error_bin_centers(max_bin, no_bins, logits.device())?;
    // [B, 1]
    let clipped_n = weights.sum_keepdim(D::Minus1)?.maximum(19.0)?;
    let d0 = ((clipped_n - 15.0)?.powf(1.0 / 3.0)? * 1.24)? - 1.8;
    let d0_sq = d0?.sqr()?.unsqueeze(2)?;
    // [B, 1, no_bins]
    let tm_per_bin = centers
        .sqr()?
        .unsqueeze(0)?
        .unsqueeze(0)?
        .broadcast_div(&d0_sq)?
        .affine(1.0, 1.0)?
        .recip()?;
    let probs = candle_nn::ops::softmax_last_dim(&logits.contiguous()?)?;
    let term = probs.broadcast_mul(&tm_per_bin.unsqueeze(1)?)?.sum(D::Minus1)?;
    let normed = weights.broadcast_div(&weights.sum_keepdim(D::Minus1)?.affine(1.0, eps)?)?;
    let per_alignment = term.broadcast_mul(&normed.unsqueeze(1)?)?.sum(D::Minus1)?;
    let best = (&per_alignment * &weights)?.argmax_keepdim(D::Minus1)?;
    per_alignment.gather(&best, 1)?.squeeze(1)
}

/// `Linear(c_in, c_out)` with zero-initialised weights, for the classification heads.
#[derive(Clone, Debug)]
pub struct ClassHead {
    linear: Linear,
}

impl ClassHead {
    pub fn load(vb: VarBuilder, c_in: usize, c_out: usize) -> candle_core::Result<Self> {
        Ok(Self {
            linear: Linear::new(vb.pp("linear"), c_in, c_out, LinearInit::Final)?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        self.linear.forward(x)
    }
}

/// Everything the segmentation decoder fuses.
#[derive(Clone, Copy, Debug)]
pub struct SegmentationInputs<'a> {
    /// `[B, V, C_s]` encoder output.
    pub encoded: &'a Tensor,
    pub features: &'a DensityFeatures,
    /// `[B, W, H, L]` raw density.
    pub density: &'a Tensor,
}

/// Voxel classification of the density map from three resolutions of density features.
#[derive(Clone, Debug)]
pub struct SegmentationHead {
    cf: Linear,
    l4: PatchConv3d,
    l2: PatchConv3d,
    up1: Upsample3d,
    up2: Upsample3d,
    fuse: PatchConv3d,
    up3: Upsample3d,
    proj: PatchConv3d,
    norm: LayerNorm3d,
    pred: PatchConv3d,
}

impl SegmentationHead {
    pub fn load(
        vb: VarBuilder,
        c_s: usize,
        patch_c1: usize,
        patch_c2: usize,
        cfg: &SegmentationHeadConfig,
        kernels: KernelBackend,
    ) -> candle_core::Result<Self> {
        let h = cfg.hidden_dim;
        Ok(Self {
            cf: Linear::new(vb.pp("cf"), c_s, h, LinearInit::Glorot)?,
            l4: PatchConv3d::load(vb.pp("l4"), patch_c2, h, 1)?,
            l2: PatchConv3d::load(vb.pp("l2"), patch_c1, h, 1)?,
            up1: Upsample3d::load(vb.pp("up1"), h, h)?,
            up2: Upsample3d::load(vb.pp("up2"), h, h)?,
            fuse: PatchConv3d::load(vb.pp("fuse"), 3 * h, h, 1)?,
            up3: Upsample3d::load(vb.pp("up3"), h, h)?,
            proj: PatchConv3d::load(vb.pp("proj"), 1, h, 1)?,
            norm: LayerNorm3d::load(vb.pp("norm"), h, kernels)?,
            pred: PatchConv3d::load(vb.pp("pred"), h, cfg.c_out, 1)?,
        })
    }

    /// Returns `[B, c_out, W, H, L]` logits.
    pub fn forward(&self, inputs: SegmentationInputs<'_>) -> candle_core::Result<Tensor> {
        let [x2, x4] = &inputs.features.feats;
        let (_, _, w2, h2, l2) = x2.dims5()?;
        let (_, w, h, l) = inputs.density.dims4()?;
        let cf = from_tokens(&self.cf.forward(inputs.encoded)?, inputs.features.grid)?;
        let cf = self.up1.forward(&cf, (w2, h2, l2))?;
        let d4 = self.up2.forward(&self.l4.forward(x4)?, (w2, h2, l2))?;
        let d2 = self.l2.forward(x2)?;
        let fused = self.fuse.forward(&Tensor::cat(&[cf, d4, d2], 1)?)?.relu()?;
        let up = self.up3.forward(&fused, (w, h, l))?;
        let density = self
            .proj
            .forward(&inputs.density.to_dtype(up.dtype())?.unsqueeze(1)?)?;
        let x = self.norm.forward(&(up + density)?)?.relu()?;
        self.pred.forward(&x)
    }
}

/// Every enabled auxiliary head; disabled heads own no parameters.
#[derive(Clone, Debug)]
pub struct AuxiliaryHeads {
    lddt: Option<LddtHead>,
    distogram: Option<DistogramHead>,
    tm: Option<TmHead>,
    masked_msa: Option<ClassHead>,
    experimentally_resolved: Option<ClassHead>,
    amino_acid: Option<ClassHead>,
    secondary_structure: Option<ClassHead>,
    segmentation: Option<SegmentationHead>,
    tm_max_bin: f64,
    eps: f64,
}

impl AuxiliaryHeads {
    pub fn load(
        vb: VarBuilder,
        cfg: &HeadsConfig,
        patch_c: (usize, usize),
        tm_max_bin: f64,
        g: &GlobalsConfig,
    ) -> candle_core::Result<Self> {
        let lddt = cfg
            .lddt
            .enabled
            .then(|| LddtHead::load(vb.pp("lddt"), g.c_s, &cfg.lddt, g.kernels))
            .transpose()?;
        let distogram = cfg
            .distogram
            .enabled
            .then(|| DistogramHead::load(vb.pp("distogram"), g.c_z, cfg.distogram.no_bins))
            .transpose()?;
        let tm = cfg
            .tm
            .enabled
            .then(|| TmHead::load(vb.pp("tm"), g.c_z, cfg.tm.no_bins))
            .transpose()?;
        let class = |name: &str, enabled: bool, c_in: usize, c_out: usize| {
            enabled
                .then(|| ClassHead::load(vb.pp(name), c_in, c_out))
                .transpose()
        };
        let masked_msa = class("masked_msa", cfg.masked_msa.enabled, g.c_m, cfg.masked_msa.c_out)?;
        let experimentally_resolved = class(
            "experimentally_resolved",
            cfg.experimentally_resolved.enabled,
            g.c_s,
            cfg.experimentally_resolved.c_out,
        )?;
        let amino_acid = class("amino_acid", cfg.amino_acid.enabled, g.c_s, cfg.amino_acid.c_out)?;
        let secondary_structure = class(
            "secondary_structure",
            cfg.secondary_structure.enabled,
            g.c_s,
            cfg.secondary_structure.c_out,
        )?;
        let segmentation = cfg
            .cryoem_segmentation
            .enabled
            .then(|| {
                SegmentationHead::load(
                    vb.pp("cryoem_segmentation"),
                    g.c_s,
                    patch_c.0,
                    patch_c.1,
                    &cfg.cryoem_segmentation,
                    g.kernels,
                )
            })
            .transpose()?;
        Ok(Self {
            lddt,
            distogram,
            tm,
            masked_msa,
            experimentally_resolved,
            amino_acid,
            secondary_structure,
            segmentation,
            tm_max_bin,
            eps: g.eps,
        })
    }

    /// Adds the logits of every enabled head to `outputs`.
    ///
    /// Reads `sm_single`, `pair`, `msa`, `single` and `single_dec` from `outputs`; heads whose
    /// input is absent are skipped, and the segmentation head runs only with `density`.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn forward(&self, outputs: &mut ModelOutputs, density: Option<SegmentationInputs<'_>>) -> Result<()> {
        if let (Some(head), Some(s)) = (&self.lddt, outputs.get_opt("sm_single").cloned()) {
            let logits = head.forward(&s)?;
            outputs.insert("plddt", compute_plddt(&logits)?);
            outputs.insert("lddt_logits", logits);
        }
        if let Some(z) = outputs.get_opt("pair").cloned() {
            if let Some(head) = &self.distogram {
                outputs.insert("distogram_logits", head.forward(&z)?);
            }
            if let Some(head) = &self.tm {
                let logits = head.forward(&z)?;
                let pae = compute_predicted_aligned_error(&logits, self.tm_max_bin)?;
                outputs.insert(
                    "predicted_tm_score",
                    compute_tm(&logits, None, self.tm_max_bin, self.eps)?,
                );
                outputs.insert("aligned_confidence_probs", pae.aligned_confidence_probs);
                outputs.insert("predicted_aligned_error", pae.predicted_aligned_error);
                outputs.insert("max_predicted_aligned_error", pae.max_predicted_aligned_error);
                outputs.insert("tm_logits", logits);
            }
        }
        if let (Some(head), Some(m)) = (&self.masked_msa, outputs.get_opt("msa").cloned()) {
            outputs.insert("masked_msa_logits", head.forward(&m)?);
        }
        if let (Some(head), Some(s)) = (&self.experimentally_resolved, outputs.get_opt("single").cloned()) {
            outputs.insert("experimentally_resolved_logits", head.forward(&s)?);
        }
        if let Some(s) = outputs.get_opt("single_dec").cloned() {
            if let Some(head) = &self.amino_acid {
                outputs.insert("amino_acid_logits", head.forward(&s)?);
            }
            if let Some(head) = &self.secondary_structure {
                outputs.insert("secondary_structure_logits", head.forward(&s)?);
            }
        }
        if let (Some(head), Some(inputs)) = (&self.segmentation, density) {
            outputs.insert("cryoem_segmentation_logits", head.forward(inputs)?);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CryoFoldConfig;
    use candle_nn::VarMap;

    #[test]
    fn test_backbone_quaternions_are_unit() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let cfg = CryoFoldConfig::tiny();
        let head = BackboneFrameHead::load(vb, 12, &cfg.model.backbone_frame)?;
        let s = Tensor::randn(0f32, 3.0, (2, 1, 9, 12), &device)?;
        let out = head.forward(&s)?;
        assert_eq!(out.dims(), &[2, 1, 9, 7]);
        let norms = out.narrow(D::Minus1, 0, 4)?.sqr()?.sum(D::Minus1)?.sqrt()?;
        for v in norms.flatten_all()?.to_vec1::<f32>()? {
            assert!((v - 1.0).abs() < 1e-5);
        }
        for v in out.narrow(D::Minus1, 4, 3)?.flatten_all()?.to_vec1::<f32>()? {
            assert!((0.0..=1.0).contains(&v));
        }
        Ok(())
    }

    #[test]
    fn test_backbone_zero_input_gives_identity_rotation() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let cfg = CryoFoldConfig::tiny();
        let head = BackboneFrameHead::load(vb, 12, &cfg.model.backbone_frame)?;
        // Zero-bias layers map a zero row to a zero quaternion before normalisation.
        let out = head.forward(&Tensor::zeros((1, 1, 3, 12), DType::F32, &device)?)?;
        for q in out.narrow(D::Minus1, 0, 4)?.reshape((3, 4))?.to_vec2::<f32>()? {
            assert_eq!(q, vec![1.0, 0.0, 0.0, 0.0]);
        }
        let rigid = cryofold_core::Rigid::from_tensor_7(&out, true)?;
        let sum = rigid.rots().rot_mats().sum_all()?.to_scalar::<f32>()?;
        assert!(sum.is_finite());
        Ok(())
    }

    #[test]
    fn test_plddt_of_uniform_logits_is_fifty() -> anyhow::Result<()> {
        let logits = Tensor::zeros((1, 4, 50), DType::F32, &Device::Cpu)?;
        for v in compute_plddt(&logits)?.flatten_all()?.to_vec1::<f32>()? {
            assert!((v - 50.0).abs() < 1e-4);
        }
        Ok(())
    }

    #[test]
    fn test_distogram_is_symmetric() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let head = DistogramHead::load(vb, 4, 6)?;
        crate::weights::reseed(&varmap, 5)?;
        let z = Tensor::randn(0f32, 1.0, (1, 5, 5, 4), &device)?;
        let logits = head.forward(&z)?;
        let d = (&logits - swap_rows_cols(&logits)?)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(d < 1e-5);
        Ok(())
    }

    #[test]
    fn test_aligned_error_bins() -> anyhow::Result<()> {
        let c = aligned_error_bin_centers(31.0, 64, &Device::Cpu)?.to_vec1::<f32>()?;
        assert_eq!(c.len(), 64);
        let step = 31.0 / 62.0;
        assert!((c[0] - step / 2.0).abs() < 1e-6);
        assert!((c[63] - c[62] - step).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_tm_of_confident_logits() -> anyhow::Result<()> {
        let device = Device::Cpu;
        // All mass on the first bin: the score is 1 / (1 + (step/2)² / d0²).
        let mut logits = vec![-1e4f32; 30 * 30 * 64];
        for i in 0..30 * 30 {
            logits[i * 64] = 0.0;
        }
        let logits = Tensor::from_vec(logits, (1, 30, 30, 64), &device)?;
        let tm = compute_tm(&logits, None, 31.0, 1e-8)?.to_vec1::<f32>()?;
        let d0 = 1.24 * (15f64).powf(1.0 / 3.0) - 1.8;
        let c0 = 31.0 / 62.0 / 2.0;
        let expected = 1.0 / (1.0 + c0 * c0 / (d0 * d0));
        assert!((tm[0] as f64 - expected).abs() < 1e-4);
        let pae = compute_predicted_aligned_error(&logits, 31.0)?;
        assert_eq!(pae.predicted_aligned_error.dims(), &[1, 30, 30]);
        Ok(())
    }

    #[test]
    fn test_segmentation_logits_match_density_grid() -> anyhow::Result<()> {
        use crate::cryoformer::CryoformerEmbedder;
        let device = Device::Cpu;
        let cfg = CryoFoldConfig::tiny();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let emb = CryoformerEmbedder::load(vb.pp("emb"), &cfg.model.cryoem, &cfg.globals)?;
        let e = &cfg.model.cryoem.embedder;
        let head = SegmentationHead::load(
            vb.pp("seg"),
            cfg.globals.c_s,
            e.patch_c1,
            e.patch_c2,
            &cfg.model.heads.cryoem_segmentation,
            KernelBackend::Reference,
        )?;
        let density = Tensor::rand(0f32, 1.0, (1, 16, 16, 16), &device)?;
        let features = emb.forward(&density, None)?;
        let out = head.forward(SegmentationInputs {
            encoded: &features.repr,
            features: &features,
            density: &density,
        })?;
        assert_eq!(
            out.dims(),
            &[1, cfg.model.heads.cryoem_segmentation.c_out, 16, 16, 16]
        );
        Ok(())
    }
}
