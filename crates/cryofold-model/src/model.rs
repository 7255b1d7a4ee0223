//! The full network: input embedding, recycling, templates, extra MSA, evoformer, density
//! cross-attention and structure, run once per recycling iteration.
use crate::config::CryoFoldConfig;
use crate::cryoformer::{CryoformerDecoder, CryoformerEmbedder, CryoformerEncoder, DensityFeatures};
use crate::embedders::{ExtraMsaEmbedder, InputEmbedder, RecyclingEmbedder, RecyclingState};
use crate::error::{CryoFoldError, Result};
use crate::evoformer::{EvoformerStack, ExtraMsaStack};
use crate::execution::ExecutionMode;
use crate::heads::{AuxiliaryHeads, BackboneFrameHead, SegmentationInputs};
use crate::loss::CryoFoldLoss;
use crate::matcher::{Assignment, HungarianMatcher, MatchTargets};
use crate::primitives::LayerNorm;
use crate::structure_module::StructureModule;
use crate::template::TemplateEmbedder;
use candle_core::{DType, Tensor, D};
use candle_nn::VarBuilder;
use cryofold_core::feats::{atom14_to_atom37, build_extra_msa_feat, pseudo_beta, DensityRegistration, ResidueTables};
use cryofold_core::residue_constants::CA_ATOM;
use cryofold_core::{FeatureBatch, FeatureError, Rigid};
use std::collections::BTreeMap;

/// Additive bias for masked density tokens in the encoder.
const DENSITY_MASK_INF: f64 = 1e9;

/// Named output tensors of a forward pass.
///
/// Structure-module and decoder outputs carry a leading block/depth axis `L`.
#[derive(Clone, Debug, Default)]
pub struct ModelOutputs {
    tensors: BTreeMap<String, Tensor>,
    /// Query-to-residue assignments, one list per decoder depth with one entry per batch element.
    pub hungarian_matches: Option<Vec<Vec<Assignment>>>,
}

impl ModelOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, t: Tensor) -> Option<Tensor> {
        self.tensors.insert(name.into(), t)
    }

    pub fn get(&self, name: &str) -> Result<&Tensor> {
        self.tensors
            .get(name)
            .ok_or_else(|| CryoFoldError::MissingOutput(name.to_string()))
    }

    pub fn get_opt(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.tensors.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.tensors.iter()
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn into_tensors(self) -> BTreeMap<String, Tensor> {
        self.tensors
    }
}

/// Density embedder, encoder and decoder, present together or not at all.
#[derive(Clone, Debug)]
struct DensityStage {
    embedder: CryoformerEmbedder,
    encoder: CryoformerEncoder,
    decoder: CryoformerDecoder,
    single_norm: LayerNorm,
}

/// Encoded density of one iteration, kept for the segmentation head.
#[derive(Clone, Debug)]
struct EncodedDensity {
    features: DensityFeatures,
    /// `[B, V, C_s]`
    encoded: Tensor,
    /// `[B, W, H, L]`
    density: Tensor,
    registration: DensityRegistration,
}

impl DensityStage {
    fn encode(&self, feats: &FeatureBatch) -> Result<EncodedDensity> {
        let density = feats.get("cryoem_density")?.to_dtype(DType::F32)?;
        let features = self.embedder.forward(&density, feats.get_opt("cryoem_mask"))?;
        let encoded = self
            .encoder
            .forward(&features.repr, features.mask.as_ref(), &features.pos)?;
        Ok(EncodedDensity {
            features,
            encoded,
            density,
            registration: feats.density_registration()?,
        })
    }
}

/// Outputs and next recycling state of one iteration.
#[derive(Clone, Debug)]
pub struct Iteration {
    pub outputs: ModelOutputs,
    pub state: RecyclingState,
    density: Option<EncodedDensity>,
}

#[derive(Clone, Debug)]
pub struct CryoFold {
    cfg: CryoFoldConfig,
    mode: ExecutionMode,
    input_embedder: InputEmbedder,
    recycling_embedder: RecyclingEmbedder,
    template: Option<TemplateEmbedder>,
    extra_msa: Option<(ExtraMsaEmbedder, ExtraMsaStack)>,
    evoformer: EvoformerStack,
    density: Option<DensityStage>,
    backbone_frame: Option<BackboneFrameHead>,
    structure_module: Option<StructureModule>,
    aux_heads: AuxiliaryHeads,
    matcher: Option<HungarianMatcher>,
    tables: ResidueTables,
}

impl CryoFold {
    /// Validates `cfg`, then builds every enabled stage; disabled stages own no variables.
    pub fn load(vb: VarBuilder, cfg: &CryoFoldConfig) -> Result<Self> {
        cfg.validate()?;
        let g = &cfg.globals;
        let m = &cfg.model;
        let template = if m.template.enabled {
            Some(TemplateEmbedder::load(vb.clone(), &m.template, g)?)
        } else {
            None
        };
        let extra_msa = if m.extra_msa.enabled {
            Some((
                ExtraMsaEmbedder::load(vb.pp("extra_msa_embedder"), m.extra_msa.c_in, g.c_e)?,
                ExtraMsaStack::load(vb.pp("extra_msa_stack"), &m.extra_msa.stack, g)?,
            ))
        } else {
            None
        };
        let density = if m.cryoem.enabled {
            Some(DensityStage {
                embedder: CryoformerEmbedder::load(vb.pp("cryoformer_emb"), &m.cryoem, g)?,
                encoder: CryoformerEncoder::load(
                    vb.pp("cryoformer_enc"),
                    g.c_s,
                    &m.cryoem.encoder,
                    DENSITY_MASK_INF,
                    g.kernels,
                )?,
                decoder: CryoformerDecoder::load(
                    vb.pp("cryoformer_dec"),
                    g.c_s,
                    g.c_m,
                    g.c_z,
                    &m.cryoem.decoder,
                    g.kernels,
                )?,
                single_norm: LayerNorm::load(vb.pp("cryo_sgl_norm"), g.c_s, g.kernels)?,
            })
        } else {
            None
        };
        let backbone_frame = m
            .backbone_frame
            .enabled
            .then(|| BackboneFrameHead::load(vb.pp("backbone_frame"), g.c_s, &m.backbone_frame))
            .transpose()?;
        let structure_module = m
            .structure_module
            .enabled
            .then(|| StructureModule::load(vb.pp("structure_module"), &m.structure_module, g))
            .transpose()?;
        let patch_c = (m.cryoem.embedder.patch_c1, m.cryoem.embedder.patch_c2);
        let aux_heads = AuxiliaryHeads::load(vb.pp("aux_heads"), &m.heads, patch_c, cfg.loss.tm.max_bin as f64, g)?;
        let matcher = m
            .heads
            .hungarian_matcher
            .enabled
            .then(|| HungarianMatcher::new(&m.heads.hungarian_matcher));
        tracing::debug!(
            templates = template.is_some(),
            extra_msa = extra_msa.is_some(),
            density = density.is_some(),
            structure_module = structure_module.is_some(),
            "built model"
        );
        Ok(Self {
            cfg: cfg.clone(),
            mode: ExecutionMode::from_globals(g),
            input_embedder: InputEmbedder::load(vb.pp("input_embedder"), &m.input_embedder, g)?,
            recycling_embedder: RecyclingEmbedder::load(vb.pp("recycling_embedder"), &m.recycling_embedder, g)?,
            template,
            extra_msa,
            evoformer: EvoformerStack::load(vb.pp("evoformer"), &m.evoformer_stack, g)?,
            density,
            backbone_frame,
            structure_module,
            aux_heads,
            matcher,
            tables: ResidueTables::new(vb.device())?,
        })
    }

    pub fn config(&self) -> &CryoFoldConfig {
        &self.cfg
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Replaces the execution mode; outputs do not change.
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Runs every recycling iteration of `batch`, then the auxiliary heads and the matcher on
    /// the outputs of the last one.
    ///
    /// State passed between iterations is detached, so only the final iteration is part of
    /// any autograd graph.
    #[tracing::instrument(level = "info", skip_all)]
    pub fn forward(&self, batch: &FeatureBatch) -> Result<ModelOutputs> {
        let num_iters = batch.num_recycles()?;
        let mut prevs = None;
        let mut last = None;
        for i in 0..num_iters {
            let feats = batch.recycle(i)?;
            feats.check_residue_counts()?;
            tracing::info!(iteration = i + 1, of = num_iters, "recycling iteration");
            let it = self.iteration(&feats, prevs.take())?;
            if i + 1 == num_iters {
                last = Some((feats, it));
            } else {
                prevs = Some(it.state.detach());
            }
        }
        let (feats, it) = last.ok_or(FeatureError::RecycleOutOfRange { index: 0, count: 0 })?;
        let mut outputs = it.outputs;
        let segmentation = it.density.as_ref().map(|d| SegmentationInputs {
            encoded: &d.encoded,
            features: &d.features,
            density: &d.density,
        });
        self.aux_heads.forward(&mut outputs, segmentation)?;
        if let Some(matcher) = &self.matcher {
            outputs.hungarian_matches = match_queries(matcher, &outputs, &feats)?;
        }
        Ok(outputs)
    }

    /// One recycling iteration over single-iteration features; `prevs = None` starts from zeros.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn iteration(&self, feats: &FeatureBatch, prevs: Option<RecyclingState>) -> Result<Iteration> {
        let g = &self.cfg.globals;
        let mode = &self.mode;
        let aatype = feats.get("aatype")?;
        let device = aatype.device().clone();
        let (b, n) = aatype.dims2()?;
        let seq_mask = feats.get("seq_mask")?.to_dtype(DType::F32)?;
        let pair_mask = seq_mask.unsqueeze(2)?.broadcast_mul(&seq_mask.unsqueeze(1)?)?;
        let mut msa_mask = feats.get("msa_mask")?.to_dtype(DType::F32)?;
        let n_seq = msa_mask.dim(1)?;

        let density = self.density.as_ref().map(|stage| stage.encode(feats)).transpose()?;

        let chain_index = feats.get_opt("asym_id").or_else(|| feats.get_opt("chain_index"));
        let emb = self.input_embedder.forward(
            &feats.get("target_feat")?.to_dtype(DType::F32)?,
            feats.get("residue_index")?,
            &feats.get("msa_feat")?.to_dtype(DType::F32)?,
            chain_index,
        )?;

        let prevs = match prevs {
            Some(p) => p,
            None => RecyclingState::zeros(b, n, g, &device)?,
        };
        let (x_prev, _) = pseudo_beta(aatype, &prevs.x_prev, None)?;
        let rec = self
            .recycling_embedder
            .forward(&prevs.m_1_prev, &prevs.z_prev, &x_prev, &prevs.s_prev, &prevs.c_prev)?;
        let mut m = add_to_first_row(&emb.msa, &rec.msa_row)?;
        let mut z = (emb.pair + rec.pair)?;
        let single_emb = add_opt(emb.single, rec.single)?;
        let chain_emb = add_opt(emb.chain, rec.chain)?;

        if let Some(template) = &self.template {
            if let Some(t) = template.forward(feats, &z, &pair_mask, mode)? {
                z = (z + t.pair)?;
                if let Some(angle) = t.angle {
                    m = Tensor::cat(&[&m, &angle], 1)?;
                    let torsion_mask = feats
                        .get("template_torsion_angles_mask")?
                        .narrow(3, 2, 1)?
                        .squeeze(3)?
                        .to_dtype(DType::F32)?;
                    msa_mask = Tensor::cat(&[&msa_mask, &torsion_mask], 1)?;
                }
            }
        }

        if let Some((embedder, stack)) = &self.extra_msa {
            let feat = build_extra_msa_feat(
                feats.get("extra_msa")?,
                feats.get("extra_has_deletion")?,
                &feats.get("extra_deletion_value")?.to_dtype(DType::F32)?,
            )?;
            let a = embedder.forward(&feat)?;
            let extra_mask = feats.get("extra_msa_mask")?.to_dtype(DType::F32)?;
            // m waits on the host while the extra-MSA stack runs.
            let parked = mode.offload(&m)?;
            z = stack.forward(&a, &z, &extra_mask, &pair_mask, mode)?;
            m = mode.restore(&parked, &device)?;
        }
        ensure_finite(&m, "msa embedding")?;

        let (m, z, s) = self.evoformer.forward(&m, &z, &msa_mask, &pair_mask, mode)?;
        ensure_finite(&m, "evoformer")?;
        let msa = m.narrow(1, 0, n_seq)?;
        let mut single = s;

        let mut outputs = ModelOutputs::new();
        let mut sm_init = None;
        let mut coarse = None;
        if let (Some(stage), Some(enc)) = (&self.density, &density) {
            let mut query = stage.single_norm.forward(&single)?;
            if let Some(s) = &single_emb {
                query = (query + s)?;
            }
            if let Some(c) = &chain_emb {
                query = (query + c)?;
            }
            let single_dec = stage
                .decoder
                .forward(&query, &msa, &z, enc.features.memory(&enc.encoded))?;
            ensure_finite(&single_dec, "cryoformer decoder")?;
            let depth = single_dec.dim(0)?;
            if g.fuse_single {
                single = single_dec.get(depth - 1)?;
            }
            if let Some(head) = &self.backbone_frame {
                let normed = head.forward(&single_dec)?;
                let trans = enc.registration.to_physical(&normed.narrow(D::Minus1, 4, 3)?)?;
                let physical = Tensor::cat(&[&normed.narrow(D::Minus1, 0, 4)?, &trans], D::Minus1)?;
                if self.cfg.model.structure_module.use_cryoem_backbone {
                    let seed = Rigid::from_tensor_7(&physical.get(depth - 1)?, true)?;
                    sm_init = Some(seed.detach_rot());
                }
                coarse = Some((normed.clone(), physical.clone()));
                outputs.insert("normed_backbone_frame", normed);
                outputs.insert("backbone_frame", physical);
            }
            outputs.insert("single_dec", single_dec);
        }

        let mut x_next = prevs.x_prev.zeros_like()?;
        if let Some(sm) = &self.structure_module {
            let out = sm.forward(&single, &z, aatype, &seq_mask, sm_init.as_ref())?;
            let blocks = out.positions.dim(0)?;
            let atom37 = (0..blocks)
                .map(|i| atom14_to_atom37(&out.positions.get(i)?, aatype, &self.tables))
                .collect::<candle_core::Result<Vec<_>>>()?;
            let final_positions = Tensor::stack(&atom37, 0)?;
            x_next = final_positions.get(blocks - 1)?;
            if let Some(enc) = &density {
                let ca = x_next.narrow(2, CA_ATOM, 1)?.squeeze(2)?;
                outputs.insert("final_normed_ca_positions", enc.registration.to_normed_ca(&ca)?);
            }
            outputs.insert("final_atom_positions", final_positions);
            outputs.insert("final_atom_mask", self.tables.atom37_exists(aatype)?);
            outputs.insert("sm_frames", out.frames);
            outputs.insert("sm_sidechain_frames", out.sidechain_frames);
            outputs.insert("sm_unnormalized_angles", out.unnormalized_angles);
            outputs.insert("sm_angles", out.angles);
            outputs.insert("sm_positions", out.positions);
            outputs.insert("sm_states", out.states);
            outputs.insert("sm_single", out.single);
        } else if let Some((normed, physical)) = coarse {
            // Without a structure module every atom sits at its residue's frame origin.
            let (depth, b, n, _) = physical.dims4()?;
            let final_positions = physical
                .narrow(D::Minus1, 4, 3)?
                .unsqueeze(3)?
                .broadcast_as((depth, b, n, 37, 3))?
                .contiguous()?;
            x_next = final_positions.get(depth - 1)?;
            outputs.insert(
                "final_normed_ca_positions",
                normed.get(depth - 1)?.narrow(D::Minus1, 4, 3)?,
            );
            outputs.insert("final_atom_positions", final_positions);
            outputs.insert("final_atom_mask", self.tables.atom37_exists(aatype)?);
        }
        if let Some(positions) = outputs.get_opt("final_atom_positions") {
            ensure_finite(positions, "structure module")?;
        }

        let state = RecyclingState {
            m_1_prev: m.narrow(1, 0, 1)?.squeeze(1)?,
            z_prev: z.clone(),
            x_prev: x_next,
            s_prev: single.clone(),
            c_prev: chain_emb.unwrap_or(prevs.c_prev),
        };
        outputs.insert("msa", msa);
        outputs.insert("pair", z);
        outputs.insert("single", single);
        Ok(Iteration {
            outputs,
            state,
            density,
        })
    }
}

/// Assigns decoder queries to ground-truth residues when the batch carries ground truth.
fn match_queries(
    matcher: &HungarianMatcher,
    outputs: &ModelOutputs,
    feats: &FeatureBatch,
) -> Result<Option<Vec<Vec<Assignment>>>> {
    let (Some(aa), Some(ss), Some(frames)) = (
        outputs.get_opt("amino_acid_logits"),
        outputs.get_opt("secondary_structure_logits"),
        outputs.get_opt("normed_backbone_frame"),
    ) else {
        return Ok(None);
    };
    let (Some(atom_mask), Some(sstype)) = (feats.get_opt("all_atom_mask"), feats.get_opt("sstype")) else {
        return Ok(None);
    };
    if !feats.contains("all_atom_positions") {
        return Ok(None);
    }
    let normed_ca = CryoFoldLoss::normed_ca_target(feats)?;
    let mask = atom_mask.narrow(2, CA_ATOM, 1)?.squeeze(2)?;
    let targets = MatchTargets {
        aatype: feats.get("aatype")?,
        sstype,
        normed_ca: &normed_ca,
        mask: &mask,
    };
    Ok(Some(matcher.forward(aa, ss, frames, targets)?))
}

/// `m [B, S, N, C]` with `row [B, N, C]` added to its first row.
fn add_to_first_row(m: &Tensor, row: &Tensor) -> candle_core::Result<Tensor> {
    let s = m.dim(1)?;
    let first = m.narrow(1, 0, 1)?.broadcast_add(&row.unsqueeze(1)?)?;
    if s == 1 {
        return Ok(first);
    }
    Tensor::cat(&[&first, &m.narrow(1, 1, s - 1)?], 1)
}

fn add_opt(a: Option<Tensor>, b: Option<Tensor>) -> candle_core::Result<Option<Tensor>> {
    match (a, b) {
        (Some(a), Some(b)) => Ok(Some((a + b)?)),
        (a, None) => Ok(a),
        (None, b) => Ok(b),
    }
}

fn ensure_finite(t: &Tensor, stage: &str) -> Result<()> {
    let t = t.to_dtype(DType::F32)?;
    let nan = t.ne(&t)?.to_dtype(DType::F32)?.sum_all()?.to_scalar::<f32>()?;
    if nan > 0.0 {
        tracing::error!(stage, nan, "NaN in forward pass");
        return Err(CryoFoldError::NumericalDegeneracy {
            stage: stage.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nan_is_reported_with_its_stage() -> anyhow::Result<()> {
        let device = candle_core::Device::Cpu;
        let t = Tensor::new(&[1f32, f32::NAN, 2.0], &device)?;
        match ensure_finite(&t, "evoformer") {
            Err(CryoFoldError::NumericalDegeneracy { stage }) => assert_eq!(stage, "evoformer"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(ensure_finite(&Tensor::new(&[1f32, 2.0], &device)?, "evoformer").is_ok());
        Ok(())
    }

    #[test]
    fn test_first_row_update() -> anyhow::Result<()> {
        let device = candle_core::Device::Cpu;
        let m = Tensor::zeros((1, 3, 2, 4), DType::F32, &device)?;
        let row = Tensor::ones((1, 2, 4), DType::F32, &device)?;
        let out = add_to_first_row(&m, &row)?;
        assert_eq!(out.dims(), &[1, 3, 2, 4]);
        let sums = out.sum((0, 2, 3))?.to_vec1::<f32>()?;
        assert_eq!(sums, vec![8.0, 0.0, 0.0]);
        let single = add_to_first_row(&m.narrow(1, 0, 1)?, &row)?;
        assert_eq!(single.dims(), &[1, 1, 2, 4]);
        Ok(())
    }

    #[test]
    fn test_missing_output_is_named() {
        let outputs = ModelOutputs::new();
        assert!(matches!(
            outputs.get("plddt"),
            Err(CryoFoldError::MissingOutput(name)) if name == "plddt"
        ));
    }
}
