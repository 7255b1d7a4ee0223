//! Template stage: per-template pair features through a pair stack, pooled into the pair
//! representation by pointwise attention.
use crate::config::{GlobalsConfig, TemplateConfig};
use crate::embedders::{TemplateAngleEmbedder, TemplatePairEmbedder};
use crate::execution::ExecutionMode;
use crate::pair::{TriangleAttention, TriangleEdge, TriangleMultiplication};
use crate::primitives::attention::Attention;
use crate::primitives::kernels::KernelBackend;
use crate::primitives::{mask_bias, LayerNorm, Transition};
use candle_core::{DType, Result, Tensor};
use candle_nn::VarBuilder;
use cryofold_core::feats::{build_template_angle_feat, build_template_pair_feat, DistogramBins, TemplatePairInputs};
use cryofold_core::FeatureBatch;

/// How the templates of a batch are embedded. All strategies share one contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum TemplateStrategy {
    /// Every template through the pair stack, then one pointwise attention over all of them.
    Naive,
    /// Templates one at a time, each attended to on its own and averaged under the mask.
    Average,
    /// As `Naive`, with each stacked template parked in host memory until pooling.
    Offload,
}

impl TemplateStrategy {
    pub fn from_config(cfg: &TemplateConfig) -> Self {
        if cfg.offload_templates {
            Self::Offload
        } else if cfg.average_templates {
            Self::Average
        } else {
            Self::Naive
        }
    }
}

#[derive(Clone, Debug)]
pub struct TemplatePairStackBlock {
    tri_att_start: TriangleAttention,
    tri_att_end: TriangleAttention,
    tri_mul_out: TriangleMultiplication,
    tri_mul_in: TriangleMultiplication,
    pair_transition: Transition,
}

impl TemplatePairStackBlock {
    pub fn load(vb: VarBuilder, cfg: &TemplateConfig, c_t: usize, kernels: KernelBackend) -> Result<Self> {
        let s = &cfg.pair_stack;
        Ok(Self {
            tri_att_start: TriangleAttention::load(
                vb.pp("tri_att_start"),
                c_t,
                s.c_hidden_tri_att,
                s.no_heads,
                TriangleEdge::Outgoing,
                s.inf,
                kernels,
            )?,
            tri_att_end: TriangleAttention::load(
                vb.pp("tri_att_end"),
                c_t,
                s.c_hidden_tri_att,
                s.no_heads,
                TriangleEdge::Incoming,
                s.inf,
                kernels,
            )?,
            tri_mul_out: TriangleMultiplication::load(
                vb.pp("tri_mul_out"),
                c_t,
                s.c_hidden_tri_mul,
                TriangleEdge::Outgoing,
                kernels,
            )?,
            tri_mul_in: TriangleMultiplication::load(
                vb.pp("tri_mul_in"),
                c_t,
                s.c_hidden_tri_mul,
                TriangleEdge::Incoming,
                kernels,
            )?,
            pair_transition: Transition::load(vb.pp("pair_transition"), c_t, s.pair_transition_n, kernels)?,
        })
    }

    /// One template `t [B, N, N, C_t]`.
    pub fn forward(&self, t: &Tensor, mask: &Tensor, mode: &ExecutionMode) -> Result<Tensor> {
        let t = (t + self.tri_att_start.forward(t, mask, mode)?)?;
        let t = (&t + self.tri_att_end.forward(&t, mask, mode)?)?;
        let t = (&t + self.tri_mul_out.forward(&t, mask)?)?;
        let t = (&t + self.tri_mul_in.forward(&t, mask)?)?;
        &t + self.pair_transition.forward(&t, mask)?
    }
}

#[derive(Clone, Debug)]
pub struct TemplatePairStack {
    blocks: Vec<TemplatePairStackBlock>,
    layer_norm: LayerNorm,
}

impl TemplatePairStack {
    pub fn load(vb: VarBuilder, cfg: &TemplateConfig, c_t: usize, kernels: KernelBackend) -> Result<Self> {
        let blocks = (0..cfg.pair_stack.no_blocks)
            .map(|i| TemplatePairStackBlock::load(vb.pp(format!("blocks.{i}")), cfg, c_t, kernels))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            blocks,
            layer_norm: LayerNorm::load(vb.pp("layer_norm"), c_t, kernels)?,
        })
    }

    /// Runs one template `[B, N, N, C_t]` through every block.
    pub fn forward(&self, t: &Tensor, mask: &Tensor, mode: &ExecutionMode) -> Result<Tensor> {
        let mut t = t.clone();
        for group in mode.block_groups(self.blocks.len()) {
            let _span = tracing::trace_span!("template_pair_stack", blocks = ?group).entered();
            for block in &self.blocks[group] {
                t = block.forward(&t, mask, mode)?;
            }
        }
        self.layer_norm.forward(&t)
    }
}

/// Attention from each pair entry of `z` over the same entry of every template.
#[derive(Clone, Debug)]
pub struct TemplatePointwiseAttention {
    mha: Attention,
    inf: f64,
}

impl TemplatePointwiseAttention {
    pub fn load(vb: VarBuilder, cfg: &TemplateConfig, c_t: usize, c_z: usize, kernels: KernelBackend) -> Result<Self> {
        let p = &cfg.pointwise_attention;
        Ok(Self {
            mha: Attention::load(vb.pp("mha"), c_z, c_t, p.c_hidden, p.no_heads, false, kernels)?,
            inf: p.inf,
        })
    }

    /// `t [B, T, N, N, C_t]`, `z [B, N, N, C_z]`, `template_mask [B, T]`.
    pub fn forward(&self, t: &Tensor, z: &Tensor, template_mask: &Tensor, mode: &ExecutionMode) -> Result<Tensor> {
        let b = template_mask.dim(0)?;
        let n_templ = template_mask.dim(1)?;
        // [B, 1, 1, 1, 1, T]
        let bias = mask_bias(template_mask, self.inf)?.reshape((b, 1, 1, 1, 1, n_templ))?;
        // [B, N, N, T, C_t]
        let t = t.permute((0, 2, 3, 1, 4))?.contiguous()?;
        let z = z.unsqueeze(3)?;
        self.mha.forward(&z, &t, &[bias], mode)?.squeeze(3)
    }
}

/// Outputs of [`TemplateEmbedder::forward`].
#[derive(Debug)]
pub struct TemplateEmbedding {
    /// `[B, N, N, C_z]`, added to the pair representation.
    pub pair: Tensor,
    /// `[B, T, N, C_m]` extra MSA rows, with `embed_angles`.
    pub angle: Option<Tensor>,
}

#[derive(Clone, Debug)]
pub struct TemplateEmbedder {
    template_angle_embedder: Option<TemplateAngleEmbedder>,
    template_pair_embedder: TemplatePairEmbedder,
    template_pair_stack: TemplatePairStack,
    template_pointwise_att: TemplatePointwiseAttention,
    bins: DistogramBins,
    use_unit_vector: bool,
    eps: f64,
    inf: f64,
    strategy: TemplateStrategy,
}

impl TemplateEmbedder {
    /// Variables live under the root builder; names are prefixed with `template_`.
    pub fn load(vb: VarBuilder, cfg: &TemplateConfig, g: &GlobalsConfig) -> Result<Self> {
        let template_angle_embedder = if cfg.embed_angles {
            Some(TemplateAngleEmbedder::load(vb.pp("template_angle_embedder"), cfg.angle_c_in, g.c_m)?)
        } else {
            None
        };
        Ok(Self {
            template_angle_embedder,
            template_pair_embedder: TemplatePairEmbedder::load(vb.pp("template_pair_embedder"), cfg.pair_c_in, g.c_t)?,
            template_pair_stack: TemplatePairStack::load(vb.pp("template_pair_stack"), cfg, g.c_t, g.kernels)?,
            template_pointwise_att: TemplatePointwiseAttention::load(
                vb.pp("template_pointwise_att"),
                cfg,
                g.c_t,
                g.c_z,
                g.kernels,
            )?,
            bins: DistogramBins {
                min_bin: cfg.distogram.min_bin,
                max_bin: cfg.distogram.max_bin,
                no_bins: cfg.distogram.no_bins,
            },
            use_unit_vector: cfg.use_unit_vector,
            eps: cfg.eps,
            inf: cfg.inf,
            strategy: TemplateStrategy::from_config(cfg),
        })
    }

    pub fn strategy(&self) -> TemplateStrategy {
        self.strategy
    }

    /// Embedded pair feature `[B, N, N, C_t]` of template `i`.
    fn embed_one(&self, feats: &FeatureBatch, i: usize) -> Result<Tensor> {
        let pick = |name: &str| -> Result<Tensor> { feats.get(name).map_err(candle_core::Error::wrap)?.narrow(1, i, 1)?.squeeze(1) };
        let aatype = pick("template_aatype")?;
        let positions = pick("template_all_atom_positions")?.to_dtype(DType::F32)?;
        let atom_mask = pick("template_all_atom_mask")?.to_dtype(DType::F32)?;
        let pseudo_beta = pick("template_pseudo_beta")?.to_dtype(DType::F32)?;
        let pseudo_beta_mask = pick("template_pseudo_beta_mask")?.to_dtype(DType::F32)?;
        let inputs = TemplatePairInputs {
            aatype: &aatype,
            all_atom_positions: &positions,
            all_atom_mask: &atom_mask,
            pseudo_beta: &pseudo_beta,
            pseudo_beta_mask: &pseudo_beta_mask,
        };
        let t = build_template_pair_feat(&inputs, self.bins, self.use_unit_vector, self.eps, self.inf)?;
        self.template_pair_embedder.forward(&t)
    }

    /// `z [B, N, N, C_z]`, `pair_mask [B, N, N]`. Returns `None` when the batch has no templates.
    pub fn forward(
        &self,
        feats: &FeatureBatch,
        z: &Tensor,
        pair_mask: &Tensor,
        mode: &ExecutionMode,
    ) -> Result<Option<TemplateEmbedding>> {
        let template_mask = feats
            .get("template_mask")
            .map_err(candle_core::Error::wrap)?
            .to_dtype(DType::F32)?;
        let n_templ = template_mask.dim(1)?;
        if n_templ == 0 {
            return Ok(None);
        }
        let _span = tracing::debug_span!("templates", n_templ, strategy = %self.strategy).entered();
        let pair = match self.strategy {
            TemplateStrategy::Naive | TemplateStrategy::Offload => {
                self.embed_stacked(feats, z, pair_mask, &template_mask, n_templ, mode)?
            }
            TemplateStrategy::Average => self.embed_average(feats, z, pair_mask, &template_mask, n_templ, mode)?,
        };
        // Zero the update for batch elements without any valid template.
        let any = template_mask.sum_keepdim(1)?.gt(0.0)?.to_dtype(DType::F32)?;
        let pair = pair.broadcast_mul(&any.reshape((any.dim(0)?, 1, 1, 1))?)?;

        let angle = match &self.template_angle_embedder {
            Some(emb) => {
                let get = |name: &str| feats.get(name).map_err(candle_core::Error::wrap);
                let feat = build_template_angle_feat(
                    get("template_aatype")?,
                    &get("template_torsion_angles_sin_cos")?.to_dtype(DType::F32)?,
                    &get("template_alt_torsion_angles_sin_cos")?.to_dtype(DType::F32)?,
                    get("template_torsion_angles_mask")?,
                )?;
                Some(emb.forward(&feat)?)
            }
            None => None,
        };
        Ok(Some(TemplateEmbedding { pair, angle }))
    }

    fn embed_stacked(
        &self,
        feats: &FeatureBatch,
        z: &Tensor,
        pair_mask: &Tensor,
        template_mask: &Tensor,
        n_templ: usize,
        mode: &ExecutionMode,
    ) -> Result<Tensor> {
        let offload = self.strategy == TemplateStrategy::Offload;
        let device = z.device();
        let (b, n, _, _) = z.dims4()?;
        let c_t = self.template_pair_embedder_out();
        let preallocated = if mode.inplace_safe {
            Some(Tensor::zeros((b, n_templ, n, n, c_t), z.dtype(), device)?)
        } else {
            None
        };
        let mut stacked = Vec::with_capacity(n_templ);
        for i in 0..n_templ {
            let t = self.embed_one(feats, i)?;
            let t = self.template_pair_stack.forward(&t, pair_mask, mode)?;
            let t = if offload { t.to_device(&candle_core::Device::Cpu)? } else { t };
            match &preallocated {
                Some(out) => out.slice_set(&t.to_device(device)?.unsqueeze(1)?.contiguous()?, 1, i)?,
                None => stacked.push(t),
            }
        }
        let t = match preallocated {
            Some(out) => out,
            None => {
                let stacked = stacked
                    .iter()
                    .map(|t| t.to_device(device))
                    .collect::<Result<Vec<_>>>()?;
                Tensor::stack(&stacked, 1)?
            }
        };
        self.template_pointwise_att.forward(&t, z, template_mask, mode)
    }

    fn embed_average(
        &self,
        feats: &FeatureBatch,
        z: &Tensor,
        pair_mask: &Tensor,
        template_mask: &Tensor,
        n_templ: usize,
        mode: &ExecutionMode,
    ) -> Result<Tensor> {
        let mut acc = z.zeros_like()?;
        for i in 0..n_templ {
            let t = self.embed_one(feats, i)?;
            let t = self.template_pair_stack.forward(&t, pair_mask, mode)?.unsqueeze(1)?;
            let m_i = template_mask.narrow(1, i, 1)?;
            let att = self.template_pointwise_att.forward(&t, z, &m_i, mode)?;
            acc = (acc + att.broadcast_mul(&m_i.reshape((m_i.dim(0)?, 1, 1, 1))?)?)?;
        }
        let denom = template_mask.sum_keepdim(1)?.clamp(1.0, f64::INFINITY)?;
        acc.broadcast_div(&denom.reshape((denom.dim(0)?, 1, 1, 1))?)
    }

    fn template_pair_embedder_out(&self) -> usize {
        self.template_pair_embedder.c_out()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CryoFoldConfig;
    use candle_nn::VarMap;
    use cryofold_test_data::SyntheticBatch;

    fn embedder(strategy: TemplateStrategy, varmap: &VarMap) -> anyhow::Result<(TemplateEmbedder, CryoFoldConfig)> {
        let mut cfg = CryoFoldConfig::tiny();
        cfg.model.template.offload_templates = strategy == TemplateStrategy::Offload;
        cfg.model.template.average_templates = strategy == TemplateStrategy::Average;
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &candle_core::Device::Cpu);
        let emb = TemplateEmbedder::load(vb, &cfg.model.template, &cfg.globals)?;
        crate::weights::reseed(varmap, 17)?;
        Ok((emb, cfg))
    }

    fn pair_inputs(batch: &FeatureBatch, c_z: usize) -> anyhow::Result<(Tensor, Tensor)> {
        let n = batch.n_res()?;
        let z = Tensor::randn(0f32, 1.0, (1, n, n, c_z), &candle_core::Device::Cpu)?;
        let seq_mask = batch.get("seq_mask")?;
        let pair_mask = seq_mask.unsqueeze(2)?.broadcast_mul(&seq_mask.unsqueeze(1)?)?;
        Ok((z, pair_mask))
    }

    fn run(emb: &TemplateEmbedder, batch: &FeatureBatch, z: &Tensor, pair_mask: &Tensor, mode: &ExecutionMode) -> anyhow::Result<Tensor> {
        let out = emb
            .forward(batch, z, pair_mask, mode)?
            .ok_or_else(|| anyhow::anyhow!("templates were skipped"))?;
        assert_eq!(out.pair.dims(), z.dims());
        assert_eq!(out.angle.map(|a| a.dim(1)).transpose()?, Some(batch.get("template_mask")?.dim(1)?));
        Ok(out.pair)
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> anyhow::Result<f32> {
        Ok((a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
    }

    #[test]
    fn test_naive_offload_and_inplace_agree() -> anyhow::Result<()> {
        let device = candle_core::Device::Cpu;
        let batch = SyntheticBatch::default().n_templates(2).build(&device)?.recycle(0)?;
        let varmap = VarMap::new();
        let (naive, cfg) = embedder(TemplateStrategy::Naive, &varmap)?;
        let offload = TemplateEmbedder {
            strategy: TemplateStrategy::Offload,
            ..naive.clone()
        };
        let (z, pair_mask) = pair_inputs(&batch, cfg.globals.c_z)?;
        let mode = ExecutionMode::default();
        let a = run(&naive, &batch, &z, &pair_mask, &mode)?;
        let b = run(&offload, &batch, &z, &pair_mask, &mode)?;
        let c = run(
            &naive,
            &batch,
            &z,
            &pair_mask,
            &ExecutionMode {
                inplace_safe: true,
                chunk_size: Some(3),
                ..mode
            },
        )?;
        assert!(max_diff(&a, &b)? < 1e-6);
        assert!(max_diff(&a, &c)? < 1e-5);
        assert!(a.abs()?.sum_all()?.to_scalar::<f32>()? > 0.0);
        Ok(())
    }

    #[test]
    fn test_average_matches_naive_for_one_template() -> anyhow::Result<()> {
        let device = candle_core::Device::Cpu;
        let batch = SyntheticBatch::default().n_templates(1).build(&device)?.recycle(0)?;
        let varmap = VarMap::new();
        let (naive, cfg) = embedder(TemplateStrategy::Naive, &varmap)?;
        let average = TemplateEmbedder {
            strategy: TemplateStrategy::Average,
            ..naive.clone()
        };
        let (z, pair_mask) = pair_inputs(&batch, cfg.globals.c_z)?;
        let mode = ExecutionMode::default();
        let a = run(&naive, &batch, &z, &pair_mask, &mode)?;
        let b = run(&average, &batch, &z, &pair_mask, &mode)?;
        assert!(max_diff(&a, &b)? < 1e-5);
        Ok(())
    }

    #[test]
    fn test_masked_templates_give_zero_update() -> anyhow::Result<()> {
        let device = candle_core::Device::Cpu;
        let mut batch = SyntheticBatch::default().build(&device)?.recycle(0)?;
        batch.insert("template_mask", Tensor::zeros((1, 1), DType::F32, &device)?);
        let varmap = VarMap::new();
        let (naive, cfg) = embedder(TemplateStrategy::Naive, &varmap)?;
        let (z, pair_mask) = pair_inputs(&batch, cfg.globals.c_z)?;
        let out = run(&naive, &batch, &z, &pair_mask, &ExecutionMode::default())?;
        assert_eq!(out.abs()?.sum_all()?.to_scalar::<f32>()?, 0.0);
        Ok(())
    }
}
