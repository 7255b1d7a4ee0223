//! The MSA/pair trunk and the extra-MSA stack.
use crate::config::{EvoformerStackConfig, GlobalsConfig};
use crate::execution::ExecutionMode;
use crate::msa::{MsaColumnAttention, MsaColumnGlobalAttention, MsaRowAttention, OuterProductMean};
use crate::pair::{TriangleAttention, TriangleEdge, TriangleMultiplication};
use crate::primitives::kernels::KernelBackend;
use crate::primitives::{Linear, LinearInit, Transition};
use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

#[derive(Clone, Debug)]
enum ColumnAttention {
    Full(MsaColumnAttention),
    Global(MsaColumnGlobalAttention),
}

/// Pair-track half of a block, shared by the main and the extra-MSA stacks.
#[derive(Clone, Debug)]
struct PairCore {
    outer_product_mean: OuterProductMean,
    tri_mul_out: TriangleMultiplication,
    tri_mul_in: TriangleMultiplication,
    tri_att_start: TriangleAttention,
    tri_att_end: TriangleAttention,
    pair_transition: Transition,
}

impl PairCore {
    fn load(vb: &VarBuilder, cfg: &EvoformerStackConfig, c_m: usize, c_z: usize, kernels: KernelBackend) -> Result<Self> {
        Ok(Self {
            outer_product_mean: OuterProductMean::load(vb.pp("outer_product_mean"), c_m, c_z, cfg.c_hidden_opm, kernels)?,
            tri_mul_out: TriangleMultiplication::load(
                vb.pp("tri_mul_out"),
                c_z,
                cfg.c_hidden_mul,
                TriangleEdge::Outgoing,
                kernels,
            )?,
            tri_mul_in: TriangleMultiplication::load(
                vb.pp("tri_mul_in"),
                c_z,
                cfg.c_hidden_mul,
                TriangleEdge::Incoming,
                kernels,
            )?,
            tri_att_start: TriangleAttention::load(
                vb.pp("tri_att_start"),
                c_z,
                cfg.c_hidden_pair_att,
                cfg.no_heads_pair,
                TriangleEdge::Outgoing,
                cfg.inf,
                kernels,
            )?,
            tri_att_end: TriangleAttention::load(
                vb.pp("tri_att_end"),
                c_z,
                cfg.c_hidden_pair_att,
                cfg.no_heads_pair,
                TriangleEdge::Incoming,
                cfg.inf,
                kernels,
            )?,
            pair_transition: Transition::load(vb.pp("pair_transition"), c_z, cfg.transition_n, kernels)?,
        })
    }

    fn triangles(&self, z: &Tensor, pair_mask: &Tensor, mode: &ExecutionMode) -> Result<Tensor> {
        let z = (z + self.tri_mul_out.forward(z, pair_mask)?)?;
        let z = (&z + self.tri_mul_in.forward(&z, pair_mask)?)?;
        let z = (&z + self.tri_att_start.forward(&z, pair_mask, mode)?)?;
        let z = (&z + self.tri_att_end.forward(&z, pair_mask, mode)?)?;
        &z + self.pair_transition.forward(&z, pair_mask)?
    }
}

#[derive(Clone, Debug)]
pub struct EvoformerBlock {
    msa_att_row: MsaRowAttention,
    msa_att_col: ColumnAttention,
    msa_transition: Transition,
    core: PairCore,
}

impl EvoformerBlock {
    /// `c_m` is the MSA width of this stack (`c_m` for the main stack, `c_e` for extra MSA).
    pub fn load(
        vb: VarBuilder,
        cfg: &EvoformerStackConfig,
        c_m: usize,
        c_z: usize,
        global_column: bool,
        eps: f64,
        kernels: KernelBackend,
    ) -> Result<Self> {
        let msa_att_col = if global_column {
            ColumnAttention::Global(MsaColumnGlobalAttention::load(
                vb.pp("msa_att_col"),
                c_m,
                cfg.c_hidden_msa_att,
                cfg.no_heads_msa,
                cfg.inf,
                eps,
                kernels,
            )?)
        } else {
            ColumnAttention::Full(MsaColumnAttention::load(
                vb.pp("msa_att_col"),
                c_m,
                cfg.c_hidden_msa_att,
                cfg.no_heads_msa,
                cfg.inf,
                kernels,
            )?)
        };
        Ok(Self {
            msa_att_row: MsaRowAttention::load(
                vb.pp("msa_att_row"),
                c_m,
                Some(c_z),
                cfg.c_hidden_msa_att,
                cfg.no_heads_msa,
                cfg.inf,
                kernels,
            )?,
            msa_att_col,
            msa_transition: Transition::load(vb.pp("msa_transition"), c_m, cfg.transition_n, kernels)?,
            core: PairCore::load(&vb.pp("core"), cfg, c_m, c_z, kernels)?,
        })
    }

    /// `m [B, S, N, C_m]`, `z [B, N, N, C_z]`, `msa_mask [B, S, N]`, `pair_mask [B, N, N]`.
    pub fn forward(
        &self,
        m: &Tensor,
        z: &Tensor,
        msa_mask: &Tensor,
        pair_mask: &Tensor,
        mode: &ExecutionMode,
    ) -> Result<(Tensor, Tensor)> {
        let device = m.device().clone();
        let m = (m + self.msa_att_row.forward(m, Some(z), msa_mask, mode)?)?;
        let m = match &self.msa_att_col {
            ColumnAttention::Full(att) => (&m + att.forward(&m, msa_mask, mode)?)?,
            ColumnAttention::Global(att) => (&m + att.forward(&m, msa_mask)?)?,
        };
        let m = (&m + self.msa_transition.forward(&m, msa_mask)?)?;
        let z = (z + self.core.outer_product_mean.forward(&m, msa_mask)?)?;
        // `m` waits on the host while the triangle updates run.
        let m = mode.offload(&m)?;
        let z = self.core.triangles(&z, pair_mask, mode)?;
        let m = mode.restore(&m, &device)?;
        Ok((m, z))
    }
}

/// Evoformer trunk: `no_blocks` blocks and a projection of the first MSA row to the single
/// representation.
#[derive(Clone, Debug)]
pub struct EvoformerStack {
    blocks: Vec<EvoformerBlock>,
    linear: Linear,
}

impl EvoformerStack {
    pub fn load(vb: VarBuilder, cfg: &EvoformerStackConfig, g: &GlobalsConfig) -> Result<Self> {
        let blocks = (0..cfg.no_blocks)
            .map(|i| EvoformerBlock::load(vb.pp(format!("blocks.{i}")), cfg, g.c_m, g.c_z, false, g.eps, g.kernels))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            blocks,
            linear: Linear::new(vb.pp("linear"), g.c_m, g.c_s, LinearInit::Default)?,
        })
    }

    /// Returns the evolved `(m, z, s)`.
    #[tracing::instrument(level = "debug", skip_all, fields(blocks = self.blocks.len()))]
    pub fn forward(
        &self,
        m: &Tensor,
        z: &Tensor,
        msa_mask: &Tensor,
        pair_mask: &Tensor,
        mode: &ExecutionMode,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let (mut m, mut z) = (m.clone(), z.clone());
        for group in mode.block_groups(self.blocks.len()) {
            let _span = tracing::trace_span!("evoformer_group", blocks = ?group).entered();
            for block in &self.blocks[group] {
                let (m_new, z_new) = block.forward(&m, &z, msa_mask, pair_mask, mode)?;
                m = m_new;
                z = z_new;
            }
        }
        let s = self.linear.forward(&m.narrow(1, 0, 1)?.squeeze(1)?)?;
        Ok((m, z, s))
    }
}

/// Stack over the extra MSA; only the pair representation leaves it.
#[derive(Clone, Debug)]
pub struct ExtraMsaStack {
    blocks: Vec<EvoformerBlock>,
}

impl ExtraMsaStack {
    pub fn load(vb: VarBuilder, cfg: &EvoformerStackConfig, g: &GlobalsConfig) -> Result<Self> {
        let blocks = (0..cfg.no_blocks)
            .map(|i| EvoformerBlock::load(vb.pp(format!("blocks.{i}")), cfg, g.c_e, g.c_z, true, g.eps, g.kernels))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { blocks })
    }

    #[tracing::instrument(level = "debug", skip_all, fields(blocks = self.blocks.len()))]
    pub fn forward(
        &self,
        a: &Tensor,
        z: &Tensor,
        msa_mask: &Tensor,
        pair_mask: &Tensor,
        mode: &ExecutionMode,
    ) -> Result<Tensor> {
        let (mut a, mut z) = (a.clone(), z.clone());
        for group in mode.block_groups(self.blocks.len()) {
            for block in &self.blocks[group] {
                let (a_new, z_new) = block.forward(&a, &z, msa_mask, pair_mask, mode)?;
                a = a_new;
                z = z_new;
            }
        }
        Ok(z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CryoFoldConfig;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_execution_modes_agree() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let cfg = CryoFoldConfig::tiny();
        let g = &cfg.globals;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let stack = EvoformerStack::load(vb, &cfg.model.evoformer_stack, g)?;
        crate::weights::reseed(&varmap, 23)?;

        let m = Tensor::randn(0f32, 1.0, (1, 3, 6, g.c_m), &device)?;
        let z = Tensor::randn(0f32, 1.0, (1, 6, 6, g.c_z), &device)?;
        let msa_mask = Tensor::ones((1, 3, 6), DType::F32, &device)?;
        let pair_mask = Tensor::ones((1, 6, 6), DType::F32, &device)?;

        let base = ExecutionMode::default();
        let (m0, z0, s0) = stack.forward(&m, &z, &msa_mask, &pair_mask, &base)?;
        assert_eq!(s0.dims(), &[1, 6, g.c_s]);
        let modes = [
            ExecutionMode {
                inplace_safe: true,
                chunk_size: Some(2),
                ..base
            },
            ExecutionMode {
                offload_inference: true,
                blocks_per_ckpt: Some(1),
                ..base
            },
            ExecutionMode {
                use_lma: true,
                ..base
            },
        ];
        for mode in modes {
            let (m1, z1, s1) = stack.forward(&m, &z, &msa_mask, &pair_mask, &mode)?;
            for (a, b) in [(&m0, &m1), (&z0, &z1), (&s0, &s1)] {
                let d = (a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
                assert!(d < 1e-4, "{mode:?} differs by {d}");
            }
        }
        Ok(())
    }

    #[test]
    fn test_extra_msa_stack_updates_pair_only() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let cfg = CryoFoldConfig::tiny();
        let g = &cfg.globals;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let stack = ExtraMsaStack::load(vb, &cfg.model.extra_msa.stack, g)?;
        crate::weights::reseed(&varmap, 4)?;
        let a = Tensor::randn(0f32, 1.0, (1, 5, 4, g.c_e), &device)?;
        let z = Tensor::randn(0f32, 1.0, (1, 4, 4, g.c_z), &device)?;
        let msa_mask = Tensor::ones((1, 5, 4), DType::F32, &device)?;
        let pair_mask = Tensor::ones((1, 4, 4), DType::F32, &device)?;
        let out = stack.forward(&a, &z, &msa_mask, &pair_mask, &ExecutionMode::default())?;
        assert_eq!(out.dims(), z.dims());
        let d = (out - &z)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(d > 0.0);
        Ok(())
    }
}
