//! Pair-track updates built on residue triangles.
use crate::execution::ExecutionMode;
use crate::primitives::attention::Attention;
use crate::primitives::kernels::KernelBackend;
use crate::primitives::{mask_bias, swap_rows_cols, LayerNorm, Linear, LinearInit};
use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

/// Which edges of the triangle `(i, j, k)` are combined.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriangleEdge {
    /// Outgoing edges `ik` and `jk` for multiplication, the starting node for attention.
    Outgoing,
    /// Incoming edges `ki` and `kj` for multiplication, the ending node for attention.
    Incoming,
}

#[derive(Clone, Debug)]
pub struct TriangleMultiplication {
    layer_norm_in: LayerNorm,
    layer_norm_out: LayerNorm,
    linear_a_p: Linear,
    linear_a_g: Linear,
    linear_b_p: Linear,
    linear_b_g: Linear,
    linear_g: Linear,
    linear_z: Linear,
    edge: TriangleEdge,
}

impl TriangleMultiplication {
    pub fn load(vb: VarBuilder, c_z: usize, c_hidden: usize, edge: TriangleEdge, kernels: KernelBackend) -> Result<Self> {
        Ok(Self {
            layer_norm_in: LayerNorm::load(vb.pp("layer_norm_in"), c_z, kernels)?,
            layer_norm_out: LayerNorm::load(vb.pp("layer_norm_out"), c_hidden, kernels)?,
            linear_a_p: Linear::new(vb.pp("linear_a_p"), c_z, c_hidden, LinearInit::Default)?,
            linear_a_g: Linear::new(vb.pp("linear_a_g"), c_z, c_hidden, LinearInit::Gating)?,
            linear_b_p: Linear::new(vb.pp("linear_b_p"), c_z, c_hidden, LinearInit::Default)?,
            linear_b_g: Linear::new(vb.pp("linear_b_g"), c_z, c_hidden, LinearInit::Gating)?,
            linear_g: Linear::new(vb.pp("linear_g"), c_z, c_z, LinearInit::Gating)?,
            linear_z: Linear::new(vb.pp("linear_z"), c_hidden, c_z, LinearInit::Final)?,
            edge,
        })
    }

    /// `z [B, N, N, C_z]`, `mask [B, N, N]`.
    pub fn forward(&self, z: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let z = self.layer_norm_in.forward(z)?;
        let mask = mask.unsqueeze(3)?;
        let gated = |p: &Linear, g: &Linear| -> Result<Tensor> {
            candle_nn::ops::sigmoid(&g.forward(&z)?)?
                .mul(&p.forward(&z)?)?
                .broadcast_mul(&mask)
        };
        let a = gated(&self.linear_a_p, &self.linear_a_g)?;
        let b = gated(&self.linear_b_p, &self.linear_b_g)?;
        // Both operands as [B, C, I, K] so that x = a bᵀ is [B, C, I, J].
        let (a, b) = match self.edge {
            TriangleEdge::Outgoing => (a.permute((0, 3, 1, 2))?, b.permute((0, 3, 1, 2))?),
            TriangleEdge::Incoming => (a.permute((0, 3, 2, 1))?, b.permute((0, 3, 2, 1))?),
        };
        let x = a
            .contiguous()?
            .matmul(&b.transpose(2, 3)?.contiguous()?)?
            .permute((0, 2, 3, 1))?;
        let x = self.linear_z.forward(&self.layer_norm_out.forward(&x)?)?;
        x.mul(&candle_nn::ops::sigmoid(&self.linear_g.forward(&z)?)?)
    }
}

#[derive(Clone, Debug)]
pub struct TriangleAttention {
    layer_norm: LayerNorm,
    linear: Linear,
    mha: Attention,
    edge: TriangleEdge,
    inf: f64,
}

impl TriangleAttention {
    pub fn load(
        vb: VarBuilder,
        c_in: usize,
        c_hidden: usize,
        no_heads: usize,
        edge: TriangleEdge,
        inf: f64,
        kernels: KernelBackend,
    ) -> Result<Self> {
        Ok(Self {
            layer_norm: LayerNorm::load(vb.pp("layer_norm"), c_in, kernels)?,
            linear: Linear::load(vb.pp("linear"), c_in, no_heads, false, LinearInit::Default)?,
            mha: Attention::load(vb.pp("mha"), c_in, c_in, c_hidden, no_heads, true, kernels)?,
            edge,
            inf,
        })
    }

    /// `x [B, N, N, C]`, `mask [B, N, N]`.
    pub fn forward(&self, x: &Tensor, mask: &Tensor, mode: &ExecutionMode) -> Result<Tensor> {
        let (x, mask) = match self.edge {
            TriangleEdge::Outgoing => (x.clone(), mask.clone()),
            TriangleEdge::Incoming => (swap_rows_cols(x)?, mask.transpose(1, 2)?.contiguous()?),
        };
        let x = self.layer_norm.forward(&x)?;
        // [B, I, 1, 1, J]
        let mask_bias = mask_bias(&mask, self.inf)?.unsqueeze(2)?.unsqueeze(3)?;
        // [B, 1, H, I, J]
        let triangle_bias = self
            .linear
            .forward(&x)?
            .permute((0, 3, 1, 2))?
            .contiguous()?
            .unsqueeze(1)?;
        let out = self.mha.forward(&x, &x, &[mask_bias, triangle_bias], mode)?;
        match self.edge {
            TriangleEdge::Outgoing => Ok(out),
            TriangleEdge::Incoming => swap_rows_cols(&out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_incoming_is_outgoing_on_transpose() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let out_mul = TriangleMultiplication::load(vb.pp("m"), 4, 3, TriangleEdge::Outgoing, KernelBackend::Reference)?;
        let out_att = TriangleAttention::load(vb.pp("a"), 4, 2, 2, TriangleEdge::Outgoing, 1e9, KernelBackend::Reference)?;
        crate::weights::reseed(&varmap, 1)?;
        let in_mul = TriangleMultiplication {
            edge: TriangleEdge::Incoming,
            ..out_mul.clone()
        };
        let in_att = TriangleAttention {
            edge: TriangleEdge::Incoming,
            ..out_att.clone()
        };
        let z = Tensor::randn(0f32, 1.0, (1, 5, 5, 4), &device)?;
        let mask = Tensor::ones((1, 5, 5), DType::F32, &device)?;
        let z_t = swap_rows_cols(&z)?;
        let mode = ExecutionMode::default();

        // Incoming sums a_ki b_kj; on the transpose the outgoing update sums a_kj b_ki, so
        // the two projections trade places.
        let out_mul_ba = TriangleMultiplication {
            linear_a_p: out_mul.linear_b_p.clone(),
            linear_a_g: out_mul.linear_b_g.clone(),
            linear_b_p: out_mul.linear_a_p.clone(),
            linear_b_g: out_mul.linear_a_g.clone(),
            ..out_mul.clone()
        };
        let a = in_mul.forward(&z, &mask)?;
        let b = swap_rows_cols(&out_mul_ba.forward(&z_t, &mask)?)?;
        assert!((&a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()? < 1e-5);
        let unswapped = swap_rows_cols(&out_mul.forward(&z_t, &mask)?)?;
        assert!((a - unswapped)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()? > 1e-4);

        let a = in_att.forward(&z, &mask, &mode)?;
        let b = swap_rows_cols(&out_att.forward(&z_t, &mask, &mode)?)?;
        assert!((a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()? < 1e-5);
        Ok(())
    }

    #[test]
    fn test_incoming_matches_explicit_sum() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let tri = TriangleMultiplication::load(vb, 4, 3, TriangleEdge::Incoming, KernelBackend::Reference)?;
        crate::weights::reseed(&varmap, 2)?;
        let n = 4;
        let z = Tensor::randn(0f32, 1.0, (1, n, n, 4), &device)?;
        let mask = Tensor::ones((1, n, n), DType::F32, &device)?;
        let got = tri.forward(&z, &mask)?;

        let zn = tri.layer_norm_in.forward(&z)?;
        let gated = |p: &Linear, g: &Linear| -> anyhow::Result<Vec<Vec<Vec<f32>>>> {
            let t = candle_nn::ops::sigmoid(&g.forward(&zn)?)?.mul(&p.forward(&zn)?)?;
            Ok(t.squeeze(0)?.to_vec3::<f32>()?)
        };
        let a = gated(&tri.linear_a_p, &tri.linear_a_g)?;
        let b = gated(&tri.linear_b_p, &tri.linear_b_g)?;
        let mut x = vec![0f32; n * n * 3];
        for i in 0..n {
            for j in 0..n {
                for c in 0..3 {
                    x[(i * n + j) * 3 + c] = (0..n).map(|k| a[k][i][c] * b[k][j][c]).sum();
                }
            }
        }
        let x = Tensor::from_vec(x, (1, n, n, 3), &device)?;
        let want = tri
            .linear_z
            .forward(&tri.layer_norm_out.forward(&x)?)?
            .mul(&candle_nn::ops::sigmoid(&tri.linear_g.forward(&zn)?)?)?;
        assert!((got - want)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()? < 1e-4);
        Ok(())
    }

    #[test]
    fn test_final_init_update_is_zero() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let tri = TriangleMultiplication::load(vb, 4, 3, TriangleEdge::Outgoing, KernelBackend::Fused)?;
        let z = Tensor::randn(0f32, 1.0, (1, 3, 3, 4), &device)?;
        let mask = Tensor::ones((1, 3, 3), DType::F32, &device)?;
        let total = tri.forward(&z, &mask)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(total, 0.0);
        Ok(())
    }
}
