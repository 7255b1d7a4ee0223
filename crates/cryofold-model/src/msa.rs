//! MSA-track updates: row attention with pair bias, column attention, global column attention
//! and the outer-product mean that writes the MSA into the pair representation.
use crate::execution::ExecutionMode;
use crate::primitives::attention::{Attention, GlobalAttention};
use crate::primitives::kernels::KernelBackend;
use crate::primitives::{mask_bias, swap_rows_cols, LayerNorm, Linear, LinearInit};
use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

/// Row-wise gated self-attention over `[*, S, N, C_m]`, optionally biased by the pair track.
#[derive(Clone, Debug)]
pub struct MsaRowAttention {
    layer_norm_m: LayerNorm,
    pair_bias: Option<(LayerNorm, Linear)>,
    mha: Attention,
    no_heads: usize,
    inf: f64,
}

impl MsaRowAttention {
    pub fn load(
        vb: VarBuilder,
        c_m: usize,
        c_z: Option<usize>,
        c_hidden: usize,
        no_heads: usize,
        inf: f64,
        kernels: KernelBackend,
    ) -> Result<Self> {
        let pair_bias = match c_z {
            Some(c_z) => Some((
                LayerNorm::load(vb.pp("layer_norm_z"), c_z, kernels)?,
                Linear::load(vb.pp("linear_z"), c_z, no_heads, false, LinearInit::Default)?,
            )),
            None => None,
        };
        Ok(Self {
            layer_norm_m: LayerNorm::load(vb.pp("layer_norm_m"), c_m, kernels)?,
            pair_bias,
            mha: Attention::load(vb.pp("mha"), c_m, c_m, c_hidden, no_heads, true, kernels)?,
            no_heads,
            inf,
        })
    }

    /// `m [B, S, N, C_m]`, `z [B, N, N, C_z]`, `mask [B, S, N]`.
    pub fn forward(&self, m: &Tensor, z: Option<&Tensor>, mask: &Tensor, mode: &ExecutionMode) -> Result<Tensor> {
        let m = self.layer_norm_m.forward(m)?;
        // [B, S, 1, 1, N]
        let mut biases = vec![mask_bias(mask, self.inf)?.unsqueeze(2)?.unsqueeze(3)?];
        if let (Some((ln, linear)), Some(z)) = (&self.pair_bias, z) {
            // [B, N, N, H] -> [B, 1, H, N, N]
            let zb = linear.forward(&ln.forward(z)?)?;
            debug_assert_eq!(zb.dim(3)?, self.no_heads);
            biases.push(zb.permute((0, 3, 1, 2))?.contiguous()?.unsqueeze(1)?);
        }
        self.mha.forward(&m, &m, &biases, mode)
    }
}

/// Column-wise gated self-attention: row attention on the transposed MSA.
#[derive(Clone, Debug)]
pub struct MsaColumnAttention {
    inner: MsaRowAttention,
}

impl MsaColumnAttention {
    pub fn load(vb: VarBuilder, c_m: usize, c_hidden: usize, no_heads: usize, inf: f64, kernels: KernelBackend) -> Result<Self> {
        Ok(Self {
            inner: MsaRowAttention::load(vb, c_m, None, c_hidden, no_heads, inf, kernels)?,
        })
    }

    pub fn forward(&self, m: &Tensor, mask: &Tensor, mode: &ExecutionMode) -> Result<Tensor> {
        let m_t = swap_rows_cols(m)?;
        let mask_t = mask.transpose(1, 2)?.contiguous()?;
        swap_rows_cols(&self.inner.forward(&m_t, None, &mask_t, mode)?)
    }
}

/// Column attention with one mask-averaged query per column, for the deep extra MSA.
#[derive(Clone, Debug)]
pub struct MsaColumnGlobalAttention {
    layer_norm_m: LayerNorm,
    global_attention: GlobalAttention,
}

impl MsaColumnGlobalAttention {
    pub fn load(
        vb: VarBuilder,
        c_m: usize,
        c_hidden: usize,
        no_heads: usize,
        inf: f64,
        eps: f64,
        kernels: KernelBackend,
    ) -> Result<Self> {
        Ok(Self {
            layer_norm_m: LayerNorm::load(vb.pp("layer_norm_m"), c_m, kernels)?,
            global_attention: GlobalAttention::load(vb.pp("global_attention"), c_m, c_hidden, no_heads, inf, eps, kernels)?,
        })
    }

    pub fn forward(&self, m: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let m_t = swap_rows_cols(m)?;
        let mask_t = mask.transpose(1, 2)?.contiguous()?;
        let m_t = self.layer_norm_m.forward(&m_t)?;
        swap_rows_cols(&self.global_attention.forward(&m_t, &mask_t)?)
    }
}

/// Pair update from the mean outer product of two MSA projections over the sequence axis.
#[derive(Clone, Debug)]
pub struct OuterProductMean {
    layer_norm: LayerNorm,
    linear_1: Linear,
    linear_2: Linear,
    linear_out: Linear,
    c_hidden: usize,
    eps: f64,
}

impl OuterProductMean {
    pub fn load(vb: VarBuilder, c_m: usize, c_z: usize, c_hidden: usize, kernels: KernelBackend) -> Result<Self> {
        Ok(Self {
            layer_norm: LayerNorm::load(vb.pp("layer_norm"), c_m, kernels)?,
            linear_1: Linear::new(vb.pp("linear_1"), c_m, c_hidden, LinearInit::Default)?,
            linear_2: Linear::new(vb.pp("linear_2"), c_m, c_hidden, LinearInit::Default)?,
            linear_out: Linear::new(vb.pp("linear_out"), c_hidden * c_hidden, c_z, LinearInit::Final)?,
            c_hidden,
            eps: 1e-3,
        })
    }

    /// `m [B, S, N, C_m]`, `mask [B, S, N]` to `[B, N, N, C_z]`.
    pub fn forward(&self, m: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let (b, s, n, _) = m.dims4()?;
        let c = self.c_hidden;
        let ln = self.layer_norm.forward(m)?;
        let mask_e = mask.unsqueeze(3)?;
        let a = self.linear_1.forward(&ln)?.broadcast_mul(&mask_e)?;
        let bb = self.linear_2.forward(&ln)?.broadcast_mul(&mask_e)?;
        // [B, N*C, S] x [B, S, N*C]
        let a = a.reshape((b, s, n * c))?.transpose(1, 2)?.contiguous()?;
        let bb = bb.reshape((b, s, n * c))?;
        let outer = a.matmul(&bb)?;
        // [B, N, C, N, C] -> [B, N, N, C*C]
        let outer = outer
            .reshape((b, n, c, n, c))?
            .permute((0, 1, 3, 2, 4))?
            .contiguous()?
            .reshape((b, n, n, c * c))?;
        let outer = self.linear_out.forward(&outer)?;
        // [B, N, N]
        let m_t = mask.transpose(1, 2)?.contiguous()?;
        let norm = m_t.matmul(mask)?.unsqueeze(3)?;
        outer.broadcast_div(&(norm + self.eps)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_outer_product_mean_matches_loop() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let opm = OuterProductMean::load(vb, 4, 3, 2, KernelBackend::Reference)?;
        crate::weights::reseed(&varmap, 5)?;
        let m = Tensor::randn(0f32, 1.0, (1, 3, 4, 4), &device)?;
        let mask = Tensor::ones((1, 3, 4), DType::F32, &device)?;
        let out = opm.forward(&m, &mask)?;
        assert_eq!(out.dims(), &[1, 4, 4, 3]);

        // Residue pair (1, 2) computed directly.
        let ln = opm.layer_norm.forward(&m)?;
        let a = opm.linear_1.forward(&ln)?.squeeze(0)?.to_vec3::<f32>()?;
        let b = opm.linear_2.forward(&ln)?.squeeze(0)?.to_vec3::<f32>()?;
        let mut flat = vec![0f32; 4];
        for s in 0..3 {
            for p in 0..2 {
                for q in 0..2 {
                    flat[p * 2 + q] += a[s][1][p] * b[s][2][q];
                }
            }
        }
        let flat = Tensor::new(flat, &device)?.unsqueeze(0)?;
        let expected = (opm.linear_out.forward(&flat)? / (3.0 + 1e-3))?.squeeze(0)?;
        let got = out.squeeze(0)?.get(1)?.get(2)?;
        let diff = (expected - got)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-4);
        Ok(())
    }

    #[test]
    fn test_row_attention_ignores_masked_sequences() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let att = MsaRowAttention::load(vb, 4, Some(3), 2, 2, 1e9, KernelBackend::Reference)?;
        crate::weights::reseed(&varmap, 9)?;
        let m = Tensor::randn(0f32, 1.0, (1, 2, 5, 4), &device)?;
        let z = Tensor::randn(0f32, 1.0, (1, 5, 5, 3), &device)?;
        let mask = Tensor::new(&[[[1f32, 1.0, 1.0, 0.0, 0.0], [1.0, 1.0, 1.0, 1.0, 1.0]]], &device)?;
        let out = att.forward(&m, Some(&z), &mask, &ExecutionMode::default())?;
        // Perturbing a masked key leaves the first row's outputs unchanged.
        let noise = Tensor::zeros((1, 2, 5, 4), DType::F32, &device)?
            .slice_assign(&[0..1, 0..1, 4..5, 0..4], &Tensor::ones((1, 1, 1, 4), DType::F32, &device)?)?;
        let out2 = att.forward(&(m + noise)?, Some(&z), &mask, &ExecutionMode::default())?;
        let d = (out.narrow(1, 0, 1)?.narrow(2, 0, 4)? - out2.narrow(1, 0, 1)?.narrow(2, 0, 4)?)?
            .abs()?
            .sum_all()?
            .to_scalar::<f32>()?;
        assert!(d < 1e-5);
        Ok(())
    }
}
