//! Accelerated primitives behind one interface.
//!
//! [`Reference`] composes plain candle ops; [`Fused`] dispatches to candle-nn's custom
//! layer-norm and softmax kernels. The backend is chosen once, from `globals.kernels`,
//! when the model is built.
use super::batched_matmul;
use candle_core::{Result, Tensor, D};
use serde::{Deserialize, Serialize};

/// Keys per chunk in the low-memory attention path.
pub const LMA_KV_CHUNK_SIZE: usize = 4096;

pub trait Kernels: std::fmt::Debug + Send + Sync {
    /// Normalises the last axis of `x` and applies the affine `w`, `b`.
    fn layer_norm(&self, x: &Tensor, w: &Tensor, b: &Tensor, eps: f64) -> Result<Tensor>;

    fn softmax_last_dim(&self, x: &Tensor) -> Result<Tensor>;

    /// `softmax(q kᵀ + Σ biases) v` over `[*, H, Q, C]` queries and `[*, H, K, C]` keys/values.
    /// Queries are expected to be pre-scaled.
    fn attention(&self, q: &Tensor, k: &Tensor, v: &Tensor, biases: &[&Tensor]) -> Result<Tensor> {
        let mut a = batched_matmul(q, &k.transpose(D::Minus2, D::Minus1)?)?;
        for b in biases {
            a = a.broadcast_add(b)?;
        }
        let a = self.softmax_last_dim(&a)?;
        batched_matmul(&a, v)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Reference;

#[derive(Clone, Copy, Debug, Default)]
pub struct Fused;

impl Kernels for Reference {
    fn layer_norm(&self, x: &Tensor, w: &Tensor, b: &Tensor, eps: f64) -> Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let x = x.broadcast_sub(&mean)?;
        let var = x.sqr()?.mean_keepdim(D::Minus1)?;
        x.broadcast_div(&(var + eps)?.sqrt()?)?
            .broadcast_mul(w)?
            .broadcast_add(b)
    }

    fn softmax_last_dim(&self, x: &Tensor) -> Result<Tensor> {
        let max = x.max_keepdim(D::Minus1)?;
        let e = x.broadcast_sub(&max)?.exp()?;
        e.broadcast_div(&e.sum_keepdim(D::Minus1)?)
    }
}

impl Kernels for Fused {
    fn layer_norm(&self, x: &Tensor, w: &Tensor, b: &Tensor, eps: f64) -> Result<Tensor> {
        candle_nn::ops::layer_norm(&x.contiguous()?, w, b, eps as f32)
    }

    fn softmax_last_dim(&self, x: &Tensor) -> Result<Tensor> {
        candle_nn::ops::softmax_last_dim(&x.contiguous()?)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum KernelBackend {
    #[default]
    Reference,
    Fused,
}

impl KernelBackend {
    pub fn kernels(self) -> &'static dyn Kernels {
        match self {
            KernelBackend::Reference => &Reference,
            KernelBackend::Fused => &Fused,
        }
    }
}

/// Whether a flash-attention kernel is compiled into this build.
pub fn flash_attention_available() -> bool {
    false
}

/// Attention with keys processed `kv_chunk` at a time and a running log-sum-exp, so the full
/// `[*, H, Q, K]` logit tensor is never materialised.
///
/// Biases must broadcast against `[*, H, Q, K]`; their last axis is either `K` or 1.
pub fn low_memory_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    biases: &[&Tensor],
    kv_chunk: usize,
) -> Result<Tensor> {
    let n_keys = k.dim(D::Minus2)?;
    let kv_chunk = kv_chunk.max(1);
    let q = q.contiguous()?;
    let mut state: Option<(Tensor, Tensor, Tensor)> = None;
    let mut start = 0;
    while start < n_keys {
        let len = kv_chunk.min(n_keys - start);
        let k_c = k.narrow(D::Minus2, start, len)?.contiguous()?;
        let v_c = v.narrow(D::Minus2, start, len)?.contiguous()?;
        let mut a = batched_matmul(&q, &k_c.transpose(D::Minus2, D::Minus1)?)?;
        for b in biases {
            let b = if b.dim(D::Minus1)? == 1 {
                (*b).clone()
            } else {
                b.narrow(D::Minus1, start, len)?
            };
            a = a.broadcast_add(&b)?;
        }
        let max_c = a.max_keepdim(D::Minus1)?;
        let exp_a = a.broadcast_sub(&max_c)?.exp()?;
        let sum_c = exp_a.sum_keepdim(D::Minus1)?;
        let out_c = batched_matmul(&exp_a, &v_c)?;
        state = Some(match state {
            None => (max_c, sum_c, out_c),
            Some((max, sum, out)) => {
                let new_max = max.maximum(&max_c)?;
                let alpha = (max - &new_max)?.exp()?;
                let beta = (max_c - &new_max)?.exp()?;
                let sum = ((sum * &alpha)? + (sum_c * &beta)?)?;
                let out = (out.broadcast_mul(&alpha)? + out_c.broadcast_mul(&beta)?)?;
                (new_max, sum, out)
            }
        });
        start += len;
    }
    match state {
        Some((_, sum, out)) => out.broadcast_div(&sum),
        None => candle_core::bail!("attention over zero keys"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> anyhow::Result<f32> {
        Ok((a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
    }

    #[test]
    fn test_backends_agree() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (2, 5, 16), &device)?;
        let w = Tensor::randn(1f32, 0.1, 16, &device)?;
        let b = Tensor::randn(0f32, 0.1, 16, &device)?;
        let r = Reference.layer_norm(&x, &w, &b, 1e-5)?;
        let f = Fused.layer_norm(&x, &w, &b, 1e-5)?;
        assert!(max_abs_diff(&r, &f)? < 1e-4);

        let r = Reference.softmax_last_dim(&x)?;
        let f = Fused.softmax_last_dim(&x)?;
        assert!(max_abs_diff(&r, &f)? < 1e-4);
        Ok(())
    }

    #[test]
    fn test_low_memory_attention_matches_reference() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let q = Tensor::randn(0f32, 1.0, (2, 3, 7, 4), &device)?;
        let k = Tensor::randn(0f32, 1.0, (2, 3, 11, 4), &device)?;
        let v = Tensor::randn(0f32, 1.0, (2, 3, 11, 4), &device)?;
        let pair_bias = Tensor::randn(0f32, 1.0, (2, 3, 7, 11), &device)?;
        let mask_bias = Tensor::randn(0f32, 1.0, (2, 1, 1, 11), &device)?;
        let biases = [&pair_bias, &mask_bias];
        let reference = Reference.attention(&q, &k, &v, &biases)?;
        let lma = low_memory_attention(&q, &k, &v, &biases, 3)?;
        assert_eq!(lma.dims(), &[2, 3, 7, 4]);
        assert!(max_abs_diff(&reference, &lma)? < 1e-4);
        Ok(())
    }

    #[test]
    fn test_attention_over_msa_shaped_inputs() -> anyhow::Result<()> {
        // [B, S, H, Q, C], as produced by MSA row and triangle attention.
        let device = Device::Cpu;
        let q = Tensor::randn(0f32, 1.0, (1, 8, 2, 8, 4), &device)?;
        let k = Tensor::randn(0f32, 1.0, (1, 8, 2, 8, 4), &device)?;
        let v = Tensor::randn(0f32, 1.0, (1, 8, 2, 8, 4), &device)?;
        let bias = Tensor::randn(0f32, 1.0, (1, 1, 2, 8, 8), &device)?;
        let out = Reference.attention(&q, &k, &v, &[&bias])?;
        assert_eq!(out.dims(), &[1, 8, 2, 8, 4]);
        let fused = Fused.attention(&q, &k, &v, &[&bias])?;
        assert!(max_abs_diff(&out, &fused)? < 1e-4);
        let lma = low_memory_attention(&q, &k, &v, &[&bias], 3)?;
        assert!(max_abs_diff(&out, &lma)? < 1e-4);

        // One slice against a rank-3 computation.
        let slice = |t: &Tensor| -> anyhow::Result<Tensor> { Ok(t.get(0)?.get(3)?) };
        let expected = Reference.attention(&slice(&q)?, &slice(&k)?, &slice(&v)?, &[&bias.get(0)?.get(0)?])?;
        assert!(max_abs_diff(&slice(&out)?, &expected)? < 1e-5);
        Ok(())
    }
}
