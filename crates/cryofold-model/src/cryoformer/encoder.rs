//! Density encoder built on additive (linear-time) self-attention.
use crate::config::{Activation, CryoformerLayersConfig};
use crate::primitives::kernels::KernelBackend;
use crate::primitives::{mask_bias, merge_heads, split_heads, LayerNorm, Linear, LinearInit};
use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

/// Additive attention: the queries are pooled into one global query, which modulates the keys;
/// the keys are pooled in turn and modulate every query.
#[derive(Clone, Debug)]
pub struct FastSelfAttention {
    query: Linear,
    query_att: Linear,
    key: Linear,
    key_att: Linear,
    transform: Linear,
    no_heads: usize,
    head_dim: usize,
    inf: f64,
}

impl FastSelfAttention {
    pub fn load(vb: VarBuilder, hidden: usize, no_heads: usize, inf: f64) -> Result<Self> {
        Ok(Self {
            query: Linear::new(vb.pp("query"), hidden, hidden, LinearInit::Small)?,
            query_att: Linear::new(vb.pp("query_att"), hidden, no_heads, LinearInit::Small)?,
            key: Linear::new(vb.pp("key"), hidden, hidden, LinearInit::Small)?,
            key_att: Linear::new(vb.pp("key_att"), hidden, no_heads, LinearInit::Small)?,
            transform: Linear::new(vb.pp("transform"), hidden, hidden, LinearInit::Small)?,
            no_heads,
            head_dim: hidden / no_heads,
            inf,
        })
    }

    /// Softmax over tokens of a `[B, V, H]` score, returned as `[B, H, 1, V]` weights.
    fn pool_weights(&self, score: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
        let score = (score / (self.head_dim as f64).sqrt())?.transpose(1, 2)?;
        let score = match bias {
            Some(b) => score.broadcast_add(&b.unsqueeze(1)?)?,
            None => score,
        };
        candle_nn::ops::softmax_last_dim(&score.contiguous()?)?.unsqueeze(2)
    }

    /// `x [B, V, C]`, `mask [B, V]`.
    pub fn forward(&self, x: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let bias = mask.map(|m| mask_bias(m, self.inf)).transpose()?;
        let mixed_q = self.query.forward(x)?;
        let mixed_k = self.key.forward(x)?;

        let q_weight = self.pool_weights(&self.query_att.forward(&mixed_q)?, bias.as_ref())?;
        // [B, H, V, d]
        let q = split_heads(&mixed_q, self.no_heads)?;
        // [B, H, 1, d]
        let pooled_q = q_weight.matmul(&q)?;

        let mixed_qk = split_heads(&mixed_k, self.no_heads)?.broadcast_mul(&pooled_q)?;
        let mixed_qk_flat = merge_heads(&mixed_qk)?;
        let k_weight = self.pool_weights(&self.key_att.forward(&mixed_qk_flat)?, bias.as_ref())?;
        let pooled_k = k_weight.matmul(&mixed_qk)?;

        let weighted = merge_heads(&q.broadcast_mul(&pooled_k)?)?;
        debug_assert_eq!(weighted.dim(2)?, self.no_heads * self.head_dim);
        self.transform.forward(&weighted)? + mixed_q
    }
}

impl Activation {
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Activation::Relu => x.relu(),
            Activation::Gelu => x.gelu_erf(),
        }
    }
}

/// `Linear -> activation -> Linear`, the feed-forward half of every density transformer layer.
#[derive(Clone, Debug)]
pub(crate) struct FeedForward {
    linear1: Linear,
    linear2: Linear,
    activation: Activation,
}

impl FeedForward {
    pub(crate) fn load(vb: &VarBuilder, d_model: usize, cfg: &CryoformerLayersConfig) -> Result<Self> {
        Ok(Self {
            linear1: Linear::new(vb.pp("linear1"), d_model, cfg.dim_feedforward, LinearInit::Glorot)?,
            linear2: Linear::new(vb.pp("linear2"), cfg.dim_feedforward, d_model, LinearInit::Glorot)?,
            activation: cfg.activation,
        })
    }

    pub(crate) fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.linear2
            .forward(&self.activation.forward(&self.linear1.forward(x)?)?)
    }
}

#[derive(Clone, Debug)]
pub struct CryoformerEncoderLayer {
    self_attn: FastSelfAttention,
    norm0: LayerNorm,
    norm1: LayerNorm,
    norm2: LayerNorm,
    ffn: FeedForward,
}

impl CryoformerEncoderLayer {
    pub fn load(vb: VarBuilder, d_model: usize, cfg: &CryoformerLayersConfig, inf: f64, kernels: KernelBackend) -> Result<Self> {
        Ok(Self {
            self_attn: FastSelfAttention::load(vb.pp("self_attn"), d_model, cfg.no_heads, inf)?,
            norm0: LayerNorm::load(vb.pp("norm0"), d_model, kernels)?,
            norm1: LayerNorm::load(vb.pp("norm1"), d_model, kernels)?,
            norm2: LayerNorm::load(vb.pp("norm2"), d_model, kernels)?,
            ffn: FeedForward::load(&vb, d_model, cfg)?,
        })
    }

    /// `src [B, V, C]`, `mask [B, V]`, `pos [B, V, C]`.
    pub fn forward(&self, src: &Tensor, mask: Option<&Tensor>, pos: &Tensor) -> Result<Tensor> {
        let q = src.broadcast_add(pos)?;
        let src2 = self.norm0.forward(&self.self_attn.forward(&q, mask)?)?;
        let src = self.norm1.forward(&(src + src2)?)?;
        let src2 = self.ffn.forward(&src)?;
        self.norm2.forward(&(src + src2)?)
    }
}

/// Stack of [`CryoformerEncoderLayer`]s over the density tokens.
#[derive(Clone, Debug)]
pub struct CryoformerEncoder {
    layers: Vec<CryoformerEncoderLayer>,
}

impl CryoformerEncoder {
    pub fn load(vb: VarBuilder, d_model: usize, cfg: &CryoformerLayersConfig, inf: f64, kernels: KernelBackend) -> Result<Self> {
        let layers = (0..cfg.no_blocks)
            .map(|i| CryoformerEncoderLayer::load(vb.pp(format!("layers.{i}")), d_model, cfg, inf, kernels))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }

    #[tracing::instrument(level = "debug", skip_all, fields(layers = self.layers.len()))]
    pub fn forward(&self, src: &Tensor, mask: Option<&Tensor>, pos: &Tensor) -> Result<Tensor> {
        let mut out = src.clone();
        for layer in &self.layers {
            out = layer.forward(&out, mask, pos)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn max_diff(a: &Tensor, b: &Tensor) -> anyhow::Result<f32> {
        Ok((a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
    }

    #[test]
    fn test_all_ones_mask_equals_no_mask() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let cfg = CryoformerLayersConfig {
            no_heads: 2,
            no_blocks: 2,
            dim_feedforward: 8,
            ..CryoformerLayersConfig::default()
        };
        let enc = CryoformerEncoder::load(vb, 6, &cfg, 1e9, KernelBackend::Reference)?;
        let src = Tensor::randn(0f32, 1.0, (1, 10, 6), &device)?;
        let pos = Tensor::randn(0f32, 1.0, (1, 10, 6), &device)?;
        let ones = Tensor::ones((1, 10), DType::F32, &device)?;
        let a = enc.forward(&src, None, &pos)?;
        let b = enc.forward(&src, Some(&ones), &pos)?;
        assert_eq!(a.dims(), &[1, 10, 6]);
        assert!(max_diff(&a, &b)? < 1e-6);
        Ok(())
    }

    #[test]
    fn test_masked_tokens_do_not_leak() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let att = FastSelfAttention::load(vb, 4, 2, 1e9)?;
        let x = Tensor::randn(0f32, 1.0, (1, 5, 4), &device)?;
        let mask = Tensor::new(&[[1f32, 1.0, 1.0, 0.0, 0.0]], &device)?;
        let a = att.forward(&x, Some(&mask))?;
        let noise = Tensor::zeros((1, 5, 4), DType::F32, &device)?
            .slice_assign(&[0..1, 4..5, 0..4], &Tensor::full(3f32, (1, 1, 4), &device)?)?;
        let b = att.forward(&(x + noise)?, Some(&mask))?;
        assert!(max_diff(&a.narrow(1, 0, 3)?, &b.narrow(1, 0, 3)?)? < 1e-5);
        Ok(())
    }
}
