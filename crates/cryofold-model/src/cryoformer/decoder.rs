//! Residue decoder: single-representation queries attending over the encoded density.
use super::encoder::FeedForward;
use crate::config::CryoformerLayersConfig;
use crate::primitives::kernels::KernelBackend;
use crate::primitives::{merge_heads, split_heads, LayerNorm, Linear, LinearInit};
use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

/// Multiplier applied to the pooled density before it biases the co-attention logits.
pub const DENSITY_BIAS_SCALE: f64 = 8.0;

/// Plain multi-head attention with biased input and output projections.
#[derive(Clone, Debug)]
pub struct MultiheadAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    no_heads: usize,
    kernels: KernelBackend,
}

impl MultiheadAttention {
    pub fn load(vb: VarBuilder, d_model: usize, no_heads: usize, kernels: KernelBackend) -> Result<Self> {
        Ok(Self {
            q_proj: Linear::new(vb.pp("q_proj"), d_model, d_model, LinearInit::Glorot)?,
            k_proj: Linear::new(vb.pp("k_proj"), d_model, d_model, LinearInit::Glorot)?,
            v_proj: Linear::new(vb.pp("v_proj"), d_model, d_model, LinearInit::Glorot)?,
            out_proj: Linear::new(vb.pp("out_proj"), d_model, d_model, LinearInit::Glorot)?,
            no_heads,
            kernels,
        })
    }

    /// `query [B, Q, C]`, `key`/`value [B, K, C]`, `key_bias [B, K]` added to every head's
    /// logits.
    pub fn forward(&self, query: &Tensor, key: &Tensor, value: &Tensor, key_bias: Option<&Tensor>) -> Result<Tensor> {
        let q = split_heads(&self.q_proj.forward(query)?, self.no_heads)?;
        let scale = 1.0 / (q.dim(3)? as f64).sqrt();
        let q = (q * scale)?;
        let k = split_heads(&self.k_proj.forward(key)?, self.no_heads)?;
        let v = split_heads(&self.v_proj.forward(value)?, self.no_heads)?;
        // [B, 1, 1, K]
        let biases = key_bias
            .map(|b| b.unsqueeze(1)?.unsqueeze(1))
            .transpose()?;
        let bias_refs: Vec<&Tensor> = biases.iter().collect();
        let o = self.kernels.kernels().attention(&q, &k, &v, &bias_refs)?;
        self.out_proj.forward(&merge_heads(&o)?)
    }
}

/// Encoded density handed to every decoder layer.
#[derive(Clone, Copy, Debug)]
pub struct DensityMemory<'a> {
    /// `[B, V, C]`
    pub repr: &'a Tensor,
    /// `[B, V, C]`
    pub pos: &'a Tensor,
    /// `[B, V]` max-pooled density.
    pub wei: &'a Tensor,
}

#[derive(Clone, Debug)]
pub struct CryoformerDecoderLayer {
    msa_to_single: Linear,
    pair_to_single: Linear,
    norm_ms: LayerNorm,
    norm_ps: LayerNorm,
    norm0: LayerNorm,
    self_attn: MultiheadAttention,
    norm1: LayerNorm,
    multihead_attn: MultiheadAttention,
    norm2: LayerNorm,
    ffn: FeedForward,
    norm3: LayerNorm,
}

impl CryoformerDecoderLayer {
    pub fn load(
        vb: VarBuilder,
        d_model: usize,
        c_m: usize,
        c_z: usize,
        cfg: &CryoformerLayersConfig,
        kernels: KernelBackend,
    ) -> Result<Self> {
        let norm = |name: &str| LayerNorm::load(vb.pp(name), d_model, kernels);
        Ok(Self {
            msa_to_single: Linear::new(vb.pp("msa_to_single"), c_m, d_model, LinearInit::Glorot)?,
            pair_to_single: Linear::new(vb.pp("pair_to_single"), c_z, d_model, LinearInit::Glorot)?,
            norm_ms: norm("norm_ms")?,
            norm_ps: norm("norm_ps")?,
            norm0: norm("norm0")?,
            self_attn: MultiheadAttention::load(vb.pp("self_attn"), d_model, cfg.no_heads, kernels)?,
            norm1: norm("norm1")?,
            multihead_attn: MultiheadAttention::load(vb.pp("multihead_attn"), d_model, cfg.no_heads, kernels)?,
            norm2: norm("norm2")?,
            ffn: FeedForward::load(&vb, d_model, cfg)?,
            norm3: norm("norm3")?,
        })
    }

    /// `tgt`/`query_pos [B, N, C]`, `msa [B, S, N, C_m]`, `pair [B, N, N, C_z]`.
    pub fn forward(
        &self,
        tgt: &Tensor,
        msa: &Tensor,
        pair: &Tensor,
        query_pos: &Tensor,
        memory: DensityMemory<'_>,
    ) -> Result<Tensor> {
        let from_msa = self.msa_to_single.forward(&msa.narrow(1, 0, 1)?.squeeze(1)?)?;
        let ms = self.norm_ms.forward(&(tgt + from_msa)?)?;
        let from_pair = self.pair_to_single.forward(&pair.mean(2)?)?;
        let ps = self.norm_ps.forward(&(tgt + from_pair)?)?;
        let tgt = self.norm0.forward(&(ms + ps)?)?;

        let q = (&tgt + query_pos)?;
        let tgt2 = self.self_attn.forward(&q, &q, &tgt, None)?;
        let tgt = self.norm1.forward(&(tgt + tgt2)?)?;

        let query = (&tgt + query_pos)?;
        let key = (memory.repr + memory.pos)?;
        let density_bias = (memory.wei * DENSITY_BIAS_SCALE)?;
        let tgt2 = self
            .multihead_attn
            .forward(&query, &key, memory.repr, Some(&density_bias))?;
        let tgt = self.norm2.forward(&(tgt + tgt2)?)?;

        let tgt2 = self.ffn.forward(&tgt)?;
        self.norm3.forward(&(tgt + tgt2)?)
    }
}

/// Stack of [`CryoformerDecoderLayer`]s with a shared output norm.
#[derive(Clone, Debug)]
pub struct CryoformerDecoder {
    layers: Vec<CryoformerDecoderLayer>,
    norm: LayerNorm,
    return_intermediate: bool,
}

impl CryoformerDecoder {
    pub fn load(
        vb: VarBuilder,
        d_model: usize,
        c_m: usize,
        c_z: usize,
        cfg: &CryoformerLayersConfig,
        kernels: KernelBackend,
    ) -> Result<Self> {
        let layers = (0..cfg.no_blocks)
            .map(|i| CryoformerDecoderLayer::load(vb.pp(format!("layers.{i}")), d_model, c_m, c_z, cfg, kernels))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            layers,
            norm: LayerNorm::load(vb.pp("norm"), d_model, kernels)?,
            return_intermediate: cfg.return_intermediate,
        })
    }

    /// Number of stacked outputs [`Self::forward`] returns.
    pub fn depth(&self) -> usize {
        if self.return_intermediate {
            self.layers.len()
        } else {
            1
        }
    }

    /// Returns `[L, B, N, C]`: the normalised output of every layer with `return_intermediate`,
    /// otherwise only the last one (`L = 1`). The input single representation is the query
    /// position for every layer.
    #[tracing::instrument(level = "debug", skip_all, fields(layers = self.layers.len()))]
    pub fn forward(&self, single: &Tensor, msa: &Tensor, pair: &Tensor, memory: DensityMemory<'_>) -> Result<Tensor> {
        let mut out = single.clone();
        let mut intermediate = Vec::with_capacity(self.depth());
        for layer in &self.layers {
            out = layer.forward(&out, msa, pair, single, memory)?;
            if self.return_intermediate {
                intermediate.push(self.norm.forward(&out)?);
            }
        }
        if !self.return_intermediate || intermediate.is_empty() {
            return self.norm.forward(&out)?.unsqueeze(0);
        }
        Tensor::stack(&intermediate, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn setup(return_intermediate: bool) -> anyhow::Result<(CryoformerDecoder, VarMap)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cfg = CryoformerLayersConfig {
            no_heads: 2,
            no_blocks: 3,
            dim_feedforward: 8,
            return_intermediate,
            ..CryoformerLayersConfig::default()
        };
        let dec = CryoformerDecoder::load(vb, 6, 4, 5, &cfg, KernelBackend::Reference)?;
        Ok((dec, varmap))
    }

    #[test]
    fn test_decoder_depths() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let single = Tensor::randn(0f32, 1.0, (1, 7, 6), &device)?;
        let msa = Tensor::randn(0f32, 1.0, (1, 3, 7, 4), &device)?;
        let pair = Tensor::randn(0f32, 1.0, (1, 7, 7, 5), &device)?;
        let repr = Tensor::randn(0f32, 1.0, (1, 8, 6), &device)?;
        let pos = Tensor::randn(0f32, 1.0, (1, 8, 6), &device)?;
        let wei = Tensor::rand(0f32, 1.0, (1, 8), &device)?;
        let memory = DensityMemory {
            repr: &repr,
            pos: &pos,
            wei: &wei,
        };

        let (dec, varmap) = setup(true)?;
        crate::weights::reseed(&varmap, 2)?;
        let all = dec.forward(&single, &msa, &pair, memory)?;
        assert_eq!(all.dims(), &[3, 1, 7, 6]);

        let last_only = CryoformerDecoder {
            return_intermediate: false,
            ..dec.clone()
        };
        let last = last_only.forward(&single, &msa, &pair, memory)?;
        assert_eq!(last.dims(), &[1, 1, 7, 6]);
        let d = (all.get(2)? - last.get(0)?)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(d < 1e-5);
        Ok(())
    }

    #[test]
    fn test_density_bias_steers_attention() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mha = MultiheadAttention::load(vb, 4, 2, KernelBackend::Reference)?;
        let q = Tensor::randn(0f32, 1.0, (1, 2, 4), &device)?;
        let k = Tensor::randn(0f32, 1.0, (1, 3, 4), &device)?;
        let v = Tensor::randn(0f32, 1.0, (1, 3, 4), &device)?;
        // An overwhelming bias on the second key is the same as attending to it alone.
        let bias = Tensor::new(&[[0f32, 1e4, 0.0]], &device)?;
        let biased = mha.forward(&q, &k, &v, Some(&bias))?;
        let only = mha.forward(&q, &k.narrow(1, 1, 1)?, &v.narrow(1, 1, 1)?, None)?;
        let d = (biased - only)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        assert!(d < 1e-4);
        Ok(())
    }
}
