//! Gated multi-head attention used throughout the trunk.
use super::kernels::{low_memory_attention, KernelBackend, LMA_KV_CHUNK_SIZE};
use super::{merge_heads, split_heads, Linear, LinearInit};
use crate::execution::ExecutionMode;
use candle_core::{Result, Tensor, D};
use candle_nn::VarBuilder;

#[derive(Clone, Debug)]
pub struct Attention {
    linear_q: Linear,
    linear_k: Linear,
    linear_v: Linear,
    linear_o: Linear,
    linear_g: Option<Linear>,
    no_heads: usize,
    c_hidden: usize,
    kernels: KernelBackend,
}

impl Attention {
    pub fn load(
        vb: VarBuilder,
        c_q: usize,
        c_kv: usize,
        c_hidden: usize,
        no_heads: usize,
        gating: bool,
        kernels: KernelBackend,
    ) -> Result<Self> {
        let hc = c_hidden * no_heads;
        Ok(Self {
            linear_q: Linear::load(vb.pp("linear_q"), c_q, hc, false, LinearInit::Glorot)?,
            linear_k: Linear::load(vb.pp("linear_k"), c_kv, hc, false, LinearInit::Glorot)?,
            linear_v: Linear::load(vb.pp("linear_v"), c_kv, hc, false, LinearInit::Glorot)?,
            linear_o: Linear::new(vb.pp("linear_o"), hc, c_q, LinearInit::Final)?,
            linear_g: if gating {
                Some(Linear::new(vb.pp("linear_g"), c_q, hc, LinearInit::Gating)?)
            } else {
                None
            },
            no_heads,
            c_hidden,
            kernels,
        })
    }

    /// `q_x [*, Q, C_q]`, `kv_x [*, K, C_kv]`; every bias broadcasts to `[*, H, Q, K]` and
    /// has rank `q_x.rank() + 1`.
    ///
    /// With `mode.chunk_size` set, the axis before `Q` is processed in chunks.
    pub fn forward(&self, q_x: &Tensor, kv_x: &Tensor, biases: &[Tensor], mode: &ExecutionMode) -> Result<Tensor> {
        let r = q_x.rank();
        match mode.chunk_size {
            Some(chunk) if r >= 3 && q_x.dim(r - 3)? > chunk => {
                let axis = r - 3;
                let rows = q_x.dim(axis)?;
                let mut outs = Vec::with_capacity(rows.div_ceil(chunk));
                let preallocated = if mode.inplace_safe {
                    let mut shape = q_x.dims().to_vec();
                    shape[r - 1] = self.linear_o.out_dim();
                    Some(Tensor::zeros(shape, q_x.dtype(), q_x.device())?)
                } else {
                    None
                };
                let mut start = 0;
                while start < rows {
                    let len = chunk.min(rows - start);
                    let q_c = q_x.narrow(axis, start, len)?;
                    let kv_c = kv_x.narrow(axis, start, len)?;
                    let b_c = biases
                        .iter()
                        .map(|b| {
                            if b.dim(axis)? == 1 {
                                Ok(b.clone())
                            } else {
                                b.narrow(axis, start, len)
                            }
                        })
                        .collect::<Result<Vec<_>>>()?;
                    let o = self.forward_unchunked(&q_c, &kv_c, &b_c, mode.use_lma)?;
                    match &preallocated {
                        Some(out) => out.slice_set(&o.contiguous()?, axis, start)?,
                        None => outs.push(o),
                    }
                    start += len;
                }
                match preallocated {
                    Some(out) => Ok(out),
                    None => Tensor::cat(&outs, axis),
                }
            }
            _ => self.forward_unchunked(q_x, kv_x, biases, mode.use_lma),
        }
    }

    fn forward_unchunked(&self, q_x: &Tensor, kv_x: &Tensor, biases: &[Tensor], use_lma: bool) -> Result<Tensor> {
        let q = split_heads(&self.linear_q.forward(q_x)?, self.no_heads)?;
        let q = (q * (1.0 / (self.c_hidden as f64).sqrt()))?;
        let k = split_heads(&self.linear_k.forward(kv_x)?, self.no_heads)?;
        let v = split_heads(&self.linear_v.forward(kv_x)?, self.no_heads)?;
        let bias_refs: Vec<&Tensor> = biases.iter().collect();
        let o = if use_lma {
            low_memory_attention(&q, &k, &v, &bias_refs, LMA_KV_CHUNK_SIZE)?
        } else {
            self.kernels.kernels().attention(&q, &k, &v, &bias_refs)?
        };
        let o = merge_heads(&o)?;
        let o = match &self.linear_g {
            Some(g) => (o * candle_nn::ops::sigmoid(&g.forward(q_x)?)?)?,
            None => o,
        };
        self.linear_o.forward(&o)
    }
}

/// Attention with a single query per column: the mask-weighted mean over the sequence axis.
#[derive(Clone, Debug)]
pub struct GlobalAttention {
    linear_q: Linear,
    linear_k: Linear,
    linear_v: Linear,
    linear_g: Linear,
    linear_o: Linear,
    no_heads: usize,
    c_hidden: usize,
    inf: f64,
    eps: f64,
    kernels: KernelBackend,
}

impl GlobalAttention {
    pub fn load(
        vb: VarBuilder,
        c_in: usize,
        c_hidden: usize,
        no_heads: usize,
        inf: f64,
        eps: f64,
        kernels: KernelBackend,
    ) -> Result<Self> {
        let hc = c_hidden * no_heads;
        Ok(Self {
            linear_q: Linear::load(vb.pp("linear_q"), c_in, hc, false, LinearInit::Glorot)?,
            linear_k: Linear::load(vb.pp("linear_k"), c_in, c_hidden, false, LinearInit::Glorot)?,
            linear_v: Linear::load(vb.pp("linear_v"), c_in, c_hidden, false, LinearInit::Glorot)?,
            linear_g: Linear::new(vb.pp("linear_g"), c_in, hc, LinearInit::Gating)?,
            linear_o: Linear::new(vb.pp("linear_o"), hc, c_in, LinearInit::Final)?,
            no_heads,
            c_hidden,
            inf,
            eps,
            kernels,
        })
    }

    /// `m [*, N_res, N_seq, C]`, `mask [*, N_res, N_seq]`.
    pub fn forward(&self, m: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let r = m.rank();
        let mask_e = mask.unsqueeze(r - 1)?;
        // [*, N_res, C]
        let q_avg = m
            .broadcast_mul(&mask_e)?
            .sum(r - 2)?
            .broadcast_div(&(mask.sum_keepdim(r - 2)? + self.eps)?)?;
        // [*, N_res, H, C_hidden]
        let q = self.linear_q.forward(&q_avg)?;
        let q = (q * (1.0 / (self.c_hidden as f64).sqrt()))?;
        let mut q_shape = q.dims()[..r - 2].to_vec();
        q_shape.extend([self.no_heads, self.c_hidden]);
        let q = q.reshape(q_shape)?;
        // [*, N_res, N_seq, C_hidden]
        let k = self.linear_k.forward(m)?;
        let v = self.linear_v.forward(m)?;
        // [*, N_res, H, N_seq]
        let bias = crate::primitives::mask_bias(mask, self.inf)?.unsqueeze(r - 2)?;
        let a = q.matmul(&k.transpose(D::Minus2, D::Minus1)?.contiguous()?)?;
        let a = self.kernels.kernels().softmax_last_dim(&a.broadcast_add(&bias)?)?;
        // [*, N_res, H, C_hidden]
        let o = a.matmul(&v)?;

        // [*, N_res, N_seq, H, C_hidden]
        let g = candle_nn::ops::sigmoid(&self.linear_g.forward(m)?)?;
        let mut g_shape = g.dims()[..r - 1].to_vec();
        g_shape.extend([self.no_heads, self.c_hidden]);
        let g = g.reshape(g_shape)?;
        let o = g.broadcast_mul(&o.unsqueeze(r - 2)?)?;
        let o = o.flatten(r - 1, r)?;
        self.linear_o.forward(&o)
    }
}
