//! Building blocks shared by every stage.
pub mod attention;
pub mod kernels;

use kernels::KernelBackend;
use candle_core::{Result, Tensor};
use candle_nn::{Init, VarBuilder};

/// Weight initialisation of a [`Linear`] layer when its parameters are created fresh.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinearInit {
    /// LeCun normal.
    Default,
    /// He normal.
    Relu,
    Glorot,
    /// Normal with standard deviation 0.02.
    Small,
    /// Zero weights, unit bias.
    Gating,
    /// Zero weights and bias.
    Final,
}

/// `y = x Wᵀ + b` over the last axis of an input of any rank.
#[derive(Clone, Debug)]
pub struct Linear {
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Linear {
    pub fn load(vb: VarBuilder, in_dim: usize, out_dim: usize, bias: bool, init: LinearInit) -> Result<Self> {
        let fan_in = in_dim.max(1) as f64;
        let w_init = match init {
            LinearInit::Default => Init::Randn {
                mean: 0.0,
                stdev: (1.0 / fan_in).sqrt(),
            },
            LinearInit::Relu => Init::Randn {
                mean: 0.0,
                stdev: (2.0 / fan_in).sqrt(),
            },
            LinearInit::Glorot => {
                let bound = (6.0 / (fan_in + out_dim as f64)).sqrt();
                Init::Uniform {
                    lo: -bound,
                    up: bound,
                }
            }
            LinearInit::Small => Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
            LinearInit::Gating | LinearInit::Final => Init::Const(0.0),
        };
        let weight = vb.get_with_hints((out_dim, in_dim), "weight", w_init)?;
        let bias = if bias {
            let b_init = match init {
                LinearInit::Gating => Init::Const(1.0),
                _ => Init::Const(0.0),
            };
            Some(vb.get_with_hints(out_dim, "bias", b_init)?)
        } else {
            None
        };
        Ok(Self { weight, bias })
    }

    /// Biased layer with the given init, the common case.
    pub fn new(vb: VarBuilder, in_dim: usize, out_dim: usize, init: LinearInit) -> Result<Self> {
        Self::load(vb, in_dim, out_dim, true, init)
    }

    pub fn out_dim(&self) -> usize {
        self.weight.dims()[0]
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dims = x.dims();
        let in_dim = dims[dims.len() - 1];
        let rows: usize = dims[..dims.len() - 1].iter().product();
        let y = x.reshape((rows, in_dim))?.matmul(&self.weight.t()?)?;
        let y = match &self.bias {
            Some(b) => y.broadcast_add(b)?,
            None => y,
        };
        let mut out_shape = dims[..dims.len() - 1].to_vec();
        out_shape.push(self.out_dim());
        y.reshape(out_shape)
    }
}

/// Layer normalisation over the last axis, dispatched through the selected kernels.
#[derive(Clone, Debug)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
    kernels: KernelBackend,
}

impl LayerNorm {
    pub fn load(vb: VarBuilder, dim: usize, kernels: KernelBackend) -> Result<Self> {
        Ok(Self {
            weight: vb.get_with_hints(dim, "weight", Init::Const(1.0))?,
            bias: vb.get_with_hints(dim, "bias", Init::Const(0.0))?,
            eps: 1e-5,
            kernels,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.kernels
            .kernels()
            .layer_norm(x, &self.weight, &self.bias, self.eps)
    }
}

/// Layer norm over the channel axis of a `[B, C, W, H, L]` volume.
#[derive(Clone, Debug)]
pub struct LayerNorm3d(LayerNorm);

impl LayerNorm3d {
    pub fn load(vb: VarBuilder, channels: usize, kernels: KernelBackend) -> Result<Self> {
        Ok(Self(LayerNorm::load(vb, channels, kernels)?))
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = x.permute((0, 2, 3, 4, 1))?;
        self.0.forward(&x)?.permute((0, 4, 1, 2, 3))?.contiguous()
    }
}

/// Linear layers with ReLU between them.
#[derive(Clone, Debug)]
pub struct Mlp {
    layers: Vec<Linear>,
}

impl Mlp {
    pub fn load(vb: VarBuilder, dims: &[usize]) -> Result<Self> {
        let layers = dims
            .windows(2)
            .enumerate()
            .map(|(i, w)| {
                let init = if i + 2 == dims.len() {
                    LinearInit::Default
                } else {
                    LinearInit::Relu
                };
                Linear::new(vb.pp(format!("layers.{i}")), w[0], w[1], init)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = x.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            x = layer.forward(&x)?;
            if i + 1 < self.layers.len() {
                x = x.relu()?;
            }
        }
        Ok(x)
    }
}

/// Two-layer feed-forward update `LN -> Linear(C, nC) -> ReLU -> Linear(nC, C)`, masked.
///
/// Used as the MSA transition and the pair transition.
#[derive(Clone, Debug)]
pub struct Transition {
    layer_norm: LayerNorm,
    linear_1: Linear,
    linear_2: Linear,
}

impl Transition {
    pub fn load(vb: VarBuilder, c: usize, n: usize, kernels: KernelBackend) -> Result<Self> {
        Ok(Self {
            layer_norm: LayerNorm::load(vb.pp("layer_norm"), c, kernels)?,
            linear_1: Linear::new(vb.pp("linear_1"), c, n * c, LinearInit::Relu)?,
            linear_2: Linear::new(vb.pp("linear_2"), n * c, c, LinearInit::Final)?,
        })
    }

    /// `x [*, C]` and `mask` broadcastable to `[*]`.
    pub fn forward(&self, x: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let x = self.layer_norm.forward(x)?;
        let x = self.linear_2.forward(&self.linear_1.forward(&x)?.relu()?)?;
        x.broadcast_mul(&mask.unsqueeze(mask.rank())?)
    }
}

/// Splits the last axis into `[.., heads, c]` and moves `heads` before the axis at `-3`.
///
/// `[*, Q, H*C] -> [*, H, Q, C]`
pub fn split_heads(x: &Tensor, heads: usize) -> Result<Tensor> {
    let dims = x.dims();
    let r = dims.len();
    let c = dims[r - 1] / heads;
    let mut shape = dims[..r - 1].to_vec();
    shape.extend([heads, c]);
    x.reshape(shape)?.transpose(r - 2, r - 1)?.contiguous()
}

/// `a [*, M, K] @ b [*, K, N]` for any number of leading axes.
///
/// Candle's CPU matmul handles at most two batch axes, so the leading axes are folded into
/// one. `b` is broadcast to the leading shape of `a`.
pub fn batched_matmul(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let a_dims = a.dims().to_vec();
    let r = a_dims.len();
    if r <= 3 {
        return a.contiguous()?.matmul(&b.contiguous()?);
    }
    let (m, k) = (a_dims[r - 2], a_dims[r - 1]);
    let n = b.dim(candle_core::D::Minus1)?;
    let lead = &a_dims[..r - 2];
    let batch: usize = lead.iter().product();
    let mut b_shape = lead.to_vec();
    b_shape.extend([k, n]);
    let a3 = a.contiguous()?.reshape((batch, m, k))?;
    let b3 = b.broadcast_as(b_shape)?.contiguous()?.reshape((batch, k, n))?;
    let mut out_shape = lead.to_vec();
    out_shape.extend([m, n]);
    a3.matmul(&b3)?.reshape(out_shape)
}

/// Inverse of [`split_heads`]: `[*, H, Q, C] -> [*, Q, H*C]`.
pub fn merge_heads(x: &Tensor) -> Result<Tensor> {
    let r = x.rank();
    let x = x.transpose(r - 3, r - 2)?.contiguous()?;
    x.flatten(r - 2, r - 1)
}

/// Swaps the two axes before the channel axis: `[*, I, J, C] -> [*, J, I, C]`.
pub fn swap_rows_cols(x: &Tensor) -> Result<Tensor> {
    let r = x.rank();
    x.transpose(r - 3, r - 2)?.contiguous()
}

/// Inserts singleton axes at the end of `t` until it has rank `rank`.
pub fn pad_rank(t: &Tensor, rank: usize) -> Result<Tensor> {
    let mut t = t.clone();
    while t.rank() < rank {
        t = t.unsqueeze(t.rank())?;
    }
    Ok(t)
}

/// `(mask - 1) * inf`: zero where the mask is set, `-inf` elsewhere.
pub fn mask_bias(mask: &Tensor, inf: f64) -> Result<Tensor> {
    mask.affine(inf, -inf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_linear_any_rank() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let lin = Linear::new(vb.pp("lin"), 6, 3, LinearInit::Default)?;
        let x = Tensor::randn(0f32, 1.0, (2, 4, 5, 6), &Device::Cpu)?;
        assert_eq!(lin.forward(&x)?.dims(), &[2, 4, 5, 3]);
        let flat = lin.forward(&x.reshape((40, 6))?)?.reshape((2, 4, 5, 3))?;
        let diff = (lin.forward(&x)? - flat)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-5);
        Ok(())
    }

    #[test]
    fn test_final_init_is_zero() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let lin = Linear::new(vb, 4, 2, LinearInit::Final)?;
        let y = lin.forward(&Tensor::ones((3, 4), DType::F32, &Device::Cpu)?)?;
        assert_eq!(y.sum_all()?.to_scalar::<f32>()?, 0.0);
        Ok(())
    }

    #[test]
    fn test_heads_round_trip() -> anyhow::Result<()> {
        let x = Tensor::randn(0f32, 1.0, (2, 5, 12), &Device::Cpu)?;
        let h = split_heads(&x, 3)?;
        assert_eq!(h.dims(), &[2, 3, 5, 4]);
        let back = merge_heads(&h)?;
        let diff = (back - &x)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }
}
