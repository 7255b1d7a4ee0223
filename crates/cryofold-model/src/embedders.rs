//! Embedders that turn input features and recycled state into initial representations.
use crate::config::{GlobalsConfig, InputEmbedderConfig, RecyclingEmbedderConfig};
use crate::primitives::kernels::KernelBackend;
use crate::primitives::{LayerNorm, Linear, LinearInit};
use candle_core::{DType, Result, Tensor, D};
use candle_nn::VarBuilder;
use cryofold_core::feats::distance_histogram;

/// Transformer-style sinusoidal encoding of a scalar position per residue.
///
/// Channel `2i` holds `sin(p / 10000^(2i/C))` and channel `2i + 1` the matching cosine.
#[derive(Clone, Debug)]
pub struct SinusoidalEncoding {
    inv_freq: Tensor,
}

impl SinusoidalEncoding {
    pub fn new(hidden: usize, device: &candle_core::Device) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..hidden)
            .step_by(2)
            .map(|i| 1.0 / 10000f32.powf(i as f32 / hidden as f32))
            .collect();
        Ok(Self {
            inv_freq: Tensor::new(inv_freq, device)?,
        })
    }

    /// `[*, N]` positions to `[*, N, C]`.
    pub fn forward(&self, pos: &Tensor) -> Result<Tensor> {
        let pos = pos.to_dtype(DType::F32)?;
        let r = pos.rank();
        let angles = pos.unsqueeze(r)?.broadcast_mul(&self.inv_freq)?;
        let sin = angles.sin()?;
        let cos = angles.cos()?;
        Tensor::stack(&[sin, cos], r + 1)?.flatten(r, r + 1)
    }
}

/// Clamped relative-position buckets `clamp(i - j, -k, k) + k` as a `[*, N, N, 2k+1]` one-hot.
pub fn relpos_one_hot(residue_index: &Tensor, k: usize) -> Result<Tensor> {
    let ri = residue_index.to_dtype(DType::F32)?;
    let r = ri.rank();
    let d = ri.unsqueeze(r)?.broadcast_sub(&ri.unsqueeze(r - 1)?)?;
    let k = k as f64;
    let bucket = (d.clamp(-k, k)? + k)?;
    let no_bins = 2 * k as usize + 1;
    let bins = Tensor::arange(0u32, no_bins as u32, ri.device())?.to_dtype(DType::F32)?;
    bucket.unsqueeze(r + 1)?.broadcast_eq(&bins)?.to_dtype(DType::F32)
}

/// Initial outputs of [`InputEmbedder::forward`].
#[derive(Debug)]
pub struct InputEmbedding {
    /// `[*, N, C_s]` chain representation, with `use_chain`.
    pub chain: Option<Tensor>,
    /// `[*, N, C_s]` single representation, with `use_single`.
    pub single: Option<Tensor>,
    /// `[*, S, N, C_m]`
    pub msa: Tensor,
    /// `[*, N, N, C_z]`
    pub pair: Tensor,
}

#[derive(Clone, Debug)]
pub struct InputEmbedder {
    linear_tf_z_i: Linear,
    linear_tf_z_j: Linear,
    linear_tf_m: Linear,
    linear_msa_m: Linear,
    linear_relpos: Linear,
    linear_embed_s: Option<Linear>,
    linear_embed_c: Option<Linear>,
    position_encoding: Option<SinusoidalEncoding>,
    relpos_k: usize,
}

impl InputEmbedder {
    pub fn load(vb: VarBuilder, cfg: &InputEmbedderConfig, g: &GlobalsConfig) -> Result<Self> {
        let tf = cfg.tf_dim;
        let no_bins = 2 * cfg.relpos_k + 1;
        let linear_embed_s = if g.use_single {
            Some(Linear::new(vb.pp("linear_embed_s"), tf, g.c_s, LinearInit::Default)?)
        } else {
            None
        };
        let linear_embed_c = if g.use_chain {
            Some(Linear::new(vb.pp("linear_embed_c"), tf, g.c_s, LinearInit::Default)?)
        } else {
            None
        };
        let position_encoding = if g.use_single || g.use_chain {
            Some(SinusoidalEncoding::new(g.c_s, vb.device())?)
        } else {
            None
        };
        Ok(Self {
            linear_tf_z_i: Linear::new(vb.pp("linear_tf_z_i"), tf, g.c_z, LinearInit::Default)?,
            linear_tf_z_j: Linear::new(vb.pp("linear_tf_z_j"), tf, g.c_z, LinearInit::Default)?,
            linear_tf_m: Linear::new(vb.pp("linear_tf_m"), tf, g.c_m, LinearInit::Default)?,
            linear_msa_m: Linear::new(vb.pp("linear_msa_m"), cfg.msa_dim, g.c_m, LinearInit::Default)?,
            linear_relpos: Linear::new(vb.pp("linear_relpos"), no_bins, g.c_z, LinearInit::Default)?,
            linear_embed_s,
            linear_embed_c,
            position_encoding,
            relpos_k: cfg.relpos_k,
        })
    }

    pub fn relpos(&self, residue_index: &Tensor) -> Result<Tensor> {
        self.linear_relpos
            .forward(&relpos_one_hot(residue_index, self.relpos_k)?)
    }

    /// `tf [*, N, tf_dim]`, `ri [*, N]`, `msa [*, S, N, msa_dim]`, `ci [*, N]`.
    pub fn forward(&self, tf: &Tensor, ri: &Tensor, msa: &Tensor, ci: Option<&Tensor>) -> Result<InputEmbedding> {
        let r = tf.rank();
        let tf_emb_i = self.linear_tf_z_i.forward(tf)?;
        let tf_emb_j = self.linear_tf_z_j.forward(tf)?;
        let pair = self
            .relpos(ri)?
            .broadcast_add(&tf_emb_i.unsqueeze(r - 1)?)?
            .broadcast_add(&tf_emb_j.unsqueeze(r - 2)?)?;

        let tf_m = self.linear_tf_m.forward(tf)?.unsqueeze(r - 2)?;
        let msa = self.linear_msa_m.forward(msa)?.broadcast_add(&tf_m)?;

        // The unknown-residue channel moves to the end.
        let tf_dim = tf.dim(D::Minus1)?;
        let tf_rot = Tensor::cat(&[tf.narrow(r - 1, 1, tf_dim - 1)?, tf.narrow(r - 1, 0, 1)?], r - 1)?;
        let single = match (&self.linear_embed_s, &self.position_encoding) {
            (Some(lin), Some(enc)) => Some((lin.forward(&tf_rot)? + enc.forward(ri)?)?),
            _ => None,
        };
        let chain = match (&self.linear_embed_c, &self.position_encoding) {
            (Some(lin), Some(enc)) => {
                let ci = match ci {
                    Some(ci) => ci.clone(),
                    None => ri.zeros_like()?,
                };
                Some((lin.forward(&tf_rot)? + enc.forward(&ci)?)?)
            }
            _ => None,
        };
        Ok(InputEmbedding {
            chain,
            single,
            msa,
            pair,
        })
    }
}

/// Previous-iteration state fed back through [`RecyclingEmbedder`].
#[derive(Clone, Debug)]
pub struct RecyclingState {
    /// `[*, N, C_m]` first MSA row.
    pub m_1_prev: Tensor,
    /// `[*, N, N, C_z]`
    pub z_prev: Tensor,
    /// `[*, N, 37, 3]` atom positions of the last structure-module block.
    pub x_prev: Tensor,
    /// `[*, N, C_s]`
    pub s_prev: Tensor,
    /// `[*, N, C_s]`
    pub c_prev: Tensor,
}

impl RecyclingState {
    /// The first-iteration state: every tensor zero.
    pub fn zeros(batch: usize, n_res: usize, g: &GlobalsConfig, device: &candle_core::Device) -> Result<Self> {
        Ok(Self {
            m_1_prev: Tensor::zeros((batch, n_res, g.c_m), DType::F32, device)?,
            z_prev: Tensor::zeros((batch, n_res, n_res, g.c_z), DType::F32, device)?,
            x_prev: Tensor::zeros((batch, n_res, 37, 3), DType::F32, device)?,
            s_prev: Tensor::zeros((batch, n_res, g.c_s), DType::F32, device)?,
            c_prev: Tensor::zeros((batch, n_res, g.c_s), DType::F32, device)?,
        })
    }

    pub fn detach(&self) -> Self {
        Self {
            m_1_prev: self.m_1_prev.detach(),
            z_prev: self.z_prev.detach(),
            x_prev: self.x_prev.detach(),
            s_prev: self.s_prev.detach(),
            c_prev: self.c_prev.detach(),
        }
    }
}

/// Updates produced by [`RecyclingEmbedder::forward`].
#[derive(Debug)]
pub struct RecyclingUpdate {
    pub chain: Option<Tensor>,
    pub single: Option<Tensor>,
    pub msa_row: Tensor,
    pub pair: Tensor,
}

#[derive(Clone, Debug)]
pub struct RecyclingEmbedder {
    linear: Linear,
    layer_norm_m: LayerNorm,
    layer_norm_z: LayerNorm,
    layer_norm_s: Option<LayerNorm>,
    layer_norm_c: Option<LayerNorm>,
    min_bin: f64,
    max_bin: f64,
    no_bins: usize,
    inf: f64,
}

impl RecyclingEmbedder {
    pub fn load(vb: VarBuilder, cfg: &RecyclingEmbedderConfig, g: &GlobalsConfig) -> Result<Self> {
        let k = g.kernels;
        Ok(Self {
            linear: Linear::new(vb.pp("linear"), cfg.no_bins, g.c_z, LinearInit::Default)?,
            layer_norm_m: LayerNorm::load(vb.pp("layer_norm_m"), g.c_m, k)?,
            layer_norm_z: LayerNorm::load(vb.pp("layer_norm_z"), g.c_z, k)?,
            layer_norm_s: optional_norm(&vb, "layer_norm_s", g.use_single, g.c_s, k)?,
            layer_norm_c: optional_norm(&vb, "layer_norm_c", g.use_chain, g.c_s, k)?,
            min_bin: cfg.min_bin,
            max_bin: cfg.max_bin,
            no_bins: cfg.no_bins,
            inf: cfg.inf,
        })
    }

    /// `x` holds pseudo-beta coordinates `[*, N, 3]` of the previous iteration.
    pub fn forward(&self, m_1: &Tensor, z: &Tensor, x: &Tensor, s: &Tensor, c: &Tensor) -> Result<RecyclingUpdate> {
        let msa_row = self.layer_norm_m.forward(m_1)?;
        let d = distance_histogram(x, self.min_bin, self.max_bin, self.no_bins, self.inf)?;
        let pair = (self.layer_norm_z.forward(z)? + self.linear.forward(&d)?)?;
        let single = self.layer_norm_s.as_ref().map(|ln| ln.forward(s)).transpose()?;
        let chain = self.layer_norm_c.as_ref().map(|ln| ln.forward(c)).transpose()?;
        Ok(RecyclingUpdate {
            chain,
            single,
            msa_row,
            pair,
        })
    }
}

fn optional_norm(vb: &VarBuilder, name: &str, enabled: bool, dim: usize, k: KernelBackend) -> Result<Option<LayerNorm>> {
    if enabled {
        Ok(Some(LayerNorm::load(vb.pp(name), dim, k)?))
    } else {
        Ok(None)
    }
}

/// Template torsion features to extra MSA rows.
#[derive(Clone, Debug)]
pub struct TemplateAngleEmbedder {
    linear_1: Linear,
    linear_2: Linear,
}

impl TemplateAngleEmbedder {
    pub fn load(vb: VarBuilder, c_in: usize, c_out: usize) -> Result<Self> {
        Ok(Self {
            linear_1: Linear::new(vb.pp("linear_1"), c_in, c_out, LinearInit::Relu)?,
            linear_2: Linear::new(vb.pp("linear_2"), c_out, c_out, LinearInit::Relu)?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.linear_2.forward(&self.linear_1.forward(x)?.relu()?)
    }
}

#[derive(Clone, Debug)]
pub struct TemplatePairEmbedder {
    linear: Linear,
}

impl TemplatePairEmbedder {
    pub fn load(vb: VarBuilder, c_in: usize, c_out: usize) -> Result<Self> {
        Ok(Self {
            linear: Linear::new(vb.pp("linear"), c_in, c_out, LinearInit::Relu)?,
        })
    }

    pub fn c_out(&self) -> usize {
        self.linear.out_dim()
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.linear.forward(x)
    }
}

#[derive(Clone, Debug)]
pub struct ExtraMsaEmbedder {
    linear: Linear,
}

impl ExtraMsaEmbedder {
    pub fn load(vb: VarBuilder, c_in: usize, c_out: usize) -> Result<Self> {
        Ok(Self {
            linear: Linear::new(vb.pp("linear"), c_in, c_out, LinearInit::Default)?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.linear.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    #[test]
    fn test_relpos_clamps_outside_window() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let ri = Tensor::new(&[[0u32, 1, 5, 40, 90]], &device)?;
        let oh = relpos_one_hot(&ri, 3)?;
        assert_eq!(oh.dims(), &[1, 5, 5, 7]);
        let rows = oh.squeeze(0)?.to_vec3::<f32>()?;
        // 0 - 5, 0 - 40 and 0 - 90 all land in the lowest bucket.
        assert_eq!(rows[0][2], rows[0][3]);
        assert_eq!(rows[0][3], rows[0][4]);
        assert_eq!(rows[0][2][0], 1.0);
        assert_eq!(rows[4][0], rows[3][1]);
        assert_eq!(rows[4][0][6], 1.0);
        assert_eq!(rows[1][0][4], 1.0);
        assert_eq!(rows[2][2][3], 1.0);
        Ok(())
    }

    #[test]
    fn test_sinusoidal_interleaves_sin_and_cos() -> anyhow::Result<()> {
        let enc = SinusoidalEncoding::new(6, &Device::Cpu)?;
        let out = enc.forward(&Tensor::new(&[[0f32, 2.0]], &Device::Cpu)?)?;
        assert_eq!(out.dims(), &[1, 2, 6]);
        let v = out.squeeze(0)?.to_vec2::<f32>()?;
        assert_eq!(v[0], vec![0.0, 1.0, 0.0, 1.0, 0.0, 1.0]);
        assert!((v[1][0] - 2f32.sin()).abs() < 1e-6);
        assert!((v[1][1] - 2f32.cos()).abs() < 1e-6);
        let f1 = 1.0 / 10000f32.powf(2.0 / 6.0);
        assert!((v[1][2] - (2.0 * f1).sin()).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_input_embedder_shapes() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let g = GlobalsConfig {
            c_z: 8,
            c_m: 6,
            c_s: 12,
            use_chain: true,
            ..GlobalsConfig::default()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let emb = InputEmbedder::load(vb, &InputEmbedderConfig::default(), &g)?;
        let tf = Tensor::randn(0f32, 1.0, (2, 5, 22), &device)?;
        let ri = Tensor::new(&[[0u32, 1, 2, 3, 4], [0, 1, 2, 3, 4]], &device)?;
        let msa = Tensor::randn(0f32, 1.0, (2, 3, 5, 49), &device)?;
        let out = emb.forward(&tf, &ri, &msa, None)?;
        assert_eq!(out.pair.dims(), &[2, 5, 5, 8]);
        assert_eq!(out.msa.dims(), &[2, 3, 5, 6]);
        assert_eq!(out.single.map(|s| s.dims().to_vec()), Some(vec![2, 5, 12]));
        assert_eq!(out.chain.map(|c| c.dims().to_vec()), Some(vec![2, 5, 12]));
        Ok(())
    }

    #[test]
    fn test_recycling_zero_state_is_deterministic() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let g = GlobalsConfig {
            c_z: 4,
            c_m: 4,
            c_s: 6,
            ..GlobalsConfig::default()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let emb = RecyclingEmbedder::load(vb, &RecyclingEmbedderConfig::default(), &g)?;
        let state = RecyclingState::zeros(1, 3, &g, &device)?;
        let x = Tensor::zeros((1, 3, 3), DType::F32, &device)?;
        let out = emb.forward(&state.m_1_prev, &state.z_prev, &x, &state.s_prev, &state.c_prev)?;
        assert_eq!(out.pair.dims(), &[1, 3, 3, 4]);
        assert!(out.chain.is_none());
        // Zero distances fall below the first bin edge, so only the bias survives.
        let total = out.pair.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(total, 0.0);
        Ok(())
    }
}
