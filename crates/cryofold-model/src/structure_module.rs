//! Iterative frame refinement with invariant point attention, and all-atom reconstruction.
use crate::config::{GlobalsConfig, StructureModuleConfig};
use crate::primitives::kernels::KernelBackend;
use crate::primitives::{LayerNorm, Linear, LinearInit};
use candle_core::{Result, Tensor, D};
use candle_nn::{Init, VarBuilder};
use cryofold_core::feats::{frames_and_literature_positions_to_atom14_pos, torsion_angles_to_frames, ResidueTables};
use cryofold_core::Rigid;

/// Attention over residues whose logits mix feature similarity, pair bias and the distance
/// between query and key points placed in each residue's frame.
#[derive(Clone, Debug)]
pub struct InvariantPointAttention {
    linear_q: Linear,
    linear_kv: Linear,
    linear_q_points: Linear,
    linear_kv_points: Linear,
    linear_b: Linear,
    head_weights: Tensor,
    linear_out: Linear,
    c_hidden: usize,
    no_heads: usize,
    no_qk_points: usize,
    no_v_points: usize,
    inf: f64,
    eps: f64,
}

fn softplus(x: &Tensor) -> Result<Tensor> {
    (x.exp()? + 1.0)?.log()
}

impl InvariantPointAttention {
    pub fn load(vb: VarBuilder, c_s: usize, c_z: usize, cfg: &StructureModuleConfig) -> Result<Self> {
        let (c, h) = (cfg.c_ipa, cfg.no_heads_ipa);
        let (pq, pv) = (cfg.no_qk_points, cfg.no_v_points);
        let concat = h * (c_z + c + pv * 4);
        Ok(Self {
            linear_q: Linear::new(vb.pp("linear_q"), c_s, h * c, LinearInit::Default)?,
            linear_kv: Linear::new(vb.pp("linear_kv"), c_s, 2 * h * c, LinearInit::Default)?,
            linear_q_points: Linear::new(vb.pp("linear_q_points"), c_s, h * pq * 3, LinearInit::Default)?,
            linear_kv_points: Linear::new(vb.pp("linear_kv_points"), c_s, h * (pq + pv) * 3, LinearInit::Default)?,
            linear_b: Linear::new(vb.pp("linear_b"), c_z, h, LinearInit::Default)?,
            // softplus⁻¹(1)
            head_weights: vb.get_with_hints(h, "head_weights", Init::Const(0.541324854612918))?,
            linear_out: Linear::new(vb.pp("linear_out"), concat, c_s, LinearInit::Final)?,
            c_hidden: c,
            no_heads: h,
            no_qk_points: pq,
            no_v_points: pv,
            inf: cfg.inf,
            eps: cfg.epsilon,
        })
    }

    /// Projects `[B, N, C_s]` to `no_points` global points per head, `[B, N, H, P, 3]`.
    fn points(&self, s: &Tensor, linear: &Linear, r: &Rigid, no_points: usize) -> Result<Tensor> {
        let (b, n, _) = s.dims3()?;
        let hp = self.no_heads * no_points;
        // x, y and z come in three consecutive blocks.
        let local = linear.forward(s)?.reshape((b, n, 3, hp))?.transpose(2, 3)?.contiguous()?;
        r.unsqueeze(2)?
            .apply(&local)?
            .reshape((b, n, self.no_heads, no_points, 3))
    }

    /// `s [B, N, C_s]`, `z [B, N, N, C_z]`, frames `r [B, N]`, `mask [B, N]`.
    pub fn forward(&self, s: &Tensor, z: &Tensor, r: &Rigid, mask: &Tensor) -> Result<Tensor> {
        let (b, n, _) = s.dims3()?;
        let (h, c) = (self.no_heads, self.c_hidden);
        let (pq, pv) = (self.no_qk_points, self.no_v_points);

        // [B, H, N, C]
        let q = self.linear_q.forward(s)?.reshape((b, n, h, c))?.transpose(1, 2)?.contiguous()?;
        let kv = self.linear_kv.forward(s)?.reshape((b, n, h, 2 * c))?;
        let k = kv.narrow(3, 0, c)?.transpose(1, 2)?.contiguous()?;
        let v = kv.narrow(3, c, c)?.transpose(1, 2)?.contiguous()?;

        let q_pts = self.points(s, &self.linear_q_points, r, pq)?;
        let kv_pts = self.points(s, &self.linear_kv_points, r, pq + pv)?;
        let k_pts = kv_pts.narrow(3, 0, pq)?;
        let v_pts = kv_pts.narrow(3, pq, pv)?;

        // [B, H, N, N]
        let bias = self.linear_b.forward(z)?.permute((0, 3, 1, 2))?;
        let a = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * (1.0 / (3.0 * c as f64)).sqrt())?;
        let a = (a + (bias * (1.0f64 / 3.0).sqrt())?)?;

        // [B, N, N, H, P, 3] -> [B, N, N, H]
        let diff = q_pts.unsqueeze(2)?.broadcast_sub(&k_pts.unsqueeze(1)?)?;
        let sq = diff.sqr()?.sum(D::Minus1)?;
        let head_weights = (softplus(&self.head_weights)? * (1.0 / (3.0 * (pq as f64 * 9.0 / 2.0))).sqrt())?;
        let pt_att = (sq.broadcast_mul(&head_weights.reshape((1, 1, 1, h, 1))?)?.sum(D::Minus1)? * -0.5)?;
        let pt_att = pt_att.permute((0, 3, 1, 2))?;

        let square_mask = mask.unsqueeze(2)?.broadcast_mul(&mask.unsqueeze(1)?)?;
        let square_mask = crate::primitives::mask_bias(&square_mask, self.inf)?.unsqueeze(1)?;
        let a = (a + pt_att)?.broadcast_add(&square_mask)?;
        let a = candle_nn::ops::softmax_last_dim(&a.contiguous()?)?;

        // [B, N, H * C]
        let o = a.matmul(&v)?.transpose(1, 2)?.contiguous()?.reshape((b, n, h * c))?;

        // [B, H, N, Pv * 3] -> global [B, N, H, Pv, 3] -> local
        let v_flat = v_pts.permute((0, 2, 1, 3, 4))?.contiguous()?.reshape((b, h, n, pv * 3))?;
        let o_pt = a
            .matmul(&v_flat)?
            .reshape((b, h, n, pv, 3))?
            .permute((0, 2, 1, 3, 4))?
            .contiguous()?;
        let o_pt = r.unsqueeze(2)?.unsqueeze(3)?.invert_apply(&o_pt)?;
        let o_pt_norm = (o_pt.sqr()?.sum(D::Minus1)? + self.eps)?.sqrt()?.reshape((b, n, h * pv))?;
        let o_pt = o_pt.reshape((b, n, h * pv, 3))?;
        let coord = |i: usize| o_pt.narrow(3, i, 1)?.squeeze(3);

        // [B, N, H, C_z]
        let c_z = z.dim(3)?;
        let o_pair = a.transpose(1, 2)?.contiguous()?.matmul(z)?.reshape((b, n, h * c_z))?;

        let cat = Tensor::cat(&[o, coord(0)?, coord(1)?, coord(2)?, o_pt_norm, o_pair], D::Minus1)?;
        self.linear_out.forward(&cat)
    }
}

#[derive(Clone, Debug)]
struct TransitionLayer {
    linear_1: Linear,
    linear_2: Linear,
    linear_3: Linear,
}

impl TransitionLayer {
    fn forward(&self, s: &Tensor) -> Result<Tensor> {
        let x = self.linear_1.forward(s)?.relu()?;
        let x = self.linear_2.forward(&x)?.relu()?;
        s + self.linear_3.forward(&x)?
    }
}

#[derive(Clone, Debug)]
struct StructureTransition {
    layers: Vec<TransitionLayer>,
    layer_norm: LayerNorm,
}

impl StructureTransition {
    fn load(vb: VarBuilder, c: usize, no_layers: usize, kernels: KernelBackend) -> Result<Self> {
        let layers = (0..no_layers)
            .map(|i| {
                let vb = vb.pp(format!("layers.{i}"));
                Ok(TransitionLayer {
                    linear_1: Linear::new(vb.pp("linear_1"), c, c, LinearInit::Relu)?,
                    linear_2: Linear::new(vb.pp("linear_2"), c, c, LinearInit::Relu)?,
                    linear_3: Linear::new(vb.pp("linear_3"), c, c, LinearInit::Final)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            layers,
            layer_norm: LayerNorm::load(vb.pp("layer_norm"), c, kernels)?,
        })
    }

    fn forward(&self, s: &Tensor) -> Result<Tensor> {
        let mut s = s.clone();
        for layer in &self.layers {
            s = layer.forward(&s)?;
        }
        self.layer_norm.forward(&s)
    }
}

#[derive(Clone, Debug)]
struct AngleResnetBlock {
    linear_1: Linear,
    linear_2: Linear,
}

/// Predicts the seven torsions as unnormalised `(sin, cos)` pairs.
#[derive(Clone, Debug)]
pub struct AngleResnet {
    linear_in: Linear,
    linear_initial: Linear,
    layers: Vec<AngleResnetBlock>,
    linear_out: Linear,
    no_angles: usize,
    eps: f64,
}

impl AngleResnet {
    pub fn load(vb: VarBuilder, c_s: usize, cfg: &StructureModuleConfig) -> Result<Self> {
        let c = cfg.c_resnet;
        let layers = (0..cfg.no_resnet_blocks)
            .map(|i| {
                let vb = vb.pp(format!("layers.{i}"));
                Ok(AngleResnetBlock {
                    linear_1: Linear::new(vb.pp("linear_1"), c, c, LinearInit::Relu)?,
                    linear_2: Linear::new(vb.pp("linear_2"), c, c, LinearInit::Final)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            linear_in: Linear::new(vb.pp("linear_in"), c_s, c, LinearInit::Default)?,
            linear_initial: Linear::new(vb.pp("linear_initial"), c_s, c, LinearInit::Default)?,
            layers,
            linear_out: Linear::new(vb.pp("linear_out"), c, cfg.no_angles * 2, LinearInit::Default)?,
            no_angles: cfg.no_angles,
            eps: cfg.epsilon,
        })
    }

    /// Returns `(unnormalized, normalized)`, both `[B, N, 7, 2]`.
    pub fn forward(&self, s: &Tensor, s_initial: &Tensor) -> Result<(Tensor, Tensor)> {
        let s_initial = self.linear_initial.forward(&s_initial.relu()?)?;
        let mut s = (self.linear_in.forward(&s.relu()?)? + s_initial)?;
        for block in &self.layers {
            let a = block.linear_1.forward(&s.relu()?)?;
            let a = block.linear_2.forward(&a.relu()?)?;
            s = (s + a)?;
        }
        let s = self.linear_out.forward(&s.relu()?)?;
        let mut shape = s.dims()[..s.rank() - 1].to_vec();
        shape.extend([self.no_angles, 2]);
        let unnormalized = s.reshape(shape)?;
        let denom = unnormalized
            .sqr()?
            .sum_keepdim(D::Minus1)?
            .clamp(self.eps, f64::INFINITY)?
            .sqrt()?;
        let normalized = unnormalized.broadcast_div(&denom)?;
        Ok((unnormalized, normalized))
    }
}

/// Per-block outputs stacked on a leading block axis `L`.
#[derive(Clone, Debug)]
pub struct StructureOutputs {
    /// `[L, B, N, 7]` backbone frames (quaternion, translation), scaled.
    pub frames: Tensor,
    /// `[L, B, N, 8, 4, 4]`
    pub sidechain_frames: Tensor,
    /// `[L, B, N, 7, 2]`
    pub unnormalized_angles: Tensor,
    pub angles: Tensor,
    /// `[L, B, N, 14, 3]`
    pub positions: Tensor,
    /// `[L, B, N, C_s]`
    pub states: Tensor,
    /// `[B, N, C_s]` single representation after the last block.
    pub single: Tensor,
}

#[derive(Clone, Debug)]
pub struct StructureModule {
    layer_norm_s: LayerNorm,
    layer_norm_z: LayerNorm,
    linear_in: Linear,
    ipa: InvariantPointAttention,
    layer_norm_ipa: LayerNorm,
    transition: StructureTransition,
    bb_update: Linear,
    angle_resnet: AngleResnet,
    tables: ResidueTables,
    no_blocks: usize,
    trans_scale_factor: f64,
    use_backbone_update: bool,
}

impl StructureModule {
    pub fn load(vb: VarBuilder, cfg: &StructureModuleConfig, g: &GlobalsConfig) -> Result<Self> {
        let k = g.kernels;
        Ok(Self {
            layer_norm_s: LayerNorm::load(vb.pp("layer_norm_s"), g.c_s, k)?,
            layer_norm_z: LayerNorm::load(vb.pp("layer_norm_z"), g.c_z, k)?,
            linear_in: Linear::new(vb.pp("linear_in"), g.c_s, g.c_s, LinearInit::Default)?,
            ipa: InvariantPointAttention::load(vb.pp("ipa"), g.c_s, g.c_z, cfg)?,
            layer_norm_ipa: LayerNorm::load(vb.pp("layer_norm_ipa"), g.c_s, k)?,
            transition: StructureTransition::load(vb.pp("transition"), g.c_s, cfg.no_transition_layers, k)?,
            bb_update: Linear::new(vb.pp("bb_update"), g.c_s, 6, LinearInit::Final)?,
            angle_resnet: AngleResnet::load(vb.pp("angle_resnet"), g.c_s, cfg)?,
            tables: ResidueTables::new(vb.device())?,
            no_blocks: cfg.no_blocks,
            trans_scale_factor: cfg.trans_scale_factor,
            use_backbone_update: cfg.use_backbone_update,
        })
    }

    pub fn tables(&self) -> &ResidueTables {
        &self.tables
    }

    /// `single [B, N, C_s]`, `pair [B, N, N, C_z]`, `aatype [B, N]`, `mask [B, N]`.
    ///
    /// `init` seeds the frames in physical units; identity frames are used without it.
    #[tracing::instrument(level = "debug", skip_all, fields(blocks = self.no_blocks))]
    pub fn forward(
        &self,
        single: &Tensor,
        pair: &Tensor,
        aatype: &Tensor,
        mask: &Tensor,
        init: Option<&Rigid>,
    ) -> Result<StructureOutputs> {
        let (b, n, _) = single.dims3()?;
        let s = self.layer_norm_s.forward(single)?;
        let z = self.layer_norm_z.forward(pair)?;
        let s_initial = s.clone();
        let mut s = self.linear_in.forward(&s)?;
        let mut rigids = match init {
            Some(r) => r.scale_translation(1.0 / self.trans_scale_factor)?,
            None => Rigid::identity(&[b, n], single.device())?,
        };

        let mut frames = Vec::with_capacity(self.no_blocks);
        let mut sidechain_frames = Vec::with_capacity(self.no_blocks);
        let mut unnormalized_angles = Vec::with_capacity(self.no_blocks);
        let mut angles = Vec::with_capacity(self.no_blocks);
        let mut positions = Vec::with_capacity(self.no_blocks);
        let mut states = Vec::with_capacity(self.no_blocks);
        for _ in 0..self.no_blocks {
            s = (&s + self.ipa.forward(&s, &z, &rigids, mask)?)?;
            s = self.layer_norm_ipa.forward(&s)?;
            s = self.transition.forward(&s)?;
            if self.use_backbone_update {
                rigids = rigids.compose_q_update_vec(&self.bb_update.forward(&s)?)?;
            }
            let scaled = rigids.scale_translation(self.trans_scale_factor)?;
            let (unnormalized, normalized) = self.angle_resnet.forward(&s, &s_initial)?;
            let all_frames = torsion_angles_to_frames(&scaled, &normalized, aatype, &self.tables)?;
            let atom14 = frames_and_literature_positions_to_atom14_pos(&all_frames, aatype, &self.tables)?;

            frames.push(scaled.to_tensor_7()?);
            sidechain_frames.push(all_frames.to_tensor_4x4()?);
            unnormalized_angles.push(unnormalized);
            angles.push(normalized);
            positions.push(atom14);
            states.push(s.clone());
            rigids = rigids.detach_rot();
        }
        Ok(StructureOutputs {
            frames: Tensor::stack(&frames, 0)?,
            sidechain_frames: Tensor::stack(&sidechain_frames, 0)?,
            unnormalized_angles: Tensor::stack(&unnormalized_angles, 0)?,
            angles: Tensor::stack(&angles, 0)?,
            positions: Tensor::stack(&positions, 0)?,
            states: Tensor::stack(&states, 0)?,
            single: s,
        })
    }
}
