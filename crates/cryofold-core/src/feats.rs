//! Tensor featurization helpers shared by the network stages and the loss.
//!
//! All functions are rank-generic over leading axes: a residue axis `N` is always followed by
//! the per-residue feature axes shown in the shape comments.
use crate::residue_constants::{
    ResidueConstants, ATOM14_NUM, ATOM_TYPE_NUM, CA_ATOM, CB_ATOM, C_ATOM, GLY_INDEX, N_ATOM,
    RIGID_GROUP_NUM,
};
use crate::rigid::{Rigid, Rotation};
use candle_core::{DType, Device, Result, Tensor, D};
use candle_nn::encoding::one_hot;

/// Category count of the template and target aatype one-hot (20 + unknown + gap).
pub const AATYPE_ONE_HOT: usize = 22;
/// Category count of the extra-MSA one-hot (20 + unknown + gap + mask).
pub const EXTRA_MSA_ONE_HOT: usize = 23;

pub const TEMPLATE_PAIR_FEAT_DIM: usize = 88;
pub const TEMPLATE_ANGLE_FEAT_DIM: usize = 57;
pub const EXTRA_MSA_FEAT_DIM: usize = 25;

/// Residue-type lookup tables materialised once on a device.
#[derive(Clone, Debug)]
pub struct ResidueTables {
    pub atom14_to_atom37: Tensor,
    pub atom37_to_atom14: Tensor,
    pub atom14_mask: Tensor,
    pub atom37_mask: Tensor,
    pub group_idx: Tensor,
    pub lit_positions: Tensor,
    pub default_frames: Tensor,
    pub chi_pi_periodic: Tensor,
}

impl ResidueTables {
    pub fn new(device: &Device) -> Result<Self> {
        let rc = ResidueConstants::new();
        Ok(Self {
            atom14_to_atom37: rc.atom14_to_atom37_tensor(device)?,
            atom37_to_atom14: rc.atom37_to_atom14_tensor(device)?,
            atom14_mask: rc.atom14_mask_tensor(device)?,
            atom37_mask: rc.atom37_mask_tensor(device)?,
            group_idx: rc.group_idx_tensor(device)?,
            lit_positions: rc.lit_positions_tensor(device)?,
            default_frames: rc.default_frames_tensor(device)?,
            chi_pi_periodic: rc.chi_pi_periodic_tensor(device)?,
        })
    }

    /// Looks up `table[aatype]`, keeping the leading axes of `aatype`.
    pub fn lookup(table: &Tensor, aatype: &Tensor) -> Result<Tensor> {
        let mut shape = aatype.dims().to_vec();
        shape.extend_from_slice(&table.dims()[1..]);
        let flat = aatype.flatten_all()?.to_dtype(DType::U32)?;
        table.index_select(&flat, 0)?.reshape(shape)
    }

    /// `[*, N, 37]` mask of atoms that exist for each residue type.
    pub fn atom37_exists(&self, aatype: &Tensor) -> Result<Tensor> {
        Self::lookup(&self.atom37_mask, aatype)
    }

    pub fn atom14_exists(&self, aatype: &Tensor) -> Result<Tensor> {
        Self::lookup(&self.atom14_mask, aatype)
    }
}

fn atom_slice(positions: &Tensor, atom: usize) -> Result<Tensor> {
    // [*, N, A, C] -> [*, N, C]
    let r = positions.rank();
    positions.narrow(r - 2, atom, 1)?.squeeze(r - 2)
}

/// Cβ position per residue, or Cα for glycine.
///
/// Returns `[*, N, 3]` and, when an atom mask is supplied, the matching `[*, N]` mask.
pub fn pseudo_beta(
    aatype: &Tensor,
    all_atom_positions: &Tensor,
    all_atom_mask: Option<&Tensor>,
) -> Result<(Tensor, Option<Tensor>)> {
    let is_gly = aatype.eq(GLY_INDEX)?;
    let ca = atom_slice(all_atom_positions, CA_ATOM)?;
    let cb = atom_slice(all_atom_positions, CB_ATOM)?;
    let cond = is_gly.unsqueeze(is_gly.rank())?.broadcast_as(ca.shape())?;
    let positions = cond.where_cond(&ca, &cb)?;
    let mask = match all_atom_mask {
        Some(mask) => {
            let ca_m = mask_slice(mask, CA_ATOM)?;
            let cb_m = mask_slice(mask, CB_ATOM)?;
            Some(is_gly.where_cond(&ca_m, &cb_m)?)
        }
        None => None,
    };
    Ok((positions, mask))
}

/// Scatters `[*, N, 14, 3]` atom14 coordinates into the `[*, N, 37, 3]` layout.
pub fn atom14_to_atom37(atom14: &Tensor, aatype: &Tensor, tables: &ResidueTables) -> Result<Tensor> {
    let lead = aatype.dims().to_vec();
    let m: usize = lead.iter().product();
    let idx = ResidueTables::lookup(&tables.atom37_to_atom14, aatype)?
        .reshape((m, ATOM_TYPE_NUM, 1))?
        .broadcast_as((m, ATOM_TYPE_NUM, 3))?
        .contiguous()?;
    let atom14 = atom14.reshape((m, ATOM14_NUM, 3))?.contiguous()?;
    let atom37 = atom14.gather(&idx, 1)?;
    let exists = tables
        .atom37_exists(aatype)?
        .reshape((m, ATOM_TYPE_NUM, 1))?
        .to_dtype(atom37.dtype())?;
    let mut shape = lead;
    shape.extend([ATOM_TYPE_NUM, 3]);
    atom37.broadcast_mul(&exists)?.reshape(shape)
}

/// Backbone frame with CA at the origin, C on the +x axis and N in the xy plane (+y side).
pub fn backbone_frames(n: &Tensor, ca: &Tensor, c: &Tensor, eps: f64) -> Result<Rigid> {
    let neg_x = ((ca * 2.0)? - c)?;
    Rigid::from_3_points(&neg_x, ca, n, eps)
}

/// Backbone frames from `[*, N, 37, 3]` positions.
pub fn backbone_frames_from_atom37(positions: &Tensor, eps: f64) -> Result<Rigid> {
    backbone_frames(
        &atom_slice(positions, N_ATOM)?,
        &atom_slice(positions, CA_ATOM)?,
        &atom_slice(positions, C_ATOM)?,
        eps,
    )
}

/// Squared-distance bin edges `(lower, upper)`; the last upper edge is `inf`.
pub fn squared_bin_edges(
    min_bin: f64,
    max_bin: f64,
    no_bins: usize,
    inf: f64,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let step = if no_bins > 1 {
        (max_bin - min_bin) / (no_bins - 1) as f64
    } else {
        0.0
    };
    let lower: Vec<f32> = (0..no_bins)
        .map(|i| (min_bin + step * i as f64).powi(2) as f32)
        .collect();
    let mut upper: Vec<f32> = lower.iter().skip(1).copied().collect();
    upper.push(inf as f32);
    Ok((Tensor::new(lower, device)?, Tensor::new(upper, device)?))
}

/// One-hot `[*, N, N, no_bins]` of squared pairwise distances of `[*, N, 3]` points.
pub fn distance_histogram(
    points: &Tensor,
    min_bin: f64,
    max_bin: f64,
    no_bins: usize,
    inf: f64,
) -> Result<Tensor> {
    let r = points.rank();
    let d = points
        .unsqueeze(r - 1)?
        .broadcast_sub(&points.unsqueeze(r - 2)?)?
        .sqr()?
        .sum_keepdim(D::Minus1)?;
    let (lower, upper) = squared_bin_edges(min_bin, max_bin, no_bins, inf, points.device())?;
    let above = d.broadcast_gt(&lower)?.to_dtype(points.dtype())?;
    let below = d.broadcast_lt(&upper)?.to_dtype(points.dtype())?;
    above * below
}

fn mask_slice(mask: &Tensor, atom: usize) -> Result<Tensor> {
    // [*, N, A] -> [*, N]
    let r = mask.rank();
    mask.narrow(r - 1, atom, 1)?.squeeze(r - 1)
}

fn outer_mask(mask: &Tensor) -> Result<Tensor> {
    let r = mask.rank();
    mask.unsqueeze(r)?.broadcast_mul(&mask.unsqueeze(r - 1)?)
}

/// Inputs of the per-template pair feature, all with shared leading axes `[*]`.
pub struct TemplatePairInputs<'a> {
    /// `[*, N]`
    pub aatype: &'a Tensor,
    /// `[*, N, 37, 3]`
    pub all_atom_positions: &'a Tensor,
    /// `[*, N, 37]`
    pub all_atom_mask: &'a Tensor,
    /// `[*, N, 3]`
    pub pseudo_beta: &'a Tensor,
    /// `[*, N]`
    pub pseudo_beta_mask: &'a Tensor,
}

#[derive(Clone, Copy, Debug)]
pub struct DistogramBins {
    pub min_bin: f64,
    pub max_bin: f64,
    pub no_bins: usize,
}

/// `[*, N, N, 88]` template pair feature: distance histogram, pseudo-beta mask, the aatype
/// one-hot along columns and rows, unit vectors in the backbone frame and the backbone mask.
pub fn build_template_pair_feat(
    t: &TemplatePairInputs,
    bins: DistogramBins,
    use_unit_vector: bool,
    eps: f64,
    inf: f64,
) -> Result<Tensor> {
    let dtype = t.pseudo_beta.dtype();
    let pb_mask_2d = outer_mask(&t.pseudo_beta_mask.to_dtype(dtype)?)?;
    let dgram = distance_histogram(t.pseudo_beta, bins.min_bin, bins.max_bin, bins.no_bins, inf)?;

    let n_res = t.aatype.dim(D::Minus1)?;
    let aa = one_hot(t.aatype.to_dtype(DType::U32)?, AATYPE_ONE_HOT, 1f32, 0f32)?.to_dtype(dtype)?;
    let ar = aa.rank();
    let mut pair_shape = aa.dims()[..ar - 1].to_vec();
    pair_shape.insert(ar - 2, n_res);
    pair_shape.push(AATYPE_ONE_HOT);
    let aa_col = aa.unsqueeze(ar - 2)?.broadcast_as(pair_shape.as_slice())?;
    let aa_row = aa.unsqueeze(ar - 1)?.broadcast_as(pair_shape.as_slice())?;

    let frames = backbone_frames_from_atom37(t.all_atom_positions, eps)?;
    let fr = frames.trans().rank();
    let points = frames.trans().unsqueeze(fr - 2)?;
    let rigid_vec = frames.unsqueeze(fr - 1)?.invert_apply(&points)?;
    let inv_distance = rigid_vec
        .sqr()?
        .sum(D::Minus1)?
        .affine(1.0, eps)?
        .sqrt()?
        .recip()?;

    let mask = t.all_atom_mask.to_dtype(dtype)?;
    let bb_mask = ((mask_slice(&mask, N_ATOM)? * mask_slice(&mask, CA_ATOM)?)?
        * mask_slice(&mask, C_ATOM)?)?;
    let bb_mask_2d = outer_mask(&bb_mask)?;
    let inv_distance = (inv_distance * &bb_mask_2d)?;
    let mut unit_vector = rigid_vec.broadcast_mul(&inv_distance.unsqueeze(inv_distance.rank())?)?;
    if !use_unit_vector {
        unit_vector = unit_vector.zeros_like()?;
    }

    let bb_mask_2d = bb_mask_2d.unsqueeze(bb_mask_2d.rank())?;
    let act = Tensor::cat(
        &[
            &dgram,
            &pb_mask_2d.unsqueeze(pb_mask_2d.rank())?,
            &aa_col,
            &aa_row,
            &unit_vector,
            &bb_mask_2d,
        ],
        D::Minus1,
    )?;
    act.broadcast_mul(&bb_mask_2d)
}

/// `[*, N, 57]` template angle feature.
pub fn build_template_angle_feat(
    aatype: &Tensor,
    torsion_angles_sin_cos: &Tensor,
    alt_torsion_angles_sin_cos: &Tensor,
    torsion_angles_mask: &Tensor,
) -> Result<Tensor> {
    let dtype = torsion_angles_sin_cos.dtype();
    let aa = one_hot(aatype.to_dtype(DType::U32)?, AATYPE_ONE_HOT, 1f32, 0f32)?.to_dtype(dtype)?;
    let r = torsion_angles_sin_cos.rank();
    let sin_cos = torsion_angles_sin_cos.flatten(r - 2, r - 1)?;
    let alt = alt_torsion_angles_sin_cos.flatten(r - 2, r - 1)?;
    Tensor::cat(&[&aa, &sin_cos, &alt, &torsion_angles_mask.to_dtype(dtype)?], D::Minus1)
}

/// `[*, E, N, 25]` extra-MSA feature.
pub fn build_extra_msa_feat(
    extra_msa: &Tensor,
    has_deletion: &Tensor,
    deletion_value: &Tensor,
) -> Result<Tensor> {
    let dtype = deletion_value.dtype();
    let msa = one_hot(extra_msa.to_dtype(DType::U32)?, EXTRA_MSA_ONE_HOT, 1f32, 0f32)?.to_dtype(dtype)?;
    let r = has_deletion.rank();
    Tensor::cat(
        &[
            &msa,
            &has_deletion.to_dtype(dtype)?.unsqueeze(r)?,
            &deletion_value.unsqueeze(r)?,
        ],
        D::Minus1,
    )
}

/// Composes backbone frames `[*, N]` with the seven torsions `[*, N, 7, 2]` (sin, cos) into the
/// eight rigid-group frames `[*, N, 8]` in the global frame.
pub fn torsion_angles_to_frames(
    r: &Rigid,
    alpha: &Tensor,
    aatype: &Tensor,
    tables: &ResidueTables,
) -> Result<Rigid> {
    let default_4x4 = ResidueTables::lookup(&tables.default_frames, aatype)?.to_dtype(alpha.dtype())?;
    let default_r = Rigid::from_tensor_4x4(&default_4x4)?;

    let ar = alpha.rank();
    // Backbone group has no torsion: sin 0, cos 1.
    let mut bb_shape = alpha.dims().to_vec();
    bb_shape[ar - 2] = 1;
    let bb = Tensor::new(&[0f32, 1.], alpha.device())?
        .to_dtype(alpha.dtype())?
        .broadcast_as(bb_shape)?;
    let alpha = Tensor::cat(&[&bb, alpha], ar - 2)?; // [*, N, 8, 2]

    let sin = alpha.narrow(D::Minus1, 0, 1)?;
    let cos = alpha.narrow(D::Minus1, 1, 1)?;
    let zeros = sin.zeros_like()?;
    let ones = sin.ones_like()?;
    let rows = [
        Tensor::cat(&[&ones, &zeros, &zeros], D::Minus1)?,
        Tensor::cat(&[&zeros, &cos, &sin.neg()?], D::Minus1)?,
        Tensor::cat(&[&zeros, &sin, &cos], D::Minus1)?,
    ];
    let all_rots = Tensor::stack(&rows, ar - 1)?;
    let all_rots = Rigid::new(
        Rotation::from_rot_mats(all_rots)?,
        default_r.trans().zeros_like()?,
    )?;
    let all_frames = default_r.compose(&all_rots)?;

    let g = ar - 2; // rigid-group axis
    let chi1_to_bb = all_frames.narrow(g, 4, 1)?;
    let chi2_to_bb = chi1_to_bb.compose(&all_frames.narrow(g, 5, 1)?)?;
    let chi3_to_bb = chi2_to_bb.compose(&all_frames.narrow(g, 6, 1)?)?;
    let chi4_to_bb = chi3_to_bb.compose(&all_frames.narrow(g, 7, 1)?)?;
    let to_bb = Rigid::cat(
        &[all_frames.narrow(g, 0, 5)?, chi2_to_bb, chi3_to_bb, chi4_to_bb],
        g,
    )?;
    r.unsqueeze(g)?.compose(&to_bb)
}

/// Places the literature atom positions `[*, N, 14, 3]` with the rigid-group frames `[*, N, 8]`.
pub fn frames_and_literature_positions_to_atom14_pos(
    frames: &Rigid,
    aatype: &Tensor,
    tables: &ResidueTables,
) -> Result<Tensor> {
    let dtype = frames.trans().dtype();
    let group_idx = ResidueTables::lookup(&tables.group_idx, aatype)?;
    let group_mask = one_hot(group_idx, RIGID_GROUP_NUM, 1f32, 0f32)?.to_dtype(dtype)?; // [*, N, 14, 8]

    let gr = group_mask.rank();
    // [*, N, 1, 8, 3, 3] x [*, N, 14, 8, 1, 1] -> sum over groups
    let rot = frames.rots().rot_mats();
    let rot = rot
        .unsqueeze(gr - 2)?
        .broadcast_mul(&group_mask.unsqueeze(gr)?.unsqueeze(gr + 1)?)?
        .sum(gr - 1)?;
    let trans = frames
        .trans()
        .unsqueeze(gr - 2)?
        .broadcast_mul(&group_mask.unsqueeze(gr)?)?
        .sum(gr - 1)?;
    let atoms_to_global = Rigid::new(Rotation::from_rot_mats(rot)?, trans)?;

    let atom_mask = ResidueTables::lookup(&tables.atom14_mask, aatype)?.to_dtype(dtype)?;
    let lit = ResidueTables::lookup(&tables.lit_positions, aatype)?.to_dtype(dtype)?;
    atoms_to_global
        .apply(&lit)?
        .broadcast_mul(&atom_mask.unsqueeze(atom_mask.rank())?)
}

/// Registration between physical coordinates and the unit cube of the density map.
///
/// Each field broadcasts against `[*, B, N, 3]` coordinates (shape `[B, 1, 3]`).
#[derive(Clone, Debug)]
pub struct DensityRegistration {
    pub offset: Tensor,
    pub apix: Tensor,
    pub size: Tensor,
}

impl DensityRegistration {
    /// `offset [B, 3]`, `apix [B]` or `[B, 3]`, `size [B, 3]`.
    pub fn new(offset: &Tensor, apix: &Tensor, size: &Tensor) -> Result<Self> {
        let b = offset.dim(0)?;
        let apix = match apix.rank() {
            1 => apix.reshape((b, 1, 1))?,
            _ => apix.reshape((b, 1, 3))?,
        };
        Ok(Self {
            offset: offset.reshape((b, 1, 3))?.to_dtype(DType::F32)?,
            apix: apix.to_dtype(DType::F32)?,
            size: size.reshape((b, 1, 3))?.to_dtype(DType::F32)?,
        })
    }

    /// `(ca / apix - offset) / size`
    pub fn to_normed_ca(&self, ca: &Tensor) -> Result<Tensor> {
        ca.broadcast_div(&self.apix)?
            .broadcast_sub(&self.offset)?
            .broadcast_div(&self.size)
    }

    /// `(normed * size + offset) * apix`
    pub fn to_physical(&self, normed: &Tensor) -> Result<Tensor> {
        normed
            .broadcast_mul(&self.size)?
            .broadcast_add(&self.offset)?
            .broadcast_mul(&self.apix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::residue_constants::RESTYPE_NUM;

    fn tables() -> ResidueTables {
        ResidueTables::new(&Device::Cpu).unwrap()
    }

    #[test]
    fn test_pseudo_beta_uses_ca_for_glycine() -> Result<()> {
        let device = Device::Cpu;
        let aatype = Tensor::new(&[0u32, GLY_INDEX], &device)?;
        let mut pos = vec![0f32; 2 * ATOM_TYPE_NUM * 3];
        // CA of each residue at x = 1, CB at x = 2.
        for r in 0..2 {
            pos[(r * ATOM_TYPE_NUM + CA_ATOM) * 3] = 1.0;
            pos[(r * ATOM_TYPE_NUM + CB_ATOM) * 3] = 2.0;
        }
        let pos = Tensor::from_vec(pos, (2, ATOM_TYPE_NUM, 3), &device)?;
        let (pb, _) = pseudo_beta(&aatype, &pos, None)?;
        let pb = pb.to_vec2::<f32>()?;
        assert_eq!(pb[0][0], 2.0);
        assert_eq!(pb[1][0], 1.0);
        Ok(())
    }

    #[test]
    fn test_identity_frames_reproduce_literature_backbone() -> Result<()> {
        let device = Device::Cpu;
        let tables = tables();
        let aatype = Tensor::arange(0u32, RESTYPE_NUM as u32, &device)?;
        let frames = Rigid::identity(&[RESTYPE_NUM], &device)?;
        let alpha = Tensor::cat(
            &[
                Tensor::zeros((RESTYPE_NUM, 7, 1), DType::F32, &device)?,
                Tensor::ones((RESTYPE_NUM, 7, 1), DType::F32, &device)?,
            ],
            2,
        )?;
        let all_frames = torsion_angles_to_frames(&frames, &alpha, &aatype, &tables)?;
        assert_eq!(all_frames.batch_shape(), &[RESTYPE_NUM, 8]);
        let atom14 = frames_and_literature_positions_to_atom14_pos(&all_frames, &aatype, &tables)?;
        assert_eq!(atom14.dims(), &[RESTYPE_NUM, 14, 3]);
        let atom14 = atom14.to_vec3::<f32>()?;
        let rc = ResidueConstants::new();
        for restype in 0..RESTYPE_NUM {
            // N, CA, C live in the backbone group and are placed verbatim.
            for slot in 0..3 {
                for k in 0..3 {
                    let expected = rc.atom14_lit_positions[restype][slot][k];
                    assert!((atom14[restype][slot][k] - expected).abs() < 1e-5);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_atom14_to_atom37_places_backbone() -> Result<()> {
        let device = Device::Cpu;
        let tables = tables();
        let aatype = Tensor::new(&[[0u32, 17]], &device)?;
        let atom14 = Tensor::arange(0f32, (2 * 14 * 3) as f32, &device)?.reshape((1, 2, 14, 3))?;
        let atom37 = atom14_to_atom37(&atom14, &aatype, &tables)?;
        assert_eq!(atom37.dims(), &[1, 2, 37, 3]);
        let atom37 = atom37.squeeze(0)?.to_vec3::<f32>()?;
        // CA is atom14 slot 1 and atom37 slot 1; O is atom14 slot 3 and atom37 slot 4.
        assert_eq!(atom37[0][CA_ATOM], vec![3.0, 4.0, 5.0]);
        assert_eq!(atom37[0][4], vec![9.0, 10.0, 11.0]);
        // Alanine has no CG.
        assert_eq!(atom37[0][5], vec![0.0, 0.0, 0.0]);
        Ok(())
    }

    #[test]
    fn test_feature_widths() -> Result<()> {
        let device = Device::Cpu;
        let (t, n) = (2, 5);
        let aatype = Tensor::zeros((t, n), DType::U32, &device)?;
        let positions = Tensor::randn(0f32, 3.0, (t, n, ATOM_TYPE_NUM, 3), &device)?;
        let mask = Tensor::ones((t, n, ATOM_TYPE_NUM), DType::F32, &device)?;
        let (pb, pb_mask) = pseudo_beta(&aatype, &positions, Some(&mask))?;
        let pb_mask = pb_mask.expect("mask requested");
        let pair = build_template_pair_feat(
            &TemplatePairInputs {
                aatype: &aatype,
                all_atom_positions: &positions,
                all_atom_mask: &mask,
                pseudo_beta: &pb,
                pseudo_beta_mask: &pb_mask,
            },
            DistogramBins { min_bin: 3.25, max_bin: 50.75, no_bins: 39 },
            true,
            1e-6,
            1e5,
        )?;
        assert_eq!(pair.dims(), &[t, n, n, TEMPLATE_PAIR_FEAT_DIM]);
        // At most one distance bin is hot for every pair; the diagonal falls below the first edge.
        let hot = pair.narrow(3, 0, 39)?.sum(3)?;
        let flat = hot.flatten_all()?.to_vec1::<f32>()?;
        assert!(flat.iter().all(|&h| h == 0.0 || h == 1.0));
        let diag = hot.get(0)?.get(0)?.get(0)?.to_scalar::<f32>()?;
        assert_eq!(diag, 0.0);

        let sin_cos = Tensor::zeros((t, n, 7, 2), DType::F32, &device)?;
        let tmask = Tensor::ones((t, n, 7), DType::F32, &device)?;
        let angle = build_template_angle_feat(&aatype, &sin_cos, &sin_cos, &tmask)?;
        assert_eq!(angle.dims(), &[t, n, TEMPLATE_ANGLE_FEAT_DIM]);

        let extra = Tensor::zeros((3, n), DType::U32, &device)?;
        let del = Tensor::zeros((3, n), DType::F32, &device)?;
        let extra = build_extra_msa_feat(&extra, &del, &del)?;
        assert_eq!(extra.dims(), &[3, n, EXTRA_MSA_FEAT_DIM]);
        Ok(())
    }

    #[test]
    fn test_registration_round_trip() -> Result<()> {
        let device = Device::Cpu;
        let reg = DensityRegistration::new(
            &Tensor::new(&[[2f32, -1.0, 0.5]], &device)?,
            &Tensor::new(&[1.5f32], &device)?,
            &Tensor::new(&[[32f32, 32.0, 32.0]], &device)?,
        )?;
        let ca = Tensor::new(&[[[10f32, 20.0, 30.0], [-3.0, 0.0, 4.5]]], &device)?;
        let back = reg.to_physical(&reg.to_normed_ca(&ca)?)?;
        let diff = (back - &ca)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        assert!(diff < 1e-4);
        Ok(())
    }
}
