//! Evaluation metrics on predicted coordinates.
//!
//! Distance-based scores (`drmsd`, `lddt`) stay on device; superimposition is a host-side Kabsch
//! fit per batch element.
use crate::residue_constants::CA_ATOM;
use candle_core::{DType, Device, Result, Tensor, D};
use nalgebra::{Matrix3, Point3, Rotation3, Vector3};
use std::collections::BTreeMap;
use thiserror::Error;

/// Alignment RMSD reported when superimposition fails.
pub const DRMSD_AL_SENTINEL: f32 = 10.0;
/// GDT reported when superimposition fails.
pub const GDT_SENTINEL: f32 = 0.0;

#[derive(Error, Debug)]
pub enum SuperimposeError {
    #[error("superimposition needs at least 3 points, got {0}")]
    TooFewPoints(usize),
    #[error("degenerate coordinate set")]
    Degenerate,
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

/// Rigid transform mapping `from_points` onto `to_points` in the least-squares sense.
pub fn kabsch(
    from_points: &[Point3<f64>],
    to_points: &[Point3<f64>],
) -> std::result::Result<(Rotation3<f64>, Vector3<f64>), SuperimposeError> {
    if from_points.len() < 3 {
        return Err(SuperimposeError::TooFewPoints(from_points.len()));
    }
    let n = from_points.len() as f64;
    let from_centroid = Point3::from(from_points.iter().map(|p| p.coords).sum::<Vector3<f64>>() / n);
    let to_centroid = Point3::from(to_points.iter().map(|p| p.coords).sum::<Vector3<f64>>() / n);

    let h = from_points
        .iter()
        .zip(to_points.iter())
        .fold(Matrix3::zeros(), |acc, (f, t)| {
            acc + (t - to_centroid) * (f - from_centroid).transpose()
        });

    let svd = h.svd(true, true);
    let (u, v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => return Err(SuperimposeError::Degenerate),
    };
    let mut correction = Matrix3::identity();
    if (u * v_t).determinant() < 0.0 {
        correction[(2, 2)] = -1.0;
    }
    let rotation_matrix = u * correction * v_t;
    if rotation_matrix.iter().any(|x| !x.is_finite()) {
        return Err(SuperimposeError::Degenerate);
    }
    let rotation = Rotation3::from_matrix(&rotation_matrix);
    let translation = to_centroid.coords - rotation * from_centroid.coords;
    Ok((rotation, translation))
}

/// Superimposes `coords [B, N, 3]` onto `reference [B, N, 3]` using the points where
/// `mask [B, N]` is set. Returns the moved coordinates and the per-element RMSD `[B]`.
pub fn superimpose(
    reference: &Tensor,
    coords: &Tensor,
    mask: &Tensor,
) -> std::result::Result<(Tensor, Tensor), SuperimposeError> {
    let reference = reference.to_dtype(DType::F64)?.to_vec3::<f64>()?;
    let coords_v = coords.to_dtype(DType::F64)?.to_vec3::<f64>()?;
    let mask = mask.to_dtype(DType::F32)?.to_vec2::<f32>()?;

    let mut moved = Vec::new();
    let mut rmsds = Vec::with_capacity(reference.len());
    for ((r, c), m) in reference.iter().zip(coords_v.iter()).zip(mask.iter()) {
        let keep: Vec<usize> = (0..m.len()).filter(|&i| m[i] > 0.0).collect();
        let to_pts: Vec<Point3<f64>> = keep.iter().map(|&i| Point3::new(r[i][0], r[i][1], r[i][2])).collect();
        let from_pts: Vec<Point3<f64>> = keep.iter().map(|&i| Point3::new(c[i][0], c[i][1], c[i][2])).collect();
        let (rot, trans) = kabsch(&from_pts, &to_pts)?;

        let mut sq = 0.0;
        for (f, t) in from_pts.iter().zip(to_pts.iter()) {
            sq += ((rot * f.coords + trans) - t.coords).norm_squared();
        }
        rmsds.push((sq / keep.len() as f64).sqrt() as f32);
        for p in c.iter() {
            let q = rot * Vector3::new(p[0], p[1], p[2]) + trans;
            moved.extend([q.x as f32, q.y as f32, q.z as f32]);
        }
    }
    let moved = Tensor::from_vec(moved, coords.shape(), coords.device())?;
    let rmsds = Tensor::new(rmsds, coords.device())?;
    Ok((moved, rmsds))
}

fn pairwise_distances(x: &Tensor, eps: f64) -> Result<Tensor> {
    let r = x.rank();
    x.unsqueeze(r - 1)?
        .broadcast_sub(&x.unsqueeze(r - 2)?)?
        .sqr()?
        .sum(D::Minus1)?
        .affine(1.0, eps)?
        .sqrt()
}

/// Distance-matrix RMSD between `[B, N, 3]` structures, averaged over the batch.
pub fn drmsd(structure_1: &Tensor, structure_2: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
    let d1 = pairwise_distances(structure_1, 0.0)?;
    let d2 = pairwise_distances(structure_2, 0.0)?;
    let mut sq = (d1 - d2)?.sqr()?;
    let n = match mask {
        Some(mask) => {
            let mask = mask.to_dtype(sq.dtype())?;
            let r = mask.rank();
            sq = sq.broadcast_mul(&mask.unsqueeze(r)?.broadcast_mul(&mask.unsqueeze(r - 1)?)?)?;
            mask.sum(D::Minus1)?
        }
        None => {
            let n_res = structure_1.dim(D::Minus2)? as f64;
            let lead = &structure_1.dims()[..structure_1.rank() - 2];
            Tensor::full(n_res as f32, lead, structure_1.device())?.to_dtype(sq.dtype())?
        }
    };
    let total = sq.sum(D::Minus1)?.sum(D::Minus1)?;
    let scale = (&n * (&n - 1.0)?)?.recip()?;
    let scale = n.gt(1.0)?.where_cond(&scale, &scale.zeros_like()?)?;
    (total * scale)?.sqrt()?.mean_all()
}

/// Fraction of positions within each cutoff, averaged over cutoffs.
pub fn gdt(p1: &Tensor, p2: &Tensor, mask: &Tensor, cutoffs: &[f64]) -> Result<Tensor> {
    let mask = mask.to_dtype(DType::F32)?;
    let n = mask.sum(D::Minus1)?;
    let distances = (p1.to_dtype(DType::F32)? - p2.to_dtype(DType::F32)?)?
        .sqr()?
        .sum(D::Minus1)?
        .sqrt()?;
    let mut total = Tensor::zeros((), DType::F32, p1.device())?;
    for &c in cutoffs {
        let within = distances.le(c)?.to_dtype(DType::F32)?;
        let score = (within * &mask)?.sum(D::Minus1)?.div(&n)?.mean_all()?;
        total = (total + score)?;
    }
    total / cutoffs.len() as f64
}

pub fn gdt_ts(p1: &Tensor, p2: &Tensor, mask: &Tensor) -> Result<Tensor> {
    gdt(p1, p2, mask, &[1., 2., 4., 8.])
}

pub fn gdt_ha(p1: &Tensor, p2: &Tensor, mask: &Tensor) -> Result<Tensor> {
    gdt(p1, p2, mask, &[0.5, 1., 2., 4.])
}

fn eye(n: usize, device: &Device) -> Result<Tensor> {
    let mut v = vec![0f32; n * n];
    for i in 0..n {
        v[i * n + i] = 1.0;
    }
    Tensor::from_vec(v, (n, n), device)
}

/// Local distance difference test over `[*, N, 3]` points with `[*, N, 1]` mask.
pub fn lddt(
    pred: &Tensor,
    truth: &Tensor,
    mask: &Tensor,
    cutoff: f64,
    eps: f64,
    per_residue: bool,
) -> Result<Tensor> {
    let n = mask.dim(D::Minus2)?;
    let dmat_true = pairwise_distances(truth, eps)?;
    let dmat_pred = pairwise_distances(pred, eps)?;

    let mr = mask.rank();
    let mask_2d = mask.broadcast_mul(&mask.transpose(mr - 2, mr - 1)?)?;
    let off_diag = eye(n, pred.device())?.affine(-1.0, 1.0)?.to_dtype(pred.dtype())?;
    let dists_to_score = dmat_true
        .lt(cutoff)?
        .to_dtype(pred.dtype())?
        .broadcast_mul(&mask_2d)?
        .broadcast_mul(&off_diag)?;

    let dist_l1 = (dmat_true - dmat_pred)?.abs()?;
    let mut score = dist_l1.zeros_like()?;
    for threshold in [0.5, 1.0, 2.0, 4.0] {
        score = (score + dist_l1.lt(threshold)?.to_dtype(pred.dtype())?)?;
    }
    let score = (score * 0.25)?;

    let (num, den) = if per_residue {
        (
            (&dists_to_score * &score)?.sum(D::Minus1)?,
            dists_to_score.sum(D::Minus1)?,
        )
    } else {
        (
            (&dists_to_score * &score)?.sum(D::Minus1)?.sum(D::Minus1)?,
            dists_to_score.sum(D::Minus1)?.sum(D::Minus1)?,
        )
    };
    num.affine(1.0, eps)?.div(&den.affine(1.0, eps)?)
}

/// lDDT on the Cα atoms of `[*, N, 37, 3]` coordinates.
pub fn lddt_ca(
    pred37: &Tensor,
    true37: &Tensor,
    mask37: &Tensor,
    cutoff: f64,
    eps: f64,
    per_residue: bool,
) -> Result<Tensor> {
    let r = pred37.rank();
    let pred = pred37.narrow(r - 2, CA_ATOM, 1)?.squeeze(r - 2)?;
    let truth = true37.narrow(r - 2, CA_ATOM, 1)?.squeeze(r - 2)?;
    let mask = mask37.narrow(r - 2, CA_ATOM, 1)?.to_dtype(pred.dtype())?;
    lddt(&pred, &truth, &mask, cutoff, eps, per_residue)
}

/// Top-1 accuracy in percent of `logits [M, C]` against `target [M]`.
pub fn accuracy(logits: &Tensor, target: &Tensor) -> Result<f32> {
    let m = target.elem_count();
    if m == 0 {
        return Ok(0.0);
    }
    let pred = logits.argmax(D::Minus1)?;
    let correct = pred
        .eq(&target.to_dtype(pred.dtype())?)?
        .to_dtype(DType::F32)?
        .sum_all()?
        .to_scalar::<f32>()?;
    Ok(correct * 100.0 / m as f32)
}

/// Cα metrics of `[B, N, 37, 3]` predictions against ground truth, keyed with `suffix`.
///
/// Superimposition failures are logged and replaced by sentinel values.
pub fn position_metrics(
    pred37: &Tensor,
    gt37: &Tensor,
    mask37: &Tensor,
    eps: f64,
    superimposition: bool,
    suffix: &str,
) -> Result<BTreeMap<String, f32>> {
    let mut metrics = BTreeMap::new();
    let mask37 = mask37.to_dtype(pred37.dtype())?;
    let atom_mask = mask37.unsqueeze(mask37.rank())?;
    let pred_masked = pred37.broadcast_mul(&atom_mask)?;
    let gt_masked = gt37.broadcast_mul(&atom_mask)?;
    let r = pred37.rank();
    let pred_ca = pred_masked.narrow(r - 2, CA_ATOM, 1)?.squeeze(r - 2)?;
    let gt_ca = gt_masked.narrow(r - 2, CA_ATOM, 1)?.squeeze(r - 2)?;
    let mask_ca = mask37.narrow(r - 2, CA_ATOM, 1)?.squeeze(r - 2)?;

    let lddt = lddt_ca(pred37, gt37, &mask37, 15.0, eps, false)?.mean_all()?;
    metrics.insert(format!("lddt_ca_{suffix}"), lddt.to_scalar::<f32>()?);
    let drmsd_ca = drmsd(&pred_ca, &gt_ca, Some(&mask_ca))?;
    metrics.insert(format!("drmsd_ca_{suffix}"), drmsd_ca.to_scalar::<f32>()?);

    if superimposition {
        let scores = superimpose(&gt_ca, &pred_ca, &mask_ca).and_then(|(moved, rmsd)| {
            let ts = gdt_ts(&moved, &gt_ca, &mask_ca)?.to_scalar::<f32>()?;
            let ha = gdt_ha(&moved, &gt_ca, &mask_ca)?.to_scalar::<f32>()?;
            let al = rmsd.mean_all()?.to_scalar::<f32>()?;
            Ok((al, ts, ha))
        });
        let (al, ts, ha) = match scores {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("superimposition failed ({e}), reporting sentinel metrics");
                (DRMSD_AL_SENTINEL, GDT_SENTINEL, GDT_SENTINEL)
            }
        };
        metrics.insert(format!("drmsd_al_{suffix}"), al);
        metrics.insert(format!("gdt_ts_{suffix}"), ts);
        metrics.insert(format!("gdt_ha_{suffix}"), ha);
    }
    Ok(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn helix(n: usize, device: &Device) -> Result<Tensor> {
        let mut v = Vec::with_capacity(n * 3);
        for i in 0..n {
            let t = i as f32 * 1.745;
            v.extend([2.3 * t.cos(), 2.3 * t.sin(), 1.5 * i as f32]);
        }
        Tensor::from_vec(v, (1, n, 3), device)
    }

    #[test]
    fn test_identical_structures_score_perfectly() -> Result<()> {
        let device = Device::Cpu;
        let x = helix(12, &device)?;
        let mask = Tensor::ones((1, 12), DType::F32, &device)?;
        assert!(drmsd(&x, &x, Some(&mask))?.to_scalar::<f32>()? < 1e-5);
        assert!((gdt_ts(&x, &x, &mask)?.to_scalar::<f32>()? - 1.0).abs() < 1e-6);
        let l = lddt(&x, &x, &mask.unsqueeze(2)?, 15.0, 1e-10, false)?;
        assert!((l.to_vec1::<f32>()?[0] - 1.0).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_superimpose_recovers_rigid_motion() -> Result<()> {
        let device = Device::Cpu;
        let x = helix(10, &device)?;
        let rot = Rotation3::from_euler_angles(0.3, -1.1, 2.0);
        let moved: Vec<f32> = x
            .squeeze(0)?
            .to_vec2::<f32>()?
            .iter()
            .flat_map(|p| {
                let q = rot * Vector3::new(p[0] as f64, p[1] as f64, p[2] as f64)
                    + Vector3::new(5.0, -3.0, 1.0);
                [q.x as f32, q.y as f32, q.z as f32]
            })
            .collect();
        let y = Tensor::from_vec(moved, (1, 10, 3), &device)?;
        let mask = Tensor::ones((1, 10), DType::F32, &device)?;
        let (aligned, rmsd) = superimpose(&x, &y, &mask).map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        assert!(rmsd.to_vec1::<f32>()?[0] < 1e-3);
        let diff = (aligned - &x)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        assert!(diff < 1e-3);
        Ok(())
    }

    #[test]
    fn test_degenerate_superimposition_reports_sentinels() -> Result<()> {
        let device = Device::Cpu;
        let pred = Tensor::zeros((1, 4, 37, 3), DType::F32, &device)?;
        let mut mask = vec![0f32; 4 * 37];
        mask[CA_ATOM] = 1.0;
        let mask = Tensor::from_vec(mask, (1, 4, 37), &device)?;
        let metrics = position_metrics(&pred, &pred, &mask, 1e-8, true, "fl")?;
        assert_eq!(metrics["drmsd_al_fl"], DRMSD_AL_SENTINEL);
        assert_eq!(metrics["gdt_ts_fl"], GDT_SENTINEL);
        assert!(metrics.contains_key("lddt_ca_fl"));
        Ok(())
    }

    #[test]
    fn test_accuracy() -> Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[0.1f32, 2.0, 0.3], [3.0, 0.0, 0.0]], &device)?;
        let target = Tensor::new(&[1u32, 2], &device)?;
        assert_eq!(accuracy(&logits, &target)?, 50.0);
        let empty = Tensor::zeros((0,), DType::U32, &device)?;
        assert_eq!(accuracy(&logits.narrow(0, 0, 0)?, &empty)?, 0.0);
        Ok(())
    }
}
