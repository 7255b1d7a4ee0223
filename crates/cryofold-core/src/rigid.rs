//! Rigid-body frames over candle tensors.
//!
//! A [`Rigid`] is a rotation `[..., 3, 3]` plus a translation `[..., 3]`. Everything before the
//! last one (translation) or two (rotation) axes is the "batch shape" of the frame and follows
//! numpy-style broadcasting in [`Rigid::apply`] and [`Rigid::compose`].
use candle_core::{DType, Device, Result, Tensor, D};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RigidError {
    #[error("invalid rotation shape {0:?}, expected [..., 3, 3]")]
    InvalidShape(Vec<usize>),
    #[error("shape mismatch between translation {trans:?} and rotation {rot:?}")]
    ShapeMismatch { trans: Vec<usize>, rot: Vec<usize> },
    #[error("rotation has no quaternion representation")]
    NoQuaternion,
}

impl From<RigidError> for candle_core::Error {
    fn from(e: RigidError) -> Self {
        candle_core::Error::Msg(e.to_string())
    }
}

/// Cross product over the last axis.
pub fn cross(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let (a0, a1, a2) = split3(a)?;
    let (b0, b1, b2) = split3(b)?;
    let c0 = ((&a1 * &b2)? - (&a2 * &b1)?)?;
    let c1 = ((&a2 * &b0)? - (&a0 * &b2)?)?;
    let c2 = ((&a0 * &b1)? - (&a1 * &b0)?)?;
    Tensor::cat(&[c0, c1, c2], D::Minus1)
}

fn split3(t: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
    Ok((t.narrow(D::Minus1, 0, 1)?, t.narrow(D::Minus1, 1, 1)?, t.narrow(D::Minus1, 2, 1)?))
}

/// Normalises the last axis, guarding the denominator with `eps`.
pub fn normalize(t: &Tensor, eps: f64) -> Result<Tensor> {
    let denom = t.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?.affine(1.0, eps)?;
    t.broadcast_div(&denom)
}

/// Quaternions below this norm are treated as the identity rotation.
pub const QUAT_EPS: f64 = 1e-6;

/// Unit quaternions from `[..., 4]`; rows with a norm below [`QUAT_EPS`] become the identity.
pub fn normalize_quats(q: &Tensor) -> Result<Tensor> {
    let norm = q.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?;
    let degenerate = norm.lt(QUAT_EPS)?.to_dtype(q.dtype())?;
    let identity = Tensor::new(&[1f32, 0.0, 0.0, 0.0], q.device())?.to_dtype(q.dtype())?;
    let q = q.broadcast_add(&degenerate.broadcast_mul(&identity)?)?;
    normalize(&q, 0.0)
}

/// `r[..., i, j] * v[..., j]` with broadcasting over the leading axes.
pub fn rot_vec_mul(r: &Tensor, v: &Tensor) -> Result<Tensor> {
    r.broadcast_mul(&v.unsqueeze(v.rank() - 1)?)?.sum(D::Minus1)
}

/// `a[..., i, k] * b[..., k, j]` with broadcasting over the leading axes.
pub fn rot_matmul(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let a = a.unsqueeze(a.rank())?; // [..., 3, 3, 1]
    let b = b.unsqueeze(b.rank() - 2)?; // [..., 1, 3, 3]
    a.broadcast_mul(&b)?.sum(D::Minus2)
}

/// Unit quaternion `[..., 4]` (w, x, y, z) to rotation matrix `[..., 3, 3]`.
pub fn quat_to_rot(q: &Tensor) -> Result<Tensor> {
    let c = |i: usize| q.narrow(D::Minus1, i, 1);
    let (w, x, y, z) = (c(0)?, c(1)?, c(2)?, c(3)?);
    let (ww, xx, yy, zz) = (w.sqr()?, x.sqr()?, y.sqr()?, z.sqr()?);
    let (wx, wy, wz) = ((&w * &x)?, (&w * &y)?, (&w * &z)?);
    let (xy, xz, yz) = ((&x * &y)?, (&x * &z)?, (&y * &z)?);

    let r00 = (((&ww + &xx)? - &yy)? - &zz)?;
    let r01 = ((&xy - &wz)? * 2.0)?;
    let r02 = ((&xz + &wy)? * 2.0)?;
    let r10 = ((&xy + &wz)? * 2.0)?;
    let r11 = (((&ww - &xx)? + &yy)? - &zz)?;
    let r12 = ((&yz - &wx)? * 2.0)?;
    let r20 = ((&xz - &wy)? * 2.0)?;
    let r21 = ((&yz + &wx)? * 2.0)?;
    let r22 = (((&ww - &xx)? - &yy)? + &zz)?;

    let rows = [
        Tensor::cat(&[r00, r01, r02], D::Minus1)?,
        Tensor::cat(&[r10, r11, r12], D::Minus1)?,
        Tensor::cat(&[r20, r21, r22], D::Minus1)?,
    ];
    Tensor::stack(&rows, q.rank() - 1)
}

/// Hamilton product `q * (0, v)`; `q` is `[..., 4]`, `v` is `[..., 3]`.
pub fn quat_multiply_by_vec(q: &Tensor, v: &Tensor) -> Result<Tensor> {
    let c = |t: &Tensor, i: usize| t.narrow(D::Minus1, i, 1);
    let (a, b, cq, d) = (c(q, 0)?, c(q, 1)?, c(q, 2)?, c(q, 3)?);
    let (x, y, z) = (c(v, 0)?, c(v, 1)?, c(v, 2)?);
    let w_out = ((b.broadcast_mul(&x)?.neg()? - cq.broadcast_mul(&y)?)? - d.broadcast_mul(&z)?)?;
    let x_out = ((a.broadcast_mul(&x)? + cq.broadcast_mul(&z)?)? - d.broadcast_mul(&y)?)?;
    let y_out = ((a.broadcast_mul(&y)? - b.broadcast_mul(&z)?)? + d.broadcast_mul(&x)?)?;
    let z_out = ((a.broadcast_mul(&z)? + b.broadcast_mul(&y)?)? - cq.broadcast_mul(&x)?)?;
    Tensor::cat(&[w_out, x_out, y_out, z_out], D::Minus1)
}

#[derive(Clone, Debug)]
pub struct Rotation {
    rot_mats: Tensor,
    quats: Option<Tensor>,
}

impl Rotation {
    pub fn from_rot_mats(rot_mats: Tensor) -> Result<Self> {
        let dims = rot_mats.dims();
        if dims.len() < 2 || dims[dims.len() - 1] != 3 || dims[dims.len() - 2] != 3 {
            return Err(RigidError::InvalidShape(dims.to_vec()).into());
        }
        Ok(Self { rot_mats, quats: None })
    }

    pub fn from_quats(quats: &Tensor, normalize_quats: bool) -> Result<Self> {
        let quats = if normalize_quats {
            self::normalize_quats(quats)?
        } else {
            quats.clone()
        };
        Ok(Self {
            rot_mats: quat_to_rot(&quats)?,
            quats: Some(quats),
        })
    }

    pub fn identity(batch: &[usize], device: &Device) -> Result<Self> {
        let mut shape = batch.to_vec();
        shape.push(4);
        let n: usize = batch.iter().product();
        let quats = Tensor::new(&[1f32, 0., 0., 0.], device)?
            .unsqueeze(0)?
            .repeat((n, 1))?
            .reshape(shape)?;
        Self::from_quats(&quats, false)
    }

    pub fn rot_mats(&self) -> &Tensor {
        &self.rot_mats
    }

    pub fn quats(&self) -> Result<&Tensor> {
        self.quats.as_ref().ok_or_else(|| RigidError::NoQuaternion.into())
    }

    pub fn batch_shape(&self) -> &[usize] {
        let dims = self.rot_mats.dims();
        &dims[..dims.len() - 2]
    }

    pub fn apply(&self, p: &Tensor) -> Result<Tensor> {
        rot_vec_mul(&self.rot_mats, p)
    }

    pub fn invert_apply(&self, p: &Tensor) -> Result<Tensor> {
        rot_vec_mul(&self.transpose_mats()?, p)
    }

    fn transpose_mats(&self) -> Result<Tensor> {
        let r = self.rot_mats.rank();
        self.rot_mats.transpose(r - 2, r - 1)
    }

    pub fn invert(&self) -> Result<Self> {
        let quats = match &self.quats {
            Some(q) => {
                let sign = Tensor::new(&[1f32, -1., -1., -1.], q.device())?.to_dtype(q.dtype())?;
                Some(q.broadcast_mul(&sign)?)
            }
            None => None,
        };
        Ok(Self {
            rot_mats: self.transpose_mats()?,
            quats,
        })
    }

    /// Matrix composition `self ∘ other`. The quaternion form is dropped.
    pub fn compose(&self, other: &Self) -> Result<Self> {
        Self::from_rot_mats(rot_matmul(&self.rot_mats, &other.rot_mats)?)
    }

    /// `q ← normalize(q + q·(0, v))`, a local-frame rotation update.
    pub fn compose_q_update_vec(&self, q_update_vec: &Tensor) -> Result<Self> {
        let quats = self.quats()?;
        let new_quats = (quats + quat_multiply_by_vec(quats, q_update_vec)?)?;
        Self::from_quats(&new_quats, true)
    }

    pub fn map(&self, f: impl Fn(&Tensor) -> Result<Tensor>) -> Result<Self> {
        let rot_mats = f(&self.rot_mats)?;
        let quats = match &self.quats {
            Some(q) => Some(f(q)?),
            None => None,
        };
        Ok(Self { rot_mats, quats })
    }

    pub fn detach(&self) -> Self {
        Self {
            rot_mats: self.rot_mats.detach(),
            quats: self.quats.as_ref().map(|q| q.detach()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Rigid {
    rots: Rotation,
    trans: Tensor,
}

impl Rigid {
    pub fn new(rots: Rotation, trans: Tensor) -> Result<Self> {
        let t = trans.dims();
        if t.is_empty() || t[..t.len() - 1] != *rots.batch_shape() {
            return Err(RigidError::ShapeMismatch {
                trans: t.to_vec(),
                rot: rots.rot_mats.dims().to_vec(),
            }
            .into());
        }
        Ok(Self { rots, trans })
    }

    pub fn identity(batch: &[usize], device: &Device) -> Result<Self> {
        let mut shape = batch.to_vec();
        shape.push(3);
        Ok(Self {
            rots: Rotation::identity(batch, device)?,
            trans: Tensor::zeros(shape, DType::F32, device)?,
        })
    }

    /// `[..., 7]` = quaternion (w, x, y, z) followed by translation.
    pub fn from_tensor_7(t: &Tensor, normalize_quats: bool) -> Result<Self> {
        let quats = t.narrow(D::Minus1, 0, 4)?;
        let trans = t.narrow(D::Minus1, 4, 3)?;
        Self::new(Rotation::from_quats(&quats, normalize_quats)?, trans)
    }

    pub fn to_tensor_7(&self) -> Result<Tensor> {
        Tensor::cat(&[self.rots.quats()?, &self.trans], D::Minus1)
    }

    /// `[..., 4, 4]` homogeneous transforms.
    pub fn from_tensor_4x4(t: &Tensor) -> Result<Self> {
        let r = t.rank();
        let rot_mats = t.narrow(r - 2, 0, 3)?.narrow(r - 1, 0, 3)?;
        let trans = t.narrow(r - 2, 0, 3)?.narrow(r - 1, 3, 1)?.squeeze(r - 1)?;
        Self::new(Rotation::from_rot_mats(rot_mats)?, trans)
    }

    pub fn to_tensor_4x4(&self) -> Result<Tensor> {
        let rot = self.rots.rot_mats();
        let r = rot.rank();
        let top = Tensor::cat(&[rot, &self.trans.unsqueeze(r - 1)?], r - 1)?;
        let mut bottom_shape = self.batch_shape().to_vec();
        bottom_shape.extend([1, 4]);
        let bottom = Tensor::new(&[0f32, 0., 0., 1.], rot.device())?
            .to_dtype(rot.dtype())?
            .broadcast_as(bottom_shape)?;
        Tensor::cat(&[&top, &bottom], r - 2)
    }

    /// Frame whose origin is `origin`, x axis points from `p_neg_x_axis` to `origin`, and whose
    /// xy plane contains `p_xy_plane`.
    pub fn from_3_points(
        p_neg_x_axis: &Tensor,
        origin: &Tensor,
        p_xy_plane: &Tensor,
        eps: f64,
    ) -> Result<Self> {
        let e0 = normalize(&(origin - p_neg_x_axis)?, eps)?;
        let e1 = (p_xy_plane - origin)?;
        let dot = (&e0 * &e1)?.sum_keepdim(D::Minus1)?;
        let e1 = normalize(&(e1 - e0.broadcast_mul(&dot)?)?, eps)?;
        let e2 = cross(&e0, &e1)?;
        let stack_dim = e2.rank();
        let rot_mats = Tensor::stack(&[e0, e1, e2], stack_dim)?;
        Self::new(Rotation::from_rot_mats(rot_mats)?, origin.clone())
    }

    pub fn rots(&self) -> &Rotation {
        &self.rots
    }

    pub fn trans(&self) -> &Tensor {
        &self.trans
    }

    pub fn batch_shape(&self) -> &[usize] {
        self.rots.batch_shape()
    }

    pub fn device(&self) -> &Device {
        self.trans.device()
    }

    pub fn apply(&self, p: &Tensor) -> Result<Tensor> {
        self.rots.apply(p)?.broadcast_add(&self.trans)
    }

    pub fn invert_apply(&self, p: &Tensor) -> Result<Tensor> {
        self.rots.invert_apply(&p.broadcast_sub(&self.trans)?)
    }

    pub fn invert(&self) -> Result<Self> {
        let rots = self.rots.invert()?;
        let trans = rots.apply(&self.trans)?.neg()?;
        Ok(Self { rots, trans })
    }

    pub fn compose(&self, other: &Self) -> Result<Self> {
        let rots = self.rots.compose(&other.rots)?;
        let trans = self.rots.apply(&other.trans)?.broadcast_add(&self.trans)?;
        Ok(Self { rots, trans })
    }

    /// Applies a `[..., 6]` update: quaternion vector part then translation, both in the local
    /// frame.
    pub fn compose_q_update_vec(&self, update: &Tensor) -> Result<Self> {
        let q_vec = update.narrow(D::Minus1, 0, 3)?;
        let t_vec = update.narrow(D::Minus1, 3, 3)?;
        let rots = self.rots.compose_q_update_vec(&q_vec)?;
        let trans = (&self.trans + self.rots.apply(&t_vec)?)?;
        Ok(Self { rots, trans })
    }

    pub fn scale_translation(&self, factor: f64) -> Result<Self> {
        Ok(Self {
            rots: self.rots.clone(),
            trans: (&self.trans * factor)?,
        })
    }

    /// Inserts an axis into the batch shape.
    pub fn unsqueeze(&self, dim: usize) -> Result<Self> {
        Ok(Self {
            rots: self.rots.map(|t| t.unsqueeze(dim))?,
            trans: self.trans.unsqueeze(dim)?,
        })
    }

    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Self> {
        Ok(Self {
            rots: self.rots.map(|t| t.narrow(dim, start, len))?,
            trans: self.trans.narrow(dim, start, len)?,
        })
    }

    pub fn cat(rigids: &[Rigid], dim: usize) -> Result<Self> {
        let mats: Vec<&Tensor> = rigids.iter().map(|r| r.rots.rot_mats()).collect();
        let trans: Vec<&Tensor> = rigids.iter().map(|r| &r.trans).collect();
        Self::new(
            Rotation::from_rot_mats(Tensor::cat(&mats, dim)?)?,
            Tensor::cat(&trans, dim)?,
        )
    }

    pub fn detach(&self) -> Self {
        Self {
            rots: self.rots.detach(),
            trans: self.trans.detach(),
        }
    }

    pub fn detach_rot(&self) -> Self {
        Self {
            rots: self.rots.detach(),
            trans: self.trans.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    fn sample_rigid(device: &Device) -> Rigid {
        let t7 = Tensor::new(
            &[
                [0.9f32, 0.1, -0.3, 0.2, 1.0, 2.0, 3.0],
                [0.2f32, 0.7, 0.4, -0.5, -4.0, 0.5, 1.5],
            ],
            device,
        )
        .unwrap();
        Rigid::from_tensor_7(&t7, true).unwrap()
    }

    #[test]
    fn test_rotation_is_orthonormal() -> Result<()> {
        let device = Device::Cpu;
        let rigid = sample_rigid(&device);
        let r = rigid.rots().rot_mats();
        let rtr = rot_matmul(&r.transpose(1, 2)?, r)?;
        let eye = Tensor::new(&[[1f32, 0., 0.], [0., 1., 0.], [0., 0., 1.]], &device)?
            .unsqueeze(0)?
            .repeat((2, 1, 1))?;
        assert!(max_abs_diff(&rtr, &eye) < 1e-5);
        Ok(())
    }

    #[test]
    fn test_zero_quaternion_is_identity() -> Result<()> {
        let device = Device::Cpu;
        let t7 = Tensor::new(&[[0f32, 0.0, 0.0, 0.0, 1.0, 2.0, 3.0], [2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]], &device)?;
        let rigid = Rigid::from_tensor_7(&t7, true)?;
        let eye = Tensor::new(&[[1f32, 0., 0.], [0., 1., 0.], [0., 0., 1.]], &device)?
            .unsqueeze(0)?
            .repeat((2, 1, 1))?;
        assert!(max_abs_diff(rigid.rots().rot_mats(), &eye) < 1e-6);
        let q = rigid.to_tensor_7()?.narrow(1, 0, 4)?.to_vec2::<f32>()?;
        assert_eq!(q, vec![vec![1.0, 0.0, 0.0, 0.0], vec![1.0, 0.0, 0.0, 0.0]]);
        Ok(())
    }

    #[test]
    fn test_apply_then_invert_apply() -> Result<()> {
        let device = Device::Cpu;
        let rigid = sample_rigid(&device);
        let p = Tensor::new(&[[0.3f32, -1.2, 4.0], [2.0, 2.0, -2.0]], &device)?;
        let back = rigid.invert_apply(&rigid.apply(&p)?)?;
        assert!(max_abs_diff(&back, &p) < 1e-5);
        Ok(())
    }

    #[test]
    fn test_compose_with_inverse_is_identity() -> Result<()> {
        let device = Device::Cpu;
        let rigid = sample_rigid(&device);
        let ident = rigid.compose(&rigid.invert()?)?;
        let expected = Rigid::identity(&[2], &device)?;
        assert!(max_abs_diff(&ident.to_tensor_4x4()?, &expected.to_tensor_4x4()?) < 1e-5);
        Ok(())
    }

    #[test]
    fn test_zero_update_keeps_frame() -> Result<()> {
        let device = Device::Cpu;
        let rigid = sample_rigid(&device);
        let updated = rigid.compose_q_update_vec(&Tensor::zeros((2, 6), DType::F32, &device)?)?;
        assert!(max_abs_diff(&updated.to_tensor_7()?, &rigid.to_tensor_7()?) < 1e-6);
        Ok(())
    }

    #[test]
    fn test_q_update_matches_matrix_composition() -> Result<()> {
        let device = Device::Cpu;
        let rigid = sample_rigid(&device);
        let update = Tensor::new(&[[0.1f32, -0.2, 0.05, 0.5, 0.0, -1.0]; 2], &device)?;
        let via_quat = rigid.compose_q_update_vec(&update)?;

        let delta_q = Tensor::cat(
            &[Tensor::ones((2, 1), DType::F32, &device)?, update.narrow(1, 0, 3)?],
            1,
        )?;
        let delta = Rigid::new(Rotation::from_quats(&delta_q, true)?, update.narrow(1, 3, 3)?)?;
        let via_mats = rigid.compose(&delta)?;
        assert!(max_abs_diff(&via_quat.to_tensor_4x4()?, &via_mats.to_tensor_4x4()?) < 1e-5);
        Ok(())
    }

    #[test]
    fn test_from_3_points_places_origin() -> Result<()> {
        let device = Device::Cpu;
        let n = Tensor::new(&[[-0.525f32, 1.363, 0.0]], &device)?;
        let ca = Tensor::new(&[[0f32, 0., 0.]], &device)?;
        let c = Tensor::new(&[[1.526f32, 0., 0.]], &device)?;
        let frame = Rigid::from_3_points(&c, &ca, &n, 1e-8)?;
        let local_n = frame.invert_apply(&n)?.to_vec2::<f32>()?;
        // N lies in the xy plane of the backbone frame.
        assert!(local_n[0][2].abs() < 1e-5);
        let local_c = frame.invert_apply(&c)?.to_vec2::<f32>()?;
        assert!((local_c[0][0] + 1.526).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_broadcast_apply_over_points() -> Result<()> {
        let device = Device::Cpu;
        let rigid = sample_rigid(&device).unsqueeze(1)?; // [2, 1]
        let pts = Tensor::zeros((2, 5, 3), DType::F32, &device)?;
        let out = rigid.apply(&pts)?;
        assert_eq!(out.dims(), &[2, 5, 3]);
        let trans = rigid.trans().broadcast_as((2, 5, 3))?;
        assert!(max_abs_diff(&out, &trans) < 1e-6);
        Ok(())
    }
}
