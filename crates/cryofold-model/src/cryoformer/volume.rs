//! Operations on `[B, C, W, H, L]` volumes.
//!
//! Strided convolutions whose kernel equals their stride are patch reshapes followed by a
//! matmul, so no dedicated conv kernel is needed.
use crate::embedders::SinusoidalEncoding;
use candle_core::{DType, Device, Result, Tensor, D};
use candle_nn::{Init, VarBuilder};

/// 3D convolution with `kernel == stride` and no padding.
///
/// `kernel == 1` is a per-voxel linear map over channels.
#[derive(Clone, Debug)]
pub struct PatchConv3d {
    /// `[out, in * k³]`
    weight: Tensor,
    bias: Tensor,
    kernel: usize,
}

impl PatchConv3d {
    pub fn load(vb: VarBuilder, c_in: usize, c_out: usize, kernel: usize) -> Result<Self> {
        let fan_in = (c_in * kernel.pow(3)).max(1) as f64;
        let bound = 1.0 / fan_in.sqrt();
        let init = Init::Uniform {
            lo: -bound,
            up: bound,
        };
        let weight = vb
            .get_with_hints((c_out, c_in, kernel, kernel, kernel), "weight", init)?
            .reshape((c_out, c_in * kernel.pow(3)))?;
        let bias = vb.get_with_hints(c_out, "bias", init)?;
        Ok(Self { weight, bias, kernel })
    }

    /// `[B, C, W, H, L] -> [B, O, W / k, H / k, L / k]`; trailing voxels that do not fill a
    /// patch are dropped.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, c, w, h, l) = x.dims5()?;
        let k = self.kernel;
        let (w2, h2, l2) = (w / k, h / k, l / k);
        let x = x.narrow(2, 0, w2 * k)?.narrow(3, 0, h2 * k)?.narrow(4, 0, l2 * k)?;
        let patches = if k == 1 {
            x.permute((0, 2, 3, 4, 1))?.contiguous()?
        } else {
            x.reshape(vec![b, c, w2, k, h2, k, l2, k])?
                .permute(vec![0, 2, 4, 6, 1, 3, 5, 7])?
                .contiguous()?
                .reshape((b, w2, h2, l2, c * k.pow(3)))?
        };
        let rows = b * w2 * h2 * l2;
        let y = patches
            .reshape((rows, c * k.pow(3)))?
            .matmul(&self.weight.t()?)?
            .broadcast_add(&self.bias)?;
        y.reshape((b, w2, h2, l2, self.weight.dim(0)?))?
            .permute((0, 4, 1, 2, 3))?
            .contiguous()
    }
}

/// Transposed 3D convolution with kernel and stride 2: every voxel expands into a 2×2×2 block.
#[derive(Clone, Debug)]
pub struct Upsample3d {
    /// `[in, out * 8]`
    weight: Tensor,
    bias: Tensor,
    c_out: usize,
}

impl Upsample3d {
    pub fn load(vb: VarBuilder, c_in: usize, c_out: usize) -> Result<Self> {
        let bound = 1.0 / ((c_out * 8).max(1) as f64).sqrt();
        let init = Init::Uniform {
            lo: -bound,
            up: bound,
        };
        let weight = vb
            .get_with_hints((c_in, c_out, 2, 2, 2), "weight", init)?
            .reshape((c_in, c_out * 8))?;
        let bias = vb.get_with_hints(c_out, "bias", init)?;
        Ok(Self { weight, bias, c_out })
    }

    /// `[B, C, W, H, L] -> [B, O, size]`. The doubled grid is resampled when it differs from
    /// `size`.
    pub fn forward(&self, x: &Tensor, size: (usize, usize, usize)) -> Result<Tensor> {
        let (b, c, w, h, l) = x.dims5()?;
        let o = self.c_out;
        let y = x
            .permute((0, 2, 3, 4, 1))?
            .contiguous()?
            .reshape((b * w * h * l, c))?
            .matmul(&self.weight)?
            .reshape(vec![b, w, h, l, o, 2, 2, 2])?
            .permute(vec![0, 4, 1, 5, 2, 6, 3, 7])?
            .contiguous()?
            .reshape((b, o, 2 * w, 2 * h, 2 * l))?
            .broadcast_add(&self.bias.reshape((1, o, 1, 1, 1))?)?;
        if (2 * w, 2 * h, 2 * l) == size {
            Ok(y)
        } else {
            resize_nearest(&y, size)
        }
    }
}

/// Non-overlapping max pooling with window `k`.
pub fn max_pool3d(x: &Tensor, k: usize) -> Result<Tensor> {
    let (b, c, w, h, l) = x.dims5()?;
    let (w2, h2, l2) = (w / k, h / k, l / k);
    x.narrow(2, 0, w2 * k)?
        .narrow(3, 0, h2 * k)?
        .narrow(4, 0, l2 * k)?
        .reshape(vec![b, c, w2, k, h2, k, l2, k])?
        .permute(vec![0, 1, 2, 4, 6, 3, 5, 7])?
        .contiguous()?
        .reshape(vec![b, c, w2, h2, l2, k.pow(3)])?
        .max(D::Minus1)
}

/// Nearest-neighbour resampling of the spatial axes: output voxel `i` reads input voxel
/// `floor(i * in / out)`.
pub fn resize_nearest(x: &Tensor, size: (usize, usize, usize)) -> Result<Tensor> {
    let mut x = x.contiguous()?;
    for (axis, out) in [(2, size.0), (3, size.1), (4, size.2)] {
        let input = x.dim(axis)?;
        if input == out {
            continue;
        }
        let idx: Vec<u32> = (0..out).map(|i| (i * input / out) as u32).collect();
        x = x.index_select(&Tensor::new(idx, x.device())?, axis)?;
    }
    Ok(x)
}

/// Flattens the spatial axes into tokens: `[B, C, W, H, L] -> [B, W*H*L, C]`.
pub fn to_tokens(x: &Tensor) -> Result<Tensor> {
    let (b, c, w, h, l) = x.dims5()?;
    x.reshape((b, c, w * h * l))?.transpose(1, 2)?.contiguous()
}

/// Inverse of [`to_tokens`].
pub fn from_tokens(x: &Tensor, grid: (usize, usize, usize)) -> Result<Tensor> {
    let (b, _, c) = x.dims3()?;
    x.transpose(1, 2)?.contiguous()?.reshape((b, c, grid.0, grid.1, grid.2))
}

/// Fixed sine/cosine encoding of voxel coordinates, a third of the channels per axis.
///
/// Coordinates run `1..=n` along each axis and are scaled into `(0, 2π]`.
#[derive(Clone, Debug)]
pub struct PositionEmbeddingSine {
    encoding: SinusoidalEncoding,
    feats_per_axis: usize,
}

impl PositionEmbeddingSine {
    pub fn new(hidden: usize, device: &Device) -> Result<Self> {
        let feats_per_axis = hidden / 3;
        Ok(Self {
            encoding: SinusoidalEncoding::new(feats_per_axis, device)?,
            feats_per_axis,
        })
    }

    fn axis(&self, n: usize, device: &Device) -> Result<Tensor> {
        let scale = 2.0 * std::f64::consts::PI / (n as f64 + 1e-6);
        let pos = (Tensor::arange(1u32, n as u32 + 1, device)?.to_dtype(DType::F32)? * scale)?;
        // [n, F]
        self.encoding.forward(&pos)
    }

    /// `[W*H*L, 3F]` encodings in token order.
    pub fn forward(&self, grid: (usize, usize, usize), device: &Device) -> Result<Tensor> {
        let (w, h, l) = grid;
        let f = self.feats_per_axis;
        let shape = (w, h, l, f);
        let x = self.axis(w, device)?.reshape((w, 1, 1, f))?.broadcast_as(shape)?;
        let y = self.axis(h, device)?.reshape((1, h, 1, f))?.broadcast_as(shape)?;
        let z = self.axis(l, device)?.reshape((1, 1, l, f))?.broadcast_as(shape)?;
        Tensor::cat(&[x, y, z], 3)?.reshape((w * h * l, 3 * f))
    }
}
