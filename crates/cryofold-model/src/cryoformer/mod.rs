//! Density transformer: a patch embedding of the cryo-EM map, an encoder over the density
//! tokens and a decoder that refines the single representation against them.
pub mod decoder;
pub mod encoder;
pub mod volume;

pub use decoder::{CryoformerDecoder, DensityMemory};
pub use encoder::CryoformerEncoder;

use crate::config::{CryoemConfig, GlobalsConfig};
use crate::primitives::kernels::KernelBackend;
use crate::primitives::LayerNorm3d;
use candle_core::{DType, Result, Tensor};
use candle_nn::VarBuilder;
use volume::{max_pool3d, resize_nearest, to_tokens, PatchConv3d, PositionEmbeddingSine};

/// Coarsening factor between the density grid and the token grid.
pub const DENSITY_STRIDE: usize = 4;

/// `Conv3d(k = 2, s = 2) -> LayerNorm3d -> ReLU`
#[derive(Clone, Debug)]
struct PatchBlock {
    conv: PatchConv3d,
    norm: LayerNorm3d,
}

impl PatchBlock {
    fn load(vb: VarBuilder, c_in: usize, c_out: usize, kernels: KernelBackend) -> Result<Self> {
        Ok(Self {
            conv: PatchConv3d::load(vb.pp("conv"), c_in, c_out, 2)?,
            norm: LayerNorm3d::load(vb.pp("norm"), c_out, kernels)?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.norm.forward(&self.conv.forward(x)?)?.relu()
    }
}

/// Embedded density map.
#[derive(Clone, Debug)]
pub struct DensityFeatures {
    /// `[B, C1, G/2, G/2, G/2]` and `[B, C2, G/4, G/4, G/4]` backbone features.
    pub feats: [Tensor; 2],
    /// `[B, V, C_s]` token representation, `V = (G/4)³`.
    pub repr: Tensor,
    /// `[B, V]`, present when the batch carries `cryoem_mask`.
    pub mask: Option<Tensor>,
    /// `[B, V, C_s]` fixed positional encoding.
    pub pos: Tensor,
    /// `[B, V]` max-pooled density.
    pub wei: Tensor,
    /// Token grid `(W, H, L)`.
    pub grid: (usize, usize, usize),
}

impl DensityFeatures {
    /// Decoder memory over `encoded [B, V, C_s]`, the encoder output for these tokens.
    pub fn memory<'a>(&'a self, encoded: &'a Tensor) -> DensityMemory<'a> {
        DensityMemory {
            repr: encoded,
            pos: &self.pos,
            wei: &self.wei,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CryoformerEmbedder {
    block1: PatchBlock,
    block2: PatchBlock,
    proj: PatchConv3d,
    position: PositionEmbeddingSine,
}

impl CryoformerEmbedder {
    pub fn load(vb: VarBuilder, cfg: &CryoemConfig, g: &GlobalsConfig) -> Result<Self> {
        let e = &cfg.embedder;
        let backbone = vb.pp("backbone");
        Ok(Self {
            block1: PatchBlock::load(backbone.pp("block1"), 1, e.patch_c1, g.kernels)?,
            block2: PatchBlock::load(backbone.pp("block2"), e.patch_c1, e.patch_c2, g.kernels)?,
            proj: PatchConv3d::load(vb.pp("proj"), e.patch_c2, g.c_s, 1)?,
            position: PositionEmbeddingSine::new(g.c_s, vb.device())?,
        })
    }

    /// `density [B, G, G, G]`, `mask [B, G, G, G]`.
    pub fn forward(&self, density: &Tensor, mask: Option<&Tensor>) -> Result<DensityFeatures> {
        let density = density.to_dtype(DType::F32)?.unsqueeze(1)?;
        let b = density.dim(0)?;
        let x2 = self.block1.forward(&density.relu()?)?;
        let x = self.block2.forward(&x2)?;
        let (_, _, w, h, l) = x.dims5()?;
        let grid = (w, h, l);
        let repr = to_tokens(&self.proj.forward(&x)?)?;
        let mask = match mask {
            Some(m) => {
                let m = resize_nearest(&m.to_dtype(DType::F32)?.unsqueeze(1)?, grid)?;
                Some(m.gt(0.0)?.to_dtype(DType::F32)?.reshape((b, w * h * l))?)
            }
            None => None,
        };
        let wei = max_pool3d(&density, DENSITY_STRIDE)?
            .narrow(2, 0, w)?
            .narrow(3, 0, h)?
            .narrow(4, 0, l)?
            .reshape((b, w * h * l))?;
        let pos = self
            .position
            .forward(grid, density.device())?
            .unsqueeze(0)?
            .repeat((b, 1, 1))?;
        Ok(DensityFeatures {
            feats: [x2, x],
            repr,
            mask,
            pos,
            wei,
            grid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CryoFoldConfig;
    use candle_core::Device;
    use candle_nn::VarMap;

    #[test]
    fn test_embedder_shapes() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let cfg = CryoFoldConfig::tiny();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let emb = CryoformerEmbedder::load(vb, &cfg.model.cryoem, &cfg.globals)?;
        let density = Tensor::rand(0f32, 1.0, (1, 16, 16, 16), &device)?;
        let mask = Tensor::ones((1, 16, 16, 16), DType::F32, &device)?;
        let out = emb.forward(&density, Some(&mask))?;
        let c_s = cfg.globals.c_s;
        assert_eq!(out.grid, (4, 4, 4));
        assert_eq!(out.feats[0].dims(), &[1, 8, 8, 8, 8]);
        assert_eq!(out.feats[1].dims(), &[1, 16, 4, 4, 4]);
        assert_eq!(out.repr.dims(), &[1, 64, c_s]);
        assert_eq!(out.pos.dims(), &[1, 64, c_s]);
        assert_eq!(out.wei.dims(), &[1, 64]);
        assert_eq!(out.mask.as_ref().map(|m| m.dims().to_vec()), Some(vec![1, 64]));
        // Pooled density is the block maximum.
        let first_block = density.narrow(1, 0, 4)?.narrow(2, 0, 4)?.narrow(3, 0, 4)?;
        let expected = first_block.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        assert_eq!(out.wei.get(0)?.get(0)?.to_scalar::<f32>()?, expected);
        Ok(())
    }

    #[test]
    fn test_memory_reads_encoder_output() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let cfg = CryoFoldConfig::tiny();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let emb = CryoformerEmbedder::load(vb, &cfg.model.cryoem, &cfg.globals)?;
        let out = emb.forward(&Tensor::rand(0f32, 1.0, (1, 16, 16, 16), &device)?, None)?;
        let encoded = (out.repr.ones_like()? * 2.0)?;
        let memory = out.memory(&encoded);
        assert_eq!(memory.repr.flatten_all()?.to_vec1::<f32>()?, encoded.flatten_all()?.to_vec1::<f32>()?);
        assert_eq!(memory.pos.dims(), out.pos.dims());
        assert_eq!(memory.wei.dims(), out.wei.dims());
        Ok(())
    }
}
