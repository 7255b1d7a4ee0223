//! Model configuration.
//!
//! [`CryoFoldConfig::default`] is the production `cryofold_v1` preset; [`CryoFoldConfig::tiny`]
//! keeps every optional stage enabled with small widths for tests. Channel widths shared
//! between stages live in [`GlobalsConfig`] so they cannot disagree.
use crate::error::{CryoFoldError, Result};
use crate::primitives::kernels::{flash_attention_available, KernelBackend};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Relu,
    Gelu,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalsConfig {
    pub c_z: usize,
    pub c_m: usize,
    pub c_t: usize,
    pub c_e: usize,
    pub c_s: usize,
    pub chunk_size: Option<usize>,
    pub blocks_per_ckpt: Option<usize>,
    pub max_recycling_iters: usize,
    pub eps: f64,
    pub use_lma: bool,
    pub use_flash: bool,
    pub offload_inference: bool,
    pub inplace_safe: bool,
    pub fuse_single: bool,
    pub use_single: bool,
    pub use_chain: bool,
    pub kernels: KernelBackend,
}

impl Default for GlobalsConfig {
    fn default() -> Self {
        Self {
            c_z: 128,
            c_m: 256,
            c_t: 64,
            c_e: 64,
            c_s: 384,
            chunk_size: Some(4),
            blocks_per_ckpt: None,
            max_recycling_iters: 3,
            eps: 1e-8,
            use_lma: false,
            use_flash: false,
            offload_inference: false,
            inplace_safe: false,
            fuse_single: false,
            use_single: true,
            use_chain: false,
            kernels: KernelBackend::Reference,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputEmbedderConfig {
    pub tf_dim: usize,
    pub msa_dim: usize,
    pub relpos_k: usize,
    pub freeze: bool,
}

impl Default for InputEmbedderConfig {
    fn default() -> Self {
        Self {
            tf_dim: 22,
            msa_dim: 49,
            relpos_k: 32,
            freeze: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecyclingEmbedderConfig {
    pub min_bin: f64,
    pub max_bin: f64,
    pub no_bins: usize,
    pub inf: f64,
    pub freeze: bool,
}

impl Default for RecyclingEmbedderConfig {
    fn default() -> Self {
        Self {
            min_bin: 3.25,
            max_bin: 20.75,
            no_bins: 15,
            inf: 1e8,
            freeze: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DistogramConfig {
    pub min_bin: f64,
    pub max_bin: f64,
    pub no_bins: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplatePairStackConfig {
    /// Configured as 16 although the published architecture lists 64.
    pub c_hidden_tri_att: usize,
    pub c_hidden_tri_mul: usize,
    pub no_blocks: usize,
    pub no_heads: usize,
    pub pair_transition_n: usize,
    pub dropout_rate: f64,
    pub inf: f64,
}

impl Default for TemplatePairStackConfig {
    fn default() -> Self {
        Self {
            c_hidden_tri_att: 16,
            c_hidden_tri_mul: 64,
            no_blocks: 2,
            no_heads: 4,
            pair_transition_n: 2,
            dropout_rate: 0.25,
            inf: 1e9,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplatePointwiseAttentionConfig {
    /// Configured as 16 although the published architecture lists 64.
    pub c_hidden: usize,
    pub no_heads: usize,
    pub inf: f64,
}

impl Default for TemplatePointwiseAttentionConfig {
    fn default() -> Self {
        Self {
            c_hidden: 16,
            no_heads: 4,
            inf: 1e5,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    pub distogram: DistogramConfig,
    /// Width of the angle feature; 57 although the published architecture lists 51.
    pub angle_c_in: usize,
    pub pair_c_in: usize,
    pub pair_stack: TemplatePairStackConfig,
    pub pointwise_attention: TemplatePointwiseAttentionConfig,
    pub inf: f64,
    pub eps: f64,
    pub enabled: bool,
    pub embed_angles: bool,
    pub use_unit_vector: bool,
    pub average_templates: bool,
    pub offload_templates: bool,
    pub freeze: bool,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            distogram: DistogramConfig {
                min_bin: 3.25,
                max_bin: 50.75,
                no_bins: 39,
            },
            angle_c_in: 57,
            pair_c_in: 88,
            pair_stack: TemplatePairStackConfig::default(),
            pointwise_attention: TemplatePointwiseAttentionConfig::default(),
            inf: 1e5,
            eps: 1e-8,
            enabled: true,
            embed_angles: true,
            use_unit_vector: false,
            average_templates: false,
            offload_templates: false,
            freeze: false,
        }
    }
}

/// Hyperparameters shared by the evoformer and the extra-MSA stack.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvoformerStackConfig {
    pub c_hidden_msa_att: usize,
    pub c_hidden_opm: usize,
    pub c_hidden_mul: usize,
    pub c_hidden_pair_att: usize,
    pub no_heads_msa: usize,
    pub no_heads_pair: usize,
    pub no_blocks: usize,
    pub transition_n: usize,
    pub msa_dropout: f64,
    pub pair_dropout: f64,
    pub inf: f64,
    pub eps: f64,
    pub freeze: bool,
}

impl Default for EvoformerStackConfig {
    fn default() -> Self {
        Self {
            c_hidden_msa_att: 32,
            c_hidden_opm: 32,
            c_hidden_mul: 128,
            c_hidden_pair_att: 32,
            no_heads_msa: 8,
            no_heads_pair: 4,
            no_blocks: 48,
            transition_n: 4,
            msa_dropout: 0.15,
            pair_dropout: 0.25,
            inf: 1e9,
            eps: 1e-8,
            freeze: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtraMsaConfig {
    pub c_in: usize,
    pub stack: EvoformerStackConfig,
    pub enabled: bool,
    pub freeze: bool,
}

impl Default for ExtraMsaConfig {
    fn default() -> Self {
        Self {
            c_in: 25,
            stack: EvoformerStackConfig {
                c_hidden_msa_att: 8,
                no_blocks: 4,
                ..EvoformerStackConfig::default()
            },
            enabled: true,
            freeze: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CryoformerEmbedderConfig {
    /// Channels after the first patch block (grid / 2).
    pub patch_c1: usize,
    /// Channels after the second patch block (grid / 4).
    pub patch_c2: usize,
    pub freeze: bool,
}

impl Default for CryoformerEmbedderConfig {
    fn default() -> Self {
        Self {
            patch_c1: 512,
            patch_c2: 2048,
            freeze: false,
        }
    }
}

/// Encoder or decoder of the density transformer; the model width is `globals.c_s`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CryoformerLayersConfig {
    pub no_heads: usize,
    pub no_blocks: usize,
    pub dim_feedforward: usize,
    pub dropout: f64,
    pub activation: Activation,
    pub return_intermediate: bool,
    pub freeze: bool,
}

impl Default for CryoformerLayersConfig {
    fn default() -> Self {
        Self {
            no_heads: 8,
            no_blocks: 8,
            dim_feedforward: 2048,
            dropout: 0.1,
            activation: Activation::Relu,
            return_intermediate: true,
            freeze: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CryoemConfig {
    pub embedder: CryoformerEmbedderConfig,
    pub encoder: CryoformerLayersConfig,
    pub decoder: CryoformerLayersConfig,
    pub enabled: bool,
    pub freeze: bool,
}

impl Default for CryoemConfig {
    fn default() -> Self {
        Self {
            embedder: CryoformerEmbedderConfig::default(),
            encoder: CryoformerLayersConfig {
                return_intermediate: false,
                ..CryoformerLayersConfig::default()
            },
            decoder: CryoformerLayersConfig::default(),
            enabled: true,
            freeze: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StructureModuleConfig {
    pub c_ipa: usize,
    pub c_resnet: usize,
    pub no_heads_ipa: usize,
    pub no_qk_points: usize,
    pub no_v_points: usize,
    pub dropout_rate: f64,
    pub no_blocks: usize,
    pub no_transition_layers: usize,
    pub no_resnet_blocks: usize,
    pub no_angles: usize,
    pub use_cryoem_backbone: bool,
    pub use_backbone_update: bool,
    pub trans_scale_factor: f64,
    pub epsilon: f64,
    pub inf: f64,
    pub enabled: bool,
    pub freeze: bool,
}

impl Default for StructureModuleConfig {
    fn default() -> Self {
        Self {
            c_ipa: 16,
            c_resnet: 128,
            no_heads_ipa: 12,
            no_qk_points: 4,
            no_v_points: 8,
            dropout_rate: 0.1,
            no_blocks: 8,
            no_transition_layers: 1,
            no_resnet_blocks: 2,
            no_angles: 7,
            use_cryoem_backbone: true,
            use_backbone_update: true,
            trans_scale_factor: 1.0,
            epsilon: 1e-8,
            inf: 1e5,
            enabled: true,
            freeze: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackboneFrameConfig {
    pub c_out_q: usize,
    pub c_out_t: usize,
    pub enabled: bool,
    pub freeze: bool,
}

impl Default for BackboneFrameConfig {
    fn default() -> Self {
        Self {
            c_out_q: 4,
            c_out_t: 3,
            enabled: true,
            freeze: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LddtHeadConfig {
    pub no_bins: usize,
    pub c_hidden: usize,
    pub enabled: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BinsHeadConfig {
    pub no_bins: usize,
    pub enabled: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClassHeadConfig {
    pub c_out: usize,
    pub enabled: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegmentationHeadConfig {
    pub hidden_dim: usize,
    pub dropout: f64,
    /// Number of voxel classes; the last one marks background and is ignored by the loss.
    pub c_out: usize,
    pub enabled: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HungarianMatcherConfig {
    pub cost_aa: f64,
    pub cost_ss: f64,
    pub cost_ca: f64,
    pub enabled: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadsConfig {
    pub lddt: LddtHeadConfig,
    pub distogram: BinsHeadConfig,
    pub tm: BinsHeadConfig,
    pub masked_msa: ClassHeadConfig,
    pub amino_acid: ClassHeadConfig,
    pub secondary_structure: ClassHeadConfig,
    pub cryoem_segmentation: SegmentationHeadConfig,
    pub hungarian_matcher: HungarianMatcherConfig,
    pub experimentally_resolved: ClassHeadConfig,
}

impl Default for HeadsConfig {
    fn default() -> Self {
        Self {
            lddt: LddtHeadConfig {
                no_bins: 50,
                c_hidden: 128,
                enabled: true,
            },
            distogram: BinsHeadConfig {
                no_bins: 64,
                enabled: true,
            },
            tm: BinsHeadConfig {
                no_bins: 64,
                enabled: false,
            },
            masked_msa: ClassHeadConfig {
                c_out: 23,
                enabled: true,
            },
            amino_acid: ClassHeadConfig {
                c_out: 21,
                enabled: true,
            },
            secondary_structure: ClassHeadConfig {
                c_out: 4,
                enabled: true,
            },
            cryoem_segmentation: SegmentationHeadConfig {
                hidden_dim: 64,
                dropout: 0.1,
                c_out: 24,
                enabled: true,
            },
            hungarian_matcher: HungarianMatcherConfig {
                cost_aa: 1.0,
                cost_ss: 1.0,
                cost_ca: 5.0,
                enabled: true,
            },
            experimentally_resolved: ClassHeadConfig {
                c_out: 37,
                enabled: true,
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub input_embedder: InputEmbedderConfig,
    pub recycling_embedder: RecyclingEmbedderConfig,
    pub template: TemplateConfig,
    pub extra_msa: ExtraMsaConfig,
    pub evoformer_stack: EvoformerStackConfig,
    pub cryoem: CryoemConfig,
    pub structure_module: StructureModuleConfig,
    pub backbone_frame: BackboneFrameConfig,
    pub heads: HeadsConfig,
    pub freeze: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            input_embedder: InputEmbedderConfig::default(),
            recycling_embedder: RecyclingEmbedderConfig::default(),
            template: TemplateConfig::default(),
            extra_msa: ExtraMsaConfig::default(),
            evoformer_stack: EvoformerStackConfig::default(),
            cryoem: CryoemConfig::default(),
            structure_module: StructureModuleConfig::default(),
            backbone_frame: BackboneFrameConfig::default(),
            heads: HeadsConfig::default(),
            freeze: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeightedLoss {
    pub weight: f64,
    pub eps: f64,
}

impl WeightedLoss {
    const fn new(weight: f64) -> Self {
        Self { weight, eps: 1e-8 }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DistogramLossConfig {
    pub min_bin: f64,
    pub max_bin: f64,
    pub no_bins: usize,
    pub eps: f64,
    pub weight: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FapeLossConfig {
    pub clamp_distance: f64,
    pub loss_unit_distance: f64,
    pub eps: f64,
    pub weight: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlddtLossConfig {
    pub min_resolution: f64,
    pub max_resolution: f64,
    pub cutoff: f64,
    pub no_bins: usize,
    pub eps: f64,
    pub weight: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SupervisedChiLossConfig {
    pub chi_weight: f64,
    pub angle_norm_weight: f64,
    pub eps: f64,
    pub weight: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResolutionGatedLossConfig {
    pub min_resolution: f64,
    pub max_resolution: f64,
    pub eps: f64,
    pub weight: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TmLossConfig {
    pub max_bin: usize,
    pub no_bins: usize,
    pub min_resolution: f64,
    pub max_resolution: f64,
    pub eps: f64,
    pub weight: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    pub distogram: DistogramLossConfig,
    pub masked_msa: WeightedLoss,
    pub plddt: PlddtLossConfig,
    pub experimentally_resolved: ResolutionGatedLossConfig,
    pub fape: FapeLossConfig,
    pub supervised_chi: SupervisedChiLossConfig,
    pub tm: TmLossConfig,
    pub amino_acid: WeightedLoss,
    pub secondary_structure: WeightedLoss,
    pub backbone_frame: WeightedLoss,
    pub normed_ca_init: WeightedLoss,
    pub normed_ca_final: WeightedLoss,
    pub cryoem_segmentation: WeightedLoss,
    pub eps: f64,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            distogram: DistogramLossConfig {
                min_bin: 2.3125,
                max_bin: 21.6875,
                no_bins: 64,
                eps: 1e-8,
                weight: 0.3,
            },
            masked_msa: WeightedLoss::new(10.0),
            plddt: PlddtLossConfig {
                min_resolution: 0.1,
                max_resolution: 3.0,
                cutoff: 15.0,
                no_bins: 50,
                eps: 1e-8,
                weight: 0.01,
            },
            experimentally_resolved: ResolutionGatedLossConfig {
                min_resolution: 0.1,
                max_resolution: 3.0,
                eps: 1e-8,
                weight: 0.01,
            },
            fape: FapeLossConfig {
                clamp_distance: 10.0,
                loss_unit_distance: 10.0,
                eps: 1e-4,
                weight: 0.5,
            },
            supervised_chi: SupervisedChiLossConfig {
                chi_weight: 0.5,
                angle_norm_weight: 0.01,
                eps: 1e-8,
                weight: 1.0,
            },
            tm: TmLossConfig {
                max_bin: 31,
                no_bins: 64,
                min_resolution: 0.1,
                max_resolution: 3.0,
                eps: 1e-8,
                weight: 0.0,
            },
            amino_acid: WeightedLoss::new(10.0),
            secondary_structure: WeightedLoss::new(10.0),
            backbone_frame: WeightedLoss::new(0.1),
            normed_ca_init: WeightedLoss::new(50.0),
            normed_ca_final: WeightedLoss::new(50.0),
            cryoem_segmentation: WeightedLoss::new(5.0),
            eps: 1e-8,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CryoFoldConfig {
    pub globals: GlobalsConfig,
    pub model: ModelConfig,
    pub loss: LossConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::EnumString, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Preset {
    CryofoldV1,
    Tiny,
}

impl CryoFoldConfig {
    pub fn cryofold_v1() -> Self {
        Self::default()
    }

    pub fn preset(preset: Preset) -> Self {
        match preset {
            Preset::CryofoldV1 => Self::cryofold_v1(),
            Preset::Tiny => Self::tiny(),
        }
    }

    /// Small widths and depths with every optional stage enabled.
    pub fn tiny() -> Self {
        let mut c = Self::default();
        c.globals = GlobalsConfig {
            c_z: 8,
            c_m: 8,
            c_t: 4,
            c_e: 4,
            c_s: 12,
            chunk_size: None,
            max_recycling_iters: 1,
            fuse_single: true,
            use_chain: true,
            ..GlobalsConfig::default()
        };
        let m = &mut c.model;
        m.template.pair_stack = TemplatePairStackConfig {
            c_hidden_tri_att: 4,
            c_hidden_tri_mul: 4,
            no_blocks: 1,
            no_heads: 2,
            ..TemplatePairStackConfig::default()
        };
        m.template.pointwise_attention = TemplatePointwiseAttentionConfig {
            c_hidden: 4,
            no_heads: 2,
            ..TemplatePointwiseAttentionConfig::default()
        };
        let small_stack = EvoformerStackConfig {
            c_hidden_msa_att: 4,
            c_hidden_opm: 4,
            c_hidden_mul: 4,
            c_hidden_pair_att: 4,
            no_heads_msa: 2,
            no_heads_pair: 2,
            no_blocks: 2,
            transition_n: 2,
            ..EvoformerStackConfig::default()
        };
        m.extra_msa.stack = EvoformerStackConfig {
            no_blocks: 1,
            ..small_stack.clone()
        };
        m.evoformer_stack = small_stack;
        m.cryoem.embedder = CryoformerEmbedderConfig {
            patch_c1: 8,
            patch_c2: 16,
            freeze: false,
        };
        let layers = CryoformerLayersConfig {
            no_heads: 2,
            no_blocks: 2,
            dim_feedforward: 16,
            ..CryoformerLayersConfig::default()
        };
        m.cryoem.encoder = CryoformerLayersConfig {
            return_intermediate: false,
            ..layers.clone()
        };
        m.cryoem.decoder = layers;
        m.structure_module = StructureModuleConfig {
            c_ipa: 4,
            c_resnet: 8,
            no_heads_ipa: 2,
            no_qk_points: 2,
            no_v_points: 2,
            no_blocks: 2,
            ..StructureModuleConfig::default()
        };
        m.heads.lddt.c_hidden = 8;
        m.heads.tm.enabled = true;
        m.heads.cryoem_segmentation.hidden_dim = 8;
        c
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = std::fs::read_to_string(path)?;
        Self::from_json_str(&s)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_json_string()?)?;
        Ok(())
    }

    /// Rejects inconsistent configurations before anything is allocated.
    pub fn validate(&self) -> Result<()> {
        let g = &self.globals;
        let m = &self.model;
        exclusive(
            ("template.average_templates", m.template.average_templates),
            ("template.offload_templates", m.template.offload_templates),
        )?;
        exclusive(("globals.use_lma", g.use_lma), ("globals.use_flash", g.use_flash))?;
        if g.use_flash && !flash_attention_available() {
            return Err(CryoFoldError::config(
                "globals.use_flash requires a flash attention backend, none is available in this build",
            ));
        }
        if g.chunk_size == Some(0) {
            return Err(CryoFoldError::config("globals.chunk_size must be positive"));
        }
        if g.blocks_per_ckpt == Some(0) {
            return Err(CryoFoldError::config("globals.blocks_per_ckpt must be positive"));
        }
        if m.cryoem.enabled {
            if g.c_s % 3 != 0 || (g.c_s / 3) % 2 != 0 {
                return Err(CryoFoldError::config(format!(
                    "globals.c_s ({}) must be a multiple of 6 for the 3D positional encoding",
                    g.c_s
                )));
            }
            for (name, layers) in [("encoder", &m.cryoem.encoder), ("decoder", &m.cryoem.decoder)] {
                if layers.no_heads == 0 || g.c_s % layers.no_heads != 0 {
                    return Err(CryoFoldError::config(format!(
                        "cryoem.{name}.no_heads ({}) must divide globals.c_s ({})",
                        layers.no_heads, g.c_s
                    )));
                }
            }
        }
        if m.backbone_frame.enabled && !m.cryoem.enabled {
            return Err(CryoFoldError::config(
                "backbone_frame.enabled requires cryoem.enabled",
            ));
        }
        if m.backbone_frame.enabled && (m.backbone_frame.c_out_q != 4 || m.backbone_frame.c_out_t != 3) {
            return Err(CryoFoldError::config(
                "backbone_frame predicts a quaternion (c_out_q = 4) and a translation (c_out_t = 3)",
            ));
        }
        if m.structure_module.use_cryoem_backbone && !m.backbone_frame.enabled {
            return Err(CryoFoldError::config(
                "structure_module.use_cryoem_backbone requires backbone_frame.enabled",
            ));
        }
        if !m.structure_module.enabled && !m.backbone_frame.enabled {
            return Err(CryoFoldError::config(
                "structure_module.enabled = false requires backbone_frame.enabled for atom positions",
            ));
        }
        if m.structure_module.no_angles != 7 {
            return Err(CryoFoldError::config("structure_module.no_angles must be 7"));
        }
        if m.heads.lddt.enabled && !m.structure_module.enabled {
            return Err(CryoFoldError::config("heads.lddt requires structure_module.enabled"));
        }
        let h = &m.heads;
        if h.hungarian_matcher.enabled {
            if !(h.amino_acid.enabled && h.secondary_structure.enabled && m.backbone_frame.enabled) {
                return Err(CryoFoldError::config(
                    "heads.hungarian_matcher requires heads.amino_acid, heads.secondary_structure and backbone_frame",
                ));
            }
            let costs = &h.hungarian_matcher;
            if costs.cost_aa == 0.0 && costs.cost_ss == 0.0 && costs.cost_ca == 0.0 {
                return Err(CryoFoldError::config("heads.hungarian_matcher costs cannot all be 0"));
            }
        }
        if (h.amino_acid.enabled || h.secondary_structure.enabled || h.cryoem_segmentation.enabled)
            && !m.cryoem.enabled
        {
            return Err(CryoFoldError::config(
                "amino_acid, secondary_structure and cryoem_segmentation heads require cryoem.enabled",
            ));
        }
        if g.use_chain && !g.use_single {
            return Err(CryoFoldError::config("globals.use_chain requires globals.use_single"));
        }
        Ok(())
    }

    /// Variable-name prefixes of every stage whose `freeze` flag is set.
    pub fn frozen_prefixes(&self) -> Vec<&'static str> {
        let m = &self.model;
        if m.freeze {
            return vec![""];
        }
        let mut out = Vec::new();
        if m.input_embedder.freeze {
            out.push("input_embedder");
        }
        if m.recycling_embedder.freeze {
            out.push("recycling_embedder");
        }
        if m.template.freeze {
            out.extend(["template_angle_embedder", "template_pair_embedder", "template_pair_stack", "template_pointwise_att"]);
        }
        if m.extra_msa.freeze {
            out.extend(["extra_msa_embedder", "extra_msa_stack"]);
        }
        if m.evoformer_stack.freeze {
            out.push("evoformer");
        }
        if m.cryoem.freeze || m.cryoem.embedder.freeze {
            out.push("cryoformer_emb");
        }
        if m.cryoem.freeze || m.cryoem.encoder.freeze {
            out.push("cryoformer_enc");
        }
        if m.cryoem.freeze || m.cryoem.decoder.freeze {
            out.push("cryoformer_dec");
        }
        if m.backbone_frame.freeze {
            out.push("backbone_frame");
        }
        if m.structure_module.freeze {
            out.push("structure_module");
        }
        out
    }
}

fn exclusive(a: (&str, bool), b: (&str, bool)) -> Result<()> {
    if a.1 && b.1 {
        return Err(CryoFoldError::config(format!(
            "Only one of {} and {} may be set at a time",
            a.0, b.0
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        assert!(CryoFoldConfig::cryofold_v1().validate().is_ok());
        assert!(CryoFoldConfig::tiny().validate().is_ok());
    }

    #[test]
    fn test_mutually_exclusive_templates() {
        let mut c = CryoFoldConfig::tiny();
        c.model.template.average_templates = true;
        c.model.template.offload_templates = true;
        let err = c.validate().unwrap_err().to_string();
        assert!(err.contains("template.average_templates"));
        assert!(err.contains("template.offload_templates"));
    }

    #[test]
    fn test_mutually_exclusive_attention() {
        let mut c = CryoFoldConfig::tiny();
        c.globals.use_lma = true;
        c.globals.use_flash = true;
        let err = c.validate().unwrap_err().to_string();
        assert!(err.contains("globals.use_lma"));
        assert!(err.contains("globals.use_flash"));
    }

    #[test]
    fn test_flash_requires_backend() {
        let mut c = CryoFoldConfig::tiny();
        c.globals.use_flash = true;
        assert!(matches!(c.validate(), Err(CryoFoldError::Config { .. })));
    }

    #[test]
    fn test_atom_positions_need_a_structure_source() {
        let mut c = CryoFoldConfig::tiny();
        c.model.structure_module.enabled = false;
        c.model.heads.lddt.enabled = false;
        assert!(c.validate().is_ok());
        c.model.heads.hungarian_matcher.enabled = false;
        c.model.structure_module.use_cryoem_backbone = false;
        c.model.backbone_frame.enabled = false;
        let err = c.validate().unwrap_err().to_string();
        assert!(err.contains("atom positions"), "{err}");
    }

    #[test]
    fn test_json_round_trip() -> Result<()> {
        let c = CryoFoldConfig::tiny();
        let back = CryoFoldConfig::from_json_str(&c.to_json_string()?)?;
        assert_eq!(c, back);
        // Missing sections fall back to the production preset.
        let partial = CryoFoldConfig::from_json_str(r#"{"globals": {"c_s": 48}}"#)?;
        assert_eq!(partial.globals.c_s, 48);
        assert_eq!(partial.model.evoformer_stack.no_blocks, 48);
        Ok(())
    }

    #[test]
    fn test_frozen_prefixes() {
        let mut c = CryoFoldConfig::tiny();
        assert!(c.frozen_prefixes().is_empty());
        c.model.evoformer_stack.freeze = true;
        c.model.template.freeze = true;
        let p = c.frozen_prefixes();
        assert!(p.contains(&"evoformer"));
        assert!(p.contains(&"template_pair_stack"));
    }

    #[test]
    fn test_preset_names() {
        assert_eq!("tiny".parse::<Preset>().ok(), Some(Preset::Tiny));
        assert_eq!("cryofold-v1".parse::<Preset>().ok(), Some(Preset::CryofoldV1));
    }
}
