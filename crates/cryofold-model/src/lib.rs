//! cryofold-model
//!
//! Cryo-EM guided protein structure prediction on candle. [`CryoFold`] runs the evoformer
//! trunk, the density transformer and the structure module once per recycling iteration;
//! [`CryoFoldLoss`] scores its outputs against ground truth.
//!
//! ```ignore
//! let cfg = CryoFoldConfig::tiny();
//! let varmap = VarMap::new();
//! let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
//! let model = CryoFold::load(vb, &cfg)?;
//! let outputs = model.forward(&FeatureBatch::load("features.safetensors", &device)?)?;
//! ```
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::Device;

pub mod config;
pub mod cryoformer;
pub mod embedders;
pub mod error;
pub mod evoformer;
pub mod execution;
pub mod heads;
pub mod loss;
pub mod matcher;
pub mod model;
pub mod msa;
pub mod pair;
pub mod primitives;
pub mod structure_module;
pub mod template;
pub mod weights;

pub use config::{CryoFoldConfig, Preset};
pub use error::{CryoFoldError, Result};
pub use execution::ExecutionMode;
pub use loss::CryoFoldLoss;
pub use model::{CryoFold, ModelOutputs};

pub fn device(cpu: bool) -> candle_core::Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if cuda_is_available() {
        Device::new_cuda(0)
    } else if metal_is_available() {
        Device::new_metal(0)
    } else {
        tracing::info!("no accelerator available, running on CPU");
        Ok(Device::Cpu)
    }
}
