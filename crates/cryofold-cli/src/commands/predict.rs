use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use cryofold_core::FeatureBatch;
use cryofold_model::weights::reseed;
use cryofold_model::{CryoFold, CryoFoldConfig, Preset};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug)]
pub struct PredictArgs {
    pub features: PathBuf,
    pub weights: Option<PathBuf>,
    pub seed: Option<u64>,
    pub preset: Preset,
    pub config: Option<PathBuf>,
    pub output: PathBuf,
    pub cpu: bool,
}

pub fn execute(args: PredictArgs) -> anyhow::Result<()> {
    let cfg = match &args.config {
        Some(path) => CryoFoldConfig::load(path)?,
        None => CryoFoldConfig::preset(args.preset),
    };
    let device = cryofold_model::device(args.cpu)?;
    let batch = FeatureBatch::load(&args.features, &device)?;
    tracing::info!(
        n_res = batch.n_res()?,
        recycles = batch.num_recycles()?,
        "loaded features"
    );

    let varmap = VarMap::new();
    let model = match &args.weights {
        Some(weights) => {
            let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, &device)? };
            CryoFold::load(vb, &cfg)?
        }
        None => {
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
            let model = CryoFold::load(vb, &cfg)?;
            let seed = args.seed.unwrap_or(0);
            tracing::warn!(seed, "no weights given, using seeded random parameters");
            reseed(&varmap, seed)?;
            model
        }
    };

    let outputs = model.forward(&batch)?;
    let mut tensors = HashMap::new();
    if let Some(matches) = &outputs.hungarian_matches {
        for (depth, per_batch) in matches.iter().enumerate() {
            for (b, assignment) in per_batch.iter().enumerate().filter(|(_, a)| !a.is_empty()) {
                let idx: Vec<u32> = assignment
                    .pred
                    .iter()
                    .chain(assignment.gt.iter())
                    .map(|&i| i as u32)
                    .collect();
                let t = Tensor::from_vec(idx, (2, assignment.len()), &Device::Cpu)?;
                tensors.insert(format!("hungarian_matches.{depth}.{b}"), t);
            }
        }
    }
    for (name, t) in outputs.into_tensors() {
        tensors.insert(name, t.contiguous()?);
    }
    candle_core::safetensors::save(&tensors, &args.output)?;
    tracing::info!(tensors = tensors.len(), path = %args.output.display(), "wrote outputs");
    Ok(())
}
