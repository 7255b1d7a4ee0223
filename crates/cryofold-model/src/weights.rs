//! Parameter utilities over a [`VarMap`].
use candle_core::{Error, Result, Tensor, Var};
use candle_nn::VarMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Re-initialises every variable from `seed`, visiting them in name order.
///
/// Matrices get `U(-1/√fan_in, 1/√fan_in)`, biases are zeroed and other vectors (layer-norm
/// scales and offsets) are left as created. Two maps with the same layout and seed end up
/// identical.
pub fn reseed(varmap: &VarMap, seed: u64) -> Result<()> {
    let data = varmap
        .data()
        .lock()
        .map_err(|e| Error::Msg(format!("variable map poisoned: {e}")))?;
    let mut names: Vec<&String> = data.keys().collect();
    names.sort();
    let mut rng = StdRng::seed_from_u64(seed);
    for name in names {
        let var = &data[name];
        let dims = var.dims().to_vec();
        let device = var.device();
        if name.ends_with("bias") {
            var.set(&var.zeros_like()?)?;
        } else if dims.len() >= 2 {
            let fan_in = dims[dims.len() - 1].max(1) as f32;
            let bound = 1.0 / fan_in.sqrt();
            let n: usize = dims.iter().product();
            let values: Vec<f32> = (0..n).map(|_| rng.gen_range(-bound..bound)).collect();
            let t = Tensor::from_vec(values, dims.as_slice(), device)?.to_dtype(var.dtype())?;
            var.set(&t)?;
        }
    }
    tracing::debug!(seed, n_vars = data.len(), "reseeded parameters");
    Ok(())
}

/// Variables whose names do not start with any of `frozen_prefixes`, in name order.
pub fn trainable_vars(varmap: &VarMap, frozen_prefixes: &[&str]) -> Result<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|e| Error::Msg(format!("variable map poisoned: {e}")))?;
    let mut vars: Vec<(String, Var)> = data
        .iter()
        .filter(|(name, _)| !frozen_prefixes.iter().any(|p| name.starts_with(p)))
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{Init, VarBuilder};

    fn build(varmap: &VarMap) -> Result<()> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        vb.pp("evoformer").get_with_hints((4, 3), "weight", Init::Const(0.0))?;
        vb.pp("evoformer").get_with_hints(4, "bias", Init::Const(1.0))?;
        vb.pp("heads").get_with_hints((2, 4), "weight", Init::Const(0.0))?;
        vb.pp("heads").get_with_hints(2, "norm", Init::Const(1.0))?;
        Ok(())
    }

    #[test]
    fn test_reseed_is_deterministic() -> anyhow::Result<()> {
        let (a, b) = (VarMap::new(), VarMap::new());
        build(&a)?;
        build(&b)?;
        reseed(&a, 11)?;
        reseed(&b, 11)?;
        for ((na, va), (nb, vb)) in trainable_vars(&a, &[])?.iter().zip(trainable_vars(&b, &[])?.iter()) {
            assert_eq!(na, nb);
            let d = (va.as_tensor() - vb.as_tensor())?.abs()?.sum_all()?.to_scalar::<f32>()?;
            assert_eq!(d, 0.0);
        }
        let vars = trainable_vars(&a, &[])?;
        let sum_of = |name: &str| -> anyhow::Result<f32> {
            let (_, var) = vars
                .iter()
                .find(|(n, _)| n == name)
                .ok_or_else(|| anyhow::anyhow!("missing {name}"))?;
            Ok(var.as_tensor().sum_all()?.to_scalar::<f32>()?)
        };
        assert_eq!(sum_of("evoformer.bias")?, 0.0);
        assert_eq!(sum_of("heads.norm")?, 2.0);
        Ok(())
    }

    #[test]
    fn test_frozen_prefixes_are_excluded() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        build(&varmap)?;
        let names: Vec<String> = trainable_vars(&varmap, &["evoformer"])?
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(names, vec!["heads.norm".to_string(), "heads.weight".to_string()]);
        Ok(())
    }
}
