use cryofold_model::CryoFoldConfig;
use std::path::PathBuf;

pub fn execute(config: PathBuf) -> anyhow::Result<()> {
    let cfg = CryoFoldConfig::load(&config)?;
    cfg.validate()?;
    tracing::info!(path = %config.display(), "configuration is valid");
    println!("{}", cfg.to_json_string()?);
    Ok(())
}
