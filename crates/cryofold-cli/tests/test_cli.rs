use assert_cmd::Command;
use candle_core::Device;
use cryofold_model::CryoFoldConfig;
use cryofold_test_data::{temp_file, write_temp, SyntheticBatch};

#[test]
fn test_cli_predict_with_seeded_tiny_model() -> anyhow::Result<()> {
    let batch = SyntheticBatch {
        n_res: 8,
        grid: 16,
        ..SyntheticBatch::default()
    }
    .build(&Device::Cpu)?;
    let (features, _features_handle) = write_temp(&batch)?;
    let output = temp_file("safetensors")?;

    let mut cmd = Command::cargo_bin("cryofold")?;
    cmd.arg("predict")
        .arg("--features")
        .arg(&features)
        .arg("--preset")
        .arg("tiny")
        .arg("--seed")
        .arg("1")
        .arg("--cpu")
        .arg("--output")
        .arg(output.path());
    cmd.assert().success();

    let tensors = candle_core::safetensors::load(output.path(), &Device::Cpu)?;
    let positions = tensors
        .get("final_atom_positions")
        .ok_or_else(|| anyhow::anyhow!("final_atom_positions missing"))?;
    assert_eq!(positions.dims(), &[2, 1, 8, 37, 3]);
    assert!(tensors.keys().any(|k| k.starts_with("hungarian_matches.")));
    Ok(())
}

#[test]
fn test_cli_weights_and_seed_conflict() -> anyhow::Result<()> {
    let mut cmd = Command::cargo_bin("cryofold")?;
    cmd.args([
        "predict", "-f", "in.safetensors", "-w", "w.safetensors", "--seed", "3", "-o", "out.safetensors",
    ]);
    cmd.assert().failure();
    Ok(())
}

#[test]
fn test_cli_check_config() -> anyhow::Result<()> {
    let config = temp_file("json")?;
    CryoFoldConfig::tiny().save(config.path())?;

    let mut cmd = Command::cargo_bin("cryofold")?;
    cmd.arg("check-config").arg("--config").arg(config.path());
    let out = cmd.assert().success().get_output().stdout.clone();
    let printed = CryoFoldConfig::from_json_str(std::str::from_utf8(&out)?)?;
    assert_eq!(printed.globals.c_s, 12);
    Ok(())
}

#[test]
fn test_cli_check_config_rejects_conflicting_flags() -> anyhow::Result<()> {
    let mut cfg = CryoFoldConfig::tiny();
    cfg.model.template.average_templates = true;
    cfg.model.template.offload_templates = true;
    let config = temp_file("json")?;
    cfg.save(config.path())?;

    let mut cmd = Command::cargo_bin("cryofold")?;
    cmd.arg("check-config").arg("--config").arg(config.path());
    cmd.assert().failure();
    Ok(())
}
