use std::fs;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use coupling::{AffineCouplingLayer, CouplingConfig, CouplingError, Flow, MaskType};
use tempfile::tempdir;

#[test]
fn toml_file_builds_a_working_layer() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("coupling.toml");
    fs::write(
        &path,
        r#"
in_channels = 2
mask_type = "checkerboard"
inverse_mask = true

[network]
mid_channels = 8
num_blocks = 1
"#,
    )?;

    let config = CouplingConfig::from_path(&path)?;
    assert_eq!(config.mask_type, MaskType::Checkerboard);
    assert!(config.inverse_mask);

    let device = Device::Cpu;
    let varmap = VarMap::new();
    let layer =
        AffineCouplingLayer::from_config(&config, VarBuilder::from_varmap(&varmap, DType::F32, &device))?;
    assert_eq!(
        layer.to_string(),
        "in_channels=2, mask_type=checkerboard, inverse_mask=true"
    );

    let x = Tensor::randn(0f32, 0.5, (2, 2, 4, 4), &device)?;
    let out = layer.forward(&x, true)?;
    let diff = layer
        .inverse(&out.z)?
        .sub(&x)?
        .abs()?
        .flatten_all()?
        .max(0)?
        .to_vec0::<f32>()?;
    assert!(diff < 1e-5);
    Ok(())
}

#[test]
fn json_round_trip_preserves_config() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("coupling.json");
    let config = CouplingConfig::new(6, MaskType::ChannelWise).with_inverse_mask(true);
    fs::write(&path, serde_json::to_string_pretty(&config)?)?;

    let written = fs::read_to_string(&path)?;
    assert!(written.contains("\"channel_wise\""));

    let loaded = CouplingConfig::from_path(&path)?;
    assert_eq!(loaded, config);
    Ok(())
}

#[test]
fn unknown_extension_is_a_format_error() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("coupling.yaml");
    fs::write(&path, "in_channels: 2\n")?;
    assert!(matches!(
        CouplingConfig::from_path(&path),
        Err(CouplingError::ConfigFormat(_))
    ));
    Ok(())
}

#[test]
fn missing_file_is_an_io_error() -> Result<()> {
    let dir = tempdir()?;
    assert!(matches!(
        CouplingConfig::from_path(dir.path().join("absent.toml")),
        Err(CouplingError::Io(_))
    ));
    Ok(())
}

#[test]
fn invalid_values_are_rejected_after_parsing() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("coupling.toml");
    fs::write(
        &path,
        r#"
in_channels = 0
mask_type = "channel_wise"

[network]
kernel_size = 4
"#,
    )?;
    match CouplingConfig::from_path(&path) {
        Err(CouplingError::Configuration(message)) => {
            assert!(message.contains("in_channels"));
            assert!(message.contains("network.kernel_size"));
        }
        other => panic!("expected configuration error, got {other:?}"),
    }
    Ok(())
}

#[test]
fn unknown_mask_type_in_a_file_is_a_configuration_error() -> Result<()> {
    let dir = tempdir()?;
    let toml_path = dir.path().join("coupling.toml");
    fs::write(&toml_path, "in_channels = 2\nmask_type = \"invalid\"\n")?;
    let json_path = dir.path().join("coupling.json");
    fs::write(&json_path, r#"{"in_channels": 2, "mask_type": "invalid"}"#)?;

    for path in [toml_path, json_path] {
        assert!(
            matches!(
                CouplingConfig::from_path(&path),
                Err(CouplingError::Configuration(ref msg)) if msg.contains("mask_type")
            ),
            "{}",
            path.display()
        );
    }
    Ok(())
}
