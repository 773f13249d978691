use std::{fs, path::Path};

use layers::ResNetConfig;
use serde::{Deserialize, Serialize};

use crate::{
    error::{CouplingError, Result},
    mask::MaskType,
};

/// Data-only description of a coupling layer.
///
/// Networks are not serialisable, so a config loaded from disk always builds
/// the default residual network described by `network`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouplingConfig {
    pub in_channels: usize,
    pub mask_type: MaskType,
    #[serde(default)]
    pub inverse_mask: bool,
    #[serde(default)]
    pub network: ResNetConfig,
}

impl CouplingConfig {
    pub fn new(in_channels: usize, mask_type: MaskType) -> Self {
        Self {
            in_channels,
            mask_type,
            inverse_mask: false,
            network: ResNetConfig::default(),
        }
    }

    pub fn with_inverse_mask(mut self, inverse_mask: bool) -> Self {
        self.inverse_mask = inverse_mask;
        self
    }

    pub fn with_network(mut self, network: ResNetConfig) -> Self {
        self.network = network;
        self
    }

    /// Reads a TOML (`.toml` or no extension) or JSON (`.json`) file and validates it.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let file: ConfigFile = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(CouplingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };
        file.into_config()
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str::<ConfigFile>(contents)?.into_config()
    }

    pub fn from_json_str(contents: &str) -> Result<Self> {
        serde_json::from_str::<ConfigFile>(contents)?.into_config()
    }

    /// Checks every invariant and reports all violations at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if self.in_channels == 0 {
            errors.push("in_channels must be greater than zero".to_string());
        }
        errors.extend(
            self.network
                .problems()
                .into_iter()
                .map(|problem| format!("network.{problem}")),
        );
        if errors.is_empty() {
            Ok(())
        } else {
            Err(CouplingError::Configuration(errors.join("; ")))
        }
    }
}

/// On-disk layout. `mask_type` stays a string until validation so an unknown
/// name is reported as a configuration error rather than a parse error.
#[derive(Deserialize)]
struct ConfigFile {
    in_channels: usize,
    mask_type: String,
    #[serde(default)]
    inverse_mask: bool,
    #[serde(default)]
    network: ResNetConfig,
}

impl ConfigFile {
    fn into_config(self) -> Result<CouplingConfig> {
        let config = CouplingConfig {
            in_channels: self.in_channels,
            mask_type: self.mask_type.parse()?,
            inverse_mask: self.inverse_mask,
            network: self.network,
        };
        config.validate()?;
        Ok(config)
    }
}
