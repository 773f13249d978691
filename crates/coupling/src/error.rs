use thiserror::Error;

pub type Result<T> = std::result::Result<T, CouplingError>;

#[derive(Error, Debug)]
pub enum CouplingError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("shape mismatch in {context}: expected {expected}, got {actual:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: String,
        actual: Vec<usize>,
    },

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    ConfigFormat(String),
}

impl CouplingError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub(crate) fn shape(context: &'static str, expected: impl Into<String>, actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            context,
            expected: expected.into(),
            actual: actual.to_vec(),
        }
    }
}

impl From<toml::de::Error> for CouplingError {
    fn from(value: toml::de::Error) -> Self {
        CouplingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for CouplingError {
    fn from(value: serde_json::Error) -> Self {
        CouplingError::ConfigFormat(value.to_string())
    }
}
