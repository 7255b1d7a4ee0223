use cryofold_core::FeatureError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryoFoldError {
    #[error("invalid configuration: {message}")]
    Config { message: String },
    /// A NaN appeared in the output of `stage`.
    #[error("numerical degeneracy: NaN in {stage} output")]
    NumericalDegeneracy { stage: String },
    #[error("missing feature `{0}`")]
    MissingFeature(String),
    #[error("missing model output `{0}`")]
    MissingOutput(String),
    #[error(transparent)]
    Feature(FeatureError),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl CryoFoldError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

impl From<FeatureError> for CryoFoldError {
    fn from(e: FeatureError) -> Self {
        match e {
            FeatureError::Missing(name) => Self::MissingFeature(name),
            FeatureError::Candle(e) => Self::Candle(e),
            other => Self::Feature(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, CryoFoldError>;
