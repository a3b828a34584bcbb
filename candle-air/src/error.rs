use thiserror::Error;

/// Construction-time failures. All of these indicate a structural mismatch
/// between the configuration and the supplied modules; none are recoverable
/// once training has started, so they are raised before the first step runs.
#[derive(Error, Debug)]
pub enum AirError {
    /// Missing or invalid configuration field.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Batch-size or latent-dimension disagreement between tensors and the
    /// configured sizes.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Annealing kind outside the supported set.
    #[error("unsupported anneal schedule: {0}")]
    UnsupportedSchedule(String),
}

impl From<AirError> for candle_core::Error {
    fn from(err: AirError) -> Self {
        candle_core::Error::Msg(err.to_string())
    }
}

pub(crate) fn config_err<T>(msg: impl Into<String>) -> Result<T, AirError> {
    Err(AirError::Configuration(msg.into()))
}
