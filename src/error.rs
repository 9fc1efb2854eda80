use crate::weights::ModelKind;
use std::path::PathBuf;

/// Errors raised while reading a checkpoint or populating the models.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("error opening {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot read checkpoint {path:?}")]
    Checkpoint {
        path: PathBuf,
        #[source]
        source: tch::TchError,
    },

    #[error("unsupported checkpoint format for {path:?}: {reason}")]
    UnsupportedFormat { path: PathBuf, reason: String },

    #[error("tensor {name:?} does not belong to any model")]
    UnknownTensor { name: String },

    #[error("invalid device {0:?}, expected cpu, cuda, cuda:N, mps or auto")]
    InvalidDevice(String),

    #[error("device {0:?} is not available")]
    UnavailableDevice(String),

    #[error("{model} parameters do not match the checkpoint, missing: {missing:?}, unexpected: {unexpected:?}")]
    ParameterMismatch { model: ModelKind, missing: Vec<String>, unexpected: Vec<String> },

    #[error("{model} parameter {name} has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch { model: ModelKind, name: String, expected: Vec<i64>, actual: Vec<i64> },

    #[error(transparent)]
    Tch(#[from] tch::TchError),
}

impl LoadError {
    /// Whether the checkpoint itself could not be read.
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            LoadError::Io { .. } | LoadError::Checkpoint { .. } | LoadError::UnsupportedFormat { .. }
        )
    }

    /// Whether the checkpoint was read but does not fit the declared parameters.
    pub fn is_mismatch(&self) -> bool {
        matches!(
            self,
            LoadError::ParameterMismatch { .. }
                | LoadError::ShapeMismatch { .. }
                | LoadError::UnknownTensor { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatch_message_names_the_model() {
        let err = LoadError::ParameterMismatch {
            model: ModelKind::Decoder,
            missing: vec!["conv_in.bias".to_string()],
            unexpected: vec![],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("decoder parameters"));
        assert!(msg.contains("conv_in.bias"));
        assert!(err.is_mismatch());
        assert!(!err.is_io());
    }

    #[test]
    fn checkpoint_error_keeps_the_cause_as_source() {
        let err = LoadError::Checkpoint {
            path: PathBuf::from("v1-5.safetensors"),
            source: tch::TchError::FileFormat("bad header".to_string()),
        };
        assert!(!err.to_string().contains("bad header"));
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert!(source.unwrap_or_default().contains("bad header"));
        assert!(err.is_io());
    }
}
