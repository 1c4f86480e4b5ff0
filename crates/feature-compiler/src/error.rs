use crate::feature::TransformKind;

/// Validation failures, reported before any code is emitted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("feature #{index}: name must not be empty")]
    EmptyName { index: usize },

    #[error("feature '{feature}': source column must not be empty")]
    EmptyColumn { feature: String },

    #[error("feature '{feature}': {transform} requires a secondary column")]
    MissingSecondaryColumn {
        feature: String,
        transform: TransformKind,
    },

    #[error("feature '{feature}': target_encode requires a target column")]
    MissingTargetColumn { feature: String },

    #[error("feature '{feature}': output name is already produced by an earlier feature")]
    DuplicateName { feature: String },

    #[error("feature '{feature}': invalid params: {reason}")]
    InvalidParams { feature: String, reason: String },

    #[error("feature '{feature}': unknown column '{column}'")]
    UnknownColumn { feature: String, column: String },
}

pub type Result<T> = std::result::Result<T, CompileError>;
