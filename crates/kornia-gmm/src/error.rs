/// Errors raised while configuring or evaluating a GMM registration component.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum GmmError {
    /// The metric selector does not name a known metric.
    #[error("Unknown type of metric: {0}")]
    UnknownMetricType(usize),

    /// The transform selector does not name a known transform.
    #[error("Unknown type of transform: {0}")]
    UnknownTransformType(usize),

    /// A required input (point set or transform) has not been set.
    #[error("Missing input: {0}")]
    MissingInput(&'static str),

    /// The point set has no points.
    #[error("Point set is empty")]
    EmptyPointSet,

    /// A parameter vector does not match the transform parameter count.
    #[error("Parameter size mismatch: expected {expected}, got {actual}")]
    ParameterSizeMismatch {
        /// Number of parameters of the transform.
        expected: usize,
        /// Number of parameters provided.
        actual: usize,
    },

    /// The requested entry point is not implemented by this metric.
    #[error("Not supported: {0}")]
    NotSupported(&'static str),

    /// The kernel bandwidth must be positive and finite.
    #[error("Invalid scale {0}, the scale must be positive and finite")]
    InvalidScale(f64),

    /// The KC search radius must be positive.
    #[error("Invalid radius {0}, the radius must be positive")]
    InvalidRadius(f64),

    /// The metric was evaluated before `initialize` was called.
    #[error("Metric has not been initialized")]
    NotInitialized,

    /// The random transform filter configuration is inconsistent.
    #[error("Invalid noise configuration: {0}")]
    InvalidNoiseConfig(String),
}
